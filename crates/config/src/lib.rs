//! Configuration loading, env substitution, overrides, and validation.
//!
//! Config files: `parrot.toml`, `parrot.yaml`, or `parrot.json`
//! Searched in `./` then `~/.config/parrot/`.
//!
//! Supports `${ENV_VAR}` substitution in the raw file text.

pub mod env_subst;
pub mod loader;
pub mod schema;
pub mod validate;

pub use {
    loader::{
        apply_env_overrides, config_dir, data_dir, discover_and_load, find_config_file,
        load_config, sessions_dir, set_config_dir, set_data_dir,
    },
    schema::{
        ControlBotConfig, ParrotConfig, SenderConfig, StorageConfig, SupervisorConfig,
        TemplatesConfig,
    },
    validate::{Diagnostic, Severity, ValidationResult, validate},
};
