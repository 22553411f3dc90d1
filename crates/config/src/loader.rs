use std::{
    path::{Path, PathBuf},
    sync::RwLock,
};

use tracing::{debug, warn};

use crate::{env_subst::substitute_env, schema::ParrotConfig};

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &["parrot.toml", "parrot.yaml", "parrot.yml", "parrot.json"];

static CONFIG_DIR_OVERRIDE: RwLock<Option<PathBuf>> = RwLock::new(None);
static DATA_DIR_OVERRIDE: RwLock<Option<PathBuf>> = RwLock::new(None);

/// Override the user-global config directory (e.g. from `--config-dir`).
pub fn set_config_dir(dir: PathBuf) {
    *CONFIG_DIR_OVERRIDE
        .write()
        .unwrap_or_else(|e| e.into_inner()) = Some(dir);
}

/// Override the data directory (e.g. from `--data-dir`).
pub fn set_data_dir(dir: PathBuf) {
    *DATA_DIR_OVERRIDE.write().unwrap_or_else(|e| e.into_inner()) = Some(dir);
}

/// Returns the user-global config directory (`~/.config/parrot/`).
pub fn config_dir() -> Option<PathBuf> {
    if let Some(dir) = CONFIG_DIR_OVERRIDE
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .clone()
    {
        return Some(dir);
    }
    directories::ProjectDirs::from("", "", "parrot").map(|d| d.config_dir().to_path_buf())
}

/// Returns the data directory (`~/.local/share/parrot/` on Linux), falling
/// back to `./data` when no home directory can be determined.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = DATA_DIR_OVERRIDE
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .clone()
    {
        return dir;
    }
    directories::ProjectDirs::from("", "", "parrot")
        .map(|d| d.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("data"))
}

/// Directory holding per-account records, honouring `storage.sessions_dir`.
pub fn sessions_dir(config: &ParrotConfig) -> PathBuf {
    config
        .storage
        .sessions_dir
        .clone()
        .unwrap_or_else(|| data_dir().join("sessions"))
}

/// Load config from the given path (any supported format).
pub fn load_config(path: &Path) -> anyhow::Result<ParrotConfig> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    let raw = substitute_env(&raw);
    parse_config(&raw, path)
}

/// Discover and load config from standard locations, then apply
/// `PARROT_*` environment overrides.
///
/// Search order:
/// 1. `./parrot.{toml,yaml,yml,json}` (project-local)
/// 2. `~/.config/parrot/parrot.{toml,yaml,yml,json}` (user-global)
///
/// Falls back to `ParrotConfig::default()` if no file is found or it fails
/// to parse.
pub fn discover_and_load() -> ParrotConfig {
    let mut config = match find_config_file() {
        Some(path) => {
            debug!(path = %path.display(), "loading config");
            load_config(&path).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
                ParrotConfig::default()
            })
        },
        None => {
            debug!("no config file found, using defaults");
            ParrotConfig::default()
        },
    };
    apply_env_overrides(&mut config, |name| std::env::var(name).ok());
    config
}

/// Find the first config file in standard locations.
pub fn find_config_file() -> Option<PathBuf> {
    for name in CONFIG_FILENAMES {
        let p = PathBuf::from(name);
        if p.exists() {
            return Some(p);
        }
    }

    let dir = config_dir()?;
    CONFIG_FILENAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|p| p.exists())
}

/// Apply `PARROT_*` overrides on top of file values.
///
/// `PARROT_WHITELIST` is a comma-separated list of numeric user IDs; entries
/// that do not parse are skipped with a warning.
pub fn apply_env_overrides(config: &mut ParrotConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(token) = lookup("PARROT_TELEGRAM_TOKEN").filter(|t| !t.trim().is_empty()) {
        config.telegram.token = secrecy::Secret::new(token.trim().to_string());
    }
    if let Some(list) = lookup("PARROT_WHITELIST") {
        config.telegram.whitelist = list
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .filter_map(|s| match s.parse::<i64>() {
                Ok(id) => Some(id),
                Err(e) => {
                    warn!(entry = s, error = %e, "ignoring malformed PARROT_WHITELIST entry");
                    None
                },
            })
            .collect();
    }
    if let Some(dir) = lookup("PARROT_SESSIONS_DIR").filter(|d| !d.is_empty()) {
        config.storage.sessions_dir = Some(PathBuf::from(dir));
    }
    if let Some(path) = lookup("PARROT_TEMPLATES").filter(|p| !p.is_empty()) {
        config.templates.path = PathBuf::from(path);
    }
}

fn parse_config(raw: &str, path: &Path) -> anyhow::Result<ParrotConfig> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match ext {
        "toml" => Ok(toml::from_str(raw)?),
        "yaml" | "yml" => Ok(serde_yaml::from_str(raw)?),
        "json" => Ok(serde_json::from_str(raw)?),
        _ => anyhow::bail!("unsupported config format: .{ext}"),
    }
}
