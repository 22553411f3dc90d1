/// Config schema types (control bot, storage, templates, sender tuning).
use std::path::PathBuf;

use {
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize},
};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ParrotConfig {
    pub telegram: ControlBotConfig,
    pub storage: StorageConfig,
    pub templates: TemplatesConfig,
    pub sender: SenderConfig,
    pub supervisor: SupervisorConfig,
}

/// The operator-facing control bot.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlBotConfig {
    /// Bot token from @BotFather.
    #[serde(serialize_with = "serialize_secret")]
    pub token: Secret<String>,

    /// Telegram user IDs allowed to operate the bot. Everyone else is
    /// ignored without a reply.
    pub whitelist: Vec<i64>,
}

impl std::fmt::Debug for ControlBotConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlBotConfig")
            .field("token", &"[REDACTED]")
            .field("whitelist", &self.whitelist)
            .finish()
    }
}

impl Default for ControlBotConfig {
    fn default() -> Self {
        Self {
            token: Secret::new(String::new()),
            whitelist: Vec::new(),
        }
    }
}

fn serialize_secret<S: serde::Serializer>(
    secret: &Secret<String>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(secret.expose_secret())
}

/// Where per-account records live.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding one `<owner>_<account>.json` file per account.
    /// Defaults to `<data_dir>/sessions`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sessions_dir: Option<PathBuf>,
}

/// Reply template source.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplatesConfig {
    /// Line-delimited text file, re-read on every matching message.
    pub path: PathBuf,
}

impl Default for TemplatesConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("templates.txt"),
        }
    }
}

/// Outbound reply pacing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SenderConfig {
    /// Lower bound of the pause between two copies of the same reply.
    pub jitter_min_ms: u64,
    /// Upper bound of the pause between two copies of the same reply.
    pub jitter_max_ms: u64,
    /// Longest pause honoured for a single flood-wait signal.
    pub rate_limit_ceiling_secs: u64,
    /// How many flood-wait pauses a single copy may sit through before it is
    /// dropped.
    pub max_rate_limit_retries: u32,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            jitter_min_ms: 700,
            jitter_max_ms: 1200,
            rate_limit_ceiling_secs: 900,
            max_rate_limit_retries: 5,
        }
    }
}

/// Restart policy for the control bot loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub restart_backoff_secs: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            restart_backoff_secs: 5,
        }
    }
}
