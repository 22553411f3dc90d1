//! Semantic checks on a loaded configuration.

use {secrecy::ExposeSecret, std::path::PathBuf};

use crate::schema::ParrotConfig;

/// Severity level for a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warning => write!(f, "warning"),
            Self::Info => write!(f, "info"),
        }
    }
}

/// A single validation diagnostic.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Dotted path, e.g. "sender.jitter_min_ms"
    pub path: String,
    pub message: String,
}

/// Result of validating a configuration.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub diagnostics: Vec<Diagnostic>,
    pub config_path: Option<PathBuf>,
}

impl ValidationResult {
    /// Returns `true` if any diagnostic is an error.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error)
    }

    /// Count diagnostics by severity.
    #[must_use]
    pub fn count(&self, severity: Severity) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == severity)
            .count()
    }

    fn push(&mut self, severity: Severity, path: &str, message: impl Into<String>) {
        self.diagnostics.push(Diagnostic {
            severity,
            path: path.to_string(),
            message: message.into(),
        });
    }
}

/// Validate a configuration that has already been parsed.
pub fn validate(config: &ParrotConfig, config_path: Option<PathBuf>) -> ValidationResult {
    let mut result = ValidationResult {
        diagnostics: Vec::new(),
        config_path,
    };

    let token = config.telegram.token.expose_secret();
    if token.trim().is_empty() {
        result.push(
            Severity::Error,
            "telegram.token",
            "control bot token is empty (set it in the config file or PARROT_TELEGRAM_TOKEN)",
        );
    } else if token.contains("${") {
        result.push(
            Severity::Error,
            "telegram.token",
            "control bot token contains an unresolved ${...} placeholder",
        );
    }

    if config.telegram.whitelist.is_empty() {
        result.push(
            Severity::Warning,
            "telegram.whitelist",
            "whitelist is empty; nobody will be able to operate the bot",
        );
    }

    let sender = &config.sender;
    if sender.jitter_min_ms > sender.jitter_max_ms {
        result.push(
            Severity::Error,
            "sender.jitter_min_ms",
            format!(
                "jitter_min_ms ({}) is greater than jitter_max_ms ({})",
                sender.jitter_min_ms, sender.jitter_max_ms
            ),
        );
    }
    if sender.rate_limit_ceiling_secs == 0 {
        result.push(
            Severity::Warning,
            "sender.rate_limit_ceiling_secs",
            "a zero ceiling ignores flood-wait pauses and will trip the platform's limits again",
        );
    }

    if config.templates.path.as_os_str().is_empty() {
        result.push(
            Severity::Error,
            "templates.path",
            "template file path is empty",
        );
    } else if !config.templates.path.exists() {
        result.push(
            Severity::Info,
            "templates.path",
            format!(
                "{} does not exist yet; no replies will be sent until it does",
                config.templates.path.display()
            ),
        );
    }

    result
}
