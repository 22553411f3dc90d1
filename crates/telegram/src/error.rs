use thiserror::Error;

/// Failures of the control bot itself. Operator-facing command errors are
/// turned into replies and never reach this type.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Telegram(#[from] teloxide::RequestError),

    #[error("could not build the bot http client: {0}")]
    Client(#[from] reqwest::Error),

    /// Telegram hands updates to one poller per token.
    #[error("another instance is polling with the same bot token")]
    PollingConflict,
}

pub type Result<T> = std::result::Result<T, Error>;
