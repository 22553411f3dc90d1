use thiserror::Error;

use crate::{platform::PlatformError, types::AccountKey};

#[derive(Debug, Error)]
pub enum Error {
    /// The platform reported the login code as expired; the handshake has
    /// been discarded.
    #[error("login code expired, start again with /auth")]
    ExpiredChallenge,

    #[error("no handshake in progress")]
    NoHandshake,

    #[error("a handshake is already in progress for this owner")]
    HandshakeInProgress,

    #[error("unknown account: {key}")]
    UnknownAccount { key: AccountKey },

    #[error("no account selected; create one with /auth or pick one with /setsession")]
    NoDefaultAccount,

    #[error("reply count must be between 1 and 3, got {requested}")]
    InvalidReplyCount { requested: i64 },

    #[error("reply delay of {requested}s is too large to store")]
    InvalidReplyDelay { requested: u64 },

    #[error("no target chat configured for {key}")]
    NoTargetChat { key: AccountKey },

    #[error("not a valid account id: {raw}")]
    InvalidAccountId { raw: String },

    #[error("session {key} is closed")]
    SessionClosed { key: AccountKey },

    /// Writing or deleting a persisted record failed. Always surfaced to the
    /// caller: the operator's change may be lost otherwise.
    #[error("{context}: {source}")]
    Persistence {
        context: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error(transparent)]
    Platform(#[from] PlatformError),
}

impl Error {
    #[must_use]
    pub fn invalid_account_id(raw: impl Into<String>) -> Self {
        Self::InvalidAccountId { raw: raw.into() }
    }

    #[must_use]
    pub fn unknown_account(key: AccountKey) -> Self {
        Self::UnknownAccount { key }
    }

    #[must_use]
    pub fn persistence(
        context: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Persistence {
            context: context.into(),
            source: Box::new(source),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
