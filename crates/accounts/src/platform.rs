//! Boundary between the core and the messaging platform.
//!
//! Concrete backends (MTProto, test fakes) classify every failure into a
//! [`PlatformError`] variant so callers never inspect error strings.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;

use crate::types::{AccountIdentity, ApiCredentials, SessionToken};

/// A new message seen by an account's live connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEvent {
    pub message_id: i32,
    /// Marked chat id (`-100…` for channels and supergroups).
    pub chat_id: i64,
    pub sender_id: Option<i64>,
    /// Sent by the account itself (an echo of our own message).
    pub outgoing: bool,
    pub text: String,
}

#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    /// The platform requires a pause before the next request.
    #[error("rate limited, retry after {}s", wait.as_secs())]
    RateLimited { wait: Duration },

    /// The account may not post in the target chat.
    #[error("not permitted to send: {reason}")]
    SendForbidden { reason: String },

    #[error("login code is invalid")]
    CodeInvalid,

    #[error("login code has expired")]
    CodeExpired,

    #[error("two-factor password required")]
    PasswordRequired,

    #[error("two-factor password is invalid")]
    PasswordInvalid,

    /// The connection could not be established or was lost for good.
    #[error("connection failed: {message}")]
    Connection { message: String },

    /// The stored session token is no longer accepted.
    #[error("session is not authorized")]
    Unauthorized,

    #[error("{message}")]
    Other { message: String },
}

impl PlatformError {
    #[must_use]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other {
            message: message.into(),
        }
    }

    /// Errors after which an inbound listener cannot make progress.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Unauthorized)
    }
}

pub type PlatformResult<T> = Result<T, PlatformError>;

/// Result of submitting a login code.
#[derive(Debug)]
pub enum CodeOutcome {
    Authorized(SessionToken),
    /// The account has a cloud password; the handshake continues with it.
    PasswordRequired,
}

/// One authenticated connection.
#[async_trait]
pub trait PlatformClient: Send + Sync {
    /// Connect if not already connected. Idempotent.
    async fn connect(&self) -> PlatformResult<()>;

    fn is_connected(&self) -> bool;

    /// Wait for the next new-message event.
    async fn next_event(&self) -> PlatformResult<InboundEvent>;

    async fn send_message(&self, chat_id: i64, text: &str) -> PlatformResult<()>;

    async fn disconnect(&self) -> PlatformResult<()>;
}

/// An in-flight phone login on a transient connection.
#[async_trait]
pub trait LoginHandshake: Send {
    async fn submit_code(&mut self, code: &str) -> PlatformResult<CodeOutcome>;

    async fn submit_password(&mut self, password: &str) -> PlatformResult<SessionToken>;
}

/// Factory for clients and login handshakes.
#[async_trait]
pub trait PlatformConnector: Send + Sync {
    /// Build a (not yet connected) client from a persisted identity.
    fn client(&self, identity: &AccountIdentity) -> PlatformResult<Arc<dyn PlatformClient>>;

    /// Open a transient connection and ask the platform to send a login code.
    async fn request_code(
        &self,
        credentials: &ApiCredentials,
        phone: &str,
    ) -> PlatformResult<Box<dyn LoginHandshake>>;
}
