//! Telegram side of parrot.
//!
//! The control bot (teloxide, long polling) lets whitelisted operators log
//! accounts in and drive their autoresponders. With the `mtproto` feature the
//! crate also provides the [`PlatformConnector`](parrot_accounts::platform::PlatformConnector)
//! that connects the accounts themselves.

pub mod access;
pub mod bot;
pub mod commands;
pub mod error;
pub mod handlers;
#[cfg(feature = "mtproto")]
pub mod mtproto;
pub mod outbound;

pub use {
    bot::{ControlBot, connect, run_polling},
    error::{Error, Result},
    handlers::ControlContext,
};

#[cfg(feature = "mtproto")]
pub use mtproto::MtprotoConnector;
