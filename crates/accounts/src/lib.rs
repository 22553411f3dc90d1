//! Multi-account autoresponder core: account sessions, the login handshake,
//! the reply filter and the per-account reply worker.
//!
//! The messaging platform is reached only through the traits in
//! [`platform`]; concrete backends live in other crates.

pub mod error;
pub mod filter;
pub mod login;
pub mod platform;
pub mod registry;
pub mod sender;
pub mod service;
pub mod session;
pub mod store;
pub mod store_file;
pub mod store_memory;
pub mod templates;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

pub use {
    error::{Error, Result},
    service::AutoresponderService,
};
