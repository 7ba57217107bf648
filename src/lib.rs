//! Transparent SSH relay.
//!
//! Every inbound SSH connection gets exactly one session channel, which is
//! bridged byte for byte (and request for request) to a session on a fixed
//! backend host.

pub mod auth;
pub mod backend;
pub mod channel;
pub mod cli;
pub mod config;
pub mod crypto;
pub mod error;
pub mod keys;
pub mod relay;
pub mod server;

pub use config::BastionConfig;
pub use error::{BastionError, BastionResult};
pub use server::Bastion;
