//! Validated runtime configuration.
//!
//! Built once at startup from the command line and shared read-only by every
//! connection handler.

use std::path::PathBuf;

use russh::keys::PrivateKey;
use secrecy::{ExposeSecret, SecretBox};

use crate::error::{BastionError, BastionResult};

pub type SecretBoxedString = SecretBox<String>;

pub const DEFAULT_LISTEN: &str = ":2022";
pub const DEFAULT_KEY_PATH: &str = "./id_rsa";
pub const DEFAULT_REMOTE: &str = ":2023";
pub const DEFAULT_USER: &str = "testuser";
pub const DEFAULT_PASS: &str = "testpass";

/// Where to listen and which identity to present to clients.
pub struct ListenConfig {
    pub address: String,
    pub host_key_path: PathBuf,
    pub key_passphrase: Option<SecretBoxedString>,
}

impl ListenConfig {
    pub fn load_host_key(&self) -> BastionResult<PrivateKey> {
        let passphrase = self.key_passphrase.as_ref().map(|p| p.expose_secret().as_str());
        crate::keys::load_host_key(&self.host_key_path, passphrase)
    }
}

/// The single backend every session is relayed to.
pub struct BackendConfig {
    pub address: String,
    pub username: String,
    pub password: SecretBoxedString,
    /// `SHA256:...` fingerprint the backend host key must match, if pinned.
    pub host_key_fingerprint: Option<String>,
    pub legacy_crypto: bool,
}

/// How inbound clients are authenticated.
pub enum InboundAuth {
    AcceptAll,
    Password { username: String, password: SecretBoxedString },
}

pub struct BastionConfig {
    pub listen: ListenConfig,
    pub backend: BackendConfig,
    pub inbound_auth: InboundAuth,
}

/// Normalise a listen address; an empty host (`:2022`) binds every IPv4 interface.
pub fn listen_address(raw: &str) -> BastionResult<String> {
    normalize(raw, "0.0.0.0")
}

/// Normalise a dial address; an empty host (`:2023`) targets the local machine.
pub fn dial_address(raw: &str) -> BastionResult<String> {
    normalize(raw, "127.0.0.1")
}

fn normalize(raw: &str, default_host: &str) -> BastionResult<String> {
    let raw = raw.trim();
    let (host, port) = raw
        .rsplit_once(':')
        .ok_or_else(|| BastionError::invalid_address(raw, "expected host:port or :port"))?;
    port.parse::<u16>()
        .map_err(|_| BastionError::invalid_address(raw, "port must be a number between 0-65535"))?;

    if host.is_empty() {
        return Ok(format!("{default_host}:{port}"));
    }
    if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
        return Err(BastionError::invalid_address(raw, "IPv6 hosts must be bracketed"));
    }
    Ok(format!("{host}:{port}"))
}

/// Fingerprints are compared as printed by `ssh-keygen -l`.
pub fn validate_fingerprint(raw: &str) -> BastionResult<String> {
    let raw = raw.trim();
    match raw.strip_prefix("SHA256:") {
        Some(rest) if !rest.is_empty() => Ok(raw.to_string()),
        _ => Err(BastionError::InvalidConfig(format!(
            "backend fingerprint must look like SHA256:<base64>, got '{raw}'"
        ))),
    }
}
