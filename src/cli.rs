use std::env;
use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::{ArgAction, Parser};

use crate::config::{
    BackendConfig, BastionConfig, DEFAULT_KEY_PATH, DEFAULT_LISTEN, DEFAULT_PASS, DEFAULT_REMOTE, DEFAULT_USER, InboundAuth, ListenConfig, SecretBoxedString, dial_address, listen_address, validate_fingerprint
};

const PASSWORD_ENV: &str = "BASTION_PASS";

#[derive(Debug, Parser)]
#[command(
    name = "bastion",
    about = "Transparent SSH relay that bridges every inbound session to a fixed backend"
)]
pub struct RawArgs {
    /// Local listen address
    #[arg(long, value_name = "ADDR", default_value = DEFAULT_LISTEN)]
    listen: String,
    /// Path to the server host key
    #[arg(long = "key", value_name = "PATH", default_value = DEFAULT_KEY_PATH)]
    key: PathBuf,
    /// Passphrase for an encrypted host key
    #[arg(long, value_name = "PASSPHRASE")]
    key_passphrase: Option<String>,
    /// Backend server address
    #[arg(long, value_name = "ADDR", default_value = DEFAULT_REMOTE)]
    remote: String,
    /// Backend username
    #[arg(long, value_name = "USER", default_value = DEFAULT_USER)]
    user: String,
    /// Backend password (falls back to $BASTION_PASS, then the built-in default)
    #[arg(long, value_name = "PASSWORD")]
    pass: Option<String>,
    /// Pin the backend host key to this SHA256 fingerprint
    #[arg(long, value_name = "FINGERPRINT")]
    remote_fingerprint: Option<String>,
    /// Offer SHA-1 kex and CBC ciphers to the backend
    #[arg(long, action = ArgAction::SetTrue)]
    legacy_crypto: bool,
    /// Require this username from inbound clients instead of accepting everyone
    #[arg(long, value_name = "USER", requires = "client_pass")]
    client_user: Option<String>,
    /// Password paired with --client-user
    #[arg(long, value_name = "PASSWORD", requires = "client_user")]
    client_pass: Option<String>,
}

impl BastionConfig {
    pub fn parse() -> Result<Self> {
        let args = RawArgs::parse();
        Self::try_from(args)
    }
}

impl TryFrom<RawArgs> for BastionConfig {
    type Error = anyhow::Error;

    fn try_from(args: RawArgs) -> Result<Self> {
        let listen = ListenConfig {
            address: listen_address(&args.listen)?,
            host_key_path: args.key,
            key_passphrase: args.key_passphrase.map(secret),
        };

        let host_key_fingerprint = args.remote_fingerprint.as_deref().map(validate_fingerprint).transpose()?;
        if args.user.is_empty() {
            bail!("backend username must not be empty");
        }
        let backend = BackendConfig {
            address: dial_address(&args.remote)?,
            username: args.user,
            password: secret(resolve_password(args.pass)),
            host_key_fingerprint,
            legacy_crypto: args.legacy_crypto,
        };

        let inbound_auth = match (args.client_user, args.client_pass) {
            (Some(username), Some(password)) => InboundAuth::Password {
                username,
                password: secret(password),
            },
            _ => InboundAuth::AcceptAll,
        };

        Ok(BastionConfig {
            listen,
            backend,
            inbound_auth,
        })
    }
}

fn secret(value: String) -> SecretBoxedString {
    SecretBoxedString::new(Box::new(value))
}

fn resolve_password(provided: Option<String>) -> String {
    if let Some(value) = provided {
        return value;
    }
    if let Ok(value) = env::var(PASSWORD_ENV)
        && !value.is_empty()
    {
        return value;
    }
    DEFAULT_PASS.to_string()
}
