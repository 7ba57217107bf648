//! Outbound leg: dial the backend, authenticate, open the session channel.

use std::sync::Arc;

use russh::keys::{HashAlg, PublicKey};
use russh::{Channel, Disconnect, client};
use secrecy::ExposeSecret;
use tracing::{debug, info, warn};

use crate::config::BackendConfig;
use crate::crypto::backend_preferred;
use crate::error::{BastionError, BastionResult};

/// Backend host key check, optionally pinned to a SHA256 fingerprint.
pub struct BackendHandler {
    address: String,
    expected_fingerprint: Option<String>,
}

impl BackendHandler {
    pub fn new(config: &BackendConfig) -> Self {
        Self {
            address: config.address.clone(),
            expected_fingerprint: config.host_key_fingerprint.clone(),
        }
    }

    fn accepts(&self, fingerprint: &str) -> bool {
        match &self.expected_fingerprint {
            Some(expected) if expected != fingerprint => {
                warn!(
                    backend = %self.address,
                    expected = %expected,
                    presented = %fingerprint,
                    "backend host key mismatch"
                );
                false
            }
            Some(_) => {
                debug!(backend = %self.address, fingerprint, "backend host key matches pin");
                true
            }
            None => {
                debug!(backend = %self.address, fingerprint, "accepting unpinned backend host key");
                true
            }
        }
    }
}

impl client::Handler for BackendHandler {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint(HashAlg::Sha256).to_string();
        Ok(self.accepts(&fingerprint))
    }
}

pub type BackendHandle = client::Handle<BackendHandler>;

/// An authenticated backend connection and its one session channel.
pub struct BackendSession {
    pub handle: BackendHandle,
    pub channel: Channel<client::Msg>,
}

/// Disconnect from the backend once the relay is done with it.
pub async fn disconnect(handle: &BackendHandle) {
    if let Err(e) = handle.disconnect(Disconnect::ByApplication, "session ended", "en").await {
        debug!(error = %e, "backend disconnect failed");
    }
}

fn build_client_config(config: &BackendConfig) -> Arc<client::Config> {
    Arc::new(client::Config {
        preferred: backend_preferred(config.legacy_crypto),
        nodelay: true,
        inactivity_timeout: None,
        keepalive_interval: None,
        ..Default::default()
    })
}

/// Dial, authenticate with the fixed credentials and open a session channel.
pub async fn establish(config: &BackendConfig) -> BastionResult<BackendSession> {
    debug!(backend = %config.address, user = %config.username, "connecting to backend");
    let mut handle = client::connect(
        build_client_config(config),
        config.address.as_str(),
        BackendHandler::new(config),
    )
    .await
    .map_err(|e| BastionError::backend_connect(&config.address, e))?;

    let auth = handle
        .authenticate_password(config.username.clone(), config.password.expose_secret().clone())
        .await
        .map_err(|e| BastionError::backend_connect(&config.address, e))?;
    if !auth.success() {
        disconnect(&handle).await;
        return Err(BastionError::BackendAuthRejected(config.username.clone()));
    }

    let channel = handle.channel_open_session().await?;
    info!(backend = %config.address, user = %config.username, "backend session opened");
    Ok(BackendSession { handle, channel })
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use tokio::net::TcpListener;

    use super::*;
    use crate::config::SecretBoxedString;

    fn backend_config(address: &str) -> BackendConfig {
        BackendConfig {
            address: address.to_string(),
            username: "testuser".into(),
            password: SecretBoxedString::new(Box::new("testpass".into())),
            host_key_fingerprint: None,
            legacy_crypto: false,
        }
    }

    #[test]
    fn client_config_has_no_timeouts() {
        let config = build_client_config(&backend_config("127.0.0.1:22"));
        assert!(config.nodelay);
        assert!(config.inactivity_timeout.is_none());
        assert!(config.keepalive_interval.is_none());
        assert!(!config.preferred.kex.contains(&russh::kex::DH_G1_SHA1));
    }

    #[test]
    fn legacy_flag_widens_the_suite() {
        let mut backend = backend_config("127.0.0.1:22");
        backend.legacy_crypto = true;
        let config = build_client_config(&backend);
        assert!(config.preferred.kex.contains(&russh::kex::DH_G1_SHA1));
    }

    #[test]
    fn unpinned_handler_accepts_any_key() {
        let handler = BackendHandler::new(&backend_config("127.0.0.1:22"));
        assert!(handler.accepts("SHA256:anything"));
    }

    #[test]
    fn pinned_handler_rejects_other_keys() {
        let mut backend = backend_config("127.0.0.1:22");
        backend.host_key_fingerprint = Some("SHA256:expected".into());
        let handler = BackendHandler::new(&backend);
        assert!(handler.accepts("SHA256:expected"));
        assert!(!handler.accepts("SHA256:other"));
    }

    #[tokio::test]
    async fn nothing_listening_fails_promptly() {
        // Grab a free port, then release it so the dial is refused.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let started = Instant::now();
        let err = establish(&backend_config(&address)).await.err().expect("dial should fail");
        assert!(started.elapsed() < Duration::from_secs(5));
        match err {
            BastionError::BackendConnect { address: reported, .. } => assert_eq!(reported, address),
            other => panic!("unexpected error: {other}"),
        }
    }
}
