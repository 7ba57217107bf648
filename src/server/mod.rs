//! Inbound listener and per-connection lifecycle.
//!
//! [`Bastion::run`] accepts TCP connections and gives each its own task. A
//! connection goes through the SSH handshake, waits for its session channel,
//! dials the backend and then runs a [`RelayPair`] until either side is done.

mod handler;
pub mod negotiate;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use russh::keys::PrivateKey;
use russh::{Disconnect, server as ssh_server};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::auth::{AuthPolicy, policy_for};
use crate::backend::{self, BackendSession};
use crate::channel::pump::{self, Side};
use crate::config::{BackendConfig, BastionConfig};
use crate::crypto::default_preferred;
use crate::error::{BastionError, BastionResult};
use crate::relay::RelayPair;
use handler::InboundHandler;
use negotiate::{accept_session, reject_additional};

const OPEN_QUEUE: usize = 4;

pub struct Bastion {
    listener: TcpListener,
    ssh_config: Arc<ssh_server::Config>,
    backend: Arc<BackendConfig>,
    auth: Arc<dyn AuthPolicy>,
}

impl Bastion {
    /// Bind the listen address. The host key must already be loaded.
    pub async fn bind(config: BastionConfig, host_key: PrivateKey) -> BastionResult<Self> {
        let address = config.listen.address;
        let listener = TcpListener::bind(&address)
            .await
            .map_err(|source| BastionError::BindFailed {
                address: address.clone(),
                source,
            })?;

        let auth = policy_for(&config.inbound_auth);
        let mut ssh_config = ssh_server::Config {
            preferred: default_preferred(),
            auth_rejection_time: Duration::from_millis(250),
            auth_rejection_time_initial: Some(Duration::from_millis(0)),
            inactivity_timeout: None,
            keepalive_interval: None,
            nodelay: true,
            ..Default::default()
        };
        ssh_config.methods = auth.methods();
        ssh_config.keys.push(host_key);

        Ok(Self {
            listener,
            ssh_config: Arc::new(ssh_config),
            backend: Arc::new(config.backend),
            auth,
        })
    }

    pub fn local_addr(&self) -> BastionResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections forever. Only a listener failure returns.
    pub async fn run(self) -> BastionResult<()> {
        info!(
            listen = %self.local_addr()?,
            backend = %self.backend.address,
            "bastion listening"
        );

        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) if is_transient(&e) => {
                    warn!(error = %e, "accept failed; continuing");
                    continue;
                }
                Err(e) => return Err(BastionError::Accept(e)),
            };
            if let Err(e) = stream.set_nodelay(true) {
                debug!(peer = %peer, error = %e, "failed to set TCP_NODELAY");
            }

            let connection = Connection {
                peer,
                ssh_config: self.ssh_config.clone(),
                backend: self.backend.clone(),
                auth: self.auth.clone(),
            };
            tokio::spawn(async move {
                info!(peer = %peer, "client connected");
                match connection.serve(stream).await {
                    Ok(()) => info!(peer = %peer, "client disconnected"),
                    Err(e) => warn!(peer = %peer, error = %e, "connection ended with error"),
                }
            });
        }
    }
}

/// Errors that concern a single not-yet-accepted connection, not the listener.
fn is_transient(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset | io::ErrorKind::Interrupted
    )
}

struct Connection {
    peer: SocketAddr,
    ssh_config: Arc<ssh_server::Config>,
    backend: Arc<BackendConfig>,
    auth: Arc<dyn AuthPolicy>,
}

impl Connection {
    async fn serve(self, stream: TcpStream) -> BastionResult<()> {
        let peer = self.peer;
        let (opens_tx, mut opens) = mpsc::channel(OPEN_QUEUE);
        let (requests_tx, requests) = mpsc::unbounded_channel();
        let handler = InboundHandler::new(peer, self.auth.clone(), opens_tx, requests_tx);

        let running = ssh_server::run_stream(self.ssh_config.clone(), stream, handler)
            .await
            .map_err(BastionError::Handshake)?;
        let handle = running.handle();
        let session = tokio::spawn(running);

        let channel = match accept_session(&mut opens).await {
            Ok(Some(channel)) => channel,
            Ok(None) => {
                debug!(peer = %peer, "connection ended before a session was opened");
                return finish(session).await;
            }
            Err(e) => {
                // Later opens must not wait on a negotiator that is gone.
                drop(opens);
                disconnect_client(&handle, &e.to_string()).await;
                let _ = finish(session).await;
                return Err(e);
            }
        };
        tokio::spawn(reject_additional(opens));

        let inbound = pump::attach(
            channel,
            Side::Inbound {
                handle: handle.clone(),
                requests,
            },
        );
        info!(peer = %peer, backend = %self.backend.address, "session opened; connecting to backend");

        let BackendSession {
            handle: backend_handle,
            channel: backend_channel,
        } = match backend::establish(&self.backend).await {
            Ok(backend) => backend,
            Err(e) => {
                warn!(peer = %peer, backend = %self.backend.address, error = %e, "backend unavailable; closing session");
                let _ = inbound.control.close().await;
                // Requests still queued get a failure reply, which frees the protocol handler.
                drop(inbound);
                disconnect_client(&handle, "backend unavailable").await;
                let _ = finish(session).await;
                return Err(e);
            }
        };
        let outbound = pump::attach(backend_channel, Side::Outbound);

        let transferred = RelayPair::new(inbound, outbound).run().await;
        info!(
            peer = %peer,
            to_backend = transferred.to_backend,
            to_client = transferred.to_client,
            "session relay finished"
        );

        backend::disconnect(&backend_handle).await;
        disconnect_client(&handle, "session ended").await;
        finish(session).await
    }
}

async fn disconnect_client(handle: &ssh_server::Handle, message: &str) {
    if let Err(e) = handle
        .disconnect(Disconnect::ByApplication, message.into(), "en".into())
        .await
    {
        debug!(error = ?e, "client disconnect failed");
    }
}

/// Wait for the inbound protocol task, surfacing handshake and transport errors.
async fn finish(session: tokio::task::JoinHandle<Result<(), russh::Error>>) -> BastionResult<()> {
    match session.await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(BastionError::Handshake(e)),
        Err(e) => Err(BastionError::Internal(format!("session task failed: {e}"))),
    }
}
