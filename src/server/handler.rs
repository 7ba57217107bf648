//! russh server handler for inbound clients.
//!
//! Authentication is delegated to the configured [`AuthPolicy`]. Channel opens of
//! every type russh surfaces are handed to the negotiator and answered with its
//! decision. Session requests on the accepted channel are relayed from here, so the
//! client's reply goes out while russh still holds that request's want-reply flag.
//! Global requests are refused on the spot and never leave this handler.

use std::net::SocketAddr;
use std::sync::Arc;

use russh::keys::PublicKey;
use russh::server::{self as ssh_server, Auth, Msg, Session};
use russh::{Channel, ChannelId, Pty, Sig};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use super::negotiate::{ChannelOpen, OpenDecision, SESSION};
use crate::auth::AuthPolicy;
use crate::channel::{ChannelRequest, IncomingRequest, RequestReply};

pub(super) type InboundOpen = ChannelOpen<Channel<Msg>>;

pub(super) struct InboundHandler {
    peer: SocketAddr,
    auth: Arc<dyn AuthPolicy>,
    opens: mpsc::Sender<InboundOpen>,
    requests: mpsc::UnboundedSender<IncomingRequest>,
    /// The accepted session channel, once there is one.
    session: Option<ChannelId>,
}

impl InboundHandler {
    pub(super) fn new(
        peer: SocketAddr,
        auth: Arc<dyn AuthPolicy>,
        opens: mpsc::Sender<InboundOpen>,
        requests: mpsc::UnboundedSender<IncomingRequest>,
    ) -> Self {
        Self {
            peer,
            auth,
            opens,
            requests,
            session: None,
        }
    }

    /// Hand a channel-open to the negotiator and wait for its answer.
    async fn offer(&self, kind: &str, channel: Channel<Msg>) -> bool {
        let (open, decision) = ChannelOpen::new(kind, channel);
        if self.opens.send(open).await.is_err() {
            return false;
        }
        match decision.await {
            Ok(OpenDecision::Accept) => true,
            Ok(OpenDecision::Reject(reason)) => {
                debug!(peer = %self.peer, kind, ?reason, "channel open rejected");
                false
            }
            Err(_) => false,
        }
    }

    /// Queue a request for the backend. `None` when it is not for the relayed
    /// session or the relay is gone.
    fn forward(&self, channel: ChannelId, request: ChannelRequest, want_reply: bool) -> Option<oneshot::Receiver<RequestReply>> {
        if self.session != Some(channel) {
            debug!(peer = %self.peer, ?channel, kind = request.kind(), "request for a channel that is not relayed");
            return None;
        }
        let (reply, answer) = if want_reply {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        self.requests.send(IncomingRequest { request, reply }).ok()?;
        answer
    }

    /// Relay a request and answer the client with the backend's verdict.
    ///
    /// russh keeps the client's want-reply flag to itself and
    /// `channel_success`/`channel_failure` only write a reply when it was set. The
    /// backend is therefore always asked, and its answer reaches the client only if
    /// the client asked too.
    async fn relay(&mut self, channel: ChannelId, request: ChannelRequest, session: &mut Session) -> Result<(), russh::Error> {
        let kind = request.kind();
        let success = match self.forward(channel, request, true) {
            Some(answer) => answer.await.map(|reply| reply.success).unwrap_or(false),
            None => false,
        };
        trace!(peer = %self.peer, kind, success, "answering client request");
        if success {
            session.channel_success(channel)
        } else {
            session.channel_failure(channel)
        }
    }

    /// Relay a request that never carries a reply.
    fn notify(&self, channel: ChannelId, request: ChannelRequest) {
        let _ = self.forward(channel, request, false);
    }

    fn verdict(&self, method: &str, user: &str, allowed: bool) -> Auth {
        if allowed {
            info!(peer = %self.peer, user, method, "client authenticated");
            Auth::Accept
        } else {
            warn!(peer = %self.peer, user, method, "client authentication rejected");
            Auth::reject()
        }
    }
}

impl ssh_server::Handler for InboundHandler {
    type Error = russh::Error;

    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        Ok(self.verdict("none", user, self.auth.allow_none(user)))
    }

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        Ok(self.verdict("password", user, self.auth.allow_password(user, password)))
    }

    async fn auth_publickey(&mut self, user: &str, public_key: &PublicKey) -> Result<Auth, Self::Error> {
        Ok(self.verdict("publickey", user, self.auth.allow_publickey(user, public_key)))
    }

    async fn channel_open_session(&mut self, channel: Channel<Msg>, _session: &mut Session) -> Result<bool, Self::Error> {
        let id = channel.id();
        let accepted = self.offer(SESSION, channel).await;
        if accepted {
            self.session = Some(id);
        }
        Ok(accepted)
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!(peer = %self.peer, host_to_connect, port_to_connect, "direct-tcpip requested");
        Ok(self.offer("direct-tcpip", channel).await)
    }

    async fn channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!(peer = %self.peer, host_to_connect, port_to_connect, "forwarded-tcpip requested");
        Ok(self.offer("forwarded-tcpip", channel).await)
    }

    async fn channel_open_direct_streamlocal(
        &mut self,
        channel: Channel<Msg>,
        socket_path: &str,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!(peer = %self.peer, socket_path, "direct-streamlocal requested");
        Ok(self.offer("direct-streamlocal@openssh.com", channel).await)
    }

    async fn channel_open_x11(
        &mut self,
        channel: Channel<Msg>,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(self.offer("x11", channel).await)
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let request = ChannelRequest::Pty {
            term: term.to_string(),
            col_width,
            row_height,
            pix_width,
            pix_height,
            terminal_modes: modes.to_vec(),
        };
        self.relay(channel, request, session).await
    }

    async fn x11_request(
        &mut self,
        channel: ChannelId,
        single_connection: bool,
        x11_auth_protocol: &str,
        x11_auth_cookie: &str,
        x11_screen_number: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let request = ChannelRequest::X11 {
            single_connection,
            auth_protocol: x11_auth_protocol.to_string(),
            auth_cookie: x11_auth_cookie.to_string(),
            screen_number: x11_screen_number,
        };
        self.relay(channel, request, session).await
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let request = ChannelRequest::Env {
            name: variable_name.to_string(),
            value: variable_value.to_string(),
        };
        self.relay(channel, request, session).await
    }

    async fn shell_request(&mut self, channel: ChannelId, session: &mut Session) -> Result<(), Self::Error> {
        self.relay(channel, ChannelRequest::Shell, session).await
    }

    async fn exec_request(&mut self, channel: ChannelId, data: &[u8], session: &mut Session) -> Result<(), Self::Error> {
        let request = ChannelRequest::Exec { command: data.to_vec() };
        self.relay(channel, request, session).await
    }

    async fn subsystem_request(&mut self, channel: ChannelId, name: &str, session: &mut Session) -> Result<(), Self::Error> {
        let request = ChannelRequest::Subsystem { name: name.to_string() };
        self.relay(channel, request, session).await
    }

    async fn agent_request(&mut self, channel: ChannelId, session: &mut Session) -> Result<bool, Self::Error> {
        self.relay(channel, ChannelRequest::AgentForward, session).await?;
        // Already answered on the channel. `false` would also emit a global failure.
        Ok(true)
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.notify(
            channel,
            ChannelRequest::WindowChange {
                col_width,
                row_height,
                pix_width,
                pix_height,
            },
        );
        Ok(())
    }

    async fn signal(&mut self, channel: ChannelId, signal: Sig, _session: &mut Session) -> Result<(), Self::Error> {
        self.notify(channel, ChannelRequest::Signal { signal });
        Ok(())
    }

    async fn tcpip_forward(&mut self, address: &str, port: &mut u32, _session: &mut Session) -> Result<bool, Self::Error> {
        debug!(peer = %self.peer, address, port = *port, "discarding tcpip-forward request");
        Ok(false)
    }

    async fn cancel_tcpip_forward(&mut self, address: &str, port: u32, _session: &mut Session) -> Result<bool, Self::Error> {
        debug!(peer = %self.peer, address, port, "discarding cancel-tcpip-forward request");
        Ok(false)
    }
}
