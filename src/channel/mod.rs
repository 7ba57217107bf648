//! Transport-neutral view of one SSH session channel.
//!
//! The relay only ever touches a [`SessionChannel`]: two byte streams (normal and
//! stderr data), a stream of requests the peer sent us, and a [`ChannelControl`]
//! handle for sending requests back and closing. [`pump`] adapts a live
//! `russh::Channel` to this shape; tests use the in-memory fake in `memory`.
//!
//! Request streams are unbounded. Whoever feeds them is a russh session loop or
//! a protocol callback, and neither may wait on the relay.

#[cfg(test)]
pub(crate) mod memory;
pub mod pump;

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use russh::{Pty, Sig};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};

use crate::error::BastionResult;

pub type BoxedReader = Pin<Box<dyn AsyncRead + Send>>;
pub type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// `SSH_EXTENDED_DATA_STDERR`
pub const EXTENDED_DATA_STDERR: u32 = 1;

/// Session channel requests (RFC 4254 §6 plus agent forwarding), payload kept verbatim.
#[derive(Debug, Clone)]
pub enum ChannelRequest {
    Pty {
        term: String,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        terminal_modes: Vec<(Pty, u32)>,
    },
    X11 {
        single_connection: bool,
        auth_protocol: String,
        auth_cookie: String,
        screen_number: u32,
    },
    Env {
        name: String,
        value: String,
    },
    Shell,
    Exec {
        command: Vec<u8>,
    },
    Subsystem {
        name: String,
    },
    WindowChange {
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
    },
    XonXoff {
        client_can_do: bool,
    },
    Signal {
        signal: Sig,
    },
    ExitStatus {
        exit_status: u32,
    },
    ExitSignal {
        signal: Sig,
        core_dumped: bool,
        error_message: String,
        lang_tag: String,
    },
    AgentForward,
}

impl ChannelRequest {
    /// Request type as it appears on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            ChannelRequest::Pty { .. } => "pty-req",
            ChannelRequest::X11 { .. } => "x11-req",
            ChannelRequest::Env { .. } => "env",
            ChannelRequest::Shell => "shell",
            ChannelRequest::Exec { .. } => "exec",
            ChannelRequest::Subsystem { .. } => "subsystem",
            ChannelRequest::WindowChange { .. } => "window-change",
            ChannelRequest::XonXoff { .. } => "xon-xoff",
            ChannelRequest::Signal { .. } => "signal",
            ChannelRequest::ExitStatus { .. } => "exit-status",
            ChannelRequest::ExitSignal { .. } => "exit-signal",
            ChannelRequest::AgentForward => "auth-agent-req@openssh.com",
        }
    }
}

/// Answer to a request sent with want-reply set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestReply {
    pub success: bool,
    pub payload: Option<Vec<u8>>,
}

impl RequestReply {
    pub fn success() -> Self {
        Self {
            success: true,
            payload: None,
        }
    }

    pub fn failure() -> Self {
        Self {
            success: false,
            payload: None,
        }
    }
}

/// A request received from the peer.
///
/// `reply` is present exactly when the peer set want-reply. Dropping it unanswered
/// makes the peer see a failure.
#[derive(Debug)]
pub struct IncomingRequest {
    pub request: ChannelRequest,
    pub reply: Option<oneshot::Sender<RequestReply>>,
}

impl IncomingRequest {
    pub fn want_reply(&self) -> bool {
        self.reply.is_some()
    }
}

/// Outgoing half of a channel: request origination and teardown.
#[async_trait]
pub trait ChannelControl: Send + Sync {
    /// Send `request` to the peer. With `want_reply` the call waits for the peer's
    /// answer and returns it.
    async fn send_request(&self, request: ChannelRequest, want_reply: bool) -> BastionResult<Option<RequestReply>>;

    /// Close the channel. Closing twice is harmless.
    async fn close(&self) -> BastionResult<()>;
}

pub struct SessionChannel {
    /// "inbound" or "outbound", used in log fields.
    pub side: &'static str,
    pub reader: BoxedReader,
    pub writer: BoxedWriter,
    pub ext_reader: BoxedReader,
    pub ext_writer: BoxedWriter,
    pub requests: mpsc::UnboundedReceiver<IncomingRequest>,
    pub control: Arc<dyn ChannelControl>,
}
