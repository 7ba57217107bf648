//! Adapter from a live `russh::Channel` to a [`SessionChannel`].
//!
//! Each attached channel gets one pump task that owns the `Channel`, drains
//! `Channel::wait` and fans messages out: data into per-stream queues that feed
//! the relay's pipes, backend requests into the request queue, and
//! `Success`/`Failure` back to whoever is waiting on a request we sent. Writes
//! bypass the pump and go straight through `Channel::make_writer`.
//!
//! russh hands channel messages over from its session loop, so the pump never
//! waits on the relay while draining. Data is queued without bound and moved into
//! the pipe by a separate task.
//!
//! Requests from a client are not seen here. The protocol handler receives them
//! together with the client's want-reply flag and answers them itself.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use russh::{Channel, ChannelId, ChannelMsg, CryptoVec, server};
use tokio::io::{AsyncWriteExt, DuplexStream, duplex};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use super::{BoxedWriter, ChannelControl, ChannelRequest, EXTENDED_DATA_STDERR};
use super::{IncomingRequest, RequestReply, SessionChannel};
use crate::error::{BastionError, BastionResult};

const PIPE_CAPACITY: usize = 64 * 1024;
const COMMAND_QUEUE: usize = 16;

/// Which leg of the relay a channel belongs to.
pub enum Side {
    /// Accepted from a client. `requests` is the stream the protocol handler
    /// feeds; server-originated requests (`exit-status`, `exit-signal`,
    /// `xon-xoff`) go out through the session handle.
    Inbound {
        handle: server::Handle,
        requests: mpsc::UnboundedReceiver<IncomingRequest>,
    },
    /// Opened towards the backend.
    Outbound,
}

/// Where requests sent on this channel go.
enum Peer {
    Client(server::Handle),
    Backend,
}

impl Peer {
    fn name(&self) -> &'static str {
        match self {
            Peer::Client(_) => "inbound",
            Peer::Backend => "outbound",
        }
    }
}

enum Command {
    Request {
        request: ChannelRequest,
        reply: Option<oneshot::Sender<RequestReply>>,
        sent: oneshot::Sender<BastionResult<()>>,
    },
    Close,
}

struct PumpControl {
    commands: mpsc::Sender<Command>,
}

#[async_trait]
impl ChannelControl for PumpControl {
    async fn send_request(&self, request: ChannelRequest, want_reply: bool) -> BastionResult<Option<RequestReply>> {
        let (sent_tx, sent_rx) = oneshot::channel();
        let (reply_tx, reply_rx) = if want_reply {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        self.commands
            .send(Command::Request {
                request,
                reply: reply_tx,
                sent: sent_tx,
            })
            .await
            .map_err(|_| BastionError::ChannelClosed)?;
        sent_rx.await.map_err(|_| BastionError::ChannelClosed)??;

        match reply_rx {
            Some(rx) => rx.await.map(Some).map_err(|_| BastionError::ChannelClosed),
            None => Ok(None),
        }
    }

    async fn close(&self) -> BastionResult<()> {
        // A finished pump means the channel is already gone.
        let _ = self.commands.send(Command::Close).await;
        Ok(())
    }
}

type ChunkQueue = mpsc::UnboundedSender<CryptoVec>;

/// Start a pump for `channel` and return the relay-facing view of it.
pub fn attach<S>(channel: Channel<S>, side: Side) -> SessionChannel
where
    S: From<(ChannelId, ChannelMsg)> + Send + Sync + 'static,
{
    let (data_near, data_far) = duplex(PIPE_CAPACITY);
    let (ext_near, ext_far) = duplex(PIPE_CAPACITY);
    let (data_tx, data_rx) = mpsc::unbounded_channel();
    let (ext_tx, ext_rx) = mpsc::unbounded_channel();
    let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);
    let id = channel.id();

    let (peer, backend_requests, requests) = match side {
        Side::Inbound { handle, requests } => (Peer::Client(handle), None, requests),
        Side::Outbound => {
            let (tx, rx) = mpsc::unbounded_channel();
            (Peer::Backend, Some(tx), rx)
        }
    };
    let name = peer.name();

    let writer: BoxedWriter = Box::pin(channel.make_writer());
    let ext_writer: BoxedWriter = Box::pin(channel.make_writer_ext(Some(EXTENDED_DATA_STDERR)));

    tokio::spawn(drain(data_rx, data_far));
    tokio::spawn(drain(ext_rx, ext_far));
    let pump = Pump {
        id,
        channel,
        peer,
        data: Some(data_tx),
        ext: Some(ext_tx),
        requests: backend_requests,
        pending: VecDeque::new(),
    };
    tokio::spawn(pump.run(command_rx));

    SessionChannel {
        side: name,
        reader: Box::pin(data_near),
        writer,
        ext_reader: Box::pin(ext_near),
        ext_writer,
        requests,
        control: Arc::new(PumpControl { commands: command_tx }),
    }
}

/// Move queued chunks into the relay's pipe, in order. Dropping the pipe at the
/// end is what the relay reads as EOF.
async fn drain(mut chunks: mpsc::UnboundedReceiver<CryptoVec>, mut pipe: DuplexStream) {
    while let Some(chunk) = chunks.recv().await {
        // The relay stopped reading; discard the rest.
        if pipe.write_all(&chunk).await.is_err() {
            break;
        }
    }
}

struct Pump<S>
where
    S: From<(ChannelId, ChannelMsg)> + Send + Sync + 'static,
{
    id: ChannelId,
    channel: Channel<S>,
    peer: Peer,
    data: Option<ChunkQueue>,
    ext: Option<ChunkQueue>,
    /// Requests the backend sent us. Unused on the inbound side.
    requests: Option<mpsc::UnboundedSender<IncomingRequest>>,
    /// Reply slots for requests we sent with want-reply, oldest first.
    pending: VecDeque<oneshot::Sender<RequestReply>>,
}

impl<S> Pump<S>
where
    S: From<(ChannelId, ChannelMsg)> + Send + Sync + 'static,
{
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let mut commands_open = true;
        loop {
            tokio::select! {
                msg = self.channel.wait() => match msg {
                    Some(msg) => self.on_message(msg),
                    None => break,
                },
                command = commands.recv(), if commands_open => match command {
                    Some(Command::Request { request, reply, sent }) => {
                        let result = self.send(request, reply).await;
                        let _ = sent.send(result);
                    }
                    Some(Command::Close) => self.close().await,
                    None => commands_open = false,
                },
            }
        }
        self.finish_streams();
        self.pending.clear();
        trace!(side = self.peer.name(), channel = ?self.id, "channel pump finished");
    }

    fn on_message(&mut self, msg: ChannelMsg) {
        match msg {
            ChannelMsg::Data { data } => feed(&mut self.data, data),
            ChannelMsg::ExtendedData { data, ext } if ext == EXTENDED_DATA_STDERR => feed(&mut self.ext, data),
            ChannelMsg::ExtendedData { ext, .. } => {
                debug!(side = self.peer.name(), ext, "dropping extended data of unknown type");
            }
            ChannelMsg::Eof => {
                debug!(side = self.peer.name(), channel = ?self.id, "peer sent EOF");
                self.finish_streams();
            }
            ChannelMsg::Close => {
                debug!(side = self.peer.name(), channel = ?self.id, "peer closed channel");
                self.finish_streams();
                self.pending.clear();
            }
            ChannelMsg::Success => self.resolve(RequestReply::success()),
            ChannelMsg::Failure => self.resolve(RequestReply::failure()),
            other => match backend_request(other) {
                Some(request) => self.deliver(request),
                None => trace!(side = self.peer.name(), "ignoring channel message"),
            },
        }
    }

    /// Server-originated requests never want a reply.
    fn deliver(&mut self, request: ChannelRequest) {
        trace!(side = self.peer.name(), kind = request.kind(), "request from peer");
        let Some(requests) = &self.requests else {
            return;
        };
        if requests.send(IncomingRequest { request, reply: None }).is_err() {
            self.requests = None;
        }
    }

    fn resolve(&mut self, reply: RequestReply) {
        match self.pending.pop_front() {
            Some(slot) => {
                let _ = slot.send(reply);
            }
            None => debug!(side = self.peer.name(), "unsolicited request reply from peer"),
        }
    }

    async fn send(&mut self, request: ChannelRequest, reply: Option<oneshot::Sender<RequestReply>>) -> BastionResult<()> {
        let want_reply = reply.is_some();
        let answered = match &self.peer {
            Peer::Client(handle) => {
                send_to_client(handle, self.id, request).await?;
                false
            }
            Peer::Backend => send_to_backend(&self.channel, request, want_reply).await?,
        };

        if let Some(slot) = reply {
            if answered {
                self.pending.push_back(slot);
            } else {
                // The peer never answers this request type.
                let _ = slot.send(RequestReply::success());
            }
        }
        Ok(())
    }

    async fn close(&mut self) {
        self.finish_streams();
        if let Err(e) = self.channel.close().await {
            debug!(side = self.peer.name(), channel = ?self.id, error = %e, "channel close failed");
        }
    }

    /// Signal EOF to the relay side of both data pipes, once queued data is through.
    fn finish_streams(&mut self) {
        self.data = None;
        self.ext = None;
    }
}

fn feed(queue: &mut Option<ChunkQueue>, chunk: CryptoVec) {
    let gone = match queue {
        Some(tx) => tx.send(chunk).is_err(),
        None => false,
    };
    if gone {
        *queue = None;
    }
}

/// Returns whether the backend will answer with `Success`/`Failure`.
async fn send_to_backend<S>(channel: &Channel<S>, request: ChannelRequest, want_reply: bool) -> BastionResult<bool>
where
    S: From<(ChannelId, ChannelMsg)> + Send + Sync + 'static,
{
    match request {
        ChannelRequest::Pty {
            term,
            col_width,
            row_height,
            pix_width,
            pix_height,
            terminal_modes,
        } => {
            channel
                .request_pty(want_reply, &term, col_width, row_height, pix_width, pix_height, &terminal_modes)
                .await?
        }
        ChannelRequest::X11 {
            single_connection,
            auth_protocol,
            auth_cookie,
            screen_number,
        } => {
            channel
                .request_x11(want_reply, single_connection, auth_protocol, auth_cookie, screen_number)
                .await?
        }
        ChannelRequest::Env { name, value } => channel.set_env(want_reply, name, value).await?,
        ChannelRequest::Shell => channel.request_shell(want_reply).await?,
        ChannelRequest::Exec { command } => channel.exec(want_reply, command).await?,
        ChannelRequest::Subsystem { name } => channel.request_subsystem(want_reply, name).await?,
        ChannelRequest::AgentForward => channel.agent_forward(want_reply).await?,
        ChannelRequest::WindowChange {
            col_width,
            row_height,
            pix_width,
            pix_height,
        } => {
            channel.window_change(col_width, row_height, pix_width, pix_height).await?;
            return Ok(false);
        }
        ChannelRequest::Signal { signal } => {
            channel.signal(signal).await?;
            return Ok(false);
        }
        other @ (ChannelRequest::XonXoff { .. } | ChannelRequest::ExitStatus { .. } | ChannelRequest::ExitSignal { .. }) => {
            return Err(BastionError::UnsupportedRequest(other.kind()));
        }
    }
    Ok(want_reply)
}

async fn send_to_client(handle: &server::Handle, id: ChannelId, request: ChannelRequest) -> BastionResult<()> {
    match request {
        ChannelRequest::ExitStatus { exit_status } => handle
            .exit_status_request(id, exit_status)
            .await
            .map_err(|_| BastionError::ChannelClosed),
        ChannelRequest::ExitSignal {
            signal,
            core_dumped,
            error_message,
            lang_tag,
        } => handle
            .exit_signal_request(id, signal, core_dumped, error_message, lang_tag)
            .await
            .map_err(|_| BastionError::ChannelClosed),
        ChannelRequest::XonXoff { client_can_do } => handle
            .xon_xoff_request(id, client_can_do)
            .await
            .map_err(|_| BastionError::ChannelClosed),
        other => Err(BastionError::UnsupportedRequest(other.kind())),
    }
}

/// Decode a request the backend sent on its session channel.
fn backend_request(msg: ChannelMsg) -> Option<ChannelRequest> {
    let request = match msg {
        ChannelMsg::XonXoff { client_can_do } => ChannelRequest::XonXoff { client_can_do },
        ChannelMsg::ExitStatus { exit_status } => ChannelRequest::ExitStatus { exit_status },
        ChannelMsg::ExitSignal {
            signal_name,
            core_dumped,
            error_message,
            lang_tag,
        } => ChannelRequest::ExitSignal {
            signal: signal_name,
            core_dumped,
            error_message,
            lang_tag,
        },
        _ => return None,
    };
    Some(request)
}
