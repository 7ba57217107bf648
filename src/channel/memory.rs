//! In-memory [`SessionChannel`] for driving the relay without a network.

use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, duplex};
use tokio::sync::{Mutex, mpsc, oneshot, watch};

use super::{ChannelControl, ChannelRequest, IncomingRequest, RequestReply, SessionChannel};
use crate::error::{BastionError, BastionResult};

const PIPE_CAPACITY: usize = 16 * 1024;

/// A request the relay sent towards this fake peer.
#[derive(Debug)]
pub struct SentRequest {
    pub request: ChannelRequest,
    pub reply: Option<oneshot::Sender<RequestReply>>,
}

type SharedPipe = Arc<Mutex<Option<DuplexStream>>>;

struct MemoryControl {
    input: SharedPipe,
    ext_input: SharedPipe,
    requests: Arc<StdMutex<Option<mpsc::UnboundedSender<IncomingRequest>>>>,
    sent: mpsc::UnboundedSender<SentRequest>,
    closes: watch::Sender<usize>,
    reject_requests: bool,
}

#[async_trait]
impl ChannelControl for MemoryControl {
    async fn send_request(&self, request: ChannelRequest, want_reply: bool) -> BastionResult<Option<RequestReply>> {
        if self.reject_requests {
            return Err(BastionError::UnsupportedRequest(request.kind()));
        }
        if *self.closes.borrow() > 0 {
            return Err(BastionError::ChannelClosed);
        }

        let (reply_tx, reply_rx) = if want_reply {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        self.sent
            .send(SentRequest {
                request,
                reply: reply_tx,
            })
            .map_err(|_| BastionError::ChannelClosed)?;

        match reply_rx {
            Some(rx) => rx.await.map(Some).map_err(|_| BastionError::ChannelClosed),
            None => Ok(None),
        }
    }

    async fn close(&self) -> BastionResult<()> {
        self.input.lock().await.take();
        self.ext_input.lock().await.take();
        if let Ok(mut requests) = self.requests.lock() {
            requests.take();
        }
        self.closes.send_modify(|count| *count += 1);
        Ok(())
    }
}

/// The test's handle on the far side of a fake channel.
pub struct FarEnd {
    input: SharedPipe,
    ext_input: SharedPipe,
    requests: Arc<StdMutex<Option<mpsc::UnboundedSender<IncomingRequest>>>>,
    /// Bytes the relay wrote to this channel.
    pub output: DuplexStream,
    pub ext_output: DuplexStream,
    pub sent: mpsc::UnboundedReceiver<SentRequest>,
    closes: watch::Receiver<usize>,
}

impl FarEnd {
    /// Deliver bytes as if the peer sent them.
    pub async fn send(&self, bytes: &[u8]) {
        if let Some(stream) = self.input.lock().await.as_mut() {
            stream.write_all(bytes).await.unwrap();
        }
    }

    pub async fn send_stderr(&self, bytes: &[u8]) {
        if let Some(stream) = self.ext_input.lock().await.as_mut() {
            stream.write_all(bytes).await.unwrap();
        }
    }

    /// Peer half-closes its side.
    pub async fn eof(&self) {
        self.input.lock().await.take();
        self.ext_input.lock().await.take();
    }

    /// Inject a request from the peer; returns the reply receiver when want-reply is set.
    pub async fn request(&self, request: ChannelRequest, want_reply: bool) -> Option<oneshot::Receiver<RequestReply>> {
        let (reply_tx, reply_rx) = if want_reply {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        let sender = self.requests.lock().unwrap().clone();
        if let Some(sender) = sender {
            sender
                .send(IncomingRequest {
                    request,
                    reply: reply_tx,
                })
                .unwrap();
        }
        reply_rx
    }

    /// Stop delivering requests, as when the peer's request stream ends.
    pub fn end_requests(&self) {
        self.requests.lock().unwrap().take();
    }

    pub async fn read_exact(&mut self, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        self.output.read_exact(&mut buf).await.unwrap();
        buf
    }

    pub fn close_count(&self) -> usize {
        *self.closes.borrow()
    }

    pub async fn closed(&mut self) {
        self.closes.wait_for(|count| *count > 0).await.unwrap();
    }
}

pub fn channel(side: &'static str) -> (SessionChannel, FarEnd) {
    build(side, false)
}

/// A channel whose peer refuses every request we try to send.
pub fn rejecting_channel(side: &'static str) -> (SessionChannel, FarEnd) {
    build(side, true)
}

fn build(side: &'static str, reject_requests: bool) -> (SessionChannel, FarEnd) {
    let (reader, input) = duplex(PIPE_CAPACITY);
    let (writer, output) = duplex(PIPE_CAPACITY);
    let (ext_reader, ext_input) = duplex(PIPE_CAPACITY);
    let (ext_writer, ext_output) = duplex(PIPE_CAPACITY);
    let (request_tx, request_rx) = mpsc::unbounded_channel();
    let (sent_tx, sent_rx) = mpsc::unbounded_channel();
    let (closes_tx, closes_rx) = watch::channel(0usize);

    let input = Arc::new(Mutex::new(Some(input)));
    let ext_input = Arc::new(Mutex::new(Some(ext_input)));
    let requests = Arc::new(StdMutex::new(Some(request_tx)));

    let control = MemoryControl {
        input: input.clone(),
        ext_input: ext_input.clone(),
        requests: requests.clone(),
        sent: sent_tx,
        closes: closes_tx,
        reject_requests,
    };

    let channel = SessionChannel {
        side,
        reader: Box::pin(reader),
        writer: Box::pin(writer),
        ext_reader: Box::pin(ext_reader),
        ext_writer: Box::pin(ext_writer),
        requests: request_rx,
        control: Arc::new(control),
    };
    let far = FarEnd {
        input,
        ext_input,
        requests,
        output,
        ext_output,
        sent: sent_rx,
        closes: closes_rx,
    };
    (channel, far)
}
