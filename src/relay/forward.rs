//! Byte forwarding between the two legs, with single-fire teardown.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::io::{AsyncReadExt, AsyncWriteExt, copy};
use tracing::{debug, trace};

use crate::channel::{BoxedReader, BoxedWriter, ChannelControl};

const COPY_BUFFER: usize = 32 * 1024;

/// Closes both channels of a relay pair, once, whichever direction asks first.
pub struct CloseOnce {
    fired: AtomicBool,
    inbound: Arc<dyn ChannelControl>,
    outbound: Arc<dyn ChannelControl>,
}

impl CloseOnce {
    pub fn new(inbound: Arc<dyn ChannelControl>, outbound: Arc<dyn ChannelControl>) -> Arc<Self> {
        Arc::new(Self {
            fired: AtomicBool::new(false),
            inbound,
            outbound,
        })
    }

    /// Returns `true` for the one call that actually closed the pair.
    pub async fn close(&self, reason: &str) -> bool {
        if self.fired.swap(true, Ordering::AcqRel) {
            return false;
        }
        debug!(reason, "closing relay pair");
        if let Err(e) = self.inbound.close().await {
            debug!(error = %e, "inbound channel close failed");
        }
        if let Err(e) = self.outbound.close().await {
            debug!(error = %e, "outbound channel close failed");
        }
        true
    }

    pub fn is_closed(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}

/// Data halves of one channel.
pub struct Streams {
    pub reader: BoxedReader,
    pub writer: BoxedWriter,
    pub ext_reader: BoxedReader,
    pub ext_writer: BoxedWriter,
}

/// Bytes moved in each direction over a relay's lifetime.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Transferred {
    pub to_backend: u64,
    pub to_client: u64,
}

/// Copy both directions until one ends, then tear the pair down.
///
/// Stderr is copied alongside but its end never triggers teardown.
pub async fn forward(inbound: Streams, outbound: Streams, closer: Arc<CloseOnce>) -> Transferred {
    let to_backend = tokio::spawn(pipe("inbound->outbound", inbound.reader, outbound.writer, closer.clone()));
    let to_client = tokio::spawn(pipe("outbound->inbound", outbound.reader, inbound.writer, closer.clone()));
    let stderr_to_backend = tokio::spawn(copy_stderr("inbound->outbound", inbound.ext_reader, outbound.ext_writer));
    let stderr_to_client = tokio::spawn(copy_stderr("outbound->inbound", outbound.ext_reader, inbound.ext_writer));

    let (to_backend, to_client) = tokio::join!(to_backend, to_client);
    stderr_to_backend.abort();
    stderr_to_client.abort();

    Transferred {
        to_backend: to_backend.unwrap_or_default(),
        to_client: to_client.unwrap_or_default(),
    }
}

async fn pipe(direction: &'static str, reader: BoxedReader, writer: BoxedWriter, closer: Arc<CloseOnce>) -> u64 {
    let mut bytes = 0;
    match copy_counted(reader, writer, &mut bytes).await {
        Ok(()) => debug!(direction, bytes, "stream reached end"),
        Err(e) => debug!(direction, bytes, error = %e, "stream failed"),
    }
    closer.close(direction).await;
    bytes
}

/// Like `tokio::io::copy`, but `bytes` keeps what was written even when the copy fails.
async fn copy_counted(mut reader: BoxedReader, mut writer: BoxedWriter, bytes: &mut u64) -> std::io::Result<()> {
    let mut buf = vec![0u8; COPY_BUFFER];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        *bytes += n as u64;
    }
}

async fn copy_stderr(direction: &'static str, mut reader: BoxedReader, mut writer: BoxedWriter) {
    match copy(&mut reader, &mut writer).await {
        Ok(bytes) => trace!(direction, bytes, "stderr stream ended"),
        Err(e) => trace!(direction, error = %e, "stderr stream failed"),
    }
}
