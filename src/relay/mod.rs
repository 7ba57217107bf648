//! A relay pair: one inbound and one outbound session channel wired together.
//!
//! Data and requests are relayed concurrently. When either data direction ends
//! both channels are closed once, the request relay is stopped and
//! [`RelayPair::run`] returns.

mod forward;
mod requests;

pub use forward::{CloseOnce, Transferred};

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

use crate::channel::{ChannelControl, IncomingRequest, SessionChannel};
use forward::Streams;

pub struct RelayPair {
    inbound: SessionChannel,
    outbound: SessionChannel,
}

impl RelayPair {
    pub fn new(inbound: SessionChannel, outbound: SessionChannel) -> Self {
        Self { inbound, outbound }
    }

    pub async fn run(self) -> Transferred {
        debug!(inbound = self.inbound.side, outbound = self.outbound.side, "relay pair started");
        let (inbound, inbound_requests, inbound_control) = split(self.inbound);
        let (outbound, outbound_requests, outbound_control) = split(self.outbound);

        let closer = CloseOnce::new(inbound_control.clone(), outbound_control.clone());
        let request_relay = tokio::spawn(requests::relay(
            inbound_requests,
            outbound_requests,
            inbound_control,
            outbound_control,
        ));

        let transferred = forward::forward(inbound, outbound, closer).await;
        request_relay.abort();
        debug!(
            to_backend = transferred.to_backend,
            to_client = transferred.to_client,
            "relay pair finished"
        );
        transferred
    }
}

fn split(channel: SessionChannel) -> (Streams, mpsc::UnboundedReceiver<IncomingRequest>, Arc<dyn ChannelControl>) {
    let SessionChannel {
        side: _,
        reader,
        writer,
        ext_reader,
        ext_writer,
        requests,
        control,
    } = channel;
    (
        Streams {
            reader,
            writer,
            ext_reader,
            ext_writer,
        },
        requests,
        control,
    )
}

#[cfg(test)]
#[path = "relay_tests.rs"]
mod tests;
