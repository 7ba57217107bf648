//! Out-of-band request relay.
//!
//! Each direction is a sequential loop, so requests keep their order and a
//! want-reply request is answered before the next one from the same peer is
//! forwarded. The two directions run concurrently inside one task.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::channel::{ChannelControl, IncomingRequest, RequestReply};

pub async fn relay(
    inbound_requests: mpsc::UnboundedReceiver<IncomingRequest>,
    outbound_requests: mpsc::UnboundedReceiver<IncomingRequest>,
    inbound: Arc<dyn ChannelControl>,
    outbound: Arc<dyn ChannelControl>,
) {
    tokio::join!(
        forward_direction("inbound->outbound", inbound_requests, outbound),
        forward_direction("outbound->inbound", outbound_requests, inbound),
    );
}

async fn forward_direction(
    direction: &'static str,
    mut requests: mpsc::UnboundedReceiver<IncomingRequest>,
    target: Arc<dyn ChannelControl>,
) {
    while let Some(IncomingRequest { request, reply }) = requests.recv().await {
        let kind = request.kind();
        let want_reply = reply.is_some();
        trace!(direction, kind, want_reply, "forwarding channel request");

        match target.send_request(request, want_reply).await {
            Ok(answer) => {
                if let Some(reply) = reply {
                    let answer = answer.unwrap_or_else(RequestReply::failure);
                    debug!(direction, kind, success = answer.success, "relaying request reply");
                    let _ = reply.send(answer);
                }
            }
            Err(e) => {
                warn!(direction, kind, error = %e, "failed to forward channel request");
                if let Some(reply) = reply {
                    let _ = reply.send(RequestReply::failure());
                }
            }
        }
    }
    debug!(direction, "request stream ended");
}
