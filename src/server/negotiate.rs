//! Channel-open decisions for one inbound connection.
//!
//! The protocol handler turns every channel-open into a [`ChannelOpen`] and
//! waits for a decision. The first `session` wins; anything else before it ends
//! the connection, anything after it is refused.

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::error::{BastionError, BastionResult};

pub const SESSION: &str = "session";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    UnknownChannelType,
    AdministrativelyProhibited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenDecision {
    Accept,
    Reject(RejectReason),
}

/// A pending channel-open request.
pub struct ChannelOpen<C> {
    pub kind: String,
    pub channel: C,
    decision: oneshot::Sender<OpenDecision>,
}

impl<C> ChannelOpen<C> {
    pub fn new(kind: impl Into<String>, channel: C) -> (Self, oneshot::Receiver<OpenDecision>) {
        let (decision, rx) = oneshot::channel();
        let open = Self {
            kind: kind.into(),
            channel,
            decision,
        };
        (open, rx)
    }

    fn accept(self) -> C {
        let _ = self.decision.send(OpenDecision::Accept);
        self.channel
    }

    fn reject(self, reason: RejectReason) {
        let _ = self.decision.send(OpenDecision::Reject(reason));
    }
}

/// Wait for the session channel.
///
/// Returns `Ok(None)` when the connection ends before any channel is opened and
/// [`BastionError::UnknownChannelType`] when the first open is not a session.
pub async fn accept_session<C>(opens: &mut mpsc::Receiver<ChannelOpen<C>>) -> BastionResult<Option<C>> {
    let Some(open) = opens.recv().await else {
        return Ok(None);
    };
    if open.kind == SESSION {
        return Ok(Some(open.accept()));
    }

    let kind = open.kind.clone();
    open.reject(RejectReason::UnknownChannelType);
    Err(BastionError::UnknownChannelType(kind))
}

/// Refuse every later channel-open until the connection goes away.
pub async fn reject_additional<C>(mut opens: mpsc::Receiver<ChannelOpen<C>>) {
    while let Some(open) = opens.recv().await {
        debug!(kind = %open.kind, "only one session per connection; rejecting channel");
        open.reject(RejectReason::AdministrativelyProhibited);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn offer(tx: &mpsc::Sender<ChannelOpen<u32>>, kind: &str, id: u32) -> oneshot::Receiver<OpenDecision> {
        let (open, decision) = ChannelOpen::new(kind, id);
        tx.send(open).await.unwrap();
        decision
    }

    #[tokio::test]
    async fn first_session_is_accepted() {
        let (tx, mut rx) = mpsc::channel(4);
        let decision = offer(&tx, "session", 7).await;

        let channel = accept_session(&mut rx).await.unwrap();
        assert_eq!(channel, Some(7));
        assert_eq!(decision.await.unwrap(), OpenDecision::Accept);
    }

    #[tokio::test]
    async fn non_session_first_is_rejected_with_its_type() {
        let (tx, mut rx) = mpsc::channel(4);
        let decision = offer(&tx, "direct-tcpip", 1).await;

        let err = accept_session(&mut rx).await.unwrap_err();
        match err {
            BastionError::UnknownChannelType(kind) => assert_eq!(kind, "direct-tcpip"),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(
            decision.await.unwrap(),
            OpenDecision::Reject(RejectReason::UnknownChannelType)
        );
    }

    #[tokio::test]
    async fn closed_connection_yields_none() {
        let (tx, mut rx) = mpsc::channel::<ChannelOpen<u32>>(4);
        drop(tx);
        assert!(accept_session(&mut rx).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn later_opens_are_prohibited() {
        let (tx, mut rx) = mpsc::channel(4);
        offer(&tx, "session", 1).await;
        accept_session(&mut rx).await.unwrap();
        let rejecter = tokio::spawn(reject_additional(rx));

        let second = offer(&tx, "session", 2).await;
        let forward = offer(&tx, "direct-tcpip", 3).await;
        assert_eq!(
            second.await.unwrap(),
            OpenDecision::Reject(RejectReason::AdministrativelyProhibited)
        );
        assert_eq!(
            forward.await.unwrap(),
            OpenDecision::Reject(RejectReason::AdministrativelyProhibited)
        );

        drop(tx);
        rejecter.await.unwrap();
    }
}
