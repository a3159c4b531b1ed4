//! Domain events and the broadcast event bus the orchestrator exposes to
//! the application layer (UI, notifiers).

use bitcoin::Txid;
use common::amount::Amount;
use tokio::sync::broadcast;
use tracing::debug;

use crate::{
    channel::ChannelId,
    payments::{
        ClosingType, FinalFailure, PaymentHash, PaymentId, PaymentPreimage,
    },
};

/// Events published on the node event bus.
#[derive(Clone, Debug)]
pub enum NodeEvent {
    /// An incoming payment (or an additional part of one) settled.
    PaymentReceived {
        payment_hash: PaymentHash,
        amount: Amount,
    },
    /// An outgoing payment made progress: one part settled.
    PaymentProgress {
        payment_id: PaymentId,
        fees_paid: Amount,
    },
    /// An outgoing payment fully succeeded.
    PaymentSent {
        payment_id: PaymentId,
        preimage: PaymentPreimage,
        fees_paid: Amount,
    },
    /// An outgoing payment terminally failed.
    PaymentNotSent {
        payment_id: PaymentId,
        reason: FinalFailure,
        part_failures: Vec<String>,
    },
    ChannelOpened {
        channel_id: ChannelId,
    },
    ChannelClosing {
        channel_id: ChannelId,
        closing_type: ClosingType,
    },
    ChannelClosed {
        channel_id: ChannelId,
    },
    SpliceLocked {
        channel_id: ChannelId,
        funding_txid: Txid,
    },
    /// A peer-held channel backup requires a newer app version.
    UpgradeRequired {
        channel_id: ChannelId,
    },
    /// Migration info received from the legacy wallet.
    LegacyInfo {
        has_channels: bool,
    },
}

/// A broadcast bus with a small replay buffer. Subscribers that fall too
/// far behind observe a `Lagged` error rather than blocking the node.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<NodeEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(64);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: NodeEvent) {
        debug!(?event, "emitting node event");
        // No subscribers is fine; events are advisory.
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.emit(NodeEvent::LegacyInfo { has_channels: true });
        match rx.recv().await.unwrap() {
            NodeEvent::LegacyInfo { has_channels } => {
                assert!(has_channels);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn emitting_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.emit(NodeEvent::LegacyInfo { has_channels: false });
    }
}
