//! The onion-message "postman": peels incoming onion messages, delivers
//! payloads to pending subscriptions by `path_id`, and builds outgoing
//! messages over blinded routes (with self-padding for anonymity).

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use bitcoin::secp256k1::SecretKey;
use common::rng::Crng;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::{
    sphinx::{BlindedRoute, MessageSphinx, PeeledMessage},
    wire::OnionMessage,
};

/// Minimum number of hops in routes we build; shorter requests are padded
/// with self-hops so the sender's position is not obvious.
pub const MIN_ROUTE_HOPS: usize = 2;

/// A payload delivered to a subscriber.
#[derive(Clone, Debug)]
pub struct DeliveredMessage {
    pub payload: Vec<u8>,
    pub reply_path: Option<BlindedRoute>,
}

pub struct Postman {
    sphinx: Arc<dyn MessageSphinx>,
    subscriptions:
        Mutex<HashMap<[u8; 32], oneshot::Sender<DeliveredMessage>>>,
}

impl Postman {
    pub fn new(sphinx: Arc<dyn MessageSphinx>) -> Self {
        Self {
            sphinx,
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    /// Register interest in replies carrying `path_id`.
    pub fn subscribe(
        &self,
        path_id: [u8; 32],
    ) -> oneshot::Receiver<DeliveredMessage> {
        let (tx, rx) = oneshot::channel();
        self.subscriptions.lock().unwrap().insert(path_id, tx);
        rx
    }

    /// Subscribe then wait up to `timeout` for the reply.
    pub async fn await_reply(
        &self,
        path_id: [u8; 32],
        timeout: Duration,
    ) -> Option<DeliveredMessage> {
        let rx = self.subscribe(path_id);
        let delivered = tokio::time::timeout(timeout, rx).await;
        self.subscriptions.lock().unwrap().remove(&path_id);
        delivered.ok().and_then(Result::ok)
    }

    /// Build an outgoing onion message. `reply_path`, when requested, is a
    /// blinded route back to us carrying a fresh `path_id` the caller can
    /// subscribe on.
    pub fn send(
        &self,
        route: &BlindedRoute,
        payload: &[u8],
        reply_path: Option<BlindedRoute>,
    ) -> OnionMessage {
        self.sphinx.build(route, None, payload, reply_path)
    }

    /// A blinded route back to ourselves, padded to [`MIN_ROUTE_HOPS`]
    /// with self-hops, tagged with a fresh `path_id`.
    pub fn reply_route(
        &self,
        our_node_id: bitcoin::secp256k1::PublicKey,
        rng: &mut impl Crng,
    ) -> ([u8; 32], BlindedRoute) {
        let mut path_id = [0u8; 32];
        rng.fill_bytes(&mut path_id);
        let hops = vec![our_node_id; MIN_ROUTE_HOPS];
        (path_id, self.sphinx.build_route(&hops))
    }

    /// Process an incoming onion message: peel (re-entering on self-relay),
    /// deliver on subscription match, drop everything else. Returns a
    /// payload only when nobody was subscribed to it.
    pub fn process(
        &self,
        node_secret: &SecretKey,
        mut msg: OnionMessage,
    ) -> Option<DeliveredMessage> {
        // Bounded re-entry: self-padding is never deeper than a few hops.
        for _ in 0..8 {
            match self.sphinx.peel(node_secret, &msg) {
                Ok(PeeledMessage::Deliver {
                    path_id,
                    payload,
                    reply_path,
                }) => {
                    let delivered = DeliveredMessage {
                        payload,
                        reply_path,
                    };
                    if let Some(path_id) = path_id {
                        let subscriber = self
                            .subscriptions
                            .lock()
                            .unwrap()
                            .remove(&path_id);
                        if let Some(tx) = subscriber {
                            debug!("delivering onion message to subscriber");
                            // Subscriber may have timed out; then the
                            // message simply drops.
                            let _ = tx.send(delivered);
                            return None;
                        }
                    }
                    return Some(delivered);
                }
                Ok(PeeledMessage::SelfRelay(next)) => {
                    msg = next;
                    continue;
                }
                Ok(PeeledMessage::Drop) => {
                    debug!("dropping onion message not addressed to us");
                    return None;
                }
                Err(err) => {
                    warn!("failed to peel onion message: {err}");
                    return None;
                }
            }
        }
        warn!("onion message exceeded self-relay budget, dropping");
        None
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
    use common::rng::FastRng;

    use super::*;
    use crate::sphinx::fake::FakeMessageSphinx;

    fn node(byte: u8) -> (SecretKey, PublicKey) {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[byte; 32]).unwrap();
        (sk, PublicKey::from_secret_key(&secp, &sk))
    }

    #[tokio::test]
    async fn ping_reply_between_two_postmans() {
        let (sk_a, pk_a) = node(1);
        let (sk_b, pk_b) = node(2);
        let postman_a = Postman::new(Arc::new(FakeMessageSphinx));
        let postman_b = Postman::new(Arc::new(FakeMessageSphinx));
        let sphinx = FakeMessageSphinx;
        let mut rng = FastRng::from_u64(10);

        // A builds a reply path back to itself and sends a ping to B over
        // a 1-hop blinded route.
        let (path_id, reply_route) = postman_a.reply_route(pk_a, &mut rng);
        let route_to_b = sphinx.build_route(&[pk_b]);
        let ping = sphinx.build(
            &route_to_b,
            None,
            b"ping",
            Some(reply_route),
        );

        // Subscribe before the reply can possibly arrive.
        let reply_rx = postman_a.subscribe(path_id);

        // "Network": deliver A's message to B.
        let delivered = postman_b
            .process(&sk_b, ping)
            .expect("B has no subscription; payload surfaces");
        assert_eq!(delivered.payload, b"ping");
        let reply_path =
            delivered.reply_path.expect("A asked for a reply");

        // B replies over the provided path.
        let pong =
            sphinx.build(&reply_path, Some(path_id), b"pong", None);
        // "Network": deliver B's reply to A; the subscription consumes it.
        assert!(postman_a.process(&sk_a, pong).is_none());

        let delivered =
            tokio::time::timeout(Duration::from_secs(1), reply_rx)
                .await
                .expect("reply within timeout")
                .expect("subscription delivered");
        assert_eq!(delivered.payload, b"pong");
    }

    #[tokio::test]
    async fn self_padded_route_reenters_peel() {
        let (sk_a, pk_a) = node(3);
        let postman = Postman::new(Arc::new(FakeMessageSphinx));
        let sphinx = FakeMessageSphinx;

        // Two self-hops: the first peel relays back to ourselves.
        let route = sphinx.build_route(&[pk_a, pk_a]);
        let msg = sphinx.build(&route, None, b"padded", None);
        let delivered = postman.process(&sk_a, msg).expect("delivered");
        assert_eq!(delivered.payload, b"padded");
    }

    #[test]
    fn foreign_messages_are_dropped() {
        let (sk_a, _) = node(4);
        let (_, pk_other) = node(5);
        let postman = Postman::new(Arc::new(FakeMessageSphinx));
        let sphinx = FakeMessageSphinx;

        let route = sphinx.build_route(&[pk_other]);
        let msg = sphinx.build(&route, None, b"not for us", None);
        assert!(postman.process(&sk_a, msg).is_none());
    }
}
