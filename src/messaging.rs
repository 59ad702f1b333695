use crate::client::Client;
use crate::constants::{
    BROADCAST_CONCURRENCY, MAX_SEND_ATTEMPTS, REQUEST_TIMEOUT, RETRY_BASE_DELAY, RETRY_MAX_DELAY,
};
use crate::error::{Error, FailureKind, Result};
use crate::protocol::{Envelope, NodeId, Reply, Request};
use crate::registry::Registry;

use futures::future::FutureExt;
use libp2p::{multiaddr::Protocol, Multiaddr, PeerId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// Outcome of one logical delivery (all retries included).
#[derive(Debug)]
pub enum Delivery {
    Delivered(Reply),
    Failed(FailureKind),
}

impl Delivery {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Delivery::Delivered(_))
    }

    pub fn reply(&self) -> Option<&Reply> {
        match self {
            Delivery::Delivered(reply) => Some(reply),
            Delivery::Failed(_) => None,
        }
    }

    /// Delivered with an accepting ack (or any typed reply).
    pub fn is_accepted(&self) -> bool {
        match self {
            Delivery::Delivered(Reply::Ack(ack)) => ack.accepted,
            Delivery::Delivered(_) => true,
            Delivery::Failed(_) => false,
        }
    }
}

/// Split a registry endpoint into the peer to talk to and the address to
/// dial. Endpoints always carry a trailing `/p2p/<peer-id>` component.
pub fn parse_endpoint(endpoint: &str) -> Result<(PeerId, Multiaddr)> {
    let addr: Multiaddr = endpoint
        .parse()
        .map_err(|e| Error::precondition(format!("bad endpoint {endpoint}: {e}")))?;
    match addr.iter().last() {
        Some(Protocol::P2p(peer_id)) => Ok((peer_id, addr)),
        _ => Err(Error::precondition(format!(
            "endpoint {endpoint} is missing its /p2p/ component"
        ))),
    }
}

/// Point-to-point delivery with registry endpoint resolution, bounded
/// exponential-backoff retries and a concurrent fan-out broadcast.
///
/// Cloneable; all clones share the sending node's transport client and the
/// broadcast concurrency limiter.
#[derive(Clone)]
pub struct Messenger {
    node_id: NodeId,
    client: Client,
    registry: Registry,
    limiter: Arc<Semaphore>,
}

impl Messenger {
    pub fn new(node_id: impl Into<NodeId>, client: Client, registry: Registry) -> Self {
        Messenger {
            node_id: node_id.into(),
            client,
            registry,
            limiter: Arc::new(Semaphore::new(BROADCAST_CONCURRENCY)),
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Deliver one request to `target`, retrying up to the attempt bound
    /// with exponential backoff (200ms base, 2s cap, 5s per attempt).
    ///
    /// Never returns an error: the outcome is reported as a [`Delivery`] so
    /// broadcasts can carry per-target results.
    pub async fn send(&self, target: &str, request: Request) -> Delivery {
        let endpoint = match self.registry.node(target) {
            Ok(Some(record)) => record.endpoint,
            Ok(None) => {
                warn!("no registry row for {target}; cannot deliver");
                return Delivery::Failed(FailureKind::Unreachable);
            }
            Err(e) => {
                warn!("registry lookup for {target} failed: {e}");
                return Delivery::Failed(FailureKind::Unreachable);
            }
        };
        let (peer_id, addr) = match parse_endpoint(&endpoint) {
            Ok(resolved) => resolved,
            Err(e) => {
                warn!("{e}");
                return Delivery::Failed(FailureKind::Unreachable);
            }
        };

        let mut delay = RETRY_BASE_DELAY;
        let mut last = FailureKind::Unreachable;
        for attempt in 1..=MAX_SEND_ATTEMPTS {
            match self.attempt(peer_id, addr.clone(), request.clone()).await {
                Ok(reply) => return Delivery::Delivered(reply),
                Err(kind) => {
                    debug!("delivery to {target} attempt {attempt} failed: {kind}");
                    last = kind;
                }
            }
            if attempt < MAX_SEND_ATTEMPTS {
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(RETRY_MAX_DELAY);
            }
        }
        warn!("delivery to {target} failed after {MAX_SEND_ATTEMPTS} attempts: {last}");
        Delivery::Failed(last)
    }

    async fn attempt(
        &self,
        peer_id: PeerId,
        addr: Multiaddr,
        request: Request,
    ) -> std::result::Result<Reply, FailureKind> {
        let mut client = self.client.clone();
        let envelope = Envelope::new(self.node_id.clone(), request);
        let exchange = async move {
            client.ensure_connected(peer_id, addr).await?;
            client.request(peer_id, envelope).await
        };
        match tokio::time::timeout(REQUEST_TIMEOUT, exchange).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(Error::Delivery { kind, .. })) => Err(kind),
            Ok(Err(_)) => Err(FailureKind::Unreachable),
            Err(_) => Err(FailureKind::Timeout),
        }
    }

    /// Concurrently deliver `request` to every target, bounded in flight.
    /// Individual failures never abort the fan-out; each target's outcome
    /// is reported in the returned map.
    pub async fn broadcast(
        &self,
        targets: &[NodeId],
        request: &Request,
    ) -> HashMap<NodeId, Delivery> {
        let sends = targets.iter().map(|target| {
            let messenger = self.clone();
            let target = target.clone();
            let request = request.clone();
            async move {
                let _permit = messenger.limiter.acquire().await.ok();
                let outcome = messenger.send(&target, request).await;
                (target, outcome)
            }
            .boxed()
        });
        futures::future::join_all(sends).await.into_iter().collect()
    }

    /// Liveness probe: one `Health` round trip.
    pub async fn probe(&self, target: &str) -> bool {
        matches!(
            self.send(target, Request::Health(crate::protocol::HealthRequest))
                .await,
            Delivery::Delivered(Reply::Health(_))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_endpoints() {
        let peer = PeerId::random();
        let endpoint = format!("/ip4/127.0.0.1/tcp/9100/p2p/{peer}");
        let (parsed_peer, addr) = parse_endpoint(&endpoint).unwrap();
        assert_eq!(parsed_peer, peer);
        assert_eq!(addr.to_string(), endpoint);
    }

    #[test]
    fn rejects_endpoints_without_peer_component() {
        assert!(parse_endpoint("/ip4/127.0.0.1/tcp/9100").is_err());
        assert!(parse_endpoint("not a multiaddr").is_err());
    }

    #[test]
    fn delivery_acceptance() {
        use crate::protocol::AckReply;
        assert!(Delivery::Delivered(AckReply::accepted()).is_accepted());
        assert!(!Delivery::Delivered(AckReply::rejected("late share")).is_accepted());
        assert!(!Delivery::Failed(FailureKind::Timeout).is_accepted());
        assert!(Delivery::Failed(FailureKind::Timeout).reply().is_none());
    }
}
