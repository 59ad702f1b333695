use futures::channel::{mpsc, oneshot};
use futures::prelude::*;

use libp2p::multiaddr::Protocol;
use libp2p::{
    core::transport::ListenerId,
    request_response::{self, OutboundRequestId, ResponseChannel},
    swarm::{Swarm, SwarmEvent},
    Multiaddr, PeerId,
};

use std::collections::HashMap;
use tracing::debug;

use crate::command::{command_handler, failure_kind, Command};
use crate::error::{Error, FailureKind, Result};
use crate::protocol::{Envelope, Reply};
use crate::transport::{Behaviour, BehaviourEvent};

/// Events surfaced from the swarm to the node runtime.
#[derive(Debug)]
pub enum Event {
    /// An inbound request together with the channel its reply must go to.
    InboundRequest {
        envelope: Envelope,
        channel: ResponseChannel<Reply>,
    },
}

/// Drives one node's swarm: applies commands from [`crate::client::Client`]
/// handles and forwards swarm events, completing the oneshot senders parked
/// in the pending maps.
///
/// The loop ends when every client handle has been dropped; under normal
/// operation the node aborts it through its cancellation token instead.
pub struct EventLoop {
    pub swarm: Swarm<Behaviour>,
    pub command_receiver: mpsc::Receiver<Command>,
    pub event_sender: mpsc::Sender<Event>,
    pub pending_listen: HashMap<ListenerId, oneshot::Sender<Result<Multiaddr>>>,
    pub pending_dial: HashMap<PeerId, Vec<oneshot::Sender<Result<()>>>>,
    pub pending_requests: HashMap<OutboundRequestId, oneshot::Sender<Result<Reply>>>,
}

impl EventLoop {
    pub fn new(
        swarm: Swarm<Behaviour>,
        command_receiver: mpsc::Receiver<Command>,
        event_sender: mpsc::Sender<Event>,
    ) -> Self {
        Self {
            swarm,
            command_receiver,
            event_sender,
            pending_listen: Default::default(),
            pending_dial: Default::default(),
            pending_requests: Default::default(),
        }
    }

    pub async fn run(mut self) {
        loop {
            futures::select! {
                event = self.swarm.next() => match event {
                    Some(e) => self.handle_event(e).await,
                    None => return,
                },
                command = self.command_receiver.next() => match command {
                    Some(c) => command_handler(&mut self, c),
                    // All clients dropped; shut the loop down.
                    None => return,
                },
            }
        }
    }

    pub fn fail_pending_dials(&mut self, peer_id: &PeerId, kind: FailureKind) {
        for sender in self.pending_dial.remove(peer_id).unwrap_or_default() {
            let _ = sender.send(Err(Error::Delivery {
                target: peer_id.to_string(),
                kind,
            }));
        }
    }

    async fn handle_event(&mut self, event: SwarmEvent<BehaviourEvent>) {
        match event {
            SwarmEvent::Behaviour(BehaviourEvent::RequestResponse(
                request_response::Event::Message { message, .. },
            )) => match message {
                request_response::Message::Request {
                    request, channel, ..
                } => {
                    // Forwarded on its own task: the loop must keep polling
                    // the swarm even when the node's handlers are saturated,
                    // or their replies could never be flushed.
                    let mut event_sender = self.event_sender.clone();
                    tokio::spawn(async move {
                        let forwarded = event_sender
                            .send(Event::InboundRequest {
                                envelope: request,
                                channel,
                            })
                            .await;
                        if forwarded.is_err() {
                            debug!("inbound request dropped: node loop is gone");
                        }
                    });
                }
                request_response::Message::Response {
                    request_id,
                    response,
                } => {
                    if let Some(sender) = self.pending_requests.remove(&request_id) {
                        let _ = sender.send(Ok(response));
                    }
                }
            },
            SwarmEvent::Behaviour(BehaviourEvent::RequestResponse(
                request_response::Event::OutboundFailure {
                    peer,
                    request_id,
                    error,
                    ..
                },
            )) => {
                debug!("request to {peer} failed: {error}");
                if let Some(sender) = self.pending_requests.remove(&request_id) {
                    let _ = sender.send(Err(Error::Delivery {
                        target: peer.to_string(),
                        kind: failure_kind(&error),
                    }));
                }
            }
            SwarmEvent::Behaviour(BehaviourEvent::RequestResponse(
                request_response::Event::InboundFailure {
                    peer,
                    request_id,
                    error,
                    ..
                },
            )) => {
                debug!("inbound request {request_id} from {peer} failed: {error}");
            }
            SwarmEvent::Behaviour(BehaviourEvent::RequestResponse(
                request_response::Event::ResponseSent { .. },
            )) => {}
            SwarmEvent::NewListenAddr {
                listener_id,
                address,
            } => {
                let local_peer_id = *self.swarm.local_peer_id();
                let full = address.with(Protocol::P2p(local_peer_id));
                debug!("listening on {full}");
                if let Some(sender) = self.pending_listen.remove(&listener_id) {
                    let _ = sender.send(Ok(full));
                }
            }
            SwarmEvent::ConnectionEstablished { peer_id, .. } => {
                for sender in self.pending_dial.remove(&peer_id).unwrap_or_default() {
                    let _ = sender.send(Ok(()));
                }
            }
            SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
                debug!("outgoing connection error: {error}");
                if let Some(peer_id) = peer_id {
                    self.fail_pending_dials(&peer_id, FailureKind::Unreachable);
                }
            }
            SwarmEvent::ConnectionClosed { .. } => {}
            SwarmEvent::IncomingConnection { .. } => {}
            SwarmEvent::IncomingConnectionError { .. } => {}
            SwarmEvent::Dialing { .. } => {}
            e => debug!("unhandled swarm event: {e:?}"),
        }
    }
}
