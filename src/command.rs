use futures::channel::oneshot;
use libp2p::request_response::ResponseChannel;
use libp2p::{core::Multiaddr, PeerId};
use tracing::debug;

use crate::error::{Error, FailureKind, Result};
use crate::event::EventLoop;
use crate::protocol::{Envelope, Reply};

/// Commands issued to a node's event loop.
///
/// Every command that expects an outcome carries a oneshot sender the loop
/// completes once the swarm reports the result.
#[derive(Debug)]
pub enum Command {
    /// Bind the node's endpoint; resolves with the actual listen multiaddr
    /// (including the `/p2p/` suffix) once the listener is ready.
    StartListening {
        addr: Multiaddr,
        sender: oneshot::Sender<Result<Multiaddr>>,
    },
    /// Make sure a connection to `peer_id` exists, dialing `addr` if not.
    EnsureConnected {
        peer_id: PeerId,
        addr: Multiaddr,
        sender: oneshot::Sender<Result<()>>,
    },
    /// Send one request and resolve with the peer's reply.
    Request {
        peer_id: PeerId,
        envelope: Envelope,
        sender: oneshot::Sender<Result<Reply>>,
    },
    /// Answer an inbound request.
    Respond {
        reply: Reply,
        channel: ResponseChannel<Reply>,
    },
}

/// Apply one command to the swarm owned by `eventloop`.
pub fn command_handler(eventloop: &mut EventLoop, command: Command) {
    match command {
        Command::StartListening { addr, sender } => match eventloop.swarm.listen_on(addr) {
            Ok(listener_id) => {
                eventloop.pending_listen.insert(listener_id, sender);
            }
            Err(e) => {
                let _ = sender.send(Err(Error::Fatal(format!("listen: {e}"))));
            }
        },
        Command::EnsureConnected {
            peer_id,
            addr,
            sender,
        } => {
            if eventloop.swarm.is_connected(&peer_id) {
                let _ = sender.send(Ok(()));
                return;
            }
            let dialing = eventloop.pending_dial.contains_key(&peer_id);
            eventloop.pending_dial.entry(peer_id).or_default().push(sender);
            if dialing {
                return;
            }
            if let Err(e) = eventloop.swarm.dial(addr.clone()) {
                debug!("dial of {addr} failed to start: {e}");
                eventloop.fail_pending_dials(
                    &peer_id,
                    FailureKind::Unreachable,
                );
            }
        }
        Command::Request {
            peer_id,
            envelope,
            sender,
        } => {
            let request_id = eventloop
                .swarm
                .behaviour_mut()
                .request_response
                .send_request(&peer_id, envelope);
            eventloop.pending_requests.insert(request_id, sender);
        }
        Command::Respond { reply, channel } => {
            if eventloop
                .swarm
                .behaviour_mut()
                .request_response
                .send_response(channel, reply)
                .is_err()
            {
                // Requester went away before we answered; nothing to do.
                debug!("response channel closed before reply was sent");
            }
        }
    }
}

/// Map a request/response outbound failure onto the delivery taxonomy.
pub fn failure_kind(error: &libp2p::request_response::OutboundFailure) -> FailureKind {
    use libp2p::request_response::OutboundFailure;
    match error {
        OutboundFailure::Timeout => FailureKind::Timeout,
        OutboundFailure::UnsupportedProtocols => FailureKind::Rejected,
        OutboundFailure::DialFailure
        | OutboundFailure::ConnectionClosed
        | OutboundFailure::Io(_) => FailureKind::Unreachable,
    }
}
