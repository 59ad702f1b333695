use crate::client::Client;
use crate::constants::{IDLE_CONNECTION_TIMEOUT, PROTOCOL_NAME, REQUEST_TIMEOUT};
use crate::error::Error;
use crate::event::{Event, EventLoop};
use crate::protocol::{Envelope, Reply};

use futures::channel::mpsc;
use futures::prelude::*;

use libp2p::request_response::ProtocolSupport;
use libp2p::{
    identity, noise, request_response, swarm::NetworkBehaviour, tcp, yamux, PeerId, StreamProtocol,
};
use tracing::debug;

/// Channel depth between a node's `Client` handles and its event loop.
const COMMAND_BUFFER: usize = 32;
const EVENT_BUFFER: usize = 32;

/// Network behaviour for one node: a single CBOR request/response protocol.
///
/// Peer discovery is deliberately absent; the shared registry is the only
/// directory of endpoints, and peers are dialed by the multiaddr stored
/// there.
#[derive(NetworkBehaviour)]
pub struct Behaviour {
    pub request_response: request_response::cbor::Behaviour<Envelope, Reply>,
}

/// Build the swarm for one node and return the pieces the node runtime
/// needs: a cloneable [`Client`], the inbound event stream, the
/// [`EventLoop`] to spawn, and the node's peer id.
///
/// # Examples
///
/// ```ignore
/// let (client, events, event_loop, peer_id) = transport::new()?;
/// tokio::spawn(event_loop.run());
/// ```
pub fn new() -> crate::error::Result<(Client, impl Stream<Item = Event>, EventLoop, PeerId)> {
    let id_keys = identity::Keypair::generate_ed25519();
    let peer_id = id_keys.public().to_peer_id();
    debug!("local peer id: {peer_id}");

    let swarm = libp2p::SwarmBuilder::with_existing_identity(id_keys)
        .with_tokio()
        .with_tcp(
            tcp::Config::default(),
            noise::Config::new,
            yamux::Config::default,
        )
        .map_err(|e| Error::Fatal(format!("tcp transport: {e}")))?
        .with_behaviour(|_key| Behaviour {
            request_response: request_response::cbor::Behaviour::new(
                [(StreamProtocol::new(PROTOCOL_NAME), ProtocolSupport::Full)],
                request_response::Config::default().with_request_timeout(REQUEST_TIMEOUT),
            ),
        })
        .map_err(|e| Error::Fatal(format!("behaviour: {e}")))?
        .with_swarm_config(|c| c.with_idle_connection_timeout(IDLE_CONNECTION_TIMEOUT))
        .build();

    let (command_sender, command_receiver) = mpsc::channel(COMMAND_BUFFER);
    let (event_sender, event_receiver) = mpsc::channel(EVENT_BUFFER);

    Ok((
        Client::new(command_sender),
        event_receiver,
        EventLoop::new(swarm, command_receiver, event_sender),
        peer_id,
    ))
}
