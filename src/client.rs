use futures::channel::{mpsc, oneshot};
use futures::prelude::*;
use libp2p::request_response::ResponseChannel;
use libp2p::{core::Multiaddr, PeerId};

use crate::command::Command;
use crate::error::{Error, Result};
use crate::protocol::{Envelope, Reply};

/// Handle for issuing commands to a node's event loop.
///
/// Cheap to clone; every clone feeds the same loop. Once the loop is gone
/// (node shut down) every operation fails with `ShutdownInProgress`.
///
/// # Examples
///
/// ```ignore
/// let addr = client.start_listening("/ip4/127.0.0.1/tcp/0".parse()?).await?;
/// client.ensure_connected(peer_id, addr.clone()).await?;
/// let reply = client.request(peer_id, envelope).await?;
/// ```
#[derive(Clone)]
pub struct Client {
    sender: mpsc::Sender<Command>,
}

impl Client {
    pub fn new(sender: mpsc::Sender<Command>) -> Self {
        Client { sender }
    }

    /// Bind the node's endpoint and return the actual listen multiaddr,
    /// `/p2p/` suffix included.
    pub async fn start_listening(&mut self, addr: Multiaddr) -> Result<Multiaddr> {
        let (sender, receiver) = oneshot::channel();
        self.send(Command::StartListening { addr, sender }).await?;
        receiver.await.map_err(|_| Error::ShutdownInProgress)?
    }

    /// Establish (or reuse) a connection to the peer at `addr`.
    pub async fn ensure_connected(&mut self, peer_id: PeerId, addr: Multiaddr) -> Result<()> {
        let (sender, receiver) = oneshot::channel();
        self.send(Command::EnsureConnected {
            peer_id,
            addr,
            sender,
        })
        .await?;
        receiver.await.map_err(|_| Error::ShutdownInProgress)?
    }

    /// Send one request to a connected peer and wait for its reply.
    pub async fn request(&mut self, peer_id: PeerId, envelope: Envelope) -> Result<Reply> {
        let (sender, receiver) = oneshot::channel();
        self.send(Command::Request {
            peer_id,
            envelope,
            sender,
        })
        .await?;
        receiver.await.map_err(|_| Error::ShutdownInProgress)?
    }

    /// Answer an inbound request on its response channel.
    pub async fn respond(&mut self, reply: Reply, channel: ResponseChannel<Reply>) -> Result<()> {
        self.send(Command::Respond { reply, channel }).await
    }

    async fn send(&mut self, command: Command) -> Result<()> {
        self.sender
            .send(command)
            .await
            .map_err(|_| Error::ShutdownInProgress)
    }
}
