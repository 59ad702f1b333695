//! # Tallynet: Private Map, Secure Reduce
//!
//! Tallynet is a privacy-preserving aggregation network. It computes the sum
//! (and derived mean) of private numeric values held by a set of contributor
//! nodes without revealing any individual value to any single coordinator.
//!
//! ## The protocol
//!
//! Every computation is pinned to exactly three **coordinator** nodes. Each
//! **contributor** produces its value locally, splits it into three additive
//! shares modulo 2^32, and delivers one share to each coordinator. A single
//! share is a uniformly random number: a coordinator holding one column of
//! shares learns nothing. At the computation's deadline the primary
//! coordinator collects the other two column sums, aligns the participant
//! sets, and reconstructs
//!
//! ```ignore
//! result = (S1 + S2 + S3) mod 2^32 = sum of all contributed values mod 2^32
//! ```
//!
//! so only the aggregate ever becomes visible. Contributors whose shares did
//! not reach all three coordinators are silently excluded from the result;
//! the reconstruction would otherwise be corrupted.
//!
//! ## The lifecycle
//!
//! propose → init → announce → contribute → aggregate → reveal → finalize.
//! A computation either completes with a result or fails (init timeout,
//! threshold not met); both outcomes land on the shared registry where
//! `await_result` observes them.
//!
//! ## Example
//!
//! ```ignore
//! use tallynet::config::Settings;
//! use tallynet::network::Network;
//! use std::time::Duration;
//!
//! let mut network = Network::new(Settings::ephemeral()).await?;
//! network.start_network(3, 5).await?;
//! let comp_id = network
//!     .propose_computation("How many incidents did you see last month?", 30, 1)
//!     .await?;
//! let record = network.await_result(&comp_id, Duration::from_secs(60)).await?;
//! println!("sum: {:?}, mean: {:?}", record.result, record.mean());
//! network.shutdown().await?;
//! ```

/// The `aggregator` module tracks the shares a coordinator received for one
/// computation and implements the participant-alignment step of the reveal.
pub mod aggregator;

/// The `client` module provides the handle a node's tasks use to drive its
/// event loop: listening, dialing, sending requests and answering them.
pub mod client;

/// The `command` module defines the commands flowing from [`client::Client`]
/// handles into the event loop, and applies them to the swarm.
pub mod command;

/// The `config` module loads runtime settings from `conf.toml` and the
/// environment.
pub mod config;

/// The `constants` module collects the protocol constants: the modulus, the
/// coordinator count, retry and timing windows.
pub mod constants;

/// The `error` module defines the crate-wide error taxonomy.
pub mod error;

/// The `event` module runs a node's swarm event loop and surfaces inbound
/// requests to the node runtime.
pub mod event;

/// The `messaging` module is the delivery substrate: registry endpoint
/// resolution, bounded retries with exponential backoff, and concurrent
/// broadcast with per-target outcomes.
pub mod messaging;

/// The `network` module is the façade external collaborators use: start a
/// network, propose computations, await results, shut everything down.
pub mod network;

/// The `node` module hosts the two node runtimes: the coordinator state
/// machine (init, broadcast, collect, reveal) and the contributor state
/// machine (respond, split, deliver).
pub mod node;

/// The `protocol` module defines the wire messages nodes exchange.
pub mod protocol;

/// The `registry` module is the shared store of node and computation
/// records: the single source of truth for endpoints and status.
pub mod registry;

/// The `sharing` module implements the additive secret-sharing primitive.
pub mod sharing;

/// The `store` module is the per-node durable store: shares and partial
/// sums on coordinators, responses on contributors, an action log on both.
pub mod store;

/// The `transport` module builds the libp2p swarm each node runs on.
pub mod transport;

/// The `util` module holds small helpers: id generation and clock math.
pub mod util;

pub use error::{Error, Result};
