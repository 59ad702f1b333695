use crate::config::Settings;
use crate::constants::{
    DRAIN_WINDOW, NUM_COORDINATORS, POLL_INTERVAL, SCHEMA_TAG_U32, STARTUP_WINDOW,
};
use crate::error::{Error, Result};
use crate::messaging::{Delivery, Messenger};
use crate::node::{Node, NodeOptions, ResponsePolicy};
use crate::protocol::{
    CompId, ComputationSpec, NodeId, NodeRole, ProposeRequest, Reply, Request,
};
use crate::registry::{CompStatus, ComputationRecord, NodeRecord, Registry};
use crate::transport;
use crate::util::{deadline_ms_from_now, new_comp_id, new_node_id, now_ms};

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// The node ids a started network handed out, per role.
#[derive(Debug, Clone)]
pub struct NetworkTopology {
    pub coordinators: Vec<NodeId>,
    pub contributors: Vec<NodeId>,
}

/// Snapshot of the registry's node table.
#[derive(Debug, Clone)]
pub struct NetworkStatus {
    pub nodes: Vec<NodeRecord>,
    pub coordinator_count: usize,
    pub contributor_count: usize,
}

/// The single entry point for external collaborators: owns the registry,
/// spawns and supervises every node, and drives proposals through the
/// primary coordinator.
///
/// # Examples
///
/// ```ignore
/// let mut network = Network::new(Settings::ephemeral())?;
/// network.start_network(3, 5).await?;
/// let comp_id = network
///     .propose_computation("How many incidents last month?", 30, 1)
///     .await?;
/// let record = network.await_result(&comp_id, Duration::from_secs(60)).await?;
/// println!("sum = {:?}", record.result);
/// network.shutdown().await?;
/// ```
pub struct Network {
    settings: Settings,
    facade_id: NodeId,
    registry: Registry,
    messenger: Messenger,
    nodes: Vec<Node>,
    root_token: CancellationToken,
    facade_task: Option<JoinHandle<()>>,
    running: bool,
}

impl Network {
    /// Build the façade: open the registry, sweep rows left by previous
    /// runs, and bring up the façade's own outbound-only transport.
    pub async fn new(settings: Settings) -> Result<Self> {
        let registry = Registry::open(settings.registry_path().as_deref())?;
        registry.sweep_stale_nodes().await?;

        let root_token = CancellationToken::new();
        let (client, _events, event_loop, _peer_id) = transport::new()?;
        let loop_token = root_token.clone();
        let facade_task = tokio::spawn(async move {
            tokio::select! {
                _ = loop_token.cancelled() => {}
                _ = event_loop.run() => {}
            }
        });

        let facade_id = new_node_id();
        let messenger = Messenger::new(facade_id.clone(), client, registry.clone());

        Ok(Network {
            settings,
            facade_id,
            registry,
            messenger,
            nodes: Vec::new(),
            root_token,
            facade_task: Some(facade_task),
            running: false,
        })
    }

    /// Spawn the network: exactly three coordinators plus `num_contributors`
    /// contributors. Returns once every node is registered and answering
    /// health probes; fails with `NetworkStartupFailed` if any node misses
    /// the startup window.
    pub async fn start_network(
        &mut self,
        num_coordinators: usize,
        num_contributors: usize,
    ) -> Result<NetworkTopology> {
        if self.running {
            return Err(Error::precondition("network is already running"));
        }
        if num_coordinators != NUM_COORDINATORS {
            return Err(Error::precondition(format!(
                "the three-party reveal requires exactly {NUM_COORDINATORS} coordinators, got {num_coordinators}"
            )));
        }

        info!(
            "starting network: {num_coordinators} coordinators, {num_contributors} contributors"
        );
        let mut coordinators = Vec::with_capacity(num_coordinators);
        let mut contributors = Vec::with_capacity(num_contributors);

        for _ in 0..num_coordinators {
            coordinators.push(self.spawn_node(NodeRole::Coordinator, None).await?);
        }
        for _ in 0..num_contributors {
            contributors.push(self.spawn_node(NodeRole::Contributor, None).await?);
        }

        self.running = true;
        info!(
            "network up: coordinators {coordinators:?}, contributors {contributors:?}"
        );
        Ok(NetworkTopology {
            coordinators,
            contributors,
        })
    }

    /// Add one contributor with the default response policy.
    pub async fn add_contributor(&mut self) -> Result<NodeId> {
        self.add_contributor_with_policy(None).await
    }

    /// Add one contributor with a caller-supplied response policy.
    pub async fn add_contributor_with_policy(
        &mut self,
        policy: Option<Arc<dyn ResponsePolicy>>,
    ) -> Result<NodeId> {
        if !self.running {
            return Err(Error::precondition("network is not running"));
        }
        self.spawn_node(NodeRole::Contributor, policy).await
    }

    async fn spawn_node(
        &mut self,
        role: NodeRole,
        policy: Option<Arc<dyn ResponsePolicy>>,
    ) -> Result<NodeId> {
        let node = Node::spawn(NodeOptions {
            role,
            registry: self.registry.clone(),
            store_root: self.settings.node_store_root(),
            policy,
            token: self.root_token.child_token(),
        })
        .await
        .map_err(|e| Error::NetworkStartupFailed(format!("{role} node spawn: {e}")))?;
        let id = node.id().clone();

        // The node is registered; now make sure it actually answers.
        let deadline = Instant::now() + STARTUP_WINDOW;
        loop {
            if self.messenger.probe(&id).await {
                break;
            }
            if Instant::now() >= deadline {
                let _ = node.shutdown(DRAIN_WINDOW).await;
                return Err(Error::NetworkStartupFailed(format!(
                    "node {id} did not answer a health probe within {STARTUP_WINDOW:?}"
                )));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }

        self.nodes.push(node);
        Ok(id)
    }

    /// Propose a computation. Writes the registry record, routes the
    /// proposal to the primary coordinator, and returns the computation id
    /// as soon as the primary acknowledges acceptance.
    pub async fn propose_computation(
        &self,
        prompt: &str,
        deadline_seconds: u64,
        min_participants: usize,
    ) -> Result<CompId> {
        if deadline_seconds == 0 {
            return Err(Error::precondition("deadline_seconds must be positive"));
        }
        if min_participants == 0 {
            return Err(Error::precondition("min_participants must be at least 1"));
        }
        let coordinators = self.registry.active_nodes_by_role(NodeRole::Coordinator)?;
        if coordinators.len() < NUM_COORDINATORS {
            return Err(Error::precondition(format!(
                "need at least {NUM_COORDINATORS} coordinators, have {}",
                coordinators.len()
            )));
        }

        let designated: [NodeId; NUM_COORDINATORS] = [
            coordinators[0].id.clone(),
            coordinators[1].id.clone(),
            coordinators[2].id.clone(),
        ];
        let spec = ComputationSpec {
            comp_id: new_comp_id(),
            proposer: self.facade_id.clone(),
            coordinators: designated,
            prompt: prompt.to_string(),
            schema_tag: SCHEMA_TAG_U32.to_string(),
            deadline_ms: deadline_ms_from_now(deadline_seconds),
            min_participants,
            created_at_ms: now_ms(),
        };
        let comp_id = spec.comp_id.clone();
        let primary = spec.primary().clone();

        self.registry
            .insert_computation(&ComputationRecord::new(spec.clone()))
            .await?;

        info!(
            "proposing computation {comp_id}: \"{prompt}\" (deadline {deadline_seconds}s, min {min_participants})"
        );
        let outcome = self
            .messenger
            .send(&primary, Request::Propose(ProposeRequest { spec }))
            .await;
        match outcome {
            Delivery::Delivered(Reply::Ack(ack)) if ack.accepted => Ok(comp_id),
            Delivery::Delivered(reply) => {
                warn!("primary refused computation {comp_id}: {reply:?}");
                let _ = self
                    .registry
                    .update_status(&comp_id, CompStatus::Failed, Some("propose refused".into()))
                    .await;
                Err(Error::ComputationFailed {
                    comp_id,
                    reason: "primary refused the proposal".into(),
                })
            }
            Delivery::Failed(kind) => {
                warn!("primary unreachable for computation {comp_id}: {kind}");
                let _ = self
                    .registry
                    .update_status(
                        &comp_id,
                        CompStatus::Failed,
                        Some("propose undeliverable".into()),
                    )
                    .await;
                Err(Error::ComputationFailed {
                    comp_id,
                    reason: format!("propose undeliverable: {kind}"),
                })
            }
        }
    }

    /// Poll the registry until the computation reaches a terminal status or
    /// the caller's timeout elapses. Never affects the computation itself.
    pub async fn await_result(
        &self,
        comp_id: &str,
        timeout: Duration,
    ) -> Result<ComputationRecord> {
        let deadline = Instant::now() + timeout;
        loop {
            let record = self
                .registry
                .computation(comp_id)?
                .ok_or_else(|| Error::UnknownComputation(comp_id.to_string()))?;
            match record.status {
                CompStatus::Completed => return Ok(record),
                CompStatus::Failed => {
                    return Err(Error::ComputationFailed {
                        comp_id: comp_id.to_string(),
                        reason: record
                            .fail_reason
                            .unwrap_or_else(|| "unknown reason".to_string()),
                    })
                }
                _ => {}
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout(timeout));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Current registry record for one computation.
    pub fn status(&self, comp_id: &str) -> Result<Option<ComputationRecord>> {
        self.registry.computation(comp_id)
    }

    /// All computations, most recent first.
    pub fn list_computations(&self) -> Result<Vec<ComputationRecord>> {
        self.registry.list_computations()
    }

    /// Snapshot of the node table with per-role counts.
    pub fn network_status(&self) -> Result<NetworkStatus> {
        let nodes = self.registry.all_nodes()?;
        let coordinator_count = nodes
            .iter()
            .filter(|n| n.role == NodeRole::Coordinator)
            .count();
        let contributor_count = nodes
            .iter()
            .filter(|n| n.role == NodeRole::Contributor)
            .count();
        Ok(NetworkStatus {
            nodes,
            coordinator_count,
            contributor_count,
        })
    }

    /// Graceful teardown of every owned node, then registry cleanup.
    pub async fn shutdown(&mut self) -> Result<()> {
        if !self.running && self.nodes.is_empty() {
            self.root_token.cancel();
            if let Some(task) = self.facade_task.take() {
                task.abort();
            }
            return Ok(());
        }
        info!("shutting down network ({} nodes)", self.nodes.len());

        for node in self.nodes.drain(..) {
            if let Err(e) = node.shutdown(DRAIN_WINDOW).await {
                warn!("node teardown: {e}");
            }
        }
        self.registry.clear_computations().await?;

        self.root_token.cancel();
        if let Some(task) = self.facade_task.take() {
            let _ = tokio::time::timeout(DRAIN_WINDOW, task).await;
        }
        self.running = false;
        info!("network shutdown complete");
        Ok(())
    }
}
