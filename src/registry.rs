use crate::error::{Error, Result};
use crate::protocol::{CompId, ComputationSpec, NodeId, NodeRole};
use crate::sharing;
use crate::store::retry;

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Lifecycle of a node row. Rows are removed entirely once teardown is
/// confirmed, so `Stopped` only appears transiently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Active,
    Stopping,
    Stopped,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeStatus::Active => write!(f, "active"),
            NodeStatus::Stopping => write!(f, "stopping"),
            NodeStatus::Stopped => write!(f, "stopped"),
        }
    }
}

/// One registry row per node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: NodeId,
    pub role: NodeRole,
    /// Full multiaddr including the `/p2p/<peer-id>` suffix; unique among
    /// active nodes.
    pub endpoint: String,
    pub status: NodeStatus,
    pub created_at_ms: u64,
}

/// Computation lifecycle. Progresses strictly forward; `Failed` is terminal
/// and reachable from every non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompStatus {
    Pending,
    Broadcasting,
    Collecting,
    Revealing,
    Completed,
    Failed,
}

impl CompStatus {
    fn rank(self) -> u8 {
        match self {
            CompStatus::Pending => 0,
            CompStatus::Broadcasting => 1,
            CompStatus::Collecting => 2,
            CompStatus::Revealing => 3,
            CompStatus::Completed => 4,
            CompStatus::Failed => 4,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, CompStatus::Completed | CompStatus::Failed)
    }
}

impl std::fmt::Display for CompStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CompStatus::Pending => "pending",
            CompStatus::Broadcasting => "broadcasting",
            CompStatus::Collecting => "collecting",
            CompStatus::Revealing => "revealing",
            CompStatus::Completed => "completed",
            CompStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// One registry row per computation: the wire metadata plus the
/// authoritative outcome fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputationRecord {
    pub spec: ComputationSpec,
    pub status: CompStatus,
    pub fail_reason: Option<String>,
    pub result: Option<u64>,
    pub participants_count: Option<usize>,
    pub completed_at_ms: Option<u64>,
}

impl ComputationRecord {
    pub fn new(spec: ComputationSpec) -> Self {
        ComputationRecord {
            spec,
            status: CompStatus::Pending,
            fail_reason: None,
            result: None,
            participants_count: None,
            completed_at_ms: None,
        }
    }

    pub fn id(&self) -> &CompId {
        &self.spec.comp_id
    }

    /// Derived mean of the reconstructed sum, for completed computations.
    pub fn mean(&self) -> Option<f64> {
        match (self.result, self.participants_count) {
            (Some(sum), Some(n)) => sharing::mean(sum, n),
            _ => None,
        }
    }
}

/// The shared registry store: the single source of truth for node endpoints
/// and computation status. One sled database with a `nodes` and a
/// `computations` tree; every locally spawned node and the façade hold
/// clones of the same handle.
///
/// Mutations are serialized by an internal async mutex (the per-record
/// critical section of the design) and flushed before returning, so a row
/// that was acknowledged survives a crash.
#[derive(Clone)]
pub struct Registry {
    db: sled::Db,
    nodes: sled::Tree,
    computations: sled::Tree,
    write_lock: Arc<Mutex<()>>,
}

impl Registry {
    /// Open the registry at `path`, or an in-memory temporary store when
    /// `path` is `None`.
    pub fn open(path: Option<&Path>) -> Result<Self> {
        let db = match path {
            Some(p) => sled::open(p)?,
            None => sled::Config::new().temporary(true).open()?,
        };
        let nodes = db.open_tree("nodes")?;
        let computations = db.open_tree("computations")?;
        Ok(Registry {
            db,
            nodes,
            computations,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    /// Drop node rows left behind by a previous run under the same home
    /// directory. Endpoints in those rows are dead and would otherwise
    /// collide with fresh registrations.
    pub async fn sweep_stale_nodes(&self) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        let stale: Vec<NodeRecord> = self.all_nodes()?;
        for node in &stale {
            self.nodes.remove(node.id.as_bytes())?;
        }
        if !stale.is_empty() {
            info!("swept {} stale node rows from a previous run", stale.len());
            self.flush().await?;
        }
        Ok(stale.len())
    }

    /// Register a node. The id must be new and the endpoint unique among
    /// active nodes; registration is the network-wide endpoint-allocation
    /// critical section.
    pub async fn register_node(&self, record: &NodeRecord) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let clash = self
            .all_nodes()?
            .into_iter()
            .any(|n| n.status == NodeStatus::Active && n.endpoint == record.endpoint);
        if clash {
            return Err(Error::precondition(format!(
                "endpoint {} already registered",
                record.endpoint
            )));
        }
        let bytes = serde_json::to_vec(record)?;
        let prior = retry(|| {
            Ok(self
                .nodes
                .compare_and_swap(record.id.as_bytes(), None as Option<&[u8]>, Some(&bytes[..]))?)
        })
        .await?;
        if prior.is_err() {
            return Err(Error::precondition(format!(
                "node {} already registered",
                record.id
            )));
        }
        self.flush().await?;
        debug!("registered {} node {} at {}", record.role, record.id, record.endpoint);
        Ok(())
    }

    pub async fn set_node_status(&self, id: &str, status: NodeStatus) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut record = self
            .node(id)?
            .ok_or_else(|| Error::precondition(format!("unknown node {id}")))?;
        record.status = status;
        let bytes = serde_json::to_vec(&record)?;
        retry(|| {
            self.nodes.insert(id.as_bytes(), &bytes[..])?;
            Ok(())
        })
        .await?;
        self.flush().await
    }

    /// Remove a node row once teardown is confirmed.
    pub async fn remove_node(&self, id: &str) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let removed = self.nodes.remove(id.as_bytes())?.is_some();
        self.flush().await?;
        Ok(removed)
    }

    pub fn node(&self, id: &str) -> Result<Option<NodeRecord>> {
        match self.nodes.get(id.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// All node rows, oldest first (spawn order).
    pub fn all_nodes(&self) -> Result<Vec<NodeRecord>> {
        let mut nodes = Vec::new();
        for entry in self.nodes.iter() {
            let (_, bytes) = entry?;
            nodes.push(serde_json::from_slice::<NodeRecord>(&bytes)?);
        }
        nodes.sort_by(|a, b| {
            a.created_at_ms
                .cmp(&b.created_at_ms)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(nodes)
    }

    pub fn active_nodes_by_role(&self, role: NodeRole) -> Result<Vec<NodeRecord>> {
        Ok(self
            .all_nodes()?
            .into_iter()
            .filter(|n| n.role == role && n.status == NodeStatus::Active)
            .collect())
    }

    /// Insert a new computation row. Re-inserting an existing id is
    /// rejected, which is what makes `propose` idempotent at the registry.
    pub async fn insert_computation(&self, record: &ComputationRecord) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let bytes = serde_json::to_vec(record)?;
        let prior = retry(|| {
            Ok(self.computations.compare_and_swap(
                record.id().as_bytes(),
                None as Option<&[u8]>,
                Some(&bytes[..]),
            )?)
        })
        .await?;
        if prior.is_err() {
            return Err(Error::precondition(format!(
                "computation {} already exists",
                record.id()
            )));
        }
        self.flush().await?;
        info!("recorded computation {}", record.id());
        Ok(())
    }

    pub fn computation(&self, comp_id: &str) -> Result<Option<ComputationRecord>> {
        match self.computations.get(comp_id.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// All computation rows, most recent first.
    pub fn list_computations(&self) -> Result<Vec<ComputationRecord>> {
        let mut comps = Vec::new();
        for entry in self.computations.iter() {
            let (_, bytes) = entry?;
            comps.push(serde_json::from_slice::<ComputationRecord>(&bytes)?);
        }
        comps.sort_by(|a, b| b.spec.created_at_ms.cmp(&a.spec.created_at_ms));
        Ok(comps)
    }

    /// Advance a computation's status. Transitions must move strictly
    /// forward; `Failed` is accepted from any non-terminal state; writing
    /// the current status again is a no-op.
    pub async fn update_status(
        &self,
        comp_id: &str,
        status: CompStatus,
        fail_reason: Option<String>,
    ) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut record = self
            .computation(comp_id)?
            .ok_or_else(|| Error::UnknownComputation(comp_id.to_string()))?;
        if record.status == status {
            return Ok(());
        }
        if record.status.is_terminal() {
            return Err(Error::precondition(format!(
                "computation {comp_id} already {}",
                record.status
            )));
        }
        if status != CompStatus::Failed && status.rank() <= record.status.rank() {
            return Err(Error::precondition(format!(
                "computation {comp_id} cannot move {} -> {}",
                record.status, status
            )));
        }
        record.status = status;
        if status.is_terminal() {
            record.completed_at_ms = Some(crate::util::now_ms());
            record.fail_reason = fail_reason;
        }
        self.put_computation(&record).await?;
        info!("computation {comp_id} -> {status}");
        Ok(())
    }

    /// Write the final result; only valid while the computation is live.
    pub async fn complete_computation(
        &self,
        comp_id: &str,
        result: u64,
        participants_count: usize,
    ) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut record = self
            .computation(comp_id)?
            .ok_or_else(|| Error::UnknownComputation(comp_id.to_string()))?;
        if record.status.is_terminal() {
            return Err(Error::precondition(format!(
                "computation {comp_id} already {}",
                record.status
            )));
        }
        record.status = CompStatus::Completed;
        record.result = Some(result);
        record.participants_count = Some(participants_count);
        record.completed_at_ms = Some(crate::util::now_ms());
        self.put_computation(&record).await?;
        info!(
            "computation {comp_id} completed: result {result}, {participants_count} participants"
        );
        Ok(())
    }

    pub async fn clear_computations(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.computations.clear()?;
        self.flush().await
    }

    async fn put_computation(&self, record: &ComputationRecord) -> Result<()> {
        let bytes = serde_json::to_vec(record)?;
        retry(|| {
            self.computations.insert(record.id().as_bytes(), &bytes[..])?;
            Ok(())
        })
        .await?;
        self.flush().await
    }

    async fn flush(&self) -> Result<()> {
        self.db.flush_async().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::SCHEMA_TAG_U32;
    use crate::util::{deadline_ms_from_now, now_ms};

    fn registry() -> Registry {
        Registry::open(None).unwrap()
    }

    fn node(id: &str, role: NodeRole, endpoint: &str) -> NodeRecord {
        NodeRecord {
            id: id.to_string(),
            role,
            endpoint: endpoint.to_string(),
            status: NodeStatus::Active,
            created_at_ms: now_ms(),
        }
    }

    fn computation(id: &str) -> ComputationRecord {
        ComputationRecord::new(ComputationSpec {
            comp_id: id.to_string(),
            proposer: "N-PROPOSER".to_string(),
            coordinators: [
                "N-C1".to_string(),
                "N-C2".to_string(),
                "N-C3".to_string(),
            ],
            prompt: "test".to_string(),
            schema_tag: SCHEMA_TAG_U32.to_string(),
            deadline_ms: deadline_ms_from_now(30),
            min_participants: 1,
            created_at_ms: now_ms(),
        })
    }

    #[tokio::test]
    async fn node_ids_and_endpoints_are_unique() {
        let registry = registry();
        let a = node("N-1", NodeRole::Coordinator, "/ip4/127.0.0.1/tcp/9001/p2p/A");
        registry.register_node(&a).await.unwrap();

        // Same id again.
        assert!(registry.register_node(&a).await.is_err());

        // Same endpoint, different id.
        let b = node("N-2", NodeRole::Contributor, "/ip4/127.0.0.1/tcp/9001/p2p/A");
        assert!(registry.register_node(&b).await.is_err());

        // A stopped node releases its endpoint.
        registry
            .set_node_status("N-1", NodeStatus::Stopped)
            .await
            .unwrap();
        registry.register_node(&b).await.unwrap();
    }

    #[tokio::test]
    async fn role_listing_skips_inactive_nodes() {
        let registry = registry();
        for (id, role, ep) in [
            ("N-1", NodeRole::Coordinator, "/e/1"),
            ("N-2", NodeRole::Contributor, "/e/2"),
            ("N-3", NodeRole::Contributor, "/e/3"),
        ] {
            registry.register_node(&node(id, role, ep)).await.unwrap();
        }
        registry
            .set_node_status("N-3", NodeStatus::Stopping)
            .await
            .unwrap();

        let contributors = registry
            .active_nodes_by_role(NodeRole::Contributor)
            .unwrap();
        assert_eq!(contributors.len(), 1);
        assert_eq!(contributors[0].id, "N-2");
    }

    #[tokio::test]
    async fn duplicate_computation_is_rejected() {
        let registry = registry();
        let record = computation("COMP-1");
        registry.insert_computation(&record).await.unwrap();
        assert!(registry.insert_computation(&record).await.is_err());
    }

    #[tokio::test]
    async fn status_progresses_monotonically() {
        let registry = registry();
        registry.insert_computation(&computation("COMP-1")).await.unwrap();

        registry
            .update_status("COMP-1", CompStatus::Broadcasting, None)
            .await
            .unwrap();
        registry
            .update_status("COMP-1", CompStatus::Collecting, None)
            .await
            .unwrap();

        // Backwards is refused.
        assert!(registry
            .update_status("COMP-1", CompStatus::Pending, None)
            .await
            .is_err());

        // Re-writing the current status is a no-op.
        registry
            .update_status("COMP-1", CompStatus::Collecting, None)
            .await
            .unwrap();

        // Failed is reachable from any live state and is terminal.
        registry
            .update_status("COMP-1", CompStatus::Failed, Some("threshold not met".into()))
            .await
            .unwrap();
        assert!(registry
            .update_status("COMP-1", CompStatus::Revealing, None)
            .await
            .is_err());

        let record = registry.computation("COMP-1").unwrap().unwrap();
        assert_eq!(record.status, CompStatus::Failed);
        assert_eq!(record.fail_reason.as_deref(), Some("threshold not met"));
        assert!(record.result.is_none());
    }

    #[tokio::test]
    async fn completion_writes_result_and_mean() {
        let registry = registry();
        registry.insert_computation(&computation("COMP-1")).await.unwrap();
        registry
            .complete_computation("COMP-1", 103, 3)
            .await
            .unwrap();

        let record = registry.computation("COMP-1").unwrap().unwrap();
        assert_eq!(record.status, CompStatus::Completed);
        assert_eq!(record.result, Some(103));
        assert_eq!(record.participants_count, Some(3));
        assert_eq!(record.mean(), Some(103.0 / 3.0));

        // Terminal rows never change again.
        assert!(registry.complete_computation("COMP-1", 9, 1).await.is_err());
    }

    #[tokio::test]
    async fn stale_rows_are_swept() {
        let dir = tempfile::tempdir().unwrap();
        {
            let registry = Registry::open(Some(dir.path())).unwrap();
            registry
                .register_node(&node("N-OLD", NodeRole::Coordinator, "/e/old"))
                .await
                .unwrap();
        }
        let registry = Registry::open(Some(dir.path())).unwrap();
        assert_eq!(registry.sweep_stale_nodes().await.unwrap(), 1);
        assert!(registry.all_nodes().unwrap().is_empty());
    }
}
