use crate::constants::{NUM_COORDINATORS, STORE_RETRY_ATTEMPTS, STORE_RETRY_BASE_DELAY};
use crate::error::{Error, Result};
use crate::protocol::{CompId, NodeId};

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Run a store operation, retrying transient failures with jittered
/// exponential backoff. Persistent failures surface unchanged.
pub async fn retry<T, F>(mut op: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let mut delay = STORE_RETRY_BASE_DELAY;
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < STORE_RETRY_ATTEMPTS => {
                let jitter = rand::thread_rng().gen_range(0..=delay.as_millis() as u64 / 2);
                debug!("transient store failure (attempt {attempt}): {e}; retrying");
                tokio::time::sleep(delay + Duration::from_millis(jitter)).await;
                delay *= 2;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// A share received by a coordinator from one contributor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareRecord {
    pub comp_id: CompId,
    pub contributor: NodeId,
    pub share_value: u64,
    pub received_at_ms: u64,
}

/// A coordinator's column sum over the participants it counted. Derived
/// state, recomputable from the share records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialSumRecord {
    pub comp_id: CompId,
    pub partial_sum: u64,
    pub participants: BTreeSet<NodeId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Failed,
}

/// A contributor's local record of one computation: the raw private value
/// (never transmitted), the three shares, and where each one went.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseRecord {
    pub comp_id: CompId,
    pub raw_value: u64,
    pub shares: [u64; NUM_COORDINATORS],
    pub targets: [NodeId; NUM_COORDINATORS],
    pub delivery: [DeliveryStatus; NUM_COORDINATORS],
}

impl ResponseRecord {
    pub fn fully_delivered(&self) -> bool {
        self.delivery.iter().all(|d| *d == DeliveryStatus::Delivered)
    }
}

/// One entry of the per-node pending-actions log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub comp_id: CompId,
    pub kind: String,
    pub payload: serde_json::Value,
    pub created_at_ms: u64,
}

/// Durable store owned by exactly one node. Coordinators use the `shares`
/// and `partial_sums` trees, contributors the `responses` tree; both append
/// to `actions`. Single writer, concurrent readers.
pub struct NodeStore {
    db: sled::Db,
    shares: sled::Tree,
    partial_sums: sled::Tree,
    responses: sled::Tree,
    actions: sled::Tree,
}

impl NodeStore {
    /// Open the store at `path`, or an in-memory temporary store when
    /// `path` is `None`.
    pub fn open(path: Option<&Path>) -> Result<Self> {
        let db = match path {
            Some(p) => sled::open(p)?,
            None => sled::Config::new().temporary(true).open()?,
        };
        Ok(NodeStore {
            shares: db.open_tree("shares")?,
            partial_sums: db.open_tree("partial_sums")?,
            responses: db.open_tree("responses")?,
            actions: db.open_tree("actions")?,
            db,
        })
    }

    fn share_key(comp_id: &str, contributor: &str) -> Vec<u8> {
        format!("{comp_id}/{contributor}").into_bytes()
    }

    /// Insert a share, enforcing at most one per (computation, contributor).
    /// A second insert fails with `DuplicateShare` and leaves the first
    /// record untouched.
    pub async fn insert_share(&self, record: &ShareRecord) -> Result<()> {
        let key = Self::share_key(&record.comp_id, &record.contributor);
        let bytes = serde_json::to_vec(record)?;
        let prior = retry(|| {
            Ok(self
                .shares
                .compare_and_swap(&key[..], None as Option<&[u8]>, Some(&bytes[..]))?)
        })
        .await?;
        if prior.is_err() {
            return Err(Error::DuplicateShare {
                comp_id: record.comp_id.clone(),
                contributor: record.contributor.clone(),
            });
        }
        self.flush().await
    }

    pub fn share(&self, comp_id: &str, contributor: &str) -> Result<Option<ShareRecord>> {
        let key = Self::share_key(comp_id, contributor);
        match self.shares.get(&key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// All shares held for one computation, in receipt order.
    pub fn shares_for(&self, comp_id: &str) -> Result<Vec<ShareRecord>> {
        let mut records = Vec::new();
        for entry in self.shares.scan_prefix(format!("{comp_id}/").as_bytes()) {
            let (_, bytes) = entry?;
            records.push(serde_json::from_slice::<ShareRecord>(&bytes)?);
        }
        records.sort_by_key(|r| r.received_at_ms);
        Ok(records)
    }

    pub async fn put_partial_sum(&self, record: &PartialSumRecord) -> Result<()> {
        let bytes = serde_json::to_vec(record)?;
        retry(|| {
            self.partial_sums
                .insert(record.comp_id.as_bytes(), &bytes[..])?;
            Ok(())
        })
        .await?;
        self.flush().await
    }

    pub fn partial_sum(&self, comp_id: &str) -> Result<Option<PartialSumRecord>> {
        match self.partial_sums.get(comp_id.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn put_response(&self, record: &ResponseRecord) -> Result<()> {
        let bytes = serde_json::to_vec(record)?;
        retry(|| {
            self.responses
                .insert(record.comp_id.as_bytes(), &bytes[..])?;
            Ok(())
        })
        .await?;
        self.flush().await
    }

    pub fn response(&self, comp_id: &str) -> Result<Option<ResponseRecord>> {
        match self.responses.get(comp_id.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Record the outcome of one share delivery.
    pub async fn set_delivery(
        &self,
        comp_id: &str,
        target_index: usize,
        status: DeliveryStatus,
    ) -> Result<()> {
        let mut record = self
            .response(comp_id)?
            .ok_or_else(|| Error::UnknownComputation(comp_id.to_string()))?;
        record.delivery[target_index] = status;
        self.put_response(&record).await
    }

    /// Append to the pending-actions log.
    pub async fn log_action(
        &self,
        comp_id: &str,
        kind: &str,
        payload: serde_json::Value,
    ) -> Result<()> {
        let record = ActionRecord {
            comp_id: comp_id.to_string(),
            kind: kind.to_string(),
            payload,
            created_at_ms: crate::util::now_ms(),
        };
        let seq = self.db.generate_id()?;
        let key = format!("{comp_id}/{seq:020}");
        let bytes = serde_json::to_vec(&record)?;
        retry(|| {
            self.actions.insert(key.as_bytes(), &bytes[..])?;
            Ok(())
        })
        .await
    }

    pub fn actions_for(&self, comp_id: &str) -> Result<Vec<ActionRecord>> {
        let mut records = Vec::new();
        for entry in self.actions.scan_prefix(format!("{comp_id}/").as_bytes()) {
            let (_, bytes) = entry?;
            records.push(serde_json::from_slice::<ActionRecord>(&bytes)?);
        }
        Ok(records)
    }

    async fn flush(&self) -> Result<()> {
        self.db.flush_async().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::now_ms;
    use serde_json::json;

    fn store() -> NodeStore {
        NodeStore::open(None).unwrap()
    }

    fn share(comp: &str, contributor: &str, value: u64) -> ShareRecord {
        ShareRecord {
            comp_id: comp.to_string(),
            contributor: contributor.to_string(),
            share_value: value,
            received_at_ms: now_ms(),
        }
    }

    #[tokio::test]
    async fn at_most_one_share_per_contributor() {
        let store = store();
        store.insert_share(&share("COMP-1", "N-A", 17)).await.unwrap();

        let err = store
            .insert_share(&share("COMP-1", "N-A", 99))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateShare { .. }));

        // First share retained, second dropped.
        let kept = store.share("COMP-1", "N-A").unwrap().unwrap();
        assert_eq!(kept.share_value, 17);

        // Same contributor, different computation: fine.
        store.insert_share(&share("COMP-2", "N-A", 5)).await.unwrap();
        assert_eq!(store.shares_for("COMP-1").unwrap().len(), 1);
        assert_eq!(store.shares_for("COMP-2").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn partial_sum_roundtrip() {
        let store = store();
        let record = PartialSumRecord {
            comp_id: "COMP-1".to_string(),
            partial_sum: 12345,
            participants: ["N-A", "N-B"].iter().map(|s| s.to_string()).collect(),
        };
        store.put_partial_sum(&record).await.unwrap();
        assert_eq!(store.partial_sum("COMP-1").unwrap().unwrap(), record);
        assert!(store.partial_sum("COMP-2").unwrap().is_none());
    }

    #[tokio::test]
    async fn delivery_status_tracking() {
        let store = store();
        let record = ResponseRecord {
            comp_id: "COMP-1".to_string(),
            raw_value: 42,
            shares: [1, 2, 39],
            targets: ["N-C1".into(), "N-C2".into(), "N-C3".into()],
            delivery: [DeliveryStatus::Pending; 3],
        };
        store.put_response(&record).await.unwrap();
        assert!(!store.response("COMP-1").unwrap().unwrap().fully_delivered());

        for i in 0..2 {
            store
                .set_delivery("COMP-1", i, DeliveryStatus::Delivered)
                .await
                .unwrap();
        }
        store
            .set_delivery("COMP-1", 2, DeliveryStatus::Failed)
            .await
            .unwrap();

        let stored = store.response("COMP-1").unwrap().unwrap();
        assert_eq!(stored.delivery[2], DeliveryStatus::Failed);
        assert!(!stored.fully_delivered());
    }

    #[tokio::test]
    async fn action_log_is_ordered() {
        let store = store();
        store
            .log_action("COMP-1", "received_announce", json!({"from": "N-C1"}))
            .await
            .unwrap();
        store
            .log_action("COMP-1", "sent_shares", json!({"targets": 3}))
            .await
            .unwrap();
        store
            .log_action("COMP-2", "received_announce", json!({}))
            .await
            .unwrap();

        let actions = store.actions_for("COMP-1").unwrap();
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[0].kind, "received_announce");
        assert_eq!(actions[1].kind, "sent_shares");
    }

    #[tokio::test]
    async fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = NodeStore::open(Some(dir.path())).unwrap();
            store.insert_share(&share("COMP-1", "N-A", 7)).await.unwrap();
        }
        let store = NodeStore::open(Some(dir.path())).unwrap();
        assert_eq!(
            store.share("COMP-1", "N-A").unwrap().unwrap().share_value,
            7
        );
    }
}
