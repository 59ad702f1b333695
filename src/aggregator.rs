use crate::error::{Error, Result};
use crate::protocol::{CompId, NodeId};
use crate::sharing::add_mod;
use crate::store::ShareRecord;

use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Per-computation share collection on one coordinator: the share column
/// received from each contributor, keyed by contributor id.
///
/// The aggregator never inspects share values beyond modular addition; in
/// particular shares are never compared by value.
#[derive(Debug)]
pub struct Aggregator {
    comp_id: CompId,
    min_participants: usize,
    shares: BTreeMap<NodeId, u64>,
}

impl Aggregator {
    pub fn new(comp_id: impl Into<CompId>, min_participants: usize) -> Self {
        Aggregator {
            comp_id: comp_id.into(),
            min_participants,
            shares: BTreeMap::new(),
        }
    }

    /// Rebuild the in-memory state from persisted share records, e.g. after
    /// a restart. Later duplicates in the input are ignored, matching the
    /// first-share-wins rule.
    pub fn from_records(
        comp_id: impl Into<CompId>,
        min_participants: usize,
        records: &[ShareRecord],
    ) -> Self {
        let mut aggregator = Aggregator::new(comp_id, min_participants);
        for record in records {
            let _ = aggregator.add_share(&record.contributor, record.share_value);
        }
        aggregator
    }

    /// Record a contributor's share. At most one share per contributor is
    /// kept; a second one fails with `DuplicateShare` and the first is
    /// retained.
    pub fn add_share(&mut self, contributor: &str, share_value: u64) -> Result<()> {
        if self.shares.contains_key(contributor) {
            return Err(Error::DuplicateShare {
                comp_id: self.comp_id.clone(),
                contributor: contributor.to_string(),
            });
        }
        self.shares.insert(contributor.to_string(), share_value);
        debug!(
            "computation {}: share {} of {} recorded from {contributor}",
            self.comp_id,
            self.shares.len(),
            self.min_participants,
        );
        Ok(())
    }

    pub fn comp_id(&self) -> &CompId {
        &self.comp_id
    }

    pub fn min_participants(&self) -> usize {
        self.min_participants
    }

    pub fn len(&self) -> usize {
        self.shares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shares.is_empty()
    }

    /// Contributors this coordinator counted.
    pub fn participants(&self) -> BTreeSet<NodeId> {
        self.shares.keys().cloned().collect()
    }

    /// Restrict to the intersection of the local participant set with a
    /// proposed set, and sum the local share column over that intersection.
    ///
    /// This is the alignment step of the reveal: a contributor whose share
    /// reached only some of the coordinators must be dropped by all of them
    /// or the reconstructed sum would be corrupted.
    pub fn restricted_sum(&self, proposed: &BTreeSet<NodeId>) -> (u64, BTreeSet<NodeId>) {
        let intersection: BTreeSet<NodeId> = self
            .shares
            .keys()
            .filter(|id| proposed.contains(*id))
            .cloned()
            .collect();
        let sum = intersection
            .iter()
            .fold(0, |acc, id| add_mod(acc, self.shares[id]));
        (sum, intersection)
    }

    /// Whether a participant set of the given size clears the threshold.
    pub fn meets_threshold(&self, participants: usize) -> bool {
        participants >= self.min_participants
    }
}

/// The aligned participant set: contributors counted by all three
/// coordinators. Inputs are the two responders' restricted sets (already
/// intersected with the primary's proposal).
pub fn aligned_set(a2: &BTreeSet<NodeId>, a3: &BTreeSet<NodeId>) -> BTreeSet<NodeId> {
    a2.intersection(a3).cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sharing::{reconstruct, split};

    fn ids(names: &[&str]) -> BTreeSet<NodeId> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn duplicate_share_is_rejected_and_first_kept() {
        let mut aggregator = Aggregator::new("COMP-1", 1);
        aggregator.add_share("N-A", 10).unwrap();
        let err = aggregator.add_share("N-A", 99).unwrap_err();
        assert!(matches!(err, Error::DuplicateShare { .. }));

        let (sum, set) = aggregator.restricted_sum(&ids(&["N-A"]));
        assert_eq!(sum, 10);
        assert_eq!(set, ids(&["N-A"]));
    }

    #[test]
    fn restricted_sum_intersects_with_the_proposal() {
        let mut aggregator = Aggregator::new("COMP-1", 1);
        aggregator.add_share("N-A", 5).unwrap();
        aggregator.add_share("N-B", 7).unwrap();
        aggregator.add_share("N-C", 11).unwrap();

        // N-D is proposed but unseen here; N-C is local but not proposed.
        let (sum, set) = aggregator.restricted_sum(&ids(&["N-A", "N-B", "N-D"]));
        assert_eq!(set, ids(&["N-A", "N-B"]));
        assert_eq!(sum, 12);
    }

    #[test]
    fn threshold_boundary() {
        let mut aggregator = Aggregator::new("COMP-1", 2);
        assert!(!aggregator.meets_threshold(1));
        assert!(aggregator.meets_threshold(2));
        aggregator.add_share("N-A", 1).unwrap();
        assert_eq!(aggregator.len(), 1);
    }

    #[test]
    fn rebuild_from_records_ignores_later_duplicates() {
        let records = vec![
            ShareRecord {
                comp_id: "COMP-1".into(),
                contributor: "N-A".into(),
                share_value: 3,
                received_at_ms: 1,
            },
            ShareRecord {
                comp_id: "COMP-1".into(),
                contributor: "N-A".into(),
                share_value: 9,
                received_at_ms: 2,
            },
        ];
        let aggregator = Aggregator::from_records("COMP-1", 1, &records);
        let (sum, _) = aggregator.restricted_sum(&ids(&["N-A"]));
        assert_eq!(sum, 3);
    }

    /// A full three-coordinator reveal in miniature: contributor N-B's share
    /// only reaches two of the three columns, so alignment must drop N-B
    /// everywhere and the reconstructed total must cover N-A and N-C only.
    #[test]
    fn partial_delivery_is_excluded_by_alignment() {
        let values = [("N-A", 10u64), ("N-B", 20), ("N-C", 30)];
        let mut columns = [
            Aggregator::new("COMP-1", 1),
            Aggregator::new("COMP-1", 1),
            Aggregator::new("COMP-1", 1),
        ];

        for (contributor, value) in values {
            let shares = split(value).unwrap();
            for (i, aggregator) in columns.iter_mut().enumerate() {
                // N-B's delivery to the third coordinator failed permanently.
                if contributor == "N-B" && i == 2 {
                    continue;
                }
                aggregator.add_share(contributor, shares[i]).unwrap();
            }
        }

        // Primary proposes its own participant set.
        let proposed = columns[0].participants();
        assert_eq!(proposed, ids(&["N-A", "N-B", "N-C"]));

        let (_, a2) = columns[1].restricted_sum(&proposed);
        let (_, a3) = columns[2].restricted_sum(&proposed);
        let aligned = aligned_set(&a2, &a3);
        assert_eq!(aligned, ids(&["N-A", "N-C"]));

        // Every column recomputes over the aligned set; the two coordinators
        // still holding N-B's share exclude it.
        let (s1, _) = columns[0].restricted_sum(&aligned);
        let (s2, _) = columns[1].restricted_sum(&aligned);
        let (s3, _) = columns[2].restricted_sum(&aligned);
        assert_eq!(reconstruct(&[s1, s2, s3]), 40);
    }

    #[test]
    fn column_sums_reconstruct_the_aggregate() {
        let values = [("N-A", 11u64), ("N-B", 20), ("N-C", 72)];
        let mut columns = [
            Aggregator::new("COMP-1", 1),
            Aggregator::new("COMP-1", 1),
            Aggregator::new("COMP-1", 1),
        ];
        for (contributor, value) in values {
            let shares = split(value).unwrap();
            for (i, aggregator) in columns.iter_mut().enumerate() {
                aggregator.add_share(contributor, shares[i]).unwrap();
            }
        }
        let all = columns[0].participants();
        let sums: Vec<u64> = columns
            .iter()
            .map(|c| c.restricted_sum(&all).0)
            .collect();
        assert_eq!(reconstruct(&sums), 103);
    }
}
