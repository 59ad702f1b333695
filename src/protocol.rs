use crate::constants::NUM_COORDINATORS;
use crate::util::now_ms;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Short opaque node identifier (`N-xxxxxxxx`).
pub type NodeId = String;
/// Computation identifier (`COMP-xxxxxxxx`).
pub type CompId = String;

/// The two closed node roles. A node's role never changes after spawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    Coordinator,
    Contributor,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRole::Coordinator => write!(f, "coordinator"),
            NodeRole::Contributor => write!(f, "contributor"),
        }
    }
}

/// Authoritative metadata for one computation, carried verbatim by
/// `propose`, `init` and `announce` and mirrored into the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputationSpec {
    pub comp_id: CompId,
    pub proposer: NodeId,
    /// Ordered: the first entry is the primary coordinator.
    pub coordinators: [NodeId; NUM_COORDINATORS],
    pub prompt: String,
    pub schema_tag: String,
    /// Absolute deadline, unix milliseconds UTC. No share is accepted after
    /// this instant.
    pub deadline_ms: u64,
    pub min_participants: usize,
    pub created_at_ms: u64,
}

impl ComputationSpec {
    pub fn primary(&self) -> &NodeId {
        &self.coordinators[0]
    }

    pub fn secondaries(&self) -> &[NodeId] {
        &self.coordinators[1..]
    }

    /// Position of `node` in the coordinator list, if it is one of the three.
    pub fn coordinator_index(&self, node: &str) -> Option<usize> {
        self.coordinators.iter().position(|c| c == node)
    }

    pub fn deadline_passed(&self, at_ms: u64) -> bool {
        at_ms > self.deadline_ms
    }
}

/// Envelope around every request: sender identity plus a monotonic
/// wall-clock timestamp. The receiving side never trusts the timestamp for
/// deadline decisions, only its own clock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub sender: NodeId,
    pub timestamp_ms: u64,
    pub body: Request,
}

impl Envelope {
    pub fn new(sender: impl Into<NodeId>, body: Request) -> Self {
        Envelope {
            sender: sender.into(),
            timestamp_ms: now_ms(),
            body,
        }
    }
}

/// Requests exchanged between nodes.
///
/// `Propose` reaches the primary coordinator only; `Init` flows primary →
/// secondaries; `Announce` flows primary → contributors; `Share` flows
/// contributor → each coordinator; `Reveal` flows primary → secondaries at
/// the deadline. `Health` is a liveness probe any node answers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    Propose(ProposeRequest),
    Init(InitRequest),
    Announce(AnnounceRequest),
    Share(ShareRequest),
    Reveal(RevealRequest),
    Health(HealthRequest),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposeRequest {
    pub spec: ComputationSpec,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitRequest {
    pub spec: ComputationSpec,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnounceRequest {
    pub spec: ComputationSpec,
}

/// One share column value for one computation. `share_index` is the
/// 0-based coordinator position the share is intended for; a coordinator
/// rejects a share addressed to a different column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareRequest {
    pub comp_id: CompId,
    pub share_value: u64,
    pub share_index: u8,
}

/// The primary's proposed participant set at reveal time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevealRequest {
    pub comp_id: CompId,
    pub participants: BTreeSet<NodeId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthRequest;

/// Typed replies. `InitAck` answers `Init`, `PartialSum` answers `Reveal`,
/// `Health` answers `Health`; everything else is answered with an `Ack`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reply {
    Ack(AckReply),
    InitAck(InitAckReply),
    PartialSum(PartialSumReply),
    Health(HealthReply),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckReply {
    pub accepted: bool,
    pub info: Option<String>,
}

impl AckReply {
    pub fn accepted() -> Reply {
        Reply::Ack(AckReply {
            accepted: true,
            info: None,
        })
    }

    pub fn accepted_with(info: impl Into<String>) -> Reply {
        Reply::Ack(AckReply {
            accepted: true,
            info: Some(info.into()),
        })
    }

    pub fn rejected(info: impl Into<String>) -> Reply {
        Reply::Ack(AckReply {
            accepted: false,
            info: Some(info.into()),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitAckReply {
    pub comp_id: CompId,
    pub ready: bool,
}

/// A responder's share-column sum restricted to the intersection of its own
/// participant set with the primary's proposal, together with that
/// intersection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialSumReply {
    pub comp_id: CompId,
    pub partial_sum: u64,
    pub participants: BTreeSet<NodeId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReply {
    pub node: NodeId,
    pub role: NodeRole,
    pub status: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use cbor4ii::serde::to_vec;
    use serde::Deserialize;

    #[track_caller]
    fn de<'a, T>(bytes: &'a [u8], _value: &T) -> T
    where
        T: Deserialize<'a>,
    {
        serde_cbor::from_slice(bytes).unwrap()
    }

    macro_rules! assert_roundtrip {
        ( $value:expr ) => {{
            let buf = to_vec(Vec::new(), &$value).unwrap();
            let value = de(&buf, &$value);
            assert_eq!(value, $value);
        }};
    }

    fn spec() -> ComputationSpec {
        ComputationSpec {
            comp_id: "COMP-0A1B2C3D".to_string(),
            proposer: "N-FACADE01".to_string(),
            coordinators: [
                "N-AAAA0001".to_string(),
                "N-AAAA0002".to_string(),
                "N-AAAA0003".to_string(),
            ],
            prompt: "How many incidents last month?".to_string(),
            schema_tag: "u32".to_string(),
            deadline_ms: 1_700_000_000_000,
            min_participants: 2,
            created_at_ms: 1_699_999_000_000,
        }
    }

    #[test]
    fn serialize_deserialize_envelope() {
        let envelope = Envelope::new("N-AAAA0001", Request::Propose(ProposeRequest { spec: spec() }));
        assert_roundtrip!(envelope);
    }

    #[test]
    fn serialize_deserialize_share_request() {
        let request = Request::Share(ShareRequest {
            comp_id: "COMP-0A1B2C3D".to_string(),
            share_value: 4_294_967_295,
            share_index: 2,
        });
        assert_roundtrip!(request);
    }

    #[test]
    fn serialize_deserialize_reveal_request() {
        let mut participants = BTreeSet::new();
        participants.insert("N-BBBB0001".to_string());
        participants.insert("N-BBBB0002".to_string());
        let request = Request::Reveal(RevealRequest {
            comp_id: "COMP-0A1B2C3D".to_string(),
            participants,
        });
        assert_roundtrip!(request);
    }

    #[test]
    fn serialize_deserialize_replies() {
        assert_roundtrip!(AckReply::rejected("late share"));
        assert_roundtrip!(Reply::InitAck(InitAckReply {
            comp_id: "COMP-0A1B2C3D".to_string(),
            ready: true,
        }));
        let mut participants = BTreeSet::new();
        participants.insert("N-BBBB0001".to_string());
        let partial_sum_reply = Reply::PartialSum(PartialSumReply {
            comp_id: "COMP-0A1B2C3D".to_string(),
            partial_sum: 103,
            participants,
        });
        assert_roundtrip!(partial_sum_reply);
        assert_roundtrip!(Reply::Health(HealthReply {
            node: "N-AAAA0001".to_string(),
            role: NodeRole::Coordinator,
            status: "active".to_string(),
        }));
    }

    #[test]
    fn coordinator_positions() {
        let spec = spec();
        assert_eq!(spec.primary(), "N-AAAA0001");
        assert_eq!(spec.secondaries().len(), 2);
        assert_eq!(spec.coordinator_index("N-AAAA0003"), Some(2));
        assert_eq!(spec.coordinator_index("N-CCCC0009"), None);
        assert!(spec.deadline_passed(spec.deadline_ms + 1));
        assert!(!spec.deadline_passed(spec.deadline_ms));
    }
}
