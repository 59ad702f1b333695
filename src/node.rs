use crate::aggregator::{aligned_set, Aggregator};
use crate::client::Client;
use crate::constants::{
    INIT_WINDOW, MAX_INFLIGHT_HANDLERS, MODULUS, NUM_COORDINATORS, PENDING_QUEUE_LIMIT,
    PENDING_WINDOW,
};
use crate::error::{Error, Result};
use crate::event::Event;
use crate::messaging::{Delivery, Messenger};
use crate::protocol::{
    AckReply, AnnounceRequest, CompId, ComputationSpec, Envelope, HealthReply, InitAckReply,
    InitRequest, NodeId, NodeRole, PartialSumReply, ProposeRequest, Reply, Request, RevealRequest,
    ShareRequest,
};
use crate::registry::{CompStatus, NodeRecord, NodeStatus, Registry};
use crate::sharing;
use crate::store::{DeliveryStatus, NodeStore, PartialSumRecord, ResponseRecord, ShareRecord};
use crate::transport;
use crate::util::{new_node_id, now_ms, until_ms};

use futures::future::FutureExt;
use futures::prelude::*;
use libp2p::request_response::ResponseChannel;
use rand::Rng;
use serde_json::json;
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Local policy producing a contributor's private value for a computation.
/// The value never leaves the contributor in cleartext; the runtime only
/// requires it to be in [0, 2^32).
pub trait ResponsePolicy: Send + Sync {
    fn produce(&self, spec: &ComputationSpec) -> u64;
}

/// Reference policy: a uniform integer in [0, max].
pub struct UniformResponse {
    pub max: u64,
}

impl Default for UniformResponse {
    fn default() -> Self {
        UniformResponse {
            max: crate::constants::DEFAULT_RESPONSE_MAX,
        }
    }
}

impl ResponsePolicy for UniformResponse {
    fn produce(&self, _spec: &ComputationSpec) -> u64 {
        rand::thread_rng().gen_range(0..=self.max)
    }
}

/// Deterministic policy, used by drivers that need known inputs.
pub struct FixedResponse(pub u64);

impl ResponsePolicy for FixedResponse {
    fn produce(&self, _spec: &ComputationSpec) -> u64 {
        self.0
    }
}

/// Coordinator-side lifecycle of one computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CoordPhase {
    Ready,
    Broadcasting,
    Collecting,
    Revealing,
    Finalized,
    Failed,
}

struct CoordComp {
    spec: ComputationSpec,
    phase: CoordPhase,
    aggregator: Aggregator,
}

impl CoordComp {
    fn accepting_shares(&self) -> bool {
        matches!(
            self.phase,
            CoordPhase::Ready | CoordPhase::Broadcasting | CoordPhase::Collecting
        )
    }
}

/// A message that referenced a computation this node has not installed yet
/// (an init/share race). Held briefly, then evicted.
struct Parked {
    envelope: Envelope,
    channel: ResponseChannel<Reply>,
    seq: u64,
}

struct CoordinatorState {
    comps: Mutex<HashMap<CompId, Arc<Mutex<CoordComp>>>>,
    parked: Mutex<HashMap<CompId, Vec<Parked>>>,
    parked_count: AtomicUsize,
    parked_seq: AtomicU64,
}

impl CoordinatorState {
    fn new() -> Self {
        CoordinatorState {
            comps: Mutex::new(HashMap::new()),
            parked: Mutex::new(HashMap::new()),
            parked_count: AtomicUsize::new(0),
            parked_seq: AtomicU64::new(0),
        }
    }
}

struct ContributorState {
    policy: Arc<dyn ResponsePolicy>,
    /// Computations already answered (or being answered); a re-announce of
    /// any of these is a no-op.
    processed: Mutex<std::collections::HashSet<CompId>>,
}

/// Per-role state: two closed variants over a shared node substrate.
enum RoleState {
    Coordinator(CoordinatorState),
    Contributor(ContributorState),
}

struct Inner {
    id: NodeId,
    role: NodeRole,
    registry: Registry,
    store: NodeStore,
    messenger: Messenger,
    client: Client,
    token: CancellationToken,
    role_state: RoleState,
}

/// Options for spawning one node into the local network.
pub struct NodeOptions {
    pub role: NodeRole,
    pub registry: Registry,
    /// Root directory for per-node stores; the node stores under
    /// `<root>/<id>`. `None` keeps the store in memory.
    pub store_root: Option<PathBuf>,
    /// Contributor response policy; ignored for coordinators.
    pub policy: Option<Arc<dyn ResponsePolicy>>,
    /// Cancellation token, usually a child of the network root token.
    pub token: CancellationToken,
}

/// A running node and the handle the façade keeps for it.
pub struct Node {
    id: NodeId,
    role: NodeRole,
    endpoint: String,
    registry: Registry,
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    /// Spawn a node: build its transport, bind its endpoint, open its
    /// store, register it, and start its event and dispatch loops.
    pub async fn spawn(opts: NodeOptions) -> Result<Node> {
        let id = new_node_id();
        let (mut client, events, event_loop, _peer_id) = transport::new()?;

        let loop_token = opts.token.clone();
        let event_loop_task = tokio::spawn(async move {
            tokio::select! {
                _ = loop_token.cancelled() => {}
                _ = event_loop.run() => {}
            }
        });

        let endpoint = match client
            .start_listening("/ip4/127.0.0.1/tcp/0".parse().expect("static multiaddr"))
            .await
        {
            Ok(addr) => addr.to_string(),
            Err(e) => {
                opts.token.cancel();
                event_loop_task.abort();
                return Err(e);
            }
        };

        let store_path = opts.store_root.as_ref().map(|root| root.join(&id));
        let store = NodeStore::open(store_path.as_deref())?;
        let messenger = Messenger::new(id.clone(), client.clone(), opts.registry.clone());

        let role_state = match opts.role {
            NodeRole::Coordinator => RoleState::Coordinator(CoordinatorState::new()),
            NodeRole::Contributor => RoleState::Contributor(ContributorState {
                policy: opts
                    .policy
                    .unwrap_or_else(|| Arc::new(UniformResponse::default())),
                processed: Mutex::new(std::collections::HashSet::new()),
            }),
        };

        let record = NodeRecord {
            id: id.clone(),
            role: opts.role,
            endpoint: endpoint.clone(),
            status: NodeStatus::Active,
            created_at_ms: now_ms(),
        };
        if let Err(e) = opts.registry.register_node(&record).await {
            opts.token.cancel();
            event_loop_task.abort();
            return Err(e);
        }

        let inner = Arc::new(Inner {
            id: id.clone(),
            role: opts.role,
            registry: opts.registry.clone(),
            store,
            messenger,
            client,
            token: opts.token.clone(),
            role_state,
        });

        let dispatch_task = tokio::spawn(run_loop(inner, events));
        info!("{} node {id} up at {endpoint}", opts.role);

        Ok(Node {
            id,
            role: opts.role,
            endpoint,
            registry: opts.registry,
            token: opts.token,
            tasks: vec![event_loop_task, dispatch_task],
        })
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn role(&self) -> NodeRole {
        self.role
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Graceful teardown: mark the row `stopping`, cancel every task the
    /// node owns, wait out the drain window, abort what is left, then
    /// remove the registry row.
    pub async fn shutdown(mut self, drain: Duration) -> Result<()> {
        let _ = self
            .registry
            .set_node_status(&self.id, NodeStatus::Stopping)
            .await;
        self.token.cancel();

        let mut tasks = std::mem::take(&mut self.tasks);
        let drained = tokio::time::timeout(drain, futures::future::join_all(tasks.iter_mut()))
            .await
            .is_ok();
        if !drained {
            warn!("node {} did not drain within {drain:?}; aborting", self.id);
            for task in &tasks {
                task.abort();
            }
        }

        self.registry.remove_node(&self.id).await?;
        info!("node {} stopped", self.id);
        Ok(())
    }
}

/// Consume inbound events, dispatching each request on its own task under
/// the node-wide in-flight bound.
async fn run_loop(inner: Arc<Inner>, mut events: impl Stream<Item = Event> + Unpin) {
    let limiter = Arc::new(Semaphore::new(MAX_INFLIGHT_HANDLERS));
    loop {
        tokio::select! {
            _ = inner.token.cancelled() => {
                debug!("node {} dispatch loop stopping", inner.id);
                return;
            }
            event = events.next() => match event {
                Some(Event::InboundRequest { envelope, channel }) => {
                    let Ok(permit) = limiter.clone().acquire_owned().await else {
                        return;
                    };
                    let inner = inner.clone();
                    tokio::spawn(async move {
                        dispatch(inner, envelope, channel).await;
                        drop(permit);
                    });
                }
                None => return,
            }
        }
    }
}

fn dispatch(
    inner: Arc<Inner>,
    envelope: Envelope,
    channel: ResponseChannel<Reply>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
    Box::pin(dispatch_inner(inner, envelope, channel))
}

async fn dispatch_inner(inner: Arc<Inner>, envelope: Envelope, channel: ResponseChannel<Reply>) {
    // New work is refused while draining; health probes still answer.
    if inner.token.is_cancelled() && !matches!(envelope.body, Request::Health(_)) {
        inner
            .respond(AckReply::rejected("node is shutting down"), channel)
            .await;
        return;
    }

    let sender = envelope.sender.clone();
    match &envelope.body {
        Request::Health(_) => {
            let status = if inner.token.is_cancelled() {
                "stopping"
            } else {
                "active"
            };
            inner
                .respond(
                    Reply::Health(HealthReply {
                        node: inner.id.clone(),
                        role: inner.role,
                        status: status.to_string(),
                    }),
                    channel,
                )
                .await;
        }
        Request::Propose(req) => match &inner.role_state {
            RoleState::Coordinator(_) => {
                handle_propose(inner.clone(), sender, req.clone(), channel).await
            }
            RoleState::Contributor(_) => {
                inner
                    .respond(AckReply::rejected("contributors do not take proposals"), channel)
                    .await
            }
        },
        Request::Init(req) => match &inner.role_state {
            RoleState::Coordinator(_) => {
                handle_init(inner.clone(), sender, req.clone(), channel).await
            }
            RoleState::Contributor(_) => {
                inner
                    .respond(AckReply::rejected("contributors do not take init"), channel)
                    .await
            }
        },
        Request::Share(_) => match &inner.role_state {
            RoleState::Coordinator(_) => handle_share(inner.clone(), envelope, channel).await,
            RoleState::Contributor(_) => {
                inner
                    .respond(AckReply::rejected("contributors do not hold shares"), channel)
                    .await
            }
        },
        Request::Reveal(_) => match &inner.role_state {
            RoleState::Coordinator(_) => handle_reveal(inner.clone(), envelope, channel).await,
            RoleState::Contributor(_) => {
                inner
                    .respond(AckReply::rejected("contributors do not reveal"), channel)
                    .await
            }
        },
        Request::Announce(req) => match &inner.role_state {
            RoleState::Contributor(_) => {
                handle_announce(inner.clone(), sender, req.clone(), channel).await
            }
            RoleState::Coordinator(_) => {
                inner
                    .respond(AckReply::rejected("coordinators do not contribute"), channel)
                    .await
            }
        },
    }
}

impl Inner {
    async fn respond(&self, reply: Reply, channel: ResponseChannel<Reply>) {
        let mut client = self.client.clone();
        let _ = client.respond(reply, channel).await;
    }

    fn coordinator(&self) -> &CoordinatorState {
        match &self.role_state {
            RoleState::Coordinator(state) => state,
            RoleState::Contributor(_) => unreachable!("role checked at dispatch"),
        }
    }

    fn contributor(&self) -> &ContributorState {
        match &self.role_state {
            RoleState::Contributor(state) => state,
            RoleState::Coordinator(_) => unreachable!("role checked at dispatch"),
        }
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

/// Install a computation into the coordinator's table. Fails if already
/// present. Drains any parked messages for it afterwards.
async fn install_comp(inner: &Arc<Inner>, spec: &ComputationSpec, phase: CoordPhase) -> Result<()> {
    let state = inner.coordinator();
    {
        let mut comps = state.comps.lock().await;
        if comps.contains_key(&spec.comp_id) {
            return Err(Error::precondition(format!(
                "computation {} already known",
                spec.comp_id
            )));
        }
        comps.insert(
            spec.comp_id.clone(),
            Arc::new(Mutex::new(CoordComp {
                spec: spec.clone(),
                phase,
                aggregator: Aggregator::new(spec.comp_id.clone(), spec.min_participants),
            })),
        );
    }
    inner
        .store
        .log_action(
            &spec.comp_id,
            "received_computation",
            json!({ "prompt": spec.prompt, "deadline_ms": spec.deadline_ms }),
        )
        .await?;
    drain_parked(inner, &spec.comp_id).await;
    Ok(())
}

async fn lookup_comp(inner: &Inner, comp_id: &str) -> Option<Arc<Mutex<CoordComp>>> {
    inner.coordinator().comps.lock().await.get(comp_id).cloned()
}

/// Primary-only entry point: accept the proposal, ack it, and run the
/// init → broadcast → collect → reveal pipeline in the background.
async fn handle_propose(
    inner: Arc<Inner>,
    sender: NodeId,
    req: ProposeRequest,
    channel: ResponseChannel<Reply>,
) {
    let spec = req.spec;
    if spec.primary() != &inner.id {
        inner
            .respond(
                AckReply::rejected(format!("{} is not primary for {}", inner.id, spec.comp_id)),
                channel,
            )
            .await;
        return;
    }
    if let Err(e) = install_comp(&inner, &spec, CoordPhase::Ready).await {
        warn!("propose from {sender} refused: {e}");
        inner.respond(AckReply::rejected(e.to_string()), channel).await;
        return;
    }

    info!(
        "computation {} accepted from {sender}: \"{}\"",
        spec.comp_id, spec.prompt
    );
    inner.respond(AckReply::accepted(), channel).await;

    let orchestrate_inner = inner.clone();
    tokio::spawn(async move {
        orchestrate(orchestrate_inner, spec).await;
    });
}

/// Secondary entry point: persist the metadata and start collecting.
async fn handle_init(
    inner: Arc<Inner>,
    sender: NodeId,
    req: InitRequest,
    channel: ResponseChannel<Reply>,
) {
    let spec = req.spec;
    let comp_id = spec.comp_id.clone();
    let ready = match spec.coordinator_index(&inner.id) {
        Some(i) if i > 0 => install_comp(&inner, &spec, CoordPhase::Collecting)
            .await
            .map(|_| true)
            .unwrap_or_else(|e| {
                warn!("init for {comp_id} from {sender} failed: {e}");
                false
            }),
        _ => {
            warn!("init for {comp_id} from {sender} names this node incorrectly");
            false
        }
    };
    inner
        .respond(Reply::InitAck(InitAckReply { comp_id, ready }), channel)
        .await;
}

/// Primary pipeline after the proposal ack: init both secondaries, fan the
/// announce out to every active contributor, sit out the deadline, then run
/// the reveal.
async fn orchestrate(inner: Arc<Inner>, spec: ComputationSpec) {
    let comp_id = spec.comp_id.clone();

    // Init fan-out; both acks must arrive, ready, inside the init window.
    let init_sends = spec.secondaries().iter().map(|target| {
        let messenger = inner.messenger.clone();
        let target = target.clone();
        let request = Request::Init(InitRequest { spec: spec.clone() });
        async move { messenger.send(&target, request).await }.boxed()
    });
    let acks = tokio::time::timeout(INIT_WINDOW, futures::future::join_all(init_sends)).await;
    let initialized = match &acks {
        Ok(outcomes) => outcomes.iter().all(|outcome| {
            matches!(
                outcome,
                Delivery::Delivered(Reply::InitAck(ack)) if ack.ready
            )
        }),
        Err(_) => false,
    };
    if !initialized {
        warn!("computation {comp_id} failed: init window elapsed without both acks");
        fail_comp(&inner, &comp_id, Error::InitTimeout).await;
        return;
    }

    // Broadcast to contributors; best effort, collection runs regardless.
    set_phase(&inner, &comp_id, CoordPhase::Broadcasting).await;
    let _ = inner
        .registry
        .update_status(&comp_id, CompStatus::Broadcasting, None)
        .await;

    let targets: Vec<NodeId> = match inner.registry.active_nodes_by_role(NodeRole::Contributor) {
        Ok(nodes) => nodes.into_iter().map(|n| n.id).collect(),
        Err(e) => {
            warn!("computation {comp_id}: contributor listing failed: {e}");
            Vec::new()
        }
    };
    let outcomes = inner
        .messenger
        .broadcast(&targets, &Request::Announce(AnnounceRequest { spec: spec.clone() }))
        .await;
    let reached = outcomes.values().filter(|o| o.is_accepted()).count();
    info!(
        "computation {comp_id}: announced to {reached}/{} contributors",
        targets.len()
    );
    let _ = inner
        .store
        .log_action(
            &comp_id,
            "announce_broadcast",
            json!({ "targets": targets.len(), "reached": reached }),
        )
        .await;

    set_phase(&inner, &comp_id, CoordPhase::Collecting).await;
    let _ = inner
        .registry
        .update_status(&comp_id, CompStatus::Collecting, None)
        .await;

    // Collection continues until the absolute deadline, whatever the
    // broadcast outcomes were.
    tokio::select! {
        _ = inner.token.cancelled() => return,
        _ = tokio::time::sleep(until_ms(spec.deadline_ms)) => {}
    }

    reveal(&inner, &spec).await;
}

/// Three-party reveal, driven by the primary at the deadline.
async fn reveal(inner: &Arc<Inner>, spec: &ComputationSpec) {
    let comp_id = spec.comp_id.clone();
    let Some(comp) = lookup_comp(inner, &comp_id).await else {
        return;
    };

    let proposed = {
        let mut guard = comp.lock().await;
        if guard.phase == CoordPhase::Failed {
            return;
        }
        guard.phase = CoordPhase::Revealing;
        guard.aggregator.participants()
    };
    let _ = inner
        .registry
        .update_status(&comp_id, CompStatus::Revealing, None)
        .await;
    info!(
        "computation {comp_id}: revealing with {} proposed participants",
        proposed.len()
    );

    // Round one: propose P1. Each responder replies with its restriction.
    let round_one = match reveal_round(inner, spec, &proposed).await {
        Ok(replies) => replies,
        Err(e) => {
            warn!("computation {comp_id} failed during reveal: {e}");
            fail_comp(inner, &comp_id, "reveal failed").await;
            return;
        }
    };
    let aligned = aligned_set(&round_one[0].participants, &round_one[1].participants);

    // If either responder restricted further than the aligned set, its sum
    // covers contributors the other coordinators will not count. One more
    // round with the aligned set settles every column on the same set.
    let sums = if round_one
        .iter()
        .all(|reply| reply.participants == aligned)
    {
        [round_one[0].partial_sum, round_one[1].partial_sum]
    } else {
        match reveal_round(inner, spec, &aligned).await {
            Ok(replies) if replies.iter().all(|r| r.participants == aligned) => {
                [replies[0].partial_sum, replies[1].partial_sum]
            }
            Ok(_) => {
                warn!("computation {comp_id} failed: reveal did not converge");
                fail_comp(inner, &comp_id, "reveal failed").await;
                return;
            }
            Err(e) => {
                warn!("computation {comp_id} failed during reveal: {e}");
                fail_comp(inner, &comp_id, "reveal failed").await;
                return;
            }
        }
    };

    // Restrict the local column to the same aligned set and reconstruct.
    let (own_sum, own_set) = {
        let guard = comp.lock().await;
        guard.aggregator.restricted_sum(&aligned)
    };
    debug_assert_eq!(own_set, aligned);
    let _ = inner
        .store
        .put_partial_sum(&PartialSumRecord {
            comp_id: comp_id.clone(),
            partial_sum: own_sum,
            participants: aligned.clone(),
        })
        .await;

    if aligned.len() < spec.min_participants {
        info!(
            "computation {comp_id} failed: {} aligned participants, {} required",
            aligned.len(),
            spec.min_participants
        );
        let _ = inner
            .store
            .log_action(
                &comp_id,
                "aggregation_failed",
                json!({ "aligned": aligned.len(), "required": spec.min_participants }),
            )
            .await;
        fail_comp(inner, &comp_id, Error::ThresholdNotMet).await;
        return;
    }

    let result = sharing::reconstruct(&[own_sum, sums[0], sums[1]]);
    if let Err(e) = inner
        .registry
        .complete_computation(&comp_id, result, aligned.len())
        .await
    {
        warn!("computation {comp_id}: result write failed: {e}");
        return;
    }
    let _ = inner
        .store
        .log_action(
            &comp_id,
            "finalized",
            json!({ "result": result, "participants": aligned.len() }),
        )
        .await;
    set_phase(inner, &comp_id, CoordPhase::Finalized).await;
}

/// One reveal round: ask both secondaries for their column sums restricted
/// to `participants`.
async fn reveal_round(
    inner: &Arc<Inner>,
    spec: &ComputationSpec,
    participants: &BTreeSet<NodeId>,
) -> Result<Vec<PartialSumReply>> {
    let sends = spec.secondaries().iter().map(|target| {
        let messenger = inner.messenger.clone();
        let target = target.clone();
        let request = Request::Reveal(RevealRequest {
            comp_id: spec.comp_id.clone(),
            participants: participants.clone(),
        });
        async move { (target.clone(), messenger.send(&target, request).await) }.boxed()
    });
    let outcomes = futures::future::join_all(sends).await;

    let mut replies = Vec::with_capacity(outcomes.len());
    for (target, outcome) in outcomes {
        match outcome {
            Delivery::Delivered(Reply::PartialSum(reply)) => replies.push(reply),
            Delivery::Delivered(other) => {
                return Err(Error::Transient(format!(
                    "unexpected reveal reply from {target}: {other:?}"
                )))
            }
            Delivery::Failed(kind) => {
                return Err(Error::Delivery {
                    target,
                    kind,
                })
            }
        }
    }
    Ok(replies)
}

/// Store one contributor's share, enforcing the deadline and the
/// one-share-per-contributor rule.
async fn handle_share(inner: Arc<Inner>, envelope: Envelope, channel: ResponseChannel<Reply>) {
    let (sender, req) = {
        let Request::Share(req) = &envelope.body else {
            return;
        };
        (envelope.sender.clone(), req.clone())
    };
    let Some(comp) = lookup_comp(&inner, &req.comp_id).await else {
        park(inner, envelope, channel).await;
        return;
    };

    let mut guard = comp.lock().await;
    let spec = guard.spec.clone();

    if spec.coordinator_index(&inner.id) != Some(req.share_index as usize) {
        warn!(
            "share for {} from {sender} addressed to column {}, this node holds another",
            req.comp_id, req.share_index
        );
        inner
            .respond(AckReply::rejected("share addressed to a different column"), channel)
            .await;
        return;
    }
    if req.share_value >= MODULUS {
        inner
            .respond(AckReply::rejected("share outside [0, 2^32)"), channel)
            .await;
        return;
    }
    if !guard.accepting_shares() || spec.deadline_passed(now_ms()) {
        let late = Error::LateShare {
            comp_id: req.comp_id.clone(),
        };
        warn!("{late} (from {sender}); dropped");
        inner
            .respond(AckReply::rejected("deadline passed"), channel)
            .await;
        return;
    }

    match guard.aggregator.add_share(&sender, req.share_value) {
        Ok(()) => {}
        Err(Error::DuplicateShare { .. }) => {
            // First share retained; acknowledge so the sender's retry loop
            // treats the delivery as settled.
            warn!("duplicate share for {} from {sender}; dropped", req.comp_id);
            inner
                .respond(AckReply::accepted_with("duplicate share ignored"), channel)
                .await;
            return;
        }
        Err(e) => {
            inner.respond(AckReply::rejected(e.to_string()), channel).await;
            return;
        }
    }

    let record = ShareRecord {
        comp_id: req.comp_id.clone(),
        contributor: sender.clone(),
        share_value: req.share_value,
        received_at_ms: now_ms(),
    };
    if let Err(e) = inner.store.insert_share(&record).await {
        // Keep memory and disk consistent if the write is refused.
        warn!("share persist failed for {}: {e}", req.comp_id);
    }
    debug!(
        "computation {}: stored share from {sender} ({} so far)",
        req.comp_id,
        guard.aggregator.len()
    );
    inner.respond(AckReply::accepted(), channel).await;
}

/// Answer a reveal request with this column's restricted sum.
async fn handle_reveal(inner: Arc<Inner>, envelope: Envelope, channel: ResponseChannel<Reply>) {
    let (sender, req) = {
        let Request::Reveal(req) = &envelope.body else {
            return;
        };
        (envelope.sender.clone(), req.clone())
    };
    let Some(comp) = lookup_comp(&inner, &req.comp_id).await else {
        park(inner, envelope, channel).await;
        return;
    };

    let mut guard = comp.lock().await;
    if guard.spec.primary() != &sender {
        warn!("reveal for {} from non-primary {sender}; refused", req.comp_id);
        inner
            .respond(AckReply::rejected("reveal must come from the primary"), channel)
            .await;
        return;
    }

    guard.phase = CoordPhase::Revealing;
    let (partial_sum, participants) = guard.aggregator.restricted_sum(&req.participants);
    let _ = inner
        .store
        .put_partial_sum(&PartialSumRecord {
            comp_id: req.comp_id.clone(),
            partial_sum,
            participants: participants.clone(),
        })
        .await;
    guard.phase = CoordPhase::Finalized;
    info!(
        "computation {}: partial sum over {} participants sent to primary",
        req.comp_id,
        participants.len()
    );
    inner
        .respond(
            Reply::PartialSum(PartialSumReply {
                comp_id: req.comp_id.clone(),
                partial_sum,
                participants,
            }),
            channel,
        )
        .await;
}

async fn set_phase(inner: &Arc<Inner>, comp_id: &str, phase: CoordPhase) {
    if let Some(comp) = lookup_comp(inner, comp_id).await {
        comp.lock().await.phase = phase;
    }
}

async fn fail_comp(inner: &Arc<Inner>, comp_id: &str, reason: impl std::fmt::Display) {
    if let Some(comp) = lookup_comp(inner, comp_id).await {
        comp.lock().await.phase = CoordPhase::Failed;
    }
    let _ = inner
        .registry
        .update_status(comp_id, CompStatus::Failed, Some(reason.to_string()))
        .await;
}

/// Park a message that references an unknown computation and schedule its
/// eviction. Surplus messages beyond the queue bound are refused outright.
async fn park(inner: Arc<Inner>, envelope: Envelope, channel: ResponseChannel<Reply>) {
    let comp_id = match &envelope.body {
        Request::Share(req) => req.comp_id.clone(),
        Request::Reveal(req) => req.comp_id.clone(),
        _ => {
            inner
                .respond(AckReply::rejected("unknown computation"), channel)
                .await;
            return;
        }
    };
    let state = inner.coordinator();
    if state.parked_count.load(Ordering::Relaxed) >= PENDING_QUEUE_LIMIT {
        warn!("pending queue full; dropping message for unknown computation {comp_id}");
        inner
            .respond(AckReply::rejected("unknown computation"), channel)
            .await;
        return;
    }

    let seq = state.parked_seq.fetch_add(1, Ordering::Relaxed);
    debug!("parking message for unknown computation {comp_id} (seq {seq})");
    state.parked_count.fetch_add(1, Ordering::Relaxed);
    state
        .parked
        .lock()
        .await
        .entry(comp_id.clone())
        .or_default()
        .push(Parked {
            envelope,
            channel,
            seq,
        });

    let evict_inner = inner.clone();
    tokio::spawn(async move {
        tokio::time::sleep(PENDING_WINDOW).await;
        let state = evict_inner.coordinator();
        let evicted = {
            let mut parked = state.parked.lock().await;
            let Some(queue) = parked.get_mut(&comp_id) else {
                return;
            };
            let Some(position) = queue.iter().position(|p| p.seq == seq) else {
                return;
            };
            let entry = queue.remove(position);
            if queue.is_empty() {
                parked.remove(&comp_id);
            }
            entry
        };
        state.parked_count.fetch_sub(1, Ordering::Relaxed);
        warn!("message for unknown computation {comp_id} evicted from the pending queue");
        evict_inner
            .respond(AckReply::rejected("unknown computation"), evicted.channel)
            .await;
    });
}

/// Re-dispatch messages that were parked while the computation was unknown.
async fn drain_parked(inner: &Arc<Inner>, comp_id: &str) {
    let state = inner.coordinator();
    let drained = state.parked.lock().await.remove(comp_id);
    let Some(drained) = drained else { return };
    state
        .parked_count
        .fetch_sub(drained.len(), Ordering::Relaxed);
    debug!(
        "draining {} parked messages for computation {comp_id}",
        drained.len()
    );
    for parked in drained {
        let inner = inner.clone();
        tokio::spawn(async move {
            dispatch(inner, parked.envelope, parked.channel).await;
        });
    }
}

// ---------------------------------------------------------------------------
// Contributor
// ---------------------------------------------------------------------------

/// Produce a local response, split it, persist the record, ack the
/// announce, then deliver one share to each coordinator concurrently.
async fn handle_announce(
    inner: Arc<Inner>,
    sender: NodeId,
    req: AnnounceRequest,
    channel: ResponseChannel<Reply>,
) {
    let spec = req.spec;
    let comp_id = spec.comp_id.clone();

    // Check-and-mark under one lock so a retransmitted announce cannot
    // produce a second response record.
    {
        let mut processed = inner.contributor().processed.lock().await;
        let seen = processed.contains(&comp_id)
            || matches!(inner.store.response(&comp_id), Ok(Some(_)));
        if seen {
            debug!("announce for {comp_id} already processed");
            inner
                .respond(AckReply::accepted_with("already processed"), channel)
                .await;
            return;
        }
        processed.insert(comp_id.clone());
    }
    if spec.deadline_passed(now_ms()) {
        inner
            .respond(AckReply::rejected("deadline passed"), channel)
            .await;
        return;
    }

    let _ = inner
        .store
        .log_action(
            &comp_id,
            "received_computation",
            json!({ "from": sender, "prompt": spec.prompt }),
        )
        .await;

    let value = inner.contributor().policy.produce(&spec);
    let shares = match sharing::split(value) {
        Ok(shares) => shares,
        Err(e) => {
            warn!("response policy produced an unusable value for {comp_id}: {e}");
            inner.respond(AckReply::rejected(e.to_string()), channel).await;
            return;
        }
    };
    info!("responding to computation {comp_id} with a local value");

    let record = ResponseRecord {
        comp_id: comp_id.clone(),
        raw_value: value,
        shares,
        targets: spec.coordinators.clone(),
        delivery: [DeliveryStatus::Pending; NUM_COORDINATORS],
    };
    if let Err(e) = inner.store.put_response(&record).await {
        warn!("response persist failed for {comp_id}: {e}");
        inner.contributor().processed.lock().await.remove(&comp_id);
        inner.respond(AckReply::rejected(e.to_string()), channel).await;
        return;
    }

    // Ack before delivering so the announcing coordinator is not held up by
    // our share fan-out.
    inner.respond(AckReply::accepted(), channel).await;

    let deliver_inner = inner.clone();
    tokio::spawn(async move {
        deliver_shares(deliver_inner, record).await;
    });
}

/// Send share i to coordinator i, all three concurrently, each with the
/// messaging retry policy; record every outcome. A contributor counts as
/// having contributed only if all three deliveries succeed.
async fn deliver_shares(inner: Arc<Inner>, record: ResponseRecord) {
    let comp_id = record.comp_id.clone();
    let sends = (0..NUM_COORDINATORS).map(|i| {
        let messenger = inner.messenger.clone();
        let target = record.targets[i].clone();
        let request = Request::Share(ShareRequest {
            comp_id: comp_id.clone(),
            share_value: record.shares[i],
            share_index: i as u8,
        });
        async move { (i, messenger.send(&target, request).await) }.boxed()
    });
    let outcomes = futures::future::join_all(sends).await;

    let mut delivered = 0;
    for (i, outcome) in &outcomes {
        let status = if outcome.is_accepted() {
            delivered += 1;
            DeliveryStatus::Delivered
        } else {
            DeliveryStatus::Failed
        };
        if let Err(e) = inner.store.set_delivery(&comp_id, *i, status).await {
            warn!("delivery status write failed for {comp_id}: {e}");
        }
    }

    let _ = inner
        .store
        .log_action(
            &comp_id,
            "shares_sent",
            json!({ "delivered": delivered, "targets": NUM_COORDINATORS }),
        )
        .await;
    if delivered == NUM_COORDINATORS {
        info!("computation {comp_id}: all {NUM_COORDINATORS} shares delivered");
    } else {
        // Shares already delivered are not recalled; alignment at reveal
        // time drops this contributor from the result.
        warn!(
            "computation {comp_id}: only {delivered}/{NUM_COORDINATORS} shares delivered"
        );
    }
}
