use std::time::Duration;

/// Modulus for all secret-shared arithmetic: 2^32.
pub const MODULUS: u64 = 1 << 32;

/// Number of shares each private value is split into, and the number of
/// coordinators every computation is pinned to.
pub const NUM_COORDINATORS: usize = 3;

/// Schema tag for the only supported response shape: a single non-negative
/// integer in [0, 2^32).
pub const SCHEMA_TAG_U32: &str = "u32";

/// Upper bound (inclusive) of the reference response policy.
pub const DEFAULT_RESPONSE_MAX: u64 = 100;

pub const DEFAULT_DEADLINE_SECONDS: u64 = 60;
pub const DEFAULT_MIN_PARTICIPANTS: usize = 1;

/// Request/response protocol spoken between nodes.
pub const PROTOCOL_NAME: &str = "/tallynet/reqres/1.0.0";

/// Delivery retry policy: up to 3 attempts with exponential backoff,
/// 200ms base doubling up to a 2s cap, 5s per-attempt timeout.
pub const MAX_SEND_ATTEMPTS: u32 = 3;
pub const RETRY_BASE_DELAY: Duration = Duration::from_millis(200);
pub const RETRY_MAX_DELAY: Duration = Duration::from_secs(2);
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Window for the primary to collect both `init_ack`s before a computation
/// is failed with `InitTimeout`.
pub const INIT_WINDOW: Duration = Duration::from_secs(10);

/// How long a message referencing an unknown computation is parked before it
/// is evicted, and how many parked messages a node will hold.
pub const PENDING_WINDOW: Duration = Duration::from_secs(3);
pub const PENDING_QUEUE_LIMIT: usize = 256;

/// Startup window within which every spawned node must answer a health probe.
pub const STARTUP_WINDOW: Duration = Duration::from_secs(10);

/// Drain window granted to in-flight handlers on shutdown before tasks are
/// aborted.
pub const DRAIN_WINDOW: Duration = Duration::from_secs(5);

/// Concurrency bound for broadcast fan-outs.
pub const BROADCAST_CONCURRENCY: usize = 10;

/// Bound on concurrently executing inbound handlers per node.
pub const MAX_INFLIGHT_HANDLERS: usize = 32;

/// Poll interval used by `await_result` and the startup health loop.
pub const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Backoff applied to retry-safe store operations.
pub const STORE_RETRY_ATTEMPTS: u32 = 5;
pub const STORE_RETRY_BASE_DELAY: Duration = Duration::from_millis(20);

/// Connections are kept alive long enough to span a full computation round.
pub const IDLE_CONNECTION_TIMEOUT: Duration = Duration::from_secs(120);
