//! Fixed limits and defaults for group coordination.
//!
//! Tiger Style: every limit is explicit so a misbehaving peer cannot make a
//! refresh allocate without bound.

/// Default parent of all cluster paths.
pub const DEFAULT_ROOT_PATH: &str = "/bellwether/clusters";

/// Default name prefix of member nodes; the coordination service appends the
/// sequence number.
pub const DEFAULT_MEMBER_PREFIX: &str = "member-";

/// Default session timeout in milliseconds.
pub const DEFAULT_SESSION_TIMEOUT_MS: u64 = 30_000;

/// Smallest accepted session timeout in milliseconds.
pub const MIN_SESSION_TIMEOUT_MS: u64 = 1_000;

/// Largest accepted session timeout in milliseconds.
pub const MAX_SESSION_TIMEOUT_MS: u64 = 600_000;

/// Default coordination service address.
pub const DEFAULT_CONNECT_STRING: &str = "127.0.0.1:2181";

/// Width of the zero-padded sequence suffix of sequential nodes.
pub const SEQUENCE_WIDTH: usize = 10;

/// Largest node payload accepted, matching ZooKeeper's default `jute.maxbuffer`.
pub const MAX_NODE_DATA_SIZE: usize = 1024 * 1024;

/// Largest number of members read in a single refresh.
pub const MAX_GROUP_MEMBERS: usize = 10_000;

/// First delay between attempts to replace an expired session.
pub const RECONNECT_BACKOFF_MIN_MS: u64 = 100;

/// Longest delay between attempts to replace an expired session.
pub const RECONNECT_BACKOFF_MAX_MS: u64 = 10_000;
