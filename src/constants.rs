//! Tuning constants and protocol sizes used throughout the relay.

use static_assertions::const_assert_eq;

/// Length of a single MPEG-TS packet in bytes.
pub const TS_PACKET_LEN: usize = 188;

/// Length of one TS datagram on the wire: seven TS packets per UDP payload.
pub const TS_DATAGRAM_LEN: usize = 7 * TS_PACKET_LEN;

const_assert_eq!(TS_DATAGRAM_LEN, 1316);

/// Default stream ring capacity in bytes (>= 4 MiB, whole datagrams).
pub const DEFAULT_RING_CAPACITY: usize = 3200 * TS_DATAGRAM_LEN;

/// Distance from the head at which a lagging reader is flagged as overrun.
///
/// A reader is allowed to fall at most `capacity - RING_SAFETY_MARGIN` bytes
/// behind the writer before its next read reports `Overrun`.
pub const RING_SAFETY_MARGIN: usize = 64 * TS_DATAGRAM_LEN;

/// "Skip to live" distance applied when an overrun cursor is reset.
pub const RING_REWIND_WATERMARK: usize = 256 * TS_DATAGRAM_LEN;

/// Worker poll interval in milliseconds.
pub const POLL_INTERVAL_MS: u64 = 100;

/// Default SRT latency in milliseconds, applied when a relay URL omits it.
pub const DEFAULT_LATENCY_MS: u32 = 100;

/// Default listener backlog.
pub const DEFAULT_BACKLOG: u32 = 1024;

/// Default maximum number of roles a single worker will hold.
pub const DEFAULT_WORKER_CONNECTIONS: usize = 100;

/// Default interval between stat snapshots/posts, in seconds.
pub const DEFAULT_STAT_POST_INTERVAL_SECS: u64 = 5;

/// Maximum accepted stream-id length in the handshake.
pub const MAX_STREAMID_LEN: usize = 1024;

/// Maximum datagrams moved per role per worker tick.
///
/// Bounds the time one role can monopolize a tick; a role with more pending
/// data is simply picked up again on the next poll round.
pub const MAX_DATAGRAMS_PER_TICK: usize = 64;

/// Outbound handshake timeout in milliseconds.
pub const HANDSHAKE_TIMEOUT_MS: u64 = 2000;

/// Number of handshake retransmissions before a connect attempt fails.
pub const HANDSHAKE_RETRIES: u32 = 3;

/// Default configuration file path.
pub const DEFAULT_CONF_PATH: &str = "./sls.conf";

/// Default PID file path.
pub const DEFAULT_PID_PATH: &str = "/tmp/srt-relay.pid";
