//! Per-role statistics: counters, periodic snapshots, JSON rendering.
//!
//! Each worker gathers a snapshot of every role it owns once per stat
//! interval and swaps the batch into the shared [`StatsHub`]; the HTTP
//! endpoint and the stat-post loop read from the hub without ever touching
//! worker-owned state.

use std::collections::{ HashMap, HashSet };
use std::net::SocketAddr;

use parking_lot::Mutex;
use serde::Serialize;

use crate::clock::{ monotonic_ms, unix_secs };

/// Role flavor tag used in snapshots and callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleTag {
    Publisher,
    Player,
    Puller,
    Pusher,
}

impl RoleTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoleTag::Publisher => "publisher",
            RoleTag::Player => "player",
            RoleTag::Puller => "puller",
            RoleTag::Pusher => "pusher",
        }
    }

    /// Publishers and pullers feed a stream; their snapshots appear in the
    /// `publishers` section of the stats document.
    pub fn is_publishing(&self) -> bool {
        matches!(self, RoleTag::Publisher | RoleTag::Puller)
    }
}

/// Link-level statistics snapshot.
///
/// The session seam does not measure loss or RTT the way the SRT library
/// does; the fields exist so the reporting surface matches, and carry
/// whatever the transport can observe.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct LinkStats {
    #[serde(rename = "pktRcvLoss")]
    pub pkt_rcv_loss: u64,
    #[serde(rename = "pktRcvDrop")]
    pub pkt_rcv_drop: u64,
    #[serde(rename = "bytesRcvLoss")]
    pub bytes_rcv_loss: u64,
    #[serde(rename = "bytesRcvDrop")]
    pub bytes_rcv_drop: u64,
    #[serde(rename = "mbpsRecvRate")]
    pub mbps_recv_rate: f64,
    #[serde(rename = "rtt")]
    pub rtt_ms: f64,
    #[serde(rename = "msRcvBuf")]
    pub ms_rcv_buf: u64,
    #[serde(rename = "mbpsBandwidth")]
    pub mbps_bandwidth: f64,
}

/// Mutable counters owned by one role.
#[derive(Debug)]
pub struct RoleCounters {
    pub bytes_in: u64,
    pub bytes_out: u64,
    interval_bytes_in: u64,
    interval_bytes_out: u64,
    interval_started_ms: u64,
    start_ms: u64,
    start_unix_secs: u64,
}

impl RoleCounters {
    pub fn new() -> Self {
        let now = monotonic_ms();
        Self {
            bytes_in: 0,
            bytes_out: 0,
            interval_bytes_in: 0,
            interval_bytes_out: 0,
            interval_started_ms: now,
            start_ms: now,
            start_unix_secs: unix_secs(),
        }
    }

    pub fn record_in(&mut self, n: usize) {
        self.bytes_in += n as u64;
        self.interval_bytes_in += n as u64;
    }

    pub fn record_out(&mut self, n: usize) {
        self.bytes_out += n as u64;
        self.interval_bytes_out += n as u64;
    }

    pub fn reset_cumulative(&mut self) {
        self.bytes_in = 0;
        self.bytes_out = 0;
    }

    /// Produce a snapshot and restart the rate-measurement interval.
    pub fn snapshot(
        &mut self,
        tag: RoleTag,
        stream_key: &str,
        peer: SocketAddr,
        now_ms: u64
    ) -> StatSnapshot {
        let elapsed_ms = now_ms.saturating_sub(self.interval_started_ms).max(1);
        let interval_bytes = if tag.is_publishing() {
            self.interval_bytes_in
        } else {
            self.interval_bytes_out
        };
        let bitrate_kbps = (interval_bytes * 8) / elapsed_ms;
        let mbps = ((interval_bytes * 8) as f64) / ((elapsed_ms as f64) * 1000.0);

        self.interval_bytes_in = 0;
        self.interval_bytes_out = 0;
        self.interval_started_ms = now_ms;

        StatSnapshot {
            tag,
            stream_key: stream_key.to_string(),
            peer: peer.to_string(),
            bytes_in: self.bytes_in,
            bytes_out: self.bytes_out,
            bitrate_kbps,
            uptime_secs: now_ms.saturating_sub(self.start_ms) / 1000,
            start_unix_secs: self.start_unix_secs,
            link: LinkStats {
                mbps_recv_rate: mbps,
                mbps_bandwidth: mbps,
                ..LinkStats::default()
            },
        }
    }
}

impl Default for RoleCounters {
    fn default() -> Self {
        Self::new()
    }
}

/// One role's statistics at a point in time.
#[derive(Debug, Clone, Serialize)]
pub struct StatSnapshot {
    pub tag: RoleTag,
    pub stream_key: String,
    pub peer: String,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub bitrate_kbps: u64,
    pub uptime_secs: u64,
    pub start_unix_secs: u64,
    pub link: LinkStats,
}

/// Shared slot between workers and the reporting surfaces.
#[derive(Default)]
pub struct StatsHub {
    snapshots: Mutex<HashMap<usize, Vec<StatSnapshot>>>,
    resets: Mutex<HashSet<String>>,
}

impl StatsHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically replace one worker's snapshot batch.
    pub fn publish(&self, worker_id: usize, batch: Vec<StatSnapshot>) {
        self.snapshots.lock().insert(worker_id, batch);
    }

    /// Drop a worker's slot once it has shut down.
    pub fn retire(&self, worker_id: usize) {
        self.snapshots.lock().remove(&worker_id);
    }

    pub fn collect(&self) -> Vec<StatSnapshot> {
        self.snapshots.lock().values().flatten().cloned().collect()
    }

    /// Ask the owning worker to clear a publisher's cumulative counters.
    pub fn request_reset(&self, stream_key: &str) {
        self.resets.lock().insert(stream_key.to_string());
    }

    /// Consume a pending reset request for this stream, if any.
    pub fn take_reset(&self, stream_key: &str) -> bool {
        self.resets.lock().remove(stream_key)
    }
}

#[derive(Serialize)]
struct PublisherDoc {
    #[serde(flatten)]
    link: LinkStats,
    bitrate: u64,
    uptime: u64,
}

/// Render the stats document served by the HTTP endpoint and posted to
/// `stat_post_url`.
pub fn render_stats_json(
    snapshots: &[StatSnapshot],
    publisher_filter: Option<&str>
) -> serde_json::Value {
    let mut publishers = serde_json::Map::new();
    for snapshot in snapshots {
        if !snapshot.tag.is_publishing() {
            continue;
        }
        if let Some(filter) = publisher_filter {
            if snapshot.stream_key != filter {
                continue;
            }
        }
        let doc = PublisherDoc {
            link: snapshot.link,
            bitrate: snapshot.bitrate_kbps,
            uptime: snapshot.uptime_secs,
        };
        publishers.insert(
            snapshot.stream_key.clone(),
            serde_json::to_value(doc).unwrap_or(serde_json::Value::Null)
        );
    }

    let status = if publisher_filter.is_some() && publishers.is_empty() {
        "error"
    } else {
        "ok"
    };
    serde_json::json!({
        "status": status,
        "publishers": serde_json::Value::Object(publishers),
    })
}
