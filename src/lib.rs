//! srt-relay - low-latency live-video relay for SRT-style streams.
//!
//! Publishers push MPEG-TS over a well-known UDP endpoint; players receive
//! a fan-out of the stream through per-reader cursors over a shared ring
//! buffer. The relay can also pull a stream from an upstream origin on
//! demand and push local streams to downstream origins.

pub mod clock;
pub mod config;
pub mod constants;
pub mod error;
pub mod events;
pub mod http;
pub mod listener;
pub mod logging;
pub mod manager;
pub mod mpegts;
pub mod pidfile;
pub mod registry;
pub mod relay;
pub mod ringbuf;
pub mod role;
pub mod stats;
pub mod streamid;
pub mod transport;
pub mod worker;

// Re-export main components
pub use config::{ CliArgs, Config };
pub use error::{ RelayError, Result };
pub use manager::Manager;
pub use registry::{ StreamRegistry, StreamState };
pub use ringbuf::{ CursorStart, ReadOutcome, RingBuffer };
pub use stats::StatsHub;
pub use streamid::StreamId;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
