//! Per-connection roles and their state machine.
//!
//! Every accepted or outbound session becomes one [`Role`]:
//!
//! - `Publisher` and `Puller` feed a stream: datagrams read from the socket
//!   go through the priming scanner into the stream's ring buffer.
//! - `Player` and `Pusher` drain a stream: the role holds a reader cursor
//!   and forwards ring bytes to its socket, after first replaying the
//!   priming cache.
//!
//! States run `Initializing -> Running -> Invalid -> Uninitialized`. A role
//! turns `Invalid` on socket breakage, ring overrun, idle timeout, or
//! publisher teardown; the owning worker then calls [`Role::uninit`], which
//! closes the socket exactly once, releases the registry binding, and hands
//! relay roles back to their manager for reconnection.

use std::sync::Arc;

use tracing::{ debug, info, trace, warn };

use crate::constants::{ MAX_DATAGRAMS_PER_TICK, TS_DATAGRAM_LEN };
use crate::error::{ RelayError, Result };
use crate::events::{ self, StreamEvent };
use crate::registry::{ RoleId, StreamRegistry, StreamState, next_role_id };
use crate::ringbuf::{ Cursor, CursorStart, ReadOutcome };
use crate::stats::{ RoleCounters, RoleTag, StatSnapshot };
use crate::transport::Connection;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleState {
    Initializing,
    Running,
    Invalid,
    Uninitialized,
}

/// Hook a relay role uses to hand itself back to its manager.
pub trait ReconnectHandler: Send + Sync {
    /// Record that the relay session at `url` went down; starts the backoff.
    fn on_disconnect(&self, url: &str);

    /// Attempt reconnection. Returns true when the manager is done and can
    /// leave the worker's retry queue (reconnected or permanently failed).
    fn reconnect(&self, now_ms: u64) -> bool;
}

struct RelayAttachment {
    handler: Arc<dyn ReconnectHandler>,
    url: String,
}

pub struct Role {
    id: RoleId,
    tag: RoleTag,
    state: RoleState,
    conn: Connection,
    stream_key: String,
    stream: Arc<StreamState>,
    /// Reader position; created lazily when a subscriber primes.
    cursor: Option<Cursor>,
    primed: bool,
    /// Datagram accepted from the ring but not yet written to the socket.
    pending_out: Option<Vec<u8>>,
    /// Registry binding to release at teardown (publishing roles only).
    registry: Option<Arc<StreamRegistry>>,
    relay: Option<RelayAttachment>,
    idle_timeout_secs: Option<u64>,
    last_activity_ms: u64,
    on_event_url: Option<String>,
    counters: RoleCounters,
}

impl Role {
    fn new(
        tag: RoleTag,
        conn: Connection,
        stream_key: String,
        stream: Arc<StreamState>,
        now_ms: u64
    ) -> Role {
        Role {
            id: next_role_id(),
            tag,
            state: RoleState::Initializing,
            conn,
            stream_key,
            stream,
            cursor: None,
            primed: false,
            pending_out: None,
            registry: None,
            relay: None,
            idle_timeout_secs: None,
            last_activity_ms: now_ms,
            on_event_url: None,
            counters: RoleCounters::new(),
        }
    }

    /// A publisher accepted on the listen socket. The caller pre-allocates
    /// `id` with [`next_role_id`] and registers it before building the role,
    /// so the registry binding and the role agree on identity.
    pub fn publisher(
        conn: Connection,
        stream_key: String,
        stream: Arc<StreamState>,
        registry: Arc<StreamRegistry>,
        id: RoleId,
        now_ms: u64
    ) -> Role {
        let mut role = Role::new(RoleTag::Publisher, conn, stream_key, stream, now_ms);
        role.id = id;
        role.registry = Some(registry);
        role
    }

    /// A player accepted on the listen socket.
    pub fn player(
        conn: Connection,
        stream_key: String,
        stream: Arc<StreamState>,
        now_ms: u64
    ) -> Role {
        Role::new(RoleTag::Player, conn, stream_key, stream, now_ms)
    }

    /// An outbound pull session acting as the stream's publisher. Identity
    /// is pre-allocated like [`Role::publisher`].
    pub fn puller(
        conn: Connection,
        stream_key: String,
        stream: Arc<StreamState>,
        registry: Arc<StreamRegistry>,
        id: RoleId,
        handler: Arc<dyn ReconnectHandler>,
        url: String,
        now_ms: u64
    ) -> Role {
        let mut role = Role::new(RoleTag::Puller, conn, stream_key, stream, now_ms);
        role.id = id;
        role.registry = Some(registry);
        role.relay = Some(RelayAttachment { handler, url });
        role
    }

    /// An outbound push session acting as a subscriber.
    pub fn pusher(
        conn: Connection,
        stream_key: String,
        stream: Arc<StreamState>,
        handler: Arc<dyn ReconnectHandler>,
        url: String,
        now_ms: u64
    ) -> Role {
        let mut role = Role::new(RoleTag::Pusher, conn, stream_key, stream, now_ms);
        role.relay = Some(RelayAttachment { handler, url });
        role
    }

    pub fn id(&self) -> RoleId {
        self.id
    }

    pub fn tag(&self) -> RoleTag {
        self.tag
    }

    pub fn state(&self) -> RoleState {
        self.state
    }

    pub fn stream_key(&self) -> &str {
        &self.stream_key
    }

    pub fn raw_fd(&self) -> std::os::unix::io::RawFd {
        self.conn.raw_fd()
    }

    pub fn peer_addr(&self) -> std::net::SocketAddr {
        self.conn.peer_addr()
    }

    pub fn set_idle_timeout(&mut self, secs: Option<u64>) {
        self.idle_timeout_secs = secs;
    }

    pub fn set_event_url(&mut self, url: Option<String>) {
        self.on_event_url = url;
    }

    /// Mark the role live and fire the connect callback. Called once, by
    /// whoever binds the role into the routing tables.
    pub fn activate(&mut self) {
        debug_assert_eq!(self.state, RoleState::Initializing);
        self.state = RoleState::Running;
        if let Some(url) = &self.on_event_url {
            events::notify(url, StreamEvent::Connect, self.tag, &self.stream_key, self.peer_addr());
        }
    }

    pub fn mark_invalid(&mut self) {
        if self.state == RoleState::Running || self.state == RoleState::Initializing {
            self.state = RoleState::Invalid;
        }
    }

    /// True when a writable socket would let this role make progress, so
    /// the worker only polls for POLLOUT when there is something to send.
    pub fn wants_write(&self) -> bool {
        match self.tag {
            RoleTag::Publisher | RoleTag::Puller => false,
            RoleTag::Player | RoleTag::Pusher => {
                !self.primed ||
                    self.pending_out.is_some() ||
                    self.cursor.map_or(false, |c| c.position() < self.stream.ring().head())
            }
        }
    }

    /// Socket readable: publishers ingest datagrams, subscribers drain
    /// control traffic. Returns the number of datagrams moved.
    pub fn on_readable(&mut self, now_ms: u64) -> Result<usize> {
        if self.state != RoleState::Running {
            return Ok(0);
        }
        match self.tag {
            RoleTag::Publisher | RoleTag::Puller => self.ingest(now_ms),
            RoleTag::Player | RoleTag::Pusher => {
                // Subscribers receive no data; reads only surface shutdowns.
                match self.conn.recv_payload() {
                    Ok(Some(_)) => {
                        trace!(role = self.tag.as_str(), "ignoring unexpected data from subscriber peer");
                        Ok(0)
                    }
                    Ok(None) => Ok(0),
                    Err(e) => Err(e),
                }
            }
        }
    }

    /// Socket writable: subscribers prime and forward ring bytes.
    pub fn on_writable(&mut self, now_ms: u64) -> Result<usize> {
        if self.state != RoleState::Running {
            return Ok(0);
        }
        match self.tag {
            RoleTag::Publisher | RoleTag::Puller => Ok(0),
            RoleTag::Player | RoleTag::Pusher => self.forward(now_ms),
        }
    }

    fn ingest(&mut self, now_ms: u64) -> Result<usize> {
        let mut moved = 0;
        while moved < MAX_DATAGRAMS_PER_TICK {
            let Some(payload) = self.conn.recv_payload()? else {
                break;
            };
            self.stream.scan_priming(&payload);
            self.stream.ring().write(&payload)?;
            self.counters.record_in(payload.len());
            self.last_activity_ms = now_ms;
            moved += 1;
        }
        Ok(moved)
    }

    fn forward(&mut self, now_ms: u64) -> Result<usize> {
        if !self.primed {
            let priming = self.stream.priming_bytes();
            for chunk in priming.chunks(TS_DATAGRAM_LEN) {
                if !self.conn.send_payload(chunk)? {
                    // Socket not ready yet; retry priming on the next tick.
                    return Ok(0);
                }
                self.counters.record_out(chunk.len());
            }
            self.primed = true;
            self.cursor = Some(self.stream.ring().new_cursor(CursorStart::Latest));
            self.last_activity_ms = now_ms;
            debug!(
                role = self.tag.as_str(),
                stream = %self.stream_key,
                priming_bytes = priming.len(),
                "subscriber primed"
            );
        }

        let mut moved = 0;

        // Flush a datagram left over from a previous WouldBlock first.
        if let Some(pending) = self.pending_out.take() {
            if self.conn.send_payload(&pending)? {
                self.counters.record_out(pending.len());
                self.last_activity_ms = now_ms;
                moved += 1;
            } else {
                self.pending_out = Some(pending);
                return Ok(moved);
            }
        }

        let Some(cursor) = self.cursor.as_mut() else {
            return Ok(moved);
        };
        let mut buf = [0u8; TS_DATAGRAM_LEN];
        while moved < MAX_DATAGRAMS_PER_TICK {
            match self.stream.ring().read(cursor, &mut buf) {
                ReadOutcome::Data(n) => {
                    if self.conn.send_payload(&buf[..n])? {
                        self.counters.record_out(n);
                        self.last_activity_ms = now_ms;
                        moved += 1;
                    } else {
                        self.pending_out = Some(buf[..n].to_vec());
                        break;
                    }
                }
                ReadOutcome::Empty => {
                    break;
                }
                ReadOutcome::Overrun { lag } => {
                    warn!(
                        role = self.tag.as_str(),
                        stream = %self.stream_key,
                        lag,
                        "subscriber overran the ring, dropping"
                    );
                    return Err(RelayError::Overrun { lag });
                }
            }
        }
        Ok(moved)
    }

    /// Evaluate liveness. Called by the worker's sweep every tick.
    pub fn check_state(&mut self, now_ms: u64) -> RoleState {
        if self.state != RoleState::Running {
            return self.state;
        }
        if self.conn.is_broken() {
            debug!(role = self.tag.as_str(), stream = %self.stream_key, "socket broken");
            self.state = RoleState::Invalid;
            return self.state;
        }
        // Subscribers die with their publisher.
        if !self.tag.is_publishing() && self.stream.is_closed() {
            debug!(role = self.tag.as_str(), stream = %self.stream_key, "publisher gone");
            self.state = RoleState::Invalid;
            return self.state;
        }
        if let Some(limit) = self.idle_timeout_secs {
            if now_ms.saturating_sub(self.last_activity_ms) > limit * 1000 {
                let err = RelayError::IdleTimeout(limit);
                info!(
                    role = self.tag.as_str(),
                    stream = %self.stream_key,
                    error = %err,
                    "idle role invalidated"
                );
                self.state = RoleState::Invalid;
            }
        }
        self.state
    }

    /// Final teardown: notify the peer, release the registry binding, start
    /// the relay backoff. The socket itself closes when the role is dropped,
    /// exactly once, because this transition is guarded.
    pub fn uninit(&mut self) {
        if self.state == RoleState::Uninitialized {
            return;
        }
        self.state = RoleState::Uninitialized;
        self.conn.send_shutdown();

        if let Some(registry) = self.registry.take() {
            registry.unregister(&self.stream_key, self.id);
        }
        if let Some(relay) = &self.relay {
            relay.handler.on_disconnect(&relay.url);
        }
        if let Some(url) = &self.on_event_url {
            events::notify(url, StreamEvent::Close, self.tag, &self.stream_key, self.peer_addr());
        }
        info!(role = self.tag.as_str(), stream = %self.stream_key, id = self.id, "role uninitialized");
    }

    /// Relay manager to requeue after teardown, if this role is a relay.
    pub fn reconnect_handler(&self) -> Option<Arc<dyn ReconnectHandler>> {
        self.relay.as_ref().map(|r| Arc::clone(&r.handler))
    }

    /// Periodic statistics snapshot; `reset` clears cumulative counters.
    pub fn snapshot(&mut self, now_ms: u64, reset: bool) -> StatSnapshot {
        if reset {
            self.counters.reset_cumulative();
        }
        self.counters.snapshot(self.tag, &self.stream_key, self.conn.peer_addr(), now_ms)
    }
}
