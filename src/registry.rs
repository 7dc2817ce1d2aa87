//! Stream routing registry: app maps, publisher binding, ACLs.
//!
//! One registry exists per configured server block. It answers the three
//! questions the accept path asks: which uplive app does this `host/app`
//! publish to, which uplive app does this player-facing `host/app` map to,
//! and who (if anyone) currently publishes a given uplive key. Publisher
//! registration is atomic and enforces the one-publisher-per-stream rule.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{ AtomicBool, AtomicU64, Ordering };

use parking_lot::{ Mutex, RwLock };
use tracing::{ debug, info };

use crate::config::{ AclAction, AclEntry, AppConfig, ServerConfig };
use crate::error::{ RelayError, Result };
use crate::mpegts::TsPriming;
use crate::ringbuf::RingBuffer;

/// Process-wide role identity, used for reverse lookups by identity.
pub type RoleId = u64;

static NEXT_ROLE_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_role_id() -> RoleId {
    NEXT_ROLE_ID.fetch_add(1, Ordering::Relaxed)
}

/// Shared per-stream state: the fan-out ring plus the priming cache.
#[derive(Debug)]
pub struct StreamState {
    key: String,
    ring: RingBuffer,
    priming: Mutex<TsPriming>,
    closed: AtomicBool,
}

impl StreamState {
    pub fn new(key: &str, ring_capacity: usize) -> Result<Arc<StreamState>> {
        Ok(
            Arc::new(StreamState {
                key: key.to_string(),
                ring: RingBuffer::new(ring_capacity)?,
                priming: Mutex::new(TsPriming::new()),
                closed: AtomicBool::new(false),
            })
        )
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn ring(&self) -> &RingBuffer {
        &self.ring
    }

    /// Feed a publisher datagram through the priming scanner.
    pub fn scan_priming(&self, datagram: &[u8]) {
        let mut priming = self.priming.lock();
        if priming.scan(datagram) {
            info!(stream = %self.key, "priming cache complete");
        }
    }

    /// Cached priming packets in decode order, possibly empty.
    pub fn priming_bytes(&self) -> Vec<u8> {
        self.priming.lock().bytes()
    }

    /// Raised once by publisher teardown; subscribers observe it on their
    /// next tick and invalidate themselves.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// The publisher currently bound to an uplive key.
#[derive(Clone)]
pub struct PublisherEntry {
    pub role_id: RoleId,
    pub stream: Arc<StreamState>,
}

struct Inner {
    /// uplive `host/app` -> app configuration (ACLs, relays).
    apps: HashMap<String, AppConfig>,
    /// player-facing `host/app` -> uplive `host/app`.
    live_to_uplive: HashMap<String, String>,
    /// uplive `host/app/stream` -> bound publisher.
    publishers: HashMap<String, PublisherEntry>,
}

pub struct StreamRegistry {
    inner: RwLock<Inner>,
}

impl StreamRegistry {
    /// Build the app and player-domain maps from one server block.
    pub fn from_server_config(server: &ServerConfig) -> StreamRegistry {
        let mut apps = HashMap::new();
        let mut live_to_uplive = HashMap::new();

        for app in &server.apps {
            let uplive = format!("{}/{}", server.domain_publisher, app.app_publisher);
            for player_domain in &server.domain_players {
                let live = format!("{}/{}", player_domain, app.app_player);
                debug!(%live, %uplive, "player endpoint mapped");
                live_to_uplive.insert(live, uplive.clone());
            }
            debug!(%uplive, "publisher endpoint registered");
            apps.insert(uplive, app.clone());
        }

        StreamRegistry {
            inner: RwLock::new(Inner {
                apps,
                live_to_uplive,
                publishers: HashMap::new(),
            }),
        }
    }

    /// Map a player-facing `host/app` to its uplive `host/app`.
    pub fn resolve(&self, host_app: &str) -> Option<String> {
        self.inner.read().live_to_uplive.get(host_app).cloned()
    }

    /// App configuration for an uplive `host/app`, if configured.
    pub fn app_config(&self, uplive_app: &str) -> Option<AppConfig> {
        self.inner.read().apps.get(uplive_app).cloned()
    }

    /// Bind a publisher to an uplive key, allocating the stream state.
    ///
    /// Atomic with respect to concurrent registration attempts: exactly one
    /// caller wins, the rest get `AlreadyPublishing`.
    pub fn register_publisher(
        &self,
        key: &str,
        role_id: RoleId,
        ring_capacity: usize
    ) -> Result<Arc<StreamState>> {
        let mut inner = self.inner.write();
        if inner.publishers.contains_key(key) {
            return Err(RelayError::AlreadyPublishing(key.to_string()));
        }
        let stream = StreamState::new(key, ring_capacity)?;
        inner.publishers.insert(key.to_string(), PublisherEntry {
            role_id,
            stream: Arc::clone(&stream),
        });
        info!(stream = %key, role_id, "publisher registered");
        Ok(stream)
    }

    pub fn get_publisher(&self, key: &str) -> Option<PublisherEntry> {
        self.inner.read().publishers.get(key).cloned()
    }

    /// Remove the binding if this exact role still holds it. Closing the
    /// stream state propagates teardown to every subscriber.
    pub fn unregister(&self, key: &str, role_id: RoleId) -> bool {
        let mut inner = self.inner.write();
        if inner.publishers.get(key).map_or(true, |entry| entry.role_id != role_id) {
            return false;
        }
        let entry = inner.publishers.remove(key);
        drop(inner);
        if let Some(entry) = entry {
            entry.stream.close();
        }
        info!(stream = %key, role_id, "publisher unregistered, stream closed");
        true
    }

    /// Keys of all currently bound publishers.
    pub fn publisher_keys(&self) -> Vec<String> {
        self.inner.read().publishers.keys().cloned().collect()
    }

    /// App maps for equality comparison across reloads.
    pub fn app_signature(&self) -> (Vec<(String, AppConfig)>, Vec<(String, String)>) {
        let inner = self.inner.read();
        let mut apps: Vec<_> = inner.apps
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let mut lives: Vec<_> = inner.live_to_uplive
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        apps.sort_by(|a, b| a.0.cmp(&b.0));
        lives.sort_by(|a, b| a.0.cmp(&b.0));
        (apps, lives)
    }
}

/// Walk an ordered ACL; the first entry matching the peer decides.
/// With no matching entry the connection is accepted.
pub fn evaluate_acl(entries: &[AclEntry], peer: IpAddr) -> AclAction {
    for entry in entries {
        if entry.matches(peer) {
            return entry.action;
        }
    }
    AclAction::Accept
}
