//! Pull relays: fetch a stream from an upstream origin on player demand.
//!
//! A puller manager exists per uplive key. Its `start` connects to one
//! upstream (policy: loop or hash) and registers the resulting session as
//! the stream's publisher; from then on the puller role behaves exactly
//! like an accepted publisher. When the session dies, the worker requeues
//! the manager and `reconnect` retries after the configured backoff.

use std::collections::HashMap;
use std::sync::{ Arc, Weak };

use parking_lot::Mutex;
use tracing::{ debug, info, warn };

use crate::clock::monotonic_ms;
use crate::config::{ RelayConfig, RelayKind, RelayMode, ServerConfig };
use crate::error::{ RelayError, Result };
use crate::registry::next_role_id;
use crate::role::{ ReconnectHandler, Role };
use crate::transport;

use super::{ expand_template, hash_pick, RelayContext, RelayUrl };

struct PullerState {
    /// Loop-mode position: the index of the upstream used last.
    loop_index: Option<usize>,
    /// Start of the current backoff window, if a session died.
    backoff_start_ms: Option<u64>,
}

pub struct PullerManager {
    app_uplive: String,
    stream_name: String,
    conf: RelayConfig,
    ctx: RelayContext,
    state: Mutex<PullerState>,
    /// Handle to the owning Arc, cloned into each puller role it creates.
    self_ref: Weak<PullerManager>,
}

impl PullerManager {
    pub fn new(
        app_uplive: &str,
        stream_name: &str,
        conf: RelayConfig,
        ctx: RelayContext
    ) -> Arc<PullerManager> {
        Arc::new_cyclic(|self_ref| PullerManager {
            app_uplive: app_uplive.to_string(),
            stream_name: stream_name.to_string(),
            conf,
            ctx,
            state: Mutex::new(PullerState {
                loop_index: None,
                backoff_start_ms: None,
            }),
            self_ref: self_ref.clone(),
        })
    }

    pub fn stream_key(&self) -> String {
        format!("{}/{}", self.app_uplive, self.stream_name)
    }

    /// Connect an upstream and install the puller as publisher.
    ///
    /// Never starts while a publisher exists; the caller only invokes this
    /// on the no-publisher path and on reconnect.
    pub fn start(&self) -> Result<()> {
        let key = self.stream_key();
        if self.ctx.registry.get_publisher(&key).is_some() {
            return Err(RelayError::AlreadyPublishing(key));
        }
        match self.conf.mode {
            RelayMode::Loop => self.connect_loop(),
            RelayMode::Hash => {
                let index = hash_pick(&self.stream_name, self.conf.upstreams.len());
                self.try_connect(&self.conf.upstreams[index])
            }
            RelayMode::All => Err(RelayError::config("pull relay cannot use mode 'all'")),
        }
    }

    /// Loop mode: resume after the last used upstream and try each entry
    /// once; a full circle without success fails the attempt.
    fn connect_loop(&self) -> Result<()> {
        let count = self.conf.upstreams.len();
        let start = {
            let state = self.state.lock();
            state.loop_index.map_or(0, |i| (i + 1) % count)
        };

        let mut last_err = RelayError::UpstreamUnreachable("no upstreams".into());
        for offset in 0..count {
            let index = (start + offset) % count;
            match self.try_connect(&self.conf.upstreams[index]) {
                Ok(()) => {
                    self.state.lock().loop_index = Some(index);
                    return Ok(());
                }
                Err(e) => {
                    debug!(
                        stream = %self.stream_key(),
                        upstream = %self.conf.upstreams[index],
                        error = %e,
                        "pull upstream attempt failed"
                    );
                    last_err = e;
                }
            }
        }
        self.state.lock().loop_index = Some((start + count - 1) % count);
        warn!(stream = %self.stream_key(), "no pull upstream available");
        Err(last_err)
    }

    fn try_connect(&self, upstream: &str) -> Result<()> {
        let url = RelayUrl::parse(&expand_template(upstream, &self.stream_name))?;
        let conn = transport::connect(
            url.socket_addr()?,
            &url.streamid,
            url.latency_or(self.ctx.default_latency_ms)
        )?;

        let handler = self.self_ref
            .upgrade()
            .ok_or_else(|| RelayError::UpstreamUnreachable("puller manager retired".into()))?;

        let key = self.stream_key();
        let role_id = next_role_id();
        let stream = self.ctx.registry.register_publisher(&key, role_id, self.ctx.ring_capacity)?;
        let mut role = Role::puller(
            conn,
            key.clone(),
            stream,
            Arc::clone(&self.ctx.registry),
            role_id,
            handler as Arc<dyn ReconnectHandler>,
            url.raw.clone(),
            monotonic_ms()
        );
        role.set_idle_timeout(self.conf.idle_streams_timeout_secs.or(self.ctx.idle_timeout_secs));
        role.activate();
        self.ctx.hub.dispatch(role);
        info!(stream = %self.stream_key(), upstream = %url.raw, "puller connected");
        Ok(())
    }
}

impl ReconnectHandler for PullerManager {
    fn on_disconnect(&self, url: &str) {
        let mut state = self.state.lock();
        state.backoff_start_ms = Some(monotonic_ms());
        debug!(stream = %self.stream_key(), url, "puller down, backoff started");
    }

    fn reconnect(&self, now_ms: u64) -> bool {
        {
            let state = self.state.lock();
            if let Some(start) = state.backoff_start_ms {
                if now_ms.saturating_sub(start) < self.conf.reconnect_interval_secs * 1000 {
                    return false;
                }
            }
        }
        self.state.lock().backoff_start_ms = Some(now_ms);

        match self.start() {
            Ok(()) => {
                info!(stream = %self.stream_key(), "puller reconnected");
                true
            }
            // A live publisher arrived by other means; nothing to pull.
            Err(RelayError::AlreadyPublishing(_)) => true,
            Err(e) => {
                debug!(stream = %self.stream_key(), error = %e, "puller reconnect failed");
                false
            }
        }
    }
}

/// Pull relay configuration per uplive app, plus materialized managers.
pub struct PullerMap {
    configs: HashMap<String, RelayConfig>,
    managers: Mutex<HashMap<String, Arc<PullerManager>>>,
    ctx: RelayContext,
}

impl PullerMap {
    pub fn new(server: &ServerConfig, ctx: RelayContext) -> PullerMap {
        let mut configs = HashMap::new();
        for app in &server.apps {
            let uplive = format!("{}/{}", server.domain_publisher, app.app_publisher);
            if let Some(relay) = app.relays.iter().find(|r| r.kind == RelayKind::Pull) {
                configs.insert(uplive, relay.clone());
            }
        }
        PullerMap {
            configs,
            managers: Mutex::new(HashMap::new()),
            ctx,
        }
    }

    pub fn is_configured(&self, app_uplive: &str) -> bool {
        self.configs.contains_key(app_uplive)
    }

    /// The manager for one stream, created on first use.
    pub fn manager(&self, app_uplive: &str, stream_name: &str) -> Option<Arc<PullerManager>> {
        let conf = self.configs.get(app_uplive)?;
        let key = format!("{app_uplive}/{stream_name}");
        let mut managers = self.managers.lock();
        Some(
            Arc::clone(
                managers
                    .entry(key)
                    .or_insert_with(|| {
                        PullerManager::new(app_uplive, stream_name, conf.clone(), self.ctx.clone())
                    })
            )
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::constants::DEFAULT_RING_CAPACITY;
    use crate::registry::StreamRegistry;
    use crate::transport::Endpoint;
    use crate::worker::RoleHub;
    use std::time::Duration;

    fn context(registry: Arc<StreamRegistry>, hub: Arc<RoleHub>) -> RelayContext {
        RelayContext {
            registry,
            hub,
            ring_capacity: DEFAULT_RING_CAPACITY,
            idle_timeout_secs: None,
            default_latency_ms: 100,
        }
    }

    fn registry() -> Arc<StreamRegistry> {
        let config = Config::parse_str(
            r#"
srt {
    server {
        listen 4001;
        domain_player play.example;
        domain_publisher publish.example;
        app { app_publisher live; app_player live; }
    }
}
"#
        ).unwrap();
        Arc::new(StreamRegistry::from_server_config(&config.servers[0]))
    }

    /// An origin that accepts every hello, so pull sessions can connect.
    fn accepting_origin() -> (u16, std::thread::JoinHandle<()>) {
        let mut endpoint = Endpoint::bind(0, 100).unwrap();
        let port = endpoint.port();
        let handle = std::thread::spawn(move || {
            let deadline = std::time::Instant::now() + Duration::from_secs(3);
            let mut sessions = Vec::new();
            while std::time::Instant::now() < deadline {
                if let Some(req) = endpoint.poll_hello().unwrap() {
                    sessions.push(endpoint.accept(&req).unwrap());
                }
                std::thread::sleep(Duration::from_millis(5));
            }
        });
        (port, handle)
    }

    /// An origin that rejects every hello.
    fn rejecting_origin() -> (u16, std::thread::JoinHandle<()>) {
        let mut endpoint = Endpoint::bind(0, 100).unwrap();
        let port = endpoint.port();
        let handle = std::thread::spawn(move || {
            let deadline = std::time::Instant::now() + Duration::from_secs(3);
            while std::time::Instant::now() < deadline {
                if let Some(req) = endpoint.poll_hello().unwrap() {
                    endpoint.reject(&req, "refusing");
                }
                std::thread::sleep(Duration::from_millis(5));
            }
        });
        (port, handle)
    }

    fn pull_conf(upstreams: Vec<String>, mode: RelayMode) -> RelayConfig {
        RelayConfig {
            kind: RelayKind::Pull,
            mode,
            reconnect_interval_secs: 1,
            idle_streams_timeout_secs: None,
            upstreams,
        }
    }

    #[test]
    fn loop_mode_fails_over_to_next_upstream() {
        let registry = registry();
        let hub = RoleHub::new(1, 16);
        let (bad_port, _bad) = rejecting_origin();
        let (good_port, _good) = accepting_origin();

        let conf = pull_conf(
            vec![
                format!("127.0.0.1:{bad_port}?streamid=up/live/{{stream_name}}"),
                format!("127.0.0.1:{good_port}?streamid=up/live/{{stream_name}}")
            ],
            RelayMode::Loop
        );
        let manager = PullerManager::new(
            "publish.example/live",
            "demo",
            conf,
            context(Arc::clone(&registry), Arc::clone(&hub))
        );

        manager.start().unwrap();
        // The puller is now the stream's publisher and a role was queued.
        assert!(registry.get_publisher("publish.example/live/demo").is_some());
        assert!(hub.queue(0).pop().is_some());
    }

    #[test]
    fn start_refuses_when_publisher_exists() {
        let registry = registry();
        let hub = RoleHub::new(1, 16);
        let key = "publish.example/live/demo";
        registry.register_publisher(key, 42, DEFAULT_RING_CAPACITY).unwrap();

        let conf = pull_conf(vec!["127.0.0.1:1?streamid=up/live/demo".into()], RelayMode::Loop);
        let manager = PullerManager::new(
            "publish.example/live",
            "demo",
            conf,
            context(registry, hub)
        );
        assert!(matches!(manager.start(), Err(RelayError::AlreadyPublishing(_))));
    }

    #[test]
    fn reconnect_respects_backoff_window() {
        let registry = registry();
        let hub = RoleHub::new(1, 16);
        let conf = pull_conf(vec!["127.0.0.1:1?streamid=up/live/demo".into()], RelayMode::Hash);
        let manager = PullerManager::new(
            "publish.example/live",
            "demo",
            conf,
            context(registry, hub)
        );

        manager.on_disconnect("srt://127.0.0.1:1?streamid=up/live/demo");
        let start = manager.state.lock().backoff_start_ms.unwrap();
        // Inside the 1 s window: no attempt is made at all.
        assert!(!manager.reconnect(start + 500));
        assert_eq!(manager.state.lock().backoff_start_ms.unwrap(), start);
        // Window expired: an attempt happens (and fails against a dead port),
        // and the backoff restarts from this attempt.
        assert!(!manager.reconnect(start + 1500));
        assert_eq!(manager.state.lock().backoff_start_ms.unwrap(), start + 1500);
    }

    #[test]
    fn reconnect_yields_when_publisher_reappeared() {
        let registry = registry();
        let hub = RoleHub::new(1, 16);
        let key = "publish.example/live/demo";
        let conf = pull_conf(vec!["127.0.0.1:1?streamid=up/live/demo".into()], RelayMode::Loop);
        let manager = PullerManager::new(
            "publish.example/live",
            "demo",
            conf,
            context(Arc::clone(&registry), hub)
        );

        manager.on_disconnect("srt://127.0.0.1:1?streamid=up/live/demo");
        registry.register_publisher(key, 7, DEFAULT_RING_CAPACITY).unwrap();
        let start = manager.state.lock().backoff_start_ms.unwrap();
        // The manager leaves the retry queue: someone else publishes now.
        assert!(manager.reconnect(start + 2000));
    }

    #[test]
    fn managers_are_cached_per_stream() {
        let registry = registry();
        let hub = RoleHub::new(1, 16);
        let config = Config::parse_str(
            r#"
srt {
    server {
        listen 4001;
        domain_player play.example;
        domain_publisher publish.example;
        app {
            app_publisher live;
            app_player live;
            relay { type pull; mode loop; upstreams 127.0.0.1:1?streamid=up/live/x; }
        }
    }
}
"#
        ).unwrap();
        let map = PullerMap::new(&config.servers[0], context(registry, hub));
        assert!(map.is_configured("publish.example/live"));
        assert!(!map.is_configured("publish.example/other"));

        let a = map.manager("publish.example/live", "demo").unwrap();
        let b = map.manager("publish.example/live", "demo").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(map.manager("publish.example/other", "demo").is_none());
    }
}
