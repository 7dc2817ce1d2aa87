//! Push relays: mirror a local publisher to downstream origins.
//!
//! A pusher manager exists per uplive key and only ever acts while a local
//! publisher is bound; without one it parks in the retry queue. Mode `all`
//! maintains one session per upstream with per-URL backoff; mode `hash`
//! pins the stream to a single upstream and backs the whole manager off.

use std::collections::HashMap;
use std::sync::{ Arc, Weak };

use parking_lot::Mutex;
use tracing::{ debug, info, warn };

use crate::clock::monotonic_ms;
use crate::config::{ RelayConfig, RelayKind, RelayMode, ServerConfig };
use crate::error::{ RelayError, Result };
use crate::role::{ ReconnectHandler, Role };
use crate::transport;

use super::{ expand_template, hash_pick, RelayContext, RelayUrl };

struct PusherState {
    /// Mode `all`: upstream URL -> backoff window start.
    pending: HashMap<String, u64>,
    /// Mode `hash`: backoff window start for the single pinned upstream.
    backoff_start_ms: Option<u64>,
}

pub struct PusherManager {
    app_uplive: String,
    stream_name: String,
    conf: RelayConfig,
    ctx: RelayContext,
    state: Mutex<PusherState>,
    self_ref: Weak<PusherManager>,
}

impl PusherManager {
    pub fn new(
        app_uplive: &str,
        stream_name: &str,
        conf: RelayConfig,
        ctx: RelayContext
    ) -> Arc<PusherManager> {
        Arc::new_cyclic(|self_ref| PusherManager {
            app_uplive: app_uplive.to_string(),
            stream_name: stream_name.to_string(),
            conf,
            ctx,
            state: Mutex::new(PusherState {
                pending: HashMap::new(),
                backoff_start_ms: None,
            }),
            self_ref: self_ref.clone(),
        })
    }

    pub fn stream_key(&self) -> String {
        format!("{}/{}", self.app_uplive, self.stream_name)
    }

    /// Open push sessions for a freshly bound publisher.
    ///
    /// Failures are not fatal: unreachable upstreams go into the pending
    /// map and the manager enters the retry queue.
    pub fn start(&self) -> Result<()> {
        let key = self.stream_key();
        if self.ctx.registry.get_publisher(&key).is_none() {
            return Err(RelayError::NoPublisher(key));
        }

        let now = monotonic_ms();
        let mut connected = 0usize;
        match self.conf.mode {
            RelayMode::All => {
                for upstream in &self.conf.upstreams {
                    let expanded = expand_template(upstream, &self.stream_name);
                    match self.try_connect(&expanded) {
                        Ok(()) => {
                            connected += 1;
                        }
                        Err(e) => {
                            warn!(stream = %key, upstream = %expanded, error = %e, "push upstream failed");
                            self.state.lock().pending.insert(expanded, now);
                        }
                    }
                }
            }
            RelayMode::Hash => {
                let index = hash_pick(&self.stream_name, self.conf.upstreams.len());
                let expanded = expand_template(&self.conf.upstreams[index], &self.stream_name);
                match self.try_connect(&expanded) {
                    Ok(()) => {
                        connected += 1;
                    }
                    Err(e) => {
                        warn!(stream = %key, upstream = %expanded, error = %e, "push upstream failed");
                        self.state.lock().backoff_start_ms = Some(now);
                    }
                }
            }
            RelayMode::Loop => {
                return Err(RelayError::config("push relay cannot use mode 'loop'"));
            }
        }

        if connected < self.session_target() {
            // Some upstreams are down; park for retries.
            if let Some(this) = self.self_ref.upgrade() {
                self.ctx.hub.push_reconnect(this as Arc<dyn ReconnectHandler>);
            }
        }
        if connected == 0 {
            return Err(RelayError::UpstreamUnreachable(format!("no push upstream for '{key}'")));
        }
        Ok(())
    }

    fn session_target(&self) -> usize {
        match self.conf.mode {
            RelayMode::All => self.conf.upstreams.len(),
            _ => 1,
        }
    }

    fn try_connect(&self, url_text: &str) -> Result<()> {
        let url = RelayUrl::parse(url_text)?;
        let conn = transport::connect(
            url.socket_addr()?,
            &url.streamid,
            url.latency_or(self.ctx.default_latency_ms)
        )?;

        let key = self.stream_key();
        let entry = self.ctx.registry
            .get_publisher(&key)
            .ok_or_else(|| RelayError::NoPublisher(key.clone()))?;
        let handler = self.self_ref
            .upgrade()
            .ok_or_else(|| RelayError::UpstreamUnreachable("pusher manager retired".into()))?;

        let mut role = Role::pusher(
            conn,
            key.clone(),
            entry.stream,
            handler as Arc<dyn ReconnectHandler>,
            url.raw.clone(),
            monotonic_ms()
        );
        role.set_idle_timeout(self.conf.idle_streams_timeout_secs.or(self.ctx.idle_timeout_secs));
        role.activate();
        self.ctx.hub.dispatch(role);
        info!(stream = %key, upstream = %url.raw, "pusher connected");
        Ok(())
    }
}

impl ReconnectHandler for PusherManager {
    fn on_disconnect(&self, url: &str) {
        let now = monotonic_ms();
        let mut state = self.state.lock();
        match self.conf.mode {
            RelayMode::All => {
                state.pending.insert(url.to_string(), now);
            }
            // The hash mode records no URL; the whole manager backs off.
            _ => {
                state.backoff_start_ms = Some(now);
            }
        }
        debug!(stream = %self.stream_key(), url, "pusher down, backoff started");
    }

    fn reconnect(&self, now_ms: u64) -> bool {
        let key = self.stream_key();
        let interval_ms = self.conf.reconnect_interval_secs * 1000;
        let has_publisher = self.ctx.registry.get_publisher(&key).is_some();

        match self.conf.mode {
            RelayMode::All => {
                let due: Vec<String> = {
                    let state = self.state.lock();
                    state.pending
                        .iter()
                        .filter(|(_, since)| now_ms.saturating_sub(**since) >= interval_ms)
                        .map(|(url, _)| url.clone())
                        .collect()
                };
                for url in due {
                    if !has_publisher {
                        // Wait for the local publisher to come back.
                        self.state.lock().pending.insert(url, now_ms);
                        continue;
                    }
                    match self.try_connect(&url) {
                        Ok(()) => {
                            self.state.lock().pending.remove(&url);
                        }
                        Err(e) => {
                            debug!(stream = %key, upstream = %url, error = %e, "push retry failed");
                            self.state.lock().pending.insert(url, now_ms);
                        }
                    }
                }
                self.state.lock().pending.is_empty()
            }
            RelayMode::Hash => {
                {
                    let state = self.state.lock();
                    if let Some(start) = state.backoff_start_ms {
                        if now_ms.saturating_sub(start) < interval_ms {
                            return false;
                        }
                    }
                }
                self.state.lock().backoff_start_ms = Some(now_ms);
                if !has_publisher {
                    return false;
                }
                let index = hash_pick(&self.stream_name, self.conf.upstreams.len());
                let expanded = expand_template(&self.conf.upstreams[index], &self.stream_name);
                match self.try_connect(&expanded) {
                    Ok(()) => true,
                    Err(e) => {
                        debug!(stream = %key, error = %e, "push retry failed");
                        false
                    }
                }
            }
            RelayMode::Loop => true,
        }
    }
}

/// Push relay configuration per uplive app, plus materialized managers.
pub struct PusherMap {
    configs: HashMap<String, RelayConfig>,
    managers: Mutex<HashMap<String, Arc<PusherManager>>>,
    ctx: RelayContext,
}

impl PusherMap {
    pub fn new(server: &ServerConfig, ctx: RelayContext) -> PusherMap {
        let mut configs = HashMap::new();
        for app in &server.apps {
            let uplive = format!("{}/{}", server.domain_publisher, app.app_publisher);
            if let Some(relay) = app.relays.iter().find(|r| r.kind == RelayKind::Push) {
                configs.insert(uplive, relay.clone());
            }
        }
        PusherMap {
            configs,
            managers: Mutex::new(HashMap::new()),
            ctx,
        }
    }

    pub fn manager(&self, app_uplive: &str, stream_name: &str) -> Option<Arc<PusherManager>> {
        let conf = self.configs.get(app_uplive)?;
        let key = format!("{app_uplive}/{stream_name}");
        let mut managers = self.managers.lock();
        Some(
            Arc::clone(
                managers
                    .entry(key)
                    .or_insert_with(|| {
                        PusherManager::new(app_uplive, stream_name, conf.clone(), self.ctx.clone())
                    })
            )
        )
    }
}
