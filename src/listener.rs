//! Accept path: one listener thread per configured server block.
//!
//! The listener owns the listen-side socket. For every handshake request it
//! parses the stream id, classifies the connection as player or publisher
//! through the registry, walks the relevant ACL, and either rejects or
//! materializes a role and hands it to the next worker. All decisions are
//! synchronous on this thread; the only blocking call is the poll on the
//! listen socket.

use std::os::fd::BorrowedFd;
use std::sync::Arc;
use std::sync::atomic::{ AtomicBool, Ordering };

use nix::poll::{ poll, PollFd, PollFlags, PollTimeout };
use tracing::{ debug, info, warn };

use crate::clock::monotonic_ms;
use crate::config::{ AclAction, ServerConfig };
use crate::constants::{ DEFAULT_RING_CAPACITY, POLL_INTERVAL_MS };
use crate::error::{ RelayError, Result };
use crate::registry::{ next_role_id, StreamRegistry, evaluate_acl };
use crate::relay::{ PullerMap, PusherMap };
use crate::role::Role;
use crate::streamid::StreamId;
use crate::transport::{ Endpoint, HelloRequest };
use crate::worker::RoleHub;

pub struct Listener {
    endpoint: Endpoint,
    conf: ServerConfig,
    registry: Arc<StreamRegistry>,
    pullers: Arc<PullerMap>,
    pushers: Arc<PusherMap>,
    hub: Arc<RoleHub>,
    on_event_url: Option<String>,
    shutdown: Arc<AtomicBool>,
    /// Raised on reload: this listener stops accepting, workers drain.
    stop: Arc<AtomicBool>,
}

impl Listener {
    pub fn new(
        conf: ServerConfig,
        registry: Arc<StreamRegistry>,
        pullers: Arc<PullerMap>,
        pushers: Arc<PusherMap>,
        hub: Arc<RoleHub>,
        shutdown: Arc<AtomicBool>
    ) -> Result<Listener> {
        let endpoint = Endpoint::bind(conf.listen, conf.latency_ms)?;
        info!(port = endpoint.port(), "listener bound");
        Ok(Listener {
            on_event_url: conf.on_event_url.clone(),
            endpoint,
            conf,
            registry,
            pullers,
            pushers,
            hub,
            shutdown,
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn port(&self) -> u16 {
        self.endpoint.port()
    }

    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Accept loop; returns when shutdown or stop is raised.
    pub fn run(mut self) {
        info!(port = self.endpoint.port(), "listener accepting");
        while !self.shutdown.load(Ordering::Acquire) && !self.stop.load(Ordering::Acquire) {
            let fd = unsafe { BorrowedFd::borrow_raw(self.endpoint.raw_fd()) };
            let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
            match poll(&mut fds, PollTimeout::from(POLL_INTERVAL_MS as u8)) {
                Ok(0) => {
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "listener poll failed");
                    continue;
                }
            }
            loop {
                match self.endpoint.poll_hello() {
                    Ok(Some(request)) => self.handle_request(request),
                    Ok(None) => {
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "listen socket error");
                        break;
                    }
                }
            }
        }
        info!(port = self.endpoint.port(), "listener stopped");
    }

    fn handle_request(&mut self, request: HelloRequest) {
        let sid = match StreamId::parse(&request.streamid) {
            Ok(sid) => sid,
            Err(e) => {
                warn!(peer = %request.peer, error = %e, "rejecting connection");
                self.endpoint.reject(&request, "bad stream id");
                return;
            }
        };
        debug!(peer = %request.peer, sid = %sid.key(), "handshake request");

        let app_key = sid.app_key();
        if let Some(uplive_app) = self.registry.resolve(&app_key) {
            self.handle_player(&request, &sid, &uplive_app);
        } else if self.registry.app_config(&app_key).is_some() {
            self.handle_publisher(&request, &sid, &app_key);
        } else {
            warn!(peer = %request.peer, %app_key, "unknown app, rejecting");
            self.endpoint.reject(&request, "unknown app");
        }
    }

    fn handle_player(&mut self, request: &HelloRequest, sid: &StreamId, uplive_app: &str) {
        let key = format!("{}/{}", uplive_app, sid.stream);

        let Some(app) = self.registry.app_config(uplive_app) else {
            self.endpoint.reject(request, "no app configuration");
            return;
        };
        if evaluate_acl(&app.allow_play, request.peer.ip()) == AclAction::Deny {
            let err = RelayError::AclDeny(request.peer.ip());
            warn!(peer = %request.peer, stream = %key, error = %err, "rejecting player");
            self.endpoint.reject(request, "access denied");
            return;
        }

        // No publisher yet: maybe a pull relay can warm the stream.
        let mut entry = self.registry.get_publisher(&key);
        if entry.is_none() {
            if let Some(manager) = self.pullers.manager(uplive_app, &sid.stream) {
                match manager.start() {
                    Ok(()) => {
                        info!(stream = %key, "puller warmed the stream for a player");
                    }
                    Err(RelayError::AlreadyPublishing(_)) => {
                        // Another player's puller won the race; proceed.
                    }
                    Err(e) => {
                        warn!(stream = %key, error = %e, "puller start failed");
                    }
                }
                entry = self.registry.get_publisher(&key);
            }
        }
        let Some(entry) = entry else {
            info!(peer = %request.peer, stream = %key, "no publisher, rejecting player");
            self.endpoint.reject(request, "no publisher");
            return;
        };

        let conn = match self.endpoint.accept(request) {
            Ok(conn) => conn,
            Err(e) => {
                warn!(peer = %request.peer, error = %e, "player accept failed");
                return;
            }
        };
        let mut role = Role::player(conn, key.clone(), entry.stream, monotonic_ms());
        role.set_idle_timeout(self.conf.idle_streams_timeout_secs);
        role.set_event_url(self.on_event_url.clone());
        role.activate();
        info!(peer = %request.peer, stream = %key, "player attached");
        self.hub.dispatch(role);
    }

    fn handle_publisher(&mut self, request: &HelloRequest, sid: &StreamId, uplive_app: &str) {
        let key = sid.key();

        let Some(app) = self.registry.app_config(uplive_app) else {
            self.endpoint.reject(request, "no app configuration");
            return;
        };
        if evaluate_acl(&app.allow_publish, request.peer.ip()) == AclAction::Deny {
            let err = RelayError::AclDeny(request.peer.ip());
            warn!(peer = %request.peer, stream = %key, error = %err, "rejecting publisher");
            self.endpoint.reject(request, "access denied");
            return;
        }

        // Registration first: winning the registry slot is the atomic step,
        // then the handshake answer commits it.
        let role_id = next_role_id();
        let stream = match self.registry.register_publisher(&key, role_id, DEFAULT_RING_CAPACITY) {
            Ok(stream) => stream,
            Err(RelayError::AlreadyPublishing(_)) => {
                warn!(peer = %request.peer, stream = %key, "stream already has a publisher");
                self.endpoint.reject(request, "already publishing");
                return;
            }
            Err(e) => {
                warn!(peer = %request.peer, stream = %key, error = %e, "publisher setup failed");
                self.endpoint.reject(request, "internal error");
                return;
            }
        };

        let conn = match self.endpoint.accept(request) {
            Ok(conn) => conn,
            Err(e) => {
                warn!(peer = %request.peer, error = %e, "publisher accept failed");
                self.registry.unregister(&key, role_id);
                return;
            }
        };
        let mut role = Role::publisher(
            conn,
            key.clone(),
            stream,
            Arc::clone(&self.registry),
            role_id,
            monotonic_ms()
        );
        role.set_idle_timeout(self.conf.idle_streams_timeout_secs);
        role.set_event_url(self.on_event_url.clone());
        role.activate();
        info!(peer = %request.peer, stream = %key, "publisher attached");
        self.hub.dispatch(role);

        // Fan the new publisher out to configured downstream origins.
        if let Some(manager) = self.pushers.manager(uplive_app, &sid.stream) {
            if let Err(e) = manager.start() {
                warn!(stream = %key, error = %e, "pusher start failed");
            }
        }
    }
}
