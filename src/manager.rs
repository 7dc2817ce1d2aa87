//! Top-level lifecycle: boot, reload generations, shutdown.
//!
//! A [`Manager`] is one *generation* of the server: the workers, listeners,
//! registries, and relay maps built from one parsed configuration. A reload
//! does not mutate a running generation; it stops the old generation's
//! listeners, flags its workers to drain, and boots a fresh generation next
//! to it. The old one is polled for emptiness and joined once its last role
//! is gone, so in-flight streams persist across the reload.

use std::sync::Arc;
use std::sync::atomic::{ AtomicBool, Ordering };
use std::thread::JoinHandle;

use tracing::{ info, warn };

use crate::config::Config;
use crate::constants::DEFAULT_RING_CAPACITY;
use crate::error::Result;
use crate::listener::Listener;
use crate::registry::StreamRegistry;
use crate::relay::{ PullerMap, PusherMap, RelayContext };
use crate::stats::StatsHub;
use crate::worker::{ RoleHub, Worker };

struct ListenerHandle {
    port: u16,
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

pub struct Manager {
    hub: Arc<RoleHub>,
    reload: Arc<AtomicBool>,
    worker_handles: Vec<JoinHandle<()>>,
    /// Present in single-worker mode: the main thread drives its ticks.
    inline_worker: Option<Worker>,
    listeners: Vec<ListenerHandle>,
    registries: Vec<Arc<StreamRegistry>>,
}

impl Manager {
    /// Boot one generation from a parsed configuration.
    pub fn start(
        config: &Config,
        stats: Arc<StatsHub>,
        shutdown: Arc<AtomicBool>
    ) -> Result<Manager> {
        let inline = config.worker_threads == 0;
        let worker_count = config.worker_threads.max(1);
        let hub = RoleHub::new(worker_count, config.worker_connections);
        let reload = Arc::new(AtomicBool::new(false));

        // Bind every listen socket before spawning any thread, so a bad
        // port fails the boot cleanly.
        let mut listeners = Vec::new();
        let mut registries = Vec::new();
        for server in &config.servers {
            let registry = Arc::new(StreamRegistry::from_server_config(server));
            let ctx = RelayContext {
                registry: Arc::clone(&registry),
                hub: Arc::clone(&hub),
                ring_capacity: DEFAULT_RING_CAPACITY,
                idle_timeout_secs: server.idle_streams_timeout_secs,
                default_latency_ms: server.latency_ms,
            };
            let pullers = Arc::new(PullerMap::new(server, ctx.clone()));
            let pushers = Arc::new(PusherMap::new(server, ctx));
            let listener = Listener::new(
                server.clone(),
                Arc::clone(&registry),
                pullers,
                pushers,
                Arc::clone(&hub),
                Arc::clone(&shutdown)
            )?;
            registries.push(registry);
            listeners.push(listener);
        }

        let mut worker_handles = Vec::new();
        let mut inline_worker = None;
        for id in 0..worker_count {
            let mut worker = Worker::new(
                id,
                Arc::clone(&hub),
                Arc::clone(&stats),
                Arc::clone(&shutdown),
                Arc::clone(&reload),
                config.worker_connections,
                config.stat_post_interval_secs
            );
            if inline {
                inline_worker = Some(worker);
            } else {
                let handle = std::thread::Builder
                    ::new()
                    .name(format!("relay-worker-{id}"))
                    .spawn(move || worker.run())?;
                worker_handles.push(handle);
            }
        }

        let mut listener_handles = Vec::with_capacity(listeners.len());
        for listener in listeners {
            let port = listener.port();
            let stop = listener.stop_flag();
            let join = std::thread::Builder
                ::new()
                .name(format!("relay-listener-{port}"))
                .spawn(move || listener.run())?;
            listener_handles.push(ListenerHandle { port, stop, join: Some(join) });
        }

        info!(
            workers = worker_count,
            inline,
            servers = registries.len(),
            "manager generation started"
        );
        Ok(Manager {
            hub,
            reload,
            worker_handles,
            inline_worker,
            listeners: listener_handles,
            registries,
        })
    }

    pub fn ports(&self) -> Vec<u16> {
        self.listeners
            .iter()
            .map(|l| l.port)
            .collect()
    }

    pub fn registries(&self) -> &[Arc<StreamRegistry>] {
        &self.registries
    }

    pub fn hub(&self) -> Arc<RoleHub> {
        Arc::clone(&self.hub)
    }

    /// Drive the single worker one round; no-op with threaded workers.
    pub fn tick_inline(&mut self) -> usize {
        self.inline_worker.as_mut().map_or(0, |worker| worker.tick())
    }

    /// Begin retirement: stop accepting, let workers drain their roles.
    pub fn begin_drain(&mut self) {
        for listener in &mut self.listeners {
            listener.stop.store(true, Ordering::Release);
        }
        for listener in &mut self.listeners {
            if let Some(join) = listener.join.take() {
                let _ = join.join();
            }
        }
        self.reload.store(true, Ordering::Release);
        info!("manager generation draining");
    }

    /// True once every worker of this generation has finished.
    pub fn drained(&self) -> bool {
        match &self.inline_worker {
            Some(worker) => worker.role_count() == 0,
            None => self.worker_handles.iter().all(|h| h.is_finished()),
        }
    }

    /// Join all remaining threads. Workers exit via the global shutdown
    /// flag or a reload drain; call only after one of those is in motion.
    pub fn finish(mut self) {
        for listener in &mut self.listeners {
            listener.stop.store(true, Ordering::Release);
            if let Some(join) = listener.join.take() {
                let _ = join.join();
            }
        }
        for handle in self.worker_handles.drain(..) {
            if handle.join().is_err() {
                warn!("worker thread panicked");
            }
        }
    }
}
