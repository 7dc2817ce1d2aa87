//! Connection-multiplexing workers.
//!
//! Each worker is one OS thread owning a poll set and an `fd -> Role` map.
//! It is the sole mutator of that map and the only caller of socket I/O on
//! its roles; the only cross-thread surface is a bounded intake queue fed by
//! listeners and relay managers. A tick drains the intake, polls readiness,
//! dispatches readable/writable roles, sweeps invalid and idle roles, and
//! retries pending relay reconnections. The worker never aborts because one
//! role failed.

use std::collections::HashMap;
use std::os::fd::BorrowedFd;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::sync::atomic::{ AtomicBool, AtomicUsize, Ordering };

use crossbeam::queue::ArrayQueue;
use nix::poll::{ poll, PollFd, PollFlags, PollTimeout };
use tracing::{ debug, error, info, trace, warn };

use crate::clock::monotonic_ms;
use crate::constants::POLL_INTERVAL_MS;
use crate::role::{ ReconnectHandler, Role, RoleState };
use crate::stats::StatsHub;

/// Round-robin dispatcher handing new roles to worker intake queues, plus
/// a shared queue of relay managers waiting for a retry slot.
pub struct RoleHub {
    queues: Vec<Arc<ArrayQueue<Role>>>,
    next: AtomicUsize,
    reconnects: ArrayQueue<Arc<dyn ReconnectHandler>>,
}

impl RoleHub {
    pub fn new(workers: usize, queue_capacity: usize) -> Arc<RoleHub> {
        assert!(workers > 0, "at least one worker queue");
        Arc::new(RoleHub {
            queues: (0..workers).map(|_| Arc::new(ArrayQueue::new(queue_capacity))).collect(),
            next: AtomicUsize::new(0),
            reconnects: ArrayQueue::new(256),
        })
    }

    /// Park a relay manager for retries on whichever worker drains it.
    pub fn push_reconnect(&self, handler: Arc<dyn ReconnectHandler>) {
        if self.reconnects.push(handler).is_err() {
            warn!("reconnect queue full, dropping relay retry request");
        }
    }

    pub fn pop_reconnect(&self) -> Option<Arc<dyn ReconnectHandler>> {
        self.reconnects.pop()
    }

    pub fn worker_count(&self) -> usize {
        self.queues.len()
    }

    pub fn queue(&self, worker_id: usize) -> Arc<ArrayQueue<Role>> {
        Arc::clone(&self.queues[worker_id])
    }

    /// Hand a role to the next worker, trying each queue once.
    ///
    /// On total overload the role is uninitialized and dropped here; the
    /// peer sees a shutdown rather than a dangling session.
    pub fn dispatch(&self, role: Role) {
        let start = self.next.fetch_add(1, Ordering::Relaxed);
        let n = self.queues.len();
        let mut role = role;
        for i in 0..n {
            match self.queues[(start + i) % n].push(role) {
                Ok(()) => {
                    return;
                }
                Err(back) => {
                    role = back;
                }
            }
        }
        error!(
            stream = %role.stream_key(),
            "all worker intake queues full, dropping role"
        );
        role.uninit();
    }
}

pub struct Worker {
    id: usize,
    hub: Arc<RoleHub>,
    intake: Arc<ArrayQueue<Role>>,
    roles: HashMap<RawFd, Role>,
    reconnect: Vec<Arc<dyn ReconnectHandler>>,
    stats: Arc<StatsHub>,
    shutdown: Arc<AtomicBool>,
    reload: Arc<AtomicBool>,
    worker_connections: usize,
    stat_interval_ms: u64,
    last_stat_ms: u64,
}

impl Worker {
    pub fn new(
        id: usize,
        hub: Arc<RoleHub>,
        stats: Arc<StatsHub>,
        shutdown: Arc<AtomicBool>,
        reload: Arc<AtomicBool>,
        worker_connections: usize,
        stat_interval_secs: u64
    ) -> Worker {
        Worker {
            id,
            intake: hub.queue(id),
            hub,
            roles: HashMap::new(),
            reconnect: Vec::new(),
            stats,
            shutdown,
            reload,
            worker_connections,
            stat_interval_ms: stat_interval_secs * 1000,
            last_stat_ms: monotonic_ms(),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn role_count(&self) -> usize {
        self.roles.len()
    }

    /// Thread body: tick until shutdown, or until a reload drains the map.
    pub fn run(&mut self) {
        info!(worker = self.id, "worker started");
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }
            self.tick();
            if self.reload.load(Ordering::Acquire) && self.roles.is_empty() {
                info!(worker = self.id, "reload drained, worker exiting");
                break;
            }
        }
        self.clear();
        self.stats.retire(self.id);
        info!(worker = self.id, "worker stopped");
    }

    /// One scheduling round. Public so single-worker mode can drive it
    /// inline from the main thread. Returns the number of work units done.
    pub fn tick(&mut self) -> usize {
        let now = monotonic_ms();
        let mut work = 0;

        work += self.drain_intake();
        work += self.poll_round();
        self.sweep(monotonic_ms());
        while let Some(handler) = self.hub.pop_reconnect() {
            self.reconnect.push(handler);
        }
        self.reconnect_pass(monotonic_ms());
        if now.saturating_sub(self.last_stat_ms) >= self.stat_interval_ms {
            self.publish_stats(now);
            self.last_stat_ms = now;
        }
        work
    }

    fn drain_intake(&mut self) -> usize {
        let mut taken = 0;
        while let Some(role) = self.intake.pop() {
            if self.roles.len() >= self.worker_connections {
                warn!(
                    worker = self.id,
                    limit = self.worker_connections,
                    stream = %role.stream_key(),
                    "connection limit reached, rejecting role"
                );
                let mut role = role;
                role.uninit();
                continue;
            }
            let fd = role.raw_fd();
            debug!(
                worker = self.id,
                fd,
                role = role.tag().as_str(),
                stream = %role.stream_key(),
                total = self.roles.len() + 1,
                "role registered"
            );
            self.roles.insert(fd, role);
            taken += 1;
        }
        taken
    }

    fn poll_round(&mut self) -> usize {
        // poll(2) with an empty set still sleeps for the timeout, which is
        // exactly the idle behaviour we want when the map is empty.
        let mut fds: Vec<PollFd> = Vec::with_capacity(self.roles.len());
        let mut order: Vec<RawFd> = Vec::with_capacity(self.roles.len());
        for (fd, role) in &self.roles {
            let mut flags = PollFlags::POLLIN;
            if role.wants_write() {
                flags |= PollFlags::POLLOUT;
            }
            // The fd stays valid for the duration of the call: the role map
            // is not mutated while polling.
            fds.push(PollFd::new(unsafe { BorrowedFd::borrow_raw(*fd) }, flags));
            order.push(*fd);
        }

        let ready = match poll(&mut fds, PollTimeout::from(POLL_INTERVAL_MS as u8)) {
            Ok(n) => n,
            Err(e) => {
                warn!(worker = self.id, error = %e, "poll failed");
                return 0;
            }
        };
        if ready == 0 {
            return 0;
        }

        let now = monotonic_ms();
        let mut work = 0;
        let revents: Vec<(RawFd, PollFlags)> = order
            .into_iter()
            .zip(fds.iter())
            .map(|(fd, pollfd)| (fd, pollfd.revents().unwrap_or(PollFlags::empty())))
            .collect();

        for (fd, flags) in revents {
            let Some(role) = self.roles.get_mut(&fd) else {
                continue;
            };
            if flags.intersects(PollFlags::POLLERR | PollFlags::POLLHUP | PollFlags::POLLNVAL) {
                trace!(worker = self.id, fd, "poll reported error condition");
                role.mark_invalid();
                continue;
            }
            if flags.contains(PollFlags::POLLIN) {
                match role.on_readable(now) {
                    Ok(n) => {
                        work += n;
                    }
                    // Only terminal errors take the role down; anything
                    // else is logged and the role stays in the map.
                    Err(e) if e.is_terminal_for_role() => {
                        debug!(worker = self.id, fd, error = %e, "read handler failed");
                        role.mark_invalid();
                        continue;
                    }
                    Err(e) => {
                        warn!(worker = self.id, fd, error = %e, "read handler error");
                    }
                }
            }
            if flags.contains(PollFlags::POLLOUT) {
                match role.on_writable(now) {
                    Ok(n) => {
                        work += n;
                    }
                    Err(e) if e.is_terminal_for_role() => {
                        debug!(worker = self.id, fd, error = %e, "write handler failed");
                        role.mark_invalid();
                    }
                    Err(e) => {
                        warn!(worker = self.id, fd, error = %e, "write handler error");
                    }
                }
            }
        }
        work
    }

    /// Remove roles that are invalid, idle, or externally torn down.
    fn sweep(&mut self, now: u64) {
        let dead: Vec<RawFd> = self.roles
            .iter_mut()
            .filter_map(|(fd, role)| {
                match role.check_state(now) {
                    RoleState::Invalid | RoleState::Uninitialized => Some(*fd),
                    _ => None,
                }
            })
            .collect();

        for fd in dead {
            let Some(mut role) = self.roles.remove(&fd) else {
                continue;
            };
            info!(
                worker = self.id,
                fd,
                role = role.tag().as_str(),
                stream = %role.stream_key(),
                remaining = self.roles.len(),
                "sweeping role"
            );
            role.uninit();
            if let Some(handler) = role.reconnect_handler() {
                self.reconnect.push(handler);
            }
        }
    }

    fn reconnect_pass(&mut self, now: u64) {
        if self.reconnect.is_empty() {
            return;
        }
        self.reconnect.retain(|handler| !handler.reconnect(now));
    }

    fn publish_stats(&mut self, now: u64) {
        let mut batch = Vec::with_capacity(self.roles.len());
        for role in self.roles.values_mut() {
            let reset = role.tag().is_publishing() && self.stats.take_reset(role.stream_key());
            batch.push(role.snapshot(now, reset));
        }
        self.stats.publish(self.id, batch);
    }

    /// Tear down every owned role; used at shutdown.
    fn clear(&mut self) {
        for (_, mut role) in self.roles.drain() {
            role.uninit();
        }
    }
}
