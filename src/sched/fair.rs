use std::{
    cmp, io,
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, Instant},
};

use slab::Slab;
use tracing::{debug, trace};
use typed_builder::TypedBuilder;

use super::{
    list::{ConnectionList, Entry},
    IDLE_SWEEP_INTERVAL, IDLE_THRESHOLD,
};

/// Result of a non-blocking readability probe on a connection.
pub enum ReadReadiness {
    /// Data can be read right now without blocking.
    Ready,
    /// No data; the connection has been in this state for `stalled_for`.
    NotReady { stalled_for: Duration },
}

/// The external byte-budget authority shared by one or more schedulers.
///
/// A tick may consume at most [`RateBudget::current_allowance`] bytes across
/// all connections; whatever was actually consumed is reported back through
/// [`RateBudget::bytes_processed`].
pub trait RateBudget {
    fn current_allowance(&self) -> usize;
    fn bytes_processed(&self, n: usize);
}

impl<T: RateBudget + ?Sized> RateBudget for Arc<T> {
    fn current_allowance(&self) -> usize {
        (**self).current_allowance()
    }

    fn bytes_processed(&self, n: usize) {
        (**self).bytes_processed(n)
    }
}

/// One live network connection as seen by the scheduler.
///
/// The scheduler never owns the transport; it only probes readiness, performs
/// bounded reads, and reports per-connection faults to the failure sink. The
/// connection itself tracks how long it has been without traffic and reports
/// it through [`SchedConnection::ready_for_read`].
pub trait SchedConnection {
    fn ready_for_read(&self) -> ReadReadiness;

    /// Reads up to `max_bytes` from the transport, returning the count
    /// actually consumed. Must never block.
    fn receive_from_transport(&self, max_bytes: usize) -> io::Result<usize>;

    /// The largest read the connection wants per invocation (its MSS).
    fn preferred_chunk(&self) -> usize;

    /// Failure sink: a read fault is delivered here and the connection's
    /// owner is expected to remove it afterwards.
    fn notify_of_error(&self, err: io::Error);

    fn describe(&self) -> String;
}

#[derive(TypedBuilder, Clone, Debug)]
pub struct SchedulerConfig {
    /// How long a connection may report "not ready" before demotion to the
    /// idle list.
    #[builder(default = IDLE_THRESHOLD)]
    pub idle_threshold: Duration,
    /// Minimum interval between sweeps of the idle list.
    #[builder(default = IDLE_SWEEP_INTERVAL)]
    pub sweep_interval: Duration,
    /// Comparable priority hint for an outer multiplexer running several
    /// schedulers against one shared budget. Carries no behavior here.
    #[builder(default = 0)]
    pub priority: u32,
    /// Boost hint for the same outer multiplexer.
    #[builder(default = false)]
    pub boost: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

enum PendingAction<C> {
    Add(C),
    Remove(C),
}

/// Registration state shared with callers on other threads. Held only for
/// the few instructions it takes to push or drain, never across a read.
struct PendingState<C> {
    actions: Vec<PendingAction<C>>,
    /// Every connection currently believed present (lists + pending adds),
    /// used to answer membership on the removal path.
    members: Vec<C>,
}

/// A rate-controlled, fair-share read scheduler.
///
/// Every call to [`FairScheduler::do_processing`] distributes the budget's
/// current allowance across the active connections in strict round-robin
/// order: a connection that was just serviced moves to the back of the queue.
/// Connections that have been without traffic past the idle threshold are
/// demoted to a low-frequency idle list and promoted back to the *front* of
/// the active list once a periodic sweep finds them ready again.
///
/// The scheduler has no thread of its own; exactly one caller drives
/// `do_processing` on its own cadence. Registration from other threads goes
/// through a mutex-guarded pending queue drained at the start of each tick,
/// so the iteration path itself never takes a lock.
pub struct FairScheduler<C, B> {
    arena: Slab<Entry<C>>,
    active: ConnectionList,
    idle: ConnectionList,
    pending: Mutex<PendingState<C>>,
    budget: B,
    config: SchedulerConfig,
    last_sweep: Instant,
}

impl<C, B> FairScheduler<C, B>
where
    C: SchedConnection + Clone + PartialEq,
    B: RateBudget,
{
    pub fn new(budget: B, config: SchedulerConfig) -> Self {
        Self {
            arena: Slab::new(),
            active: ConnectionList::new(),
            idle: ConnectionList::new(),
            pending: Mutex::new(PendingState {
                actions: Vec::new(),
                members: Vec::new(),
            }),
            budget,
            config,
            last_sweep: Instant::now(),
        }
    }

    fn lock_pending(&self) -> MutexGuard<'_, PendingState<C>> {
        // a poisoned queue is still structurally sound
        self.pending.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Queues a connection for insertion into the active list at the start of
    /// the next tick. Safe to call from any thread.
    pub fn add_connection(&self, conn: C) {
        trace!(conn = %conn.describe(), "queueing connection add");
        let mut pending = self.lock_pending();
        pending.members.push(conn.clone());
        pending.actions.push(PendingAction::Add(conn));
    }

    /// Queues a connection for removal; returns false if it was never added
    /// (or already removed). Safe to call from any thread.
    pub fn remove_connection(&self, conn: &C) -> bool {
        let mut pending = self.lock_pending();
        let Some(pos) = pending.members.iter().position(|m| m == conn) else {
            return false;
        };
        pending.members.remove(pos);
        // an add that never reached the lists can be cancelled outright
        let cancelled = pending
            .actions
            .iter()
            .position(|a| matches!(a, PendingAction::Add(c) if c == conn));
        match cancelled {
            Some(i) => {
                pending.actions.remove(i);
            }
            None => pending.actions.push(PendingAction::Remove(conn.clone())),
        }
        trace!(conn = %conn.describe(), "queueing connection removal");
        true
    }

    /// True iff the budget currently allows at least one byte.
    pub fn can_process(&self) -> bool {
        self.budget.current_allowance() >= 1
    }

    /// Active + idle entries, as of the last tick.
    pub fn connection_count(&self) -> usize {
        self.active.len() + self.idle.len()
    }

    /// Active connections currently reporting ready. Diagnostic only; callers
    /// use it to decide whether invoking [`FairScheduler::do_processing`] is
    /// worth it at all.
    pub fn ready_connection_count(&self) -> usize {
        let mut count = 0;
        let mut cur = self.active.head();
        while let Some(key) = cur {
            if matches!(
                self.arena[key.0].conn.ready_for_read(),
                ReadReadiness::Ready
            ) {
                count += 1;
            }
            cur = self.active.next(&self.arena, key);
        }
        count
    }

    pub fn priority(&self) -> u32 {
        self.config.priority
    }

    pub fn boost(&self) -> bool {
        self.config.boost
    }

    pub fn set_boost(&mut self, boost: bool) {
        self.config.boost = boost;
    }

    pub fn describe(&self) -> String {
        format!(
            "fair-sched[active={} idle={} prio={}{}]",
            self.active.len(),
            self.idle.len(),
            self.config.priority,
            if self.config.boost { " boost" } else { "" },
        )
    }

    /// Runs one scheduling tick under the budget's allowance, optionally
    /// capped by `max_bytes` (0 means no extra cap), and returns the bytes
    /// consumed across all serviced connections.
    pub fn do_processing(&mut self, max_bytes: usize) -> usize {
        let mut allowance = self.budget.current_allowance();
        if allowance == 0 {
            trace!("no bytes allowed this tick");
            return 0;
        }
        if max_bytes > 0 && max_bytes < allowance {
            allowance = max_bytes;
        }

        self.apply_pending();

        if self.last_sweep.elapsed() >= self.config.sweep_interval {
            self.sweep_idle();
            self.last_sweep = Instant::now();
        }

        let mut remaining = allowance;
        let mut consumed = 0;
        // bound the walk by the length captured here so entries re-linked to
        // the tail are not visited twice in the same tick
        let mut visits = self.active.len();
        let mut cur = self.active.head();
        while remaining > 0 && visits > 0 {
            let Some(key) = cur else { break };
            let next = self.active.next(&self.arena, key);
            match self.arena[key.0].conn.ready_for_read() {
                ReadReadiness::Ready => {
                    let allowed =
                        cmp::min(remaining, self.arena[key.0].conn.preferred_chunk());
                    match self.arena[key.0].conn.receive_from_transport(allowed) {
                        Ok(n) => {
                            // a connection must not consume more than offered
                            let n = cmp::min(n, allowed);
                            remaining -= n;
                            consumed += n;
                        }
                        Err(err) => {
                            let conn = &self.arena[key.0].conn;
                            debug!(
                                conn = %conn.describe(),
                                error = %err,
                                "read failed; notifying owner"
                            );
                            conn.notify_of_error(err);
                        }
                    }
                    self.active.move_to_end(&mut self.arena, key);
                }
                ReadReadiness::NotReady { stalled_for }
                    if stalled_for > self.config.idle_threshold =>
                {
                    trace!(
                        conn = %self.arena[key.0].conn.describe(),
                        ?stalled_for,
                        "demoting stalled connection to idle"
                    );
                    self.active.unlink(&mut self.arena, key);
                    self.idle.add_to_end(&mut self.arena, key);
                }
                ReadReadiness::NotReady { .. } => {}
            }
            cur = next;
            visits -= 1;
        }

        if consumed > 0 {
            self.budget.bytes_processed(consumed);
        }
        consumed
    }

    /// Applies buffered add/remove actions, in enqueue order, before the walk
    /// so concurrent registrations never corrupt an in-progress tick.
    fn apply_pending(&mut self) {
        let drained = {
            let mut pending = self.lock_pending();
            if pending.actions.is_empty() {
                return;
            }
            std::mem::take(&mut pending.actions)
        };
        for action in drained {
            match action {
                PendingAction::Add(conn) => {
                    trace!(conn = %conn.describe(), "adding connection");
                    self.active.add(&mut self.arena, conn);
                }
                PendingAction::Remove(conn) => {
                    let removed = self
                        .active
                        .remove_by(&mut self.arena, |c| *c == conn)
                        .or_else(|| {
                            self.idle.remove_by(&mut self.arena, |c| *c == conn)
                        });
                    if removed.is_some() {
                        trace!(conn = %conn.describe(), "removed connection");
                    }
                }
            }
        }
    }

    /// Walks the idle list once, promoting every connection that has become
    /// ready again to the front of the active list so it is serviced promptly
    /// rather than waiting out a full round.
    fn sweep_idle(&mut self) {
        let mut cur = self.idle.head();
        while let Some(key) = cur {
            let next = self.idle.next(&self.arena, key);
            if matches!(
                self.arena[key.0].conn.ready_for_read(),
                ReadReadiness::Ready
            ) {
                trace!(
                    conn = %self.arena[key.0].conn.describe(),
                    "promoting idle connection"
                );
                self.idle.unlink(&mut self.arena, key);
                self.active.add_to_start(&mut self.arena, key);
            }
            cur = next;
        }
    }
}
