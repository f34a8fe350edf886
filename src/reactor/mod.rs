use std::{
    io,
    os::fd::RawFd,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex, MutexGuard,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use hashbrown::HashMap;
use mio::{unix::SourceFd, Poll, Registry, Token, Waker};
use tracing::{debug, warn};
use typed_builder::TypedBuilder;

mod error;
mod poller;

pub use error::RegisterError;
pub use mio::Interest;

/// Token reserved for the waker that interrupts the blocking wait whenever
/// registration state changes from another thread.
const WAKER_TOKEN: Token = Token(usize::MAX);

/// Upper bound on one blocking readiness wait, so registration and close
/// requests are never starved behind a quiet network.
pub const POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// How long [`Reactor::close`] waits for handles to deregister themselves
/// before force-closing whatever is left.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// One live connection as seen by the reactor: a non-blocking socket plus the
/// sinks the reactor reports faults and forced closes to.
pub trait ReactorHandle: Send + Sync {
    /// The underlying socket. Must already be in non-blocking mode.
    fn raw_fd(&self) -> RawFd;

    /// Connection-level failure sink for dispatch errors.
    fn notify_of_error(&self, err: io::Error);

    /// Transport-level hard close, used only when the handle's owner ignores
    /// a shutdown request past the timeout.
    fn force_close(&self);

    fn describe(&self) -> String;
}

/// Receives readiness events from the reactor thread.
///
/// An `Err` from a dispatch method is a fault of that one connection: the
/// reactor logs it and forwards it to the handle's failure sink, and the
/// loop carries on.
pub trait EventHandler: Send + 'static {
    fn on_readable(&self, handle: &Arc<dyn ReactorHandle>) -> io::Result<()>;

    fn on_writable(&self, handle: &Arc<dyn ReactorHandle>) -> io::Result<()>;

    /// A registration has become effective on the dispatch loop.
    fn on_registered(&self, _handle: &Arc<dyn ReactorHandle>) {}

    /// The reactor is closing; the handle's owner should deregister it.
    fn on_close_requested(&self, _handle: &Arc<dyn ReactorHandle>) {}
}

#[derive(TypedBuilder, Clone, Debug)]
pub struct ReactorConfig {
    #[builder(default = POLL_TIMEOUT)]
    pub poll_timeout: Duration,
    #[builder(default = SHUTDOWN_TIMEOUT)]
    pub shutdown_timeout: Duration,
    #[builder(default = 128)]
    pub events_capacity: usize,
    #[builder(default = String::from("dendrite-reactor"), setter(into))]
    pub thread_name: String,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

pub(super) struct Slot {
    pub(super) handle: Arc<dyn ReactorHandle>,
    /// Set on registration, cleared once the loop has announced the handle
    /// through [`EventHandler::on_registered`].
    pub(super) fresh: bool,
}

/// State shared between the reactor surface and its dispatch thread.
pub(super) struct Shared {
    pub(super) registry: Registry,
    waker: Waker,
    pub(super) table: Mutex<HashMap<RawFd, Slot>>,
    drained: Condvar,
    pub(super) closed: AtomicBool,
}

impl Shared {
    pub(super) fn lock_table(&self) -> MutexGuard<'_, HashMap<RawFd, Slot>> {
        // a poisoned table is still structurally sound
        self.table.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub(super) fn wake(&self) {
        if let Err(err) = self.waker.wake() {
            warn!(%err, "failed to wake reactor thread");
        }
    }

    fn deregister(&self, fd: RawFd) -> bool {
        let mut table = self.lock_table();
        if table.remove(&fd).is_none() {
            return false;
        }
        // a registration that is already invalid is a no-op, not an error
        let _ = self.registry.deregister(&mut SourceFd(&fd));
        if table.is_empty() {
            self.drained.notify_all();
        }
        drop(table);
        self.wake();
        true
    }
}

/// A single-threaded readiness multiplexer.
///
/// The reactor owns one dedicated thread blocking on the OS readiness
/// primitive with a bounded timeout and dispatching readable/writable events
/// to the [`EventHandler`]. Registration is callable from any thread: every
/// mutation takes the registration mutex and wakes the blocked wait, so it
/// takes effect on the next loop iteration rather than after an unbounded
/// idle wait.
pub struct Reactor {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
    shutdown_timeout: Duration,
}

impl Reactor {
    /// Starts the dispatch thread and returns the registration surface.
    pub fn spawn<H: EventHandler>(handler: H, config: ReactorConfig) -> io::Result<Self> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        let shared = Arc::new(Shared {
            registry,
            waker,
            table: Mutex::new(HashMap::new()),
            drained: Condvar::new(),
            closed: AtomicBool::new(false),
        });
        let loop_shared = shared.clone();
        let poll_timeout = config.poll_timeout;
        let events_capacity = config.events_capacity;
        let thread = thread::Builder::new()
            .name(config.thread_name.clone())
            .spawn(move || {
                poller::run(poll, loop_shared, handler, poll_timeout, events_capacity)
            })?;
        Ok(Self {
            shared,
            thread: Mutex::new(Some(thread)),
            shutdown_timeout: config.shutdown_timeout,
        })
    }

    /// Registers a handle with the given interest. Fails if the socket is in
    /// blocking mode or already registered.
    pub fn register(
        &self,
        handle: Arc<dyn ReactorHandle>,
        interest: Interest,
    ) -> Result<(), RegisterError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(RegisterError::Closed);
        }
        let fd = handle.raw_fd();
        if !is_nonblocking(fd)? {
            return Err(RegisterError::Blocking);
        }
        let mut table = self.shared.lock_table();
        if table.contains_key(&fd) {
            return Err(RegisterError::AlreadyRegistered);
        }
        self.shared
            .registry
            .register(&mut SourceFd(&fd), Token(fd as usize), interest)?;
        debug!(conn = %handle.describe(), fd, "registered with reactor");
        table.insert(fd, Slot { handle, fresh: true });
        drop(table);
        self.shared.wake();
        Ok(())
    }

    /// Removes a handle. Safe to call while the handle is mid-dispatch;
    /// returns false if it was not registered.
    pub fn deregister(&self, handle: &dyn ReactorHandle) -> bool {
        self.shared.deregister(handle.raw_fd())
    }

    /// Atomically replaces which readiness events are of interest.
    pub fn update_interest(
        &self,
        handle: &dyn ReactorHandle,
        interest: Interest,
    ) -> Result<(), RegisterError> {
        let fd = handle.raw_fd();
        let table = self.shared.lock_table();
        if !table.contains_key(&fd) {
            return Err(RegisterError::NotRegistered);
        }
        self.shared
            .registry
            .reregister(&mut SourceFd(&fd), Token(fd as usize), interest)?;
        drop(table);
        self.shared.wake();
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    pub fn registered_count(&self) -> usize {
        self.shared.lock_table().len()
    }

    pub fn describe(&self) -> String {
        format!(
            "reactor[registered={}{}]",
            self.registered_count(),
            if self.is_closed() { " closed" } else { "" },
        )
    }

    /// Cooperative shutdown with a forced fallback.
    ///
    /// Marks the reactor closed, lets the dispatch loop request shutdown from
    /// every registered handle, then waits up to the configured timeout for
    /// the handles' owners to deregister. Whatever is still registered after
    /// the timeout is force-closed at the transport level. Never blocks the
    /// caller past the timeout; calling again is a no-op. Callable from any
    /// thread, concurrently with [`Reactor::deregister`].
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("closing reactor");
        self.shared.wake();

        let table = self.shared.lock_table();
        let (mut table, _) = self
            .shared
            .drained
            .wait_timeout_while(table, self.shutdown_timeout, |t| !t.is_empty())
            .unwrap_or_else(|p| p.into_inner());
        if !table.is_empty() {
            let leftovers: Vec<(RawFd, Arc<dyn ReactorHandle>)> = table
                .drain()
                .map(|(fd, slot)| (fd, slot.handle))
                .collect();
            self.shared.drained.notify_all();
            drop(table);
            warn!(
                count = leftovers.len(),
                "shutdown timed out; force-closing remaining connections"
            );
            for (fd, handle) in leftovers {
                let _ = self.shared.registry.deregister(&mut SourceFd(&fd));
                debug!(conn = %handle.describe(), "force closing");
                handle.force_close();
            }
        } else {
            drop(table);
        }

        // the loop exits once it observes closed + empty table
        self.shared.wake();
        let thread = self
            .thread
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(thread) = thread {
            let _ = thread.join();
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.close();
    }
}

fn is_nonblocking(fd: RawFd) -> Result<bool, RegisterError> {
    // Safety: F_GETFL only inspects the descriptor's flags.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(RegisterError::Io(io::Error::last_os_error()));
    }
    Ok(flags & libc::O_NONBLOCK != 0)
}
