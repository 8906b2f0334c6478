//! The per-document socket poller.
//!
//! Each [`SocketPoll`] runs a dedicated thread that multiplexes a dynamic
//! set of non-blocking sockets. poll(2)-class readiness notification has
//! very good performance up to a few hundred descriptors, and a poller
//! serves a single document, so we never expect enough sockets on one loop
//! to need anything heavier.
//!
//! Producer threads never touch the active set. Inserts, releases and
//! callbacks go through one mutex-guarded pending area and a wake-up
//! [`Waker`]; the poll thread splices them in between ticks.

use crate::config::get_namespaced_usize;
use crate::error::Error;
use crate::net::socket::{lock_ignoring_poison, HandleResult, Readiness, Socket};

use ::config::Config;
use mio::unix::SourceFd;
use mio::{Events, Poll, Token, Waker};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

// Tokens count up from zero, so the waker sits at the far end of the range.
const WAKE_TOKEN: Token = Token(usize::MAX);

const DEFAULT_POLL_CAPACITY: usize = 256;

/// Tick ceiling. Long enough to idle cheaply, short enough that a missed
/// wake-up never delays `stop` noticeably.
const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(5000);

type Callback = Box<dyn FnOnce() + Send + 'static>;
type WakeupHook = Box<dyn FnMut() + Send + 'static>;

// Live pollers, for wakeup_world.
static POLLERS: Mutex<Vec<Weak<Shared>>> = Mutex::new(Vec::new());

/// Wakes every live poller in the process.
pub fn wakeup_world() {
    let mut pollers = lock_ignoring_poison(&POLLERS);
    pollers.retain(|poller| match poller.upgrade() {
        Some(shared) => {
            shared.wakeup();
            true
        }
        None => false,
    });
}

// ============================================================================
// Shared state
// ============================================================================

#[derive(Default)]
struct Pending {
    inserts: Vec<Arc<dyn Socket>>,
    releases: Vec<Arc<dyn Socket>>,
    callbacks: Vec<Callback>,
}

struct Shared {
    name: String,
    waker: Waker,
    stop: AtomicBool,
    pending: Mutex<Pending>,
}

impl Shared {
    /// Wakes the poll thread. Idempotent: multiple producers may wake and
    /// the poll thread coalesces.
    fn wakeup(&self) {
        if let Err(err) = self.waker.wake() {
            warn!(?err, name = %self.name, "Failed to wake poller");
        }
    }
}

// ============================================================================
// SocketPoll
// ============================================================================

/// Owns a polling thread and the sockets it multiplexes.
///
/// Construction spawns the thread; [`stop`](Self::stop) (or drop) shuts it
/// down cooperatively. Producer-side operations are also available on the
/// clonable [`PollInterface`] from [`get_interface`](Self::get_interface).
pub struct SocketPoll {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl SocketPoll {
    /// Creates a socket poll with default settings. Called rather
    /// infrequently.
    pub fn new(name: &str) -> Result<SocketPoll, Error> {
        Self::build(name, DEFAULT_POLL_CAPACITY, DEFAULT_POLL_TIMEOUT, None)
    }

    /// Creates a socket poll configured through the `config` crate.
    ///
    /// Keys (looked up as `{name}.{key}` falling back to `{key}`):
    /// `poll_capacity` and `poll_timeout_ms`.
    pub fn with_config(config: &Config, name: &str) -> Result<SocketPoll, Error> {
        let capacity =
            get_namespaced_usize(config, name, "poll_capacity").unwrap_or(DEFAULT_POLL_CAPACITY);
        let timeout = get_namespaced_usize(config, name, "poll_timeout_ms")
            .map(|ms| Duration::from_millis(ms as u64))
            .unwrap_or(DEFAULT_POLL_TIMEOUT);

        Self::build(name, capacity, timeout, None)
    }

    /// Creates a socket poll whose hook runs on the poll thread after each
    /// wake-up, once pending callbacks have run.
    pub fn with_wakeup_hook(name: &str, hook: WakeupHook) -> Result<SocketPoll, Error> {
        Self::build(name, DEFAULT_POLL_CAPACITY, DEFAULT_POLL_TIMEOUT, Some(hook))
    }

    fn build(
        name: &str,
        capacity: usize,
        tick_timeout: Duration,
        wakeup_hook: Option<WakeupHook>,
    ) -> Result<SocketPoll, Error> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;

        let shared = Arc::new(Shared {
            name: name.to_string(),
            waker,
            stop: AtomicBool::new(false),
            pending: Mutex::new(Pending::default()),
        });
        lock_ignoring_poison(&POLLERS).push(Arc::downgrade(&shared));

        let thread = thread::Builder::new().name(name.to_string()).spawn({
            let shared = Arc::clone(&shared);
            move || {
                let mut poll_loop = PollLoop {
                    poll,
                    events: Events::with_capacity(capacity),
                    sockets: Vec::new(),
                    next_token: 0,
                    tick_timeout,
                    wakeup_hook,
                    shared,
                };
                poll_loop.run();
            }
        })?;

        Ok(SocketPoll {
            shared,
            thread: Some(thread),
        })
    }

    /// Debug name used for logging and as the config namespace.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Gets a thread-safe producer interface to this poller.
    pub fn get_interface(&self) -> PollInterface {
        PollInterface {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Queues a socket for insertion into the active set.
    pub fn insert_socket(&self, socket: Arc<dyn Socket>) {
        self.get_interface().insert_socket(socket);
    }

    /// Queues a socket for removal from the active set.
    pub fn release_socket(&self, socket: Arc<dyn Socket>) {
        self.get_interface().release_socket(socket);
    }

    /// Queues a closure to run on the poll thread at the next wake-up.
    pub fn add_callback(&self, callback: impl FnOnce() + Send + 'static) {
        self.get_interface().add_callback(callback);
    }

    /// Wakes the poll thread.
    pub fn wakeup(&self) {
        self.shared.wakeup();
    }

    /// Stops the polling thread. The stop flag is monotonic; a stopped
    /// poller never resumes.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.wakeup();
    }
}

impl Drop for SocketPoll {
    fn drop(&mut self) {
        self.stop();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!(name = %self.shared.name, "Polling thread panicked");
            }
        }

        // Pollers come and go with documents; drop our registry entry here
        // rather than leaving it for the next wakeup_world sweep.
        lock_ignoring_poison(&POLLERS)
            .retain(|poller| !std::ptr::eq(poller.as_ptr(), Arc::as_ptr(&self.shared)));
    }
}

/// Thread-safe interface for feeding a [`SocketPoll`] from other threads.
///
/// All operations queue under the poller's pending mutex and wake the poll
/// thread; none of them block on I/O.
#[derive(Clone)]
pub struct PollInterface {
    shared: Arc<Shared>,
}

impl PollInterface {
    /// Queues a socket for insertion. Observed no later than the next
    /// wake-up.
    pub fn insert_socket(&self, socket: Arc<dyn Socket>) {
        trace!(fd = socket.as_raw_fd(), name = %self.shared.name, "Queuing socket insert");
        lock_ignoring_poison(&self.shared.pending).inserts.push(socket);
        self.shared.wakeup();
    }

    /// Queues a socket for removal.
    ///
    /// Removal is two-phase so a socket whose index is live in the current
    /// dispatch pass is never dropped mid-tick.
    pub fn release_socket(&self, socket: Arc<dyn Socket>) {
        trace!(fd = socket.as_raw_fd(), name = %self.shared.name, "Queuing socket release");
        lock_ignoring_poison(&self.shared.pending).releases.push(socket);
        self.shared.wakeup();
    }

    /// Queues a closure to run on the poll thread at the next wake-up, after
    /// socket dispatch.
    pub fn add_callback(&self, callback: impl FnOnce() + Send + 'static) {
        lock_ignoring_poison(&self.shared.pending)
            .callbacks
            .push(Box::new(callback));
        self.shared.wakeup();
    }

    /// Wakes the poll thread.
    pub fn wakeup(&self) {
        self.shared.wakeup();
    }
}

// ============================================================================
// The poll loop
// ============================================================================

struct Entry {
    socket: Arc<dyn Socket>,
    token: Token,
    interest: mio::Interest,
}

struct PollLoop {
    poll: Poll,
    events: Events,
    /// The active set. Ordered, so indices stay meaningful within a tick.
    sockets: Vec<Entry>,
    next_token: usize,
    tick_timeout: Duration,
    wakeup_hook: Option<WakeupHook>,
    shared: Arc<Shared>,
}

impl PollLoop {
    fn run(&mut self) {
        info!(name = %self.shared.name, "Starting polling thread");

        while !self.shared.stop.load(Ordering::Acquire) {
            if let Err(err) = self.tick() {
                error!(?err, name = %self.shared.name, "Fatal poll error");
                break;
            }
        }

        info!(
            name = %self.shared.name,
            sockets = self.sockets.len(),
            "Stopping polling thread"
        );
    }

    fn tick(&mut self) -> Result<(), Error> {
        let now = Instant::now();

        // Prepare: retire released sockets, then refresh each remaining
        // socket's registration and let it contract the timeout.
        self.process_releases();

        let mut timeout = self.tick_timeout;
        let registry = self.poll.registry();
        for entry in &mut self.sockets {
            let interest = entry.socket.poll_interest();
            if interest != entry.interest {
                let fd = entry.socket.as_raw_fd();
                if let Err(err) = registry.reregister(&mut SourceFd(&fd), entry.token, interest) {
                    warn!(?err, fd, "Failed to update socket registration");
                } else {
                    entry.interest = interest;
                }
            }
            entry.socket.update_timeout(now, &mut timeout);
        }

        // Wait.
        loop {
            match self.poll.poll(&mut self.events, Some(timeout)) {
                Ok(()) => break,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }

        let mut ready: HashMap<Token, Readiness> = HashMap::new();
        let mut woken = false;
        for event in self.events.iter() {
            if event.token() == WAKE_TOKEN {
                woken = true;
            } else {
                ready
                    .entry(event.token())
                    .or_default()
                    .merge(Readiness::from_event(event));
            }
        }

        // Dispatch, in reverse index order so removals don't invalidate the
        // remaining indices. Releases queued since the prepare step are
        // honoured here instead of firing the handler one last time.
        let released = self.drain_matching_releases();
        let now = Instant::now();
        for i in (0..self.sockets.len()).rev() {
            let fd = self.sockets[i].socket.as_raw_fd();
            if released.iter().any(|rel| rel.as_raw_fd() == fd) {
                debug!(fd, name = %self.shared.name, "Releasing socket");
                self.remove_socket(i);
                continue;
            }

            let Some(readiness) = ready.get(&self.sockets[i].token).copied() else {
                continue;
            };

            let socket = Arc::clone(&self.sockets[i].socket);
            let result = panic::catch_unwind(AssertUnwindSafe(|| socket.handle_poll(now, readiness)))
                .unwrap_or_else(|_| {
                    error!(fd, name = %self.shared.name, "Error while handling poll");
                    HandleResult::SocketClosed
                });

            if result == HandleResult::SocketClosed {
                debug!(fd, name = %self.shared.name, "Removing closed socket");
                self.remove_socket(i);
            }
        }

        // Wake-up: splice in new sockets, then run queued callbacks outside
        // the lock, then the hook.
        if woken {
            let (inserts, callbacks) = {
                let mut pending = lock_ignoring_poison(&self.shared.pending);
                (
                    std::mem::take(&mut pending.inserts),
                    std::mem::take(&mut pending.callbacks),
                )
            };

            for socket in inserts {
                self.insert_socket(socket);
            }
            for callback in callbacks {
                callback();
            }
            if let Some(hook) = &mut self.wakeup_hook {
                hook();
            }
        }

        Ok(())
    }

    /// Removes released sockets from the active set (prepare step).
    fn process_releases(&mut self) {
        for released in self.drain_matching_releases() {
            let fd = released.as_raw_fd();
            if let Some(i) = self
                .sockets
                .iter()
                .position(|entry| entry.socket.as_raw_fd() == fd)
            {
                debug!(fd, name = %self.shared.name, "Releasing socket");
                self.remove_socket(i);
            }
        }
    }

    /// Takes the pending releases that match an active socket; the rest stay
    /// queued until their socket has been spliced in.
    fn drain_matching_releases(&mut self) -> Vec<Arc<dyn Socket>> {
        let mut pending = lock_ignoring_poison(&self.shared.pending);
        let mut matched = Vec::new();
        let sockets = &self.sockets;
        pending.releases.retain(|released| {
            let fd = released.as_raw_fd();
            if sockets.iter().any(|entry| entry.socket.as_raw_fd() == fd) {
                matched.push(Arc::clone(released));
                false
            } else {
                true
            }
        });
        matched
    }

    fn insert_socket(&mut self, socket: Arc<dyn Socket>) {
        socket.set_thread_owner(thread::current().id());

        let token = Token(self.next_token);
        self.next_token += 1;

        let interest = socket.poll_interest();
        let fd = socket.as_raw_fd();
        match self
            .poll
            .registry()
            .register(&mut SourceFd(&fd), token, interest)
        {
            Ok(()) => {
                debug!(fd, name = %self.shared.name, "Inserting socket");
                self.sockets.push(Entry {
                    socket,
                    token,
                    interest,
                });
            }
            Err(err) => {
                // Dropping the socket here tears it down through its own
                // disconnect path.
                error!(?err, fd, name = %self.shared.name, "Failed to register socket");
            }
        }
    }

    fn remove_socket(&mut self, index: usize) {
        let entry = self.sockets.remove(index);
        let fd = entry.socket.as_raw_fd();
        if let Err(err) = self.poll.registry().deregister(&mut SourceFd(&fd)) {
            warn!(?err, fd, "Failed to deregister socket");
        }
    }
}
