//! The poll-event contract every multiplexed socket implements.

use mio::event::Event;
use mio::Interest;
use std::os::fd::AsRawFd;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

/// Outcome of a [`Socket::handle_poll`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleResult {
    /// Keep polling this socket.
    Continue,
    /// The socket is done; the poller removes it within the same tick.
    SocketClosed,
}

/// The readiness bits a poll tick observed for one socket.
///
/// Decoupled from the OS event type so tests can hand-craft readiness.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    /// Peer hang-up on either direction.
    pub closed: bool,
    /// Descriptor-level error.
    pub error: bool,
}

impl Readiness {
    pub(crate) fn from_event(event: &Event) -> Readiness {
        Readiness {
            readable: event.is_readable(),
            writable: event.is_writable(),
            closed: event.is_read_closed() || event.is_write_closed(),
            error: event.is_error(),
        }
    }

    pub(crate) fn merge(&mut self, other: Readiness) {
        self.readable |= other.readable;
        self.writable |= other.writable;
        self.closed |= other.closed;
        self.error |= other.error;
    }
}

/// A non-blocking socket multiplexed by a [`SocketPoll`](super::SocketPoll).
///
/// Implementers own exactly one OS descriptor for their lifetime. The
/// descriptor is non-blocking from creation, and stream sockets have
/// TCP_NODELAY set. All methods except [`shutdown`](Self::shutdown) are
/// invoked on the owning poller's thread only.
pub trait Socket: AsRawFd + Send + Sync {
    /// The poll mask this socket currently wants. Re-evaluated every tick.
    fn poll_interest(&self) -> Interest;

    /// Handles the events a poll tick reported for this socket.
    fn handle_poll(&self, now: Instant, readiness: Readiness) -> HandleResult;

    /// Lets the socket contract the next tick's timeout. May only shrink it.
    fn update_timeout(&self, _now: Instant, _timeout: &mut Duration) {}

    /// Shuts down both directions of the underlying descriptor. Idempotent.
    fn shutdown(&self);

    /// Binds the socket to its poller's thread, for the debug-mode ownership
    /// checks.
    fn set_thread_owner(&self, _owner: ThreadId) {}
}

/// Debug-mode record of the thread a socket belongs to.
///
/// Release builds keep the field to avoid layout divergence but skip the
/// assertion.
#[derive(Debug, Default)]
pub(crate) struct ThreadOwner(Mutex<Option<ThreadId>>);

impl ThreadOwner {
    pub(crate) fn set(&self, owner: ThreadId) {
        *lock_ignoring_poison(&self.0) = Some(owner);
    }

    pub(crate) fn assert_current(&self) {
        #[cfg(debug_assertions)]
        if let Some(owner) = *lock_ignoring_poison(&self.0) {
            assert_eq!(
                owner,
                std::thread::current().id(),
                "socket touched off its poller thread"
            );
        }
    }
}

// A panicking handler is caught at the poll boundary and must not wedge the
// socket's mutexes for the disconnect path.
pub(crate) fn lock_ignoring_poison<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
