//! Buffered, non-blocking data streaming over TCP.
//!
//! A [`StreamSocket`] owns the raw byte buffers in both directions and a
//! [`SocketHandler`] that turns those bytes into application messages. The
//! socket never interprets the stream itself; it only guarantees the handler
//! sees every byte once and that disconnects surface exactly once.

use crate::net::socket::{lock_ignoring_poison, HandleResult, Readiness, Socket, ThreadOwner};

use mio::net::TcpStream;
use mio::Interest;
use socket2::SockRef;
use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::ThreadId;
use std::time::Instant;
use tracing::{debug, error, trace, warn};

/// Read granularity. TLS decodes records of up to 16 KiB, so a TLS variant
/// of this socket can map one record per read.
const RECV_CHUNK_SIZE: usize = 16 * 1024;

/// Parses incoming bytes and produces outgoing bytes for one
/// [`StreamSocket`].
///
/// The socket owns its handler; the handler keeps only the [`Weak`]
/// back-reference it receives in [`on_connect`](Self::on_connect).
pub trait SocketHandler: Send {
    /// Called exactly once, immediately after the socket is created.
    fn on_connect(&mut self, _socket: Weak<StreamSocket>) {}

    /// Called after successful reads while the input buffer keeps shrinking.
    ///
    /// Consume a prefix of `input` when a complete message is available and
    /// leave partial messages in place; the socket detects progress by the
    /// buffer's length change.
    fn handle_incoming_message(&mut self, input: &mut Vec<u8>);

    /// Whether the handler holds output of its own (e.g. pending frames)
    /// that wants a writable poll edge.
    fn has_queued_writes(&self) -> bool {
        false
    }

    /// Called on a writable edge when the socket's own output buffer is
    /// empty, so the handler can synthesize fresh output.
    fn perform_writes(&mut self) {}

    /// Called exactly once when the socket is being torn down, never before
    /// `on_connect`.
    fn on_disconnect(&mut self) {}
}

/// A plain, non-blocking, data-streaming socket.
///
/// Shared as `Arc<StreamSocket>`: the poller holds one reference in its
/// active set and the handler's upper layers may hold weak ones.
/// [`send`](Self::send) is safe from any thread; everything else belongs to
/// the poller thread.
pub struct StreamSocket {
    stream: TcpStream,
    /// Poller-thread-only.
    handler: Mutex<Box<dyn SocketHandler>>,
    /// Poller-thread-only.
    in_buffer: Mutex<Vec<u8>>,
    /// The write mutex; any thread may append under it.
    out_buffer: Mutex<Vec<u8>>,
    closed: AtomicBool,
    disconnect_fired: AtomicBool,
    owner: ThreadOwner,
}

impl StreamSocket {
    /// Creates a stream socket owning `handler` and fires
    /// [`SocketHandler::on_connect`] with a weak back-reference.
    ///
    /// The two-step construction exists because the handler needs a
    /// reference to the socket that owns it.
    pub fn create(stream: TcpStream, handler: Box<dyn SocketHandler>) -> Arc<StreamSocket> {
        if let Err(err) = stream.set_nodelay(true) {
            warn!(?err, "Failed to set TCP_NODELAY");
        }

        let socket = Arc::new(StreamSocket {
            stream,
            handler: Mutex::new(handler),
            in_buffer: Mutex::new(Vec::new()),
            out_buffer: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            disconnect_fired: AtomicBool::new(false),
            owner: ThreadOwner::default(),
        });

        debug!(fd = socket.as_raw_fd(), "StreamSocket created");
        lock_ignoring_poison(&socket.handler).on_connect(Arc::downgrade(&socket));
        socket
    }

    /// Appends data to the output buffer under the write lock and, when
    /// `flush` is set, drains as much as the kernel will take without
    /// blocking.
    ///
    /// On return the data is either fully buffered or fully written.
    pub fn send(&self, data: &[u8], flush: bool) {
        if data.is_empty() {
            return;
        }

        let mut out = lock_ignoring_poison(&self.out_buffer);
        out.extend_from_slice(data);
        if flush {
            self.write_outgoing_data(&mut out);
        }
    }

    /// Sends synchronous response data.
    ///
    /// Switches the descriptor to blocking mode first so the drain completes
    /// before returning. Used for one-shot responses right before shutdown;
    /// the descriptor stays blocking afterwards.
    pub fn send_blocking(&self, data: &[u8]) {
        if let Err(err) = SockRef::from(&self.stream).set_nonblocking(false) {
            warn!(?err, fd = self.as_raw_fd(), "Failed to switch to blocking mode");
        }

        self.send(data, true);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.stream.peer_addr().ok()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.stream.local_addr().ok()
    }

    /// Sets the kernel send buffer size. Returns true on success only.
    pub fn set_send_buffer_size(&self, size: usize) -> bool {
        SockRef::from(&self.stream)
            .set_send_buffer_size(size)
            .is_ok()
    }

    /// The actual kernel send buffer size, if it could be read.
    pub fn send_buffer_size(&self) -> Option<usize> {
        SockRef::from(&self.stream).send_buffer_size().ok()
    }

    /// Sets the kernel receive buffer size. Returns true on success only.
    pub fn set_receive_buffer_size(&self, size: usize) -> bool {
        SockRef::from(&self.stream)
            .set_recv_buffer_size(size)
            .is_ok()
    }

    /// The actual kernel receive buffer size, if it could be read.
    pub fn receive_buffer_size(&self) -> Option<usize> {
        SockRef::from(&self.stream).recv_buffer_size().ok()
    }

    /// The pending socket-level error, if any.
    pub fn take_error(&self) -> Option<io::Error> {
        self.stream.take_error().ok().flatten()
    }

    /// Reads into the input buffer in 16 KiB chunks until the kernel would
    /// block. Returns false when the peer has closed.
    fn read_incoming_data(&self) -> bool {
        self.owner.assert_current();

        let mut input = lock_ignoring_poison(&self.in_buffer);
        let mut chunk = [0u8; RECV_CHUNK_SIZE];
        loop {
            match (&self.stream).read(&mut chunk) {
                Ok(0) => {
                    trace!(fd = self.as_raw_fd(), "Peer closed");
                    return false;
                }
                Ok(len) => {
                    trace!(fd = self.as_raw_fd(), len, "Read data from socket");
                    input.extend_from_slice(&chunk[..len]);
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) => {
                    if matches!(
                        err.kind(),
                        ErrorKind::ConnectionReset | ErrorKind::BrokenPipe
                    ) {
                        warn!(fd = self.as_raw_fd(), "Connection reset");
                    } else {
                        error!(fd = self.as_raw_fd(), ?err, "Error reading from socket");
                    }
                    return false;
                }
            }
        }

        true
    }

    /// Writes from the front of the output buffer, erasing what was proven
    /// written. Stops on `WouldBlock`; returns true if the stream broke.
    fn write_outgoing_data(&self, out: &mut Vec<u8>) -> bool {
        while !out.is_empty() {
            match (&self.stream).write(out.as_slice()) {
                Ok(0) => {
                    warn!(fd = self.as_raw_fd(), remaining = out.len(), "Wrote zero bytes");
                    break;
                }
                Ok(len) => {
                    trace!(fd = self.as_raw_fd(), len, "Wrote outgoing data");
                    out.drain(..len);
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err)
                    if matches!(
                        err.kind(),
                        ErrorKind::BrokenPipe | ErrorKind::ConnectionReset
                    ) =>
                {
                    warn!(fd = self.as_raw_fd(), "Broken pipe");
                    return true;
                }
                Err(err) => {
                    // The next poll tick surfaces the error.
                    error!(fd = self.as_raw_fd(), ?err, "Error writing to socket");
                    break;
                }
            }
        }

        false
    }

    /// Fires `on_disconnect` at most once over the socket's lifetime.
    fn fire_disconnect(&self) {
        if !self.disconnect_fired.swap(true, Ordering::AcqRel) {
            lock_ignoring_poison(&self.handler).on_disconnect();
        }
    }
}

impl AsRawFd for StreamSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

impl Socket for StreamSocket {
    fn poll_interest(&self) -> Interest {
        let have_output = !lock_ignoring_poison(&self.out_buffer).is_empty();
        let wants_write = have_output || lock_ignoring_poison(&self.handler).has_queued_writes();

        if wants_write {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        }
    }

    fn handle_poll(&self, _now: Instant, readiness: Readiness) -> HandleResult {
        self.owner.assert_current();

        let mut closed = readiness.closed || readiness.error;

        // Always try to read; a hang-up can still carry final bytes.
        closed = !self.read_incoming_data() || closed;

        trace!(
            fd = self.as_raw_fd(),
            buffered = lock_ignoring_poison(&self.in_buffer).len(),
            closed,
            "Incoming data"
        );

        // Let the handler consume complete messages. Terminating on the
        // fixed point keeps us out of an infinite loop when it cannot parse
        // further.
        {
            let mut handler = lock_ignoring_poison(&self.handler);
            let mut input = lock_ignoring_poison(&self.in_buffer);
            let mut old_size = 0;
            while !input.is_empty() && input.len() != old_size {
                old_size = input.len();
                handler.handle_incoming_message(&mut input);
            }
        }

        // A writable edge with nothing buffered lets the handler synthesize
        // fresh output.
        if readiness.writable && lock_ignoring_poison(&self.out_buffer).is_empty() {
            lock_ignoring_poison(&self.handler).perform_writes();
        }

        let have_output = !lock_ignoring_poison(&self.out_buffer).is_empty();
        if readiness.writable || have_output {
            // Non-blocking try: a sender on another thread may be flushing
            // already, in which case this tick has nothing to do.
            if let Ok(mut out) = self.out_buffer.try_lock() {
                if !out.is_empty() && self.write_outgoing_data(&mut out) {
                    closed = true;
                }
            }
        }

        if closed {
            debug!(fd = self.as_raw_fd(), "Closed");
            self.closed.store(true, Ordering::Release);
            self.fire_disconnect();
            return HandleResult::SocketClosed;
        }

        HandleResult::Continue
    }

    fn shutdown(&self) {
        // NotConnected from a repeated shutdown is fine.
        if let Err(err) = self.stream.shutdown(Shutdown::Both) {
            if err.kind() != ErrorKind::NotConnected {
                warn!(fd = self.as_raw_fd(), ?err, "Error shutting down socket");
            }
        }
    }

    fn set_thread_owner(&self, owner: ThreadId) {
        self.owner.set(owner);
    }
}

impl Drop for StreamSocket {
    fn drop(&mut self) {
        debug!(fd = self.as_raw_fd(), "StreamSocket dropped");
        self.fire_disconnect();
    }
}
