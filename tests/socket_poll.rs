use mio::Interest;
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};
use tilecomm::prelude::*;
use tracing_subscriber::EnvFilter;

// ============================================================================
// Helpers
// ============================================================================

/// Initialize tracing for the test binary; verbosity comes from RUST_LOG.
/// Later calls lose the race and are ignored.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init();
}

fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "Timed out waiting for {what}");
        thread::sleep(Duration::from_millis(10));
    }
}

/// A connected (client, poller-side) pair; the poller side is ready for
/// `StreamSocket::create`.
fn tcp_pair() -> (TcpStream, mio::net::TcpStream) {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind");
    let addr = listener.local_addr().expect("Failed to get local address");
    let client = TcpStream::connect(addr).expect("Failed to connect");
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("Failed to set read timeout");
    let (server, _) = listener.accept().expect("Failed to accept");
    server
        .set_nonblocking(true)
        .expect("Failed to set non-blocking");
    (client, mio::net::TcpStream::from_std(server))
}

#[derive(Default)]
struct HandlerEvents {
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    messages: AtomicUsize,
    bytes_seen: AtomicUsize,
}

/// Test handler: records lifecycle events and optionally echoes consumed
/// input back to the peer.
struct RecordingHandler {
    events: Arc<HandlerEvents>,
    socket: Weak<StreamSocket>,
    consume: bool,
    echo: bool,
    panic_on_message: bool,
}

impl RecordingHandler {
    fn new(events: Arc<HandlerEvents>, consume: bool, echo: bool) -> Box<RecordingHandler> {
        Box::new(RecordingHandler {
            events,
            socket: Weak::new(),
            consume,
            echo,
            panic_on_message: false,
        })
    }
}

impl SocketHandler for RecordingHandler {
    fn on_connect(&mut self, socket: Weak<StreamSocket>) {
        self.socket = socket;
        self.events.connects.fetch_add(1, Ordering::SeqCst);
    }

    fn handle_incoming_message(&mut self, input: &mut Vec<u8>) {
        if self.panic_on_message {
            panic!("handler failure under test");
        }

        self.events.messages.fetch_add(1, Ordering::SeqCst);
        self.events
            .bytes_seen
            .fetch_max(input.len(), Ordering::SeqCst);

        if self.consume {
            if self.echo {
                if let Some(socket) = self.socket.upgrade() {
                    socket.send(input.as_slice(), true);
                }
            }
            input.clear();
        }
    }

    fn on_disconnect(&mut self) {
        self.events.disconnects.fetch_add(1, Ordering::SeqCst);
    }
}

// ============================================================================
// StreamSocket + SocketPoll
// ============================================================================

#[test]
fn burst_lands_in_input_buffer() {
    // A 20 KiB burst ends up in the input buffer in full, and the handler
    // runs at least once per tick while the buffer keeps its size.
    let poll = SocketPoll::new("burst").expect("Failed to create poll");
    let (mut client, server) = tcp_pair();

    let events = Arc::new(HandlerEvents::default());
    let socket = StreamSocket::create(server, RecordingHandler::new(events.clone(), false, false));
    poll.insert_socket(socket);

    let burst = vec![42u8; 20 * 1024];
    client.write_all(&burst).expect("Failed to write burst");

    wait_until("the full burst to arrive", || {
        events.bytes_seen.load(Ordering::SeqCst) == burst.len()
    });
    assert!(events.messages.load(Ordering::SeqCst) >= 1);
    assert_eq!(events.connects.load(Ordering::SeqCst), 1);
}

#[test]
fn echo_round_trip() {
    let poll = SocketPoll::new("echo").expect("Failed to create poll");
    let (mut client, server) = tcp_pair();

    let events = Arc::new(HandlerEvents::default());
    let socket = StreamSocket::create(server, RecordingHandler::new(events.clone(), true, true));
    poll.insert_socket(socket);

    client.write_all(b"hello").expect("Failed to write");

    let mut reply = [0u8; 5];
    client.read_exact(&mut reply).expect("Failed to read echo");
    assert_eq!(&reply, b"hello");
}

#[test]
fn peer_close_fires_disconnect_once_and_keeps_other_sockets() {
    let poll = SocketPoll::new("disconnect").expect("Failed to create poll");

    let (client_a, server_a) = tcp_pair();
    let (mut client_b, server_b) = tcp_pair();

    let events_a = Arc::new(HandlerEvents::default());
    let events_b = Arc::new(HandlerEvents::default());
    poll.insert_socket(StreamSocket::create(
        server_a,
        RecordingHandler::new(events_a.clone(), true, true),
    ));
    poll.insert_socket(StreamSocket::create(
        server_b,
        RecordingHandler::new(events_b.clone(), true, true),
    ));

    // Closing A must tear down A exactly once and leave B alone.
    drop(client_a);
    wait_until("socket A to disconnect", || {
        events_a.disconnects.load(Ordering::SeqCst) == 1
    });

    client_b.write_all(b"ping").expect("Failed to write");
    let mut reply = [0u8; 4];
    client_b.read_exact(&mut reply).expect("Failed to read echo");
    assert_eq!(&reply, b"ping");

    thread::sleep(Duration::from_millis(50));
    assert_eq!(events_a.disconnects.load(Ordering::SeqCst), 1);
    assert_eq!(events_b.disconnects.load(Ordering::SeqCst), 0);
}

#[test]
fn handler_panic_closes_only_that_socket() {
    let poll = SocketPoll::new("panic").expect("Failed to create poll");

    let (mut client_a, server_a) = tcp_pair();
    let (mut client_b, server_b) = tcp_pair();

    let events_a = Arc::new(HandlerEvents::default());
    let mut handler = RecordingHandler::new(events_a.clone(), false, false);
    handler.panic_on_message = true;
    poll.insert_socket(StreamSocket::create(server_a, handler));

    let events_b = Arc::new(HandlerEvents::default());
    poll.insert_socket(StreamSocket::create(
        server_b,
        RecordingHandler::new(events_b.clone(), true, true),
    ));

    client_a.write_all(b"boom").expect("Failed to write");
    wait_until("the panicking socket to be dropped", || {
        events_a.disconnects.load(Ordering::SeqCst) == 1
    });

    // The poller survives and still serves the healthy socket.
    client_b.write_all(b"still here").expect("Failed to write");
    let mut reply = [0u8; 10];
    client_b.read_exact(&mut reply).expect("Failed to read echo");
    assert_eq!(&reply, b"still here");
}

#[test]
fn released_socket_leaves_the_active_set() {
    let poll = SocketPoll::new("release").expect("Failed to create poll");
    let (mut client, server) = tcp_pair();

    let events = Arc::new(HandlerEvents::default());
    let socket = StreamSocket::create(server, RecordingHandler::new(events.clone(), true, false));
    poll.insert_socket(socket.clone());

    client.write_all(b"x").expect("Failed to write");
    wait_until("the first message", || {
        events.messages.load(Ordering::SeqCst) == 1
    });

    poll.release_socket(socket.clone());
    drop(socket);

    // Once the poller lets go of its reference the descriptor closes and the
    // peer observes EOF.
    let mut buf = [0u8; 1];
    wait_until("peer EOF after release", || {
        match client.read(&mut buf) {
            Ok(0) => true,
            Ok(_) => false,
            Err(err) if err.kind() == ErrorKind::WouldBlock => false,
            Err(_) => true,
        }
    });
    assert_eq!(events.disconnects.load(Ordering::SeqCst), 1);
}

#[test]
fn send_is_thread_safe_and_flushes() {
    let poll = SocketPoll::new("send").expect("Failed to create poll");
    let (mut client, server) = tcp_pair();

    let events = Arc::new(HandlerEvents::default());
    let socket = StreamSocket::create(server, RecordingHandler::new(events, false, false));
    poll.insert_socket(socket.clone());

    socket.send(b"direct", true);

    let mut reply = [0u8; 6];
    client.read_exact(&mut reply).expect("Failed to read");
    assert_eq!(&reply, b"direct");
}

#[test]
fn unflushed_output_drains_on_writable_edge() {
    let poll = SocketPoll::new("buffered-send").expect("Failed to create poll");
    let (mut client, server) = tcp_pair();

    let events = Arc::new(HandlerEvents::default());
    let socket = StreamSocket::create(server, RecordingHandler::new(events, false, false));
    poll.insert_socket(socket.clone());

    // Buffer without flushing, then nudge the poller to pick up the write
    // interest.
    socket.send(b"later", false);
    poll.wakeup();

    let mut reply = [0u8; 5];
    client.read_exact(&mut reply).expect("Failed to read");
    assert_eq!(&reply, b"later");
}

#[test]
fn callback_runs_once_on_the_poll_thread() {
    init_tracing();
    let poll = SocketPoll::new("callback").expect("Failed to create poll");
    let (tx, rx) = mpsc::channel();

    poll.add_callback(move || {
        tx.send(thread::current().id()).expect("Failed to send");
    });

    let callback_thread = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("Callback did not run");
    assert_ne!(callback_thread, thread::current().id());
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
}

#[test]
fn wakeup_hook_runs_after_wakeup() {
    init_tracing();
    let hook_runs = Arc::new(AtomicUsize::new(0));
    let poll = {
        let hook_runs = hook_runs.clone();
        SocketPoll::with_wakeup_hook(
            "hook",
            Box::new(move || {
                hook_runs.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .expect("Failed to create poll")
    };

    poll.wakeup();
    wait_until("the wakeup hook", || hook_runs.load(Ordering::SeqCst) >= 1);
}

#[test]
fn wakeup_world_reaches_every_poller() {
    init_tracing();
    let hook_runs = Arc::new(AtomicUsize::new(0));
    let _poll = {
        let hook_runs = hook_runs.clone();
        SocketPoll::with_wakeup_hook(
            "world",
            Box::new(move || {
                hook_runs.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .expect("Failed to create poll")
    };

    tilecomm::wakeup_world();
    wait_until("the global wakeup", || hook_runs.load(Ordering::SeqCst) >= 1);
}

#[test]
fn send_blocking_flushes_before_returning() {
    let (mut client, server) = tcp_pair();
    let events = Arc::new(HandlerEvents::default());
    let socket = StreamSocket::create(server, RecordingHandler::new(events, false, false));

    // The blocking path is for one-shot synchronous responses; the data must
    // be on the wire once the call returns.
    socket.send_blocking(b"response");

    let mut reply = [0u8; 8];
    client.read_exact(&mut reply).expect("Failed to read");
    assert_eq!(&reply, b"response");
}

#[test]
fn socket_options_are_reachable() {
    let (_client, server) = tcp_pair();
    let events = Arc::new(HandlerEvents::default());
    let socket = StreamSocket::create(server, RecordingHandler::new(events, false, false));

    assert!(socket.set_send_buffer_size(64 * 1024));
    assert!(socket.send_buffer_size().expect("readable buffer size") > 0);
    assert!(socket.set_receive_buffer_size(64 * 1024));
    assert!(socket.receive_buffer_size().expect("readable buffer size") > 0);
    assert!(socket.take_error().is_none());
    assert!(!socket.is_closed());
}

#[test]
fn poll_reads_its_config() {
    let config = config::Config::builder()
        .set_default("poll_capacity", 64i64)
        .expect("Failed to set default")
        .set_default("fast.poll_timeout_ms", 50i64)
        .expect("Failed to set default")
        .build()
        .expect("Failed to build config");

    let poll = SocketPoll::with_config(&config, "fast").expect("Failed to create poll");
    let (mut client, server) = tcp_pair();
    let events = Arc::new(HandlerEvents::default());
    poll.insert_socket(StreamSocket::create(
        server,
        RecordingHandler::new(events, true, true),
    ));

    client.write_all(b"cfg").expect("Failed to write");
    let mut reply = [0u8; 3];
    client.read_exact(&mut reply).expect("Failed to read echo");
    assert_eq!(&reply, b"cfg");
}

// ============================================================================
// Custom Socket implementations
// ============================================================================

/// A minimal socket that asks to be closed on its first poll event.
struct OneShotSocket {
    stream: UnixStream,
    polls: Arc<AtomicUsize>,
}

impl AsRawFd for OneShotSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

impl Socket for OneShotSocket {
    fn poll_interest(&self) -> Interest {
        Interest::READABLE
    }

    fn handle_poll(&self, _now: Instant, _readiness: Readiness) -> HandleResult {
        self.polls.fetch_add(1, Ordering::SeqCst);
        HandleResult::SocketClosed
    }

    fn shutdown(&self) {}
}

#[test]
fn closed_socket_is_removed_within_the_tick() {
    init_tracing();
    let poll = SocketPoll::new("one-shot").expect("Failed to create poll");

    let (ours, mut theirs) = UnixStream::pair().expect("Failed to create pair");
    ours.set_nonblocking(true)
        .expect("Failed to set non-blocking");

    let polls = Arc::new(AtomicUsize::new(0));
    poll.insert_socket(Arc::new(OneShotSocket {
        stream: ours,
        polls: polls.clone(),
    }));

    theirs.write_all(b"w").expect("Failed to write");
    wait_until("the first poll dispatch", || {
        polls.load(Ordering::SeqCst) == 1
    });

    // The socket is out of the active set: further traffic never reaches it.
    // The write may fail with a broken pipe once the poller drops its end.
    let _ = theirs.write_all(b"w");
    thread::sleep(Duration::from_millis(100));
    assert_eq!(polls.load(Ordering::SeqCst), 1);
}

// ============================================================================
// ServerSocket
// ============================================================================

#[test]
fn server_socket_accepts_and_wires_clients() {
    init_tracing();
    let accept_poll = SocketPoll::new("accept").expect("Failed to create poll");
    let client_poll = SocketPoll::new("clients").expect("Failed to create poll");

    let events = Arc::new(HandlerEvents::default());
    let factory = {
        let events = events.clone();
        move |stream: mio::net::TcpStream, _peer: std::net::SocketAddr| {
            StreamSocket::create(stream, RecordingHandler::new(events.clone(), true, true))
        }
    };

    let server = ServerSocket::bind("127.0.0.1:0", client_poll.get_interface(), Box::new(factory))
        .expect("Failed to bind");
    let addr = server.local_addr().expect("Failed to get local address");
    accept_poll.insert_socket(server);

    for text in ["first", "second"] {
        let mut client = TcpStream::connect(addr).expect("Failed to connect");
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .expect("Failed to set read timeout");
        client.write_all(text.as_bytes()).expect("Failed to write");

        let mut reply = vec![0u8; text.len()];
        client.read_exact(&mut reply).expect("Failed to read echo");
        assert_eq!(reply, text.as_bytes());
    }

    assert_eq!(events.connects.load(Ordering::SeqCst), 2);
}
