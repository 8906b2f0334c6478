//! Per-document socket polling and tile dispatch for a collaborative
//! document server, built on [mio](https://docs.rs/mio).
//!
//! - **Single-threaded reactor:** each [`SocketPoll`] runs one thread that
//!   owns its sockets outright - no locking on the hot path and a
//!   predictable dispatch order
//! - **Buffered stream sockets:** [`StreamSocket`] drains the kernel in both
//!   directions and hands parsed progress to a [`SocketHandler`] you
//!   implement
//! - **Cross-thread feeding:** producer threads feed a poller through a
//!   clonable [`PollInterface`] backed by a wake-up channel
//! - **Domain-aware queues:** [`TileQueue`] deduplicates tile render
//!   requests and serves the tile under a user's cursor first, while
//!   `canceltiles` purges stale work
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Weak;
//! use tilecomm::prelude::*;
//!
//! /// Echoes every line back to the peer.
//! struct EchoHandler {
//!     socket: Weak<StreamSocket>,
//! }
//!
//! impl SocketHandler for EchoHandler {
//!     fn on_connect(&mut self, socket: Weak<StreamSocket>) {
//!         self.socket = socket;
//!     }
//!
//!     fn handle_incoming_message(&mut self, input: &mut Vec<u8>) {
//!         let Some(end) = input.iter().position(|&b| b == b'\n') else {
//!             return; // partial line, wait for more
//!         };
//!         let line: Vec<u8> = input.drain(..=end).collect();
//!         if let Some(socket) = self.socket.upgrade() {
//!             socket.send(&line, true);
//!         }
//!     }
//! }
//!
//! fn main() -> Result<(), tilecomm::Error> {
//!     let poll = SocketPoll::new("echo")?;
//!
//!     let server = ServerSocket::bind(
//!         "127.0.0.1:9981",
//!         poll.get_interface(),
//!         Box::new(|stream: mio::net::TcpStream, _peer: std::net::SocketAddr| {
//!             StreamSocket::create(stream, Box::new(EchoHandler { socket: Weak::new() }))
//!         }),
//!     )?;
//!     poll.insert_socket(server);
//!
//!     // The poll thread now owns the sockets; stop() tears it down.
//!     std::thread::park();
//!     Ok(())
//! }
//! ```
//!
//! # Tile queues
//!
//! ```
//! use tilecomm::prelude::*;
//!
//! let queue = TileQueue::new();
//! queue.update_cursor_position(1, CursorPosition::new(0, 0, 100, 100));
//!
//! // A re-request of the same region replaces the stale version in place.
//! queue.put(b"tile x=0 y=0 w=256 h=256 ver=1".to_vec());
//! queue.put(b"tile x=0 y=0 w=256 h=256 ver=2".to_vec());
//! assert_eq!(queue.len(), 1);
//!
//! // Tiles under the cursor jump the queue.
//! queue.put(b"tile x=5000 y=5000 w=256 h=256 ver=1".to_vec());
//! assert!(String::from_utf8(queue.get()).unwrap().starts_with("tile x=0"));
//! ```
//!
//! # Configuration
//!
//! Pollers can be configured through the
//! [`config`](https://docs.rs/config/) crate, with per-poller namespacing
//! (`{name}.{key}` takes precedence over `{key}`):
//!
//! | Key | Description |
//! |-----|-------------|
//! | `poll_capacity` | Event capacity per poll tick (default: 256) |
//! | `poll_timeout_ms` | Poll tick ceiling in milliseconds (default: 5000) |

pub mod net;
pub mod queue;

pub(crate) mod config;
pub(crate) mod error;

pub use error::Error;
pub use net::{
    wakeup_world, HandleResult, PollInterface, Readiness, ServerSocket, Socket, SocketFactory,
    SocketHandler, SocketPoll, StreamSocket,
};
pub use queue::{
    is_tile_message, tile_identity, BasicTileQueue, CursorPosition, MessageQueue, Payload,
    TileDescriptor, TileQueue,
};

/// Convenient re-exports of commonly used types.
pub mod prelude {
    pub use crate::error::Error;
    pub use crate::net::{
        HandleResult, PollInterface, Readiness, ServerSocket, Socket, SocketFactory,
        SocketHandler, SocketPoll, StreamSocket,
    };
    pub use crate::queue::{
        BasicTileQueue, CursorPosition, MessageQueue, Payload, TileDescriptor, TileQueue,
    };
}
