//! Non-blocking socket multiplexing.
//!
//! This module provides the per-document reactor: the [`Socket`] poll-event
//! contract, the buffered [`StreamSocket`] with its [`SocketHandler`] hook,
//! the accepting [`ServerSocket`], and the [`SocketPoll`] event loop that
//! multiplexes them on a dedicated thread.

mod poll;
mod server;
mod socket;
mod stream;

pub use poll::{wakeup_world, PollInterface, SocketPoll};
pub use server::{ServerSocket, SocketFactory};
pub use socket::{HandleResult, Readiness, Socket};
pub use stream::{SocketHandler, StreamSocket};
