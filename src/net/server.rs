//! The accepting socket that feeds new connections into a poller.

use crate::error::Error;
use crate::net::poll::PollInterface;
use crate::net::socket::{HandleResult, Readiness, Socket, ThreadOwner};
use crate::net::stream::StreamSocket;

use mio::net::{TcpListener, TcpStream};
use mio::Interest;
use std::io::ErrorKind;
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::Instant;
use tracing::{error, info, warn};

/// Builds a [`StreamSocket`] (with its handler) for each accepted
/// connection.
pub trait SocketFactory: Send + Sync {
    fn create(&self, stream: TcpStream, peer_addr: SocketAddr) -> Arc<StreamSocket>;
}

impl<F> SocketFactory for F
where
    F: Fn(TcpStream, SocketAddr) -> Arc<StreamSocket> + Send + Sync,
{
    fn create(&self, stream: TcpStream, peer_addr: SocketAddr) -> Arc<StreamSocket> {
        self(stream, peer_addr)
    }
}

/// A listening socket.
///
/// Lives in an accept poller; every connection it accepts is turned into a
/// [`StreamSocket`] by the factory and inserted into the client poller,
/// which may be a different one.
pub struct ServerSocket {
    listener: TcpListener,
    client_poll: PollInterface,
    factory: Box<dyn SocketFactory>,
    owner: ThreadOwner,
}

impl ServerSocket {
    /// Binds the listener and wires accepted sockets into `client_poll`.
    pub fn bind<A: ToSocketAddrs>(
        addr: A,
        client_poll: PollInterface,
        factory: Box<dyn SocketFactory>,
    ) -> Result<Arc<ServerSocket>, Error> {
        let addr = addr.to_socket_addrs()?.next().ok_or(Error::InvalidAddress)?;
        let listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "Listening for connections");

        Ok(Arc::new(ServerSocket {
            listener,
            client_poll,
            factory,
            owner: ThreadOwner::default(),
        }))
    }

    /// The actual bound address; useful when binding to port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }
}

impl AsRawFd for ServerSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }
}

impl Socket for ServerSocket {
    fn poll_interest(&self) -> Interest {
        Interest::READABLE
    }

    fn handle_poll(&self, _now: Instant, _readiness: Readiness) -> HandleResult {
        self.owner.assert_current();

        loop {
            match self.listener.accept() {
                Ok((stream, peer_addr)) => {
                    info!(%peer_addr, "Accepting connection");
                    let socket = self.factory.create(stream, peer_addr);
                    self.client_poll.insert_socket(socket);
                }
                Err(err) => match err.kind() {
                    // Further accepting would block, so we are done.
                    ErrorKind::WouldBlock => break,
                    ErrorKind::Interrupted => continue,
                    ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset => {
                        warn!(?err, "Transient accept error");
                        continue;
                    }
                    _ => {
                        error!(?err, "Error accepting connection");
                        return HandleResult::SocketClosed;
                    }
                },
            }
        }

        HandleResult::Continue
    }

    fn shutdown(&self) {
        // Nothing to shut down for a listener; closing the fd on drop stops
        // the accept queue.
    }

    fn set_thread_owner(&self, owner: ThreadId) {
        self.owner.set(owner);
    }
}
