use thiserror::Error;

/// The error type for tilecomm operations.
///
/// This encompasses the errors that can occur when setting up pollers and
/// sockets or parsing tile messages. Most runtime I/O failures are not
/// surfaced through this type: the poll loop handles transient errors
/// locally and reports peer disconnects by removing the affected socket.
#[derive(Error, Debug)]
pub enum Error {
    /// Low-level I/O error from the operating system.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The provided socket address could not be parsed or resolved.
    #[error("Invalid socket address")]
    InvalidAddress,

    /// Configuration file parsing or key lookup failed.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// A tile message did not match the expected `key=value` grammar.
    ///
    /// Tile messages start with `tile ` or `tilecombine` and carry
    /// whitespace-separated `key=value` tokens including the `x`, `y`, `w`
    /// and `h` geometry keys.
    #[error("Malformed tile message: {0}")]
    MalformedTileMessage(String),
}
