//! Crate-wide error taxonomy.
//!
//! Remote-service failures are typed and specific; nothing in this crate
//! retries or swallows them. The only built-in resilience is the
//! idempotent block skipping in [`crate::wos::ResultSet::rip`].

use thiserror::Error;

/// Errors surfaced by the relay session, the catalog client, and the
/// flat-file parser.
#[derive(Debug, Error)]
pub enum Error {
    /// Relay login was rejected, or the expected auth cookie never arrived.
    /// The session is back in the logged-out state.
    #[error("relay login failed: {0}")]
    Authentication(String),

    /// An operation that needs an authenticated relay session was attempted
    /// while logged out.
    #[error("not logged in to the relay")]
    NotAuthenticated,

    /// Session used in the wrong order (e.g. `login` while already logged
    /// in, or a catalog call before the catalog session was established).
    #[error("session state error: {0}")]
    State(String),

    /// HTTP-level failure: non-2xx status, connect failure, or timeout.
    #[error("transport error: {0}")]
    Transport(String),

    /// The service reported that the requested export range runs past the
    /// available data. Benign end-of-data when the resultset count was an
    /// estimate; fatal otherwise.
    #[error("export range beyond available data: {0}")]
    InvalidInput(String),

    /// The search matched nothing.
    #[error("no records found")]
    NoRecordsFound,

    /// Service-level error with a key this client does not recognize. The
    /// raw key and message are kept for diagnostics.
    #[error("remote service error `{key}`: {message}")]
    RemoteService { key: String, message: String },

    /// The remote session identifier changed mid-session. The identifier is
    /// immutable for the lifetime of a session; a mismatch means the cached
    /// resultsets on the other end no longer belong to us.
    #[error("remote session identifier changed: had {had}, saw {saw}")]
    SidChanged { had: String, saw: String },

    /// Caller misuse: bad export range, malformed accession id, or a resume
    /// directory that belongs to a different query.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Malformed flat-file input.
    #[error("record format error: {0}")]
    Format(String),

    /// Bad or incomplete configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Filesystem failure while publishing exported blocks.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Transport(err.to_string())
    }
}

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
