//! The bouncer core: per-user actors multiplexing upstream IRC sessions to
//! any number of attached downstream clients.

use thiserror::Error;

pub mod cap;
pub mod certfp;
pub mod config;
pub mod downstream;
pub mod msgstore;
pub mod server;
pub mod service;
pub mod upstream;
pub mod user;

/// Errors crossing component boundaries inside the core
#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Parse(String),
    #[error("{0}")]
    Auth(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("transient I/O failure: {0}")]
    TransientIo(String),
    #[error("{0}")]
    FatalConfig(String),
    #[error("not currently connected")]
    UpstreamDisconnected,
    #[error("operation cancelled")]
    Cancelled,
    #[error(transparent)]
    Database(#[from] buoy_database::DatabaseError),
}

impl Error {
    pub(crate) fn parse(msg: impl ToString) -> Self {
        Self::Parse(msg.to_string())
    }

    pub(crate) fn not_found(msg: impl ToString) -> Self {
        Self::NotFound(msg.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::TransientIo(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// The nick, user, host and realname of the in-band service pseudo-user
pub const SERVICE_NICK: &str = "BouncerServ";

pub(crate) fn is_service_nick(name: &str) -> bool {
    name.eq_ignore_ascii_case(SERVICE_NICK)
}

/// Generate an opaque identifier for message-store entries and batches
pub(crate) fn random_id() -> String {
    format!("{:x}", rand::random::<u128>())
}
