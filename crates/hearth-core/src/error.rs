use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("address pool exhausted")]
    PoolExhausted,

    #[error("device {0} is blocked")]
    MacBlocked(String),

    #[error("ip {0} is already in use")]
    IpConflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("malformed packet: {0}")]
    Codec(String),

    #[error("upstream timed out: {0}")]
    UpstreamTimeout(String),

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("config error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

// Blanket From impls for redb error types
impl From<redb::Error> for Error {
    fn from(e: redb::Error) -> Self {
        Error::Store(e.to_string())
    }
}

impl From<redb::StorageError> for Error {
    fn from(e: redb::StorageError) -> Self {
        Error::Store(e.to_string())
    }
}

impl From<redb::TableError> for Error {
    fn from(e: redb::TableError) -> Self {
        Error::Store(e.to_string())
    }
}

impl From<redb::TransactionError> for Error {
    fn from(e: redb::TransactionError) -> Self {
        Error::Store(e.to_string())
    }
}

impl From<redb::CommitError> for Error {
    fn from(e: redb::CommitError) -> Self {
        Error::Store(e.to_string())
    }
}

impl From<redb::DatabaseError> for Error {
    fn from(e: redb::DatabaseError) -> Self {
        Error::Store(e.to_string())
    }
}
