//! Error types for idds-rs.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    /// The row is claimed by another worker. Handlers surface this so the
    /// dispatcher can requeue the event instead of failing it.
    #[error("locked: {0}")]
    Locked(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("broker error: {0}")]
    Broker(String),

    #[error("broker timed out after {0:?}")]
    BrokerTimeout(std::time::Duration),

    #[error("workload system error: {0}")]
    Workload(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Errors worth retrying in place: lock contention in the database
    /// and broker timeouts.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Database(sqlx::Error::Database(db)) => {
                matches!(db.code().as_deref(), Some("40P01") | Some("40001"))
                    || db.message().contains("ORA-00060")
            }
            Error::Database(sqlx::Error::PoolTimedOut) => true,
            Error::BrokerTimeout(_) => true,
            _ => false,
        }
    }
}

impl From<zeromq::ZmqError> for Error {
    fn from(e: zeromq::ZmqError) -> Self {
        Error::Broker(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Workload(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_timeout_is_transient() {
        assert!(Error::BrokerTimeout(std::time::Duration::from_secs(10)).is_transient());
        assert!(!Error::Broker("closed".into()).is_transient());
        assert!(!Error::NotFound("request 1".into()).is_transient());
    }
}
