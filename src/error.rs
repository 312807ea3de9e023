//! Error taxonomy (spec §7), one `thiserror`-derived enum per component,
//! following the style of `forwarder::uplink::UplinkError` and
//! `forwarder::config::ConfigError`.

use thiserror::Error;

/// Database gateway errors (4.B). Classifies failures the way §7 requires:
/// connection-lost and timeout are retryable at the pipeline; constraint and
/// syntax are fatal for the query that triggered them.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("constraint violation: {0}")]
    Constraint(String),
    #[error("syntax error: {0}")]
    Syntax(String),
    #[error("timeout: {0}")]
    Timeout(String),
}

impl DbError {
    /// True for errors the pipeline should retry rather than surface to the
    /// client immediately (§7: db-transient).
    pub fn is_retryable(&self) -> bool {
        matches!(self, DbError::ConnectionLost(_) | DbError::Timeout(_))
    }
}

impl From<sqlx::Error> for DbError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                DbError::ConnectionLost(e.to_string())
            }
            sqlx::Error::Database(db_err) => {
                // Postgres SQLSTATE class prefixes: 23 = integrity constraint
                // violation, 42 = syntax error or access rule violation.
                match db_err.code().as_deref() {
                    Some(code) if code.starts_with("23") => DbError::Constraint(e.to_string()),
                    Some(code) if code.starts_with("42") => DbError::Syntax(e.to_string()),
                    _ => DbError::ConnectionLost(e.to_string()),
                }
            }
            _ => DbError::ConnectionLost(e.to_string()),
        }
    }
}

/// Codec errors (4.A): malformed inbound frames.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("I/O error while framing: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame had zero parts")]
    EmptyFrame,
    #[error("frame part exceeded maximum size ({0} bytes)")]
    PartTooLarge(usize),
    #[error("invalid UTF-8 in string part: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
    #[error("invalid timestamp in frame: {0}")]
    InvalidTimestamp(String),
}

/// Configuration errors (startup-fatal, per §7's `config` kind).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("missing required field: {0}")]
    MissingField(String),
    #[error("invalid config value: {0}")]
    InvalidValue(String),
}

/// Socket lifecycle errors (4.H).
#[derive(Debug, Error)]
pub enum SocketError {
    #[error("bind failed on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("connect failed to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("socket not constructed for this role")]
    NotConstructed,
}
