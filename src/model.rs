//! Core data types shared across the relay: request fingerprints, query
//! records, log records, and the wire status codes used in replies.
//!
//! Grounded in `original_source/LogMsg.h` for the log record shape and in
//! spec §3 for the query record / fingerprint shape.

use std::time::Instant;

/// The `(client-id, message-id)` pair identifying a single logical client
/// request across retries. Globally unique within the cache retention
/// window; serves as the primary idempotence key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint {
    pub client_id: String,
    pub msg_id: u32,
}

impl Fingerprint {
    pub fn new(client_id: impl Into<String>, msg_id: u32) -> Self {
        Fingerprint {
            client_id: client_id.into(),
            msg_id,
        }
    }
}

/// Read or write classification of a submitted query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    Read,
    Write,
}

/// A client-submitted query, tracked from receipt through to reply.
#[derive(Debug, Clone)]
pub struct QueryRecord {
    pub fingerprint: Fingerprint,
    pub sql: String,
    pub arrived_at: Instant,
    pub retries: u32,
    pub kind: QueryKind,
}

impl QueryRecord {
    pub fn new(fingerprint: Fingerprint, sql: impl Into<String>, kind: QueryKind) -> Self {
        QueryRecord {
            fingerprint,
            sql: sql.into(),
            arrived_at: Instant::now(),
            retries: 0,
            kind,
        }
    }
}

/// Status codes carried in ack/reply frames (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum StatusCode {
    Ok = 0,
    QueryFailed = 1,
    CacheHit = 2,
    QueueFull = 3,
    NotMasterForWrites = 4,
    SyntaxError = 5,
}

impl StatusCode {
    pub fn code(self) -> u32 {
        self as u32
    }
}

/// A completed reply, ready to be sent to a client or replayed from cache.
/// `routed_client_id` is filled in by the reply sink at send time, not at
/// construction — the pipeline itself only ever keys replies by
/// [`Fingerprint`], which already carries the client id alongside the
/// reply in every `ReplySink::try_send` call.
#[derive(Debug, Clone)]
pub struct ReplyFrame {
    pub msg_id: u32,
    pub status: StatusCode,
    pub payload: Vec<u8>,
    pub routed_client_id: String,
}

impl ReplyFrame {
    pub fn new(msg_id: u32, status: StatusCode, payload: Vec<u8>) -> Self {
        ReplyFrame {
            msg_id,
            status,
            payload,
            routed_client_id: String::new(),
        }
    }

    pub fn empty(msg_id: u32, status: StatusCode) -> Self {
        Self::new(msg_id, status, Vec::new())
    }
}

/// A client log submission, carried to the monitoring database (inbound) or
/// onward to the peer/monitoring audience (outbound).
///
/// Field shape follows `original_source/LogMsg.h` exactly: client id,
/// client-supplied timestamp, severity, message text, retry count, and local
/// receipt time.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub client_id: String,
    pub timestamp: String,
    pub severity: u32,
    pub message: String,
    pub retries: u32,
    pub received_at: Instant,
}

impl LogRecord {
    pub fn new(
        client_id: impl Into<String>,
        timestamp: impl Into<String>,
        severity: u32,
        message: impl Into<String>,
    ) -> Self {
        LogRecord {
            client_id: client_id.into(),
            timestamp: timestamp.into(),
            severity,
            message: message.into(),
            retries: 0,
            received_at: Instant::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprints_with_same_fields_are_equal_and_hash_equal() {
        use std::collections::HashSet;
        let a = Fingerprint::new("c1", 1);
        let b = Fingerprint::new("c1", 1);
        assert_eq!(a, b);
        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn status_code_values_match_wire_protocol() {
        assert_eq!(StatusCode::Ok.code(), 0);
        assert_eq!(StatusCode::QueryFailed.code(), 1);
        assert_eq!(StatusCode::CacheHit.code(), 2);
        assert_eq!(StatusCode::QueueFull.code(), 3);
        assert_eq!(StatusCode::NotMasterForWrites.code(), 4);
        assert_eq!(StatusCode::SyntaxError.code(), 5);
    }
}
