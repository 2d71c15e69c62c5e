//! Error taxonomy for query dispatch and aggregation
//!
//! `ConfigError` is fatal at startup, `ConnectFailed` fails only the affected
//! session after the retry budget is spent, and `ProtocolViolation` is always
//! recovered locally by dropping the offending event.

use crate::config::ConfigError;
use crate::party::Party;
use crate::session::QueryId;

/// A malformed or out-of-protocol partial-result event.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolViolation {
    UnknownQuery(QueryId),
    TupleOutOfRange {
        query_id: QueryId,
        tuple_index: usize,
        tuple_count: usize,
    },
    AggregateOutOfRange {
        query_id: QueryId,
        tuple_index: usize,
        position: usize,
        aggregate_count: usize,
    },
    DoubleWrite {
        query_id: QueryId,
        tuple_index: usize,
        position: usize,
    },
    RowCountConflict {
        query_id: QueryId,
        tuple_index: usize,
        db: Party,
        existing: u64,
        reported: u64,
    },
    RowIndexOverrun {
        query_id: QueryId,
        tuple_index: usize,
        db: Party,
        index: u64,
        total: u64,
    },
    RowLimitExceeded {
        query_id: QueryId,
        tuple_index: usize,
        db: Party,
        value: u64,
    },
    NotADbParty {
        query_id: QueryId,
        party: Party,
    },
}

impl std::fmt::Display for ProtocolViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolViolation::UnknownQuery(id) => write!(f, "unknown query id {}", id),
            ProtocolViolation::TupleOutOfRange {
                query_id,
                tuple_index,
                tuple_count,
            } => write!(
                f,
                "query {}: tuple index {} out of range (tuple count {})",
                query_id, tuple_index, tuple_count
            ),
            ProtocolViolation::AggregateOutOfRange {
                query_id,
                tuple_index,
                position,
                aggregate_count,
            } => write!(
                f,
                "query {}: tuple {} aggregate position {} out of range ({} aggregates)",
                query_id, tuple_index, position, aggregate_count
            ),
            ProtocolViolation::DoubleWrite {
                query_id,
                tuple_index,
                position,
            } => write!(
                f,
                "query {}: tuple {} aggregate position {} already finalized",
                query_id, tuple_index, position
            ),
            ProtocolViolation::RowCountConflict {
                query_id,
                tuple_index,
                db,
                existing,
                reported,
            } => write!(
                f,
                "query {}: tuple {} row count from {} changed from {} to {}",
                query_id, tuple_index, db, existing, reported
            ),
            ProtocolViolation::RowIndexOverrun {
                query_id,
                tuple_index,
                db,
                index,
                total,
            } => write!(
                f,
                "query {}: tuple {} row index from {} would reach {} past total {}",
                query_id, tuple_index, db, index, total
            ),
            ProtocolViolation::RowLimitExceeded {
                query_id,
                tuple_index,
                db,
                value,
            } => write!(
                f,
                "query {}: tuple {} row count {} from {} exceeds the tracked maximum",
                query_id, tuple_index, value, db
            ),
            ProtocolViolation::NotADbParty { query_id, party } => write!(
                f,
                "query {}: row progress attributed to non-db party {}",
                query_id, party
            ),
        }
    }
}

impl std::error::Error for ProtocolViolation {}

#[derive(Debug)]
pub enum QueryError {
    Configuration(ConfigError),
    ConnectFailed { party: Party, reason: String },
    ChannelClosed(Party),
    ProtocolViolation(ProtocolViolation),
    DomainOverflow { dimensions: usize, limit: usize },
    InvalidQuery(String),
    SessionTimeout(QueryId),
    ClientDisconnected(QueryId),
    Cancelled(QueryId),
    Io(std::io::Error),
    Serialization(serde_json::Error),
}

impl QueryError {
    /// Stable snake_case tag reported to clients alongside the message.
    pub fn kind(&self) -> &'static str {
        match self {
            QueryError::Configuration(_) => "configuration_error",
            QueryError::ConnectFailed { .. } => "connect_failed",
            QueryError::ChannelClosed(_) => "channel_closed",
            QueryError::ProtocolViolation(_) => "protocol_violation",
            QueryError::DomainOverflow { .. } => "domain_overflow",
            QueryError::InvalidQuery(_) => "invalid_query",
            QueryError::SessionTimeout(_) => "session_timeout",
            QueryError::ClientDisconnected(_) => "client_disconnected",
            QueryError::Cancelled(_) => "cancelled",
            QueryError::Io(_) => "io_error",
            QueryError::Serialization(_) => "serialization_error",
        }
    }
}

impl From<ConfigError> for QueryError {
    fn from(err: ConfigError) -> Self {
        QueryError::Configuration(err)
    }
}

impl From<ProtocolViolation> for QueryError {
    fn from(err: ProtocolViolation) -> Self {
        QueryError::ProtocolViolation(err)
    }
}

impl From<std::io::Error> for QueryError {
    fn from(err: std::io::Error) -> Self {
        QueryError::Io(err)
    }
}

impl From<serde_json::Error> for QueryError {
    fn from(err: serde_json::Error) -> Self {
        QueryError::Serialization(err)
    }
}

impl std::fmt::Display for QueryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryError::Configuration(e) => write!(f, "Configuration error: {}", e),
            QueryError::ConnectFailed { party, reason } => {
                write!(f, "Connection to {} failed: {}", party, reason)
            }
            QueryError::ChannelClosed(party) => write!(f, "Channel to {} is closed", party),
            QueryError::ProtocolViolation(v) => write!(f, "Protocol violation: {}", v),
            QueryError::DomainOverflow { dimensions, limit } => write!(
                f,
                "Grouping domain over {} dimensions exceeds {} tuples",
                dimensions, limit
            ),
            QueryError::InvalidQuery(msg) => write!(f, "Invalid query: {}", msg),
            QueryError::SessionTimeout(id) => write!(f, "Query {} timed out", id),
            QueryError::ClientDisconnected(id) => {
                write!(f, "Client of query {} disconnected", id)
            }
            QueryError::Cancelled(id) => write!(f, "Query {} was cancelled", id),
            QueryError::Io(e) => write!(f, "IO error: {}", e),
            QueryError::Serialization(e) => write!(f, "Serialization error: {}", e),
        }
    }
}

impl std::error::Error for QueryError {}

pub type Result<T> = std::result::Result<T, QueryError>;
