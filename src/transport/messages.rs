//! Newline-delimited JSON messages exchanged with parties and clients

use crate::error::{QueryError, Result};
use crate::party::Party;
use crate::query::Query;
use crate::session::{QueryId, ResultTable};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowProgress {
    pub db: Party,
    /// Total rows the DB party will scan for this tuple, once known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_count: Option<u64>,
    #[serde(default)]
    pub row_delta: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateValue {
    pub position: usize,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialResult {
    pub query_id: QueryId,
    pub tuple_index: usize,
    #[serde(default)]
    pub progress: Vec<RowProgress>,
    #[serde(default)]
    pub values: Vec<AggregateValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PartyMessage {
    /// First frame on an inbound interserver connection.
    Hello { party: Party },
    StartQuery {
        query_id: QueryId,
        /// JSON text of the query.
        query: String,
        client_ref: String,
    },
    PartialResult(PartialResult),
}

impl PartyMessage {
    pub fn encode(&self) -> Result<Vec<u8>> {
        encode_line(self)
    }

    pub fn decode(line: &str) -> Result<Self> {
        Ok(serde_json::from_str(line.trim_end())?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientRequest {
    Submit { query: Query },
    Cancel { query_id: QueryId },
}

impl ClientRequest {
    pub fn decode(line: &str) -> Result<Self> {
        Ok(serde_json::from_str(line.trim_end())?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    Accepted {
        query_id: QueryId,
        tuple_count: usize,
    },
    TupleProgress {
        query_id: QueryId,
        tuple_index: usize,
        fraction: f64,
    },
    TupleDone {
        query_id: QueryId,
        tuple_index: usize,
        group: Vec<Option<String>>,
        values: Vec<Option<f64>>,
    },
    AllDone {
        query_id: QueryId,
        table: ResultTable,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        query_id: Option<QueryId>,
        kind: String,
        message: String,
    },
}

impl ClientEvent {
    pub fn error(query_id: Option<QueryId>, err: &QueryError) -> Self {
        ClientEvent::Error {
            query_id,
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }

    pub fn query_id(&self) -> Option<QueryId> {
        match self {
            ClientEvent::Accepted { query_id, .. }
            | ClientEvent::TupleProgress { query_id, .. }
            | ClientEvent::TupleDone { query_id, .. }
            | ClientEvent::AllDone { query_id, .. } => Some(*query_id),
            ClientEvent::Error { query_id, .. } => *query_id,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        encode_line(self)
    }
}

fn encode_line<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    let mut frame = serde_json::to_vec(message)?;
    frame.push(b'\n');
    Ok(frame)
}
