//! dquery - dispatch and aggregation core for multi-party aggregate queries
//!
//! A front node accepts a client's query, fans it out to the hub and DB
//! parties, and assembles the per-tuple partial results they stream back.

pub mod config;
pub mod dispatcher;
pub mod domain;
pub mod error;
pub mod party;
pub mod pipeline;
pub mod query;
pub mod server;
pub mod session;
pub mod transport;


pub use config::{Config, ConfigError};
pub use dispatcher::QueryDispatcher;
pub use domain::DomainIterator;
pub use error::{ProtocolViolation, QueryError, Result};
pub use party::{Endpoint, Party, PartyRegistry, Role};
pub use query::Query;
pub use session::{ClientHandle, QueryId, SessionState};
