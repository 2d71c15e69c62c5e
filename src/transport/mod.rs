//! Outbound channels to parties and the messages carried on them

pub mod backpressure;
pub mod memory;
pub mod messages;
pub mod pool;
pub mod retry;
pub mod tcp;

pub use backpressure::{BackpressureController, OutputBufferLimits};
pub use memory::MemoryConnector;
pub use messages::{ClientEvent, ClientRequest, PartialResult, PartyMessage};
pub use pool::{ChannelHandle, ChannelPool, Connector, PartyLink};
pub use retry::{ExponentialBackoff, MaxRetriesExceeded};
pub use tcp::TcpConnector;
