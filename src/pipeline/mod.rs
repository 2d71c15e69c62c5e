//! Per-connection processing pipelines
//!
//! Every accepted connection gets a fixed, ordered list of stages chosen by
//! its role. Each inbound event runs through the stages in order until one
//! stops it; when the connection closes every stage sees `on_close`.
//!
//! | Role     | Stages                                 |
//! |----------|----------------------------------------|
//! | front    | `TraceStage`, `ClientStage`            |
//! | hub / db | `TraceStage`, `PartialResultStage`     |

pub mod stages;

pub use stages::{ClientStage, PartialResultStage, TraceStage};

use crate::dispatcher::QueryDispatcher;
use crate::party::{Party, Role};
use crate::session::ClientHandle;
use crate::transport::messages::{ClientRequest, PartyMessage};
use async_trait::async_trait;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub enum InboundEvent {
    Party(PartyMessage),
    Client(ClientRequest),
}

impl InboundEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            InboundEvent::Party(PartyMessage::Hello { .. }) => "hello",
            InboundEvent::Party(PartyMessage::StartQuery { .. }) => "start_query",
            InboundEvent::Party(PartyMessage::PartialResult(_)) => "partial_result",
            InboundEvent::Client(ClientRequest::Submit { .. }) => "submit",
            InboundEvent::Client(ClientRequest::Cancel { .. }) => "cancel",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageFlow {
    Continue,
    /// Drop the event and close the connection.
    Stop,
}

#[derive(Debug, Clone)]
pub struct ConnectionContext {
    pub peer: String,
    pub role: Role,
    /// Announced party, for interserver connections.
    pub party: Option<Party>,
    /// Event sink, for front connections.
    pub client: Option<ClientHandle>,
}

impl ConnectionContext {
    pub fn front(peer: impl Into<String>, client: ClientHandle) -> Self {
        Self {
            peer: peer.into(),
            role: Role::Front,
            party: None,
            client: Some(client),
        }
    }

    pub fn interserver(peer: impl Into<String>, party: Party) -> Self {
        Self {
            peer: peer.into(),
            role: party.role(),
            party: Some(party),
            client: None,
        }
    }
}

#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    async fn on_event(&self, ctx: &ConnectionContext, event: &InboundEvent) -> StageFlow;

    async fn on_close(&self, _ctx: &ConnectionContext) {}
}

pub struct Pipeline {
    role: Role,
    stages: Vec<Box<dyn Stage>>,
}

impl Pipeline {
    pub fn for_role(role: Role, dispatcher: Arc<QueryDispatcher>) -> Self {
        let stages: Vec<Box<dyn Stage>> = match role {
            Role::Front => vec![
                Box::new(TraceStage::new()),
                Box::new(ClientStage::new(dispatcher)),
            ],
            Role::Hub | Role::Db => vec![
                Box::new(TraceStage::new()),
                Box::new(PartialResultStage::new(dispatcher)),
            ],
        };
        Self { role, stages }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }

    pub async fn on_event(&self, ctx: &ConnectionContext, event: &InboundEvent) -> StageFlow {
        for stage in &self.stages {
            if stage.on_event(ctx, event).await == StageFlow::Stop {
                log::debug!("{} stopped {} from {}", stage.name(), event.kind(), ctx.peer);
                return StageFlow::Stop;
            }
        }
        StageFlow::Continue
    }

    pub async fn on_close(&self, ctx: &ConnectionContext) {
        for stage in &self.stages {
            stage.on_close(ctx).await;
        }
    }
}
