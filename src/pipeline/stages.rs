use super::{ConnectionContext, InboundEvent, Stage, StageFlow};
use crate::dispatcher::QueryDispatcher;
use crate::error::{ProtocolViolation, QueryError};
use crate::transport::messages::{ClientEvent, ClientRequest, PartyMessage};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Logs every event and the connection's event count on close.
pub struct TraceStage {
    events: AtomicU64,
}

impl TraceStage {
    pub fn new() -> Self {
        Self {
            events: AtomicU64::new(0),
        }
    }
}

impl Default for TraceStage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Stage for TraceStage {
    fn name(&self) -> &'static str {
        "trace"
    }

    async fn on_event(&self, ctx: &ConnectionContext, event: &InboundEvent) -> StageFlow {
        self.events.fetch_add(1, Ordering::Relaxed);
        log::debug!("{} <- {} ({})", ctx.role, event.kind(), ctx.peer);
        StageFlow::Continue
    }

    async fn on_close(&self, ctx: &ConnectionContext) {
        log::info!(
            "🔌 {} connection {} closed after {} events",
            ctx.role,
            ctx.peer,
            self.events.load(Ordering::Relaxed)
        );
    }
}

/// Turns client requests into dispatcher calls.
pub struct ClientStage {
    dispatcher: Arc<QueryDispatcher>,
}

impl ClientStage {
    pub fn new(dispatcher: Arc<QueryDispatcher>) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl Stage for ClientStage {
    fn name(&self) -> &'static str {
        "client"
    }

    async fn on_event(&self, ctx: &ConnectionContext, event: &InboundEvent) -> StageFlow {
        let (Some(client), InboundEvent::Client(request)) = (&ctx.client, event) else {
            log::warn!("⚠️  Unexpected {} on client connection {}", event.kind(), ctx.peer);
            return StageFlow::Stop;
        };

        match request {
            ClientRequest::Submit { query } => {
                if let Err(err) = self.dispatcher.dispatch(query.clone(), client.clone()).await {
                    log::warn!("❌ Rejected query from {}: {}", ctx.peer, err);
                    client.send(ClientEvent::error(None, &err)).await;
                }
            }
            ClientRequest::Cancel { query_id } => {
                let owned = self
                    .dispatcher
                    .session(query_id)
                    .map(|session| session.client().client_ref() == client.client_ref())
                    .unwrap_or(false);

                let cancelled = if owned {
                    self.dispatcher.cancel(*query_id).await
                } else {
                    Err(QueryError::ProtocolViolation(
                        ProtocolViolation::UnknownQuery(*query_id),
                    ))
                };

                if let Err(err) = cancelled {
                    client.send(ClientEvent::error(Some(*query_id), &err)).await;
                }
            }
        }

        StageFlow::Continue
    }

    async fn on_close(&self, ctx: &ConnectionContext) {
        if let Some(client) = &ctx.client {
            client.mark_disconnected();
            self.dispatcher.client_disconnected(client.client_ref()).await;
        }
    }
}

/// Feeds partial results from hub and DB parties into their sessions.
pub struct PartialResultStage {
    dispatcher: Arc<QueryDispatcher>,
}

impl PartialResultStage {
    pub fn new(dispatcher: Arc<QueryDispatcher>) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl Stage for PartialResultStage {
    fn name(&self) -> &'static str {
        "partial_result"
    }

    async fn on_event(&self, ctx: &ConnectionContext, event: &InboundEvent) -> StageFlow {
        let (Some(party), InboundEvent::Party(message)) = (ctx.party, event) else {
            log::warn!("⚠️  Unexpected {} on interserver connection {}", event.kind(), ctx.peer);
            return StageFlow::Stop;
        };

        match message {
            // Violations are logged by the dispatcher and never close the connection.
            PartyMessage::PartialResult(result) => {
                let _ = self.dispatcher.handle_partial_result(party, result);
            }
            PartyMessage::StartQuery { query_id, .. } => {
                log::info!("📥 Start of query {} announced by {}", query_id, party);
            }
            PartyMessage::Hello { party: announced } => {
                log::warn!(
                    "⚠️  Repeated hello from {} (announced {}), ignoring",
                    party,
                    announced
                );
            }
        }

        StageFlow::Continue
    }

    async fn on_close(&self, ctx: &ConnectionContext) {
        if let Some(party) = ctx.party {
            log::info!(
                "🔌 Inbound connection from {} closed, redialing outbound channel on next send",
                party
            );
            self.dispatcher.pool().invalidate(party);
        }
    }
}
