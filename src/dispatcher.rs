//! Query dispatch and session lifecycle
//!
//! `Created -> Dispatched -> AwaitingResults -> {Completed | Failed | TimedOut | Cancelled}`
//!
//! Fan-out, progress reporting and expiry each run as their own task; inbound
//! partial results are applied on the connection task that read them.

use crate::config::Config;
use crate::error::{ProtocolViolation, QueryError, Result};
use crate::party::{Party, PartyRegistry};
use crate::query::Query;
use crate::session::{
    apply_partial_result, ApplyOutcome, ClientHandle, CorrelationRegistry, QueryId, QuerySession,
    SessionState,
};
use crate::transport::backpressure::BackpressureController;
use crate::transport::messages::{ClientEvent, PartialResult, PartyMessage};
use crate::transport::pool::{ChannelPool, Connector};
use crate::transport::retry::ExponentialBackoff;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio::time::{interval, Duration, MissedTickBehavior};

pub struct QueryDispatcher {
    config: Arc<Config>,
    registry: Arc<PartyRegistry>,
    sessions: Arc<CorrelationRegistry>,
    pool: Arc<ChannelPool>,
    now_fn: Box<dyn Fn() -> i64 + Send + Sync>,
}

impl QueryDispatcher {
    /// Dispatcher over `pool` using wall-clock milliseconds.
    pub fn new(config: Arc<Config>, pool: Arc<ChannelPool>) -> Self {
        Self::new_with_clock(
            config,
            pool,
            Box::new(|| chrono::Utc::now().timestamp_millis()),
        )
    }

    /// Dispatcher with a custom millisecond clock, for deterministic expiry.
    pub fn new_with_clock(
        config: Arc<Config>,
        pool: Arc<ChannelPool>,
        now_fn: Box<dyn Fn() -> i64 + Send + Sync>,
    ) -> Self {
        Self {
            registry: pool.registry().clone(),
            sessions: Arc::new(CorrelationRegistry::new()),
            config,
            pool,
            now_fn,
        }
    }

    /// Build the party registry, byte budgets and channel pool from `config`.
    pub fn with_connector(config: Arc<Config>, connector: Arc<dyn Connector>) -> Self {
        Self::new(config.clone(), Self::build_pool(&config, connector))
    }

    pub fn build_pool(config: &Config, connector: Arc<dyn Connector>) -> Arc<ChannelPool> {
        Arc::new(ChannelPool::new(
            Arc::new(PartyRegistry::from_config(config)),
            connector,
            Arc::new(BackpressureController::new(&config.output_buffer_limits)),
        ))
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn pool(&self) -> &Arc<ChannelPool> {
        &self.pool
    }

    pub fn sessions(&self) -> &Arc<CorrelationRegistry> {
        &self.sessions
    }

    pub fn session(&self, id: &QueryId) -> Option<Arc<QuerySession>> {
        self.sessions.get(id)
    }

    fn now(&self) -> i64 {
        (self.now_fn)()
    }

    /// Register a session for `query` and start fanning it out.
    ///
    /// Validation and domain errors are returned before any party is
    /// contacted. Later failures reach the client as error events.
    pub async fn dispatch(self: &Arc<Self>, query: Query, client: ClientHandle) -> Result<QueryId> {
        query.validate()?;
        let query = Arc::new(query);
        let query_text = query.to_wire()?;

        let session = loop {
            let id = QueryId::mint();
            let session = Arc::new(QuerySession::new(id, query.clone(), client.clone(), self.now())?);
            if self.sessions.insert(session.clone()) {
                break session;
            }
            log::warn!("⚠️  Query id {} already in flight, minting another", id);
        };
        let id = session.id();

        log::info!(
            "🆕 Query {} created for client {} ({} tuples × {} aggregates)",
            id,
            client.client_ref(),
            session.tuple_count(),
            session.aggregate_count()
        );

        let accepted = ClientEvent::Accepted {
            query_id: id,
            tuple_count: session.tuple_count(),
        };
        if !client.send(accepted).await {
            self.terminate(&session, SessionState::Cancelled, None).await;
            return Err(QueryError::ClientDisconnected(id));
        }

        session.transition(SessionState::Created, SessionState::Dispatched);
        log::info!("📤 Query {} dispatched to {:?}", id, self.registry.dispatch_targets());

        let dispatcher = self.clone();
        let fan_out_session = session.clone();
        tokio::spawn(async move { dispatcher.fan_out(fan_out_session, query_text).await });

        let dispatcher = self.clone();
        tokio::spawn(async move { dispatcher.report_progress(session).await });

        Ok(id)
    }

    async fn fan_out(self: Arc<Self>, session: Arc<QuerySession>, query_text: String) {
        let id = session.id();
        let mut sends = JoinSet::new();

        for party in self.registry.dispatch_targets() {
            let message = PartyMessage::StartQuery {
                query_id: id,
                query: query_text.clone(),
                client_ref: session.client().client_ref().to_string(),
            };
            let dispatcher = self.clone();
            let session = session.clone();
            sends.spawn(async move { dispatcher.send_with_retry(&session, party, &message).await });
        }

        while let Some(joined) = sends.join_next().await {
            let failure = match joined {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => err,
                Err(join_err) => QueryError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    join_err.to_string(),
                )),
            };

            sends.abort_all();
            self.terminate(&session, SessionState::Failed, Some(failure)).await;
            return;
        }

        if session.transition(SessionState::Dispatched, SessionState::AwaitingResults) {
            log::info!("⏳ Query {} awaiting results", id);
        }
    }

    async fn send_with_retry(
        &self,
        session: &QuerySession,
        party: Party,
        message: &PartyMessage,
    ) -> Result<()> {
        let mut backoff = ExponentialBackoff::for_attempts(
            self.config.connect_retry_budget,
            self.config.connect_retry_delay_ms,
            self.config.connect_retry_max_delay_ms,
        );

        loop {
            let attempt = async {
                match self.pool.acquire(party).await {
                    Ok(channel) => channel.send(message).await,
                    Err(err) => Err(err),
                }
            };

            // A send parked on the party's byte budget is dropped with the session.
            let sent = tokio::select! {
                biased;
                _ = session.terminated() => {
                    log::debug!("Query {} ended, not forwarding to {}", session.id(), party);
                    return Err(QueryError::Cancelled(session.id()));
                }
                sent = attempt => sent,
            };

            let err = match sent {
                Ok(()) => {
                    log::debug!("Query {} start sent to {}", session.id(), party);
                    return Ok(());
                }
                Err(err @ (QueryError::ConnectFailed { .. } | QueryError::ChannelClosed(_))) => err,
                Err(other) => return Err(other),
            };

            log::warn!(
                "⚠️  Query {}: send to {} failed on attempt {}/{}: {}",
                session.id(),
                party,
                backoff.attempts_made(),
                self.config.connect_retry_budget,
                err
            );

            if let QueryError::ChannelClosed(_) = err {
                self.pool.invalidate(party);
            }

            let retry = tokio::select! {
                biased;
                _ = session.terminated() => return Err(QueryError::Cancelled(session.id())),
                retry = backoff.sleep() => retry,
            };
            if retry.is_err() {
                return Err(match err {
                    QueryError::ChannelClosed(party) => QueryError::ConnectFailed {
                        party,
                        reason: "channel closed".to_string(),
                    },
                    other => other,
                });
            }
        }
    }

    /// Apply one inbound partial result. Violations are logged and dropped.
    pub fn handle_partial_result(&self, from: Party, event: &PartialResult) -> Result<ApplyOutcome> {
        let session = match self.sessions.get(&event.query_id) {
            Some(session) => session,
            None => {
                let violation = ProtocolViolation::UnknownQuery(event.query_id);
                log::warn!("⚠️  Dropped partial result from {}: {}", from, violation);
                return Err(violation.into());
            }
        };

        match apply_partial_result(&session, event) {
            Ok(ApplyOutcome::SessionCompleted) => {
                self.complete(&session);
                Ok(ApplyOutcome::SessionCompleted)
            }
            Ok(outcome) => Ok(outcome),
            Err(violation) => {
                log::warn!("⚠️  Dropped partial result from {}: {}", from, violation);
                Err(violation.into())
            }
        }
    }

    fn complete(&self, session: &Arc<QuerySession>) {
        if session.finish(SessionState::Completed) {
            self.sessions.remove(&session.id());
            log::info!(
                "✅ Query {} completed ({} tuples)",
                session.id(),
                session.tuple_count()
            );
        }
    }

    /// Move `session` to a terminal state, deregister it and report `error`
    /// to a still-connected client. False if it had already terminated.
    async fn terminate(
        &self,
        session: &Arc<QuerySession>,
        state: SessionState,
        error: Option<QueryError>,
    ) -> bool {
        if !session.finish(state) {
            return false;
        }
        let id = session.id();
        self.sessions.remove(&id);

        match &error {
            Some(err) => log::warn!("❌ Query {} {}: {}", id, state, err),
            None => log::info!("🛑 Query {} {}", id, state),
        }

        if let Some(err) = error {
            let client = session.client();
            if client.is_connected() {
                client.try_send(ClientEvent::error(Some(id), &err));
            }
        }
        true
    }

    /// Client-requested cancellation. Results still in flight are discarded.
    pub async fn cancel(&self, id: QueryId) -> Result<()> {
        let session = self
            .sessions
            .get(&id)
            .ok_or(QueryError::ProtocolViolation(ProtocolViolation::UnknownQuery(id)))?;
        self.terminate(&session, SessionState::Cancelled, Some(QueryError::Cancelled(id)))
            .await;
        Ok(())
    }

    /// Tear down every session owned by a departed client.
    pub async fn client_disconnected(&self, client_ref: &str) -> usize {
        let mut cancelled = 0;
        for session in self.sessions.sessions_for_client(client_ref) {
            session.client().mark_disconnected();
            if self.terminate(&session, SessionState::Cancelled, None).await {
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            log::info!("🔌 Client {} disconnected, cancelled {} queries", client_ref, cancelled);
        }
        cancelled
    }

    /// Time out sessions older than the configured lifetime.
    pub async fn expire_sessions(&self) -> usize {
        let max_lifetime_ms = (self.config.max_session_lifetime_secs as i64).saturating_mul(1000);
        let mut expired = 0;
        for session in self.sessions.expired(self.now(), max_lifetime_ms) {
            let id = session.id();
            if self
                .terminate(&session, SessionState::TimedOut, Some(QueryError::SessionTimeout(id)))
                .await
            {
                expired += 1;
            }
        }
        expired
    }

    async fn client_gone(&self, session: &Arc<QuerySession>) {
        session.client().mark_disconnected();
        self.terminate(session, SessionState::Cancelled, None).await;
    }

    /// Per-session reporter: `tuple_done` for each newly completed tuple in
    /// index order, `tuple_progress` for the first incomplete one, and
    /// `all_done` once the session completes.
    async fn report_progress(self: Arc<Self>, session: Arc<QuerySession>) {
        let id = session.id();
        let scale = self.config.result_scale;
        let client = session.client().clone();

        let mut ticker = interval(Duration::from_millis(self.config.result_update_cooldown_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut next_tuple = 0;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = session.changed() => {}
            }

            // Read before draining: a completed session has every tuple marked.
            let state = session.state();

            while next_tuple < session.tuple_count() && session.is_tuple_complete(next_tuple) {
                let Some(row) = session.tuple_row(next_tuple, scale) else {
                    break;
                };
                let done = ClientEvent::TupleDone {
                    query_id: id,
                    tuple_index: next_tuple,
                    group: row.group,
                    values: row.values,
                };
                if !client.send(done).await {
                    self.client_gone(&session).await;
                    return;
                }
                next_tuple += 1;
            }

            match state {
                SessionState::Completed => {
                    let table = session.result_table(scale);
                    if !client.send(ClientEvent::AllDone { query_id: id, table }).await {
                        log::warn!("⚠️  Query {} completed but client is gone", id);
                    }
                    return;
                }
                state if state.is_terminal() => return,
                _ => {}
            }

            if next_tuple < session.tuple_count() {
                let progress = ClientEvent::TupleProgress {
                    query_id: id,
                    tuple_index: next_tuple,
                    fraction: session.tuple_fraction(next_tuple),
                };
                if !client.send(progress).await {
                    self.client_gone(&session).await;
                    return;
                }
            }
        }
    }
}

/// Session sweeper - periodically times out sessions past their lifetime
///
/// Runs indefinitely until cancelled.
pub async fn session_sweeper_task(dispatcher: Arc<QueryDispatcher>) {
    let cooldown_secs = dispatcher.config.zombie_check_cooldown_secs;
    log::info!("⏰ Starting session sweeper (interval: {}s)", cooldown_secs);

    let mut timer = interval(Duration::from_secs(cooldown_secs));

    loop {
        timer.tick().await;

        let expired = dispatcher.expire_sessions().await;
        if expired > 0 {
            log::info!(
                "🧹 Timed out {} sessions ({} still in flight)",
                expired,
                dispatcher.sessions.len()
            );
        } else {
            log::debug!("🧹 No expired sessions ({} in flight)", dispatcher.sessions.len());
        }
    }
}
