//! Integration tests for session lifecycle across dispatch, retry, expiry
//! and client departure.
//!
//! Parties are simulated with the in-memory connector; partial results are
//! injected straight into the dispatcher.

#[cfg(test)]
mod dispatch_lifecycle_tests {
    use dquery::query::{Aggregate, AggregateFunction, Column, ColumnType};
    use dquery::transport::messages::{
        AggregateValue, ClientEvent, PartialResult, PartyMessage, RowProgress,
    };
    use dquery::transport::{MemoryConnector, OutputBufferLimits};
    use dquery::{ClientHandle, Config, Party, Query, QueryDispatcher, QueryId, SessionState};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::{sleep, timeout};

    fn column(db: Party, name: &str, domain: Option<Vec<&str>>) -> Column {
        Column {
            table: "claims".to_string(),
            name: name.to_string(),
            db,
            column_type: ColumnType::String,
            domain: domain.map(|values| values.into_iter().map(|v| Some(v.to_string())).collect()),
        }
    }

    fn query() -> Query {
        Query {
            table: "claims".to_string(),
            aggregates: vec![Aggregate {
                function: AggregateFunction::Avg,
                column: column(Party::Db2, "amount", None),
            }],
            prefilters: BTreeMap::new(),
            group_bys: vec![column(Party::Db1, "state", Some(vec!["ca", "ny"]))],
        }
    }

    fn config() -> Config {
        let mut config = Config::for_party(Party::Ph);
        config.connect_retry_budget = 3;
        config.connect_retry_delay_ms = 1;
        config.connect_retry_max_delay_ms = 4;
        config.result_update_cooldown_ms = 20;
        config.max_session_lifetime_secs = 10;
        config
    }

    fn finished(query_id: QueryId, tuple_index: usize, value: f64) -> PartialResult {
        PartialResult {
            query_id,
            tuple_index,
            progress: vec![
                RowProgress {
                    db: Party::Db1,
                    row_count: Some(2),
                    row_delta: 2,
                },
                RowProgress {
                    db: Party::Db2,
                    row_count: Some(2),
                    row_delta: 2,
                },
            ],
            values: vec![AggregateValue { position: 0, value }],
        }
    }

    async fn next_event(events: &mut mpsc::Receiver<ClientEvent>) -> ClientEvent {
        loop {
            let event = timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("timed out waiting for client event")
                .expect("client channel closed");
            if !matches!(event, ClientEvent::TupleProgress { .. }) {
                return event;
            }
        }
    }

    async fn wait_for_state(dispatcher: &QueryDispatcher, id: QueryId, state: SessionState) {
        for _ in 0..500 {
            if dispatcher.session(&id).map(|s| s.state()) == Some(state) {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("query {} never reached {}", id, state);
    }

    #[tokio::test]
    async fn test_unreachable_db_fails_only_its_session() {
        // Test: db2 refuses 3 connection attempts while another session runs
        let (connector, _frames) = MemoryConnector::new();
        let connector = Arc::new(connector);
        let dispatcher = Arc::new(QueryDispatcher::with_connector(
            Arc::new(config()),
            connector.clone(),
        ));

        let (client_b, mut events_b) = ClientHandle::channel("front-b", 64);
        let id_b = dispatcher.dispatch(query(), client_b).await.unwrap();
        wait_for_state(&dispatcher, id_b, SessionState::AwaitingResults).await;
        assert_eq!(connector.attempts(Party::Db2), 1);

        connector.refuse(Party::Db2);
        dispatcher.pool().invalidate(Party::Db2);

        let (client_a, mut events_a) = ClientHandle::channel("front-a", 64);
        let id_a = dispatcher.dispatch(query(), client_a).await.unwrap();

        assert!(matches!(next_event(&mut events_a).await, ClientEvent::Accepted { .. }));
        match next_event(&mut events_a).await {
            ClientEvent::Error {
                query_id,
                kind,
                message,
            } => {
                assert_eq!(query_id, Some(id_a));
                assert_eq!(kind, "connect_failed");
                assert!(message.contains("db2"));
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(dispatcher.session(&id_a).is_none());
        assert_eq!(connector.attempts(Party::Db2), 4);

        // session B is unaffected and still completes
        let session_b = dispatcher.session(&id_b).unwrap();
        assert_eq!(session_b.state(), SessionState::AwaitingResults);

        dispatcher
            .handle_partial_result(Party::Db1, &finished(id_b, 0, 12.5))
            .unwrap();
        dispatcher
            .handle_partial_result(Party::Db2, &finished(id_b, 1, 7.25))
            .unwrap();
        assert_eq!(session_b.state(), SessionState::Completed);

        assert!(matches!(next_event(&mut events_b).await, ClientEvent::Accepted { .. }));
        assert!(matches!(next_event(&mut events_b).await, ClientEvent::TupleDone { tuple_index: 0, .. }));
        assert!(matches!(next_event(&mut events_b).await, ClientEvent::TupleDone { tuple_index: 1, .. }));
        match next_event(&mut events_b).await {
            ClientEvent::AllDone { table, .. } => {
                assert_eq!(table.columns, vec!["claims.state", "avg(claims.amount)"]);
                assert_eq!(table.rows[0].group, vec![Some("ca".to_string())]);
                assert_eq!(table.rows[1].values, vec![Some(7.25)]);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_session_times_out_on_injected_clock() {
        let clock = Arc::new(AtomicI64::new(1_000));
        let (connector, _frames) = MemoryConnector::new();
        let config = Arc::new(config());
        let pool = QueryDispatcher::build_pool(&config, Arc::new(connector));
        let dispatcher = Arc::new({
            let clock = clock.clone();
            QueryDispatcher::new_with_clock(config, pool, Box::new(move || clock.load(Ordering::SeqCst)))
        });

        let (client, mut events) = ClientHandle::channel("front-t", 64);
        let id = dispatcher.dispatch(query(), client).await.unwrap();
        let session = dispatcher.session(&id).unwrap();

        clock.store(11_000, Ordering::SeqCst);
        assert_eq!(dispatcher.expire_sessions().await, 0);

        clock.store(11_001, Ordering::SeqCst);
        assert_eq!(dispatcher.expire_sessions().await, 1);
        assert_eq!(session.state(), SessionState::TimedOut);
        assert!(dispatcher.sessions().is_empty());

        assert!(matches!(next_event(&mut events).await, ClientEvent::Accepted { .. }));
        match next_event(&mut events).await {
            ClientEvent::Error { kind, .. } => assert_eq!(kind, "session_timeout"),
            other => panic!("unexpected event {:?}", other),
        }

        // late results for the expired query are dropped
        assert!(dispatcher
            .handle_partial_result(Party::Db1, &finished(id, 0, 1.0))
            .is_err());
    }

    #[tokio::test]
    async fn test_client_disconnect_cancels_its_sessions_only() {
        let (connector, _frames) = MemoryConnector::new();
        let dispatcher = Arc::new(QueryDispatcher::with_connector(
            Arc::new(config()),
            Arc::new(connector),
        ));

        let (client_a, _events_a) = ClientHandle::channel("front-a", 64);
        let (client_b, _events_b) = ClientHandle::channel("front-b", 64);
        let first = dispatcher.dispatch(query(), client_a.clone()).await.unwrap();
        let second = dispatcher.dispatch(query(), client_a).await.unwrap();
        let other = dispatcher.dispatch(query(), client_b).await.unwrap();

        let first_session = dispatcher.session(&first).unwrap();
        assert_eq!(dispatcher.client_disconnected("front-a").await, 2);

        assert_eq!(first_session.state(), SessionState::Cancelled);
        assert!(dispatcher.session(&first).is_none());
        assert!(dispatcher.session(&second).is_none());
        assert!(dispatcher.session(&other).is_some());
    }

    #[tokio::test]
    async fn test_dropped_client_channel_cancels_session() {
        // Test: the progress reporter notices the client is gone
        let (connector, _frames) = MemoryConnector::new();
        let dispatcher = Arc::new(QueryDispatcher::with_connector(
            Arc::new(config()),
            Arc::new(connector),
        ));

        let (client, events) = ClientHandle::channel("front-gone", 64);
        let id = dispatcher.dispatch(query(), client).await.unwrap();
        let session = dispatcher.session(&id).unwrap();
        drop(events);

        for _ in 0..500 {
            if session.is_terminal() {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(session.state(), SessionState::Cancelled);
        assert!(dispatcher.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_unread_client_does_not_stall_expiry() {
        let clock = Arc::new(AtomicI64::new(1_000));
        let (connector, _frames) = MemoryConnector::new();
        let config = Arc::new(config());
        let pool = QueryDispatcher::build_pool(&config, Arc::new(connector));
        let dispatcher = Arc::new({
            let clock = clock.clone();
            QueryDispatcher::new_with_clock(config, pool, Box::new(move || clock.load(Ordering::SeqCst)))
        });

        // room for the accepted event only, and nobody reads it
        let (stuck, _stuck_events) = ClientHandle::channel("front-stuck", 1);
        let (client, mut events) = ClientHandle::channel("front-ok", 64);
        let stuck_id = dispatcher.dispatch(query(), stuck).await.unwrap();
        let id = dispatcher.dispatch(query(), client).await.unwrap();
        let stuck_session = dispatcher.session(&stuck_id).unwrap();
        let session = dispatcher.session(&id).unwrap();

        // let the stuck client's reporter park on its full queue
        sleep(Duration::from_millis(100)).await;

        clock.store(20_000, Ordering::SeqCst);
        let expired = timeout(Duration::from_secs(2), dispatcher.expire_sessions())
            .await
            .expect("expiry blocked on a client that is not reading");
        assert_eq!(expired, 2);

        assert_eq!(stuck_session.state(), SessionState::TimedOut);
        assert_eq!(session.state(), SessionState::TimedOut);
        assert!(!stuck_session.client().is_connected());
        assert!(dispatcher.sessions().is_empty());

        assert!(matches!(next_event(&mut events).await, ClientEvent::Accepted { .. }));
        match next_event(&mut events).await {
            ClientEvent::Error { kind, .. } => assert_eq!(kind, "session_timeout"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancel_drops_start_parked_on_backpressure() {
        let (connector, mut frames) = MemoryConnector::new();
        let connector = Arc::new(connector);
        let mut config = config();
        config.output_buffer_limits = OutputBufferLimits::uniform_kib(1).unwrap();
        let config = Arc::new(config);
        let pool = QueryDispatcher::build_pool(&config, connector.clone());
        let dispatcher = Arc::new(QueryDispatcher::new(config, pool.clone()));

        // db1 stops draining while a frame holds its whole budget
        connector.stall(Party::Db1);
        let filler = PartyMessage::StartQuery {
            query_id: QueryId::mint(),
            query: "x".repeat(2_000),
            client_ref: "filler".to_string(),
        };
        pool.acquire(Party::Db1).await.unwrap().send(&filler).await.unwrap();
        assert_eq!(pool.backpressure().available(Party::Db1), 0);

        let (client, _events) = ClientHandle::channel("front-c", 64);
        let id = dispatcher.dispatch(query(), client).await.unwrap();
        let session = dispatcher.session(&id).unwrap();

        let mut delivered = Vec::new();
        for _ in 0..2 {
            let (party, _) = timeout(Duration::from_secs(5), frames.recv()).await.unwrap().unwrap();
            delivered.push(party);
        }
        delivered.sort();
        assert_eq!(delivered, vec![Party::Ph, Party::Db2]);
        assert_eq!(session.state(), SessionState::Dispatched);

        dispatcher.cancel(id).await.unwrap();
        assert_eq!(session.state(), SessionState::Cancelled);
        sleep(Duration::from_millis(50)).await;

        connector.resume(Party::Db1);
        let (party, frame) = timeout(Duration::from_secs(5), frames.recv()).await.unwrap().unwrap();
        assert_eq!(party, Party::Db1);
        assert_eq!(
            PartyMessage::decode(std::str::from_utf8(&frame).unwrap()).unwrap(),
            filler
        );

        // nothing for the cancelled query follows the filler
        assert!(timeout(Duration::from_millis(200), frames.recv()).await.is_err());
        assert_eq!(pool.backpressure().available(Party::Db1), 1024);
    }
}
