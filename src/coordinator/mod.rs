//! Coordinator
//!
//! The singleton arbiter. It owns the connection registry, the leader
//! state and the pending-query table, and mutates them only from its own
//! task, one event at a time. Timers (retry backoff, promotion grace) are
//! spawned sleeps that post an event back into the same queue, so they
//! never interleave with a handler.

mod election;
mod forwarding;
mod registry;

pub use registry::{
    Connection, ConnectionSummary, CoordinatorSnapshot, LeaderState, PendingQuery, Registry,
};

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, MissedTickBehavior};

use crate::config::CoordinatorConfig;
use crate::error::{Error, Result};
use crate::network::Channel;
use crate::protocol::{FromCoordinator, ToCoordinator};
use election::PendingPromotion;

/// Where the coordinator sends messages for one process
pub type Endpoint = mpsc::UnboundedSender<FromCoordinator>;

/// Everything the coordinator task reacts to
#[derive(Debug)]
pub enum Event {
    /// A message from a process, with the channel it arrived on
    Message {
        endpoint: Endpoint,
        message: ToCoordinator,
    },
    /// Retry timer for a pending query
    RetryDue { request_id: String, seq: u64 },
    /// Promotion grace delay elapsed
    PromotionDue { epoch: u64 },
    /// Report current state
    Snapshot(oneshot::Sender<CoordinatorSnapshot>),
    /// Stop the coordinator
    Shutdown,
}

/// Cloneable handle to a running coordinator
#[derive(Clone)]
pub struct CoordinatorHandle {
    events: mpsc::UnboundedSender<Event>,
}

impl CoordinatorHandle {
    /// Deliver a message that arrived on `endpoint`
    pub fn deliver(&self, endpoint: &Endpoint, message: ToCoordinator) -> Result<()> {
        self.events
            .send(Event::Message {
                endpoint: endpoint.clone(),
                message,
            })
            .map_err(|_| Error::ShuttingDown)
    }

    /// Open an in-process channel to the coordinator.
    ///
    /// Messages sent on the channel reach the coordinator in order.
    pub fn connect(&self) -> Channel {
        let (tx, mut outbound) = mpsc::unbounded_channel::<ToCoordinator>();
        let (endpoint, rx) = mpsc::unbounded_channel::<FromCoordinator>();
        let events = self.events.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    message = outbound.recv() => {
                        let Some(message) = message else { break };
                        let event = Event::Message { endpoint: endpoint.clone(), message };
                        if events.send(event).is_err() {
                            break;
                        }
                    }
                    _ = events.closed() => break,
                }
            }
        });

        Channel { tx, rx }
    }

    /// Current coordinator state
    pub async fn snapshot(&self) -> Result<CoordinatorSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.events
            .send(Event::Snapshot(tx))
            .map_err(|_| Error::ShuttingDown)?;
        rx.await.map_err(|_| Error::ShuttingDown)
    }

    /// Stop the coordinator task
    pub fn shutdown(&self) {
        let _ = self.events.send(Event::Shutdown);
    }

    /// Whether the coordinator task has stopped
    pub fn is_closed(&self) -> bool {
        self.events.is_closed()
    }
}

/// Messages a process only sends while it believes it is registered
fn assumes_registration(message: &ToCoordinator) -> bool {
    matches!(
        message,
        ToCoordinator::HeartbeatPong { .. }
            | ToCoordinator::LivenessHeld { .. }
            | ToCoordinator::OwnerReady { .. }
            | ToCoordinator::OwnerInitFailed { .. }
            | ToCoordinator::QueryResult { .. }
            | ToCoordinator::QueryError { .. }
    )
}

/// Coordinator state machine
pub struct Coordinator {
    config: CoordinatorConfig,
    registry: Registry,
    leader: LeaderState,
    promotion: Option<PendingPromotion>,
    pending: HashMap<String, PendingQuery>,
    next_seq: u64,
    next_epoch: u64,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: mpsc::UnboundedReceiver<Event>,
}

impl Coordinator {
    /// Create a coordinator and its handle; call `run` to start it
    pub fn new(config: CoordinatorConfig) -> (Self, CoordinatorHandle) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let handle = CoordinatorHandle {
            events: events_tx.clone(),
        };

        let coordinator = Self {
            config,
            registry: Registry::default(),
            leader: LeaderState::default(),
            promotion: None,
            pending: HashMap::new(),
            next_seq: 0,
            next_epoch: 0,
            events_tx,
            events_rx,
        };

        (coordinator, handle)
    }

    /// Create and run a coordinator on the current runtime
    pub fn spawn(config: CoordinatorConfig) -> CoordinatorHandle {
        let (coordinator, handle) = Self::new(config);
        tokio::spawn(coordinator.run());
        handle
    }

    /// Process events until shutdown
    pub async fn run(mut self) {
        let mut heartbeat = interval(self.config.heartbeat_interval());
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.tick().await;

        tracing::info!(
            "Coordinator running (heartbeat {:?}, timeout {:?}, grace {:?})",
            self.config.heartbeat_interval(),
            self.config.heartbeat_timeout(),
            self.config.promotion_grace()
        );

        loop {
            tokio::select! {
                event = self.events_rx.recv() => match event {
                    Some(Event::Shutdown) | None => break,
                    Some(event) => self.handle_event(event),
                },
                _ = heartbeat.tick() => self.heartbeat_tick(),
            }
        }

        tracing::info!("Coordinator stopped");
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Message { endpoint, message } => self.handle_message(endpoint, message),
            Event::RetryDue { request_id, seq } => self.retry_due(&request_id, seq),
            Event::PromotionDue { epoch } => self.complete_promotion(epoch),
            Event::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Event::Shutdown => {}
        }
    }

    fn handle_message(&mut self, endpoint: Endpoint, message: ToCoordinator) {
        let process_id = message.process_id().to_string();
        tracing::trace!("Received {} from {}", message.type_name(), process_id);

        if self.registry.contains(&process_id) {
            self.registry.touch(&process_id);
        } else if assumes_registration(&message) {
            // Typically an owner evicted while frozen: tell it who owns the
            // database now so it steps down
            tracing::debug!("{} from unregistered {}; sending current owner", message.type_name(), process_id);
            let _ = endpoint.send(FromCoordinator::ActiveChanged {
                active_process_id: self.leader.active_process_id.clone(),
            });
        }

        match message {
            ToCoordinator::Register { .. } => self.register(process_id, endpoint),
            ToCoordinator::Unregister { .. } => self.unregister(&process_id, &endpoint),
            ToCoordinator::HeartbeatPong { .. } => {}
            ToCoordinator::LivenessHeld { .. } => self.liveness_acquired(&process_id),
            ToCoordinator::LivenessReleased { .. } => self.liveness_released(&process_id),
            ToCoordinator::Query {
                request_id,
                statement,
                ..
            } => self.submit_query(process_id, request_id, statement, endpoint),
            ToCoordinator::OwnerReady { .. } => self.owner_ready(&process_id),
            ToCoordinator::OwnerInitFailed { reason, .. } => {
                self.owner_init_failed(&process_id, reason)
            }
            ToCoordinator::QueryResult {
                request_id, result, ..
            } => self.report_result(&process_id, request_id, result),
            ToCoordinator::QueryError {
                request_id, error, ..
            } => self.report_error(&process_id, request_id, error),
        }
    }

    fn register(&mut self, process_id: String, endpoint: Endpoint) {
        if self.registry.insert(process_id.clone(), endpoint) {
            tracing::info!("Process {} registered ({} connected)", process_id, self.registry.len());
        } else {
            tracing::debug!("Process {} re-registered", process_id);
        }

        if self.usable_owner().is_none() && self.promotion.is_none() {
            if self.leader.active_process_id.is_some() {
                self.set_active(None);
            }
            self.begin_promotion(process_id, self.config.promotion_grace());
        } else if let Some(conn) = self.registry.get(&process_id) {
            conn.send(FromCoordinator::ActiveChanged {
                active_process_id: self.leader.active_process_id.clone(),
            });
        }
    }

    fn unregister(&mut self, process_id: &str, endpoint: &Endpoint) {
        if !self.registry.contains(process_id) {
            tracing::debug!("Unregister from unknown process {} ignored", process_id);
            return;
        }
        // A process that re-registered over a new channel stays registered
        // when its old channel goes away
        if !self.registry.is_registered_on(process_id, endpoint) {
            tracing::debug!("Unregister of {} from a stale channel ignored", process_id);
            return;
        }
        self.registry.remove(process_id);
        tracing::info!("Process {} unregistered ({} connected)", process_id, self.registry.len());
        self.orphan_queries_of(process_id);

        if self.leader.is_active(process_id) {
            self.lose_active(process_id, "unregistered");
        } else if self.cancel_promotion_of(process_id) {
            self.elect(Some(process_id));
        }
    }

    fn snapshot(&self) -> CoordinatorSnapshot {
        CoordinatorSnapshot {
            active_process_id: self.leader.active_process_id.clone(),
            owner_ready: self.leader.owner_ready,
            promoting: self.promotion.as_ref().map(|p| p.process_id.clone()),
            pending_queries: self.pending.len(),
            connections: self
                .registry
                .iter()
                .map(|conn| ConnectionSummary {
                    process_id: conn.process_id.clone(),
                    registered_at: conn.registered_at,
                    silent_for_ms: conn.silent_for().as_millis() as u64,
                    liveness_held: conn.liveness_held,
                    is_active: self.leader.is_active(&conn.process_id),
                })
                .collect(),
        }
    }

    /// Post `event` back to this coordinator after `delay`
    fn schedule(&self, delay: Duration, event: Event) {
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(event);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{FailureKind, QueryFailure, QueryResult, Value};

    fn test_config() -> CoordinatorConfig {
        CoordinatorConfig {
            heartbeat_interval_ms: 100,
            heartbeat_timeout_ms: 500,
            promotion_grace_ms: 50,
            retry_base_delay_ms: 20,
            max_retries: 5,
            ..CoordinatorConfig::default()
        }
    }

    /// A scripted process speaking the raw protocol
    struct TestProcess {
        id: String,
        channel: Channel,
    }

    impl TestProcess {
        fn connect(handle: &CoordinatorHandle, id: &str) -> Self {
            Self {
                id: id.to_string(),
                channel: handle.connect(),
            }
        }

        fn send(&self, message: ToCoordinator) {
            self.channel.tx.send(message).unwrap();
        }

        fn register(&self) {
            self.send(ToCoordinator::Register { process_id: self.id.clone() });
        }

        fn query(&self, request_id: &str, statement: &str) {
            self.send(ToCoordinator::Query {
                process_id: self.id.clone(),
                request_id: request_id.to_string(),
                statement: statement.to_string(),
            });
        }

        fn reply(&self, request_id: &str, result: QueryResult) {
            self.send(ToCoordinator::QueryResult {
                process_id: self.id.clone(),
                request_id: request_id.to_string(),
                result,
            });
        }

        /// Next message that is not a heartbeat probe (probes are answered)
        async fn next(&mut self) -> FromCoordinator {
            loop {
                let message = tokio::time::timeout(Duration::from_secs(30), self.channel.rx.recv())
                    .await
                    .expect("timed out waiting for coordinator")
                    .expect("coordinator channel closed");
                if message == FromCoordinator::HeartbeatProbe {
                    self.send(ToCoordinator::HeartbeatPong { process_id: self.id.clone() });
                    continue;
                }
                return message;
            }
        }

        /// Skip messages until one matches
        async fn until<F: Fn(&FromCoordinator) -> bool>(&mut self, pred: F) -> FromCoordinator {
            loop {
                let message = self.next().await;
                if pred(&message) {
                    return message;
                }
            }
        }

        async fn until_promoted(&mut self) {
            let id = self.id.clone();
            self.until(|m| matches!(m, FromCoordinator::Promote { process_id } if *process_id == id))
                .await;
        }

        async fn until_forward(&mut self) -> (String, String) {
            match self.until(|m| matches!(m, FromCoordinator::ForwardQuery { .. })).await {
                FromCoordinator::ForwardQuery { request_id, statement, .. } => (request_id, statement),
                _ => unreachable!(),
            }
        }

        /// Drain whatever is queued right now
        fn drain(&mut self) -> Vec<FromCoordinator> {
            let mut out = Vec::new();
            while let Ok(message) = self.channel.rx.try_recv() {
                out.push(message);
            }
            out
        }
    }

    fn one_row(value: i64) -> QueryResult {
        QueryResult::Rows {
            columns: vec!["v".to_string()],
            rows: vec![vec![Value::Integer(value)]],
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_registrant_is_promoted_after_grace() {
        let handle = Coordinator::spawn(test_config());
        let mut a = TestProcess::connect(&handle, "proc-a");
        a.register();

        tokio::time::sleep(Duration::from_millis(10)).await;
        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.active_process_id, None);
        assert_eq!(snapshot.promoting.as_deref(), Some("proc-a"));

        assert_eq!(
            a.next().await,
            FromCoordinator::ActiveChanged { active_process_id: Some("proc-a".to_string()) }
        );
        a.until_promoted().await;

        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.active_process_id.as_deref(), Some("proc-a"));
        assert!(!snapshot.owner_ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scenario_query_and_failover() {
        let handle = Coordinator::spawn(test_config());
        let mut a = TestProcess::connect(&handle, "proc-a");
        let mut b = TestProcess::connect(&handle, "proc-b");

        a.register();
        a.until_promoted().await;
        a.send(ToCoordinator::OwnerReady { process_id: "proc-a".to_string() });

        b.register();
        assert_eq!(
            b.until(|m| matches!(m, FromCoordinator::ActiveChanged { .. })).await,
            FromCoordinator::ActiveChanged { active_process_id: Some("proc-a".to_string()) }
        );

        b.query("r1", "Q1");
        let (request_id, statement) = a.until_forward().await;
        assert_eq!((request_id.as_str(), statement.as_str()), ("r1", "Q1"));
        a.reply("r1", one_row(1));

        assert_eq!(
            b.until(|m| matches!(m, FromCoordinator::QueryResult { .. })).await,
            FromCoordinator::QueryResult { request_id: "r1".to_string(), result: one_row(1) }
        );
        assert!(!a.drain().iter().any(|m| matches!(m, FromCoordinator::QueryResult { .. })));

        // A disconnects; B takes over after the grace delay
        a.send(ToCoordinator::Unregister { process_id: "proc-a".to_string() });
        assert_eq!(
            b.until(|m| matches!(m, FromCoordinator::ActiveChanged { .. })).await,
            FromCoordinator::ActiveChanged { active_process_id: None }
        );
        b.until_promoted().await;
        b.send(ToCoordinator::OwnerReady { process_id: "proc-b".to_string() });

        b.query("r2", "Q2");
        let (request_id, _) = b.until_forward().await;
        assert_eq!(request_id, "r2");
        b.reply("r2", one_row(2));
        assert_eq!(
            b.until(|m| matches!(m, FromCoordinator::QueryResult { .. } | FromCoordinator::QueryError { .. })).await,
            FromCoordinator::QueryResult { request_id: "r2".to_string(), result: one_row(2) }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_result_is_ignored() {
        let handle = Coordinator::spawn(test_config());
        let mut a = TestProcess::connect(&handle, "proc-a");
        a.register();
        a.until_promoted().await;

        a.query("r1", "SELECT 1");
        a.until_forward().await;
        a.reply("r1", one_row(1));
        a.reply("r1", one_row(1));

        a.until(|m| matches!(m, FromCoordinator::QueryResult { .. })).await;
        tokio::time::sleep(Duration::from_secs(2)).await;
        let extra: Vec<_> = a
            .drain()
            .into_iter()
            .filter(|m| matches!(m, FromCoordinator::QueryResult { .. } | FromCoordinator::QueryError { .. }))
            .collect();
        assert!(extra.is_empty(), "unexpected extra outcomes: {:?}", extra);
        assert_eq!(handle.snapshot().await.unwrap().pending_queries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted_exactly_once_without_processes() {
        let handle = Coordinator::spawn(test_config());
        // Submits without registering, so nobody can ever own the database
        let mut client = TestProcess::connect(&handle, "client");
        client.query("r1", "SELECT 1");

        match client.next().await {
            FromCoordinator::QueryError { request_id, error } => {
                assert_eq!(request_id, "r1");
                assert_eq!(error.kind, FailureKind::RetriesExhausted);
            }
            other => panic!("expected terminal error, got {:?}", other),
        }

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(client.drain().is_empty());
        assert_eq!(handle.snapshot().await.unwrap().pending_queries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_during_election_is_forwarded_once_owner_exists() {
        let handle = Coordinator::spawn(test_config());
        let mut a = TestProcess::connect(&handle, "proc-a");

        // Registering starts a promotion; the query arrives inside the grace window
        a.register();
        a.query("r1", "SELECT 1");

        a.until_promoted().await;
        let (request_id, _) = a.until_forward().await;
        assert_eq!(request_id, "r1");
        a.reply("r1", one_row(1));
        assert!(matches!(
            a.until(|m| matches!(m, FromCoordinator::QueryResult { .. } | FromCoordinator::QueryError { .. })).await,
            FromCoordinator::QueryResult { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_timeout_fails_silent_owner() {
        let handle = Coordinator::spawn(test_config());
        let mut a = TestProcess::connect(&handle, "proc-a");
        let mut b = TestProcess::connect(&handle, "proc-b");

        a.register();
        a.until_promoted().await;
        b.register();
        b.until(|m| matches!(m, FromCoordinator::ActiveChanged { .. })).await;

        // A goes silent: it stops reading and never answers probes
        b.until_promoted().await;
        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.active_process_id.as_deref(), Some("proc-b"));
        assert!(!snapshot.connections.iter().any(|c| c.process_id == "proc-a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_liveness_release_by_owner_triggers_election() {
        let handle = Coordinator::spawn(test_config());
        let mut a = TestProcess::connect(&handle, "proc-a");
        let mut b = TestProcess::connect(&handle, "proc-b");

        a.register();
        a.until_promoted().await;
        b.register();

        a.send(ToCoordinator::LivenessReleased { process_id: "proc-a".to_string() });
        b.until_promoted().await;
        assert_eq!(
            handle.snapshot().await.unwrap().active_process_id.as_deref(),
            Some("proc-b")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_liveness_held_promotes_immediately_when_ownerless() {
        let handle = Coordinator::spawn(CoordinatorConfig {
            promotion_grace_ms: 10_000,
            heartbeat_timeout_ms: 60_000,
            ..test_config()
        });
        let mut a = TestProcess::connect(&handle, "proc-a");
        let started = tokio::time::Instant::now();
        a.register();
        a.send(ToCoordinator::LivenessHeld { process_id: "proc-a".to_string() });

        a.until_promoted().await;
        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.active_process_id.as_deref(), Some("proc-a"));
        assert!(snapshot.connections[0].liveness_held);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_liveness_held_does_not_steal_ownership() {
        let handle = Coordinator::spawn(test_config());
        let mut a = TestProcess::connect(&handle, "proc-a");
        let mut b = TestProcess::connect(&handle, "proc-b");

        a.register();
        a.until_promoted().await;
        b.register();
        b.send(ToCoordinator::LivenessHeld { process_id: "proc-b".to_string() });

        tokio::time::sleep(Duration::from_millis(300)).await;
        a.drain();
        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.active_process_id.as_deref(), Some("proc-a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_queries_matched_by_request_id() {
        let handle = Coordinator::spawn(test_config());
        let mut a = TestProcess::connect(&handle, "proc-a");
        let mut b = TestProcess::connect(&handle, "proc-b");

        a.register();
        a.until_promoted().await;
        a.send(ToCoordinator::OwnerReady { process_id: "proc-a".to_string() });
        b.register();

        a.query("ra", "SELECT 'a'");
        b.query("rb", "SELECT 'b'");
        let first = a.until_forward().await;
        let second = a.until_forward().await;
        let mut ids = vec![first.0, second.0];
        ids.sort();
        assert_eq!(ids, vec!["ra".to_string(), "rb".to_string()]);

        // Complete in reverse order
        a.reply("rb", one_row(2));
        a.reply("ra", one_row(1));

        assert_eq!(
            b.until(|m| matches!(m, FromCoordinator::QueryResult { .. })).await,
            FromCoordinator::QueryResult { request_id: "rb".to_string(), result: one_row(2) }
        );
        assert_eq!(
            a.until(|m| matches!(m, FromCoordinator::QueryResult { .. })).await,
            FromCoordinator::QueryResult { request_id: "ra".to_string(), result: one_row(1) }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_execution_error_passes_through_without_retry() {
        let handle = Coordinator::spawn(test_config());
        let mut a = TestProcess::connect(&handle, "proc-a");
        a.register();
        a.until_promoted().await;
        a.send(ToCoordinator::OwnerReady { process_id: "proc-a".to_string() });

        a.query("r1", "SELEC 1");
        a.until_forward().await;
        let failure = QueryFailure::new(FailureKind::Execution, "near \"SELEC\": syntax error");
        a.send(ToCoordinator::QueryError {
            process_id: "proc-a".to_string(),
            request_id: "r1".to_string(),
            error: failure.clone(),
        });

        assert_eq!(
            a.until(|m| matches!(m, FromCoordinator::QueryError { .. })).await,
            FromCoordinator::QueryError { request_id: "r1".to_string(), error: failure }
        );
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!a.drain().iter().any(|m| matches!(m, FromCoordinator::ForwardQuery { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_init_failure_fails_forwarded_queries() {
        let handle = Coordinator::spawn(test_config());
        let mut a = TestProcess::connect(&handle, "proc-a");
        a.register();
        a.until_promoted().await;

        a.query("r1", "SELECT 1");
        a.until_forward().await;
        a.send(ToCoordinator::OwnerInitFailed {
            process_id: "proc-a".to_string(),
            reason: "unable to open database file".to_string(),
        });

        match a.until(|m| matches!(m, FromCoordinator::QueryError { .. })).await {
            FromCoordinator::QueryError { request_id, error } => {
                assert_eq!(request_id, "r1");
                assert_eq!(error.kind, FailureKind::Initialization);
                assert!(error.message.contains("unable to open"));
            }
            _ => unreachable!(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_owner_not_ready_is_rerouted() {
        let handle = Coordinator::spawn(test_config());
        let mut a = TestProcess::connect(&handle, "proc-a");
        a.register();
        a.until_promoted().await;

        a.query("r1", "SELECT 1");
        a.until_forward().await;
        a.send(ToCoordinator::QueryError {
            process_id: "proc-a".to_string(),
            request_id: "r1".to_string(),
            error: QueryFailure::new(FailureKind::OwnerNotReady, "demoted"),
        });

        // The retry timer forwards it again instead of failing the caller
        let (request_id, _) = a.until_forward().await;
        assert_eq!(request_id, "r1");
        a.reply("r1", one_row(1));
        assert!(matches!(
            a.until(|m| matches!(m, FromCoordinator::QueryResult { .. } | FromCoordinator::QueryError { .. })).await,
            FromCoordinator::QueryResult { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_evicted_owner_is_told_to_step_down() {
        let handle = Coordinator::spawn(test_config());
        let mut a = TestProcess::connect(&handle, "proc-a");
        let mut b = TestProcess::connect(&handle, "proc-b");

        a.register();
        a.until_promoted().await;
        b.register();

        // A freezes: probes pile up unanswered until it is evicted
        b.until_promoted().await;
        let queued = a.drain();
        assert!(
            queued.contains(&FromCoordinator::ActiveChanged { active_process_id: None }),
            "evicted owner was not told: {:?}",
            queued
        );

        // A resumes and answers a stale probe; it learns who owns the database now
        a.send(ToCoordinator::HeartbeatPong { process_id: "proc-a".to_string() });
        assert_eq!(
            a.until(|m| matches!(m, FromCoordinator::ActiveChanged { .. })).await,
            FromCoordinator::ActiveChanged { active_process_id: Some("proc-b".to_string()) }
        );
        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.active_process_id.as_deref(), Some("proc-b"));
        assert!(!snapshot.connections.iter().any(|c| c.process_id == "proc-a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_init_failure_fails_queries_waiting_for_new_owner() {
        let handle = Coordinator::spawn(test_config());
        let mut a = TestProcess::connect(&handle, "proc-a");
        let mut b = TestProcess::connect(&handle, "proc-b");

        a.register();
        a.until_promoted().await;
        a.send(ToCoordinator::OwnerReady { process_id: "proc-a".to_string() });
        b.register();
        b.until(|m| matches!(m, FromCoordinator::ActiveChanged { .. })).await;

        a.send(ToCoordinator::Unregister { process_id: "proc-a".to_string() });
        b.until_promoted().await;

        // An owner has been ready before, so r1 waits for B to open the store
        b.query("r1", "SELECT 1");
        b.send(ToCoordinator::OwnerInitFailed {
            process_id: "proc-b".to_string(),
            reason: "disk I/O error".to_string(),
        });

        match b.until(|m| matches!(m, FromCoordinator::QueryError { .. })).await {
            FromCoordinator::QueryError { request_id, error } => {
                assert_eq!(request_id, "r1");
                assert_eq!(error.kind, FailureKind::Initialization);
                assert!(error.message.contains("disk I/O"));
            }
            _ => unreachable!(),
        }

        // Later queries reach the failed owner, which answers with the cause
        b.query("r2", "SELECT 2");
        let (request_id, _) = b.until_forward().await;
        assert_eq!(request_id, "r2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_stuck_on_live_owner_is_bounded() {
        let handle = Coordinator::spawn(test_config());
        let mut a = TestProcess::connect(&handle, "proc-a");
        a.register();
        a.until_promoted().await;
        a.send(ToCoordinator::OwnerReady { process_id: "proc-a".to_string() });

        a.query("r1", "SELECT 1");
        a.until_forward().await;

        // A keeps answering heartbeats but never finishes the statement
        let mut forwards = 0;
        let (request_id, error) = loop {
            match a.next().await {
                FromCoordinator::ForwardQuery { .. } => forwards += 1,
                FromCoordinator::QueryError { request_id, error } => break (request_id, error),
                _ => {}
            }
        };
        assert_eq!(request_id, "r1");
        assert_eq!(error.kind, FailureKind::OwnerUnavailable);
        assert_eq!(forwards, 0, "statement was sent to a live owner twice");

        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.pending_queries, 0);
        assert_eq!(snapshot.active_process_id.as_deref(), Some("proc-a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unregister_from_stale_channel_is_ignored() {
        let handle = Coordinator::spawn(test_config());
        let old = TestProcess::connect(&handle, "proc-a");
        let mut current = TestProcess::connect(&handle, "proc-a");

        old.register();
        tokio::time::sleep(Duration::from_millis(10)).await;
        current.register();
        current.until_promoted().await;

        // The first connection closes after the process moved to the second
        old.send(ToCoordinator::Unregister { process_id: "proc-a".to_string() });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.connections.len(), 1);
        assert_eq!(snapshot.active_process_id.as_deref(), Some("proc-a"));

        current.send(ToCoordinator::Unregister { process_id: "proc-a".to_string() });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(handle.snapshot().await.unwrap().connections.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_owner_through_churn() {
        let handle = Coordinator::spawn(test_config());
        let mut processes: Vec<TestProcess> = (0..4)
            .map(|i| TestProcess::connect(&handle, &format!("proc-{}", i)))
            .collect();

        for p in &processes {
            p.register();
        }

        for round in 0..3 {
            tokio::time::sleep(Duration::from_millis(120)).await;
            let snapshot = handle.snapshot().await.unwrap();
            let active: Vec<_> = snapshot.connections.iter().filter(|c| c.is_active).collect();
            assert!(active.len() <= 1, "round {}: {:?}", round, active);

            if let Some(owner) = snapshot.active_process_id {
                if let Some(index) = processes.iter().position(|p| p.id == owner) {
                    let leaving = processes.remove(index);
                    leaving.send(ToCoordinator::Unregister { process_id: owner });
                }
            }
            for p in processes.iter_mut() {
                p.drain();
                p.send(ToCoordinator::HeartbeatPong { process_id: p.id.clone() });
            }
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
        let snapshot = handle.snapshot().await.unwrap();
        let active: Vec<_> = snapshot.connections.iter().filter(|c| c.is_active).collect();
        assert_eq!(active.len(), 1);
        assert_eq!(snapshot.active_process_id.as_deref(), Some(active[0].process_id.as_str()));
    }
}
