//! Owner Role
//!
//! What a process does while it owns the database. A single worker task
//! holds the store and runs jobs in arrival order: open, forwarded
//! statements, close. Each promotion gets a new generation; jobs queued
//! under an older generation are answered as not ready instead of run.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::error::Error;
use crate::protocol::{FailureKind, QueryFailure, ToCoordinator};
use crate::store::Store;

/// Owner role state as seen by the proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OwnerState {
    /// Not the owner
    Idle,
    /// Promoted; the store is being opened
    Opening,
    /// Promoted and the store is open
    Ready,
    /// Promoted but the store could not be opened
    Failed,
}

/// Reported by the worker when an open finishes
#[derive(Debug)]
pub(crate) enum OwnerEvent {
    Opened { generation: u64 },
    OpenFailed { generation: u64, reason: String },
}

#[derive(Debug)]
enum Job {
    Open {
        generation: u64,
    },
    Execute {
        generation: u64,
        request_id: String,
        statement: String,
    },
    Close {
        done: Option<oneshot::Sender<()>>,
    },
}

/// Proxy-side handle on the owner worker
pub(crate) struct OwnerRole {
    state: OwnerState,
    generation: Arc<AtomicU64>,
    jobs: mpsc::UnboundedSender<Job>,
}

impl OwnerRole {
    /// Spawn the worker for `store`; results go straight to the coordinator
    pub fn spawn(
        process_id: String,
        store: Arc<dyn Store>,
        tx: mpsc::UnboundedSender<ToCoordinator>,
        events: mpsc::UnboundedSender<OwnerEvent>,
    ) -> Self {
        let generation = Arc::new(AtomicU64::new(0));
        let (jobs, jobs_rx) = mpsc::unbounded_channel();

        let worker = Worker {
            process_id,
            store,
            tx,
            events,
            generation: generation.clone(),
            opened: None,
            failed: None,
        };
        tokio::spawn(worker.run(jobs_rx));

        Self {
            state: OwnerState::Idle,
            generation,
            jobs,
        }
    }

    pub fn state(&self) -> OwnerState {
        self.state
    }

    /// Start opening the store. No-op while already opening or open.
    pub fn promote(&mut self) {
        if matches!(self.state, OwnerState::Opening | OwnerState::Ready) {
            return;
        }
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.state = OwnerState::Opening;
        let _ = self.jobs.send(Job::Open { generation });
    }

    /// Stop owning: queued statements are answered as not ready and the
    /// store is closed behind them.
    pub fn demote(&mut self) -> bool {
        if self.state == OwnerState::Idle {
            return false;
        }
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.state = OwnerState::Idle;
        let _ = self.jobs.send(Job::Close { done: None });
        true
    }

    /// Queue a forwarded statement; false if this process is not the owner
    pub fn forward(&mut self, request_id: String, statement: String) -> bool {
        if self.state == OwnerState::Idle {
            return false;
        }
        let generation = self.generation.load(Ordering::SeqCst);
        self.jobs
            .send(Job::Execute {
                generation,
                request_id,
                statement,
            })
            .is_ok()
    }

    /// Apply a worker report; returns the new state if it changed
    pub fn apply(&mut self, event: OwnerEvent) -> Option<OwnerState> {
        let current = self.generation.load(Ordering::SeqCst);
        let (generation, next) = match event {
            OwnerEvent::Opened { generation } => (generation, OwnerState::Ready),
            OwnerEvent::OpenFailed { generation, .. } => (generation, OwnerState::Failed),
        };
        if generation != current || self.state != OwnerState::Opening {
            return None;
        }
        self.state = next;
        Some(next)
    }

    /// Demote and wait until the store is closed
    pub async fn close(&mut self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.state = OwnerState::Idle;

        let (done, closed) = oneshot::channel();
        if self.jobs.send(Job::Close { done: Some(done) }).is_ok() {
            let _ = closed.await;
        }
    }
}

struct Worker {
    process_id: String,
    store: Arc<dyn Store>,
    tx: mpsc::UnboundedSender<ToCoordinator>,
    events: mpsc::UnboundedSender<OwnerEvent>,
    generation: Arc<AtomicU64>,
    /// Generation the store is open for
    opened: Option<u64>,
    /// Generation whose open failed, with the cause
    failed: Option<(u64, String)>,
}

impl Worker {
    async fn run(mut self, mut jobs: mpsc::UnboundedReceiver<Job>) {
        while let Some(job) = jobs.recv().await {
            match job {
                Job::Open { generation } => self.open(generation).await,
                Job::Execute {
                    generation,
                    request_id,
                    statement,
                } => self.execute(generation, request_id, statement).await,
                Job::Close { done } => {
                    if self.opened.take().is_some() || self.store.is_open().await {
                        self.store.close().await;
                        tracing::info!("{} closed the database", self.process_id);
                    }
                    if let Some(done) = done {
                        let _ = done.send(());
                    }
                }
            }
        }
        tracing::debug!("Owner worker for {} stopped", self.process_id);
    }

    fn current(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    async fn open(&mut self, generation: u64) {
        if generation != self.current() {
            return;
        }

        match self.store.open().await {
            Ok(()) => {
                self.opened = Some(generation);
                self.failed = None;
                tracing::info!("{} opened the database", self.process_id);
                let _ = self.tx.send(ToCoordinator::OwnerReady {
                    process_id: self.process_id.clone(),
                });
                let _ = self.events.send(OwnerEvent::Opened { generation });
            }
            Err(e) => {
                let reason = e.to_string();
                tracing::error!("{} could not open the database: {}", self.process_id, reason);
                self.failed = Some((generation, reason.clone()));
                let _ = self.tx.send(ToCoordinator::OwnerInitFailed {
                    process_id: self.process_id.clone(),
                    reason: reason.clone(),
                });
                let _ = self.events.send(OwnerEvent::OpenFailed { generation, reason });
            }
        }
    }

    async fn execute(&mut self, generation: u64, request_id: String, statement: String) {
        let outcome = if generation != self.current() {
            Err(QueryFailure::new(FailureKind::OwnerNotReady, "no longer the owner"))
        } else if let Some((failed, reason)) = self.failed.as_ref().filter(|(g, _)| *g == generation) {
            tracing::debug!("Rejecting {} after failed open of generation {}", request_id, failed);
            Err(QueryFailure::new(FailureKind::Initialization, reason.clone()))
        } else if self.opened != Some(generation) {
            Err(QueryFailure::new(FailureKind::OwnerNotReady, "database not open"))
        } else {
            self.store.execute(&statement).await.map_err(|e| match e {
                Error::Execution(message) => QueryFailure::new(FailureKind::Execution, message),
                Error::StoreNotOpen => QueryFailure::new(FailureKind::OwnerNotReady, "database not open"),
                other => QueryFailure::new(FailureKind::Execution, other.to_string()),
            })
        };

        let process_id = self.process_id.clone();
        let message = match outcome {
            Ok(result) => ToCoordinator::QueryResult {
                process_id,
                request_id,
                result,
            },
            Err(error) => {
                tracing::debug!("Query {} failed: {}", request_id, error);
                ToCoordinator::QueryError {
                    process_id,
                    request_id,
                    error,
                }
            }
        };
        let _ = self.tx.send(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::protocol::{QueryResult, Value};
    use crate::store::SqliteStore;

    struct Harness {
        role: OwnerRole,
        store: Arc<dyn Store>,
        to_coordinator: mpsc::UnboundedReceiver<ToCoordinator>,
        events: mpsc::UnboundedReceiver<OwnerEvent>,
    }

    fn harness(config: StoreConfig) -> Harness {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::new(config));
        let (tx, to_coordinator) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();
        let role = OwnerRole::spawn("proc-a".to_string(), store.clone(), tx, events_tx);
        Harness {
            role,
            store,
            to_coordinator,
            events,
        }
    }

    #[tokio::test]
    async fn test_forwards_queued_while_opening_run_after_ready() {
        let mut h = harness(StoreConfig::in_memory());
        assert!(!h.role.forward("r0".into(), "SELECT 1".into()));

        h.role.promote();
        assert_eq!(h.role.state(), OwnerState::Opening);
        assert!(h.role.forward("r1".into(), "CREATE TABLE t (x INTEGER)".into()));
        assert!(h.role.forward("r2".into(), "SELECT count(*) AS n FROM t".into()));

        assert_eq!(
            h.to_coordinator.recv().await.unwrap(),
            ToCoordinator::OwnerReady { process_id: "proc-a".into() }
        );
        assert!(matches!(
            h.to_coordinator.recv().await.unwrap(),
            ToCoordinator::QueryResult { request_id, .. } if request_id == "r1"
        ));
        match h.to_coordinator.recv().await.unwrap() {
            ToCoordinator::QueryResult { request_id, result, .. } => {
                assert_eq!(request_id, "r2");
                assert_eq!(
                    result,
                    QueryResult::Rows {
                        columns: vec!["n".into()],
                        rows: vec![vec![Value::Integer(0)]],
                    }
                );
            }
            other => panic!("unexpected {:?}", other),
        }

        let event = h.events.recv().await.unwrap();
        assert_eq!(h.role.apply(event), Some(OwnerState::Ready));
    }

    #[tokio::test]
    async fn test_demote_rejects_queued_and_closes() {
        let mut h = harness(StoreConfig::in_memory());
        h.role.promote();
        let event = h.events.recv().await.unwrap();
        h.role.apply(event);
        h.to_coordinator.recv().await.unwrap();
        assert!(h.store.is_open().await);

        assert!(h.role.demote());
        assert!(!h.role.demote());
        assert!(!h.role.forward("r1".into(), "SELECT 1".into()));

        h.role.close().await;
        assert!(!h.store.is_open().await);
    }

    #[tokio::test]
    async fn test_open_failure_reports_and_rejects() {
        let dir = tempfile::tempdir().unwrap();
        let mut h = harness(StoreConfig {
            path: dir.path().join("missing").join("db.sqlite"),
            open_attempts: 2,
            open_backoff_ms: 5,
            ..StoreConfig::default()
        });

        h.role.promote();
        h.role.forward("r1".into(), "SELECT 1".into());

        match h.to_coordinator.recv().await.unwrap() {
            ToCoordinator::OwnerInitFailed { reason, .. } => assert!(!reason.is_empty()),
            other => panic!("unexpected {:?}", other),
        }
        match h.to_coordinator.recv().await.unwrap() {
            ToCoordinator::QueryError { request_id, error, .. } => {
                assert_eq!(request_id, "r1");
                assert_eq!(error.kind, FailureKind::Initialization);
            }
            other => panic!("unexpected {:?}", other),
        }

        let event = h.events.recv().await.unwrap();
        assert_eq!(h.role.apply(event), Some(OwnerState::Failed));
    }
}
