//! Client Proxy
//!
//! The per-process half of the protocol. Every process submits its queries
//! through a `ClientProxy`; the proxy answers heartbeats and, while its
//! process owns the database, runs forwarded statements against the store.
//!
//! All proxy state lives in one driver task that handles caller commands,
//! coordinator messages and owner-worker reports one at a time.

mod owner;

pub use owner::OwnerState;

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::{AbortHandle, JoinHandle};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::liveness::{self, LivenessSignal};
use crate::network::Channel;
use crate::protocol::{FailureKind, FromCoordinator, QueryFailure, QueryResult, ToCoordinator};
use crate::store::Store;
use owner::{OwnerEvent, OwnerRole};

/// Observable changes, for subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyEvent {
    /// The coordinator announced a new owner (or none)
    ActiveChanged(Option<String>),
    /// This process was promoted to owner
    Promoted,
    /// Some owner finished opening the database
    OwnerReady(String),
    /// This process failed to open the database
    InitFailed(String),
    /// This process stopped being the owner
    Demoted,
    /// The coordinator connection was lost
    Disconnected,
}

/// Current view of one proxy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyStatus {
    pub process_id: String,
    pub registered: bool,
    pub connected: bool,
    pub active_process_id: Option<String>,
    pub role: OwnerState,
    pub pending_queries: usize,
}

type Reply = oneshot::Sender<Result<QueryResult>>;

enum Command {
    Register {
        done: oneshot::Sender<Result<()>>,
    },
    Query {
        statement: String,
        reply: Reply,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// Handle to a running proxy
pub struct ClientProxy {
    process_id: String,
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<ProxyEvent>,
    status: watch::Receiver<ProxyStatus>,
    driver: AbortHandle,
}

impl ClientProxy {
    /// Start a proxy for `process_id` over `channel`.
    ///
    /// The store is only opened if the coordinator promotes this process.
    /// Without a liveness signal, crash detection falls back to heartbeats.
    pub fn start(
        process_id: impl Into<String>,
        channel: Channel,
        store: Arc<dyn Store>,
        liveness: Option<Arc<dyn LivenessSignal>>,
    ) -> Self {
        let process_id = process_id.into();
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(256);
        let (owner_events_tx, owner_events) = mpsc::unbounded_channel();

        let initial = ProxyStatus {
            process_id: process_id.clone(),
            registered: false,
            connected: true,
            active_process_id: None,
            role: OwnerState::Idle,
            pending_queries: 0,
        };
        let (status_tx, status) = watch::channel(initial);

        let owner = OwnerRole::spawn(process_id.clone(), store, channel.tx.clone(), owner_events_tx);

        let driver = Driver {
            process_id: process_id.clone(),
            channel,
            commands,
            owner,
            owner_events,
            replies: HashMap::new(),
            events: events.clone(),
            status: status_tx,
            active_process_id: None,
            registered: false,
            liveness,
            lease: None,
        };
        let handle = tokio::spawn(driver.run());

        tracing::debug!("Client proxy {} started", process_id);
        Self {
            process_id,
            commands: commands_tx,
            events,
            status,
            driver: handle.abort_handle(),
        }
    }

    /// Start a proxy with a freshly generated process id
    pub fn start_anonymous(
        channel: Channel,
        store: Arc<dyn Store>,
        liveness: Option<Arc<dyn LivenessSignal>>,
    ) -> Self {
        Self::start(Uuid::new_v4().to_string(), channel, store, liveness)
    }

    pub fn process_id(&self) -> &str {
        &self.process_id
    }

    /// Register with the coordinator and start holding the liveness lease
    pub async fn register_self(&self) -> Result<()> {
        let (done, registered) = oneshot::channel();
        self.commands
            .send(Command::Register { done })
            .map_err(|_| Error::ChannelClosed)?;
        registered.await.map_err(|_| Error::ChannelClosed)?
    }

    /// Run a statement on whichever process owns the database.
    ///
    /// Resolves exactly once: with the result, the owner's execution error,
    /// or a routing failure when no owner could be found in time.
    pub async fn query(&self, statement: impl Into<String>) -> Result<QueryResult> {
        let (reply, outcome) = oneshot::channel();
        self.commands
            .send(Command::Query {
                statement: statement.into(),
                reply,
            })
            .map_err(|_| Error::ChannelClosed)?;
        outcome.await.map_err(|_| Error::ChannelClosed)?
    }

    /// Subscribe to proxy events
    pub fn subscribe(&self) -> broadcast::Receiver<ProxyEvent> {
        self.events.subscribe()
    }

    /// Last announced owner
    pub fn active_process_id(&self) -> Option<String> {
        self.status.borrow().active_process_id.clone()
    }

    /// Whether the coordinator last named this process the owner
    pub fn is_owner(&self) -> bool {
        self.status.borrow().active_process_id.as_deref() == Some(self.process_id.as_str())
    }

    pub fn status(&self) -> ProxyStatus {
        self.status.borrow().clone()
    }

    /// Watch status changes
    pub fn watch_status(&self) -> watch::Receiver<ProxyStatus> {
        self.status.clone()
    }

    /// Orderly teardown: close the store, unregister, release the lease
    pub async fn shutdown(&self) {
        let (done, finished) = oneshot::channel();
        if self.commands.send(Command::Shutdown { done }).is_ok() {
            let _ = finished.await;
        }
    }

    /// Stop abruptly, as if the process had crashed
    pub fn abort(&self) {
        tracing::debug!("Client proxy {} aborted", self.process_id);
        self.driver.abort();
    }
}

/// Held liveness lease task
struct LeaseTask {
    release: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

struct Driver {
    process_id: String,
    channel: Channel,
    commands: mpsc::UnboundedReceiver<Command>,
    owner: OwnerRole,
    owner_events: mpsc::UnboundedReceiver<OwnerEvent>,
    replies: HashMap<String, Reply>,
    events: broadcast::Sender<ProxyEvent>,
    status: watch::Sender<ProxyStatus>,
    active_process_id: Option<String>,
    registered: bool,
    liveness: Option<Arc<dyn LivenessSignal>>,
    lease: Option<LeaseTask>,
}

impl Driver {
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown { done }) => {
                        self.teardown(true).await;
                        let _ = done.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        self.teardown(true).await;
                        break;
                    }
                },
                message = self.channel.rx.recv() => match message {
                    Some(message) => self.handle_message(message),
                    None => {
                        tracing::warn!("{} lost its coordinator connection", self.process_id);
                        self.teardown(false).await;
                        self.emit(ProxyEvent::Disconnected);
                        break;
                    }
                },
                Some(event) = self.owner_events.recv() => self.handle_owner_event(event),
            }
            self.publish_status(true);
        }
        self.publish_status(false);
        tracing::debug!("Client proxy {} stopped", self.process_id);
    }

    fn emit(&self, event: ProxyEvent) {
        let _ = self.events.send(event);
    }

    fn send(&self, message: ToCoordinator) -> bool {
        self.channel.tx.send(message).is_ok()
    }

    fn publish_status(&self, connected: bool) {
        self.status.send_replace(ProxyStatus {
            process_id: self.process_id.clone(),
            registered: self.registered,
            connected,
            active_process_id: self.active_process_id.clone(),
            role: self.owner.state(),
            pending_queries: self.replies.len(),
        });
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Register { done } => {
                let _ = done.send(self.register());
            }
            Command::Query { statement, reply } => {
                let request_id = Uuid::new_v4().to_string();
                let sent = self.send(ToCoordinator::Query {
                    process_id: self.process_id.clone(),
                    request_id: request_id.clone(),
                    statement,
                });
                if sent {
                    tracing::trace!("{} submitted {}", self.process_id, request_id);
                    self.replies.insert(request_id, reply);
                } else {
                    let _ = reply.send(Err(Error::ChannelClosed));
                }
            }
            Command::Shutdown { .. } => {}
        }
    }

    fn register(&mut self) -> Result<()> {
        if !self.send(ToCoordinator::Register {
            process_id: self.process_id.clone(),
        }) {
            return Err(Error::ChannelClosed);
        }
        self.registered = true;
        tracing::info!("{} registered with the coordinator", self.process_id);

        if self.lease.is_none() {
            if let Some(signal) = self.liveness.clone() {
                let (release, released) = oneshot::channel();
                let task = tokio::spawn(liveness::hold(
                    signal,
                    self.process_id.clone(),
                    self.channel.tx.clone(),
                    released,
                ));
                self.lease = Some(LeaseTask { release, task });
            }
        }
        Ok(())
    }

    fn handle_message(&mut self, message: FromCoordinator) {
        tracing::trace!("{} received {}", self.process_id, message.type_name());

        match message {
            FromCoordinator::HeartbeatProbe => {
                self.send(ToCoordinator::HeartbeatPong {
                    process_id: self.process_id.clone(),
                });
            }
            FromCoordinator::ActiveChanged { active_process_id } => {
                let is_self = active_process_id.as_deref() == Some(self.process_id.as_str());
                self.active_process_id = active_process_id.clone();
                if !is_self && self.owner.demote() {
                    tracing::info!("{} is no longer the database owner", self.process_id);
                    self.emit(ProxyEvent::Demoted);
                }
                self.emit(ProxyEvent::ActiveChanged(active_process_id));
            }
            FromCoordinator::Promote { process_id } => {
                if process_id != self.process_id {
                    tracing::debug!("Ignoring promotion addressed to {}", process_id);
                    return;
                }
                tracing::info!("{} promoted to database owner", self.process_id);
                self.active_process_id = Some(process_id);
                self.owner.promote();
                self.emit(ProxyEvent::Promoted);
            }
            FromCoordinator::ForwardQuery {
                request_id,
                origin_process_id,
                statement,
            } => {
                tracing::trace!("{} executing {} for {}", self.process_id, request_id, origin_process_id);
                if !self.owner.forward(request_id.clone(), statement) {
                    self.send(ToCoordinator::QueryError {
                        process_id: self.process_id.clone(),
                        request_id,
                        error: QueryFailure::new(FailureKind::OwnerNotReady, "not the database owner"),
                    });
                }
            }
            FromCoordinator::QueryResult { request_id, result } => {
                self.resolve(&request_id, Ok(result));
            }
            FromCoordinator::QueryError { request_id, error } => {
                self.resolve(&request_id, Err(Error::Query(error)));
            }
            FromCoordinator::OwnerReady { process_id } => {
                self.emit(ProxyEvent::OwnerReady(process_id));
            }
        }
    }

    fn resolve(&mut self, request_id: &str, outcome: Result<QueryResult>) {
        match self.replies.remove(request_id) {
            Some(reply) => {
                let _ = reply.send(outcome);
            }
            None => tracing::debug!("{} dropped outcome for unknown {}", self.process_id, request_id),
        }
    }

    fn handle_owner_event(&mut self, event: OwnerEvent) {
        let reason = match &event {
            OwnerEvent::OpenFailed { reason, .. } => Some(reason.clone()),
            OwnerEvent::Opened { .. } => None,
        };
        if self.owner.apply(event) == Some(OwnerState::Failed) {
            self.emit(ProxyEvent::InitFailed(reason.unwrap_or_default()));
        }
    }

    /// Close the store before unregistering so the next owner can take the
    /// file lock; release the lease last.
    async fn teardown(&mut self, unregister: bool) {
        let was_owner = self.owner.state() != OwnerState::Idle;
        self.owner.close().await;
        if was_owner {
            self.emit(ProxyEvent::Demoted);
        }

        for (_, reply) in self.replies.drain() {
            let _ = reply.send(Err(Error::ShuttingDown));
        }

        if unregister && self.registered {
            self.send(ToCoordinator::Unregister {
                process_id: self.process_id.clone(),
            });
        }
        self.registered = false;

        if let Some(lease) = self.lease.take() {
            let _ = lease.release.send(());
            let _ = lease.task.await;
        }
        tracing::info!("{} shut down", self.process_id);
    }
}
