//! Connection Registry
//!
//! Tracks registered processes, the leader state and in-flight queries.
//! Everything here is owned by the coordinator task and never shared.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::Endpoint;
use crate::protocol::FromCoordinator;

/// One registered process
#[derive(Debug)]
pub struct Connection {
    /// Process identifier
    pub process_id: String,
    /// Where messages for this process go
    pub endpoint: Endpoint,
    /// Last inbound message from this process
    pub last_seen: Instant,
    /// When the process registered
    pub registered_at: chrono::DateTime<chrono::Utc>,
    /// Whether the process reports holding its liveness lease
    pub liveness_held: bool,
}

impl Connection {
    pub fn new(process_id: String, endpoint: Endpoint) -> Self {
        Self {
            process_id,
            endpoint,
            last_seen: Instant::now(),
            registered_at: chrono::Utc::now(),
            liveness_held: false,
        }
    }

    /// Update last observed activity
    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    /// Time since the last inbound message
    pub fn silent_for(&self) -> Duration {
        self.last_seen.elapsed()
    }

    /// Send a message; false if the process's channel is gone
    pub fn send(&self, message: FromCoordinator) -> bool {
        let type_name = message.type_name();
        match self.endpoint.send(message) {
            Ok(()) => true,
            Err(_) => {
                tracing::debug!("Dropping {} for closed process {}", type_name, self.process_id);
                false
            }
        }
    }
}

/// Who owns the database
#[derive(Debug, Default)]
pub struct LeaderState {
    /// Current owner
    pub active_process_id: Option<String>,
    /// The current owner has opened the store
    pub owner_ready: bool,
    /// Some owner has been ready at least once
    pub ever_ready: bool,
    /// The current owner reported that it could not open the store
    pub init_failed: bool,
}

impl LeaderState {
    pub fn is_active(&self, process_id: &str) -> bool {
        self.active_process_id.as_deref() == Some(process_id)
    }

    /// Change the owner; readiness never carries over
    pub fn set_active(&mut self, process_id: Option<String>) {
        self.active_process_id = process_id;
        self.owner_ready = false;
        self.init_failed = false;
    }

    /// Mark the owner ready; ignored unless `process_id` is the owner
    pub fn mark_ready(&mut self, process_id: &str) -> bool {
        if !self.is_active(process_id) {
            return false;
        }
        self.owner_ready = true;
        self.ever_ready = true;
        self.init_failed = false;
        true
    }

    /// Record a failed open by the owner; ignored for anyone else
    pub fn mark_failed(&mut self, process_id: &str) -> bool {
        if !self.is_active(process_id) {
            return false;
        }
        self.owner_ready = false;
        self.init_failed = true;
        true
    }
}

/// One in-flight query
#[derive(Debug)]
pub struct PendingQuery {
    pub request_id: String,
    pub origin_process_id: String,
    pub statement: String,
    /// Routing attempts consumed
    pub attempts: u32,
    /// Delay of the currently armed retry timer
    pub next_delay: Duration,
    pub enqueued_at: Instant,
    /// Owner the statement was last forwarded to
    pub forwarded_to: Option<String>,
    /// Channel the query arrived on; cleared when its origin disconnects
    pub reply_to: Option<Endpoint>,
    /// Distinguishes this entry's timers from those of a reused request id
    pub seq: u64,
}

impl PendingQuery {
    pub fn new(
        request_id: String,
        origin_process_id: String,
        statement: String,
        reply_to: Endpoint,
        base_delay: Duration,
        seq: u64,
    ) -> Self {
        Self {
            request_id,
            origin_process_id,
            statement,
            attempts: 0,
            next_delay: base_delay,
            enqueued_at: Instant::now(),
            forwarded_to: None,
            reply_to: Some(reply_to),
            seq,
        }
    }

    pub fn forward_message(&self) -> FromCoordinator {
        FromCoordinator::ForwardQuery {
            request_id: self.request_id.clone(),
            origin_process_id: self.origin_process_id.clone(),
            statement: self.statement.clone(),
        }
    }
}

/// Registered processes, iterated in process-id order
#[derive(Debug, Default)]
pub struct Registry {
    connections: BTreeMap<String, Connection>,
}

impl Registry {
    /// Add a process or refresh its channel; true if it was not registered
    pub fn insert(&mut self, process_id: String, endpoint: Endpoint) -> bool {
        match self.connections.get_mut(&process_id) {
            Some(existing) => {
                existing.endpoint = endpoint;
                existing.touch();
                false
            }
            None => {
                self.connections
                    .insert(process_id.clone(), Connection::new(process_id, endpoint));
                true
            }
        }
    }

    pub fn remove(&mut self, process_id: &str) -> Option<Connection> {
        self.connections.remove(process_id)
    }

    /// Whether `process_id` is registered over `endpoint`
    pub fn is_registered_on(&self, process_id: &str, endpoint: &Endpoint) -> bool {
        self.connections
            .get(process_id)
            .map_or(false, |conn| conn.endpoint.same_channel(endpoint))
    }

    pub fn get(&self, process_id: &str) -> Option<&Connection> {
        self.connections.get(process_id)
    }

    pub fn get_mut(&mut self, process_id: &str) -> Option<&mut Connection> {
        self.connections.get_mut(process_id)
    }

    pub fn contains(&self, process_id: &str) -> bool {
        self.connections.contains_key(process_id)
    }

    /// Record activity from a process (no-op if unknown)
    pub fn touch(&mut self, process_id: &str) {
        if let Some(conn) = self.connections.get_mut(process_id) {
            conn.touch();
        }
    }

    /// First connected process other than `exclude`
    pub fn first_except(&self, exclude: Option<&str>) -> Option<String> {
        self.connections
            .keys()
            .find(|id| Some(id.as_str()) != exclude)
            .cloned()
    }

    /// Send a message to every registered process
    pub fn broadcast(&self, message: &FromCoordinator) {
        for conn in self.connections.values() {
            conn.send(message.clone());
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

/// Point-in-time view of the coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorSnapshot {
    pub active_process_id: Option<String>,
    pub owner_ready: bool,
    pub promoting: Option<String>,
    pub pending_queries: usize,
    pub connections: Vec<ConnectionSummary>,
}

/// Registered process as shown in a snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSummary {
    pub process_id: String,
    pub registered_at: chrono::DateTime<chrono::Utc>,
    pub silent_for_ms: u64,
    pub liveness_held: bool,
    pub is_active: bool,
}
