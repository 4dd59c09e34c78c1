//! Query Forwarding
//!
//! Routes pending queries to the owner, retries with exponential backoff
//! while no owner can take them, and relays outcomes to their origin.

use std::time::Duration;

use super::registry::PendingQuery;
use super::{Coordinator, Endpoint, Event};
use crate::protocol::{FailureKind, FromCoordinator, QueryFailure, QueryResult};

/// Where a pending query can go right now
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum Route {
    /// Send it to this owner
    Forward(String),
    /// An owner exists or is being promoted, but cannot take queries yet
    Wait,
    /// Nobody owns the database and nobody is being promoted
    Elect,
}

/// `base * 2^(attempts - 1)`
pub(super) fn backoff_delay(base: Duration, attempts: u32) -> Duration {
    let exponent = attempts.saturating_sub(1).min(30);
    base.saturating_mul(1u32 << exponent)
}

impl Coordinator {
    pub(super) fn route(&self) -> Route {
        match self.usable_owner() {
            // Before any owner has ever been ready, forward anyway and let
            // the owner open the store lazily. An owner whose open failed
            // answers forwards with the cause.
            Some(owner)
                if self.leader.owner_ready || self.leader.init_failed || !self.leader.ever_ready =>
            {
                Route::Forward(owner)
            }
            Some(_) => Route::Wait,
            None if self.promotion.is_some() => Route::Wait,
            None => Route::Elect,
        }
    }

    /// A process submitted a query
    pub(super) fn submit_query(
        &mut self,
        origin_process_id: String,
        request_id: String,
        statement: String,
        reply_to: Endpoint,
    ) {
        if self.pending.contains_key(&request_id) {
            tracing::debug!("Duplicate query {} ignored", request_id);
            return;
        }

        self.next_seq += 1;
        let pending = PendingQuery::new(
            request_id.clone(),
            origin_process_id,
            statement,
            reply_to,
            self.config.retry_base_delay(),
            self.next_seq,
        );
        tracing::trace!("Query {} from {}", request_id, pending.origin_process_id);
        self.pending.insert(request_id.clone(), pending);

        self.attempt(&request_id);
    }

    /// One routing attempt; consumes an attempt and arms the retry timer
    pub(super) fn attempt(&mut self, request_id: &str) {
        let route = self.route();
        let max_retries = self.config.max_retries;

        let Some(pending) = self.pending.get_mut(request_id) else {
            return;
        };
        pending.attempts += 1;

        if pending.attempts > max_retries {
            if let Some(pending) = self.pending.remove(request_id) {
                let error = QueryFailure::new(
                    FailureKind::RetriesExhausted,
                    format!("no database owner after {} attempts", max_retries),
                );
                self.give_up(pending, error);
            }
            return;
        }

        let attempts = pending.attempts;
        let origin = pending.origin_process_id.clone();

        match route {
            Route::Forward(owner) => {
                let message = pending.forward_message();
                pending.forwarded_to = Some(owner.clone());
                if let Some(conn) = self.registry.get(&owner) {
                    conn.send(message);
                }
                tracing::debug!("Forwarded {} to {} (attempt {})", request_id, owner, attempts);
            }
            Route::Wait => {
                pending.forwarded_to = None;
                tracing::debug!("Query {} waiting for owner (attempt {})", request_id, attempts);
            }
            Route::Elect => {
                pending.forwarded_to = None;
                tracing::debug!("Query {} has no owner; electing (attempt {})", request_id, attempts);
                self.elect_for(&origin);
            }
        }

        self.arm_retry(request_id, backoff_delay(self.config.retry_base_delay(), attempts));
    }

    fn arm_retry(&mut self, request_id: &str, delay: Duration) {
        let Some(pending) = self.pending.get_mut(request_id) else {
            return;
        };
        pending.next_delay = delay;
        let event = Event::RetryDue {
            request_id: request_id.to_string(),
            seq: pending.seq,
        };
        self.schedule(delay, event);
    }

    /// Retry timer fired
    pub(super) fn retry_due(&mut self, request_id: &str, seq: u64) {
        let forwarded_to = match self.pending.get(request_id) {
            Some(p) if p.seq == seq => p.forwarded_to.clone(),
            _ => return,
        };

        if forwarded_to.is_some() && forwarded_to == self.usable_owner() {
            self.await_owner(request_id);
            return;
        }

        self.attempt(request_id);
    }

    /// The statement is still with a live owner. It is never sent again,
    /// but the wait consumes an attempt so a stuck owner cannot hold the
    /// caller forever.
    fn await_owner(&mut self, request_id: &str) {
        let max_retries = self.config.max_retries;
        let Some(pending) = self.pending.get_mut(request_id) else {
            return;
        };
        pending.attempts += 1;

        if pending.attempts > max_retries {
            if let Some(pending) = self.pending.remove(request_id) {
                let owner = pending.forwarded_to.clone().unwrap_or_default();
                let error = QueryFailure::new(
                    FailureKind::OwnerUnavailable,
                    format!("owner {} did not answer within {} attempts", owner, max_retries),
                );
                self.give_up(pending, error);
            }
            return;
        }

        let attempts = pending.attempts;
        tracing::debug!("Query {} still running on owner (attempt {})", request_id, attempts);
        self.arm_retry(request_id, backoff_delay(self.config.retry_base_delay(), attempts));
    }

    /// Forward every query that is waiting for an owner, if one can take them
    pub(super) fn dispatch_waiting(&mut self) {
        let Route::Forward(owner) = self.route() else {
            return;
        };
        let Some(conn) = self.registry.get(&owner) else {
            return;
        };

        for pending in self.pending.values_mut() {
            if pending.forwarded_to.is_none() {
                conn.send(pending.forward_message());
                pending.forwarded_to = Some(owner.clone());
                tracing::debug!("Dispatched waiting query {} to {}", pending.request_id, owner);
            }
        }
    }

    /// The owner finished opening the store
    pub(super) fn owner_ready(&mut self, process_id: &str) {
        if !self.leader.mark_ready(process_id) {
            tracing::debug!("Ready announcement from non-owner {} ignored", process_id);
            return;
        }

        tracing::info!("Owner {} has opened the database", process_id);
        self.registry.broadcast(&FromCoordinator::OwnerReady {
            process_id: process_id.to_string(),
        });
        self.dispatch_waiting();
    }

    /// The owner could not open the store: everything forwarded to it, and
    /// everything waiting for it, fails with the cause
    pub(super) fn owner_init_failed(&mut self, process_id: &str, reason: String) {
        tracing::warn!("Owner {} failed to open the database: {}", process_id, reason);
        let is_owner = self.leader.mark_failed(process_id);

        let failed: Vec<String> = self
            .pending
            .values()
            .filter(|p| match p.forwarded_to.as_deref() {
                Some(owner) => owner == process_id,
                None => is_owner,
            })
            .map(|p| p.request_id.clone())
            .collect();

        for request_id in failed {
            if let Some(pending) = self.pending.remove(&request_id) {
                let error = QueryFailure::new(FailureKind::Initialization, reason.clone());
                self.relay(&pending, FromCoordinator::QueryError { request_id, error });
            }
        }
    }

    /// Owner reported a result
    pub(super) fn report_result(&mut self, from: &str, request_id: String, result: QueryResult) {
        match self.pending.remove(&request_id) {
            Some(pending) => {
                tracing::trace!("Result for {} from {}", request_id, from);
                self.relay(&pending, FromCoordinator::QueryResult { request_id, result });
            }
            None => tracing::debug!("Late or duplicate result for {} from {} dropped", request_id, from),
        }
    }

    /// Owner reported a failure
    pub(super) fn report_error(&mut self, from: &str, request_id: String, error: QueryFailure) {
        if error.kind == FailureKind::OwnerNotReady {
            // Not executed: the retry timer will route it again
            if let Some(pending) = self.pending.get_mut(&request_id) {
                if pending.forwarded_to.as_deref() == Some(from) {
                    pending.forwarded_to = None;
                }
            }
            tracing::debug!("{} was not ready for {}; will reroute", from, request_id);
            return;
        }

        match self.pending.remove(&request_id) {
            Some(pending) => {
                tracing::debug!("Query {} failed on {}: {}", request_id, from, error);
                self.relay(&pending, FromCoordinator::QueryError { request_id, error });
            }
            None => tracing::debug!("Late or duplicate error for {} from {} dropped", request_id, from),
        }
    }

    /// Terminal routing failure; the query is already out of the table
    fn give_up(&self, pending: PendingQuery, error: QueryFailure) {
        tracing::warn!(
            "Query {} from {} given up after {:?}: {}",
            pending.request_id,
            pending.origin_process_id,
            pending.enqueued_at.elapsed(),
            error
        );
        self.relay(
            &pending,
            FromCoordinator::QueryError {
                request_id: pending.request_id.clone(),
                error,
            },
        );
    }

    /// Deliver an outcome to the origin of a query
    fn relay(&self, pending: &PendingQuery, message: FromCoordinator) {
        if let Some(conn) = self.registry.get(&pending.origin_process_id) {
            conn.send(message);
        } else if let Some(reply_to) = &pending.reply_to {
            let _ = reply_to.send(message);
        } else {
            tracing::debug!(
                "Origin {} of {} is gone; outcome dropped",
                pending.origin_process_id,
                pending.request_id
            );
        }
    }

    /// A process left: its queries keep running but their outcome is dropped
    pub(super) fn orphan_queries_of(&mut self, process_id: &str) {
        for pending in self.pending.values_mut() {
            if pending.origin_process_id == process_id {
                pending.reply_to = None;
            }
        }
    }
}
