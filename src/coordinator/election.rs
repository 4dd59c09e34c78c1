//! Owner Election
//!
//! Chooses which registered process owns the database, applies the
//! promotion grace delay and detects owner failure through heartbeats and
//! liveness signals.

use std::time::Duration;

use super::{Coordinator, Event};
use crate::protocol::FromCoordinator;

/// Candidate waiting out the grace delay
#[derive(Debug, Clone)]
pub(crate) struct PendingPromotion {
    pub process_id: String,
    pub epoch: u64,
}

impl Coordinator {
    /// The active process, if it is still registered
    pub(super) fn usable_owner(&self) -> Option<String> {
        self.leader
            .active_process_id
            .as_ref()
            .filter(|id| self.registry.contains(id))
            .cloned()
    }

    /// Change the owner and tell everyone
    pub(super) fn set_active(&mut self, process_id: Option<String>) {
        if self.leader.active_process_id == process_id {
            return;
        }
        self.leader.set_active(process_id.clone());
        self.registry.broadcast(&FromCoordinator::ActiveChanged {
            active_process_id: process_id,
        });
    }

    /// The owner is gone (or going); clear it and look for a successor
    pub(super) fn lose_active(&mut self, process_id: &str, cause: &str) {
        if !self.leader.is_active(process_id) {
            return;
        }
        tracing::warn!("Active process {} lost ({})", process_id, cause);
        self.set_active(None);
        self.elect(Some(process_id));
    }

    /// Pick the first registered process other than `exclude` and start
    /// promoting it, unless an owner or a promotion already exists.
    pub(super) fn elect(&mut self, exclude: Option<&str>) {
        if self.promotion.is_some() || self.usable_owner().is_some() {
            return;
        }

        match self.registry.first_except(exclude) {
            Some(candidate) => self.begin_promotion(candidate, self.config.promotion_grace()),
            None => {
                tracing::info!("No process available to own the database; queries will wait");
            }
        }
    }

    /// Election triggered by a query that could not be forwarded: prefer
    /// the origin of the query when it is registered.
    pub(super) fn elect_for(&mut self, origin_process_id: &str) {
        if let Some(active) = self.leader.active_process_id.clone() {
            if !self.registry.contains(&active) {
                tracing::warn!("Active process {} lost (connection missing)", active);
                self.set_active(None);
            }
        }

        if self.promotion.is_some() || self.usable_owner().is_some() {
            return;
        }

        if self.registry.contains(origin_process_id) {
            self.begin_promotion(origin_process_id.to_string(), self.config.promotion_grace());
        } else {
            self.elect(None);
        }
    }

    /// Schedule promotion of `candidate` after `delay` (immediately if zero).
    /// A newer promotion supersedes an older one still waiting.
    pub(super) fn begin_promotion(&mut self, candidate: String, delay: Duration) {
        self.next_epoch += 1;
        let epoch = self.next_epoch;

        tracing::info!("Promoting {} in {:?} (epoch {})", candidate, delay, epoch);
        self.promotion = Some(PendingPromotion {
            process_id: candidate,
            epoch,
        });

        if delay.is_zero() {
            self.complete_promotion(epoch);
        } else {
            self.schedule(delay, Event::PromotionDue { epoch });
        }
    }

    /// Grace delay elapsed
    pub(super) fn complete_promotion(&mut self, epoch: u64) {
        let candidate = match &self.promotion {
            Some(p) if p.epoch == epoch => p.process_id.clone(),
            _ => return,
        };
        self.promotion = None;

        let Some(conn) = self.registry.get_mut(&candidate) else {
            tracing::info!("Candidate {} left during the grace delay", candidate);
            self.elect(Some(&candidate));
            return;
        };
        // A fresh owner gets a full heartbeat window
        conn.touch();

        self.set_active(Some(candidate.clone()));
        if let Some(conn) = self.registry.get(&candidate) {
            conn.send(FromCoordinator::Promote {
                process_id: candidate.clone(),
            });
        }
        tracing::info!("Process {} is now the database owner", candidate);

        self.dispatch_waiting();
    }

    /// Cancel a waiting promotion of `process_id`, if any
    pub(super) fn cancel_promotion_of(&mut self, process_id: &str) -> bool {
        match &self.promotion {
            Some(p) if p.process_id == process_id => {
                tracing::debug!("Cancelling promotion of {}", process_id);
                self.promotion = None;
                true
            }
            _ => false,
        }
    }

    /// A process acquired its liveness lease.
    ///
    /// The lease promotes its holder immediately, without the grace delay,
    /// but only while no usable owner exists. A healthy owner is never
    /// replaced because another process took its lease; the lease only
    /// marks the holder as a safe candidate.
    pub(super) fn liveness_acquired(&mut self, process_id: &str) {
        let Some(conn) = self.registry.get_mut(process_id) else {
            tracing::debug!("Liveness from unregistered process {} ignored", process_id);
            return;
        };
        conn.liveness_held = true;

        if self.leader.is_active(process_id) || self.usable_owner().is_some() {
            return;
        }

        // Holding the lease is evidence the process intends to stay; skip the grace delay
        tracing::info!("Process {} holds its liveness lease; promoting immediately", process_id);
        self.begin_promotion(process_id.to_string(), Duration::ZERO);
    }

    /// A process released its liveness lease (usually right before teardown)
    pub(super) fn liveness_released(&mut self, process_id: &str) {
        if let Some(conn) = self.registry.get_mut(process_id) {
            conn.liveness_held = false;
        }

        if self.leader.is_active(process_id) {
            self.lose_active(process_id, "liveness released");
        } else if self.cancel_promotion_of(process_id) {
            self.elect(Some(process_id));
        }
    }

    /// Probe the owner and fail it if it has been silent too long
    pub(super) fn heartbeat_tick(&mut self) {
        let Some(active) = self.leader.active_process_id.clone() else {
            if self.promotion.is_none() && !self.registry.is_empty() {
                self.elect(None);
            }
            return;
        };

        let silent_for = match self.registry.get(&active) {
            Some(conn) => conn.silent_for(),
            None => {
                self.lose_active(&active, "connection missing");
                return;
            }
        };

        if silent_for > self.config.heartbeat_timeout() {
            // It may only be frozen; if it resumes it must stop acting as
            // owner and release the store. Its own queries keep their reply
            // channel.
            if let Some(conn) = self.registry.remove(&active) {
                conn.send(FromCoordinator::ActiveChanged {
                    active_process_id: None,
                });
            }
            self.lose_active(&active, &format!("silent for {:?}", silent_for));
            return;
        }

        if let Some(conn) = self.registry.get(&active) {
            conn.send(FromCoordinator::HeartbeatProbe);
        }
    }
}
