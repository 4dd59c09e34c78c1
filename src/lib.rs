//! Leasehold - Single-Writer Database Coordination
//!
//! Lets several cooperating processes share one embedded database that only
//! one of them may hold open at a time. A central coordinator elects the
//! owning process, forwards every query to it, relays results back to the
//! caller, and moves ownership elsewhere when the owner goes away.
//!
//! # Architecture
//!
//! Each process runs a client proxy connected to the coordinator. Processes
//! submit statements through their proxy without knowing who owns the
//! database; the coordinator routes them to the owner's proxy, which runs
//! them against its store. Owner failure is detected through heartbeats and,
//! faster, through each process's liveness lease.
//!
//! # Features
//!
//! - At most one owner at any time, with a grace delay before promotion
//! - Query retries with exponential backoff while no owner is available
//! - Failover on disconnect, heartbeat silence or liveness release
//! - In-process channels or framed TCP between processes and coordinator
//! - SQLite store opened lazily by the owner, with exclusive locking
//! - HTTP API for status and queries

pub mod api;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod liveness;
pub mod network;
pub mod protocol;
pub mod proxy;
pub mod store;

pub use config::LeaseholdConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::LeaseholdConfig;
    pub use crate::coordinator::{Coordinator, CoordinatorHandle, CoordinatorSnapshot};
    pub use crate::error::{Error, Result};
    pub use crate::liveness::{FileLeases, LivenessSignal, LocalLeases};
    pub use crate::network::{connect, Channel, NetworkServer};
    pub use crate::protocol::{FailureKind, QueryFailure, QueryResult, Value};
    pub use crate::proxy::{ClientProxy, ProxyEvent};
    pub use crate::store::{SqliteStore, Store};
}
