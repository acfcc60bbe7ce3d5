//! High-availability control plane for PostgreSQL clusters.
//!
//! The control plane watches streaming-replication and shared-storage
//! clusters, fails over dead primaries, repairs failed nodes and performs
//! planned switchovers. It talks to per-host agents over an authenticated
//! framed RPC protocol.

pub mod admin;
pub mod agent;
pub mod config;
pub mod error;
pub mod ha;
pub mod meta;
pub mod observability;
pub mod protocol;
pub mod rpc;
pub mod shutdown;
pub mod task;

pub use error::{PghaError, Result};
pub use ha::{HaContext, HaSettings};
pub use rpc::{RpcClient, RpcServer};
