//! charmroll-client — the cluster controller capability.
//!
//! [`ClusterClient`] is the only way the orchestration crates touch a
//! cluster. Two implementations ship here:
//!
//! - [`JujuCli`] drives the `juju` command-line tool against a live
//!   controller, either through the local client configuration or a
//!   remote endpoint with explicit credentials.
//! - [`MemoryCluster`] is a scriptable in-memory cluster used by tests
//!   and dry rehearsals.

pub mod client;
pub mod connect;
pub mod error;
pub mod juju;
pub mod memory;

pub use client::{ActionHandle, ClusterClient, ConfigMap, DIAGNOSTIC_TIMEOUT};
pub use connect::ConnectOptions;
pub use error::{ClientError, ClientResult};
pub use juju::JujuCli;
pub use memory::{Call, Fault, MemoryCluster};
