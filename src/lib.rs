//! Tether: a resilient etcd v3 client runtime.
//!
//! The workspace splits into three layers, re-exported here:
//!
//! - [`resilience`]: a general-purpose fault-handling policy engine (circuit
//!   breakers, retry with composable backoff, bulkhead, timeout, fallback)
//! - [`proto`]: the etcd v3 wire message model (an opaque codec boundary)
//! - [`client`][tether_connect]: the connection pool, watch multiplexer,
//!   lease manager, software transactions and elections
//!
//! # Example
//!
//! ```no_run
//! use tether::{Client, ClientOptions, WatchSpec};
//!
//! # async fn example() -> Result<(), tether::ClientError> {
//! let client = Client::new(ClientOptions::with_hosts([
//!     "10.0.0.1:2379",
//!     "10.0.0.2:2379",
//! ]))?;
//!
//! let mut watcher = client.watch(WatchSpec::prefix("config/")).await?;
//! while let Some(event) = watcher.next().await {
//!     println!("{event:?}");
//! }
//! # Ok(())
//! # }
//! ```

pub use tether_connect::{
    AuthOptions, Campaign, Client, ClientError, ClientOptions, Connection, ConnectionPool,
    Election, ElectionObserver, FaultHandling, Host, HostOptions, Isolation, Lease, Range,
    SoftwareTransaction, StmOptions, Txn, WatchEvent, WatchManager, WatchSpec, Watcher,
};

pub use tether_core_resilience as resilience;
pub use tether_proto as proto;

/// Prelude for the common client surface.
pub mod prelude {
    pub use tether_connect::{
        Client, ClientError, ClientOptions, Isolation, Range, StmOptions, WatchEvent, WatchSpec,
    };
    pub use tether_core_resilience::prelude::*;
}
