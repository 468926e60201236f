//! Tether Connect: the resilient etcd v3 client runtime.
//!
//! # Overview
//!
//! - **Connection pool**: every host gets an independent circuit breaker;
//!   calls fail over across hosts in shuffled order under a global retry
//!   policy, with auth-token injection and error reclassification
//! - **Watch manager**: multiplexes logical watchers over one duplex
//!   stream, with serialized creation and revision-accurate replay across
//!   reconnects
//! - **Lease manager**: grant-once semantics and a self-healing keepalive
//!   loop with loss detection
//! - **STM**: optimistic multi-key transactions with four isolation levels
//!   and bounded conflict retry
//! - **Election**: leader campaigns and observation via create-revision
//!   ordering
//!
//! Fault-handling policies come from [`tether_core_resilience`]; the wire
//! model comes from [`tether_proto`]. The transport is injectable — tests
//! run against scripted connectors, production speaks gRPC over tonic.
//!
//! # Example
//!
//! ```no_run
//! use tether_connect::{Client, ClientOptions};
//! use tether_proto::{methods, PutRequest, PutResponse, Service};
//!
//! # async fn example() -> Result<(), tether_connect::ClientError> {
//! let client = Client::new(ClientOptions::with_hosts(["127.0.0.1:2379"]))?;
//! let _: PutResponse = client
//!     .exec(
//!         Service::Kv,
//!         methods::PUT,
//!         &PutRequest {
//!             key: "greeting".into(),
//!             value: "hello".into(),
//!             ..Default::default()
//!         },
//!     )
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod client;
pub mod election;
pub mod errors;
pub mod host;
pub mod lease;
pub mod options;
pub mod pool;
pub mod range;
pub mod shuffle;
pub mod stm;
pub mod transport;
pub mod watch;

pub use client::Client;
pub use election::{Campaign, Election, ElectionObserver};
pub use errors::{cast_error_message, cast_status, ClientError};
pub use host::Host;
pub use lease::Lease;
pub use options::{AuthOptions, ClientOptions, FaultHandling, HostOptions};
pub use pool::{Connection, ConnectionPool};
pub use range::Range;
pub use shuffle::{InOrderShuffle, RandomShuffle, ShuffleSource};
pub use stm::{Isolation, SoftwareTransaction, StmOptions, Txn};
pub use transport::{
    CallContext, ChannelDuplex, Connector, DuplexStream, FrameSink, FrameSource, GrpcConnector,
    ServiceClient,
};
pub use watch::{WatchEvent, WatchManager, WatchSpec, Watcher};
