//! Client configuration.

use crate::errors::ClientError;
use crate::shuffle::ShuffleSource;
use crate::transport::Connector;
use std::sync::Arc;
use std::time::Duration;
use tether_core_resilience::{CircuitBreakerPolicy, RetryPolicy};

/// Username/password credentials; exchanged for a cached token on first use.
#[derive(Debug, Clone)]
pub struct AuthOptions {
    pub username: String,
    pub password: String,
}

/// Per-host channel settings.
#[derive(Debug, Clone, Default)]
pub struct HostOptions {
    /// Deadline for establishing the underlying channel.
    pub connect_timeout: Option<Duration>,
    /// Deadline applied to each unary request.
    pub request_timeout: Option<Duration>,
}

/// Overrides for the pool's fault handling. `None` fields use the defaults:
/// up to 3 retries on recoverable errors globally, and a per-host circuit
/// breaker opening after 3 consecutive recoverable failures with a 5 second
/// half-open interval.
#[derive(Default)]
pub struct FaultHandling {
    pub global: Option<RetryPolicy<ClientError>>,
    #[allow(clippy::type_complexity)]
    pub host: Option<Arc<dyn Fn(&str) -> CircuitBreakerPolicy<ClientError> + Send + Sync>>,
}

/// Options for constructing a client/pool.
pub struct ClientOptions {
    /// Host addresses, e.g. `"127.0.0.1:2379"`.
    pub hosts: Vec<String>,
    pub auth: Option<AuthOptions>,
    pub host_options: HostOptions,
    pub fault_handling: FaultHandling,
    /// Transport factory; `None` uses the gRPC connector.
    pub connector: Option<Arc<dyn Connector>>,
    /// Host iteration order source; `None` randomizes (production). Tests
    /// inject [`crate::shuffle::InOrderShuffle`] for determinism.
    pub shuffle: Option<Arc<dyn ShuffleSource>>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            hosts: vec!["127.0.0.1:2379".to_string()],
            auth: None,
            host_options: HostOptions::default(),
            fault_handling: FaultHandling::default(),
            connector: None,
            shuffle: None,
        }
    }
}

impl ClientOptions {
    pub fn with_hosts(hosts: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            hosts: hosts.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }
}
