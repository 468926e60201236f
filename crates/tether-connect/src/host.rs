//! A single etcd server endpoint and its independently owned circuit breaker.

use crate::errors::ClientError;
use crate::options::HostOptions;
use crate::transport::{Connector, ServiceClient};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tether_core_resilience::CircuitBreakerPolicy;
use tether_proto::Service;
use tracing::debug;

/// One instance of the etcd server, holding lazily-created clients per
/// service. Owned exclusively by the pool; closing the pool closes every
/// host.
pub struct Host {
    address: String,
    options: HostOptions,
    connector: Arc<dyn Connector>,
    fault_handling: CircuitBreakerPolicy<ClientError>,
    // The cache is replaced wholesale on recoverable errors, never mutated
    // in place, so concurrent readers keep whatever client they resolved.
    clients: Mutex<HashMap<Service, Arc<dyn ServiceClient>>>,
    closed: AtomicBool,
}

impl Host {
    pub fn new(
        address: String,
        options: HostOptions,
        connector: Arc<dyn Connector>,
        fault_handling: CircuitBreakerPolicy<ClientError>,
    ) -> Self {
        Self {
            address,
            options,
            connector,
            fault_handling,
            clients: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// This host's circuit breaker.
    pub fn fault_handling(&self) -> &CircuitBreakerPolicy<ClientError> {
        &self.fault_handling
    }

    /// Returns the client for the given service, creating and caching it on
    /// first use.
    pub async fn service_client(
        &self,
        service: Service,
    ) -> Result<Arc<dyn ServiceClient>, ClientError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ClientError::ClientClosed(service.name().to_string()));
        }
        if let Some(client) = self.clients.lock().get(&service) {
            return Ok(client.clone());
        }

        let client = self
            .connector
            .connect(&self.address, service, &self.options)
            .await?;
        self.clients.lock().insert(service, client.clone());
        Ok(client)
    }

    /// Drops every cached client, forcing fresh channels on subsequent
    /// calls.
    pub fn reset_all_services(&self) {
        debug!(address = %self.address, "resetting cached service clients");
        self.clients.lock().clear();
    }

    /// Frees resources associated with the host; subsequent calls fail with
    /// [`ClientError::ClientClosed`].
    pub fn close(&self) {
        self.reset_all_services();
        self.closed.store(true, Ordering::SeqCst);
    }
}
