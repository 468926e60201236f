//! Top-level client wiring the pool, watch manager and higher layers
//! together.

use crate::election::Election;
use crate::errors::ClientError;
use crate::lease::Lease;
use crate::options::ClientOptions;
use crate::pool::ConnectionPool;
use crate::stm::{SoftwareTransaction, StmOptions};
use crate::watch::{WatchManager, WatchSpec, Watcher};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tether_proto::Service;

/// A connected client. Connections are lazy: construction never performs
/// I/O, and failures surface on the first call.
pub struct Client {
    pool: Arc<ConnectionPool>,
    watches: Arc<WatchManager>,
}

impl Client {
    pub fn new(options: ClientOptions) -> Result<Self, ClientError> {
        let pool = Arc::new(ConnectionPool::new(options)?);
        let watches = Arc::new(WatchManager::new(pool.clone()));
        Ok(Self { pool, watches })
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Executes a unary call with pool-level fault handling.
    pub async fn exec<Req, Res>(
        &self,
        service: Service,
        method: &str,
        request: &Req,
    ) -> Result<Res, ClientError>
    where
        Req: Serialize + ?Sized,
        Res: DeserializeOwned,
    {
        self.pool.exec_typed(service, method, request).await
    }

    /// Subscribes to mutations; see [`WatchSpec`] for selectors.
    pub async fn watch(&self, spec: WatchSpec) -> Result<Watcher, ClientError> {
        self.watches.watch(spec).await
    }

    /// Grants a lease with the given TTL and keeps it alive in the
    /// background.
    pub fn lease(&self, ttl: Duration) -> Result<Lease, ClientError> {
        Lease::new(self.pool.clone(), ttl)
    }

    /// A software-transaction runner with the given options.
    pub fn stm(&self, options: StmOptions) -> SoftwareTransaction {
        SoftwareTransaction::new(self.pool.clone(), options)
    }

    /// A named election with the given candidate lease TTL.
    pub fn election(&self, name: &str, ttl: Duration) -> Election {
        Election::new(self.pool.clone(), self.watches.clone(), name, ttl)
    }

    /// Tears down all connections; subsequent calls fail with
    /// [`ClientError::ClientClosed`].
    pub fn close(&self) {
        self.pool.close();
    }
}
