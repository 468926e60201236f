//! Connection pool: host failover, per-host circuit breakers, global retry,
//! auth-token injection and error reclassification.

use crate::auth::Authenticator;
use crate::errors::ClientError;
use crate::host::Host;
use crate::options::{ClientOptions, HostOptions};
use crate::shuffle::{RandomShuffle, ShuffleSource, ShuffledCycle};
use crate::transport::{CallContext, DuplexStream, GrpcConnector, ServiceClient};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tether_core_resilience::{
    CancellationToken, CircuitBreakerPolicy, ConsecutiveBreaker, Policy, RetryPolicy,
};
use tether_proto::Service;
use tracing::debug;

/// Bound on re-authentication replays within one `exec` call when the server
/// reports an invalid auth token. Deliberately independent of the retry
/// policy's attempt budget.
const AUTH_REPLAYS: u32 = 1;

fn default_global_policy() -> RetryPolicy<ClientError> {
    Policy::handle_when(ClientError::is_recoverable)
        .retry()
        .attempts(3)
}

fn default_host_breaker() -> CircuitBreakerPolicy<ClientError> {
    Policy::handle_when(ClientError::is_recoverable)
        .circuit_breaker(Duration::from_secs(5), ConsecutiveBreaker::new(3))
}

/// A resolved (host, client, call options) triple handed to callers of
/// [`ConnectionPool::with_connection`].
#[derive(Clone)]
pub struct Connection {
    pub host: Arc<Host>,
    pub client: Arc<dyn ServiceClient>,
    pub context: CallContext,
}

impl Connection {
    pub async fn exec_raw(&self, method: &str, payload: Value) -> Result<Value, ClientError> {
        self.client.exec(method, payload, &self.context).await
    }

    pub async fn exec_typed<Req, Res>(&self, method: &str, request: &Req) -> Result<Res, ClientError>
    where
        Req: Serialize + ?Sized,
        Res: DeserializeOwned,
    {
        let payload = serde_json::to_value(request)
            .map_err(|e| ClientError::ClientRuntime(format!("failed to encode request: {e}")))?;
        let value = self.exec_raw(method, payload).await?;
        serde_json::from_value(value)
            .map_err(|e| ClientError::ClientRuntime(format!("malformed response: {e}")))
    }

    pub async fn open_duplex(&self, method: &str) -> Result<DuplexStream, ClientError> {
        self.client.open_duplex(method, &self.context).await
    }
}

/// Wraps the configured hosts; each host holds its own circuit breaker, and
/// a global retry policy wraps the host-selection loop.
pub struct ConnectionPool {
    hosts: Vec<Arc<Host>>,
    host_options: HostOptions,
    global_policy: RetryPolicy<ClientError>,
    authenticator: Authenticator,
    shuffle: Arc<dyn ShuffleSource>,
    closed: AtomicBool,
}

impl ConnectionPool {
    pub fn new(options: ClientOptions) -> Result<Self, ClientError> {
        if options.hosts.is_empty() {
            return Err(ClientError::ClientRuntime(
                "cannot construct a client with no hosts specified".into(),
            ));
        }

        let connector = options
            .connector
            .unwrap_or_else(|| Arc::new(GrpcConnector));
        let shuffle = options
            .shuffle
            .unwrap_or_else(|| Arc::new(RandomShuffle));
        let global_policy = options
            .fault_handling
            .global
            .unwrap_or_else(default_global_policy);
        let breaker_factory = options.fault_handling.host;

        let hosts = options
            .hosts
            .iter()
            .map(|address| {
                let breaker = match &breaker_factory {
                    Some(factory) => factory(address),
                    None => default_host_breaker(),
                };
                Arc::new(Host::new(
                    address.clone(),
                    options.host_options.clone(),
                    connector.clone(),
                    breaker,
                ))
            })
            .collect();

        let authenticator = Authenticator::new(
            options.auth,
            options.hosts,
            connector,
            options.host_options.clone(),
        );

        Ok(Self {
            hosts,
            host_options: options.host_options,
            global_policy,
            authenticator,
            shuffle,
            closed: AtomicBool::new(false),
        })
    }

    /// The configured hosts, in declaration order.
    pub fn hosts(&self) -> &[Arc<Host>] {
        &self.hosts
    }

    /// Tears down all hosts; subsequent calls fail with
    /// [`ClientError::ClientClosed`].
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        for host in &self.hosts {
            host.close();
        }
    }

    /// Executes a unary call under the global retry policy, failing over
    /// across hosts. An invalid-auth-token response invalidates the cached
    /// token and replays the call once.
    pub async fn exec(
        &self,
        service: Service,
        method: &str,
        payload: Value,
    ) -> Result<Value, ClientError> {
        let mut replays = AUTH_REPLAYS;
        loop {
            match self.exec_once(service, method, payload.clone()).await {
                Err(ClientError::InvalidAuthToken(_)) if replays > 0 => {
                    debug!(method, "auth token rejected; re-authenticating");
                    replays -= 1;
                    self.authenticator.invalidate().await;
                }
                other => return other,
            }
        }
    }

    /// Typed convenience over [`Self::exec`].
    pub async fn exec_typed<Req, Res>(
        &self,
        service: Service,
        method: &str,
        request: &Req,
    ) -> Result<Res, ClientError>
    where
        Req: Serialize + ?Sized,
        Res: DeserializeOwned,
    {
        let payload = serde_json::to_value(request)
            .map_err(|e| ClientError::ClientRuntime(format!("failed to encode request: {e}")))?;
        let value = self.exec(service, method, payload).await?;
        serde_json::from_value(value)
            .map_err(|e| ClientError::ClientRuntime(format!("malformed response: {e}")))
    }

    async fn exec_once(
        &self,
        service: Service,
        method: &str,
        payload: Value,
    ) -> Result<Value, ClientError> {
        // One shuffle generator per exec, shared across retry rounds, so
        // consecutive attempts keep walking the cycle instead of restarting
        // on the same host.
        let cycle = Mutex::new(self.new_cycle());
        let last_error: Mutex<Option<ClientError>> = Mutex::new(None);
        let cycle_ref = &cycle;
        let last_error_ref = &last_error;

        let result = self
            .global_policy
            .execute(
                || {
                    let payload = payload.clone();
                    async move {
                        self.with_connection_internal(
                            service,
                            cycle_ref,
                            Some(last_error_ref),
                            move |conn| {
                                let payload = payload.clone();
                                async move { conn.exec_raw(method, payload).await }
                            },
                        )
                        .await
                    }
                },
                CancellationToken::new(),
            )
            .await;

        // If the failure that surfaced is a broken circuit but a more
        // specific error was observed during the same call, surface that
        // instead; callers should not see "circuit broken" when the real
        // cause is known.
        match result {
            Err(ClientError::BrokenCircuit) => match last_error.lock().take() {
                Some(specific) if !matches!(specific, ClientError::BrokenCircuit) => Err(specific),
                _ => Err(ClientError::BrokenCircuit),
            },
            other => other,
        }
    }

    /// Runs `f` against some host, trying each host at most once (in
    /// shuffled order) when the per-host circuit breaker rejects the call
    /// before it starts. Errors raised after `f` began running are returned
    /// to the caller without failover.
    pub async fn with_connection<T, F, Fut>(&self, service: Service, f: F) -> Result<T, ClientError>
    where
        F: FnMut(Connection) -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        let cycle = Mutex::new(self.new_cycle());
        self.with_connection_internal(service, &cycle, None, f).await
    }

    /// Resolves a (host, client) pair for streaming callers, which route
    /// stream failures back through [`Self::mark_failed`].
    pub async fn connection(&self, service: Service) -> Result<Connection, ClientError> {
        self.with_connection(service, |conn| async move { Ok(conn) })
            .await
    }

    /// Feeds an error observed outside `exec` (e.g. on a long-lived stream)
    /// through the host's circuit breaker and cache teardown.
    pub fn mark_failed(&self, host: &Host, error: &ClientError) {
        debug!(address = host.address(), error = %error, "marking host failed");
        if error.is_recoverable() {
            host.reset_all_services();
        }
        host.fault_handling().record_synthetic_failure(error.clone());
    }

    /// The authenticator backing this pool.
    pub fn authenticator(&self) -> &Authenticator {
        &self.authenticator
    }

    fn new_cycle(&self) -> ShuffledCycle<Arc<Host>> {
        ShuffledCycle::new(self.hosts.clone(), self.shuffle.clone())
    }

    async fn with_connection_internal<T, F, Fut>(
        &self,
        service: Service,
        cycle: &Mutex<ShuffledCycle<Arc<Host>>>,
        last_error_slot: Option<&Mutex<Option<ClientError>>>,
        mut f: F,
    ) -> Result<T, ClientError>
    where
        F: FnMut(Connection) -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ClientError::ClientClosed(service.name().to_string()));
        }

        let token = self.authenticator.token().await?;
        let context = CallContext {
            token,
            deadline: self.host_options.request_timeout,
        };

        let mut last: Option<ClientError> = None;
        for _ in 0..self.hosts.len() {
            let Some(host) = cycle.lock().next_item() else {
                break;
            };
            let did_call_through = Arc::new(AtomicBool::new(false));

            let dct = did_call_through.clone();
            let call_host = host.clone();
            let call_context = context.clone();
            let f_ref = &mut f;
            let result = host
                .fault_handling()
                .execute(
                    move || async move {
                        dct.store(true, Ordering::SeqCst);
                        let client = call_host.service_client(service).await?;
                        f_ref(Connection {
                            host: call_host.clone(),
                            client,
                            context: call_context,
                        })
                        .await
                    },
                    CancellationToken::new(),
                )
                .await;

            match result {
                Ok(value) => return Ok(value),
                Err(policy_error) => {
                    let error: ClientError = policy_error.into();
                    if error.is_recoverable() {
                        host.reset_all_services();
                    }
                    // Only pre-call rejections (circuit open, isolated) are
                    // retried against another host.
                    if did_call_through.load(Ordering::SeqCst) {
                        if let Some(slot) = last_error_slot {
                            *slot.lock() = Some(error.clone());
                        }
                        return Err(error);
                    }
                    last = Some(error);
                }
            }
        }

        match last {
            Some(error) => Err(error),
            None => Err(ClientError::ClientRuntime(
                "connection pool has no hosts".into(),
            )),
        }
    }
}
