//! Lease manager: grant-once semantics and a self-healing keepalive loop.

use crate::errors::ClientError;
use crate::pool::ConnectionPool;
use crate::transport::{FrameSink, FrameSource};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tether_core_resilience::{CancellationToken, EventEmitter};
use tether_proto::{
    methods, LeaseGrantRequest, LeaseGrantResponse, LeaseId, LeaseKeepAliveRequest,
    LeaseKeepAliveResponse, LeaseRevokeRequest, LeaseRevokeResponse, Service,
};
use tokio::sync::watch;
use tracing::{debug, warn};

/// Pause before retrying the keepalive loop after a transient stream error.
const KEEPALIVE_RETRY_PAUSE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LeaseState {
    Alive,
    Revoked,
}

enum StreamOutcome {
    Shutdown,
    Transient(ClientError),
    Invalid(ClientError),
}

struct LeaseInner {
    pool: Arc<ConnectionPool>,
    ttl: i64,
    state: Mutex<LeaseState>,
    grant: watch::Sender<Option<Result<LeaseId, ClientError>>>,
    last_keepalive: Mutex<Instant>,
    shutdown: CancellationToken,
    on_lost: EventEmitter<ClientError>,
    on_keepalive: EventEmitter<LeaseKeepAliveResponse>,
    on_keepalive_established: EventEmitter<()>,
}

impl LeaseInner {
    fn close(&self) {
        *self.state.lock() = LeaseState::Revoked;
        self.shutdown.cancel();
    }

    /// Marks the lease as lost: tears it down and notifies listeners.
    fn emit_loss(&self, error: ClientError) {
        self.close();
        warn!(error = %error, "lease lost");
        self.on_lost.emit(&error);
    }

    fn alive(&self) -> bool {
        *self.state.lock() == LeaseState::Alive
    }
}

/// A server-side TTL token owning a set of keys, kept alive by a background
/// keepalive loop tied to this handle's lifetime.
///
/// Subscribe to [`Lease::on_lost`] to react when the lease cannot be
/// maintained; the lease is torn down exactly once.
pub struct Lease {
    inner: Arc<LeaseInner>,
}

impl Lease {
    /// Grants a lease with the given TTL (at least 1 second) and starts the
    /// keepalive loop.
    pub fn new(pool: Arc<ConnectionPool>, ttl: Duration) -> Result<Self, ClientError> {
        let ttl_secs = ttl.as_secs() as i64;
        if ttl_secs < 1 {
            return Err(ClientError::ClientRuntime(format!(
                "lease TTL must be at least 1 second, got {ttl:?}"
            )));
        }

        let (grant_tx, _) = watch::channel(None);
        let inner = Arc::new(LeaseInner {
            pool,
            ttl: ttl_secs,
            state: Mutex::new(LeaseState::Alive),
            grant: grant_tx,
            last_keepalive: Mutex::new(Instant::now()),
            shutdown: CancellationToken::new(),
            on_lost: EventEmitter::new(),
            on_keepalive: EventEmitter::new(),
            on_keepalive_established: EventEmitter::new(),
        });

        tokio::spawn(Self::run(inner.clone()));
        Ok(Self { inner })
    }

    /// Waits for the lease to be granted. Idempotent: every caller shares
    /// the single underlying grant call.
    pub async fn grant(&self) -> Result<LeaseId, ClientError> {
        let mut rx = self.inner.grant.subscribe();
        loop {
            if let Some(result) = rx.borrow_and_update().clone() {
                return result;
            }
            if rx.changed().await.is_err() {
                return Err(ClientError::ClientRuntime("lease task terminated".into()));
            }
        }
    }

    /// Whether the server has told us this lease is gone (or it was
    /// released locally).
    pub fn revoked(&self) -> bool {
        !self.inner.alive()
    }

    /// Fires when the lease is lost for any reason.
    pub fn on_lost(&self) -> &EventEmitter<ClientError> {
        &self.inner.on_lost
    }

    /// Fires on every successful keepalive response.
    pub fn on_keepalive(&self) -> &EventEmitter<LeaseKeepAliveResponse> {
        &self.inner.on_keepalive
    }

    /// Fires whenever a keepalive stream is (re)established.
    pub fn on_keepalive_established(&self) -> &EventEmitter<()> {
        &self.inner.on_keepalive_established
    }

    /// Stops the keepalive loop and explicitly revokes the lease so the
    /// server frees its keys immediately.
    pub async fn revoke(&self) -> Result<(), ClientError> {
        let granted = {
            let mut rx = self.inner.grant.subscribe();
            let current = rx.borrow_and_update().clone();
            match current {
                Some(result) => result,
                // Still granting; wait for it to settle before revoking.
                None => {
                    self.inner.close();
                    match rx.changed().await {
                        Ok(()) => rx.borrow().clone().unwrap_or(Err(
                            ClientError::ClientRuntime("lease task terminated".into()),
                        )),
                        Err(_) => return Ok(()),
                    }
                }
            }
        };
        self.inner.close();

        match granted {
            Ok(id) => {
                let _: LeaseRevokeResponse = self
                    .inner
                    .pool
                    .exec_typed(
                        Service::Lease,
                        methods::LEASE_REVOKE,
                        &LeaseRevokeRequest { id },
                    )
                    .await?;
                Ok(())
            }
            // Never granted; nothing to revoke.
            Err(_) => Ok(()),
        }
    }

    /// Stops the keepalive loop and lets the lease expire passively when its
    /// TTL rolls around.
    pub fn release(&self) {
        self.inner.close();
    }

    /// Fires a single immediate keepalive.
    pub async fn keepalive_once(&self) -> Result<LeaseKeepAliveResponse, ClientError> {
        let id = self.grant().await?;
        let conn = self.inner.pool.connection(Service::Lease).await?;
        let stream = conn.open_duplex(methods::LEASE_KEEP_ALIVE).await?;
        let (sink, mut source) = stream.split();

        sink.send(
            serde_json::to_value(LeaseKeepAliveRequest { id })
                .map_err(|e| ClientError::ClientRuntime(format!("failed to encode: {e}")))?,
        )
        .await?;

        let frame = match source.next().await {
            Some(Ok(frame)) => frame,
            Some(Err(error)) => return Err(error),
            None => return Err(ClientError::WatchStreamEnded),
        };
        sink.close();

        let response: LeaseKeepAliveResponse = serde_json::from_value(frame)
            .map_err(|e| ClientError::ClientRuntime(format!("malformed response: {e}")))?;
        if response.ttl == 0 {
            let error = ClientError::LeaseInvalid(format!("lease {id} expired or revoked"));
            self.inner.emit_loss(error.clone());
            return Err(error);
        }
        *self.inner.last_keepalive.lock() = Instant::now();
        Ok(response)
    }

    async fn run(inner: Arc<LeaseInner>) {
        // Single underlying grant RPC; everyone awaiting grant() shares it.
        let granted: Result<LeaseGrantResponse, ClientError> = inner
            .pool
            .exec_typed(
                Service::Lease,
                methods::LEASE_GRANT,
                &LeaseGrantRequest {
                    ttl: inner.ttl,
                    id: None,
                },
            )
            .await;

        let id = match granted {
            Ok(response) => {
                debug!(lease = %response.id, ttl = response.ttl, "lease granted");
                *inner.last_keepalive.lock() = Instant::now();
                inner.grant.send_replace(Some(Ok(response.id)));
                response.id
            }
            Err(error) => {
                // Store the error as a value so callers of grant() see it
                // without an unobserved failure taking anything down.
                inner.grant.send_replace(Some(Err(error.clone())));
                inner.emit_loss(error);
                return;
            }
        };

        Self::keepalive_loop(inner, id).await;
    }

    async fn keepalive_loop(inner: Arc<LeaseInner>, id: LeaseId) {
        loop {
            if inner.shutdown.is_cancelled() || !inner.alive() {
                return;
            }

            // If we were disconnected for longer than the lease's own TTL
            // there is no way the server still holds it; give up instead of
            // retrying against a certainly-expired lease.
            let since_last = inner.last_keepalive.lock().elapsed();
            if since_last > Duration::from_secs(2 * inner.ttl as u64) {
                inner.emit_loss(ClientError::ConnectFailed(
                    "lost connection to etcd and the lease has expired".into(),
                ));
                return;
            }

            let outcome = Self::run_keepalive_stream(&inner, id).await;
            match outcome {
                StreamOutcome::Shutdown => return,
                StreamOutcome::Invalid(error) => {
                    inner.emit_loss(error);
                    return;
                }
                StreamOutcome::Transient(error) => {
                    debug!(error = %error, "keepalive interrupted; retrying");
                    tokio::select! {
                        _ = inner.shutdown.cancelled() => return,
                        _ = tokio::time::sleep(KEEPALIVE_RETRY_PAUSE) => {}
                    }
                }
            }
        }
    }

    async fn run_keepalive_stream(inner: &Arc<LeaseInner>, id: LeaseId) -> StreamOutcome {
        let conn = match inner.pool.connection(Service::Lease).await {
            Ok(conn) => conn,
            Err(error) => return StreamOutcome::Transient(error),
        };
        let stream = match conn.open_duplex(methods::LEASE_KEEP_ALIVE).await {
            Ok(stream) => stream,
            Err(error) => {
                inner.pool.mark_failed(&conn.host, &error);
                return StreamOutcome::Transient(error);
            }
        };
        let (sink, mut source) = stream.split();
        inner.on_keepalive_established.emit(&());

        let request = match serde_json::to_value(LeaseKeepAliveRequest { id }) {
            Ok(request) => request,
            Err(e) => {
                return StreamOutcome::Transient(ClientError::ClientRuntime(format!(
                    "failed to encode keepalive: {e}"
                )))
            }
        };

        // One write per TTL/3, serialized by this loop; the first fires
        // immediately.
        let mut interval =
            tokio::time::interval(Duration::from_secs((inner.ttl as u64 / 3).max(1)));

        let outcome = loop {
            tokio::select! {
                _ = inner.shutdown.cancelled() => break StreamOutcome::Shutdown,
                _ = interval.tick() => {
                    if let Err(error) = sink.send(request.clone()).await {
                        break StreamOutcome::Transient(error);
                    }
                }
                frame = source.next() => match frame {
                    Some(Ok(value)) => match serde_json::from_value::<LeaseKeepAliveResponse>(value) {
                        Ok(response) => {
                            if response.ttl == 0 {
                                break StreamOutcome::Invalid(ClientError::LeaseInvalid(
                                    format!("lease {id} expired or revoked"),
                                ));
                            }
                            *inner.last_keepalive.lock() = Instant::now();
                            inner.on_keepalive.emit(&response);
                        }
                        Err(e) => break StreamOutcome::Transient(ClientError::ClientRuntime(
                            format!("malformed keepalive response: {e}"),
                        )),
                    },
                    Some(Err(error)) => break StreamOutcome::Transient(error),
                    None => break StreamOutcome::Transient(ClientError::WatchStreamEnded),
                },
            }
        };

        sink.close();
        if let StreamOutcome::Transient(error) = &outcome {
            inner.pool.mark_failed(&conn.host, error);
        }
        outcome
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        // Stop the background loop; the lease expires passively unless
        // revoke() was called.
        self.inner.shutdown.cancel();
    }
}
