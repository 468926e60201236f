//! Leader election built on leases, watches and comparator transactions,
//! following etcd's own concurrency recipe: each candidate writes a key
//! derived from its lease, and leadership goes to the live candidate whose
//! key has the lowest create revision.

use crate::errors::ClientError;
use crate::lease::Lease;
use crate::pool::ConnectionPool;
use crate::range::Range;
use crate::watch::{WatchEvent, WatchManager, WatchSpec};
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tether_core_resilience::{CancellationToken, EventEmitter};
use tether_proto::{
    methods, Compare, CompareResult, KeyValue, PutRequest, RangeRequest, RangeResponse, RequestOp,
    Revision, Service, SortOrder, SortTarget, TxnRequest, TxnResponse,
};
use tokio::sync::{oneshot, watch};
use tracing::debug;

/// Prefix under which all election state lives.
const ELECTION_PREFIX: &str = "election";

fn join_key(prefix: &Bytes, suffix: &str) -> Bytes {
    let mut key = BytesMut::from(&prefix[..]);
    key.extend_from_slice(suffix.as_bytes());
    key.freeze()
}

/// One named election. Entry points: [`Election::campaign`] to stand for
/// leadership, [`Election::observe`] to follow whoever currently holds it.
pub struct Election {
    pool: Arc<ConnectionPool>,
    watches: Arc<WatchManager>,
    prefix: Bytes,
    ttl: Duration,
}

impl Election {
    pub fn new(
        pool: Arc<ConnectionPool>,
        watches: Arc<WatchManager>,
        name: &str,
        ttl: Duration,
    ) -> Self {
        Self {
            pool,
            watches,
            prefix: Bytes::from(format!("{ELECTION_PREFIX}/{name}/")),
            ttl,
        }
    }

    /// Puts the value as eligible for election. Multiple candidates can
    /// campaign concurrently; exactly one is leader at a time. Listen for
    /// `elected` (or use [`Campaign::wait`]) and for errors on the returned
    /// campaign.
    pub fn campaign(&self, value: impl Into<Bytes>) -> Result<Campaign, ClientError> {
        Campaign::start(
            self.pool.clone(),
            self.watches.clone(),
            self.prefix.clone(),
            value.into(),
            self.ttl,
        )
    }

    /// The currently leading key-value pair, if any.
    pub async fn leader(&self) -> Result<Option<KeyValue>, ClientError> {
        let response = scan_earliest(&self.pool, &self.prefix).await?;
        Ok(response.kvs.into_iter().next())
    }

    /// Creates an observer that emits `change` events as leadership moves.
    /// Resolves once the initial leader (or lack of one) is known.
    pub async fn observe(&self) -> Result<ElectionObserver, ClientError> {
        ElectionObserver::start(self.pool.clone(), self.watches.clone(), self.prefix.clone()).await
    }
}

/// Earliest-created key under the prefix: the current leader.
async fn scan_earliest(
    pool: &ConnectionPool,
    prefix: &Bytes,
) -> Result<RangeResponse, ClientError> {
    let range = Range::prefix(prefix.clone());
    let request = RangeRequest {
        key: range.start,
        range_end: Some(range.end),
        limit: Some(1),
        sort_order: Some(SortOrder::Ascend),
        sort_target: Some(SortTarget::Create),
        ..Default::default()
    };
    pool.exec_typed(Service::Kv, methods::RANGE, &request).await
}

enum CampaignState {
    /// The initial put has not settled; proclamations are queued.
    Pending {
        queued: Option<(Bytes, Vec<oneshot::Sender<Result<(), ClientError>>>)>,
    },
    Active {
        key_revision: Revision,
    },
    Resigned,
}

#[derive(Debug, Clone)]
enum CampaignSignal {
    Campaigning,
    Elected,
    Failed,
}

struct CampaignInner {
    pool: Arc<ConnectionPool>,
    watches: Arc<WatchManager>,
    prefix: Bytes,
    lease: Arc<Lease>,
    value: Mutex<Bytes>,
    state: Mutex<CampaignState>,
    signal: watch::Sender<CampaignSignal>,
    on_elected: EventEmitter<()>,
    on_error: EventEmitter<ClientError>,
    cancel: CancellationToken,
}

/// A single candidacy; returned from [`Election::campaign`].
pub struct Campaign {
    inner: Arc<CampaignInner>,
}

impl Campaign {
    fn start(
        pool: Arc<ConnectionPool>,
        watches: Arc<WatchManager>,
        prefix: Bytes,
        value: Bytes,
        ttl: Duration,
    ) -> Result<Self, ClientError> {
        let lease = Arc::new(Lease::new(pool.clone(), ttl)?);
        let (signal_tx, _) = watch::channel(CampaignSignal::Campaigning);
        let inner = Arc::new(CampaignInner {
            pool,
            watches,
            prefix,
            lease,
            value: Mutex::new(value),
            state: Mutex::new(CampaignState::Pending { queued: None }),
            signal: signal_tx,
            on_elected: EventEmitter::new(),
            on_error: EventEmitter::new(),
            cancel: CancellationToken::new(),
        });

        {
            let inner = inner.clone();
            let on_error = inner.on_error.clone();
            tokio::spawn(async move {
                if let Err(error) = Self::run(&inner).await {
                    Self::fail_queued(&inner, &error);
                    let _ = Self::resign_inner(&inner).await;
                    inner.signal.send_replace(CampaignSignal::Failed);
                    on_error.emit(&error);
                }
            });
        }

        Ok(Self { inner })
    }

    /// Fires once this candidate has become the leader.
    pub fn on_elected(&self) -> &EventEmitter<()> {
        &self.inner.on_elected
    }

    /// Fires when the campaign fails (including a lost lease).
    pub fn on_error(&self) -> &EventEmitter<ClientError> {
        &self.inner.on_error
    }

    /// Resolves when this candidate becomes the leader. Never resolves if
    /// the campaign resigned first; fails if the campaign failed.
    pub async fn wait(&self) -> Result<(), ClientError> {
        let mut rx = self.inner.signal.subscribe();
        loop {
            match rx.borrow_and_update().clone() {
                CampaignSignal::Elected => return Ok(()),
                CampaignSignal::Failed => {
                    return Err(ClientError::ClientRuntime("the campaign failed".into()))
                }
                CampaignSignal::Campaigning => {}
            }
            if rx.changed().await.is_err() {
                return Err(ClientError::ClientRuntime("campaign terminated".into()));
            }
        }
    }

    /// The key in which this candidate's value is stored; derived from the
    /// lease, so this fails if the lease could not be granted.
    pub async fn campaign_key(&self) -> Result<Bytes, ClientError> {
        let lease_id = self.inner.lease.grant().await?;
        Ok(join_key(&self.inner.prefix, &lease_id.to_hex()))
    }

    /// Updates the announced value without restarting the election. Fails
    /// with [`ClientError::NotCampaigning`] once the candidacy has ended.
    pub async fn proclaim(&self, value: impl Into<Bytes>) -> Result<(), ClientError> {
        enum Route {
            Queued(oneshot::Receiver<Result<(), ClientError>>),
            Active(Revision),
        }

        let value: Bytes = value.into();
        let route = {
            let mut state = self.inner.state.lock();
            match &mut *state {
                CampaignState::Resigned => return Err(ClientError::NotCampaigning),
                // The initial put has not settled yet; queue the value for
                // flushing once the create settles.
                CampaignState::Pending { queued } => {
                    let (tx, rx) = oneshot::channel();
                    match queued {
                        Some((pending_value, acks)) => {
                            *pending_value = value.clone();
                            acks.push(tx);
                        }
                        None => *queued = Some((value.clone(), vec![tx])),
                    }
                    Route::Queued(rx)
                }
                CampaignState::Active { key_revision } => Route::Active(*key_revision),
            }
        };

        match route {
            Route::Queued(rx) => match rx.await {
                Ok(result) => result,
                Err(_) => Err(ClientError::NotCampaigning),
            },
            Route::Active(key_revision) => {
                if *self.inner.value.lock() == value {
                    return Ok(());
                }
                Self::proclaim_inner(&self.inner, value, key_revision).await
            }
        }
    }

    /// Withdraws from the election; a new leader is elected if this
    /// candidate was leading.
    pub async fn resign(&self) -> Result<(), ClientError> {
        Self::resign_inner(&self.inner).await
    }

    async fn resign_inner(inner: &Arc<CampaignInner>) -> Result<(), ClientError> {
        let was_campaigning = {
            let mut state = inner.state.lock();
            let campaigning = !matches!(*state, CampaignState::Resigned);
            *state = CampaignState::Resigned;
            campaigning
        };
        inner.cancel.cancel();
        if was_campaigning {
            inner.lease.revoke().await?;
        }
        Ok(())
    }

    fn fail_queued(inner: &Arc<CampaignInner>, error: &ClientError) {
        let queued = {
            let mut state = inner.state.lock();
            match &mut *state {
                CampaignState::Pending { queued } => queued.take(),
                _ => None,
            }
        };
        if let Some((_, acks)) = queued {
            for ack in acks {
                let _ = ack.send(Err(error.clone()));
            }
        }
    }

    async fn run(inner: &Arc<CampaignInner>) -> Result<(), ClientError> {
        let lease_id = inner.lease.grant().await?;
        let key = join_key(&inner.prefix, &lease_id.to_hex());
        let value = inner.value.lock().clone();

        // Claim the key if nobody (including a previous incarnation of this
        // lease) holds it; otherwise read back what is there.
        let request = TxnRequest {
            compare: vec![Compare::create_revision(
                key.clone(),
                CompareResult::Equal,
                Revision::ZERO,
            )],
            success: vec![RequestOp::RequestPut(PutRequest {
                key: key.clone(),
                value: value.clone(),
                lease: Some(lease_id),
                ..Default::default()
            })],
            failure: vec![RequestOp::RequestRange(RangeRequest {
                key: key.clone(),
                ..Default::default()
            })],
        };
        let response: TxnResponse = inner
            .pool
            .exec_typed(Service::Kv, methods::TXN, &request)
            .await?;

        if matches!(*inner.state.lock(), CampaignState::Resigned) {
            return Ok(()); // torn down in the meantime
        }

        let mut key_revision = response.header.revision;
        if !response.succeeded {
            let existing = response
                .responses
                .into_iter()
                .next()
                .and_then(|op| op.into_range())
                .and_then(|range| range.kvs.into_iter().next())
                .ok_or_else(|| {
                    ClientError::ClientRuntime("campaign key disappeared mid-claim".into())
                })?;
            key_revision = existing.create_revision;
            if existing.value != value {
                Self::proclaim_inner(inner, value, key_revision).await?;
            }
        }

        // Settle: flush any proclamation queued while the put was in
        // flight, then go Active.
        let queued = {
            let mut state = inner.state.lock();
            if !matches!(*state, CampaignState::Pending { .. }) {
                return Ok(()); // resigned in the meantime
            }
            let queued = match &mut *state {
                CampaignState::Pending { queued } => queued.take(),
                _ => None,
            };
            *state = CampaignState::Active { key_revision };
            queued
        };
        if let Some((pending_value, acks)) = queued {
            let result = Self::proclaim_inner(inner, pending_value, key_revision).await;
            for ack in acks {
                let _ = ack.send(result.clone());
            }
            result?;
        }

        Self::wait_for_elected(inner, response.header.revision).await?;

        if matches!(*inner.state.lock(), CampaignState::Resigned) {
            return Ok(());
        }
        debug!("campaign elected");
        inner.signal.send_replace(CampaignSignal::Elected);
        inner.on_elected.emit(&());
        Ok(())
    }

    async fn proclaim_inner(
        inner: &Arc<CampaignInner>,
        value: Bytes,
        key_revision: Revision,
    ) -> Result<(), ClientError> {
        let lease_id = inner.lease.grant().await?;
        let key = join_key(&inner.prefix, &lease_id.to_hex());

        let request = TxnRequest {
            compare: vec![Compare::create_revision(
                key.clone(),
                CompareResult::Equal,
                key_revision,
            )],
            success: vec![RequestOp::RequestPut(PutRequest {
                key,
                value: value.clone(),
                lease: Some(lease_id),
                ..Default::default()
            })],
            failure: Vec::new(),
        };
        let response: TxnResponse = inner
            .pool
            .exec_typed(Service::Kv, methods::TXN, &request)
            .await?;

        *inner.value.lock() = value;
        if !response.succeeded {
            // Our key changed under us; the candidacy is over.
            let _ = Self::resign_inner(inner).await;
            return Err(ClientError::NotCampaigning);
        }
        Ok(())
    }

    /// Becomes leader only once every key created earlier than ours has
    /// been deleted, i.e. the prior leader resigned or expired.
    async fn wait_for_elected(
        inner: &Arc<CampaignInner>,
        revision: Revision,
    ) -> Result<(), ClientError> {
        let range = Range::prefix(inner.prefix.clone());
        let request = RangeRequest {
            key: range.start,
            range_end: Some(range.end),
            limit: Some(1),
            sort_order: Some(SortOrder::Descend),
            sort_target: Some(SortTarget::Create),
            max_create_revision: Some(revision.pred()),
            ..Default::default()
        };
        let response: RangeResponse = inner
            .pool
            .exec_typed(Service::Kv, methods::RANGE, &request)
            .await?;

        for kv in response.kvs {
            Self::wait_for_delete(inner, kv.key).await?;
        }
        Ok(())
    }

    async fn wait_for_delete(inner: &Arc<CampaignInner>, key: Bytes) -> Result<(), ClientError> {
        let current: RangeResponse = inner
            .pool
            .exec_typed(
                Service::Kv,
                methods::RANGE,
                &RangeRequest {
                    key: key.clone(),
                    ..Default::default()
                },
            )
            .await?;
        if current.kvs.is_empty() {
            return Ok(());
        }

        let mut watcher = inner
            .watches
            .watch(
                WatchSpec::key(key)
                    .with_start_revision(current.header.revision)
                    .ignore_puts(),
            )
            .await?;

        let result = loop {
            tokio::select! {
                _ = inner.cancel.cancelled() => break Ok(()),
                event = watcher.next() => match event {
                    Some(WatchEvent::Delete { .. }) => break Ok(()),
                    Some(WatchEvent::Error(error)) => break Err(error),
                    Some(_) => continue,
                    None => break Err(ClientError::WatchStreamEnded),
                },
            }
        };
        watcher.cancel().await;
        result
    }
}

impl Drop for Campaign {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}

/// Follows the current leader of an election; see [`Election::observe`].
pub struct ElectionObserver {
    inner: Arc<ObserverInner>,
}

struct ObserverInner {
    current: Mutex<Option<Option<KeyValue>>>,
    on_change: EventEmitter<Option<Bytes>>,
    on_error: EventEmitter<ClientError>,
    cancel: CancellationToken,
}

impl ObserverInner {
    /// Emits `change` only when the observed leader value actually differs;
    /// "no leader" and "has leader" are distinct states.
    fn set_leader(&self, kv: Option<KeyValue>) {
        let mut current = self.current.lock();
        let changed = match &*current {
            None => true,
            Some(previous) => match (previous, &kv) {
                (None, None) => false,
                (Some(a), Some(b)) => a.value != b.value,
                _ => true,
            },
        };
        let value = kv.as_ref().map(|kv| kv.value.clone());
        *current = Some(kv);
        drop(current);
        if changed {
            self.on_change.emit(&value);
        }
    }
}

impl ElectionObserver {
    async fn start(
        pool: Arc<ConnectionPool>,
        watches: Arc<WatchManager>,
        prefix: Bytes,
    ) -> Result<Self, ClientError> {
        let inner = Arc::new(ObserverInner {
            current: Mutex::new(None),
            on_change: EventEmitter::new(),
            on_error: EventEmitter::new(),
            cancel: CancellationToken::new(),
        });

        let (ready_tx, ready_rx) = oneshot::channel();
        {
            let inner = inner.clone();
            tokio::spawn(async move {
                let mut ready = Some(ready_tx);
                if let Err(error) = Self::run(&inner, &pool, &watches, &prefix, &mut ready).await {
                    if let Some(ready) = ready.take() {
                        let _ = ready.send(Err(error.clone()));
                    }
                    inner.on_error.emit(&error);
                }
            });
        }

        ready_rx
            .await
            .map_err(|_| ClientError::ClientRuntime("observer terminated".into()))??;
        Ok(Self { inner })
    }

    /// Whether the election currently has any leader.
    pub fn has_leader(&self) -> bool {
        matches!(&*self.inner.current.lock(), Some(Some(_)))
    }

    /// The current leader's value.
    pub fn leader(&self) -> Option<Bytes> {
        match &*self.inner.current.lock() {
            Some(Some(kv)) => Some(kv.value.clone()),
            _ => None,
        }
    }

    /// Fires with the new leader value (or `None`) whenever it changes.
    pub fn on_change(&self) -> &EventEmitter<Option<Bytes>> {
        &self.inner.on_change
    }

    /// Fires when observation fails fatally.
    pub fn on_error(&self) -> &EventEmitter<ClientError> {
        &self.inner.on_error
    }

    /// Stops observing.
    pub fn cancel(&self) {
        self.inner.cancel.cancel();
    }

    async fn run(
        inner: &Arc<ObserverInner>,
        pool: &Arc<ConnectionPool>,
        watches: &Arc<WatchManager>,
        prefix: &Bytes,
        ready: &mut Option<oneshot::Sender<Result<(), ClientError>>>,
    ) -> Result<(), ClientError> {
        while !inner.cancel.is_cancelled() {
            let scan = scan_earliest(pool, prefix).await?;
            let mut leader = scan.kvs.into_iter().next();
            let mut revision = scan.header.revision;

            if leader.is_none() {
                inner.set_leader(None);
                if let Some(ready) = ready.take() {
                    let _ = ready.send(Ok(()));
                }

                // Wait for any candidate to appear.
                let mut watcher = watches
                    .watch(
                        WatchSpec::range(Range::prefix(prefix.clone()))
                            .with_start_revision(revision)
                            .ignore_deletes(),
                    )
                    .await?;
                let found = loop {
                    tokio::select! {
                        _ = inner.cancel.cancelled() => break None,
                        event = watcher.next() => match event {
                            Some(WatchEvent::Put { kv, .. }) => break Some(kv),
                            Some(WatchEvent::Error(error)) => {
                                watcher.cancel().await;
                                return Err(error);
                            }
                            Some(_) => continue,
                            None => return Err(ClientError::WatchStreamEnded),
                        },
                    }
                };
                watcher.cancel().await;
                match found {
                    Some(kv) => {
                        revision = kv.mod_revision;
                        leader = Some(kv);
                    }
                    None => return Ok(()), // cancelled
                }
            }

            let Some(leader) = leader else {
                return Err(ClientError::ClientRuntime(
                    "unreachable lack of election leader".into(),
                ));
            };
            inner.set_leader(Some(leader.clone()));
            if let Some(ready) = ready.take() {
                let _ = ready.send(Ok(()));
            }

            // Follow the leading key until it disappears, then rescan.
            let mut watcher = watches
                .watch(WatchSpec::key(leader.key.clone()).with_start_revision(revision.succ()))
                .await?;
            loop {
                tokio::select! {
                    _ = inner.cancel.cancelled() => {
                        watcher.cancel().await;
                        return Ok(());
                    }
                    event = watcher.next() => match event {
                        Some(WatchEvent::Put { kv, .. }) => inner.set_leader(Some(kv)),
                        Some(WatchEvent::Delete { .. }) => break,
                        Some(WatchEvent::Error(error)) => {
                            watcher.cancel().await;
                            return Err(error);
                        }
                        Some(_) => continue,
                        None => return Err(ClientError::WatchStreamEnded),
                    },
                }
            }
            watcher.cancel().await;
        }
        Ok(())
    }
}
