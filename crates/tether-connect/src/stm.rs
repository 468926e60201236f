//! Software transactional memory over optimistic concurrency.
//!
//! A transaction callback receives an explicit accessor ([`Txn`]) exposing
//! only the tracked `get`/`put`/`delete` operations; reads and writes that
//! bypass the accessor are invisible to conflict detection. Each attempt
//! tracks a read set and a write set, commits with one conditional
//! transaction, and retries the whole callback on conflict.

use crate::errors::ClientError;
use crate::pool::ConnectionPool;
use crate::range::Range;
use bytes::Bytes;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tether_proto::{
    methods, Compare, CompareResult, DeleteRangeRequest, KeyValue, PutRequest, RangeRequest,
    RangeResponse, RequestOp, Revision, Service, TxnRequest, TxnResponse,
};
use tokio::sync::Mutex;
use tracing::debug;

/// The consistency guarantee an attempt provides for its reads relative to
/// concurrent writers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Isolation {
    /// Guards reads *and* writes: write-write conflicts on keys that were
    /// written but never read are detected too. Range deletes are not
    /// allowed at this level.
    SerializableSnapshot,
    /// All reads within the attempt see one snapshot revision; commit
    /// asserts no read key changed.
    Serializable,
    /// A second read of the same key returns the first answer; commit
    /// asserts no read key changed.
    RepeatableReads,
    /// Every read hits the store fresh and the commit takes no read guards;
    /// last committer wins.
    ReadCommitted,
}

/// Options for [`SoftwareTransaction`].
#[derive(Debug, Clone)]
pub struct StmOptions {
    /// Additional attempts after the first when the commit conflicts.
    pub retries: u32,
    pub isolation: Isolation,
    /// Keys fetched eagerly at the start of each attempt.
    pub prefetch: Vec<Bytes>,
}

impl Default for StmOptions {
    fn default() -> Self {
        Self {
            retries: 3,
            isolation: Isolation::SerializableSnapshot,
            prefetch: Vec::new(),
        }
    }
}

enum WriteOp {
    Put(PutRequest),
    DeleteKey(DeleteRangeRequest),
    DeleteRange(DeleteRangeRequest, Range),
}

impl WriteOp {
    fn key(&self) -> &Bytes {
        match self {
            WriteOp::Put(req) => &req.key,
            WriteOp::DeleteKey(req) => &req.key,
            WriteOp::DeleteRange(req, _) => &req.key,
        }
    }
}

#[derive(Default)]
struct TxnState {
    /// Per-key read cache (repeatable-reads and serializable levels).
    reads: HashMap<Bytes, RangeResponse>,
    /// Keys read this attempt, with the mod revision observed (zero for
    /// absent keys); the commit-time guard set.
    completed: Vec<(Bytes, Revision)>,
    /// Earliest modification revision observed across all reads.
    earliest_mod: Option<Revision>,
    /// Snapshot revision pinned by the first read (serializable levels).
    first_read_revision: Option<Revision>,
    writes: Vec<WriteOp>,
}

impl TxnState {
    fn record_read(&mut self, key: Bytes, response: &RangeResponse) {
        let mod_revision = response
            .kvs
            .first()
            .map(|kv| kv.mod_revision)
            .unwrap_or(Revision::ZERO);
        self.completed.push((key.clone(), mod_revision));
        if let Some(kv) = response.kvs.first() {
            self.earliest_mod = Some(match self.earliest_mod {
                Some(earliest) => earliest.min(kv.mod_revision),
                None => kv.mod_revision,
            });
        }
        self.reads.insert(key, response.clone());
    }

    /// The most recent pending write against the key, if any; pending
    /// writes are visible to reads within the same attempt.
    fn find_existing_write(&self, key: &Bytes) -> Option<RangeResponse> {
        for op in self.writes.iter().rev() {
            match op {
                WriteOp::Put(req) if &req.key == key => {
                    return Some(key_value_response(key.clone(), Some(req.value.clone())));
                }
                WriteOp::DeleteKey(req) if &req.key == key => {
                    return Some(key_value_response(key.clone(), None));
                }
                WriteOp::DeleteRange(_, range) if range.includes(key) => {
                    return Some(key_value_response(key.clone(), None));
                }
                _ => {}
            }
        }
        None
    }

    /// Last-write-wins within one attempt: a new single-key operation
    /// replaces any earlier one against the same key.
    fn purge_existing_write(&mut self, key: &Bytes) {
        self.writes.retain(|op| match op {
            WriteOp::Put(_) | WriteOp::DeleteKey(_) => op.key() != key,
            WriteOp::DeleteRange(..) => true,
        });
    }
}

/// Partial response synthesized for reads served from the write set; it
/// carries no header or revision information.
fn key_value_response(key: Bytes, value: Option<Bytes>) -> RangeResponse {
    match value {
        Some(value) => RangeResponse {
            kvs: vec![KeyValue {
                key,
                value,
                ..Default::default()
            }],
            count: 1,
            ..Default::default()
        },
        None => RangeResponse::default(),
    }
}

/// The capability-scoped accessor handed to the transaction callback.
#[derive(Clone)]
pub struct Txn {
    inner: Arc<TxnShared>,
}

struct TxnShared {
    pool: Arc<ConnectionPool>,
    isolation: Isolation,
    state: Mutex<TxnState>,
}

impl Txn {
    fn new(pool: Arc<ConnectionPool>, isolation: Isolation) -> Self {
        Self {
            inner: Arc::new(TxnShared {
                pool,
                isolation,
                state: Mutex::new(TxnState::default()),
            }),
        }
    }

    /// Reads a single key through the transaction.
    pub async fn get(&self, key: impl Into<Bytes>) -> Result<Option<KeyValue>, ClientError> {
        let response = self.range(key.into()).await?;
        Ok(response.kvs.into_iter().next())
    }

    /// Schedules a put; applied atomically at commit.
    pub async fn put(
        &self,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
    ) -> Result<(), ClientError> {
        let request = PutRequest {
            key: key.into(),
            value: value.into(),
            ..Default::default()
        };
        let mut state = self.inner.state.lock().await;
        state.purge_existing_write(&request.key);
        state.writes.push(WriteOp::Put(request));
        Ok(())
    }

    /// Schedules a single-key delete; applied atomically at commit.
    pub async fn delete(&self, key: impl Into<Bytes>) -> Result<(), ClientError> {
        let request = DeleteRangeRequest {
            key: key.into(),
            ..Default::default()
        };
        let mut state = self.inner.state.lock().await;
        state.purge_existing_write(&request.key);
        state.writes.push(WriteOp::DeleteKey(request));
        Ok(())
    }

    /// Schedules a range delete. No single-key revision guard can cover an
    /// unbounded range, so this is rejected under
    /// [`Isolation::SerializableSnapshot`].
    pub async fn delete_range(&self, range: Range) -> Result<(), ClientError> {
        if self.inner.isolation == Isolation::SerializableSnapshot {
            return Err(ClientError::ClientRuntime(
                "range deletes are not possible in the SerializableSnapshot isolation level".into(),
            ));
        }
        let request = DeleteRangeRequest {
            key: range.start.clone(),
            range_end: Some(range.end.clone()),
            ..Default::default()
        };
        let mut state = self.inner.state.lock().await;
        state.writes.push(WriteOp::DeleteRange(request, range));
        Ok(())
    }

    async fn range(&self, key: Bytes) -> Result<RangeResponse, ClientError> {
        let mut state = self.inner.state.lock().await;
        if let Some(pending) = state.find_existing_write(&key) {
            return Ok(pending);
        }

        match self.inner.isolation {
            Isolation::ReadCommitted => {
                drop(state);
                self.raw_range(key, None).await
            }
            Isolation::RepeatableReads => {
                if let Some(cached) = state.reads.get(&key) {
                    return Ok(cached.clone());
                }
                let response = self.raw_range(key.clone(), None).await?;
                state.record_read(key, &response);
                Ok(response)
            }
            Isolation::Serializable | Isolation::SerializableSnapshot => {
                if let Some(cached) = state.reads.get(&key) {
                    return Ok(cached.clone());
                }
                let pinned = state.first_read_revision;
                let response = self.raw_range(key.clone(), pinned).await?;
                if state.first_read_revision.is_none() {
                    state.first_read_revision = Some(response.header.revision);
                }
                state.record_read(key, &response);
                Ok(response)
            }
        }
    }

    /// A single-attempt serializable read. The pool's retry policy is not
    /// applied: the transaction's own conflict retry is the equivalent.
    async fn raw_range(
        &self,
        key: Bytes,
        revision: Option<Revision>,
    ) -> Result<RangeResponse, ClientError> {
        let request = RangeRequest {
            key,
            revision,
            serializable: true,
            ..Default::default()
        };
        self.inner
            .pool
            .with_connection(Service::Kv, |conn| {
                let request = request.clone();
                async move { conn.exec_typed(methods::RANGE, &request).await }
            })
            .await
    }

    async fn commit(&self) -> Result<(), ClientError> {
        let state = self.inner.state.lock().await;

        let mut compare = Vec::new();
        match self.inner.isolation {
            Isolation::SerializableSnapshot => {
                // Guard written keys against writes committed since the
                // earliest read, catching write-write conflicts on keys that
                // were never read. No reads means no bound to check against.
                if let Some(earliest) = state.earliest_mod {
                    let bound = earliest.succ();
                    for op in &state.writes {
                        compare.push(Compare::mod_revision(
                            op.key().clone(),
                            CompareResult::Less,
                            bound,
                        ));
                    }
                }
                Self::add_read_guards(&state, &mut compare);
            }
            Isolation::Serializable | Isolation::RepeatableReads => {
                Self::add_read_guards(&state, &mut compare);
            }
            Isolation::ReadCommitted => {}
        }

        let success = state
            .writes
            .iter()
            .map(|op| match op {
                WriteOp::Put(req) => RequestOp::RequestPut(req.clone()),
                WriteOp::DeleteKey(req) | WriteOp::DeleteRange(req, _) => {
                    RequestOp::RequestDeleteRange(req.clone())
                }
            })
            .collect();

        let request = TxnRequest {
            compare,
            success,
            failure: Vec::new(),
        };
        drop(state);

        let response: TxnResponse = self
            .inner
            .pool
            .with_connection(Service::Kv, |conn| {
                let request = request.clone();
                async move { conn.exec_typed(methods::TXN, &request).await }
            })
            .await?;

        if response.succeeded {
            Ok(())
        } else {
            Err(ClientError::StmConflict)
        }
    }

    fn add_read_guards(state: &TxnState, compare: &mut Vec<Compare>) {
        for (key, mod_revision) in &state.completed {
            compare.push(Compare::mod_revision(
                key.clone(),
                CompareResult::Equal,
                *mod_revision,
            ));
        }
    }
}

/// Runs multi-key read/write groups as atomic, retryable transactions.
pub struct SoftwareTransaction {
    pool: Arc<ConnectionPool>,
    options: StmOptions,
}

impl SoftwareTransaction {
    pub fn new(pool: Arc<ConnectionPool>, options: StmOptions) -> Self {
        Self { pool, options }
    }

    /// Runs the callback against a fresh tracking context up to
    /// `retries + 1` times, re-invoking it whenever the commit conflicts.
    /// Errors raised by the callback itself propagate without retry.
    pub async fn transact<T, F, Fut>(&self, mut f: F) -> Result<T, ClientError>
    where
        F: FnMut(Txn) -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        let mut remaining = self.options.retries;
        loop {
            let txn = Txn::new(self.pool.clone(), self.options.isolation);

            if matches!(
                self.options.isolation,
                Isolation::Serializable | Isolation::SerializableSnapshot
            ) {
                for key in &self.options.prefetch {
                    let _ = txn.get(key.clone()).await;
                }
            }

            let value = f(txn.clone()).await?;
            match txn.commit().await {
                Ok(()) => return Ok(value),
                Err(ClientError::StmConflict) if remaining > 0 => {
                    debug!(remaining, "transaction conflicted; retrying");
                    remaining -= 1;
                }
                Err(error) => return Err(error),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_write_wins_per_key() {
        let mut state = TxnState::default();
        state.purge_existing_write(&Bytes::from_static(b"k"));
        state.writes.push(WriteOp::Put(PutRequest {
            key: Bytes::from_static(b"k"),
            value: Bytes::from_static(b"v1"),
            ..Default::default()
        }));
        state.purge_existing_write(&Bytes::from_static(b"k"));
        state.writes.push(WriteOp::Put(PutRequest {
            key: Bytes::from_static(b"k"),
            value: Bytes::from_static(b"v2"),
            ..Default::default()
        }));

        assert_eq!(state.writes.len(), 1);
        let pending = state
            .find_existing_write(&Bytes::from_static(b"k"))
            .unwrap();
        assert_eq!(&pending.kvs[0].value[..], b"v2");
    }

    #[test]
    fn test_pending_delete_is_visible_to_reads() {
        let mut state = TxnState::default();
        state.writes.push(WriteOp::DeleteKey(DeleteRangeRequest {
            key: Bytes::from_static(b"k"),
            ..Default::default()
        }));
        let pending = state
            .find_existing_write(&Bytes::from_static(b"k"))
            .unwrap();
        assert!(pending.kvs.is_empty());
    }

    #[test]
    fn test_range_delete_visible_for_included_keys() {
        let mut state = TxnState::default();
        let range = Range::prefix(&b"dir/"[..]);
        state.writes.push(WriteOp::DeleteRange(
            DeleteRangeRequest {
                key: range.start.clone(),
                range_end: Some(range.end.clone()),
                ..Default::default()
            },
            range,
        ));
        assert!(state
            .find_existing_write(&Bytes::from_static(b"dir/a"))
            .is_some());
        assert!(state
            .find_existing_write(&Bytes::from_static(b"other"))
            .is_none());
    }

    #[test]
    fn test_read_guard_recording() {
        let mut state = TxnState::default();
        let response = RangeResponse {
            kvs: vec![KeyValue {
                key: Bytes::from_static(b"k"),
                mod_revision: Revision(7),
                ..Default::default()
            }],
            count: 1,
            ..Default::default()
        };
        state.record_read(Bytes::from_static(b"k"), &response);
        state.record_read(Bytes::from_static(b"missing"), &RangeResponse::default());

        assert_eq!(state.completed.len(), 2);
        assert_eq!(state.completed[0].1, Revision(7));
        assert_eq!(state.completed[1].1, Revision::ZERO);
        assert_eq!(state.earliest_mod, Some(Revision(7)));
    }
}
