//! Shared test doubles: a scripted transport and a miniature in-memory
//! store implementing just enough of the wire contract for the client
//! layers under test.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tether_connect::{
    CallContext, ChannelDuplex, ClientError, Connector, DuplexStream, HostOptions, ServiceClient,
};
use tether_proto::{
    Compare, CompareResult, CompareTarget, DeleteRangeRequest, KeyValue, LeaseGrantRequest,
    LeaseGrantResponse, LeaseId, LeaseRevokeRequest, LeaseRevokeResponse, PutRequest, PutResponse,
    RangeRequest, RangeResponse, RequestOp, ResponseHeader, ResponseOp, Revision, Service,
    SortOrder, SortTarget, TxnRequest, TxnResponse,
};
use tokio::sync::mpsc;

/// One recorded unary call.
#[derive(Debug, Clone)]
pub struct CallRecord {
    pub address: String,
    pub service: Service,
    pub method: String,
    pub payload: Value,
    pub token: Option<String>,
}

pub type UnaryHandler =
    Arc<dyn Fn(&CallRecord) -> Result<Value, ClientError> + Send + Sync>;
pub type StreamHandler =
    Arc<dyn Fn(&str, Service, &str) -> Result<DuplexStream, ClientError> + Send + Sync>;

/// A connector whose clients route every call through scripted handlers.
pub struct MockTransport {
    pub calls: Arc<Mutex<Vec<CallRecord>>>,
    unary: UnaryHandler,
    stream: Option<StreamHandler>,
}

impl MockTransport {
    pub fn new(
        unary: impl Fn(&CallRecord) -> Result<Value, ClientError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            unary: Arc::new(unary),
            stream: None,
        })
    }

    pub fn with_streams(
        unary: impl Fn(&CallRecord) -> Result<Value, ClientError> + Send + Sync + 'static,
        stream: impl Fn(&str, Service, &str) -> Result<DuplexStream, ClientError>
            + Send
            + Sync
            + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            unary: Arc::new(unary),
            stream: Some(Arc::new(stream)),
        })
    }

    /// Addresses of every recorded call, in order.
    pub fn called_addresses(&self) -> Vec<String> {
        self.calls.lock().iter().map(|c| c.address.clone()).collect()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl Connector for MockTransport {
    async fn connect(
        &self,
        address: &str,
        service: Service,
        _options: &HostOptions,
    ) -> Result<Arc<dyn ServiceClient>, ClientError> {
        Ok(Arc::new(MockClient {
            address: address.to_string(),
            service,
            calls: self.calls.clone(),
            unary: self.unary.clone(),
            stream: self.stream.clone(),
        }))
    }
}

struct MockClient {
    address: String,
    service: Service,
    calls: Arc<Mutex<Vec<CallRecord>>>,
    unary: UnaryHandler,
    stream: Option<StreamHandler>,
}

#[async_trait]
impl ServiceClient for MockClient {
    async fn exec(
        &self,
        method: &str,
        payload: Value,
        ctx: &CallContext,
    ) -> Result<Value, ClientError> {
        let record = CallRecord {
            address: self.address.clone(),
            service: self.service,
            method: method.to_string(),
            payload,
            token: ctx.token.clone(),
        };
        self.calls.lock().push(record.clone());
        (self.unary)(&record)
    }

    async fn open_duplex(
        &self,
        method: &str,
        _ctx: &CallContext,
    ) -> Result<DuplexStream, ClientError> {
        match &self.stream {
            Some(handler) => handler(&self.address, self.service, method),
            None => Err(ClientError::ClientRuntime(
                "no stream handler configured".into(),
            )),
        }
    }
}

/// The server-side halves of a [`ChannelDuplex`]: requests written by the
/// client arrive on `requests`, and frames pushed into `frames` arrive at
/// the client.
pub struct ServerStream {
    pub service: Service,
    pub method: String,
    pub requests: mpsc::UnboundedReceiver<Value>,
    pub frames: mpsc::UnboundedSender<Result<Value, ClientError>>,
}

/// A stream handler accepting every stream and queueing the server halves
/// for the test to drive.
pub fn stream_acceptor() -> (StreamHandler, mpsc::UnboundedReceiver<ServerStream>) {
    let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
    let handler: StreamHandler = Arc::new(move |_address, service, method| {
        let (stream, requests, frames) = ChannelDuplex::new();
        let _ = accepted_tx.send(ServerStream {
            service,
            method: method.to_string(),
            requests,
            frames,
        });
        Ok(stream)
    });
    (handler, accepted_rx)
}

#[derive(Debug, Clone)]
struct StoredKv {
    value: Bytes,
    create_revision: i64,
    mod_revision: i64,
    version: i64,
    lease: i64,
}

#[derive(Default)]
struct StoreInner {
    revision: i64,
    lease_counter: i64,
    kvs: BTreeMap<Vec<u8>, StoredKv>,
}

/// A miniature single-revision etcd: enough of KV txn/range/put/delete and
/// lease grant/revoke semantics to exercise the client layers.
#[derive(Default)]
pub struct MemStore {
    inner: Mutex<StoreInner>,
}

impl MemStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A unary handler serving this store.
    pub fn handler(
        self: &Arc<Self>,
    ) -> impl Fn(&CallRecord) -> Result<Value, ClientError> + Send + Sync + 'static {
        let store = self.clone();
        move |record| store.dispatch(record)
    }

    /// Puts a value directly, simulating a concurrent external writer.
    pub fn put_external(&self, key: &[u8], value: &[u8]) {
        let mut inner = self.inner.lock();
        inner.revision += 1;
        let revision = inner.revision;
        apply_put(
            &mut inner,
            revision,
            &PutRequest {
                key: Bytes::copy_from_slice(key),
                value: Bytes::copy_from_slice(value),
                ..Default::default()
            },
        );
    }

    /// The current value of a key.
    pub fn get_value(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.inner
            .lock()
            .kvs
            .get(key)
            .map(|kv| kv.value.to_vec())
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.inner.lock().kvs.contains_key(key)
    }

    fn dispatch(&self, record: &CallRecord) -> Result<Value, ClientError> {
        match (record.service, record.method.as_str()) {
            (Service::Kv, "Range") => {
                let request: RangeRequest = parse(&record.payload)?;
                to_json(&self.range(&request))
            }
            (Service::Kv, "Put") => {
                let request: PutRequest = parse(&record.payload)?;
                let mut inner = self.inner.lock();
                inner.revision += 1;
                let revision = inner.revision;
                apply_put(&mut inner, revision, &request);
                to_json(&PutResponse {
                    header: header(revision),
                    prev_kv: None,
                })
            }
            (Service::Kv, "Txn") => {
                let request: TxnRequest = parse(&record.payload)?;
                to_json(&self.txn(&request))
            }
            (Service::Lease, "LeaseGrant") => {
                let request: LeaseGrantRequest = parse(&record.payload)?;
                let mut inner = self.inner.lock();
                inner.lease_counter += 1;
                let id = LeaseId(inner.lease_counter);
                to_json(&LeaseGrantResponse {
                    header: header(inner.revision),
                    id,
                    ttl: request.ttl,
                    error: String::new(),
                })
            }
            (Service::Lease, "LeaseRevoke") => {
                let request: LeaseRevokeRequest = parse(&record.payload)?;
                let mut inner = self.inner.lock();
                let owned: Vec<Vec<u8>> = inner
                    .kvs
                    .iter()
                    .filter(|(_, kv)| kv.lease == request.id.0)
                    .map(|(k, _)| k.clone())
                    .collect();
                if !owned.is_empty() {
                    inner.revision += 1;
                }
                for key in owned {
                    inner.kvs.remove(&key);
                }
                to_json(&LeaseRevokeResponse {
                    header: header(inner.revision),
                })
            }
            _ => Err(ClientError::NotImplemented(format!(
                "{}/{}",
                record.service, record.method
            ))),
        }
    }

    fn range(&self, request: &RangeRequest) -> RangeResponse {
        let inner = self.inner.lock();
        let mut matched: Vec<KeyValue> = inner
            .kvs
            .iter()
            .filter(|(key, _)| match &request.range_end {
                None => key.as_slice() == &request.key[..],
                Some(end) => {
                    key.as_slice() >= &request.key[..]
                        && (end[..] == [0] || key.as_slice() < &end[..])
                }
            })
            .filter(|(_, kv)| match request.max_create_revision {
                Some(max) => kv.create_revision <= max.0,
                None => true,
            })
            .map(|(key, kv)| stored_to_kv(key, kv))
            .collect();

        if let Some(SortTarget::Create) = request.sort_target {
            matched.sort_by_key(|kv| kv.create_revision);
            if request.sort_order == Some(SortOrder::Descend) {
                matched.reverse();
            }
        }

        let count = matched.len() as i64;
        if let Some(limit) = request.limit {
            matched.truncate(limit as usize);
        }

        RangeResponse {
            header: header(inner.revision),
            kvs: matched,
            more: false,
            count,
        }
    }

    fn txn(&self, request: &TxnRequest) -> TxnResponse {
        let mut inner = self.inner.lock();
        let succeeded = request.compare.iter().all(|cmp| eval_compare(&inner, cmp));

        let ops = if succeeded {
            &request.success
        } else {
            &request.failure
        };

        let mutates = ops.iter().any(|op| {
            matches!(
                op,
                RequestOp::RequestPut(_) | RequestOp::RequestDeleteRange(_)
            )
        });
        if mutates {
            inner.revision += 1;
        }
        let revision = inner.revision;

        let mut responses = Vec::new();
        for op in ops {
            match op {
                RequestOp::RequestPut(put) => {
                    apply_put(&mut inner, revision, put);
                    responses.push(ResponseOp::ResponsePut(PutResponse {
                        header: header(revision),
                        prev_kv: None,
                    }));
                }
                RequestOp::RequestDeleteRange(del) => {
                    let deleted = apply_delete(&mut inner, del);
                    responses.push(ResponseOp::ResponseDeleteRange(
                        tether_proto::DeleteRangeResponse {
                            header: header(revision),
                            deleted,
                            prev_kvs: Vec::new(),
                        },
                    ));
                }
                RequestOp::RequestRange(range) => {
                    drop(inner);
                    let response = self.range(range);
                    inner = self.inner.lock();
                    responses.push(ResponseOp::ResponseRange(response));
                }
                RequestOp::RequestTxn(_) => {}
            }
        }

        TxnResponse {
            header: header(inner.revision),
            succeeded,
            responses,
        }
    }
}

fn header(revision: i64) -> ResponseHeader {
    ResponseHeader {
        revision: Revision(revision),
        ..Default::default()
    }
}

fn stored_to_kv(key: &[u8], kv: &StoredKv) -> KeyValue {
    KeyValue {
        key: Bytes::copy_from_slice(key),
        value: kv.value.clone(),
        create_revision: Revision(kv.create_revision),
        mod_revision: Revision(kv.mod_revision),
        version: kv.version,
        lease: LeaseId(kv.lease),
    }
}

fn apply_put(inner: &mut StoreInner, revision: i64, request: &PutRequest) {
    inner
        .kvs
        .entry(request.key.to_vec())
        .and_modify(|kv| {
            kv.value = request.value.clone();
            kv.mod_revision = revision;
            kv.version += 1;
            if let Some(lease) = request.lease {
                kv.lease = lease.0;
            }
        })
        .or_insert_with(|| StoredKv {
            value: request.value.clone(),
            create_revision: revision,
            mod_revision: revision,
            version: 1,
            lease: request.lease.map(|l| l.0).unwrap_or(0),
        });
}

fn apply_delete(inner: &mut StoreInner, request: &DeleteRangeRequest) -> i64 {
    let keys: Vec<Vec<u8>> = inner
        .kvs
        .keys()
        .filter(|key| match &request.range_end {
            None => key.as_slice() == &request.key[..],
            Some(end) => {
                key.as_slice() >= &request.key[..]
                    && (end[..] == [0] || key.as_slice() < &end[..])
            }
        })
        .cloned()
        .collect();
    let deleted = keys.len() as i64;
    for key in keys {
        inner.kvs.remove(&key);
    }
    deleted
}

fn eval_compare(inner: &StoreInner, cmp: &Compare) -> bool {
    let kv = inner.kvs.get(&cmp.key[..]);
    let (actual, expected) = match cmp.target {
        CompareTarget::Mod => (
            kv.map(|kv| kv.mod_revision).unwrap_or(0),
            cmp.mod_revision.map(|r| r.0).unwrap_or(0),
        ),
        CompareTarget::Create => (
            kv.map(|kv| kv.create_revision).unwrap_or(0),
            cmp.create_revision.map(|r| r.0).unwrap_or(0),
        ),
        CompareTarget::Version => (
            kv.map(|kv| kv.version).unwrap_or(0),
            cmp.version.unwrap_or(0),
        ),
        _ => return true,
    };
    match cmp.result {
        CompareResult::Equal => actual == expected,
        CompareResult::Greater => actual > expected,
        CompareResult::Less => actual < expected,
        CompareResult::NotEqual => actual != expected,
    }
}

fn parse<T: serde::de::DeserializeOwned>(payload: &Value) -> Result<T, ClientError> {
    serde_json::from_value(payload.clone())
        .map_err(|e| ClientError::ClientRuntime(format!("mock failed to parse request: {e}")))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<Value, ClientError> {
    serde_json::to_value(value)
        .map_err(|e| ClientError::ClientRuntime(format!("mock failed to encode response: {e}")))
}
