//! Request/response message shapes for the KV, Watch, Lease and Auth
//! services.
//!
//! Optional fields are skipped when absent so payloads stay minimal; etcd
//! treats absent and default-valued fields identically.

use crate::kv::{i64_string, Event, KeyValue, LeaseId, ResponseHeader, Revision};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

fn is_false(v: &bool) -> bool {
    !*v
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortOrder {
    #[serde(rename = "NONE")]
    None,
    #[serde(rename = "ASCEND")]
    Ascend,
    #[serde(rename = "DESCEND")]
    Descend,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortTarget {
    #[serde(rename = "KEY")]
    Key,
    #[serde(rename = "VERSION")]
    Version,
    #[serde(rename = "CREATE")]
    Create,
    #[serde(rename = "MOD")]
    Mod,
    #[serde(rename = "VALUE")]
    Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RangeRequest {
    pub key: Bytes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range_end: Option<Bytes>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<Revision>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort_order: Option<SortOrder>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort_target: Option<SortTarget>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub serializable: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub keys_only: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub count_only: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_mod_revision: Option<Revision>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_mod_revision: Option<Revision>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_create_revision: Option<Revision>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_create_revision: Option<Revision>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RangeResponse {
    pub header: ResponseHeader,
    pub kvs: Vec<KeyValue>,
    pub more: bool,
    #[serde(with = "i64_string")]
    pub count: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PutRequest {
    pub key: Bytes,
    pub value: Bytes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease: Option<LeaseId>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub prev_kv: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub ignore_value: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub ignore_lease: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PutResponse {
    pub header: ResponseHeader,
    pub prev_kv: Option<KeyValue>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeleteRangeRequest {
    pub key: Bytes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range_end: Option<Bytes>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub prev_kv: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeleteRangeResponse {
    pub header: ResponseHeader,
    #[serde(with = "i64_string")]
    pub deleted: i64,
    pub prev_kvs: Vec<KeyValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareResult {
    #[serde(rename = "EQUAL")]
    Equal,
    #[serde(rename = "GREATER")]
    Greater,
    #[serde(rename = "LESS")]
    Less,
    #[serde(rename = "NOT_EQUAL")]
    NotEqual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareTarget {
    #[serde(rename = "VERSION")]
    Version,
    #[serde(rename = "CREATE")]
    Create,
    #[serde(rename = "MOD")]
    Mod,
    #[serde(rename = "VALUE")]
    Value,
    #[serde(rename = "LEASE")]
    Lease,
}

/// One guard clause in a conditional transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Compare {
    pub result: CompareResult,
    pub target: CompareTarget,
    pub key: Bytes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_revision: Option<Revision>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mod_revision: Option<Revision>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Bytes>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease: Option<LeaseId>,
}

impl Compare {
    pub fn create_revision(key: impl Into<Bytes>, result: CompareResult, rev: Revision) -> Self {
        Self {
            result,
            target: CompareTarget::Create,
            key: key.into(),
            version: None,
            create_revision: Some(rev),
            mod_revision: None,
            value: None,
            lease: None,
        }
    }

    pub fn mod_revision(key: impl Into<Bytes>, result: CompareResult, rev: Revision) -> Self {
        Self {
            result,
            target: CompareTarget::Mod,
            key: key.into(),
            version: None,
            create_revision: None,
            mod_revision: Some(rev),
            value: None,
            lease: None,
        }
    }

    pub fn value(key: impl Into<Bytes>, result: CompareResult, value: impl Into<Bytes>) -> Self {
        Self {
            result,
            target: CompareTarget::Value,
            key: key.into(),
            version: None,
            create_revision: None,
            mod_revision: None,
            value: Some(value.into()),
            lease: None,
        }
    }
}

/// An operation in a transaction's success or failure branch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestOp {
    RequestRange(RangeRequest),
    RequestPut(PutRequest),
    RequestDeleteRange(DeleteRangeRequest),
    RequestTxn(Box<TxnRequest>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseOp {
    ResponseRange(RangeResponse),
    ResponsePut(PutResponse),
    ResponseDeleteRange(DeleteRangeResponse),
    ResponseTxn(Box<TxnResponse>),
}

impl ResponseOp {
    pub fn into_range(self) -> Option<RangeResponse> {
        match self {
            ResponseOp::ResponseRange(r) => Some(r),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TxnRequest {
    pub compare: Vec<Compare>,
    pub success: Vec<RequestOp>,
    pub failure: Vec<RequestOp>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TxnResponse {
    pub header: ResponseHeader,
    pub succeeded: bool,
    pub responses: Vec<ResponseOp>,
}

/// Event kinds a watcher can ask the server to withhold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WatchFilter {
    #[serde(rename = "NOPUT")]
    NoPut,
    #[serde(rename = "NODELETE")]
    NoDelete,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchCreateRequest {
    pub key: Bytes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range_end: Option<Bytes>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_revision: Option<Revision>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub progress_notify: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<WatchFilter>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub prev_kv: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchCancelRequest {
    #[serde(with = "i64_string")]
    pub watch_id: i64,
}

/// A frame written to the watch stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchRequest {
    CreateRequest(WatchCreateRequest),
    CancelRequest(WatchCancelRequest),
}

/// A frame read from the watch stream.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchResponse {
    pub header: ResponseHeader,
    #[serde(with = "i64_string")]
    pub watch_id: i64,
    pub created: bool,
    pub canceled: bool,
    pub compact_revision: Option<Revision>,
    pub cancel_reason: Option<String>,
    pub events: Vec<Event>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseGrantRequest {
    #[serde(rename = "TTL", with = "i64_string")]
    pub ttl: i64,
    #[serde(rename = "ID", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<LeaseId>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseGrantResponse {
    pub header: ResponseHeader,
    #[serde(rename = "ID")]
    pub id: LeaseId,
    #[serde(rename = "TTL", with = "i64_string")]
    pub ttl: i64,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseRevokeRequest {
    #[serde(rename = "ID")]
    pub id: LeaseId,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseRevokeResponse {
    pub header: ResponseHeader,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseKeepAliveRequest {
    #[serde(rename = "ID")]
    pub id: LeaseId,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseKeepAliveResponse {
    pub header: ResponseHeader,
    #[serde(rename = "ID")]
    pub id: LeaseId,
    #[serde(rename = "TTL", with = "i64_string")]
    pub ttl: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthenticateRequest {
    pub name: String,
    pub password: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthenticateResponse {
    pub header: ResponseHeader,
    pub token: String,
}
