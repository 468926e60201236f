//! Tether Proto: the etcd v3 wire message model.
//!
//! This crate carries the request/response shapes exchanged with etcd's
//! KV/Watch/Lease/Auth services as plain serde types. The actual encoding is
//! an opaque codec boundary owned by the transport: payloads cross it as
//! JSON values, with 64-bit revisions, lease ids and TTLs serialized as
//! decimal strings so they survive JSON number precision.
//!
//! Keys and values are opaque byte strings ([`bytes::Bytes`]).

pub mod kv;
pub mod messages;
pub mod service;

pub use kv::{Event, EventType, KeyValue, LeaseId, ResponseHeader, Revision};
pub use messages::{
    AuthenticateRequest, AuthenticateResponse, Compare, CompareResult, CompareTarget,
    DeleteRangeRequest, DeleteRangeResponse, LeaseGrantRequest, LeaseGrantResponse,
    LeaseKeepAliveRequest, LeaseKeepAliveResponse, LeaseRevokeRequest, LeaseRevokeResponse,
    PutRequest, PutResponse, RangeRequest, RangeResponse, RequestOp, ResponseOp, SortOrder,
    SortTarget, TxnRequest, TxnResponse, WatchCancelRequest, WatchCreateRequest, WatchFilter,
    WatchRequest, WatchResponse,
};
pub use service::{methods, Service};
