//! Error taxonomy for the client runtime.
//!
//! Three classes share one enum: transport errors (recoverable, eligible for
//! host failover and circuit-breaker counting), application errors returned
//! by etcd (surfaced verbatim or specially handled), and errors synthesized
//! by the policy/client layer itself, which signal that a call was never
//! attempted or was given up by design.

use std::time::Duration;
use tether_core_resilience::PolicyError;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ClientError {
    // ---- transport ----
    #[error("grpc call cancelled: {0}")]
    GrpcCancelled(String),
    #[error("unknown grpc error: {0}")]
    GrpcUnknown(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),
    #[error("aborted: {0}")]
    Aborted(String),
    #[error("out of range: {0}")]
    OutOfRange(String),
    #[error("not implemented: {0}")]
    NotImplemented(String),
    #[error("internal grpc error: {0}")]
    Internal(String),
    #[error("host unavailable: {0}")]
    Unavailable(String),
    #[error("data loss: {0}")]
    DataLoss(String),
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),
    #[error("failed to connect: {0}")]
    ConnectFailed(String),

    // ---- application ----
    #[error("etcd error: {0}")]
    Etcd(String),
    #[error("lease is expired or revoked: {0}")]
    LeaseInvalid(String),
    #[error("role already exists: {0}")]
    RoleExists(String),
    #[error("user already exists: {0}")]
    UserExists(String),
    #[error("role is not granted to the user: {0}")]
    RoleNotGranted(String),
    #[error("role not found: {0}")]
    RoleNotFound(String),
    #[error("user not found: {0}")]
    UserNotFound(String),
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("invalid auth token: {0}")]
    InvalidAuthToken(String),
    #[error("failed to acquire lock: {0}")]
    LockFailed(String),

    // ---- synthesized by this layer ----
    #[error("execution prevented because the circuit breaker is open")]
    BrokenCircuit,
    #[error("execution prevented because the circuit breaker is isolated")]
    IsolatedCircuit,
    #[error("the operation was cancelled")]
    TaskCancelled,
    #[error("execution rejected because the bulkhead queue is full")]
    BulkheadRejected,
    #[error("the operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("the watch stream was unexpectedly ended")]
    WatchStreamEnded,
    #[error("this instance is not campaigning")]
    NotCampaigning,
    #[error("a conflict occurred executing the software transaction")]
    StmConflict,
    #[error("tried to call a {0} method after the client was closed")]
    ClientClosed(String),
    #[error("client runtime error: {0}")]
    ClientRuntime(String),
}

impl ClientError {
    /// Whether this is a network or server error that should trigger
    /// fault-handling: host failover, circuit-breaker counting and
    /// pool-level retry.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ClientError::GrpcCancelled(_)
                | ClientError::GrpcUnknown(_)
                | ClientError::DeadlineExceeded(_)
                | ClientError::ResourceExhausted(_)
                | ClientError::Aborted(_)
                | ClientError::Internal(_)
                | ClientError::Unavailable(_)
                | ClientError::ConnectFailed(_)
        )
    }
}

impl From<PolicyError<ClientError>> for ClientError {
    fn from(err: PolicyError<ClientError>) -> Self {
        match err {
            PolicyError::Inner(e) => e,
            PolicyError::BrokenCircuit => ClientError::BrokenCircuit,
            PolicyError::IsolatedCircuit => ClientError::IsolatedCircuit,
            PolicyError::TaskCancelled => ClientError::TaskCancelled,
            PolicyError::BulkheadRejected => ClientError::BulkheadRejected,
            PolicyError::Timeout(d) => ClientError::Timeout(d),
        }
    }
}

/// Known `etcdserver:` message fragments, consulted before the status code.
/// gRPC errors are untyped strings on the wire; this is the map back to
/// typed errors.
const MESSAGE_TABLE: &[(&str, fn(String) -> ClientError)] = &[
    ("etcdserver: role name already exists", ClientError::RoleExists),
    ("etcdserver: user name already exists", ClientError::UserExists),
    (
        "etcdserver: role is not granted to the user",
        ClientError::RoleNotGranted,
    ),
    ("etcdserver: role name not found", ClientError::RoleNotFound),
    ("etcdserver: user name not found", ClientError::UserNotFound),
    (
        "etcdserver: authentication failed, invalid user ID or password",
        ClientError::AuthenticationFailed,
    ),
    (
        "etcdserver: permission denied",
        ClientError::PermissionDenied,
    ),
    (
        "etcdserver: invalid auth token",
        ClientError::InvalidAuthToken,
    ),
    (
        "etcdserver: requested lease not found",
        ClientError::LeaseInvalid,
    ),
];

/// Converts a raw error message (e.g. a watch cancel reason) to a typed
/// error.
pub fn cast_error_message(message: &str) -> ClientError {
    for (fragment, ctor) in MESSAGE_TABLE {
        if message.contains(fragment) {
            return ctor(message.to_string());
        }
    }
    ClientError::Etcd(message.to_string())
}

/// Converts a gRPC status to a typed error: the message table is consulted
/// first (etcd reports application errors through generic codes), then the
/// status code.
pub fn cast_status(status: &tonic::Status) -> ClientError {
    let message = status.message();
    for (fragment, ctor) in MESSAGE_TABLE {
        if message.contains(fragment) {
            return ctor(message.to_string());
        }
    }

    let message = message.to_string();
    match status.code() {
        tonic::Code::Cancelled => ClientError::GrpcCancelled(message),
        tonic::Code::Unknown => ClientError::GrpcUnknown(message),
        tonic::Code::InvalidArgument => ClientError::InvalidArgument(message),
        tonic::Code::DeadlineExceeded => ClientError::DeadlineExceeded(message),
        tonic::Code::NotFound => ClientError::NotFound(message),
        tonic::Code::AlreadyExists => ClientError::AlreadyExists(message),
        tonic::Code::PermissionDenied => ClientError::PermissionDenied(message),
        tonic::Code::ResourceExhausted => ClientError::ResourceExhausted(message),
        tonic::Code::FailedPrecondition => ClientError::FailedPrecondition(message),
        tonic::Code::Aborted => ClientError::Aborted(message),
        tonic::Code::OutOfRange => ClientError::OutOfRange(message),
        tonic::Code::Unimplemented => ClientError::NotImplemented(message),
        tonic::Code::Internal => ClientError::Internal(message),
        tonic::Code::Unavailable => ClientError::Unavailable(message),
        tonic::Code::DataLoss => ClientError::DataLoss(message),
        tonic::Code::Unauthenticated => ClientError::Unauthenticated(message),
        _ if message.contains("etcdserver:") => ClientError::Etcd(message),
        _ => ClientError::GrpcUnknown(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_table_wins_over_code() {
        let status = tonic::Status::unknown("etcdserver: invalid auth token");
        assert!(matches!(
            cast_status(&status),
            ClientError::InvalidAuthToken(_)
        ));
    }

    #[test]
    fn test_code_mapping() {
        let status = tonic::Status::unavailable("connection refused");
        assert!(matches!(cast_status(&status), ClientError::Unavailable(_)));
    }

    #[test]
    fn test_recoverable_classification() {
        assert!(ClientError::Unavailable("x".into()).is_recoverable());
        assert!(ClientError::DeadlineExceeded("x".into()).is_recoverable());
        assert!(!ClientError::PermissionDenied("x".into()).is_recoverable());
        assert!(!ClientError::InvalidAuthToken("x".into()).is_recoverable());
        assert!(!ClientError::BrokenCircuit.is_recoverable());
    }

    #[test]
    fn test_unknown_etcdserver_message_is_etcd_error() {
        assert!(matches!(
            cast_error_message("etcdserver: some new condition"),
            ClientError::Etcd(_)
        ));
    }
}
