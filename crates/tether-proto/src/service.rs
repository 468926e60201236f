//! The etcd v3 gRPC services and their method names.

use std::fmt;

/// A service exposed by every etcd server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Service {
    Kv,
    Watch,
    Lease,
    Auth,
    Cluster,
    Maintenance,
}

impl Service {
    /// Service name as it appears in the `etcdserverpb` package.
    pub fn name(&self) -> &'static str {
        match self {
            Service::Kv => "KV",
            Service::Watch => "Watch",
            Service::Lease => "Lease",
            Service::Auth => "Auth",
            Service::Cluster => "Cluster",
            Service::Maintenance => "Maintenance",
        }
    }

    /// Full gRPC path for a method on this service.
    pub fn method_path(&self, method: &str) -> String {
        format!("/etcdserverpb.{}/{}", self.name(), method)
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Unary and streaming method names, kept in one place so call sites and
/// mocks agree on spelling.
pub mod methods {
    pub const RANGE: &str = "Range";
    pub const PUT: &str = "Put";
    pub const DELETE_RANGE: &str = "DeleteRange";
    pub const TXN: &str = "Txn";

    pub const WATCH: &str = "Watch";

    pub const LEASE_GRANT: &str = "LeaseGrant";
    pub const LEASE_REVOKE: &str = "LeaseRevoke";
    pub const LEASE_KEEP_ALIVE: &str = "LeaseKeepAlive";

    pub const AUTHENTICATE: &str = "Authenticate";
}
