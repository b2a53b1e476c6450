//! Shared data model for the cross-cluster replicator: request envelopes and
//! label constants. Kept dependency-light (serde + k8s-openapi only) since
//! every other crate in the workspace depends on this one.

#![forbid(unsafe_code)]

use k8s_openapi::api::core::v1::{Endpoints, Service};
use serde::{Deserialize, Serialize};

/// Label key carried by both the remote source object and the local replica;
/// only the value differs.
pub const LABEL_KEY: &str = "fair.com/cross-cluster";
/// Value on the remote object that opts it into replication.
pub const LABEL_VALUE_SOURCE: &str = "true";
/// Value stamped onto every local replica by the label transformer.
pub const LABEL_VALUE_FOLLOWER: &str = "follower";

/// A Service snapshot is, byte for byte, the real wire type — whitelisting
/// and labeling mutate a `Service` directly rather than a shadow schema.
pub type ServiceSnapshot = Service;
/// Likewise for Endpoints.
pub type EndpointsSnapshot = Endpoints;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RequestKind {
    Add,
    Update,
    Delete,
}

/// A unit of replication work flowing Reader -> Pipeline -> Writer.
///
/// `remote` is `None` only for requests synthesized by the cleaner (there is
/// no remote object to point at, only a local one known to be orphaned).
/// `local` starts `None` and is populated by the augmenter.
#[derive(Debug, Clone)]
pub struct ReplicationRequest<T> {
    pub kind: RequestKind,
    pub remote: Option<T>,
    pub local: Option<T>,
}

impl<T> ReplicationRequest<T> {
    pub fn new(kind: RequestKind, remote: Option<T>) -> Self {
        Self { kind, remote, local: None }
    }

    /// Build a cleaner-originated delete request: no remote counterpart,
    /// only the local object known to be orphaned.
    pub fn orphan_delete(local: T) -> Self {
        Self { kind: RequestKind::Delete, remote: None, local: Some(local) }
    }
}

pub type ServiceReplicationRequest = ReplicationRequest<ServiceSnapshot>;
pub type EndpointsReplicationRequest = ReplicationRequest<EndpointsSnapshot>;

impl ServiceReplicationRequest {
    pub fn key(&self) -> Option<(String, String)> {
        key_of(self.remote.as_ref()).or_else(|| key_of(self.local.as_ref()))
    }
}

impl EndpointsReplicationRequest {
    pub fn key(&self) -> Option<(String, String)> {
        key_of_eps(self.remote.as_ref()).or_else(|| key_of_eps(self.local.as_ref()))
    }
}

fn key_of(svc: Option<&ServiceSnapshot>) -> Option<(String, String)> {
    let svc = svc?;
    let meta = &svc.metadata;
    Some((meta.namespace.clone()?, meta.name.clone()?))
}

fn key_of_eps(eps: Option<&EndpointsSnapshot>) -> Option<(String, String)> {
    let eps = eps?;
    let meta = &eps.metadata;
    Some((meta.namespace.clone()?, meta.name.clone()?))
}

pub mod prelude {
    pub use super::{
        EndpointsReplicationRequest, EndpointsSnapshot, RequestKind, ServiceReplicationRequest,
        ServiceSnapshot, LABEL_KEY, LABEL_VALUE_FOLLOWER, LABEL_VALUE_SOURCE,
    };
}
