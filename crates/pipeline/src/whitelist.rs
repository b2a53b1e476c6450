//! Projects `req.remote` onto `req.local`, touching only the fields the
//! local cluster is allowed to receive. Everything else already on
//! `req.local` (server-assigned identity fetched by the augmenter, or
//! nothing at all on Add) is left exactly as is.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Endpoints, Service};
use xcc_core::RequestKind;

use crate::transformer::Transformer;
use xcc_core::ReplicationRequest;

pub struct ServiceWhitelist;

#[async_trait]
impl Transformer<Service> for ServiceWhitelist {
    async fn apply(&self, req: &mut ReplicationRequest<Service>) -> anyhow::Result<()> {
        if matches!(req.kind, RequestKind::Delete) {
            return Ok(());
        }
        let remote = req.remote.as_ref().ok_or_else(|| anyhow::anyhow!("whitelist requires a remote object"))?;
        let mut local = req.local.take().unwrap_or_default();

        local.metadata.name = remote.metadata.name.clone();
        local.metadata.namespace = remote.metadata.namespace.clone();
        local.metadata.labels = remote.metadata.labels.clone();

        if let Some(remote_spec) = &remote.spec {
            let local_spec = local.spec.get_or_insert_with(Default::default);
            local_spec.ports = remote_spec.ports.clone();
            local_spec.session_affinity = remote_spec.session_affinity.clone();
        }

        req.local = Some(local);
        Ok(())
    }
}

pub struct EndpointsWhitelist;

#[async_trait]
impl Transformer<Endpoints> for EndpointsWhitelist {
    async fn apply(&self, req: &mut ReplicationRequest<Endpoints>) -> anyhow::Result<()> {
        if matches!(req.kind, RequestKind::Delete) {
            return Ok(());
        }
        let remote = req.remote.as_ref().ok_or_else(|| anyhow::anyhow!("whitelist requires a remote object"))?;
        let mut local = req.local.take().unwrap_or_default();

        local.metadata.name = remote.metadata.name.clone();
        local.metadata.namespace = remote.metadata.namespace.clone();
        local.metadata.labels = remote.metadata.labels.clone();
        local.subsets = remote.subsets.clone();

        req.local = Some(local);
        Ok(())
    }
}
