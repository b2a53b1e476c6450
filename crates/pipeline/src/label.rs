//! Stamps the follower label onto `req.local`, overwriting any value
//! whitelisted in from the remote object's label map. Runs last so nothing
//! downstream can un-set it.

use async_trait::async_trait;
use kube::Resource;
use xcc_core::{RequestKind, ReplicationRequest, LABEL_KEY, LABEL_VALUE_FOLLOWER};

use crate::transformer::Transformer;

pub struct Label;

#[async_trait]
impl<K> Transformer<K> for Label
where
    K: Resource<DynamicType = ()> + Send + Sync,
{
    async fn apply(&self, req: &mut ReplicationRequest<K>) -> anyhow::Result<()> {
        if matches!(req.kind, RequestKind::Delete) {
            return Ok(());
        }
        let local = req
            .local
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("label transformer requires local populated upstream"))?;
        let labels = local.meta_mut().labels.get_or_insert_with(Default::default);
        labels.insert(LABEL_KEY.to_string(), LABEL_VALUE_FOLLOWER.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Service;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn overwrites_true_with_follower() {
        let mut local = Service::default();
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_KEY.to_string(), "true".to_string());
        local.metadata.labels = Some(labels);

        let mut req = ReplicationRequest::new(RequestKind::Add, Some(Service::default()));
        req.local = Some(local);

        Label.apply(&mut req).await.unwrap();

        let labels = req.local.unwrap().metadata.labels.unwrap();
        assert_eq!(labels.get(LABEL_KEY).map(String::as_str), Some(LABEL_VALUE_FOLLOWER));
    }

    #[tokio::test]
    async fn idempotent() {
        let mut req = ReplicationRequest::new(RequestKind::Add, Some(Service::default()));
        req.local = Some(Service::default());

        Label.apply(&mut req).await.unwrap();
        let after_first = req.local.clone();
        Label.apply(&mut req).await.unwrap();

        assert_eq!(req.local.unwrap().metadata.labels, after_first.unwrap().metadata.labels);
    }
}
