//! Populates `req.local` with the object the remaining transformers need to
//! compute a projection against.

use std::marker::PhantomData;

use anyhow::Context;
use async_trait::async_trait;
use kube::api::Api;
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use std::fmt::Debug;

use crate::transformer::Transformer;
use xcc_core::{RequestKind, ReplicationRequest};

/// Generic over the replicated kind (`Service` or `Endpoints`): both are
/// looked up the same way, by `(namespace, name)` against the local
/// cluster.
pub struct Augmenter<K> {
    client: Client,
    _marker: PhantomData<fn() -> K>,
}

impl<K> Augmenter<K> {
    pub fn new(client: Client) -> Self {
        Self { client, _marker: PhantomData }
    }
}

#[async_trait]
impl<K> Transformer<K> for Augmenter<K>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Default + Send + Sync + 'static,
{
    async fn apply(&self, req: &mut ReplicationRequest<K>) -> anyhow::Result<()> {
        match req.kind {
            RequestKind::Add => {
                req.local = Some(K::default());
            }
            RequestKind::Delete => {
                req.local = req.remote.clone();
            }
            RequestKind::Update => {
                let remote = req.remote.as_ref().context("update request missing remote object")?;
                let namespace = remote.namespace().context("remote object missing metadata.namespace")?;
                let name = remote.name_any();
                let api: Api<K> = Api::namespaced(self.client.clone(), &namespace);
                match api.get_opt(&name).await.context("fetching local counterpart")? {
                    Some(local) => {
                        req.local = Some(local);
                    }
                    None => {
                        // Self-healing path: the local replica is missing
                        // (deleted out of band, or never created). Demote to
                        // Add so the writer creates it instead of replacing.
                        req.kind = RequestKind::Add;
                        req.local = Some(K::default());
                    }
                }
            }
        }
        Ok(())
    }
}
