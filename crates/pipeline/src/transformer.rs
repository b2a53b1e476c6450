//! The generic transformer chain: a left-fold over boxed transformers that
//! short-circuits (dropping the request, not the pipeline) on the first
//! error.

use async_trait::async_trait;
use tokio::sync::mpsc;
use xcc_core::ReplicationRequest;

#[async_trait]
pub trait Transformer<K>: Send + Sync {
    async fn apply(&self, req: &mut ReplicationRequest<K>) -> anyhow::Result<()>;
}

pub struct Pipeline<K> {
    transformers: Vec<Box<dyn Transformer<K>>>,
}

impl<K> Pipeline<K>
where
    K: Send + 'static,
{
    pub fn new(transformers: Vec<Box<dyn Transformer<K>>>) -> Self {
        Self { transformers }
    }

    /// Drive requests from `rx` through the chain to `tx` until `rx` closes.
    /// A request that fails any transformer is logged, counted, and
    /// dropped; subsequent requests are unaffected.
    pub async fn run(
        self,
        mut rx: mpsc::Receiver<ReplicationRequest<K>>,
        tx: mpsc::Sender<ReplicationRequest<K>>,
    ) {
        while let Some(mut req) = rx.recv().await {
            let mut failed = false;
            for t in &self.transformers {
                if let Err(err) = t.apply(&mut req).await {
                    tracing::warn!(error = %err, "pipeline transformer failed, dropping request");
                    metrics::counter!("xcc_pipeline_drops_total", 1u64);
                    failed = true;
                    break;
                }
            }
            if !failed && tx.send(req).await.is_err() {
                tracing::warn!("pipeline output channel closed, stopping");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Service;
    use xcc_core::RequestKind;

    struct AlwaysFail;
    #[async_trait]
    impl Transformer<Service> for AlwaysFail {
        async fn apply(&self, _req: &mut ReplicationRequest<Service>) -> anyhow::Result<()> {
            anyhow::bail!("boom")
        }
    }

    struct TagIt(&'static str);
    #[async_trait]
    impl Transformer<Service> for TagIt {
        async fn apply(&self, req: &mut ReplicationRequest<Service>) -> anyhow::Result<()> {
            let mut svc = req.local.take().unwrap_or_default();
            let labels = svc.metadata.labels.get_or_insert_with(Default::default);
            labels.insert("tag".into(), self.0.into());
            req.local = Some(svc);
            Ok(())
        }
    }

    #[tokio::test]
    async fn failing_transformer_drops_request_without_poisoning_the_chain() {
        let (in_tx, in_rx) = mpsc::channel(4);
        let (out_tx, mut out_rx) = mpsc::channel(4);
        let pipeline = Pipeline::new(vec![Box::new(AlwaysFail)]);
        tokio::spawn(pipeline.run(in_rx, out_tx));

        in_tx
            .send(ReplicationRequest::new(RequestKind::Add, Some(Service::default())))
            .await
            .unwrap();
        drop(in_tx);

        assert!(out_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn successful_chain_forwards_in_order() {
        let (in_tx, in_rx) = mpsc::channel(4);
        let (out_tx, mut out_rx) = mpsc::channel(4);
        let pipeline = Pipeline::new(vec![Box::new(TagIt("a")), Box::new(TagIt("b"))]);
        tokio::spawn(pipeline.run(in_rx, out_tx));

        in_tx
            .send(ReplicationRequest::new(RequestKind::Add, Some(Service::default())))
            .await
            .unwrap();
        drop(in_tx);

        let out = out_rx.recv().await.unwrap();
        let labels = out.local.unwrap().metadata.labels.unwrap();
        assert_eq!(labels.get("tag").map(String::as_str), Some("b"));
    }
}
