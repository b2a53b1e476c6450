//! Periodic reconciliation that deletes local replicas whose remote source
//! has disappeared. The watch-driven pipeline only ever sees events for
//! objects that still exist; anything deleted from the remote cluster while
//! this controller was down, or lost to a missed watch event, never
//! generates a `Delete` request. This sweep is what actually bounds replica
//! lifetime to source lifetime.

#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::fmt::Debug;
use std::time::Duration;

use kube::api::{Api, ListParams};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use xcc_core::ReplicationRequest;

type Key = (String, String);

/// Hands back control of a spawned cleaner loop. Dropping it without calling
/// [`CancelHandle::cancel`] leaves the loop running until the process exits.
pub struct CancelHandle {
    tx: Option<oneshot::Sender<()>>,
}

impl CancelHandle {
    pub fn cancel(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Lists `local` (already scoped to the follower label) and `remote` (scoped
/// to the source label), and returns the local objects with no counterpart
/// in `remote` by `(namespace, name)`.
///
/// A list failure on either side aborts the comparison for this tick rather
/// than returning partial results: treating a failed remote list as "empty"
/// would delete every local replica on a transient API hiccup.
async fn orphans<K>(
    local: &Api<K>,
    local_lp: &ListParams,
    remote: &Api<K>,
    remote_lp: &ListParams,
) -> anyhow::Result<Vec<K>>
where
    K: Resource + Clone + Debug + DeserializeOwned,
{
    let local_objs = local.list(local_lp).await?.items;
    let remote_keys: HashSet<Key> = remote
        .list(remote_lp)
        .await?
        .items
        .iter()
        .map(|o| (o.namespace().unwrap_or_default(), o.name_any()))
        .collect();

    Ok(local_objs
        .into_iter()
        .filter(|o| {
            let key = (o.namespace().unwrap_or_default(), o.name_any());
            !remote_keys.contains(&key)
        })
        .collect())
}

async fn sweep<K>(
    local: &Api<K>,
    local_lp: &ListParams,
    remote: &Api<K>,
    remote_lp: &ListParams,
    tx: &mpsc::Sender<ReplicationRequest<K>>,
    kind: &str,
) where
    K: Resource + Clone + Debug + DeserializeOwned,
{
    match orphans(local, local_lp, remote, remote_lp).await {
        Ok(orphans) => {
            if orphans.is_empty() {
                debug!(kind, "cleaner tick found no orphans");
                return;
            }
            info!(kind, count = orphans.len(), "cleaner found orphaned replicas");
            metrics::counter!("xcc_cleaner_orphans_found_total", orphans.len() as u64);
            for obj in orphans {
                if tx.send(ReplicationRequest::orphan_delete(obj)).await.is_err() {
                    warn!(kind, "writer channel closed, aborting cleaner tick");
                    return;
                }
            }
        }
        Err(err) => {
            error!(kind, error = %err, "cleaner list failed, skipping this tick");
            metrics::counter!("xcc_cleaner_list_failures_total", 1u64);
        }
    }
}

/// Runs the periodic orphan sweep for one resource kind until cancelled.
/// `local_selector`/`remote_selector` are label selector strings (e.g.
/// `"fair.com/cross-cluster=follower"`); `namespace` restricts both sides to
/// a single namespace, or `None` for cluster-wide.
pub async fn run_cleaner<K>(
    local: Client,
    remote: Client,
    namespace: Option<String>,
    local_selector: String,
    remote_selector: String,
    interval: Duration,
    tx: mpsc::Sender<ReplicationRequest<K>>,
    mut stop: oneshot::Receiver<()>,
) where
    K: Resource<DynamicType = ()> + Clone + Debug + DeserializeOwned + Send + Sync + 'static,
{
    let local_api: Api<K> = match &namespace {
        Some(ns) => Api::namespaced(local, ns),
        None => Api::all(local),
    };
    let remote_api: Api<K> = match &namespace {
        Some(ns) => Api::namespaced(remote, ns),
        None => Api::all(remote),
    };
    let local_lp = ListParams::default().labels(&local_selector);
    let remote_lp = ListParams::default().labels(&remote_selector);
    let kind_name = std::any::type_name::<K>();

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                sweep(&local_api, &local_lp, &remote_api, &remote_lp, &tx, kind_name).await;
            }
            _ = &mut stop => {
                info!(kind = kind_name, "cleaner stopping");
                return;
            }
        }
    }
}

/// Spawns [`run_cleaner`] on the current runtime and returns a handle that
/// cancels it.
pub fn spawn_cleaner<K>(
    local: Client,
    remote: Client,
    namespace: Option<String>,
    local_selector: String,
    remote_selector: String,
    interval: Duration,
    tx: mpsc::Sender<ReplicationRequest<K>>,
) -> CancelHandle
where
    K: Resource<DynamicType = ()> + Clone + Debug + DeserializeOwned + Send + Sync + 'static,
{
    let (cancel_tx, cancel_rx) = oneshot::channel();
    tokio::spawn(run_cleaner(
        local,
        remote,
        namespace,
        local_selector,
        remote_selector,
        interval,
        tx,
        cancel_rx,
    ));
    CancelHandle { tx: Some(cancel_tx) }
}
