//! Adapts a `kube::runtime::watcher` event stream into a typed, bounded
//! stream of replication requests.
//!
//! The watcher's `Event::Apply` variant collapses "first time I've seen
//! this key" and "I've seen this key before" into one signal (it folds
//! list + watch + relist into a single stream and cannot itself distinguish
//! create from update across a relist boundary). The reader recovers that
//! distinction with a per-key seen-set, which is this crate's Rust-shaped
//! restatement of the informer's separate add/update callbacks.
//!
//! `Event::Init`/`InitApply`/`InitDone` bracket a (re)list: `Init` starts
//! the cycle, `InitApply` arrives once per object already present on the
//! server, and `InitDone` closes it out. None of the three surface as
//! replication requests — they only rebuild the seen-set so that the next
//! live `Apply` for an already-known key is correctly classified as an
//! Update rather than a duplicate Add.

use std::collections::HashSet;

use futures::TryStreamExt;
use kube::api::Api;
use kube::runtime::watcher::{self, Event};
use kube::ResourceExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use xcc_core::{RequestKind, ReplicationRequest};

type Key = (String, String);

fn key_of<K>(obj: &K) -> Key
where
    K: kube::Resource,
    K::DynamicType: Default,
{
    (obj.namespace().unwrap_or_default(), obj.name_any())
}

/// Run a single reader to completion (i.e. until the watch stream ends or
/// errors). Callers spawn this per-kind (Service, Endpoints) and treat
/// stream termination as fatal: the controller is expected to exit and let
/// its supervisor (or the next leader) restart it.
pub async fn run_reader<K>(
    api: Api<K>,
    cfg: watcher::Config,
    tx: mpsc::Sender<ReplicationRequest<K>>,
) -> Result<(), watcher::Error>
where
    K: kube::Resource + Clone + std::fmt::Debug + Send + Sync + 'static,
    K::DynamicType: Default,
{
    let mut seen: HashSet<Key> = HashSet::new();
    let stream = watcher::watcher(api, cfg);
    futures::pin_mut!(stream);

    while let Some(ev) = stream.try_next().await? {
        match ev {
            Event::Init => {
                seen.clear();
            }
            Event::InitApply(obj) => {
                seen.insert(key_of(&obj));
            }
            Event::InitDone => {
                debug!(count = seen.len(), "watch (re)list complete");
            }
            Event::Apply(obj) => {
                let key = key_of(&obj);
                let kind = if seen.insert(key) { RequestKind::Add } else { RequestKind::Update };
                if tx.send(ReplicationRequest::new(kind, Some(obj))).await.is_err() {
                    warn!("reader channel closed, stopping");
                    break;
                }
            }
            Event::Delete(obj) => {
                let key = key_of(&obj);
                seen.remove(&key);
                if tx.send(ReplicationRequest::new(RequestKind::Delete, Some(obj))).await.is_err() {
                    warn!("reader channel closed, stopping");
                    break;
                }
            }
        }
    }
    info!("watcher stream ended");
    Ok(())
}
