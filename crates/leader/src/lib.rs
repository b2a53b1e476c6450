//! Lease-based leader election. Only the holder of a `coordination.k8s.io`
//! `Lease` is allowed to talk to the remote cluster or write to the local
//! one; every other replica of this controller sits idle so that at most
//! one process ever drives replication for a given lease.

#![forbid(unsafe_code)]

use std::future::Future;
use std::time::Duration;

use kube::Client;
use kube_leader_election::{LeaseLock, LeaseLockParams};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// Identifies this process among peers contending for the same lease.
/// `<hostname>_<uuid>` so a crash-looping pod restarting with the same
/// hostname never collides with its own still-expiring lease record.
pub fn holder_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown-host".to_string());
    format!("{host}_{}", Uuid::new_v4())
}

pub struct LeaderElector {
    client: Client,
    namespace: String,
    lease_name: String,
    holder_id: String,
    lease_ttl: Duration,
}

impl LeaderElector {
    pub fn new(client: Client, namespace: impl Into<String>, lease_name: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            lease_name: lease_name.into(),
            holder_id: holder_id(),
            lease_ttl: Duration::from_secs(60),
        }
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    fn lock(&self) -> LeaseLock {
        LeaseLock::new(
            self.client.clone(),
            &self.namespace,
            LeaseLockParams {
                holder_id: self.holder_id.clone(),
                lease_name: self.lease_name.clone(),
                lease_ttl: self.lease_ttl,
            },
        )
    }

    /// Blocks until this process acquires the lease, polling every
    /// `retry_period`, or until `shutdown` fires.
    async fn acquire(&self, retry_period: Duration, shutdown: &CancellationToken) -> bool {
        loop {
            match self.lock().try_acquire_or_renew().await {
                Ok(lease) if lease.acquired_lease => return true,
                Ok(_) => {}
                Err(err) => warn!(error = %err, "leader election acquire attempt failed"),
            }
            tokio::select! {
                _ = tokio::time::sleep(retry_period) => {}
                _ = shutdown.cancelled() => return false,
            }
        }
    }

    /// Polls the lease every `renew_deadline` while held. Returns once the
    /// lease is lost, repeatedly fails to renew, or `shutdown` fires.
    async fn hold(&self, renew_deadline: Duration, shutdown: &CancellationToken) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(renew_deadline) => {}
                _ = shutdown.cancelled() => return,
            }
            match self.lock().try_acquire_or_renew().await {
                Ok(lease) if lease.acquired_lease => continue,
                Ok(_) => {
                    warn!("lost leadership");
                    return;
                }
                Err(err) => warn!(error = %err, "leader election renew failed"),
            }
        }
    }

    /// Alternates between waiting to acquire the lease and running
    /// `spawn_body` for as long as it is held, until `shutdown` fires.
    /// `spawn_body` receives a [`CancellationToken`] that fires the instant
    /// leadership is lost (or shutdown is requested), so the body can tear
    /// down in-flight work instead of fighting a second holder over the same
    /// objects.
    pub async fn run_while_leader<F, Fut>(
        &self,
        retry_period: Duration,
        renew_deadline: Duration,
        shutdown: CancellationToken,
        mut spawn_body: F,
    ) where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        while !shutdown.is_cancelled() {
            if !self.acquire(retry_period, &shutdown).await {
                break;
            }
            info!(holder_id = %self.holder_id, "acquired leadership");
            let token = shutdown.child_token();
            let task = tokio::spawn(spawn_body(token.clone()));

            self.hold(renew_deadline, &shutdown).await;
            token.cancel();
            if let Err(err) = task.await {
                warn!(error = %err, "leader body task panicked");
            }
        }
        info!("leader election loop stopped");
    }
}
