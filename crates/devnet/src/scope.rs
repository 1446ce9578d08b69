//! Scoped cluster lifetimes.

use std::future::Future;
use std::ops::Deref;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use devnet_common::{DevnetError, DevnetResult};
use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::cluster::{Cluster, ClusterPhase};
use crate::endpoints::NetworkConfig;

/// Poll interval while a dropped guard waits for an in-flight operation.
const BUSY_POLL: Duration = Duration::from_millis(100);

/// Owns a cluster and removes it exactly once.
///
/// Call [`ClusterGuard::close`] to remove the cluster and observe the result.
/// Dropping an unclosed guard inside a tokio runtime spawns the removal in
/// the background and logs its outcome.
#[derive(Debug)]
pub struct ClusterGuard {
    cluster: Arc<Cluster>,
    armed: bool,
}

impl ClusterGuard {
    /// Guard `cluster`.
    #[must_use]
    pub const fn new(cluster: Arc<Cluster>) -> Self {
        Self {
            cluster,
            armed: true,
        }
    }

    /// Remove the cluster.
    ///
    /// If another lifecycle operation is in flight the guard stays armed and
    /// the removal runs in the background once that operation settles.
    ///
    /// # Errors
    ///
    /// Whatever [`Cluster::remove`] returns.
    pub async fn close(mut self) -> DevnetResult<()> {
        let result = self.cluster.remove().await;
        if !matches!(result, Err(DevnetError::InvalidState { .. })) {
            self.armed = false;
        }
        result
    }
}

impl Deref for ClusterGuard {
    type Target = Cluster;

    fn deref(&self) -> &Cluster {
        &self.cluster
    }
}

impl Drop for ClusterGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        let cluster = Arc::clone(&self.cluster);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::debug!(cluster = %cluster.name(), "Guard dropped, removing cluster in the background");
                handle.spawn(async move {
                    match remove_when_idle(&cluster).await {
                        Ok(()) => tracing::info!(cluster = %cluster.name(), "Background removal finished"),
                        Err(err) => tracing::error!(
                            cluster = %cluster.name(),
                            error = %err,
                            "Background removal failed"
                        ),
                    }
                });
            }
            Err(_) => tracing::warn!(
                cluster = %cluster.name(),
                "Guard dropped outside a tokio runtime; cluster resources were not removed"
            ),
        }
    }
}

/// Remove `cluster`, waiting out a `start` or `remove` that is still running.
async fn remove_when_idle(cluster: &Cluster) -> DevnetResult<()> {
    loop {
        match cluster.remove().await {
            Err(DevnetError::InvalidState { .. })
                if matches!(cluster.phase(), ClusterPhase::Starting | ClusterPhase::Removing) =>
            {
                tokio::time::sleep(BUSY_POLL).await;
            }
            result => return result,
        }
    }
}

/// Start `cluster`, run `body` with its endpoints, then remove it.
///
/// Removal runs on every path (start error, body error, body panic) exactly
/// once. A body error takes precedence over a teardown error; a panic is
/// resumed after teardown.
///
/// # Errors
///
/// The start error, the body's error, or the teardown error, in that order of precedence.
pub async fn scoped<F, Fut, T>(
    cluster: Arc<Cluster>,
    cancel: &CancellationToken,
    body: F,
) -> DevnetResult<T>
where
    F: FnOnce(NetworkConfig) -> Fut,
    Fut: Future<Output = DevnetResult<T>>,
{
    let guard = ClusterGuard::new(cluster);

    let config = match guard.start(cancel).await {
        Ok(config) => config,
        Err(err) => {
            if let Err(teardown) = guard.close().await {
                tracing::warn!(error = %teardown, "Teardown after failed start also failed");
            }
            return Err(err);
        }
    };

    let outcome = AssertUnwindSafe(async move { body(config).await })
        .catch_unwind()
        .await;
    let teardown = guard.close().await;

    match outcome {
        Err(panic) => {
            if let Err(err) = &teardown {
                tracing::error!(error = %err, "Teardown after panic failed");
            }
            std::panic::resume_unwind(panic)
        }
        Ok(Err(err)) => {
            if let Err(teardown) = teardown {
                tracing::warn!(error = %teardown, "Teardown after body error failed");
            }
            Err(err)
        }
        Ok(Ok(value)) => teardown.map(|()| value),
    }
}
