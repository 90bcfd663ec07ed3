//! Hot-swappable policy snapshots.
//!
//! Readers take an `Arc` to the current [`PolicyConfig`] and evaluate the
//! whole request against it. A reload compiles a fresh snapshot and replaces
//! the pointer under a short write lock, so no reader ever sees a mix of old
//! and new rules.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime},
};
use tokio::{sync::RwLock, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    config::{load_policy_from_file, PolicyConfig},
    error::Result,
    metrics::Metrics,
};

pub struct PolicyStore {
    current: RwLock<Arc<PolicyConfig>>,
}

impl PolicyStore {
    /// Create a store holding `config` as version 1
    pub fn new(config: PolicyConfig) -> Self {
        Self {
            current: RwLock::new(Arc::new(config.with_version(1))),
        }
    }

    /// Load and compile the policy file. Any error here is fatal to startup.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let document = load_policy_from_file(&path.to_string_lossy())?;
        let config = PolicyConfig::compile(document)?;
        info!(path = %path.display(), "Policy loaded");
        Ok(Self::new(config))
    }

    /// The snapshot to evaluate a request against
    pub async fn snapshot(&self) -> Arc<PolicyConfig> {
        self.current.read().await.clone()
    }

    pub async fn version(&self) -> u64 {
        self.current.read().await.version()
    }

    /// Swap in a new snapshot, returning its version.
    ///
    /// The version is taken under the write lock, so the installed snapshot
    /// always carries the highest version handed out.
    pub async fn replace(&self, config: PolicyConfig) -> u64 {
        let mut current = self.current.write().await;
        let version = current.version() + 1;
        *current = Arc::new(config.with_version(version));
        drop(current);

        info!(version, "Policy snapshot replaced");
        version
    }

    /// Re-read and compile the policy file. On error the current snapshot stays.
    pub async fn reload_from_file(&self, path: impl AsRef<Path>) -> Result<u64> {
        let path = path.as_ref().to_path_buf();
        let config = tokio::task::spawn_blocking(move || {
            let document = load_policy_from_file(&path.to_string_lossy())?;
            PolicyConfig::compile(document)
        })
        .await
        .map_err(|e| crate::error::GatewayError::Policy(format!("reload task failed: {}", e)))??;

        Ok(self.replace(config).await)
    }
}

/// Poll the policy file and reload it whenever its modification time changes.
pub fn spawn_reload_task(
    store: Arc<PolicyStore>,
    path: PathBuf,
    interval: Duration,
    metrics: Arc<Metrics>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut last_modified = modified_at(&path).await;
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let modified = modified_at(&path).await;
            if modified.is_none() || modified == last_modified {
                continue;
            }
            debug!(path = %path.display(), "Policy file changed");

            match store.reload_from_file(&path).await {
                Ok(version) => {
                    last_modified = modified;
                    metrics.record_policy_reload_success();
                    info!(path = %path.display(), version, "Policy reloaded");
                }
                Err(e) => {
                    // keep serving with the previous snapshot; retry on next change
                    last_modified = modified;
                    metrics.record_policy_reload_error();
                    warn!(path = %path.display(), error = %e, "Policy reload failed");
                }
            }
        }
    })
}

async fn modified_at(path: &Path) -> Option<SystemTime> {
    tokio::fs::metadata(path).await.ok()?.modified().ok()
}
