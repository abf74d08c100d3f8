use crate::address::RemoteAddress;
use crate::config::ProfileRegistry;
use crate::error::FloodError;
use std::path::PathBuf;
use tracing::{debug, info};

/// A file's position in the pipeline. The stage *is* the file's state: the
/// only movement primitive is an atomic rename between stage roots, so a
/// given identity has at most one on-disk representation at any instant.
///
/// Legal transitions: `Staging -> Inbox` (ingestion completion),
/// `Inbox -> Processing` (claim), `Processing -> Completed` and
/// `Processing -> Failed` (terminal).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Staging,
    Inbox,
    Processing,
    Completed,
    Failed,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Staging,
        Stage::Inbox,
        Stage::Processing,
        Stage::Completed,
        Stage::Failed,
    ];

    pub fn dir_name(&self) -> &'static str {
        match self {
            Stage::Staging => "staging",
            Stage::Inbox => "inbox",
            Stage::Processing => "processing",
            Stage::Completed => "completed",
            Stage::Failed => "failed",
        }
    }
}

/// Owns the five-stage directory tree under a server root and performs all
/// stage transitions via rename.
#[derive(Debug, Clone)]
pub struct StageTree {
    root: PathBuf,
}

impl StageTree {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn stage_root(&self, stage: Stage) -> PathBuf {
        self.root.join(stage.dir_name())
    }

    /// Absolute path of an identity inside a given stage.
    pub fn path_in(&self, stage: Stage, addr: &RemoteAddress) -> PathBuf {
        self.stage_root(stage).join(addr.relative_path())
    }

    /// Creates all five stage roots plus a subdirectory per known profile.
    /// Idempotent; bucket subtrees are created lazily as buckets are seen.
    pub async fn ensure_layout(&self, registry: &ProfileRegistry) -> Result<(), FloodError> {
        for stage in Stage::ALL {
            let root = self.stage_root(stage);
            tokio::fs::create_dir_all(&root).await?;
            for name in registry.names() {
                tokio::fs::create_dir_all(root.join(name)).await?;
            }
        }
        info!("📂 Stage layout ready under {}", self.root.display());
        Ok(())
    }

    /// Deletes and recreates the staging root. Run at startup: a partially
    /// copied file from a prior crash is discarded, copy mode retries from
    /// the untouched original source.
    pub async fn purge_staging(&self) -> Result<(), FloodError> {
        let staging = self.stage_root(Stage::Staging);
        match tokio::fs::remove_dir_all(&staging).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tokio::fs::create_dir_all(&staging).await?;
        info!("🧹 Purged staging root {}", staging.display());
        Ok(())
    }

    /// Atomically claims an identity: rename from `Inbox` to `Processing`.
    ///
    /// Returns `Ok(None)` when the inbox file no longer exists, meaning
    /// another notification for the same physical arrival already claimed
    /// it. That is harmless.
    pub async fn claim(&self, addr: &RemoteAddress) -> Result<Option<PathBuf>, FloodError> {
        let from = self.path_in(Stage::Inbox, addr);
        let to = self.path_in(Stage::Processing, addr);

        if let Some(parent) = to.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        match tokio::fs::rename(&from, &to).await {
            Ok(()) => {
                debug!("Claimed {} into processing", addr);
                Ok(Some(to))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Moves a freshly copied file from `Staging` into `Inbox`, completing
    /// ingestion for that identity.
    pub async fn promote(&self, addr: &RemoteAddress) -> Result<PathBuf, FloodError> {
        let from = self.path_in(Stage::Staging, addr);
        let to = self.path_in(Stage::Inbox, addr);
        if let Some(parent) = to.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(&from, &to).await?;
        debug!("Promoted {} into inbox", addr);
        Ok(to)
    }

    /// Terminal transition: rename from `Processing` to `Completed` or
    /// `Failed`.
    pub async fn finalize(&self, addr: &RemoteAddress, outcome: Stage) -> Result<PathBuf, FloodError> {
        debug_assert!(matches!(outcome, Stage::Completed | Stage::Failed));

        let from = self.path_in(Stage::Processing, addr);
        let to = self.path_in(outcome, addr);
        if let Some(parent) = to.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(&from, &to).await?;
        info!("📦 {} -> {}", addr, outcome.dir_name());
        Ok(to)
    }
}
