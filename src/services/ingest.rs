use crate::address::RemoteAddress;
use crate::error::FloodError;
use crate::services::uploader::Uploader;
use crate::stage::{Stage, StageTree};
use crate::utils::keyed_mutex::KeyedMutex;
use async_recursion::async_recursion;
use notify::event::{AccessKind, AccessMode, EventKind, ModifyKind, RenameMode};
use notify::{RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Discovers arriving files and feeds them to the upload executor.
///
/// Startup order is strict: files stranded in `processing` by a prior crash
/// are drained first, then pre-existing `inbox` files, and only then does
/// live monitoring start. Both the batch scans and the live subscription
/// feed the same claim-and-submit entry point ([`Ingestor::submit`]).
#[derive(Clone)]
pub struct Ingestor {
    tree: StageTree,
    uploader: Arc<Uploader>,
    admission: KeyedMutex,
}

impl Ingestor {
    pub fn new(tree: StageTree, uploader: Arc<Uploader>) -> Self {
        Self {
            tree,
            uploader,
            admission: KeyedMutex::new(),
        }
    }

    /// Recovery scans, in order. A file left in `processing` is resubmitted
    /// at attempt 0; nothing is assumed about prior partial uploads.
    pub async fn recover(&self) -> Result<(), FloodError> {
        let processing_root = self.tree.stage_root(Stage::Processing);
        let stranded = collect_files(&processing_root).await?;
        if !stranded.is_empty() {
            info!("🔁 Recovering {} file(s) left in processing", stranded.len());
        }
        for path in stranded {
            match RemoteAddress::from_staged_path(&processing_root, &path) {
                Ok(addr) => self.run_claimed(&addr).await,
                Err(e) => warn!("Skipping unrecognized processing entry: {}", e),
            }
        }

        let inbox_root = self.tree.stage_root(Stage::Inbox);
        let waiting = collect_files(&inbox_root).await?;
        if !waiting.is_empty() {
            info!("📨 Admitting {} file(s) already in inbox", waiting.len());
        }
        for path in waiting {
            self.submit(path).await;
        }

        Ok(())
    }

    /// The claim-and-submit entry point shared by the recovery scan and the
    /// live watcher. Malformed paths are logged and dropped; a missing
    /// source means a duplicate notification and is ignored.
    pub async fn submit(&self, inbox_path: PathBuf) {
        let inbox_root = self.tree.stage_root(Stage::Inbox);
        let addr = match RemoteAddress::from_staged_path(&inbox_root, &inbox_path) {
            Ok(addr) => addr,
            Err(e) => {
                warn!("Dropping arrival notification: {}", e);
                return;
            }
        };

        let _guard = self.admission.lock(&addr.to_string()).await;
        match self.tree.claim(&addr).await {
            Ok(Some(_)) => {
                if let Err(e) = self.uploader.process(&addr).await {
                    // Local failure: the file stays at its current stage for
                    // manual intervention.
                    error!("Processing of {} aborted: {}", addr, e);
                }
            }
            Ok(None) => debug!("{} already claimed, ignoring duplicate event", addr),
            Err(e) => error!("Failed to claim {}: {}", addr, e),
        }
        self.admission.cleanup();
    }

    /// Resubmits a file that is already in `processing` (crash recovery).
    async fn run_claimed(&self, addr: &RemoteAddress) {
        let _guard = self.admission.lock(&addr.to_string()).await;
        if let Err(e) = self.uploader.process(addr).await {
            error!("Recovery of {} aborted: {}", addr, e);
        }
    }

    /// Live monitoring: a recursive watch on the inbox root. A file counts
    /// as arrived on close-after-write or on rename into the tree; each
    /// arrival is dispatched onto its own task so one file's backoff never
    /// blocks another's admission.
    pub async fn watch(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), FloodError> {
        let inbox_root = self.tree.stage_root(Stage::Inbox);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            let _ = tx.send(res);
        })?;
        watcher.watch(&inbox_root, RecursiveMode::Recursive)?;
        info!("👀 Watching {} for arrivals", inbox_root.display());

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("🛑 Stopping inbox watcher");
                    return Ok(());
                }
                event = rx.recv() => {
                    let Some(event) = event else { return Ok(()) };
                    match event {
                        Ok(event) if is_arrival(&event.kind) => {
                            for path in event.paths {
                                if path.is_file() {
                                    let ingestor = self.clone();
                                    tokio::spawn(async move { ingestor.submit(path).await });
                                }
                            }
                        }
                        Ok(_) => {}
                        Err(e) => warn!("Watch error: {}", e),
                    }
                }
            }
        }
    }
}

/// "File write completed" or "file created via move".
fn is_arrival(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Access(AccessKind::Close(AccessMode::Write))
            | EventKind::Modify(ModifyKind::Name(RenameMode::To))
    )
}

#[async_recursion]
async fn collect_into(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), std::io::Error> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if entry.file_type().await?.is_dir() {
            collect_into(&path, out).await?;
        } else {
            out.push(path);
        }
    }
    Ok(())
}

/// All regular files below `root`, in directory-walk order.
async fn collect_files(root: &Path) -> Result<Vec<PathBuf>, std::io::Error> {
    let mut out = Vec::new();
    match tokio::fs::metadata(root).await {
        Ok(_) => collect_into(root, &mut out).await?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    Ok(out)
}
