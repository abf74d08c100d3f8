use crate::address::RemoteAddress;
use crate::error::{FloodError, TransportError};
use crate::services::ledger::{AttemptOutcome, Ledger};
use crate::services::store::ObjectStore;
use crate::stage::{Stage, StageTree};
use rand::Rng;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{error, info, warn};

/// Retry ceiling and backoff shape for transient failures.
///
/// Production policy: 10 attempts, 30s base doubling per attempt plus up to
/// 1s of uniform jitter, no cap. The delay before the final attempt is
/// ~2.5 hours by formula; that is a known characteristic of the policy, not
/// something to bound here.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_secs(30),
            jitter: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt `n` (0-indexed): `base * 2^n` plus jitter.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let backoff = self.base_delay * 2u32.pow(attempt);
        if self.jitter.is_zero() {
            return backoff;
        }
        let jitter_ms = rand::thread_rng().gen_range(0..self.jitter.as_millis() as u64);
        backoff + Duration::from_millis(jitter_ms)
    }
}

/// How a successful attempt finished.
enum Transfer {
    Uploaded,
    /// Remote object already matched the local digest; no bytes moved.
    Skipped,
}

/// Drives a claimed file through `Pending -> Uploading -> {Success,
/// Transient, Permanent}`, with `Transient` looping back until the retry
/// ceiling. Also owns the bucket gate and the idempotency check, both of
/// which run inside every attempt.
pub struct Uploader {
    stores: HashMap<String, Arc<dyn ObjectStore>>,
    ledger: Ledger,
    tree: StageTree,
    policy: RetryPolicy,
    head_gap_logged: AtomicBool,
}

impl Uploader {
    pub fn new(
        stores: HashMap<String, Arc<dyn ObjectStore>>,
        ledger: Ledger,
        tree: StageTree,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            stores,
            ledger,
            tree,
            policy,
            head_gap_logged: AtomicBool::new(false),
        }
    }

    /// Processes one claimed occurrence of `addr`, currently sitting in
    /// `Processing`. Always reaches a terminal stage transition unless local
    /// I/O fails, in which case the file stays where it is for manual
    /// intervention and the error propagates.
    ///
    /// Every attempt writes exactly one ledger row.
    pub async fn process(&self, addr: &RemoteAddress) -> Result<(), FloodError> {
        let path = self.tree.path_in(Stage::Processing, addr);
        let size = tokio::fs::metadata(&path).await?.len();

        let Some(store) = self.stores.get(&addr.profile).cloned() else {
            // Profiles are validated at startup, so a staged path naming an
            // unknown profile is unrecoverable for this file.
            warn!("No profile '{}' for staged file {}", addr.profile, addr);
            self.conclude(addr, 0, AttemptOutcome::PermanentFailure).await?;
            return Ok(());
        };

        // One digest per processing cycle, reused by every attempt's
        // idempotency check.
        let digest = local_digest(&path).await?;

        let mut attempt = 0u32;
        loop {
            match self.attempt_once(store.as_ref(), addr, &path, &digest).await {
                Ok(Transfer::Uploaded) => {
                    info!("☁️  Uploaded {} ({} bytes, attempt {})", addr, size, attempt);
                    self.conclude(addr, attempt, AttemptOutcome::Success).await?;
                    return Ok(());
                }
                Ok(Transfer::Skipped) => {
                    info!("✅ Remote already matches {}, skipping transfer", addr);
                    self.conclude(addr, attempt, AttemptOutcome::Success).await?;
                    return Ok(());
                }
                Err(e) if e.is_transient() => {
                    self.ledger
                        .record_attempt(addr, attempt, AttemptOutcome::TransientFailure)
                        .await?;

                    if attempt + 1 >= self.policy.max_attempts {
                        error!(
                            "❌ {} failed after {} attempts, giving up: {}",
                            addr,
                            self.policy.max_attempts,
                            e
                        );
                        self.tree.finalize(addr, Stage::Failed).await?;
                        return Ok(());
                    }

                    let delay = self.policy.delay_after(attempt);
                    warn!(
                        "⏳ Transient failure on {} (attempt {}): {}. Retrying in {:?}",
                        addr, attempt, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!("❌ Permanent failure on {} (attempt {}): {}", addr, attempt, e);
                    self.conclude(addr, attempt, AttemptOutcome::PermanentFailure).await?;
                    return Ok(());
                }
            }
        }
    }

    /// One attempt: bucket gate, idempotency check, then the transfer.
    async fn attempt_once(
        &self,
        store: &dyn ObjectStore,
        addr: &RemoteAddress,
        path: &Path,
        digest: &str,
    ) -> Result<Transfer, TransportError> {
        // Bucket existence is never cached: the remote bucket set can change
        // underneath us between attempts.
        let buckets = store.list_buckets().await?;
        if !buckets.iter().any(|b| b == &addr.bucket) {
            return Err(TransportError::BucketNotFound(addr.bucket.clone()));
        }

        // Re-checked before every attempt: a prior attempt may have
        // succeeded remotely even though its response was lost.
        match store.head_object(&addr.bucket, &addr.key).await {
            Ok(Some(remote)) if remote.digest.as_deref() == Some(digest) => {
                return Ok(Transfer::Skipped);
            }
            Ok(_) => {}
            Err(TransportError::Unsupported(op)) => {
                if !self.head_gap_logged.swap(true, Ordering::Relaxed) {
                    warn!("Endpoint does not support {}; uploading without idempotency check", op);
                }
            }
            Err(e) => return Err(e),
        }

        store.put_object(&addr.bucket, &addr.key, path).await?;
        Ok(Transfer::Uploaded)
    }

    /// Writes the terminal ledger row and performs the terminal stage
    /// transition for this occurrence.
    async fn conclude(
        &self,
        addr: &RemoteAddress,
        attempt: u32,
        outcome: AttemptOutcome,
    ) -> Result<(), FloodError> {
        self.ledger.record_attempt(addr, attempt, outcome).await?;
        let stage = match outcome {
            AttemptOutcome::Success => Stage::Completed,
            _ => Stage::Failed,
        };
        self.tree.finalize(addr, stage).await?;
        Ok(())
    }
}

/// MD5 hex digest of a local file, for comparison against non-multipart
/// ETags. Runs on the blocking pool; staged files can be large.
pub async fn local_digest(path: &Path) -> Result<String, std::io::Error> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        use std::io::Read;

        let mut file = std::fs::File::open(&path)?;
        let mut context = md5::Context::new();
        let mut buffer = vec![0u8; 256 * 1024];
        loop {
            let n = file.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            context.consume(&buffer[..n]);
        }
        Ok(format!("{:x}", context.compute()))
    })
    .await
    .map_err(std::io::Error::other)?
}
