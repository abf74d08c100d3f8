use async_trait::async_trait;
use flood::address::RemoteAddress;
use flood::config::ProfileRegistry;
use flood::error::TransportError;
use flood::infrastructure::database;
use flood::services::copy::run_copy;
use flood::services::ingest::Ingestor;
use flood::services::ledger::{AttemptRecord, Ledger};
use flood::services::store::{ObjectStore, RemoteObject};
use flood::services::uploader::{RetryPolicy, Uploader};
use flood::stage::{Stage, StageTree};
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// In-memory endpoint stub. `transient_failures` puts fail with a timeout
/// before puts start succeeding; `fail_put` selects a permanently failing
/// endpoint instead.
#[derive(Default)]
struct StubStore {
    buckets: Vec<String>,
    remote: Mutex<HashMap<(String, String), RemoteObject>>,
    put_calls: AtomicU32,
    transient_failures: u32,
    fail_put: Option<fn() -> TransportError>,
    head_unsupported: bool,
}

impl StubStore {
    fn with_bucket(bucket: &str) -> Self {
        Self {
            buckets: vec![bucket.to_string()],
            ..Self::default()
        }
    }

    fn put_count(&self) -> u32 {
        self.put_calls.load(Ordering::SeqCst)
    }

    fn seed_remote(&self, bucket: &str, key: &str, content: &[u8]) {
        self.remote.lock().unwrap().insert(
            (bucket.to_string(), key.to_string()),
            RemoteObject {
                size: content.len() as i64,
                digest: Some(format!("{:x}", md5::compute(content))),
            },
        );
    }
}

#[async_trait]
impl ObjectStore for StubStore {
    async fn list_buckets(&self) -> Result<Vec<String>, TransportError> {
        Ok(self.buckets.clone())
    }

    async fn head_object(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<Option<RemoteObject>, TransportError> {
        if self.head_unsupported {
            return Err(TransportError::Unsupported("HeadObject".into()));
        }
        Ok(self
            .remote
            .lock()
            .unwrap()
            .get(&(bucket.to_string(), key.to_string()))
            .cloned())
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        path: &Path,
    ) -> Result<(), TransportError> {
        let call = self.put_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(make_err) = self.fail_put {
            return Err(make_err());
        }
        if call < self.transient_failures {
            return Err(TransportError::Timeout("PutObject".into()));
        }
        let content = std::fs::read(path).map_err(|e| TransportError::Other(e.to_string()))?;
        self.seed_remote(bucket, key, &content);
        Ok(())
    }
}

async fn test_pool() -> SqlitePool {
    // A single connection: every pooled connection to :memory: would
    // otherwise get its own empty database.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    database::run_migrations(&pool).await.unwrap();
    pool
}

fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 10,
        base_delay: Duration::from_millis(1),
        jitter: Duration::ZERO,
    }
}

fn build_uploader(store: Arc<StubStore>, pool: SqlitePool, tree: StageTree, profile: &str) -> Arc<Uploader> {
    let mut stores: HashMap<String, Arc<dyn ObjectStore>> = HashMap::new();
    stores.insert(profile.to_string(), store);
    Arc::new(Uploader::new(stores, Ledger::new(pool), tree, fast_policy()))
}

async fn seed(tree: &StageTree, stage: Stage, addr: &RemoteAddress, content: &[u8]) {
    let path = tree.path_in(stage, addr);
    tokio::fs::create_dir_all(path.parent().unwrap())
        .await
        .unwrap();
    tokio::fs::write(&path, content).await.unwrap();
}

/// Number of on-disk representations of `addr` across the five stage roots.
fn representations(tree: &StageTree, addr: &RemoteAddress) -> usize {
    Stage::ALL
        .iter()
        .filter(|s| tree.path_in(**s, addr).exists())
        .count()
}

async fn attempts(pool: &SqlitePool, addr: &RemoteAddress) -> Vec<AttemptRecord> {
    Ledger::new(pool.clone()).attempts_for(addr).await.unwrap()
}

#[tokio::test]
async fn retry_exhaustion_writes_ten_rows_and_fails() {
    let dir = tempfile::tempdir().unwrap();
    let tree = StageTree::new(dir.path());
    let pool = test_pool().await;
    let addr = RemoteAddress::new("p1", "b1", "x.bin");
    seed(&tree, Stage::Processing, &addr, b"payload").await;

    let store = Arc::new(StubStore {
        fail_put: Some(|| TransportError::Timeout("PutObject".into())),
        ..StubStore::with_bucket("b1")
    });
    let uploader = build_uploader(store.clone(), pool.clone(), tree.clone(), "p1");

    uploader.process(&addr).await.unwrap();

    let rows = attempts(&pool, &addr).await;
    assert_eq!(rows.len(), 10);
    for (n, row) in rows.iter().enumerate() {
        assert_eq!(row.attempt_number, n as i64);
        assert_eq!(row.outcome, "transient-failure");
    }
    assert!(tree.path_in(Stage::Failed, &addr).exists());
    assert_eq!(representations(&tree, &addr), 1);
}

#[tokio::test]
async fn transient_failures_then_success_completes() {
    let dir = tempfile::tempdir().unwrap();
    let tree = StageTree::new(dir.path());
    let pool = test_pool().await;
    let addr = RemoteAddress::new("p1", "b1", "y.bin");
    seed(&tree, Stage::Processing, &addr, b"payload").await;

    let store = Arc::new(StubStore {
        transient_failures: 3,
        ..StubStore::with_bucket("b1")
    });
    let uploader = build_uploader(store.clone(), pool.clone(), tree.clone(), "p1");

    uploader.process(&addr).await.unwrap();

    let rows = attempts(&pool, &addr).await;
    assert_eq!(rows.len(), 4);
    assert_eq!(rows[3].outcome, "success");
    assert_eq!(rows[3].attempt_number, 3);
    assert!(tree.path_in(Stage::Completed, &addr).exists());
    assert_eq!(representations(&tree, &addr), 1);
}

#[tokio::test]
async fn missing_bucket_fails_permanently_without_upload() {
    let dir = tempfile::tempdir().unwrap();
    let tree = StageTree::new(dir.path());
    let pool = test_pool().await;
    let addr = RemoteAddress::new("r2-prod", "missing-bucket", "a.bin");
    seed(&tree, Stage::Processing, &addr, b"payload").await;

    let store = Arc::new(StubStore::with_bucket("media"));
    let uploader = build_uploader(store.clone(), pool.clone(), tree.clone(), "r2-prod");

    uploader.process(&addr).await.unwrap();

    let rows = attempts(&pool, &addr).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].attempt_number, 0);
    assert_eq!(rows[0].outcome, "permanent-failure");
    assert_eq!(store.put_count(), 0);
    assert!(tree.path_in(Stage::Failed, &addr).exists());
}

#[tokio::test]
async fn auth_failure_is_permanent() {
    let dir = tempfile::tempdir().unwrap();
    let tree = StageTree::new(dir.path());
    let pool = test_pool().await;
    let addr = RemoteAddress::new("p1", "b1", "secret.bin");
    seed(&tree, Stage::Processing, &addr, b"payload").await;

    let store = Arc::new(StubStore {
        fail_put: Some(|| TransportError::Auth("invalid credentials".into())),
        ..StubStore::with_bucket("b1")
    });
    let uploader = build_uploader(store, pool.clone(), tree.clone(), "p1");

    uploader.process(&addr).await.unwrap();

    let rows = attempts(&pool, &addr).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].outcome, "permanent-failure");
    assert!(tree.path_in(Stage::Failed, &addr).exists());
}

#[tokio::test]
async fn matching_remote_digest_skips_transfer() {
    let dir = tempfile::tempdir().unwrap();
    let tree = StageTree::new(dir.path());
    let pool = test_pool().await;
    let addr = RemoteAddress::new("p1", "b1", "same.bin");
    seed(&tree, Stage::Processing, &addr, b"identical bytes").await;

    let store = Arc::new(StubStore::with_bucket("b1"));
    store.seed_remote("b1", "same.bin", b"identical bytes");
    let uploader = build_uploader(store.clone(), pool.clone(), tree.clone(), "p1");

    uploader.process(&addr).await.unwrap();

    assert_eq!(store.put_count(), 0);
    let rows = attempts(&pool, &addr).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].outcome, "success");
    assert!(tree.path_in(Stage::Completed, &addr).exists());
}

#[tokio::test]
async fn differing_remote_digest_is_overwritten() {
    let dir = tempfile::tempdir().unwrap();
    let tree = StageTree::new(dir.path());
    let pool = test_pool().await;
    let addr = RemoteAddress::new("p1", "b1", "stale.bin");
    seed(&tree, Stage::Processing, &addr, b"new content").await;

    let store = Arc::new(StubStore::with_bucket("b1"));
    store.seed_remote("b1", "stale.bin", b"old content");
    let uploader = build_uploader(store.clone(), pool.clone(), tree.clone(), "p1");

    uploader.process(&addr).await.unwrap();

    assert_eq!(store.put_count(), 1);
    assert!(tree.path_in(Stage::Completed, &addr).exists());
}

#[tokio::test]
async fn unsupported_head_degrades_to_plain_upload() {
    let dir = tempfile::tempdir().unwrap();
    let tree = StageTree::new(dir.path());
    let pool = test_pool().await;
    let addr = RemoteAddress::new("p1", "b1", "blob.bin");
    seed(&tree, Stage::Processing, &addr, b"payload").await;

    let store = Arc::new(StubStore {
        head_unsupported: true,
        ..StubStore::with_bucket("b1")
    });
    let uploader = build_uploader(store.clone(), pool.clone(), tree.clone(), "p1");

    uploader.process(&addr).await.unwrap();

    assert_eq!(store.put_count(), 1);
    let rows = attempts(&pool, &addr).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].outcome, "success");
    assert!(tree.path_in(Stage::Completed, &addr).exists());
}

#[tokio::test]
async fn recovery_drains_processing_then_inbox() {
    let dir = tempfile::tempdir().unwrap();
    let tree = StageTree::new(dir.path());
    let pool = test_pool().await;
    let x = RemoteAddress::new("p1", "b1", "x.bin");
    let y = RemoteAddress::new("p1", "b1", "y.bin");
    seed(&tree, Stage::Processing, &x, b"stranded mid-flight").await;
    seed(&tree, Stage::Inbox, &y, b"waiting in inbox").await;

    let store = Arc::new(StubStore::with_bucket("b1"));
    let uploader = build_uploader(store, pool.clone(), tree.clone(), "p1");
    let ingestor = Ingestor::new(tree.clone(), uploader);

    ingestor.recover().await.unwrap();

    assert!(tree.path_in(Stage::Completed, &x).exists());
    assert!(tree.path_in(Stage::Completed, &y).exists());

    // The recovered file restarts its attempt sequence at 0.
    let rows = attempts(&pool, &x).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].attempt_number, 0);
    assert_eq!(rows[0].outcome, "success");
}

#[tokio::test]
async fn submit_claims_and_uploads_live_arrival() {
    let dir = tempfile::tempdir().unwrap();
    let tree = StageTree::new(dir.path());
    let pool = test_pool().await;
    let addr = RemoteAddress::new("p1", "b1", "live.bin");
    seed(&tree, Stage::Inbox, &addr, b"payload").await;

    let store = Arc::new(StubStore::with_bucket("b1"));
    let uploader = build_uploader(store, pool.clone(), tree.clone(), "p1");
    let ingestor = Ingestor::new(tree.clone(), uploader);

    ingestor.submit(tree.path_in(Stage::Inbox, &addr)).await;

    assert!(tree.path_in(Stage::Completed, &addr).exists());
    assert_eq!(representations(&tree, &addr), 1);
}

#[tokio::test]
async fn malformed_inbox_path_is_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let tree = StageTree::new(dir.path());
    let pool = test_pool().await;

    // Two segments only: profile and bucket, no key.
    let short = tree.stage_root(Stage::Inbox).join("p1/orphan");
    tokio::fs::create_dir_all(short.parent().unwrap())
        .await
        .unwrap();
    tokio::fs::write(&short, b"junk").await.unwrap();

    let store = Arc::new(StubStore::with_bucket("b1"));
    let uploader = build_uploader(store.clone(), pool, tree.clone(), "p1");
    let ingestor = Ingestor::new(tree.clone(), uploader);

    ingestor.submit(short.clone()).await;

    // Dropped, not claimed, not uploaded.
    assert!(short.exists());
    assert_eq!(store.put_count(), 0);
}

#[tokio::test]
async fn reentry_after_success_starts_fresh_and_skips_transfer() {
    let dir = tempfile::tempdir().unwrap();
    let tree = StageTree::new(dir.path());
    let pool = test_pool().await;
    let addr = RemoteAddress::new("p1", "b1", "again.bin");

    let store = Arc::new(StubStore::with_bucket("b1"));
    let uploader = build_uploader(store.clone(), pool.clone(), tree.clone(), "p1");
    let ingestor = Ingestor::new(tree.clone(), uploader);

    seed(&tree, Stage::Inbox, &addr, b"payload").await;
    ingestor.submit(tree.path_in(Stage::Inbox, &addr)).await;
    assert_eq!(store.put_count(), 1);

    // Same unchanged file re-enters the system: second run completes via
    // the existence check alone.
    tokio::fs::remove_file(tree.path_in(Stage::Completed, &addr))
        .await
        .unwrap();
    seed(&tree, Stage::Inbox, &addr, b"payload").await;
    ingestor.submit(tree.path_in(Stage::Inbox, &addr)).await;

    assert_eq!(store.put_count(), 1);
    assert!(tree.path_in(Stage::Completed, &addr).exists());

    let rows = attempts(&pool, &addr).await;
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].attempt_number, 0);
    assert_eq!(rows[1].attempt_number, 0);
    assert_eq!(rows[1].outcome, "success");
}

#[tokio::test]
async fn copy_mode_stages_then_promotes_recursively() {
    let dir = tempfile::tempdir().unwrap();
    let tree = StageTree::new(dir.path().join("server"));
    let registry = ProfileRegistry::from_credentials_str(
        "[r2-prod]\nprovider = cloudflare\naws_access_key_id = a\n\
         aws_secret_access_key = b\naws_region = auto\n\
         aws_endpoint = https://acct.example.r2storage.com\n",
    )
    .unwrap();
    tree.ensure_layout(&registry).await.unwrap();

    let source = dir.path().join("photos");
    tokio::fs::create_dir_all(source.join("2024")).await.unwrap();
    tokio::fs::write(source.join("a.jpg"), b"jpeg bytes").await.unwrap();
    tokio::fs::write(source.join("2024/b.jpg"), b"more bytes").await.unwrap();

    let dest = RemoteAddress::parse_uri("s3://r2-prod/media/photos").unwrap();
    let copied = run_copy(&tree, &registry, &source, &dest, true).await.unwrap();
    assert_eq!(copied, 2);

    assert!(
        tree.path_in(Stage::Inbox, &RemoteAddress::new("r2-prod", "media", "photos/a.jpg"))
            .exists()
    );
    assert!(
        tree.path_in(
            Stage::Inbox,
            &RemoteAddress::new("r2-prod", "media", "photos/2024/b.jpg")
        )
        .exists()
    );

    // Nothing is left behind in staging.
    let mut staged = Vec::new();
    let mut stack = vec![tree.stage_root(Stage::Staging)];
    while let Some(d) = stack.pop() {
        let mut entries = tokio::fs::read_dir(&d).await.unwrap();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            if entry.file_type().await.unwrap().is_dir() {
                stack.push(entry.path());
            } else {
                staged.push(entry.path());
            }
        }
    }
    assert!(staged.is_empty(), "staging still holds {staged:?}");
}

#[tokio::test]
async fn copy_mode_rejects_unknown_profile_and_bare_directories() {
    let dir = tempfile::tempdir().unwrap();
    let tree = StageTree::new(dir.path().join("server"));
    let registry = ProfileRegistry::from_credentials_str(
        "[p1]\nprovider = amazon\naws_access_key_id = a\n\
         aws_secret_access_key = b\naws_region = us-east-1\n",
    )
    .unwrap();
    tree.ensure_layout(&registry).await.unwrap();

    let source = dir.path().join("data");
    tokio::fs::create_dir_all(&source).await.unwrap();

    let unknown = RemoteAddress::parse_uri("s3://nope/b/k").unwrap();
    assert!(run_copy(&tree, &registry, &source, &unknown, true).await.is_err());

    let dest = RemoteAddress::parse_uri("s3://p1/b/k").unwrap();
    assert!(run_copy(&tree, &registry, &source, &dest, false).await.is_err());
}
