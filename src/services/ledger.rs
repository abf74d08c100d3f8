use crate::address::RemoteAddress;
use sqlx::SqlitePool;

/// Terminal classification of a single upload attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    TransientFailure,
    PermanentFailure,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptOutcome::Success => "success",
            AttemptOutcome::TransientFailure => "transient-failure",
            AttemptOutcome::PermanentFailure => "permanent-failure",
        }
    }
}

/// One ledger row, as read back for inspection.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AttemptRecord {
    pub attempt_number: i64,
    pub timestamp: String,
    pub outcome: String,
}

/// Append-only audit trail of every upload attempt. The filesystem stage is
/// authoritative; the ledger is never consulted to decide state. A file
/// re-entering the system after a terminal outcome starts a fresh attempt
/// sequence at 0.
#[derive(Debug, Clone)]
pub struct Ledger {
    pool: SqlitePool,
}

impl Ledger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Appends one row for one attempt, in a single INSERT so concurrent
    /// files never interleave partial rows.
    pub async fn record_attempt(
        &self,
        addr: &RemoteAddress,
        attempt_number: u32,
        outcome: AttemptOutcome,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO attempt_records (profile, bucket, key, attempt_number, timestamp, outcome) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&addr.profile)
        .bind(&addr.bucket)
        .bind(&addr.key)
        .bind(attempt_number as i64)
        .bind(chrono::Utc::now().to_rfc3339())
        .bind(outcome.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// All attempts recorded for an identity, oldest first.
    pub async fn attempts_for(
        &self,
        addr: &RemoteAddress,
    ) -> Result<Vec<AttemptRecord>, sqlx::Error> {
        sqlx::query_as(
            "SELECT attempt_number, timestamp, outcome FROM attempt_records \
             WHERE profile = ? AND bucket = ? AND key = ? ORDER BY id",
        )
        .bind(&addr.profile)
        .bind(&addr.bucket)
        .bind(&addr.key)
        .fetch_all(&self.pool)
        .await
    }
}
