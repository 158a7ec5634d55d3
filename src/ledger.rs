//! Rate & dedup ledger (SQLite).
//!
//! One row per claimed dedup key. A row is written when a trigger is accepted,
//! before any provider is called, so in-flight and failed runs still count as
//! handled and still consume the author's rate slot.

pub mod policy;

pub use policy::RatePolicy;

use crate::error::{LedgerError, Rejection, Result};
use crate::{TriggerEvent, TriggerSource};

use anyhow::Context as _;
use chrono::{DateTime, TimeZone as _, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row as _, SqlitePool};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    InFlight,
    Completed,
    Failed,
}

impl RecordStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RecordStatus::InFlight => "in_flight",
            RecordStatus::Completed => "completed",
            RecordStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "in_flight" => Some(RecordStatus::InFlight),
            "completed" => Some(RecordStatus::Completed),
            "failed" => Some(RecordStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupRecord {
    pub dedup_key: String,
    pub source: TriggerSource,
    pub author_id: String,
    pub author_handle: String,
    pub status: RecordStatus,
    pub attempted_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub outcome_media_id: Option<String>,
    pub failure: Option<String>,
}

/// Result of asking the ledger to accept a trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Accepted,
    Rejected(Rejection),
}

impl Admission {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Admission::Accepted)
    }
}

/// Shared handle to the ledger. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Ledger {
    pool: SqlitePool,
}

impl Ledger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// True if the key was ever claimed, whatever happened to the run.
    pub async fn is_duplicate(&self, dedup_key: &str) -> Result<bool> {
        let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM responses WHERE dedup_key = ?")
            .bind(dedup_key)
            .fetch_optional(&self.pool)
            .await
            .context("failed to check dedup key")?;
        Ok(found.is_some())
    }

    pub async fn is_rate_limited(
        &self,
        source: TriggerSource,
        author_id: &str,
        policy: RatePolicy,
    ) -> Result<bool> {
        self.is_rate_limited_at(source, author_id, policy, Utc::now())
            .await
    }

    /// Rate check against an explicit clock. Counters are kept per front-end.
    pub async fn is_rate_limited_at(
        &self,
        source: TriggerSource,
        author_id: &str,
        policy: RatePolicy,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let attempts = self
            .attempts_since(source, author_id, policy.window_start(now))
            .await?;
        Ok(policy.is_limited(now, &attempts))
    }

    /// Attempt times for an author strictly after `since`, newest first.
    pub async fn attempts_since(
        &self,
        source: TriggerSource,
        author_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>> {
        let rows: Vec<i64> = sqlx::query_scalar(
            r#"
            SELECT attempted_at FROM responses
            WHERE source = ? AND author_id = ? AND attempted_at > ?
            ORDER BY attempted_at DESC
            "#,
        )
        .bind(source.as_str())
        .bind(author_id)
        .bind(since.timestamp_millis())
        .fetch_all(&self.pool)
        .await
        .context("failed to load author attempts")?;

        Ok(rows.into_iter().filter_map(from_millis).collect())
    }

    /// Claim the event's dedup key. Idempotent: returns `false` when the key
    /// was already claimed and leaves the existing row untouched.
    pub async fn record_attempt(&self, event: &TriggerEvent, at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO responses (dedup_key, source, author_id, author_handle, status, attempted_at)
            VALUES (?, ?, ?, ?, 'in_flight', ?)
            ON CONFLICT(dedup_key) DO NOTHING
            "#,
        )
        .bind(&event.dedup_key)
        .bind(event.source.as_str())
        .bind(&event.author_id)
        .bind(&event.author_handle)
        .bind(at.timestamp_millis())
        .execute(&self.pool)
        .await
        .context("failed to record attempt")?;

        Ok(result.rows_affected() == 1)
    }

    /// Accept or reject a trigger, claiming its slot on acceptance.
    ///
    /// The claim is one conditional insert, so two processes racing on the same
    /// key or the last free rate slot cannot both win.
    pub async fn admit(
        &self,
        event: &TriggerEvent,
        policy: RatePolicy,
        now: DateTime<Utc>,
    ) -> Result<Admission> {
        if self.is_duplicate(&event.dedup_key).await? {
            return Ok(Admission::Rejected(Rejection::Duplicate(
                event.dedup_key.clone(),
            )));
        }
        if self
            .is_rate_limited_at(event.source, &event.author_id, policy, now)
            .await?
        {
            return Ok(Admission::Rejected(Rejection::RateLimited {
                author_id: event.author_id.clone(),
            }));
        }

        let (_, max_count) = policy.as_window();
        let result = sqlx::query(
            r#"
            INSERT INTO responses (dedup_key, source, author_id, author_handle, status, attempted_at)
            SELECT ?, ?, ?, ?, 'in_flight', ?
            WHERE (
                SELECT COUNT(*) FROM responses
                WHERE source = ? AND author_id = ? AND attempted_at > ?
            ) < ?
            ON CONFLICT(dedup_key) DO NOTHING
            "#,
        )
        .bind(&event.dedup_key)
        .bind(event.source.as_str())
        .bind(&event.author_id)
        .bind(&event.author_handle)
        .bind(now.timestamp_millis())
        .bind(event.source.as_str())
        .bind(&event.author_id)
        .bind(policy.window_start(now).timestamp_millis())
        .bind(i64::from(max_count))
        .execute(&self.pool)
        .await
        .context("failed to claim dedup key")?;

        if result.rows_affected() == 1 {
            return Ok(Admission::Accepted);
        }

        // Lost a race with another writer; report which constraint won.
        if self.is_duplicate(&event.dedup_key).await? {
            Ok(Admission::Rejected(Rejection::Duplicate(
                event.dedup_key.clone(),
            )))
        } else {
            Ok(Admission::Rejected(Rejection::RateLimited {
                author_id: event.author_id.clone(),
            }))
        }
    }

    /// Mark a claimed key completed. Only an in-flight row can complete, so at
    /// most one outcome is ever stored per key.
    pub async fn record_outcome(
        &self,
        dedup_key: &str,
        outcome_media_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE responses
            SET status = 'completed', outcome_media_id = ?, completed_at = ?
            WHERE dedup_key = ? AND status = 'in_flight'
            "#,
        )
        .bind(outcome_media_id)
        .bind(at.timestamp_millis())
        .bind(dedup_key)
        .execute(&self.pool)
        .await
        .context("failed to record outcome")?;

        Ok(result.rows_affected() == 1)
    }

    /// Mark a claimed key failed. The row stays, so the trigger is not retried.
    pub async fn record_failure(&self, dedup_key: &str, reason: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE responses
            SET status = 'failed', failure = ?
            WHERE dedup_key = ? AND status = 'in_flight'
            "#,
        )
        .bind(reason)
        .bind(dedup_key)
        .execute(&self.pool)
        .await
        .context("failed to record failure")?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn get(&self, dedup_key: &str) -> Result<Option<DedupRecord>> {
        let row = sqlx::query(
            r#"
            SELECT dedup_key, source, author_id, author_handle, status, attempted_at,
                   completed_at, outcome_media_id, failure
            FROM responses WHERE dedup_key = ?
            "#,
        )
        .bind(dedup_key)
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch dedup record")?;

        row.map(record_from_row).transpose()
    }
}

fn from_millis(millis: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single()
}

fn record_from_row(row: sqlx::sqlite::SqliteRow) -> Result<DedupRecord> {
    let dedup_key: String = row.try_get("dedup_key").context("missing dedup_key")?;
    let corrupt = |reason: &str| LedgerError::CorruptRow {
        key: dedup_key.clone(),
        reason: reason.to_string(),
    };

    let source: String = row.try_get("source").context("missing source")?;
    let source = TriggerSource::parse(&source).ok_or_else(|| corrupt("unknown source"))?;
    let status: String = row.try_get("status").context("missing status")?;
    let status = RecordStatus::parse(&status).ok_or_else(|| corrupt("unknown status"))?;
    let attempted_at: i64 = row.try_get("attempted_at").context("missing attempted_at")?;
    let attempted_at = from_millis(attempted_at).ok_or_else(|| corrupt("bad attempted_at"))?;
    let completed_at: Option<i64> = row.try_get("completed_at").context("missing completed_at")?;

    Ok(DedupRecord {
        source,
        author_id: row.try_get("author_id").context("missing author_id")?,
        author_handle: row.try_get("author_handle").context("missing author_handle")?,
        status,
        attempted_at,
        completed_at: completed_at.and_then(from_millis),
        outcome_media_id: row
            .try_get("outcome_media_id")
            .context("missing outcome_media_id")?,
        failure: row.try_get("failure").context("missing failure")?,
        dedup_key,
    })
}
