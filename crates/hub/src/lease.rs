//! Time-bounded execution leases.
//!
//! A lease is held from acquisition until `acquired_at + max_hold` at most.
//! Releasing it early only shortens it down to `acquired_at + min_hold`, so
//! a burst of triggers inside that window runs the task once.
//!
//! The SQLite provider makes the lease visible to every process sharing the
//! database file; the in-memory provider only serializes within one process.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tracing::error;
use uuid::Uuid;

use crate::db::Db;

#[derive(Debug, Clone, PartialEq)]
pub struct LeaseConfig {
    pub name: String,
    pub acquired_at: DateTime<Utc>,
    pub max_hold: Duration,
    pub min_hold: Duration,
}

impl LeaseConfig {
    pub fn new(name: String, acquired_at: DateTime<Utc>, max_hold: Duration, min_hold: Duration) -> Self {
        Self {
            name,
            acquired_at,
            max_hold,
            min_hold,
        }
    }

    fn acquired_at_ms(&self) -> i64 {
        self.acquired_at.timestamp_millis()
    }

    fn lock_at_most_until_ms(&self) -> i64 {
        self.acquired_at_ms() + self.max_hold.as_millis() as i64
    }

    fn lock_at_least_until_ms(&self) -> i64 {
        self.acquired_at_ms() + self.min_hold.as_millis() as i64
    }

    /// Expiry to record when the holder releases at `now`.
    fn unlock_at_ms(&self, now: DateTime<Utc>) -> i64 {
        self.lock_at_least_until_ms().max(now.timestamp_millis())
    }
}

/// Proof of a successful acquisition; hand it back to release.
#[derive(Debug)]
pub struct Lease {
    config: LeaseConfig,
    holder: String,
}

impl Lease {
    pub fn name(&self) -> &str {
        &self.config.name
    }
}

#[async_trait]
pub trait LeaseProvider: Send + Sync {
    /// Atomically take the lease. `Ok(None)` means someone else holds it.
    async fn try_acquire(&self, config: &LeaseConfig) -> Result<Option<Lease>>;

    async fn release(&self, lease: Lease, now: DateTime<Utc>) -> Result<()>;
}

pub enum LeaseOutcome<T> {
    Executed(T),
    Unavailable,
}

/// Run `task` under the lease described by `config`, or skip it if the lease
/// is held elsewhere.
///
/// A failed release is logged only; the lease then lapses at its maximum
/// hold.
pub async fn execute_with_lease<F, Fut, T>(
    provider: &dyn LeaseProvider,
    config: LeaseConfig,
    task: F,
) -> Result<LeaseOutcome<T>>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    let Some(lease) = provider.try_acquire(&config).await? else {
        return Ok(LeaseOutcome::Unavailable);
    };

    let out = task().await;

    let name = lease.name().to_string();
    if let Err(e) = provider.release(lease, Utc::now()).await {
        error!(lock = %name, "failed to release lease: {e:#}");
    }

    Ok(LeaseOutcome::Executed(out))
}

// ---------------------------------------------------------------------------
// SQLite provider
// ---------------------------------------------------------------------------

pub struct SqliteLeaseProvider {
    db: Db,
    holder: String,
}

impl SqliteLeaseProvider {
    pub fn new(db: Db) -> Self {
        Self {
            db,
            holder: format!("power-relay-{}", Uuid::new_v4()),
        }
    }
}

#[async_trait]
impl LeaseProvider for SqliteLeaseProvider {
    async fn try_acquire(&self, config: &LeaseConfig) -> Result<Option<Lease>> {
        let now = config.acquired_at_ms();
        // Single statement: insert a fresh row, or take over an expired one.
        let result = sqlx::query(
            r#"
            INSERT INTO leases (name, lock_until, locked_at, locked_by)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
              lock_until=excluded.lock_until,
              locked_at=excluded.locked_at,
              locked_by=excluded.locked_by
            WHERE leases.lock_until <= ?
            "#,
        )
        .bind(config.name.as_str())
        .bind(config.lock_at_most_until_ms())
        .bind(now)
        .bind(self.holder.as_str())
        .bind(now)
        .execute(self.db.pool())
        .await
        .with_context(|| format!("acquire lease failed: {}", config.name))?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        Ok(Some(Lease {
            config: config.clone(),
            holder: self.holder.clone(),
        }))
    }

    async fn release(&self, lease: Lease, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE leases SET lock_until = ?
            WHERE name = ? AND locked_by = ? AND locked_at = ?
            "#,
        )
        .bind(lease.config.unlock_at_ms(now))
        .bind(lease.config.name.as_str())
        .bind(lease.holder.as_str())
        .bind(lease.config.acquired_at_ms())
        .execute(self.db.pool())
        .await
        .with_context(|| format!("release lease failed: {}", lease.config.name))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory provider
// ---------------------------------------------------------------------------

struct HeldLease {
    lock_until_ms: i64,
    locked_at_ms: i64,
    holder: String,
}

#[derive(Default)]
pub struct InMemoryLeaseProvider {
    leases: Mutex<HashMap<String, HeldLease>>,
}

impl InMemoryLeaseProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LeaseProvider for InMemoryLeaseProvider {
    async fn try_acquire(&self, config: &LeaseConfig) -> Result<Option<Lease>> {
        let mut leases = self
            .leases
            .lock()
            .map_err(|_| anyhow::anyhow!("lease table poisoned"))?;

        let now = config.acquired_at_ms();
        if leases
            .get(&config.name)
            .is_some_and(|held| held.lock_until_ms > now)
        {
            return Ok(None);
        }

        let holder = Uuid::new_v4().to_string();
        leases.insert(
            config.name.clone(),
            HeldLease {
                lock_until_ms: config.lock_at_most_until_ms(),
                locked_at_ms: now,
                holder: holder.clone(),
            },
        );
        Ok(Some(Lease {
            config: config.clone(),
            holder,
        }))
    }

    async fn release(&self, lease: Lease, now: DateTime<Utc>) -> Result<()> {
        let mut leases = self
            .leases
            .lock()
            .map_err(|_| anyhow::anyhow!("lease table poisoned"))?;

        if let Some(held) = leases.get_mut(&lease.config.name) {
            if held.holder == lease.holder && held.locked_at_ms == lease.config.acquired_at_ms() {
                held.lock_until_ms = lease.config.unlock_at_ms(now);
            }
        }
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
