use anyhow::Context;
use chrono::{Datelike, NaiveDate};
use sqlx::pool::PoolConnection;
use sqlx::Postgres;

// Advisory locks belong to the session that took them, so the lock pins one pooled connection
// for its whole lifetime.
const LOCK_NAMESPACE: i64 = 0x5245_434F_5343; // "RECOSC"

fn lock_key(as_of_date: NaiveDate, version: &str) -> i64 {
    // FNV-1a over the version keeps different regime versions on separate keys.
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for b in version.as_bytes() {
        h ^= u64::from(*b);
        h = h.wrapping_mul(0x0100_0000_01b3);
    }
    LOCK_NAMESPACE ^ i64::from(as_of_date.num_days_from_ce()) ^ ((h as i64) << 24)
}

/// Held advisory lock for one (as-of date, version) scan.
pub struct ScanLock {
    conn: PoolConnection<Postgres>,
    key: i64,
}

impl ScanLock {
    /// Returns `None` when another session already holds the lock.
    pub async fn try_acquire(
        pool: &sqlx::PgPool,
        as_of_date: NaiveDate,
        version: &str,
    ) -> anyhow::Result<Option<ScanLock>> {
        let key = lock_key(as_of_date, version);
        let mut conn = pool
            .acquire()
            .await
            .context("acquire connection for advisory lock failed")?;
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .persistent(false)
            .bind(key)
            .fetch_one(&mut *conn)
            .await
            .with_context(|| format!("failed to acquire advisory lock (key={key})"))?;

        Ok(acquired.then_some(ScanLock { conn, key }))
    }

    pub async fn release(mut self) -> anyhow::Result<()> {
        let key = self.key;
        sqlx::query("SELECT pg_advisory_unlock($1)")
            .persistent(false)
            .bind(key)
            .execute(&mut *self.conn)
            .await
            .with_context(|| format!("failed to release advisory lock (key={key})"))?;
        Ok(())
    }
}
