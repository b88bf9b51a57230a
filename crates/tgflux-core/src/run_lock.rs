use anyhow::Result;
use sqlx::pool::PoolConnection;
use sqlx::Postgres;
use tokio::task;

use crate::db::DbPool;

pub const PIPELINE_LOCK_KEY: i64 = 0x5447_464C_5558; // "TGFLUX"

/// Session-level advisory lock held on a dedicated pooled connection. Postgres
/// releases it when that session ends.
pub struct RunLock {
    conn: Option<PoolConnection<Postgres>>,
    key: i64,
}

impl RunLock {
    /// Returns `None` when another session holds the lock.
    pub async fn try_acquire(pool: &DbPool, key: i64) -> Result<Option<Self>> {
        let mut conn = pool.acquire().await?;
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(key)
            .fetch_one(conn.as_mut())
            .await?;
        Ok(acquired.then(|| Self {
            conn: Some(conn),
            key,
        }))
    }

    pub async fn release(mut self) -> Result<()> {
        if let Some(mut conn) = self.conn.take() {
            sqlx::query("SELECT pg_advisory_unlock($1)")
                .bind(self.key)
                .execute(conn.as_mut())
                .await?;
        }
        Ok(())
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            let key = self.key;
            task::spawn(async move {
                if let Err(err) = sqlx::query("SELECT pg_advisory_unlock($1)")
                    .bind(key)
                    .execute(conn.as_mut())
                    .await
                {
                    tracing::warn!("failed to release run lock in drop: {err}");
                }
            });
        }
    }
}
