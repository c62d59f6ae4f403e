use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scheduler_domain::{
    entities::{SchedulerState, SCHEDULER_STATE_ID},
    repositories::SchedulerStateRepository,
};
use scheduler_errors::{SchedulerError, SchedulerResult};
use sqlx::{Row, SqlitePool};
use tracing::debug;

pub struct SqliteSchedulerStateRepository {
    pool: SqlitePool,
}

impl SqliteSchedulerStateRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SchedulerStateRepository for SqliteSchedulerStateRepository {
    async fn get(&self) -> SchedulerResult<Option<SchedulerState>> {
        let row = sqlx::query(
            "SELECT id, instance_id, status, clean_shutdown, startup_time, last_heartbeat, \
             shutdown_time FROM scheduler_state WHERE id = ?",
        )
        .bind(SCHEDULER_STATE_ID)
        .fetch_optional(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        match row {
            Some(row) => Ok(Some(SchedulerState {
                id: row.try_get("id")?,
                instance_id: row.try_get("instance_id")?,
                status: row.try_get("status")?,
                clean_shutdown: row.try_get("clean_shutdown")?,
                startup_time: row.try_get("startup_time")?,
                last_heartbeat: row.try_get("last_heartbeat")?,
                shutdown_time: row.try_get("shutdown_time")?,
            })),
            None => Ok(None),
        }
    }

    async fn upsert(&self, state: &SchedulerState) -> SchedulerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO scheduler_state (id, instance_id, status, clean_shutdown, startup_time,
                last_heartbeat, shutdown_time)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                instance_id = excluded.instance_id,
                status = excluded.status,
                clean_shutdown = excluded.clean_shutdown,
                startup_time = excluded.startup_time,
                last_heartbeat = excluded.last_heartbeat,
                shutdown_time = excluded.shutdown_time
            "#,
        )
        .bind(SCHEDULER_STATE_ID)
        .bind(&state.instance_id)
        .bind(state.status)
        .bind(state.clean_shutdown)
        .bind(state.startup_time)
        .bind(state.last_heartbeat)
        .bind(state.shutdown_time)
        .execute(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        debug!("写入调度器状态: 实例 {} {}", state.instance_id, state.status);
        Ok(())
    }

    async fn update_heartbeat(&self, instance_id: &str, now: DateTime<Utc>) -> SchedulerResult<bool> {
        let result = sqlx::query(
            "UPDATE scheduler_state SET last_heartbeat = ? WHERE id = ? AND instance_id = ?",
        )
        .bind(now)
        .bind(SCHEDULER_STATE_ID)
        .bind(instance_id)
        .execute(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_clean_shutdown(&self, instance_id: &str, now: DateTime<Utc>) -> SchedulerResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE scheduler_state
            SET status = 'STOPPED', clean_shutdown = 1, last_heartbeat = ?, shutdown_time = ?
            WHERE id = ? AND instance_id = ?
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(SCHEDULER_STATE_ID)
        .bind(instance_id)
        .execute(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        Ok(result.rows_affected() > 0)
    }
}
