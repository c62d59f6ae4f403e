use async_trait::async_trait;
use scheduler_domain::{
    entities::{StagingOperation, StagingStatus},
    repositories::StagingOperationRepository,
};
use scheduler_errors::{SchedulerError, SchedulerResult};
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use tracing::debug;

const STAGING_COLUMNS: &str = "id, task_id, worker_id, compute_resource_id, direction, \
     source_path, destination_path, status, total_size, expected_checksum, transferred_size, \
     attempts, error_message, timeout_seconds, created_at, started_at, completed_at, last_heartbeat, updated_at";

pub struct SqliteStagingOperationRepository {
    pool: SqlitePool,
}

impl SqliteStagingOperationRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_operation(row: &SqliteRow) -> SchedulerResult<StagingOperation> {
        Ok(StagingOperation {
            id: row.try_get("id")?,
            task_id: row.try_get("task_id")?,
            worker_id: row.try_get("worker_id")?,
            compute_resource_id: row.try_get("compute_resource_id")?,
            direction: row.try_get("direction")?,
            source_path: row.try_get("source_path")?,
            destination_path: row.try_get("destination_path")?,
            status: row.try_get("status")?,
            total_size: row.try_get("total_size")?,
            expected_checksum: row.try_get("expected_checksum")?,
            transferred_size: row.try_get("transferred_size")?,
            attempts: row.try_get::<i64, _>("attempts")? as u32,
            error_message: row.try_get("error_message")?,
            timeout_seconds: row.try_get("timeout_seconds")?,
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            last_heartbeat: row.try_get("last_heartbeat")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    async fn fetch_operations(
        &self,
        sql: &str,
        bind: Option<&str>,
    ) -> SchedulerResult<Vec<StagingOperation>> {
        let mut query = sqlx::query(sql);
        if let Some(value) = bind {
            query = query.bind(value);
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;
        rows.iter().map(Self::row_to_operation).collect()
    }
}

#[async_trait]
impl StagingOperationRepository for SqliteStagingOperationRepository {
    async fn create(&self, op: &StagingOperation) -> SchedulerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO staging_operations (id, task_id, worker_id, compute_resource_id, direction,
                source_path, destination_path, status, total_size, expected_checksum,
                transferred_size, attempts, error_message, timeout_seconds, created_at,
                started_at, completed_at, last_heartbeat, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&op.id)
        .bind(&op.task_id)
        .bind(&op.worker_id)
        .bind(&op.compute_resource_id)
        .bind(op.direction)
        .bind(&op.source_path)
        .bind(&op.destination_path)
        .bind(op.status)
        .bind(op.total_size)
        .bind(&op.expected_checksum)
        .bind(op.transferred_size)
        .bind(op.attempts as i64)
        .bind(&op.error_message)
        .bind(op.timeout_seconds)
        .bind(op.created_at)
        .bind(op.started_at)
        .bind(op.completed_at)
        .bind(op.last_heartbeat)
        .bind(op.updated_at)
        .execute(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        debug!("创建暂存操作成功: {} (任务 {})", op.id, op.task_id);
        Ok(())
    }

    async fn get_by_id(&self, id: &str) -> SchedulerResult<Option<StagingOperation>> {
        let row = sqlx::query(&format!(
            "SELECT {STAGING_COLUMNS} FROM staging_operations WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        row.as_ref().map(Self::row_to_operation).transpose()
    }

    async fn list_by_task(&self, task_id: &str) -> SchedulerResult<Vec<StagingOperation>> {
        let sql = format!(
            "SELECT {STAGING_COLUMNS} FROM staging_operations WHERE task_id = ? \
             ORDER BY created_at ASC, id ASC"
        );
        self.fetch_operations(&sql, Some(task_id)).await
    }

    async fn list_by_status(&self, status: StagingStatus) -> SchedulerResult<Vec<StagingOperation>> {
        let sql = format!(
            "SELECT {STAGING_COLUMNS} FROM staging_operations WHERE status = ? \
             ORDER BY created_at ASC, id ASC"
        );
        self.fetch_operations(&sql, Some(status.as_str())).await
    }

    async fn list_incomplete(&self) -> SchedulerResult<Vec<StagingOperation>> {
        let sql = format!(
            "SELECT {STAGING_COLUMNS} FROM staging_operations \
             WHERE status IN ('PENDING', 'RUNNING') ORDER BY created_at ASC, id ASC"
        );
        self.fetch_operations(&sql, None).await
    }

    async fn update_if_status(
        &self,
        op: &StagingOperation,
        expected: StagingStatus,
    ) -> SchedulerResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE staging_operations
            SET status = ?, transferred_size = ?, total_size = ?, attempts = ?, error_message = ?,
                started_at = ?, completed_at = ?, last_heartbeat = ?, updated_at = ?
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(op.status)
        .bind(op.transferred_size)
        .bind(op.total_size)
        .bind(op.attempts as i64)
        .bind(&op.error_message)
        .bind(op.started_at)
        .bind(op.completed_at)
        .bind(op.last_heartbeat)
        .bind(op.updated_at)
        .bind(&op.id)
        .bind(expected)
        .execute(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete(&self, id: &str) -> SchedulerResult<bool> {
        let result = sqlx::query("DELETE FROM staging_operations WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;
        Ok(result.rows_affected() > 0)
    }
}
