use async_trait::async_trait;
use scheduler_domain::{
    entities::{Task, TaskStatus},
    repositories::TaskRepository,
};
use scheduler_errors::{SchedulerError, SchedulerResult};
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use tracing::debug;

use super::rows::{from_json, to_json};

const TASK_COLUMNS: &str = "id, experiment_id, command, input_files, output_files, requirements, \
     compute_resource_id, worker_id, status, retry_count, max_retries, error, created_at, \
     updated_at, started_at, staging_started_at, staging_completed_at, completed_at, metadata, version";

pub struct SqliteTaskRepository {
    pool: SqlitePool,
}

impl SqliteTaskRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_task(row: &SqliteRow) -> SchedulerResult<Task> {
        let input_files: String = row.try_get("input_files")?;
        let output_files: String = row.try_get("output_files")?;
        let requirements: String = row.try_get("requirements")?;
        let metadata: String = row.try_get("metadata")?;

        Ok(Task {
            id: row.try_get("id")?,
            experiment_id: row.try_get("experiment_id")?,
            command: row.try_get("command")?,
            input_files: from_json(&input_files, "input_files")?,
            output_files: from_json(&output_files, "output_files")?,
            requirements: from_json(&requirements, "requirements")?,
            compute_resource_id: row.try_get("compute_resource_id")?,
            worker_id: row.try_get("worker_id")?,
            status: row.try_get("status")?,
            retry_count: row.try_get::<i64, _>("retry_count")? as u32,
            max_retries: row.try_get::<i64, _>("max_retries")? as u32,
            error: row.try_get("error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            started_at: row.try_get("started_at")?,
            staging_started_at: row.try_get("staging_started_at")?,
            staging_completed_at: row.try_get("staging_completed_at")?,
            completed_at: row.try_get("completed_at")?,
            metadata: from_json(&metadata, "metadata")?,
            version: row.try_get("version")?,
        })
    }

    async fn fetch_tasks(&self, sql: &str, binds: &[&str]) -> SchedulerResult<Vec<Task>> {
        let mut query = sqlx::query(sql);
        for value in binds {
            query = query.bind(*value);
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;
        rows.iter().map(Self::row_to_task).collect()
    }
}

#[async_trait]
impl TaskRepository for SqliteTaskRepository {
    async fn insert_if_absent(&self, task: &Task) -> SchedulerResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO tasks (id, experiment_id, command, input_files, output_files, requirements,
                compute_resource_id, worker_id, status, retry_count, max_retries, error, created_at,
                updated_at, started_at, staging_started_at, staging_completed_at, completed_at,
                metadata, version)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(&task.id)
        .bind(&task.experiment_id)
        .bind(&task.command)
        .bind(to_json(&task.input_files, "input_files")?)
        .bind(to_json(&task.output_files, "output_files")?)
        .bind(to_json(&task.requirements, "requirements")?)
        .bind(&task.compute_resource_id)
        .bind(&task.worker_id)
        .bind(task.status)
        .bind(task.retry_count as i64)
        .bind(task.max_retries as i64)
        .bind(&task.error)
        .bind(task.created_at)
        .bind(task.updated_at)
        .bind(task.started_at)
        .bind(task.staging_started_at)
        .bind(task.staging_completed_at)
        .bind(task.completed_at)
        .bind(to_json(&task.metadata, "metadata")?)
        .bind(task.version)
        .execute(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        let inserted = result.rows_affected() > 0;
        if inserted {
            debug!("创建任务成功: {}", task.id);
        }
        Ok(inserted)
    }

    async fn get_by_id(&self, id: &str) -> SchedulerResult<Option<Task>> {
        let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;

        row.as_ref().map(Self::row_to_task).transpose()
    }

    async fn update_versioned(&self, task: &Task) -> SchedulerResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET command = ?, input_files = ?, output_files = ?, requirements = ?,
                compute_resource_id = ?, worker_id = ?, status = ?, retry_count = ?,
                max_retries = ?, error = ?, updated_at = ?, started_at = ?,
                staging_started_at = ?, staging_completed_at = ?, completed_at = ?,
                metadata = ?, version = version + 1
            WHERE id = ? AND version = ?
            "#,
        )
        .bind(&task.command)
        .bind(to_json(&task.input_files, "input_files")?)
        .bind(to_json(&task.output_files, "output_files")?)
        .bind(to_json(&task.requirements, "requirements")?)
        .bind(&task.compute_resource_id)
        .bind(&task.worker_id)
        .bind(task.status)
        .bind(task.retry_count as i64)
        .bind(task.max_retries as i64)
        .bind(&task.error)
        .bind(task.updated_at)
        .bind(task.started_at)
        .bind(task.staging_started_at)
        .bind(task.staging_completed_at)
        .bind(task.completed_at)
        .bind(to_json(&task.metadata, "metadata")?)
        .bind(&task.id)
        .bind(task.version)
        .execute(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        let updated = result.rows_affected() > 0;
        if updated {
            debug!(
                "更新任务成功: {} -> {} (版本 {})",
                task.id,
                task.status,
                task.version + 1
            );
        }
        Ok(updated)
    }

    async fn list_by_status(&self, status: TaskStatus) -> SchedulerResult<Vec<Task>> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE status = ? ORDER BY created_at ASC, id ASC"
        );
        self.fetch_tasks(&sql, &[status.as_str()]).await
    }

    async fn list_by_experiment(&self, experiment_id: &str) -> SchedulerResult<Vec<Task>> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE experiment_id = ? ORDER BY created_at ASC, id ASC"
        );
        self.fetch_tasks(&sql, &[experiment_id]).await
    }

    async fn list_by_worker(&self, worker_id: &str) -> SchedulerResult<Vec<Task>> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE worker_id = ? ORDER BY created_at ASC, id ASC"
        );
        self.fetch_tasks(&sql, &[worker_id]).await
    }

    async fn list_assigned(&self) -> SchedulerResult<Vec<Task>> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks \
             WHERE status IN ('DATA_STAGING', 'ENV_SETUP', 'RUNNING', 'OUTPUT_STAGING') \
                OR (status = 'QUEUED' AND worker_id IS NOT NULL) \
             ORDER BY created_at ASC, id ASC"
        );
        self.fetch_tasks(&sql, &[]).await
    }

    async fn list_queued_unassigned(&self, limit: u32) -> SchedulerResult<Vec<Task>> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE status = 'QUEUED' AND worker_id IS NULL \
             ORDER BY created_at ASC, id ASC LIMIT ?"
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        rows.iter().map(Self::row_to_task).collect()
    }

    async fn count(&self) -> SchedulerResult<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM tasks")
            .fetch_one(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;
        Ok(row.try_get::<i64, _>("count")? as u64)
    }

    async fn delete_by_experiment(&self, experiment_id: &str) -> SchedulerResult<u64> {
        let result = sqlx::query("DELETE FROM tasks WHERE experiment_id = ?")
            .bind(experiment_id)
            .execute(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;

        debug!(
            "删除实验 {} 的任务 {} 个",
            experiment_id,
            result.rows_affected()
        );
        Ok(result.rows_affected())
    }
}
