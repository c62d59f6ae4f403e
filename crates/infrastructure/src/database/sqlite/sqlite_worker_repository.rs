use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scheduler_domain::{
    entities::{ConnectionState, Worker},
    repositories::WorkerRepository,
};
use scheduler_errors::{SchedulerError, SchedulerResult};
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use tracing::debug;

use super::rows::{from_json, to_json};

const WORKER_COLUMNS: &str = "id, compute_resource_id, experiment_id, user_id, status, \
     connection_state, current_task_id, walltime_secs, walltime_remaining_secs, capabilities, \
     metadata, registered_at, last_heartbeat, last_seen_at, created_at, updated_at";

pub struct SqliteWorkerRepository {
    pool: SqlitePool,
}

impl SqliteWorkerRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_worker(row: &SqliteRow) -> SchedulerResult<Worker> {
        let capabilities: String = row.try_get("capabilities")?;
        let metadata: String = row.try_get("metadata")?;

        Ok(Worker {
            id: row.try_get("id")?,
            compute_resource_id: row.try_get("compute_resource_id")?,
            experiment_id: row.try_get("experiment_id")?,
            user_id: row.try_get("user_id")?,
            status: row.try_get("status")?,
            connection_state: row.try_get("connection_state")?,
            current_task_id: row.try_get("current_task_id")?,
            walltime_secs: row.try_get("walltime_secs")?,
            walltime_remaining_secs: row.try_get("walltime_remaining_secs")?,
            capabilities: from_json(&capabilities, "capabilities")?,
            metadata: from_json(&metadata, "metadata")?,
            registered_at: row.try_get("registered_at")?,
            last_heartbeat: row.try_get("last_heartbeat")?,
            last_seen_at: row.try_get("last_seen_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    async fn fetch_workers(&self, sql: &str, binds: &[&str]) -> SchedulerResult<Vec<Worker>> {
        let mut query = sqlx::query(sql);
        for value in binds {
            query = query.bind(*value);
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;
        rows.iter().map(Self::row_to_worker).collect()
    }
}

#[async_trait]
impl WorkerRepository for SqliteWorkerRepository {
    async fn create(&self, worker: &Worker) -> SchedulerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO workers (id, compute_resource_id, experiment_id, user_id, status,
                connection_state, current_task_id, walltime_secs, walltime_remaining_secs,
                capabilities, metadata, registered_at, last_heartbeat, last_seen_at,
                created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&worker.id)
        .bind(&worker.compute_resource_id)
        .bind(&worker.experiment_id)
        .bind(&worker.user_id)
        .bind(worker.status)
        .bind(worker.connection_state)
        .bind(&worker.current_task_id)
        .bind(worker.walltime_secs)
        .bind(worker.walltime_remaining_secs)
        .bind(to_json(&worker.capabilities, "capabilities")?)
        .bind(to_json(&worker.metadata, "metadata")?)
        .bind(worker.registered_at)
        .bind(worker.last_heartbeat)
        .bind(worker.last_seen_at)
        .bind(worker.created_at)
        .bind(worker.updated_at)
        .execute(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        debug!("创建Worker记录成功: {}", worker.id);
        Ok(())
    }

    async fn get_by_id(&self, id: &str) -> SchedulerResult<Option<Worker>> {
        let row = sqlx::query(&format!("SELECT {WORKER_COLUMNS} FROM workers WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;

        row.as_ref().map(Self::row_to_worker).transpose()
    }

    async fn list_all(&self) -> SchedulerResult<Vec<Worker>> {
        let sql = format!("SELECT {WORKER_COLUMNS} FROM workers ORDER BY registered_at ASC, id ASC");
        self.fetch_workers(&sql, &[]).await
    }

    async fn list_by_experiment(&self, experiment_id: &str) -> SchedulerResult<Vec<Worker>> {
        let sql = format!(
            "SELECT {WORKER_COLUMNS} FROM workers WHERE experiment_id = ? \
             ORDER BY registered_at ASC, id ASC"
        );
        self.fetch_workers(&sql, &[experiment_id]).await
    }

    async fn list_by_connection(&self, state: ConnectionState) -> SchedulerResult<Vec<Worker>> {
        let sql = format!(
            "SELECT {WORKER_COLUMNS} FROM workers WHERE connection_state = ? \
             ORDER BY registered_at ASC, id ASC"
        );
        self.fetch_workers(&sql, &[state.as_str()]).await
    }

    async fn list_usable(&self, experiment_id: &str) -> SchedulerResult<Vec<Worker>> {
        let sql = format!(
            "SELECT {WORKER_COLUMNS} FROM workers \
             WHERE experiment_id = ? AND status = 'IDLE' AND connection_state = 'CONNECTED' \
             ORDER BY registered_at ASC, id ASC"
        );
        self.fetch_workers(&sql, &[experiment_id]).await
    }

    async fn update(&self, worker: &Worker) -> SchedulerResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE workers
            SET status = ?, connection_state = ?, current_task_id = ?,
                walltime_remaining_secs = ?, capabilities = ?, metadata = ?,
                registered_at = ?, last_heartbeat = ?, last_seen_at = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(worker.status)
        .bind(worker.connection_state)
        .bind(&worker.current_task_id)
        .bind(worker.walltime_remaining_secs)
        .bind(to_json(&worker.capabilities, "capabilities")?)
        .bind(to_json(&worker.metadata, "metadata")?)
        .bind(worker.registered_at)
        .bind(worker.last_heartbeat)
        .bind(worker.last_seen_at)
        .bind(worker.updated_at)
        .bind(&worker.id)
        .execute(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        if result.rows_affected() == 0 {
            return Err(SchedulerError::worker_not_found(&worker.id));
        }

        debug!("更新Worker成功: {}", worker.id);
        Ok(())
    }

    async fn try_claim(
        &self,
        worker_id: &str,
        task_id: &str,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE workers
            SET status = 'BUSY', current_task_id = ?, updated_at = ?
            WHERE id = ? AND status = 'IDLE' AND connection_state = 'CONNECTED'
              AND current_task_id IS NULL
            "#,
        )
        .bind(task_id)
        .bind(now)
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        Ok(result.rows_affected() > 0)
    }

    async fn release(
        &self,
        worker_id: &str,
        task_id: &str,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE workers
            SET status = 'IDLE', current_task_id = NULL, updated_at = ?
            WHERE id = ? AND current_task_id = ?
            "#,
        )
        .bind(now)
        .bind(worker_id)
        .bind(task_id)
        .execute(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        Ok(result.rows_affected() > 0)
    }
}
