//! SQLite test database for integration testing
//!
//! An in-memory database with the full schema applied, plus repository
//! handles bound to it.

use std::sync::Arc;

use anyhow::Result;
use scheduler_domain::repositories::{
    SchedulerStateRepository, StagingOperationRepository, TaskRepository, WorkerRepository,
};
use scheduler_infrastructure::database::{
    DatabaseManager, SqliteSchedulerStateRepository, SqliteStagingOperationRepository,
    SqliteTaskRepository, SqliteWorkerRepository,
};
use sqlx::Row;

pub struct DatabaseTestContainer {
    pub db: DatabaseManager,
    pub tasks: Arc<dyn TaskRepository>,
    pub workers: Arc<dyn WorkerRepository>,
    pub staging: Arc<dyn StagingOperationRepository>,
    pub state: Arc<dyn SchedulerStateRepository>,
}

impl DatabaseTestContainer {
    /// 建立内存数据库并执行建表
    pub async fn new() -> Result<Self> {
        let db = DatabaseManager::in_memory().await?;
        db.migrate().await?;
        let pool = db.pool().clone();

        Ok(Self {
            tasks: Arc::new(SqliteTaskRepository::new(pool.clone())),
            workers: Arc::new(SqliteWorkerRepository::new(pool.clone())),
            staging: Arc::new(SqliteStagingOperationRepository::new(pool.clone())),
            state: Arc::new(SqliteSchedulerStateRepository::new(pool)),
            db,
        })
    }

    /// Clean all tables (useful for test isolation)
    pub async fn clean_tables(&self) -> Result<()> {
        for table in ["staging_operations", "tasks", "workers", "scheduler_state"] {
            sqlx::query(&format!("DELETE FROM {table}"))
                .execute(self.db.pool())
                .await?;
        }
        Ok(())
    }

    pub async fn get_table_count(&self, table_name: &str) -> Result<i64> {
        let row = sqlx::query(&format!("SELECT COUNT(*) AS count FROM {table_name}"))
            .fetch_one(self.db.pool())
            .await?;
        Ok(row.try_get("count")?)
    }
}
