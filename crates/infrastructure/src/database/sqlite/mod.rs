mod rows;
pub mod schema;
pub mod sqlite_scheduler_state_repository;
pub mod sqlite_staging_repository;
pub mod sqlite_task_repository;
pub mod sqlite_worker_repository;

pub use sqlite_scheduler_state_repository::SqliteSchedulerStateRepository;
pub use sqlite_staging_repository::SqliteStagingOperationRepository;
pub use sqlite_task_repository::SqliteTaskRepository;
pub use sqlite_worker_repository::SqliteWorkerRepository;

use std::str::FromStr;
use std::time::Duration;

use scheduler_config::DatabaseConfig;
use scheduler_errors::{SchedulerError, SchedulerResult};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite, SqlitePool};
use tracing::{debug, info};

pub type DbPool = Pool<Sqlite>;

pub struct DatabaseManager {
    pool: SqlitePool,
}

impl DatabaseManager {
    pub async fn new(config: &DatabaseConfig) -> SchedulerResult<Self> {
        let options = SqliteConnectOptions::from_str(&config.url)
            .map_err(SchedulerError::Database)?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connection_timeout_seconds))
            .idle_timeout(Duration::from_secs(config.idle_timeout_seconds))
            .max_lifetime(Duration::from_secs(1800)) // 30分钟默认生命周期
            .connect_with(options)
            .await
            .map_err(SchedulerError::Database)?;

        info!("数据库连接池已建立: {}", config.url);
        Ok(Self { pool })
    }

    /// 单连接的内存数据库，连接不过期，数据随连接池一起释放
    pub async fn in_memory() -> SchedulerResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(SchedulerError::Database)?
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(SchedulerError::Database)?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> SchedulerResult<()> {
        for statement in schema::SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(SchedulerError::Database)?;
        }
        debug!("数据库表结构已就绪");
        Ok(())
    }

    pub async fn health_check(&self) -> SchedulerResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
