pub mod sqlite;

pub use sqlite::{
    DatabaseManager, DbPool, SqliteSchedulerStateRepository, SqliteStagingOperationRepository,
    SqliteTaskRepository, SqliteWorkerRepository,
};
