use anyhow::Result;
use chrono::{Duration, Utc};
use scheduler_domain::entities::{
    ConnectionState, FileMetadata, SchedulerState, SchedulerStatus, StagingDirection,
    StagingOperation, StagingStatus, Task, TaskStatus, Worker, WorkerStatus,
};
use scheduler_domain::repositories::*;
use scheduler_infrastructure::database::{
    DatabaseManager, SqliteSchedulerStateRepository, SqliteStagingOperationRepository,
    SqliteTaskRepository, SqliteWorkerRepository,
};

async fn setup() -> Result<DatabaseManager> {
    let db = DatabaseManager::in_memory().await?;
    db.migrate().await?;
    Ok(db)
}

fn connected_worker(id: &str) -> Worker {
    let mut worker = Worker::provisioned(id, "exp-1", "host-1", "user-1", 3600);
    worker.connection_state = ConnectionState::Connected;
    worker
}

#[tokio::test]
async fn test_task_insert_is_idempotent() -> Result<()> {
    let db = setup().await?;
    let repo = SqliteTaskRepository::new(db.pool().clone());

    let mut task = Task::new("t1", "exp-1", "echo hi");
    task.input_files
        .push(FileMetadata::new("nfs-1:/in/a.txt", 5, Some("abc".to_string())));
    task.transition_to(TaskStatus::Queued)?;

    assert!(repo.insert_if_absent(&task).await?);
    assert!(!repo.insert_if_absent(&task).await?);
    assert_eq!(repo.count().await?, 1);

    let stored = repo.get_by_id("t1").await?.expect("task should exist");
    assert_eq!(stored.status, TaskStatus::Queued);
    assert_eq!(stored.input_files, task.input_files);
    assert_eq!(stored.version, 0);
    Ok(())
}

#[tokio::test]
async fn test_task_versioned_update_rejects_stale_writer() -> Result<()> {
    let db = setup().await?;
    let repo = SqliteTaskRepository::new(db.pool().clone());

    let mut task = Task::new("t1", "exp-1", "echo hi");
    task.transition_to(TaskStatus::Queued)?;
    repo.insert_if_absent(&task).await?;

    let mut first = repo.get_by_id("t1").await?.unwrap();
    let mut second = first.clone();

    first.transition_to(TaskStatus::Running)?;
    assert!(repo.update_versioned(&first).await?);

    second.transition_to(TaskStatus::Canceled)?;
    assert!(!repo.update_versioned(&second).await?);

    let stored = repo.get_by_id("t1").await?.unwrap();
    assert_eq!(stored.status, TaskStatus::Running);
    assert_eq!(stored.version, 1);
    Ok(())
}

#[tokio::test]
async fn test_task_queries() -> Result<()> {
    let db = setup().await?;
    let tasks = SqliteTaskRepository::new(db.pool().clone());
    let workers = SqliteWorkerRepository::new(db.pool().clone());
    workers.create(&connected_worker("w1")).await?;

    for i in 0..4 {
        let mut task = Task::new(format!("t{i}"), "exp-1", "true");
        task.transition_to(TaskStatus::Queued)?;
        if i == 0 {
            task.worker_id = Some("w1".to_string());
            task.transition_to(TaskStatus::Running)?;
        }
        tasks.insert_if_absent(&task).await?;
    }
    let mut other = Task::new("other", "exp-2", "true");
    other.transition_to(TaskStatus::Queued)?;
    tasks.insert_if_absent(&other).await?;

    assert_eq!(tasks.list_by_experiment("exp-1").await?.len(), 4);
    assert_eq!(tasks.list_by_worker("w1").await?.len(), 1);
    assert_eq!(tasks.list_assigned().await?.len(), 1);
    assert_eq!(tasks.list_queued_unassigned(2).await?.len(), 2);
    assert_eq!(tasks.list_by_status(TaskStatus::Queued).await?.len(), 4);

    assert_eq!(tasks.delete_by_experiment("exp-2").await?, 1);
    assert_eq!(tasks.count().await?, 4);
    Ok(())
}

#[tokio::test]
async fn test_worker_claim_is_exclusive() -> Result<()> {
    let db = setup().await?;
    let workers = SqliteWorkerRepository::new(db.pool().clone());
    workers.create(&connected_worker("w1")).await?;

    let now = Utc::now();
    assert!(workers.try_claim("w1", "t1", now).await?);
    assert!(!workers.try_claim("w1", "t2", now).await?);

    let worker = workers.get_by_id("w1").await?.unwrap();
    assert_eq!(worker.status, WorkerStatus::Busy);
    assert_eq!(worker.current_task_id.as_deref(), Some("t1"));

    // 只有持有该任务时才能释放
    assert!(!workers.release("w1", "t2", now).await?);
    assert!(workers.release("w1", "t1", now).await?);
    let worker = workers.get_by_id("w1").await?.unwrap();
    assert!(worker.is_usable());
    Ok(())
}

#[tokio::test]
async fn test_disconnected_worker_cannot_be_claimed() -> Result<()> {
    let db = setup().await?;
    let workers = SqliteWorkerRepository::new(db.pool().clone());
    workers
        .create(&Worker::provisioned("w1", "exp-1", "host-1", "user-1", 3600))
        .await?;

    assert!(!workers.try_claim("w1", "t1", Utc::now()).await?);
    assert!(workers.list_usable("exp-1").await?.is_empty());
    assert_eq!(
        workers.list_by_connection(ConnectionState::Disconnected).await?.len(),
        1
    );
    Ok(())
}

#[tokio::test]
async fn test_worker_update_missing_row() -> Result<()> {
    let db = setup().await?;
    let workers = SqliteWorkerRepository::new(db.pool().clone());
    let result = workers.update(&connected_worker("ghost")).await;
    assert!(result.is_err());
    Ok(())
}

#[tokio::test]
async fn test_staging_status_is_monotonic() -> Result<()> {
    let db = setup().await?;
    let tasks = SqliteTaskRepository::new(db.pool().clone());
    let staging = SqliteStagingOperationRepository::new(db.pool().clone());
    tasks.insert_if_absent(&Task::new("t1", "exp-1", "true")).await?;

    let op = StagingOperation::new(
        "t1",
        "w1",
        "host-1",
        StagingDirection::Input,
        "nfs-1:/in/a.txt",
        "host-1:/work/t1/a.txt",
        5,
        0,
    );
    staging.create(&op).await?;
    assert_eq!(staging.list_incomplete().await?.len(), 1);

    let mut running = op.clone();
    running.status = StagingStatus::Running;
    running.started_at = Some(Utc::now());
    assert!(staging.update_if_status(&running, StagingStatus::Pending).await?);

    let mut done = running.clone();
    done.status = StagingStatus::Completed;
    done.transferred_size = 5;
    assert!(staging.update_if_status(&done, StagingStatus::Running).await?);

    // 已完成的操作不能被陈旧的写入者改回
    let mut stale = running.clone();
    stale.status = StagingStatus::Failed;
    assert!(!staging.update_if_status(&stale, StagingStatus::Running).await?);

    let stored = staging.get_by_id(&op.id).await?.unwrap();
    assert_eq!(stored.status, StagingStatus::Completed);
    assert!(staging.list_incomplete().await?.is_empty());
    assert_eq!(staging.list_by_task("t1").await?.len(), 1);
    assert_eq!(staging.list_by_status(StagingStatus::Completed).await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_staging_removed_with_task() -> Result<()> {
    let db = setup().await?;
    let tasks = SqliteTaskRepository::new(db.pool().clone());
    let staging = SqliteStagingOperationRepository::new(db.pool().clone());
    tasks.insert_if_absent(&Task::new("t1", "exp-1", "true")).await?;
    let op = StagingOperation::new(
        "t1",
        "w1",
        "host-1",
        StagingDirection::Output,
        "host-1:/work/t1/out.txt",
        "nfs-1:/out/out.txt",
        0,
        60,
    );
    staging.create(&op).await?;

    tasks.delete_by_experiment("exp-1").await?;
    assert!(staging.get_by_id(&op.id).await?.is_none());
    assert!(!staging.delete(&op.id).await?);
    Ok(())
}

#[tokio::test]
async fn test_scheduler_state_lifecycle() -> Result<()> {
    let db = setup().await?;
    let repo = SqliteSchedulerStateRepository::new(db.pool().clone());
    assert!(repo.get().await?.is_none());

    let state = SchedulerState::starting("instance-a");
    repo.upsert(&state).await?;
    let later = Utc::now() + Duration::seconds(5);
    assert!(repo.update_heartbeat("instance-a", later).await?);
    assert!(!repo.update_heartbeat("instance-b", later).await?);

    let stored = repo.get().await?.unwrap();
    assert_eq!(stored.status, SchedulerStatus::Running);
    assert!(!stored.clean_shutdown);

    assert!(repo.mark_clean_shutdown("instance-a", Utc::now()).await?);
    let stored = repo.get().await?.unwrap();
    assert_eq!(stored.status, SchedulerStatus::Stopped);
    assert!(stored.clean_shutdown);
    assert!(!stored.indicates_crash());
    Ok(())
}
