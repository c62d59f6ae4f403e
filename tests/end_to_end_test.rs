mod common;

use std::time::Duration;

use sha2::{Digest, Sha256};

use scheduler_dispatcher::TaskDispatchService;
use scheduler_domain::entities::{ConnectionState, TaskStatus, WorkerStatus};
use scheduler_domain::ports::StorageAdapter;
use scheduler_domain::repositories::{TaskRepository, WorkerRepository};
use scheduler_domain::FileMetadata;
use scheduler_infrastructure::{DatabaseManager, SqliteTaskRepository, SqliteWorkerRepository};
use scheduler_testing_utils::TestEnv;

use common::*;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failing_command_is_retried_then_failed() {
    let harness = Harness::start().await;

    let mut job = task("retry-1", "echo attempt >> attempts.log; exit 1");
    job.max_retries = 3;
    harness.submit(job).await;

    let failed = harness
        .wait_for_status("retry-1", TaskStatus::Failed, Duration::from_secs(60))
        .await;
    assert_eq!(failed.retry_count, 3);
    let error = failed.error.expect("失败任务应带错误信息");
    assert!(!error.trim().is_empty());
    assert!(failed.completed_at.is_some());

    // 首次执行加三次重试
    let log = std::fs::read_to_string(harness.work_dir("retry-1").join("attempts.log")).unwrap();
    assert_eq!(log.lines().count(), 4);

    let summary = harness.app.dispatcher().experiment_summary(EXPERIMENT).await.unwrap();
    assert_eq!(summary.total, 1);

    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_inputs_are_staged_and_output_matches_concatenation() {
    let harness = Harness::start().await;

    let first = b"alpha line\n".to_vec();
    let second = b"beta line\nwith two rows\n".to_vec();
    harness.put_archive("/inputs/a.txt", &first).await;
    harness.put_archive("/inputs/b.txt", &second).await;

    let mut job = task("concat-1", "cat a.txt b.txt > result.txt");
    job.input_files = vec![
        FileMetadata::new("archive:/inputs/a.txt", first.len() as i64, None),
        FileMetadata::new("archive:/inputs/b.txt", second.len() as i64, None),
    ];
    job.output_files = vec![FileMetadata::new("archive:/outputs/result.txt", 0, None)];
    harness.submit(job).await;

    let completed = harness
        .wait_for_status("concat-1", TaskStatus::Completed, Duration::from_secs(60))
        .await;
    assert!(completed.error.is_none());
    assert!(completed.staging_completed_at.is_some());

    // 输入被暂存到任务工作目录
    let work_dir = harness.work_dir("concat-1");
    assert_eq!(std::fs::read(work_dir.join("a.txt")).unwrap(), first);
    assert_eq!(std::fs::read(work_dir.join("b.txt")).unwrap(), second);

    let mut expected = first.clone();
    expected.extend_from_slice(&second);
    let expected_checksum = format!("{:x}", Sha256::digest(&expected));

    let checksum = harness.archive.checksum("/outputs/result.txt").await.unwrap();
    assert_eq!(checksum, expected_checksum);
    assert_eq!(harness.archive.get("/outputs/result.txt").await.unwrap(), expected);

    let ops = harness.app.tracker().operations_for_task("concat-1").await.unwrap();
    assert_eq!(ops.len(), 3);

    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_while_running_does_not_wait_for_worker() {
    let harness = Harness::start().await;

    harness.submit(task("cancel-1", "exec sleep 30")).await;
    harness
        .wait_for_status("cancel-1", TaskStatus::Running, Duration::from_secs(30))
        .await;
    assert_eq!(harness.compute.running_jobs().await, 1);

    let canceled = tokio::time::timeout(
        Duration::from_secs(2),
        harness.app.dispatcher().cancel("cancel-1", "用户取消"),
    )
    .await
    .expect("取消不应等待Worker确认")
    .unwrap();
    assert_eq!(canceled.status, TaskStatus::Canceled);
    assert_eq!(harness.task("cancel-1").await.status, TaskStatus::Canceled);

    let worker = harness.app.pool().get_worker(WORKER).await.unwrap().unwrap();
    assert_eq!(worker.status, WorkerStatus::Idle);
    assert!(worker.current_task_id.is_none());

    // 取消通知送达后，远端作业被终止
    let compute = harness.compute.clone();
    let stopped = TestEnv::wait_for(
        || {
            let compute = compute.clone();
            async move { compute.running_jobs().await == 0 }
        },
        Duration::from_secs(10),
    )
    .await;
    assert!(stopped, "远端作业未被终止");

    // 重复取消不改变终止状态
    let again = harness.app.dispatcher().cancel("cancel-1", "再次取消").await.unwrap();
    assert_eq!(again.status, TaskStatus::Canceled);

    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_graceful_restart_requeues_running_task_without_charge() {
    let harness = Harness::start().await;

    harness.submit(task("restart-1", "exec sleep 30")).await;
    harness
        .wait_for_status("restart-1", TaskStatus::Running, Duration::from_secs(30))
        .await;

    let dir = harness.halt().await;

    // 停止后任务已退回队列，Worker不再持有它
    {
        let db = DatabaseManager::new(&database_config(dir.path())).await.unwrap();
        let tasks = SqliteTaskRepository::new(db.pool().clone());
        let stopped = tasks.get_by_id("restart-1").await.unwrap().unwrap();
        assert_eq!(stopped.status, TaskStatus::Queued);
        assert_eq!(stopped.retry_count, 0);
        assert_eq!(stopped.worker_id, None);

        let workers = SqliteWorkerRepository::new(db.pool().clone());
        let worker = workers.get_by_id(WORKER).await.unwrap().unwrap();
        assert_eq!(worker.status, WorkerStatus::Idle);
        assert_eq!(worker.current_task_id, None);
    }

    let harness = Harness::boot(dir).await;
    assert!(!harness.recovery.crash_detected);
    assert!(harness.recovery.requeued_tasks.is_empty());

    // 本地Worker重新注册成功并再次执行该任务
    let rerun = harness
        .wait_for_status("restart-1", TaskStatus::Running, Duration::from_secs(30))
        .await;
    assert_eq!(rerun.retry_count, 0);
    assert_eq!(rerun.worker_id.as_deref(), Some(WORKER));

    let worker = harness.app.pool().get_worker(WORKER).await.unwrap().unwrap();
    assert_eq!(worker.connection_state, ConnectionState::Connected);
    assert_eq!(worker.current_task_id.as_deref(), Some("restart-1"));

    harness.app.dispatcher().cancel("restart-1", "测试结束").await.unwrap();
    harness.stop().await;
}
