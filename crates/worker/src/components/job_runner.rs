use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use scheduler_domain::messaging::{TaskAssignment, TaskResultReport};
use scheduler_domain::ports::{ComputeAdapter, JobHandle, JobState};
use scheduler_errors::{AdapterError, FailureClass};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// 任务脚本放在工作目录下的这个子目录中
const SCRIPT_DIR: &str = ".scheduler";

#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    /// 作业已提交到计算资源
    Started { task_id: String },
    Finished(TaskResultReport),
}

/// 正在执行的一个任务
pub struct RunningJob {
    pub task_id: String,
    cancel_tx: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl RunningJob {
    /// 通知执行协程取消作业，取消后不再产生结果事件
    pub fn cancel(&mut self) {
        if let Some(tx) = self.cancel_tx.take() {
            let _ = tx.send(());
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub async fn join(self) {
        if let Err(e) = self.handle.await {
            error!("任务 {} 的执行协程异常退出: {}", self.task_id, e);
        }
    }
}

enum Outcome {
    Exited {
        exit_code: i32,
        stdout: String,
        stderr: String,
    },
    Canceled,
    Failed(AdapterError),
}

/// 通过计算适配器执行任务分配并轮询到结束
pub struct JobRunner {
    worker_id: String,
    compute: Arc<dyn ComputeAdapter>,
    filesystem_root: Option<PathBuf>,
    poll_interval: Duration,
}

impl JobRunner {
    pub fn new<S: Into<String>>(
        worker_id: S,
        compute: Arc<dyn ComputeAdapter>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            compute,
            filesystem_root: None,
            poll_interval,
        }
    }

    /// 调度器下发的是计算资源上的逻辑路径，本机挂载在 `root` 之下时设置
    pub fn with_filesystem_root<P: Into<PathBuf>>(mut self, root: P) -> Self {
        self.filesystem_root = Some(root.into());
        self
    }

    pub fn compute(&self) -> &Arc<dyn ComputeAdapter> {
        &self.compute
    }

    pub fn local_work_dir(&self, work_dir: &str) -> PathBuf {
        match &self.filesystem_root {
            Some(root) => {
                let relative: PathBuf = Path::new(work_dir)
                    .components()
                    .filter(|c| matches!(c, Component::Normal(_)))
                    .collect();
                root.join(relative)
            }
            None => PathBuf::from(work_dir),
        }
    }

    pub fn spawn(
        self: &Arc<Self>,
        assignment: TaskAssignment,
        events: mpsc::UnboundedSender<JobEvent>,
    ) -> RunningJob {
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let task_id = assignment.task_id.clone();
        let runner = Arc::clone(self);
        let handle = tokio::spawn(async move {
            runner.execute(assignment, cancel_rx, events).await;
        });

        RunningJob {
            task_id,
            cancel_tx: Some(cancel_tx),
            handle,
        }
    }

    async fn execute(
        &self,
        assignment: TaskAssignment,
        mut cancel_rx: oneshot::Receiver<()>,
        events: mpsc::UnboundedSender<JobEvent>,
    ) {
        let started = Instant::now();
        let task_id = assignment.task_id.clone();

        let handle = match self.submit(assignment).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!("任务 {} 提交失败: {}", task_id, e);
                let report = self.report(&task_id, started, Outcome::Failed(e));
                let _ = events.send(JobEvent::Finished(report));
                return;
            }
        };

        if cancel_rx.try_recv().is_ok() {
            self.cancel(&task_id, &handle).await;
            return;
        }
        let _ = events.send(JobEvent::Started {
            task_id: task_id.clone(),
        });

        let outcome = loop {
            tokio::select! {
                _ = &mut cancel_rx => {
                    self.cancel(&task_id, &handle).await;
                    return;
                }
                _ = tokio::time::sleep(self.poll_interval) => {
                    match self.compute.poll_job(&handle).await {
                        Ok(JobState::Pending) | Ok(JobState::Running) => continue,
                        Ok(JobState::Finished { exit_code, stdout, stderr }) => {
                            break Outcome::Exited { exit_code, stdout, stderr };
                        }
                        Ok(JobState::Canceled) => break Outcome::Canceled,
                        Err(e) => break Outcome::Failed(e),
                    }
                }
            }
        };

        let report = self.report(&task_id, started, outcome);
        info!(
            "任务 {} 执行结束: success={}, exit_code={:?}",
            task_id, report.success, report.exit_code
        );
        let _ = events.send(JobEvent::Finished(report));
    }

    async fn submit(&self, mut assignment: TaskAssignment) -> Result<JobHandle, AdapterError> {
        let work_dir = self.local_work_dir(&assignment.work_dir);
        tokio::fs::create_dir_all(&work_dir)
            .await
            .map_err(|e| AdapterError::from_io(self.compute.resource_id(), "prepare", &e))?;
        assignment.work_dir = work_dir.display().to_string();

        let script = self
            .compute
            .generate_script(&assignment, &work_dir.join(SCRIPT_DIR))
            .await?;
        let handle = self.compute.submit_task(&script).await?;
        debug!(
            "任务 {} 已提交为作业 {} ({})",
            assignment.task_id, handle.job_id, handle.resource_id
        );
        Ok(handle)
    }

    async fn cancel(&self, task_id: &str, handle: &JobHandle) {
        match self.compute.cancel_job(handle).await {
            Ok(()) => info!("任务 {} 的作业 {} 已取消", task_id, handle.job_id),
            Err(e) => warn!("取消任务 {} 的作业 {} 失败: {}", task_id, handle.job_id, e),
        }
    }

    fn report(&self, task_id: &str, started: Instant, outcome: Outcome) -> TaskResultReport {
        let non_empty = |s: String| if s.trim().is_empty() { None } else { Some(s) };
        let mut report = TaskResultReport {
            worker_id: self.worker_id.clone(),
            task_id: task_id.to_string(),
            success: false,
            exit_code: None,
            output: None,
            error: None,
            failure_class: None,
            duration_ms: started.elapsed().as_millis() as u64,
        };

        match outcome {
            Outcome::Exited {
                exit_code,
                stdout,
                stderr,
            } => {
                report.success = exit_code == 0;
                report.exit_code = Some(exit_code);
                report.output = non_empty(stdout);
                if !report.success {
                    report.error = non_empty(stderr);
                    report.failure_class = Some(FailureClass::Execution);
                }
            }
            Outcome::Canceled => {
                report.error = Some("作业在计算资源上被取消".to_string());
                report.failure_class = Some(FailureClass::Execution);
            }
            Outcome::Failed(e) => {
                report.failure_class = Some(e.failure_class());
                report.error = Some(e.to_string());
            }
        }
        report
    }
}
