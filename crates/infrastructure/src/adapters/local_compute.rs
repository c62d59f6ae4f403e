//! 裸机计算适配器：在本机用 `sh` 执行生成的任务脚本

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use scheduler_domain::ports::{ComputeAdapter, JobHandle, JobState};
use scheduler_domain::{ResourceType, TaskAssignment};
use scheduler_errors::{AdapterError, AdapterErrorKind};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{oneshot, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

struct JobEntry {
    state: JobState,
    cancel_tx: Option<oneshot::Sender<()>>,
}

pub struct LocalProcessAdapter {
    resource_id: String,
    shell: String,
    jobs: Arc<RwLock<HashMap<String, JobEntry>>>,
}

impl LocalProcessAdapter {
    pub fn new<S: Into<String>>(resource_id: S) -> Self {
        Self {
            resource_id: resource_id.into(),
            shell: "sh".to_string(),
            jobs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn with_shell<S: Into<String>>(mut self, shell: S) -> Self {
        self.shell = shell.into();
        self
    }

    pub async fn running_jobs(&self) -> usize {
        self.jobs
            .read()
            .await
            .values()
            .filter(|entry| matches!(entry.state, JobState::Running))
            .count()
    }

    fn err(&self, operation: &str, kind: AdapterErrorKind, message: impl Into<String>) -> AdapterError {
        AdapterError::new(&self.resource_id, operation, kind, message)
    }

    async fn collect_lines<R: AsyncRead + Unpin>(reader: Option<R>) -> String {
        let Some(reader) = reader else {
            return String::new();
        };
        let mut lines = BufReader::new(reader).lines();
        let mut output = Vec::new();
        while let Ok(Some(line)) = lines.next_line().await {
            output.push(line);
        }
        output.join("\n")
    }
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[async_trait]
impl ComputeAdapter for LocalProcessAdapter {
    fn resource_id(&self) -> &str {
        &self.resource_id
    }

    fn resource_type(&self) -> ResourceType {
        ResourceType::BareMetal
    }

    async fn generate_script(
        &self,
        task: &TaskAssignment,
        output_dir: &Path,
    ) -> Result<PathBuf, AdapterError> {
        tokio::fs::create_dir_all(output_dir)
            .await
            .map_err(|e| AdapterError::from_io(&self.resource_id, "generate_script", &e))?;

        let script = format!(
            "#!/bin/sh\n# task {task_id} experiment {experiment_id}\ncd {work_dir} || exit 1\n{command}\n",
            task_id = task.task_id,
            experiment_id = task.experiment_id,
            work_dir = shell_quote(&task.work_dir),
            command = task.command,
        );
        let path = output_dir.join(format!("task_{}.sh", task.task_id));
        tokio::fs::write(&path, script)
            .await
            .map_err(|e| AdapterError::from_io(&self.resource_id, "generate_script", &e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
                .await
                .map_err(|e| AdapterError::from_io(&self.resource_id, "generate_script", &e))?;
        }

        debug!("生成任务脚本: {}", path.display());
        Ok(path)
    }

    async fn submit_task(&self, script_path: &Path) -> Result<JobHandle, AdapterError> {
        let mut cmd = Command::new(&self.shell);
        cmd.arg(script_path)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = script_path.parent() {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| AdapterError::from_io(&self.resource_id, "submit", &e))?;

        let job_id = Uuid::new_v4().to_string();
        let (cancel_tx, cancel_rx) = oneshot::channel();
        self.jobs.write().await.insert(
            job_id.clone(),
            JobEntry {
                state: JobState::Running,
                cancel_tx: Some(cancel_tx),
            },
        );
        info!(
            "提交本地作业 {} (pid {:?}): {}",
            job_id,
            child.id(),
            script_path.display()
        );

        let stdout = tokio::spawn(Self::collect_lines(child.stdout.take()));
        let stderr = tokio::spawn(Self::collect_lines(child.stderr.take()));
        let jobs = Arc::clone(&self.jobs);
        let id = job_id.clone();

        tokio::spawn(async move {
            let final_state = tokio::select! {
                status = child.wait() => {
                    let exit_code = match status {
                        Ok(status) => status.code().unwrap_or(-1),
                        Err(e) => {
                            warn!("等待作业 {} 结束失败: {}", id, e);
                            -1
                        }
                    };
                    let stdout = stdout.await.unwrap_or_default();
                    let stderr = stderr.await.unwrap_or_default();
                    JobState::Finished { exit_code, stdout, stderr }
                }
                _ = cancel_rx => {
                    if let Err(e) = child.kill().await {
                        warn!("终止作业 {} 失败: {}", id, e);
                    }
                    stdout.abort();
                    stderr.abort();
                    JobState::Canceled
                }
            };

            debug!("本地作业 {} 结束: {:?}", id, final_state);
            if let Some(entry) = jobs.write().await.get_mut(&id) {
                entry.state = final_state;
                entry.cancel_tx = None;
            }
        });

        Ok(JobHandle {
            resource_id: self.resource_id.clone(),
            job_id,
        })
    }

    async fn poll_job(&self, handle: &JobHandle) -> Result<JobState, AdapterError> {
        self.jobs
            .read()
            .await
            .get(&handle.job_id)
            .map(|entry| entry.state.clone())
            .ok_or_else(|| self.err("poll", AdapterErrorKind::NotFound, format!("作业不存在: {}", handle.job_id)))
    }

    async fn cancel_job(&self, handle: &JobHandle) -> Result<(), AdapterError> {
        let mut jobs = self.jobs.write().await;
        let entry = jobs.get_mut(&handle.job_id).ok_or_else(|| {
            self.err("cancel", AdapterErrorKind::NotFound, format!("作业不存在: {}", handle.job_id))
        })?;

        match entry.cancel_tx.take() {
            Some(tx) => {
                let _ = tx.send(());
                info!("取消本地作业 {}", handle.job_id);
            }
            None => debug!("作业 {} 已结束，忽略取消", handle.job_id),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;
    use std::time::Duration;
    use tempfile::TempDir;

    fn assignment(command: &str, work_dir: &Path) -> TaskAssignment {
        TaskAssignment {
            task_id: "t1".to_string(),
            experiment_id: "exp".to_string(),
            command: command.to_string(),
            work_dir: work_dir.display().to_string(),
            input_files: vec![],
            output_files: vec![],
            metadata: Map::new(),
        }
    }

    async fn wait_finished(adapter: &LocalProcessAdapter, handle: &JobHandle) -> JobState {
        for _ in 0..200 {
            let state = adapter.poll_job(handle).await.unwrap();
            if !matches!(state, JobState::Running | JobState::Pending) {
                return state;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("作业未在预期时间内结束");
    }

    #[tokio::test]
    async fn test_runs_script_in_work_dir() {
        let dir = TempDir::new().unwrap();
        let adapter = LocalProcessAdapter::new("host-1");
        let script = adapter
            .generate_script(&assignment("echo hi > out.txt; echo done", dir.path()), dir.path())
            .await
            .unwrap();
        let handle = adapter.submit_task(&script).await.unwrap();

        match wait_finished(&adapter, &handle).await {
            JobState::Finished { exit_code, stdout, .. } => {
                assert_eq!(exit_code, 0);
                assert_eq!(stdout, "done");
            }
            other => panic!("unexpected state {other:?}"),
        }
        assert!(dir.path().join("out.txt").exists());
    }

    #[tokio::test]
    async fn test_reports_nonzero_exit() {
        let dir = TempDir::new().unwrap();
        let adapter = LocalProcessAdapter::new("host-1");
        let script = adapter
            .generate_script(&assignment("echo boom >&2; exit 1", dir.path()), dir.path())
            .await
            .unwrap();
        let handle = adapter.submit_task(&script).await.unwrap();

        match wait_finished(&adapter, &handle).await {
            JobState::Finished { exit_code, stderr, .. } => {
                assert_eq!(exit_code, 1);
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected state {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancel_running_job() {
        let dir = TempDir::new().unwrap();
        let adapter = LocalProcessAdapter::new("host-1");
        let script = adapter
            .generate_script(&assignment("exec sleep 30", dir.path()), dir.path())
            .await
            .unwrap();
        let handle = adapter.submit_task(&script).await.unwrap();
        assert_eq!(adapter.running_jobs().await, 1);

        adapter.cancel_job(&handle).await.unwrap();
        assert_eq!(wait_finished(&adapter, &handle).await, JobState::Canceled);
    }

    #[tokio::test]
    async fn test_unknown_job() {
        let adapter = LocalProcessAdapter::new("host-1");
        let handle = JobHandle {
            resource_id: "host-1".to_string(),
            job_id: "missing".to_string(),
        };
        let err = adapter.poll_job(&handle).await.unwrap_err();
        assert_eq!(err.kind, AdapterErrorKind::NotFound);
    }
}
