use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use scheduler_domain::messaging::SchedulerMessage;

/// 每个在线Worker的下行发送端
///
/// 发送一律不阻塞调用方：满了直接丢弃并记录，通道关闭则移除。
#[derive(Debug, Clone, Default)]
pub struct WorkerChannels {
    senders: Arc<RwLock<HashMap<String, mpsc::Sender<SchedulerMessage>>>>,
}

impl WorkerChannels {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, mpsc::Sender<SchedulerMessage>>> {
        match self.senders.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, mpsc::Sender<SchedulerMessage>>> {
        match self.senders.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// 绑定Worker的下行通道，旧连接的发送端被替换
    pub fn attach(&self, worker_id: &str, sender: mpsc::Sender<SchedulerMessage>) {
        if self.write().insert(worker_id.to_string(), sender).is_some() {
            debug!("Worker {} 的下行通道被新连接替换", worker_id);
        }
    }

    /// 只有当前登记的仍是这条连接时才解绑，避免误删重连后的新通道
    pub fn detach_if_same(&self, worker_id: &str, sender: &mpsc::Sender<SchedulerMessage>) -> bool {
        let mut senders = self.write();
        if senders
            .get(worker_id)
            .is_some_and(|current| current.same_channel(sender))
        {
            senders.remove(worker_id);
            return true;
        }
        false
    }

    pub fn is_attached(&self, worker_id: &str) -> bool {
        self.read().contains_key(worker_id)
    }

    pub fn attached_count(&self) -> usize {
        self.read().len()
    }

    /// 非阻塞投递，返回是否进入了通道
    pub fn send(&self, worker_id: &str, message: SchedulerMessage) -> bool {
        let Some(sender) = self.read().get(worker_id).cloned() else {
            debug!("Worker {} 没有在线连接，消息未投递", worker_id);
            return false;
        };

        match sender.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("Worker {} 下行通道已满，丢弃消息", worker_id);
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.detach_if_same(worker_id, &sender);
                debug!("Worker {} 下行通道已关闭", worker_id);
                false
            }
        }
    }

    /// 后台投递，调用方不等待结果
    pub fn deliver_detached(&self, worker_id: &str, message: SchedulerMessage, timeout: Duration) {
        let Some(sender) = self.read().get(worker_id).cloned() else {
            debug!("Worker {} 没有在线连接，跳过后台投递", worker_id);
            return;
        };

        let worker_id = worker_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = sender.send_timeout(message, timeout).await {
                warn!("向Worker {} 投递消息失败: {}", worker_id, e);
            }
        });
    }

    /// 通知所有在线Worker调度器即将关闭
    pub fn broadcast_shutdown(&self, reason: &str) -> usize {
        let worker_ids: Vec<String> = self.read().keys().cloned().collect();
        worker_ids
            .iter()
            .filter(|id| {
                self.send(
                    id,
                    SchedulerMessage::Shutdown {
                        reason: reason.to_string(),
                    },
                )
            })
            .count()
    }
}
