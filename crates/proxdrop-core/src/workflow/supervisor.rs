//! 传输调度
//!
//! 全局同一时刻只允许一个传输（发送或接收）。占用期间持有 [`TransferPermit`]，
//! permit 释放（包括 drop）即清除忙碌状态。
//!
//! 取消和用户同意按任务 ID 路由到正在进行的传输。同意先登记再通知界面，
//! 所以在通知回调里直接作答也不会丢失。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use log::{debug, info};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, oneshot};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
struct ActiveTask {
    task_id: String,
    cancel: CancellationToken,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

pub struct TransferSupervisor {
    slot: Arc<Semaphore>,
    active: Arc<Mutex<Option<ActiveTask>>>,
    consents: Arc<Mutex<ConsentMap>>,
}

type ConsentMap = HashMap<String, oneshot::Sender<bool>>;

impl Default for TransferSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferSupervisor {
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Semaphore::new(1)),
            active: Arc::new(Mutex::new(None)),
            consents: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// 进程级实例
    pub fn global() -> Arc<TransferSupervisor> {
        static GLOBAL: OnceLock<Arc<TransferSupervisor>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(TransferSupervisor::new())).clone()
    }

    /// 占用传输槽位，已被占用时返回 `None`
    pub fn try_acquire(&self, task_id: &str) -> Option<TransferPermit> {
        let permit = self.slot.clone().try_acquire_owned().ok()?;
        let cancel = CancellationToken::new();
        *lock(&self.active) = Some(ActiveTask {
            task_id: task_id.to_string(),
            cancel: cancel.clone(),
        });
        info!("Transfer slot taken by task {}", task_id);

        Some(TransferPermit {
            task_id: task_id.to_string(),
            cancel,
            active: self.active.clone(),
            _permit: permit,
        })
    }

    pub fn is_busy(&self) -> bool {
        self.slot.available_permits() == 0
    }

    pub fn active_task(&self) -> Option<String> {
        lock(&self.active).as_ref().map(|task| task.task_id.clone())
    }

    /// 取消正在进行的任务；ID 不匹配返回 `false`
    pub fn cancel(&self, task_id: &str) -> bool {
        let active = lock(&self.active).clone();
        match active {
            Some(task) if task.task_id == task_id => {
                info!("Cancelling task {}", task_id);
                task.cancel.cancel();
                true
            }
            _ => {
                debug!("Cancel ignored, task {} is not active", task_id);
                false
            }
        }
    }

    /// 回答一个等待中的同意请求
    pub fn respond(&self, task_id: &str, accepted: bool) -> bool {
        match lock(&self.consents).remove(task_id) {
            Some(tx) => tx.send(accepted).is_ok(),
            None => {
                debug!("No pending consent for task {}", task_id);
                false
            }
        }
    }

    /// 登记一个待回答的同意请求
    ///
    /// 登记之后 [`respond`](Self::respond) 的回答会被保留，直到
    /// [`ConsentWaiter::wait`] 取走或 waiter 被丢弃。
    pub fn register_consent(&self, task_id: &str) -> ConsentWaiter {
        let (tx, rx) = oneshot::channel();
        lock(&self.consents).insert(task_id.to_string(), tx);
        debug!("Consent pending for task {}", task_id);
        ConsentWaiter {
            task_id: task_id.to_string(),
            rx,
            consents: self.consents.clone(),
        }
    }

    /// 登记并等待用户同意，超时视为拒绝
    pub async fn wait_for_consent(&self, task_id: &str, timeout: Duration) -> bool {
        self.register_consent(task_id).wait(timeout).await
    }
}

/// 已登记的同意请求，丢弃时撤销登记
pub struct ConsentWaiter {
    task_id: String,
    rx: oneshot::Receiver<bool>,
    consents: Arc<Mutex<ConsentMap>>,
}

impl ConsentWaiter {
    /// 等待回答，超时视为拒绝
    pub async fn wait(mut self, timeout: Duration) -> bool {
        let accepted = matches!(tokio::time::timeout(timeout, &mut self.rx).await, Ok(Ok(true)));
        info!(
            "Consent for task {}: {}",
            self.task_id,
            if accepted { "accepted" } else { "declined" }
        );
        accepted
    }
}

impl Drop for ConsentWaiter {
    fn drop(&mut self) {
        lock(&self.consents).remove(&self.task_id);
    }
}

/// 传输槽位占用凭证
pub struct TransferPermit {
    task_id: String,
    cancel: CancellationToken,
    active: Arc<Mutex<Option<ActiveTask>>>,
    _permit: OwnedSemaphorePermit,
}

impl TransferPermit {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// 该任务的取消令牌
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// 接收端在收到 sendRequest 后才知道真正的任务 ID
    pub fn rebind(&mut self, task_id: &str) {
        let mut active = lock(&self.active);
        if let Some(task) = active.as_mut().filter(|task| task.task_id == self.task_id) {
            task.task_id = task_id.to_string();
        }
        debug!("Transfer slot rebound {} -> {}", self.task_id, task_id);
        self.task_id = task_id.to_string();
    }

    pub fn release(self) {}
}

impl Drop for TransferPermit {
    fn drop(&mut self) {
        let mut active = lock(&self.active);
        if active.as_ref().is_some_and(|task| task.task_id == self.task_id) {
            *active = None;
        }
        debug!("Clearing busy flag for task {}", self.task_id);
    }
}
