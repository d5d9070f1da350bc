//! 同步触发
//!
//! 网络恢复、登录、回到前台和手动请求都会触发同步。合并窗口内的多次触发只执行一次，
//! 且只在在线、已登录、没有同步在运行时执行。

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

use crate::config::TriggerConfig;
use crate::remote::IdentityProvider;
use crate::sync::connectivity::ConnectivityMonitor;
use crate::sync::reconciler::Reconciler;
use crate::sync::SyncError;

const TRIGGER_CHANNEL_CAPACITY: usize = 32;

/// 触发事件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerEvent {
    ConnectivityRestored,
    Login,
    Foreground,
    Manual,
    Shutdown,
}

/// 触发器句柄
pub struct SyncTrigger {
    sender: mpsc::Sender<TriggerEvent>,
    handle: JoinHandle<()>,
}

impl SyncTrigger {
    pub fn on_login(&self) {
        self.notify(TriggerEvent::Login);
    }

    pub fn on_foreground(&self) {
        self.notify(TriggerEvent::Foreground);
    }

    pub fn request_sync(&self) {
        self.notify(TriggerEvent::Manual);
    }

    pub fn shutdown(&self) {
        self.notify(TriggerEvent::Shutdown);
    }

    /// 通知退出并等待触发循环结束（不会打断正在进行的同步）
    pub async fn shutdown_and_wait(self) {
        self.shutdown();
        if let Err(e) = self.handle.await {
            log::error!("同步触发任务异常退出: {}", e);
        }
    }

    fn notify(&self, event: TriggerEvent) {
        // 通道已满说明已有待处理的触发，丢弃即可
        if let Err(e) = self.sender.try_send(event) {
            log::debug!("丢弃同步触发 {:?}: {}", event, e);
        }
    }
}

/// 启动同步触发循环
///
/// 需要在 tokio 运行时中调用。
pub fn start_sync_trigger(
    reconciler: Arc<Reconciler>,
    identity: Arc<dyn IdentityProvider>,
    connectivity: ConnectivityMonitor,
    config: TriggerConfig,
) -> SyncTrigger {
    let (tx, rx) = mpsc::channel(TRIGGER_CHANNEL_CAPACITY);

    let handle = tokio::spawn(async move {
        sync_trigger_loop(reconciler, identity, connectivity, config, rx).await;
    });

    SyncTrigger { sender: tx, handle }
}

async fn sync_trigger_loop(
    reconciler: Arc<Reconciler>,
    identity: Arc<dyn IdentityProvider>,
    connectivity: ConnectivityMonitor,
    config: TriggerConfig,
    mut rx: mpsc::Receiver<TriggerEvent>,
) {
    let mut online_rx = connectivity.subscribe();
    let mut was_online = *online_rx.borrow_and_update();

    log::info!("同步触发已启动");

    loop {
        let first = tokio::select! {
            event = rx.recv() => match event {
                Some(TriggerEvent::Shutdown) | None => break,
                Some(event) => event,
            },
            changed = online_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let online = *online_rx.borrow_and_update();
                let restored = online && !was_online;
                was_online = online;
                if !restored {
                    continue;
                }
                TriggerEvent::ConnectivityRestored
            }
        };

        let Some(coalesced) = debounce(&mut rx, &config).await else {
            break;
        };
        log::debug!("同步触发 {:?}，合并 {} 次", first, coalesced + 1);

        run_if_ready(&reconciler, identity.as_ref(), &connectivity).await;

        // 同步期间发生的网络切换不再单独触发
        was_online = *online_rx.borrow_and_update();
    }

    log::info!("同步触发已停止");
}

/// 在合并窗口内收集后续触发，返回合并的次数；收到退出时返回 None
async fn debounce(rx: &mut mpsc::Receiver<TriggerEvent>, config: &TriggerConfig) -> Option<usize> {
    let deadline = Instant::now() + config.debounce;
    let mut coalesced = 0;

    loop {
        tokio::select! {
            _ = sleep_until(deadline) => return Some(coalesced),
            event = rx.recv() => match event {
                Some(TriggerEvent::Shutdown) | None => return None,
                Some(_) => coalesced += 1,
            },
        }
    }
}

async fn run_if_ready(
    reconciler: &Reconciler,
    identity: &dyn IdentityProvider,
    connectivity: &ConnectivityMonitor,
) {
    if !connectivity.is_online() {
        log::debug!("离线，跳过同步");
        return;
    }

    match reconciler.reconcile_as(identity).await {
        Ok(result) => {
            if !result.success {
                log::warn!("同步完成但有 {} 项超过重试上限", result.permanent_failures);
            }
        }
        Err(SyncError::AlreadyRunning) => log::debug!("同步正在进行，跳过本次触发"),
        Err(SyncError::MissingIdentity) => log::debug!("未登录，跳过同步"),
        Err(SyncError::Storage(e)) => log::error!("同步失败: {}", e),
    }
}
