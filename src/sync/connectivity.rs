//! 在线状态
//!
//! [`ConnectivityMonitor`] 保存当前在线状态，宿主应用在系统网络事件到来时调用
//! `set_online`；也可以用 [`spawn_http_probe`] 周期性探测服务端。

use std::sync::Arc;

use reqwest::Client;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::ProbeConfig;
use crate::remote::RemoteError;

#[derive(Debug, Clone)]
pub struct ConnectivityMonitor {
    tx: Arc<watch::Sender<bool>>,
}

impl ConnectivityMonitor {
    pub fn new(initially_online: bool) -> Self {
        let (tx, _) = watch::channel(initially_online);
        Self { tx: Arc::new(tx) }
    }

    /// 更新在线状态，返回状态是否发生变化
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });

        if changed {
            if online {
                log::info!("网络已恢复");
            } else {
                log::info!("网络已断开");
            }
        }
        changed
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// 连续探测结果计数，达到阈值才切换状态
#[derive(Debug)]
pub struct ProbeTracker {
    failure_threshold: u32,
    recovery_threshold: u32,
    consecutive_failures: u32,
    consecutive_successes: u32,
    online: bool,
}

impl ProbeTracker {
    pub fn new(config: &ProbeConfig, initially_online: bool) -> Self {
        Self {
            failure_threshold: config.failure_threshold.max(1),
            recovery_threshold: config.recovery_threshold.max(1),
            consecutive_failures: 0,
            consecutive_successes: 0,
            online: initially_online,
        }
    }

    /// 记录一次探测结果，状态切换时返回新状态
    pub fn record(&mut self, reachable: bool) -> Option<bool> {
        if reachable {
            self.consecutive_successes = self.consecutive_successes.saturating_add(1);
            self.consecutive_failures = 0;
            if !self.online && self.consecutive_successes >= self.recovery_threshold {
                self.online = true;
                return Some(true);
            }
        } else {
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
            self.consecutive_successes = 0;
            if self.online && self.consecutive_failures >= self.failure_threshold {
                self.online = false;
                return Some(false);
            }
        }
        None
    }

    pub fn is_online(&self) -> bool {
        self.online
    }
}

/// 启动 HTTP 探测任务，未启用时返回 None
///
/// 收到任何 HTTP 响应都视为可达，连接失败或超时视为不可达。
/// 返回的任务需要由调用方在退出时 abort。
pub fn spawn_http_probe(
    monitor: ConnectivityMonitor,
    config: ProbeConfig,
) -> Result<Option<JoinHandle<()>>, RemoteError> {
    if !config.enabled {
        return Ok(None);
    }

    let url = config
        .url
        .clone()
        .ok_or_else(|| RemoteError::Validation("未配置探测地址".to_string()))?;

    let client = Client::builder()
        .timeout(config.timeout)
        .build()
        .map_err(|e| RemoteError::Network(format!("创建 HTTP 客户端失败: {}", e)))?;

    log::info!("网络探测已启动: {} (间隔 {:?})", url, config.interval);

    let handle = tokio::spawn(async move {
        let mut tracker = ProbeTracker::new(&config, monitor.is_online());
        let mut ticker = tokio::time::interval(config.interval);

        loop {
            ticker.tick().await;

            let reachable = match client.get(&url).send().await {
                Ok(_) => true,
                Err(e) => {
                    log::debug!("探测 {} 失败: {}", url, e);
                    false
                }
            };

            if let Some(online) = tracker.record(reachable) {
                monitor.set_online(online);
            }
        }
    });

    Ok(Some(handle))
}
