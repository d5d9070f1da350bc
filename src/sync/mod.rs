//! 同步模块
//!
//! - `reconciler`: 将本地队列按 FIFO 回放到远端
//! - `connectivity`: 在线状态与可选的 HTTP 探测
//! - `trigger`: 登录、回到前台、网络恢复等触发，合并后执行同步

pub mod connectivity;
pub mod reconciler;
pub mod trigger;

pub use connectivity::{spawn_http_probe, ConnectivityMonitor, ProbeTracker};
pub use reconciler::Reconciler;
pub use trigger::{start_sync_trigger, SyncTrigger, TriggerEvent};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::{EntityType, StorageError, SyncAction};

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("同步正在进行中")]
    AlreadyRunning,

    #[error("当前没有登录用户")]
    MissingIdentity,

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// 单个队列项的失败记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncErrorEntry {
    pub entry_id: i64,
    pub action: SyncAction,
    pub entity_type: EntityType,
    pub record_id: String,
    pub error: String,
    pub retry_count: u32,
    /// 是否已移入失败列表
    pub permanent: bool,
}

/// 一次同步的结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncResult {
    /// 本次没有新的永久失败
    pub success: bool,
    /// 快照中的队列项数
    pub total: usize,
    pub synced_count: usize,
    pub failed_count: usize,
    pub permanent_failures: usize,
    /// 因同一记录前序项失败而推迟的项数
    pub skipped_count: usize,
    pub errors: Vec<SyncErrorEntry>,
    pub duration_ms: u64,
    pub sync_time: DateTime<Utc>,
}

impl SyncResult {
    fn empty(total: usize) -> Self {
        Self {
            success: true,
            total,
            synced_count: 0,
            failed_count: 0,
            permanent_failures: 0,
            skipped_count: 0,
            errors: Vec::new(),
            duration_ms: 0,
            sync_time: Utc::now(),
        }
    }
}

/// 同步进度事件
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncProgress {
    pub synced: usize,
    pub failed: usize,
    pub processed: usize,
    pub total: usize,
}

/// 对外暴露的同步状态
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SyncStatus {
    #[default]
    Idle,
    Syncing {
        total: usize,
    },
    Success {
        synced: usize,
        at: DateTime<Utc>,
    },
    Error {
        message: String,
        failed: usize,
    },
}

impl SyncStatus {
    pub fn is_syncing(&self) -> bool {
        matches!(self, SyncStatus::Syncing { .. })
    }
}
