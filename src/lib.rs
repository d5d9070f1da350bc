//! 离线优先的阅读与生词数据层
//!
//! - [`offline::OfflineStore`]: 本地写入，记录与同步队列同事务落盘
//! - [`sync::Reconciler`]: 联网后按 FIFO 将队列幂等回放到远端
//! - [`sync::start_sync_trigger`]: 网络恢复、登录、回到前台时合并触发同步
//! - [`scheduler`]: 间隔复习调度，完全离线可用

pub mod config;
pub mod offline;
pub mod remote;
pub mod scheduler;
pub mod storage;
pub mod sync;

pub use config::{Config, ConfigError};
pub use offline::{Entry, OfflineStore, VocabularyEntry};
pub use remote::{HttpRemoteStore, IdentityProvider, RemoteError, RemoteStore, SessionIdentity};
pub use storage::{Storage, StorageError, StorageResult};
pub use sync::{ConnectivityMonitor, Reconciler, SyncError, SyncResult, SyncStatus};
