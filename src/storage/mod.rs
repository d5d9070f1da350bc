//! SQLite 离线存储模块
//!
//! 提供本地 SQLite 数据库存储功能，支持：
//! - 按实体类型分表的本地记录持久化
//! - 与记录写入同事务的同步队列
//! - 超过重试上限的失败列表
//! - 同步元数据

// ============================================================
// 子模块声明
// ============================================================

pub mod migrations;
pub mod models;
pub mod record_store;
pub mod sync_queue;

// ============================================================
// 重新导出主要类型
// ============================================================

pub use migrations::run_migrations;
pub use models::*;
pub use record_store::{RecordIndex, RecordRepository, RecordRepositoryRef};
pub use sync_queue::{QueueStats, SyncQueueRepository, SyncQueueRepositoryRef};

// ============================================================
// 依赖导入
// ============================================================

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

// ============================================================
// 错误类型定义
// ============================================================

/// 存储模块错误类型
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("数据库错误: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("迁移错误: {0}")]
    Migration(String),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("数据未找到: {0}")]
    NotFound(String),

    #[error("数据无效: {0}")]
    InvalidData(String),

    #[error("锁获取失败: {0}")]
    LockError(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// 上次同步时间的元数据键
pub const LAST_SYNC_TIME_KEY: &str = "last_sync_time";

/// 待同步记录数统计
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PendingSyncCount {
    pub liked_items: i64,
    pub progress: i64,
    pub vocabulary: i64,
    pub annotations: i64,
    /// 同步队列中待处理的项数
    pub sync_queue: i64,
    /// 失败列表中的项数
    pub failures: i64,
    /// 队列与失败列表合计
    pub total: i64,
}

// ============================================================
// Storage - 统一存储结构体
// ============================================================

/// 统一存储结构体
///
/// 持有共享连接，提供对所有 Repository 的便捷访问。
#[derive(Clone)]
pub struct Storage {
    conn: Arc<Mutex<Connection>>,
    db_path: String,
}

impl Storage {
    /// 打开（或创建）数据库文件
    ///
    /// 自动启用 WAL 模式、外键约束，并运行数据库迁移。
    ///
    /// # Arguments
    /// * `db_path` - 数据库文件路径
    ///
    /// # Example
    /// ```ignore
    /// let storage = Storage::new("./data/offline.db")?;
    /// ```
    pub fn new<P: AsRef<Path>>(db_path: P) -> StorageResult<Self> {
        let path_str = db_path.as_ref().to_string_lossy().to_string();
        let connection = Connection::open(&db_path)?;

        // 启用 WAL 模式以提高并发性能
        connection.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA foreign_keys=ON;
             PRAGMA cache_size=-64000;",
        )?;

        Self::initialize(connection, path_str)
    }

    /// 创建内存数据库（用于测试）
    pub fn in_memory() -> StorageResult<Self> {
        let connection = Connection::open_in_memory()?;

        connection.execute_batch(
            "PRAGMA foreign_keys=ON;
             PRAGMA cache_size=-64000;",
        )?;

        Self::initialize(connection, ":memory:".to_string())
    }

    fn initialize(connection: Connection, db_path: String) -> StorageResult<Self> {
        migrations::run_migrations(&connection)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(connection)),
            db_path,
        })
    }

    /// 获取数据库连接
    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.conn)
    }

    /// 获取数据库路径
    pub fn db_path(&self) -> &str {
        &self.db_path
    }

    /// 获取本地记录仓库
    pub fn records(&self) -> RecordRepository {
        RecordRepository::new(Arc::clone(&self.conn))
    }

    /// 获取同步队列仓库
    pub fn sync_queue(&self) -> SyncQueueRepository {
        SyncQueueRepository::new(Arc::clone(&self.conn))
    }

    /// 执行事务
    ///
    /// 闭包返回错误时事务回滚。
    ///
    /// # Example
    /// ```ignore
    /// let id = storage.transaction(|conn| {
    ///     RecordRepositoryRef::new(conn).put(&record)?;
    ///     SyncQueueRepositoryRef::new(conn).enqueue(SyncAction::Create, entity, &record.id, &record.payload)
    /// })?;
    /// ```
    pub fn transaction<F, T>(&self, f: F) -> StorageResult<T>
    where
        F: FnOnce(&Connection) -> StorageResult<T>,
    {
        let mut conn = self.get_connection()?;

        let tx = conn.transaction()?;
        let result = f(&tx)?;
        tx.commit()?;

        Ok(result)
    }

    // ========== 同步元数据操作 ==========

    /// 获取同步元数据
    ///
    /// # Returns
    /// * `StorageResult<Option<String>>` - 元数据值，如果不存在则返回 None
    pub fn get_sync_metadata(&self, key: &str) -> StorageResult<Option<String>> {
        let conn = self.get_connection()?;

        let value = conn
            .query_row(
                "SELECT value FROM sync_metadata WHERE key = ?1",
                [key],
                |row| row.get(0),
            )
            .optional()?;

        Ok(value)
    }

    /// 设置同步元数据
    pub fn set_sync_metadata(&self, key: &str, value: &str) -> StorageResult<()> {
        let conn = self.get_connection()?;

        conn.execute(
            "INSERT OR REPLACE INTO sync_metadata (key, value, updated_at) VALUES (?1, ?2, datetime('now'))",
            [key, value],
        )?;

        Ok(())
    }

    /// 删除同步元数据，返回是否删除了记录
    pub fn delete_sync_metadata(&self, key: &str) -> StorageResult<bool> {
        let conn = self.get_connection()?;

        let affected = conn.execute("DELETE FROM sync_metadata WHERE key = ?1", [key])?;

        Ok(affected > 0)
    }

    /// 上次同步完成时间
    pub fn last_sync_time(&self) -> StorageResult<Option<DateTime<Utc>>> {
        match self.get_sync_metadata(LAST_SYNC_TIME_KEY)? {
            Some(value) if !value.is_empty() => {
                let dt = DateTime::parse_from_rfc3339(&value).map_err(|e| {
                    StorageError::InvalidData(format!("解析同步时间失败: {}", e))
                })?;
                Ok(Some(dt.with_timezone(&Utc)))
            }
            _ => Ok(None),
        }
    }

    pub fn set_last_sync_time(&self, time: DateTime<Utc>) -> StorageResult<()> {
        self.set_sync_metadata(LAST_SYNC_TIME_KEY, &time.to_rfc3339())
    }

    /// 获取待同步记录数
    ///
    /// 统计各表未同步记录、同步队列与失败列表。
    pub fn get_pending_sync_count(&self) -> StorageResult<PendingSyncCount> {
        let conn = self.get_connection()?;
        let records = RecordRepositoryRef::new(&conn);
        let queue = SyncQueueRepositoryRef::new(&conn);

        let sync_queue = queue.get_pending_count()?;
        let failures = queue.get_failed_count()?;

        Ok(PendingSyncCount {
            liked_items: records.count_unsynced(EntityType::LikedItem)?,
            progress: records.count_unsynced(EntityType::Progress)?,
            vocabulary: records.count_unsynced(EntityType::Vocabulary)?,
            annotations: records.count_unsynced(EntityType::Annotation)?,
            sync_queue,
            failures,
            total: sync_queue + failures,
        })
    }

    /// 同步队列中是否还有待处理项
    pub fn has_pending_sync(&self) -> StorageResult<bool> {
        let conn = self.get_connection()?;
        Ok(SyncQueueRepositoryRef::new(&conn).get_pending_count()? > 0)
    }

    fn get_connection(&self) -> StorageResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| StorageError::LockError(e.to_string()))
    }
}

// ============================================================
// 测试
// ============================================================
