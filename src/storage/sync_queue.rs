//! 同步队列数据库操作模块
//!
//! 提供同步队列的完整数据库操作支持，包括：
//! - 入队操作 (enqueue)
//! - 快照读取 (peek_all)
//! - 状态管理 (remove/increment_retry/move_to_failures)
//! - 失败列表管理 (list_failures/retry_failure/discard_failure)
//! - 队列统计 (get_queue_stats)

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::sync::{Arc, Mutex};

use crate::storage::models::{
    format_datetime, parse_datetime, EntityType, FailedEntry, QueueEntry, SyncAction,
};
use crate::storage::{StorageError, StorageResult};

/// 队列统计信息
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueStats {
    /// 待处理数量
    pub pending: i64,
    /// 失败列表数量
    pub failed: i64,
    /// 最早的待处理项入队时间
    pub oldest_pending_at: Option<DateTime<Utc>>,
}

/// 同步队列仓储
pub struct SyncQueueRepository {
    conn: Arc<Mutex<Connection>>,
}

impl SyncQueueRepository {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    // ========== 入队操作 ==========

    /// 将变更入队
    ///
    /// # Arguments
    /// * `action` - 操作类型
    /// * `entity_type` - 实体类型
    /// * `record_id` - 本地记录 id
    /// * `data` - 入队时的数据快照
    ///
    /// # Returns
    /// * `StorageResult<i64>` - 新队列项的 id
    pub fn enqueue(
        &self,
        action: SyncAction,
        entity_type: EntityType,
        record_id: &str,
        data: &Value,
    ) -> StorageResult<i64> {
        let conn = self.get_connection()?;
        SyncQueueRepositoryRef::new(&conn).enqueue(action, entity_type, record_id, data)
    }

    // ========== 读取操作 ==========

    /// 按 id 升序读取整个队列（不删除）
    pub fn peek_all(&self) -> StorageResult<Vec<QueueEntry>> {
        let conn = self.get_connection()?;
        SyncQueueRepositoryRef::new(&conn).peek_all()
    }

    // ========== 状态管理 ==========

    /// 删除已确认的队列项
    pub fn remove(&self, id: i64) -> StorageResult<bool> {
        let conn = self.get_connection()?;
        SyncQueueRepositoryRef::new(&conn).remove(id)
    }

    /// 记录一次失败并返回新的重试次数
    pub fn increment_retry(&self, id: i64, error: &str) -> StorageResult<u32> {
        let conn = self.get_connection()?;
        SyncQueueRepositoryRef::new(&conn).increment_retry(id, error)
    }

    /// 将队列项移入失败列表，返回失败项 id
    pub fn move_to_failures(&self, id: i64) -> StorageResult<i64> {
        let mut conn = self.get_connection()?;
        let tx = conn.transaction()?;
        let failure_id = SyncQueueRepositoryRef::new(&tx).move_to_failures(id)?;
        tx.commit()?;
        Ok(failure_id)
    }

    // ========== 失败列表 ==========

    /// 列出失败列表（按失败时间升序）
    pub fn list_failures(&self) -> StorageResult<Vec<FailedEntry>> {
        let conn = self.get_connection()?;
        SyncQueueRepositoryRef::new(&conn).list_failures()
    }

    /// 人工重试失败项
    ///
    /// 以原队列 id 重新入队并清零重试次数，保持原有的先后顺序。
    pub fn retry_failure(&self, failure_id: i64) -> StorageResult<i64> {
        let mut conn = self.get_connection()?;
        let tx = conn.transaction()?;
        let queue_id = SyncQueueRepositoryRef::new(&tx).retry_failure(failure_id)?;
        tx.commit()?;
        Ok(queue_id)
    }

    /// 放弃失败项
    pub fn discard_failure(&self, failure_id: i64) -> StorageResult<bool> {
        let conn = self.get_connection()?;
        SyncQueueRepositoryRef::new(&conn).discard_failure(failure_id)
    }

    // ========== 查询操作 ==========

    /// 记录是否仍有待处理项或失败项
    pub fn has_pending_for(&self, entity_type: EntityType, record_id: &str) -> StorageResult<bool> {
        let conn = self.get_connection()?;
        SyncQueueRepositoryRef::new(&conn).has_pending_for(entity_type, record_id)
    }

    pub fn get_pending_count(&self) -> StorageResult<i64> {
        let conn = self.get_connection()?;
        SyncQueueRepositoryRef::new(&conn).get_pending_count()
    }

    pub fn get_failed_count(&self) -> StorageResult<i64> {
        let conn = self.get_connection()?;
        SyncQueueRepositoryRef::new(&conn).get_failed_count()
    }

    /// 获取队列统计信息
    pub fn get_queue_stats(&self) -> StorageResult<QueueStats> {
        let conn = self.get_connection()?;
        let repo = SyncQueueRepositoryRef::new(&conn);

        let oldest: Option<String> = conn
            .query_row("SELECT MIN(created_at) FROM sync_queue", [], |row| row.get(0))?;

        Ok(QueueStats {
            pending: repo.get_pending_count()?,
            failed: repo.get_failed_count()?,
            oldest_pending_at: oldest.map(parse_datetime).transpose()?,
        })
    }

    // ========== 辅助方法 ==========

    fn get_connection(&self) -> StorageResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| StorageError::LockError(e.to_string()))
    }
}

/// 使用直接 Connection 引用的同步队列仓储
///
/// 适用于在事务中使用或需要更细粒度控制的场景
pub struct SyncQueueRepositoryRef<'a> {
    conn: &'a Connection,
}

impl<'a> SyncQueueRepositoryRef<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn enqueue(
        &self,
        action: SyncAction,
        entity_type: EntityType,
        record_id: &str,
        data: &Value,
    ) -> StorageResult<i64> {
        let now = format_datetime(Utc::now());
        self.conn.execute(
            r#"
            INSERT INTO sync_queue (
                action, entity_type, record_id, data,
                retry_count, last_error, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, 0, NULL, ?5, ?5)
            "#,
            params![
                action.as_str(),
                entity_type.table_name(),
                record_id,
                data.to_string(),
                now
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn peek_all(&self) -> StorageResult<Vec<QueueEntry>> {
        let mut stmt = self
            .conn
            .prepare("SELECT * FROM sync_queue ORDER BY id ASC")?;

        let entries = stmt
            .query_map([], QueueEntry::from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(entries)
    }

    pub fn get(&self, id: i64) -> StorageResult<Option<QueueEntry>> {
        let entry = self
            .conn
            .query_row(
                "SELECT * FROM sync_queue WHERE id = ?1",
                [id],
                QueueEntry::from_row,
            )
            .optional()?;
        Ok(entry)
    }

    pub fn remove(&self, id: i64) -> StorageResult<bool> {
        let affected = self
            .conn
            .execute("DELETE FROM sync_queue WHERE id = ?1", [id])?;
        Ok(affected > 0)
    }

    pub fn increment_retry(&self, id: i64, error: &str) -> StorageResult<u32> {
        let affected = self.conn.execute(
            r#"
            UPDATE sync_queue
            SET retry_count = retry_count + 1,
                last_error = ?2,
                updated_at = ?3
            WHERE id = ?1
            "#,
            params![id, error, format_datetime(Utc::now())],
        )?;

        if affected == 0 {
            return Err(StorageError::NotFound(format!("同步队列项 {}", id)));
        }

        let count = self.conn.query_row(
            "SELECT retry_count FROM sync_queue WHERE id = ?1",
            [id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// 将队列项移入失败列表（调用方负责事务）
    pub fn move_to_failures(&self, id: i64) -> StorageResult<i64> {
        let entry = self
            .get(id)?
            .ok_or_else(|| StorageError::NotFound(format!("同步队列项 {}", id)))?;

        self.conn.execute(
            r#"
            INSERT INTO sync_failures (
                queue_id, action, entity_type, record_id, data,
                retry_count, last_error, created_at, failed_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                entry.id,
                entry.action.as_str(),
                entry.entity_type.table_name(),
                entry.record_id,
                entry.data.to_string(),
                entry.retry_count,
                entry.last_error,
                format_datetime(entry.created_at),
                format_datetime(Utc::now()),
            ],
        )?;
        let failure_id = self.conn.last_insert_rowid();

        self.remove(id)?;

        log::warn!(
            "同步项 {} ({} {}/{}) 超过重试上限，移入失败列表",
            id,
            entry.action.as_str(),
            entry.entity_type.table_name(),
            entry.record_id
        );

        Ok(failure_id)
    }

    pub fn list_failures(&self) -> StorageResult<Vec<FailedEntry>> {
        let mut stmt = self
            .conn
            .prepare("SELECT * FROM sync_failures ORDER BY failed_at ASC, id ASC")?;

        let entries = stmt
            .query_map([], FailedEntry::from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(entries)
    }

    /// 人工重试失败项（调用方负责事务）
    pub fn retry_failure(&self, failure_id: i64) -> StorageResult<i64> {
        let failure = self
            .conn
            .query_row(
                "SELECT * FROM sync_failures WHERE id = ?1",
                [failure_id],
                FailedEntry::from_row,
            )
            .optional()?
            .ok_or_else(|| StorageError::NotFound(format!("失败项 {}", failure_id)))?;

        self.conn.execute(
            r#"
            INSERT INTO sync_queue (
                id, action, entity_type, record_id, data,
                retry_count, last_error, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?7, ?8)
            "#,
            params![
                failure.queue_id,
                failure.action.as_str(),
                failure.entity_type.table_name(),
                failure.record_id,
                failure.data.to_string(),
                failure.last_error,
                format_datetime(failure.created_at),
                format_datetime(Utc::now()),
            ],
        )?;

        self.conn
            .execute("DELETE FROM sync_failures WHERE id = ?1", [failure_id])?;

        log::info!("失败项 {} 重新入队为 {}", failure_id, failure.queue_id);
        Ok(failure.queue_id)
    }

    pub fn discard_failure(&self, failure_id: i64) -> StorageResult<bool> {
        let affected = self
            .conn
            .execute("DELETE FROM sync_failures WHERE id = ?1", [failure_id])?;
        Ok(affected > 0)
    }

    pub fn has_pending_for(&self, entity_type: EntityType, record_id: &str) -> StorageResult<bool> {
        let pending: bool = self.conn.query_row(
            r#"
            SELECT
                EXISTS(SELECT 1 FROM sync_queue WHERE entity_type = ?1 AND record_id = ?2)
                OR EXISTS(SELECT 1 FROM sync_failures WHERE entity_type = ?1 AND record_id = ?2)
            "#,
            params![entity_type.table_name(), record_id],
            |row| row.get(0),
        )?;
        Ok(pending)
    }

    pub fn get_pending_count(&self) -> StorageResult<i64> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM sync_queue", [], |row| row.get(0))?;
        Ok(count)
    }

    pub fn get_failed_count(&self) -> StorageResult<i64> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM sync_failures", [], |row| row.get(0))?;
        Ok(count)
    }
}
