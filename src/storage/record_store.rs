//! 本地记录数据库操作模块
//!
//! 每种实体类型一张表，提供 upsert / 查询 / 索引查询 / 删除。
//! 写入记录不会隐式入队，入队由调用方在同一事务中完成。

use rusqlite::{params, Connection};
use std::sync::{Arc, Mutex};

use crate::storage::models::{EntityType, StoredRecord};
use crate::storage::{StorageError, StorageResult};

/// 二级索引查询条件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordIndex {
    /// 按同步标记查询
    Synced(bool),
    /// 按 natural_key 索引值查询
    NaturalKey(String),
}

/// 本地记录仓储
pub struct RecordRepository {
    conn: Arc<Mutex<Connection>>,
}

impl RecordRepository {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    /// 插入或覆盖记录
    pub fn put(&self, record: &StoredRecord) -> StorageResult<()> {
        let conn = self.get_connection()?;
        RecordRepositoryRef::new(&conn).put(record)
    }

    /// 按 id 获取记录
    pub fn get(&self, entity_type: EntityType, id: &str) -> StorageResult<Option<StoredRecord>> {
        let conn = self.get_connection()?;
        RecordRepositoryRef::new(&conn).get(entity_type, id)
    }

    /// 获取某类型的全部记录（按创建时间升序）
    pub fn get_all(&self, entity_type: EntityType) -> StorageResult<Vec<StoredRecord>> {
        let conn = self.get_connection()?;
        RecordRepositoryRef::new(&conn).get_all(entity_type)
    }

    /// 按二级索引查询
    ///
    /// # Arguments
    /// * `entity_type` - 实体类型
    /// * `index` - 索引条件
    pub fn get_by_index(
        &self,
        entity_type: EntityType,
        index: &RecordIndex,
    ) -> StorageResult<Vec<StoredRecord>> {
        let conn = self.get_connection()?;
        RecordRepositoryRef::new(&conn).get_by_index(entity_type, index)
    }

    /// 删除记录，返回是否确实删除
    pub fn delete(&self, entity_type: EntityType, id: &str) -> StorageResult<bool> {
        let conn = self.get_connection()?;
        RecordRepositoryRef::new(&conn).delete(entity_type, id)
    }

    /// 统计未同步记录数
    pub fn count_unsynced(&self, entity_type: EntityType) -> StorageResult<i64> {
        let conn = self.get_connection()?;
        RecordRepositoryRef::new(&conn).count_unsynced(entity_type)
    }

    fn get_connection(&self) -> StorageResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| StorageError::LockError(e.to_string()))
    }
}

/// 使用直接 Connection 引用的记录仓储
///
/// 适用于在事务中与队列操作一起使用
pub struct RecordRepositoryRef<'a> {
    conn: &'a Connection,
}

impl<'a> RecordRepositoryRef<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn put(&self, record: &StoredRecord) -> StorageResult<()> {
        record.upsert(self.conn)
    }

    pub fn get(&self, entity_type: EntityType, id: &str) -> StorageResult<Option<StoredRecord>> {
        let sql = format!("SELECT * FROM {} WHERE id = ?1", entity_type.table_name());
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query_map([id], |row| StoredRecord::from_row(entity_type, row))?;

        match rows.next() {
            Some(record) => Ok(Some(record?)),
            None => Ok(None),
        }
    }

    pub fn get_all(&self, entity_type: EntityType) -> StorageResult<Vec<StoredRecord>> {
        let sql = format!(
            "SELECT * FROM {} ORDER BY created_at ASC, id ASC",
            entity_type.table_name()
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let records = stmt
            .query_map([], |row| StoredRecord::from_row(entity_type, row))?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(records)
    }

    pub fn get_by_index(
        &self,
        entity_type: EntityType,
        index: &RecordIndex,
    ) -> StorageResult<Vec<StoredRecord>> {
        let table = entity_type.table_name();
        let records = match index {
            RecordIndex::Synced(synced) => {
                let sql = format!(
                    "SELECT * FROM {} WHERE synced = ?1 ORDER BY created_at ASC, id ASC",
                    table
                );
                let mut stmt = self.conn.prepare(&sql)?;
                let rows = stmt
                    .query_map([*synced as i32], |row| StoredRecord::from_row(entity_type, row))?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
            RecordIndex::NaturalKey(key) => {
                let sql = format!(
                    "SELECT * FROM {} WHERE natural_key = ?1 ORDER BY created_at ASC, id ASC",
                    table
                );
                let mut stmt = self.conn.prepare(&sql)?;
                let rows = stmt
                    .query_map([key], |row| StoredRecord::from_row(entity_type, row))?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
        };

        Ok(records)
    }

    pub fn delete(&self, entity_type: EntityType, id: &str) -> StorageResult<bool> {
        let sql = format!("DELETE FROM {} WHERE id = ?1", entity_type.table_name());
        let affected = self.conn.execute(&sql, [id])?;
        Ok(affected > 0)
    }

    /// 标记记录已被远端确认
    ///
    /// 记录已被本地删除时不做任何修改，返回 false。
    pub fn mark_synced(&self, entity_type: EntityType, id: &str) -> StorageResult<bool> {
        let sql = format!(
            "UPDATE {} SET synced = 1 WHERE id = ?1",
            entity_type.table_name()
        );
        let affected = self.conn.execute(&sql, params![id])?;
        Ok(affected > 0)
    }

    pub fn count_unsynced(&self, entity_type: EntityType) -> StorageResult<i64> {
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE synced = 0",
            entity_type.table_name()
        );
        let count = self.conn.query_row(&sql, [], |row| row.get(0))?;
        Ok(count)
    }
}
