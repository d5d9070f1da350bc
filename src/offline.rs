//! 离线写入入口
//!
//! 所有用户操作都经由 [`OfflineStore`]：本地记录写入与同步入队在同一事务中完成，
//! 不需要网络。

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde_json::{json, Value};

use crate::scheduler::{self, Reviewable, ReviewSchedule, ReviewStats};
use crate::storage::{
    Annotation, EntityPayload, EntityType, FailedEntry, LikedBook, NaturalKey, PendingSyncCount,
    ReadingProgress, RecordIndex, RecordRepositoryRef, Storage, StorageError, StorageResult,
    StoredRecord, SyncAction, SyncQueueRepositoryRef, VocabularyItem,
};

/// 带本地元信息的实体
#[derive(Debug, Clone, PartialEq)]
pub struct Entry<P> {
    pub id: String,
    pub synced: bool,
    pub updated_at: DateTime<Utc>,
    pub payload: P,
}

impl<P: EntityPayload> Entry<P> {
    fn from_record(record: &StoredRecord) -> StorageResult<Self> {
        Ok(Self {
            id: record.id.clone(),
            synced: record.synced,
            updated_at: record.updated_at,
            payload: record.payload_as()?,
        })
    }
}

pub type VocabularyEntry = Entry<VocabularyItem>;

impl Reviewable for VocabularyEntry {
    fn mastery(&self) -> &scheduler::MasteryState {
        &self.payload.mastery
    }
}

#[derive(Clone)]
pub struct OfflineStore {
    storage: Storage,
}

impl OfflineStore {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    // ========== 通用写入 ==========

    /// 新建记录并入队 create
    pub fn save<P: EntityPayload>(&self, payload: &P) -> StorageResult<Entry<P>> {
        let record = StoredRecord::from_payload(payload)?;
        self.storage.transaction(|conn| insert_and_enqueue(conn, &record))?;
        Entry::from_record(&record)
    }

    /// 更新已有记录并入队 update
    ///
    /// 记录不存在时返回 `StorageError::NotFound`。
    /// 业务唯一键不可修改，修改时返回 `StorageError::InvalidData`，
    /// 需要先 `remove` 再 `save`。
    pub fn update<P: EntityPayload>(&self, id: &str, payload: &P) -> StorageResult<Entry<P>> {
        let value = payload.to_value()?;
        let record = self.storage.transaction(|conn| {
            let existing = RecordRepositoryRef::new(conn)
                .get(P::ENTITY_TYPE, id)?
                .ok_or_else(|| not_found(P::ENTITY_TYPE, id))?;
            update_and_enqueue(conn, existing, value)
        })?;
        Entry::from_record(&record)
    }

    /// 删除本地记录并入队 delete，记录不存在时返回 false
    pub fn remove(&self, entity_type: EntityType, id: &str) -> StorageResult<bool> {
        self.storage.transaction(|conn| {
            let records = RecordRepositoryRef::new(conn);
            let Some(existing) = records.get(entity_type, id)? else {
                return Ok(false);
            };

            records.delete(entity_type, id)?;
            SyncQueueRepositoryRef::new(conn).enqueue(
                SyncAction::Delete,
                entity_type,
                id,
                &existing.payload,
            )?;
            Ok(true)
        })
    }

    pub fn get<P: EntityPayload>(&self, id: &str) -> StorageResult<Option<Entry<P>>> {
        self.storage
            .records()
            .get(P::ENTITY_TYPE, id)?
            .as_ref()
            .map(Entry::from_record)
            .transpose()
    }

    pub fn list<P: EntityPayload>(&self) -> StorageResult<Vec<Entry<P>>> {
        self.storage
            .records()
            .get_all(P::ENTITY_TYPE)?
            .iter()
            .map(Entry::from_record)
            .collect()
    }

    /// 按业务唯一键查找
    pub fn find<P: EntityPayload>(&self, payload: &P) -> StorageResult<Option<Entry<P>>> {
        let key = NaturalKey::from_payload(P::ENTITY_TYPE, &payload.to_value()?)?;
        self.storage
            .records()
            .get_by_index(P::ENTITY_TYPE, &RecordIndex::NaturalKey(key.index_value()))?
            .first()
            .map(Entry::from_record)
            .transpose()
    }

    /// 同键记录存在时更新，否则新建
    fn upsert_by_natural_key<P: EntityPayload>(&self, payload: &P) -> StorageResult<Entry<P>> {
        let value = payload.to_value()?;
        let key = NaturalKey::from_payload(P::ENTITY_TYPE, &value)?.index_value();

        let record = self.storage.transaction(|conn| {
            let existing = RecordRepositoryRef::new(conn)
                .get_by_index(P::ENTITY_TYPE, &RecordIndex::NaturalKey(key))?
                .into_iter()
                .next();

            match existing {
                Some(existing) => update_and_enqueue(conn, existing, value),
                None => {
                    let record = StoredRecord::from_payload(payload)?;
                    insert_and_enqueue(conn, &record)?;
                    Ok(record)
                }
            }
        })?;

        Entry::from_record(&record)
    }

    // ========== 书籍与阅读 ==========

    /// 喜欢一本书，已喜欢时返回已有记录
    pub fn like_book(&self, book: &LikedBook) -> StorageResult<Entry<LikedBook>> {
        if let Some(existing) = self.find(book)? {
            return Ok(existing);
        }
        self.save(book)
    }

    pub fn unlike_book(&self, book_id: &str) -> StorageResult<bool> {
        let key = NaturalKey::from_payload(EntityType::LikedItem, &json!({ "book_id": book_id }))?;
        let existing = self
            .storage
            .records()
            .get_by_index(EntityType::LikedItem, &RecordIndex::NaturalKey(key.index_value()))?;

        let mut removed = false;
        for record in existing {
            removed |= self.remove(EntityType::LikedItem, &record.id)?;
        }
        Ok(removed)
    }

    /// 记录阅读进度，每本书只保留一条
    pub fn record_progress(
        &self,
        progress: &ReadingProgress,
    ) -> StorageResult<Entry<ReadingProgress>> {
        self.upsert_by_natural_key(progress)
    }

    pub fn add_annotation(&self, annotation: &Annotation) -> StorageResult<Entry<Annotation>> {
        self.upsert_by_natural_key(annotation)
    }

    // ========== 生词与复习 ==========

    /// 收藏生词
    ///
    /// 已收藏的词只更新释义等信息，保留复习进度。
    pub fn save_word(&self, item: &VocabularyItem) -> StorageResult<VocabularyEntry> {
        match self.find(item)? {
            Some(existing) => {
                let merged = VocabularyItem {
                    mastery: existing.payload.mastery,
                    ..item.clone()
                };
                self.update(&existing.id, &merged)
            }
            None => self.save(item),
        }
    }

    /// 记录一次复习结果并重新调度
    pub fn review_word(
        &self,
        id: &str,
        was_correct: bool,
        now: DateTime<Utc>,
    ) -> StorageResult<ReviewSchedule> {
        let entry = self
            .get::<VocabularyItem>(id)?
            .ok_or_else(|| not_found(EntityType::Vocabulary, id))?;

        let mut item = entry.payload;
        let schedule = item.mastery.apply_review(was_correct, now);
        self.update(id, &item)?;

        log::debug!(
            "复习 {}: {} -> 等级 {}, 下次 {}",
            item.word,
            if was_correct { "正确" } else { "错误" },
            schedule.mastery_level,
            schedule.next_review_at
        );

        Ok(schedule)
    }

    pub fn words(&self) -> StorageResult<Vec<VocabularyEntry>> {
        self.list::<VocabularyItem>()
    }

    /// 已到期的生词，按复习顺序排列
    pub fn due_words(&self, now: DateTime<Utc>) -> StorageResult<Vec<VocabularyEntry>> {
        let mut due: Vec<VocabularyEntry> = self
            .words()?
            .into_iter()
            .filter(|entry| entry.mastery().is_due(now))
            .collect();
        scheduler::order_for_session(&mut due, now);
        Ok(due)
    }

    pub fn review_session(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> StorageResult<Vec<VocabularyEntry>> {
        Ok(scheduler::build_review_session(self.words()?, now, limit))
    }

    pub fn review_stats(&self, now: DateTime<Utc>) -> StorageResult<ReviewStats> {
        Ok(ReviewStats::collect(&self.words()?, now))
    }

    // ========== 同步状态 ==========

    pub fn pending_sync_count(&self) -> StorageResult<PendingSyncCount> {
        self.storage.get_pending_sync_count()
    }

    /// 超过重试上限、等待处理的队列项
    pub fn list_failures(&self) -> StorageResult<Vec<FailedEntry>> {
        self.storage.sync_queue().list_failures()
    }

    /// 将失败项放回队列，下次同步时重试
    pub fn retry_failure(&self, failure_id: i64) -> StorageResult<i64> {
        self.storage.sync_queue().retry_failure(failure_id)
    }

    /// 放弃失败项，对应记录保持未同步状态
    pub fn discard_failure(&self, failure_id: i64) -> StorageResult<bool> {
        self.storage.sync_queue().discard_failure(failure_id)
    }
}

fn not_found(entity_type: EntityType, id: &str) -> StorageError {
    StorageError::NotFound(format!("{}/{}", entity_type.table_name(), id))
}

fn insert_and_enqueue(conn: &Connection, record: &StoredRecord) -> StorageResult<i64> {
    RecordRepositoryRef::new(conn).put(record)?;
    SyncQueueRepositoryRef::new(conn).enqueue(
        SyncAction::Create,
        record.entity_type,
        &record.id,
        &record.payload,
    )
}

fn update_and_enqueue(
    conn: &Connection,
    mut record: StoredRecord,
    payload: Value,
) -> StorageResult<StoredRecord> {
    let natural_key = NaturalKey::from_payload(record.entity_type, &payload)?.index_value();
    if natural_key != record.natural_key {
        return Err(StorageError::InvalidData(format!(
            "{}/{} 的唯一键不可修改: {} -> {}",
            record.entity_type.table_name(),
            record.id,
            record.natural_key,
            natural_key
        )));
    }

    record.set_payload(payload)?;
    record.synced = false;

    RecordRepositoryRef::new(conn).put(&record)?;
    SyncQueueRepositoryRef::new(conn).enqueue(
        SyncAction::Update,
        record.entity_type,
        &record.id,
        &record.payload,
    )?;
    Ok(record)
}
