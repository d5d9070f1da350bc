//! 数据模型定义
//!
//! 定义离线存储所需的数据结构，以及与数据库交互的方法。

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, Result as SqliteResult, Row};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::scheduler::{MasteryState, Reviewable};
use crate::storage::{StorageError, StorageResult};

/// 离线创建记录的 id 前缀，与服务端 id 区分
pub const LOCAL_ID_PREFIX: &str = "local-";

/// 生成离线记录 id
pub fn new_local_id() -> String {
    format!("{}{}", LOCAL_ID_PREFIX, Uuid::new_v4())
}

// ============================================================
// EntityType - 实体类型
// ============================================================

/// 可同步的实体类型，每种类型对应一张本地表
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    LikedItem,
    Progress,
    Vocabulary,
    Annotation,
}

impl EntityType {
    pub const ALL: [EntityType; 4] = [
        EntityType::LikedItem,
        EntityType::Progress,
        EntityType::Vocabulary,
        EntityType::Annotation,
    ];

    /// 本地表名，同时作为队列中的实体类型标识
    pub fn table_name(&self) -> &'static str {
        match self {
            EntityType::LikedItem => "liked_items",
            EntityType::Progress => "progress",
            EntityType::Vocabulary => "vocabulary",
            EntityType::Annotation => "annotations",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|e| e.table_name() == value)
    }

    /// 业务唯一键字段（不含 user_id，user_id 在同步时注入）
    pub fn natural_key_fields(&self) -> &'static [&'static str] {
        match self {
            EntityType::LikedItem => &["book_id"],
            EntityType::Progress => &["book_id"],
            EntityType::Vocabulary => &["word"],
            EntityType::Annotation => &["book_id", "location"],
        }
    }
}

// ============================================================
// SyncAction - 同步操作类型
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncAction {
    Create,
    Update,
    Delete,
}

impl SyncAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncAction::Create => "create",
            SyncAction::Update => "update",
            SyncAction::Delete => "delete",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "create" => Some(SyncAction::Create),
            "update" => Some(SyncAction::Update),
            "delete" => Some(SyncAction::Delete),
            _ => None,
        }
    }
}

// ============================================================
// NaturalKey - 业务唯一键
// ============================================================

/// 远端查重使用的业务唯一键
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NaturalKey {
    pub entity_type: EntityType,
    pub fields: Map<String, Value>,
}

impl NaturalKey {
    /// 从记录数据中提取业务唯一键
    ///
    /// 缺少任一键字段时返回 `StorageError::InvalidData`。
    pub fn from_payload(entity_type: EntityType, payload: &Value) -> StorageResult<Self> {
        let mut fields = Map::new();
        for field in entity_type.natural_key_fields() {
            match payload.get(*field) {
                Some(value) if !value.is_null() => {
                    fields.insert((*field).to_string(), value.clone());
                }
                _ => {
                    return Err(StorageError::InvalidData(format!(
                        "{} 缺少唯一键字段 {}",
                        entity_type.table_name(),
                        field
                    )))
                }
            }
        }

        Ok(Self {
            entity_type,
            fields,
        })
    }

    /// 注入用户 id
    pub fn with_user(mut self, user_id: &str) -> Self {
        self.fields
            .insert("user_id".to_string(), Value::String(user_id.to_string()));
        self
    }

    /// 本地 natural_key 列的索引值，如 `book_id=b1|location=p3`
    pub fn index_value(&self) -> String {
        self.entity_type
            .natural_key_fields()
            .iter()
            .map(|field| {
                let value = match self.fields.get(*field) {
                    Some(Value::String(s)) => s.clone(),
                    Some(other) => other.to_string(),
                    None => String::new(),
                };
                format!("{}={}", field, value)
            })
            .collect::<Vec<_>>()
            .join("|")
    }
}

// ============================================================
// 实体数据
// ============================================================

/// 可存储的实体数据
pub trait EntityPayload: Serialize + DeserializeOwned {
    const ENTITY_TYPE: EntityType;

    fn to_value(&self) -> StorageResult<Value> {
        serde_json::to_value(self).map_err(|e| StorageError::Serialization(e.to_string()))
    }

    fn from_value(value: &Value) -> StorageResult<Self> {
        serde_json::from_value(value.clone())
            .map_err(|e| StorageError::Serialization(e.to_string()))
    }
}

/// 喜欢的书籍
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LikedBook {
    pub book_id: String,
    pub title: String,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub cover_url: Option<String>,
}

impl EntityPayload for LikedBook {
    const ENTITY_TYPE: EntityType = EntityType::LikedItem;
}

/// 阅读进度
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadingProgress {
    pub book_id: String,
    /// 阅读位置（页码或 CFI）
    pub location: String,
    /// 阅读百分比 (0-100)
    pub percentage: f64,
    #[serde(default)]
    pub chapter: Option<String>,
}

impl EntityPayload for ReadingProgress {
    const ENTITY_TYPE: EntityType = EntityType::Progress;
}

/// 生词
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VocabularyItem {
    pub word: String,
    #[serde(default)]
    pub definition: Option<String>,
    /// 原文语境
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub book_id: Option<String>,
    #[serde(default)]
    pub page_number: Option<u32>,
    #[serde(default)]
    pub mastery: MasteryState,
}

impl VocabularyItem {
    pub fn new(word: impl Into<String>) -> Self {
        Self {
            word: word.into(),
            definition: None,
            context: None,
            book_id: None,
            page_number: None,
            mastery: MasteryState::default(),
        }
    }
}

impl EntityPayload for VocabularyItem {
    const ENTITY_TYPE: EntityType = EntityType::Vocabulary;
}

impl Reviewable for VocabularyItem {
    fn mastery(&self) -> &MasteryState {
        &self.mastery
    }
}

/// 批注
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub book_id: String,
    pub location: String,
    pub selected_text: String,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
}

impl EntityPayload for Annotation {
    const ENTITY_TYPE: EntityType = EntityType::Annotation;
}

// ============================================================
// StoredRecord - 本地记录
// ============================================================

/// 本地记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    /// 本地稳定 id（离线创建的为 `local-<uuid>`）
    pub id: String,
    pub entity_type: EntityType,
    /// natural_key 索引值
    pub natural_key: String,
    pub payload: Value,
    /// 远端确认后才为 true
    pub synced: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StoredRecord {
    /// 创建未同步的新记录
    pub fn new(
        entity_type: EntityType,
        id: impl Into<String>,
        payload: Value,
    ) -> StorageResult<Self> {
        let natural_key = NaturalKey::from_payload(entity_type, &payload)?.index_value();
        let now = Utc::now();

        Ok(Self {
            id: id.into(),
            entity_type,
            natural_key,
            payload,
            synced: false,
            created_at: now,
            updated_at: now,
        })
    }

    /// 从实体数据创建离线记录
    pub fn from_payload<P: EntityPayload>(payload: &P) -> StorageResult<Self> {
        Self::new(P::ENTITY_TYPE, new_local_id(), payload.to_value()?)
    }

    /// 替换数据并刷新索引值与更新时间
    pub fn set_payload(&mut self, payload: Value) -> StorageResult<()> {
        self.natural_key = NaturalKey::from_payload(self.entity_type, &payload)?.index_value();
        self.payload = payload;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn payload_as<P: EntityPayload>(&self) -> StorageResult<P> {
        P::from_value(&self.payload)
    }

    /// 从数据库行解析
    pub fn from_row(entity_type: EntityType, row: &Row) -> SqliteResult<Self> {
        Ok(Self {
            id: row.get("id")?,
            entity_type,
            natural_key: row.get("natural_key")?,
            payload: parse_json(row.get::<_, String>("payload")?)?,
            synced: row.get::<_, i32>("synced")? != 0,
            created_at: parse_datetime(row.get::<_, String>("created_at")?)?,
            updated_at: parse_datetime(row.get::<_, String>("updated_at")?)?,
        })
    }

    /// 插入或更新 (upsert)
    pub fn upsert(&self, conn: &Connection) -> StorageResult<()> {
        let sql = format!(
            r#"
            INSERT INTO {} (id, natural_key, payload, synced, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(id) DO UPDATE SET
                natural_key = excluded.natural_key,
                payload = excluded.payload,
                synced = excluded.synced,
                updated_at = excluded.updated_at
            "#,
            self.entity_type.table_name()
        );

        conn.execute(
            &sql,
            params![
                self.id,
                self.natural_key,
                self.payload.to_string(),
                self.synced as i32,
                format_datetime(self.created_at),
                format_datetime(self.updated_at),
            ],
        )?;
        Ok(())
    }
}

// ============================================================
// QueueEntry - 同步队列项
// ============================================================

/// 同步队列项
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    /// 单调递增 id，决定 FIFO 顺序
    pub id: i64,
    pub action: SyncAction,
    pub entity_type: EntityType,
    pub record_id: String,
    /// 入队时的数据快照
    pub data: Value,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QueueEntry {
    pub fn from_row(row: &Row) -> SqliteResult<Self> {
        Ok(Self {
            id: row.get("id")?,
            action: parse_action(row.get::<_, String>("action")?)?,
            entity_type: parse_entity_type(row.get::<_, String>("entity_type")?)?,
            record_id: row.get("record_id")?,
            data: parse_json(row.get::<_, String>("data")?)?,
            retry_count: row.get("retry_count")?,
            last_error: row.get("last_error")?,
            created_at: parse_datetime(row.get::<_, String>("created_at")?)?,
            updated_at: parse_datetime(row.get::<_, String>("updated_at")?)?,
        })
    }
}

/// 超过重试上限、等待人工处理的同步项
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedEntry {
    pub id: i64,
    /// 原队列项 id
    pub queue_id: i64,
    pub action: SyncAction,
    pub entity_type: EntityType,
    pub record_id: String,
    pub data: Value,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub failed_at: DateTime<Utc>,
}

impl FailedEntry {
    pub fn from_row(row: &Row) -> SqliteResult<Self> {
        Ok(Self {
            id: row.get("id")?,
            queue_id: row.get("queue_id")?,
            action: parse_action(row.get::<_, String>("action")?)?,
            entity_type: parse_entity_type(row.get::<_, String>("entity_type")?)?,
            record_id: row.get("record_id")?,
            data: parse_json(row.get::<_, String>("data")?)?,
            retry_count: row.get("retry_count")?,
            last_error: row.get("last_error")?,
            created_at: parse_datetime(row.get::<_, String>("created_at")?)?,
            failed_at: parse_datetime(row.get::<_, String>("failed_at")?)?,
        })
    }
}

// ============================================================
// 辅助函数
// ============================================================

fn conversion_error<E>(err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(err))
}

fn invalid_column(message: String) -> rusqlite::Error {
    conversion_error(std::io::Error::new(std::io::ErrorKind::InvalidData, message))
}

fn parse_json(s: String) -> SqliteResult<Value> {
    serde_json::from_str(&s).map_err(conversion_error)
}

fn parse_action(s: String) -> SqliteResult<SyncAction> {
    SyncAction::parse(&s).ok_or_else(|| invalid_column(format!("未知的同步操作: {}", s)))
}

fn parse_entity_type(s: String) -> SqliteResult<EntityType> {
    EntityType::parse(&s).ok_or_else(|| invalid_column(format!("未知的实体类型: {}", s)))
}

/// 解析日期时间字符串（RFC3339 或 SQLite datetime 格式）
pub(crate) fn parse_datetime(s: String) -> SqliteResult<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(&s) {
        return Ok(dt.with_timezone(&Utc));
    }

    chrono::NaiveDateTime::parse_from_str(&s, "%Y-%m-%d %H:%M:%S")
        .map(|dt| DateTime::from_naive_utc_and_offset(dt, Utc))
        .map_err(conversion_error)
}

/// 格式化日期时间为字符串（毫秒精度，可按字典序比较）
pub(crate) fn format_datetime(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}
