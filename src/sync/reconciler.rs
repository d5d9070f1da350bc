//! 同步对账引擎
//!
//! 在同步开始时对队列做快照，按 FIFO 逐项回放到远端：
//! - create 先按业务唯一键查找，不存在才插入，重放幂等
//! - update 远端不存在时视为成功
//! - delete 远端不存在时视为成功
//!
//! 单项失败不会中断本次同步。前序项失败后，本次同步跳过同一本地记录或同一业务唯一键的后续项。

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{broadcast, watch};

use crate::config::{DivergentCreatePolicy, SyncConfig};
use crate::remote::{IdentityProvider, RemoteError, RemoteStore};
use crate::storage::{
    EntityType, NaturalKey, QueueEntry, RecordRepositoryRef, Storage, StorageResult,
    SyncAction, SyncQueueRepositoryRef,
};
use crate::sync::{SyncError, SyncErrorEntry, SyncProgress, SyncResult, SyncStatus};

const PROGRESS_CHANNEL_CAPACITY: usize = 64;

/// 同步对账引擎
///
/// 每台设备只应有一个实例，运行标记由实例自身持有。
pub struct Reconciler {
    storage: Storage,
    remote: Arc<dyn RemoteStore>,
    config: SyncConfig,
    running: AtomicBool,
    progress_tx: broadcast::Sender<SyncProgress>,
    status_tx: watch::Sender<SyncStatus>,
}

/// 运行结束（包括出错返回）时清除运行标记
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Reconciler {
    pub fn new(storage: Storage, remote: Arc<dyn RemoteStore>, config: SyncConfig) -> Self {
        let (progress_tx, _) = broadcast::channel(PROGRESS_CHANNEL_CAPACITY);
        let (status_tx, _) = watch::channel(SyncStatus::Idle);

        Self {
            storage,
            remote,
            config,
            running: AtomicBool::new(false),
            progress_tx,
            status_tx,
        }
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn subscribe_progress(&self) -> broadcast::Receiver<SyncProgress> {
        self.progress_tx.subscribe()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.status_tx.subscribe()
    }

    pub fn status(&self) -> SyncStatus {
        self.status_tx.borrow().clone()
    }

    /// 以当前登录用户执行同步
    pub async fn reconcile_as(
        &self,
        identity: &dyn IdentityProvider,
    ) -> Result<SyncResult, SyncError> {
        let user_id = identity
            .current_user_id()
            .ok_or(SyncError::MissingIdentity)?;
        self.reconcile(&user_id).await
    }

    /// 执行一次同步
    ///
    /// 已有同步在运行时立即返回 `SyncError::AlreadyRunning`。
    /// 本地存储错误直接返回，远端错误记录在结果中。
    pub async fn reconcile(&self, user_id: &str) -> Result<SyncResult, SyncError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            log::debug!("同步正在进行，忽略本次请求");
            return Err(SyncError::AlreadyRunning);
        }
        let _guard = RunGuard(&self.running);

        match self.run(user_id).await {
            Ok(result) => {
                let status = if result.success {
                    SyncStatus::Success {
                        synced: result.synced_count,
                        at: result.sync_time,
                    }
                } else {
                    SyncStatus::Error {
                        message: format!("{} 个同步项超过重试上限", result.permanent_failures),
                        failed: result.permanent_failures,
                    }
                };
                self.status_tx.send_replace(status);
                Ok(result)
            }
            Err(e) => {
                log::error!("同步中止: {}", e);
                self.status_tx.send_replace(SyncStatus::Error {
                    message: e.to_string(),
                    failed: 0,
                });
                Err(e)
            }
        }
    }

    async fn run(&self, user_id: &str) -> Result<SyncResult, SyncError> {
        let started = Instant::now();
        let queue = self.storage.sync_queue();

        let snapshot = queue.peek_all()?;
        let total = snapshot.len();

        // 失败列表中仍有条目的记录，后续项必须等待人工处理
        let mut blocked: HashSet<BlockKey> = queue
            .list_failures()?
            .iter()
            .flat_map(|failure| {
                block_keys(failure.entity_type, &failure.record_id, &failure.data)
            })
            .collect();

        self.status_tx.send_replace(SyncStatus::Syncing { total });
        log::info!("开始同步: {} 个队列项", total);

        let mut result = SyncResult::empty(total);

        for (idx, entry) in snapshot.iter().enumerate() {
            let keys = block_keys(entry.entity_type, &entry.record_id, &entry.data);

            if keys.iter().any(|key| blocked.contains(key)) {
                log::debug!(
                    "跳过队列项 {}: {}/{} 的前序项尚未成功",
                    entry.id,
                    entry.entity_type.table_name(),
                    entry.record_id
                );
                result.skipped_count += 1;
            } else {
                match self.apply_entry(entry, user_id).await {
                    Ok(()) => {
                        self.complete_entry(entry)?;
                        result.synced_count += 1;
                    }
                    Err(err) => {
                        blocked.extend(keys);
                        let failure = self.fail_entry(entry, &err)?;
                        result.failed_count += 1;
                        if failure.permanent {
                            result.permanent_failures += 1;
                        }
                        result.errors.push(failure);
                    }
                }
            }

            // 没有订阅者时发送失败，忽略
            let _ = self.progress_tx.send(SyncProgress {
                synced: result.synced_count,
                failed: result.failed_count,
                processed: idx + 1,
                total,
            });
        }

        result.success = result.permanent_failures == 0;
        result.duration_ms = started.elapsed().as_millis() as u64;
        result.sync_time = Utc::now();
        self.storage.set_last_sync_time(result.sync_time)?;

        log::info!(
            "同步完成: 成功 {} 项, 失败 {} 项 (永久 {}), 跳过 {} 项, 耗时 {}ms",
            result.synced_count,
            result.failed_count,
            result.permanent_failures,
            result.skipped_count,
            result.duration_ms
        );

        Ok(result)
    }

    /// 将单个队列项回放到远端
    async fn apply_entry(&self, entry: &QueueEntry, user_id: &str) -> Result<(), RemoteError> {
        let key = NaturalKey::from_payload(entry.entity_type, &entry.data)
            .map_err(|e| RemoteError::Validation(e.to_string()))?
            .with_user(user_id);

        match entry.action {
            SyncAction::Create => {
                let fields = remote_fields(&entry.data, user_id);
                match self.remote.find_by_natural_key(&key).await? {
                    None => {
                        self.remote.insert(entry.entity_type, &fields).await?;
                        Ok(())
                    }
                    Some(existing) if fields_match(&entry.data, &existing.fields) => Ok(()),
                    Some(existing) => match self.config.divergent_create_policy {
                        DivergentCreatePolicy::Fail => Err(RemoteError::Conflict(format!(
                            "远端已存在内容不同的记录 {}",
                            existing.remote_id
                        ))),
                        DivergentCreatePolicy::RemoteWins => {
                            log::warn!(
                                "{}/{} 与远端记录 {} 不一致，保留远端",
                                entry.entity_type.table_name(),
                                entry.record_id,
                                existing.remote_id
                            );
                            Ok(())
                        }
                        DivergentCreatePolicy::LocalWins => {
                            self.remote
                                .update(entry.entity_type, &existing.remote_id, &fields)
                                .await
                        }
                    },
                }
            }
            SyncAction::Update => match self.remote.find_by_natural_key(&key).await? {
                Some(existing) => {
                    let fields = remote_fields(&entry.data, user_id);
                    self.remote
                        .update(entry.entity_type, &existing.remote_id, &fields)
                        .await
                }
                None => {
                    log::debug!(
                        "远端不存在 {}/{}，跳过更新",
                        entry.entity_type.table_name(),
                        entry.record_id
                    );
                    Ok(())
                }
            },
            SyncAction::Delete => match self.remote.delete(&key).await {
                Ok(()) | Err(RemoteError::NotFound(_)) => Ok(()),
                Err(e) => Err(e),
            },
        }
    }

    /// 删除已确认的队列项，记录没有其他待处理项时标记为已同步
    fn complete_entry(&self, entry: &QueueEntry) -> StorageResult<()> {
        self.storage.transaction(|conn| {
            let queue = SyncQueueRepositoryRef::new(conn);
            queue.remove(entry.id)?;

            if !queue.has_pending_for(entry.entity_type, &entry.record_id)? {
                RecordRepositoryRef::new(conn).mark_synced(entry.entity_type, &entry.record_id)?;
            }
            Ok(())
        })
    }

    /// 记录失败，达到重试上限时移入失败列表
    fn fail_entry(&self, entry: &QueueEntry, err: &RemoteError) -> StorageResult<SyncErrorEntry> {
        let message = err.to_string();
        let max_retries = self.config.max_retries;

        let (retry_count, permanent) = self.storage.transaction(|conn| {
            let queue = SyncQueueRepositoryRef::new(conn);
            let retry_count = queue.increment_retry(entry.id, &message)?;
            let permanent = retry_count >= max_retries;
            if permanent {
                queue.move_to_failures(entry.id)?;
            }
            Ok((retry_count, permanent))
        })?;

        log::warn!(
            "同步项 {} ({} {}/{}) 失败 (第 {} 次): {}",
            entry.id,
            entry.action.as_str(),
            entry.entity_type.table_name(),
            entry.record_id,
            retry_count,
            message
        );

        Ok(SyncErrorEntry {
            entry_id: entry.id,
            action: entry.action,
            entity_type: entry.entity_type,
            record_id: entry.record_id.clone(),
            error: message,
            retry_count,
            permanent,
        })
    }
}

/// 因果顺序的阻塞键
///
/// 远端按业务唯一键识别记录，取消收藏后再次收藏会产生新的本地行，
/// 所以本地行 id 和业务唯一键都要阻塞。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum BlockKey {
    Record(EntityType, String),
    Natural(EntityType, String),
}

/// 快照缺少唯一键字段时只按本地行阻塞
fn block_keys(entity_type: EntityType, record_id: &str, data: &Value) -> Vec<BlockKey> {
    let mut keys = vec![BlockKey::Record(entity_type, record_id.to_string())];
    if let Ok(key) = NaturalKey::from_payload(entity_type, data) {
        keys.push(BlockKey::Natural(entity_type, key.index_value()));
    }
    keys
}

/// 远端字段：本地快照加上 user_id
fn remote_fields(data: &Value, user_id: &str) -> Value {
    let mut fields = data.clone();
    if let Some(object) = fields.as_object_mut() {
        object.insert("user_id".to_string(), Value::String(user_id.to_string()));
    }
    fields
}

/// 远端记录是否与本地快照一致（只比较本地拥有的字段）
fn fields_match(local: &Value, remote: &Value) -> bool {
    match (local.as_object(), remote.as_object()) {
        (Some(local), Some(remote)) => local.iter().all(|(name, value)| match remote.get(name) {
            Some(remote_value) => remote_value == value,
            None => value.is_null(),
        }),
        _ => local == remote,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_remote_fields_injects_user() {
        let fields = remote_fields(&json!({"book_id": "b1"}), "u1");
        assert_eq!(fields, json!({"book_id": "b1", "user_id": "u1"}));
    }

    #[test]
    fn test_fields_match() {
        let local = json!({"book_id": "b1", "title": "Dune", "author": null});
        assert!(fields_match(
            &local,
            &json!({"book_id": "b1", "title": "Dune", "user_id": "u1", "created_at": "x"})
        ));
        assert!(!fields_match(&local, &json!({"book_id": "b1", "title": "Emma"})));
        assert!(!fields_match(&local, &json!({"book_id": "b1"})));
    }

    #[test]
    fn test_block_keys() {
        let keys = block_keys(EntityType::LikedItem, "r1", &json!({"book_id": "b1"}));
        assert_eq!(
            keys,
            vec![
                BlockKey::Record(EntityType::LikedItem, "r1".to_string()),
                BlockKey::Natural(EntityType::LikedItem, "book_id=b1".to_string()),
            ]
        );

        // 另一本地行的同一本书共享唯一键
        let other = block_keys(EntityType::LikedItem, "r2", &json!({"book_id": "b1"}));
        assert!(other.iter().any(|key| keys.contains(key)));

        let keys = block_keys(EntityType::LikedItem, "r3", &json!({"title": "no book id"}));
        assert_eq!(keys, vec![BlockKey::Record(EntityType::LikedItem, "r3".to_string())]);
    }

    #[test]
    fn test_run_guard_clears_flag() {
        let flag = AtomicBool::new(true);
        {
            let _guard = RunGuard(&flag);
        }
        assert!(!flag.load(Ordering::Acquire));
    }
}
