#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Notify;

use danci_offline::config::SyncConfig;
use danci_offline::remote::{RemoteError, RemoteRecord, RemoteStore};
use danci_offline::storage::{EntityType, NaturalKey, Storage};
use danci_offline::sync::Reconciler;
use danci_offline::OfflineStore;

pub const USER_ID: &str = "u1";

/// 远端调用记录
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Find(EntityType, Value),
    Insert(EntityType, Value),
    Update(EntityType, String, Value),
    Delete(EntityType, Value),
}

impl Call {
    pub fn entity_type(&self) -> EntityType {
        match self {
            Call::Find(e, _) | Call::Insert(e, _) | Call::Delete(e, _) => *e,
            Call::Update(e, _, _) => *e,
        }
    }
}

type CallMatcher = Box<dyn Fn(&Call) -> bool + Send + Sync>;

struct FailRule {
    matches: CallMatcher,
    error: RemoteError,
    /// None 表示一直失败
    remaining: Option<usize>,
}

#[derive(Default)]
struct FakeState {
    next_id: u64,
    records: Vec<(EntityType, RemoteRecord)>,
    calls: Vec<Call>,
    rules: Vec<FailRule>,
}

/// 内存中的远端存储
#[derive(Default)]
pub struct FakeRemoteStore {
    state: Mutex<FakeState>,
    gate: Mutex<Option<Gate>>,
}

#[derive(Clone)]
struct Gate {
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

/// 阻塞远端调用的闸门，用于在同步进行中插入操作
pub struct GateHandle {
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

impl GateHandle {
    /// 等待第一个远端调用进入闸门
    pub async fn wait_entered(&self) {
        self.entered.notified().await;
    }

    pub fn release(&self) {
        self.release.notify_one();
    }
}

impl FakeRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 直接写入一条远端记录
    pub fn seed(&self, entity_type: EntityType, fields: Value) -> String {
        let mut state = self.state.lock().expect("fake state");
        state.next_id += 1;
        let remote_id = format!("remote-{}", state.next_id);
        state.records.push((
            entity_type,
            RemoteRecord {
                remote_id: remote_id.clone(),
                fields,
            },
        ));
        remote_id
    }

    pub fn clear_records(&self) {
        self.state.lock().expect("fake state").records.clear();
    }

    pub fn records(&self, entity_type: EntityType) -> Vec<RemoteRecord> {
        self.state
            .lock()
            .expect("fake state")
            .records
            .iter()
            .filter(|(e, _)| *e == entity_type)
            .map(|(_, record)| record.clone())
            .collect()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().expect("fake state").calls.clone()
    }

    pub fn count_calls(&self, predicate: impl Fn(&Call) -> bool) -> usize {
        self.calls().iter().filter(|call| predicate(call)).count()
    }

    pub fn fail_always(
        &self,
        matches: impl Fn(&Call) -> bool + Send + Sync + 'static,
        error: RemoteError,
    ) {
        self.push_rule(Box::new(matches), error, None);
    }

    pub fn fail_times(
        &self,
        times: usize,
        matches: impl Fn(&Call) -> bool + Send + Sync + 'static,
        error: RemoteError,
    ) {
        self.push_rule(Box::new(matches), error, Some(times));
    }

    pub fn clear_failures(&self) {
        self.state.lock().expect("fake state").rules.clear();
    }

    /// 之后的第一个远端调用会阻塞，直到 `GateHandle::release`
    pub fn install_gate(&self) -> GateHandle {
        let gate = Gate {
            entered: Arc::new(Notify::new()),
            release: Arc::new(Notify::new()),
        };
        let handle = GateHandle {
            entered: gate.entered.clone(),
            release: gate.release.clone(),
        };
        *self.gate.lock().expect("gate") = Some(gate);
        handle
    }

    fn push_rule(&self, matches: CallMatcher, error: RemoteError, remaining: Option<usize>) {
        self.state.lock().expect("fake state").rules.push(FailRule {
            matches,
            error,
            remaining,
        });
    }

    async fn pass_gate(&self) {
        let gate = self.gate.lock().expect("gate").take();
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
    }

    /// 记录调用并检查是否需要注入失败
    fn record_call(&self, call: Call) -> Result<(), RemoteError> {
        let mut state = self.state.lock().expect("fake state");
        state.calls.push(call.clone());

        for rule in state.rules.iter_mut() {
            if !(rule.matches)(&call) {
                continue;
            }
            match rule.remaining.as_mut() {
                None => return Err(rule.error.clone()),
                Some(0) => continue,
                Some(n) => {
                    *n -= 1;
                    return Err(rule.error.clone());
                }
            }
        }
        Ok(())
    }
}

fn key_matches(key: &NaturalKey, fields: &Value) -> bool {
    key.fields
        .iter()
        .all(|(name, value)| fields.get(name) == Some(value))
}

#[async_trait]
impl RemoteStore for FakeRemoteStore {
    async fn find_by_natural_key(
        &self,
        key: &NaturalKey,
    ) -> Result<Option<RemoteRecord>, RemoteError> {
        self.pass_gate().await;
        self.record_call(Call::Find(key.entity_type, Value::Object(key.fields.clone())))?;

        let state = self.state.lock().expect("fake state");
        Ok(state
            .records
            .iter()
            .find(|(e, record)| *e == key.entity_type && key_matches(key, &record.fields))
            .map(|(_, record)| record.clone()))
    }

    async fn insert(
        &self,
        entity_type: EntityType,
        fields: &Value,
    ) -> Result<RemoteRecord, RemoteError> {
        self.pass_gate().await;
        self.record_call(Call::Insert(entity_type, fields.clone()))?;

        let remote_id = self.seed(entity_type, fields.clone());
        Ok(RemoteRecord {
            remote_id,
            fields: fields.clone(),
        })
    }

    async fn update(
        &self,
        entity_type: EntityType,
        remote_id: &str,
        patch: &Value,
    ) -> Result<(), RemoteError> {
        self.pass_gate().await;
        self.record_call(Call::Update(entity_type, remote_id.to_string(), patch.clone()))?;

        let mut state = self.state.lock().expect("fake state");
        let record = state
            .records
            .iter_mut()
            .find(|(e, record)| *e == entity_type && record.remote_id == remote_id)
            .map(|(_, record)| record)
            .ok_or_else(|| RemoteError::NotFound(remote_id.to_string()))?;

        if let (Some(target), Some(patch)) = (record.fields.as_object_mut(), patch.as_object()) {
            for (name, value) in patch {
                target.insert(name.clone(), value.clone());
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &NaturalKey) -> Result<(), RemoteError> {
        self.pass_gate().await;
        self.record_call(Call::Delete(key.entity_type, Value::Object(key.fields.clone())))?;

        let mut state = self.state.lock().expect("fake state");
        let before = state.records.len();
        state
            .records
            .retain(|(e, record)| !(*e == key.entity_type && key_matches(key, &record.fields)));

        if state.records.len() == before {
            Err(RemoteError::NotFound(format!("{:?}", key.fields)))
        } else {
            Ok(())
        }
    }
}

pub struct Fixture {
    pub store: OfflineStore,
    pub remote: Arc<FakeRemoteStore>,
    pub reconciler: Arc<Reconciler>,
}

pub fn sync_config(max_retries: u32) -> SyncConfig {
    SyncConfig {
        max_retries,
        ..SyncConfig::default()
    }
}

pub fn setup() -> Fixture {
    setup_with(sync_config(3))
}

pub fn setup_with(config: SyncConfig) -> Fixture {
    let storage = Storage::in_memory().expect("Failed to create in-memory storage");
    setup_on(storage, config)
}

pub fn setup_on(storage: Storage, config: SyncConfig) -> Fixture {
    let remote = Arc::new(FakeRemoteStore::new());
    let reconciler = Arc::new(Reconciler::new(
        storage.clone(),
        remote.clone() as Arc<dyn RemoteStore>,
        config,
    ));

    Fixture {
        store: OfflineStore::new(storage),
        remote,
        reconciler,
    }
}
