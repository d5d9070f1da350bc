use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: PathBuf,
    pub sync: SyncConfig,
    pub trigger: TriggerConfig,
    pub probe: ProbeConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/offline.db"),
            sync: SyncConfig::default(),
            trigger: TriggerConfig::default(),
            probe: ProbeConfig::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let db_path = std::env::var("DANCI_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| Config::default().db_path);

        Ok(Self {
            db_path,
            sync: SyncConfig::from_env()?,
            trigger: TriggerConfig::from_env(),
            probe: ProbeConfig::from_env(),
        })
    }
}

/// 离线创建时远端已存在同键但内容不同的记录的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DivergentCreatePolicy {
    /// 作为可重试失败上报
    #[default]
    Fail,
    /// 接受远端记录
    RemoteWins,
    /// 用本地快照覆盖远端
    LocalWins,
}

impl DivergentCreatePolicy {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "fail" => Some(Self::Fail),
            "remote_wins" => Some(Self::RemoteWins),
            "local_wins" => Some(Self::LocalWins),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub api_base_url: String,
    pub auth_token: Option<String>,
    /// 单个队列项的重试上限，达到后移入失败列表
    pub max_retries: u32,
    pub timeout: Duration,
    pub divergent_create_policy: DivergentCreatePolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_base_url: String::new(),
            auth_token: None,
            max_retries: 3,
            timeout: Duration::from_secs(30),
            divergent_create_policy: DivergentCreatePolicy::default(),
        }
    }
}

impl SyncConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = SyncConfig::default();

        let api_base_url = std::env::var("SYNC_API_BASE_URL").unwrap_or_default();
        let auth_token = std::env::var("SYNC_AUTH_TOKEN").ok().filter(|t| !t.is_empty());

        let max_retries = env_u32("SYNC_MAX_RETRIES", defaults.max_retries);
        if max_retries == 0 {
            return Err(ConfigError::Invalid {
                key: "SYNC_MAX_RETRIES",
                value: max_retries.to_string(),
            });
        }

        let timeout_secs = env_u64("SYNC_TIMEOUT_SECS", defaults.timeout.as_secs());

        let divergent_create_policy = match std::env::var("SYNC_DIVERGENT_CREATE_POLICY") {
            Ok(raw) => DivergentCreatePolicy::parse(&raw).ok_or(ConfigError::Invalid {
                key: "SYNC_DIVERGENT_CREATE_POLICY",
                value: raw,
            })?,
            Err(_) => defaults.divergent_create_policy,
        };

        Ok(Self {
            api_base_url,
            auth_token,
            max_retries,
            timeout: Duration::from_secs(timeout_secs),
            divergent_create_policy,
        })
    }
}

#[derive(Debug, Clone)]
pub struct TriggerConfig {
    /// 合并窗口内的多次触发只执行一次同步
    pub debounce: Duration,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(1500),
        }
    }
}

impl TriggerConfig {
    fn from_env() -> Self {
        let debounce_ms = env_u64("SYNC_DEBOUNCE_MS", 1500);
        Self {
            debounce: Duration::from_millis(debounce_ms),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub enabled: bool,
    pub url: Option<String>,
    pub interval: Duration,
    pub timeout: Duration,
    /// 连续失败多少次判定离线
    pub failure_threshold: u32,
    /// 连续成功多少次判定恢复
    pub recovery_threshold: u32,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: None,
            interval: Duration::from_millis(15000),
            timeout: Duration::from_millis(5000),
            failure_threshold: 2,
            recovery_threshold: 1,
        }
    }
}

impl ProbeConfig {
    fn from_env() -> Self {
        let url = std::env::var("SYNC_PROBE_URL").ok().filter(|u| !u.is_empty());
        let enabled = env_bool("SYNC_PROBE_ENABLED", url.is_some());
        let interval_ms = env_u64("SYNC_PROBE_INTERVAL_MS", 15000);
        let timeout_ms = env_u64("SYNC_PROBE_TIMEOUT_MS", 5000);
        let failure_threshold = env_u32("SYNC_PROBE_FAILURE_THRESHOLD", 2).max(1);
        let recovery_threshold = env_u32("SYNC_PROBE_RECOVERY_THRESHOLD", 1).max(1);

        Self {
            enabled,
            url,
            interval: Duration::from_millis(interval_ms),
            timeout: Duration::from_millis(timeout_ms),
            failure_threshold,
            recovery_threshold,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for env var {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key).ok().as_deref() {
        Some("true") | Some("1") => true,
        Some("false") | Some("0") => false,
        _ => default,
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<u32>().ok())
        .unwrap_or(default)
}
