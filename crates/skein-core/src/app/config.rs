//! Config - engine と worker の設定
//!
//! # 読み込み順
//! 1. `Default`（コード内の既定値）
//! 2. JSON 設定ファイル（`from_json`、書かれていないキーは既定値）
//! 3. 環境変数（`from_env` / `overlay`）
//!
//! | 環境変数                  | 設定                         |
//! |---------------------------|------------------------------|
//! | `SKEIN_QUEUE_ID`          | `worker.queueId`             |
//! | `SKEIN_POLL_INTERVAL_MS`  | `worker.pollIntervalMs`      |
//! | `SKEIN_PAGE_SIZE`         | `worker.pageSize`            |
//! | `SKEIN_PROCESSING_SLOTS`  | `resourceCapacities.slots`   |

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::app::backoff::RetryPolicy;

pub const ENV_QUEUE_ID: &str = "SKEIN_QUEUE_ID";
pub const ENV_POLL_INTERVAL_MS: &str = "SKEIN_POLL_INTERVAL_MS";
pub const ENV_PAGE_SIZE: &str = "SKEIN_PAGE_SIZE";
pub const ENV_PROCESSING_SLOTS: &str = "SKEIN_PROCESSING_SLOTS";

/// 処理スロット（`resources["slots"]`）のキー
pub const SLOTS_RESOURCE: &str = "slots";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {key}")]
    InvalidValue { key: String, value: String },

    #[error("malformed config document: {0}")]
    Json(#[from] serde_json::Error),
}

/// WorkerConfig は 1 つの worker loop の設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WorkerConfig {
    /// この worker が claim に使う queue id
    pub queue_id: String,
    pub poll_interval_ms: u64,
    /// 1 回の claim で読む候補数
    pub page_size: usize,
    /// 同時に実行するジョブ数の上限
    pub max_concurrent_jobs: usize,
    pub backoff_base_ms: u64,
    pub backoff_multiplier: f64,
    pub backoff_max_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue_id: "default-queue".to_string(),
            poll_interval_ms: 1_000,
            page_size: 20,
            max_concurrent_jobs: 8,
            backoff_base_ms: 500,
            backoff_multiplier: 2.0,
            backoff_max_ms: 30_000,
        }
    }
}

impl WorkerConfig {
    pub fn with_queue_id(mut self, queue_id: impl Into<String>) -> Self {
        self.queue_id = queue_id.into();
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(self.backoff_base_ms),
            multiplier: self.backoff_multiplier,
            max_delay: Duration::from_millis(self.backoff_max_ms),
        }
    }
}

/// EngineConfig は engine 全体の設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    pub worker: WorkerConfig,
    /// throttle の容量（リソース名 → 上限）
    pub resource_capacities: BTreeMap<String, u32>,
    /// `is_result_ready` を問い合わせる間隔
    pub result_poll_interval_ms: u64,
    /// 結果待ちの上限。None なら無制限
    pub result_timeout_ms: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker: WorkerConfig::default(),
            resource_capacities: BTreeMap::from([(SLOTS_RESOURCE.to_string(), 16)]),
            result_poll_interval_ms: 500,
            result_timeout_ms: None,
        }
    }
}

impl EngineConfig {
    pub fn from_json(doc: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(doc)?)
    }

    /// Defaults overlaid with the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().overlay(|key| std::env::var(key).ok())
    }

    /// Applies overrides from `lookup` (normally the environment).
    pub fn overlay<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(queue_id) = lookup(ENV_QUEUE_ID)
            && !queue_id.trim().is_empty()
        {
            self.worker.queue_id = queue_id.trim().to_string();
        }
        if let Some(v) = parsed(&lookup, ENV_POLL_INTERVAL_MS)? {
            self.worker.poll_interval_ms = v;
        }
        if let Some(v) = parsed(&lookup, ENV_PAGE_SIZE)? {
            self.worker.page_size = v;
        }
        if let Some(v) = parsed(&lookup, ENV_PROCESSING_SLOTS)? {
            self.resource_capacities.insert(SLOTS_RESOURCE.to_string(), v);
        }
        Ok(self)
    }

    pub fn result_poll_interval(&self) -> Duration {
        Duration::from_millis(self.result_poll_interval_ms)
    }

    pub fn result_timeout(&self) -> Option<Duration> {
        self.result_timeout_ms.map(Duration::from_millis)
    }
}

fn parsed<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value: raw,
            }),
    }
}
