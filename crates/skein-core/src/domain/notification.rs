//! Notification - ライフサイクル通知の登録と通知メッセージ
//!
//! ServiceRecord の `processingStageNotifications` に登録しておくと、
//! engine が該当するライフサイクル段階で `NotificationSink` に通知を送る。

use crate::domain::ids::ServiceId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// LifecycleStage は通知を発火する段階
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleStage {
    /// RUNNING に入ったとき
    Start,
    /// SUCCESSFUL に入ったとき
    Successful,
    /// ERROR に入ったとき
    Failed,
}

impl LifecycleStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleStage::Start => "start",
            LifecycleStage::Successful => "successful",
            LifecycleStage::Failed => "failed",
        }
    }
}

impl fmt::Display for LifecycleStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which stages a registration listens to.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StageSelector {
    #[default]
    All,
    Only(LifecycleStage),
}

impl StageSelector {
    pub fn matches(&self, stage: LifecycleStage) -> bool {
        match self {
            StageSelector::All => true,
            StageSelector::Only(s) => *s == stage,
        }
    }
}

/// NotificationRegistration は「何を」「どの段階で」送るかの登録
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRegistration {
    pub event_name: String,
    #[serde(default)]
    pub stages: StageSelector,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub data: BTreeMap<String, String>,
}

impl NotificationRegistration {
    pub fn on_all_stages(event_name: impl Into<String>) -> Self {
        Self {
            event_name: event_name.into(),
            stages: StageSelector::All,
            data: BTreeMap::new(),
        }
    }

    pub fn on_stage(event_name: impl Into<String>, stage: LifecycleStage) -> Self {
        Self {
            event_name: event_name.into(),
            stages: StageSelector::Only(stage),
            data: BTreeMap::new(),
        }
    }

    /// Blank values are dropped.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let value = value.into();
        if !value.trim().is_empty() {
            self.data.insert(name.into(), value);
        }
        self
    }
}

/// Notification は NotificationSink に送られるメッセージ
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub service_id: ServiceId,
    pub event_name: String,
    pub stage: LifecycleStage,
    pub data: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
}
