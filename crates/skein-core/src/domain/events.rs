//! Events - ServiceRecord に追記されるイベント
//!
//! events は append-only。一度追記したイベントは書き換えない。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 代表的なイベント名
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    UpdateState,
    Queued,
    Completed,
    Failed,
    Canceled,
    DependencyFailure,
    Restarted,
    Timeout,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::UpdateState => "UPDATE_STATE",
            EventType::Queued => "QUEUED",
            EventType::Completed => "COMPLETED",
            EventType::Failed => "FAILED",
            EventType::Canceled => "CANCELED",
            EventType::DependencyFailure => "DEPENDENCY_FAILURE",
            EventType::Restarted => "RESTARTED",
            EventType::Timeout => "TIMEOUT",
        }
    }
}

/// ServiceEvent は ServiceRecord の `events` 配列の 1 要素
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEvent {
    pub name: String,
    pub value: String,
    pub timestamp: DateTime<Utc>,
}

impl ServiceEvent {
    pub fn new(kind: EventType, value: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            name: kind.as_str().to_string(),
            value: value.into(),
            timestamp,
        }
    }

    pub fn is(&self, kind: EventType) -> bool {
        self.name == kind.as_str()
    }
}
