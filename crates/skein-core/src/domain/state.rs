//! State - ServiceRecord の状態と遷移規則
//!
//! ```text
//! CREATED ──► QUEUED ──► RUNNING ──► SUCCESSFUL ─┐
//!               │           │  │                  │
//!               │           │  └──► ERROR ────────┼──► RETIRED
//!               └──► CANCELED ◄─┘                 │
//!                       └─────────────────────────┘
//! ```
//!
//! RUNNING → QUEUED は明示的な restart のときだけ許可される（`can_restart`）。

use serde::{Deserialize, Serialize};
use std::fmt;

/// ServiceState は ServiceRecord のライフサイクル状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceState {
    Created,
    Queued,
    Running,
    Successful,
    Error,
    Canceled,
    Retired,
}

impl ServiceState {
    pub const ALL: [ServiceState; 7] = [
        ServiceState::Created,
        ServiceState::Queued,
        ServiceState::Running,
        ServiceState::Successful,
        ServiceState::Error,
        ServiceState::Canceled,
        ServiceState::Retired,
    ];

    /// Persisted representation (`"QUEUED"`, ...).
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceState::Created => "CREATED",
            ServiceState::Queued => "QUEUED",
            ServiceState::Running => "RUNNING",
            ServiceState::Successful => "SUCCESSFUL",
            ServiceState::Error => "ERROR",
            ServiceState::Canceled => "CANCELED",
            ServiceState::Retired => "RETIRED",
        }
    }

    /// Ordinary lifecycle transitions. Restart is not included here.
    pub fn can_transition_to(&self, next: ServiceState) -> bool {
        use ServiceState::*;
        matches!(
            (self, next),
            (Created, Queued)
                | (Queued, Running)
                | (Running, Successful)
                | (Running, Error)
                | (Queued, Canceled)
                | (Running, Canceled)
                | (Successful, Retired)
                | (Error, Retired)
                | (Canceled, Retired)
        )
    }

    /// RUNNING → QUEUED, reachable only through an explicit restart.
    pub fn can_restart(&self) -> bool {
        matches!(self, ServiceState::Running)
    }

    /// 実行が終わった状態（これ以上 worker が触らない）
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            ServiceState::Successful
                | ServiceState::Error
                | ServiceState::Canceled
                | ServiceState::Retired
        )
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
