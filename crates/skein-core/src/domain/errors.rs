//! Errors - エラー型と分類
//!
//! # ErrorKind（運用分類）
//! - Transient: 一時的なエラー（リトライ推奨）
//! - Permanent: 恒久的なエラー（リトライ無意味）
//! - Infrastructure: インフラエラー（store の障害）
//!
//! # 方針
//! - Validation 系は QUEUED のレコードを永続化しない
//! - 依存失敗・実行失敗は event + ERROR 状態としてレコードに残す
//! - Contention は debug ログのみ（"あとで再試行"）
//! - Storage は呼び出し元に返し、worker loop が backoff して再試行

use crate::domain::ids::ServiceId;
use crate::domain::state::ServiceState;
use thiserror::Error;

/// ErrorKind は実行エラーの分類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Permanent,
    Infrastructure,
}

/// ServiceError はドメインエラー
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ServiceError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("dependency {dependency} failed: {reason}")]
    DependencyFailure { dependency: ServiceId, reason: String },

    #[error("execution failed: {0}")]
    Execution(String),

    #[error("lost a race for {0}")]
    StoreContention(ServiceId),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("service not found: {0}")]
    NotFound(ServiceId),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: ServiceState, to: ServiceState },

    #[error("{child} already belongs to {existing}, cannot re-parent under {requested}")]
    HierarchyConflict {
        child: String,
        existing: String,
        requested: String,
    },

    #[error("dependency cycle detected through {0}")]
    DependencyCycle(String),

    #[error("no processor registered for {name}@{version}")]
    ProcessorNotFound { name: String, version: String },

    #[error("processor {name}@{version} is already registered")]
    DuplicateProcessor { name: String, version: String },

    #[error("service {0} was canceled")]
    Canceled(ServiceId),
}

impl ServiceError {
    pub fn validation(msg: impl Into<String>) -> Self {
        ServiceError::Validation(msg.into())
    }

    pub fn execution(msg: impl Into<String>) -> Self {
        ServiceError::Execution(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        ServiceError::Storage(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ServiceError::Storage(_) => ErrorKind::Infrastructure,
            ServiceError::StoreContention(_) | ServiceError::Execution(_) => ErrorKind::Transient,
            ServiceError::Validation(_)
            | ServiceError::DependencyFailure { .. }
            | ServiceError::NotFound(_)
            | ServiceError::InvalidTransition { .. }
            | ServiceError::HierarchyConflict { .. }
            | ServiceError::DependencyCycle(_)
            | ServiceError::ProcessorNotFound { .. }
            | ServiceError::DuplicateProcessor { .. }
            | ServiceError::Canceled(_) => ErrorKind::Permanent,
        }
    }

    /// Worker loop はこれが true のときだけ backoff してやり直す
    pub fn is_retryable(&self) -> bool {
        matches!(self, ServiceError::Storage(_))
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;
