//! ServiceStore port - ServiceRecord の永続化（document store）
//!
//! ServiceStore は以下を提供します：
//! - CRUD（save / find / delete）
//! - フィールド単位の部分更新（`update`）
//! - ページング付きの検索（query-by-example）
//! - claim プロトコル用の条件付き更新（`compare_and_update`）
//!
//! # 設計原則
//! - 1 レコードへの `update` はアトミック
//! - `compare_and_update` は条件判定と更新を 1 つのアトミック操作で行う
//! - 分散ロックは使わない。worker 間の調整はこの 2 つだけで行う
//!
//! アーカイブ用 store も同じ trait の別インスタンスです。

use async_trait::async_trait;

use crate::domain::{
    DateInterval, FieldUpdates, PageRequest, PageResult, ProcessingLocation, ServiceId,
    ServiceRecord, ServiceResult, ServiceState, UpdateCondition,
};

/// Query-by-example: 設定されたフィールドがすべて等しいレコードにマッチ
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServicePattern {
    pub id: Option<ServiceId>,
    pub name: Option<String>,
    pub version: Option<String>,
    pub owner: Option<String>,
    pub state: Option<ServiceState>,
    pub queue_id: Option<String>,
    pub parent_service_id: Option<ServiceId>,
    pub root_service_id: Option<ServiceId>,
    pub processing_location: Option<ProcessingLocation>,
    /// すべてのタグを持つレコードだけにマッチ
    pub tags: Vec<String>,
}

impl ServicePattern {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn with_state(mut self, state: ServiceState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_root(mut self, root: ServiceId) -> Self {
        self.root_service_id = Some(root);
        self
    }

    pub fn with_parent(mut self, parent: ServiceId) -> Self {
        self.parent_service_id = Some(parent);
        self
    }

    pub fn with_queue(mut self, queue_id: impl Into<String>) -> Self {
        self.queue_id = Some(queue_id.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn matches(&self, record: &ServiceRecord) -> bool {
        fn eq<T: PartialEq>(want: &Option<T>, have: &Option<T>) -> bool {
            want.as_ref().is_none_or(|w| have.as_ref() == Some(w))
        }
        // 空文字列は「指定なし」
        fn eq_str(want: &Option<String>, have: Option<&str>) -> bool {
            want.as_deref().is_none_or(|w| w.is_empty() || Some(w) == have)
        }

        eq(&self.id, &record.id)
            && eq_str(&self.name, Some(&record.name))
            && eq_str(&self.version, record.version.as_deref())
            && eq_str(&self.owner, record.owner.as_deref())
            && self.state.is_none_or(|s| s == record.state)
            && eq_str(&self.queue_id, record.queue_id.as_deref())
            && eq(&self.parent_service_id, &record.parent_service_id)
            && eq(&self.root_service_id, &record.root_service_id)
            && eq(&self.processing_location, &record.processing_location)
            && self
                .tags
                .iter()
                .filter(|t| !t.is_empty())
                .all(|t| record.tags.contains(t))
    }
}

/// Claim protocol の候補読み出し条件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueFilter {
    pub queue_id: String,
    /// true: `queueId == queue_id` のレコードだけ（クラッシュ後の再取得）
    /// false: `queueId` が未設定か `queue_id` のレコード
    pub only_pre_assigned: bool,
}

impl QueueFilter {
    pub fn matches(&self, record: &ServiceRecord) -> bool {
        match record.queue_id.as_deref() {
            Some(q) => q == self.queue_id,
            None => !self.only_pre_assigned,
        }
    }
}

/// ServiceStore は ServiceRecord の正本（source of truth）
#[async_trait]
pub trait ServiceStore: Send + Sync {
    async fn find_by_id(&self, id: ServiceId) -> ServiceResult<Option<ServiceRecord>>;

    /// Results follow the order of `ids`; unknown ids are skipped.
    async fn find_by_ids(&self, ids: &[ServiceId]) -> ServiceResult<Vec<ServiceRecord>>;

    async fn find_matching(
        &self,
        pattern: &ServicePattern,
        creation_interval: DateInterval,
        page: &PageRequest,
    ) -> ServiceResult<PageResult<ServiceRecord>>;

    async fn count_matching(
        &self,
        pattern: &ServicePattern,
        creation_interval: DateInterval,
    ) -> ServiceResult<u64>;

    async fn find_by_queue_and_state(
        &self,
        filter: &QueueFilter,
        states: &[ServiceState],
        page: &PageRequest,
    ) -> ServiceResult<PageResult<ServiceRecord>>;

    /// Inserts (assigning an id when absent) or fully replaces by id.
    async fn save(&self, record: ServiceRecord) -> ServiceResult<ServiceRecord>;

    async fn save_all(&self, records: Vec<ServiceRecord>) -> ServiceResult<Vec<ServiceRecord>>;

    /// Applies `updates` atomically and stamps `modificationDate`.
    ///
    /// Fails with `NotFound` when the record does not exist.
    async fn update(&self, id: ServiceId, updates: &FieldUpdates) -> ServiceResult<ServiceRecord>;

    /// Applies `updates` only if `condition` holds, as one atomic step.
    ///
    /// `Ok(None)` means the condition failed (or the record is gone).
    async fn compare_and_update(
        &self,
        id: ServiceId,
        condition: &UpdateCondition,
        updates: &FieldUpdates,
    ) -> ServiceResult<Option<ServiceRecord>>;

    async fn delete(&self, id: ServiceId) -> ServiceResult<bool>;
}
