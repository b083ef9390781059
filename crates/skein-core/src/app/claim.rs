//! ClaimProtocol - 分散ロックなしで QUEUED のレコードを取り合う
//!
//! # フロー
//! 1. `state ∈ states` かつ queueId が未設定 or 自分、のレコードを 1 ページ読む
//! 2. 各候補に `compare_and_update(id, queueId 未設定 or 自分, queueId = 自分)`
//! 3. 成功したものだけを返す（負けたものは debug ログのみ）
//!
//! 空の結果は「あとで再試行」を意味する。
//!
//! `only_pre_assigned = true` はクラッシュ後の再取得用で、すでに自分の
//! queueId が付いたレコードを読むだけ（書き込みなし）。
//!
//! 取ったのに走らせられないレコードは `release` で queueId を外して返す。

use std::sync::Arc;

use tracing::debug;

use crate::domain::{
    FieldUpdates, PageRequest, RecordField, ServiceError, ServiceId, ServiceRecord,
    ServiceResult, ServiceState, UpdateCondition,
};
use crate::ports::{QueueFilter, ServiceStore};

pub struct ClaimProtocol {
    store: Arc<dyn ServiceStore>,
}

impl ClaimProtocol {
    pub fn new(store: Arc<dyn ServiceStore>) -> Self {
        Self { store }
    }

    pub async fn claim(
        &self,
        queue_id: &str,
        only_pre_assigned: bool,
        states: &[ServiceState],
        page: &PageRequest,
    ) -> ServiceResult<Vec<ServiceRecord>> {
        let queue_id = queue_id.trim();
        if queue_id.is_empty() {
            return Err(ServiceError::validation("queue id must not be blank"));
        }
        if states.is_empty() {
            return Err(ServiceError::validation("at least one state is required to claim"));
        }

        let filter = QueueFilter {
            queue_id: queue_id.to_string(),
            only_pre_assigned,
        };
        let candidates = self
            .store
            .find_by_queue_and_state(&filter, states, page)
            .await?
            .results;

        if only_pre_assigned {
            return Ok(candidates);
        }

        let condition = UpdateCondition::unset_or_equals(RecordField::QueueId, queue_id);
        let updates = FieldUpdates::new().set(RecordField::QueueId, queue_id);

        let mut claimed = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let Some(id) = candidate.id else {
                continue;
            };
            match self.store.compare_and_update(id, &condition, &updates).await? {
                Some(record) => claimed.push(record),
                None => debug!(service_id = %id, queue_id, "claim lost to another queue"),
            }
        }
        Ok(claimed)
    }

    /// Gives a record claimed by `queue_id` back to every queue.
    ///
    /// Returns `false` when another queue holds it.
    pub async fn release(&self, queue_id: &str, id: ServiceId) -> ServiceResult<bool> {
        let queue_id = queue_id.trim();
        if queue_id.is_empty() {
            return Err(ServiceError::validation("queue id must not be blank"));
        }
        let condition = UpdateCondition::unset_or_equals(RecordField::QueueId, queue_id);
        let updates = FieldUpdates::new().unset(RecordField::QueueId);
        let released = self.store.compare_and_update(id, &condition, &updates).await?;
        if released.is_some() {
            debug!(service_id = %id, queue_id, "claim released");
        }
        Ok(released.is_some())
    }
}
