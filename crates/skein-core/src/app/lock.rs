//! AdvisoryLock - lockKey によるリソースの排他
//!
//! claim と同じ `compare_and_update` を使う：
//! - `try_lock`: lockKey が未設定 or 自分のキー → lockKey と lockTimestamp を書く
//! - `unlock`: lockKey が自分のキー → 両方を unset
//!
//! 強制はしない（advisory）。ロックを尊重するかどうかは呼び出し側次第。

use std::sync::Arc;

use tracing::debug;

use crate::domain::record::to_json;
use crate::domain::{
    FieldUpdates, RecordField, ServiceError, ServiceId, ServiceRecord, ServiceResult,
    UpdateCondition,
};
use crate::ports::{Clock, ServiceStore};

pub struct AdvisoryLock {
    store: Arc<dyn ServiceStore>,
    clock: Arc<dyn Clock>,
}

impl AdvisoryLock {
    pub fn new(store: Arc<dyn ServiceStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// `Ok(None)` when someone else holds the lock. Re-locking with the same key refreshes it.
    pub async fn try_lock(
        &self,
        target: ServiceId,
        key: &str,
    ) -> ServiceResult<Option<ServiceRecord>> {
        let key = Self::checked_key(key)?;
        let condition = UpdateCondition::unset_or_equals(RecordField::LockKey, key);
        let updates = FieldUpdates::new()
            .set(RecordField::LockKey, key)
            .set(RecordField::LockTimestamp, to_json(&self.clock.now())?);

        let locked = self.store.compare_and_update(target, &condition, &updates).await?;
        if locked.is_none() {
            debug!(service_id = %target, lock_key = key, "lock is held elsewhere");
        }
        Ok(locked)
    }

    /// Releases a lock held under `key`. Returns whether anything was released.
    pub async fn unlock(&self, target: ServiceId, key: &str) -> ServiceResult<bool> {
        let key = Self::checked_key(key)?;
        let Some(current) = self.store.find_by_id(target).await? else {
            return Err(ServiceError::NotFound(target));
        };
        if current.lock_key.as_deref() != Some(key) {
            return Ok(false);
        }
        // unset-or-equals: between the read and here the holder can only
        // release it, never hand it to another key without us noticing
        let condition = UpdateCondition::unset_or_equals(RecordField::LockKey, key);
        let updates = FieldUpdates::new()
            .unset(RecordField::LockKey)
            .unset(RecordField::LockTimestamp);
        Ok(self
            .store
            .compare_and_update(target, &condition, &updates)
            .await?
            .is_some())
    }

    fn checked_key(key: &str) -> ServiceResult<&str> {
        let key = key.trim();
        if key.is_empty() {
            Err(ServiceError::validation("lock key must not be blank"))
        } else {
            Ok(key)
        }
    }
}
