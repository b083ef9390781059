//! Archiver - 完了した hierarchy を archive store に移す
//!
//! archive store は active store と同じ document 形の別インスタンス。
//! 1 レコードごとに「archive に保存 → active から削除」の順で動くので、
//! 途中で落ちても両方にある状態にはなりうるが、どちらにも無い状態にはならない。
//! レコードの state はそのまま残す。

use std::sync::Arc;

use tracing::{debug, info};

use crate::app::hierarchy::HierarchyManager;
use crate::domain::{ServiceError, ServiceHierarchy, ServiceId, ServiceRecord, ServiceResult};
use crate::ports::{IdGenerator, ServiceStore};

pub struct Archiver {
    active: HierarchyManager,
    archive: HierarchyManager,
}

impl Archiver {
    pub fn new(
        active: Arc<dyn ServiceStore>,
        archive: Arc<dyn ServiceStore>,
        ids: Arc<dyn IdGenerator>,
    ) -> Self {
        Self {
            active: HierarchyManager::new(active, ids.clone()),
            archive: HierarchyManager::new(archive, ids),
        }
    }

    pub async fn archive(&self, record: ServiceRecord) -> ServiceResult<ServiceRecord> {
        let id = record.require_id()?;
        let archived = self.archive.store().save(record).await?;
        self.active.store().delete(id).await?;
        debug!(service_id = %id, "service archived");
        Ok(archived)
    }

    /// Moves every record of the hierarchy containing `id`. Returns how many moved.
    pub async fn archive_hierarchy(&self, id: ServiceId) -> ServiceResult<usize> {
        let hierarchy = self
            .active
            .find_hierarchy(id)
            .await?
            .ok_or(ServiceError::NotFound(id))?;
        let records: Vec<ServiceRecord> = hierarchy.iter_preorder().cloned().collect();
        let moved = records.len();
        for record in records {
            self.archive(record).await?;
        }
        info!(service_id = %id, moved, "hierarchy archived");
        Ok(moved)
    }

    pub async fn find_archived_hierarchy(
        &self,
        id: ServiceId,
    ) -> ServiceResult<Option<ServiceHierarchy>> {
        self.archive.find_hierarchy(id).await
    }
}
