//! HierarchyManager - ServiceHierarchy の保存と復元
//!
//! # 保存（2 パス）
//! 1. 依存の循環チェック → id の無いノードに id を割り当てる
//! 2. 親 → 子の順にリンク（parentServiceId / rootServiceId / priority /
//!    dependenciesIds）を計算し、新規ノードは `save_all`、保存済みノードは
//!    変わったフィールドだけを `update` する
//!
//! # 復元
//! 対象 → root（rootServiceId か自分）→ rootServiceId が root のレコード全部、
//! を読み、id 順に並べてリンクし直す。

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::domain::{
    DateInterval, FieldUpdates, NodeIndex, PageRequest, RecordField, ServiceError, ServiceHierarchy,
    ServiceId, ServiceResult, SortCriteria,
};
use crate::ports::{IdGenerator, ServicePattern, ServiceStore};

pub struct HierarchyManager {
    store: Arc<dyn ServiceStore>,
    ids: Arc<dyn IdGenerator>,
}

impl HierarchyManager {
    pub fn new(store: Arc<dyn ServiceStore>, ids: Arc<dyn IdGenerator>) -> Self {
        Self { store, ids }
    }

    pub fn store(&self) -> &Arc<dyn ServiceStore> {
        &self.store
    }

    pub async fn save_hierarchy(&self, hierarchy: &mut ServiceHierarchy) -> ServiceResult<()> {
        hierarchy.check_acyclic()?;

        // pass 1: ids
        let mut new_nodes: HashSet<NodeIndex> = HashSet::new();
        for idx in hierarchy.node_indices() {
            if hierarchy.record(idx).id.is_none() {
                hierarchy.record_mut(idx).id = Some(self.ids.generate_service_id());
                new_nodes.insert(idx);
            }
        }

        // pass 2: linkage, owners first so roots and priorities cascade
        let mut pending_updates: Vec<(NodeIndex, FieldUpdates)> = Vec::new();
        for idx in hierarchy.owners_first() {
            let mut updates = FieldUpdates::new();

            if let Some(parent) = hierarchy.parent(idx) {
                let parent_record = hierarchy.record(parent).clone();
                let before = hierarchy.record(idx).clone();
                let linked = hierarchy.record_mut(idx).update_parent_service(&parent_record)?;
                let after = hierarchy.record(idx);
                if before.parent_service_id != after.parent_service_id
                    || before.root_service_id != after.root_service_id
                    || before.priority != after.priority
                {
                    updates = updates.merge(linked);
                }
            }

            let deps: Vec<ServiceId> = hierarchy
                .dependencies(idx)
                .iter()
                .map(|d| hierarchy.record(*d).require_id())
                .collect::<ServiceResult<_>>()?;
            for dep in deps {
                let added = hierarchy.record_mut(idx).add_service_dependency(dep)?;
                updates = updates.merge(added);
            }

            if !new_nodes.contains(&idx) && !updates.is_empty() {
                pending_updates.push((idx, updates));
            }
        }

        let inserts: Vec<NodeIndex> = hierarchy
            .preorder()
            .into_iter()
            .filter(|i| new_nodes.contains(i))
            .collect();
        if !inserts.is_empty() {
            let records = inserts.iter().map(|i| hierarchy.record(*i).clone()).collect();
            let saved = self.store.save_all(records).await?;
            for (idx, record) in inserts.into_iter().zip(saved) {
                *hierarchy.record_mut(idx) = record;
            }
        }

        for (idx, updates) in pending_updates {
            let id = hierarchy.record(idx).require_id()?;
            debug!(service_id = %id, fields = updates.len(), "updating hierarchy links");
            let updated = self.store.update(id, &updates).await?;
            *hierarchy.record_mut(idx) = updated;
        }
        Ok(())
    }

    /// Loads the hierarchy containing `id`, focused on `id`.
    pub async fn find_hierarchy(&self, id: ServiceId) -> ServiceResult<Option<ServiceHierarchy>> {
        let Some(target) = self.store.find_by_id(id).await? else {
            return Ok(None);
        };
        let root_id = target.root_service_id.unwrap_or(id);
        let root = if root_id == id {
            target
        } else {
            match self.store.find_by_id(root_id).await? {
                Some(root) => root,
                None => {
                    warn!(service_id = %id, root_id = %root_id, "hierarchy root is missing, rooting at the requested service");
                    target
                }
            }
        };
        let effective_root = root.require_id()?;

        let page = PageRequest::unbounded().sorted_by(SortCriteria::asc(RecordField::Id));
        let members = self
            .store
            .find_matching(
                &ServicePattern::new().with_root(root_id),
                DateInterval::any(),
                &page,
            )
            .await?
            .results
            .into_iter()
            .filter(|r| r.id != Some(effective_root))
            .collect();

        let mut hierarchy = ServiceHierarchy::relink(root, members)?;
        let focus = hierarchy
            .find_by_id(id)
            .ok_or(ServiceError::NotFound(id))?;
        hierarchy.set_focus(focus)?;
        Ok(Some(hierarchy))
    }

    /// Shifts the priority of `id` and everything it links to by the same amount.
    pub async fn update_hierarchy_priority(
        &self,
        id: ServiceId,
        new_priority: i32,
    ) -> ServiceResult<ServiceHierarchy> {
        let mut hierarchy = self
            .find_hierarchy(id)
            .await?
            .ok_or(ServiceError::NotFound(id))?;
        let focus = hierarchy.focus();
        let diff = i64::from(new_priority) - i64::from(hierarchy.record(focus).priority);
        if diff == 0 {
            return Ok(hierarchy);
        }
        for idx in hierarchy.preorder_from(focus) {
            let node_id = hierarchy.record(idx).require_id()?;
            // i32 の範囲で頭打ち
            let shifted = i64::from(hierarchy.record(idx).priority) + diff;
            let priority = shifted.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32;
            let updated = self
                .store
                .update(node_id, &FieldUpdates::new().set(RecordField::Priority, priority))
                .await?;
            *hierarchy.record_mut(idx) = updated;
        }
        Ok(hierarchy)
    }
}
