//! Hierarchies persisted per record and rebuilt from flat storage, then archived.

use std::sync::Arc;

use skein_core::app::{Archiver, HierarchyManager};
use skein_core::domain::{ServiceError, ServiceHierarchy, ServiceRecord, ServiceState};
use skein_core::impls::InMemoryServiceStore;
use skein_core::ports::{Clock, IdGenerator, ServiceStore, SystemClock, UlidGenerator};

struct Stores {
    active: Arc<InMemoryServiceStore>,
    archive: Arc<InMemoryServiceStore>,
    ids: Arc<dyn IdGenerator>,
}

fn stores() -> Stores {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let ids: Arc<dyn IdGenerator> = Arc::new(UlidGenerator::new(SystemClock));
    Stores {
        active: Arc::new(InMemoryServiceStore::new(clock.clone(), ids.clone())),
        archive: Arc::new(InMemoryServiceStore::new(clock, ids.clone())),
        ids,
    }
}

/// pipeline
/// ├── align  (depends on fetch)
/// │   └── index
/// └── fetch
fn pipeline() -> ServiceHierarchy {
    let mut h = ServiceHierarchy::new(ServiceRecord::new("pipeline"));
    let root = h.root();
    let align = h.add_child(root, ServiceRecord::new("align")).unwrap();
    h.add_child(align, ServiceRecord::new("index")).unwrap();
    let fetch = h.add_child(root, ServiceRecord::new("fetch")).unwrap();
    h.add_dependency(align, fetch).unwrap();
    h.add_dependency(root, align).unwrap();
    h
}

fn names(h: &ServiceHierarchy) -> Vec<String> {
    h.iter_preorder().map(|r| r.name.clone()).collect()
}

#[tokio::test]
async fn any_member_rebuilds_the_whole_hierarchy() {
    let s = stores();
    let manager = HierarchyManager::new(s.active.clone(), s.ids.clone());
    let mut h = pipeline();
    manager.save_hierarchy(&mut h).await.unwrap();

    let root_id = h.record(h.root()).id.unwrap();
    for member in h.iter_preorder() {
        let id = member.id.unwrap();
        let loaded = manager.find_hierarchy(id).await.unwrap().unwrap();
        assert_eq!(names(&loaded), names(&h));
        assert_eq!(loaded.focused_record().id, Some(id));
        assert_eq!(loaded.record(loaded.root()).id, Some(root_id));
    }

    let stored_align = s
        .active
        .find_matching(
            &skein_core::ports::ServicePattern::new().with_name("align"),
            skein_core::domain::DateInterval::any(),
            &skein_core::domain::PageRequest::unbounded(),
        )
        .await
        .unwrap()
        .results
        .remove(0);
    let fetch_id = h.iter_preorder().find(|r| r.name == "fetch").unwrap().id.unwrap();
    assert_eq!(stored_align.dependencies_ids, vec![fetch_id]);
    assert_eq!(stored_align.root_service_id, Some(root_id));
}

#[tokio::test]
async fn hierarchy_with_cycle_is_never_persisted() {
    let s = stores();
    let manager = HierarchyManager::new(s.active.clone(), s.ids.clone());
    let mut h = pipeline();
    let fetch = h.children(h.root())[1];
    let align = h.children(h.root())[0];
    h.add_dependency(fetch, align).unwrap();

    assert!(matches!(
        manager.save_hierarchy(&mut h).await,
        Err(ServiceError::DependencyCycle(_))
    ));
    assert!(s.active.is_empty().await);
}

#[tokio::test]
async fn archived_hierarchy_round_trips() {
    let s = stores();
    let manager = HierarchyManager::new(s.active.clone(), s.ids.clone());
    let mut h = pipeline();
    for idx in h.node_indices() {
        h.record_mut(idx).state = ServiceState::Successful;
    }
    manager.save_hierarchy(&mut h).await.unwrap();
    let index_id = h.iter_preorder().find(|r| r.name == "index").unwrap().id.unwrap();

    let archiver = Archiver::new(s.active.clone(), s.archive.clone(), s.ids.clone());
    assert_eq!(archiver.archive_hierarchy(index_id).await.unwrap(), 4);

    assert!(s.active.is_empty().await);
    assert!(manager.find_hierarchy(index_id).await.unwrap().is_none());

    let restored = archiver
        .find_archived_hierarchy(index_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(names(&restored), names(&h));
    assert_eq!(restored.focused_record().name, "index");
    assert!(restored
        .iter_preorder()
        .all(|r| r.state == ServiceState::Successful));
    let original: Vec<_> = h.iter_preorder().map(|r| (r.id, r.parent_service_id)).collect();
    let archived: Vec<_> = restored
        .iter_preorder()
        .map(|r| (r.id, r.parent_service_id))
        .collect();
    assert_eq!(original, archived);
}
