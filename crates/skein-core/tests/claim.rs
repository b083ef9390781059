//! Claim protocol against a shared store: exclusivity, idempotence, contention.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use skein_core::app::ClaimProtocol;
use skein_core::domain::{
    DateInterval, FieldUpdates, PageRequest, PageResult, RecordField, ServiceId, ServiceRecord,
    ServiceResult, ServiceState, UpdateCondition,
};
use skein_core::impls::InMemoryServiceStore;
use skein_core::ports::{
    Clock, IdGenerator, QueueFilter, ServicePattern, ServiceStore, SystemClock, UlidGenerator,
};

fn store() -> Arc<InMemoryServiceStore> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let ids: Arc<dyn IdGenerator> = Arc::new(UlidGenerator::new(SystemClock));
    Arc::new(InMemoryServiceStore::new(clock, ids))
}

async fn queue_records(store: &InMemoryServiceStore, n: usize) -> Vec<ServiceId> {
    let mut ids = Vec::with_capacity(n);
    for i in 0..n {
        let mut record = ServiceRecord::new("sleep").with_arg(i.to_string());
        record.state = ServiceState::Queued;
        ids.push(store.save(record).await.unwrap().id.unwrap());
    }
    ids
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_workers_never_claim_the_same_record() {
    let store = store();
    let ids = queue_records(&store, 50).await;

    let mut joins = Vec::new();
    for worker in 0..5 {
        let protocol = ClaimProtocol::new(store.clone());
        joins.push(tokio::spawn(async move {
            let queue = format!("worker-{worker}");
            let mut mine = Vec::new();
            loop {
                let claimed = protocol
                    .claim(&queue, false, &[ServiceState::Queued], &PageRequest::unbounded())
                    .await
                    .unwrap();
                // records already ours come back too; keep only new ones
                let fresh: Vec<_> = claimed
                    .into_iter()
                    .filter_map(|r| r.id)
                    .filter(|id| !mine.contains(id))
                    .collect();
                if fresh.is_empty() {
                    break;
                }
                mine.extend(fresh);
                tokio::task::yield_now().await;
            }
            (queue, mine)
        }));
    }

    let mut seen = HashSet::new();
    for join in joins {
        let (queue, mine) = join.await.unwrap();
        for id in mine {
            assert!(seen.insert(id), "{id} claimed twice");
            let record = store.find_by_id(id).await.unwrap().unwrap();
            assert_eq!(record.queue_id.as_deref(), Some(queue.as_str()));
        }
    }
    assert_eq!(seen, ids.into_iter().collect::<HashSet<_>>());
}

#[tokio::test]
async fn claiming_twice_returns_the_same_records() {
    let store = store();
    queue_records(&store, 3).await;
    let protocol = ClaimProtocol::new(store.clone());
    let page = PageRequest::unbounded();

    let first = protocol
        .claim("q1", false, &[ServiceState::Queued], &page)
        .await
        .unwrap();
    let second = protocol
        .claim("q1", false, &[ServiceState::Queued], &page)
        .await
        .unwrap();
    let refetch = protocol
        .claim("q1", true, &[ServiceState::Queued], &page)
        .await
        .unwrap();

    let ids = |records: &[ServiceRecord]| records.iter().map(|r| r.id).collect::<HashSet<_>>();
    assert_eq!(first.len(), 3);
    assert_eq!(ids(&first), ids(&second));
    assert_eq!(ids(&first), ids(&refetch));

    let other = protocol
        .claim("q2", false, &[ServiceState::Queued], &page)
        .await
        .unwrap();
    assert!(other.is_empty());
}

/// Hands every candidate to another queue between the read and the conditional write.
struct RacingStore {
    inner: Arc<InMemoryServiceStore>,
    intruder: &'static str,
    armed: AtomicBool,
}

#[async_trait]
impl ServiceStore for RacingStore {
    async fn find_by_id(&self, id: ServiceId) -> ServiceResult<Option<ServiceRecord>> {
        self.inner.find_by_id(id).await
    }

    async fn find_by_ids(&self, ids: &[ServiceId]) -> ServiceResult<Vec<ServiceRecord>> {
        self.inner.find_by_ids(ids).await
    }

    async fn find_matching(
        &self,
        pattern: &ServicePattern,
        creation_interval: DateInterval,
        page: &PageRequest,
    ) -> ServiceResult<PageResult<ServiceRecord>> {
        self.inner.find_matching(pattern, creation_interval, page).await
    }

    async fn count_matching(
        &self,
        pattern: &ServicePattern,
        creation_interval: DateInterval,
    ) -> ServiceResult<u64> {
        self.inner.count_matching(pattern, creation_interval).await
    }

    async fn find_by_queue_and_state(
        &self,
        filter: &QueueFilter,
        states: &[ServiceState],
        page: &PageRequest,
    ) -> ServiceResult<PageResult<ServiceRecord>> {
        self.inner.find_by_queue_and_state(filter, states, page).await
    }

    async fn save(&self, record: ServiceRecord) -> ServiceResult<ServiceRecord> {
        self.inner.save(record).await
    }

    async fn save_all(&self, records: Vec<ServiceRecord>) -> ServiceResult<Vec<ServiceRecord>> {
        self.inner.save_all(records).await
    }

    async fn update(&self, id: ServiceId, updates: &FieldUpdates) -> ServiceResult<ServiceRecord> {
        self.inner.update(id, updates).await
    }

    async fn compare_and_update(
        &self,
        id: ServiceId,
        condition: &UpdateCondition,
        updates: &FieldUpdates,
    ) -> ServiceResult<Option<ServiceRecord>> {
        if self.armed.load(Ordering::SeqCst) {
            self.inner
                .update(id, &FieldUpdates::new().set(RecordField::QueueId, self.intruder))
                .await?;
        }
        self.inner.compare_and_update(id, condition, updates).await
    }

    async fn delete(&self, id: ServiceId) -> ServiceResult<bool> {
        self.inner.delete(id).await
    }
}

#[tokio::test]
async fn losing_every_race_claims_nothing() {
    let inner = store();
    let ids = queue_records(&inner, 4).await;
    let racing = Arc::new(RacingStore {
        inner: inner.clone(),
        intruder: "intruder",
        armed: AtomicBool::new(true),
    });
    let protocol = ClaimProtocol::new(racing.clone());

    let claimed = protocol
        .claim("q1", false, &[ServiceState::Queued], &PageRequest::unbounded())
        .await
        .unwrap();
    assert!(claimed.is_empty());
    for id in &ids {
        let record = inner.find_by_id(*id).await.unwrap().unwrap();
        assert_eq!(record.queue_id.as_deref(), Some("intruder"));
    }

    // once the race stops, q1 still cannot take records owned elsewhere
    racing.armed.store(false, Ordering::SeqCst);
    let claimed = protocol
        .claim("q1", false, &[ServiceState::Queued], &PageRequest::unbounded())
        .await
        .unwrap();
    assert!(claimed.is_empty());
}
