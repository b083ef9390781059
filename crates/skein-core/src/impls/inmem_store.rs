//! InMemoryServiceStore - 開発用・テスト用の document store
//!
//! # 実装詳細
//! - レコードは camelCase の JSON document として保持（本番の document store と同じ形）
//! - `tokio::sync::Mutex` 1 本で排他制御するので、1 回の操作は常にアトミック
//! - `FieldUpdates` は document に直接適用する
//!
//! # 使用例
//! ```ignore
//! let store = InMemoryServiceStore::new(clock, ids);
//! let saved = store.save(ServiceRecord::new("sleep")).await?;
//! ```

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use crate::domain::record::to_json;
use crate::domain::{
    DateInterval, FieldUpdates, PageRequest, PageResult, RecordField, ServiceError, ServiceId,
    ServiceRecord, ServiceResult, ServiceState, SortCriteria, SortDirection, UpdateCondition,
};
use crate::ports::{Clock, IdGenerator, QueueFilter, ServicePattern, ServiceStore};

type Document = Map<String, Value>;

pub struct InMemoryServiceStore {
    /// id → document（BTreeMap なので id 順に並ぶ）
    docs: Mutex<BTreeMap<ServiceId, Document>>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    /// 残り何回の操作を Storage エラーにするか（障害注入）
    failures: AtomicUsize,
}

impl InMemoryServiceStore {
    pub fn new(clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>) -> Self {
        Self {
            docs: Mutex::new(BTreeMap::new()),
            clock,
            ids,
            failures: AtomicUsize::new(0),
        }
    }

    /// The next `count` store operations fail with `ServiceError::Storage`.
    pub fn inject_failures(&self, count: usize) {
        self.failures.store(count, AtomicOrdering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.docs.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.docs.lock().await.is_empty()
    }

    /// Raw stored document, for assertions on the persisted shape.
    pub async fn document(&self, id: ServiceId) -> Option<Document> {
        self.docs.lock().await.get(&id).cloned()
    }

    fn check_available(&self) -> ServiceResult<()> {
        let consumed = self
            .failures
            .fetch_update(AtomicOrdering::SeqCst, AtomicOrdering::SeqCst, |n| {
                n.checked_sub(1)
            })
            .is_ok();
        if consumed {
            Err(ServiceError::storage("injected store failure"))
        } else {
            Ok(())
        }
    }

    fn stamp(&self, updates: &FieldUpdates) -> ServiceResult<FieldUpdates> {
        let now = to_json(&self.clock.now())?;
        Ok(updates
            .clone()
            .set(RecordField::ModificationDate, now))
    }

    fn prepare_insert(&self, mut record: ServiceRecord) -> ServiceResult<(ServiceId, Document)> {
        let id = match record.id {
            Some(id) => id,
            None => {
                let id = self.ids.generate_service_id();
                record.id = Some(id);
                id
            }
        };
        let now = self.clock.now();
        if record.creation_date.is_none() {
            record.creation_date = Some(now);
        }
        record.modification_date = Some(now);
        Ok((id, record.to_document()?))
    }

    fn decode_all<'a>(docs: impl Iterator<Item = &'a Document>) -> ServiceResult<Vec<ServiceRecord>> {
        docs.map(|d| ServiceRecord::from_document(d.clone()))
            .collect()
    }
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(x), Some(y)) => x.to_string().cmp(&y.to_string()),
    }
}

fn sort_documents(docs: &mut [(ServiceId, &Document)], sort: &[SortCriteria]) {
    docs.sort_by(|(ia, a), (ib, b)| {
        for criteria in sort {
            let key = criteria.field.as_str();
            let ord = compare_values(a.get(key), b.get(key));
            let ord = match criteria.direction {
                SortDirection::Asc => ord,
                SortDirection::Desc => ord.reverse(),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        ia.cmp(ib)
    });
}

#[async_trait]
impl ServiceStore for InMemoryServiceStore {
    async fn find_by_id(&self, id: ServiceId) -> ServiceResult<Option<ServiceRecord>> {
        self.check_available()?;
        let docs = self.docs.lock().await;
        docs.get(&id)
            .map(|d| ServiceRecord::from_document(d.clone()))
            .transpose()
    }

    async fn find_by_ids(&self, ids: &[ServiceId]) -> ServiceResult<Vec<ServiceRecord>> {
        self.check_available()?;
        let docs = self.docs.lock().await;
        Self::decode_all(ids.iter().filter_map(|id| docs.get(id)))
    }

    async fn find_matching(
        &self,
        pattern: &ServicePattern,
        creation_interval: DateInterval,
        page: &PageRequest,
    ) -> ServiceResult<PageResult<ServiceRecord>> {
        self.check_available()?;
        let docs = self.docs.lock().await;
        let mut matching = Vec::new();
        for (id, doc) in docs.iter() {
            let record = ServiceRecord::from_document(doc.clone())?;
            if pattern.matches(&record) && creation_interval.contains(record.creation_date) {
                matching.push((*id, doc));
            }
        }
        sort_documents(&mut matching, &page.sort);
        let window = page.window(matching);
        Ok(PageResult {
            page: page.clone(),
            results: Self::decode_all(window.into_iter().map(|(_, d)| d))?,
        })
    }

    async fn count_matching(
        &self,
        pattern: &ServicePattern,
        creation_interval: DateInterval,
    ) -> ServiceResult<u64> {
        self.check_available()?;
        let docs = self.docs.lock().await;
        let mut count = 0;
        for doc in docs.values() {
            let record = ServiceRecord::from_document(doc.clone())?;
            if pattern.matches(&record) && creation_interval.contains(record.creation_date) {
                count += 1;
            }
        }
        Ok(count)
    }

    async fn find_by_queue_and_state(
        &self,
        filter: &QueueFilter,
        states: &[ServiceState],
        page: &PageRequest,
    ) -> ServiceResult<PageResult<ServiceRecord>> {
        self.check_available()?;
        let docs = self.docs.lock().await;
        let mut matching = Vec::new();
        for (id, doc) in docs.iter() {
            let record = ServiceRecord::from_document(doc.clone())?;
            if states.contains(&record.state) && filter.matches(&record) {
                matching.push((*id, doc));
            }
        }
        // 指定が無ければ priority の高い順
        let default_sort = [SortCriteria::desc(RecordField::Priority)];
        let sort = if page.sort.is_empty() {
            &default_sort[..]
        } else {
            &page.sort[..]
        };
        sort_documents(&mut matching, sort);
        let window = page.window(matching);
        Ok(PageResult {
            page: page.clone(),
            results: Self::decode_all(window.into_iter().map(|(_, d)| d))?,
        })
    }

    async fn save(&self, record: ServiceRecord) -> ServiceResult<ServiceRecord> {
        self.check_available()?;
        let (id, doc) = self.prepare_insert(record)?;
        let saved = ServiceRecord::from_document(doc.clone())?;
        self.docs.lock().await.insert(id, doc);
        Ok(saved)
    }

    async fn save_all(&self, records: Vec<ServiceRecord>) -> ServiceResult<Vec<ServiceRecord>> {
        self.check_available()?;
        let prepared = records
            .into_iter()
            .map(|r| self.prepare_insert(r))
            .collect::<ServiceResult<Vec<_>>>()?;

        let mut docs = self.docs.lock().await;
        let mut saved = Vec::with_capacity(prepared.len());
        for (id, doc) in prepared {
            saved.push(ServiceRecord::from_document(doc.clone())?);
            docs.insert(id, doc);
        }
        Ok(saved)
    }

    async fn update(&self, id: ServiceId, updates: &FieldUpdates) -> ServiceResult<ServiceRecord> {
        self.check_available()?;
        let stamped = self.stamp(updates)?;
        let mut docs = self.docs.lock().await;
        let doc = docs.get_mut(&id).ok_or(ServiceError::NotFound(id))?;
        let mut next = doc.clone();
        stamped.apply(&mut next)?;
        let record = ServiceRecord::from_document(next.clone())?;
        *doc = next;
        Ok(record)
    }

    async fn compare_and_update(
        &self,
        id: ServiceId,
        condition: &UpdateCondition,
        updates: &FieldUpdates,
    ) -> ServiceResult<Option<ServiceRecord>> {
        self.check_available()?;
        let stamped = self.stamp(updates)?;
        let mut docs = self.docs.lock().await;
        let Some(doc) = docs.get_mut(&id) else {
            return Ok(None);
        };
        if !condition.holds(doc) {
            return Ok(None);
        }
        let mut next = doc.clone();
        stamped.apply(&mut next)?;
        let record = ServiceRecord::from_document(next.clone())?;
        *doc = next;
        Ok(Some(record))
    }

    async fn delete(&self, id: ServiceId) -> ServiceResult<bool> {
        self.check_available()?;
        Ok(self.docs.lock().await.remove(&id).is_some())
    }
}
