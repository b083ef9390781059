//! ServiceEngine - レコードの状態機械を動かす中心
//!
//! グローバルな manager は持たない。store / registry / throttle / 通知先 /
//! id 生成 / 時計をすべて抱えた engine を `EngineBuilder` で作り、明示的に渡す。
//!
//! # run のフロー
//! 1. claim 済みか確認（QUEUED + queueId、または再開時の RUNNING）
//! 2. 宣言済み依存（dependenciesIds）を確認
//!    - ERROR / CANCELED がある → DEPENDENCY_FAILURE で ERROR
//!    - 未完了がある → QUEUED のまま `Pending`
//! 3. QUEUED → RUNNING（stage `start` を通知）
//! 4. `submit_dependencies` の子サービスを保存して QUEUED にする
//! 5. 依存がすべて終わるまで待つ（future の未完了として待つ）
//!    待っている間にキャンセルされたらそこで止まる
//! 6. throttle に admit → `process` → `is_result_ready` まで待つ
//! 7. `check_for_errors` → `collect_result`
//! 8. 結果を保存して RUNNING → SUCCESSFUL（stage `successful`）
//!
//! 失敗は event + ERROR（stage `failed`）。Storage / Contention は呼び出し元に返す。
//!
//! # 状態の書き込み
//! 状態遷移はすべて `state` を条件にした `compare_and_update`。
//! 負けたら読み直して同じ遷移をやり直すので、キャンセルと完了が競合しても
//! 先に書いた方だけが残る。

use std::collections::BTreeSet;
use std::future::IntoFuture;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::app::computation::Computation;
use crate::app::config::{EngineConfig, SLOTS_RESOURCE};
use crate::app::hierarchy::HierarchyManager;
use crate::app::processor::{ResolvedDependencies, ServiceProcessor};
use crate::app::registry::ProcessorRegistry;
use crate::app::throttle::ResourceThrottle;
use crate::domain::{
    DateInterval, ErrorKind, EventType, FieldUpdates, LifecycleStage, Notification, PageRequest,
    RecordField, ServiceError, ServiceHierarchy, ServiceId, ServiceRecord, ServiceResult,
    ServiceState, SortCriteria, UpdateCondition,
};
use crate::ports::{Clock, IdGenerator, NotificationSink, ServicePattern, ServiceStore};

/// 状態の compare-and-set を何回までやり直すか
const MAX_STATE_ATTEMPTS: usize = 3;

/// RunOutcome は `run` 1 回分の結果
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed(ServiceRecord),
    Failed(ServiceRecord),
    /// 宣言済み依存が未完了。QUEUED のまま残る
    Pending,
    Canceled,
}

/// EngineStats は `stats()` のスナップショット
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStats {
    /// QUEUED のサービス数
    pub waiting: u64,
    /// RUNNING のサービス数
    pub running: u64,
    pub slots_available: Option<usize>,
    pub slots_capacity: Option<u32>,
}

pub struct ServiceEngine {
    store: Arc<dyn ServiceStore>,
    registry: Arc<ProcessorRegistry>,
    throttle: Arc<ResourceThrottle>,
    notifications: Arc<dyn NotificationSink>,
    clock: Arc<dyn Clock>,
    hierarchy: HierarchyManager,
    config: EngineConfig,
}

impl ServiceEngine {
    pub(crate) fn from_parts(
        store: Arc<dyn ServiceStore>,
        registry: ProcessorRegistry,
        throttle: ResourceThrottle,
        notifications: Arc<dyn NotificationSink>,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        Self {
            hierarchy: HierarchyManager::new(store.clone(), ids),
            store,
            registry: Arc::new(registry),
            throttle: Arc::new(throttle),
            notifications,
            clock,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn ServiceStore> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &ProcessorRegistry {
        &self.registry
    }

    pub fn throttle(&self) -> &ResourceThrottle {
        &self.throttle
    }

    pub fn hierarchy(&self) -> &HierarchyManager {
        &self.hierarchy
    }

    pub async fn find(&self, id: ServiceId) -> ServiceResult<Option<ServiceRecord>> {
        self.store.find_by_id(id).await
    }

    /// Waiting / running counts across all queues plus local slot usage.
    pub async fn stats(&self) -> ServiceResult<EngineStats> {
        let waiting = ServicePattern::new().with_state(ServiceState::Queued);
        let running = ServicePattern::new().with_state(ServiceState::Running);
        Ok(EngineStats {
            waiting: self.store.count_matching(&waiting, DateInterval::any()).await?,
            running: self.store.count_matching(&running, DateInterval::any()).await?,
            slots_available: self.throttle.available(SLOTS_RESOURCE),
            slots_capacity: self.throttle.capacity(SLOTS_RESOURCE),
        })
    }

    /// Resizes the processing slots without restarting.
    pub async fn set_processing_slots(&self, slots: u32) -> ServiceResult<()> {
        self.throttle.set_capacity(SLOTS_RESOURCE, slots).await?;
        info!(slots, "processing slots changed");
        Ok(())
    }

    // ========================================
    // Submission
    // ========================================

    /// Prepares a new record with its processor and persists it as QUEUED.
    ///
    /// Nothing is written when preparation fails.
    pub async fn submit(&self, record: ServiceRecord) -> ServiceResult<ServiceRecord> {
        let queued = self.prepare_queued(record, self.clock.now()).await?;
        let saved = self.store.save(queued).await?;
        info!(service_id = ?saved.id, name = %saved.name, "service submitted");
        Ok(saved)
    }

    /// Prepares every unsaved node and persists the hierarchy in one pass.
    pub async fn submit_hierarchy(&self, hierarchy: &mut ServiceHierarchy) -> ServiceResult<()> {
        hierarchy.check_acyclic()?;
        let now = self.clock.now();
        for idx in hierarchy.node_indices() {
            if hierarchy.record(idx).id.is_some() {
                continue;
            }
            let prepared = self.prepare_queued(hierarchy.record(idx).clone(), now).await?;
            *hierarchy.record_mut(idx) = prepared;
        }
        self.hierarchy.save_hierarchy(hierarchy).await?;
        info!(
            root = ?hierarchy.record(hierarchy.root()).id,
            services = hierarchy.len(),
            "hierarchy submitted"
        );
        Ok(())
    }

    async fn prepare_queued(
        &self,
        record: ServiceRecord,
        now: DateTime<Utc>,
    ) -> ServiceResult<ServiceRecord> {
        if record.state != ServiceState::Created {
            return Err(ServiceError::validation(format!(
                "service '{}' is {}, only {} services can be submitted",
                record.name,
                record.state,
                ServiceState::Created
            )));
        }
        let processor = self.registry.for_record(&record)?;
        let mut prepared = processor.prepare(record).await?;
        prepared.update_state(ServiceState::Queued, now)?;
        Ok(prepared)
    }

    // ========================================
    // Explicit transitions
    // ========================================

    pub async fn transition(&self, id: ServiceId, next: ServiceState) -> ServiceResult<ServiceRecord> {
        self.change_state(id, |record, now| record.update_state(next, now))
            .await
    }

    /// Cancels `id` and every unfinished service it owns.
    pub async fn cancel(&self, id: ServiceId) -> ServiceResult<ServiceRecord> {
        let canceled = self.change_state(id, cancel_updates).await?;

        if let Some(hierarchy) = self.hierarchy.find_hierarchy(id).await? {
            let mut stack: Vec<_> = hierarchy.children(hierarchy.focus()).to_vec();
            while let Some(idx) = stack.pop() {
                stack.extend_from_slice(hierarchy.children(idx));
                let child = hierarchy.record(idx);
                if !matches!(child.state, ServiceState::Queued | ServiceState::Running) {
                    continue;
                }
                let child_id = child.require_id()?;
                match self.change_state(child_id, cancel_updates).await {
                    Ok(_) => {}
                    Err(ServiceError::InvalidTransition { from, .. }) => {
                        debug!(service_id = %child_id, state = %from, "sub-service finished before cancel");
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(canceled)
    }

    /// RUNNING → QUEUED, releasing the queue so any worker can pick it up again.
    pub async fn restart(&self, id: ServiceId) -> ServiceResult<ServiceRecord> {
        self.change_state(id, |record, now| {
            let updates = record
                .restart_state(now)?
                .merge(record.add_event(EventType::Restarted, "Service restarted", now)?);
            record.queue_id = None;
            Ok(updates.unset(RecordField::QueueId))
        })
        .await
    }

    pub async fn retire(&self, id: ServiceId) -> ServiceResult<ServiceRecord> {
        self.transition(id, ServiceState::Retired).await
    }

    /// Applies a state change with a compare-and-set on the current state.
    async fn change_state<F>(&self, id: ServiceId, mut change: F) -> ServiceResult<ServiceRecord>
    where
        F: FnMut(&mut ServiceRecord, DateTime<Utc>) -> ServiceResult<FieldUpdates>,
    {
        for attempt in 1..=MAX_STATE_ATTEMPTS {
            let mut record = self
                .store
                .find_by_id(id)
                .await?
                .ok_or(ServiceError::NotFound(id))?;
            let from = record.state;
            let updates = change(&mut record, self.clock.now())?;
            if from == ServiceState::Queued && started(record.state) && record.queue_id.is_none() {
                return Err(ServiceError::validation(format!(
                    "{id} has not been claimed by any queue"
                )));
            }
            let condition = UpdateCondition::unset_or_equals(RecordField::State, from.as_str());

            match self.store.compare_and_update(id, &condition, &updates).await? {
                Some(updated) => {
                    if updated.state != from {
                        info!(service_id = %id, from = %from, to = %updated.state, "state changed");
                        self.notify_stages(from, &updated).await;
                    }
                    return Ok(updated);
                }
                None => debug!(service_id = %id, attempt, "state changed underneath, retrying"),
            }
        }
        Err(ServiceError::StoreContention(id))
    }

    /// Notifies every stage entered between `from` and `record.state`.
    ///
    /// A QUEUED record failed in a single write still passed through RUNNING,
    /// so `start` goes out before `failed`.
    async fn notify_stages(&self, from: ServiceState, record: &ServiceRecord) {
        let Some(service_id) = record.id else {
            return;
        };
        let mut stages = Vec::with_capacity(2);
        if from == ServiceState::Queued && started(record.state) {
            stages.push(LifecycleStage::Start);
        }
        match record.state {
            ServiceState::Successful => stages.push(LifecycleStage::Successful),
            ServiceState::Error => stages.push(LifecycleStage::Failed),
            _ => {}
        }

        for stage in stages {
            for registration in record.processing_stage_notifications.values() {
                if !registration.stages.matches(stage) {
                    continue;
                }
                self.notifications
                    .notify(Notification {
                        service_id,
                        event_name: registration.event_name.clone(),
                        stage,
                        data: registration.data.clone(),
                        timestamp: self.clock.now(),
                    })
                    .await;
            }
        }
    }

    // ========================================
    // Execution
    // ========================================

    /// Drives one claimed record as far as it can go.
    ///
    /// Storage failures and lost state races are returned so the caller can
    /// retry; every other failure ends the record in ERROR.
    pub async fn run(&self, id: ServiceId) -> ServiceResult<RunOutcome> {
        let record = self
            .store
            .find_by_id(id)
            .await?
            .ok_or(ServiceError::NotFound(id))?;
        match record.state {
            ServiceState::Queued if record.queue_id.is_none() => {
                return Err(ServiceError::validation(format!(
                    "{id} has not been claimed by any queue"
                )));
            }
            ServiceState::Queued | ServiceState::Running => {}
            ServiceState::Canceled => return Ok(RunOutcome::Canceled),
            other => {
                return Err(ServiceError::InvalidTransition {
                    from: other,
                    to: ServiceState::Running,
                });
            }
        }

        match self.execute(record).await {
            Ok(outcome) => Ok(outcome),
            Err(e) if is_canceled(&e) => {
                info!(service_id = %id, "run stopped, service was canceled");
                Ok(RunOutcome::Canceled)
            }
            Err(e) if is_retried_by_caller(&e) => Err(e),
            Err(e) => self.fail(id, e).await,
        }
    }

    async fn execute(&self, record: ServiceRecord) -> ServiceResult<RunOutcome> {
        let id = record.require_id()?;
        let processor = self.registry.for_record(&record)?;
        let resumed = record.state == ServiceState::Running;

        let mut record = record;
        if !resumed {
            match dependency_status(self.store.as_ref(), &record.dependencies_ids).await? {
                DependencyStatus::Waiting => {
                    debug!(service_id = %id, "declared dependencies still running");
                    return Ok(RunOutcome::Pending);
                }
                DependencyStatus::Failed(e) => return Err(e),
                DependencyStatus::Ready => {}
            }
            record = self.transition(id, ServiceState::Running).await?;
        }

        record = self.submit_children(record, processor.as_ref(), resumed).await?;
        let resolved = self.await_dependencies(&record).await?;

        let permit = self.throttle.admit(&record.resources).await?;
        let output = self.process(&record, processor.clone(), resolved).await?;
        processor.check_for_errors(&record, &output).await?;
        let result = processor.collect_result(&record, output).await?;
        drop(permit);

        let done = self
            .change_state(id, |r, now| {
                let updates = r.set_result(result.clone());
                Ok(updates.merge(r.update_state(ServiceState::Successful, now)?))
            })
            .await?;
        Ok(RunOutcome::Completed(done))
    }

    /// Saves the processor's sub-services under `record` and queues them.
    ///
    /// A resumed run keeps the children it already created and makes sure
    /// each of them is still one of its dependencies.
    async fn submit_children(
        &self,
        record: ServiceRecord,
        processor: &dyn ServiceProcessor,
        resumed: bool,
    ) -> ServiceResult<ServiceRecord> {
        let id = record.require_id()?;
        if resumed {
            let existing = self
                .store
                .find_matching(
                    &ServicePattern::new().with_parent(id),
                    DateInterval::any(),
                    &PageRequest::unbounded().sorted_by(SortCriteria::asc(RecordField::Id)),
                )
                .await?
                .results;
            if !existing.is_empty() {
                debug!(service_id = %id, existing = existing.len(), "resuming with existing sub-services");
                return self.relink_children(record, &existing).await;
            }
        }

        let requested = processor.submit_dependencies(&record).await?;
        if requested.dependencies.is_empty() {
            return Ok(record);
        }

        let mut hierarchy = self
            .hierarchy
            .find_hierarchy(id)
            .await?
            .ok_or(ServiceError::NotFound(id))?;
        let focus = hierarchy.focus();
        let now = self.clock.now();
        let count = requested.dependencies.len();
        for child in requested.dependencies {
            let prepared = self.prepare_queued(child, now).await?;
            let idx = hierarchy.add_child(focus, prepared)?;
            hierarchy.add_dependency(focus, idx)?;
        }
        self.hierarchy.save_hierarchy(&mut hierarchy).await?;
        info!(service_id = %id, count, "sub-services queued");
        Ok(hierarchy.focused_record().clone())
    }

    /// Adds sub-services missing from `dependenciesIds`. The links are lost
    /// when a run stops between saving the children and updating the parent.
    async fn relink_children(
        &self,
        mut record: ServiceRecord,
        children: &[ServiceRecord],
    ) -> ServiceResult<ServiceRecord> {
        let id = record.require_id()?;
        let mut updates = FieldUpdates::new();
        for child in children {
            updates = updates.merge(record.add_service_dependency(child.require_id()?)?);
        }
        if updates.is_empty() {
            return Ok(record);
        }
        warn!(service_id = %id, links = updates.len(), "restoring lost sub-service dependencies");
        self.store.update(id, &updates).await
    }

    /// Waits until every dependency finished. Stops early on a failed
    /// dependency or when `record` itself gets canceled.
    async fn await_dependencies(&self, record: &ServiceRecord) -> ServiceResult<ResolvedDependencies> {
        if record.dependencies_ids.is_empty() {
            return Ok(ResolvedDependencies::default());
        }
        let id = record.require_id()?;
        let ids = record.dependencies_ids.clone();
        let store = self.store.clone();

        Computation::completed(())
            .suspend_until(
                move |_| {
                    let store = store.clone();
                    let ids = ids.clone();
                    async move {
                        ensure_not_canceled(store.as_ref(), id).await?;
                        match dependency_status(store.as_ref(), &ids).await? {
                            DependencyStatus::Ready => Ok(true),
                            DependencyStatus::Waiting => Ok(false),
                            DependencyStatus::Failed(e) => Err(e),
                        }
                    }
                },
                self.config.worker.poll_interval(),
            )
            .await?;

        let records = self.store.find_by_ids(&record.dependencies_ids).await?;
        Ok(ResolvedDependencies { records })
    }

    async fn process(
        &self,
        record: &ServiceRecord,
        processor: Arc<dyn ServiceProcessor>,
        resolved: ResolvedDependencies,
    ) -> ServiceResult<Value> {
        let id = record.require_id()?;
        let ready_record = record.clone();
        let ready_processor = processor.clone();
        let store = self.store.clone();
        let pipeline = processor.process(record, resolved).suspend_until(
            move |output: &Value| {
                let processor = ready_processor.clone();
                let record = ready_record.clone();
                let store = store.clone();
                let output = output.clone();
                async move {
                    ensure_not_canceled(store.as_ref(), id).await?;
                    processor.is_result_ready(&record, &output).await
                }
            },
            self.config.result_poll_interval(),
        );

        let Some(limit) = self.config.result_timeout() else {
            return pipeline.await;
        };
        match tokio::time::timeout(limit, pipeline.into_future()).await {
            Ok(result) => result,
            Err(_) => {
                let message = format!("no result after {} ms", limit.as_millis());
                let now = self.clock.now();
                let mut scratch = record.clone();
                let event = scratch.add_event(EventType::Timeout, message.clone(), now)?;
                self.store.update(id, &event).await?;
                Err(ServiceError::execution(message))
            }
        }
    }

    /// Records the failure and moves the record to ERROR (through RUNNING when
    /// it never started).
    async fn fail(&self, id: ServiceId, error: ServiceError) -> ServiceResult<RunOutcome> {
        warn!(service_id = %id, error = %error, "service failed");
        let kind = match error {
            ServiceError::DependencyFailure { .. } => EventType::DependencyFailure,
            _ => EventType::Failed,
        };
        let message = error.to_string();

        let result = self
            .change_state(id, |record, now| {
                let mut updates = FieldUpdates::new();
                if record.state == ServiceState::Queued {
                    updates = updates.merge(record.update_state(ServiceState::Running, now)?);
                }
                updates = updates.merge(record.add_event(kind, message.clone(), now)?);
                Ok(updates.merge(record.update_state(ServiceState::Error, now)?))
            })
            .await;

        match result {
            Ok(failed) => Ok(RunOutcome::Failed(failed)),
            Err(e) if is_canceled(&e) => Ok(RunOutcome::Canceled),
            Err(e) => Err(e),
        }
    }
}

/// States only reachable after the record started running.
fn started(state: ServiceState) -> bool {
    matches!(
        state,
        ServiceState::Running | ServiceState::Successful | ServiceState::Error
    )
}

fn cancel_updates(record: &mut ServiceRecord, now: DateTime<Utc>) -> ServiceResult<FieldUpdates> {
    let updates = record.update_state(ServiceState::Canceled, now)?;
    Ok(updates.merge(record.add_event(EventType::Canceled, "Service canceled", now)?))
}

/// A transition refused because the record was canceled in the meantime.
fn is_canceled(error: &ServiceError) -> bool {
    matches!(
        error,
        ServiceError::Canceled(_)
            | ServiceError::InvalidTransition {
                from: ServiceState::Canceled,
                ..
            }
    )
}

async fn ensure_not_canceled(store: &dyn ServiceStore, id: ServiceId) -> ServiceResult<()> {
    match store.find_by_id(id).await? {
        Some(record) if record.state == ServiceState::Canceled => Err(ServiceError::Canceled(id)),
        Some(_) => Ok(()),
        None => Err(ServiceError::NotFound(id)),
    }
}

/// Errors `run` hands back to the caller instead of failing the record.
fn is_retried_by_caller(error: &ServiceError) -> bool {
    matches!(error, ServiceError::StoreContention(_)) || error.kind() == ErrorKind::Infrastructure
}

enum DependencyStatus {
    Ready,
    Waiting,
    Failed(ServiceError),
}

async fn dependency_status(
    store: &dyn ServiceStore,
    ids: &[ServiceId],
) -> ServiceResult<DependencyStatus> {
    if ids.is_empty() {
        return Ok(DependencyStatus::Ready);
    }
    let records = store.find_by_ids(ids).await?;
    let found: BTreeSet<ServiceId> = records.iter().filter_map(|r| r.id).collect();
    if let Some(missing) = ids.iter().find(|id| !found.contains(id)) {
        return Ok(DependencyStatus::Failed(ServiceError::DependencyFailure {
            dependency: *missing,
            reason: "dependency no longer exists".to_string(),
        }));
    }

    let mut waiting = false;
    for dep in &records {
        match dep.state {
            ServiceState::Error | ServiceState::Canceled => {
                return Ok(DependencyStatus::Failed(ServiceError::DependencyFailure {
                    dependency: dep.require_id()?,
                    reason: format!("'{}' ended {}", dep.name, dep.state),
                }));
            }
            state if !state.is_finished() => waiting = true,
            _ => {}
        }
    }
    Ok(if waiting {
        DependencyStatus::Waiting
    } else {
        DependencyStatus::Ready
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::builder::EngineBuilder;
    use crate::app::processor::DependencyResult;
    use crate::domain::NotificationRegistration;
    use crate::impls::{CollectingNotificationSink, InMemoryServiceStore};
    use crate::ports::{SystemClock, UlidGenerator};
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    struct Echo;

    #[async_trait]
    impl ServiceProcessor for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        fn process(&self, record: &ServiceRecord, deps: ResolvedDependencies) -> Computation<Value> {
            let upstream: Vec<Value> = deps
                .records
                .iter()
                .filter_map(|r| r.serializable_result.clone())
                .collect();
            Computation::completed(json!({ "stdout": record.args.join(" "), "upstream": upstream }))
        }
    }

    struct Crash;

    #[async_trait]
    impl ServiceProcessor for Crash {
        fn name(&self) -> &str {
            "crash"
        }

        fn process(&self, _record: &ServiceRecord, _deps: ResolvedDependencies) -> Computation<Value> {
            Computation::completed(json!({ "stderr": "Segmentation fault" }))
        }
    }

    /// Fans out into two echo children and waits for them.
    struct FanOut;

    #[async_trait]
    impl ServiceProcessor for FanOut {
        fn name(&self) -> &str {
            "fan-out"
        }

        fn submit_dependencies(&self, _record: &ServiceRecord) -> Computation<DependencyResult> {
            Computation::completed(DependencyResult::of(vec![
                ServiceRecord::new("echo").with_arg("left"),
                ServiceRecord::new("echo").with_arg("right"),
            ]))
        }

        fn process(&self, _record: &ServiceRecord, deps: ResolvedDependencies) -> Computation<Value> {
            Computation::completed(json!(deps.records.len()))
        }
    }

    struct Never;

    #[async_trait]
    impl ServiceProcessor for Never {
        fn name(&self) -> &str {
            "never"
        }

        fn process(&self, _record: &ServiceRecord, _deps: ResolvedDependencies) -> Computation<Value> {
            Computation::completed(Value::Null)
        }

        async fn is_result_ready(&self, _record: &ServiceRecord, _output: &Value) -> ServiceResult<bool> {
            Ok(false)
        }
    }

    struct Fixture {
        engine: ServiceEngine,
        store: Arc<InMemoryServiceStore>,
        sink: Arc<CollectingNotificationSink>,
    }

    fn fixture_with(config: EngineConfig) -> Fixture {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let ids: Arc<dyn IdGenerator> = Arc::new(UlidGenerator::new(SystemClock));
        let store = Arc::new(InMemoryServiceStore::new(clock.clone(), ids.clone()));
        let sink = Arc::new(CollectingNotificationSink::new());
        let engine = EngineBuilder::new(store.clone())
            .with_clock(clock)
            .with_id_generator(ids)
            .with_notification_sink(sink.clone())
            .with_config(config)
            .register(Arc::new(Echo))
            .unwrap()
            .register(Arc::new(Crash))
            .unwrap()
            .register(Arc::new(FanOut))
            .unwrap()
            .register(Arc::new(Never))
            .unwrap()
            .build()
            .unwrap();
        Fixture { engine, store, sink }
    }

    fn fixture() -> Fixture {
        let mut config = EngineConfig::default();
        config.worker.poll_interval_ms = 5;
        config.result_poll_interval_ms = 5;
        fixture_with(config)
    }

    async fn claimed(f: &Fixture, record: ServiceRecord) -> ServiceId {
        let saved = f.engine.submit(record).await.unwrap();
        let id = saved.id.unwrap();
        f.store
            .update(id, &FieldUpdates::new().set(RecordField::QueueId, "q1"))
            .await
            .unwrap();
        id
    }

    fn event_names(record: &ServiceRecord) -> Vec<String> {
        record.events.iter().map(|e| e.name.clone()).collect()
    }

    #[tokio::test]
    async fn submit_queues_and_unknown_processor_saves_nothing() {
        let f = fixture();
        let saved = f.engine.submit(ServiceRecord::new("echo")).await.unwrap();
        assert_eq!(saved.state, ServiceState::Queued);
        assert_eq!(event_names(&saved), vec!["UPDATE_STATE"]);

        let err = f.engine.submit(ServiceRecord::new("unknown")).await.unwrap_err();
        assert!(matches!(err, ServiceError::ProcessorNotFound { .. }));
        assert_eq!(f.store.len().await, 1);
    }

    #[tokio::test]
    async fn unclaimed_record_is_refused() {
        let f = fixture();
        let saved = f.engine.submit(ServiceRecord::new("echo")).await.unwrap();
        assert!(matches!(
            f.engine.run(saved.id.unwrap()).await,
            Err(ServiceError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn unclaimed_record_cannot_be_started_by_hand() {
        let f = fixture();
        let saved = f.engine.submit(ServiceRecord::new("echo")).await.unwrap();
        let id = saved.id.unwrap();

        assert!(matches!(
            f.engine.transition(id, ServiceState::Running).await,
            Err(ServiceError::Validation(_))
        ));
        let stored = f.engine.find(id).await.unwrap().unwrap();
        assert_eq!(stored.state, ServiceState::Queued);
        assert!(stored.queue_id.is_none());

        // canceling does not need a claim
        let canceled = f.engine.cancel(id).await.unwrap();
        assert_eq!(canceled.state, ServiceState::Canceled);
    }

    #[tokio::test]
    async fn successful_run_stores_result_and_notifies() {
        let f = fixture();
        let record = ServiceRecord::new("echo")
            .with_arg("hi")
            .with_notification("progress", NotificationRegistration::on_all_stages("progress"));
        let id = claimed(&f, record).await;

        let RunOutcome::Completed(done) = f.engine.run(id).await.unwrap() else {
            panic!("expected completion");
        };
        assert_eq!(done.state, ServiceState::Successful);
        assert_eq!(done.serializable_result, Some(json!({"stdout": "hi", "upstream": []})));

        let stages: Vec<_> = f.sink.received().await.iter().map(|n| n.stage).collect();
        assert_eq!(stages, vec![LifecycleStage::Start, LifecycleStage::Successful]);
    }

    #[tokio::test]
    async fn error_signature_fails_the_service() {
        let f = fixture();
        let id = claimed(&f, ServiceRecord::new("crash")).await;

        let RunOutcome::Failed(failed) = f.engine.run(id).await.unwrap() else {
            panic!("expected failure");
        };
        assert_eq!(failed.state, ServiceState::Error);
        assert!(failed.events.iter().any(|e| e.is(EventType::Failed)));
    }

    #[tokio::test]
    async fn failed_declared_dependency_never_processes() {
        let f = fixture();
        let mut dep = ServiceRecord::new("echo");
        dep.state = ServiceState::Error;
        let dep = f.store.save(dep).await.unwrap();

        let mut record = ServiceRecord::new("echo")
            .with_notification("progress", NotificationRegistration::on_all_stages("progress"));
        record.dependencies_ids.push(dep.id.unwrap());
        let id = claimed(&f, record).await;

        let RunOutcome::Failed(failed) = f.engine.run(id).await.unwrap() else {
            panic!("expected failure");
        };
        let stages: Vec<_> = f.sink.received().await.iter().map(|n| n.stage).collect();
        assert_eq!(stages, vec![LifecycleStage::Start, LifecycleStage::Failed]);
        assert!(failed.events.iter().any(|e| e.is(EventType::DependencyFailure)));
        assert!(failed.serializable_result.is_none());
        let states: Vec<_> = failed
            .events
            .iter()
            .filter(|e| e.is(EventType::UpdateState))
            .map(|e| e.value.clone())
            .collect();
        assert_eq!(
            states.last().map(String::as_str),
            Some("Update state from RUNNING -> ERROR")
        );
    }

    #[tokio::test]
    async fn unfinished_declared_dependency_keeps_record_queued() {
        let f = fixture();
        let dep = f.engine.submit(ServiceRecord::new("echo")).await.unwrap();
        let mut h = ServiceHierarchy::new(ServiceRecord::new("echo"));
        let root = h.root();
        let dep_idx = h.add_detached(dep.clone());
        h.add_dependency(root, dep_idx).unwrap();
        f.engine.submit_hierarchy(&mut h).await.unwrap();
        let id = h.record(root).id.unwrap();
        f.store
            .update(id, &FieldUpdates::new().set(RecordField::QueueId, "q1"))
            .await
            .unwrap();

        assert_eq!(f.engine.run(id).await.unwrap(), RunOutcome::Pending);
        assert_eq!(
            f.engine.find(id).await.unwrap().unwrap().state,
            ServiceState::Queued
        );
    }

    #[tokio::test]
    async fn sub_services_are_created_and_awaited() {
        let f = fixture();
        let id = claimed(&f, ServiceRecord::new("fan-out")).await;

        let engine = Arc::new(f.engine);
        let runner = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.run(id).await })
        };

        // act as a second worker for the children
        let children = loop {
            let found = f
                .store
                .find_matching(
                    &ServicePattern::new().with_parent(id),
                    DateInterval::any(),
                    &PageRequest::unbounded(),
                )
                .await
                .unwrap()
                .results;
            if found.len() == 2 {
                break found;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        for child in &children {
            let child_id = child.id.unwrap();
            assert_eq!(child.root_service_id, Some(id));
            f.store
                .update(child_id, &FieldUpdates::new().set(RecordField::QueueId, "q2"))
                .await
                .unwrap();
            assert!(matches!(engine.run(child_id).await.unwrap(), RunOutcome::Completed(_)));
        }

        let RunOutcome::Completed(parent) = runner.await.unwrap().unwrap() else {
            panic!("expected completion");
        };
        assert_eq!(parent.serializable_result, Some(json!(2)));
        assert_eq!(parent.dependencies_ids.len(), 2);
    }

    #[tokio::test]
    async fn result_timeout_records_timeout_event() {
        let mut config = EngineConfig::default();
        config.result_poll_interval_ms = 5;
        config.result_timeout_ms = Some(30);
        let f = fixture_with(config);
        let id = claimed(&f, ServiceRecord::new("never")).await;

        let RunOutcome::Failed(failed) = f.engine.run(id).await.unwrap() else {
            panic!("expected failure");
        };
        assert!(failed.events.iter().any(|e| e.is(EventType::Timeout)));
        assert!(failed.events.iter().any(|e| e.is(EventType::Failed)));
    }

    #[tokio::test]
    async fn cancel_stops_a_waiting_run() {
        let f = fixture();
        let id = claimed(&f, ServiceRecord::new("never")).await;
        let engine = Arc::new(f.engine);
        let runner = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.run(id).await })
        };
        loop {
            if engine.find(id).await.unwrap().unwrap().state == ServiceState::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        let canceled = engine.cancel(id).await.unwrap();
        assert_eq!(canceled.state, ServiceState::Canceled);
        assert!(canceled.events.iter().any(|e| e.is(EventType::Canceled)));

        assert_eq!(runner.await.unwrap().unwrap(), RunOutcome::Canceled);
        let record = engine.find(id).await.unwrap().unwrap();
        assert_eq!(record.state, ServiceState::Canceled);
        assert!(!record.events.iter().any(|e| e.is(EventType::Failed)));
    }

    #[tokio::test]
    async fn restart_requeues_and_releases_queue() {
        let f = fixture();
        let id = claimed(&f, ServiceRecord::new("echo")).await;
        f.engine.transition(id, ServiceState::Running).await.unwrap();

        let restarted = f.engine.restart(id).await.unwrap();
        assert_eq!(restarted.state, ServiceState::Queued);
        assert!(restarted.queue_id.is_none());
        assert!(restarted.events.iter().any(|e| e.is(EventType::Restarted)));

        assert!(matches!(
            f.engine.restart(id).await,
            Err(ServiceError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn retire_only_from_finished_states() {
        let f = fixture();
        let id = claimed(&f, ServiceRecord::new("echo")).await;
        assert!(matches!(
            f.engine.retire(id).await,
            Err(ServiceError::InvalidTransition { .. })
        ));
        f.engine.run(id).await.unwrap();
        assert_eq!(f.engine.retire(id).await.unwrap().state, ServiceState::Retired);
    }

    #[tokio::test]
    async fn stats_count_waiting_and_running_services() {
        let f = fixture();
        claimed(&f, ServiceRecord::new("echo")).await;
        let running = claimed(&f, ServiceRecord::new("echo")).await;
        f.engine.transition(running, ServiceState::Running).await.unwrap();

        let stats = f.engine.stats().await.unwrap();
        assert_eq!(stats.waiting, 1);
        assert_eq!(stats.running, 1);
        assert_eq!(stats.slots_capacity, Some(16));

        f.engine.set_processing_slots(4).await.unwrap();
        let stats = f.engine.stats().await.unwrap();
        assert_eq!(stats.slots_capacity, Some(4));
        assert_eq!(stats.slots_available, Some(4));
    }

    #[tokio::test]
    async fn canceled_record_run_is_a_no_op() {
        let f = fixture();
        let id = claimed(&f, ServiceRecord::new("echo")).await;
        f.engine.cancel(id).await.unwrap();
        assert_eq!(f.engine.run(id).await.unwrap(), RunOutcome::Canceled);
    }
}
