//! WorkerLoop - claim → run のループ
//!
//! # フロー
//! 1. 空きスロット（`max_concurrent_jobs`）があれば、その数までだけ claim する
//!    - 起動直後と、store 障害で run が中断した後は先に「再取得」：
//!      自分の queueId が付いた QUEUED / RUNNING を読むだけ（クラッシュ復旧）
//!    - 残りのスロット分だけ QUEUED を claim
//!    - 走らせられなかった QUEUED は queueId を外して他の worker に返す
//! 2. claim できたレコードごとに tokio task で `ServiceEngine::run`
//! 3. claim が Storage エラーなら指数 backoff、それ以外は poll 間隔だけ待つ
//! 4. shutdown が来たら新しい claim をやめ、実行中の run を待って終わる
//!
//! 実行中の id は in-flight 集合で覚えておき、同じレコードを二重に走らせない。

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{Semaphore, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::app::claim::ClaimProtocol;
use crate::app::config::WorkerConfig;
use crate::app::engine::{RunOutcome, ServiceEngine};
use crate::domain::{
    PageRequest, ServiceError, ServiceId, ServiceRecord, ServiceResult, ServiceState,
};

const CLAIM_STATES: &[ServiceState] = &[ServiceState::Queued];
const RECOVERY_STATES: &[ServiceState] = &[ServiceState::Queued, ServiceState::Running];

#[derive(Default)]
struct InFlight(Mutex<HashSet<ServiceId>>);

impl InFlight {
    fn lock(&self) -> MutexGuard<'_, HashSet<ServiceId>> {
        match self.0.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// run が終わったら（panic でも）in-flight から外す
struct InFlightGuard {
    id: ServiceId,
    set: Arc<InFlight>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set.lock().remove(&self.id);
    }
}

pub struct WorkerLoop {
    worker_id: usize,
    engine: Arc<ServiceEngine>,
    claim: ClaimProtocol,
    config: WorkerConfig,
    slots: Arc<Semaphore>,
    in_flight: Arc<InFlight>,
    recover: Arc<AtomicBool>,
    running: JoinSet<()>,
}

impl WorkerLoop {
    pub fn new(worker_id: usize, engine: Arc<ServiceEngine>, config: WorkerConfig) -> Self {
        Self {
            worker_id,
            claim: ClaimProtocol::new(engine.store().clone()),
            slots: Arc::new(Semaphore::new(config.max_concurrent_jobs.max(1))),
            engine,
            config,
            in_flight: Arc::new(InFlight::default()),
            recover: Arc::new(AtomicBool::new(true)),
            running: JoinSet::new(),
        }
    }

    pub fn queue_id(&self) -> &str {
        &self.config.queue_id
    }

    /// Runs currently in progress.
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// One claim pass. Returns how many runs were started.
    ///
    /// Never claims more than there are free slots; anything claimed that
    /// cannot be started is released again.
    pub async fn poll_once(&mut self) -> ServiceResult<usize> {
        self.reap();
        let free = self.slots.available_permits();
        if free == 0 {
            return Ok(0);
        }
        let wanted = free.min(self.config.page_size.max(1));

        let mut candidates = Vec::new();
        if self.recover.swap(false, Ordering::SeqCst) {
            // 再取得は読むだけ。in-flight の分も混ざるので多めに読む
            let page = PageRequest::first(wanted + self.in_flight());
            match self
                .claim
                .claim(&self.config.queue_id, true, RECOVERY_STATES, &page)
                .await
            {
                Ok(found) => {
                    candidates = self.not_in_flight(found);
                    if !candidates.is_empty() {
                        info!(worker_id = self.worker_id, count = candidates.len(), "re-fetched services assigned to this queue");
                    }
                }
                Err(e) => {
                    self.recover.store(true, Ordering::SeqCst);
                    return Err(e);
                }
            }
        }
        let remaining = wanted.saturating_sub(candidates.len());
        if remaining > 0 {
            let claimed = self
                .claim
                .claim(&self.config.queue_id, false, CLAIM_STATES, &PageRequest::first(remaining))
                .await?;
            for record in self.not_in_flight(claimed) {
                if !candidates.iter().any(|c| c.id == record.id) {
                    candidates.push(record);
                }
            }
        }

        let mut started = 0;
        let mut surplus = Vec::new();
        for record in candidates {
            let Some(id) = record.id else {
                continue;
            };
            let Ok(permit) = self.slots.clone().try_acquire_owned() else {
                surplus.push(record);
                continue;
            };
            if !self.in_flight.lock().insert(id) {
                continue;
            }
            let guard = InFlightGuard {
                id,
                set: self.in_flight.clone(),
            };

            let engine = self.engine.clone();
            let recover = self.recover.clone();
            let worker_id = self.worker_id;
            self.running.spawn(async move {
                let _permit = permit;
                let _guard = guard;
                report(worker_id, id, engine.run(id).await, &recover);
            });
            started += 1;
        }
        self.release_surplus(surplus).await?;
        Ok(started)
    }

    fn not_in_flight(&self, records: Vec<ServiceRecord>) -> Vec<ServiceRecord> {
        let in_flight = self.in_flight.lock();
        records
            .into_iter()
            .filter(|r| r.id.is_some_and(|id| !in_flight.contains(&id)))
            .collect()
    }

    /// QUEUED は他の worker に返す。RUNNING は自分で再開するしかないので次の再取得に回す
    async fn release_surplus(&self, surplus: Vec<ServiceRecord>) -> ServiceResult<()> {
        for record in surplus {
            let Some(id) = record.id else {
                continue;
            };
            if record.state == ServiceState::Queued {
                self.claim.release(&self.config.queue_id, id).await?;
            } else {
                self.recover.store(true, Ordering::SeqCst);
            }
        }
        Ok(())
    }

    /// Claims until `shutdown` flips, then waits for in-flight runs.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(worker_id = self.worker_id, queue_id = %self.config.queue_id, "worker started");
        let policy = self.config.retry_policy();
        let mut failures: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }
            let pause = match self.poll_once().await {
                Ok(started) => {
                    failures = 0;
                    if started > 0 {
                        debug!(worker_id = self.worker_id, started, "runs started");
                    }
                    self.config.poll_interval()
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    let delay = policy.next_delay(failures);
                    warn!(
                        worker_id = self.worker_id,
                        error = %e,
                        failures,
                        delay_ms = delay.as_millis() as u64,
                        "claim failed, backing off"
                    );
                    delay
                }
            };

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(pause) => {}
            }
        }

        self.drain().await;
        info!(worker_id = self.worker_id, "worker stopped");
    }

    /// Waits for every in-flight run.
    pub async fn drain(&mut self) {
        while let Some(joined) = self.running.join_next().await {
            if let Err(e) = joined {
                error!(worker_id = self.worker_id, error = %e, "run task panicked");
            }
        }
    }

    fn reap(&mut self) {
        while let Some(joined) = self.running.try_join_next() {
            if let Err(e) = joined {
                error!(worker_id = self.worker_id, error = %e, "run task panicked");
            }
        }
    }
}

fn report(worker_id: usize, id: ServiceId, result: ServiceResult<RunOutcome>, recover: &AtomicBool) {
    match result {
        Ok(RunOutcome::Completed(_)) => info!(worker_id, service_id = %id, "service completed"),
        Ok(RunOutcome::Failed(_)) => warn!(worker_id, service_id = %id, "service ended in error"),
        Ok(RunOutcome::Pending) => debug!(worker_id, service_id = %id, "waiting on dependencies"),
        Ok(RunOutcome::Canceled) => info!(worker_id, service_id = %id, "service canceled"),
        Err(e) if e.is_retryable() || matches!(e, ServiceError::StoreContention(_)) => {
            // レコードは自分の queue に付いたまま。次は再取得パスで拾う
            warn!(worker_id, service_id = %id, error = %e, "run interrupted, will resume");
            recover.store(true, Ordering::SeqCst);
        }
        Err(e) => error!(worker_id, service_id = %id, error = %e, "run rejected"),
    }
}

/// Worker group handle.
/// - `request_shutdown()` でワーカー全体が新しい claim をやめる
/// - `shutdown_and_join()` で実行中の run も含めて終了を待てる
///
/// ワーカーごとに `<queue_id>-<n>` の queue を使う（claim は queue 単位で排他）。
pub struct WorkerGroup {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerGroup {
    /// Spawn `n` workers.
    pub fn spawn(n: usize, engine: Arc<ServiceEngine>, config: WorkerConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut joins = Vec::with_capacity(n);
        for worker_id in 0..n {
            let config = config
                .clone()
                .with_queue_id(format!("{}-{worker_id}", config.queue_id));
            let worker = WorkerLoop::new(worker_id, Arc::clone(&engine), config);
            joins.push(tokio::spawn(worker.run(shutdown_rx.clone())));
        }

        Self { shutdown_tx, joins }
    }

    /// Request shutdown for all workers.
    /// In-flight runs are not canceled; workers just stop claiming.
    pub fn request_shutdown(&self) {
        // receivers may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    /// Shutdown and wait for all workers.
    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for join in self.joins {
            if let Err(e) = join.await {
                error!(error = %e, "worker task panicked");
            }
        }
    }
}
