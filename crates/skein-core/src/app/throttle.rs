//! ResourceThrottle - 容量制限付きの受付ゲート
//!
//! リソース名ごとに tokio `Semaphore` を 1 つ持ち、レコードの `resources`
//! （例: `"slots" = "4"`）に書かれた量だけ permit を取る。
//!
//! - 複数キーは常にキー名の順で取得する（取得順を揃えてデッドロックを防ぐ）
//! - 容量を超える要求は待っても通らないので `Validation` で即失敗
//! - 設定されていないキーは無視する
//! - `ThrottlePermit` を drop すると返却される
//! - `set_capacity` で実行中に容量を変えられる。縮めた分は使用中の permit が
//!   返ってきた時点で回収する

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::debug;

use crate::domain::{ServiceError, ServiceResult};

struct Capacity {
    total: AtomicU32,
    semaphore: Arc<Semaphore>,
}

pub struct ResourceThrottle {
    capacities: BTreeMap<String, Capacity>,
}

/// 取得した permit。drop で返却。
#[derive(Debug, Default)]
pub struct ThrottlePermit {
    held: Vec<(String, OwnedSemaphorePermit)>,
}

impl ThrottlePermit {
    /// Units held for `key`.
    pub fn held(&self, key: &str) -> u32 {
        self.held
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, p)| p.num_permits() as u32)
            .sum()
    }
}

impl ResourceThrottle {
    pub fn new(capacities: &BTreeMap<String, u32>) -> Self {
        let capacities = capacities
            .iter()
            .map(|(key, &total)| {
                (
                    key.clone(),
                    Capacity {
                        total: AtomicU32::new(total),
                        semaphore: Arc::new(Semaphore::new(total as usize)),
                    },
                )
            })
            .collect();
        Self { capacities }
    }

    /// A throttle that admits everything.
    pub fn unlimited() -> Self {
        Self {
            capacities: BTreeMap::new(),
        }
    }

    pub fn available(&self, key: &str) -> Option<usize> {
        self.capacities
            .get(key)
            .map(|c| c.semaphore.available_permits())
    }

    pub fn capacity(&self, key: &str) -> Option<u32> {
        self.capacities
            .get(key)
            .map(|c| c.total.load(Ordering::SeqCst))
    }

    /// Changes the capacity of a configured resource while services run.
    ///
    /// Growing takes effect at once. Shrinking forgets free permits now and
    /// the rest as running services give theirs back.
    pub async fn set_capacity(&self, key: &str, total: u32) -> ServiceResult<()> {
        let Some(capacity) = self.capacities.get(key) else {
            return Err(ServiceError::validation(format!(
                "resource '{key}' is not throttled"
            )));
        };
        let previous = capacity.total.swap(total, Ordering::SeqCst);
        if total > previous {
            capacity.semaphore.add_permits((total - previous) as usize);
        } else if total < previous {
            let shrink = (previous - total) as usize;
            let outstanding = shrink - capacity.semaphore.forget_permits(shrink);
            if outstanding > 0 {
                let semaphore = capacity.semaphore.clone();
                tokio::spawn(async move {
                    if let Ok(permits) = semaphore.acquire_many_owned(outstanding as u32).await {
                        permits.forget();
                    }
                });
            }
        }
        debug!(resource = key, previous, total, "throttle capacity changed");
        Ok(())
    }

    /// Requirements per configured key, in key order. Zero requirements are dropped.
    fn requirements(&self, resources: &BTreeMap<String, String>) -> ServiceResult<Vec<(&str, u32)>> {
        let mut wanted = Vec::new();
        for (key, capacity) in &self.capacities {
            let Some(raw) = resources.get(key) else {
                continue;
            };
            let total = capacity.total.load(Ordering::SeqCst);
            let amount: u32 = raw.trim().parse().map_err(|_| {
                ServiceError::validation(format!("resource '{key}' must be an integer, got '{raw}'"))
            })?;
            if amount > total {
                return Err(ServiceError::validation(format!(
                    "resource '{key}' requires {amount} but capacity is {total}"
                )));
            }
            if amount > 0 {
                wanted.push((key.as_str(), amount));
            }
        }
        Ok(wanted)
    }

    /// Waits until every requirement in `resources` can be held.
    pub async fn admit(&self, resources: &BTreeMap<String, String>) -> ServiceResult<ThrottlePermit> {
        let wanted = self.requirements(resources)?;
        let mut permit = ThrottlePermit::default();
        for (key, amount) in wanted {
            let Some(capacity) = self.capacities.get(key) else {
                continue;
            };
            debug!(resource = key, amount, "waiting for throttle admission");
            let held = capacity
                .semaphore
                .clone()
                .acquire_many_owned(amount)
                .await
                .map_err(|e| ServiceError::execution(format!("throttle closed: {e}")))?;
            permit.held.push((key.to_string(), held));
        }
        Ok(permit)
    }

    /// Non-blocking `admit`; `Ok(None)` when some resource is exhausted right now.
    pub fn try_admit(
        &self,
        resources: &BTreeMap<String, String>,
    ) -> ServiceResult<Option<ThrottlePermit>> {
        let wanted = self.requirements(resources)?;
        let mut permit = ThrottlePermit::default();
        for (key, amount) in wanted {
            let Some(capacity) = self.capacities.get(key) else {
                continue;
            };
            match capacity.semaphore.clone().try_acquire_many_owned(amount) {
                Ok(held) => permit.held.push((key.to_string(), held)),
                // already held permits are released when `permit` drops
                Err(TryAcquireError::NoPermits) => return Ok(None),
                Err(TryAcquireError::Closed) => {
                    return Err(ServiceError::execution("throttle closed"));
                }
            }
        }
        Ok(Some(permit))
    }
}
