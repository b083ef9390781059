//! Computation - 「今ある値」と「あとで得られる値」を同じ形で合成する
//!
//! `Computation<T>` は `Result<T, ServiceError>` を返す boxed future の薄いラッパーです。
//! 依存解決 → 実行 → 結果回収の流れを map / flat_map / combine_all で組み立てます。
//!
//! # 保証
//! - 失敗したら後続のステップは実行されない（short-circuit）
//! - `combine_all` は全部成功したときだけ combiner を呼ぶ
//! - drop するとキャンセルされる（`spawn` したタスクも abort される）
//! - 待機はすべて future の未完了として表現し、スレッドはブロックしない

use std::future::{Future, IntoFuture};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, try_join_all};
use tokio::task::JoinHandle;

use crate::domain::{ServiceError, ServiceResult};

#[must_use = "a computation does nothing unless awaited"]
pub struct Computation<T> {
    inner: BoxFuture<'static, ServiceResult<T>>,
}

impl<T: Send + 'static> Computation<T> {
    pub fn completed(value: T) -> Self {
        Self::from_future(async move { Ok(value) })
    }

    pub fn failed(error: ServiceError) -> Self {
        Self::from_future(async move { Err(error) })
    }

    pub fn from_result(result: ServiceResult<T>) -> Self {
        Self::from_future(async move { result })
    }

    pub fn from_future<F>(future: F) -> Self
    where
        F: Future<Output = ServiceResult<T>> + Send + 'static,
    {
        Self {
            inner: future.boxed(),
        }
    }

    /// Runs `future` on the tokio runtime right away.
    ///
    /// A panic in the task surfaces as `ServiceError::Execution`.
    pub fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = ServiceResult<T>> + Send + 'static,
    {
        let guard = AbortOnDrop(tokio::spawn(future));
        Self::from_future(async move {
            let mut guard = guard;
            match (&mut guard.0).await {
                Ok(result) => result,
                Err(e) => Err(ServiceError::execution(format!("task failed: {e}"))),
            }
        })
    }

    pub fn map<U, F>(self, f: F) -> Computation<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        Computation::from_future(async move { self.inner.await.map(f) })
    }

    /// Like `map`, but the step itself may fail.
    pub fn and_then<U, F>(self, f: F) -> Computation<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> ServiceResult<U> + Send + 'static,
    {
        Computation::from_future(async move { self.inner.await.and_then(f) })
    }

    pub fn flat_map<U, F>(self, f: F) -> Computation<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> Computation<U> + Send + 'static,
    {
        Computation::from_future(async move {
            let value = self.inner.await?;
            f(value).inner.await
        })
    }

    /// Runs a fallback only when this computation fails.
    pub fn or_else<F>(self, f: F) -> Computation<T>
    where
        F: FnOnce(ServiceError) -> Computation<T> + Send + 'static,
    {
        Computation::from_future(async move {
            match self.inner.await {
                Ok(value) => Ok(value),
                Err(e) => f(e).inner.await,
            }
        })
    }

    pub fn zip<U>(self, other: Computation<U>) -> Computation<(T, U)>
    where
        U: Send + 'static,
    {
        Computation::from_future(async move { futures::try_join!(self.inner, other.inner) })
    }

    /// Waits for `self` and every computation in `others`, then combines them.
    ///
    /// The first failure wins and the combiner is never called.
    pub fn combine_all<U, R, F>(self, others: Vec<Computation<U>>, combiner: F) -> Computation<R>
    where
        U: Send + 'static,
        R: Send + 'static,
        F: FnOnce(T, Vec<U>) -> R + Send + 'static,
    {
        let rest = combine_all(others);
        self.zip(rest).map(|(first, rest)| combiner(first, rest))
    }

    /// Re-evaluates `check` every `interval` until it reports true.
    ///
    /// The value is passed through unchanged. A failing check fails the computation.
    pub fn suspend_until<F, Fut>(self, mut check: F, interval: Duration) -> Computation<T>
    where
        F: FnMut(&T) -> Fut + Send + 'static,
        Fut: Future<Output = ServiceResult<bool>> + Send + 'static,
    {
        Computation::from_future(async move {
            let value = self.inner.await?;
            loop {
                if check(&value).await? {
                    return Ok(value);
                }
                tokio::time::sleep(interval).await;
            }
        })
    }

    /// Fails with `ServiceError::Execution` when not finished within `limit`.
    pub fn with_timeout(self, limit: Duration) -> Computation<T> {
        Computation::from_future(async move {
            match tokio::time::timeout(limit, self.inner).await {
                Ok(result) => result,
                Err(_) => Err(ServiceError::execution(format!(
                    "timed out after {} ms",
                    limit.as_millis()
                ))),
            }
        })
    }
}

impl<T> IntoFuture for Computation<T> {
    type Output = ServiceResult<T>;
    type IntoFuture = BoxFuture<'static, ServiceResult<T>>;

    fn into_future(self) -> Self::IntoFuture {
        self.inner
    }
}

/// Waits for all computations; results keep the input order.
pub fn combine_all<T: Send + 'static>(list: Vec<Computation<T>>) -> Computation<Vec<T>> {
    Computation::from_future(try_join_all(list.into_iter().map(|c| c.inner)))
}

struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}
