//! EngineBuilder - ServiceEngine の構築とワイヤリング
//!
//! # 学習ポイント
//! - Builder パターンの実装
//! - 起動時検証（Fail-fast 設計）
//! - 既定値：SystemClock / UlidGenerator / NoopNotificationSink / EngineConfig::default()

use std::sync::Arc;

use crate::app::config::EngineConfig;
use crate::app::engine::ServiceEngine;
use crate::app::processor::ServiceProcessor;
use crate::app::registry::{ProcessorKey, ProcessorRegistry};
use crate::app::throttle::ResourceThrottle;
use crate::domain::ServiceError;
use crate::ports::{
    Clock, IdGenerator, NoopNotificationSink, NotificationSink, ServiceStore, SystemClock,
    UlidGenerator,
};

/// EngineBuilder は ServiceEngine を構築
///
/// # 使用例
/// ```ignore
/// let engine = EngineBuilder::new(store)
///     .register(Arc::new(SleepProcessor))?
///     .expect_processors(&[("sleep", "1")])
///     .build()?;
/// ```
///
/// # Fail-fast 設計
/// - expect_processors() で期待される (name, version) を登録
/// - build() 時に「期待集合 ⊆ 登録済み集合」をチェック
/// - 不足があれば BuildError を返す
pub struct EngineBuilder {
    store: Arc<dyn ServiceStore>,
    registry: ProcessorRegistry,
    expected: Option<Vec<ProcessorKey>>,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
    notifications: Arc<dyn NotificationSink>,
    config: EngineConfig,
}

/// BuildError は engine 構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing processors: {0:?}. These processors were expected but not registered.")]
    MissingProcessors(Vec<String>),

    #[error(transparent)]
    Registry(#[from] ServiceError),
}

impl EngineBuilder {
    pub fn new(store: Arc<dyn ServiceStore>) -> Self {
        Self {
            store,
            registry: ProcessorRegistry::new(),
            expected: None,
            clock: None,
            ids: None,
            notifications: Arc::new(NoopNotificationSink),
            config: EngineConfig::default(),
        }
    }

    /// Processor を登録。同じ (name, version) の二重登録はエラー。
    pub fn register(mut self, processor: Arc<dyn ServiceProcessor>) -> Result<Self, BuildError> {
        self.registry.register(processor)?;
        Ok(self)
    }

    /// 期待される (name, version) のリストを設定
    pub fn expect_processors(mut self, processors: &[(&str, &str)]) -> Self {
        self.expected = Some(
            processors
                .iter()
                .map(|(name, version)| ProcessorKey::new(*name, *version))
                .collect(),
        );
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn with_notification_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.notifications = sink;
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// # 検証
    /// - expect_processors() の (name, version) が全て登録されているかチェック
    /// - 不足があれば BuildError::MissingProcessors を返す
    pub fn build(self) -> Result<ServiceEngine, BuildError> {
        if let Some(expected) = &self.expected {
            let missing: Vec<String> = expected
                .iter()
                .filter(|key| !self.registry.contains(key))
                .map(ToString::to_string)
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingProcessors(missing));
            }
        }

        let clock: Arc<dyn Clock> = match self.clock {
            Some(clock) => clock,
            None => Arc::new(SystemClock),
        };
        let ids: Arc<dyn IdGenerator> = match self.ids {
            Some(ids) => ids,
            None => Arc::new(UlidGenerator::new(clock.clone())),
        };
        let throttle = ResourceThrottle::new(&self.config.resource_capacities);

        Ok(ServiceEngine::from_parts(
            self.store,
            self.registry,
            throttle,
            self.notifications,
            ids,
            clock,
            self.config,
        ))
    }
}
