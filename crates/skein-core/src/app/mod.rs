//! App - アプリケーション層
//!
//! このモジュールは、ports を組み合わせてアプリケーションロジックを実装します。
//!
//! # 主要コンポーネント
//! - **EngineBuilder**: engine の構築とワイヤリング（fail-fast 検証つき）
//! - **ServiceEngine**: submit / cancel / restart / retire / run
//! - **WorkerLoop / WorkerGroup**: claim → run のループ
//! - **ClaimProtocol**: ロックなしの queue claim
//! - **HierarchyManager / Archiver**: hierarchy の保存・復元・アーカイブ
//! - **AdvisoryLock**: lockKey による排他
//! - **Computation**: 非同期処理の合成
//! - **ServiceProcessor / ProcessorRegistry / ResourceThrottle**: 実行バックエンドとの契約

pub mod archiver;
pub mod backoff;
pub mod builder;
pub mod claim;
pub mod computation;
pub mod config;
pub mod engine;
pub mod hierarchy;
pub mod lock;
pub mod processor;
pub mod registry;
pub mod throttle;
pub mod worker_loop;

// 主要な型を再エクスポート
pub use self::archiver::Archiver;
pub use self::backoff::RetryPolicy;
pub use self::builder::{BuildError, EngineBuilder};
pub use self::claim::ClaimProtocol;
pub use self::computation::{Computation, combine_all};
pub use self::config::{ConfigError, EngineConfig, WorkerConfig};
pub use self::engine::{EngineStats, RunOutcome, ServiceEngine};
pub use self::hierarchy::HierarchyManager;
pub use self::lock::AdvisoryLock;
pub use self::processor::{
    DependencyResult, ErrorChecker, ResolvedDependencies, ServiceProcessor,
};
pub use self::registry::{ProcessorKey, ProcessorRegistry};
pub use self::throttle::{ResourceThrottle, ThrottlePermit};
pub use self::worker_loop::{WorkerGroup, WorkerLoop};
