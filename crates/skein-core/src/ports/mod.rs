//! Ports - 抽象化レイヤー
//!
//! このモジュールは Hexagonal Architecture の「ポート」を定義します。
//! 各 trait は外部システム（document store、通知先など）への
//! インターフェースを提供し、実装の詳細を隠蔽します。
//!
//! # 設計原則
//! - ServiceStore が source of truth（正本）
//! - worker 間の調整は store の条件付き更新だけで行う
//! - 通知は fire-and-forget

pub mod clock;
pub mod id_generator;
pub mod notification_sink;
pub mod service_store;

// 主要な trait を再エクスポート
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::notification_sink::{NoopNotificationSink, NotificationSink};
pub use self::service_store::{QueueFilter, ServicePattern, ServiceStore};
