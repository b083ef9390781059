//! Impls - 実装（開発用・テスト用）
//!
//! このモジュールには ports の実装を含めます。
//!
//! # 含まれる実装
//! - **InMemoryServiceStore**: テスト・デモ用の document store（アーカイブ用にも使える）
//! - **LoggingNotificationSink** / **CollectingNotificationSink**
//!
//! # 本番用実装
//! 本番用の document store 実装は別クレートに配置します。

pub mod inmem_store;
pub mod notification;

// 主要な型を再エクスポート
pub use self::inmem_store::InMemoryServiceStore;
pub use self::notification::{CollectingNotificationSink, LoggingNotificationSink};
