//! skein-core
//!
//! Core building blocks for the skein service orchestration engine.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, record, state, update, hierarchy, errors, events, notification）
//! - **ports**: 抽象化レイヤー（ServiceStore, NotificationSink, Clock, IdGenerator）
//! - **app**: アプリケーションロジック（engine, builder, worker_loop, claim, hierarchy, archiver, ...）
//! - **impls**: 実装（InMemoryServiceStore など開発用）

pub mod app;
pub mod domain;
pub mod impls;
pub mod ports;
