//! NotificationSink port - ライフサイクル通知の送信先
//!
//! fire-and-forget。送信の失敗は engine の処理に影響させない。
//! 順序の保証は「同じレコードのイベント順」まで。

use async_trait::async_trait;

use crate::domain::Notification;

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, notification: Notification);
}

/// 何もしない
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotificationSink;

#[async_trait]
impl NotificationSink for NoopNotificationSink {
    async fn notify(&self, _notification: Notification) {}
}
