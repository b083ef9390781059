//! NotificationSink の実装
//!
//! - LoggingNotificationSink: tracing の info! に流すだけ
//! - CollectingNotificationSink: 受け取った通知をメモリに溜める（テスト・デモ用）

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::info;

use crate::domain::Notification;
use crate::ports::NotificationSink;

#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingNotificationSink;

#[async_trait]
impl NotificationSink for LoggingNotificationSink {
    async fn notify(&self, notification: Notification) {
        info!(
            service_id = %notification.service_id,
            event = %notification.event_name,
            stage = %notification.stage,
            data = ?notification.data,
            "notification"
        );
    }
}

#[derive(Debug, Default)]
pub struct CollectingNotificationSink {
    received: Mutex<Vec<Notification>>,
}

impl CollectingNotificationSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn received(&self) -> Vec<Notification> {
        self.received.lock().await.clone()
    }
}

#[async_trait]
impl NotificationSink for CollectingNotificationSink {
    async fn notify(&self, notification: Notification) {
        self.received.lock().await.push(notification);
    }
}
