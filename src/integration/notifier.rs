// ==========================================
// 血液履约编排核心 - 通知分发
// ==========================================
// 约定: fire-and-forget，尽力送达；发送失败不回滚业务状态
// ==========================================

use crate::domain::facility::Recipient;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    DonorRequest,
    DonorMobilizationCancelled,
    AppointmentConfirmed,
    CollegeEscalation,
    DeliveryScheduled,
    DeliveryCompleted,
    RequestFulfilled,
    RequestUnfulfilled,
    RequestExpired,
    RequestCancelled,
    ReservationExpired,
    StockExpired,
    RedistributionSuggestion,
}

impl NotificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationType::DonorRequest => "donor_request",
            NotificationType::DonorMobilizationCancelled => "donor_mobilization_cancelled",
            NotificationType::AppointmentConfirmed => "appointment_confirmed",
            NotificationType::CollegeEscalation => "college_escalation",
            NotificationType::DeliveryScheduled => "delivery_scheduled",
            NotificationType::DeliveryCompleted => "delivery_completed",
            NotificationType::RequestFulfilled => "request_fulfilled",
            NotificationType::RequestUnfulfilled => "request_unfulfilled",
            NotificationType::RequestExpired => "request_expired",
            NotificationType::RequestCancelled => "request_cancelled",
            NotificationType::ReservationExpired => "reservation_expired",
            NotificationType::StockExpired => "stock_expired",
            NotificationType::RedistributionSuggestion => "redistribution_suggestion",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationPriority {
    Low,
    Normal,
    High,
    Urgent,
}

/// 一条通知
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub recipient: Recipient,
    pub notification_type: NotificationType,
    pub title: String,
    pub message: String,
    /// 关联实体（通常为 request_id）
    pub related_entity: Option<String>,
    pub priority: NotificationPriority,
}

impl Notification {
    pub fn new(
        recipient: Recipient,
        notification_type: NotificationType,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            recipient,
            notification_type,
            title: title.into(),
            message: message.into(),
            related_entity: None,
            priority: NotificationPriority::Normal,
        }
    }

    pub fn related_to(mut self, entity_id: impl Into<String>) -> Self {
        self.related_entity = Some(entity_id.into());
        self
    }

    pub fn with_priority(mut self, priority: NotificationPriority) -> Self {
        self.priority = priority;
        self
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: Notification);
}

// ==========================================
// TracingNotifier - 仅写日志（单机部署默认）
// ==========================================
#[derive(Debug, Clone, Default)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, notification: Notification) {
        tracing::info!(
            recipient = %notification.recipient,
            notification_type = notification.notification_type.as_str(),
            related_entity = ?notification.related_entity,
            priority = ?notification.priority,
            title = %notification.title,
            "发送通知"
        );
    }
}

// ==========================================
// RecordingNotifier - 记录全部通知（测试/回放）
// ==========================================
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().map(|v| v.clone()).unwrap_or_default()
    }

    pub fn count_of(&self, notification_type: NotificationType) -> usize {
        self.sent()
            .iter()
            .filter(|n| n.notification_type == notification_type)
            .count()
    }

    pub fn clear(&self) {
        if let Ok(mut sent) = self.sent.lock() {
            sent.clear();
        }
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: Notification) {
        match self.sent.lock() {
            Ok(mut sent) => sent.push(notification),
            Err(e) => tracing::warn!(error = %e, "通知记录锁获取失败"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_recording_notifier_counts_by_type() {
        let notifier = RecordingNotifier::new();
        notifier
            .notify(
                Notification::new(
                    Recipient::Donor("D1".to_string()),
                    NotificationType::DonorRequest,
                    "紧急献血邀请",
                    "O+ 需求",
                )
                .related_to("R1")
                .with_priority(NotificationPriority::Urgent),
            )
            .await;
        notifier
            .notify(Notification::new(
                Recipient::Hospital("H1".to_string()),
                NotificationType::ReservationExpired,
                "预留过期",
                "单元已释放",
            ))
            .await;

        assert_eq!(notifier.count_of(NotificationType::DonorRequest), 1);
        assert_eq!(notifier.sent()[0].related_entity.as_deref(), Some("R1"));
        notifier.clear();
        assert!(notifier.sent().is_empty());
    }
}
