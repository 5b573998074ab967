// ==========================================
// 血液履约编排核心 - 外部协作方接口
// ==========================================
// 职责: 地理/ETA、通知、运输、审计 四类窄接口
// 说明: 引擎只依赖 trait，本地实现用于单机部署与测试
// ==========================================

pub mod audit;
pub mod error;
pub mod geo;
pub mod notifier;
pub mod transport;

pub use audit::{AuditSink, NoOpAuditSink};
pub use error::{IntegrationError, IntegrationResult};
pub use geo::{
    estimate_travel, GeoProvider, LocalGeoProvider, NearbyPlace, ResilientGeoProvider,
    TravelEstimate, TravelStatus,
};
pub use notifier::{
    Notification, NotificationPriority, NotificationType, Notifier, RecordingNotifier,
    TracingNotifier,
};
pub use transport::{DeliveryOrder, LocalTransportScheduler, TransportScheduler};
