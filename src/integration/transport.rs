// ==========================================
// 血液履约编排核心 - 运输调度接口
// ==========================================
// 回调: 运输系统送达后调用 FulfillmentApi::record_delivery(delivery_id)
// ==========================================

use crate::integration::error::IntegrationResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// 配送请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryOrder {
    pub request_id: String,
    pub facility_id: String,
    pub destination_id: String,
    pub unit_ids: Vec<String>,
    pub eta_minutes: u32,
}

#[async_trait]
pub trait TransportScheduler: Send + Sync {
    /// 返回 delivery_id
    async fn schedule_delivery(&self, order: &DeliveryOrder) -> IntegrationResult<String>;
}

/// 本地调度：只生成配送号并记录日志
#[derive(Debug, Clone, Default)]
pub struct LocalTransportScheduler;

#[async_trait]
impl TransportScheduler for LocalTransportScheduler {
    async fn schedule_delivery(&self, order: &DeliveryOrder) -> IntegrationResult<String> {
        let delivery_id = uuid::Uuid::new_v4().to_string();
        tracing::info!(
            delivery_id = %delivery_id,
            request_id = %order.request_id,
            facility_id = %order.facility_id,
            destination_id = %order.destination_id,
            units = order.unit_ids.len(),
            eta_minutes = order.eta_minutes,
            "已安排配送"
        );
        Ok(delivery_id)
    }
}
