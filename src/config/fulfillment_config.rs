// ==========================================
// 血液履约编排核心 - 履约参数
// ==========================================
// 职责: 承载全部时限与阈值，引擎/监控/清道夫只读此结构
// ==========================================

use crate::domain::types::UrgencyTier;
use chrono::Duration;
use serde::{Deserialize, Serialize};

/// 履约参数快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FulfillmentConfig {
    /// 血站搜索半径（公里，按顺序逐级扩大）
    pub search_radii_km: Vec<f64>,

    // 各紧急度的 ETA 上限（分钟）
    pub eta_ceiling_critical_minutes: u32,
    pub eta_ceiling_high_minutes: u32,
    pub eta_ceiling_medium_minutes: u32,
    pub eta_ceiling_low_minutes: u32,

    pub reservation_ttl_minutes: i64,
    pub donor_cooldown_days: i64,
    pub max_donor_notifications: usize,
    pub appointment_lead_minutes: i64,

    // 监控
    pub donor_failure_timeout_minutes: i64,
    pub no_show_grace_minutes: i64,
    pub final_timeout_minutes: i64,
    pub monitor_window_hours: i64,
    pub monitor_interval_secs: u64,

    // 清道夫
    pub reaper_interval_secs: u64,
    pub reaper_start_delay_secs: u64,
    pub surplus_threshold: u32,
    pub shortage_threshold: u32,

    // 高校升级
    pub college_radius_km: f64,
    pub max_colleges: usize,

    // 外部服务
    pub external_timeout_ms: u64,
    pub average_speed_kmh: f64,
}

impl Default for FulfillmentConfig {
    fn default() -> Self {
        Self {
            search_radii_km: vec![5.0, 10.0, 25.0, 50.0],
            eta_ceiling_critical_minutes: 30,
            eta_ceiling_high_minutes: 60,
            eta_ceiling_medium_minutes: 120,
            eta_ceiling_low_minutes: 240,
            reservation_ttl_minutes: 30,
            donor_cooldown_days: 90,
            max_donor_notifications: 20,
            appointment_lead_minutes: 60,
            donor_failure_timeout_minutes: 45,
            no_show_grace_minutes: 60,
            final_timeout_minutes: 180,
            monitor_window_hours: 4,
            monitor_interval_secs: 120,
            reaper_interval_secs: 3600,
            reaper_start_delay_secs: 30,
            surplus_threshold: 50,
            shortage_threshold: 10,
            college_radius_km: 10.0,
            max_colleges: 3,
            external_timeout_ms: 5_000,
            average_speed_kmh: 40.0,
        }
    }
}

impl FulfillmentConfig {
    /// 紧急度对应的 ETA 上限（分钟）
    pub fn eta_ceiling(&self, urgency: UrgencyTier) -> u32 {
        match urgency {
            UrgencyTier::Critical => self.eta_ceiling_critical_minutes,
            UrgencyTier::High => self.eta_ceiling_high_minutes,
            UrgencyTier::Medium => self.eta_ceiling_medium_minutes,
            UrgencyTier::Low => self.eta_ceiling_low_minutes,
        }
    }

    pub fn reservation_ttl(&self) -> Duration {
        Duration::minutes(self.reservation_ttl_minutes)
    }

    pub fn donor_failure_timeout(&self) -> Duration {
        Duration::minutes(self.donor_failure_timeout_minutes)
    }

    pub fn no_show_grace(&self) -> Duration {
        Duration::minutes(self.no_show_grace_minutes)
    }

    pub fn final_timeout(&self) -> Duration {
        Duration::minutes(self.final_timeout_minutes)
    }

    pub fn monitor_window(&self) -> Duration {
        Duration::hours(self.monitor_window_hours)
    }

    pub fn appointment_lead(&self) -> Duration {
        Duration::minutes(self.appointment_lead_minutes)
    }

    pub fn external_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.external_timeout_ms)
    }
}
