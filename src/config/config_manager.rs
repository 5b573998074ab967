// ==========================================
// 血液履约编排核心 - 配置管理器
// ==========================================
// 职责: 配置加载、查询、覆写管理
// 存储: config_kv 表 (key-value + scope)
// ==========================================

use crate::config::fulfillment_config::FulfillmentConfig;
use crate::db::open_sqlite_connection;
use crate::repository::error::{RepositoryError, RepositoryResult};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::json;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

// ==========================================
// ConfigManager - 配置管理器
// ==========================================
pub struct ConfigManager {
    conn: Arc<Mutex<Connection>>,
}

impl ConfigManager {
    /// 创建新的 ConfigManager 实例
    pub fn new(db_path: &str) -> RepositoryResult<Self> {
        let conn = open_sqlite_connection(db_path)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// 从已有连接创建 ConfigManager
    ///
    /// 说明：为保证连接行为一致，会对传入连接再次应用统一 PRAGMA（幂等）。
    pub fn from_connection(conn: Arc<Mutex<Connection>>) -> RepositoryResult<Self> {
        {
            let guard = conn
                .lock()
                .map_err(|e| RepositoryError::LockError(e.to_string()))?;
            crate::db::configure_sqlite_connection(&guard)?;
        }
        Ok(Self { conn })
    }

    fn get_conn(&self) -> RepositoryResult<std::sync::MutexGuard<Connection>> {
        self.conn
            .lock()
            .map_err(|e| RepositoryError::LockError(e.to_string()))
    }

    /// 读取 global scope 的配置值
    pub fn get_global_config_value(&self, key: &str) -> RepositoryResult<Option<String>> {
        let conn = self.get_conn()?;
        let value = conn
            .query_row(
                "SELECT value FROM config_kv WHERE scope_id = 'global' AND key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(value)
    }

    /// 写入 global scope 的配置值（UPSERT）
    pub fn set_global_config_value(&self, key: &str, value: &str) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            r#"
            INSERT INTO config_kv (scope_id, key, value) VALUES ('global', ?1, ?2)
            ON CONFLICT(scope_id, key) DO UPDATE SET value = ?2, updated_at = datetime('now')
            "#,
            params![key, value],
        )?;
        Ok(())
    }

    /// 读取并解析数值配置；缺失或格式错误时回落默认值
    fn get_parsed_or<T>(&self, key: &str, default: T) -> RepositoryResult<T>
    where
        T: FromStr + Copy + std::fmt::Debug,
    {
        let raw = match self.get_global_config_value(key)? {
            Some(v) => v,
            None => return Ok(default),
        };
        match raw.trim().parse::<T>() {
            Ok(v) => Ok(v),
            Err(_) => {
                tracing::warn!(
                    config_key = key,
                    raw_value = %raw,
                    default = ?default,
                    "配置值格式错误，使用默认值"
                );
                Ok(default)
            }
        }
    }

    /// 获取所有配置的快照（JSON格式，用于审计）
    pub fn get_config_snapshot(&self) -> RepositoryResult<String> {
        let conn = self.get_conn()?;
        let mut stmt =
            conn.prepare("SELECT key, value FROM config_kv WHERE scope_id = 'global' ORDER BY key")?;

        let mut config_map: BTreeMap<String, String> = BTreeMap::new();
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        for row in rows {
            let (key, value) = row?;
            config_map.insert(key, value);
        }

        Ok(serde_json::to_string(&json!(config_map))?)
    }

    // ==========================================
    // 履约参数
    // ==========================================

    /// 组装 FulfillmentConfig（未配置项使用默认值）
    pub fn load_fulfillment_config(&self) -> RepositoryResult<FulfillmentConfig> {
        let d = FulfillmentConfig::default();

        let search_radii_km = match self.get_global_config_value(config_keys::SEARCH_RADII_KM)? {
            None => d.search_radii_km.clone(),
            Some(raw) => {
                let radii: Vec<f64> = raw
                    .split(',')
                    .filter_map(|s| s.trim().parse::<f64>().ok())
                    .filter(|r| *r > 0.0)
                    .collect();
                if radii.is_empty() {
                    tracing::warn!(
                        config_key = config_keys::SEARCH_RADII_KM,
                        raw_value = %raw,
                        "搜索半径配置无效，使用默认值"
                    );
                    d.search_radii_km.clone()
                } else {
                    radii
                }
            }
        };

        Ok(FulfillmentConfig {
            search_radii_km,
            eta_ceiling_critical_minutes: self
                .get_parsed_or(config_keys::ETA_CEILING_CRITICAL, d.eta_ceiling_critical_minutes)?,
            eta_ceiling_high_minutes: self
                .get_parsed_or(config_keys::ETA_CEILING_HIGH, d.eta_ceiling_high_minutes)?,
            eta_ceiling_medium_minutes: self
                .get_parsed_or(config_keys::ETA_CEILING_MEDIUM, d.eta_ceiling_medium_minutes)?,
            eta_ceiling_low_minutes: self
                .get_parsed_or(config_keys::ETA_CEILING_LOW, d.eta_ceiling_low_minutes)?,
            reservation_ttl_minutes: self
                .get_parsed_or(config_keys::RESERVATION_TTL_MINUTES, d.reservation_ttl_minutes)?,
            donor_cooldown_days: self
                .get_parsed_or(config_keys::DONOR_COOLDOWN_DAYS, d.donor_cooldown_days)?,
            max_donor_notifications: self
                .get_parsed_or(config_keys::MAX_DONOR_NOTIFICATIONS, d.max_donor_notifications)?,
            appointment_lead_minutes: self
                .get_parsed_or(config_keys::APPOINTMENT_LEAD_MINUTES, d.appointment_lead_minutes)?,
            donor_failure_timeout_minutes: self.get_parsed_or(
                config_keys::DONOR_FAILURE_TIMEOUT_MINUTES,
                d.donor_failure_timeout_minutes,
            )?,
            no_show_grace_minutes: self
                .get_parsed_or(config_keys::NO_SHOW_GRACE_MINUTES, d.no_show_grace_minutes)?,
            final_timeout_minutes: self
                .get_parsed_or(config_keys::FINAL_TIMEOUT_MINUTES, d.final_timeout_minutes)?,
            monitor_window_hours: self
                .get_parsed_or(config_keys::MONITOR_WINDOW_HOURS, d.monitor_window_hours)?,
            monitor_interval_secs: self
                .get_parsed_or(config_keys::MONITOR_INTERVAL_SECS, d.monitor_interval_secs)?,
            reaper_interval_secs: self
                .get_parsed_or(config_keys::REAPER_INTERVAL_SECS, d.reaper_interval_secs)?,
            reaper_start_delay_secs: self
                .get_parsed_or(config_keys::REAPER_START_DELAY_SECS, d.reaper_start_delay_secs)?,
            surplus_threshold: self
                .get_parsed_or(config_keys::SURPLUS_THRESHOLD, d.surplus_threshold)?,
            shortage_threshold: self
                .get_parsed_or(config_keys::SHORTAGE_THRESHOLD, d.shortage_threshold)?,
            college_radius_km: self
                .get_parsed_or(config_keys::COLLEGE_RADIUS_KM, d.college_radius_km)?,
            max_colleges: self.get_parsed_or(config_keys::MAX_COLLEGES, d.max_colleges)?,
            external_timeout_ms: self
                .get_parsed_or(config_keys::EXTERNAL_TIMEOUT_MS, d.external_timeout_ms)?,
            average_speed_kmh: self
                .get_parsed_or(config_keys::AVERAGE_SPEED_KMH, d.average_speed_kmh)?,
        })
    }
}

// ==========================================
// 配置键常量
// ==========================================
pub mod config_keys {
    // 血站检索
    pub const SEARCH_RADII_KM: &str = "search_radii_km"; // 逗号分隔，如 "5,10,25,50"
    pub const ETA_CEILING_CRITICAL: &str = "eta_ceiling_critical_minutes";
    pub const ETA_CEILING_HIGH: &str = "eta_ceiling_high_minutes";
    pub const ETA_CEILING_MEDIUM: &str = "eta_ceiling_medium_minutes";
    pub const ETA_CEILING_LOW: &str = "eta_ceiling_low_minutes";

    // 库存锁
    pub const RESERVATION_TTL_MINUTES: &str = "reservation_ttl_minutes";

    // 献血者
    pub const DONOR_COOLDOWN_DAYS: &str = "donor_cooldown_days";
    pub const MAX_DONOR_NOTIFICATIONS: &str = "max_donor_notifications";
    pub const APPOINTMENT_LEAD_MINUTES: &str = "appointment_lead_minutes";

    // 监控
    pub const DONOR_FAILURE_TIMEOUT_MINUTES: &str = "donor_failure_timeout_minutes";
    pub const NO_SHOW_GRACE_MINUTES: &str = "no_show_grace_minutes";
    pub const FINAL_TIMEOUT_MINUTES: &str = "final_timeout_minutes";
    pub const MONITOR_WINDOW_HOURS: &str = "monitor_window_hours";
    pub const MONITOR_INTERVAL_SECS: &str = "monitor_interval_secs";

    // 清道夫
    pub const REAPER_INTERVAL_SECS: &str = "reaper_interval_secs";
    pub const REAPER_START_DELAY_SECS: &str = "reaper_start_delay_secs";
    pub const SURPLUS_THRESHOLD: &str = "surplus_threshold";
    pub const SHORTAGE_THRESHOLD: &str = "shortage_threshold";

    // 高校升级
    pub const COLLEGE_RADIUS_KM: &str = "college_radius_km";
    pub const MAX_COLLEGES: &str = "max_colleges";

    // 外部服务
    pub const EXTERNAL_TIMEOUT_MS: &str = "external_timeout_ms";
    pub const AVERAGE_SPEED_KMH: &str = "average_speed_kmh";
}
