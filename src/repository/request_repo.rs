// ==========================================
// 血液履约编排核心 - 用血需求数据仓储
// ==========================================
// 红线: 计数器 (reserved_units / issued_units) 只通过原子增量更新
// 红线: save_progress 只写决策记录，状态只走 CAS
// ==========================================

use crate::db::fmt_ts;
use crate::domain::request::{BloodRequest, FulfillmentDetails, GeoPoint};
use crate::domain::types::{BloodComponent, BloodGroup, RequestStatus, UrgencyTier};
use crate::repository::error::{RepositoryError, RepositoryResult};
use crate::repository::row_mapping::{conversion_error, enum_col, opt_ts_col, ts_col, u32_col};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

const REQUEST_COLUMNS: &str = r#"
    request_id, hospital_id, lat, lon, blood_group, component, units, urgency, deadline,
    status, reserved_units, issued_units, fulfillment_details_json, outcome_reason,
    created_at, updated_at
"#;

fn map_request(row: &Row<'_>) -> rusqlite::Result<BloodRequest> {
    let details_raw: String = row.get(12)?;
    let fulfillment_details: FulfillmentDetails = serde_json::from_str(&details_raw)
        .map_err(|e| conversion_error(12, format!("fulfillment_details 解析失败: {}", e)))?;

    Ok(BloodRequest {
        request_id: row.get(0)?,
        hospital_id: row.get(1)?,
        location: GeoPoint::new(row.get(2)?, row.get(3)?),
        blood_group: enum_col(row, 4, BloodGroup::parse)?,
        component: enum_col(row, 5, BloodComponent::parse)?,
        units: u32_col(row, 6)?,
        urgency: enum_col(row, 7, UrgencyTier::parse)?,
        deadline: ts_col(row, 8)?,
        status: enum_col(row, 9, RequestStatus::parse)?,
        reserved_units: u32_col(row, 10)?,
        issued_units: u32_col(row, 11)?,
        fulfillment_details,
        outcome_reason: row.get(13)?,
        created_at: ts_col(row, 14)?,
        updated_at: ts_col(row, 15)?,
    })
}

// ==========================================
// DeliveryRecord - 配送记录（transport 回调映射回需求）
// ==========================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub delivery_id: String,
    pub request_id: String,
    pub facility_id: String,
    pub destination_id: String,
    pub unit_ids: Vec<String>,
    pub eta_minutes: u32,
    pub status: String, // scheduled / delivered
    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
}

// ==========================================
// RequestRepository - 用血需求仓储
// ==========================================
pub struct RequestRepository {
    conn: Arc<Mutex<Connection>>,
}

impl RequestRepository {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    fn get_conn(&self) -> RepositoryResult<std::sync::MutexGuard<Connection>> {
        self.conn
            .lock()
            .map_err(|e| RepositoryError::LockError(e.to_string()))
    }

    // ==========================================
    // 写入操作
    // ==========================================

    pub fn insert(&self, request: &BloodRequest) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        let details_json = serde_json::to_string(&request.fulfillment_details)?;

        conn.execute(
            r#"
            INSERT INTO blood_request (
                request_id, hospital_id, lat, lon, blood_group, component, units, urgency,
                deadline, status, reserved_units, issued_units, fulfillment_details_json,
                outcome_reason, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
            "#,
            params![
                request.request_id,
                request.hospital_id,
                request.location.lat,
                request.location.lon,
                request.blood_group.as_str(),
                request.component.as_str(),
                request.units,
                request.urgency.as_str(),
                fmt_ts(&request.deadline),
                request.status.as_str(),
                request.reserved_units,
                request.issued_units,
                details_json,
                request.outcome_reason,
                fmt_ts(&request.created_at),
                fmt_ts(&request.updated_at),
            ],
        )?;
        Ok(())
    }

    /// 保存决策记录（状态走 compare_and_set_status，计数器走 adjust_counters）
    pub fn save_progress(&self, request: &BloodRequest) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        let details_json = serde_json::to_string(&request.fulfillment_details)?;

        let affected = conn.execute(
            r#"
            UPDATE blood_request
            SET fulfillment_details_json = ?1, updated_at = ?2
            WHERE request_id = ?3
            "#,
            params![details_json, fmt_ts(&request.updated_at), request.request_id],
        )?;

        if affected == 0 {
            return Err(RepositoryError::not_found("blood_request", &request.request_id));
        }
        Ok(())
    }

    /// 原子调整计数器（结果不小于 0）
    pub fn adjust_counters(
        &self,
        request_id: &str,
        reserved_delta: i64,
        issued_delta: i64,
        now: DateTime<Utc>,
    ) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        let affected = conn.execute(
            r#"
            UPDATE blood_request
            SET reserved_units = MAX(0, reserved_units + ?1),
                issued_units = MAX(0, issued_units + ?2),
                updated_at = ?3
            WHERE request_id = ?4
            "#,
            params![reserved_delta, issued_delta, fmt_ts(&now), request_id],
        )?;

        if affected == 0 {
            return Err(RepositoryError::not_found("blood_request", request_id));
        }
        Ok(())
    }

    /// 以库存实况校准 reserved_units
    pub fn set_reserved_units(
        &self,
        request_id: &str,
        reserved_units: u32,
        now: DateTime<Utc>,
    ) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "UPDATE blood_request SET reserved_units = ?1, updated_at = ?2 WHERE request_id = ?3",
            params![reserved_units, fmt_ts(&now), request_id],
        )?;
        Ok(())
    }

    /// 状态 CAS：当前状态为 expected 时写入 to + 结果原因，返回是否生效
    pub fn compare_and_set_status(
        &self,
        request_id: &str,
        expected: RequestStatus,
        to: RequestStatus,
        outcome_reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> RepositoryResult<bool> {
        let conn = self.get_conn()?;
        let affected = conn.execute(
            r#"
            UPDATE blood_request
            SET status = ?1, outcome_reason = COALESCE(?2, outcome_reason), updated_at = ?3
            WHERE request_id = ?4 AND status = ?5
            "#,
            params![
                to.as_str(),
                outcome_reason,
                fmt_ts(&now),
                request_id,
                expected.as_str()
            ],
        )?;
        Ok(affected > 0)
    }

    // ==========================================
    // 查询操作
    // ==========================================

    pub fn find_by_id(&self, request_id: &str) -> RepositoryResult<Option<BloodRequest>> {
        let conn = self.get_conn()?;
        let sql = format!("SELECT {} FROM blood_request WHERE request_id = ?1", REQUEST_COLUMNS);
        let request = conn.query_row(&sql, params![request_id], map_request).optional()?;
        Ok(request)
    }

    /// 查询必须存在的需求
    pub fn get(&self, request_id: &str) -> RepositoryResult<BloodRequest> {
        self.find_by_id(request_id)?
            .ok_or_else(|| RepositoryError::not_found("blood_request", request_id))
    }

    /// 监控扫描集合
    ///
    /// 状态 ∈ {processing, partially_fulfilled}，且满足以下之一：
    /// - 创建时间在窗口内（新进入监控）
    /// - 已过截止时间 / 已超过最终超时（需要退出监控的滞留需求）
    pub fn find_for_monitor(
        &self,
        window_start: DateTime<Utc>,
        final_timeout_cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> RepositoryResult<Vec<BloodRequest>> {
        let conn = self.get_conn()?;
        let sql = format!(
            r#"
            SELECT {} FROM blood_request
            WHERE status IN ('processing', 'partially_fulfilled')
              AND (created_at >= ?1 OR created_at < ?2 OR deadline < ?3)
            ORDER BY created_at ASC
            "#,
            REQUEST_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let requests = stmt
            .query_map(
                params![fmt_ts(&window_start), fmt_ts(&final_timeout_cutoff), fmt_ts(&now)],
                map_request,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(requests)
    }

    // ==========================================
    // 配送记录
    // ==========================================

    pub fn insert_delivery(&self, delivery: &DeliveryRecord) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            r#"
            INSERT INTO delivery (
                delivery_id, request_id, facility_id, destination_id, unit_ids_json,
                eta_minutes, status, created_at, delivered_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                delivery.delivery_id,
                delivery.request_id,
                delivery.facility_id,
                delivery.destination_id,
                serde_json::to_string(&delivery.unit_ids)?,
                delivery.eta_minutes,
                delivery.status,
                fmt_ts(&delivery.created_at),
                delivery.delivered_at.as_ref().map(fmt_ts),
            ],
        )?;
        Ok(())
    }

    pub fn find_delivery(&self, delivery_id: &str) -> RepositoryResult<Option<DeliveryRecord>> {
        let conn = self.get_conn()?;
        let delivery = conn
            .query_row(
                r#"
                SELECT delivery_id, request_id, facility_id, destination_id, unit_ids_json,
                       eta_minutes, status, created_at, delivered_at
                FROM delivery WHERE delivery_id = ?1
                "#,
                params![delivery_id],
                |row| {
                    let unit_ids_raw: String = row.get(4)?;
                    let unit_ids: Vec<String> = serde_json::from_str(&unit_ids_raw)
                        .map_err(|e| conversion_error(4, e.to_string()))?;
                    Ok(DeliveryRecord {
                        delivery_id: row.get(0)?,
                        request_id: row.get(1)?,
                        facility_id: row.get(2)?,
                        destination_id: row.get(3)?,
                        unit_ids,
                        eta_minutes: u32_col(row, 5)?,
                        status: row.get(6)?,
                        created_at: ts_col(row, 7)?,
                        delivered_at: opt_ts_col(row, 8)?,
                    })
                },
            )
            .optional()?;
        Ok(delivery)
    }

    /// scheduled → delivered（CAS，重复回调返回 false）
    pub fn mark_delivery_delivered(
        &self,
        delivery_id: &str,
        now: DateTime<Utc>,
    ) -> RepositoryResult<bool> {
        let conn = self.get_conn()?;
        let affected = conn.execute(
            r#"
            UPDATE delivery SET status = 'delivered', delivered_at = ?1
            WHERE delivery_id = ?2 AND status = 'scheduled'
            "#,
            params![fmt_ts(&now), delivery_id],
        )?;
        Ok(affected > 0)
    }
}
