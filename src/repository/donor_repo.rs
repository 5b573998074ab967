// ==========================================
// 血液履约编排核心 - 献血者数据仓储
// ==========================================
// 职责: donor / donor_appointment / donor_response / donor_invitation 四张表
// 红线: donor_response (request_id, donor_id) 唯一，重复响应由主键拒绝
// 红线: donor_invitation (request_id, donor_id, channel) 唯一，同渠道不重复邀请
// ==========================================

use crate::db::{fmt_date, fmt_ts};
use crate::domain::donor::{DonorAppointment, DonorCandidate, DonorResponse, InvitationChannel};
use crate::domain::request::GeoPoint;
use crate::domain::types::{
    AppointmentStatus, Availability, BloodGroup, DonorResponseKind, EligibilityStatus,
};
use crate::repository::error::{RepositoryError, RepositoryResult};
use crate::repository::row_mapping::{enum_col, opt_date_col, opt_ts_col, ts_col};
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

const DONOR_COLUMNS: &str = r#"
    donor_id, name, blood_group, eligibility, availability, last_donation_date, lat, lon, college_id
"#;

const APPOINTMENT_COLUMNS: &str = r#"
    appointment_id, request_id, donor_id, facility_id, scheduled_at, status, created_at, completed_at
"#;

fn map_donor(row: &Row<'_>) -> rusqlite::Result<DonorCandidate> {
    Ok(DonorCandidate {
        donor_id: row.get(0)?,
        name: row.get(1)?,
        blood_group: enum_col(row, 2, BloodGroup::parse)?,
        eligibility: enum_col(row, 3, EligibilityStatus::parse)?,
        availability: enum_col(row, 4, Availability::parse)?,
        last_donation_date: opt_date_col(row, 5)?,
        location: GeoPoint::new(row.get(6)?, row.get(7)?),
        college_id: row.get(8)?,
    })
}

fn map_appointment(row: &Row<'_>) -> rusqlite::Result<DonorAppointment> {
    Ok(DonorAppointment {
        appointment_id: row.get(0)?,
        request_id: row.get(1)?,
        donor_id: row.get(2)?,
        facility_id: row.get(3)?,
        scheduled_at: ts_col(row, 4)?,
        status: enum_col(row, 5, AppointmentStatus::parse)?,
        created_at: ts_col(row, 6)?,
        completed_at: opt_ts_col(row, 7)?,
    })
}

// ==========================================
// DonorRepository - 献血者仓储
// ==========================================
pub struct DonorRepository {
    conn: Arc<Mutex<Connection>>,
}

impl DonorRepository {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    fn get_conn(&self) -> RepositoryResult<std::sync::MutexGuard<Connection>> {
        self.conn
            .lock()
            .map_err(|e| RepositoryError::LockError(e.to_string()))
    }

    // ==========================================
    // 献血者
    // ==========================================

    pub fn insert_donor(&self, donor: &DonorCandidate) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            r#"
            INSERT OR REPLACE INTO donor (
                donor_id, name, blood_group, eligibility, availability, last_donation_date,
                lat, lon, college_id
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                donor.donor_id,
                donor.name,
                donor.blood_group.as_str(),
                donor.eligibility.as_str(),
                donor.availability.as_str(),
                donor.last_donation_date.as_ref().map(fmt_date),
                donor.location.lat,
                donor.location.lon,
                donor.college_id,
            ],
        )?;
        Ok(())
    }

    pub fn find_donor(&self, donor_id: &str) -> RepositoryResult<Option<DonorCandidate>> {
        let conn = self.get_conn()?;
        let sql = format!("SELECT {} FROM donor WHERE donor_id = ?1", DONOR_COLUMNS);
        let donor = conn.query_row(&sql, params![donor_id], map_donor).optional()?;
        Ok(donor)
    }

    /// 按血型集合查询献血者（资格/冷却期过滤由引擎完成）
    pub fn find_by_groups(&self, groups: &[BloodGroup]) -> RepositoryResult<Vec<DonorCandidate>> {
        if groups.is_empty() {
            return Ok(Vec::new());
        }

        let conn = self.get_conn()?;
        let placeholders = (1..=groups.len())
            .map(|i| format!("?{}", i))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {} FROM donor WHERE blood_group IN ({}) ORDER BY donor_id",
            DONOR_COLUMNS, placeholders
        );
        let mut stmt = conn.prepare(&sql)?;
        let donors = stmt
            .query_map(params_from_iter(groups.iter().map(|g| g.as_str())), map_donor)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(donors)
    }

    // ==========================================
    // 预约
    // ==========================================

    pub fn insert_appointment(&self, appointment: &DonorAppointment) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            r#"
            INSERT INTO donor_appointment (
                appointment_id, request_id, donor_id, facility_id, scheduled_at, status,
                created_at, completed_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                appointment.appointment_id,
                appointment.request_id,
                appointment.donor_id,
                appointment.facility_id,
                fmt_ts(&appointment.scheduled_at),
                appointment.status.as_str(),
                fmt_ts(&appointment.created_at),
                appointment.completed_at.as_ref().map(fmt_ts),
            ],
        )?;
        Ok(())
    }

    pub fn find_appointment(&self, appointment_id: &str) -> RepositoryResult<Option<DonorAppointment>> {
        let conn = self.get_conn()?;
        let sql = format!(
            "SELECT {} FROM donor_appointment WHERE appointment_id = ?1",
            APPOINTMENT_COLUMNS
        );
        let appointment = conn
            .query_row(&sql, params![appointment_id], map_appointment)
            .optional()?;
        Ok(appointment)
    }

    pub fn find_appointments_by_request(&self, request_id: &str) -> RepositoryResult<Vec<DonorAppointment>> {
        let conn = self.get_conn()?;
        let sql = format!(
            "SELECT {} FROM donor_appointment WHERE request_id = ?1 ORDER BY scheduled_at ASC",
            APPOINTMENT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let appointments = stmt
            .query_map(params![request_id], map_appointment)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(appointments)
    }

    /// 已确认但预约时间早于 cutoff 且未完成的预约（爽约候选）
    pub fn find_overdue_confirmed(
        &self,
        request_id: &str,
        cutoff: DateTime<Utc>,
    ) -> RepositoryResult<Vec<DonorAppointment>> {
        let conn = self.get_conn()?;
        let sql = format!(
            r#"
            SELECT {} FROM donor_appointment
            WHERE request_id = ?1 AND status = 'confirmed' AND scheduled_at < ?2
            ORDER BY scheduled_at ASC
            "#,
            APPOINTMENT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let appointments = stmt
            .query_map(params![request_id, fmt_ts(&cutoff)], map_appointment)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(appointments)
    }

    /// 预约状态 CAS: 仅当当前状态在 from 中时更新
    pub fn transition_appointment(
        &self,
        appointment_id: &str,
        from: &[AppointmentStatus],
        to: AppointmentStatus,
        completed_at: Option<DateTime<Utc>>,
    ) -> RepositoryResult<bool> {
        let conn = self.get_conn()?;
        let current: Option<String> = conn
            .query_row(
                "SELECT status FROM donor_appointment WHERE appointment_id = ?1",
                params![appointment_id],
                |row| row.get(0),
            )
            .optional()?;

        let current = match current.as_deref().and_then(AppointmentStatus::parse) {
            Some(status) => status,
            None => return Err(RepositoryError::not_found("donor_appointment", appointment_id)),
        };
        if !from.contains(&current) {
            return Ok(false);
        }

        let affected = conn.execute(
            r#"
            UPDATE donor_appointment SET status = ?1, completed_at = COALESCE(?2, completed_at)
            WHERE appointment_id = ?3 AND status = ?4
            "#,
            params![
                to.as_str(),
                completed_at.as_ref().map(fmt_ts),
                appointment_id,
                current.as_str()
            ],
        )?;
        Ok(affected > 0)
    }

    // ==========================================
    // 响应
    // ==========================================

    /// 写入响应；重复 (request_id, donor_id) 返回 UniqueConstraintViolation
    pub fn insert_response(&self, response: &DonorResponse) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            r#"
            INSERT INTO donor_response (request_id, donor_id, response, reason, responded_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                response.request_id,
                response.donor_id,
                response.response.as_str(),
                response.reason,
                fmt_ts(&response.responded_at),
            ],
        )?;
        Ok(())
    }

    pub fn find_response(&self, request_id: &str, donor_id: &str) -> RepositoryResult<Option<DonorResponse>> {
        let conn = self.get_conn()?;
        let response = conn
            .query_row(
                r#"
                SELECT request_id, donor_id, response, reason, responded_at
                FROM donor_response WHERE request_id = ?1 AND donor_id = ?2
                "#,
                params![request_id, donor_id],
                |row| {
                    Ok(DonorResponse {
                        request_id: row.get(0)?,
                        donor_id: row.get(1)?,
                        response: enum_col(row, 2, DonorResponseKind::parse)?,
                        reason: row.get(3)?,
                        responded_at: ts_col(row, 4)?,
                    })
                },
            )
            .optional()?;
        Ok(response)
    }

    pub fn count_responses(&self, request_id: &str) -> RepositoryResult<usize> {
        let conn = self.get_conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM donor_response WHERE request_id = ?1",
            params![request_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    // ==========================================
    // 邀请
    // ==========================================

    /// 登记邀请；该渠道已邀请过返回 false
    pub fn record_invitation(
        &self,
        request_id: &str,
        donor_id: &str,
        channel: &InvitationChannel,
        invited_at: DateTime<Utc>,
    ) -> RepositoryResult<bool> {
        let conn = self.get_conn()?;
        let affected = conn.execute(
            r#"
            INSERT OR IGNORE INTO donor_invitation (request_id, donor_id, channel, invited_at)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![request_id, donor_id, channel.key(), fmt_ts(&invited_at)],
        )?;
        Ok(affected > 0)
    }

    pub fn find_invited(
        &self,
        request_id: &str,
        channel: &InvitationChannel,
    ) -> RepositoryResult<HashSet<String>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT donor_id FROM donor_invitation WHERE request_id = ?1 AND channel = ?2",
        )?;
        let invited = stmt
            .query_map(params![request_id, channel.key()], |row| row.get::<_, String>(0))?
            .collect::<Result<HashSet<_>, _>>()?;
        Ok(invited)
    }
}
