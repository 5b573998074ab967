// ==========================================
// 血液履约编排核心 - 机构数据仓储
// ==========================================
// 职责: facility（医院/血站）与 college（合作高校）
// ==========================================

use crate::domain::facility::{College, Facility};
use crate::domain::request::GeoPoint;
use crate::domain::types::FacilityKind;
use crate::repository::error::{RepositoryError, RepositoryResult};
use crate::repository::row_mapping::enum_col;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::{Arc, Mutex};

fn map_facility(row: &Row<'_>) -> rusqlite::Result<Facility> {
    Ok(Facility {
        facility_id: row.get(0)?,
        name: row.get(1)?,
        kind: enum_col(row, 2, FacilityKind::parse)?,
        location: GeoPoint::new(row.get(3)?, row.get(4)?),
        has_testing_capability: row.get::<_, i64>(5)? != 0,
        active: row.get::<_, i64>(6)? != 0,
    })
}

fn map_college(row: &Row<'_>) -> rusqlite::Result<College> {
    Ok(College {
        college_id: row.get(0)?,
        name: row.get(1)?,
        coordinator_id: row.get(2)?,
        location: GeoPoint::new(row.get(3)?, row.get(4)?),
        active: row.get::<_, i64>(5)? != 0,
    })
}

// ==========================================
// FacilityRepository - 机构仓储
// ==========================================
pub struct FacilityRepository {
    conn: Arc<Mutex<Connection>>,
}

impl FacilityRepository {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    fn get_conn(&self) -> RepositoryResult<std::sync::MutexGuard<Connection>> {
        self.conn
            .lock()
            .map_err(|e| RepositoryError::LockError(e.to_string()))
    }

    pub fn upsert_facility(&self, facility: &Facility) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            r#"
            INSERT OR REPLACE INTO facility (
                facility_id, name, kind, lat, lon, has_testing_capability, active
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                facility.facility_id,
                facility.name,
                facility.kind.as_str(),
                facility.location.lat,
                facility.location.lon,
                facility.has_testing_capability as i64,
                facility.active as i64,
            ],
        )?;
        Ok(())
    }

    pub fn find_facility(&self, facility_id: &str) -> RepositoryResult<Option<Facility>> {
        let conn = self.get_conn()?;
        let facility = conn
            .query_row(
                r#"
                SELECT facility_id, name, kind, lat, lon, has_testing_capability, active
                FROM facility WHERE facility_id = ?1
                "#,
                params![facility_id],
                map_facility,
            )
            .optional()?;
        Ok(facility)
    }

    /// 按类型列出启用中的机构
    pub fn list_active_by_kind(&self, kind: FacilityKind) -> RepositoryResult<Vec<Facility>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT facility_id, name, kind, lat, lon, has_testing_capability, active
            FROM facility WHERE kind = ?1 AND active = 1
            ORDER BY facility_id
            "#,
        )?;
        let facilities = stmt
            .query_map(params![kind.as_str()], map_facility)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(facilities)
    }

    pub fn upsert_college(&self, college: &College) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            r#"
            INSERT OR REPLACE INTO college (college_id, name, coordinator_id, lat, lon, active)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                college.college_id,
                college.name,
                college.coordinator_id,
                college.location.lat,
                college.location.lon,
                college.active as i64,
            ],
        )?;
        Ok(())
    }

    pub fn find_college(&self, college_id: &str) -> RepositoryResult<Option<College>> {
        let conn = self.get_conn()?;
        let college = conn
            .query_row(
                r#"
                SELECT college_id, name, coordinator_id, lat, lon, active
                FROM college WHERE college_id = ?1
                "#,
                params![college_id],
                map_college,
            )
            .optional()?;
        Ok(college)
    }

    pub fn list_active_colleges(&self) -> RepositoryResult<Vec<College>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT college_id, name, coordinator_id, lat, lon, active
            FROM college WHERE active = 1
            ORDER BY college_id
            "#,
        )?;
        let colleges = stmt
            .query_map([], map_college)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(colleges)
    }
}
