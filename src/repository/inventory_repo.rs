// ==========================================
// 血液履约编排核心 - 库存单元数据仓储
// ==========================================
// 红线: Repository 不含业务逻辑（FIFO/拆分计划由引擎计算）
// 红线: 所有状态变更使用 compare-and-set（WHERE status = ?）
// ==========================================

use crate::db::fmt_ts;
use crate::domain::inventory::{InventoryUnit, ReservationHold, StockLevel};
use crate::domain::types::{BloodComponent, BloodGroup, UnitStatus};
use crate::repository::error::{RepositoryError, RepositoryResult};
use crate::repository::row_mapping::{enum_col, opt_ts_col, ts_col, u32_col};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::{Arc, Mutex};

const UNIT_COLUMNS: &str = r#"
    unit_id, facility_id, batch_id, blood_group, component, quantity, expiry_date,
    status, reserved_request_id, reserved_at, reservation_expires_at, lock_id,
    issued_at, created_at
"#;

fn map_unit(row: &Row<'_>) -> rusqlite::Result<InventoryUnit> {
    let reserved_request_id: Option<String> = row.get(8)?;
    let reserved_at = opt_ts_col(row, 9)?;
    let expires_at = opt_ts_col(row, 10)?;
    let lock_id: Option<String> = row.get(11)?;

    let reserved_for = match (reserved_request_id, reserved_at, expires_at, lock_id) {
        (Some(request_id), Some(reserved_at), Some(expires_at), Some(lock_id)) => {
            Some(ReservationHold {
                request_id,
                reserved_at,
                expires_at,
                lock_id,
            })
        }
        _ => None,
    };

    Ok(InventoryUnit {
        unit_id: row.get(0)?,
        facility_id: row.get(1)?,
        batch_id: row.get(2)?,
        blood_group: enum_col(row, 3, BloodGroup::parse)?,
        component: enum_col(row, 4, BloodComponent::parse)?,
        quantity: u32_col(row, 5)?,
        expiry_date: ts_col(row, 6)?,
        status: enum_col(row, 7, UnitStatus::parse)?,
        reserved_for,
        issued_at: opt_ts_col(row, 12)?,
        created_at: ts_col(row, 13)?,
    })
}

// ==========================================
// ReservationStep - 预留计划中的一步
// ==========================================
#[derive(Debug, Clone, PartialEq)]
pub enum ReservationStep {
    /// 整单元预留
    Whole { unit_id: String },
    /// 拆分: 原单元保留身份并预留 reserve_quantity，余量成为新的 available 单元
    Split {
        unit_id: String,
        original_quantity: u32,
        reserve_quantity: u32,
        remainder: InventoryUnit,
    },
}

// ==========================================
// InventoryRepository - 库存单元仓储
// ==========================================
pub struct InventoryRepository {
    conn: Arc<Mutex<Connection>>,
}

impl InventoryRepository {
    /// 创建新的库存仓储
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

    /// 入库
    pub fn insert(&self, unit: &InventoryUnit) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        insert_unit(&conn, unit)?;
        Ok(())
    }

    /// 原子执行预留计划
    ///
    /// 任一步 CAS 失败则整体回滚（all-or-nothing）
    pub fn apply_reservation(
        &self,
        steps: &[ReservationStep],
        hold: &ReservationHold,
    ) -> RepositoryResult<()> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;

        let reserved_at = fmt_ts(&hold.reserved_at);
        let expires_at = fmt_ts(&hold.expires_at);

        for step in steps {
            match step {
                ReservationStep::Whole { unit_id } => {
                    let affected = tx.execute(
                        r#"
                        UPDATE inventory_unit
                        SET status = 'reserved', reserved_request_id = ?1, reserved_at = ?2,
                            reservation_expires_at = ?3, lock_id = ?4
                        WHERE unit_id = ?5 AND status = 'available'
                        "#,
                        params![hold.request_id, reserved_at, expires_at, hold.lock_id, unit_id],
                    )?;
                    if affected == 0 {
                        return Err(RepositoryError::CompareAndSetFailed {
                            entity: "inventory_unit".to_string(),
                            id: unit_id.clone(),
                            expected: UnitStatus::Available.to_string(),
                        });
                    }
                }
                ReservationStep::Split {
                    unit_id,
                    original_quantity,
                    reserve_quantity,
                    remainder,
                } => {
                    let affected = tx.execute(
                        r#"
                        UPDATE inventory_unit
                        SET status = 'reserved', quantity = ?1, reserved_request_id = ?2,
                            reserved_at = ?3, reservation_expires_at = ?4, lock_id = ?5
                        WHERE unit_id = ?6 AND status = 'available' AND quantity = ?7
                        "#,
                        params![
                            reserve_quantity,
                            hold.request_id,
                            reserved_at,
                            expires_at,
                            hold.lock_id,
                            unit_id,
                            original_quantity
                        ],
                    )?;
                    if affected == 0 {
                        return Err(RepositoryError::CompareAndSetFailed {
                            entity: "inventory_unit".to_string(),
                            id: unit_id.clone(),
                            expected: UnitStatus::Available.to_string(),
                        });
                    }
                    insert_unit(&tx, remainder)?;
                }
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// 释放某需求的全部预留，返回被释放单元（释放前快照）
    pub fn release_for_request(&self, request_id: &str) -> RepositoryResult<Vec<InventoryUnit>> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;

        let units = {
            let sql = format!(
                "SELECT {} FROM inventory_unit WHERE reserved_request_id = ?1 AND status = 'reserved'",
                UNIT_COLUMNS
            );
            let mut stmt = tx.prepare(&sql)?;
            let rows = stmt
                .query_map(params![request_id], map_unit)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        tx.execute(
            r#"
            UPDATE inventory_unit
            SET status = 'available', reserved_request_id = NULL, reserved_at = NULL,
                reservation_expires_at = NULL, lock_id = NULL
            WHERE reserved_request_id = ?1 AND status = 'reserved'
            "#,
            params![request_id],
        )?;

        tx.commit()?;
        Ok(units)
    }

    /// 释放单个单元（仅当仍为该需求预留）
    ///
    /// # 返回
    /// - Ok(true): 已释放
    /// - Ok(false): 单元已不处于该预留（被出库/释放/过期）
    pub fn release_unit(&self, unit_id: &str, request_id: &str) -> RepositoryResult<bool> {
        let conn = self.get_conn()?;
        let affected = conn.execute(
            r#"
            UPDATE inventory_unit
            SET status = 'available', reserved_request_id = NULL, reserved_at = NULL,
                reservation_expires_at = NULL, lock_id = NULL
            WHERE unit_id = ?1 AND status = 'reserved' AND reserved_request_id = ?2
            "#,
            params![unit_id, request_id],
        )?;
        Ok(affected > 0)
    }

    /// 出库: 仅处理 status=reserved 且 reserved_request_id 匹配的单元
    ///
    /// 任一单元不匹配则整体回滚，返回 CompareAndSetFailed
    pub fn issue_units(
        &self,
        unit_ids: &[String],
        request_id: &str,
        now: DateTime<Utc>,
    ) -> RepositoryResult<u32> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;
        let issued_at = fmt_ts(&now);
        let mut total: u32 = 0;

        for unit_id in unit_ids {
            let quantity: Option<i64> = tx
                .query_row(
                    r#"
                    SELECT quantity FROM inventory_unit
                    WHERE unit_id = ?1 AND status = 'reserved' AND reserved_request_id = ?2
                    "#,
                    params![unit_id, request_id],
                    |row| row.get(0),
                )
                .optional()?;

            let quantity = match quantity {
                Some(q) => q,
                None => {
                    return Err(RepositoryError::CompareAndSetFailed {
                        entity: "inventory_unit".to_string(),
                        id: unit_id.clone(),
                        expected: format!("reserved:{}", request_id),
                    })
                }
            };

            tx.execute(
                r#"
                UPDATE inventory_unit
                SET status = 'issued', issued_at = ?1, reservation_expires_at = NULL
                WHERE unit_id = ?2 AND status = 'reserved' AND reserved_request_id = ?3
                "#,
                params![issued_at, unit_id, request_id],
            )?;
            total = total.saturating_add(u32::try_from(quantity).unwrap_or(0));
        }

        tx.commit()?;
        Ok(total)
    }

    /// 标记过期（available/reserved → expired）
    pub fn mark_expired(&self, unit_id: &str) -> RepositoryResult<bool> {
        let conn = self.get_conn()?;
        let affected = conn.execute(
            r#"
            UPDATE inventory_unit
            SET status = 'expired', reserved_request_id = NULL, reserved_at = NULL,
                reservation_expires_at = NULL, lock_id = NULL
            WHERE unit_id = ?1 AND status IN ('available', 'reserved')
            "#,
            params![unit_id],
        )?;
        Ok(affected > 0)
    }

    // ==========================================
    // 查询操作
    // ==========================================

    pub fn find_by_id(&self, unit_id: &str) -> RepositoryResult<Option<InventoryUnit>> {
        let conn = self.get_conn()?;
        let sql = format!("SELECT {} FROM inventory_unit WHERE unit_id = ?1", UNIT_COLUMNS);
        let unit = conn.query_row(&sql, params![unit_id], map_unit).optional()?;
        Ok(unit)
    }

    /// 可用且未过期单元，按过期时间升序（FIFO-by-expiry）
    pub fn find_available(
        &self,
        facility_id: &str,
        blood_group: BloodGroup,
        component: BloodComponent,
        now: DateTime<Utc>,
    ) -> RepositoryResult<Vec<InventoryUnit>> {
        let conn = self.get_conn()?;
        let sql = format!(
            r#"
            SELECT {} FROM inventory_unit
            WHERE facility_id = ?1 AND blood_group = ?2 AND component = ?3
              AND status = 'available' AND expiry_date >= ?4 AND quantity > 0
            ORDER BY expiry_date ASC, created_at ASC, unit_id ASC
            "#,
            UNIT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let units = stmt
            .query_map(
                params![facility_id, blood_group.as_str(), component.as_str(), fmt_ts(&now)],
                map_unit,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(units)
    }

    /// 某需求在某把锁下的预留单元（用于 lock_id 幂等重试）
    pub fn find_by_lock(&self, request_id: &str, lock_id: &str) -> RepositoryResult<Vec<InventoryUnit>> {
        let conn = self.get_conn()?;
        let sql = format!(
            r#"
            SELECT {} FROM inventory_unit
            WHERE reserved_request_id = ?1 AND lock_id = ?2 AND status = 'reserved'
            ORDER BY expiry_date ASC
            "#,
            UNIT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let units = stmt
            .query_map(params![request_id, lock_id], map_unit)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(units)
    }

    /// 当前为某需求锁定的总量
    pub fn reserved_quantity_for_request(&self, request_id: &str) -> RepositoryResult<u32> {
        let conn = self.get_conn()?;
        let total: i64 = conn.query_row(
            r#"
            SELECT COALESCE(SUM(quantity), 0) FROM inventory_unit
            WHERE reserved_request_id = ?1 AND status = 'reserved'
            "#,
            params![request_id],
            |row| row.get(0),
        )?;
        Ok(u32::try_from(total).unwrap_or(0))
    }

    /// 预留锁已超时的单元
    pub fn find_lapsed_reservations(&self, now: DateTime<Utc>) -> RepositoryResult<Vec<InventoryUnit>> {
        let conn = self.get_conn()?;
        let sql = format!(
            r#"
            SELECT {} FROM inventory_unit
            WHERE status = 'reserved' AND reservation_expires_at < ?1
            ORDER BY reservation_expires_at ASC
            "#,
            UNIT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let units = stmt
            .query_map(params![fmt_ts(&now)], map_unit)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(units)
    }

    /// 已过有效期但仍为 available/reserved 的单元
    pub fn find_expired_stock(&self, now: DateTime<Utc>) -> RepositoryResult<Vec<InventoryUnit>> {
        let conn = self.get_conn()?;
        let sql = format!(
            r#"
            SELECT {} FROM inventory_unit
            WHERE status IN ('available', 'reserved') AND expiry_date < ?1
            ORDER BY expiry_date ASC
            "#,
            UNIT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let units = stmt
            .query_map(params![fmt_ts(&now)], map_unit)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(units)
    }

    /// 按机构/血型/成分聚合可用库存
    pub fn stock_levels(&self, now: DateTime<Utc>) -> RepositoryResult<Vec<StockLevel>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT facility_id, blood_group, component, SUM(quantity)
            FROM inventory_unit
            WHERE status = 'available' AND expiry_date >= ?1
            GROUP BY facility_id, blood_group, component
            ORDER BY facility_id, blood_group, component
            "#,
        )?;
        let levels = stmt
            .query_map(params![fmt_ts(&now)], |row| {
                Ok(StockLevel {
                    facility_id: row.get(0)?,
                    blood_group: enum_col(row, 1, BloodGroup::parse)?,
                    component: enum_col(row, 2, BloodComponent::parse)?,
                    available_units: u32_col(row, 3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(levels)
    }

    /// 同一批次谱系的全部单元（审计用）
    pub fn find_by_batch(&self, batch_id: &str) -> RepositoryResult<Vec<InventoryUnit>> {
        let conn = self.get_conn()?;
        let sql = format!(
            "SELECT {} FROM inventory_unit WHERE batch_id = ?1 ORDER BY created_at ASC",
            UNIT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let units = stmt
            .query_map(params![batch_id], map_unit)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(units)
    }
}

fn insert_unit(conn: &Connection, unit: &InventoryUnit) -> rusqlite::Result<usize> {
    let hold = unit.reserved_for.as_ref();
    conn.execute(
        r#"
        INSERT INTO inventory_unit (
            unit_id, facility_id, batch_id, blood_group, component, quantity, expiry_date,
            status, reserved_request_id, reserved_at, reservation_expires_at, lock_id,
            issued_at, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
        "#,
        params![
            unit.unit_id,
            unit.facility_id,
            unit.batch_id,
            unit.blood_group.as_str(),
            unit.component.as_str(),
            unit.quantity,
            fmt_ts(&unit.expiry_date),
            unit.status.as_str(),
            hold.map(|h| h.request_id.clone()),
            hold.map(|h| fmt_ts(&h.reserved_at)),
            hold.map(|h| fmt_ts(&h.expires_at)),
            hold.map(|h| h.lock_id.clone()),
            unit.issued_at.as_ref().map(fmt_ts),
            fmt_ts(&unit.created_at),
        ],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn setup() -> InventoryRepository {
        let conn = Connection::open_in_memory().unwrap();
        crate::db::configure_sqlite_connection(&conn).unwrap();
        crate::db::init_schema(&conn).unwrap();
        InventoryRepository::new(Arc::new(Mutex::new(conn)))
    }

    fn unit(facility: &str, qty: u32, expiry_days: i64, now: DateTime<Utc>) -> InventoryUnit {
        InventoryUnit::intake(
            facility,
            BloodGroup::OPos,
            BloodComponent::RedCells,
            qty,
            now + Duration::days(expiry_days),
            now,
        )
    }

    fn hold(request_id: &str, now: DateTime<Utc>) -> ReservationHold {
        ReservationHold {
            request_id: request_id.to_string(),
            reserved_at: now,
            expires_at: now + Duration::minutes(30),
            lock_id: "L1".to_string(),
        }
    }

    #[test]
    fn test_find_available_orders_by_expiry() {
        let repo = setup();
        let now = Utc::now();
        let late = unit("BB1", 2, 20, now);
        let early = unit("BB1", 1, 3, now);
        let expired = unit("BB1", 5, -1, now);
        repo.insert(&late).unwrap();
        repo.insert(&early).unwrap();
        repo.insert(&expired).unwrap();

        let found = repo
            .find_available("BB1", BloodGroup::OPos, BloodComponent::RedCells, now)
            .unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].unit_id, early.unit_id);
        assert_eq!(found[1].unit_id, late.unit_id);
    }

    #[test]
    fn test_apply_reservation_rolls_back_on_cas_failure() {
        let repo = setup();
        let now = Utc::now();
        let a = unit("BB1", 1, 5, now);
        let b = unit("BB1", 1, 6, now);
        repo.insert(&a).unwrap();
        repo.insert(&b).unwrap();

        // b 已被其他需求抢占
        repo.apply_reservation(
            &[ReservationStep::Whole { unit_id: b.unit_id.clone() }],
            &hold("OTHER", now),
        )
        .unwrap();

        let err = repo
            .apply_reservation(
                &[
                    ReservationStep::Whole { unit_id: a.unit_id.clone() },
                    ReservationStep::Whole { unit_id: b.unit_id.clone() },
                ],
                &hold("R1", now),
            )
            .unwrap_err();
        assert!(matches!(err, RepositoryError::CompareAndSetFailed { .. }));

        // a 未被部分预留
        let a_after = repo.find_by_id(&a.unit_id).unwrap().unwrap();
        assert_eq!(a_after.status, UnitStatus::Available);
        assert!(a_after.reserved_for.is_none());
    }

    #[test]
    fn test_release_for_request_is_idempotent() {
        let repo = setup();
        let now = Utc::now();
        let a = unit("BB1", 2, 5, now);
        repo.insert(&a).unwrap();
        repo.apply_reservation(
            &[ReservationStep::Whole { unit_id: a.unit_id.clone() }],
            &hold("R1", now),
        )
        .unwrap();

        assert_eq!(repo.reserved_quantity_for_request("R1").unwrap(), 2);
        assert_eq!(repo.release_for_request("R1").unwrap().len(), 1);
        assert_eq!(repo.release_for_request("R1").unwrap().len(), 0);
        assert_eq!(repo.reserved_quantity_for_request("R1").unwrap(), 0);
    }

    #[test]
    fn test_issue_rejects_foreign_reservation() {
        let repo = setup();
        let now = Utc::now();
        let a = unit("BB1", 1, 5, now);
        repo.insert(&a).unwrap();
        repo.apply_reservation(
            &[ReservationStep::Whole { unit_id: a.unit_id.clone() }],
            &hold("R1", now),
        )
        .unwrap();

        let err = repo.issue_units(&[a.unit_id.clone()], "R2", now).unwrap_err();
        assert!(matches!(err, RepositoryError::CompareAndSetFailed { .. }));

        assert_eq!(repo.issue_units(&[a.unit_id.clone()], "R1", now).unwrap(), 1);
        // 重复出库被拒绝
        assert!(repo.issue_units(&[a.unit_id], "R1", now).is_err());
    }

    #[test]
    fn test_stock_levels_aggregate_available_only() {
        let repo = setup();
        let now = Utc::now();
        repo.insert(&unit("BB1", 3, 5, now)).unwrap();
        repo.insert(&unit("BB1", 4, 6, now)).unwrap();
        repo.insert(&unit("BB2", 1, -2, now)).unwrap();

        let levels = repo.stock_levels(now).unwrap();
        assert_eq!(levels.len(), 1);
        assert_eq!(levels[0].facility_id, "BB1");
        assert_eq!(levels[0].available_units, 7);
    }
}
