// ==========================================
// 血液履约编排核心 - 库存预留管理
// ==========================================
// 红线: reserve 全有或全无（不足时无任何副作用）
// 红线: 出库只作用于为该需求预留的单元
// 红线: reserved_units / issued_units 只通过原子增量更新
// ==========================================
// 预留流程:
// 1. 同 lock_id 重试 → 返回已有预留
// 2. 校验需求未结束、数量不超过缺口
// 3. FIFO-by-expiry 遍历，整单元预留，末单元拆分
// 4. 单事务 CAS 落库，失败整体回滚
// ==========================================

use crate::clock::Clock;
use crate::domain::action_log::{ActionLog, ActionType};
use crate::domain::inventory::{InventoryUnit, Reservation, ReservationHold};
use crate::domain::types::{BloodComponent, BloodGroup};
use crate::engine::error::{request_lookup, FulfillmentError, FulfillmentResult};
use crate::integration::AuditSink;
use crate::repository::{InventoryRepository, RepositoryError, RequestRepository, ReservationStep};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::instrument;

const ACTOR: &str = "system:reservation";

/// 预留指令
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReserveCommand {
    pub facility_id: String,
    pub blood_group: BloodGroup,
    pub component: BloodComponent,
    pub units: u32,
    pub request_id: String,
    pub ttl_minutes: Option<i64>,
    pub lock_id: Option<String>,
}

/// 入库指令
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockIntake {
    pub facility_id: String,
    pub blood_group: BloodGroup,
    pub component: BloodComponent,
    pub quantity: u32,
    pub expiry_date: DateTime<Utc>,
}

/// 库存预留服务
pub trait ReservationService: Send + Sync {
    /// 可用且未过期，按过期时间升序
    fn get_available(
        &self,
        facility_id: &str,
        blood_group: BloodGroup,
        component: BloodComponent,
    ) -> FulfillmentResult<Vec<InventoryUnit>>;

    fn reserve(&self, command: ReserveCommand) -> FulfillmentResult<Reservation>;

    /// 释放该需求全部预留，返回释放数量（重复调用返回 0）
    fn release(&self, request_id: &str) -> FulfillmentResult<u32>;

    /// 出库，返回出库数量
    fn issue(&self, unit_ids: &[String], request_id: &str) -> FulfillmentResult<u32>;

    fn add_stock(&self, intake: StockIntake) -> FulfillmentResult<InventoryUnit>;

    /// 库存中当前为该需求锁定的数量
    fn reserved_quantity(&self, request_id: &str) -> FulfillmentResult<u32>;
}

// ==========================================
// ReservationManager
// ==========================================
pub struct ReservationManager {
    inventory_repo: Arc<InventoryRepository>,
    request_repo: Arc<RequestRepository>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    default_ttl_minutes: i64,
}

impl ReservationManager {
    pub fn new(
        inventory_repo: Arc<InventoryRepository>,
        request_repo: Arc<RequestRepository>,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
        default_ttl_minutes: i64,
    ) -> Self {
        Self {
            inventory_repo,
            request_repo,
            audit,
            clock,
            default_ttl_minutes,
        }
    }

    /// 由已锁定单元还原预留结果（lock_id 重试）
    fn existing_reservation(
        &self,
        command: &ReserveCommand,
        lock_id: &str,
        units: Vec<InventoryUnit>,
    ) -> Reservation {
        let expires_at = units
            .iter()
            .filter_map(|u| u.reserved_for.as_ref().map(|h| h.expires_at))
            .min()
            .unwrap_or_else(|| self.clock.now());
        Reservation {
            lock_id: lock_id.to_string(),
            request_id: command.request_id.clone(),
            facility_id: units
                .first()
                .map(|u| u.facility_id.clone())
                .unwrap_or_else(|| command.facility_id.clone()),
            unit_ids: units.iter().map(|u| u.unit_id.clone()).collect(),
            units: units.iter().map(|u| u.quantity).sum(),
            expires_at,
        }
    }
}

/// FIFO 预留计划: 整单元优先，最后一个单元按需拆分
///
/// 调用方保证 available 已按过期时间排序且总量足够
pub fn plan_reservation(
    available: &[InventoryUnit],
    units: u32,
    now: DateTime<Utc>,
) -> Vec<ReservationStep> {
    let mut steps = Vec::new();
    let mut remaining = units;

    for unit in available {
        if remaining == 0 {
            break;
        }
        if unit.quantity <= remaining {
            steps.push(ReservationStep::Whole {
                unit_id: unit.unit_id.clone(),
            });
            remaining -= unit.quantity;
        } else {
            let mut remainder = unit.clone();
            remainder.unit_id = uuid::Uuid::new_v4().to_string();
            remainder.quantity = unit.quantity - remaining;
            remainder.reserved_for = None;
            remainder.issued_at = None;
            remainder.created_at = now;

            steps.push(ReservationStep::Split {
                unit_id: unit.unit_id.clone(),
                original_quantity: unit.quantity,
                reserve_quantity: remaining,
                remainder,
            });
            remaining = 0;
        }
    }

    steps
}

fn step_unit_id(step: &ReservationStep) -> &str {
    match step {
        ReservationStep::Whole { unit_id } => unit_id,
        ReservationStep::Split { unit_id, .. } => unit_id,
    }
}

impl ReservationService for ReservationManager {
    fn get_available(
        &self,
        facility_id: &str,
        blood_group: BloodGroup,
        component: BloodComponent,
    ) -> FulfillmentResult<Vec<InventoryUnit>> {
        let now = self.clock.now();
        Ok(self
            .inventory_repo
            .find_available(facility_id, blood_group, component, now)?)
    }

    #[instrument(skip(self, command), fields(
        request_id = %command.request_id,
        facility_id = %command.facility_id,
        units = command.units
    ))]
    fn reserve(&self, command: ReserveCommand) -> FulfillmentResult<Reservation> {
        if command.units == 0 {
            return Err(FulfillmentError::InvalidInput("预留数量必须大于 0".to_string()));
        }

        // 同 lock_id 重试
        if let Some(lock_id) = command.lock_id.as_deref() {
            let existing = self.inventory_repo.find_by_lock(&command.request_id, lock_id)?;
            if !existing.is_empty() {
                tracing::debug!(lock_id, "同一 lock_id 重试，返回已有预留");
                return Ok(self.existing_reservation(&command, lock_id, existing));
            }
        }

        let now = self.clock.now();
        let request = self
            .request_repo
            .get(&command.request_id)
            .map_err(request_lookup(&command.request_id))?;
        if request.is_terminal() {
            return Err(FulfillmentError::RequestClosed {
                request_id: request.request_id,
                status: request.status,
            });
        }
        let deficit = request.deficit();
        if command.units > deficit {
            return Err(FulfillmentError::ExceedsDeficit {
                request_id: request.request_id,
                requested: command.units,
                deficit,
            });
        }

        let available = self.inventory_repo.find_available(
            &command.facility_id,
            command.blood_group,
            command.component,
            now,
        )?;
        let total: u32 = available.iter().map(|u| u.quantity).sum();
        if total < command.units {
            return Err(FulfillmentError::InsufficientInventory {
                facility_id: command.facility_id.clone(),
                requested: command.units,
                available: total,
            });
        }

        let steps = plan_reservation(&available, command.units, now);
        let lock_id = command
            .lock_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let ttl = command.ttl_minutes.unwrap_or(self.default_ttl_minutes);
        let hold = ReservationHold {
            request_id: command.request_id.clone(),
            reserved_at: now,
            expires_at: now + Duration::minutes(ttl),
            lock_id: lock_id.clone(),
        };

        self.inventory_repo
            .apply_reservation(&steps, &hold)
            .map_err(|e| match e {
                RepositoryError::CompareAndSetFailed { id, .. } => {
                    FulfillmentError::ReservationConflict { unit_id: id }
                }
                other => FulfillmentError::Repository(other),
            })?;
        self.request_repo
            .adjust_counters(&command.request_id, i64::from(command.units), 0, now)?;

        let unit_ids: Vec<String> = steps.iter().map(|s| step_unit_id(s).to_string()).collect();
        let reservation = Reservation {
            lock_id,
            request_id: command.request_id.clone(),
            facility_id: command.facility_id.clone(),
            unit_ids,
            units: command.units,
            expires_at: hold.expires_at,
        };

        self.audit.record(ActionLog::new(
            ACTOR,
            ActionType::ReserveStock,
            "request",
            &command.request_id,
            Some(json!({
                "facility_id": reservation.facility_id,
                "lock_id": reservation.lock_id,
                "unit_ids": reservation.unit_ids,
                "units": reservation.units,
                "expires_at": reservation.expires_at,
            })),
            now,
        ));
        tracing::info!(
            lock_id = %reservation.lock_id,
            unit_count = reservation.unit_ids.len(),
            "库存预留成功"
        );

        Ok(reservation)
    }

    #[instrument(skip(self))]
    fn release(&self, request_id: &str) -> FulfillmentResult<u32> {
        let now = self.clock.now();
        let released = self.inventory_repo.release_for_request(request_id)?;
        if released.is_empty() {
            return Ok(0);
        }

        let quantity: u32 = released.iter().map(|u| u.quantity).sum();
        self.request_repo
            .adjust_counters(request_id, -i64::from(quantity), 0, now)
            .or_else(|e| match e {
                // 需求记录不存在时库存照常释放
                RepositoryError::NotFound { .. } => Ok(()),
                other => Err(other),
            })?;

        self.audit.record(ActionLog::new(
            ACTOR,
            ActionType::ReleaseStock,
            "request",
            request_id,
            Some(json!({
                "unit_ids": released.iter().map(|u| u.unit_id.clone()).collect::<Vec<_>>(),
                "units": quantity,
            })),
            now,
        ));
        tracing::info!(units = quantity, "已释放需求预留");
        Ok(quantity)
    }

    #[instrument(skip(self, unit_ids), fields(unit_count = unit_ids.len()))]
    fn issue(&self, unit_ids: &[String], request_id: &str) -> FulfillmentResult<u32> {
        if unit_ids.is_empty() {
            return Ok(0);
        }
        let now = self.clock.now();
        let issued = self
            .inventory_repo
            .issue_units(unit_ids, request_id, now)
            .map_err(|e| match e {
                RepositoryError::CompareAndSetFailed { id, .. } => FulfillmentError::StaleIssuance {
                    request_id: request_id.to_string(),
                    unit_id: id,
                },
                other => FulfillmentError::Repository(other),
            })?;

        self.request_repo.adjust_counters(
            request_id,
            -i64::from(issued),
            i64::from(issued),
            now,
        )?;

        self.audit.record(ActionLog::new(
            ACTOR,
            ActionType::IssueStock,
            "request",
            request_id,
            Some(json!({ "unit_ids": unit_ids, "units": issued })),
            now,
        ));
        tracing::info!(units = issued, "出库完成");
        Ok(issued)
    }

    fn add_stock(&self, intake: StockIntake) -> FulfillmentResult<InventoryUnit> {
        if intake.quantity == 0 {
            return Err(FulfillmentError::InvalidInput("入库数量必须大于 0".to_string()));
        }
        let now = self.clock.now();
        let unit = InventoryUnit::intake(
            intake.facility_id,
            intake.blood_group,
            intake.component,
            intake.quantity,
            intake.expiry_date,
            now,
        );
        self.inventory_repo.insert(&unit)?;
        tracing::info!(
            unit_id = %unit.unit_id,
            facility_id = %unit.facility_id,
            blood_group = %unit.blood_group,
            quantity = unit.quantity,
            "库存入库"
        );
        Ok(unit)
    }

    fn reserved_quantity(&self, request_id: &str) -> FulfillmentResult<u32> {
        Ok(self.inventory_repo.reserved_quantity_for_request(request_id)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::domain::request::{BloodRequest, GeoPoint};
    use crate::domain::types::{UnitStatus, UrgencyTier};
    use crate::integration::NoOpAuditSink;
    use chrono::TimeZone;
    use rusqlite::Connection;
    use std::sync::Mutex;

    struct Fixture {
        manager: ReservationManager,
        inventory_repo: Arc<InventoryRepository>,
        request_repo: Arc<RequestRepository>,
        clock: Arc<ManualClock>,
    }

    fn setup() -> Fixture {
        let conn = Connection::open_in_memory().unwrap();
        crate::db::configure_sqlite_connection(&conn).unwrap();
        crate::db::init_schema(&conn).unwrap();
        let conn = Arc::new(Mutex::new(conn));
        let inventory_repo = Arc::new(InventoryRepository::new(conn.clone()));
        let request_repo = Arc::new(RequestRepository::new(conn));
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 5, 1, 8, 0, 0).unwrap()));
        let manager = ReservationManager::new(
            inventory_repo.clone(),
            request_repo.clone(),
            Arc::new(NoOpAuditSink),
            clock.clone(),
            30,
        );
        Fixture {
            manager,
            inventory_repo,
            request_repo,
            clock,
        }
    }

    fn submit(f: &Fixture, units: u32) -> BloodRequest {
        let now = f.clock.now();
        let request = BloodRequest::new(
            "H1",
            GeoPoint::new(0.0, 0.0),
            BloodGroup::OPos,
            BloodComponent::RedCells,
            units,
            UrgencyTier::High,
            now + Duration::hours(6),
            now,
        );
        f.request_repo.insert(&request).unwrap();
        request
    }

    fn stock(f: &Fixture, quantity: u32, expires_in_days: i64) -> InventoryUnit {
        f.manager
            .add_stock(StockIntake {
                facility_id: "BB1".to_string(),
                blood_group: BloodGroup::OPos,
                component: BloodComponent::RedCells,
                quantity,
                expiry_date: f.clock.now() + Duration::days(expires_in_days),
            })
            .unwrap()
    }

    fn command(request_id: &str, units: u32) -> ReserveCommand {
        ReserveCommand {
            facility_id: "BB1".to_string(),
            blood_group: BloodGroup::OPos,
            component: BloodComponent::RedCells,
            units,
            request_id: request_id.to_string(),
            ttl_minutes: None,
            lock_id: None,
        }
    }

    #[test]
    fn test_reserve_fifo_with_split() {
        let f = setup();
        let request = submit(&f, 5);
        let late = stock(&f, 4, 10);
        let early = stock(&f, 3, 2);

        let reservation = f.manager.reserve(command(&request.request_id, 5)).unwrap();
        assert_eq!(reservation.units, 5);
        assert_eq!(reservation.unit_ids, vec![early.unit_id.clone(), late.unit_id.clone()]);
        assert_eq!(reservation.expires_at, f.clock.now() + Duration::minutes(30));

        // 拆分: 原单元保留身份（2 单位预留），余量 2 成为同批次新单元
        let split = f.inventory_repo.find_by_id(&late.unit_id).unwrap().unwrap();
        assert_eq!(split.status, UnitStatus::Reserved);
        assert_eq!(split.quantity, 2);
        let lineage = f.inventory_repo.find_by_batch(&late.batch_id).unwrap();
        assert_eq!(lineage.len(), 2);
        assert_eq!(lineage.iter().map(|u| u.quantity).sum::<u32>(), 4);

        let stored = f.request_repo.get(&request.request_id).unwrap();
        assert_eq!(stored.reserved_units, 5);
    }

    #[test]
    fn test_insufficient_inventory_has_no_side_effects() {
        let f = setup();
        let request = submit(&f, 10);
        let unit = stock(&f, 3, 5);

        let err = f.manager.reserve(command(&request.request_id, 4)).unwrap_err();
        assert!(matches!(err, FulfillmentError::InsufficientInventory { available: 3, .. }));
        let unchanged = f.inventory_repo.find_by_id(&unit.unit_id).unwrap().unwrap();
        assert_eq!(unchanged.status, UnitStatus::Available);
        assert_eq!(f.request_repo.get(&request.request_id).unwrap().reserved_units, 0);
    }

    #[test]
    fn test_reserve_rejects_more_than_deficit() {
        let f = setup();
        let request = submit(&f, 2);
        stock(&f, 10, 5);
        let err = f.manager.reserve(command(&request.request_id, 3)).unwrap_err();
        assert!(matches!(err, FulfillmentError::ExceedsDeficit { deficit: 2, .. }));
    }

    #[test]
    fn test_lock_id_retry_returns_existing() {
        let f = setup();
        let request = submit(&f, 4);
        stock(&f, 10, 5);

        let mut cmd = command(&request.request_id, 2);
        cmd.lock_id = Some("LOCK-1".to_string());
        let first = f.manager.reserve(cmd.clone()).unwrap();
        let second = f.manager.reserve(cmd).unwrap();
        assert_eq!(first.unit_ids, second.unit_ids);
        assert_eq!(second.units, 2);
        assert_eq!(f.manager.reserved_quantity(&request.request_id).unwrap(), 2);
    }

    #[test]
    fn test_release_is_idempotent() {
        let f = setup();
        let request = submit(&f, 3);
        stock(&f, 3, 5);
        f.manager.reserve(command(&request.request_id, 3)).unwrap();

        assert_eq!(f.manager.release(&request.request_id).unwrap(), 3);
        assert_eq!(f.manager.release(&request.request_id).unwrap(), 0);
        assert_eq!(f.request_repo.get(&request.request_id).unwrap().reserved_units, 0);
        assert_eq!(
            f.manager
                .get_available("BB1", BloodGroup::OPos, BloodComponent::RedCells)
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn test_issue_only_units_reserved_for_request() {
        let f = setup();
        let r1 = submit(&f, 2);
        let r2 = submit(&f, 2);
        stock(&f, 2, 5);
        stock(&f, 2, 6);
        let res1 = f.manager.reserve(command(&r1.request_id, 2)).unwrap();
        let res2 = f.manager.reserve(command(&r2.request_id, 2)).unwrap();

        let err = f.manager.issue(&res2.unit_ids, &r1.request_id).unwrap_err();
        assert!(matches!(err, FulfillmentError::StaleIssuance { .. }));

        assert_eq!(f.manager.issue(&res1.unit_ids, &r1.request_id).unwrap(), 2);
        let stored = f.request_repo.get(&r1.request_id).unwrap();
        assert_eq!((stored.reserved_units, stored.issued_units), (0, 2));
    }
}
