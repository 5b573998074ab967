// ==========================================
// 库存与级联性质测试
// ==========================================
// 覆盖: 守恒 / 释放幂等 / ETA 上限 / 拆分不变量 / 同需求并发串行
// ==========================================


#[cfg(test)]
mod inventory_properties_test {
    use std::sync::Arc;

    use blood_fulfillment::domain::request::{BloodRequest, GeoPoint};
    use blood_fulfillment::domain::types::{BloodComponent, BloodGroup, UnitStatus, UrgencyTier};
    use blood_fulfillment::engine::{FulfillmentError, ReservationService, ReserveCommand};
    use chrono::Duration;

    use crate::test_helpers::{FixedGeo, TestEnv};

    fn pending_request(env: &TestEnv, group: BloodGroup, units: u32) -> BloodRequest {
        let now = env.now();
        let request = BloodRequest::new(
            "H1",
            GeoPoint::new(0.0, 0.0),
            group,
            BloodComponent::RedCells,
            units,
            UrgencyTier::High,
            now + Duration::hours(6),
            now,
        );
        env.state.request_repo.insert(&request).unwrap();
        request
    }

    fn command(facility_id: &str, request_id: &str, units: u32) -> ReserveCommand {
        ReserveCommand {
            facility_id: facility_id.to_string(),
            blood_group: BloodGroup::OPos,
            component: BloodComponent::RedCells,
            units,
            request_id: request_id.to_string(),
            ttl_minutes: None,
            lock_id: None,
        }
    }

    // ==========================================
    // 守恒: issued + reserved ≤ units
    // ==========================================
    #[test]
    fn test_reservation_never_exceeds_request_units() {
        let env = TestEnv::new(FixedGeo::default());
        env.add_stock("A", BloodGroup::OPos, 3);
        env.add_stock("B", BloodGroup::OPos, 5);
        let request = pending_request(&env, BloodGroup::OPos, 4);

        env.state
            .reservations
            .reserve(command("A", &request.request_id, 3))
            .unwrap();
        let over = env.state.reservations.reserve(command("B", &request.request_id, 3));
        assert!(matches!(over, Err(FulfillmentError::ExceedsDeficit { deficit: 1, .. })));

        let stored = env.state.request_repo.get(&request.request_id).unwrap();
        assert!(stored.issued_units + stored.reserved_units <= stored.units);
        assert_eq!(stored.reserved_units, 3);
        assert_eq!(env.available_units("B", BloodGroup::OPos), 5);
    }

    #[test]
    fn test_insufficient_stock_has_no_side_effects() {
        let env = TestEnv::new(FixedGeo::default());
        env.add_stock("A", BloodGroup::OPos, 2);
        env.add_stock("A", BloodGroup::OPos, 1);
        let request = pending_request(&env, BloodGroup::OPos, 5);

        let result = env.state.reservations.reserve(command("A", &request.request_id, 4));
        match result {
            Err(FulfillmentError::InsufficientInventory {
                requested,
                available,
                ..
            }) => {
                assert_eq!(requested, 4);
                assert_eq!(available, 3);
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(env.available_units("A", BloodGroup::OPos), 3);
        assert_eq!(
            env.state
                .reservations
                .reserved_quantity(&request.request_id)
                .unwrap(),
            0
        );
        assert_eq!(env.state.request_repo.get(&request.request_id).unwrap().reserved_units, 0);
    }

    // ==========================================
    // 释放幂等
    // ==========================================
    #[test]
    fn test_release_twice_equals_release_once() {
        let env = TestEnv::new(FixedGeo::default());
        env.add_stock("A", BloodGroup::OPos, 4);
        let request = pending_request(&env, BloodGroup::OPos, 3);
        env.state
            .reservations
            .reserve(command("A", &request.request_id, 3))
            .unwrap();

        assert_eq!(env.state.reservations.release(&request.request_id).unwrap(), 3);
        let mut once = env
            .state
            .reservations
            .get_available("A", BloodGroup::OPos, BloodComponent::RedCells)
            .unwrap();
        let counters_once = env.state.request_repo.get(&request.request_id).unwrap().reserved_units;

        assert_eq!(env.state.reservations.release(&request.request_id).unwrap(), 0);
        let mut twice = env
            .state
            .reservations
            .get_available("A", BloodGroup::OPos, BloodComponent::RedCells)
            .unwrap();
        let counters_twice = env.state.request_repo.get(&request.request_id).unwrap().reserved_units;

        once.sort_by(|a, b| a.unit_id.cmp(&b.unit_id));
        twice.sort_by(|a, b| a.unit_id.cmp(&b.unit_id));
        assert_eq!(once, twice);
        assert_eq!(counters_once, counters_twice);
        assert_eq!(counters_twice, 0);
    }

    // ==========================================
    // 拆分不变量
    // ==========================================
    #[test]
    fn test_partial_reservation_splits_and_conserves_quantity() {
        let env = TestEnv::new(FixedGeo::default());
        let original = env.add_stock("A", BloodGroup::OPos, 10);
        let request = pending_request(&env, BloodGroup::OPos, 4);

        let reservation = env
            .state
            .reservations
            .reserve(command("A", &request.request_id, 4))
            .unwrap();
        assert_eq!(reservation.unit_ids, vec![original.unit_id.clone()]);

        let lineage = env.state.inventory_repo.find_by_batch(&original.batch_id).unwrap();
        assert_eq!(lineage.len(), 2);

        let reserved = lineage.iter().find(|u| u.unit_id == original.unit_id).unwrap();
        assert_eq!(reserved.status, UnitStatus::Reserved);
        assert_eq!(reserved.quantity, 4);

        let leftover = lineage.iter().find(|u| u.unit_id != original.unit_id).unwrap();
        assert_eq!(leftover.status, UnitStatus::Available);
        assert_eq!(leftover.quantity, 6);
        assert!(leftover.reserved_for.is_none());

        let total: u32 = lineage.iter().map(|u| u.quantity).sum();
        assert_eq!(total, 10);
    }

    #[test]
    fn test_retry_with_same_lock_id_returns_existing_reservation() {
        let env = TestEnv::new(FixedGeo::default());
        env.add_stock("A", BloodGroup::OPos, 5);
        let request = pending_request(&env, BloodGroup::OPos, 2);

        let mut cmd = command("A", &request.request_id, 2);
        cmd.lock_id = Some("lock-1".to_string());
        let first = env.state.reservations.reserve(cmd.clone()).unwrap();
        let retry = env.state.reservations.reserve(cmd).unwrap();

        assert_eq!(first.lock_id, retry.lock_id);
        assert_eq!(first.unit_ids, retry.unit_ids);
        assert_eq!(env.state.request_repo.get(&request.request_id).unwrap().reserved_units, 2);
        assert_eq!(env.available_units("A", BloodGroup::OPos), 3);
    }

    // ==========================================
    // ETA 上限: 危急需求不选 ETA 超限的血站
    // ==========================================
    #[tokio::test]
    async fn test_critical_request_prefers_feasible_bank_over_larger_stock() {
        let env = TestEnv::new(FixedGeo::default().bank("FAR", 4.0, 45).bank("NEAR", 4.5, 25));
        env.add_stock("FAR", BloodGroup::OPos, 20);
        env.add_stock("NEAR", BloodGroup::OPos, 2);

        let outcome = env
            .state
            .api
            .submit_request(env.input(BloodGroup::OPos, 2, UrgencyTier::Critical))
            .await
            .unwrap();
        let cascade = outcome.cascade.unwrap();

        assert_eq!(cascade.assignments.len(), 1);
        assert_eq!(cascade.assignments[0].facility_id, "NEAR");
        assert_eq!(cascade.assignments[0].eta_minutes, 25);
        assert_eq!(env.available_units("FAR", BloodGroup::OPos), 20);
    }

    #[tokio::test]
    async fn test_bank_without_testing_capability_is_skipped() {
        let env = TestEnv::new(FixedGeo::default().bank("LAB", 2.0, 10).bank("OK", 6.0, 15));
        env.register_facility("LAB", blood_fulfillment::domain::types::FacilityKind::BloodBank, false);
        env.add_stock("LAB", BloodGroup::OPos, 5);
        env.add_stock("OK", BloodGroup::OPos, 5);

        let outcome = env
            .state
            .api
            .submit_request(env.input(BloodGroup::OPos, 1, UrgencyTier::High))
            .await
            .unwrap();
        let cascade = outcome.cascade.unwrap();
        assert_eq!(cascade.assignments.len(), 1);
        assert_eq!(cascade.assignments[0].facility_id, "OK");
        assert_eq!(env.available_units("LAB", BloodGroup::OPos), 5);
    }

    // ==========================================
    // 同一需求的并发级联被串行化
    // ==========================================
    #[tokio::test]
    async fn test_concurrent_cascades_for_same_request_do_not_double_reserve() {
        let env = TestEnv::new(FixedGeo::default().bank("A", 2.0, 10).bank("B", 3.0, 12));
        env.add_stock("A", BloodGroup::OPos, 3);
        env.add_stock("B", BloodGroup::OPos, 3);
        let request = pending_request(&env, BloodGroup::OPos, 3);

        let engine = Arc::clone(&env.state.engine);
        let (first, second) = tokio::join!(
            engine.process_request(&request.request_id),
            engine.process_request(&request.request_id)
        );
        let reserved_by_calls = first.unwrap().reserved_units + second.unwrap().reserved_units;
        assert_eq!(reserved_by_calls, 3);

        let stored = env.state.request_repo.get(&request.request_id).unwrap();
        assert_eq!(stored.reserved_units, 3);
        assert_eq!(
            env.state
                .reservations
                .reserved_quantity(&request.request_id)
                .unwrap(),
            3
        );
        assert_eq!(stored.fulfillment_details.bank_assignments.len(), 1);
        assert_eq!(
            env.available_units("A", BloodGroup::OPos) + env.available_units("B", BloodGroup::OPos),
            3
        );
    }
}
