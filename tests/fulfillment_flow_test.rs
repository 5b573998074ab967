// ==========================================
// 履约全流程集成测试
// ==========================================
// 覆盖: 级联选择 → 动员；预留超时回收；动员停滞升级；重复响应；
//       送达回调；取消；强制升级
// ==========================================


#[cfg(test)]
mod fulfillment_flow_test {
    use blood_fulfillment::api::{ApiError, ForceEscalateOutcome};
    use blood_fulfillment::domain::types::{
        AppointmentStatus, AssignmentStatus, BloodComponent, BloodGroup, DonorResponseKind,
        EscalationLevel, RequestStatus, UnitStatus, UrgencyTier,
    };
    use blood_fulfillment::domain::request::BloodRequest;
    use blood_fulfillment::engine::{
        DeclineReason, EscalationOutcome, MonitorAction, ReservationService, ReserveCommand,
        TransitionOutcome,
    };
    use blood_fulfillment::integration::NotificationType;
    use chrono::Duration;

    use crate::test_helpers::{FixedGeo, TestEnv};

    // ==========================================
    // 只有可行血站被预留，余量触发动员
    // ==========================================
    #[tokio::test]
    async fn test_infeasible_bank_never_reserved_and_deficit_mobilized() {
        let env = TestEnv::new(FixedGeo::default().bank("X", 3.0, 10).bank("Y", 20.0, 50));
        env.add_stock("X", BloodGroup::OPos, 3);
        env.add_stock("Y", BloodGroup::OPos, 10);
        for i in 0..6 {
            env.add_donor(&format!("D{}", i), BloodGroup::OPos, 0.01 * (i + 1) as f64);
        }

        let outcome = env
            .state
            .api
            .submit_request(env.input(BloodGroup::OPos, 5, UrgencyTier::Critical))
            .await
            .unwrap();
        let cascade = outcome.cascade.expect("级联应成功");

        assert_eq!(cascade.assignments.len(), 1);
        assert_eq!(cascade.assignments[0].facility_id, "X");
        assert_eq!(cascade.assignments[0].units_offered, 3);
        assert_eq!(cascade.reserved_units, 3);
        assert_eq!(cascade.remaining_deficit, 2);

        // Y 不可行（ETA 50 > 30），库存不动
        assert_eq!(env.available_units("Y", BloodGroup::OPos), 10);
        assert_eq!(env.available_units("X", BloodGroup::OPos), 0);

        let mobilization = cascade.mobilization.expect("缺口应触发动员");
        assert!(!mobilization.skipped);
        assert_eq!(mobilization.remaining_deficit, 2);
        assert_eq!(mobilization.notification_cap, 4);
        assert!(mobilization.donors_notified <= 4);
        assert_eq!(env.notifier.count_of(NotificationType::DonorRequest), 4);

        let status = env.state.api.get_fulfillment_status(&outcome.request_id).unwrap();
        assert_eq!(status.status, RequestStatus::Processing);
        assert_eq!(status.reserved_units, 3);
        assert_eq!(status.deficit, 2);
        assert_eq!(status.escalation_level, EscalationLevel::Donors);
        assert!(status.fulfillment_details.donor_mobilization.initiated);
    }

    // ==========================================
    // 预留过期被清道夫回收，需求记录不变
    // ==========================================
    #[tokio::test]
    async fn test_lapsed_reservation_returns_to_stock_and_request_untouched() {
        let env = TestEnv::new(FixedGeo::default().bank("BB1", 3.0, 10));
        let unit = env.add_stock("BB1", BloodGroup::APos, 2);

        let now = env.now();
        let request = BloodRequest::new(
            "H1",
            blood_fulfillment::domain::request::GeoPoint::new(0.0, 0.0),
            BloodGroup::APos,
            BloodComponent::RedCells,
            2,
            UrgencyTier::High,
            now + Duration::hours(6),
            now,
        );
        env.state.request_repo.insert(&request).unwrap();
        env.state
            .reservations
            .reserve(ReserveCommand {
                facility_id: "BB1".to_string(),
                blood_group: BloodGroup::APos,
                component: BloodComponent::RedCells,
                units: 2,
                request_id: request.request_id.clone(),
                ttl_minutes: Some(30),
                lock_id: None,
            })
            .unwrap();
        let before = env.state.request_repo.get(&request.request_id).unwrap();

        env.clock.advance(Duration::minutes(31));
        let released = env.state.reaper.release_expired_reservations().await.unwrap();
        assert_eq!(released, 1);

        let unit = env.state.inventory_repo.find_by_id(&unit.unit_id).unwrap().unwrap();
        assert_eq!(unit.status, UnitStatus::Available);
        assert!(unit.reserved_for.is_none());

        let hospital_notices: Vec<_> = env
            .notifier
            .sent()
            .into_iter()
            .filter(|n| n.notification_type == NotificationType::ReservationExpired)
            .filter(|n| n.recipient.id() == "H1")
            .collect();
        assert_eq!(hospital_notices.len(), 1);

        let after = env.state.request_repo.get(&request.request_id).unwrap();
        assert_eq!(after.status, RequestStatus::Pending);
        assert_eq!(after.deficit(), before.deficit());
        assert_eq!(after.reserved_units, before.reserved_units);
    }

    // ==========================================
    // 动员停滞只升级一次
    // ==========================================
    #[tokio::test]
    async fn test_donor_stall_escalates_to_colleges_exactly_once() {
        let env = TestEnv::new(FixedGeo::default().college("C1", 4.0));
        env.add_donor("D1", BloodGroup::ONeg, 0.01);

        let outcome = env
            .state
            .api
            .submit_request(env.input(BloodGroup::ONeg, 2, UrgencyTier::High))
            .await
            .unwrap();
        let request_id = outcome.request_id;

        // 动员在 50 分钟前发起，预约在 70 分钟前就该完成
        env.clock.advance(Duration::minutes(50));
        env.add_confirmed_appointment(&request_id, "D1", env.now() - Duration::minutes(70));

        let first = env.state.monitor.sweep().await;
        assert_eq!(first.escalations, 1);
        assert_eq!(first.no_shows, 1);
        assert_eq!(env.notifier.count_of(NotificationType::CollegeEscalation), 1);

        let request = env.state.request_repo.get(&request_id).unwrap();
        let details = &request.fulfillment_details;
        assert!(details.college_escalation.initiated);
        assert!(details.college_escalation.contains("C1"));
        assert_eq!(details.donor_mobilization.failed_donors, 1);
        assert_eq!(details.current_level(), EscalationLevel::Colleges);

        let appointments = env.state.donor_repo.find_appointments_by_request(&request_id).unwrap();
        assert!(appointments.iter().any(|a| a.status == AppointmentStatus::NoShow));

        let second = env.state.monitor.sweep().await;
        assert_eq!(second.escalations, 0);
        assert_eq!(second.stalls_handled, 0);
        assert_eq!(env.notifier.count_of(NotificationType::CollegeEscalation), 1);

        let (action, _) = env.state.monitor.evaluate(&request_id).await.unwrap();
        assert_eq!(action, MonitorAction::None);
    }

    // ==========================================
    // 重复响应被拒绝且无状态变化
    // ==========================================
    #[tokio::test]
    async fn test_second_donor_response_is_rejected_without_side_effects() {
        let env = TestEnv::new(FixedGeo::default());
        env.add_donor("D1", BloodGroup::BPos, 0.01);
        let outcome = env
            .state
            .api
            .submit_request(env.input(BloodGroup::BPos, 1, UrgencyTier::Medium))
            .await
            .unwrap();
        let request_id = outcome.request_id;

        let first = env
            .state
            .api
            .donor_respond(&request_id, "D1", DonorResponseKind::Accept, None)
            .await
            .unwrap();
        assert!(first.appointment.is_some());
        let snapshot = env.state.api.get_fulfillment_status(&request_id).unwrap();

        let second = env
            .state
            .api
            .donor_respond(&request_id, "D1", DonorResponseKind::Decline, Some("改变主意".to_string()))
            .await;
        assert!(matches!(second, Err(ApiError::Duplicate(_))));

        let after = env.state.api.get_fulfillment_status(&request_id).unwrap();
        assert_eq!(after.appointments, snapshot.appointments);
        assert_eq!(
            after.fulfillment_details.donor_mobilization,
            snapshot.fulfillment_details.donor_mobilization
        );
        let stored = env.state.donor_repo.find_response(&request_id, "D1").unwrap().unwrap();
        assert_eq!(stored.response, DonorResponseKind::Accept);
    }

    // ==========================================
    // 送达回调: 出库 → 部分满足 → 全部满足
    // ==========================================
    #[tokio::test]
    async fn test_delivery_callbacks_drive_request_to_fulfilled() {
        let env = TestEnv::new(FixedGeo::default().bank("X", 2.0, 10).bank("Z", 8.0, 20));
        env.add_stock("X", BloodGroup::APos, 2);
        env.add_stock("Z", BloodGroup::APos, 2);

        let outcome = env
            .state
            .api
            .submit_request(env.input(BloodGroup::APos, 4, UrgencyTier::Critical))
            .await
            .unwrap();
        let cascade = outcome.cascade.unwrap();
        assert_eq!(cascade.assignments.len(), 2);
        assert_eq!(cascade.remaining_deficit, 0);
        assert!(cascade.mobilization.is_none() || cascade.mobilization.as_ref().unwrap().skipped);

        let first_delivery = cascade.assignments[0].delivery_id.clone().unwrap();
        let second_delivery = cascade.assignments[1].delivery_id.clone().unwrap();

        let receipt = env.state.api.record_delivery(&first_delivery).await.unwrap();
        assert_eq!(receipt.issued_units, 2);
        assert_eq!(receipt.status, RequestStatus::PartiallyFulfilled);

        // 重复回调不重复出库
        let duplicate = env.state.api.record_delivery(&first_delivery).await.unwrap();
        assert!(duplicate.already_recorded);
        assert_eq!(duplicate.issued_units, 0);

        let receipt = env.state.api.record_delivery(&second_delivery).await.unwrap();
        assert_eq!(receipt.status, RequestStatus::Fulfilled);

        let status = env.state.api.get_fulfillment_status(&outcome.request_id).unwrap();
        assert_eq!(status.issued_units, 4);
        assert_eq!(status.reserved_units, 0);
        assert!(status
            .fulfillment_details
            .bank_assignments
            .iter()
            .all(|a| a.status == AssignmentStatus::Delivered));
        assert_eq!(env.notifier.count_of(NotificationType::DeliveryCompleted), 2);
        assert_eq!(env.notifier.count_of(NotificationType::RequestFulfilled), 1);
    }

    #[tokio::test]
    async fn test_delivery_after_reaper_release_reports_expired_reservation() {
        let env = TestEnv::new(FixedGeo::default().bank("X", 2.0, 10));
        env.add_stock("X", BloodGroup::APos, 1);
        let outcome = env
            .state
            .api
            .submit_request(env.input(BloodGroup::APos, 1, UrgencyTier::Critical))
            .await
            .unwrap();
        let delivery_id = outcome.cascade.unwrap().assignments[0].delivery_id.clone().unwrap();

        env.clock.advance(Duration::minutes(45));
        env.state.reaper.release_expired_reservations().await.unwrap();

        let result = env.state.api.record_delivery(&delivery_id).await;
        match result {
            Err(ApiError::IssuanceRejected(msg)) => assert!(msg.contains("预留已过期")),
            other => panic!("unexpected: {:?}", other),
        }
        let status = env.state.api.get_fulfillment_status(&outcome.request_id).unwrap();
        assert_eq!(status.issued_units, 0);
    }

    // ==========================================
    // 取消
    // ==========================================
    #[tokio::test]
    async fn test_cancel_releases_stock_and_is_idempotent() {
        let env = TestEnv::new(FixedGeo::default().bank("X", 2.0, 10));
        env.add_stock("X", BloodGroup::APos, 2);
        env.add_donor("D1", BloodGroup::APos, 0.01);

        let outcome = env
            .state
            .api
            .submit_request(env.input(BloodGroup::APos, 3, UrgencyTier::High))
            .await
            .unwrap();
        let request_id = outcome.request_id;
        env.state
            .api
            .donor_respond(&request_id, "D1", DonorResponseKind::Accept, None)
            .await
            .unwrap();

        let cancelled = env
            .state
            .api
            .cancel_request(&request_id, Some("手术取消".to_string()))
            .await
            .unwrap();
        assert!(cancelled.is_applied());

        assert_eq!(env.available_units("X", BloodGroup::APos), 2);
        let status = env.state.api.get_fulfillment_status(&request_id).unwrap();
        assert_eq!(status.status, RequestStatus::Cancelled);
        assert_eq!(status.reserved_units, 0);
        assert_eq!(status.outcome_reason.as_deref(), Some("手术取消"));
        assert!(status
            .appointments
            .iter()
            .all(|a| a.status == AppointmentStatus::Cancelled));
        assert_eq!(env.notifier.count_of(NotificationType::RequestCancelled), 1);

        let again = env.state.api.cancel_request(&request_id, None).await.unwrap();
        assert_eq!(
            again,
            TransitionOutcome::Unchanged {
                status: RequestStatus::Cancelled
            }
        );
        assert_eq!(env.notifier.count_of(NotificationType::RequestCancelled), 1);
    }

    // ==========================================
    // 强制升级
    // ==========================================
    #[tokio::test]
    async fn test_force_escalate_respects_college_guards() {
        let env = TestEnv::new(FixedGeo::default().college("C1", 4.0).college("C2", 9.0));

        // 常见血型 + 低紧急度: 不满足升级条件
        let common = env
            .state
            .api
            .submit_request(env.input(BloodGroup::APos, 1, UrgencyTier::Low))
            .await
            .unwrap();
        let declined = env
            .state
            .api
            .force_escalate(&common.request_id, EscalationLevel::Colleges)
            .await
            .unwrap();
        assert_eq!(
            declined,
            ForceEscalateOutcome::Colleges(EscalationOutcome::Declined {
                reason: DeclineReason::NotRareOrUrgent
            })
        );
        assert_eq!(env.notifier.count_of(NotificationType::CollegeEscalation), 0);

        // 稀有血型: 升级一次，第二次为重复
        let rare = env
            .state
            .api
            .submit_request(env.input(BloodGroup::AbNeg, 1, UrgencyTier::Low))
            .await
            .unwrap();
        let escalated = env
            .state
            .api
            .force_escalate(&rare.request_id, EscalationLevel::Colleges)
            .await
            .unwrap();
        match escalated {
            ForceEscalateOutcome::Colleges(EscalationOutcome::Escalated { colleges }) => {
                assert_eq!(colleges, vec!["C1".to_string(), "C2".to_string()]);
            }
            other => panic!("unexpected: {:?}", other),
        }
        let duplicate = env
            .state
            .api
            .force_escalate(&rare.request_id, EscalationLevel::Colleges)
            .await;
        assert!(matches!(duplicate, Err(ApiError::Duplicate(_))));
        assert_eq!(env.notifier.count_of(NotificationType::CollegeEscalation), 2);

        let invalid = env
            .state
            .api
            .force_escalate(&rare.request_id, EscalationLevel::None)
            .await;
        assert!(matches!(invalid, Err(ApiError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_submit_rejects_invalid_input() {
        let env = TestEnv::new(FixedGeo::default());
        let mut input = env.input(BloodGroup::OPos, 0, UrgencyTier::High);
        assert!(matches!(
            env.state.api.submit_request(input.clone()).await,
            Err(ApiError::InvalidInput(_))
        ));

        input.units = 1;
        input.deadline = env.now() - Duration::minutes(1);
        assert!(matches!(
            env.state.api.submit_request(input).await,
            Err(ApiError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_college_donor_mobilization_does_not_touch_primary_counters() {
        let env = TestEnv::new(FixedGeo::default().college("C1", 4.0));
        env.add_donor("D1", BloodGroup::ONeg, 0.02);

        let outcome = env
            .state
            .api
            .submit_request(env.input(BloodGroup::ONeg, 1, UrgencyTier::Critical))
            .await
            .unwrap();
        let before = env.state.api.get_fulfillment_status(&outcome.request_id).unwrap();

        // 已被主动员邀请过的献血者仍可由高校再次动员（未响应）
        let notified = env
            .state
            .api
            .mobilize_college_donors("C1", &outcome.request_id)
            .await
            .unwrap();
        assert_eq!(notified, 1);

        let after = env.state.api.get_fulfillment_status(&outcome.request_id).unwrap();
        assert_eq!(
            after.fulfillment_details.donor_mobilization,
            before.fulfillment_details.donor_mobilization
        );
        assert!(after.fulfillment_details.college_escalation.contains("C1"));

        // 同一高校再次动员不重复邀请
        let again = env
            .state
            .api
            .mobilize_college_donors("C1", &outcome.request_id)
            .await
            .unwrap();
        assert_eq!(again, 0);
    }

    // ==========================================
    // 重复动员只邀请新候选
    // ==========================================
    #[tokio::test]
    async fn test_repeated_escalation_does_not_reinvite_donors() {
        let env = TestEnv::new(FixedGeo::default());
        env.add_donor("D1", BloodGroup::OPos, 0.01);
        env.add_donor("D2", BloodGroup::OPos, 0.02);

        let outcome = env
            .state
            .api
            .submit_request(env.input(BloodGroup::OPos, 1, UrgencyTier::High))
            .await
            .unwrap();
        assert_eq!(env.notifier.count_of(NotificationType::DonorRequest), 2);

        match env
            .state
            .api
            .force_escalate(&outcome.request_id, EscalationLevel::Donors)
            .await
            .unwrap()
        {
            ForceEscalateOutcome::Donors(mobilization) => assert_eq!(mobilization.donors_notified, 0),
            other => panic!("unexpected: {:?}", other),
        }
        env.state
            .api
            .force_escalate(&outcome.request_id, EscalationLevel::BloodBank)
            .await
            .unwrap();

        assert_eq!(env.notifier.count_of(NotificationType::DonorRequest), 2);
        let status = env.state.api.get_fulfillment_status(&outcome.request_id).unwrap();
        assert_eq!(status.fulfillment_details.donor_mobilization.donors_notified, 2);
    }
}
