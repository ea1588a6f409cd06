use super::*;
use crate::limits::*;

const H: Ms = 3_600_000; // 1 hour in ms
const DAY: Ms = 24 * H;
/// 2024-03-01T00:00:00Z, so "10:00" below reads as `T0 + 10 * H`.
const T0: Ms = 1_709_251_200_000;

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("labres_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

/// An engine with one ordinary user and two pieces of equipment.
struct Lab {
    engine: Engine,
    user: Ulid,
    chamber: Ulid,
    oven: Ulid,
}

async fn lab(wal: &str) -> Lab {
    let engine = Engine::new(test_wal_path(wal)).unwrap();
    let user = Ulid::new();
    engine
        .register_user(user, "ada".into(), Some("ada@lab.example".into()), Role::User)
        .await
        .unwrap();
    let chamber = Ulid::new();
    engine
        .create_equipment(chamber, "Climate chamber".into(), None, true)
        .await
        .unwrap();
    let oven = Ulid::new();
    engine
        .create_equipment(oven, "Reflow oven".into(), Some("bench 4".into()), true)
        .await
        .unwrap();
    Lab {
        engine,
        user,
        chamber,
        oven,
    }
}

fn new_reservation(equipment_id: Ulid, user_id: Ulid, start: Ms, end: Ms) -> NewReservation {
    NewReservation {
        id: Ulid::new(),
        equipment_id,
        user_id,
        test_name: "thermal cycling".into(),
        temperature: -20.0,
        start,
        end,
        additional_equipment: vec![],
    }
}

impl Lab {
    async fn reserve(&self, equipment_id: Ulid, start: Ms, end: Ms) -> Result<Ulid, EngineError> {
        let new = new_reservation(equipment_id, self.user, start, end);
        let id = new.id;
        self.engine.create_reservation(new).await?;
        Ok(id)
    }
}

fn hours(h: i64) -> Ms {
    T0 + h * H
}

// ── Validator outcomes through the engine ────────────────

#[tokio::test]
async fn inverted_or_empty_window_is_invalid_time_range() {
    let lab = lab("invalid_range.wal").await;
    for (start, end) in [(hours(11), hours(10)), (hours(10), hours(10))] {
        let err = lab.reserve(lab.chamber, start, end).await.unwrap_err();
        assert_eq!(err.rejection(), Some(Rejection::InvalidTimeRange));
    }
    // Ordering is checked before overlap: still a range error when the
    // window also collides with an existing reservation.
    lab.reserve(lab.chamber, hours(9), hours(12)).await.unwrap();
    let err = lab
        .reserve(lab.chamber, hours(11), hours(10))
        .await
        .unwrap_err();
    assert_eq!(err.rejection(), Some(Rejection::InvalidTimeRange));
    assert_eq!(err.to_string(), "end time must be after start time");
    assert_eq!(
        lab.engine
            .reservations_for_equipment(lab.chamber)
            .await
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn disjoint_windows_succeed_in_either_order() {
    let lab = lab("disjoint.wal").await;
    lab.reserve(lab.chamber, hours(14), hours(15)).await.unwrap();
    lab.reserve(lab.chamber, hours(9), hours(10)).await.unwrap();

    let list = lab
        .engine
        .reservations_for_equipment(lab.chamber)
        .await
        .unwrap();
    assert_eq!(list.len(), 2);
    assert!(list[0].span.start < list[1].span.start, "sorted by start");
}

#[tokio::test]
async fn containment_and_identical_windows_conflict() {
    let lab = lab("containment.wal").await;
    lab.reserve(lab.chamber, hours(10), hours(14)).await.unwrap();

    for (start, end) in [
        (hours(10), hours(14)), // identical
        (hours(11), hours(12)), // inside
        (hours(9), hours(15)),  // around
    ] {
        let err = lab.reserve(lab.chamber, start, end).await.unwrap_err();
        assert_eq!(err.rejection(), Some(Rejection::TimeConflict));
        assert_eq!(err.to_string(), "this time slot is already reserved");
    }
}

#[tokio::test]
async fn touching_boundaries_do_not_conflict() {
    let lab = lab("touching.wal").await;
    lab.reserve(lab.chamber, hours(10), hours(11)).await.unwrap();
    lab.reserve(lab.chamber, hours(11), hours(12)).await.unwrap();
    lab.reserve(lab.chamber, hours(9), hours(10)).await.unwrap();
}

#[tokio::test]
async fn partial_overlap_is_rejected() {
    let lab = lab("partial.wal").await;
    lab.reserve(lab.chamber, hours(10), hours(12)).await.unwrap();
    let err = lab
        .reserve(lab.chamber, hours(11), hours(13))
        .await
        .unwrap_err();
    assert_eq!(err.rejection(), Some(Rejection::TimeConflict));
}

#[tokio::test]
async fn equipment_are_independent() {
    let lab = lab("independent.wal").await;
    lab.reserve(lab.chamber, hours(10), hours(12)).await.unwrap();
    lab.reserve(lab.oven, hours(10), hours(12)).await.unwrap();
}

#[tokio::test]
async fn revalidation_is_idempotent() {
    let lab = lab("idempotent.wal").await;
    lab.reserve(lab.chamber, hours(10), hours(12)).await.unwrap();

    let clash = Candidate {
        equipment_id: lab.chamber,
        start: hours(11),
        end: hours(13),
    };
    let free = Candidate {
        equipment_id: lab.chamber,
        start: hours(12),
        end: hours(13),
    };
    for _ in 0..3 {
        let err = lab.engine.check_candidate(&clash, None).await.unwrap_err();
        assert_eq!(err.rejection(), Some(Rejection::TimeConflict));
        assert_eq!(
            lab.engine.check_candidate(&free, None).await.unwrap(),
            Span::new(hours(12), hours(13))
        );
    }
    // Dry runs never persist.
    assert_eq!(
        lab.engine
            .reservations_for_equipment(lab.chamber)
            .await
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn unavailable_equipment_can_still_be_reserved() {
    let lab = lab("availability_bypass.wal").await;
    lab.engine
        .update_equipment(
            vec![lab.chamber],
            EquipmentPatch {
                is_available: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(!lab.engine.get_equipment(lab.chamber).await.unwrap().is_available);
    lab.reserve(lab.chamber, hours(10), hours(11)).await.unwrap();
}

// ── Updates ──────────────────────────────────────────────

#[tokio::test]
async fn update_excludes_own_prior_record() {
    let lab = lab("self_exclusion.wal").await;
    let a = lab.reserve(lab.chamber, hours(10), hours(12)).await.unwrap();

    // Extend into its own old window.
    let updated = lab
        .engine
        .update_reservation(
            a,
            ReservationPatch {
                end: Some(hours(13)),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.span, Span::new(hours(10), hours(13)));

    // Shrink, and change non-time fields at the same time.
    let updated = lab
        .engine
        .update_reservation(
            a,
            ReservationPatch {
                start: Some(hours(11)),
                test_name: Some("burn-in".into()),
                temperature: Some(85.0),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.span, Span::new(hours(11), hours(13)));
    assert_eq!(updated.test_name, "burn-in");
    assert_eq!(updated.temperature, 85.0);
    assert_eq!(updated.user_id, lab.user);
}

#[tokio::test]
async fn update_into_another_reservation_conflicts() {
    let lab = lab("update_conflict.wal").await;
    let a = lab.reserve(lab.chamber, hours(10), hours(11)).await.unwrap();
    lab.reserve(lab.chamber, hours(12), hours(13)).await.unwrap();

    let err = lab
        .engine
        .update_reservation(
            a,
            ReservationPatch {
                end: Some(hours(12) + 1),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.rejection(), Some(Rejection::TimeConflict));

    // Unchanged after the rejection.
    let r = lab.engine.get_reservation(a).await.unwrap();
    assert_eq!(r.span, Span::new(hours(10), hours(11)));
}

#[tokio::test]
async fn update_with_inverted_window_is_invalid() {
    let lab = lab("update_invalid.wal").await;
    let a = lab.reserve(lab.chamber, hours(10), hours(11)).await.unwrap();
    let err = lab
        .engine
        .update_reservation(
            a,
            ReservationPatch {
                start: Some(hours(11)),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.rejection(), Some(Rejection::InvalidTimeRange));
}

#[tokio::test]
async fn move_reservation_between_equipment() {
    let lab = lab("move.wal").await;
    let a = lab.reserve(lab.chamber, hours(10), hours(11)).await.unwrap();
    let blocker = lab.reserve(lab.oven, hours(10), hours(11)).await.unwrap();

    let err = lab
        .engine
        .update_reservation(
            a,
            ReservationPatch {
                equipment_id: Some(lab.oven),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.rejection(), Some(Rejection::TimeConflict));

    lab.engine.delete_reservation(blocker).await.unwrap();
    let moved = lab
        .engine
        .update_reservation(
            a,
            ReservationPatch {
                equipment_id: Some(lab.oven),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(moved.equipment_id, lab.oven);
    assert!(lab
        .engine
        .reservations_for_equipment(lab.chamber)
        .await
        .unwrap()
        .is_empty());
    assert_eq!(lab.engine.get_equipment_for_reservation(&a), Some(lab.oven));

    // The chamber slot is free again.
    lab.reserve(lab.chamber, hours(10), hours(11)).await.unwrap();
}

#[tokio::test]
async fn update_preserves_notified() {
    let lab = lab("update_notified.wal").await;
    let a = lab.reserve(lab.chamber, hours(10), hours(11)).await.unwrap();
    lab.engine.mark_notified(vec![a]).await.unwrap();
    let updated = lab
        .engine
        .update_reservation(
            a,
            ReservationPatch {
                end: Some(hours(12)),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(updated.notified);
}

// ── Administrative actions ───────────────────────────────

#[tokio::test]
async fn mark_notified_is_one_way_and_all_or_nothing() {
    let lab = lab("mark_notified.wal").await;
    let a = lab.reserve(lab.chamber, hours(10), hours(11)).await.unwrap();
    let b = lab.reserve(lab.oven, hours(10), hours(11)).await.unwrap();

    let err = lab
        .engine
        .mark_notified(vec![a, Ulid::new()])
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));
    assert!(!lab.engine.get_reservation(a).await.unwrap().notified);

    assert_eq!(lab.engine.mark_notified(vec![a, b, a]).await.unwrap(), 2);
    assert!(lab.engine.get_reservation(a).await.unwrap().notified);
    assert!(lab.engine.get_reservation(b).await.unwrap().notified);

    // Marking again is a no-op, not an error.
    assert_eq!(lab.engine.mark_notified(vec![a]).await.unwrap(), 1);
}

#[tokio::test]
async fn bulk_mark_unavailable() {
    let lab = lab("bulk_unavailable.wal").await;
    let n = lab
        .engine
        .update_equipment(
            vec![lab.chamber, lab.oven],
            EquipmentPatch {
                is_available: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(n, 2);
    assert!(lab
        .engine
        .list_equipment()
        .await
        .iter()
        .all(|e| !e.is_available));
}

#[tokio::test]
async fn bulk_update_with_unknown_id_changes_nothing() {
    let lab = lab("bulk_unknown.wal").await;
    let err = lab
        .engine
        .update_equipment(
            vec![lab.chamber, Ulid::new()],
            EquipmentPatch {
                is_available: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));
    assert!(lab.engine.get_equipment(lab.chamber).await.unwrap().is_available);
}

#[tokio::test]
async fn equipment_edit_and_clear_description() {
    let lab = lab("edit_equipment.wal").await;
    lab.engine
        .update_equipment(
            vec![lab.oven],
            EquipmentPatch {
                name: Some("Reflow oven II".into()),
                description: Some(None),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let info = lab.engine.get_equipment(lab.oven).await.unwrap();
    assert_eq!(info.name, "Reflow oven II");
    assert_eq!(info.description, None);
    assert!(info.is_available);

    let err = lab
        .engine
        .update_equipment(vec![lab.oven], EquipmentPatch::default())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidField(_)));
}

// ── Batch ────────────────────────────────────────────────

#[tokio::test]
async fn batch_commits_across_equipment() {
    let lab = lab("batch_ok.wal").await;
    let batch = vec![
        new_reservation(lab.chamber, lab.user, hours(10), hours(11)),
        new_reservation(lab.oven, lab.user, hours(10), hours(11)),
        new_reservation(lab.chamber, lab.user, hours(11), hours(12)),
    ];
    assert_eq!(lab.engine.batch_create_reservations(batch).await.unwrap(), 3);
    assert_eq!(lab.engine.reservations_for_user(lab.user).await.len(), 3);
}

#[tokio::test]
async fn batch_is_all_or_nothing_against_store() {
    let lab = lab("batch_store_conflict.wal").await;
    lab.reserve(lab.oven, hours(10), hours(12)).await.unwrap();

    let batch = vec![
        new_reservation(lab.chamber, lab.user, hours(10), hours(11)),
        new_reservation(lab.oven, lab.user, hours(11), hours(13)),
    ];
    let err = lab.engine.batch_create_reservations(batch).await.unwrap_err();
    assert_eq!(err.rejection(), Some(Rejection::TimeConflict));
    assert!(lab
        .engine
        .reservations_for_equipment(lab.chamber)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn batch_rejects_overlap_within_itself() {
    let lab = lab("batch_intra.wal").await;
    let batch = vec![
        new_reservation(lab.chamber, lab.user, hours(10), hours(12)),
        new_reservation(lab.chamber, lab.user, hours(11), hours(13)),
    ];
    let err = lab.engine.batch_create_reservations(batch).await.unwrap_err();
    assert_eq!(err.rejection(), Some(Rejection::TimeConflict));
    assert!(lab.engine.all_reservations().await.is_empty());
}

#[tokio::test]
async fn batch_rejects_duplicate_ids_and_oversize() {
    let lab = lab("batch_dupes.wal").await;
    let first = new_reservation(lab.chamber, lab.user, hours(10), hours(11));
    let mut second = new_reservation(lab.chamber, lab.user, hours(12), hours(13));
    second.id = first.id;
    let err = lab
        .engine
        .batch_create_reservations(vec![first, second])
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::AlreadyExists(_)));

    let huge: Vec<_> = (0..=MAX_BATCH_SIZE as i64)
        .map(|i| new_reservation(lab.chamber, lab.user, hours(i), hours(i + 1)))
        .collect();
    let err = lab.engine.batch_create_reservations(huge).await.unwrap_err();
    assert!(matches!(err, EngineError::LimitExceeded(_)));
    assert_eq!(lab.engine.batch_create_reservations(vec![]).await.unwrap(), 0);
}

// ── Referential integrity and deletion ───────────────────

#[tokio::test]
async fn unresolved_references_are_not_found() {
    let lab = lab("references.wal").await;

    let err = lab.reserve(Ulid::new(), hours(10), hours(11)).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));

    let stranger = new_reservation(lab.chamber, Ulid::new(), hours(10), hours(11));
    let err = lab.engine.create_reservation(stranger).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));

    let mut with_extra = new_reservation(lab.chamber, lab.user, hours(10), hours(11));
    with_extra.additional_equipment = vec![Ulid::new()];
    let err = lab.engine.create_reservation(with_extra).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));
}

#[tokio::test]
async fn deleting_additional_equipment_detaches_it() {
    let lab = lab("detach_extra.wal").await;
    let (logger, camera) = (Ulid::new(), Ulid::new());
    for (id, name) in [(logger, "Data logger"), (camera, "Thermal camera")] {
        lab.engine
            .create_additional_equipment(id, name.into())
            .await
            .unwrap();
    }
    let mut new = new_reservation(lab.chamber, lab.user, hours(10), hours(11));
    new.additional_equipment = vec![logger, camera, logger];
    let rid = new.id;
    lab.engine.create_reservation(new).await.unwrap();
    assert_eq!(
        lab.engine.get_reservation(rid).await.unwrap().additional_equipment.len(),
        2,
        "deduplicated"
    );

    assert_eq!(lab.engine.delete_additional_equipment(logger).await.unwrap(), 1);
    let kept = lab.engine.get_reservation(rid).await.unwrap();
    assert_eq!(kept.additional_equipment, vec![camera]);
    assert_eq!(kept.span, Span::new(hours(10), hours(11)));
    assert_eq!(lab.engine.list_additional_equipment().len(), 1);

    assert!(matches!(
        lab.engine.delete_additional_equipment(logger).await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn deleting_equipment_removes_its_reservations() {
    let lab = lab("cascade_equipment.wal").await;
    let a = lab.reserve(lab.chamber, hours(10), hours(11)).await.unwrap();
    let b = lab.reserve(lab.chamber, hours(12), hours(13)).await.unwrap();
    let other = lab.reserve(lab.oven, hours(10), hours(11)).await.unwrap();

    assert_eq!(lab.engine.delete_equipment(lab.chamber).await.unwrap(), 2);
    assert!(matches!(
        lab.engine.get_equipment(lab.chamber).await,
        Err(EngineError::NotFound(_))
    ));
    for id in [a, b] {
        assert!(matches!(
            lab.engine.get_reservation(id).await,
            Err(EngineError::NotFound(_))
        ));
        assert!(lab.engine.get_equipment_for_reservation(&id).is_none());
    }
    assert_eq!(lab.engine.all_reservations().await.len(), 1);
    assert!(lab.engine.get_reservation(other).await.is_ok());
}

#[tokio::test]
async fn deleting_user_removes_their_reservations() {
    let lab = lab("cascade_user.wal").await;
    let grace = Ulid::new();
    lab.engine
        .register_user(grace, "grace".into(), None, Role::User)
        .await
        .unwrap();
    lab.reserve(lab.chamber, hours(10), hours(11)).await.unwrap();
    lab.reserve(lab.oven, hours(10), hours(11)).await.unwrap();
    let theirs = new_reservation(lab.chamber, grace, hours(11), hours(12));
    let theirs_id = theirs.id;
    lab.engine.create_reservation(theirs).await.unwrap();

    assert_eq!(lab.engine.delete_user(lab.user).await.unwrap(), 2);
    assert!(lab.engine.find_user_by_username("ada").is_none());
    assert!(lab.engine.reservations_for_user(lab.user).await.is_empty());
    let left = lab.engine.all_reservations().await;
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].id, theirs_id);

    // The freed slot is bookable again.
    let new = new_reservation(lab.chamber, grace, hours(10), hours(11));
    lab.engine.create_reservation(new).await.unwrap();

    assert!(matches!(
        lab.engine.delete_user(lab.user).await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn delete_reservation_twice_is_not_found() {
    let lab = lab("delete_twice.wal").await;
    let rid = lab.reserve(lab.chamber, hours(10), hours(11)).await.unwrap();
    let deleted = lab.engine.delete_reservation(rid).await.unwrap();
    assert_eq!(deleted.id, rid);
    assert!(matches!(
        lab.engine.delete_reservation(rid).await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn cascading_deletes_survive_replay() {
    let path = test_wal_path("cascade_replay.wal");
    let (user, chamber, oven, logger, kept) = {
        let engine = Engine::new(path.clone()).unwrap();
        let user = Ulid::new();
        let other = Ulid::new();
        engine
            .register_user(user, "ada".into(), None, Role::User)
            .await
            .unwrap();
        engine
            .register_user(other, "grace".into(), None, Role::User)
            .await
            .unwrap();
        let (chamber, oven) = (Ulid::new(), Ulid::new());
        engine
            .create_equipment(chamber, "Climate chamber".into(), None, true)
            .await
            .unwrap();
        engine
            .create_equipment(oven, "Reflow oven".into(), None, true)
            .await
            .unwrap();
        let logger = Ulid::new();
        engine
            .create_additional_equipment(logger, "Data logger".into())
            .await
            .unwrap();

        engine
            .create_reservation(new_reservation(chamber, other, hours(1), hours(2)))
            .await
            .unwrap();
        engine
            .create_reservation(new_reservation(oven, user, hours(1), hours(2)))
            .await
            .unwrap();
        let mut with_logger = new_reservation(oven, other, hours(3), hours(4));
        with_logger.additional_equipment = vec![logger];
        let kept = with_logger.id;
        engine.create_reservation(with_logger).await.unwrap();

        engine.delete_equipment(chamber).await.unwrap();
        engine.delete_user(user).await.unwrap();
        engine.delete_additional_equipment(logger).await.unwrap();
        (user, chamber, oven, logger, kept)
    };

    let engine = Engine::new(path).unwrap();
    assert!(engine.get_user(user).is_err());
    assert!(engine.get_equipment(chamber).await.is_err());
    assert!(engine.list_additional_equipment().iter().all(|a| a.id != logger));
    let left = engine.all_reservations().await;
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].id, kept);
    assert_eq!(left[0].equipment_id, oven);
    assert!(left[0].additional_equipment.is_empty());
}

#[tokio::test]
async fn usernames_are_unique() {
    let lab = lab("usernames.wal").await;
    let err = lab
        .engine
        .register_user(Ulid::new(), "ada".into(), None, Role::Admin)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::UsernameTaken(_)));

    let err = lab
        .engine
        .register_user(lab.user, "someone".into(), None, Role::User)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::AlreadyExists(_)));

    let err = lab
        .engine
        .register_user(Ulid::new(), "bob".into(), Some("not-an-address".into()), Role::User)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidField(_)));
}

// ── Limits ───────────────────────────────────────────────

#[tokio::test]
async fn field_and_span_limits() {
    let lab = lab("limits.wal").await;

    let mut nan = new_reservation(lab.chamber, lab.user, hours(10), hours(11));
    nan.temperature = f64::NAN;
    assert!(matches!(
        lab.engine.create_reservation(nan).await,
        Err(EngineError::InvalidField(_))
    ));

    let mut long_name = new_reservation(lab.chamber, lab.user, hours(10), hours(11));
    long_name.test_name = "x".repeat(MAX_TEST_NAME_LEN + 1);
    assert!(matches!(
        lab.engine.create_reservation(long_name).await,
        Err(EngineError::LimitExceeded(_))
    ));

    let err = lab
        .reserve(lab.chamber, -H, 0)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::LimitExceeded(_)));

    let err = lab
        .reserve(lab.chamber, T0, T0 + MAX_SPAN_DURATION_MS + 1)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::LimitExceeded(_)));

    lab.reserve(lab.chamber, T0, T0 + 30 * DAY).await.unwrap();
}

// ── Queries ──────────────────────────────────────────────

#[tokio::test]
async fn find_overlapping_honours_exclusion() {
    let lab = lab("find_overlapping.wal").await;
    let a = lab.reserve(lab.chamber, hours(10), hours(12)).await.unwrap();
    let b = lab.reserve(lab.chamber, hours(12), hours(14)).await.unwrap();

    let hits = lab
        .engine
        .find_overlapping(lab.chamber, hours(11), hours(13), None)
        .await
        .unwrap();
    assert_eq!(hits.iter().map(|r| r.id).collect::<Vec<_>>(), vec![a, b]);

    let hits = lab
        .engine
        .find_overlapping(lab.chamber, hours(11), hours(13), Some(a))
        .await
        .unwrap();
    assert_eq!(hits.iter().map(|r| r.id).collect::<Vec<_>>(), vec![b]);

    assert!(lab
        .engine
        .find_overlapping(lab.chamber, hours(13), hours(11), None)
        .await
        .unwrap()
        .is_empty());
    assert!(lab
        .engine
        .find_overlapping(Ulid::new(), hours(10), hours(11), None)
        .await
        .is_err());
}

#[tokio::test]
async fn reservations_by_user() {
    let lab = lab("by_user.wal").await;
    let other = Ulid::new();
    lab.engine
        .register_user(other, "grace".into(), None, Role::User)
        .await
        .unwrap();
    lab.reserve(lab.chamber, hours(10), hours(11)).await.unwrap();
    lab.engine
        .create_reservation(new_reservation(lab.oven, other, hours(10), hours(11)))
        .await
        .unwrap();

    assert_eq!(lab.engine.reservations_for_user(lab.user).await.len(), 1);
    assert_eq!(lab.engine.reservations_for_user(other).await.len(), 1);
    assert_eq!(lab.engine.all_reservations().await.len(), 2);
}

// ── Durability ───────────────────────────────────────────

#[tokio::test]
async fn replay_restores_full_state() {
    let path = test_wal_path("replay_full.wal");
    let (user, chamber, oven, logger, moved, notified) = {
        let engine = Engine::new(path.clone()).unwrap();
        let user = Ulid::new();
        engine
            .register_user(user, "ada".into(), None, Role::User)
            .await
            .unwrap();
        engine.set_user_role(user, Role::Admin).await.unwrap();
        let chamber = Ulid::new();
        let oven = Ulid::new();
        engine
            .create_equipment(chamber, "Climate chamber".into(), None, true)
            .await
            .unwrap();
        engine
            .create_equipment(oven, "Reflow oven".into(), None, true)
            .await
            .unwrap();
        let logger = Ulid::new();
        engine
            .create_additional_equipment(logger, "Data logger".into())
            .await
            .unwrap();

        let mut first = new_reservation(chamber, user, hours(10), hours(11));
        first.additional_equipment = vec![logger];
        let moved = first.id;
        engine.create_reservation(first).await.unwrap();
        engine
            .update_reservation(
                moved,
                ReservationPatch {
                    equipment_id: Some(oven),
                    end: Some(hours(12)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let second = new_reservation(chamber, user, hours(10), hours(11));
        let notified = second.id;
        engine.create_reservation(second).await.unwrap();
        engine.mark_notified(vec![notified]).await.unwrap();

        let gone = new_reservation(chamber, user, hours(20), hours(21));
        let gone_id = gone.id;
        engine.create_reservation(gone).await.unwrap();
        engine.delete_reservation(gone_id).await.unwrap();

        engine
            .update_equipment(
                vec![chamber],
                EquipmentPatch {
                    is_available: Some(false),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        (user, chamber, oven, logger, moved, notified)
    };

    let engine = Engine::new(path).unwrap();
    assert_eq!(engine.get_user(user).unwrap().role, Role::Admin);
    assert_eq!(engine.find_user_by_username("ada").unwrap().id, user);
    assert!(!engine.get_equipment(chamber).await.unwrap().is_available);
    assert!(engine.get_equipment(oven).await.unwrap().is_available);
    assert_eq!(engine.list_additional_equipment().len(), 1);

    let m = engine.get_reservation(moved).await.unwrap();
    assert_eq!(m.equipment_id, oven);
    assert_eq!(m.span, Span::new(hours(10), hours(12)));
    assert_eq!(m.additional_equipment, vec![logger]);
    assert!(engine.get_reservation(notified).await.unwrap().notified);

    assert_eq!(engine.reservations_for_equipment(chamber).await.unwrap().len(), 1);
    assert_eq!(engine.reservations_for_equipment(oven).await.unwrap().len(), 1);
    assert_eq!(engine.all_reservations().await.len(), 2);

    // Restored state still enforces conflicts.
    let err = engine
        .create_reservation(new_reservation(oven, user, hours(11), hours(13)))
        .await
        .unwrap_err();
    assert_eq!(err.rejection(), Some(Rejection::TimeConflict));
}

#[tokio::test]
async fn compaction_preserves_state() {
    let path = test_wal_path("compaction.wal");
    let user = Ulid::new();
    let chamber = Ulid::new();
    let kept = {
        let engine = Engine::new(path.clone()).unwrap();
        engine
            .register_user(user, "ada".into(), None, Role::User)
            .await
            .unwrap();
        engine
            .create_equipment(chamber, "Climate chamber".into(), None, true)
            .await
            .unwrap();
        for i in 0..20 {
            let new = new_reservation(chamber, user, hours(i), hours(i + 1));
            let id = new.id;
            engine.create_reservation(new).await.unwrap();
            engine.delete_reservation(id).await.unwrap();
        }
        let new = new_reservation(chamber, user, hours(30), hours(31));
        let kept = new.id;
        engine.create_reservation(new).await.unwrap();
        engine.mark_notified(vec![kept]).await.unwrap();
        assert!(engine.wal_appends_since_compact().await > 40);

        engine.compact_wal().await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        kept
    };

    let engine = Engine::new(path).unwrap();
    let list = engine.reservations_for_equipment(chamber).await.unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0].id, kept);
    assert!(list[0].notified);
    assert_eq!(engine.get_user(user).unwrap().username, "ada");
}

// ── Concurrency ──────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_overlapping_requests_admit_exactly_one() {
    let lab = lab("concurrent.wal").await;
    let engine = Arc::new(lab.engine);

    let mut handles = Vec::new();
    for i in 0..16 {
        let engine = engine.clone();
        let new = new_reservation(lab.chamber, lab.user, hours(10) + i, hours(12));
        handles.push(tokio::spawn(async move { engine.create_reservation(new).await }));
    }

    let mut admitted = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(()) => admitted += 1,
            Err(e) => assert_eq!(e.rejection(), Some(Rejection::TimeConflict)),
        }
    }
    assert_eq!(admitted, 1);
    assert_eq!(
        engine
            .reservations_for_equipment(lab.chamber)
            .await
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn delete_equipment_races_with_reservation() {
    let lab = lab("delete_race.wal").await;
    let engine = Arc::new(lab.engine);

    let reserve = {
        let engine = engine.clone();
        let new = new_reservation(lab.oven, lab.user, hours(10), hours(11));
        tokio::spawn(async move { engine.create_reservation(new).await })
    };
    let delete = {
        let engine = engine.clone();
        let oven = lab.oven;
        tokio::spawn(async move { engine.delete_equipment(oven).await })
    };
    let reserved = reserve.await.unwrap();
    let deleted = delete.await.unwrap();

    // Either order ends with the equipment gone and nothing left on it.
    match (reserved, deleted) {
        (Ok(()), Ok(1)) | (Err(EngineError::NotFound(_)), Ok(0)) => {}
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert!(engine.get_equipment(lab.oven).await.is_err());
    assert!(engine.all_reservations().await.is_empty());
    assert!(engine.reservation_to_equipment.is_empty());
}
