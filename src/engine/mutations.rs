use std::collections::{HashMap, HashSet};

use tokio::sync::{oneshot, OwnedRwLockWriteGuard};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::validator::{
    check_reservation_fields, check_span_limits, validate, Candidate, Rejection,
};
use super::{apply_to_equipment, Engine, EngineError, WalCommand};

fn check_name(name: &str, max: usize, what: &'static str) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(EngineError::InvalidField(what));
    }
    if name.chars().count() > max {
        return Err(EngineError::LimitExceeded(what));
    }
    Ok(())
}

fn check_description(description: &Option<String>) -> Result<(), EngineError> {
    if let Some(d) = description
        && d.len() > MAX_DESCRIPTION_LEN
    {
        return Err(EngineError::LimitExceeded("description too long"));
    }
    Ok(())
}

fn normalize_ids(mut ids: Vec<Ulid>) -> Vec<Ulid> {
    ids.sort();
    ids.dedup();
    ids
}

impl Engine {
    // ── Users ────────────────────────────────────────────────

    pub async fn register_user(
        &self,
        id: Ulid,
        username: String,
        email: Option<String>,
        role: Role,
    ) -> Result<(), EngineError> {
        let username = username.trim().to_string();
        check_name(&username, MAX_USERNAME_LEN, "username")?;
        if let Some(ref e) = email {
            if e.len() > MAX_EMAIL_LEN {
                return Err(EngineError::LimitExceeded("email too long"));
            }
            if !e.contains('@') {
                return Err(EngineError::InvalidField("email must contain '@'"));
            }
        }

        let _catalog = self.catalog.write().await;
        if self.users.len() >= MAX_USERS {
            return Err(EngineError::LimitExceeded("too many users"));
        }
        if self.users.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if self.usernames.contains_key(&username) {
            return Err(EngineError::UsernameTaken(username));
        }

        let event = Event::UserRegistered { id, username, email, role };
        self.wal_append(&event).await?;
        self.apply_catalog_event(&event);
        tracing::info!("registered user {id} ({})", role.as_str());
        Ok(())
    }

    pub async fn set_user_role(&self, id: Ulid, role: Role) -> Result<(), EngineError> {
        let _catalog = self.catalog.write().await;
        if !self.users.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::UserRoleChanged { id, role };
        self.wal_append(&event).await?;
        self.apply_catalog_event(&event);
        Ok(())
    }

    /// Delete a user together with every reservation they hold. Returns the
    /// number of reservations removed with them.
    pub async fn delete_user(&self, id: Ulid) -> Result<usize, EngineError> {
        let _catalog = self.catalog.write().await;
        if !self.users.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        let mut guards = self.lock_dependents(|r| r.user_id == id).await?;
        let mut events = Vec::new();
        for guard in &guards {
            for r in guard.reservations.iter().filter(|r| r.user_id == id) {
                events.push(Event::ReservationDeleted {
                    id: r.id,
                    equipment_id: guard.id,
                });
            }
        }
        let removed = events.len();
        events.push(Event::UserDeleted { id });

        self.wal_append_all(&events).await?;
        self.apply_locked(&mut guards, &events);
        tracing::info!("deleted user {id} and {removed} reservations");
        Ok(removed)
    }

    // ── Equipment ────────────────────────────────────────────

    pub async fn create_equipment(
        &self,
        id: Ulid,
        name: String,
        description: Option<String>,
        is_available: bool,
    ) -> Result<(), EngineError> {
        check_name(&name, MAX_EQUIPMENT_NAME_LEN, "equipment name")?;
        check_description(&description)?;

        let _catalog = self.catalog.write().await;
        if self.equipment.len() >= MAX_EQUIPMENT {
            return Err(EngineError::LimitExceeded("too much equipment"));
        }
        if self.equipment.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::EquipmentCreated { id, name, description, is_available };
        self.wal_append(&event).await?;
        self.apply_catalog_event(&event);
        Ok(())
    }

    /// Apply `patch` to every listed equipment. All ids must exist or nothing
    /// changes. Returns the number of equipment updated.
    ///
    /// Bulk "mark unavailable" is `is_available: Some(false)` over many ids;
    /// it does not touch existing reservations.
    pub async fn update_equipment(
        &self,
        ids: Vec<Ulid>,
        patch: EquipmentPatch,
    ) -> Result<usize, EngineError> {
        if patch.is_empty() {
            return Err(EngineError::InvalidField("nothing to update"));
        }
        if let Some(ref name) = patch.name {
            check_name(name, MAX_EQUIPMENT_NAME_LEN, "equipment name")?;
        }
        if let Some(ref description) = patch.description {
            check_description(description)?;
        }
        let ids = normalize_ids(ids);
        if ids.len() > MAX_IN_CLAUSE_IDS {
            return Err(EngineError::LimitExceeded("too many equipment ids"));
        }

        // Sorted order prevents deadlocks with other multi-equipment writers.
        let mut guards = Vec::with_capacity(ids.len());
        for id in &ids {
            guards.push(self.lock_equipment(*id).await?);
        }

        let events: Vec<Event> = guards
            .iter()
            .map(|guard| Event::EquipmentUpdated {
                id: guard.id,
                name: patch.name.clone().unwrap_or_else(|| guard.name.clone()),
                description: patch
                    .description
                    .clone()
                    .unwrap_or_else(|| guard.description.clone()),
                is_available: patch.is_available.unwrap_or(guard.is_available),
            })
            .collect();
        self.wal_append_all(&events).await?;
        self.apply_locked(&mut guards, &events);
        Ok(ids.len())
    }

    /// Delete equipment and every reservation on it. Returns the number of
    /// reservations removed with it.
    pub async fn delete_equipment(&self, id: Ulid) -> Result<usize, EngineError> {
        let _catalog = self.catalog.write().await;
        let guard = self.lock_equipment(id).await?;
        let mut events: Vec<Event> = guard
            .reservations
            .iter()
            .map(|r| Event::ReservationDeleted {
                id: r.id,
                equipment_id: id,
            })
            .collect();
        let removed = events.len();
        events.push(Event::EquipmentDeleted { id });

        self.wal_append_all(&events).await?;
        // Removed from the map while still locked, so waiters see NotFound.
        let mut guards = [guard];
        self.apply_locked(&mut guards, &events);
        tracing::info!("deleted equipment {id} and {removed} reservations");
        Ok(removed)
    }

    // ── Additional equipment ─────────────────────────────────

    pub async fn create_additional_equipment(
        &self,
        id: Ulid,
        name: String,
    ) -> Result<(), EngineError> {
        check_name(&name, MAX_ADDITIONAL_NAME_LEN, "additional equipment name")?;

        let _catalog = self.catalog.write().await;
        if self.additional_equipment.len() >= MAX_ADDITIONAL_EQUIPMENT {
            return Err(EngineError::LimitExceeded("too much additional equipment"));
        }
        if self.additional_equipment.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let event = Event::AdditionalEquipmentCreated { id, name };
        self.wal_append(&event).await?;
        self.apply_catalog_event(&event);
        Ok(())
    }

    /// Delete additional equipment and detach it from every reservation that
    /// lists it. The reservations themselves stay. Returns how many were touched.
    pub async fn delete_additional_equipment(&self, id: Ulid) -> Result<usize, EngineError> {
        let _catalog = self.catalog.write().await;
        if !self.additional_equipment.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        let mut guards = self
            .lock_dependents(|r| r.additional_equipment.contains(&id))
            .await?;
        let mut events = Vec::new();
        for guard in &guards {
            for r in guard
                .reservations
                .iter()
                .filter(|r| r.additional_equipment.contains(&id))
            {
                let mut updated = r.clone();
                updated.additional_equipment.retain(|a| *a != id);
                events.push(Event::ReservationUpdated {
                    reservation: updated,
                });
            }
        }
        let detached = events.len();
        events.push(Event::AdditionalEquipmentDeleted { id });

        self.wal_append_all(&events).await?;
        self.apply_locked(&mut guards, &events);
        Ok(detached)
    }

    // ── Reservations ─────────────────────────────────────────

    /// Validate and persist a new reservation as one atomic step.
    ///
    /// The equipment's write lock is held from validation until the event
    /// is durable and applied, so a concurrent overlapping request on the
    /// same equipment observes this one and is rejected.
    pub async fn create_reservation(&self, new: NewReservation) -> Result<(), EngineError> {
        check_reservation_fields(&new.test_name, new.temperature, &new.additional_equipment)?;

        let _catalog = self.catalog.read().await;
        self.check_references(new.user_id, &new.additional_equipment)?;
        if self.reservation_to_equipment.contains_key(&new.id) {
            return Err(EngineError::AlreadyExists(new.id));
        }

        let mut guard = self.lock_equipment(new.equipment_id).await?;
        if guard.reservations.len() >= MAX_RESERVATIONS_PER_EQUIPMENT {
            return Err(EngineError::LimitExceeded("too many reservations on equipment"));
        }

        let candidate = Candidate {
            equipment_id: new.equipment_id,
            start: new.start,
            end: new.end,
        };
        let span = self.admit(&guard, &candidate, None)?;

        let event = Event::ReservationCreated {
            reservation: build_reservation(new, span),
        };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// Create several reservations at once. All-or-nothing: if any candidate
    /// is rejected (against the store or against another candidate of the
    /// same batch), none are committed. Reservations may span equipment.
    pub async fn batch_create_reservations(
        &self,
        batch: Vec<NewReservation>,
    ) -> Result<usize, EngineError> {
        if batch.is_empty() {
            return Ok(0);
        }
        if batch.len() > MAX_BATCH_SIZE {
            return Err(EngineError::LimitExceeded("batch too large"));
        }
        let mut seen = HashSet::new();
        for new in &batch {
            check_reservation_fields(&new.test_name, new.temperature, &new.additional_equipment)?;
            if !seen.insert(new.id) {
                return Err(EngineError::AlreadyExists(new.id));
            }
        }

        let _catalog = self.catalog.read().await;
        for new in &batch {
            self.check_references(new.user_id, &new.additional_equipment)?;
            if self.reservation_to_equipment.contains_key(&new.id) {
                return Err(EngineError::AlreadyExists(new.id));
            }
        }

        // Acquire write locks in sorted order to prevent deadlocks.
        let equipment_ids = normalize_ids(batch.iter().map(|n| n.equipment_id).collect());
        let mut guards = Vec::with_capacity(equipment_ids.len());
        let mut slot: HashMap<Ulid, usize> = HashMap::new();
        for eid in &equipment_ids {
            let guard = self.lock_equipment(*eid).await?;
            slot.insert(*eid, guards.len());
            guards.push(guard);
        }

        // Phase 1: validate every candidate against the store, then against
        // the earlier candidates of this batch on the same equipment.
        let mut admitted: HashMap<Ulid, Vec<Span>> = HashMap::new();
        let mut spans = Vec::with_capacity(batch.len());
        for new in &batch {
            let guard = &guards[slot[&new.equipment_id]];
            let candidate = Candidate {
                equipment_id: new.equipment_id,
                start: new.start,
                end: new.end,
            };
            let span = self.admit(guard, &candidate, None)?;
            let siblings = admitted.entry(new.equipment_id).or_default();
            if siblings.iter().any(|s| s.overlaps(&span)) {
                self.record_rejection(Rejection::TimeConflict, &candidate);
                return Err(Rejection::TimeConflict.into());
            }
            if guard.reservations.len() + siblings.len() >= MAX_RESERVATIONS_PER_EQUIPMENT {
                return Err(EngineError::LimitExceeded("too many reservations on equipment"));
            }
            siblings.push(span);
            spans.push(span);
        }

        // Phase 2: all admitted, commit as one WAL record.
        let events: Vec<Event> = batch
            .into_iter()
            .zip(spans)
            .map(|(new, span)| Event::ReservationCreated {
                reservation: build_reservation(new, span),
            })
            .collect();
        self.wal_append_all(&events).await?;
        self.apply_locked(&mut guards, &events);
        Ok(events.len())
    }

    /// Edit a reservation in place. The new window is re-validated with the
    /// reservation's own prior record excluded, so shrinking or extending it
    /// never conflicts with itself. `notified` and the owner are preserved.
    pub async fn update_reservation(
        &self,
        id: Ulid,
        patch: ReservationPatch,
    ) -> Result<Reservation, EngineError> {
        let _catalog = self.catalog.read().await;
        if let Some(ref extra) = patch.additional_equipment {
            for aid in extra {
                if !self.additional_equipment.contains_key(aid) {
                    return Err(EngineError::NotFound(*aid));
                }
            }
        }

        let current_eid = self
            .get_equipment_for_reservation(&id)
            .ok_or(EngineError::NotFound(id))?;
        let target_eid = patch.equipment_id.unwrap_or(current_eid);

        if target_eid == current_eid {
            let mut guard = self.lock_equipment(current_eid).await?;
            let existing = guard
                .get_reservation(id)
                .cloned()
                .ok_or(EngineError::NotFound(id))?;
            let (candidate, updated) = merge_patch(&existing, patch, target_eid)?;
            let span = self.admit(&guard, &candidate, Some(id))?;
            let reservation = Reservation { span, ..updated };
            let event = Event::ReservationUpdated {
                reservation: reservation.clone(),
            };
            self.persist_and_apply(&mut guard, &event).await?;
            return Ok(reservation);
        }

        // Moving to another equipment: lock both in sorted order.
        let (first, second) = if current_eid < target_eid {
            (current_eid, target_eid)
        } else {
            (target_eid, current_eid)
        };
        let first_guard = self.lock_equipment(first).await?;
        let second_guard = self.lock_equipment(second).await?;
        let (mut old_guard, mut new_guard) = if first == current_eid {
            (first_guard, second_guard)
        } else {
            (second_guard, first_guard)
        };

        let existing = old_guard
            .get_reservation(id)
            .cloned()
            .ok_or(EngineError::NotFound(id))?;
        if new_guard.reservations.len() >= MAX_RESERVATIONS_PER_EQUIPMENT {
            return Err(EngineError::LimitExceeded("too many reservations on equipment"));
        }
        let (candidate, updated) = merge_patch(&existing, patch, target_eid)?;
        let span = self.admit(&new_guard, &candidate, Some(id))?;
        let reservation = Reservation { span, ..updated };
        let event = Event::ReservationUpdated {
            reservation: reservation.clone(),
        };
        self.wal_append(&event).await?;
        apply_to_equipment(&mut old_guard, &event, &self.reservation_to_equipment);
        apply_to_equipment(&mut new_guard, &event, &self.reservation_to_equipment);
        Ok(reservation)
    }

    /// Administrative bulk action: set `notified` on every listed reservation.
    /// All ids must exist or nothing changes. Already-notified reservations
    /// are counted but not rewritten. The flag is never cleared.
    pub async fn mark_notified(&self, ids: Vec<Ulid>) -> Result<usize, EngineError> {
        let ids = normalize_ids(ids);
        if ids.len() > MAX_IN_CLAUSE_IDS {
            return Err(EngineError::LimitExceeded("too many reservation ids"));
        }

        let mut by_equipment: HashMap<Ulid, Vec<Ulid>> = HashMap::new();
        for id in &ids {
            let eid = self
                .get_equipment_for_reservation(id)
                .ok_or(EngineError::NotFound(*id))?;
            by_equipment.entry(eid).or_default().push(*id);
        }
        let equipment_ids = normalize_ids(by_equipment.keys().copied().collect());
        let mut guards = Vec::with_capacity(equipment_ids.len());
        for eid in &equipment_ids {
            let guard = self.lock_equipment(*eid).await?;
            for id in &by_equipment[eid] {
                if guard.get_reservation(*id).is_none() {
                    return Err(EngineError::NotFound(*id));
                }
            }
            guards.push(guard);
        }

        let mut events = Vec::new();
        for guard in &guards {
            for id in &by_equipment[&guard.id] {
                if guard.get_reservation(*id).is_some_and(|r| !r.notified) {
                    events.push(Event::ReservationNotified {
                        id: *id,
                        equipment_id: guard.id,
                    });
                }
            }
        }
        if !events.is_empty() {
            self.wal_append_all(&events).await?;
            self.apply_locked(&mut guards, &events);
        }
        Ok(ids.len())
    }

    /// Returns the deleted reservation.
    pub async fn delete_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let (equipment_id, mut guard) = self.resolve_reservation_write(&id).await?;
        let existing = guard
            .get_reservation(id)
            .cloned()
            .ok_or(EngineError::NotFound(id))?;
        let event = Event::ReservationDeleted { id, equipment_id };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(existing)
    }

    // ── Helpers ──────────────────────────────────────────────

    /// Run the validator, then the ambient span limits.
    fn admit(
        &self,
        es: &EquipmentState,
        candidate: &Candidate,
        exclude_id: Option<Ulid>,
    ) -> Result<Span, EngineError> {
        match validate(es, candidate, exclude_id) {
            Ok(span) => {
                check_span_limits(&span)?;
                Ok(span)
            }
            Err(rejection) => {
                self.record_rejection(rejection, candidate);
                Err(rejection.into())
            }
        }
    }

    fn record_rejection(&self, rejection: Rejection, candidate: &Candidate) {
        metrics::counter!(
            crate::observability::RESERVATIONS_REJECTED_TOTAL,
            "reason" => rejection.code()
        )
        .increment(1);
        tracing::debug!(
            "rejected reservation on {} [{}, {}): {}",
            candidate.equipment_id,
            candidate.start,
            candidate.end,
            rejection.code()
        );
    }

    fn check_references(&self, user_id: Ulid, additional: &[Ulid]) -> Result<(), EngineError> {
        if !self.users.contains_key(&user_id) {
            return Err(EngineError::NotFound(user_id));
        }
        for aid in additional {
            if !self.additional_equipment.contains_key(aid) {
                return Err(EngineError::NotFound(*aid));
            }
        }
        Ok(())
    }

    /// Write-lock, in id order, every equipment holding a reservation that
    /// matches `pred`. Callers hold the catalog write lock, so no equipment
    /// appears or disappears meanwhile.
    async fn lock_dependents(
        &self,
        pred: impl Fn(&Reservation) -> bool,
    ) -> Result<Vec<OwnedRwLockWriteGuard<EquipmentState>>, EngineError> {
        let equipment_ids = normalize_ids(self.equipment.iter().map(|e| *e.key()).collect());
        let mut guards = Vec::new();
        for eid in equipment_ids {
            let guard = self.lock_equipment(eid).await?;
            if guard.reservations.iter().any(&pred) {
                guards.push(guard);
            }
        }
        Ok(guards)
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Rewrite the WAL with only the events needed to recreate the current state.
    ///
    /// The catalog lock and every equipment lock are held until the compacted
    /// file is swapped in, so no append can land between snapshot and swap.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _catalog = self.catalog.write().await;

        let mut events = Vec::new();
        let mut users: Vec<User> = self.users.iter().map(|e| e.value().clone()).collect();
        users.sort_by_key(|u| u.id);
        for u in users {
            events.push(Event::UserRegistered {
                id: u.id,
                username: u.username,
                email: u.email,
                role: u.role,
            });
        }
        let mut extras: Vec<AdditionalEquipment> = self
            .additional_equipment
            .iter()
            .map(|e| e.value().clone())
            .collect();
        extras.sort_by_key(|a| a.id);
        for a in extras {
            events.push(Event::AdditionalEquipmentCreated { id: a.id, name: a.name });
        }

        let equipment_ids = normalize_ids(self.equipment.iter().map(|e| *e.key()).collect());
        let mut guards = Vec::with_capacity(equipment_ids.len());
        for eid in &equipment_ids {
            if let Some(es) = self.get_equipment_state(eid) {
                guards.push(es.read_owned().await);
            }
        }
        for guard in &guards {
            events.push(Event::EquipmentCreated {
                id: guard.id,
                name: guard.name.clone(),
                description: guard.description.clone(),
                is_available: guard.is_available,
            });
            for r in &guard.reservations {
                events.push(Event::ReservationCreated { reservation: r.clone() });
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

fn build_reservation(new: NewReservation, span: Span) -> Reservation {
    Reservation {
        id: new.id,
        equipment_id: new.equipment_id,
        user_id: new.user_id,
        test_name: new.test_name,
        temperature: new.temperature,
        span,
        additional_equipment: normalize_ids(new.additional_equipment),
        notified: false,
    }
}

/// Overlay `patch` on `existing`. The returned reservation still carries the
/// old span; the caller replaces it with the validated one.
fn merge_patch(
    existing: &Reservation,
    patch: ReservationPatch,
    equipment_id: Ulid,
) -> Result<(Candidate, Reservation), EngineError> {
    let candidate = Candidate {
        equipment_id,
        start: patch.start.unwrap_or(existing.span.start),
        end: patch.end.unwrap_or(existing.span.end),
    };
    let updated = Reservation {
        id: existing.id,
        equipment_id,
        user_id: existing.user_id,
        test_name: patch.test_name.unwrap_or_else(|| existing.test_name.clone()),
        temperature: patch.temperature.unwrap_or(existing.temperature),
        span: existing.span,
        additional_equipment: patch
            .additional_equipment
            .map(normalize_ids)
            .unwrap_or_else(|| existing.additional_equipment.clone()),
        notified: existing.notified,
    };
    check_reservation_fields(
        &updated.test_name,
        updated.temperature,
        &updated.additional_equipment,
    )?;
    Ok((candidate, updated))
}
