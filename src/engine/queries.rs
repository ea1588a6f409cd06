use ulid::Ulid;

use crate::model::*;

use super::validator::{validate, Candidate};
use super::{Engine, EngineError, SharedEquipmentState};

impl Engine {
    pub(super) fn equipment_states(&self) -> Vec<SharedEquipmentState> {
        self.equipment.iter().map(|e| e.value().clone()).collect()
    }

    pub async fn get_equipment(&self, id: Ulid) -> Result<EquipmentInfo, EngineError> {
        let es = self
            .get_equipment_state(&id)
            .ok_or(EngineError::NotFound(id))?;
        let guard = es.read().await;
        Ok(guard.info())
    }

    /// All equipment, in id (creation) order.
    pub async fn list_equipment(&self) -> Vec<EquipmentInfo> {
        let mut out = Vec::with_capacity(self.equipment.len());
        for es in self.equipment_states() {
            out.push(es.read().await.info());
        }
        out.sort_by_key(|e| e.id);
        out
    }

    pub fn get_user(&self, id: Ulid) -> Result<User, EngineError> {
        self.users
            .get(&id)
            .map(|u| u.value().clone())
            .ok_or(EngineError::NotFound(id))
    }

    pub fn find_user_by_username(&self, username: &str) -> Option<User> {
        let id = *self.usernames.get(username)?.value();
        self.users.get(&id).map(|u| u.value().clone())
    }

    pub fn list_users(&self) -> Vec<User> {
        let mut users: Vec<User> = self.users.iter().map(|e| e.value().clone()).collect();
        users.sort_by_key(|u| u.id);
        users
    }

    pub fn list_additional_equipment(&self) -> Vec<AdditionalEquipment> {
        let mut items: Vec<AdditionalEquipment> = self
            .additional_equipment
            .iter()
            .map(|e| e.value().clone())
            .collect();
        items.sort_by_key(|a| a.id);
        items
    }

    pub async fn get_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let equipment_id = self
            .get_equipment_for_reservation(&id)
            .ok_or(EngineError::NotFound(id))?;
        let es = self
            .get_equipment_state(&equipment_id)
            .ok_or(EngineError::NotFound(id))?;
        let guard = es.read().await;
        guard
            .get_reservation(id)
            .cloned()
            .ok_or(EngineError::NotFound(id))
    }

    /// Reservations on one equipment whose window overlaps `[start, end)`,
    /// minus `exclude_id`. An empty or inverted window overlaps nothing.
    pub async fn find_overlapping(
        &self,
        equipment_id: Ulid,
        start: Ms,
        end: Ms,
        exclude_id: Option<Ulid>,
    ) -> Result<Vec<Reservation>, EngineError> {
        let es = self
            .get_equipment_state(&equipment_id)
            .ok_or(EngineError::NotFound(equipment_id))?;
        if start >= end {
            return Ok(Vec::new());
        }
        let guard = es.read().await;
        Ok(guard
            .overlapping(&Span::new(start, end))
            .filter(|r| Some(r.id) != exclude_id)
            .cloned()
            .collect())
    }

    /// Dry run of the validator against current state. Nothing is persisted,
    /// so a later `create_reservation` may still be rejected.
    pub async fn check_candidate(
        &self,
        candidate: &Candidate,
        exclude_id: Option<Ulid>,
    ) -> Result<Span, EngineError> {
        let es = self
            .get_equipment_state(&candidate.equipment_id)
            .ok_or(EngineError::NotFound(candidate.equipment_id))?;
        let guard = es.read().await;
        Ok(validate(&guard, candidate, exclude_id)?)
    }

    /// Sorted by start time.
    pub async fn reservations_for_equipment(
        &self,
        equipment_id: Ulid,
    ) -> Result<Vec<Reservation>, EngineError> {
        let es = self
            .get_equipment_state(&equipment_id)
            .ok_or(EngineError::NotFound(equipment_id))?;
        let guard = es.read().await;
        Ok(guard.reservations.clone())
    }

    /// Sorted by start time, across all equipment.
    pub async fn reservations_for_user(&self, user_id: Ulid) -> Vec<Reservation> {
        self.collect_reservations(|r| r.user_id == user_id).await
    }

    /// Sorted by start time, across all equipment.
    pub async fn all_reservations(&self) -> Vec<Reservation> {
        self.collect_reservations(|_| true).await
    }

    async fn collect_reservations(&self, pred: impl Fn(&Reservation) -> bool) -> Vec<Reservation> {
        let mut out = Vec::new();
        for es in self.equipment_states() {
            let guard = es.read().await;
            out.extend(guard.reservations.iter().filter(|r| pred(r)).cloned());
        }
        out.sort_by_key(|r| (r.span.start, r.id));
        out
    }
}
