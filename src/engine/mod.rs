mod error;
mod mutations;
mod queries;
#[cfg(test)]
mod tests;
mod validator;

pub use error::EngineError;
pub use validator::{validate, Candidate, Rejection};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

pub type SharedEquipmentState = Arc<RwLock<EquipmentState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// Blocks for the first append, drains whatever else is already queued,
/// then pays for a single fsync and answers every sender in the batch.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };

        let mut batch: Vec<PendingAppend> = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    // Commit what we have before compaction or stats see the WAL.
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        commit_batch(&mut wal, &mut batch);
        if let Some(other) = deferred {
            handle_non_append(&mut wal, other);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(ref e) = result {
        tracing::error!("WAL flush failed for batch of {}: {e}", batch.len());
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let append_result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so partial bytes never leak into the next batch.
    let flush_result = wal.flush_sync();
    append_result.and(flush_result)
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

/// The entity store: users, equipment, additional equipment and reservations.
///
/// Reservations live inside their equipment's state behind a per-equipment
/// write lock. Every reservation write holds that lock across
/// validate → WAL append → apply, so two overlapping requests for the same
/// equipment are serialized and the later one sees the earlier one.
pub struct Engine {
    pub equipment: DashMap<Ulid, SharedEquipmentState>,
    pub users: DashMap<Ulid, User>,
    pub additional_equipment: DashMap<Ulid, AdditionalEquipment>,
    pub(super) usernames: DashMap<String, Ulid>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Reverse lookup: reservation id → equipment id.
    pub(super) reservation_to_equipment: DashMap<Ulid, Ulid>,
    /// Shared by reservation writes, exclusive for catalog changes and the
    /// cascading deletes. Always taken before any equipment lock.
    pub(super) catalog: RwLock<()>,
}

/// Apply a per-equipment event (no locking; caller holds the lock).
fn apply_to_equipment(es: &mut EquipmentState, event: &Event, index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::EquipmentUpdated {
            name,
            description,
            is_available,
            ..
        } => {
            es.name = name.clone();
            es.description = description.clone();
            es.is_available = *is_available;
        }
        Event::ReservationCreated { reservation } => {
            index.insert(reservation.id, reservation.equipment_id);
            es.insert_reservation(reservation.clone());
        }
        Event::ReservationUpdated { reservation } => {
            // Applied to the old equipment (removal) and then the new one (insert).
            es.remove_reservation(reservation.id);
            if reservation.equipment_id == es.id {
                index.insert(reservation.id, reservation.equipment_id);
                es.insert_reservation(reservation.clone());
            }
        }
        Event::ReservationNotified { id, .. } => {
            if let Some(r) = es.reservations.iter_mut().find(|r| r.id == *id) {
                r.notified = true;
            }
        }
        Event::ReservationDeleted { id, .. } => {
            es.remove_reservation(*id);
            index.remove(id);
        }
        // Catalog events are applied at the map level, see `apply_catalog_event`.
        Event::UserRegistered { .. }
        | Event::UserRoleChanged { .. }
        | Event::UserDeleted { .. }
        | Event::EquipmentCreated { .. }
        | Event::EquipmentDeleted { .. }
        | Event::AdditionalEquipmentCreated { .. }
        | Event::AdditionalEquipmentDeleted { .. } => {}
        // Expanded into its parts before anything is applied.
        Event::Batch { .. } => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        let events: Vec<Event> = Wal::replay(&wal_path)?
            .into_iter()
            .flat_map(Event::into_parts)
            .collect();
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            equipment: DashMap::new(),
            users: DashMap::new(),
            additional_equipment: DashMap::new(),
            usernames: DashMap::new(),
            wal_tx,
            reservation_to_equipment: DashMap::new(),
            catalog: RwLock::new(()),
        };

        // We are the sole owner of every Arc during replay, so try_write always
        // succeeds. Never block here: this may run inside an async context.
        for event in &events {
            if engine.apply_catalog_event(event) {
                continue;
            }
            if let Event::ReservationUpdated { reservation } = event
                && let Some(prev) = engine.get_equipment_for_reservation(&reservation.id)
                && prev != reservation.equipment_id
                && let Some(es) = engine.get_equipment_state(&prev)
            {
                let mut guard = es.try_write().expect("replay: uncontended write");
                apply_to_equipment(&mut guard, event, &engine.reservation_to_equipment);
            }
            if let Some(equipment_id) = event_equipment_id(event)
                && let Some(es) = engine.get_equipment_state(&equipment_id)
            {
                let mut guard = es.try_write().expect("replay: uncontended write");
                apply_to_equipment(&mut guard, event, &engine.reservation_to_equipment);
            }
        }

        tracing::info!(
            "replayed {} events: {} users, {} equipment, {} reservations",
            events.len(),
            engine.users.len(),
            engine.equipment.len(),
            engine.reservation_to_equipment.len()
        );
        Ok(engine)
    }

    /// Apply an event that touches only the top-level maps. Returns false for
    /// per-equipment events, which need the equipment lock.
    pub(super) fn apply_catalog_event(&self, event: &Event) -> bool {
        match event {
            Event::UserRegistered {
                id,
                username,
                email,
                role,
            } => {
                self.usernames.insert(username.clone(), *id);
                self.users.insert(
                    *id,
                    User {
                        id: *id,
                        username: username.clone(),
                        email: email.clone(),
                        role: *role,
                    },
                );
            }
            Event::UserRoleChanged { id, role } => {
                if let Some(mut user) = self.users.get_mut(id) {
                    user.role = *role;
                }
            }
            Event::UserDeleted { id } => {
                if let Some((_, user)) = self.users.remove(id) {
                    self.usernames.remove(&user.username);
                }
            }
            Event::EquipmentCreated {
                id,
                name,
                description,
                is_available,
            } => {
                let es = EquipmentState::new(*id, name.clone(), description.clone(), *is_available);
                self.equipment.insert(*id, Arc::new(RwLock::new(es)));
            }
            Event::EquipmentDeleted { id } => {
                self.equipment.remove(id);
            }
            Event::AdditionalEquipmentCreated { id, name } => {
                self.additional_equipment.insert(
                    *id,
                    AdditionalEquipment {
                        id: *id,
                        name: name.clone(),
                    },
                );
            }
            Event::AdditionalEquipmentDeleted { id } => {
                self.additional_equipment.remove(id);
            }
            _ => return false,
        }
        true
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// Append several events as one record: durable together or not at all.
    pub(super) async fn wal_append_all(&self, events: &[Event]) -> Result<(), EngineError> {
        self.wal_append(&Event::batch(events.to_vec())).await
    }

    pub fn get_equipment_state(&self, id: &Ulid) -> Option<SharedEquipmentState> {
        self.equipment.get(id).map(|e| e.value().clone())
    }

    pub fn get_equipment_for_reservation(&self, reservation_id: &Ulid) -> Option<Ulid> {
        self.reservation_to_equipment
            .get(reservation_id)
            .map(|e| *e.value())
    }

    /// WAL-append then apply, under the caller's equipment lock.
    pub(super) async fn persist_and_apply(
        &self,
        es: &mut EquipmentState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_equipment(es, event, &self.reservation_to_equipment);
        Ok(())
    }

    /// Apply committed events under equipment locks the caller already holds.
    /// Catalog events go to the top-level maps, in order.
    pub(super) fn apply_locked(
        &self,
        guards: &mut [OwnedRwLockWriteGuard<EquipmentState>],
        events: &[Event],
    ) {
        for event in events {
            if self.apply_catalog_event(event) {
                continue;
            }
            if let Some(equipment_id) = event_equipment_id(event)
                && let Some(guard) = guards.iter_mut().find(|g| g.id == equipment_id)
            {
                apply_to_equipment(guard, event, &self.reservation_to_equipment);
            }
        }
    }

    /// Acquire an equipment's write lock, failing if it was deleted while we waited.
    pub(super) async fn lock_equipment(
        &self,
        id: Ulid,
    ) -> Result<OwnedRwLockWriteGuard<EquipmentState>, EngineError> {
        let es = self
            .get_equipment_state(&id)
            .ok_or(EngineError::NotFound(id))?;
        let guard = es.clone().write_owned().await;
        let still_current = self
            .equipment
            .get(&id)
            .is_some_and(|e| Arc::ptr_eq(e.value(), &es));
        if !still_current {
            return Err(EngineError::NotFound(id));
        }
        Ok(guard)
    }

    /// Lookup reservation → equipment and acquire that equipment's write lock.
    pub(super) async fn resolve_reservation_write(
        &self,
        reservation_id: &Ulid,
    ) -> Result<(Ulid, OwnedRwLockWriteGuard<EquipmentState>), EngineError> {
        let equipment_id = self
            .get_equipment_for_reservation(reservation_id)
            .ok_or(EngineError::NotFound(*reservation_id))?;
        let guard = self.lock_equipment(equipment_id).await?;
        if guard.get_reservation(*reservation_id).is_none() {
            // Moved to another equipment while we waited.
            return Err(EngineError::NotFound(*reservation_id));
        }
        Ok((equipment_id, guard))
    }
}

/// The equipment whose lock an event needs (None for catalog events).
fn event_equipment_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::EquipmentUpdated { id, .. } => Some(*id),
        Event::ReservationCreated { reservation } | Event::ReservationUpdated { reservation } => {
            Some(reservation.equipment_id)
        }
        Event::ReservationNotified { equipment_id, .. }
        | Event::ReservationDeleted { equipment_id, .. } => Some(*equipment_id),
        Event::UserRegistered { .. }
        | Event::UserRoleChanged { .. }
        | Event::UserDeleted { .. }
        | Event::EquipmentCreated { .. }
        | Event::EquipmentDeleted { .. }
        | Event::AdditionalEquipmentCreated { .. }
        | Event::AdditionalEquipmentDeleted { .. }
        | Event::Batch { .. } => None,
    }
}
