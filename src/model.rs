use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the only time type.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// `[s1, e1)` and `[s2, e2)` overlap iff `s1 < e2 && s2 < e1`.
    /// Touching endpoints do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Admin,
    User,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::User => "user",
        }
    }

    pub fn parse(s: &str) -> Option<Role> {
        match s.to_lowercase().as_str() {
            "admin" => Some(Role::Admin),
            "user" => Some(Role::User),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Ulid,
    pub username: String,
    pub email: Option<String>,
    pub role: Role,
}

/// Auxiliary item attachable to any number of reservations. No conflict semantics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdditionalEquipment {
    pub id: Ulid,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub equipment_id: Ulid,
    pub user_id: Ulid,
    pub test_name: String,
    pub temperature: f64,
    pub span: Span,
    /// Sorted, deduplicated.
    pub additional_equipment: Vec<Ulid>,
    /// One-directional: false → true, by administrative action only.
    pub notified: bool,
}

/// One reservable piece of equipment and its reservations.
#[derive(Debug, Clone)]
pub struct EquipmentState {
    pub id: Ulid,
    pub name: String,
    pub description: Option<String>,
    /// Informational only; reservations are admitted regardless.
    pub is_available: bool,
    /// Sorted by `span.start`.
    pub reservations: Vec<Reservation>,
}

impl EquipmentState {
    pub fn new(id: Ulid, name: String, description: Option<String>, is_available: bool) -> Self {
        Self {
            id,
            name,
            description,
            is_available,
            reservations: Vec::new(),
        }
    }

    /// Insert reservation maintaining sort order by span.start.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .binary_search_by_key(&reservation.span.start, |r| r.span.start)
            .unwrap_or_else(|e| e);
        self.reservations.insert(pos, reservation);
    }

    pub fn remove_reservation(&mut self, id: Ulid) -> Option<Reservation> {
        let pos = self.reservations.iter().position(|r| r.id == id)?;
        Some(self.reservations.remove(pos))
    }

    pub fn get_reservation(&self, id: Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == id)
    }

    /// Reservations whose span overlaps the query window.
    /// Binary search skips everything starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Reservation> {
        let right_bound = self
            .reservations
            .partition_point(|r| r.span.start < query.end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.span.end > query.start)
    }

    pub fn info(&self) -> EquipmentInfo {
        EquipmentInfo {
            id: self.id,
            name: self.name.clone(),
            description: self.description.clone(),
            is_available: self.is_available,
        }
    }
}

/// WAL record format. One variant per state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    UserRegistered {
        id: Ulid,
        username: String,
        email: Option<String>,
        role: Role,
    },
    UserRoleChanged {
        id: Ulid,
        role: Role,
    },
    UserDeleted {
        id: Ulid,
    },
    EquipmentCreated {
        id: Ulid,
        name: String,
        description: Option<String>,
        is_available: bool,
    },
    EquipmentUpdated {
        id: Ulid,
        name: String,
        description: Option<String>,
        is_available: bool,
    },
    EquipmentDeleted {
        id: Ulid,
    },
    AdditionalEquipmentCreated {
        id: Ulid,
        name: String,
    },
    AdditionalEquipmentDeleted {
        id: Ulid,
    },
    ReservationCreated {
        reservation: Reservation,
    },
    /// Full replacement; `reservation.equipment_id` may differ from the previous one.
    ReservationUpdated {
        reservation: Reservation,
    },
    ReservationNotified {
        id: Ulid,
        equipment_id: Ulid,
    },
    ReservationDeleted {
        id: Ulid,
        equipment_id: Ulid,
    },
    /// Several events written as one WAL record, so they replay together or
    /// not at all. Never nested.
    Batch {
        events: Vec<Event>,
    },
}

impl Event {
    /// Wrap `events` so they commit as a single record.
    pub fn batch(mut events: Vec<Event>) -> Event {
        if events.len() == 1 {
            events.remove(0)
        } else {
            Event::Batch { events }
        }
    }

    /// The individual state changes this record stands for.
    pub fn into_parts(self) -> Vec<Event> {
        match self {
            Event::Batch { events } => events,
            other => vec![other],
        }
    }
}

// ── Mutation inputs ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct NewReservation {
    pub id: Ulid,
    pub equipment_id: Ulid,
    pub user_id: Ulid,
    pub test_name: String,
    pub temperature: f64,
    pub start: Ms,
    pub end: Ms,
    pub additional_equipment: Vec<Ulid>,
}

/// Fields left `None` keep their current value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReservationPatch {
    pub equipment_id: Option<Ulid>,
    pub test_name: Option<String>,
    pub temperature: Option<f64>,
    pub start: Option<Ms>,
    pub end: Option<Ms>,
    pub additional_equipment: Option<Vec<Ulid>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EquipmentPatch {
    pub name: Option<String>,
    /// `Some(None)` clears the description.
    pub description: Option<Option<String>>,
    pub is_available: Option<bool>,
}

impl EquipmentPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.description.is_none() && self.is_available.is_none()
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EquipmentInfo {
    pub id: Ulid,
    pub name: String,
    pub description: Option<String>,
    pub is_available: bool,
}
