//! Who is asking, and what they may see or do.
//!
//! The reservation validator knows nothing about users or roles; every
//! capability and visibility rule lives here and is applied by the wire
//! layer before a command reaches the engine.

use ulid::Ulid;

use crate::engine::{Engine, EngineError};
use crate::model::{Reservation, Role, User};
use crate::sql::{Command, ReservationFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Viewer {
    /// The configured service login. Acts with admin capability but owns
    /// no reservations of its own.
    Service,
    Member { user_id: Ulid, role: Role },
}

/// Map a pgwire login to a viewer. Looked up on every query, so a role
/// change or user deletion takes effect on open connections too.
pub fn resolve(engine: &Engine, login: &str, service_user: &str) -> Result<Viewer, EngineError> {
    if login == service_user {
        return Ok(Viewer::Service);
    }
    match engine.find_user_by_username(login) {
        Some(user) => Ok(Viewer::Member {
            user_id: user.id,
            role: user.role,
        }),
        None => Err(EngineError::Forbidden("login is not a registered user")),
    }
}

impl Viewer {
    pub fn is_admin(&self) -> bool {
        match self {
            Viewer::Service => true,
            Viewer::Member { role, .. } => *role == Role::Admin,
        }
    }

    pub fn user_id(&self) -> Option<Ulid> {
        match self {
            Viewer::Service => None,
            Viewer::Member { user_id, .. } => Some(*user_id),
        }
    }

    pub fn require_admin(&self, what: &'static str) -> Result<(), EngineError> {
        if self.is_admin() {
            Ok(())
        } else {
            Err(EngineError::Forbidden(what))
        }
    }

    /// Admins act on anyone's reservations; users only on their own.
    pub fn require_owner_or_admin(&self, owner: Ulid) -> Result<(), EngineError> {
        if self.is_admin() || self.user_id() == Some(owner) {
            Ok(())
        } else {
            Err(EngineError::Forbidden("not your reservation"))
        }
    }

    pub fn can_see_reservation(&self, reservation: &Reservation) -> bool {
        self.is_admin() || self.user_id() == Some(reservation.user_id)
    }

    pub fn can_see_user(&self, user: &User) -> bool {
        self.is_admin() || self.user_id() == Some(user.id)
    }

    /// Narrow a reservation filter to what this viewer may list.
    /// Non-admins always get their own `user_id` pinned.
    pub fn scope_filter(&self, mut filter: ReservationFilter) -> ReservationFilter {
        if !self.is_admin() {
            filter.user_id = self.user_id();
        }
        filter
    }

    /// Checks that need no store lookup. Ownership of an existing
    /// reservation is checked separately via [`Viewer::require_owner_or_admin`].
    pub fn authorize(&self, cmd: &Command) -> Result<(), EngineError> {
        match cmd {
            Command::InsertUser { role, .. } => {
                if *role == Role::Admin {
                    self.require_admin("only admins can create admin users")?;
                }
                Ok(())
            }
            Command::UpdateUserRole { .. } | Command::DeleteUser { .. } => {
                self.require_admin("user management requires admin")
            }
            Command::InsertEquipment { .. }
            | Command::UpdateEquipment { .. }
            | Command::DeleteEquipment { .. }
            | Command::InsertAdditionalEquipment { .. }
            | Command::DeleteAdditionalEquipment { .. } => {
                self.require_admin("equipment management requires admin")
            }
            Command::InsertReservation(new) => self.require_self_or_admin(new.user_id),
            Command::BatchInsertReservations(batch) => batch
                .iter()
                .try_for_each(|new| self.require_self_or_admin(new.user_id)),
            Command::MarkNotified { .. } => {
                self.require_admin("marking reservations notified requires admin")
            }
            Command::UpdateReservation { .. }
            | Command::DeleteReservation { .. }
            | Command::SelectEquipment { .. }
            | Command::SelectUsers { .. }
            | Command::SelectAdditionalEquipment
            | Command::SelectReservations(_) => Ok(()),
        }
    }

    fn require_self_or_admin(&self, user_id: Ulid) -> Result<(), EngineError> {
        if self.is_admin() || self.user_id() == Some(user_id) {
            Ok(())
        } else {
            Err(EngineError::Forbidden("cannot reserve on behalf of another user"))
        }
    }
}
