use crate::model::Ms;

pub const MAX_EQUIPMENT: usize = 10_000;
pub const MAX_USERS: usize = 100_000;
pub const MAX_ADDITIONAL_EQUIPMENT: usize = 10_000;
pub const MAX_RESERVATIONS_PER_EQUIPMENT: usize = 100_000;

pub const MAX_USERNAME_LEN: usize = 150;
pub const MAX_EMAIL_LEN: usize = 254;
pub const MAX_EQUIPMENT_NAME_LEN: usize = 100;
pub const MAX_DESCRIPTION_LEN: usize = 10_000;
pub const MAX_ADDITIONAL_NAME_LEN: usize = 50;
pub const MAX_TEST_NAME_LEN: usize = 100;
pub const MAX_ADDITIONAL_PER_RESERVATION: usize = 64;

pub const MAX_BATCH_SIZE: usize = 1_000;
/// Largest encoded WAL record. A length prefix above this is a corrupt tail.
pub const MAX_WAL_RECORD_BYTES: usize = 64 * 1024 * 1024;
pub const MAX_IN_CLAUSE_IDS: usize = 1_000;

/// 1970-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 9999-12-31T23:59:59.999Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 253_402_300_799_999;
/// One leap year.
pub const MAX_SPAN_DURATION_MS: Ms = 366 * 24 * 3_600_000;
