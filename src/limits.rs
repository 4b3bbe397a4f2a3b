use crate::model::Ms;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_TITLE_LEN: usize = 256;
pub const MAX_DESCRIPTION_LEN: usize = 8 * 1024;
pub const MAX_EMAIL_LEN: usize = 320;
pub const MAX_EXTERNAL_KEY_LEN: usize = 1024;

/// Largest WAL payload accepted on write or replay.
pub const MAX_WAL_RECORD_LEN: usize = 1 << 20;

pub const MAX_ROOMS: usize = 10_000;
pub const MAX_BOOKINGS_PER_ROOM: usize = 200_000;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;
/// A single booking may not run longer than 14 days.
pub const MAX_BOOKING_DURATION_MS: Ms = 14 * 24 * 3_600_000;
