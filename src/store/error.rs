use ulid::Ulid;

use crate::model::InvalidRange;

#[derive(Debug)]
pub enum StoreError {
    InvalidRange(InvalidRange),
    /// Overlaps the named confirmed booking.
    Conflict(Ulid),
    Forbidden(&'static str),
    NotFound(Ulid),
    UnknownUser(String),
    BookingCancelled(Ulid),
    RoomInactive(Ulid),
    RoomInUse(Ulid),
    LocationInUse(Ulid),
    AlreadyExists(String),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::InvalidRange(r) => write!(f, "{r}"),
            StoreError::Conflict(id) => write!(f, "slot unavailable: overlaps booking {id}"),
            StoreError::Forbidden(why) => write!(f, "forbidden: {why}"),
            StoreError::NotFound(id) => write!(f, "not found: {id}"),
            StoreError::UnknownUser(email) => write!(f, "unknown user: {email}"),
            StoreError::BookingCancelled(id) => write!(f, "booking {id} is cancelled"),
            StoreError::RoomInactive(id) => write!(f, "room {id} is not active"),
            StoreError::RoomInUse(id) => {
                write!(f, "cannot delete room {id}: bookings reference it")
            }
            StoreError::LocationInUse(id) => {
                write!(f, "cannot delete location {id}: rooms are assigned to it")
            }
            StoreError::AlreadyExists(key) => write!(f, "already exists: {key}"),
            StoreError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            StoreError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<InvalidRange> for StoreError {
    fn from(r: InvalidRange) -> Self {
        StoreError::InvalidRange(r)
    }
}
