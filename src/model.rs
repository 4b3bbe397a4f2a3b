use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

/// Half-open interval `[start, end)`. Construct through [`TimeRange::new`],
/// which rejects empty and inverted ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: Ms,
    pub end: Ms,
}

/// A start/end pair that does not form a valid range (`start >= end`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidRange {
    pub start: Ms,
    pub end: Ms,
}

impl std::fmt::Display for InvalidRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid range: end {} must be after start {}", self.end, self.start)
    }
}

impl std::error::Error for InvalidRange {}

impl TimeRange {
    pub fn new(start: Ms, end: Ms) -> Result<Self, InvalidRange> {
        if start >= end {
            return Err(InvalidRange { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

// ── Entities ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: Ulid,
    /// Identifier assigned by the identity provider (Azure `tid`).
    pub external_id: String,
    pub name: String,
    pub active: bool,
    pub approval: ApprovalStatus,
}

impl Tenant {
    /// Users of this tenant may act at all.
    pub fn is_admitted(&self) -> bool {
        self.active && self.approval == ApprovalStatus::Approved
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub id: Ulid,
    pub name: String,
    pub address: Option<String>,
    pub city: Option<String>,
    pub country: Option<String>,
    pub active: bool,
    /// Tenants whose users may see rooms at this location.
    pub allowed_tenants: Vec<Ulid>,
}

impl Location {
    pub fn allows(&self, tenant_id: &Ulid) -> bool {
        self.allowed_tenants.contains(tenant_id)
    }
}

/// Where a room is drawn on a floor plan. Display-only.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FloorPlacement {
    pub floor_plan_id: Ulid,
    pub x: f32,
    pub y: f32,
    pub width: Option<f32>,
    pub height: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Room {
    pub id: Ulid,
    pub name: String,
    pub capacity: u32,
    pub location_id: Option<Ulid>,
    /// Resource mailbox on the calendar provider, e.g. `boardroom@contoso.com`.
    pub resource_address: Option<String>,
    pub building: Option<String>,
    pub hourly_rate_cents: u32,
    pub active: bool,
    pub placement: Option<FloorPlacement>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    Confirmed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub room_id: Ulid,
    pub owner_id: Ulid,
    pub title: String,
    pub description: Option<String>,
    pub range: TimeRange,
    /// IANA zone name the booking was made in. Never interpreted.
    pub time_zone: Option<String>,
    pub status: BookingStatus,
    pub external_event_id: Option<String>,
    pub external_uid: Option<String>,
    pub cancelled_by: Option<Ulid>,
}

impl Booking {
    pub fn is_confirmed(&self) -> bool {
        self.status == BookingStatus::Confirmed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Admin,
    Member,
    /// Created from a calendar organizer during inward sync.
    External,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserStatus {
    Active,
    Pending,
    Disabled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Ulid,
    pub email: String,
    pub name: Option<String>,
    pub role: Role,
    pub tenant_id: Option<Ulid>,
    pub status: UserStatus,
}

/// An authenticated user together with the tenant it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user: User,
    pub tenant: Option<Tenant>,
}

impl Principal {
    pub fn id(&self) -> Ulid {
        self.user.id
    }

    pub fn is_admin(&self) -> bool {
        self.user.role == Role::Admin
    }
}

/// A provider event its booking no longer points at, waiting for a remote
/// cancel that has not gone through yet. Its UID stays known to calendar
/// sync so the event is not imported as a new booking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetiredEvent {
    pub event_id: String,
    pub uid: Option<String>,
    pub booking_id: Ulid,
    /// Owner of the booking; their calendar holds the event.
    pub owner_id: Ulid,
}

/// Lowercased, trimmed form used for every email and mailbox comparison.
pub fn normalize_address(address: &str) -> String {
    address.trim().to_ascii_lowercase()
}

// ── Per-room state ───────────────────────────────────────────────

/// A room plus every booking ever made in it, sorted by `range.start`.
#[derive(Debug, Clone)]
pub struct RoomState {
    pub room: Room,
    pub bookings: Vec<Booking>,
}

impl RoomState {
    pub fn new(room: Room) -> Self {
        Self {
            room,
            bookings: Vec::new(),
        }
    }

    /// Insert booking maintaining sort order by start.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .partition_point(|b| b.range.start <= booking.range.start);
        self.bookings.insert(pos, booking);
    }

    pub fn remove_booking(&mut self, id: Ulid) -> Option<Booking> {
        let pos = self.bookings.iter().position(|b| b.id == id)?;
        Some(self.bookings.remove(pos))
    }

    pub fn booking(&self, id: &Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == *id)
    }

    pub fn booking_mut(&mut self, id: &Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == *id)
    }

    /// Bookings (any status) whose range overlaps the query window.
    pub fn overlapping(&self, query: &TimeRange) -> impl Iterator<Item = &Booking> {
        // Everything at index >= right_bound starts at or after query.end.
        let right_bound = self
            .bookings
            .partition_point(|b| b.range.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.range.end > query.start)
    }
}

/// WAL record. Entity events carry the full record so replay is a plain upsert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    TenantSaved(Tenant),
    LocationSaved(Location),
    LocationDeleted {
        id: Ulid,
    },
    RoomSaved(Room),
    RoomDeleted {
        id: Ulid,
    },
    UserSaved(User),
    BookingCreated(Booking),
    BookingUpdated {
        booking: Booking,
        previous_room_id: Ulid,
    },
    BookingCancelled {
        id: Ulid,
        room_id: Ulid,
        cancelled_by: Option<Ulid>,
    },
    BookingLinked {
        id: Ulid,
        room_id: Ulid,
        external_event_id: Option<String>,
        external_uid: Option<String>,
    },
    EventRetired(RetiredEvent),
    RetiredEventCleared {
        event_id: String,
    },
}

impl Event {
    /// Room whose change feed this event belongs to, if any.
    pub fn room_id(&self) -> Option<Ulid> {
        match self {
            Event::RoomSaved(room) => Some(room.id),
            Event::RoomDeleted { id } => Some(*id),
            Event::BookingCreated(b) => Some(b.room_id),
            Event::BookingUpdated { booking, .. } => Some(booking.room_id),
            Event::BookingCancelled { room_id, .. } | Event::BookingLinked { room_id, .. } => {
                Some(*room_id)
            }
            Event::TenantSaved(_)
            | Event::LocationSaved(_)
            | Event::LocationDeleted { .. }
            | Event::UserSaved(_)
            | Event::EventRetired(_)
            | Event::RetiredEventCleared { .. } => None,
        }
    }
}
