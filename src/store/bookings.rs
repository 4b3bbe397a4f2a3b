use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::policy::{self, Grant};

use super::conflict::{check_no_conflict, validate_range};
use super::{BookingStore, StoreError};

/// A booking request as submitted by the caller.
#[derive(Debug, Clone)]
pub struct NewBooking {
    pub room_id: Ulid,
    pub owner_id: Ulid,
    pub title: String,
    pub description: Option<String>,
    pub range: TimeRange,
    pub time_zone: Option<String>,
}

/// Fields to change on an existing booking. `None` leaves a field alone;
/// the nested options clear a field with `Some(None)`.
#[derive(Debug, Clone, Default)]
pub struct BookingPatch {
    pub room_id: Option<Ulid>,
    pub title: Option<String>,
    pub description: Option<Option<String>>,
    pub range: Option<TimeRange>,
    pub time_zone: Option<Option<String>>,
}

impl BookingPatch {
    pub fn is_empty(&self) -> bool {
        self.room_id.is_none()
            && self.title.is_none()
            && self.description.is_none()
            && self.range.is_none()
            && self.time_zone.is_none()
    }
}

/// The booking before and after an update.
#[derive(Debug, Clone)]
pub struct BookingUpdate {
    pub previous: Booking,
    pub booking: Booking,
}

impl BookingUpdate {
    pub fn moved_room(&self) -> bool {
        self.previous.room_id != self.booking.room_id
    }
}

pub(super) fn validate_text(title: &str, description: Option<&str>) -> Result<(), StoreError> {
    if title.len() > MAX_TITLE_LEN {
        return Err(StoreError::LimitExceeded("title too long"));
    }
    if description.is_some_and(|d| d.len() > MAX_DESCRIPTION_LEN) {
        return Err(StoreError::LimitExceeded("description too long"));
    }
    Ok(())
}

fn log_override(requester: &Principal, booking: &Booking, action: &str) {
    metrics::counter!(crate::observability::ADMIN_OVERRIDES_TOTAL, "action" => action.to_string())
        .increment(1);
    tracing::warn!(
        "admin {} {action} booking {} owned by {}",
        requester.user.email,
        booking.id,
        booking.owner_id
    );
}

impl BookingStore {
    /// Create a confirmed booking. The conflict check and the insert happen
    /// under the room's write lock, so of two overlapping requests for one
    /// room exactly one succeeds.
    pub async fn create_booking(
        &self,
        requester: &Principal,
        new: NewBooking,
    ) -> Result<Booking, StoreError> {
        validate_range(&new.range)?;
        validate_text(&new.title, new.description.as_deref())?;
        if !policy::is_admitted(requester) {
            return Err(StoreError::Forbidden("principal is not admitted"));
        }
        if new.owner_id != requester.id() {
            if !policy::can_manage(requester) {
                return Err(StoreError::Forbidden("cannot book on behalf of another user"));
            }
            if !self.users.contains_key(&new.owner_id) {
                return Err(StoreError::NotFound(new.owner_id));
            }
        }

        let mut guard = self.lock_room(&new.room_id).await?;
        if !guard.room.active {
            return Err(StoreError::RoomInactive(new.room_id));
        }
        let location = self.location_of(&guard.room);
        if !policy::can_view_room(requester, &guard.room, location.as_ref()) {
            return Err(StoreError::Forbidden("room is not visible to this user"));
        }
        if guard.bookings.len() >= MAX_BOOKINGS_PER_ROOM {
            return Err(StoreError::LimitExceeded("too many bookings in room"));
        }
        check_no_conflict(&guard, &new.range, None)?;

        let booking = Booking {
            id: Ulid::new(),
            room_id: new.room_id,
            owner_id: new.owner_id,
            title: new.title,
            description: new.description,
            range: new.range,
            time_zone: new.time_zone,
            status: BookingStatus::Confirmed,
            external_event_id: None,
            external_uid: None,
            cancelled_by: None,
        };
        self.persist_room_event(&mut guard, &Event::BookingCreated(booking.clone()))
            .await?;
        metrics::counter!(crate::observability::BOOKINGS_CREATED_TOTAL, "origin" => "local")
            .increment(1);
        tracing::info!(
            "booking {} created in room {} by {}",
            booking.id,
            booking.room_id,
            requester.user.email
        );
        Ok(booking)
    }

    /// Change a confirmed booking. A changed room or range reruns the
    /// conflict check against the target room, ignoring the booking itself.
    /// Moving rooms write-locks both rooms in ascending id order.
    pub async fn update_booking(
        &self,
        booking_id: Ulid,
        requester: &Principal,
        patch: BookingPatch,
    ) -> Result<BookingUpdate, StoreError> {
        if let Some(range) = &patch.range {
            validate_range(range)?;
        }
        if let Some(title) = &patch.title {
            validate_text(title, None)?;
        }
        if let Some(Some(description)) = &patch.description {
            validate_text("", Some(description))?;
        }
        if !policy::is_admitted(requester) {
            return Err(StoreError::Forbidden("principal is not admitted"));
        }

        loop {
            let current = self
                .get_room_for_booking(&booking_id)
                .ok_or(StoreError::NotFound(booking_id))?;
            let target = patch.room_id.unwrap_or(current);

            if target == current {
                let mut guard = self.resolve_booking_write(&booking_id).await?;
                if guard.room.id != target && patch.room_id.is_some() {
                    // Moved by someone else since the lookup.
                    continue;
                }
                let previous = guard
                    .booking(&booking_id)
                    .cloned()
                    .ok_or(StoreError::NotFound(booking_id))?;
                let (booking, grant) = self.prepare_update(requester, &previous, &guard.room, &patch)?;
                check_no_conflict(&guard, &booking.range, Some(booking_id))?;

                let event = Event::BookingUpdated {
                    booking: booking.clone(),
                    previous_room_id: previous.room_id,
                };
                self.persist_room_event(&mut guard, &event).await?;
                if grant == Grant::AdminOverride {
                    log_override(requester, &booking, "updated");
                }
                return Ok(BookingUpdate { previous, booking });
            }

            let (mut from, mut to) = self.lock_room_pair(current, target).await?;
            let Some(previous) = from.booking(&booking_id).cloned() else {
                continue;
            };
            let (booking, grant) = self.prepare_update(requester, &previous, &to.room, &patch)?;
            if to.bookings.len() >= MAX_BOOKINGS_PER_ROOM {
                return Err(StoreError::LimitExceeded("too many bookings in room"));
            }
            check_no_conflict(&to, &booking.range, Some(booking_id))?;

            let event = Event::BookingUpdated {
                booking: booking.clone(),
                previous_room_id: current,
            };
            self.wal_append(&event).await?;
            self.apply_room_event(&mut from, &event);
            self.apply_room_event(&mut to, &event);
            self.notify.send(current, &event);
            self.notify.send(target, &event);
            if grant == Grant::AdminOverride {
                log_override(requester, &booking, "moved");
            }
            tracing::info!("booking {booking_id} moved from room {current} to {target}");
            return Ok(BookingUpdate { previous, booking });
        }
    }

    /// Authorize a patch against the booking and its target room, and build
    /// the resulting record.
    fn prepare_update(
        &self,
        requester: &Principal,
        previous: &Booking,
        target_room: &Room,
        patch: &BookingPatch,
    ) -> Result<(Booking, Grant), StoreError> {
        let grant = policy::booking_mutation_grant(requester, previous)
            .ok_or(StoreError::Forbidden("only the owner or an admin may change a booking"))?;
        if !previous.is_confirmed() {
            return Err(StoreError::BookingCancelled(previous.id));
        }
        if target_room.id != previous.room_id {
            if !target_room.active {
                return Err(StoreError::RoomInactive(target_room.id));
            }
            let location = self.location_of(target_room);
            if !policy::can_view_room(requester, target_room, location.as_ref()) {
                return Err(StoreError::Forbidden("room is not visible to this user"));
            }
        }

        let mut booking = previous.clone();
        booking.room_id = target_room.id;
        if let Some(title) = &patch.title {
            booking.title = title.clone();
        }
        if let Some(description) = &patch.description {
            booking.description = description.clone();
        }
        if let Some(range) = patch.range {
            booking.range = range;
        }
        if let Some(time_zone) = &patch.time_zone {
            booking.time_zone = time_zone.clone();
        }
        Ok((booking, grant))
    }

    /// Soft-cancel: the record stays with status `Cancelled` and the acting
    /// user in `cancelled_by`.
    pub async fn cancel_booking(
        &self,
        booking_id: Ulid,
        requester: &Principal,
    ) -> Result<Booking, StoreError> {
        if !policy::is_admitted(requester) {
            return Err(StoreError::Forbidden("principal is not admitted"));
        }
        let mut guard = self.resolve_booking_write(&booking_id).await?;
        let booking = guard
            .booking(&booking_id)
            .cloned()
            .ok_or(StoreError::NotFound(booking_id))?;
        let grant = policy::booking_mutation_grant(requester, &booking)
            .ok_or(StoreError::Forbidden("only the owner or an admin may cancel a booking"))?;
        if !booking.is_confirmed() {
            return Err(StoreError::BookingCancelled(booking_id));
        }

        let event = Event::BookingCancelled {
            id: booking_id,
            room_id: booking.room_id,
            cancelled_by: Some(requester.id()),
        };
        self.persist_room_event(&mut guard, &event).await?;
        metrics::counter!(crate::observability::BOOKINGS_CANCELLED_TOTAL).increment(1);
        if grant == Grant::AdminOverride {
            log_override(requester, &booking, "cancelled");
        } else {
            tracing::info!("booking {booking_id} cancelled by owner");
        }
        guard
            .booking(&booking_id)
            .cloned()
            .ok_or(StoreError::NotFound(booking_id))
    }
}
