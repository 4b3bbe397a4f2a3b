use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::admin::{validate_email, validate_external_key};
use super::bookings::validate_text;
use super::conflict::{check_no_conflict, validate_range};
use super::{BookingStore, Keyed, StoreError};

/// A calendar event pulled from the provider, ready to be stored.
#[derive(Debug, Clone)]
pub struct ImportedEvent {
    pub event_id: String,
    pub uid: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub range: TimeRange,
    pub time_zone: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportOutcome {
    Imported(Ulid),
    /// A booking with the same UID, or the same room and exact range,
    /// already exists.
    AlreadyPresent(Ulid),
}

/// A room as described by the provider's room directory.
#[derive(Debug, Clone)]
pub struct DirectoryRoom {
    pub address: String,
    pub name: String,
    pub capacity: Option<u32>,
    pub building: Option<String>,
}

/// Cut `s` to at most `max` bytes on a char boundary. Remote text is not
/// under our control and is stored rather than rejected.
fn truncate(mut s: String, max: usize) -> String {
    if s.len() > max {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        s.truncate(end);
    }
    s
}

impl BookingStore {
    /// Store a remote event as a confirmed booking, unless it is already
    /// known. Matching is by stable UID first, then by exact room and range
    /// regardless of booking status. Serialized per UID, so the same event
    /// imported concurrently lands once.
    pub async fn import_remote_booking(
        &self,
        room_id: Ulid,
        owner_id: Ulid,
        event: ImportedEvent,
    ) -> Result<ImportOutcome, StoreError> {
        validate_range(&event.range)?;
        validate_external_key(&event.event_id)?;
        if let Some(uid) = &event.uid {
            validate_external_key(uid)?;
        }
        let event = ImportedEvent {
            title: truncate(event.title, MAX_TITLE_LEN),
            description: event.description.map(|d| truncate(d, MAX_DESCRIPTION_LEN)),
            ..event
        };
        validate_text(&event.title, event.description.as_deref())?;
        if !self.users.contains_key(&owner_id) {
            return Err(StoreError::NotFound(owner_id));
        }

        if let Some(id) = event.uid.as_deref().and_then(|uid| self.retired_booking(uid)) {
            return Ok(ImportOutcome::AlreadyPresent(id));
        }

        let keyed = match event.uid.clone() {
            Some(uid) => {
                self.bookings_by_uid
                    .find_or_create(&uid, || self.import_locked(room_id, owner_id, &event))
                    .await?
            }
            None => self.import_locked(room_id, owner_id, &event).await?,
        };
        Ok(match keyed {
            Keyed::Created(id) => ImportOutcome::Imported(id),
            Keyed::Found(id) => ImportOutcome::AlreadyPresent(id),
        })
    }

    async fn import_locked(
        &self,
        room_id: Ulid,
        owner_id: Ulid,
        event: &ImportedEvent,
    ) -> Result<Keyed, StoreError> {
        let mut guard = self.lock_room(&room_id).await?;
        if let Some(existing) = guard.bookings.iter().find(|b| b.range == event.range) {
            return Ok(Keyed::Found(existing.id));
        }
        if guard.bookings.len() >= MAX_BOOKINGS_PER_ROOM {
            return Err(StoreError::LimitExceeded("too many bookings in room"));
        }
        check_no_conflict(&guard, &event.range, None)?;

        let booking = Booking {
            id: Ulid::new(),
            room_id,
            owner_id,
            title: event.title.clone(),
            description: event.description.clone(),
            range: event.range,
            time_zone: event.time_zone.clone(),
            status: BookingStatus::Confirmed,
            external_event_id: Some(event.event_id.clone()),
            external_uid: event.uid.clone(),
            cancelled_by: None,
        };
        self.persist_room_event(&mut guard, &Event::BookingCreated(booking.clone()))
            .await?;
        metrics::counter!(crate::observability::BOOKINGS_CREATED_TOTAL, "origin" => "import")
            .increment(1);
        Ok(Keyed::Created(booking.id))
    }

    /// Booking already representing a remote event, by UID or by exact room
    /// and range. A retired event answers with the booking it belonged to.
    pub async fn find_imported(
        &self,
        room_id: Ulid,
        uid: Option<&str>,
        range: &TimeRange,
    ) -> Option<Ulid> {
        if let Some(uid) = uid {
            if let Some(id) = self.bookings_by_uid.get(uid) {
                return Some(id);
            }
            if let Some(id) = self.retired_booking(uid) {
                return Some(id);
            }
        }
        let rs = self.get_room_state(&room_id)?;
        let guard = rs.read().await;
        guard
            .bookings
            .iter()
            .find(|b| b.range == *range)
            .map(|b| b.id)
    }

    /// Attach the provider's event id and stable UID to a booking after a
    /// successful outward push. `None` clears the link.
    pub async fn link_external(
        &self,
        booking_id: Ulid,
        event_id: Option<String>,
        uid: Option<String>,
    ) -> Result<Booking, StoreError> {
        if let Some(key) = &event_id {
            validate_external_key(key)?;
        }
        if let Some(key) = &uid {
            validate_external_key(key)?;
        }
        let mut guard = self.resolve_booking_write(&booking_id).await?;
        let event = Event::BookingLinked {
            id: booking_id,
            room_id: guard.room.id,
            external_event_id: event_id,
            external_uid: uid,
        };
        self.persist_room_event(&mut guard, &event).await?;
        guard
            .booking(&booking_id)
            .cloned()
            .ok_or(StoreError::NotFound(booking_id))
    }

    fn retired_booking(&self, uid: &str) -> Option<Ulid> {
        self.retired_events
            .iter()
            .find(|e| e.uid.as_deref() == Some(uid))
            .map(|e| e.booking_id)
    }

    /// Remember a remote event whose cancel did not reach the provider, so
    /// it can be retried and is never imported back.
    pub async fn retire_remote_event(&self, retired: RetiredEvent) -> Result<(), StoreError> {
        validate_external_key(&retired.event_id)?;
        if let Some(uid) = &retired.uid {
            validate_external_key(uid)?;
        }
        let _catalog = self.catalog_lock.lock().await;
        self.persist_catalog_event(&Event::EventRetired(retired.clone()))
            .await?;
        tracing::info!(
            "remote event {} of booking {} retired, cancel pending",
            retired.event_id,
            retired.booking_id
        );
        Ok(())
    }

    /// Forget a retired event once the provider no longer has it.
    pub async fn clear_retired_event(&self, event_id: &str) -> Result<(), StoreError> {
        let _catalog = self.catalog_lock.lock().await;
        if !self.retired_events.contains_key(event_id) {
            return Ok(());
        }
        self.persist_catalog_event(&Event::RetiredEventCleared {
            event_id: event_id.to_string(),
        })
        .await
    }

    pub fn retired_events(&self) -> Vec<RetiredEvent> {
        let mut retired: Vec<RetiredEvent> =
            self.retired_events.iter().map(|e| e.value().clone()).collect();
        retired.sort_by(|a, b| a.event_id.cmp(&b.event_id));
        retired
    }

    /// Create or refresh a room from the provider directory, keyed by its
    /// normalized resource address. Existing rooms get the remote name and
    /// building; capacity only when the directory reports one. New rooms
    /// are active, unlocated and free of charge.
    pub async fn upsert_directory_room(&self, remote: &DirectoryRoom) -> Result<Keyed, StoreError> {
        let key = normalize_address(&remote.address);
        validate_external_key(&key)?;
        super::admin::validate_name(&remote.name)?;

        let keyed = self
            .rooms_by_address
            .find_or_create(&key, || async {
                let room = Room {
                    id: Ulid::new(),
                    name: remote.name.clone(),
                    capacity: remote.capacity.unwrap_or(0),
                    location_id: None,
                    resource_address: Some(key.clone()),
                    building: remote.building.clone(),
                    hourly_rate_cents: 0,
                    active: true,
                    placement: None,
                };
                let _catalog = self.catalog_lock.lock().await;
                let room = self.persist_new_room(room).await?;
                Ok::<_, StoreError>(Keyed::Created(room.id))
            })
            .await?;

        if let Keyed::Found(id) = keyed {
            let mut guard = self.lock_room(&id).await?;
            let mut room = guard.room.clone();
            room.name = remote.name.clone();
            if let Some(capacity) = remote.capacity {
                room.capacity = capacity;
            }
            if remote.building.is_some() {
                room.building = remote.building.clone();
            }
            if room != guard.room {
                self.persist_room_event(&mut guard, &Event::RoomSaved(room))
                    .await?;
            }
        }
        Ok(keyed)
    }

    /// Resolve a user by email, creating an active one with `role` if none
    /// exists. Returns the user and whether it was created.
    pub async fn find_or_create_user(
        &self,
        email: &str,
        name: Option<&str>,
        role: Role,
    ) -> Result<(User, bool), StoreError> {
        let email = normalize_address(email);
        validate_email(&email)?;
        let name = name.map(|n| truncate(n.to_string(), MAX_NAME_LEN));

        let keyed = self
            .users_by_email
            .find_or_create(&email, || async {
                let user = User {
                    id: Ulid::new(),
                    email: email.clone(),
                    name: name.clone(),
                    role,
                    tenant_id: None,
                    status: UserStatus::Active,
                };
                let _catalog = self.catalog_lock.lock().await;
                self.persist_catalog_event(&Event::UserSaved(user.clone()))
                    .await?;
                tracing::debug!("created {role:?} user {email}");
                Ok::<_, StoreError>(Keyed::Created(user.id))
            })
            .await?;

        let user = self
            .users
            .get(&keyed.id())
            .map(|u| u.clone())
            .ok_or(StoreError::NotFound(keyed.id()))?;
        Ok((user, keyed.was_created()))
    }
}
