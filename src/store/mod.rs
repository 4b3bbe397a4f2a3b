mod admin;
mod admission;
mod bookings;
mod conflict;
mod error;
mod keyed;
mod queries;
mod sync;

pub use admin::{LocationDraft, RoomDraft, TenantDraft, UserDraft};
pub use admission::FederatedClaims;
pub use bookings::{BookingPatch, BookingUpdate, NewBooking};
pub use conflict::{conflicting_index, has_conflict};
pub use error::StoreError;
pub use keyed::Keyed;
pub use sync::{DirectoryRoom, ImportOutcome, ImportedEvent};

pub(crate) use conflict::now_ms;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

use keyed::KeyIndex;

pub type SharedRoomState = Arc<RwLock<RoomState>>;

// ── Group-commit WAL writer ──────────────────────────────

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

/// Owns the WAL. Appends that queue up while a flush is in progress are
/// committed together with a single fsync; control commands first commit
/// whatever is pending so ordering is preserved.
async fn wal_writer(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    let mut pending: Vec<PendingAppend> = Vec::new();
    while let Some(first) = rx.recv().await {
        let mut next = Some(first);
        while let Some(cmd) = next.take() {
            match cmd {
                WalCommand::Append { event, response } => pending.push((event, response)),
                control => {
                    commit(&mut wal, &mut pending);
                    handle_control(&mut wal, control);
                }
            }
            next = rx.try_recv().ok();
        }
        commit(&mut wal, &mut pending);
    }
}

fn commit(wal: &mut Wal, pending: &mut Vec<PendingAppend>) {
    if pending.is_empty() {
        return;
    }
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(pending.len() as f64);
    let started = std::time::Instant::now();

    let appended = pending
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so half-written bytes are not carried
    // into the next batch; every caller in this batch sees the failure.
    let flushed = wal.flush_sync();
    let outcome = appended.and(flushed);

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    for (_, tx) in pending.drain(..) {
        let reply = match &outcome {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(reply);
    }
}

fn handle_control(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => {}
    }
}

// ── Store ────────────────────────────────────────────────

/// Authoritative store for rooms, bookings, tenants, locations and users.
///
/// Rooms and their bookings live together behind one `RwLock` per room; the
/// conflict check and the write of a booking mutation happen under that
/// room's write lock, which linearizes competing requests for the same room
/// while leaving other rooms untouched. Tenants, locations and users are
/// written under `catalog_lock`. Lock order: key lock, then `catalog_lock`,
/// then room locks in ascending id order.
pub struct BookingStore {
    rooms: DashMap<Ulid, SharedRoomState>,
    /// Reverse lookup: booking id → room id.
    booking_to_room: DashMap<Ulid, Ulid>,
    tenants: DashMap<Ulid, Tenant>,
    locations: DashMap<Ulid, Location>,
    users: DashMap<Ulid, User>,
    /// Remote events awaiting cancellation, by provider event id.
    retired_events: DashMap<String, RetiredEvent>,
    rooms_by_address: KeyIndex,
    bookings_by_uid: KeyIndex,
    users_by_email: KeyIndex,
    tenants_by_external_id: KeyIndex,
    catalog_lock: Mutex<()>,
    wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
}

impl BookingStore {
    /// Open the store at `wal_path`, replaying whatever the log holds.
    /// Must be called inside a tokio runtime (spawns the WAL writer).
    pub fn open(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer(wal, wal_rx));

        let store = Self {
            rooms: DashMap::new(),
            booking_to_room: DashMap::new(),
            tenants: DashMap::new(),
            locations: DashMap::new(),
            users: DashMap::new(),
            retired_events: DashMap::new(),
            rooms_by_address: KeyIndex::default(),
            bookings_by_uid: KeyIndex::default(),
            users_by_email: KeyIndex::default(),
            tenants_by_external_id: KeyIndex::default(),
            catalog_lock: Mutex::new(()),
            wal_tx,
            notify,
        };

        for event in &events {
            store.replay_event(event);
        }
        tracing::info!(
            "store opened from {}: {} events, {} rooms, {} bookings",
            wal_path.display(),
            events.len(),
            store.rooms.len(),
            store.booking_to_room.len()
        );
        Ok(store)
    }

    /// Replay runs before anyone else can see the store, so every lock is
    /// uncontended and `try_write` always succeeds. Never block here: open
    /// may be called from inside an async context.
    fn replay_event(&self, event: &Event) {
        match event {
            Event::RoomSaved(room) => match self.get_room_state(&room.id) {
                Some(rs) => {
                    if let Ok(mut guard) = rs.try_write() {
                        self.apply_room_event(&mut guard, event);
                    }
                }
                None => self.insert_room_state(room.clone()),
            },
            Event::RoomDeleted { id } => {
                let room = self.get_room_state(id).and_then(|rs| {
                    let guard = rs.try_read().ok()?;
                    Some(guard.room.clone())
                });
                if let Some(room) = room {
                    self.remove_room_state(&room);
                }
            }
            Event::BookingUpdated {
                booking,
                previous_room_id,
            } if *previous_room_id != booking.room_id => {
                for room_id in [previous_room_id, &booking.room_id] {
                    if let Some(rs) = self.get_room_state(room_id)
                        && let Ok(mut guard) = rs.try_write()
                    {
                        self.apply_room_event(&mut guard, event);
                    }
                }
            }
            other => match other.room_id() {
                Some(room_id) => {
                    if let Some(rs) = self.get_room_state(&room_id)
                        && let Ok(mut guard) = rs.try_write()
                    {
                        self.apply_room_event(&mut guard, other);
                    }
                }
                None => self.apply_catalog_event(other),
            },
        }
    }

    fn insert_room_state(&self, room: Room) {
        if let Some(address) = &room.resource_address {
            self.rooms_by_address
                .insert(normalize_address(address), room.id);
        }
        let id = room.id;
        self.rooms.insert(id, Arc::new(RwLock::new(RoomState::new(room))));
    }

    fn remove_room_state(&self, room: &Room) {
        self.rooms.remove(&room.id);
        if let Some(address) = &room.resource_address {
            self.rooms_by_address
                .remove_if(&normalize_address(address), room.id);
        }
    }

    /// Apply a room-scoped event. Caller holds the room's write lock.
    /// A cross-room `BookingUpdated` is applied to both rooms: the old room
    /// drops the booking, the new room receives it.
    fn apply_room_event(&self, rs: &mut RoomState, event: &Event) {
        match event {
            Event::RoomSaved(room) => {
                if rs.room.resource_address != room.resource_address {
                    if let Some(old) = &rs.room.resource_address {
                        self.rooms_by_address.remove_if(&normalize_address(old), room.id);
                    }
                    if let Some(new) = &room.resource_address {
                        self.rooms_by_address.insert(normalize_address(new), room.id);
                    }
                }
                rs.room = room.clone();
            }
            Event::BookingCreated(booking) => {
                if let Some(uid) = &booking.external_uid {
                    self.bookings_by_uid.insert(uid.clone(), booking.id);
                }
                self.booking_to_room.insert(booking.id, booking.room_id);
                rs.insert_booking(booking.clone());
            }
            Event::BookingUpdated { booking, .. } => {
                rs.remove_booking(booking.id);
                if rs.room.id == booking.room_id {
                    self.booking_to_room.insert(booking.id, booking.room_id);
                    rs.insert_booking(booking.clone());
                }
            }
            Event::BookingCancelled {
                id, cancelled_by, ..
            } => {
                if let Some(b) = rs.booking_mut(id) {
                    b.status = BookingStatus::Cancelled;
                    b.cancelled_by = *cancelled_by;
                }
            }
            Event::BookingLinked {
                id,
                external_event_id,
                external_uid,
                ..
            } => {
                if let Some(b) = rs.booking_mut(id) {
                    if let Some(old) = &b.external_uid
                        && Some(old) != external_uid.as_ref()
                    {
                        self.bookings_by_uid.remove_if(old, *id);
                    }
                    if let Some(uid) = external_uid {
                        self.bookings_by_uid.insert(uid.clone(), *id);
                    }
                    b.external_event_id = external_event_id.clone();
                    b.external_uid = external_uid.clone();
                }
            }
            // Catalog events and room deletion are handled at the map level.
            Event::RoomDeleted { .. }
            | Event::TenantSaved(_)
            | Event::LocationSaved(_)
            | Event::LocationDeleted { .. }
            | Event::UserSaved(_)
            | Event::EventRetired(_)
            | Event::RetiredEventCleared { .. } => {}
        }
    }

    fn apply_catalog_event(&self, event: &Event) {
        match event {
            Event::TenantSaved(tenant) => {
                if let Some(old) = self.tenants.get(&tenant.id).map(|t| t.external_id.clone())
                    && old != tenant.external_id
                {
                    self.tenants_by_external_id.remove_if(&old, tenant.id);
                }
                self.tenants_by_external_id
                    .insert(tenant.external_id.clone(), tenant.id);
                self.tenants.insert(tenant.id, tenant.clone());
            }
            Event::LocationSaved(location) => {
                self.locations.insert(location.id, location.clone());
            }
            Event::LocationDeleted { id } => {
                self.locations.remove(id);
            }
            Event::UserSaved(user) => {
                let email = normalize_address(&user.email);
                if let Some(old) = self.users.get(&user.id).map(|u| normalize_address(&u.email))
                    && old != email
                {
                    self.users_by_email.remove_if(&old, user.id);
                }
                self.users_by_email.insert(email, user.id);
                self.users.insert(user.id, user.clone());
            }
            Event::EventRetired(retired) => {
                self.retired_events
                    .insert(retired.event_id.clone(), retired.clone());
            }
            Event::RetiredEventCleared { event_id } => {
                self.retired_events.remove(event_id);
            }
            _ => {}
        }
    }

    /// Write an event to the WAL through the group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| StoreError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::WalError(e.to_string()))
    }

    /// WAL-append, apply to the locked room, publish on the room's feed.
    pub(super) async fn persist_room_event(
        &self,
        rs: &mut RoomState,
        event: &Event,
    ) -> Result<(), StoreError> {
        self.wal_append(event).await?;
        self.apply_room_event(rs, event);
        self.notify.send(rs.room.id, event);
        Ok(())
    }

    /// WAL-append and apply a catalog event. Caller holds `catalog_lock`.
    pub(super) async fn persist_catalog_event(&self, event: &Event) -> Result<(), StoreError> {
        self.wal_append(event).await?;
        self.apply_catalog_event(event);
        Ok(())
    }

    pub(super) fn get_room_state(&self, id: &Ulid) -> Option<SharedRoomState> {
        self.rooms.get(id).map(|e| e.value().clone())
    }

    /// Write-lock a room. Fails if the room was deleted while we waited.
    pub(super) async fn lock_room(
        &self,
        id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<RoomState>, StoreError> {
        let rs = self.get_room_state(id).ok_or(StoreError::NotFound(*id))?;
        let guard = rs.write_owned().await;
        if !self.rooms.contains_key(id) {
            return Err(StoreError::NotFound(*id));
        }
        Ok(guard)
    }

    pub(super) fn get_room_for_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_to_room.get(booking_id).map(|e| *e.value())
    }

    /// Lock the room currently holding `booking_id`. A booking can move rooms
    /// between the index lookup and the lock, so re-check after locking.
    pub(super) async fn resolve_booking_write(
        &self,
        booking_id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<RoomState>, StoreError> {
        loop {
            let room_id = self
                .get_room_for_booking(booking_id)
                .ok_or(StoreError::NotFound(*booking_id))?;
            let rs = self
                .get_room_state(&room_id)
                .ok_or(StoreError::NotFound(room_id))?;
            let guard = rs.write_owned().await;
            if guard.booking(booking_id).is_some() {
                return Ok(guard);
            }
            if self.get_room_for_booking(booking_id) == Some(room_id) {
                return Err(StoreError::NotFound(*booking_id));
            }
        }
    }

    /// Write-lock two distinct rooms in ascending id order to avoid deadlock.
    /// Guards are returned in argument order.
    pub(super) async fn lock_room_pair(
        &self,
        a: Ulid,
        b: Ulid,
    ) -> Result<
        (
            OwnedRwLockWriteGuard<RoomState>,
            OwnedRwLockWriteGuard<RoomState>,
        ),
        StoreError,
    > {
        if a < b {
            let ga = self.lock_room(&a).await?;
            let gb = self.lock_room(&b).await?;
            Ok((ga, gb))
        } else {
            let gb = self.lock_room(&b).await?;
            let ga = self.lock_room(&a).await?;
            Ok((ga, gb))
        }
    }

    /// Rewrite the WAL with the minimal event set for the current state.
    ///
    /// Holds the catalog lock and a read lock on every room for the whole
    /// rewrite so no append can land between snapshot and swap.
    pub async fn compact_wal(&self) -> Result<(), StoreError> {
        let _catalog = self.catalog_lock.lock().await;

        let mut room_states: Vec<(Ulid, SharedRoomState)> = self
            .rooms
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        room_states.sort_by_key(|(id, _)| *id);
        let mut guards = Vec::with_capacity(room_states.len());
        for (_, rs) in &room_states {
            guards.push(rs.clone().read_owned().await);
        }

        let mut events: Vec<Event> = Vec::new();
        events.extend(self.tenants.iter().map(|e| Event::TenantSaved(e.value().clone())));
        events.extend(self.locations.iter().map(|e| Event::LocationSaved(e.value().clone())));
        events.extend(self.users.iter().map(|e| Event::UserSaved(e.value().clone())));
        events.extend(
            self.retired_events
                .iter()
                .map(|e| Event::EventRetired(e.value().clone())),
        );
        for guard in &guards {
            events.push(Event::RoomSaved(guard.room.clone()));
            events.extend(guard.bookings.iter().cloned().map(Event::BookingCreated));
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| StoreError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
