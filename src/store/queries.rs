use ulid::Ulid;

use crate::model::*;
use crate::policy;

use super::conflict::conflicting_index;
use super::{BookingStore, SharedRoomState, StoreError};

impl BookingStore {
    /// Snapshot of every room's state handle, taken before any await so no
    /// DashMap shard guard is held across one.
    pub(super) fn room_states(&self) -> Vec<SharedRoomState> {
        self.rooms.iter().map(|e| e.value().clone()).collect()
    }

    pub(super) fn location_of(&self, room: &Room) -> Option<Location> {
        let id = room.location_id?;
        self.locations.get(&id).map(|l| l.clone())
    }

    pub async fn get_room(&self, id: Ulid) -> Option<Room> {
        let rs = self.get_room_state(&id)?;
        let room = rs.read().await.room.clone();
        Some(room)
    }

    pub async fn get_booking(&self, id: Ulid) -> Option<Booking> {
        let room_id = self.get_room_for_booking(&id)?;
        let rs = self.get_room_state(&room_id)?;
        let guard = rs.read().await;
        guard.booking(&id).cloned()
    }

    pub fn get_tenant(&self, id: Ulid) -> Option<Tenant> {
        self.tenants.get(&id).map(|t| t.clone())
    }

    pub fn tenant_by_external_id(&self, external_id: &str) -> Option<Tenant> {
        let id = self.tenants_by_external_id.get(external_id)?;
        self.get_tenant(id)
    }

    pub fn get_location(&self, id: Ulid) -> Option<Location> {
        self.locations.get(&id).map(|l| l.clone())
    }

    pub fn get_user(&self, id: Ulid) -> Option<User> {
        self.users.get(&id).map(|u| u.clone())
    }

    pub fn user_by_email(&self, email: &str) -> Option<User> {
        let id = self.users_by_email.get(&normalize_address(email))?;
        self.get_user(id)
    }

    /// Resolve a user together with its tenant. A tenant reference that no
    /// longer resolves yields `tenant: None`, which policy treats as denied.
    pub fn principal(&self, user_id: Ulid) -> Result<Principal, StoreError> {
        let user = self.get_user(user_id).ok_or(StoreError::NotFound(user_id))?;
        let tenant = user.tenant_id.and_then(|id| self.get_tenant(id));
        Ok(Principal { user, tenant })
    }

    pub fn principal_by_email(&self, email: &str) -> Result<Principal, StoreError> {
        let user = self
            .user_by_email(email)
            .ok_or_else(|| StoreError::UnknownUser(email.to_string()))?;
        self.principal(user.id)
    }

    pub fn list_tenants(&self) -> Vec<Tenant> {
        let mut tenants: Vec<Tenant> = self.tenants.iter().map(|e| e.value().clone()).collect();
        tenants.sort_by(|a, b| a.name.cmp(&b.name));
        tenants
    }

    pub fn list_locations(&self) -> Vec<Location> {
        let mut locations: Vec<Location> =
            self.locations.iter().map(|e| e.value().clone()).collect();
        locations.sort_by(|a, b| a.name.cmp(&b.name));
        locations
    }

    pub fn list_users(&self) -> Vec<User> {
        let mut users: Vec<User> = self.users.iter().map(|e| e.value().clone()).collect();
        users.sort_by(|a, b| a.email.cmp(&b.email));
        users
    }

    /// Every room, sorted by name.
    pub async fn list_rooms(&self) -> Vec<Room> {
        let mut rooms = Vec::new();
        for rs in self.room_states() {
            rooms.push(rs.read().await.room.clone());
        }
        rooms.sort_by(|a, b| a.name.cmp(&b.name));
        rooms
    }

    /// Rooms linked to a provider mailbox.
    pub async fn rooms_with_address(&self) -> Vec<Room> {
        let mut rooms = self.list_rooms().await;
        rooms.retain(|r| r.resource_address.is_some());
        rooms
    }

    pub fn room_by_address(&self, address: &str) -> Option<Ulid> {
        self.rooms_by_address.get(&normalize_address(address))
    }

    /// Active rooms the principal may see.
    pub async fn visible_rooms(&self, principal: &Principal) -> Vec<Room> {
        let mut rooms = self.list_rooms().await;
        rooms.retain(|room| {
            room.active && policy::can_view_room(principal, room, self.location_of(room).as_ref())
        });
        rooms
    }

    /// Bookings of any status in a room overlapping `window`, by start time.
    pub async fn room_bookings(
        &self,
        room_id: Ulid,
        window: &TimeRange,
    ) -> Result<Vec<Booking>, StoreError> {
        let rs = self
            .get_room_state(&room_id)
            .ok_or(StoreError::NotFound(room_id))?;
        let guard = rs.read().await;
        Ok(guard.overlapping(window).cloned().collect())
    }

    /// Every booking owned by a user across all rooms, by start time.
    pub async fn user_bookings(&self, user_id: Ulid) -> Vec<Booking> {
        let mut bookings = Vec::new();
        for rs in self.room_states() {
            let guard = rs.read().await;
            bookings.extend(guard.bookings.iter().filter(|b| b.owner_id == user_id).cloned());
        }
        bookings.sort_by_key(|b| b.range.start);
        bookings
    }

    /// Whether `range` is free of confirmed bookings in the room. Advisory:
    /// only a create or update under the room lock decides.
    pub async fn is_available(&self, room_id: Ulid, range: &TimeRange) -> Result<bool, StoreError> {
        let rs = self
            .get_room_state(&room_id)
            .ok_or(StoreError::NotFound(room_id))?;
        let guard = rs.read().await;
        let existing: Vec<TimeRange> = guard
            .overlapping(range)
            .filter(|b| b.is_confirmed())
            .map(|b| b.range)
            .collect();
        Ok(conflicting_index(&existing, range).is_none())
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}
