use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::policy;

use super::{BookingStore, StoreError};

#[derive(Debug, Clone)]
pub struct TenantDraft {
    pub external_id: String,
    pub name: String,
    pub active: bool,
    pub approval: ApprovalStatus,
}

#[derive(Debug, Clone, Default)]
pub struct LocationDraft {
    pub name: String,
    pub address: Option<String>,
    pub city: Option<String>,
    pub country: Option<String>,
    pub active: bool,
    pub allowed_tenants: Vec<Ulid>,
}

#[derive(Debug, Clone, Default)]
pub struct RoomDraft {
    pub name: String,
    pub capacity: u32,
    pub location_id: Option<Ulid>,
    pub resource_address: Option<String>,
    pub building: Option<String>,
    pub hourly_rate_cents: u32,
    pub active: bool,
    pub placement: Option<FloorPlacement>,
}

#[derive(Debug, Clone)]
pub struct UserDraft {
    pub email: String,
    pub name: Option<String>,
    pub role: Role,
    pub tenant_id: Option<Ulid>,
    pub status: UserStatus,
}

fn require_manage(requester: &Principal) -> Result<(), StoreError> {
    if policy::can_manage(requester) {
        Ok(())
    } else {
        Err(StoreError::Forbidden("administrator role required"))
    }
}

pub(super) fn validate_name(name: &str) -> Result<(), StoreError> {
    if name.len() > MAX_NAME_LEN {
        return Err(StoreError::LimitExceeded("name too long"));
    }
    Ok(())
}

pub(super) fn validate_email(email: &str) -> Result<(), StoreError> {
    if email.len() > MAX_EMAIL_LEN {
        return Err(StoreError::LimitExceeded("email too long"));
    }
    if !email.contains('@') {
        return Err(StoreError::UnknownUser(email.to_string()));
    }
    Ok(())
}

pub(super) fn validate_external_key(key: &str) -> Result<(), StoreError> {
    if key.is_empty() || key.len() > MAX_EXTERNAL_KEY_LEN {
        return Err(StoreError::LimitExceeded("external key length"));
    }
    Ok(())
}

impl BookingStore {
    // ── Tenants ──────────────────────────────────────────────

    pub async fn create_tenant(
        &self,
        requester: &Principal,
        draft: TenantDraft,
    ) -> Result<Tenant, StoreError> {
        require_manage(requester)?;
        validate_name(&draft.name)?;
        validate_external_key(&draft.external_id)?;

        let _key = self.tenants_by_external_id.lock(&draft.external_id).await;
        if self.tenants_by_external_id.get(&draft.external_id).is_some() {
            return Err(StoreError::AlreadyExists(draft.external_id));
        }
        let tenant = Tenant {
            id: Ulid::new(),
            external_id: draft.external_id,
            name: draft.name,
            active: draft.active,
            approval: draft.approval,
        };
        let _catalog = self.catalog_lock.lock().await;
        self.persist_catalog_event(&Event::TenantSaved(tenant.clone()))
            .await?;
        tracing::info!("tenant {} ({}) created", tenant.id, tenant.name);
        Ok(tenant)
    }

    pub async fn update_tenant(
        &self,
        requester: &Principal,
        id: Ulid,
        draft: TenantDraft,
    ) -> Result<Tenant, StoreError> {
        require_manage(requester)?;
        validate_name(&draft.name)?;
        validate_external_key(&draft.external_id)?;

        let _key = self.tenants_by_external_id.lock(&draft.external_id).await;
        if let Some(other) = self.tenants_by_external_id.get(&draft.external_id)
            && other != id
        {
            return Err(StoreError::AlreadyExists(draft.external_id));
        }
        self.modify_tenant(id, |t| {
            t.external_id = draft.external_id;
            t.name = draft.name;
            t.active = draft.active;
            t.approval = draft.approval;
        })
        .await
    }

    pub async fn set_tenant_approval(
        &self,
        requester: &Principal,
        id: Ulid,
        approval: ApprovalStatus,
    ) -> Result<Tenant, StoreError> {
        require_manage(requester)?;
        let tenant = self.modify_tenant(id, |t| t.approval = approval).await?;
        tracing::info!("tenant {} approval set to {approval:?}", tenant.name);
        Ok(tenant)
    }

    pub async fn set_tenant_active(
        &self,
        requester: &Principal,
        id: Ulid,
        active: bool,
    ) -> Result<Tenant, StoreError> {
        require_manage(requester)?;
        self.modify_tenant(id, |t| t.active = active).await
    }

    async fn modify_tenant(
        &self,
        id: Ulid,
        change: impl FnOnce(&mut Tenant),
    ) -> Result<Tenant, StoreError> {
        let _catalog = self.catalog_lock.lock().await;
        let mut tenant = self
            .tenants
            .get(&id)
            .map(|t| t.clone())
            .ok_or(StoreError::NotFound(id))?;
        change(&mut tenant);
        self.persist_catalog_event(&Event::TenantSaved(tenant.clone()))
            .await?;
        Ok(tenant)
    }

    // ── Locations ────────────────────────────────────────────

    pub async fn create_location(
        &self,
        requester: &Principal,
        draft: LocationDraft,
    ) -> Result<Location, StoreError> {
        require_manage(requester)?;
        validate_name(&draft.name)?;
        let _catalog = self.catalog_lock.lock().await;
        self.check_tenants_exist(&draft.allowed_tenants)?;
        let location = Location {
            id: Ulid::new(),
            name: draft.name,
            address: draft.address,
            city: draft.city,
            country: draft.country,
            active: draft.active,
            allowed_tenants: draft.allowed_tenants,
        };
        self.persist_catalog_event(&Event::LocationSaved(location.clone()))
            .await?;
        Ok(location)
    }

    pub async fn update_location(
        &self,
        requester: &Principal,
        id: Ulid,
        draft: LocationDraft,
    ) -> Result<Location, StoreError> {
        require_manage(requester)?;
        validate_name(&draft.name)?;
        let _catalog = self.catalog_lock.lock().await;
        if !self.locations.contains_key(&id) {
            return Err(StoreError::NotFound(id));
        }
        self.check_tenants_exist(&draft.allowed_tenants)?;
        let location = Location {
            id,
            name: draft.name,
            address: draft.address,
            city: draft.city,
            country: draft.country,
            active: draft.active,
            allowed_tenants: draft.allowed_tenants,
        };
        self.persist_catalog_event(&Event::LocationSaved(location.clone()))
            .await?;
        Ok(location)
    }

    /// Fails with `LocationInUse` while any room is assigned to it. Room
    /// writes that set a location hold the catalog lock too, so no room can
    /// be assigned between the check and the delete.
    pub async fn delete_location(&self, requester: &Principal, id: Ulid) -> Result<(), StoreError> {
        require_manage(requester)?;
        let _catalog = self.catalog_lock.lock().await;
        if !self.locations.contains_key(&id) {
            return Err(StoreError::NotFound(id));
        }
        for rs in self.room_states() {
            if rs.read().await.room.location_id == Some(id) {
                return Err(StoreError::LocationInUse(id));
            }
        }
        self.persist_catalog_event(&Event::LocationDeleted { id })
            .await?;
        tracing::info!("location {id} deleted");
        Ok(())
    }

    fn check_tenants_exist(&self, ids: &[Ulid]) -> Result<(), StoreError> {
        match ids.iter().find(|id| !self.tenants.contains_key(id)) {
            Some(missing) => Err(StoreError::NotFound(*missing)),
            None => Ok(()),
        }
    }

    // ── Rooms ────────────────────────────────────────────────

    pub async fn create_room(
        &self,
        requester: &Principal,
        draft: RoomDraft,
    ) -> Result<Room, StoreError> {
        require_manage(requester)?;
        validate_name(&draft.name)?;
        let key = draft.resource_address.as_deref().map(normalize_address);
        if let Some(key) = &key {
            validate_external_key(key)?;
        }
        let _key = match &key {
            Some(key) => Some(self.rooms_by_address.lock(key).await),
            None => None,
        };
        if let Some(key) = &key
            && self.rooms_by_address.get(key).is_some()
        {
            return Err(StoreError::AlreadyExists(key.clone()));
        }

        let _catalog = self.catalog_lock.lock().await;
        if let Some(location_id) = draft.location_id
            && !self.locations.contains_key(&location_id)
        {
            return Err(StoreError::NotFound(location_id));
        }
        let room = Room {
            id: Ulid::new(),
            name: draft.name,
            capacity: draft.capacity,
            location_id: draft.location_id,
            resource_address: draft.resource_address,
            building: draft.building,
            hourly_rate_cents: draft.hourly_rate_cents,
            active: draft.active,
            placement: draft.placement,
        };
        self.persist_new_room(room).await
    }

    /// WAL-append and publish a room that does not exist yet. Caller holds
    /// `catalog_lock`, and the room's address key lock when it has one;
    /// compaction relies on the former to not miss the room.
    pub(super) async fn persist_new_room(&self, room: Room) -> Result<Room, StoreError> {
        if self.rooms.len() >= MAX_ROOMS {
            return Err(StoreError::LimitExceeded("too many rooms"));
        }
        let event = Event::RoomSaved(room.clone());
        self.wal_append(&event).await?;
        self.insert_room_state(room.clone());
        self.notify.send(room.id, &event);
        tracing::info!("room {} ({}) created", room.id, room.name);
        Ok(room)
    }

    pub async fn update_room(
        &self,
        requester: &Principal,
        id: Ulid,
        draft: RoomDraft,
    ) -> Result<Room, StoreError> {
        require_manage(requester)?;
        validate_name(&draft.name)?;
        let key = draft.resource_address.as_deref().map(normalize_address);
        let _key = match &key {
            Some(key) => {
                validate_external_key(key)?;
                Some(self.rooms_by_address.lock(key).await)
            }
            None => None,
        };
        if let Some(key) = &key
            && let Some(other) = self.rooms_by_address.get(key)
            && other != id
        {
            return Err(StoreError::AlreadyExists(key.clone()));
        }

        let _catalog = self.catalog_lock.lock().await;
        if let Some(location_id) = draft.location_id
            && !self.locations.contains_key(&location_id)
        {
            return Err(StoreError::NotFound(location_id));
        }
        let mut guard = self.lock_room(&id).await?;
        let room = Room {
            id,
            name: draft.name,
            capacity: draft.capacity,
            location_id: draft.location_id,
            resource_address: draft.resource_address,
            building: draft.building,
            hourly_rate_cents: draft.hourly_rate_cents,
            active: draft.active,
            placement: draft.placement,
        };
        self.persist_room_event(&mut guard, &Event::RoomSaved(room.clone()))
            .await?;
        Ok(room)
    }

    /// Rooms are only removable while no booking of any status references
    /// them; otherwise deactivate instead.
    pub async fn delete_room(&self, requester: &Principal, id: Ulid) -> Result<(), StoreError> {
        require_manage(requester)?;
        let guard = self.lock_room(&id).await?;
        if !guard.bookings.is_empty() {
            return Err(StoreError::RoomInUse(id));
        }
        let event = Event::RoomDeleted { id };
        self.wal_append(&event).await?;
        self.remove_room_state(&guard.room);
        self.notify.send(id, &event);
        self.notify.remove(&id);
        tracing::info!("room {id} ({}) deleted", guard.room.name);
        Ok(())
    }

    // ── Users ────────────────────────────────────────────────

    pub async fn create_user(
        &self,
        requester: &Principal,
        draft: UserDraft,
    ) -> Result<User, StoreError> {
        require_manage(requester)?;
        let email = normalize_address(&draft.email);
        validate_email(&email)?;
        if let Some(name) = &draft.name {
            validate_name(name)?;
        }

        let _key = self.users_by_email.lock(&email).await;
        if self.users_by_email.get(&email).is_some() {
            return Err(StoreError::AlreadyExists(email));
        }
        let _catalog = self.catalog_lock.lock().await;
        if let Some(tenant_id) = draft.tenant_id
            && !self.tenants.contains_key(&tenant_id)
        {
            return Err(StoreError::NotFound(tenant_id));
        }
        let user = User {
            id: Ulid::new(),
            email,
            name: draft.name,
            role: draft.role,
            tenant_id: draft.tenant_id,
            status: draft.status,
        };
        self.persist_catalog_event(&Event::UserSaved(user.clone()))
            .await?;
        Ok(user)
    }

    pub async fn set_user_role(
        &self,
        requester: &Principal,
        user_id: Ulid,
        role: Role,
    ) -> Result<User, StoreError> {
        require_manage(requester)?;
        let user = self.modify_user(user_id, |u| u.role = role).await?;
        tracing::info!("user {} role set to {role:?} by {}", user.email, requester.user.email);
        Ok(user)
    }

    pub async fn set_user_status(
        &self,
        requester: &Principal,
        user_id: Ulid,
        status: UserStatus,
    ) -> Result<User, StoreError> {
        require_manage(requester)?;
        let user = self.modify_user(user_id, |u| u.status = status).await?;
        tracing::info!("user {} status set to {status:?} by {}", user.email, requester.user.email);
        Ok(user)
    }

    pub(super) async fn modify_user(
        &self,
        id: Ulid,
        change: impl FnOnce(&mut User),
    ) -> Result<User, StoreError> {
        let _catalog = self.catalog_lock.lock().await;
        let mut user = self
            .users
            .get(&id)
            .map(|u| u.clone())
            .ok_or(StoreError::NotFound(id))?;
        change(&mut user);
        self.persist_catalog_event(&Event::UserSaved(user.clone()))
            .await?;
        Ok(user)
    }

    /// Bootstrap an administrator without a requesting principal: used by
    /// the daemon at startup for the configured admin account. Existing
    /// users are promoted and reactivated.
    pub async fn ensure_admin(&self, email: &str) -> Result<User, StoreError> {
        let email = normalize_address(email);
        validate_email(&email)?;
        let _key = self.users_by_email.lock(&email).await;
        let _catalog = self.catalog_lock.lock().await;
        let user = match self
            .users_by_email
            .get(&email)
            .and_then(|id| self.users.get(&id).map(|u| u.clone()))
        {
            Some(existing) if existing.role == Role::Admin && existing.status == UserStatus::Active => {
                return Ok(existing);
            }
            Some(mut existing) => {
                existing.role = Role::Admin;
                existing.status = UserStatus::Active;
                existing
            }
            None => User {
                id: Ulid::new(),
                email,
                name: None,
                role: Role::Admin,
                tenant_id: None,
                status: UserStatus::Active,
            },
        };
        self.persist_catalog_event(&Event::UserSaved(user.clone()))
            .await?;
        tracing::info!("bootstrap administrator {}", user.email);
        Ok(user)
    }
}
