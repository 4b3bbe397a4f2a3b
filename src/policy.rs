//! Authorization decisions. Every function is pure over an already-resolved
//! [`Principal`]; authentication happens before anything reaches this crate.

use crate::model::*;

/// Why a principal may mutate a booking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grant {
    Owner,
    /// An administrator acting on somebody else's booking. Callers log it
    /// and record the acting admin on the booking.
    AdminOverride,
}

/// Fails closed: a disabled/pending user, a tenant that is not approved or
/// not active, or a tenant reference that did not resolve denies everything.
pub fn is_admitted(p: &Principal) -> bool {
    if p.user.status != UserStatus::Active {
        return false;
    }
    match (p.user.tenant_id, &p.tenant) {
        (None, _) => true,
        (Some(tid), Some(tenant)) => tenant.id == tid && tenant.is_admitted(),
        (Some(_), None) => false,
    }
}

/// Administrator gate for tenant/room/location/user management.
pub fn can_manage(p: &Principal) -> bool {
    is_admitted(p) && p.is_admin()
}

/// Rooms without a location are visible to everyone; rooms at a location
/// only to tenants that location allows. `location` is the room's location
/// as resolved by the caller; a dangling reference denies.
pub fn can_view_room(p: &Principal, room: &Room, location: Option<&Location>) -> bool {
    if !is_admitted(p) {
        return false;
    }
    if p.is_admin() {
        return true;
    }
    let Some(location_id) = room.location_id else {
        return true;
    };
    match (location, &p.tenant) {
        (Some(loc), Some(tenant)) => loc.id == location_id && loc.allows(&tenant.id),
        _ => false,
    }
}

pub fn booking_mutation_grant(p: &Principal, booking: &Booking) -> Option<Grant> {
    if !is_admitted(p) {
        return None;
    }
    if booking.owner_id == p.id() {
        Some(Grant::Owner)
    } else if p.is_admin() {
        Some(Grant::AdminOverride)
    } else {
        None
    }
}

pub fn can_mutate_booking(p: &Principal, booking: &Booking) -> bool {
    booking_mutation_grant(p, booking).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::{booking, room};
    use ulid::Ulid;

    fn tenant(approval: ApprovalStatus, active: bool) -> Tenant {
        Tenant {
            id: Ulid::new(),
            external_id: Ulid::new().to_string(),
            name: "Fabrikam".into(),
            active,
            approval,
        }
    }

    fn principal(role: Role, tenant: Option<Tenant>) -> Principal {
        Principal {
            user: User {
                id: Ulid::new(),
                email: "someone@fabrikam.com".into(),
                name: None,
                role,
                tenant_id: tenant.as_ref().map(|t| t.id),
                status: UserStatus::Active,
            },
            tenant,
        }
    }

    fn location(allowed: &[Ulid]) -> Location {
        Location {
            id: Ulid::new(),
            name: "HQ".into(),
            address: None,
            city: None,
            country: None,
            active: true,
            allowed_tenants: allowed.to_vec(),
        }
    }

    #[test]
    fn unassigned_room_visible_to_any_admitted_user() {
        let p = principal(Role::Member, Some(tenant(ApprovalStatus::Approved, true)));
        assert!(can_view_room(&p, &room("Open"), None));
        let local = principal(Role::Member, None);
        assert!(can_view_room(&local, &room("Open"), None));
    }

    #[test]
    fn located_room_requires_allowed_tenant() {
        let t = tenant(ApprovalStatus::Approved, true);
        let p = principal(Role::Member, Some(t.clone()));
        let other = principal(Role::Member, Some(tenant(ApprovalStatus::Approved, true)));
        let loc = location(&[t.id]);
        let mut r = room("Boardroom");
        r.location_id = Some(loc.id);

        assert!(can_view_room(&p, &r, Some(&loc)));
        assert!(!can_view_room(&other, &r, Some(&loc)));
        assert!(!can_view_room(&principal(Role::Member, None), &r, Some(&loc)));
        // Location that failed to resolve.
        assert!(!can_view_room(&p, &r, None));
    }

    #[test]
    fn admin_sees_every_room() {
        let admin = principal(Role::Admin, Some(tenant(ApprovalStatus::Approved, true)));
        let loc = location(&[]);
        let mut r = room("Vault");
        r.location_id = Some(loc.id);
        assert!(can_view_room(&admin, &r, Some(&loc)));
        assert!(can_manage(&admin));
    }

    #[test]
    fn unapproved_or_inactive_tenant_fails_closed() {
        for t in [
            tenant(ApprovalStatus::Pending, true),
            tenant(ApprovalStatus::Rejected, true),
            tenant(ApprovalStatus::Approved, false),
        ] {
            let admin = principal(Role::Admin, Some(t));
            assert!(!is_admitted(&admin));
            assert!(!can_manage(&admin));
            assert!(!can_view_room(&admin, &room("Open"), None));
        }
    }

    #[test]
    fn unresolved_tenant_fails_closed() {
        let mut p = principal(Role::Member, Some(tenant(ApprovalStatus::Approved, true)));
        p.tenant = None;
        assert!(!is_admitted(&p));
    }

    #[test]
    fn disabled_user_denied() {
        let mut p = principal(Role::Admin, None);
        p.user.status = UserStatus::Disabled;
        assert!(!can_manage(&p));
    }

    #[test]
    fn only_owner_or_admin_mutates() {
        let owner = principal(Role::Member, None);
        let stranger = principal(Role::Member, None);
        let admin = principal(Role::Admin, None);
        let mut b = booking(Ulid::new(), 0, 1000);
        b.owner_id = owner.id();

        assert_eq!(booking_mutation_grant(&owner, &b), Some(Grant::Owner));
        assert_eq!(booking_mutation_grant(&stranger, &b), None);
        assert_eq!(booking_mutation_grant(&admin, &b), Some(Grant::AdminOverride));
        assert!(!can_mutate_booking(&stranger, &b));
    }
}
