//! Sign-in admission. Authentication itself happens upstream; this decides
//! whether an authenticated identity may use the system yet.

use std::sync::Arc;

use crate::model::*;
use crate::observability::SIGN_IN_DENIED_TOTAL;
use crate::policy;
use crate::store::{BookingStore, FederatedClaims, StoreError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Admitted(Principal),
    /// The user's tenant is waiting for an administrator to approve it.
    Pending,
    Denied(&'static str),
}

pub struct TenantGate {
    store: Arc<BookingStore>,
}

impl TenantGate {
    pub fn new(store: Arc<BookingStore>) -> Self {
        Self { store }
    }

    /// Sign-in through the federated provider. Unknown tenants are recorded
    /// as pending and their first user becomes the tenant administrator.
    pub async fn sign_in_federated(&self, claims: &FederatedClaims) -> Result<Admission, StoreError> {
        let principal = self.store.admit_federated_user(claims).await?;
        let admission = decide(principal);
        log_outcome(&claims.email, &admission);
        Ok(admission)
    }

    /// Sign-in with a local account. Only existing, active users get in.
    pub fn sign_in_local(&self, email: &str) -> Admission {
        let admission = match self.store.principal_by_email(email) {
            Ok(principal) => decide(principal),
            Err(_) => Admission::Denied("unknown user"),
        };
        log_outcome(email, &admission);
        admission
    }
}

fn decide(principal: Principal) -> Admission {
    match principal.user.status {
        UserStatus::Active => {}
        UserStatus::Pending => return Admission::Pending,
        UserStatus::Disabled => return Admission::Denied("user disabled"),
    }
    if let (Some(_), Some(tenant)) = (principal.user.tenant_id, &principal.tenant) {
        if !tenant.active {
            return Admission::Denied("tenant deactivated");
        }
        match tenant.approval {
            ApprovalStatus::Approved => {}
            ApprovalStatus::Pending => return Admission::Pending,
            ApprovalStatus::Rejected => return Admission::Denied("tenant rejected"),
        }
    }
    if policy::is_admitted(&principal) {
        Admission::Admitted(principal)
    } else {
        Admission::Denied("tenant unresolved")
    }
}

fn log_outcome(email: &str, admission: &Admission) {
    match admission {
        Admission::Admitted(p) => tracing::debug!("{} signed in as {:?}", p.user.email, p.user.role),
        Admission::Pending => {
            metrics::counter!(SIGN_IN_DENIED_TOTAL, "reason" => "pending").increment(1);
            tracing::info!("sign-in of {email} pending tenant approval");
        }
        Admission::Denied(reason) => {
            metrics::counter!(SIGN_IN_DENIED_TOTAL, "reason" => "denied").increment(1);
            tracing::info!("sign-in of {email} denied: {reason}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::notify::NotifyHub;
    use crate::store::{TenantDraft, UserDraft};

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("roomsync_test_tenant");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    async fn gate(name: &str) -> (TenantGate, Arc<BookingStore>, Principal) {
        let store = Arc::new(
            BookingStore::open(test_wal_path(name), Arc::new(NotifyHub::new())).unwrap(),
        );
        let admin = store.ensure_admin("ops@roomsync.example").await.unwrap();
        let admin = store.principal(admin.id).unwrap();
        (TenantGate::new(store.clone()), store, admin)
    }

    fn claims(email: &str, tid: &str) -> FederatedClaims {
        FederatedClaims {
            email: email.into(),
            name: None,
            tenant_external_id: tid.into(),
            tenant_name: Some("Fabrikam".into()),
        }
    }

    #[tokio::test]
    async fn new_tenant_waits_for_approval() {
        let (gate, store, admin) = gate("gate_pending.wal").await;

        let first = gate.sign_in_federated(&claims("ana@fabrikam.com", "tid-1")).await.unwrap();
        assert_eq!(first, Admission::Pending);
        let tenant = store.tenant_by_external_id("tid-1").unwrap();
        assert_eq!(tenant.approval, ApprovalStatus::Pending);
        assert_eq!(store.user_by_email("ana@fabrikam.com").unwrap().role, Role::Admin);

        store
            .set_tenant_approval(&admin, tenant.id, ApprovalStatus::Approved)
            .await
            .unwrap();
        let Admission::Admitted(principal) =
            gate.sign_in_federated(&claims("ana@fabrikam.com", "tid-1")).await.unwrap()
        else {
            panic!("expected admission");
        };
        assert!(principal.is_admin());
        assert_eq!(principal.tenant.map(|t| t.id), Some(tenant.id));
    }

    #[tokio::test]
    async fn second_user_joins_as_member() {
        let (gate, store, _) = gate("gate_member.wal").await;
        gate.sign_in_federated(&claims("ana@fabrikam.com", "tid-1")).await.unwrap();
        gate.sign_in_federated(&claims("ben@fabrikam.com", "tid-1")).await.unwrap();

        assert_eq!(store.user_by_email("ben@fabrikam.com").unwrap().role, Role::Member);
        // Signing in again does not hand out the admin role twice.
        gate.sign_in_federated(&claims("ben@fabrikam.com", "tid-1")).await.unwrap();
        assert_eq!(store.user_by_email("ben@fabrikam.com").unwrap().role, Role::Member);
    }

    #[tokio::test]
    async fn concurrent_first_sign_ins_make_one_admin() {
        let (gate, store, _) = gate("gate_race.wal").await;
        let gate = Arc::new(gate);

        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let gate = gate.clone();
                tokio::spawn(async move {
                    gate.sign_in_federated(&claims(&format!("user{i}@fabrikam.com"), "tid-1"))
                        .await
                        .unwrap()
                })
            })
            .collect();
        futures::future::join_all(tasks).await;

        let tenant = store.tenant_by_external_id("tid-1").unwrap();
        let admins = store
            .list_users()
            .into_iter()
            .filter(|u| u.tenant_id == Some(tenant.id) && u.role == Role::Admin)
            .count();
        assert_eq!(admins, 1);
    }

    #[tokio::test]
    async fn rejected_and_inactive_tenants_are_denied() {
        let (gate, store, admin) = gate("gate_rejected.wal").await;
        let rejected = store
            .create_tenant(
                &admin,
                TenantDraft {
                    external_id: "tid-r".into(),
                    name: "Rejected".into(),
                    active: true,
                    approval: ApprovalStatus::Rejected,
                },
            )
            .await
            .unwrap();
        let outcome = gate.sign_in_federated(&claims("eve@rejected.com", "tid-r")).await.unwrap();
        assert_eq!(outcome, Admission::Denied("tenant rejected"));

        store
            .set_tenant_approval(&admin, rejected.id, ApprovalStatus::Approved)
            .await
            .unwrap();
        store.set_tenant_active(&admin, rejected.id, false).await.unwrap();
        let outcome = gate.sign_in_federated(&claims("eve@rejected.com", "tid-r")).await.unwrap();
        assert_eq!(outcome, Admission::Denied("tenant deactivated"));
    }

    #[tokio::test]
    async fn local_sign_in_needs_an_active_account() {
        let (gate, store, admin) = gate("gate_local.wal").await;
        let user = store
            .create_user(
                &admin,
                UserDraft {
                    email: "desk@roomsync.example".into(),
                    name: None,
                    role: Role::Member,
                    tenant_id: None,
                    status: UserStatus::Active,
                },
            )
            .await
            .unwrap();

        assert!(matches!(gate.sign_in_local("Desk@Roomsync.example"), Admission::Admitted(_)));
        assert_eq!(gate.sign_in_local("nobody@roomsync.example"), Admission::Denied("unknown user"));

        store
            .set_user_status(&admin, user.id, UserStatus::Disabled)
            .await
            .unwrap();
        assert_eq!(gate.sign_in_local("desk@roomsync.example"), Admission::Denied("user disabled"));
    }
}
