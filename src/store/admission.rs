use ulid::Ulid;

use crate::model::*;

use super::admin::{validate_email, validate_external_key, validate_name};
use super::{BookingStore, StoreError};

/// Identity asserted by the federated identity provider at sign-in.
#[derive(Debug, Clone)]
pub struct FederatedClaims {
    pub email: String,
    pub name: Option<String>,
    /// Provider-side tenant identifier (Azure `tid`).
    pub tenant_external_id: String,
    pub tenant_name: Option<String>,
}

impl BookingStore {
    /// Record a federated sign-in: find or create the tenant (new tenants
    /// start `Pending`) and upsert the user into it.
    ///
    /// Runs under the tenant's key lock, so of several concurrent first
    /// sign-ins for one tenant exactly one user becomes its administrator.
    /// Returns the resulting principal; whether it is admitted is for the
    /// caller to decide.
    pub async fn admit_federated_user(
        &self,
        claims: &FederatedClaims,
    ) -> Result<Principal, StoreError> {
        let email = normalize_address(&claims.email);
        validate_email(&email)?;
        validate_external_key(&claims.tenant_external_id)?;
        if let Some(name) = &claims.name {
            validate_name(name)?;
        }

        let _tenant_key = self
            .tenants_by_external_id
            .lock(&claims.tenant_external_id)
            .await;
        let _user_key = self.users_by_email.lock(&email).await;
        let _catalog = self.catalog_lock.lock().await;

        let tenant = match self
            .tenants_by_external_id
            .get(&claims.tenant_external_id)
            .and_then(|id| self.tenants.get(&id).map(|t| t.clone()))
        {
            Some(tenant) => tenant,
            None => {
                let tenant = Tenant {
                    id: Ulid::new(),
                    external_id: claims.tenant_external_id.clone(),
                    name: claims
                        .tenant_name
                        .clone()
                        .or_else(|| email.split('@').nth(1).map(str::to_string))
                        .unwrap_or_else(|| claims.tenant_external_id.clone()),
                    active: true,
                    approval: ApprovalStatus::Pending,
                };
                self.persist_catalog_event(&Event::TenantSaved(tenant.clone()))
                    .await?;
                tracing::info!(
                    "new tenant {} ({}) awaiting approval",
                    tenant.name,
                    tenant.external_id
                );
                tenant
            }
        };

        let tenant_has_users = self
            .users
            .iter()
            .any(|u| u.tenant_id == Some(tenant.id) && u.email != email);
        let existing = self
            .users_by_email
            .get(&email)
            .and_then(|id| self.users.get(&id).map(|u| u.clone()));

        let mut promoted = false;
        let user = match existing {
            Some(mut user) => {
                let before = user.clone();
                if user.tenant_id.is_none() {
                    user.tenant_id = Some(tenant.id);
                    if user.role == Role::External {
                        user.role = Role::Member;
                    }
                    if !tenant_has_users {
                        user.role = Role::Admin;
                        promoted = true;
                    }
                }
                if user.status == UserStatus::Pending {
                    user.status = UserStatus::Active;
                }
                if claims.name.is_some() && user.name != claims.name {
                    user.name = claims.name.clone();
                }
                if user != before {
                    self.persist_catalog_event(&Event::UserSaved(user.clone()))
                        .await?;
                }
                user
            }
            None => {
                promoted = !tenant_has_users;
                let user = User {
                    id: Ulid::new(),
                    email,
                    name: claims.name.clone(),
                    role: if promoted { Role::Admin } else { Role::Member },
                    tenant_id: Some(tenant.id),
                    status: UserStatus::Active,
                };
                self.persist_catalog_event(&Event::UserSaved(user.clone()))
                    .await?;
                user
            }
        };
        if promoted {
            tracing::info!("{} is the first user of tenant {}", user.email, tenant.name);
        }

        // A user already bound to another tenant stays there.
        let tenant = match user.tenant_id {
            Some(tid) if tid != tenant.id => self.tenants.get(&tid).map(|t| t.clone()),
            _ => Some(tenant),
        };
        Ok(Principal { user, tenant })
    }
}
