//! Roles and the resolved request scope.

use crate::identity::{PlantId, TenantId, UserId};
use serde::{Deserialize, Serialize};

/// Privilege level of the signed-in user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Regular,
    Admin,
    Manager,
    Superuser,
}

impl Role {
    /// Map the backend user record onto a role.
    ///
    /// The superuser flag wins over the free-form role string; unknown role
    /// strings (`client`, `viewer`, ...) are regular users.
    pub fn from_user_record(role: &str, is_superuser: bool) -> Self {
        if is_superuser {
            return Self::Superuser;
        }
        match role.trim().to_ascii_lowercase().as_str() {
            "admin" => Self::Admin,
            "manager" => Self::Manager,
            _ => Self::Regular,
        }
    }

    /// Privileged roles may look at tenants other than their own.
    pub fn is_privileged(self) -> bool {
        !matches!(self, Self::Regular)
    }
}

/// An explicit tenant selection made from the tenant selector.
///
/// The selector can hand over either a tenant id or a plant id; plant ids
/// are mapped to tenants through the tenant listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum TenantSelection {
    Tenant(TenantId),
    Plant(PlantId),
}

/// The resolved tenant and role under which requests execute.
///
/// Values are immutable; a tenant switch produces a new context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScopeContext {
    pub user_id: UserId,
    /// The user's own tenant.
    pub tenant_id: TenantId,
    pub role: Role,
    /// Resolved selection. Ignored for regular users.
    pub selected_tenant_id: Option<TenantId>,
}

impl ScopeContext {
    pub fn new(user_id: UserId, tenant_id: TenantId, role: Role) -> Self {
        Self {
            user_id,
            tenant_id,
            role,
            selected_tenant_id: None,
        }
    }

    pub fn with_selection(mut self, selected: Option<TenantId>) -> Self {
        self.selected_tenant_id = selected;
        self
    }

    /// The tenant every query and mutation key is scoped to.
    pub fn effective_tenant(&self) -> TenantId {
        if self.role.is_privileged() {
            self.selected_tenant_id.unwrap_or(self.tenant_id)
        } else {
            self.tenant_id
        }
    }
}
