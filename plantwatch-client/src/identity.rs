//! Identity resolution and the process-wide scope.
//!
//! The resolver turns the signed-in user plus an optional tenant selection
//! into a [`ScopeContext`]. [`ScopeState`] holds the current context and is
//! the only place it changes.

use crate::persistence::PersistedState;
use crate::query::QueryClient;
use crate::resources;
use plantwatch_cache::KeyFilter;
use plantwatch_core::{
    CredentialProvider, ScopeContext, SyncError, SyncResult, TenantId, TenantList,
    TenantSelection, UserPublic,
};
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

/// Page of the tenant listing used to resolve selections.
const TENANT_LISTING_SKIP: i64 = 0;
const TENANT_LISTING_LIMIT: i64 = 100;

/// A resolved scope, plus a warning when the selection could not be honoured.
#[derive(Debug, Clone, PartialEq)]
pub struct ScopeResolution {
    pub scope: ScopeContext,
    /// Always [`SyncError::ScopeUnresolved`] when present.
    pub warning: Option<SyncError>,
}

#[derive(Clone)]
pub struct IdentityResolver {
    queries: QueryClient,
    credentials: Arc<dyn CredentialProvider>,
}

impl fmt::Debug for IdentityResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityResolver")
            .field("has_credential", &self.credentials.has_valid_credential())
            .finish()
    }
}

impl IdentityResolver {
    pub fn new(queries: QueryClient, credentials: Arc<dyn CredentialProvider>) -> Self {
        Self {
            queries,
            credentials,
        }
    }

    fn require_credential(&self) -> SyncResult<()> {
        if self.credentials.has_valid_credential() {
            Ok(())
        } else {
            Err(SyncError::AuthRequired)
        }
    }

    /// The signed-in user, through the cached `me` query.
    pub async fn load_session(&self) -> SyncResult<UserPublic> {
        self.require_credential()?;
        self.queries.fetch_typed(&resources::me()).await
    }

    pub async fn resolve_scope(
        &self,
        session: &UserPublic,
        selection: Option<TenantSelection>,
    ) -> SyncResult<ScopeResolution> {
        self.require_credential()?;
        let base = ScopeContext::new(session.id, session.tenant_id, session.role());

        let selection = match selection {
            Some(selection) if base.role.is_privileged() => selection,
            _ => {
                return Ok(ScopeResolution {
                    scope: base,
                    warning: None,
                })
            }
        };

        let listing = self
            .queries
            .fetch_typed::<TenantList>(&resources::tenants(
                TENANT_LISTING_SKIP,
                TENANT_LISTING_LIMIT,
            ))
            .await;
        let resolved = match listing {
            Ok(listing) => resolve_selection(&listing, selection),
            Err(SyncError::AuthRequired) => return Err(SyncError::AuthRequired),
            Err(err) => Err(format!("tenant listing unavailable: {}", err)),
        };

        match resolved {
            Ok(tenant_id) => Ok(ScopeResolution {
                scope: base.with_selection(Some(tenant_id)),
                warning: None,
            }),
            Err(reason) => {
                tracing::warn!(
                    user_id = %session.id,
                    selection = ?selection,
                    reason = %reason,
                    "Falling back to the user's own tenant"
                );
                Ok(ScopeResolution {
                    scope: base,
                    warning: Some(SyncError::ScopeUnresolved { reason }),
                })
            }
        }
    }
}

fn resolve_selection(listing: &TenantList, selection: TenantSelection) -> Result<TenantId, String> {
    match selection {
        TenantSelection::Plant(plant_id) => listing
            .tenant_for_plant(plant_id)
            .map(|tenant| tenant.id)
            .ok_or_else(|| format!("no tenant owns plant {}", plant_id)),
        TenantSelection::Tenant(tenant_id) if listing.contains(tenant_id) => Ok(tenant_id),
        TenantSelection::Tenant(tenant_id) => Err(format!("unknown tenant {}", tenant_id)),
    }
}

/// The current scope, shared by every component.
pub struct ScopeState {
    queries: QueryClient,
    current: watch::Sender<Option<ScopeContext>>,
    selection: Mutex<Option<TenantSelection>>,
}

impl fmt::Debug for ScopeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopeState")
            .field("current", &*self.current.borrow())
            .finish()
    }
}

impl ScopeState {
    pub fn new(queries: QueryClient) -> Self {
        let (current, _) = watch::channel(None);
        Self {
            queries,
            current,
            selection: Mutex::new(None),
        }
    }

    pub fn current(&self) -> Option<ScopeContext> {
        *self.current.borrow()
    }

    /// Observe scope changes. `None` means signed out.
    pub fn subscribe(&self) -> watch::Receiver<Option<ScopeContext>> {
        self.current.subscribe()
    }

    /// Resolve and install a new scope.
    ///
    /// When the effective tenant changes, every key scoped to the previous
    /// tenant is invalidated. Tenant-less keys are left alone.
    pub async fn select_tenant(
        &self,
        resolver: &IdentityResolver,
        session: &UserPublic,
        selection: Option<TenantSelection>,
    ) -> SyncResult<ScopeResolution> {
        let resolution = resolver.resolve_scope(session, selection).await?;
        let next = resolution.scope;
        let previous = self.current.send_replace(Some(next));

        if let Some(previous) = previous {
            let from = previous.effective_tenant();
            let to = next.effective_tenant();
            if from != to {
                let refetched = self.queries.invalidate(&KeyFilter::tenant(from));
                tracing::info!(
                    from = %from,
                    to = %to,
                    refetched = refetched.len(),
                    "Tenant switched"
                );
            }
        }

        // Only a selection that resolved is worth restoring next time.
        let remembered = if resolution.warning.is_none() {
            selection
        } else {
            None
        };
        *self.selection.lock().unwrap_or_else(|e| e.into_inner()) = remembered;
        Ok(resolution)
    }

    /// Drop the scope and every cached entry.
    pub fn logout(&self) {
        self.current.send_replace(None);
        *self.selection.lock().unwrap_or_else(|e| e.into_inner()) = None;
        let dropped = self.queries.store().clear();
        tracing::info!(dropped, "Signed out");
    }

    pub fn persisted_state(&self) -> PersistedState {
        PersistedState {
            selection: *self.selection.lock().unwrap_or_else(|e| e.into_inner()),
        }
    }
}
