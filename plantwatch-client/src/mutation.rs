//! Mutation coordinator.
//!
//! Every `mutate` call issues exactly one write. What happens to the cache
//! afterwards depends on the policy: ordinary writes invalidate their targets
//! straight away, while writes that are carried out by a plant controller
//! wait for the push confirmation that echoes their correlation id.

use crate::confirmation::ConfirmationHub;
use crate::notifications::{Notification, NotificationAction, NotificationLevel};
use crate::query::{QueryClient, Ttl};
use plantwatch_cache::{CacheKey, KeyFilter};
use plantwatch_core::{
    ApiRequest, CommandResponse, CommandStatus, CommandStatusEvent, CorrelationId, SyncError,
    SyncResult, Timestamp,
};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

/// A write plus the cache keys it affects.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationRequest {
    pub request: ApiRequest,
    pub targets: Vec<KeyFilter>,
    /// For writes that return the updated entity: the key that caches it.
    pub detail_key: Option<CacheKey>,
}

impl MutationRequest {
    pub fn new(request: ApiRequest) -> Self {
        Self {
            request,
            targets: Vec::new(),
            detail_key: None,
        }
    }

    pub fn target(mut self, filter: KeyFilter) -> Self {
        self.targets.push(filter);
        self
    }

    pub fn detail(mut self, key: CacheKey) -> Self {
        self.detail_key = Some(key);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationPolicy {
    InvalidateImmediately,
    /// Hold invalidation until the confirmation arrives or `timeout` passes.
    AwaitConfirmation { timeout: Duration },
}

/// What `mutate` resolves to.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationOutcome {
    /// The write completed and its targets were invalidated.
    Completed(serde_json::Value),
    /// The write was accepted; its effect is pending confirmation.
    Submitted { correlation_id: CorrelationId },
}

/// Lifecycle of the most recent `mutate` call.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationStatus {
    Idle,
    Running,
    Pending {
        correlation_id: CorrelationId,
        submitted_at: Timestamp,
    },
    Succeeded,
    /// Confirmed applied by the plant.
    Applied { correlation_id: CorrelationId },
    /// Refused by the device. The backend record was already written.
    Rejected {
        correlation_id: CorrelationId,
        detail: String,
    },
    /// No confirmation within the window. The write may or may not have
    /// taken effect; the cache was left as is.
    ConfirmationTimeout {
        correlation_id: CorrelationId,
        timeout_ms: u64,
    },
    /// The write itself failed.
    Failed(SyncError),
}

impl MutationStatus {
    pub fn is_settled(&self) -> bool {
        !matches!(self, Self::Idle | Self::Running | Self::Pending { .. })
    }

    /// The write went out but whether it took effect is unknown.
    pub fn is_uncertain(&self) -> bool {
        matches!(self, Self::ConfirmationTimeout { .. })
    }

    pub fn notification(&self) -> Option<Notification> {
        let note = match self {
            Self::Idle | Self::Running => return None,
            Self::Pending { .. } => {
                Notification::new(NotificationLevel::Info, "Change sent, waiting for the plant")
            }
            Self::Succeeded => Notification::new(NotificationLevel::Success, "Saved"),
            Self::Applied { .. } => {
                Notification::new(NotificationLevel::Success, "Applied by the plant")
            }
            Self::Rejected { detail, .. } => Notification::new(
                NotificationLevel::Error,
                format!("Rejected by the device: {}", detail),
            )
            .with_action(NotificationAction::Refresh),
            Self::ConfirmationTimeout {
                correlation_id,
                timeout_ms,
            } => Notification::from_error(&SyncError::ConfirmationTimeout {
                correlation_id: correlation_id.clone(),
                timeout_ms: *timeout_ms,
            }),
            Self::Failed(err) => Notification::from_error(err),
        };
        Some(note)
    }
}

/// A write waiting for its confirmation.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingMutation {
    pub id: Uuid,
    pub correlation_id: CorrelationId,
    pub target_keys: Vec<KeyFilter>,
    pub policy: MutationPolicy,
    pub payload: Option<serde_json::Value>,
    pub submitted_at: Timestamp,
}

struct MutationInner {
    queries: QueryClient,
    hub: Arc<ConfirmationHub>,
    pending: Mutex<HashMap<CorrelationId, PendingMutation>>,
}

impl MutationInner {
    fn lock_pending(&self) -> MutexGuard<'_, HashMap<CorrelationId, PendingMutation>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Factory for mutations. Cheap to clone.
#[derive(Clone)]
pub struct MutationClient {
    inner: Arc<MutationInner>,
}

impl fmt::Debug for MutationClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationClient")
            .field("pending", &self.inner.lock_pending().len())
            .finish()
    }
}

impl MutationClient {
    pub fn new(queries: QueryClient, hub: Arc<ConfirmationHub>) -> Self {
        Self {
            inner: Arc::new(MutationInner {
                queries,
                hub,
                pending: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Writes currently waiting for confirmation.
    pub fn pending(&self) -> Vec<PendingMutation> {
        let mut pending: Vec<_> = self.inner.lock_pending().values().cloned().collect();
        pending.sort_by_key(|p| p.submitted_at);
        pending
    }

    pub fn use_mutation<P, F>(&self, action: F, policy: MutationPolicy) -> Mutation<P>
    where
        F: Fn(P) -> SyncResult<MutationRequest> + Send + Sync + 'static,
    {
        let (status, _) = watch::channel(MutationStatus::Idle);
        Mutation {
            client: self.clone(),
            action: Arc::new(action),
            policy,
            status: Arc::new(status),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }
}

type Action<P> = dyn Fn(P) -> SyncResult<MutationRequest> + Send + Sync;

/// A bound write action.
pub struct Mutation<P> {
    client: MutationClient,
    action: Arc<Action<P>>,
    policy: MutationPolicy,
    status: Arc<watch::Sender<MutationStatus>>,
    generation: Arc<AtomicU64>,
}

impl<P> fmt::Debug for Mutation<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutation")
            .field("policy", &self.policy)
            .field("status", &*self.status.borrow())
            .finish()
    }
}

impl<P> Mutation<P> {
    pub fn policy(&self) -> MutationPolicy {
        self.policy
    }

    pub fn status(&self) -> watch::Receiver<MutationStatus> {
        self.status.subscribe()
    }

    pub fn current_status(&self) -> MutationStatus {
        self.status.borrow().clone()
    }

    /// Wait until the most recent `mutate` call has settled.
    pub async fn settled(&self) -> MutationStatus {
        let mut rx = self.status.subscribe();
        let settled = match rx.wait_for(|status| status.is_settled() || *status == MutationStatus::Idle).await {
            Ok(status) => status.clone(),
            Err(_) => self.current_status(),
        };
        settled
    }

    /// Execute the write once. Errors are returned and leave the cache as is.
    pub async fn mutate(&self, payload: P) -> SyncResult<MutationOutcome> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.status.send_replace(MutationStatus::Running);

        let request = match (self.action)(payload) {
            Ok(request) => request,
            Err(err) => {
                self.status.send_replace(MutationStatus::Failed(err.clone()));
                return Err(err);
            }
        };

        let inner = &self.client.inner;
        let response = inner
            .queries
            .transport()
            .send(request.request.clone())
            .await
            .map_err(SyncError::from);
        let response = match response {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(request = %request.request, error = %err, "Mutation failed");
                self.status.send_replace(MutationStatus::Failed(err.clone()));
                return Err(err);
            }
        };

        match self.policy {
            MutationPolicy::InvalidateImmediately => Ok(self.complete(&request, response)),
            MutationPolicy::AwaitConfirmation { timeout } => {
                // Saved rows instead of a CommandResponse: applied synchronously.
                if response.is_array() {
                    tracing::debug!(request = %request.request, "Write applied without confirmation");
                    return Ok(self.complete(&request, response));
                }
                let accepted: CommandResponse = match serde_json::from_value(response) {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        let err = SyncError::decode(err);
                        self.status.send_replace(MutationStatus::Failed(err.clone()));
                        return Err(err);
                    }
                };
                let correlation_id = accepted.message_id;
                self.await_confirmation(generation, request, correlation_id.clone(), timeout);
                Ok(MutationOutcome::Submitted { correlation_id })
            }
        }
    }

    fn complete(&self, request: &MutationRequest, response: serde_json::Value) -> MutationOutcome {
        let queries = &self.client.inner.queries;
        if let Some(detail_key) = &request.detail_key {
            let ttl = queries.ttl_for(Ttl::Default);
            queries.store().put(detail_key, response.clone(), ttl);
        }
        for target in &request.targets {
            queries.invalidate(target);
        }
        tracing::info!(request = %request.request, "Mutation completed");
        self.status.send_replace(MutationStatus::Succeeded);
        MutationOutcome::Completed(response)
    }

    fn await_confirmation(
        &self,
        generation: u64,
        request: MutationRequest,
        correlation_id: CorrelationId,
        timeout: Duration,
    ) {
        let inner = self.client.inner.clone();
        let confirmation = inner.hub.register(correlation_id.clone());
        let submitted_at = inner.queries.store().now();
        inner.lock_pending().insert(
            correlation_id.clone(),
            PendingMutation {
                id: Uuid::new_v4(),
                correlation_id: correlation_id.clone(),
                target_keys: request.targets.clone(),
                policy: self.policy,
                payload: request.request.body.clone(),
                submitted_at,
            },
        );
        self.status.send_replace(MutationStatus::Pending {
            correlation_id: correlation_id.clone(),
            submitted_at,
        });
        tracing::info!(
            correlation_id = %correlation_id,
            request = %request.request,
            timeout_ms = timeout.as_millis() as u64,
            "Awaiting confirmation"
        );

        let status = self.status.clone();
        let current = self.generation.clone();
        tokio::spawn(async move {
            let outcome = tokio::time::timeout(timeout, confirmation).await;
            inner.lock_pending().remove(&correlation_id);
            let settled = match outcome {
                Ok(Ok(event)) => settle_confirmed(&inner.queries, &request, event, timeout),
                Ok(Err(_)) | Err(_) => {
                    inner.hub.forget(&correlation_id);
                    tracing::warn!(correlation_id = %correlation_id, "Confirmation timed out");
                    MutationStatus::ConfirmationTimeout {
                        correlation_id,
                        timeout_ms: timeout.as_millis() as u64,
                    }
                }
            };
            // A newer mutate call owns the status now.
            if current.load(Ordering::SeqCst) == generation {
                status.send_replace(settled);
            }
        });
    }
}

fn settle_confirmed(
    queries: &QueryClient,
    request: &MutationRequest,
    event: CommandStatusEvent,
    timeout: Duration,
) -> MutationStatus {
    let correlation_id = event.message_id.clone();
    match event.status {
        CommandStatus::Ok => {
            for target in &request.targets {
                queries.invalidate(target);
            }
            tracing::info!(correlation_id = %correlation_id, "Confirmation received");
            MutationStatus::Applied { correlation_id }
        }
        CommandStatus::Error => {
            for target in &request.targets {
                queries.invalidate(target);
            }
            let detail = event
                .error_detail()
                .unwrap_or_else(|| "device reported an error".to_string());
            tracing::warn!(correlation_id = %correlation_id, detail = %detail, "Command rejected by device");
            MutationStatus::Rejected {
                correlation_id,
                detail,
            }
        }
        CommandStatus::Timeout => {
            tracing::warn!(correlation_id = %correlation_id, "Backend gave up waiting for the device");
            MutationStatus::ConfirmationTimeout {
                correlation_id,
                timeout_ms: timeout.as_millis() as u64,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plantwatch_cache::{CacheConfig, CacheStore};
    use plantwatch_core::{ApiError, ManualClock, Method};
    use plantwatch_test_utils::MockTransport;
    use serde_json::json;

    fn setup() -> (Arc<MockTransport>, MutationClient, QueryClient) {
        let transport = Arc::new(MockTransport::new());
        let store = Arc::new(CacheStore::new(
            CacheConfig::default(),
            Arc::new(ManualClock::default()),
        ));
        let queries = QueryClient::new(store, transport.clone());
        let hub = Arc::new(ConfirmationHub::new(Duration::from_secs(30)));
        (transport, MutationClient::new(queries.clone(), hub), queries)
    }

    #[tokio::test]
    async fn test_failed_write_leaves_cache_untouched() {
        let (transport, mutations, queries) = setup();
        transport.respond(
            Method::Patch,
            "/users/u1",
            Err(ApiError::Status {
                status: 422,
                detail: "invalid email".to_string(),
            }),
        );
        let list_key = CacheKey::global("users").param("skip", 0i64);
        queries.store().put(&list_key, json!([]), Duration::from_secs(60));

        let mutation = mutations.use_mutation(
            |_: ()| {
                Ok(MutationRequest::new(ApiRequest::new(Method::Patch, "/users/u1"))
                    .target(KeyFilter::kind("users")))
            },
            MutationPolicy::InvalidateImmediately,
        );
        let err = mutation.mutate(()).await.expect_err("should fail");
        assert_eq!(
            err,
            SyncError::Validation {
                status: 422,
                detail: "invalid email".to_string()
            }
        );
        assert!(!queries.store().get(&list_key).is_stale(queries.store().now()));
        assert_eq!(transport.total_calls(), 1);
        assert_eq!(mutation.current_status(), MutationStatus::Failed(err));
    }

    #[tokio::test]
    async fn test_update_populates_detail_and_invalidates_list() {
        let (transport, mutations, queries) = setup();
        transport.respond_json(Method::Put, "/tenants/t1", json!({"id": "t1", "name": "Renamed"}));
        let list_key = CacheKey::global("tenants");
        let detail_key = CacheKey::global("tenant").param("id", "t1");
        queries.store().put(&list_key, json!({"data": [], "count": 0}), Duration::from_secs(60));

        let mutation = mutations.use_mutation(
            |name: String| {
                Ok(MutationRequest::new(
                    ApiRequest::new(Method::Put, "/tenants/t1").json(&json!({ "name": name }))?,
                )
                .target(KeyFilter::kind("tenants"))
                .detail(CacheKey::global("tenant").param("id", "t1")))
            },
            MutationPolicy::InvalidateImmediately,
        );
        let outcome = mutation.mutate("Renamed".to_string()).await.expect("mutate");
        assert!(matches!(outcome, MutationOutcome::Completed(_)));
        assert_eq!(
            queries.store().get(&detail_key).value.as_deref(),
            Some(&json!({"id": "t1", "name": "Renamed"}))
        );
        assert!(queries.store().get(&list_key).is_stale(queries.store().now()));
        assert_eq!(mutation.settled().await, MutationStatus::Succeeded);
    }

    #[test]
    fn test_status_notifications() {
        let timeout = MutationStatus::ConfirmationTimeout {
            correlation_id: CorrelationId::new("m1"),
            timeout_ms: 30_000,
        };
        assert!(timeout.is_uncertain());
        assert!(!MutationStatus::Failed(SyncError::TransientFetch {
            reason: "connection reset".to_string(),
        })
        .is_uncertain());
        assert!(timeout.is_settled());
        let note = timeout.notification().expect("notification");
        assert_eq!(note.level, NotificationLevel::Warning);

        let rejected = MutationStatus::Rejected {
            correlation_id: CorrelationId::new("m1"),
            detail: "-3".to_string(),
        };
        assert_eq!(
            rejected.notification().map(|n| n.level),
            Some(NotificationLevel::Error)
        );
        assert!(MutationStatus::Running.notification().is_none());
        assert!(!MutationStatus::Pending {
            correlation_id: CorrelationId::new("m1"),
            submitted_at: chrono::Utc::now(),
        }
        .is_settled());
    }
}
