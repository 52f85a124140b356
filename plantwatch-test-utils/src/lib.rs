//! PlantWatch Test Utilities
//!
//! Shared test infrastructure for the PlantWatch workspace:
//! - A scripted in-memory transport with per-call gates
//! - A switchable credential provider
//! - Proptest generators for ids, keys and roles
//! - Fixtures for users, tenants and command confirmations

pub use plantwatch_core::{
    ApiError, ApiRequest, CommandStatus, CommandStatusEvent, CorrelationId, Credential,
    CredentialProvider, ManualClock, Method, PlantId, Role, TenantId, TenantInfo,
    TenantSelection, Transport, UserId, UserPublic,
};

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;

// ============================================================================
// MOCK TRANSPORT
// ============================================================================

/// Produces the response for the n-th call on a route.
pub type Responder = dyn Fn(&ApiRequest, usize) -> Result<Value, ApiError> + Send + Sync;

type RouteKey = (Method, String);

#[derive(Debug, Default)]
struct GateState {
    open: bool,
    released: HashSet<usize>,
}

/// Holds calls on one route until they are released.
///
/// Calls are numbered per route in arrival order, starting at zero.
#[derive(Debug, Clone)]
pub struct Gate {
    state: Arc<watch::Sender<GateState>>,
}

impl Gate {
    fn new() -> Self {
        let (state, _) = watch::channel(GateState::default());
        Self {
            state: Arc::new(state),
        }
    }

    /// Let the call with this index complete.
    pub fn release(&self, index: usize) {
        self.state.send_modify(|state| {
            state.released.insert(index);
        });
    }

    /// Let every call, current and future, complete.
    pub fn open(&self) {
        self.state.send_modify(|state| state.open = true);
    }

    async fn wait(&self, index: usize) {
        let mut rx = self.state.subscribe();
        let _ = rx
            .wait_for(|state| state.open || state.released.contains(&index))
            .await;
    }
}

#[derive(Default)]
struct Routes {
    responders: HashMap<RouteKey, Arc<Responder>>,
    gates: HashMap<RouteKey, Gate>,
    counters: HashMap<RouteKey, usize>,
    log: Vec<ApiRequest>,
}

/// In-memory [`Transport`] with scripted responses.
///
/// Unknown routes answer `404`.
pub struct MockTransport {
    routes: Mutex<Routes>,
    calls: watch::Sender<usize>,
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let routes = self.lock();
        f.debug_struct("MockTransport")
            .field("routes", &routes.responders.len())
            .field("calls", &routes.log.len())
            .finish()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        let (calls, _) = watch::channel(0);
        Self {
            routes: Mutex::new(Routes::default()),
            calls,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Routes> {
        self.routes.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Install a responder. The index it receives counts every call on the
    /// route so far.
    pub fn respond_with<F>(&self, method: Method, path: &str, responder: F)
    where
        F: Fn(&ApiRequest, usize) -> Result<Value, ApiError> + Send + Sync + 'static,
    {
        self.lock()
            .responders
            .insert((method, path.to_string()), Arc::new(responder));
    }

    /// Answer every call with the same result.
    pub fn respond(&self, method: Method, path: &str, result: Result<Value, ApiError>) {
        self.respond_with(method, path, move |_, _| result.clone());
    }

    pub fn respond_json(&self, method: Method, path: &str, body: Value) {
        self.respond(method, path, Ok(body));
    }

    /// Answer calls in order; the last result repeats.
    pub fn respond_sequence(
        &self,
        method: Method,
        path: &str,
        results: Vec<Result<Value, ApiError>>,
    ) {
        let start = self
            .lock()
            .counters
            .get(&(method, path.to_string()))
            .copied()
            .unwrap_or(0);
        self.respond_with(method, path, move |_, index| {
            let offset = index.saturating_sub(start);
            results
                .get(offset)
                .or_else(|| results.last())
                .cloned()
                .unwrap_or_else(|| Err(not_found()))
        });
    }

    /// Hold calls on a route until released.
    pub fn gate(&self, method: Method, path: &str) -> Gate {
        self.lock()
            .gates
            .entry((method, path.to_string()))
            .or_insert_with(Gate::new)
            .clone()
    }

    /// Every request received, in arrival order.
    pub fn calls(&self) -> Vec<ApiRequest> {
        self.lock().log.clone()
    }

    pub fn call_count(&self, method: Method, path: &str) -> usize {
        self.lock()
            .log
            .iter()
            .filter(|request| request.method == method && request.path == path)
            .count()
    }

    pub fn total_calls(&self) -> usize {
        self.lock().log.len()
    }

    /// Wait until at least `count` requests have been received.
    pub async fn wait_for_calls(&self, count: usize) {
        let mut rx = self.calls.subscribe();
        let _ = rx.wait_for(|calls| *calls >= count).await;
    }
}

fn not_found() -> ApiError {
    ApiError::Status {
        status: 404,
        detail: "Not Found".to_string(),
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: ApiRequest) -> Result<Value, ApiError> {
        let (index, responder, gate) = {
            let mut routes = self.lock();
            let key = (request.method, request.path.clone());
            let counter = routes.counters.entry(key.clone()).or_insert(0);
            let index = *counter;
            *counter += 1;
            routes.log.push(request.clone());
            (
                index,
                routes.responders.get(&key).cloned(),
                routes.gates.get(&key).cloned(),
            )
        };
        self.calls.send_modify(|calls| *calls += 1);

        if let Some(gate) = gate {
            gate.wait(index).await;
        }
        match responder {
            Some(responder) => responder(&request, index),
            None => Err(not_found()),
        }
    }
}

// ============================================================================
// MOCK CREDENTIALS
// ============================================================================

/// Credential provider that can be switched off mid-test.
#[derive(Debug)]
pub struct MockCredentials {
    valid: AtomicBool,
}

impl MockCredentials {
    pub fn valid() -> Self {
        Self {
            valid: AtomicBool::new(true),
        }
    }

    pub fn none() -> Self {
        Self {
            valid: AtomicBool::new(false),
        }
    }

    pub fn set_valid(&self, valid: bool) {
        self.valid.store(valid, Ordering::SeqCst);
    }
}

impl CredentialProvider for MockCredentials {
    fn current_credential(&self) -> Option<Credential> {
        self.valid
            .load(Ordering::SeqCst)
            .then(|| Credential::Bearer("test-token".to_string()))
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for PlantWatch types.

    use super::*;
    use plantwatch_cache::CacheKey;
    use proptest::prelude::*;
    use uuid::Uuid;

    pub fn arb_uuid() -> impl Strategy<Value = Uuid> {
        any::<[u8; 16]>().prop_map(Uuid::from_bytes)
    }

    pub fn arb_tenant_id() -> impl Strategy<Value = TenantId> {
        arb_uuid().prop_map(TenantId::new)
    }

    pub fn arb_user_id() -> impl Strategy<Value = UserId> {
        arb_uuid().prop_map(UserId::new)
    }

    pub fn arb_plant_id() -> impl Strategy<Value = PlantId> {
        (1i64..10_000).prop_map(PlantId::new)
    }

    pub fn arb_role() -> impl Strategy<Value = Role> {
        prop_oneof![
            Just(Role::Regular),
            Just(Role::Admin),
            Just(Role::Manager),
            Just(Role::Superuser),
        ]
    }

    /// Device id lists, duplicates and arbitrary order included.
    pub fn arb_device_ids() -> impl Strategy<Value = Vec<i64>> {
        prop::collection::vec(1i64..64, 1..8)
    }

    pub fn arb_tenant_selection() -> impl Strategy<Value = TenantSelection> {
        prop_oneof![
            arb_tenant_id().prop_map(TenantSelection::Tenant),
            arb_plant_id().prop_map(TenantSelection::Plant),
        ]
    }

    /// Keys of a few kinds, scoped to one of the given tenants.
    pub fn arb_cache_key(tenants: Vec<TenantId>) -> impl Strategy<Value = CacheKey> {
        let kinds = prop_oneof![
            Just("realtime"),
            Just("schedule"),
            Just("plc_data_settings"),
        ];
        (
            kinds,
            prop::sample::select(tenants),
            arb_device_ids(),
        )
            .prop_map(|(kind, tenant, devices)| {
                CacheKey::new(kind, tenant).param_list("device_ids", devices)
            })
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built payloads for common scenarios.

    use super::*;
    use serde_json::json;

    /// A user of `tenant_id` with the given backend role string.
    pub fn user(role: &str, is_superuser: bool, tenant_id: TenantId) -> UserPublic {
        UserPublic {
            id: UserId::now_v7(),
            email: format!("{}@plants.example.com", role),
            is_active: true,
            is_superuser,
            full_name: Some(format!("Test {}", role)),
            role: role.to_string(),
            tenant_id,
        }
    }

    pub fn tenant(name: &str, plant_id: Option<i64>) -> TenantInfo {
        TenantInfo {
            id: TenantId::now_v7(),
            name: name.to_string(),
            description: None,
            plant_id: plant_id.map(PlantId::new),
        }
    }

    /// Body of `GET /tenants/`.
    pub fn tenant_list(tenants: &[TenantInfo]) -> Value {
        json!({
            "data": tenants,
            "count": tenants.len(),
        })
    }

    /// `202 Accepted` body of a forwarded write.
    pub fn command_response(message_id: &str) -> Value {
        json!({
            "message": "Command accepted",
            "message_id": message_id,
        })
    }

    pub fn confirmation(
        message_id: &str,
        status: CommandStatus,
        error: Option<Value>,
    ) -> CommandStatusEvent {
        CommandStatusEvent {
            command_type: "schedule".to_string(),
            message_id: CorrelationId::new(message_id),
            status,
            error,
        }
    }

    /// Body of `GET /realtime-data/latest` with one value per device.
    pub fn realtime_values(plant_id: i64, device_ids: &[i64], value: &str) -> Value {
        let values: Vec<Value> = device_ids
            .iter()
            .map(|device_id| {
                json!({
                    "data_id": device_id * 100,
                    "plant_id": plant_id,
                    "device_id": device_id,
                    "name": format!("device {}", device_id),
                    "timestamp": 1_714_521_600_000i64,
                    "value": value,
                })
            })
            .collect();
        json!({ "values": values })
    }

    /// Body of `GET /schedule/` with `rows` default rows.
    pub fn schedule_rows(rows: usize) -> Value {
        let rows: Vec<Value> = (0..rows)
            .map(|i| {
                json!({
                    "ID": i as i64 + 1,
                    "REC_NO": i as i64 + 1,
                    "START_TIME": format!("{:02}:00:00", i),
                    "CHARGE_FROM_GRID": false,
                    "ALLOW_TO_SELL": true,
                    "CHARGE_POWER": 0.0,
                    "CHARGE_LIMIT": 100.0,
                    "DISCHARGE_POWER": 50.0,
                    "SOURCE": 1,
                })
            })
            .collect();
        Value::Array(rows)
    }
}
