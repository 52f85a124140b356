use chrono::NaiveDate;
use plantwatch_cache::{CacheConfig, CacheKey, CacheStore, KeyFilter};
use plantwatch_client::config::{
    AuthConfig, CacheSettings, ClientConfig, LogFormat, ReconnectConfig,
};
use plantwatch_client::confirmation::ConfirmationHub;
use plantwatch_client::identity::{IdentityResolver, ScopeState};
use plantwatch_client::mutation::{
    MutationClient, MutationOutcome, MutationPolicy, MutationStatus,
};
use plantwatch_client::query::{QueryClient, QueryHandle, QueryOptions};
use plantwatch_client::resources;
use plantwatch_core::{
    ApiError, CommandStatus, CorrelationId, DeviceId, ManualClock, Method, PlantId,
    RealtimeDataResponse, ScheduleRow, SyncError, TenantId, TenantSelection,
};
use plantwatch_test_utils::generators::{arb_device_ids, arb_tenant_id, arb_tenant_selection};
use plantwatch_test_utils::{fixtures, MockCredentials, MockTransport};
use proptest::prelude::*;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;

const CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(30);

struct Harness {
    transport: Arc<MockTransport>,
    queries: QueryClient,
    resolver: IdentityResolver,
    hub: Arc<ConfirmationHub>,
    mutations: MutationClient,
}

fn harness() -> Harness {
    let transport = Arc::new(MockTransport::new());
    let store = Arc::new(CacheStore::new(
        CacheConfig::default(),
        Arc::new(ManualClock::default()),
    ));
    let queries = QueryClient::new(store, transport.clone());
    let resolver = IdentityResolver::new(queries.clone(), Arc::new(MockCredentials::valid()));
    let hub = Arc::new(ConfirmationHub::new(CONFIRMATION_TIMEOUT));
    let mutations = MutationClient::new(queries.clone(), hub.clone());
    Harness {
        transport,
        queries,
        resolver,
        hub,
        mutations,
    }
}

fn devices(ids: &[i64]) -> Vec<DeviceId> {
    ids.iter().copied().map(DeviceId::new).collect()
}

fn plant() -> PlantId {
    PlantId::new(2500)
}

fn may_first() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 5, 1).expect("valid date")
}

async fn wait_for_data<T: DeserializeOwned>(handle: &mut QueryHandle<T>) -> T {
    loop {
        let state = handle.state();
        if let (Some(data), false) = (state.data, state.is_placeholder) {
            return data;
        }
        assert!(handle.changed().await, "store dropped");
    }
}

fn base_config() -> ClientConfig {
    ClientConfig {
        api_base_url: "https://plants.example.com/api/v1".to_string(),
        ws_endpoint: "wss://plants.example.com/api/v1/ws".to_string(),
        auth: AuthConfig {
            api_key: Some("test-key".to_string()),
            jwt: None,
        },
        request_timeout_ms: 5_000,
        poll_interval_ms: 10_000,
        confirmation_timeout_ms: 30_000,
        cache: CacheSettings {
            default_ttl_ms: 300_000,
            telemetry_ttl_ms: 5_000,
            gc_window_ms: 600_000,
        },
        persistence_path: "tmp/plantwatch.json".into(),
        telemetry_device_ids: vec![2, 4],
        log_format: LogFormat::Json,
        reconnect: ReconnectConfig {
            initial_ms: 250,
            max_ms: 5_000,
            multiplier: 1.5,
            jitter_ms: 100,
        },
    }
}

// ============================================================================
// CONFIG
// ============================================================================

#[test]
fn config_base_is_valid() {
    assert!(base_config().validate().is_ok());
}

#[test]
fn config_requires_auth() {
    let mut config = base_config();
    config.auth = AuthConfig {
        api_key: None,
        jwt: None,
    };
    assert!(config.validate().is_err());
}

#[test]
fn config_requires_websocket_scheme() {
    let mut config = base_config();
    config.ws_endpoint = "https://plants.example.com/api/v1/ws".to_string();
    assert!(config.validate().is_err());
}

#[test]
fn config_telemetry_ttl_cannot_exceed_poll_interval() {
    let mut config = base_config();
    config.cache.telemetry_ttl_ms = config.poll_interval_ms + 1;
    assert!(config.validate().is_err());
}

#[test]
fn config_rejects_zero_gc_window() {
    let mut config = base_config();
    config.cache.gc_window_ms = 0;
    assert!(config.validate().is_err());
}

#[test]
fn config_rejects_zero_confirmation_timeout() {
    let mut config = base_config();
    config.confirmation_timeout_ms = 0;
    assert!(config.validate().is_err());
}

// ============================================================================
// QUERIES
// ============================================================================

#[tokio::test]
async fn concurrent_reads_issue_one_request() {
    let h = harness();
    let tenant = TenantId::now_v7();
    h.transport.respond_json(
        Method::Get,
        "/realtime-data/latest",
        fixtures::realtime_values(2500, &[2, 4], "1.5"),
    );
    let gate = h.transport.gate(Method::Get, "/realtime-data/latest");
    let query = resources::realtime_latest(tenant, &devices(&[2, 4]));

    let readers: Vec<_> = (0..8)
        .map(|_| {
            let queries = h.queries.clone();
            let query = query.clone();
            tokio::spawn(async move { queries.fetch(&query).await })
        })
        .collect();
    h.transport.wait_for_calls(1).await;
    tokio::task::yield_now().await;
    gate.open();

    for reader in readers {
        let value = reader.await.expect("join").expect("fetch");
        assert_eq!(value["values"].as_array().map(Vec::len), Some(2));
    }
    assert_eq!(h.transport.call_count(Method::Get, "/realtime-data/latest"), 1);
}

#[tokio::test]
async fn device_order_hits_the_same_entry() {
    let h = harness();
    let tenant = TenantId::now_v7();
    h.transport.respond_json(
        Method::Get,
        "/realtime-data/latest",
        fixtures::realtime_values(2500, &[2, 4], "1.5"),
    );
    let first: RealtimeDataResponse = h
        .queries
        .fetch_typed(&resources::realtime_latest(tenant, &devices(&[4, 2])))
        .await
        .expect("fetch");
    let second: RealtimeDataResponse = h
        .queries
        .fetch_typed(&resources::realtime_latest(tenant, &devices(&[2, 4])))
        .await
        .expect("fetch");
    assert_eq!(first, second);
    assert_eq!(h.transport.total_calls(), 1);
}

#[tokio::test]
async fn invalidation_is_scoped_to_kind_and_tenant() {
    let h = harness();
    let t1 = TenantId::now_v7();
    let t2 = TenantId::now_v7();
    let store = h.queries.store();
    let realtime_t1 = resources::realtime_latest(t1, &devices(&[2])).key;
    let realtime_t2 = resources::realtime_latest(t2, &devices(&[2])).key;
    let schedule_t1 = resources::schedule(t1, plant(), may_first()).key;
    for key in [&realtime_t1, &realtime_t2, &schedule_t1] {
        store.put(key, serde_json::json!({"values": []}), Duration::from_secs(60));
    }

    let refetched = h
        .queries
        .invalidate(&KeyFilter::kind(resources::kinds::REALTIME).in_tenant(t1));
    assert!(refetched.is_empty());

    let now = store.now();
    assert!(store.get(&realtime_t1).is_stale(now));
    assert!(!store.get(&realtime_t2).is_stale(now));
    assert!(!store.get(&schedule_t1).is_stale(now));
    assert_eq!(h.transport.total_calls(), 0);
}

#[tokio::test]
async fn invalidating_a_watched_key_refetches_it() {
    let h = harness();
    let tenant = TenantId::now_v7();
    h.transport.respond_sequence(
        Method::Get,
        "/schedule/",
        vec![Ok(fixtures::schedule_rows(1)), Ok(fixtures::schedule_rows(3))],
    );
    let mut handle: QueryHandle<Vec<ScheduleRow>> = h
        .queries
        .use_result(resources::schedule(tenant, plant(), may_first()), QueryOptions::new());
    assert_eq!(wait_for_data(&mut handle).await.len(), 1);

    let refetched = h.queries.invalidate(&KeyFilter::tenant(tenant));
    assert_eq!(refetched, vec![handle.key().clone()]);
    while wait_for_data(&mut handle).await.len() != 3 {
        assert!(handle.changed().await);
    }
    assert_eq!(h.transport.call_count(Method::Get, "/schedule/"), 2);
}

#[tokio::test]
async fn superseded_fetch_never_overwrites_newer_value() {
    let h = harness();
    let tenant = TenantId::now_v7();
    h.transport
        .respond_with(Method::Get, "/schedule/", |_, index| match index {
            0 => Ok(serde_json::json!("older")),
            _ => Ok(serde_json::json!("newer")),
        });
    let gate = h.transport.gate(Method::Get, "/schedule/");
    let query = resources::schedule(tenant, plant(), may_first());

    let first = tokio::spawn({
        let queries = h.queries.clone();
        let query = query.clone();
        async move { queries.refresh(&query).await }
    });
    h.transport.wait_for_calls(1).await;
    let second = tokio::spawn({
        let queries = h.queries.clone();
        let query = query.clone();
        async move { queries.refetch(&query).await }
    });
    h.transport.wait_for_calls(2).await;

    gate.release(1);
    assert_eq!(second.await.expect("join"), Ok(serde_json::json!("newer")));
    gate.release(0);
    assert_eq!(first.await.expect("join"), Ok(serde_json::json!("older")));

    let store = h.queries.store();
    let entry = store.peek(&query.key).expect("entry");
    assert_eq!(entry.value.as_deref(), Some(&serde_json::json!("newer")));
    assert!(store.stats().superseded >= 1);
}

#[test]
fn put_then_get_round_trips() {
    let store = CacheStore::new(CacheConfig::default(), Arc::new(ManualClock::default()));
    let key = CacheKey::new(resources::kinds::SCHEDULE, TenantId::now_v7()).param("date", may_first());
    store.put(&key, serde_json::json!([1, 2, 3]), Duration::from_secs(60));

    let entry = store.get(&key);
    let now = store.now();
    assert_eq!(entry.value.as_deref(), Some(&serde_json::json!([1, 2, 3])));
    assert!(entry.stale_after.is_some_and(|stale_after| stale_after > now));
    assert!(!entry.is_stale(now));
}

#[tokio::test]
async fn keep_previous_data_shows_old_value_while_loading() {
    let h = harness();
    let tenant = TenantId::now_v7();
    h.transport
        .respond_with(Method::Get, "/schedule/", |_, index| Ok(fixtures::schedule_rows(index + 1)));
    let gate = h.transport.gate(Method::Get, "/schedule/");
    gate.release(0);

    let mut handle: QueryHandle<Vec<ScheduleRow>> = h.queries.use_result(
        resources::schedule(tenant, plant(), may_first()),
        QueryOptions::new().keep_previous_data(true),
    );
    assert_eq!(wait_for_data(&mut handle).await.len(), 1);

    let next_day = may_first().succ_opt().expect("next day");
    handle.set_query(resources::schedule(tenant, plant(), next_day));
    h.transport.wait_for_calls(2).await;
    let state = handle.state();
    assert!(state.is_loading);
    assert!(state.is_placeholder);
    assert_eq!(state.data.map(|rows| rows.len()), Some(1));

    gate.release(1);
    assert_eq!(wait_for_data(&mut handle).await.len(), 2);
}

#[tokio::test]
async fn keep_previous_data_never_crosses_tenants() {
    let h = harness();
    let (tenant_a, tenant_b) = (TenantId::now_v7(), TenantId::now_v7());
    h.transport
        .respond_with(Method::Get, "/schedule/", |_, index| Ok(fixtures::schedule_rows(index + 1)));
    let gate = h.transport.gate(Method::Get, "/schedule/");
    gate.release(0);

    let mut handle: QueryHandle<Vec<ScheduleRow>> = h.queries.use_result(
        resources::schedule(tenant_a, plant(), may_first()),
        QueryOptions::new().keep_previous_data(true),
    );
    assert_eq!(wait_for_data(&mut handle).await.len(), 1);

    handle.set_query(resources::schedule(tenant_b, plant(), may_first()));
    h.transport.wait_for_calls(2).await;
    let state = handle.state();
    assert!(state.is_loading);
    assert!(!state.is_placeholder);
    assert!(state.data.is_none());

    gate.release(1);
    assert_eq!(wait_for_data(&mut handle).await.len(), 2);
}

// ============================================================================
// IDENTITY
// ============================================================================

#[tokio::test]
async fn privileged_plant_selection_maps_to_owning_tenant() {
    let h = harness();
    let t9 = fixtures::tenant("T9", Some(2500));
    let other = fixtures::tenant("T3", Some(1200));
    h.transport.respond_json(
        Method::Get,
        "/tenants/",
        fixtures::tenant_list(&[other, t9.clone()]),
    );
    let own = TenantId::now_v7();
    let admin = fixtures::user("admin", false, own);

    let resolution = h
        .resolver
        .resolve_scope(&admin, Some(TenantSelection::Plant(PlantId::new(2500))))
        .await
        .expect("resolve");
    assert_eq!(resolution.scope.effective_tenant(), t9.id);
    assert!(resolution.warning.is_none());

    let unknown = h
        .resolver
        .resolve_scope(&admin, Some(TenantSelection::Plant(PlantId::new(9999))))
        .await
        .expect("resolve");
    assert_eq!(unknown.scope.effective_tenant(), own);
    assert!(matches!(
        unknown.warning,
        Some(SyncError::ScopeUnresolved { .. })
    ));
    // The listing is itself cached.
    assert_eq!(h.transport.call_count(Method::Get, "/tenants/"), 1);
}

#[tokio::test]
async fn logout_resets_watched_entries_and_drops_the_rest() {
    let h = harness();
    let own = TenantId::now_v7();
    let user = fixtures::user("client", false, own);
    h.transport
        .respond_json(Method::Get, "/schedule/", fixtures::schedule_rows(2));
    let scope = ScopeState::new(h.queries.clone());
    scope
        .select_tenant(&h.resolver, &user, None)
        .await
        .expect("select");

    let mut handle: QueryHandle<Vec<ScheduleRow>> = h
        .queries
        .use_result(resources::schedule(own, plant(), may_first()), QueryOptions::new().enabled(false));
    h.queries
        .fetch(&resources::schedule(own, plant(), may_first()))
        .await
        .expect("fetch");
    h.queries
        .fetch(&resources::schedule(own, plant(), may_first().succ_opt().expect("date")))
        .await
        .expect("fetch");
    assert_eq!(wait_for_data(&mut handle).await.len(), 2);

    scope.logout();
    assert_eq!(scope.current(), None);
    assert_eq!(h.queries.store().len(), 1);
    let state = handle.state();
    assert_eq!(state.data, None);
}

// ============================================================================
// MUTATIONS
// ============================================================================

fn schedule_mutation(h: &Harness, tenant: TenantId) -> plantwatch_client::mutation::Mutation<Vec<ScheduleRow>> {
    h.mutations.use_mutation(
        move |rows: Vec<ScheduleRow>| resources::bulk_schedule(tenant, plant(), may_first(), &rows),
        MutationPolicy::AwaitConfirmation {
            timeout: CONFIRMATION_TIMEOUT,
        },
    )
}

#[tokio::test(start_paused = true)]
async fn bulk_schedule_applies_after_confirmation() {
    let h = harness();
    let tenant = TenantId::now_v7();
    h.transport.respond_sequence(
        Method::Get,
        "/schedule/",
        vec![Ok(fixtures::schedule_rows(2)), Ok(fixtures::schedule_rows(4))],
    );
    h.transport.respond_json(
        Method::Put,
        "/schedule/bulk",
        fixtures::command_response("m-1"),
    );
    let mut handle: QueryHandle<Vec<ScheduleRow>> = h
        .queries
        .use_result(resources::schedule(tenant, plant(), may_first()), QueryOptions::new());
    let rows = wait_for_data(&mut handle).await;
    assert_eq!(rows.len(), 2);

    let mutation = schedule_mutation(&h, tenant);
    let outcome = mutation.mutate(rows).await.expect("submit");
    assert_eq!(
        outcome,
        MutationOutcome::Submitted {
            correlation_id: CorrelationId::new("m-1")
        }
    );
    assert!(matches!(
        mutation.current_status(),
        MutationStatus::Pending { .. }
    ));
    assert_eq!(h.mutations.pending().len(), 1);
    assert_eq!(h.transport.call_count(Method::Get, "/schedule/"), 1);
    assert_eq!(h.transport.call_count(Method::Put, "/schedule/bulk"), 1);

    tokio::time::advance(Duration::from_secs(2)).await;
    h.hub
        .deliver(fixtures::confirmation("m-1", CommandStatus::Ok, None));
    assert_eq!(
        mutation.settled().await,
        MutationStatus::Applied {
            correlation_id: CorrelationId::new("m-1")
        }
    );
    assert!(h.mutations.pending().is_empty());

    while wait_for_data(&mut handle).await.len() != 4 {
        assert!(handle.changed().await);
    }
    assert_eq!(h.transport.call_count(Method::Get, "/schedule/"), 2);
}

#[tokio::test(start_paused = true)]
async fn bulk_schedule_without_confirmation_times_out() {
    let h = harness();
    let tenant = TenantId::now_v7();
    let key = resources::schedule(tenant, plant(), may_first()).key;
    h.queries
        .store()
        .put(&key, fixtures::schedule_rows(2), Duration::from_secs(3600));
    h.transport.respond_json(
        Method::Put,
        "/schedule/bulk",
        fixtures::command_response("m-2"),
    );

    let mutation = schedule_mutation(&h, tenant);
    mutation.mutate(Vec::new()).await.expect("submit");
    tokio::time::advance(CONFIRMATION_TIMEOUT + Duration::from_secs(1)).await;

    let status = mutation.settled().await;
    assert!(status.is_uncertain());
    assert!(!matches!(status, MutationStatus::Failed(_)));
    assert_eq!(
        status,
        MutationStatus::ConfirmationTimeout {
            correlation_id: CorrelationId::new("m-2"),
            timeout_ms: 30_000,
        }
    );
    let store = h.queries.store();
    let entry = store.get(&key);
    assert!(!entry.is_stale(store.now()));
    assert_eq!(entry.value.as_deref(), Some(&fixtures::schedule_rows(2)));
    assert_eq!(h.hub.waiting_count(), 0);
    assert!(h.mutations.pending().is_empty());
    assert_eq!(h.transport.total_calls(), 1);
}

#[tokio::test]
async fn backend_timeout_is_uncertain_not_failed() {
    let h = harness();
    let tenant = TenantId::now_v7();
    let key = resources::schedule(tenant, plant(), may_first()).key;
    h.queries
        .store()
        .put(&key, fixtures::schedule_rows(2), Duration::from_secs(3600));
    h.transport.respond_json(
        Method::Put,
        "/schedule/bulk",
        fixtures::command_response("m-7"),
    );

    let mutation = schedule_mutation(&h, tenant);
    mutation.mutate(Vec::new()).await.expect("submit");
    h.hub
        .deliver(fixtures::confirmation("m-7", CommandStatus::Timeout, None));

    let status = mutation.settled().await;
    assert_eq!(
        status,
        MutationStatus::ConfirmationTimeout {
            correlation_id: CorrelationId::new("m-7"),
            timeout_ms: 30_000,
        }
    );
    assert!(status.is_uncertain());
    let store = h.queries.store();
    assert!(!store.get(&key).is_stale(store.now()));
}

#[tokio::test]
async fn bulk_schedule_answered_with_rows_completes_at_once() {
    let h = harness();
    let tenant = TenantId::now_v7();
    let key = resources::schedule(tenant, plant(), may_first()).key;
    h.queries
        .store()
        .put(&key, fixtures::schedule_rows(2), Duration::from_secs(3600));
    h.transport
        .respond_json(Method::Put, "/schedule/bulk", fixtures::schedule_rows(3));

    let mutation = schedule_mutation(&h, tenant);
    let outcome = mutation.mutate(Vec::new()).await.expect("submit");
    assert_eq!(outcome, MutationOutcome::Completed(fixtures::schedule_rows(3)));
    assert_eq!(mutation.settled().await, MutationStatus::Succeeded);
    assert!(h.mutations.pending().is_empty());
    assert_eq!(h.hub.waiting_count(), 0);
    let store = h.queries.store();
    assert!(store.get(&key).is_stale(store.now()));
}

#[tokio::test]
async fn early_confirmation_is_matched_on_submit() {
    let h = harness();
    let tenant = TenantId::now_v7();
    h.transport.respond_json(
        Method::Put,
        "/schedule/bulk",
        fixtures::command_response("m-3"),
    );
    h.hub
        .deliver(fixtures::confirmation("m-3", CommandStatus::Ok, None));

    let mutation = schedule_mutation(&h, tenant);
    mutation.mutate(Vec::new()).await.expect("submit");
    assert_eq!(
        mutation.settled().await,
        MutationStatus::Applied {
            correlation_id: CorrelationId::new("m-3")
        }
    );
    assert_eq!(h.hub.buffered_count(), 0);
}

#[tokio::test]
async fn device_rejection_still_invalidates() {
    let h = harness();
    let tenant = TenantId::now_v7();
    let key = resources::schedule(tenant, plant(), may_first()).key;
    h.queries
        .store()
        .put(&key, fixtures::schedule_rows(2), Duration::from_secs(3600));
    h.transport.respond_json(
        Method::Put,
        "/schedule/bulk",
        fixtures::command_response("m-4"),
    );

    let mutation = schedule_mutation(&h, tenant);
    mutation.mutate(Vec::new()).await.expect("submit");
    h.hub.deliver(fixtures::confirmation(
        "m-4",
        CommandStatus::Error,
        Some(serde_json::json!(-3)),
    ));

    match mutation.settled().await {
        MutationStatus::Rejected { detail, .. } => assert!(detail.contains("busy")),
        other => panic!("expected rejection, got {:?}", other),
    }
    let store = h.queries.store();
    assert!(store.get(&key).is_stale(store.now()));
}

#[tokio::test]
async fn failed_submit_touches_nothing() {
    let h = harness();
    let tenant = TenantId::now_v7();
    let key = resources::schedule(tenant, plant(), may_first()).key;
    h.queries
        .store()
        .put(&key, fixtures::schedule_rows(2), Duration::from_secs(3600));
    h.transport.respond(
        Method::Put,
        "/schedule/bulk",
        Err(ApiError::Status {
            status: 503,
            detail: "MQTT service unavailable".to_string(),
        }),
    );

    let mutation = schedule_mutation(&h, tenant);
    let err = mutation.mutate(Vec::new()).await.expect_err("should fail");
    assert!(err.is_retryable());
    assert_eq!(h.transport.total_calls(), 1);
    assert_eq!(h.hub.waiting_count(), 0);
    let store = h.queries.store();
    assert!(!store.get(&key).is_stale(store.now()));
}

// ============================================================================
// PROPERTIES
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Property: a regular user's scope is their own tenant, whatever they
    /// select, and resolving it never hits the network.
    #[test]
    fn prop_regular_user_always_scoped_to_own_tenant(
        own in arb_tenant_id(),
        selection in proptest::option::of(arb_tenant_selection()),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("runtime");
        let h = harness();
        let user = fixtures::user("client", false, own);
        let resolution = runtime
            .block_on(h.resolver.resolve_scope(&user, selection))
            .expect("resolve");
        prop_assert_eq!(resolution.scope.effective_tenant(), own);
        prop_assert!(resolution.warning.is_none());
        prop_assert_eq!(h.transport.total_calls(), 0);
    }

    /// Property: the order and repetition of device ids never changes the key.
    #[test]
    fn prop_device_order_never_changes_key(ids in arb_device_ids(), tenant in arb_tenant_id()) {
        let mut reversed = ids.clone();
        reversed.reverse();
        let mut canonical = ids.clone();
        canonical.sort_unstable();
        canonical.dedup();

        let key = resources::realtime_latest(tenant, &devices(&ids)).key;
        prop_assert_eq!(&key, &resources::realtime_latest(tenant, &devices(&reversed)).key);
        prop_assert_eq!(&key, &resources::realtime_latest(tenant, &devices(&canonical)).key);
    }
}
