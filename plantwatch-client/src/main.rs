//! PlantWatch headless monitor entry point.

use plantwatch_cache::CacheStore;
use plantwatch_client::api_client::{RestClient, WsClient};
use plantwatch_client::config::ClientConfig;
use plantwatch_client::confirmation::{spawn_confirmation_router, ConfirmationHub};
use plantwatch_client::credentials::StaticCredentials;
use plantwatch_client::error::ClientError;
use plantwatch_client::identity::{IdentityResolver, ScopeState};
use plantwatch_client::persistence;
use plantwatch_client::poller::{spawn_cache_sweep, Poller};
use plantwatch_client::query::{QueryClient, QueryHandle, QueryOptions, QueryState};
use plantwatch_client::realtime::spawn_ws_manager;
use plantwatch_client::resources;
use plantwatch_client::telemetry;
use plantwatch_core::{PlantId, RealtimeDataResponse, SystemClock, TenantId, TenantSelection};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<(), ClientError> {
    let config = ClientConfig::load()?;
    telemetry::init_tracing(config.log_format)?;

    let credentials = Arc::new(StaticCredentials::from_config(&config.auth));
    let rest = RestClient::new(&config, credentials.clone())?;
    let store = Arc::new(CacheStore::new(config.cache_config(), Arc::new(SystemClock)));
    let sweeper = spawn_cache_sweep(store.clone(), config.gc_window());
    let queries = QueryClient::new(store, Arc::new(rest));
    let resolver = IdentityResolver::new(queries.clone(), credentials.clone());
    let scope = ScopeState::new(queries.clone());

    let selection = match selection_from_args()? {
        Some(selection) => Some(selection),
        None => persistence::load(&config.persistence_path)
            .unwrap_or_else(|err| {
                tracing::warn!(error = %err, "Ignoring unreadable state file");
                None
            })
            .and_then(|state| state.selection),
    };

    let session = resolver.load_session().await?;
    let resolution = scope.select_tenant(&resolver, &session, selection).await?;
    if let Some(warning) = &resolution.warning {
        tracing::warn!(warning = %warning, "Tenant selection not honoured");
    }
    let tenant = resolution.scope.effective_tenant();
    tracing::info!(
        user = %session.email,
        role = ?resolution.scope.role,
        tenant_id = %tenant,
        "Session ready"
    );

    let hub = Arc::new(ConfirmationHub::new(config.confirmation_timeout()));
    let (event_tx, event_rx) = mpsc::channel(256);
    let ws_task = spawn_ws_manager(WsClient::new(&config, credentials.clone()), tenant, event_tx);
    let router = spawn_confirmation_router(hub, event_rx);

    let devices = config.telemetry_devices();
    let query = resources::realtime_latest(tenant, &devices);
    let poller = Poller::new(queries.clone(), config.poll_interval());
    let mut handle: QueryHandle<RealtimeDataResponse> =
        queries.use_result(query.clone(), QueryOptions::new());
    let _poll = poller.schedule_while_subscribed(query, poller.telemetry_interval());

    loop {
        tokio::select! {
            changed = handle.changed() => {
                if !changed {
                    break;
                }
                log_telemetry(&handle.state());
            }
            result = tokio::signal::ctrl_c() => {
                result?;
                tracing::info!("Shutting down");
                break;
            }
        }
    }

    ws_task.abort();
    router.abort();
    sweeper.abort();
    if let Err(err) = persistence::save(&config.persistence_path, &scope.persisted_state()) {
        tracing::warn!(error = %err, "Failed to persist tenant selection");
    }
    Ok(())
}

fn log_telemetry(state: &QueryState<RealtimeDataResponse>) {
    if let Some(err) = &state.error {
        tracing::warn!(error = %err, "Telemetry refresh failed");
    }
    let Some(data) = &state.data else {
        return;
    };
    for point in &data.values {
        tracing::info!(
            device_id = %point.device_id,
            data_id = point.data_id,
            name = %point.name,
            value = %point.value,
            timestamp = point.timestamp,
            "Telemetry"
        );
    }
}

fn selection_from_args() -> Result<Option<TenantSelection>, ClientError> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--plant" => {
                let value = args.next().unwrap_or_default();
                let id = value.parse::<i64>().map_err(|e| ClientError::InvalidArgument {
                    arg: "--plant",
                    reason: e.to_string(),
                })?;
                return Ok(Some(TenantSelection::Plant(PlantId::new(id))));
            }
            "--tenant" => {
                let value = args.next().unwrap_or_default();
                let id = Uuid::parse_str(&value).map_err(|e| ClientError::InvalidArgument {
                    arg: "--tenant",
                    reason: e.to_string(),
                })?;
                return Ok(Some(TenantSelection::Tenant(TenantId::new(id))));
            }
            _ => {}
        }
    }
    Ok(None)
}
