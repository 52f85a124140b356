//! Query and mutation builders for the backend's resources.
//!
//! Every builder derives the cache key and the request from the same
//! arguments, so a view and a mutation that name the same data always agree
//! on the key.

use crate::mutation::MutationRequest;
use crate::query::{Query, Ttl};
use chrono::NaiveDate;
use plantwatch_cache::{CacheKey, KeyFilter};
use plantwatch_core::{
    ApiRequest, DeviceId, Method, PlantId, PlcValueUpdate, ScheduleRow, SyncResult, TenantCreate, TenantId,
    TenantUpdate, Timestamp, UserId, UserUpdate,
};

pub mod kinds {
    pub const ME: &str = "me";
    pub const USERS: &str = "users";
    pub const USER: &str = "user";
    pub const TENANTS: &str = "tenants";
    pub const TENANT: &str = "tenant";
    pub const PLANTS: &str = "plants";
    pub const PLANT_CONFIG: &str = "plant_config";
    pub const REALTIME: &str = "realtime";
    pub const HISTORICAL: &str = "historical";
    pub const ELECTRICITY_COST: &str = "electricity_cost";
    pub const SCHEDULE: &str = "schedule";
    pub const PLC_DATA_SETTINGS: &str = "plc_data_settings";
    pub const PLC_DATA_CONTROL: &str = "plc_data_control";
}

fn ids(device_ids: &[DeviceId]) -> Vec<i64> {
    device_ids.iter().map(DeviceId::get).collect()
}

// ============================================================================
// USERS & TENANTS
// ============================================================================

pub fn me() -> Query {
    Query::request(CacheKey::global(kinds::ME), ApiRequest::get("/users/me"))
}

pub fn users(skip: i64, limit: i64) -> Query {
    Query::request(
        CacheKey::global(kinds::USERS)
            .param("skip", skip)
            .param("limit", limit),
        ApiRequest::get("/users/")
            .query("skip", skip)
            .query("limit", limit),
    )
}

pub fn user(id: UserId) -> Query {
    Query::request(
        CacheKey::global(kinds::USER).param("id", id),
        ApiRequest::get(format!("/users/{}", id)),
    )
}

/// Tenant listing. Also backs plant-to-tenant resolution.
pub fn tenants(skip: i64, limit: i64) -> Query {
    Query::request(
        CacheKey::global(kinds::TENANTS)
            .param("skip", skip)
            .param("limit", limit),
        ApiRequest::get("/tenants/")
            .query("skip", skip)
            .query("limit", limit),
    )
}

fn tenant_key(id: TenantId) -> CacheKey {
    CacheKey::global(kinds::TENANT).param("id", id.to_string())
}

pub fn tenant(id: TenantId) -> Query {
    Query::request(tenant_key(id), ApiRequest::get(format!("/tenants/{}", id)))
}

// ============================================================================
// PLANTS & TELEMETRY
// ============================================================================

pub fn plants() -> Query {
    Query::request(CacheKey::global(kinds::PLANTS), ApiRequest::get("/plants/"))
}

pub fn plant_config(tenant: TenantId, device_ids: &[DeviceId]) -> Query {
    Query::request(
        CacheKey::new(kinds::PLANT_CONFIG, tenant).param_list("device_ids", ids(device_ids)),
        ApiRequest::get("/plant-config")
            .query("tenant_id", tenant)
            .query_list("device_ids", ids(device_ids)),
    )
}

/// Latest live values. Uses the short telemetry freshness window.
pub fn realtime_latest(tenant: TenantId, device_ids: &[DeviceId]) -> Query {
    Query::request(
        CacheKey::new(kinds::REALTIME, tenant).param_list("device_ids", ids(device_ids)),
        ApiRequest::get("/realtime-data/latest")
            .query("tenant_id", tenant)
            .query_list("device_ids", ids(device_ids)),
    )
    .with_ttl(Ttl::Telemetry)
}

pub fn historical_details(
    tenant: TenantId,
    data_ids: &[i64],
    start: Timestamp,
    end: Timestamp,
) -> Query {
    let start = start.to_rfc3339();
    let end = end.to_rfc3339();
    Query::request(
        CacheKey::new(kinds::HISTORICAL, tenant)
            .param_list("data_ids", data_ids.iter().copied())
            .param("start", start.as_str())
            .param("end", end.as_str()),
        ApiRequest::get("/historical-data/details")
            .query("tenant_id", tenant)
            .query_list("data_ids", data_ids.iter().copied())
            .query("start", &start)
            .query("end", &end),
    )
}

pub fn electricity_cost(tenant: TenantId, date: NaiveDate) -> Query {
    Query::request(
        CacheKey::new(kinds::ELECTRICITY_COST, tenant).param("date", date),
        ApiRequest::get("/electricity-cost/")
            .query("tenant_id", tenant)
            .query("date", date),
    )
}

fn schedule_key(tenant: TenantId, date: NaiveDate) -> CacheKey {
    CacheKey::new(kinds::SCHEDULE, tenant).param("date", date)
}

/// The schedule routes address a plant's rows by `plant_id`, plus the
/// tenant the rows live under (`tenant_db`). The key stays tenant-scoped.
fn schedule_request(request: ApiRequest, tenant: TenantId, plant: PlantId, date: NaiveDate) -> ApiRequest {
    request
        .query("plant_id", plant)
        .query("tenant_db", tenant)
        .query("date", date)
}

pub fn schedule(tenant: TenantId, plant: PlantId, date: NaiveDate) -> Query {
    Query::request(
        schedule_key(tenant, date),
        schedule_request(ApiRequest::get("/schedule/"), tenant, plant, date),
    )
}

pub fn plc_data_settings(tenant: TenantId, device_ids: &[DeviceId]) -> Query {
    Query::request(
        CacheKey::new(kinds::PLC_DATA_SETTINGS, tenant).param_list("device_ids", ids(device_ids)),
        ApiRequest::get("/settings/plc-data-settings")
            .query("tenant_id", tenant)
            .query_list("device_ids", ids(device_ids)),
    )
}

pub fn plc_data_control(tenant: TenantId, control_types: &[i64]) -> Query {
    Query::request(
        CacheKey::new(kinds::PLC_DATA_CONTROL, tenant)
            .param_list("control_types", control_types.iter().copied()),
        ApiRequest::get("/control/plc-data-control")
            .query("tenant_id", tenant)
            .query_list("control_types", control_types.iter().copied()),
    )
}

// ============================================================================
// WRITES
// ============================================================================

/// Replace a day's schedule. The backend either answers with the saved rows
/// or with a `CommandResponse` to be confirmed by the plant.
pub fn bulk_schedule(
    tenant: TenantId,
    plant: PlantId,
    date: NaiveDate,
    rows: &[ScheduleRow],
) -> SyncResult<MutationRequest> {
    let request = schedule_request(ApiRequest::new(Method::Put, "/schedule/bulk"), tenant, plant, date)
        .json(rows)?;
    Ok(MutationRequest::new(request).target(KeyFilter::exact(schedule_key(tenant, date))))
}

/// Write PLC settings. Every settings view of the tenant is affected.
pub fn update_plc_settings(
    tenant: TenantId,
    updates: &[PlcValueUpdate],
) -> SyncResult<MutationRequest> {
    let request = ApiRequest::new(Method::Put, "/settings/plc-data-settings")
        .query("tenant_id", tenant)
        .json(updates)?;
    Ok(MutationRequest::new(request)
        .target(KeyFilter::kind(kinds::PLC_DATA_SETTINGS).in_tenant(tenant)))
}

pub fn update_plc_controls(
    tenant: TenantId,
    updates: &[PlcValueUpdate],
) -> SyncResult<MutationRequest> {
    let request = ApiRequest::new(Method::Put, "/control/plc-data-control")
        .query("tenant_id", tenant)
        .json(updates)?;
    Ok(MutationRequest::new(request)
        .target(KeyFilter::kind(kinds::PLC_DATA_CONTROL).in_tenant(tenant)))
}

pub fn create_tenant(tenant: &TenantCreate) -> SyncResult<MutationRequest> {
    let request = ApiRequest::new(Method::Post, "/tenants/").json(tenant)?;
    Ok(MutationRequest::new(request).target(KeyFilter::kind(kinds::TENANTS)))
}

pub fn update_tenant(id: TenantId, update: &TenantUpdate) -> SyncResult<MutationRequest> {
    let request = ApiRequest::new(Method::Put, format!("/tenants/{}", id)).json(update)?;
    Ok(MutationRequest::new(request)
        .target(KeyFilter::kind(kinds::TENANTS))
        .detail(tenant_key(id)))
}

pub fn delete_tenant(id: TenantId) -> SyncResult<MutationRequest> {
    let request = ApiRequest::new(Method::Delete, format!("/tenants/{}", id));
    Ok(MutationRequest::new(request)
        .target(KeyFilter::kind(kinds::TENANTS))
        .target(KeyFilter::exact(tenant_key(id))))
}

/// Update a user. Every page of the user list is affected.
pub fn update_user(id: UserId, update: &UserUpdate) -> SyncResult<MutationRequest> {
    let request = ApiRequest::new(Method::Patch, format!("/users/{}", id)).json(update)?;
    Ok(MutationRequest::new(request)
        .target(KeyFilter::kind(kinds::USERS))
        .detail(CacheKey::global(kinds::USER).param("id", id)))
}

pub fn delete_user(id: UserId) -> SyncResult<MutationRequest> {
    let request = ApiRequest::new(Method::Delete, format!("/users/{}", id));
    Ok(MutationRequest::new(request)
        .target(KeyFilter::kind(kinds::USERS))
        .target(KeyFilter::exact(
            CacheKey::global(kinds::USER).param("id", id),
        )))
}
