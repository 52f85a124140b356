//! Backend request/response payloads consumed by the dashboard.
//!
//! Field names follow the backend wire format. Tables that the backend
//! serializes through upper-case column aliases keep those aliases here.

use crate::identity::{CorrelationId, DeviceId, PlantId, TenantId, UserId};
use crate::scope::Role;
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

// ============================================================================
// TENANTS & USERS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantInfo {
    pub id: TenantId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub plant_id: Option<PlantId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantList {
    pub data: Vec<TenantInfo>,
    pub count: i64,
}

impl TenantList {
    /// Find the tenant that owns a plant.
    pub fn tenant_for_plant(&self, plant_id: PlantId) -> Option<&TenantInfo> {
        self.data.iter().find(|t| t.plant_id == Some(plant_id))
    }

    pub fn contains(&self, tenant_id: TenantId) -> bool {
        self.data.iter().any(|t| t.id == tenant_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantCreate {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plant_id: Option<PlantId>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TenantUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plant_id: Option<PlantId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserPublic {
    pub id: UserId,
    pub email: String,
    pub is_active: bool,
    pub is_superuser: bool,
    #[serde(default)]
    pub full_name: Option<String>,
    pub role: String,
    pub tenant_id: TenantId,
}

impl UserPublic {
    pub fn role(&self) -> Role {
        Role::from_user_record(&self.role, self.is_superuser)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserList {
    pub data: Vec<UserPublic>,
    pub count: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_active: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<TenantId>,
}

// ============================================================================
// PLANTS & TELEMETRY
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlantSummary {
    #[serde(rename = "ID")]
    pub id: i64,
    #[serde(rename = "PLANT_ID")]
    pub plant_id: PlantId,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(rename = "TEXT_L1", default)]
    pub text_l1: Option<String>,
    #[serde(rename = "TEXT_L2", default)]
    pub text_l2: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device_id: DeviceId,
    pub name: String,
    pub class_id: i64,
    pub parent_id: i64,
    pub plant_id: PlantId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlantConfigResponse {
    pub tenant_id: String,
    pub devices: Vec<DeviceInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealtimeDataPoint {
    pub data_id: i64,
    pub plant_id: PlantId,
    pub device_id: DeviceId,
    pub name: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealtimeDataResponse {
    pub values: Vec<RealtimeDataPoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesPoint {
    pub x: i64,
    pub y: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesData {
    pub data_id: i64,
    pub name: String,
    pub data: Vec<TimeSeriesPoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricalDataResponse {
    pub series: Vec<TimeSeriesData>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElectricityCostRow {
    pub id: i64,
    pub price_date: NaiveDate,
    pub hour_of_day: i32,
    #[serde(rename = "price_UAH_per_MWh")]
    pub price_uah_per_mwh: serde_json::Value,
    #[serde(default)]
    pub received_at: Option<NaiveDateTime>,
}

// ============================================================================
// SCHEDULES & PLC VALUES
// ============================================================================

/// One row of a plant's daily charge/discharge schedule.
///
/// New rows carry a non-positive temporary id until the backend assigns one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct ScheduleRow {
    pub id: i64,
    pub rec_no: i32,
    /// `HH:MM:SS` local plant time.
    pub start_time: String,
    pub charge_from_grid: bool,
    pub allow_to_sell: bool,
    pub charge_power: f64,
    pub charge_limit: f64,
    pub discharge_power: f64,
    pub source: i32,
    #[serde(default)]
    pub updated_at: Option<NaiveDateTime>,
    #[serde(default)]
    pub updated_by: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlcDataSettingRow {
    pub id: i64,
    pub plant_id: PlantId,
    pub device_id: DeviceId,
    pub data_id: i64,
    pub data: Option<f64>,
    #[serde(default)]
    pub updated_at: Option<NaiveDateTime>,
    #[serde(default)]
    pub updated_by: Option<String>,
    #[serde(default)]
    pub device_text: Option<String>,
    #[serde(default)]
    pub data_text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlcDataControlRow {
    pub id: i64,
    pub plant_id: PlantId,
    pub control_type: i64,
    pub data_id: i64,
    pub data: Option<f64>,
    #[serde(default)]
    pub updated_at: Option<NaiveDateTime>,
    #[serde(default)]
    pub updated_by: Option<String>,
    #[serde(default)]
    pub device_text: Option<String>,
    #[serde(default)]
    pub data_text: Option<String>,
    pub input_type: String,
    #[serde(default)]
    pub textlist_entries: Option<std::collections::BTreeMap<String, String>>,
}

/// A single value change pushed to a PLC (settings or controls).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct PlcValueUpdate {
    pub id: i64,
    pub data: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_by: Option<String>,
}

// ============================================================================
// COMMANDS & CONFIRMATIONS
// ============================================================================

/// `202 Accepted` body of a write that is forwarded to the plant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub message: String,
    pub message_id: CorrelationId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Ok,
    Error,
    Timeout,
}

/// Push notification reporting what a plant did with a forwarded command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandStatusEvent {
    pub command_type: String,
    pub message_id: CorrelationId,
    pub status: CommandStatus,
    /// Device error: either a string or a numeric device code.
    #[serde(default)]
    pub error: Option<serde_json::Value>,
}

impl CommandStatusEvent {
    /// Human-readable device error, with the known device codes spelled out.
    pub fn error_detail(&self) -> Option<String> {
        let error = self.error.as_ref()?;
        let detail = match error {
            serde_json::Value::Number(code) => match code.as_i64() {
                Some(-1) => format!("{} (general error or command not recognized)", code),
                Some(-2) => format!("{} (invalid format or parameters)", code),
                Some(-3) => format!("{} (device busy or unable to process)", code),
                _ => code.to_string(),
            },
            serde_json::Value::String(text) => text.clone(),
            serde_json::Value::Null => return None,
            other => other.to_string(),
        };
        Some(detail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_tenant_list_plant_lookup() {
        let t9 = TenantId::new(Uuid::from_u128(9));
        let list = TenantList {
            data: vec![
                TenantInfo {
                    id: TenantId::new(Uuid::from_u128(1)),
                    name: "North".to_string(),
                    description: None,
                    plant_id: None,
                },
                TenantInfo {
                    id: t9,
                    name: "South".to_string(),
                    description: None,
                    plant_id: Some(PlantId::new(2500)),
                },
            ],
            count: 2,
        };
        assert_eq!(
            list.tenant_for_plant(PlantId::new(2500)).map(|t| t.id),
            Some(t9)
        );
        assert!(list.tenant_for_plant(PlantId::new(9999)).is_none());
        assert!(list.contains(t9));
    }

    #[test]
    fn test_schedule_row_uses_column_aliases() {
        let json = serde_json::json!({
            "ID": 7,
            "REC_NO": 1,
            "START_TIME": "06:00:00",
            "CHARGE_FROM_GRID": true,
            "ALLOW_TO_SELL": false,
            "CHARGE_POWER": 50.0,
            "CHARGE_LIMIT": 90.0,
            "DISCHARGE_POWER": 0.0,
            "SOURCE": 1,
            "UPDATED_AT": "2024-05-01T05:59:00",
            "UPDATED_BY": "ops@example.com"
        });
        let row: ScheduleRow = serde_json::from_value(json).expect("deserialize");
        assert_eq!(row.id, 7);
        assert_eq!(row.start_time, "06:00:00");
        assert!(row.updated_at.is_some());
    }

    #[test]
    fn test_command_status_event_error_codes() {
        let event: CommandStatusEvent = serde_json::from_value(serde_json::json!({
            "type": "command_response",
            "command_type": "schedule",
            "message_id": "m-1",
            "status": "error",
            "error": -3
        }))
        .expect("deserialize");
        assert_eq!(event.status, CommandStatus::Error);
        let detail = event.error_detail().expect("detail");
        assert!(detail.contains("device busy"));
    }

    #[test]
    fn test_user_role_from_record() {
        let user = UserPublic {
            id: UserId::now_v7(),
            email: "a@b.c".to_string(),
            is_active: true,
            is_superuser: false,
            full_name: None,
            role: "manager".to_string(),
            tenant_id: TenantId::now_v7(),
        };
        assert_eq!(user.role(), Role::Manager);
    }
}
