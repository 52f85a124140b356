//! PlantWatch Core - Shared Types
//!
//! Pure data structures used by every other crate: typed identifiers,
//! roles and scope contexts, backend DTOs, the error taxonomy, the REST
//! boundary traits, and the clock the cache uses for freshness bookkeeping.

mod clock;
mod entities;
mod error;
mod identity;
mod scope;
mod transport;

pub use clock::{Clock, ManualClock, SystemClock};
pub use entities::{
    CommandResponse, CommandStatus, CommandStatusEvent, DeviceInfo, ElectricityCostRow,
    HistoricalDataResponse, PlantConfigResponse, PlantSummary, PlcDataControlRow,
    PlcDataSettingRow, PlcValueUpdate, RealtimeDataPoint, RealtimeDataResponse, ScheduleRow,
    TenantCreate, TenantInfo, TenantList, TenantUpdate, TimeSeriesData, TimeSeriesPoint,
    UserList, UserPublic, UserUpdate,
};
pub use error::{ApiError, SyncError, SyncResult};
pub use identity::{CorrelationId, DeviceId, PlantId, TenantId, Timestamp, UserId};
pub use scope::{Role, ScopeContext, TenantSelection};
pub use transport::{ApiRequest, Credential, CredentialProvider, Method, Transport};
