//! Messages on the confirmation socket and the events derived from them.

use plantwatch_core::{CommandStatusEvent, TenantId};
use serde::Deserialize;

/// A frame pushed by the backend over the tenant socket.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushMessage {
    CommandResponse(CommandStatusEvent),
    /// Frames this client has no use for.
    #[serde(other)]
    Other,
}

/// Events emitted by the realtime manager.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Connected { tenant_id: TenantId },
    Disconnected { reason: String },
    Confirmation(CommandStatusEvent),
    Error(String),
}
