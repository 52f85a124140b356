//! User-facing notifications for sync outcomes.

use chrono::{DateTime, Utc};
use plantwatch_core::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationLevel {
    Info,
    Warning,
    Error,
    Success,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationAction {
    Retry,
    /// Reload the affected data to see whether a change took effect.
    Refresh,
    SignIn,
    Dismiss,
}

#[derive(Debug, Clone)]
pub struct Notification {
    pub level: NotificationLevel,
    pub message: String,
    pub action: Option<NotificationAction>,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(level: NotificationLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            action: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_action(mut self, action: NotificationAction) -> Self {
        self.action = Some(action);
        self
    }

    pub fn from_error(err: &SyncError) -> Self {
        match err {
            SyncError::AuthRequired => {
                Self::new(NotificationLevel::Error, err.to_string()).with_action(NotificationAction::SignIn)
            }
            SyncError::ScopeUnresolved { .. } => {
                Self::new(NotificationLevel::Warning, err.to_string()).with_action(NotificationAction::Dismiss)
            }
            SyncError::ConfirmationTimeout { .. } => {
                Self::new(NotificationLevel::Warning, err.to_string()).with_action(NotificationAction::Refresh)
            }
            SyncError::TransientFetch { .. } => {
                Self::new(NotificationLevel::Error, err.to_string()).with_action(NotificationAction::Retry)
            }
            SyncError::Validation { .. } | SyncError::Decode { .. } => {
                Self::new(NotificationLevel::Error, err.to_string())
            }
        }
    }
}
