//! Credential provider backed by the config file.

use crate::config::AuthConfig;
use plantwatch_core::{Credential, CredentialProvider};
use std::sync::RwLock;

/// Credential read once from configuration. A bearer token wins over an API
/// key when both are configured.
#[derive(Debug)]
pub struct StaticCredentials {
    credential: RwLock<Option<Credential>>,
}

impl StaticCredentials {
    pub fn new(credential: Option<Credential>) -> Self {
        Self {
            credential: RwLock::new(credential),
        }
    }

    pub fn from_config(auth: &AuthConfig) -> Self {
        let credential = match (&auth.jwt, &auth.api_key) {
            (Some(jwt), _) => Some(Credential::Bearer(jwt.clone())),
            (None, Some(key)) => Some(Credential::ApiKey(key.clone())),
            (None, None) => None,
        };
        Self::new(credential)
    }

    /// Forget the credential (logout).
    pub fn revoke(&self) {
        let mut credential = self.credential.write().unwrap_or_else(|e| e.into_inner());
        *credential = None;
    }
}

impl CredentialProvider for StaticCredentials {
    fn current_credential(&self) -> Option<Credential> {
        self.credential
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bearer_preferred() {
        let creds = StaticCredentials::from_config(&AuthConfig {
            api_key: Some("key".to_string()),
            jwt: Some("jwt".to_string()),
        });
        assert_eq!(
            creds.current_credential(),
            Some(Credential::Bearer("jwt".to_string()))
        );
    }

    #[test]
    fn test_revoke() {
        let creds = StaticCredentials::from_config(&AuthConfig {
            api_key: Some("key".to_string()),
            jwt: None,
        });
        assert!(creds.has_valid_credential());
        creds.revoke();
        assert!(!creds.has_valid_credential());
    }
}
