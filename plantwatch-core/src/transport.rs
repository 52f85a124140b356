//! The REST boundary and credential seam.
//!
//! The sync layer never talks HTTP directly; it hands an [`ApiRequest`] to a
//! [`Transport`] and gets back the JSON body or an [`ApiError`].

use crate::error::ApiError;
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One backend call: method, path below the API prefix, query pairs, and an
/// optional JSON body.
///
/// List parameters are sent as repeated pairs (`device_ids=2&device_ids=4`).
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    pub fn query(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((name.into(), value.to_string()));
        self
    }

    pub fn query_list<I, V>(mut self, name: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: ToString,
    {
        for value in values {
            self.query.push((name.to_string(), value.to_string()));
        }
        self
    }

    pub fn json<B: Serialize + ?Sized>(mut self, body: &B) -> Result<Self, ApiError> {
        let body = serde_json::to_value(body).map_err(|e| ApiError::InvalidBody {
            reason: e.to_string(),
        })?;
        self.body = Some(body);
        Ok(self)
    }
}

impl fmt::Display for ApiRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.path)
    }
}

/// Request/response boundary to the backend.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Execute the request. A 2xx body is returned as JSON (`null` for an
    /// empty body); anything else is an [`ApiError`].
    async fn send(&self, request: ApiRequest) -> Result<serde_json::Value, ApiError>;
}

/// A credential accepted by the backend.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    ApiKey(String),
    Bearer(String),
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ApiKey(_) => f.write_str("ApiKey(***)"),
            Self::Bearer(_) => f.write_str("Bearer(***)"),
        }
    }
}

/// Source of the caller's credential. Token issuance lives elsewhere.
pub trait CredentialProvider: Send + Sync {
    fn current_credential(&self) -> Option<Credential>;

    fn has_valid_credential(&self) -> bool {
        self.current_credential().is_some()
    }
}
