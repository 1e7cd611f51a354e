//! The service request handed to a worker by its runner.

use serde::{Deserialize, Serialize};
use url::Url;

/// User id the runner assigns to shell-initiated connections.
pub const ROOT_USER_ID: u32 = 0;

/// Identity and start arguments of the application a worker must run.
///
/// Delivered exactly once per worker, inside the runner's `start_app`
/// message. Fields are private; the runner side builds requests through
/// [`ServiceRequest::new`] and the worker reads them through accessors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRequest {
    url: Url,
    #[serde(default)]
    qualifier: String,
    #[serde(default)]
    user_id: u32,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    payload: serde_json::Value,
}

impl ServiceRequest {
    /// A request for `url` owned by the root user, with no qualifier or payload.
    #[must_use]
    pub fn new(url: Url) -> Self {
        Self {
            url,
            qualifier: String::new(),
            user_id: ROOT_USER_ID,
            payload: serde_json::Value::Null,
        }
    }

    #[must_use]
    pub fn with_qualifier(mut self, qualifier: impl Into<String>) -> Self {
        self.qualifier = qualifier.into();
        self
    }

    #[must_use]
    pub fn with_user_id(mut self, user_id: u32) -> Self {
        self.user_id = user_id;
        self
    }

    #[must_use]
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Disambiguates multiple instances of the same application.
    #[must_use]
    pub fn qualifier(&self) -> &str {
        &self.qualifier
    }

    #[must_use]
    pub fn user_id(&self) -> u32 {
        self.user_id
    }

    /// Application-specific start arguments. `Null` when the runner sent none.
    #[must_use]
    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }
}
