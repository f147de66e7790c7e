//! Authorization callout client
//!
//! Every client is authorized exactly once, by POSTing its credentials to
//! the configured web service. Any 2xx response accepts the client;
//! anything else (an error status, a network failure, or the 5 second
//! timeout) rejects it. No retries, no caching.

use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use crate::error::{RelayError, Result};

/// Authorization request timeout
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Body POSTed to the authorization service
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct Credentials<'a> {
    username: &'a str,
    password: &'a str,
    remote_address: &'a str,
}

/// HTTP client for the per-connection authorization callout
#[derive(Debug, Clone)]
pub struct AuthClient {
    http: reqwest::Client,
    uri: String,
}

impl AuthClient {
    /// Create a client targeting `uri` with the 5 second request budget.
    pub fn new(uri: String) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(AUTH_TIMEOUT)
            .build()
            .map_err(|e| {
                RelayError::internal(format!("failed to build authorization client: {}", e))
            })?;
        Ok(Self { http, uri })
    }

    /// Ask the authorization service whether this client may relay.
    pub async fn authorize(&self, username: &str, password: &str, remote: &str) -> bool {
        let body = Credentials {
            username,
            password,
            remote_address: remote,
        };

        match self.http.post(&self.uri).json(&body).send().await {
            Ok(response) => {
                let allowed = response.status().is_success();
                if !allowed {
                    debug!(
                        "authorization service answered {} for {}",
                        response.status(),
                        username
                    );
                }
                allowed
            }
            Err(e) => {
                debug!("authorization callout failed for {}: {}", username, e);
                false
            }
        }
    }
}
