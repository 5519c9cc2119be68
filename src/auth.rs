//! Account authentication against the Wattline cloud API

use serde::Deserialize;
use url::Url;

use crate::{Error, Result};

/// Response payload from the authenticate endpoint
#[derive(Debug, Deserialize)]
pub struct AuthResponse {
    /// Bearer token for subsequent API and stream requests
    pub access_token: String,

    /// Numeric account identifier
    pub user_id: u64,

    /// Monitors attached to the account
    #[serde(default)]
    pub monitors: Vec<MonitorRef>,
}

/// Monitor reference in the authenticate response
#[derive(Debug, Deserialize)]
pub struct MonitorRef {
    /// Numeric monitor identifier
    pub id: u64,
}

/// Authenticated session used by every other cloud interaction
#[derive(Debug, Clone)]
pub struct AuthSession {
    /// Bearer token
    pub token: String,

    /// Account identifier, rendered for URL building
    pub user_id: String,

    /// First monitor on the account
    pub monitor_id: String,
}

impl AuthSession {
    /// Build a session from an authenticate response
    ///
    /// # Errors
    ///
    /// Returns `Error::Auth` when the account has no monitors.
    pub fn from_response(response: &AuthResponse) -> Result<Self> {
        let monitor = response
            .monitors
            .first()
            .ok_or_else(|| Error::Auth("account has no monitors".to_string()))?;

        Ok(Self {
            token: response.access_token.clone(),
            user_id: response.user_id.to_string(),
            monitor_id: monitor.id.to_string(),
        })
    }
}

/// Exchange account credentials for a bearer token and monitor list
///
/// # Errors
///
/// Returns `Error::Auth` on any failure; bad credentials are never retried.
pub async fn authenticate(
    client: &reqwest::Client,
    api_base: &Url,
    email: &str,
    password: &str,
) -> Result<AuthSession> {
    let response = client
        .post(format!("{api_base}/authenticate"))
        .form(&[("email", email), ("password", password)])
        .send()
        .await
        .map_err(|e| Error::Auth(format!("authenticate request failed: {e}")))?
        .error_for_status()
        .map_err(|e| Error::Auth(format!("authenticate rejected: {e}")))?
        .json::<AuthResponse>()
        .await
        .map_err(|e| Error::Auth(format!("authenticate response malformed: {e}")))?;

    tracing::debug!(
        user_id = response.user_id,
        monitors = response.monitors.len(),
        "credentials accepted"
    );

    AuthSession::from_response(&response)
}
