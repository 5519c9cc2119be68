//! Wattline cloud REST client
//!
//! Covers the monitor-scoped endpoints: device descriptors, monitor status,
//! the device inventory, and the account timeline. Descriptor lookups honor
//! the server's Retry-After on 429 and give up after a bounded number of
//! attempts rather than hammering a throttled API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue, RETRY_AFTER, USER_AGENT};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use url::Url;

use crate::auth::AuthSession;
use crate::config::ApiConfig;
use crate::events::TimelineItem;
use crate::{Error, Result};

/// Name used when a device descriptor has none
pub const UNKNOWN_NAME: &str = "Unknown";

/// Device id the API uses for the aggregate always-on load
pub const ALWAYS_ON_ID: &str = "always_on";

/// 429 responses tolerated for one lookup before giving up
pub const MAX_RATE_LIMIT_RETRIES: u32 = 5;

/// Wait applied when a 429 carries no usable Retry-After header
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(1);

/// Protocol revision expected by the cloud API
const PROTOCOL_VERSION: &str = "3";

/// Headers sent on every authenticated API and stream request
///
/// # Errors
///
/// Returns `Error::Auth` when the token contains bytes that cannot appear in
/// a header value.
pub fn auth_headers(token: &str) -> Result<HeaderMap> {
    let bearer = HeaderValue::from_str(&format!("bearer {token}"))
        .map_err(|e| Error::Auth(format!("token is not header-safe: {e}")))?;

    let mut headers = HeaderMap::new();
    headers.insert(AUTHORIZATION, bearer);
    headers.insert(
        "Wattline-Client-Version",
        HeaderValue::from_static(env!("CARGO_PKG_VERSION")),
    );
    headers.insert(
        "X-Wattline-Protocol",
        HeaderValue::from_static(PROTOCOL_VERSION),
    );
    headers.insert(
        USER_AGENT,
        HeaderValue::from_static(concat!("wattline-collector/", env!("CARGO_PKG_VERSION"))),
    );
    Ok(headers)
}

/// Source of device descriptors for the enrichment workers
#[async_trait]
pub trait DescriptorFetch: Send + Sync {
    /// Fetch the descriptor for one device
    ///
    /// # Errors
    ///
    /// Returns an error when the lookup fails or stays rate limited past the
    /// retry budget.
    async fn fetch_descriptor(&self, entity_id: &str) -> Result<Descriptor>;
}

/// Authenticated client for the monitor-scoped REST endpoints
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: reqwest::Client,
    api_base: Url,
    user_id: String,
    monitor_id: String,
}

impl ApiClient {
    /// Build a client that sends the session's bearer token on every request
    ///
    /// # Errors
    ///
    /// Returns an error when the token cannot form a header or the HTTP
    /// client cannot be built.
    pub fn new(config: &ApiConfig, session: &AuthSession) -> Result<Self> {
        let client = reqwest::Client::builder()
            .default_headers(auth_headers(&session.token)?)
            .build()?;

        Ok(Self {
            client,
            api_base: config.api_base.clone(),
            user_id: session.user_id.clone(),
            monitor_id: session.monitor_id.clone(),
        })
    }

    /// Current monitor status
    ///
    /// # Errors
    ///
    /// Returns an error when the request fails or the body does not decode.
    pub async fn monitor_status(&self) -> Result<MonitorStatus> {
        self.get_json(format!(
            "{}/app/monitors/{}/status",
            self.api_base, self.monitor_id
        ))
        .await
    }

    /// Every device known to the monitor
    ///
    /// # Errors
    ///
    /// Returns an error when the request fails or the body is not the
    /// expected device array.
    pub async fn devices(&self) -> Result<Vec<InventoryDevice>> {
        self.get_json(format!(
            "{}/app/monitors/{}/devices",
            self.api_base, self.monitor_id
        ))
        .await
    }

    /// Recent account timeline
    ///
    /// # Errors
    ///
    /// Returns an error when the request fails or the body does not decode.
    pub async fn timeline(&self) -> Result<TimelineResponse> {
        self.get_json(format!(
            "{}/users/{}/timeline",
            self.api_base, self.user_id
        ))
        .await
    }

    async fn get_json<T: DeserializeOwned>(&self, url: String) -> Result<T> {
        Ok(self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json::<T>()
            .await?)
    }
}

#[async_trait]
impl DescriptorFetch for ApiClient {
    async fn fetch_descriptor(&self, entity_id: &str) -> Result<Descriptor> {
        let url = format!(
            "{}/app/monitors/{}/devices/{}",
            self.api_base, self.monitor_id, entity_id
        );

        for attempt in 1..=MAX_RATE_LIMIT_RETRIES {
            let response = self.client.get(&url).send().await?;
            if response.status() != StatusCode::TOO_MANY_REQUESTS {
                return Ok(response.error_for_status()?.json::<Descriptor>().await?);
            }

            let delay = retry_after_delay(response.headers());
            tracing::warn!(
                entity_id,
                attempt,
                delay_secs = delay.as_secs(),
                "lookup rate limited, honoring server delay"
            );
            if attempt < MAX_RATE_LIMIT_RETRIES {
                tokio::time::sleep(delay).await;
            }
        }

        Err(Error::RateLimited(entity_id.to_string()))
    }
}

/// Delay demanded by a 429, with a fallback when the header is absent or odd
#[must_use]
pub fn retry_after_delay(headers: &HeaderMap) -> Duration {
    headers
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok())
        .map_or(DEFAULT_RETRY_AFTER, Duration::from_secs)
}

/// Full device descriptor from the lookup endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct Descriptor {
    /// Core identity block
    #[serde(default)]
    pub device: DeviceInfo,

    /// Usage statistics; keys vary by device class
    #[serde(default)]
    pub usage: serde_json::Map<String, Value>,

    /// Aggregate breakdown, populated only for the synthetic always-on device
    #[serde(default)]
    pub always_on: AlwaysOnBlock,

    /// Free-form vendor notes
    #[serde(default)]
    pub info: Option<Value>,
}

impl Descriptor {
    /// Whether this is the synthetic aggregate rather than a real device
    #[must_use]
    pub fn is_always_on(&self) -> bool {
        self.device.id.as_deref() == Some(ALWAYS_ON_ID)
    }
}

/// Identity block inside a descriptor
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeviceInfo {
    pub id: Option<String>,
    pub name: Option<String>,
    pub icon: Option<String>,
    pub monitor_id: Option<u64>,

    /// Last observed state; shape varies by device class
    pub last_state: Option<Value>,

    /// ISO-8601 time of the last state change
    pub last_state_time: Option<String>,
}

impl DeviceInfo {
    /// Display name with the API's placeholder fallback
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(UNKNOWN_NAME)
    }
}

/// Sub-device list under the synthetic always-on device
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AlwaysOnBlock {
    #[serde(default)]
    pub devices: Vec<AlwaysOnDevice>,
}

/// One constituent of the always-on load
#[derive(Debug, Clone, Deserialize)]
pub struct AlwaysOnDevice {
    pub id: Option<String>,

    /// Attributed share in watts
    pub w: Option<f64>,
}

/// Monitor status snapshot
#[derive(Debug, Default, Deserialize)]
pub struct MonitorStatus {
    #[serde(default)]
    pub signals: StatusSignals,

    #[serde(default)]
    pub monitor_info: MonitorInfo,

    #[serde(default)]
    pub device_detection: DeviceDetection,
}

/// Detection progress signals
#[derive(Debug, Default, Deserialize)]
pub struct StatusSignals {
    pub progress: Option<f64>,
    pub status: Option<String>,
}

/// Network and firmware details in a status snapshot
#[derive(Debug, Default, Deserialize)]
pub struct MonitorInfo {
    pub ethernet: Option<bool>,
    pub online: Option<bool>,
    pub ip_address: Option<String>,
    pub version: Option<String>,
    pub ssid: Option<String>,
    pub ndt_enabled: Option<bool>,
    pub mac: Option<String>,
    pub wifi_strength: Option<f64>,
}

/// Devices the monitor is currently learning
#[derive(Debug, Default, Deserialize)]
pub struct DeviceDetection {
    #[serde(default)]
    pub in_progress: Vec<DetectedDevice>,

    #[serde(default)]
    pub found: Vec<DetectedDevice>,
}

/// One in-detection device
#[derive(Debug, Deserialize)]
pub struct DetectedDevice {
    pub name: Option<String>,
    pub icon: Option<String>,
    pub progress: Option<f64>,
}

/// One inventory entry from the devices endpoint
#[derive(Debug, Deserialize)]
pub struct InventoryDevice {
    pub id: Option<String>,
    pub name: Option<String>,
}

/// Body of the timeline endpoint
#[derive(Debug, Default, Deserialize)]
pub struct TimelineResponse {
    #[serde(default)]
    pub items: Vec<TimelineItem>,
}
