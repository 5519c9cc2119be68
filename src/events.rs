//! Realtime stream event decoding
//!
//! Frames arrive as `{"type": "<kind>", "payload": {...}}`. Decoding is
//! two-stage: the envelope first, then the payload against the kind's own
//! shape. A frame that fails either stage is dropped by the dispatcher, never
//! the connection.

use serde::Deserialize;
use serde_json::Value;

/// One decoded stream frame
#[derive(Debug)]
pub enum StreamEvent {
    /// Mains power sample, arriving about twice a second
    RealtimeUpdate(RealtimeUpdate),

    /// Timeline entries added since the last frame
    NewTimelineEvent(NewTimelineEvent),

    /// Session greeting sent right after connect
    Hello(HelloPayload),

    /// Account or device metadata changed upstream
    DataChange(DataChangePayload),

    /// Device on/off transitions
    DeviceStates(DeviceStatesPayload),

    /// Diagnostic frame, logged and not persisted
    MonitorInfo(Value),

    /// Diagnostic frame, logged and not persisted
    MonitorConnection(Value),

    /// Diagnostic frame, logged and not persisted
    DeviceReactivated(Value),

    /// Diagnostic frame, logged and not persisted
    DeviceDeactivated(Value),

    /// Kind this collector does not know
    Unknown {
        /// Wire kind string
        kind: String,
        /// Raw payload for the log
        payload: Value,
    },
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
}

impl StreamEvent {
    /// Decode one frame
    ///
    /// # Errors
    ///
    /// Returns the underlying serde error when the envelope is not JSON or a
    /// known kind's payload does not match its shape.
    pub fn parse(frame: &str) -> serde_json::Result<Self> {
        let envelope: Envelope = serde_json::from_str(frame)?;
        Ok(match envelope.kind.as_str() {
            "realtime_update" => Self::RealtimeUpdate(serde_json::from_value(envelope.payload)?),
            "new_timeline_event" => {
                Self::NewTimelineEvent(serde_json::from_value(envelope.payload)?)
            }
            "hello" => Self::Hello(serde_json::from_value(envelope.payload)?),
            "data_change" => Self::DataChange(serde_json::from_value(envelope.payload)?),
            "device_states" => Self::DeviceStates(serde_json::from_value(envelope.payload)?),
            "monitor_info" => Self::MonitorInfo(envelope.payload),
            "monitor_connection" => Self::MonitorConnection(envelope.payload),
            "device_reactivated" => Self::DeviceReactivated(envelope.payload),
            "device_deactivated" => Self::DeviceDeactivated(envelope.payload),
            _ => Self::Unknown {
                kind: envelope.kind,
                payload: envelope.payload,
            },
        })
    }
}

/// Payload of a `realtime_update` frame
#[derive(Debug, Deserialize)]
pub struct RealtimeUpdate {
    /// Line frequency in Hz
    pub hz: Option<f64>,

    /// Total current in amps
    pub c: Option<f64>,

    /// Total power in watts
    pub w: Option<f64>,

    /// Sample time in epoch seconds
    pub epoch: Option<f64>,

    /// Per-leg voltage
    #[serde(default)]
    pub voltage: Vec<f64>,

    /// Per-leg power
    #[serde(default)]
    pub channels: Vec<f64>,

    /// Per-device breakdown with inline names
    #[serde(default)]
    pub devices: Vec<RealtimeDevice>,
}

impl RealtimeUpdate {
    /// Names of required fields absent from this sample
    #[must_use]
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.hz.is_none() {
            missing.push("hz");
        }
        if self.c.is_none() {
            missing.push("c");
        }
        if self.w.is_none() {
            missing.push("w");
        }
        if self.epoch.is_none() {
            missing.push("epoch");
        }
        missing
    }
}

/// Per-device sample inside a realtime update
#[derive(Debug, Deserialize)]
pub struct RealtimeDevice {
    pub id: Option<String>,
    pub name: Option<String>,
    pub icon: Option<String>,

    /// Present draw in watts
    pub w: Option<f64>,

    /// Always-on share in watts
    pub ao_w: Option<f64>,

    /// Always-on state marker
    pub ao_st: Option<Value>,

    /// Metering plug readings, absent for detected devices
    pub sd: Option<PlugReading>,
}

impl RealtimeDevice {
    /// Whether this entry comes from a metering plug rather than detection
    #[must_use]
    pub fn is_plug(&self) -> bool {
        self.sd.as_ref().is_some_and(PlugReading::has_reading)
    }
}

/// Inline metering plug measurements
#[derive(Debug, Deserialize)]
pub struct PlugReading {
    pub w: Option<f64>,
    pub i: Option<f64>,
    pub v: Option<f64>,
    pub e: Option<f64>,
}

impl PlugReading {
    fn has_reading(&self) -> bool {
        self.w.is_some() || self.i.is_some() || self.v.is_some() || self.e.is_some()
    }
}

/// Payload of a `new_timeline_event` frame
#[derive(Debug, Deserialize)]
pub struct NewTimelineEvent {
    #[serde(default)]
    pub items_added: Vec<TimelineItem>,
}

/// One timeline entry, from the stream or the timeline poll
#[derive(Debug, Clone, Deserialize)]
pub struct TimelineItem {
    /// ISO-8601 event time
    pub time: Option<String>,

    #[serde(rename = "type")]
    pub kind: Option<String>,

    pub icon: Option<String>,
    pub body: Option<String>,
    pub device_id: Option<String>,
    pub device_state: Option<String>,
    pub user_device_type: Option<String>,
    pub device_transition_from_state: Option<String>,
}

/// Payload of a `hello` frame
#[derive(Debug, Deserialize)]
pub struct HelloPayload {
    pub online: Option<bool>,
}

/// Payload of a `data_change` frame
#[derive(Debug, Deserialize)]
pub struct DataChangePayload {
    pub user_version: Option<i64>,
    pub partner_checksum: Option<String>,
    pub monitor_overview_checksum: Option<String>,
    pub device_data_checksum: Option<String>,
    pub settings_version: Option<i64>,

    #[serde(default)]
    pub pending_events: PendingEvents,
}

/// Pending upstream events inside a data change
#[derive(Debug, Default, Deserialize)]
pub struct PendingEvents {
    #[serde(default)]
    new_device_found: Option<OneOrMany<NewDeviceFound>>,
}

impl PendingEvents {
    /// New-device events, normalized from the bare-or-list wire forms
    #[must_use]
    pub fn new_device_events(&self) -> &[NewDeviceFound] {
        match &self.new_device_found {
            Some(OneOrMany::Many(events)) => events,
            Some(OneOrMany::One(event)) => std::slice::from_ref(event),
            None => &[],
        }
    }
}

/// A value the API serializes either bare or wrapped in a list
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    Many(Vec<T>),
    One(T),
}

/// One newly detected device inside a data change
#[derive(Debug, Deserialize)]
pub struct NewDeviceFound {
    pub device_id: Option<String>,
    pub guid: Option<String>,

    /// ISO-8601 detection time
    pub timestamp: Option<String>,
}

/// Payload of a `device_states` frame
#[derive(Debug, Deserialize)]
pub struct DeviceStatesPayload {
    #[serde(default)]
    pub states: Vec<DeviceStateChange>,
}

/// One device transition inside a `device_states` frame
#[derive(Debug, Deserialize)]
pub struct DeviceStateChange {
    pub device_id: Option<String>,
    pub mode: Option<String>,
    pub state: Option<String>,
}

/// Parse the API's `%Y-%m-%dT%H:%M:%S.%fZ` timestamps into epoch seconds
#[must_use]
pub fn convert_to_epoch(timestamp: &str) -> Option<i64> {
    match chrono::NaiveDateTime::parse_from_str(timestamp, "%Y-%m-%dT%H:%M:%S%.fZ") {
        Ok(parsed) => Some(parsed.and_utc().timestamp()),
        Err(e) => {
            tracing::error!(timestamp, error = %e, "unparseable API timestamp");
            None
        }
    }
}
