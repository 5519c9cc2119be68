//! Measurement schemas
//!
//! Every point this collector writes is built here, so the store layout can
//! be read in one place. Builders are pure: callers supply identifiers and
//! timestamps, and absent input fields simply stay off the point.

use chrono::Utc;
use serde_json::Value;

use crate::client::{Descriptor, DetectedDevice, MonitorStatus};
use crate::events::{RealtimeDevice, TimelineItem, convert_to_epoch};
use crate::sink::{FieldValue, Point};

/// Mains samples and per-device realtime breakdown
///
/// One aggregate point, one per populated leg for watts and voltage, one
/// ingest-lag observability point, and one point per inline device. All are
/// stamped with the sample's own epoch.
#[must_use]
#[allow(clippy::too_many_arguments, clippy::cast_precision_loss)]
pub fn mains_points(
    monitor_id: &str,
    hertz: f64,
    current: f64,
    watts: f64,
    epoch: i64,
    voltage: &[f64],
    channels: &[f64],
    devices: &[RealtimeDevice],
) -> Vec<Point> {
    let mut points = vec![
        Point::new("wattline_mains", epoch)
            .tag("monitor_id", monitor_id)
            .field("hertz", hertz)
            .field("current", current)
            .field("watts", watts),
    ];

    for (index, leg) in ["L1", "L2"].into_iter().enumerate() {
        if let Some(value) = channels.get(index) {
            points.push(
                Point::new("wattline_mains", epoch)
                    .tag("monitor_id", monitor_id)
                    .tag("leg", leg)
                    .field("watts", *value),
            );
        }
    }

    for (index, leg) in ["L1", "L2"].into_iter().enumerate() {
        if let Some(value) = voltage.get(index) {
            points.push(
                Point::new("wattline_mains", epoch)
                    .tag("monitor_id", monitor_id)
                    .tag("leg", leg)
                    .field("voltage", *value),
            );
        }
    }

    let lag_secs = (Utc::now().timestamp() - epoch) as f64;
    points.push(
        Point::new("wattline_o11y", epoch)
            .tag("monitor_id", monitor_id)
            .field("time_difference", lag_secs),
    );

    for device in devices {
        points.push(realtime_device_point(monitor_id, device, epoch));
    }

    points
}

fn realtime_device_point(monitor_id: &str, device: &RealtimeDevice, epoch: i64) -> Point {
    Point::new("wattline_devices", epoch)
        .tag("monitor_id", monitor_id)
        .maybe_tag("device_id", device.id.as_deref())
        .maybe_tag("device_name", device.name.as_deref())
        .tag("is_plug", device.is_plug().to_string())
        .maybe_field("icon", device.icon.as_deref())
        .maybe_field("watts", device.w)
        .maybe_field("sd_watts", device.sd.as_ref().and_then(|sd| sd.w))
        .maybe_field("sd_current", device.sd.as_ref().and_then(|sd| sd.i))
        .maybe_field("sd_voltage", device.sd.as_ref().and_then(|sd| sd.v))
        .maybe_field("sd_energy", device.sd.as_ref().and_then(|sd| sd.e))
        .maybe_field("always_on_watts", device.ao_w)
        .maybe_field(
            "always_on_state",
            device.ao_st.as_ref().and_then(value_field),
        )
}

/// One timeline entry
///
/// Stamped with the item's own event time when it parses, the wall clock
/// otherwise.
#[must_use]
pub fn timeline_point(item: &TimelineItem, device_name: &str, now: i64) -> Point {
    let timestamp = item
        .time
        .as_deref()
        .and_then(convert_to_epoch)
        .unwrap_or(now);

    Point::new("wattline_event", timestamp)
        .maybe_tag("device_id", item.device_id.as_deref())
        .tag("device_name", device_name)
        .maybe_field("time", item.time.as_deref())
        .maybe_field("type", item.kind.as_deref())
        .maybe_field("icon", item.icon.as_deref())
        .maybe_field("body", item.body.as_deref())
        .maybe_field("device_state", item.device_state.as_deref())
        .maybe_field("user_device_type", item.user_device_type.as_deref())
        .maybe_field(
            "device_transition_from_state",
            item.device_transition_from_state.as_deref(),
        )
}

/// Session greeting
#[must_use]
pub fn hello_point(monitor_id: &str, online: bool, timestamp: i64) -> Point {
    Point::new("hello_event", timestamp)
        .tag("monitor_id", monitor_id)
        .field("online", online)
}

/// One newly detected device inside a data change
#[must_use]
pub fn data_change_point(
    monitor_id: &str,
    device_id: Option<&str>,
    user_version: Option<i64>,
    guid: Option<&str>,
    event_epoch: Option<i64>,
    timestamp: i64,
) -> Point {
    Point::new("data_change_event", timestamp)
        .tag("monitor_id", monitor_id)
        .maybe_tag("device_id", device_id)
        .maybe_field("user_version", user_version)
        .maybe_field("guid", guid)
        .maybe_field("json_timestamp", event_epoch)
}

/// One device on/off transition
#[must_use]
pub fn device_state_point(
    monitor_id: &str,
    device_id: &str,
    mode: Option<&str>,
    state: Option<&str>,
    timestamp: i64,
) -> Point {
    Point::new("device_state_event", timestamp)
        .tag("monitor_id", monitor_id)
        .tag("device_id", device_id)
        .maybe_field("mode", mode)
        .maybe_field("state", state)
}

/// Monitor status snapshot plus one point per in-detection device
#[must_use]
pub fn monitor_status_points(
    monitor_id: &str,
    status: &MonitorStatus,
    timestamp: i64,
) -> Vec<Point> {
    let info = &status.monitor_info;
    let status_point = Point::new("wattline_monitor_status", timestamp)
        .tag("monitor_id", monitor_id)
        .maybe_field("ethernet", info.ethernet)
        .maybe_field("online", info.online)
        .maybe_field("ip_address", info.ip_address.as_deref())
        .maybe_field("version", info.version.as_deref())
        .maybe_field("ssid", info.ssid.as_deref())
        .maybe_field("ndt_enabled", info.ndt_enabled)
        .maybe_field("mac", info.mac.as_deref())
        .maybe_field("progress", status.signals.progress)
        .maybe_field("status", status.signals.status.as_deref())
        .maybe_field(
            "wifi_strength",
            info.wifi_strength.filter(|strength| *strength != 0.0),
        );

    let mut points = vec![status_point];
    for (state, detected) in [
        ("in_progress", &status.device_detection.in_progress),
        ("found", &status.device_detection.found),
    ] {
        for device in detected {
            points.push(detection_point(monitor_id, state, device, timestamp));
        }
    }
    points
}

fn detection_point(
    monitor_id: &str,
    state: &'static str,
    device: &DetectedDevice,
    timestamp: i64,
) -> Point {
    Point::new("wattline_device_detection", timestamp)
        .tag("monitor_id", monitor_id)
        .tag("status", state)
        .maybe_tag("name", device.name.as_deref())
        .maybe_field("icon", device.icon.as_deref())
        .field("progress", device.progress.unwrap_or(0.0))
}

/// Detail record for a regular (non-aggregate) device descriptor
///
/// Usage statistics are flattened onto the point as-is, except `yearly_cost`
/// which the API reports in cents and this schema stores in dollars.
#[must_use]
pub fn device_detail_point(monitor_id: &str, descriptor: &Descriptor, timestamp: i64) -> Point {
    let mut point = Point::new("wattline_devices", timestamp)
        .maybe_tag("device_id", descriptor.device.id.as_deref())
        .tag("device_name", descriptor.device.display_name())
        .tag("monitor_id", monitor_tag(monitor_id, descriptor))
        .maybe_field("icon", descriptor.device.icon.as_deref())
        .maybe_field(
            "last_state",
            descriptor.device.last_state.as_ref().and_then(value_field),
        )
        .maybe_field("last_state_time", last_state_epoch(descriptor));

    for (key, value) in &descriptor.usage {
        let rendered = if key == "yearly_cost" {
            value.as_f64().map(|cents| FieldValue::Float(cents / 100.0))
        } else {
            value_field(value)
        };
        point = point.maybe_field(key.as_str(), rendered);
    }

    if let Some(info) = &descriptor.info {
        point = point.field("info", info.to_string());
    }

    point
}

/// Usage and cohort-comparison records for the always-on aggregate
///
/// Sub-device points are not built here; they go through the name join since
/// the breakdown carries no inline names.
#[must_use]
pub fn always_on_points(monitor_id: &str, descriptor: &Descriptor, timestamp: i64) -> Vec<Point> {
    let usage = &descriptor.usage;
    let usage_point = Point::new("wattline_always_on", timestamp)
        .maybe_tag("device_id", descriptor.device.id.as_deref())
        .tag("device_name", descriptor.device.display_name())
        .tag("monitor_id", monitor_tag(monitor_id, descriptor))
        .maybe_field("icon", descriptor.device.icon.as_deref())
        .maybe_field("avg_monthly_KWH", usage.get("avg_monthly_KWH").and_then(value_field))
        .maybe_field("avg_monthly_pct", usage.get("avg_monthly_pct").and_then(value_field))
        .maybe_field("avg_watts", usage.get("avg_watts").and_then(value_field))
        .maybe_field("yearly_KWH", usage.get("yearly_KWH").and_then(value_field))
        .maybe_field("yearly_cost", usage.get("yearly_cost").and_then(value_field))
        .maybe_field("avg_monthly_cost", usage.get("avg_monthly_cost").and_then(value_field))
        .maybe_field("current_ao_wattage", usage.get("current_ao_wattage").and_then(value_field));

    let comparison = usage.get("comparison").and_then(Value::as_object);
    let cohort = comparison
        .and_then(|block| block.get("cohort"))
        .and_then(Value::as_object);

    let comparison_point = Point::new("wattline_always_on_comparison", timestamp)
        .maybe_tag("device_id", descriptor.device.id.as_deref())
        .tag("monitor_id", monitor_tag(monitor_id, descriptor))
        .maybe_field("comparison_text", object_field(comparison, "comparison_text"))
        .maybe_field(
            "comparison_summary_text",
            object_field(comparison, "comparison_summary_text"),
        )
        .maybe_field("title", object_field(comparison, "title"))
        .maybe_field("count", object_field(comparison, "count"))
        .maybe_field("display_count", object_field(comparison, "display_count"))
        .maybe_field("cohort_marker", object_field(comparison, "cohort_marker"))
        .maybe_field("cohort_avg_w", object_field(comparison, "cohort_avg_w"))
        .maybe_field("cohort_id", object_field(cohort, "id"))
        .maybe_field("cohort_area_code", object_field(cohort, "area_code"))
        .maybe_field("cohort_state", object_field(cohort, "state"))
        .maybe_field("cohort_home_size", object_field(cohort, "home_size"));

    vec![usage_point, comparison_point]
}

/// One always-on constituent, written once its display name is known
#[must_use]
pub fn always_on_device_point(
    monitor_id: &str,
    entity_id: &str,
    device_name: &str,
    watts: Option<f64>,
    timestamp: i64,
) -> Point {
    Point::new("wattline_always_on_devices", timestamp)
        .tag("monitor_id", monitor_id)
        .tag("parent_device_id", "always_on")
        .tag("device_id", entity_id)
        .tag("device_name", device_name)
        .maybe_field("watts", watts)
}

/// Monitor tag for descriptor records, preferring the descriptor's own id
fn monitor_tag(monitor_id: &str, descriptor: &Descriptor) -> String {
    descriptor
        .device
        .monitor_id
        .map_or_else(|| monitor_id.to_string(), |id| id.to_string())
}

fn object_field(block: Option<&serde_json::Map<String, Value>>, key: &str) -> Option<FieldValue> {
    block.and_then(|map| map.get(key)).and_then(value_field)
}

fn last_state_epoch(descriptor: &Descriptor) -> Option<i64> {
    let raw = descriptor.device.last_state_time.as_deref()?;
    match chrono::DateTime::parse_from_rfc3339(raw) {
        Ok(parsed) => Some(parsed.timestamp()),
        Err(e) => {
            tracing::debug!(last_state_time = raw, error = %e, "unparseable state time");
            None
        }
    }
}

/// Map a loose JSON scalar onto a field value
///
/// Arrays and objects are stored as their JSON text; nulls produce nothing.
fn value_field(value: &Value) -> Option<FieldValue> {
    match value {
        Value::Null => None,
        Value::Bool(b) => Some(FieldValue::Boolean(*b)),
        Value::Number(n) => {
            if let Some(int) = n.as_i64() {
                Some(FieldValue::Integer(int))
            } else {
                n.as_f64().map(FieldValue::Float)
            }
        }
        Value::String(s) => Some(FieldValue::Text(s.clone())),
        other => Some(FieldValue::Text(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn realtime_devices(raw: &str) -> Vec<RealtimeDevice> {
        serde_json::from_str(raw).unwrap()
    }

    // -- mains ---------------------------------------------------------------

    #[test]
    fn mains_emits_aggregate_legs_and_lag() {
        let points = mains_points(
            "77",
            60.0,
            12.0,
            1450.0,
            1_700_000_000,
            &[121.0, 122.5],
            &[700.0, 750.0],
            &[],
        );

        assert_eq!(points.len(), 6);
        assert_eq!(points[0].measurement, "wattline_mains");
        assert_eq!(points[0].fields.len(), 3);
        assert_eq!(points[1].tags[1], ("leg", "L1".to_string()));
        assert_eq!(points[2].tags[1], ("leg", "L2".to_string()));
        assert_eq!(points[3].fields[0].0, "voltage");
        assert_eq!(points[5].measurement, "wattline_o11y");
        assert!(points.iter().all(|p| p.timestamp == 1_700_000_000));
    }

    #[test]
    fn mains_skips_absent_legs() {
        let points = mains_points("77", 60.0, 12.0, 1450.0, 1_700_000_000, &[], &[700.0], &[]);

        // aggregate + L1 watts + lag
        assert_eq!(points.len(), 3);
    }

    #[test]
    fn realtime_devices_carry_plug_fields() {
        let devices = realtime_devices(
            r#"[{"id": "plug1", "name": "Heater", "w": 900.0, "ao_w": 3.0,
                 "ao_st": true, "sd": {"w": 899.5, "v": 120.2}}]"#,
        );
        let points = mains_points("77", 60.0, 12.0, 1450.0, 1_700_000_000, &[], &[], &devices);
        let device_point = points.last().unwrap();

        assert_eq!(device_point.measurement, "wattline_devices");
        assert!(device_point
            .tags
            .contains(&("is_plug", "true".to_string())));
        assert!(device_point
            .fields
            .contains(&("sd_voltage".to_string(), FieldValue::Float(120.2))));
        assert!(device_point
            .fields
            .contains(&("always_on_state".to_string(), FieldValue::Boolean(true))));
    }

    // -- timeline -------------------------------------------------------------

    #[test]
    fn timeline_point_prefers_the_item_time() {
        let item: TimelineItem = serde_json::from_str(
            r#"{"time": "2023-10-01T10:30:00.000Z", "type": "DeviceOn", "device_id": "d1"}"#,
        )
        .unwrap();

        let point = timeline_point(&item, "Fridge", 99);
        assert_eq!(point.timestamp, 1_696_156_200);
        assert!(point.tags.contains(&("device_name", "Fridge".to_string())));
        assert!(point
            .fields
            .contains(&("type".to_string(), FieldValue::Text("DeviceOn".to_string()))));
    }

    #[test]
    fn timeline_point_falls_back_to_the_wall_clock() {
        let item: TimelineItem =
            serde_json::from_str(r#"{"time": "not a time", "device_id": "d1"}"#).unwrap();

        assert_eq!(timeline_point(&item, "Fridge", 99).timestamp, 99);
    }

    // -- descriptors ----------------------------------------------------------

    #[test]
    fn detail_point_flattens_usage_and_converts_cost() {
        let descriptor: Descriptor = serde_json::from_str(
            r#"{
                "device": {
                    "id": "d1", "name": "Fridge", "icon": "fridge", "monitor_id": 77,
                    "last_state": "DeviceOn",
                    "last_state_time": "2023-10-01T10:30:00.000Z"
                },
                "usage": {"avg_watts": 84.0, "yearly_cost": 7300},
                "info": {"note": "kitchen"}
            }"#,
        )
        .unwrap();

        let point = device_detail_point("99", &descriptor, 50);
        assert!(point.tags.contains(&("monitor_id", "77".to_string())));
        assert!(point
            .fields
            .contains(&("yearly_cost".to_string(), FieldValue::Float(73.0))));
        assert!(point
            .fields
            .contains(&("avg_watts".to_string(), FieldValue::Float(84.0))));
        assert!(point
            .fields
            .contains(&("last_state_time".to_string(), FieldValue::Integer(1_696_156_200))));
        assert!(point
            .fields
            .iter()
            .any(|(key, value)| key == "info" && matches!(value, FieldValue::Text(_))));
    }

    #[test]
    fn detail_point_uses_collector_monitor_when_descriptor_lacks_one() {
        let descriptor: Descriptor =
            serde_json::from_str(r#"{"device": {"id": "d1", "name": "Fridge"}}"#).unwrap();

        let point = device_detail_point("99", &descriptor, 50);
        assert!(point.tags.contains(&("monitor_id", "99".to_string())));
    }

    #[test]
    fn always_on_builds_usage_and_comparison() {
        let descriptor: Descriptor = serde_json::from_str(
            r#"{
                "device": {"id": "always_on", "name": "Always On", "monitor_id": 77},
                "usage": {
                    "avg_watts": 180.0,
                    "yearly_cost": 7300,
                    "comparison": {
                        "comparison_text": "above average",
                        "cohort_avg_w": 150,
                        "cohort": {"id": 12, "state": "VT", "home_size": 1800}
                    }
                }
            }"#,
        )
        .unwrap();

        let points = always_on_points("99", &descriptor, 50);
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].measurement, "wattline_always_on");
        // the aggregate keeps the API's cents value untouched
        assert!(points[0]
            .fields
            .contains(&("yearly_cost".to_string(), FieldValue::Integer(7300))));
        assert_eq!(points[1].measurement, "wattline_always_on_comparison");
        assert!(points[1]
            .fields
            .contains(&("cohort_state".to_string(), FieldValue::Text("VT".to_string()))));
    }

    #[test]
    fn always_on_sub_device_point_shape() {
        let point = always_on_device_point("99", "d2", "Router", Some(12.5), 50);

        assert_eq!(point.measurement, "wattline_always_on_devices");
        assert!(point
            .tags
            .contains(&("parent_device_id", "always_on".to_string())));
        assert!(point
            .fields
            .contains(&("watts".to_string(), FieldValue::Float(12.5))));
    }

    // -- status ----------------------------------------------------------------

    #[test]
    fn status_points_include_detection_entries() {
        let status: MonitorStatus = serde_json::from_str(
            r#"{
                "signals": {"progress": 82.5, "status": "OK"},
                "monitor_info": {"online": true, "wifi_strength": -61.0},
                "device_detection": {
                    "in_progress": [{"name": "Dryer", "progress": 40.0}],
                    "found": [{"name": "Fridge"}]
                }
            }"#,
        )
        .unwrap();

        let points = monitor_status_points("77", &status, 50);
        assert_eq!(points.len(), 3);
        assert!(points[0]
            .fields
            .contains(&("wifi_strength".to_string(), FieldValue::Float(-61.0))));
        assert!(points[1].tags.contains(&("status", "in_progress".to_string())));
        // absent detection progress defaults to zero
        assert!(points[2]
            .fields
            .contains(&("progress".to_string(), FieldValue::Float(0.0))));
    }

    #[test]
    fn zero_wifi_strength_is_not_reported() {
        let status: MonitorStatus =
            serde_json::from_str(r#"{"monitor_info": {"online": true, "wifi_strength": 0.0}}"#)
                .unwrap();

        let points = monitor_status_points("77", &status, 50);
        assert!(!points[0].fields.iter().any(|(key, _)| key == "wifi_strength"));
    }
}
