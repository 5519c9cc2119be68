//! Stream frame dispatch
//!
//! Routes decoded frames to their per-kind handlers. Dispatch is
//! best-effort: a frame that fails to decode, or a known kind missing
//! required fields, is logged and dropped without disturbing the
//! connection.

use std::sync::Arc;

use chrono::Utc;

use crate::cache::EntityCache;
use crate::client::UNKNOWN_NAME;
use crate::enrichment::EnrichmentQueue;
use crate::events::{
    DataChangePayload, DeviceStatesPayload, HelloPayload, RealtimeUpdate, StreamEvent,
    TimelineItem, convert_to_epoch,
};
use crate::records;
use crate::sink::TelemetrySink;

/// Stateless router from wire frames to sink records
#[derive(Clone)]
pub struct EventDispatcher {
    monitor_id: String,
    cache: EntityCache,
    queue: EnrichmentQueue,
    sink: Arc<dyn TelemetrySink>,
}

impl EventDispatcher {
    #[must_use]
    pub fn new(
        monitor_id: String,
        cache: EntityCache,
        queue: EnrichmentQueue,
        sink: Arc<dyn TelemetrySink>,
    ) -> Self {
        Self {
            monitor_id,
            cache,
            queue,
            sink,
        }
    }

    /// Decode one frame and hand it to the matching handler
    pub async fn dispatch(&self, frame: &str) {
        let event = match StreamEvent::parse(frame) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(error = %e, "dropping undecodable frame");
                tracing::trace!(frame, "undecodable frame content");
                return;
            }
        };

        match event {
            StreamEvent::RealtimeUpdate(update) => self.handle_realtime(&update).await,
            StreamEvent::NewTimelineEvent(event) => {
                self.handle_timeline_items(&event.items_added).await;
            }
            StreamEvent::Hello(payload) => self.handle_hello(&payload).await,
            StreamEvent::DataChange(payload) => self.handle_data_change(&payload).await,
            StreamEvent::DeviceStates(payload) => self.handle_device_states(&payload).await,
            StreamEvent::MonitorInfo(payload) => {
                tracing::debug!(payload = %payload, "monitor_info event");
            }
            StreamEvent::MonitorConnection(payload) => {
                tracing::debug!(payload = %payload, "monitor_connection event");
            }
            StreamEvent::DeviceReactivated(payload) => {
                tracing::debug!(payload = %payload, "device_reactivated event");
            }
            StreamEvent::DeviceDeactivated(payload) => {
                tracing::debug!(payload = %payload, "device_deactivated event");
            }
            StreamEvent::Unknown { kind, payload } => {
                tracing::warn!(kind, payload = %payload, "unhandled event kind");
            }
        }
    }

    /// Mains samples are self-contained and persist without enrichment
    async fn handle_realtime(&self, update: &RealtimeUpdate) {
        let missing = update.missing_fields();
        if !missing.is_empty() {
            tracing::warn!(missing = ?missing, "realtime update missing required fields");
            return;
        }
        let (Some(hertz), Some(current), Some(watts), Some(epoch)) =
            (update.hz, update.c, update.w, update.epoch)
        else {
            return;
        };

        #[allow(clippy::cast_possible_truncation)]
        let epoch = epoch as i64;

        let points = records::mains_points(
            &self.monitor_id,
            hertz,
            current,
            watts,
            epoch,
            &update.voltage,
            &update.channels,
            &update.devices,
        );
        self.sink.write_points(points).await;
    }

    /// Persist timeline entries and queue their devices for lookup
    ///
    /// Shared between the stream handler and the timeline poller. Entries
    /// are written with whatever name the cache holds right now; the
    /// queued lookup freshens the descriptor for later references.
    pub async fn handle_timeline_items(&self, items: &[TimelineItem]) {
        let now = Utc::now().timestamp();
        for item in items {
            let Some(device_id) = item.device_id.as_deref() else {
                tracing::warn!(kind = ?item.kind, "timeline item without device id");
                continue;
            };

            let device_name = self
                .cache
                .display_name(device_id)
                .unwrap_or_else(|| UNKNOWN_NAME.to_string());

            let point = records::timeline_point(item, &device_name, now);
            self.sink.write_points(vec![point]).await;
            self.queue.enqueue(device_id);
        }
    }

    async fn handle_hello(&self, payload: &HelloPayload) {
        let online = payload.online.unwrap_or(false);
        let point = records::hello_point(&self.monitor_id, online, Utc::now().timestamp());
        self.sink.write_points(vec![point]).await;
    }

    async fn handle_data_change(&self, payload: &DataChangePayload) {
        tracing::debug!(
            user_version = ?payload.user_version,
            partner_checksum = ?payload.partner_checksum,
            monitor_overview_checksum = ?payload.monitor_overview_checksum,
            device_data_checksum = ?payload.device_data_checksum,
            settings_version = ?payload.settings_version,
            "data change"
        );

        let now = Utc::now().timestamp();
        for event in payload.pending_events.new_device_events() {
            let event_epoch = event.timestamp.as_deref().and_then(convert_to_epoch);
            let point = records::data_change_point(
                &self.monitor_id,
                event.device_id.as_deref(),
                payload.user_version,
                event.guid.as_deref(),
                event_epoch,
                now,
            );
            self.sink.write_points(vec![point]).await;
        }
    }

    async fn handle_device_states(&self, payload: &DeviceStatesPayload) {
        let now = Utc::now().timestamp();
        for change in &payload.states {
            let Some(device_id) = change.device_id.as_deref() else {
                tracing::warn!("device state change without device id");
                continue;
            };

            self.queue.enqueue(device_id);
            let point = records::device_state_point(
                &self.monitor_id,
                device_id,
                change.mode.as_deref(),
                change.state.as_deref(),
                now,
            );
            self.sink.write_points(vec![point]).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{FieldValue, Point};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;

    #[derive(Default)]
    struct RecordingSink {
        points: Mutex<Vec<Point>>,
    }

    #[async_trait]
    impl TelemetrySink for RecordingSink {
        async fn write_points(&self, points: Vec<Point>) {
            self.points.lock().unwrap().extend(points);
        }
    }

    impl RecordingSink {
        fn points(&self) -> Vec<Point> {
            self.points.lock().unwrap().clone()
        }
    }

    fn dispatcher() -> (
        EventDispatcher,
        Arc<RecordingSink>,
        EntityCache,
        UnboundedReceiver<crate::enrichment::EnrichmentRequest>,
    ) {
        let sink = Arc::new(RecordingSink::default());
        let cache = EntityCache::new(Duration::from_secs(60));
        let (queue, rx) = EnrichmentQueue::new();
        let dispatcher = EventDispatcher::new("88".to_string(), cache.clone(), queue, sink.clone());
        (dispatcher, sink, cache, rx)
    }

    fn queued_ids(rx: &mut UnboundedReceiver<crate::enrichment::EnrichmentRequest>) -> Vec<String> {
        let mut ids = Vec::new();
        while let Ok(request) = rx.try_recv() {
            ids.push(request.entity_id);
        }
        ids
    }

    // -- realtime --------------------------------------------------------

    #[tokio::test]
    async fn realtime_update_writes_mains_points() {
        let (dispatcher, sink, _cache, _rx) = dispatcher();

        dispatcher
            .dispatch(r#"{"type":"realtime_update","payload":{"hz":60.01,"c":4.2,"w":512.0,"epoch":1696156200.7,"voltage":[121.0,122.0],"channels":[200.0,312.0]}}"#)
            .await;

        let points = sink.points();
        assert_eq!(points[0].measurement, "wattline_mains");
        assert_eq!(points[0].timestamp, 1_696_156_200);
        assert!(points[0].fields.contains(&("hertz".to_string(), FieldValue::Float(60.01))));
        // two leg power points, two leg voltage points, one clock drift point
        assert_eq!(points.len(), 6);
    }

    #[tokio::test]
    async fn realtime_update_missing_a_required_field_writes_nothing() {
        let (dispatcher, sink, _cache, _rx) = dispatcher();

        dispatcher
            .dispatch(r#"{"type":"realtime_update","payload":{"hz":60.0,"c":4.2,"epoch":1696156200}}"#)
            .await;

        assert!(sink.points().is_empty());
    }

    // -- frame handling --------------------------------------------------

    #[tokio::test]
    async fn undecodable_frame_is_dropped() {
        let (dispatcher, sink, _cache, _rx) = dispatcher();

        dispatcher.dispatch("{not json").await;
        dispatcher.dispatch(r#"{"payload":{}}"#).await;

        assert!(sink.points().is_empty());
    }

    #[tokio::test]
    async fn unknown_kind_is_dropped() {
        let (dispatcher, sink, _cache, mut rx) = dispatcher();

        dispatcher
            .dispatch(r#"{"type":"firmware_update","payload":{"stage":1}}"#)
            .await;

        assert!(sink.points().is_empty());
        assert!(queued_ids(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn hello_defaults_to_offline() {
        let (dispatcher, sink, _cache, _rx) = dispatcher();

        dispatcher.dispatch(r#"{"type":"hello","payload":{}}"#).await;

        let points = sink.points();
        assert_eq!(points[0].measurement, "hello_event");
        assert!(points[0]
            .fields
            .contains(&("online".to_string(), FieldValue::Boolean(false))));
    }

    // -- timeline --------------------------------------------------------

    #[tokio::test]
    async fn timeline_items_persist_and_enqueue() {
        let (dispatcher, sink, _cache, mut rx) = dispatcher();

        dispatcher
            .dispatch(
                r#"{"type":"new_timeline_event","payload":{"items_added":[
                    {"time":"2023-10-01T10:30:00.000Z","type":"DeviceOn","device_id":"d9"},
                    {"type":"SystemAlert","body":"no device id here"}
                ]}}"#,
            )
            .await;

        let points = sink.points();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].measurement, "wattline_event");
        assert!(points[0].tags.contains(&("device_name", "Unknown".to_string())));
        assert_eq!(queued_ids(&mut rx), vec!["d9".to_string()]);
    }

    #[tokio::test]
    async fn timeline_items_use_cached_names() {
        let (dispatcher, sink, cache, _rx) = dispatcher();
        cache.insert(
            "d9",
            Arc::new(serde_json::from_str(r#"{"device":{"id":"d9","name":"Dryer"}}"#).unwrap()),
        );

        dispatcher
            .dispatch(
                r#"{"type":"new_timeline_event","payload":{"items_added":[{"type":"DeviceOn","device_id":"d9"}]}}"#,
            )
            .await;

        assert!(sink.points()[0].tags.contains(&("device_name", "Dryer".to_string())));
    }

    // -- data change -----------------------------------------------------

    #[tokio::test]
    async fn data_change_persists_each_new_device() {
        let (dispatcher, sink, _cache, _rx) = dispatcher();

        dispatcher
            .dispatch(
                r#"{"type":"data_change","payload":{
                    "user_version":12,
                    "pending_events":{"new_device_found":{"device_id":"d4","guid":"abc-123","timestamp":"2023-10-01T10:30:00.500Z"}}
                }}"#,
            )
            .await;

        let points = sink.points();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].measurement, "data_change_event");
        assert!(points[0]
            .fields
            .contains(&("json_timestamp".to_string(), FieldValue::Integer(1_696_156_200))));
    }

    // -- device states ---------------------------------------------------

    #[tokio::test]
    async fn device_states_enqueue_and_persist() {
        let (dispatcher, sink, _cache, mut rx) = dispatcher();

        dispatcher
            .dispatch(
                r#"{"type":"device_states","payload":{"states":[
                    {"device_id":"D1","mode":"auto","state":"on"},
                    {"mode":"auto","state":"off"}
                ]}}"#,
            )
            .await;

        let points = sink.points();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].measurement, "device_state_event");
        assert!(points[0].tags.contains(&("device_id", "D1".to_string())));
        assert!(points[0]
            .fields
            .contains(&("state".to_string(), FieldValue::Text("on".to_string()))));
        assert_eq!(queued_ids(&mut rx), vec!["D1".to_string()]);
    }
}
