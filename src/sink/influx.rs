//! `InfluxDB` v2 sink
//!
//! Points are queued onto an unbounded channel and drained by one background
//! writer task, so producers never block on the network. The writer batches:
//! it posts line protocol every [`FLUSH_INTERVAL`] or as soon as
//! [`MAX_BUFFERED_POINTS`] accumulate, whichever comes first.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use tokio::sync::{mpsc, oneshot};
use url::Url;

use super::{FieldValue, Point, TelemetrySink};
use crate::config::InfluxConfig;

/// How often buffered points are posted
const FLUSH_INTERVAL: Duration = Duration::from_secs(10);

/// Buffer size that forces an immediate post
const MAX_BUFFERED_POINTS: usize = 5_000;

enum Command {
    Write(Vec<Point>),
    Flush(oneshot::Sender<()>),
}

/// Handle to the background `InfluxDB` writer
#[derive(Clone)]
pub struct InfluxSink {
    tx: mpsc::UnboundedSender<Command>,
}

impl InfluxSink {
    /// Start the background writer and return a handle to it
    #[must_use]
    pub fn spawn(config: InfluxConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = Writer::new(config);
        drop(tokio::spawn(writer.run(rx)));
        Self { tx }
    }
}

#[async_trait]
impl TelemetrySink for InfluxSink {
    async fn write_points(&self, points: Vec<Point>) {
        if points.is_empty() {
            return;
        }
        if self.tx.send(Command::Write(points)).is_err() {
            tracing::warn!("influx writer is gone, dropping points");
        }
    }

    async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(Command::Flush(ack)).is_ok() {
            let _ = done.await;
        }
    }
}

struct Writer {
    client: reqwest::Client,
    write_url: Url,
    token: String,
    buffer: Vec<Point>,
}

impl Writer {
    fn new(config: InfluxConfig) -> Self {
        let mut write_url = config.url;
        write_url.set_path("/api/v2/write");
        write_url
            .query_pairs_mut()
            .append_pair("org", &config.org)
            .append_pair("bucket", &config.bucket)
            .append_pair("precision", "s");

        Self {
            client: reqwest::Client::new(),
            write_url,
            token: config.token,
            buffer: Vec::new(),
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
        loop {
            tokio::select! {
                command = rx.recv() => match command {
                    Some(Command::Write(points)) => {
                        self.buffer.extend(points);
                        if self.buffer.len() >= MAX_BUFFERED_POINTS {
                            self.flush_now().await;
                        }
                    }
                    Some(Command::Flush(ack)) => {
                        self.flush_now().await;
                        let _ = ack.send(());
                    }
                    None => {
                        self.flush_now().await;
                        break;
                    }
                },
                _ = ticker.tick() => self.flush_now().await,
            }
        }
        tracing::debug!("influx writer stopped");
    }

    async fn flush_now(&mut self) {
        if self.buffer.is_empty() {
            return;
        }

        let points = std::mem::take(&mut self.buffer);
        let mut lines = Vec::with_capacity(points.len());
        for point in &points {
            match encode_line(point) {
                Some(line) => lines.push(line),
                None => tracing::debug!(
                    measurement = point.measurement,
                    "skipping point with no fields"
                ),
            }
        }
        if lines.is_empty() {
            return;
        }

        let result = self
            .client
            .post(self.write_url.clone())
            .header(AUTHORIZATION, format!("Token {}", self.token))
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(lines.join("\n"))
            .send()
            .await
            .and_then(reqwest::Response::error_for_status);

        match result {
            Ok(_) => tracing::debug!(points = lines.len(), "wrote points"),
            Err(e) => {
                // Points are dropped on failure; log every line so nothing
                // disappears silently.
                tracing::error!(error = %e, points = lines.len(), "influx write failed");
                for line in &lines {
                    tracing::error!(line = %line, "unwritten point");
                }
            }
        }
    }
}

/// Render a point in line protocol with second precision
fn encode_line(point: &Point) -> Option<String> {
    use std::fmt::Write as _;

    let mut fields = String::new();
    for (key, value) in &point.fields {
        let Some(rendered) = render_field(value) else {
            tracing::debug!(
                measurement = point.measurement,
                key = %key,
                "skipping non-finite field"
            );
            continue;
        };
        if !fields.is_empty() {
            fields.push(',');
        }
        let _ = write!(fields, "{}={rendered}", escape_key(key));
    }
    if fields.is_empty() {
        return None;
    }

    let mut line = escape_measurement(point.measurement);
    for (key, value) in &point.tags {
        let _ = write!(line, ",{}={}", escape_key(key), escape_key(value));
    }
    let _ = write!(line, " {fields} {}", point.timestamp);
    Some(line)
}

fn render_field(value: &FieldValue) -> Option<String> {
    match value {
        FieldValue::Float(v) => v.is_finite().then(|| v.to_string()),
        FieldValue::Integer(v) => Some(format!("{v}i")),
        FieldValue::Boolean(v) => Some(v.to_string()),
        FieldValue::Text(v) => Some(format!(
            "\"{}\"",
            v.replace('\\', "\\\\").replace('"', "\\\"")
        )),
    }
}

fn escape_measurement(name: &str) -> String {
    name.replace(',', "\\,").replace(' ', "\\ ")
}

fn escape_key(value: &str) -> String {
    value
        .replace(',', "\\,")
        .replace('=', "\\=")
        .replace(' ', "\\ ")
}

#[cfg(test)]
mod tests {
    use super::*;

    // -- line protocol encoding ---------------------------------------------

    #[test]
    fn encodes_tags_fields_and_timestamp() {
        let point = Point::new("wattline_mains", 1_700_000_000)
            .tag("monitor_id", "77")
            .field("watts", 412.5)
            .field("hertz", 60.0);

        assert_eq!(
            encode_line(&point).unwrap(),
            "wattline_mains,monitor_id=77 watts=412.5,hertz=60 1700000000"
        );
    }

    #[test]
    fn integers_carry_the_i_suffix() {
        let point = Point::new("wattline_o11y", 10).field("time_difference", 3_i64);
        assert_eq!(encode_line(&point).unwrap(), "wattline_o11y time_difference=3i 10");
    }

    #[test]
    fn strings_are_quoted_and_escaped() {
        let point = Point::new("wattline_event", 5).field("body", "Oven \"on\"");
        assert_eq!(
            encode_line(&point).unwrap(),
            "wattline_event body=\"Oven \\\"on\\\"\" 5"
        );
    }

    #[test]
    fn tag_values_escape_spaces_and_commas() {
        let point = Point::new("wattline_devices", 1)
            .tag("device_name", "Heat pump, garage")
            .field("watts", 1.0);

        assert_eq!(
            encode_line(&point).unwrap(),
            "wattline_devices,device_name=Heat\\ pump\\,\\ garage watts=1 1"
        );
    }

    #[test]
    fn booleans_render_bare() {
        let point = Point::new("wattline_hello", 2).field("online", true);
        assert_eq!(encode_line(&point).unwrap(), "wattline_hello online=true 2");
    }

    #[test]
    fn fieldless_points_encode_to_nothing() {
        let point = Point::new("wattline_devices", 1).tag("device_id", "d1");
        assert!(encode_line(&point).is_none());
    }

    #[test]
    fn non_finite_floats_are_dropped() {
        let point = Point::new("wattline_mains", 1)
            .field("watts", f64::NAN)
            .field("hertz", 50.0);

        assert_eq!(encode_line(&point).unwrap(), "wattline_mains hertz=50 1");
    }

    // -- write url ----------------------------------------------------------

    #[test]
    fn writer_builds_v2_write_url() {
        let config = InfluxConfig {
            url: "http://influxdb:8086".parse().unwrap(),
            token: "secret".to_string(),
            org: "home".to_string(),
            bucket: "energy data".to_string(),
        };

        let writer = Writer::new(config);
        assert_eq!(
            writer.write_url.as_str(),
            "http://influxdb:8086/api/v2/write?org=home&bucket=energy+data&precision=s"
        );
    }
}
