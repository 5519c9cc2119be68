//! Wattline Collector - streaming telemetry for Wattline energy monitors
//!
//! This library provides the core functionality for the collector:
//! - Realtime websocket stream with heartbeat, rotation, and reconnect
//! - Event dispatch into `InfluxDB` line-protocol measurements
//! - Background descriptor enrichment with a TTL cache
//! - Status, inventory, and timeline REST pollers
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                  Wattline Cloud                      │
//! │   realtime stream  │  REST (auth, devices, status)  │
//! └─────────┬──────────────────────┬────────────────────┘
//!           │                      │
//! ┌─────────▼──────────┐  ┌────────▼───────────────────┐
//! │  ConnectionManager │  │  ApiClient + Pollers       │
//! │  EventDispatcher   │  │  Enrichment workers        │
//! └─────────┬──────────┘  └────────┬───────────────────┘
//!           │    EntityCache / NameResolutionJoin      │
//! ┌─────────▼──────────────────────▼───────────────────┐
//! │            TelemetrySink (InfluxDB v2)              │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod auth;
pub mod cache;
pub mod client;
pub mod config;
pub mod daemon;
pub mod dispatch;
pub mod enrichment;
pub mod error;
pub mod events;
pub mod join;
pub mod pollers;
pub mod records;
pub mod sink;
pub mod stream;

pub use auth::{AuthSession, authenticate};
pub use cache::EntityCache;
pub use client::{ApiClient, Descriptor, DescriptorFetch};
pub use config::Config;
pub use daemon::Collector;
pub use dispatch::EventDispatcher;
pub use enrichment::{EnrichmentQueue, EnrichmentRequest, WorkerContext, spawn_workers};
pub use error::{Error, Result};
pub use events::StreamEvent;
pub use join::{NameResolutionJoin, PendingSample};
pub use sink::{FieldValue, InfluxSink, Point, TelemetrySink};
pub use stream::ConnectionManager;
