//! TTL cache for device descriptors

use std::sync::Arc;
use std::time::Duration;

use mini_moka::sync::Cache;

use crate::client::Descriptor;

/// Upper bound on cached descriptors; home monitors stay far below this
const MAX_ENTRIES: u64 = 1024;

/// Shared cache of device descriptors keyed by device id
///
/// Entries expire a fixed interval after insertion, which bounds how stale a
/// device name or detail record can get. Clones share the same store.
#[derive(Debug, Clone)]
pub struct EntityCache {
    inner: Cache<String, Arc<Descriptor>>,
}

impl EntityCache {
    /// Create a cache whose entries expire `ttl` after insertion
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Cache::builder()
                .max_capacity(MAX_ENTRIES)
                .time_to_live(ttl)
                .build(),
        }
    }

    /// Fresh descriptor for an entity, if any
    #[must_use]
    pub fn get(&self, entity_id: &str) -> Option<Arc<Descriptor>> {
        self.inner.get(&entity_id.to_string())
    }

    /// Store a descriptor, replacing any previous entry
    pub fn insert(&self, entity_id: &str, descriptor: Arc<Descriptor>) {
        self.inner.insert(entity_id.to_string(), descriptor);
    }

    /// Display name for an entity whose descriptor is cached
    ///
    /// A cached descriptor without a name resolves to the API's placeholder,
    /// so the presence of a return value means "resolved", not "named".
    #[must_use]
    pub fn display_name(&self, entity_id: &str) -> Option<String> {
        self.get(entity_id)
            .map(|descriptor| descriptor.device.display_name().to_string())
    }
}
