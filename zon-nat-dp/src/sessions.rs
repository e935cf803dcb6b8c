use crate::maps::{BoundedHashMap, MapError};
use zon_nat_common::{Conversion, ConversionRing, FlowKey, MAX_SESSIONS};

pub const MAP_NAME: &str = "ZN_OPEN_SESSIONS";

/// Port pair to conversion ring store. Written by the dataplane itself,
/// entries only leave a ring when a newer conversion overwrites them.
pub struct SessionCache {
    map: BoundedHashMap<FlowKey, ConversionRing>,
}

impl Default for SessionCache {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionCache {
    pub fn new() -> Self {
        Self::with_max_entries(MAX_SESSIONS)
    }

    pub fn with_max_entries(max: usize) -> Self {
        Self {
            map: BoundedHashMap::with_max_entries(MAP_NAME, max),
        }
    }

    /// Outgoing direction: the instance already chosen for `service`.
    pub fn lookup_by_service(&self, key: &FlowKey, service: u32) -> Option<u32> {
        self.map.get(key)?.find_by_service(service)
    }

    /// Ingoing direction: the service `instance` stands for. The key
    /// must be expressed from the client view, i.e. swapped for replies.
    pub fn lookup_by_instance(&self, key: &FlowKey, instance: u32) -> Option<u32> {
        self.map.get(key)?.find_by_instance(instance)
    }

    /// Stores `conv` in the next ring slot of `key`, evicting the oldest
    /// conversion if the ring is full. When the ring already converts
    /// `conv.service` it is left alone. Returns the instance stored for
    /// the service, which is the one every packet of the flow must use.
    /// Fails only when `key` is new and the cache is out of keys.
    pub fn insert_or_get(&self, key: FlowKey, conv: Conversion) -> Result<u32, MapError> {
        let ring = self.map.update(key, |ring| {
            let ring = ring.unwrap_or_default();
            if ring.find_by_service(conv.service).is_some() {
                ring
            } else {
                ring.with_conversion(conv)
            }
        })?;
        Ok(ring.find_by_service(conv.service).unwrap_or(conv.instance))
    }

    pub fn ring(&self, key: &FlowKey) -> Option<ConversionRing> {
        self.map.get(key)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
