#![cfg_attr(not(test), no_std)]

/// Max conversions tracked for a single port pair.
pub const MAX_CONVERSIONS: usize = 4;
/// Max instances published for a single service address.
pub const MAX_INSTANCES: usize = 32;
/// Max port pairs tracked by the session cache.
pub const MAX_SESSIONS: usize = 128;
/// Max service addresses held by the backend registry.
pub const MAX_SERVICES: usize = 128;

pub mod stats {
    pub const PACKETS: u32 = 0;
    pub const FORWARD_UNMODIFIED: u32 = 1;
    pub const FORWARD_MODIFIED: u32 = 2;
    pub const DROP: u32 = 3;
    pub const PARSE_ERRORS: u32 = 4;
    pub const UNSUPPORTED: u32 = 5;
    pub const SESSION_HITS: u32 = 6;
    pub const SESSION_MISSES: u32 = 7;
    pub const REGISTRY_MISSES: u32 = 8;
    pub const SESSION_ERROR_UPDATE: u32 = 9;
    pub const REWRITE_ERRORS: u32 = 10;
    pub const INGOING_UNTRACKED: u32 = 11;
    pub const NOTIFY_LOST: u32 = 12;
    pub const MAX: u32 = 13;
}

bitflags::bitflags! {
/// Transport protocols eligible for translation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProtoFlags: u32 {
    const TCP = 1;
    const UDP = 2;
}
}

impl Default for ProtoFlags {
    fn default() -> Self {
        Self::all()
    }
}

/// Identifies a flow by its port pair as seen from the client that opened it.
/// Ports are kept in host byte order.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub src_port: u16,
    pub dst_port: u16,
}

impl FlowKey {
    pub fn new(src_port: u16, dst_port: u16) -> Self {
        Self { src_port, dst_port }
    }

    /// The key of the opposite direction, i.e. for a reply packet.
    pub fn swapped(&self) -> Self {
        Self {
            src_port: self.dst_port,
            dst_port: self.src_port,
        }
    }
}

/// One recorded service to instance mapping. Both addresses are IPv4
/// in host byte order.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Conversion {
    pub service: u32,
    pub instance: u32,
}

impl Conversion {
    pub fn new(service: u32, instance: u32) -> Self {
        Self { service, instance }
    }
}

/// Fixed size ring of conversions for one port pair. A new conversion
/// always lands after the last written slot and overwrites the oldest one
/// once the ring is full.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConversionRing {
    pub entries: [Conversion; MAX_CONVERSIONS],
    /// Index of the last written slot
    pub last: u8,
    /// Live entries, never above MAX_CONVERSIONS
    pub len: u8,
}

impl Default for ConversionRing {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversionRing {
    pub fn new() -> Self {
        Self {
            entries: [Conversion::default(); MAX_CONVERSIONS],
            // First insert must land on slot 0
            last: (MAX_CONVERSIONS - 1) as u8,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn live(&self) -> &[Conversion] {
        &self.entries[..self.len()]
    }

    /// Returns a copy of this ring with `conv` written into the next slot.
    pub fn with_conversion(&self, conv: Conversion) -> Self {
        let mut ring = *self;
        let next = (ring.last as usize + 1) % MAX_CONVERSIONS;
        ring.entries[next] = conv;
        ring.last = next as u8;
        if ring.len() < MAX_CONVERSIONS {
            ring.len += 1;
        }
        ring
    }

    pub fn find_by_service(&self, service: u32) -> Option<u32> {
        self.live()
            .iter()
            .find(|conv| conv.service == service)
            .map(|conv| conv.instance)
    }

    pub fn find_by_instance(&self, instance: u32) -> Option<u32> {
        self.live()
            .iter()
            .find(|conv| conv.instance == instance)
            .map(|conv| conv.service)
    }
}

/// The instances published by the control plane for one service.
/// Addresses are IPv4 in host byte order.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InstanceList {
    pub len: u32,
    pub addrs: [u32; MAX_INSTANCES],
}

impl Default for InstanceList {
    fn default() -> Self {
        Self {
            len: 0,
            addrs: [0; MAX_INSTANCES],
        }
    }
}

impl InstanceList {
    /// Builds a list from the first MAX_INSTANCES addresses of `addrs`.
    pub fn from_slice(addrs: &[u32]) -> Self {
        let mut list = Self::default();
        let count = addrs.len().min(MAX_INSTANCES);
        list.addrs[..count].copy_from_slice(&addrs[..count]);
        list.len = count as u32;
        list
    }

    pub fn len(&self) -> usize {
        (self.len as usize).min(MAX_INSTANCES)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() == MAX_INSTANCES
    }

    pub fn as_slice(&self) -> &[u32] {
        &self.addrs[..self.len()]
    }

    pub fn contains(&self, addr: u32) -> bool {
        self.as_slice().contains(&addr)
    }

    /// Returns a copy with `addr` stored at slot `len % MAX_INSTANCES`.
    /// A full list keeps its length and overwrites its first slot.
    /// Adding an address already present returns an identical copy.
    pub fn with_instance(&self, addr: u32) -> Self {
        let mut list = *self;
        if list.contains(addr) {
            return list;
        }
        list.addrs[list.len() % MAX_INSTANCES] = addr;
        if !list.is_full() {
            list.len += 1;
        }
        list
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_starts_at_slot_zero() {
        let ring = ConversionRing::new().with_conversion(Conversion::new(1, 10));
        assert_eq!(ring.last, 0);
        assert_eq!(ring.len(), 1);
        assert_eq!(ring.entries[0], Conversion::new(1, 10));
    }

    #[test]
    fn ring_evicts_oldest_when_full() {
        let mut ring = ConversionRing::new();
        for svc in 1..=5 {
            ring = ring.with_conversion(Conversion::new(svc, svc + 100));
        }
        assert_eq!(ring.len(), MAX_CONVERSIONS);
        assert_eq!(ring.last, 0);
        assert_eq!(ring.find_by_service(1), None);
        assert_eq!(ring.find_by_service(5), Some(105));
        assert_eq!(ring.find_by_instance(102), Some(2));
        assert_eq!(ring.find_by_instance(101), None);
    }

    #[test]
    fn ring_copy_leaves_original_untouched() {
        let ring = ConversionRing::new().with_conversion(Conversion::new(1, 10));
        let next = ring.with_conversion(Conversion::new(2, 20));
        assert_eq!(ring.len(), 1);
        assert_eq!(next.len(), 2);
        assert_eq!(ring.find_by_service(2), None);
    }

    #[test]
    fn empty_ring_matches_nothing() {
        let ring = ConversionRing::new();
        // Zeroed slots are not live
        assert_eq!(ring.find_by_service(0), None);
        assert_eq!(ring.find_by_instance(0), None);
    }

    #[test]
    fn instance_list_truncates_and_appends() {
        let addrs: Vec<u32> = (0..40).collect();
        let list = InstanceList::from_slice(&addrs);
        assert_eq!(list.len(), MAX_INSTANCES);
        assert_eq!(list.with_instance(3), list);

        // A full list overwrites slot 0 and keeps its length
        let wrapped = list.with_instance(100);
        assert_eq!(wrapped.len(), MAX_INSTANCES);
        assert_eq!(wrapped.as_slice()[0], 100);
        assert_eq!(wrapped.as_slice()[1..], list.as_slice()[1..]);
        assert_eq!(wrapped.with_instance(101).as_slice()[0], 101);

        let list = InstanceList::from_slice(&[7]);
        assert_eq!(list.with_instance(8).as_slice(), &[7, 8]);
    }

    #[test]
    fn flow_key_swap() {
        let key = FlowKey::new(4000, 8000);
        assert_eq!(key.swapped(), FlowKey::new(8000, 4000));
        assert_eq!(key.swapped().swapped(), key);
    }
}
