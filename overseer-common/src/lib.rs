#![no_std]

/// Traffic direction as recorded by the TC classifiers.
pub const DIRECTION_INGRESS: u32 = 0;
pub const DIRECTION_EGRESS: u32 = 1;

/// Event kinds carried in [`FlowEvent::kind`].
pub const EVENT_NEW: u8 = 0;
pub const EVENT_FAIL: u8 = 1;

/// Key of the `STATS` hash map for the directional probe.
///
/// Multi-byte integers other than `addr` are stored in host byte order: the
/// map is a raw memory view shared with the kernel, not a wire format.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub struct FlowKey {
    /// Source IPv4 address in network byte order.
    pub addr: [u8; 4],
    pub ifindex: u32,
    /// Source hardware address.
    pub mac: [u8; 6],
    pub _pad: [u8; 2],
    pub direction: u32,
}

/// Running counters for one [`FlowKey`].
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FlowValue {
    pub packets: u64,
    pub bytes: u64,
    /// Wall-clock nanoseconds of the most recent packet.
    pub last_seen_ns: u64,
}

/// Record pushed to the `EVENTS` perf array when a flow is admitted or
/// rejected.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FlowEvent {
    pub key: FlowKey,
    pub kind: u8,
    pub _pad: [u8; 3],
}

#[cfg(feature = "user")]
mod user_impls {
    extern crate aya;

    use super::{FlowEvent, FlowKey, FlowValue};

    unsafe impl aya::Pod for FlowKey {}
    unsafe impl aya::Pod for FlowValue {}
    unsafe impl aya::Pod for FlowEvent {}
}
