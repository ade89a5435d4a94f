//! Fixed-layout decoding of the records the probe writes into its maps.
//!
//! Records are raw copies of kernel structs, so integers other than the IPv4
//! address are read in host byte order. Producer and consumer must share
//! endianness.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;

/// Record layout of the active probe build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ProbeLayout {
    /// `{ip, mac}` keys, packet/byte counters, text events.
    Basic,
    /// Adds the interface index to keys and a last-seen timestamp to values.
    Linked,
    /// Adds the traffic direction to keys; events carry an event kind.
    Directional,
    /// Linked key with a one-byte direction in its padding; events carry an
    /// event kind.
    Compact,
}

const MESSAGE_LEN: usize = 128;

impl ProbeLayout {
    pub const fn key_size(self) -> usize {
        match self {
            ProbeLayout::Basic => 12,
            ProbeLayout::Linked | ProbeLayout::Compact => 16,
            ProbeLayout::Directional => 20,
        }
    }

    pub const fn value_size(self) -> usize {
        match self {
            ProbeLayout::Basic => 16,
            ProbeLayout::Linked | ProbeLayout::Directional | ProbeLayout::Compact => 24,
        }
    }

    /// Size of one record on the event stream.
    pub const fn event_size(self) -> usize {
        match self {
            ProbeLayout::Basic => 12 + MESSAGE_LEN,
            ProbeLayout::Linked => 16 + MESSAGE_LEN + 4,
            ProbeLayout::Directional => 20 + 4,
            ProbeLayout::Compact => 16 + 4,
        }
    }

    pub const fn has_direction(self) -> bool {
        matches!(self, ProbeLayout::Directional | ProbeLayout::Compact)
    }
}

impl fmt::Display for ProbeLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProbeLayout::Basic => "basic",
            ProbeLayout::Linked => "linked",
            ProbeLayout::Directional => "directional",
            ProbeLayout::Compact => "compact",
        })
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("{record} record: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        record: &'static str,
        expected: usize,
        actual: usize,
    },
}

fn check_len(record: &'static str, expected: usize, data: &[u8]) -> Result<(), DecodeError> {
    if data.len() != expected {
        return Err(DecodeError::SizeMismatch {
            record,
            expected,
            actual: data.len(),
        });
    }
    Ok(())
}

// ── Field types ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Ingress,
    Egress,
    #[value(skip)]
    #[serde(skip)]
    Unknown(u32),
}

impl Direction {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            overseer_common::DIRECTION_INGRESS => Direction::Ingress,
            overseer_common::DIRECTION_EGRESS => Direction::Egress,
            other => Direction::Unknown(other),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Ingress => "ingress",
            Direction::Egress => "egress",
            Direction::Unknown(_) => "unknown",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hardware address, kept in wire order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MacAddr(pub [u8; 6]);

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid hardware address {0:?}")]
pub struct ParseMacError(pub String);

impl FromStr for MacAddr {
    type Err = ParseMacError;

    /// Accepts six hex pairs separated by `:` or `-`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseMacError(s.to_string());
        let sep = if s.contains('-') { '-' } else { ':' };
        let mut octets = [0u8; 6];
        let mut parts = s.split(sep);
        for octet in octets.iter_mut() {
            let part = parts.next().ok_or_else(err)?;
            if part.len() != 2 {
                return Err(err());
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| err())?;
        }
        if parts.next().is_some() {
            return Err(err());
        }
        Ok(MacAddr(octets))
    }
}

// ── Records ───────────────────────────────────────────────────────────────────

/// Identity of a flow. Fields the active layout does not carry are `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub ip: Ipv4Addr,
    pub mac: MacAddr,
    pub ifindex: Option<u32>,
    pub direction: Option<Direction>,
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ip:{} macaddr:{}", self.ip, self.mac)?;
        if let Some(ifindex) = self.ifindex {
            write!(f, " ifindex:{ifindex}")?;
        }
        if let Some(direction) = self.direction {
            write!(f, " direction:{direction}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowValue {
    pub packets: u64,
    pub bytes: u64,
    /// `None` when the layout has no timestamp or the probe never set one.
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    New,
    Fail,
    Unknown(u8),
}

impl EventKind {
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            overseer_common::EVENT_NEW => EventKind::New,
            overseer_common::EVENT_FAIL => EventKind::Fail,
            other => EventKind::Unknown(other),
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::New => f.write_str("NEW"),
            EventKind::Fail => f.write_str("FAIL"),
            EventKind::Unknown(raw) => write!(f, "UNKNOWN({raw})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventPayload {
    /// Diagnostic text from the basic and linked probes.
    Message(String),
    Kind(EventKind),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowEvent {
    pub key: FlowKey,
    pub payload: EventPayload,
}

// ── Decoding ──────────────────────────────────────────────────────────────────

fn u32_at(data: &[u8], offset: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&data[offset..offset + 4]);
    u32::from_ne_bytes(raw)
}

fn u64_at(data: &[u8], offset: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&data[offset..offset + 8]);
    u64::from_ne_bytes(raw)
}

fn mac_at(data: &[u8], offset: usize) -> MacAddr {
    let mut raw = [0u8; 6];
    raw.copy_from_slice(&data[offset..offset + 6]);
    MacAddr(raw)
}

pub fn decode_key(layout: ProbeLayout, data: &[u8]) -> Result<FlowKey, DecodeError> {
    check_len("key", layout.key_size(), data)?;

    let ip = Ipv4Addr::new(data[0], data[1], data[2], data[3]);
    let key = match layout {
        ProbeLayout::Basic => FlowKey {
            ip,
            mac: mac_at(data, 4),
            ifindex: None,
            direction: None,
        },
        ProbeLayout::Linked => FlowKey {
            ip,
            mac: mac_at(data, 8),
            ifindex: Some(u32_at(data, 4)),
            direction: None,
        },
        ProbeLayout::Directional => FlowKey {
            ip,
            mac: mac_at(data, 8),
            ifindex: Some(u32_at(data, 4)),
            direction: Some(Direction::from_raw(u32_at(data, 16))),
        },
        ProbeLayout::Compact => FlowKey {
            ip,
            mac: mac_at(data, 8),
            ifindex: Some(u32_at(data, 4)),
            direction: Some(Direction::from_raw(u32::from(data[14]))),
        },
    };
    Ok(key)
}

pub fn decode_value(layout: ProbeLayout, data: &[u8]) -> Result<FlowValue, DecodeError> {
    check_len("value", layout.value_size(), data)?;

    let last_seen = if layout.value_size() == 24 {
        timestamp_from_nanos(u64_at(data, 16))
    } else {
        None
    };
    Ok(FlowValue {
        packets: u64_at(data, 0),
        bytes: u64_at(data, 8),
        last_seen,
    })
}

/// Decode one event-stream record: a key followed by the layout's tail.
pub fn decode_event(layout: ProbeLayout, data: &[u8]) -> Result<FlowEvent, DecodeError> {
    check_len("event", layout.event_size(), data)?;

    let (key_bytes, tail) = data.split_at(layout.key_size());
    let key = decode_key(layout, key_bytes)?;
    let payload = match layout {
        ProbeLayout::Basic | ProbeLayout::Linked => {
            let msg = &tail[..MESSAGE_LEN];
            let end = msg.iter().position(|&b| b == 0).unwrap_or(msg.len());
            EventPayload::Message(String::from_utf8_lossy(&msg[..end]).into_owned())
        }
        ProbeLayout::Directional | ProbeLayout::Compact => {
            EventPayload::Kind(EventKind::from_raw(tail[0]))
        }
    };
    Ok(FlowEvent { key, payload })
}

fn timestamp_from_nanos(ns: u64) -> Option<DateTime<Utc>> {
    if ns == 0 {
        return None;
    }
    let ns = i64::try_from(ns).ok()?;
    Some(DateTime::from_timestamp_nanos(ns))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Build a key buffer the way the probe lays it out in memory.
    pub(crate) fn key_bytes(
        layout: ProbeLayout,
        ip: [u8; 4],
        mac: [u8; 6],
        ifindex: u32,
        direction: u32,
    ) -> Vec<u8> {
        let mut buf = Vec::with_capacity(layout.key_size());
        buf.extend_from_slice(&ip);
        match layout {
            ProbeLayout::Basic => {
                buf.extend_from_slice(&mac);
                buf.extend_from_slice(&[0; 2]);
            }
            ProbeLayout::Linked => {
                buf.extend_from_slice(&ifindex.to_ne_bytes());
                buf.extend_from_slice(&mac);
                buf.extend_from_slice(&[0; 2]);
            }
            ProbeLayout::Directional => {
                buf.extend_from_slice(&ifindex.to_ne_bytes());
                buf.extend_from_slice(&mac);
                buf.extend_from_slice(&[0; 2]);
                buf.extend_from_slice(&direction.to_ne_bytes());
            }
            ProbeLayout::Compact => {
                buf.extend_from_slice(&ifindex.to_ne_bytes());
                buf.extend_from_slice(&mac);
                buf.extend_from_slice(&[direction as u8, 0]);
            }
        }
        buf
    }

    pub(crate) fn value_bytes(layout: ProbeLayout, packets: u64, bytes: u64, ts: u64) -> Vec<u8> {
        let mut buf = Vec::with_capacity(layout.value_size());
        buf.extend_from_slice(&packets.to_ne_bytes());
        buf.extend_from_slice(&bytes.to_ne_bytes());
        if layout.value_size() == 24 {
            buf.extend_from_slice(&ts.to_ne_bytes());
        }
        buf
    }

    const MAC: [u8; 6] = [0xaa, 0xbb, 0xcc, 0x01, 0x02, 0x03];

    #[test]
    fn decodes_directional_key() {
        let buf = key_bytes(ProbeLayout::Directional, [10, 0, 0, 7], MAC, 3, 1);
        let key = decode_key(ProbeLayout::Directional, &buf).unwrap();
        assert_eq!(
            key,
            FlowKey {
                ip: Ipv4Addr::new(10, 0, 0, 7),
                mac: MacAddr(MAC),
                ifindex: Some(3),
                direction: Some(Direction::Egress),
            }
        );
    }

    #[test]
    fn decodes_linked_and_basic_keys() {
        let linked = key_bytes(ProbeLayout::Linked, [192, 168, 1, 20], MAC, 42, 0);
        let key = decode_key(ProbeLayout::Linked, &linked).unwrap();
        assert_eq!(key.ip, Ipv4Addr::new(192, 168, 1, 20));
        assert_eq!(key.mac, MacAddr(MAC));
        assert_eq!(key.ifindex, Some(42));
        assert_eq!(key.direction, None);

        let basic = key_bytes(ProbeLayout::Basic, [172, 16, 0, 1], MAC, 0, 0);
        let key = decode_key(ProbeLayout::Basic, &basic).unwrap();
        assert_eq!(key.ip, Ipv4Addr::new(172, 16, 0, 1));
        assert_eq!(key.mac, MacAddr(MAC));
        assert_eq!(key.ifindex, None);
    }

    #[test]
    fn decodes_compact_key_direction_byte() {
        let ingress = key_bytes(ProbeLayout::Compact, [10, 0, 0, 7], MAC, 3, 0);
        let egress = key_bytes(ProbeLayout::Compact, [10, 0, 0, 7], MAC, 3, 1);
        assert_eq!(ingress.len(), 16);
        assert_eq!(egress[14], 1);

        let key = decode_key(ProbeLayout::Compact, &egress).unwrap();
        assert_eq!(
            key,
            FlowKey {
                ip: Ipv4Addr::new(10, 0, 0, 7),
                mac: MacAddr(MAC),
                ifindex: Some(3),
                direction: Some(Direction::Egress),
            }
        );
        let key = decode_key(ProbeLayout::Compact, &ingress).unwrap();
        assert_eq!(key.direction, Some(Direction::Ingress));

        // The same bytes read as a linked key lose the direction.
        assert_eq!(decode_key(ProbeLayout::Linked, &egress).unwrap().direction, None);
    }

    #[test]
    fn decodes_compact_event() {
        let mut buf = key_bytes(ProbeLayout::Compact, [10, 1, 1, 1], MAC, 2, 1);
        buf.extend_from_slice(&[overseer_common::EVENT_NEW, 0, 0, 0]);
        assert_eq!(buf.len(), ProbeLayout::Compact.event_size());

        let event = decode_event(ProbeLayout::Compact, &buf).unwrap();
        assert_eq!(event.payload, EventPayload::Kind(EventKind::New));
        assert_eq!(event.key.direction, Some(Direction::Egress));
        assert_eq!(event.key.ifindex, Some(2));
    }

    #[test]
    fn unknown_direction_is_preserved() {
        let buf = key_bytes(ProbeLayout::Directional, [1, 2, 3, 4], MAC, 1, 9);
        let key = decode_key(ProbeLayout::Directional, &buf).unwrap();
        assert_eq!(key.direction, Some(Direction::Unknown(9)));
        assert_eq!(key.direction.unwrap().to_string(), "unknown");
    }

    #[test]
    fn any_other_length_is_a_size_mismatch() {
        for layout in [
            ProbeLayout::Basic,
            ProbeLayout::Linked,
            ProbeLayout::Directional,
            ProbeLayout::Compact,
        ] {
            for len in [0, layout.key_size() - 1, layout.key_size() + 1, 64] {
                let err = decode_key(layout, &vec![0u8; len]).unwrap_err();
                assert_eq!(
                    err,
                    DecodeError::SizeMismatch {
                        record: "key",
                        expected: layout.key_size(),
                        actual: len,
                    }
                );
            }
            assert!(decode_value(layout, &[0u8; 8]).is_err());
            assert!(decode_event(layout, &[0u8; 3]).is_err());
        }
    }

    #[test]
    fn decodes_value_with_timestamp() {
        let ts = 1_700_000_000_123_456_789u64;
        let buf = value_bytes(ProbeLayout::Linked, 12, 3400, ts);
        let value = decode_value(ProbeLayout::Linked, &buf).unwrap();
        assert_eq!(value.packets, 12);
        assert_eq!(value.bytes, 3400);
        let seen = value.last_seen.unwrap();
        assert_eq!(seen.timestamp(), 1_700_000_000);
        assert_eq!(seen.timestamp_subsec_nanos(), 123_456_789);
    }

    #[test]
    fn basic_value_has_no_timestamp() {
        let buf = value_bytes(ProbeLayout::Basic, 1, 60, 0);
        let value = decode_value(ProbeLayout::Basic, &buf).unwrap();
        assert_eq!(value.packets, 1);
        assert_eq!(value.bytes, 60);
        assert_eq!(value.last_seen, None);
    }

    #[test]
    fn decodes_kind_event() {
        let mut buf = key_bytes(ProbeLayout::Directional, [10, 1, 1, 1], MAC, 2, 0);
        buf.extend_from_slice(&[overseer_common::EVENT_FAIL, 0, 0, 0]);
        let event = decode_event(ProbeLayout::Directional, &buf).unwrap();
        assert_eq!(event.payload, EventPayload::Kind(EventKind::Fail));
        assert_eq!(event.key.ifindex, Some(2));
    }

    #[test]
    fn decodes_message_event() {
        let mut buf = key_bytes(ProbeLayout::Linked, [10, 1, 1, 1], MAC, 2, 0);
        let mut msg = [0u8; 132];
        msg[..15].copy_from_slice(b"Handling packet");
        buf.extend_from_slice(&msg);
        let event = decode_event(ProbeLayout::Linked, &buf).unwrap();
        assert_eq!(event.payload, EventPayload::Message("Handling packet".into()));
    }

    #[test]
    fn mac_parsing_and_display() {
        let mac: MacAddr = "AA:BB:CC:01:02:03".parse().unwrap();
        assert_eq!(mac, MacAddr(MAC));
        assert_eq!(mac.to_string(), "aa:bb:cc:01:02:03");
        assert_eq!("aa-bb-cc-01-02-03".parse::<MacAddr>().unwrap(), mac);
        assert!("aa:bb:cc:01:02".parse::<MacAddr>().is_err());
        assert!("aa:bb:cc:01:02:03:04".parse::<MacAddr>().is_err());
        assert!("zz:bb:cc:01:02:03".parse::<MacAddr>().is_err());
    }

    #[test]
    fn shared_structs_match_directional_layout() {
        use core::mem::size_of;
        let layout = ProbeLayout::Directional;
        assert_eq!(size_of::<overseer_common::FlowKey>(), layout.key_size());
        assert_eq!(size_of::<overseer_common::FlowValue>(), layout.value_size());
        assert_eq!(size_of::<overseer_common::FlowEvent>(), layout.event_size());
    }
}
