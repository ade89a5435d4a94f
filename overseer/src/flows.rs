//! Snapshots of the probe's live `STATS` table.
//!
//! Every snapshot walks the kernel map afresh. The probe keeps writing while
//! we iterate, so counters may move mid-walk; nothing here assumes a
//! consistent global view.

use std::fmt::Write as _;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use aya::maps::{HashMap as BpfHashMap, MapData, MapError};
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::cache::{LinkLookup, NameCache};
use crate::codec::{decode_key, decode_value, FlowKey, FlowValue, ProbeLayout};

/// One undecoded `(key, value)` row.
pub type RawRow = (Vec<u8>, Vec<u8>);

#[derive(Error, Debug)]
pub enum TableError {
    #[error("stats map iteration failed: {0}")]
    Map(#[from] MapError),
    #[error("stats map iteration failed: {0}")]
    Other(String),
}

/// An iterable key→value table owned by someone else.
pub trait FlowTable: Send + Sync {
    fn rows(&self) -> Box<dyn Iterator<Item = Result<RawRow, TableError>> + '_>;
}

/// The probe's `STATS` hash map, typed by the active layout's record sizes.
pub enum StatsMap {
    Basic(BpfHashMap<MapData, [u8; 12], [u8; 16]>),
    Linked(BpfHashMap<MapData, [u8; 16], [u8; 24]>),
    Directional(BpfHashMap<MapData, [u8; 20], [u8; 24]>),
    Compact(BpfHashMap<MapData, [u8; 16], [u8; 24]>),
}

impl StatsMap {
    pub fn new(layout: ProbeLayout, map: aya::maps::Map) -> Result<Self, MapError> {
        Ok(match layout {
            ProbeLayout::Basic => StatsMap::Basic(BpfHashMap::try_from(map)?),
            ProbeLayout::Linked => StatsMap::Linked(BpfHashMap::try_from(map)?),
            ProbeLayout::Directional => StatsMap::Directional(BpfHashMap::try_from(map)?),
            ProbeLayout::Compact => StatsMap::Compact(BpfHashMap::try_from(map)?),
        })
    }
}

fn raw_rows<'a, const K: usize, const V: usize>(
    map: &'a BpfHashMap<MapData, [u8; K], [u8; V]>,
) -> Box<dyn Iterator<Item = Result<RawRow, TableError>> + 'a> {
    Box::new(
        map.iter()
            .map(|row| row.map(|(k, v)| (k.to_vec(), v.to_vec())).map_err(TableError::from)),
    )
}

impl FlowTable for StatsMap {
    fn rows(&self) -> Box<dyn Iterator<Item = Result<RawRow, TableError>> + '_> {
        match self {
            StatsMap::Basic(map) => raw_rows(map),
            StatsMap::Linked(map) => raw_rows(map),
            StatsMap::Directional(map) => raw_rows(map),
            StatsMap::Compact(map) => raw_rows(map),
        }
    }
}

/// Lazily decoded view of one pass over a [`FlowTable`].
///
/// An iteration error is logged and ends the snapshot; rows that fail to
/// decode are logged and skipped.
pub struct FlowSnapshot<'a> {
    rows: Box<dyn Iterator<Item = Result<RawRow, TableError>> + 'a>,
    layout: ProbeLayout,
    done: bool,
}

impl<'a> FlowSnapshot<'a> {
    pub fn new(table: &'a dyn FlowTable, layout: ProbeLayout) -> Self {
        Self {
            rows: table.rows(),
            layout,
            done: false,
        }
    }
}

impl Iterator for FlowSnapshot<'_> {
    type Item = (FlowKey, FlowValue);

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            match self.rows.next()? {
                Ok((k, v)) => {
                    let decoded = decode_key(self.layout, &k)
                        .and_then(|key| Ok((key, decode_value(self.layout, &v)?)));
                    match decoded {
                        Ok(row) => return Some(row),
                        Err(e) => tracing::warn!(error = %e, "skipping undecodable stats row"),
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "aborting stats snapshot");
                    self.done = true;
                }
            }
        }
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleKind {
    Packets,
    Bytes,
}

/// Labels attached to both samples of a flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowLabels {
    pub macaddr: String,
    pub ip: Ipv4Addr,
    pub device: Option<String>,
    pub hostname: Option<String>,
    pub direction: Option<&'static str>,
}

impl FlowLabels {
    pub fn resolve<L: LinkLookup>(key: &FlowKey, cache: &NameCache<L>) -> Self {
        let macaddr = key.mac.to_string();
        Self {
            hostname: cache.lease_name(&macaddr),
            macaddr,
            ip: key.ip,
            device: key.ifindex.map(|idx| cache.device_name(idx)),
            direction: key.direction.map(|d| d.as_str()),
        }
    }

    /// Label pairs in exposition order, absent labels omitted.
    pub fn pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            ("macaddr", self.macaddr.clone()),
            ("ip", self.ip.to_string()),
        ];
        if let Some(device) = &self.device {
            pairs.push(("device", device.clone()));
        }
        if let Some(hostname) = &self.hostname {
            pairs.push(("hostname", hostname.clone()));
        }
        if let Some(direction) = self.direction {
            pairs.push(("direction", direction.to_string()));
        }
        pairs
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowSample {
    pub kind: SampleKind,
    pub labels: Arc<FlowLabels>,
    pub value: u64,
}

/// Two samples per live flow, packets first, in table order.
pub fn flow_samples<'a, L: LinkLookup + 'a>(
    table: &'a dyn FlowTable,
    layout: ProbeLayout,
    cache: &'a NameCache<L>,
) -> impl Iterator<Item = FlowSample> + 'a {
    FlowSnapshot::new(table, layout).flat_map(move |(key, value)| {
        let labels = Arc::new(FlowLabels::resolve(&key, cache));
        [
            FlowSample {
                kind: SampleKind::Packets,
                labels: labels.clone(),
                value: value.packets,
            },
            FlowSample {
                kind: SampleKind::Bytes,
                labels,
                value: value.bytes,
            },
        ]
    })
}

/// One console line for a flow.
pub fn render_flow<L: LinkLookup>(
    key: &FlowKey,
    value: &FlowValue,
    cache: &NameCache<L>,
    now: DateTime<Utc>,
) -> String {
    let labels = FlowLabels::resolve(key, cache);
    let mut line = format!("{} {}", labels.ip, labels.macaddr);
    if let Some(device) = &labels.device {
        let _ = write!(line, "@{device}");
    }
    if let Some(hostname) = &labels.hostname {
        let _ = write!(line, " ({hostname})");
    }
    if let Some(direction) = labels.direction {
        let _ = write!(line, " {direction}");
    }
    let _ = write!(line, " pkts:{} bytes:{}", value.packets, value.bytes);
    if let Some(seen) = value.last_seen {
        let ago = (now - seen).to_std().unwrap_or_default();
        let _ = write!(line, " last_seen:{:.1}s ago", ago.as_secs_f64());
    }
    line
}

/// Log every live flow each `every` until `cancel` fires.
pub async fn print_stats<L: LinkLookup>(
    table: Arc<dyn FlowTable>,
    layout: ProbeLayout,
    cache: Arc<NameCache<L>>,
    every: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(every);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                let now = Utc::now();
                let mut flows = 0usize;
                tracing::info!("Stats:");
                for (key, value) in FlowSnapshot::new(table.as_ref(), layout) {
                    tracing::info!("{}", render_flow(&key, &value, &cache, now));
                    flows += 1;
                }
                tracing::debug!(flows, "stats printed");
            }
        }
    }
}
