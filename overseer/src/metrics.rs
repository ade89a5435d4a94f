use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use prometheus_client::collector::Collector;
use prometheus_client::encoding::{DescriptorEncoder, EncodeMetric};
use prometheus_client::metrics::counter::ConstCounter;
use prometheus_client::metrics::MetricType;
use prometheus_client::registry::Registry;

use crate::cache::{LinkLookup, NameCache, SystemLinks};
use crate::codec::ProbeLayout;
use crate::events::EventCounters;
use crate::flows::{flow_samples, FlowSample, FlowTable, SampleKind};

/// Exports the live flow table, re-read on every scrape.
pub struct FlowCollector<L = SystemLinks> {
    table: Arc<dyn FlowTable>,
    layout: ProbeLayout,
    cache: Arc<NameCache<L>>,
}

impl<L> FlowCollector<L> {
    pub fn new(table: Arc<dyn FlowTable>, layout: ProbeLayout, cache: Arc<NameCache<L>>) -> Self {
        Self {
            table,
            layout,
            cache,
        }
    }
}

impl<L> fmt::Debug for FlowCollector<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowCollector")
            .field("layout", &self.layout)
            .finish_non_exhaustive()
    }
}

fn encode_flow_family(
    encoder: &mut DescriptorEncoder,
    name: &str,
    help: &str,
    samples: &[FlowSample],
) -> Result<(), fmt::Error> {
    let mut family = encoder.encode_descriptor(name, help, None, MetricType::Counter)?;
    for sample in samples {
        let labels = sample.labels.pairs();
        let metric = family.encode_family(&labels)?;
        ConstCounter::new(sample.value).encode(metric)?;
    }
    Ok(())
}

impl<L: LinkLookup + 'static> Collector for FlowCollector<L> {
    fn encode(&self, mut encoder: DescriptorEncoder) -> Result<(), fmt::Error> {
        let (packets, bytes): (Vec<_>, Vec<_>) =
            flow_samples(self.table.as_ref(), self.layout, &self.cache)
                .partition(|s| s.kind == SampleKind::Packets);

        encode_flow_family(
            &mut encoder,
            "overseer_packets",
            "Number of packets seen by overseer",
            &packets,
        )?;
        encode_flow_family(
            &mut encoder,
            "overseer_bytes",
            "Number of bytes seen by overseer",
            &bytes,
        )
    }
}

/// Exports the event consumers' running totals.
#[derive(Debug)]
pub struct EventCollector {
    counters: Arc<EventCounters>,
}

impl EventCollector {
    pub fn new(counters: Arc<EventCounters>) -> Self {
        Self { counters }
    }
}

impl Collector for EventCollector {
    fn encode(&self, mut encoder: DescriptorEncoder) -> Result<(), fmt::Error> {
        let c = &self.counters;
        {
            let mut family = encoder.encode_descriptor(
                "overseer_flow_events",
                "Flow events read from the probe, by kind",
                None,
                MetricType::Counter,
            )?;
            for (kind, counter) in [
                ("new", &c.new),
                ("fail", &c.fail),
                ("message", &c.message),
                ("unknown", &c.unknown),
            ] {
                let labels = [("kind", kind)];
                let metric = family.encode_family(&labels)?;
                ConstCounter::new(counter.load(Ordering::Relaxed)).encode(metric)?;
            }
        }

        for (name, help, value) in [
            (
                "overseer_malformed_records",
                "Event records dropped because they could not be decoded",
                c.malformed.load(Ordering::Relaxed),
            ),
            (
                "overseer_lost_samples",
                "Event records the kernel dropped before they were read",
                c.lost.load(Ordering::Relaxed),
            ),
        ] {
            let metric = encoder.encode_descriptor(name, help, None, MetricType::Counter)?;
            ConstCounter::new(value).encode(metric)?;
        }
        Ok(())
    }
}

pub fn registry<L: LinkLookup + 'static>(
    flows: FlowCollector<L>,
    events: Arc<EventCounters>,
) -> Registry {
    let mut registry = Registry::default();
    registry.register_collector(Box::new(flows));
    registry.register_collector(Box::new(EventCollector::new(events)));
    registry
}
