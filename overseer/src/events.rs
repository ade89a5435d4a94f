//! Consumption of the probe's event stream.
//!
//! The probe writes fixed-size records into a per-CPU perf event array. One
//! [`EventConsumer`] drains one CPU buffer. Lost samples mean the kernel side
//! overran us and the event view is no longer trustworthy, so the consumer
//! stops and takes its siblings down with it.

use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use aya::maps::perf::{AsyncPerfEventArray, AsyncPerfEventArrayBuffer, PerfBufferError};
use aya::maps::{Map, MapData, MapError};
use bytes::BytesMut;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::codec::{decode_event, EventKind, EventPayload, FlowEvent, ProbeLayout};

/// Upper bound on a single wait for records, so cancellation is noticed on an
/// idle stream.
pub const READ_DEADLINE: Duration = Duration::from_secs(1);

/// Records drained per read call.
const READ_BATCH: usize = 16;

#[derive(Error, Debug)]
pub enum OpenError {
    #[error("EVENTS is not a perf event array: {0}")]
    Map(#[from] MapError),
    #[error("failed to list online CPUs: {0}")]
    Cpus(#[source] io::Error),
    #[error("failed to open perf buffer for cpu {cpu}: {source}")]
    Buffer {
        cpu: u32,
        #[source]
        source: PerfBufferError,
    },
}

/// Open one buffer per online CPU. The returned buffers keep the map open;
/// the array handle itself is released on return.
pub fn open_event_buffers(
    events: Map,
    pages: Option<usize>,
) -> Result<Vec<(u32, AsyncPerfEventArrayBuffer<MapData>)>, OpenError> {
    let mut array = AsyncPerfEventArray::try_from(events)?;
    let cpus = aya::util::online_cpus().map_err(|(_, e)| OpenError::Cpus(e))?;
    cpus.into_iter()
        .map(|cpu| {
            array
                .open(cpu, pages)
                .map(|buf| (cpu, buf))
                .map_err(|source| OpenError::Buffer { cpu, source })
        })
        .collect()
}

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("perf buffer read failed: {0}")]
    Perf(#[from] PerfBufferError),
    #[error("event stream read failed: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReadOutcome {
    /// Number of leading `buffers` filled with a record.
    pub read: usize,
    /// Records the kernel dropped since the previous read.
    pub lost: usize,
}

/// A bounded, lossy stream of raw event records.
pub trait RecordSource: Send {
    /// Wait for records and copy up to `buffers.len()` of them into
    /// `buffers`.
    fn read_records(
        &mut self,
        buffers: &mut [BytesMut],
    ) -> impl Future<Output = Result<ReadOutcome, StreamError>> + Send;
}

impl RecordSource for AsyncPerfEventArrayBuffer<MapData> {
    async fn read_records(&mut self, buffers: &mut [BytesMut]) -> Result<ReadOutcome, StreamError> {
        let events = self.read_events(buffers).await?;
        Ok(ReadOutcome {
            read: events.read,
            lost: events.lost,
        })
    }
}

/// Why a consumer stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerExit {
    Cancelled,
    SamplesLost(usize),
}

/// Running totals of what the consumers have seen.
#[derive(Debug, Default)]
pub struct EventCounters {
    pub new: AtomicU64,
    pub fail: AtomicU64,
    pub message: AtomicU64,
    pub unknown: AtomicU64,
    pub malformed: AtomicU64,
    pub lost: AtomicU64,
}

impl EventCounters {
    fn record(&self, event: &FlowEvent) {
        let counter = match event.payload {
            EventPayload::Kind(EventKind::New) => &self.new,
            EventPayload::Kind(EventKind::Fail) => &self.fail,
            EventPayload::Kind(EventKind::Unknown(_)) => &self.unknown,
            EventPayload::Message(_) => &self.message,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

pub struct EventConsumer<S> {
    source: S,
    layout: ProbeLayout,
    counters: Arc<EventCounters>,
    label: String,
}

impl<S: RecordSource> EventConsumer<S> {
    pub fn new(
        source: S,
        layout: ProbeLayout,
        counters: Arc<EventCounters>,
        label: impl Into<String>,
    ) -> Self {
        Self {
            source,
            layout,
            counters,
            label: label.into(),
        }
    }

    /// Poll until `cancel` fires or samples are lost. A loss cancels `cancel`
    /// so every consumer sharing it stops as well.
    pub async fn run(mut self, cancel: CancellationToken) -> ConsumerExit {
        let record_size = self.layout.event_size();
        let mut buffers: Vec<BytesMut> = (0..READ_BATCH)
            .map(|_| BytesMut::with_capacity(record_size))
            .collect();

        tracing::info!(source = %self.label, "starting to read flow events");
        loop {
            if cancel.is_cancelled() {
                return ConsumerExit::Cancelled;
            }

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return ConsumerExit::Cancelled,
                res = tokio::time::timeout(READ_DEADLINE, self.source.read_records(&mut buffers)) => res,
            };

            let outcome = match outcome {
                Err(_elapsed) => continue,
                Ok(Err(e)) => {
                    tracing::warn!(source = %self.label, error = %e, "failed to read flow event");
                    continue;
                }
                Ok(Ok(outcome)) => outcome,
            };

            for buf in buffers.iter_mut().take(outcome.read) {
                self.handle_record(buf);
                buf.clear();
            }

            if outcome.lost != 0 {
                self.counters
                    .lost
                    .fetch_add(outcome.lost as u64, Ordering::Relaxed);
                tracing::error!(
                    source = %self.label,
                    lost = outcome.lost,
                    "lost flow event samples, stopping event consumer"
                );
                cancel.cancel();
                return ConsumerExit::SamplesLost(outcome.lost);
            }
        }
    }

    fn handle_record(&self, record: &[u8]) {
        if record.len() != self.layout.event_size() {
            tracing::warn!(
                source = %self.label,
                got = record.len(),
                expected = self.layout.event_size(),
                "invalid sample size"
            );
            self.counters.malformed.fetch_add(1, Ordering::Relaxed);
            return;
        }

        match decode_event(self.layout, record) {
            Ok(event) => {
                self.counters.record(&event);
                match &event.payload {
                    EventPayload::Kind(kind) => tracing::info!("{kind}: {}", event.key),
                    EventPayload::Message(msg) => tracing::info!("{}: {msg}", event.key),
                }
            }
            Err(e) => {
                tracing::warn!(source = %self.label, error = %e, "failed to decode flow event");
                self.counters.malformed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::tests::key_bytes;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    enum Step {
        Records { records: Vec<Vec<u8>>, lost: usize },
        Fail,
        /// Never completes; exercises the read deadline.
        Stall,
    }

    struct Scripted {
        steps: VecDeque<Step>,
        reads: Arc<AtomicUsize>,
    }

    impl Scripted {
        fn new(steps: Vec<Step>) -> (Self, Arc<AtomicUsize>) {
            let reads = Arc::new(AtomicUsize::new(0));
            (
                Self {
                    steps: steps.into(),
                    reads: reads.clone(),
                },
                reads,
            )
        }
    }

    impl RecordSource for Scripted {
        async fn read_records(
            &mut self,
            buffers: &mut [BytesMut],
        ) -> Result<ReadOutcome, StreamError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            match self.steps.pop_front() {
                Some(Step::Records { records, lost }) => {
                    for (buf, rec) in buffers.iter_mut().zip(records.iter()) {
                        buf.extend_from_slice(rec);
                    }
                    Ok(ReadOutcome {
                        read: records.len().min(buffers.len()),
                        lost,
                    })
                }
                Some(Step::Fail) => Err(StreamError::Io(std::io::Error::other("boom"))),
                Some(Step::Stall) | None => std::future::pending().await,
            }
        }
    }

    fn event(kind: u8) -> Vec<u8> {
        let mut rec = key_bytes(
            ProbeLayout::Directional,
            [10, 0, 0, 1],
            [2, 0, 0, 0, 0, 1],
            4,
            0,
        );
        rec.extend_from_slice(&[kind, 0, 0, 0]);
        rec
    }

    fn consumer(source: Scripted) -> (EventConsumer<Scripted>, Arc<EventCounters>) {
        let counters = Arc::new(EventCounters::default());
        (
            EventConsumer::new(source, ProbeLayout::Directional, counters.clone(), "test"),
            counters,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn lost_samples_stop_the_consumer() {
        let (source, reads) = Scripted::new(vec![
            Step::Records {
                records: vec![event(0)],
                lost: 0,
            },
            Step::Records {
                records: vec![event(1)],
                lost: 3,
            },
            Step::Records {
                records: vec![event(0)],
                lost: 0,
            },
        ]);
        let (consumer, counters) = consumer(source);
        let cancel = CancellationToken::new();

        let exit = consumer.run(cancel.clone()).await;
        assert_eq!(exit, ConsumerExit::SamplesLost(3));
        assert_eq!(reads.load(Ordering::SeqCst), 2);
        assert!(cancel.is_cancelled());
        assert_eq!(counters.new.load(Ordering::Relaxed), 1);
        assert_eq!(counters.fail.load(Ordering::Relaxed), 1);
        assert_eq!(counters.lost.load(Ordering::Relaxed), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_records_are_dropped() {
        let (source, _) = Scripted::new(vec![
            Step::Records {
                records: vec![vec![0u8; 7], event(0), event(9)],
                lost: 0,
            },
            Step::Records {
                records: vec![],
                lost: 1,
            },
        ]);
        let (consumer, counters) = consumer(source);

        let exit = consumer.run(CancellationToken::new()).await;
        assert_eq!(exit, ConsumerExit::SamplesLost(1));
        assert_eq!(counters.malformed.load(Ordering::Relaxed), 1);
        assert_eq!(counters.new.load(Ordering::Relaxed), 1);
        assert_eq!(counters.unknown.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn read_errors_do_not_stop_the_consumer() {
        let (source, reads) = Scripted::new(vec![
            Step::Fail,
            Step::Records {
                records: vec![event(0)],
                lost: 2,
            },
        ]);
        let (consumer, _) = consumer(source);
        assert_eq!(
            consumer.run(CancellationToken::new()).await,
            ConsumerExit::SamplesLost(2)
        );
        assert_eq!(reads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_stream_retries_until_cancelled() {
        let (source, reads) = Scripted::new(vec![Step::Stall, Step::Stall, Step::Stall]);
        let (consumer, _) = consumer(source);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(consumer.run(cancel.clone()));
        tokio::time::sleep(READ_DEADLINE * 2 + Duration::from_millis(500)).await;
        assert_eq!(reads.load(Ordering::SeqCst), 3);

        cancel.cancel();
        assert_eq!(task.await.unwrap(), ConsumerExit::Cancelled);
    }

    #[tokio::test]
    async fn already_cancelled_returns_immediately() {
        let (source, reads) = Scripted::new(vec![]);
        let (consumer, _) = consumer(source);
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(consumer.run(cancel).await, ConsumerExit::Cancelled);
        assert_eq!(reads.load(Ordering::SeqCst), 0);
    }
}
