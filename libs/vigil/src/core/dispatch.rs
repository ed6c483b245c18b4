// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! The dispatcher: drains the ring and fans each unit out to the sinks.
//!
//! Delivery is synchronous and serialized: every sink's `on_frame` runs on
//! this thread, in declaration order. A slow sink backs pressure onto the
//! ring (oldest-drop), never onto the input. Frame units pass through the
//! per-sink stream filter; Event units are delivered to every sink so a
//! filtering sink still observes the metadata it may need.

use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::core::envelope::{classify, Unit};
use crate::core::pubsub::{topics, EventBus, PipelineEvent};
use crate::core::ring::{FrameRing, PopOutcome};
use crate::core::stage::StageHandle;

/// A sink slot: the handle plus its admission filter and its position in
/// the flattened pipeline (used in start-failure reporting).
pub(crate) struct SinkBinding {
    pub(crate) index: usize,
    pub(crate) handle: StageHandle,
    pub(crate) filter: Option<HashSet<u32>>,
}

impl SinkBinding {
    pub(crate) fn admits(&self, stream_id: u32) -> bool {
        match &self.filter {
            Some(filter) => filter.contains(&stream_id),
            None => true,
        }
    }
}

/// Publishes RingDropped at most once per interval while units are being
/// displaced.
struct DropReporter {
    last_count: u64,
    window_start: Instant,
    interval: Duration,
}

impl DropReporter {
    fn new(interval: Duration) -> Self {
        Self {
            last_count: 0,
            window_start: Instant::now(),
            interval,
        }
    }

    fn maybe_report(&mut self, ring: &FrameRing, bus: &EventBus, label: &str) {
        let total = ring.dropped_count();
        if total == self.last_count {
            return;
        }
        let elapsed = self.window_start.elapsed();
        if elapsed < self.interval {
            return;
        }
        let count = total - self.last_count;
        tracing::warn!("[{}] ring displaced {} unit(s) under backpressure", label, count);
        let event = PipelineEvent::RingDropped {
            count,
            since_usec: elapsed.as_micros() as i64,
        };
        bus.publish(topics::PLUGIN_EVENT, &event.to_json());
        self.last_count = total;
        self.window_start = Instant::now();
    }
}

/// Spawn the dispatcher thread. Exits when the ring is cancelled.
pub(crate) fn spawn_dispatcher(
    ring: Arc<FrameRing>,
    sinks: Arc<Mutex<Vec<SinkBinding>>>,
    bus: Arc<EventBus>,
    drop_report_interval: Duration,
    label: String,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name(format!("dispatch-{}", label))
        .spawn(move || run_loop(&ring, &sinks, &bus, drop_report_interval, &label))
}

fn run_loop(
    ring: &FrameRing,
    sinks: &Mutex<Vec<SinkBinding>>,
    bus: &EventBus,
    drop_report_interval: Duration,
    label: &str,
) {
    let mut buf = vec![0u8; ring.slot_size()];
    let mut reporter = DropReporter::new(drop_report_interval);
    let mut malformed: u64 = 0;
    let mut isolated_panics: u64 = 0;

    loop {
        let len = match ring.pop(&mut buf) {
            PopOutcome::Unit(len) => len,
            PopOutcome::Cancelled => break,
        };

        match classify(&buf[..len]) {
            Some(Unit::Frame { header, .. }) => {
                deliver(
                    sinks,
                    &buf[..len],
                    Some(header.stream_id),
                    label,
                    &mut isolated_panics,
                );
            }
            Some(Unit::Event { .. }) => {
                deliver(sinks, &buf[..len], None, label, &mut isolated_panics);
            }
            None => {
                malformed += 1;
                tracing::debug!("[{}] dropped malformed {}-byte unit", label, len);
            }
        }

        reporter.maybe_report(ring, bus, label);
    }

    tracing::debug!(
        "[{}] dispatcher exiting ({} malformed unit(s), {} sink panic(s) isolated)",
        label,
        malformed,
        isolated_panics
    );
}

/// Deliver one unit to every admitted sink, in declaration order.
/// `stream_id` is `None` for Event units, which bypass filters.
fn deliver(
    sinks: &Mutex<Vec<SinkBinding>>,
    unit: &[u8],
    stream_id: Option<u32>,
    label: &str,
    isolated_panics: &mut u64,
) {
    let mut sinks = sinks.lock();
    for sink in sinks.iter_mut() {
        if let Some(stream_id) = stream_id {
            if !sink.admits(stream_id) {
                continue;
            }
        }
        if catch_unwind(AssertUnwindSafe(|| sink.handle.deliver(unit))).is_err() {
            *isolated_panics += 1;
            tracing::error!(
                "[{}] sink '{}' panicked in on_frame; isolating",
                label,
                sink.handle.label()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::envelope::encode_frame;
    use parking_lot::Mutex as PlMutex;
    use vigil_plugin_abi::FrameHeader;

    fn binding(filter: Option<HashSet<u32>>) -> SinkBinding {
        // Filter logic only; the stage behind it is a no-op.
        SinkBinding {
            index: 0,
            handle: test_stage::noop_sink(),
            filter,
        }
    }

    mod test_stage {
        use crate::core::stage::StageHandle;
        use std::os::raw::{c_char, c_int, c_void};
        use std::path::Path;
        use vigil_plugin_abi::{kind, HostApi, StageRecord, PLUGIN_ABI_VERSION};

        unsafe extern "C-unwind" fn start(
            _r: *mut StageRecord,
            _a: *const HostApi,
            _c: *mut c_void,
            _j: *const c_char,
        ) -> c_int {
            0
        }
        unsafe extern "C-unwind" fn stop(_r: *mut StageRecord) {}
        unsafe extern "C-unwind" fn on_frame(_r: *mut StageRecord, _b: *const u8, _s: usize) {}

        pub fn noop_sink() -> StageHandle {
            let mut record = Box::new(StageRecord::zeroed());
            record.version = PLUGIN_ABI_VERSION;
            record.kind = kind::OUTPUT;
            record.start = Some(start);
            record.stop = Some(stop);
            record.on_frame = Some(on_frame);
            StageHandle::new(record, None, "{}", Path::new("<test>")).unwrap()
        }
    }

    #[test]
    fn test_filter_admission() {
        let admit_all = binding(None);
        assert!(admit_all.admits(0));
        assert!(admit_all.admits(7));

        let only_one = binding(Some(HashSet::from([1])));
        assert!(only_one.admits(1));
        assert!(!only_one.admits(0));
    }

    #[test]
    fn test_drop_reporter_rate_limits() {
        let ring = FrameRing::new(2, 64);
        let bus = EventBus::new();
        let reports = Arc::new(PlMutex::new(Vec::new()));
        {
            let reports = Arc::clone(&reports);
            bus.subscribe(topics::PLUGIN_EVENT, move |json| {
                reports.lock().push(json.to_string());
            });
        }

        // Three pushes into two slots: one displacement.
        let frame = encode_frame(&FrameHeader::default(), &[0u8; 4]);
        ring.push(&frame);
        ring.push(&frame);
        ring.push(&frame);
        assert_eq!(ring.dropped_count(), 1);

        // A long interval suppresses the report entirely.
        let mut quiet = DropReporter::new(Duration::from_secs(3600));
        quiet.maybe_report(&ring, &bus, "test");
        assert!(reports.lock().is_empty());

        // A zero interval reports once, then goes quiet until new drops.
        let mut eager = DropReporter::new(Duration::ZERO);
        eager.maybe_report(&ring, &bus, "test");
        eager.maybe_report(&ring, &bus, "test");
        let seen = reports.lock().clone();
        assert_eq!(seen.len(), 1);
        match PipelineEvent::from_json(&seen[0]) {
            Some(PipelineEvent::RingDropped { count, .. }) => assert_eq!(count, 1),
            other => panic!("expected RingDropped, got {:?}", other),
        }
    }
}
