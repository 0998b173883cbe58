use std::net::IpAddr;

use chrono::{TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

use pathprobe::correlate::PendingTracker;
use pathprobe::probe::{ProbeService, ResultHandler, ServiceRegistry};
use pathprobe::schedule::sync::plan_cycle;
use pathprobe::schedule::{Destination, EntryState, ScheduleEntry};

struct NullService {
    source: IpAddr,
}

impl ProbeService for NullService {
    fn source(&self) -> IpAddr {
        self.source
    }

    fn set_result_handler(&mut self, _handler: ResultHandler) {}

    fn start(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn add_destination(&self, _destination: Destination) -> bool {
        true
    }

    fn request_stop(&self) {}

    fn joinable(&self) -> bool {
        true
    }

    fn join(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

fn rows(n: u64) -> Vec<ScheduleEntry> {
    (0..n)
        .map(|i| ScheduleEntry {
            identifier: i,
            source: "10.0.0.1".parse().unwrap(),
            traffic_class: (i % 4) as u8,
            destination: "192.0.2.7".parse().unwrap(),
            state: EntryState::AgentScheduled,
            last_change: Utc.timestamp_opt(1_700_000_000 + (i as i64 % 128), 0).unwrap(),
            measured_at: None,
        })
        .collect()
}

fn bench_tracker_ops(c: &mut Criterion) {
    c.bench_function("tracker_mark_record_take", |b| {
        let tracker = PendingTracker::new();
        let t = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let mut id = 0u64;

        b.iter(|| {
            id = id.wrapping_add(1);
            tracker.mark_dispatched(black_box(id));
            tracker.record_send_time(black_box(id), t);
            black_box(tracker.take_if_ready(black_box(id)));
        });
    });

    c.bench_function("tracker_record_on_hot_path", |b| {
        let tracker = PendingTracker::new();
        let t = Utc.timestamp_opt(1_700_000_000, 0).unwrap();

        // Steady-state size the correlator callback sees in practice.
        for id in 0..512u64 {
            tracker.mark_dispatched(id);
        }

        let mut id = 0u64;
        b.iter(|| {
            id = (id + 1) % 512;
            tracker.record_send_time(black_box(id), t);
        });
    });
}

fn bench_plan_cycle(c: &mut Criterion) {
    c.bench_function("plan_cycle_512_rows", |b| {
        let mut registry = ServiceRegistry::new();
        registry.insert(Box::new(NullService {
            source: "10.0.0.1".parse().unwrap(),
        }));

        b.iter(|| {
            // A fresh tracker per batch keeps every row on the dispatch path.
            let tracker = PendingTracker::new();
            black_box(plan_cycle(black_box(rows(512)), &tracker, &registry));
        });
    });
}

criterion_group!(benches, bench_tracker_ops, bench_plan_cycle);
criterion_main!(benches);
