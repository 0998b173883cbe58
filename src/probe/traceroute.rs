use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::{debug, warn};

use crate::config::TracerouteConfig;
use crate::probe::udp::HopProber;
use crate::probe::{ProbeResult, ProbeService, ResultHandler};
use crate::results::ResultsWriter;
use crate::schedule::Destination;

/// How long an idle worker waits before re-checking its queue and stop flag.
const IDLE_RECHECK: Duration = Duration::from_millis(500);

/// Traceroute measurement service: one worker thread per source address.
///
/// Destinations queue in a set deduplicated by (address, traffic class);
/// the worker drains it, sending hop-limited probes in growing TTL windows
/// and reporting every hop probe through the registered handler. After a
/// stop request the queue refuses new work but already-accepted
/// destinations are still probed before the worker exits.
pub struct TracerouteService {
    shared: Arc<Shared>,
    handler: Option<ResultHandler>,
    writer: Option<ResultsWriter>,
    prober: Option<Box<dyn HopProber>>,
    worker: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    source: IpAddr,
    cfg: TracerouteConfig,
    pending: parking_lot::Mutex<BTreeSet<Destination>>,
    wake: parking_lot::Condvar,
    stop: AtomicBool,
}

impl TracerouteService {
    pub fn new(
        source: IpAddr,
        cfg: TracerouteConfig,
        prober: Box<dyn HopProber>,
        writer: Option<ResultsWriter>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                source,
                cfg,
                pending: parking_lot::Mutex::new(BTreeSet::new()),
                wake: parking_lot::Condvar::new(),
                stop: AtomicBool::new(false),
            }),
            handler: None,
            writer,
            prober: Some(prober),
            worker: parking_lot::Mutex::new(None),
        }
    }

    /// Number of destinations currently queued.
    pub fn pending_len(&self) -> usize {
        self.shared.pending.lock().len()
    }
}

impl ProbeService for TracerouteService {
    fn source(&self) -> IpAddr {
        self.shared.source
    }

    fn set_result_handler(&mut self, handler: ResultHandler) {
        self.handler = Some(handler);
    }

    fn start(&mut self) -> Result<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            bail!("measurement service for {} already started", self.shared.source);
        }

        let prober = self
            .prober
            .take()
            .context("measurement service started twice")?;
        let handler = self.handler.take();
        let writer = self.writer.take();
        let shared = Arc::clone(&self.shared);

        let handle = std::thread::Builder::new()
            .name(format!("probe-{}", self.shared.source))
            .spawn(move || worker_loop(&shared, prober.as_ref(), handler, writer))
            .context("spawning measurement worker thread")?;

        *worker = Some(handle);
        debug!(source = %self.shared.source, "measurement worker started");

        Ok(())
    }

    fn add_destination(&self, destination: Destination) -> bool {
        if self.shared.stop.load(Ordering::Acquire) {
            return false;
        }

        let mut pending = self.shared.pending.lock();
        let inserted = pending.insert(destination);
        if inserted {
            self.shared.wake.notify_one();
        }

        inserted
    }

    fn request_stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.wake.notify_all();
    }

    fn joinable(&self) -> bool {
        match self.worker.lock().as_ref() {
            Some(handle) => handle.is_finished(),
            // Never started: nothing to wait for.
            None => true,
        }
    }

    fn join(&self) -> Result<()> {
        let handle = self.worker.lock().take();

        if let Some(handle) = handle {
            handle
                .join()
                .map_err(|_| anyhow::anyhow!("measurement worker for {} panicked", self.shared.source))?;
        }

        Ok(())
    }
}

fn worker_loop(
    shared: &Shared,
    prober: &dyn HopProber,
    handler: Option<ResultHandler>,
    mut writer: Option<ResultsWriter>,
) {
    loop {
        let next = {
            let mut pending = shared.pending.lock();
            loop {
                if let Some(destination) = pending.iter().next().copied() {
                    pending.remove(&destination);
                    break Some(destination);
                }
                if shared.stop.load(Ordering::Acquire) {
                    break None;
                }
                shared.wake.wait_for(&mut pending, IDLE_RECHECK);
            }
        };

        let Some(destination) = next else {
            break;
        };

        probe_destination(shared, prober, handler.as_ref(), writer.as_mut(), destination);

        // Pace between bursts; new work or a stop request wakes us early.
        if !shared.stop.load(Ordering::Acquire) {
            let mut pending = shared.pending.lock();
            if pending.is_empty() {
                shared.wake.wait_for(&mut pending, shared.cfg.interval);
            }
        }
    }

    if let Some(writer) = writer.as_mut() {
        if let Err(err) = writer.close() {
            warn!(source = %shared.source, error = %err, "closing results writer");
        }
    }

    debug!(source = %shared.source, "measurement worker drained");
}

/// Probe one destination over the configured rounds and TTL windows.
fn probe_destination(
    shared: &Shared,
    prober: &dyn HopProber,
    handler: Option<&ResultHandler>,
    mut writer: Option<&mut ResultsWriter>,
    destination: Destination,
) {
    let cfg = &shared.cfg;

    for round in 0..cfg.rounds {
        let mut ttl = 1u8;
        let mut window_max = cfg.initial_max_ttl;

        loop {
            for hop in ttl..=window_max {
                match prober.probe(&destination, round, hop) {
                    Ok(send_time) => {
                        let result = ProbeResult {
                            source: shared.source,
                            destination,
                            round,
                            hop,
                            send_time,
                        };

                        if let Some(writer) = writer.as_mut() {
                            if let Err(err) = writer.record(&result) {
                                warn!(source = %shared.source, error = %err, "recording result");
                            }
                        }

                        if let Some(handler) = handler {
                            handler(result);
                        }
                    }
                    Err(err) => {
                        warn!(
                            source = %shared.source,
                            destination = %destination,
                            hop,
                            error = %err,
                            "hop probe failed",
                        );
                    }
                }
            }

            if window_max >= cfg.final_max_ttl {
                break;
            }

            std::thread::sleep(cfg.expiration);
            ttl = window_max.saturating_add(1);
            window_max = window_max
                .saturating_add(cfg.increment_max_ttl)
                .min(cfg.final_max_ttl);
        }

        if round + 1 < cfg.rounds {
            std::thread::sleep(cfg.expiration);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::udp::ProbeError;
    use chrono::Utc;
    use std::sync::Mutex;

    /// Records every (round, ttl, identifier) it is asked to send.
    struct RecordingProber {
        sent: Arc<Mutex<Vec<(u32, u8, u64)>>>,
    }

    impl HopProber for RecordingProber {
        fn probe(
            &self,
            destination: &Destination,
            round: u32,
            ttl: u8,
        ) -> Result<chrono::DateTime<Utc>, ProbeError> {
            self.sent
                .lock()
                .unwrap()
                .push((round, ttl, destination.identifier));
            Ok(Utc::now())
        }
    }

    fn quick_cfg() -> TracerouteConfig {
        TracerouteConfig {
            interval: Duration::from_millis(1),
            expiration: Duration::from_millis(1),
            rounds: 1,
            initial_max_ttl: 3,
            final_max_ttl: 6,
            increment_max_ttl: 3,
            udp_base_port: 33434,
        }
    }

    fn dest(addr: &str, tc: u8, id: u64) -> Destination {
        Destination {
            address: addr.parse().unwrap(),
            traffic_class: tc,
            identifier: id,
        }
    }

    fn service_with_recorder(
        cfg: TracerouteConfig,
    ) -> (TracerouteService, Arc<Mutex<Vec<(u32, u8, u64)>>>) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let prober = RecordingProber {
            sent: Arc::clone(&sent),
        };
        let service = TracerouteService::new(
            "10.0.0.1".parse().unwrap(),
            cfg,
            Box::new(prober),
            None,
        );
        (service, sent)
    }

    fn wait_joinable(service: &TracerouteService) {
        for _ in 0..200 {
            if service.joinable() {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("worker did not finish in time");
    }

    #[test]
    fn test_duplicate_destination_rejected_while_pending() {
        let (service, _) = service_with_recorder(quick_cfg());

        assert!(service.add_destination(dest("10.0.0.2", 0, 1)));
        assert!(
            !service.add_destination(dest("10.0.0.2", 0, 99)),
            "same (address, tc) must be refused while queued"
        );
        assert!(service.add_destination(dest("10.0.0.2", 8, 2)));
        assert_eq!(service.pending_len(), 2);
    }

    #[test]
    fn test_no_destinations_accepted_after_stop() {
        let (service, _) = service_with_recorder(quick_cfg());

        service.request_stop();
        assert!(!service.add_destination(dest("10.0.0.2", 0, 1)));
        assert_eq!(service.pending_len(), 0);
    }

    #[test]
    fn test_worker_probes_all_ttl_windows() {
        let (mut service, sent) = service_with_recorder(quick_cfg());
        service.start().unwrap();

        service.add_destination(dest("10.0.0.2", 0, 42));

        // Give the worker time to drain, then stop it.
        std::thread::sleep(Duration::from_millis(100));
        service.request_stop();
        wait_joinable(&service);
        service.join().unwrap();

        let sent = sent.lock().unwrap();
        let ttls: Vec<u8> = sent.iter().map(|(_, ttl, _)| *ttl).collect();
        assert_eq!(ttls, vec![1, 2, 3, 4, 5, 6], "one probe per TTL up to final");
        assert!(sent.iter().all(|(round, _, id)| *round == 0 && *id == 42));
    }

    #[test]
    fn test_queued_work_drained_after_stop() {
        let cfg = quick_cfg();
        let (mut service, sent) = service_with_recorder(cfg);

        // Queue before the worker exists, then stop immediately after start.
        service.add_destination(dest("10.0.0.2", 0, 1));
        service.add_destination(dest("10.0.0.3", 0, 2));

        service.start().unwrap();
        service.request_stop();

        wait_joinable(&service);
        service.join().unwrap();

        let ids: std::collections::HashSet<u64> =
            sent.lock().unwrap().iter().map(|(_, _, id)| *id).collect();
        assert_eq!(ids.len(), 2, "both queued destinations must be probed");
    }

    #[test]
    fn test_joinable_before_start() {
        let (service, _) = service_with_recorder(quick_cfg());
        assert!(service.joinable());
        assert!(service.join().is_ok());
    }

    #[test]
    fn test_start_twice_fails() {
        let (mut service, _) = service_with_recorder(quick_cfg());
        service.start().unwrap();
        assert!(service.start().is_err());

        service.request_stop();
        wait_joinable(&service);
        service.join().unwrap();
    }

    #[test]
    fn test_rounds_repeat_ttl_sequence() {
        let mut cfg = quick_cfg();
        cfg.rounds = 2;
        cfg.initial_max_ttl = 2;
        cfg.final_max_ttl = 2;

        let (mut service, sent) = service_with_recorder(cfg);
        service.start().unwrap();
        service.add_destination(dest("10.0.0.2", 0, 7));

        std::thread::sleep(Duration::from_millis(100));
        service.request_stop();
        wait_joinable(&service);
        service.join().unwrap();

        let sent = sent.lock().unwrap();
        let probes: Vec<(u32, u8)> = sent.iter().map(|(r, t, _)| (*r, *t)).collect();
        assert_eq!(probes, vec![(0, 1), (0, 2), (1, 1), (1, 2)]);
    }
}
