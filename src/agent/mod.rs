use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::{self, Config};
use crate::correlate::{self, Correlator, PendingTracker, SendTimeUpdate};
use crate::health::HealthMetrics;
use crate::jitter::JitteredInterval;
use crate::liveness::LivenessAnnouncer;
use crate::migrate::{Migrator, PgMigrator};
use crate::probe::traceroute::TracerouteService;
use crate::probe::udp::UdpHopProber;
use crate::probe::{ProbeService, ServiceRegistry};
use crate::results::ResultsWriter;
use crate::schedule::sync::Synchronizer;
use crate::store::ScheduleStore;

/// Relative variance of the liveness interval (±50%).
const LIVENESS_JITTER_VARIANCE: f64 = 0.5;

/// How often the drain phase re-checks whether every worker has finished.
const CLEANUP_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Agent orchestrates all components: store, probe services, correlator,
/// synchronizer, health server.
///
/// Lifecycle is Running → Stopping → Drained: a shutdown signal asks every
/// measurement service to finish its queued work, a cleanup poller waits
/// until all of them are joinable, and only then are workers joined and
/// resources released. Schedule cycles keep running while stopping so
/// completions of in-flight probes still reach the store.
pub struct Agent {
    cfg: Config,
    health: Arc<HealthMetrics>,
    tracker: Arc<PendingTracker>,
    registry: Option<Arc<ServiceRegistry>>,
    synchronizer: Option<Synchronizer>,
    results_rx: Option<mpsc::UnboundedReceiver<SendTimeUpdate>>,
    // Keeps the result channel open even after all workers exited, so the
    // event loop's receiver never reports a closed channel.
    #[allow(dead_code)]
    correlator: Option<Correlator>,
}

impl Agent {
    /// Creates a new Agent, initializing health metrics.
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        Ok(Self {
            cfg,
            health,
            tracker: Arc::new(PendingTracker::new()),
            registry: None,
            synchronizer: None,
            results_rx: None,
            correlator: None,
        })
    }

    /// Start all components. Any failure here is fatal for the process.
    pub async fn start(&mut self) -> Result<()> {
        // 0. Start health metrics server (before the store so probes respond).
        self.health
            .start()
            .await
            .context("starting health metrics server")?;

        // 1. Connect to the schedule store.
        let store = ScheduleStore::connect(&self.cfg.store)
            .await
            .context("connecting to schedule store")?;

        // 2. Run migrations if enabled.
        if self.cfg.store.migrations.enabled {
            info!("running schedule store migrations...");
            let migrator = PgMigrator::new(store.pool().clone());
            migrator
                .up()
                .await
                .context("applying schedule store migrations")?;
        }

        // 3. Resolve the host name reported in last-seen rows.
        let host_name = config::resolve_host_name(&self.cfg.agent_host_name)
            .context("resolving agent host name")?;
        info!(host_name = %host_name, "agent identity resolved");

        // 4. Build the result path: workers → channel → tracker.
        let (correlator, results_rx) = Correlator::channel();

        // 5. One measurement service per source address.
        let mut registry = ServiceRegistry::new();
        for source in &self.cfg.sources {
            info!(source = %source, "starting measurement service");

            let prober = UdpHopProber::new(*source, self.cfg.traceroute.udp_base_port)
                .with_context(|| format!("creating probe socket for {source}"))?;
            let writer = ResultsWriter::create(&self.cfg.results, *source)
                .with_context(|| format!("creating results writer for {source}"))?;

            let mut service = TracerouteService::new(
                *source,
                self.cfg.traceroute.clone(),
                Box::new(prober),
                writer,
            );
            service.set_result_handler(correlator.handler());
            service
                .start()
                .with_context(|| format!("starting measurement service for {source}"))?;

            registry.insert(Box::new(service));
        }

        if registry.is_empty() {
            bail!("no measurement services configured");
        }

        self.health.services_running.set(registry.len() as f64);
        let registry = Arc::new(registry);

        // 6. Wire up the synchronizer.
        let liveness = LivenessAnnouncer::new(
            JitteredInterval::new(self.cfg.liveness_interval, LIVENESS_JITTER_VARIANCE),
            host_name,
        );
        let synchronizer = Synchronizer::new(
            store,
            self.cfg.sources.clone(),
            Arc::clone(&self.tracker),
            Arc::clone(&registry),
            liveness,
            Arc::clone(&self.health),
        );

        self.registry = Some(registry);
        self.synchronizer = Some(synchronizer);
        self.results_rx = Some(results_rx);
        self.correlator = Some(correlator);

        info!(services = self.cfg.sources.len(), "agent fully started");

        Ok(())
    }

    /// Run the event loop until shutdown, then drain and release everything.
    pub async fn run(&mut self, mut shutdown_rx: oneshot::Receiver<()>) -> Result<()> {
        let mut synchronizer = self.synchronizer.take().context("agent not started")?;
        let mut results_rx = self.results_rx.take().context("agent not started")?;
        let registry = self
            .registry
            .clone()
            .context("agent not started")?;

        let cycle_timer = tokio::time::sleep(Duration::ZERO);
        tokio::pin!(cycle_timer);

        let mut cleanup = tokio::time::interval(CLEANUP_POLL_INTERVAL);
        cleanup.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut stopping = false;

        loop {
            tokio::select! {
                _ = &mut shutdown_rx, if !stopping => {
                    info!("shutdown requested, draining measurement services");
                    stopping = true;
                    registry.request_stop_all();
                }

                Some(update) = results_rx.recv() => {
                    self.health.results_received_total.inc();
                    correlate::apply_update(&self.tracker, update);
                }

                _ = cleanup.tick(), if stopping => {
                    if registry.all_joinable() {
                        break;
                    }
                }

                _ = &mut cycle_timer => {
                    let delay = match synchronizer.run_cycle().await {
                        // A productive cycle re-triggers immediately to
                        // drain the backlog.
                        Ok(true) => Duration::ZERO,
                        Ok(false) => self.cfg.poll_interval,
                        Err(err) => {
                            warn!(error = %err, "schedule cycle failed, retrying next tick");
                            self.cfg.poll_interval
                        }
                    };
                    cycle_timer.as_mut().reset(tokio::time::Instant::now() + delay);
                }
            }
        }

        debug!("all measurement services joinable");

        // Drained: join workers and release everything, in order, always.
        let join_result = registry.join_all();
        self.health.services_running.set(0.0);

        self.health
            .stop()
            .await
            .context("stopping health metrics server")?;

        join_result?;

        info!("agent drained");

        Ok(())
    }
}
