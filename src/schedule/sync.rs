use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::correlate::PendingTracker;
use crate::health::HealthMetrics;
use crate::liveness::LivenessAnnouncer;
use crate::probe::ServiceRegistry;
use crate::schedule::ScheduleEntry;
use crate::store::ScheduleStore;

/// Work derived from one batch of scheduled rows.
#[derive(Debug, Default)]
pub struct CyclePlan {
    /// Rows seen for the first time; their destinations go to a service.
    pub dispatches: Vec<ScheduleEntry>,
    /// Identifiers whose send time is in; completion goes to the store.
    pub completions: Vec<(u64, DateTime<Utc>)>,
}

/// Classify scheduled rows into fresh dispatches and ready completions.
///
/// Rows are processed oldest `last_change` first so starved entries get
/// dispatched before newer ones. A row that is tracked but still waiting
/// on its probe produces nothing; re-polling it is a no-op, not a
/// re-dispatch. Taking a ready send time removes it from the tracker, so
/// the caller owns it from here until the completion write commits.
pub fn plan_cycle(
    mut rows: Vec<ScheduleEntry>,
    tracker: &PendingTracker,
    registry: &ServiceRegistry,
) -> CyclePlan {
    rows.sort_by_key(|row| (row.last_change, row.identifier));

    let mut plan = CyclePlan::default();

    for row in rows {
        if registry.get(&row.source).is_none() {
            warn!(
                identifier = row.identifier,
                source = %row.source,
                "scheduled row for a source this agent does not serve",
            );
            continue;
        }

        if tracker.mark_dispatched(row.identifier) {
            plan.dispatches.push(row);
        } else if let Some(send_time) = tracker.take_if_ready(row.identifier) {
            plan.completions.push((row.identifier, send_time));
        }
    }

    plan
}

/// The periodic schedule driver.
///
/// Each cycle runs inside one store transaction: an optional liveness
/// upsert, the pending-row query, dispatch of unseen rows, completion
/// writes for finished ones, and a commit. A failed cycle commits nothing
/// and the next timer tick retries.
pub struct Synchronizer {
    store: ScheduleStore,
    sources: Vec<IpAddr>,
    tracker: Arc<PendingTracker>,
    registry: Arc<ServiceRegistry>,
    liveness: LivenessAnnouncer,
    health: Arc<HealthMetrics>,
}

impl Synchronizer {
    pub fn new(
        store: ScheduleStore,
        sources: Vec<IpAddr>,
        tracker: Arc<PendingTracker>,
        registry: Arc<ServiceRegistry>,
        liveness: LivenessAnnouncer,
        health: Arc<HealthMetrics>,
    ) -> Self {
        Self {
            store,
            sources,
            tracker,
            registry,
            liveness,
            health,
        }
    }

    /// Run one synchronization cycle.
    ///
    /// Returns true when a completion was written, which entitles the
    /// caller to re-trigger immediately instead of waiting out the poll
    /// interval.
    pub async fn run_cycle(&mut self) -> Result<bool> {
        self.health.cycles_total.inc();

        let mut taken = Vec::new();
        match self.try_cycle(&mut taken).await {
            Ok(progress) => {
                self.health.store_connected.set(1.0);
                Ok(progress)
            }
            Err(err) => {
                // Nothing committed. Put taken send times back so those
                // entries complete on a later cycle instead of being
                // re-dispatched as unseen rows.
                for (identifier, send_time) in taken {
                    self.tracker.record_send_time(identifier, send_time);
                }

                self.health.store_connected.set(0.0);
                self.health.cycle_errors_total.inc();

                Err(err)
            }
        }
    }

    async fn try_cycle(&mut self, taken: &mut Vec<(u64, DateTime<Utc>)>) -> Result<bool> {
        let mut tx = self.store.begin().await?;

        let mut announced = false;
        if self.liveness.maybe_fire(Instant::now()) {
            self.liveness
                .announce(&self.store, &mut tx, &self.sources)
                .await?;
            self.health
                .liveness_upserts_total
                .inc_by(self.sources.len() as f64);
            announced = true;
        }

        let rows = self.store.fetch_pending(&mut tx, &self.sources).await?;
        let row_count = rows.len();

        let plan = plan_cycle(rows, &self.tracker, &self.registry);
        taken.extend_from_slice(&plan.completions);

        let mut dispatched = 0usize;
        for entry in &plan.dispatches {
            let Some(service) = self.registry.get(&entry.source) else {
                continue;
            };

            let destination = entry.destination_for_dispatch();
            if service.add_destination(destination) {
                debug!(
                    identifier = entry.identifier,
                    destination = %destination,
                    source = %entry.source,
                    "queued destination",
                );
                dispatched += 1;
                self.health.entries_dispatched_total.inc();
            } else {
                // Expected when the same (address, class) is already queued
                // or the service is draining; the row stays scheduled.
                debug!(
                    identifier = entry.identifier,
                    destination = %destination,
                    "destination not queued",
                );
            }
        }

        let mut progress = false;
        for (identifier, send_time) in &plan.completions {
            let updated = self
                .store
                .mark_completed(&mut tx, *identifier, *send_time)
                .await?;

            if updated {
                self.health.entries_completed_total.inc();
            } else {
                warn!(
                    identifier,
                    "schedule row no longer pending; completion dropped"
                );
            }

            progress = true;
        }

        if announced || progress {
            // The transaction already carries writes; refresh last-seen on
            // the way out.
            self.liveness
                .announce(&self.store, &mut tx, &self.sources)
                .await?;
            self.health
                .liveness_upserts_total
                .inc_by(self.sources.len() as f64);
        }

        tx.commit()
            .await
            .context("committing synchronizer cycle")?;

        // Completions are durable now; nothing to restore on later errors.
        taken.clear();

        self.health.identifiers_tracked.set(self.tracker.len() as f64);

        debug!(
            rows = row_count,
            dispatched,
            completed = plan.completions.len(),
            "synchronizer cycle finished",
        );

        Ok(progress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{ProbeService, ResultHandler};
    use crate::schedule::{Destination, EntryState};
    use chrono::TimeZone;

    /// Accept-everything service used to satisfy the registry lookup.
    struct StubService {
        source: IpAddr,
    }

    impl ProbeService for StubService {
        fn source(&self) -> IpAddr {
            self.source
        }

        fn set_result_handler(&mut self, _handler: ResultHandler) {}

        fn start(&mut self) -> Result<()> {
            Ok(())
        }

        fn add_destination(&self, _destination: Destination) -> bool {
            true
        }

        fn request_stop(&self) {}

        fn joinable(&self) -> bool {
            true
        }

        fn join(&self) -> Result<()> {
            Ok(())
        }
    }

    fn registry_for(sources: &[&str]) -> ServiceRegistry {
        let mut registry = ServiceRegistry::new();
        for source in sources {
            registry.insert(Box::new(StubService {
                source: source.parse().unwrap(),
            }));
        }
        registry
    }

    fn row(identifier: u64, source: &str, last_change_secs: i64) -> ScheduleEntry {
        ScheduleEntry {
            identifier,
            source: source.parse().unwrap(),
            traffic_class: 0,
            destination: "192.0.2.1".parse().unwrap(),
            state: EntryState::AgentScheduled,
            last_change: Utc.timestamp_opt(last_change_secs, 0).unwrap(),
            measured_at: None,
        }
    }

    #[test]
    fn test_dispatch_order_follows_last_change() {
        let tracker = PendingTracker::new();
        let registry = registry_for(&["10.0.0.1"]);

        // lastChange [3, 1, 2] for identifiers [C=30, A=10, B=20].
        let rows = vec![
            row(30, "10.0.0.1", 3),
            row(10, "10.0.0.1", 1),
            row(20, "10.0.0.1", 2),
        ];

        let plan = plan_cycle(rows, &tracker, &registry);
        let order: Vec<u64> = plan.dispatches.iter().map(|e| e.identifier).collect();
        assert_eq!(order, vec![10, 20, 30]);
        assert!(plan.completions.is_empty());
    }

    #[test]
    fn test_tracked_row_is_not_redispatched() {
        let tracker = PendingTracker::new();
        let registry = registry_for(&["10.0.0.1"]);

        let plan = plan_cycle(vec![row(42, "10.0.0.1", 1)], &tracker, &registry);
        assert_eq!(plan.dispatches.len(), 1);

        // The row is still scheduled on the next poll; nothing may happen.
        let plan = plan_cycle(vec![row(42, "10.0.0.1", 1)], &tracker, &registry);
        assert!(plan.dispatches.is_empty());
        assert!(plan.completions.is_empty());
        assert!(tracker.contains(42));
    }

    #[test]
    fn test_ready_entry_becomes_completion() {
        let tracker = PendingTracker::new();
        let registry = registry_for(&["10.0.0.1"]);
        let t = Utc.timestamp_opt(1_700_000_000, 0).unwrap();

        plan_cycle(vec![row(42, "10.0.0.1", 1)], &tracker, &registry);
        tracker.record_send_time(42, t);

        let plan = plan_cycle(vec![row(42, "10.0.0.1", 1)], &tracker, &registry);
        assert!(plan.dispatches.is_empty());
        assert_eq!(plan.completions, vec![(42, t)]);
        assert!(!tracker.contains(42), "taken entry leaves the tracker");
    }

    #[test]
    fn test_early_result_completes_without_dispatch() {
        let tracker = PendingTracker::new();
        let registry = registry_for(&["10.0.0.1"]);
        let t = Utc.timestamp_opt(1_700_000_500, 0).unwrap();

        // The send time arrives before the row was ever polled.
        tracker.record_send_time(42, t);

        let plan = plan_cycle(vec![row(42, "10.0.0.1", 1)], &tracker, &registry);
        assert!(plan.dispatches.is_empty());
        assert_eq!(plan.completions, vec![(42, t)]);
    }

    #[test]
    fn test_row_for_unknown_source_is_skipped() {
        let tracker = PendingTracker::new();
        let registry = registry_for(&["10.0.0.1"]);

        let plan = plan_cycle(vec![row(7, "10.9.9.9", 1)], &tracker, &registry);
        assert!(plan.dispatches.is_empty());
        assert!(
            !tracker.contains(7),
            "unserveable rows must not occupy the tracker"
        );
    }

    #[test]
    fn test_mixed_batch_splits_into_both_lists() {
        let tracker = PendingTracker::new();
        let registry = registry_for(&["10.0.0.1", "10.0.0.2"]);
        let t = Utc.timestamp_opt(1_700_000_000, 0).unwrap();

        // Identifier 1 was dispatched earlier and finished; 2 is new.
        plan_cycle(vec![row(1, "10.0.0.1", 1)], &tracker, &registry);
        tracker.record_send_time(1, t);

        let plan = plan_cycle(
            vec![row(1, "10.0.0.1", 1), row(2, "10.0.0.2", 2)],
            &tracker,
            &registry,
        );

        assert_eq!(plan.completions, vec![(1, t)]);
        let dispatched: Vec<u64> = plan.dispatches.iter().map(|e| e.identifier).collect();
        assert_eq!(dispatched, vec![2]);
    }
}
