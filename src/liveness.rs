use std::net::IpAddr;
use std::time::Instant;

use anyhow::Result;
use sqlx::{Postgres, Transaction};
use tracing::debug;

use crate::jitter::JitteredInterval;
use crate::store::ScheduleStore;

/// Periodic last-seen announcer with jittered timing.
///
/// One shared next-due timestamp gates all sources; each firing draws a
/// fresh jittered interval so a fleet of agents spreads its heartbeat
/// writes instead of hitting the store in lockstep. Writes piggyback on
/// synchronizer cycles that already hold a transaction.
pub struct LivenessAnnouncer {
    interval: JitteredInterval,
    next_due: Option<Instant>,
    host_name: String,
}

impl LivenessAnnouncer {
    pub fn new(interval: JitteredInterval, host_name: String) -> Self {
        Self {
            interval,
            next_due: None,
            host_name,
        }
    }

    /// Whether an announcement is due. The first call is always due.
    pub fn due(&self, now: Instant) -> bool {
        match self.next_due {
            None => true,
            Some(t) => now >= t,
        }
    }

    /// Consume a due firing, re-arming with a fresh jittered interval.
    ///
    /// Returns false (and writes nothing) when the interval has not
    /// elapsed; the caller only performs store writes on true.
    pub fn maybe_fire(&mut self, now: Instant) -> bool {
        if !self.due(now) {
            return false;
        }

        let next = self.interval.next();
        self.next_due = Some(now + next);
        debug!(next_in = ?next, "liveness announcement due");

        true
    }

    /// Upsert one last-seen row per source inside the cycle's transaction.
    pub async fn announce(
        &self,
        store: &ScheduleStore,
        tx: &mut Transaction<'static, Postgres>,
        sources: &[IpAddr],
    ) -> Result<()> {
        for source in sources {
            store.upsert_last_seen(tx, *source, &self.host_name).await?;
        }

        Ok(())
    }

    pub fn host_name(&self) -> &str {
        &self.host_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn announcer(avg_secs: u64) -> LivenessAnnouncer {
        LivenessAnnouncer::new(
            JitteredInterval::with_seed(Duration::from_secs(avg_secs), 0.5, 11),
            "probe-host".to_string(),
        )
    }

    #[test]
    fn test_first_check_fires() {
        let mut a = announcer(60);
        assert!(a.maybe_fire(Instant::now()));
    }

    #[test]
    fn test_no_second_fire_within_minimum_interval() {
        let mut a = announcer(60);
        let t0 = Instant::now();

        assert!(a.maybe_fire(t0));

        // Anything below the minimum jittered interval (30s here) must not fire.
        assert!(!a.maybe_fire(t0 + Duration::from_secs(1)));
        assert!(!a.maybe_fire(t0 + Duration::from_secs(29)));
    }

    #[test]
    fn test_fires_again_after_interval_elapses() {
        let mut a = announcer(60);
        let t0 = Instant::now();

        assert!(a.maybe_fire(t0));

        // The maximum jittered interval is 90s; past it a fire is guaranteed.
        assert!(a.maybe_fire(t0 + Duration::from_secs(91)));
    }

    #[test]
    fn test_each_fire_rearms() {
        let mut a = announcer(1);
        let t0 = Instant::now();

        let mut fired = 0;
        let mut now = t0;
        for _ in 0..10 {
            if a.maybe_fire(now) {
                fired += 1;
            }
            // Every step exceeds the maximum jittered interval (1.5s).
            now += Duration::from_millis(1600);
        }

        assert_eq!(fired, 10);
    }
}
