use std::net::IpAddr;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};

use crate::config::StoreConfig;
use crate::schedule::{EntryState, ScheduleEntry};

/// Client for the shared schedule store (PostgreSQL).
///
/// All reads and writes of one synchronizer cycle run inside a single
/// transaction obtained from [`ScheduleStore::begin`]; nothing persists
/// unless the cycle commits.
pub struct ScheduleStore {
    pool: PgPool,
}

impl ScheduleStore {
    /// Open the connection pool and verify connectivity.
    pub async fn connect(cfg: &StoreConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(cfg.max_connections)
            .acquire_timeout(cfg.acquire_timeout)
            .connect(&cfg.url())
            .await
            .with_context(|| format!("connecting to schedule store at {}", cfg.endpoint))?;

        sqlx::query("SELECT 1")
            .execute(&pool)
            .await
            .context("pinging schedule store")?;

        tracing::info!(endpoint = %cfg.endpoint, database = %cfg.database, "schedule store connected");

        Ok(Self { pool })
    }

    /// The underlying pool, for the migrator.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Begin one cycle's transaction.
    pub async fn begin(&self) -> Result<Transaction<'static, Postgres>> {
        self.pool
            .begin()
            .await
            .context("opening schedule store transaction")
    }

    /// Rows still scheduled for any of this agent's sources, oldest first.
    pub async fn fetch_pending(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        sources: &[IpAddr],
    ) -> Result<Vec<ScheduleEntry>> {
        let source_strings: Vec<String> = sources.iter().map(IpAddr::to_string).collect();

        let rows = sqlx::query(
            "SELECT identifier, agent_host_ip, agent_traffic_class, destination_ip, \
                    state, last_change, agent_measurement_time \
             FROM measurement_schedule \
             WHERE state = 'agent_scheduled' AND agent_host_ip = ANY($1) \
             ORDER BY last_change ASC",
        )
        .bind(&source_strings)
        .fetch_all(&mut **tx)
        .await
        .context("querying scheduled measurements")?;

        rows.into_iter().map(parse_entry).collect()
    }

    /// Report a measurement as completed, with its authoritative send time.
    ///
    /// The state filter makes the transition one-way: a row some other
    /// party already moved on is left untouched and reported as such.
    pub async fn mark_completed(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        identifier: u64,
        measured_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE measurement_schedule \
             SET state = 'agent_completed', agent_measurement_time = $2, last_change = NOW() \
             WHERE identifier = $1 AND state = 'agent_scheduled'",
        )
        .bind(identifier_to_db(identifier)?)
        .bind(measured_at)
        .execute(&mut **tx)
        .await
        .with_context(|| format!("reporting completion of measurement {identifier}"))?;

        Ok(result.rows_affected() == 1)
    }

    /// Upsert one last-seen row for a source address.
    pub async fn upsert_last_seen(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        source: IpAddr,
        host_name: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO agent_last_seen (agent_host_ip, agent_host_name, last_seen_at) \
             VALUES ($1, $2, NOW()) \
             ON CONFLICT (agent_host_ip, agent_host_name) \
             DO UPDATE SET last_seen_at = EXCLUDED.last_seen_at",
        )
        .bind(source.to_string())
        .bind(host_name)
        .execute(&mut **tx)
        .await
        .with_context(|| format!("upserting last-seen row for {source}"))?;

        Ok(())
    }
}

fn parse_entry(row: PgRow) -> Result<ScheduleEntry> {
    let identifier: i64 = row.try_get("identifier").context("reading identifier")?;
    let identifier = identifier_from_db(identifier)?;

    let source: String = row.try_get("agent_host_ip").context("reading source")?;
    let source: IpAddr = source
        .parse()
        .with_context(|| format!("row {identifier}: bad source address"))?;

    let traffic_class: i16 = row
        .try_get("agent_traffic_class")
        .context("reading traffic class")?;
    let traffic_class = u8::try_from(traffic_class)
        .with_context(|| format!("row {identifier}: traffic class out of range"))?;

    let destination: String = row
        .try_get("destination_ip")
        .context("reading destination")?;
    let destination: IpAddr = destination
        .parse()
        .with_context(|| format!("row {identifier}: bad destination address"))?;

    let state: String = row.try_get("state").context("reading state")?;
    let Some(state) = EntryState::from_name(&state) else {
        bail!("row {identifier}: unknown state {state:?}");
    };

    Ok(ScheduleEntry {
        identifier,
        source,
        traffic_class,
        destination,
        state,
        last_change: row.try_get("last_change").context("reading last_change")?,
        measured_at: row
            .try_get("agent_measurement_time")
            .context("reading measurement time")?,
    })
}

/// Identifiers are BIGINT in the store and u64 in memory.
fn identifier_from_db(raw: i64) -> Result<u64> {
    u64::try_from(raw).with_context(|| format!("negative schedule identifier {raw}"))
}

fn identifier_to_db(identifier: u64) -> Result<i64> {
    i64::try_from(identifier)
        .with_context(|| format!("schedule identifier {identifier} exceeds BIGINT range"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_conversion_round_trip() {
        assert_eq!(identifier_from_db(42).unwrap(), 42);
        assert_eq!(identifier_to_db(42).unwrap(), 42);
        assert_eq!(
            identifier_from_db(identifier_to_db(u64::from(u32::MAX)).unwrap()).unwrap(),
            u64::from(u32::MAX)
        );
    }

    #[test]
    fn test_identifier_conversion_rejects_out_of_range() {
        assert!(identifier_from_db(-1).is_err());
        assert!(identifier_to_db(u64::MAX).is_err());
    }
}
