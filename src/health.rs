use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Counter, Encoder, Gauge, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Prometheus metrics for agent health and observability.
///
/// All metrics use the "pathprobe" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Total synchronizer cycles run.
    pub cycles_total: Counter,
    /// Total synchronizer cycles abandoned on a store error.
    pub cycle_errors_total: Counter,
    /// Total schedule entries handed to measurement services.
    pub entries_dispatched_total: Counter,
    /// Total completions written back to the schedule store.
    pub entries_completed_total: Counter,
    /// Total authoritative send times received from probe workers.
    pub results_received_total: Counter,
    /// Total last-seen rows upserted.
    pub liveness_upserts_total: Counter,
    /// Identifiers currently tracked between dispatch and completion.
    pub identifiers_tracked: Gauge,
    /// Whether the last store transaction succeeded (1=yes, 0=no).
    pub store_connected: Gauge,
    /// Number of running measurement services.
    pub services_running: Gauge,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let cycles_total = Counter::with_opts(
            Opts::new("cycles_total", "Total synchronizer cycles run.").namespace("pathprobe"),
        )?;
        let cycle_errors_total = Counter::with_opts(
            Opts::new(
                "cycle_errors_total",
                "Total synchronizer cycles abandoned on a store error.",
            )
            .namespace("pathprobe"),
        )?;
        let entries_dispatched_total = Counter::with_opts(
            Opts::new(
                "entries_dispatched_total",
                "Total schedule entries handed to measurement services.",
            )
            .namespace("pathprobe"),
        )?;
        let entries_completed_total = Counter::with_opts(
            Opts::new(
                "entries_completed_total",
                "Total completions written back to the schedule store.",
            )
            .namespace("pathprobe"),
        )?;
        let results_received_total = Counter::with_opts(
            Opts::new(
                "results_received_total",
                "Total authoritative send times received from probe workers.",
            )
            .namespace("pathprobe"),
        )?;
        let liveness_upserts_total = Counter::with_opts(
            Opts::new("liveness_upserts_total", "Total last-seen rows upserted.")
                .namespace("pathprobe"),
        )?;
        let identifiers_tracked = Gauge::with_opts(
            Opts::new(
                "identifiers_tracked",
                "Identifiers currently tracked between dispatch and completion.",
            )
            .namespace("pathprobe"),
        )?;
        let store_connected = Gauge::with_opts(
            Opts::new(
                "store_connected",
                "Whether the last store transaction succeeded (1=yes, 0=no).",
            )
            .namespace("pathprobe"),
        )?;
        let services_running = Gauge::with_opts(
            Opts::new(
                "services_running",
                "Number of running measurement services.",
            )
            .namespace("pathprobe"),
        )?;

        registry.register(Box::new(cycles_total.clone()))?;
        registry.register(Box::new(cycle_errors_total.clone()))?;
        registry.register(Box::new(entries_dispatched_total.clone()))?;
        registry.register(Box::new(entries_completed_total.clone()))?;
        registry.register(Box::new(results_received_total.clone()))?;
        registry.register(Box::new(liveness_upserts_total.clone()))?;
        registry.register(Box::new(identifiers_tracked.clone()))?;
        registry.register(Box::new(store_connected.clone()))?;
        registry.register(Box::new(services_running.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            cycles_total,
            cycle_errors_total,
            entries_dispatched_total,
            entries_completed_total,
            results_received_total,
            liveness_upserts_total,
            identifiers_tracked,
            store_connected,
            services_running,
        })
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        // Parse address, handling ":port" shorthand.
        let bind_addr = if self.addr.starts_with(':') {
            format!("0.0.0.0{}", self.addr)
        } else {
            self.addr.clone()
        };

        let registry = self.registry.clone();
        let app_state = Arc::new(AppState { registry });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = state.registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "encoding metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "encoding error".to_string(),
        );
    }

    match String::from_utf8(buffer) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "converting metrics to string");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_once() {
        let health = HealthMetrics::new(":0").unwrap();
        health.cycles_total.inc();
        health.entries_dispatched_total.inc();
        health.identifiers_tracked.set(3.0);

        let families = health.registry.gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "pathprobe_cycles_total"));
        assert!(families
            .iter()
            .any(|f| f.get_name() == "pathprobe_identifiers_tracked"));
    }

    #[tokio::test]
    async fn test_start_and_stop_server() {
        let health = HealthMetrics::new("127.0.0.1:0").unwrap();
        health.start().await.unwrap();
        health.stop().await.unwrap();
    }
}
