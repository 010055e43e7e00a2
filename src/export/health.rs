use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "usage_aggregator";

/// Prometheus metrics for aggregation passes and store access.
///
/// All metrics use the "usage_aggregator" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // === Passes ===
    /// Completed passes that did aggregation work.
    pub passes: Counter,
    /// Passes that found no new records.
    pub idle_passes: Counter,
    /// Passes aborted by an error.
    pub pass_failures: Counter,
    /// Wall time of one pass (1s-1h buckets).
    pub pass_duration: Histogram,
    /// Duration per aggregation step (base, reduce, rollup).
    pub step_duration: HistogramVec,
    /// Insertion-time watermark in epoch seconds.
    pub checkpoint: Gauge,
    /// Start of the window processed by the latest pass.
    pub window_start: Gauge,
    /// Epoch seconds of the last successful pass.
    pub last_success: Gauge,

    // === Rows ===
    /// Raw records folded into the base aggregate.
    pub records_read: Counter,
    /// Aggregate rows written by key and resolution.
    pub rows_written: CounterVec,
    /// Aggregate rows deleted by key and resolution.
    pub rows_deleted: CounterVec,

    // === ClickHouse ===
    /// Whether the ClickHouse pool answered its last ping (1=yes, 0=no).
    pub clickhouse_connected: Gauge,
    /// ClickHouse call duration by operation and table.
    pub clickhouse_duration: HistogramVec,
    /// ClickHouse call failures by operation and table.
    pub clickhouse_errors: CounterVec,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let passes = Counter::with_opts(
            Opts::new("passes_total", "Completed aggregation passes.").namespace(NAMESPACE),
        )?;
        let idle_passes = Counter::with_opts(
            Opts::new(
                "idle_passes_total",
                "Passes that found no records newer than the checkpoint.",
            )
            .namespace(NAMESPACE),
        )?;
        let pass_failures = Counter::with_opts(
            Opts::new("pass_failures_total", "Passes aborted by an error.").namespace(NAMESPACE),
        )?;
        let pass_duration = Histogram::with_opts(
            HistogramOpts::new("pass_duration_seconds", "Wall time of one aggregation pass.")
                .namespace(NAMESPACE)
                .buckets(vec![
                    1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0, 3600.0,
                ]),
        )?;
        let step_duration = HistogramVec::new(
            HistogramOpts::new("step_duration_seconds", "Duration of one aggregation step.")
                .namespace(NAMESPACE)
                .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0]),
            &["step"],
        )?;
        let checkpoint = Gauge::with_opts(
            Opts::new(
                "checkpoint_epoch_seconds",
                "Insertion-time watermark of the aggregation driver.",
            )
            .namespace(NAMESPACE),
        )?;
        let window_start = Gauge::with_opts(
            Opts::new(
                "window_start_epoch_seconds",
                "Start of the window processed by the latest pass.",
            )
            .namespace(NAMESPACE),
        )?;
        let last_success = Gauge::with_opts(
            Opts::new(
                "last_success_epoch_seconds",
                "Time of the last successful pass.",
            )
            .namespace(NAMESPACE),
        )?;

        let records_read = Counter::with_opts(
            Opts::new(
                "records_read_total",
                "Raw usage records folded into the base aggregate.",
            )
            .namespace(NAMESPACE),
        )?;
        let rows_written = CounterVec::new(
            Opts::new("rows_written_total", "Aggregate rows written.").namespace(NAMESPACE),
            &["key", "resolution"],
        )?;
        let rows_deleted = CounterVec::new(
            Opts::new("rows_deleted_total", "Aggregate rows deleted before rewrite.")
                .namespace(NAMESPACE),
            &["key", "resolution"],
        )?;

        let clickhouse_connected = Gauge::with_opts(
            Opts::new(
                "clickhouse_connected",
                "Whether the ClickHouse pool is connected (1=yes, 0=no).",
            )
            .namespace(NAMESPACE),
        )?;
        let clickhouse_duration = HistogramVec::new(
            HistogramOpts::new(
                "clickhouse_duration_seconds",
                "ClickHouse call duration by operation and table.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]),
            &["operation", "table"],
        )?;
        let clickhouse_errors = CounterVec::new(
            Opts::new(
                "clickhouse_errors_total",
                "ClickHouse call failures by operation and table.",
            )
            .namespace(NAMESPACE),
            &["operation", "table"],
        )?;

        registry.register(Box::new(passes.clone()))?;
        registry.register(Box::new(idle_passes.clone()))?;
        registry.register(Box::new(pass_failures.clone()))?;
        registry.register(Box::new(pass_duration.clone()))?;
        registry.register(Box::new(step_duration.clone()))?;
        registry.register(Box::new(checkpoint.clone()))?;
        registry.register(Box::new(window_start.clone()))?;
        registry.register(Box::new(last_success.clone()))?;
        registry.register(Box::new(records_read.clone()))?;
        registry.register(Box::new(rows_written.clone()))?;
        registry.register(Box::new(rows_deleted.clone()))?;
        registry.register(Box::new(clickhouse_connected.clone()))?;
        registry.register(Box::new(clickhouse_duration.clone()))?;
        registry.register(Box::new(clickhouse_errors.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            passes,
            idle_passes,
            pass_failures,
            pass_duration,
            step_duration,
            checkpoint,
            window_start,
            last_success,
            records_read,
            rows_written,
            rows_deleted,
            clickhouse_connected,
            clickhouse_duration,
            clickhouse_errors,
        })
    }

    /// Adds one step's row counts for `key` at `resolution`.
    pub fn record_rows(&self, key: &str, resolution: i64, deleted: u64, written: u64) {
        let resolution = resolution.to_string();
        let labels = [key, resolution.as_str()];
        if deleted > 0 {
            self.rows_deleted
                .with_label_values(&labels)
                .inc_by(deleted as f64);
        }
        if written > 0 {
            self.rows_written
                .with_label_values(&labels)
                .inc_by(written as f64);
        }
    }

    /// Renders all registered metrics in the Prometheus text format.
    pub fn render(&self) -> Result<String> {
        encode_registry(&self.registry)
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
        });

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

fn encode_registry(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode_registry(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "encoding metrics");
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
