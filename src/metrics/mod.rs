/// Prometheus metrics for the prediction engines.
///
/// Counters and histograms are process-global and cheap to update from any
/// thread. They are usable before [`init_metrics`] is called; registration only
/// makes them visible to [`gather_metrics`].
///
/// # Example
/// ```no_run
/// use meal_shortage_engine::metrics;
///
/// metrics::init_metrics().expect("metrics registration");
/// println!("{}", metrics::gather_metrics());
/// ```

use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, GaugeVec, Histogram, HistogramOpts, HistogramVec, Opts, Registry,
};

const NAMESPACE: &str = "meal_shortage_engine";

lazy_static! {
    /// Global Prometheus registry for all metrics
    pub static ref PROMETHEUS_REGISTRY: Registry = Registry::new();

    // ============================================================================
    // Risk Model Metrics
    // ============================================================================

    /// Risk predictions served
    ///
    /// Labels: mode (single, batch)
    pub static ref RISK_PREDICTIONS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("risk_predictions_total", "Total number of risk predictions")
            .namespace(NAMESPACE),
        &["mode"]
    ).expect("Failed to create RISK_PREDICTIONS_TOTAL metric");

    /// Predictions per resulting risk level
    ///
    /// Labels: level
    pub static ref RISK_LEVEL_TOTAL: CounterVec = CounterVec::new(
        Opts::new("risk_level_total", "Risk predictions by resulting level")
            .namespace(NAMESPACE),
        &["level"]
    ).expect("Failed to create RISK_LEVEL_TOTAL metric");

    /// Risk inference latency (single or whole batch)
    pub static ref RISK_PREDICTION_DURATION_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "risk_prediction_duration_seconds",
            "Risk inference duration in seconds"
        )
        .namespace(NAMESPACE)
        .buckets(vec![0.00001, 0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0])
    ).expect("Failed to create RISK_PREDICTION_DURATION_SECONDS metric");

    // ============================================================================
    // Demand Model Metrics
    // ============================================================================

    /// Demand model calls
    ///
    /// Labels: operation (forecast, capacity, components, anomalies)
    pub static ref DEMAND_FORECASTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("demand_forecasts_total", "Total number of demand model calls")
            .namespace(NAMESPACE),
        &["operation"]
    ).expect("Failed to create DEMAND_FORECASTS_TOTAL metric");

    /// Anomalies flagged against observed demand
    pub static ref DEMAND_ANOMALIES_TOTAL: Counter = Counter::with_opts(
        Opts::new("demand_anomalies_total", "Total number of demand anomalies detected")
            .namespace(NAMESPACE)
    ).expect("Failed to create DEMAND_ANOMALIES_TOTAL metric");

    /// Shortage days found by capacity-aware forecasts
    pub static ref SHORTAGE_DAYS_TOTAL: Counter = Counter::with_opts(
        Opts::new("shortage_days_total", "Total number of forecast shortage days")
            .namespace(NAMESPACE)
    ).expect("Failed to create SHORTAGE_DAYS_TOTAL metric");

    // ============================================================================
    // Training Metrics
    // ============================================================================

    /// Training runs
    ///
    /// Labels: model (risk, demand), outcome (success, failure)
    pub static ref MODEL_TRAINING_TOTAL: CounterVec = CounterVec::new(
        Opts::new("model_training_total", "Total number of model training runs")
            .namespace(NAMESPACE),
        &["model", "outcome"]
    ).expect("Failed to create MODEL_TRAINING_TOTAL metric");

    /// Training duration
    ///
    /// Labels: model
    pub static ref MODEL_TRAINING_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "model_training_duration_seconds",
            "Model training duration in seconds"
        )
        .namespace(NAMESPACE)
        .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["model"]
    ).expect("Failed to create MODEL_TRAINING_DURATION_SECONDS metric");

    /// Application build info
    ///
    /// Labels: version
    pub static ref BUILD_INFO: GaugeVec = GaugeVec::new(
        Opts::new("build_info", "Application build information")
            .namespace(NAMESPACE),
        &["version"]
    ).expect("Failed to create BUILD_INFO metric");
}

fn register<C>(collector: C) -> Result<(), prometheus::Error>
where
    C: prometheus::core::Collector + 'static,
{
    match PROMETHEUS_REGISTRY.register(Box::new(collector)) {
        Ok(()) | Err(prometheus::Error::AlreadyReg) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Register all metrics with the global registry.
///
/// Safe to call more than once.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    register(RISK_PREDICTIONS_TOTAL.clone())?;
    register(RISK_LEVEL_TOTAL.clone())?;
    register(RISK_PREDICTION_DURATION_SECONDS.clone())?;

    register(DEMAND_FORECASTS_TOTAL.clone())?;
    register(DEMAND_ANOMALIES_TOTAL.clone())?;
    register(SHORTAGE_DAYS_TOTAL.clone())?;

    register(MODEL_TRAINING_TOTAL.clone())?;
    register(MODEL_TRAINING_DURATION_SECONDS.clone())?;

    register(BUILD_INFO.clone())?;
    BUILD_INFO
        .with_label_values(&[env!("CARGO_PKG_VERSION")])
        .set(1.0);

    tracing::info!("Prometheus metrics initialized successfully");
    Ok(())
}

/// Render all registered metrics in the Prometheus text format
pub fn gather_metrics() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let metric_families = PROMETHEUS_REGISTRY.gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return String::from("# Error encoding metrics\n");
    }

    String::from_utf8(buffer).unwrap_or_else(|e| {
        tracing::error!("Failed to convert metrics to string: {}", e);
        String::from("# Error converting metrics\n")
    })
}
