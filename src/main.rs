use meal_shortage_engine::{
    config::Config,
    ml::{FeatureVector, RiskLevel},
    PredictionService,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// School used for the startup forecast self-check
const SELF_CHECK_SCHOOL: &str = "SELF_CHECK";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = Config::load().unwrap_or_else(|e| {
        eprintln!("Failed to load configuration: {}", e);
        eprintln!("Using default configuration");
        Config::default()
    });

    init_tracing(&config);

    tracing::info!("Starting Meal Shortage Engine v{}", env!("CARGO_PKG_VERSION"));

    // Initialize Prometheus metrics
    if config.observability.prometheus_enabled {
        if let Err(e) = meal_shortage_engine::metrics::init_metrics() {
            tracing::warn!("Failed to initialize metrics: {}", e);
            tracing::warn!("Continuing without metrics");
        }
    } else {
        tracing::info!("Prometheus metrics disabled in configuration");
    }

    let service = PredictionService::new(config.clone());
    service.start().await?;

    self_check(&service).await?;

    if config.artifacts.save_on_startup {
        service.save_artifacts()?;
        tracing::info!("Model artifacts saved");
    }

    let stats = service.stats().await;
    tracing::info!(
        risk_ready = stats.risk_model_ready,
        risk_rounds = stats.risk_rounds,
        demand_schools = stats.demand_schools,
        "Engines ready"
    );
    println!("{}", serde_json::to_string_pretty(&service.model_metrics())?);

    if config.observability.prometheus_enabled {
        tracing::debug!("{}", meal_shortage_engine::metrics::gather_metrics());
    }

    service.stop().await?;
    Ok(())
}

fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("meal_shortage_engine={}", config.observability.log_level).into()
    });

    if config.observability.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// Score a known high-risk school and forecast a placeholder school.
async fn self_check(service: &PredictionService) -> anyhow::Result<()> {
    let stressed = FeatureVector {
        enrollment: 500,
        current_attendance: 300,
        capacity: 450,
        avg_meal_uptake: 290,
        attendance_rate: 0.6,
        capacity_utilization: 1.0,
        days_since_inspection: 90,
        previous_shortage_count: 8,
        budget_utilization_rate: 0.85,
        supply_chain_delay_days: 10,
        weather_risk_score: 50.0,
        seasonal_factor: 1.0,
        hostel_attached: 0,
        enrollment_trend_7d: 0.0,
        attendance_trend_7d: 0.0,
    };

    let prediction = service.predict_risk(&stressed)?;
    if prediction.risk_level == RiskLevel::Critical {
        tracing::info!(score = prediction.risk_score, "Risk self-check passed");
    } else {
        tracing::warn!(
            score = prediction.risk_score,
            level = %prediction.risk_level,
            "Risk self-check: stressed school did not score Critical"
        );
    }

    let report = service.forecast_demand(SELF_CHECK_SCHOOL, 7, None).await?;
    tracing::info!(
        avg = report.avg_predicted_demand,
        max = report.max_predicted_demand,
        "Demand self-check passed"
    );
    Ok(())
}
