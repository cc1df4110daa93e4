use anyhow::Context;
use clap::{Parser, Subcommand};
use meal_shortage_engine::{
    config::Config,
    forecast::Observation,
    ml::FeatureVector,
    PredictionService,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "meal-engine-cli")]
#[command(about = "Meal shortage risk scoring and demand forecasting", long_about = None)]
#[command(version)]
struct Cli {
    /// Risk model artifact to load instead of training the bootstrap model
    #[arg(long, global = true, env = "MEAL_ENGINE_RISK_MODEL")]
    risk_model: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Score one school (JSON object with the 15 features)
    PredictRisk {
        #[arg(short, long)]
        input: PathBuf,
    },
    /// Score a JSON array of feature objects
    BatchPredictRisk {
        #[arg(short, long)]
        input: PathBuf,
    },
    /// Score one school and list per-feature contributions
    ExplainRisk {
        #[arg(short, long)]
        input: PathBuf,
    },
    /// Gain importance of every feature, highest first
    FeatureImportance,
    /// Retrain the risk model on `{"rows": [[...]], "labels": [...]}` and save it
    TrainRisk {
        #[arg(short, long)]
        data: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Forecast daily meal demand for a school
    Forecast {
        #[arg(short, long)]
        school_id: String,
        #[arg(short, long, default_value = "7")]
        days: u32,
        #[arg(short, long)]
        capacity: Option<u32>,
        /// JSON array of `{"date", "value"}` observations; synthetic history when omitted
        #[arg(long)]
        history: Option<PathBuf>,
    },
    /// Trend and seasonal breakdown over the next 30 days
    Components {
        #[arg(short, long)]
        school_id: String,
        #[arg(long)]
        history: Option<PathBuf>,
    },
    /// Flag observed days outside the prediction interval
    Anomalies {
        #[arg(short, long)]
        school_id: String,
        /// JSON array of `{"date", "value"}` observations to check
        #[arg(short, long)]
        input: PathBuf,
        #[arg(long)]
        history: Option<PathBuf>,
    },
}

impl Commands {
    /// Subcommands that score with an already loaded or bootstrapped risk model
    fn needs_risk_model(&self) -> bool {
        matches!(
            self,
            Commands::PredictRisk { .. }
                | Commands::BatchPredictRisk { .. }
                | Commands::ExplainRisk { .. }
                | Commands::FeatureImportance
        )
    }
}

#[derive(Debug, Deserialize)]
struct TrainingFile {
    rows: Vec<Vec<f64>>,
    labels: Vec<f64>,
}

#[derive(Debug, Serialize)]
struct RankedImportance {
    feature: String,
    importance: f64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load().unwrap_or_default();
    if cli.risk_model.is_some() {
        config.artifacts.risk_model_path = cli.risk_model.clone();
    }
    // The CLI never writes artifacts implicitly.
    config.artifacts.demand_model_dir = None;

    let service = PredictionService::new(config);
    if cli.command.needs_risk_model() {
        service.start().await?;
    }

    match cli.command {
        Commands::PredictRisk { input } => {
            let vector = read_feature_vector(&input)?;
            print_json(&service.predict_risk(&vector)?)?;
        }
        Commands::BatchPredictRisk { input } => {
            let raw: Vec<serde_json::Value> = read_json(&input)?;
            let vectors = raw
                .into_iter()
                .map(parse_feature_vector)
                .collect::<anyhow::Result<Vec<_>>>()?;
            print_json(&service.predict_risk_batch(&vectors)?)?;
        }
        Commands::ExplainRisk { input } => {
            let vector = read_feature_vector(&input)?;
            print_json(&service.explain_risk(&vector)?)?;
        }
        Commands::FeatureImportance => {
            let ranked: Vec<RankedImportance> = service
                .risk_model()
                .ranked_feature_importance()?
                .into_iter()
                .map(|(feature, importance)| RankedImportance { feature, importance })
                .collect();
            print_json(&ranked)?;
        }
        Commands::TrainRisk { data, output } => {
            let file: TrainingFile = read_json(&data)?;
            let metrics = service.retrain_risk(file.rows, file.labels).await?;
            service.risk_model().save(&output)?;
            eprintln!("Saved risk model to {}", output.display());
            print_json(&metrics)?;
        }
        Commands::Forecast {
            school_id,
            days,
            capacity,
            history,
        } => {
            train_school(&service, &school_id, history.as_deref()).await?;
            print_json(&service.forecast_demand(&school_id, days, capacity).await?)?;
        }
        Commands::Components { school_id, history } => {
            train_school(&service, &school_id, history.as_deref()).await?;
            print_json(&service.demand_components(&school_id).await?)?;
        }
        Commands::Anomalies {
            school_id,
            input,
            history,
        } => {
            train_school(&service, &school_id, history.as_deref()).await?;
            let observed: Vec<Observation> = read_json(&input)?;
            let (dates, values): (Vec<_>, Vec<_>) =
                observed.iter().map(|o| (o.date, o.value)).unzip();
            let anomalies = service
                .detect_demand_anomalies(&school_id, &values, &dates)
                .await?;
            print_json(&anomalies)?;
        }
    }

    service.stop().await?;
    Ok(())
}

async fn train_school(
    service: &PredictionService,
    school_id: &str,
    history: Option<&Path>,
) -> anyhow::Result<()> {
    let series = match history {
        Some(path) => Some(read_json::<Vec<Observation>>(path)?),
        None => None,
    };
    service.train_demand(school_id, series).await?;
    Ok(())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("failed to parse {}", path.display()))
}

fn read_feature_vector(path: &Path) -> anyhow::Result<FeatureVector> {
    parse_feature_vector(read_json(path)?)
}

/// Accept either the typed object or a plain name → number map.
fn parse_feature_vector(value: serde_json::Value) -> anyhow::Result<FeatureVector> {
    match serde_json::from_value::<FeatureVector>(value.clone()) {
        Ok(vector) => Ok(vector),
        Err(_) => {
            let map: HashMap<String, f64> =
                serde_json::from_value(value).context("features must be a JSON object of numbers")?;
            Ok(FeatureVector::from_map(&map)?)
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
