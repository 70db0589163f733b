mod calibration;
mod fusion;

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use std::path::Path;
use tracing::{info, warn};

use calibration::history::{Provenance, ValidationLog, ValidationRecord};
use calibration::store::CalibrationStore;
use fusion::pipeline::{self, CalibrationOverride, FusionRequest};
use fusion::FusionConfig;

const CALIBRATION_FILE: &str = "calibration.json";
const VALIDATION_LOG_FILE: &str = "validation_log.json";

#[derive(Parser)]
#[command(name = "weather-fusion", about = "Forecast fusion engine for bucketed temperature markets")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compute bucket probabilities for a resolved request file
    Predict {
        /// Path to a JSON request (ensemble members, anchors, percentiles)
        #[arg(short, long)]
        input: String,
        /// Treat this date as "today" for nowcast eligibility (default: the current UTC date)
        #[arg(short, long)]
        date: Option<NaiveDate>,
    },
    /// Recompute per-location calibration from the validation log
    Calibrate,
    /// Upsert one outcome row into the validation log
    Record {
        #[arg(short, long)]
        location: String,
        #[arg(short, long)]
        date: NaiveDate,
        /// Observed daily high from the resolution source
        #[arg(long)]
        actual: Option<f64>,
        /// Pooled ensemble mean recorded at prediction time
        #[arg(long)]
        ensemble_mean: Option<f64>,
        /// Point anchor value recorded at prediction time
        #[arg(long)]
        anchor: Option<f64>,
        /// Mark the row as backfilled rather than organically observed
        #[arg(long)]
        backfilled: bool,
    },
    /// Show validation log rows
    History {
        #[arg(short, long)]
        location: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "weather_fusion=info".into()),
        )
        .init();

    // Load .env if present (override system env vars)
    dotenvy::dotenv_override().ok();

    let cli = Cli::parse();
    let config = FusionConfig::load()?;

    match cli.command {
        Commands::Predict { input, date } => {
            let data = std::fs::read_to_string(&input)
                .with_context(|| format!("Failed to read request file {}", input))?;
            let mut request: FusionRequest =
                serde_json::from_str(&data).context("Failed to parse request file")?;

            let store = CalibrationStore::load(Path::new(CALIBRATION_FILE));
            if request.calibration.is_none() {
                request.calibration = lookup_calibration(&store, &request.location, &config);
            }

            let today = date.unwrap_or_else(|| Utc::now().date_naive());
            let result = pipeline::compute_blocking(request, config, today).await?;

            println!("\n🌡️  {} — {}", result.location, result.forecast_date);
            println!(
                "   Mean: {:.1}°F raw → {:.1}°F corrected (σ={:.1}, spread×{:.2})",
                result.raw_mean, result.corrected_mean, result.ensemble_std, result.spread_factor
            );
            println!("   Anchor: {}", result.anchor_source);
            for (kind, shift) in &result.anchor_shifts {
                println!("     {} shift: {:+.2}°F", kind, shift);
            }
            if let Some(bias) = result.calibration_bias {
                println!("   Calibration bias: {:+.2}°F", bias);
            }
            let members: usize = result.source_counts.values().sum();
            println!(
                "   Members: {} ({})",
                members,
                result
                    .source_counts
                    .iter()
                    .map(|(name, count)| format!("{}={}", name, count))
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            println!("\n{:<10} {:>12}", "Bucket", "Probability");
            println!("{}", "-".repeat(24));
            for bucket in &result.buckets {
                println!("{:<10} {:>11.1}%", bucket.label, bucket.probability * 100.0);
            }
        }
        Commands::Calibrate => {
            let log = ValidationLog::load(Path::new(VALIDATION_LOG_FILE));
            if log.is_empty() {
                warn!("Validation log is empty — nothing to calibrate");
                println!("Validation log is empty — nothing to calibrate");
                return Ok(());
            }

            let params = calibration::compute_calibration(&log, &config);
            let store = CalibrationStore::new();
            store.replace(params);
            store.save(Path::new(CALIBRATION_FILE))?;

            println!("\n{:<10} {:>8} {:>8} {:>6} {:>10}", "Location", "Bias", "Spread", "Rows", "Effective");
            println!("{}", "-".repeat(46));
            let snapshot = store.snapshot();
            let mut locations: Vec<_> = snapshot.keys().collect();
            locations.sort();
            for location in locations {
                let p = &snapshot[location];
                println!(
                    "{:<10} {:>+8.2} {:>8.2} {:>6} {:>10.1}",
                    p.location, p.bias_offset, p.spread_factor, p.sample_size, p.effective_sample_size
                );
            }
            println!("\nCalibrated {} locations from {} rows", snapshot.len(), log.len());
        }
        Commands::Record { location, date, actual, ensemble_mean, anchor, backfilled } => {
            let mut log = ValidationLog::load(Path::new(VALIDATION_LOG_FILE));
            log.upsert(ValidationRecord {
                location: location.clone(),
                date,
                actual_high: actual,
                ensemble_mean,
                anchor_point: anchor,
                provenance: if backfilled { Provenance::Backfilled } else { Provenance::Organic },
            });
            log.save(Path::new(VALIDATION_LOG_FILE))?;
            info!("Recorded outcome row for {} on {}", location, date);
            println!("Recorded {} {} ({} rows total)", location, date, log.len());
        }
        Commands::History { location } => {
            let log = ValidationLog::load(Path::new(VALIDATION_LOG_FILE));
            println!(
                "\n{:<10} {:<12} {:>8} {:>10} {:>8} {:>12}",
                "Location", "Date", "Actual", "Ensemble", "Anchor", "Provenance"
            );
            println!("{}", "-".repeat(66));
            let mut shown = 0;
            for row in &log.records {
                if let Some(filter) = &location {
                    if &row.location != filter {
                        continue;
                    }
                }
                println!(
                    "{:<10} {:<12} {:>8} {:>10} {:>8} {:>12}",
                    row.location,
                    row.date.to_string(),
                    fmt_opt(row.actual_high),
                    fmt_opt(row.ensemble_mean),
                    fmt_opt(row.anchor_point),
                    row.provenance.to_string(),
                );
                shown += 1;
            }
            println!("\nShowing {} of {} rows", shown, log.len());
        }
    }

    Ok(())
}

/// Pull stored params for a location, refusing records pinned to a
/// different anchor blend weight than the one currently being served
fn lookup_calibration(
    store: &CalibrationStore,
    location: &str,
    config: &FusionConfig,
) -> Option<CalibrationOverride> {
    let params = store.get(location)?;
    if (params.blend_weight - config.anchor_blend_weight).abs() > 1e-9 {
        warn!(
            "Calibration for {} was computed with blend weight {} but serving uses {} — ignoring until recomputed",
            location, params.blend_weight, config.anchor_blend_weight
        );
        return None;
    }
    Some(CalibrationOverride {
        bias_offset: params.bias_offset,
        spread_factor: params.spread_factor,
    })
}

fn fmt_opt(v: Option<f64>) -> String {
    v.map(|x| format!("{:.1}", x)).unwrap_or_else(|| "-".to_string())
}
