//! CLI entry point for the route deviation tool.
//!
//! Provides subcommands for matching bus traces against official route
//! variants, cleaning raw AVL exports, counting street usage and building
//! per-vehicle deviation reports.

use anyhow::{Context, Result, bail};
use chrono::{NaiveDate, NaiveDateTime};
use clap::{Parser, Subcommand, ValueEnum};
use route_deviation::{
    cleaner::clean_with_stats,
    config::AnalysisConfig,
    denoise::denoise,
    fetch::{BasicClient, auth::UrlParam, read_source},
    matcher::RouteMatcher,
    output::{Exporter, FileExporter, PredictionRow, read_predictions, write_records},
    parser::{parse_feed, read_csv_records, records_from_feed},
    pipeline::{Pipeline, count_streets},
    record::GpsRecord,
    report::{build_report, s3::upload_file, s3::write_json_to_s3},
    routes::{NodeTable, RouteVariant, load_route_file},
    snapper::{OsrmSnapper, PassthroughSnapper, Snapper},
};
use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

#[derive(Parser)]
#[command(name = "route_deviation")]
#[command(about = "Match bus GPS traces against official route variants", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum InputFormat {
    /// AVL export with configurable column names
    Csv,
    /// Protobuf GTFS Realtime VehiclePositions snapshots
    GtfsRt,
}

#[derive(clap::Args)]
struct InputArgs {
    /// GPS files or URLs to read
    #[arg(value_name = "FILE_OR_URL", required = true)]
    inputs: Vec<String>,

    /// Format of every input
    #[arg(short, long, value_enum, default_value_t = InputFormat::Csv)]
    format: InputFormat,

    /// JSON settings file; missing fields keep their defaults
    #[arg(short, long)]
    config: Option<String>,

    /// Keep only records of this route (CSV route column or GTFS-RT route_id)
    #[arg(long)]
    route: Option<String>,

    /// Keep only records of this vehicle plate
    #[arg(long)]
    plate: Option<String>,

    /// Drop records before this local time (inclusive), e.g. "2023-09-12 05:00:00"
    #[arg(long, value_parser = parse_local_time)]
    start: Option<NaiveDateTime>,

    /// Drop records after this local time (inclusive)
    #[arg(long, value_parser = parse_local_time)]
    end: Option<NaiveDateTime>,
}

#[derive(clap::Args)]
struct SnapArgs {
    /// OSRM base URL; falls back to OSRM_URL, and to no snapping if unset
    #[arg(long)]
    osrm_url: Option<String>,

    /// API key sent as the `access_token` query parameter; falls back to OSRM_API_KEY
    #[arg(long)]
    snap_api_key: Option<String>,

    /// OSRM routing profile
    #[arg(long, default_value = "driving")]
    osrm_profile: String,

    /// Maximum number of vehicles processed concurrently
    #[arg(long)]
    concurrency: Option<usize>,
}

#[derive(Subcommand)]
enum Commands {
    /// Match traces against route variants and write predictions
    Match {
        #[command(flatten)]
        input: InputArgs,

        #[command(flatten)]
        snap: SnapArgs,

        /// Route JSON (node segments with --nodes, coordinate lists otherwise)
        #[arg(long)]
        routes: PathBuf,

        /// Node table CSV resolving the route's node ids
        #[arg(long)]
        nodes: Option<PathBuf>,

        /// Identifier recorded on every loaded variant
        #[arg(long, default_value = "route")]
        route_id: String,

        /// Directory for predictions.csv, streets.csv, report.json and map.geojson
        #[arg(short = 'd', long, default_value = "out")]
        output_dir: PathBuf,

        /// Window size in minutes
        #[arg(short, long)]
        window: Option<i64>,

        /// Maximum distance in meters for a point to count towards a variant
        #[arg(long)]
        radius: Option<f64>,

        /// Scores closer than this many meters are ties
        #[arg(long)]
        tie_tolerance: Option<f64>,

        /// Also write a GeoJSON map of variants and trace points
        #[arg(long, default_value_t = false)]
        map: bool,

        /// Optional: S3 bucket to upload outputs to (e.g., "my-bucket")
        #[arg(long)]
        s3_bucket: Option<String>,

        /// Key prefix for uploaded files
        #[arg(long, default_value = "route_deviation")]
        s3_prefix: String,

        /// Optional: Gzip compress CSV files before uploading to S3
        #[arg(long, default_value_t = false)]
        gzip: bool,
    },
    /// Clean (and optionally denoise) raw records into a CSV
    Clean {
        #[command(flatten)]
        input: InputArgs,

        /// CSV file to write cleaned records to
        #[arg(short, long, default_value = "cleaned.csv")]
        output: PathBuf,

        /// Collapse repeated fixes and drop jitter
        #[arg(long, default_value_t = false)]
        denoise: bool,
    },
    /// Count how often each street is travelled
    Streets {
        #[command(flatten)]
        input: InputArgs,

        #[command(flatten)]
        snap: SnapArgs,

        /// CSV file to write street counts to
        #[arg(short, long, default_value = "streets.csv")]
        output: PathBuf,
    },
    /// Build the per-vehicle deviation report from a predictions CSV
    Report {
        /// Predictions CSV written by `match`
        #[arg(value_name = "PREDICTIONS")]
        predictions: PathBuf,

        /// JSON settings file; missing fields keep their defaults
        #[arg(short, long)]
        config: Option<String>,

        /// JSON file to write the report to
        #[arg(short, long, default_value = "report.json")]
        output: PathBuf,

        /// Optional: S3 bucket to upload the report and index to
        #[arg(long)]
        s3_bucket: Option<String>,

        /// Key prefix for uploaded files
        #[arg(long, default_value = "route_deviation")]
        s3_prefix: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Load .env file

    // Logging setup: colored stderr + JSON rolling log file
    let log_file_path =
        std::env::var("LOG_FILE_PATH").unwrap_or_else(|_| "logs/route_deviation.log".to_string());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("route_deviation.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, _file_guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_env("RUST_LOG").add_directive("info".parse()?));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(EnvFilter::from_env("RUST_LOG_JSON").add_directive("debug".parse()?));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Match {
            input,
            snap,
            routes,
            nodes,
            route_id,
            output_dir,
            window,
            radius,
            tie_tolerance,
            map,
            s3_bucket,
            s3_prefix,
            gzip,
        } => {
            let mut config = load_config(&input, Some(&snap))?;
            if let Some(window) = window {
                config.window_minutes = window;
            }
            if let Some(radius) = radius {
                config.matcher.max_search_radius_m = radius;
            }
            if let Some(tolerance) = tie_tolerance {
                config.matcher.tie_tolerance_m = tolerance;
            }

            let node_table = nodes.as_deref().map(NodeTable::load).transpose()?;
            let variants = load_route_file(&routes, &route_id, node_table.as_ref())?;
            let records = load_records(&input.inputs, input.format, &config).await?;

            let snapper = build_snapper(&snap)?;
            let matcher = RouteMatcher::new(variants, config.matcher);
            let pipeline = Pipeline::new(matcher, snapper, config.clone())?;
            let outcome = pipeline.run(records).await?;

            let exporter = FileExporter::new(&output_dir)?;
            let predictions = exporter.write_csv(&outcome.results)?;
            let streets_path = output_dir.join("streets.csv");
            outcome.streets.write_csv(&streets_path)?;

            let rows: Vec<PredictionRow> =
                outcome.results.iter().map(PredictionRow::from).collect();
            let report = build_report(&rows, &config, outcome.failures);
            let report_path = output_dir.join("report.json");
            std::fs::write(&report_path, serde_json::to_vec_pretty(&report)?)?;

            let mut written = vec![predictions, streets_path, report_path];
            if map {
                let variants: Vec<RouteVariant> = pipeline.matcher().variants().cloned().collect();
                written.push(exporter.render_map(&outcome.results, &variants)?);
            }

            if let Some(bucket) = s3_bucket {
                let aws = aws_config::load_from_env().await;
                let s3 = aws_sdk_s3::Client::new(&aws);
                info!(bucket = %bucket, gzip, "S3 upload enabled");
                for path in &written {
                    let compress = gzip && path.extension() == Some(OsStr::new("csv"));
                    upload_file(&s3, &bucket, &s3_prefix, path, compress).await?;
                }
            }

            info!(
                output_dir = %output_dir.display(),
                windows = outcome.results.len(),
                vehicles = report.vehicles.len(),
                "Match finished"
            );
        }
        Commands::Clean {
            input,
            output,
            denoise: denoise_enabled,
        } => {
            let mut config = load_config(&input, None)?;
            if denoise_enabled {
                config.denoise.enabled = true;
            }

            let records = load_records(&input.inputs, input.format, &config).await?;
            let (cleaned, stats) = clean_with_stats(records, &config.clean_rules())?;
            let cleaned = denoise_per_vehicle_day(cleaned, &config)?;

            write_records(&output, &cleaned)?;
            info!(
                path = %output.display(),
                input = stats.input,
                kept = stats.kept,
                written = cleaned.len(),
                "Cleaned records written"
            );
        }
        Commands::Streets {
            input,
            snap,
            output,
        } => {
            let config = load_config(&input, Some(&snap))?;
            let records = load_records(&input.inputs, input.format, &config).await?;

            let snapper = build_snapper(&snap)?;
            let (streets, failures) =
                count_streets(Arc::new(snapper), Arc::new(config), records).await?;
            if streets.is_empty() {
                warn!("No street names reported; is a snapping service configured?");
            }
            streets.write_csv(&output)?;

            info!(
                path = %output.display(),
                streets = streets.sorted().len(),
                failed_vehicles = failures.len(),
                "Street counts written"
            );
        }
        Commands::Report {
            predictions,
            config,
            output,
            s3_bucket,
            s3_prefix,
        } => {
            let config = AnalysisConfig::load_or_default(config.as_deref())?;
            let rows = read_predictions(&predictions)?;
            let report = build_report(&rows, &config, Vec::new());

            std::fs::write(&output, serde_json::to_vec_pretty(&report)?)
                .with_context(|| format!("writing {}", output.display()))?;
            info!(path = %output.display(), vehicles = report.vehicles.len(), "Report written");

            if let Some(bucket) = s3_bucket {
                let aws = aws_config::load_from_env().await;
                let s3 = aws_sdk_s3::Client::new(&aws);
                let prefix = s3_prefix.trim_matches('/');
                write_json_to_s3(&s3, &bucket, &format!("{prefix}/report.json"), &report).await?;
                write_json_to_s3(&s3, &bucket, &format!("{prefix}/index.json"), &report.index())
                    .await?;
                info!(bucket = %bucket, prefix, "Report uploaded to S3");
            }
        }
    }

    Ok(())
}

/// Settings file plus the CLI overrides shared by several subcommands.
fn load_config(input: &InputArgs, snap: Option<&SnapArgs>) -> Result<AnalysisConfig> {
    let mut config = AnalysisConfig::load_or_default(input.config.as_deref())?;
    if input.route.is_some() {
        config.route = input.route.clone();
    }
    if input.plate.is_some() {
        config.plate = input.plate.clone();
    }
    if input.start.is_some() {
        config.start_time = input.start;
    }
    if input.end.is_some() {
        config.end_time = input.end;
    }
    if let Some(concurrency) = snap.and_then(|s| s.concurrency) {
        config.concurrency = concurrency;
    }
    Ok(config)
}

/// Local wall-clock time for `--start` and `--end`.
fn parse_local_time(raw: &str) -> std::result::Result<NaiveDateTime, String> {
    ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw.trim(), format).ok())
        .ok_or_else(|| format!("expected a local time like \"2023-09-12 07:00:00\", got {raw:?}"))
}

/// Reads and parses every input, in order.
#[tracing::instrument(skip_all, fields(inputs = inputs.len()))]
async fn load_records(
    inputs: &[String],
    format: InputFormat,
    config: &AnalysisConfig,
) -> Result<Vec<GpsRecord>> {
    let client = BasicClient::new();
    let offset = config.utc_offset()?;
    let route = config.route.as_deref();

    let mut records = Vec::new();
    for source in inputs {
        let bytes = read_source(&client, source)
            .await
            .with_context(|| format!("loading {source}"))?;
        let parsed = match format {
            InputFormat::Csv => {
                read_csv_records(bytes.as_slice(), &config.columns, route, &offset)
                    .with_context(|| format!("parsing {source}"))?
            }
            InputFormat::GtfsRt => {
                let feed = parse_feed(&bytes).with_context(|| format!("parsing {source}"))?;
                records_from_feed(&feed, route, &offset)
            }
        };
        info!(source = %source, records = parsed.len(), "Input loaded");
        records.extend(parsed);
    }

    if records.is_empty() {
        bail!("no GPS records found in {} input(s)", inputs.len());
    }
    Ok(records)
}

/// OSRM snapping when a base URL is configured, pass-through otherwise.
fn build_snapper(args: &SnapArgs) -> Result<Box<dyn Snapper>> {
    let base_url = args
        .osrm_url
        .clone()
        .or_else(|| std::env::var("OSRM_URL").ok())
        .filter(|u| !u.is_empty());
    let api_key = args
        .snap_api_key
        .clone()
        .or_else(|| std::env::var("OSRM_API_KEY").ok())
        .filter(|k| !k.is_empty());

    let Some(base_url) = base_url else {
        info!("No OSRM URL configured, points are not snapped");
        return Ok(Box::new(PassthroughSnapper));
    };

    let client = BasicClient::with_timeouts(Duration::from_secs(5), Duration::from_secs(15))?;
    info!(base_url = %base_url, authenticated = api_key.is_some(), "Snapping through OSRM");
    Ok(match api_key {
        Some(key) => Box::new(
            OsrmSnapper::new(UrlParam::new(client, "access_token", key), base_url)
                .with_profile(&args.osrm_profile),
        ),
        None => Box::new(OsrmSnapper::new(client, base_url).with_profile(&args.osrm_profile)),
    })
}

/// Applies the denoiser to each vehicle-day trace, keeping vehicle order.
fn denoise_per_vehicle_day(
    records: Vec<GpsRecord>,
    config: &AnalysisConfig,
) -> Result<Vec<GpsRecord>> {
    if !config.denoise.enabled {
        return Ok(records);
    }

    let mut traces: BTreeMap<(String, NaiveDate), Vec<GpsRecord>> = BTreeMap::new();
    for record in records {
        traces
            .entry((record.vehicle_id.clone(), record.date()))
            .or_default()
            .push(record);
    }

    let mut denoised = Vec::new();
    for trace in traces.into_values() {
        denoised.extend(denoise(trace, &config.denoise)?);
    }
    Ok(denoised)
}
