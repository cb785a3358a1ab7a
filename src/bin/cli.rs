use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{bail, Context};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cdreclass::config::{set_global_config, AnalysisConfig};
use cdreclass::cookbook;
use cdreclass::prelude::*;

#[derive(Parser)]
#[command(name = "cdcli")]
#[command(about = "Controlled drug reclassification CLI - query, cache, aggregate and chart prescribing data", long_about = None)]
#[command(version)]
struct Cli {
    /// Explicit config file, layered over the per-user one
    #[arg(long, global = true, env = "CDRECLASS_CONFIG")]
    config: Option<PathBuf>,
    /// Override the cache directory
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,
    /// Override the output directory for charts and maps
    #[arg(long, global = true)]
    output_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the available scenarios
    List,
    /// Run scenarios: cached query, aggregation, charts
    Run(RunArgs),
    /// Total a measure by month from a CSV extract
    Aggregate(AggregateArgs),
    /// Draw a choropleth for one month of a CSV extract
    Map(MapArgs),
    /// Show or create the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Scenario id; repeat to run several (default: all)
    #[arg(short, long = "scenario")]
    scenarios: Vec<String>,
    /// Ignore existing cache files and re-query
    #[arg(long)]
    refresh: bool,
    /// GeoJSON boundaries for scenarios that draw a map
    #[arg(long)]
    boundaries: Option<PathBuf>,
}

#[derive(Args)]
struct AggregateArgs {
    /// CSV extract to read
    #[arg(long)]
    csv: PathBuf,
    #[arg(long, default_value = "month")]
    time_column: String,
    /// Numeric column to total
    #[arg(long)]
    measure: String,
    /// Keep only rows where COLUMN=VALUE
    #[arg(long)]
    filter: Option<EqFilter>,
    /// Also draw the series to this SVG file
    #[arg(long, requires = "change_date")]
    chart: Option<PathBuf>,
    /// Legislation change date marked on the chart
    #[arg(long, value_parser = month_arg)]
    change_date: Option<NaiveDate>,
    /// Upper bound of the chart's y axis
    #[arg(long)]
    y_max: Option<f64>,
}

#[derive(Args)]
struct MapArgs {
    /// CSV extract to read
    #[arg(long)]
    csv: PathBuf,
    /// GeoJSON FeatureCollection of region boundaries
    #[arg(long)]
    boundaries: Option<PathBuf>,
    /// Month to map, e.g. 2020-05
    #[arg(long, value_parser = month_arg)]
    month: NaiveDate,
    /// Value column to shade by
    #[arg(long)]
    column: String,
    #[arg(long, default_value = "pct")]
    region_column: String,
    #[arg(long, default_value = "month")]
    time_column: String,
    /// Draw London regions in an inset
    #[arg(long)]
    separate_london: bool,
    #[arg(long)]
    title: Option<String>,
    /// Output SVG, relative to the output directory (default: map.svg)
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,
    /// Write a default configuration file
    Init {
        /// Destination (default: the per-user config path)
        #[arg(long)]
        path: Option<PathBuf>,
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn month_arg(raw: &str) -> std::result::Result<NaiveDate, String> {
    parse_month(raw).map_err(|e| e.to_string())
}

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("cdreclass=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitCode::FAILURE;
        }
    };
    set_global_config(config.clone());

    let result = match cli.command {
        Commands::List => cmd_list(&config),
        Commands::Run(args) => cmd_run(&config, args),
        Commands::Aggregate(args) => cmd_aggregate(&config, args),
        Commands::Map(args) => cmd_map(&config, args),
        Commands::Config { action } => cmd_config(&config, action),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            match e.downcast_ref::<ReclassError>() {
                Some(err) => eprintln!("Error: {}", err.user_message()),
                None => eprintln!("Error: {:#}", e),
            }
            ExitCode::FAILURE
        }
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<AnalysisConfig> {
    let mut config = AnalysisConfig::load_layered(cli.config.as_deref()).context("loading configuration")?;
    if let Some(dir) = &cli.cache_dir {
        config.cache_dir = dir.clone();
    }
    if let Some(dir) = &cli.output_dir {
        config.output_dir = dir.clone();
    }
    Ok(config)
}

fn registry(config: &AnalysisConfig) -> anyhow::Result<ScenarioRegistry> {
    match &config.scenarios_file {
        Some(path) => ScenarioRegistry::from_file(path)
            .with_context(|| format!("loading scenarios from {}", path.display())),
        None => Ok(ScenarioRegistry::builtin()),
    }
}

/// Remote backend when credentials are configured, otherwise cache files only
fn backend(config: &AnalysisConfig) -> Box<dyn QueryBackend> {
    if !config.has_remote_credentials() {
        info!("no remote credentials configured; reading cache files only");
        return Box::new(CacheOnlyBackend);
    }
    match config.remote_config().and_then(BigQueryClient::new) {
        Ok(client) => Box::new(client),
        Err(e) => {
            warn!(error = %e, "remote backend unavailable; reading cache files only");
            Box::new(CacheOnlyBackend)
        }
    }
}

fn cmd_list(config: &AnalysisConfig) -> anyhow::Result<()> {
    let registry = registry(config)?;
    println!("{:<18} {:<12} {:<28} {}", "id", "change", "cache file", "title");
    for scenario in registry.iter() {
        println!(
            "{:<18} {:<12} {:<28} {}",
            scenario.id,
            scenario.change_date.format("%Y-%m-%d"),
            scenario.cache_file.display(),
            scenario.title
        );
    }
    Ok(())
}

fn cmd_run(config: &AnalysisConfig, args: RunArgs) -> anyhow::Result<()> {
    let registry = registry(config)?;
    let selected = registry.select(&args.scenarios)?;

    let boundaries = match args.boundaries.as_ref().or(config.boundaries_file.as_ref()) {
        Some(path) => Some(
            RegionBoundaries::from_path(path, &config.region_property)
                .with_context(|| format!("loading boundaries from {}", path.display()))?,
        ),
        None => None,
    };

    let runner = CachedQueryRunner::new(backend(config))
        .with_cache_dir(&config.cache_dir)
        .with_corrupt_policy(config.corrupt_cache_policy)
        .with_use_cache(!args.refresh);
    let options = RunOptions {
        chart_width: config.chart_width,
        chart_height: config.chart_height,
        boundaries: boundaries.as_ref(),
        ..Default::default()
    };

    let mut failed = Vec::new();
    for scenario in selected {
        match run_scenario(&runner, scenario, &config.output_dir, &options) {
            Ok(report) => report.print_summary(),
            Err(e) => {
                eprintln!("\nScenario '{}' failed: {}", scenario.id, e.user_message());
                failed.push(scenario.id.clone());
            }
        }
    }

    if !failed.is_empty() {
        bail!("{} scenario(s) failed: {}", failed.len(), failed.join(", "));
    }
    Ok(())
}

fn cmd_aggregate(config: &AnalysisConfig, args: AggregateArgs) -> anyhow::Result<()> {
    let series = cookbook::monthly_totals_from_csv(&args.csv, &args.time_column, &args.measure, args.filter.as_ref())?;
    series.print_table(&args.measure);

    if let (Some(path), Some(change_date)) = (&args.chart, args.change_date) {
        let title = match &args.filter {
            Some(filter) => format!("{} ({})", args.measure, filter),
            None => args.measure.clone(),
        };
        TimeSeriesChart::new(title, change_date)
            .with_y_max(args.y_max)
            .with_size(config.chart_width, config.chart_height)
            .save(&series, path)?;
        println!("Chart written to {}", path.display());
    }
    Ok(())
}

fn cmd_map(config: &AnalysisConfig, args: MapArgs) -> anyhow::Result<()> {
    let Some(boundaries_path) = args.boundaries.as_ref().or(config.boundaries_file.as_ref()) else {
        bail!("no boundaries file given; pass --boundaries or set boundaries_file in the config");
    };
    let boundaries = RegionBoundaries::from_path(boundaries_path, &config.region_property)?;
    let title = args
        .title
        .unwrap_or_else(|| format!("{} ({})", args.column, args.month.format("%Y-%m")));

    let spec = MapSpec {
        title,
        month: args.month,
        column: args.column,
        region_column: args.region_column,
        separate_london: args.separate_london,
        london_codes: Vec::new(),
        // An absolute path replaces the output directory on join
        output: args.output.unwrap_or_else(|| PathBuf::from("map.svg")),
    };
    let output = config.output_dir.join(&spec.output);
    let regions = cookbook::map_from_csv(&args.csv, &args.time_column, &boundaries, &spec, &config.output_dir)?;
    println!("Map of {} regions written to {}", regions, output.display());
    Ok(())
}

fn cmd_config(config: &AnalysisConfig, action: ConfigAction) -> anyhow::Result<()> {
    match action {
        ConfigAction::Show => {
            let text = toml::to_string_pretty(&config.redacted()).context("serializing configuration")?;
            print!("{}", text);
        }
        ConfigAction::Init { path, force } => {
            let path = match path.or_else(AnalysisConfig::default_config_path) {
                Some(path) => path,
                None => bail!("cannot determine a config directory; pass --path"),
            };
            write_default_config(&path, force)?;
            println!("Configuration written to {}", path.display());
        }
    }
    Ok(())
}

fn write_default_config(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        bail!("{} already exists; use --force to overwrite", path.display());
    }
    AnalysisConfig::default().save(path)?;
    Ok(())
}
