mod analyzer;
mod error;
mod joiner;
mod loader;
mod models;
mod pdf;
mod renderer;
mod reporter;

use anyhow::{bail, Context, Result};
use clap::{Arg, ArgAction, Command};
use models::Config;
use pdf::WkHtmlToPdf;
use std::path::Path;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let matches = Command::new("educ-eval-report")
        .version("0.1")
        .about("Generates individual education evaluation reports per teacher")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("config.toml"),
        )
        .arg(
            Arg::new("nodata")
                .long("nodata")
                .visible_alias("no-data")
                .action(ArgAction::SetTrue)
                .help("Produce reports with data cells represented as XXX"),
        )
        .get_matches();

    init_logging();

    let config_file = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or("config.toml");
    let redact = matches.get_flag("nodata");

    let config = if Path::new(config_file).exists() {
        info!(path = config_file, "Loading configuration");
        Config::load_from_file(config_file)
            .with_context(|| format!("cannot load configuration from {}", config_file))?
    } else {
        Config::default()
            .save_to_file(config_file)
            .with_context(|| format!("cannot write default configuration to {}", config_file))?;
        println!("📝 Created default configuration file: {}", config_file);
        println!(
            "⚠️  Please edit {} to point at your exports, then run the program again.",
            config_file
        );
        return Ok(());
    };

    info!(
        schema_version = ?config.schema_version,
        output_format = ?config.output_format,
        main_dir = %config.paths.main_dir.display(),
        redact,
        "Generating reports"
    );

    let renderer = WkHtmlToPdf::new(config.pdf.clone());
    let summary = reporter::generate_reports(&config, redact, &renderer)
        .context("report generation failed")?;

    info!(
        documents = summary.generated.len(),
        missing = summary.missing.len(),
        failed = summary.failed.len(),
        "Done"
    );
    if !summary.missing.is_empty() {
        warn!(
            path = %config.resolve(&config.paths.missing_log).display(),
            "Some roster entries had no evaluation data"
        );
    }
    if !summary.failed.is_empty() {
        for entry in &summary.failed {
            error!(teacher = %entry.raw_id, name = %entry.name, "No report produced");
        }
        bail!("{} report(s) could not be rendered", summary.failed.len());
    }

    Ok(())
}
