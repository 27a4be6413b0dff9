pub mod batch;
pub mod blob;
pub mod census;
pub mod cli;
pub mod config;
pub mod data;
pub mod error;
pub mod io_utils;
pub mod job;
pub mod loader;
pub mod preview;
pub mod scan;
pub mod schema;
pub mod table;
pub mod warehouse;

use std::{env, fs, sync::OnceLock, time::Instant};

use anyhow::{Context, Result, bail};
use clap::Parser;
use log::{LevelFilter, info};

use crate::{
    census::{CensusSettings, HttpApi},
    cli::{Cli, Commands},
    config::Config,
    job::{JobConfig, JobContext},
    loader::ChunkedLoader,
};

static LOGGER: OnceLock<()> = OnceLock::new();

fn init_logging() {
    LOGGER.get_or_init(|| {
        let mut builder = env_logger::Builder::from_env(env_logger::Env::default());
        if env::var("RUST_LOG").is_err() {
            builder.filter_module("nppes_loader", LevelFilter::Info);
        }
        let _ = builder.format_timestamp_millis().try_init();
    });
}

pub fn run() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let config = Config::from_args(&cli.global).context("Resolving configuration")?;
    match cli.command {
        Commands::Check => handle_check(&config),
        Commands::Upload(args) => handle_upload(&args, &config),
        Commands::Preview(args) => {
            let store = config.blob_store()?;
            preview::execute(&args, store.as_ref())
        }
        Commands::Load(args) => handle_load(&args, &config),
        Commands::Census(args) => handle_census(&args, &config),
        Commands::Run(args) => handle_run(&args, &config),
    }
}

fn handle_check(config: &Config) -> Result<()> {
    let started = Instant::now();
    let listing = config
        .blob_store()
        .and_then(|store| Ok((store.container().to_string(), store.list()?)));
    let elapsed = || format!("Elapsed time: {:.2} seconds", started.elapsed().as_secs_f64());
    match listing {
        Ok((container, names)) => {
            println!("Connected successfully to '{container}' container. Blobs: {names:?}");
            println!("{}", elapsed());
            Ok(())
        }
        Err(err) => {
            println!("Failed to connect to '{}' container: {err}", config.container);
            println!("{}", elapsed());
            bail!("Storage check failed")
        }
    }
}

fn handle_upload(args: &cli::UploadArgs, config: &Config) -> Result<()> {
    let blob = match &args.blob {
        Some(name) => name.clone(),
        None => args
            .input
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .with_context(|| format!("{:?} has no file name", args.input))?,
    };
    let data = fs::read(&args.input).with_context(|| format!("Reading {:?}", args.input))?;
    let store = config.blob_store()?;
    store
        .upload(&blob, &data)
        .with_context(|| format!("Uploading {:?} as '{blob}'", args.input))?;
    println!("Uploaded {} byte(s) to '{}/{blob}'", data.len(), store.container());
    Ok(())
}

fn handle_load(args: &cli::LoadArgs, config: &Config) -> Result<()> {
    let blob = &args.source.blob;
    let options = config::scan_options(&args.source)?;
    let store = config.blob_store()?;
    let warehouse = config.warehouse()?;
    let loader = ChunkedLoader::new(&warehouse, config.loader.clone())?;
    info!(
        "Loading '{}' into '{}' using delimiter '{}'",
        blob,
        args.table,
        printable_delimiter(loader.settings().delimiter)
    );

    let started = Instant::now();
    let bytes = store
        .fetch(blob)
        .with_context(|| format!("Fetching blob '{blob}'"))?;
    let mut view = scan::open(blob, bytes, &options).with_context(|| format!("Opening '{blob}'"))?;
    let report = loader
        .load(view.as_mut(), &args.table)
        .with_context(|| format!("Loading '{blob}' into '{}'", args.table))?;
    println!(
        "{}: {} row(s) into '{}' in {} chunk(s)",
        blob, report.rows, report.table, report.chunks
    );
    println!("Elapsed time: {:.2} seconds", started.elapsed().as_secs_f64());
    Ok(())
}

fn handle_census(args: &cli::CensusArgs, config: &Config) -> Result<()> {
    let mut settings = CensusSettings {
        table: args.table.clone(),
        mode: args.mode,
        null_marker: config.loader.null_marker.clone(),
        ..CensusSettings::default()
    };
    if let Some(url) = &args.url {
        settings.url = url.clone();
    }
    let warehouse = config.warehouse()?;

    let started = Instant::now();
    let report = match &args.payload {
        Some(path) => {
            let text = fs::read_to_string(path).with_context(|| format!("Reading {path:?}"))?;
            let payload: serde_json::Value =
                serde_json::from_str(&text).with_context(|| format!("Parsing {path:?}"))?;
            census::load_payload(&warehouse, &payload, &settings)
        }
        None => census::load_from_api(&warehouse, &HttpApi::new()?, &settings),
    }
    .with_context(|| format!("Loading census rows into '{}'", settings.table))?;
    println!("census: {} row(s) into '{}'", report.rows, report.table);
    println!("Elapsed time: {:.2} seconds", started.elapsed().as_secs_f64());
    Ok(())
}

fn handle_run(args: &cli::RunArgs, config: &Config) -> Result<()> {
    let mut job = JobConfig::load(&args.job).with_context(|| format!("Loading job {:?}", args.job))?;
    job.apply_overrides(&args.files)?;
    let store = config.blob_store()?;
    let warehouse = config.warehouse()?;
    let api = HttpApi::new()?;
    let ctx = JobContext {
        source: store.as_ref(),
        warehouse: &warehouse,
        api: &api,
        loader: &config.loader,
        census_url: args.census_url.as_deref(),
    };
    let summary = job::run_job(&job, &ctx).with_context(|| format!("Running job {:?}", args.job))?;
    println!("{summary}");
    Ok(())
}

pub(crate) fn printable_delimiter(delimiter: u8) -> String {
    match delimiter {
        b',' => ",".to_string(),
        b'\t' => "\\t".to_string(),
        b'\n' => "\\n".to_string(),
        other => (other as char).to_string(),
    }
}
