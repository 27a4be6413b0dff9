//! YAML job files: which blobs go to which tables, plus the census load.
//!
//! ```yaml
//! datasets:
//!   - name: providers
//!     blob: npidata_pfile.csv
//!     table: nppes_providers
//!     chunk_size: 50000
//!     columns: [NPI, Entity Type Code, Provider Business Practice Location Address Postal Code]
//!     rename:
//!       - { from: NPI, to: npi }
//!       - { from: Entity Type Code, to: entity_type_code }
//!       - { from: Provider Business Practice Location Address Postal Code, to: practice_zip }
//!     types:
//!       Provider Business Practice Location Address Postal Code: string
//! census:
//!   table: census_county_population
//!   mode: replace
//! ```
//!
//! Datasets run in file order and the first failure stops the run.

use std::{
    collections::{BTreeMap, HashSet},
    fmt, fs,
    path::Path,
    time::{Duration, Instant},
};

use log::info;
use serde::{Deserialize, Serialize};

use crate::{
    blob::ByteSource,
    census::{self, CensusSettings, UpstreamApi, WriteMode},
    error::{LoadError, LoadResult},
    io_utils,
    loader::{ChunkedLoader, LoadReport, LoaderSettings},
    scan::{self, DEFAULT_INFER_ROWS, ScanOptions, SourceFormat},
    schema::{ColumnMapping, ColumnNaming, ColumnType},
    warehouse::Warehouse,
};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobConfig {
    #[serde(default)]
    pub datasets: Vec<DatasetSpec>,
    #[serde(default)]
    pub census: Option<CensusSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatasetSpec {
    pub name: String,
    pub blob: String,
    #[serde(default)]
    pub format: Option<SourceFormat>,
    pub table: String,
    #[serde(default)]
    pub chunk_size: Option<usize>,
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub rename: ColumnMapping,
    #[serde(default)]
    pub naming: ColumnNaming,
    #[serde(default)]
    pub types: BTreeMap<String, ColumnType>,
    #[serde(default)]
    pub delimiter: Option<char>,
    #[serde(default)]
    pub encoding: Option<String>,
    #[serde(default)]
    pub infer_rows: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CensusSpec {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default)]
    pub mode: WriteMode,
}

impl JobConfig {
    pub fn load(path: &Path) -> LoadResult<Self> {
        let text = fs::read_to_string(path).map_err(|err| {
            LoadError::InvalidConfig(format!("reading job file {path:?}: {err}"))
        })?;
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> LoadResult<Self> {
        let job: JobConfig = serde_yaml::from_str(text)
            .map_err(|err| LoadError::InvalidConfig(format!("job file: {err}")))?;
        job.validate()?;
        Ok(job)
    }

    fn validate(&self) -> LoadResult<()> {
        let mut names = HashSet::new();
        for dataset in &self.datasets {
            if dataset.name.trim().is_empty() {
                return Err(LoadError::InvalidConfig("dataset name is empty".to_string()));
            }
            if !names.insert(dataset.name.as_str()) {
                return Err(LoadError::InvalidConfig(format!(
                    "dataset '{}' is defined more than once",
                    dataset.name
                )));
            }
            if dataset.chunk_size == Some(0) {
                return Err(LoadError::InvalidConfig(format!(
                    "dataset '{}': chunk_size must be at least 1",
                    dataset.name
                )));
            }
            dataset.scan_options()?;
        }
        Ok(())
    }

    /// Points datasets at different blobs for this run only.
    pub fn apply_overrides(&mut self, overrides: &[(String, String)]) -> LoadResult<()> {
        for (name, blob) in overrides {
            let dataset = self
                .datasets
                .iter_mut()
                .find(|dataset| &dataset.name == name)
                .ok_or_else(|| {
                    LoadError::InvalidConfig(format!("unknown dataset '{name}' in --file override"))
                })?;
            info!("Dataset '{name}' reads '{blob}' instead of '{}'", dataset.blob);
            dataset.blob = blob.clone();
        }
        Ok(())
    }
}

impl DatasetSpec {
    pub fn scan_options(&self) -> LoadResult<ScanOptions> {
        let format = match self.format {
            Some(format) => format,
            None => SourceFormat::from_name(&self.blob).ok_or_else(|| {
                LoadError::InvalidConfig(format!(
                    "dataset '{}': cannot infer the format of '{}'",
                    self.name, self.blob
                ))
            })?,
        };
        let delimiter = match self.delimiter {
            Some(ch) if ch.is_ascii() => Some(ch as u8),
            Some(ch) => {
                return Err(LoadError::InvalidConfig(format!(
                    "dataset '{}': delimiter '{ch}' is not ASCII",
                    self.name
                )));
            }
            None => None,
        };
        let mut options = ScanOptions::new(format)
            .with_columns(self.columns.iter().cloned())
            .with_rename(self.rename.clone())
            .with_naming(self.naming)
            .with_delimiter(io_utils::resolve_input_delimiter(&self.blob, delimiter));
        options.type_overrides = self.types.clone();
        options.encoding = io_utils::resolve_encoding(self.encoding.as_deref())
            .map_err(|err| LoadError::InvalidConfig(format!("dataset '{}': {err}", self.name)))?;
        options.infer_rows = self.infer_rows.unwrap_or(DEFAULT_INFER_ROWS);
        Ok(options)
    }
}

impl CensusSpec {
    pub fn settings(&self, fallback_url: Option<&str>, null_marker: &str) -> CensusSettings {
        let mut settings = CensusSettings::default();
        if let Some(url) = self.url.as_deref().or(fallback_url) {
            settings.url = url.to_string();
        }
        if let Some(table) = &self.table {
            settings.table = table.clone();
        }
        settings.mode = self.mode;
        settings.null_marker = null_marker.to_string();
        settings
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetOutcome {
    pub name: String,
    pub report: LoadReport,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSummary {
    pub datasets: Vec<DatasetOutcome>,
    pub census: Option<LoadReport>,
    pub elapsed: Duration,
}

impl fmt::Display for JobSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for outcome in &self.datasets {
            writeln!(
                f,
                "{}: {} row(s) into '{}' in {} chunk(s)",
                outcome.name, outcome.report.rows, outcome.report.table, outcome.report.chunks
            )?;
        }
        if let Some(report) = &self.census {
            writeln!(f, "census: {} row(s) into '{}'", report.rows, report.table)?;
        }
        write!(f, "Elapsed time: {:.2} seconds", self.elapsed.as_secs_f64())
    }
}

/// Everything a job run talks to.
pub struct JobContext<'a, S: ByteSource + ?Sized, W: Warehouse> {
    pub source: &'a S,
    pub warehouse: &'a W,
    pub api: &'a dyn UpstreamApi,
    pub loader: &'a LoaderSettings,
    pub census_url: Option<&'a str>,
}

pub fn load_dataset<S, W>(
    dataset: &DatasetSpec,
    source: &S,
    warehouse: &W,
    loader: &LoaderSettings,
) -> LoadResult<LoadReport>
where
    S: ByteSource + ?Sized,
    W: Warehouse,
{
    let options = dataset.scan_options()?;
    let bytes = source.fetch(&dataset.blob)?;
    let mut view = scan::open(&dataset.blob, bytes, &options)?;
    let settings = loader
        .clone()
        .with_chunk_size(dataset.chunk_size.unwrap_or(loader.chunk_size));
    ChunkedLoader::new(warehouse, settings)?.load(view.as_mut(), &dataset.table)
}

pub fn run_job<S, W>(job: &JobConfig, ctx: &JobContext<'_, S, W>) -> LoadResult<JobSummary>
where
    S: ByteSource + ?Sized,
    W: Warehouse,
{
    let started = Instant::now();
    let mut datasets = Vec::with_capacity(job.datasets.len());
    for dataset in &job.datasets {
        info!("Dataset '{}': '{}' -> '{}'", dataset.name, dataset.blob, dataset.table);
        let report = load_dataset(dataset, ctx.source, ctx.warehouse, ctx.loader)?;
        datasets.push(DatasetOutcome {
            name: dataset.name.clone(),
            report,
        });
    }
    let census = match &job.census {
        Some(section) => {
            let settings = section.settings(ctx.census_url, &ctx.loader.null_marker);
            Some(census::load_from_api(ctx.warehouse, ctx.api, &settings)?)
        }
        None => None,
    };
    let summary = JobSummary {
        datasets,
        census,
        elapsed: started.elapsed(),
    };
    info!("Job finished in {:.2} seconds", summary.elapsed.as_secs_f64());
    Ok(summary)
}
