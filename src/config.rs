//! Invocation settings resolved once from the command line.
//!
//! Environment fallbacks (`AzureWebJobsStorage`, `DATABASE_URL`,
//! `CENSUS_API_URL`) are applied by clap; this module turns the parsed flags
//! into stores, sinks and loader settings.

use std::path::PathBuf;

use log::debug;

use crate::{
    blob::{AzureBlobStore, BlobStore, LocalDirStore},
    cli::{GlobalArgs, SourceArgs},
    error::{LoadError, LoadResult},
    io_utils,
    loader::LoaderSettings,
    scan::{ScanOptions, SourceFormat},
    schema::{ColumnMapping, ColumnNaming},
    warehouse::PostgresWarehouse,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Storage {
    LocalDir(PathBuf),
    Azure { connection_string: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub storage: Option<Storage>,
    pub container: String,
    pub database_url: Option<String>,
    pub loader: LoaderSettings,
}

impl Config {
    pub fn from_args(args: &GlobalArgs) -> LoadResult<Self> {
        if args.chunk_size == 0 {
            return Err(LoadError::InvalidConfig(
                "--chunk-size must be at least 1".to_string(),
            ));
        }
        let storage = match (&args.source_dir, &args.connection_string) {
            (Some(dir), _) => Some(Storage::LocalDir(dir.clone())),
            (None, Some(value)) if !value.trim().is_empty() => Some(Storage::Azure {
                connection_string: value.clone(),
            }),
            _ => None,
        };
        let loader = LoaderSettings {
            chunk_size: args.chunk_size,
            null_marker: args.null_marker.clone(),
            ..LoaderSettings::default()
        };
        debug!(
            "Resolved configuration: container '{}', chunk size {}, local storage {}",
            args.container,
            loader.chunk_size,
            matches!(storage, Some(Storage::LocalDir(_)))
        );
        Ok(Self {
            storage,
            container: args.container.clone(),
            database_url: args.database_url.clone().filter(|url| !url.trim().is_empty()),
            loader,
        })
    }

    pub fn blob_store(&self) -> LoadResult<Box<dyn BlobStore>> {
        match &self.storage {
            Some(Storage::LocalDir(dir)) => Ok(Box::new(LocalDirStore::new(dir.clone()))),
            Some(Storage::Azure { connection_string }) => Ok(Box::new(
                AzureBlobStore::from_connection_string(connection_string, &self.container)?,
            )),
            None => Err(LoadError::InvalidConfig(
                "no blob storage configured: pass --source-dir or set AzureWebJobsStorage"
                    .to_string(),
            )),
        }
    }

    pub fn warehouse(&self) -> LoadResult<PostgresWarehouse> {
        let url = self.database_url.as_deref().ok_or_else(|| {
            LoadError::InvalidConfig(
                "no database configured: pass --database-url or set DATABASE_URL".to_string(),
            )
        })?;
        PostgresWarehouse::new(url)
    }
}

/// Scanner options for one blob described on the command line.
pub fn scan_options(args: &SourceArgs) -> LoadResult<ScanOptions> {
    let format = match args.format {
        Some(format) => format,
        None => SourceFormat::from_name(&args.blob).ok_or_else(|| {
            LoadError::InvalidConfig(format!(
                "cannot infer the format of '{}'; pass --format",
                args.blob
            ))
        })?,
    };
    let encoding = io_utils::resolve_encoding(args.input_encoding.as_deref())
        .map_err(|err| LoadError::InvalidConfig(err.to_string()))?;
    let mut options = ScanOptions::new(format)
        .with_columns(args.columns.iter().map(|c| c.trim()).filter(|c| !c.is_empty()))
        .with_rename(ColumnMapping::new(args.renames.iter().cloned())?)
        .with_delimiter(io_utils::resolve_input_delimiter(&args.blob, args.delimiter));
    if args.snake_case {
        options = options.with_naming(ColumnNaming::SnakeCase);
    }
    for (column, datatype) in &args.types {
        options = options.with_type(column, *datatype);
    }
    options.encoding = encoding;
    options.infer_rows = args.infer_rows;
    Ok(options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnType;

    fn global() -> GlobalArgs {
        GlobalArgs {
            source_dir: None,
            connection_string: None,
            container: "nppes".to_string(),
            database_url: None,
            chunk_size: 500,
            null_marker: String::new(),
        }
    }

    fn source(blob: &str) -> SourceArgs {
        SourceArgs {
            blob: blob.to_string(),
            format: None,
            columns: Vec::new(),
            renames: Vec::new(),
            snake_case: false,
            types: Vec::new(),
            delimiter: None,
            input_encoding: None,
            infer_rows: 100,
        }
    }

    #[test]
    fn local_directory_wins_over_connection_string() {
        let mut args = global();
        args.source_dir = Some(PathBuf::from("/data/nppes"));
        args.connection_string = Some("UseDevelopmentStorage=true".to_string());
        let config = Config::from_args(&args).unwrap();
        assert_eq!(config.storage, Some(Storage::LocalDir(PathBuf::from("/data/nppes"))));
        assert_eq!(config.loader.chunk_size, 500);
    }

    #[test]
    fn missing_storage_and_database_are_config_errors() {
        let config = Config::from_args(&global()).unwrap();
        assert!(matches!(config.blob_store(), Err(LoadError::InvalidConfig(_))));
        assert!(matches!(config.warehouse(), Err(LoadError::InvalidConfig(_))));
    }

    #[test]
    fn zero_chunk_size_is_rejected() {
        let mut args = global();
        args.chunk_size = 0;
        assert!(Config::from_args(&args).is_err());
    }

    #[test]
    fn scan_options_follow_blob_extension() {
        let mut args = source("npidata_pfile.csv");
        args.renames = vec![("NPI".to_string(), "npi".to_string())];
        args.types = vec![("Provider Business Practice Location Address Postal Code".to_string(), ColumnType::String)];
        let options = scan_options(&args).unwrap();
        assert_eq!(options.format, SourceFormat::Csv);
        assert_eq!(options.delimiter, b',');
        assert_eq!(options.rename.target_for("NPI"), Some("npi"));
        assert_eq!(options.type_overrides.len(), 1);

        assert_eq!(scan_options(&source("pl.parquet")).unwrap().format, SourceFormat::Parquet);
        assert!(scan_options(&source("extract.bin")).is_err());
    }
}
