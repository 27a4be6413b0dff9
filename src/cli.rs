use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::{
    blob::DEFAULT_CONTAINER,
    census::{DEFAULT_CENSUS_TABLE, WriteMode},
    loader::DEFAULT_CHUNK_SIZE,
    scan::{DEFAULT_INFER_ROWS, SourceFormat},
    schema::ColumnType,
};

#[derive(Debug, Parser)]
#[command(author, version, about = "Load NPPES extracts and census data into PostgreSQL", long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// List the blob container to confirm storage is reachable
    Check,
    /// Upload a local file to the blob container, replacing any existing blob
    Upload(UploadArgs),
    /// Preview the first rows of a blob as they would be loaded
    Preview(PreviewArgs),
    /// Load one blob into a table in transactional chunks
    Load(LoadArgs),
    /// Load county population rows from the census API
    Census(CensusArgs),
    /// Run every dataset of a YAML job file, then the census load
    Run(RunArgs),
}

#[derive(Debug, Args)]
pub struct GlobalArgs {
    /// Read blobs from a local directory instead of Azure storage
    #[arg(long = "source-dir", global = true)]
    pub source_dir: Option<PathBuf>,
    /// Azure storage connection string
    #[arg(
        long = "storage-connection-string",
        env = "AzureWebJobsStorage",
        hide_env_values = true,
        global = true
    )]
    pub connection_string: Option<String>,
    /// Blob container holding the extracts
    #[arg(long, default_value = DEFAULT_CONTAINER, global = true)]
    pub container: String,
    /// PostgreSQL connection URL
    #[arg(long = "database-url", env = "DATABASE_URL", hide_env_values = true, global = true)]
    pub database_url: Option<String>,
    /// Rows per transaction when loading blobs
    #[arg(long = "chunk-size", default_value_t = DEFAULT_CHUNK_SIZE, global = true)]
    pub chunk_size: usize,
    /// Text written for null values in bulk copies
    #[arg(long = "null-marker", default_value = "", global = true)]
    pub null_marker: String,
}

#[derive(Debug, Args)]
pub struct UploadArgs {
    /// Local file to upload
    #[arg(short = 'i', long = "input")]
    pub input: PathBuf,
    /// Blob name (defaults to the input file name)
    #[arg(short, long)]
    pub blob: Option<String>,
}

#[derive(Debug, Args)]
pub struct SourceArgs {
    /// Blob to read
    #[arg(short, long)]
    pub blob: String,
    /// Source format (inferred from the blob extension when omitted)
    #[arg(long, value_parser = parse_format)]
    pub format: Option<SourceFormat>,
    /// Restrict and order the columns read from the source
    #[arg(short = 'C', long = "columns", value_delimiter = ',')]
    pub columns: Vec<String>,
    /// Column renames of the form `source=target`
    #[arg(long = "rename", value_parser = parse_rename, action = clap::ArgAction::Append)]
    pub renames: Vec<(String, String)>,
    /// Rename every unmapped column to snake_case
    #[arg(long = "snake-case")]
    pub snake_case: bool,
    /// Type overrides of the form `column=type`
    #[arg(long = "type", value_parser = parse_type_override, action = clap::ArgAction::Append)]
    pub types: Vec<(String, ColumnType)>,
    /// CSV delimiter character (supports ',', 'tab', ';', '|')
    #[arg(long, value_parser = parse_delimiter)]
    pub delimiter: Option<u8>,
    /// Character encoding of the source (defaults to utf-8)
    #[arg(long = "input-encoding")]
    pub input_encoding: Option<String>,
    /// Rows sampled when inferring CSV column types (0 means full scan)
    #[arg(long = "infer-rows", default_value_t = DEFAULT_INFER_ROWS)]
    pub infer_rows: usize,
}

#[derive(Debug, Args)]
pub struct PreviewArgs {
    #[command(flatten)]
    pub source: SourceArgs,
    /// Number of rows to show
    #[arg(long, default_value_t = 10)]
    pub rows: usize,
}

#[derive(Debug, Args)]
pub struct LoadArgs {
    #[command(flatten)]
    pub source: SourceArgs,
    /// Destination table (optionally schema-qualified)
    #[arg(short, long)]
    pub table: String,
}

#[derive(Debug, Args)]
pub struct CensusArgs {
    /// Census API query URL
    #[arg(long, env = "CENSUS_API_URL")]
    pub url: Option<String>,
    /// Read the API response from a local JSON file instead of calling the API
    #[arg(long)]
    pub payload: Option<PathBuf>,
    /// Destination table
    #[arg(short, long, default_value = DEFAULT_CENSUS_TABLE)]
    pub table: String,
    /// Append to the table or replace its contents
    #[arg(long, value_enum, default_value_t = WriteMode::Append)]
    pub mode: WriteMode,
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// YAML job file describing datasets and the census load
    #[arg(short, long)]
    pub job: PathBuf,
    /// Blob overrides of the form `dataset=blob`
    #[arg(long = "file", value_parser = parse_assignment, action = clap::ArgAction::Append)]
    pub files: Vec<(String, String)>,
    /// Census API query URL used when the job file does not name one
    #[arg(long = "census-url", env = "CENSUS_API_URL")]
    pub census_url: Option<String>,
}

pub fn parse_delimiter(value: &str) -> Result<u8, String> {
    match value {
        "tab" | "\\t" | "\t" => Ok(b'\t'),
        "comma" | "," => Ok(b','),
        "|" | "pipe" => Ok(b'|'),
        ";" | "semicolon" => Ok(b';'),
        other => {
            let mut chars = other.chars();
            let first = chars
                .next()
                .ok_or_else(|| "Delimiter cannot be empty".to_string())?;
            if chars.next().is_some() {
                return Err("Delimiter must be a single character".to_string());
            }
            if !first.is_ascii() {
                return Err("Delimiter must be ASCII".to_string());
            }
            Ok(first as u8)
        }
    }
}

pub fn parse_format(value: &str) -> Result<SourceFormat, String> {
    value.parse()
}

fn parse_assignment(value: &str) -> Result<(String, String), String> {
    let (left, right) = value
        .split_once('=')
        .ok_or_else(|| format!("Expected `name=value`, got '{value}'"))?;
    let (left, right) = (left.trim(), right.trim());
    if left.is_empty() || right.is_empty() {
        return Err(format!("Both sides of '{value}' must be non-empty"));
    }
    Ok((left.to_string(), right.to_string()))
}

pub fn parse_rename(value: &str) -> Result<(String, String), String> {
    parse_assignment(value)
}

pub fn parse_type_override(value: &str) -> Result<(String, ColumnType), String> {
    let (column, ty) = parse_assignment(value)?;
    Ok((column, ty.parse::<ColumnType>()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn command_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn assignments_require_both_sides() {
        assert_eq!(
            parse_rename("Provider Business Practice Location Address Postal Code=zip").unwrap(),
            (
                "Provider Business Practice Location Address Postal Code".to_string(),
                "zip".to_string()
            )
        );
        assert!(parse_rename("npi").is_err());
        assert!(parse_rename("=npi").is_err());
    }

    #[test]
    fn type_overrides_parse_known_types() {
        assert_eq!(
            parse_type_override("zip=string").unwrap(),
            ("zip".to_string(), ColumnType::String)
        );
        assert!(parse_type_override("zip=decimal(10,2)").is_err());
    }

    #[test]
    fn delimiter_aliases() {
        assert_eq!(parse_delimiter("tab").unwrap(), b'\t');
        assert_eq!(parse_delimiter("|").unwrap(), b'|');
        assert!(parse_delimiter("ab").is_err());
    }
}
