//! County population rows from the census statistics API.
//!
//! The API answers with a JSON array of arrays whose first row is the header.
//! Rows are renamed, projected onto the destination columns, filtered and
//! sent to the database in a single COPY. Unlike the chunked loader this path
//! drops any serialized line whose field count is off, which is what catches
//! values with embedded tabs or line breaks.

use itertools::Itertools;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::{
    error::{LoadError, LoadResult},
    loader::{LoadReport, load_once},
    schema::ColumnMapping,
    warehouse::{CopyTarget, SinkConnection, Warehouse},
};

pub const DEFAULT_CENSUS_URL: &str = "https://api.census.gov/data/2022/acs/acs5?get=NAME,B01001_001E&for=county:*&in=state:47";
pub const DEFAULT_CENSUS_TABLE: &str = "census_county_population";
const DEFAULT_RENAME: [(&str, &str); 4] = [
    ("NAME", "county_name"),
    ("B01001_001E", "population"),
    ("state", "state_fips"),
    ("county", "county_fips"),
];
const FIELD_DELIMITER: char = '\t';

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    #[default]
    Append,
    Replace,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CensusSettings {
    pub url: String,
    pub table: String,
    pub rename: ColumnMapping,
    /// Destination columns, in COPY order.
    pub destination: Vec<String>,
    /// Column parsed as a 32-bit integer; unparsable values become null.
    pub integer_column: Option<String>,
    pub null_marker: String,
    pub mode: WriteMode,
}

impl Default for CensusSettings {
    fn default() -> Self {
        Self {
            url: DEFAULT_CENSUS_URL.to_string(),
            table: DEFAULT_CENSUS_TABLE.to_string(),
            rename: ColumnMapping::new(DEFAULT_RENAME).expect("default census mapping is unique"),
            destination: DEFAULT_RENAME.iter().map(|(_, to)| to.to_string()).collect(),
            integer_column: Some("population".to_string()),
            null_marker: String::new(),
            mode: WriteMode::Append,
        }
    }
}

pub trait UpstreamApi {
    fn get_json(&self, url: &str) -> LoadResult<JsonValue>;
}

pub struct HttpApi {
    client: reqwest::blocking::Client,
}

impl HttpApi {
    pub fn new() -> LoadResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(concat!("nppes-loader/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| LoadError::UpstreamApi(format!("building HTTP client: {err}")))?;
        Ok(Self { client })
    }
}

impl UpstreamApi for HttpApi {
    fn get_json(&self, url: &str) -> LoadResult<JsonValue> {
        debug!("GET {url}");
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|err| LoadError::UpstreamApi(format!("GET {url}: {err}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(LoadError::UpstreamApi(format!(
                "GET {url} returned {status}: {}",
                body.chars().take(200).collect::<String>()
            )));
        }
        response
            .json::<JsonValue>()
            .map_err(|err| LoadError::UpstreamApi(format!("GET {url}: malformed JSON: {err}")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
}

pub fn reshape(payload: &JsonValue) -> LoadResult<ApiTable> {
    let malformed = |detail: String| LoadError::UpstreamApi(format!("malformed payload: {detail}"));
    let outer = payload
        .as_array()
        .ok_or_else(|| malformed("expected an array of arrays".to_string()))?;
    let (header, body) = outer
        .split_first()
        .ok_or_else(|| malformed("missing header row".to_string()))?;
    let columns = header
        .as_array()
        .ok_or_else(|| malformed("header row is not an array".to_string()))?
        .iter()
        .map(|cell| {
            cell.as_str()
                .map(str::to_string)
                .ok_or_else(|| malformed(format!("header cell {cell} is not a string")))
        })
        .collect::<LoadResult<Vec<_>>>()?;

    let rows = body
        .iter()
        .enumerate()
        .map(|(idx, row)| {
            let cells = row
                .as_array()
                .ok_or_else(|| malformed(format!("row {} is not an array", idx + 1)))?;
            if cells.len() != columns.len() {
                return Err(malformed(format!(
                    "row {} has {} field(s), header has {}",
                    idx + 1,
                    cells.len(),
                    columns.len()
                )));
            }
            Ok(cells.iter().map(cell_text).collect())
        })
        .collect::<LoadResult<Vec<_>>>()?;

    Ok(ApiTable { columns, rows })
}

fn cell_text(cell: &JsonValue) -> Option<String> {
    match cell {
        JsonValue::Null => None,
        JsonValue::String(text) => Some(text.clone()),
        other => Some(other.to_string()),
    }
}

/// Serialized rows ready for COPY, with a count of the rows filtered out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreparedRows {
    pub columns: Vec<String>,
    pub lines: Vec<String>,
    pub dropped: usize,
}

impl PreparedRows {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for line in &self.lines {
            out.extend_from_slice(line.as_bytes());
            out.push(b'\n');
        }
        out
    }
}

pub fn prepare(table: ApiTable, settings: &CensusSettings) -> LoadResult<PreparedRows> {
    if let Some(missing) = settings
        .rename
        .sources()
        .find(|source| !table.columns.iter().any(|c| c == *source))
    {
        return Err(LoadError::schema_mismatch(missing, &table.columns));
    }
    let renamed = table
        .columns
        .iter()
        .map(|column| {
            settings
                .rename
                .target_for(column)
                .map(str::to_string)
                .unwrap_or_else(|| column.clone())
        })
        .collect::<Vec<_>>();
    let positions = settings
        .destination
        .iter()
        .map(|column| {
            renamed
                .iter()
                .position(|c| c == column)
                .ok_or_else(|| LoadError::schema_mismatch(column, &renamed))
        })
        .collect::<LoadResult<Vec<_>>>()?;
    let integer_idx = settings
        .integer_column
        .as_ref()
        .map(|column| {
            settings
                .destination
                .iter()
                .position(|c| c == column)
                .ok_or_else(|| LoadError::schema_mismatch(column, &settings.destination))
        })
        .transpose()?;

    let total = table.rows.len();
    let mut kept = Vec::with_capacity(total);
    for row in table.rows {
        let mut projected = positions
            .iter()
            .map(|&idx| row.get(idx).cloned().flatten())
            .collect::<Vec<_>>();
        if let Some(idx) = integer_idx {
            projected[idx] = projected[idx]
                .take()
                .and_then(|value| value.parse::<i32>().ok())
                .map(|value| value.to_string());
        }
        if projected.iter().any(Option::is_none) {
            continue;
        }
        let normalized = projected
            .into_iter()
            .map(|value| value.unwrap_or_default().trim().to_string())
            .collect::<Vec<_>>();
        if normalized.iter().all(String::is_empty) {
            continue;
        }
        kept.push(normalized.join("\t"));
    }

    let width = settings.destination.len();
    let text = kept.join("\n");
    let lines = text
        .split('\n')
        .filter(|line| !line.trim().is_empty())
        .filter(|line| line.split(FIELD_DELIMITER).count() == width)
        .map(str::to_string)
        .collect_vec();
    let dropped = total.saturating_sub(lines.len());
    debug!(
        "Prepared {} of {} census row(s) for {}",
        lines.len(),
        total,
        settings.destination.join(", ")
    );

    Ok(PreparedRows {
        columns: settings.destination.clone(),
        lines,
        dropped,
    })
}

pub fn load_payload<W: Warehouse>(
    warehouse: &W,
    payload: &JsonValue,
    settings: &CensusSettings,
) -> LoadResult<LoadReport> {
    let prepared = prepare(reshape(payload)?, settings)?;
    let target = CopyTarget::new(
        &settings.table,
        &prepared.columns,
        FIELD_DELIMITER as u8,
        &settings.null_marker,
    )?;
    let data = prepared.encode();
    info!(
        "Copying {} census row(s) into '{}' ({} dropped, mode {:?})",
        prepared.lines.len(),
        settings.table,
        prepared.dropped,
        settings.mode
    );

    let truncate = settings.mode == WriteMode::Replace;
    let copied = load_once(warehouse, &settings.table, |connection| {
        if truncate {
            connection.execute(&target.truncate_statement())?;
        }
        connection.bulk_copy(&data, &target)
    })?;
    debug!("Database reported {copied} copied row(s)");

    Ok(LoadReport {
        table: settings.table.clone(),
        rows: prepared.lines.len(),
        chunks: 1,
    })
}

pub fn load_from_api<W, A>(warehouse: &W, api: &A, settings: &CensusSettings) -> LoadResult<LoadReport>
where
    W: Warehouse,
    A: UpstreamApi + ?Sized,
{
    let payload = api.get_json(&settings.url)?;
    load_payload(warehouse, &payload, settings)
}
