//! Column types, rename mappings, and CSV type inference.
//!
//! [`ColumnMapping`] is the ordered `(source, target)` association used by the
//! scanner and the census loader. It rejects empty names and duplicate sources
//! or targets when it is built, so a bad mapping never reaches a load.
//!
//! [`TypeInference`] samples raw CSV fields the way a dataframe CSV reader
//! does: a column whose sampled values all parse as integers becomes an
//! integer column, and so on. Integer inference drops leading zeros, which is
//! why code-like columns (FIPS, ZIP, SSA) need a `string` override.

use std::{collections::BTreeMap, collections::HashSet, fmt, str::FromStr};

use heck::ToSnakeCase;
use serde::{Deserialize, Deserializer, Serialize, Serializer, de};

use crate::error::{LoadError, LoadResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnType {
    String,
    Integer,
    Float,
    Boolean,
    Date,
    DateTime,
}

impl ColumnType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnType::String => "string",
            ColumnType::Integer => "integer",
            ColumnType::Float => "float",
            ColumnType::Boolean => "boolean",
            ColumnType::Date => "date",
            ColumnType::DateTime => "datetime",
        }
    }

    pub fn variants() -> &'static [&'static str] {
        &["string", "integer", "float", "boolean", "date", "datetime"]
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ColumnType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "string" | "str" | "text" | "utf8" | "varchar" => Ok(ColumnType::String),
            "integer" | "int" | "int32" | "int64" | "i64" | "bigint" => Ok(ColumnType::Integer),
            "float" | "f64" | "double" | "numeric" => Ok(ColumnType::Float),
            "boolean" | "bool" => Ok(ColumnType::Boolean),
            "date" => Ok(ColumnType::Date),
            "datetime" | "timestamp" => Ok(ColumnType::DateTime),
            other => Err(format!(
                "Unknown column type '{other}' (expected one of: {})",
                ColumnType::variants().join(", ")
            )),
        }
    }
}

impl Serialize for ColumnType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ColumnType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}

/// Per-column type overrides keyed by source column name.
pub type TypeOverrides = BTreeMap<String, ColumnType>;

/// How columns without an explicit rename are named in the output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnNaming {
    #[default]
    Verbatim,
    SnakeCase,
}

impl ColumnNaming {
    pub fn apply(&self, source: &str) -> String {
        match self {
            ColumnNaming::Verbatim => source.to_string(),
            ColumnNaming::SnakeCase => source.to_snake_case(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnRename {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<ColumnRename>", into = "Vec<ColumnRename>")]
pub struct ColumnMapping {
    pairs: Vec<(String, String)>,
}

impl ColumnMapping {
    pub fn new<I, S, T>(pairs: I) -> LoadResult<Self>
    where
        I: IntoIterator<Item = (S, T)>,
        S: Into<String>,
        T: Into<String>,
    {
        let mut sources = HashSet::new();
        let mut targets = HashSet::new();
        let mut collected = Vec::new();
        for (source, target) in pairs {
            let source = source.into();
            let target = target.into();
            if source.trim().is_empty() || target.trim().is_empty() {
                return Err(LoadError::InvalidMapping(format!(
                    "empty column name in mapping '{source}' -> '{target}'"
                )));
            }
            if !sources.insert(source.clone()) {
                return Err(LoadError::InvalidMapping(format!(
                    "source column '{source}' is mapped more than once"
                )));
            }
            if !targets.insert(target.clone()) {
                return Err(LoadError::InvalidMapping(format!(
                    "target column '{target}' is used more than once"
                )));
            }
            collected.push((source, target));
        }
        Ok(Self { pairs: collected })
    }

    pub fn target_for(&self, source: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(from, _)| from == source)
            .map(|(_, to)| to.as_str())
    }

    pub fn sources(&self) -> impl Iterator<Item = &str> {
        self.pairs.iter().map(|(from, _)| from.as_str())
    }
}

impl TryFrom<Vec<ColumnRename>> for ColumnMapping {
    type Error = LoadError;

    fn try_from(value: Vec<ColumnRename>) -> Result<Self, Self::Error> {
        ColumnMapping::new(value.into_iter().map(|entry| (entry.from, entry.to)))
    }
}

impl From<ColumnMapping> for Vec<ColumnRename> {
    fn from(value: ColumnMapping) -> Self {
        value
            .pairs
            .into_iter()
            .map(|(from, to)| ColumnRename { from, to })
            .collect()
    }
}

#[derive(Debug, Clone)]
struct TypeCandidate {
    non_empty: usize,
    possible_integer: bool,
    possible_float: bool,
    possible_boolean: bool,
}

impl TypeCandidate {
    fn new() -> Self {
        Self {
            non_empty: 0,
            possible_integer: true,
            possible_float: true,
            possible_boolean: true,
        }
    }

    fn observe(&mut self, value: &str) {
        if value.is_empty() {
            return;
        }
        self.non_empty += 1;
        if self.possible_boolean
            && !(value.eq_ignore_ascii_case("true") || value.eq_ignore_ascii_case("false"))
        {
            self.possible_boolean = false;
        }
        if self.possible_integer && value.parse::<i64>().is_err() {
            self.possible_integer = false;
        }
        if self.possible_float && value.parse::<f64>().is_err() {
            self.possible_float = false;
        }
    }

    fn decide(&self) -> ColumnType {
        if self.non_empty == 0 {
            ColumnType::String
        } else if self.possible_boolean {
            ColumnType::Boolean
        } else if self.possible_integer {
            ColumnType::Integer
        } else if self.possible_float {
            ColumnType::Float
        } else {
            ColumnType::String
        }
    }
}

/// Accumulates sampled rows and decides one [`ColumnType`] per column.
#[derive(Debug, Clone)]
pub struct TypeInference {
    candidates: Vec<TypeCandidate>,
    rows: usize,
}

impl TypeInference {
    pub fn new(width: usize) -> Self {
        Self {
            candidates: vec![TypeCandidate::new(); width],
            rows: 0,
        }
    }

    pub fn observe_row<S: AsRef<str>>(&mut self, row: &[S]) {
        for (candidate, value) in self.candidates.iter_mut().zip(row) {
            candidate.observe(value.as_ref());
        }
        self.rows += 1;
    }

    pub fn rows_observed(&self) -> usize {
        self.rows
    }

    pub fn finish(self) -> Vec<ColumnType> {
        self.candidates.iter().map(TypeCandidate::decide).collect()
    }
}
