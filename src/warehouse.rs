//! Transactional bulk-load sink.
//!
//! A [`Warehouse`] hands out [`SinkConnection`]s; loaders never hold a raw
//! connection but a [`Session`], which closes the connection when it is
//! dropped so every exit path releases it. [`Session::transaction`] rolls back
//! before it returns an error.

use std::{io::Write, sync::LazyLock};

use log::{debug, warn};
use postgres::{Client, NoTls};
use regex::Regex;

use crate::{
    error::{LoadError, LoadResult, SinkError},
    printable_delimiter,
};

static IDENTIFIER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)?$")
        .expect("identifier pattern is valid")
});

/// Destination of one bulk-copy: table, column order and text format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyTarget {
    pub table: String,
    pub columns: Vec<String>,
    pub delimiter: u8,
    pub null_marker: String,
}

impl CopyTarget {
    pub fn new(
        table: &str,
        columns: &[String],
        delimiter: u8,
        null_marker: &str,
    ) -> LoadResult<Self> {
        ensure_identifier(table)?;
        if columns.is_empty() {
            return Err(LoadError::InvalidMapping(format!(
                "no columns to load into '{table}'"
            )));
        }
        for column in columns {
            ensure_identifier(column)?;
        }
        if null_marker.contains('\'') {
            return Err(LoadError::InvalidConfig(
                "null marker must not contain a single quote".to_string(),
            ));
        }
        Ok(Self {
            table: table.to_string(),
            columns: columns.to_vec(),
            delimiter,
            null_marker: null_marker.to_string(),
        })
    }

    pub fn truncate_statement(&self) -> String {
        format!("TRUNCATE TABLE {}", self.table)
    }

    pub fn copy_statement(&self) -> String {
        format!(
            "COPY {} ({}) FROM STDIN WITH (FORMAT text, DELIMITER E'{}', NULL '{}')",
            self.table,
            self.columns.join(", "),
            printable_delimiter(self.delimiter),
            self.null_marker.replace('\\', "\\\\")
        )
    }
}

pub(crate) fn ensure_identifier(name: &str) -> LoadResult<()> {
    if IDENTIFIER.is_match(name) {
        Ok(())
    } else {
        Err(LoadError::InvalidMapping(format!(
            "'{name}' is not a valid SQL identifier"
        )))
    }
}

pub trait SinkConnection {
    fn begin(&mut self) -> Result<(), SinkError>;
    fn execute(&mut self, statement: &str) -> Result<(), SinkError>;
    /// Streams delimited text into the target and returns the copied row count.
    fn bulk_copy(&mut self, data: &[u8], target: &CopyTarget) -> Result<u64, SinkError>;
    fn commit(&mut self) -> Result<(), SinkError>;
    fn rollback(&mut self) -> Result<(), SinkError>;
    fn close(self) -> Result<(), SinkError>;
}

pub trait Warehouse {
    type Connection: SinkConnection;

    fn connect(&self) -> Result<Self::Connection, SinkError>;
}

/// One open connection scoped to a single target table.
pub struct Session<C: SinkConnection> {
    table: String,
    connection: Option<C>,
}

impl<C: SinkConnection> Session<C> {
    pub fn open<W>(warehouse: &W, table: &str) -> Result<Self, SinkError>
    where
        W: Warehouse<Connection = C>,
    {
        let connection = warehouse.connect()?;
        debug!("Opened connection for '{table}'");
        Ok(Self {
            table: table.to_string(),
            connection: Some(connection),
        })
    }

    pub fn transaction<T, F>(&mut self, work: F) -> Result<T, SinkError>
    where
        F: FnOnce(&mut C) -> Result<T, SinkError>,
    {
        let connection = self
            .connection
            .as_mut()
            .ok_or_else(|| SinkError::Closed(self.table.clone()))?;
        connection.begin()?;
        let outcome = work(&mut *connection).and_then(|value| connection.commit().map(|()| value));
        if outcome.is_err()
            && let Err(err) = connection.rollback()
        {
            warn!("Rollback on '{}' failed: {err}", self.table);
        }
        outcome
    }

    pub fn close(mut self) -> Result<(), SinkError> {
        match self.connection.take() {
            Some(connection) => {
                debug!("Closing connection for '{}'", self.table);
                connection.close()
            }
            None => Ok(()),
        }
    }
}

impl<C: SinkConnection> Drop for Session<C> {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            debug!("Releasing connection for '{}'", self.table);
            if let Err(err) = connection.close() {
                warn!("Closing connection for '{}' failed: {err}", self.table);
            }
        }
    }
}

/// PostgreSQL over the blocking `postgres` client.
#[derive(Clone)]
pub struct PostgresWarehouse {
    config: postgres::Config,
}

impl PostgresWarehouse {
    pub fn new(url: &str) -> LoadResult<Self> {
        let config = url
            .parse::<postgres::Config>()
            .map_err(|err| LoadError::InvalidConfig(format!("database url: {err}")))?;
        Ok(Self { config })
    }
}

impl Warehouse for PostgresWarehouse {
    type Connection = PostgresConnection;

    fn connect(&self) -> Result<Self::Connection, SinkError> {
        let client = self.config.connect(NoTls)?;
        Ok(PostgresConnection { client })
    }
}

pub struct PostgresConnection {
    client: Client,
}

impl SinkConnection for PostgresConnection {
    fn begin(&mut self) -> Result<(), SinkError> {
        Ok(self.client.batch_execute("BEGIN")?)
    }

    fn execute(&mut self, statement: &str) -> Result<(), SinkError> {
        debug!("Executing: {statement}");
        Ok(self.client.batch_execute(statement)?)
    }

    fn bulk_copy(&mut self, data: &[u8], target: &CopyTarget) -> Result<u64, SinkError> {
        let statement = target.copy_statement();
        debug!("Copying {} byte(s): {statement}", data.len());
        let mut writer = self.client.copy_in(statement.as_str())?;
        writer.write_all(data)?;
        Ok(writer.finish()?)
    }

    fn commit(&mut self) -> Result<(), SinkError> {
        Ok(self.client.batch_execute("COMMIT")?)
    }

    fn rollback(&mut self) -> Result<(), SinkError> {
        Ok(self.client.batch_execute("ROLLBACK")?)
    }

    fn close(self) -> Result<(), SinkError> {
        Ok(self.client.close()?)
    }
}
