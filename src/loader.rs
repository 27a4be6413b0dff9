//! Chunked truncate-then-append loader.
//!
//! One [`Session`] per target table. Windows of `chunk_size` rows are read
//! from the view, encoded as tab-delimited text and copied in their own
//! transaction. Chunk 0 truncates the table inside that same transaction, so
//! the previous contents disappear as soon as the first chunk commits. A
//! failed chunk is rolled back and ends the load; earlier chunks stay
//! committed.
//!
//! The loop stops on an empty window or on a window shorter than
//! `chunk_size`. A source whose row count is a multiple of `chunk_size`
//! therefore costs one extra (empty) read.

use log::{debug, error, info, warn};

use crate::{
    error::{LoadError, LoadResult, SinkError},
    scan::{Slice, TabularView},
    warehouse::{CopyTarget, Session, SinkConnection, Warehouse},
};

pub const DEFAULT_CHUNK_SIZE: usize = 100_000;
pub const DEFAULT_DELIMITER: u8 = b'\t';

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoaderSettings {
    pub chunk_size: usize,
    pub delimiter: u8,
    pub null_marker: String,
}

impl Default for LoaderSettings {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            delimiter: DEFAULT_DELIMITER,
            null_marker: String::new(),
        }
    }
}

impl LoaderSettings {
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadReport {
    pub table: String,
    pub rows: usize,
    pub chunks: usize,
}

pub struct ChunkedLoader<'a, W: Warehouse> {
    warehouse: &'a W,
    settings: LoaderSettings,
}

impl<'a, W: Warehouse> ChunkedLoader<'a, W> {
    pub fn new(warehouse: &'a W, settings: LoaderSettings) -> LoadResult<Self> {
        if settings.chunk_size == 0 {
            return Err(LoadError::InvalidConfig(
                "chunk size must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            warehouse,
            settings,
        })
    }

    pub fn settings(&self) -> &LoaderSettings {
        &self.settings
    }

    pub fn load(&self, view: &mut dyn TabularView, table: &str) -> LoadResult<LoadReport> {
        let target = CopyTarget::new(
            table,
            view.schema(),
            self.settings.delimiter,
            &self.settings.null_marker,
        )?;
        let chunk_size = self.settings.chunk_size;
        info!(
            "Loading '{}' into '{}' in chunks of {} row(s)",
            view.name(),
            table,
            chunk_size
        );

        let mut session = Session::open(self.warehouse, table).map_err(|cause| {
            LoadError::LoadFailed {
                table: table.to_string(),
                chunk_index: 0,
                cause,
            }
        })?;
        let mut offset = 0usize;
        let mut chunk_index = 0usize;

        loop {
            let batch = match view.slice(offset, chunk_size)? {
                Slice::Rows(batch) => batch,
                Slice::EndOfData => {
                    debug!("No rows left in '{}' at offset {offset}", view.name());
                    break;
                }
            };
            let rows = batch.len();
            let payload = batch.encode_text(self.settings.delimiter, &self.settings.null_marker);
            drop(batch);

            let truncate = chunk_index == 0;
            let outcome = session.transaction(|connection| {
                if truncate {
                    connection.execute(&target.truncate_statement())?;
                }
                connection.bulk_copy(&payload, &target)
            });
            if let Err(cause) = outcome {
                error!(
                    "Chunk {chunk_index} of '{}' failed after {offset} row(s) were committed: {cause}",
                    table
                );
                if let Err(err) = session.close() {
                    warn!("Closing connection for '{table}' failed: {err}");
                }
                return Err(LoadError::LoadFailed {
                    table: table.to_string(),
                    chunk_index,
                    cause,
                });
            }

            offset += rows;
            chunk_index += 1;
            info!("Chunk {chunk_index} committed: {rows} row(s), {offset} total into '{table}'");

            if rows < chunk_size {
                break;
            }
        }

        if let Err(err) = session.close() {
            warn!("Closing connection for '{table}' failed: {err}");
        }
        info!("Loaded {offset} row(s) into '{table}' in {chunk_index} chunk(s)");
        Ok(LoadReport {
            table: table.to_string(),
            rows: offset,
            chunks: chunk_index,
        })
    }
}

/// Runs `work` inside one transaction on a fresh session, closing it afterwards.
pub(crate) fn load_once<W, F>(warehouse: &W, table: &str, work: F) -> LoadResult<u64>
where
    W: Warehouse,
    F: FnOnce(&mut W::Connection) -> Result<u64, SinkError>,
{
    let failed = |cause: SinkError| LoadError::LoadFailed {
        table: table.to_string(),
        chunk_index: 0,
        cause,
    };
    let mut session = Session::open(warehouse, table).map_err(failed)?;
    let copied = session.transaction(work);
    let closed = session.close();
    let copied = copied.map_err(failed)?;
    if let Err(err) = closed {
        warn!("Closing connection for '{table}' failed: {err}");
    }
    Ok(copied)
}
