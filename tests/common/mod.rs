#![allow(dead_code)]

use std::{
    cell::{Cell, RefCell},
    fs,
    path::{Path, PathBuf},
    rc::Rc,
};

use nppes_loader::{
    error::{LoadResult, SinkError},
    scan::{Slice, TabularView},
    warehouse::{CopyTarget, SinkConnection, Warehouse},
};
use tempfile::{TempDir, tempdir};

/// Scratch directory standing in for a blob container.
pub struct TestWorkspace {
    temp_dir: TempDir,
}

impl TestWorkspace {
    pub fn new() -> Self {
        Self {
            temp_dir: tempdir().expect("temp dir"),
        }
    }

    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Writes `contents` under the workspace and returns the path.
    pub fn write(&self, name: &str, contents: impl AsRef<[u8]>) -> PathBuf {
        let path = self.temp_dir.path().join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent dirs");
        }
        fs::write(&path, contents).expect("write temp file contents");
        path
    }
}

/// `n` provider rows with a zero-padded ZIP column.
pub fn provider_csv(rows: usize) -> String {
    let mut csv = String::from("NPI,Provider Business Practice Location Address Postal Code\n");
    for idx in 0..rows {
        csv.push_str(&format!("{},{:05}\n", 1_000_000_000 + idx, 37_000 + idx));
    }
    csv
}

/// Wraps a view and records every `slice` window with the rows it returned.
pub struct CountingView {
    inner: Box<dyn TabularView>,
    reads: Vec<(usize, usize, usize)>,
}

impl CountingView {
    pub fn new(inner: Box<dyn TabularView>) -> Self {
        Self {
            inner,
            reads: Vec::new(),
        }
    }

    /// `(offset, length)` of each slice request, in call order.
    pub fn windows(&self) -> Vec<(usize, usize)> {
        self.reads.iter().map(|&(offset, length, _)| (offset, length)).collect()
    }

    pub fn returned(&self) -> Vec<usize> {
        self.reads.iter().map(|&(_, _, rows)| rows).collect()
    }
}

impl TabularView for CountingView {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn schema(&self) -> &[String] {
        self.inner.schema()
    }

    fn slice(&mut self, offset: usize, length: usize) -> LoadResult<Slice> {
        let slice = self.inner.slice(offset, length)?;
        self.reads.push((offset, length, slice.len()));
        Ok(slice)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Connect,
    Begin,
    Execute(String),
    Copy { statement: String, payload: String },
    Commit,
    Rollback,
    Close,
}

#[derive(Debug, Default)]
struct Shared {
    events: RefCell<Vec<Event>>,
    committed: RefCell<Vec<String>>,
    pending: RefCell<Option<Vec<String>>>,
    copies: Cell<usize>,
    fail_connect: bool,
    fail_copy_at: Option<usize>,
    fail_execute: bool,
}

impl Shared {
    fn record(&self, event: Event) {
        self.events.borrow_mut().push(event);
    }
}

/// In-memory sink that records every call and simulates one table with
/// transactional truncate-then-append semantics.
#[derive(Debug, Clone, Default)]
pub struct RecordingWarehouse {
    shared: Rc<Shared>,
}

impl RecordingWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts with `rows` already committed in the table.
    pub fn seeded(rows: &[&str]) -> Self {
        let warehouse = Self::new();
        *warehouse.shared.committed.borrow_mut() = rows.iter().map(|r| r.to_string()).collect();
        warehouse
    }

    /// The copy with this zero-based index is rejected.
    pub fn failing_copy(index: usize) -> Self {
        Self {
            shared: Rc::new(Shared {
                fail_copy_at: Some(index),
                ..Shared::default()
            }),
        }
    }

    pub fn failing_execute(seed: &[&str]) -> Self {
        let shared = Shared {
            fail_execute: true,
            ..Shared::default()
        };
        *shared.committed.borrow_mut() = seed.iter().map(|r| r.to_string()).collect();
        Self {
            shared: Rc::new(shared),
        }
    }

    pub fn unreachable() -> Self {
        Self {
            shared: Rc::new(Shared {
                fail_connect: true,
                ..Shared::default()
            }),
        }
    }

    pub fn events(&self) -> Vec<Event> {
        self.shared.events.borrow().clone()
    }

    pub fn count(&self, event: &Event) -> usize {
        self.shared.events.borrow().iter().filter(|e| *e == event).count()
    }

    pub fn executed(&self) -> Vec<String> {
        self.shared
            .events
            .borrow()
            .iter()
            .filter_map(|event| match event {
                Event::Execute(statement) => Some(statement.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn payloads(&self) -> Vec<String> {
        self.shared
            .events
            .borrow()
            .iter()
            .filter_map(|event| match event {
                Event::Copy { payload, .. } => Some(payload.clone()),
                _ => None,
            })
            .collect()
    }

    /// Rows visible in the simulated table after the last commit.
    pub fn table(&self) -> Vec<String> {
        self.shared.committed.borrow().clone()
    }
}

pub struct RecordingConnection {
    shared: Rc<Shared>,
}

impl Warehouse for RecordingWarehouse {
    type Connection = RecordingConnection;

    fn connect(&self) -> Result<Self::Connection, SinkError> {
        if self.shared.fail_connect {
            return Err(SinkError::Rejected("connection refused".to_string()));
        }
        self.shared.record(Event::Connect);
        Ok(RecordingConnection {
            shared: Rc::clone(&self.shared),
        })
    }
}

impl SinkConnection for RecordingConnection {
    fn begin(&mut self) -> Result<(), SinkError> {
        self.shared.record(Event::Begin);
        *self.shared.pending.borrow_mut() = Some(self.shared.committed.borrow().clone());
        Ok(())
    }

    fn execute(&mut self, statement: &str) -> Result<(), SinkError> {
        self.shared.record(Event::Execute(statement.to_string()));
        if self.shared.fail_execute {
            return Err(SinkError::Rejected(format!("'{statement}' rejected")));
        }
        if statement.starts_with("TRUNCATE")
            && let Some(pending) = self.shared.pending.borrow_mut().as_mut()
        {
            pending.clear();
        }
        Ok(())
    }

    fn bulk_copy(&mut self, data: &[u8], target: &CopyTarget) -> Result<u64, SinkError> {
        let payload = String::from_utf8_lossy(data).into_owned();
        self.shared.record(Event::Copy {
            statement: target.copy_statement(),
            payload: payload.clone(),
        });
        let index = self.shared.copies.get();
        self.shared.copies.set(index + 1);
        if self.shared.fail_copy_at == Some(index) {
            return Err(SinkError::Rejected(format!("copy {index} rejected")));
        }
        let lines = payload.lines().map(str::to_string).collect::<Vec<_>>();
        let copied = lines.len() as u64;
        if let Some(pending) = self.shared.pending.borrow_mut().as_mut() {
            pending.extend(lines);
        }
        Ok(copied)
    }

    fn commit(&mut self) -> Result<(), SinkError> {
        self.shared.record(Event::Commit);
        if let Some(pending) = self.shared.pending.borrow_mut().take() {
            *self.shared.committed.borrow_mut() = pending;
        }
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), SinkError> {
        self.shared.record(Event::Rollback);
        self.shared.pending.borrow_mut().take();
        Ok(())
    }

    fn close(self) -> Result<(), SinkError> {
        self.shared.record(Event::Close);
        Ok(())
    }
}
