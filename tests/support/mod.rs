//! In-memory backend that records what the virtual table asks of it.

use anyhow::{anyhow, Result};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use remote_vtab::db::{
    BackendConnection, BackendKind, Command, ConnectionFactory, FieldInfo, FieldType, FieldValue,
    RowReader,
};

#[derive(Default)]
pub struct State {
    pub fields: Vec<FieldInfo>,
    pub rows: Vec<Vec<FieldValue>>,
    /// Every command run as a reader, in order.
    pub readers: Vec<Command>,
    pub scalars: Vec<Command>,
    pub opened: usize,
    pub live: usize,
    pub max_live: usize,
    pub cancels: usize,
    /// Connection strings that refuse to open.
    pub refuse: Vec<String>,
    /// Column whose values fail to extract.
    pub broken_column: Option<usize>,
}

#[derive(Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<State>>,
}

impl MemoryBackend {
    pub fn new(fields: Vec<FieldInfo>, rows: Vec<Vec<FieldValue>>) -> Self {
        let backend = Self::default();
        {
            let mut state = backend.state();
            state.fields = fields;
            state.rows = rows;
        }
        backend
    }

    pub fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Reader commands other than the schema probe.
    pub fn scans(&self) -> Vec<Command> {
        self.state()
            .readers
            .iter()
            .filter(|c| !c.text.contains("WHERE 1 = 0"))
            .cloned()
            .collect()
    }
}

impl ConnectionFactory for MemoryBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Postgres
    }

    fn open(&self, connection_string: &str) -> Result<Box<dyn BackendConnection>> {
        let mut state = self.state();
        if state.refuse.iter().any(|s| s == connection_string) {
            return Err(anyhow!("connection refused by {connection_string}"));
        }
        state.opened += 1;
        state.live += 1;
        state.max_live = state.max_live.max(state.live);
        Ok(Box::new(MemoryConnection {
            state: Arc::clone(&self.state),
        }))
    }
}

struct MemoryConnection {
    state: Arc<Mutex<State>>,
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.state.lock().unwrap().live -= 1;
    }
}

impl BackendConnection for MemoryConnection {
    fn execute_scalar(&mut self, command: &Command) -> Result<FieldValue> {
        let mut state = self.state.lock().unwrap();
        state.scalars.push(command.clone());
        if command.text.starts_with("SELECT COUNT(*)") {
            Ok(FieldValue::Int64(state.rows.len() as i64))
        } else {
            Err(anyhow!("unexpected scalar: {}", command.text))
        }
    }

    fn execute_reader(&mut self, command: &Command) -> Result<Box<dyn RowReader>> {
        let mut state = self.state.lock().unwrap();
        state.readers.push(command.clone());
        let rows = if command.text.contains("WHERE 1 = 0") {
            VecDeque::new()
        } else {
            state.rows.iter().cloned().collect()
        };
        Ok(Box::new(MemoryReader {
            fields: state.fields.clone(),
            rows,
            current: None,
            broken_column: state.broken_column,
        }))
    }

    fn cancel(&mut self) -> Result<()> {
        self.state.lock().unwrap().cancels += 1;
        Ok(())
    }
}

struct MemoryReader {
    fields: Vec<FieldInfo>,
    rows: VecDeque<Vec<FieldValue>>,
    current: Option<Vec<FieldValue>>,
    broken_column: Option<usize>,
}

impl RowReader for MemoryReader {
    fn fields(&self) -> &[FieldInfo] {
        &self.fields
    }

    fn read(&mut self) -> Result<bool> {
        self.current = self.rows.pop_front();
        Ok(self.current.is_some())
    }

    fn value(&self, index: usize) -> Result<FieldValue> {
        if self.broken_column == Some(index) {
            return Err(anyhow!("cannot decode value of column {index}"));
        }
        self.current
            .as_ref()
            .and_then(|row| row.get(index))
            .cloned()
            .ok_or_else(|| anyhow!("no value at {index}"))
    }
}

/// `orders(id int, total numeric, placed timestamp)` with three rows, the
/// second with a null total.
pub fn orders_backend() -> MemoryBackend {
    let placed = |day: u32| {
        chrono::NaiveDate::from_ymd_opt(2024, 1, day)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap()
    };
    MemoryBackend::new(
        vec![
            FieldInfo::new("id", FieldType::Int32),
            FieldInfo::new("total", FieldType::Decimal),
            FieldInfo::new("placed", FieldType::DateTime),
        ],
        vec![
            vec![
                FieldValue::Int32(5),
                FieldValue::Decimal(99.5),
                FieldValue::DateTime(placed(5)),
            ],
            vec![
                FieldValue::Int32(6),
                FieldValue::Null,
                FieldValue::DateTime(placed(6)),
            ],
            vec![
                FieldValue::Int32(7),
                FieldValue::Decimal(12.25),
                FieldValue::DateTime(placed(7)),
            ],
        ],
    )
}
