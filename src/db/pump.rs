//! Row pump for drivers whose result streams borrow the connection.
//!
//! The pump task owns the connection while a result is being read, sends the
//! column description and then each row through channels, and hands the
//! connection back through its `JoinHandle` once the stream is finished or the
//! reader goes away.

use anyhow::{anyhow, Result};
use std::future::Future;
use tokio::runtime::Runtime;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::connection::{FieldInfo, RowReader};
use super::value::FieldValue;

/// Rows buffered ahead of the reader.
const PUMP_CAPACITY: usize = 64;

/// A materialized field: either its value or the reason it could not be read.
pub type Cell = std::result::Result<FieldValue, String>;

/// Producer half handed to the pump task.
pub struct RowSink {
    fields: Option<oneshot::Sender<Result<Vec<FieldInfo>>>>,
    rows: mpsc::Sender<Result<Vec<Cell>>>,
}

impl RowSink {
    /// Publish the column description. Must precede any row.
    pub fn describe(&mut self, fields: Vec<FieldInfo>) {
        if let Some(tx) = self.fields.take() {
            let _ = tx.send(Ok(fields));
        }
    }

    /// Send one row. Returns `false` once the reader has been dropped.
    pub async fn row(&self, cells: Vec<Cell>) -> bool {
        self.rows.send(Ok(cells)).await.is_ok()
    }

    /// Report a failure to whichever side is currently waiting.
    pub async fn fail(mut self, err: anyhow::Error) {
        match self.fields.take() {
            Some(tx) => {
                let _ = tx.send(Err(err));
            }
            None => {
                let _ = self.rows.send(Err(err)).await;
            }
        }
    }
}

/// Connection slot for pumped drivers.
pub enum PumpSlot<C> {
    Idle(C),
    Busy(JoinHandle<C>),
    Lost,
}

impl<C: Send + 'static> PumpSlot<C> {
    /// Take the connection back, waiting for a finished pump if needed.
    ///
    /// Any reader fed by the pump must already be dropped.
    pub fn acquire(&mut self, runtime: &Runtime) -> Result<C> {
        match std::mem::replace(self, PumpSlot::Lost) {
            PumpSlot::Idle(conn) => Ok(conn),
            PumpSlot::Busy(handle) => runtime
                .block_on(handle)
                .map_err(|e| anyhow!("Connection was lost while reading a result: {e}")),
            PumpSlot::Lost => Err(anyhow!("Connection is no longer usable")),
        }
    }

    /// Abort a running pump. The connection it owned is lost.
    pub fn abort(&mut self) -> bool {
        if let PumpSlot::Busy(handle) = self {
            handle.abort();
            *self = PumpSlot::Lost;
            true
        } else {
            false
        }
    }
}

/// Start a pump task and wait for its column description.
///
/// `pump` receives the sink and must resolve to the connection it took.
pub fn start<C, F, Fut>(
    runtime: &Runtime,
    pump: F,
) -> (JoinHandle<C>, Result<PumpedReader>)
where
    C: Send + 'static,
    F: FnOnce(RowSink) -> Fut,
    Fut: Future<Output = C> + Send + 'static,
{
    let (fields_tx, fields_rx) = oneshot::channel();
    let (rows_tx, rows_rx) = mpsc::channel(PUMP_CAPACITY);
    let sink = RowSink {
        fields: Some(fields_tx),
        rows: rows_tx,
    };
    let handle = runtime.spawn(pump(sink));

    let reader = match runtime.block_on(fields_rx) {
        Ok(Ok(fields)) => Ok(PumpedReader {
            runtime: runtime.handle().clone(),
            fields,
            rows: rows_rx,
            current: Vec::new(),
        }),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(anyhow!("Row pump stopped before describing the result")),
    };
    (handle, reader)
}

/// Consumer half: a [`RowReader`] fed by a pump task.
pub struct PumpedReader {
    runtime: tokio::runtime::Handle,
    fields: Vec<FieldInfo>,
    rows: mpsc::Receiver<Result<Vec<Cell>>>,
    current: Vec<Cell>,
}

impl RowReader for PumpedReader {
    fn fields(&self) -> &[FieldInfo] {
        &self.fields
    }

    fn read(&mut self) -> Result<bool> {
        match self.runtime.block_on(self.rows.recv()) {
            Some(Ok(cells)) => {
                self.current = cells;
                Ok(true)
            }
            Some(Err(e)) => {
                self.current.clear();
                Err(e)
            }
            None => {
                self.current.clear();
                Ok(false)
            }
        }
    }

    fn value(&self, index: usize) -> Result<FieldValue> {
        match self.current.get(index) {
            Some(Ok(value)) => Ok(value.clone()),
            Some(Err(reason)) => Err(anyhow!("{reason}")),
            None => Err(anyhow!("Field index {index} is out of range")),
        }
    }
}
