//! The batching sink: assembler workers push rows into the insert buffer,
//! which flushes fixed-size per-table batches to the single db-writer
//! thread.

use std::sync::Mutex;
use std::thread::{self, JoinHandle};

use ahash::AHashMap;
use crossbeam_channel::{bounded, Receiver, Sender};
use log::error;

use crate::db::{Database, Row};

pub const DEFAULT_BATCH_SIZE: usize = 4096;

/// Batch size, overridable through `OSMPG_DBIMPORT_BATCHSIZE`.
pub fn batch_size_from_env() -> usize {
    std::env::var("OSMPG_DBIMPORT_BATCHSIZE")
        .ok()
        .and_then(|v| v.parse().ok())
        .filter(|&n| n > 0)
        .unwrap_or(DEFAULT_BATCH_SIZE)
}

type Batch = (String, Vec<Row>);

/// Multi-producer row buffer. Producers hold the lock only while appending
/// to a table's pending batch; full batches are sent outside of it.
pub struct InsertBuffer {
    pending: Mutex<AHashMap<String, Vec<Row>>>,
    tx: Sender<Batch>,
    batch_size: usize,
}

impl InsertBuffer {
    pub fn new(batch_size: usize) -> (InsertBuffer, Receiver<Batch>) {
        let (tx, rx) = bounded(16);
        (
            InsertBuffer {
                pending: Mutex::new(AHashMap::new()),
                tx,
                batch_size,
            },
            rx,
        )
    }

    pub fn insert(&self, table: &str, row: Row) {
        let full = {
            let mut pending = self.pending.lock().unwrap();
            let rows = pending.entry(table.to_string()).or_default();
            rows.push(row);
            if rows.len() >= self.batch_size {
                Some(std::mem::take(rows))
            } else {
                None
            }
        };
        if let Some(batch) = full {
            let _ = self.tx.send((table.to_string(), batch));
        }
    }

    /// Flushes all partial batches and closes the output channel.
    pub fn close(self) {
        let mut pending = self.pending.into_inner().unwrap();
        for (table, rows) in pending.drain() {
            if !rows.is_empty() {
                let _ = self.tx.send((table, rows));
            }
        }
    }
}

/// Single consumer performing the actual inserts. Insert errors drop the
/// batch and keep the pipeline running; the import is not transactional.
pub struct DbWriter {
    handle: JoinHandle<()>,
}

impl DbWriter {
    pub fn spawn(mut db: Box<dyn Database>, rx: Receiver<Batch>) -> DbWriter {
        let handle = thread::spawn(move || {
            for (table, rows) in rx {
                if let Err(e) = db.insert(&table, &rows) {
                    error!("dropping batch of {} rows for {}: {}", rows.len(), table, e);
                }
            }
        });
        DbWriter { handle }
    }

    /// Waits for the remaining batches to drain. Call after closing the
    /// insert buffer.
    pub fn close(self) {
        if self.handle.join().is_err() {
            error!("db writer thread panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqlValue;

    fn row(n: i64) -> Row {
        vec![SqlValue::Int(n)]
    }

    #[test]
    fn flushes_when_a_table_reaches_the_batch_size() {
        let (buf, rx) = InsertBuffer::new(2);
        buf.insert("roads", row(1));
        assert!(rx.try_recv().is_err());
        buf.insert("roads", row(2));
        let (table, rows) = rx.recv().unwrap();
        assert_eq!(table, "roads");
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn close_flushes_partial_batches_per_table() {
        let (buf, rx) = InsertBuffer::new(100);
        buf.insert("roads", row(1));
        buf.insert("poi", row(2));
        buf.close();

        let mut tables: Vec<String> = rx.iter().map(|(t, _)| t).collect();
        tables.sort();
        assert_eq!(tables, vec!["poi", "roads"]);
    }

    #[test]
    fn empty_buffer_closes_cleanly() {
        let (buf, rx) = InsertBuffer::new(4);
        buf.close();
        assert!(rx.recv().is_err());
    }
}
