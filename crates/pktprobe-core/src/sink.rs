//! Append-only destinations for correlation records.
//!
//! CSV lines are `send_cycle,index,recv_cycle`, with `recv_cycle = 0` for a
//! probe lost to timeout.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;

use tracing::debug;

use crate::probe::ProbeRecord;

pub trait RecordSink: Send {
    fn write(&mut self, record: &ProbeRecord) -> io::Result<()>;

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Buffered CSV writer.
pub struct CsvSink<W: Write> {
    out: BufWriter<W>,
}

impl CsvSink<File> {
    /// Opens `path` for appending, creating it if needed.
    pub fn append(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        debug!(path = %path.display(), "record sink opened");
        Ok(CsvSink::new(file))
    }
}

impl<W: Write> CsvSink<W> {
    pub fn new(inner: W) -> Self {
        CsvSink {
            out: BufWriter::with_capacity(64 * 1024, inner),
        }
    }

    pub fn into_inner(self) -> io::Result<W> {
        self.out.into_inner().map_err(|e| e.into_error())
    }
}

impl<W: Write + Send> RecordSink for CsvSink<W> {
    fn write(&mut self, record: &ProbeRecord) -> io::Result<()> {
        writeln!(
            self.out,
            "{},{},{}",
            record.send_cycle,
            record.index,
            record.recv_cycle.unwrap_or(0)
        )
    }

    fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}

/// Keeps every record in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub records: Vec<ProbeRecord>,
}

impl RecordSink for MemorySink {
    fn write(&mut self, record: &ProbeRecord) -> io::Result<()> {
        self.records.push(*record);
        Ok(())
    }
}

/// Discards everything.
#[derive(Debug, Default)]
pub struct NullSink;

impl RecordSink for NullSink {
    fn write(&mut self, _record: &ProbeRecord) -> io::Result<()> {
        Ok(())
    }
}
