//! Result sinks
//!
//! Append-only artifacts receiving one entry per benchmark result, flushed as
//! soon as the result is produced.

use super::BenchmarkResult;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

/// Receives benchmark results in the order they are produced
pub trait ResultSink: Send {
    fn record(&mut self, result: &BenchmarkResult) -> io::Result<()>;
}

/// Plain text artifact: columns and row data per query
pub struct TextFileSink<W: Write + Send = BufWriter<File>> {
    writer: W,
}

impl TextFileSink<BufWriter<File>> {
    pub fn create(path: &Path) -> io::Result<Self> {
        Ok(Self::new(BufWriter::new(File::create(path)?)))
    }
}

impl<W: Write + Send> TextFileSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    #[cfg(test)]
    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> ResultSink for TextFileSink<W> {
    fn record(&mut self, result: &BenchmarkResult) -> io::Result<()> {
        let w = &mut self.writer;
        if let Some(checkpoint) = result.checkpoint {
            write!(w, "Checkpoint {} ", checkpoint)?;
        }
        writeln!(w, "Query {} [{}]: {}", result.index, result.query_id, result.query)?;
        writeln!(w, "Columns: [{}]", result.columns.join(" "))?;
        for row in &result.rows {
            writeln!(w, "RowData: [{}]", row.display_values().join(" "))?;
        }
        writeln!(w, "Rows: {} Duration: {:?}", result.row_count, result.elapsed)?;
        writeln!(w)?;
        w.flush()
    }
}

/// One JSON object per line
pub struct JsonLinesSink<W: Write + Send = BufWriter<File>> {
    writer: W,
}

impl JsonLinesSink<BufWriter<File>> {
    pub fn create(path: &Path) -> io::Result<Self> {
        Ok(Self::new(BufWriter::new(File::create(path)?)))
    }
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    #[cfg(test)]
    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> ResultSink for JsonLinesSink<W> {
    fn record(&mut self, result: &BenchmarkResult) -> io::Result<()> {
        serde_json::to_writer(&mut self.writer, result)?;
        writeln!(self.writer)?;
        self.writer.flush()
    }
}
