//! Batched CSV output.
//!
//! [`BatchWriter`] buffers flattened rows and writes them in batches. The
//! header line is written exactly once, before the first data row; a run
//! that never produces a row never writes a header.

use csv::{QuoteStyle, Terminator, Writer, WriterBuilder};
use std::collections::BTreeSet;
use std::io::Write;

use crate::error::SinkResult;
use crate::models::FlatRow;
use crate::transform::headers::{project, Column, ColumnPlan};

/// Default number of rows buffered before a flush.
pub const DEFAULT_BATCH_SIZE: usize = 500;

/// What a finished writer reports back.
#[derive(Debug)]
pub struct SinkSummary<W> {
    /// Header cells as written (empty when no header was written).
    pub columns: Vec<String>,
    pub rows_written: u64,
    pub header_written: bool,
    /// Columns that appeared after a first-row header was fixed.
    pub dropped_columns: Vec<String>,
    pub output: W,
}

/// Buffered CSV writer with a write-once header.
pub struct BatchWriter<W: Write> {
    writer: Writer<W>,
    plan: ColumnPlan,
    columns: Option<Vec<Column>>,
    batch: Vec<FlatRow>,
    batch_size: usize,
    rows_written: u64,
    header_written: bool,
    dropped: BTreeSet<String>,
}

impl<W: Write> BatchWriter<W> {
    pub fn new(inner: W, plan: ColumnPlan, batch_size: usize) -> Self {
        let writer = WriterBuilder::new()
            .quote_style(QuoteStyle::Necessary)
            .terminator(Terminator::Any(b'\n'))
            .from_writer(inner);
        let columns = match &plan {
            ColumnPlan::Fixed(columns) => Some(columns.clone()),
            ColumnPlan::FromFirstRow => None,
        };
        Self {
            writer,
            plan,
            columns,
            batch: Vec::with_capacity(batch_size.max(1)),
            batch_size: batch_size.max(1),
            rows_written: 0,
            header_written: false,
            dropped: BTreeSet::new(),
        }
    }

    /// Buffer a row, flushing when the batch is full.
    pub fn push(&mut self, row: FlatRow) -> SinkResult<()> {
        self.batch.push(row);
        if self.batch.len() >= self.batch_size {
            self.flush_batch()?;
        }
        Ok(())
    }

    /// Write every buffered row, emitting the header first if needed.
    pub fn flush_batch(&mut self) -> SinkResult<()> {
        if self.batch.is_empty() {
            return Ok(());
        }

        let batch = std::mem::take(&mut self.batch);
        if !self.header_written {
            self.write_header(&batch[0])?;
        }

        let columns = self.columns.as_deref().unwrap_or(&[]);
        for row in &batch {
            if self.plan == ColumnPlan::FromFirstRow {
                for column in row.columns() {
                    if !columns.iter().any(|c| c.source == column) && !self.dropped.contains(column) {
                        log::warn!("Column '{}' first appeared after the header was written; dropping it", column);
                        self.dropped.insert(column.to_string());
                    }
                }
            }
            self.writer.write_record(project(row, columns))?;
        }
        self.rows_written += batch.len() as u64;
        self.writer.flush()?;
        log::debug!("Flushed {} rows ({} total)", batch.len(), self.rows_written);

        self.batch = batch;
        self.batch.clear();
        Ok(())
    }

    fn write_header(&mut self, first: &FlatRow) -> SinkResult<()> {
        let columns = match self.columns.take() {
            Some(columns) => columns,
            None => first.sorted_columns().into_iter().map(Column::identity).collect(),
        };
        self.writer.write_record(columns.iter().map(|c| c.name.as_str()))?;
        self.columns = Some(columns);
        self.header_written = true;
        Ok(())
    }

    /// Rows buffered and not yet written.
    pub fn pending(&self) -> usize {
        self.batch.len()
    }

    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }

    pub fn header_written(&self) -> bool {
        self.header_written
    }

    /// Header names, once known.
    pub fn columns(&self) -> Option<Vec<String>> {
        self.columns
            .as_ref()
            .map(|columns| columns.iter().map(|c| c.name.clone()).collect())
    }

    /// Flush the remaining rows and hand back the underlying writer.
    pub fn finish(mut self) -> SinkResult<SinkSummary<W>> {
        self.flush_batch()?;
        self.writer.flush()?;
        let columns = if self.header_written {
            self.columns().unwrap_or_default()
        } else {
            Vec::new()
        };
        let output = self.writer.into_inner().map_err(|e| e.into_error())?;
        Ok(SinkSummary {
            columns,
            rows_written: self.rows_written,
            header_written: self.header_written,
            dropped_columns: self.dropped.into_iter().collect(),
            output,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn row(pairs: &[(&str, &str)]) -> FlatRow {
        pairs.iter().copied().collect()
    }

    fn fixed(names: &[&str]) -> ColumnPlan {
        ColumnPlan::Fixed(names.iter().map(|n| Column::identity(*n)).collect())
    }

    fn output(summary: SinkSummary<Vec<u8>>) -> String {
        String::from_utf8(summary.output).unwrap()
    }

    #[test]
    fn test_header_written_once_across_batches() {
        let mut writer = BatchWriter::new(Vec::new(), fixed(&["a", "b"]), 2);
        for i in 0..5 {
            writer.push(row(&[("a", &i.to_string())])).unwrap();
        }
        assert_eq!(writer.pending(), 1);
        assert_eq!(writer.rows_written(), 4);

        let summary = writer.finish().unwrap();
        assert_eq!(summary.rows_written, 5);
        assert_eq!(output(summary), "a,b\n0,\n1,\n2,\n3,\n4,\n");
    }

    #[test]
    fn test_no_rows_no_header() {
        let writer = BatchWriter::new(Vec::new(), fixed(&["a"]), 10);
        let summary = writer.finish().unwrap();
        assert!(!summary.header_written);
        assert!(summary.columns.is_empty());
        assert!(summary.output.is_empty());
    }

    #[test]
    fn test_quoting() {
        let mut writer = BatchWriter::new(Vec::new(), fixed(&["v"]), 10);
        writer.push(row(&[("v", "a,b")])).unwrap();
        writer.push(row(&[("v", "say \"hi\"")])).unwrap();
        writer.push(row(&[("v", "two\nlines")])).unwrap();
        writer.push(row(&[("v", "plain")])).unwrap();

        assert_eq!(
            output(writer.finish().unwrap()),
            "v\n\"a,b\"\n\"say \"\"hi\"\"\"\n\"two\nlines\"\nplain\n"
        );
    }

    #[test]
    fn test_mapped_header_names() {
        let plan = ColumnPlan::Fixed(vec![Column::mapped("Item_B", "beta"), Column::mapped("Item_A", "alpha")]);
        let mut writer = BatchWriter::new(Vec::new(), plan, 10);
        writer.push(row(&[("Item_A", "1"), ("Item_B", "2")])).unwrap();
        assert_eq!(output(writer.finish().unwrap()), "beta,alpha\n2,1\n");
    }

    #[test]
    fn test_first_row_header_drops_late_columns() {
        let mut writer = BatchWriter::new(Vec::new(), ColumnPlan::FromFirstRow, 1);
        writer.push(row(&[("b", "1"), ("a", "2")])).unwrap();
        assert_eq!(writer.columns(), Some(vec!["a".to_string(), "b".to_string()]));
        writer.push(row(&[("a", "3"), ("c", "4")])).unwrap();

        let summary = writer.finish().unwrap();
        assert_eq!(summary.dropped_columns, vec!["c"]);
        assert_eq!(output(summary), "a,b\n2,1\n3,\n");
    }

    #[test]
    fn test_zero_batch_size_is_treated_as_one() {
        let mut writer = BatchWriter::new(Vec::new(), fixed(&["a"]), 0);
        writer.push(row(&[("a", "1")])).unwrap();
        assert_eq!(writer.pending(), 0);
        assert!(writer.header_written());
    }
}
