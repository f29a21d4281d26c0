//! High-level conversion API: XML records to CSV rows.
//!
//! A run goes through `Idle → Fetching → Previewing? → Mapping? → Streaming`
//! and ends `Completed`, `Stopped` or `Failed`. The [`Converter`] owns the
//! options, the stop signal and the progress observer; the per-run
//! [`ConversionState`] lives only for the duration of one call.
//!
//! # Example
//!
//! ```rust,ignore
//! use xml2csv::{convert_source, ConvertOptions, Converter, XmlSource};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let converter = Converter::new(ConvertOptions::default());
//!     let outcome = convert_source(&converter, XmlSource::file("feed.xml"), Vec::new()).await?;
//!
//!     println!("Wrote {} rows", outcome.rows_written);
//!     Ok(())
//! }
//! ```

use serde::Serialize;
use std::io::{BufReader, Cursor, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::ConvertOptions;
use crate::error::{ConvertError, ConvertResult, MappingError, ParseError, ParseResult, SinkError};
use crate::models::{FlatRow, HeaderPolicy, Progress, RunState};
use crate::parser::{preview_reader, Preview, RecordReader, RecordSelector};
use crate::sink::BatchWriter;
use crate::source::{FetchMode, OpenedSource, Replay, XmlSource};
use crate::transform::flatten::flatten_record;
use crate::transform::headers::{ColumnPlan, HeaderSet};
use crate::validation::{duplicate_destinations, missing_sources};

// =============================================================================
// Cancellation
// =============================================================================

/// Cooperative cancellation, polled once before each record.
pub trait StopSignal: Send + Sync {
    fn should_stop(&self) -> bool;
}

impl StopSignal for AtomicBool {
    fn should_stop(&self) -> bool {
        self.load(Ordering::SeqCst)
    }
}

impl<T: StopSignal + ?Sized> StopSignal for Arc<T> {
    fn should_stop(&self) -> bool {
        (**self).should_stop()
    }
}

impl<F> StopSignal for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn should_stop(&self) -> bool {
        self()
    }
}

/// A signal that never fires.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverStop;

impl StopSignal for NeverStop {
    fn should_stop(&self) -> bool {
        false
    }
}

// =============================================================================
// Progress
// =============================================================================

/// Observer for run state changes and progress.
pub trait ProgressSink: Send + Sync {
    fn on_state(&self, _state: RunState) {}

    fn on_progress(&self, _progress: Progress) {}
}

/// Discards every notification.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressSink for NoProgress {}

/// Writes notifications to the `log` facade.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn on_state(&self, state: RunState) {
        log::info!("Run state: {}", state);
    }

    fn on_progress(&self, progress: Progress) {
        match progress.total {
            Some(total) => log::info!(
                "Processed {}/{} records ({:.0}%)",
                progress.records,
                total,
                progress.fraction * 100.0
            ),
            None => log::info!("Processed {} records (~{:.0}%)", progress.records, progress.fraction * 100.0),
        }
    }
}

// =============================================================================
// Run State
// =============================================================================

/// Mutable state of one run. Created at run start, dropped at run end.
#[derive(Debug)]
pub struct ConversionState {
    state: RunState,
    records: u64,
    fraction: f64,
}

impl ConversionState {
    fn new() -> Self {
        Self {
            state: RunState::Idle,
            records: 0,
            fraction: 0.0,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn fraction(&self) -> f64 {
        self.fraction
    }

    fn transition(&mut self, next: RunState, observer: &dyn ProgressSink) -> ConvertResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(ConvertError::InvalidTransition { from: self.state, to: next });
        }
        self.state = next;
        observer.on_state(next);
        Ok(())
    }

    /// Move to `Failed` unless the run already ended.
    fn fail(&mut self, observer: &dyn ProgressSink) {
        if !self.state.is_terminal() {
            self.state = RunState::Failed;
            observer.on_state(RunState::Failed);
        }
    }

    fn report(&mut self, records: u64, total: Option<u64>, estimated: u64, observer: &dyn ProgressSink) {
        let raw = match total {
            Some(0) => 1.0,
            Some(total) => records as f64 / total as f64,
            None => records as f64 / estimated.max(1) as f64,
        };
        self.fraction = raw.clamp(0.0, 1.0).max(self.fraction);
        self.records = records;
        observer.on_progress(Progress {
            records,
            total,
            fraction: self.fraction,
        });
    }

    fn complete(&mut self, total: Option<u64>, observer: &dyn ProgressSink) -> ConvertResult<()> {
        self.transition(RunState::Completed, observer)?;
        self.fraction = 1.0;
        observer.on_progress(Progress {
            records: self.records,
            total,
            fraction: 1.0,
        });
        Ok(())
    }
}

// =============================================================================
// Outcome
// =============================================================================

/// Result of a run that reached a terminal state.
#[derive(Debug)]
pub struct ConversionOutcome<W> {
    pub status: RunState,
    /// Record tag used (configured or inferred).
    pub record_tag: Option<String>,
    /// Records flattened in the writing pass.
    pub records: u64,
    pub rows_written: u64,
    /// Header as written.
    pub columns: Vec<String>,
    pub header_written: bool,
    /// Columns dropped by the first-record header policy.
    pub dropped_columns: Vec<String>,
    pub mapping_warnings: Vec<MappingError>,
    /// Fatal parse error for `Failed` runs.
    pub error: Option<ConvertError>,
    pub output: W,
}

impl<W> ConversionOutcome<W> {
    fn empty(status: RunState, record_tag: Option<String>, output: W) -> Self {
        Self {
            status,
            record_tag,
            records: 0,
            rows_written: 0,
            columns: Vec::new(),
            header_written: false,
            dropped_columns: Vec::new(),
            mapping_warnings: Vec::new(),
            error: None,
            output,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == RunState::Completed
    }

    /// Turn a `Failed` outcome into its error.
    pub fn into_result(mut self) -> ConvertResult<Self> {
        match self.error.take() {
            Some(e) => Err(e),
            None => Ok(self),
        }
    }

    /// Serializable summary without the output.
    pub fn summary(&self) -> RunSummary {
        RunSummary {
            status: self.status,
            record_tag: self.record_tag.clone(),
            records: self.records,
            rows_written: self.rows_written,
            columns: self.columns.clone(),
            dropped_columns: self.dropped_columns.clone(),
            mapping_warnings: self.mapping_warnings.clone(),
            error: self.error.as_ref().map(|e| e.to_string()),
        }
    }
}

/// JSON-friendly view of a [`ConversionOutcome`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub status: RunState,
    pub record_tag: Option<String>,
    pub records: u64,
    pub rows_written: u64,
    pub columns: Vec<String>,
    pub dropped_columns: Vec<String>,
    pub mapping_warnings: Vec<MappingError>,
    pub error: Option<String>,
}

// =============================================================================
// Converter
// =============================================================================

/// How one pass over the records ended.
enum PassEnd {
    Completed,
    Stopped,
    Failed(ParseError),
}

/// Drives conversion runs.
#[derive(Clone)]
pub struct Converter {
    options: ConvertOptions,
    stop: Arc<dyn StopSignal>,
    progress: Arc<dyn ProgressSink>,
}

impl Converter {
    pub fn new(options: ConvertOptions) -> Self {
        Self {
            options,
            stop: Arc::new(NeverStop),
            progress: Arc::new(LogProgress),
        }
    }

    pub fn with_stop_signal(mut self, stop: Arc<dyn StopSignal>) -> Self {
        self.stop = stop;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    pub fn options(&self) -> &ConvertOptions {
        &self.options
    }

    /// Convert an already opened source.
    ///
    /// Parse errors end the run as `Failed` and are returned inside the
    /// outcome, after every row read so far has been written. Sink, rewind
    /// and configuration errors are returned as `Err`.
    pub fn run<R: Replay, W: Write>(&self, input: R, output: W) -> ConvertResult<ConversionOutcome<W>> {
        let mut state = ConversionState::new();
        state.transition(RunState::Fetching, &*self.progress)?;
        self.resume(state, input, output)
    }

    fn resume<R: Replay, W: Write>(
        &self,
        mut state: ConversionState,
        mut input: R,
        output: W,
    ) -> ConvertResult<ConversionOutcome<W>> {
        match self.execute(&mut state, &mut input, output) {
            Ok(outcome) => {
                match &outcome.error {
                    Some(e) => log::error!("Conversion failed after {} rows: {}", outcome.rows_written, e),
                    None => log::info!(
                        "Conversion {}: {} rows, {} columns",
                        outcome.status,
                        outcome.rows_written,
                        outcome.columns.len()
                    ),
                }
                Ok(outcome)
            }
            Err(e) => {
                log::error!("Conversion failed: {}", e);
                state.fail(&*self.progress);
                Err(e)
            }
        }
    }

    fn execute<R: Replay, W: Write>(
        &self,
        state: &mut ConversionState,
        input: &mut R,
        output: W,
    ) -> ConvertResult<ConversionOutcome<W>> {
        let options = &self.options;
        options.validate()?;

        let record_tag = match &options.record_tag {
            Some(tag) => tag.clone(),
            None => {
                state.transition(RunState::Previewing, &*self.progress)?;
                let inferred = match self.infer_record_tag(input)? {
                    Ok(inferred) => inferred,
                    Err(e) => {
                        state.transition(RunState::Failed, &*self.progress)?;
                        let mut outcome = ConversionOutcome::empty(RunState::Failed, None, output);
                        outcome.error = Some(e.into());
                        return Ok(outcome);
                    }
                };
                match inferred {
                    Some(tag) => {
                        log::info!("Inferred record tag <{}>", tag);
                        input.replay().map_err(ConvertError::Rewind)?;
                        tag
                    }
                    None => {
                        log::warn!("No structured element found in the document");
                        state.complete(None, &*self.progress)?;
                        return Ok(ConversionOutcome::empty(RunState::Completed, None, output));
                    }
                }
            }
        };

        let mut warnings = Vec::new();
        if let Some(mapping) = &options.mapping {
            state.transition(RunState::Mapping, &*self.progress)?;
            warnings = duplicate_destinations(mapping);
            for warning in &warnings {
                log::warn!("{}", warning);
            }
        }

        state.transition(RunState::Streaming, &*self.progress)?;
        let selector = RecordSelector::tag(record_tag.clone());
        log::info!(
            "Streaming <{}> records ({} header policy, batch size {})",
            record_tag,
            if options.mapping.is_some() { "mapped" } else { options.header_policy.as_str() },
            options.batch_size
        );

        let mut outcome = match (&options.mapping, options.header_policy) {
            (Some(mapping), _) => {
                let mut headers = HeaderSet::new();
                let mut writer = BatchWriter::new(output, ColumnPlan::from_mapping(mapping), options.batch_size);
                let (records, end) = self.stream_pass(state, &mut *input, &selector, None, true, |row| {
                    headers.extend_from_row(&row);
                    writer.push(row)
                })?;
                if matches!(end, PassEnd::Completed) && records > 0 {
                    for warning in missing_sources(mapping, &headers) {
                        log::warn!("{}", warning);
                        warnings.push(warning);
                    }
                }
                self.finish(state, writer, records, end, None)?
            }
            (None, HeaderPolicy::TwoPass) => {
                let mut headers = HeaderSet::new();
                let (total, end) = self.stream_pass(state, &mut *input, &selector, None, false, |row| {
                    headers.extend_from_row(&row);
                    Ok(())
                })?;
                match end {
                    PassEnd::Completed => {
                        log::info!("Found {} records and {} columns", total, headers.len());
                        input.replay().map_err(ConvertError::Rewind)?;
                        let mut writer =
                            BatchWriter::new(output, ColumnPlan::from_headers(&headers), options.batch_size);
                        let (records, end) =
                            self.stream_pass(state, &mut *input, &selector, Some(total), true, |row| writer.push(row))?;
                        self.finish(state, writer, records, end, Some(total))?
                    }
                    PassEnd::Stopped => {
                        state.transition(RunState::Stopped, &*self.progress)?;
                        ConversionOutcome::empty(RunState::Stopped, None, output)
                    }
                    PassEnd::Failed(e) => {
                        state.transition(RunState::Failed, &*self.progress)?;
                        let mut outcome = ConversionOutcome::empty(RunState::Failed, None, output);
                        outcome.error = Some(e.into());
                        outcome
                    }
                }
            }
            (None, HeaderPolicy::FirstRecord) => {
                let mut writer = BatchWriter::new(output, ColumnPlan::FromFirstRow, options.batch_size);
                let (records, end) =
                    self.stream_pass(state, &mut *input, &selector, None, true, |row| writer.push(row))?;
                self.finish(state, writer, records, end, None)?
            }
            (None, HeaderPolicy::FullBuffer) => {
                let mut headers = HeaderSet::new();
                let mut rows = Vec::new();
                let (records, end) = self.stream_pass(state, &mut *input, &selector, None, true, |row| {
                    headers.extend_from_row(&row);
                    rows.push(row);
                    Ok(())
                })?;
                let mut writer = BatchWriter::new(output, ColumnPlan::from_headers(&headers), rows.len());
                for row in rows {
                    writer.push(row)?;
                }
                self.finish(state, writer, records, end, None)?
            }
        };

        outcome.record_tag = Some(record_tag);
        outcome.mapping_warnings = warnings;
        Ok(outcome)
    }

    /// Read every record once, handing each flattened row to `on_row`.
    fn stream_pass<R, F>(
        &self,
        state: &mut ConversionState,
        input: R,
        selector: &RecordSelector,
        total: Option<u64>,
        report: bool,
        mut on_row: F,
    ) -> ConvertResult<(u64, PassEnd)>
    where
        R: Read,
        F: FnMut(FlatRow) -> Result<(), SinkError>,
    {
        let options = &self.options;
        let interval = options.batch_size.max(1) as u64;
        let mut records =
            RecordReader::new(BufReader::new(input), selector.clone()).with_max_depth(options.max_depth);
        let mut count = 0u64;

        let end = loop {
            if self.stop.should_stop() {
                log::info!("Stop requested after {} records", count);
                break PassEnd::Stopped;
            }
            match records.next() {
                None => break PassEnd::Completed,
                Some(Err(e)) => break PassEnd::Failed(e),
                Some(Ok(element)) => {
                    on_row(flatten_record(&element, options.empty_leaves))?;
                    count += 1;
                    if report && count % interval == 0 {
                        state.report(count, total, options.estimated_records, &*self.progress);
                    }
                }
            }
        };

        if report {
            state.report(count, total, options.estimated_records, &*self.progress);
        }
        Ok((count, end))
    }

    /// Tag of the first structured element. Scans the preview sample first
    /// and the whole document when no record completes inside it.
    fn infer_record_tag<R: Replay>(&self, input: &mut R) -> ConvertResult<ParseResult<Option<String>>> {
        let options = &self.options;
        let sample = preview_reader(
            &mut *input,
            Some(options.preview_bytes),
            options.empty_leaves,
            options.max_depth,
        );
        match sample {
            Ok(preview) if preview.record_tag.is_none() && preview.truncated => {
                log::info!(
                    "No record completed in the first {} bytes, scanning the whole document",
                    options.preview_bytes
                );
                input.replay().map_err(ConvertError::Rewind)?;
                let full = preview_reader(&mut *input, None, options.empty_leaves, options.max_depth);
                Ok(full.map(|preview| preview.record_tag))
            }
            other => Ok(other.map(|preview| preview.record_tag)),
        }
    }

    /// Flush the writer and settle the terminal state.
    fn finish<W: Write>(
        &self,
        state: &mut ConversionState,
        writer: BatchWriter<W>,
        records: u64,
        end: PassEnd,
        total: Option<u64>,
    ) -> ConvertResult<ConversionOutcome<W>> {
        let summary = writer.finish()?;
        let (status, error) = match end {
            PassEnd::Completed => {
                state.complete(total, &*self.progress)?;
                (RunState::Completed, None)
            }
            PassEnd::Stopped => {
                state.transition(RunState::Stopped, &*self.progress)?;
                (RunState::Stopped, None)
            }
            PassEnd::Failed(e) => {
                state.transition(RunState::Failed, &*self.progress)?;
                (RunState::Failed, Some(ConvertError::from(e)))
            }
        };

        Ok(ConversionOutcome {
            status,
            record_tag: None,
            records,
            rows_written: summary.rows_written,
            columns: summary.columns,
            header_written: summary.header_written,
            dropped_columns: summary.dropped_columns,
            mapping_warnings: Vec::new(),
            error,
            output: summary.output,
        })
    }
}

// =============================================================================
// Convenience entry points
// =============================================================================

/// Open `source` and convert it on a blocking thread.
pub async fn convert_source<W>(
    converter: &Converter,
    source: XmlSource,
    output: W,
) -> ConvertResult<ConversionOutcome<W>>
where
    W: Write + Send + 'static,
{
    let mut state = ConversionState::new();
    state.transition(RunState::Fetching, &*converter.progress)?;
    log::info!("Converting {}", source);

    let input = match source.open().await {
        Ok(input) => input,
        Err(e) => {
            log::error!("Cannot open input: {}", e);
            state.fail(&*converter.progress);
            return Err(e.into());
        }
    };

    let converter = converter.clone();
    tokio::task::spawn_blocking(move || converter.resume(state, input, output))
        .await
        .map_err(|e| ConvertError::Task(e.to_string()))?
}

/// Convert a source that was already opened, and possibly partly read, by
/// [`open_preview`]. The source is rewound before the run starts.
pub async fn convert_opened<W>(
    converter: &Converter,
    mut input: OpenedSource,
    output: W,
) -> ConvertResult<ConversionOutcome<W>>
where
    W: Write + Send + 'static,
{
    let mut state = ConversionState::new();
    state.transition(RunState::Fetching, &*converter.progress)?;
    log::info!("Converting previewed source");

    let converter = converter.clone();
    tokio::task::spawn_blocking(move || {
        if let Err(e) = input.replay() {
            log::error!("Cannot rewind previewed source: {}", e);
            state.fail(&*converter.progress);
            return Err(ConvertError::Rewind(e));
        }
        converter.resume(state, input, output)
    })
    .await
    .map_err(|e| ConvertError::Task(e.to_string()))?
}

/// Convert an in-memory document into CSV bytes.
pub fn convert_bytes(xml: &[u8], options: ConvertOptions) -> ConvertResult<ConversionOutcome<Vec<u8>>> {
    Converter::new(options)
        .with_progress(Arc::new(NoProgress))
        .run(Cursor::new(xml), Vec::new())
}

/// Preview `source`, sampling `options.preview_bytes` unless `full` is set.
pub async fn preview_source(source: XmlSource, options: &ConvertOptions, full: bool) -> ConvertResult<Preview> {
    let (preview, _) = open_preview(source, options, full).await?;
    Ok(preview)
}

/// Preview `source` and hand back the opened input for a later
/// [`convert_opened`].
///
/// URLs are always streamed, so a sampled preview only downloads about as
/// much of the body as it reads.
pub async fn open_preview(
    source: XmlSource,
    options: &ConvertOptions,
    full: bool,
) -> ConvertResult<(Preview, OpenedSource)> {
    let source = match source {
        XmlSource::Url { url, .. } => XmlSource::url(url, FetchMode::Streaming),
        other => other,
    };
    let mut input = source.open().await?;
    let limit = if full { None } else { Some(options.preview_bytes) };
    let policy = options.empty_leaves;
    let max_depth = options.max_depth;

    let (preview, input) = tokio::task::spawn_blocking(move || {
        let preview = preview_reader(&mut input, limit, policy, max_depth);
        (preview, input)
    })
    .await
    .map_err(|e| ConvertError::Task(e.to_string()))?;
    Ok((preview?, input))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Mapping;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicU64;
    use std::sync::Mutex;

    const ITEMS: &str = "<Root><Item><A>1</A></Item><Item><A>2</A><B>x</B></Item><Item><A>3</A></Item></Root>";

    fn options(tag: Option<&str>, policy: HeaderPolicy) -> ConvertOptions {
        ConvertOptions {
            record_tag: tag.map(String::from),
            header_policy: policy,
            ..Default::default()
        }
    }

    fn text(outcome: &ConversionOutcome<Vec<u8>>) -> &str {
        std::str::from_utf8(&outcome.output).unwrap()
    }

    #[derive(Default)]
    struct Recorder {
        states: Mutex<Vec<RunState>>,
        fractions: Mutex<Vec<f64>>,
    }

    impl ProgressSink for Recorder {
        fn on_state(&self, state: RunState) {
            self.states.lock().unwrap().push(state);
        }

        fn on_progress(&self, progress: Progress) {
            self.fractions.lock().unwrap().push(progress.fraction);
        }
    }

    #[test]
    fn test_two_pass_collects_all_columns() {
        let outcome = convert_bytes(ITEMS.as_bytes(), options(Some("Item"), HeaderPolicy::TwoPass)).unwrap();
        assert_eq!(outcome.status, RunState::Completed);
        assert_eq!(outcome.columns, vec!["Item_A", "Item_B"]);
        assert_eq!(text(&outcome), "Item_A,Item_B\n1,\n2,x\n3,\n");
        assert_eq!(outcome.records, 3);
    }

    #[test]
    fn test_first_record_drops_late_columns() {
        let outcome = convert_bytes(ITEMS.as_bytes(), options(Some("Item"), HeaderPolicy::FirstRecord)).unwrap();
        assert_eq!(text(&outcome), "Item_A\n1\n2\n3\n");
        assert_eq!(outcome.dropped_columns, vec!["Item_B"]);
    }

    #[test]
    fn test_full_buffer_matches_two_pass() {
        let buffered = convert_bytes(ITEMS.as_bytes(), options(Some("Item"), HeaderPolicy::FullBuffer)).unwrap();
        let two_pass = convert_bytes(ITEMS.as_bytes(), options(Some("Item"), HeaderPolicy::TwoPass)).unwrap();
        assert_eq!(text(&buffered), text(&two_pass));
    }

    #[test]
    fn test_record_tag_is_inferred() {
        let outcome = convert_bytes(ITEMS.as_bytes(), options(None, HeaderPolicy::TwoPass)).unwrap();
        assert_eq!(outcome.record_tag.as_deref(), Some("Item"));
        assert_eq!(outcome.rows_written, 3);
    }

    #[test]
    fn test_no_structured_element_completes_empty() {
        let outcome = convert_bytes(b"<Note>text</Note>", options(None, HeaderPolicy::TwoPass)).unwrap();
        assert_eq!(outcome.status, RunState::Completed);
        assert!(outcome.output.is_empty());
        assert!(outcome.record_tag.is_none());
    }

    #[test]
    fn test_mapping_projects_and_renames() {
        let mut opts = options(Some("Item"), HeaderPolicy::TwoPass);
        opts.mapping = Some(
            vec![("Item_B", "beta"), ("Item_A", "alpha"), ("Item_Z", "zeta")]
                .into_iter()
                .collect::<Mapping>(),
        );
        let outcome = convert_bytes(ITEMS.as_bytes(), opts).unwrap();

        assert_eq!(text(&outcome), "beta,alpha,zeta\n,1,\nx,2,\n,3,\n");
        assert_eq!(
            outcome.mapping_warnings,
            vec![MappingError::MissingSource {
                source_column: "Item_Z".into()
            }]
        );
    }

    #[test]
    fn test_stop_after_n_records() {
        let calls = Arc::new(AtomicU64::new(0));
        let counter = calls.clone();
        let stop = move || counter.fetch_add(1, Ordering::SeqCst) >= 2;

        let converter = Converter::new(options(Some("Item"), HeaderPolicy::FirstRecord))
            .with_stop_signal(Arc::new(stop))
            .with_progress(Arc::new(NoProgress));
        let outcome = converter.run(Cursor::new(ITEMS), Vec::new()).unwrap();

        assert_eq!(outcome.status, RunState::Stopped);
        assert_eq!(outcome.rows_written, 2);
        assert_eq!(text(&outcome), "Item_A\n1\n2\n");
    }

    #[test]
    fn test_stop_flag_before_start() {
        let flag = Arc::new(AtomicBool::new(true));
        let converter = Converter::new(options(Some("Item"), HeaderPolicy::TwoPass))
            .with_stop_signal(flag)
            .with_progress(Arc::new(NoProgress));
        let outcome = converter.run(Cursor::new(ITEMS), Vec::new()).unwrap();

        assert_eq!(outcome.status, RunState::Stopped);
        assert!(outcome.output.is_empty());
    }

    #[test]
    fn test_parse_error_keeps_written_rows() {
        let xml = "<Root><Item><A>1</A></Item><Item><A>2</A></Item><Item><A>3</B></Item></Root>";
        let outcome = convert_bytes(xml.as_bytes(), options(Some("Item"), HeaderPolicy::FirstRecord)).unwrap();

        assert_eq!(outcome.status, RunState::Failed);
        assert_eq!(text(&outcome), "Item_A\n1\n2\n");
        assert!(matches!(outcome.error, Some(ConvertError::Parse(_))));
        assert!(outcome.into_result().is_err());
    }

    #[test]
    fn test_two_pass_parse_error_writes_nothing() {
        let xml = "<Root><Item><A>1</A></Item></Oops>";
        let outcome = convert_bytes(xml.as_bytes(), options(Some("Item"), HeaderPolicy::TwoPass)).unwrap();
        assert_eq!(outcome.status, RunState::Failed);
        assert!(!outcome.header_written);
        assert!(outcome.output.is_empty());
    }

    #[test]
    fn test_state_sequence_and_progress() {
        let recorder = Arc::new(Recorder::default());
        let mut opts = options(None, HeaderPolicy::TwoPass);
        opts.batch_size = 1;
        let converter = Converter::new(opts).with_progress(recorder.clone());
        converter.run(Cursor::new(ITEMS), Vec::new()).unwrap();

        assert_eq!(
            *recorder.states.lock().unwrap(),
            vec![
                RunState::Fetching,
                RunState::Previewing,
                RunState::Streaming,
                RunState::Completed
            ]
        );
        let fractions = recorder.fractions.lock().unwrap();
        assert!(fractions.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(fractions.last().copied(), Some(1.0));
        assert!((fractions[0] - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_estimated_progress_is_capped() {
        let mut state = ConversionState::new();
        state.report(50, None, 10, &NoProgress);
        assert_eq!(state.fraction(), 1.0);
        state.report(5, None, 10, &NoProgress);
        assert_eq!(state.fraction(), 1.0);
    }

    #[test]
    fn test_illegal_transition() {
        let mut state = ConversionState::new();
        let err = state.transition(RunState::Streaming, &NoProgress).unwrap_err();
        assert!(matches!(
            err,
            ConvertError::InvalidTransition {
                from: RunState::Idle,
                to: RunState::Streaming
            }
        ));
    }

    #[test]
    fn test_invalid_options_fail_run() {
        let mut opts = options(Some("Item"), HeaderPolicy::TwoPass);
        opts.batch_size = 0;
        let err = convert_bytes(ITEMS.as_bytes(), opts).unwrap_err();
        assert!(matches!(err, ConvertError::Config(_)));
    }

    #[tokio::test]
    async fn test_convert_source_from_upload() {
        let converter = Converter::new(options(Some("Item"), HeaderPolicy::TwoPass)).with_progress(Arc::new(NoProgress));
        let outcome = convert_source(&converter, XmlSource::bytes(ITEMS), Vec::new()).await.unwrap();
        assert_eq!(text(&outcome), "Item_A,Item_B\n1,\n2,x\n3,\n");
    }

    #[tokio::test]
    async fn test_preview_source_from_upload() {
        let preview = preview_source(XmlSource::bytes(ITEMS), &ConvertOptions::default(), false)
            .await
            .unwrap();
        assert_eq!(preview.record_tag.as_deref(), Some("Item"));
        assert_eq!(preview.columns, vec!["Item_A"]);
    }
}
