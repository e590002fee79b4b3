//! Output sinks and the sink router.
//!
//! The router owns the pool of open sinks for one run. A destination name is
//! substituted into the output template to get a path; the sink for that path
//! is opened in append mode the first time a record is routed to it and kept
//! open until the run ends (or until it is evicted when `max_open` is set).

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use tracing::{debug, warn};

use crate::error::{PipelineError, Result};
use crate::record::Record;

/// Placeholder replaced by the destination name.
pub const SPLIT_PLACEHOLDER: &str = "%(split)s";

/// Default output template: one `<key>.msg` file per destination.
pub const DEFAULT_TEMPLATE: &str = "%(split)s.msg";

/// Output path template, e.g. `out/%(split)s.msg`.
///
/// `%(split)s` is replaced by the destination name and `%%` by `%`. Any other
/// `%` is copied as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputTemplate {
    template: String,
}

impl OutputTemplate {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.template
    }

    /// Whether records can go to more than one path.
    pub fn has_placeholder(&self) -> bool {
        self.template.contains(SPLIT_PLACEHOLDER)
    }

    pub fn render(&self, destination: &str) -> String {
        let mut out = String::with_capacity(self.template.len() + destination.len());
        let mut rest = self.template.as_str();
        while let Some(idx) = rest.find('%') {
            out.push_str(&rest[..idx]);
            let tail = &rest[idx..];
            if let Some(after) = tail.strip_prefix(SPLIT_PLACEHOLDER) {
                out.push_str(destination);
                rest = after;
            } else if let Some(after) = tail.strip_prefix("%%") {
                out.push('%');
                rest = after;
            } else {
                out.push('%');
                rest = &tail[1..];
            }
        }
        out.push_str(rest);
        out
    }
}

impl Default for OutputTemplate {
    fn default() -> Self {
        Self::new(DEFAULT_TEMPLATE)
    }
}

/// An open output accepting records one at a time.
pub trait RecordSink {
    fn write(&mut self, record: &Record) -> Result<()>;

    /// Flush buffered output. The sink is not used after this.
    fn close(&mut self) -> Result<()>;
}

/// Opens sinks by path.
pub trait SinkOpener {
    /// Open `path` for appending.
    fn open(&mut self, path: &str) -> Result<Box<dyn RecordSink>>;
}

/// Newline-delimited JSON file opened in append mode.
pub struct JsonLinesSink {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JsonLinesSink {
    /// Open (creating it and its parent directories if needed) for appending.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|e| PipelineError::io(parent, e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| PipelineError::io(&path, e))?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }
}

impl RecordSink for JsonLinesSink {
    fn write(&mut self, record: &Record) -> Result<()> {
        writeln!(self.writer, "{}", record.to_json()).map_err(|e| PipelineError::io(&self.path, e))
    }

    fn close(&mut self) -> Result<()> {
        self.writer
            .flush()
            .map_err(|e| PipelineError::io(&self.path, e))
    }
}

/// Opens [`JsonLinesSink`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonLinesOpener;

impl SinkOpener for JsonLinesOpener {
    fn open(&mut self, path: &str) -> Result<Box<dyn RecordSink>> {
        Ok(Box::new(JsonLinesSink::open(path)?))
    }
}

/// In-memory sinks keyed by path, shared between the opener and the caller.
///
/// Appending to a path that was closed earlier continues the same list, as
/// an append-mode file would.
#[derive(Debug, Clone, Default)]
pub struct MemorySinks {
    inner: Rc<RefCell<MemoryState>>,
}

#[derive(Debug, Default)]
struct MemoryState {
    outputs: BTreeMap<String, Vec<Record>>,
    opens: usize,
    closes: usize,
}

impl MemorySinks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records written to `path`, in write order.
    pub fn records(&self, path: &str) -> Vec<Record> {
        self.inner
            .borrow()
            .outputs
            .get(path)
            .cloned()
            .unwrap_or_default()
    }

    /// Every path written so far.
    pub fn paths(&self) -> Vec<String> {
        self.inner.borrow().outputs.keys().cloned().collect()
    }

    pub fn open_count(&self) -> usize {
        self.inner.borrow().opens
    }

    pub fn close_count(&self) -> usize {
        self.inner.borrow().closes
    }
}

impl SinkOpener for MemorySinks {
    fn open(&mut self, path: &str) -> Result<Box<dyn RecordSink>> {
        let mut state = self.inner.borrow_mut();
        state.opens += 1;
        state.outputs.entry(path.to_string()).or_default();
        Ok(Box::new(MemorySink {
            path: path.to_string(),
            inner: Rc::clone(&self.inner),
        }))
    }
}

struct MemorySink {
    path: String,
    inner: Rc<RefCell<MemoryState>>,
}

impl RecordSink for MemorySink {
    fn write(&mut self, record: &Record) -> Result<()> {
        self.inner
            .borrow_mut()
            .outputs
            .entry(self.path.clone())
            .or_default()
            .push(record.clone());
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.inner.borrow_mut().closes += 1;
        Ok(())
    }
}

struct PooledSink {
    sink: Box<dyn RecordSink>,
    last_used: u64,
}

/// Owns the open sinks of one run and routes records to them.
pub struct SinkRouter<O: SinkOpener> {
    template: OutputTemplate,
    opener: O,
    pool: HashMap<String, PooledSink>,
    max_open: Option<NonZeroUsize>,
    tick: u64,
    destinations: BTreeSet<String>,
    evictions: usize,
}

impl<O: SinkOpener> SinkRouter<O> {
    pub fn new(template: OutputTemplate, opener: O) -> Self {
        Self {
            template,
            opener,
            pool: HashMap::new(),
            max_open: None,
            tick: 0,
            destinations: BTreeSet::new(),
            evictions: 0,
        }
    }

    /// Keep at most `max_open` sinks open, closing the least recently used.
    pub fn with_max_open(mut self, max_open: Option<NonZeroUsize>) -> Self {
        self.max_open = max_open;
        self
    }

    /// Append `record` to the sink for `destination`, opening it if needed.
    pub fn route(&mut self, destination: &str, record: &Record) -> Result<()> {
        self.tick += 1;
        let path = self.template.render(destination);

        if !self.destinations.contains(destination) {
            self.destinations.insert(destination.to_string());
        }

        if let Some(pooled) = self.pool.get_mut(&path) {
            pooled.last_used = self.tick;
            return pooled.sink.write(record);
        }

        self.make_room()?;
        let mut sink = self.opener.open(&path)?;
        debug!(destination, path = path.as_str(), "opened sink");
        let result = sink.write(record);
        self.pool.insert(
            path,
            PooledSink {
                sink,
                last_used: self.tick,
            },
        );
        result
    }

    fn make_room(&mut self) -> Result<()> {
        let Some(max_open) = self.max_open else {
            return Ok(());
        };
        while self.pool.len() >= max_open.get() {
            let oldest = self
                .pool
                .iter()
                .min_by_key(|(_, pooled)| pooled.last_used)
                .map(|(path, _)| path.clone());
            let Some(path) = oldest else {
                break;
            };
            if let Some(mut pooled) = self.pool.remove(&path) {
                debug!(path = path.as_str(), "evicting sink");
                self.evictions += 1;
                pooled.sink.close()?;
            }
        }
        Ok(())
    }

    /// Close every open sink. All sinks are closed even if some fail; the
    /// first failure is returned.
    pub fn close_all(&mut self) -> Result<()> {
        let mut first_err = None;
        for (path, mut pooled) in self.pool.drain() {
            match pooled.sink.close() {
                Ok(()) => debug!(path = path.as_str(), "closed sink"),
                Err(e) if first_err.is_none() => first_err = Some(e),
                Err(e) => warn!(path = path.as_str(), error = %e, "failed to close sink"),
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn open_count(&self) -> usize {
        self.pool.len()
    }

    /// Distinct destination names routed to so far.
    pub fn destinations(&self) -> &BTreeSet<String> {
        &self.destinations
    }

    pub fn evictions(&self) -> usize {
        self.evictions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Value;

    fn rec(name: &str) -> Record {
        Record::from_pairs([("name", name)])
    }

    fn names(records: &[Record]) -> Vec<String> {
        records
            .iter()
            .map(|r| r.get("name").map(Value::to_string).unwrap_or_default())
            .collect()
    }

    #[test]
    fn test_template_render() {
        let template = OutputTemplate::new("out/%(split)s.msg");
        assert_eq!(template.render("mmsi=123"), "out/mmsi=123.msg");
        assert!(template.has_placeholder());
    }

    #[test]
    fn test_template_percent_escapes() {
        let template = OutputTemplate::new("100%%/%(split)s-%d.msg");
        assert_eq!(template.render("bucket=1"), "100%/bucket=1-%d.msg");
    }

    #[test]
    fn test_template_without_placeholder() {
        let template = OutputTemplate::new("all.msg");
        assert!(!template.has_placeholder());
        assert_eq!(template.render(""), "all.msg");
        assert_eq!(template.render("mmsi=1"), "all.msg");
    }

    #[test]
    fn test_default_template_with_empty_key() {
        assert_eq!(OutputTemplate::default().render(""), ".msg");
    }

    #[test]
    fn test_router_opens_each_destination_once() {
        let sinks = MemorySinks::new();
        let mut router = SinkRouter::new(OutputTemplate::default(), sinks.clone());
        router.route("mmsi=123", &rec("A")).unwrap();
        router.route("mmsi=456", &rec("C")).unwrap();
        router.route("mmsi=123", &rec("D")).unwrap();
        assert_eq!(router.open_count(), 2);
        router.close_all().unwrap();

        assert_eq!(sinks.open_count(), 2);
        assert_eq!(sinks.close_count(), 2);
        assert_eq!(names(&sinks.records("mmsi=123.msg")), vec!["A", "D"]);
        assert_eq!(names(&sinks.records("mmsi=456.msg")), vec!["C"]);
        assert_eq!(router.open_count(), 0);
        assert_eq!(router.destinations().len(), 2);
    }

    #[test]
    fn test_destinations_sharing_a_path_share_a_sink() {
        let sinks = MemorySinks::new();
        let mut router = SinkRouter::new(OutputTemplate::new("all.msg"), sinks.clone());
        router.route("mmsi=1", &rec("A")).unwrap();
        router.route("mmsi=2", &rec("B")).unwrap();
        router.close_all().unwrap();
        assert_eq!(sinks.open_count(), 1);
        assert_eq!(names(&sinks.records("all.msg")), vec!["A", "B"]);
    }

    #[test]
    fn test_lru_eviction_reopens_in_append_mode() {
        let sinks = MemorySinks::new();
        let mut router = SinkRouter::new(OutputTemplate::default(), sinks.clone())
            .with_max_open(NonZeroUsize::new(2));
        router.route("a", &rec("1")).unwrap();
        router.route("b", &rec("2")).unwrap();
        router.route("a", &rec("3")).unwrap();
        // b is least recently used
        router.route("c", &rec("4")).unwrap();
        assert_eq!(router.open_count(), 2);
        assert_eq!(router.evictions(), 1);
        router.route("b", &rec("5")).unwrap();
        router.close_all().unwrap();

        assert_eq!(sinks.open_count(), 4);
        assert_eq!(sinks.close_count(), 4);
        assert_eq!(names(&sinks.records("b.msg")), vec!["2", "5"]);
        assert_eq!(names(&sinks.records("a.msg")), vec!["1", "3"]);
    }

    #[test]
    fn test_json_lines_sink_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("out.msg");

        let mut sink = JsonLinesSink::open(&path).unwrap();
        sink.write(&rec("A")).unwrap();
        sink.close().unwrap();

        let mut sink = JsonLinesSink::open(&path).unwrap();
        sink.write(&rec("B")).unwrap();
        sink.close().unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content, "{\"name\":\"A\"}\n{\"name\":\"B\"}\n");
    }

    #[test]
    fn test_open_failure_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        // A directory cannot be opened as a file
        let err = JsonLinesSink::open(dir.path()).err().unwrap();
        assert!(matches!(err, PipelineError::Io { .. }));
    }
}
