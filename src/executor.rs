//! Record-at-a-time pipeline driver.
//!
//! Each input record is pushed through the change and filter stages, given
//! a routing key (optionally collapsed to a hash bucket) and appended to the
//! sink for that key before the next record is read. When the input is
//! exhausted the bucket list is written and every sink is closed. Any fatal
//! error also closes every sink before it is returned.

use std::rc::Rc;

use tracing::{debug, info, warn};

use crate::bucket::{BUCKET_LIST_DESTINATION, BucketAssigner};
use crate::config::FilterSplitConfig;
use crate::error::{PipelineError, Result};
use crate::key::{KeyEncoding, extract_key};
use crate::record::Record;
use crate::record_stage::{RecordStage, build_stages};
use crate::sink::{JsonLinesOpener, SinkOpener, SinkRouter};
use crate::source::open_input;

/// Lifecycle of a [`FilterSplit`] run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running,
    /// Input exhausted, bucket list written and sinks closed.
    Finalizing,
    /// Stopped by a fatal error after closing the sinks.
    Aborted,
}

/// Counters for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    /// Records read from the input.
    pub read: usize,
    /// Records dropped by the filter.
    pub filtered_out: usize,
    /// Records dropped for lacking a split field.
    pub missing_key: usize,
    /// Records written to a data destination.
    pub routed: usize,
    /// Distinct data destinations written (the bucket list not included).
    pub destinations: usize,
    /// Bucket-list entries written.
    pub buckets: usize,
}

/// One pipeline run over an input stream.
pub struct FilterSplit<O: SinkOpener> {
    state: RunState,
    stages: Vec<Box<dyn RecordStage>>,
    split: Vec<String>,
    time_resolution: String,
    key_encoding: KeyEncoding,
    buckets: Option<BucketAssigner>,
    router: SinkRouter<O>,
    stats: RunStats,
}

impl<O: SinkOpener> FilterSplit<O> {
    /// Validate `config`, load its definitions and parse its expressions.
    ///
    /// Nothing is opened yet; configuration errors surface before any input
    /// is read.
    pub fn new(config: &FilterSplitConfig, opener: O) -> Result<Self> {
        config.validate()?;
        let defs = Rc::new(config.load_definitions()?);
        let stages = build_stages(defs, &config.changes, config.filter.as_deref())?;
        let router =
            SinkRouter::new(config.output.clone(), opener).with_max_open(config.max_open_sinks);

        Ok(Self {
            state: RunState::Idle,
            stages,
            split: config.split.clone(),
            time_resolution: config.time_resolution.clone(),
            key_encoding: config.key_encoding,
            buckets: config.buckets.map(BucketAssigner::new),
            router,
            stats: RunStats::default(),
        })
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn stats(&self) -> RunStats {
        self.stats
    }

    /// Run the pipeline over `input` to completion.
    pub fn run<I>(&mut self, input: I) -> Result<RunStats>
    where
        I: IntoIterator<Item = Result<Record>>,
    {
        if self.state != RunState::Idle {
            return Err(PipelineError::config(format!(
                "pipeline cannot run from state {:?}",
                self.state
            )));
        }
        self.state = RunState::Running;
        info!(
            stages = self.stages.len(),
            split = %self.split.join(","),
            buckets = ?self.buckets.as_ref().map(|b| b.count().get()),
            "pipeline started"
        );

        for item in input {
            let result = item.and_then(|record| self.process(record));
            if let Err(e) = result {
                return Err(self.abort(e));
            }
        }

        if let Err(e) = self.finalize() {
            return Err(self.abort(e));
        }
        info!(
            read = self.stats.read,
            routed = self.stats.routed,
            filtered_out = self.stats.filtered_out,
            missing_key = self.stats.missing_key,
            destinations = self.stats.destinations,
            "pipeline finished"
        );
        Ok(self.stats)
    }

    /// Push one record through the stages and route it.
    fn process(&mut self, record: Record) -> Result<()> {
        self.stats.read += 1;
        let record_no = self.stats.read;

        let mut current = record;
        for stage in self.stages.iter_mut() {
            match stage.process(record_no, current)? {
                Some(next) => current = next,
                None => {
                    self.stats.filtered_out += 1;
                    return Ok(());
                }
            }
        }

        let key = match extract_key(
            &current,
            &self.split,
            &self.time_resolution,
            self.key_encoding,
        ) {
            Ok(key) => key,
            Err(missing) => {
                debug!(record_no, field = missing.field.as_str(), "dropping record");
                self.stats.missing_key += 1;
                return Ok(());
            }
        };

        let destination = match self.buckets.as_mut() {
            Some(assigner) => assigner.destination(&key),
            None => key,
        };
        self.router.route(&destination, &current)?;
        self.stats.routed += 1;
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        self.state = RunState::Finalizing;
        self.stats.destinations = self.router.destinations().len();

        if let Some(assigner) = &self.buckets {
            let entries = assigner.map().to_records();
            debug!(entries = entries.len(), "writing bucket list");
            for record in &entries {
                self.router.route(BUCKET_LIST_DESTINATION, record)?;
            }
            self.stats.buckets = entries.len();
        }
        self.router.close_all()
    }

    /// Release every sink and hand back the error that stopped the run.
    fn abort(&mut self, err: PipelineError) -> PipelineError {
        self.state = RunState::Aborted;
        if let Err(close_err) = self.router.close_all() {
            warn!(error = %close_err, "failed to close sinks after abort");
        }
        err
    }
}

/// Run `config` reading its input by name and writing JSON-lines files.
pub fn run(config: &FilterSplitConfig) -> Result<RunStats> {
    let mut pipeline = FilterSplit::new(config, JsonLinesOpener)?;
    let input = open_input(&config.input, config.time_fields.clone())?;
    pipeline.run(input)
}
