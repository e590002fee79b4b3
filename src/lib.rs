//! # filtersplit-rs
//!
//! Filter, transform and split streams of vessel-tracking records.
//!
//! Records are read one at a time, changed by field expressions, filtered by
//! a boolean expression and appended to an output chosen by the values of one
//! or more split fields. The split key space can be collapsed into a fixed
//! number of hash buckets.
//!
//! ## Overview
//!
//! A run is a one-way flow:
//! - **Change**: `--change COL=EXPR` assigns fields, in order
//! - **Filter**: `--filter EXPR` keeps records for which `EXPR` is truthy
//! - **Key**: `--split a,b` builds `a=<value>,b=<value>`
//! - **Bucket**: `--buckets N` turns the key into `bucket=<id>`
//! - **Route**: the key is substituted into the output template
//!
//! ## Example
//!
//! ```
//! use filtersplit_rs::{FilterSplit, FilterSplitConfig, MemorySinks, OutputTemplate, Record, Value};
//!
//! let mut config = FilterSplitConfig::new("-");
//! config.output = OutputTemplate::new("%(split)s.msg");
//! config.filter = Some("speed < 1.9".to_string());
//!
//! let input = vec![
//!     Ok(Record::from_pairs([("mmsi", Value::from("123")), ("speed", Value::from(1.0))])),
//!     Ok(Record::from_pairs([("mmsi", Value::from("456")), ("speed", Value::from(2.0))])),
//! ];
//!
//! let sinks = MemorySinks::new();
//! let stats = FilterSplit::new(&config, sinks.clone())?.run(input)?;
//!
//! assert_eq!(stats.routed, 1);
//! assert_eq!(sinks.paths(), vec!["mmsi=123.msg"]);
//! # Ok::<(), filtersplit_rs::PipelineError>(())
//! ```

pub mod bucket;
pub mod config;
pub mod error;
pub mod executor;
pub mod expr;
pub mod key;
pub mod logging;
pub mod record;
pub mod record_stage;
pub mod sink;
pub mod source;

pub use bucket::{BucketAssigner, BucketMap, bucket_index};
pub use config::{FilterSplitConfig, parse_change, parse_split};
pub use error::PipelineError;
pub use executor::{FilterSplit, RunState, RunStats, run};
pub use expr::{Definitions, Environment, Expression};
pub use key::{KeyEncoding, MissingFieldError, extract_key};
pub use record::{Record, Value};
pub use record_stage::{ChangeStage, FilterStage, RecordStage, build_stages};
pub use sink::{JsonLinesOpener, MemorySinks, OutputTemplate, RecordSink, SinkOpener, SinkRouter};
pub use source::{JsonLinesReader, open_input};
