//! Run configuration.

use std::fs;
use std::num::{NonZeroU64, NonZeroUsize};
use std::path::Path;

use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::expr::Definitions;
use crate::key::KeyEncoding;
use crate::record::is_valid_time_format;
use crate::sink::{DEFAULT_TEMPLATE, OutputTemplate};

pub const DEFAULT_SPLIT: &str = "mmsi";
pub const DEFAULT_TIME_RESOLUTION: &str = "%Y-%m-%d";
pub const DEFAULT_TIME_FIELDS: &str = "timestamp";

/// Everything one filtersplit run needs.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterSplitConfig {
    /// Input name; `-` is standard input.
    pub input: String,
    pub output: OutputTemplate,
    /// `(field, expression)` pairs, applied in order.
    pub changes: Vec<(String, String)>,
    /// Empty means no splitting.
    pub split: Vec<String>,
    pub buckets: Option<NonZeroU64>,
    pub filter: Option<String>,
    /// Definitions block, or a path to a file holding one.
    pub filter_env: Option<String>,
    pub time_resolution: String,
    pub time_fields: Vec<String>,
    pub key_encoding: KeyEncoding,
    pub max_open_sinks: Option<NonZeroUsize>,
}

impl FilterSplitConfig {
    /// Defaults for everything but the input.
    pub fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            output: OutputTemplate::new(DEFAULT_TEMPLATE),
            changes: Vec::new(),
            split: parse_split(DEFAULT_SPLIT),
            buckets: None,
            filter: None,
            filter_env: None,
            time_resolution: DEFAULT_TIME_RESOLUTION.to_string(),
            time_fields: parse_split(DEFAULT_TIME_FIELDS),
            key_encoding: KeyEncoding::Raw,
            max_open_sinks: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.input.is_empty() {
            return Err(PipelineError::config("input name is empty"));
        }
        if self.output.as_str().is_empty() {
            return Err(PipelineError::config("output template is empty"));
        }
        for (field, _) in &self.changes {
            if field.is_empty() {
                return Err(PipelineError::config("change has an empty field name"));
            }
        }
        if self.split.iter().any(String::is_empty) {
            return Err(PipelineError::config(format!(
                "split list '{}' has an empty field name",
                self.split.join(",")
            )));
        }
        if !is_valid_time_format(&self.time_resolution) {
            return Err(PipelineError::config(format!(
                "invalid time resolution '{}'",
                self.time_resolution
            )));
        }
        if self.buckets.is_some() && self.split.is_empty() {
            debug!("bucketing without split fields puts every record in one bucket");
        }
        Ok(())
    }

    /// Parse and evaluate the definitions block, if any.
    pub fn load_definitions(&self) -> Result<Definitions> {
        match &self.filter_env {
            Some(source) => Definitions::parse(&read_source(source)?),
            None => Ok(Definitions::new()),
        }
    }
}

/// The text of a definitions block: the file at `source` if there is one,
/// else `source` itself.
pub fn read_source(source: &str) -> Result<String> {
    let path = Path::new(source);
    if path.is_file() {
        debug!(path = source, "reading definitions from file");
        fs::read_to_string(path).map_err(|e| PipelineError::io(path, e))
    } else {
        Ok(source.to_string())
    }
}

/// Parse `COL=EXPR`, splitting at the first `=`.
pub fn parse_change(s: &str) -> std::result::Result<(String, String), String> {
    let Some((field, expr)) = s.split_once('=') else {
        return Err(format!("expected COL=EXPR, got '{}'", s));
    };
    let field = field.trim();
    if field.is_empty() {
        return Err(format!("missing column name in '{}'", s));
    }
    if expr.trim().is_empty() {
        return Err(format!("missing expression in '{}'", s));
    }
    Ok((field.to_string(), expr.to_string()))
}

/// Parse a comma separated field list. The empty string is the empty list.
pub fn parse_split(s: &str) -> Vec<String> {
    if s.trim().is_empty() {
        return Vec::new();
    }
    s.split(',').map(|f| f.trim().to_string()).collect()
}
