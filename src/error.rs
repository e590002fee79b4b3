//! Error types for a filtersplit run.
//!
//! Only [`crate::key::MissingFieldError`] is recovered per record; every
//! variant here aborts the run once the open sinks have been released.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::expr::{EvalError, ParseError};

/// Errors that terminate a pipeline run.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A change or filter expression failed to evaluate.
    #[error("{stage} expression `{expr}` failed on record {record_no} ({record}): {source}")]
    Expression {
        stage: &'static str,
        expr: String,
        record_no: usize,
        record: String,
        #[source]
        source: EvalError,
    },

    /// An expression or definition block failed to parse.
    #[error("cannot parse {what} `{text}`: {source}")]
    Parse {
        what: &'static str,
        text: String,
        #[source]
        source: ParseError,
    },

    /// A base-environment definition failed to evaluate.
    #[error("definition `{name}` failed: {source}")]
    Definition {
        name: String,
        #[source]
        source: EvalError,
    },

    /// Input could not be read or a sink could not be opened/written.
    #[error("I/O error on '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// An input line is not a JSON object.
    #[error("invalid record at line {line}: {message}")]
    Decode { line: usize, message: String },

    /// Invalid run configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl PipelineError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
