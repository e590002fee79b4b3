//! Input record streams.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};

use crate::error::{PipelineError, Result};
use crate::record::Record;

/// Input name meaning standard input.
pub const STDIN: &str = "-";

/// Reads newline-delimited JSON records, skipping blank lines.
///
/// Values of `time_fields` that parse as RFC 3339 become timestamps.
pub struct JsonLinesReader<R> {
    reader: R,
    path: PathBuf,
    time_fields: Vec<String>,
    line_no: usize,
    buf: String,
    done: bool,
}

impl<R: BufRead> JsonLinesReader<R> {
    /// `path` is only used in error messages.
    pub fn new(reader: R, path: impl Into<PathBuf>, time_fields: Vec<String>) -> Self {
        Self {
            reader,
            path: path.into(),
            time_fields,
            line_no: 0,
            buf: String::new(),
            done: false,
        }
    }

    fn read_record(&mut self) -> Result<Option<Record>> {
        loop {
            self.buf.clear();
            let n = self
                .reader
                .read_line(&mut self.buf)
                .map_err(|e| PipelineError::io(&self.path, e))?;
            if n == 0 {
                return Ok(None);
            }
            self.line_no += 1;

            let line = self.buf.trim();
            if line.is_empty() {
                continue;
            }
            let mut record = Record::from_json(line).map_err(|e| PipelineError::Decode {
                line: self.line_no,
                message: e.to_string(),
            })?;
            record.promote_timestamps(&self.time_fields);
            return Ok(Some(record));
        }
    }
}

impl<R: BufRead> Iterator for JsonLinesReader<R> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                // Nothing sensible follows a read or decode failure
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Open an input by name; `-` is standard input.
pub fn open_input(
    name: &str,
    time_fields: Vec<String>,
) -> Result<JsonLinesReader<Box<dyn BufRead>>> {
    if name == STDIN {
        let reader: Box<dyn BufRead> = Box::new(BufReader::new(io::stdin()));
        return Ok(JsonLinesReader::new(reader, "<stdin>", time_fields));
    }
    let path = Path::new(name);
    let file = File::open(path).map_err(|e| PipelineError::io(path, e))?;
    let reader: Box<dyn BufRead> = Box::new(BufReader::new(file));
    Ok(JsonLinesReader::new(reader, path, time_fields))
}
