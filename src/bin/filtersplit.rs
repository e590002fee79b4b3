//! CLI tool to filter, change and split a record stream.
//!
//! Usage:
//!   filtersplit <INFILE> [OUTFILE] [-c COL=EXPR]... [-s COLS] [-b N] [-f EXPR]
//!
//! `OUTFILE` is a path template in which `%(split)s` is replaced by the
//! routing key of each record.

use std::num::{NonZeroU64, NonZeroUsize};
use std::process;

use clap::Parser;
use filtersplit_rs::config::{
    DEFAULT_SPLIT, DEFAULT_TIME_FIELDS, DEFAULT_TIME_RESOLUTION, parse_change, parse_split,
};
use filtersplit_rs::sink::DEFAULT_TEMPLATE;
use filtersplit_rs::{FilterSplitConfig, KeyEncoding, OutputTemplate, logging, run};

/// Filter, change and split a stream of JSON-lines records.
///
/// Records missing a split field are dropped.
#[derive(Parser)]
#[command(name = "filtersplit", version)]
struct Cli {
    /// Input file of newline-delimited JSON records (`-` for stdin)
    infile: String,

    /// Output path template; `%(split)s` is replaced by the routing key
    #[arg(default_value = DEFAULT_TEMPLATE)]
    outfile: String,

    /// Set COL to the value of EXPR before filtering (repeatable, applied in order)
    #[arg(short, long = "change", value_name = "COL=EXPR", value_parser = parse_change)]
    change: Vec<(String, String)>,

    /// Comma separated fields to split on; empty disables splitting
    #[arg(short, long, default_value = DEFAULT_SPLIT, value_name = "COLS")]
    split: String,

    /// Hash routing keys into this many buckets
    #[arg(short, long, value_name = "N")]
    buckets: Option<NonZeroU64>,

    /// Keep only records for which EXPR is true
    #[arg(short, long, value_name = "EXPR")]
    filter: Option<String>,

    /// Definitions visible to all expressions: a file, or inline text
    #[arg(short = 'F', long, value_name = "SOURCE")]
    filter_env: Option<String>,

    /// strftime pattern for timestamp values in routing keys
    #[arg(short, long, default_value = DEFAULT_TIME_RESOLUTION, value_name = "FMT")]
    timeresolution: String,

    /// Comma separated fields read as RFC 3339 timestamps
    #[arg(long, default_value = DEFAULT_TIME_FIELDS, value_name = "COLS")]
    time_fields: String,

    /// Percent-encode `%`, `,`, `=` and `/` in routing key values
    #[arg(long)]
    escape_keys: bool,

    /// Close least recently used outputs beyond this many open files
    #[arg(long, value_name = "N")]
    max_open_sinks: Option<NonZeroUsize>,

    /// Log level when RUST_LOG is not set
    #[arg(long, default_value = "warn")]
    log_level: String,
}

impl Cli {
    fn into_config(self) -> FilterSplitConfig {
        FilterSplitConfig {
            input: self.infile,
            output: OutputTemplate::new(self.outfile),
            changes: self.change,
            split: parse_split(&self.split),
            buckets: self.buckets,
            filter: self.filter,
            filter_env: self.filter_env,
            time_resolution: self.timeresolution,
            time_fields: parse_split(&self.time_fields),
            key_encoding: if self.escape_keys {
                KeyEncoding::Escaped
            } else {
                KeyEncoding::Raw
            },
            max_open_sinks: self.max_open_sinks,
        }
    }
}

fn main() {
    let cli = Cli::parse();
    logging::init(&cli.log_level);

    let config = cli.into_config();
    match run(&config) {
        Ok(stats) => {
            eprintln!(
                "Processed {} -> {} records into {} destinations",
                stats.read, stats.routed, stats.destinations
            );
        }
        Err(e) => {
            eprintln!("error: {e}");
            process::exit(1);
        }
    }
}
