//! Record-at-a-time stages run before routing.
//!
//! Each `RecordStage` takes one record and returns it (possibly changed) or
//! drops it. The driver pushes every input record through all stages before
//! reading the next one.

use std::rc::Rc;

use tracing::trace;

use crate::error::{PipelineError, Result};
use crate::expr::{Definitions, Environment, EvalError, Expression};
use crate::record::{Record, Value};

/// Longest record rendering included in an expression error.
const RECORD_CONTEXT_LEN: usize = 200;

/// A pipeline stage that processes records one at a time.
pub trait RecordStage {
    /// Process record number `record_no` (1-based), returning `None` to drop it.
    fn process(&mut self, record_no: usize, record: Record) -> Result<Option<Record>>;

    /// The display name of this stage.
    fn name(&self) -> &str;
}

/// CHANGE - assigns fields from expressions, in order.
///
/// Each expression sees the record as changed by the ones before it, both
/// through bare field names and through `row`. A NaN or infinite result is
/// an error, since JSON output has no way to write it.
pub struct ChangeStage {
    defs: Rc<Definitions>,
    changes: Vec<(String, Expression)>,
}

impl ChangeStage {
    pub fn new(defs: Rc<Definitions>, changes: Vec<(String, Expression)>) -> Self {
        Self { defs, changes }
    }
}

impl RecordStage for ChangeStage {
    fn process(&mut self, record_no: usize, mut record: Record) -> Result<Option<Record>> {
        for (field, expr) in &self.changes {
            let env = Environment::for_record(&self.defs, &record);
            let value = expr
                .eval(&env)
                .and_then(|value| {
                    if has_non_finite(&value) {
                        Err(EvalError::new(format!(
                            "non-finite number assigned to '{}'",
                            field
                        )))
                    } else {
                        Ok(value)
                    }
                })
                .map_err(|source| expression_error("change", expr, record_no, &record, source))?;
            trace!(record_no, field = field.as_str(), %value, "changed field");
            record.set(field.clone(), value);
        }
        Ok(Some(record))
    }

    fn name(&self) -> &str {
        "CHANGE"
    }
}

/// FILTER - keeps records for which the expression is truthy.
pub struct FilterStage {
    defs: Rc<Definitions>,
    expr: Expression,
}

impl FilterStage {
    pub fn new(defs: Rc<Definitions>, expr: Expression) -> Self {
        Self { defs, expr }
    }
}

impl RecordStage for FilterStage {
    fn process(&mut self, record_no: usize, record: Record) -> Result<Option<Record>> {
        let env = Environment::for_record(&self.defs, &record);
        let keep = self
            .expr
            .eval(&env)
            .map_err(|source| expression_error("filter", &self.expr, record_no, &record, source))?
            .is_truthy();
        Ok(keep.then_some(record))
    }

    fn name(&self) -> &str {
        "FILTER"
    }
}

fn has_non_finite(value: &Value) -> bool {
    match value {
        Value::Float(f) => !f.is_finite(),
        Value::List(items) => items.iter().any(has_non_finite),
        Value::Map(record) => record.iter().any(|(_, v)| has_non_finite(v)),
        _ => false,
    }
}

fn expression_error(
    stage: &'static str,
    expr: &Expression,
    record_no: usize,
    record: &Record,
    source: EvalError,
) -> PipelineError {
    let mut context = record.to_json();
    if context.len() > RECORD_CONTEXT_LEN {
        let mut cut = RECORD_CONTEXT_LEN;
        while !context.is_char_boundary(cut) {
            cut -= 1;
        }
        context.truncate(cut);
        context.push_str("...");
    }
    PipelineError::Expression {
        stage,
        expr: expr.source().to_string(),
        record_no,
        record: context,
        source,
    }
}

/// Parse the change list and filter into stages: all changes first (as one
/// stage), then the filter.
///
/// Parse errors surface here, before any input is read.
pub fn build_stages(
    defs: Rc<Definitions>,
    changes: &[(String, String)],
    filter: Option<&str>,
) -> Result<Vec<Box<dyn RecordStage>>> {
    let mut stages: Vec<Box<dyn RecordStage>> = Vec::new();

    if !changes.is_empty() {
        let parsed = changes
            .iter()
            .map(|(field, text)| {
                Expression::parse(text)
                    .map(|expr| (field.clone(), expr))
                    .map_err(|source| PipelineError::Parse {
                        what: "change expression",
                        text: text.clone(),
                        source,
                    })
            })
            .collect::<Result<Vec<_>>>()?;
        stages.push(Box::new(ChangeStage::new(Rc::clone(&defs), parsed)));
    }

    if let Some(text) = filter {
        let expr = Expression::parse(text).map_err(|source| PipelineError::Parse {
            what: "filter expression",
            text: text.to_string(),
            source,
        })?;
        stages.push(Box::new(FilterStage::new(defs, expr)));
    }

    Ok(stages)
}
