//! Evaluation environments and the base definition block.
//!
//! An [`Environment`] is built fresh for every evaluation. Names resolve in
//! this order: function parameters, `row`, record fields, definitions.

use std::cell::Cell;
use std::rc::Rc;

use tracing::debug;

use super::ast::{Expr, Statement};
use super::eval::{EvalError, eval};
use super::parser::parse_definitions;
use crate::error::PipelineError;
use crate::record::{Record, Value};

/// Maximum nesting of helper-function calls.
pub const MAX_CALL_DEPTH: usize = 64;

/// Maximum number of helper-function calls in one evaluation.
pub const MAX_CALLS: usize = 10_000;

/// A helper function from the definition block.
#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub name: String,
    pub params: Vec<String>,
    pub body: Expr,
}

/// Constants and helper functions visible to every change and filter
/// expression of a run.
#[derive(Debug, Clone, Default)]
pub struct Definitions {
    constants: Vec<(String, Value)>,
    functions: Vec<Function>,
}

impl Definitions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and evaluate a definition block.
    ///
    /// Constants are evaluated once, in order, and may use anything defined
    /// above them. A later definition of the same name replaces the earlier.
    pub fn parse(source: &str) -> Result<Self, PipelineError> {
        let statements = parse_definitions(source).map_err(|source_err| PipelineError::Parse {
            what: "definitions",
            text: source.to_string(),
            source: source_err,
        })?;

        let mut defs = Self::new();
        for statement in statements {
            match statement {
                Statement::Const { name, expr } => {
                    let value = eval(&expr, &Environment::new(&defs)).map_err(|source| {
                        PipelineError::Definition {
                            name: name.clone(),
                            source,
                        }
                    })?;
                    defs.define(name, value);
                }
                Statement::Function { name, params, body } => {
                    defs.define_function(Function { name, params, body });
                }
            }
        }
        debug!(
            constants = defs.constants.len(),
            functions = defs.functions.len(),
            "loaded definitions"
        );
        Ok(defs)
    }

    pub fn define(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        self.functions.retain(|f| f.name != name);
        match self.constants.iter_mut().find(|(k, _)| *k == name) {
            Some((_, slot)) => *slot = value,
            None => self.constants.push((name, value)),
        }
    }

    pub fn define_function(&mut self, function: Function) {
        self.constants.retain(|(k, _)| *k != function.name);
        self.functions.retain(|f| f.name != function.name);
        self.functions.push(function);
    }

    pub fn constant(&self, name: &str) -> Option<&Value> {
        self.constants.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub fn is_empty(&self) -> bool {
        self.constants.is_empty() && self.functions.is_empty()
    }
}

/// The name scope one expression is evaluated in.
#[derive(Debug, Clone)]
pub struct Environment<'a> {
    defs: &'a Definitions,
    record: Option<&'a Record>,
    locals: &'a [(String, Value)],
    depth: usize,
    /// Calls made so far, shared with every frame of this evaluation
    calls: Rc<Cell<usize>>,
}

impl<'a> Environment<'a> {
    /// Definitions only, no record in scope.
    pub fn new(defs: &'a Definitions) -> Self {
        Self {
            defs,
            record: None,
            locals: &[],
            depth: 0,
            calls: Rc::new(Cell::new(0)),
        }
    }

    /// Definitions plus the fields of `record`, with `row` bound to it.
    pub fn for_record(defs: &'a Definitions, record: &'a Record) -> Self {
        Self {
            record: Some(record),
            ..Self::new(defs)
        }
    }

    pub fn definitions(&self) -> &'a Definitions {
        self.defs
    }

    /// Scope for a helper-function body: its parameters and the definitions.
    pub(crate) fn call_frame<'b>(&self, locals: &'b [(String, Value)]) -> Result<Environment<'b>, EvalError>
    where
        'a: 'b,
    {
        if self.depth >= MAX_CALL_DEPTH {
            return Err(EvalError::new(format!(
                "maximum call depth ({}) exceeded",
                MAX_CALL_DEPTH
            )));
        }
        let calls = self.calls.get() + 1;
        if calls > MAX_CALLS {
            return Err(EvalError::new(format!("call limit ({}) exceeded", MAX_CALLS)));
        }
        self.calls.set(calls);
        Ok(Environment {
            defs: self.defs,
            record: None,
            locals,
            depth: self.depth + 1,
            calls: Rc::clone(&self.calls),
        })
    }

    /// Resolve a name to a value.
    pub fn lookup(&self, name: &str) -> Option<Value> {
        if let Some((_, v)) = self.locals.iter().find(|(k, _)| k == name) {
            return Some(v.clone());
        }
        if let Some(record) = self.record {
            if name == "row" {
                return Some(Value::Map(record.clone()));
            }
            if let Some(v) = record.get(name) {
                return Some(v.clone());
            }
        }
        self.defs.constant(name).cloned()
    }

    /// The record `row` refers to, if any.
    pub fn row(&self) -> Option<&'a Record> {
        self.record
    }

    pub(crate) fn is_local(&self, name: &str) -> bool {
        self.locals.iter().any(|(k, _)| k == name)
    }
}
