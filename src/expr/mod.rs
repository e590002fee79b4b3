//! The expression language used by change and filter stages.
//!
//! Expressions are small, side-effect free and sandboxed: they can read the
//! current record, the definitions block and a fixed set of builtins, and
//! nothing else.
//!
//! ```
//! use filtersplit_rs::expr::{Definitions, Environment, Expression};
//! use filtersplit_rs::record::{Record, Value};
//!
//! let defs = Definitions::parse("limit = 1.9").unwrap();
//! let record = Record::from_pairs([("speed", 1.2)]);
//! let filter = Expression::parse("speed < limit").unwrap();
//!
//! let env = Environment::for_record(&defs, &record);
//! assert_eq!(filter.eval(&env).unwrap(), Value::Bool(true));
//! ```

mod ast;
mod env;
mod eval;
mod parser;

use std::fmt;

pub use ast::{BinaryOp, CompareOp, Expr, LogicOp, Statement, UnaryOp};
pub use env::{Definitions, Environment, Function, MAX_CALL_DEPTH, MAX_CALLS};
pub use eval::{BUILTINS, EvalError, eval};
pub use parser::{ParseError, parse_definitions, parse_expression};

use crate::record::Value;

/// A parsed expression that remembers its source text for error reports.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    ast: Expr,
}

impl Expression {
    pub fn parse(source: &str) -> Result<Self, ParseError> {
        Ok(Self {
            source: source.to_string(),
            ast: parse_expression(source)?,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn ast(&self) -> &Expr {
        &self.ast
    }

    pub fn eval(&self, env: &Environment<'_>) -> Result<Value, EvalError> {
        eval(&self.ast, env)
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Record;

    #[test]
    fn test_expression_keeps_source() {
        let expr = Expression::parse("  lat // 10 ").unwrap();
        assert_eq!(expr.source(), "  lat // 10 ");
        assert_eq!(expr.to_string(), "  lat // 10 ");
        assert!(matches!(expr.ast(), Expr::Binary { op: BinaryOp::FloorDiv, .. }));
    }

    #[test]
    fn test_expression_parse_error() {
        let err = Expression::parse("speed <").unwrap_err();
        assert!(err.position > 0);
    }

    #[test]
    fn test_expression_eval() {
        let defs = Definitions::new();
        let record = Record::from_pairs([("lat", 54.3)]);
        let expr = Expression::parse("lat // 10 * 10").unwrap();
        let env = Environment::for_record(&defs, &record);
        assert_eq!(expr.eval(&env).unwrap(), Value::Float(50.0));
    }
}
