//! AST for change and filter expressions

use std::fmt;

use crate::record::Value;

/// A parsed expression node.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// A constant: `'mmsi'`, `1.9`, `true`, `null`
    Literal(Value),
    /// A name: record field, `row`, definition or function parameter
    Name(String),
    /// List literal: `['123', '456']`
    List(Vec<Expr>),
    /// `-x`, `+x`
    Unary { op: UnaryOp, expr: Box<Expr> },
    /// Arithmetic: `a + b`, `lat // 10`
    Binary {
        left: Box<Expr>,
        op: BinaryOp,
        right: Box<Expr>,
    },
    /// Possibly chained comparison: `0.5 < speed < 10.0`
    Compare {
        first: Box<Expr>,
        rest: Vec<(CompareOp, Expr)>,
    },
    /// `a and b`, `a or b` (short-circuiting)
    Logical {
        left: Box<Expr>,
        op: LogicOp,
        right: Box<Expr>,
    },
    /// `not x`
    Not(Box<Expr>),
    /// `then_expr if condition else else_expr`
    Conditional {
        condition: Box<Expr>,
        then_expr: Box<Expr>,
        else_expr: Box<Expr>,
    },
    /// Builtin or helper call: `round(lat / 10)`
    Call { func: String, args: Vec<Expr> },
    /// Method call: `row.get('lat', 0)`
    Method {
        target: Box<Expr>,
        name: String,
        args: Vec<Expr>,
    },
    /// Attribute: `row.lat`, `timestamp.year`
    Attr { target: Box<Expr>, name: String },
    /// Subscript: `row['lat']`, `names[0]`
    Index { target: Box<Expr>, index: Box<Expr> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Pos,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::FloorDiv => "//",
            BinaryOp::Mod => "%",
            BinaryOp::Pow => "**",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::In => "in",
            CompareOp::NotIn => "not in",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicOp {
    And,
    Or,
}

/// A top-level statement of a definition block.
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    /// `name = expr`
    Const { name: String, expr: Expr },
    /// `name(a, b) = expr`
    Function {
        name: String,
        params: Vec<String>,
        body: Expr,
    },
}

impl Statement {
    pub fn name(&self) -> &str {
        match self {
            Statement::Const { name, .. } | Statement::Function { name, .. } => name,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operator_display() {
        assert_eq!(BinaryOp::FloorDiv.to_string(), "//");
        assert_eq!(CompareOp::NotIn.to_string(), "not in");
        assert_eq!(CompareOp::Le.to_string(), "<=");
    }

    #[test]
    fn test_statement_name() {
        let stmt = Statement::Function {
            name: "grid".to_string(),
            params: vec!["x".to_string()],
            body: Expr::Name("x".to_string()),
        };
        assert_eq!(stmt.name(), "grid");
    }
}
