use arrow_schema::DataType;
use serde::{Deserialize, Serialize};

/// Row-level expression carried by pipeline operators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    /// Column resolved by name against the operator's input schema.
    Column(String),
    /// Column resolved by position; `name` is informational.
    ColumnRef { name: String, index: usize },
    Literal(LiteralValue),
    BinaryOp {
        left: Box<Expr>,
        op: BinaryOp,
        right: Box<Expr>,
    },
    Cast {
        expr: Box<Expr>,
        to_type: DataType,
    },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    IsNull(Box<Expr>),
    IsNotNull(Box<Expr>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LiteralValue {
    Int64(i64),
    Float64(f64),
    Utf8(String),
    Boolean(bool),
    Null,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Plus,
    Minus,
    Multiply,
    Divide,
}

impl BinaryOp {
    /// Comparison operators produce booleans; arithmetic keeps the operand type.
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Eq
                | BinaryOp::NotEq
                | BinaryOp::Lt
                | BinaryOp::LtEq
                | BinaryOp::Gt
                | BinaryOp::GtEq
        )
    }
}

/// Aggregate function applied per group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AggExpr {
    Count(Expr),
    Sum(Expr),
    Min(Expr),
    Max(Expr),
    Avg(Expr),
}

impl AggExpr {
    /// Argument expression.
    pub fn input(&self) -> &Expr {
        match self {
            AggExpr::Count(e)
            | AggExpr::Sum(e)
            | AggExpr::Min(e)
            | AggExpr::Max(e)
            | AggExpr::Avg(e) => e,
        }
    }

    /// Lowercase function name.
    pub fn func_name(&self) -> &'static str {
        match self {
            AggExpr::Count(_) => "count",
            AggExpr::Sum(_) => "sum",
            AggExpr::Min(_) => "min",
            AggExpr::Max(_) => "max",
            AggExpr::Avg(_) => "avg",
        }
    }
}

/// Shorthand for `Expr::Column`.
pub fn col(name: &str) -> Expr {
    Expr::Column(name.to_string())
}

/// Shorthand for an `Int64` literal.
pub fn lit_i64(v: i64) -> Expr {
    Expr::Literal(LiteralValue::Int64(v))
}

/// Shorthand for a `Float64` literal.
pub fn lit_f64(v: f64) -> Expr {
    Expr::Literal(LiteralValue::Float64(v))
}

/// Shorthand for a `Utf8` literal.
pub fn lit_str(v: &str) -> Expr {
    Expr::Literal(LiteralValue::Utf8(v.to_string()))
}

/// Shorthand for a boolean literal.
pub fn lit_bool(v: bool) -> Expr {
    Expr::Literal(LiteralValue::Boolean(v))
}

/// Build `left <op> right`.
pub fn binary(left: Expr, op: BinaryOp, right: Expr) -> Expr {
    Expr::BinaryOp {
        left: Box::new(left),
        op,
        right: Box::new(right),
    }
}
