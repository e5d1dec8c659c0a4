//! Row expressions compiled against a translator's input schema.
//!
//! Compilation resolves columns and checks operand types once, so
//! evaluation only dispatches to Arrow kernels. Every evaluation returns an
//! `ArrayRef` with one value per input row.

use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, BooleanArray, Datum, Float64Array, Int64Array, StringArray, new_null_array,
};
use arrow::compute::kernels::{
    boolean::{and_kleene, not, or_kleene},
    cast::{can_cast_types, cast},
    cmp::{eq, gt, gt_eq, lt, lt_eq, neq},
    numeric::{add, div, mul, sub},
};
use arrow::compute::{is_not_null, is_null};
use arrow::record_batch::RecordBatch;
use arrow_schema::{DataType, SchemaRef};
use quiver_common::{QuiverError, Result};
use quiver_planner::{BinaryOp, Expr, LiteralValue};

/// Compiled, schema-bound expression.
pub trait PhysicalExpr: Send + Sync + std::fmt::Debug {
    /// Output type for every row.
    fn data_type(&self) -> DataType;
    /// Evaluate against `batch`; the result has `batch.num_rows()` entries.
    fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef>;
}

/// Compile `expr` against `input_schema`.
///
/// Unknown columns, out-of-range indexes, mismatched operand types and
/// impossible casts are `Construction` errors.
pub fn compile_expr(expr: &Expr, input_schema: &SchemaRef) -> Result<Arc<dyn PhysicalExpr>> {
    match expr {
        Expr::ColumnRef { name, index } => {
            if *index >= input_schema.fields().len() {
                return Err(QuiverError::Construction(format!(
                    "column '{name}' index {index} out of range for {} input columns",
                    input_schema.fields().len()
                )));
            }
            Ok(Arc::new(ColumnExpr {
                index: *index,
                dt: input_schema.field(*index).data_type().clone(),
            }))
        }
        Expr::Column(name) => {
            let (index, field) = input_schema.column_with_name(name).ok_or_else(|| {
                QuiverError::Construction(format!("unknown column '{name}' in expression"))
            })?;
            Ok(Arc::new(ColumnExpr {
                index,
                dt: field.data_type().clone(),
            }))
        }
        Expr::Literal(v) => Ok(Arc::new(LiteralExpr { v: v.clone() })),
        Expr::Cast { expr, to_type } => {
            let inner = compile_expr(expr, input_schema)?;
            if !can_cast_types(&inner.data_type(), to_type) {
                return Err(QuiverError::Construction(format!(
                    "cannot cast {:?} to {to_type:?}",
                    inner.data_type()
                )));
            }
            Ok(Arc::new(CastExpr {
                inner,
                to_type: to_type.clone(),
            }))
        }
        Expr::Not(e) => Ok(Arc::new(NotExpr {
            inner: compile_boolean(e, input_schema, "NOT")?,
        })),
        Expr::And(a, b) => Ok(Arc::new(BoolBinaryExpr {
            left: compile_boolean(a, input_schema, "AND")?,
            right: compile_boolean(b, input_schema, "AND")?,
            op: BoolOp::And,
        })),
        Expr::Or(a, b) => Ok(Arc::new(BoolBinaryExpr {
            left: compile_boolean(a, input_schema, "OR")?,
            right: compile_boolean(b, input_schema, "OR")?,
            op: BoolOp::Or,
        })),
        Expr::IsNull(e) => Ok(Arc::new(NullCheckExpr {
            inner: compile_expr(e, input_schema)?,
            negated: false,
        })),
        Expr::IsNotNull(e) => Ok(Arc::new(NullCheckExpr {
            inner: compile_expr(e, input_schema)?,
            negated: true,
        })),
        Expr::BinaryOp { left, op, right } => {
            let left = compile_expr(left, input_schema)?;
            let right = compile_expr(right, input_schema)?;
            let out = binary_out_type(*op, &left.data_type(), &right.data_type())?;
            Ok(Arc::new(BinaryExpr {
                left,
                right,
                op: *op,
                out,
            }))
        }
    }
}

fn compile_boolean(
    expr: &Expr,
    input_schema: &SchemaRef,
    ctx: &str,
) -> Result<Arc<dyn PhysicalExpr>> {
    let compiled = compile_expr(expr, input_schema)?;
    match compiled.data_type() {
        DataType::Boolean | DataType::Null => Ok(compiled),
        other => Err(QuiverError::Construction(format!(
            "{ctx} expects boolean operands, got {other:?}"
        ))),
    }
}

#[derive(Debug)]
struct ColumnExpr {
    index: usize,
    dt: DataType,
}

impl PhysicalExpr for ColumnExpr {
    fn data_type(&self) -> DataType {
        self.dt.clone()
    }

    fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef> {
        if self.index >= batch.num_columns() {
            return Err(QuiverError::Data(format!(
                "batch has {} columns, expression reads column {}",
                batch.num_columns(),
                self.index
            )));
        }
        Ok(Arc::clone(batch.column(self.index)))
    }
}

#[derive(Debug)]
struct LiteralExpr {
    v: LiteralValue,
}

impl PhysicalExpr for LiteralExpr {
    fn data_type(&self) -> DataType {
        literal_type(&self.v)
    }

    fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef> {
        Ok(literal_to_array(&self.v, batch.num_rows()))
    }
}

#[derive(Debug)]
struct CastExpr {
    inner: Arc<dyn PhysicalExpr>,
    to_type: DataType,
}

impl PhysicalExpr for CastExpr {
    fn data_type(&self) -> DataType {
        self.to_type.clone()
    }

    fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef> {
        let arr = self.inner.evaluate(batch)?;
        cast(&arr, &self.to_type).map_err(|e| QuiverError::Execution(format!("cast failed: {e}")))
    }
}

#[derive(Debug)]
struct NotExpr {
    inner: Arc<dyn PhysicalExpr>,
}

impl PhysicalExpr for NotExpr {
    fn data_type(&self) -> DataType {
        DataType::Boolean
    }

    fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef> {
        let arr = as_boolean(self.inner.evaluate(batch)?, "NOT")?;
        let out = not(&arr).map_err(|e| QuiverError::Execution(format!("not failed: {e}")))?;
        Ok(Arc::new(out))
    }
}

#[derive(Debug, Clone, Copy)]
enum BoolOp {
    And,
    Or,
}

#[derive(Debug)]
struct BoolBinaryExpr {
    left: Arc<dyn PhysicalExpr>,
    right: Arc<dyn PhysicalExpr>,
    op: BoolOp,
}

impl PhysicalExpr for BoolBinaryExpr {
    fn data_type(&self) -> DataType {
        DataType::Boolean
    }

    fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef> {
        let l = as_boolean(self.left.evaluate(batch)?, "AND/OR")?;
        let r = as_boolean(self.right.evaluate(batch)?, "AND/OR")?;
        let out = match self.op {
            BoolOp::And => and_kleene(&l, &r),
            BoolOp::Or => or_kleene(&l, &r),
        }
        .map_err(|e| QuiverError::Execution(format!("boolean kernel failed: {e}")))?;
        Ok(Arc::new(out))
    }
}

#[derive(Debug)]
struct NullCheckExpr {
    inner: Arc<dyn PhysicalExpr>,
    negated: bool,
}

impl PhysicalExpr for NullCheckExpr {
    fn data_type(&self) -> DataType {
        DataType::Boolean
    }

    fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef> {
        let arr = self.inner.evaluate(batch)?;
        let out = if self.negated {
            is_not_null(arr.as_ref())
        } else {
            is_null(arr.as_ref())
        }
        .map_err(|e| QuiverError::Execution(format!("null check failed: {e}")))?;
        Ok(Arc::new(out))
    }
}

#[derive(Debug)]
struct BinaryExpr {
    left: Arc<dyn PhysicalExpr>,
    right: Arc<dyn PhysicalExpr>,
    op: BinaryOp,
    out: DataType,
}

impl PhysicalExpr for BinaryExpr {
    fn data_type(&self) -> DataType {
        self.out.clone()
    }

    fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef> {
        let l = self.left.evaluate(batch)?;
        let r = self.right.evaluate(batch)?;
        if self.op.is_comparison() {
            eval_cmp(self.op, &l, &r)
        } else {
            eval_arith(self.op, &l, &r)
        }
    }
}

fn as_boolean(arr: ArrayRef, ctx: &str) -> Result<BooleanArray> {
    if arr.data_type() == &DataType::Null {
        return Ok(BooleanArray::new_null(arr.len()));
    }
    arr.as_any()
        .downcast_ref::<BooleanArray>()
        .cloned()
        .ok_or_else(|| QuiverError::Execution(format!("{ctx} expects boolean input")))
}

fn literal_type(v: &LiteralValue) -> DataType {
    match v {
        LiteralValue::Int64(_) => DataType::Int64,
        LiteralValue::Float64(_) => DataType::Float64,
        LiteralValue::Utf8(_) => DataType::Utf8,
        LiteralValue::Boolean(_) => DataType::Boolean,
        LiteralValue::Null => DataType::Null,
    }
}

fn literal_to_array(v: &LiteralValue, len: usize) -> ArrayRef {
    match v {
        LiteralValue::Int64(x) => Arc::new(Int64Array::from(vec![*x; len])),
        LiteralValue::Float64(x) => Arc::new(Float64Array::from(vec![*x; len])),
        LiteralValue::Boolean(x) => Arc::new(BooleanArray::from(vec![*x; len])),
        LiteralValue::Utf8(s) => Arc::new(StringArray::from(vec![s.as_str(); len])),
        LiteralValue::Null => new_null_array(&DataType::Null, len),
    }
}

fn binary_out_type(op: BinaryOp, l: &DataType, r: &DataType) -> Result<DataType> {
    if l != r {
        return Err(QuiverError::Construction(format!(
            "operands of {op:?} must share a type; got {l:?} and {r:?} (insert a cast)"
        )));
    }
    if op.is_comparison() {
        return match l {
            DataType::Int64 | DataType::Float64 | DataType::Utf8 => Ok(DataType::Boolean),
            DataType::Boolean if matches!(op, BinaryOp::Eq | BinaryOp::NotEq) => {
                Ok(DataType::Boolean)
            }
            other => Err(QuiverError::Unsupported(format!(
                "{op:?} not supported for {other:?}"
            ))),
        };
    }
    match l {
        DataType::Int64 | DataType::Float64 => Ok(l.clone()),
        other => Err(QuiverError::Unsupported(format!(
            "arithmetic not supported for {other:?}"
        ))),
    }
}

fn eval_arith(op: BinaryOp, l: &ArrayRef, r: &ArrayRef) -> Result<ArrayRef> {
    let (l, r): (&dyn Datum, &dyn Datum) = (l, r);
    match op {
        BinaryOp::Plus => add(l, r),
        BinaryOp::Minus => sub(l, r),
        BinaryOp::Multiply => mul(l, r),
        BinaryOp::Divide => div(l, r),
        other => {
            return Err(QuiverError::Execution(format!(
                "{other:?} is not an arithmetic operator"
            )));
        }
    }
    .map_err(|e| QuiverError::Execution(format!("arith kernel failed: {e}")))
}

fn eval_cmp(op: BinaryOp, l: &ArrayRef, r: &ArrayRef) -> Result<ArrayRef> {
    let (l, r): (&dyn Datum, &dyn Datum) = (l, r);
    let out = match op {
        BinaryOp::Eq => eq(l, r),
        BinaryOp::NotEq => neq(l, r),
        BinaryOp::Lt => lt(l, r),
        BinaryOp::LtEq => lt_eq(l, r),
        BinaryOp::Gt => gt(l, r),
        BinaryOp::GtEq => gt_eq(l, r),
        other => {
            return Err(QuiverError::Execution(format!(
                "{other:?} is not a comparison operator"
            )));
        }
    }
    .map_err(|e| QuiverError::Execution(format!("cmp kernel failed: {e}")))?;
    Ok(Arc::new(out))
}
