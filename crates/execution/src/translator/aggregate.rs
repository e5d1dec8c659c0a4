//! Hash aggregate accumulating across batches.
//!
//! Group keys are encoded into byte strings and map to one [`GroupEntry`]
//! holding the decoded key and one state per aggregate. `consume` absorbs
//! every batch; `produce` sorts the groups and materializes them once, with
//! output validity written through [`BitVector`].

use std::cmp::Ordering;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, BooleanArray, Float64Array, Int64Array, StringArray};
use arrow::buffer::{BooleanBuffer, Buffer, OffsetBuffer, ScalarBuffer};
use arrow::record_batch::{RecordBatch, RecordBatchOptions};
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use quiver_common::{QuiverError, Result, SharedAllocator};
use quiver_planner::{AggExpr, Expr, fmt_expr};
use tracing::debug;

use super::Translator;
use crate::bit_utils::{BitVector, DEFAULT_ALIGNMENT};
use crate::context::BatchProcessorContext;
use crate::expressions::{PhysicalExpr, compile_expr};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ScalarValue {
    Int64(i64),
    Float64Bits(u64),
    Utf8(String),
    Boolean(bool),
    Null,
}

impl ScalarValue {
    fn as_f64(&self) -> Option<f64> {
        match self {
            ScalarValue::Int64(v) => Some(*v as f64),
            ScalarValue::Float64Bits(v) => Some(f64::from_bits(*v)),
            _ => None,
        }
    }

    fn type_rank(&self) -> u8 {
        match self {
            ScalarValue::Null => 0,
            ScalarValue::Boolean(_) => 1,
            ScalarValue::Int64(_) => 2,
            ScalarValue::Float64Bits(_) => 3,
            ScalarValue::Utf8(_) => 4,
        }
    }
}

/// Total order used for MIN/MAX and for output group order; nulls first.
fn cmp_scalars(a: &ScalarValue, b: &ScalarValue) -> Ordering {
    match (a, b) {
        (ScalarValue::Int64(x), ScalarValue::Int64(y)) => x.cmp(y),
        (ScalarValue::Float64Bits(x), ScalarValue::Float64Bits(y)) => {
            f64::from_bits(*x).total_cmp(&f64::from_bits(*y))
        }
        (ScalarValue::Utf8(x), ScalarValue::Utf8(y)) => x.cmp(y),
        (ScalarValue::Boolean(x), ScalarValue::Boolean(y)) => x.cmp(y),
        _ => a.type_rank().cmp(&b.type_rank()),
    }
}

fn cmp_keys(a: &[ScalarValue], b: &[ScalarValue]) -> Ordering {
    a.iter()
        .zip(b)
        .map(|(x, y)| cmp_scalars(x, y))
        .find(|o| o.is_ne())
        .unwrap_or(Ordering::Equal)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AggFunc {
    Count,
    Sum,
    Min,
    Max,
    Avg,
}

#[derive(Debug, Clone)]
enum AggState {
    Count(i64),
    SumInt(Option<i64>),
    SumFloat(Option<f64>),
    Min(Option<ScalarValue>),
    Max(Option<ScalarValue>),
    Avg { sum: f64, count: i64 },
}

#[derive(Debug)]
struct AggSpec {
    func: AggFunc,
    input: Arc<dyn PhysicalExpr>,
    out_type: DataType,
}

#[derive(Debug, Clone)]
struct GroupEntry {
    key: Vec<ScalarValue>,
    states: Vec<AggState>,
}

type GroupMap = HashMap<Vec<u8>, GroupEntry>;

/// Grouped or scalar aggregate (COUNT, SUM, MIN, MAX, AVG).
///
/// Without group expressions the output always has exactly one row.
#[derive(Debug)]
pub struct AggregateTranslator {
    group_exprs: Vec<Arc<dyn PhysicalExpr>>,
    specs: Vec<AggSpec>,
    schema: SchemaRef,
    groups: GroupMap,
}

impl AggregateTranslator {
    /// Compile grouping and aggregate expressions against `input_schema`.
    pub fn try_new(
        group_exprs: &[Expr],
        aggr_exprs: &[(AggExpr, String)],
        input_schema: SchemaRef,
    ) -> Result<Self> {
        if group_exprs.is_empty() && aggr_exprs.is_empty() {
            return Err(QuiverError::Construction(
                "aggregate needs group or aggregate expressions".to_string(),
            ));
        }

        let mut fields = Vec::with_capacity(group_exprs.len() + aggr_exprs.len());
        let mut compiled_groups = Vec::with_capacity(group_exprs.len());
        for expr in group_exprs {
            let compiled = compile_expr(expr, &input_schema)?;
            let dt = compiled.data_type();
            if !is_key_type(&dt) {
                return Err(QuiverError::Unsupported(format!(
                    "group key {} has unsupported type {dt:?}",
                    fmt_expr(expr)
                )));
            }
            fields.push(Field::new(group_name(expr), dt, true));
            compiled_groups.push(compiled);
        }

        let mut specs = Vec::with_capacity(aggr_exprs.len());
        for (agg, name) in aggr_exprs {
            let input = compile_expr(agg.input(), &input_schema)?;
            let in_type = input.data_type();
            let (func, out_type) = match agg {
                AggExpr::Count(_) => (AggFunc::Count, DataType::Int64),
                AggExpr::Sum(_) => (AggFunc::Sum, numeric_type(agg, &in_type)?),
                AggExpr::Avg(_) => {
                    numeric_type(agg, &in_type)?;
                    (AggFunc::Avg, DataType::Float64)
                }
                AggExpr::Min(_) | AggExpr::Max(_) => {
                    if !is_key_type(&in_type) {
                        return Err(QuiverError::Unsupported(format!(
                            "{}() does not support {in_type:?}",
                            agg.func_name()
                        )));
                    }
                    let func = if matches!(agg, AggExpr::Min(_)) {
                        AggFunc::Min
                    } else {
                        AggFunc::Max
                    };
                    (func, in_type)
                }
            };
            fields.push(Field::new(name, out_type.clone(), true));
            specs.push(AggSpec {
                func,
                input,
                out_type,
            });
        }

        Ok(Self {
            group_exprs: compiled_groups,
            specs,
            schema: Arc::new(Schema::new(fields)),
            groups: HashMap::new(),
        })
    }

    /// Groups accumulated so far.
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }
}

impl Translator for AggregateTranslator {
    fn name(&self) -> &str {
        "Aggregate"
    }

    fn output_schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    fn is_stateful(&self) -> bool {
        true
    }

    fn consume(
        &mut self,
        batch: RecordBatch,
        ctx: &BatchProcessorContext,
    ) -> Result<Option<RecordBatch>> {
        let rows = batch.num_rows();
        let group_arrays = self
            .group_exprs
            .iter()
            .map(|e| e.evaluate(&batch))
            .collect::<Result<Vec<_>>>()?;
        let agg_arrays = self
            .specs
            .iter()
            .map(|s| s.input.evaluate(&batch))
            .collect::<Result<Vec<_>>>()?;

        // Decode the whole batch before touching the group map.
        let mut staged = Vec::with_capacity(rows);
        for row in 0..rows {
            let key = group_arrays
                .iter()
                .map(|a| scalar_from_array(a, row))
                .collect::<Result<Vec<_>>>()?;
            let values = agg_arrays
                .iter()
                .map(|a| scalar_from_array(a, row))
                .collect::<Result<Vec<_>>>()?;
            staged.push((key, values));
        }

        // Touched groups are updated on copies and committed only once the
        // whole batch merged cleanly.
        let mut pending = GroupMap::new();
        for (key, values) in staged {
            let encoded = encode_group_key(&key);
            let entry = match pending.entry(encoded) {
                Entry::Occupied(e) => e.into_mut(),
                Entry::Vacant(e) => {
                    let current = self.groups.get(e.key()).cloned().unwrap_or_else(|| GroupEntry {
                        key,
                        states: init_states(&self.specs),
                    });
                    e.insert(current)
                }
            };
            for (state, value) in entry.states.iter_mut().zip(values) {
                update_state(state, value)?;
            }
        }

        if self.groups.is_empty() {
            self.groups.reserve(ctx.config.batch_size_rows.min(rows));
        }
        self.groups.extend(pending);
        Ok(None)
    }

    fn produce(&mut self, ctx: &BatchProcessorContext) -> Result<Option<RecordBatch>> {
        // Groups stay in place until the output batch is built.
        let empty_scalar;
        let mut entries = self.groups.values().collect::<Vec<_>>();
        if self.group_exprs.is_empty() && entries.is_empty() {
            empty_scalar = GroupEntry {
                key: vec![],
                states: init_states(&self.specs),
            };
            entries.push(&empty_scalar);
        }
        entries.sort_by(|a, b| cmp_keys(&a.key, &b.key));

        let mut columns = Vec::with_capacity(self.schema.fields().len());
        for (gidx, field) in self.schema.fields().iter().enumerate().take(self.group_exprs.len()) {
            let values = entries.iter().map(|e| e.key[gidx].clone()).collect::<Vec<_>>();
            columns.push(scalars_to_array(&values, field.data_type(), &ctx.allocator)?);
        }
        for (aidx, spec) in self.specs.iter().enumerate() {
            let values = entries
                .iter()
                .map(|e| finalize_state(&e.states[aidx]))
                .collect::<Vec<_>>();
            columns.push(scalars_to_array(&values, &spec.out_type, &ctx.allocator)?);
        }

        debug!(
            pipeline = %ctx.pipeline_name,
            groups = entries.len(),
            "aggregate finalized"
        );
        let options = RecordBatchOptions::new().with_row_count(Some(entries.len()));
        let out = RecordBatch::try_new_with_options(self.schema.clone(), columns, &options)
            .map_err(|e| QuiverError::Execution(format!("aggregate output batch failed: {e}")))?;
        self.groups.clear();
        Ok(Some(out))
    }
}

fn is_key_type(dt: &DataType) -> bool {
    matches!(
        dt,
        DataType::Int64 | DataType::Float64 | DataType::Utf8 | DataType::Boolean
    )
}

fn numeric_type(agg: &AggExpr, dt: &DataType) -> Result<DataType> {
    match dt {
        DataType::Int64 | DataType::Float64 => Ok(dt.clone()),
        other => Err(QuiverError::Unsupported(format!(
            "{}() expects Int64 or Float64 input, got {other:?}",
            agg.func_name()
        ))),
    }
}

fn group_name(expr: &Expr) -> String {
    match expr {
        Expr::Column(name) | Expr::ColumnRef { name, .. } => name.clone(),
        other => fmt_expr(other),
    }
}

fn init_states(specs: &[AggSpec]) -> Vec<AggState> {
    specs
        .iter()
        .map(|s| match s.func {
            AggFunc::Count => AggState::Count(0),
            AggFunc::Sum if s.out_type == DataType::Int64 => AggState::SumInt(None),
            AggFunc::Sum => AggState::SumFloat(None),
            AggFunc::Min => AggState::Min(None),
            AggFunc::Max => AggState::Max(None),
            AggFunc::Avg => AggState::Avg { sum: 0.0, count: 0 },
        })
        .collect()
}

fn update_state(state: &mut AggState, value: ScalarValue) -> Result<()> {
    if value == ScalarValue::Null {
        return Ok(());
    }
    match state {
        AggState::Count(acc) => *acc += 1,
        AggState::SumInt(acc) => {
            if let ScalarValue::Int64(v) = value {
                let next = acc
                    .unwrap_or(0)
                    .checked_add(v)
                    .ok_or_else(|| QuiverError::Execution("sum() overflowed Int64".to_string()))?;
                *acc = Some(next);
            }
        }
        AggState::SumFloat(acc) => {
            if let Some(v) = value.as_f64() {
                *acc = Some(acc.unwrap_or(0.0) + v);
            }
        }
        AggState::Min(cur) => {
            if cur
                .as_ref()
                .map_or(true, |c| cmp_scalars(&value, c) == Ordering::Less)
            {
                *cur = Some(value);
            }
        }
        AggState::Max(cur) => {
            if cur
                .as_ref()
                .map_or(true, |c| cmp_scalars(&value, c) == Ordering::Greater)
            {
                *cur = Some(value);
            }
        }
        AggState::Avg { sum, count } => {
            if let Some(v) = value.as_f64() {
                *sum += v;
                *count += 1;
            }
        }
    }
    Ok(())
}

fn finalize_state(state: &AggState) -> ScalarValue {
    match state {
        AggState::Count(v) => ScalarValue::Int64(*v),
        AggState::SumInt(v) => v.map_or(ScalarValue::Null, ScalarValue::Int64),
        AggState::SumFloat(v) => v.map_or(ScalarValue::Null, |x| ScalarValue::Float64Bits(x.to_bits())),
        AggState::Min(v) | AggState::Max(v) => v.clone().unwrap_or(ScalarValue::Null),
        AggState::Avg { count: 0, .. } => ScalarValue::Null,
        AggState::Avg { sum, count } => ScalarValue::Float64Bits((sum / *count as f64).to_bits()),
    }
}

fn encode_group_key(values: &[ScalarValue]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * 10);
    for value in values {
        match value {
            ScalarValue::Null => out.push(0),
            ScalarValue::Int64(v) => {
                out.push(1);
                out.extend_from_slice(&v.to_le_bytes());
            }
            ScalarValue::Float64Bits(v) => {
                out.push(2);
                out.extend_from_slice(&v.to_le_bytes());
            }
            ScalarValue::Boolean(v) => {
                out.push(3);
                out.push(u8::from(*v));
            }
            ScalarValue::Utf8(s) => {
                out.push(4);
                out.extend_from_slice(&(s.len() as u64).to_le_bytes());
                out.extend_from_slice(s.as_bytes());
            }
        }
    }
    out
}

fn scalar_from_array(array: &ArrayRef, row: usize) -> Result<ScalarValue> {
    if array.is_null(row) {
        return Ok(ScalarValue::Null);
    }
    let mismatch = |expected: &str| {
        QuiverError::Execution(format!(
            "expected {expected} array, got {:?}",
            array.data_type()
        ))
    };
    match array.data_type() {
        DataType::Int64 => array
            .as_any()
            .downcast_ref::<Int64Array>()
            .map(|a| ScalarValue::Int64(a.value(row)))
            .ok_or_else(|| mismatch("Int64")),
        DataType::Float64 => array
            .as_any()
            .downcast_ref::<Float64Array>()
            .map(|a| ScalarValue::Float64Bits(a.value(row).to_bits()))
            .ok_or_else(|| mismatch("Float64")),
        DataType::Utf8 => array
            .as_any()
            .downcast_ref::<StringArray>()
            .map(|a| ScalarValue::Utf8(a.value(row).to_string()))
            .ok_or_else(|| mismatch("Utf8")),
        DataType::Boolean => array
            .as_any()
            .downcast_ref::<BooleanArray>()
            .map(|a| ScalarValue::Boolean(a.value(row)))
            .ok_or_else(|| mismatch("Boolean")),
        other => Err(QuiverError::Unsupported(format!(
            "aggregate input type {other:?}"
        ))),
    }
}

/// Materialize `values` as an array of `dt`; validity goes through a bit-vector.
fn scalars_to_array(
    values: &[ScalarValue],
    dt: &DataType,
    allocator: &SharedAllocator,
) -> Result<ArrayRef> {
    let len = values.len();
    let mut validity = BitVector::<DEFAULT_ALIGNMENT>::new(allocator.clone(), len, 0)?;
    for (i, v) in values.iter().enumerate() {
        validity.set_unified(i, *v != ScalarValue::Null);
    }
    let nulls = validity.to_null_buffer(len)?;
    let mismatch = |v: &ScalarValue| {
        QuiverError::Execution(format!("cannot store {v:?} in a {dt:?} column"))
    };

    match dt {
        DataType::Int64 => {
            let vals = values
                .iter()
                .map(|v| match v {
                    ScalarValue::Int64(x) => Ok(*x),
                    ScalarValue::Null => Ok(0),
                    other => Err(mismatch(other)),
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(Arc::new(Int64Array::new(ScalarBuffer::from(vals), nulls)))
        }
        DataType::Float64 => {
            let vals = values
                .iter()
                .map(|v| match v {
                    ScalarValue::Float64Bits(x) => Ok(f64::from_bits(*x)),
                    ScalarValue::Int64(x) => Ok(*x as f64),
                    ScalarValue::Null => Ok(0.0),
                    other => Err(mismatch(other)),
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(Arc::new(Float64Array::new(ScalarBuffer::from(vals), nulls)))
        }
        DataType::Boolean => {
            let vals = values
                .iter()
                .map(|v| match v {
                    ScalarValue::Boolean(x) => Ok(*x),
                    ScalarValue::Null => Ok(false),
                    other => Err(mismatch(other)),
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(Arc::new(BooleanArray::new(BooleanBuffer::from(vals), nulls)))
        }
        DataType::Utf8 => {
            let mut bytes = Vec::new();
            let mut lengths = Vec::with_capacity(len);
            for v in values {
                match v {
                    ScalarValue::Utf8(s) => {
                        bytes.extend_from_slice(s.as_bytes());
                        lengths.push(s.len());
                    }
                    ScalarValue::Null => lengths.push(0),
                    other => return Err(mismatch(other)),
                }
            }
            let array = StringArray::try_new(
                OffsetBuffer::from_lengths(lengths),
                Buffer::from_vec(bytes),
                nulls,
            )
            .map_err(|e| QuiverError::Execution(format!("string column build failed: {e}")))?;
            Ok(Arc::new(array))
        }
        other => Err(QuiverError::Unsupported(format!(
            "aggregate output type {other:?}"
        ))),
    }
}
