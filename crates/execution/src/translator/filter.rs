use std::sync::Arc;

use arrow::array::{Array, BooleanArray};
use arrow::compute::filter_record_batch;
use arrow::record_batch::RecordBatch;
use arrow_schema::{DataType, SchemaRef};
use quiver_common::{CodegenOptions, QuiverError, Result};
use quiver_planner::{Expr, fmt_expr};
use tracing::trace;

use super::Translator;
use crate::bit_utils::{BitVector, DEFAULT_ALIGNMENT, bitwise_and_with};
use crate::context::BatchProcessorContext;
use crate::expressions::{PhysicalExpr, compile_expr};

/// Keeps rows whose predicate is true; false and null rows are dropped.
///
/// The selection is `values AND validity` over the predicate result, built
/// in bit-vectors from the context allocator.
#[derive(Debug)]
pub struct FilterTranslator {
    predicate: Arc<dyn PhysicalExpr>,
    schema: SchemaRef,
    codegen: CodegenOptions,
}

impl FilterTranslator {
    /// Compile `predicate` against `input_schema`; it must be boolean.
    pub fn try_new(
        predicate: &Expr,
        input_schema: SchemaRef,
        codegen: &CodegenOptions,
    ) -> Result<Self> {
        let compiled = compile_expr(predicate, &input_schema)?;
        if compiled.data_type() != DataType::Boolean {
            return Err(QuiverError::Construction(format!(
                "filter predicate {} has type {:?}, expected Boolean",
                fmt_expr(predicate),
                compiled.data_type()
            )));
        }
        Ok(Self {
            predicate: compiled,
            schema: input_schema,
            codegen: codegen.clone(),
        })
    }

    fn selection(&self, mask: &BooleanArray, ctx: &BatchProcessorContext) -> Result<BitVector> {
        let rows = mask.len();
        let values =
            BitVector::<DEFAULT_ALIGNMENT>::from_boolean_buffer(ctx.allocator.clone(), mask.values())?;
        let validity =
            BitVector::<DEFAULT_ALIGNMENT>::from_nulls(ctx.allocator.clone(), mask.nulls(), rows)?;
        let mut selected = BitVector::<DEFAULT_ALIGNMENT>::new(ctx.allocator.clone(), rows, 0)?;
        bitwise_and_with(
            &self.codegen,
            selected.as_mut_slice(),
            values.as_slice(),
            validity.as_slice(),
            rows,
        );
        Ok(selected)
    }
}

impl Translator for FilterTranslator {
    fn name(&self) -> &str {
        "Filter"
    }

    fn output_schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    fn consume(
        &mut self,
        batch: RecordBatch,
        ctx: &BatchProcessorContext,
    ) -> Result<Option<RecordBatch>> {
        let rows = batch.num_rows();
        if rows == 0 {
            return Ok(Some(batch));
        }

        let mask = self.predicate.evaluate(&batch)?;
        let mask = mask
            .as_any()
            .downcast_ref::<BooleanArray>()
            .ok_or_else(|| QuiverError::Execution("filter predicate must be boolean".to_string()))?;

        let selection = self.selection(mask, ctx)?;
        let selected = selection.count_set(rows);
        trace!(
            pipeline = %ctx.pipeline_name,
            rows,
            selected,
            "filter selection"
        );

        if selected == rows {
            return Ok(Some(batch));
        }
        if selected == 0 {
            return Ok(Some(batch.slice(0, 0)));
        }
        let filter = selection.to_boolean_array(rows)?;
        filter_record_batch(&batch, &filter)
            .map(Some)
            .map_err(|e| QuiverError::Execution(format!("filter kernel failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow::array::{Array, Int64Array};
    use arrow::record_batch::RecordBatch;
    use arrow_schema::{DataType, Field, Schema};
    use quiver_common::{BudgetAllocator, CodegenOptions, QuiverError, SystemAllocator};
    use quiver_planner::{BinaryOp, Expr, binary, col, lit_i64};

    use super::FilterTranslator;
    use crate::context::BatchProcessorContext;
    use crate::translator::Translator;

    fn input() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![Field::new("x", DataType::Int64, true)]));
        RecordBatch::try_new(
            schema,
            vec![Arc::new(Int64Array::from(vec![
                Some(1),
                None,
                Some(5),
                Some(9),
                None,
                Some(2),
            ]))],
        )
        .expect("batch")
    }

    fn run(pred_value: i64, codegen: &CodegenOptions) -> RecordBatch {
        let batch = input();
        let mut filter = FilterTranslator::try_new(
            &binary(col("x"), BinaryOp::Gt, lit_i64(pred_value)),
            batch.schema(),
            codegen,
        )
        .expect("filter");
        let ctx = BatchProcessorContext::new("filter_test", SystemAllocator::shared());
        filter.consume(batch, &ctx).expect("consume").expect("forwarded")
    }

    #[test]
    fn null_predicate_rows_are_dropped() {
        let out = run(1, &CodegenOptions::default());
        let x = out.column(0).as_any().downcast_ref::<Int64Array>().expect("i64");
        assert_eq!(x.values().to_vec(), vec![5, 9, 2]);
        assert_eq!(x.null_count(), 0);
    }

    #[test]
    fn byte_and_word_kernels_select_the_same_rows() {
        let scalar = CodegenOptions {
            enable_vectorize: false,
            ..CodegenOptions::default()
        };
        assert_eq!(run(4, &scalar), run(4, &CodegenOptions::default()));
    }

    #[test]
    fn all_and_none_selected() {
        assert_eq!(run(100, &CodegenOptions::default()).num_rows(), 0);
        let batch = input();
        let ctx = BatchProcessorContext::new("filter_test", SystemAllocator::shared());
        let mut keep_all = FilterTranslator::try_new(
            &Expr::Or(
                Box::new(Expr::IsNull(Box::new(col("x")))),
                Box::new(Expr::IsNotNull(Box::new(col("x")))),
            ),
            batch.schema(),
            &CodegenOptions::default(),
        )
        .expect("filter");
        let out = keep_all
            .consume(batch.clone(), &ctx)
            .expect("consume")
            .expect("forwarded");
        assert_eq!(out, batch);
    }

    #[test]
    fn non_boolean_predicate_is_rejected() {
        let schema = input().schema();
        let err = FilterTranslator::try_new(&col("x"), schema, &CodegenOptions::default())
            .expect_err("int predicate");
        assert!(matches!(err, QuiverError::Construction(_)));
    }

    #[test]
    fn selection_buffers_come_from_the_context_allocator() {
        let budget = BudgetAllocator::new(SystemAllocator::shared(), 16);
        let ctx = BatchProcessorContext::new("filter_test", budget.clone());
        let batch = input();
        let mut filter = FilterTranslator::try_new(
            &binary(col("x"), BinaryOp::Gt, lit_i64(1)),
            batch.schema(),
            &CodegenOptions::default(),
        )
        .expect("filter");
        let err = filter.consume(batch, &ctx).expect_err("three 16-byte vectors");
        assert!(matches!(err, QuiverError::Resource(_)));
        assert_eq!(budget.in_use_bytes(), 0);
    }
}
