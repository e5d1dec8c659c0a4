use std::sync::Arc;

use arrow::record_batch::{RecordBatch, RecordBatchOptions};
use arrow_schema::{Field, Schema, SchemaRef};
use quiver_common::{QuiverError, Result};
use quiver_planner::Expr;

use super::Translator;
use crate::context::BatchProcessorContext;
use crate::expressions::{PhysicalExpr, compile_expr};

/// Evaluates one expression per output column.
#[derive(Debug)]
pub struct ProjectTranslator {
    exprs: Vec<Arc<dyn PhysicalExpr>>,
    schema: SchemaRef,
}

impl ProjectTranslator {
    /// Compile `(expr, name)` pairs against `input_schema`.
    pub fn try_new(exprs: &[(Expr, String)], input_schema: SchemaRef) -> Result<Self> {
        if exprs.is_empty() {
            return Err(QuiverError::Construction(
                "projection needs at least one expression".to_string(),
            ));
        }
        let mut compiled = Vec::with_capacity(exprs.len());
        let mut fields = Vec::with_capacity(exprs.len());
        for (expr, name) in exprs {
            let c = compile_expr(expr, &input_schema)?;
            fields.push(Field::new(name, c.data_type(), true));
            compiled.push(c);
        }
        Ok(Self {
            exprs: compiled,
            schema: Arc::new(Schema::new(fields)),
        })
    }
}

impl Translator for ProjectTranslator {
    fn name(&self) -> &str {
        "Project"
    }

    fn output_schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    fn consume(
        &mut self,
        batch: RecordBatch,
        _ctx: &BatchProcessorContext,
    ) -> Result<Option<RecordBatch>> {
        let columns = self
            .exprs
            .iter()
            .map(|e| e.evaluate(&batch))
            .collect::<Result<Vec<_>>>()?;
        let options = RecordBatchOptions::new().with_row_count(Some(batch.num_rows()));
        RecordBatch::try_new_with_options(self.schema.clone(), columns, &options)
            .map(Some)
            .map_err(|e| QuiverError::Execution(format!("project output batch failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow::array::{Array, Float64Array, Int64Array};
    use arrow::record_batch::RecordBatch;
    use arrow_schema::{DataType, Field, Schema};
    use quiver_common::{QuiverError, SystemAllocator};
    use quiver_planner::{BinaryOp, Expr, binary, col, lit_i64};

    use super::ProjectTranslator;
    use crate::context::BatchProcessorContext;
    use crate::translator::Translator;

    #[test]
    fn projects_renames_and_casts() {
        let schema = Arc::new(Schema::new(vec![Field::new("a", DataType::Int64, false)]));
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![Arc::new(Int64Array::from(vec![1, 2, 3]))],
        )
        .expect("batch");
        let mut project = ProjectTranslator::try_new(
            &[
                (binary(col("a"), BinaryOp::Plus, lit_i64(10)), "a10".to_string()),
                (
                    Expr::Cast {
                        expr: Box::new(col("a")),
                        to_type: DataType::Float64,
                    },
                    "af".to_string(),
                ),
            ],
            schema,
        )
        .expect("project");
        assert_eq!(project.output_schema().field(1).data_type(), &DataType::Float64);

        let ctx = BatchProcessorContext::new("project_test", SystemAllocator::shared());
        let out = project.consume(batch, &ctx).expect("consume").expect("forwarded");
        assert_eq!(out.schema().field(0).name(), "a10");
        let a10 = out.column(0).as_any().downcast_ref::<Int64Array>().expect("i64");
        assert_eq!(a10.values().to_vec(), vec![11, 12, 13]);
        let af = out.column(1).as_any().downcast_ref::<Float64Array>().expect("f64");
        assert_eq!(af.value(2), 3.0);
    }

    #[test]
    fn empty_projection_is_rejected() {
        let schema = Arc::new(Schema::new(vec![Field::new("a", DataType::Int64, false)]));
        let err = ProjectTranslator::try_new(&[], schema).expect_err("no exprs");
        assert!(matches!(err, QuiverError::Construction(_)));
    }
}
