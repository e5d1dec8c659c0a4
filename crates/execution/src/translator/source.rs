use arrow::record_batch::RecordBatch;
use arrow_schema::SchemaRef;
use quiver_common::{QuiverError, Result};

use super::{Translator, schema_mismatch};
use crate::context::BatchProcessorContext;

/// Chain root: admits batches that carry the declared schema.
#[derive(Debug)]
pub struct SourceTranslator {
    schema: SchemaRef,
}

impl SourceTranslator {
    /// Source for batches shaped like `schema`.
    pub fn new(schema: SchemaRef) -> Self {
        Self { schema }
    }
}

impl Translator for SourceTranslator {
    fn name(&self) -> &str {
        "Source"
    }

    fn output_schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    fn consume(
        &mut self,
        batch: RecordBatch,
        _ctx: &BatchProcessorContext,
    ) -> Result<Option<RecordBatch>> {
        if let Some(msg) = schema_mismatch(&self.schema, batch.schema_ref()) {
            return Err(QuiverError::Data(format!(
                "input batch does not match source schema: {msg}"
            )));
        }
        Ok(Some(batch))
    }
}
