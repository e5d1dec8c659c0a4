use arrow::record_batch::RecordBatch;
use arrow_schema::SchemaRef;
use quiver_common::Result;

use super::{BatchProcessor, ProcessorState, ProcessorType, record_error};
use crate::context::SharedBatchProcessorContext;
use crate::translator::TranslatorChain;

/// Stateless processor: each `process_batch` is self-contained.
#[derive(Debug)]
pub struct DefaultBatchProcessor {
    chain: TranslatorChain,
    context: SharedBatchProcessorContext,
    state: ProcessorState,
    result: Option<RecordBatch>,
}

impl DefaultBatchProcessor {
    pub(crate) fn new(chain: TranslatorChain, context: SharedBatchProcessorContext) -> Self {
        Self {
            chain,
            context,
            state: ProcessorState::Created,
            result: None,
        }
    }
}

impl BatchProcessor for DefaultBatchProcessor {
    fn process_batch(&mut self, batch: RecordBatch) -> Result<()> {
        let out = match self.chain.push(batch, &self.context) {
            Ok(out) => out,
            Err(e) => {
                record_error(&self.chain, &self.context, &e);
                return Err(e);
            }
        };
        self.result =
            Some(out.unwrap_or_else(|| RecordBatch::new_empty(self.chain.output_schema())));
        self.state = ProcessorState::Processing;
        self.context
            .metrics
            .inc_processor_batches(self.chain.pipeline_name(), ProcessorType::Default.as_str());
        Ok(())
    }

    fn get_result(&mut self) -> Result<RecordBatch> {
        let batch = self
            .result
            .clone()
            .unwrap_or_else(|| RecordBatch::new_empty(self.chain.output_schema()));
        self.context
            .metrics
            .inc_processor_results(self.chain.pipeline_name(), ProcessorType::Default.as_str());
        Ok(batch)
    }

    fn processor_type(&self) -> ProcessorType {
        ProcessorType::Default
    }

    fn state(&self) -> ProcessorState {
        self.state
    }

    fn output_schema(&self) -> SchemaRef {
        self.chain.output_schema()
    }
}
