use arrow::compute::concat_batches;
use arrow::record_batch::RecordBatch;
use arrow_schema::SchemaRef;
use quiver_common::{EmptyInputPolicy, QuiverError, Result};
use tracing::debug;

use super::{BatchProcessor, ProcessorState, ProcessorType, record_error};
use crate::context::SharedBatchProcessorContext;
use crate::translator::TranslatorChain;

/// Accumulating processor: state lives in the chain until the first
/// `get_result`, which finalizes it exactly once.
#[derive(Debug)]
pub struct StatefulProcessor {
    chain: TranslatorChain,
    context: SharedBatchProcessorContext,
    state: ProcessorState,
    has_groupby: bool,
    batches_seen: u64,
    // Batches that passed every translator without being absorbed.
    forwarded: Vec<RecordBatch>,
    result: Option<RecordBatch>,
    // Set when finalization failed; translators may have flushed part of
    // their state, so the processor refuses further calls.
    failed: Option<String>,
}

impl StatefulProcessor {
    pub(crate) fn new(chain: TranslatorChain, context: SharedBatchProcessorContext) -> Self {
        Self {
            has_groupby: chain.has_groupby(),
            chain,
            context,
            state: ProcessorState::Created,
            batches_seen: 0,
            forwarded: Vec::new(),
            result: None,
            failed: None,
        }
    }

    /// Whether finalization materializes grouped (vs scalar) aggregates.
    pub fn has_groupby(&self) -> bool {
        self.has_groupby
    }

    fn fail(&self, err: QuiverError) -> QuiverError {
        record_error(&self.chain, &self.context, &err);
        err
    }

    fn check_not_failed(&self) -> Result<()> {
        match &self.failed {
            Some(cause) => Err(QuiverError::State(format!(
                "processor unusable after failed finalization: {cause}"
            ))),
            None => Ok(()),
        }
    }

    fn check_empty_input(&self) -> Result<()> {
        if self.batches_seen == 0 && self.context.config.empty_input_policy == EmptyInputPolicy::Reject
        {
            return Err(QuiverError::State(
                "get_result called before any batch was processed".to_string(),
            ));
        }
        Ok(())
    }

    fn finalize(&mut self) -> Result<RecordBatch> {
        let produced = self.chain.finish(&self.context)?;
        let schema = self.chain.output_schema();
        let mut batches = std::mem::take(&mut self.forwarded);
        batches.extend(produced);
        let batch = match batches.len() {
            0 => RecordBatch::new_empty(schema),
            1 => batches.remove(0),
            _ => concat_batches(&schema, &batches)
                .map_err(|e| QuiverError::Execution(format!("result concat failed: {e}")))?,
        };
        debug!(
            pipeline = %self.chain.pipeline_name(),
            batches = self.batches_seen,
            rows = batch.num_rows(),
            grouped = self.has_groupby,
            "stateful processor finalized"
        );
        Ok(batch)
    }
}

impl BatchProcessor for StatefulProcessor {
    fn process_batch(&mut self, batch: RecordBatch) -> Result<()> {
        if let Err(e) = self.check_not_failed() {
            return Err(self.fail(e));
        }
        if self.state == ProcessorState::Finalized {
            return Err(self.fail(QuiverError::State(
                "process_batch called after the result was materialized".to_string(),
            )));
        }
        match self.chain.push(batch, &self.context) {
            Ok(Some(out)) => self.forwarded.push(out),
            Ok(None) => {}
            Err(e) => return Err(self.fail(e)),
        }
        self.batches_seen += 1;
        self.state = ProcessorState::Processing;
        self.context
            .metrics
            .inc_processor_batches(self.chain.pipeline_name(), ProcessorType::Stateful.as_str());
        Ok(())
    }

    fn get_result(&mut self) -> Result<RecordBatch> {
        if let Some(batch) = &self.result {
            return Ok(batch.clone());
        }
        if let Err(e) = self.check_not_failed().and_then(|()| self.check_empty_input()) {
            return Err(self.fail(e));
        }
        let batch = match self.finalize() {
            Ok(b) => b,
            Err(e) => {
                self.failed = Some(e.to_string());
                return Err(self.fail(e));
            }
        };
        self.result = Some(batch.clone());
        self.state = ProcessorState::Finalized;
        self.context
            .metrics
            .inc_processor_results(self.chain.pipeline_name(), ProcessorType::Stateful.as_str());
        Ok(batch)
    }

    fn processor_type(&self) -> ProcessorType {
        ProcessorType::Stateful
    }

    fn state(&self) -> ProcessorState {
        self.state
    }

    fn output_schema(&self) -> SchemaRef {
        self.chain.output_schema()
    }
}
