//! Batch processors: drive a translator chain across a stream of batches.
//!
//! Both variants follow the same state machine:
//! `Created -> Processing (repeatable) -> Finalized`.
//! - [`DefaultBatchProcessor`] is stateless: every `process_batch` produces a
//!   result that replaces the previous one and never finalizes.
//! - [`StatefulProcessor`] accumulates in its translators and materializes
//!   once on the first `get_result`.
//!
//! [`make_batch_processor`] picks the variant from the pipeline shape.

mod default;
mod stateful;

use arrow::ffi::{FFI_ArrowArray, FFI_ArrowSchema};
use arrow::record_batch::RecordBatch;
use arrow_schema::SchemaRef;
use quiver_common::{CodegenOptions, QuiverError, Result};
use quiver_planner::OpPipeline;
use tracing::debug;

use crate::context::SharedBatchProcessorContext;
use crate::ffi::{export_batch, import_batch};
use crate::transformer::Transformer;
use crate::translator::{TranslatorChain, schema_mismatch};

pub use default::DefaultBatchProcessor;
pub use stateful::StatefulProcessor;

/// Processor identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessorType {
    /// One batch in, one batch out.
    Default,
    /// Accumulate across batches, materialize once.
    Stateful,
}

impl ProcessorType {
    /// Lowercase label for logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessorType::Default => "default",
            ProcessorType::Stateful => "stateful",
        }
    }
}

/// Lifecycle state of a processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessorState {
    /// No batch processed yet.
    Created,
    /// At least one batch processed.
    Processing,
    /// Result materialized; stateful processors accept no more input.
    Finalized,
}

/// Uniform contract over processor variants.
pub trait BatchProcessor: Send {
    /// Feed one input batch.
    fn process_batch(&mut self, batch: RecordBatch) -> Result<()>;

    /// Materialized output batch.
    fn get_result(&mut self) -> Result<RecordBatch>;

    /// Which variant this is.
    fn processor_type(&self) -> ProcessorType;

    /// Current lifecycle state.
    fn state(&self) -> ProcessorState;

    /// Schema of the batches returned by `get_result`.
    fn output_schema(&self) -> SchemaRef;

    /// Feed one batch received over the C data interface.
    fn process_batch_ffi(&mut self, array: FFI_ArrowArray, schema: &FFI_ArrowSchema) -> Result<()> {
        let batch = import_batch(array, schema)?;
        self.process_batch(batch)
    }

    /// Write the result into caller-provided C data interface structs.
    ///
    /// On error the output structs are left untouched.
    fn get_result_ffi(
        &mut self,
        out_array: &mut FFI_ArrowArray,
        out_schema: &mut FFI_ArrowSchema,
    ) -> Result<()> {
        let batch = self.get_result()?;
        let (array, schema) = export_batch(&batch)?;
        *out_array = array;
        *out_schema = schema;
        Ok(())
    }
}

/// Closed set of processor variants.
#[derive(Debug)]
pub enum Processor {
    /// Stateless processor.
    Default(DefaultBatchProcessor),
    /// Accumulating processor.
    Stateful(StatefulProcessor),
}

impl BatchProcessor for Processor {
    fn process_batch(&mut self, batch: RecordBatch) -> Result<()> {
        match self {
            Processor::Default(p) => p.process_batch(batch),
            Processor::Stateful(p) => p.process_batch(batch),
        }
    }

    fn get_result(&mut self) -> Result<RecordBatch> {
        match self {
            Processor::Default(p) => p.get_result(),
            Processor::Stateful(p) => p.get_result(),
        }
    }

    fn processor_type(&self) -> ProcessorType {
        match self {
            Processor::Default(p) => p.processor_type(),
            Processor::Stateful(p) => p.processor_type(),
        }
    }

    fn state(&self) -> ProcessorState {
        match self {
            Processor::Default(p) => p.state(),
            Processor::Stateful(p) => p.state(),
        }
    }

    fn output_schema(&self) -> SchemaRef {
        match self {
            Processor::Default(p) => p.output_schema(),
            Processor::Stateful(p) => p.output_schema(),
        }
    }
}

/// Build the processor for `pipeline`, resolving custom operators globally.
pub fn make_batch_processor(
    pipeline: &OpPipeline,
    context: SharedBatchProcessorContext,
    codegen: &CodegenOptions,
) -> Result<Processor> {
    make_batch_processor_with(&Transformer::default(), pipeline, context, codegen)
}

/// [`make_batch_processor`] with an explicit transformer.
pub fn make_batch_processor_with(
    transformer: &Transformer,
    pipeline: &OpPipeline,
    context: SharedBatchProcessorContext,
    codegen: &CodegenOptions,
) -> Result<Processor> {
    let chain = transformer.transform(pipeline, codegen)?;
    if let Some(expected) = &context.expected_output_schema {
        if let Some(msg) = schema_mismatch(expected, &chain.output_schema()) {
            return Err(QuiverError::Construction(format!(
                "pipeline '{}' output does not match the expected schema: {msg}",
                pipeline.name()
            )));
        }
    }

    let processor = if pipeline.has_accumulating_op() || chain.is_stateful() {
        Processor::Stateful(StatefulProcessor::new(chain, context))
    } else {
        Processor::Default(DefaultBatchProcessor::new(chain, context))
    };
    debug!(
        pipeline = %pipeline.name(),
        processor = processor.processor_type().as_str(),
        "batch processor created"
    );
    Ok(processor)
}

fn record_error(chain: &TranslatorChain, context: &SharedBatchProcessorContext, err: &QuiverError) {
    context
        .metrics
        .inc_processor_errors(chain.pipeline_name(), err.kind());
}
