use std::sync::Arc;

use arrow_schema::SchemaRef;
use quiver_common::{MetricsRegistry, ProcessorConfig, SharedAllocator, global_metrics};

/// Resources shared by every translator of one batch processor.
#[derive(Debug, Clone)]
pub struct BatchProcessorContext {
    /// Label used in logs and metrics.
    pub pipeline_name: String,

    /// Memory source for bit-vectors and other buffers.
    pub allocator: SharedAllocator,

    /// When set, the chain's output schema must match it.
    pub expected_output_schema: Option<SchemaRef>,

    /// Processor behavior knobs.
    pub config: ProcessorConfig,

    /// Metrics sink; the process-wide registry by default.
    pub metrics: MetricsRegistry,
}

/// Context handle shared by a processor and its translators.
pub type SharedBatchProcessorContext = Arc<BatchProcessorContext>;

impl BatchProcessorContext {
    /// Context with default config and the global metrics registry.
    pub fn new(pipeline_name: impl Into<String>, allocator: SharedAllocator) -> Self {
        Self {
            pipeline_name: pipeline_name.into(),
            allocator,
            expected_output_schema: None,
            config: ProcessorConfig::default(),
            metrics: global_metrics().clone(),
        }
    }

    /// Require the chain to produce `schema`.
    pub fn with_expected_output_schema(mut self, schema: SchemaRef) -> Self {
        self.expected_output_schema = Some(schema);
        self
    }

    /// Replace the processor config.
    pub fn with_config(mut self, config: ProcessorConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a private metrics registry.
    pub fn with_metrics(mut self, metrics: MetricsRegistry) -> Self {
        self.metrics = metrics;
        self
    }

    /// Freeze into a shareable handle.
    pub fn shared(self) -> SharedBatchProcessorContext {
        Arc::new(self)
    }
}
