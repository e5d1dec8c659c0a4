//! Vectorized execution core: translator chains, batch processors and
//! validity bit-vectors.
//!
//! Architecture role:
//! - turns an `OpPipeline` into a linked [`TranslatorChain`] ([`Transformer`])
//! - drives chains batch by batch through [`BatchProcessor`]s, either
//!   stateless or accumulating until a single finalization
//! - tracks validity and selection masks in aligned [`BitVector`]s
//!
//! Key modules:
//! - [`bit_utils`]
//! - [`expressions`]
//! - [`translator`]
//! - [`transformer`]
//! - [`processor`]
//! - [`ffi`]
//! - [`stream`]

pub mod bit_utils;
pub mod context;
pub mod expressions;
pub mod ffi;
pub mod processor;
pub mod registry;
pub mod stream;
pub mod transformer;
pub mod translator;

pub use bit_utils::{
    BitVector, DEFAULT_ALIGNMENT, align_bits_num, bitwise_and, bitwise_and_with,
    check_bit_vector_eq, clear_bit_at, count_set_bits, count_unset_bits, is_bit_clear_at,
    is_bit_set_at, set_bit_at, set_bit_at_unified,
};
pub use context::{BatchProcessorContext, SharedBatchProcessorContext};
pub use expressions::{PhysicalExpr, compile_expr};
pub use ffi::{export_batch, import_batch};
pub use processor::{
    BatchProcessor, DefaultBatchProcessor, Processor, ProcessorState, ProcessorType,
    StatefulProcessor, make_batch_processor, make_batch_processor_with,
};
pub use registry::{
    TranslatorFactory, TranslatorRegistry, deregister_global_translator_factory,
    global_translator_registry, register_global_translator_factory,
};
pub use stream::{
    BatchSender, RecordBatchStream, SendableRecordBatchStream, StreamAdapter, batches_stream,
    bounded_batch_channel, drive_stream,
};
pub use transformer::Transformer;
pub use translator::{Translator, TranslatorChain, TranslatorStats};
