//! Arrow C Data Interface boundary.
//!
//! Batches cross the boundary as a struct array whose children are the
//! columns, paired with its schema. Layout is never altered.

#![allow(unsafe_code)]

use arrow::array::{Array, StructArray};
use arrow::ffi::{FFI_ArrowArray, FFI_ArrowSchema, from_ffi, to_ffi};
use arrow::record_batch::RecordBatch;
use arrow_schema::DataType;
use quiver_common::{QuiverError, Result};

/// Adopt an exported struct array as a batch.
///
/// Takes ownership of `array`; its release callback runs when the imported
/// buffers are dropped.
pub fn import_batch(array: FFI_ArrowArray, schema: &FFI_ArrowSchema) -> Result<RecordBatch> {
    // SAFETY: an owned `FFI_ArrowArray` comes either from an arrow exporter or
    // from `FFI_ArrowArray::from_raw`, whose contract covers the pointers read here.
    let data = unsafe { from_ffi(array, schema) }
        .map_err(|e| QuiverError::Data(format!("invalid C data array: {e}")))?;
    if !matches!(data.data_type(), DataType::Struct(_)) {
        return Err(QuiverError::Data(format!(
            "C data batch must be a struct array, got {:?}",
            data.data_type()
        )));
    }
    let root = StructArray::from(data);
    if root.null_count() > 0 {
        return Err(QuiverError::Data(
            "C data batch root must not contain null rows".to_string(),
        ));
    }
    Ok(RecordBatch::from(root))
}

/// Export `batch` as a struct array plus schema.
pub fn export_batch(batch: &RecordBatch) -> Result<(FFI_ArrowArray, FFI_ArrowSchema)> {
    let root = StructArray::from(batch.clone());
    to_ffi(&root.into_data())
        .map_err(|e| QuiverError::Execution(format!("C data export failed: {e}")))
}
