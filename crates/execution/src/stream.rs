//! Record-batch streams feeding batch processors.
//!
//! Processors are synchronous; an outer scheduler owns the async side and
//! hands each partition's stream to [`drive_stream`]. Nothing here spawns.

use std::pin::Pin;
use std::task::{Context, Poll};

use arrow::record_batch::RecordBatch;
use arrow_schema::SchemaRef;
use futures::channel::mpsc;
use futures::{SinkExt, Stream, StreamExt};
use quiver_common::{QuiverError, Result};
use tracing::debug;

use crate::processor::BatchProcessor;

/// A stream of batches that knows its schema.
pub trait RecordBatchStream: Stream<Item = Result<RecordBatch>> + Send {
    /// Schema of every yielded batch.
    fn schema(&self) -> SchemaRef;
}

/// Boxed stream handed between scheduler and processor.
pub type SendableRecordBatchStream = Pin<Box<dyn RecordBatchStream>>;

/// Attaches a schema to any `Stream<Item = Result<RecordBatch>>`.
pub struct StreamAdapter<S> {
    schema: SchemaRef,
    inner: S,
}

impl<S> StreamAdapter<S> {
    /// Wrap `inner`, whose batches carry `schema`.
    pub fn new(schema: SchemaRef, inner: S) -> Self {
        Self { schema, inner }
    }
}

impl<S> RecordBatchStream for StreamAdapter<S>
where
    S: Stream<Item = Result<RecordBatch>> + Send + Unpin + 'static,
{
    fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }
}

impl<S> Stream for StreamAdapter<S>
where
    S: Stream<Item = Result<RecordBatch>> + Unpin,
{
    type Item = Result<RecordBatch>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// Stream over already materialized batches.
pub fn batches_stream(schema: SchemaRef, batches: Vec<RecordBatch>) -> SendableRecordBatchStream {
    let inner = futures::stream::iter(batches.into_iter().map(Ok));
    Box::pin(StreamAdapter::new(schema, inner))
}

/// Stream backed by a bounded channel; `send_batch` waits while it is full.
pub fn bounded_batch_channel(
    schema: SchemaRef,
    capacity: usize,
) -> (BatchSender, SendableRecordBatchStream) {
    let (tx, rx) = mpsc::channel::<Result<RecordBatch>>(capacity);
    (BatchSender { tx }, Box::pin(StreamAdapter::new(schema, rx)))
}

/// Producer half of [`bounded_batch_channel`].
#[derive(Clone)]
pub struct BatchSender {
    tx: mpsc::Sender<Result<RecordBatch>>,
}

impl BatchSender {
    /// Send a batch.
    pub async fn send_batch(&mut self, batch: RecordBatch) -> Result<()> {
        self.tx
            .send(Ok(batch))
            .await
            .map_err(|e| QuiverError::Execution(format!("batch channel closed: {e}")))
    }

    /// Send an error; the consumer stops at it.
    pub async fn send_error(&mut self, err: QuiverError) -> Result<()> {
        self.tx
            .send(Err(err))
            .await
            .map_err(|e| QuiverError::Execution(format!("batch channel closed: {e}")))
    }
}

/// Feed every batch of `stream` to `processor` in order, then return its result.
///
/// Stops at the first stream or processing error.
pub async fn drive_stream<P>(processor: &mut P, mut stream: SendableRecordBatchStream) -> Result<RecordBatch>
where
    P: BatchProcessor + ?Sized,
{
    let mut batches = 0_u64;
    while let Some(batch) = stream.next().await {
        processor.process_batch(batch?)?;
        batches += 1;
    }
    debug!(
        batches,
        processor = processor.processor_type().as_str(),
        "input stream drained"
    );
    processor.get_result()
}
