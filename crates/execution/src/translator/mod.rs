//! Translators and the chain that links them.
//!
//! A [`Translator`] is the executable form of one pipeline operator. The
//! [`TranslatorChain`] owns its translators in an arena and links them by
//! index, source first. Batches move strictly along those links:
//! - [`TranslatorChain::push`] drives one input batch until it reaches the
//!   sink or a translator absorbs it into its state
//! - [`TranslatorChain::finish`] flushes every translator in order and pushes
//!   whatever they produce through the rest of the chain

mod aggregate;
mod filter;
mod project;
mod source;

use std::fmt;
use std::time::Instant;

use arrow::record_batch::RecordBatch;
use arrow_schema::{Schema, SchemaRef};
use quiver_common::Result;
use quiver_planner::NodeId;

use crate::context::BatchProcessorContext;

pub use aggregate::AggregateTranslator;
pub use filter::FilterTranslator;
pub use project::ProjectTranslator;
pub use source::SourceTranslator;

/// Executable form of one pipeline operator.
pub trait Translator: Send + fmt::Debug {
    /// Short name used in explain output and metrics labels.
    fn name(&self) -> &str;

    /// Schema of every batch this translator emits.
    fn output_schema(&self) -> SchemaRef;

    /// Whether `consume` absorbs batches into state flushed by `produce`.
    fn is_stateful(&self) -> bool {
        false
    }

    /// Accept one upstream batch.
    ///
    /// Returns `Some(batch)` to forward downstream, `None` when the batch was
    /// absorbed.
    fn consume(
        &mut self,
        batch: RecordBatch,
        ctx: &BatchProcessorContext,
    ) -> Result<Option<RecordBatch>>;

    /// Flush accumulated state at end of input.
    fn produce(&mut self, _ctx: &BatchProcessorContext) -> Result<Option<RecordBatch>> {
        Ok(None)
    }
}

/// Per-translator counters kept alongside the prometheus metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TranslatorStats {
    /// Rows received through `consume`.
    pub rows_in: u64,
    /// Rows emitted by `consume` or `produce`.
    pub rows_out: u64,
    /// Batches received.
    pub batches_in: u64,
    /// Batches emitted.
    pub batches_out: u64,
    /// Cumulative time spent in the translator, in seconds.
    pub elapsed_secs: f64,
}

/// Source-rooted chain of translators.
///
/// Never empty: construction starts from the root translator.
#[derive(Debug)]
pub struct TranslatorChain {
    pipeline_name: String,
    translators: Vec<Box<dyn Translator>>,
    node_ids: Vec<NodeId>,
    next: Vec<Option<usize>>,
    stats: Vec<TranslatorStats>,
    tail: usize,
    has_groupby: bool,
}

impl TranslatorChain {
    pub(crate) fn new(
        pipeline_name: impl Into<String>,
        has_groupby: bool,
        root_id: NodeId,
        root: Box<dyn Translator>,
    ) -> Self {
        Self {
            pipeline_name: pipeline_name.into(),
            translators: vec![root],
            node_ids: vec![root_id],
            next: vec![None],
            stats: vec![TranslatorStats::default()],
            tail: 0,
            has_groupby,
        }
    }

    /// Link `translator` after the current sink.
    pub(crate) fn append(&mut self, node_id: NodeId, translator: Box<dyn Translator>) {
        let idx = self.translators.len();
        self.translators.push(translator);
        self.node_ids.push(node_id);
        self.next.push(None);
        self.stats.push(TranslatorStats::default());
        self.next[self.tail] = Some(idx);
        self.tail = idx;
    }

    /// Pipeline label this chain was built for.
    pub fn pipeline_name(&self) -> &str {
        &self.pipeline_name
    }

    /// Number of translators.
    pub fn len(&self) -> usize {
        self.translators.len()
    }

    /// Always false; kept for API symmetry with `len`.
    pub fn is_empty(&self) -> bool {
        self.translators.is_empty()
    }

    /// Schema of the batches leaving the sink.
    pub fn output_schema(&self) -> SchemaRef {
        self.translators[self.tail].output_schema()
    }

    /// Whether any translator accumulates across batches.
    pub fn is_stateful(&self) -> bool {
        self.translators.iter().any(|t| t.is_stateful())
    }

    /// Whether the chain contains a grouped aggregate.
    pub fn has_groupby(&self) -> bool {
        self.has_groupby
    }

    /// Translator names in execution order.
    pub fn translator_names(&self) -> Vec<&str> {
        self.order().map(|i| self.translators[i].name()).collect()
    }

    /// Counters per translator in execution order.
    pub fn stats(&self) -> Vec<TranslatorStats> {
        self.order().map(|i| self.stats[i]).collect()
    }

    /// One-line chain shape, e.g. `Source#0 -> Filter#1`.
    pub fn describe(&self) -> String {
        self.order()
            .map(|i| format!("{}#{}", self.translators[i].name(), self.node_ids[i]))
            .collect::<Vec<_>>()
            .join(" -> ")
    }

    /// Drive `batch` from the root towards the sink.
    ///
    /// Returns the sink's output, or `None` when a stateful translator
    /// absorbed the batch.
    pub fn push(
        &mut self,
        batch: RecordBatch,
        ctx: &BatchProcessorContext,
    ) -> Result<Option<RecordBatch>> {
        self.run_from(Some(0), batch, ctx)
    }

    /// Flush every translator in order; returns the batches reaching the sink.
    pub fn finish(&mut self, ctx: &BatchProcessorContext) -> Result<Vec<RecordBatch>> {
        let mut out = Vec::new();
        let mut cursor = Some(0);
        while let Some(idx) = cursor {
            let started = Instant::now();
            let produced = self.translators[idx].produce(ctx)?;
            self.record(idx, ctx, None, produced.as_ref(), started);
            if let Some(batch) = produced {
                if let Some(sunk) = self.run_from(self.next[idx], batch, ctx)? {
                    out.push(sunk);
                }
            }
            cursor = self.next[idx];
        }
        Ok(out)
    }

    fn run_from(
        &mut self,
        mut cursor: Option<usize>,
        mut batch: RecordBatch,
        ctx: &BatchProcessorContext,
    ) -> Result<Option<RecordBatch>> {
        while let Some(idx) = cursor {
            let rows_in = batch.num_rows();
            let started = Instant::now();
            let out = self.translators[idx].consume(batch, ctx)?;
            self.record(idx, ctx, Some(rows_in), out.as_ref(), started);
            match out {
                Some(next_batch) => {
                    batch = next_batch;
                    cursor = self.next[idx];
                }
                None => return Ok(None),
            }
        }
        Ok(Some(batch))
    }

    fn record(
        &mut self,
        idx: usize,
        ctx: &BatchProcessorContext,
        rows_in: Option<usize>,
        out: Option<&RecordBatch>,
        started: Instant,
    ) {
        let secs = started.elapsed().as_secs_f64();
        let batches_in = u64::from(rows_in.is_some());
        let rows_in = rows_in.map_or(0, |r| r as u64);
        let rows_out = out.map_or(0, |b| b.num_rows() as u64);
        let batches_out = u64::from(out.is_some());

        let stats = &mut self.stats[idx];
        stats.rows_in += rows_in;
        stats.rows_out += rows_out;
        stats.batches_in += batches_in;
        stats.batches_out += batches_out;
        stats.elapsed_secs += secs;

        ctx.metrics.record_translator(
            &self.pipeline_name,
            self.translators[idx].name(),
            rows_in,
            rows_out,
            batches_in,
            batches_out,
            secs,
        );
    }

    fn order(&self) -> impl Iterator<Item = usize> + '_ {
        std::iter::successors(Some(0), |i| self.next[*i])
    }
}

/// Describe how `actual` differs from `expected` (field count, names, types).
///
/// Nullability is not compared.
pub(crate) fn schema_mismatch(expected: &Schema, actual: &Schema) -> Option<String> {
    if expected.fields().len() != actual.fields().len() {
        return Some(format!(
            "expected {} fields, got {}",
            expected.fields().len(),
            actual.fields().len()
        ));
    }
    expected
        .fields()
        .iter()
        .zip(actual.fields().iter())
        .enumerate()
        .find_map(|(i, (e, a))| {
            if e.name() != a.name() {
                Some(format!(
                    "field {i}: expected name '{}', got '{}'",
                    e.name(),
                    a.name()
                ))
            } else if e.data_type() != a.data_type() {
                Some(format!(
                    "field '{}': expected {:?}, got {:?}",
                    e.name(),
                    e.data_type(),
                    a.data_type()
                ))
            } else {
                None
            }
        })
}

#[cfg(test)]
mod tests {
    use arrow_schema::{DataType, Field, Schema};

    use super::schema_mismatch;

    #[test]
    fn schema_mismatch_reports_first_difference() {
        let a = Schema::new(vec![
            Field::new("k", DataType::Int64, false),
            Field::new("v", DataType::Float64, true),
        ]);
        let same_but_nullable = Schema::new(vec![
            Field::new("k", DataType::Int64, true),
            Field::new("v", DataType::Float64, true),
        ]);
        assert_eq!(schema_mismatch(&a, &same_but_nullable), None);

        let renamed = Schema::new(vec![
            Field::new("key", DataType::Int64, false),
            Field::new("v", DataType::Float64, true),
        ]);
        let msg = schema_mismatch(&a, &renamed).expect("name differs");
        assert!(msg.contains("'key'"), "{msg}");

        let retyped = Schema::new(vec![
            Field::new("k", DataType::Int64, false),
            Field::new("v", DataType::Int64, true),
        ]);
        assert!(schema_mismatch(&a, &retyped).is_some());
        assert!(schema_mismatch(&a, &Schema::empty()).is_some());
    }
}
