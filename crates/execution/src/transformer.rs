//! Pipeline to translator-chain construction.
//!
//! The transformer validates the pipeline shape, orders it source first and
//! builds one translator per node, threading each translator's output schema
//! into its successor. Any failure aborts construction; no partial chain is
//! returned.

use std::sync::Arc;

use arrow_schema::SchemaRef;
use quiver_common::{CodegenOptions, QuiverError, Result};
use quiver_planner::{OpKind, OpNode, OpPipeline};
use tracing::{debug, info};

use crate::registry::{TranslatorRegistry, global_translator_registry};
use crate::translator::{
    AggregateTranslator, FilterTranslator, ProjectTranslator, SourceTranslator, Translator,
    TranslatorChain, schema_mismatch,
};

/// Builds [`TranslatorChain`]s; `Custom` nodes resolve through its registry.
#[derive(Debug, Clone)]
pub struct Transformer {
    registry: Arc<TranslatorRegistry>,
}

impl Default for Transformer {
    fn default() -> Self {
        Self::with_registry(global_translator_registry())
    }
}

impl Transformer {
    /// Transformer resolving custom operators through `registry`.
    pub fn with_registry(registry: Arc<TranslatorRegistry>) -> Self {
        Self { registry }
    }

    /// Build a chain for `pipeline` using the global registry.
    pub fn to_translator(
        pipeline: &OpPipeline,
        codegen: &CodegenOptions,
    ) -> Result<TranslatorChain> {
        Self::default().transform(pipeline, codegen)
    }

    /// [`Transformer::to_translator`] with default codegen options.
    pub fn to_translator_default(pipeline: &OpPipeline) -> Result<TranslatorChain> {
        Self::to_translator(pipeline, &CodegenOptions::default())
    }

    /// Build a chain for `pipeline`.
    pub fn transform(
        &self,
        pipeline: &OpPipeline,
        codegen: &CodegenOptions,
    ) -> Result<TranslatorChain> {
        codegen.validate()?;
        let ordered = pipeline.ordered_nodes()?;

        let mut chain: Option<TranslatorChain> = None;
        for node in ordered {
            let input = chain.as_ref().map(TranslatorChain::output_schema);
            let translator = self.build_node(node, input, codegen)?;
            if let Some(declared) = &node.schema {
                if let Some(msg) = schema_mismatch(declared, &translator.output_schema()) {
                    return Err(QuiverError::Construction(format!(
                        "node {} ({}) declares an incompatible output schema: {msg}",
                        node.id,
                        node.kind.name()
                    )));
                }
            }
            match chain.as_mut() {
                Some(c) => c.append(node.id, translator),
                None => {
                    chain = Some(TranslatorChain::new(
                        pipeline.name(),
                        pipeline.has_groupby(),
                        node.id,
                        translator,
                    ))
                }
            }
        }

        let chain = chain.ok_or_else(|| {
            QuiverError::Construction(format!("pipeline '{}' has no nodes", pipeline.name()))
        })?;
        if codegen.dump_chain {
            info!(
                pipeline = %pipeline.name(),
                chain = %chain.describe(),
                vectorize = codegen.enable_vectorize,
                lane_bytes = codegen.lane_bytes(),
                "translator chain built"
            );
        } else {
            debug!(
                pipeline = %pipeline.name(),
                chain = %chain.describe(),
                translators = chain.len(),
                "translator chain built"
            );
        }
        Ok(chain)
    }

    fn build_node(
        &self,
        node: &OpNode,
        input: Option<SchemaRef>,
        codegen: &CodegenOptions,
    ) -> Result<Box<dyn Translator>> {
        let input = match (&node.kind, input) {
            (OpKind::Source(op), None) => {
                return Ok(Box::new(SourceTranslator::new(Arc::new(op.schema.clone()))));
            }
            (OpKind::Source(_), Some(_)) => {
                return Err(QuiverError::Construction(format!(
                    "source node {} must be the pipeline root",
                    node.id
                )));
            }
            (kind, None) => {
                return Err(QuiverError::Construction(format!(
                    "node {} ({}) cannot be the pipeline root",
                    node.id,
                    kind.name()
                )));
            }
            (_, Some(input)) => input,
        };

        match &node.kind {
            OpKind::Filter(op) => Ok(Box::new(FilterTranslator::try_new(
                &op.predicate,
                input,
                codegen,
            )?)),
            OpKind::Project(op) => Ok(Box::new(ProjectTranslator::try_new(&op.exprs, input)?)),
            OpKind::Aggregate(op) => Ok(Box::new(AggregateTranslator::try_new(
                &op.group_exprs,
                &op.aggr_exprs,
                input,
            )?)),
            OpKind::Custom(op) => {
                let factory = self.registry.get(&op.op_name).ok_or_else(|| {
                    QuiverError::Unsupported(format!(
                        "no translator factory registered for custom operator '{}'",
                        op.op_name
                    ))
                })?;
                factory.create(input, &op.config, codegen)
            }
            OpKind::Source(_) => Err(QuiverError::Construction(format!(
                "source node {} must be the pipeline root",
                node.id
            ))),
        }
    }
}
