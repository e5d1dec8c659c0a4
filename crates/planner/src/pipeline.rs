use std::collections::{HashMap, HashSet};
use std::fmt;

use arrow_schema::Schema;
use quiver_common::{QuiverError, Result};
use serde::{Deserialize, Serialize};

use crate::expr::{AggExpr, Expr};

/// Stable operator identifier within one pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(
    /// Raw numeric id value.
    pub u32,
);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One operator of the physical pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpNode {
    /// Identifier referenced by the consumer's `input`.
    pub id: NodeId,
    /// Operator semantics.
    pub kind: OpKind,
    /// Upstream producer; `None` only for the data source.
    pub input: Option<NodeId>,
    /// Declared output schema. When present, the transformer checks it
    /// against the schema derived from the input.
    #[serde(default)]
    pub schema: Option<Schema>,
}

/// Operator kinds understood by the transformer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OpKind {
    /// Data acquisition: batches fed by the processor enter here.
    Source(SourceOp),
    /// Row filter.
    Filter(FilterOp),
    /// Projection.
    Project(ProjectOp),
    /// Hash or scalar aggregate accumulating across batches.
    Aggregate(AggregateOp),
    /// Operator instantiated through a translator registry.
    Custom(CustomOp),
}

impl OpKind {
    /// Short operator name used in errors, logs and metrics.
    pub fn name(&self) -> &'static str {
        match self {
            OpKind::Source(_) => "Source",
            OpKind::Filter(_) => "Filter",
            OpKind::Project(_) => "Project",
            OpKind::Aggregate(_) => "Aggregate",
            OpKind::Custom(_) => "Custom",
        }
    }

    /// Whether this operator keeps state across input batches.
    pub fn is_accumulating(&self) -> bool {
        match self {
            OpKind::Aggregate(_) => true,
            OpKind::Custom(c) => c.accumulating,
            _ => false,
        }
    }
}

/// Source operator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceOp {
    /// Schema every input batch must carry.
    pub schema: Schema,
}

/// Row filter operator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterOp {
    /// Boolean predicate; rows where it is false or null are dropped.
    pub predicate: Expr,
}

/// Projection operator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectOp {
    /// (expr, output_name)
    pub exprs: Vec<(Expr, String)>,
}

/// Aggregate operator. No group expressions means a scalar aggregate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateOp {
    /// Grouping expressions.
    pub group_exprs: Vec<Expr>,
    /// Aggregate expressions and aliases.
    pub aggr_exprs: Vec<(AggExpr, String)>,
}

/// Custom operator descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomOp {
    /// Registered factory name.
    pub op_name: String,
    /// Opaque operator configuration map.
    #[serde(default)]
    pub config: HashMap<String, String>,
    /// Whether the operator accumulates until end of input.
    #[serde(default)]
    pub accumulating: bool,
}

/// Physical plan handed to the transformer: a source-rooted chain of operators.
///
/// Immutable once built. Nodes may be listed in any order; links are
/// resolved through `OpNode::input`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpPipeline {
    name: String,
    nodes: Vec<OpNode>,
}

impl OpPipeline {
    /// Create a pipeline from explicitly linked nodes.
    pub fn new(name: impl Into<String>, nodes: Vec<OpNode>) -> Self {
        Self {
            name: name.into(),
            nodes,
        }
    }

    /// Start a linear pipeline rooted at a source with `schema`.
    pub fn builder(name: impl Into<String>, schema: Schema) -> PipelineBuilder {
        PipelineBuilder::new(name, schema)
    }

    /// Pipeline label used in logs and metrics.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Nodes in declaration order.
    pub fn nodes(&self) -> &[OpNode] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Whether any operator accumulates across batches.
    pub fn has_accumulating_op(&self) -> bool {
        self.nodes.iter().any(|n| n.kind.is_accumulating())
    }

    /// Whether the pipeline contains a grouped aggregate.
    pub fn has_groupby(&self) -> bool {
        self.nodes.iter().any(|n| match &n.kind {
            OpKind::Aggregate(agg) => !agg.group_exprs.is_empty(),
            _ => false,
        })
    }

    /// Validate the plan shape and return nodes ordered source first.
    ///
    /// Rejected shapes:
    /// - empty pipelines and duplicate ids
    /// - links to unknown ids
    /// - producers feeding more than one consumer
    /// - zero or several roots, cycles, unreachable nodes
    /// - a root that is not a source, or a source with an input
    pub fn ordered_nodes(&self) -> Result<Vec<&OpNode>> {
        if self.nodes.is_empty() {
            return Err(QuiverError::Construction(format!(
                "pipeline '{}' is empty",
                self.name
            )));
        }

        let mut by_id = HashMap::with_capacity(self.nodes.len());
        for node in &self.nodes {
            if by_id.insert(node.id, node).is_some() {
                return Err(QuiverError::Construction(format!(
                    "duplicate node id {}",
                    node.id
                )));
            }
        }

        let mut consumer_of = HashMap::<NodeId, NodeId>::new();
        let mut roots = Vec::new();
        for node in &self.nodes {
            match node.input {
                None => roots.push(node),
                Some(input) => {
                    if !by_id.contains_key(&input) {
                        return Err(QuiverError::Construction(format!(
                            "node {} reads from unknown node {input}",
                            node.id
                        )));
                    }
                    if let Some(existing) = consumer_of.insert(input, node.id) {
                        return Err(QuiverError::Construction(format!(
                            "node {input} feeds both {existing} and {}; fan-out is not supported",
                            node.id
                        )));
                    }
                }
            }
        }

        let root = match roots.as_slice() {
            [root] => *root,
            [] => {
                return Err(QuiverError::Construction(
                    "pipeline has no source node (cycle)".to_string(),
                ));
            }
            many => {
                return Err(QuiverError::Construction(format!(
                    "pipeline has {} root nodes; expected a single connected chain",
                    many.len()
                )));
            }
        };
        if !matches!(root.kind, OpKind::Source(_)) {
            return Err(QuiverError::Construction(format!(
                "pipeline root {} must be a Source, got {}",
                root.id,
                root.kind.name()
            )));
        }

        let mut ordered = Vec::with_capacity(self.nodes.len());
        let mut seen = HashSet::with_capacity(self.nodes.len());
        let mut cur = Some(root.id);
        while let Some(id) = cur {
            if !seen.insert(id) {
                break;
            }
            let node = by_id[&id];
            if node.input.is_some() && matches!(node.kind, OpKind::Source(_)) {
                return Err(QuiverError::Construction(format!(
                    "source node {id} cannot consume input"
                )));
            }
            ordered.push(node);
            cur = consumer_of.get(&id).copied();
        }

        if ordered.len() != self.nodes.len() {
            return Err(QuiverError::Construction(format!(
                "{} node(s) are not reachable from source {} (cycle or disconnected)",
                self.nodes.len() - ordered.len(),
                root.id
            )));
        }
        Ok(ordered)
    }
}

/// Fluent builder for linear pipelines.
#[derive(Debug, Clone)]
pub struct PipelineBuilder {
    name: String,
    nodes: Vec<OpNode>,
}

impl PipelineBuilder {
    fn new(name: impl Into<String>, schema: Schema) -> Self {
        Self {
            name: name.into(),
            nodes: vec![OpNode {
                id: NodeId(0),
                kind: OpKind::Source(SourceOp { schema }),
                input: None,
                schema: None,
            }],
        }
    }

    fn push(mut self, kind: OpKind) -> Self {
        let input = self.nodes.last().map(|n| n.id);
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(OpNode {
            id,
            kind,
            input,
            schema: None,
        });
        self
    }

    pub fn filter(self, predicate: Expr) -> Self {
        self.push(OpKind::Filter(FilterOp { predicate }))
    }

    pub fn project(self, exprs: Vec<(Expr, String)>) -> Self {
        self.push(OpKind::Project(ProjectOp { exprs }))
    }

    pub fn aggregate(self, group_exprs: Vec<Expr>, aggr_exprs: Vec<(AggExpr, String)>) -> Self {
        self.push(OpKind::Aggregate(AggregateOp {
            group_exprs,
            aggr_exprs,
        }))
    }

    pub fn custom(self, op: CustomOp) -> Self {
        self.push(OpKind::Custom(op))
    }

    /// Declare the expected output schema of the most recently added node.
    pub fn with_schema(mut self, schema: Schema) -> Self {
        if let Some(last) = self.nodes.last_mut() {
            last.schema = Some(schema);
        }
        self
    }

    pub fn build(self) -> OpPipeline {
        OpPipeline::new(self.name, self.nodes)
    }
}

#[cfg(test)]
mod tests {
    use arrow_schema::{DataType, Field};

    use super::*;
    use crate::expr::{BinaryOp, binary, col, lit_i64};

    fn schema() -> Schema {
        Schema::new(vec![
            Field::new("k", DataType::Utf8, true),
            Field::new("v", DataType::Int64, true),
        ])
    }

    fn node(id: u32, kind: OpKind, input: Option<u32>) -> OpNode {
        OpNode {
            id: NodeId(id),
            kind,
            input: input.map(NodeId),
            schema: None,
        }
    }

    fn filter_kind() -> OpKind {
        OpKind::Filter(FilterOp {
            predicate: binary(col("v"), BinaryOp::Gt, lit_i64(1)),
        })
    }

    #[test]
    fn builder_links_nodes_linearly() {
        let p = OpPipeline::builder("p", schema())
            .filter(binary(col("v"), BinaryOp::Gt, lit_i64(1)))
            .aggregate(vec![col("k")], vec![(AggExpr::Count(col("v")), "c".into())])
            .build();
        let ordered = p.ordered_nodes().expect("valid");
        let names: Vec<_> = ordered.iter().map(|n| n.kind.name()).collect();
        assert_eq!(names, vec!["Source", "Filter", "Aggregate"]);
        assert!(p.has_accumulating_op());
        assert!(p.has_groupby());
    }

    #[test]
    fn declaration_order_does_not_matter() {
        let p = OpPipeline::new(
            "p",
            vec![
                node(7, filter_kind(), Some(3)),
                node(3, OpKind::Source(SourceOp { schema: schema() }), None),
            ],
        );
        let ordered = p.ordered_nodes().expect("valid");
        assert_eq!(ordered[0].id, NodeId(3));
        assert_eq!(ordered[1].id, NodeId(7));
    }

    #[test]
    fn rejects_empty_and_duplicates() {
        let err = OpPipeline::new("p", vec![]).ordered_nodes().expect_err("empty");
        assert!(err.to_string().contains("empty"));

        let p = OpPipeline::new(
            "p",
            vec![
                node(0, OpKind::Source(SourceOp { schema: schema() }), None),
                node(0, filter_kind(), Some(0)),
            ],
        );
        assert!(p.ordered_nodes().expect_err("dup").to_string().contains("duplicate"));
    }

    #[test]
    fn rejects_fan_out() {
        let p = OpPipeline::new(
            "p",
            vec![
                node(0, OpKind::Source(SourceOp { schema: schema() }), None),
                node(1, filter_kind(), Some(0)),
                node(2, filter_kind(), Some(0)),
            ],
        );
        let err = p.ordered_nodes().expect_err("fan-out");
        assert!(err.to_string().contains("fan-out"));
    }

    #[test]
    fn rejects_cycles_and_unknown_links() {
        let p = OpPipeline::new(
            "p",
            vec![
                node(0, OpKind::Source(SourceOp { schema: schema() }), None),
                node(1, filter_kind(), Some(2)),
                node(2, filter_kind(), Some(1)),
            ],
        );
        let err = p.ordered_nodes().expect_err("cycle");
        assert!(err.to_string().contains("not reachable"));

        let p = OpPipeline::new(
            "p",
            vec![
                node(0, OpKind::Source(SourceOp { schema: schema() }), None),
                node(1, filter_kind(), Some(9)),
            ],
        );
        assert!(p.ordered_nodes().expect_err("unknown").to_string().contains("unknown"));
    }

    #[test]
    fn rejects_non_source_root_and_multiple_roots() {
        let p = OpPipeline::new("p", vec![node(0, filter_kind(), None)]);
        let err = p.ordered_nodes().expect_err("root");
        assert!(err.to_string().contains("must be a Source"));

        let p = OpPipeline::new(
            "p",
            vec![
                node(0, OpKind::Source(SourceOp { schema: schema() }), None),
                node(1, OpKind::Source(SourceOp { schema: schema() }), None),
            ],
        );
        assert!(p.ordered_nodes().expect_err("roots").to_string().contains("root nodes"));
    }

    #[test]
    fn rejects_source_mid_chain() {
        let p = OpPipeline::new(
            "p",
            vec![
                node(0, OpKind::Source(SourceOp { schema: schema() }), None),
                node(1, OpKind::Source(SourceOp { schema: schema() }), Some(0)),
            ],
        );
        let err = p.ordered_nodes().expect_err("mid-chain source");
        assert!(err.to_string().contains("cannot consume input"));
    }
}
