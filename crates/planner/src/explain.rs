use crate::expr::{AggExpr, Expr};
use crate::pipeline::{OpKind, OpNode, OpPipeline};

/// Render a pipeline as human-readable multiline text, source first.
///
/// Invalid pipelines are rendered in declaration order with an error line.
pub fn explain_pipeline(pipeline: &OpPipeline) -> String {
    let mut s = format!("Pipeline {}\n", pipeline.name());
    match pipeline.ordered_nodes() {
        Ok(nodes) => {
            for (depth, node) in nodes.into_iter().enumerate() {
                fmt_node(node, depth + 1, &mut s);
            }
        }
        Err(e) => {
            s.push_str(&format!("  !! {e}\n"));
            for node in pipeline.nodes() {
                fmt_node(node, 1, &mut s);
            }
        }
    }
    s
}

fn fmt_node(node: &OpNode, indent: usize, out: &mut String) {
    let pad = "  ".repeat(indent);
    match &node.kind {
        OpKind::Source(src) => {
            let cols = src
                .schema
                .fields()
                .iter()
                .map(|f| format!("{}:{:?}", f.name(), f.data_type()))
                .collect::<Vec<_>>()
                .join(", ");
            out.push_str(&format!("{pad}#{} Source [{cols}]\n", node.id));
        }
        OpKind::Filter(f) => {
            out.push_str(&format!("{pad}#{} Filter {}\n", node.id, fmt_expr(&f.predicate)));
        }
        OpKind::Project(p) => {
            out.push_str(&format!("{pad}#{} Project\n", node.id));
            for (e, name) in &p.exprs {
                out.push_str(&format!("{pad}  {name} := {}\n", fmt_expr(e)));
            }
        }
        OpKind::Aggregate(a) => {
            out.push_str(&format!("{pad}#{} Aggregate\n", node.id));
            out.push_str(&format!("{pad}  group_by={}\n", a.group_exprs.len()));
            for g in &a.group_exprs {
                out.push_str(&format!("{pad}    {}\n", fmt_expr(g)));
            }
            out.push_str(&format!("{pad}  aggs={}\n", a.aggr_exprs.len()));
            for (agg, name) in &a.aggr_exprs {
                out.push_str(&format!("{pad}    {name} := {}\n", fmt_agg(agg)));
            }
        }
        OpKind::Custom(c) => {
            let mut keys = c.config.keys().cloned().collect::<Vec<_>>();
            keys.sort();
            out.push_str(&format!(
                "{pad}#{} Custom op={} accumulating={} config_keys={keys:?}\n",
                node.id, c.op_name, c.accumulating
            ));
        }
    }
}

fn fmt_agg(a: &AggExpr) -> String {
    format!("{}({})", a.func_name(), fmt_expr(a.input()))
}

pub fn fmt_expr(e: &Expr) -> String {
    match e {
        Expr::Column(c) => c.clone(),
        Expr::ColumnRef { name, index } => format!("{name}#{index}"),
        Expr::Literal(v) => format!("{v:?}"),
        Expr::Cast { expr, to_type } => format!("cast({} as {to_type:?})", fmt_expr(expr)),
        Expr::Not(x) => format!("NOT ({})", fmt_expr(x)),
        Expr::IsNull(x) => format!("({}) IS NULL", fmt_expr(x)),
        Expr::IsNotNull(x) => format!("({}) IS NOT NULL", fmt_expr(x)),
        Expr::And(a, b) => format!("({}) AND ({})", fmt_expr(a), fmt_expr(b)),
        Expr::Or(a, b) => format!("({}) OR ({})", fmt_expr(a), fmt_expr(b)),
        Expr::BinaryOp { left, op, right } => {
            format!("({}) {:?} ({})", fmt_expr(left), op, fmt_expr(right))
        }
    }
}

#[cfg(test)]
mod tests {
    use arrow_schema::{DataType, Field, Schema};

    use super::explain_pipeline;
    use crate::expr::{AggExpr, BinaryOp, binary, col, lit_i64};
    use crate::pipeline::OpPipeline;

    #[test]
    fn explain_lists_nodes_source_first() {
        let schema = Schema::new(vec![
            Field::new("k", DataType::Utf8, true),
            Field::new("v", DataType::Int64, true),
        ]);
        let p = OpPipeline::builder("q1", schema)
            .filter(binary(col("v"), BinaryOp::GtEq, lit_i64(10)))
            .aggregate(vec![col("k")], vec![(AggExpr::Sum(col("v")), "s".to_string())])
            .build();
        let text = explain_pipeline(&p);
        let source_at = text.find("Source").expect("source line");
        let filter_at = text.find("Filter").expect("filter line");
        let agg_at = text.find("Aggregate").expect("aggregate line");
        assert!(source_at < filter_at && filter_at < agg_at);
        assert!(text.contains("s := sum(v)"));
        assert!(text.contains("(v) GtEq (Int64(10))"));
    }
}
