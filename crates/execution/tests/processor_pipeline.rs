use std::collections::HashMap;
use std::sync::Arc;

use arrow::array::{Array, Int64Array, StringArray};
use arrow::ffi::{FFI_ArrowArray, FFI_ArrowSchema};
use arrow::record_batch::RecordBatch;
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use quiver_common::{
    BudgetAllocator, CodegenOptions, EmptyInputPolicy, MetricsRegistry, ProcessorConfig,
    QuiverError, SystemAllocator,
};
use quiver_execution::{
    BatchProcessor, BatchProcessorContext, ProcessorState, ProcessorType, SharedBatchProcessorContext,
    Transformer, Translator, TranslatorFactory, TranslatorRegistry, batches_stream,
    bounded_batch_channel, drive_stream, export_batch, import_batch, make_batch_processor,
    make_batch_processor_with,
};
use quiver_planner::{AggExpr, BinaryOp, CustomOp, OpPipeline, binary, col, lit_i64};

fn schema() -> Schema {
    Schema::new(vec![
        Field::new("k", DataType::Utf8, true),
        Field::new("v", DataType::Int64, true),
    ])
}

fn batch(keys: Vec<Option<&str>>, values: Vec<Option<i64>>) -> RecordBatch {
    RecordBatch::try_new(
        Arc::new(schema()),
        vec![
            Arc::new(StringArray::from(keys)),
            Arc::new(Int64Array::from(values)),
        ],
    )
    .expect("batch")
}

fn context(name: &str) -> SharedBatchProcessorContext {
    BatchProcessorContext::new(name, SystemAllocator::shared())
        .with_metrics(MetricsRegistry::new())
        .shared()
}

fn filter_pipeline(name: &str) -> OpPipeline {
    OpPipeline::builder(name, schema())
        .filter(binary(col("v"), BinaryOp::Gt, lit_i64(2)))
        .build()
}

fn grouped_pipeline(name: &str) -> OpPipeline {
    OpPipeline::builder(name, schema())
        .aggregate(
            vec![col("k")],
            vec![
                (AggExpr::Sum(col("v")), "total".to_string()),
                (AggExpr::Count(col("v")), "n".to_string()),
            ],
        )
        .build()
}

fn scalar_pipeline(name: &str) -> OpPipeline {
    OpPipeline::builder(name, schema())
        .aggregate(vec![], vec![(AggExpr::Count(col("v")), "n".to_string())])
        .build()
}

fn int_column(batch: &RecordBatch, idx: usize) -> Vec<Option<i64>> {
    batch
        .column(idx)
        .as_any()
        .downcast_ref::<Int64Array>()
        .expect("int64 column")
        .iter()
        .collect()
}

fn str_column(batch: &RecordBatch, idx: usize) -> Vec<Option<String>> {
    batch
        .column(idx)
        .as_any()
        .downcast_ref::<StringArray>()
        .expect("utf8 column")
        .iter()
        .map(|v| v.map(str::to_string))
        .collect()
}

#[test]
fn filter_pipeline_becomes_two_stage_chain() {
    let chain = Transformer::to_translator_default(&filter_pipeline("two_stage")).expect("chain");
    assert_eq!(chain.len(), 2);
    assert_eq!(chain.translator_names(), vec!["Source", "Filter"]);
    assert_eq!(chain.describe(), "Source#0 -> Filter#1");
    assert!(!chain.is_stateful());
    assert_eq!(chain.output_schema().fields().len(), 2);
}

#[test]
fn default_processor_keeps_selected_rows_only() {
    let mut p = make_batch_processor(
        &filter_pipeline("selectivity"),
        context("selectivity"),
        &CodegenOptions::default(),
    )
    .expect("processor");
    assert_eq!(p.processor_type(), ProcessorType::Default);
    assert_eq!(p.state(), ProcessorState::Created);

    let input = batch(
        vec![Some("a"), Some("b"), None, Some("d"), Some("e")],
        vec![Some(1), Some(5), Some(7), None, Some(2)],
    );
    p.process_batch(input.clone()).expect("process");
    assert_eq!(p.state(), ProcessorState::Processing);

    let out = p.get_result().expect("result");
    assert!(out.num_rows() <= input.num_rows());
    assert_eq!(int_column(&out, 1), vec![Some(5), Some(7)]);
    assert_eq!(str_column(&out, 0), vec![Some("b".to_string()), None]);

    let again = p.get_result().expect("result again");
    assert_eq!(out, again);
    assert_eq!(p.state(), ProcessorState::Processing);
}

#[test]
fn default_processor_result_tracks_latest_batch() {
    let mut p = make_batch_processor(
        &filter_pipeline("latest"),
        context("latest"),
        &CodegenOptions::default(),
    )
    .expect("processor");

    let before = p.get_result().expect("empty result");
    assert_eq!(before.num_rows(), 0);
    assert_eq!(before.schema(), p.output_schema());

    p.process_batch(batch(vec![Some("a")], vec![Some(10)]))
        .expect("first");
    p.process_batch(batch(vec![Some("b"), Some("c")], vec![Some(0), Some(3)]))
        .expect("second");
    let out = p.get_result().expect("result");
    assert_eq!(int_column(&out, 1), vec![Some(3)]);
}

#[test]
fn scalar_and_vectorized_kernels_agree() {
    let input = batch(
        (0..300).map(|i| Some(if i % 3 == 0 { "x" } else { "y" })).collect(),
        (0..300).map(|i| if i % 7 == 0 { None } else { Some(i % 5) }).collect(),
    );
    let mut results = Vec::new();
    for vectorize in [false, true] {
        let codegen = CodegenOptions {
            enable_vectorize: vectorize,
            ..CodegenOptions::default()
        };
        let mut p = make_batch_processor(&filter_pipeline("kernels"), context("kernels"), &codegen)
            .expect("processor");
        p.process_batch(input.clone()).expect("process");
        results.push(p.get_result().expect("result"));
    }
    assert_eq!(results[0], results[1]);
}

#[test]
fn stateful_grouped_aggregate_merges_overlapping_keys() {
    let mut p = make_batch_processor(
        &grouped_pipeline("grouped"),
        context("grouped"),
        &CodegenOptions::default(),
    )
    .expect("processor");
    assert_eq!(p.processor_type(), ProcessorType::Stateful);

    p.process_batch(batch(
        vec![Some("a"), Some("b"), Some("a")],
        vec![Some(1), Some(2), Some(3)],
    ))
    .expect("first");
    p.process_batch(batch(vec![Some("b"), Some("c")], vec![Some(10), None]))
        .expect("second");
    assert_eq!(p.state(), ProcessorState::Processing);

    let out = p.get_result().expect("result");
    assert_eq!(p.state(), ProcessorState::Finalized);
    assert_eq!(
        str_column(&out, 0),
        vec![Some("a".to_string()), Some("b".to_string()), Some("c".to_string())]
    );
    assert_eq!(int_column(&out, 1), vec![Some(4), Some(12), None]);
    assert_eq!(int_column(&out, 2), vec![Some(2), Some(2), Some(0)]);

    let cached = p.get_result().expect("cached result");
    assert_eq!(out, cached);
}

#[test]
fn stateful_processor_rejects_input_after_result() {
    let mut p = make_batch_processor(
        &grouped_pipeline("closed"),
        context("closed"),
        &CodegenOptions::default(),
    )
    .expect("processor");
    p.process_batch(batch(vec![Some("a")], vec![Some(1)]))
        .expect("process");
    p.get_result().expect("result");

    let err = p
        .process_batch(batch(vec![Some("a")], vec![Some(1)]))
        .expect_err("finalized processor must refuse input");
    assert!(matches!(err, QuiverError::State(_)));
    assert_eq!(p.state(), ProcessorState::Finalized);
}

#[test]
fn empty_input_follows_configured_policy() {
    let mut grouped = make_batch_processor(
        &grouped_pipeline("empty_grouped"),
        context("empty_grouped"),
        &CodegenOptions::default(),
    )
    .expect("processor");
    assert_eq!(grouped.get_result().expect("grouped").num_rows(), 0);

    let mut scalar = make_batch_processor(
        &scalar_pipeline("empty_scalar"),
        context("empty_scalar"),
        &CodegenOptions::default(),
    )
    .expect("processor");
    let out = scalar.get_result().expect("scalar");
    assert_eq!(int_column(&out, 0), vec![Some(0)]);

    let strict = BatchProcessorContext::new("strict", SystemAllocator::shared())
        .with_metrics(MetricsRegistry::new())
        .with_config(ProcessorConfig {
            empty_input_policy: EmptyInputPolicy::Reject,
            ..ProcessorConfig::default()
        })
        .shared();
    let mut rejecting =
        make_batch_processor(&grouped_pipeline("strict"), strict, &CodegenOptions::default())
            .expect("processor");
    let err = rejecting.get_result().expect_err("reject policy");
    assert!(matches!(err, QuiverError::State(_)));
    assert_eq!(rejecting.state(), ProcessorState::Created);
}

#[test]
fn ffi_entry_points_round_trip_batches() {
    let mut p = make_batch_processor(
        &filter_pipeline("ffi"),
        context("ffi"),
        &CodegenOptions::default(),
    )
    .expect("processor");

    let (array, schema) =
        export_batch(&batch(vec![Some("a"), Some("b")], vec![Some(9), Some(1)])).expect("export");
    p.process_batch_ffi(array, &schema).expect("process ffi");

    let mut out_array = FFI_ArrowArray::empty();
    let mut out_schema = FFI_ArrowSchema::empty();
    p.get_result_ffi(&mut out_array, &mut out_schema)
        .expect("result ffi");
    let out = import_batch(out_array, &out_schema).expect("import");
    assert_eq!(int_column(&out, 1), vec![Some(9)]);
    assert_eq!(str_column(&out, 0), vec![Some("a".to_string())]);
}

#[test]
fn drive_stream_feeds_every_batch() {
    let schema_ref: SchemaRef = Arc::new(schema());
    let mut p = make_batch_processor(
        &grouped_pipeline("streamed"),
        context("streamed"),
        &CodegenOptions::default(),
    )
    .expect("processor");
    let stream = batches_stream(
        schema_ref,
        vec![
            batch(vec![Some("x")], vec![Some(1)]),
            batch(vec![Some("x"), Some("y")], vec![Some(2), Some(3)]),
        ],
    );
    let out = futures::executor::block_on(drive_stream(&mut p, stream)).expect("drive");
    assert_eq!(int_column(&out, 1), vec![Some(3), Some(3)]);
    assert_eq!(p.state(), ProcessorState::Finalized);
}

#[test]
fn drive_stream_stops_at_first_stream_error() {
    let schema_ref: SchemaRef = Arc::new(schema());
    let mut p = make_batch_processor(
        &grouped_pipeline("stream_error"),
        context("stream_error"),
        &CodegenOptions::default(),
    )
    .expect("processor");
    let (mut tx, stream) = bounded_batch_channel(schema_ref, 4);

    let err = futures::executor::block_on(async move {
        tx.send_batch(batch(vec![Some("x")], vec![Some(1)]))
            .await
            .expect("send");
        tx.send_error(QuiverError::Data("upstream decode failed".to_string()))
            .await
            .expect("send error");
        drop(tx);
        drive_stream(&mut p, stream).await
    })
    .expect_err("stream error surfaces");
    assert!(matches!(err, QuiverError::Data(_)));
}

#[test]
fn mismatched_input_batch_is_a_data_error() {
    let mut p = make_batch_processor(
        &filter_pipeline("wrong_input"),
        context("wrong_input"),
        &CodegenOptions::default(),
    )
    .expect("processor");
    let other = RecordBatch::try_new(
        Arc::new(Schema::new(vec![Field::new("z", DataType::Int64, false)])),
        vec![Arc::new(Int64Array::from(vec![1_i64]))],
    )
    .expect("batch");
    let err = p.process_batch(other).expect_err("schema mismatch");
    assert!(matches!(err, QuiverError::Data(_)));
}

#[test]
fn expected_output_schema_is_checked_at_construction() {
    let ctx = BatchProcessorContext::new("expect", SystemAllocator::shared())
        .with_metrics(MetricsRegistry::new())
        .with_expected_output_schema(Arc::new(Schema::new(vec![Field::new(
            "only",
            DataType::Int64,
            true,
        )])))
        .shared();
    let err = make_batch_processor(&filter_pipeline("expect"), ctx, &CodegenOptions::default())
        .expect_err("mismatch");
    assert!(matches!(err, QuiverError::Construction(_)));

    let ok = BatchProcessorContext::new("expect_ok", SystemAllocator::shared())
        .with_metrics(MetricsRegistry::new())
        .with_expected_output_schema(Arc::new(schema()))
        .shared();
    make_batch_processor(&filter_pipeline("expect_ok"), ok, &CodegenOptions::default())
        .expect("matching schema");
}

#[test]
fn exhausted_budget_surfaces_as_resource_error() {
    let ctx = BatchProcessorContext::new("budget", BudgetAllocator::new(SystemAllocator::shared(), 0))
        .with_metrics(MetricsRegistry::new())
        .shared();
    let mut p = make_batch_processor(&filter_pipeline("budget"), ctx, &CodegenOptions::default())
        .expect("processor");
    let err = p
        .process_batch(batch(vec![Some("a")], vec![Some(4)]))
        .expect_err("no memory");
    assert!(matches!(err, QuiverError::Resource(_)));
}

#[derive(Debug)]
struct FirstRows {
    schema: SchemaRef,
    n: usize,
}

impl Translator for FirstRows {
    fn name(&self) -> &str {
        "FirstRows"
    }

    fn output_schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    fn consume(
        &mut self,
        batch: RecordBatch,
        _ctx: &BatchProcessorContext,
    ) -> quiver_common::Result<Option<RecordBatch>> {
        let n = self.n.min(batch.num_rows());
        Ok(Some(batch.slice(0, n)))
    }
}

struct FirstRowsFactory;

impl TranslatorFactory for FirstRowsFactory {
    fn name(&self) -> &str {
        "first_rows"
    }

    fn create(
        &self,
        input_schema: SchemaRef,
        config: &HashMap<String, String>,
        _codegen: &CodegenOptions,
    ) -> quiver_common::Result<Box<dyn Translator>> {
        let n = config
            .get("n")
            .ok_or_else(|| QuiverError::Construction("first_rows needs 'n'".to_string()))?
            .parse::<usize>()
            .map_err(|e| QuiverError::Construction(format!("first_rows 'n': {e}")))?;
        Ok(Box::new(FirstRows {
            schema: input_schema,
            n,
        }))
    }
}

fn first_rows_pipeline(name: &str) -> OpPipeline {
    OpPipeline::builder(name, schema())
        .custom(CustomOp {
            op_name: "first_rows".to_string(),
            config: HashMap::from([("n".to_string(), "2".to_string())]),
            accumulating: false,
        })
        .build()
}

#[test]
fn custom_operator_resolves_through_registry() {
    let registry = Arc::new(TranslatorRegistry::default());
    assert!(!registry.register(Arc::new(FirstRowsFactory)));
    let transformer = Transformer::with_registry(Arc::clone(&registry));

    let mut p = make_batch_processor_with(
        &transformer,
        &first_rows_pipeline("custom"),
        context("custom"),
        &CodegenOptions::default(),
    )
    .expect("processor");
    p.process_batch(batch(
        vec![Some("a"), Some("b"), Some("c")],
        vec![Some(1), Some(2), Some(3)],
    ))
    .expect("process");
    assert_eq!(int_column(&p.get_result().expect("result"), 1), vec![Some(1), Some(2)]);

    assert!(registry.deregister("first_rows"));
    let err = make_batch_processor_with(
        &transformer,
        &first_rows_pipeline("custom_gone"),
        context("custom_gone"),
        &CodegenOptions::default(),
    )
    .expect_err("factory removed");
    assert!(matches!(err, QuiverError::Unsupported(_)));
}

#[test]
fn processor_metrics_are_labelled_by_pipeline() {
    let metrics = MetricsRegistry::new();
    let ctx = BatchProcessorContext::new("observed", SystemAllocator::shared())
        .with_metrics(metrics.clone())
        .shared();
    let mut p = make_batch_processor(&grouped_pipeline("observed"), ctx, &CodegenOptions::default())
        .expect("processor");
    p.process_batch(batch(vec![Some("a")], vec![Some(1)]))
        .expect("process");
    p.get_result().expect("result");
    let _ = p.process_batch(batch(vec![Some("a")], vec![Some(1)]));

    let text = metrics.render_prometheus();
    assert!(text.contains("quiver_processor_batches_total"));
    assert!(text.contains("quiver_processor_results_total"));
    assert!(text.contains("quiver_processor_errors_total"));
    assert!(text.contains("pipeline=\"observed\""));
    assert!(text.contains("quiver_translator_rows_in_total"));
}

#[test]
fn pipeline_shipped_as_json_runs_with_dumped_chain() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new("quiver_execution=info"))
        .with_test_writer()
        .try_init();

    let wire = serde_json::to_string(&filter_pipeline("shipped")).expect("serialize");
    let pipeline: OpPipeline = serde_json::from_str(&wire).expect("deserialize");
    let codegen = CodegenOptions::from_json(r#"{"dump_chain": true, "vector_width_bits": 64}"#)
        .expect("codegen");
    assert!(codegen.dump_chain);

    let mut p = make_batch_processor(&pipeline, context("shipped"), &codegen).expect("processor");
    p.process_batch(batch(vec![Some("a"), Some("b")], vec![Some(3), Some(2)]))
        .expect("process");
    assert_eq!(int_column(&p.get_result().expect("result"), 1), vec![Some(3)]);
}

#[test]
fn rejected_batch_does_not_leak_into_totals() {
    let mut p = make_batch_processor(
        &grouped_pipeline("overflow"),
        context("overflow"),
        &CodegenOptions::default(),
    )
    .expect("processor");
    p.process_batch(batch(vec![Some("a"), Some("b")], vec![Some(1), Some(1)]))
        .expect("first");

    let err = p
        .process_batch(batch(vec![Some("a"), Some("b")], vec![Some(100), Some(i64::MAX)]))
        .expect_err("sum overflow");
    assert!(matches!(err, QuiverError::Execution(_)));
    assert_eq!(p.state(), ProcessorState::Processing);

    p.process_batch(batch(vec![Some("b")], vec![Some(2)]))
        .expect("still accepts input");
    let out = p.get_result().expect("result");
    assert_eq!(int_column(&out, 1), vec![Some(1), Some(3)]);
    assert_eq!(int_column(&out, 2), vec![Some(1), Some(2)]);
}

#[test]
fn failed_finalization_is_sticky() {
    let ctx = BatchProcessorContext::new("starved", BudgetAllocator::new(SystemAllocator::shared(), 0))
        .with_metrics(MetricsRegistry::new())
        .shared();
    let mut p = make_batch_processor(&grouped_pipeline("starved"), ctx, &CodegenOptions::default())
        .expect("processor");
    p.process_batch(batch(vec![Some("a"), Some("b")], vec![Some(1), Some(2)]))
        .expect("accumulate");

    let err = p.get_result().expect_err("no memory for output");
    assert!(matches!(err, QuiverError::Resource(_)));

    let err = p.get_result().expect_err("no silent empty result");
    assert!(matches!(err, QuiverError::State(_)));
    let err = p
        .process_batch(batch(vec![Some("c")], vec![Some(3)]))
        .expect_err("no more input");
    assert!(matches!(err, QuiverError::State(_)));
    assert_ne!(p.state(), ProcessorState::Finalized);
}
