use std::sync::{Arc, OnceLock};

use prometheus::{
    CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};

#[derive(Clone, Debug)]
pub struct MetricsRegistry {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    registry: Registry,
    translator_rows_in: CounterVec,
    translator_rows_out: CounterVec,
    translator_batches_in: CounterVec,
    translator_batches_out: CounterVec,
    translator_time_seconds: HistogramVec,
    processor_batches: CounterVec,
    processor_results: CounterVec,
    processor_errors: CounterVec,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::new()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn record_translator(
        &self,
        pipeline: &str,
        translator: &str,
        rows_in: u64,
        rows_out: u64,
        batches_in: u64,
        batches_out: u64,
        secs: f64,
    ) {
        let labels = [pipeline, translator];
        self.inner
            .translator_rows_in
            .with_label_values(&labels)
            .inc_by(rows_in as f64);
        self.inner
            .translator_rows_out
            .with_label_values(&labels)
            .inc_by(rows_out as f64);
        self.inner
            .translator_batches_in
            .with_label_values(&labels)
            .inc_by(batches_in as f64);
        self.inner
            .translator_batches_out
            .with_label_values(&labels)
            .inc_by(batches_out as f64);
        self.inner
            .translator_time_seconds
            .with_label_values(&labels)
            .observe(secs.max(0.0));
    }

    pub fn inc_processor_batches(&self, pipeline: &str, processor: &str) {
        self.inner
            .processor_batches
            .with_label_values(&[pipeline, processor])
            .inc();
    }

    pub fn inc_processor_results(&self, pipeline: &str, processor: &str) {
        self.inner
            .processor_results
            .with_label_values(&[pipeline, processor])
            .inc();
    }

    pub fn inc_processor_errors(&self, pipeline: &str, kind: &str) {
        self.inner
            .processor_errors
            .with_label_values(&[pipeline, kind])
            .inc();
    }

    pub fn render_prometheus(&self) -> String {
        let metric_families = self.inner.registry.gather();
        let mut out = Vec::new();
        let enc = TextEncoder::new();
        if enc.encode(&metric_families, &mut out).is_err() {
            return String::new();
        }
        String::from_utf8_lossy(&out).to_string()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsInner {
    fn new() -> Self {
        let registry = Registry::new();

        let translator_rows_in = counter_vec(
            &registry,
            "quiver_translator_rows_in_total",
            "Input rows consumed per translator",
            &["pipeline", "translator"],
        );
        let translator_rows_out = counter_vec(
            &registry,
            "quiver_translator_rows_out_total",
            "Output rows produced per translator",
            &["pipeline", "translator"],
        );
        let translator_batches_in = counter_vec(
            &registry,
            "quiver_translator_batches_in_total",
            "Input batches consumed per translator",
            &["pipeline", "translator"],
        );
        let translator_batches_out = counter_vec(
            &registry,
            "quiver_translator_batches_out_total",
            "Output batches produced per translator",
            &["pipeline", "translator"],
        );
        let translator_time_seconds = histogram_vec(
            &registry,
            "quiver_translator_time_seconds",
            "Time spent in each translator",
            &["pipeline", "translator"],
        );

        let processor_batches = counter_vec(
            &registry,
            "quiver_processor_batches_total",
            "Batches fed to batch processors",
            &["pipeline", "processor"],
        );
        let processor_results = counter_vec(
            &registry,
            "quiver_processor_results_total",
            "Results materialized by batch processors",
            &["pipeline", "processor"],
        );
        let processor_errors = counter_vec(
            &registry,
            "quiver_processor_errors_total",
            "Errors surfaced by batch processors",
            &["pipeline", "kind"],
        );

        Self {
            registry,
            translator_rows_in,
            translator_rows_out,
            translator_batches_in,
            translator_batches_out,
            translator_time_seconds,
            processor_batches,
            processor_results,
            processor_errors,
        }
    }
}

fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> CounterVec {
    let c = CounterVec::new(Opts::new(name, help), labels).expect("counter vec");
    registry
        .register(Box::new(c.clone()))
        .expect("register counter");
    c
}

fn histogram_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> HistogramVec {
    let h = HistogramVec::new(HistogramOpts::new(name, help), labels).expect("histogram vec");
    registry
        .register(Box::new(h.clone()))
        .expect("register histogram");
    h
}

static GLOBAL_METRICS: OnceLock<MetricsRegistry> = OnceLock::new();

pub fn global_metrics() -> &'static MetricsRegistry {
    GLOBAL_METRICS.get_or_init(MetricsRegistry::new)
}
