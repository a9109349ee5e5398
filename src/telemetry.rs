use opentelemetry::{
    global,
    metrics::{Counter, Histogram, MeterProvider},
    KeyValue,
};
use opentelemetry_sdk::metrics::SdkMeterProvider;
use prometheus::Registry;
use std::collections::HashSet;

pub struct Metrics {
    request_counter: Counter<u64>,
    invocation_counter: Counter<u64>,
    invocation_duration: Histogram<u64>,
    label_counter: Counter<u64>,
    result_sink_failures: Counter<u64>,
    _provider: SdkMeterProvider,
    pub registry: Registry,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();
        let exporter = opentelemetry_prometheus::exporter()
            .with_registry(registry.clone())
            .build()?;

        let provider = SdkMeterProvider::builder()
            .with_reader(exporter)
            .build();

        let meter = provider.meter("upload_classifier");
        global::set_meter_provider(provider.clone());

        let request_counter = meter
            .u64_counter("requests_total")
            .with_description("Total number of requests")
            .build();

        let invocation_counter = meter
            .u64_counter("invocations_total")
            .with_description("Pipeline invocations by outcome and failing stage")
            .build();

        let boundaries = generate_boundaries((50, 250, 1000, 3000, 10000));

        let invocation_duration = meter
            .u64_histogram("invocation_duration_ms")
            .with_boundaries(boundaries)
            .with_description("End-to-end duration of pipeline invocations in milliseconds")
            .build();

        let label_counter = meter
            .u64_counter("classifications_total")
            .with_description("Top labels returned by the prediction endpoint")
            .build();

        let result_sink_failures = meter
            .u64_counter("result_sink_failures_total")
            .with_description("Classifications that could not be persisted")
            .build();

        Ok(Metrics {
            request_counter,
            invocation_counter,
            invocation_duration,
            label_counter,
            result_sink_failures,
            _provider: provider,
            registry,
        })
    }

    pub fn record_request(&self, route: &str) {
        let attributes = vec![KeyValue::new("route", route.to_string())];
        self.request_counter.add(1, &attributes);
    }

    pub fn record_invocation(&self, outcome: &str, stage: Option<&str>, duration_ms: u64) {
        let mut attributes = vec![KeyValue::new("outcome", outcome.to_string())];
        if let Some(stage) = stage {
            attributes.push(KeyValue::new("stage", stage.to_string()));
        }
        self.invocation_counter.add(1, &attributes);
        self.invocation_duration.record(duration_ms, &attributes);
    }

    pub fn record_label(&self, label: &str) {
        let attributes = vec![KeyValue::new("label", label.to_string())];
        self.label_counter.add(1, &attributes);
    }

    pub fn record_result_sink_failure(&self) {
        self.result_sink_failures.add(1, &[]);
    }
}

fn generate_boundaries(parts: (i32, i32, i32, i32, i32)) -> Vec<f64> {
    let first_step: usize = 50;
    let middle_step: usize = 250;
    let end_step: usize = 500;
    let tail_step: usize = 2500;
    let first_part = (parts.0..=parts.1).step_by(first_step);
    let middle_part = (parts.1..=parts.2).step_by(middle_step);
    let end_part = (parts.2..=parts.3).step_by(end_step);
    let tail_part = (parts.3..=parts.4).step_by(tail_step);

    let mut seen = HashSet::new();
    first_part
        .chain(middle_part)
        .chain(end_part)
        .chain(tail_part)
        .filter(|&x| seen.insert(x))
        .map(|x| x as f64)
        .collect()
}
