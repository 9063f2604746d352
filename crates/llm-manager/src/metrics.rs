use axum::http::StatusCode;
use axum::response::IntoResponse;
use lazy_static::lazy_static;
use prometheus::{Encoder, Histogram, IntCounterVec, IntGauge, Registry, TextEncoder};
use std::sync::OnceLock;

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();
}

static REQ_COUNTER: OnceLock<IntCounterVec> = OnceLock::new();
static QUEUE_DEPTH: OnceLock<IntGauge> = OnceLock::new();
static QUEUE_WAIT_TIME: OnceLock<Histogram> = OnceLock::new();
static GENERATION_TIME: OnceLock<Histogram> = OnceLock::new();
static LOADED_MODELS: OnceLock<IntGauge> = OnceLock::new();

pub fn init_metrics() {
    let req_counter = REQ_COUNTER.get_or_init(|| {
        IntCounterVec::new(
            prometheus::opts!("requests_total", "Total requests per route"),
            &["route", "status"],
        )
        .expect("requests_total definition is valid")
    });

    let queue_depth = QUEUE_DEPTH.get_or_init(|| {
        IntGauge::new("queue_depth", "Jobs waiting in the dispatch queue")
            .expect("queue_depth definition is valid")
    });

    let queue_wait_time = QUEUE_WAIT_TIME.get_or_init(|| {
        Histogram::with_opts(prometheus::HistogramOpts::new(
            "queue_wait_time_seconds",
            "Time a chat job spent waiting in the dispatch queue",
        ))
        .expect("queue_wait_time_seconds definition is valid")
    });

    let generation_time = GENERATION_TIME.get_or_init(|| {
        Histogram::with_opts(
            prometheus::HistogramOpts::new("generation_seconds", "Wall time of one generation")
                .buckets(vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]),
        )
        .expect("generation_seconds definition is valid")
    });

    let loaded_models = LOADED_MODELS.get_or_init(|| {
        IntGauge::new("loaded_models", "Models currently registered")
            .expect("loaded_models definition is valid")
    });

    REGISTRY.register(Box::new(req_counter.clone())).ok();
    REGISTRY.register(Box::new(queue_depth.clone())).ok();
    REGISTRY.register(Box::new(queue_wait_time.clone())).ok();
    REGISTRY.register(Box::new(generation_time.clone())).ok();
    REGISTRY.register(Box::new(loaded_models.clone())).ok();
}

pub fn inc_request(route: &str, status: &str) {
    if let Some(counter) = REQ_COUNTER.get() {
        counter.with_label_values(&[route, status]).inc();
    }
}

pub fn inc_queue() {
    if let Some(gauge) = QUEUE_DEPTH.get() {
        gauge.inc();
    }
}

pub fn dec_queue() {
    if let Some(gauge) = QUEUE_DEPTH.get() {
        gauge.dec();
    }
}

pub fn observe_queue_wait(duration: f64) {
    if let Some(histogram) = QUEUE_WAIT_TIME.get() {
        histogram.observe(duration);
    }
}

pub fn observe_generation(duration: f64) {
    if let Some(histogram) = GENERATION_TIME.get() {
        histogram.observe(duration);
    }
}

pub fn set_loaded_models(count: usize) {
    if let Some(gauge) = LOADED_MODELS.get() {
        gauge.set(count as i64);
    }
}

pub async fn get_metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = vec![];

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            format!("failed to encode metrics: {}", e).into_bytes(),
        );
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        buffer,
    )
}
