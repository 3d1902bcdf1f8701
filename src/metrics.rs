//! Prometheus metrics for the mail subsystem

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_histogram_vec, CounterVec, Encoder, Gauge,
    HistogramVec, TextEncoder,
};

lazy_static! {
    /// Counter: mail sent, by backend and kind (draft, direct)
    pub static ref MAILS_SENT: CounterVec = register_counter_vec!(
        "postbox_mails_sent_total",
        "Total mail sent by backend and kind",
        &["backend", "kind"]
    )
    .expect("Failed to create mails_sent metric");

    /// Counter: escrow outcomes (granted, paid, rolled_back, refused, cancelled, ...)
    pub static ref ESCROW_OUTCOMES: CounterVec = register_counter_vec!(
        "postbox_escrow_outcomes_total",
        "Cash-on-delivery outcomes by kind",
        &["outcome"]
    )
    .expect("Failed to create escrow_outcomes metric");

    /// Counter: mail removed by the retention sweeper
    pub static ref SWEEP_DELETIONS: CounterVec = register_counter_vec!(
        "postbox_sweep_deletions_total",
        "Mail deleted by the retention sweeper",
        &["backend"]
    )
    .expect("Failed to create sweep_deletions metric");

    /// Counter: operations refused while the file index was loading
    pub static ref NOT_READY_REJECTIONS: CounterVec = register_counter_vec!(
        "postbox_not_ready_total",
        "Operations rejected while the store was loading",
        &["backend"]
    )
    .expect("Failed to create not_ready metric");

    /// Gauge: attachment boxes currently open
    pub static ref OPEN_BOXES: Gauge = register_gauge!(
        "postbox_open_boxes",
        "Number of attachment boxes currently open"
    )
    .expect("Failed to create open_boxes metric");

    /// Histogram: index load time of the file backend (seconds)
    pub static ref LOAD_DURATION: HistogramVec = register_histogram_vec!(
        "postbox_index_load_seconds",
        "Time spent building the file backend index",
        &["backend"],
        vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]
    )
    .expect("Failed to create load_duration metric");
}

pub fn record_sent(backend: &str, kind: &str) {
    MAILS_SENT.with_label_values(&[backend, kind]).inc();
}

pub fn record_escrow(outcome: &str) {
    ESCROW_OUTCOMES.with_label_values(&[outcome]).inc();
}

pub fn record_sweep(backend: &str, deleted: usize) {
    SWEEP_DELETIONS
        .with_label_values(&[backend])
        .inc_by(deleted as f64);
}

pub fn record_not_ready(backend: &str) {
    NOT_READY_REJECTIONS.with_label_values(&[backend]).inc();
}

pub fn set_open_boxes(count: usize) {
    OPEN_BOXES.set(count as f64);
}

pub fn record_load_duration(backend: &str, secs: f64) {
    LOAD_DURATION.with_label_values(&[backend]).observe(secs);
}

/// Encode all metrics as Prometheus text format
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
