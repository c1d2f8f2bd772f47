//! Prometheus metrics for checkpoint and restore cycles.

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, HistogramVec, IntCounterVec,
};

use crate::config::ZeropodConfig;

const LABELS: &[&str] = &["namespace", "pod", "container"];

lazy_static! {
    pub static ref CHECKPOINT_DURATION: HistogramVec = register_histogram_vec!(
        "zeropod_checkpoint_duration_seconds",
        "Time taken to checkpoint a container to disk",
        LABELS,
        prometheus::exponential_buckets(0.01, 2.0, 12).unwrap()
    )
    .unwrap();
    pub static ref RESTORE_DURATION: HistogramVec = register_histogram_vec!(
        "zeropod_restore_duration_seconds",
        "Time taken to restore a container from its checkpoint",
        LABELS,
        prometheus::exponential_buckets(0.01, 2.0, 12).unwrap()
    )
    .unwrap();
    pub static ref CHECKPOINTS: IntCounterVec = register_int_counter_vec!(
        "zeropod_checkpoints_total",
        "Total number of completed checkpoints",
        LABELS
    )
    .unwrap();
    pub static ref RESTORES: IntCounterVec = register_int_counter_vec!(
        "zeropod_restores_total",
        "Total number of completed restores",
        LABELS
    )
    .unwrap();
}

pub fn labels(cfg: &ZeropodConfig) -> [&str; 3] {
    [cfg.pod_namespace(), cfg.pod_name(), &cfg.container_name]
}
