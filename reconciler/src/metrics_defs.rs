//! Metrics definitions for reconciliation.

use shared::metrics_defs::{MetricDef, MetricType};

pub const RECONCILE_OUTCOME: MetricDef = MetricDef {
    name: "reconcile.outcome",
    metric_type: MetricType::Counter,
    description: "Finished reconciliation attempts, labelled by outcome",
};

pub const RECONCILE_DURATION: MetricDef = MetricDef {
    name: "reconcile.duration",
    metric_type: MetricType::Histogram,
    description: "Time to reconcile one server in seconds",
};

pub const RECONCILE_REMOTE_FALLBACK: MetricDef = MetricDef {
    name: "reconcile.remote_fallback",
    metric_type: MetricType::Counter,
    description: "Remote fetches that failed and fell back to a local scaffold",
};

pub const ALL_METRICS: &[MetricDef] = &[
    RECONCILE_OUTCOME,
    RECONCILE_DURATION,
    RECONCILE_REMOTE_FALLBACK,
];
