//! Metrics definitions for the connect API.

use shared::metrics_defs::{MetricDef, MetricType};

pub const CONNECT_REQUESTS: MetricDef = MetricDef {
    name: "connect.requests",
    metric_type: MetricType::Counter,
    description: "Transport config requests. Tagged with `outcome`: served or the error kind",
};

pub const ALL_METRICS: &[MetricDef] = &[CONNECT_REQUESTS];
