//! Metrics definitions for the token store.

use shared::metrics_defs::{MetricDef, MetricType};

pub const TOKEN_STORE_ISSUED: MetricDef = MetricDef {
    name: "token_store.issued",
    metric_type: MetricType::Counter,
    description: "Number of access tokens generated, including regenerations after expiry",
};

pub const TOKEN_STORE_EXPIRED: MetricDef = MetricDef {
    name: "token_store.expired",
    metric_type: MetricType::Counter,
    description: "Number of access tokens removed by the background sweep",
};

pub const TOKEN_STORE_SIZE: MetricDef = MetricDef {
    name: "token_store.size",
    metric_type: MetricType::Gauge,
    description: "Number of live access tokens across all servers",
};

pub const ALL_METRICS: &[MetricDef] = &[TOKEN_STORE_ISSUED, TOKEN_STORE_EXPIRED, TOKEN_STORE_SIZE];
