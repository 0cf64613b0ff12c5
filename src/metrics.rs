// src/metrics.rs

use prometheus::{Encoder, TextEncoder, Registry, IntCounterVec, IntGauge, Histogram};
use lazy_static::lazy_static;
use std::sync::OnceLock;
use axum::response::IntoResponse;
use axum::http::StatusCode;

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();
}

static REQ_COUNTER: OnceLock<IntCounterVec> = OnceLock::new();
static ACTIVE_SESSIONS: OnceLock<IntGauge> = OnceLock::new();
static QUEUE_DEPTH: OnceLock<IntGauge> = OnceLock::new();
static QUEUE_WAIT_TIME: OnceLock<Histogram> = OnceLock::new();

static CHAT_REQUESTS: OnceLock<IntCounterVec> = OnceLock::new();
static CONTEXT_BUILD_DURATION: OnceLock<Histogram> = OnceLock::new();
static MEMORY_QUEUE_DEPTH: OnceLock<IntGauge> = OnceLock::new();
static MEMORY_QUEUE_DROPPED: OnceLock<IntCounterVec> = OnceLock::new();
static RATE_LIMITED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static RELATIONSHIP_EDGES: OnceLock<IntCounterVec> = OnceLock::new();
static CONTEXT_DEGRADED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

pub fn init_metrics() {
    let req_counter = REQ_COUNTER.get_or_init(|| {
        IntCounterVec::new(
            prometheus::opts!("requests_total", "Total requests per route"),
            &["route", "status"],
        )
        .unwrap()
    });
    let active_sessions = ACTIVE_SESSIONS.get_or_init(|| {
        IntGauge::new("active_sessions", "Active streaming sessions").unwrap()
    });
    let queue_depth = QUEUE_DEPTH.get_or_init(|| {
        IntGauge::new("queue_depth", "Number of requests waiting in queue").unwrap()
    });
    let queue_wait_time = QUEUE_WAIT_TIME.get_or_init(|| {
        Histogram::with_opts(prometheus::HistogramOpts::new(
            "queue_wait_time_seconds",
            "Time spent waiting in queue",
        ))
        .unwrap()
    });

    let chat_requests = CHAT_REQUESTS.get_or_init(|| {
        IntCounterVec::new(
            prometheus::opts!("chat_requests_total", "Chat completion requests by outcome"),
            &["status"],
        )
        .unwrap()
    });
    let context_build_duration = CONTEXT_BUILD_DURATION.get_or_init(|| {
        Histogram::with_opts(prometheus::HistogramOpts::new(
            "context_build_duration_seconds",
            "Time spent assembling the retrieval context",
        ))
        .unwrap()
    });
    let memory_queue_depth = MEMORY_QUEUE_DEPTH.get_or_init(|| {
        IntGauge::new("memory_queue_depth", "In-flight items in the memory pipeline").unwrap()
    });
    let memory_queue_dropped = MEMORY_QUEUE_DROPPED.get_or_init(|| {
        IntCounterVec::new(
            prometheus::opts!("memory_queue_dropped_total", "Memory items dropped due to backpressure"),
            &["session_id"],
        )
        .unwrap()
    });
    let rate_limited_total = RATE_LIMITED_TOTAL.get_or_init(|| {
        IntCounterVec::new(
            prometheus::opts!("rate_limited_total", "Requests rejected by the rate limiter"),
            &["tenant_id"],
        )
        .unwrap()
    });
    let relationship_edges = RELATIONSHIP_EDGES.get_or_init(|| {
        IntCounterVec::new(
            prometheus::opts!("relationship_edges_total", "Relationship edges emitted by type"),
            &["type"],
        )
        .unwrap()
    });
    let context_degraded_total = CONTEXT_DEGRADED_TOTAL.get_or_init(|| {
        IntCounterVec::new(
            prometheus::opts!("context_degraded_total", "Context builds that degraded to a fallback"),
            &["reason"],
        )
        .unwrap()
    });

    REGISTRY.register(Box::new(req_counter.clone())).ok();
    REGISTRY.register(Box::new(active_sessions.clone())).ok();
    REGISTRY.register(Box::new(queue_depth.clone())).ok();
    REGISTRY.register(Box::new(queue_wait_time.clone())).ok();
    REGISTRY.register(Box::new(chat_requests.clone())).ok();
    REGISTRY.register(Box::new(context_build_duration.clone())).ok();
    REGISTRY.register(Box::new(memory_queue_depth.clone())).ok();
    REGISTRY.register(Box::new(memory_queue_dropped.clone())).ok();
    REGISTRY.register(Box::new(rate_limited_total.clone())).ok();
    REGISTRY.register(Box::new(relationship_edges.clone())).ok();
    REGISTRY.register(Box::new(context_degraded_total.clone())).ok();
}

pub fn inc_request(route: &str, status: &str) {
    if let Some(counter) = REQ_COUNTER.get() {
        counter.with_label_values(&[route, status]).inc();
    }
}
pub fn inc_sessions() {
    if let Some(gauge) = ACTIVE_SESSIONS.get() {
        gauge.inc();
    }
}
pub fn dec_sessions() {
    if let Some(gauge) = ACTIVE_SESSIONS.get() {
        gauge.dec();
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

pub fn inc_chat_request(status: &str) {
    if let Some(c) = CHAT_REQUESTS.get() {
        c.with_label_values(&[status]).inc();
    }
}
pub fn observe_context_build(duration_secs: f64) {
    if let Some(h) = CONTEXT_BUILD_DURATION.get() {
        h.observe(duration_secs);
    }
}
pub fn set_memory_queue_depth(depth: i64) {
    if let Some(g) = MEMORY_QUEUE_DEPTH.get() {
        g.set(depth);
    }
}
pub fn inc_memory_queue_dropped(session_id: &str) {
    if let Some(c) = MEMORY_QUEUE_DROPPED.get() {
        c.with_label_values(&[session_id]).inc();
    }
}
pub fn inc_rate_limited(tenant_id: &str) {
    if let Some(c) = RATE_LIMITED_TOTAL.get() {
        c.with_label_values(&[tenant_id]).inc();
    }
}
pub fn inc_relationship_edge(edge_type: &str) {
    if let Some(c) = RELATIONSHIP_EDGES.get() {
        c.with_label_values(&[edge_type]).inc();
    }
}
pub fn inc_context_degraded(reason: &str) {
    if let Some(c) = CONTEXT_DEGRADED_TOTAL.get() {
        c.with_label_values(&[reason]).inc();
    }
}

pub async fn get_metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = vec![];
    encoder.encode(&metric_families, &mut buffer).unwrap();

    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        buffer,
    )
}
