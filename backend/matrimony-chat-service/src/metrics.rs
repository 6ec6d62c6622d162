use actix_web::{get, HttpResponse};
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, TextEncoder,
};

pub(crate) static HTTP_REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "chat_http_requests_total",
            "Total HTTP requests handled by matrimony-chat-service",
        ),
        &["method", "path", "status"],
    )
    .expect("failed to create chat_http_requests_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register chat_http_requests_total");
    counter
});

pub(crate) static HTTP_REQUEST_DURATION_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    let histogram = HistogramVec::new(
        HistogramOpts::new(
            "chat_http_request_duration_seconds",
            "HTTP request latencies for matrimony-chat-service",
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5,
        ]),
        &["method", "path", "status"],
    )
    .expect("failed to create chat_http_request_duration_seconds");
    prometheus::default_registry()
        .register(Box::new(histogram.clone()))
        .expect("failed to register chat_http_request_duration_seconds");
    histogram
});

static MESSAGES_SENT_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new("chat_messages_sent_total", "Messages persisted, by type"),
        &["type"],
    )
    .expect("failed to create chat_messages_sent_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register chat_messages_sent_total");
    counter
});

static QUOTA_DECISIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "chat_quota_decisions_total",
            "Quota decisions by feature and outcome (allowed, denied, fail_open, fail_closed)",
        ),
        &["feature", "outcome"],
    )
    .expect("failed to create chat_quota_decisions_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register chat_quota_decisions_total");
    counter
});

static DELIVERY_TRANSITIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "chat_delivery_transitions_total",
            "Delivery transitions by target state and outcome (applied, noop, invalid)",
        ),
        &["to", "outcome"],
    )
    .expect("failed to create chat_delivery_transitions_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register chat_delivery_transitions_total");
    counter
});

static NOTIFICATIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "chat_notifications_total",
            "Notification bridge outcomes (sent, batched, deferred, suppressed_live, suppressed_read, failed)",
        ),
        &["outcome"],
    )
    .expect("failed to create chat_notifications_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register chat_notifications_total");
    counter
});

static REALTIME_SUBSCRIBERS: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new(
        "chat_realtime_subscribers",
        "Open realtime subscriptions on this instance",
    )
    .expect("failed to create chat_realtime_subscribers");
    prometheus::default_registry()
        .register(Box::new(gauge.clone()))
        .expect("failed to register chat_realtime_subscribers");
    gauge
});

pub fn record_message_sent(message_type: &str) {
    MESSAGES_SENT_TOTAL.with_label_values(&[message_type]).inc();
}

pub fn record_quota_decision(feature: &str, outcome: &str) {
    QUOTA_DECISIONS_TOTAL
        .with_label_values(&[feature, outcome])
        .inc();
}

pub fn record_delivery_transition(to: &str, outcome: &str) {
    DELIVERY_TRANSITIONS_TOTAL
        .with_label_values(&[to, outcome])
        .inc();
}

pub fn record_notification(outcome: &str) {
    NOTIFICATIONS_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn subscriber_opened() {
    REALTIME_SUBSCRIBERS.inc();
}

pub fn subscriber_closed() {
    REALTIME_SUBSCRIBERS.dec();
}

#[get("/metrics")]
pub async fn metrics_handler() -> HttpResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %err, "failed to encode metrics");
        return HttpResponse::InternalServerError().body(err.to_string());
    }

    HttpResponse::Ok()
        .content_type(encoder.format_type())
        .body(buffer)
}
