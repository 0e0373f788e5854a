use once_cell::sync::Lazy;
use prometheus::{IntCounterVec, Opts};

static CLAIMS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "worker_claims_total",
            "Total task claim attempts by outcome",
        ),
        &["queue", "outcome"],
    )
    .expect("failed to create worker_claims_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register worker_claims_total");
    counter
});

static DLQ_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "worker_dlq_total",
            "Total deliveries routed to the dead-letter queue",
        ),
        &["queue", "reason"],
    )
    .expect("failed to create worker_dlq_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register worker_dlq_total");
    counter
});

pub fn record_claim(queue: &str, outcome: &str) {
    CLAIMS_TOTAL.with_label_values(&[queue, outcome]).inc();
}

pub fn record_dlq(queue: &str, reason: &str) {
    DLQ_TOTAL.with_label_values(&[queue, reason]).inc();
}
