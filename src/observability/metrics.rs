use prometheus::{
    Encoder, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub matches_total: IntCounterVec,
    pub match_latency_seconds: HistogramVec,
    pub accepts_total: IntCounterVec,
    pub orders_expired_total: IntCounter,
    pub engineer_bulk_fetches_total: IntCounter,
    pub push_events_total: IntCounterVec,
    pub live_sessions: IntGauge,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let matches_total = IntCounterVec::new(
            Opts::new("matches_total", "Matching runs by outcome"),
            &["outcome"],
        )
        .expect("valid matches_total metric");

        let match_latency_seconds = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "match_latency_seconds",
                "Latency of candidate matching in seconds",
            ),
            &["outcome"],
        )
        .expect("valid match_latency_seconds metric");

        let accepts_total = IntCounterVec::new(
            Opts::new("accepts_total", "Accept attempts by outcome"),
            &["outcome"],
        )
        .expect("valid accepts_total metric");

        let orders_expired_total =
            IntCounter::new("orders_expired_total", "Orders swept into EXPIRED")
                .expect("valid orders_expired_total metric");

        let engineer_bulk_fetches_total = IntCounter::new(
            "engineer_bulk_fetches_total",
            "Bulk engineer reads issued by the matcher",
        )
        .expect("valid engineer_bulk_fetches_total metric");

        let push_events_total = IntCounterVec::new(
            Opts::new("push_events_total", "Push events delivered by type"),
            &["event"],
        )
        .expect("valid push_events_total metric");

        let live_sessions = IntGauge::new("live_sessions", "Connected engineer sessions")
            .expect("valid live_sessions metric");

        registry
            .register(Box::new(matches_total.clone()))
            .expect("register matches_total");
        registry
            .register(Box::new(match_latency_seconds.clone()))
            .expect("register match_latency_seconds");
        registry
            .register(Box::new(accepts_total.clone()))
            .expect("register accepts_total");
        registry
            .register(Box::new(orders_expired_total.clone()))
            .expect("register orders_expired_total");
        registry
            .register(Box::new(engineer_bulk_fetches_total.clone()))
            .expect("register engineer_bulk_fetches_total");
        registry
            .register(Box::new(push_events_total.clone()))
            .expect("register push_events_total");
        registry
            .register(Box::new(live_sessions.clone()))
            .expect("register live_sessions");

        Self {
            registry,
            matches_total,
            match_latency_seconds,
            accepts_total,
            orders_expired_total,
            engineer_bulk_fetches_total,
            push_events_total,
            live_sessions,
        }
    }

    pub fn encode(&self) -> Result<String, String> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        TextEncoder::new()
            .encode(&metric_families, &mut buffer)
            .map_err(|err| format!("failed to encode metrics: {err}"))?;

        String::from_utf8(buffer).map_err(|err| format!("metrics are not valid utf8: {err}"))
    }
}
