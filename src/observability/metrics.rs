use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub transitions_total: IntCounterVec,
    pub push_events_total: IntCounterVec,
    pub push_reconnects_total: IntCounter,
    pub push_connected: IntGauge,
    pub poll_ticks_total: IntCounter,
    pub confirmations_total: IntCounterVec,
    pub finalizations_total: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let transitions_total = IntCounterVec::new(
            Opts::new("transitions_total", "Requested transitions by outcome"),
            &["outcome"],
        )
        .expect("valid transitions_total metric");

        let push_events_total = IntCounterVec::new(
            Opts::new("push_events_total", "Pushed order events by apply result"),
            &["result"],
        )
        .expect("valid push_events_total metric");

        let push_reconnects_total = IntCounter::new(
            "push_reconnects_total",
            "Reconnects scheduled after a dropped push connection",
        )
        .expect("valid push_reconnects_total metric");

        let push_connected = IntGauge::new("push_connected", "1 while the push channel is connected")
            .expect("valid push_connected metric");

        let poll_ticks_total = IntCounter::new(
            "poll_ticks_total",
            "Order status queries issued by the poll confirmer",
        )
        .expect("valid poll_ticks_total metric");

        let confirmations_total = IntCounterVec::new(
            Opts::new("confirmations_total", "Resolved confirmation attempts by source"),
            &["source"],
        )
        .expect("valid confirmations_total metric");

        let finalizations_total = IntCounterVec::new(
            Opts::new("finalizations_total", "Finalized orders by terminal reason"),
            &["reason"],
        )
        .expect("valid finalizations_total metric");

        registry
            .register(Box::new(transitions_total.clone()))
            .expect("register transitions_total");
        registry
            .register(Box::new(push_events_total.clone()))
            .expect("register push_events_total");
        registry
            .register(Box::new(push_reconnects_total.clone()))
            .expect("register push_reconnects_total");
        registry
            .register(Box::new(push_connected.clone()))
            .expect("register push_connected");
        registry
            .register(Box::new(poll_ticks_total.clone()))
            .expect("register poll_ticks_total");
        registry
            .register(Box::new(confirmations_total.clone()))
            .expect("register confirmations_total");
        registry
            .register(Box::new(finalizations_total.clone()))
            .expect("register finalizations_total");

        Self {
            registry,
            transitions_total,
            push_events_total,
            push_reconnects_total,
            push_connected,
            poll_ticks_total,
            confirmations_total,
            finalizations_total,
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

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
