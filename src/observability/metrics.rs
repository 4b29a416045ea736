use prometheus::{
    Encoder, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub samples_total: IntCounterVec,
    pub sync_attempts_total: IntCounterVec,
    pub sync_latency_seconds: HistogramVec,
    pub offer_polls_total: IntCounterVec,
    pub visible_offers: IntGauge,
    pub geocode_fallbacks_total: IntCounter,
    pub route_fallbacks_total: IntCounter,
    pub reroutes_total: IntCounter,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let samples_total = IntCounterVec::new(
            Opts::new("samples_total", "Position samples by outcome"),
            &["outcome"],
        )
        .expect("valid samples_total metric");

        let sync_attempts_total = IntCounterVec::new(
            Opts::new("sync_attempts_total", "Backend position syncs by outcome"),
            &["outcome"],
        )
        .expect("valid sync_attempts_total metric");

        let sync_latency_seconds = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "sync_latency_seconds",
                "Latency of backend position syncs in seconds",
            ),
            &["outcome"],
        )
        .expect("valid sync_latency_seconds metric");

        let offer_polls_total = IntCounterVec::new(
            Opts::new("offer_polls_total", "Offer poll attempts by outcome"),
            &["outcome"],
        )
        .expect("valid offer_polls_total metric");

        let visible_offers = IntGauge::new("visible_offers", "Offers currently visible")
            .expect("valid visible_offers metric");

        let geocode_fallbacks_total = IntCounter::new(
            "geocode_fallbacks_total",
            "Geocode lookups answered with the fallback coordinate",
        )
        .expect("valid geocode_fallbacks_total metric");

        let route_fallbacks_total = IntCounter::new(
            "route_fallbacks_total",
            "Routes served as straight-line fallbacks",
        )
        .expect("valid route_fallbacks_total metric");

        let reroutes_total = IntCounter::new(
            "reroutes_total",
            "Replacement routes requested after off-route deviation",
        )
        .expect("valid reroutes_total metric");

        registry
            .register(Box::new(samples_total.clone()))
            .expect("register samples_total");
        registry
            .register(Box::new(sync_attempts_total.clone()))
            .expect("register sync_attempts_total");
        registry
            .register(Box::new(sync_latency_seconds.clone()))
            .expect("register sync_latency_seconds");
        registry
            .register(Box::new(offer_polls_total.clone()))
            .expect("register offer_polls_total");
        registry
            .register(Box::new(visible_offers.clone()))
            .expect("register visible_offers");
        registry
            .register(Box::new(geocode_fallbacks_total.clone()))
            .expect("register geocode_fallbacks_total");
        registry
            .register(Box::new(route_fallbacks_total.clone()))
            .expect("register route_fallbacks_total");
        registry
            .register(Box::new(reroutes_total.clone()))
            .expect("register reroutes_total");

        Self {
            registry,
            samples_total,
            sync_attempts_total,
            sync_latency_seconds,
            offer_polls_total,
            visible_offers,
            geocode_fallbacks_total,
            route_fallbacks_total,
            reroutes_total,
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
