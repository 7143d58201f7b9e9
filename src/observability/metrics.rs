use prometheus::{
    Encoder, GaugeVec, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub dispatch_rounds_total: IntCounterVec,
    pub requests_cancelled_total: IntCounterVec,
    pub acceptances_total: IntCounterVec,
    pub timeout_checks_pending: IntGauge,
    pub dispatch_round_latency_seconds: HistogramVec,
    pub courier_utilization: GaugeVec,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let dispatch_rounds_total = IntCounterVec::new(
            Opts::new("dispatch_rounds_total", "Dispatch rounds by outcome"),
            &["outcome"],
        )
        .expect("valid dispatch_rounds_total metric");

        let requests_cancelled_total = IntCounterVec::new(
            Opts::new(
                "requests_cancelled_total",
                "Delivery requests cancelled by reason",
            ),
            &["reason"],
        )
        .expect("valid requests_cancelled_total metric");

        let acceptances_total = IntCounterVec::new(
            Opts::new("acceptances_total", "Accepted delivery requests by method"),
            &["method"],
        )
        .expect("valid acceptances_total metric");

        let timeout_checks_pending = IntGauge::new(
            "timeout_checks_pending",
            "Timeout checks waiting to fire",
        )
        .expect("valid timeout_checks_pending metric");

        let dispatch_round_latency_seconds = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "dispatch_round_latency_seconds",
                "Latency of a candidate search and notify round in seconds",
            ),
            &["outcome"],
        )
        .expect("valid dispatch_round_latency_seconds metric");

        let courier_utilization = GaugeVec::new(
            Opts::new("courier_utilization", "Courier job slot utilization [0..1]"),
            &["courier_id"],
        )
        .expect("valid courier_utilization metric");

        registry
            .register(Box::new(dispatch_rounds_total.clone()))
            .expect("register dispatch_rounds_total");
        registry
            .register(Box::new(requests_cancelled_total.clone()))
            .expect("register requests_cancelled_total");
        registry
            .register(Box::new(acceptances_total.clone()))
            .expect("register acceptances_total");
        registry
            .register(Box::new(timeout_checks_pending.clone()))
            .expect("register timeout_checks_pending");
        registry
            .register(Box::new(dispatch_round_latency_seconds.clone()))
            .expect("register dispatch_round_latency_seconds");
        registry
            .register(Box::new(courier_utilization.clone()))
            .expect("register courier_utilization");

        Self {
            registry,
            dispatch_rounds_total,
            requests_cancelled_total,
            acceptances_total,
            timeout_checks_pending,
            dispatch_round_latency_seconds,
            courier_utilization,
        }
    }

    pub fn record_utilization(&self, courier_id: &str, active_jobs: u32, cap: u32) {
        let utilization = if cap == 0 {
            1.0
        } else {
            active_jobs as f64 / cap as f64
        };
        self.courier_utilization
            .with_label_values(&[courier_id])
            .set(utilization);
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
