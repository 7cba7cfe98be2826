use prometheus::{Encoder, IntCounter, Opts, Registry, TextEncoder};

pub const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

pub struct GatewayMetrics {
    registry: Registry,
    requests_total: IntCounter,
    format_errors_total: IntCounter,
    upstream_responses_total: IntCounter,
    upstream_failures_total: IntCounter,
    client_replacements_total: IntCounter,
    truncated_total: IntCounter,
    filtered_records_total: IntCounter,
    auth_rejections_total: IntCounter,
    tracker_dropped_total: IntCounter,
}

impl GatewayMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let counter = |name: &str, help: &str| -> Result<IntCounter, prometheus::Error> {
            let counter = IntCounter::with_opts(Opts::new(name, help))?;
            registry.register(Box::new(counter.clone()))?;
            Ok(counter)
        };

        let requests_total = counter(
            "doh_gateway_requests_total",
            "Total number of DNS queries received on any transport",
        )?;
        let format_errors_total = counter(
            "doh_gateway_format_errors_total",
            "Number of queries rejected before reaching an upstream",
        )?;
        let upstream_responses_total = counter(
            "doh_gateway_upstream_responses_total",
            "Number of replies translated from upstream JSON answers",
        )?;
        let upstream_failures_total = counter(
            "doh_gateway_upstream_failures_total",
            "Number of queries answered with SERVFAIL after an upstream failure",
        )?;
        let client_replacements_total = counter(
            "doh_gateway_client_replacements_total",
            "Number of times the shared upstream HTTP client was rebuilt",
        )?;
        let truncated_total = counter(
            "doh_gateway_truncated_total",
            "Number of UDP replies truncated to the client buffer size",
        )?;
        let filtered_records_total = counter(
            "doh_gateway_filtered_records_total",
            "Number of records removed by the blacklist",
        )?;
        let auth_rejections_total = counter(
            "doh_gateway_auth_rejections_total",
            "Number of HTTP requests rejected by the token check",
        )?;
        let tracker_dropped_total = counter(
            "doh_gateway_tracker_dropped_total",
            "Number of tracker entries dropped because the queue was full",
        )?;

        Ok(Self {
            registry,
            requests_total,
            format_errors_total,
            upstream_responses_total,
            upstream_failures_total,
            client_replacements_total,
            truncated_total,
            filtered_records_total,
            auth_rejections_total,
            tracker_dropped_total,
        })
    }

    pub fn inc_request(&self) {
        self.requests_total.inc();
    }

    pub fn inc_format_error(&self) {
        self.format_errors_total.inc();
    }

    pub fn inc_upstream_response(&self) {
        self.upstream_responses_total.inc();
    }

    pub fn inc_upstream_failure(&self) {
        self.upstream_failures_total.inc();
    }

    pub fn inc_client_replacement(&self) {
        self.client_replacements_total.inc();
    }

    pub fn inc_truncated(&self) {
        self.truncated_total.inc();
    }

    pub fn add_filtered_records(&self, count: usize) {
        self.filtered_records_total.inc_by(count as u64);
    }

    pub fn inc_auth_rejection(&self) {
        self.auth_rejections_total.inc();
    }

    pub fn inc_tracker_dropped(&self) {
        self.tracker_dropped_total.inc();
    }

    pub fn tracker_dropped(&self) -> u64 {
        self.tracker_dropped_total.get()
    }

    pub fn render(&self) -> Result<Vec<u8>, prometheus::Error> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_rendered_in_text_format() {
        let metrics = GatewayMetrics::new().expect("metrics");
        metrics.inc_request();
        metrics.inc_request();
        metrics.add_filtered_records(3);
        metrics.inc_tracker_dropped();

        let text = String::from_utf8(metrics.render().expect("render")).expect("utf8");
        assert!(text.contains("doh_gateway_requests_total 2"));
        assert!(text.contains("doh_gateway_filtered_records_total 3"));
        assert!(text.contains("doh_gateway_truncated_total 0"));
        assert_eq!(metrics.tracker_dropped(), 1);
    }
}
