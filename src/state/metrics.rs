use prometheus::{Encoder, Histogram, IntCounter, IntGauge, Registry, TextEncoder};

pub struct Metrics {
    registry: Registry,

    // Request metrics
    pub total_requests: IntCounter,
    pub request_duration: Histogram,
    pub auth_rejections: IntCounter,

    // Proxy metrics
    pub proxied_requests: IntCounter,
    pub proxy_failures: IntCounter,
    pub proxy_timeouts: IntCounter,

    // Plugin process metrics
    pub running_plugins: IntGauge,
    pub failed_plugins: IntGauge,

    // Refresh metrics
    pub settings_refresh_failures: IntCounter,
    pub permission_refresh_failures: IntCounter,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let total_requests =
            IntCounter::new("cms_kernel_requests_total", "Total number of HTTP requests")
                .expect("metric creation failed");
        let request_duration = Histogram::with_opts(prometheus::HistogramOpts::new(
            "cms_kernel_request_duration_seconds",
            "Request duration in seconds",
        ))
        .expect("metric creation failed");
        let auth_rejections = IntCounter::new(
            "cms_kernel_auth_rejections_total",
            "Requests rejected as unauthorized or forbidden",
        )
        .expect("metric creation failed");

        let proxied_requests = IntCounter::new(
            "cms_kernel_proxied_requests_total",
            "Requests forwarded to plugin processes",
        )
        .expect("metric creation failed");
        let proxy_failures = IntCounter::new(
            "cms_kernel_proxy_failures_total",
            "Forwarded requests that ended in a gateway failure",
        )
        .expect("metric creation failed");
        let proxy_timeouts = IntCounter::new(
            "cms_kernel_proxy_timeouts_total",
            "Forwarded requests that timed out",
        )
        .expect("metric creation failed");

        let running_plugins = IntGauge::new(
            "cms_kernel_running_plugins",
            "Number of plugin processes currently running",
        )
        .expect("metric creation failed");
        let failed_plugins = IntGauge::new(
            "cms_kernel_failed_plugins",
            "Number of plugins that failed to start or exited abnormally",
        )
        .expect("metric creation failed");

        let settings_refresh_failures = IntCounter::new(
            "cms_kernel_settings_refresh_failures_total",
            "Settings refresh cycles that kept the previous snapshot",
        )
        .expect("metric creation failed");
        let permission_refresh_failures = IntCounter::new(
            "cms_kernel_permission_refresh_failures_total",
            "Permission refresh cycles that kept the previous cache",
        )
        .expect("metric creation failed");

        for collector in [
            Box::new(total_requests.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(request_duration.clone()),
            Box::new(auth_rejections.clone()),
            Box::new(proxied_requests.clone()),
            Box::new(proxy_failures.clone()),
            Box::new(proxy_timeouts.clone()),
            Box::new(running_plugins.clone()),
            Box::new(failed_plugins.clone()),
            Box::new(settings_refresh_failures.clone()),
            Box::new(permission_refresh_failures.clone()),
        ] {
            registry
                .register(collector)
                .expect("metric registration failed");
        }

        Self {
            registry,
            total_requests,
            request_duration,
            auth_rejections,
            proxied_requests,
            proxy_failures,
            proxy_timeouts,
            running_plugins,
            failed_plugins,
            settings_refresh_failures,
            permission_refresh_failures,
        }
    }

    pub fn record_request(&self, duration: std::time::Duration) {
        self.total_requests.inc();
        self.request_duration.observe(duration.as_secs_f64());
    }

    pub fn record_auth_rejection(&self) {
        self.auth_rejections.inc();
    }

    pub fn record_proxied_request(&self) {
        self.proxied_requests.inc();
    }

    pub fn record_proxy_failure(&self, timed_out: bool) {
        self.proxy_failures.inc();
        if timed_out {
            self.proxy_timeouts.inc();
        }
    }

    pub fn plugin_started(&self) {
        self.running_plugins.inc();
    }

    pub fn plugin_stopped(&self, failed: bool) {
        self.running_plugins.dec();
        if failed {
            self.failed_plugins.inc();
        }
    }

    pub fn plugin_failed_to_start(&self) {
        self.failed_plugins.inc();
    }

    pub fn record_settings_refresh_failure(&self) {
        self.settings_refresh_failures.inc();
    }

    pub fn record_permission_refresh_failure(&self) {
        self.permission_refresh_failures.inc();
    }

    /// Prometheus text exposition of every registered metric
    pub fn encode(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::error!("Failed to encode metrics: {}", e);
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plugin_gauges() {
        let metrics = Metrics::new();
        metrics.plugin_started();
        metrics.plugin_started();
        metrics.plugin_stopped(true);
        metrics.plugin_failed_to_start();

        assert_eq!(metrics.running_plugins.get(), 1);
        assert_eq!(metrics.failed_plugins.get(), 2);
    }

    #[test]
    fn test_encode_contains_metrics() {
        let metrics = Metrics::new();
        metrics.record_proxied_request();
        metrics.record_proxy_failure(true);

        let text = metrics.encode();
        assert!(text.contains("cms_kernel_proxied_requests_total 1"));
        assert!(text.contains("cms_kernel_proxy_timeouts_total 1"));
    }
}
