use std::sync::{Arc, OnceLock};

use prometheus::{CounterVec, Encoder, Gauge, IntCounter, Opts, Registry, TextEncoder};

#[derive(Clone, Debug)]
pub struct MetricsRegistry {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    registry: Registry,
    control_signals_forwarded: CounterVec,
    control_signals_dropped: CounterVec,
    result_chunks_forwarded: IntCounter,
    result_chunks_rejected: IntCounter,
    result_streams_opened: IntCounter,
    result_streams_closed: CounterVec,
    result_streams_active: Gauge,
    ack_anomalies: IntCounter,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::new()),
        }
    }

    pub fn inc_control_signal_forwarded(&self, kind: &str) {
        self.inner
            .control_signals_forwarded
            .with_label_values(&[kind])
            .inc();
    }

    pub fn inc_control_signal_dropped(&self, kind: &str) {
        self.inner
            .control_signals_dropped
            .with_label_values(&[kind])
            .inc();
    }

    pub fn inc_result_chunk_forwarded(&self) {
        self.inner.result_chunks_forwarded.inc();
    }

    pub fn inc_result_chunk_rejected(&self) {
        self.inner.result_chunks_rejected.inc();
    }

    pub fn record_result_stream_opened(&self) {
        self.inner.result_streams_opened.inc();
        self.inner.result_streams_active.inc();
    }

    /// `reason` is one of `completed`, `local_error`, `remote_error`, `remote_closed`, `shutdown`.
    pub fn record_result_stream_closed(&self, reason: &str) {
        self.inner
            .result_streams_closed
            .with_label_values(&[reason])
            .inc();
        self.inner.result_streams_active.dec();
    }

    pub fn inc_ack_anomaly(&self) {
        self.inner.ack_anomalies.inc();
    }

    pub fn render_prometheus(&self) -> String {
        let metric_families = self.inner.registry.gather();
        let mut out = Vec::new();
        let enc = TextEncoder::new();
        if enc.encode(&metric_families, &mut out).is_err() {
            return String::new();
        }
        String::from_utf8_lossy(&out).to_string()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsInner {
    fn new() -> Self {
        let registry = Registry::new();

        let control_signals_forwarded = counter_vec(
            &registry,
            "fqr_control_signals_forwarded_total",
            "Control signals forwarded to a remote foreman",
            &["kind"],
        );
        let control_signals_dropped = counter_vec(
            &registry,
            "fqr_control_signals_dropped_total",
            "Control signals dropped as stale or locally owned",
            &["kind"],
        );
        let result_chunks_forwarded = int_counter(
            &registry,
            "fqr_result_chunks_forwarded_total",
            "Result chunks written onto a foreman results stream",
        );
        let result_chunks_rejected = int_counter(
            &registry,
            "fqr_result_chunks_rejected_total",
            "Result chunks failed back to the caller without forwarding",
        );
        let result_streams_opened = int_counter(
            &registry,
            "fqr_result_streams_opened_total",
            "Results streams opened towards foremen",
        );
        let result_streams_closed = counter_vec(
            &registry,
            "fqr_result_streams_closed_total",
            "Results streams torn down, by reason",
            &["reason"],
        );
        let result_streams_active = gauge(
            &registry,
            "fqr_result_streams_active",
            "Results streams currently registered",
        );
        let ack_anomalies = int_counter(
            &registry,
            "fqr_ack_anomalies_total",
            "Acknowledgments received with no pending sender",
        );

        Self {
            registry,
            control_signals_forwarded,
            control_signals_dropped,
            result_chunks_forwarded,
            result_chunks_rejected,
            result_streams_opened,
            result_streams_closed,
            result_streams_active,
            ack_anomalies,
        }
    }
}

fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> CounterVec {
    let c = CounterVec::new(Opts::new(name, help), labels).expect("counter vec");
    registry
        .register(Box::new(c.clone()))
        .expect("register counter");
    c
}

fn int_counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let c = IntCounter::with_opts(Opts::new(name, help)).expect("int counter");
    registry
        .register(Box::new(c.clone()))
        .expect("register int counter");
    c
}

fn gauge(registry: &Registry, name: &str, help: &str) -> Gauge {
    let g = Gauge::with_opts(Opts::new(name, help)).expect("gauge");
    registry
        .register(Box::new(g.clone()))
        .expect("register gauge");
    g
}

static GLOBAL_METRICS: OnceLock<MetricsRegistry> = OnceLock::new();

pub fn global_metrics() -> &'static MetricsRegistry {
    GLOBAL_METRICS.get_or_init(MetricsRegistry::new)
}
