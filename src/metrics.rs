// metrics.rs - Prometheus counters for sessions, frames and queues
use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Registry};
use thiserror::Error;

/// Failure to build or register a collector.
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),
}

/// Collectors shared by every session of one core, registered under the `peercore` prefix.
#[derive(Debug, Clone)]
pub struct Metrics {
    registry: Registry,
    pub frames_sent: IntCounter,
    pub bytes_sent: IntCounter,
    pub frames_received: IntCounter,
    pub bytes_received: IntCounter,
    pub batch_size: Histogram,
    pub set_key_sent: IntCounter,
    pub ping_sent: IntCounter,
    pub pong_sent: IntCounter,
    pub sessions_confirmed: IntCounter,
    pub protocol_violations: IntCounterVec,
    pub replay_drops: IntCounter,
    pub stale_drops: IntCounter,
    pub messages_expired: IntCounter,
    pub messages_evicted: IntCounter,
    pub messages_rejected: IntCounter,
    pub transport_failures: IntCounter,
    pub quota_updates: IntCounter,
    pub notification_drops: IntCounter,
    pub connected_peers: IntGauge,
}

impl Metrics {
    /// Builds a private registry and registers every collector in it.
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new_custom(Some("peercore".into()), None)?;

        macro_rules! register_counter {
            ($name:expr, $help:expr) => {{
                let counter = IntCounter::new($name, $help)?;
                registry.register(Box::new(counter.clone()))?;
                counter
            }};
        }

        macro_rules! register_counter_vec {
            ($name:expr, $help:expr, $labels:expr) => {{
                let counter = IntCounterVec::new(prometheus::Opts::new($name, $help), $labels)?;
                registry.register(Box::new(counter.clone()))?;
                counter
            }};
        }

        macro_rules! register_gauge {
            ($name:expr, $help:expr) => {{
                let gauge = IntGauge::new($name, $help)?;
                registry.register(Box::new(gauge.clone()))?;
                gauge
            }};
        }

        macro_rules! register_histogram {
            ($name:expr, $help:expr, $buckets:expr) => {{
                let opts = HistogramOpts::new($name, $help).buckets($buckets.to_vec());
                let hist = Histogram::with_opts(opts)?;
                registry.register(Box::new(hist.clone()))?;
                hist
            }};
        }

        let frames_sent = register_counter!("frames_sent_total", "Frames handed to the transport");
        let bytes_sent = register_counter!("bytes_sent_total", "Bytes handed to the transport");
        let frames_received =
            register_counter!("frames_received_total", "Encrypted frames accepted");
        let bytes_received =
            register_counter!("bytes_received_total", "Bytes of accepted encrypted frames");
        let batch_size = register_histogram!(
            "batch_messages",
            "Sub-messages packed into one encrypted frame",
            &[1.0, 2.0, 4.0, 8.0, 16.0, 32.0]
        );
        let set_key_sent = register_counter!("set_key_sent_total", "SET_KEY messages queued");
        let ping_sent = register_counter!("ping_sent_total", "PING messages queued");
        let pong_sent = register_counter!("pong_sent_total", "PONG messages queued");
        let sessions_confirmed =
            register_counter!("sessions_confirmed_total", "Handshakes reaching KeyConfirmed");
        let protocol_violations = register_counter_vec!(
            "protocol_violations_total",
            "Inbound messages dropped as protocol violations",
            &["kind"]
        );
        let replay_drops = register_counter!("replay_drops_total", "Duplicate or ancient frames");
        let stale_drops = register_counter!("stale_drops_total", "Frames older than the maximum age");
        let messages_expired =
            register_counter!("messages_expired_total", "Messages failed past deadline");
        let messages_evicted =
            register_counter!("messages_evicted_total", "Messages evicted from a full queue");
        let messages_rejected =
            register_counter!("messages_rejected_total", "Messages refused by a full queue");
        let transport_failures =
            register_counter!("transport_failures_total", "Send slots refused by the transport");
        let quota_updates =
            register_counter!("quota_updates_total", "Receive quota changes pushed to the transport");
        let notification_drops =
            register_counter!("notification_drops_total", "Client notifications dropped");
        let connected_peers = register_gauge!("connected_peers", "Peers with a live session");

        Ok(Self {
            registry,
            frames_sent,
            bytes_sent,
            frames_received,
            bytes_received,
            batch_size,
            set_key_sent,
            ping_sent,
            pong_sent,
            sessions_confirmed,
            protocol_violations,
            replay_drops,
            stale_drops,
            messages_expired,
            messages_evicted,
            messages_rejected,
            transport_failures,
            quota_updates,
            notification_drops,
            connected_peers,
        })
    }

    /// Registry to expose through an embedding application's exporter.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Snapshot of every collector, in Prometheus protobuf form.
    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_metrics_registry() {
        let metrics = Metrics::new().expect("metrics");
        metrics.connected_peers.set(3);
        metrics.replay_drops.inc();
        metrics.protocol_violations.with_label_values(&["integrity"]).inc();
        metrics.batch_size.observe(4.0);
        assert!(!metrics.gather().is_empty());
    }
}
