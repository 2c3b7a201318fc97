/// Seam for a metrics reporter (Keen/local reporters, etc. are out of
/// scope here). The server only ever calls through this trait so a real
/// reporter can be dropped in without touching call sites.
pub trait MetricsSink: Send + Sync {
    fn open_connection(&self, _tunnel_url: &str) {}
    fn close_connection(&self, _tunnel_url: &str, _bytes_in: u64, _bytes_out: u64) {}
    fn tunnel_registered(&self, _protocol: &str) {}
    fn tunnel_closed(&self, _url: &str) {}
}

/// Default sink: logs at debug level and otherwise does nothing.
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn open_connection(&self, tunnel_url: &str) {
        tracing::debug!(tunnel_url, "connection opened");
    }

    fn close_connection(&self, tunnel_url: &str, bytes_in: u64, bytes_out: u64) {
        tracing::debug!(tunnel_url, bytes_in, bytes_out, "connection closed");
    }

    fn tunnel_registered(&self, protocol: &str) {
        tracing::debug!(protocol, "tunnel registered");
    }

    fn tunnel_closed(&self, url: &str) {
        tracing::debug!(url, "tunnel closed");
    }
}
