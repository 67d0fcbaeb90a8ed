use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use anyhow::Context;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

pub const UPGRADES_TOTAL: &str = "nautica_upgrades_total";
pub const SESSIONS_TOTAL: &str = "nautica_sessions_total";
pub const ACTIVE_SESSIONS: &str = "nautica_active_sessions";
pub const RELAY_BYTES_TOTAL: &str = "nautica_relay_bytes_total";
pub const RELAY_WRITE_DROPS_TOTAL: &str = "nautica_relay_write_drops_total";
pub const CHANNEL_ERRORS_TOTAL: &str = "nautica_channel_errors_total";

/// Installs a Prometheus recorder for the `metrics` crate and returns a handle used to render
/// the exposition format.
///
/// This should be called once per process at startup.
pub fn init_prometheus() -> anyhow::Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .context("metrics: install Prometheus recorder")
}

pub type SharedPrometheusHandle = Arc<PrometheusHandle>;

/// Tracks one live tunnel session in the active-sessions gauge.
pub struct ActiveSessionGuard;

impl ActiveSessionGuard {
    pub fn new() -> Self {
        metrics::gauge!(ACTIVE_SESSIONS).increment(1.0);
        Self
    }
}

impl Default for ActiveSessionGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ActiveSessionGuard {
    fn drop(&mut self) {
        metrics::gauge!(ACTIVE_SESSIONS).decrement(1.0);
    }
}

/// Process-unique id used only to correlate a session's log lines.
pub fn new_session_id() -> String {
    static SEQ: AtomicU64 = AtomicU64::new(1);
    let n = SEQ.fetch_add(1, Ordering::Relaxed);
    format!("s{n}")
}
