/// Operator-facing notices, injected rather than global so tests can
/// capture them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
}

pub trait AlertSink: Send + Sync {
    fn notify(&self, level: AlertLevel, message: &str);
}

/// Default sink: alerts become structured log lines
pub struct TracingAlerts;

impl AlertSink for TracingAlerts {
    fn notify(&self, level: AlertLevel, message: &str) {
        match level {
            AlertLevel::Info => tracing::info!(alert = true, "{message}"),
            AlertLevel::Warning => tracing::warn!(alert = true, "{message}"),
            AlertLevel::Critical => tracing::error!(alert = true, "{message}"),
        }
    }
}
