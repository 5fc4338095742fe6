//! Access log entries, emitted under the dedicated `access_log` target.

#[derive(Debug, Clone)]
pub struct AccessLog {
    enabled: bool,
}

impl AccessLog {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn log_fpm(&self, method: &str, query: &str, status: u16, route: &str, size: usize) {
        if !self.enabled {
            return;
        }
        tracing::info!(
            target: "access_log",
            method,
            query,
            status = u64::from(status),
            route,
            size = size as u64,
            "access"
        );
    }
}
