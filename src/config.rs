use std::time::Duration;

pub const DEFAULT_SEGMENTS: usize = 8;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct DownloaderConfig {
    pub user_agent: String,
    pub connect_timeout: Duration,
    /// Overall client timeout, applied to every request. Not per segment.
    pub timeout: Option<Duration>,
    /// Shared across all workers, in bytes per second.
    pub rate_limit: Option<u32>,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("segdl/{}", env!("CARGO_PKG_VERSION")),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            timeout: None,
            rate_limit: None,
        }
    }
}

impl DownloaderConfig {
    pub fn build_client(&self) -> reqwest::Client {
        let mut builder = reqwest::Client::builder()
            .user_agent(self.user_agent.clone())
            .connect_timeout(self.connect_timeout);
        if let Some(timeout) = self.timeout {
            builder = builder.timeout(timeout);
        }
        builder.build().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "falling back to default http client");
            reqwest::Client::new()
        })
    }
}
