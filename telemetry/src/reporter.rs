use crate::config::ReporterConfig;
use crate::link::{LinkError, NetworkLink};
use crate::types::Reading;
use reqwest::header::CONTENT_TYPE;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Header the receiving server checks to authenticate devices.
pub const API_KEY_HEADER: &str = "x-api-key";

#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("Configuration file error: {0}")]
    ConfigFile(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Network link error: {0}")]
    Link(#[from] LinkError),

    #[error("Not associated after {}ms", .timeout.as_millis())]
    NotConnected { timeout: Duration },

    #[error("Server rejected report with status {status}")]
    Rejected { status: u16 },
}

pub type TelemetryResult<T> = Result<T, TelemetryError>;

/// Associates with the configured network and posts readings to the server.
///
/// `connect` and `report` only ever answer with a boolean; the cause of a
/// failure is logged. Use [`try_report`](Self::try_report) to get it back.
pub struct TelemetryReporter<L: NetworkLink> {
    config: ReporterConfig,
    link: L,
    http_client: reqwest::Client,
    target_url: String,
    connected: bool,
}

impl<L: NetworkLink> TelemetryReporter<L> {
    pub fn new(config: ReporterConfig, link: L) -> TelemetryResult<Self> {
        config
            .validate()
            .map_err(|message| TelemetryError::InvalidConfig { message })?;

        let http_client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .redirect(reqwest::redirect::Policy::none())
            .pool_max_idle_per_host(0)
            .build()
            .map_err(|e| TelemetryError::InvalidConfig {
                message: format!("Failed to build HTTP client: {}", e),
            })?;

        let target_url = config.endpoint.target_url();

        Ok(Self {
            config,
            link,
            http_client,
            target_url,
            connected: false,
        })
    }

    /// Join the network, waiting at most `timeout` for the link to come up.
    ///
    /// Returns immediately when the link is already up. Calling it again after
    /// a failure is always safe.
    pub async fn connect(&mut self, timeout: Duration) -> bool {
        self.connected = self.associate_within(timeout).await;
        self.connected
    }

    /// [`connect`](Self::connect) with the configured default timeout.
    pub async fn connect_default(&mut self) -> bool {
        let timeout = self.config.connect_timeout();
        self.connect(timeout).await
    }

    pub async fn disconnect(&mut self) -> TelemetryResult<()> {
        self.link.disassociate().await?;
        self.connected = false;
        debug!("Disassociated from {}", self.config.network.ssid);
        Ok(())
    }

    /// Post one reading. True only for a 2xx answer.
    pub async fn report(&mut self, weight: f64, volume: f64, fee_type: &str, fee: f64) -> bool {
        self.send(&Reading::new(weight, volume, fee_type, fee)).await
    }

    pub async fn send(&mut self, reading: &Reading) -> bool {
        match self.try_report(reading).await {
            Ok(status) => {
                info!(status, url = %self.target_url, "reading reported");
                true
            }
            Err(err) => {
                warn!(error = %err, url = %self.target_url, "failed to report reading");
                false
            }
        }
    }

    /// Post one reading and return the response status, or why it failed.
    ///
    /// No request is issued unless the link is up. Never retries.
    pub async fn try_report(&mut self, reading: &Reading) -> TelemetryResult<u16> {
        if !self.ensure_connected().await {
            return Err(TelemetryError::NotConnected {
                timeout: self.config.ensure_timeout(),
            });
        }

        let body = reading.to_json()?;
        debug!("Posting {} to {}", body, self.target_url);

        let mut request = self
            .http_client
            .post(&self.target_url)
            .header(CONTENT_TYPE, "application/json")
            .body(body);

        if let Some(api_key) = &self.config.api_key {
            request = request.header(API_KEY_HEADER, api_key);
        }

        let response = request.send().await?;
        let status = response.status();

        if status.is_success() {
            Ok(status.as_u16())
        } else {
            Err(TelemetryError::Rejected {
                status: status.as_u16(),
            })
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn target_url(&self) -> &str {
        &self.target_url
    }

    pub fn config(&self) -> &ReporterConfig {
        &self.config
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    async fn ensure_connected(&mut self) -> bool {
        let timeout = self.config.ensure_timeout();
        self.connect(timeout).await
    }

    async fn associate_within(&mut self, timeout: Duration) -> bool {
        if self.link.status().await.is_connected() {
            debug!("Link {} already up", self.link.link_name());
            return true;
        }

        let deadline = Instant::now() + timeout;
        let poll_interval = self.config.poll_interval();

        debug!(
            "Associating with {} over {} link",
            self.config.network.ssid,
            self.link.link_name()
        );
        if let Err(e) = self.link.associate(&self.config.network).await {
            warn!("Association request failed: {}", e);
        }

        loop {
            if self.link.status().await.is_connected() {
                info!("Associated with {}", self.config.network.ssid);
                return true;
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(
                    "Gave up associating with {} after {}ms",
                    self.config.network.ssid,
                    timeout.as_millis()
                );
                return false;
            }

            tokio::time::sleep(poll_interval.min(deadline - now)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Endpoint, NetworkCredentials};
    use crate::link::LinkResult;
    use crate::types::LinkStatus;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Link that comes up after a fixed number of status polls following
    /// `associate`, or never.
    #[derive(Default)]
    struct ScriptedLink {
        up: AtomicBool,
        associating: bool,
        up_after_polls: Option<usize>,
        polls: AtomicUsize,
        associate_calls: usize,
        disassociate_calls: usize,
        reject_associate: bool,
        reject_disassociate: bool,
    }

    impl ScriptedLink {
        fn already_up() -> Self {
            Self {
                up: AtomicBool::new(true),
                ..Self::default()
            }
        }

        fn up_after(polls: usize) -> Self {
            Self {
                up_after_polls: Some(polls),
                ..Self::default()
            }
        }

        fn never_up() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl NetworkLink for ScriptedLink {
        async fn associate(&mut self, credentials: &NetworkCredentials) -> LinkResult<()> {
            self.associate_calls += 1;
            if self.reject_associate {
                return Err(LinkError::Rejected {
                    ssid: credentials.ssid.clone(),
                    reason: "scripted".to_string(),
                });
            }
            self.associating = true;
            self.polls.store(0, Ordering::SeqCst);
            Ok(())
        }

        async fn status(&self) -> LinkStatus {
            if self.up.load(Ordering::SeqCst) {
                return LinkStatus::Connected;
            }
            if !self.associating {
                return LinkStatus::Disconnected;
            }

            let polls = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
            match self.up_after_polls {
                Some(needed) if polls >= needed => {
                    self.up.store(true, Ordering::SeqCst);
                    LinkStatus::Connected
                }
                _ => LinkStatus::Connecting,
            }
        }

        async fn disassociate(&mut self) -> LinkResult<()> {
            self.disassociate_calls += 1;
            if self.reject_disassociate {
                return Err(LinkError::Unavailable {
                    message: "radio busy".to_string(),
                });
            }
            self.associating = false;
            self.up.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn link_name(&self) -> &'static str {
            "scripted"
        }
    }

    fn sample_config() -> ReporterConfig {
        ReporterConfig::new(
            NetworkCredentials::new("warehouse", "hunter2"),
            Endpoint::host_port("10.0.0.5", 8080),
        )
    }

    fn reporter(link: ScriptedLink) -> TelemetryReporter<ScriptedLink> {
        TelemetryReporter::new(sample_config(), link).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_when_already_up_skips_association() {
        let mut reporter = reporter(ScriptedLink::already_up());

        let start = Instant::now();
        assert!(reporter.connect(Duration::from_secs(10)).await);
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(reporter.link().associate_calls, 0);
        assert!(reporter.is_connected());

        assert!(reporter.connect(Duration::from_secs(10)).await);
        assert_eq!(reporter.link().associate_calls, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_polls_until_up() {
        let mut reporter = reporter(ScriptedLink::up_after(3));

        let start = Instant::now();
        assert!(reporter.connect(Duration::from_secs(10)).await);

        // Two failed polls, each followed by one poll interval.
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(400), "took {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(600), "took {:?}", elapsed);
        assert_eq!(reporter.link().associate_calls, 1);
        assert!(reporter.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_bound() {
        let mut reporter = reporter(ScriptedLink::never_up());
        let timeout = Duration::from_millis(1_050);

        let start = Instant::now();
        assert!(!reporter.connect(timeout).await);
        let elapsed = start.elapsed();

        assert!(elapsed >= timeout, "returned early after {:?}", elapsed);
        assert!(
            elapsed <= timeout + reporter.config().poll_interval(),
            "overshot to {:?}",
            elapsed
        );
        assert!(!reporter.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_retry_after_failure() {
        let mut reporter = reporter(ScriptedLink::up_after(100));

        assert!(!reporter.connect(Duration::from_secs(1)).await);
        assert!(!reporter.is_connected());

        // A fresh association restarts the poll count; 100 polls fit in 30s.
        assert!(reporter.connect(Duration::from_secs(30)).await);
        assert!(reporter.is_connected());
        assert_eq!(reporter.link().associate_calls, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_keeps_polling_after_rejected_associate() {
        let link = ScriptedLink {
            reject_associate: true,
            ..ScriptedLink::default()
        };
        let mut reporter = reporter(link);
        let timeout = Duration::from_millis(600);

        let start = Instant::now();
        assert!(!reporter.connect(timeout).await);
        assert!(start.elapsed() >= timeout);
        assert_eq!(reporter.link().associate_calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_default_uses_configured_timeout() {
        let config = sample_config().with_connect_timeout(Duration::from_secs(3));
        let mut reporter = TelemetryReporter::new(config, ScriptedLink::never_up()).unwrap();

        let start = Instant::now();
        assert!(!reporter.connect_default().await);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(3), "took {:?}", elapsed);
        assert!(elapsed <= Duration::from_millis(3_200), "took {:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_report_without_link_fails_fast_with_ensure_timeout() {
        let config = sample_config().with_ensure_timeout(Duration::from_secs(2));
        let mut reporter = TelemetryReporter::new(config, ScriptedLink::never_up()).unwrap();

        let start = Instant::now();
        let result = reporter.try_report(&Reading::new(1.0, 2.0, "A", 3.0)).await;
        assert!(matches!(
            result,
            Err(TelemetryError::NotConnected { timeout }) if timeout == Duration::from_secs(2)
        ));
        assert!(start.elapsed() >= Duration::from_secs(2));

        assert!(!reporter.report(1.0, 2.0, "A", 3.0).await);
    }

    #[tokio::test]
    async fn test_disconnect_clears_flag() {
        let mut reporter = reporter(ScriptedLink::already_up());
        assert!(reporter.connect(Duration::from_secs(1)).await);

        reporter.disconnect().await.unwrap();
        assert!(!reporter.is_connected());
        assert_eq!(reporter.link().disassociate_calls, 1);
        assert_eq!(reporter.link().status().await, LinkStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_failed_disconnect_keeps_flag() {
        let link = ScriptedLink {
            reject_disassociate: true,
            ..ScriptedLink::already_up()
        };
        let mut reporter = reporter(link);
        assert!(reporter.connect(Duration::from_secs(1)).await);

        let result = reporter.disconnect().await;
        assert!(matches!(result, Err(TelemetryError::Link(_))));
        assert!(reporter.is_connected());
        assert_eq!(reporter.link().status().await, LinkStatus::Connected);
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = ReporterConfig::new(
            NetworkCredentials::new("", ""),
            Endpoint::host_port("10.0.0.5", 80),
        );
        let result = TelemetryReporter::new(config, ScriptedLink::never_up());
        assert!(matches!(result, Err(TelemetryError::InvalidConfig { .. })));
    }

    #[test]
    fn test_target_url_resolved_at_construction() {
        let reporter = reporter(ScriptedLink::never_up());
        assert_eq!(reporter.target_url(), "http://10.0.0.5:8080/api/packages");

        let config = ReporterConfig::new(
            NetworkCredentials::new("warehouse", ""),
            Endpoint::from_address("https://api.example.com", 8080),
        );
        let reporter = TelemetryReporter::new(config, ScriptedLink::never_up()).unwrap();
        assert_eq!(reporter.target_url(), "https://api.example.com/api/packages");
    }

    #[test]
    fn test_error_display() {
        let err = TelemetryError::NotConnected {
            timeout: Duration::from_millis(10_000),
        };
        assert_eq!(err.to_string(), "Not associated after 10000ms");

        let err = TelemetryError::Rejected { status: 404 };
        assert_eq!(err.to_string(), "Server rejected report with status 404");
    }
}
