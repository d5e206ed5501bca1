use std::time::Duration;

use prowl_core::error::AppError;
use prowl_core::fingerprint::FingerprintProfile;
use prowl_core::traits::Transport;
use reqwest::header::USER_AGENT;
use reqwest::{Client, Proxy, StatusCode};

/// HTTP transport using reqwest.
///
/// One client (and one cookie jar) per session, so cookies set by the site
/// are replayed on later requests like a browser would. The user agent and
/// extra headers come from the session's [`FingerprintProfile`] on every
/// request rather than from the client defaults.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
    timeout_secs: u64,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self, AppError> {
        Self::with_options(Duration::from_secs(30), None)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, AppError> {
        Self::with_options(timeout, None)
    }

    /// Build a transport, optionally routing all traffic through `proxy`
    /// (`http://`, `https://` or `socks5://`).
    pub fn with_options(timeout: Duration, proxy: Option<&str>) -> Result<Self, AppError> {
        let mut builder = Client::builder()
            .cookie_store(true)
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(10)));

        if let Some(proxy_url) = proxy {
            let proxy = Proxy::all(proxy_url)
                .map_err(|e| AppError::ConfigError(format!("Invalid proxy '{proxy_url}': {e}")))?;
            builder = builder.proxy(proxy);
        }

        let client = builder
            .build()
            .map_err(|e| AppError::ConfigError(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            timeout_secs: timeout.as_secs(),
        })
    }
}

impl Transport for ReqwestTransport {
    async fn fetch(&self, url: &str, profile: &FingerprintProfile) -> Result<String, AppError> {
        let mut request = self
            .client
            .get(url)
            .header(USER_AGENT, profile.user_agent.as_str());
        for (name, value) in &profile.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                AppError::Timeout(self.timeout_secs)
            } else if e.is_connect() {
                AppError::NetworkError(format!("Connection failed: {e}"))
            } else {
                AppError::NetworkError(e.to_string())
            }
        })?;

        let status = response.status();
        if is_blocking_status(status) {
            tracing::warn!(url, status = status.as_u16(), profile = %profile.id, "Request blocked");
            return Err(AppError::Blocked {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        if !status.is_success() {
            return Err(AppError::HttpError {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        response.text().await.map_err(|e| {
            if e.is_timeout() {
                AppError::Timeout(self.timeout_secs)
            } else {
                AppError::NetworkError(format!("Failed to read response body: {e}"))
            }
        })
    }
}

/// Statuses sites use to turn away a client they have flagged.
fn is_blocking_status(status: StatusCode) -> bool {
    matches!(status, StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS)
}
