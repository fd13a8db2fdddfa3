//! HTTP transport shared by every strategy.

use std::path::Path;
use std::time::Duration;

use futures::StreamExt;
use reqwest::{Client, StatusCode};
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument, warn};

use crate::config::ResolverConfig;
use crate::error::{FetchError, Result};
use crate::request::FetchPolicy;

/// Pause between retried requests.
pub(crate) const RETRY_DELAY: Duration = Duration::from_millis(100);

/// Async HTTP client.
#[derive(Clone)]
pub struct HttpClient {
    client: Client,
}

impl HttpClient {
    /// Create a new client.
    pub fn new(config: &ResolverConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(20)
            .user_agent(config.user_agent.clone())
            .build()?;

        Ok(Self { client })
    }

    /// Fetch a URL as text, retrying transport errors and retryable statuses.
    #[instrument(skip(self, policy))]
    pub async fn get_text(&self, url: &str, policy: FetchPolicy) -> Result<String> {
        let attempts = policy.attempts();
        let mut attempt = 1;

        loop {
            match self.get_text_once(url, policy.timeout).await {
                Ok(body) => return Ok(body),
                Err(err) if attempt < attempts && is_retryable(&err) => {
                    debug!("Attempt {}/{} for {} failed: {}", attempt, attempts, url, err);
                    attempt += 1;
                    tokio::time::sleep(RETRY_DELAY).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Fetch a URL as text exactly once.
    pub async fn get_text_once(&self, url: &str, timeout: Duration) -> Result<String> {
        let response = self.client.get(url).timeout(timeout).send().await?;

        if !response.status().is_success() {
            return Err(FetchError::Http {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }

        Ok(response.text().await?)
    }

    /// Fetch registry metadata exactly once.
    pub async fn get_metadata(&self, url: &str, accept: &str, timeout: Duration) -> Result<String> {
        debug!("Fetching metadata from {}", url);

        let response = self
            .client
            .get(url)
            .header("Accept", accept)
            .timeout(timeout)
            .send()
            .await?;

        if response.status() != StatusCode::OK {
            return Err(FetchError::Http {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }

        Ok(response.text().await?)
    }

    /// Stream a URL into `dest`. Anything but `200 OK` fails.
    #[instrument(skip(self, dest), fields(dest = %dest.display()))]
    pub async fn download_to(&self, url: &str, dest: &Path, timeout: Duration) -> Result<u64> {
        let response = self.client.get(url).timeout(timeout).send().await?;

        if response.status() != StatusCode::OK {
            return Err(FetchError::Http {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }

        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = response.bytes_stream();
        let mut written = 0u64;

        while let Some(chunk) = stream.next().await {
            let chunk: bytes::Bytes = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        if written == 0 {
            warn!("Downloaded an empty body from {}", url);
        }
        debug!("Downloaded {} bytes from {}", written, url);

        Ok(written)
    }
}

/// Transport failures, timeouts and the statuses a CDN may recover from.
fn is_retryable(err: &FetchError) -> bool {
    match err {
        FetchError::Network(_) | FetchError::Timeout(_) => true,
        FetchError::Http { status, .. } => {
            matches!(status, 408 | 409 | 425 | 429 | 500 | 502 | 503 | 504)
        }
        _ => false,
    }
}

/// Encode a package name for use in URLs.
pub(crate) fn encode_package_name(name: &str) -> String {
    if name.starts_with('@') {
        // Scoped package: @scope/name -> @scope%2Fname
        name.replace('/', "%2F")
    } else {
        urlencoding::encode(name).into_owned()
    }
}
