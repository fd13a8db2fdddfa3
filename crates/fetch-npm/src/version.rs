//! Latest-version discovery.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::error::{FetchError, Result};
use crate::race::{race_ok, Candidate};
use crate::request::FetchPolicy;
use crate::transport::{encode_package_name, HttpClient, RETRY_DELAY};

/// Accept header for abbreviated packuments.
const ABBREVIATED_ACCEPT: &str = "application/vnd.npm.install-v1+json; q=1.0, application/json; q=0.8";

/// Finds the latest published version of a package.
#[async_trait]
pub trait VersionResolver: Send + Sync {
    /// Fails with [`FetchError::VersionLookup`] when no version can be found.
    async fn resolve(&self, name: &str, policy: FetchPolicy) -> Result<String>;
}

#[derive(Debug, Deserialize)]
struct DistTags {
    #[serde(rename = "dist-tags", default)]
    dist_tags: BTreeMap<String, String>,
}

/// Races the configured registries for `dist-tags.latest`.
#[derive(Clone)]
pub struct RegistryVersionResolver {
    http: HttpClient,
    registries: Vec<String>,
}

impl RegistryVersionResolver {
    pub fn new(http: HttpClient, registries: Vec<String>) -> Self {
        Self { http, registries }
    }

    async fn latest_from(http: HttpClient, url: String, policy: FetchPolicy) -> Result<String> {
        let mut attempt = 1;
        let body = loop {
            match http.get_metadata(&url, ABBREVIATED_ACCEPT, policy.timeout).await {
                Ok(body) => break body,
                Err(FetchError::Http { status, .. }) if status == 404 => {
                    return Err(FetchError::Http { url, status });
                }
                Err(err) if attempt < policy.attempts() => {
                    debug!("Version lookup attempt {} against {} failed: {}", attempt, url, err);
                    attempt += 1;
                    tokio::time::sleep(RETRY_DELAY).await;
                }
                Err(err) => return Err(err),
            }
        };

        let tags: DistTags = serde_json::from_str(&body)?;
        let latest = tags
            .dist_tags
            .get("latest")
            .ok_or_else(|| FetchError::Other(format!("no latest dist-tag at {}", url)))?;

        semver::Version::parse(latest)?;
        Ok(latest.clone())
    }
}

#[async_trait]
impl VersionResolver for RegistryVersionResolver {
    #[instrument(skip(self, policy))]
    async fn resolve(&self, name: &str, policy: FetchPolicy) -> Result<String> {
        let candidates = self
            .registries
            .iter()
            .map(|registry| {
                let url = format!("{}/{}", registry.trim_end_matches('/'), encode_package_name(name));
                Candidate::new(url.clone(), Self::latest_from(self.http.clone(), url, policy))
            })
            .collect();

        let version = race_ok(candidates).await.map_err(|agg| FetchError::VersionLookup {
            name: name.to_string(),
            reason: agg.to_string(),
        })?;

        debug!("Latest version of {} is {}", name, version);
        Ok(version)
    }
}
