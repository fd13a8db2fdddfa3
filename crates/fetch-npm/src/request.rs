//! Resolution requests and keys.

use std::fmt;
use std::time::Duration;

use serde::Deserialize;

use crate::config::{DEFAULT_RETRY, DEFAULT_TIMEOUT_MS};
use crate::error::{FetchError, Result};

/// Retry and timeout policy applied to every candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchPolicy {
    /// Extra attempts after the first one
    pub retry: u32,
    /// Per-attempt deadline
    pub timeout: Duration,
}

impl FetchPolicy {
    pub fn new(retry: u32, timeout: Duration) -> Self {
        Self { retry, timeout }
    }

    /// Total number of attempts this policy allows.
    pub fn attempts(&self) -> u32 {
        self.retry.saturating_add(1)
    }

    /// Fill the fields a request left unset from `defaults`.
    fn or(retry: Option<u32>, timeout: Option<Duration>, defaults: FetchPolicy) -> Self {
        Self {
            retry: retry.unwrap_or(defaults.retry),
            timeout: timeout.unwrap_or(defaults.timeout),
        }
    }
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            retry: DEFAULT_RETRY,
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
        }
    }
}

/// Fetch a package by name.
///
/// `retry` and `timeout` left unset fall back to the engine's configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageRequest {
    pub name: String,
    pub version: Option<String>,
    pub output: Option<String>,
    pub private_resource: Option<String>,
    pub retry: Option<u32>,
    pub timeout: Option<Duration>,
}

impl PackageRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
            output: None,
            private_resource: None,
            retry: None,
            timeout: None,
        }
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }

    pub fn private_resource(mut self, base: impl Into<String>) -> Self {
        self.private_resource = Some(base.into());
        self
    }

    pub fn retry(mut self, retry: u32) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Pin both retry and timeout.
    pub fn policy(self, policy: FetchPolicy) -> Self {
        self.retry(policy.retry).timeout(policy.timeout)
    }

    /// Private mirror base, if set and non-blank.
    pub fn private_base(&self) -> Option<&str> {
        self.private_resource
            .as_deref()
            .map(|s| s.trim().trim_end_matches('/'))
            .filter(|s| !s.is_empty())
    }
}

/// Fetch an explicit remote location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlRequest {
    pub remote_uri: String,
    pub output: Option<String>,
    pub retry: Option<u32>,
    pub timeout: Option<Duration>,
}

impl UrlRequest {
    pub fn new(remote_uri: impl Into<String>) -> Self {
        Self {
            remote_uri: remote_uri.into(),
            output: None,
            retry: None,
            timeout: None,
        }
    }

    pub fn output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }

    pub fn retry(mut self, retry: u32) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Pin both retry and timeout.
    pub fn policy(self, policy: FetchPolicy) -> Self {
        self.retry(policy.retry).timeout(policy.timeout)
    }
}

/// What to resolve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionRequest {
    Package(PackageRequest),
    Url(UrlRequest),
}

impl ResolutionRequest {
    /// Effective policy, taking unset fields from `defaults`.
    pub fn policy(&self, defaults: FetchPolicy) -> FetchPolicy {
        match self {
            ResolutionRequest::Package(req) => FetchPolicy::or(req.retry, req.timeout, defaults),
            ResolutionRequest::Url(req) => FetchPolicy::or(req.retry, req.timeout, defaults),
        }
    }

    pub fn output(&self) -> Option<&str> {
        match self {
            ResolutionRequest::Package(req) => req.output.as_deref(),
            ResolutionRequest::Url(req) => req.output.as_deref(),
        }
    }
}

impl From<PackageRequest> for ResolutionRequest {
    fn from(req: PackageRequest) -> Self {
        ResolutionRequest::Package(req)
    }
}

impl From<UrlRequest> for ResolutionRequest {
    fn from(req: UrlRequest) -> Self {
        ResolutionRequest::Url(req)
    }
}

/// Loose options bag as accepted from JSON callers.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchOptions {
    pub name: Option<String>,
    pub remote_uri: Option<String>,
    pub version: Option<String>,
    pub output: Option<String>,
    pub private_resource: Option<String>,
    pub retry: Option<u32>,
    /// Milliseconds
    pub timeout: Option<u64>,
}

impl TryFrom<FetchOptions> for ResolutionRequest {
    type Error = FetchError;

    fn try_from(opts: FetchOptions) -> Result<Self> {
        let timeout = opts.timeout.map(Duration::from_millis);

        let name = opts.name.filter(|n| !n.trim().is_empty());
        let remote_uri = opts.remote_uri.filter(|u| !u.trim().is_empty());

        match (name, remote_uri) {
            (Some(_), Some(_)) => Err(FetchError::InvalidRequest(
                "name and remoteUri are mutually exclusive".into(),
            )),
            (None, None) => Err(FetchError::InvalidRequest(
                "either name or remoteUri is required".into(),
            )),
            (None, Some(remote_uri)) => Ok(ResolutionRequest::Url(UrlRequest {
                remote_uri,
                output: opts.output,
                retry: opts.retry,
                timeout,
            })),
            (Some(name), None) => Ok(ResolutionRequest::Package(PackageRequest {
                name,
                version: opts.version.filter(|v| !v.trim().is_empty()),
                output: opts.output,
                private_resource: opts.private_resource,
                retry: opts.retry,
                timeout,
            })),
        }
    }
}

/// Canonical cache key for a request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResolvedKey {
    /// `name@version`
    Package { name: String, version: String },
    /// Remote URI, verbatim
    Remote(String),
}

impl ResolvedKey {
    pub fn package(name: impl Into<String>, version: impl Into<String>) -> Self {
        ResolvedKey::Package {
            name: name.into(),
            version: version.into(),
        }
    }

    pub fn remote(uri: impl Into<String>) -> Self {
        ResolvedKey::Remote(uri.into())
    }
}

impl fmt::Display for ResolvedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolvedKey::Package { name, version } => write!(f, "{}@{}", name, version),
            ResolvedKey::Remote(uri) => f.write_str(uri),
        }
    }
}

/// `@scope/pkg@1.0.0` -> `scope-pkg-1.0.0`
pub(crate) fn sanitize(spec: &str) -> String {
    spec.strip_prefix('@')
        .unwrap_or(spec)
        .replace(['/', '@'], "-")
}
