//! Error types for fetch-npm.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Result type for fetch-npm operations.
pub type Result<T> = std::result::Result<T, FetchError>;

/// Main error type for fetch-npm.
#[derive(Error, Debug)]
pub enum FetchError {
    /// The latest version of a package could not be determined
    #[error("Failed to get the latest version of {name}: {reason}")]
    VersionLookup { name: String, reason: String },

    /// A single racing candidate failed
    #[error("{candidate}: {reason}")]
    CandidateFetch { candidate: String, reason: String },

    /// Every tarball strategy failed on every attempt
    #[error("Failed to acquire a tarball for {package} after {attempts} attempt(s): {last}")]
    TarballAcquisition {
        package: String,
        attempts: u32,
        last: AggregateError,
    },

    /// The archive could not be unpacked
    #[error("Failed to extract {path}: {reason}")]
    Extraction { path: PathBuf, reason: String },

    /// The selected entry point is missing or unreadable
    #[error("Failed to read entry point {path}: {source}")]
    EntryPointRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Every candidate of a race failed
    #[error(transparent)]
    AggregateRace(#[from] AggregateError),

    /// Neither the ESM sources nor the CommonJS fallback produced a module
    #[error("Failed to load {key} as ESM. All sources failed. Last error: {last}")]
    EsmFallback { key: String, last: Box<FetchError> },

    /// Network error
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Non-success HTTP status
    #[error("HTTP {status} for {url}")]
    Http { url: String, status: u16 },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// JSON5 parsing error
    #[error("JSON5 error: {0}")]
    Json5(String),

    /// Semver parsing error
    #[error("Invalid version: {0}")]
    Semver(#[from] semver::Error),

    /// External command exited unsuccessfully
    #[error("Command '{command}' failed with exit code {code}: {output}")]
    CommandFailed {
        command: String,
        code: i32,
        output: String,
    },

    /// A strategy resolved a blank tarball URL
    #[error("Empty tarball URL for {0}")]
    EmptyTarballUrl(String),

    /// `pack` finished without leaving a matching tarball behind
    #[error("No tarball found for {package} in {dir}")]
    TarballNotFound { package: String, dir: PathBuf },

    /// Integrity check failed
    #[error("Integrity check failed for {package}: expected {expected}, got {actual}")]
    IntegrityMismatch {
        package: String,
        expected: String,
        actual: String,
    },

    /// A candidate or command ran past its deadline
    #[error("Timed out after {0} ms")]
    Timeout(u64),

    /// Malformed caller request
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The module loader rejected the source
    #[error("Failed to load module: {0}")]
    ModuleLoad(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// General error with message
    #[error("{0}")]
    Other(String),
}

impl FetchError {
    /// Whether this error came from version discovery rather than content acquisition.
    pub fn is_version_lookup(&self) -> bool {
        matches!(self, FetchError::VersionLookup { .. })
    }

    /// The aggregate carried by this error, if any.
    pub fn aggregate(&self) -> Option<&AggregateError> {
        match self {
            FetchError::AggregateRace(agg) => Some(agg),
            FetchError::TarballAcquisition { last, .. } => Some(last),
            _ => None,
        }
    }
}

impl From<anyhow::Error> for FetchError {
    fn from(err: anyhow::Error) -> Self {
        FetchError::Other(err.to_string())
    }
}

impl From<&str> for FetchError {
    fn from(s: &str) -> Self {
        FetchError::Other(s.to_string())
    }
}

impl From<String> for FetchError {
    fn from(s: String) -> Self {
        FetchError::Other(s)
    }
}

/// One failed candidate inside an [`AggregateError`].
#[derive(Debug)]
pub struct CandidateFailure {
    /// Candidate label (usually a URL or strategy name)
    pub label: String,
    /// Why it failed
    pub error: FetchError,
}

/// Every candidate of a race failed. Failures are kept in completion order.
#[derive(Debug, Default)]
pub struct AggregateError {
    pub failures: Vec<CandidateFailure>,
}

impl AggregateError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, label: impl Into<String>, error: FetchError) {
        self.failures.push(CandidateFailure {
            label: label.into(),
            error,
        });
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    /// Labels of the failed candidates.
    pub fn labels(&self) -> Vec<&str> {
        self.failures.iter().map(|f| f.label.as_str()).collect()
    }

    /// Look up the failure recorded for a label.
    pub fn failure(&self, label: &str) -> Option<&FetchError> {
        self.failures
            .iter()
            .find(|f| f.label == label)
            .map(|f| &f.error)
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.failures.is_empty() {
            return write!(f, "All candidates failed: no candidates were submitted");
        }
        write!(f, "All {} candidates failed:", self.failures.len())?;
        for failure in &self.failures {
            write!(f, " [{}: {}]", failure.label, failure.error)?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateError {}
