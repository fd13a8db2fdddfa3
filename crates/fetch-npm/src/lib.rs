//! # fetch-npm
//!
//! Resolve an npm package, or an explicit remote URL, to the source text of
//! its entry module and hand it to a pluggable module loader.
//!
//! A package request is answered by racing every configured CDN mirror, an
//! optional private mirror, and a tarball pipeline that downloads and unpacks
//! the package itself. The first source to produce text wins; the rest are
//! left to finish in the background. Results are cached per
//! `name@version` (or per URL) until cleared.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use fetch_npm::{CjsFetcher, Engine, PackageRequest};
//!
//! #[tokio::main]
//! async fn main() -> fetch_npm::Result<()> {
//!     let engine = Arc::new(Engine::from_env()?);
//!     let request = PackageRequest::new("left-pad").policy(engine.policy());
//!     let fetcher = CjsFetcher::new(engine);
//!
//!     let exports = fetcher.fetch(request).await?;
//!     assert!(exports.get("leftPad").is_some_and(|e| e.is_callable()));
//!     Ok(())
//! }
//! ```
//!
//! ## Strategies
//!
//! - CDN mirrors: `{base}/{name}@{version}/dist/{output}`
//! - Private mirror: same shape, when configured per request
//! - Tarball pipeline: registry metadata, `npm view`, or `npm pack`, raced
//!   against each other and retried with a fresh temp workspace
//!
//! [`EsmFetcher`] adds the ES module CDNs and falls back to the CommonJS
//! strategies when none of them answer.

#![warn(clippy::all)]

pub mod cache;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod integrity;
pub mod loader;
pub mod manifest;
pub mod process;
pub mod race;
pub mod request;
pub mod sources;
pub mod tarball;
pub mod transport;
pub mod version;
pub mod workspace;

// Re-exports
pub use cache::ResolutionCache;
pub use config::ResolverConfig;
pub use error::{AggregateError, CandidateFailure, FetchError, Result};
pub use fetcher::{CjsFetcher, Engine, EsmFetcher};
pub use loader::{ExportScanner, ExportValue, ModuleExports, ModuleFormat, ModuleLoader, RawSourceLoader};
pub use request::{FetchOptions, FetchPolicy, PackageRequest, ResolutionRequest, ResolvedKey, UrlRequest};
pub use sources::CandidateSource;
pub use tarball::TarballPipeline;
pub use version::{RegistryVersionResolver, VersionResolver};

/// Version of fetch-npm
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
