//! Package fetchers.
//!
//! [`Engine`] turns a request into a key and races candidate sources for the
//! text behind it. [`CjsFetcher`] and [`EsmFetcher`] put a module loader and a
//! [`ResolutionCache`] in front of it.

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::cache::ResolutionCache;
use crate::config::ResolverConfig;
use crate::error::{FetchError, Result};
use crate::loader::{ExportScanner, ModuleExports, ModuleFormat, ModuleLoader};
use crate::process::SystemCommandRunner;
use crate::race::{race_ok, Candidate};
use crate::request::{FetchPolicy, ResolutionRequest, ResolvedKey};
use crate::sources::{CandidateBuilder, CandidateSource};
use crate::tarball::TarballPipeline;
use crate::transport::HttpClient;
use crate::version::{RegistryVersionResolver, VersionResolver};

/// Shared resolution machinery.
pub struct Engine {
    config: ResolverConfig,
    http: HttpClient,
    versions: Arc<dyn VersionResolver>,
    pipeline: TarballPipeline,
    sources: CandidateBuilder,
}

impl Engine {
    /// Build an engine with the real registry resolver and package manager.
    pub fn new(config: ResolverConfig) -> Result<Self> {
        config.validate()?;
        let http = HttpClient::new(&config)?;
        let versions = Arc::new(RegistryVersionResolver::new(
            http.clone(),
            config.registry_mirrors.clone(),
        ));
        let pipeline = TarballPipeline::new(http.clone(), Arc::new(SystemCommandRunner), &config);

        Ok(Self::with_parts(config, http, versions, pipeline))
    }

    /// Build an engine from `~/.fetchnpmrc`, `./.fetchnpmrc` and the environment.
    pub fn from_env() -> Result<Self> {
        Self::new(ResolverConfig::load()?)
    }

    pub fn with_parts(
        config: ResolverConfig,
        http: HttpClient,
        versions: Arc<dyn VersionResolver>,
        pipeline: TarballPipeline,
    ) -> Self {
        let sources = CandidateBuilder::new(config.clone());
        Self {
            config,
            http,
            versions,
            pipeline,
            sources,
        }
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Retry and timeout configured for this engine.
    pub fn policy(&self) -> FetchPolicy {
        FetchPolicy::new(self.config.retry, self.config.timeout_duration())
    }

    /// Canonical key for a request. Only package mode without a pinned
    /// version touches the version resolver.
    pub async fn resolve_key(&self, request: &ResolutionRequest) -> Result<ResolvedKey> {
        match request {
            ResolutionRequest::Url(req) => Ok(ResolvedKey::remote(req.remote_uri.clone())),
            ResolutionRequest::Package(req) => {
                let version = match req.version.as_deref().map(str::trim) {
                    Some(version) if !version.is_empty() => version.to_string(),
                    _ => {
                        self.versions
                            .resolve(&req.name, request.policy(self.policy()))
                            .await?
                    }
                };
                Ok(ResolvedKey::package(req.name.clone(), version))
            }
        }
    }

    /// Fetch the CommonJS text for a request, bypassing every cache.
    #[instrument(skip(self, request))]
    pub async fn fetch_script(&self, request: impl Into<ResolutionRequest>) -> Result<String> {
        let request = request.into();
        let key = self.resolve_key(&request).await?;
        self.fetch_text(&key, &request, ModuleFormat::CommonJs).await
    }

    /// Candidates for `key` in the given format.
    pub fn candidates(
        &self,
        key: &ResolvedKey,
        request: &ResolutionRequest,
        format: ModuleFormat,
    ) -> Vec<CandidateSource> {
        let output = output_for(request, format);
        match (key, request) {
            (ResolvedKey::Package { name, version }, ResolutionRequest::Package(req)) => {
                match format {
                    ModuleFormat::CommonJs => {
                        self.sources.package(name, version, &output, req.private_base())
                    }
                    ModuleFormat::Esm => self.sources.esm(name, version, &output, req.private_base()),
                }
            }
            _ => self.sources.remote(&key.to_string()),
        }
    }

    async fn fetch_text(
        &self,
        key: &ResolvedKey,
        request: &ResolutionRequest,
        format: ModuleFormat,
    ) -> Result<String> {
        let sources = self.candidates(key, request, format);
        let output = output_for(request, format);
        debug!("Racing {} candidate(s) for {}", sources.len(), key);

        self.race_sources(sources, &output, request.policy(self.policy()))
            .await
    }

    /// Race `sources` for text. A plain URL candidate is fetched with retries;
    /// a tarball candidate runs the whole pipeline.
    async fn race_sources(
        &self,
        sources: Vec<CandidateSource>,
        output: &str,
        policy: FetchPolicy,
    ) -> Result<String> {
        let candidates = sources
            .into_iter()
            .map(|source| {
                let label = source.label().to_string();
                match source {
                    CandidateSource::Tarball { name, version } => {
                        let pipeline = self.pipeline.clone();
                        let output = output.to_string();
                        Candidate::new(label, async move {
                            pipeline.acquire(&name, &version, Some(&output), policy).await
                        })
                    }
                    CandidateSource::Cdn(url)
                    | CandidateSource::PrivateMirror(url)
                    | CandidateSource::Remote(url) => {
                        let http = self.http.clone();
                        Candidate::new(label, async move { http.get_text(&url, policy).await })
                    }
                }
            })
            .collect();

        Ok(race_ok(candidates).await?)
    }
}

/// Requested output, or the format's default file name.
fn output_for(request: &ResolutionRequest, format: ModuleFormat) -> String {
    request
        .output()
        .map(str::trim)
        .filter(|o| !o.is_empty())
        .unwrap_or(format.default_output())
        .to_string()
}

/// Load `source`, treating blank text as a module with no exports.
fn load_exports(loader: &dyn ModuleLoader, source: &str, format: ModuleFormat) -> Result<ModuleExports> {
    if source.trim().is_empty() {
        return Ok(ModuleExports::new());
    }
    loader.load(source, format)
}

/// Cached CommonJS fetcher.
#[derive(Clone)]
pub struct CjsFetcher {
    engine: Arc<Engine>,
    loader: Arc<dyn ModuleLoader>,
    cache: ResolutionCache<ModuleExports>,
}

impl CjsFetcher {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self::with_loader(engine, Arc::new(ExportScanner))
    }

    pub fn with_loader(engine: Arc<Engine>, loader: Arc<dyn ModuleLoader>) -> Self {
        Self::with_cache(engine, loader, ResolutionCache::new())
    }

    /// Use an existing cache; clones of a cache share entries.
    pub fn with_cache(
        engine: Arc<Engine>,
        loader: Arc<dyn ModuleLoader>,
        cache: ResolutionCache<ModuleExports>,
    ) -> Self {
        Self {
            engine,
            loader,
            cache,
        }
    }

    /// Resolve a request to the exports of its CommonJS entry.
    #[instrument(skip(self, request))]
    pub async fn fetch(&self, request: impl Into<ResolutionRequest>) -> Result<ModuleExports> {
        let request = request.into();
        let key = self.engine.resolve_key(&request).await?;

        if let Some(exports) = self.cache.get(&key) {
            debug!("Cache hit for {}", key);
            return Ok(exports);
        }

        let source = self
            .engine
            .fetch_text(&key, &request, ModuleFormat::CommonJs)
            .await?;
        let exports = load_exports(self.loader.as_ref(), &source, ModuleFormat::CommonJs)?;

        info!("Resolved {} ({} export(s))", key, exports.len());
        self.cache.set(key, exports.clone());
        Ok(exports)
    }

    pub fn cache(&self) -> &ResolutionCache<ModuleExports> {
        &self.cache
    }

    /// Forget every cached module.
    pub fn clear(&self) {
        self.cache.clear();
    }
}

/// Cached ES module fetcher with a CommonJS fallback.
#[derive(Clone)]
pub struct EsmFetcher {
    engine: Arc<Engine>,
    loader: Arc<dyn ModuleLoader>,
    cache: ResolutionCache<ModuleExports>,
}

impl EsmFetcher {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self::with_loader(engine, Arc::new(ExportScanner))
    }

    pub fn with_loader(engine: Arc<Engine>, loader: Arc<dyn ModuleLoader>) -> Self {
        Self::with_cache(engine, loader, ResolutionCache::new())
    }

    /// Use an existing cache; clones of a cache share entries.
    pub fn with_cache(
        engine: Arc<Engine>,
        loader: Arc<dyn ModuleLoader>,
        cache: ResolutionCache<ModuleExports>,
    ) -> Self {
        Self {
            engine,
            loader,
            cache,
        }
    }

    /// Resolve a request to the exports of its ES module entry.
    ///
    /// When every ES module source of a package fails, the CommonJS
    /// candidates are raced with `.mjs` swapped for `.cjs` in the output
    /// name. A remote URL has no alternative to fall back to.
    #[instrument(skip(self, request))]
    pub async fn fetch(&self, request: impl Into<ResolutionRequest>) -> Result<ModuleExports> {
        let request = request.into();
        let key = self.engine.resolve_key(&request).await?;

        if let Some(exports) = self.cache.get(&key) {
            debug!("Cache hit for {}", key);
            return Ok(exports);
        }

        let exports = match self.load(&key, &request, ModuleFormat::Esm).await {
            Ok(exports) => exports,
            Err(esm_err) => {
                let Some(fallback) = commonjs_fallback(&request) else {
                    return Err(esm_err);
                };
                warn!("ES module sources for {} failed, trying CommonJS: {}", key, esm_err);
                self.load(&key, &fallback, ModuleFormat::CommonJs)
                    .await
                    .map_err(|last| FetchError::EsmFallback {
                        key: key.to_string(),
                        last: Box::new(last),
                    })?
            }
        };

        info!("Resolved {} ({} export(s))", key, exports.len());
        self.cache.set(key, exports.clone());
        Ok(exports)
    }

    async fn load(
        &self,
        key: &ResolvedKey,
        request: &ResolutionRequest,
        format: ModuleFormat,
    ) -> Result<ModuleExports> {
        let source = self.engine.fetch_text(key, request, format).await?;
        load_exports(self.loader.as_ref(), &source, format)
    }

    pub fn cache(&self) -> &ResolutionCache<ModuleExports> {
        &self.cache
    }

    /// Forget every cached module.
    pub fn clear(&self) {
        self.cache.clear();
    }
}

/// Same package request, asking for the CommonJS file. `None` in URL mode.
fn commonjs_fallback(request: &ResolutionRequest) -> Option<ResolutionRequest> {
    let ResolutionRequest::Package(req) = request else {
        return None;
    };
    let output = output_for(request, ModuleFormat::Esm).replace(".mjs", ".cjs");
    Some(ResolutionRequest::Package(req.clone().output(output)))
}
