//! Candidate sources for a resolved key.

use std::collections::HashSet;

use crate::config::ResolverConfig;

/// Label of the tarball pipeline candidate.
pub const TARBALL_LABEL: &str = "tarball";

/// One independently pursuable way to obtain content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CandidateSource {
    /// Public CDN URL
    Cdn(String),
    /// Caller-supplied mirror URL
    PrivateMirror(String),
    /// Download and unpack the package tarball
    Tarball { name: String, version: String },
    /// Explicit remote location
    Remote(String),
}

impl CandidateSource {
    /// Name used in logs and aggregate errors.
    pub fn label(&self) -> &str {
        match self {
            CandidateSource::Cdn(url)
            | CandidateSource::PrivateMirror(url)
            | CandidateSource::Remote(url) => url,
            CandidateSource::Tarball { .. } => TARBALL_LABEL,
        }
    }
}

/// Builds candidate lists from the configured mirrors.
#[derive(Debug, Clone)]
pub struct CandidateBuilder {
    config: ResolverConfig,
}

impl CandidateBuilder {
    pub fn new(config: ResolverConfig) -> Self {
        Self { config }
    }

    /// Every CDN dist path, the private mirror when set, and one tarball candidate.
    pub fn package(
        &self,
        name: &str,
        version: &str,
        output: &str,
        private_base: Option<&str>,
    ) -> Vec<CandidateSource> {
        let key = format!("{}@{}", name, version);

        let mut candidates: Vec<CandidateSource> = self
            .config
            .cdn_mirrors
            .iter()
            .map(|base| CandidateSource::Cdn(dist_url(base, &key, output)))
            .collect();

        candidates.push(CandidateSource::Tarball {
            name: name.to_string(),
            version: version.to_string(),
        });

        if let Some(base) = private_base {
            candidates.push(CandidateSource::PrivateMirror(dist_url(base, &key, output)));
        }

        candidates
    }

    /// ES module URLs across the ESM-aware CDNs, without a tarball candidate.
    pub fn esm(
        &self,
        name: &str,
        version: &str,
        output: &str,
        private_base: Option<&str>,
    ) -> Vec<CandidateSource> {
        let key = format!("{}@{}", name, version);
        let c = &self.config;

        let mut urls = vec![
            format!("{}/{}", c.esm_sh, key),
            format!("{}/{}", c.skypack, key),
            format!("{}/{}?module", c.unpkg, key),
        ];
        for base in [&c.unpkg, &c.jsdelivr] {
            if base == &c.jsdelivr {
                urls.push(format!("{}/{}/+esm", base, key));
            }
            for path in [output, "index.mjs", "index.esm.js"] {
                urls.push(dist_url(base, &key, path));
            }
            urls.push(format!("{}/{}/esm/index.js", base, key));
        }

        let mut seen = HashSet::new();
        let mut candidates: Vec<CandidateSource> = urls
            .into_iter()
            .filter(|url| seen.insert(url.clone()))
            .map(CandidateSource::Cdn)
            .collect();

        if let Some(base) = private_base {
            candidates.push(CandidateSource::PrivateMirror(dist_url(base, &key, output)));
        }

        // Some packages point `main` straight at an ES module
        for base in [&c.unpkg, &c.jsdelivr] {
            let url = format!("{}/{}", base, key);
            if seen.insert(url.clone()) {
                candidates.push(CandidateSource::Cdn(url));
            }
        }

        candidates
    }

    /// A direct URL is its own and only candidate.
    pub fn remote(&self, remote_uri: &str) -> Vec<CandidateSource> {
        vec![CandidateSource::Remote(remote_uri.to_string())]
    }
}

/// `{base}/{name}@{version}/dist/{output}`
pub fn dist_url(base: &str, key: &str, output: &str) -> String {
    format!("{}/{}/dist/{}", base.trim_end_matches('/'), key, output)
}
