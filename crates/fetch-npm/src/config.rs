//! Configuration management for fetch-npm.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{FetchError, Result};

/// Public CDN bases serving `{base}/{name}@{version}/dist/{output}`.
pub const DEFAULT_CDN_MIRRORS: &[&str] = &[
    "https://cdn.jsdelivr.net/npm",
    "https://unpkg.com",
    "https://registry.npmmirror.com",
    "https://registry.npmjs.org",
    "https://r.cnpmjs.org",
];

/// Registries queried for package metadata.
pub const DEFAULT_REGISTRY_MIRRORS: &[&str] = &[
    "https://registry.npmjs.org",
    "https://registry.yarnpkg.com",
    "https://mirrors.cloud.tencent.com/npm",
];

pub const DEFAULT_ESM_SH: &str = "https://esm.sh";
pub const DEFAULT_SKYPACK: &str = "https://cdn.skypack.dev";
pub const DEFAULT_UNPKG: &str = "https://unpkg.com";
pub const DEFAULT_JSDELIVR: &str = "https://cdn.jsdelivr.net/npm";

pub const DEFAULT_RETRY: u32 = 3;
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

/// Name of the rc file looked up in the home and current directories.
const RC_FILE: &str = ".fetchnpmrc";

/// Prefix for environment overrides.
const ENV_PREFIX: &str = "FETCH_NPM_";

/// Configuration for a resolution engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// CDN bases raced for `dist/{output}` files
    pub cdn_mirrors: Vec<String>,

    /// Registries raced for metadata and latest versions
    pub registry_mirrors: Vec<String>,

    /// esm.sh-compatible base
    pub esm_sh: String,

    /// Skypack-compatible base
    pub skypack: String,

    /// unpkg-compatible base
    pub unpkg: String,

    /// jsDelivr-compatible base
    pub jsdelivr: String,

    /// Package manager invoked for `view` and `pack`
    pub package_manager: String,

    /// Root under which per-attempt workspaces are created
    pub temp_root: Option<PathBuf>,

    /// Default retry budget
    pub retry: u32,

    /// Default per-attempt timeout in milliseconds
    pub timeout: u64,

    /// User agent sent with every request
    pub user_agent: String,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            cdn_mirrors: DEFAULT_CDN_MIRRORS.iter().map(|s| s.to_string()).collect(),
            registry_mirrors: DEFAULT_REGISTRY_MIRRORS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            esm_sh: DEFAULT_ESM_SH.to_string(),
            skypack: DEFAULT_SKYPACK.to_string(),
            unpkg: DEFAULT_UNPKG.to_string(),
            jsdelivr: DEFAULT_JSDELIVR.to_string(),
            package_manager: "npm".to_string(),
            temp_root: None,
            retry: DEFAULT_RETRY,
            timeout: DEFAULT_TIMEOUT_MS,
            user_agent: format!("fetch-npm/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl ResolverConfig {
    /// Load configuration from default locations.
    pub fn load() -> Result<Self> {
        let mut config = ResolverConfig::default();

        if let Some(user_rc) = user_config_path() {
            if user_rc.exists() {
                config.merge_from_file(&user_rc)?;
            }
        }

        let project_rc = PathBuf::from(RC_FILE);
        if project_rc.exists() {
            config.merge_from_file(&project_rc)?;
        }

        config.load_from_env();
        config.validate()?;

        Ok(config)
    }

    /// Merge configuration from an rc file.
    pub fn merge_from_file(&mut self, path: &Path) -> Result<()> {
        let content = std::fs::read_to_string(path)?;
        self.merge_from_str(&content);
        Ok(())
    }

    /// Merge `key=value` lines.
    pub fn merge_from_str(&mut self, content: &str) {
        for line in content.lines() {
            let line = line.trim();

            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if let Some((key, value)) = line.split_once('=') {
                self.set(key.trim(), value.trim());
            }
        }
    }

    /// Load configuration from `FETCH_NPM_*` environment variables.
    fn load_from_env(&mut self) {
        for (key, value) in std::env::vars() {
            if let Some(config_key) = key.strip_prefix(ENV_PREFIX) {
                let config_key = config_key.to_lowercase().replace('_', "-");
                self.set(&config_key, &value);
            }
        }
    }

    /// Set a configuration value. Unknown keys are ignored.
    pub fn set(&mut self, key: &str, value: &str) {
        match key {
            "cdn-mirrors" => self.cdn_mirrors = split_list(value),
            "registry-mirrors" => self.registry_mirrors = split_list(value),
            "esm-sh" => self.esm_sh = trim_base(value),
            "skypack" => self.skypack = trim_base(value),
            "unpkg" => self.unpkg = trim_base(value),
            "jsdelivr" => self.jsdelivr = trim_base(value),
            "package-manager" => self.package_manager = value.to_string(),
            "temp-root" => self.temp_root = Some(PathBuf::from(value)),
            "retry" => {
                if let Ok(n) = value.parse() {
                    self.retry = n;
                }
            }
            "timeout" => {
                if let Ok(n) = value.parse() {
                    self.timeout = n;
                }
            }
            "user-agent" => self.user_agent = value.to_string(),
            _ => {}
        }
    }

    /// Get a configuration value.
    pub fn get(&self, key: &str) -> Option<String> {
        match key {
            "cdn-mirrors" => Some(self.cdn_mirrors.join(",")),
            "registry-mirrors" => Some(self.registry_mirrors.join(",")),
            "esm-sh" => Some(self.esm_sh.clone()),
            "skypack" => Some(self.skypack.clone()),
            "unpkg" => Some(self.unpkg.clone()),
            "jsdelivr" => Some(self.jsdelivr.clone()),
            "package-manager" => Some(self.package_manager.clone()),
            "temp-root" => self.temp_root.as_ref().map(|p| p.display().to_string()),
            "retry" => Some(self.retry.to_string()),
            "timeout" => Some(self.timeout.to_string()),
            "user-agent" => Some(self.user_agent.clone()),
            _ => None,
        }
    }

    /// Reject configurations the engine cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.package_manager.trim().is_empty() {
            return Err(FetchError::Config("package-manager must not be empty".into()));
        }
        for base in self.cdn_mirrors.iter().chain(&self.registry_mirrors) {
            url::Url::parse(base)
                .map_err(|e| FetchError::Config(format!("invalid mirror '{}': {}", base, e)))?;
        }
        Ok(())
    }

    /// Root directory for temp workspaces.
    pub fn temp_root(&self) -> PathBuf {
        self.temp_root.clone().unwrap_or_else(std::env::temp_dir)
    }

    /// Default timeout as a [`Duration`].
    pub fn timeout_duration(&self) -> Duration {
        Duration::from_millis(self.timeout)
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(trim_base)
        .filter(|s| !s.is_empty())
        .collect()
}

fn trim_base(value: &str) -> String {
    value.trim().trim_end_matches('/').to_string()
}

/// Get the user config path.
fn user_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(RC_FILE))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ResolverConfig::default();
        assert_eq!(config.retry, 3);
        assert_eq!(config.timeout, 5000);
        assert_eq!(config.cdn_mirrors.len(), 5);
        assert_eq!(config.registry_mirrors.len(), 3);
        assert_eq!(config.package_manager, "npm");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_merge_rc_lines() {
        let mut config = ResolverConfig::default();
        config.merge_from_str(
            "# mirrors\n\
             cdn-mirrors = https://a.example/npm/, https://b.example\n\
             ; comment\n\
             retry=1\n\
             timeout=abc\n\
             package-manager=pnpm\n",
        );

        assert_eq!(
            config.cdn_mirrors,
            vec!["https://a.example/npm", "https://b.example"]
        );
        assert_eq!(config.retry, 1);
        assert_eq!(config.timeout, DEFAULT_TIMEOUT_MS);
        assert_eq!(config.get("package-manager").as_deref(), Some("pnpm"));
    }

    #[test]
    fn test_validate_rejects_bad_mirror() {
        let mut config = ResolverConfig::default();
        config.set("registry-mirrors", "not a url");
        assert!(matches!(config.validate(), Err(FetchError::Config(_))));
    }
}
