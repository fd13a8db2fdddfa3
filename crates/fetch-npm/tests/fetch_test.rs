//! End-to-end fetch tests against mock CDNs and registries.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fetch_npm::process::{CommandOutput, CommandRunner};
use fetch_npm::tarball::{STRATEGY_PACK, STRATEGY_PACKAGE_MANAGER, STRATEGY_REGISTRY};
use fetch_npm::transport::HttpClient;
use fetch_npm::{
    CjsFetcher, Engine, EsmFetcher, ExportScanner, FetchError, FetchPolicy, ModuleExports,
    PackageRequest, ResolutionCache, ResolverConfig, TarballPipeline, UrlRequest, VersionResolver,
};
use httpmock::prelude::*;

const LEFT_PAD: &str = r#""use strict";
function leftPad(str, len, ch) {
  str = String(str);
  ch = ch || " ";
  while (str.length < len) str = ch + str;
  return str;
}
module.exports = { leftPad: leftPad };
"#;

/// Fails every command and counts how often it was asked.
#[derive(Default)]
struct FailingRunner {
    calls: AtomicUsize,
}

#[async_trait]
impl CommandRunner for FailingRunner {
    async fn run(&self, program: &str, _args: &[String], _cwd: Option<&Path>) -> fetch_npm::Result<CommandOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(CommandOutput {
            status: 1,
            stdout: String::new(),
            stderr: format!("{}: not available", program),
        })
    }
}

/// Stands in for a package manager: `view` prints a tarball URL and `pack`
/// writes an archive into its working directory. Anything unset fails.
#[derive(Default)]
struct PackageManagerRunner {
    view_url: Option<String>,
    /// File name and bytes written by `pack`
    archive: Option<(String, Vec<u8>)>,
    /// Leading `pack` calls that exit cleanly without writing anything
    empty_packs: usize,
    pack_dirs: Mutex<Vec<PathBuf>>,
}

impl PackageManagerRunner {
    fn pack_dirs(&self) -> Vec<PathBuf> {
        self.pack_dirs.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandRunner for PackageManagerRunner {
    async fn run(&self, program: &str, args: &[String], cwd: Option<&Path>) -> fetch_npm::Result<CommandOutput> {
        let failed = CommandOutput {
            status: 1,
            stdout: String::new(),
            stderr: format!("{} {}: not available", program, args[0]),
        };

        match args[0].as_str() {
            "view" => Ok(match &self.view_url {
                Some(url) => CommandOutput {
                    status: 0,
                    stdout: format!("{}\n", url),
                    stderr: String::new(),
                },
                None => failed,
            }),
            "pack" => {
                let dir = cwd.expect("pack runs inside the workspace").to_path_buf();
                let call = {
                    let mut dirs = self.pack_dirs.lock().unwrap();
                    dirs.push(dir.clone());
                    dirs.len()
                };
                let Some((file_name, bytes)) = &self.archive else {
                    return Ok(failed);
                };
                if call > self.empty_packs {
                    std::fs::write(dir.join(file_name), bytes).unwrap();
                }
                Ok(CommandOutput {
                    status: 0,
                    stdout: format!("{}\n", file_name),
                    stderr: String::new(),
                })
            }
            _ => Ok(failed),
        }
    }
}

/// Always answers the same version and counts lookups.
struct CountingResolver {
    version: String,
    calls: AtomicUsize,
}

#[async_trait]
impl VersionResolver for CountingResolver {
    async fn resolve(&self, _name: &str, _policy: FetchPolicy) -> fetch_npm::Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.version.clone())
    }
}

fn config(server: &MockServer, temp: &Path) -> ResolverConfig {
    let base = server.base_url();
    ResolverConfig {
        cdn_mirrors: vec![format!("{}/cdn-a", base), format!("{}/cdn-b", base)],
        registry_mirrors: vec![format!("{}/registry", base)],
        esm_sh: format!("{}/esm-sh", base),
        skypack: format!("{}/skypack", base),
        unpkg: format!("{}/unpkg", base),
        jsdelivr: format!("{}/jsdelivr", base),
        temp_root: Some(temp.to_path_buf()),
        retry: 0,
        ..ResolverConfig::default()
    }
}

fn engine_with(
    config: ResolverConfig,
    versions: Arc<dyn VersionResolver>,
    runner: Arc<dyn CommandRunner>,
) -> Arc<Engine> {
    let http = HttpClient::new(&config).unwrap();
    let pipeline = TarballPipeline::new(http.clone(), runner, &config);
    Arc::new(Engine::with_parts(config, http, versions, pipeline))
}

fn policy() -> FetchPolicy {
    FetchPolicy::new(0, Duration::from_secs(2))
}

fn simple_package(name: &str, version: &str) -> Vec<u8> {
    package_tarball(&[
        (
            "package.json",
            &format!(r#"{{"name":"{}","version":"{}","main":"lib/main.js"}}"#, name, version),
        ),
        ("lib/main.js", "exports.hello = function hello() {};"),
    ])
}

/// Regular files left anywhere under `dir`.
fn files_under(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    entries
        .flatten()
        .flat_map(|entry| {
            let path = entry.path();
            if path.is_dir() {
                files_under(&path)
            } else {
                vec![path]
            }
        })
        .collect()
}

/// gzip'd tarball with every file under `package/`.
fn package_tarball(files: &[(&str, &str)]) -> Vec<u8> {
    let encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    let mut builder = tar::Builder::new(encoder);

    for (path, content) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, format!("package/{}", path), content.as_bytes())
            .unwrap();
    }

    let mut encoder = builder.into_inner().unwrap();
    encoder.flush().unwrap();
    encoder.finish().unwrap()
}

#[tokio::test]
async fn test_left_pad_from_mock_cdn() {
    let server = MockServer::start();
    let temp = tempfile::tempdir().unwrap();

    let latest = server.mock(|when, then| {
        when.method(GET).path("/registry/left-pad");
        then.status(200)
            .body(r#"{"name":"left-pad","dist-tags":{"latest":"1.3.0"}}"#);
    });
    let cdn = server.mock(|when, then| {
        when.method(GET).path("/cdn-b/left-pad@1.3.0/dist/index.cjs");
        then.status(200).body(LEFT_PAD);
    });

    let config = config(&server, temp.path());
    let http = HttpClient::new(&config).unwrap();
    let versions = Arc::new(fetch_npm::RegistryVersionResolver::new(
        http,
        config.registry_mirrors.clone(),
    ));
    let engine = engine_with(config, versions, Arc::new(FailingRunner::default()));
    let fetcher = CjsFetcher::new(engine);

    let exports = fetcher
        .fetch(PackageRequest::new("left-pad").policy(policy()))
        .await
        .unwrap();

    assert!(exports.get("leftPad").unwrap().is_callable());
    latest.assert();
    cdn.assert();
}

#[tokio::test]
async fn test_pinned_left_pad_arrow_export() {
    let server = MockServer::start();
    let temp = tempfile::tempdir().unwrap();

    server.mock(|when, then| {
        when.method(GET).path("/cdn-a/left-pad@1.3.0/dist/index.cjs");
        then.status(200).body("module.exports = { leftPad: () => {} }");
    });

    let versions = Arc::new(CountingResolver {
        version: "0.0.1".into(),
        calls: AtomicUsize::new(0),
    });
    let engine = engine_with(
        config(&server, temp.path()),
        versions.clone(),
        Arc::new(FailingRunner::default()),
    );

    let exports = CjsFetcher::new(engine)
        .fetch(PackageRequest::new("left-pad").version("1.3.0").policy(policy()))
        .await
        .unwrap();

    assert_eq!(exports.names().collect::<Vec<_>>(), vec!["leftPad"]);
    assert!(exports.get("leftPad").unwrap().is_callable());
    assert_eq!(versions.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_second_fetch_is_served_from_cache_until_cleared() {
    let server = MockServer::start();
    let temp = tempfile::tempdir().unwrap();

    let cdn = server.mock(|when, then| {
        when.method(GET).path("/cdn-a/left-pad@1.3.0/dist/index.cjs");
        then.status(200).body(LEFT_PAD);
    });

    let versions = Arc::new(CountingResolver {
        version: "1.3.0".into(),
        calls: AtomicUsize::new(0),
    });
    let engine = engine_with(
        config(&server, temp.path()),
        versions,
        Arc::new(FailingRunner::default()),
    );
    let fetcher = CjsFetcher::new(engine);
    let request = PackageRequest::new("left-pad").policy(policy());

    let first = fetcher.fetch(request.clone()).await.unwrap();
    let second = fetcher.fetch(request.clone()).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(cdn.hits(), 1);
    assert_eq!(fetcher.cache().len(), 1);

    fetcher.clear();
    assert!(fetcher.cache().is_empty());

    fetcher.fetch(request).await.unwrap();
    assert_eq!(cdn.hits(), 2);
}

#[tokio::test]
async fn test_every_source_failing_reports_each_cause() {
    let server = MockServer::start();
    let temp = tempfile::tempdir().unwrap();

    let versions = Arc::new(CountingResolver {
        version: "9.9.9".into(),
        calls: AtomicUsize::new(0),
    });
    let runner = Arc::new(FailingRunner::default());
    let engine = engine_with(config(&server, temp.path()), versions, runner.clone());
    let fetcher = CjsFetcher::new(engine);

    // Unmatched requests get a 404 from the mock server
    let err = fetcher
        .fetch(PackageRequest::new("ghost").policy(policy()))
        .await
        .unwrap_err();

    assert!(!err.is_version_lookup());
    let aggregate = err.aggregate().expect("aggregate error");
    assert_eq!(aggregate.len(), 3);
    assert!(aggregate
        .labels()
        .contains(&format!("{}/cdn-a/ghost@9.9.9/dist/index.cjs", server.base_url()).as_str()));

    let Some(FetchError::TarballAcquisition { attempts, last, .. }) = aggregate.failure("tarball")
    else {
        panic!("expected a tarball failure in {}", err);
    };
    assert_eq!(*attempts, 1);
    for strategy in [STRATEGY_REGISTRY, STRATEGY_PACKAGE_MANAGER, STRATEGY_PACK] {
        assert!(last.failure(strategy).is_some(), "missing {} in {}", strategy, last);
    }
    assert_eq!(runner.calls.load(Ordering::SeqCst), 2);
    assert!(fetcher.cache().is_empty());
}

#[tokio::test]
async fn test_url_mode_skips_version_lookup_and_tarballs() {
    let server = MockServer::start();
    let temp = tempfile::tempdir().unwrap();

    let remote = server.mock(|when, then| {
        when.method(GET).path("/files/util.cjs");
        then.status(200).body("exports.answer = 42;\nexports.ask = function () {};\n");
    });

    let versions = Arc::new(CountingResolver {
        version: "1.0.0".into(),
        calls: AtomicUsize::new(0),
    });
    let runner = Arc::new(FailingRunner::default());
    let engine = engine_with(config(&server, temp.path()), versions.clone(), runner.clone());
    let fetcher = CjsFetcher::new(engine);

    let exports = fetcher
        .fetch(UrlRequest::new(server.url("/files/util.cjs")).policy(policy()))
        .await
        .unwrap();

    assert!(exports.get("ask").unwrap().is_callable());
    assert_eq!(
        exports.get("answer"),
        Some(&fetch_npm::ExportValue::Literal(serde_json::json!(42)))
    );
    remote.assert();
    assert_eq!(versions.calls.load(Ordering::SeqCst), 0);
    assert_eq!(runner.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_tarball_pipeline_selects_require_export() {
    let server = MockServer::start();
    let temp = tempfile::tempdir().unwrap();

    let tgz = package_tarball(&[
        (
            "package.json",
            r#"{
                "name": "dual",
                "version": "2.1.0",
                "main": "index.js",
                "exports": {
                    ".": { "import": "./esm/index.mjs", "require": "./cjs/index.cjs" }
                }
            }"#,
        ),
        ("index.js", "module.exports = 'wrong file';"),
        ("esm/index.mjs", "export function greet() {}"),
        ("cjs/index.cjs", "exports.greet = function greet() {};"),
    ]);

    server.mock(|when, then| {
        when.method(GET).path("/registry/dual/2.1.0");
        then.status(200).body(format!(
            r#"{{"name":"dual","version":"2.1.0","dist":{{"tarball":"{}"}}}}"#,
            server.url("/tarballs/dual-2.1.0.tgz")
        ));
    });
    let download = server.mock(|when, then| {
        when.method(GET).path("/tarballs/dual-2.1.0.tgz");
        then.status(200).body(tgz.clone());
    });

    let versions = Arc::new(CountingResolver {
        version: "2.1.0".into(),
        calls: AtomicUsize::new(0),
    });
    let engine = engine_with(
        config(&server, temp.path()),
        versions,
        Arc::new(FailingRunner::default()),
    );

    let script = engine
        .fetch_script(PackageRequest::new("dual").version("2.1.0").policy(policy()))
        .await
        .unwrap();
    assert_eq!(script, "exports.greet = function greet() {};");
    download.assert();

    let exports = CjsFetcher::new(engine)
        .fetch(PackageRequest::new("dual").version("2.1.0").policy(policy()))
        .await
        .unwrap();
    assert!(exports.get("greet").unwrap().is_callable());
}

#[tokio::test]
async fn test_empty_script_has_no_exports() {
    let server = MockServer::start();
    let temp = tempfile::tempdir().unwrap();

    server.mock(|when, then| {
        when.method(GET).path("/files/empty.cjs");
        then.status(200).body("");
    });

    let versions = Arc::new(CountingResolver {
        version: "1.0.0".into(),
        calls: AtomicUsize::new(0),
    });
    let engine = engine_with(
        config(&server, temp.path()),
        versions,
        Arc::new(FailingRunner::default()),
    );

    let exports = CjsFetcher::new(engine)
        .fetch(UrlRequest::new(server.url("/files/empty.cjs")).policy(policy()))
        .await
        .unwrap();
    assert!(exports.is_empty());
}

#[tokio::test]
async fn test_esm_fetcher_prefers_esm_cdn() {
    let server = MockServer::start();
    let temp = tempfile::tempdir().unwrap();

    server.mock(|when, then| {
        when.method(GET).path("/esm-sh/greeter@1.0.0");
        then.status(200)
            .body("export function greet(name) { return `hi ${name}`; }\nexport const version = \"1.0.0\";\n");
    });

    let versions = Arc::new(CountingResolver {
        version: "1.0.0".into(),
        calls: AtomicUsize::new(0),
    });
    let engine = engine_with(
        config(&server, temp.path()),
        versions,
        Arc::new(FailingRunner::default()),
    );

    let exports = EsmFetcher::new(engine)
        .fetch(PackageRequest::new("greeter").policy(policy()))
        .await
        .unwrap();
    assert!(exports.get("greet").unwrap().is_callable());
    assert_eq!(
        exports.get("version"),
        Some(&fetch_npm::ExportValue::Literal(serde_json::json!("1.0.0")))
    );
}

#[tokio::test]
async fn test_esm_fetcher_falls_back_to_commonjs() {
    let server = MockServer::start();
    let temp = tempfile::tempdir().unwrap();

    let mut cjs = server.mock(|when, then| {
        when.method(GET).path("/cdn-a/legacy@3.0.0/dist/index.cjs");
        then.status(200).body("module.exports = { run: () => {} };");
    });

    let versions = Arc::new(CountingResolver {
        version: "3.0.0".into(),
        calls: AtomicUsize::new(0),
    });
    let engine = engine_with(
        config(&server, temp.path()),
        versions,
        Arc::new(FailingRunner::default()),
    );
    let fetcher = EsmFetcher::new(engine);

    let exports = fetcher
        .fetch(PackageRequest::new("legacy").policy(policy()))
        .await
        .unwrap();
    assert!(exports.get("run").unwrap().is_callable());
    cjs.assert();

    fetcher.clear();
    cjs.delete();
    let err = fetcher
        .fetch(PackageRequest::new("legacy").policy(policy()))
        .await
        .unwrap_err();
    assert!(matches!(err, FetchError::EsmFallback { .. }));
    assert!(err.to_string().contains("legacy@3.0.0"));
}

#[tokio::test]
async fn test_configured_retry_applies_when_request_leaves_it_unset() {
    let server = MockServer::start();
    let temp = tempfile::tempdir().unwrap();

    let flaky = server.mock(|when, then| {
        when.method(GET).path("/files/busy.cjs");
        then.status(503);
    });

    let mut config = config(&server, temp.path());
    config.retry = 1;
    config.timeout = 2000;
    let versions = Arc::new(CountingResolver {
        version: "1.0.0".into(),
        calls: AtomicUsize::new(0),
    });
    let engine = engine_with(config, versions, Arc::new(FailingRunner::default()));

    let err = CjsFetcher::new(engine)
        .fetch(UrlRequest::new(server.url("/files/busy.cjs")))
        .await
        .unwrap_err();

    assert!(err.aggregate().is_some());
    flaky.assert_hits(2);
}

#[tokio::test]
async fn test_esm_fetchers_share_a_cache() {
    let server = MockServer::start();
    let temp = tempfile::tempdir().unwrap();

    let esm = server.mock(|when, then| {
        when.method(GET).path("/esm-sh/shared@1.0.0");
        then.status(200).body("export const shared = true;");
    });

    let versions = Arc::new(CountingResolver {
        version: "1.0.0".into(),
        calls: AtomicUsize::new(0),
    });
    let engine = engine_with(
        config(&server, temp.path()),
        versions,
        Arc::new(FailingRunner::default()),
    );

    let cache: ResolutionCache<ModuleExports> = ResolutionCache::new();
    let first = EsmFetcher::with_cache(engine.clone(), Arc::new(ExportScanner), cache.clone());
    let second = EsmFetcher::with_cache(engine, Arc::new(ExportScanner), cache.clone());

    let request = PackageRequest::new("shared").policy(policy());
    let a = first.fetch(request.clone()).await.unwrap();
    let b = second.fetch(request).await.unwrap();

    assert_eq!(a, b);
    assert_eq!(cache.len(), 1);
    esm.assert_hits(1);
}

#[tokio::test]
async fn test_esm_url_mode_failure_is_not_retried_as_commonjs() {
    let server = MockServer::start();
    let temp = tempfile::tempdir().unwrap();

    let missing = server.mock(|when, then| {
        when.method(GET).path("/files/mod.mjs");
        then.status(404);
    });

    let versions = Arc::new(CountingResolver {
        version: "1.0.0".into(),
        calls: AtomicUsize::new(0),
    });
    let runner = Arc::new(FailingRunner::default());
    let engine = engine_with(config(&server, temp.path()), versions, runner.clone());

    let err = EsmFetcher::new(engine)
        .fetch(UrlRequest::new(server.url("/files/mod.mjs")).policy(policy()))
        .await
        .unwrap_err();

    assert!(!matches!(err, FetchError::EsmFallback { .. }), "{}", err);
    assert!(err.aggregate().is_some());
    missing.assert_hits(1);
    assert_eq!(runner.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_star_reexport_module_falls_back_to_commonjs() {
    let server = MockServer::start();
    let temp = tempfile::tempdir().unwrap();

    server.mock(|when, then| {
        when.method(GET).path("/esm-sh/forwarder@1.0.0");
        then.status(200).body("export * from \"/v135/forwarder@1.0.0/es2022/forwarder.mjs\";\n");
    });
    let cjs = server.mock(|when, then| {
        when.method(GET).path("/cdn-a/forwarder@1.0.0/dist/index.cjs");
        then.status(200).body("exports.forward = function () {};");
    });

    let versions = Arc::new(CountingResolver {
        version: "1.0.0".into(),
        calls: AtomicUsize::new(0),
    });
    let engine = engine_with(
        config(&server, temp.path()),
        versions,
        Arc::new(FailingRunner::default()),
    );

    let exports = EsmFetcher::new(engine)
        .fetch(PackageRequest::new("forwarder").policy(policy()))
        .await
        .unwrap();

    assert!(exports.get("forward").unwrap().is_callable());
    cjs.assert();
}

#[tokio::test]
async fn test_package_manager_view_url_is_downloaded() {
    let server = MockServer::start();
    let temp = tempfile::tempdir().unwrap();

    let download = server.mock(|when, then| {
        when.method(GET).path("/tarballs/viewed-1.0.0.tgz");
        then.status(200).body(simple_package("viewed", "1.0.0"));
    });

    let runner = Arc::new(PackageManagerRunner {
        view_url: Some(server.url("/tarballs/viewed-1.0.0.tgz")),
        ..Default::default()
    });
    let config = config(&server, temp.path());
    let http = HttpClient::new(&config).unwrap();
    let pipeline = TarballPipeline::new(http, runner, &config);

    let text = pipeline
        .acquire("viewed", "1.0.0", None, policy())
        .await
        .unwrap();

    assert_eq!(text, "exports.hello = function hello() {};");
    download.assert();
}

#[tokio::test]
async fn test_pack_archive_is_found_in_workspace() {
    let server = MockServer::start();
    let temp = tempfile::tempdir().unwrap();

    let runner = Arc::new(PackageManagerRunner {
        archive: Some(("packed-2.0.0.tgz".into(), simple_package("packed", "2.0.0"))),
        ..Default::default()
    });
    let config = config(&server, temp.path());
    let http = HttpClient::new(&config).unwrap();
    let pipeline = TarballPipeline::new(http, runner.clone(), &config);

    let text = pipeline
        .acquire("packed", "2.0.0", None, policy())
        .await
        .unwrap();

    assert_eq!(text, "exports.hello = function hello() {};");
    let dirs = runner.pack_dirs();
    assert_eq!(dirs.len(), 1);
    assert!(dirs[0].ends_with("pack"));
}

#[tokio::test]
async fn test_pipeline_retries_in_a_fresh_workspace() {
    let server = MockServer::start();
    let temp = tempfile::tempdir().unwrap();

    let runner = Arc::new(PackageManagerRunner {
        archive: Some(("late-1.0.0.tgz".into(), simple_package("late", "1.0.0"))),
        empty_packs: 1,
        ..Default::default()
    });
    let config = config(&server, temp.path());
    let http = HttpClient::new(&config).unwrap();
    let pipeline = TarballPipeline::new(http, runner.clone(), &config);

    let retry_once = FetchPolicy::new(1, Duration::from_secs(2));
    let text = pipeline
        .acquire("late", "1.0.0", None, retry_once)
        .await
        .unwrap();
    assert_eq!(text, "exports.hello = function hello() {};");

    let dirs = runner.pack_dirs();
    assert_eq!(dirs.len(), 2);
    assert_ne!(dirs[0], dirs[1]);
    let isolated = temp.path().join("fetch-npm-isolated");
    assert!(dirs.iter().all(|d| d.starts_with(&isolated)));

    // Without the retry the empty pack is the last word
    let runner = Arc::new(PackageManagerRunner {
        archive: Some(("late-1.0.0.tgz".into(), simple_package("late", "1.0.0"))),
        empty_packs: 1,
        ..Default::default()
    });
    let pipeline = TarballPipeline::new(HttpClient::new(&config).unwrap(), runner, &config);
    let err = pipeline
        .acquire("late", "1.0.0", None, policy())
        .await
        .unwrap_err();
    let FetchError::TarballAcquisition { attempts, last, .. } = err else {
        panic!("expected a tarball failure, got {}", err);
    };
    assert_eq!(attempts, 1);
    assert!(matches!(
        last.failure(STRATEGY_PACK),
        Some(FetchError::TarballNotFound { .. })
    ));
}

#[tokio::test]
async fn test_registry_tarball_with_wrong_shasum_is_rejected() {
    let server = MockServer::start();
    let temp = tempfile::tempdir().unwrap();

    server.mock(|when, then| {
        when.method(GET).path("/registry/tampered/1.0.0");
        then.status(200).body(format!(
            r#"{{"name":"tampered","version":"1.0.0","dist":{{"tarball":"{}","shasum":"deadbeef"}}}}"#,
            server.url("/tarballs/tampered-1.0.0.tgz")
        ));
    });
    let download = server.mock(|when, then| {
        when.method(GET).path("/tarballs/tampered-1.0.0.tgz");
        then.status(200).body(simple_package("tampered", "1.0.0"));
    });

    let config = config(&server, temp.path());
    let http = HttpClient::new(&config).unwrap();
    let pipeline = TarballPipeline::new(http, Arc::new(FailingRunner::default()), &config);

    let err = pipeline
        .acquire("tampered", "1.0.0", None, policy())
        .await
        .unwrap_err();

    download.assert();
    let FetchError::TarballAcquisition { last, .. } = err else {
        panic!("expected a tarball failure, got {}", err);
    };
    match last.failure(STRATEGY_REGISTRY) {
        Some(FetchError::IntegrityMismatch { expected, .. }) => assert_eq!(expected, "deadbeef"),
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_workspace_is_removed_after_success() {
    let server = MockServer::start();
    let temp = tempfile::tempdir().unwrap();

    let runner = Arc::new(PackageManagerRunner {
        archive: Some(("tidy-1.0.0.tgz".into(), simple_package("tidy", "1.0.0"))),
        ..Default::default()
    });
    let config = config(&server, temp.path());
    let http = HttpClient::new(&config).unwrap();
    let pipeline = TarballPipeline::new(http, runner.clone(), &config);

    pipeline.acquire("tidy", "1.0.0", None, policy()).await.unwrap();
    let workspace = runner.pack_dirs()[0].parent().unwrap().to_path_buf();

    // Removal runs on a detached task
    let isolated = temp.path().join("fetch-npm-isolated");
    let mut leftover = files_under(&isolated);
    for _ in 0..40 {
        if leftover.is_empty() && !workspace.exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        leftover = files_under(&isolated);
    }

    assert!(leftover.is_empty(), "left behind: {:?}", leftover);
    assert!(!workspace.exists());
}
