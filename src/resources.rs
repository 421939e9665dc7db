//! Platform-specific registration engine bundles: registry, resolution and idempotent fetch.

use anyhow::{anyhow, Context, Result};
use colored::*;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::download::{executable_name, extract_archive, set_permissions, BinaryDownloader};
use crate::error::PipelineError;

pub const GREEDY_COMPONENT: &str = "greedy";
pub const DEFAULT_REGISTRY_BASE_URL: &str =
    "https://greedy.s3.eu.cloud-object-storage.appdomain.cloud";

/// Platforms a greedy bundle is published for.
const GREEDY_PLATFORMS: [(&str, &str); 4] = [
    ("windows", "x86_64"),
    ("linux", "x86_64"),
    ("mac", "x86_64"),
    ("mac", "arm64"),
];

/// Normalized (OS, architecture) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    pub os: String,
    pub arch: String,
}

impl Platform {
    /// Maps raw OS/architecture names onto the registry vocabulary.
    ///
    /// OS: `darwin`/`macos` → `mac`, `linux`, `windows`. Arch: `x86_64`/`amd64` → `x86_64`,
    /// `aarch64` or anything containing `arm` → `arm64`.
    pub fn normalize(os: &str, arch: &str) -> Result<Self, PipelineError> {
        let unsupported = || PipelineError::UnsupportedPlatform {
            os: os.to_string(),
            arch: arch.to_string(),
        };

        let os_lower = os.trim().to_lowercase();
        let norm_os = match os_lower.as_str() {
            "darwin" | "macos" | "mac" => "mac",
            "linux" => "linux",
            "windows" => "windows",
            _ => return Err(unsupported()),
        };

        let arch_lower = arch.trim().to_lowercase();
        let norm_arch = match arch_lower.as_str() {
            "x86_64" | "amd64" => "x86_64",
            "aarch64" => "arm64",
            a if a.contains("arm") => "arm64",
            _ => return Err(unsupported()),
        };

        Ok(Self {
            os: norm_os.to_string(),
            arch: norm_arch.to_string(),
        })
    }

    pub fn current() -> Result<Self, PipelineError> {
        Self::normalize(std::env::consts::OS, std::env::consts::ARCH)
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.os, self.arch)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct BinaryKey {
    pub component: String,
    pub os: String,
    pub arch: String,
}

impl BinaryKey {
    pub fn new(component: &str, platform: &Platform) -> Self {
        Self {
            component: component.to_string(),
            os: platform.os.clone(),
            arch: platform.arch.clone(),
        }
    }
}

impl fmt::Display for BinaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.component, self.os, self.arch)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryRecord {
    pub url: String,
    pub archive_name: String,
    pub directory_name: String,
}

/// Immutable lookup of downloadable bundles.
#[derive(Debug, Clone)]
pub struct BinaryRegistry {
    records: BTreeMap<BinaryKey, BinaryRecord>,
}

impl BinaryRegistry {
    /// Greedy bundles for every published platform, served from `base_url`.
    pub fn with_base_url(base_url: &str) -> Self {
        let base = base_url.trim_end_matches('/');
        let records = GREEDY_PLATFORMS
            .iter()
            .map(|(os, arch)| {
                let key = BinaryKey {
                    component: GREEDY_COMPONENT.to_string(),
                    os: os.to_string(),
                    arch: arch.to_string(),
                };
                let name = key.to_string();
                let record = BinaryRecord {
                    url: format!("{}/{}.zip", base, name),
                    archive_name: format!("{}.zip", name),
                    directory_name: name,
                };
                (key, record)
            })
            .collect();
        Self { records }
    }

    pub fn lookup(&self, component: &str, platform: &Platform) -> Result<&BinaryRecord, PipelineError> {
        self.records
            .get(&BinaryKey::new(component, platform))
            .ok_or_else(|| PipelineError::UnsupportedPlatform {
                os: platform.os.clone(),
                arch: platform.arch.clone(),
            })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }
}

impl Default for BinaryRegistry {
    fn default() -> Self {
        Self::with_base_url(DEFAULT_REGISTRY_BASE_URL)
    }
}

/// Resolves the bundle for a platform and makes sure it is present under `binary_dir`.
pub struct ResourceResolver<'a> {
    registry: &'a BinaryRegistry,
    binary_dir: PathBuf,
}

impl<'a> ResourceResolver<'a> {
    pub fn new(registry: &'a BinaryRegistry, binary_dir: impl Into<PathBuf>) -> Self {
        Self {
            registry,
            binary_dir: binary_dir.into(),
        }
    }

    /// Returns the extracted bundle directory for the given OS/arch.
    ///
    /// A bundle directory holding the executable is returned as is without touching the network.
    /// Otherwise the archive is downloaded and extracted into a staging directory, which only
    /// replaces the bundle directory once the executable is in place. The archive and any
    /// partial extraction are removed whether or not this succeeds.
    pub async fn resolve_and_fetch(&self, os: &str, arch: &str) -> Result<PathBuf> {
        let platform = Platform::normalize(os, arch)?;
        let record = self.registry.lookup(GREEDY_COMPONENT, &platform)?;
        let directory = self.binary_dir.join(&record.directory_name);

        if executable_path(&directory, &platform).is_file() {
            println!(
                "{} A local instance of the registration binaries has been detected",
                "✓".green()
            );
            tracing::info!("Registration binaries found at {}", directory.display());
            return Ok(directory);
        }
        if directory.exists() {
            tracing::warn!(
                "{} has no registration executable; fetching the bundle again",
                directory.display()
            );
            std::fs::remove_dir_all(&directory)
                .with_context(|| format!("Failed to remove {}", directory.display()))?;
        }

        tracing::info!("Downloading {} from {}", record.directory_name, record.url);
        std::fs::create_dir_all(&self.binary_dir)
            .with_context(|| format!("Failed to create {}", self.binary_dir.display()))?;

        let archive = self.binary_dir.join(&record.archive_name);
        let staging = self.binary_dir.join(format!(".{}.partial", record.directory_name));
        let result = self.fetch_into(record, &platform, &archive, &staging).await;

        if archive.exists() {
            if let Err(e) = std::fs::remove_file(&archive) {
                tracing::warn!("Could not remove {}: {}", archive.display(), e);
            }
        }
        if staging.exists() {
            if let Err(e) = std::fs::remove_dir_all(&staging) {
                tracing::warn!("Could not remove {}: {}", staging.display(), e);
            }
        }

        match result {
            Ok(()) => {
                println!("{} Registration binaries - download complete", "✓".green());
                tracing::info!("Registration binaries - download complete");
                Ok(directory)
            }
            Err(e) => {
                tracing::error!("Fetching {} failed: {:#}", record.directory_name, e);
                Err(e)
            }
        }
    }

    async fn fetch_into(
        &self,
        record: &BinaryRecord,
        platform: &Platform,
        archive: &Path,
        staging: &Path,
    ) -> Result<()> {
        BinaryDownloader::new()?.download(&record.url, archive).await?;

        let archive = archive.to_path_buf();
        let staging = staging.to_path_buf();
        let bundle_name = record.directory_name.clone();
        let target = self.binary_dir.join(&record.directory_name);
        let platform = platform.clone();

        tokio::task::spawn_blocking(move || install_bundle(&archive, &staging, &bundle_name, &target, &platform))
            .await
            .context("Extraction task panicked")?
    }

    pub async fn resolve_current(&self) -> Result<PathBuf> {
        self.resolve_and_fetch(std::env::consts::OS, std::env::consts::ARCH)
            .await
    }
}

/// Extracts `archive` into a fresh `staging` directory, checks for the executable, makes it
/// runnable and moves `{staging}/{bundle_name}` to `target`.
fn install_bundle(
    archive: &Path,
    staging: &Path,
    bundle_name: &str,
    target: &Path,
    platform: &Platform,
) -> Result<()> {
    if staging.exists() {
        std::fs::remove_dir_all(staging)
            .with_context(|| format!("Failed to clear {}", staging.display()))?;
    }
    std::fs::create_dir_all(staging)
        .with_context(|| format!("Failed to create {}", staging.display()))?;

    extract_archive(archive, staging)?;
    let extracted = staging.join(bundle_name);
    let exe = executable_path(&extracted, platform);
    if !exe.is_file() {
        return Err(anyhow!(
            "Bundle {} does not contain {}",
            archive.display(),
            executable_name(&platform.os)
        ));
    }
    set_permissions(&exe)?;

    std::fs::rename(&extracted, target)
        .with_context(|| format!("Failed to move {} to {}", extracted.display(), target.display()))?;
    tracing::info!("{} extracted", bundle_name);
    Ok(())
}

/// Path of the registration engine executable inside an extracted bundle.
pub fn executable_path(bundle_dir: &Path, platform: &Platform) -> PathBuf {
    bundle_dir.join(executable_name(&platform.os))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_platform_names() {
        let p = Platform::normalize("Darwin", "arm64").unwrap();
        assert_eq!((p.os.as_str(), p.arch.as_str()), ("mac", "arm64"));

        let p = Platform::normalize("linux", "AMD64").unwrap();
        assert_eq!(p.to_string(), "linux-x86_64");

        let p = Platform::normalize("macos", "aarch64").unwrap();
        assert_eq!(p.to_string(), "mac-arm64");
    }

    #[test]
    fn test_unknown_arch_is_unsupported() {
        let err = Platform::normalize("linux", "sparc").unwrap_err();
        assert!(matches!(err, PipelineError::UnsupportedPlatform { .. }));
        assert!(Platform::normalize("solaris", "x86_64").is_err());
    }

    #[test]
    fn test_default_registry_entries() {
        let registry = BinaryRegistry::with_base_url("https://example.invalid/bins/");
        assert_eq!(registry.len(), 4);

        let mac = Platform::normalize("darwin", "arm64").unwrap();
        let record = registry.lookup(GREEDY_COMPONENT, &mac).unwrap();
        assert_eq!(record.url, "https://example.invalid/bins/greedy-mac-arm64.zip");
        assert_eq!(record.archive_name, "greedy-mac-arm64.zip");
        assert_eq!(record.directory_name, "greedy-mac-arm64");
    }

    #[test]
    fn test_registry_miss_is_unsupported() {
        let registry = BinaryRegistry::default();
        let linux_arm = Platform::normalize("linux", "aarch64").unwrap();
        assert!(matches!(
            registry.lookup(GREEDY_COMPONENT, &linux_arm),
            Err(PipelineError::UnsupportedPlatform { .. })
        ));
    }

    /// Serves `body` with status 200 to every connection and returns the base URL.
    async fn serve(body: Vec<u8>) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let body = body.clone();
                tokio::spawn(async move {
                    let mut request = Vec::new();
                    let mut buf = [0u8; 1024];
                    while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                        match socket.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => request.extend_from_slice(&buf[..n]),
                        }
                    }
                    let head = format!(
                        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                        body.len()
                    );
                    let _ = socket.write_all(head.as_bytes()).await;
                    let _ = socket.write_all(&body).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        format!("http://{}", addr)
    }

    fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bundle.zip");
        crate::download::tests::write_zip(&path, entries);
        std::fs::read(&path).unwrap()
    }

    fn bin_entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_fetch_extracts_bundle_and_removes_archive() {
        let dir = tempfile::tempdir().unwrap();
        let body = zip_bytes(&[
            ("greedy-linux-x86_64/greedy", b"#!/bin/sh\n"),
            ("greedy-linux-x86_64/lib/libitk.so", b"lib"),
        ]);
        let registry = BinaryRegistry::with_base_url(&serve(body).await);
        let resolver = ResourceResolver::new(&registry, dir.path());

        let bundle = resolver.resolve_and_fetch("linux", "x86_64").await.unwrap();

        assert_eq!(bundle, dir.path().join("greedy-linux-x86_64"));
        assert!(bundle.join("greedy").is_file());
        assert_eq!(bin_entries(dir.path()), vec!["greedy-linux-x86_64"]);
    }

    #[tokio::test]
    async fn test_failed_extraction_leaves_no_cache_behind() {
        let dir = tempfile::tempdir().unwrap();
        // The first entry lands before the unsafe second one aborts extraction.
        let body = zip_bytes(&[
            ("greedy-linux-x86_64/lib/libitk.so", b"lib"),
            ("../escape", b"x"),
        ]);
        let registry = BinaryRegistry::with_base_url(&serve(body).await);
        let resolver = ResourceResolver::new(&registry, dir.path());

        assert!(resolver.resolve_and_fetch("linux", "x86_64").await.is_err());
        assert!(resolver.resolve_and_fetch("linux", "x86_64").await.is_err());
        assert!(bin_entries(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_archive_served_twice_fails_twice() {
        let dir = tempfile::tempdir().unwrap();
        let registry = BinaryRegistry::with_base_url(&serve(b"not a zip archive".to_vec()).await);
        let resolver = ResourceResolver::new(&registry, dir.path());

        assert!(resolver.resolve_and_fetch("linux", "x86_64").await.is_err());
        assert!(resolver.resolve_and_fetch("linux", "x86_64").await.is_err());
        assert!(bin_entries(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_bundle_without_executable_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let body = zip_bytes(&[("greedy-linux-x86_64/README", b"docs")]);
        let registry = BinaryRegistry::with_base_url(&serve(body).await);
        let resolver = ResourceResolver::new(&registry, dir.path());

        let err = resolver.resolve_and_fetch("linux", "x86_64").await.unwrap_err();
        assert!(format!("{:#}", err).contains("does not contain greedy"));
        assert!(bin_entries(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_existing_directory_skips_download() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("greedy-linux-x86_64")).unwrap();
        std::fs::write(dir.path().join("greedy-linux-x86_64/greedy"), b"").unwrap();
        // Any network access against this URL would fail the call.
        let registry = BinaryRegistry::with_base_url("http://127.0.0.1:9");
        let resolver = ResourceResolver::new(&registry, dir.path());

        let first = resolver.resolve_and_fetch("linux", "x86_64").await.unwrap();
        let second = resolver.resolve_and_fetch("Linux", "amd64").await.unwrap();

        assert_eq!(first, dir.path().join("greedy-linux-x86_64"));
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_unsupported_arch_fails_before_network() {
        let dir = tempfile::tempdir().unwrap();
        let registry = BinaryRegistry::with_base_url("http://127.0.0.1:9");
        let resolver = ResourceResolver::new(&registry, dir.path());

        let err = resolver.resolve_and_fetch("linux", "sparc").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::UnsupportedPlatform { .. })
        ));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_registry_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let registry = BinaryRegistry::with_base_url("http://127.0.0.1:9");
        let resolver = ResourceResolver::new(&registry, dir.path());

        assert!(resolver.resolve_and_fetch("linux", "x86_64").await.is_err());
        assert!(!dir.path().join("greedy-linux-x86_64").exists());
    }
}
