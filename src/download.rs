//! Streaming archive download, zip extraction and executable permissions.

use anyhow::{anyhow, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::Client;
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use zip::ZipArchive;

/// Name of the registration engine executable on the given normalized OS.
pub fn executable_name(os: &str) -> &'static str {
    if os == "windows" {
        "greedy.exe"
    } else {
        "greedy"
    }
}

fn bytes_bar(total: u64, message: &str) -> ProgressBar {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );
    pb.set_message(message.to_string());
    pb
}

#[derive(Clone)]
/// HTTP client for binary bundles. No timeout and no retries are applied.
pub struct BinaryDownloader {
    client: Client,
}

impl BinaryDownloader {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client })
    }

    /// Streams `url` into `dest`, replacing any partial file. Returns the number of bytes written.
    pub async fn download(&self, url: &str, dest: &Path) -> Result<u64> {
        let mut resp = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("Failed to request {}", url))?;

        if !resp.status().is_success() {
            return Err(anyhow!("Download of {} failed: {}", url, resp.status()));
        }

        let pb = bytes_bar(
            resp.content_length().unwrap_or(0),
            "Downloading registration binaries",
        );
        let mut file = tokio::fs::File::create(dest)
            .await
            .with_context(|| format!("Failed to create {}", dest.display()))?;
        let mut written = 0u64;

        while let Some(chunk) = resp.chunk().await? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
            pb.set_position(written);
        }
        file.flush().await?;

        pb.finish_and_clear();
        tracing::info!("Downloaded {} ({} bytes) to {}", url, written, dest.display());
        Ok(written)
    }
}

/// Extracts every entry of a zip archive into `dest_dir`. Entries whose names would escape
/// `dest_dir` are rejected. Returns the extracted file paths.
pub fn extract_archive(archive: &Path, dest_dir: &Path) -> Result<Vec<PathBuf>> {
    let file =
        File::open(archive).with_context(|| format!("Failed to open {}", archive.display()))?;
    let mut zip = ZipArchive::new(BufReader::new(file))
        .with_context(|| format!("{} is not a valid zip archive", archive.display()))?;

    let total: u64 = (0..zip.len())
        .filter_map(|i| zip.by_index(i).ok().map(|f| f.size()))
        .sum();
    let pb = bytes_bar(total, "Extracting registration binaries");

    let mut extracted = Vec::new();
    for i in 0..zip.len() {
        let mut entry = zip.by_index(i)?;
        let relative = entry
            .enclosed_name()
            .map(|p| p.to_path_buf())
            .ok_or_else(|| anyhow!("Unsafe entry name in archive: {}", entry.name()))?;
        let out_path = dest_dir.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut output = File::create(&out_path)
            .with_context(|| format!("Failed to create {}", out_path.display()))?;
        std::io::copy(&mut entry, &mut output)?;
        pb.inc(entry.size());
        extracted.push(out_path);
    }

    pb.finish_and_clear();
    Ok(extracted)
}

/// Makes `exe` runnable: `icacls /grant Everyone:(F)` on Windows, mode `0o744` elsewhere.
pub fn set_permissions(exe: &Path) -> Result<()> {
    #[cfg(windows)]
    {
        let status = std::process::Command::new("icacls")
            .arg(exe)
            .args(["/grant", "Everyone:(F)"])
            .status()
            .context("Failed to run icacls")?;
        if !status.success() {
            return Err(anyhow!("icacls failed on {}: {}", exe.display(), status));
        }
    }

    #[cfg(not(windows))]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(exe, fs::Permissions::from_mode(0o744))
            .with_context(|| format!("Failed to set permissions on {}", exe.display()))?;
    }

    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::FileOptions;

    /// Writes a zip holding `entries` as (name, content) pairs.
    pub fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        for (name, content) in entries {
            zip.start_file(*name, FileOptions::default()).unwrap();
            zip.write_all(content).unwrap();
        }
        zip.finish().unwrap();
    }

    #[test]
    fn test_extract_archive_recreates_tree() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("bundle.zip");
        write_zip(
            &archive,
            &[
                ("greedy-linux-x86_64/greedy", b"#!/bin/sh\n"),
                ("greedy-linux-x86_64/lib/libitk.so", b"lib"),
            ],
        );

        let out = dir.path().join("bin");
        let files = extract_archive(&archive, &out).unwrap();

        assert_eq!(files.len(), 2);
        assert!(out.join("greedy-linux-x86_64/greedy").is_file());
        assert_eq!(fs::read(out.join("greedy-linux-x86_64/lib/libitk.so")).unwrap(), b"lib");
    }

    #[test]
    fn test_extract_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("evil.zip");
        write_zip(&archive, &[("../escape.txt", b"x")]);

        let out = dir.path().join("bin");
        assert!(extract_archive(&archive, &out).is_err());
        assert!(!dir.path().join("escape.txt").exists());
    }

    #[test]
    fn test_extract_corrupt_archive_fails() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("broken.zip");
        fs::write(&archive, b"not a zip").unwrap();
        assert!(extract_archive(&archive, dir.path()).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_set_permissions_is_0744() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("greedy");
        fs::write(&exe, b"").unwrap();
        set_permissions(&exe).unwrap();

        let mode = fs::metadata(&exe).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o744);
    }

    #[test]
    fn test_executable_name() {
        assert_eq!(executable_name("windows"), "greedy.exe");
        assert_eq!(executable_name("linux"), "greedy");
        assert_eq!(executable_name("mac"), "greedy");
    }
}
