//! Output tree of one pipeline run and the file staging helpers that fill it.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Local};
use futures::stream::{self, StreamExt};
use std::fs;
use std::path::{Path, PathBuf};

use crate::modality::Modality;

/// Name prefix of every workspace directory; such directories are never tracers.
pub const WORKSPACE_PREFIX: &str = "PUMAZ-V01";
pub const TRANSFORMS_FOLDER: &str = "transforms";
pub const BODY_MASK_FOLDER: &str = "body_masks";
pub const PUMA_MASK_FOLDER: &str = "puma_masks";
pub const ALIGNED_CT_FOLDER: &str = "aligned_CT";
pub const ALIGNED_PET_FOLDER: &str = "aligned_PT";
pub const ALIGNED_MASK_FOLDER: &str = "aligned_MASK";

/// Timestamped output directory of a run.
#[derive(Debug, Clone)]
pub struct PipelineWorkspace {
    pub root: PathBuf,
}

impl PipelineWorkspace {
    /// Creates `{parent}/PUMAZ-V01-{timestamp}` and all category directories.
    pub fn create(parent: &Path, started: DateTime<Local>) -> Result<Self> {
        let root = parent.join(format!(
            "{}-{}",
            WORKSPACE_PREFIX,
            started.format("%Y-%m-%d-%H-%M-%S")
        ));
        if root.exists() {
            return Err(anyhow!("Workspace {} already exists", root.display()));
        }
        let ws = Self { root };
        for dir in ws.category_dirs() {
            fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        Ok(ws)
    }

    fn category_dirs(&self) -> Vec<PathBuf> {
        vec![
            self.staged(Modality::Ct),
            self.staged(Modality::Pet),
            self.body_masks(),
            self.registration_masks(),
            self.aligned_ct(),
            self.aligned_pet(),
            self.aligned_masks(),
            self.root.join(TRANSFORMS_FOLDER),
        ]
    }

    pub fn staged(&self, modality: Modality) -> PathBuf {
        self.root.join(modality.staging_dir())
    }

    pub fn body_masks(&self) -> PathBuf {
        self.root.join(BODY_MASK_FOLDER)
    }

    pub fn registration_masks(&self) -> PathBuf {
        self.root.join(PUMA_MASK_FOLDER)
    }

    pub fn aligned_ct(&self) -> PathBuf {
        self.root.join(ALIGNED_CT_FOLDER)
    }

    pub fn aligned_pet(&self) -> PathBuf {
        self.root.join(ALIGNED_PET_FOLDER)
    }

    pub fn aligned_masks(&self) -> PathBuf {
        self.root.join(ALIGNED_MASK_FOLDER)
    }

    /// Per-tracer transform directory, created on demand.
    pub fn transforms_for(&self, tracer: &str) -> Result<PathBuf> {
        let dir = self.root.join(TRANSFORMS_FOLDER).join(tracer);
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        Ok(dir)
    }
}

/// Tracer directories of a subject, sorted by name. Hidden and workspace directories are skipped.
pub fn discover_tracer_dirs(subject_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs: Vec<PathBuf> = fs::read_dir(subject_dir)
        .with_context(|| format!("Failed to list {}", subject_dir.display()))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .filter(|p| {
            let name = file_name(p);
            !name.starts_with('.') && !name.starts_with(WORKSPACE_PREFIX)
        })
        .collect();
    dirs.sort();
    Ok(dirs)
}

pub fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// NIfTI files in `dir` whose names start with one of `modality`'s prefixes, sorted.
pub fn select_files_by_modality(dir: &Path, modality: Modality) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("Failed to list {}", dir.display()))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .filter(|p| {
            let name = file_name(p);
            crate::modality::is_nifti_name(&name) && modality.matches(&name)
        })
        .collect();
    files.sort();
    Ok(files)
}

/// Copies every `(source, destination)` pair concurrently, one task per file.
///
/// Destinations must be distinct. All copies are attempted; the first failure is returned.
pub async fn copy_files_to_destination(pairs: &[(PathBuf, PathBuf)]) -> Result<()> {
    if pairs.is_empty() {
        return Ok(());
    }

    let results = stream::iter(pairs.iter().cloned().map(|(src, dst)| async move {
        tokio::fs::copy(&src, &dst)
            .await
            .map(|_| ())
            .with_context(|| format!("Failed to copy {} to {}", src.display(), dst.display()))
    }))
    .buffer_unordered(pairs.len())
    .collect::<Vec<Result<()>>>()
    .await;

    results.into_iter().collect()
}
