//! DICOM to NIfTI conversion through an external engine.
//!
//! The engine is invoked once per DICOM directory and writes its volumes into the directory's
//! parent. Output names follow `{series_number}_{normalized_text}.nii[.gz]`, which
//! [`crate::dicom_lookup`] predicts so the files can be given their modality prefix.

use anyhow::Result;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::command::ExternalCommand;
use crate::error::PipelineError;
use crate::modality::is_nifti_name;

/// Result of one conversion call.
#[derive(Debug, Clone)]
pub struct ConversionResult {
    /// NIfTI files that did not exist before the call.
    pub nifti_files: Vec<PathBuf>,
    /// Time taken in milliseconds.
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone)]
pub struct ConversionEngine {
    command: ExternalCommand,
}

impl ConversionEngine {
    pub fn new(command: ExternalCommand) -> Self {
        Self { command }
    }

    pub fn name(&self) -> &str {
        &self.command.program
    }

    pub fn is_available(&self) -> bool {
        self.command.is_available()
    }

    /// Converts `dicom_dir` into `output_dir`.
    ///
    /// A zero exit that leaves no new NIfTI file behind is still a failure.
    pub async fn convert(&self, dicom_dir: &Path, output_dir: &Path) -> Result<ConversionResult> {
        let start = std::time::Instant::now();

        tokio::fs::create_dir_all(output_dir).await?;
        let before = find_nifti_files(output_dir).await?;

        self.command.run(dicom_dir, output_dir).await?;

        let elapsed_ms = start.elapsed().as_millis() as u64;
        let before: BTreeSet<PathBuf> = before.into_iter().collect();
        let nifti_files: Vec<PathBuf> = find_nifti_files(output_dir)
            .await?
            .into_iter()
            .filter(|p| !before.contains(p))
            .collect();

        if nifti_files.is_empty() {
            return Err(PipelineError::conversion(
                self.name(),
                dicom_dir,
                "engine exited cleanly but wrote no NIfTI file",
            )
            .into());
        }

        Ok(ConversionResult {
            nifti_files,
            elapsed_ms,
        })
    }
}

/// Find all NIfTI files (.nii, .nii.gz) in a directory, sorted by name.
pub async fn find_nifti_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut nifti_files = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let filename = path.file_name().unwrap_or_default().to_string_lossy();

        if path.is_file() && is_nifti_name(&filename) {
            nifti_files.push(path);
        }
    }

    nifti_files.sort();
    Ok(nifti_files)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Writes an executable shell script acting as a conversion engine.
    #[cfg(unix)]
    pub fn fake_engine(dir: &Path, body: &str) -> ExternalCommand {
        use std::os::unix::fs::PermissionsExt;

        let script = dir.join("fake_engine.sh");
        std::fs::write(&script, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        ExternalCommand::new(
            script.to_string_lossy().to_string(),
            vec!["{input}".into(), "{output}".into()],
        )
    }

    #[tokio::test]
    async fn test_find_nifti_files_filters_extensions() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.nii.gz", "a.nii", "c.json", "d.dcm"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        let files = find_nifti_files(dir.path()).await.unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a.nii", "b.nii.gz"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_convert_reports_new_files_only() {
        let tools = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let dicom_dir = work.path().join("dicom");
        std::fs::create_dir_all(&dicom_dir).unwrap();
        std::fs::write(work.path().join("CT_old.nii.gz"), b"x").unwrap();

        let engine = ConversionEngine::new(fake_engine(tools.path(), "touch \"$2/3_ct_body.nii\""));
        let result = engine.convert(&dicom_dir, work.path()).await.unwrap();

        assert_eq!(result.nifti_files, vec![work.path().join("3_ct_body.nii")]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_convert_without_output_fails() {
        let tools = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let engine = ConversionEngine::new(fake_engine(tools.path(), "exit 0"));

        let err = engine.convert(work.path(), work.path()).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::ConversionFailure { .. })
        ));
    }
}
