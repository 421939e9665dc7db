//! Structural check that a tracer directory holds exactly one NIfTI volume per required modality.

use anyhow::{Context, Result};
use colored::*;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::modality::{is_nifti_name, Modality};

#[derive(Debug, Clone, Serialize)]
pub struct ExcludedTracer {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ComplianceReport {
    /// Compliant directories, in input order.
    pub admitted: Vec<PathBuf>,
    pub excluded: Vec<ExcludedTracer>,
}

impl ComplianceReport {
    pub fn total(&self) -> usize {
        self.admitted.len() + self.excluded.len()
    }
}

/// Number of NIfTI files in `dir` per modality, in `modalities` order.
pub fn count_modalities(dir: &Path, modalities: &[Modality]) -> Result<Vec<(Modality, usize)>> {
    let names: Vec<String> = fs::read_dir(dir)
        .with_context(|| format!("Failed to list {}", dir.display()))?
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_file())
        .filter_map(|e| e.file_name().to_str().map(|s| s.to_string()))
        .filter(|n| is_nifti_name(n))
        .collect();

    Ok(modalities
        .iter()
        .map(|&m| (m, names.iter().filter(|n| m.matches(n)).count()))
        .collect())
}

fn exclusion_reason(counts: &[(Modality, usize)]) -> Option<String> {
    let problems: Vec<String> = counts
        .iter()
        .filter(|(_, n)| *n != 1)
        .map(|(m, n)| match *n {
            0 => format!("no {} image", m),
            _ => format!("{} {} images", n, m),
        })
        .collect();
    if problems.is_empty() {
        None
    } else {
        Some(problems.join(", "))
    }
}

/// Splits `tracer_dirs` into admitted and excluded directories.
///
/// A directory is admitted when every required modality matches exactly one NIfTI file.
/// An unreadable directory is excluded, not an error.
pub fn select_compliant(tracer_dirs: &[PathBuf], modalities: &[Modality]) -> ComplianceReport {
    let mut report = ComplianceReport::default();

    for dir in tracer_dirs {
        let verdict = count_modalities(dir, modalities)
            .map(|counts| exclusion_reason(&counts))
            .unwrap_or_else(|e| Some(format!("{:#}", e)));

        match verdict {
            None => report.admitted.push(dir.clone()),
            Some(reason) => {
                tracing::info!("{} is not compliant: {}", dir.display(), reason);
                report.excluded.push(ExcludedTracer {
                    path: dir.clone(),
                    reason,
                });
            }
        }
    }

    println!(
        "{} {} of {} tracer directories are compliant",
        "ℹ".yellow(),
        report.admitted.len(),
        report.total()
    );
    tracing::info!(
        "Number of compliant tracer directories: {} out of {}",
        report.admitted.len(),
        report.total()
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modality::DEFAULT_MODALITIES;

    fn tracer(root: &Path, name: &str, files: &[&str]) -> PathBuf {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        for f in files {
            fs::write(dir.join(f), b"x").unwrap();
        }
        dir
    }

    #[test]
    fn test_one_file_per_modality_is_compliant() {
        let root = tempfile::tempdir().unwrap();
        let t = tracer(root.path(), "T", &["CT_a.nii.gz", "PT_a.nii.gz"]);

        let report = select_compliant(&[t.clone()], &DEFAULT_MODALITIES);

        assert_eq!(report.admitted, vec![t]);
        assert!(report.excluded.is_empty());
    }

    #[test]
    fn test_duplicate_ct_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        let t = tracer(root.path(), "T", &["CT_a.nii.gz", "CT_b.nii.gz", "PET_a.nii"]);

        let report = select_compliant(&[t], &DEFAULT_MODALITIES);

        assert!(report.admitted.is_empty());
        assert_eq!(report.excluded[0].reason, "2 CT images");
    }

    #[test]
    fn test_second_pet_spelling_counts_as_duplicate() {
        let root = tempfile::tempdir().unwrap();
        let t = tracer(root.path(), "T", &["CT_a.nii.gz", "PET_a.nii.gz", "PT_b.nii.gz"]);

        assert!(select_compliant(&[t], &DEFAULT_MODALITIES).admitted.is_empty());
    }

    #[test]
    fn test_non_nifti_and_foreign_files_are_ignored() {
        let root = tempfile::tempdir().unwrap();
        let t = tracer(
            root.path(),
            "T",
            &["CT_a.nii.gz", "PT_a.nii.gz", "CT_notes.txt", "MR_x.nii.gz", "SEG_body.nii.gz"],
        );
        assert_eq!(select_compliant(&[t], &DEFAULT_MODALITIES).admitted.len(), 1);
    }

    #[test]
    fn test_mixed_input_keeps_order_and_counts() {
        let root = tempfile::tempdir().unwrap();
        let b = tracer(root.path(), "B", &["CT_b.nii", "PT_b.nii"]);
        let a = tracer(root.path(), "A", &["CT_a.nii"]);
        let c = tracer(root.path(), "C", &["CT_c.nii", "PET_c.nii"]);
        let missing = root.path().join("gone");

        let report = select_compliant(&[b.clone(), a, c.clone(), missing], &DEFAULT_MODALITIES);

        assert_eq!(report.admitted, vec![b, c]);
        assert_eq!(report.excluded.len(), 2);
        assert_eq!(report.excluded[0].reason, "no PET image");
        assert_eq!(report.total(), 4);
    }
}
