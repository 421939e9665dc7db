//! Brings every tracer directory of a subject to modality-prefixed NIfTI files.

use anyhow::{Context, Result};
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use ndarray::Array3;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::classifier::{classify_entry, EntryKind};
use crate::converter::ConversionEngine;
use crate::dicom_lookup::{apply_lookup, build_lookup};
use crate::error::PipelineError;
use crate::volume::write_u16;
use crate::workspace::{discover_tracer_dirs, file_name};

#[derive(Debug, Clone, Serialize)]
pub struct EntryFailure {
    pub path: PathBuf,
    pub reason: String,
}

/// What [`standardize`] did to a subject.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StandardizeReport {
    pub tracers_visited: usize,
    /// Converted or renamed NIfTI files.
    pub produced: Vec<PathBuf>,
    /// Entries left untouched (existing NIfTI, hidden files, non-DICOM directories).
    pub skipped: Vec<PathBuf>,
    pub failures: Vec<EntryFailure>,
}

fn tracer_bar(len: u64) -> ProgressBar {
    let pb = ProgressBar::new(len);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );
    pb
}

/// Converts every non-NIfTI entry of every tracer directory under `subject_dir`.
///
/// A missing subject directory is reported and yields an empty report. Per-entry failures are
/// collected and never stop the walk.
pub async fn standardize(subject_dir: &Path, engine: &ConversionEngine) -> Result<StandardizeReport> {
    let mut report = StandardizeReport::default();

    if !subject_dir.exists() {
        let err = PipelineError::MissingInputPath(subject_dir.to_path_buf());
        println!("{} {}", "✗".red(), err);
        tracing::error!("{}", err);
        return Ok(report);
    }

    let tracers = discover_tracer_dirs(subject_dir)?;
    standardize_tracers(&tracers, engine, &mut report).await;

    tracing::info!(
        "Standardized {} tracer(s): {} produced, {} skipped, {} failed",
        report.tracers_visited,
        report.produced.len(),
        report.skipped.len(),
        report.failures.len()
    );
    Ok(report)
}

/// A tracer directory that cannot be listed is recorded as a failure; the others still run.
async fn standardize_tracers(tracers: &[PathBuf], engine: &ConversionEngine, report: &mut StandardizeReport) {
    let pb = tracer_bar(tracers.len() as u64);

    for tracer in tracers {
        pb.set_message(format!("Standardizing {}", file_name(tracer)));
        match standardize_tracer(tracer, engine, report).await {
            Ok(()) => report.tracers_visited += 1,
            Err(e) => {
                pb.println(format!("{} {}: {:#}", "✗".red(), tracer.display(), e));
                tracing::error!("Standardization of tracer {} failed: {:#}", tracer.display(), e);
                report.failures.push(EntryFailure {
                    path: tracer.clone(),
                    reason: format!("{:#}", e),
                });
            }
        }
        pb.inc(1);
    }
    pb.finish_and_clear();
}

async fn standardize_tracer(
    tracer: &Path,
    engine: &ConversionEngine,
    report: &mut StandardizeReport,
) -> Result<()> {
    let mut entries: Vec<PathBuf> = fs::read_dir(tracer)
        .with_context(|| format!("Failed to list {}", tracer.display()))?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .collect();
    entries.sort();

    for entry in entries {
        let kind = classify_entry(&entry);
        if !kind.needs_conversion() {
            if kind == EntryKind::Unrecognized {
                tracing::warn!("{} holds no DICOM data; skipped", entry.display());
            }
            report.skipped.push(entry);
            continue;
        }

        match non_nifti_to_nifti(&entry, None, engine).await {
            Ok(files) => report.produced.extend(files),
            Err(e) => {
                println!("{} {}: {:#}", "✗".red(), entry.display(), e);
                tracing::error!("Standardization of {} failed: {:#}", entry.display(), e);
                report.failures.push(EntryFailure {
                    path: entry,
                    reason: format!("{:#}", e),
                });
            }
        }
    }
    Ok(())
}

/// Converts one entry to NIfTI.
///
/// A DICOM directory goes through the two-phase lookup and conversion into its parent directory.
/// Any other non-NIfTI file is read as a 2-D image and written as `{stem}.nii` into
/// `output_dir` (default: the file's directory). Hidden and NIfTI files return nothing.
pub async fn non_nifti_to_nifti(
    input: &Path,
    output_dir: Option<&Path>,
    engine: &ConversionEngine,
) -> Result<Vec<PathBuf>> {
    if !input.exists() {
        return Err(PipelineError::MissingInputPath(input.to_path_buf()).into());
    }

    match classify_entry(input) {
        EntryKind::DicomSeries => {
            let parent = input.parent().unwrap_or(Path::new("."));
            convert_dicom_dir(input, output_dir.unwrap_or(parent), engine).await
        }
        EntryKind::DicomFile => {
            let parent = input.parent().unwrap_or(Path::new("."));
            convert_dicom_file(input, output_dir.unwrap_or(parent), engine).await
        }
        EntryKind::GenericImage => {
            let parent = input.parent().unwrap_or(Path::new("."));
            let target = output_dir.unwrap_or(parent);
            Ok(vec![convert_generic_image(input, target)?])
        }
        _ => Ok(Vec::new()),
    }
}

/// Two-phase conversion of one DICOM directory into `target`.
async fn convert_dicom_dir(dicom_dir: &Path, target: &Path, engine: &ConversionEngine) -> Result<Vec<PathBuf>> {
    let mut table = build_lookup(dicom_dir)?;
    let converted = engine.convert(dicom_dir, target).await?;
    tracing::info!(
        "{} converted {} into {} file(s) in {} ms",
        engine.name(),
        dicom_dir.display(),
        converted.nifti_files.len(),
        converted.elapsed_ms
    );
    let renamed = apply_lookup(target, &mut table)?;

    // Renamed files no longer exist under their engine name.
    let unmatched: Vec<PathBuf> = converted
        .nifti_files
        .into_iter()
        .filter(|p| p.exists())
        .collect();
    if !unmatched.is_empty() {
        tracing::warn!(
            "{} converted file(s) from {} kept their engine name and carry no modality prefix",
            unmatched.len(),
            dicom_dir.display()
        );
    }
    let mut produced = renamed;
    produced.extend(unmatched);
    Ok(produced)
}

/// The conversion engine reads directories, so a standalone DICOM file is copied into a hidden
/// single-file series next to it and converted from there. The copy is always removed.
async fn convert_dicom_file(file: &Path, target: &Path, engine: &ConversionEngine) -> Result<Vec<PathBuf>> {
    let parent = file.parent().unwrap_or(Path::new("."));
    let staging = parent.join(format!(".{}.series", file_name(file)));
    fs::create_dir_all(&staging)
        .with_context(|| format!("Failed to create {}", staging.display()))?;

    let result = match fs::copy(file, staging.join(file_name(file))) {
        Ok(_) => convert_dicom_dir(&staging, target, engine).await,
        Err(e) => Err(anyhow::Error::new(e).context(format!("Failed to stage {}", file.display()))),
    };

    if let Err(e) = fs::remove_dir_all(&staging) {
        tracing::warn!("Could not remove {}: {}", staging.display(), e);
    }
    result
}

/// Reads a 2-D image and writes it as a single-slice 16-bit NIfTI volume `{stem}.nii`.
pub fn convert_generic_image(input: &Path, output_dir: &Path) -> Result<PathBuf> {
    let img = image::open(input)
        .with_context(|| format!("Failed to read image {}", input.display()))?
        .to_luma16();
    let (width, height) = img.dimensions();

    let data = Array3::from_shape_fn((width as usize, height as usize, 1), |(x, y, _)| {
        img.get_pixel(x as u32, y as u32)[0]
    })
    .into_dyn();

    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "image".to_string());
    let output = output_dir.join(format!("{}.nii", stem));
    write_u16(&output, &data, None)?;

    tracing::info!("Converted {} -> {}", input.display(), output.display());
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::ExternalCommand;
    use crate::volume::Volume;

    fn unused_engine() -> ConversionEngine {
        ConversionEngine::new(ExternalCommand::new("nonexistent_converter_binary_xyz", vec![]))
    }

    #[tokio::test]
    async fn test_existing_nifti_is_left_unchanged() {
        let subject = tempfile::tempdir().unwrap();
        let tracer = subject.path().join("FDG");
        fs::create_dir_all(&tracer).unwrap();
        let nifti = tracer.join("CT_sample.nii.gz");
        fs::write(&nifti, b"original bytes").unwrap();

        let report = standardize(subject.path(), &unused_engine()).await.unwrap();

        assert_eq!(fs::read(&nifti).unwrap(), b"original bytes");
        assert_eq!(fs::read_dir(&tracer).unwrap().count(), 1);
        assert_eq!(report.tracers_visited, 1);
        assert!(report.produced.is_empty());
        assert_eq!(report.skipped, vec![nifti]);
    }

    #[tokio::test]
    async fn test_missing_subject_has_no_effect() {
        let dir = tempfile::tempdir().unwrap();
        let report = standardize(&dir.path().join("nope"), &unused_engine())
            .await
            .unwrap();
        assert_eq!(report.tracers_visited, 0);
    }

    #[tokio::test]
    async fn test_unreadable_image_is_collected_and_walk_continues() {
        let subject = tempfile::tempdir().unwrap();
        let tracer = subject.path().join("PSMA");
        fs::create_dir_all(&tracer).unwrap();
        fs::write(tracer.join("notes.txt"), b"plain text").unwrap();
        fs::write(tracer.join(".hidden"), b"x").unwrap();

        let img = image::GrayImage::from_fn(4, 3, |x, y| image::Luma([(x + 4 * y) as u8]));
        img.save(tracer.join("scout.png")).unwrap();

        let report = standardize(subject.path(), &unused_engine()).await.unwrap();

        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].path, tracer.join("notes.txt"));
        assert_eq!(report.produced, vec![tracer.join("scout.nii")]);

        let vol = Volume::read(&tracer.join("scout.nii")).unwrap();
        assert_eq!(vol.data.shape(), &[4, 3, 1]);
    }

    #[tokio::test]
    async fn test_non_nifti_to_nifti_missing_input() {
        let dir = tempfile::tempdir().unwrap();
        let err = non_nifti_to_nifti(&dir.path().join("gone"), None, &unused_engine())
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::MissingInputPath(_))
        ));
    }

    #[tokio::test]
    async fn test_vanished_tracer_does_not_stop_the_others() {
        let subject = tempfile::tempdir().unwrap();
        let good = subject.path().join("FDG");
        fs::create_dir_all(&good).unwrap();
        let img = image::GrayImage::from_fn(2, 2, |x, y| image::Luma([(x + y) as u8]));
        img.save(good.join("scout.png")).unwrap();
        let gone = subject.path().join("PSMA");

        let mut report = StandardizeReport::default();
        standardize_tracers(&[gone.clone(), good.clone()], &unused_engine(), &mut report).await;

        assert_eq!(report.tracers_visited, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].path, gone);
        assert_eq!(report.produced, vec![good.join("scout.nii")]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_standalone_dicom_file_goes_through_the_engine() {
        use crate::classifier::tests::{ct_series, write_test_dicom};
        use crate::converter::tests::fake_engine;

        let tools = tempfile::tempdir().unwrap();
        let subject = tempfile::tempdir().unwrap();
        let tracer = subject.path().join("FDG");
        fs::create_dir_all(&tracer).unwrap();
        write_test_dicom(&tracer.join("slice.dcm"), &ct_series(), 1);

        let engine = ConversionEngine::new(fake_engine(
            tools.path(),
            "[ -f \"$1/slice.dcm\" ] || exit 1\ntouch \"$2/3_ct_body.nii\"",
        ));
        let report = standardize(subject.path(), &engine).await.unwrap();

        assert!(report.failures.is_empty(), "{:?}", report.failures);
        assert_eq!(report.produced, vec![tracer.join("CT_3_ct_body.nii")]);
        assert!(tracer.join("slice.dcm").exists());
        assert!(!tracer.join(".slice.dcm.series").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_dicom_series_is_converted_and_prefixed() {
        use crate::classifier::tests::{ct_series, write_test_dicom};
        use crate::converter::tests::fake_engine;

        let tools = tempfile::tempdir().unwrap();
        let subject = tempfile::tempdir().unwrap();
        let tracer = subject.path().join("FDG");
        let series = tracer.join("ct_dicom");
        fs::create_dir_all(&series).unwrap();
        write_test_dicom(&series.join("1.dcm"), &ct_series(), 1);
        write_test_dicom(&series.join("2.dcm"), &ct_series(), 2);

        let engine = ConversionEngine::new(fake_engine(tools.path(), "touch \"$2/3_ct_body.nii\""));
        let report = standardize(subject.path(), &engine).await.unwrap();

        assert!(report.failures.is_empty(), "{:?}", report.failures);
        assert_eq!(report.produced, vec![tracer.join("CT_3_ct_body.nii")]);
        assert!(tracer.join("CT_3_ct_body.nii").exists());
        assert!(!tracer.join("3_ct_body.nii").exists());
    }
}
