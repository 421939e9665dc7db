//! Body masks: pre-supplied or generated by the segmentation service, then reduced to a binary
//! registration mask with the ignored regions removed.

use anyhow::{anyhow, Context, Result};
use ndarray::ArrayD;
use serde::Serialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use crate::command::ExternalCommand;
use crate::error::PipelineError;
use crate::modality::is_nifti_name;
use crate::volume::{write_u8, Volume};

/// Filename prefix of a body mask supplied alongside the tracer images.
pub const SUPPLIED_MASK_PREFIX: &str = "SEG_";

/// Regions of the body-region mask that can be left out of registration. The torso (label 2)
/// always stays in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyRegion {
    Legs,
    Head,
    Arms,
}

impl BodyRegion {
    pub fn label(self) -> u8 {
        match self {
            BodyRegion::Legs => 1,
            BodyRegion::Head => 3,
            BodyRegion::Arms => 4,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            BodyRegion::Legs => "legs",
            BodyRegion::Head => "head",
            BodyRegion::Arms => "arms",
        }
    }
}

impl fmt::Display for BodyRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Parses a comma separated region list. `none` alone means nothing is ignored.
pub fn parse_regions(value: &str) -> Result<Vec<BodyRegion>> {
    let items: Vec<String> = value
        .split(',')
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect();

    if items.is_empty() {
        return Err(anyhow!("Expected at least one of: arms, legs, head, none"));
    }
    if items.iter().any(|s| s == "none") {
        if items.len() > 1 {
            return Err(anyhow!("'none' cannot be combined with other regions"));
        }
        return Ok(Vec::new());
    }

    let mut regions = Vec::new();
    for item in items {
        let region = match item.as_str() {
            "legs" => BodyRegion::Legs,
            "head" => BodyRegion::Head,
            "arms" => BodyRegion::Arms,
            other => {
                return Err(anyhow!(
                    "invalid region '{}' (choose from arms, legs, head, none)",
                    other
                ))
            }
        };
        if !regions.contains(&region) {
            regions.push(region);
        }
    }
    Ok(regions)
}

/// External body-region segmentation tool. Writes a labeled mask for a CT volume.
#[derive(Debug, Clone)]
pub struct SegmentationService {
    command: ExternalCommand,
}

impl SegmentationService {
    pub fn new(command: ExternalCommand) -> Self {
        Self { command }
    }

    pub async fn segment(&self, ct: &Path, output: &Path) -> Result<PathBuf> {
        self.command.run(ct, output).await?;
        if !output.exists() {
            return Err(PipelineError::conversion(
                &self.command.program,
                ct,
                format!("no mask written to {}", output.display()),
            )
            .into());
        }
        Ok(output.to_path_buf())
    }
}

/// The first `SEG_*` NIfTI file in `tracer_dir`, if any.
pub fn find_supplied_mask(tracer_dir: &Path) -> Result<Option<PathBuf>> {
    let mut masks: Vec<PathBuf> = fs::read_dir(tracer_dir)
        .with_context(|| format!("Failed to list {}", tracer_dir.display()))?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with(SUPPLIED_MASK_PREFIX) && is_nifti_name(n))
                .unwrap_or(false)
        })
        .collect();
    masks.sort();
    Ok(masks.into_iter().next())
}

/// File name of a generated body mask.
pub const GENERATED_MASK_NAME: &str = "SEG_body.nii.gz";

/// Places the body mask of `tracer` in `mask_dir` as `{tracer}_{mask file}`.
///
/// A supplied `SEG_*` mask is copied; otherwise the segmentation service, when configured, is
/// run on the staged CT. Returns `None` when neither is available.
pub async fn obtain_body_mask(
    tracer_dir: &Path,
    tracer: &str,
    staged_ct: &Path,
    service: Option<&SegmentationService>,
    mask_dir: &Path,
) -> Result<Option<PathBuf>> {
    if let Some(supplied) = find_supplied_mask(tracer_dir)? {
        let name = supplied
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| GENERATED_MASK_NAME.to_string());
        let destination = mask_dir.join(format!("{}_{}", tracer, name));
        tokio::fs::copy(&supplied, &destination)
            .await
            .with_context(|| format!("Failed to copy {}", supplied.display()))?;
        tracing::info!("Using supplied body mask {}", supplied.display());
        return Ok(Some(destination));
    }

    match service {
        Some(service) => {
            let destination = mask_dir.join(format!("{}_{}", tracer, GENERATED_MASK_NAME));
            let mask = service.segment(staged_ct, &destination).await?;
            tracing::info!("Generated body mask {}", mask.display());
            Ok(Some(mask))
        }
        None => Ok(None),
    }
}

/// Binary mask of `labels`: 1 for every labeled voxel not in `ignored`, 0 elsewhere.
pub fn binarize_without(labels: &ArrayD<f32>, ignored: &[BodyRegion]) -> ArrayD<u8> {
    let ignored: Vec<u8> = ignored.iter().map(|r| r.label()).collect();
    labels.mapv(|v| {
        let label = v.round();
        if label <= 0.0 || label > u8::MAX as f32 {
            return 0;
        }
        u8::from(!ignored.contains(&(label as u8)))
    })
}

/// Writes the registration mask derived from `body_mask` to `output`.
pub fn remove_ignored_regions(body_mask: &Path, ignored: &[BodyRegion], output: &Path) -> Result<()> {
    let vol = Volume::read(body_mask)?;
    let mask = binarize_without(&vol.data, ignored);

    if mask.iter().all(|&v| v == 0) {
        tracing::warn!(
            "Registration mask from {} is empty after removing {:?}",
            body_mask.display(),
            ignored
        );
    }

    write_u8(output, &mask, Some(&vol.header))?;
    tracing::info!(
        "Registration mask {} written ({} region(s) ignored)",
        output.display(),
        ignored.len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::write_f32;
    use ndarray::IxDyn;

    #[test]
    fn test_parse_regions() {
        assert_eq!(
            parse_regions("Arms, legs").unwrap(),
            vec![BodyRegion::Arms, BodyRegion::Legs]
        );
        assert!(parse_regions("none").unwrap().is_empty());
        assert_eq!(parse_regions("head,head").unwrap(), vec![BodyRegion::Head]);
        assert!(parse_regions("none,arms").is_err());
        assert!(parse_regions("tail").is_err());
        assert!(parse_regions("").is_err());
    }

    #[test]
    fn test_binarize_drops_ignored_labels() {
        let labels = ArrayD::from_shape_vec(IxDyn(&[5]), vec![0.0, 1.0, 2.0, 3.0, 4.0]).unwrap();

        let mask = binarize_without(&labels, &[BodyRegion::Arms, BodyRegion::Legs]);
        assert_eq!(mask.as_slice().unwrap(), &[0, 0, 1, 1, 0]);

        let mask = binarize_without(&labels, &[]);
        assert_eq!(mask.as_slice().unwrap(), &[0, 1, 1, 1, 1]);
    }

    #[test]
    fn test_remove_ignored_regions_writes_mask() {
        let dir = tempfile::tempdir().unwrap();
        let labels = ArrayD::from_shape_fn(IxDyn(&[4, 1, 1]), |d| d[0] as f32 + 1.0);
        let input = dir.path().join("T_SEG.nii.gz");
        let output = dir.path().join("T_mask.nii.gz");
        write_f32(&input, &labels, None).unwrap();

        remove_ignored_regions(&input, &[BodyRegion::Head], &output).unwrap();

        let mask = Volume::read(&output).unwrap();
        let values: Vec<f32> = mask.data.iter().copied().collect();
        assert_eq!(values, vec![1.0, 1.0, 0.0, 1.0]);
    }

    #[tokio::test]
    async fn test_supplied_mask_is_copied() {
        let dir = tempfile::tempdir().unwrap();
        let tracer = dir.path().join("FDG");
        fs::create_dir_all(&tracer).unwrap();
        fs::write(tracer.join("SEG_body.nii.gz"), b"mask").unwrap();
        fs::write(tracer.join("SEG_notes.txt"), b"x").unwrap();

        let mask = obtain_body_mask(&tracer, "FDG", Path::new("unused"), None, dir.path())
            .await
            .unwrap();

        let dest = dir.path().join("FDG_SEG_body.nii.gz");
        assert_eq!(mask, Some(dest.clone()));
        assert_eq!(fs::read(&dest).unwrap(), b"mask");
    }

    #[tokio::test]
    async fn test_no_mask_without_service() {
        let dir = tempfile::tempdir().unwrap();
        let mask = obtain_body_mask(dir.path(), "FDG", Path::new("ct"), None, dir.path())
            .await
            .unwrap();
        assert!(mask.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_service_that_writes_nothing_fails() {
        use crate::converter::tests::fake_engine;

        let dir = tempfile::tempdir().unwrap();
        let service = SegmentationService::new(fake_engine(dir.path(), "exit 0"));
        let err = service
            .segment(Path::new("ct.nii"), &dir.path().join("mask.nii.gz"))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::ConversionFailure { .. })
        ));
    }
}
