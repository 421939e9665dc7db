//! Greedy invocations: affine and deformable registration of CT to CT, and reslicing of images
//! and label masks through the resulting transforms.

use anyhow::Result;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

use crate::command::failure_message;
use crate::error::PipelineError;
use crate::modality::nifti_stem;
use crate::workspace::file_name;

pub const DEFAULT_MULTI_RESOLUTION: &str = "100x50x25";

/// Files produced by registering one moving CT onto the reference CT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformSet {
    pub affine: PathBuf,
    pub warp: PathBuf,
    pub inverse_warp: PathBuf,
}

impl TransformSet {
    /// Transform paths for `moving` under `dir`.
    pub fn for_image(dir: &Path, moving: &Path) -> Self {
        let stem = nifti_stem(&file_name(moving)).to_string();
        Self {
            affine: dir.join(format!("{}_affine.mat", stem)),
            warp: dir.join(format!("{}_warp.nii.gz", stem)),
            inverse_warp: dir.join(format!("{}_inverse_warp.nii.gz", stem)),
        }
    }
}

/// Optional fixed (`-gm`) and moving (`-mm`) registration masks.
#[derive(Debug, Clone, Copy, Default)]
pub struct RegistrationMasks<'a> {
    pub fixed: Option<&'a Path>,
    pub moving: Option<&'a Path>,
}

fn os(p: &Path) -> OsString {
    p.as_os_str().to_os_string()
}

fn push_masks(args: &mut Vec<OsString>, masks: RegistrationMasks<'_>) {
    if let Some(m) = masks.fixed {
        args.push("-gm".into());
        args.push(os(m));
    }
    if let Some(m) = masks.moving {
        args.push("-mm".into());
        args.push(os(m));
    }
}

#[derive(Debug, Clone)]
pub struct RegistrationEngine {
    executable: PathBuf,
    multi_resolution: String,
}

impl RegistrationEngine {
    pub fn new(executable: impl Into<PathBuf>, multi_resolution: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
            multi_resolution: multi_resolution.into(),
        }
    }

    /// 12-dof affine with NMI, initialized by aligning image centers.
    pub fn affine_args(
        &self,
        fixed: &Path,
        moving: &Path,
        output: &Path,
        masks: RegistrationMasks<'_>,
    ) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec!["-d".into(), "3".into(), "-a".into(), "-ia-image-centers".into()];
        args.extend(["-i".into(), os(fixed), os(moving)]);
        args.extend(["-dof".into(), "12".into(), "-o".into(), os(output)]);
        args.extend(["-n".into(), self.multi_resolution.clone().into(), "-m".into(), "NMI".into()]);
        push_masks(&mut args, masks);
        args
    }

    /// Deformable NCC 2x2x2 registration initialized with the affine, writing warp and inverse warp.
    pub fn deformable_args(
        &self,
        fixed: &Path,
        moving: &Path,
        transforms: &TransformSet,
        masks: RegistrationMasks<'_>,
    ) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "-d".into(),
            "3".into(),
            "-m".into(),
            "NCC".into(),
            "2x2x2".into(),
        ];
        args.extend(["-i".into(), os(fixed), os(moving)]);
        args.extend(["-it".into(), os(&transforms.affine)]);
        args.extend(["-o".into(), os(&transforms.warp), "-oinv".into(), os(&transforms.inverse_warp)]);
        args.extend(["-sv".into(), "-n".into(), self.multi_resolution.clone().into()]);
        push_masks(&mut args, masks);
        args
    }

    /// Linear reslice of `moving` onto `reference`, plus an optional label image with
    /// `LABEL 0.2vox` interpolation. Transforms are applied warp first, then affine.
    pub fn reslice_args(
        &self,
        reference: &Path,
        moving: &Path,
        output: &Path,
        label: Option<(&Path, &Path)>,
        transforms: &TransformSet,
    ) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec!["-d".into(), "3".into(), "-rf".into(), os(reference)];
        args.extend(["-ri".into(), "LINEAR".into(), "-rm".into(), os(moving), os(output)]);
        if let Some((seg, seg_out)) = label {
            args.extend(["-ri".into(), "LABEL".into(), "0.2vox".into()]);
            args.extend(["-rm".into(), os(seg), os(seg_out)]);
        }
        args.extend(["-r".into(), os(&transforms.warp), os(&transforms.affine)]);
        args
    }

    async fn run(&self, args: Vec<OsString>, target: &Path, expected: &[&Path]) -> Result<()> {
        tracing::debug!("{} {:?}", self.executable.display(), args);
        let out = Command::new(&self.executable)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| PipelineError::conversion("greedy", target, e.to_string()))?;

        if !out.status.success() {
            return Err(PipelineError::conversion("greedy", target, failure_message(&out)).into());
        }
        if let Some(missing) = expected.iter().find(|p| !p.exists()) {
            return Err(PipelineError::conversion(
                "greedy",
                target,
                format!("expected output {} was not written", missing.display()),
            )
            .into());
        }
        Ok(())
    }

    /// Affine then deformable registration of `moving` onto `fixed`. Transforms go into `transforms_dir`.
    pub async fn register(
        &self,
        fixed: &Path,
        moving: &Path,
        masks: RegistrationMasks<'_>,
        transforms_dir: &Path,
    ) -> Result<TransformSet> {
        let transforms = TransformSet::for_image(transforms_dir, moving);

        self.run(
            self.affine_args(fixed, moving, &transforms.affine, masks),
            moving,
            &[transforms.affine.as_path()],
        )
        .await?;
        tracing::info!(
            "Affine alignment: {} -> {} | transform: {}",
            file_name(moving),
            file_name(fixed),
            file_name(&transforms.affine)
        );

        self.run(
            self.deformable_args(fixed, moving, &transforms, masks),
            moving,
            &[transforms.warp.as_path(), transforms.inverse_warp.as_path()],
        )
        .await?;
        tracing::info!(
            "Deformable alignment: {} -> {} | warp: {}",
            file_name(moving),
            file_name(fixed),
            file_name(&transforms.warp)
        );

        Ok(transforms)
    }

    /// Applies `transforms` to `moving` (and an optional label image) on the grid of `reference`.
    pub async fn reslice(
        &self,
        reference: &Path,
        moving: &Path,
        output: &Path,
        label: Option<(&Path, &Path)>,
        transforms: &TransformSet,
    ) -> Result<()> {
        let mut expected = vec![output];
        if let Some((_, seg_out)) = label {
            expected.push(seg_out);
        }
        self.run(
            self.reslice_args(reference, moving, output, label, transforms),
            moving,
            &expected,
        )
        .await?;
        tracing::info!("Resliced {} -> {}", file_name(moving), output.display());
        Ok(())
    }
}
