//! NIfTI volume I/O shared by mask preparation, multiplexing and export.

use anyhow::{anyhow, Context, Result};
use ndarray::{Array3, ArrayD, Axis, Ix3};
use nifti::writer::WriterOptions;
use nifti::{IntoNdArray, NiftiHeader, NiftiObject, ReaderOptions};
use std::path::Path;

/// A volume with its header. Intensities are already scaled by `scl_slope`/`scl_inter`.
pub struct Volume {
    pub header: NiftiHeader,
    pub data: ArrayD<f32>,
}

impl Volume {
    pub fn read(path: &Path) -> Result<Self> {
        let obj = ReaderOptions::new()
            .read_file(path)
            .with_context(|| format!("Failed to read NIfTI {}", path.display()))?;
        let header = obj.header().clone();
        let data = obj
            .into_volume()
            .into_ndarray::<f32>()
            .with_context(|| format!("Failed to decode voxels of {}", path.display()))?;
        Ok(Self { header, data })
    }

    /// The data as a 3-D array. A 4-D volume with a single frame is squeezed.
    pub fn to_3d(&self) -> Result<Array3<f32>> {
        match self.data.ndim() {
            3 => Ok(self.data.clone().into_dimensionality::<Ix3>()?),
            4 if self.data.shape()[3] == 1 => Ok(self
                .data
                .index_axis(Axis(3), 0)
                .to_owned()
                .into_dimensionality::<Ix3>()?),
            n => Err(anyhow!("Expected a 3-D volume, found {} dimensions", n)),
        }
    }

    /// Voxel spacing (x, y, z) in millimetres.
    pub fn spacing(&self) -> [f32; 3] {
        let p = self.header.pixdim;
        [p[1], p[2], p[3]].map(|v| if v > 0.0 { v } else { 1.0 })
    }
}

/// Copy of `reference` (or a default header) with identity intensity scaling.
fn output_header(reference: Option<&NiftiHeader>) -> NiftiHeader {
    let mut header = reference.cloned().unwrap_or_default();
    header.scl_slope = 1.0;
    header.scl_inter = 0.0;
    header
}

pub fn write_f32(path: &Path, data: &ArrayD<f32>, reference: Option<&NiftiHeader>) -> Result<()> {
    let header = output_header(reference);
    WriterOptions::new(path)
        .reference_header(&header)
        .write_nifti(data)
        .with_context(|| format!("Failed to write {}", path.display()))
}

pub fn write_u8(path: &Path, data: &ArrayD<u8>, reference: Option<&NiftiHeader>) -> Result<()> {
    let header = output_header(reference);
    WriterOptions::new(path)
        .reference_header(&header)
        .write_nifti(data)
        .with_context(|| format!("Failed to write {}", path.display()))
}

pub fn write_u16(path: &Path, data: &ArrayD<u16>, reference: Option<&NiftiHeader>) -> Result<()> {
    let header = output_header(reference);
    WriterOptions::new(path)
        .reference_header(&header)
        .write_nifti(data)
        .with_context(|| format!("Failed to write {}", path.display()))
}

/// Min and max of the finite voxels, `None` for an empty or all-NaN volume.
pub fn finite_range<'a>(values: impl IntoIterator<Item = &'a f32>) -> Option<(f32, f32)> {
    values
        .into_iter()
        .filter(|v| v.is_finite())
        .fold(None, |acc, &v| match acc {
            None => Some((v, v)),
            Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array, IxDyn};

    #[test]
    fn test_write_then_read_keeps_shape_and_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("v.nii.gz");
        let data = Array::from_shape_fn(IxDyn(&[4, 3, 2]), |d| (d[0] + 10 * d[1] + 100 * d[2]) as f32);

        write_f32(&path, &data, None).unwrap();
        let vol = Volume::read(&path).unwrap();

        assert_eq!(vol.data.shape(), &[4, 3, 2]);
        assert_eq!(vol.data[[3, 2, 1]], 123.0);
        assert_eq!(vol.to_3d().unwrap().dim(), (4, 3, 2));
    }

    #[test]
    fn test_finite_range_skips_nan() {
        let v = [f32::NAN, 2.0, -1.0, 5.0];
        assert_eq!(finite_range(v.iter()), Some((-1.0, 5.0)));
        assert_eq!(finite_range([f32::NAN].iter()), None);
    }
}
