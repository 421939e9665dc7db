//! Re-export of aligned NIfTI volumes as DICOM Secondary Capture series.

use anyhow::{anyhow, Context, Result};
use dicom_core::{DataElement, PrimitiveValue, VR};
use dicom_dictionary_std::{tags, uids};
use dicom_object::{FileMetaTableBuilder, InMemDicomObject};
use nifti::NiftiHeader;
use ndarray::{Array3, Array4, Ix4};
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::modality::nifti_stem;
use crate::volume::{finite_range, Volume};
use crate::workspace::file_name;

/// Appended to the series description of every exported series.
pub const PROCESSED_BY_MARKER: &str = "Processed by PUMA-Z";

/// `2.25` root UID from a random UUID.
pub fn generate_uid() -> String {
    format!("2.25.{}", Uuid::new_v4().as_u128())
}

/// `{aligned_dir}/{stem}_dicom` for a NIfTI file.
pub fn dicom_dir_for(aligned_dir: &Path, nifti: &Path) -> PathBuf {
    aligned_dir.join(format!("{}_dicom", nifti_stem(&file_name(nifti))))
}

/// Slice geometry derived from the NIfTI header, in DICOM patient (LPS) coordinates.
struct Geometry {
    spacing: [f32; 3],
    srow: Option<[[f32; 4]; 3]>,
}

/// RAS direction to LPS. Adding 0.0 turns -0.0 into 0.0.
fn to_lps(v: [f32; 3]) -> [f32; 3] {
    [-v[0] + 0.0, -v[1] + 0.0, v[2] + 0.0]
}

fn unit(v: [f32; 3]) -> Option<[f32; 3]> {
    let norm = (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt();
    (norm > 0.0 && norm.is_finite()).then(|| v.map(|c| c / norm + 0.0))
}

impl Geometry {
    fn from_header(header: &NiftiHeader, spacing: [f32; 3]) -> Self {
        let srow = (header.sform_code > 0).then_some([header.srow_x, header.srow_y, header.srow_z]);
        Self { spacing, srow }
    }

    fn axis(rows: &[[f32; 4]; 3], i: usize) -> [f32; 3] {
        [rows[0][i], rows[1][i], rows[2][i]]
    }

    fn position(&self, k: usize) -> [f32; 3] {
        let k = k as f32;
        match self.srow {
            Some(rows) => to_lps(rows.map(|r| r[2] * k + r[3])),
            None => [0.0, 0.0, self.spacing[2] * k],
        }
    }

    /// Row then column direction cosines. Rows run along voxel x, columns along voxel y.
    fn orientation(&self) -> [f32; 6] {
        const IDENTITY: [f32; 6] = [1.0, 0.0, 0.0, 0.0, 1.0, 0.0];
        let Some(rows) = self.srow else {
            return IDENTITY;
        };
        match (
            unit(to_lps(Self::axis(&rows, 0))),
            unit(to_lps(Self::axis(&rows, 1))),
        ) {
            (Some(r), Some(c)) => [r[0], r[1], r[2], c[0], c[1], c[2]],
            _ => IDENTITY,
        }
    }
}

fn text(tag: dicom_core::Tag, vr: VR, value: impl Into<String>) -> DataElement<InMemDicomObject> {
    DataElement::new(tag, vr, PrimitiveValue::from(value.into()))
}

fn decimal_list(values: &[f32]) -> String {
    values
        .iter()
        .map(|v| format!("{:.6}", v))
        .collect::<Vec<_>>()
        .join("\\")
}

/// Writes DICOM series for one run. All series share a study UID.
pub struct DicomExporter {
    study_uid: String,
}

struct SeriesInfo<'a> {
    uid: String,
    number: u32,
    description: String,
    modality: &'a str,
}

impl DicomExporter {
    pub fn new() -> Self {
        Self {
            study_uid: generate_uid(),
        }
    }

    fn slice_elements(
        &self,
        series: &SeriesInfo<'_>,
        sop_uid: &str,
        geometry: &Geometry,
        slice: usize,
        (rows, columns): (usize, usize),
    ) -> Result<Vec<DataElement<InMemDicomObject>>> {
        let rows = u16::try_from(rows).with_context(|| format!("{} rows exceed the DICOM limit", rows))?;
        let columns =
            u16::try_from(columns).with_context(|| format!("{} columns exceed the DICOM limit", columns))?;
        Ok(vec![
            text(tags::SOP_CLASS_UID, VR::UI, uids::SECONDARY_CAPTURE_IMAGE_STORAGE),
            text(tags::SOP_INSTANCE_UID, VR::UI, sop_uid),
            text(tags::MODALITY, VR::CS, series.modality),
            text(tags::STUDY_INSTANCE_UID, VR::UI, self.study_uid.as_str()),
            text(tags::SERIES_INSTANCE_UID, VR::UI, series.uid.as_str()),
            text(tags::SERIES_NUMBER, VR::IS, series.number.to_string()),
            text(tags::SERIES_DESCRIPTION, VR::LO, series.description.as_str()),
            text(tags::INSTANCE_NUMBER, VR::IS, (slice + 1).to_string()),
            text(
                tags::IMAGE_POSITION_PATIENT,
                VR::DS,
                decimal_list(&geometry.position(slice)),
            ),
            text(
                tags::IMAGE_ORIENTATION_PATIENT,
                VR::DS,
                decimal_list(&geometry.orientation()),
            ),
            text(
                tags::PIXEL_SPACING,
                VR::DS,
                decimal_list(&[geometry.spacing[1], geometry.spacing[0]]),
            ),
            text(tags::SLICE_THICKNESS, VR::DS, format!("{:.6}", geometry.spacing[2])),
            DataElement::new(tags::ROWS, VR::US, PrimitiveValue::from(rows)),
            DataElement::new(tags::COLUMNS, VR::US, PrimitiveValue::from(columns)),
        ])
    }

    fn write_slice(
        path: &Path,
        sop_uid: &str,
        elements: Vec<DataElement<InMemDicomObject>>,
    ) -> Result<()> {
        let obj = InMemDicomObject::from_element_iter(elements);
        let file_obj = obj
            .with_meta(
                FileMetaTableBuilder::new()
                    .transfer_syntax(uids::EXPLICIT_VR_LITTLE_ENDIAN)
                    .media_storage_sop_class_uid(uids::SECONDARY_CAPTURE_IMAGE_STORAGE)
                    .media_storage_sop_instance_uid(sop_uid),
            )
            .context("Failed to build DICOM file meta")?;
        file_obj
            .write_to_file(path)
            .with_context(|| format!("Failed to write {}", path.display()))
    }

    /// Exports a scalar volume as 16-bit MONOCHROME2 slices with rescale slope/intercept.
    /// Returns the number of files written.
    pub fn export_volume(&self, nifti: &Path, output_dir: &Path, series_number: u32) -> Result<usize> {
        let vol = Volume::read(nifti)?;
        let data = vol.to_3d()?;
        let geometry = Geometry::from_header(&vol.header, vol.spacing());
        let series = SeriesInfo {
            uid: generate_uid(),
            number: series_number,
            description: format!("{} - {}", nifti_stem(&file_name(nifti)), PROCESSED_BY_MARKER),
            modality: "PT",
        };

        let (lo, hi) = finite_range(data.iter()).unwrap_or((0.0, 0.0));
        let slope = if hi > lo { (hi - lo) / f32::from(u16::MAX) } else { 1.0 };
        let stored: Array3<u16> = data.mapv(|v| {
            if v.is_finite() {
                ((v - lo) / slope).round().clamp(0.0, f32::from(u16::MAX)) as u16
            } else {
                0
            }
        });

        fs::create_dir_all(output_dir)
            .with_context(|| format!("Failed to create {}", output_dir.display()))?;
        let (nx, ny, nz) = stored.dim();

        for k in 0..nz {
            let sop_uid = generate_uid();
            let mut elements = self.slice_elements(&series, &sop_uid, &geometry, k, (ny, nx))?;

            let mut bytes = Vec::with_capacity(nx * ny * 2);
            for r in 0..ny {
                for c in 0..nx {
                    bytes.extend_from_slice(&stored[[c, r, k]].to_le_bytes());
                }
            }
            elements.extend([
                text(tags::PHOTOMETRIC_INTERPRETATION, VR::CS, "MONOCHROME2"),
                DataElement::new(tags::SAMPLES_PER_PIXEL, VR::US, PrimitiveValue::from(1u16)),
                DataElement::new(tags::BITS_ALLOCATED, VR::US, PrimitiveValue::from(16u16)),
                DataElement::new(tags::BITS_STORED, VR::US, PrimitiveValue::from(16u16)),
                DataElement::new(tags::HIGH_BIT, VR::US, PrimitiveValue::from(15u16)),
                DataElement::new(tags::PIXEL_REPRESENTATION, VR::US, PrimitiveValue::from(0u16)),
                text(tags::RESCALE_INTERCEPT, VR::DS, format!("{:.6}", lo)),
                text(tags::RESCALE_SLOPE, VR::DS, format!("{:.9}", slope)),
                DataElement::new(tags::PIXEL_DATA, VR::OW, PrimitiveValue::from(bytes)),
            ]);

            Self::write_slice(&output_dir.join(format!("{:04}.dcm", k + 1)), &sop_uid, elements)?;
        }

        tracing::info!("Exported {} as {} DICOM slice(s) into {}", nifti.display(), nz, output_dir.display());
        Ok(nz)
    }

    /// Exports an `x, y, z, 3` composite as 8-bit RGB slices.
    pub fn export_rgb(&self, composite: &Path, output_dir: &Path, series_number: u32) -> Result<usize> {
        let vol = Volume::read(composite)?;
        let data: Array4<f32> = vol
            .data
            .clone()
            .into_dimensionality::<Ix4>()
            .map_err(|_| anyhow!("{} is not a 4-D RGB composite", composite.display()))?;
        let (nx, ny, nz, channels) = data.dim();
        if channels != 3 {
            return Err(anyhow!(
                "{} has {} channels, expected 3",
                composite.display(),
                channels
            ));
        }

        let geometry = Geometry::from_header(&vol.header, vol.spacing());
        let series = SeriesInfo {
            uid: generate_uid(),
            number: series_number,
            description: format!("Multiplexed composite - {}", PROCESSED_BY_MARKER),
            modality: "OT",
        };

        fs::create_dir_all(output_dir)
            .with_context(|| format!("Failed to create {}", output_dir.display()))?;

        for k in 0..nz {
            let sop_uid = generate_uid();
            let mut elements = self.slice_elements(&series, &sop_uid, &geometry, k, (ny, nx))?;

            let mut bytes = Vec::with_capacity(nx * ny * 3);
            for r in 0..ny {
                for c in 0..nx {
                    for ch in 0..3 {
                        bytes.push(data[[c, r, k, ch]].round().clamp(0.0, 255.0) as u8);
                    }
                }
            }
            elements.extend([
                text(tags::PHOTOMETRIC_INTERPRETATION, VR::CS, "RGB"),
                DataElement::new(tags::SAMPLES_PER_PIXEL, VR::US, PrimitiveValue::from(3u16)),
                DataElement::new(tags::PLANAR_CONFIGURATION, VR::US, PrimitiveValue::from(0u16)),
                DataElement::new(tags::BITS_ALLOCATED, VR::US, PrimitiveValue::from(8u16)),
                DataElement::new(tags::BITS_STORED, VR::US, PrimitiveValue::from(8u16)),
                DataElement::new(tags::HIGH_BIT, VR::US, PrimitiveValue::from(7u16)),
                DataElement::new(tags::PIXEL_REPRESENTATION, VR::US, PrimitiveValue::from(0u16)),
                DataElement::new(tags::PIXEL_DATA, VR::OB, PrimitiveValue::from(bytes)),
            ]);

            Self::write_slice(&output_dir.join(format!("{:04}.dcm", k + 1)), &sop_uid, elements)?;
        }

        tracing::info!("Exported composite {} into {}", composite.display(), output_dir.display());
        Ok(nz)
    }
}

impl Default for DicomExporter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::{write_f32, write_u8};
    use dicom_object::open_file;
    use ndarray::Array;

    #[test]
    fn test_uid_shape() {
        let uid = generate_uid();
        assert!(uid.starts_with("2.25."));
        assert!(uid.len() <= 64);
        assert!(uid[5..].chars().all(|c| c.is_ascii_digit()));
        assert_ne!(uid, generate_uid());
    }

    #[test]
    fn test_dicom_dir_for() {
        assert_eq!(
            dicom_dir_for(Path::new("/w/aligned_PT"), Path::new("/w/aligned_PT/aligned_PT_PSMA_PT_a.nii.gz")),
            Path::new("/w/aligned_PT/aligned_PT_PSMA_PT_a_dicom")
        );
    }

    #[test]
    fn test_export_volume_writes_one_file_per_slice() {
        let dir = tempfile::tempdir().unwrap();
        let nifti = dir.path().join("aligned_PT_FDG.nii.gz");
        let data = Array::from_shape_fn((2, 3, 4), |(x, y, z)| (x + y + z) as f32).into_dyn();
        write_f32(&nifti, &data, None).unwrap();

        let out = dir.path().join("dicom");
        let written = DicomExporter::new().export_volume(&nifti, &out, 1001).unwrap();

        assert_eq!(written, 4);
        assert_eq!(fs::read_dir(&out).unwrap().count(), 4);

        let obj = open_file(out.join("0001.dcm")).unwrap();
        assert_eq!(obj.element(tags::ROWS).unwrap().to_int::<u16>().unwrap(), 3);
        assert_eq!(obj.element(tags::COLUMNS).unwrap().to_int::<u16>().unwrap(), 2);
        let desc = obj.element(tags::SERIES_DESCRIPTION).unwrap().to_str().unwrap();
        assert!(desc.contains(PROCESSED_BY_MARKER));
        assert_eq!(obj.element(tags::PIXEL_DATA).unwrap().to_bytes().unwrap().len(), 12);
    }

    fn orientation_of(dicom: &Path) -> Vec<f64> {
        open_file(dicom)
            .unwrap()
            .element(tags::IMAGE_ORIENTATION_PATIENT)
            .unwrap()
            .to_multi_float64()
            .unwrap()
            .to_vec()
    }

    #[test]
    fn test_orientation_follows_sform() {
        let dir = tempfile::tempdir().unwrap();
        let nifti = dir.path().join("las.nii.gz");
        let mut header = NiftiHeader::default();
        header.sform_code = 1;
        header.srow_x = [-2.0, 0.0, 0.0, 10.0];
        header.srow_y = [0.0, 2.0, 0.0, -20.0];
        header.srow_z = [0.0, 0.0, 3.0, 5.0];
        let data = Array::from_shape_fn((2, 2, 2), |(x, y, z)| (x + y + z) as f32).into_dyn();
        write_f32(&nifti, &data, Some(&header)).unwrap();

        let out = dir.path().join("dicom");
        DicomExporter::new().export_volume(&nifti, &out, 1001).unwrap();

        assert_eq!(orientation_of(&out.join("0001.dcm")), vec![1.0, 0.0, 0.0, 0.0, -1.0, 0.0]);
        let position = open_file(out.join("0002.dcm"))
            .unwrap()
            .element(tags::IMAGE_POSITION_PATIENT)
            .unwrap()
            .to_multi_float64()
            .unwrap()
            .to_vec();
        assert_eq!(position, vec![-10.0, 20.0, 8.0]);
    }

    #[test]
    fn test_orientation_without_sform_is_identity() {
        let dir = tempfile::tempdir().unwrap();
        let nifti = dir.path().join("plain.nii.gz");
        write_f32(&nifti, &Array3::<f32>::zeros((2, 2, 1)).into_dyn(), None).unwrap();

        let out = dir.path().join("dicom");
        DicomExporter::new().export_volume(&nifti, &out, 1001).unwrap();

        assert_eq!(orientation_of(&out.join("0001.dcm")), vec![1.0, 0.0, 0.0, 0.0, 1.0, 0.0]);
    }

    #[test]
    fn test_export_rgb_composite() {
        let dir = tempfile::tempdir().unwrap();
        let composite = dir.path().join("multiplexed_composite_image.nii.gz");
        let data = Array::from_shape_fn((2, 2, 3, 3), |(_, _, _, c)| (c * 100) as u8).into_dyn();
        write_u8(&composite, &data, None).unwrap();

        let out = dir.path().join("mpx_dicom");
        assert_eq!(DicomExporter::new().export_rgb(&composite, &out, 1100).unwrap(), 3);

        let obj = open_file(out.join("0002.dcm")).unwrap();
        let photometric = obj
            .element(tags::PHOTOMETRIC_INTERPRETATION)
            .unwrap()
            .to_str()
            .unwrap();
        assert_eq!(photometric.trim(), "RGB");
        let pixels = obj.element(tags::PIXEL_DATA).unwrap().to_bytes().unwrap();
        assert_eq!(&pixels[..3], &[0, 100, 200]);
    }

    #[test]
    fn test_export_rgb_rejects_scalar_volume() {
        let dir = tempfile::tempdir().unwrap();
        let nifti = dir.path().join("scalar.nii.gz");
        write_f32(&nifti, &Array3::<f32>::zeros((2, 2, 2)).into_dyn(), None).unwrap();
        assert!(DicomExporter::new()
            .export_rgb(&nifti, &dir.path().join("out"), 1)
            .is_err());
    }
}
