//! Tracer directory entry classification.

use anyhow::{Context, Result};
use dicom_dictionary_std::tags;
use dicom_object::{DefaultDicomObject, OpenFileOptions};
use std::fs;
use std::path::{Path, PathBuf};

use crate::modality::is_nifti_name;

/// What a single entry inside a tracer directory is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    /// Directory holding at least one readable DICOM file.
    DicomSeries,
    /// Standalone file that parses as DICOM.
    DicomFile,
    /// Already a `.nii` / `.nii.gz` volume.
    Nifti,
    /// Dot-file, never touched.
    Hidden,
    /// Any other regular file; converted with the general image reader.
    GenericImage,
    /// Directory without DICOM content.
    Unrecognized,
}

impl EntryKind {
    pub fn needs_conversion(&self) -> bool {
        matches!(
            self,
            EntryKind::DicomSeries | EntryKind::DicomFile | EntryKind::GenericImage
        )
    }
}

/// Opens a DICOM file without loading its pixel data.
pub fn open_dicom_header(path: &Path) -> Result<DefaultDicomObject> {
    OpenFileOptions::new()
        .read_until(tags::PIXEL_DATA)
        .open_file(path)
        .with_context(|| format!("Failed to open DICOM file {}", path.display()))
}

/// True when the file parses as a DICOM data set. Never fails.
pub fn is_dicom_file(path: &Path) -> bool {
    path.is_file() && open_dicom_header(path).is_ok()
}

/// Lists the regular files of `dir` that parse as DICOM, sorted by name.
pub fn list_dicom_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("Failed to list {}", dir.display()))?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| is_dicom_file(p))
        .collect();
    files.sort();
    Ok(files)
}

fn contains_dicom(dir: &Path) -> bool {
    match fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .any(|e| is_dicom_file(&e.path())),
        Err(_) => false,
    }
}

/// Decides how the standardizer treats `path`. Pure inspection.
pub fn classify_entry(path: &Path) -> EntryKind {
    if path.is_dir() {
        return if contains_dicom(path) {
            EntryKind::DicomSeries
        } else {
            EntryKind::Unrecognized
        };
    }

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    if name.starts_with('.') {
        EntryKind::Hidden
    } else if is_nifti_name(&name) {
        EntryKind::Nifti
    } else if is_dicom_file(path) {
        EntryKind::DicomFile
    } else {
        EntryKind::GenericImage
    }
}
