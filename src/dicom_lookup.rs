//! Predicts the filenames the conversion engine writes for a DICOM directory, so the converted
//! volumes can be renamed with their modality prefix afterwards.
//!
//! The lookup must be built from the original DICOM directory before the engine runs:
//!
//! ```text
//! let mut table = build_lookup(&dicom_dir)?;
//! engine.convert(&dicom_dir, &tracer_dir).await?;
//! apply_lookup(&tracer_dir, &mut table)?;
//! ```

use anyhow::{Context, Result};
use dicom_object::DefaultDicomObject;
use regex::Regex;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use unicode_normalization::UnicodeNormalization;

use crate::classifier::{list_dicom_files, open_dicom_header};
use crate::modality::{is_nifti_name, nifti_stem, normalize_dicom_modality};

/// Identifying metadata of one DICOM series.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DicomSeriesRecord {
    pub series_number: Option<String>,
    pub series_description: Option<String>,
    pub sequence_name: Option<String>,
    pub protocol_name: Option<String>,
    pub series_instance_uid: Option<String>,
    /// Normalized modality tag (`PT` already mapped to `PET`).
    pub modality: String,
}

impl DicomSeriesRecord {
    /// Filename the conversion engine produces for this series, or `None` when the series
    /// carries no usable identifier.
    ///
    /// Fallback chain: number + description, number + sequence name, number + protocol name,
    /// then series instance UID alone.
    pub fn predicted_filename(&self) -> Option<String> {
        if let Some(number) = &self.series_number {
            let text = self
                .series_description
                .as_ref()
                .or(self.sequence_name.as_ref())
                .or(self.protocol_name.as_ref());
            if let Some(text) = text {
                return Some(format!(
                    "{}_{}.nii",
                    normalize_text(number),
                    normalize_text(text)
                ));
            }
        }
        self.series_instance_uid
            .as_ref()
            .map(|uid| format!("{}.nii", normalize_text(uid)))
    }
}

/// Predicted filename → series record.
pub type LookupTable = BTreeMap<String, DicomSeriesRecord>;

fn non_word_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^\w\s-]").expect("static regex"))
}

fn separator_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[-\s]+").expect("static regex"))
}

/// Normalizes free text the way the conversion engine does before using it in a filename.
///
/// Spaces become underscores, accents are stripped (NFKD, non-ASCII dropped), the result is
/// trimmed and lower-cased, non-word characters are removed, and runs of hyphens or remaining
/// whitespace collapse into a single hyphen.
pub fn normalize_text(value: &str) -> String {
    let underscored = value.replace(' ', "_");
    let ascii: String = underscored.nfkd().filter(|c| c.is_ascii()).collect();
    let lowered = ascii.trim().to_lowercase();
    let cleaned = non_word_re().replace_all(&lowered, "");
    separator_re().replace_all(&cleaned, "-").into_owned()
}

fn read_text(obj: &DefaultDicomObject, name: &str) -> Option<String> {
    obj.element_by_name(name)
        .ok()
        .and_then(|e| e.to_str().ok())
        .map(|s| s.trim().trim_end_matches('\0').to_string())
        .filter(|s| !s.is_empty())
}

/// Reads the series record of one DICOM file.
pub fn read_series_record(path: &Path) -> Result<DicomSeriesRecord> {
    let obj = open_dicom_header(path)?;
    let modality = read_text(&obj, "Modality").unwrap_or_default();

    Ok(DicomSeriesRecord {
        series_number: read_text(&obj, "SeriesNumber"),
        series_description: read_text(&obj, "SeriesDescription"),
        sequence_name: read_text(&obj, "SequenceName"),
        protocol_name: read_text(&obj, "ProtocolName"),
        series_instance_uid: read_text(&obj, "SeriesInstanceUID"),
        modality: normalize_dicom_modality(&modality),
    })
}

/// Builds the predicted-filename table for every DICOM file in `dicom_dir`.
///
/// Files of the same series collapse into one entry.
pub fn build_lookup(dicom_dir: &Path) -> Result<LookupTable> {
    let mut table = LookupTable::new();

    for file in list_dicom_files(dicom_dir)? {
        let record = match read_series_record(&file) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("Skipping {}: {:#}", file.display(), e);
                continue;
            }
        };
        match record.predicted_filename() {
            Some(name) => {
                table.entry(name).or_insert(record);
            }
            None => {
                tracing::warn!(
                    "No series number, description or UID in {}; it cannot be renamed",
                    file.display()
                );
            }
        }
    }

    Ok(table)
}

/// Renames converted volumes in `output_dir` to `{modality}_{filename}`.
///
/// Matched entries are removed from `table`; files without an entry are left as they are.
/// Returns the new paths.
pub fn apply_lookup(output_dir: &Path, table: &mut LookupTable) -> Result<Vec<PathBuf>> {
    let mut names: Vec<String> = fs::read_dir(output_dir)
        .with_context(|| format!("Failed to list {}", output_dir.display()))?
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_file())
        .filter_map(|e| e.file_name().to_str().map(|s| s.to_string()))
        .filter(|n| is_nifti_name(n))
        .collect();
    names.sort();

    let mut renamed = Vec::new();
    for name in names {
        let key = format!("{}.nii", nifti_stem(&name));
        let Some(record) = table.remove(&key) else {
            continue;
        };
        let target = output_dir.join(format!("{}_{}", record.modality, name));
        fs::rename(output_dir.join(&name), &target)
            .with_context(|| format!("Failed to rename {} to {}", name, target.display()))?;
        tracing::info!("Renamed {} -> {}", name, target.display());
        renamed.push(target);
    }

    Ok(renamed)
}
