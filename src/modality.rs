//! Required imaging modalities and the filename conventions that identify them.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Imaging modalities a tracer directory must carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Modality {
    Pet,
    Ct,
}

/// Required modalities in the order they are reported.
pub const DEFAULT_MODALITIES: [Modality; 2] = [Modality::Ct, Modality::Pet];

impl Modality {
    /// Canonical tag, also the prefix the standardizer writes.
    pub fn tag(self) -> &'static str {
        match self {
            Modality::Pet => "PET",
            Modality::Ct => "CT",
        }
    }

    /// Filename prefixes accepted as this modality.
    pub fn prefixes(self) -> &'static [&'static str] {
        match self {
            Modality::Pet => &["PET_", "PT_"],
            Modality::Ct => &["CT_"],
        }
    }

    /// Name of the staging directory under the workspace.
    pub fn staging_dir(self) -> &'static str {
        match self {
            Modality::Pet => "PT",
            Modality::Ct => "CT",
        }
    }

    pub fn matches(self, file_name: &str) -> bool {
        self.prefixes().iter().any(|p| file_name.starts_with(p))
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "PET" | "PT" => Some(Modality::Pet),
            "CT" => Some(Modality::Ct),
            _ => None,
        }
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Maps a DICOM Modality (0008,0060) code to the tag used in filenames.
///
/// `PT` becomes `PET`; every other code passes through unchanged.
pub fn normalize_dicom_modality(code: &str) -> String {
    let code = code.trim();
    if code.eq_ignore_ascii_case("PT") {
        Modality::Pet.tag().to_string()
    } else {
        code.to_string()
    }
}

pub fn is_nifti_name(name: &str) -> bool {
    name.ends_with(".nii") || name.ends_with(".nii.gz")
}

pub fn is_nifti_path(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(is_nifti_name)
        .unwrap_or(false)
}

/// Strips `.nii` / `.nii.gz` from a filename.
pub fn nifti_stem(name: &str) -> &str {
    name.strip_suffix(".nii.gz")
        .or_else(|| name.strip_suffix(".nii"))
        .unwrap_or(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefixes_are_disjoint_across_modalities() {
        for a in DEFAULT_MODALITIES {
            for b in DEFAULT_MODALITIES {
                if a == b {
                    continue;
                }
                for pa in a.prefixes() {
                    for pb in b.prefixes() {
                        assert!(!pa.starts_with(pb) && !pb.starts_with(pa), "{pa} vs {pb}");
                    }
                }
            }
        }
    }

    #[test]
    fn test_pt_normalizes_to_pet_and_others_pass_through() {
        assert_eq!(normalize_dicom_modality("PT"), "PET");
        assert_eq!(normalize_dicom_modality("CT"), "CT");
        assert_eq!(normalize_dicom_modality("MR"), "MR");
    }

    #[test]
    fn test_matches_accepts_both_pet_spellings() {
        assert!(Modality::Pet.matches("PT_a.nii.gz"));
        assert!(Modality::Pet.matches("PET_3_wb.nii"));
        assert!(!Modality::Pet.matches("CT_a.nii.gz"));
        assert!(Modality::Ct.matches("CT_a.nii.gz"));
    }

    #[test]
    fn test_nifti_helpers() {
        assert!(is_nifti_name("a.nii"));
        assert!(is_nifti_name("a.nii.gz"));
        assert!(!is_nifti_name("a.dcm"));
        assert_eq!(nifti_stem("CT_a.nii.gz"), "CT_a");
        assert_eq!(Modality::parse("pt"), Some(Modality::Pet));
        assert_eq!(Modality::parse("MR"), None);
    }
}
