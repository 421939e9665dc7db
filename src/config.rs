//! Runtime configuration: crate defaults, the optional TOML file and their merge.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;

use crate::command::ExternalCommand;
use crate::modality::{Modality, DEFAULT_MODALITIES};
use crate::registration::DEFAULT_MULTI_RESOLUTION;
use crate::resources::{BinaryRegistry, DEFAULT_REGISTRY_BASE_URL};

/// Default runtime configuration file path.
pub const DEFAULT_CONFIG_PATH: &str = "config/pumaz.toml";
/// DICOM to NIfTI conversion engine invoked once per DICOM directory.
pub const DEFAULT_CONVERTER: &str = "dicom2nifti";
/// Reorient, no compression: the engine writes `.nii` files next to the DICOM directory.
pub const DEFAULT_CONVERTER_ARGS: [&str; 4] = ["-r", "-C", "{input}", "{output}"];
/// Directory that receives the run log.
pub const DEFAULT_LOG_DIR: &str = ".";

#[derive(Deserialize, Default, Debug)]
/// Runtime overrides loaded from the TOML config referenced by `main`.
pub struct RuntimeConfigFile {
    pub binary_dir: Option<PathBuf>,
    pub registry_base_url: Option<String>,
    pub converter: Option<String>,
    pub converter_args: Option<Vec<String>>,
    pub segmentation: Option<String>,
    pub segmentation_args: Option<Vec<String>>,
    pub multi_resolution: Option<String>,
    pub log_dir: Option<PathBuf>,
    pub reference_tracer: Option<String>,
    pub modalities: Option<Vec<String>>,
}

/// Final configuration passed by reference through the pipeline.
#[derive(Debug, Clone)]
pub struct EffectiveConfig {
    pub binary_dir: PathBuf,
    pub registry: BinaryRegistry,
    pub converter: ExternalCommand,
    pub segmentation: Option<ExternalCommand>,
    pub multi_resolution: String,
    pub log_dir: PathBuf,
    pub reference_tracer: Option<String>,
    pub modalities: Vec<Modality>,
}

impl EffectiveConfig {
    /// Returns the crate-level defaults before CLI/runtime overrides are merged.
    pub fn defaults() -> Self {
        Self {
            binary_dir: default_binary_dir(),
            registry: BinaryRegistry::with_base_url(DEFAULT_REGISTRY_BASE_URL),
            converter: ExternalCommand::new(
                DEFAULT_CONVERTER,
                DEFAULT_CONVERTER_ARGS.iter().map(|s| s.to_string()).collect(),
            ),
            segmentation: None,
            multi_resolution: DEFAULT_MULTI_RESOLUTION.to_string(),
            log_dir: PathBuf::from(DEFAULT_LOG_DIR),
            reference_tracer: None,
            modalities: DEFAULT_MODALITIES.to_vec(),
        }
    }

    /// Applies a runtime file on top of the defaults.
    ///
    /// A segmentation program without explicit arguments is called as `{program} {input} {output}`.
    pub fn from_runtime(file: Option<RuntimeConfigFile>) -> Result<Self> {
        let mut cfg = Self::defaults();
        let f = file.unwrap_or_default();

        cfg.binary_dir = f.binary_dir.unwrap_or(cfg.binary_dir);
        if let Some(url) = sanitize_optional_string(f.registry_base_url) {
            cfg.registry = BinaryRegistry::with_base_url(&url);
        }
        if let Some(program) = sanitize_optional_string(f.converter) {
            cfg.converter.program = program;
        }
        if let Some(args) = f.converter_args {
            cfg.converter.args = args;
        }
        cfg.segmentation = sanitize_optional_string(f.segmentation).map(|program| {
            let args = f
                .segmentation_args
                .unwrap_or_else(|| vec!["{input}".to_string(), "{output}".to_string()]);
            ExternalCommand::new(program, args)
        });
        cfg.multi_resolution = sanitize_optional_string(f.multi_resolution).unwrap_or(cfg.multi_resolution);
        cfg.log_dir = f.log_dir.unwrap_or(cfg.log_dir);
        cfg.reference_tracer = sanitize_optional_string(f.reference_tracer);
        if let Some(list) = f.modalities {
            cfg.modalities = parse_modalities(&list)?;
        }

        Ok(cfg)
    }
}

/// `bin/` next to the running executable, or `./bin` when that cannot be determined.
pub fn default_binary_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|p| p.join("bin")))
        .unwrap_or_else(|| PathBuf::from("bin"))
}

/// Parses the required modality list. Order is kept; duplicates are rejected.
pub fn parse_modalities(list: &[String]) -> Result<Vec<Modality>> {
    let mut out = Vec::new();
    for item in list {
        let m = Modality::parse(item).ok_or_else(|| anyhow!("Unknown modality '{}'", item))?;
        if out.contains(&m) {
            return Err(anyhow!("Modality '{}' listed twice", item));
        }
        out.push(m);
    }
    if out.is_empty() {
        return Err(anyhow!("At least one modality is required"));
    }
    Ok(out)
}

/// Attempts to read the runtime config file and deserialize overrides.
///
/// Returns `Ok(None)` when the file is missing so defaults are preserved.
pub fn load_runtime_config(path: Option<&PathBuf>) -> Result<Option<RuntimeConfigFile>> {
    let path = match path {
        Some(path) => path.clone(),
        None => PathBuf::from(DEFAULT_CONFIG_PATH),
    };

    if !path.exists() {
        return Ok(None);
    }

    let content = fs::read_to_string(&path).context("Failed to read runtime config")?;
    let parsed: RuntimeConfigFile =
        toml::from_str(&content).context("Failed to parse runtime config")?;
    Ok(Some(parsed))
}

/// Trims whitespace and drops empty strings.
pub fn sanitize_optional_string(value: Option<String>) -> Option<String> {
    value.and_then(|s| {
        let trimmed = s.trim().to_string();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed)
        }
    })
}
