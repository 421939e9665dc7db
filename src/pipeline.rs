//! Run orchestration: binaries, standardization, compliance, preprocessing, alignment and the
//! optional multiplex and DICOM export steps, strictly in that order.

use anyhow::{anyhow, Result};
use chrono::Local;
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::compliance::select_compliant;
use crate::config::EffectiveConfig;
use crate::converter::ConversionEngine;
use crate::error::PipelineError;
use crate::export::{dicom_dir_for, DicomExporter};
use crate::modality::Modality;
use crate::multiplex::{assign_channels, compose_composite, ChannelSelection, MULTIPLEXED_COMPOSITE_IMAGE};
use crate::registration::{RegistrationEngine, RegistrationMasks};
use crate::report::{summarize_status, write_reports, TracerResult};
use crate::resources::{executable_path, Platform, ResourceResolver};
use crate::segmentation::{obtain_body_mask, remove_ignored_regions, BodyRegion, SegmentationService};
use crate::standardize::standardize;
use crate::workspace::{
    copy_files_to_destination, discover_tracer_dirs, file_name, select_files_by_modality,
    PipelineWorkspace,
};

pub const ALIGNED_PREFIX: &str = "aligned_";
pub const REPORT_CSV: &str = "run_report.csv";
pub const REPORT_JSON: &str = "run_report.json";
/// First series number of exported DICOM series.
const EXPORT_SERIES_BASE: u32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum Stage {
    Init,
    BinariesReady,
    Standardized,
    Filtered,
    Preprocessed,
    Aligned,
    Multiplexed,
    Exported,
    Done,
}

/// Records stage transitions. Optional stages may be skipped; going back is an error.
#[derive(Debug, Clone)]
pub struct StageTracker {
    history: Vec<Stage>,
}

impl StageTracker {
    pub fn new() -> Self {
        Self {
            history: vec![Stage::Init],
        }
    }

    pub fn current(&self) -> Stage {
        self.history.last().copied().unwrap_or(Stage::Init)
    }

    pub fn advance(&mut self, to: Stage) -> Result<()> {
        let from = self.current();
        if to <= from {
            return Err(anyhow!("Cannot move from stage {:?} to {:?}", from, to));
        }
        tracing::info!("Stage {:?} -> {:?}", from, to);
        self.history.push(to);
        Ok(())
    }

    pub fn history(&self) -> &[Stage] {
        &self.history
    }
}

impl Default for StageTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-run choices taken from the command line.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub subject_dir: PathBuf,
    pub ignored_regions: Vec<BodyRegion>,
    /// `Some` enables multiplexing with the given channel selection.
    pub multiplex: Option<ChannelSelection>,
    pub export_dicom: bool,
    /// Overrides the configured reference tracer.
    pub reference: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunStatus {
    /// Every tracer aligned.
    Complete,
    /// At least one tracer failed; the others produced usable outputs.
    Partial,
    /// No compliant tracer was found.
    Empty,
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub workspace: Option<PathBuf>,
    pub results: Vec<TracerResult>,
    pub composite: Option<PathBuf>,
    pub stages: Vec<Stage>,
}

/// A tracer whose images are staged in the workspace.
#[derive(Debug, Clone)]
struct PreparedTracer {
    name: String,
    ct: PathBuf,
    pet: PathBuf,
    mask: Option<PathBuf>,
}

fn section(title: &str) {
    println!();
    println!("{}", title.magenta().bold());
    tracing::info!("{}", title);
}

fn aligned_name(dir: &Path, source: &Path) -> PathBuf {
    dir.join(format!("{}{}", ALIGNED_PREFIX, file_name(source)))
}

fn alignment_bar(len: u64) -> ProgressBar {
    let pb = ProgressBar::new(len);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );
    pb
}

/// Full run: fetches the registration engine for this machine, then runs every stage.
pub async fn run(config: &EffectiveConfig, options: &RunOptions) -> Result<RunOutcome> {
    let mut stages = StageTracker::new();

    section("BINARIES");
    let platform = Platform::current()?;
    println!("  Detected system: {} | architecture: {}", platform.os, platform.arch);
    let bundle = ResourceResolver::new(&config.registry, &config.binary_dir)
        .resolve_current()
        .await?;
    let greedy = RegistrationEngine::new(
        executable_path(&bundle, &platform),
        config.multi_resolution.clone(),
    );
    stages.advance(Stage::BinariesReady)?;

    run_stages(config, options, &greedy, stages).await
}

/// Runs every stage after binary acquisition with the given registration engine.
pub async fn run_stages(
    config: &EffectiveConfig,
    options: &RunOptions,
    greedy: &RegistrationEngine,
    mut stages: StageTracker,
) -> Result<RunOutcome> {
    let subject = options.subject_dir.as_path();
    if !subject.is_dir() {
        return Err(PipelineError::MissingInputPath(subject.to_path_buf()).into());
    }

    section("STANDARDIZING INPUT DATA TO NIFTI");
    let engine = ConversionEngine::new(config.converter.clone());
    let standardized = standardize(subject, &engine).await?;
    println!(
        "{} Standardization complete: {} file(s) produced, {} failure(s)",
        "✓".green(),
        standardized.produced.len(),
        standardized.failures.len()
    );
    stages.advance(Stage::Standardized)?;

    section("CHECKING FOR COMPLIANT TRACERS");
    let tracer_dirs = discover_tracer_dirs(subject)?;
    let compliance = select_compliant(&tracer_dirs, &config.modalities);
    for excluded in &compliance.excluded {
        println!("  {} {}: {}", "-".yellow(), file_name(&excluded.path), excluded.reason);
    }
    stages.advance(Stage::Filtered)?;

    if compliance.admitted.is_empty() {
        println!("{} No compliant tracer directory found; nothing to align", "!".yellow());
        stages.advance(Stage::Done)?;
        return Ok(RunOutcome {
            status: RunStatus::Empty,
            workspace: None,
            results: Vec::new(),
            composite: None,
            stages: stages.history().to_vec(),
        });
    }

    section("PREPROCESSING");
    let ws = PipelineWorkspace::create(subject, Local::now())?;
    println!("  Workspace: {}", ws.root.display());
    let mut results: Vec<TracerResult> = compliance
        .admitted
        .iter()
        .map(|d| TracerResult::new(&file_name(d)))
        .collect();
    let prepared = preprocess(config, options, &ws, &compliance.admitted, &mut results).await?;
    stages.advance(Stage::Preprocessed)?;

    section("ALIGNING TRACERS");
    let reference = choose_reference(config, options, &prepared, &compliance.admitted);
    let aligned = align(greedy, &ws, &prepared, &reference, &mut results).await;

    let moving = prepared.iter().filter(|t| t.name != reference).count();
    let moving_ok = aligned.iter().filter(|(n, _)| *n != reference).count();
    if prepared.is_empty() || (moving > 0 && moving_ok == 0) {
        write_run_reports(&ws, &results)?;
        return Err(PipelineError::NoTracersAligned { reference }.into());
    }
    if moving == 0 {
        tracing::warn!("Only the reference tracer {} is available; nothing was registered", reference);
        println!("{} Only the reference tracer is available", "!".yellow());
    }
    stages.advance(Stage::Aligned)?;

    let mut composite = None;
    if let Some(selection) = &options.multiplex {
        section("MULTIPLEXING");
        composite = multiplex(selection, &ws, &aligned, &mut results);
        stages.advance(Stage::Multiplexed)?;
    }

    if options.export_dicom {
        section("EXPORTING DICOM");
        export(&ws, &aligned, composite.as_deref());
        stages.advance(Stage::Exported)?;
    }

    write_run_reports(&ws, &results)?;
    let status = if results.iter().all(|r| r.succeeded()) {
        RunStatus::Complete
    } else {
        RunStatus::Partial
    };
    print_summary(&results);
    stages.advance(Stage::Done)?;

    Ok(RunOutcome {
        status,
        workspace: Some(ws.root.clone()),
        results,
        composite,
        stages: stages.history().to_vec(),
    })
}

fn result_for<'a>(results: &'a mut [TracerResult], name: &str) -> Option<&'a mut TracerResult> {
    results.iter_mut().find(|r| r.tracer == name)
}

async fn preprocess(
    config: &EffectiveConfig,
    options: &RunOptions,
    ws: &PipelineWorkspace,
    admitted: &[PathBuf],
    results: &mut [TracerResult],
) -> Result<Vec<PreparedTracer>> {
    let mut candidates = Vec::new();
    let mut pairs = Vec::new();

    for dir in admitted {
        let name = file_name(dir);
        let ct = select_files_by_modality(dir, Modality::Ct)?;
        let pet = select_files_by_modality(dir, Modality::Pet)?;
        let (Some(ct), Some(pet)) = (ct.first(), pet.first()) else {
            if let Some(r) = result_for(results, &name) {
                r.fail("CT or PET image disappeared before staging");
            }
            continue;
        };

        let staged_ct = ws.staged(Modality::Ct).join(format!("{}_{}", name, file_name(ct)));
        let staged_pet = ws.staged(Modality::Pet).join(format!("{}_{}", name, file_name(pet)));
        pairs.push((ct.clone(), staged_ct.clone()));
        pairs.push((pet.clone(), staged_pet.clone()));
        candidates.push((dir.clone(), name, staged_ct, staged_pet));
    }

    if let Err(e) = copy_files_to_destination(&pairs).await {
        tracing::error!("Staging copy failed: {:#}", e);
    }

    let service = config.segmentation.clone().map(SegmentationService::new);
    let mut prepared = Vec::new();

    for (dir, name, ct, pet) in candidates {
        if !ct.exists() || !pet.exists() {
            if let Some(r) = result_for(results, &name) {
                r.fail("staging copy failed");
            }
            continue;
        }

        match prepare_mask(&dir, &name, &ct, service.as_ref(), &options.ignored_regions, ws).await {
            Ok(mask) => {
                if mask.is_none() && !options.ignored_regions.is_empty() {
                    if let Some(r) = result_for(results, &name) {
                        r.notes.push(format!(
                            "no body mask; ignored regions not removed: {}",
                            region_list(&options.ignored_regions)
                        ));
                    }
                }
                prepared.push(PreparedTracer { name, ct, pet, mask })
            }
            Err(e) => {
                println!("{} {}: {:#}", "✗".red(), name, e);
                tracing::error!("Preprocessing of {} failed: {:#}", name, e);
                if let Some(r) = result_for(results, &name) {
                    r.fail(format!("preprocessing failed: {:#}", e));
                }
            }
        }
    }

    tracing::info!("{} of {} tracer(s) preprocessed", prepared.len(), admitted.len());
    Ok(prepared)
}

fn region_list(regions: &[BodyRegion]) -> String {
    regions.iter().map(|r| r.name()).collect::<Vec<_>>().join(", ")
}

async fn prepare_mask(
    tracer_dir: &Path,
    name: &str,
    staged_ct: &Path,
    service: Option<&SegmentationService>,
    ignored: &[BodyRegion],
    ws: &PipelineWorkspace,
) -> Result<Option<PathBuf>> {
    let Some(body_mask) = obtain_body_mask(tracer_dir, name, staged_ct, service, &ws.body_masks()).await? else {
        if ignored.is_empty() {
            tracing::info!("No body mask for {}; registering without masks", name);
        } else {
            tracing::warn!(
                "No body mask for {}; ignored regions {} were not removed",
                name,
                region_list(ignored)
            );
        }
        return Ok(None);
    };

    let mask = ws.registration_masks().join(format!("{}_mask.nii.gz", name));
    let ignored = ignored.to_vec();
    let (src, dst) = (body_mask.clone(), mask.clone());
    tokio::task::spawn_blocking(move || remove_ignored_regions(&src, &ignored, &dst)).await??;
    Ok(Some(mask))
}

/// The requested reference when it survived preprocessing, else the first prepared tracer.
fn choose_reference(
    config: &EffectiveConfig,
    options: &RunOptions,
    prepared: &[PreparedTracer],
    admitted: &[PathBuf],
) -> String {
    let fallback = prepared
        .first()
        .map(|t| t.name.clone())
        .or_else(|| admitted.first().map(|d| file_name(d)))
        .unwrap_or_default();
    let requested = options
        .reference
        .clone()
        .or_else(|| config.reference_tracer.clone());

    match requested {
        Some(name) if prepared.iter().any(|t| t.name == name) => name,
        Some(name) => {
            println!(
                "{} Reference tracer '{}' is not available; using '{}' instead",
                "!".yellow(),
                name,
                fallback
            );
            tracing::warn!(
                "Reference tracer {} is not among the preprocessed compliant tracers; falling back to {}",
                name,
                fallback
            );
            fallback
        }
        None => fallback,
    }
}

/// Aligns every prepared tracer to `reference`. Returns (tracer, aligned PET) for each success,
/// reference first.
async fn align(
    greedy: &RegistrationEngine,
    ws: &PipelineWorkspace,
    prepared: &[PreparedTracer],
    reference: &str,
    results: &mut [TracerResult],
) -> Vec<(String, PathBuf)> {
    let mut aligned = Vec::new();
    let Some(reference_tracer) = prepared.iter().find(|t| t.name == reference) else {
        return aligned;
    };

    println!("  {} -> REFERENCE: the other tracers are aligned to it", reference.cyan());
    match copy_reference(ws, reference_tracer).await {
        Ok(outputs) => {
            if let Some(r) = result_for(results, reference) {
                r.reference = true;
                r.aligned_outputs = outputs;
                r.status = summarize_status(&r.aligned_outputs, &r.reason);
            }
            aligned.push((reference.to_string(), aligned_name(&ws.aligned_pet(), &reference_tracer.pet)));
        }
        Err(e) => {
            tracing::error!("Copying reference outputs failed: {:#}", e);
            if let Some(r) = result_for(results, reference) {
                r.reference = true;
                r.fail(format!("reference copy failed: {:#}", e));
            }
        }
    }

    let moving: Vec<&PreparedTracer> = prepared.iter().filter(|t| t.name != reference).collect();
    let pb = alignment_bar(moving.len() as u64);

    for tracer in moving {
        pb.set_message(format!("{} -> {}", tracer.name, reference));
        let result = result_for(results, &tracer.name);
        let mut outputs = Vec::new();

        match align_tracer(greedy, ws, reference_tracer, tracer, &mut outputs).await {
            Ok(aligned_pet) => {
                if let Some(r) = result {
                    r.aligned_outputs = outputs;
                    r.status = summarize_status(&r.aligned_outputs, &r.reason);
                }
                aligned.push((tracer.name.clone(), aligned_pet));
                pb.println(format!("  {} {} aligned", "✓".green(), tracer.name));
            }
            Err(e) => {
                tracing::error!("Alignment of {} failed: {:#}", tracer.name, e);
                pb.println(format!("  {} {}: {:#}", "✗".red(), tracer.name, e));
                if let Some(r) = result {
                    r.aligned_outputs = outputs;
                    r.fail(format!("alignment failed: {:#}", e));
                }
            }
        }
        pb.inc(1);
    }
    pb.finish_and_clear();

    aligned
}

async fn copy_reference(ws: &PipelineWorkspace, reference: &PreparedTracer) -> Result<Vec<PathBuf>> {
    let mut pairs = vec![
        (reference.ct.clone(), aligned_name(&ws.aligned_ct(), &reference.ct)),
        (reference.pet.clone(), aligned_name(&ws.aligned_pet(), &reference.pet)),
    ];
    if let Some(mask) = &reference.mask {
        pairs.push((mask.clone(), aligned_name(&ws.aligned_masks(), mask)));
    }
    copy_files_to_destination(&pairs).await?;
    Ok(pairs.into_iter().map(|(_, dst)| dst).collect())
}

/// Registers `tracer`'s CT onto the reference CT and reslices its CT, mask and PET.
/// Outputs are pushed to `outputs` as they appear. Returns the aligned PET.
async fn align_tracer(
    greedy: &RegistrationEngine,
    ws: &PipelineWorkspace,
    reference: &PreparedTracer,
    tracer: &PreparedTracer,
    outputs: &mut Vec<PathBuf>,
) -> Result<PathBuf> {
    let transforms_dir = ws.transforms_for(&tracer.name)?;
    let masks = RegistrationMasks {
        fixed: reference.mask.as_deref(),
        moving: tracer.mask.as_deref(),
    };
    let transforms = greedy
        .register(&reference.ct, &tracer.ct, masks, &transforms_dir)
        .await?;

    let aligned_ct = aligned_name(&ws.aligned_ct(), &tracer.ct);
    let aligned_mask = tracer
        .mask
        .as_ref()
        .map(|m| (m.clone(), aligned_name(&ws.aligned_masks(), m)));
    greedy
        .reslice(
            &reference.ct,
            &tracer.ct,
            &aligned_ct,
            aligned_mask.as_ref().map(|(m, out)| (m.as_path(), out.as_path())),
            &transforms,
        )
        .await?;
    outputs.push(aligned_ct);
    if let Some((_, out)) = aligned_mask {
        outputs.push(out);
    }

    let aligned_pet = aligned_name(&ws.aligned_pet(), &tracer.pet);
    greedy
        .reslice(&reference.pet, &tracer.pet, &aligned_pet, None, &transforms)
        .await?;
    outputs.push(aligned_pet.clone());

    Ok(aligned_pet)
}

/// Builds the RGB composite. Any failure aborts only this step.
fn multiplex(
    selection: &ChannelSelection,
    ws: &PipelineWorkspace,
    aligned: &[(String, PathBuf)],
    results: &mut [TracerResult],
) -> Option<PathBuf> {
    let output = ws.aligned_pet().join(MULTIPLEXED_COMPOSITE_IMAGE);
    let outcome = assign_channels(selection, aligned).and_then(|assignments| {
        compose_composite(&assignments, &output)?;
        Ok(assignments)
    });

    match outcome {
        Ok(assignments) => {
            for a in &assignments {
                println!("  {} {} -> {}", "✓".green(), a.tracer, a.channel);
                if let Some(r) = result_for(results, &a.tracer) {
                    r.channel = Some(a.channel.to_string());
                }
            }
            println!("{} Composite written to {}", "✓".green(), output.display());
            Some(output)
        }
        Err(e) => {
            println!("{} Multiplexing skipped: {:#}", "✗".red(), e);
            tracing::error!("Multiplexing failed: {:#}", e);
            None
        }
    }
}

/// Exports every aligned PET and the composite. Failures are logged per series.
fn export(ws: &PipelineWorkspace, aligned: &[(String, PathBuf)], composite: Option<&Path>) {
    let exporter = DicomExporter::new();
    let aligned_pet_dir = ws.aligned_pet();
    let mut series_number = EXPORT_SERIES_BASE;

    for (tracer, pet) in aligned {
        series_number += 1;
        let out = dicom_dir_for(&aligned_pet_dir, pet);
        match exporter.export_volume(pet, &out, series_number) {
            Ok(n) => println!("  {} {}: {} slice(s) -> {}", "✓".green(), tracer, n, out.display()),
            Err(e) => {
                println!("  {} {}: {:#}", "✗".red(), tracer, e);
                tracing::error!("DICOM export of {} failed: {:#}", pet.display(), e);
            }
        }
    }

    if let Some(composite) = composite {
        series_number += 1;
        let out = dicom_dir_for(&aligned_pet_dir, composite);
        match exporter.export_rgb(composite, &out, series_number) {
            Ok(n) => println!("  {} composite: {} slice(s) -> {}", "✓".green(), n, out.display()),
            Err(e) => {
                println!("  {} composite: {:#}", "✗".red(), e);
                tracing::error!("DICOM export of {} failed: {:#}", composite.display(), e);
            }
        }
    }
}

fn write_run_reports(ws: &PipelineWorkspace, results: &[TracerResult]) -> Result<()> {
    write_reports(&ws.root.join(REPORT_CSV), &ws.root.join(REPORT_JSON), results)
}

fn print_summary(results: &[TracerResult]) {
    let ok = results.iter().filter(|r| r.succeeded()).count();
    println!();
    println!("Summary: {} Success, {} Failed/Partial.", ok, results.len() - ok);
    for r in results {
        let mark = if r.succeeded() { "✓".green() } else { "✗".red() };
        let role = if r.reference { " (reference)" } else { "" };
        println!("  {} {}{}: {} usable output(s)", mark, r.tracer, role, r.aligned_outputs.len());
        for note in &r.notes {
            println!("      {} {}", "!".yellow(), note);
        }
    }
}
