//! RGB multiplexing of aligned PET volumes, one tracer per color channel.

use anyhow::{anyhow, Context, Result};
use ndarray::{s, Array3, Array4};
use serde::Serialize;
use std::fmt;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use crate::error::PipelineError;
use crate::volume::{finite_range, write_u8, Volume};

pub const MULTIPLEXED_COMPOSITE_IMAGE: &str = "multiplexed_composite_image.nii.gz";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum Channel {
    R,
    G,
    B,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::R, Channel::G, Channel::B];

    pub fn index(self) -> usize {
        match self {
            Channel::R => 0,
            Channel::G => 1,
            Channel::B => 2,
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "r" | "red" => Some(Channel::R),
            "g" | "green" => Some(Channel::G),
            "b" | "blue" => Some(Channel::B),
            _ => None,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Channel::R => "R",
            Channel::G => "G",
            Channel::B => "B",
        };
        f.write_str(s)
    }
}

/// How tracers are mapped onto channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelSelection {
    /// `tracer:channel` pairs given on the command line.
    Explicit(Vec<(String, Channel)>),
    Interactive,
    /// R, G, B for the first three eligible tracers.
    OrderBased,
}

/// One tracer's aligned PET placed in one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelAssignment {
    pub channel: Channel,
    pub tracer: String,
    pub pet: PathBuf,
}

fn conflict(msg: String) -> anyhow::Error {
    PipelineError::ChannelAssignmentConflict(msg).into()
}

/// Parses `Tracer1:R,Tracer2:G`. A channel or tracer named twice is a conflict.
pub fn parse_channel_map(value: &str) -> Result<Vec<(String, Channel)>> {
    let mut pairs: Vec<(String, Channel)> = Vec::new();

    for item in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (tracer, channel) = item
            .rsplit_once(':')
            .ok_or_else(|| anyhow!("Expected tracer:channel, got '{}'", item))?;
        let tracer = tracer.trim().to_string();
        let channel = Channel::parse(channel)
            .ok_or_else(|| anyhow!("Unknown channel '{}' (use R, G or B)", channel))?;

        if let Some((other, _)) = pairs.iter().find(|(_, c)| *c == channel) {
            return Err(conflict(format!(
                "channel {} requested for both {} and {}",
                channel, other, tracer
            )));
        }
        if pairs.iter().any(|(t, _)| *t == tracer) {
            return Err(conflict(format!("tracer {} assigned twice", tracer)));
        }
        pairs.push((tracer, channel));
    }

    if pairs.is_empty() {
        return Err(anyhow!("Empty channel map"));
    }
    Ok(pairs)
}

/// Resolves an explicit map against the tracers that were aligned, given as (name, PET path).
pub fn explicit_assignment(
    pairs: &[(String, Channel)],
    eligible: &[(String, PathBuf)],
) -> Result<Vec<ChannelAssignment>> {
    if pairs.len() > eligible.len() {
        return Err(conflict(format!(
            "{} channels requested but only {} tracer(s) aligned",
            pairs.len(),
            eligible.len()
        )));
    }

    let mut out = Vec::new();
    for (tracer, channel) in pairs {
        let (_, pet) = eligible
            .iter()
            .find(|(name, _)| name == tracer)
            .ok_or_else(|| conflict(format!("tracer {} is not among the aligned tracers", tracer)))?;
        out.push(ChannelAssignment {
            channel: *channel,
            tracer: tracer.clone(),
            pet: pet.clone(),
        });
    }
    out.sort_by_key(|a| a.channel);
    Ok(out)
}

pub fn order_based_assignment(eligible: &[(String, PathBuf)]) -> Vec<ChannelAssignment> {
    if eligible.len() > Channel::ALL.len() {
        tracing::warn!(
            "{} tracers aligned; only the first {} are multiplexed",
            eligible.len(),
            Channel::ALL.len()
        );
    }
    Channel::ALL
        .iter()
        .zip(eligible)
        .map(|(&channel, (tracer, pet))| ChannelAssignment {
            channel,
            tracer: tracer.clone(),
            pet: pet.clone(),
        })
        .collect()
}

/// Asks for a tracer per channel on `output`, reading answers from `input`. An empty answer
/// leaves the channel unused.
pub fn prompt_assignment<R: BufRead, W: Write>(
    eligible: &[(String, PathBuf)],
    input: &mut R,
    output: &mut W,
) -> Result<Vec<ChannelAssignment>> {
    let names: Vec<&str> = eligible.iter().map(|(n, _)| n.as_str()).collect();
    let mut out: Vec<ChannelAssignment> = Vec::new();

    for channel in Channel::ALL {
        write!(
            output,
            "Tracer for channel {} [{}] (empty to skip): ",
            channel,
            names.join(", ")
        )?;
        output.flush()?;

        let mut line = String::new();
        if input.read_line(&mut line)? == 0 {
            break;
        }
        let answer = line.trim();
        if answer.is_empty() {
            continue;
        }

        let (tracer, pet) = eligible
            .iter()
            .find(|(n, _)| n == answer)
            .ok_or_else(|| conflict(format!("tracer {} is not among the aligned tracers", answer)))?;
        if out.iter().any(|a| a.tracer == *tracer) {
            return Err(conflict(format!("tracer {} assigned twice", tracer)));
        }
        out.push(ChannelAssignment {
            channel,
            tracer: tracer.clone(),
            pet: pet.clone(),
        });
    }

    Ok(out)
}

pub fn assign_channels(
    selection: &ChannelSelection,
    eligible: &[(String, PathBuf)],
) -> Result<Vec<ChannelAssignment>> {
    let assignments = match selection {
        ChannelSelection::Explicit(pairs) => explicit_assignment(pairs, eligible)?,
        ChannelSelection::OrderBased => order_based_assignment(eligible),
        ChannelSelection::Interactive => {
            let stdin = std::io::stdin();
            let mut input = stdin.lock();
            let mut output = std::io::stdout();
            prompt_assignment(eligible, &mut input, &mut output)?
        }
    };

    if assignments.is_empty() {
        return Err(conflict("no tracer assigned to any channel".to_string()));
    }
    Ok(assignments)
}

/// Min-max scales finite voxels to 0..=255. Non-finite voxels and constant volumes become 0.
pub fn scale_to_u8(data: &Array3<f32>) -> Array3<u8> {
    match finite_range(data.iter()) {
        Some((lo, hi)) if hi > lo => {
            let span = hi - lo;
            data.mapv(|v| {
                if v.is_finite() {
                    (((v - lo) / span) * 255.0).round().clamp(0.0, 255.0) as u8
                } else {
                    0
                }
            })
        }
        _ => Array3::zeros(data.dim()),
    }
}

/// Writes the `x, y, z, 3` uint8 composite of the assigned PET volumes to `output`.
///
/// All volumes must share the grid of the reference PET they were resliced onto.
pub fn compose_composite(assignments: &[ChannelAssignment], output: &Path) -> Result<()> {
    let first = assignments
        .first()
        .ok_or_else(|| anyhow!("No channel assignments to compose"))?;
    let reference = Volume::read(&first.pet)?;
    let (x, y, z) = reference.to_3d()?.dim();
    let mut composite = Array4::<u8>::zeros((x, y, z, 3));

    for assignment in assignments {
        let vol = Volume::read(&assignment.pet)?;
        let data = vol
            .to_3d()
            .with_context(|| format!("Unexpected shape in {}", assignment.pet.display()))?;
        if data.dim() != (x, y, z) {
            return Err(anyhow!(
                "{} has shape {:?}, expected {:?}",
                assignment.pet.display(),
                data.dim(),
                (x, y, z)
            ));
        }
        composite
            .slice_mut(s![.., .., .., assignment.channel.index()])
            .assign(&scale_to_u8(&data));
        tracing::info!(
            "Channel {}: {} ({})",
            assignment.channel,
            assignment.tracer,
            assignment.pet.display()
        );
    }

    write_u8(output, &composite.into_dyn(), Some(&reference.header))?;
    Ok(())
}
