//! External tool invocation with `{input}`/`{output}` argument templates.

use anyhow::Result;
use std::ffi::OsString;
use std::path::Path;
use std::process::{Output, Stdio};
use tokio::process::Command;

use crate::error::PipelineError;

/// An external program plus an argument template.
///
/// Arguments may contain `{input}` and `{output}` placeholders which are replaced by the
/// paths given to [`ExternalCommand::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl ExternalCommand {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn render_args(&self, input: &Path, output: &Path) -> Vec<OsString> {
        let input = input.to_string_lossy();
        let output = output.to_string_lossy();
        self.args
            .iter()
            .map(|a| OsString::from(a.replace("{input}", &input).replace("{output}", &output)))
            .collect()
    }

    /// Runs the program to completion. Spawn failures and non-zero exits become
    /// [`PipelineError::ConversionFailure`] against `input`.
    pub async fn run(&self, input: &Path, output: &Path) -> Result<Output> {
        let out = Command::new(&self.program)
            .args(self.render_args(input, output))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| PipelineError::conversion(&self.program, input, e.to_string()))?;

        if !out.status.success() {
            return Err(PipelineError::conversion(&self.program, input, failure_message(&out)).into());
        }
        Ok(out)
    }

    /// True when the program can be spawned at all.
    pub fn is_available(&self) -> bool {
        std::process::Command::new(&self.program)
            .arg("-h")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .is_ok()
    }
}

/// Stderr of a failed process, or stdout when stderr is empty.
pub fn failure_message(out: &Output) -> String {
    let stderr = String::from_utf8_lossy(&out.stderr);
    let msg = if stderr.trim().is_empty() {
        String::from_utf8_lossy(&out.stdout).to_string()
    } else {
        stderr.to_string()
    };
    let msg = msg.trim();
    if msg.is_empty() {
        format!("exited with {}", out.status)
    } else {
        msg.to_string()
    }
}
