//! Per-tracer run outcomes and their CSV/JSON reports.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::File;
use std::path::{Path, PathBuf};

/// Outcome of one tracer in a run.
#[derive(Serialize, Default, Debug, Clone)]
pub struct TracerResult {
    pub tracer: String,
    pub status: String,
    pub reference: bool,
    pub reason: Vec<String>,
    pub aligned_outputs: Vec<PathBuf>,
    pub channel: Option<String>,
    /// Steps skipped without failing the tracer.
    pub notes: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl TracerResult {
    pub fn new(tracer: &str) -> Self {
        Self {
            tracer: tracer.to_string(),
            status: "Pending".into(),
            timestamp: Utc::now(),
            ..Default::default()
        }
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        self.reason.push(reason.into());
        self.status = summarize_status(&self.aligned_outputs, &self.reason);
    }

    pub fn succeeded(&self) -> bool {
        self.status == "Success"
    }
}

/// `Success` without failures, `Partial` when some outputs exist despite failures, `Failed` otherwise.
pub fn summarize_status(outputs: &[PathBuf], reasons: &[String]) -> String {
    if reasons.is_empty() {
        "Success".into()
    } else if !outputs.is_empty() {
        "Partial".into()
    } else {
        "Failed".into()
    }
}

pub fn write_reports(csv_path: &Path, json_path: &Path, results: &[TracerResult]) -> Result<()> {
    write_csv_report(csv_path, results)?;
    write_json_report(json_path, results)?;
    Ok(())
}

fn write_json_report(path: &Path, results: &[TracerResult]) -> Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, results)?;
    Ok(())
}

fn write_csv_report(path: &Path, results: &[TracerResult]) -> Result<()> {
    let mut wtr = csv::Writer::from_path(path)?;
    wtr.write_record(["Tracer", "Status", "Reference", "Reason", "AlignedCount", "Channel", "Notes", "Timestamp"])?;
    for r in results {
        wtr.write_record([
            r.tracer.as_str(),
            r.status.as_str(),
            if r.reference { "yes" } else { "no" },
            r.reason.join("; ").as_str(),
            r.aligned_outputs.len().to_string().as_str(),
            r.channel.as_deref().unwrap_or(""),
            r.notes.join("; ").as_str(),
            r.timestamp.to_rfc3339().as_str(),
        ])?;
    }
    wtr.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summarize_status() {
        let out = vec![PathBuf::from("a.nii.gz")];
        assert_eq!(summarize_status(&out, &[]), "Success");
        assert_eq!(summarize_status(&out, &["reslice failed".into()]), "Partial");
        assert_eq!(summarize_status(&[], &["registration failed".into()]), "Failed");
    }

    #[test]
    fn test_write_reports() {
        let dir = tempfile::tempdir().unwrap();
        let mut ok = TracerResult::new("FDG");
        ok.reference = true;
        ok.status = "Success".into();
        ok.channel = Some("R".into());
        ok.notes.push("no body mask".into());
        let mut bad = TracerResult::new("PSMA");
        bad.fail("greedy failed on CT");

        let csv_path = dir.path().join("run_report.csv");
        let json_path = dir.path().join("run_report.json");
        write_reports(&csv_path, &json_path, &[ok, bad]).unwrap();

        let csv = std::fs::read_to_string(&csv_path).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[1].starts_with("FDG,Success,yes,,0,R,no body mask,"));
        assert!(lines[2].starts_with("PSMA,Failed,no,greedy failed on CT,0,,"));

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&json_path).unwrap()).unwrap();
        assert_eq!(json[1]["status"], "Failed");
        assert_eq!(json[0]["reference"], true);
        assert_eq!(json[0]["notes"][0], "no body mask");
    }
}
