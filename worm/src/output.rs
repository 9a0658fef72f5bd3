//! Output formatting for CLI commands.
//!
//! Every command produces a serializable DTO; in text mode a closure renders
//! it for humans, in JSON mode the DTO is printed as is.

use anyhow::Result;
use serde::Serialize;
use std::io::{self, Write};
use std::path::PathBuf;
use worm_core::{
    CheckReport, ContentHash, CorruptObject, Direction, StatusRecord, SyncReport, TransferOutcome,
    TransferStatus,
};

/// Output format selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Writer for command output with format abstraction.
pub struct OutputWriter {
    format: OutputFormat,
    stdout: io::Stdout,
}

impl OutputWriter {
    pub fn new(json: bool) -> Self {
        Self {
            format: if json {
                OutputFormat::Json
            } else {
                OutputFormat::Text
            },
            stdout: io::stdout(),
        }
    }

    /// Write `data` as JSON, or the text produced by `text_fn`.
    pub fn write<T: Serialize>(&self, data: &T, text_fn: impl FnOnce() -> String) -> Result<()> {
        match self.format {
            OutputFormat::Json => {
                let json = serde_json::to_string_pretty(data)?;
                writeln!(&self.stdout, "{}", json)?;
            }
            OutputFormat::Text => {
                let text = text_fn();
                if !text.is_empty() {
                    write!(&self.stdout, "{}", text)?;
                }
            }
        }
        Ok(())
    }

    /// Write an error to stderr (a JSON object in JSON mode).
    pub fn write_error(&self, error: &anyhow::Error, result_code: u8) {
        match self.format {
            OutputFormat::Json => {
                let error_output = ErrorOutput {
                    success: false,
                    result_code,
                    error: format!("{:#}", error),
                };
                if let Ok(json) = serde_json::to_string_pretty(&error_output) {
                    let _ = writeln!(io::stderr(), "{}", json);
                }
            }
            OutputFormat::Text => {
                let _ = writeln!(io::stderr(), "Error: {:#}", error);
            }
        }
    }
}

pub fn result_code(success: bool) -> u8 {
    if success { 0 } else { 1 }
}

// ============================================================================
// Data Transfer Objects (DTOs) for JSON output
// ============================================================================

#[derive(Debug, Serialize)]
pub struct ErrorOutput {
    pub success: bool,
    pub result_code: u8,
    pub error: String,
}

/// Output for `init`.
#[derive(Debug, Serialize)]
pub struct InitOutput {
    pub success: bool,
    pub result_code: u8,
    pub root: String,
    pub cache_dir: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depot: Option<String>,
}

/// A path and the hash it is tracked at.
#[derive(Debug, Clone, Serialize)]
pub struct TrackedFile {
    pub path: String,
    pub hash: ContentHash,
}

impl From<(String, ContentHash)> for TrackedFile {
    fn from((path, hash): (String, ContentHash)) -> Self {
        Self { path, hash }
    }
}

/// Output for `add` and `rm`.
#[derive(Debug, Serialize)]
pub struct TrackOutput {
    pub success: bool,
    pub result_code: u8,
    pub files: Vec<TrackedFile>,
}

/// Output for `mv` and `cp`.
#[derive(Debug, Serialize)]
pub struct RelocateOutput {
    pub success: bool,
    pub result_code: u8,
    pub from: String,
    pub to: String,
    pub hash: ContentHash,
}

/// Output for `unlock`.
#[derive(Debug, Serialize)]
pub struct UnlockOutput {
    pub success: bool,
    pub result_code: u8,
    pub unlocked: Vec<String>,
}

/// One transfer in a push or pull.
#[derive(Debug, Serialize)]
pub struct TransferInfo {
    pub hash: ContentHash,
    pub paths: Vec<String>,
    pub status: TransferStatus,
    pub attempts: u32,
    pub bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&TransferOutcome> for TransferInfo {
    fn from(outcome: &TransferOutcome) -> Self {
        Self {
            hash: outcome.hash,
            paths: outcome.paths.clone(),
            status: outcome.status,
            attempts: outcome.attempts,
            bytes: outcome.bytes,
            error: outcome.error.as_ref().map(|e| e.to_string()),
        }
    }
}

/// Output for `push` and `pull`.
#[derive(Debug, Serialize)]
pub struct SyncOutput {
    pub success: bool,
    pub result_code: u8,
    pub direction: Direction,
    pub transfers: Vec<TransferInfo>,
    pub failed: usize,
    /// Extra links made by `pull --extra`.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub extra_links: Vec<ExtraLink>,
}

/// An extra hard link to a tracked path's cached object.
#[derive(Debug, Serialize)]
pub struct ExtraLink {
    pub path: String,
    pub link: String,
}

impl From<(String, PathBuf)> for ExtraLink {
    fn from((path, link): (String, PathBuf)) -> Self {
        Self {
            path,
            link: link.display().to_string(),
        }
    }
}

impl From<&SyncReport> for SyncOutput {
    fn from(report: &SyncReport) -> Self {
        let success = report.is_success();
        Self {
            success,
            result_code: result_code(success),
            direction: report.direction,
            transfers: report.outcomes.iter().map(TransferInfo::from).collect(),
            failed: report.failures().count(),
            extra_links: Vec::new(),
        }
    }
}

/// One line per transfer outcome.
pub fn sync_text(report: &SyncReport) -> String {
    let mut text = String::new();
    for outcome in &report.outcomes {
        let paths = outcome.paths.join(", ");
        match &outcome.error {
            Some(error) => text.push_str(&format!(
                "{} {} {}: {} ({})\n",
                report.direction,
                outcome.status.as_str(),
                outcome.hash.short(),
                paths,
                error
            )),
            None => text.push_str(&format!(
                "{} {} {}: {}\n",
                report.direction,
                outcome.status.as_str(),
                outcome.hash.short(),
                paths
            )),
        }
    }

    let failed = report.failures().count();
    if failed > 0 {
        text.push_str(&format!("{} of {} transfers failed\n", failed, report.outcomes.len()));
    }
    text
}

/// Output for `status`.
#[derive(Debug, Serialize)]
pub struct StatusOutput {
    pub success: bool,
    pub result_code: u8,
    pub files: Vec<StatusRecord>,
}

pub fn status_text(records: &[StatusRecord]) -> String {
    let mut text = String::new();
    for record in records {
        let mut notes = Vec::new();
        if record.unlocked {
            notes.push("unlocked".to_string());
        }
        if record.dirty {
            notes.push("modified".to_string());
        }
        if let Some(error) = &record.depot_error {
            notes.push(format!("depot: {}", error));
        }

        text.push_str(&format!(
            "{} {} {}",
            record.presence,
            record.hash.short(),
            record.path
        ));
        if !notes.is_empty() {
            text.push_str(&format!(" ({})", notes.join(", ")));
        }
        text.push('\n');
    }
    text
}

/// Output for `check`.
#[derive(Debug, Serialize)]
pub struct CheckOutput {
    pub success: bool,
    pub result_code: u8,
    pub corrupt: Vec<CorruptObject>,
    pub dirty: Vec<String>,
    pub missing: Vec<String>,
}

impl From<CheckReport> for CheckOutput {
    fn from(report: CheckReport) -> Self {
        let success = report.is_clean();
        Self {
            success,
            result_code: result_code(success),
            corrupt: report.corrupt,
            dirty: report.dirty,
            missing: report.missing,
        }
    }
}

pub fn check_text(output: &CheckOutput) -> String {
    let mut text = String::new();
    for object in &output.corrupt {
        text.push_str(&format!(
            "corrupt object {} (content hashes to {})\n",
            object.expected, object.actual
        ));
    }
    for path in &output.dirty {
        text.push_str(&format!("modified {}\n", path));
    }
    for path in &output.missing {
        text.push_str(&format!("missing {}\n", path));
    }
    if output.success {
        text.push_str("ok\n");
    }
    text
}

/// Output for the index merge driver.
#[derive(Debug, Serialize)]
pub struct MergeOutput {
    pub success: bool,
    pub result_code: u8,
    pub entries: usize,
}
