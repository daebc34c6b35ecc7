//! Analysis job model: status machine, job record, model-reference parsing.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ModxError, Result};
use crate::time;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Analyzing,
    Completed,
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 4] = [
        JobStatus::Pending,
        JobStatus::Analyzing,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Forward-only: `pending → analyzing → completed | failed`, and
    /// `pending → failed` for jobs that never start.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Analyzing) | (Pending, Failed) | (Analyzing, Completed) | (Analyzing, Failed)
        )
    }

    /// Statuses from which `self` may be entered.
    pub fn predecessors(self) -> Vec<JobStatus> {
        Self::ALL
            .into_iter()
            .filter(|s| s.can_transition_to(self))
            .collect()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Analyzing => "analyzing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = ModxError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ModxError::Validation(format!("unknown job status '{s}'")))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnalysisJob {
    pub id: Uuid,
    pub model_reference: String,
    pub model_id: Option<String>,
    pub status: JobStatus,
    pub submitted_at: String,
    pub updated_at: String,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl AnalysisJob {
    pub fn new(reference: &ModelReference) -> Self {
        let now = time::now_iso8601();
        Self {
            id: Uuid::new_v4(),
            model_reference: reference.original.clone(),
            model_id: Some(reference.model_id.clone()),
            status: JobStatus::Pending,
            submitted_at: now.clone(),
            updated_at: now,
            result: None,
            error: None,
        }
    }
}

/// A validated model reference and the hub id it names.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModelReference {
    pub original: String,
    pub model_id: String,
}

static HUB_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^https?://(?:www\.)?huggingface\.co/([A-Za-z0-9][\w.-]*)/([A-Za-z0-9][\w.-]*)(?:[/?#].*)?$",
    )
    .unwrap()
});
static BARE_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([A-Za-z0-9][\w.-]*)/([A-Za-z0-9][\w.-]*)$").unwrap());

/// Accept `https://huggingface.co/<org>/<name>[/...]` or a bare `<org>/<name>`.
pub fn parse_model_reference(input: &str) -> Result<ModelReference> {
    let trimmed = input.trim();
    let caps = HUB_URL
        .captures(trimmed)
        .or_else(|| BARE_ID.captures(trimmed))
        .ok_or_else(|| {
            ModxError::Validation(format!(
                "'{trimmed}' is not a Hugging Face model URL or <org>/<name> id"
            ))
        })?;
    Ok(ModelReference {
        original: trimmed.to_string(),
        model_id: format!("{}/{}", &caps[1], &caps[2]),
    })
}
