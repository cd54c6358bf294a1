//! On-disk stage artifacts
//!
//! The stage workers write these files into the analysis directory and the
//! orchestrator reads them back to decide the next state transition.

use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::common::{AnalysisId, PlatformRequest, SubmittedTarget, TaskId};

pub const ANALYSIS_FILE: &str = "analysis.json";
pub const TASK_FILE: &str = "task.json";
pub const IDENTIFICATION_FILE: &str = "identification.json";
pub const PRE_FILE: &str = "pre.json";
pub const POST_FILE: &str = "post.json";
pub const TARGET_ZIP: &str = "target.zip";

/// Identified target, either a file or a URL
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TargetDescriptor {
    File {
        filename: String,
        size: u64,
        media_type: String,
        md5: String,
        sha1: String,
        sha256: String,
    },
    Url {
        url: String,
    },
}

impl TargetDescriptor {
    pub fn display_name(&self) -> &str {
        match self {
            TargetDescriptor::File { filename, .. } => filename,
            TargetDescriptor::Url { url } => url,
        }
    }
}

/// Contents of `identification.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identification {
    pub selected: bool,
    pub target: TargetDescriptor,
    pub category: String,
    #[serde(default)]
    pub ignored: Vec<String>,
    /// Name of the archive the selected target was extracted from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
}

/// Contents of `pre.json`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreResult {
    #[serde(default)]
    pub platforms: Vec<PlatformRequest>,
    /// Whether `target.zip` was written next to this file
    #[serde(default)]
    pub target_archive: bool,
}

/// Contents of `<task_dir>/post.json`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostResult {
    pub task_id: TaskId,
    #[serde(default)]
    pub files: Vec<String>,
    pub total_bytes: u64,
}

/// The subset of `analysis.json` the stage workers need
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisHeader {
    pub id: AnalysisId,
    pub submitted: SubmittedTarget,
}

/// Read and decode a JSON artifact
pub async fn read_artifact<T: DeserializeOwned>(path: &Path) -> std::io::Result<T> {
    let bytes = tokio::fs::read(path).await?;
    serde_json::from_slice(&bytes)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

/// Encode and write a JSON artifact, replacing any previous version atomically
pub async fn write_artifact<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    let bytes = serde_json::to_vec_pretty(value)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await
}
