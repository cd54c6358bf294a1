use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};

// Core identifier types
pub type AnalysisId = String;
pub type TaskId = String;

const ID_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const ID_SUFFIX_LEN: usize = 6;

/// Generate a new analysis identifier of the form `YYYYMMDD-XXXXXX`
pub fn new_analysis_id() -> AnalysisId {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..ID_SUFFIX_LEN)
        .map(|_| ID_CHARSET[rng.gen_range(0..ID_CHARSET.len())] as char)
        .collect();

    format!("{}-{}", Utc::now().format("%Y%m%d"), suffix)
}

/// Task identifiers are numbered per analysis, starting at 1
pub fn task_id(analysis_id: &str, number: usize) -> TaskId {
    format!("{}_{}", analysis_id, number)
}

/// Recover the owning analysis id from a task id
pub fn analysis_id_of_task(task_id: &str) -> Option<&str> {
    task_id
        .rsplit_once('_')
        .filter(|(_, n)| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
        .map(|(analysis, _)| analysis)
}

/// Processing stages. Each stage has its own queue and worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Identification,
    Pre,
    Post,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Identification, Stage::Pre, Stage::Post];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Identification => "identification",
            Stage::Pre => "pre",
            Stage::Post => "post",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown stage: {0}")]
pub struct ParseStageError(pub String);

impl FromStr for Stage {
    type Err = ParseStageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "identification" => Ok(Stage::Identification),
            "pre" => Ok(Stage::Pre),
            "post" => Ok(Stage::Post),
            other => Err(ParseStageError(other.to_string())),
        }
    }
}

/// A fully resolved platform a task runs on
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Platform {
    pub platform: String,
    pub os_version: String,
}

impl Platform {
    pub fn new(platform: impl Into<String>, os_version: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
            os_version: os_version.into(),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.platform, self.os_version)
    }
}

/// A requested platform; a missing version means "any version we have machines for"
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlatformRequest {
    pub platform: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
}

impl PlatformRequest {
    pub fn any_version(platform: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
            os_version: None,
        }
    }

    pub fn exact(platform: impl Into<String>, os_version: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
            os_version: Some(os_version.into()),
        }
    }
}

/// What was submitted, after staging
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SubmittedTarget {
    File {
        /// Staged copy of the submitted file
        path: PathBuf,
        filename: String,
        sha256: String,
        size: u64,
    },
    Url {
        url: String,
    },
}

/// One unit of stage work. This is also the assignment sent to a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub analysis_id: AnalysisId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    pub analysis_path: PathBuf,
}

impl WorkItem {
    pub fn for_analysis(analysis_id: impl Into<AnalysisId>, analysis_path: impl Into<PathBuf>) -> Self {
        Self {
            analysis_id: analysis_id.into(),
            task_id: None,
            analysis_path: analysis_path.into(),
        }
    }

    pub fn for_task(
        analysis_id: impl Into<AnalysisId>,
        task_id: impl Into<TaskId>,
        analysis_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            analysis_id: analysis_id.into(),
            task_id: Some(task_id.into()),
            analysis_path: analysis_path.into(),
        }
    }
}
