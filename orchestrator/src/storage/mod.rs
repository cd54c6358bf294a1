//! Analysis storage
//!
//! Layout under the storage root:
//!
//! ```text
//! binaries/<sha256>                    staged submissions
//! analyses/<id>/analysis.json          analysis record
//! analyses/<id>/identification.json    stage artifacts
//! analyses/<id>/pre.json
//! analyses/<id>/target.zip
//! analyses/<id>/<task_id>/task.json    task record
//! analyses/<id>/<task_id>/post.json
//! ```

pub mod staging;

use std::path::{Path, PathBuf};

use shared::types::{
    read_artifact, write_artifact, Identification, PreResult, SubmittedTarget, ANALYSIS_FILE,
    IDENTIFICATION_FILE, PRE_FILE, TARGET_ZIP, TASK_FILE,
};
use tracing::debug;

use crate::config::StorageConfig;
use crate::error::{OrchestratorError, Result};
use crate::models::{Analysis, SubmissionTarget, Task};

#[derive(Debug, Clone)]
pub struct AnalysisStore {
    root: PathBuf,
    max_submission_size: u64,
}

impl AnalysisStore {
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            root: config.root.clone(),
            max_submission_size: config.max_submission_size,
        }
    }

    pub async fn init(&self) -> Result<()> {
        tokio::fs::create_dir_all(self.analyses_dir()).await?;
        tokio::fs::create_dir_all(self.binaries_dir()).await?;
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn analyses_dir(&self) -> PathBuf {
        self.root.join("analyses")
    }

    fn binaries_dir(&self) -> PathBuf {
        self.root.join("binaries")
    }

    pub fn analysis_path(&self, analysis_id: &str) -> PathBuf {
        self.analyses_dir().join(analysis_id)
    }

    pub fn task_path(&self, analysis_id: &str, task_id: &str) -> PathBuf {
        self.analysis_path(analysis_id).join(task_id)
    }

    /// Validate and stage a submitted target
    pub async fn stage(&self, target: &SubmissionTarget) -> Result<SubmittedTarget> {
        staging::stage_target(target, &self.binaries_dir(), self.max_submission_size).await
    }

    /// Create the analysis directory and write the first record
    pub async fn create_analysis(&self, analysis: &Analysis) -> Result<PathBuf> {
        let path = self.analysis_path(&analysis.id);
        tokio::fs::create_dir_all(&path).await?;
        self.save_analysis(analysis).await?;
        Ok(path)
    }

    pub async fn save_analysis(&self, analysis: &Analysis) -> Result<()> {
        let path = self.analysis_path(&analysis.id).join(ANALYSIS_FILE);
        write_artifact(&path, analysis).await?;
        debug!(analysis_id = %analysis.id, state = %analysis.state, "Analysis saved");
        Ok(())
    }

    pub async fn save_task(&self, task: &Task) -> Result<()> {
        let dir = self.task_path(&task.analysis_id, &task.id);
        tokio::fs::create_dir_all(&dir).await?;
        write_artifact(&dir.join(TASK_FILE), task).await?;
        debug!(task_id = %task.id, state = %task.state, "Task saved");
        Ok(())
    }

    pub async fn load_analysis(&self, analysis_id: &str) -> Result<Analysis> {
        let path = self.analysis_path(analysis_id).join(ANALYSIS_FILE);
        read_artifact(&path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => OrchestratorError::NotFound(analysis_id.to_string()),
            _ => OrchestratorError::Storage(format!("{}: {}", path.display(), e)),
        })
    }

    pub async fn load_task(&self, analysis_id: &str, task_id: &str) -> Result<Task> {
        let path = self.task_path(analysis_id, task_id).join(TASK_FILE);
        read_artifact(&path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => OrchestratorError::NotFound(task_id.to_string()),
            _ => OrchestratorError::Storage(format!("{}: {}", path.display(), e)),
        })
    }

    pub async fn read_identification(&self, analysis_id: &str) -> Result<Identification> {
        let path = self.analysis_path(analysis_id).join(IDENTIFICATION_FILE);
        read_artifact(&path)
            .await
            .map_err(|e| OrchestratorError::Storage(format!("{}: {}", path.display(), e)))
    }

    pub async fn read_pre(&self, analysis_id: &str) -> Result<PreResult> {
        let path = self.analysis_path(analysis_id).join(PRE_FILE);
        read_artifact(&path)
            .await
            .map_err(|e| OrchestratorError::Storage(format!("{}: {}", path.display(), e)))
    }

    /// `target.zip` of an analysis, when the pre stage produced one
    pub async fn target_zip(&self, analysis_id: &str) -> Option<PathBuf> {
        let path = self.analysis_path(analysis_id).join(TARGET_ZIP);
        match tokio::fs::try_exists(&path).await {
            Ok(true) => Some(path),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AnalysisSettings, AnalysisState, TaskState};
    use pretty_assertions::assert_eq;
    use shared::types::Platform;

    fn store(dir: &Path) -> AnalysisStore {
        AnalysisStore::new(&StorageConfig {
            root: dir.to_path_buf(),
            max_submission_size: 1024,
        })
    }

    #[tokio::test]
    async fn test_records_persist() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        store.init().await.unwrap();

        let mut analysis = Analysis::new(
            "20240101-AAAAAA".to_string(),
            SubmittedTarget::Url {
                url: "https://example.com/".to_string(),
            },
            AnalysisSettings {
                platforms: vec![],
                timeout: 60,
                priority: 1,
                tags: vec![],
            },
        );
        let path = store.create_analysis(&analysis).await.unwrap();
        assert!(path.ends_with("analyses/20240101-AAAAAA"));

        analysis.set_state(AnalysisState::Identified).unwrap();
        store.save_analysis(&analysis).await.unwrap();
        assert_eq!(store.load_analysis(&analysis.id).await.unwrap(), analysis);

        let task = Task::new(&analysis.id, 1, Platform::new("windows", "10"), 60, 1, vec![]);
        store.save_task(&task).await.unwrap();
        let loaded = store.load_task(&analysis.id, &task.id).await.unwrap();
        assert_eq!(loaded.state, TaskState::Pending);
    }

    #[tokio::test]
    async fn test_missing_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        assert!(matches!(
            store.load_analysis("20240101-ZZZZZZ").await,
            Err(OrchestratorError::NotFound(_))
        ));
        assert!(store.read_identification("20240101-ZZZZZZ").await.is_err());
        assert!(store.target_zip("20240101-ZZZZZZ").await.is_none());
    }
}
