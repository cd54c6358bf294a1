use std::path::Path;

use sha2::{Digest, Sha256};
use shared::types::SubmittedTarget;
use tokio::io::AsyncReadExt;
use tracing::{debug, info};

use crate::error::{OrchestratorError, Result};
use crate::models::SubmissionTarget;

const HASH_CHUNK: usize = 64 * 1024;

async fn sha256_file(path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_CHUNK];
    loop {
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Check a URL target: must parse and use http or https
pub fn validate_url(raw: &str) -> Result<String> {
    let parsed = url::Url::parse(raw.trim())
        .map_err(|e| OrchestratorError::InvalidSubmission(format!("invalid URL '{}': {}", raw, e)))?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed.to_string()),
        other => Err(OrchestratorError::InvalidSubmission(format!(
            "unsupported URL scheme '{}'",
            other
        ))),
    }
}

/// Validate a submitted target and copy files into `binaries_dir/<sha256>`.
/// Nothing is written when validation fails.
pub async fn stage_target(
    target: &SubmissionTarget,
    binaries_dir: &Path,
    max_size: u64,
) -> Result<SubmittedTarget> {
    match target {
        SubmissionTarget::Url { url } => Ok(SubmittedTarget::Url {
            url: validate_url(url)?,
        }),
        SubmissionTarget::File { path, filename } => {
            let metadata = tokio::fs::metadata(path).await.map_err(|e| {
                OrchestratorError::InvalidSubmission(format!("{}: {}", path.display(), e))
            })?;
            if !metadata.is_file() {
                return Err(OrchestratorError::InvalidSubmission(format!(
                    "{} is not a regular file",
                    path.display()
                )));
            }
            if metadata.len() == 0 {
                return Err(OrchestratorError::InvalidSubmission(format!(
                    "{} is empty",
                    path.display()
                )));
            }
            if metadata.len() > max_size {
                return Err(OrchestratorError::InvalidSubmission(format!(
                    "{} is {} bytes, the limit is {}",
                    path.display(),
                    metadata.len(),
                    max_size
                )));
            }

            let filename = match filename {
                Some(name) if !name.trim().is_empty() => name.trim().to_string(),
                _ => path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .ok_or_else(|| {
                        OrchestratorError::InvalidSubmission(format!(
                            "cannot derive a file name from {}",
                            path.display()
                        ))
                    })?,
            };

            let sha256 = sha256_file(path).await?;
            let staged = binaries_dir.join(&sha256);
            if tokio::fs::try_exists(&staged).await? {
                debug!(sha256 = %sha256, "Binary already staged");
            } else {
                tokio::fs::create_dir_all(binaries_dir).await?;
                tokio::fs::copy(path, &staged).await?;
                info!(sha256 = %sha256, size = metadata.len(), "Binary staged");
            }

            Ok(SubmittedTarget::File {
                path: staged,
                filename,
                sha256,
                size: metadata.len(),
            })
        }
    }
}
