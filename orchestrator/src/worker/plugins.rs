//! Built-in stage plugins
//!
//! identification: hashes and classifies the submission, picking a member
//! out of zip archives. pre: suggests platforms and normalises archived
//! targets into `target.zip`. post: summarises a task directory.

use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use goblin::Object;
use md5::Md5;
use serde_json::Value;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use shared::types::{
    read_artifact, write_artifact, AnalysisHeader, Identification, PlatformRequest, PostResult,
    PreResult, Stage, SubmittedTarget, TargetDescriptor, WorkItem, ANALYSIS_FILE,
    IDENTIFICATION_FILE, POST_FILE, PRE_FILE, TARGET_ZIP,
};
use tracing::debug;
use zip::ZipArchive;

use super::{PluginLoader, StagePlugin};

/// Loader for the plugins shipped with the orchestrator
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinPlugins;

#[async_trait]
impl PluginLoader for BuiltinPlugins {
    async fn load(&self, stage: Stage) -> Result<Vec<Arc<dyn StagePlugin>>> {
        let plugins: Vec<Arc<dyn StagePlugin>> = match stage {
            Stage::Identification => vec![Arc::new(Identify)],
            Stage::Pre => vec![Arc::new(SuggestPlatforms)],
            Stage::Post => vec![Arc::new(SummarizeTask)],
        };
        Ok(plugins)
    }
}

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";

/// Classify file contents. `None` means nothing we can run.
pub fn classify(data: &[u8], filename: &str) -> Option<&'static str> {
    match Object::parse(data) {
        Ok(Object::PE(_)) => return Some("pe"),
        Ok(Object::Elf(_)) => return Some("elf"),
        Ok(Object::Mach(_)) => return Some("macho"),
        _ => {}
    }

    if data.starts_with(b"%PDF") {
        return Some("pdf");
    }
    if data.starts_with(&[0xD0, 0xCF, 0x11, 0xE0]) {
        return Some("office");
    }

    let extension = Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default();
    match extension.as_str() {
        "docx" | "xlsx" | "pptx" | "docm" | "xlsm" => Some("office"),
        "ps1" | "vbs" | "js" | "bat" | "cmd" | "hta" => Some("script"),
        "sh" | "py" => Some("shell"),
        _ => None,
    }
}

fn media_type(category: &str) -> mime::Mime {
    let raw = match category {
        "pe" => "application/vnd.microsoft.portable-executable",
        "elf" => "application/x-executable",
        "macho" => "application/x-mach-binary",
        "office" => "application/msword",
        "script" | "shell" => "text/plain",
        "archive" => "application/zip",
        _ => return mime::APPLICATION_OCTET_STREAM,
    };
    raw.parse().unwrap_or(mime::APPLICATION_OCTET_STREAM)
}

/// Platforms a category runs on
pub fn platforms_for(category: &str) -> Vec<PlatformRequest> {
    match category {
        "pe" | "office" | "script" | "pdf" | "url" => vec![PlatformRequest::any_version("windows")],
        "elf" | "shell" => vec![PlatformRequest::any_version("linux")],
        "macho" => vec![PlatformRequest::any_version("macos")],
        _ => Vec::new(),
    }
}

fn describe(data: &[u8], filename: &str, category: &str) -> TargetDescriptor {
    let media = if category == "pdf" {
        mime::APPLICATION_PDF
    } else {
        media_type(category)
    };
    TargetDescriptor::File {
        filename: filename.to_string(),
        size: data.len() as u64,
        media_type: media.to_string(),
        md5: hex::encode(Md5::digest(data)),
        sha1: hex::encode(Sha1::digest(data)),
        sha256: hex::encode(Sha256::digest(data)),
    }
}

/// Pick the first runnable member of a zip archive
fn identify_archive(data: &[u8], archive_name: &str) -> Result<Identification> {
    let mut archive = ZipArchive::new(Cursor::new(data)).context("Unreadable zip archive")?;
    let mut selected = None;
    let mut ignored = Vec::new();

    for i in 0..archive.len() {
        let mut member = archive.by_index(i).context("Unreadable zip member")?;
        if member.is_dir() {
            continue;
        }
        let name = member.name().to_string();
        if selected.is_some() {
            ignored.push(name);
            continue;
        }

        let mut contents = Vec::new();
        member
            .read_to_end(&mut contents)
            .with_context(|| format!("Failed to extract {}", name))?;
        match classify(&contents, &name) {
            Some(category) => selected = Some((describe(&contents, &name, category), category)),
            None => ignored.push(name),
        }
    }

    Ok(match selected {
        Some((target, category)) => Identification {
            selected: true,
            target,
            category: category.to_string(),
            ignored,
            parent: Some(archive_name.to_string()),
        },
        None => Identification {
            selected: false,
            target: describe(data, archive_name, "archive"),
            category: "archive".to_string(),
            ignored,
            parent: None,
        },
    })
}

fn identify_file(data: Vec<u8>, filename: String) -> Result<Identification> {
    if data.starts_with(ZIP_MAGIC) && classify(&data, &filename) != Some("office") {
        return identify_archive(&data, &filename);
    }
    Ok(match classify(&data, &filename) {
        Some(category) => Identification {
            selected: true,
            target: describe(&data, &filename, category),
            category: category.to_string(),
            ignored: vec![],
            parent: None,
        },
        None => Identification {
            selected: false,
            target: describe(&data, &filename, "unknown"),
            category: "unknown".to_string(),
            ignored: vec![],
            parent: None,
        },
    })
}

/// Identification stage: writes `identification.json`
pub struct Identify;

#[async_trait]
impl StagePlugin for Identify {
    fn name(&self) -> &str {
        "identify"
    }

    async fn run(&self, item: &WorkItem) -> Result<Value> {
        let header: AnalysisHeader = read_artifact(&item.analysis_path.join(ANALYSIS_FILE))
            .await
            .context("Failed to read analysis.json")?;

        let identification = match header.submitted {
            SubmittedTarget::Url { url } => Identification {
                selected: true,
                target: TargetDescriptor::Url { url },
                category: "url".to_string(),
                ignored: vec![],
                parent: None,
            },
            SubmittedTarget::File { path, filename, .. } => {
                let data = tokio::fs::read(&path)
                    .await
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                tokio::task::spawn_blocking(move || identify_file(data, filename)).await??
            }
        };

        debug!(
            selected = identification.selected,
            category = %identification.category,
            "Target identified"
        );
        write_artifact(&item.analysis_path.join(IDENTIFICATION_FILE), &identification).await?;
        Ok(serde_json::to_value(&identification)?)
    }
}

/// Copy one member of `archive` into a fresh zip at `destination`
fn extract_member_zip(archive: &Path, member: &str, destination: &Path) -> Result<()> {
    let file = std::fs::File::open(archive)
        .with_context(|| format!("Failed to open {}", archive.display()))?;
    let mut source = ZipArchive::new(file).context("Unreadable zip archive")?;
    let mut entry = source
        .by_name(member)
        .with_context(|| format!("{} not found in archive", member))?;
    let mut contents = Vec::new();
    entry.read_to_end(&mut contents)?;

    let out = std::fs::File::create(destination)
        .with_context(|| format!("Failed to create {}", destination.display()))?;
    let mut writer = zip::ZipWriter::new(out);
    let options =
        zip::write::FileOptions::default().compression_method(zip::CompressionMethod::Stored);
    writer.start_file(member, options)?;
    writer.write_all(&contents)?;
    writer.finish()?;
    Ok(())
}

/// Pre stage: writes `pre.json` and, for archived targets, `target.zip`
pub struct SuggestPlatforms;

#[async_trait]
impl StagePlugin for SuggestPlatforms {
    fn name(&self) -> &str {
        "suggest_platforms"
    }

    async fn run(&self, item: &WorkItem) -> Result<Value> {
        let identification: Identification =
            read_artifact(&item.analysis_path.join(IDENTIFICATION_FILE))
                .await
                .context("Failed to read identification.json")?;

        let mut pre = PreResult {
            platforms: platforms_for(&identification.category),
            target_archive: false,
        };

        if identification.parent.is_some() {
            let header: AnalysisHeader =
                read_artifact(&item.analysis_path.join(ANALYSIS_FILE)).await?;
            if let SubmittedTarget::File { path, .. } = header.submitted {
                let member = identification.target.display_name().to_string();
                let destination = item.analysis_path.join(TARGET_ZIP);
                tokio::task::spawn_blocking(move || {
                    extract_member_zip(&path, &member, &destination)
                })
                .await??;
                pre.target_archive = true;
            }
        }

        write_artifact(&item.analysis_path.join(PRE_FILE), &pre).await?;
        Ok(serde_json::to_value(&pre)?)
    }
}

async fn collect_files(root: &Path) -> Result<Vec<(String, u64)>> {
    let mut files = Vec::new();
    let mut pending: Vec<PathBuf> = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            let path = entry.path();
            if metadata.is_dir() {
                pending.push(path);
            } else if let Ok(relative) = path.strip_prefix(root) {
                let relative = relative.to_string_lossy().into_owned();
                if relative != POST_FILE {
                    files.push((relative, metadata.len()));
                }
            }
        }
    }
    files.sort();
    Ok(files)
}

/// Post stage: writes `<task_dir>/post.json`
pub struct SummarizeTask;

#[async_trait]
impl StagePlugin for SummarizeTask {
    fn name(&self) -> &str {
        "summarize_task"
    }

    async fn run(&self, item: &WorkItem) -> Result<Value> {
        let task_id = item
            .task_id
            .clone()
            .context("Post-processing needs a task id")?;
        let task_dir = item.analysis_path.join(&task_id);

        let files = collect_files(&task_dir).await?;
        let post = PostResult {
            task_id,
            total_bytes: files.iter().map(|(_, size)| size).sum(),
            files: files.into_iter().map(|(name, _)| name).collect(),
        };

        write_artifact(&task_dir.join(POST_FILE), &post).await?;
        Ok(serde_json::to_value(&post)?)
    }
}
