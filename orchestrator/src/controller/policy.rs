//! Analysis policy: submission settings limits and platform selection

use shared::types::{Platform, PlatformRequest};
use tracing::warn;

use crate::config::AnalysisConfig;
use crate::error::{OrchestratorError, Result};
use crate::models::{AnalysisSettings, SubmissionSettings};

/// Apply defaults and limits to submitted settings
pub fn resolve_settings(
    config: &AnalysisConfig,
    settings: &SubmissionSettings,
) -> Result<AnalysisSettings> {
    let timeout = match settings.timeout {
        None | Some(0) => config.default_timeout,
        Some(t) if t > config.max_timeout => {
            return Err(OrchestratorError::InvalidSubmission(format!(
                "timeout {}s exceeds the limit of {}s",
                t, config.max_timeout
            )))
        }
        Some(t) => t,
    };

    let priority = match settings.priority {
        None | Some(0) => config.default_priority,
        Some(p) if p > config.max_priority => {
            return Err(OrchestratorError::InvalidSubmission(format!(
                "priority {} is outside 1..={}",
                p, config.max_priority
            )))
        }
        Some(p) => p,
    };

    let mut platforms = Vec::with_capacity(settings.platforms.len());
    for request in &settings.platforms {
        let name = request.platform.trim();
        if name.is_empty() {
            return Err(OrchestratorError::InvalidSubmission(
                "platform name cannot be empty".to_string(),
            ));
        }
        platforms.push(PlatformRequest {
            platform: name.to_lowercase(),
            os_version: request
                .os_version
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string),
        });
    }

    Ok(AnalysisSettings {
        platforms,
        timeout,
        priority,
        tags: settings.tags.clone(),
    })
}

/// Decide which (platform, OS version) pairs get a task.
///
/// The first non-empty source wins: submitted platforms, then the
/// platforms suggested by the pre stage, then the configured default.
/// Requests without a version expand to every version `available`
/// offers. Pairs nothing can run are dropped.
pub fn resolve_platforms(
    submitted: &[PlatformRequest],
    suggested: &[PlatformRequest],
    default: &PlatformRequest,
    available: &[Platform],
    limit: usize,
) -> Vec<Platform> {
    let requests: &[PlatformRequest] = if !submitted.is_empty() {
        submitted
    } else if !suggested.is_empty() {
        suggested
    } else {
        std::slice::from_ref(default)
    };

    let mut resolved: Vec<Platform> = Vec::new();
    for request in requests {
        let matching: Vec<&Platform> = available
            .iter()
            .filter(|p| p.platform == request.platform)
            .filter(|p| match &request.os_version {
                Some(version) => &p.os_version == version,
                None => true,
            })
            .collect();

        if matching.is_empty() {
            warn!(
                platform = %request.platform,
                os_version = request.os_version.as_deref().unwrap_or("any"),
                "No enabled machine for requested platform"
            );
            continue;
        }

        for platform in matching {
            if !resolved.contains(platform) {
                resolved.push(platform.clone());
            }
        }
    }

    resolved.truncate(limit);
    resolved
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn available() -> Vec<Platform> {
        vec![
            Platform::new("linux", "ubuntu22"),
            Platform::new("windows", "10"),
            Platform::new("windows", "11"),
        ]
    }

    #[test]
    fn test_exact_request_yields_one_platform() {
        let resolved = resolve_platforms(
            &[PlatformRequest::exact("windows", "10")],
            &[PlatformRequest::any_version("linux")],
            &PlatformRequest::any_version("windows"),
            &available(),
            5,
        );
        assert_eq!(resolved, vec![Platform::new("windows", "10")]);
    }

    #[test]
    fn test_versionless_request_expands() {
        let resolved = resolve_platforms(
            &[],
            &[
                PlatformRequest::any_version("windows"),
                PlatformRequest::exact("windows", "11"),
            ],
            &PlatformRequest::any_version("linux"),
            &available(),
            5,
        );
        assert_eq!(
            resolved,
            vec![Platform::new("windows", "10"), Platform::new("windows", "11")]
        );
    }

    #[test]
    fn test_default_used_and_unavailable_dropped() {
        let resolved = resolve_platforms(
            &[],
            &[],
            &PlatformRequest::any_version("linux"),
            &available(),
            5,
        );
        assert_eq!(resolved, vec![Platform::new("linux", "ubuntu22")]);

        let none = resolve_platforms(
            &[PlatformRequest::exact("macos", "14")],
            &[],
            &PlatformRequest::any_version("linux"),
            &available(),
            5,
        );
        assert!(none.is_empty());
    }

    #[test]
    fn test_limit_applies() {
        let resolved = resolve_platforms(
            &[
                PlatformRequest::any_version("windows"),
                PlatformRequest::any_version("linux"),
            ],
            &[],
            &PlatformRequest::any_version("windows"),
            &available(),
            2,
        );
        assert_eq!(resolved.len(), 2);
    }

    #[test]
    fn test_settings_defaults_and_limits() {
        let config = AnalysisConfig::default();

        let settings = resolve_settings(&config, &SubmissionSettings::default()).unwrap();
        assert_eq!(settings.timeout, config.default_timeout);
        assert_eq!(settings.priority, config.default_priority);

        let settings = resolve_settings(
            &config,
            &SubmissionSettings {
                platforms: vec![PlatformRequest {
                    platform: " Windows ".to_string(),
                    os_version: Some(" ".to_string()),
                }],
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(settings.platforms, vec![PlatformRequest::any_version("windows")]);

        for bad in [
            SubmissionSettings {
                timeout: Some(config.max_timeout + 1),
                ..Default::default()
            },
            SubmissionSettings {
                priority: Some(config.max_priority + 1),
                ..Default::default()
            },
            SubmissionSettings {
                platforms: vec![PlatformRequest::any_version("  ")],
                ..Default::default()
            },
        ] {
            assert!(matches!(
                resolve_settings(&config, &bad),
                Err(OrchestratorError::InvalidSubmission(_))
            ));
        }
    }
}
