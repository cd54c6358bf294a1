use serde::{Deserialize, Serialize};
use shared::types::{Platform, TaskId};

/// Whether a machine can be handed out
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Availability {
    #[default]
    Available,
    InUse { task_id: TaskId },
    /// Out of the pool until the process restarts
    Disabled { reason: String },
}

/// A configured sandbox VM
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Machine {
    pub name: String,
    /// Name of the virtualization backend that owns this machine
    pub backend: String,
    pub platform: String,
    pub os_version: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub ip: Option<String>,
    /// Snapshot restored before every task; the backend's current snapshot when unset
    #[serde(default)]
    pub snapshot: Option<String>,
    #[serde(default)]
    pub availability: Availability,
}

impl Machine {
    pub fn platform(&self) -> Platform {
        Platform::new(self.platform.clone(), self.os_version.clone())
    }

    /// Whether this machine can run a task for `platform` requiring `tags`
    pub fn matches(&self, platform: &Platform, tags: &[String]) -> bool {
        self.platform == platform.platform
            && self.os_version == platform.os_version
            && tags.iter().all(|t| self.tags.contains(t))
    }

    pub fn is_available(&self) -> bool {
        self.availability == Availability::Available
    }

    pub fn is_disabled(&self) -> bool {
        matches!(self.availability, Availability::Disabled { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_machine_definition_parses_without_availability() {
        let raw = r#"{"name": "win10-1", "backend": "virsh", "platform": "windows",
                      "os_version": "10", "tags": ["dotnet"]}"#;
        let machine: Machine = serde_json::from_str(raw).unwrap();
        assert!(machine.is_available());
        assert_eq!(machine.platform(), Platform::new("windows", "10"));
    }

    #[test]
    fn test_tag_matching() {
        let machine = Machine {
            name: "win10-1".to_string(),
            backend: "virsh".to_string(),
            platform: "windows".to_string(),
            os_version: "10".to_string(),
            tags: vec!["dotnet".to_string(), "office".to_string()],
            ip: None,
            snapshot: None,
            availability: Availability::Available,
        };
        let win10 = Platform::new("windows", "10");

        assert!(machine.matches(&win10, &[]));
        assert!(machine.matches(&win10, &["office".to_string()]));
        assert!(!machine.matches(&win10, &["pdf".to_string()]));
        assert!(!machine.matches(&Platform::new("windows", "7"), &[]));
    }
}
