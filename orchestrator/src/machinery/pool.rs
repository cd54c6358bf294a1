use std::collections::{BTreeMap, BTreeSet};

use shared::types::{Platform, TaskId};
use tokio::sync::RwLock;
use tracing::{error, info};

use crate::error::{OrchestratorError, Result};
use crate::models::{Availability, Machine};

/// Configured machines and their availability.
///
/// Availability is the only thing that changes here. A disabled machine
/// stays disabled for the lifetime of the process.
pub struct MachinePool {
    machines: RwLock<BTreeMap<String, Machine>>,
}

impl MachinePool {
    pub fn new(machines: Vec<Machine>) -> Self {
        let machines = machines
            .into_iter()
            .map(|m| (m.name.clone(), m))
            .collect();
        Self {
            machines: RwLock::new(machines),
        }
    }

    pub async fn get(&self, name: &str) -> Option<Machine> {
        self.machines.read().await.get(name).cloned()
    }

    pub async fn list(&self) -> Vec<Machine> {
        self.machines.read().await.values().cloned().collect()
    }

    /// Bind the first available machine matching `platform` and `tags` to `task_id`
    pub async fn acquire(
        &self,
        platform: &Platform,
        tags: &[String],
        task_id: &TaskId,
    ) -> Option<Machine> {
        let mut machines = self.machines.write().await;
        let machine = machines
            .values_mut()
            .find(|m| m.is_available() && m.matches(platform, tags))?;

        machine.availability = Availability::InUse {
            task_id: task_id.clone(),
        };
        info!(machine = %machine.name, task_id = %task_id, "Machine acquired");
        Some(machine.clone())
    }

    /// Return a machine to the pool. Disabled machines stay disabled.
    /// Returns whether the machine was bound to a task.
    pub async fn release(&self, name: &str) -> Result<bool> {
        let mut machines = self.machines.write().await;
        let machine = machines
            .get_mut(name)
            .ok_or_else(|| OrchestratorError::UnknownMachine(name.to_string()))?;

        match &machine.availability {
            Availability::InUse { task_id } => {
                info!(machine = %name, task_id = %task_id, "Machine released");
                machine.availability = Availability::Available;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Take a machine out of the pool. Returns `false` when it already was.
    pub async fn disable(&self, name: &str, reason: &str) -> Result<bool> {
        let mut machines = self.machines.write().await;
        let machine = machines
            .get_mut(name)
            .ok_or_else(|| OrchestratorError::UnknownMachine(name.to_string()))?;

        if machine.is_disabled() {
            return Ok(false);
        }
        error!(machine = %name, reason = %reason, "Machine disabled");
        machine.availability = Availability::Disabled {
            reason: reason.to_string(),
        };
        Ok(true)
    }

    /// Whether an enabled machine, idle or not, could run `platform` with `tags`
    pub async fn can_serve(&self, platform: &Platform, tags: &[String]) -> bool {
        self.machines
            .read()
            .await
            .values()
            .any(|m| !m.is_disabled() && m.matches(platform, tags))
    }

    /// Platforms for which at least one machine is enabled
    pub async fn available_platforms(&self) -> Vec<Platform> {
        let machines = self.machines.read().await;
        machines
            .values()
            .filter(|m| !m.is_disabled())
            .map(|m| m.platform())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

#[cfg(test)]
pub(crate) fn test_machine(name: &str, platform: &str, os_version: &str) -> Machine {
    Machine {
        name: name.to_string(),
        backend: "fake".to_string(),
        platform: platform.to_string(),
        os_version: os_version.to_string(),
        tags: vec![],
        ip: None,
        snapshot: None,
        availability: Availability::Available,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn pool() -> MachinePool {
        MachinePool::new(vec![
            test_machine("win10-1", "windows", "10"),
            test_machine("win10-2", "windows", "10"),
            test_machine("win7-1", "windows", "7"),
        ])
    }

    #[tokio::test]
    async fn test_acquire_binds_exclusively() {
        let pool = pool();
        let win10 = Platform::new("windows", "10");

        let first = pool.acquire(&win10, &[], &"t_1".to_string()).await.unwrap();
        let second = pool.acquire(&win10, &[], &"t_2".to_string()).await.unwrap();
        assert_ne!(first.name, second.name);
        assert!(pool.acquire(&win10, &[], &"t_3".to_string()).await.is_none());

        assert!(pool.release(&first.name).await.unwrap());
        assert!(!pool.release(&first.name).await.unwrap());
        assert!(pool.acquire(&win10, &[], &"t_3".to_string()).await.is_some());
    }

    #[tokio::test]
    async fn test_disable_is_idempotent() {
        let pool = pool();
        assert!(pool.disable("win7-1", "timeout").await.unwrap());
        assert!(!pool.disable("win7-1", "again").await.unwrap());

        let machine = pool.get("win7-1").await.unwrap();
        assert_eq!(
            machine.availability,
            Availability::Disabled {
                reason: "timeout".to_string()
            }
        );
        assert!(pool
            .acquire(&Platform::new("windows", "7"), &[], &"t_1".to_string())
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_release_keeps_disabled_machine_out() {
        let pool = pool();
        let win7 = Platform::new("windows", "7");
        pool.acquire(&win7, &[], &"t_1".to_string()).await.unwrap();
        pool.disable("win7-1", "exception").await.unwrap();

        assert!(!pool.release("win7-1").await.unwrap());
        assert!(pool.get("win7-1").await.unwrap().is_disabled());
    }

    #[tokio::test]
    async fn test_available_platforms_skip_disabled() {
        let pool = pool();
        pool.disable("win7-1", "timeout").await.unwrap();
        assert_eq!(
            pool.available_platforms().await,
            vec![Platform::new("windows", "10")]
        );
        assert!(!pool.can_serve(&Platform::new("windows", "7"), &[]).await);

        pool.acquire(&Platform::new("windows", "10"), &[], &"t_1".to_string())
            .await
            .unwrap();
        assert!(pool.can_serve(&Platform::new("windows", "10"), &[]).await);
        assert!(!pool
            .can_serve(&Platform::new("windows", "10"), &["gpu".to_string()])
            .await);
    }

    #[tokio::test]
    async fn test_unknown_machine() {
        let pool = pool();
        assert!(matches!(
            pool.disable("nope", "x").await,
            Err(OrchestratorError::UnknownMachine(_))
        ));
    }
}
