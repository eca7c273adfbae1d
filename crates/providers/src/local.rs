//! Upgrades, versions and state-machine snapshots in a local JSON document.
//!
//! The whole document is read and rewritten on every mutation, guarded by a
//! read-write lock. Records are private to this daemon instance; cancelling
//! here does not affect other operators of the same network.

use std::{
    io::Write as _,
    path::PathBuf,
    sync::RwLock,
};

use helmsman_types::{
    MachineState, ProviderKind, Upgrade, UpgradeStatus, UpgradeStep, UpgradeType, Version,
};
use serde::{Deserialize, Serialize};

use crate::{ProviderError, post_process_upgrade, post_process_version};

#[derive(Debug, Default, Serialize, Deserialize)]
struct LocalData {
    #[serde(default)]
    upgrades: Vec<Upgrade>,
    #[serde(default)]
    versions: Vec<Version>,
    #[serde(default)]
    state: Option<MachineState>,
}

#[derive(Debug)]
pub struct LocalProvider {
    path: PathBuf,
    network: String,
    priority: i32,
    lock: RwLock<()>,
}

impl LocalProvider {
    /// Open (or create) the backing document.
    pub fn new(
        path: impl Into<PathBuf>,
        network: impl Into<String>,
        priority: i32,
    ) -> Result<Self, ProviderError> {
        let provider = Self {
            path: path.into(),
            network: network.into(),
            priority,
            lock: RwLock::new(()),
        };
        if !provider.path.exists() {
            provider.write_data(&LocalData::default())?;
        }
        Ok(provider)
    }

    pub fn get_upgrades(&self) -> Result<Vec<Upgrade>, ProviderError> {
        let _guard = self.lock.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        let data = self.read_data()?;
        Ok(data
            .upgrades
            .into_iter()
            .map(|mut upgrade| {
                post_process_upgrade(&mut upgrade, ProviderKind::Local, self.priority);
                upgrade
            })
            .collect())
    }

    pub fn add_upgrade(&self, mut upgrade: Upgrade, overwrite: bool) -> Result<(), ProviderError> {
        post_process_upgrade(&mut upgrade, ProviderKind::Local, self.priority);

        if upgrade.network != self.network {
            return Err(ProviderError::NetworkMismatch {
                provider: ProviderKind::Local,
                got: upgrade.network,
                expected: self.network.clone(),
            });
        }

        let _guard = self.lock.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut data = self.read_data()?;

        if let Some(position) = data
            .upgrades
            .iter()
            .position(|u| u.height == upgrade.height && u.priority == upgrade.priority)
        {
            if !overwrite {
                return Err(ProviderError::AlreadyRegistered {
                    height: upgrade.height,
                    priority: upgrade.priority,
                });
            }
            data.upgrades.remove(position);
        }

        data.upgrades.push(upgrade);
        self.write_data(&data)
    }

    pub fn cancel_upgrade(&self, height: i64, network: &str) -> Result<(), ProviderError> {
        if network != self.network {
            return Err(ProviderError::NetworkMismatch {
                provider: ProviderKind::Local,
                got: network.to_owned(),
                expected: self.network.clone(),
            });
        }

        let _guard = self.lock.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut data = self.read_data()?;

        let highest = data
            .upgrades
            .iter_mut()
            .filter(|u| u.height == height)
            .max_by_key(|u| u.priority);

        match highest {
            Some(upgrade) => upgrade.status = UpgradeStatus::Cancelled,
            None => {
                // nothing registered here yet; record the cancellation so a
                // later registration at this height stays cancelled
                data.upgrades.push(Upgrade {
                    height,
                    network: network.to_owned(),
                    priority: self.priority,
                    upgrade_type: UpgradeType::NonGovernanceUncoordinated,
                    status: UpgradeStatus::Cancelled,
                    step: UpgradeStep::None,
                    source: ProviderKind::Local,
                    ..Default::default()
                });
            }
        }

        self.write_data(&data)
    }

    pub fn get_versions(&self) -> Result<Vec<Version>, ProviderError> {
        let _guard = self.lock.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        let data = self.read_data()?;
        Ok(data
            .versions
            .into_iter()
            .map(|mut version| {
                post_process_version(&mut version, ProviderKind::Local, self.priority);
                version
            })
            .collect())
    }

    pub fn register_version(&self, mut version: Version, overwrite: bool) -> Result<(), ProviderError> {
        post_process_version(&mut version, ProviderKind::Local, self.priority);

        if version.network != self.network {
            return Err(ProviderError::NetworkMismatch {
                provider: ProviderKind::Local,
                got: version.network,
                expected: self.network.clone(),
            });
        }

        let _guard = self.lock.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut data = self.read_data()?;

        if let Some(position) = data
            .versions
            .iter()
            .position(|v| v.height == version.height && v.priority == version.priority)
        {
            if !overwrite {
                return Err(ProviderError::AlreadyRegistered {
                    height: version.height,
                    priority: version.priority,
                });
            }
            data.versions.remove(position);
        }

        data.versions.push(version);
        self.write_data(&data)
    }

    /// Persist a state-machine snapshot alongside the records.
    pub fn store_state(&self, state: &MachineState) -> Result<(), ProviderError> {
        let _guard = self.lock.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut data = self.read_data()?;
        data.state = Some(state.clone());
        self.write_data(&data)
    }

    /// Load the persisted state-machine snapshot, if any, after checking the
    /// document invariants.
    pub fn restore_state(&self) -> Result<Option<MachineState>, ProviderError> {
        let _guard = self.lock.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        let data = self.read_data()?;
        self.check_invariants(&data)?;
        Ok(data.state)
    }

    fn check_invariants(&self, data: &LocalData) -> Result<(), ProviderError> {
        let mut seen = std::collections::HashSet::new();
        for upgrade in &data.upgrades {
            if !seen.insert((upgrade.height, upgrade.priority)) {
                return Err(ProviderError::DuplicateKey {
                    height: upgrade.height,
                    priority: upgrade.priority,
                });
            }
            if upgrade.network != self.network {
                return Err(ProviderError::NetworkMismatch {
                    provider: ProviderKind::Local,
                    got: upgrade.network.clone(),
                    expected: self.network.clone(),
                });
            }
        }
        let mut seen = std::collections::HashSet::new();
        for version in &data.versions {
            if !seen.insert((version.height, version.priority)) {
                return Err(ProviderError::DuplicateKey {
                    height: version.height,
                    priority: version.priority,
                });
            }
            if version.network != self.network {
                return Err(ProviderError::NetworkMismatch {
                    provider: ProviderKind::Local,
                    got: version.network.clone(),
                    expected: self.network.clone(),
                });
            }
        }
        Ok(())
    }

    fn read_data(&self) -> Result<LocalData, ProviderError> {
        let raw = std::fs::read(&self.path).map_err(|source| ProviderError::Io {
            path: self.path.clone(),
            source,
        })?;
        serde_json::from_slice(&raw).map_err(|source| ProviderError::Json {
            path: self.path.clone(),
            source,
        })
    }

    fn write_data(&self, data: &LocalData) -> Result<(), ProviderError> {
        let raw = serde_json::to_vec_pretty(data).map_err(|source| ProviderError::Json {
            path: self.path.clone(),
            source,
        })?;
        let mut options = std::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt as _;
            options.mode(0o600);
        }
        let mut file = options.open(&self.path).map_err(|source| ProviderError::Io {
            path: self.path.clone(),
            source,
        })?;
        file.write_all(&raw).map_err(|source| ProviderError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const NETWORK: &str = "testnet-1";

    fn provider(dir: &TempDir) -> LocalProvider {
        LocalProvider::new(dir.path().join("local.json"), NETWORK, 1).unwrap()
    }

    fn upgrade(height: i64, priority: i32) -> Upgrade {
        Upgrade {
            height,
            network: NETWORK.to_owned(),
            priority,
            ..Default::default()
        }
    }

    #[test]
    fn add_and_read_back() {
        let dir = TempDir::new().unwrap();
        let provider = provider(&dir);

        provider.add_upgrade(upgrade(30, 0), false).unwrap();

        let upgrades = provider.get_upgrades().unwrap();
        assert_eq!(upgrades.len(), 1);
        assert_eq!(upgrades[0].height, 30);
        // zero priority replaced by the provider default, source stamped
        assert_eq!(upgrades[0].priority, 1);
        assert_eq!(upgrades[0].source, ProviderKind::Local);
    }

    #[test]
    fn duplicate_add_requires_overwrite() {
        let dir = TempDir::new().unwrap();
        let provider = provider(&dir);

        provider.add_upgrade(upgrade(30, 1), false).unwrap();
        let err = provider.add_upgrade(upgrade(30, 1), false).unwrap_err();
        assert!(matches!(err, ProviderError::AlreadyRegistered { height: 30, priority: 1 }));

        let mut replacement = upgrade(30, 1);
        replacement.tag = "v2".to_owned();
        provider.add_upgrade(replacement, true).unwrap();
        assert_eq!(provider.get_upgrades().unwrap()[0].tag, "v2");
    }

    #[test]
    fn rejects_foreign_network() {
        let dir = TempDir::new().unwrap();
        let provider = provider(&dir);

        let mut foreign = upgrade(30, 1);
        foreign.network = "other".to_owned();
        assert!(matches!(
            provider.add_upgrade(foreign, false),
            Err(ProviderError::NetworkMismatch { .. })
        ));
    }

    #[test]
    fn cancel_flips_highest_priority_row() {
        let dir = TempDir::new().unwrap();
        let provider = provider(&dir);

        provider.add_upgrade(upgrade(40, 2), false).unwrap();
        provider.add_upgrade(upgrade(40, 5), false).unwrap();
        provider.cancel_upgrade(40, NETWORK).unwrap();

        let upgrades = provider.get_upgrades().unwrap();
        let cancelled: Vec<_> =
            upgrades.iter().filter(|u| u.status == UpgradeStatus::Cancelled).collect();
        assert_eq!(cancelled.len(), 1);
        assert_eq!(cancelled[0].priority, 5);
    }

    #[test]
    fn cancel_of_unknown_height_inserts_synthetic_row() {
        let dir = TempDir::new().unwrap();
        let provider = provider(&dir);

        provider.cancel_upgrade(77, NETWORK).unwrap();

        let upgrades = provider.get_upgrades().unwrap();
        assert_eq!(upgrades.len(), 1);
        assert_eq!(upgrades[0].height, 77);
        assert_eq!(upgrades[0].status, UpgradeStatus::Cancelled);
        assert_eq!(upgrades[0].priority, 1);
    }

    #[test]
    fn state_roundtrip() {
        let dir = TempDir::new().unwrap();
        let provider = provider(&dir);

        assert_eq!(provider.restore_state().unwrap(), None);

        let mut state = MachineState::default();
        state.status.insert(10, UpgradeStatus::Active);
        provider.store_state(&state).unwrap();

        assert_eq!(provider.restore_state().unwrap(), Some(state));
    }

    #[test]
    fn restore_rejects_duplicate_keys() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("local.json");
        let doc = serde_json::json!({
            "upgrades": [
                {"height": 30, "network": NETWORK, "priority": 1},
                {"height": 30, "network": NETWORK, "priority": 1}
            ],
            "versions": []
        });
        std::fs::write(&path, serde_json::to_vec(&doc).unwrap()).unwrap();

        let provider = LocalProvider::new(&path, NETWORK, 1).unwrap();
        assert!(matches!(
            provider.restore_state(),
            Err(ProviderError::DuplicateKey { height: 30, priority: 1 })
        ));
    }
}
