//! Sources of upgrade and version records.
//!
//! A provider is one origin of truth: the chain's governance module, a shared
//! relational database, or a JSON file on the local disk. The registry fans
//! out to every configured provider and reconciles the results; providers
//! never talk to each other.
//!
//! Capabilities differ per provider, so the set is modeled as a tagged union
//! rather than trait objects probed at runtime: the chain is read-only, while
//! the database and local providers also resolve versions, and the local
//! provider additionally persists the state machine.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

use helmsman_types::{ProviderKind, Upgrade, UpgradeType, Version};

mod chain;
mod database;
mod local;

pub use chain::ChainProvider;
pub use database::DatabaseProvider;
pub use local::LocalProvider;

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("{operation} is not supported for the {provider} provider")]
    Unsupported {
        operation: &'static str,
        provider: ProviderKind,
    },
    #[error("network {got} does not match the {provider} provider network {expected}")]
    NetworkMismatch {
        provider: ProviderKind,
        got: String,
        expected: String,
    },
    #[error("record for height={height}, priority={priority} already registered")]
    AlreadyRegistered { height: i64, priority: i32 },
    #[error("found multiple records for height={height}, priority={priority}")]
    DuplicateKey { height: i64, priority: i32 },
    #[error("could not access {path}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not decode {path}")]
    Json {
        path: std::path::PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("database query failed")]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Chain(#[from] helmsman_chain_client::ChainClientError),
    #[error("{0}")]
    Invalid(String),
}

/// A configured provider instance.
#[derive(Debug)]
pub enum Provider {
    Chain(ChainProvider),
    Database(DatabaseProvider),
    Local(std::sync::Arc<LocalProvider>),
}

impl Provider {
    pub fn kind(&self) -> ProviderKind {
        match self {
            Provider::Chain(_) => ProviderKind::Chain,
            Provider::Database(_) => ProviderKind::Database,
            Provider::Local(_) => ProviderKind::Local,
        }
    }

    /// Whether this provider can serve version records.
    pub fn resolves_versions(&self) -> bool {
        !matches!(self, Provider::Chain(_))
    }

    pub async fn get_upgrades(&self) -> Result<Vec<Upgrade>, ProviderError> {
        match self {
            Provider::Chain(p) => p.get_upgrades().await,
            Provider::Database(p) => p.get_upgrades().await,
            Provider::Local(p) => p.get_upgrades(),
        }
    }

    pub async fn get_upgrades_by_height(&self, height: i64) -> Result<Vec<Upgrade>, ProviderError> {
        let upgrades = self.get_upgrades().await?;
        Ok(upgrades.into_iter().filter(|u| u.height == height).collect())
    }

    pub async fn get_upgrades_by_type(
        &self,
        upgrade_type: UpgradeType,
    ) -> Result<Vec<Upgrade>, ProviderError> {
        let upgrades = self.get_upgrades().await?;
        Ok(upgrades.into_iter().filter(|u| u.upgrade_type == upgrade_type).collect())
    }

    pub async fn add_upgrade(&self, upgrade: Upgrade, overwrite: bool) -> Result<(), ProviderError> {
        match self {
            Provider::Chain(_) => Err(ProviderError::Unsupported {
                operation: "add upgrade",
                provider: ProviderKind::Chain,
            }),
            Provider::Database(p) => p.add_upgrade(upgrade, overwrite).await,
            Provider::Local(p) => p.add_upgrade(upgrade, overwrite),
        }
    }

    pub async fn cancel_upgrade(&self, height: i64, network: &str) -> Result<(), ProviderError> {
        match self {
            Provider::Chain(_) => Err(ProviderError::Unsupported {
                operation: "cancel upgrade",
                provider: ProviderKind::Chain,
            }),
            Provider::Database(p) => p.cancel_upgrade(height, network).await,
            Provider::Local(p) => p.cancel_upgrade(height, network),
        }
    }

    pub async fn get_versions(&self) -> Result<Vec<Version>, ProviderError> {
        match self {
            Provider::Chain(_) => Err(ProviderError::Unsupported {
                operation: "get versions",
                provider: ProviderKind::Chain,
            }),
            Provider::Database(p) => p.get_versions().await,
            Provider::Local(p) => p.get_versions(),
        }
    }

    pub async fn get_versions_by_height(&self, height: i64) -> Result<Vec<Version>, ProviderError> {
        let versions = self.get_versions().await?;
        Ok(versions.into_iter().filter(|v| v.height == height).collect())
    }

    pub async fn register_version(
        &self,
        version: Version,
        overwrite: bool,
    ) -> Result<(), ProviderError> {
        match self {
            Provider::Chain(_) => Err(ProviderError::Unsupported {
                operation: "register version",
                provider: ProviderKind::Chain,
            }),
            Provider::Database(p) => p.register_version(version, overwrite).await,
            Provider::Local(p) => p.register_version(version, overwrite),
        }
    }
}

/// Fill in the fields a caller may legitimately leave empty: the source is
/// stamped with the provider's own kind and a zero priority is replaced by
/// the provider default.
pub fn post_process_upgrade(upgrade: &mut Upgrade, source: ProviderKind, priority: i32) {
    if upgrade.source != source {
        upgrade.source = source;
    }
    if upgrade.priority == 0 {
        upgrade.priority = priority;
    }
}

pub fn post_process_version(version: &mut Version, source: ProviderKind, priority: i32) {
    if version.source != source {
        version.source = source;
    }
    if version.priority == 0 {
        version.priority = priority;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn post_processing_fills_source_and_priority() {
        let mut upgrade = Upgrade { height: 10, ..Default::default() };
        post_process_upgrade(&mut upgrade, ProviderKind::Database, 7);
        assert_eq!(upgrade.source, ProviderKind::Database);
        assert_eq!(upgrade.priority, 7);

        // an explicit priority is kept
        let mut upgrade = Upgrade { height: 10, priority: 42, ..Default::default() };
        post_process_upgrade(&mut upgrade, ProviderKind::Database, 7);
        assert_eq!(upgrade.priority, 42);
    }
}
