//! The aggregation and reconciliation hub.
//!
//! Holds the provider set, fans out queries to every provider in parallel,
//! reconciles conflicting records by priority and caches the resolved view.
//! An update either commits completely (cache swap, state-machine refresh,
//! sync info) or leaves the previous cache untouched.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
    time::SystemTime,
};

use futures::future::try_join_all;
use helmsman_chain_client::ChainClient;
use helmsman_config::Config;
use helmsman_providers::{
    ChainProvider, DatabaseProvider, LocalProvider, Provider, ProviderError,
};
use helmsman_types::{ProviderKind, Upgrade, UpgradeStatus, UpgradeStep, Version};

use crate::state_machine::{StateMachine, StateMachineError};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("{provider} provider failed")]
    Provider {
        provider: ProviderKind,
        #[source]
        source: ProviderError,
    },
    #[error("{provider} provider returned duplicate records for height={height}, priority={priority}")]
    DuplicateRecords { provider: ProviderKind, height: i64, priority: i32 },
    #[error("{0} provider is not configured")]
    NotConfigured(ProviderKind),
    #[error("status is not allowed to be set manually")]
    StatusNotAllowed,
    #[error("step is not allowed to be set manually")]
    StepNotAllowed,
    #[error("the network {got} does not match the registry network {expected}")]
    NetworkMismatch { got: String, expected: String },
    #[error("force cancel is only supported for the local provider")]
    ForceCancelSource,
    #[error("{provider} provider cannot resolve versions")]
    NotAVersionResolver { provider: ProviderKind },
    #[error(transparent)]
    Config(#[from] helmsman_config::ConfigError),
    #[error(transparent)]
    StateMachine(#[from] StateMachineError),
}

/// When and at which height the cache was last committed.
#[derive(Clone, Copy, Debug, Default)]
pub struct SyncInfo {
    pub last_block_height: i64,
    pub last_update_time: Option<SystemTime>,
}

/// Everything one reconciliation pass produced.
#[derive(Clone, Debug, Default)]
pub struct UpdateOutcome {
    pub versions: HashMap<i64, Version>,
    pub overridden_versions: HashMap<i64, Vec<Version>>,
    pub upgrades: HashMap<i64, Upgrade>,
    pub overridden_upgrades: HashMap<i64, Vec<Upgrade>>,
}

#[derive(Debug, Default)]
struct Cache {
    upgrades: HashMap<i64, Upgrade>,
    versions: HashMap<i64, Version>,
    overridden_upgrades: HashMap<i64, Vec<Upgrade>>,
    overridden_versions: HashMap<i64, Vec<Version>>,
    sync_info: SyncInfo,
}

pub struct UpgradeRegistry {
    providers: HashMap<ProviderKind, Provider>,
    version_providers: Vec<ProviderKind>,
    state_machine: Arc<StateMachine>,
    cache: RwLock<Cache>,
    network: String,
}

impl std::fmt::Debug for UpgradeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpgradeRegistry")
            .field("providers", &self.providers.keys().collect::<Vec<_>>())
            .field("network", &self.network)
            .finish_non_exhaustive()
    }
}

impl UpgradeRegistry {
    pub fn new(
        providers: HashMap<ProviderKind, Provider>,
        version_providers: Vec<ProviderKind>,
        state_machine: Arc<StateMachine>,
        network: impl Into<String>,
    ) -> Self {
        Self {
            providers,
            version_providers,
            state_machine,
            cache: RwLock::new(Cache::default()),
            network: network.into(),
        }
    }

    /// Assemble the registry from configuration: construct every selected
    /// provider, wire the version resolvers and restore the state machine.
    pub fn from_config(cfg: &Config) -> Result<Self, RegistryError> {
        let registry_cfg = &cfg.upgrade_registry;
        let selected = registry_cfg.selected_providers()?;

        let mut providers = HashMap::new();
        let mut local_provider = None;

        for kind in selected {
            let provider = match kind {
                ProviderKind::Chain => {
                    let chain_cfg = registry_cfg
                        .provider
                        .chain
                        .as_ref()
                        .ok_or(RegistryError::NotConfigured(ProviderKind::Chain))?;
                    let client = ChainClient::new(
                        &cfg.clients.host,
                        cfg.clients.grpc_port,
                        cfg.clients.cometbft_port,
                        cfg.clients.timeout,
                    )
                    .map_err(|source| RegistryError::Provider {
                        provider: ProviderKind::Chain,
                        source: source.into(),
                    })?;
                    Provider::Chain(ChainProvider::new(
                        client,
                        registry_cfg.network.clone(),
                        chain_cfg.default_priority,
                    ))
                }
                ProviderKind::Database => {
                    let db_cfg = registry_cfg
                        .provider
                        .database
                        .as_ref()
                        .ok_or(RegistryError::NotConfigured(ProviderKind::Database))?;
                    let provider = DatabaseProvider::new(db_cfg, registry_cfg.network.clone())
                        .map_err(|source| RegistryError::Provider {
                            provider: ProviderKind::Database,
                            source,
                        })?;
                    Provider::Database(provider)
                }
                ProviderKind::Local => {
                    let local_cfg = registry_cfg
                        .provider
                        .local
                        .as_ref()
                        .ok_or(RegistryError::NotConfigured(ProviderKind::Local))?;
                    let provider = Arc::new(
                        LocalProvider::new(
                            &local_cfg.config_path,
                            registry_cfg.network.clone(),
                            local_cfg.default_priority,
                        )
                        .map_err(|source| RegistryError::Provider {
                            provider: ProviderKind::Local,
                            source,
                        })?,
                    );
                    local_provider = Some(provider.clone());
                    Provider::Local(provider)
                }
            };
            providers.insert(kind, provider);
        }

        let version_providers = registry_cfg.version_resolver_providers()?;
        for kind in &version_providers {
            let provider = providers
                .get(kind)
                .ok_or(RegistryError::NotConfigured(*kind))?;
            if !provider.resolves_versions() {
                return Err(RegistryError::NotAVersionResolver { provider: *kind });
            }
        }

        let state_machine = match registry_cfg.state_machine_provider()? {
            Some(ProviderKind::Local) => {
                let storage = local_provider
                    .clone()
                    .ok_or(RegistryError::NotConfigured(ProviderKind::Local))?;
                StateMachine::new(Some(storage))
            }
            Some(kind) => return Err(RegistryError::NotConfigured(kind)),
            // without a storage provider everything stays in memory
            None => StateMachine::new(None),
        };
        state_machine.restore().map_err(|source| RegistryError::Provider {
            provider: ProviderKind::Local,
            source,
        })?;

        Ok(Self::new(
            providers,
            version_providers,
            Arc::new(state_machine),
            registry_cfg.network.clone(),
        ))
    }

    pub fn state_machine(&self) -> Arc<StateMachine> {
        self.state_machine.clone()
    }

    /// The configured provider instances.
    pub fn providers(&self) -> impl Iterator<Item = &Provider> {
        self.providers.values()
    }

    pub fn network(&self) -> &str {
        &self.network
    }

    pub fn sync_info(&self) -> SyncInfo {
        self.read_cache().sync_info
    }

    /// One full reconciliation pass over every provider.
    ///
    /// With `commit` the resolved maps replace the cache atomically, the
    /// state machine is updated and the sync info advances; without it the
    /// pass is a read-only dry run. Any provider failure aborts the whole
    /// update and leaves the cache untouched.
    pub async fn update(
        &self,
        current_height: i64,
        commit: bool,
    ) -> Result<UpdateOutcome, RegistryError> {
        let (versions, overridden_versions) = self.update_versions().await?;
        let (upgrades, overridden_upgrades) = self
            .update_upgrades(current_height, &versions, &overridden_versions, commit)
            .await?;

        Ok(UpdateOutcome { versions, overridden_versions, upgrades, overridden_upgrades })
    }

    async fn update_versions(
        &self,
    ) -> Result<(HashMap<i64, Version>, HashMap<i64, Vec<Version>>), RegistryError> {
        let fetches = self.version_providers.iter().filter_map(|kind| {
            let provider = self.providers.get(kind)?;
            Some(async move {
                let versions = provider.get_versions().await.map_err(|source| {
                    RegistryError::Provider { provider: *kind, source }
                })?;
                check_duplicates(&versions, *kind)?;
                Ok::<_, RegistryError>(versions)
            })
        });

        let results = try_join_all(fetches).await?;
        let all: Vec<Version> = results.into_iter().flatten().collect();
        Ok(resolve_priorities(all))
    }

    async fn update_upgrades(
        &self,
        current_height: i64,
        versions: &HashMap<i64, Version>,
        overridden_versions: &HashMap<i64, Vec<Version>>,
        commit: bool,
    ) -> Result<(HashMap<i64, Upgrade>, HashMap<i64, Vec<Upgrade>>), RegistryError> {
        let fetches = self.providers.iter().map(|(kind, provider)| async move {
            let upgrades = provider
                .get_upgrades()
                .await
                .map_err(|source| RegistryError::Provider { provider: *kind, source })?;
            check_duplicates(&upgrades, *kind)?;
            Ok::<_, RegistryError>(upgrades)
        });

        let results = try_join_all(fetches).await?;
        let all: Vec<Upgrade> = results.into_iter().flatten().collect();
        let (mut resolved, overridden) = resolve_priorities(all);

        // resolve missing image tags from the version records at the same height
        for upgrade in resolved.values_mut() {
            if upgrade.tag.is_empty() {
                if let Some(version) = versions.get(&upgrade.height) {
                    upgrade.tag = version.tag.clone();
                }
            }
        }

        if commit {
            let mut cache = self.write_cache();
            cache.upgrades = resolved.clone();
            cache.overridden_upgrades = overridden.clone();
            cache.versions = versions.clone();
            cache.overridden_versions = overridden_versions.clone();
            self.state_machine.update_status(current_height, &cache.upgrades);
            cache.sync_info = SyncInfo {
                last_block_height: current_height,
                last_update_time: Some(SystemTime::now()),
            };
        }

        Ok((resolved, overridden))
    }

    pub fn all_upgrades_cached(&self) -> HashMap<i64, Upgrade> {
        self.read_cache().upgrades.clone()
    }

    pub async fn all_upgrades(&self, use_cache: bool) -> Result<HashMap<i64, Upgrade>, RegistryError> {
        if use_cache {
            return Ok(self.all_upgrades_cached());
        }
        Ok(self.update(0, false).await?.upgrades)
    }

    pub fn overridden_upgrades_cached(&self) -> HashMap<i64, Vec<Upgrade>> {
        self.read_cache().overridden_upgrades.clone()
    }

    pub fn upgrade_cached(&self, height: i64) -> Option<Upgrade> {
        self.read_cache().upgrades.get(&height).cloned()
    }

    pub async fn upgrade(&self, use_cache: bool, height: i64) -> Result<Option<Upgrade>, RegistryError> {
        if use_cache {
            return Ok(self.upgrade_cached(height));
        }
        Ok(self.update(0, false).await?.upgrades.remove(&height))
    }

    /// Upgrades at or above `height`, filtered to `allowed_status` (empty
    /// filter admits everything), sorted by ascending height. The statuses
    /// consulted are the state machine's, not the providers'.
    pub fn upcoming_upgrades_cached(
        &self,
        height: i64,
        allowed_status: &[UpgradeStatus],
    ) -> Vec<Upgrade> {
        sort_and_filter_by_status(
            &self.read_cache().upgrades,
            &self.state_machine,
            height,
            allowed_status,
        )
    }

    pub async fn upcoming_upgrades(
        &self,
        use_cache: bool,
        height: i64,
        allowed_status: &[UpgradeStatus],
    ) -> Result<Vec<Upgrade>, RegistryError> {
        if use_cache {
            return Ok(self.upcoming_upgrades_cached(height, allowed_status));
        }
        let outcome = self.update(0, false).await?;
        Ok(sort_and_filter_by_status(
            &outcome.upgrades,
            &self.state_machine,
            height,
            allowed_status,
        ))
    }

    pub fn all_versions_cached(&self) -> HashMap<i64, Version> {
        self.read_cache().versions.clone()
    }

    pub async fn all_versions(&self, use_cache: bool) -> Result<HashMap<i64, Version>, RegistryError> {
        if use_cache {
            return Ok(self.all_versions_cached());
        }
        Ok(self.update(0, false).await?.versions)
    }

    pub fn overridden_versions_cached(&self) -> HashMap<i64, Vec<Version>> {
        self.read_cache().overridden_versions.clone()
    }

    pub fn version_cached(&self, height: i64) -> Option<Version> {
        self.read_cache().versions.get(&height).cloned()
    }

    pub async fn version(&self, use_cache: bool, height: i64) -> Result<Option<Version>, RegistryError> {
        if use_cache {
            return Ok(self.version_cached(height));
        }
        Ok(self.update(0, false).await?.versions.remove(&height))
    }

    /// Register an upgrade with the provider named by its `source`.
    ///
    /// Only `UNKNOWN` and `CANCELLED` are accepted as input status (a
    /// cancelled record with a higher priority is how an operator overrides
    /// an existing upgrade); everything else belongs to the state machine.
    pub async fn add_upgrade(&self, upgrade: Upgrade, overwrite: bool) -> Result<(), RegistryError> {
        if !matches!(upgrade.status, UpgradeStatus::Unknown | UpgradeStatus::Cancelled) {
            return Err(RegistryError::StatusNotAllowed);
        }
        if upgrade.step != UpgradeStep::None {
            return Err(RegistryError::StepNotAllowed);
        }

        let kind = upgrade.source;
        let provider = self.mutable_provider(kind)?;
        provider
            .add_upgrade(upgrade, overwrite)
            .await
            .map_err(|source| RegistryError::Provider { provider: kind, source })
    }

    pub async fn register_version(&self, version: Version, overwrite: bool) -> Result<(), RegistryError> {
        let kind = version.source;
        let provider = self.mutable_provider(kind)?;
        provider
            .register_version(version, overwrite)
            .await
            .map_err(|source| RegistryError::Provider { provider: kind, source })
    }

    /// Cancel an upgrade.
    ///
    /// `force` bypasses the providers and cancels straight in the state
    /// machine; that only affects this daemon and is therefore restricted to
    /// the local source.
    pub async fn cancel_upgrade(
        &self,
        height: i64,
        source: ProviderKind,
        network: &str,
        force: bool,
    ) -> Result<(), RegistryError> {
        if force {
            if network != self.network {
                return Err(RegistryError::NetworkMismatch {
                    got: network.to_owned(),
                    expected: self.network.clone(),
                });
            }
            if source != ProviderKind::Local {
                return Err(RegistryError::ForceCancelSource);
            }
            return Ok(self.state_machine.set_status(height, UpgradeStatus::Cancelled)?);
        }

        let provider = self.mutable_provider(source)?;
        provider
            .cancel_upgrade(height, network)
            .await
            .map_err(|err| RegistryError::Provider { provider: source, source: err })
    }

    fn mutable_provider(&self, kind: ProviderKind) -> Result<&Provider, RegistryError> {
        if kind == ProviderKind::Chain {
            return Err(RegistryError::Provider {
                provider: ProviderKind::Chain,
                source: ProviderError::Unsupported {
                    operation: "mutation",
                    provider: ProviderKind::Chain,
                },
            });
        }
        self.providers.get(&kind).ok_or(RegistryError::NotConfigured(kind))
    }

    fn read_cache(&self) -> std::sync::RwLockReadGuard<'_, Cache> {
        self.cache.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_cache(&self) -> std::sync::RwLockWriteGuard<'_, Cache> {
        self.cache.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Anything carrying the `(height, priority)` composite identity.
pub trait Prioritized {
    fn height(&self) -> i64;
    fn priority(&self) -> i32;
}

impl Prioritized for Upgrade {
    fn height(&self) -> i64 {
        self.height
    }
    fn priority(&self) -> i32 {
        self.priority
    }
}

impl Prioritized for Version {
    fn height(&self) -> i64 {
        self.height
    }
    fn priority(&self) -> i32 {
        self.priority
    }
}

/// Group records by height and pick the highest-priority one per group; the
/// losers are retained for display.
///
/// # Panics
///
/// Panics on a priority tie within a group. Priorities must be disjoint
/// across providers at a given height; a tie is a configuration bug that
/// would make resolution nondeterministic.
pub fn resolve_priorities<T: Prioritized>(records: Vec<T>) -> (HashMap<i64, T>, HashMap<i64, Vec<T>>) {
    let mut grouped: HashMap<i64, Vec<T>> = HashMap::new();
    for record in records {
        grouped.entry(record.height()).or_default().push(record);
    }

    let mut resolved = HashMap::with_capacity(grouped.len());
    let mut overridden = HashMap::new();
    for (height, mut group) in grouped {
        group.sort_by(|a, b| {
            assert!(
                a.priority() != b.priority(),
                "found records with the same height={height} and priority={}",
                a.priority(),
            );
            b.priority().cmp(&a.priority())
        });
        let winner = group.remove(0);
        if !group.is_empty() {
            overridden.insert(height, group);
        }
        resolved.insert(height, winner);
    }

    (resolved, overridden)
}

/// Duplicate `(height, priority)` pairs within a single provider are a hard
/// error; the provider's own store is expected to enforce this key.
fn check_duplicates<T: Prioritized>(records: &[T], provider: ProviderKind) -> Result<(), RegistryError> {
    let mut seen = std::collections::HashSet::new();
    for record in records {
        if !seen.insert((record.height(), record.priority())) {
            return Err(RegistryError::DuplicateRecords {
                provider,
                height: record.height(),
                priority: record.priority(),
            });
        }
    }
    Ok(())
}

fn sort_and_filter_by_status(
    upgrades: &HashMap<i64, Upgrade>,
    state_machine: &StateMachine,
    height: i64,
    allowed_status: &[UpgradeStatus],
) -> Vec<Upgrade> {
    let mut upcoming: Vec<Upgrade> = upgrades
        .values()
        .filter(|upgrade| {
            let status = state_machine.status(upgrade.height);
            upgrade.height >= height
                && (allowed_status.is_empty() || allowed_status.contains(&status))
        })
        .cloned()
        .collect();
    upcoming.sort_by_key(|upgrade| upgrade.height);
    upcoming
}
