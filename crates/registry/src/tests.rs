use std::{collections::HashMap, sync::Arc};

use helmsman_providers::{LocalProvider, Provider};
use helmsman_types::{
    ProviderKind, Upgrade, UpgradeStatus, UpgradeStep, UpgradeType, Version,
};
use tempfile::TempDir;

use crate::{RegistryError, StateMachine, UpgradeRegistry, resolve_priorities};

const NETWORK: &str = "testnet-1";

fn registry_with_local(dir: &TempDir) -> (UpgradeRegistry, Arc<LocalProvider>) {
    let local =
        Arc::new(LocalProvider::new(dir.path().join("local.json"), NETWORK, 1).unwrap());
    let mut providers = HashMap::new();
    providers.insert(ProviderKind::Local, Provider::Local(local.clone()));
    let registry = UpgradeRegistry::new(
        providers,
        vec![ProviderKind::Local],
        Arc::new(StateMachine::new(None)),
        NETWORK,
    );
    (registry, local)
}

fn upgrade(height: i64, priority: i32) -> Upgrade {
    Upgrade {
        height,
        network: NETWORK.to_owned(),
        priority,
        source: ProviderKind::Local,
        ..Default::default()
    }
}

fn version(height: i64, tag: &str, priority: i32) -> Version {
    Version {
        height,
        tag: tag.to_owned(),
        network: NETWORK.to_owned(),
        priority,
        source: ProviderKind::Local,
    }
}

#[tokio::test]
async fn add_then_get_roundtrips_with_post_processing() {
    let dir = TempDir::new().unwrap();
    let (registry, _) = registry_with_local(&dir);

    let mut request = upgrade(30, 0);
    request.name = "v3".to_owned();
    registry.add_upgrade(request, false).await.unwrap();

    let outcome = registry.update(5, true).await.unwrap();
    let resolved = &outcome.upgrades[&30];
    assert_eq!(resolved.name, "v3");
    assert_eq!(resolved.priority, 1, "default priority must be filled in");
    assert_eq!(resolved.source, ProviderKind::Local);

    assert_eq!(registry.upgrade_cached(30).unwrap().name, "v3");
}

#[tokio::test]
async fn add_upgrade_rejects_manual_lifecycle_state() {
    let dir = TempDir::new().unwrap();
    let (registry, _) = registry_with_local(&dir);

    let mut executing = upgrade(30, 1);
    executing.status = UpgradeStatus::Executing;
    assert!(matches!(
        registry.add_upgrade(executing, false).await,
        Err(RegistryError::StatusNotAllowed)
    ));

    let mut stepped = upgrade(30, 1);
    stepped.step = UpgradeStep::Monitoring;
    assert!(matches!(
        registry.add_upgrade(stepped, false).await,
        Err(RegistryError::StepNotAllowed)
    ));

    // a cancelled record is fine: that is how an operator overrides an
    // existing upgrade with a higher-priority tombstone
    let mut cancelled = upgrade(30, 9);
    cancelled.status = UpgradeStatus::Cancelled;
    registry.add_upgrade(cancelled, false).await.unwrap();
}

#[tokio::test]
async fn second_add_without_overwrite_fails() {
    let dir = TempDir::new().unwrap();
    let (registry, _) = registry_with_local(&dir);

    registry.add_upgrade(upgrade(30, 1), false).await.unwrap();
    let err = registry.add_upgrade(upgrade(30, 1), false).await.unwrap_err();
    assert!(matches!(err, RegistryError::Provider { .. }), "{err}");
}

#[tokio::test]
async fn priority_override_retains_losers() {
    let dir = TempDir::new().unwrap();
    let (registry, local) = registry_with_local(&dir);

    let mut low = upgrade(20, 2);
    low.tag = "a".to_owned();
    let mut high = upgrade(20, 5);
    high.tag = "b".to_owned();
    local.add_upgrade(low, false).unwrap();
    local.add_upgrade(high, false).unwrap();

    let outcome = registry.update(5, true).await.unwrap();
    assert_eq!(outcome.upgrades[&20].tag, "b");
    let overridden = &outcome.overridden_upgrades[&20];
    assert_eq!(overridden.len(), 1);
    assert_eq!(overridden[0].tag, "a");
}

#[tokio::test]
async fn empty_tag_is_resolved_from_versions() {
    let dir = TempDir::new().unwrap();
    let (registry, local) = registry_with_local(&dir);

    local.register_version(version(10, "v2", 1), false).unwrap();
    local.add_upgrade(upgrade(10, 1), false).unwrap();

    let outcome = registry.update(5, true).await.unwrap();
    assert_eq!(outcome.upgrades[&10].tag, "v2");
}

#[tokio::test]
async fn commit_updates_state_machine_and_sync_info() {
    let dir = TempDir::new().unwrap();
    let (registry, local) = registry_with_local(&dir);
    local.add_upgrade(upgrade(10, 1), false).unwrap();

    // dry run: no cache, no state machine changes
    registry.update(5, false).await.unwrap();
    assert!(registry.all_upgrades_cached().is_empty());
    assert_eq!(registry.state_machine().status(10), UpgradeStatus::Unknown);

    registry.update(5, true).await.unwrap();
    assert_eq!(registry.state_machine().status(10), UpgradeStatus::Active);
    assert_eq!(registry.sync_info().last_block_height, 5);
    assert!(registry.sync_info().last_update_time.is_some());
}

#[tokio::test]
async fn active_upgrade_expires_when_height_passes() {
    let dir = TempDir::new().unwrap();
    let (registry, local) = registry_with_local(&dir);
    local.add_upgrade(upgrade(7, 1), false).unwrap();

    registry.update(5, true).await.unwrap();
    assert_eq!(registry.state_machine().status(7), UpgradeStatus::Active);

    registry.update(8, true).await.unwrap();
    assert_eq!(registry.state_machine().status(7), UpgradeStatus::Expired);
}

#[tokio::test]
async fn upcoming_upgrades_filters_and_sorts() {
    let dir = TempDir::new().unwrap();
    let (registry, local) = registry_with_local(&dir);
    local.add_upgrade(upgrade(30, 1), false).unwrap();
    local.add_upgrade(upgrade(10, 1), false).unwrap();
    local.add_upgrade(upgrade(20, 1), false).unwrap();
    registry.update(5, true).await.unwrap();

    let upcoming = registry.upcoming_upgrades_cached(15, &[UpgradeStatus::Active]);
    let heights: Vec<i64> = upcoming.iter().map(|u| u.height).collect();
    assert_eq!(heights, vec![20, 30]);

    // empty filter admits everything at or above the height
    assert_eq!(registry.upcoming_upgrades_cached(0, &[]).len(), 3);
}

#[tokio::test]
async fn duplicate_records_within_a_provider_abort_the_update() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("local.json");
    // hand-written store with a corrupted double entry
    let doc = serde_json::json!({
        "upgrades": [
            {"height": 30, "network": NETWORK, "priority": 1, "type": "NON_GOVERNANCE_UNCOORDINATED"},
            {"height": 30, "network": NETWORK, "priority": 1, "type": "NON_GOVERNANCE_UNCOORDINATED"}
        ]
    });
    std::fs::write(&path, serde_json::to_vec(&doc).unwrap()).unwrap();

    let local = Arc::new(LocalProvider::new(&path, NETWORK, 1).unwrap());
    let mut providers = HashMap::new();
    providers.insert(ProviderKind::Local, Provider::Local(local));
    let registry =
        UpgradeRegistry::new(providers, vec![], Arc::new(StateMachine::new(None)), NETWORK);

    let err = registry.update(5, true).await.unwrap_err();
    assert!(matches!(err, RegistryError::DuplicateRecords { height: 30, priority: 1, .. }));
    // the failed update must not have touched the cache
    assert!(registry.all_upgrades_cached().is_empty());
}

#[tokio::test]
async fn force_cancel_goes_straight_to_the_state_machine() {
    let dir = TempDir::new().unwrap();
    let (registry, local) = registry_with_local(&dir);
    local.add_upgrade(upgrade(40, 1), false).unwrap();
    registry.update(5, true).await.unwrap();

    assert!(matches!(
        registry.cancel_upgrade(40, ProviderKind::Database, NETWORK, true).await,
        Err(RegistryError::ForceCancelSource)
    ));
    assert!(matches!(
        registry.cancel_upgrade(40, ProviderKind::Local, "other", true).await,
        Err(RegistryError::NetworkMismatch { .. })
    ));

    registry.cancel_upgrade(40, ProviderKind::Local, NETWORK, true).await.unwrap();
    assert_eq!(registry.state_machine().status(40), UpgradeStatus::Cancelled);
    // the provider store is untouched by a forced cancel
    assert_eq!(local.get_upgrades().unwrap()[0].status, UpgradeStatus::Unknown);
}

#[test]
fn resolve_priorities_picks_max_and_keeps_losers() {
    let (resolved, overridden) =
        resolve_priorities(vec![upgrade(20, 2), upgrade(20, 5), upgrade(21, 3)]);
    assert_eq!(resolved[&20].priority, 5);
    assert_eq!(resolved[&21].priority, 3);
    assert_eq!(overridden[&20].len(), 1);
    assert_eq!(overridden[&20][0].priority, 2);
    assert!(!overridden.contains_key(&21));
}

#[test]
#[should_panic(expected = "same height")]
fn resolve_priorities_panics_on_tie() {
    resolve_priorities(vec![upgrade(20, 2), upgrade(20, 2)]);
}

#[tokio::test]
async fn governance_waits_for_chain_even_when_height_reached() {
    // a governance upgrade announced via a non-chain provider stays ACTIVE
    // until the plan file shows up; crossing the height expires it instead
    let dir = TempDir::new().unwrap();
    let (registry, local) = registry_with_local(&dir);
    let mut gov = upgrade(10, 1);
    gov.upgrade_type = UpgradeType::Governance;
    local.add_upgrade(gov, false).unwrap();

    registry.update(9, true).await.unwrap();
    assert_eq!(registry.state_machine().status(10), UpgradeStatus::Active);

    registry.update(10, true).await.unwrap();
    assert_eq!(registry.state_machine().status(10), UpgradeStatus::Active);
}
