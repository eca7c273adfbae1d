//! Prometheus metrics under the `helmsman` namespace.

use std::sync::Arc;

use helmsman_registry::{StateMachine, UpgradeRegistry};
use metrics::{counter, describe_counter, describe_gauge, gauge};

pub const UP: &str = "helmsman_up";
pub const BLOCKS_TO_UPGRADE: &str = "helmsman_blocks_to_upgrade_height";
pub const LAST_OBSERVED_HEIGHT: &str = "helmsman_last_observed_height";
pub const HEIGHT_WATCHER_ERRORS: &str = "helmsman_height_watcher_errors";
pub const UPGRADE_INFO_WATCHER_ERRORS: &str = "helmsman_upgrade_info_watcher_errors";
pub const UPGRADE_PROPOSALS_WATCHER_ERRORS: &str = "helmsman_upgrade_proposals_watcher_errors";
pub const NOTIFIER_ERRORS: &str = "helmsman_notifier_errors";

pub fn describe() {
    describe_gauge!(UP, "Is helmsman up?");
    describe_gauge!(BLOCKS_TO_UPGRADE, "Number of blocks to the upgrade height");
    describe_gauge!(LAST_OBSERVED_HEIGHT, "Latest block height observed on the chain");
    describe_counter!(HEIGHT_WATCHER_ERRORS, "Chain height watcher error count");
    describe_counter!(UPGRADE_INFO_WATCHER_ERRORS, "upgrade-info.json watcher error count");
    describe_counter!(UPGRADE_PROPOSALS_WATCHER_ERRORS, "Upgrade proposals watcher error count");
    describe_counter!(NOTIFIER_ERRORS, "Notifier error count");
}

pub fn set_up() {
    gauge!(UP).set(1.0);
}

pub fn count_height_watcher_error() {
    counter!(HEIGHT_WATCHER_ERRORS).increment(1);
}

pub fn count_upgrade_info_watcher_error() {
    counter!(UPGRADE_INFO_WATCHER_ERRORS).increment(1);
}

pub fn count_upgrade_proposals_watcher_error() {
    counter!(UPGRADE_PROPOSALS_WATCHER_ERRORS).increment(1);
}

/// Refresh the per-upgrade distance gauges.
///
/// Label sets of upgrades that already changed status keep their last value
/// in the exporter; the `upgrade_status` label makes the live series
/// distinguishable.
pub fn update_upgrade_gauges(
    registry: &Arc<UpgradeRegistry>,
    state_machine: &Arc<StateMachine>,
    chain_id: &str,
    validator_address: &str,
    current_height: i64,
) {
    gauge!(LAST_OBSERVED_HEIGHT).set(current_height as f64);

    for upgrade in registry.upcoming_upgrades_cached(current_height, &[]) {
        let status = state_machine.status(upgrade.height);
        let step = state_machine.step(upgrade.height);
        gauge!(
            BLOCKS_TO_UPGRADE,
            "upgrade_height" => upgrade.height.to_string(),
            "upgrade_name" => upgrade.name.clone(),
            "upgrade_status" => status.to_string(),
            "upgrade_step" => step.to_string(),
            "chain_id" => chain_id.to_owned(),
            "validator_address" => validator_address.to_owned(),
        )
        .set((upgrade.height - current_height) as f64);
    }
}
