//! The authority over each upgrade's status and step.
//!
//! Providers report what they know; this state machine decides what is true.
//! Upgrades coming from providers carry one of `UNKNOWN`, `SCHEDULED`,
//! `ACTIVE` or `CANCELLED`; the remaining statuses (`EXECUTING`, `COMPLETED`,
//! `FAILED`, `EXPIRED`) are only ever set here while driving an upgrade
//! through execution. Handing the machine any other provider status is a
//! programming error and panics.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use helmsman_providers::{LocalProvider, ProviderError};
use helmsman_types::{
    CheckStatus, MachineState, PostCheck, PreCheck, Upgrade, UpgradeStatus, UpgradeStep,
    UpgradeType,
};
use tracing::warn;

/// Narrow persistence capability the state machine delegates to.
pub trait StateStorage: Send + Sync {
    fn store_state(&self, state: &MachineState) -> Result<(), ProviderError>;
    fn restore_state(&self) -> Result<Option<MachineState>, ProviderError>;
}

impl StateStorage for LocalProvider {
    fn store_state(&self, state: &MachineState) -> Result<(), ProviderError> {
        LocalProvider::store_state(self, state)
    }

    fn restore_state(&self) -> Result<Option<MachineState>, ProviderError> {
        LocalProvider::restore_state(self)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StateMachineError {
    #[error("status transition from {from} to {to} is not allowed")]
    TransitionNotAllowed { from: UpgradeStatus, to: UpgradeStatus },
    #[error("cannot cancel upgrade {height} with status {status} and step {step}")]
    CancelNotAllowed { height: i64, status: UpgradeStatus, step: UpgradeStep },
}

pub struct StateMachine {
    state: RwLock<MachineState>,
    storage: Option<Arc<dyn StateStorage>>,
}

impl std::fmt::Debug for StateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateMachine")
            .field("persistent", &self.storage.is_some())
            .finish_non_exhaustive()
    }
}

impl StateMachine {
    /// A machine without storage keeps everything in memory only.
    pub fn new(storage: Option<Arc<dyn StateStorage>>) -> Self {
        Self { state: RwLock::new(MachineState::default()), storage }
    }

    /// Replace the in-memory maps with the persisted snapshot. Must complete
    /// before the first [`update_status`](Self::update_status) call.
    pub fn restore(&self) -> Result<(), ProviderError> {
        let Some(storage) = &self.storage else {
            return Ok(());
        };
        let Some(restored) = storage.restore_state()? else {
            // the state was likely never persisted yet
            return Ok(());
        };
        let mut state = self.write();
        *state = restored;
        Ok(())
    }

    /// Reconcile the machine with a fresh provider view.
    ///
    /// # Panics
    ///
    /// Panics when an upgrade carries a status providers must not produce;
    /// that is a bug in a provider, not an operational error.
    pub fn update_status(&self, current_height: i64, upgrades: &HashMap<i64, Upgrade>) {
        let mut state = self.write();

        for upgrade in upgrades.values() {
            assert!(
                upgrade.status.is_provider_input(),
                "invalid provider status {} for upgrade at height {}",
                upgrade.status,
                upgrade.height,
            );

            state.status.entry(upgrade.height).or_insert(upgrade.status);
            state.steps.entry(upgrade.height).or_insert(UpgradeStep::None);
        }

        // drop state for upgrades that disappeared from the provider view
        state.status.retain(|height, _| upgrades.contains_key(height));
        state.steps.retain(|height, _| upgrades.contains_key(height));

        for upgrade in upgrades.values() {
            let current = state.status.get(&upgrade.height).copied().unwrap_or_default();

            // a cancellation, from either side, is locked in
            if upgrade.status == UpgradeStatus::Cancelled || current == UpgradeStatus::Cancelled {
                state.status.insert(upgrade.height, UpgradeStatus::Cancelled);
                continue;
            }

            if current.is_machine_managed() {
                continue;
            }

            match upgrade.upgrade_type {
                UpgradeType::Governance => {
                    if upgrade.source == helmsman_types::ProviderKind::Chain {
                        // the on-chain proposal status is the source of truth
                        state.status.insert(upgrade.height, upgrade.status);
                    } else if upgrade.height > current_height {
                        // governance upgrades announced through other
                        // providers have no on-chain status to follow; treat
                        // a future height as ready
                        state.status.insert(upgrade.height, UpgradeStatus::Active);
                    }
                }
                UpgradeType::NonGovernanceCoordinated | UpgradeType::NonGovernanceUncoordinated => {
                    if upgrade.height > current_height {
                        state.status.insert(upgrade.height, UpgradeStatus::Active);
                    }
                }
            }
        }

        assert_eq!(
            state.status.len(),
            upgrades.len(),
            "status map diverged from the provider view",
        );

        // whatever is still pending below the current height will never run
        for upgrade in upgrades.values() {
            let status = state.status.get(&upgrade.height).copied().unwrap_or_default();
            if upgrade.height < current_height
                && status != UpgradeStatus::Cancelled
                && !status.is_machine_managed()
            {
                state.status.insert(upgrade.height, UpgradeStatus::Expired);
            }
        }

        self.persist(&state);
    }

    pub fn set_status(&self, height: i64, status: UpgradeStatus) -> Result<(), StateMachineError> {
        let mut state = self.write();
        self.set_status_locked(&mut state, height, status)?;
        self.persist(&state);
        Ok(())
    }

    /// Like [`set_status`](Self::set_status) for transitions the caller has
    /// already proven legal.
    ///
    /// # Panics
    ///
    /// Panics when the transition is rejected.
    pub fn must_set_status(&self, height: i64, status: UpgradeStatus) {
        if let Err(err) = self.set_status(height, status) {
            panic!("{err}");
        }
    }

    pub fn set_step(&self, height: i64, step: UpgradeStep) {
        let mut state = self.write();
        state.steps.insert(height, step);
        self.persist(&state);
    }

    pub fn set_status_and_step(
        &self,
        height: i64,
        status: UpgradeStatus,
        step: UpgradeStep,
    ) -> Result<(), StateMachineError> {
        let mut state = self.write();
        self.set_status_locked(&mut state, height, status)?;
        state.steps.insert(height, step);
        self.persist(&state);
        Ok(())
    }

    /// # Panics
    ///
    /// Panics when the transition is rejected.
    pub fn must_set_status_and_step(&self, height: i64, status: UpgradeStatus, step: UpgradeStep) {
        if let Err(err) = self.set_status_and_step(height, status, step) {
            panic!("{err}");
        }
    }

    pub fn status(&self, height: i64) -> UpgradeStatus {
        self.read().status.get(&height).copied().unwrap_or_default()
    }

    pub fn step(&self, height: i64) -> UpgradeStep {
        self.read().steps.get(&height).copied().unwrap_or_default()
    }

    pub fn set_pre_check_status(&self, height: i64, check: PreCheck, status: CheckStatus) {
        let mut state = self.write();
        state.pre_check_status.entry(height).or_default().insert(check, status);
        self.persist(&state);
    }

    pub fn set_post_check_status(&self, height: i64, check: PostCheck, status: CheckStatus) {
        let mut state = self.write();
        state.post_check_status.entry(height).or_default().insert(check, status);
        self.persist(&state);
    }

    pub fn pre_check_status(&self, height: i64, check: PreCheck) -> CheckStatus {
        self.read()
            .pre_check_status
            .get(&height)
            .and_then(|checks| checks.get(&check))
            .copied()
            .unwrap_or_default()
    }

    pub fn post_check_status(&self, height: i64, check: PostCheck) -> CheckStatus {
        self.read()
            .post_check_status
            .get(&height)
            .and_then(|checks| checks.get(&check))
            .copied()
            .unwrap_or_default()
    }

    /// Snapshot of the full machine state, for display surfaces.
    pub fn snapshot(&self) -> MachineState {
        self.read().clone()
    }

    fn set_status_locked(
        &self,
        state: &mut MachineState,
        height: i64,
        status: UpgradeStatus,
    ) -> Result<(), StateMachineError> {
        let current = state.status.get(&height).copied();

        // cancellation is forbidden once the container is being touched
        if status == UpgradeStatus::Cancelled {
            if let Some(current) = current {
                let step = state.steps.get(&height).copied().unwrap_or_default();
                let past_point_of_no_return = current == UpgradeStatus::Executing
                    && !matches!(
                        step,
                        UpgradeStep::None | UpgradeStep::Monitoring | UpgradeStep::PreUpgradeCheck
                    );
                let terminal_already = matches!(
                    current,
                    UpgradeStatus::Expired | UpgradeStatus::Completed | UpgradeStatus::Failed
                );
                if past_point_of_no_return || terminal_already {
                    return Err(StateMachineError::CancelNotAllowed {
                        height,
                        status: current,
                        step,
                    });
                }
            }
        }

        if let Some(current) = current {
            let executing_rollback = current == UpgradeStatus::Executing
                && matches!(status, UpgradeStatus::Scheduled | UpgradeStatus::Active);
            let leaves_terminal = current.is_terminal() && status != current;
            if executing_rollback || leaves_terminal {
                return Err(StateMachineError::TransitionNotAllowed { from: current, to: status });
            }
        }

        state.status.insert(height, status);
        Ok(())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, MachineState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, MachineState> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Persistence is best effort; the in-memory state stays authoritative
    /// even when the storage write fails.
    fn persist(&self, state: &MachineState) {
        if let Some(storage) = &self.storage {
            if let Err(err) = storage.store_state(state) {
                warn!(error = %err, "failed to persist state machine snapshot");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use helmsman_types::ProviderKind;

    fn upgrade(height: i64, upgrade_type: UpgradeType, status: UpgradeStatus) -> Upgrade {
        Upgrade {
            height,
            upgrade_type,
            status,
            source: ProviderKind::Local,
            network: "testnet-1".to_owned(),
            ..Default::default()
        }
    }

    fn view(upgrades: Vec<Upgrade>) -> HashMap<i64, Upgrade> {
        upgrades.into_iter().map(|u| (u.height, u)).collect()
    }

    #[test]
    fn future_non_governance_upgrade_becomes_active() {
        let machine = StateMachine::new(None);
        machine.update_status(
            5,
            &view(vec![upgrade(10, UpgradeType::NonGovernanceUncoordinated, UpgradeStatus::Unknown)]),
        );
        assert_eq!(machine.status(10), UpgradeStatus::Active);
        assert_eq!(machine.step(10), UpgradeStep::None);
    }

    #[test]
    fn chain_governance_status_is_truth() {
        let machine = StateMachine::new(None);
        let mut scheduled = upgrade(10, UpgradeType::Governance, UpgradeStatus::Scheduled);
        scheduled.source = ProviderKind::Chain;
        machine.update_status(5, &view(vec![scheduled.clone()]));
        assert_eq!(machine.status(10), UpgradeStatus::Scheduled);

        scheduled.status = UpgradeStatus::Active;
        machine.update_status(5, &view(vec![scheduled]));
        assert_eq!(machine.status(10), UpgradeStatus::Active);
    }

    #[test]
    fn governance_from_other_provider_becomes_active() {
        let machine = StateMachine::new(None);
        machine.update_status(
            5,
            &view(vec![upgrade(10, UpgradeType::Governance, UpgradeStatus::Unknown)]),
        );
        assert_eq!(machine.status(10), UpgradeStatus::Active);
    }

    #[test]
    fn past_upgrade_expires() {
        let machine = StateMachine::new(None);
        machine.update_status(
            5,
            &view(vec![upgrade(7, UpgradeType::NonGovernanceUncoordinated, UpgradeStatus::Active)]),
        );
        assert_eq!(machine.status(7), UpgradeStatus::Active);

        machine.update_status(
            8,
            &view(vec![upgrade(7, UpgradeType::NonGovernanceUncoordinated, UpgradeStatus::Active)]),
        );
        assert_eq!(machine.status(7), UpgradeStatus::Expired);
    }

    #[test]
    fn disappeared_upgrades_are_dropped() {
        let machine = StateMachine::new(None);
        machine.update_status(
            5,
            &view(vec![upgrade(10, UpgradeType::NonGovernanceUncoordinated, UpgradeStatus::Active)]),
        );
        machine.update_status(5, &HashMap::new());
        assert_eq!(machine.status(10), UpgradeStatus::Unknown);
        assert_eq!(machine.step(10), UpgradeStep::None);
    }

    #[test]
    fn cancellation_is_locked_in() {
        let machine = StateMachine::new(None);
        machine.update_status(
            5,
            &view(vec![upgrade(10, UpgradeType::NonGovernanceUncoordinated, UpgradeStatus::Cancelled)]),
        );
        assert_eq!(machine.status(10), UpgradeStatus::Cancelled);

        // provider now claims active again; the cancellation wins
        machine.update_status(
            5,
            &view(vec![upgrade(10, UpgradeType::NonGovernanceUncoordinated, UpgradeStatus::Active)]),
        );
        assert_eq!(machine.status(10), UpgradeStatus::Cancelled);
    }

    #[test]
    #[should_panic(expected = "invalid provider status")]
    fn machine_managed_provider_status_panics() {
        let machine = StateMachine::new(None);
        machine.update_status(
            5,
            &view(vec![upgrade(10, UpgradeType::Governance, UpgradeStatus::Executing)]),
        );
    }

    #[test]
    fn terminal_statuses_are_immutable() {
        let machine = StateMachine::new(None);
        machine.set_status(10, UpgradeStatus::Completed).unwrap();

        // idempotent
        machine.set_status(10, UpgradeStatus::Completed).unwrap();

        let err = machine.set_status(10, UpgradeStatus::Active).unwrap_err();
        assert!(matches!(err, StateMachineError::TransitionNotAllowed { .. }));
    }

    #[test]
    fn executing_cannot_go_back_to_scheduled_or_active() {
        let machine = StateMachine::new(None);
        machine.set_status(10, UpgradeStatus::Executing).unwrap();
        assert!(machine.set_status(10, UpgradeStatus::Scheduled).is_err());
        assert!(machine.set_status(10, UpgradeStatus::Active).is_err());
        machine.set_status(10, UpgradeStatus::Completed).unwrap();
    }

    #[test]
    fn cancel_race_is_gated_on_step() {
        let machine = StateMachine::new(None);
        machine.set_status(40, UpgradeStatus::Executing).unwrap();
        machine.set_step(40, UpgradeStep::Monitoring);

        // still safe to cancel while only monitoring
        machine.set_status(40, UpgradeStatus::Cancelled).unwrap();

        let machine = StateMachine::new(None);
        machine.set_status(40, UpgradeStatus::Executing).unwrap();
        machine.set_step(40, UpgradeStep::ComposeFileUpgrade);

        let err = machine.set_status(40, UpgradeStatus::Cancelled).unwrap_err();
        assert!(matches!(err, StateMachineError::CancelNotAllowed { height: 40, .. }));
    }

    #[test]
    fn check_statuses_default_to_pending() {
        let machine = StateMachine::new(None);
        assert_eq!(machine.pre_check_status(10, PreCheck::PullDockerImage), CheckStatus::Pending);

        machine.set_pre_check_status(10, PreCheck::PullDockerImage, CheckStatus::Running);
        machine.set_post_check_status(10, PostCheck::GrpcResponsive, CheckStatus::Finished);

        assert_eq!(machine.pre_check_status(10, PreCheck::PullDockerImage), CheckStatus::Running);
        assert_eq!(machine.post_check_status(10, PostCheck::GrpcResponsive), CheckStatus::Finished);
    }

    #[test]
    fn restore_replaces_in_memory_state() {
        use helmsman_providers::LocalProvider;
        let dir = tempfile::TempDir::new().unwrap();
        let provider =
            Arc::new(LocalProvider::new(dir.path().join("local.json"), "testnet-1", 1).unwrap());

        let persisted = StateMachine::new(Some(provider.clone()));
        persisted.set_status(10, UpgradeStatus::Executing).unwrap();
        persisted.set_step(10, UpgradeStep::ComposeFileUpgrade);

        let recovered = StateMachine::new(Some(provider));
        recovered.restore().unwrap();
        assert_eq!(recovered.status(10), UpgradeStatus::Executing);
        assert_eq!(recovered.step(10), UpgradeStep::ComposeFileUpgrade);
    }
}
