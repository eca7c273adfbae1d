//! The orchestration loop.

use std::{
    sync::{Arc, RwLock},
    time::{Duration, Instant},
};

use eyre::{WrapErr as _, bail};
use helmsman_chain_client::ChainClient;
use helmsman_compose::{ComposeClient, CredentialHelper, validate_halt_height_settings};
use helmsman_config::Config;
use helmsman_providers::Provider;
use helmsman_registry::{StateMachine, UpgradeRegistry};
use helmsman_types::{
    CheckStatus, PostCheck, PreCheck, Upgrade, UpgradeStatus, UpgradeStep, UpgradeType,
};
use helmsman_watchers::{HeightWatcher, UpgradeInfoWatcher, UpgradeProposalsWatcher};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    checks,
    metrics,
    notifier::{CallScope, Level, Notifier},
};

const BLOCK_SPEED_SAMPLES: usize = 5;
/// How long to wait for a halt-height node to stop itself before giving up.
const HALT_WAIT_DEADLINE: Duration = Duration::from_secs(120);
/// Consecutive tip observations at/past the upgrade height after which the
/// halt is assumed to have worked without a process exit.
const HALT_OBSERVATIONS: u32 = 5;

/// Live loop state shared with the HTTP surfaces.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoopStatus {
    pub current_height: i64,
    pub startup_height: i64,
    pub block_speed: Option<Duration>,
}

pub struct Daemon {
    cfg: Config,
    compose: ComposeClient,
    credential_helper: Option<CredentialHelper>,
    client: ChainClient,
    registry: Arc<UpgradeRegistry>,
    state_machine: Arc<StateMachine>,
    notifier: Arc<Notifier>,
    status: Arc<RwLock<LoopStatus>>,

    validator_address: String,
    startup_height: i64,
    curr_height: i64,
    curr_height_time: Option<Instant>,
    observed_block_speeds: [Duration; BLOCK_SPEED_SAMPLES],
    curr_block_speed: Option<Duration>,
}

impl std::fmt::Debug for Daemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Daemon")
            .field("network", &self.registry.network())
            .field("curr_height", &self.curr_height)
            .finish_non_exhaustive()
    }
}

impl Daemon {
    pub fn new(cfg: Config, notifier: Arc<Notifier>) -> eyre::Result<Self> {
        let registry =
            Arc::new(UpgradeRegistry::from_config(&cfg).wrap_err("failed to load upgrade registry")?);
        let state_machine = registry.state_machine();

        let compose =
            ComposeClient::new(&cfg.compose_file, &cfg.version_file, cfg.upgrade_mode);
        let credential_helper = cfg.credential_helper.as_ref().map(CredentialHelper::new);
        let client = ChainClient::new(
            &cfg.clients.host,
            cfg.clients.grpc_port,
            cfg.clients.cometbft_port,
            cfg.clients.timeout,
        )
        .wrap_err("failed to create chain client")?;

        Ok(Self {
            cfg,
            compose,
            credential_helper,
            client,
            registry,
            state_machine,
            notifier,
            status: Arc::new(RwLock::new(LoopStatus::default())),
            validator_address: String::new(),
            startup_height: 0,
            curr_height: 0,
            curr_height_time: None,
            observed_block_speeds: [Duration::ZERO; BLOCK_SPEED_SAMPLES],
            curr_block_speed: None,
        })
    }

    pub fn registry(&self) -> Arc<UpgradeRegistry> {
        self.registry.clone()
    }

    pub fn status_handle(&self) -> Arc<RwLock<LoopStatus>> {
        self.status.clone()
    }

    /// Smoke-test every external dependency and prime the registry cache.
    pub async fn init(&mut self) -> eyre::Result<()> {
        info!("starting up helmsman daemon");
        metrics::set_up();

        info!("checking docker and the compose plugin");
        let compose_version =
            self.compose.version().await.wrap_err("could not find the docker compose plugin")?;
        debug!(version = %compose_version, "docker compose plugin found");

        info!("fetching node status");
        let status = self.client.status().await.wrap_err("failed to get node status")?;
        self.curr_height = status.latest_block_height;
        self.curr_height_time = Some(Instant::now());
        self.startup_height = status.latest_block_height;
        self.validator_address = status.validator_address.clone();
        info!(
            height = self.curr_height,
            address = %self.validator_address,
            network = %status.network,
            "observed node status",
        );

        let node_info = self.client.node_info().await.wrap_err("failed to get node info")?;
        if self.cfg.compose.env_prefix.is_empty() {
            // convention: <APP_NAME>_ (e.g. "GAIAD_")
            self.cfg.compose.env_prefix =
                format!("{}_", node_info.app_name.to_ascii_uppercase());
        }
        info!(
            application = %node_info.name,
            version = %node_info.version,
            env_prefix = %self.cfg.compose.env_prefix,
            "connected to the node",
        );

        if self
            .cfg
            .checks
            .pre_upgrade
            .enabled_checks()
            .wrap_err("invalid pre-upgrade check configuration")?
            .contains(&PreCheck::SetHaltHeight)
        {
            validate_halt_height_settings(
                &self.cfg.compose_file,
                &self.cfg.compose_service,
                &self.cfg.compose.env_prefix,
            )
            .wrap_err("failed to validate docker compose settings")?;
        }

        info!("fetching consensus state");
        let prevotes =
            self.client.prevote_info().await.wrap_err("failed to get consensus state")?;
        info!(
            total_vp = prevotes.total_vp,
            node_vp = status.voting_power,
            share = %format!(
                "{:.2}%",
                status.voting_power as f64 / prevotes.total_vp.max(1) as f64 * 100.0
            ),
            "observed voting power",
        );

        for provider in self.registry.providers() {
            if let Provider::Database(database) = provider {
                let auto_migrate = self
                    .cfg
                    .upgrade_registry
                    .provider
                    .database
                    .as_ref()
                    .is_some_and(|db| db.auto_migrate);
                if auto_migrate {
                    info!("running database migrations");
                    database.migrate().await.wrap_err("database migration failed")?;
                }
            }
        }

        info!("fetching upgrades from all providers");
        self.registry
            .update(self.curr_height, true)
            .await
            .wrap_err("failed getting upgrades from all providers")?;

        let resolved = self.registry.all_upgrades_cached();
        let overridden = self.registry.overridden_upgrades_cached();
        let upcoming =
            self.registry.upcoming_upgrades_cached(self.curr_height, &[UpgradeStatus::Active]);
        info!(
            resolved = resolved.len(),
            overridden = overridden.len(),
            active = upcoming.len(),
            "initial registry sync complete",
        );
        for upgrade in &upcoming {
            if let Some(losers) = overridden.get(&upgrade.height) {
                info!(
                    height = upgrade.height,
                    source = %upgrade.source,
                    name = %upgrade.name,
                    tag = %upgrade.tag,
                    priority = upgrade.priority,
                    overridden = losers.len(),
                    "upgrade won by priority over other entries",
                );
            }
        }

        self.publish_status();
        self.update_metrics();
        Ok(())
    }

    /// Drive upgrades until cancelled.
    ///
    /// Only a failure to wait for an upgrade is fatal; a failed execution or
    /// post-check is recorded against that upgrade and the loop resumes with
    /// the next one.
    pub async fn run(&mut self, cancel: CancellationToken) -> eyre::Result<()> {
        loop {
            let Some(upgrade_height) = self
                .wait_for_upgrade(&cancel)
                .await
                .wrap_err("monitor routine failed")?
            else {
                info!("daemon loop stopping");
                return Ok(());
            };

            let scope = CallScope::for_height(upgrade_height);

            let outcome = self.perform_upgrade(scope, upgrade_height).await;
            self.update_metrics();
            if let Err(err) = outcome {
                self.notifier
                    .notify_with_cause(scope, Level::Error, "upgrade failed", Some(&format!("{err:#}")))
                    .await;
                continue;
            }

            let outcome = self.post_upgrade_checks(scope, upgrade_height, &cancel).await;
            self.update_metrics();
            if let Err(err) = outcome {
                self.notifier
                    .notify_with_cause(
                        scope,
                        Level::Error,
                        "post-upgrade check failed",
                        Some(&format!("{err:#}")),
                    )
                    .await;
                continue;
            }

            self.state_machine.must_set_status(upgrade_height, UpgradeStatus::Completed);
            self.update_metrics();
            self.notifier.notify(scope, Level::Info, "upgrade completed successfully").await;
        }
    }

    /// Block until an upgrade height is due. Returns `None` on shutdown.
    async fn wait_for_upgrade(&mut self, cancel: &CancellationToken) -> eyre::Result<Option<i64>> {
        let plan_path = self.cfg.upgrade_info_file_path();
        info!(path = %plan_path.display(), "monitoring the upgrade plan file");
        let mut plan_watcher = UpgradeInfoWatcher::spawn(
            &plan_path,
            self.cfg.watchers.upgrade_info_interval,
            cancel.child_token(),
        )
        .wrap_err("failed to start the upgrade-info watcher")?;

        info!("monitoring the chain tip");
        let mut height_watcher = if self.cfg.watchers.height_interval.is_zero() {
            HeightWatcher::streaming(
                self.client.clone(),
                self.cfg.watchers.height_timeout,
                cancel.child_token(),
            )
            .await
            .wrap_err("failed to start the streaming height watcher")?
        } else {
            HeightWatcher::periodic(
                self.client.clone(),
                self.cfg.watchers.height_interval,
                cancel.child_token(),
            )
        };

        info!("monitoring on-chain upgrade proposals");
        let mut proposals_watcher = UpgradeProposalsWatcher::spawn(
            self.client.clone(),
            self.registry.clone(),
            self.cfg.watchers.upgrade_proposals_interval,
            cancel.child_token(),
        );

        // print the observed height every N blocks, not on every single one
        let mut block_delta = 0_i64;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    height_watcher.cancel();
                    proposals_watcher.cancel();
                    plan_watcher.cancel();
                    return Ok(None);
                }
                event = height_watcher.heights.recv() => {
                    let Some(event) = event else {
                        bail!("height watcher stopped unexpectedly");
                    };
                    let new_height = match event {
                        Err(err) => {
                            metrics::count_height_watcher_error();
                            warn!(error = %err, "error received from the height watcher");
                            continue;
                        }
                        Ok(height) => height,
                    };

                    let last_height = self.curr_height;
                    self.update_height_and_block_speed(new_height);
                    block_delta += new_height - last_height;
                    if block_delta >= 10 {
                        block_delta = 0;
                        info!(height = new_height, "current observed height");
                    } else {
                        debug!(height = new_height, "current observed height");
                    }
                    self.update_metrics();

                    if let Some(height) = self.handle_new_height().await? {
                        height_watcher.cancel();
                        proposals_watcher.cancel();
                        plan_watcher.cancel();
                        info!(height, "received upgrade height from the chain");
                        return Ok(Some(height));
                    }
                }
                plan = plan_watcher.plans.recv() => {
                    let Some(plan) = plan else {
                        bail!("upgrade plan watcher stopped unexpectedly");
                    };
                    match plan {
                        Err(err) => {
                            metrics::count_upgrade_info_watcher_error();
                            warn!(error = %err, "error received from the upgrade plan watcher");
                        }
                        Ok(plan) => {
                            height_watcher.cancel();
                            proposals_watcher.cancel();
                            info!(name = %plan.name, height = plan.height, "received upgrade plan from the node");
                            return Ok(Some(plan.height));
                        }
                    }
                }
                error = proposals_watcher.errors.recv() => {
                    let Some(error) = error else {
                        bail!("proposals watcher stopped unexpectedly");
                    };
                    metrics::count_upgrade_proposals_watcher_error();
                    warn!(error = %error, "error received from the proposals watcher");
                }
            }
        }
    }

    /// React to a fresh tip: run pre-checks within the look-ahead window and
    /// decide whether a non-governance upgrade is due.
    ///
    /// Governance upgrades are never triggered here; the node halting and
    /// writing the plan file is their signal.
    async fn handle_new_height(&mut self) -> eyre::Result<Option<i64>> {
        let upcoming = self
            .registry
            .upcoming_upgrades_cached(self.curr_height, &[UpgradeStatus::Active]);
        let Some(upgrade) = upcoming.into_iter().next() else {
            return Ok(None);
        };

        // replay guard: a restarted daemon must not re-run an upgrade the
        // chain already moved past before startup
        if self.startup_height > upgrade.height {
            warn!(
                height = upgrade.height,
                startup_height = self.startup_height,
                "skipping upgrade scheduled before the daemon startup height",
            );
            return Ok(None);
        }

        if self.state_machine.step(upgrade.height) == UpgradeStep::None {
            self.state_machine.set_step(upgrade.height, UpgradeStep::Monitoring);
        }

        if upgrade.height < self.curr_height + self.cfg.checks.pre_upgrade.blocks {
            let result = self.pre_upgrade_checks(&upgrade).await;
            match result {
                Err(err) => {
                    // a failed pre-check stops this upgrade, not the daemon
                    warn!(height = upgrade.height, error = %format!("{err:#}"), "pre-upgrade checks failed");
                    self.state_machine.must_set_status(upgrade.height, UpgradeStatus::Failed);
                    self.update_metrics();
                    return Ok(None);
                }
                Ok(Some(reached_height)) => {
                    info!(height = reached_height, "setting observed height");
                    self.curr_height = reached_height;
                    self.publish_status();
                }
                Ok(None) => {}
            }
            self.update_metrics();
        }

        let non_governance = matches!(
            upgrade.upgrade_type,
            UpgradeType::NonGovernanceCoordinated | UpgradeType::NonGovernanceUncoordinated
        );
        if upgrade.height <= self.curr_height && non_governance {
            return Ok(Some(upgrade.height));
        }

        Ok(None)
    }

    /// Run the configured pre-upgrade checks once per upgrade.
    ///
    /// Returns the reached height when the halt-height wait observed the
    /// node stopping at the upgrade boundary.
    async fn pre_upgrade_checks(&mut self, upgrade: &Upgrade) -> eyre::Result<Option<i64>> {
        let scope = CallScope::for_height(upgrade.height);
        let pre_cfg = self.cfg.checks.pre_upgrade.clone();
        let enabled = pre_cfg.enabled_checks().wrap_err("invalid pre-upgrade checks")?;

        let step = self.state_machine.step(upgrade.height);
        if !matches!(step, UpgradeStep::Monitoring | UpgradeStep::PreUpgradeCheck) {
            return Ok(None);
        }

        if step == UpgradeStep::Monitoring {
            self.notifier
                .notify(
                    scope,
                    Level::Info,
                    &format!(
                        "detected upcoming upgrade (type: {}, tag: {}, network: {}); \
                         current height: {}, upgrade height: {}",
                        upgrade.upgrade_type,
                        upgrade.tag,
                        self.registry.network(),
                        self.curr_height,
                        upgrade.height,
                    ),
                )
                .await;
            if enabled.is_empty() {
                self.notifier
                    .notify(scope, Level::Info, "no pre-upgrade checks configured, skipping")
                    .await;
            } else {
                let names: Vec<&str> = enabled.iter().map(|check| check.as_str()).collect();
                self.notifier
                    .notify(
                        scope,
                        Level::Info,
                        &format!("running pre-upgrade checks: {}", names.join(", ")),
                    )
                    .await;
            }
        }

        if step != UpgradeStep::PreUpgradeCheck {
            // a failed pre-check must keep the upgrade ACTIVE: the operator
            // can still fix the cause (e.g. register the missing tag) before
            // the height hits, and the execution phase retries the pull
            self.state_machine.must_set_status_and_step(
                upgrade.height,
                UpgradeStatus::Active,
                UpgradeStep::PreUpgradeCheck,
            );
        }

        if enabled.is_empty() {
            return Ok(None);
        }

        if enabled.contains(&PreCheck::PullDockerImage)
            && self.state_machine.pre_check_status(upgrade.height, PreCheck::PullDockerImage)
                != CheckStatus::Finished
        {
            self.state_machine.set_pre_check_status(
                upgrade.height,
                PreCheck::PullDockerImage,
                CheckStatus::Running,
            );
            self.notifier
                .notify(
                    scope,
                    Level::Info,
                    &format!("checking if the upgrade tag {} is available", upgrade.tag),
                )
                .await;

            let pulled = checks::pre::pull_docker_image(
                &self.compose,
                self.credential_helper.as_ref(),
                &self.cfg.compose_service,
                &upgrade.tag,
                upgrade.height,
                pre_cfg.pull_docker_image.max_retries,
                pre_cfg.pull_docker_image.initial_backoff,
            )
            .await;
            match pulled {
                Ok((_, new_image)) => {
                    self.notifier
                        .notify(
                            scope,
                            Level::Info,
                            &format!(
                                "upgrade image {new_image} is on the host; the switch happens \
                                 when the upgrade height is reached",
                            ),
                        )
                        .await;
                }
                Err(err) => {
                    let hint = if upgrade.tag.is_empty() {
                        "register the image tag"
                    } else {
                        "check why the image is not available on the host"
                    };
                    self.notifier
                        .notify_with_cause(
                            scope,
                            Level::Warn,
                            &format!("pre-upgrade image check failed, please {hint}"),
                            Some(&format!("{err:#}")),
                        )
                        .await;
                }
            }
            self.state_machine.set_pre_check_status(
                upgrade.height,
                PreCheck::PullDockerImage,
                CheckStatus::Finished,
            );
        }

        if enabled.contains(&PreCheck::SetHaltHeight) {
            let status = self.state_machine.pre_check_status(upgrade.height, PreCheck::SetHaltHeight);
            let delay_blocks =
                pre_cfg.set_halt_height.as_ref().map(|halt| halt.delay_blocks).unwrap_or_default();
            let should_run = upgrade.height <= self.curr_height + (pre_cfg.blocks - delay_blocks);

            if should_run && status != CheckStatus::Finished {
                if upgrade.upgrade_type == UpgradeType::NonGovernanceCoordinated {
                    self.state_machine.set_pre_check_status(
                        upgrade.height,
                        PreCheck::SetHaltHeight,
                        CheckStatus::Running,
                    );
                    self.notifier
                        .notify(
                            scope,
                            Level::Info,
                            &format!("restarting the node with halt-height {}", upgrade.height),
                        )
                        .await;

                    let restarted = self
                        .compose
                        .restart_with_halt_height(
                            &self.cfg.compose_service,
                            self.cfg.compose.down_timeout,
                            self.cfg.compose.up_deadline,
                            upgrade.height,
                        )
                        .await;
                    match restarted {
                        Ok(()) => {
                            self.notifier
                                .notify(
                                    scope,
                                    Level::Info,
                                    &format!(
                                        "halt-height set to {}, the node will stop itself when \
                                         it is time to upgrade",
                                        upgrade.height,
                                    ),
                                )
                                .await;
                        }
                        Err(err) => {
                            self.notifier
                                .notify_with_cause(
                                    scope,
                                    Level::Warn,
                                    &format!(
                                        "error setting halt-height; the node will not stop itself \
                                         at {}, manual action required",
                                        upgrade.height,
                                    ),
                                    Some(&err.to_string()),
                                )
                                .await;
                        }
                    }
                } else {
                    info!(
                        height = upgrade.height,
                        "halt-height restart skipped, upgrade is not coordinated",
                    );
                }
                self.state_machine.set_pre_check_status(
                    upgrade.height,
                    PreCheck::SetHaltHeight,
                    CheckStatus::Finished,
                );
            }

            // one block before the boundary: wait for the node to stop itself
            if upgrade.upgrade_type == UpgradeType::NonGovernanceCoordinated
                && status == CheckStatus::Finished
                && self.curr_height == upgrade.height - 1
            {
                return self.wait_for_halt(scope, upgrade).await.map(Some);
            }
        }

        Ok(None)
    }

    /// Spin-wait for a halt-height node to stop itself at the boundary.
    ///
    /// Some node versions panic-and-wait instead of exiting at the halt
    /// height. Observing the tip stuck at (or one past) the upgrade height
    /// several times in a row means the halt worked even though the process
    /// is still alive, and the upgrade can proceed.
    async fn wait_for_halt(&mut self, scope: CallScope, upgrade: &Upgrade) -> eyre::Result<i64> {
        self.notifier
            .notify(
                scope,
                Level::Info,
                &format!(
                    "got block {}, waiting for the node to stop itself due to the halt-height setting",
                    self.curr_height,
                ),
            )
            .await;

        let started = Instant::now();
        let mut at_upgrade_height = 0_u32;
        let mut past_upgrade_height = 0_u32;
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            debug!("checking if the node has stopped itself");

            let running = self
                .compose
                .is_service_running(&self.cfg.compose_service, Duration::from_secs(5))
                .await
                .wrap_err("failed to check if the service is running")?;

            if !running {
                info!("the node has stopped itself, continuing with the upgrade");
                return Ok(upgrade.height);
            }

            if let Ok(height) = self.client.latest_block_height().await {
                if height == upgrade.height {
                    at_upgrade_height += 1;
                } else if height == upgrade.height + 1 {
                    // older node versions commit one more block after the
                    // halt before stopping
                    past_upgrade_height += 1;
                }
            }

            if at_upgrade_height > HALT_OBSERVATIONS || past_upgrade_height > HALT_OBSERVATIONS {
                self.notifier
                    .notify(
                        scope,
                        Level::Warn,
                        "halt-height likely worked but did not shut the node down, continuing",
                    )
                    .await;
                return Ok(upgrade.height);
            }

            if started.elapsed() > HALT_WAIT_DEADLINE {
                let err = eyre::eyre!(
                    "the node did not stop itself within {HALT_WAIT_DEADLINE:?}"
                );
                self.notifier
                    .notify_with_cause(
                        scope,
                        Level::Error,
                        "halt-height pre-check failed",
                        Some(&err.to_string()),
                    )
                    .await;
                return Err(err);
            }
        }
    }

    /// Switch the container to the upgrade image.
    async fn perform_upgrade(&mut self, scope: CallScope, upgrade_height: i64) -> eyre::Result<()> {
        let result = self.perform_upgrade_inner(scope, upgrade_height).await;
        if result.is_err() {
            self.state_machine.must_set_status(upgrade_height, UpgradeStatus::Failed);
        }
        result
    }

    async fn perform_upgrade_inner(
        &mut self,
        scope: CallScope,
        upgrade_height: i64,
    ) -> eyre::Result<()> {
        self.state_machine.must_set_status(upgrade_height, UpgradeStatus::Executing);

        let Some(upgrade) = self.registry.upgrade_cached(upgrade_height) else {
            bail!("upgrade with height {upgrade_height} not found");
        };
        if upgrade_height < self.curr_height {
            bail!(
                "upgrade height {upgrade_height} is below the last observed height {}",
                self.curr_height,
            );
        }

        // the image should already be here from the pre-check, but the
        // upgrade must not fail because it was skipped or raced
        let pull_cfg = self.cfg.checks.pre_upgrade.pull_docker_image.clone();
        let (current_image, new_image) = checks::pre::pull_docker_image(
            &self.compose,
            self.credential_helper.as_ref(),
            &self.cfg.compose_service,
            &upgrade.tag,
            upgrade.height,
            pull_cfg.max_retries,
            pull_cfg.initial_backoff,
        )
        .await?;
        info!(current = %current_image, new = %new_image, "upgrade image found on the host");

        self.state_machine.must_set_status_and_step(
            upgrade_height,
            UpgradeStatus::Executing,
            UpgradeStep::ComposeFileUpgrade,
        );

        let running = self
            .compose
            .is_service_running(&self.cfg.compose_service, self.cfg.compose.down_timeout)
            .await
            .wrap_err("failed to check if the service is running")?;

        // the check races against a container exiting on its own, but at
        // this point the upgrade height has been hit so downing an already
        // exited container is safe
        if running {
            self.notifier
                .notify(
                    scope,
                    Level::Info,
                    &format!(
                        "shutting the node down to perform the upgrade; current image: \
                         {current_image}, new image: {new_image}",
                    ),
                )
                .await;
            self.compose
                .down(&self.cfg.compose_service, self.cfg.compose.down_timeout)
                .await
                .wrap_err("compose down failed")?;
        }

        info!("rewriting the service image version");
        self.compose
            .upgrade_image(&self.cfg.compose_service, &upgrade.tag)
            .await
            .wrap_err("failed to upgrade the image version")?;

        info!("executing compose up");
        self.compose
            .up(&self.cfg.compose_service, self.cfg.compose.up_deadline, &[])
            .await
            .wrap_err("compose up failed")?;

        self.notifier
            .notify(
                scope,
                Level::Info,
                &format!(
                    "container switched to {new_image}; waiting for post-upgrade checks to pass",
                ),
            )
            .await;
        Ok(())
    }

    /// Run the configured post-upgrade checks; any failure marks the
    /// upgrade FAILED.
    async fn post_upgrade_checks(
        &mut self,
        scope: CallScope,
        upgrade_height: i64,
        cancel: &CancellationToken,
    ) -> eyre::Result<()> {
        let result = self.post_upgrade_checks_inner(scope, upgrade_height, cancel).await;
        if result.is_err() {
            self.state_machine.must_set_status(upgrade_height, UpgradeStatus::Failed);
        }
        result
    }

    async fn post_upgrade_checks_inner(
        &mut self,
        scope: CallScope,
        upgrade_height: i64,
        cancel: &CancellationToken,
    ) -> eyre::Result<()> {
        let post_cfg = self.cfg.checks.post_upgrade.clone();
        let enabled = post_cfg.enabled_checks().wrap_err("invalid post-upgrade checks")?;

        let step = self.state_machine.step(upgrade_height);
        if !matches!(step, UpgradeStep::ComposeFileUpgrade | UpgradeStep::PostUpgradeCheck) {
            return Ok(());
        }

        if step == UpgradeStep::ComposeFileUpgrade {
            if enabled.is_empty() {
                self.notifier
                    .notify(scope, Level::Info, "no post-upgrade checks configured, skipping")
                    .await;
            } else {
                let names: Vec<&str> = enabled.iter().map(|check| check.as_str()).collect();
                self.notifier
                    .notify(
                        scope,
                        Level::Info,
                        &format!("running post-upgrade checks: {}", names.join(", ")),
                    )
                    .await;
            }
            self.state_machine.set_step(upgrade_height, UpgradeStep::PostUpgradeCheck);
        }

        if enabled.is_empty() {
            return Ok(());
        }

        if enabled.contains(&PostCheck::GrpcResponsive)
            && self.state_machine.post_check_status(upgrade_height, PostCheck::GrpcResponsive)
                != CheckStatus::Finished
        {
            let cfg = post_cfg
                .grpc_responsive
                .as_ref()
                .ok_or_else(|| eyre::eyre!("grpc-responsive check enabled but not configured"))?;
            self.state_machine.set_post_check_status(
                upgrade_height,
                PostCheck::GrpcResponsive,
                CheckStatus::Running,
            );
            self.notifier
                .notify(scope, Level::Info, "waiting for the api and cometbft endpoints to respond")
                .await;

            let result =
                checks::post::grpc_responsive(&self.client, cfg, &self.notifier, scope, cancel)
                    .await;
            self.state_machine.set_post_check_status(
                upgrade_height,
                PostCheck::GrpcResponsive,
                CheckStatus::Finished,
            );
            result.wrap_err("service responsiveness post-upgrade check failed")?;
        }

        if enabled.contains(&PostCheck::FirstBlockVoted)
            && self.state_machine.post_check_status(upgrade_height, PostCheck::FirstBlockVoted)
                != CheckStatus::Finished
        {
            let cfg = post_cfg
                .first_block_voted
                .as_ref()
                .ok_or_else(|| eyre::eyre!("first-block-voted check enabled but not configured"))?;
            self.state_machine.set_post_check_status(
                upgrade_height,
                PostCheck::FirstBlockVoted,
                CheckStatus::Running,
            );

            let result = checks::post::first_block_voted(
                &self.client,
                cfg,
                upgrade_height,
                &self.notifier,
                scope,
                cancel,
            )
            .await;
            self.state_machine.set_post_check_status(
                upgrade_height,
                PostCheck::FirstBlockVoted,
                CheckStatus::Finished,
            );
            result.wrap_err("first block signature post-upgrade check failed")?;
        }

        if enabled.contains(&PostCheck::ChainHeightIncreased)
            && self.state_machine.post_check_status(upgrade_height, PostCheck::ChainHeightIncreased)
                != CheckStatus::Finished
        {
            let cfg = post_cfg.chain_height_increased.as_ref().ok_or_else(|| {
                eyre::eyre!("chain-height-increased check enabled but not configured")
            })?;
            self.state_machine.set_post_check_status(
                upgrade_height,
                PostCheck::ChainHeightIncreased,
                CheckStatus::Running,
            );
            self.notifier
                .notify(
                    scope,
                    Level::Info,
                    &format!("waiting for the chain height to pass the upgrade height {upgrade_height}"),
                )
                .await;

            let result = checks::post::chain_height_increased(
                &self.client,
                cfg,
                upgrade_height,
                &self.notifier,
                scope,
                cancel,
            )
            .await;
            self.state_machine.set_post_check_status(
                upgrade_height,
                PostCheck::ChainHeightIncreased,
                CheckStatus::Finished,
            );
            result.wrap_err("height increase post-upgrade check failed")?;
        }

        Ok(())
    }

    /// Update the observed tip and the block-speed estimate (average of the
    /// last few inter-block deltas).
    fn update_height_and_block_speed(&mut self, new_height: i64) {
        let last_height = self.curr_height;
        let last_time = self.curr_height_time;
        self.curr_height = new_height;
        self.curr_height_time = Some(Instant::now());

        if let Some(last_time) = last_time {
            // polling can observe the same height twice
            if new_height != last_height && new_height > last_height {
                let per_block = last_time.elapsed() / (new_height - last_height) as u32;
                let slot = (new_height % BLOCK_SPEED_SAMPLES as i64) as usize;
                self.observed_block_speeds[slot] = per_block;
            }
        }

        let samples: Vec<Duration> = self
            .observed_block_speeds
            .iter()
            .copied()
            .filter(|sample| !sample.is_zero())
            .collect();
        if !samples.is_empty() {
            let total: Duration = samples.iter().sum();
            self.curr_block_speed = Some(total / samples.len() as u32);
        }

        self.publish_status();
    }

    fn publish_status(&self) {
        let mut status = self.status.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        status.current_height = self.curr_height;
        status.startup_height = self.startup_height;
        status.block_speed = self.curr_block_speed;
    }

    fn update_metrics(&self) {
        metrics::update_upgrade_gauges(
            &self.registry,
            &self.state_machine,
            &self.cfg.chain_id,
            &self.validator_address,
            self.curr_height,
        );
    }
}
