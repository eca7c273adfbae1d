//! Total validation of the configuration document.

use std::{io, path::Path, time::Duration};

use helmsman_types::{PostCheck, PreCheck, ProviderKind};
use nix::unistd::AccessFlags;

use crate::{Config, UpgradeMode, check_access};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not read config file {path}")]
    Read {
        path: std::path::PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("could not decode config file {path}")]
    Parse {
        path: std::path::PathBuf,
        #[source]
        source: Box<toml::de::Error>,
    },
    #[error("{0}")]
    Invalid(String),
}

impl ConfigError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        ConfigError::Invalid(message.into())
    }
}

const MIN_COMPOSE_TIMEOUT: Duration = Duration::from_secs(10);

fn validate_file(path: &Path, flags: AccessFlags) -> Result<(), ConfigError> {
    if !path.is_absolute() {
        return Err(ConfigError::invalid(format!(
            "{} must be an absolute path",
            path.display()
        )));
    }
    let meta = std::fs::metadata(path).map_err(|err| {
        ConfigError::invalid(format!("could not stat file {}: {err}", path.display()))
    })?;
    if meta.is_dir() {
        return Err(ConfigError::invalid(format!(
            "the path {} already exists but is not a file",
            path.display()
        )));
    }
    check_access(path, flags)
}

fn validate_dir(path: &Path, flags: AccessFlags) -> Result<(), ConfigError> {
    if !path.is_absolute() {
        return Err(ConfigError::invalid(format!(
            "{} must be an absolute path",
            path.display()
        )));
    }
    let meta = std::fs::metadata(path).map_err(|err| {
        ConfigError::invalid(format!("could not stat directory {}: {err}", path.display()))
    })?;
    if !meta.is_dir() {
        return Err(ConfigError::invalid(format!(
            "the path {} already exists but is not a directory",
            path.display()
        )));
    }
    check_access(path, flags)
}

/// Read a secret either inline or, when the value is an absolute path, from
/// the named file.
fn load_secret(value: &str, what: &str) -> Result<String, ConfigError> {
    if !value.starts_with('/') {
        return Ok(value.to_owned());
    }
    let contents = std::fs::read_to_string(value)
        .map_err(|err| ConfigError::invalid(format!("failed reading {what} file {value}: {err}")))?;
    Ok(contents.trim().to_owned())
}

impl Config {
    /// Validate everything and resolve file-based secrets in place. A daemon
    /// must not start with a configuration this method rejected.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        self.validate_compose_file()?;

        if self.compose_service.is_empty() {
            return Err(ConfigError::invalid("compose-service cannot be empty"));
        }

        if self.upgrade_mode == UpgradeMode::EnvFile {
            self.validate_version_file()?;
        }

        self.validate_chain_home()?;

        if self.chain_id.is_empty() {
            return Err(ConfigError::invalid("chain-id cannot be empty"));
        }

        if !(-1..=7).contains(&self.log_level) {
            return Err(ConfigError::invalid("log-level must be between -1 and 7"));
        }

        if self.host.is_empty() {
            return Err(ConfigError::invalid("host cannot be empty"));
        }
        if self.http_port == 0 {
            return Err(ConfigError::invalid("http-port cannot be 0"));
        }

        self.validate_watchers()?;
        self.validate_clients()?;

        if self.compose.down_timeout < MIN_COMPOSE_TIMEOUT {
            return Err(ConfigError::invalid(
                "compose-cli.down-timeout cannot be less than 10s",
            ));
        }
        if self.compose.up_deadline < MIN_COMPOSE_TIMEOUT {
            return Err(ConfigError::invalid(
                "compose-cli.up-deadline cannot be less than 10s",
            ));
        }

        self.validate_pre_upgrade_checks()?;
        self.validate_post_upgrade_checks()?;
        self.validate_slack()?;

        if let Some(helper) = &self.credential_helper {
            validate_file(&helper.command, AccessFlags::R_OK | AccessFlags::X_OK)?;
            if helper.timeout.is_zero() {
                return Err(ConfigError::invalid(
                    "docker-credential-helper.timeout cannot be 0",
                ));
            }
        }

        self.validate_registry()?;

        Ok(())
    }

    fn validate_compose_file(&self) -> Result<(), ConfigError> {
        let rw = AccessFlags::R_OK | AccessFlags::W_OK;
        validate_file(&self.compose_file, rw)?;
        if let Some(parent) = self.compose_file.parent() {
            validate_dir(parent, rw)?;
        }
        Ok(())
    }

    fn validate_version_file(&self) -> Result<(), ConfigError> {
        let rw = AccessFlags::R_OK | AccessFlags::W_OK;
        validate_file(&self.version_file, rw)?;
        if let Some(parent) = self.version_file.parent() {
            validate_dir(parent, rw)?;
        }
        Ok(())
    }

    fn validate_chain_home(&self) -> Result<(), ConfigError> {
        validate_dir(&self.chain_home, AccessFlags::R_OK | AccessFlags::W_OK)?;

        // The upgrade plan file may not exist yet; in that case the data
        // directory itself must at least be readable.
        let plan = self.upgrade_info_file_path();
        if plan.exists() {
            validate_file(&plan, AccessFlags::R_OK)
        } else {
            validate_dir(&self.chain_home.join("data"), AccessFlags::R_OK)
        }
    }

    fn validate_watchers(&self) -> Result<(), ConfigError> {
        if self.watchers.upgrade_info_interval.is_zero() {
            return Err(ConfigError::invalid(
                "watchers.upgrade-info-interval cannot be 0",
            ));
        }
        if self.watchers.height_interval.is_zero() && self.watchers.height_timeout.is_zero() {
            return Err(ConfigError::invalid(
                "watchers.height-timeout cannot be 0 when using websocket subscriptions",
            ));
        }
        if self.watchers.upgrade_proposals_interval.is_zero() {
            return Err(ConfigError::invalid(
                "watchers.upgrade-proposals-interval cannot be 0",
            ));
        }
        Ok(())
    }

    fn validate_clients(&self) -> Result<(), ConfigError> {
        if self.clients.host.is_empty() {
            return Err(ConfigError::invalid("clients.host cannot be empty"));
        }
        if self.clients.grpc_port == 0 {
            return Err(ConfigError::invalid("clients.grpc-port cannot be 0"));
        }
        if self.clients.cometbft_port == 0 {
            return Err(ConfigError::invalid("clients.cometbft-port cannot be 0"));
        }
        if self.clients.timeout.is_zero() {
            return Err(ConfigError::invalid("clients.timeout cannot be 0"));
        }
        Ok(())
    }

    fn validate_pre_upgrade_checks(&self) -> Result<(), ConfigError> {
        let pre = &self.checks.pre_upgrade;
        if pre.blocks <= 0 {
            return Err(ConfigError::invalid(
                "checks.pre-upgrade.blocks must be greater than 0",
            ));
        }
        for check in pre.enabled_checks()? {
            if check == PreCheck::SetHaltHeight {
                let halt = pre.set_halt_height.as_ref().ok_or_else(|| {
                    ConfigError::invalid("checks.pre-upgrade.set-halt-height cannot be empty")
                })?;
                if halt.delay_blocks < 0 {
                    return Err(ConfigError::invalid(
                        "checks.pre-upgrade.set-halt-height.delay-blocks cannot be negative",
                    ));
                }
                if halt.delay_blocks >= pre.blocks {
                    return Err(ConfigError::invalid(
                        "checks.pre-upgrade.set-halt-height.delay-blocks must be smaller than checks.pre-upgrade.blocks",
                    ));
                }
            }
        }
        Ok(())
    }

    fn validate_post_upgrade_checks(&self) -> Result<(), ConfigError> {
        let post = &self.checks.post_upgrade;
        for check in post.enabled_checks()? {
            match check {
                PostCheck::GrpcResponsive => {
                    let cfg = post.grpc_responsive.as_ref().ok_or_else(|| {
                        ConfigError::invalid("checks.post-upgrade.grpc-responsive cannot be empty")
                    })?;
                    require_positive(cfg.poll_interval, "checks.post-upgrade.grpc-responsive.poll-interval")?;
                    require_positive(cfg.timeout, "checks.post-upgrade.grpc-responsive.timeout")?;
                }
                PostCheck::ChainHeightIncreased => {
                    let cfg = post.chain_height_increased.as_ref().ok_or_else(|| {
                        ConfigError::invalid(
                            "checks.post-upgrade.chain-height-increased cannot be empty",
                        )
                    })?;
                    require_positive(
                        cfg.poll_interval,
                        "checks.post-upgrade.chain-height-increased.poll-interval",
                    )?;
                    require_positive(
                        cfg.notif_interval,
                        "checks.post-upgrade.chain-height-increased.notif-interval",
                    )?;
                    require_positive(cfg.timeout, "checks.post-upgrade.chain-height-increased.timeout")?;
                }
                PostCheck::FirstBlockVoted => {
                    let cfg = post.first_block_voted.as_ref().ok_or_else(|| {
                        ConfigError::invalid("checks.post-upgrade.first-block-voted cannot be empty")
                    })?;
                    require_positive(
                        cfg.poll_interval,
                        "checks.post-upgrade.first-block-voted.poll-interval",
                    )?;
                    require_positive(
                        cfg.notif_interval,
                        "checks.post-upgrade.first-block-voted.notif-interval",
                    )?;
                    require_positive(cfg.timeout, "checks.post-upgrade.first-block-voted.timeout")?;
                }
            }
        }
        Ok(())
    }

    fn validate_slack(&mut self) -> Result<(), ConfigError> {
        let Some(slack) = &mut self.slack else {
            return Ok(());
        };
        if slack.webhook_notifier.is_some() && slack.bot_notifier.is_some() {
            return Err(ConfigError::invalid(
                "there can only be one slack notifier, pick either the webhook or the bot notifier",
            ));
        }
        if let Some(webhook) = &mut slack.webhook_notifier {
            if webhook.webhook_url.is_empty() {
                return Err(ConfigError::invalid(
                    "slack.webhook-notifier.webhook-url cannot be empty",
                ));
            }
            webhook.webhook_url = load_secret(&webhook.webhook_url, "webhook-url")?;
        }
        if let Some(bot) = &mut slack.bot_notifier {
            if bot.auth_token.is_empty() {
                return Err(ConfigError::invalid(
                    "slack.bot-notifier.auth-token cannot be empty",
                ));
            }
            if bot.channel.is_empty() {
                return Err(ConfigError::invalid("slack.bot-notifier.channel cannot be empty"));
            }
            bot.auth_token = load_secret(&bot.auth_token, "auth-token")?;
        }
        Ok(())
    }

    fn validate_registry(&mut self) -> Result<(), ConfigError> {
        let registry = &mut self.upgrade_registry;

        if registry.network.is_empty() {
            return Err(ConfigError::invalid("upgrade-registry.network cannot be empty"));
        }
        if registry.providers.is_empty() {
            return Err(ConfigError::invalid("upgrade-registry.providers cannot be empty"));
        }

        let selected = registry.selected_providers()?;
        for kind in &selected {
            require_provider_config(registry, *kind, "upgrade-registry.providers")?;
        }

        if let Some(chain) = &registry.provider.chain {
            require_priority(chain.default_priority, "upgrade-registry.provider.chain")?;
        }

        if let Some(database) = &mut registry.provider.database {
            require_priority(database.default_priority, "upgrade-registry.provider.database")?;
            if database.host.is_empty() {
                return Err(ConfigError::invalid(
                    "upgrade-registry.provider.database.host cannot be empty",
                ));
            }
            if database.port == 0 {
                return Err(ConfigError::invalid(
                    "upgrade-registry.provider.database.port cannot be 0",
                ));
            }
            if database.db.is_empty() {
                return Err(ConfigError::invalid(
                    "upgrade-registry.provider.database.db cannot be empty",
                ));
            }
            if database.user.is_empty() {
                return Err(ConfigError::invalid(
                    "upgrade-registry.provider.database.user cannot be empty",
                ));
            }
            if !database.password_file.is_empty() {
                validate_file(Path::new(&database.password_file), AccessFlags::R_OK)?;
                database.password = load_secret(&database.password_file, "database password")?;
            } else if database.password.is_empty() {
                return Err(ConfigError::invalid(
                    "upgrade-registry.provider.database.password cannot be empty",
                ));
            }
        }

        if let Some(local) = &registry.provider.local {
            require_priority(local.default_priority, "upgrade-registry.provider.local")?;
            if local.config_path.as_os_str().is_empty() {
                return Err(ConfigError::invalid(
                    "upgrade-registry.provider.local.config-path cannot be empty",
                ));
            }
        }

        let resolvers = registry.version_resolver_providers()?;
        if registry.version_resolvers.is_some() && resolvers.is_empty() {
            return Err(ConfigError::invalid(
                "upgrade-registry.version-resolvers.providers cannot be empty",
            ));
        }
        for kind in &resolvers {
            if *kind == ProviderKind::Chain {
                return Err(ConfigError::invalid(
                    "the chain provider cannot resolve versions",
                ));
            }
            require_provider_config(registry, *kind, "upgrade-registry.version-resolvers.providers")?;
        }

        if let Some(kind) = registry.state_machine_provider()? {
            if kind != ProviderKind::Local {
                return Err(ConfigError::invalid(
                    "upgrade-registry.state-machine.provider only supports LOCAL",
                ));
            }
            require_provider_config(registry, kind, "upgrade-registry.state-machine.provider")?;
        }

        Ok(())
    }
}

fn require_positive(value: Duration, key: &str) -> Result<(), ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::invalid(format!("{key} cannot be 0")));
    }
    Ok(())
}

fn require_priority(priority: i32, key: &str) -> Result<(), ConfigError> {
    if !(1..=99).contains(&priority) {
        return Err(ConfigError::invalid(format!(
            "{key}.default-priority must be between 1 and 99"
        )));
    }
    Ok(())
}

fn require_provider_config(
    registry: &crate::UpgradeRegistryConfig,
    kind: ProviderKind,
    key: &str,
) -> Result<(), ConfigError> {
    let configured = match kind {
        ProviderKind::Chain => registry.provider.chain.is_some(),
        ProviderKind::Database => registry.provider.database.is_some(),
        ProviderKind::Local => registry.provider.local.is_some(),
    };
    if !configured {
        return Err(ConfigError::invalid(format!(
            "error validating {key}: upgrade-registry.provider.{} cannot be empty",
            kind.as_str().to_ascii_lowercase()
        )));
    }
    Ok(())
}
