//! Definitions to read and validate a helmsman configuration.
//!
//! The configuration is a single TOML document. Validation is total: every
//! numeric bound is rechecked, every selected provider requires its
//! configuration block, and every file path must be absolute and accessible
//! with the right mode bits before the daemon starts.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use helmsman_types::{PostCheck, PreCheck, ProviderKind};
use nix::unistd::AccessFlags;
use serde::{Deserialize, Serialize};

mod validate;

pub use validate::ConfigError;

/// Where the image version of the managed service lives.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpgradeMode {
    /// The tag is part of the `image:` line of the compose file itself.
    #[default]
    #[serde(rename = "compose-file")]
    ComposeFile,
    /// The tag lives in a `VERSION_<service>=` line of a separate env file
    /// interpolated by compose.
    #[serde(rename = "env-file")]
    EnvFile,
}

impl fmt::Display for UpgradeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpgradeMode::ComposeFile => f.write_str("compose-file"),
            UpgradeMode::EnvFile => f.write_str("env-file"),
        }
    }
}

/// Postgres `sslmode` values accepted for the database provider.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SslMode {
    Disable,
    Allow,
    #[default]
    Prefer,
    Require,
    VerifyCa,
    VerifyFull,
}

impl SslMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SslMode::Disable => "disable",
            SslMode::Allow => "allow",
            SslMode::Prefer => "prefer",
            SslMode::Require => "require",
            SslMode::VerifyCa => "verify-ca",
            SslMode::VerifyFull => "verify-full",
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Watchers {
    /// Poll interval for `upgrade-info.json`.
    #[serde(rename = "upgrade-info-interval", with = "duration_secs")]
    pub upgrade_info_interval: Duration,
    /// Poll interval for the chain tip. Zero selects the streaming
    /// (websocket) height watcher.
    #[serde(rename = "height-interval", with = "duration_secs", default)]
    pub height_interval: Duration,
    /// Stall detector for the streaming height watcher.
    #[serde(rename = "height-timeout", with = "duration_secs", default)]
    pub height_timeout: Duration,
    #[serde(rename = "upgrade-proposals-interval", with = "duration_secs")]
    pub upgrade_proposals_interval: Duration,
}

/// Connection parameters for the managed node.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Clients {
    pub host: String,
    /// The node's gRPC-gateway (API server) port.
    #[serde(rename = "grpc-port")]
    pub grpc_port: u16,
    #[serde(rename = "cometbft-port")]
    pub cometbft_port: u16,
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ComposeCli {
    #[serde(rename = "down-timeout", with = "duration_secs")]
    pub down_timeout: Duration,
    #[serde(rename = "up-deadline", with = "duration_secs")]
    pub up_deadline: Duration,
    /// Prefix for environment variables understood by the node binary, e.g.
    /// `GAIAD_`. Defaults to the node's application name when empty.
    #[serde(rename = "env-prefix", default)]
    pub env_prefix: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PullDockerImage {
    #[serde(rename = "max-retries", default = "default_pull_retries")]
    pub max_retries: u32,
    #[serde(
        rename = "initial-backoff",
        with = "duration_secs",
        default = "default_pull_backoff"
    )]
    pub initial_backoff: Duration,
}

fn default_pull_retries() -> u32 {
    3
}

fn default_pull_backoff() -> Duration {
    Duration::from_secs(10)
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SetHaltHeight {
    /// How many blocks before the upgrade height the halt-height restart is
    /// performed.
    #[serde(rename = "delay-blocks", default)]
    pub delay_blocks: i64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PreUpgrade {
    #[serde(default)]
    pub enabled: Vec<String>,
    /// Look-ahead window: pre-checks start when the upgrade height is within
    /// this many blocks of the tip.
    pub blocks: i64,
    #[serde(rename = "pull-docker-image", default)]
    pub pull_docker_image: PullDockerImage,
    #[serde(rename = "set-halt-height")]
    pub set_halt_height: Option<SetHaltHeight>,
}

impl PreUpgrade {
    pub fn enabled_checks(&self) -> Result<Vec<PreCheck>, ConfigError> {
        self.enabled
            .iter()
            .map(|name| {
                PreCheck::from_str(name).map_err(|_| {
                    ConfigError::invalid(format!(
                        "unknown value in checks.pre-upgrade.enabled: {name}"
                    ))
                })
            })
            .collect()
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GrpcResponsive {
    #[serde(rename = "poll-interval", with = "duration_secs")]
    pub poll_interval: Duration,
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChainHeightIncreased {
    #[serde(rename = "poll-interval", with = "duration_secs")]
    pub poll_interval: Duration,
    #[serde(rename = "notif-interval", with = "duration_secs")]
    pub notif_interval: Duration,
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FirstBlockVoted {
    #[serde(rename = "poll-interval", with = "duration_secs")]
    pub poll_interval: Duration,
    #[serde(rename = "notif-interval", with = "duration_secs")]
    pub notif_interval: Duration,
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PostUpgrade {
    #[serde(default)]
    pub enabled: Vec<String>,
    #[serde(rename = "grpc-responsive")]
    pub grpc_responsive: Option<GrpcResponsive>,
    #[serde(rename = "chain-height-increased")]
    pub chain_height_increased: Option<ChainHeightIncreased>,
    #[serde(rename = "first-block-voted")]
    pub first_block_voted: Option<FirstBlockVoted>,
}

impl PostUpgrade {
    pub fn enabled_checks(&self) -> Result<Vec<PostCheck>, ConfigError> {
        self.enabled
            .iter()
            .map(|name| {
                PostCheck::from_str(name).map_err(|_| {
                    ConfigError::invalid(format!(
                        "unknown value in checks.post-upgrade.enabled: {name}"
                    ))
                })
            })
            .collect()
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Checks {
    #[serde(rename = "pre-upgrade")]
    pub pre_upgrade: PreUpgrade,
    #[serde(rename = "post-upgrade")]
    pub post_upgrade: PostUpgrade,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChainProviderConfig {
    #[serde(rename = "default-priority")]
    pub default_priority: i32,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseProviderConfig {
    #[serde(rename = "default-priority")]
    pub default_priority: i32,
    pub host: String,
    pub port: u16,
    pub db: String,
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(rename = "password-file", default)]
    pub password_file: String,
    #[serde(rename = "ssl-mode", default)]
    pub ssl_mode: SslMode,
    #[serde(rename = "auto-migrate", default)]
    pub auto_migrate: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LocalProviderConfig {
    #[serde(rename = "default-priority")]
    pub default_priority: i32,
    #[serde(rename = "config-path")]
    pub config_path: PathBuf,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProviderConfigs {
    pub chain: Option<ChainProviderConfig>,
    pub database: Option<DatabaseProviderConfig>,
    pub local: Option<LocalProviderConfig>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VersionResolvers {
    pub providers: Vec<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StateMachineConfig {
    #[serde(default)]
    pub provider: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UpgradeRegistryConfig {
    /// Logical chain identifier; scopes every provider query.
    pub network: String,
    pub provider: ProviderConfigs,
    pub providers: Vec<String>,
    #[serde(rename = "version-resolvers")]
    pub version_resolvers: Option<VersionResolvers>,
    #[serde(rename = "state-machine", default)]
    pub state_machine: StateMachineConfig,
}

impl UpgradeRegistryConfig {
    /// Providers selected in `upgrade-registry.providers`, parsed.
    pub fn selected_providers(&self) -> Result<Vec<ProviderKind>, ConfigError> {
        self.providers
            .iter()
            .map(|name| {
                ProviderKind::from_str(name).map_err(|_| {
                    ConfigError::invalid(format!(
                        "unknown provider in upgrade-registry.providers: {name}"
                    ))
                })
            })
            .collect()
    }

    pub fn version_resolver_providers(&self) -> Result<Vec<ProviderKind>, ConfigError> {
        let Some(resolvers) = &self.version_resolvers else {
            return Ok(Vec::new());
        };
        resolvers
            .providers
            .iter()
            .map(|name| {
                ProviderKind::from_str(name).map_err(|_| {
                    ConfigError::invalid(format!(
                        "unknown provider in upgrade-registry.version-resolvers.providers: {name}"
                    ))
                })
            })
            .collect()
    }

    pub fn state_machine_provider(&self) -> Result<Option<ProviderKind>, ConfigError> {
        if self.state_machine.provider.is_empty() {
            return Ok(None);
        }
        ProviderKind::from_str(&self.state_machine.provider)
            .map(Some)
            .map_err(|_| {
                ConfigError::invalid(format!(
                    "unknown provider in upgrade-registry.state-machine.provider: {}",
                    self.state_machine.provider
                ))
            })
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SlackWebhookNotifier {
    /// Webhook URL, or an absolute path to a file containing it.
    #[serde(rename = "webhook-url")]
    pub webhook_url: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SlackBotNotifier {
    /// Bot token, or an absolute path to a file containing it.
    #[serde(rename = "auth-token")]
    pub auth_token: String,
    pub channel: String,
    /// Group the messages of one upgrade into a thread.
    #[serde(rename = "group-messages", default)]
    pub group_messages: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Slack {
    #[serde(rename = "webhook-notifier")]
    pub webhook_notifier: Option<SlackWebhookNotifier>,
    #[serde(rename = "bot-notifier")]
    pub bot_notifier: Option<SlackBotNotifier>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DockerCredentialHelper {
    /// Executable printing a registry auth token on stdout.
    pub command: PathBuf,
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
}

/// Root configuration document.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    #[serde(rename = "compose-file")]
    pub compose_file: PathBuf,
    #[serde(rename = "compose-service")]
    pub compose_service: String,
    #[serde(rename = "version-file", default)]
    pub version_file: PathBuf,
    #[serde(rename = "upgrade-mode")]
    pub upgrade_mode: UpgradeMode,
    #[serde(rename = "chain-home")]
    pub chain_home: PathBuf,
    /// -1 (trace) ..= 7 (off), matching the original operator convention.
    #[serde(rename = "log-level", default)]
    pub log_level: i8,
    pub host: String,
    #[serde(rename = "http-port")]
    pub http_port: u16,
    #[serde(rename = "chain-id")]
    pub chain_id: String,
    pub watchers: Watchers,
    pub clients: Clients,
    #[serde(rename = "compose-cli")]
    pub compose: ComposeCli,
    pub checks: Checks,
    pub slack: Option<Slack>,
    #[serde(rename = "docker-credential-helper")]
    pub credential_helper: Option<DockerCredentialHelper>,
    #[serde(rename = "upgrade-registry")]
    pub upgrade_registry: UpgradeRegistryConfig,
}

impl Config {
    /// Read a configuration document from disk. Validation is separate; call
    /// [`Config::validate`] before using the result.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source: Box::new(source),
        })
    }

    /// Path of the upgrade plan file written by the node.
    pub fn upgrade_info_file_path(&self) -> PathBuf {
        self.chain_home.join("data").join("upgrade-info.json")
    }

    /// Map the configured log level onto a tracing directive.
    pub fn tracing_directive(&self) -> &'static str {
        match self.log_level {
            -1 => "trace",
            0 => "debug",
            1 => "info",
            2 => "warn",
            3..=6 => "error",
            _ => "off",
        }
    }
}

/// Serialize [`Duration`] fields as integer seconds.
pub mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

pub(crate) fn check_access(path: &Path, flags: AccessFlags) -> Result<(), ConfigError> {
    nix::unistd::access(path, flags).map_err(|errno| {
        ConfigError::invalid(format!(
            "requested access {flags:?} not granted on {}: {errno}",
            path.display()
        ))
    })
}

#[cfg(test)]
mod tests;
