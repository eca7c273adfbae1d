use std::{fs, path::Path};

use tempfile::TempDir;

use crate::{Config, UpgradeMode};

fn write_sample_config(dir: &Path) -> String {
    let compose_file = dir.join("docker-compose.yml");
    fs::write(&compose_file, "services:\n  node:\n    image: repo/node:v1\n").unwrap();
    let version_file = dir.join("versions.env");
    fs::write(&version_file, "VERSION_node=v1\n").unwrap();
    let chain_home = dir.join("home");
    fs::create_dir_all(chain_home.join("data")).unwrap();
    let local_state = dir.join("local.json");

    format!(
        r#"
compose-file = "{compose_file}"
compose-service = "node"
version-file = "{version_file}"
upgrade-mode = "compose-file"
chain-home = "{chain_home}"
log-level = 1
host = "0.0.0.0"
http-port = 8080
chain-id = "testnet-1"

[watchers]
upgrade-info-interval = 1
height-interval = 2
height-timeout = 30
upgrade-proposals-interval = 300

[clients]
host = "127.0.0.1"
grpc-port = 1317
cometbft-port = 26657
timeout = 10

[compose-cli]
down-timeout = 60
up-deadline = 60
env-prefix = "GAIAD_"

[checks.pre-upgrade]
enabled = ["PULL_DOCKER_IMAGE", "SET_HALT_HEIGHT"]
blocks = 200

[checks.pre-upgrade.set-halt-height]
delay-blocks = 10

[checks.post-upgrade]
enabled = ["GRPC_RESPONSIVE", "CHAIN_HEIGHT_INCREASED", "FIRST_BLOCK_VOTED"]

[checks.post-upgrade.grpc-responsive]
poll-interval = 1
timeout = 300

[checks.post-upgrade.chain-height-increased]
poll-interval = 1
notif-interval = 60
timeout = 300

[checks.post-upgrade.first-block-voted]
poll-interval = 1
notif-interval = 60
timeout = 300

[upgrade-registry]
network = "testnet-1"
providers = ["LOCAL"]

[upgrade-registry.provider.local]
default-priority = 1
config-path = "{local_state}"

[upgrade-registry.version-resolvers]
providers = ["LOCAL"]

[upgrade-registry.state-machine]
provider = "LOCAL"
"#,
        compose_file = compose_file.display(),
        version_file = version_file.display(),
        chain_home = chain_home.display(),
        local_state = local_state.display(),
    )
}

fn load_sample(dir: &Path) -> Config {
    let path = dir.join("helmsman.toml");
    fs::write(&path, write_sample_config(dir)).unwrap();
    Config::load(&path).unwrap()
}

#[test]
fn sample_config_is_valid() {
    let dir = TempDir::new().unwrap();
    let mut config = load_sample(dir.path());
    config.validate().unwrap();

    assert_eq!(config.upgrade_mode, UpgradeMode::ComposeFile);
    assert_eq!(config.compose.env_prefix, "GAIAD_");
    assert_eq!(
        config.upgrade_info_file_path(),
        dir.path().join("home").join("data").join("upgrade-info.json"),
    );
    assert_eq!(config.tracing_directive(), "info");
}

#[test]
fn rejects_missing_provider_block() {
    let dir = TempDir::new().unwrap();
    let mut config = load_sample(dir.path());
    config.upgrade_registry.providers = vec!["DATABASE".to_owned()];
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("provider.database"), "{err}");
}

#[test]
fn rejects_priority_out_of_bounds() {
    let dir = TempDir::new().unwrap();
    let mut config = load_sample(dir.path());
    config.upgrade_registry.provider.local.as_mut().unwrap().default_priority = 100;
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("between 1 and 99"), "{err}");
}

#[test]
fn rejects_short_compose_timeouts() {
    let dir = TempDir::new().unwrap();
    let mut config = load_sample(dir.path());
    config.compose.down_timeout = std::time::Duration::from_secs(5);
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("down-timeout"), "{err}");
}

#[test]
fn streaming_mode_requires_height_timeout() {
    let dir = TempDir::new().unwrap();
    let mut config = load_sample(dir.path());
    config.watchers.height_interval = std::time::Duration::ZERO;
    config.watchers.height_timeout = std::time::Duration::ZERO;
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("height-timeout"), "{err}");
}

#[test]
fn chain_cannot_resolve_versions() {
    let dir = TempDir::new().unwrap();
    let mut config = load_sample(dir.path());
    config.upgrade_registry.version_resolvers.as_mut().unwrap().providers =
        vec!["CHAIN".to_owned()];
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("cannot resolve versions"), "{err}");
}

#[test]
fn halt_height_delay_must_fit_in_window() {
    let dir = TempDir::new().unwrap();
    let mut config = load_sample(dir.path());
    config.checks.pre_upgrade.set_halt_height.as_mut().unwrap().delay_blocks = 200;
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("delay-blocks"), "{err}");
}
