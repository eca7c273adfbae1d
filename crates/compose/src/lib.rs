//! Control over the node's docker compose service.
//!
//! Everything here shells out to the `docker` CLI rather than the engine
//! API: the compose plugin is the source of truth for service wiring, and a
//! single code path for both keeps behavior identical to what an operator
//! would type by hand. All invocations are deadline-bounded and the whole
//! process group is killed on expiry so a stuck CLI cannot wedge an upgrade.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

mod client;
mod compose_file;
mod docker;
pub mod runner;

pub use client::ComposeClient;
pub use compose_file::{ComposeFile, ServiceConfig, validate_halt_height_settings};
pub use docker::{CredentialHelper, is_image_present, parse_image_name, pull_image_with_retry};

#[derive(Debug, thiserror::Error)]
pub enum ComposeError {
    #[error("command `{command}` failed (timed out: {timed_out}): {stderr}")]
    Command {
        command: String,
        stderr: String,
        timed_out: bool,
    },
    #[error("could not spawn `{command}`")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("container is running")]
    ContainerRunning,
    #[error("container is not running")]
    ContainerNotRunning,
    #[error("service {0} not found in compose file")]
    ServiceNotFound(String),
    #[error("multiple containers found for service {service}: {ids:?}")]
    MultipleContainers { service: String, ids: Vec<String> },
    #[error("invalid image name: {0}")]
    InvalidImage(String),
    #[error("could not find VERSION_{service} in {path}")]
    VersionEntryNotFound { service: String, path: std::path::PathBuf },
    #[error("file contains {count} instances of `{needle}`, expected exactly one")]
    AmbiguousReplacement { needle: String, count: usize },
    #[error("could not access {path}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid compose file {path}")]
    Yaml {
        path: std::path::PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("{0}")]
    Invalid(String),
}
