//! Compose file model and validation.

use std::{collections::BTreeMap, path::Path};

use serde::Deserialize;

use crate::ComposeError;

/// The subset of the compose schema helmsman cares about.
#[derive(Clone, Debug, Deserialize)]
pub struct ComposeFile {
    pub services: BTreeMap<String, ServiceConfig>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub restart: Option<String>,
    #[serde(default)]
    pub environment: Environment,
}

/// Compose accepts the environment both as a map and as a `KEY=VALUE` list.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum Environment {
    Map(BTreeMap<String, Option<String>>),
    List(Vec<String>),
}

impl Default for Environment {
    fn default() -> Self {
        Environment::List(Vec::new())
    }
}

impl Environment {
    pub fn contains_key(&self, key: &str) -> bool {
        match self {
            Environment::Map(map) => map.contains_key(key),
            Environment::List(entries) => entries.iter().any(|entry| {
                entry.split_once('=').map(|(k, _)| k).unwrap_or(entry.as_str()) == key
            }),
        }
    }
}

impl ComposeFile {
    /// Parse and sanity-check a compose file: it must define at least one
    /// service and every service must name an image.
    pub fn load(path: &Path) -> Result<Self, ComposeError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ComposeError::Io {
            path: path.to_owned(),
            source,
        })?;
        let file: ComposeFile = serde_yaml::from_str(&raw).map_err(|source| ComposeError::Yaml {
            path: path.to_owned(),
            source,
        })?;

        if file.services.is_empty() {
            return Err(ComposeError::Invalid(format!(
                "no services found in compose file {}",
                path.display()
            )));
        }
        for (name, service) in &file.services {
            if service.image.is_empty() {
                return Err(ComposeError::Invalid(format!(
                    "service {name} has no image defined"
                )));
            }
        }

        Ok(file)
    }

    pub fn service(&self, name: &str) -> Result<&ServiceConfig, ComposeError> {
        self.services.get(name).ok_or_else(|| ComposeError::ServiceNotFound(name.to_owned()))
    }
}

/// Requirements for the `SET_HALT_HEIGHT` pre-check: the service must pass
/// `<PREFIX>HALT_HEIGHT` through to the node and must not auto-restart, or
/// the halted container would immediately come back up.
pub fn validate_halt_height_settings(
    compose_file: &Path,
    service_name: &str,
    env_prefix: &str,
) -> Result<(), ComposeError> {
    let file = ComposeFile::load(compose_file)?;
    let service = file.service(service_name)?;

    let halt_key = format!("{env_prefix}HALT_HEIGHT");
    if !service.environment.contains_key(&halt_key) {
        return Err(ComposeError::Invalid(format!(
            "please add '{halt_key}=${{HALT_HEIGHT}}' to services.{service_name}.environment"
        )));
    }

    match service.restart.as_deref() {
        None | Some("no") | Some("") => Ok(()),
        Some(policy) => Err(ComposeError::Invalid(format!(
            "the SET_HALT_HEIGHT pre-check will not work with restart policy {policy:?}, \
             please remove it"
        ))),
    }
}

/// Check that a compose document parses, used after a textual image rewrite
/// before the original file is replaced.
pub(crate) fn verify_compose_content(base_dir: &Path, content: &str) -> Result<(), ComposeError> {
    // written next to the original so any relative env_file references in
    // the document still resolve
    let file = tempfile::Builder::new()
        .prefix("docker-compose-upgraded.")
        .suffix(".helmsman")
        .tempfile_in(base_dir)
        .map_err(|source| ComposeError::Io { path: base_dir.to_owned(), source })?;
    std::fs::write(file.path(), content).map_err(|source| ComposeError::Io {
        path: file.path().to_owned(),
        source,
    })?;
    ComposeFile::load(file.path()).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &tempfile::TempDir, content: &str) -> std::path::PathBuf {
        let path = dir.path().join("docker-compose.yml");
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn loads_services_with_map_environment() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = write(
            &dir,
            "services:\n  node:\n    image: repo/node:v1\n    environment:\n      GAIAD_HALT_HEIGHT: ${HALT_HEIGHT}\n",
        );
        let file = ComposeFile::load(&path).unwrap();
        let service = file.service("node").unwrap();
        assert_eq!(service.image, "repo/node:v1");
        assert!(service.environment.contains_key("GAIAD_HALT_HEIGHT"));
    }

    #[test]
    fn loads_services_with_list_environment() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = write(
            &dir,
            "services:\n  node:\n    image: repo/node:v1\n    environment:\n      - GAIAD_HALT_HEIGHT=${HALT_HEIGHT}\n",
        );
        let file = ComposeFile::load(&path).unwrap();
        assert!(file.service("node").unwrap().environment.contains_key("GAIAD_HALT_HEIGHT"));
    }

    #[test]
    fn rejects_service_without_image() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = write(&dir, "services:\n  node:\n    restart: always\n");
        assert!(matches!(ComposeFile::load(&path), Err(ComposeError::Invalid(_))));
    }

    #[test]
    fn halt_height_requires_env_passthrough_and_no_restart() {
        let dir = tempfile::TempDir::new().unwrap();

        let path = write(
            &dir,
            "services:\n  node:\n    image: repo/node:v1\n    environment:\n      - GAIAD_HALT_HEIGHT=${HALT_HEIGHT}\n",
        );
        validate_halt_height_settings(&path, "node", "GAIAD_").unwrap();

        let path = write(&dir, "services:\n  node:\n    image: repo/node:v1\n");
        assert!(validate_halt_height_settings(&path, "node", "GAIAD_").is_err());

        let path = write(
            &dir,
            "services:\n  node:\n    image: repo/node:v1\n    restart: always\n    environment:\n      - GAIAD_HALT_HEIGHT=${HALT_HEIGHT}\n",
        );
        assert!(validate_halt_height_settings(&path, "node", "GAIAD_").is_err());
    }
}
