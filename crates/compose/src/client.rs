//! The compose client drives the managed service through `docker compose`.

use std::{
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use helmsman_config::UpgradeMode;
use tracing::{info, warn};

use crate::{
    ComposeError,
    compose_file::{ComposeFile, verify_compose_content},
    docker::parse_image_name,
    runner,
};

#[derive(Clone, Debug)]
pub struct ComposeClient {
    compose_file: PathBuf,
    version_file: PathBuf,
    upgrade_mode: UpgradeMode,
}

impl ComposeClient {
    pub fn new(
        compose_file: impl Into<PathBuf>,
        version_file: impl Into<PathBuf>,
        upgrade_mode: UpgradeMode,
    ) -> Self {
        Self {
            compose_file: compose_file.into(),
            version_file: version_file.into(),
            upgrade_mode,
        }
    }

    pub fn compose_file(&self) -> &Path {
        &self.compose_file
    }

    /// `docker compose version --short`, as a liveness probe for the plugin.
    pub async fn version(&self) -> Result<String, ComposeError> {
        let output =
            runner::check_output(Duration::from_secs(2), &[], "docker", &["compose", "version", "--short"])
                .await?;
        Ok(output.stdout.trim().to_owned())
    }

    /// The `(image, tag)` currently configured for a service.
    pub fn service_image(&self, service_name: &str) -> Result<(String, String), ComposeError> {
        let file = ComposeFile::load(&self.compose_file)?;
        let service = file.service(service_name)?;
        let (image, tag) = parse_image_name(&service.image)?;
        let tag = match self.upgrade_mode {
            UpgradeMode::ComposeFile => tag.to_owned(),
            // in env-file mode the compose tag is a placeholder; the env
            // file carries the real one
            UpgradeMode::EnvFile => load_service_version(&self.version_file, service_name)?,
        };
        Ok((image.to_owned(), tag))
    }

    pub fn platform(&self, service_name: &str) -> Result<Option<String>, ComposeError> {
        let file = ComposeFile::load(&self.compose_file)?;
        Ok(file.service(service_name)?.platform.clone())
    }

    /// Whether a container for the service exists in a live state.
    pub async fn is_service_running(
        &self,
        service_name: &str,
        timeout: Duration,
    ) -> Result<bool, ComposeError> {
        let Some(container_id) = self.container_id(service_name, timeout).await? else {
            return Ok(false);
        };

        let output = runner::check_output(
            timeout,
            &[],
            "docker",
            &["ps", "-q", "--no-trunc", "--filter", &format!("id={container_id}")],
        )
        .await?;
        Ok(!output.stdout.trim().is_empty())
    }

    /// The container id compose knows for the service, if any.
    pub async fn container_id(
        &self,
        service_name: &str,
        timeout: Duration,
    ) -> Result<Option<String>, ComposeError> {
        let compose_file = self.compose_file.to_string_lossy().into_owned();
        // +1s of wiggle room for the compose cli itself
        let output = runner::check_output(
            timeout + Duration::from_secs(1),
            &[],
            "docker",
            &[
                "compose", "-f", &compose_file, "ps", "-a", "-q",
                "--status", "restarting",
                "--status", "removing",
                "--status", "running",
                "--status", "created",
                service_name,
            ],
        )
        .await?;

        // one container id per line, 64 hex chars each
        let ids: Vec<String> = output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| line.len() == 64)
            .map(str::to_owned)
            .collect();

        match ids.len() {
            0 => Ok(None),
            1 => Ok(Some(ids.into_iter().next().unwrap())),
            _ => Err(ComposeError::MultipleContainers {
                service: service_name.to_owned(),
                ids,
            }),
        }
    }

    /// `docker compose down` with verification that the container is gone.
    pub async fn down(&self, service_name: &str, timeout: Duration) -> Result<(), ComposeError> {
        let compose_file = self.compose_file.to_string_lossy().into_owned();
        let timeout_secs = timeout.as_secs().max(1).to_string();
        // buffer for the docker -t timeout taking slightly longer than the
        // deadline itself
        let deadline = timeout + Duration::from_secs(5);

        runner::execute_and_log(
            deadline,
            &[],
            "docker",
            &["compose", "-f", &compose_file, "down", "--remove-orphans", "-t", &timeout_secs],
        )
        .await?;

        if self.is_service_running(service_name, timeout).await? {
            return Err(ComposeError::ContainerRunning);
        }
        Ok(())
    }

    /// `docker compose up -d --force-recreate`, optionally with ephemeral
    /// environment variables, verifying that the container came up.
    pub async fn up(
        &self,
        service_name: &str,
        deadline: Duration,
        ephemeral_env: &[(String, String)],
    ) -> Result<(), ComposeError> {
        if self.is_service_running(service_name, deadline).await? {
            return Err(ComposeError::ContainerRunning);
        }

        let compose_file = self.compose_file.to_string_lossy().into_owned();
        runner::execute_and_log(
            deadline,
            ephemeral_env,
            "docker",
            &["compose", "-f", &compose_file, "up", "-d", "--force-recreate"],
        )
        .await?;

        if !self.is_service_running(service_name, deadline).await? {
            return Err(ComposeError::ContainerNotRunning);
        }
        Ok(())
    }

    /// Bounce the service with `HALT_HEIGHT` exported so the node stops
    /// itself at the upgrade height.
    pub async fn restart_with_halt_height(
        &self,
        service_name: &str,
        down_timeout: Duration,
        up_deadline: Duration,
        halt_height: i64,
    ) -> Result<(), ComposeError> {
        if !self.is_service_running(service_name, down_timeout).await? {
            return Err(ComposeError::ContainerNotRunning);
        }
        // the running check races against a crashing container; downing an
        // already-exited container is harmless
        match self.down(service_name, down_timeout).await {
            Ok(()) | Err(ComposeError::ContainerNotRunning) => {}
            Err(err) => return Err(err),
        }
        self.up(
            service_name,
            up_deadline,
            &[("HALT_HEIGHT".to_owned(), halt_height.to_string())],
        )
        .await
    }

    /// Rewrite the service's image tag according to the upgrade mode.
    pub async fn upgrade_image(&self, service_name: &str, new_tag: &str) -> Result<(), ComposeError> {
        match self.upgrade_mode {
            UpgradeMode::EnvFile => self.upgrade_image_in_env_file(service_name, new_tag),
            UpgradeMode::ComposeFile => self.upgrade_image_in_compose_file(service_name, new_tag).await,
        }
    }

    fn upgrade_image_in_env_file(&self, service_name: &str, new_tag: &str) -> Result<(), ComposeError> {
        let old_tag = load_service_version(&self.version_file, service_name)?;
        info!(
            version_file = %self.version_file.display(),
            %old_tag,
            %new_tag,
            "updating service version",
        );
        update_version_file(&self.version_file, service_name, new_tag)
    }

    /// Textual single-occurrence substitution rather than a YAML re-dump, so
    /// the operator's formatting and comments survive the rewrite.
    async fn upgrade_image_in_compose_file(
        &self,
        service_name: &str,
        new_tag: &str,
    ) -> Result<(), ComposeError> {
        let file = ComposeFile::load(&self.compose_file)?;
        let current_image = file.service(service_name)?.image.clone();
        let (image, _) = parse_image_name(&current_image)?;
        let new_image = format!("{image}:{new_tag}");

        if current_image == new_image {
            warn!(image = %new_image, "image already registered in compose file");
            return Ok(());
        }

        if !crate::docker::is_image_present(&new_image).await? {
            return Err(ComposeError::Invalid(format!(
                "image {new_image} not present on the system"
            )));
        }

        let content = std::fs::read_to_string(&self.compose_file).map_err(|source| {
            ComposeError::Io { path: self.compose_file.clone(), source }
        })?;
        let count = content.matches(&current_image).count();
        if count != 1 {
            return Err(ComposeError::AmbiguousReplacement { needle: current_image, count });
        }
        let updated = content.replacen(&current_image, &new_image, 1);

        let base_dir = self.compose_file.parent().unwrap_or(Path::new("."));
        verify_compose_content(base_dir, &updated)?;

        // keep the previous revision around before swapping the new one in
        let epoch = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or_default();
        let backup = self.compose_file.with_extension(format!("{epoch}.helmsman.bkp"));
        std::fs::copy(&self.compose_file, &backup).map_err(|source| ComposeError::Io {
            path: backup.clone(),
            source,
        })?;

        atomic_write(&self.compose_file, updated.as_bytes())
    }
}

/// Write via a temp file in the same directory plus rename, so a crash in
/// the middle never leaves a torn file.
fn atomic_write(path: &Path, content: &[u8]) -> Result<(), ComposeError> {
    let dir = path.parent().unwrap_or(Path::new("."));
    let temp = tempfile::Builder::new()
        .prefix(".helmsman.")
        .tempfile_in(dir)
        .map_err(|source| ComposeError::Io { path: dir.to_owned(), source })?;
    std::fs::write(temp.path(), content).map_err(|source| ComposeError::Io {
        path: temp.path().to_owned(),
        source,
    })?;
    temp.persist(path)
        .map(|_| ())
        .map_err(|err| ComposeError::Io { path: path.to_owned(), source: err.error })
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ServiceVersionLine {
    pub name: String,
    pub version: String,
}

/// Parse the `VERSION_<service>=<tag>` lines of a version env file.
pub(crate) fn service_versions(path: &Path) -> Result<Vec<ServiceVersionLine>, ComposeError> {
    let content = std::fs::read_to_string(path).map_err(|source| ComposeError::Io {
        path: path.to_owned(),
        source,
    })?;

    let mut services = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let Some(name) = key.strip_prefix("VERSION_") else {
            continue;
        };
        services.push(ServiceVersionLine { name: name.to_owned(), version: value.to_owned() });
    }
    Ok(services)
}

pub(crate) fn load_service_version(path: &Path, service_name: &str) -> Result<String, ComposeError> {
    service_versions(path)?
        .into_iter()
        .find(|entry| entry.name == service_name)
        .map(|entry| entry.version)
        .ok_or_else(|| ComposeError::VersionEntryNotFound {
            service: service_name.to_owned(),
            path: path.to_owned(),
        })
}

fn update_version_file(path: &Path, service_name: &str, new_tag: &str) -> Result<(), ComposeError> {
    let mut services = service_versions(path)?;
    let mut found = false;
    for entry in &mut services {
        if entry.name == service_name {
            entry.version = new_tag.to_owned();
            found = true;
        }
    }
    if !found {
        return Err(ComposeError::VersionEntryNotFound {
            service: service_name.to_owned(),
            path: path.to_owned(),
        });
    }

    let content = services
        .iter()
        .map(|entry| format!("VERSION_{}={}", entry.name, entry.version))
        .collect::<Vec<_>>()
        .join("\n");
    atomic_write(path, content.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_file_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("versions.env");
        std::fs::write(&path, "# versions\nVERSION_node=v1\nVERSION_relayer=v9\n\n").unwrap();

        assert_eq!(load_service_version(&path, "node").unwrap(), "v1");
        assert_eq!(load_service_version(&path, "relayer").unwrap(), "v9");
        assert!(matches!(
            load_service_version(&path, "ghost"),
            Err(ComposeError::VersionEntryNotFound { .. })
        ));

        update_version_file(&path, "node", "v2").unwrap();
        assert_eq!(load_service_version(&path, "node").unwrap(), "v2");
        // the untouched service survives the rewrite
        assert_eq!(load_service_version(&path, "relayer").unwrap(), "v9");
    }

    #[test]
    fn service_image_reads_compose_tag() {
        let dir = tempfile::TempDir::new().unwrap();
        let compose = dir.path().join("docker-compose.yml");
        std::fs::write(&compose, "services:\n  node:\n    image: repo/node:v1\n").unwrap();

        let client = ComposeClient::new(&compose, dir.path().join("versions.env"), UpgradeMode::ComposeFile);
        assert_eq!(client.service_image("node").unwrap(), ("repo/node".to_owned(), "v1".to_owned()));
    }

    #[test]
    fn service_image_reads_env_file_tag_in_env_mode() {
        let dir = tempfile::TempDir::new().unwrap();
        let compose = dir.path().join("docker-compose.yml");
        std::fs::write(
            &compose,
            "services:\n  node:\n    image: repo/node:${VERSION_node}\n",
        )
        .unwrap();
        let versions = dir.path().join("versions.env");
        std::fs::write(&versions, "VERSION_node=v7\n").unwrap();

        let client = ComposeClient::new(&compose, &versions, UpgradeMode::EnvFile);
        assert_eq!(client.service_image("node").unwrap(), ("repo/node".to_owned(), "v7".to_owned()));
    }

    #[test]
    fn atomic_write_replaces_content() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("file.txt");
        std::fs::write(&path, "old").unwrap();
        atomic_write(&path, b"new").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "new");
    }
}
