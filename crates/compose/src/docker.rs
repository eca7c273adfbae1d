//! Docker image helpers: presence checks, pulls with retry, registry login
//! through an external credential helper.

use std::time::Duration;

use helmsman_config::DockerCredentialHelper;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::{ComposeError, runner};

const INSPECT_DEADLINE: Duration = Duration::from_secs(10);
const PULL_DEADLINE: Duration = Duration::from_secs(600);

/// Split `repo/image:tag` into `(repo/image, tag)`.
pub fn parse_image_name(image: &str) -> Result<(&str, &str), ComposeError> {
    let mut parts = image.split(':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(name), Some(tag), None) if !name.is_empty() && !tag.is_empty() => Ok((name, tag)),
        _ => Err(ComposeError::InvalidImage(image.to_owned())),
    }
}

/// Does the image exist in the local daemon's store?
pub async fn is_image_present(image: &str) -> Result<bool, ComposeError> {
    match runner::check_output(INSPECT_DEADLINE, &[], "docker", &["image", "inspect", image]).await
    {
        Ok(_) => Ok(true),
        Err(ComposeError::Command { timed_out: false, .. }) => Ok(false),
        Err(err) => Err(err),
    }
}

/// Pull an image, retrying with exponential backoff.
pub async fn pull_image_with_retry(
    image: &str,
    platform: Option<&str>,
    max_retries: u32,
    initial_backoff: Duration,
) -> Result<(), ComposeError> {
    let mut backoff = initial_backoff;
    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            debug!(image, attempt, ?backoff, "retrying image pull");
            tokio::time::sleep(backoff).await;
            backoff *= 2;
        }

        match pull_image(image, platform).await {
            Ok(()) => return Ok(()),
            Err(err) => {
                warn!(image, attempt, error = %err, "image pull failed");
                last_err = Some(err);
            }
        }
    }

    Err(last_err.unwrap_or_else(|| ComposeError::Invalid(format!("pull of {image} failed"))))
}

async fn pull_image(image: &str, platform: Option<&str>) -> Result<(), ComposeError> {
    let mut args = vec!["pull"];
    if let Some(platform) = platform {
        args.push("--platform");
        args.push(platform);
    }
    args.push(image);
    runner::execute_and_log(PULL_DEADLINE, &[], "docker", &args).await
}

/// Credentials produced by a docker credential helper.
#[derive(Debug, Deserialize)]
struct HelperCredentials {
    #[serde(rename = "Username")]
    username: String,
    #[serde(rename = "Secret")]
    secret: String,
}

/// Wrapper around an external credential-helper executable.
///
/// The helper prints `{"Username": ..., "Secret": ...}` on stdout; the
/// credentials are fed to `docker login` so a subsequent pull can reach the
/// private registry.
#[derive(Clone, Debug)]
pub struct CredentialHelper {
    command: std::path::PathBuf,
    timeout: Duration,
}

impl CredentialHelper {
    pub fn new(cfg: &DockerCredentialHelper) -> Self {
        Self { command: cfg.command.clone(), timeout: cfg.timeout }
    }

    /// Refresh the daemon's registry session for the image's registry.
    pub async fn login(&self, image: &str) -> Result<(), ComposeError> {
        let command = self.command.to_string_lossy().into_owned();
        let output = runner::check_output(self.timeout, &[], &command, &[]).await?;

        let credentials: HelperCredentials =
            serde_json::from_str(output.stdout.trim()).map_err(|err| {
                ComposeError::Invalid(format!("credential helper output is invalid: {err}"))
            })?;

        let registry = registry_host(image);
        let mut args = vec!["login", "--username", credentials.username.as_str(), "--password-stdin"];
        if let Some(registry) = &registry {
            args.push(registry);
        }
        runner::check_output_with_stdin(
            self.timeout,
            &[],
            "docker",
            &args,
            Some(credentials.secret.as_bytes()),
        )
        .await
        .map(|_| ())
    }
}

/// The registry component of an image reference, when it names one
/// explicitly (a dot or port in the first path segment).
fn registry_host(image: &str) -> Option<String> {
    let first = image.split('/').next()?;
    if first.contains('.') || first.contains(':') {
        Some(first.to_owned())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_image_names() {
        assert_eq!(parse_image_name("repo/node:v1").unwrap(), ("repo/node", "v1"));
        assert_eq!(
            parse_image_name("ghcr.io/org/node:v2.0.0").unwrap(),
            ("ghcr.io/org/node", "v2.0.0"),
        );
        assert!(parse_image_name("repo/node").is_err());
        assert!(parse_image_name("repo/node:").is_err());
    }

    #[test]
    fn registry_host_is_only_explicit_hosts() {
        assert_eq!(registry_host("ghcr.io/org/node:v1"), Some("ghcr.io".to_owned()));
        assert_eq!(registry_host("localhost:5000/node:v1"), Some("localhost:5000".to_owned()));
        assert_eq!(registry_host("org/node:v1"), None);
    }
}
