//! Pre-upgrade checks: everything that can be verified before the height.

use std::time::Duration;

use eyre::{WrapErr as _, bail};
use helmsman_compose::{ComposeClient, CredentialHelper};
use tracing::info;

/// Make sure the upgrade image is available on the host, pulling it when
/// necessary. Returns `(current_image, upgrade_image)`.
pub async fn pull_docker_image(
    compose: &ComposeClient,
    credential_helper: Option<&CredentialHelper>,
    service_name: &str,
    upgrade_tag: &str,
    upgrade_height: i64,
    max_retries: u32,
    initial_backoff: Duration,
) -> eyre::Result<(String, String)> {
    if upgrade_tag.is_empty() {
        bail!(
            "upgrade tag is empty for upgrade height {upgrade_height}; \
             register a version or set the tag on the upgrade"
        );
    }

    let (image, current_tag) = compose
        .service_image(service_name)
        .wrap_err_with(|| format!("failed to resolve the current image of {service_name}"))?;
    let current_image = format!("{image}:{current_tag}");
    let upgrade_image = format!("{image}:{upgrade_tag}");

    if helmsman_compose::is_image_present(&upgrade_image)
        .await
        .wrap_err_with(|| format!("failed to check if image {upgrade_image} is present"))?
    {
        info!(image = %upgrade_image, "upgrade image already present on the host");
        return Ok((current_image, upgrade_image));
    }

    let platform = compose
        .platform(service_name)
        .wrap_err("image is not present on the host and the platform could not be determined")?;

    if let Some(helper) = credential_helper {
        helper
            .login(&upgrade_image)
            .await
            .wrap_err("registry login through the credential helper failed")?;
    }

    helmsman_compose::pull_image_with_retry(
        &upgrade_image,
        platform.as_deref(),
        max_retries,
        initial_backoff,
    )
    .await
    .wrap_err_with(|| format!("image {upgrade_image} is not present on the host and pull failed"))?;

    Ok((current_image, upgrade_image))
}
