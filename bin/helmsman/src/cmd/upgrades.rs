use clap::{Args, Subcommand};
use helmsman_types::{ProviderKind, UpgradeStatus, UpgradeType};

use crate::cmd::DaemonEndpoint;

#[derive(Args, Debug)]
pub struct UpgradesArgs {
    #[command(subcommand)]
    cmd: UpgradesSubcommand,
}

#[derive(Subcommand, Debug)]
enum UpgradesSubcommand {
    /// List upgrades known to the daemon, newest first.
    List(ListArgs),
    /// Register a new upgrade with one of the mutable providers.
    Register(RegisterArgs),
    /// Cancel an upgrade.
    Cancel(CancelArgs),
    /// Force the daemon to refresh all providers right now.
    ForceSync(ForceSyncArgs),
}

impl UpgradesArgs {
    pub async fn run(self) -> eyre::Result<()> {
        match self.cmd {
            UpgradesSubcommand::List(cmd) => cmd.run().await,
            UpgradesSubcommand::Register(cmd) => cmd.run().await,
            UpgradesSubcommand::Cancel(cmd) => cmd.run().await,
            UpgradesSubcommand::ForceSync(cmd) => cmd.run().await,
        }
    }
}

#[derive(Args, Debug)]
struct ListArgs {
    #[command(flatten)]
    endpoint: DaemonEndpoint,

    /// Bypass the daemon's cache and query the providers directly.
    #[arg(long)]
    disable_cache: bool,

    /// Only show the upgrade at this height.
    #[arg(long)]
    height: Option<i64>,

    /// Only show upgrades with one of these statuses.
    #[arg(long, value_delimiter = ',')]
    status: Vec<UpgradeStatus>,

    /// Show at most this many upgrades.
    #[arg(long)]
    limit: Option<usize>,
}

impl ListArgs {
    async fn run(self) -> eyre::Result<()> {
        let mut path = format!("/v1/upgrades/list?disable_cache={}", self.disable_cache);
        if let Some(height) = self.height {
            path.push_str(&format!("&height={height}"));
        }
        if !self.status.is_empty() {
            let names: Vec<String> =
                self.status.iter().map(|status| status.to_string()).collect();
            path.push_str(&format!("&status={}", names.join(",")));
        }
        if let Some(limit) = self.limit {
            path.push_str(&format!("&limit={limit}"));
        }

        let response = self.endpoint.get_json(&path).await?;
        let upgrades = response["upgrades"].as_array().cloned().unwrap_or_default();

        println!(
            "{:<10} {:<26} {:<20} {:<12} {:<22} {:<10} {:<9} NAME",
            "HEIGHT", "TYPE", "TAG", "STATUS", "STEP", "SOURCE", "PRIORITY",
        );
        for upgrade in upgrades {
            println!(
                "{:<10} {:<26} {:<20} {:<12} {:<22} {:<10} {:<9} {}",
                upgrade["height"].as_i64().unwrap_or_default(),
                upgrade["type"].as_str().unwrap_or_default(),
                upgrade["tag"].as_str().unwrap_or_default(),
                upgrade["status"].as_str().unwrap_or_default(),
                upgrade["step"].as_str().unwrap_or_default(),
                upgrade["source"].as_str().unwrap_or_default(),
                upgrade["priority"].as_i64().unwrap_or_default(),
                upgrade["name"].as_str().unwrap_or_default(),
            );
        }
        Ok(())
    }
}

#[derive(Args, Debug)]
struct RegisterArgs {
    #[command(flatten)]
    endpoint: DaemonEndpoint,

    /// Block height at which the new binary must be running.
    #[arg(long)]
    height: i64,

    /// Container image tag; may be omitted when a version is registered.
    #[arg(long, default_value = "")]
    tag: String,

    /// Human-readable upgrade name.
    #[arg(long, default_value = "")]
    name: String,

    #[arg(long, default_value = "NON_GOVERNANCE_COORDINATED")]
    upgrade_type: UpgradeType,

    /// Provider to register the upgrade with (LOCAL or DATABASE).
    #[arg(long)]
    source: ProviderKind,

    /// Conflict-resolution rank; 0 takes the provider default.
    #[arg(long, default_value_t = 0)]
    priority: i32,

    /// Replace an existing record with the same height and priority.
    #[arg(long)]
    overwrite: bool,
}

impl RegisterArgs {
    async fn run(self) -> eyre::Result<()> {
        let payload = serde_json::json!({
            "upgrade": {
                "height": self.height,
                "tag": self.tag,
                "name": self.name,
                "type": self.upgrade_type,
                "source": self.source,
                "priority": self.priority,
                "network": "",
            },
            "overwrite": self.overwrite,
        });
        self.endpoint.post_json("/v1/upgrades/add", &payload).await?;
        println!("upgrade at height {} registered", self.height);
        Ok(())
    }
}

#[derive(Args, Debug)]
struct CancelArgs {
    #[command(flatten)]
    endpoint: DaemonEndpoint,

    #[arg(long)]
    height: i64,

    /// Provider to record the cancellation in (LOCAL or DATABASE).
    #[arg(long)]
    source: ProviderKind,

    /// Cancel in this daemon's state machine only, bypassing the providers.
    #[arg(long)]
    force: bool,
}

impl CancelArgs {
    async fn run(self) -> eyre::Result<()> {
        let payload = serde_json::json!({
            "height": self.height,
            "source": self.source,
            "force": self.force,
        });
        self.endpoint.post_json("/v1/upgrades/cancel", &payload).await?;
        println!("upgrade at height {} cancelled", self.height);
        Ok(())
    }
}

#[derive(Args, Debug)]
struct ForceSyncArgs {
    #[command(flatten)]
    endpoint: DaemonEndpoint,
}

impl ForceSyncArgs {
    async fn run(self) -> eyre::Result<()> {
        let response =
            self.endpoint.post_json("/v1/upgrades/force_sync", &serde_json::json!({})).await?;
        println!(
            "registry synced at height {}",
            response["height"].as_i64().unwrap_or_default()
        );
        Ok(())
    }
}

