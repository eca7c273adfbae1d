use clap::{Args, Subcommand};
use helmsman_types::ProviderKind;

use crate::cmd::DaemonEndpoint;

#[derive(Args, Debug)]
pub struct VersionsArgs {
    #[command(subcommand)]
    cmd: VersionsSubcommand,
}

#[derive(Subcommand, Debug)]
enum VersionsSubcommand {
    /// List registered versions, lowest height first.
    List(ListArgs),
    /// Register the image tag to run from a given height.
    Register(RegisterArgs),
    /// Show the version resolved for one height.
    Get(GetArgs),
}

impl VersionsArgs {
    pub async fn run(self) -> eyre::Result<()> {
        match self.cmd {
            VersionsSubcommand::List(cmd) => cmd.run().await,
            VersionsSubcommand::Register(cmd) => cmd.run().await,
            VersionsSubcommand::Get(cmd) => cmd.run().await,
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
}

impl ListArgs {
    async fn run(self) -> eyre::Result<()> {
        let path = format!("/v1/versions/list?disable_cache={}", self.disable_cache);
        let response = self.endpoint.get_json(&path).await?;
        let versions = response["versions"].as_array().cloned().unwrap_or_default();

        println!("{:<10} {:<20} {:<10} PRIORITY", "HEIGHT", "TAG", "SOURCE");
        for version in versions {
            println!(
                "{:<10} {:<20} {:<10} {}",
                version["height"].as_i64().unwrap_or_default(),
                version["tag"].as_str().unwrap_or_default(),
                version["source"].as_str().unwrap_or_default(),
                version["priority"].as_i64().unwrap_or_default(),
            );
        }
        Ok(())
    }
}

#[derive(Args, Debug)]
struct RegisterArgs {
    #[command(flatten)]
    endpoint: DaemonEndpoint,

    #[arg(long)]
    height: i64,

    /// Container image tag to run from `height` on.
    #[arg(long)]
    tag: String,

    /// Provider to register the version with (LOCAL or DATABASE).
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
            "version": {
                "height": self.height,
                "tag": self.tag,
                "source": self.source,
                "priority": self.priority,
                "network": "",
            },
            "overwrite": self.overwrite,
        });
        self.endpoint.post_json("/v1/versions/add", &payload).await?;
        println!("version {} registered for height {}", self.tag, self.height);
        Ok(())
    }
}

#[derive(Args, Debug)]
struct GetArgs {
    #[command(flatten)]
    endpoint: DaemonEndpoint,

    #[arg(long)]
    height: i64,

    #[arg(long)]
    disable_cache: bool,
}

impl GetArgs {
    async fn run(self) -> eyre::Result<()> {
        let path = format!(
            "/v1/versions/get?height={}&disable_cache={}",
            self.height, self.disable_cache
        );
        let response = self.endpoint.get_json(&path).await?;
        match &response["version"] {
            serde_json::Value::Null => println!("no version registered for height {}", self.height),
            version => println!(
                "height {}: tag {} (source {}, priority {})",
                self.height,
                version["tag"].as_str().unwrap_or_default(),
                version["source"].as_str().unwrap_or_default(),
                version["priority"].as_i64().unwrap_or_default(),
            ),
        }
        Ok(())
    }
}
