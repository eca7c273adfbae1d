pub mod run;
pub mod upgrades;
pub mod versions;

use eyre::WrapErr as _;

/// Shared connection flags of the operator subcommands.
#[derive(clap::Args, Debug)]
pub struct DaemonEndpoint {
    /// Host of the running helmsman daemon.
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// HTTP port of the running helmsman daemon.
    #[arg(long, default_value_t = 8080)]
    pub port: u16,
}

impl DaemonEndpoint {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}:{}{path}", self.host, self.port)
    }

    pub async fn get_json(&self, path: &str) -> eyre::Result<serde_json::Value> {
        let url = self.url(path);
        let response = reqwest::get(&url)
            .await
            .wrap_err_with(|| format!("request to {url} failed"))?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            eyre::bail!("{url} answered with {status}: {body}");
        }
        serde_json::from_str(&body).wrap_err_with(|| format!("invalid response from {url}"))
    }

    pub async fn post_json(
        &self,
        path: &str,
        payload: &serde_json::Value,
    ) -> eyre::Result<serde_json::Value> {
        let url = self.url(path);
        let response = reqwest::Client::new()
            .post(&url)
            .json(payload)
            .send()
            .await
            .wrap_err_with(|| format!("request to {url} failed"))?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            eyre::bail!("{url} answered with {status}: {body}");
        }
        serde_json::from_str(&body).wrap_err_with(|| format!("invalid response from {url}"))
    }
}
