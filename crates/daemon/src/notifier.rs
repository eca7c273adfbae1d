//! Operator notifications with a log-only fallback.
//!
//! Callers never branch on whether chat notifications are configured: they
//! hand a message to the [`Notifier`] and the sink decides where it goes. A
//! failed delivery is logged and counted but never surfaces to the caller;
//! an upgrade must not fail because a webhook was down.

use std::collections::HashMap;

use helmsman_config::Config;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::metrics::NOTIFIER_ERRORS;

/// Identity of the operation a notification belongs to.
///
/// Threaded explicitly through orchestration calls; the bot sink uses the
/// upgrade height to group messages of one upgrade into a thread.
#[derive(Clone, Copy, Debug, Default)]
pub struct CallScope {
    pub upgrade_height: Option<i64>,
}

impl CallScope {
    pub fn for_height(upgrade_height: i64) -> Self {
        Self { upgrade_height: Some(upgrade_height) }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Level {
    Info,
    Warn,
    Error,
}

/// Where notifications go.
#[derive(Debug)]
pub enum Sink {
    /// Slack incoming webhook. Webhooks cannot thread messages.
    SlackWebhook { webhook_url: String },
    /// Slack bot token; supports per-upgrade threads.
    SlackBot { auth_token: String, channel: String, group_messages: bool },
    /// No chat configured; messages only reach the log.
    Log,
}

pub struct Notifier {
    sink: Sink,
    http: reqwest::Client,
    hostname: String,
    /// First message id per upgrade height, for threading.
    threads: RwLock<HashMap<i64, String>>,
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier").field("sink", &self.sink).finish_non_exhaustive()
    }
}

impl Notifier {
    pub fn new(sink: Sink, hostname: String) -> Self {
        Self {
            sink,
            http: reqwest::Client::new(),
            hostname,
            threads: RwLock::new(HashMap::new()),
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        let sink = match &cfg.slack {
            Some(slack) => {
                if let Some(webhook) = &slack.webhook_notifier {
                    Sink::SlackWebhook { webhook_url: webhook.webhook_url.clone() }
                } else if let Some(bot) = &slack.bot_notifier {
                    Sink::SlackBot {
                        auth_token: bot.auth_token.clone(),
                        channel: bot.channel.clone(),
                        group_messages: bot.group_messages,
                    }
                } else {
                    Sink::Log
                }
            }
            None => Sink::Log,
        };
        let hostname = hostname::get()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_owned());
        Self::new(sink, hostname)
    }

    /// Deliver a message, logging it either way.
    pub async fn notify(&self, scope: CallScope, level: Level, message: &str) {
        self.notify_with_cause(scope, level, message, None).await;
    }

    pub async fn notify_with_cause(
        &self,
        scope: CallScope,
        level: Level,
        message: &str,
        cause: Option<&str>,
    ) {
        match level {
            Level::Info => info!(height = scope.upgrade_height, "{message}"),
            Level::Warn => warn!(height = scope.upgrade_height, cause, "{message}"),
            Level::Error => error!(height = scope.upgrade_height, cause, "{message}"),
        }

        let text = self.format_message(scope, level, message, cause);
        let delivery = match &self.sink {
            Sink::Log => return,
            Sink::SlackWebhook { webhook_url } => self.post_webhook(webhook_url, &text).await,
            Sink::SlackBot { auth_token, channel, group_messages } => {
                self.post_bot_message(auth_token, channel, *group_messages, scope, &text).await
            }
        };

        if let Err(err) = delivery {
            metrics::counter!(NOTIFIER_ERRORS).increment(1);
            error!(error = %err, "failed to deliver notification");
        }
    }

    fn format_message(
        &self,
        scope: CallScope,
        level: Level,
        message: &str,
        cause: Option<&str>,
    ) -> String {
        let mut text = match level {
            Level::Info => format!(":information_source: {message}"),
            Level::Warn => format!(":warning: {message}"),
            Level::Error => format!(":rotating_light: {message}"),
        };
        if let Some(cause) = cause {
            text.push_str(&format!("\n> {cause}"));
        }
        if let Some(height) = scope.upgrade_height {
            text.push_str(&format!("\nupgrade height: {height}"));
        }
        text.push_str(&format!("\nhost: {}", self.hostname));
        text
    }

    async fn post_webhook(&self, webhook_url: &str, text: &str) -> Result<(), eyre::Report> {
        self.http
            .post(webhook_url)
            .json(&serde_json::json!({ "text": text }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn post_bot_message(
        &self,
        auth_token: &str,
        channel: &str,
        group_messages: bool,
        scope: CallScope,
        text: &str,
    ) -> Result<(), eyre::Report> {
        #[derive(Deserialize)]
        struct PostMessageResponse {
            ok: bool,
            #[serde(default)]
            error: Option<String>,
            #[serde(default)]
            ts: Option<String>,
        }

        let thread_ts = match scope.upgrade_height {
            Some(height) if group_messages => self.threads.read().await.get(&height).cloned(),
            _ => None,
        };

        let mut payload = serde_json::json!({ "channel": channel, "text": text });
        if let Some(ts) = &thread_ts {
            payload["thread_ts"] = serde_json::Value::String(ts.clone());
        }

        let response: PostMessageResponse = self
            .http
            .post("https://slack.com/api/chat.postMessage")
            .bearer_auth(auth_token)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if !response.ok {
            eyre::bail!(
                "chat.postMessage failed: {}",
                response.error.unwrap_or_else(|| "unknown error".to_owned())
            );
        }

        // remember the thread root so later messages of this upgrade nest
        // under it (the mapping is in-memory only and resets on restart)
        if let (Some(height), None, Some(ts)) = (scope.upgrade_height, thread_ts, response.ts) {
            if group_messages {
                self.threads.write().await.insert(height, ts);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn log_sink_never_fails() {
        let notifier = Notifier::new(Sink::Log, "host-1".to_owned());
        notifier.notify(CallScope::for_height(10), Level::Info, "hello").await;
        notifier
            .notify_with_cause(CallScope::default(), Level::Error, "boom", Some("cause"))
            .await;
    }

    #[test]
    fn message_carries_scope_and_host() {
        let notifier = Notifier::new(Sink::Log, "host-1".to_owned());
        let text = notifier.format_message(
            CallScope::for_height(42),
            Level::Warn,
            "image missing",
            Some("pull failed"),
        );
        assert!(text.contains("image missing"));
        assert!(text.contains("pull failed"));
        assert!(text.contains("upgrade height: 42"));
        assert!(text.contains("host: host-1"));
    }
}
