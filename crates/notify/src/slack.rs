//! Slack delivery via the Web API (`chat.postMessage`) or an incoming webhook.

use async_trait::async_trait;
use herald_core::{Event, NotificationStyle};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::NotifyError;
use crate::render::{RenderMode, Renderer, SlackMessage};
use crate::{Delivery, Notifier};

pub const DEFAULT_API_BASE: &str = "https://slack.com/api";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SlackConfig {
    pub token: Option<String>,
    pub channel: Option<String>,
    /// Used when no API token is set.
    pub webhook_url: Option<String>,
    pub api_base: String,
    pub render: RenderMode,
    /// Appended to every rendered message.
    pub cluster_name: Option<String>,
}

impl Default for SlackConfig {
    fn default() -> Self {
        Self {
            token: None,
            channel: None,
            webhook_url: None,
            api_base: DEFAULT_API_BASE.to_string(),
            render: RenderMode::Attachment,
            cluster_name: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Target {
    Api { url: String, token: String, channel: String },
    Webhook { url: String },
}

impl SlackConfig {
    fn target(&self) -> Result<Target, NotifyError> {
        let non_empty = |v: &Option<String>| v.as_deref().filter(|s| !s.is_empty()).map(str::to_string);
        match (non_empty(&self.token), non_empty(&self.channel), non_empty(&self.webhook_url)) {
            (Some(token), Some(channel), _) => Ok(Target::Api {
                url: format!("{}/chat.postMessage", self.api_base.trim_end_matches('/')),
                token,
                channel,
            }),
            (Some(_), None, _) => Err(NotifyError::NotConfigured("SLACK_CHANNEL is required with SLACK_TOKEN".to_string())),
            (None, _, Some(url)) => Ok(Target::Webhook { url }),
            (None, _, None) => Err(NotifyError::NotConfigured("set SLACK_TOKEN and SLACK_CHANNEL, or SLACK_WEBHOOK_URL".to_string())),
        }
    }
}

#[derive(Debug, Deserialize)]
struct PostMessageResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    ts: Option<String>,
}

pub struct SlackNotifier {
    client: reqwest::Client,
    target: Target,
    renderer: Renderer,
}

impl SlackNotifier {
    pub fn new(cfg: &SlackConfig) -> Result<Self, NotifyError> {
        let target = cfg.target()?;
        match &target {
            Target::Api { channel, .. } => debug!(channel = %channel, "slack web API delivery"),
            Target::Webhook { .. } => debug!("slack webhook delivery"),
        }
        Ok(Self {
            client: reqwest::Client::new(),
            target,
            renderer: Renderer::new(cfg.render, cfg.cluster_name.clone()),
        })
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, NotifyError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            return Err(NotifyError::RateLimited { retry_after_secs });
        }
        let body = response.text().await.unwrap_or_default();
        warn!(channel = "slack", status = %status, body = %body, "slack request failed");
        Err(NotifyError::Status { status: status.as_u16(), body })
    }

    async fn post_api(&self, url: &str, token: &str, mut msg: SlackMessage, channel: &str) -> Result<Delivery, NotifyError> {
        msg.channel = Some(channel.to_string());
        let response = self.client.post(url).bearer_auth(token).json(&msg).send().await?;
        let reply: PostMessageResponse = Self::check_status(response).await?.json().await?;
        if !reply.ok {
            return Err(NotifyError::Api(reply.error.unwrap_or_else(|| "unknown_error".to_string())));
        }
        info!(channel = ?reply.channel, ts = ?reply.ts, "message sent");
        Ok(Delivery { channel: reply.channel, ts: reply.ts })
    }

    async fn post_webhook(&self, url: &str, msg: SlackMessage) -> Result<Delivery, NotifyError> {
        let response = self.client.post(url).json(&msg).send().await?;
        Self::check_status(response).await?;
        info!("message sent via webhook");
        Ok(Delivery::default())
    }
}

#[async_trait]
impl Notifier for SlackNotifier {
    fn name(&self) -> &'static str {
        "slack"
    }

    async fn notify(&self, event: &Event, style: Option<&NotificationStyle>) -> Result<Delivery, NotifyError> {
        let msg = self.renderer.render(event, style);
        debug!(channel = "slack", reason = %event.reason, "sending notification");
        match &self.target {
            Target::Api { url, token, channel } => self.post_api(url, token, msg, channel).await,
            Target::Webhook { url } => self.post_webhook(url, msg).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_target_wins_over_webhook() {
        let cfg = SlackConfig {
            token: Some("xoxb-1".into()),
            channel: Some("C01".into()),
            webhook_url: Some("https://hooks.slack.com/services/x".into()),
            api_base: "https://slack.example/api/".into(),
            ..SlackConfig::default()
        };
        assert_eq!(
            cfg.target().unwrap(),
            Target::Api { url: "https://slack.example/api/chat.postMessage".into(), token: "xoxb-1".into(), channel: "C01".into() }
        );
    }

    #[test]
    fn webhook_target_without_token() {
        let cfg = SlackConfig { webhook_url: Some("https://hooks.slack.com/services/x".into()), ..SlackConfig::default() };
        assert!(matches!(cfg.target().unwrap(), Target::Webhook { .. }));
    }

    #[test]
    fn incomplete_config_is_rejected() {
        let missing_channel = SlackConfig { token: Some("xoxb-1".into()), ..SlackConfig::default() };
        assert!(matches!(missing_channel.target(), Err(NotifyError::NotConfigured(_))));
        let empty = SlackConfig { token: Some(String::new()), ..SlackConfig::default() };
        assert!(matches!(empty.target(), Err(NotifyError::NotConfigured(_))));
    }
}
