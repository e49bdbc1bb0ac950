//! Notifier sinks for Herald.
//!
//! A [`Notifier`] takes one event plus the style chosen by the policy, renders
//! it and delivers it synchronously. The caller never retries; any error it
//! returns ends the watch.
//!
//! - [`SlackNotifier`] posts to Slack through the Web API or an incoming webhook
//! - [`LogNotifier`] only logs the rendered message (dry runs)

#![forbid(unsafe_code)]

pub mod error;
pub mod render;
pub mod slack;

pub use error::NotifyError;
pub use render::{RenderMode, Renderer, SlackMessage};
pub use slack::{SlackConfig, SlackNotifier};

use async_trait::async_trait;
use herald_core::{Event, NotificationStyle};
use tracing::info;

/// Where a message landed, when the sink can tell.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delivery {
    pub channel: Option<String>,
    pub ts: Option<String>,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &'static str;

    /// Render and deliver one event. `style` is `None` when the matching rule had none.
    async fn notify(&self, event: &Event, style: Option<&NotificationStyle>) -> Result<Delivery, NotifyError>;
}

/// Renders messages into the log instead of delivering them.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier {
    renderer: Renderer,
}

impl LogNotifier {
    pub fn new(renderer: Renderer) -> Self { Self { renderer } }
}

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn notify(&self, event: &Event, style: Option<&NotificationStyle>) -> Result<Delivery, NotifyError> {
        let msg = self.renderer.render(event, style);
        let body = serde_json::to_string(&msg).unwrap_or_default();
        info!(reason = %event.reason, body = %body, "dry run: message not sent");
        Ok(Delivery::default())
    }
}
