//! Message rendering: one event plus a style becomes a Slack message body.

use herald_core::{Event, NotificationStyle};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Layout of the rendered message.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RenderMode {
    /// Colored attachment with one labeled field per attribute.
    #[default]
    Attachment,
    /// Single line of text with an emoji prefix.
    Inline,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SlackMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    pub text: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Attachment {
    /// Shown by clients that cannot render attachments (IRC, OS notifications).
    pub fallback: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    pub fields: SmallVec<[Field; 8]>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Field {
    pub title: String,
    pub value: String,
    pub short: bool,
}

fn field(title: &str, value: &str, short: bool) -> Field {
    Field { title: title.to_string(), value: value.to_string(), short }
}

/// The configured style wins; otherwise guess from the reason.
pub fn resolve_style(event: &Event, style: Option<&NotificationStyle>) -> Option<NotificationStyle> {
    style.cloned().or_else(|| NotificationStyle::infer(&event.reason))
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Renderer {
    pub mode: RenderMode,
    pub cluster_name: Option<String>,
}

impl Renderer {
    pub fn new(mode: RenderMode, cluster_name: Option<String>) -> Self {
        Self { mode, cluster_name: cluster_name.filter(|c| !c.is_empty()) }
    }

    pub fn render(&self, event: &Event, style: Option<&NotificationStyle>) -> SlackMessage {
        let style = resolve_style(event, style);
        match self.mode {
            RenderMode::Attachment => self.attachment(event, style),
            RenderMode::Inline => self.inline(event, style),
        }
    }

    fn attachment(&self, event: &Event, style: Option<NotificationStyle>) -> SlackMessage {
        let mut fields = SmallVec::new();
        if let Some(ns) = event.namespace.as_deref() {
            fields.push(field("Namespace", ns, true));
        }
        fields.push(field("Message", &event.message, false));
        fields.push(field("Object", &event.involved_object_kind, true));
        fields.push(field("Name", &event.name, true));
        fields.push(field("Reason", &event.reason, true));
        fields.push(field("Component", &event.source_component, true));
        let fallback = match self.cluster_name.as_deref() {
            Some(c) => {
                fields.push(field("Cluster", c, true));
                format!("{} [{}]", event.message, c)
            }
            None => event.message.clone(),
        };
        SlackMessage {
            channel: None,
            text: String::new(),
            attachments: vec![Attachment { fallback, color: style.map(|s| s.color().to_string()), fields }],
        }
    }

    fn inline(&self, event: &Event, style: Option<NotificationStyle>) -> SlackMessage {
        let mut text = String::new();
        if let Some(s) = style {
            text.push_str(s.emoji());
            text.push(' ');
        }
        let object = match event.namespace.as_deref() {
            Some(ns) => format!("{}/{}", ns, event.name),
            None => event.name.clone(),
        };
        text.push_str(&format!(
            "*{}* {} `{}`: {} (component: {})",
            event.reason, event.involved_object_kind, object, event.message, event.source_component
        ));
        if let Some(c) = self.cluster_name.as_deref() {
            text.push_str(&format!(" [{}]", c));
        }
        SlackMessage { channel: None, text, attachments: Vec::new() }
    }
}
