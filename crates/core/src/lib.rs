//! Herald core types: decoded events, rendering styles and the notification policy.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod policy;

pub use policy::{Cause, Decision, Policy, PolicyConfig, Rule, RuleParseError};

/// Envelope type of a watch record. Carried through the pipeline untouched.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum WatchEventType {
    Added,
    Modified,
    Deleted,
    Bookmark,
    Error,
}

impl WatchEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Added => "ADDED",
            Self::Modified => "MODIFIED",
            Self::Deleted => "DELETED",
            Self::Bookmark => "BOOKMARK",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for WatchEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One cluster event as seen on the watch stream.
///
/// A snapshot: repeat occurrences arrive as new values with a higher `count`
/// and a later `last_timestamp`, never as updates to an existing value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    pub reason: String,
    pub message: String,
    pub count: u32,
    pub first_timestamp: DateTime<Utc>,
    pub last_timestamp: DateTime<Utc>,
    pub involved_object_kind: String,
    pub name: String,
    pub namespace: Option<String>,
    pub source_component: String,
}

/// Rendering hint conveying severity. Carries no meaning beyond display.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum NotificationStyle {
    Good,
    Warning,
    Danger,
    /// Free-form override, e.g. a hex color like `#439FE0`.
    #[serde(untagged)]
    Custom(String),
}

impl NotificationStyle {
    /// Attachment color understood by Slack.
    pub fn color(&self) -> &str {
        match self {
            Self::Good => "good",
            Self::Warning => "warning",
            Self::Danger => "danger",
            Self::Custom(c) => c.as_str(),
        }
    }

    /// Emoji prefix for text-only rendering.
    pub fn emoji(&self) -> &'static str {
        match self {
            Self::Good => ":white_check_mark:",
            Self::Warning => ":warning:",
            Self::Danger => ":fire:",
            Self::Custom(_) => ":information_source:",
        }
    }

    /// Guess a style from a reason when none was configured.
    pub fn infer(reason: &str) -> Option<Self> {
        if reason.starts_with("Success") {
            Some(Self::Good)
        } else if reason.starts_with("Fail") {
            Some(Self::Danger)
        } else {
            None
        }
    }
}

impl fmt::Display for NotificationStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.color())
    }
}

impl FromStr for NotificationStyle {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "good" => Self::Good,
            "warning" => Self::Warning,
            "danger" => Self::Danger,
            _ => Self::Custom(s.trim().to_string()),
        })
    }
}

pub mod prelude {
    pub use super::{Decision, Event, NotificationStyle, Policy, PolicyConfig, WatchEventType};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn style_parse_and_color() {
        assert_eq!("good".parse::<NotificationStyle>().unwrap(), NotificationStyle::Good);
        assert_eq!("DANGER".parse::<NotificationStyle>().unwrap(), NotificationStyle::Danger);
        let custom: NotificationStyle = "#439FE0".parse().unwrap();
        assert_eq!(custom.color(), "#439FE0");
    }

    #[test]
    fn style_serde_uses_plain_strings() {
        assert_eq!(serde_json::to_string(&NotificationStyle::Warning).unwrap(), "\"warning\"");
        let s: NotificationStyle = serde_json::from_str("\"#ff0000\"").unwrap();
        assert_eq!(s, NotificationStyle::Custom("#ff0000".into()));
    }

    #[test]
    fn infer_from_reason_prefix() {
        assert_eq!(NotificationStyle::infer("SuccessfulDelete"), Some(NotificationStyle::Good));
        assert_eq!(NotificationStyle::infer("FailedMount"), Some(NotificationStyle::Danger));
        assert_eq!(NotificationStyle::infer("Pulled"), None);
    }

    #[test]
    fn watch_type_wire_names() {
        let t: WatchEventType = serde_json::from_str("\"MODIFIED\"").unwrap();
        assert_eq!(t, WatchEventType::Modified);
        assert_eq!(WatchEventType::Bookmark.to_string(), "BOOKMARK");
    }
}
