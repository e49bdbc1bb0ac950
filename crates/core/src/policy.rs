//! Notification policy: decides which events are worth a chat message.
//!
//! Rules apply in a fixed order and later rules override earlier ones:
//! 1. reason allow-list sets the baseline and the style
//! 2. repeats (`count > 1`) are suppressed
//! 3. the backoff escalation re-enables exactly one repeat count
//! 4. stale events are always vetoed

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::{Event, NotificationStyle};

/// One allow-list entry: `Reason` or `Reason=style`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub reason: String,
    /// `None` lets the renderer infer a style from the reason.
    pub style: Option<NotificationStyle>,
}

impl Rule {
    pub fn new(reason: impl Into<String>, style: Option<NotificationStyle>) -> Self {
        Self { reason: reason.into(), style }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RuleParseError {
    #[error("empty reason in rule {0:?} (expect Reason or Reason=style)")]
    EmptyReason(String),
}

impl FromStr for Rule {
    type Err = RuleParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (reason, style) = match s.split_once('=') {
            Some((r, st)) if !st.trim().is_empty() => (r.trim(), st.parse().ok()),
            Some((r, _)) => (r.trim(), None),
            None => (s.trim(), None),
        };
        if reason.is_empty() {
            return Err(RuleParseError::EmptyReason(s.to_string()));
        }
        Ok(Rule::new(reason, style))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyConfig {
    pub rules: Vec<Rule>,
    pub backoff_reason: String,
    /// Exact repeat count that escalates; not a threshold.
    pub backoff_count: u32,
    pub backoff_style: NotificationStyle,
    pub max_age: Duration,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            rules: vec![
                Rule::new("SuccessfulCreate", Some(NotificationStyle::Good)),
                Rule::new("NodeReady", Some(NotificationStyle::Good)),
                Rule::new("NodeNotReady", Some(NotificationStyle::Warning)),
                Rule::new("NodeOutOfDisk", Some(NotificationStyle::Danger)),
            ],
            backoff_reason: "BackOff".to_string(),
            backoff_count: 3,
            backoff_style: NotificationStyle::Danger,
            max_age: Duration::from_secs(60),
        }
    }
}

impl PolicyConfig {
    /// Append rules after the defaults; a repeated reason replaces the earlier entry.
    pub fn with_rules(mut self, extra: impl IntoIterator<Item = Rule>) -> Self {
        self.rules.extend(extra);
        self
    }
}

/// Why the policy reached its decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cause", rename_all = "snake_case")]
pub enum Cause {
    Matched,
    Unmatched,
    Repeat { count: u32 },
    BackoffEscalation,
    Stale { age_secs: i64 },
}

impl Cause {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Matched => "matched",
            Self::Unmatched => "unmatched",
            Self::Repeat { .. } => "repeat",
            Self::BackoffEscalation => "backoff_escalation",
            Self::Stale { .. } => "stale",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub notify: bool,
    pub style: Option<NotificationStyle>,
    pub cause: Cause,
}

/// Compiled policy. Cheap to share; `decide` takes `&self` and holds no state between calls.
#[derive(Debug, Clone)]
pub struct Policy {
    rules: FxHashMap<String, Option<NotificationStyle>>,
    backoff_reason: String,
    backoff_count: u32,
    backoff_style: NotificationStyle,
    max_age: Duration,
}

impl Policy {
    pub fn new(cfg: &PolicyConfig) -> Self {
        let mut rules = FxHashMap::default();
        for r in &cfg.rules {
            rules.insert(r.reason.clone(), r.style.clone());
        }
        Self {
            rules,
            backoff_reason: cfg.backoff_reason.clone(),
            backoff_count: cfg.backoff_count,
            backoff_style: cfg.backoff_style.clone(),
            max_age: cfg.max_age,
        }
    }

    pub fn max_age(&self) -> Duration { self.max_age }

    /// Evaluate one event as of `now`. Total: every input yields a decision.
    pub fn decide(&self, event: &Event, now: DateTime<Utc>) -> Decision {
        let (mut notify, mut style, mut cause) = match self.rules.get(&event.reason) {
            Some(style) => (true, style.clone(), Cause::Matched),
            None => (false, None, Cause::Unmatched),
        };

        if event.count > 1 {
            if notify {
                cause = Cause::Repeat { count: event.count };
            }
            notify = false;
        }

        if event.reason == self.backoff_reason && event.count == self.backoff_count {
            notify = true;
            style = Some(self.backoff_style.clone());
            cause = Cause::BackoffEscalation;
        }

        // A negative age (clock skew) converts to an error and is never stale.
        let age = now.signed_duration_since(event.last_timestamp);
        if age.to_std().map(|a| a > self.max_age).unwrap_or(false) {
            if notify {
                cause = Cause::Stale { age_secs: age.num_seconds() };
            }
            notify = false;
        }

        Decision { notify, style, cause }
    }
}

impl Default for Policy {
    fn default() -> Self { Self::new(&PolicyConfig::default()) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rules() {
        assert_eq!("NodeReady=good".parse::<Rule>().unwrap(), Rule::new("NodeReady", Some(NotificationStyle::Good)));
        assert_eq!("Killing".parse::<Rule>().unwrap(), Rule::new("Killing", None));
        assert_eq!("Killing=".parse::<Rule>().unwrap(), Rule::new("Killing", None));
        assert_eq!(" Evicted = #aa0000 ".parse::<Rule>().unwrap(), Rule::new("Evicted", Some(NotificationStyle::Custom("#aa0000".into()))));
        assert!(matches!("=good".parse::<Rule>(), Err(RuleParseError::EmptyReason(_))));
    }

    #[test]
    fn later_rules_override_defaults() {
        let cfg = PolicyConfig::default().with_rules(vec![Rule::new("NodeReady", Some(NotificationStyle::Warning))]);
        let p = Policy::new(&cfg);
        assert_eq!(p.rules.get("NodeReady"), Some(&Some(NotificationStyle::Warning)));
        assert_eq!(p.rules.len(), 4);
    }

    #[test]
    fn cause_serializes_with_tag() {
        let v = serde_json::to_value(Cause::Stale { age_secs: 90 }).unwrap();
        assert_eq!(v, serde_json::json!({ "cause": "stale", "age_secs": 90 }));
    }
}
