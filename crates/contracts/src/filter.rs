//! MessageFilter - drops messages before they reach a sink

use crate::{FilterConfig, Message};

/// Message predicate
///
/// Messages that do not match are resolved without being sunk.
pub trait MessageFilter: Send + Sync {
    fn matches(&self, message: &Message) -> bool;
}

/// Filter that accepts every message
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl MessageFilter for AcceptAll {
    fn matches(&self, _message: &Message) -> bool {
        true
    }
}

impl<F> MessageFilter for F
where
    F: Fn(&Message) -> bool + Send + Sync,
{
    fn matches(&self, message: &Message) -> bool {
        self(message)
    }
}

/// Config-driven filter: key prefix and/or JSON field equality
///
/// All configured conditions must hold. Payloads that are not JSON objects
/// never match a field condition.
#[derive(Debug, Clone, Default)]
pub struct FilterRule {
    key_prefix: Option<String>,
    field: Option<(String, serde_json::Value)>,
}

impl FilterRule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }

    pub fn with_field(mut self, field: impl Into<String>, equals: serde_json::Value) -> Self {
        self.field = Some((field.into(), equals));
        self
    }

    /// Build from configuration
    ///
    /// `equals` is parsed as JSON when possible, otherwise compared as a string.
    pub fn from_config(config: &FilterConfig) -> Self {
        let mut rule = Self::new();
        if let Some(prefix) = &config.key_prefix {
            rule = rule.with_key_prefix(prefix.clone());
        }
        if let (Some(field), Some(equals)) = (&config.json_field, &config.equals) {
            let expected = serde_json::from_str(equals)
                .unwrap_or_else(|_| serde_json::Value::String(equals.clone()));
            rule = rule.with_field(field.clone(), expected);
        }
        rule
    }
}

impl MessageFilter for FilterRule {
    fn matches(&self, message: &Message) -> bool {
        if let Some(prefix) = &self.key_prefix {
            if !message.key.starts_with(prefix.as_bytes()) {
                return false;
            }
        }

        if let Some((field, expected)) = &self.field {
            let Ok(payload) = serde_json::from_slice::<serde_json::Value>(&message.value) else {
                return false;
            };
            return payload.get(field) == Some(expected);
        }

        true
    }
}
