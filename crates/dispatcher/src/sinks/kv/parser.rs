//! Message -> key-value entry parsers

use std::collections::HashMap;

use contracts::Message;
use serde_json::Value;

use super::client::KvCommand;
use crate::sinks::template::{lookup, parse_object, payload_text, scalar_to_string, KeyTemplate};

/// Backend-native key-value write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvEntry {
    ListPush {
        key: String,
        value: String,
    },
    HashSet {
        key: String,
        field: String,
        value: String,
    },
}

impl KvEntry {
    pub fn key(&self) -> &str {
        match self {
            KvEntry::ListPush { key, .. } | KvEntry::HashSet { key, .. } => key,
        }
    }

    pub fn into_command(self) -> KvCommand {
        match self {
            KvEntry::ListPush { key, value } => KvCommand::LPush { key, value },
            KvEntry::HashSet { key, field, value } => KvCommand::HSet { key, field, value },
        }
    }
}

/// Turns one message into zero or more entries
pub trait KvParser: Send + Sync {
    fn parse(&self, message: &Message) -> Result<Vec<KvEntry>, String>;
}

/// One list push per message
///
/// The pushed value is `value_field` of the JSON payload, or the raw payload
/// when no field is configured.
#[derive(Debug, Clone)]
pub struct KvListParser {
    key: KeyTemplate,
    value_field: Option<String>,
}

impl KvListParser {
    pub fn new(key: KeyTemplate, value_field: Option<String>) -> Self {
        Self { key, value_field }
    }
}

impl KvParser for KvListParser {
    fn parse(&self, message: &Message) -> Result<Vec<KvEntry>, String> {
        let payload = if self.key.has_fields() || self.value_field.is_some() {
            Some(parse_object(message)?)
        } else {
            None
        };

        let key = self.key.render(payload.as_ref())?;
        let value = match (&self.value_field, &payload) {
            (Some(field), Some(payload)) => {
                let value =
                    lookup(payload, field).ok_or_else(|| format!("missing field '{}'", field))?;
                json_text(value, field)?
            }
            _ => payload_text(message)?,
        };

        Ok(vec![KvEntry::ListPush { key, value }])
    }
}

/// One hash field per mapped payload field
///
/// Fields absent from a payload are skipped. Without a mapping every
/// top-level field is written under its own name.
#[derive(Debug, Clone)]
pub struct KvHashSetParser {
    key: KeyTemplate,
    /// (payload path, hash field)
    fields: Vec<(String, String)>,
}

impl KvHashSetParser {
    pub fn new(key: KeyTemplate, fields: Vec<(String, String)>) -> Self {
        Self { key, fields }
    }

    /// Parse `a:fieldA,b` into `[(a, fieldA), (b, b)]`
    pub fn parse_mapping(raw: &str) -> Result<Vec<(String, String)>, String> {
        raw.split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(|item| match item.split_once(':') {
                Some((path, field)) if !path.is_empty() && !field.is_empty() => {
                    Ok((path.to_string(), field.to_string()))
                }
                Some(_) => Err(format!("invalid hash field mapping '{}'", item)),
                None => Ok((item.to_string(), item.to_string())),
            })
            .collect()
    }
}

impl KvParser for KvHashSetParser {
    fn parse(&self, message: &Message) -> Result<Vec<KvEntry>, String> {
        let payload = parse_object(message)?;
        let key = self.key.render(Some(&payload))?;

        if self.fields.is_empty() {
            return payload
                .iter()
                .map(|(field, value)| {
                    Ok(KvEntry::HashSet {
                        key: key.clone(),
                        field: field.clone(),
                        value: json_text(value, field)?,
                    })
                })
                .collect();
        }

        let mut entries = Vec::with_capacity(self.fields.len());
        for (path, field) in &self.fields {
            if let Some(value) = lookup(&payload, path) {
                entries.push(KvEntry::HashSet {
                    key: key.clone(),
                    field: field.clone(),
                    value: json_text(value, path)?,
                });
            }
        }
        Ok(entries)
    }
}

/// Scalars as plain text, containers as compact JSON
fn json_text(value: &Value, field: &str) -> Result<String, String> {
    match value {
        Value::Array(_) | Value::Object(_) => Ok(value.to_string()),
        scalar => scalar_to_string(scalar, field),
    }
}

/// Build the parser selected by `data_type` (`list` | `hashset`)
pub fn parser_from_params(params: &HashMap<String, String>) -> Result<Box<dyn KvParser>, String> {
    let template = params
        .get("key_template")
        .ok_or_else(|| "missing 'key_template' parameter".to_string())?;
    let key = KeyTemplate::parse(template)?;

    match params.get("data_type").map(String::as_str).unwrap_or("list") {
        "list" => Ok(Box::new(KvListParser::new(
            key,
            params.get("value_field").cloned(),
        ))),
        "hashset" => {
            let fields = match params.get("hash_fields") {
                Some(raw) => KvHashSetParser::parse_mapping(raw)?,
                None => Vec::new(),
            };
            Ok(Box::new(KvHashSetParser::new(key, fields)))
        }
        other => Err(format!("unknown data_type '{}'", other)),
    }
}
