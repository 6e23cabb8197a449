//! `{field}` templates resolved against JSON payloads

use contracts::Message;
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Field(String),
}

/// Key template such as `user:{id}:events`
///
/// Placeholders name top-level fields or dotted paths (`{user.id}`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyTemplate {
    segments: Vec<Segment>,
}

impl KeyTemplate {
    pub fn parse(template: &str) -> Result<Self, String> {
        let mut segments = Vec::new();
        let mut rest = template;

        while let Some(open) = rest.find('{') {
            if open > 0 {
                segments.push(Segment::Literal(rest[..open].to_string()));
            }
            let after = &rest[open + 1..];
            let close = after
                .find('}')
                .ok_or_else(|| format!("unclosed placeholder in '{}'", template))?;
            let field = after[..close].trim();
            if field.is_empty() {
                return Err(format!("empty placeholder in '{}'", template));
            }
            segments.push(Segment::Field(field.to_string()));
            rest = &after[close + 1..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }

        if segments.is_empty() {
            return Err("template is empty".to_string());
        }
        Ok(Self { segments })
    }

    /// Whether rendering needs a parsed payload
    pub fn has_fields(&self) -> bool {
        self.segments
            .iter()
            .any(|segment| matches!(segment, Segment::Field(_)))
    }

    pub fn render(&self, payload: Option<&Map<String, Value>>) -> Result<String, String> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Field(field) => {
                    let payload =
                        payload.ok_or_else(|| format!("field '{}' needs a JSON payload", field))?;
                    let value = lookup(payload, field)
                        .ok_or_else(|| format!("missing field '{}'", field))?;
                    out.push_str(&scalar_to_string(value, field)?);
                }
            }
        }
        Ok(out)
    }
}

/// Resolve a dotted path
pub fn lookup<'a>(payload: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = payload.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

/// Render a scalar JSON value as plain text
pub fn scalar_to_string(value: &Value, field: &str) -> Result<String, String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Null => Err(format!("field '{}' is null", field)),
        Value::Array(_) | Value::Object(_) => Err(format!("field '{}' is not a scalar", field)),
    }
}

/// Parse a message payload as a JSON object
pub fn parse_object(message: &Message) -> Result<Map<String, Value>, String> {
    match serde_json::from_slice::<Value>(&message.value) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(format!("payload is not a JSON object: {}", kind(&other))),
        Err(e) => Err(format!("invalid JSON payload: {}", e)),
    }
}

/// Payload as UTF-8 text
pub fn payload_text(message: &Message) -> Result<String, String> {
    std::str::from_utf8(&message.value)
        .map(str::to_string)
        .map_err(|e| format!("payload is not UTF-8: {}", e))
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
