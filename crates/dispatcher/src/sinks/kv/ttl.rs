//! Key expiry applied inside the write transaction

use std::collections::HashMap;

use super::client::{KvCommand, KvTransaction};

/// TTL policy for written keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TtlPolicy {
    #[default]
    None,
    /// Expire `n` seconds after the write
    Duration(u64),
    /// Expire at an absolute epoch second
    ExactTime(u64),
}

impl TtlPolicy {
    /// Read `ttl_type` (`none` | `duration` | `exact_time`) and `ttl_value`
    pub fn from_params(params: &HashMap<String, String>) -> Result<Self, String> {
        let ttl_type = params.get("ttl_type").map(String::as_str).unwrap_or("none");
        if ttl_type == "none" {
            return Ok(TtlPolicy::None);
        }

        let value: u64 = params
            .get("ttl_value")
            .ok_or_else(|| format!("ttl_type '{}' requires 'ttl_value'", ttl_type))?
            .parse()
            .map_err(|e| format!("invalid ttl_value: {}", e))?;

        match ttl_type {
            "duration" if value == 0 => Err("duration ttl_value must be > 0".to_string()),
            "duration" => Ok(TtlPolicy::Duration(value)),
            "exact_time" => Ok(TtlPolicy::ExactTime(value)),
            other => Err(format!("unknown ttl_type '{}'", other)),
        }
    }

    /// Queue the expiry command for `key`, attributed to message `origin`
    pub fn apply(&self, transaction: &mut KvTransaction, key: &str, origin: usize) {
        match *self {
            TtlPolicy::None => {}
            TtlPolicy::Duration(seconds) => transaction.push(
                origin,
                KvCommand::Expire {
                    key: key.to_string(),
                    seconds,
                },
            ),
            TtlPolicy::ExactTime(timestamp) => transaction.push(
                origin,
                KvCommand::ExpireAt {
                    key: key.to_string(),
                    timestamp,
                },
            ),
        }
    }
}
