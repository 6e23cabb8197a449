//! 配置解析模块
//!
//! 支持 TOML (主要) 和 JSON (可选) 格式。
//! 解析前展开 `${VAR}` / `${VAR:-default}` 环境变量引用。

use contracts::{ContractError, PipelineBlueprint};

/// 配置文件格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    /// TOML 格式 (推荐)
    Toml,
    /// JSON 格式
    Json,
}

impl ConfigFormat {
    /// 从文件扩展名推断格式
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "toml" => Some(Self::Toml),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

/// 解析 TOML 格式配置
pub fn parse_toml(content: &str) -> Result<PipelineBlueprint, ContractError> {
    toml::from_str(content).map_err(|e| ContractError::ConfigParse {
        message: format!("TOML parse error: {e}"),
        source: Some(Box::new(e)),
    })
}

/// 解析 JSON 格式配置
pub fn parse_json(content: &str) -> Result<PipelineBlueprint, ContractError> {
    serde_json::from_str(content).map_err(|e| ContractError::ConfigParse {
        message: format!("JSON parse error: {e}"),
        source: Some(Box::new(e)),
    })
}

/// 根据格式解析配置
pub fn parse(content: &str, format: ConfigFormat) -> Result<PipelineBlueprint, ContractError> {
    let content = expand_env(content)?;
    match format {
        ConfigFormat::Toml => parse_toml(&content),
        ConfigFormat::Json => parse_json(&content),
    }
}

/// 展开环境变量引用
///
/// 未设置且没有默认值的变量是解析错误。
pub fn expand_env(content: &str) -> Result<String, ContractError> {
    let mut expanded = String::with_capacity(content.len());
    let mut rest = content;

    while let Some(start) = rest.find("${") {
        expanded.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find('}')
            .ok_or_else(|| ContractError::config_parse("unterminated '${' in config"))?;

        let expr = &after[..end];
        let (name, default) = match expr.split_once(":-") {
            Some((name, default)) => (name, Some(default)),
            None => (expr, None),
        };

        let value = match (std::env::var(name), default) {
            (Ok(value), _) => value,
            (Err(_), Some(default)) => default.to_string(),
            (Err(_), None) => {
                return Err(ContractError::config_parse(format!(
                    "environment variable '{name}' is not set"
                )))
            }
        };
        expanded.push_str(&value);
        rest = &after[end + 1..];
    }

    expanded.push_str(rest);
    Ok(expanded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use contracts::{BackoffKind, SinkType};

    #[test]
    fn test_parse_toml_minimal() {
        let content = r#"
[sink]
name = "out"
sink_type = "log"
"#;
        let result = parse_toml(content);
        assert!(result.is_ok(), "Failed: {:?}", result.err());
        let bp = result.unwrap();
        assert_eq!(bp.sink.name, "out");
        assert_eq!(bp.sink.sink_type, SinkType::Log);
        assert_eq!(bp.workers.parallelism, 1);
    }

    #[test]
    fn test_parse_json_minimal() {
        let content = r#"{
            "retry": { "max_attempts": 5, "backoff": "fixed" },
            "sink": { "name": "out", "sink_type": "kv", "params": { "key_template": "k" } }
        }"#;
        let result = parse_json(content);
        assert!(result.is_ok(), "Failed: {:?}", result.err());
        let bp = result.unwrap();
        assert_eq!(bp.retry.max_attempts, 5);
        assert_eq!(bp.retry.backoff, BackoffKind::Fixed);
    }

    #[test]
    fn test_parse_toml_syntax_error() {
        let content = "invalid toml [[[";
        let result = parse_toml(content);
        assert!(result.is_err());
        let err = result.unwrap_err();
        assert!(matches!(err, ContractError::ConfigParse { .. }));
    }

    #[test]
    fn test_unknown_sink_type_is_parse_error() {
        let content = r#"
[sink]
name = "out"
sink_type = "carrier_pigeon"
"#;
        assert!(matches!(
            parse_toml(content).unwrap_err(),
            ContractError::ConfigParse { .. }
        ));
    }

    #[test]
    fn test_expand_env() {
        std::env::set_var("SINKPIPE_PARSER_TEST_URL", "http://collector:8080");
        let content = r#"url = "${SINKPIPE_PARSER_TEST_URL}" ttl = "${SINKPIPE_PARSER_TEST_UNSET:-60}""#;
        assert_eq!(
            expand_env(content).unwrap(),
            r#"url = "http://collector:8080" ttl = "60""#
        );

        assert!(expand_env("${SINKPIPE_PARSER_TEST_UNSET}").is_err());
        assert!(expand_env("${unterminated").is_err());
        assert_eq!(expand_env("no references").unwrap(), "no references");
    }

    #[test]
    fn test_parse_expands_before_deserializing() {
        std::env::set_var("SINKPIPE_PARSER_TEST_SINK", "from_env");
        let content = r#"
[sink]
name = "${SINKPIPE_PARSER_TEST_SINK}"
sink_type = "log"
"#;
        let bp = parse(content, ConfigFormat::Toml).unwrap();
        assert_eq!(bp.sink.name, "from_env");
    }

    #[test]
    fn test_format_from_extension() {
        assert_eq!(
            ConfigFormat::from_extension("toml"),
            Some(ConfigFormat::Toml)
        );
        assert_eq!(
            ConfigFormat::from_extension("TOML"),
            Some(ConfigFormat::Toml)
        );
        assert_eq!(
            ConfigFormat::from_extension("json"),
            Some(ConfigFormat::Json)
        );
        assert_eq!(ConfigFormat::from_extension("yaml"), None);
    }
}
