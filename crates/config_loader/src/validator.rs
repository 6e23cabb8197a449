//! 配置校验模块
//!
//! 校验规则：
//! - derive 区间约束 (parallelism >= 1, max_batch_size >= 1, factor >= 1.0, 0 <= jitter <= 1)
//! - initial_delay_ms <= max_delay_ms
//! - on_exhausted = "dead_letter" 时必须配置 [dead_letter]，且类型为 log / blob
//! - sink 名称非空，必填参数齐全
//! - filter 的 json_field 与 equals 成对出现

use std::collections::HashMap;

use contracts::{ContractError, ExhaustedAction, PipelineBlueprint, SinkType};
use validator::{Validate, ValidationError, ValidationErrors, ValidationErrorsKind};

/// 校验 PipelineBlueprint 配置
///
/// 返回第一个遇到的错误，或 Ok(())。
pub fn validate(blueprint: &PipelineBlueprint) -> Result<(), ContractError> {
    validate_ranges(blueprint)?;
    validate_retry(blueprint)?;
    validate_dead_letter(blueprint)?;
    validate_sink(blueprint)?;
    validate_filter(blueprint)?;
    Ok(())
}

/// derive 规则
fn validate_ranges(blueprint: &PipelineBlueprint) -> Result<(), ContractError> {
    let Err(errors) = blueprint.validate() else {
        return Ok(());
    };

    let (field, message) = first_violation(&errors, "")
        .unwrap_or_else(|| ("<root>".to_string(), errors.to_string()));
    Err(ContractError::config_validation(field, message))
}

/// 按字段名排序后取第一个错误，保证报错稳定
fn first_violation(errors: &ValidationErrors, prefix: &str) -> Option<(String, String)> {
    let mut fields: Vec<_> = errors.errors().iter().collect();
    fields.sort_by(|a, b| a.0.cmp(b.0));

    for (field, kind) in fields {
        let path = if prefix.is_empty() {
            field.to_string()
        } else {
            format!("{prefix}.{field}")
        };

        let found = match kind {
            ValidationErrorsKind::Field(list) => list.first().map(|e| (path.clone(), describe(e))),
            ValidationErrorsKind::Struct(inner) => first_violation(inner, &path),
            ValidationErrorsKind::List(items) => items
                .iter()
                .find_map(|(idx, inner)| first_violation(inner, &format!("{path}[{idx}]"))),
        };
        if found.is_some() {
            return found;
        }
    }
    None
}

fn describe(error: &ValidationError) -> String {
    if let Some(message) = &error.message {
        return message.to_string();
    }

    let mut params: Vec<String> = ["min", "max", "value"]
        .iter()
        .filter_map(|key| error.params.get(*key).map(|v| format!("{key}={v}")))
        .collect();
    params.sort();

    if params.is_empty() {
        format!("failed '{}' check", error.code)
    } else {
        format!("failed '{}' check ({})", error.code, params.join(", "))
    }
}

/// 校验重试配置
fn validate_retry(blueprint: &PipelineBlueprint) -> Result<(), ContractError> {
    let retry = &blueprint.retry;
    if retry.initial_delay_ms > retry.max_delay_ms {
        return Err(ContractError::config_validation(
            "retry.initial_delay_ms / retry.max_delay_ms",
            format!(
                "initial_delay_ms ({}) must be <= max_delay_ms ({})",
                retry.initial_delay_ms, retry.max_delay_ms
            ),
        ));
    }
    Ok(())
}

/// 校验死信配置
fn validate_dead_letter(blueprint: &PipelineBlueprint) -> Result<(), ContractError> {
    let Some(dead_letter) = &blueprint.dead_letter else {
        if blueprint.retry.on_exhausted == ExhaustedAction::DeadLetter {
            return Err(ContractError::config_validation(
                "dead_letter",
                "retry.on_exhausted = \"dead_letter\" requires a [dead_letter] section",
            ));
        }
        return Ok(());
    };

    if !matches!(dead_letter.sink_type, SinkType::Log | SinkType::Blob) {
        return Err(ContractError::config_validation(
            "dead_letter.sink_type",
            format!(
                "dead-letter destination must be log or blob, got {:?}",
                dead_letter.sink_type
            ),
        ));
    }

    for param in dead_letter.sink_type.required_params() {
        if is_missing(&dead_letter.params, param) {
            return Err(ContractError::config_validation(
                format!("dead_letter.params.{param}"),
                "missing required parameter",
            ));
        }
    }
    Ok(())
}

/// 校验 sink 配置
fn validate_sink(blueprint: &PipelineBlueprint) -> Result<(), ContractError> {
    let sink = &blueprint.sink;
    if sink.name.trim().is_empty() {
        return Err(ContractError::config_validation(
            "sink.name",
            "sink name cannot be empty",
        ));
    }

    for param in sink.sink_type.required_params() {
        if is_missing(&sink.params, param) {
            return Err(ContractError::config_validation(
                format!("sink.params.{param}"),
                format!("missing required parameter for {:?} sink", sink.sink_type),
            ));
        }
    }
    Ok(())
}

/// 校验过滤器配置
fn validate_filter(blueprint: &PipelineBlueprint) -> Result<(), ContractError> {
    let Some(filter) = &blueprint.filter else {
        return Ok(());
    };

    if filter.json_field.is_some() != filter.equals.is_some() {
        return Err(ContractError::config_validation(
            "filter.json_field / filter.equals",
            "json_field and equals must be set together",
        ));
    }
    Ok(())
}

fn is_missing(params: &HashMap<String, String>, key: &str) -> bool {
    params.get(key).map_or(true, |value| value.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use contracts::{DeadLetterConfig, FilterConfig, SinkConfig};

    fn minimal_blueprint() -> PipelineBlueprint {
        serde_json::from_str(r#"{ "sink": { "name": "out", "sink_type": "log" } }"#).unwrap()
    }

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn field_of(err: ContractError) -> String {
        match err {
            ContractError::ConfigValidation { field, .. } => field,
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_valid_config() {
        assert!(validate(&minimal_blueprint()).is_ok());
    }

    #[test]
    fn test_zero_parallelism() {
        let mut bp = minimal_blueprint();
        bp.workers.parallelism = 0;
        assert_eq!(field_of(validate(&bp).unwrap_err()), "workers.parallelism");
    }

    #[test]
    fn test_zero_batch_size() {
        let mut bp = minimal_blueprint();
        bp.source.max_batch_size = 0;
        assert_eq!(field_of(validate(&bp).unwrap_err()), "source.max_batch_size");
    }

    #[test]
    fn test_jitter_out_of_range() {
        let mut bp = minimal_blueprint();
        bp.retry.jitter = 1.5;
        let err = validate(&bp).unwrap_err();
        assert!(err.to_string().contains("retry.jitter"), "got: {err}");
    }

    #[test]
    fn test_shrinking_factor() {
        let mut bp = minimal_blueprint();
        bp.retry.factor = 0.5;
        assert_eq!(field_of(validate(&bp).unwrap_err()), "retry.factor");
    }

    #[test]
    fn test_inverted_delays() {
        let mut bp = minimal_blueprint();
        bp.retry.initial_delay_ms = 5000;
        bp.retry.max_delay_ms = 100;
        let err = validate(&bp).unwrap_err().to_string();
        assert!(err.contains("must be <= max_delay_ms"), "got: {err}");
    }

    #[test]
    fn test_dead_letter_action_requires_destination() {
        let mut bp = minimal_blueprint();
        bp.retry.on_exhausted = ExhaustedAction::DeadLetter;
        assert_eq!(field_of(validate(&bp).unwrap_err()), "dead_letter");

        bp.dead_letter = Some(DeadLetterConfig {
            sink_type: SinkType::Log,
            params: HashMap::new(),
        });
        assert!(validate(&bp).is_ok());
    }

    #[test]
    fn test_dead_letter_type_and_params() {
        let mut bp = minimal_blueprint();
        bp.dead_letter = Some(DeadLetterConfig {
            sink_type: SinkType::Http,
            params: params(&[("url", "http://x")]),
        });
        assert_eq!(field_of(validate(&bp).unwrap_err()), "dead_letter.sink_type");

        bp.dead_letter = Some(DeadLetterConfig {
            sink_type: SinkType::Blob,
            params: HashMap::new(),
        });
        assert_eq!(
            field_of(validate(&bp).unwrap_err()),
            "dead_letter.params.base_path"
        );
    }

    #[test]
    fn test_empty_sink_name() {
        let mut bp = minimal_blueprint();
        bp.sink.name = "  ".to_string();
        let err = validate(&bp).unwrap_err().to_string();
        assert!(err.contains("cannot be empty"), "got: {err}");
    }

    #[test]
    fn test_required_sink_params() {
        let cases = [
            (SinkType::Kv, "sink.params.key_template"),
            (SinkType::Document, "sink.params.primary_key"),
            (SinkType::Blob, "sink.params.base_path"),
            (SinkType::Http, "sink.params.url"),
        ];
        for (sink_type, field) in cases {
            let mut bp = minimal_blueprint();
            bp.sink = SinkConfig {
                name: "out".to_string(),
                sink_type,
                params: HashMap::new(),
            };
            assert_eq!(field_of(validate(&bp).unwrap_err()), field);
        }

        let mut bp = minimal_blueprint();
        bp.sink = SinkConfig {
            name: "out".to_string(),
            sink_type: SinkType::Kv,
            params: params(&[("key_template", "user:{id}")]),
        };
        assert!(validate(&bp).is_ok());
    }

    #[test]
    fn test_filter_pairs() {
        let mut bp = minimal_blueprint();
        bp.filter = Some(FilterConfig {
            key_prefix: None,
            json_field: Some("type".to_string()),
            equals: None,
        });
        assert_eq!(
            field_of(validate(&bp).unwrap_err()),
            "filter.json_field / filter.equals"
        );

        bp.filter = Some(FilterConfig {
            key_prefix: Some("user:".to_string()),
            json_field: None,
            equals: None,
        });
        assert!(validate(&bp).is_ok());
    }
}
