use crate::types::{Condition, RuleError};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// 生成规则 id 的前缀
pub const GENERATED_RULE_PREFIX: &str = "eventTriggered";

/// 对 `{scope, condition, ...extra}` 的规范化 JSON 计算 BLAKE3 摘要 (hex)
///
/// 对象键排序后再序列化, 结果跨进程稳定。
pub fn content_hash(
    condition: &Condition,
    scope: &str,
    extra: &BTreeMap<String, Value>,
) -> Result<String, RuleError> {
    let mut document = Map::new();
    document.insert("condition".to_string(), serde_json::to_value(condition)?);
    document.insert("scope".to_string(), Value::String(scope.to_string()));
    for (key, value) in extra {
        document.insert(key.clone(), value.clone());
    }
    let canonical = serde_json::to_string(&canonicalize(Value::Object(document)))?;
    Ok(blake3::hash(canonical.as_bytes()).to_hex().to_string())
}

/// 生成规则的确定性 id
pub fn generated_rule_id(
    condition: &Condition,
    scope: &str,
    number_of_days: Option<i64>,
) -> Result<String, RuleError> {
    let mut extra = BTreeMap::new();
    extra.insert(
        "numberOfDays".to_string(),
        number_of_days.map(Value::from).unwrap_or(Value::Null),
    );
    Ok(format!("{}{}", GENERATED_RULE_PREFIX, content_hash(condition, scope, &extra)?))
}

fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<String, Value> = map
                .into_iter()
                .map(|(k, v)| (k, canonicalize(v)))
                .collect();
            Value::Object(sorted.into_iter().collect())
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}
