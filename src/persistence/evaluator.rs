use crate::condition::MAX_CONDITION_DEPTH;
use crate::types::{
    Condition, ParameterValue, BOOLEAN_CONDITION, EVENT_PROPERTY_CONDITION, EVENT_TYPE_CONDITION,
    MATCH_ALL_CONDITION, NOT_CONDITION, PAST_EVENT_CONDITION, PROFILE_PROPERTY_CONDITION,
    SESSION_PROPERTY_CONDITION, SOURCE_EVENT_PROPERTY_CONDITION,
};
use chrono::{DateTime, TimeDelta, Utc};
use serde_json::{Map, Value};
use std::cmp::Ordering;

/// 派生类型父条件中引用子条件参数的前缀
pub const PARAMETER_PREFIX: &str = "parameter::";

/// 在对象的 JSON 文档上对条件求值
pub fn evaluate(condition: &Condition, item: &Value) -> bool {
    evaluate_at(condition, item, 0)
}

fn evaluate_at(condition: &Condition, item: &Value, depth: usize) -> bool {
    if depth > MAX_CONDITION_DEPTH {
        return false;
    }
    match condition.type_id.as_str() {
        BOOLEAN_CONDITION => {
            let subs = condition.sub_conditions().unwrap_or_default();
            match condition.operator() {
                Some(op) if op.eq_ignore_ascii_case("or") => {
                    subs.iter().any(|c| evaluate_at(c, item, depth + 1))
                }
                _ => subs.iter().all(|c| evaluate_at(c, item, depth + 1)),
            }
        }
        NOT_CONDITION => condition
            .condition_parameter("subCondition")
            .map_or(false, |c| !evaluate_at(c, item, depth + 1)),
        MATCH_ALL_CONDITION => true,
        EVENT_TYPE_CONDITION => {
            let actual = item.get("eventType").and_then(Value::as_str);
            actual.is_some() && actual == condition.str_parameter("eventTypeId")
        }
        EVENT_PROPERTY_CONDITION
        | PROFILE_PROPERTY_CONDITION
        | SESSION_PROPERTY_CONDITION
        | SOURCE_EVENT_PROPERTY_CONDITION => compare_property(condition, item),
        PAST_EVENT_CONDITION => past_event_count_matches(condition, item),
        _ => match condition.condition_type.as_ref().and_then(|t| t.parent_condition.as_ref()) {
            Some(parent) => evaluate_at(&substitute(parent, condition), item, depth + 1),
            None => false,
        },
    }
}

/// 用子条件的参数替换父条件中的 "parameter::<name>"
pub fn substitute(parent: &Condition, child: &Condition) -> Condition {
    let mut out = parent.clone();
    substitute_in(&mut out, child);
    out
}

fn substitute_in(condition: &mut Condition, child: &Condition) {
    for value in condition.parameters.values_mut() {
        substitute_value(value, child);
    }
}

fn substitute_value(value: &mut ParameterValue, child: &Condition) {
    let replacement = match value {
        ParameterValue::Scalar(Value::String(s)) => s
            .strip_prefix(PARAMETER_PREFIX)
            .and_then(|name| child.parameter(name))
            .cloned(),
        _ => None,
    };
    if let Some(replacement) = replacement {
        *value = replacement;
        return;
    }
    match value {
        ParameterValue::Condition(c) => substitute_in(c, child),
        ParameterValue::List(items) => {
            for item in items {
                substitute_value(item, child);
            }
        }
        ParameterValue::Scalar(_) => {}
    }
}

/// 按点分路径读取 JSON 字段
pub fn lookup<'a>(item: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(item, |current, segment| current.get(segment))
}

/// 按点分路径写入 JSON 字段, 中间对象按需创建
pub fn assign(item: &mut Value, path: &str, value: Value) {
    let mut current = item;
    for segment in path.split('.') {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        current = &mut current[segment];
    }
    *current = value;
}

fn past_event_count_matches(condition: &Condition, item: &Value) -> bool {
    let Some(key) = condition.str_parameter("generatedPropertyKey") else {
        return false;
    };
    let count = lookup(item, "systemProperties.pastEvents")
        .and_then(|p| p.get(key))
        .and_then(Value::as_i64)
        .unwrap_or(0);
    let minimum = condition.i64_parameter("minimumEventCount").unwrap_or(1);
    let maximum = condition.i64_parameter("maximumEventCount");
    count >= minimum && maximum.map_or(true, |max| count <= max)
}

fn expected_value(condition: &Condition) -> Option<Value> {
    if let Some(expr) = condition.str_parameter("propertyValueDateExpr") {
        return parse_date_expr(expr).map(|d| Value::String(d.to_rfc3339()));
    }
    for name in [
        "propertyValue",
        "propertyValueInteger",
        "propertyValueDouble",
        "propertyValueDate",
    ] {
        if let Some(value) = condition.parameter(name).and_then(ParameterValue::as_scalar) {
            if let Value::String(s) = value {
                if let Some(date) = parse_date_expr(s) {
                    return Some(Value::String(date.to_rfc3339()));
                }
            }
            return Some(value.clone());
        }
    }
    None
}

fn expected_values(condition: &Condition) -> Vec<Value> {
    match condition.parameter("propertyValues") {
        Some(ParameterValue::List(items)) => items.iter().map(ParameterValue::to_json).collect(),
        Some(ParameterValue::Scalar(Value::Array(items))) => items.clone(),
        _ => Vec::new(),
    }
}

fn compare_property(condition: &Condition, item: &Value) -> bool {
    let Some(name) = condition.str_parameter("propertyName") else {
        return false;
    };
    let actual = lookup(item, name).filter(|v| !v.is_null());
    let operator = condition.str_parameter("comparisonOperator").unwrap_or("equals");

    match operator {
        "exists" => actual.map_or(false, |v| !matches!(v, Value::Array(a) if a.is_empty())),
        "missing" => actual.map_or(true, |v| matches!(v, Value::Array(a) if a.is_empty())),
        "equals" => actual.zip(expected_value(condition)).map_or(false, |(a, e)| any_equal(a, &e)),
        "notEquals" => !actual.zip(expected_value(condition)).map_or(false, |(a, e)| any_equal(a, &e)),
        "greaterThan" => ordered(actual, condition, |o| o == Ordering::Greater),
        "greaterThanOrEqualTo" => ordered(actual, condition, |o| o != Ordering::Less),
        "lessThan" => ordered(actual, condition, |o| o == Ordering::Less),
        "lessThanOrEqualTo" => ordered(actual, condition, |o| o != Ordering::Greater),
        "between" => {
            let bounds = expected_values(condition);
            match (actual, bounds.first(), bounds.get(1)) {
                (Some(a), Some(low), Some(high)) => {
                    compare_values(a, low).map_or(false, |o| o != Ordering::Less)
                        && compare_values(a, high).map_or(false, |o| o != Ordering::Greater)
                }
                _ => false,
            }
        }
        "contains" | "notContains" | "startsWith" | "endsWith" => {
            let found = actual.zip(expected_value(condition)).map_or(false, |(a, e)| {
                text_match(operator, a, &e)
            });
            if operator == "notContains" {
                !found
            } else {
                found
            }
        }
        "in" | "notIn" | "hasSomeOf" | "hasNoneOf" => {
            let expected = expected_values(condition);
            let found = actual.map_or(false, |a| expected.iter().any(|e| any_equal(a, e)));
            matches!(operator, "in" | "hasSomeOf") == found
        }
        "all" => {
            let expected = expected_values(condition);
            actual.map_or(false, |a| expected.iter().all(|e| any_equal(a, e)))
        }
        _ => false,
    }
}

fn ordered(actual: Option<&Value>, condition: &Condition, accept: impl Fn(Ordering) -> bool) -> bool {
    match (actual, expected_value(condition)) {
        (Some(a), Some(e)) => compare_values(a, &e).map_or(false, accept),
        _ => false,
    }
}

fn text_match(operator: &str, actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::Array(items), e) => operator != "startsWith"
            && operator != "endsWith"
            && items.iter().any(|i| values_equal(i, e)),
        (Value::String(a), Value::String(e)) => match operator {
            "startsWith" => a.starts_with(e.as_str()),
            "endsWith" => a.ends_with(e.as_str()),
            _ => a.contains(e.as_str()),
        },
        _ => false,
    }
}

/// 数组字段: 任一元素相等即可
fn any_equal(actual: &Value, expected: &Value) -> bool {
    match actual {
        Value::Array(items) => items.iter().any(|i| values_equal(i, expected)),
        other => values_equal(other, expected),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => compare_values(a, b) == Some(Ordering::Equal),
        (Value::String(x), Value::String(y)) if x != y => {
            compare_values(a, b) == Some(Ordering::Equal)
        }
        _ => a == b,
    }
}

pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => match (parse_date(x), parse_date(y)) {
            (Some(dx), Some(dy)) => Some(dx.cmp(&dy)),
            _ => Some(x.cmp(y)),
        },
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn parse_date(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s).ok().map(|d| d.with_timezone(&Utc))
}

/// `now`, `now-30d`, `now+2h` 形式的相对时间
pub fn parse_date_expr(expr: &str) -> Option<DateTime<Utc>> {
    let rest = expr.trim().strip_prefix("now")?;
    let now = Utc::now();
    if rest.is_empty() {
        return Some(now);
    }
    let (sign, rest) = if let Some(r) = rest.strip_prefix('-') {
        (-1, r)
    } else if let Some(r) = rest.strip_prefix('+') {
        (1, r)
    } else {
        return None;
    };
    let unit = rest.chars().last()?;
    let amount = &rest[..rest.len() - unit.len_utf8()];
    let amount: i64 = amount.parse().ok()?;
    // 超出可表示范围的偏移视为无法解析
    let offset = match unit {
        's' => TimeDelta::try_seconds(amount),
        'm' => TimeDelta::try_minutes(amount),
        'h' => TimeDelta::try_hours(amount),
        'd' => TimeDelta::try_days(amount),
        'w' => TimeDelta::try_weeks(amount),
        'M' => amount.checked_mul(30).and_then(TimeDelta::try_days),
        'y' => amount.checked_mul(365).and_then(TimeDelta::try_days),
        _ => return None,
    }?;
    if sign < 0 {
        now.checked_sub_signed(offset)
    } else {
        now.checked_add_signed(offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ConditionType;
    use serde_json::json;
    use std::sync::Arc;

    fn event() -> Value {
        json!({
            "itemId": "e1",
            "eventType": "view",
            "profileId": "p1",
            "timeStamp": Utc::now().to_rfc3339(),
            "properties": { "page": "/pricing", "tags": ["a", "b"], "amount": 42 },
            "target": { "itemId": "home", "itemType": "page" }
        })
    }

    #[test]
    fn boolean_not_and_type_conditions() {
        let view = Condition::event_type("view");
        let click = Condition::event_type("click");
        assert!(evaluate(&view, &event()));
        assert!(!evaluate(&Condition::and(vec![view.clone(), click.clone()]), &event()));
        assert!(evaluate(&Condition::boolean("or", vec![view, click.clone()]), &event()));
        assert!(evaluate(&Condition::not(click), &event()));
        assert!(evaluate(&Condition::new(MATCH_ALL_CONDITION), &event()));
    }

    #[test]
    fn property_operators() {
        let prop = |name: &str, op: &str, value: Value| {
            Condition::property(EVENT_PROPERTY_CONDITION, name, op, value)
        };
        assert!(evaluate(&prop("properties.page", "equals", json!("/pricing")), &event()));
        assert!(evaluate(&prop("properties.amount", "greaterThan", json!(40)), &event()));
        assert!(!evaluate(&prop("properties.amount", "lessThan", json!(40)), &event()));
        assert!(evaluate(&prop("properties.tags", "equals", json!("b")), &event()));
        assert!(evaluate(&prop("properties.page", "startsWith", json!("/pri")), &event()));
        assert!(evaluate(&prop("target.itemType", "equals", json!("page")), &event()));
        assert!(evaluate(&prop("properties.page", "exists", Value::Null), &event()));
        assert!(evaluate(&prop("properties.missing", "missing", Value::Null), &event()));
        assert!(evaluate(&prop("timeStamp", "greaterThan", json!("now-1d")), &event()));
        assert!(!evaluate(&prop("timeStamp", "lessThan", json!("now-1d")), &event()));
        assert!(!evaluate(&prop("properties.page", "unknownOperator", json!(1)), &event()));

        let within = Condition::new(EVENT_PROPERTY_CONDITION)
            .with_parameter("propertyName", "properties.page")
            .with_parameter("comparisonOperator", "in")
            .with_parameter("propertyValues", json!(["/pricing", "/home"]));
        assert!(evaluate(&within, &event()));
    }

    #[test]
    fn past_event_condition_reads_aggregated_count() {
        let profile = json!({ "itemId": "p1", "systemProperties": { "pastEvents": { "k1": 3 } } });
        let past = Condition::new(PAST_EVENT_CONDITION).with_parameter("generatedPropertyKey", "k1");
        assert!(evaluate(&past, &profile));
        assert!(!evaluate(&past.clone().with_parameter("maximumEventCount", 2), &profile));
        assert!(!evaluate(&past.with_parameter("minimumEventCount", 4), &profile));

        let unknown = Condition::new(PAST_EVENT_CONDITION).with_parameter("generatedPropertyKey", "k2");
        assert!(!evaluate(&unknown, &profile));
    }

    #[test]
    fn derived_types_substitute_parameters_into_parent() {
        let parent = Condition::property(EVENT_PROPERTY_CONDITION, "target.itemId", "equals", json!("parameter::pagePath"));
        let ty = ConditionType::new("pageViewCondition").with_parent(parent);
        let mut child = Condition::with_type(Arc::new(ty)).with_parameter("pagePath", "home");
        assert!(evaluate(&child, &event()));
        child.set_parameter("pagePath", "other");
        assert!(!evaluate(&child, &event()));
        // 未解析的未知类型不匹配
        assert!(!evaluate(&Condition::new("pageViewCondition"), &event()));
    }

    #[test]
    fn assign_creates_intermediate_objects() {
        let mut profile = json!({ "itemId": "p1" });
        assign(&mut profile, "systemProperties.pastEvents.k1", json!(5));
        assert_eq!(lookup(&profile, "systemProperties.pastEvents.k1"), Some(&json!(5)));
        assign(&mut profile, "systemProperties.pastEvents.k1", json!(6));
        assert_eq!(lookup(&profile, "systemProperties.pastEvents.k1"), Some(&json!(6)));
    }

    #[test]
    fn date_expressions() {
        let past = parse_date_expr("now-30d").unwrap();
        assert!(past < Utc::now());
        assert!(parse_date_expr("now+1h").unwrap() > Utc::now());
        assert!(parse_date_expr("yesterday").is_none());
        assert!(parse_date_expr("now-").is_none());
    }

    #[test]
    fn out_of_range_offsets_do_not_parse() {
        assert!(parse_date_expr("now-1000000000d").is_none());
        assert!(parse_date_expr("now-200000000000d").is_none());
        assert!(parse_date_expr("now+9223372036854775807y").is_none());

        let stamp = Condition::new(EVENT_PROPERTY_CONDITION)
            .with_parameter("propertyName", "timeStamp")
            .with_parameter("comparisonOperator", "greaterThan")
            .with_parameter("propertyValueDateExpr", "now-200000000000d");
        assert!(!evaluate(&stamp, &event()));
    }
}
