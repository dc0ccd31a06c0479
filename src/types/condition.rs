use super::{ConditionType, Tagged};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

pub const BOOLEAN_CONDITION: &str = "booleanCondition";
pub const NOT_CONDITION: &str = "notCondition";
pub const MATCH_ALL_CONDITION: &str = "matchAllCondition";
pub const EVENT_TYPE_CONDITION: &str = "eventTypeCondition";
pub const EVENT_PROPERTY_CONDITION: &str = "eventPropertyCondition";
pub const PROFILE_PROPERTY_CONDITION: &str = "profilePropertyCondition";
pub const SESSION_PROPERTY_CONDITION: &str = "sessionPropertyCondition";
pub const SOURCE_EVENT_PROPERTY_CONDITION: &str = "sourceEventPropertyCondition";
pub const PAST_EVENT_CONDITION: &str = "pastEventCondition";

pub const SUB_CONDITIONS: &str = "subConditions";
pub const OPERATOR: &str = "operator";

/// 条件参数值: 标量、子条件或列表
///
/// 反序列化时带 `conditionTypeId` 的对象被识别为子条件,
/// 其余 JSON 值原样保存为标量。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Condition(Box<Condition>),
    List(Vec<ParameterValue>),
    Scalar(Value),
}

impl ParameterValue {
    pub fn as_condition(&self) -> Option<&Condition> {
        match self {
            ParameterValue::Condition(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_scalar(&self) -> Option<&Value> {
        match self {
            ParameterValue::Scalar(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_scalar().and_then(Value::as_str)
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.as_scalar().and_then(Value::as_i64)
    }

    /// 转换为普通 JSON 值 (子条件按线格式输出)
    pub fn to_json(&self) -> Value {
        match self {
            ParameterValue::Scalar(v) => v.clone(),
            ParameterValue::Condition(c) => serde_json::to_value(c.as_ref()).unwrap_or(Value::Null),
            ParameterValue::List(items) => {
                Value::Array(items.iter().map(ParameterValue::to_json).collect())
            }
        }
    }

    /// 值中直接包含的条件 (含列表元素)
    pub fn conditions(&self) -> Vec<&Condition> {
        let mut out = Vec::new();
        self.collect_conditions(&mut out);
        out
    }

    pub fn conditions_mut(&mut self) -> Vec<&mut Condition> {
        let mut out = Vec::new();
        self.collect_conditions_mut(&mut out);
        out
    }

    fn collect_conditions<'a>(&'a self, out: &mut Vec<&'a Condition>) {
        match self {
            ParameterValue::Condition(c) => out.push(c),
            ParameterValue::List(items) => {
                for item in items {
                    item.collect_conditions(out);
                }
            }
            ParameterValue::Scalar(_) => {}
        }
    }

    fn collect_conditions_mut<'a>(&'a mut self, out: &mut Vec<&'a mut Condition>) {
        match self {
            ParameterValue::Condition(c) => out.push(c),
            ParameterValue::List(items) => {
                for item in items {
                    item.collect_conditions_mut(out);
                }
            }
            ParameterValue::Scalar(_) => {}
        }
    }
}

impl From<Condition> for ParameterValue {
    fn from(condition: Condition) -> Self {
        ParameterValue::Condition(Box::new(condition))
    }
}

impl From<Vec<Condition>> for ParameterValue {
    fn from(conditions: Vec<Condition>) -> Self {
        ParameterValue::List(conditions.into_iter().map(ParameterValue::from).collect())
    }
}

impl From<Value> for ParameterValue {
    fn from(value: Value) -> Self {
        ParameterValue::Scalar(value)
    }
}

impl From<&str> for ParameterValue {
    fn from(value: &str) -> Self {
        ParameterValue::Scalar(Value::String(value.to_string()))
    }
}

impl From<String> for ParameterValue {
    fn from(value: String) -> Self {
        ParameterValue::Scalar(Value::String(value))
    }
}

impl From<i64> for ParameterValue {
    fn from(value: i64) -> Self {
        ParameterValue::Scalar(Value::from(value))
    }
}

/// 条件树节点
///
/// `condition_type` 不参与序列化, 由 `conditionTypeId` 延迟解析得到。
#[derive(Clone, Serialize, Deserialize)]
pub struct Condition {
    #[serde(rename = "conditionTypeId")]
    pub type_id: String,
    #[serde(skip)]
    pub condition_type: Option<Arc<ConditionType>>,
    #[serde(rename = "parameterValues", default)]
    pub parameters: BTreeMap<String, ParameterValue>,
}

impl Condition {
    pub fn new(type_id: &str) -> Self {
        Self {
            type_id: type_id.to_string(),
            condition_type: None,
            parameters: BTreeMap::new(),
        }
    }

    pub fn with_type(condition_type: Arc<ConditionType>) -> Self {
        Self {
            type_id: condition_type.id.clone(),
            condition_type: Some(condition_type),
            parameters: BTreeMap::new(),
        }
    }

    pub fn with_parameter(mut self, name: &str, value: impl Into<ParameterValue>) -> Self {
        self.set_parameter(name, value);
        self
    }

    /// 布尔组合条件, `operator` 为 "and" 或 "or"
    pub fn boolean(operator: &str, sub_conditions: Vec<Condition>) -> Self {
        Condition::new(BOOLEAN_CONDITION)
            .with_parameter(OPERATOR, operator)
            .with_parameter(SUB_CONDITIONS, sub_conditions)
    }

    pub fn and(sub_conditions: Vec<Condition>) -> Self {
        Self::boolean("and", sub_conditions)
    }

    pub fn not(condition: Condition) -> Self {
        Condition::new(NOT_CONDITION).with_parameter("subCondition", condition)
    }

    /// 属性比较条件 (event/profile/session/sourceEvent 属性)
    pub fn property(type_id: &str, property: &str, operator: &str, value: Value) -> Self {
        Condition::new(type_id)
            .with_parameter("propertyName", property)
            .with_parameter("comparisonOperator", operator)
            .with_parameter("propertyValue", value)
    }

    pub fn event_type(event_type: &str) -> Self {
        Condition::new(EVENT_TYPE_CONDITION).with_parameter("eventTypeId", event_type)
    }

    pub fn set_parameter(&mut self, name: &str, value: impl Into<ParameterValue>) {
        self.parameters.insert(name.to_string(), value.into());
    }

    pub fn parameter(&self, name: &str) -> Option<&ParameterValue> {
        self.parameters.get(name)
    }

    pub fn str_parameter(&self, name: &str) -> Option<&str> {
        self.parameter(name).and_then(ParameterValue::as_str)
    }

    pub fn i64_parameter(&self, name: &str) -> Option<i64> {
        self.parameter(name).and_then(ParameterValue::as_i64)
    }

    pub fn condition_parameter(&self, name: &str) -> Option<&Condition> {
        self.parameter(name).and_then(ParameterValue::as_condition)
    }

    pub fn is_resolved(&self) -> bool {
        self.condition_type.is_some()
    }

    pub fn operator(&self) -> Option<&str> {
        self.str_parameter(OPERATOR)
    }

    /// `subConditions` 列表中的子条件; 没有该参数时返回 None
    pub fn sub_conditions(&self) -> Option<Vec<&Condition>> {
        match self.parameter(SUB_CONDITIONS)? {
            ParameterValue::List(items) => {
                Some(items.iter().filter_map(ParameterValue::as_condition).collect())
            }
            _ => None,
        }
    }

    /// 通过参数值可直接到达的子条件 (含列表中的条件)
    pub fn children(&self) -> Vec<&Condition> {
        let mut out = Vec::new();
        for value in self.parameters.values() {
            value.collect_conditions(&mut out);
        }
        out
    }

    pub fn children_mut(&mut self) -> Vec<&mut Condition> {
        let mut out = Vec::new();
        for value in self.parameters.values_mut() {
            value.collect_conditions_mut(&mut out);
        }
        out
    }

    /// 已解析类型是否带有该标签 (含 system tags)
    pub fn has_tag(&self, tag: &str) -> bool {
        self.condition_type
            .as_ref()
            .map(|t| t.has_tag(tag))
            .unwrap_or(false)
    }
}

impl PartialEq for Condition {
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id && self.parameters == other.parameters
    }
}

impl fmt::Debug for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Condition")
            .field("type_id", &self.type_id)
            .field("resolved", &self.is_resolved())
            .field("parameters", &self.parameters)
            .finish()
    }
}
