use super::{ActionType, Condition, Metadata, ParameterValue};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

/// 规则动作, 与条件一样延迟解析 `actionTypeId`
#[derive(Clone, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "actionTypeId")]
    pub type_id: String,
    #[serde(skip)]
    pub action_type: Option<Arc<ActionType>>,
    #[serde(rename = "parameterValues", default)]
    pub parameters: BTreeMap<String, ParameterValue>,
}

impl Action {
    pub fn new(type_id: &str) -> Self {
        Self {
            type_id: type_id.to_string(),
            action_type: None,
            parameters: BTreeMap::new(),
        }
    }

    pub fn with_parameter(mut self, name: &str, value: impl Into<ParameterValue>) -> Self {
        self.parameters.insert(name.to_string(), value.into());
        self
    }

    pub fn parameter(&self, name: &str) -> Option<&ParameterValue> {
        self.parameters.get(name)
    }

    pub fn str_parameter(&self, name: &str) -> Option<&str> {
        self.parameter(name).and_then(ParameterValue::as_str)
    }

    pub fn condition_parameter(&self, name: &str) -> Option<&Condition> {
        self.parameter(name).and_then(ParameterValue::as_condition)
    }

    pub fn is_resolved(&self) -> bool {
        self.action_type.is_some()
    }
}

impl PartialEq for Action {
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id && self.parameters == other.parameters
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Action")
            .field("type_id", &self.type_id)
            .field("resolved", &self.is_resolved())
            .field("parameters", &self.parameters)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    pub metadata: Metadata,
    #[serde(default)]
    pub condition: Option<Condition>,
    #[serde(default)]
    pub actions: Vec<Action>,
    /// 引用该生成规则的分群/评分/目标 id; 为空时规则被删除
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub linked_items: BTreeSet<String>,
    #[serde(rename = "raiseEventOnlyOnceForSession", default)]
    pub raise_only_once_for_session: bool,
    #[serde(rename = "raiseEventOnlyOnceForProfile", default)]
    pub raise_only_once_for_profile: bool,
    #[serde(default)]
    pub priority: i32,
}

impl Rule {
    pub fn new(metadata: Metadata, condition: Condition, actions: Vec<Action>) -> Self {
        Self {
            metadata,
            condition: Some(condition),
            actions,
            linked_items: BTreeSet::new(),
            raise_only_once_for_session: false,
            raise_only_once_for_profile: false,
            priority: 0,
        }
    }

    pub fn id(&self) -> &str {
        &self.metadata.id
    }
}
