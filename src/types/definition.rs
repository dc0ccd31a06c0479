use super::Condition;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

pub const CONDITION_TAG: &str = "condition";
pub const EVENT_CONDITION_TAG: &str = "eventCondition";
pub const PROFILE_CONDITION_TAG: &str = "profileCondition";
pub const SESSION_CONDITION_TAG: &str = "sessionCondition";
pub const SOURCE_EVENT_CONDITION_TAG: &str = "sourceEventCondition";
pub const TRACKED_CONDITION_TAG: &str = "trackedCondition";
pub const LOGICAL_TAG: &str = "logical";

/// 分类标签, 通过 parent_id 组成层级
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tag {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub parent_id: Option<String>,
    /// 子标签 id, 由注册表在全部标签加载后回填
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub sub_tags: BTreeSet<String>,
    #[serde(default)]
    pub plugin_id: Option<String>,
}

impl Tag {
    pub fn new(id: &str, parent_id: Option<&str>) -> Self {
        Self {
            id: id.to_string(),
            name: None,
            parent_id: parent_id.map(str::to_string),
            sub_tags: BTreeSet::new(),
            plugin_id: None,
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.as_deref().map_or(true, str::is_empty)
    }
}

/// 类型参数声明
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Parameter {
    pub id: String,
    #[serde(rename = "type", default)]
    pub value_type: Option<String>,
    #[serde(default)]
    pub multivalued: bool,
}

/// 带标签的插件类型
pub trait Tagged {
    fn tags(&self) -> &BTreeSet<String>;
    fn system_tags(&self) -> &BTreeSet<String>;

    fn has_tag(&self, tag: &str) -> bool {
        self.tags().contains(tag) || self.system_tags().contains(tag)
    }

    fn all_tags(&self) -> BTreeSet<String> {
        self.tags().union(self.system_tags()).cloned().collect()
    }
}

macro_rules! impl_tagged {
    ($($ty:ty),+) => {
        $(impl Tagged for $ty {
            fn tags(&self) -> &BTreeSet<String> {
                &self.tags
            }

            fn system_tags(&self) -> &BTreeSet<String> {
                &self.system_tags
            }
        })+
    };
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionType {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub system_tags: BTreeSet<String>,
    #[serde(default)]
    pub plugin_id: Option<String>,
    /// 派生类型: 求值时把自身参数代入父条件中的 "parameter::<name>"
    #[serde(default)]
    pub parent_condition: Option<Condition>,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
}

impl ConditionType {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            name: None,
            description: None,
            tags: BTreeSet::new(),
            system_tags: BTreeSet::new(),
            plugin_id: None,
            parent_condition: None,
            parameters: Vec::new(),
        }
    }

    pub fn with_tags(mut self, tags: &[&str]) -> Self {
        self.tags.extend(tags.iter().map(|t| t.to_string()));
        self
    }

    pub fn with_system_tags(mut self, tags: &[&str]) -> Self {
        self.system_tags.extend(tags.iter().map(|t| t.to_string()));
        self
    }

    pub fn with_parent(mut self, parent: Condition) -> Self {
        self.parent_condition = Some(parent);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionType {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub system_tags: BTreeSet<String>,
    #[serde(default)]
    pub plugin_id: Option<String>,
    /// 执行器 id, 对应 ActionDispatcher 中注册的 executor
    pub action_executor: String,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
}

impl ActionType {
    pub fn new(id: &str, action_executor: &str) -> Self {
        Self {
            id: id.to_string(),
            name: None,
            tags: BTreeSet::new(),
            system_tags: BTreeSet::new(),
            plugin_id: None,
            action_executor: action_executor.to_string(),
            parameters: Vec::new(),
        }
    }

    pub fn with_tags(mut self, tags: &[&str]) -> Self {
        self.tags.extend(tags.iter().map(|t| t.to_string()));
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValueType {
    pub id: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub system_tags: BTreeSet<String>,
    #[serde(default)]
    pub plugin_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyType {
    pub id: String,
    /// 属性归属的对象类型, 如 "profiles" / "sessions"
    #[serde(default)]
    pub target: String,
    #[serde(rename = "type", default)]
    pub value_type_id: Option<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub system_tags: BTreeSet<String>,
    #[serde(default)]
    pub plugin_id: Option<String>,
    #[serde(default)]
    pub automatic_mappings_from: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyMergeStrategyType {
    pub id: String,
    #[serde(default)]
    pub filter: Option<String>,
    #[serde(default)]
    pub plugin_id: Option<String>,
}

impl_tagged!(ConditionType, ActionType, ValueType, PropertyType);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TypeKind {
    Condition,
    Action,
    Value,
    Property,
    MergeStrategy,
}

impl fmt::Display for TypeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeKind::Condition => write!(f, "condition"),
            TypeKind::Action => write!(f, "action"),
            TypeKind::Value => write!(f, "value"),
            TypeKind::Property => write!(f, "property"),
            TypeKind::MergeStrategy => write!(f, "merger"),
        }
    }
}

/// 插件贡献的任意一种类型定义
#[derive(Debug, Clone)]
pub enum PluginType {
    Condition(Arc<ConditionType>),
    Action(Arc<ActionType>),
    Value(Arc<ValueType>),
    Property(Arc<PropertyType>),
    MergeStrategy(Arc<PropertyMergeStrategyType>),
}

impl PluginType {
    pub fn id(&self) -> &str {
        match self {
            PluginType::Condition(t) => &t.id,
            PluginType::Action(t) => &t.id,
            PluginType::Value(t) => &t.id,
            PluginType::Property(t) => &t.id,
            PluginType::MergeStrategy(t) => &t.id,
        }
    }

    pub fn kind(&self) -> TypeKind {
        match self {
            PluginType::Condition(_) => TypeKind::Condition,
            PluginType::Action(_) => TypeKind::Action,
            PluginType::Value(_) => TypeKind::Value,
            PluginType::Property(_) => TypeKind::Property,
            PluginType::MergeStrategy(_) => TypeKind::MergeStrategy,
        }
    }

    pub fn plugin_id(&self) -> Option<&str> {
        match self {
            PluginType::Condition(t) => t.plugin_id.as_deref(),
            PluginType::Action(t) => t.plugin_id.as_deref(),
            PluginType::Value(t) => t.plugin_id.as_deref(),
            PluginType::Property(t) => t.plugin_id.as_deref(),
            PluginType::MergeStrategy(t) => t.plugin_id.as_deref(),
        }
    }

    /// 注册表索引键: 属性类型按 target 区分
    pub fn index_key(&self) -> String {
        match self {
            PluginType::Property(t) => format!("{}/{}", t.target, t.id),
            other => other.id().to_string(),
        }
    }

    /// 常规标签与系统标签; 合并策略没有标签
    pub fn tag_sets(&self) -> Option<(&BTreeSet<String>, &BTreeSet<String>)> {
        match self {
            PluginType::Condition(t) => Some((t.tags(), t.system_tags())),
            PluginType::Action(t) => Some((t.tags(), t.system_tags())),
            PluginType::Value(t) => Some((t.tags(), t.system_tags())),
            PluginType::Property(t) => Some((t.tags(), t.system_tags())),
            PluginType::MergeStrategy(_) => None,
        }
    }

    pub(crate) fn set_plugin_id(&mut self, plugin_id: &str) {
        let plugin_id = Some(plugin_id.to_string());
        match self {
            PluginType::Condition(t) => Arc::make_mut(t).plugin_id = plugin_id,
            PluginType::Action(t) => Arc::make_mut(t).plugin_id = plugin_id,
            PluginType::Value(t) => Arc::make_mut(t).plugin_id = plugin_id,
            PluginType::Property(t) => Arc::make_mut(t).plugin_id = plugin_id,
            PluginType::MergeStrategy(t) => Arc::make_mut(t).plugin_id = plugin_id,
        }
    }
}
