use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// 全局作用域, 其中的规则对所有作用域的事件生效
pub const SYSTEM_SCOPE: &str = "systemscope";

/// 持久化对象 (规则/分群/目标/评分) 的身份与生命周期信息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub system_tags: BTreeSet<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub hidden: bool,
    /// 条件/动作类型未能全部解析; 对象保留但不参与匹配
    #[serde(default)]
    pub missing_plugins: bool,
    #[serde(default)]
    pub read_only: bool,
}

fn default_true() -> bool {
    true
}

impl Metadata {
    pub fn new(scope: &str, id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: Some(name.to_string()),
            description: None,
            scope: Some(scope.to_string()),
            tags: BTreeSet::new(),
            system_tags: BTreeSet::new(),
            enabled: true,
            hidden: false,
            missing_plugins: false,
            read_only: false,
        }
    }

    pub fn scope(&self) -> &str {
        self.scope.as_deref().unwrap_or(SYSTEM_SCOPE)
    }

    /// 启用且类型完整时才参与评估
    pub fn is_active(&self) -> bool {
        self.enabled && !self.missing_plugins
    }
}
