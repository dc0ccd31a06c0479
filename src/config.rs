use crate::types::{RuleError, SYSTEM_SCOPE, SYSTEM_TENANT};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// 引擎配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// 级联事件的最大递归深度
    pub max_recursion_depth: usize,
    pub system_scope: String,
    pub system_tenant: String,
    /// 回填时并发更新的 profile 数
    pub backfill_batch_size: usize,
    /// 插件定义根目录
    pub definitions_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_recursion_depth: 10,
            system_scope: SYSTEM_SCOPE.to_string(),
            system_tenant: SYSTEM_TENANT.to_string(),
            backfill_batch_size: 16,
            definitions_dir: None,
        }
    }
}

impl EngineConfig {
    pub fn from_json(content: &str) -> Result<Self, RuleError> {
        let config: Self = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, RuleError> {
        let content = tokio::fs::read_to_string(path.as_ref()).await?;
        Self::from_json(&content)
    }

    pub fn validate(&self) -> Result<(), RuleError> {
        if self.max_recursion_depth == 0 {
            return Err(RuleError::ConfigError(
                "max_recursion_depth 必须大于 0".to_string(),
            ));
        }
        if self.system_scope.trim().is_empty() {
            return Err(RuleError::ConfigError("system_scope 不能为空".to_string()));
        }
        if self.system_tenant.trim().is_empty() {
            return Err(RuleError::ConfigError("system_tenant 不能为空".to_string()));
        }
        if self.backfill_batch_size == 0 {
            return Err(RuleError::ConfigError(
                "backfill_batch_size 必须大于 0".to_string(),
            ));
        }
        Ok(())
    }
}
