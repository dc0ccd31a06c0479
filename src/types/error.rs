use thiserror::Error;

#[derive(Error, Debug)]
pub enum RuleError {
    /// 对非 AND 布尔节点做部分标签抽取
    #[error("不支持的条件抽取: 标签 {tag} 在 {operator} 节点下只部分匹配")]
    UnsupportedExtraction { tag: String, operator: String },

    #[error("持久化失败: {0}")]
    Persistence(String),

    #[error("定义文件无效: {0}")]
    InvalidDefinition(String),

    #[error("配置错误: {0}")]
    ConfigError(String),

    #[error("序列化失败: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn messages_carry_their_context() {
        let err = RuleError::UnsupportedExtraction {
            tag: "eventCondition".to_string(),
            operator: "or".to_string(),
        };
        assert_eq!(err.to_string(), "不支持的条件抽取: 标签 eventCondition 在 or 节点下只部分匹配");

        let err: RuleError = serde_json::from_str::<serde_json::Value>("{").unwrap_err().into();
        assert!(matches!(err, RuleError::Serialization(_)));
    }
}
