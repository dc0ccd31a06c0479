pub mod evaluator;
mod memory;

pub use memory::InMemoryPersistence;

use crate::types::{Condition, Event, Item, ItemType, PartialList, Profile, Rule, RuleError, Session};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;

/// 按字段取值分桶计数
#[derive(Debug, Clone)]
pub struct TermsAggregate {
    pub field: String,
}

impl TermsAggregate {
    pub fn new(field: &str) -> Self {
        Self {
            field: field.to_string(),
        }
    }
}

/// 存储与查询后端
#[async_trait]
pub trait Persistence: Send + Sync {
    async fn save(&self, item: &Item) -> Result<(), RuleError>;

    async fn load(&self, item_id: &str, item_type: ItemType) -> Result<Option<Item>, RuleError>;

    async fn remove(&self, item_id: &str, item_type: ItemType) -> Result<bool, RuleError>;

    /// `sort_by` 形如 "timeStamp:desc"; `size` 为 None 时返回全部
    async fn query(
        &self,
        condition: Option<&Condition>,
        sort_by: Option<&str>,
        item_type: ItemType,
        offset: usize,
        size: Option<usize>,
    ) -> Result<PartialList<Item>, RuleError>;

    async fn query_count(&self, condition: &Condition, item_type: ItemType) -> Result<u64, RuleError>;

    async fn aggregate_query(
        &self,
        condition: &Condition,
        aggregate: &TermsAggregate,
        item_type: ItemType,
    ) -> Result<BTreeMap<String, u64>, RuleError>;

    fn test_match(&self, condition: &Condition, item: &Item) -> bool;

    async fn save_query(&self, query_name: &str, condition: &Condition) -> Result<(), RuleError>;

    async fn remove_query(&self, query_name: &str) -> Result<(), RuleError>;

    /// 与事件匹配的已保存查询名
    async fn matching_saved_queries(&self, event: &Event) -> Result<Vec<String>, RuleError>;

    /// 按点分路径更新单个属性; 对象不存在时返回 false
    async fn update(
        &self,
        item_id: &str,
        item_type: ItemType,
        property_path: &str,
        value: Value,
    ) -> Result<bool, RuleError>;

    async fn load_rule(&self, rule_id: &str) -> Result<Option<Rule>, RuleError> {
        Ok(self.load(rule_id, ItemType::Rule).await?.and_then(Item::into_rule))
    }

    async fn load_profile(&self, profile_id: &str) -> Result<Option<Profile>, RuleError> {
        Ok(self
            .load(profile_id, ItemType::Profile)
            .await?
            .and_then(Item::into_profile))
    }

    async fn load_session(&self, session_id: &str) -> Result<Option<Session>, RuleError> {
        Ok(self
            .load(session_id, ItemType::Session)
            .await?
            .and_then(Item::into_session))
    }
}
