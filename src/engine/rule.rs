use super::ActionDispatcher;
use crate::condition::{rule_type_ids, ConditionResolver};
use crate::config::EngineConfig;
use crate::event::EventListener;
use crate::persistence::Persistence;
use crate::types::{
    Condition, DispatchContext, Event, EventChanges, Item, ItemRef, ItemType, Metadata, Rule,
    RuleError, EVENT_CONDITION_TAG, EVENT_PROPERTY_CONDITION, PROFILE_CONDITION_TAG,
    RULE_FIRED_EVENT, SESSION_CONDITION_TAG, SOURCE_EVENT_PROPERTY_CONDITION,
    TRACKED_CONDITION_TAG,
};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// 规则事件子条件在持久层中的查询名前缀
pub const RULE_QUERY_PREFIX: &str = "rule_";

/// 已索引的活动规则及安装时抽取的子条件
#[derive(Debug)]
pub struct IndexedRule {
    pub rule: Rule,
    pub event_condition: Condition,
    pub profile_condition: Option<Condition>,
    pub session_condition: Option<Condition>,
    pub source_conditions: Vec<Condition>,
    pub tracked_condition: Option<Condition>,
}

impl IndexedRule {
    pub fn id(&self) -> &str {
        self.rule.id()
    }
}

/// 规则引擎
///
/// 安装时抽取 `eventCondition` 子树保存为持久层查询, 分发时只评估
/// 查询命中的候选规则。规则状态: 未索引 → 已索引(活动) ⇄ missingPlugins。
pub struct RuleEngine {
    resolver: ConditionResolver,
    persistence: Arc<dyn Persistence>,
    dispatcher: Arc<ActionDispatcher>,
    config: EngineConfig,
    rules: RwLock<HashMap<String, Arc<IndexedRule>>>,
}

fn query_name(rule_id: &str) -> String {
    format!("{}{}", RULE_QUERY_PREFIX, rule_id)
}

impl RuleEngine {
    pub fn new(
        resolver: ConditionResolver,
        persistence: Arc<dyn Persistence>,
        dispatcher: Arc<ActionDispatcher>,
        config: EngineConfig,
    ) -> Self {
        Self {
            resolver,
            persistence,
            dispatcher,
            config,
            rules: RwLock::new(HashMap::new()),
        }
    }

    pub fn dispatcher(&self) -> &Arc<ActionDispatcher> {
        &self.dispatcher
    }

    /// 安装 (或重新安装) 规则并持久化
    ///
    /// 类型无法全部解析时以 `missing_plugins = true` 保存, 不建立索引。
    /// 返回实际保存的规则。
    pub async fn install(&self, mut rule: Rule) -> Result<Rule, RuleError> {
        if rule.metadata.scope.is_none() {
            rule.metadata.scope = Some(self.config.system_scope.clone());
        }

        if !rule.metadata.enabled {
            self.unindex(rule.id()).await?;
            self.persistence.save(&Item::Rule(rule.clone())).await?;
            debug!(rule_id = %rule.id(), "Rule saved disabled");
            return Ok(rule);
        }

        if !self.resolver.resolve_rule(&mut rule) {
            let was_active = !rule.metadata.missing_plugins;
            rule.metadata.missing_plugins = true;
            self.unindex(rule.id()).await?;
            self.persistence.save(&Item::Rule(rule.clone())).await?;
            if was_active {
                info!(rule_id = %rule.id(), "Rule disabled, missing plugins");
            }
            return Ok(rule);
        }
        if rule.metadata.missing_plugins {
            info!(rule_id = %rule.id(), "Rule re-enabled, all types resolved");
        }
        rule.metadata.missing_plugins = false;

        let indexed = match self.index_entry(&rule) {
            Ok(indexed) => indexed,
            Err(e) => {
                self.unindex(rule.id()).await?;
                return Err(e);
            }
        };
        match indexed {
            Some(indexed) => {
                self.persistence
                    .save_query(&query_name(rule.id()), &indexed.event_condition)
                    .await?;
                self.rules
                    .write()
                    .await
                    .insert(rule.id().to_string(), Arc::new(indexed));
                debug!(rule_id = %rule.id(), "Rule indexed");
            }
            None => {
                // 没有事件子条件的规则永不触发
                warn!(rule_id = %rule.id(), "Rule has no eventCondition, not indexed");
                self.unindex(rule.id()).await?;
            }
        }

        self.persistence.save(&Item::Rule(rule.clone())).await?;
        Ok(rule)
    }

    fn index_entry(&self, rule: &Rule) -> Result<Option<IndexedRule>, RuleError> {
        let Some(condition) = &rule.condition else {
            return Ok(None);
        };
        let Some(event_condition) = self.resolver.extract_by_tag(condition, EVENT_CONDITION_TAG)? else {
            return Ok(None);
        };
        Ok(Some(IndexedRule {
            rule: rule.clone(),
            event_condition,
            profile_condition: self.resolver.extract_by_tag(condition, PROFILE_CONDITION_TAG)?,
            session_condition: self.resolver.extract_by_tag(condition, SESSION_CONDITION_TAG)?,
            source_conditions: self
                .resolver
                .extract_by_type(condition, SOURCE_EVENT_PROPERTY_CONDITION),
            tracked_condition: self.resolver.extract_by_tag(condition, TRACKED_CONDITION_TAG)?,
        }))
    }

    async fn unindex(&self, rule_id: &str) -> Result<bool, RuleError> {
        let removed = self.rules.write().await.remove(rule_id).is_some();
        self.persistence.remove_query(&query_name(rule_id)).await?;
        Ok(removed)
    }

    /// 移除索引; `delete` 为 true 时删除存储中的规则, 否则以禁用状态保存
    pub async fn uninstall(&self, rule_id: &str, delete: bool) -> Result<bool, RuleError> {
        let was_indexed = self.unindex(rule_id).await?;
        if delete {
            let removed = self.persistence.remove(rule_id, ItemType::Rule).await?;
            info!(rule_id = %rule_id, "Rule removed");
            return Ok(removed || was_indexed);
        }
        match self.persistence.load_rule(rule_id).await? {
            Some(mut rule) => {
                rule.metadata.enabled = false;
                self.persistence.save(&Item::Rule(rule)).await?;
                info!(rule_id = %rule_id, "Rule disabled");
                Ok(true)
            }
            None => Ok(was_indexed),
        }
    }

    /// 启动时重建全部已存储规则的索引, 返回活动规则数
    pub async fn load_rules(&self) -> Result<usize, RuleError> {
        let rules = self
            .persistence
            .query(None, Some("priority"), ItemType::Rule, 0, None)
            .await?;
        for rule in rules.list.into_iter().filter_map(Item::into_rule) {
            let rule_id = rule.id().to_string();
            if let Err(e) = self.install(rule).await {
                error!(rule_id = %rule_id, error = %e, "Failed to install stored rule");
            }
        }
        let active = self.rules.read().await.len();
        info!(active, "Rules loaded");
        Ok(active)
    }

    /// 新类型注册后重新安装 missingPlugins 规则, 返回恢复的规则 id
    pub async fn on_types_added(&self) -> Result<Vec<String>, RuleError> {
        let stored = self.persistence.query(None, None, ItemType::Rule, 0, None).await?;
        let mut restored = Vec::new();
        for rule in stored.list.into_iter().filter_map(Item::into_rule) {
            if !rule.metadata.enabled || !rule.metadata.missing_plugins {
                continue;
            }
            let rule_id = rule.id().to_string();
            match self.install(rule).await {
                Ok(rule) if !rule.metadata.missing_plugins => restored.push(rule_id),
                Ok(_) => {}
                Err(e) => error!(rule_id = %rule_id, error = %e, "Failed to reinstall rule"),
            }
        }
        Ok(restored)
    }

    /// 类型注销后, 引用这些类型且无法再解析的活动规则转为 missingPlugins
    pub async fn on_types_removed(&self, removed: &BTreeSet<String>) -> Result<Vec<String>, RuleError> {
        let affected: Vec<Rule> = self
            .rules
            .read()
            .await
            .values()
            .filter(|indexed| !rule_type_ids(&indexed.rule).is_disjoint(removed))
            .map(|indexed| indexed.rule.clone())
            .collect();

        let mut disabled = Vec::new();
        for rule in affected {
            let rule_id = rule.id().to_string();
            let rule = self.install(rule).await?;
            if rule.metadata.missing_plugins {
                disabled.push(rule_id);
            }
        }
        Ok(disabled)
    }

    pub async fn get_rule(&self, rule_id: &str) -> Result<Option<Rule>, RuleError> {
        let Some(mut rule) = self.persistence.load_rule(rule_id).await? else {
            return Ok(None);
        };
        self.resolver.resolve_rule(&mut rule);
        Ok(Some(rule))
    }

    pub async fn rule_metadatas(&self) -> Result<Vec<Metadata>, RuleError> {
        let rules = self.persistence.query(None, None, ItemType::Rule, 0, None).await?;
        Ok(rules
            .list
            .into_iter()
            .filter_map(Item::into_rule)
            .map(|rule| rule.metadata)
            .collect())
    }

    pub async fn is_active(&self, rule_id: &str) -> bool {
        self.rules.read().await.contains_key(rule_id)
    }

    pub async fn active_rule_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.rules.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// 活动规则的 `trackedCondition` 子条件; 有 source 条件的规则需与 `source` 匹配
    pub async fn tracked_conditions(&self, source: Option<&Item>) -> Vec<Condition> {
        let rules: Vec<Arc<IndexedRule>> = self.rules.read().await.values().cloned().collect();
        let mut tracked = Vec::new();
        for indexed in rules {
            let Some(condition) = &indexed.tracked_condition else {
                continue;
            };
            let matches_source = match source {
                Some(source) if !indexed.source_conditions.is_empty() => indexed
                    .source_conditions
                    .iter()
                    .all(|c| self.persistence.test_match(c, source)),
                _ => true,
            };
            if matches_source && !tracked.contains(condition) {
                tracked.push(condition.clone());
            }
        }
        tracked
    }

    /// 候选规则经作用域、来源、只触发一次、profile/session 条件过滤后的结果
    pub async fn matching_rules(&self, event: &Event) -> Result<Vec<Arc<IndexedRule>>, RuleError> {
        let query_names = self.persistence.matching_saved_queries(event).await?;
        let mut candidates: Vec<Arc<IndexedRule>> = {
            let rules = self.rules.read().await;
            query_names
                .iter()
                .filter_map(|name| name.strip_prefix(RULE_QUERY_PREFIX))
                .filter_map(|id| rules.get(id).cloned())
                .collect()
        };
        candidates.sort_by(|a, b| {
            a.rule
                .priority
                .cmp(&b.rule.priority)
                .then_with(|| a.id().cmp(b.id()))
        });

        let mut raised_for_profile = None;
        let mut raised_for_session = None;
        let mut matched = Vec::new();
        for indexed in candidates {
            let scope = indexed.rule.metadata.scope();
            if scope != self.config.system_scope && scope != event.scope() {
                continue;
            }
            if !self.source_matches(&indexed, event) {
                continue;
            }

            if indexed.rule.raise_only_once_for_profile {
                if raised_for_profile.is_none() {
                    raised_for_profile = Some(self.already_raised(event, false).await?);
                }
                if raised_for_profile == Some(true) {
                    debug!(rule_id = %indexed.id(), "Event already raised for profile");
                    continue;
                }
            } else if indexed.rule.raise_only_once_for_session {
                if raised_for_session.is_none() {
                    raised_for_session = Some(self.already_raised(event, true).await?);
                }
                if raised_for_session == Some(true) {
                    debug!(rule_id = %indexed.id(), "Event already raised for session");
                    continue;
                }
            }

            if let Some(condition) = &indexed.profile_condition {
                let matches = event
                    .profile
                    .as_ref()
                    .map_or(false, |p| self.persistence.test_match(condition, &Item::Profile(p.clone())));
                if !matches {
                    continue;
                }
            }
            if let Some(condition) = &indexed.session_condition {
                let matches = event
                    .session
                    .as_ref()
                    .map_or(false, |s| self.persistence.test_match(condition, &Item::Session(s.clone())));
                if !matches {
                    continue;
                }
            }
            matched.push(indexed);
        }
        Ok(matched)
    }

    fn source_matches(&self, indexed: &IndexedRule, event: &Event) -> bool {
        if indexed.source_conditions.is_empty() {
            return true;
        }
        let Some(source) = &event.source else {
            return false;
        };
        let source = Item::Custom(source.clone());
        indexed
            .source_conditions
            .iter()
            .all(|c| self.persistence.test_match(c, &source))
    }

    /// 同一 profile (或 session) 是否已有相同类型与目标的其他事件
    async fn already_raised(&self, event: &Event, for_session: bool) -> Result<bool, RuleError> {
        let (field, owner) = if for_session {
            ("sessionId", event.session_id.as_deref())
        } else {
            ("profileId", event.profile_id.as_deref())
        };
        let Some(owner) = owner else {
            return Ok(false);
        };

        let mut conditions = vec![
            Condition::event_type(&event.event_type),
            Condition::property(EVENT_PROPERTY_CONDITION, field, "equals", Value::from(owner)),
            Condition::not(Condition::property(
                EVENT_PROPERTY_CONDITION,
                "itemId",
                "equals",
                Value::from(event.item_id.as_str()),
            )),
        ];
        if let Some(target) = &event.target {
            conditions.push(Condition::property(
                EVENT_PROPERTY_CONDITION,
                "target.itemId",
                "equals",
                Value::from(target.item_id.as_str()),
            ));
            conditions.push(Condition::property(
                EVENT_PROPERTY_CONDITION,
                "target.itemType",
                "equals",
                Value::from(target.item_type.as_str()),
            ));
        }
        let count = self
            .persistence
            .query_count(&Condition::and(conditions), ItemType::Event)
            .await?;
        Ok(count > 0)
    }
}

#[async_trait]
impl EventListener for RuleEngine {
    fn can_handle(&self, _event: &Event) -> bool {
        true
    }

    async fn on_event<'a>(&self, event: &mut Event, ctx: &DispatchContext<'a>) -> EventChanges {
        let rules = match self.matching_rules(event).await {
            Ok(rules) => rules,
            Err(e) => {
                error!(event_type = %event.event_type, error = %e, "Failed to match rules");
                return EventChanges::ERROR;
            }
        };

        let mut changes = EventChanges::NO_CHANGE;
        for indexed in rules {
            debug!(rule_id = %indexed.id(), event_type = %event.event_type, event_id = %event.item_id, "Fired rule");
            #[cfg(feature = "metrics")]
            crate::metrics::RULES_FIRED
                .with_label_values(&[indexed.rule.metadata.scope()])
                .inc();

            for action in &indexed.rule.actions {
                changes |= self.dispatcher.execute(action, event, ctx).await;
            }

            let mut fired = event.derive(RULE_FIRED_EVENT, Some(ItemRef::new("rule", indexed.id())));
            changes |= ctx.send(&mut fired).await;
            event.absorb(fired);
        }
        changes
    }
}
