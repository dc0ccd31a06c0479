use super::RuleEngine;
use crate::actions::past_event_window;
use crate::condition::{generated_rule_id, ConditionResolver};
use crate::config::EngineConfig;
use crate::persistence::{Persistence, TermsAggregate};
use crate::types::{
    Action, Condition, Item, ItemType, Metadata, Rule, RuleError, EVENT_CONDITION_TAG,
    PROFILE_CONDITION_TAG,
};
use futures::stream::{self, StreamExt};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

/// 生成规则使用的动作类型
pub const EVENT_OCCURRENCE_ACTION: &str = "setEventOccurenceCountAction";

/// 条件树中一个嵌套历史事件条件: 事件子条件及携带聚合参数的父条件
#[derive(Debug, Clone)]
struct PastEventLink {
    key: String,
    event_condition: Condition,
    parent: Condition,
}

/// 为分群/评分/目标中嵌套的历史事件条件生成共享的计数规则
///
/// 规则 id 由 `{scope, eventCondition, numberOfDays}` 的内容摘要决定,
/// 相同条件的多个所有者共用一条规则, 通过 `linked_items` 计数。
pub struct AutoRuleGenerator {
    resolver: ConditionResolver,
    persistence: Arc<dyn Persistence>,
    rules: Arc<RuleEngine>,
    config: EngineConfig,
    // 串行化 linked_items 的读-改-装载
    link_lock: Mutex<()>,
}

impl AutoRuleGenerator {
    pub fn new(
        resolver: ConditionResolver,
        persistence: Arc<dyn Persistence>,
        rules: Arc<RuleEngine>,
        config: EngineConfig,
    ) -> Self {
        Self {
            resolver,
            persistence,
            rules,
            config,
            link_lock: Mutex::new(()),
        }
    }

    /// 为 `owner` 同步生成规则, 并把 `generatedPropertyKey` 写回父条件
    ///
    /// 返回条件树当前引用的全部生成规则 id。
    pub async fn sync_generated_rules(
        &self,
        owner: &Metadata,
        condition: &mut Condition,
    ) -> Result<BTreeSet<String>, RuleError> {
        let scope = owner.scope().to_string();
        let mut links = Vec::new();
        self.collect_links(condition, &scope, 0, &mut links)?;

        let mut keys = BTreeSet::new();
        for link in links {
            keys.insert(link.key.clone());
            let created = {
                let _guard = self.link_lock.lock().await;
                match self.persistence.load_rule(&link.key).await? {
                    Some(mut rule) => {
                        if rule.linked_items.insert(owner.id.clone()) {
                            debug!(rule_id = %link.key, owner = %owner.id, "Linked owner to generated rule");
                            self.rules.install(rule).await?;
                        }
                        false
                    }
                    None => {
                        self.rules.install(self.generated_rule(owner, &link)).await?;
                        info!(rule_id = %link.key, owner = %owner.id, "Generated past event rule");
                        true
                    }
                }
            };
            if created {
                self.backfill_existing_profiles(&link.event_condition, &link.parent)
                    .await?;
            }
        }
        Ok(keys)
    }

    fn collect_links(
        &self,
        node: &mut Condition,
        scope: &str,
        depth: usize,
        links: &mut Vec<PastEventLink>,
    ) -> Result<(), RuleError> {
        if depth > crate::condition::MAX_CONDITION_DEPTH {
            return Ok(());
        }
        let number_of_days = node.i64_parameter("numberOfDays");
        let mut found = Vec::new();
        for child in node.children_mut() {
            if self.is_past_event_source(child) {
                let key = generated_rule_id(child, scope, number_of_days)?;
                found.push((key, child.clone()));
            } else {
                self.collect_links(child, scope, depth + 1, links)?;
            }
        }
        for (key, event_condition) in found {
            node.set_parameter("generatedPropertyKey", key.as_str());
            links.push(PastEventLink {
                key,
                event_condition,
                parent: node.clone(),
            });
        }
        Ok(())
    }

    fn is_past_event_source(&self, condition: &Condition) -> bool {
        self.resolver.carries_tag(condition, EVENT_CONDITION_TAG)
            && !self.resolver.carries_tag(condition, PROFILE_CONDITION_TAG)
    }

    fn generated_rule(&self, owner: &Metadata, link: &PastEventLink) -> Rule {
        let owner_name = owner.name.as_deref().unwrap_or(&owner.id);
        let mut metadata = Metadata::new(
            owner.scope(),
            &link.key,
            &format!("Auto generated rule for {}", owner_name),
        );
        metadata.hidden = true;
        let action = Action::new(EVENT_OCCURRENCE_ACTION)
            .with_parameter("pastEventCondition", link.parent.clone());
        let mut rule = Rule::new(metadata, link.event_condition.clone(), vec![action]);
        rule.linked_items.insert(owner.id.clone());
        rule
    }

    /// 按 profile 聚合历史事件数并写入 `systemProperties.pastEvents.<key>`
    ///
    /// 重复执行结果收敛, 并发触发无需互斥。
    pub async fn backfill_existing_profiles(
        &self,
        event_condition: &Condition,
        parent: &Condition,
    ) -> Result<usize, RuleError> {
        let Some(key) = parent.str_parameter("generatedPropertyKey") else {
            return Ok(0);
        };
        let mut conditions = vec![event_condition.clone()];
        conditions.extend(past_event_window(parent));
        let counts = self
            .persistence
            .aggregate_query(
                &Condition::and(conditions),
                &TermsAggregate::new("profileId"),
                ItemType::Event,
            )
            .await?;

        let path = format!("systemProperties.pastEvents.{}", key);
        let persistence = &self.persistence;
        let path = &path;
        let updated = stream::iter(counts.into_iter().filter(|(id, _)| !id.starts_with('_')))
            .map(|(profile_id, count)| async move {
                match persistence
                    .update(&profile_id, ItemType::Profile, path, Value::from(count))
                    .await
                {
                    Ok(updated) => updated,
                    Err(e) => {
                        error!(profile = %profile_id, error = %e, "Failed to backfill past event count");
                        false
                    }
                }
            })
            .buffer_unordered(self.config.backfill_batch_size)
            .filter(|updated| futures::future::ready(*updated))
            .count()
            .await;
        info!(key = %key, updated, "Profiles past event condition updated");
        Ok(updated)
    }

    /// 解除 `owner_id` 与不在 `keep` 中的生成规则的关联, 无所有者的规则被删除
    ///
    /// 返回被删除的规则 id。
    pub async fn retract_owner(
        &self,
        owner_id: &str,
        keep: &BTreeSet<String>,
    ) -> Result<Vec<String>, RuleError> {
        let _guard = self.link_lock.lock().await;
        let stored = self.persistence.query(None, None, ItemType::Rule, 0, None).await?;
        let mut deleted = Vec::new();
        for mut rule in stored.list.into_iter().filter_map(Item::into_rule) {
            if keep.contains(rule.id()) || !rule.linked_items.remove(owner_id) {
                continue;
            }
            if rule.linked_items.is_empty() {
                self.rules.uninstall(rule.id(), true).await?;
                info!(rule_id = %rule.id(), "Generated rule removed, no owners left");
                deleted.push(rule.id().to_string());
            } else {
                debug!(rule_id = %rule.id(), owner = %owner_id, "Owner unlinked from generated rule");
                self.rules.install(rule).await?;
            }
        }
        Ok(deleted)
    }

    /// 与 `owner_id` 关联的生成规则 id
    pub async fn linked_rules(&self, owner_id: &str) -> Result<Vec<String>, RuleError> {
        let stored = self.persistence.query(None, None, ItemType::Rule, 0, None).await?;
        Ok(stored
            .list
            .into_iter()
            .filter_map(Item::into_rule)
            .filter(|rule| rule.linked_items.contains(owner_id))
            .map(|rule| rule.id().to_string())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{SetEventOccurrenceCountAction, SET_EVENT_OCCURRENCE_COUNT_EXECUTOR};
    use crate::engine::ActionDispatcher;
    use crate::persistence::InMemoryPersistence;
    use crate::registry::TypeRegistry;
    use crate::types::{
        ActionType, ConditionType, Event, PluginType, Profile, BOOLEAN_CONDITION,
        EVENT_TYPE_CONDITION, PAST_EVENT_CONDITION,
    };
    use pretty_assertions::assert_eq;

    struct Fixture {
        store: Arc<InMemoryPersistence>,
        rules: Arc<RuleEngine>,
        generator: AutoRuleGenerator,
    }

    async fn fixture() -> Fixture {
        let registry = Arc::new(TypeRegistry::default());
        registry.on_load(
            "base",
            registry.system_tenant(),
            vec![],
            vec![
                PluginType::Condition(Arc::new(
                    ConditionType::new(BOOLEAN_CONDITION)
                        .with_system_tags(&[EVENT_CONDITION_TAG, PROFILE_CONDITION_TAG]),
                )),
                PluginType::Condition(Arc::new(
                    ConditionType::new(EVENT_TYPE_CONDITION).with_system_tags(&[EVENT_CONDITION_TAG]),
                )),
                PluginType::Condition(Arc::new(
                    ConditionType::new(PAST_EVENT_CONDITION).with_system_tags(&[PROFILE_CONDITION_TAG]),
                )),
                PluginType::Action(Arc::new(ActionType::new(
                    EVENT_OCCURRENCE_ACTION,
                    SET_EVENT_OCCURRENCE_COUNT_EXECUTOR,
                ))),
            ],
        );
        let store = Arc::new(InMemoryPersistence::new());
        let dispatcher = Arc::new(ActionDispatcher::new());
        dispatcher
            .register("base", SET_EVENT_OCCURRENCE_COUNT_EXECUTOR, Arc::new(SetEventOccurrenceCountAction))
            .await;
        let resolver = ConditionResolver::new(registry.clone(), registry.system_tenant());
        let rules = Arc::new(RuleEngine::new(
            resolver.clone(),
            store.clone(),
            dispatcher,
            EngineConfig::default(),
        ));
        let generator = AutoRuleGenerator::new(resolver, store.clone(), rules.clone(), EngineConfig::default());
        Fixture {
            store,
            rules,
            generator,
        }
    }

    fn bought_twice() -> Condition {
        Condition::and(vec![Condition::new(PAST_EVENT_CONDITION)
            .with_parameter("eventCondition", Condition::event_type("purchase"))
            .with_parameter("numberOfDays", 30)
            .with_parameter("minimumEventCount", 2)])
    }

    fn generated_key(condition: &Condition) -> Option<String> {
        condition.sub_conditions()?[0]
            .str_parameter("generatedPropertyKey")
            .map(str::to_string)
    }

    #[test_log::test(tokio::test)]
    async fn identical_conditions_share_one_rule() {
        let f = fixture().await;
        let mut first = bought_twice();
        let mut second = bought_twice();

        let a = f
            .generator
            .sync_generated_rules(&Metadata::new("shop", "buyers", "Buyers"), &mut first)
            .await
            .unwrap();
        let b = f
            .generator
            .sync_generated_rules(&Metadata::new("shop", "loyal", "Loyal"), &mut second)
            .await
            .unwrap();

        assert_eq!(a, b);
        assert_eq!(f.store.count(ItemType::Rule), 1);
        let key = a.iter().next().unwrap();
        assert!(key.starts_with("eventTriggered"));
        assert_eq!(generated_key(&first).as_deref(), Some(key.as_str()));

        let rule = f.store.load_rule(key).await.unwrap().unwrap();
        assert!(rule.metadata.hidden);
        assert_eq!(
            rule.linked_items.into_iter().collect::<Vec<_>>(),
            vec!["buyers".to_string(), "loyal".to_string()]
        );
        assert!(f.rules.is_active(key).await);
    }

    #[test_log::test(tokio::test)]
    async fn concurrent_owners_keep_both_links() {
        let f = fixture().await;
        let buyers = Metadata::new("shop", "buyers", "Buyers");
        let loyal = Metadata::new("shop", "loyal", "Loyal");
        let mut first = bought_twice();
        let mut second = bought_twice();

        let (a, b) = tokio::join!(
            f.generator.sync_generated_rules(&buyers, &mut first),
            f.generator.sync_generated_rules(&loyal, &mut second),
        );
        let key = a.unwrap().into_iter().next().unwrap();
        assert_eq!(b.unwrap().into_iter().next(), Some(key.clone()));

        let rule = f.store.load_rule(&key).await.unwrap().unwrap();
        assert_eq!(
            rule.linked_items.into_iter().collect::<Vec<_>>(),
            vec!["buyers".to_string(), "loyal".to_string()]
        );

        let vip = Metadata::new("shop", "vip", "VIP");
        let mut third = bought_twice();
        let no_keep = BTreeSet::new();
        let (retracted, synced) = tokio::join!(
            f.generator.retract_owner("buyers", &no_keep),
            f.generator.sync_generated_rules(&vip, &mut third),
        );
        assert!(retracted.unwrap().is_empty());
        synced.unwrap();
        let rule = f.store.load_rule(&key).await.unwrap().unwrap();
        assert_eq!(
            rule.linked_items.into_iter().collect::<Vec<_>>(),
            vec!["loyal".to_string(), "vip".to_string()]
        );
    }

    #[tokio::test]
    async fn sync_twice_is_a_no_op() {
        let f = fixture().await;
        let owner = Metadata::new("shop", "buyers", "Buyers");
        let mut condition = bought_twice();
        f.generator.sync_generated_rules(&owner, &mut condition).await.unwrap();
        let saves = f.store.save_count();
        f.generator.sync_generated_rules(&owner, &mut condition).await.unwrap();

        assert_eq!(f.store.save_count(), saves);
        assert_eq!(f.store.count(ItemType::Rule), 1);
    }

    #[tokio::test]
    async fn new_rule_backfills_existing_profiles() {
        let f = fixture().await;
        for profile in ["p1", "p1", "p2"] {
            f.store
                .save(&Item::Event(Event::new("purchase", "shop", Some(Profile::new(profile)), None)))
                .await
                .unwrap();
        }
        for profile in ["p1", "p2", "p3"] {
            f.store.save(&Item::Profile(Profile::new(profile))).await.unwrap();
        }

        let mut condition = bought_twice();
        f.generator
            .sync_generated_rules(&Metadata::new("shop", "buyers", "Buyers"), &mut condition)
            .await
            .unwrap();
        let key = generated_key(&condition).unwrap();

        let count = |id: &'static str| {
            let store = f.store.clone();
            let key = key.clone();
            async move { store.load_profile(id).await.unwrap().unwrap().past_event_count(&key) }
        };
        assert_eq!(count("p1").await, Some(2));
        assert_eq!(count("p2").await, Some(1));
        assert_eq!(count("p3").await, None);
    }

    #[tokio::test]
    async fn retract_shrinks_then_deletes() {
        let f = fixture().await;
        let mut first = bought_twice();
        let mut second = bought_twice();
        let keys = f
            .generator
            .sync_generated_rules(&Metadata::new("shop", "buyers", "Buyers"), &mut first)
            .await
            .unwrap();
        f.generator
            .sync_generated_rules(&Metadata::new("shop", "loyal", "Loyal"), &mut second)
            .await
            .unwrap();
        let key = keys.into_iter().next().unwrap();

        let deleted = f.generator.retract_owner("buyers", &BTreeSet::new()).await.unwrap();
        assert!(deleted.is_empty());
        let rule = f.store.load_rule(&key).await.unwrap().unwrap();
        assert_eq!(rule.linked_items.len(), 1);

        // 仍被引用的规则不受影响
        let keep: BTreeSet<String> = [key.clone()].into_iter().collect();
        assert!(f.generator.retract_owner("loyal", &keep).await.unwrap().is_empty());

        let deleted = f.generator.retract_owner("loyal", &BTreeSet::new()).await.unwrap();
        assert_eq!(deleted, vec![key.clone()]);
        assert!(f.store.load_rule(&key).await.unwrap().is_none());
        assert!(!f.rules.is_active(&key).await);
    }
}
