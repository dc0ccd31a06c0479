use super::evaluator::{self, assign, compare_values, lookup};
use super::{Persistence, TermsAggregate};
use crate::types::{Condition, Event, Item, ItemType, PartialList, RuleError};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};

/// 内存存储, 对象以 JSON 文档保存; 测试与演示使用
#[derive(Default)]
pub struct InMemoryPersistence {
    items: RwLock<HashMap<ItemType, BTreeMap<String, Value>>>,
    queries: RwLock<BTreeMap<String, Condition>>,
    fail_saves: AtomicBool,
    save_count: AtomicUsize,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// 让后续 `save` 全部失败
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, AtomicOrdering::SeqCst);
    }

    pub fn save_count(&self) -> usize {
        self.save_count.load(AtomicOrdering::SeqCst)
    }

    pub fn count(&self, item_type: ItemType) -> usize {
        self.items.read().get(&item_type).map_or(0, BTreeMap::len)
    }

    pub fn saved_query_names(&self) -> Vec<String> {
        self.queries.read().keys().cloned().collect()
    }

    fn matching_documents(&self, condition: Option<&Condition>, item_type: ItemType) -> Vec<Value> {
        let items = self.items.read();
        items
            .get(&item_type)
            .map(|docs| {
                docs.values()
                    .filter(|doc| condition.map_or(true, |c| evaluator::evaluate(c, doc)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn sort_documents(docs: &mut [Value], sort_by: &str) {
    let (field, descending) = match sort_by.split_once(':') {
        Some((field, order)) => (field, order.eq_ignore_ascii_case("desc")),
        None => (sort_by, false),
    };
    docs.sort_by(|a, b| {
        let ordering = match (lookup(a, field), lookup(b, field)) {
            (Some(x), Some(y)) => compare_values(x, y).unwrap_or(Ordering::Equal),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        if descending {
            ordering.reverse()
        } else {
            ordering
        }
    });
}

fn bucket_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl Persistence for InMemoryPersistence {
    async fn save(&self, item: &Item) -> Result<(), RuleError> {
        if self.fail_saves.load(AtomicOrdering::SeqCst) {
            return Err(RuleError::Persistence(format!(
                "写入 {} {} 失败",
                item.item_type(),
                item.item_id()
            )));
        }
        let document = item.to_json()?;
        self.items
            .write()
            .entry(item.item_type())
            .or_default()
            .insert(item.item_id().to_string(), document);
        self.save_count.fetch_add(1, AtomicOrdering::SeqCst);
        Ok(())
    }

    async fn load(&self, item_id: &str, item_type: ItemType) -> Result<Option<Item>, RuleError> {
        let document = self
            .items
            .read()
            .get(&item_type)
            .and_then(|docs| docs.get(item_id))
            .cloned();
        document.map(|doc| Item::from_json(item_type, doc)).transpose()
    }

    async fn remove(&self, item_id: &str, item_type: ItemType) -> Result<bool, RuleError> {
        Ok(self
            .items
            .write()
            .get_mut(&item_type)
            .and_then(|docs| docs.remove(item_id))
            .is_some())
    }

    async fn query(
        &self,
        condition: Option<&Condition>,
        sort_by: Option<&str>,
        item_type: ItemType,
        offset: usize,
        size: Option<usize>,
    ) -> Result<PartialList<Item>, RuleError> {
        let mut docs = self.matching_documents(condition, item_type);
        if let Some(sort_by) = sort_by {
            sort_documents(&mut docs, sort_by);
        }
        let total_size = docs.len();
        let page_size = size.unwrap_or(total_size);
        let list = docs
            .into_iter()
            .skip(offset)
            .take(page_size)
            .map(|doc| Item::from_json(item_type, doc))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(PartialList {
            list,
            offset,
            page_size,
            total_size,
        })
    }

    async fn query_count(&self, condition: &Condition, item_type: ItemType) -> Result<u64, RuleError> {
        Ok(self.matching_documents(Some(condition), item_type).len() as u64)
    }

    async fn aggregate_query(
        &self,
        condition: &Condition,
        aggregate: &TermsAggregate,
        item_type: ItemType,
    ) -> Result<BTreeMap<String, u64>, RuleError> {
        let mut buckets = BTreeMap::new();
        for doc in self.matching_documents(Some(condition), item_type) {
            if let Some(value) = lookup(&doc, &aggregate.field).filter(|v| !v.is_null()) {
                *buckets.entry(bucket_key(value)).or_insert(0) += 1;
            }
        }
        Ok(buckets)
    }

    fn test_match(&self, condition: &Condition, item: &Item) -> bool {
        match item.to_json() {
            Ok(doc) => evaluator::evaluate(condition, &doc),
            Err(_) => false,
        }
    }

    async fn save_query(&self, query_name: &str, condition: &Condition) -> Result<(), RuleError> {
        self.queries
            .write()
            .insert(query_name.to_string(), condition.clone());
        Ok(())
    }

    async fn remove_query(&self, query_name: &str) -> Result<(), RuleError> {
        self.queries.write().remove(query_name);
        Ok(())
    }

    async fn matching_saved_queries(&self, event: &Event) -> Result<Vec<String>, RuleError> {
        let doc = serde_json::to_value(event)?;
        Ok(self
            .queries
            .read()
            .iter()
            .filter(|(_, condition)| evaluator::evaluate(condition, &doc))
            .map(|(name, _)| name.clone())
            .collect())
    }

    async fn update(
        &self,
        item_id: &str,
        item_type: ItemType,
        property_path: &str,
        value: Value,
    ) -> Result<bool, RuleError> {
        let mut items = self.items.write();
        let Some(doc) = items.get_mut(&item_type).and_then(|docs| docs.get_mut(item_id)) else {
            return Ok(false);
        };
        assign(doc, property_path, value);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Profile, EVENT_PROPERTY_CONDITION};
    use serde_json::json;

    fn view(profile: &str, page: &str) -> Item {
        Item::Event(
            Event::new("view", "site", Some(Profile::new(profile)), None)
                .with_property("page", json!(page)),
        )
    }

    #[tokio::test]
    async fn save_load_and_remove() {
        let store = InMemoryPersistence::new();
        store.save(&Item::Profile(Profile::new("p1"))).await.unwrap();
        let loaded = store.load_profile("p1").await.unwrap().unwrap();
        assert_eq!(loaded.item_id, "p1");
        assert!(store.remove("p1", ItemType::Profile).await.unwrap());
        assert!(store.load_profile("p1").await.unwrap().is_none());
        assert!(!store.remove("p1", ItemType::Profile).await.unwrap());
    }

    #[tokio::test]
    async fn failing_saves_store_nothing() {
        let store = InMemoryPersistence::new();
        store.set_fail_saves(true);
        let err = store.save(&Item::Profile(Profile::new("p1"))).await.unwrap_err();
        assert!(matches!(err, RuleError::Persistence(_)));
        assert_eq!(store.count(ItemType::Profile), 0);
        assert_eq!(store.save_count(), 0);
    }

    #[tokio::test]
    async fn query_count_and_aggregate() {
        let store = InMemoryPersistence::new();
        for (profile, page) in [("p1", "/a"), ("p1", "/b"), ("p2", "/a")] {
            store.save(&view(profile, page)).await.unwrap();
        }
        let on_a = Condition::property(EVENT_PROPERTY_CONDITION, "properties.page", "equals", json!("/a"));

        assert_eq!(store.query_count(&on_a, ItemType::Event).await.unwrap(), 2);
        let page = store
            .query(None, Some("profileId:desc"), ItemType::Event, 0, Some(2))
            .await
            .unwrap();
        assert_eq!(page.total_size, 3);
        assert_eq!(page.list.len(), 2);
        assert_eq!(page.list[0].clone().into_event().unwrap().profile_id.as_deref(), Some("p2"));

        let buckets = store
            .aggregate_query(&Condition::event_type("view"), &TermsAggregate::new("profileId"), ItemType::Event)
            .await
            .unwrap();
        assert_eq!(buckets.get("p1"), Some(&2));
        assert_eq!(buckets.get("p2"), Some(&1));
    }

    #[tokio::test]
    async fn update_writes_nested_paths() {
        let store = InMemoryPersistence::new();
        store.save(&Item::Profile(Profile::new("p1"))).await.unwrap();
        assert!(store
            .update("p1", ItemType::Profile, "systemProperties.pastEvents.k", json!(4))
            .await
            .unwrap());
        let profile = store.load_profile("p1").await.unwrap().unwrap();
        assert_eq!(profile.past_event_count("k"), Some(4));
        assert!(!store.update("p9", ItemType::Profile, "x", json!(1)).await.unwrap());
    }

    #[tokio::test]
    async fn saved_queries_match_events() {
        let store = InMemoryPersistence::new();
        store.save_query("rule_views", &Condition::event_type("view")).await.unwrap();
        store.save_query("rule_clicks", &Condition::event_type("click")).await.unwrap();

        let Item::Event(event) = view("p1", "/a") else { unreachable!() };
        assert_eq!(store.matching_saved_queries(&event).await.unwrap(), vec!["rule_views".to_string()]);

        store.remove_query("rule_views").await.unwrap();
        assert!(store.matching_saved_queries(&event).await.unwrap().is_empty());
    }
}
