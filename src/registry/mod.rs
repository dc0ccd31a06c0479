mod snapshot;
mod tenant;

pub use snapshot::TypeSnapshot;

use crate::types::{
    ActionType, ConditionType, PluginType, PropertyMergeStrategyType, PropertyType, Tag, TypeKind,
    ValueType, SYSTEM_TENANT,
};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tenant::TenantScope;
use tracing::{debug, info, warn};

/// 多租户类型注册表
///
/// 每个租户一份写时复制快照; 查找先查租户自身, 未命中时回退到系统租户,
/// 回退结果按租户缓存。
pub struct TypeRegistry {
    system_tenant: String,
    system: Arc<TenantScope>,
    system_generation: AtomicU64,
    tenants: RwLock<HashMap<String, Arc<TenantScope>>>,
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new(SYSTEM_TENANT)
    }
}

impl TypeRegistry {
    pub fn new(system_tenant: &str) -> Self {
        Self {
            system_tenant: system_tenant.to_string(),
            system: Arc::new(TenantScope::new()),
            system_generation: AtomicU64::new(0),
            tenants: RwLock::new(HashMap::new()),
        }
    }

    pub fn system_tenant(&self) -> &str {
        &self.system_tenant
    }

    fn is_system(&self, tenant: &str) -> bool {
        tenant == self.system_tenant
    }

    fn scope(&self, tenant: &str) -> Option<Arc<TenantScope>> {
        if self.is_system(tenant) {
            return Some(self.system.clone());
        }
        self.tenants.read().get(tenant).cloned()
    }

    fn scope_or_create(&self, tenant: &str) -> Arc<TenantScope> {
        if let Some(scope) = self.scope(tenant) {
            return scope;
        }
        self.tenants
            .write()
            .entry(tenant.to_string())
            .or_insert_with(|| Arc::new(TenantScope::new()))
            .clone()
    }

    /// 租户可继承的系统标签
    fn inherited_tags(&self, tenant: &str) -> HashSet<String> {
        if self.is_system(tenant) {
            HashSet::new()
        } else {
            self.system.load().tag_ids()
        }
    }

    fn mutate<R>(&self, tenant: &str, f: impl FnOnce(&mut TypeSnapshot, &HashSet<String>) -> R) -> R {
        let scope = self.scope_or_create(tenant);
        // 系统标签在租户写锁内读取, 与下面的重建互斥
        let result = scope.update(|snapshot| f(snapshot, &self.inherited_tags(tenant)));
        if self.is_system(tenant) {
            self.system_generation.fetch_add(1, Ordering::AcqRel);
            self.reindex_tenants();
        }
        result
    }

    /// 系统快照变化后, 按当前系统标签重建各租户的标签索引
    fn reindex_tenants(&self) {
        let scopes: Vec<Arc<TenantScope>> = self.tenants.read().values().cloned().collect();
        for scope in scopes {
            scope.update(|snapshot| snapshot.reindex(&self.system.load().tag_ids()));
        }
    }

    /// 插件加载: 标签与类型在一次快照替换中生效
    pub fn on_load(&self, plugin_id: &str, tenant: &str, tags: Vec<Tag>, types: Vec<PluginType>) {
        let count = types.len();
        let unknown = self.mutate(tenant, |snapshot, inherited| {
            snapshot.add_plugin(plugin_id, tags, types, inherited)
        });
        for (type_id, tag) in unknown {
            warn!(plugin = %plugin_id, type_id = %type_id, tag = %tag, "Unknown tag, type left uncategorized under it");
        }
        info!(plugin = %plugin_id, tenant = %tenant, types = count, "Plugin types registered");
    }

    /// 插件卸载: 以插件贡献清单为准移除全部类型与标签
    pub fn on_unload(&self, plugin_id: &str, tenant: &str) -> Vec<PluginType> {
        if self.scope(tenant).is_none() {
            return Vec::new();
        }
        let removed = self.mutate(tenant, |snapshot, inherited| {
            snapshot.remove_plugin(plugin_id, inherited)
        });
        info!(plugin = %plugin_id, tenant = %tenant, types = removed.len(), "Plugin types unregistered");
        removed
    }

    pub fn register(&self, ty: PluginType, tenant: &str) {
        let unknown = self.mutate(tenant, |snapshot, inherited| snapshot.insert_type(ty, inherited));
        for (type_id, tag) in unknown {
            warn!(type_id = %type_id, tag = %tag, "Unknown tag, type left uncategorized under it");
        }
    }

    pub fn unregister(&self, ty: &PluginType, tenant: &str) -> Option<PluginType> {
        self.scope(tenant)?;
        let (kind, key) = (ty.kind(), ty.index_key());
        self.mutate(tenant, |snapshot, inherited| snapshot.remove_type(kind, &key, inherited))
    }

    /// 按 id 查找, 租户未命中时回退到系统租户
    pub fn get(&self, kind: TypeKind, key: &str, tenant: &str) -> Option<PluginType> {
        if self.is_system(tenant) {
            return self.system.load().get(kind, key).cloned();
        }
        let scope = self.scope(tenant);
        if let Some(scope) = &scope {
            if let Some(ty) = scope.load().get(kind, key) {
                return Some(ty.clone());
            }
        }

        let generation = self.system_generation.load(Ordering::Acquire);
        if let Some(cached) = scope
            .as_ref()
            .and_then(|s| s.cached_fallback(kind, key, generation))
        {
            return cached;
        }
        let found = self.system.load().get(kind, key).cloned();
        if let Some(scope) = scope {
            scope.cache_fallback(kind, key, generation, found.clone());
        }
        debug!(tenant = %tenant, key = %key, found = found.is_some(), "Type resolved via system tenant");
        found
    }

    pub fn condition_type(&self, id: &str, tenant: &str) -> Option<Arc<ConditionType>> {
        match self.get(TypeKind::Condition, id, tenant)? {
            PluginType::Condition(t) => Some(t),
            _ => None,
        }
    }

    pub fn action_type(&self, id: &str, tenant: &str) -> Option<Arc<ActionType>> {
        match self.get(TypeKind::Action, id, tenant)? {
            PluginType::Action(t) => Some(t),
            _ => None,
        }
    }

    pub fn value_type(&self, id: &str, tenant: &str) -> Option<Arc<ValueType>> {
        match self.get(TypeKind::Value, id, tenant)? {
            PluginType::Value(t) => Some(t),
            _ => None,
        }
    }

    pub fn property_type(&self, target: &str, id: &str, tenant: &str) -> Option<Arc<PropertyType>> {
        match self.get(TypeKind::Property, &format!("{}/{}", target, id), tenant)? {
            PluginType::Property(t) => Some(t),
            _ => None,
        }
    }

    pub fn merge_strategy(&self, id: &str, tenant: &str) -> Option<Arc<PropertyMergeStrategyType>> {
        match self.get(TypeKind::MergeStrategy, id, tenant)? {
            PluginType::MergeStrategy(t) => Some(t),
            _ => None,
        }
    }

    /// 带标签的类型; 递归时包含全部后代标签。结果为租户与系统租户的并集
    pub fn types_by_tag(
        &self,
        kind: TypeKind,
        tag: Option<&str>,
        tenant: &str,
        recursive: bool,
    ) -> Vec<PluginType> {
        let Some(tag) = tag else {
            return Vec::new();
        };
        let system = self.system.load();
        let local = if self.is_system(tenant) {
            None
        } else {
            self.scope(tenant).map(|s| s.load())
        };

        let tags = if recursive {
            match &local {
                Some(local) => local.descendants(tag, Some(&system)),
                None => system.descendants(tag, None),
            }
        } else {
            vec![tag.to_string()]
        };

        let mut found: BTreeMap<String, PluginType> = BTreeMap::new();
        for tag in &tags {
            // 系统租户先写入, 租户自身的同 id 类型覆盖之
            for ty in system.tagged(kind, tag) {
                found.insert(ty.index_key(), ty);
            }
            if let Some(local) = &local {
                for ty in local.tagged(kind, tag) {
                    found.insert(ty.index_key(), ty);
                }
            }
        }
        found.into_values().collect()
    }

    pub fn condition_types_by_tag(&self, tag: &str, tenant: &str, recursive: bool) -> Vec<Arc<ConditionType>> {
        self.types_by_tag(TypeKind::Condition, Some(tag), tenant, recursive)
            .into_iter()
            .filter_map(|ty| match ty {
                PluginType::Condition(t) => Some(t),
                _ => None,
            })
            .collect()
    }

    pub fn action_types_by_tag(&self, tag: &str, tenant: &str, recursive: bool) -> Vec<Arc<ActionType>> {
        self.types_by_tag(TypeKind::Action, Some(tag), tenant, recursive)
            .into_iter()
            .filter_map(|ty| match ty {
                PluginType::Action(t) => Some(t),
                _ => None,
            })
            .collect()
    }

    pub fn property_types_by_mapping(&self, mapping: &str, tenant: &str) -> Vec<Arc<PropertyType>> {
        let mut found = self.system.load().mapped(mapping);
        if !self.is_system(tenant) {
            if let Some(scope) = self.scope(tenant) {
                found.extend(scope.load().mapped(mapping));
            }
        }
        found
    }

    pub fn tag(&self, id: &str, tenant: &str) -> Option<Tag> {
        if !self.is_system(tenant) {
            if let Some(tag) = self.scope(tenant).and_then(|s| s.load().tag(id).cloned()) {
                return Some(tag);
            }
        }
        self.system.load().tag(id).cloned()
    }

    pub fn all_tags(&self, tenant: &str) -> Vec<Tag> {
        let mut tags: BTreeMap<String, Tag> = self
            .system
            .load()
            .tags()
            .map(|t| (t.id.clone(), t.clone()))
            .collect();
        if !self.is_system(tenant) {
            if let Some(scope) = self.scope(tenant) {
                tags.extend(scope.load().tags().map(|t| (t.id.clone(), t.clone())));
            }
        }
        tags.into_values().collect()
    }

    pub fn root_tags(&self, tenant: &str) -> Vec<Tag> {
        self.all_tags(tenant).into_iter().filter(Tag::is_root).collect()
    }

    pub fn types_by_plugin(&self, plugin_id: &str, tenant: &str) -> Vec<PluginType> {
        self.scope(tenant)
            .map(|s| s.load().plugin_types(plugin_id))
            .unwrap_or_default()
    }

    /// 清除租户的类型与缓存; 系统租户不受影响
    pub fn remove_tenant(&self, tenant: &str) {
        if self.is_system(tenant) {
            debug!(tenant = %tenant, "Ignoring removal of the system tenant");
            return;
        }
        if self.tenants.write().remove(tenant).is_some() {
            info!(tenant = %tenant, "Tenant type scope removed");
        }
    }

    pub fn has_tenant(&self, tenant: &str) -> bool {
        self.scope(tenant).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn condition(id: &str, tags: &[&str]) -> PluginType {
        PluginType::Condition(Arc::new(ConditionType::new(id).with_tags(tags)))
    }

    fn ids(types: &[PluginType]) -> Vec<&str> {
        types.iter().map(PluginType::id).collect()
    }

    fn base_registry() -> TypeRegistry {
        let registry = TypeRegistry::default();
        registry.on_load(
            "base",
            SYSTEM_TENANT,
            vec![
                Tag::new("condition", None),
                Tag::new("profileCondition", Some("condition")),
                Tag::new("pageCondition", Some("profileCondition")),
            ],
            vec![
                condition("profilePropertyCondition", &["profileCondition"]),
                condition("pageVisitCondition", &["pageCondition"]),
            ],
        );
        registry
    }

    #[test]
    fn tenant_lookup_falls_back_to_system() {
        let registry = base_registry();
        registry.on_load("custom", "acme", vec![], vec![condition("acmeCondition", &[])]);

        assert!(registry.condition_type("acmeCondition", "acme").is_some());
        assert!(registry.condition_type("profilePropertyCondition", "acme").is_some());
        assert!(registry.condition_type("acmeCondition", SYSTEM_TENANT).is_none());
        assert!(registry.condition_type("acmeCondition", "other").is_none());
    }

    #[test]
    fn fallback_misses_are_cached_until_system_changes() {
        let registry = base_registry();
        registry.on_load("custom", "acme", vec![], vec![]);
        assert!(registry.condition_type("later", "acme").is_none());
        assert_eq!(registry.scope("acme").unwrap().cached_entries(), 1);

        registry.register(condition("later", &[]), SYSTEM_TENANT);
        assert!(registry.condition_type("later", "acme").is_some());
    }

    #[test]
    fn recursive_by_tag_includes_descendants() {
        let registry = base_registry();
        let direct = registry.types_by_tag(TypeKind::Condition, Some("profileCondition"), SYSTEM_TENANT, false);
        let recursive = registry.types_by_tag(TypeKind::Condition, Some("profileCondition"), SYSTEM_TENANT, true);

        assert_eq!(ids(&direct), vec!["profilePropertyCondition"]);
        assert_eq!(ids(&recursive), vec!["pageVisitCondition", "profilePropertyCondition"]);
        let from_root = registry.types_by_tag(TypeKind::Condition, Some("condition"), SYSTEM_TENANT, true);
        assert_eq!(from_root.len(), 2);
    }

    #[test]
    fn missing_tag_yields_empty_set() {
        let registry = base_registry();
        assert!(registry.types_by_tag(TypeKind::Condition, None, SYSTEM_TENANT, true).is_empty());
        assert!(registry.condition_types_by_tag("unknown", SYSTEM_TENANT, true).is_empty());
    }

    #[test]
    fn tenant_by_tag_unions_with_system() {
        let registry = base_registry();
        registry.on_load("custom", "acme", vec![], vec![condition("acmeCondition", &["profileCondition"])]);

        let tenant = registry.condition_types_by_tag("profileCondition", "acme", true);
        assert_eq!(tenant.len(), 3);
        let system = registry.condition_types_by_tag("profileCondition", SYSTEM_TENANT, true);
        assert_eq!(system.len(), 2);
    }

    #[test]
    fn tenant_index_follows_later_system_tags() {
        let registry = base_registry();
        registry.on_load("custom", "acme", vec![], vec![condition("acmeFormCondition", &["formCondition"])]);
        assert!(registry.condition_types_by_tag("formCondition", "acme", false).is_empty());

        registry.on_load("forms", SYSTEM_TENANT, vec![Tag::new("formCondition", Some("condition"))], vec![]);
        let ids: Vec<String> = registry
            .condition_types_by_tag("formCondition", "acme", false)
            .iter()
            .map(|t| t.id.clone())
            .collect();
        assert_eq!(ids, vec!["acmeFormCondition".to_string()]);
        assert_eq!(registry.condition_types_by_tag("condition", "acme", true).len(), 3);

        registry.on_unload("forms", SYSTEM_TENANT);
        assert!(registry.condition_types_by_tag("formCondition", "acme", false).is_empty());
    }

    #[test]
    fn unload_and_reload_restores_indexes() {
        let registry = base_registry();
        registry.on_load("pages", SYSTEM_TENANT, vec![], vec![condition("landingCondition", &["profileCondition"])]);
        assert_eq!(registry.types_by_plugin("pages", SYSTEM_TENANT).len(), 1);

        registry.on_unload("pages", SYSTEM_TENANT);
        assert!(registry.condition_type("landingCondition", SYSTEM_TENANT).is_none());
        assert!(!ids(&registry.types_by_tag(TypeKind::Condition, Some("profileCondition"), SYSTEM_TENANT, false))
            .contains(&"landingCondition"));

        registry.on_load("pages", SYSTEM_TENANT, vec![], vec![condition("landingCondition", &["profileCondition"])]);
        assert!(registry.condition_type("landingCondition", SYSTEM_TENANT).is_some());
    }

    #[test]
    fn loading_twice_is_idempotent() {
        let registry = base_registry();
        registry.on_load("pages", SYSTEM_TENANT, vec![], vec![condition("a", &[])]);
        registry.on_load("pages", SYSTEM_TENANT, vec![], vec![condition("a", &[])]);
        assert_eq!(registry.types_by_plugin("pages", SYSTEM_TENANT).len(), 1);
    }

    #[test]
    fn removing_system_tenant_is_a_no_op() {
        let registry = base_registry();
        registry.on_load("custom", "acme", vec![], vec![condition("acmeCondition", &[])]);

        registry.remove_tenant(SYSTEM_TENANT);
        assert!(registry.condition_type("profilePropertyCondition", SYSTEM_TENANT).is_some());

        registry.remove_tenant("acme");
        assert!(!registry.has_tenant("acme"));
        assert!(registry.condition_type("acmeCondition", "acme").is_none());
        assert!(registry.condition_type("profilePropertyCondition", "acme").is_some());
    }

    #[test]
    fn root_tags_have_no_parent() {
        let registry = base_registry();
        let roots: Vec<String> = registry.root_tags(SYSTEM_TENANT).into_iter().map(|t| t.id).collect();
        assert_eq!(roots, vec!["condition".to_string()]);
        assert!(registry.tag("pageCondition", "acme").is_some());
    }
}
