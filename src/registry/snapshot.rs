use crate::types::{PluginType, PropertyType, Tag, TypeKind};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

/// 单个租户的类型表快照
///
/// 快照不可变; 写操作在克隆上完成后整体替换, 因此 id 索引与标签索引
/// 对读者总是一致的。
#[derive(Debug, Clone, Default)]
pub struct TypeSnapshot {
    types: HashMap<TypeKind, HashMap<String, PluginType>>,
    by_tag: HashMap<TypeKind, HashMap<String, BTreeMap<String, PluginType>>>,
    mappings: HashMap<String, Vec<Arc<PropertyType>>>,
    /// 插件贡献的类型清单, 卸载时以此为准
    by_plugin: HashMap<String, Vec<PluginType>>,
    plugin_tags: HashMap<String, Vec<String>>,
    tags: HashMap<String, Tag>,
}

impl TypeSnapshot {
    pub fn get(&self, kind: TypeKind, key: &str) -> Option<&PluginType> {
        self.types.get(&kind).and_then(|m| m.get(key))
    }

    pub fn tag(&self, id: &str) -> Option<&Tag> {
        self.tags.get(id)
    }

    pub fn tags(&self) -> impl Iterator<Item = &Tag> {
        self.tags.values()
    }

    pub fn has_tag(&self, id: &str) -> bool {
        self.tags.contains_key(id)
    }

    /// 直接带有该标签的类型
    pub fn tagged(&self, kind: TypeKind, tag: &str) -> Vec<PluginType> {
        self.by_tag
            .get(&kind)
            .and_then(|m| m.get(tag))
            .map(|types| types.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn mapped(&self, mapping: &str) -> Vec<Arc<PropertyType>> {
        self.mappings.get(mapping).cloned().unwrap_or_default()
    }

    pub fn plugin_types(&self, plugin_id: &str) -> Vec<PluginType> {
        self.by_plugin.get(plugin_id).cloned().unwrap_or_default()
    }

    pub fn plugins(&self) -> impl Iterator<Item = &String> {
        self.by_plugin.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.by_plugin.is_empty() && self.tags.is_empty()
    }

    /// 添加插件贡献; 同一插件重复加载时先撤掉旧的贡献
    ///
    /// 返回引用了未知标签的 (类型 id, 标签 id), 这些标签被跳过。
    pub fn add_plugin(
        &mut self,
        plugin_id: &str,
        tags: Vec<Tag>,
        types: Vec<PluginType>,
        inherited_tags: &HashSet<String>,
    ) -> Vec<(String, String)> {
        self.remove_plugin(plugin_id, inherited_tags);

        let mut tag_ids = Vec::with_capacity(tags.len());
        for mut tag in tags {
            tag.plugin_id = Some(plugin_id.to_string());
            tag_ids.push(tag.id.clone());
            self.tags.insert(tag.id.clone(), tag);
        }
        self.plugin_tags.insert(plugin_id.to_string(), tag_ids);
        self.rebuild_sub_tags();

        let mut contributed = Vec::with_capacity(types.len());
        for mut ty in types {
            ty.set_plugin_id(plugin_id);
            self.types
                .entry(ty.kind())
                .or_default()
                .insert(ty.index_key(), ty.clone());
            contributed.push(ty);
        }

        let unknown = contributed
            .iter()
            .flat_map(|ty| self.unknown_tags(ty, inherited_tags))
            .collect();
        self.by_plugin.insert(plugin_id.to_string(), contributed);
        self.reindex(inherited_tags);
        unknown
    }

    /// 撤掉插件的全部类型与标签, 返回被移除的类型
    pub fn remove_plugin(
        &mut self,
        plugin_id: &str,
        inherited_tags: &HashSet<String>,
    ) -> Vec<PluginType> {
        let removed = self.by_plugin.remove(plugin_id).unwrap_or_default();
        for ty in &removed {
            self.remove_entry(ty, plugin_id);
        }
        if let Some(tag_ids) = self.plugin_tags.remove(plugin_id) {
            for id in tag_ids {
                let owned = self
                    .tags
                    .get(&id)
                    .map_or(false, |t| t.plugin_id.as_deref() == Some(plugin_id));
                if owned {
                    self.tags.remove(&id);
                }
            }
        }
        self.rebuild_sub_tags();
        self.reindex(inherited_tags);
        removed
    }

    /// 单个类型的注册, 归入其 plugin_id 的贡献清单
    pub fn insert_type(&mut self, ty: PluginType, inherited_tags: &HashSet<String>) -> Vec<(String, String)> {
        let plugin_id = ty.plugin_id().unwrap_or_default().to_string();
        let key = ty.index_key();
        let kind = ty.kind();
        let list = self.by_plugin.entry(plugin_id).or_default();
        list.retain(|t| !(t.kind() == kind && t.index_key() == key));
        list.push(ty.clone());
        let unknown = self.unknown_tags(&ty, inherited_tags);
        self.types.entry(kind).or_default().insert(key, ty);
        self.reindex(inherited_tags);
        unknown
    }

    pub fn remove_type(&mut self, kind: TypeKind, key: &str, inherited_tags: &HashSet<String>) -> Option<PluginType> {
        let removed = self.types.get_mut(&kind).and_then(|m| m.remove(key))?;
        for list in self.by_plugin.values_mut() {
            list.retain(|t| !(t.kind() == kind && t.index_key() == key));
        }
        self.by_plugin.retain(|_, list| !list.is_empty());
        self.reindex(inherited_tags);
        Some(removed)
    }

    /// `tag` 及其全部后代标签 id
    pub fn descendants(&self, tag: &str, inherited: Option<&TypeSnapshot>) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([tag.to_string()]);
        let mut out = Vec::new();
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id.clone()) {
                continue;
            }
            let children = self
                .tags
                .get(&id)
                .into_iter()
                .chain(inherited.and_then(|s| s.tags.get(&id)))
                .flat_map(|t| t.sub_tags.iter().cloned());
            queue.extend(children);
            out.push(id);
        }
        out
    }

    pub fn tag_ids(&self) -> HashSet<String> {
        self.tags.keys().cloned().collect()
    }

    fn remove_entry(&mut self, ty: &PluginType, plugin_id: &str) {
        let Some(map) = self.types.get_mut(&ty.kind()) else {
            return;
        };
        let key = ty.index_key();
        // 同 id 已被其他插件覆盖时保留
        if map.get(&key).and_then(PluginType::plugin_id) == Some(plugin_id) {
            map.remove(&key);
        }
    }

    fn unknown_tags(&self, ty: &PluginType, inherited_tags: &HashSet<String>) -> Vec<(String, String)> {
        let Some((tags, _)) = ty.tag_sets() else {
            return Vec::new();
        };
        tags.iter()
            .filter(|t| !self.tags.contains_key(*t) && !inherited_tags.contains(*t))
            .map(|t| (ty.id().to_string(), t.clone()))
            .collect()
    }

    // 两遍: 全部标签就位后再根据 parent_id 回填子标签
    fn rebuild_sub_tags(&mut self) {
        for tag in self.tags.values_mut() {
            tag.sub_tags.clear();
        }
        let links: Vec<(String, String)> = self
            .tags
            .values()
            .filter_map(|t| t.parent_id.clone().filter(|p| !p.is_empty()).map(|p| (p, t.id.clone())))
            .collect();
        for (parent, child) in links {
            if let Some(parent) = self.tags.get_mut(&parent) {
                parent.sub_tags.insert(child);
            }
        }
    }

    /// 重建标签与映射索引; 常规标签只在本快照或 `inherited_tags` 中已知时入索引
    pub fn reindex(&mut self, inherited_tags: &HashSet<String>) {
        let mut by_tag: HashMap<TypeKind, HashMap<String, BTreeMap<String, PluginType>>> =
            HashMap::new();
        let mut mappings: HashMap<String, Vec<Arc<PropertyType>>> = HashMap::new();

        for (kind, types) in &self.types {
            for (key, ty) in types {
                if let Some((tags, system_tags)) = ty.tag_sets() {
                    // 系统标签总是建立索引, 常规标签必须是已知标签
                    let indexed = system_tags.iter().chain(
                        tags.iter()
                            .filter(|t| self.tags.contains_key(*t) || inherited_tags.contains(*t)),
                    );
                    for tag in indexed {
                        by_tag
                            .entry(*kind)
                            .or_default()
                            .entry(tag.clone())
                            .or_default()
                            .insert(key.clone(), ty.clone());
                    }
                }
                if let PluginType::Property(property) = ty {
                    for mapping in &property.automatic_mappings_from {
                        mappings
                            .entry(mapping.clone())
                            .or_default()
                            .push(property.clone());
                    }
                }
            }
        }

        self.by_tag = by_tag;
        self.mappings = mappings;
    }
}
