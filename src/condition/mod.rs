mod extract;
mod hash;

pub use hash::*;

use crate::registry::TypeRegistry;
use crate::types::{Action, Condition, ConditionType, Rule};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::warn;

/// 条件树的最大深度, 超过即视为畸形输入
pub const MAX_CONDITION_DEPTH: usize = 64;

/// 针对单个租户解析与遍历条件树
#[derive(Clone)]
pub struct ConditionResolver {
    registry: Arc<TypeRegistry>,
    tenant: String,
}

impl ConditionResolver {
    pub fn new(registry: Arc<TypeRegistry>, tenant: &str) -> Self {
        Self {
            registry,
            tenant: tenant.to_string(),
        }
    }

    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    /// 解析根节点及全部嵌套条件的类型, 全部解析成功时返回 true
    pub fn resolve(&self, condition: &mut Condition) -> bool {
        let mut unresolved = BTreeSet::new();
        let resolved = self.resolve_tree(condition, &mut unresolved);
        if !resolved {
            warn!(condition_type = %condition.type_id, unresolved = ?unresolved, "Could not resolve condition types");
        }
        resolved
    }

    pub fn resolve_actions(&self, actions: &mut [Action]) -> bool {
        let mut unresolved = BTreeSet::new();
        let mut resolved = true;
        for action in actions.iter_mut() {
            match self.registry.action_type(&action.type_id, &self.tenant) {
                Some(ty) => action.action_type = Some(ty),
                None => {
                    action.action_type = None;
                    unresolved.insert(action.type_id.clone());
                    resolved = false;
                }
            }
            for value in action.parameters.values_mut() {
                for condition in value.conditions_mut() {
                    resolved &= self.resolve_tree(condition, &mut unresolved);
                }
            }
        }
        if !resolved {
            warn!(unresolved = ?unresolved, "Could not resolve action types");
        }
        resolved
    }

    /// 规则条件与动作全部可解析
    pub fn resolve_rule(&self, rule: &mut Rule) -> bool {
        let condition_ok = match rule.condition.as_mut() {
            Some(condition) => self.resolve(condition),
            None => true,
        };
        let actions_ok = self.resolve_actions(&mut rule.actions);
        condition_ok && actions_ok
    }

    fn resolve_tree(&self, condition: &mut Condition, unresolved: &mut BTreeSet<String>) -> bool {
        let mut visited = HashSet::new();
        self.resolve_node(condition, 0, &mut visited, unresolved)
    }

    fn resolve_node(
        &self,
        condition: &mut Condition,
        depth: usize,
        visited: &mut HashSet<usize>,
        unresolved: &mut BTreeSet<String>,
    ) -> bool {
        if depth > MAX_CONDITION_DEPTH {
            warn!(depth, condition_type = %condition.type_id, "Condition tree too deep, giving up");
            unresolved.insert(condition.type_id.clone());
            return false;
        }
        if !visited.insert(condition as *const Condition as usize) {
            return true;
        }

        let mut resolved = match self.registry.condition_type(&condition.type_id, &self.tenant) {
            Some(ty) => match ty.parent_condition.as_ref() {
                // 派生类型: 父条件在副本上解析, 注册表里的类型保持不变
                Some(parent) => {
                    let mut parent = parent.clone();
                    let parent_ok = self.resolve_node(&mut parent, depth + 1, &mut HashSet::new(), unresolved);
                    condition.condition_type = Some(Arc::new(ConditionType {
                        parent_condition: Some(parent),
                        ..ConditionType::clone(&ty)
                    }));
                    parent_ok
                }
                None => {
                    condition.condition_type = Some(ty);
                    true
                }
            },
            None => {
                condition.condition_type = None;
                unresolved.insert(condition.type_id.clone());
                false
            }
        };
        for child in condition.children_mut() {
            resolved &= self.resolve_node(child, depth + 1, visited, unresolved);
        }
        resolved
    }
}

/// 树中出现的全部条件类型 id
pub fn condition_type_ids(condition: &Condition) -> BTreeSet<String> {
    let mut ids = BTreeSet::new();
    let mut stack = vec![condition];
    while let Some(node) = stack.pop() {
        ids.insert(node.type_id.clone());
        stack.extend(node.children());
    }
    ids
}

/// 规则条件与动作参数中引用的全部类型 id
pub fn rule_type_ids(rule: &Rule) -> BTreeSet<String> {
    let mut ids = rule.condition.as_ref().map(condition_type_ids).unwrap_or_default();
    for action in &rule.actions {
        ids.insert(action.type_id.clone());
        for value in action.parameters.values() {
            for condition in value.conditions() {
                ids.extend(condition_type_ids(condition));
            }
        }
    }
    ids
}
