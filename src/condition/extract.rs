use super::ConditionResolver;
use crate::types::{Condition, RuleError, BOOLEAN_CONDITION, Tagged};

impl ConditionResolver {
    /// 抽取带 `tag` 的子树
    ///
    /// - 全部子条件原样命中: 返回根节点本身
    /// - AND 下部分命中: 单个命中直接返回, 多个包成新的 AND
    /// - 其他布尔操作下部分命中: `UnsupportedExtraction`
    pub fn extract_by_tag(&self, condition: &Condition, tag: &str) -> Result<Option<Condition>, RuleError> {
        let Some(sub_conditions) = condition.sub_conditions() else {
            return Ok(self.carries_tag(condition, tag).then(|| condition.clone()));
        };

        let mut matched = Vec::new();
        let mut unchanged = true;
        for sub in &sub_conditions {
            match self.extract_by_tag(sub, tag)? {
                Some(extracted) => {
                    unchanged &= extracted == **sub;
                    matched.push(extracted);
                }
                None => unchanged = false,
            }
        }

        if matched.is_empty() {
            return Ok(None);
        }
        if unchanged {
            return Ok(Some(condition.clone()));
        }
        let operator = condition.operator().unwrap_or("and");
        if condition.type_id == BOOLEAN_CONDITION && operator.eq_ignore_ascii_case("and") {
            if matched.len() == 1 {
                return Ok(matched.pop());
            }
            let mut synthetic = Condition::and(matched);
            synthetic.condition_type = self.registry().condition_type(BOOLEAN_CONDITION, self.tenant());
            return Ok(Some(synthetic));
        }
        Err(RuleError::UnsupportedExtraction {
            tag: tag.to_string(),
            operator: operator.to_string(),
        })
    }

    /// 树中所有 `type_id` 等于目标的节点 (含布尔节点), 去重
    pub fn extract_by_type(&self, condition: &Condition, type_id: &str) -> Vec<Condition> {
        let mut found: Vec<Condition> = Vec::new();
        let mut stack = vec![condition];
        while let Some(node) = stack.pop() {
            if node.type_id == type_id && !found.contains(node) {
                found.push(node.clone());
            }
            stack.extend(node.children().into_iter().rev());
        }
        found
    }

    /// 节点类型是否带 `tag`; 未解析的节点延迟查找类型
    pub fn carries_tag(&self, condition: &Condition, tag: &str) -> bool {
        match &condition.condition_type {
            Some(ty) => ty.has_tag(tag),
            None => self
                .registry()
                .condition_type(&condition.type_id, self.tenant())
                .map_or(false, |ty| ty.has_tag(tag)),
        }
    }
}
