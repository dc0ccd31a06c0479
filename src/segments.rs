use crate::condition::ConditionResolver;
use crate::config::EngineConfig;
use crate::engine::AutoRuleGenerator;
use crate::persistence::Persistence;
use crate::types::{
    Condition, Goal, Item, ItemType, Metadata, Profile, RuleError, Scoring, Segment,
    PROFILE_PROPERTY_CONDITION,
};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, error, info};

/// 分群、评分与目标的管理
///
/// 保存时解析条件并同步生成规则; 分群保存后回填已有 profile 的成员关系。
pub struct SegmentService {
    resolver: ConditionResolver,
    persistence: Arc<dyn Persistence>,
    generator: Arc<AutoRuleGenerator>,
    config: EngineConfig,
}

/// 所有者条件的解析结果
enum Resolution {
    Active,
    Disabled,
    MissingPlugins,
}

impl SegmentService {
    pub fn new(
        resolver: ConditionResolver,
        persistence: Arc<dyn Persistence>,
        generator: Arc<AutoRuleGenerator>,
        config: EngineConfig,
    ) -> Self {
        Self {
            resolver,
            persistence,
            generator,
            config,
        }
    }

    fn prepare(&self, metadata: &mut Metadata, conditions: Vec<&mut Condition>) -> Resolution {
        if metadata.scope.is_none() {
            metadata.scope = Some(self.config.system_scope.clone());
        }
        let mut resolved = true;
        for condition in conditions {
            resolved &= self.resolver.resolve(condition);
        }
        let was_missing = metadata.missing_plugins;
        metadata.missing_plugins = !resolved;
        if was_missing != metadata.missing_plugins {
            info!(id = %metadata.id, missing_plugins = metadata.missing_plugins, "Missing plugins state changed");
        }
        if !metadata.enabled {
            Resolution::Disabled
        } else if !resolved {
            Resolution::MissingPlugins
        } else {
            Resolution::Active
        }
    }

    /// 活动所有者同步生成规则; 禁用所有者解除全部关联; 缺插件时保持原状
    async fn sync_owner(
        &self,
        metadata: &Metadata,
        resolution: &Resolution,
        conditions: Vec<&mut Condition>,
    ) -> Result<(), RuleError> {
        match resolution {
            Resolution::Active => {
                let mut keys = BTreeSet::new();
                for condition in conditions {
                    keys.extend(self.generator.sync_generated_rules(metadata, condition).await?);
                }
                self.generator.retract_owner(&metadata.id, &keys).await?;
            }
            Resolution::Disabled => {
                self.generator.retract_owner(&metadata.id, &BTreeSet::new()).await?;
            }
            Resolution::MissingPlugins => {}
        }
        Ok(())
    }

    pub async fn set_segment(&self, mut segment: Segment) -> Result<Segment, RuleError> {
        let resolution = self.prepare(&mut segment.metadata, segment.condition.iter_mut().collect());
        self.sync_owner(&segment.metadata, &resolution, segment.condition.iter_mut().collect())
            .await?;
        self.persistence.save(&Item::Segment(segment.clone())).await?;
        debug!(segment = %segment.metadata.id, "Segment saved");

        match resolution {
            Resolution::Active | Resolution::Disabled => {
                self.update_existing_profiles_for_segment(&segment).await?;
            }
            Resolution::MissingPlugins => {}
        }
        Ok(segment)
    }

    pub async fn get_segment(&self, segment_id: &str) -> Result<Option<Segment>, RuleError> {
        let segment = self
            .persistence
            .load(segment_id, ItemType::Segment)
            .await?
            .and_then(Item::into_segment);
        Ok(segment.map(|mut segment| {
            if let Some(condition) = segment.condition.as_mut() {
                self.resolver.resolve(condition);
            }
            segment
        }))
    }

    /// 删除分群: 清除 profile 成员关系并解除生成规则
    pub async fn remove_segment(&self, segment_id: &str) -> Result<bool, RuleError> {
        let members = self.segment_members(segment_id).await?;
        for mut profile in members {
            profile.segments.remove(segment_id);
            self.write_segments(&profile).await?;
        }
        let removed = self.persistence.remove(segment_id, ItemType::Segment).await?;
        self.generator.retract_owner(segment_id, &BTreeSet::new()).await?;
        info!(segment = %segment_id, "Segment removed");
        Ok(removed)
    }

    pub async fn segment_metadatas(&self) -> Result<Vec<Metadata>, RuleError> {
        let segments = self.persistence.query(None, None, ItemType::Segment, 0, None).await?;
        Ok(segments
            .list
            .into_iter()
            .filter_map(Item::into_segment)
            .map(|s| s.metadata)
            .collect())
    }

    async fn segment_members(&self, segment_id: &str) -> Result<Vec<Profile>, RuleError> {
        let membership = Condition::property(
            PROFILE_PROPERTY_CONDITION,
            "segments",
            "equals",
            Value::from(segment_id),
        );
        let profiles = self
            .persistence
            .query(Some(&membership), None, ItemType::Profile, 0, None)
            .await?;
        Ok(profiles.list.into_iter().filter_map(Item::into_profile).collect())
    }

    async fn write_segments(&self, profile: &Profile) -> Result<(), RuleError> {
        let segments = serde_json::to_value(&profile.segments)?;
        self.persistence
            .update(&profile.item_id, ItemType::Profile, "segments", segments)
            .await?;
        Ok(())
    }

    /// 按分群条件重算已有 profile 的成员关系; 禁用的分群清空成员
    pub async fn update_existing_profiles_for_segment(&self, segment: &Segment) -> Result<(usize, usize), RuleError> {
        let segment_id = segment.metadata.id.as_str();
        let previous = self.segment_members(segment_id).await?;

        let current: Vec<Profile> = match (&segment.condition, segment.metadata.is_active()) {
            (Some(condition), true) => self
                .persistence
                .query(Some(condition), None, ItemType::Profile, 0, None)
                .await?
                .list
                .into_iter()
                .filter_map(Item::into_profile)
                .collect(),
            _ => Vec::new(),
        };
        let current_ids: BTreeSet<&str> = current.iter().map(|p| p.item_id.as_str()).collect();
        let previous_ids: BTreeSet<&str> = previous.iter().map(|p| p.item_id.as_str()).collect();

        let mut added = 0;
        for profile in current.iter().filter(|p| !previous_ids.contains(p.item_id.as_str())) {
            let mut profile = profile.clone();
            profile.segments.insert(segment_id.to_string());
            self.write_segments(&profile).await?;
            added += 1;
        }
        let mut removed = 0;
        for profile in previous.iter().filter(|p| !current_ids.contains(p.item_id.as_str())) {
            let mut profile = profile.clone();
            profile.segments.remove(segment_id);
            self.write_segments(&profile).await?;
            removed += 1;
        }
        info!(segment = %segment_id, added, removed, "Segment membership updated");
        Ok((added, removed))
    }

    pub async fn set_scoring(&self, mut scoring: Scoring) -> Result<Scoring, RuleError> {
        let resolution = self.prepare(
            &mut scoring.metadata,
            scoring.elements.iter_mut().filter_map(|e| e.condition.as_mut()).collect(),
        );
        self.sync_owner(
            &scoring.metadata,
            &resolution,
            scoring.elements.iter_mut().filter_map(|e| e.condition.as_mut()).collect(),
        )
        .await?;
        self.persistence.save(&Item::Scoring(scoring.clone())).await?;
        debug!(scoring = %scoring.metadata.id, "Scoring saved");
        Ok(scoring)
    }

    pub async fn get_scoring(&self, scoring_id: &str) -> Result<Option<Scoring>, RuleError> {
        let scoring = self
            .persistence
            .load(scoring_id, ItemType::Scoring)
            .await?
            .and_then(Item::into_scoring);
        Ok(scoring.map(|mut scoring| {
            for condition in scoring.elements.iter_mut().filter_map(|e| e.condition.as_mut()) {
                self.resolver.resolve(condition);
            }
            scoring
        }))
    }

    pub async fn remove_scoring(&self, scoring_id: &str) -> Result<bool, RuleError> {
        let removed = self.persistence.remove(scoring_id, ItemType::Scoring).await?;
        self.generator.retract_owner(scoring_id, &BTreeSet::new()).await?;
        Ok(removed)
    }

    pub async fn set_goal(&self, mut goal: Goal) -> Result<Goal, RuleError> {
        let resolution = self.prepare(
            &mut goal.metadata,
            goal.start_event.iter_mut().chain(goal.target_event.iter_mut()).collect(),
        );
        self.sync_owner(
            &goal.metadata,
            &resolution,
            goal.start_event.iter_mut().chain(goal.target_event.iter_mut()).collect(),
        )
        .await?;
        self.persistence.save(&Item::Goal(goal.clone())).await?;
        debug!(goal = %goal.metadata.id, "Goal saved");
        Ok(goal)
    }

    pub async fn get_goal(&self, goal_id: &str) -> Result<Option<Goal>, RuleError> {
        let goal = self
            .persistence
            .load(goal_id, ItemType::Goal)
            .await?
            .and_then(Item::into_goal);
        Ok(goal.map(|mut goal| {
            for condition in goal.start_event.iter_mut().chain(goal.target_event.iter_mut()) {
                self.resolver.resolve(condition);
            }
            goal
        }))
    }

    pub async fn remove_goal(&self, goal_id: &str) -> Result<bool, RuleError> {
        let removed = self.persistence.remove(goal_id, ItemType::Goal).await?;
        self.generator.retract_owner(goal_id, &BTreeSet::new()).await?;
        Ok(removed)
    }

    /// profile 当前所属的分群与各评分得分
    pub async fn segments_and_scores(
        &self,
        profile: &Profile,
    ) -> Result<(BTreeSet<String>, BTreeMap<String, i64>), RuleError> {
        let item = Item::Profile(profile.clone());
        let mut segments = BTreeSet::new();
        let stored = self.persistence.query(None, None, ItemType::Segment, 0, None).await?;
        for segment in stored.list.into_iter().filter_map(Item::into_segment) {
            if !segment.metadata.is_active() {
                continue;
            }
            if let Some(mut condition) = segment.condition {
                self.resolver.resolve(&mut condition);
                if self.persistence.test_match(&condition, &item) {
                    segments.insert(segment.metadata.id);
                }
            }
        }

        let mut scores = BTreeMap::new();
        let stored = self.persistence.query(None, None, ItemType::Scoring, 0, None).await?;
        for scoring in stored.list.into_iter().filter_map(Item::into_scoring) {
            if !scoring.metadata.is_active() {
                continue;
            }
            let mut score = 0;
            for element in scoring.elements {
                if let Some(mut condition) = element.condition {
                    self.resolver.resolve(&mut condition);
                    if self.persistence.test_match(&condition, &item) {
                        score += element.value;
                    }
                }
            }
            scores.insert(scoring.metadata.id, score);
        }
        Ok((segments, scores))
    }

    /// 类型集合变化后重新评估分群/评分/目标的 missingPlugins
    ///
    /// 返回状态发生变化的对象 id。
    pub async fn refresh_missing_plugins(&self) -> Result<Vec<String>, RuleError> {
        let mut changed = Vec::new();

        let segments = self.persistence.query(None, None, ItemType::Segment, 0, None).await?;
        for segment in segments.list.into_iter().filter_map(Item::into_segment) {
            let before = segment.metadata.missing_plugins;
            let id = segment.metadata.id.clone();
            if self.needs_refresh(before, segment.condition.iter().collect()) {
                match self.set_segment(segment).await {
                    Ok(saved) if saved.metadata.missing_plugins != before => changed.push(id),
                    Ok(_) => {}
                    Err(e) => error!(segment = %id, error = %e, "Failed to refresh segment"),
                }
            }
        }

        let scorings = self.persistence.query(None, None, ItemType::Scoring, 0, None).await?;
        for scoring in scorings.list.into_iter().filter_map(Item::into_scoring) {
            let before = scoring.metadata.missing_plugins;
            let id = scoring.metadata.id.clone();
            let conditions = scoring.elements.iter().filter_map(|e| e.condition.as_ref()).collect();
            if self.needs_refresh(before, conditions) {
                match self.set_scoring(scoring).await {
                    Ok(saved) if saved.metadata.missing_plugins != before => changed.push(id),
                    Ok(_) => {}
                    Err(e) => error!(scoring = %id, error = %e, "Failed to refresh scoring"),
                }
            }
        }

        let goals = self.persistence.query(None, None, ItemType::Goal, 0, None).await?;
        for goal in goals.list.into_iter().filter_map(Item::into_goal) {
            let before = goal.metadata.missing_plugins;
            let id = goal.metadata.id.clone();
            let conditions = goal.start_event.iter().chain(goal.target_event.iter()).collect();
            if self.needs_refresh(before, conditions) {
                match self.set_goal(goal).await {
                    Ok(saved) if saved.metadata.missing_plugins != before => changed.push(id),
                    Ok(_) => {}
                    Err(e) => error!(goal = %id, error = %e, "Failed to refresh goal"),
                }
            }
        }
        Ok(changed)
    }

    fn needs_refresh(&self, missing_plugins: bool, conditions: Vec<&Condition>) -> bool {
        let resolved = conditions.into_iter().all(|condition| {
            let mut condition = condition.clone();
            self.resolver.resolve(&mut condition)
        });
        resolved == missing_plugins
    }
}
