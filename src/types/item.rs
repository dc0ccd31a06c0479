use super::{Condition, Event, ItemRef, Metadata, Rule, RuleError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub item_id: String,
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
    #[serde(default)]
    pub system_properties: BTreeMap<String, Value>,
    #[serde(default)]
    pub segments: BTreeSet<String>,
    #[serde(default)]
    pub scores: BTreeMap<String, i64>,
}

impl Profile {
    pub fn new(item_id: &str) -> Self {
        Self {
            item_id: item_id.to_string(),
            properties: BTreeMap::new(),
            system_properties: BTreeMap::new(),
            segments: BTreeSet::new(),
            scores: BTreeMap::new(),
        }
    }

    pub fn with_property(mut self, name: &str, value: Value) -> Self {
        self.properties.insert(name.to_string(), value);
        self
    }

    /// `systemProperties.pastEvents.<key>` 中的预聚合计数
    pub fn past_event_count(&self, key: &str) -> Option<i64> {
        self.system_properties
            .get("pastEvents")
            .and_then(|p| p.get(key))
            .and_then(Value::as_i64)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub item_id: String,
    #[serde(default)]
    pub profile_id: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
    #[serde(default)]
    pub time_stamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_event_date: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new(item_id: &str, profile_id: &str, scope: &str) -> Self {
        Self {
            item_id: item_id.to_string(),
            profile_id: Some(profile_id.to_string()),
            scope: Some(scope.to_string()),
            properties: BTreeMap::new(),
            time_stamp: Some(Utc::now()),
            last_event_date: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub metadata: Metadata,
    #[serde(default)]
    pub condition: Option<Condition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoringElement {
    #[serde(default)]
    pub condition: Option<Condition>,
    #[serde(default)]
    pub value: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scoring {
    pub metadata: Metadata,
    #[serde(default)]
    pub elements: Vec<ScoringElement>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Goal {
    pub metadata: Metadata,
    #[serde(default)]
    pub start_event: Option<Condition>,
    #[serde(default)]
    pub target_event: Option<Condition>,
    #[serde(default)]
    pub campaign_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ItemType {
    Event,
    Profile,
    Session,
    Rule,
    Segment,
    Scoring,
    Goal,
    /// 事件 source/target 引用的任意对象
    Custom,
}

impl fmt::Display for ItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ItemType::Event => "event",
            ItemType::Profile => "profile",
            ItemType::Session => "session",
            ItemType::Rule => "rule",
            ItemType::Segment => "segment",
            ItemType::Scoring => "scoring",
            ItemType::Goal => "goal",
            ItemType::Custom => "custom",
        };
        write!(f, "{}", name)
    }
}

/// 持久化层存取的对象
#[derive(Debug, Clone)]
pub enum Item {
    Event(Event),
    Profile(Profile),
    Session(Session),
    Rule(Rule),
    Segment(Segment),
    Scoring(Scoring),
    Goal(Goal),
    Custom(ItemRef),
}

impl Item {
    pub fn item_type(&self) -> ItemType {
        match self {
            Item::Event(_) => ItemType::Event,
            Item::Profile(_) => ItemType::Profile,
            Item::Session(_) => ItemType::Session,
            Item::Rule(_) => ItemType::Rule,
            Item::Segment(_) => ItemType::Segment,
            Item::Scoring(_) => ItemType::Scoring,
            Item::Goal(_) => ItemType::Goal,
            Item::Custom(_) => ItemType::Custom,
        }
    }

    pub fn item_id(&self) -> &str {
        match self {
            Item::Event(e) => &e.item_id,
            Item::Profile(p) => &p.item_id,
            Item::Session(s) => &s.item_id,
            Item::Rule(r) => &r.metadata.id,
            Item::Segment(s) => &s.metadata.id,
            Item::Scoring(s) => &s.metadata.id,
            Item::Goal(g) => &g.metadata.id,
            Item::Custom(r) => &r.item_id,
        }
    }

    pub fn to_json(&self) -> Result<Value, RuleError> {
        let value = match self {
            Item::Event(e) => serde_json::to_value(e)?,
            Item::Profile(p) => serde_json::to_value(p)?,
            Item::Session(s) => serde_json::to_value(s)?,
            Item::Rule(r) => serde_json::to_value(r)?,
            Item::Segment(s) => serde_json::to_value(s)?,
            Item::Scoring(s) => serde_json::to_value(s)?,
            Item::Goal(g) => serde_json::to_value(g)?,
            Item::Custom(r) => serde_json::to_value(r)?,
        };
        Ok(value)
    }

    pub fn from_json(item_type: ItemType, value: Value) -> Result<Item, RuleError> {
        let item = match item_type {
            ItemType::Event => Item::Event(serde_json::from_value(value)?),
            ItemType::Profile => Item::Profile(serde_json::from_value(value)?),
            ItemType::Session => Item::Session(serde_json::from_value(value)?),
            ItemType::Rule => Item::Rule(serde_json::from_value(value)?),
            ItemType::Segment => Item::Segment(serde_json::from_value(value)?),
            ItemType::Scoring => Item::Scoring(serde_json::from_value(value)?),
            ItemType::Goal => Item::Goal(serde_json::from_value(value)?),
            ItemType::Custom => Item::Custom(serde_json::from_value(value)?),
        };
        Ok(item)
    }
}

macro_rules! item_accessors {
    ($($variant:ident => $fn_name:ident, $ty:ty);+ $(;)?) => {
        impl Item {
            $(pub fn $fn_name(self) -> Option<$ty> {
                match self {
                    Item::$variant(inner) => Some(inner),
                    _ => None,
                }
            })+
        }
    };
}

item_accessors! {
    Event => into_event, Event;
    Profile => into_profile, Profile;
    Session => into_session, Session;
    Rule => into_rule, Rule;
    Segment => into_segment, Segment;
    Scoring => into_scoring, Scoring;
    Goal => into_goal, Goal;
}

/// 分页查询结果
#[derive(Debug, Clone)]
pub struct PartialList<T> {
    pub list: Vec<T>,
    pub offset: usize,
    pub page_size: usize,
    pub total_size: usize,
}
