use super::{Profile, Session};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use uuid::Uuid;

pub const PROFILE_UPDATED_EVENT: &str = "profileUpdated";
pub const RULE_FIRED_EVENT: &str = "ruleFired";

/// `send` 的结果位掩码, 沿级联层级按位或合并
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventChanges(u8);

impl EventChanges {
    pub const NO_CHANGE: EventChanges = EventChanges(0);
    pub const SESSION_UPDATED: EventChanges = EventChanges(1);
    pub const PROFILE_UPDATED: EventChanges = EventChanges(2);
    pub const ERROR: EventChanges = EventChanges(4);

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: EventChanges) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for EventChanges {
    type Output = EventChanges;

    fn bitor(self, rhs: Self) -> Self::Output {
        EventChanges(self.0 | rhs.0)
    }
}

impl BitOrAssign for EventChanges {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for EventChanges {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04b}", self.0)
    }
}

/// 事件的 source/target 引用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemRef {
    pub item_id: String,
    pub item_type: String,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
}

impl ItemRef {
    pub fn new(item_type: &str, item_id: &str) -> Self {
        Self {
            item_id: item_id.to_string(),
            item_type: item_type.to_string(),
            scope: None,
            properties: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub item_id: String,
    pub event_type: String,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub profile_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    pub time_stamp: DateTime<Utc>,
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
    #[serde(default)]
    pub source: Option<ItemRef>,
    #[serde(default)]
    pub target: Option<ItemRef>,
    #[serde(default = "default_persistent")]
    pub persistent: bool,
    /// 不持久化的临时属性, 级联事件会继承
    #[serde(skip)]
    pub attributes: BTreeMap<String, Value>,
    #[serde(skip)]
    pub profile: Option<Profile>,
    #[serde(skip)]
    pub session: Option<Session>,
}

fn default_persistent() -> bool {
    true
}

impl Event {
    pub fn new(event_type: &str, scope: &str, profile: Option<Profile>, session: Option<Session>) -> Self {
        Self {
            item_id: Uuid::new_v4().to_string(),
            event_type: event_type.to_string(),
            scope: Some(scope.to_string()),
            profile_id: profile.as_ref().map(|p| p.item_id.clone()),
            session_id: session.as_ref().map(|s| s.item_id.clone()),
            time_stamp: Utc::now(),
            properties: BTreeMap::new(),
            source: None,
            target: None,
            persistent: true,
            attributes: BTreeMap::new(),
            profile,
            session,
        }
    }

    pub fn with_target(mut self, target: ItemRef) -> Self {
        self.target = Some(target);
        self
    }

    pub fn with_source(mut self, source: ItemRef) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_property(mut self, name: &str, value: Value) -> Self {
        self.properties.insert(name.to_string(), value);
        self
    }

    pub fn transient(mut self) -> Self {
        self.persistent = false;
        self
    }

    pub fn scope(&self) -> &str {
        self.scope.as_deref().unwrap_or(super::SYSTEM_SCOPE)
    }

    /// 由当前事件派生的级联事件: 继承 profile/session/scope/属性袋, 不持久化
    pub fn derive(&self, event_type: &str, target: Option<ItemRef>) -> Event {
        let mut child = Event::new(event_type, self.scope(), self.profile.clone(), self.session.clone());
        child.profile_id = self.profile_id.clone();
        child.session_id = self.session_id.clone();
        child.time_stamp = self.time_stamp;
        child.source = Some(ItemRef::new("event", &self.item_id));
        child.target = target;
        child.persistent = false;
        child.attributes = self.attributes.clone();
        child
    }

    /// 取回级联事件上修改过的 profile/session
    pub fn absorb(&mut self, cascaded: Event) {
        if cascaded.profile.is_some() {
            self.profile = cascaded.profile;
        }
        if cascaded.session.is_some() {
            self.session = cascaded.session;
        }
    }

    pub fn as_item_ref(&self) -> ItemRef {
        ItemRef {
            item_id: self.item_id.clone(),
            item_type: "event".to_string(),
            scope: self.scope.clone(),
            properties: self.properties.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn changes_combine_with_bitwise_or() {
        let mut changes = EventChanges::NO_CHANGE;
        assert!(changes.is_empty());
        changes |= EventChanges::PROFILE_UPDATED;
        changes |= EventChanges::SESSION_UPDATED;
        assert!(changes.contains(EventChanges::PROFILE_UPDATED));
        assert!(changes.contains(EventChanges::SESSION_UPDATED));
        assert!(!changes.contains(EventChanges::ERROR));
        assert_eq!(changes.bits(), 3);
        assert!(!changes.contains(EventChanges::NO_CHANGE));
    }

    #[test]
    fn derived_events_are_transient_and_keep_attributes() {
        let profile = Profile::new("p1");
        let mut event = Event::new("login", "site", Some(profile), None);
        event.attributes.insert("trace".into(), Value::from("abc"));

        let child = event.derive(RULE_FIRED_EVENT, Some(ItemRef::new("rule", "r1")));
        assert!(!child.persistent);
        assert_eq!(child.profile_id.as_deref(), Some("p1"));
        assert_eq!(child.attributes.get("trace"), Some(&Value::from("abc")));
        assert_eq!(child.source.as_ref().map(|s| s.item_id.as_str()), Some(event.item_id.as_str()));
        assert_ne!(child.item_id, event.item_id);
    }
}
