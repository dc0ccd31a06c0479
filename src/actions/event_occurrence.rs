use crate::engine::ActionExecutor;
use crate::types::{
    Action, Condition, DispatchContext, Event, EventChanges, ItemType, RuleError,
    EVENT_PROPERTY_CONDITION,
};
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde_json::{Map, Value};
use tracing::{debug, warn};

pub const SET_EVENT_OCCURRENCE_COUNT_EXECUTOR: &str = "setEventOccurenceCount";

/// 统计 profile 的历史事件数, 写入 `systemProperties.pastEvents.<generatedPropertyKey>`
pub struct SetEventOccurrenceCountAction;

/// `pastEventCondition` 对应的事件查询: eventCondition ∧ profileId ∧ 时间窗口
pub fn past_event_query(past_event: &Condition, profile_id: &str) -> Option<Condition> {
    let event_condition = past_event.condition_parameter("eventCondition")?;
    let mut conditions = vec![
        event_condition.clone(),
        Condition::property(EVENT_PROPERTY_CONDITION, "profileId", "equals", Value::from(profile_id)),
    ];
    conditions.extend(past_event_window(past_event));
    Some(Condition::and(conditions))
}

/// `numberOfDays` / `fromDate` / `toDate` 对应的 timeStamp 条件
pub fn past_event_window(past_event: &Condition) -> Vec<Condition> {
    let mut conditions = Vec::new();
    if let Some(days) = past_event.i64_parameter("numberOfDays") {
        conditions.push(
            Condition::new(EVENT_PROPERTY_CONDITION)
                .with_parameter("propertyName", "timeStamp")
                .with_parameter("comparisonOperator", "greaterThan")
                .with_parameter("propertyValueDateExpr", format!("now-{}d", days)),
        );
    }
    if let Some(from) = past_event.str_parameter("fromDate") {
        conditions.push(
            Condition::new(EVENT_PROPERTY_CONDITION)
                .with_parameter("propertyName", "timeStamp")
                .with_parameter("comparisonOperator", "greaterThanOrEqualTo")
                .with_parameter("propertyValueDate", from),
        );
    }
    if let Some(to) = past_event.str_parameter("toDate") {
        conditions.push(
            Condition::new(EVENT_PROPERTY_CONDITION)
                .with_parameter("propertyName", "timeStamp")
                .with_parameter("comparisonOperator", "lessThanOrEqualTo")
                .with_parameter("propertyValueDate", to),
        );
    }
    conditions
}

fn parse_date(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s).ok().map(|d| d.with_timezone(&Utc))
}

fn in_time_range(past_event: &Condition, at: DateTime<Utc>) -> bool {
    let now = Utc::now();
    if let Some(days) = past_event.i64_parameter("numberOfDays") {
        // 窗口超出可表示范围时与存储查询一致, 不计数
        let Some(window) = TimeDelta::try_days(days) else {
            return false;
        };
        if at > now || now - at > window {
            return false;
        }
    }
    if let Some(from) = past_event.str_parameter("fromDate").and_then(parse_date) {
        if from > at {
            return false;
        }
    }
    if let Some(to) = past_event.str_parameter("toDate").and_then(parse_date) {
        if to < at {
            return false;
        }
    }
    true
}

#[async_trait]
impl ActionExecutor for SetEventOccurrenceCountAction {
    async fn execute<'a>(
        &self,
        action: &Action,
        event: &mut Event,
        ctx: &DispatchContext<'a>,
    ) -> Result<EventChanges, RuleError> {
        let Some(past_event) = action.condition_parameter("pastEventCondition") else {
            warn!("setEventOccurenceCountAction without pastEventCondition");
            return Ok(EventChanges::NO_CHANGE);
        };
        let Some(key) = past_event.str_parameter("generatedPropertyKey") else {
            warn!("pastEventCondition has no generatedPropertyKey");
            return Ok(EventChanges::NO_CHANGE);
        };
        let Some(profile_id) = event.profile_id.clone() else {
            return Ok(EventChanges::NO_CHANGE);
        };
        let Some(query) = past_event_query(past_event, &profile_id) else {
            warn!(key = %key, "pastEventCondition has no eventCondition");
            return Ok(EventChanges::NO_CHANGE);
        };

        let mut count = ctx.persistence().query_count(&query, ItemType::Event).await?;
        // 未持久化的当前事件不在存储中, 单独计入
        if !event.persistent && in_time_range(past_event, event.time_stamp) {
            count += 1;
        }

        let Some(profile) = event.profile.as_mut() else {
            return Ok(EventChanges::NO_CHANGE);
        };
        let past_events = profile
            .system_properties
            .entry("pastEvents".to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !past_events.is_object() {
            *past_events = Value::Object(Map::new());
        }
        past_events[key] = Value::from(count);
        debug!(profile = %profile_id, key = %key, count, "Past event count updated");
        Ok(EventChanges::PROFILE_UPDATED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::event::EventService;
    use crate::persistence::{InMemoryPersistence, Persistence};
    use crate::types::{Item, Profile, PAST_EVENT_CONDITION};
    use std::sync::Arc;

    fn past_purchases(days: i64) -> Condition {
        Condition::new(PAST_EVENT_CONDITION)
            .with_parameter("eventCondition", Condition::event_type("purchase"))
            .with_parameter("numberOfDays", days)
            .with_parameter("generatedPropertyKey", "eventTriggeredabc")
    }

    #[tokio::test]
    async fn counts_matching_events_for_the_profile() {
        let store = Arc::new(InMemoryPersistence::new());
        let mut old = Event::new("purchase", "shop", Some(Profile::new("p1")), None);
        old.time_stamp = Utc::now() - TimeDelta::days(40);
        for event in [
            Event::new("purchase", "shop", Some(Profile::new("p1")), None),
            Event::new("purchase", "shop", Some(Profile::new("p1")), None),
            Event::new("purchase", "shop", Some(Profile::new("p2")), None),
            Event::new("view", "shop", Some(Profile::new("p1")), None),
            old,
        ] {
            store.save(&Item::Event(event)).await.unwrap();
        }
        let events = EventService::new(store.clone(), EngineConfig::default());
        let ctx = DispatchContext::new(&events, 0);

        let action = Action::new("setEventOccurenceCountAction").with_parameter("pastEventCondition", past_purchases(30));
        let mut trigger = Event::new("purchase", "shop", Some(Profile::new("p1")), None);
        let changes = SetEventOccurrenceCountAction.execute(&action, &mut trigger, &ctx).await.unwrap();

        assert_eq!(changes, EventChanges::PROFILE_UPDATED);
        assert_eq!(trigger.profile.as_ref().unwrap().past_event_count("eventTriggeredabc"), Some(2));

        trigger.persistent = false;
        SetEventOccurrenceCountAction.execute(&action, &mut trigger, &ctx).await.unwrap();
        assert_eq!(trigger.profile.as_ref().unwrap().past_event_count("eventTriggeredabc"), Some(3));
    }

    #[test]
    fn oversized_window_counts_nothing() {
        let now = Utc::now();
        assert!(in_time_range(&past_purchases(30), now));
        assert!(!in_time_range(&past_purchases(30), now - TimeDelta::days(31)));
        assert!(!in_time_range(&past_purchases(200_000_000_000), now));
        assert!(!in_time_range(&past_purchases(i64::MAX), now));
    }

    #[test]
    fn query_combines_window_and_profile() {
        let query = past_event_query(&past_purchases(7).with_parameter("toDate", "2030-01-01T00:00:00Z"), "p1").unwrap();
        assert_eq!(query.sub_conditions().unwrap().len(), 4);
        assert!(past_event_query(&Condition::new(PAST_EVENT_CONDITION), "p1").is_none());
    }
}
