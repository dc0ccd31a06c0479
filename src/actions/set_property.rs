use crate::engine::ActionExecutor;
use crate::persistence::evaluator::{assign, lookup};
use crate::types::{Action, DispatchContext, Event, EventChanges, ParameterValue, RuleError};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, warn};

pub const SET_PROPERTY_EXECUTOR: &str = "setProperty";

/// 设置 profile (或 session) 属性
///
/// 参数: `setPropertyName`, `setPropertyValue` ("now" 表示当前时间),
/// `storeInSession`。
pub struct SetPropertyAction;

impl SetPropertyAction {
    fn value(action: &Action) -> Value {
        match action.parameter("setPropertyValue").map(ParameterValue::to_json) {
            Some(Value::String(s)) if s == "now" => Value::String(Utc::now().to_rfc3339()),
            Some(value) => value,
            None => Value::Null,
        }
    }
}

/// 写入点分路径, 值未变化时返回 false
fn set_path(root: &mut BTreeMap<String, Value>, path: &str, value: Value) -> bool {
    match path.split_once('.') {
        None => {
            if root.get(path) == Some(&value) {
                return false;
            }
            root.insert(path.to_string(), value);
            true
        }
        Some((head, rest)) => {
            let entry = root
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Default::default()));
            if lookup(entry, rest) == Some(&value) {
                return false;
            }
            assign(entry, rest, value);
            true
        }
    }
}

#[async_trait]
impl ActionExecutor for SetPropertyAction {
    async fn execute<'a>(
        &self,
        action: &Action,
        event: &mut Event,
        _ctx: &DispatchContext<'a>,
    ) -> Result<EventChanges, RuleError> {
        let Some(name) = action.str_parameter("setPropertyName") else {
            warn!("setPropertyAction without setPropertyName");
            return Ok(EventChanges::NO_CHANGE);
        };
        let value = Self::value(action);
        let in_session = action
            .parameter("storeInSession")
            .and_then(ParameterValue::as_scalar)
            .and_then(Value::as_bool)
            .unwrap_or(false);

        if in_session {
            let Some(session) = event.session.as_mut() else {
                return Ok(EventChanges::NO_CHANGE);
            };
            let path = name.strip_prefix("properties.").unwrap_or(name);
            if set_path(&mut session.properties, path, value) {
                debug!(session = %session.item_id, property = %name, "Session property set");
                return Ok(EventChanges::SESSION_UPDATED);
            }
            return Ok(EventChanges::NO_CHANGE);
        }

        let Some(profile) = event.profile.as_mut() else {
            return Ok(EventChanges::NO_CHANGE);
        };
        let changed = match name.strip_prefix("systemProperties.") {
            Some(path) => set_path(&mut profile.system_properties, path, value),
            None => set_path(
                &mut profile.properties,
                name.strip_prefix("properties.").unwrap_or(name),
                value,
            ),
        };
        if changed {
            debug!(profile = %profile.item_id, property = %name, "Profile property set");
            Ok(EventChanges::PROFILE_UPDATED)
        } else {
            Ok(EventChanges::NO_CHANGE)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::event::EventService;
    use crate::persistence::InMemoryPersistence;
    use crate::types::{Profile, Session};
    use serde_json::json;
    use std::sync::Arc;

    fn service() -> EventService {
        EventService::new(Arc::new(InMemoryPersistence::new()), EngineConfig::default())
    }

    #[tokio::test]
    async fn sets_nested_profile_property_once() {
        let events = service();
        let ctx = DispatchContext::new(&events, 0);
        let mut event = Event::new("form", "site", Some(Profile::new("p1")), None);
        let action = Action::new("setPropertyAction")
            .with_parameter("setPropertyName", "properties.address.city")
            .with_parameter("setPropertyValue", "Paris");

        let changes = SetPropertyAction.execute(&action, &mut event, &ctx).await.unwrap();
        assert_eq!(changes, EventChanges::PROFILE_UPDATED);
        let profile = event.profile.as_ref().unwrap();
        assert_eq!(profile.properties.get("address"), Some(&json!({ "city": "Paris" })));

        let again = SetPropertyAction.execute(&action, &mut event, &ctx).await.unwrap();
        assert_eq!(again, EventChanges::NO_CHANGE);
    }

    #[tokio::test]
    async fn system_properties_and_session_targets() {
        let events = service();
        let ctx = DispatchContext::new(&events, 0);
        let mut event = Event::new(
            "view",
            "site",
            Some(Profile::new("p1")),
            Some(Session::new("s1", "p1", "site")),
        );

        let system = Action::new("setPropertyAction")
            .with_parameter("setPropertyName", "systemProperties.lastVisit")
            .with_parameter("setPropertyValue", "now");
        assert_eq!(
            SetPropertyAction.execute(&system, &mut event, &ctx).await.unwrap(),
            EventChanges::PROFILE_UPDATED
        );
        assert!(event.profile.as_ref().unwrap().system_properties.contains_key("lastVisit"));

        let session = Action::new("setPropertyAction")
            .with_parameter("setPropertyName", "landing")
            .with_parameter("setPropertyValue", "/home")
            .with_parameter("storeInSession", json!(true));
        assert_eq!(
            SetPropertyAction.execute(&session, &mut event, &ctx).await.unwrap(),
            EventChanges::SESSION_UPDATED
        );
        assert_eq!(event.session.as_ref().unwrap().properties.get("landing"), Some(&json!("/home")));
    }
}
