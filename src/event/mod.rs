mod listener;

pub use listener::{EventListener, ListenerManager};

use crate::config::EngineConfig;
use crate::persistence::{Persistence, TermsAggregate};
use crate::types::{
    Condition, DispatchContext, Event, EventChanges, Item, ItemRef, ItemType, RuleError,
    MATCH_ALL_CONDITION, PROFILE_UPDATED_EVENT,
};
use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, warn};

/// 事件分发管道
///
/// 持久化 → 监听器扇出 → profile 变更时级联 `profileUpdated`,
/// 级联深度受 `max_recursion_depth` 限制。
pub struct EventService {
    persistence: Arc<dyn Persistence>,
    config: EngineConfig,
    listeners: RwLock<ListenerManager>,
    predefined_event_types: BTreeSet<String>,
}

impl EventService {
    pub fn new(persistence: Arc<dyn Persistence>, config: EngineConfig) -> Self {
        Self {
            persistence,
            config,
            listeners: RwLock::new(ListenerManager::new()),
            predefined_event_types: BTreeSet::new(),
        }
    }

    pub fn with_predefined_event_types(mut self, event_types: &[&str]) -> Self {
        self.predefined_event_types
            .extend(event_types.iter().map(|t| t.to_string()));
        self
    }

    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        &self.persistence
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub async fn add_listener(&self, listener: Arc<dyn EventListener>) {
        self.listeners.write().await.add_listener(listener);
    }

    pub async fn listener_count(&self) -> usize {
        self.listeners.read().await.len()
    }

    /// 顶层入口; 结果含 PROFILE_UPDATED / SESSION_UPDATED 时保存 profile / session
    pub async fn send(&self, event: &mut Event) -> EventChanges {
        let mut changes = self.send_nested(event, 0).await;

        if changes.contains(EventChanges::PROFILE_UPDATED) {
            if let Some(profile) = &event.profile {
                if let Err(e) = self.persistence.save(&Item::Profile(profile.clone())).await {
                    error!(profile = %profile.item_id, error = %e, "Failed to save updated profile");
                    changes |= EventChanges::ERROR;
                }
            }
        }
        if changes.contains(EventChanges::SESSION_UPDATED) {
            if let Some(session) = &event.session {
                if let Err(e) = self.persistence.save(&Item::Session(session.clone())).await {
                    error!(session = %session.item_id, error = %e, "Failed to save updated session");
                    changes |= EventChanges::ERROR;
                }
            }
        }
        changes
    }

    pub(crate) fn send_nested<'a>(
        &'a self,
        event: &'a mut Event,
        depth: usize,
    ) -> Pin<Box<dyn Future<Output = EventChanges> + Send + 'a>> {
        Box::pin(async move {
            if depth > self.config.max_recursion_depth {
                warn!(
                    event_type = %event.event_type,
                    depth,
                    "Max recursion depth reached, stopping event cascade"
                );
                #[cfg(feature = "metrics")]
                crate::metrics::CASCADE_ABORTS.inc();
                return EventChanges::NO_CHANGE;
            }

            if event.persistent {
                if let Err(e) = self.persistence.save(&Item::Event(event.clone())).await {
                    error!(event_id = %event.item_id, event_type = %event.event_type, error = %e, "Failed to persist event, skipping listeners");
                    #[cfg(feature = "metrics")]
                    crate::metrics::SAVE_FAILURES.inc();
                    return EventChanges::NO_CHANGE;
                }
                let time_stamp = event.time_stamp;
                if let Some(session) = event.session.as_mut() {
                    session.last_event_date = Some(time_stamp);
                }
            }

            if event.profile.is_none() {
                return EventChanges::NO_CHANGE;
            }

            #[cfg(feature = "metrics")]
            crate::metrics::EVENTS_DISPATCHED
                .with_label_values(&[event.event_type.as_str()])
                .inc();
            debug!(event_type = %event.event_type, depth, "Dispatching event");

            let listeners = self.listeners.read().await.snapshot();
            let ctx = DispatchContext::new(self, depth);
            let mut changes = ListenerManager::dispatch(&listeners, event, &ctx).await;

            if changes.contains(EventChanges::PROFILE_UPDATED) {
                let target = event
                    .profile
                    .as_ref()
                    .map(|p| ItemRef::new("profile", &p.item_id));
                let mut profile_updated = event.derive(PROFILE_UPDATED_EVENT, target);
                profile_updated.source = event.source.clone();
                changes |= ctx.send(&mut profile_updated).await;

                // 级联中对 profile/session 的修改回流到触发事件
                event.absorb(profile_updated);
                if event.session.is_some() {
                    changes |= EventChanges::SESSION_UPDATED;
                }
            }
            changes
        })
    }

    /// 预定义事件类型与已存储事件类型的并集
    pub async fn event_type_ids(&self) -> Result<BTreeSet<String>, RuleError> {
        let stored = self
            .persistence
            .aggregate_query(
                &Condition::new(MATCH_ALL_CONDITION),
                &TermsAggregate::new("eventType"),
                ItemType::Event,
            )
            .await?;
        let mut ids = self.predefined_event_types.clone();
        ids.extend(stored.into_keys());
        Ok(ids)
    }
}
