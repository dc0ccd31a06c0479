use crate::types::{DispatchContext, Event, EventChanges};
use async_trait::async_trait;
use std::sync::Arc;

/// 事件监听器
#[async_trait]
pub trait EventListener: Send + Sync {
    fn can_handle(&self, event: &Event) -> bool;

    async fn on_event<'a>(&self, event: &mut Event, ctx: &DispatchContext<'a>) -> EventChanges;
}

/// 监听器管理器
#[derive(Default)]
pub struct ListenerManager {
    listeners: Vec<Arc<dyn EventListener>>,
}

impl ListenerManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&mut self, listener: Arc<dyn EventListener>) {
        self.listeners.push(listener);
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// 当前监听器列表的副本, 分发时不持有锁
    pub fn snapshot(&self) -> Vec<Arc<dyn EventListener>> {
        self.listeners.clone()
    }

    /// 依次调用能处理该事件的监听器, 结果按位或
    pub async fn dispatch<'a>(
        listeners: &[Arc<dyn EventListener>],
        event: &mut Event,
        ctx: &DispatchContext<'a>,
    ) -> EventChanges {
        let mut changes = EventChanges::NO_CHANGE;
        for listener in listeners {
            if listener.can_handle(event) {
                changes |= listener.on_event(event, ctx).await;
            }
        }
        changes
    }
}
