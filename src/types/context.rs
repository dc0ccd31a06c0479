use super::{Event, EventChanges};
use crate::config::EngineConfig;
use crate::event::EventService;
use crate::persistence::Persistence;
use std::sync::Arc;

/// 一次 `send` 级联中传给监听器与动作执行器的上下文
#[derive(Clone, Copy)]
pub struct DispatchContext<'a> {
    pub events: &'a EventService,
    /// 当前级联深度, 顶层 `send` 为 0
    pub depth: usize,
}

impl<'a> DispatchContext<'a> {
    pub fn new(events: &'a EventService, depth: usize) -> Self {
        Self { events, depth }
    }

    pub fn persistence(&self) -> &'a Arc<dyn Persistence> {
        self.events.persistence()
    }

    pub fn config(&self) -> &'a EngineConfig {
        self.events.config()
    }

    /// 在下一层级发送级联事件
    pub async fn send(&self, event: &mut Event) -> EventChanges {
        self.events.send_nested(event, self.depth + 1).await
    }
}
