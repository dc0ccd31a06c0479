#![allow(dead_code)]

use async_trait::async_trait;
use cxs_rs::{
    Action, ActionExecutor, ActionType, ContextServer, DispatchContext, EngineConfig, Event,
    EventChanges, InMemoryPersistence, PluginDefinitions, RuleError,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub const COUNT_ACTION: &str = "countAction";

/// 计数执行器, 返回固定的变更标记
pub struct CountingAction {
    pub calls: AtomicUsize,
    pub changes: EventChanges,
}

impl CountingAction {
    pub fn new(changes: EventChanges) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            changes,
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ActionExecutor for CountingAction {
    async fn execute<'a>(
        &self,
        _action: &Action,
        _event: &mut Event,
        _ctx: &DispatchContext<'a>,
    ) -> Result<EventChanges, RuleError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.changes)
    }
}

pub async fn server_with(config: EngineConfig) -> (Arc<InMemoryPersistence>, ContextServer) {
    let store = Arc::new(InMemoryPersistence::new());
    let server = ContextServer::start(store.clone(), config).await.unwrap();
    (store, server)
}

pub async fn server() -> (Arc<InMemoryPersistence>, ContextServer) {
    server_with(EngineConfig::default()).await
}

/// 注册 `countAction` 及其执行器
pub async fn load_counter(server: &ContextServer, changes: EventChanges) -> Arc<CountingAction> {
    let counter = CountingAction::new(changes);
    let mut definitions = PluginDefinitions::new("counter");
    definitions.actions.push(ActionType::new(COUNT_ACTION, "count"));
    server
        .on_plugin_load(definitions, vec![("count", counter.clone() as Arc<dyn ActionExecutor>)])
        .await
        .unwrap();
    counter
}
