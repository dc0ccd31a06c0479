use crate::types::{Action, DispatchContext, Event, EventChanges, RuleError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, warn};

/// 动作执行器, 由 ActionType 的 `actionExecutor` 引用
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute<'a>(
        &self,
        action: &Action,
        event: &mut Event,
        ctx: &DispatchContext<'a>,
    ) -> Result<EventChanges, RuleError>;
}

struct RegisteredExecutor {
    plugin_id: String,
    executor: Arc<dyn ActionExecutor>,
}

/// 执行器注册表
#[derive(Default)]
pub struct ActionDispatcher {
    executors: RwLock<HashMap<String, RegisteredExecutor>>,
}

impl ActionDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, plugin_id: &str, executor_id: &str, executor: Arc<dyn ActionExecutor>) {
        self.executors.write().await.insert(
            executor_id.to_string(),
            RegisteredExecutor {
                plugin_id: plugin_id.to_string(),
                executor,
            },
        );
    }

    /// 移除插件注册的全部执行器, 返回其 id
    pub async fn remove_executors(&self, plugin_id: &str) -> Vec<String> {
        let mut executors = self.executors.write().await;
        let ids: Vec<String> = executors
            .iter()
            .filter(|(_, e)| e.plugin_id == plugin_id)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &ids {
            executors.remove(id);
        }
        ids
    }

    pub async fn executor(&self, executor_id: &str) -> Option<Arc<dyn ActionExecutor>> {
        self.executors
            .read()
            .await
            .get(executor_id)
            .map(|e| e.executor.clone())
    }

    pub async fn executor_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.executors.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// 执行单个已解析的动作; 未知执行器返回 NO_CHANGE
    pub async fn execute<'a>(
        &self,
        action: &Action,
        event: &mut Event,
        ctx: &DispatchContext<'a>,
    ) -> EventChanges {
        let Some(action_type) = &action.action_type else {
            warn!(action_type = %action.type_id, "Skipping unresolved action");
            return EventChanges::NO_CHANGE;
        };
        let Some(executor) = self.executor(&action_type.action_executor).await else {
            warn!(
                action_type = %action.type_id,
                executor = %action_type.action_executor,
                "No executor registered for action"
            );
            return EventChanges::NO_CHANGE;
        };
        match executor.execute(action, event, ctx).await {
            Ok(changes) => changes,
            Err(e) => {
                error!(action_type = %action.type_id, error = %e, "Action execution failed");
                EventChanges::ERROR
            }
        }
    }
}
