use crate::actions::builtin_executors;
use crate::condition::ConditionResolver;
use crate::config::EngineConfig;
use crate::engine::{ActionDispatcher, ActionExecutor, AutoRuleGenerator, RuleEngine};
use crate::event::EventService;
use crate::persistence::Persistence;
use crate::plugin::{base_plugin, DefinitionLoader, PluginDefinitions};
use crate::registry::TypeRegistry;
use crate::segments::SegmentService;
use crate::types::{Event, EventChanges, ItemType, RuleError};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{error, info, warn};

/// 上下文服务: 组装类型注册表、规则引擎、分群服务与事件管道
pub struct ContextServer {
    config: EngineConfig,
    registry: Arc<TypeRegistry>,
    persistence: Arc<dyn Persistence>,
    dispatcher: Arc<ActionDispatcher>,
    rules: Arc<RuleEngine>,
    generator: Arc<AutoRuleGenerator>,
    segments: Arc<SegmentService>,
    events: Arc<EventService>,
}

impl ContextServer {
    pub async fn new(persistence: Arc<dyn Persistence>, config: EngineConfig) -> Self {
        let registry = Arc::new(TypeRegistry::new(&config.system_tenant));
        let resolver = ConditionResolver::new(registry.clone(), &config.system_tenant);
        let dispatcher = Arc::new(ActionDispatcher::new());
        let rules = Arc::new(RuleEngine::new(
            resolver.clone(),
            persistence.clone(),
            dispatcher.clone(),
            config.clone(),
        ));
        let generator = Arc::new(AutoRuleGenerator::new(
            resolver.clone(),
            persistence.clone(),
            rules.clone(),
            config.clone(),
        ));
        let segments = Arc::new(SegmentService::new(
            resolver,
            persistence.clone(),
            generator.clone(),
            config.clone(),
        ));
        let events = Arc::new(EventService::new(persistence.clone(), config.clone()));
        events.add_listener(rules.clone()).await;

        Self {
            config,
            registry,
            persistence,
            dispatcher,
            rules,
            generator,
            segments,
            events,
        }
    }

    /// 加载基础插件, 之后加载 `definitions_dir` 下的插件并恢复已存储的规则
    pub async fn start(persistence: Arc<dyn Persistence>, config: EngineConfig) -> Result<Self, RuleError> {
        config.validate()?;
        let server = Self::new(persistence, config).await;
        server.on_plugin_load(base_plugin(), builtin_executors()).await?;
        if let Some(dir) = server.config.definitions_dir.clone() {
            server.load_definitions_dir(&dir).await?;
        }
        let loaded = server.rules.load_rules().await?;
        info!(rules = loaded, "Context server started");
        Ok(server)
    }

    /// `dir` 的每个子目录作为一个插件加载, 目录名即插件 id
    pub async fn load_definitions_dir(&self, dir: &std::path::Path) -> Result<Vec<String>, RuleError> {
        let mut plugins = Vec::new();
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                plugins.push((name.to_string(), entry.path()));
            }
        }
        plugins.sort();

        let mut loaded = Vec::new();
        for (plugin_id, path) in plugins {
            let (definitions, _) = DefinitionLoader::load_dir(&path, &plugin_id).await?;
            self.on_plugin_load(definitions, Vec::new()).await?;
            loaded.push(plugin_id);
        }
        Ok(loaded)
    }

    /// 插件加载: 注册类型与执行器, 恢复可解析的对象, 安装预定义对象
    pub async fn on_plugin_load(
        &self,
        definitions: PluginDefinitions,
        executors: Vec<(&str, Arc<dyn ActionExecutor>)>,
    ) -> Result<(), RuleError> {
        let plugin_id = definitions.plugin_id.clone();
        self.registry.on_load(
            &plugin_id,
            self.registry.system_tenant(),
            definitions.tags.clone(),
            definitions.types(),
        );
        for (executor_id, executor) in executors {
            self.dispatcher.register(&plugin_id, executor_id, executor).await;
        }

        let restored = self.rules.on_types_added().await?;
        let refreshed = self.segments.refresh_missing_plugins().await?;
        if !restored.is_empty() || !refreshed.is_empty() {
            info!(plugin = %plugin_id, rules = ?restored, owners = ?refreshed, "Objects re-enabled after plugin load");
        }

        self.install_predefined(definitions).await?;
        Ok(())
    }

    /// 插件卸载: 移除类型与执行器, 引用它们的对象标记为 missingPlugins
    pub async fn on_plugin_unload(&self, plugin_id: &str) -> Result<(), RuleError> {
        let removed: BTreeSet<String> = self
            .registry
            .on_unload(plugin_id, self.registry.system_tenant())
            .iter()
            .map(|ty| ty.id().to_string())
            .collect();
        let executors = self.dispatcher.remove_executors(plugin_id).await;

        let disabled = self.rules.on_types_removed(&removed).await?;
        let refreshed = self.segments.refresh_missing_plugins().await?;
        info!(
            plugin = %plugin_id,
            types = removed.len(),
            executors = executors.len(),
            rules = ?disabled,
            owners = ?refreshed,
            "Plugin unloaded"
        );
        Ok(())
    }

    /// 预定义对象只在同 id 对象不存在时安装, 单个失败不影响其他对象
    async fn install_predefined(&self, definitions: PluginDefinitions) -> Result<(), RuleError> {
        for rule in definitions.rules {
            if self.exists(rule.id(), ItemType::Rule).await? {
                continue;
            }
            let id = rule.id().to_string();
            if let Err(e) = self.rules.install(rule).await {
                error!(plugin = %definitions.plugin_id, rule_id = %id, error = %e, "Failed to install predefined rule");
            }
        }
        for segment in definitions.segments {
            if self.exists(&segment.metadata.id, ItemType::Segment).await? {
                continue;
            }
            let id = segment.metadata.id.clone();
            if let Err(e) = self.segments.set_segment(segment).await {
                error!(plugin = %definitions.plugin_id, segment = %id, error = %e, "Failed to install predefined segment");
            }
        }
        for scoring in definitions.scorings {
            if self.exists(&scoring.metadata.id, ItemType::Scoring).await? {
                continue;
            }
            let id = scoring.metadata.id.clone();
            if let Err(e) = self.segments.set_scoring(scoring).await {
                error!(plugin = %definitions.plugin_id, scoring = %id, error = %e, "Failed to install predefined scoring");
            }
        }
        for goal in definitions.goals {
            if self.exists(&goal.metadata.id, ItemType::Goal).await? {
                continue;
            }
            let id = goal.metadata.id.clone();
            if let Err(e) = self.segments.set_goal(goal).await {
                error!(plugin = %definitions.plugin_id, goal = %id, error = %e, "Failed to install predefined goal");
            }
        }
        Ok(())
    }

    async fn exists(&self, item_id: &str, item_type: ItemType) -> Result<bool, RuleError> {
        Ok(self.persistence.load(item_id, item_type).await?.is_some())
    }

    pub fn remove_tenant(&self, tenant: &str) {
        if tenant == self.config.system_tenant {
            warn!(tenant = %tenant, "Refusing to remove the system tenant");
            return;
        }
        self.registry.remove_tenant(tenant);
    }

    pub async fn send(&self, event: &mut Event) -> EventChanges {
        self.events.send(event).await
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        &self.persistence
    }

    pub fn dispatcher(&self) -> &Arc<ActionDispatcher> {
        &self.dispatcher
    }

    pub fn rules(&self) -> &Arc<RuleEngine> {
        &self.rules
    }

    pub fn generator(&self) -> &Arc<AutoRuleGenerator> {
        &self.generator
    }

    pub fn segments(&self) -> &Arc<SegmentService> {
        &self.segments
    }

    pub fn events(&self) -> &Arc<EventService> {
        &self.events
    }
}
