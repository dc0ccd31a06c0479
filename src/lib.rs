pub mod actions;
pub mod condition;
pub mod config;
pub mod engine;
pub mod event;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod persistence;
pub mod plugin;
pub mod registry;
pub mod segments;
pub mod server;
pub mod types;

pub use config::EngineConfig;
pub use engine::{ActionExecutor, AutoRuleGenerator, RuleEngine};
pub use event::{EventListener, EventService};
pub use persistence::{InMemoryPersistence, Persistence};
pub use plugin::{DefinitionLoader, PluginDefinitions};
pub use registry::TypeRegistry;
pub use segments::SegmentService;
pub use server::ContextServer;
pub use types::*;
