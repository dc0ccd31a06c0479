mod condition;
mod context;
mod definition;
mod error;
mod event;
mod item;
mod metadata;
mod rule;

pub use condition::*;
pub use context::*;
pub use definition::*;
pub use error::*;
pub use event::*;
pub use item::*;
pub use metadata::*;
pub use rule::*;

/// 保留的系统租户, 其他租户的类型查找回退到这里
pub const SYSTEM_TENANT: &str = "system";
