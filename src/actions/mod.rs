mod event_occurrence;
mod set_property;

pub use event_occurrence::{
    past_event_query, past_event_window, SetEventOccurrenceCountAction, SET_EVENT_OCCURRENCE_COUNT_EXECUTOR,
};
pub use set_property::{SetPropertyAction, SET_PROPERTY_EXECUTOR};

use crate::engine::ActionExecutor;
use std::sync::Arc;

/// 基础插件自带的执行器
pub fn builtin_executors() -> Vec<(&'static str, Arc<dyn ActionExecutor>)> {
    vec![
        (SET_PROPERTY_EXECUTOR, Arc::new(SetPropertyAction) as Arc<dyn ActionExecutor>),
        (
            SET_EVENT_OCCURRENCE_COUNT_EXECUTOR,
            Arc::new(SetEventOccurrenceCountAction) as Arc<dyn ActionExecutor>,
        ),
    ]
}
