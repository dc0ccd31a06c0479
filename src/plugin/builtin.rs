use super::PluginDefinitions;
use crate::actions::{SET_EVENT_OCCURRENCE_COUNT_EXECUTOR, SET_PROPERTY_EXECUTOR};
use crate::types::{
    ActionType, Condition, ConditionType, Parameter, PropertyMergeStrategyType, Tag, ValueType,
    BOOLEAN_CONDITION, CONDITION_TAG, EVENT_CONDITION_TAG, EVENT_PROPERTY_CONDITION,
    EVENT_TYPE_CONDITION, LOGICAL_TAG, MATCH_ALL_CONDITION, NOT_CONDITION, PAST_EVENT_CONDITION,
    PROFILE_CONDITION_TAG, PROFILE_PROPERTY_CONDITION, SESSION_CONDITION_TAG,
    SESSION_PROPERTY_CONDITION, SOURCE_EVENT_CONDITION_TAG, SOURCE_EVENT_PROPERTY_CONDITION,
    TRACKED_CONDITION_TAG,
};
use serde_json::Value;
use std::collections::BTreeSet;

pub const BASE_PLUGIN_ID: &str = "base";

/// 表单提交事件, 由 eventTypeCondition 与 target 条件派生
pub const FORM_EVENT_CONDITION: &str = "formEventCondition";

const ALL_SCOPES: [&str; 6] = [
    CONDITION_TAG,
    LOGICAL_TAG,
    EVENT_CONDITION_TAG,
    PROFILE_CONDITION_TAG,
    SESSION_CONDITION_TAG,
    SOURCE_EVENT_CONDITION_TAG,
];

fn parameter(id: &str, value_type: &str, multivalued: bool) -> Parameter {
    Parameter {
        id: id.to_string(),
        value_type: Some(value_type.to_string()),
        multivalued,
    }
}

fn property_parameters() -> Vec<Parameter> {
    vec![
        parameter("propertyName", "string", false),
        parameter("comparisonOperator", "comparisonOperator", false),
        parameter("propertyValue", "string", false),
        parameter("propertyValueInteger", "integer", false),
        parameter("propertyValueDate", "date", false),
        parameter("propertyValueDateExpr", "string", false),
        parameter("propertyValues", "string", true),
    ]
}

fn condition(id: &str, system_tags: &[&str], parameters: Vec<Parameter>) -> ConditionType {
    let mut ty = ConditionType::new(id).with_system_tags(system_tags);
    ty.parameters = parameters;
    ty
}

fn form_event_condition() -> ConditionType {
    let parent = Condition::and(vec![
        Condition::event_type("form"),
        Condition::property(
            EVENT_PROPERTY_CONDITION,
            "target.itemId",
            "equals",
            Value::from("parameter::formId"),
        ),
    ]);
    let mut ty = ConditionType::new(FORM_EVENT_CONDITION)
        .with_system_tags(&[CONDITION_TAG, EVENT_CONDITION_TAG, TRACKED_CONDITION_TAG])
        .with_parent(parent);
    ty.parameters = vec![parameter("formId", "string", false)];
    ty
}

/// 基础插件: 核心标签、条件类型、动作类型与值类型
pub fn base_plugin() -> PluginDefinitions {
    let mut definitions = PluginDefinitions::new(BASE_PLUGIN_ID);

    definitions.tags.push(Tag::new(CONDITION_TAG, None));
    for tag in [
        LOGICAL_TAG,
        EVENT_CONDITION_TAG,
        PROFILE_CONDITION_TAG,
        SESSION_CONDITION_TAG,
        SOURCE_EVENT_CONDITION_TAG,
        TRACKED_CONDITION_TAG,
    ] {
        definitions.tags.push(Tag::new(tag, Some(CONDITION_TAG)));
    }

    let sub_conditions = vec![
        parameter("operator", "string", false),
        parameter("subConditions", "Condition", true),
    ];
    definitions.conditions = vec![
        condition(BOOLEAN_CONDITION, &ALL_SCOPES, sub_conditions),
        condition(NOT_CONDITION, &ALL_SCOPES, vec![parameter("subCondition", "Condition", false)]),
        condition(MATCH_ALL_CONDITION, &ALL_SCOPES, vec![]),
        condition(
            EVENT_TYPE_CONDITION,
            &[CONDITION_TAG, EVENT_CONDITION_TAG],
            vec![parameter("eventTypeId", "string", false)],
        ),
        condition(
            EVENT_PROPERTY_CONDITION,
            &[CONDITION_TAG, EVENT_CONDITION_TAG],
            property_parameters(),
        ),
        condition(
            PROFILE_PROPERTY_CONDITION,
            &[CONDITION_TAG, PROFILE_CONDITION_TAG],
            property_parameters(),
        ),
        condition(
            SESSION_PROPERTY_CONDITION,
            &[CONDITION_TAG, SESSION_CONDITION_TAG],
            property_parameters(),
        ),
        condition(
            SOURCE_EVENT_PROPERTY_CONDITION,
            &[CONDITION_TAG, SOURCE_EVENT_CONDITION_TAG],
            property_parameters(),
        ),
        condition(
            PAST_EVENT_CONDITION,
            &[CONDITION_TAG, PROFILE_CONDITION_TAG],
            vec![
                parameter("eventCondition", "Condition", false),
                parameter("numberOfDays", "integer", false),
                parameter("fromDate", "date", false),
                parameter("toDate", "date", false),
                parameter("minimumEventCount", "integer", false),
                parameter("maximumEventCount", "integer", false),
                parameter("generatedPropertyKey", "string", false),
            ],
        ),
        form_event_condition(),
    ];

    let mut set_property = ActionType::new("setPropertyAction", SET_PROPERTY_EXECUTOR);
    set_property.parameters = vec![
        parameter("setPropertyName", "string", false),
        parameter("setPropertyValue", "string", false),
        parameter("storeInSession", "boolean", false),
    ];
    let mut occurrence = ActionType::new("setEventOccurenceCountAction", SET_EVENT_OCCURRENCE_COUNT_EXECUTOR);
    occurrence.parameters = vec![parameter("pastEventCondition", "Condition", false)];
    definitions.actions = vec![set_property, occurrence];

    definitions.values = ["string", "integer", "long", "float", "boolean", "date", "Condition"]
        .into_iter()
        .map(|id| ValueType {
            id: id.to_string(),
            tags: BTreeSet::new(),
            system_tags: BTreeSet::new(),
            plugin_id: None,
        })
        .collect();

    definitions.mergers = vec![
        PropertyMergeStrategyType {
            id: "defaultMergeStrategy".to_string(),
            filter: Some("default".to_string()),
            plugin_id: None,
        },
        PropertyMergeStrategyType {
            id: "mostRecentMergeStrategy".to_string(),
            filter: Some("mostRecent".to_string()),
            plugin_id: None,
        },
    ];
    definitions
}
