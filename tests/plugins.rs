mod common;

use common::server_with;
use cxs_rs::condition::ConditionResolver;
use cxs_rs::{
    Action, Condition, ConditionType, EngineConfig, Item, Metadata, Persistence, PluginDefinitions,
    Profile, Rule, Segment, PROFILE_CONDITION_TAG, PROFILE_PROPERTY_CONDITION,
};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::collections::BTreeSet;
use std::fs;
use tempfile::TempDir;

const PAGE_VISIT: &str = "pageVisitCondition";

fn web_plugin() -> PluginDefinitions {
    let mut definitions = PluginDefinitions::new("web");
    definitions.conditions.push(
        ConditionType::new(PAGE_VISIT)
            .with_system_tags(&["condition", PROFILE_CONDITION_TAG])
            .with_parent(Condition::property(
                PROFILE_PROPERTY_CONDITION,
                "properties.visited",
                "equals",
                json!("parameter::page"),
            )),
    );
    definitions
}

fn visitors() -> Segment {
    Segment {
        metadata: Metadata::new("site", "pricingVisitors", "Pricing visitors"),
        condition: Some(Condition::new(PAGE_VISIT).with_parameter("page", "pricing")),
    }
}

fn page_visit_types(server: &cxs_rs::ContextServer) -> Vec<String> {
    let registry = server.registry();
    registry
        .condition_types_by_tag(PROFILE_CONDITION_TAG, registry.system_tenant(), false)
        .iter()
        .map(|t| t.id.clone())
        .filter(|id| id == PAGE_VISIT)
        .collect()
}

#[test_log::test(tokio::test)]
async fn unload_and_reload_flip_missing_plugins() {
    let (store, server) = server_with(EngineConfig::default()).await;
    store
        .save(&Item::Profile(Profile::new("p1").with_property("visited", json!("pricing"))))
        .await
        .unwrap();
    server.on_plugin_load(web_plugin(), Vec::new()).await.unwrap();

    let segment = server.segments().set_segment(visitors()).await.unwrap();
    assert!(!segment.metadata.missing_plugins);
    assert!(store.load_profile("p1").await.unwrap().unwrap().segments.contains("pricingVisitors"));

    let rule = Rule::new(
        Metadata::new("site", "pricingLogin", "Pricing login"),
        Condition::and(vec![
            Condition::event_type("login"),
            Condition::new(PAGE_VISIT).with_parameter("page", "pricing"),
        ]),
        vec![Action::new("setPropertyAction")
            .with_parameter("setPropertyName", "properties.seenPricing")
            .with_parameter("setPropertyValue", "yes")],
    );
    server.rules().install(rule).await.unwrap();
    assert!(server.rules().is_active("pricingLogin").await);
    assert_eq!(page_visit_types(&server), vec![PAGE_VISIT.to_string()]);

    server.on_plugin_unload("web").await.unwrap();

    let segment = server.segments().get_segment("pricingVisitors").await.unwrap().unwrap();
    assert!(segment.metadata.missing_plugins);
    assert!(page_visit_types(&server).is_empty());
    assert!(!server.rules().is_active("pricingLogin").await);
    let stored = store.load_rule("pricingLogin").await.unwrap().unwrap();
    assert!(stored.metadata.missing_plugins);
    assert!(stored.metadata.enabled);

    server.on_plugin_load(web_plugin(), Vec::new()).await.unwrap();

    let segment = server.segments().get_segment("pricingVisitors").await.unwrap().unwrap();
    assert!(!segment.metadata.missing_plugins);
    assert_eq!(page_visit_types(&server), vec![PAGE_VISIT.to_string()]);
    assert!(server.rules().is_active("pricingLogin").await);
}

#[tokio::test]
async fn resolve_is_idempotent() {
    let (_, server) = server_with(EngineConfig::default()).await;
    server.on_plugin_load(web_plugin(), Vec::new()).await.unwrap();
    let resolver = ConditionResolver::new(server.registry().clone(), server.registry().system_tenant());

    let mut condition = Condition::and(vec![
        Condition::event_type("view"),
        Condition::new(PAGE_VISIT).with_parameter("page", "pricing"),
    ]);
    assert!(resolver.resolve(&mut condition));
    let once = condition.clone();
    assert!(resolver.resolve(&mut condition));
    assert_eq!(condition, once);
    assert!(condition.children().iter().all(|c| c.is_resolved()));

    let mut unknown = Condition::and(vec![Condition::new("weatherCondition")]);
    assert!(!resolver.resolve(&mut unknown));
    assert!(!resolver.resolve(&mut unknown));
}

#[tokio::test]
async fn recursive_tag_lookup_covers_descendants() {
    let (_, server) = server_with(EngineConfig::default()).await;
    let registry = server.registry();
    let tenant = registry.system_tenant();

    let ids = |tag: &str, recursive: bool| -> BTreeSet<String> {
        registry
            .condition_types_by_tag(tag, tenant, recursive)
            .iter()
            .map(|t| t.id.clone())
            .collect()
    };

    let flat = ids("condition", false);
    let recursive = ids("condition", true);
    assert!(recursive.is_superset(&flat));

    let root = registry.tag("condition", tenant).unwrap();
    let mut union = flat.clone();
    for sub in &root.sub_tags {
        union.extend(ids(sub, true));
    }
    assert_eq!(recursive, union);
}

#[test_log::test(tokio::test)]
async fn definitions_dir_plugins_are_loaded_at_start() {
    let dir = TempDir::new().unwrap();
    let plugin = dir.path().join("web");
    fs::create_dir_all(plugin.join("conditions")).unwrap();
    fs::create_dir_all(plugin.join("rules")).unwrap();
    fs::write(
        plugin.join("conditions/pageVisit.json"),
        r#"{"id": "pageVisitCondition", "systemTags": ["condition", "profileCondition"]}"#,
    )
    .unwrap();
    fs::write(plugin.join("conditions/broken.json"), "{ not json").unwrap();
    fs::write(
        plugin.join("rules/welcome.json"),
        r#"{
            "metadata": {"id": "welcome"},
            "condition": {"conditionTypeId": "eventTypeCondition", "parameterValues": {"eventTypeId": "login"}},
            "actions": [{"actionTypeId": "setPropertyAction", "parameterValues": {"setPropertyName": "properties.welcomed", "setPropertyValue": "yes"}}]
        }"#,
    )
    .unwrap();

    let config = EngineConfig {
        definitions_dir: Some(dir.path().to_path_buf()),
        ..EngineConfig::default()
    };
    let (store, server) = server_with(config).await;

    assert!(server
        .registry()
        .condition_type(PAGE_VISIT, server.registry().system_tenant())
        .is_some());
    let rule = store.load_rule("welcome").await.unwrap().unwrap();
    assert_eq!(rule.metadata.scope.as_deref(), Some("systemscope"));
    assert!(server.rules().is_active("welcome").await);
}
