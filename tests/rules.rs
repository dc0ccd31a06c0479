mod common;

use common::{load_counter, server, server_with, COUNT_ACTION};
use cxs_rs::{Action, Condition, EngineConfig, Event, EventChanges, Metadata, Profile, Rule};
use pretty_assertions::assert_eq;

fn counting_rule(id: &str, event_type: &str) -> Rule {
    Rule::new(
        Metadata::new("site", id, id),
        Condition::event_type(event_type),
        vec![Action::new(COUNT_ACTION)],
    )
}

fn login(profile: &str) -> Event {
    Event::new("login", "site", Some(Profile::new(profile)), None)
}

#[test_log::test(tokio::test)]
async fn raise_once_for_profile_fires_a_single_time() {
    let (_, server) = server().await;
    let counter = load_counter(&server, EventChanges::NO_CHANGE).await;
    let mut rule = counting_rule("firstLogin", "login");
    rule.raise_only_once_for_profile = true;
    server.rules().install(rule).await.unwrap();

    server.send(&mut login("p1")).await;
    server.send(&mut login("p1")).await;
    assert_eq!(counter.calls(), 1);

    server.send(&mut login("p2")).await;
    assert_eq!(counter.calls(), 2);
}

#[tokio::test]
async fn rules_without_raise_once_fire_every_time() {
    let (_, server) = server().await;
    let counter = load_counter(&server, EventChanges::NO_CHANGE).await;
    server.rules().install(counting_rule("everyLogin", "login")).await.unwrap();

    server.send(&mut login("p1")).await;
    server.send(&mut login("p1")).await;
    assert_eq!(counter.calls(), 2);
}

#[test_log::test(tokio::test)]
async fn self_triggering_cascade_is_bounded() {
    let config = EngineConfig {
        max_recursion_depth: 3,
        ..EngineConfig::default()
    };
    let (_, server) = server_with(config).await;
    let counter = load_counter(&server, EventChanges::PROFILE_UPDATED).await;
    server.rules().install(counting_rule("onLogin", "login")).await.unwrap();
    server
        .rules()
        .install(counting_rule("onProfileUpdated", "profileUpdated"))
        .await
        .unwrap();

    let changes = server.send(&mut login("p1")).await;

    assert!(changes.contains(EventChanges::PROFILE_UPDATED));
    assert_eq!(counter.calls(), 4);
}

#[tokio::test]
async fn failed_event_save_reaches_no_rule() {
    let (store, server) = server().await;
    let counter = load_counter(&server, EventChanges::PROFILE_UPDATED).await;
    server.rules().install(counting_rule("everyLogin", "login")).await.unwrap();

    store.set_fail_saves(true);
    let changes = server.send(&mut login("p1")).await;

    assert_eq!(changes, EventChanges::NO_CHANGE);
    assert_eq!(counter.calls(), 0);
}

#[tokio::test]
async fn other_scopes_do_not_match() {
    let (_, server) = server().await;
    let counter = load_counter(&server, EventChanges::NO_CHANGE).await;
    server.rules().install(counting_rule("everyLogin", "login")).await.unwrap();

    let mut elsewhere = Event::new("login", "shop", Some(Profile::new("p1")), None);
    server.send(&mut elsewhere).await;
    assert_eq!(counter.calls(), 0);
}
