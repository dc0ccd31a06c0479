use cxs_rs::{
    Action, Condition, ContextServer, EngineConfig, Event, InMemoryPersistence, Metadata,
    Persistence, Profile, Rule, Segment, PAST_EVENT_CONDITION,
};
use std::sync::Arc;
use tracing::{info, Level};

// 登录规则: 记录最近登录时间, 每个 profile 只触发一次
const WELCOME_RULE: &str = r#"{
    "metadata": { "id": "welcome", "name": "首次登录", "scope": "shop" },
    "condition": {
        "conditionTypeId": "eventTypeCondition",
        "parameterValues": { "eventTypeId": "login" }
    },
    "actions": [
        {
            "actionTypeId": "setPropertyAction",
            "parameterValues": { "setPropertyName": "properties.firstLogin", "setPropertyValue": "now" }
        }
    ],
    "raiseEventOnlyOnceForProfile": true
}"#;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    tracing_subscriber::fmt().with_max_level(Level::DEBUG).init();

    let store = Arc::new(InMemoryPersistence::new());
    let server = ContextServer::start(store.clone(), EngineConfig::default()).await?;

    let welcome: Rule = serde_json::from_str(WELCOME_RULE)?;
    server.rules().install(welcome).await?;

    // 最近 30 天至少购买两次
    let repeat_buyers = Segment {
        metadata: Metadata::new("shop", "repeatBuyers", "Repeat buyers"),
        condition: Some(Condition::and(vec![Condition::new(PAST_EVENT_CONDITION)
            .with_parameter("eventCondition", Condition::event_type("purchase"))
            .with_parameter("numberOfDays", 30)
            .with_parameter("minimumEventCount", 2)])),
    };
    let repeat_buyers = server.segments().set_segment(repeat_buyers).await?;
    info!(segment = ?repeat_buyers.condition, "Segment saved");

    // 手动规则: 购买时累计标记
    server
        .rules()
        .install(Rule::new(
            Metadata::new("shop", "tagBuyer", "Tag buyer"),
            Condition::event_type("purchase"),
            vec![Action::new("setPropertyAction")
                .with_parameter("setPropertyName", "properties.buyer")
                .with_parameter("setPropertyValue", "yes")],
        ))
        .await?;

    let mut profile = Profile::new("alice");
    for event_type in ["login", "login", "purchase", "purchase"] {
        let mut event = Event::new(event_type, "shop", Some(profile.clone()), None);
        let changes = server.send(&mut event).await;
        info!(event_type, changes = %changes, "Event processed");
        if let Some(updated) = event.profile {
            profile = updated;
        }
    }

    let stored = store.load_profile("alice").await?;
    info!(profile = ?stored, "Final profile");

    let (segments, scores) = server.segments().segments_and_scores(&profile).await?;
    info!(segments = ?segments, scores = ?scores, "Profile classification");
    Ok(())
}
