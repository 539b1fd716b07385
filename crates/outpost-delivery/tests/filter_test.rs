//! Filter engine behaviour against real event documents.

#![allow(clippy::unwrap_used)]

use outpost_core::{FilterGroup, FilterRule, SubscriberFilter, SubscriberId};
use outpost_delivery::filter::{evaluate, subscriber_accepts, validate};
use outpost_testing::EventBuilder;
use serde_json::json;

fn matches(field: &str, operator: &str, value: serde_json::Value) -> bool {
    let event = EventBuilder::new("document.updated")
        .field("title", "hello world")
        .field("size", 1024)
        .field("tags", json!(["a", "b"]))
        .field("meta", json!({"region": "eu-west", "tier": 2}))
        .actor("user", "Ada")
        .build();
    evaluate(&FilterGroup::all(vec![FilterRule::new(field, operator, value)]), &event)
}

#[test]
fn operator_truth_table() {
    assert!(matches("title", "contains", json!("lo wo")));
    assert!(matches("title", "eq", json!("hello world")));
    assert!(matches("title", "ne", json!("goodbye")));
    assert!(matches("title", "starts_with", json!("hello")));
    assert!(matches("title", "ends_with", json!("world")));
    assert!(!matches("title", "not_contains", json!("world")));
    assert!(matches("title", "regex", json!("^h.*d$")));
    assert!(!matches("title", "regex", json!("([")));
    assert!(matches("size", "gt", json!(1000)));
    assert!(matches("size", "lte", json!("1024")));
    assert!(!matches("size", "lt", json!(10)));
    assert!(matches("meta.region", "in", json!(["eu-west", "us-east"])));
    assert!(matches("meta.region", "not_in", json!(["ap-south"])));
    assert!(matches("meta.tier", "eq", json!(2)));
    assert!(matches("actor.name", "eq", json!("Ada")));
    assert!(matches("event_type", "eq", json!("document.updated")));
    assert!(matches("title", "exists", json!(null)));
    assert!(matches("missing", "not_exists", json!(null)));
    assert!(!matches("title.nested", "exists", json!(null)));
}

#[test]
fn union_across_filters() {
    let subscriber = SubscriberId::new();
    let event = EventBuilder::new("x").field("visibility", "public").build();
    let doc = event.to_document();
    let failing = SubscriberFilter::new(
        subscriber,
        "private",
        FilterGroup::all(vec![FilterRule::new("visibility", "eq", "private")]),
    );
    let passing = SubscriberFilter::new(
        subscriber,
        "public",
        FilterGroup::all(vec![FilterRule::new("visibility", "eq", "public")]),
    );

    assert!(subscriber_accepts(&[failing.clone(), passing], &doc));
    assert!(!subscriber_accepts(&[failing.clone()], &doc));

    let mut inactive = failing;
    inactive.active = false;
    assert!(subscriber_accepts(&[inactive], &doc));
    assert!(subscriber_accepts(&[], &doc));
}

#[test]
fn filter_groups_round_trip_through_json() {
    let raw = json!({
        "logic": "or",
        "rules": [{"field": "size", "operator": "gte", "value": 2048}],
        "groups": [{
            "rules": [
                {"field": "meta.region", "operator": "starts_with", "value": "eu"},
                {"field": "tags", "operator": "exists", "negate": true}
            ]
        }]
    });
    let group: FilterGroup = serde_json::from_value(raw).unwrap();
    validate(&group).unwrap();

    let event = EventBuilder::new("x").field("size", 10).field("meta", json!({"region": "eu-central"})).build();
    assert!(evaluate(&group, &event));

    let tagged = EventBuilder::new("x").field("size", 10).field("tags", json!([])).build();
    assert!(!evaluate(&group, &tagged));
}
