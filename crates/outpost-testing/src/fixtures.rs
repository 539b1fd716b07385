//! Builders for subscribers, events and filters with sensible defaults.

use chrono::{DateTime, Utc};
use outpost_core::{Actor, Event, FilterGroup, FilterRule, Resource, Subscriber};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Builder for test subscribers.
pub struct SubscriberBuilder {
    subscriber: Subscriber,
}

impl SubscriberBuilder {
    /// Active subscriber for `url`, interested in everything, unsigned.
    pub fn new(url: impl Into<String>) -> Self {
        Self { subscriber: Subscriber::new(url) }
    }

    /// Sets the signing secret.
    #[must_use]
    pub fn secret(mut self, secret: impl Into<String>) -> Self {
        self.subscriber.secret = Some(secret.into());
        self
    }

    /// Adds a declared event type.
    #[must_use]
    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.subscriber.event_types.push(event_type.into());
        self
    }

    /// Sets the request content type.
    #[must_use]
    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.subscriber.content_type = Some(content_type.into());
        self
    }

    /// Marks the subscriber inactive.
    #[must_use]
    pub fn inactive(mut self) -> Self {
        self.subscriber.active = false;
        self
    }

    /// Builds the subscriber.
    pub fn build(self) -> Subscriber {
        self.subscriber
    }
}

/// Builder for test events.
pub struct EventBuilder {
    event_type: String,
    payload: Map<String, Value>,
    actor: Option<Actor>,
    resource: Option<Resource>,
    timestamp: Option<DateTime<Utc>>,
}

impl EventBuilder {
    /// Event of `event_type` with an empty payload.
    pub fn new(event_type: impl Into<String>) -> Self {
        Self { event_type: event_type.into(), payload: Map::new(), actor: None, resource: None, timestamp: None }
    }

    /// `document.updated` with a user actor and a document resource.
    pub fn with_defaults() -> Self {
        Self::new("document.updated")
            .field("visibility", "public")
            .field("revision", 3)
            .actor("user", "Ada")
            .resource("document", "Design notes")
    }

    /// Sets a payload field.
    #[must_use]
    pub fn field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    /// Sets the actor.
    #[must_use]
    pub fn actor(mut self, kind: impl Into<String>, name: impl Into<String>) -> Self {
        self.actor = Some(Actor { id: Uuid::new_v4().to_string(), kind: kind.into(), name: Some(name.into()) });
        self
    }

    /// Sets the primary resource.
    #[must_use]
    pub fn resource(mut self, kind: impl Into<String>, name: impl Into<String>) -> Self {
        self.resource = Some(Resource {
            id: Uuid::new_v4().to_string(),
            kind: kind.into(),
            name: Some(name.into()),
            attributes: Map::new(),
        });
        self
    }

    /// Pins the timestamp.
    #[must_use]
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Builds the event.
    pub fn build(self) -> Event {
        let mut event = Event::new(self.event_type).with_payload(self.payload);
        if let Some(actor) = self.actor {
            event = event.with_actor(actor);
        }
        if let Some(resource) = self.resource {
            event = event.with_resource(resource);
        }
        if let Some(timestamp) = self.timestamp {
            event = event.with_timestamp(timestamp);
        }
        event
    }
}

impl Default for EventBuilder {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Single-rule group `field operator value`.
pub fn rule_group(field: &str, operator: &str, value: impl Into<Value>) -> FilterGroup {
    FilterGroup::all(vec![FilterRule::new(field, operator, value)])
}
