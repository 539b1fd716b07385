//! Domain model for outbound event delivery.
//!
//! Identifiers are UUID newtypes so a delivery id can never be passed where
//! a subscriber id is expected. Events are immutable once built; delivery
//! records and attempt rows are the bookkeeping the engine persists.

use std::{fmt, str::FromStr};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{CoreError, Result};

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Creates a new random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Returns the wrapped UUID.
            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl FromStr for $name {
            type Err = CoreError;

            fn from_str(s: &str) -> Result<Self> {
                Uuid::parse_str(s)
                    .map(Self)
                    .map_err(|e| CoreError::InvalidInput(format!("invalid {}: {e}", stringify!($name))))
            }
        }
    };
}

uuid_id!(
    /// Identifies a registered delivery destination.
    SubscriberId
);
uuid_id!(
    /// Identifies a domain event.
    EventId
);
uuid_id!(
    /// Identifies one logical delivery of one event to one subscriber.
    ///
    /// Shared by every attempt made for that delivery.
    DeliveryId
);
uuid_id!(
    /// Identifies a stored subscriber filter.
    FilterId
);

/// Content type used when a subscriber does not configure one.
pub const DEFAULT_CONTENT_TYPE: &str = "application/json";

/// Interest-set entry matching every event type.
pub const WILDCARD_EVENT_TYPE: &str = "*";

/// A registered destination for event notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscriber {
    /// Subscriber identifier.
    pub id: SubscriberId,
    /// Target URL receiving POST requests.
    pub url: String,
    /// Shared HMAC secret. Deliveries are unsigned when absent.
    pub secret: Option<String>,
    /// Declared event types. Empty or containing `"*"` means all types.
    #[serde(default)]
    pub event_types: Vec<String>,
    /// Inactive subscribers receive nothing.
    pub active: bool,
    /// Request content type, defaulting to `application/json`.
    pub content_type: Option<String>,
}

impl Subscriber {
    /// Creates an active subscriber interested in every event type.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            id: SubscriberId::new(),
            url: url.into(),
            secret: None,
            event_types: Vec::new(),
            active: true,
            content_type: None,
        }
    }

    /// Whether the interest set admits `event_type`.
    pub fn is_interested_in(&self, event_type: &str) -> bool {
        self.event_types.is_empty()
            || self
                .event_types
                .iter()
                .any(|declared| declared == WILDCARD_EVENT_TYPE || declared == event_type)
    }

    /// Effective request content type.
    pub fn content_type(&self) -> &str {
        self.content_type
            .as_deref()
            .filter(|ct| !ct.is_empty())
            .unwrap_or(DEFAULT_CONTENT_TYPE)
    }
}

/// The principal that caused an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Actor {
    /// Actor identifier.
    pub id: String,
    /// Actor kind, such as `user` or `service`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// The primary resource an event concerns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    /// Resource identifier.
    pub id: String,
    /// Resource kind, such as `document`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Free-form resource attributes.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub attributes: Map<String, Value>,
}

/// An immutable notification of a domain change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event identifier.
    pub id: EventId,
    /// Type tag, for example `document.created`.
    pub event_type: String,
    /// Moment the change happened.
    pub timestamp: DateTime<Utc>,
    /// Caller-controlled payload.
    pub payload: Map<String, Value>,
    /// Who caused the change.
    pub actor: Option<Actor>,
    /// What changed.
    pub resource: Option<Resource>,
}

/// Wire shape of a delivered event.
#[derive(Serialize)]
struct Envelope<'a> {
    id: EventId,
    #[serde(rename = "type")]
    event_type: &'a str,
    timestamp: DateTime<Utc>,
    data: &'a Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    actor: Option<&'a Actor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    resource: Option<&'a Resource>,
}

impl Event {
    /// Creates an event of `event_type` stamped with the current time.
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            id: EventId::new(),
            event_type: event_type.into(),
            timestamp: Utc::now(),
            payload: Map::new(),
            actor: None,
            resource: None,
        }
    }

    /// Adds a payload field.
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    /// Replaces the payload.
    #[must_use]
    pub fn with_payload(mut self, payload: Map<String, Value>) -> Self {
        self.payload = payload;
        self
    }

    /// Sets the actor.
    #[must_use]
    pub fn with_actor(mut self, actor: Actor) -> Self {
        self.actor = Some(actor);
        self
    }

    /// Sets the primary resource.
    #[must_use]
    pub fn with_resource(mut self, resource: Resource) -> Self {
        self.resource = Some(resource);
        self
    }

    /// Sets the timestamp.
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Navigable document that filter rules are evaluated against.
    ///
    /// Payload keys sit at the top level. The reserved keys `event_type`,
    /// `event_id`, `timestamp`, `payload`, `actor` and `resource` are written
    /// last and shadow payload keys of the same name.
    pub fn to_document(&self) -> Map<String, Value> {
        let mut doc = self.payload.clone();
        doc.insert("event_type".into(), Value::String(self.event_type.clone()));
        doc.insert("event_id".into(), Value::String(self.id.to_string()));
        doc.insert("timestamp".into(), Value::String(self.timestamp.to_rfc3339()));
        doc.insert("payload".into(), Value::Object(self.payload.clone()));
        if let Some(actor) = &self.actor {
            doc.insert("actor".into(), serde_json::to_value(actor).unwrap_or(Value::Null));
        }
        if let Some(resource) = &self.resource {
            doc.insert("resource".into(), serde_json::to_value(resource).unwrap_or(Value::Null));
        }
        doc
    }

    /// Serializes the delivery envelope sent as the request body.
    pub fn envelope_bytes(&self) -> Result<Bytes> {
        let envelope = Envelope {
            id: self.id,
            event_type: &self.event_type,
            timestamp: self.timestamp,
            data: &self.payload,
            actor: self.actor.as_ref(),
            resource: self.resource.as_ref(),
        };
        Ok(Bytes::from(serde_json::to_vec(&envelope)?))
    }
}

/// A single predicate inside a filter group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterRule {
    /// Dot-separated path into the event document.
    pub field: String,
    /// Operator name such as `eq` or `regex`.
    pub operator: String,
    /// Comparison value. Ignored by `exists` and `not_exists`.
    #[serde(default)]
    pub value: Value,
    /// Inverts the rule result.
    #[serde(default)]
    pub negate: bool,
}

impl FilterRule {
    /// Creates a non-negated rule.
    pub fn new(field: impl Into<String>, operator: impl Into<String>, value: impl Into<Value>) -> Self {
        Self { field: field.into(), operator: operator.into(), value: value.into(), negate: false }
    }

    /// Returns the rule with its result inverted.
    #[must_use]
    pub fn negated(mut self) -> Self {
        self.negate = !self.negate;
        self
    }
}

/// Boolean combination of rules and nested groups.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterGroup {
    /// `and`, `or`, or empty for AND.
    #[serde(default)]
    pub logic: String,
    /// Direct rules.
    #[serde(default)]
    pub rules: Vec<FilterRule>,
    /// Nested groups.
    #[serde(default)]
    pub groups: Vec<FilterGroup>,
    /// A disabled group never matches.
    #[serde(default)]
    pub disabled: bool,
}

impl FilterGroup {
    /// Group combining `rules` with AND.
    pub fn all(rules: Vec<FilterRule>) -> Self {
        Self { logic: "and".into(), rules, ..Self::default() }
    }

    /// Group combining `rules` with OR.
    pub fn any(rules: Vec<FilterRule>) -> Self {
        Self { logic: "or".into(), rules, ..Self::default() }
    }

    /// Adds a nested group.
    #[must_use]
    pub fn with_group(mut self, group: FilterGroup) -> Self {
        self.groups.push(group);
        self
    }
}

/// A named, prioritized filter bound to one subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriberFilter {
    /// Filter identifier.
    pub id: FilterId,
    /// Owning subscriber.
    pub subscriber_id: SubscriberId,
    /// Operator-facing name.
    pub name: String,
    /// Listing order, lowest first.
    pub priority: i32,
    /// Inactive filters are ignored during dispatch.
    pub active: bool,
    /// Rule tree.
    pub group: FilterGroup,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

impl SubscriberFilter {
    /// Creates an active filter with priority zero.
    pub fn new(subscriber_id: SubscriberId, name: impl Into<String>, group: FilterGroup) -> Self {
        let now = Utc::now();
        Self {
            id: FilterId::new(),
            subscriber_id,
            name: name.into(),
            priority: 0,
            active: true,
            group,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Current state of one logical delivery.
///
/// Updated after every attempt; `next_retry` is set only while another
/// attempt is still due.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    /// Delivery identifier.
    pub id: DeliveryId,
    /// Target subscriber.
    pub subscriber_id: SubscriberId,
    /// Event being delivered.
    pub event_id: EventId,
    /// Event type tag.
    pub event_type: String,
    /// URL of the most recent attempt.
    pub url: String,
    /// Exact request body.
    pub payload: Vec<u8>,
    /// Content type sent with the body.
    pub content_type: String,
    /// Status of the most recent attempt, zero for transport failures.
    pub status_code: u16,
    /// Whether the delivery has succeeded.
    pub success: bool,
    /// Failure detail of the most recent attempt.
    pub error: Option<String>,
    /// Duration of the most recent attempt.
    pub duration_ms: u64,
    /// Attempts made so far.
    pub attempts: u32,
    /// When the next attempt is due, if any.
    pub next_retry: Option<DateTime<Utc>>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
}

impl DeliveryRecord {
    /// Creates a record for a delivery that has not been attempted yet.
    pub fn pending(
        subscriber: &Subscriber,
        event: &Event,
        payload: &[u8],
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: DeliveryId::new(),
            subscriber_id: subscriber.id,
            event_id: event.id,
            event_type: event.event_type.clone(),
            url: subscriber.url.clone(),
            payload: payload.to_vec(),
            content_type: subscriber.content_type().to_string(),
            status_code: 0,
            success: false,
            error: None,
            duration_ms: 0,
            attempts: 0,
            next_retry: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether no further attempts will be made.
    pub fn is_terminal(&self) -> bool {
        self.success || self.next_retry.is_none()
    }
}

/// Immutable log entry for one HTTP attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    /// Delivery the attempt belongs to.
    pub delivery_id: DeliveryId,
    /// Target subscriber.
    pub subscriber_id: SubscriberId,
    /// One-based attempt number.
    pub attempt_number: u32,
    /// Event type tag.
    pub event_type: String,
    /// URL attempted.
    pub url: String,
    /// Response status, zero for transport failures.
    pub status_code: u16,
    /// Whether the attempt succeeded.
    pub success: bool,
    /// Failure detail.
    pub error: Option<String>,
    /// Attempt duration.
    pub duration_ms: u64,
    /// Next retry scheduled as a result of this attempt.
    pub next_retry: Option<DateTime<Utc>>,
    /// When the attempt finished.
    pub attempted_at: DateTime<Utc>,
}

impl DeliveryAttempt {
    /// Builds the log entry for the attempt reflected in `record`.
    pub fn from_record(record: &DeliveryRecord, attempted_at: DateTime<Utc>) -> Self {
        Self {
            delivery_id: record.id,
            subscriber_id: record.subscriber_id,
            attempt_number: record.attempts,
            event_type: record.event_type.clone(),
            url: record.url.clone(),
            status_code: record.status_code,
            success: record.success,
            error: record.error.clone(),
            duration_ms: record.duration_ms,
            next_retry: record.next_retry,
            attempted_at,
        }
    }
}

/// A scheduled re-delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryTask {
    /// Target subscriber.
    pub subscriber_id: SubscriberId,
    /// Delivery being retried.
    pub delivery_id: DeliveryId,
    /// Target URL.
    pub url: String,
    /// Signing secret.
    pub secret: Option<String>,
    /// Attempt number this task will make.
    pub attempt: u32,
    /// Earliest time the attempt may run.
    pub due_at: DateTime<Utc>,
    /// Operator-forced retries ignore the attempt budget once.
    pub forced: bool,
}

impl RetryTask {
    /// Task for the next attempt of `record`.
    pub fn for_record(record: &DeliveryRecord, subscriber: &Subscriber, due_at: DateTime<Utc>) -> Self {
        Self {
            subscriber_id: record.subscriber_id,
            delivery_id: record.id,
            url: subscriber.url.clone(),
            secret: subscriber.secret.clone(),
            attempt: record.attempts + 1,
            due_at,
            forced: false,
        }
    }
}
