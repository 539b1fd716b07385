//! Core domain model and storage interfaces for outbound event delivery.
//!
//! Provides strongly-typed identifiers, the event and subscriber model, the
//! delivery bookkeeping records, a clock abstraction, and the narrow storage
//! traits the delivery engine depends on. Every other outpost crate builds on
//! these types.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod models;
pub mod storage;
pub mod time;

pub use error::{CoreError, Result};
pub use models::{
    Actor, DeliveryAttempt, DeliveryId, DeliveryRecord, Event, EventId, FilterGroup, FilterId,
    FilterRule, Resource, RetryTask, Subscriber, SubscriberFilter, SubscriberId,
};
pub use storage::{DeliveryStore, FilterStore, MemoryStore, PostgresStore, SubscriberDirectory};
pub use time::{Clock, RealClock, TestClock};
