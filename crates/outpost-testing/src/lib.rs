//! Test infrastructure for the outpost delivery engine.
//!
//! Provides a wiremock-backed subscriber endpoint, fixture builders, and a
//! harness that runs a real engine over an in-memory store.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod fixtures;
pub mod harness;
pub mod http;

pub use fixtures::{rule_group, EventBuilder, SubscriberBuilder};
pub use harness::{EngineHarness, HarnessBuilder, DEFAULT_WAIT};
pub use http::{MockServer, RecordedRequest};
