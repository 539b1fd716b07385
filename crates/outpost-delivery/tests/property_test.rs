//! Property-based tests for the pure parts of the delivery pipeline:
//! backoff arithmetic, payload signing, filter negation and token buckets.

#![allow(clippy::unwrap_used)]

use std::{sync::Arc, time::Duration};

use outpost_core::{FilterRule, SubscriberId, TestClock};
use outpost_delivery::{
    filter::{evaluate_rule, Operator},
    rate_limit::RateLimiterRegistry,
    retry::RetryPolicy,
    signing::{sign_payload, verify_signature},
};
use proptest::prelude::*;
use serde_json::{json, Map, Value};

fn policy_strategy() -> impl Strategy<Value = RetryPolicy> {
    (1u64..5_000, 1.0f64..4.0, 1u64..600).prop_map(|(initial_ms, factor, max_secs)| RetryPolicy {
        max_attempts: 10,
        initial_delay: Duration::from_millis(initial_ms),
        backoff_factor: factor,
        max_delay: Duration::from_secs(max_secs),
        jitter_factor: 0.1,
    })
}

fn value_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        (-1_000i64..1_000).prop_map(|n| json!(n)),
        "[a-z ]{0,12}".prop_map(Value::String),
        "[a-z(\\[*]{0,6}".prop_map(Value::String),
        prop::collection::vec("[a-z]{0,3}".prop_map(Value::String), 0..4).prop_map(Value::Array),
    ]
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap()
}

proptest! {
    #[test]
    fn backoff_is_monotonic_and_capped(policy in policy_strategy()) {
        let mut previous = Duration::ZERO;
        for attempt in 1..=12 {
            let delay = policy.base_delay(attempt);
            prop_assert!(delay >= previous, "attempt {attempt}: {delay:?} < {previous:?}");
            prop_assert!(delay <= policy.max_delay);
            previous = delay;
        }
    }

    #[test]
    fn jitter_stays_within_ten_percent(policy in policy_strategy(), attempt in 1u32..12) {
        let base = policy.base_delay(attempt).as_secs_f64();
        let jittered = policy.delay_for(attempt).as_secs_f64();
        let tolerance = 1e-6;

        prop_assert!(jittered >= base * 0.9 - tolerance, "{jittered} below {base}");
        prop_assert!(jittered <= base * 1.1 + tolerance, "{jittered} above {base}");
        prop_assert!(jittered <= policy.max_delay.as_secs_f64() + tolerance);
    }

    #[test]
    fn signatures_are_deterministic(
        payload in prop::collection::vec(any::<u8>(), 1..512),
        secret in "[A-Za-z0-9_]{1,40}",
        index in any::<prop::sample::Index>(),
    ) {
        let first = sign_payload(&payload, &secret).unwrap();
        let second = sign_payload(&payload, &secret).unwrap();
        prop_assert_eq!(&first, &second);
        prop_assert!(verify_signature(&payload, &first, &secret));

        let mut tampered = payload.clone();
        let i = index.index(tampered.len());
        tampered[i] ^= 0x01;
        prop_assert_ne!(sign_payload(&tampered, &secret).unwrap(), first);
    }

    #[test]
    fn negation_inverts_every_operator(
        operator in prop::sample::select(Operator::ALL.to_vec()),
        present in any::<bool>(),
        field in value_strategy(),
        expected in value_strategy(),
    ) {
        let mut doc = Map::new();
        if present {
            doc.insert("field".to_string(), field);
        }
        let rule = FilterRule::new("field", operator.as_str(), expected);

        prop_assert_eq!(evaluate_rule(&rule.clone().negated(), &doc), !evaluate_rule(&rule, &doc));
    }

    #[test]
    fn bucket_admits_exactly_burst_without_refill(rpm in 1i64..20_000, extra in 0usize..20) {
        let clock = Arc::new(TestClock::new());
        let limiter = RateLimiterRegistry::new(clock);
        let subscriber = SubscriberId::new();
        let burst = usize::try_from((rpm / 10).max(1)).unwrap();

        let admitted = runtime().block_on(async {
            limiter.set_limit(subscriber, rpm).await;
            let mut admitted = 0;
            for _ in 0..burst + extra {
                if limiter.allow(subscriber).await {
                    admitted += 1;
                }
            }
            admitted
        });

        prop_assert_eq!(admitted, burst);
    }

    #[test]
    fn bucket_never_exceeds_capacity(rpm in 1i64..10_000, idle_secs in 0u64..3_600) {
        let clock = Arc::new(TestClock::new());
        let limiter = RateLimiterRegistry::new(clock.clone());
        let subscriber = SubscriberId::new();

        let remaining = runtime().block_on(async {
            limiter.set_limit(subscriber, rpm).await;
            limiter.allow(subscriber).await;
            clock.advance(Duration::from_secs(idle_secs));
            limiter.remaining(subscriber).await
        });

        prop_assert!(remaining >= 0);
        prop_assert!(remaining <= (rpm / 10).max(1));
    }
}
