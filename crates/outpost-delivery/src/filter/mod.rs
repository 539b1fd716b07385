//! Rule-based event filtering.
//!
//! A [`FilterGroup`] is a boolean tree of [`FilterRule`] predicates evaluated
//! against an event's navigable document (see `Event::to_document`). Field
//! paths are dot-separated; each intermediate segment must name a nested
//! object. Evaluation never fails: unresolvable paths, type mismatches, and
//! bad patterns all make the predicate false.
//!
//! Validation is a separate step run when filters are created or updated.

use std::{cmp::Ordering, fmt, str::FromStr};

use outpost_core::{Event, FilterGroup, FilterRule, SubscriberFilter};
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{DeliveryError, Result};

mod service;

pub use service::{FilterService, FilterUpdate};

/// Comparison operators understood by [`FilterRule::operator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    /// String equality.
    Eq,
    /// String inequality.
    Ne,
    /// Substring test.
    Contains,
    /// Negated substring test.
    NotContains,
    /// Prefix test.
    StartsWith,
    /// Suffix test.
    EndsWith,
    /// Regular expression match.
    Regex,
    /// Greater than.
    Gt,
    /// Greater than or equal.
    Gte,
    /// Less than.
    Lt,
    /// Less than or equal.
    Lte,
    /// Membership in a list.
    In,
    /// Non-membership in a list.
    NotIn,
    /// Field is present and not null.
    Exists,
    /// Field is absent or null.
    NotExists,
}

impl Operator {
    /// Every recognised operator.
    pub const ALL: [Operator; 15] = [
        Self::Eq,
        Self::Ne,
        Self::Contains,
        Self::NotContains,
        Self::StartsWith,
        Self::EndsWith,
        Self::Regex,
        Self::Gt,
        Self::Gte,
        Self::Lt,
        Self::Lte,
        Self::In,
        Self::NotIn,
        Self::Exists,
        Self::NotExists,
    ];

    /// Wire name of the operator.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Eq => "eq",
            Self::Ne => "ne",
            Self::Contains => "contains",
            Self::NotContains => "not_contains",
            Self::StartsWith => "starts_with",
            Self::EndsWith => "ends_with",
            Self::Regex => "regex",
            Self::Gt => "gt",
            Self::Gte => "gte",
            Self::Lt => "lt",
            Self::Lte => "lte",
            Self::In => "in",
            Self::NotIn => "not_in",
            Self::Exists => "exists",
            Self::NotExists => "not_exists",
        }
    }

    /// Result when the field is absent or null.
    fn on_absent(self) -> bool {
        matches!(self, Self::Ne | Self::NotContains | Self::NotIn | Self::NotExists)
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operator {
    type Err = DeliveryError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|op| op.as_str() == s)
            .ok_or_else(|| DeliveryError::invalid_filter("operator", format!("unknown operator '{s}'")))
    }
}

/// How a group combines its children.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Logic {
    /// Every child must pass.
    And,
    /// At least one child must pass.
    Or,
}

impl Logic {
    /// Parses a group's logic field. Empty means AND.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "" | "and" => Some(Self::And),
            "or" => Some(Self::Or),
            _ => None,
        }
    }
}

/// Outcome of resolving a field path.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Lookup<'a> {
    /// An intermediate segment was missing or not an object.
    Unresolvable,
    /// The last segment is missing or null.
    Absent,
    /// The last segment holds a value.
    Present(&'a Value),
}

fn resolve<'a>(doc: &'a Map<String, Value>, path: &str) -> Lookup<'a> {
    let mut current = doc;
    let mut segments = path.split('.').peekable();

    while let Some(segment) = segments.next() {
        let value = current.get(segment);
        if segments.peek().is_none() {
            return match value {
                None | Some(Value::Null) => Lookup::Absent,
                Some(v) => Lookup::Present(v),
            };
        }
        match value {
            Some(Value::Object(next)) => current = next,
            _ => return Lookup::Unresolvable,
        }
    }

    Lookup::Unresolvable
}

/// String form used by every non-numeric comparison.
fn coerce(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(_) | Value::Object(_) => value.to_string(),
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn compare(field: &Value, expected: &Value) -> Option<Ordering> {
    match (as_number(field), as_number(expected)) {
        (Some(a), Some(b)) => a.partial_cmp(&b),
        _ => Some(coerce(field).cmp(&coerce(expected))),
    }
}

fn member_of(field: &Value, list: &Value) -> Option<bool> {
    let items = list.as_array()?;
    let needle = coerce(field);
    Some(items.iter().any(|item| coerce(item) == needle))
}

fn apply(op: Operator, field: &Value, expected: &Value) -> bool {
    let ordering = || compare(field, expected);
    match op {
        Operator::Eq => coerce(field) == coerce(expected),
        Operator::Ne => coerce(field) != coerce(expected),
        Operator::Contains => coerce(field).contains(&coerce(expected)),
        Operator::NotContains => !coerce(field).contains(&coerce(expected)),
        Operator::StartsWith => coerce(field).starts_with(&coerce(expected)),
        Operator::EndsWith => coerce(field).ends_with(&coerce(expected)),
        Operator::Regex => match expected {
            Value::String(pattern) => {
                Regex::new(pattern).map(|re| re.is_match(&coerce(field))).unwrap_or(false)
            },
            _ => false,
        },
        Operator::Gt => ordering() == Some(Ordering::Greater),
        Operator::Gte => matches!(ordering(), Some(Ordering::Greater | Ordering::Equal)),
        Operator::Lt => ordering() == Some(Ordering::Less),
        Operator::Lte => matches!(ordering(), Some(Ordering::Less | Ordering::Equal)),
        Operator::In => member_of(field, expected).unwrap_or(false),
        Operator::NotIn => member_of(field, expected).is_some_and(|found| !found),
        Operator::Exists => true,
        Operator::NotExists => false,
    }
}

/// Evaluates one rule against a document, applying its negate flag.
pub fn evaluate_rule(rule: &FilterRule, doc: &Map<String, Value>) -> bool {
    let raw = match rule.operator.parse::<Operator>() {
        Ok(op) => match resolve(doc, &rule.field) {
            Lookup::Unresolvable => false,
            Lookup::Absent => op.on_absent(),
            Lookup::Present(field) => apply(op, field, &rule.value),
        },
        Err(_) => false,
    };
    raw != rule.negate
}

/// Evaluates a group against a document.
pub fn evaluate_group(group: &FilterGroup, doc: &Map<String, Value>) -> bool {
    if group.disabled {
        return false;
    }
    let mut results = group
        .rules
        .iter()
        .map(|rule| evaluate_rule(rule, doc))
        .chain(group.groups.iter().map(|child| evaluate_group(child, doc)));

    match Logic::parse(&group.logic).unwrap_or(Logic::And) {
        Logic::And => results.all(|passed| passed),
        Logic::Or => {
            let mut results = results.peekable();
            results.peek().is_none() || results.any(|passed| passed)
        },
    }
}

/// Evaluates a group against an event.
pub fn evaluate(group: &FilterGroup, event: &Event) -> bool {
    evaluate_group(group, &event.to_document())
}

/// Subscriber-level decision over a subscriber's filters.
///
/// Inactive filters are ignored. With no active filters every event passes;
/// otherwise the event passes when any active filter matches.
pub fn subscriber_accepts(filters: &[SubscriberFilter], doc: &Map<String, Value>) -> bool {
    let mut active = filters.iter().filter(|f| f.active).peekable();
    active.peek().is_none() || active.any(|f| evaluate_group(&f.group, doc))
}

/// Checks a group for unknown operators, bad patterns, and bad logic values.
///
/// # Errors
///
/// Returns [`DeliveryError::InvalidFilter`] naming the first offending path,
/// for example `group.groups[1].rules[0].value`.
pub fn validate(group: &FilterGroup) -> Result<()> {
    validate_at(group, "group")
}

fn validate_at(group: &FilterGroup, path: &str) -> Result<()> {
    if Logic::parse(&group.logic).is_none() {
        return Err(DeliveryError::invalid_filter(
            format!("{path}.logic"),
            format!("logic must be empty, 'and' or 'or', got '{}'", group.logic),
        ));
    }
    for (i, rule) in group.rules.iter().enumerate() {
        validate_rule(rule, &format!("{path}.rules[{i}]"))?;
    }
    for (i, child) in group.groups.iter().enumerate() {
        validate_at(child, &format!("{path}.groups[{i}]"))?;
    }
    Ok(())
}

fn validate_rule(rule: &FilterRule, path: &str) -> Result<()> {
    if rule.field.trim().is_empty() {
        return Err(DeliveryError::invalid_filter(format!("{path}.field"), "field must not be empty"));
    }
    let op: Operator = rule.operator.parse().map_err(|_| {
        DeliveryError::invalid_filter(
            format!("{path}.operator"),
            format!("unknown operator '{}'", rule.operator),
        )
    })?;
    match op {
        Operator::Regex => {
            let Value::String(pattern) = &rule.value else {
                return Err(DeliveryError::invalid_filter(
                    format!("{path}.value"),
                    "regex value must be a string",
                ));
            };
            Regex::new(pattern).map_err(|e| {
                DeliveryError::invalid_filter(format!("{path}.value"), format!("invalid regex: {e}"))
            })?;
        },
        Operator::In | Operator::NotIn if !rule.value.is_array() => {
            return Err(DeliveryError::invalid_filter(
                format!("{path}.value"),
                format!("{op} requires a list value"),
            ));
        },
        _ => {},
    }
    Ok(())
}

/// Per-rule outcome reported by [`test_filter`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleOutcome {
    /// Location of the rule, e.g. `group.groups[0].rules[1]`.
    pub path: String,
    /// Field the rule reads.
    pub field: String,
    /// Operator name.
    pub operator: String,
    /// Result after negation.
    pub matched: bool,
}

/// Result of dry-running a candidate filter against a sample event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FilterTestResult {
    /// Whether the whole group matched.
    pub matched: bool,
    /// Every rule's outcome in document order.
    pub rules: Vec<RuleOutcome>,
}

/// Validates and evaluates `group` against `event` without side effects.
///
/// # Errors
///
/// Returns the validation error when the group is invalid.
pub fn test_filter(group: &FilterGroup, event: &Event) -> Result<FilterTestResult> {
    validate(group)?;
    let doc = event.to_document();
    let mut rules = Vec::new();
    collect_outcomes(group, &doc, "group", &mut rules);
    Ok(FilterTestResult { matched: evaluate_group(group, &doc), rules })
}

fn collect_outcomes(
    group: &FilterGroup,
    doc: &Map<String, Value>,
    path: &str,
    out: &mut Vec<RuleOutcome>,
) {
    for (i, rule) in group.rules.iter().enumerate() {
        out.push(RuleOutcome {
            path: format!("{path}.rules[{i}]"),
            field: rule.field.clone(),
            operator: rule.operator.clone(),
            matched: evaluate_rule(rule, doc),
        });
    }
    for (i, child) in group.groups.iter().enumerate() {
        collect_outcomes(child, doc, &format!("{path}.groups[{i}]"), out);
    }
}
