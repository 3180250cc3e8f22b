//! Subscription rules and matching.
//!
//! A subscription is a list of rules. Each rule is a string or a nested group
//! of rules. String rules are prefix-typed:
//!
//! - `!rule` - negate: a match rejects instead of accepting
//! - `#nature` - match any element of `natures`
//! - `@event` - match the `event` key
//! - `mime/type` - match `type` without parameters
//!
//! Patterns compare case-insensitively; a trailing `*` turns the pattern into
//! a prefix match, so `*` alone matches everything.
//!
//! Sibling rules are evaluated in order and the last matching one decides. A
//! nested group that accepts ends the whole evaluation with acceptance.

use crate::message::{Metadata, keys};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single rule or a nested group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Rule {
    Leaf(String),
    Group(Vec<Rule>),
}

impl From<&str> for Rule {
    fn from(rule: &str) -> Self {
        Self::Leaf(rule.to_string())
    }
}

/// A peer's declared interest.
///
/// Deserializes from a single rule string or a list of rules.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Rule", into = "Vec<Rule>")]
pub struct Subscriptions {
    rules: Vec<Rule>,
}

impl Subscriptions {
    /// Rules in evaluation order.
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    /// Subscribe to everything.
    pub fn all() -> Self {
        Self::new(vec![Rule::from("*")])
    }

    /// Parse the `subscriptions` value of a subscribe request.
    pub fn from_value(value: &Value) -> Result<Self, serde_json::Error> {
        Self::deserialize(value)
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// A rule set without rules matches nothing.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Whether an object with `metadata` should be delivered.
    pub fn matches(&self, metadata: &Metadata) -> bool {
        evaluate(&self.rules, metadata)
    }
}

impl From<Rule> for Subscriptions {
    fn from(rule: Rule) -> Self {
        match rule {
            Rule::Leaf(_) => Self::new(vec![rule]),
            Rule::Group(rules) => Self::new(rules),
        }
    }
}

impl From<Subscriptions> for Vec<Rule> {
    fn from(subscriptions: Subscriptions) -> Self {
        subscriptions.rules
    }
}

impl<R: Into<Rule>> FromIterator<R> for Subscriptions {
    fn from_iter<T: IntoIterator<Item = R>>(iter: T) -> Self {
        Self::new(iter.into_iter().map(Into::into).collect())
    }
}

fn evaluate(rules: &[Rule], metadata: &Metadata) -> bool {
    let mut pass = false;
    for rule in rules {
        match rule {
            Rule::Group(group) => {
                if evaluate(group, metadata) {
                    return true;
                }
            }
            Rule::Leaf(rule) => {
                if let Some(outcome) = leaf_outcome(rule, metadata) {
                    pass = outcome;
                }
            }
        }
    }
    pass
}

/// `Some(accept)` when the rule matches, `None` when it does not apply.
fn leaf_outcome(rule: &str, metadata: &Metadata) -> Option<bool> {
    let (negated, rule) = match rule.strip_prefix('!') {
        Some(rest) => (true, rest),
        None => (false, rule),
    };

    let matched = if let Some(pattern) = rule.strip_prefix('#') {
        metadata
            .natures()
            .is_some_and(|natures| natures.iter().any(|n| value_matches(pattern, n)))
    } else if let Some(pattern) = rule.strip_prefix('@') {
        metadata
            .get(keys::EVENT)
            .is_some_and(|event| value_matches(pattern, event))
    } else {
        match metadata.get(keys::TYPE) {
            // Untyped objects (most events) match as the empty type.
            None => wildcard_matches(rule, ""),
            Some(_) => metadata
                .mime_type()
                .is_some_and(|mime| wildcard_matches(rule, mime)),
        }
    };

    matched.then_some(!negated)
}

fn value_matches(pattern: &str, candidate: &Value) -> bool {
    candidate
        .as_str()
        .is_some_and(|candidate| wildcard_matches(pattern, candidate))
}

/// Case-insensitive match with an optional trailing `*` for prefix matching.
///
/// Both sides are compared in Unicode lowercase.
pub fn wildcard_matches(pattern: &str, candidate: &str) -> bool {
    let candidate = candidate.to_lowercase();
    match pattern.strip_suffix('*') {
        Some(prefix) => candidate.starts_with(&prefix.to_lowercase()),
        None => candidate == pattern.to_lowercase(),
    }
}
