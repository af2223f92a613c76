//! Property filters for service lookup and dependency matching.
//!
//! A [`Filter`] is a small predicate tree evaluated against a [`Properties`]
//! map. The registry applies it during lookups; dependency handlers apply it
//! when deciding whether a service reference satisfies a requirement.

use std::fmt;

use serde_json::Value;

use crate::properties::Properties;

/// A predicate over a property map.
///
/// Filters are built with the constructor helpers and combined freely:
///
/// ```rust,ignore
/// let filter = Filter::and([
///     Filter::eq("protocol", "tcp"),
///     Filter::not(Filter::present("deprecated")),
/// ]);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Matches when the property equals the given value.
    Eq(String, Value),
    /// Matches when the property is present, whatever its value.
    Present(String),
    /// Negation.
    Not(Box<Filter>),
    /// Conjunction; empty matches everything.
    And(Vec<Filter>),
    /// Disjunction; empty matches nothing.
    Or(Vec<Filter>),
}

impl Filter {
    /// Equality test on one property.
    pub fn eq(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Eq(key.into(), value.into())
    }

    /// Presence test on one property.
    pub fn present(key: impl Into<String>) -> Self {
        Filter::Present(key.into())
    }

    /// Negates a filter.
    pub fn not(filter: Filter) -> Self {
        Filter::Not(Box::new(filter))
    }

    /// Conjunction of the given filters.
    pub fn and(filters: impl IntoIterator<Item = Filter>) -> Self {
        Filter::And(filters.into_iter().collect())
    }

    /// Disjunction of the given filters.
    pub fn or(filters: impl IntoIterator<Item = Filter>) -> Self {
        Filter::Or(filters.into_iter().collect())
    }

    /// Evaluates the filter against a property map.
    pub fn matches(&self, properties: &Properties) -> bool {
        match self {
            Filter::Eq(key, value) => properties.get(key) == Some(value),
            Filter::Present(key) => properties.contains_key(key),
            Filter::Not(inner) => !inner.matches(properties),
            Filter::And(all) => all.iter().all(|f| f.matches(properties)),
            Filter::Or(any) => any.iter().any(|f| f.matches(properties)),
        }
    }
}

fn write_value(f: &mut fmt::Formatter<'_>, value: &Value) -> fmt::Result {
    match value {
        Value::String(s) => f.write_str(s),
        other => write!(f, "{other}"),
    }
}

impl fmt::Display for Filter {
    /// LDAP-style rendering, used by introspection snapshots.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::Eq(key, value) => {
                write!(f, "({key}=")?;
                write_value(f, value)?;
                f.write_str(")")
            }
            Filter::Present(key) => write!(f, "({key}=*)"),
            Filter::Not(inner) => write!(f, "(!{inner})"),
            Filter::And(all) => {
                f.write_str("(&")?;
                for filter in all {
                    write!(f, "{filter}")?;
                }
                f.write_str(")")
            }
            Filter::Or(any) => {
                f.write_str("(|")?;
                for filter in any {
                    write!(f, "{filter}")?;
                }
                f.write_str(")")
            }
        }
    }
}
