//! Event Matcher: partial structural matching with `$$` directives
//!
//! A filter only constrains the fields it names. Documents match partially
//! at every depth, arrays element-wise with equal length, numbers by value.
//! A filter value that is a document made only of `$$`-prefixed keys is a
//! directive and is applied instead of equality.

use std::fmt;

use serde::Serialize;
use shared::{numbers_equal, render, value_type_name, Document, Value};

use crate::core::entity_map::EntityMap;
use crate::core::events::CapturedEvent;
use crate::error::InterpreterResult;

/// Where and why a filter did not match
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MatchFailure {
    pub path: String,
    pub reason: String,
}

impl fmt::Display for MatchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            write!(f, "(root): {}", self.reason)
        } else {
            write!(f, "{}: {}", self.path, self.reason)
        }
    }
}

type MatchResult = Result<(), MatchFailure>;

fn fail<S: Into<String>>(path: &str, reason: S) -> MatchResult {
    Err(MatchFailure {
        path: path.to_string(),
        reason: reason.into(),
    })
}

fn child_path(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{path}.{key}")
    }
}

/// True when `value` is a non-empty document whose keys are all directives
pub fn is_directive(value: &Value) -> bool {
    match value {
        Value::Object(document) => {
            !document.is_empty() && document.keys().all(|key| key.starts_with("$$"))
        }
        _ => false,
    }
}

/// Look up every entity named by a `$$sessionLsid` or `$$matchesEntity` directive
///
/// Filters are checked when their operation is built, so a name that does
/// not resolve fails the step instead of reading as a non-matching event.
pub fn resolve_entity_references(entities: &EntityMap, filter: &Value) -> InterpreterResult<()> {
    match filter {
        Value::Object(fields) => {
            for (key, value) in fields {
                match (key.as_str(), value.as_str()) {
                    ("$$sessionLsid", Some(name)) => {
                        entities.session(name)?;
                    }
                    ("$$matchesEntity", Some(name)) => {
                        entities.result(name)?;
                    }
                    _ => resolve_entity_references(entities, value)?,
                }
            }
            Ok(())
        }
        Value::Array(items) => items
            .iter()
            .try_for_each(|item| resolve_entity_references(entities, item)),
        _ => Ok(()),
    }
}

/// Stateless matcher, optionally bound to an Entity Map for entity directives
#[derive(Debug, Clone, Copy, Default)]
pub struct EventMatcher<'a> {
    entities: Option<&'a EntityMap>,
}

impl<'a> EventMatcher<'a> {
    pub fn new() -> Self {
        Self { entities: None }
    }

    pub fn with_entities(entities: &'a EntityMap) -> Self {
        Self {
            entities: Some(entities),
        }
    }

    pub fn matches(&self, expected: &Value, actual: &Value) -> bool {
        self.check(expected, actual).is_ok()
    }

    /// Match `actual` against `expected`, naming the first mismatching path
    pub fn check(&self, expected: &Value, actual: &Value) -> MatchResult {
        self.check_at("", expected, Some(actual))
    }

    /// Match an event filter against the event's `{ <type>: <body> }` projection
    pub fn matches_event(&self, filter: &Document, event: &CapturedEvent) -> bool {
        self.check(&Value::Object(filter.clone()), &event.projection()).is_ok()
    }

    pub fn event_predicate(&self, filter: &Document) -> impl Fn(&CapturedEvent) -> bool + 'a {
        let matcher = *self;
        let filter = Value::Object(filter.clone());
        move |event: &CapturedEvent| matcher.check(&filter, &event.projection()).is_ok()
    }

    pub fn count(&self, events: &[CapturedEvent], filter: &Document) -> usize {
        let predicate = self.event_predicate(filter);
        events.iter().filter(|event| predicate(event)).count()
    }

    fn check_at(&self, path: &str, expected: &Value, actual: Option<&Value>) -> MatchResult {
        if let Value::Object(directives) = expected {
            if is_directive(expected) {
                for (directive, operand) in directives {
                    self.apply_directive(path, directive, operand, actual)?;
                }
                return Ok(());
            }
        }

        let actual = match actual {
            Some(actual) => actual,
            None => return fail(path, format!("expected {} but the field is absent", render(expected))),
        };

        match (expected, actual) {
            (Value::Object(expected_fields), Value::Object(actual_fields)) => {
                for (key, expected_value) in expected_fields {
                    self.check_at(&child_path(path, key), expected_value, actual_fields.get(key))?;
                }
                Ok(())
            }
            (Value::Object(_), other) => fail(path, format!("expected object, found {}", value_type_name(other))),
            (Value::Array(expected_items), Value::Array(actual_items)) => {
                if expected_items.len() != actual_items.len() {
                    return fail(
                        path,
                        format!(
                            "expected array of length {}, found length {}",
                            expected_items.len(),
                            actual_items.len()
                        ),
                    );
                }
                for (index, (expected_item, actual_item)) in expected_items.iter().zip(actual_items).enumerate() {
                    self.check_at(&child_path(path, &index.to_string()), expected_item, Some(actual_item))?;
                }
                Ok(())
            }
            (Value::Number(_), Value::Number(_)) => {
                if numbers_equal(expected, actual) {
                    Ok(())
                } else {
                    fail(path, format!("expected {}, found {}", render(expected), render(actual)))
                }
            }
            _ => {
                if expected == actual {
                    Ok(())
                } else {
                    fail(path, format!("expected {}, found {}", render(expected), render(actual)))
                }
            }
        }
    }

    fn apply_directive(&self, path: &str, directive: &str, operand: &Value, actual: Option<&Value>) -> MatchResult {
        match directive {
            "$$exists" => {
                let should_exist = match operand.as_bool() {
                    Some(flag) => flag,
                    None => return fail(path, "$$exists requires a boolean"),
                };
                match (should_exist, actual.is_some()) {
                    (true, false) => fail(path, "expected field to exist"),
                    (false, true) => fail(path, "expected field to be absent"),
                    _ => Ok(()),
                }
            }
            "$$type" => {
                let allowed: Vec<&str> = match operand {
                    Value::String(name) => vec![name.as_str()],
                    Value::Array(names) => names.iter().filter_map(Value::as_str).collect(),
                    _ => return fail(path, "$$type requires a string or an array of strings"),
                };
                let actual = match actual {
                    Some(actual) => actual,
                    None => return fail(path, format!("expected type {allowed:?} but the field is absent")),
                };
                let actual_type = value_type_name(actual);
                let accepted = allowed.iter().any(|name| {
                    *name == actual_type || (*name == "number" && matches!(actual_type, "int" | "long" | "double"))
                });
                if accepted {
                    Ok(())
                } else {
                    fail(path, format!("expected type {allowed:?}, found {actual_type}"))
                }
            }
            "$$unsetOrMatches" => match actual {
                None => Ok(()),
                Some(_) => self.check_at(path, operand, actual),
            },
            "$$lt" | "$$lte" | "$$gt" | "$$gte" => {
                let bound = match operand.as_f64() {
                    Some(bound) => bound,
                    None => return fail(path, format!("{directive} requires a number")),
                };
                let value = match actual.and_then(Value::as_f64) {
                    Some(value) => value,
                    None => {
                        let found = actual.map(value_type_name).unwrap_or("absent");
                        return fail(path, format!("{directive} requires a numeric field, found {found}"));
                    }
                };
                let holds = match directive {
                    "$$lt" => value < bound,
                    "$$lte" => value <= bound,
                    "$$gt" => value > bound,
                    _ => value >= bound,
                };
                if holds {
                    Ok(())
                } else {
                    fail(path, format!("expected {directive} {}, found {}", render(operand), value))
                }
            }
            "$$matchesEntity" => {
                let stored = self.resolve(path, directive, operand, |entities, name| {
                    entities.result(name).map(|value| (*value).clone())
                })?;
                self.check_at(path, &stored, actual)
            }
            "$$sessionLsid" => {
                let lsid = self.resolve(path, directive, operand, |entities, name| {
                    entities.session(name).map(|session| Value::Object(session.handle().lsid()))
                })?;
                match actual {
                    Some(actual) if *actual == lsid => Ok(()),
                    Some(actual) => fail(path, format!("expected lsid {}, found {}", render(&lsid), render(actual))),
                    None => fail(path, "expected a session lsid but the field is absent"),
                }
            }
            unknown => fail(path, format!("unknown matcher directive '{unknown}'")),
        }
    }

    fn resolve<F>(&self, path: &str, directive: &str, operand: &Value, lookup: F) -> Result<Value, MatchFailure>
    where
        F: FnOnce(&EntityMap, &str) -> InterpreterResult<Value>,
    {
        let name = operand.as_str().ok_or_else(|| MatchFailure {
            path: path.to_string(),
            reason: format!("{directive} requires an entity name"),
        })?;
        let entities = self.entities.ok_or_else(|| MatchFailure {
            path: path.to_string(),
            reason: format!("{directive} needs an entity map"),
        })?;
        lookup(entities, name).map_err(|error| MatchFailure {
            path: path.to_string(),
            reason: error.to_string(),
        })
    }
}
