//! Listener registrations: patterns, conditions and persistence.

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set,
};
use serde_json::{Map, Value};

use super::errors::{EventError, Result};
use crate::entity::event_listener::{ActiveModel, Column, Entity as EventListener, Model};

/// A listener registration request.
#[derive(Debug, Clone, PartialEq)]
pub struct ListenerSpec {
    /// Event name, `*`, or `prefix.*`.
    pub event_name: String,
    pub handler: String,
    pub priority: i32,
    /// Dot-path to expected value; all must match for the listener to run.
    pub conditions: Map<String, Value>,
}

impl ListenerSpec {
    pub fn new(event_name: impl Into<String>, handler: impl Into<String>) -> Self {
        Self {
            event_name: event_name.into(),
            handler: handler.into(),
            priority: 0,
            conditions: Map::new(),
        }
    }

    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_condition(mut self, path: impl Into<String>, expected: Value) -> Self {
        self.conditions.insert(path.into(), expected);
        self
    }
}

/// Validate a listener pattern.
pub fn validate_pattern(pattern: &str) -> Result<()> {
    if pattern == "*" {
        return Ok(());
    }
    let name = pattern.strip_suffix(".*").unwrap_or(pattern);
    let valid = !name.is_empty()
        && name
            .split('.')
            .all(|segment| !segment.is_empty() && !segment.contains('*'));
    if valid {
        Ok(())
    } else {
        Err(EventError::InvalidPattern(pattern.to_string()))
    }
}

/// Whether `pattern` selects `event_name`.
pub fn pattern_matches(pattern: &str, event_name: &str) -> bool {
    if pattern == "*" || pattern == event_name {
        return true;
    }
    match pattern.strip_suffix(".*") {
        Some(prefix) => event_name
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('.')),
        None => false,
    }
}

/// Every pattern that could select `event_name`.
fn candidate_patterns(event_name: &str) -> Vec<String> {
    let mut patterns = vec![event_name.to_string(), "*".to_string()];
    let mut prefix = String::new();
    let segments: Vec<&str> = event_name.split('.').collect();
    for segment in &segments[..segments.len().saturating_sub(1)] {
        if !prefix.is_empty() {
            prefix.push('.');
        }
        prefix.push_str(segment);
        patterns.push(format!("{prefix}.*"));
    }
    patterns
}

/// Resolve a dot path (`order.items.0.sku`) inside `payload`.
pub fn lookup_path<'a>(payload: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(payload, |value, segment| match value {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn values_match(actual: &Value, expected: &Value) -> bool {
    if actual == expected {
        return true;
    }
    match (actual, expected) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        (Value::Number(_) | Value::Bool(_), Value::String(s)) => actual.to_string() == *s,
        (Value::String(s), Value::Number(_) | Value::Bool(_)) => expected.to_string() == *s,
        _ => false,
    }
}

/// Whether every condition holds for `payload`. Empty conditions always match.
pub fn conditions_match(conditions: &Value, payload: &Value) -> bool {
    match conditions {
        Value::Object(map) => map.iter().all(|(path, expected)| {
            lookup_path(payload, path).is_some_and(|actual| values_match(actual, expected))
        }),
        Value::Null => true,
        _ => false,
    }
}

/// Register a listener, or update and reactivate an existing one.
///
/// Idempotent per `(event_name, handler)`.
pub async fn add(db: &DatabaseConnection, spec: &ListenerSpec) -> Result<Model> {
    validate_pattern(&spec.event_name)?;
    let now = Utc::now().fixed_offset();

    let existing = EventListener::find()
        .filter(Column::EventName.eq(spec.event_name.as_str()))
        .filter(Column::Handler.eq(spec.handler.as_str()))
        .one(db)
        .await?;

    let conditions = Value::Object(spec.conditions.clone());
    match existing {
        Some(existing) => {
            let unchanged = existing.active
                && existing.priority == spec.priority
                && existing.conditions == conditions;
            if unchanged {
                return Ok(existing);
            }
            let mut model: ActiveModel = existing.into();
            model.priority = Set(spec.priority);
            model.conditions = Set(conditions);
            model.active = Set(true);
            model.updated_at = Set(now);
            Ok(model.update(db).await?)
        }
        None => {
            let model = ActiveModel {
                event_name: Set(spec.event_name.clone()),
                handler: Set(spec.handler.clone()),
                priority: Set(spec.priority),
                active: Set(true),
                conditions: Set(conditions),
                created_at: Set(now),
                updated_at: Set(now),
                ..Default::default()
            };
            Ok(model.insert(db).await?)
        }
    }
}

/// Deactivate a listener. Returns `false` if no active registration existed.
pub async fn remove(db: &DatabaseConnection, event_name: &str, handler: &str) -> Result<bool> {
    let result = EventListener::update_many()
        .col_expr(Column::Active, sea_orm::sea_query::Expr::value(false))
        .col_expr(
            Column::UpdatedAt,
            sea_orm::sea_query::Expr::value(Utc::now().fixed_offset()),
        )
        .filter(Column::EventName.eq(event_name))
        .filter(Column::Handler.eq(handler))
        .filter(Column::Active.eq(true))
        .exec(db)
        .await?;
    Ok(result.rows_affected > 0)
}

/// Active listeners selected by `event_name`, by priority desc then registration order.
pub async fn active_for(db: &DatabaseConnection, event_name: &str) -> Result<Vec<Model>> {
    Ok(EventListener::find()
        .filter(Column::Active.eq(true))
        .filter(Column::EventName.is_in(candidate_patterns(event_name)))
        .order_by_desc(Column::Priority)
        .order_by_asc(Column::Id)
        .all(db)
        .await?)
}

/// All registrations, including inactive ones.
pub async fn all(db: &DatabaseConnection) -> Result<Vec<Model>> {
    Ok(EventListener::find()
        .order_by_asc(Column::EventName)
        .order_by_desc(Column::Priority)
        .order_by_asc(Column::Id)
        .all(db)
        .await?)
}
