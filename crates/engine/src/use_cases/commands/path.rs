//! Legacy dotted-path commands: `set`, `add`, `push`, `delete`.
//!
//! Paths address the serialized game-state document (`character.currency`,
//! `inventory.0.quantity`). After the edit the document is deserialized back,
//! so writes that break a typed section fail instead of corrupting it.

use serde_json::{Map, Number, Value};

use taverndb_domain::{Action, Command, CommandPayload, DomainError, GameState, PathAssignment};

/// Top-level keys a path command may never address.
const RESERVED_ROOTS: [&str; 1] = ["__tableMeta"];

pub(super) fn apply(state: &mut GameState, command: &Command) -> Result<(), DomainError> {
    let CommandPayload::Path(assignment) = &command.payload else {
        return Err(DomainError::validation(format!(
            "{} requires a key path",
            command.action
        )));
    };
    let segments = split_path(&command.action, assignment)?;

    let mut document = state.to_document()?;
    match &command.action {
        Action::Set => {
            let value = required_value(&command.action, assignment)?;
            *slot_mut(&mut document, &segments, true)? = value;
        }
        Action::Add => {
            let delta = required_value(&command.action, assignment)?;
            let slot = slot_mut(&mut document, &segments, true)?;
            *slot = add_numbers(slot, &delta, &assignment.path)?;
        }
        Action::Push => {
            let value = required_value(&command.action, assignment)?;
            let slot = slot_mut(&mut document, &segments, true)?;
            if slot.is_null() {
                *slot = Value::Array(Vec::new());
            }
            match slot {
                Value::Array(items) => match value {
                    Value::Array(values) => items.extend(values),
                    other => items.push(other),
                },
                _ => {
                    return Err(DomainError::validation(format!(
                        "push target {} is not an array",
                        assignment.path
                    )))
                }
            }
        }
        Action::Delete => remove_at(&mut document, &segments)?,
        other => {
            return Err(DomainError::validation(format!(
                "{} is not a path command",
                other
            )))
        }
    }

    *state = GameState::from_document(document)?;
    Ok(())
}

fn required_value(action: &Action, assignment: &PathAssignment) -> Result<Value, DomainError> {
    assignment
        .value
        .clone()
        .ok_or_else(|| DomainError::validation(format!("{} missing field value", action)))
}

fn split_path<'a>(action: &Action, assignment: &'a PathAssignment) -> Result<Vec<&'a str>, DomainError> {
    let path = assignment.path.as_str();
    if path.is_empty() {
        return Err(DomainError::validation(format!("{} missing field key", action)));
    }
    let segments: Vec<&str> = path.split('.').map(str::trim).collect();
    if segments.iter().any(|segment| segment.is_empty()) {
        return Err(DomainError::validation(format!("invalid path: {}", path)));
    }
    if RESERVED_ROOTS.contains(&segments[0]) {
        return Err(DomainError::validation(format!("path {} is reserved", path)));
    }
    Ok(segments)
}

/// Walk to the slot for `segments`, creating missing objects along the way when `create` is set.
fn slot_mut<'a>(
    root: &'a mut Value,
    segments: &[&str],
    create: bool,
) -> Result<&'a mut Value, DomainError> {
    let mut current = root;
    for segment in segments {
        if current.is_null() && create {
            *current = Value::Object(Map::new());
        }
        current = match current {
            Value::Object(map) => {
                if !map.contains_key(*segment) && !create {
                    return Err(DomainError::not_found("path segment", *segment));
                }
                map.entry(segment.to_string()).or_insert(Value::Null)
            }
            Value::Array(items) => {
                let index: usize = segment
                    .parse()
                    .map_err(|_| DomainError::validation(format!("invalid array index: {}", segment)))?;
                let len = items.len();
                items.get_mut(index).ok_or_else(|| {
                    DomainError::validation(format!("index {} out of bounds (len {})", index, len))
                })?
            }
            _ => {
                return Err(DomainError::validation(format!(
                    "cannot descend into scalar at {}",
                    segment
                )))
            }
        };
    }
    Ok(current)
}

fn add_numbers(current: &Value, delta: &Value, path: &str) -> Result<Value, DomainError> {
    let delta_number = delta
        .as_number()
        .ok_or_else(|| DomainError::validation(format!("add value for {} must be numeric", path)))?;
    let zero = Number::from(0);
    let current_number = match current {
        Value::Null => &zero,
        Value::Number(n) => n,
        _ => {
            return Err(DomainError::validation(format!(
                "add target {} is not numeric",
                path
            )))
        }
    };

    if let (Some(a), Some(b)) = (current_number.as_i64(), delta_number.as_i64()) {
        return Ok(Value::from(a.saturating_add(b)));
    }
    let sum = current_number.as_f64().unwrap_or(0.0) + delta_number.as_f64().unwrap_or(0.0);
    Number::from_f64(sum)
        .map(Value::Number)
        .ok_or_else(|| DomainError::validation(format!("add result for {} is not finite", path)))
}

/// Remove the addressed key or array element; absent targets are a no-op.
fn remove_at(root: &mut Value, segments: &[&str]) -> Result<(), DomainError> {
    let Some((last, parents)) = segments.split_last() else {
        return Ok(());
    };
    let parent = match slot_mut(root, parents, false) {
        Ok(parent) => parent,
        Err(DomainError::NotFound { .. }) => return Ok(()),
        Err(e) => return Err(e),
    };
    match parent {
        Value::Object(map) => {
            map.remove(*last);
        }
        Value::Array(items) => {
            if let Ok(index) = last.parse::<usize>() {
                if index < items.len() {
                    items.remove(index);
                }
            }
        }
        _ => {}
    }
    Ok(())
}
