// Mutations of a room's shared JSON document.

use chrono::{DateTime, Utc};
use huddle_common::types::OperationKind;
use serde_json::{Map, Value};

use crate::error::CollabError;

const TASKS_KEY: &str = "tasks";

/// Apply one operation to `document` in place.
///
/// Callers that need all-or-nothing semantics apply to a copy; a failed
/// operation may leave `document` partially modified.
pub fn apply_operation(
    document: &mut Value,
    kind: &OperationKind,
    author_id: Option<&str>,
    timestamp: DateTime<Utc>,
) -> Result<(), CollabError> {
    match kind {
        OperationKind::SetValue { path, value } => set_path(document, path, value.clone()),
        OperationKind::UpdateTask { task_id, updates } => {
            let Value::Object(updates) = updates else {
                return Err(CollabError::InvalidOperation(
                    "UPDATE_TASK updates must be an object".to_string(),
                ));
            };
            let tasks = tasks_mut(document, task_id)?;
            let task = object_mut(tasks.entry(task_id.clone()).or_insert(Value::Null));
            for (key, value) in updates {
                task.insert(key.clone(), value.clone());
            }
            task.insert(
                "lastModifiedBy".to_string(),
                author_id.map_or(Value::Null, |id| Value::String(id.to_string())),
            );
            task.insert("lastModifiedAt".to_string(), Value::String(timestamp.to_rfc3339()));
            Ok(())
        }
        OperationKind::AddTask { task_id, task } => {
            tasks_mut(document, task_id)?.insert(task_id.clone(), task.clone());
            Ok(())
        }
        OperationKind::DeleteTask { task_id } => {
            if task_id.is_empty() {
                return Err(CollabError::InvalidOperation("task id must not be empty".to_string()));
            }
            if let Some(Value::Object(tasks)) = object_mut(document).get_mut(TASKS_KEY) {
                tasks.remove(task_id);
            }
            Ok(())
        }
    }
}

/// Set `value` at a dotted path, replacing missing or non-object
/// intermediates with empty objects.
pub fn set_path(document: &mut Value, path: &str, value: Value) -> Result<(), CollabError> {
    let segments: Vec<&str> = path.split('.').collect();
    if path.is_empty() || segments.iter().any(|segment| segment.is_empty()) {
        return Err(CollabError::InvalidOperation(format!("invalid document path `{path}`")));
    }

    let (last, parents) = segments
        .split_last()
        .ok_or_else(|| CollabError::InvalidOperation(format!("invalid document path `{path}`")))?;

    let mut current = object_mut(document);
    for segment in parents {
        current = object_mut(current.entry((*segment).to_string()).or_insert(Value::Null));
    }
    current.insert((*last).to_string(), value);
    Ok(())
}

/// Serialized size of the document in bytes.
pub fn serialized_len(document: &Value) -> usize {
    serde_json::to_vec(document).map(|bytes| bytes.len()).unwrap_or(usize::MAX)
}

/// View `value` as an object, replacing any non-object with `{}` first.
fn object_mut(value: &mut Value) -> &mut Map<String, Value> {
    if !value.is_object() {
        *value = Value::Object(Map::new());
    }
    match value {
        Value::Object(map) => map,
        _ => unreachable!("value was just replaced with an object"),
    }
}

fn tasks_mut<'a>(
    document: &'a mut Value,
    task_id: &str,
) -> Result<&'a mut Map<String, Value>, CollabError> {
    if task_id.is_empty() {
        return Err(CollabError::InvalidOperation("task id must not be empty".to_string()));
    }
    let tasks = object_mut(document).entry(TASKS_KEY.to_string()).or_insert(Value::Null);
    Ok(object_mut(tasks))
}
