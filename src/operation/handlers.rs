//! Generic handlers for target fields shaped as `{ entity_id: { ...fields } }`
//!
//! These cover the common keyed-map mutations (set a field, toggle a flag,
//! assign an owner, replace or remove an entity). Domain-specific kinds are
//! registered by the host the same way.

use serde_json::{Map, Value};

use super::manager::{HandlerError, OperationManager};
use super::SyncOperation;

pub const SET_FIELD: &str = "set_field";
pub const TOGGLE_FIELD: &str = "toggle_field";
pub const ASSIGN_OWNER: &str = "assign_owner";
pub const REPLACE_ENTITY: &str = "replace_entity";
pub const REMOVE_ENTITY: &str = "remove_entity";

/// Register every generic handler for `target_field`.
pub fn register_entity_map_handlers(manager: &mut OperationManager, target_field: &str) {
    manager.register_handler(target_field, SET_FIELD, set_field);
    manager.register_handler(target_field, TOGGLE_FIELD, toggle_field);
    manager.register_handler(target_field, ASSIGN_OWNER, assign_owner);
    manager.register_handler(target_field, REPLACE_ENTITY, replace_entity);
    manager.register_handler(target_field, REMOVE_ENTITY, remove_entity);
}

fn entity_map(slice: &Value) -> Result<Map<String, Value>, HandlerError> {
    match slice {
        Value::Null => Ok(Map::new()),
        Value::Object(map) => Ok(map.clone()),
        other => Err(HandlerError::new(format!(
            "expected an object slice, found {}",
            json_type(other)
        ))),
    }
}

fn entity_id(op: &SyncOperation) -> Result<String, HandlerError> {
    op.entity_key()
        .ok_or_else(|| HandlerError::new("payload carries no entity key"))
}

fn payload_str<'a>(op: &'a SyncOperation, field: &str) -> Result<&'a str, HandlerError> {
    op.payload
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| HandlerError::new(format!("payload field '{field}' missing or not a string")))
}

fn entity_mut<'a>(
    map: &'a mut Map<String, Value>,
    id: &str,
) -> Result<&'a mut Map<String, Value>, HandlerError> {
    let entry = map
        .entry(id.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    match entry {
        Value::Object(fields) => Ok(fields),
        other => Err(HandlerError::new(format!(
            "entity '{id}' is {}, not an object",
            json_type(other)
        ))),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a bool",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// `{ id, field, value }` sets one field on the entity.
pub fn set_field(op: &SyncOperation, slice: &Value) -> Result<Value, HandlerError> {
    let id = entity_id(op)?;
    let field = payload_str(op, "field")?;
    let value = op.payload.get("value").cloned().unwrap_or(Value::Null);

    let mut map = entity_map(slice)?;
    entity_mut(&mut map, &id)?.insert(field.to_string(), value);
    Ok(Value::Object(map))
}

/// `{ id, field?, value? }` sets a boolean flag. With an explicit `value`
/// the flag is set to it; without one the current value is flipped.
pub fn toggle_field(op: &SyncOperation, slice: &Value) -> Result<Value, HandlerError> {
    let id = entity_id(op)?;
    let field = op
        .payload
        .get("field")
        .and_then(Value::as_str)
        .unwrap_or("done")
        .to_string();

    let mut map = entity_map(slice)?;
    let fields = entity_mut(&mut map, &id)?;
    let next = match op.payload.get("value") {
        Some(Value::Bool(b)) => *b,
        Some(other) => {
            return Err(HandlerError::new(format!(
                "toggle value must be a bool, found {}",
                json_type(other)
            )))
        }
        None => !fields.get(&field).and_then(Value::as_bool).unwrap_or(false),
    };
    fields.insert(field, Value::Bool(next));
    Ok(Value::Object(map))
}

/// `{ id, owner }` assigns (or with `null`, clears) the entity's owner.
pub fn assign_owner(op: &SyncOperation, slice: &Value) -> Result<Value, HandlerError> {
    let id = entity_id(op)?;
    let owner = match op.payload.get("owner") {
        Some(v @ (Value::String(_) | Value::Null)) => v.clone(),
        None => Value::Null,
        Some(other) => {
            return Err(HandlerError::new(format!(
                "owner must be a string or null, found {}",
                json_type(other)
            )))
        }
    };

    let mut map = entity_map(slice)?;
    entity_mut(&mut map, &id)?.insert("owner".to_string(), owner);
    Ok(Value::Object(map))
}

/// `{ id, value }` replaces the whole entity.
pub fn replace_entity(op: &SyncOperation, slice: &Value) -> Result<Value, HandlerError> {
    let id = entity_id(op)?;
    let value = op
        .payload
        .get("value")
        .cloned()
        .ok_or_else(|| HandlerError::new("payload field 'value' missing"))?;

    let mut map = entity_map(slice)?;
    map.insert(id, value);
    Ok(Value::Object(map))
}

/// `{ id }` removes the entity. Removing a missing entity is a no-op.
pub fn remove_entity(op: &SyncOperation, slice: &Value) -> Result<Value, HandlerError> {
    let id = entity_id(op)?;
    let mut map = entity_map(slice)?;
    map.remove(&id);
    Ok(Value::Object(map))
}
