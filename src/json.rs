//! Typed accessors for dynamically typed options objects.
//!
//! Channel options and control messages arrive as JSON objects whose
//! fields are optional and loosely typed. These helpers distinguish "a
//! field is absent" (the default applies) from "a field is present with
//! the wrong type" (a protocol violation).

use serde_json::{Map, Value};

use crate::{Error, Result};

/// Get a string field. Absent fields yield `None`; a non-string value
/// is a protocol error.
pub fn get_str<'a>(object: &'a Value, field: &str) -> Result<Option<&'a str>> {
    match object.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(_) => Err(Error::new_protocol()),
    }
}

/// Get an integer field.
pub fn get_int(object: &Value, field: &str) -> Result<Option<i64>> {
    match object.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n.as_i64().map(Some).ok_or_else(Error::new_protocol),
        Some(_) => Err(Error::new_protocol()),
    }
}

/// Get a numeric field as a double, used by manifest priorities.
pub fn get_double(object: &Value, field: &str) -> Result<Option<f64>> {
    match object.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => Ok(n.as_f64()),
        Some(_) => Err(Error::new_protocol()),
    }
}

/// Get a boolean field.
pub fn get_bool(object: &Value, field: &str) -> Result<Option<bool>> {
    match object.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(_) => Err(Error::new_protocol()),
    }
}

/// Get an object field.
pub fn get_object<'a>(object: &'a Value, field: &str) -> Result<Option<&'a Map<String, Value>>> {
    match object.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) => Ok(Some(map)),
        Some(_) => Err(Error::new_protocol()),
    }
}

/// Get an array field.
pub fn get_array<'a>(object: &'a Value, field: &str) -> Result<Option<&'a Vec<Value>>> {
    match object.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Array(items)) => Ok(Some(items)),
        Some(_) => Err(Error::new_protocol()),
    }
}

/// Get an array-of-strings field.
pub fn get_strv(object: &Value, field: &str) -> Result<Option<Vec<String>>> {
    match get_array(object, field)? {
        None => Ok(None),
        Some(items) => {
            let mut strings = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Value::String(s) => strings.push(s.clone()),
                    _ => return Err(Error::new_protocol()),
                }
            }
            Ok(Some(strings))
        }
    }
}

/// Deep-merge `patch` onto `target`: object values merge recursively,
/// a null value removes the key, and everything else replaces.
pub fn patch(target: &mut Map<String, Value>, patch_with: &Map<String, Value>) {
    for (key, value) in patch_with {
        match value {
            Value::Null => {
                target.remove(key);
            }
            Value::Object(child) => match target.get_mut(key) {
                Some(Value::Object(existing)) => patch(existing, child),
                _ => {
                    target.insert(key.clone(), value.clone());
                }
            },
            _ => {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn typed_accessors() {
        let object = json!({
            "name": "value",
            "count": 5,
            "flag": true,
            "nested": {"a": 1},
            "list": ["x", "y"],
        });

        assert_eq!(get_str(&object, "name").unwrap(), Some("value"));
        assert_eq!(get_str(&object, "absent").unwrap(), None);
        assert!(get_str(&object, "count").is_err());

        assert_eq!(get_int(&object, "count").unwrap(), Some(5));
        assert!(get_int(&object, "flag").is_err());

        assert_eq!(get_bool(&object, "flag").unwrap(), Some(true));
        assert!(get_object(&object, "nested").unwrap().is_some());
        assert_eq!(
            get_strv(&object, "list").unwrap(),
            Some(vec!["x".to_string(), "y".to_string()])
        );
        assert!(get_strv(&object, "nested").is_err());
    }

    #[test]
    fn patch_merges_and_removes() {
        let mut target = json!({
            "keep": 1,
            "replace": "old",
            "remove": true,
            "nested": {"deep": "old", "other": 2},
        });
        let overlay = json!({
            "replace": "new",
            "remove": null,
            "nested": {"deep": "new"},
            "added": [1, 2],
        });

        patch(
            target.as_object_mut().unwrap(),
            overlay.as_object().unwrap(),
        );

        assert_eq!(
            target,
            json!({
                "keep": 1,
                "replace": "new",
                "nested": {"deep": "new", "other": 2},
                "added": [1, 2],
            })
        );
    }

    #[test]
    fn patch_replaces_scalar_with_object() {
        let mut target = json!({"x": 5});
        let overlay = json!({"x": {"now": "object"}});
        patch(
            target.as_object_mut().unwrap(),
            overlay.as_object().unwrap(),
        );
        assert_eq!(target, json!({"x": {"now": "object"}}));
    }
}
