use serde_json::{Map, Value};

use crate::sync::error::{invalid_argument, SyncResult};

/// Splits a dotted field path (`"dimensions.height"`) into its segments.
pub fn split_field_path(field: &str) -> SyncResult<Vec<&str>> {
    if field.is_empty() {
        return Err(invalid_argument("Field paths must not be empty"));
    }
    let segments: Vec<&str> = field.split('.').collect();
    if segments.iter().any(|segment| segment.is_empty()) {
        return Err(invalid_argument(format!(
            "Field path {field:?} contains an empty segment"
        )));
    }
    Ok(segments)
}

/// Reads the value at a dotted field path.
pub fn get_field<'a>(data: &'a Map<String, Value>, field: &str) -> Option<&'a Value> {
    let mut segments = field.split('.');
    let first = segments.next()?;
    let mut current = data.get(first)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Writes `value` at a dotted field path, creating (or replacing non-object) intermediate maps.
pub fn set_field(data: &mut Map<String, Value>, field: &str, value: Value) -> SyncResult<()> {
    let segments = split_field_path(field)?;
    let (last, parents) = segments
        .split_last()
        .ok_or_else(|| invalid_argument("Field paths must not be empty"))?;
    let mut current = data;
    for segment in parents {
        let slot = current
            .entry((*segment).to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !slot.is_object() {
            *slot = Value::Object(Map::new());
        }
        current = match slot {
            Value::Object(map) => map,
            _ => return Err(invalid_argument(format!("Cannot descend into {segment}"))),
        };
    }
    current.insert((*last).to_string(), value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn reads_nested_values() {
        let data = object(json!({"dimensions": {"height": 120}, "name": "Sword"}));
        assert_eq!(get_field(&data, "dimensions.height"), Some(&json!(120)));
        assert_eq!(get_field(&data, "name"), Some(&json!("Sword")));
        assert_eq!(get_field(&data, "dimensions.width"), None);
        assert_eq!(get_field(&data, "name.first"), None);
    }

    #[test]
    fn writes_nested_values() {
        let mut data = object(json!({"dimensions": 3}));
        set_field(&mut data, "dimensions.height", json!(10)).unwrap();
        set_field(&mut data, "tags.primary.color", json!("red")).unwrap();
        assert_eq!(
            Value::Object(data),
            json!({"dimensions": {"height": 10}, "tags": {"primary": {"color": "red"}}})
        );
    }

    #[test]
    fn rejects_empty_segments() {
        assert!(split_field_path("").is_err());
        assert!(split_field_path("a..b").is_err());
        assert!(split_field_path(".a").is_err());
        assert_eq!(split_field_path("a.b").unwrap(), vec!["a", "b"]);
    }
}
