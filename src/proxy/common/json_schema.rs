use serde_json::Value;

/// Recursively rewrite a JSON Schema into the subset the Gemini v1internal
/// interface accepts.
///
/// 1. Expand $ref / $defs so references become inline definitions
/// 2. Remove unsupported metadata: $schema, additionalProperties, format,
///    default, uniqueItems, advanced combinators
/// 3. Soft-remove validation constraints: the value moves into the field's
///    description as prose
/// 4. Downgrade union types (["string","null"] -> "string")
pub fn clean_json_schema(value: &mut Value) {
    if let Value::Object(map) = value {
        let mut defs = serde_json::Map::new();
        if let Some(Value::Object(d)) = map.remove("$defs") {
            defs.extend(d);
        }
        if let Some(Value::Object(d)) = map.remove("definitions") {
            defs.extend(d);
        }

        if !defs.is_empty() {
            inline_refs(map, &defs);
        }
    }

    clean_recursive(value);
}

/// Replace `$ref` nodes with the referenced definition. Tool schemas are
/// DAGs in practice; a circular reference would recurse forever.
fn inline_refs(map: &mut serde_json::Map<String, Value>, defs: &serde_json::Map<String, Value>) {
    if let Some(Value::String(ref_path)) = map.remove("$ref") {
        let ref_name = ref_path.split('/').next_back().unwrap_or(&ref_path);

        if let Some(Value::Object(def_map)) = defs.get(ref_name) {
            for (k, v) in def_map {
                map.entry(k.clone()).or_insert_with(|| v.clone());
            }
            inline_refs(map, defs);
        }
    }

    for (_, v) in map.iter_mut() {
        if let Value::Object(child) = v {
            inline_refs(child, defs);
        } else if let Value::Array(arr) = v {
            for item in arr {
                if let Value::Object(item_map) = item {
                    inline_refs(item_map, defs);
                }
            }
        }
    }
}

fn clean_recursive(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for v in map.values_mut() {
                clean_recursive(v);
            }

            let mut constraints = Vec::new();

            // `pattern` must hold a string to be a constraint; an object here
            // is a property that happens to be named "pattern".
            if let Some(val) = map.remove("pattern") {
                if let Value::String(s) = val {
                    constraints.push(format!("pattern: {}", s));
                } else {
                    map.insert("pattern".to_string(), val);
                }
            }

            let numeric_constraints = [
                ("minLength", "minLength"),
                ("maxLength", "maxLength"),
                ("minimum", "minimum"),
                ("maximum", "maximum"),
                ("minItems", "minItems"),
                ("maxItems", "maxItems"),
                ("exclusiveMinimum", "exclusiveMinimum"),
                ("exclusiveMaximum", "exclusiveMaximum"),
                ("multipleOf", "multipleOf"),
            ];
            for (field, label) in numeric_constraints {
                if let Some(val) = map.remove(field) {
                    if val.is_number() {
                        constraints.push(format!("{}: {}", label, val));
                    } else {
                        map.insert(field.to_string(), val);
                    }
                }
            }

            if !constraints.is_empty() {
                let suffix = format!(" ({})", constraints.join(", "));
                let desc = map
                    .entry("description".to_string())
                    .or_insert_with(|| Value::String(String::new()));
                if let Value::String(s) = desc {
                    s.push_str(&suffix);
                }
            }

            let unsupported = [
                "$schema",
                "additionalProperties",
                "enumCaseInsensitive",
                "enumNormalizeWhitespace",
                "uniqueItems",
                "format",
                "default",
                "propertyNames",
                "const",
                "anyOf",
                "oneOf",
                "allOf",
                "not",
                "if",
                "then",
                "else",
            ];
            for field in unsupported {
                map.remove(field);
            }

            // Types are kept in lowercase normal form; union types are not
            // representable upstream, keep the first non-null member.
            if let Some(type_val) = map.get_mut("type") {
                match type_val {
                    Value::String(s) => {
                        *type_val = Value::String(s.to_lowercase());
                    }
                    Value::Array(arr) => {
                        let mut selected = "string".to_string();
                        for item in arr.iter() {
                            if let Value::String(s) = item {
                                if s != "null" {
                                    selected = s.to_lowercase();
                                    break;
                                }
                            }
                        }
                        *type_val = Value::String(selected);
                    }
                    _ => {}
                }
            }
        }
        Value::Array(arr) => {
            for v in arr.iter_mut() {
                clean_recursive(v);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_constraints_move_into_description() {
        let mut schema = json!({
            "$schema": "http://json-schema.org/draft-07/schema#",
            "type": "object",
            "additionalProperties": false,
            "properties": {
                "location": {
                    "type": "string",
                    "description": "City name",
                    "minLength": 1,
                    "format": "city"
                },
                "unit": {
                    "type": ["string", "null"],
                    "default": "celsius"
                }
            },
            "required": ["location"]
        });

        clean_json_schema(&mut schema);

        assert!(schema.get("$schema").is_none());
        assert!(schema.get("additionalProperties").is_none());
        assert!(schema["properties"]["location"].get("minLength").is_none());
        assert!(schema["properties"]["location"].get("format").is_none());
        assert!(schema["properties"]["location"]["description"]
            .as_str()
            .unwrap()
            .contains("minLength: 1"));
        assert_eq!(schema["properties"]["unit"]["type"], "string");
        assert!(schema["properties"]["unit"].get("default").is_none());
    }

    #[test]
    fn test_property_named_pattern_survives() {
        let mut schema = json!({
            "type": "object",
            "properties": {
                "pattern": {
                    "type": "object",
                    "properties": {
                        "regex": { "type": "string", "pattern": "^[a-z]+$" }
                    }
                }
            }
        });

        clean_json_schema(&mut schema);

        assert!(schema["properties"].get("pattern").is_some());
        assert!(schema["properties"]["pattern"]["properties"]["regex"]
            .get("pattern")
            .is_none());
        assert!(
            schema["properties"]["pattern"]["properties"]["regex"]["description"]
                .as_str()
                .unwrap()
                .contains("pattern: ^[a-z]+$")
        );
    }

    #[test]
    fn test_ref_expansion() {
        let mut schema = json!({
            "$defs": {
                "Address": {
                    "type": "object",
                    "properties": {
                        "city": { "type": "string" }
                    }
                }
            },
            "properties": {
                "home": { "$ref": "#/$defs/Address" }
            }
        });

        clean_json_schema(&mut schema);

        assert_eq!(schema["properties"]["home"]["type"], "object");
        assert_eq!(
            schema["properties"]["home"]["properties"]["city"]["type"],
            "string"
        );
    }

    #[test]
    fn test_union_type_downgrade() {
        let mut s = json!({"type": ["integer", "null"]});
        clean_json_schema(&mut s);
        assert_eq!(s["type"], "integer");

        let mut s = json!({"type": ["STRING", "null"]});
        clean_json_schema(&mut s);
        assert_eq!(s["type"], "string");
    }

    #[test]
    fn test_types_lowercased() {
        let mut schema = json!({
            "type": "OBJECT",
            "properties": {
                "q": {"type": "STRING", "enumCaseInsensitive": true, "enumNormalizeWhitespace": true}
            }
        });

        clean_json_schema(&mut schema);

        assert_eq!(schema["type"], "object");
        assert_eq!(schema["properties"]["q"]["type"], "string");
        assert!(schema["properties"]["q"].get("enumCaseInsensitive").is_none());
        assert!(schema["properties"]["q"]
            .get("enumNormalizeWhitespace")
            .is_none());
    }
}
