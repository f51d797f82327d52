//! JSON schema normalisation: $ref inlining and simplification into the
//! small dialect providers accept.

use serde_json::{Map, Value as JsonValue};

use crate::schema::SchemaConf;

const MAX_RESOLVE_PASSES: usize = 100;

/// Root keys kept after normalisation, besides caller-supplied additions.
const ALLOWED_ROOT_KEYS: &[&str] = &[
    "description",
    "properties",
    "type",
    "required",
    "additionalProperties",
    "allOf",
    "anyOf",
    "oneOf",
    "not",
];

fn has_ref(value: &JsonValue) -> bool {
    match value {
        JsonValue::Object(map) => {
            map.contains_key("$ref") || map.values().any(has_ref)
        }
        JsonValue::Array(items) => items.iter().any(has_ref),
        _ => false,
    }
}

fn lookup_pointer<'a>(root: &'a JsonValue, segments: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = root;
    for seg in segments {
        cur = cur.get(seg)?;
    }
    Some(cur)
}

fn replace_refs(
    item: &JsonValue,
    root: &JsonValue,
    root_defs: &mut Vec<String>,
) -> JsonValue {
    match item {
        JsonValue::Array(items) => JsonValue::Array(
            items.iter().map(|i| replace_refs(i, root, root_defs)).collect(),
        ),
        JsonValue::Object(map) => {
            if map.len() == 1 {
                if let Some(JsonValue::String(reference)) = map.get("$ref") {
                    // "#/$defs/Name" -> ["$defs", "Name"]
                    let segments: Vec<&str> =
                        reference.trim_start_matches("#/").split('/').collect();
                    if let Some(first) = segments.first() {
                        if !root_defs.contains(&first.to_string()) {
                            root_defs.push(first.to_string());
                        }
                    }
                    if let Some(resolved) = lookup_pointer(root, &segments) {
                        return resolved.clone();
                    }
                    return item.clone();
                }
            }
            JsonValue::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), replace_refs(v, root, root_defs)))
                    .collect(),
            )
        }
        _ => item.clone(),
    }
}

/// Resolve and inline all $ref fragments, then drop the definition roots
/// they pointed into. Bounded passes keep recursive definitions from
/// looping forever.
pub fn resolve_refs(schema: &JsonValue, del_root_defs: bool) -> JsonValue {
    let mut schema = schema.clone();
    let mut root_defs: Vec<String> = Vec::new();

    for _ in 0..MAX_RESOLVE_PASSES {
        if !has_ref(&schema) {
            break;
        }
        let snapshot = schema.clone();
        schema = replace_refs(&snapshot, &snapshot, &mut root_defs);
    }

    if del_root_defs {
        if let JsonValue::Object(map) = &mut schema {
            for key in &root_defs {
                map.shift_remove(key);
            }
        }
    }
    schema
}

/// Synthesise a description from a title: mode 0 copies the title, mode 1
/// also capitalises the first letter and converts underscores to spaces.
fn synth_desc(mode: u8, title: &str) -> String {
    if mode == 0 {
        return title.to_string();
    }
    let spaced = title.replace('_', " ");
    let mut chars = spaced.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => spaced,
    }
}

/// Simplify a JSON schema as much as possible and remove non-essential keys.
/// Resolves $refs, eliminates definitions, removes titles, applies the
/// default-annotation and combine-collapse policies from SchemaConf.
pub fn massage(schema: &JsonValue, conf: &SchemaConf) -> JsonValue {
    let schema = if conf.resolve_refs {
        resolve_refs(schema, true)
    } else {
        schema.clone()
    };

    let empty = Map::new();
    let source = schema.as_object().unwrap_or(&empty);

    let mut root = Map::new();
    for (k, v) in source {
        if ALLOWED_ROOT_KEYS.contains(&k.as_str())
            || conf.additional_allowed_root_keys.iter().any(|a| a == k)
        {
            root.insert(k.clone(), v.clone());
        }
    }

    clean(&mut root, conf);
    JsonValue::Object(root)
}

fn strip_title(dic: &mut Map<String, JsonValue>, conf: &SchemaConf) {
    if let Some(title) = dic.shift_remove("title") {
        if conf.description_from_title > 0 && !dic.contains_key("description") {
            if let JsonValue::String(title) = title {
                dic.insert(
                    "description".to_string(),
                    JsonValue::String(synth_desc(conf.description_from_title - 1, &title)),
                );
            }
        }
    }
}

fn recurse_object_or_items(dic: &mut Map<String, JsonValue>, conf: &SchemaConf) {
    strip_title(dic, conf);
    clean(dic, conf);
}

fn clean(root: &mut Map<String, JsonValue>, conf: &SchemaConf) {
    if root.contains_key("properties") {
        let mut required_keys: Vec<JsonValue> = Vec::new();

        if let Some(JsonValue::Object(vars)) = root.get_mut("properties") {
            let keys: Vec<String> = vars.keys().cloned().collect();

            for k in keys {
                if conf.force_all_required {
                    required_keys.push(JsonValue::String(k.clone()));
                }

                let has_default =
                    matches!(vars.get(&k), Some(JsonValue::Object(p)) if p.contains_key("default"));

                if has_default && conf.remove_with_default {
                    vars.shift_remove(&k);
                    if conf.force_all_required {
                        required_keys.pop();
                    }
                    continue;
                }

                let Some(JsonValue::Object(prop)) = vars.get_mut(&k) else {
                    continue;
                };

                let mut default_to_last: Option<JsonValue> = None;
                if has_default && conf.default_to_last {
                    default_to_last = prop.shift_remove("default");
                }

                recurse_object_or_items(prop, conf);

                if let Some(default) = default_to_last {
                    prop.insert("default".to_string(), default);
                }
            }
        }

        if conf.force_all_required {
            root.insert("required".to_string(), JsonValue::Array(required_keys));
        }
    } else if let Some(JsonValue::Object(items)) = root.get_mut("items") {
        recurse_object_or_items(items, conf);
    }

    let which = ["allOf", "anyOf", "oneOf"]
        .into_iter()
        .find(|k| root.contains_key(*k));

    if let Some(which) = which {
        let single = matches!(root.get(which), Some(JsonValue::Array(a)) if a.len() == 1);

        if single && conf.collapse_single_combines {
            if let Some(JsonValue::Array(mut alts)) = root.shift_remove(which) {
                if let JsonValue::Object(inner) = alts.remove(0) {
                    for (k, v) in inner {
                        root.insert(k, v);
                    }
                }
            }
            recurse_object_or_items(root, conf);
        } else if let Some(JsonValue::Array(alts)) = root.get_mut(which) {
            for alt in alts {
                if let JsonValue::Object(dic) = alt {
                    recurse_object_or_items(dic, conf);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn default_conf() -> SchemaConf {
        SchemaConf::default()
    }

    #[test]
    fn test_resolve_refs_inlines_defs() {
        let schema = json!({
            "type": "object",
            "properties": {
                "pet": {"$ref": "#/$defs/Pet"}
            },
            "$defs": {
                "Pet": {"type": "string", "enum": ["dog", "cat"]}
            }
        });
        let resolved = resolve_refs(&schema, true);
        assert_eq!(resolved["properties"]["pet"]["enum"], json!(["dog", "cat"]));
        assert!(resolved.get("$defs").is_none());
        assert!(!has_ref(&resolved));
    }

    #[test]
    fn test_massage_removes_titles() {
        let schema = json!({
            "title": "Root",
            "type": "object",
            "properties": {
                "name": {"title": "Name", "type": "string"},
                "tags": {
                    "type": "array",
                    "items": {"title": "Tag", "type": "string"}
                }
            },
            "required": ["name"]
        });
        let out = massage(&schema, &default_conf());
        assert!(out.get("title").is_none());
        assert!(out["properties"]["name"].get("title").is_none());
        assert!(out["properties"]["tags"]["items"].get("title").is_none());
    }

    #[test]
    fn test_massage_description_from_title() {
        let mut conf = default_conf();
        conf.description_from_title = 2;
        let schema = json!({
            "type": "object",
            "properties": {
                "class_label": {"title": "class_label", "type": "string"}
            }
        });
        let out = massage(&schema, &conf);
        assert_eq!(
            out["properties"]["class_label"]["description"],
            json!("Class label")
        );
    }

    #[test]
    fn test_massage_collapses_single_one_of() {
        let schema = json!({
            "oneOf": [
                {
                    "type": "object",
                    "properties": {"a": {"type": "integer"}},
                    "required": ["a"]
                }
            ]
        });
        let out = massage(&schema, &default_conf());
        assert!(out.get("oneOf").is_none());
        assert_eq!(out["properties"]["a"]["type"], json!("integer"));
        assert_eq!(out["required"], json!(["a"]));
    }

    #[test]
    fn test_massage_default_to_last() {
        let schema = json!({
            "type": "object",
            "properties": {
                "a": {"default": 1, "type": "integer"}
            }
        });
        let out = massage(&schema, &default_conf());
        let keys: Vec<&String> = out["properties"]["a"].as_object().unwrap().keys().collect();
        assert_eq!(keys, ["type", "default"]);
    }

    #[test]
    fn test_massage_remove_with_default() {
        let mut conf = default_conf();
        conf.remove_with_default = true;
        let schema = json!({
            "type": "object",
            "properties": {
                "a": {"type": "integer", "default": 1},
                "b": {"type": "string"}
            }
        });
        let out = massage(&schema, &conf);
        assert!(out["properties"].get("a").is_none());
        assert!(out["properties"].get("b").is_some());
    }

    #[test]
    fn test_massage_force_all_required() {
        let mut conf = default_conf();
        conf.force_all_required = true;
        let schema = json!({
            "type": "object",
            "properties": {
                "a": {"type": "integer"},
                "b": {"type": "string"}
            }
        });
        let out = massage(&schema, &conf);
        assert_eq!(out["required"], json!(["a", "b"]));
    }

    #[test]
    fn test_massage_root_allowlist() {
        let schema = json!({
            "type": "object",
            "properties": {"a": {"type": "integer"}},
            "$schema": "https://json-schema.org/draft/2020-12/schema",
            "examples": [{"a": 1}]
        });
        let out = massage(&schema, &default_conf());
        assert!(out.get("$schema").is_none());
        assert!(out.get("examples").is_none());

        let mut conf = default_conf();
        conf.additional_allowed_root_keys = vec!["examples".to_string()];
        let out = massage(&schema, &conf);
        assert!(out.get("examples").is_some());
    }
}
