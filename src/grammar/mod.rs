//! JSON schema to GBNF grammar compilation for grammar-constrained local
//! decoding. The emitted grammar accepts exactly the JSON values valid under
//! the schema, modulo whitespace.

use serde_json::{Map, Value as JsonValue};

use crate::core::error::AugurError;

// whitespace is constrained to a single space char to prevent the model
// "running away" in whitespace
const SPACE_RULE: &str = "\" \"?";

fn primitive_rule(json_type: &str) -> Option<&'static str> {
    match json_type {
        "boolean" => Some("(\"true\" | \"false\") space"),
        "number" => {
            Some("(\"-\"? ([0-9] | [1-9] [0-9]*)) (\".\" [0-9]+)? ([eE] [-+]? [0-9]+)? space")
        }
        "integer" => Some("(\"-\"? ([0-9] | [1-9] [0-9]*)) space"),
        "string" => Some(
            r#" "\"" (
        [^"\\\x7F\x00-\x1F] |
        "\\" (["\\/bfnrt] | "u" [0-9a-fA-F] [0-9a-fA-F] [0-9a-fA-F] [0-9a-fA-F])
      )* "\"" space "#,
        ),
        "null" => Some("\"null\" space"),
        _ => None,
    }
}

struct SchemaConverter {
    /// Rules in insertion order; names are unique
    rules: Vec<(String, String)>,
    defs: Map<String, JsonValue>,
}

impl SchemaConverter {
    fn new() -> Self {
        SchemaConverter {
            rules: vec![("space".to_string(), SPACE_RULE.to_string())],
            defs: Map::new(),
        }
    }

    fn rule_of(&self, name: &str) -> Option<&str> {
        self.rules
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, r)| r.as_str())
    }

    /// Quote a JSON literal for use inside the grammar.
    fn format_literal(literal: &JsonValue) -> Result<String, AugurError> {
        let dumped = serde_json::to_string(literal)
            .map_err(|e| AugurError::Serialization(e.to_string()))?;
        let mut escaped = String::with_capacity(dumped.len());
        for c in dumped.chars() {
            match c {
                '\r' => escaped.push_str("\\r"),
                '\n' => escaped.push_str("\\n"),
                '"' => escaped.push_str("\\\""),
                other => escaped.push(other),
            }
        }
        Ok(format!("\"{}\"", escaped))
    }

    /// Register a rule under a path-derived name, sanitised of
    /// non-identifier characters and suffix-deduplicated on collision.
    fn add_rule(&mut self, name: &str, rule: String) -> String {
        let esc_name: String = name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' {
                    c
                } else {
                    '-'
                }
            })
            .collect();

        let key = match self.rule_of(&esc_name) {
            None => esc_name,
            Some(existing) if existing == rule => esc_name,
            Some(_) => {
                let mut i = 0;
                loop {
                    let candidate = format!("{}{}", esc_name, i);
                    if self.rule_of(&candidate).is_none() {
                        break candidate;
                    }
                    i += 1;
                }
            }
        };

        if self.rule_of(&key).is_none() {
            self.rules.push((key.clone(), rule));
        }
        key
    }

    fn child_name(name: &str, suffix: &str) -> String {
        if name.is_empty() {
            suffix.to_string()
        } else {
            format!("{}-{}", name, suffix)
        }
    }

    fn visit(&mut self, schema: &JsonValue, name: &str) -> Result<String, AugurError> {
        let rule_name = if name.is_empty() { "root" } else { name };

        if let Some(JsonValue::Object(defs)) = schema.get("$defs") {
            for (def_name, def_schema) in defs {
                self.defs.insert(def_name.clone(), def_schema.clone());
            }
        }

        if let Some(JsonValue::Array(alts)) =
            schema.get("oneOf").or_else(|| schema.get("anyOf"))
        {
            let alts = alts.clone();
            let mut parts = Vec::with_capacity(alts.len());
            for (i, alt) in alts.iter().enumerate() {
                parts.push(self.visit(alt, &Self::child_name(name, &i.to_string()))?);
            }
            return Ok(self.add_rule(rule_name, parts.join(" | ")));
        }

        if let Some(constant) = schema.get("const") {
            let rule = Self::format_literal(constant)?;
            return Ok(self.add_rule(rule_name, rule));
        }

        if let Some(JsonValue::Array(values)) = schema.get("enum") {
            let parts: Result<Vec<String>, AugurError> =
                values.iter().map(Self::format_literal).collect();
            return Ok(self.add_rule(rule_name, parts?.join(" | ")));
        }

        if let Some(JsonValue::String(reference)) = schema.get("$ref") {
            let def_name = reference.strip_prefix("#/$defs/").ok_or_else(|| {
                AugurError::Schema(format!("Unrecognized schema reference: {}", reference))
            })?;
            let def_schema = self.defs.get(def_name).cloned().ok_or_else(|| {
                AugurError::Schema(format!("Unresolved schema reference: {}", reference))
            })?;
            let child = Self::child_name(name, def_name);
            return self.visit(&def_schema, &child);
        }

        let schema_type = schema
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or_else(|| AugurError::Schema(format!("Unrecognized schema: {}", schema)))?;

        if schema_type == "object" && schema.get("properties").is_some() {
            let props = schema["properties"]
                .as_object()
                .cloned()
                .unwrap_or_default();

            let mut required: Vec<String> = schema
                .get("required")
                .and_then(|r| r.as_array())
                .map(|a| {
                    a.iter()
                        .filter_map(|v| v.as_str().map(|s| s.to_string()))
                        .collect()
                })
                .unwrap_or_default();
            let mut not_required: Vec<String> = props
                .keys()
                .filter(|k| !required.contains(k))
                .cloned()
                .collect();

            // a grammar cannot express an object whose every member is
            // optional without ambiguous comma placement
            if required.is_empty() {
                required = std::mem::take(&mut not_required);
            }

            let mut rule = String::from("\"{\" space");
            let mut index = 0;

            for (names, is_required) in [(&required, true), (&not_required, false)] {
                for prop_name in names {
                    let Some(prop_schema) = props.get(prop_name) else {
                        continue;
                    };
                    let prop_rule =
                        self.visit(prop_schema, &Self::child_name(name, prop_name))?;

                    if !is_required {
                        rule.push_str(" (");
                    }
                    if index > 0 {
                        rule.push_str(" \",\" space");
                    }
                    rule.push_str(&format!(
                        " {} space \":\" space {}",
                        Self::format_literal(&JsonValue::String(prop_name.clone()))?,
                        prop_rule
                    ));
                    if !is_required {
                        rule.push_str(" )?");
                    }
                    index += 1;
                }
            }

            rule.push_str(" \"}\" space");
            return Ok(self.add_rule(rule_name, rule));
        }

        if schema_type == "array" && schema.get("items").is_some() {
            let items = schema["items"].clone();
            let item_rule = self.visit(&items, &Self::child_name(name, "item"))?;
            let rule = format!(
                "\"[\" space ({} (\",\" space {})*)? \"]\" space",
                item_rule, item_rule
            );
            return Ok(self.add_rule(rule_name, rule));
        }

        let prim = primitive_rule(schema_type)
            .ok_or_else(|| AugurError::Schema(format!("Unrecognized schema: {}", schema)))?;
        let key = if rule_name == "root" {
            "root"
        } else {
            schema_type
        };
        Ok(self.add_rule(key, prim.to_string()))
    }

    fn format_grammar(&self) -> String {
        self.rules
            .iter()
            .map(|(name, rule)| format!("{} ::= {}", name, rule))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Compile a JSON schema into a GBNF grammar for constrained decoding.
pub fn gbnf_from_json_schema(schema: &JsonValue) -> Result<String, AugurError> {
    let mut converter = SchemaConverter::new();
    converter.visit(schema, "")?;
    Ok(converter.format_grammar())
}

/// Generic free-JSON GBNF grammar, used when JSON output is requested
/// without a schema. The string rule disallows raw newlines inside quotes.
pub const JSON_GBNF: &str = r#"
root   ::= object
value  ::= object | array | string | number | ("true" | "false" | "null") ws

object ::=
  "{" ws (
            string ":" ws value
    ("," ws string ":" ws value)*
  )? "}" ws

array  ::=
  "[" ws (
            value
    ("," ws value)*
  )? "]" ws

string ::=
  "\"" (
    [^"\\\x7F\x00-\x1F] |
    "\\" (["\\/bfnrt] | "u" [0-9a-fA-F] [0-9a-fA-F] [0-9a-fA-F] [0-9a-fA-F]) # escapes
  )* "\"" ws

number ::= ("-"? ([0-9] | [1-9] [0-9]*)) ("." [0-9]+)? ([eE] [-+]? [0-9]+)? ws

ws ::= ([ \t\n] ws)?
"#;
