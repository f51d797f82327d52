//! Target-to-schema compiler: translate a target type description into a
//! normalised JSON schema plus the instantiation plan used to rehydrate the
//! validated JSON into a native value.

mod normalize;

pub use normalize::{massage, resolve_refs};

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};
use serde_json::{Map, Value as JsonValue};

use crate::core::error::AugurError;

/// Configuration for JSON schema massaging and instantiation.
#[derive(Debug, Clone)]
pub struct SchemaConf {
    /// Set for $ref references to be resolved and replaced with the actual
    /// definition
    pub resolve_refs: bool,

    /// Any single-valued "oneOf"/"anyOf" is replaced with the actual value
    pub collapse_single_combines: bool,

    /// If a value doesn't have a description entry, make one from its title.
    /// 0: don't, 1: copy title, 2: copy + capitalize and convert _ to space
    pub description_from_title: u8,

    /// Force all entries in an object to be required (except removed
    /// defaults if remove_with_default is set)
    pub force_all_required: bool,

    /// Delete any values that have a "default" annotation
    pub remove_with_default: bool,

    /// Move any default value entry into the last position of its object
    pub default_to_last: bool,

    /// Extra keys allowed in the schema root besides the provider-recognised
    /// set
    pub additional_allowed_root_keys: Vec<String>,

    /// Property name used when a non-record target needs a wrapping object
    pub output_key_name: String,
}

impl Default for SchemaConf {
    fn default() -> Self {
        SchemaConf {
            resolve_refs: true,
            collapse_single_combines: true,
            description_from_title: 0,
            force_all_required: false,
            remove_with_default: false,
            default_to_last: true,
            additional_allowed_root_keys: Vec::new(),
            output_key_name: "output".to_string(),
        }
    }
}

/// A target type description: constrains what the model may output and types
/// the value handed back to the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    Bool,
    Int,
    Float,
    Str,
    /// ISO 8601 calendar date
    Date,
    /// ISO 8601 time of day
    Time,
    /// ISO 8601 date and time
    DateTime,
    /// A finite set of same-typed primitive values
    Enum(Vec<JsonValue>),
    /// A list of any accepted element type
    List(Box<Target>),
    /// A record with typed fields
    Record(RecordSpec),
    /// Any target annotated with a description
    Described(String, Box<Target>),
}

impl Target {
    /// Enumeration of string labels.
    pub fn enum_str(values: &[&str]) -> Target {
        Target::Enum(values.iter().map(|v| JsonValue::from(*v)).collect())
    }

    pub fn list_of(elem: Target) -> Target {
        Target::List(Box::new(elem))
    }

    /// Attach a description to this target.
    pub fn described(self, desc: impl Into<String>) -> Target {
        Target::Described(desc.into(), Box::new(self))
    }

    /// The target with any description annotations peeled off.
    pub fn base(&self) -> &Target {
        match self {
            Target::Described(_, inner) => inner.base(),
            other => other,
        }
    }

    pub fn is_record(&self) -> bool {
        matches!(self.base(), Target::Record(_))
    }
}

/// A record target: named, optionally described, with ordered typed fields.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordSpec {
    pub name: String,
    pub desc: Option<String>,
    pub fields: Vec<FieldSpec>,
}

impl RecordSpec {
    pub fn new(name: impl Into<String>) -> Self {
        RecordSpec {
            name: name.into(),
            desc: None,
            fields: Vec::new(),
        }
    }

    pub fn describe(mut self, desc: impl Into<String>) -> Self {
        self.desc = Some(desc.into());
        self
    }

    /// Add a required field.
    pub fn field(mut self, name: impl Into<String>, target: Target) -> Self {
        self.fields.push(FieldSpec::new(name, target));
        self
    }

    /// Add a fully-specified field.
    pub fn push(mut self, field: FieldSpec) -> Self {
        self.fields.push(field);
        self
    }

    pub fn into_target(self) -> Target {
        Target::Record(self)
    }
}

/// A single record field: target type, required flag, optional default and
/// description.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    pub name: String,
    pub target: Target,
    pub required: bool,
    pub default: Option<JsonValue>,
    pub desc: Option<String>,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, target: Target) -> Self {
        FieldSpec {
            name: name.into(),
            target,
            required: true,
            default: None,
            desc: None,
        }
    }

    pub fn describe(mut self, desc: impl Into<String>) -> Self {
        self.desc = Some(desc.into());
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    /// Set a default value; the field becomes non-required.
    pub fn with_default(mut self, default: JsonValue) -> Self {
        self.default = Some(default);
        self.required = false;
        self
    }
}

/// Instantiation plan captured during schema compilation: the final target
/// and whether the compiler synthesised a wrapping object with a single
/// known key.
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub target: Target,
    /// Set to the wrapping property name when the root object was synthesised
    pub output_key: Option<String>,
}

/// Compile a target into a normalised JSON schema plus its instantiation
/// plan. Non-record targets are wrapped under a synthetic object with a
/// single property named by SchemaConf::output_key_name.
pub fn compile(target: &Target, conf: &SchemaConf) -> Result<(JsonValue, Plan), AugurError> {
    let inner = build_schema(target)?;

    let (schema, output_key) = if target.is_record() {
        (inner, None)
    } else {
        let mut props = Map::new();
        props.insert(conf.output_key_name.clone(), inner);

        let mut root = Map::new();
        root.insert("properties".to_string(), JsonValue::Object(props));
        root.insert(
            "required".to_string(),
            JsonValue::Array(vec![JsonValue::String(conf.output_key_name.clone())]),
        );
        root.insert("type".to_string(), JsonValue::String("object".to_string()));
        (JsonValue::Object(root), Some(conf.output_key_name.clone()))
    };

    let schema = massage(&schema, conf);

    Ok((
        schema,
        Plan {
            target: target.clone(),
            output_key,
        },
    ))
}

/// JSON type name for a primitive enum member value.
fn json_type_of(value: &JsonValue) -> Result<&'static str, AugurError> {
    match value {
        JsonValue::Bool(_) => Ok("boolean"),
        JsonValue::Number(n) if n.is_i64() || n.is_u64() => Ok("integer"),
        JsonValue::Number(_) => Ok("number"),
        JsonValue::String(_) => Ok("string"),
        other => Err(AugurError::SchemaCompile(format!(
            "Enum values must be primitives, found '{}'",
            other
        ))),
    }
}

/// Render a JSON schema fragment for a target. Records become objects with
/// properties in field order and a required list; everything else maps to
/// the matching primitive/array/enum schema.
fn build_schema(target: &Target) -> Result<JsonValue, AugurError> {
    let out = match target {
        Target::Bool => prim_schema("boolean", None),
        Target::Int => prim_schema("integer", None),
        Target::Float => prim_schema("number", None),
        Target::Str => prim_schema("string", None),
        Target::Date => prim_schema("string", Some("date")),
        Target::Time => prim_schema("string", Some("time")),
        Target::DateTime => prim_schema("string", Some("date-time")),

        Target::Enum(values) => {
            if values.is_empty() {
                return Err(AugurError::SchemaCompile(
                    "Enum target must have at least one value".to_string(),
                ));
            }
            let first = json_type_of(&values[0])?;
            for v in values {
                if json_type_of(v)? != first {
                    return Err(AugurError::SchemaCompile(format!(
                        "All enum values must have the same type in '{}'",
                        JsonValue::Array(values.clone())
                    )));
                }
            }
            let mut out = Map::new();
            out.insert("enum".to_string(), JsonValue::Array(values.clone()));
            out.insert("type".to_string(), JsonValue::String(first.to_string()));
            JsonValue::Object(out)
        }

        Target::List(elem) => {
            let mut out = Map::new();
            out.insert("items".to_string(), build_schema(elem)?);
            out.insert("type".to_string(), JsonValue::String("array".to_string()));
            JsonValue::Object(out)
        }

        Target::Record(spec) => {
            let mut props = Map::new();
            let mut required = Vec::new();
            for field in &spec.fields {
                let mut fs = build_schema(&field.target)?;
                if let JsonValue::Object(map) = &mut fs {
                    if let Some(desc) = &field.desc {
                        if !map.contains_key("description") {
                            insert_first(map, "description", JsonValue::String(desc.clone()));
                        }
                    }
                    if let Some(default) = &field.default {
                        map.insert("default".to_string(), default.clone());
                    }
                }
                props.insert(field.name.clone(), fs);
                if field.required {
                    required.push(JsonValue::String(field.name.clone()));
                }
            }

            let mut out = Map::new();
            if let Some(desc) = &spec.desc {
                out.insert("description".to_string(), JsonValue::String(desc.clone()));
            }
            out.insert("properties".to_string(), JsonValue::Object(props));
            out.insert("required".to_string(), JsonValue::Array(required));
            out.insert("type".to_string(), JsonValue::String("object".to_string()));
            JsonValue::Object(out)
        }

        Target::Described(desc, inner) => {
            let mut out = build_schema(inner)?;
            if let JsonValue::Object(map) = &mut out {
                insert_first(map, "description", JsonValue::String(desc.clone()));
            }
            out
        }
    };
    Ok(out)
}

fn prim_schema(json_type: &str, format: Option<&str>) -> JsonValue {
    let mut out = Map::new();
    if let Some(format) = format {
        out.insert("format".to_string(), JsonValue::String(format.to_string()));
    }
    out.insert("type".to_string(), JsonValue::String(json_type.to_string()));
    JsonValue::Object(out)
}

fn insert_first(map: &mut Map<String, JsonValue>, key: &str, value: JsonValue) {
    let mut out = Map::new();
    out.insert(key.to_string(), value);
    for (k, v) in std::mem::take(map) {
        if k != key {
            out.insert(k, v);
        }
    }
    *map = out;
}

// ============================================ instantiation

/// A native value instantiated from validated JSON output.
#[derive(Debug, Clone, PartialEq)]
pub enum TargetValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Date(NaiveDate),
    Time(NaiveTime),
    DateTime(NaiveDateTime),
    List(Vec<TargetValue>),
    Record(RecordValue),
}

/// An instantiated record: field values in declaration order.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordValue {
    pub name: String,
    fields: Vec<(String, TargetValue)>,
}

impl RecordValue {
    pub fn get(&self, name: &str) -> Option<&TargetValue> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &TargetValue)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl TargetValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            TargetValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            TargetValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            TargetValue::Float(f) => Some(*f),
            TargetValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            TargetValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[TargetValue]> {
        match self {
            TargetValue::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_record(&self) -> Option<&RecordValue> {
        match self {
            TargetValue::Record(r) => Some(r),
            _ => None,
        }
    }
}

impl std::fmt::Display for TargetValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetValue::Bool(b) => write!(f, "{}", b),
            TargetValue::Int(i) => write!(f, "{}", i),
            TargetValue::Float(x) => write!(f, "{}", x),
            TargetValue::Str(s) => write!(f, "{:?}", s),
            TargetValue::Date(d) => write!(f, "{}", d),
            TargetValue::Time(t) => write!(f, "{}", t),
            TargetValue::DateTime(dt) => write!(f, "{}", dt),
            TargetValue::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            TargetValue::Record(rec) => {
                write!(f, "{}(", rec.name)?;
                for (i, (name, value)) in rec.fields().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}={}", name, value)?;
                }
                write!(f, ")")
            }
        }
    }
}

/// Rehydrate a validated JSON value into a native value per the plan:
/// unwrap the synthetic key if set, then coerce recursively.
pub fn instantiate(plan: &Plan, dic: &JsonValue) -> Result<TargetValue, AugurError> {
    let val = match &plan.output_key {
        Some(key) => dic.get(key).ok_or_else(|| {
            AugurError::SchemaValue(format!("Expecting key '{}'", key))
        })?,
        None => dic,
    };
    build_value(&plan.target, val)
}

fn build_value(target: &Target, val: &JsonValue) -> Result<TargetValue, AugurError> {
    match target {
        Target::Described(_, inner) => build_value(inner, val),

        Target::Bool => val
            .as_bool()
            .map(TargetValue::Bool)
            .ok_or_else(|| coerce_err("bool", val)),

        Target::Int => val
            .as_i64()
            .map(TargetValue::Int)
            .ok_or_else(|| coerce_err("integer", val)),

        Target::Float => val
            .as_f64()
            .map(TargetValue::Float)
            .ok_or_else(|| coerce_err("float", val)),

        Target::Str => val
            .as_str()
            .map(|s| TargetValue::Str(s.to_string()))
            .ok_or_else(|| coerce_err("string", val)),

        Target::Date => {
            let s = val.as_str().ok_or_else(|| coerce_err("date", val))?;
            s.parse::<NaiveDate>()
                .map(TargetValue::Date)
                .map_err(|e| AugurError::SchemaValue(format!("Invalid date '{}': {}", s, e)))
        }

        Target::Time => {
            let s = val.as_str().ok_or_else(|| coerce_err("time", val))?;
            s.parse::<NaiveTime>()
                .map(TargetValue::Time)
                .map_err(|e| AugurError::SchemaValue(format!("Invalid time '{}': {}", s, e)))
        }

        Target::DateTime => {
            let s = val.as_str().ok_or_else(|| coerce_err("datetime", val))?;
            s.parse::<NaiveDateTime>()
                .map(TargetValue::DateTime)
                .or_else(|_| {
                    DateTime::parse_from_rfc3339(s)
                        .map(|dt| TargetValue::DateTime(dt.naive_utc()))
                })
                .map_err(|e| {
                    AugurError::SchemaValue(format!("Invalid datetime '{}': {}", s, e))
                })
        }

        Target::Enum(values) => {
            let member = values.iter().find(|m| *m == val).ok_or_else(|| {
                AugurError::SchemaValue(format!(
                    "Value '{}' is not a member of enum '{}'",
                    val,
                    JsonValue::Array(values.clone())
                ))
            })?;
            match member {
                JsonValue::Bool(b) => Ok(TargetValue::Bool(*b)),
                JsonValue::Number(n) => {
                    if let Some(i) = n.as_i64() {
                        Ok(TargetValue::Int(i))
                    } else if let Some(f) = n.as_f64() {
                        Ok(TargetValue::Float(f))
                    } else {
                        Err(coerce_err("enum member", member))
                    }
                }
                JsonValue::String(s) => Ok(TargetValue::Str(s.clone())),
                other => Err(coerce_err("enum member", other)),
            }
        }

        Target::List(elem) => {
            let items = val.as_array().ok_or_else(|| coerce_err("list", val))?;
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(build_value(elem, item)?);
            }
            Ok(TargetValue::List(out))
        }

        Target::Record(spec) => {
            let obj = val.as_object().ok_or_else(|| coerce_err("record", val))?;
            let mut fields = Vec::with_capacity(spec.fields.len());
            for field in &spec.fields {
                match obj.get(&field.name) {
                    Some(fv) => fields.push((field.name.clone(), build_value(&field.target, fv)?)),
                    None => {
                        if let Some(default) = &field.default {
                            fields
                                .push((field.name.clone(), build_value(&field.target, default)?));
                        } else if field.required {
                            return Err(AugurError::SchemaValue(format!(
                                "Missing required field '{}' for record '{}'",
                                field.name, spec.name
                            )));
                        }
                    }
                }
            }
            Ok(TargetValue::Record(RecordValue {
                name: spec.name.clone(),
                fields,
            }))
        }
    }
}

fn coerce_err(expected: &str, val: &JsonValue) -> AugurError {
    AugurError::SchemaValue(format!("Expected {} value, found '{}'", expected, val))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn conf() -> SchemaConf {
        SchemaConf::default()
    }

    #[test]
    fn test_primitive_wraps() {
        let (schema, plan) = compile(&Target::Bool, &conf()).unwrap();
        assert_eq!(plan.output_key.as_deref(), Some("output"));
        assert_eq!(schema["properties"]["output"]["type"], json!("boolean"));
        assert_eq!(schema["required"], json!(["output"]));
        assert_eq!(schema["properties"].as_object().unwrap().len(), 1);
    }

    #[test]
    fn test_record_does_not_wrap() {
        let spec = RecordSpec::new("Person")
            .field("name", Target::Str)
            .field("age", Target::Int);
        let (schema, plan) = compile(&spec.into_target(), &conf()).unwrap();
        assert!(plan.output_key.is_none());
        assert_eq!(schema["properties"]["name"]["type"], json!("string"));
        assert_eq!(schema["required"], json!(["name", "age"]));
    }

    #[test]
    fn test_list_of_int() {
        let target = Target::list_of(Target::Int);
        let (schema, plan) = compile(&target, &conf()).unwrap();
        assert_eq!(plan.output_key.as_deref(), Some("output"));
        assert_eq!(
            schema["properties"]["output"]["items"]["type"],
            json!("integer")
        );

        // scenario: "21 years and ten ponies. Five elephants?"
        let value = instantiate(&plan, &json!({"output": [21, 10, 5]})).unwrap();
        assert_eq!(
            value,
            TargetValue::List(vec![
                TargetValue::Int(21),
                TargetValue::Int(10),
                TargetValue::Int(5)
            ])
        );
    }

    #[test]
    fn test_bool_instantiation() {
        let (_, plan) = compile(&Target::Bool, &conf()).unwrap();
        let value = instantiate(&plan, &json!({"output": true})).unwrap();
        assert_eq!(value, TargetValue::Bool(true));
    }

    #[test]
    fn test_enum_target() {
        let target = Target::enum_str(&["dog", "horse", "car", "bus"]);
        let (schema, plan) = compile(&target, &conf()).unwrap();
        assert_eq!(
            schema["properties"]["output"]["enum"],
            json!(["dog", "horse", "car", "bus"])
        );
        let value = instantiate(&plan, &json!({"output": "bus"})).unwrap();
        assert_eq!(value, TargetValue::Str("bus".to_string()));

        let err = instantiate(&plan, &json!({"output": "plane"}));
        assert!(matches!(err, Err(AugurError::SchemaValue(_))));
    }

    #[test]
    fn test_enum_mixed_types_fail() {
        let target = Target::Enum(vec![json!("a"), json!(1)]);
        assert!(matches!(
            compile(&target, &conf()),
            Err(AugurError::SchemaCompile(_))
        ));

        // int and float don't mix either
        let target = Target::Enum(vec![json!(1), json!(2.5)]);
        assert!(matches!(
            compile(&target, &conf()),
            Err(AugurError::SchemaCompile(_))
        ));
    }

    #[test]
    fn test_record_instantiation() {
        let spec = RecordSpec::new("Person")
            .field("name", Target::Str)
            .field("age", Target::Int);
        let (_, plan) = compile(&spec.into_target(), &conf()).unwrap();
        let value = instantiate(&plan, &json!({"name": "Jane", "age": 99})).unwrap();
        let rec = value.as_record().unwrap();
        assert_eq!(rec.get("name").unwrap().as_str(), Some("Jane"));
        assert_eq!(rec.get("age").unwrap().as_i64(), Some(99));
    }

    #[test]
    fn test_record_missing_required() {
        let spec = RecordSpec::new("Person").field("name", Target::Str);
        let (_, plan) = compile(&spec.into_target(), &conf()).unwrap();
        assert!(matches!(
            instantiate(&plan, &json!({})),
            Err(AugurError::SchemaValue(_))
        ));
    }

    #[test]
    fn test_record_default_fills_missing() {
        let spec = RecordSpec::new("Person")
            .field("name", Target::Str)
            .push(FieldSpec::new("age", Target::Int).with_default(json!(30)));
        let (_, plan) = compile(&spec.into_target(), &conf()).unwrap();
        let value = instantiate(&plan, &json!({"name": "Jo"})).unwrap();
        assert_eq!(
            value.as_record().unwrap().get("age").unwrap().as_i64(),
            Some(30)
        );
    }

    #[test]
    fn test_field_descriptions_and_defaults_in_schema() {
        let spec = RecordSpec::new("Person")
            .push(FieldSpec::new("name", Target::Str).describe("Full name"))
            .push(FieldSpec::new("age", Target::Int).with_default(json!(25)));
        let (schema, _) = compile(&spec.into_target(), &conf()).unwrap();
        assert_eq!(
            schema["properties"]["name"]["description"],
            json!("Full name")
        );
        // default annotation kept, moved to last position
        let age = schema["properties"]["age"].as_object().unwrap();
        assert_eq!(age.keys().last().unwrap(), "default");
        assert_eq!(schema["required"], json!(["name"]));
    }

    #[test]
    fn test_temporal_targets() {
        let (schema, plan) = compile(&Target::Date, &conf()).unwrap();
        assert_eq!(schema["properties"]["output"]["format"], json!("date"));
        let value = instantiate(&plan, &json!({"output": "2024-03-01"})).unwrap();
        assert_eq!(
            value,
            TargetValue::Date(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap())
        );

        let (_, plan) = compile(&Target::DateTime, &conf()).unwrap();
        let value = instantiate(&plan, &json!({"output": "2024-03-01T10:30:00"})).unwrap();
        assert!(matches!(value, TargetValue::DateTime(_)));

        let bad = instantiate(&plan, &json!({"output": "not a date"}));
        assert!(matches!(bad, Err(AugurError::SchemaValue(_))));
    }

    #[test]
    fn test_no_title_no_ref_in_compiled_schema() {
        let spec = RecordSpec::new("Meeting")
            .field("attendees", Target::list_of(Target::Str))
            .field(
                "priority",
                Target::enum_str(&["low", "high"]).described("Meeting priority"),
            );
        let (schema, _) = compile(&spec.into_target(), &conf()).unwrap();
        let text = schema.to_string();
        assert!(!text.contains("$ref"));
        assert!(!text.contains("\"title\""));
    }

    #[test]
    fn test_described_target() {
        let target = Target::Int.described("How many units?");
        let (schema, _) = compile(&target, &conf()).unwrap();
        assert_eq!(
            schema["properties"]["output"]["description"],
            json!("How many units?")
        );
    }

    #[test]
    fn test_missing_output_key() {
        let (_, plan) = compile(&Target::Int, &conf()).unwrap();
        let err = instantiate(&plan, &json!({"result": 1}));
        assert!(matches!(err, Err(AugurError::SchemaValue(_))));
    }
}
