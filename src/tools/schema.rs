//! Structural input schemas for tools.
//!
//! Schemas are a closed description of named parameters. They serialise to
//! the JSON-Schema subset MCP clients expect (`{"type":"object",...}`) and
//! validate call arguments before a handler ever sees them.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
    Array(Box<ParamType>),
    Object,
}

impl ParamType {
    pub fn array_of(item: ParamType) -> Self {
        ParamType::Array(Box::new(item))
    }

    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            ParamType::String => value.is_string(),
            ParamType::Integer => value.is_i64(),
            ParamType::Number => value.is_number(),
            ParamType::Boolean => value.is_boolean(),
            ParamType::Object => value.is_object(),
            ParamType::Array(item) => value
                .as_array()
                .is_some_and(|items| items.iter().all(|v| item.accepts(v))),
        }
    }

    fn to_schema(&self) -> Map<String, Value> {
        let mut schema = Map::new();
        let type_name = match self {
            ParamType::String => "string",
            ParamType::Integer => "integer",
            ParamType::Number => "number",
            ParamType::Boolean => "boolean",
            ParamType::Object => "object",
            ParamType::Array(item) => {
                schema.insert("items".into(), Value::Object(item.to_schema()));
                "array"
            }
        };
        schema.insert("type".into(), json!(type_name));
        schema
    }

    fn from_schema(schema: &Value) -> Result<Self, String> {
        match schema.get("type").and_then(Value::as_str) {
            Some("string") => Ok(ParamType::String),
            Some("integer") => Ok(ParamType::Integer),
            Some("number") => Ok(ParamType::Number),
            Some("boolean") => Ok(ParamType::Boolean),
            Some("object") => Ok(ParamType::Object),
            Some("array") => {
                let items = schema
                    .get("items")
                    .ok_or_else(|| "array parameter without 'items'".to_string())?;
                Ok(ParamType::array_of(ParamType::from_schema(items)?))
            }
            Some(other) => Err(format!("unsupported parameter type '{}'", other)),
            None => Err("parameter without 'type'".to_string()),
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamType::String => write!(f, "string"),
            ParamType::Integer => write!(f, "integer"),
            ParamType::Number => write!(f, "number"),
            ParamType::Boolean => write!(f, "boolean"),
            ParamType::Object => write!(f, "object"),
            ParamType::Array(item) => write!(f, "array of {}", item),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParamSpec {
    pub ty: ParamType,
    pub required: bool,
    pub description: Option<String>,
    pub default: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaViolation {
    #[error("missing required argument '{0}'")]
    MissingRequired(String),
    #[error("argument '{name}' must be {expected}, got {found}")]
    WrongType {
        name: String,
        expected: String,
        found: &'static str,
    },
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Named parameters of a tool.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(try_from = "SchemaDocument", into = "SchemaDocument")]
pub struct InputSchema {
    params: BTreeMap<String, ParamSpec>,
}

impl InputSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn required(self, name: &str, ty: ParamType, description: &str) -> Self {
        self.with_param(name, ty, true, description, None)
    }

    pub fn optional(self, name: &str, ty: ParamType, description: &str) -> Self {
        self.with_param(name, ty, false, description, None)
    }

    /// Optional parameter with a documented default.
    pub fn defaulted(self, name: &str, ty: ParamType, description: &str, default: Value) -> Self {
        self.with_param(name, ty, false, description, Some(default))
    }

    fn with_param(
        mut self,
        name: &str,
        ty: ParamType,
        required: bool,
        description: &str,
        default: Option<Value>,
    ) -> Self {
        self.params.insert(
            name.to_string(),
            ParamSpec {
                ty,
                required,
                description: Some(description.to_string()),
                default,
            },
        );
        self
    }

    pub fn param(&self, name: &str) -> Option<&ParamSpec> {
        self.params.get(name)
    }

    pub fn params(&self) -> impl Iterator<Item = (&str, &ParamSpec)> {
        self.params.iter().map(|(name, spec)| (name.as_str(), spec))
    }

    pub fn required_names(&self) -> Vec<&str> {
        self.params()
            .filter(|(_, spec)| spec.required)
            .map(|(name, _)| name)
            .collect()
    }

    /// Checks `args` structurally. A `null` value counts as absent; unknown
    /// keys are accepted and left to the handler to ignore.
    pub fn validate(&self, args: &Map<String, Value>) -> Result<(), SchemaViolation> {
        for (name, spec) in &self.params {
            match args.get(name) {
                None | Some(Value::Null) => {
                    if spec.required {
                        return Err(SchemaViolation::MissingRequired(name.clone()));
                    }
                }
                Some(value) if !spec.ty.accepts(value) => {
                    return Err(SchemaViolation::WrongType {
                        name: name.clone(),
                        expected: spec.ty.to_string(),
                        found: json_kind(value),
                    });
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// The schema as a plain JSON-Schema object.
    pub fn to_json(&self) -> Value {
        Value::Object(SchemaDocument::from(self.clone()).into_map())
    }
}

/// Wire form of [`InputSchema`].
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SchemaDocument {
    #[serde(rename = "type")]
    schema_type: String,
    #[serde(default)]
    properties: Map<String, Value>,
    #[serde(default)]
    required: Vec<String>,
}

impl SchemaDocument {
    fn into_map(self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("type".into(), json!(self.schema_type));
        map.insert("properties".into(), Value::Object(self.properties));
        map.insert("required".into(), json!(self.required));
        map
    }
}

impl From<InputSchema> for SchemaDocument {
    fn from(schema: InputSchema) -> Self {
        let mut properties = Map::new();
        let mut required = Vec::new();
        for (name, spec) in schema.params {
            let mut property = spec.ty.to_schema();
            if let Some(description) = spec.description {
                property.insert("description".into(), json!(description));
            }
            if let Some(default) = spec.default {
                property.insert("default".into(), default);
            }
            if spec.required {
                required.push(name.clone());
            }
            properties.insert(name, Value::Object(property));
        }
        SchemaDocument {
            schema_type: "object".to_string(),
            properties,
            required,
        }
    }
}

impl TryFrom<SchemaDocument> for InputSchema {
    type Error = String;

    fn try_from(doc: SchemaDocument) -> Result<Self, Self::Error> {
        if doc.schema_type != "object" {
            return Err(format!(
                "input schema must have type 'object', got '{}'",
                doc.schema_type
            ));
        }
        let mut params = BTreeMap::new();
        for (name, property) in &doc.properties {
            let ty = ParamType::from_schema(property).map_err(|e| format!("{}: {}", name, e))?;
            params.insert(
                name.clone(),
                ParamSpec {
                    ty,
                    required: doc.required.contains(name),
                    description: property
                        .get("description")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    default: property.get("default").cloned(),
                },
            );
        }
        if let Some(unknown) = doc.required.iter().find(|r| !params.contains_key(*r)) {
            return Err(format!("required parameter '{}' is not declared", unknown));
        }
        Ok(InputSchema { params })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> InputSchema {
        InputSchema::new()
            .required("min_players", ParamType::Integer, "Minimum players")
            .optional("name", ParamType::String, "Name filter")
            .optional("ids", ParamType::array_of(ParamType::Integer), "Game ids")
            .defaulted("limit", ParamType::Integer, "Max results", json!(10))
    }

    fn args(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_validate_accepts_well_typed_args() {
        let schema = schema();
        assert!(schema.validate(&args(json!({"min_players": 2}))).is_ok());
        assert!(
            schema
                .validate(&args(json!({"min_players": 2, "ids": [1, 2], "extra": true})))
                .is_ok()
        );
        assert!(schema.validate(&args(json!({"min_players": 2, "name": null}))).is_ok());
    }

    #[test]
    fn test_validate_reports_missing_required() {
        let err = schema().validate(&args(json!({"name": "Catan"}))).unwrap_err();
        assert_eq!(err, SchemaViolation::MissingRequired("min_players".into()));

        let err = schema().validate(&args(json!({"min_players": null}))).unwrap_err();
        assert_eq!(err, SchemaViolation::MissingRequired("min_players".into()));
    }

    #[test]
    fn test_validate_reports_wrong_type() {
        let err = schema().validate(&args(json!({"min_players": "two"}))).unwrap_err();
        assert_eq!(
            err,
            SchemaViolation::WrongType {
                name: "min_players".into(),
                expected: "integer".into(),
                found: "string",
            }
        );

        let err = schema()
            .validate(&args(json!({"min_players": 2, "ids": [1, "x"]})))
            .unwrap_err();
        assert!(err.to_string().contains("array of integer"));

        let err = schema().validate(&args(json!({"min_players": 2.5}))).unwrap_err();
        assert!(matches!(err, SchemaViolation::WrongType { found: "number", .. }));

        let err = schema().validate(&args(json!({"min_players": u64::MAX}))).unwrap_err();
        assert!(matches!(err, SchemaViolation::WrongType { found: "number", .. }));
    }

    #[test]
    fn test_serializes_as_json_schema() {
        let value = serde_json::to_value(schema()).unwrap();
        assert_eq!(value["type"], "object");
        assert_eq!(value["required"], json!(["min_players"]));
        assert_eq!(value["properties"]["ids"]["type"], "array");
        assert_eq!(value["properties"]["ids"]["items"]["type"], "integer");
        assert_eq!(value["properties"]["limit"]["default"], 10);
        assert_eq!(value, schema().to_json());
    }

    #[test]
    fn test_deserializes_from_json_schema() {
        let parsed: InputSchema = serde_json::from_value(serde_json::to_value(schema()).unwrap()).unwrap();
        assert_eq!(parsed, schema());
    }

    #[test]
    fn test_rejects_undeclared_required_param() {
        let doc = json!({"type": "object", "properties": {}, "required": ["ghost"]});
        assert!(serde_json::from_value::<InputSchema>(doc).is_err());

        let doc = json!({"type": "array"});
        assert!(serde_json::from_value::<InputSchema>(doc).is_err());
    }
}
