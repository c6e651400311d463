use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::TemplateError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterType {
    String,
    Integer,
    Float,
    Boolean,
    Array,
    Object,
    File,
}

impl ParameterType {
    pub fn as_str(self) -> &'static str {
        match self {
            ParameterType::String => "string",
            ParameterType::Integer => "integer",
            ParameterType::Float => "float",
            ParameterType::Boolean => "boolean",
            ParameterType::Array => "array",
            ParameterType::Object => "object",
            ParameterType::File => "file",
        }
    }
}

/// One declared input. Constraint fields are flat, matching the on-disk
/// template shape; which ones apply depends on `type` and is enforced by the
/// validation pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputSpec {
    #[serde(rename = "type")]
    pub param_type: ParameterType,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default, rename = "enum", skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_items: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_items: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multiple_of: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputSpec {
    #[serde(rename = "type")]
    pub param_type: ParameterType,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InterfaceSpec {
    #[serde(default)]
    pub inputs: BTreeMap<String, InputSpec>,
    #[serde(default)]
    pub outputs: BTreeMap<String, OutputSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSpec {
    #[serde(default)]
    pub gpu: bool,
    #[serde(default)]
    pub vram_gb: f64,
    #[serde(default = "default_cpu_cores")]
    pub cpu_cores: f64,
    #[serde(default = "default_memory_gb")]
    pub memory_gb: f64,
    #[serde(default = "default_disk_gb")]
    pub disk_gb: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_time_seconds: Option<f64>,
}

fn default_cpu_cores() -> f64 {
    1.0
}
fn default_memory_gb() -> f64 {
    2.0
}
fn default_disk_gb() -> f64 {
    10.0
}

impl Default for ResourceSpec {
    fn default() -> Self {
        Self {
            gpu: false,
            vram_gb: 0.0,
            cpu_cores: default_cpu_cores(),
            memory_gb: default_memory_gb(),
            disk_gb: default_disk_gb(),
            estimated_time_seconds: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRequirement {
    pub name: String,
    #[serde(rename = "type")]
    pub model_type: String,
    pub size_gb: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequirementsSpec {
    #[serde(default)]
    pub resources: ResourceSpec,
    #[serde(default)]
    pub models: Vec<ModelRequirement>,
    #[serde(default)]
    pub quality_presets: BTreeMap<String, Map<String, Value>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExampleSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub inputs: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_output: Option<Map<String, Value>>,
}

/// The body of a template file. Identity is `(id, version)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateBody {
    pub id: String,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extends: Option<String>,
    pub interface: InterfaceSpec,
    pub requirements: RequirementsSpec,
    #[serde(default)]
    pub examples: Vec<ExampleSpec>,
}

fn default_category() -> String {
    "general".to_string()
}

/// Top-level file shape: everything nests under a `template` key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateDocument {
    pub template: TemplateBody,
}

/// A validated, registered template.
#[derive(Debug, Clone)]
pub struct Template {
    pub body: TemplateBody,
    pub loaded_at: DateTime<Utc>,
}

impl Template {
    pub fn new(body: TemplateBody) -> Self {
        Self {
            body,
            loaded_at: Utc::now(),
        }
    }

    pub fn key(&self) -> String {
        template_key(&self.body.id, &self.body.version)
    }

    pub fn id(&self) -> &str {
        &self.body.id
    }

    pub fn version(&self) -> &str {
        &self.body.version
    }

    pub fn category(&self) -> &str {
        &self.body.category
    }

    /// Validate user inputs against the declared interface. Declared inputs
    /// are type- and constraint-checked and defaults filled in; undeclared
    /// keys pass through untouched (they are opaque worker parameters).
    pub fn validate_inputs(&self, inputs: &Value) -> Result<Value, TemplateError> {
        let supplied = match inputs {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            _ => {
                return Err(TemplateError::InputValidation {
                    field: String::new(),
                    message: "inputs must be an object".to_string(),
                })
            }
        };

        let mut out = supplied.clone();
        for (name, spec) in &self.body.interface.inputs {
            match supplied.get(name) {
                Some(value) => check_value(name, value, spec)?,
                None => {
                    if let Some(default) = &spec.default {
                        out.insert(name.clone(), default.clone());
                    } else if spec.required {
                        return Err(TemplateError::InputValidation {
                            field: name.clone(),
                            message: format!("missing required input '{name}'"),
                        });
                    }
                }
            }
        }

        Ok(Value::Object(out))
    }
}

fn check_value(name: &str, value: &Value, spec: &InputSpec) -> Result<(), TemplateError> {
    let fail = |message: String| TemplateError::InputValidation {
        field: name.to_string(),
        message,
    };

    let type_ok = match spec.param_type {
        ParameterType::String | ParameterType::File => value.is_string(),
        ParameterType::Integer => value.is_i64() || value.is_u64(),
        ParameterType::Float => value.is_number(),
        ParameterType::Boolean => value.is_boolean(),
        ParameterType::Array => value.is_array(),
        ParameterType::Object => value.is_object(),
    };
    if !type_ok {
        return Err(fail(format!(
            "expected {} for '{name}'",
            spec.param_type.as_str()
        )));
    }

    if let Some(enum_values) = &spec.enum_values {
        if !enum_values.contains(value) {
            return Err(fail(format!("'{name}' must be one of the allowed values")));
        }
    }

    if let Some(text) = value.as_str() {
        let len = text.chars().count();
        if let Some(min_length) = spec.min_length {
            if len < min_length {
                return Err(fail(format!(
                    "'{name}' is shorter than min_length {min_length}"
                )));
            }
        }
        if let Some(max_length) = spec.max_length {
            if len > max_length {
                return Err(fail(format!(
                    "'{name}' is longer than max_length {max_length}"
                )));
            }
        }
        if let Some(pattern) = &spec.pattern {
            // Pattern validity is guaranteed by the registration pipeline.
            if let Ok(re) = regex::Regex::new(pattern) {
                if !re.is_match(text) {
                    return Err(fail(format!("'{name}' does not match required pattern")));
                }
            }
        }
    }

    if let Some(number) = value.as_f64() {
        if let Some(min) = spec.min {
            if number < min {
                return Err(fail(format!("'{name}' is below minimum {min}")));
            }
        }
        if let Some(max) = spec.max {
            if number > max {
                return Err(fail(format!("'{name}' is above maximum {max}")));
            }
        }
        if let Some(multiple_of) = spec.multiple_of {
            if let Some(int) = value.as_i64() {
                if multiple_of > 0 && int % multiple_of != 0 {
                    return Err(fail(format!("'{name}' must be a multiple of {multiple_of}")));
                }
            }
        }
    }

    if let Some(items) = value.as_array() {
        if let Some(min_items) = spec.min_items {
            if items.len() < min_items {
                return Err(fail(format!("'{name}' has fewer than {min_items} items")));
            }
        }
        if let Some(max_items) = spec.max_items {
            if items.len() > max_items {
                return Err(fail(format!("'{name}' has more than {max_items} items")));
            }
        }
    }

    Ok(())
}

pub fn template_key(id: &str, version: &str) -> String {
    format!("{id}@{version}")
}

/// Summary row returned by registry listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateInfo {
    pub id: String,
    pub name: String,
    pub version: String,
    pub category: String,
    pub description: String,
    pub author: String,
    pub tags: Vec<String>,
    pub requires_gpu: bool,
    pub loaded_at: DateTime<Utc>,
    pub file_path: String,
}
