use semver::Version;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::model::{ParameterType, Template, TemplateBody, TemplateDocument};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ValidationIssue {
    pub stage: String,
    pub path: String,
    pub message: String,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

#[derive(Debug, Default)]
struct StageReport {
    stage: &'static str,
    issues: Vec<ValidationIssue>,
}

impl StageReport {
    fn new(stage: &'static str) -> Self {
        Self {
            stage,
            issues: Vec::new(),
        }
    }

    fn push(&mut self, severity: Severity, path: &str, message: impl Into<String>) {
        self.push_with_suggestion(severity, path, message, None);
    }

    fn push_with_suggestion(
        &mut self,
        severity: Severity,
        path: &str,
        message: impl Into<String>,
        suggestion: Option<&str>,
    ) {
        self.issues.push(ValidationIssue {
            stage: self.stage.to_string(),
            path: path.to_string(),
            message: message.into(),
            severity,
            suggestion: suggestion.map(str::to_string),
        });
    }

    fn has_critical(&self) -> bool {
        self.issues.iter().any(|i| i.severity == Severity::Critical)
    }
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct ValidationReport {
    pub template_id: Option<String>,
    pub version: Option<String>,
    pub issues: Vec<ValidationIssue>,
    pub stages_completed: Vec<String>,
    #[serde(default)]
    pub cached: bool,
}

impl ValidationReport {
    pub fn errors(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.issues
            .iter()
            .filter(|i| matches!(i.severity, Severity::Error | Severity::Critical))
    }

    pub fn warnings(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.issues.iter().filter(|i| i.severity == Severity::Warning)
    }

    pub fn is_valid(&self) -> bool {
        self.errors().next().is_none()
    }
}

/// Snapshot of registry state the pipeline validates against. Taken up
/// front so the pipeline never holds a registry lock.
#[derive(Debug, Clone, Default)]
pub struct ValidationContext {
    /// id → known versions.
    pub existing_versions: HashMap<String, Vec<String>>,
    /// id → parent id, for inheritance cycle checks.
    pub parents: HashMap<String, Option<String>>,
    pub check_uniqueness: bool,
    pub check_dependencies: bool,
}

impl ValidationContext {
    pub fn new() -> Self {
        Self {
            existing_versions: HashMap::new(),
            parents: HashMap::new(),
            check_uniqueness: true,
            check_dependencies: true,
        }
    }
}

const MAX_INHERITANCE_DEPTH: usize = 5;
const VALID_CATEGORIES: &[&str] = &[
    "image_generation",
    "video_generation",
    "audio_generation",
    "text_generation",
    "processing",
    "analysis",
    "utility",
    "general",
];

/// Six-stage template validation. Results are memoized by the sha256 of the
/// canonical document for `cache_ttl`, bounded at `cache_size` entries.
pub struct ValidationPipeline {
    cache: Mutex<HashMap<String, (ValidationReport, Instant)>>,
    cache_size: usize,
    cache_ttl: Duration,
}

impl Default for ValidationPipeline {
    fn default() -> Self {
        Self::new(1000, Duration::from_secs(3600))
    }
}

impl ValidationPipeline {
    pub fn new(cache_size: usize, cache_ttl: Duration) -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
            cache_size,
            cache_ttl,
        }
    }

    pub fn digest(document: &Value) -> String {
        let canonical = serde_json::to_string(document).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        format!("{:064x}", hasher.finalize())
    }

    pub async fn validate(&self, document: &Value, context: &ValidationContext) -> ValidationReport {
        let key = Self::digest(document);
        {
            let cache = self.cache.lock().await;
            if let Some((report, at)) = cache.get(&key) {
                if at.elapsed() < self.cache_ttl {
                    let mut report = report.clone();
                    report.cached = true;
                    return report;
                }
            }
        }

        let report = self.run_stages(document, context).await;

        let mut cache = self.cache.lock().await;
        if cache.len() >= self.cache_size {
            // Evict anything expired; if still full, drop the oldest entry.
            cache.retain(|_, entry| entry.1.elapsed() < self.cache_ttl);
            if cache.len() >= self.cache_size {
                if let Some(oldest) = cache
                    .iter()
                    .min_by_key(|(_, entry)| entry.1)
                    .map(|(key, _)| key.clone())
                {
                    cache.remove(&oldest);
                }
            }
        }
        cache.insert(key, (report.clone(), Instant::now()));
        report
    }

    async fn run_stages(&self, document: &Value, context: &ValidationContext) -> ValidationReport {
        let mut report = ValidationReport {
            template_id: document
                .pointer("/template/id")
                .and_then(Value::as_str)
                .map(str::to_string),
            version: document
                .pointer("/template/version")
                .and_then(Value::as_str)
                .map(str::to_string),
            ..ValidationReport::default()
        };

        let schema = stage_schema(document);
        let stop = schema.has_critical();
        merge(&mut report, schema);
        if stop {
            return report;
        }

        // Typed stages need a parseable document.
        let body = match serde_json::from_value::<TemplateDocument>(document.clone()) {
            Ok(doc) => doc.template,
            Err(err) => {
                report.issues.push(ValidationIssue {
                    stage: "schema".to_string(),
                    path: "template".to_string(),
                    message: format!("template does not parse: {err}"),
                    severity: Severity::Critical,
                    suggestion: None,
                });
                return report;
            }
        };

        for stage in [
            stage_types(&body),
            stage_resources(&body),
            stage_examples(&body),
            stage_dependencies(&body, context),
            stage_uniqueness(&body, context),
        ] {
            let stop = stage.has_critical();
            merge(&mut report, stage);
            if stop {
                break;
            }
        }

        report
    }
}

fn merge(report: &mut ValidationReport, stage: StageReport) {
    report.stages_completed.push(stage.stage.to_string());
    report.issues.extend(stage.issues);
}

fn stage_schema(document: &Value) -> StageReport {
    let mut out = StageReport::new("schema");

    let Some(template) = document.get("template") else {
        out.push(
            Severity::Critical,
            "template",
            "document must contain a 'template' object",
        );
        return out;
    };
    if !template.is_object() {
        out.push(Severity::Critical, "template", "'template' must be an object");
        return out;
    }

    for field in ["id", "name", "version", "interface", "requirements"] {
        if template.get(field).is_none() {
            out.push(
                Severity::Critical,
                &format!("template.{field}"),
                format!("missing required field '{field}'"),
            );
        }
    }
    if out.has_critical() {
        return out;
    }

    if let Some(id) = template.get("id").and_then(Value::as_str) {
        let id_re = regex::Regex::new(r"^[a-z0-9_]+$").expect("id pattern is static and valid");
        if !id_re.is_match(id) {
            out.push_with_suggestion(
                Severity::Error,
                "template.id",
                "id contains invalid characters",
                Some("use only lowercase letters, numbers, and underscores"),
            );
        }
        if id.len() < 3 || id.len() > 50 {
            out.push(
                Severity::Error,
                "template.id",
                "id must be between 3 and 50 characters",
            );
        }
    } else {
        out.push(Severity::Critical, "template.id", "id must be a string");
    }

    match template.get("name").and_then(Value::as_str) {
        Some(name) if name.len() >= 3 && name.len() <= 100 => {}
        Some(_) => out.push(
            Severity::Error,
            "template.name",
            "name must be between 3 and 100 characters",
        ),
        None => out.push(Severity::Critical, "template.name", "name must be a string"),
    }

    match template.get("version").and_then(Value::as_str) {
        Some(version) => {
            if Version::parse(version).is_err() {
                out.push_with_suggestion(
                    Severity::Error,
                    "template.version",
                    format!("invalid semantic version: {version}"),
                    Some("use a version like 1.0.0 or 2.1.3-beta"),
                );
            }
        }
        None => out.push(
            Severity::Critical,
            "template.version",
            "version must be a string",
        ),
    }

    if let Some(description) = template.get("description").and_then(Value::as_str) {
        if description.len() > 500 {
            out.push(
                Severity::Error,
                "template.description",
                "description must be at most 500 characters",
            );
        }
    } else {
        out.push(
            Severity::Info,
            "template.description",
            "consider adding a description",
        );
    }

    if let Some(category) = template.get("category").and_then(Value::as_str) {
        if !VALID_CATEGORIES.contains(&category) {
            out.push(
                Severity::Warning,
                "template.category",
                format!("unknown category '{category}'"),
            );
        }
    }

    match template.get("tags") {
        None => out.push(
            Severity::Info,
            "template.tags",
            "consider adding tags for discoverability",
        ),
        Some(Value::Array(tags)) => {
            let mut seen = HashSet::new();
            for tag in tags {
                if let Some(tag) = tag.as_str() {
                    if !seen.insert(tag) {
                        out.push(
                            Severity::Error,
                            "template.tags",
                            format!("duplicate tag '{tag}'"),
                        );
                    }
                } else {
                    out.push(Severity::Error, "template.tags", "tags must be strings");
                }
            }
        }
        Some(_) => out.push(Severity::Error, "template.tags", "tags must be an array"),
    }

    out
}

fn constraint_applicability(param_type: ParameterType) -> &'static [&'static str] {
    match param_type {
        ParameterType::String => &["min_length", "max_length", "pattern", "enum", "format"],
        ParameterType::Integer => &["min", "max", "enum", "multiple_of"],
        ParameterType::Float => &["min", "max", "enum"],
        ParameterType::Boolean => &[],
        ParameterType::Array => &["min_items", "max_items"],
        ParameterType::Object => &[],
        ParameterType::File => &["format"],
    }
}

fn stage_types(body: &TemplateBody) -> StageReport {
    let mut out = StageReport::new("types");
    let name_re =
        regex::Regex::new(r"^[a-z][a-z0-9_]*$").expect("parameter name pattern is static and valid");

    for (name, spec) in &body.interface.inputs {
        let prefix = format!("template.interface.inputs.{name}");

        if !name_re.is_match(name) {
            out.push(
                Severity::Error,
                &prefix,
                format!("parameter name '{name}' must start with a lowercase letter and contain only letters, numbers, and underscores"),
            );
        }

        let applicable = constraint_applicability(spec.param_type);
        let present: &[(&str, bool)] = &[
            ("min", spec.min.is_some()),
            ("max", spec.max.is_some()),
            ("min_length", spec.min_length.is_some()),
            ("max_length", spec.max_length.is_some()),
            ("pattern", spec.pattern.is_some()),
            ("enum", spec.enum_values.is_some()),
            ("format", spec.format.is_some()),
            ("min_items", spec.min_items.is_some()),
            ("max_items", spec.max_items.is_some()),
            ("multiple_of", spec.multiple_of.is_some()),
        ];
        for (constraint, is_set) in present {
            if *is_set && !applicable.contains(constraint) {
                out.push_with_suggestion(
                    Severity::Warning,
                    &format!("{prefix}.{constraint}"),
                    format!(
                        "constraint '{constraint}' is not applicable to type '{}'",
                        spec.param_type.as_str()
                    ),
                    Some(&format!("valid constraints: {}", applicable.join(", "))),
                );
            }
        }

        if let (Some(min), Some(max)) = (spec.min, spec.max) {
            if min > max {
                out.push(
                    Severity::Error,
                    &format!("{prefix}.min"),
                    "min cannot be greater than max",
                );
            }
        }
        if let (Some(min_length), Some(max_length)) = (spec.min_length, spec.max_length) {
            if min_length > max_length {
                out.push(
                    Severity::Error,
                    &format!("{prefix}.min_length"),
                    "min_length cannot be greater than max_length",
                );
            }
        }
        if let (Some(min_items), Some(max_items)) = (spec.min_items, spec.max_items) {
            if min_items > max_items {
                out.push(
                    Severity::Error,
                    &format!("{prefix}.min_items"),
                    "min_items cannot be greater than max_items",
                );
            }
        }
        if let Some(multiple_of) = spec.multiple_of {
            if multiple_of <= 0 {
                out.push(
                    Severity::Error,
                    &format!("{prefix}.multiple_of"),
                    "multiple_of must be positive",
                );
            }
        }
        if let Some(pattern) = &spec.pattern {
            if let Err(err) = regex::Regex::new(pattern) {
                out.push(
                    Severity::Error,
                    &format!("{prefix}.pattern"),
                    format!("invalid regex pattern: {err}"),
                );
            }
        }
        if let Some(enum_values) = &spec.enum_values {
            if enum_values.is_empty() {
                out.push(
                    Severity::Error,
                    &format!("{prefix}.enum"),
                    "enum must be a non-empty list",
                );
            } else {
                let rendered: Vec<String> =
                    enum_values.iter().map(|v| v.to_string()).collect();
                let unique: HashSet<&String> = rendered.iter().collect();
                if unique.len() != rendered.len() {
                    out.push(
                        Severity::Error,
                        &format!("{prefix}.enum"),
                        "enum values must be unique",
                    );
                }
            }
        }

        if let Some(default) = &spec.default {
            check_default(&mut out, &prefix, default, spec);
        }
    }

    for name in body.interface.outputs.keys() {
        if !name_re.is_match(name) {
            out.push(
                Severity::Error,
                &format!("template.interface.outputs.{name}"),
                format!("parameter name '{name}' must start with a lowercase letter and contain only letters, numbers, and underscores"),
            );
        }
    }

    if body.interface.outputs.is_empty() {
        out.push(
            Severity::Error,
            "template.interface.outputs",
            "template must define at least one output",
        );
    }

    out
}

fn check_default(
    out: &mut StageReport,
    prefix: &str,
    default: &Value,
    spec: &crate::model::InputSpec,
) {
    let path = format!("{prefix}.default");
    let type_ok = match spec.param_type {
        ParameterType::String => default.is_string(),
        ParameterType::Integer => default.is_i64() || default.is_u64(),
        ParameterType::Float => default.is_number(),
        ParameterType::Boolean => default.is_boolean(),
        ParameterType::Array => default.is_array(),
        ParameterType::Object => default.is_object(),
        ParameterType::File => false,
    };
    if !type_ok {
        let message = if spec.param_type == ParameterType::File {
            "file parameters cannot have defaults".to_string()
        } else {
            format!(
                "default value type does not match parameter type '{}'",
                spec.param_type.as_str()
            )
        };
        out.push(Severity::Error, &path, message);
        return;
    }

    if let Some(enum_values) = &spec.enum_values {
        if !enum_values.contains(default) {
            out.push(
                Severity::Error,
                &path,
                "default value must be one of the enum values",
            );
        }
    }
    if let Some(text) = default.as_str() {
        let len = text.chars().count();
        if spec.min_length.is_some_and(|min| len < min) {
            out.push(Severity::Error, &path, "default value is shorter than min_length");
        }
        if spec.max_length.is_some_and(|max| len > max) {
            out.push(Severity::Error, &path, "default value exceeds max_length");
        }
        if let Some(pattern) = &spec.pattern {
            if let Ok(re) = regex::Regex::new(pattern) {
                if !re.is_match(text) {
                    out.push(
                        Severity::Error,
                        &path,
                        "default value does not match pattern constraint",
                    );
                }
            }
        }
    }
    if let Some(number) = default.as_f64() {
        if spec.min.is_some_and(|min| number < min) {
            out.push(Severity::Error, &path, "default value is below min");
        }
        if spec.max.is_some_and(|max| number > max) {
            out.push(Severity::Error, &path, "default value exceeds max");
        }
    }
}

fn stage_resources(body: &TemplateBody) -> StageReport {
    let mut out = StageReport::new("resources");
    let resources = &body.requirements.resources;

    if resources.gpu {
        if resources.vram_gb <= 0.0 {
            out.push(
                Severity::Error,
                "template.requirements.resources.vram_gb",
                "GPU templates must specify positive VRAM requirements",
            );
        } else if resources.vram_gb > 80.0 {
            out.push_with_suggestion(
                Severity::Warning,
                "template.requirements.resources.vram_gb",
                format!("VRAM requirement of {}GB exceeds typical hardware", resources.vram_gb),
                Some("check whether this requirement is necessary"),
            );
        } else if resources.vram_gb > 24.0 {
            out.push(
                Severity::Warning,
                "template.requirements.resources.vram_gb",
                format!(
                    "VRAM requirement of {}GB requires professional or datacenter GPUs",
                    resources.vram_gb
                ),
            );
        }
    }

    if resources.cpu_cores < 1.0 {
        out.push(
            Severity::Error,
            "template.requirements.resources.cpu_cores",
            "cpu_cores must be at least 1",
        );
    } else if resources.cpu_cores > 128.0 {
        out.push(
            Severity::Warning,
            "template.requirements.resources.cpu_cores",
            format!("CPU requirement of {} cores is unusually high", resources.cpu_cores),
        );
    }

    if resources.memory_gb <= 0.0 {
        out.push(
            Severity::Error,
            "template.requirements.resources.memory_gb",
            "memory requirement must be positive",
        );
    } else if resources.memory_gb > 1024.0 {
        out.push(
            Severity::Warning,
            "template.requirements.resources.memory_gb",
            format!("memory requirement of {}GB is unusually high", resources.memory_gb),
        );
    }

    if resources.disk_gb < 0.0 {
        out.push(
            Severity::Error,
            "template.requirements.resources.disk_gb",
            "disk requirement cannot be negative",
        );
    } else if resources.disk_gb > 1000.0 {
        out.push(
            Severity::Warning,
            "template.requirements.resources.disk_gb",
            format!("disk requirement of {}GB is very large", resources.disk_gb),
        );
    }

    let hash_re =
        regex::Regex::new(r"^[a-fA-F0-9]{64}$").expect("hash pattern is static and valid");
    let mut seen_models = HashSet::new();
    for (index, model) in body.requirements.models.iter().enumerate() {
        let prefix = format!("template.requirements.models[{index}]");
        let model_id = format!("{}:{}", model.name, model.model_type);
        if !seen_models.insert(model_id.clone()) {
            out.push(
                Severity::Error,
                &prefix,
                format!("duplicate model definition: {model_id}"),
            );
        }
        if model.size_gb <= 0.0 {
            out.push(
                Severity::Error,
                &format!("{prefix}.size_gb"),
                "model size must be positive",
            );
        } else if model.size_gb > 100.0 {
            out.push_with_suggestion(
                Severity::Warning,
                &format!("{prefix}.size_gb"),
                format!("model size of {}GB is very large", model.size_gb),
                Some("ensure deployments have sufficient disk space"),
            );
        }
        if let Some(hash) = &model.hash {
            if !hash_re.is_match(hash) {
                out.push(
                    Severity::Error,
                    &format!("{prefix}.hash"),
                    "model hash must be a valid SHA256 hash",
                );
            }
        }
    }

    // Preset names must match the quality input enum when one is declared.
    if let Some(quality_input) = body.interface.inputs.get("quality") {
        if let Some(enum_values) = &quality_input.enum_values {
            let allowed: HashSet<&str> =
                enum_values.iter().filter_map(Value::as_str).collect();
            for preset_name in body.requirements.quality_presets.keys() {
                if !allowed.contains(preset_name.as_str()) {
                    out.push(
                        Severity::Error,
                        &format!("template.requirements.quality_presets.{preset_name}"),
                        format!("quality preset '{preset_name}' not in quality input enum values"),
                    );
                }
            }
        }
    }

    for (preset_name, overlay) in &body.requirements.quality_presets {
        if let Some(multiplier) = overlay.get("resource_multiplier").and_then(Value::as_f64) {
            let path =
                format!("template.requirements.quality_presets.{preset_name}.resource_multiplier");
            if multiplier <= 0.0 {
                out.push(Severity::Error, &path, "resource multiplier must be positive");
            } else if multiplier > 10.0 {
                out.push(
                    Severity::Warning,
                    &path,
                    format!("resource multiplier of {multiplier}x is very high"),
                );
            }
        }
    }

    out
}

fn stage_examples(body: &TemplateBody) -> StageReport {
    let mut out = StageReport::new("examples");

    if body.examples.is_empty() {
        out.push_with_suggestion(
            Severity::Info,
            "template.examples",
            "no examples provided",
            Some("consider adding examples for documentation"),
        );
        return out;
    }

    // Transient template instance used only to run input validation.
    let probe = Template::new(body.clone());

    let mut seen_names = HashSet::new();
    for (index, example) in body.examples.iter().enumerate() {
        let prefix = format!("template.examples[{index}]");

        if !seen_names.insert(example.name.as_str()) {
            out.push(
                Severity::Error,
                &format!("{prefix}.name"),
                format!("duplicate example name: '{}'", example.name),
            );
        }

        for (param_name, spec) in &body.interface.inputs {
            if spec.required && spec.default.is_none() && !example.inputs.contains_key(param_name) {
                out.push(
                    Severity::Error,
                    &format!("{prefix}.inputs.{param_name}"),
                    format!("example missing required input: '{param_name}'"),
                );
            }
        }

        let inputs = Value::Object(example.inputs.clone());
        if let Err(err) = probe.validate_inputs(&inputs) {
            out.push(
                Severity::Error,
                &format!("{prefix}.inputs"),
                format!("example inputs validation failed: {err}"),
            );
        }

        for input_name in example.inputs.keys() {
            if !body.interface.inputs.contains_key(input_name) {
                out.push(
                    Severity::Warning,
                    &format!("{prefix}.inputs.{input_name}"),
                    format!("example has unknown input: '{input_name}'"),
                );
            }
        }

        if example.expected_output.is_some() {
            out.push(
                Severity::Info,
                &format!("{prefix}.expected_output"),
                "expected output provided for testing",
            );
        }
    }

    out
}

fn stage_dependencies(body: &TemplateBody, context: &ValidationContext) -> StageReport {
    let mut out = StageReport::new("dependencies");

    if !context.check_dependencies {
        out.push(Severity::Info, "dependencies", "dependency validation skipped");
        return out;
    }

    let Some(parent_id) = &body.extends else {
        return out;
    };

    if !context.parents.contains_key(parent_id) {
        out.push(
            Severity::Error,
            "template.extends",
            format!("cannot resolve parent template '{parent_id}'"),
        );
        return out;
    }

    let mut visited = vec![body.id.clone()];
    let mut current = Some(parent_id.clone());
    while let Some(id) = current {
        if visited.contains(&id) {
            visited.push(id);
            out.push(
                Severity::Critical,
                "template.extends",
                format!("circular dependency detected: {}", visited.join(" -> ")),
            );
            return out;
        }
        if visited.len() > MAX_INHERITANCE_DEPTH {
            out.push(
                Severity::Error,
                "template.extends",
                format!("inheritance chain deeper than {MAX_INHERITANCE_DEPTH} levels"),
            );
            return out;
        }
        visited.push(id.clone());
        current = context.parents.get(&id).cloned().flatten();
    }

    out
}

fn stage_uniqueness(body: &TemplateBody, context: &ValidationContext) -> StageReport {
    let mut out = StageReport::new("uniqueness");

    if !context.check_uniqueness {
        out.push(Severity::Info, "uniqueness", "uniqueness validation skipped");
        return out;
    }

    if let Some(versions) = context.existing_versions.get(&body.id) {
        if versions.iter().any(|v| v == &body.version) {
            out.push_with_suggestion(
                Severity::Critical,
                "template",
                format!(
                    "template '{}' version '{}' already exists",
                    body.id, body.version
                ),
                Some("use a different version number or template id"),
            );
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn minimal_doc() -> Value {
        json!({
            "template": {
                "id": "image_gen",
                "name": "Image Generation",
                "version": "1.0.0",
                "category": "image_generation",
                "interface": {
                    "inputs": {
                        "prompt": {"type": "string", "required": true, "min_length": 1}
                    },
                    "outputs": {
                        "image": {"type": "file", "format": ["png"]}
                    }
                },
                "requirements": {
                    "resources": {"gpu": true, "vram_gb": 8.0, "cpu_cores": 2.0, "memory_gb": 4.0}
                }
            }
        })
    }

    #[tokio::test]
    async fn minimal_template_is_valid() {
        let pipeline = ValidationPipeline::default();
        let report = pipeline
            .validate(&minimal_doc(), &ValidationContext::new())
            .await;
        assert!(report.is_valid(), "issues: {:?}", report.issues);
        assert_eq!(report.stages_completed.len(), 6);
    }

    #[tokio::test]
    async fn missing_required_field_is_critical_and_stops() {
        let mut doc = minimal_doc();
        doc["template"].as_object_mut().unwrap().remove("version");
        let pipeline = ValidationPipeline::default();
        let report = pipeline.validate(&doc, &ValidationContext::new()).await;
        assert!(!report.is_valid());
        assert_eq!(report.stages_completed, vec!["schema"]);
    }

    #[tokio::test]
    async fn bad_semver_rejected() {
        let mut doc = minimal_doc();
        doc["template"]["version"] = json!("one-point-oh");
        let pipeline = ValidationPipeline::default();
        let report = pipeline.validate(&doc, &ValidationContext::new()).await;
        assert!(report
            .errors()
            .any(|i| i.path == "template.version"));
    }

    #[tokio::test]
    async fn bad_id_pattern_rejected() {
        let mut doc = minimal_doc();
        doc["template"]["id"] = json!("Image-Gen");
        let pipeline = ValidationPipeline::default();
        let report = pipeline.validate(&doc, &ValidationContext::new()).await;
        assert!(report.errors().any(|i| i.path == "template.id"));
    }

    #[tokio::test]
    async fn gpu_without_vram_rejected() {
        let mut doc = minimal_doc();
        doc["template"]["requirements"]["resources"]["vram_gb"] = json!(0.0);
        let pipeline = ValidationPipeline::default();
        let report = pipeline.validate(&doc, &ValidationContext::new()).await;
        assert!(report
            .errors()
            .any(|i| i.path == "template.requirements.resources.vram_gb"));
    }

    #[tokio::test]
    async fn vram_above_24_warns() {
        let mut doc = minimal_doc();
        doc["template"]["requirements"]["resources"]["vram_gb"] = json!(40.0);
        let pipeline = ValidationPipeline::default();
        let report = pipeline.validate(&doc, &ValidationContext::new()).await;
        assert!(report.is_valid());
        assert!(report
            .warnings()
            .any(|i| i.path == "template.requirements.resources.vram_gb"));
    }

    #[tokio::test]
    async fn missing_outputs_rejected() {
        let mut doc = minimal_doc();
        doc["template"]["interface"]["outputs"] = json!({});
        let pipeline = ValidationPipeline::default();
        let report = pipeline.validate(&doc, &ValidationContext::new()).await;
        assert!(report
            .errors()
            .any(|i| i.path == "template.interface.outputs"));
    }

    #[tokio::test]
    async fn invalid_model_hash_rejected() {
        let mut doc = minimal_doc();
        doc["template"]["requirements"]["models"] = json!([
            {"name": "sdxl", "type": "checkpoint", "size_gb": 6.5, "hash": "nothex"}
        ]);
        let pipeline = ValidationPipeline::default();
        let report = pipeline.validate(&doc, &ValidationContext::new()).await;
        assert!(report
            .errors()
            .any(|i| i.path.ends_with(".hash")));
    }

    #[tokio::test]
    async fn duplicate_models_rejected() {
        let mut doc = minimal_doc();
        doc["template"]["requirements"]["models"] = json!([
            {"name": "sdxl", "type": "checkpoint", "size_gb": 6.5},
            {"name": "sdxl", "type": "checkpoint", "size_gb": 6.5}
        ]);
        let pipeline = ValidationPipeline::default();
        let report = pipeline.validate(&doc, &ValidationContext::new()).await;
        assert!(report
            .errors()
            .any(|i| i.message.contains("duplicate model")));
    }

    #[tokio::test]
    async fn default_must_satisfy_constraints() {
        let mut doc = minimal_doc();
        doc["template"]["interface"]["inputs"]["steps"] =
            json!({"type": "integer", "min": 1.0, "max": 150.0, "default": 500});
        let pipeline = ValidationPipeline::default();
        let report = pipeline.validate(&doc, &ValidationContext::new()).await;
        assert!(report.errors().any(|i| i.path.ends_with("steps.default")));
    }

    #[tokio::test]
    async fn example_missing_required_input_rejected() {
        let mut doc = minimal_doc();
        doc["template"]["examples"] = json!([{"name": "bad", "inputs": {}}]);
        let pipeline = ValidationPipeline::default();
        let report = pipeline.validate(&doc, &ValidationContext::new()).await;
        assert!(report
            .errors()
            .any(|i| i.message.contains("missing required input")));
    }

    #[tokio::test]
    async fn example_unknown_input_warns() {
        let mut doc = minimal_doc();
        doc["template"]["examples"] =
            json!([{"name": "ok", "inputs": {"prompt": "a cat", "wat": 1}}]);
        let pipeline = ValidationPipeline::default();
        let report = pipeline.validate(&doc, &ValidationContext::new()).await;
        assert!(report.is_valid());
        assert!(report.warnings().any(|i| i.message.contains("unknown input")));
    }

    #[tokio::test]
    async fn duplicate_registration_is_critical() {
        let pipeline = ValidationPipeline::default();
        let mut context = ValidationContext::new();
        context
            .existing_versions
            .insert("image_gen".to_string(), vec!["1.0.0".to_string()]);
        let report = pipeline.validate(&minimal_doc(), &context).await;
        assert!(!report.is_valid());
        assert!(report
            .errors()
            .any(|i| i.stage == "uniqueness" && i.severity == Severity::Critical));
    }

    #[tokio::test]
    async fn extends_cycle_is_critical() {
        let mut doc = minimal_doc();
        doc["template"]["extends"] = json!("parent_gen");
        let pipeline = ValidationPipeline::default();
        let mut context = ValidationContext::new();
        context
            .parents
            .insert("parent_gen".to_string(), Some("image_gen".to_string()));
        context.parents.insert("image_gen".to_string(), None);
        let report = pipeline.validate(&doc, &context).await;
        assert!(report
            .errors()
            .any(|i| i.message.contains("circular dependency")));
    }

    #[tokio::test]
    async fn second_validation_is_cached() {
        let pipeline = ValidationPipeline::default();
        let context = ValidationContext::new();
        let first = pipeline.validate(&minimal_doc(), &context).await;
        assert!(!first.cached);
        let second = pipeline.validate(&minimal_doc(), &context).await;
        assert!(second.cached);
        assert_eq!(first.issues.len(), second.issues.len());
    }
}
