//! Configuration for the mock server.
//!
//! Defines message schemas, mockable services, response stubs, and global
//! settings.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

/// Main configuration for the mock server.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct MockServerConfig {
    /// Compiled descriptor sets (`protoc --descriptor_set_out`) to load
    #[serde(default)]
    pub descriptor_sets: Vec<PathBuf>,

    /// Message schemas referenced by services
    #[serde(default)]
    pub messages: Vec<MessageDefinition>,

    /// Mockable services
    #[serde(default)]
    pub services: Vec<ServiceDefinition>,

    /// List of stub definitions
    #[serde(default)]
    pub stubs: Vec<StubDefinition>,

    /// Global settings
    #[serde(default)]
    pub settings: GlobalSettings,
}

impl MockServerConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse and validate configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut ids = HashSet::new();
        for (i, stub) in self.stubs.iter().enumerate() {
            stub.validate()
                .map_err(|e| anyhow::anyhow!("Stub {}: {}", i, e))?;
            if !ids.insert(stub.id.as_str()) {
                anyhow::bail!("Stub {}: duplicate id {:?}", i, stub.id);
            }
        }
        for service in &self.services {
            if service.name.is_empty() {
                anyhow::bail!("Service name cannot be empty");
            }
        }
        Ok(())
    }
}

/// A message schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MessageDefinition {
    /// Fully-qualified message name (e.g. `helloworld.HelloRequest`)
    pub name: String,

    /// Fields in declaration order
    #[serde(default)]
    pub fields: Vec<FieldDefinition>,
}

/// A single field of a message schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDefinition {
    /// Field name as declared in the schema
    pub name: String,

    /// Field type
    #[serde(flatten)]
    pub field_type: FieldType,

    /// Whether the field holds a list of values
    #[serde(default)]
    pub repeated: bool,

    /// JSON name (defaults to the lowerCamelCase form of `name`)
    #[serde(default)]
    pub json_name: Option<String>,

    /// Field number (defaults to the 1-based declaration position)
    #[serde(default)]
    pub number: Option<i32>,
}

/// Field type of a message schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldType {
    Double,
    Float,
    Int32,
    Int64,
    Uint32,
    Uint64,
    Bool,
    String,
    Bytes,
    /// Enumeration with named values
    Enum { values: BTreeMap<String, i32> },
    /// Nested message, referenced by fully-qualified name
    Message { message: String },
}

/// A mockable service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceDefinition {
    /// Fully-qualified service name (e.g. `helloworld.Greeter`)
    pub name: String,

    /// Methods exposed by the service
    #[serde(default)]
    pub methods: Vec<MethodDefinition>,
}

/// A unary method of a mockable service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MethodDefinition {
    /// Method name (e.g. `SayHello`)
    pub name: String,

    /// Fully-qualified input message name
    pub input: String,

    /// Fully-qualified output message name
    pub output: String,
}

/// A single stub definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StubDefinition {
    /// Unique identifier for this stub
    pub id: String,

    /// Optional name/description
    #[serde(default)]
    pub name: Option<String>,

    /// Fully-qualified method name, or a glob such as `helloworld.Greeter/*`
    pub method: String,

    /// Request matcher (absent = any request)
    #[serde(default)]
    pub request: Option<RequestMatcher>,

    /// Call metadata matching
    #[serde(default)]
    pub metadata: HashMap<String, MetadataMatcher>,

    /// Response to return
    pub response: ResponseDefinition,

    /// Priority (higher = matched first)
    #[serde(default)]
    pub priority: i32,

    /// Whether this stub is enabled
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl StubDefinition {
    /// Validate the stub definition.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.id.is_empty() {
            anyhow::bail!("Stub id cannot be empty");
        }
        if self.method.is_empty() {
            anyhow::bail!("Stub method cannot be empty");
        }
        crate::matcher::MethodPattern::new(&self.method)
            .map_err(|e| anyhow::anyhow!("Invalid method glob: {}", e))?;
        if let Some(request) = &self.request {
            request.validate()?;
        }
        for (key, matcher) in &self.metadata {
            matcher
                .validate()
                .map_err(|e| anyhow::anyhow!("Metadata {}: {}", key, e))?;
        }
        Ok(())
    }
}

/// Request matching configuration.
///
/// Request content is compared against the canonical JSON form of the call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RequestMatcher {
    /// Request must equal the content exactly
    Exact { content: serde_json::Value },
    /// Every field of the content must be present in the request with an
    /// equal value
    Partial { content: serde_json::Value },
    /// Regex pattern over the canonical request text
    Regex { pattern: String },
    /// JSON path matching
    JsonPath {
        /// JSON path expressions and expected values
        expressions: HashMap<String, serde_json::Value>,
    },
}

impl RequestMatcher {
    /// Validate the request matcher.
    pub fn validate(&self) -> anyhow::Result<()> {
        match self {
            RequestMatcher::Regex { pattern } => {
                regex::Regex::new(pattern).map_err(|e| anyhow::anyhow!("Invalid regex: {}", e))?;
            }
            RequestMatcher::JsonPath { expressions } => {
                for expr in expressions.keys() {
                    crate::matcher::parse_json_path(expr)
                        .map_err(|e| anyhow::anyhow!("Invalid JSON path {}: {}", expr, e))?;
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// Call metadata matching.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MetadataMatcher {
    /// Exact value match
    Exact { value: String },
    /// Regex pattern match
    Regex { pattern: String },
    /// Key must be present (any value)
    Present,
    /// Key must be absent
    Absent,
    /// Value must contain substring
    Contains { value: String },
}

impl MetadataMatcher {
    /// Validate the metadata matcher.
    pub fn validate(&self) -> anyhow::Result<()> {
        if let MetadataMatcher::Regex { pattern } = self {
            regex::Regex::new(pattern).map_err(|e| anyhow::anyhow!("Invalid regex: {}", e))?;
        }
        Ok(())
    }
}

/// Response definition.
///
/// A stub either answers with a message or fails the call with an error
/// message; the outcome is fixed when the stub is loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseDefinition {
    /// Successful response rendered into the method's output message
    Success {
        content: serde_json::Value,
        /// Whether string fields of the content are handlebars templates
        #[serde(default)]
        template: bool,
    },
    /// Fail the call with exactly this message
    Error { error: String },
}

/// Global settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GlobalSettings {
    /// Case-insensitive metadata key matching
    #[serde(default = "default_true")]
    pub case_insensitive_metadata: bool,

    /// Reject stubs whose content does not fit the registered schemas
    #[serde(default = "default_true")]
    pub strict_stubs: bool,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            case_insensitive_metadata: true,
            strict_stubs: true,
        }
    }
}
