//! Message schemas.
//!
//! Builds a [`DescriptorPool`] from compiled descriptor sets and the schemas
//! declared in configuration. Declared messages and services become proto3
//! file descriptors, one file per package, so both sources resolve through
//! the same pool.

use crate::config::{FieldType, MessageDefinition, MockServerConfig, ServiceDefinition};
use prost_reflect::{DescriptorPool, Kind, MessageDescriptor};
use prost_types::field_descriptor_proto::{Label, Type};
use prost_types::{
    DescriptorProto, EnumDescriptorProto, EnumValueDescriptorProto, FieldDescriptorProto,
    FileDescriptorProto, MethodDescriptorProto, ServiceDescriptorProto,
};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::PathBuf;

/// Errors raised while building schemas.
#[derive(Debug, thiserror::Error)]
pub enum DescriptorError {
    #[error("failed to read descriptor set {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid descriptor set {path}: {source}")]
    DescriptorSet {
        path: PathBuf,
        source: prost_reflect::DescriptorError,
    },
    #[error("duplicate message definition: {0}")]
    DuplicateMessage(String),
    #[error("message {message}: duplicate field {field}")]
    DuplicateField { message: String, field: String },
    #[error("message {message}, field {field}: unknown message type {target}")]
    UnknownFieldType {
        message: String,
        field: String,
        target: String,
    },
    #[error("message {message}, field {field}: enum needs a value numbered 0")]
    EnumWithoutZero { message: String, field: String },
    #[error("{context}: unknown message type {name}")]
    UnknownMessage { context: String, name: String },
    #[error("service {service}: duplicate method {method}")]
    DuplicateMethod { service: String, method: String },
    #[error("invalid schema: {0}")]
    Schema(#[from] prost_reflect::DescriptorError),
}

/// Build the descriptor pool for a configuration.
///
/// Descriptor sets are loaded first; declared messages may reference their
/// types, but may not redefine them.
pub fn build_pool(config: &MockServerConfig) -> Result<DescriptorPool, DescriptorError> {
    let mut pool = DescriptorPool::new();
    for path in &config.descriptor_sets {
        let bytes = std::fs::read(path).map_err(|source| DescriptorError::Io {
            path: path.clone(),
            source,
        })?;
        pool.decode_file_descriptor_set(bytes.as_slice())
            .map_err(|source| DescriptorError::DescriptorSet {
                path: path.clone(),
                source,
            })?;
    }

    let files = SchemaFiles::new(&pool, &config.messages)?.build(&config.messages, &config.services)?;
    if !files.is_empty() {
        pool.add_file_descriptor_protos(files)?;
    }
    Ok(pool)
}

/// JSON skeleton of a message with every field at its default value.
///
/// A message type that is already being expanded renders as `{}`.
pub fn example_json(message: &MessageDescriptor) -> serde_json::Value {
    let mut expanding = HashSet::new();
    example_with(message, &mut expanding)
}

fn example_with(message: &MessageDescriptor, expanding: &mut HashSet<String>) -> serde_json::Value {
    if !expanding.insert(message.full_name().to_string()) {
        return serde_json::json!({});
    }
    let mut object = serde_json::Map::new();
    for field in message.fields() {
        let value = if field.is_map() {
            serde_json::json!({})
        } else {
            let single = match field.kind() {
                Kind::Double | Kind::Float => serde_json::json!(0.0),
                Kind::Bool => serde_json::json!(false),
                Kind::String | Kind::Bytes => serde_json::json!(""),
                Kind::Enum(e) => serde_json::json!(e.default_value().name()),
                Kind::Message(m) => example_with(&m, expanding),
                _ => serde_json::json!(0),
            };
            if field.is_list() {
                serde_json::Value::Array(vec![single])
            } else {
                single
            }
        };
        object.insert(field.name().to_string(), value);
    }
    expanding.remove(message.full_name());
    serde_json::Value::Object(object)
}

/// Declared schemas, grouped into one file per package.
struct SchemaFiles<'a> {
    pool: &'a DescriptorPool,
    /// Declared message name -> package
    declared: HashMap<&'a str, &'a str>,
    files: BTreeMap<&'a str, FileDescriptorProto>,
    imports: BTreeMap<&'a str, BTreeSet<String>>,
}

impl<'a> SchemaFiles<'a> {
    fn new(
        pool: &'a DescriptorPool,
        messages: &'a [MessageDefinition],
    ) -> Result<Self, DescriptorError> {
        let mut declared = HashMap::with_capacity(messages.len());
        for def in messages {
            let (package, _) = split_name(&def.name);
            if pool.get_message_by_name(&def.name).is_some()
                || declared.insert(def.name.as_str(), package).is_some()
            {
                return Err(DescriptorError::DuplicateMessage(def.name.clone()));
            }
        }
        Ok(Self {
            pool,
            declared,
            files: BTreeMap::new(),
            imports: BTreeMap::new(),
        })
    }

    fn build(
        mut self,
        messages: &'a [MessageDefinition],
        services: &'a [ServiceDefinition],
    ) -> Result<Vec<FileDescriptorProto>, DescriptorError> {
        for def in messages {
            let (package, _) = split_name(&def.name);
            let proto = self.message_proto(def)?;
            self.file(package).message_type.push(proto);
        }
        for def in services {
            let (package, _) = split_name(&def.name);
            let proto = self.service_proto(def)?;
            self.file(package).service.push(proto);
        }

        let mut imports = self.imports;
        Ok(self
            .files
            .into_iter()
            .map(|(package, mut file)| {
                file.dependency = imports
                    .remove(package)
                    .unwrap_or_default()
                    .into_iter()
                    .collect();
                file
            })
            .collect())
    }

    fn file(&mut self, package: &'a str) -> &mut FileDescriptorProto {
        self.files
            .entry(package)
            .or_insert_with(|| FileDescriptorProto {
                name: Some(file_name(package)),
                package: (!package.is_empty()).then(|| package.to_string()),
                syntax: Some("proto3".to_string()),
                ..Default::default()
            })
    }

    /// Fully-qualified reference to a message type, recording the import the
    /// referencing package needs.
    fn resolve(&mut self, from: &'a str, name: &str) -> Option<String> {
        let file = match self.declared.get(name) {
            Some(package) => file_name(package),
            None => self
                .pool
                .get_message_by_name(name)?
                .parent_file()
                .name()
                .to_string(),
        };
        if file != file_name(from) {
            self.imports.entry(from).or_default().insert(file);
        }
        Some(format!(".{}", name))
    }

    fn message_proto(&mut self, def: &'a MessageDefinition) -> Result<DescriptorProto, DescriptorError> {
        let (package, simple) = split_name(&def.name);
        let mut proto = DescriptorProto {
            name: Some(simple.to_string()),
            ..Default::default()
        };

        let mut seen = HashSet::new();
        for (position, field) in def.fields.iter().enumerate() {
            if !seen.insert(field.name.as_str()) {
                return Err(DescriptorError::DuplicateField {
                    message: def.name.clone(),
                    field: field.name.clone(),
                });
            }

            let label = if field.repeated {
                Label::Repeated
            } else {
                Label::Optional
            };
            let mut field_proto = FieldDescriptorProto {
                name: Some(field.name.clone()),
                number: Some(field.number.unwrap_or(position as i32 + 1)),
                label: Some(label as i32),
                json_name: field.json_name.clone(),
                ..Default::default()
            };

            let field_type = match &field.field_type {
                FieldType::Double => Type::Double,
                FieldType::Float => Type::Float,
                FieldType::Int32 => Type::Int32,
                FieldType::Int64 => Type::Int64,
                FieldType::Uint32 => Type::Uint32,
                FieldType::Uint64 => Type::Uint64,
                FieldType::Bool => Type::Bool,
                FieldType::String => Type::String,
                FieldType::Bytes => Type::Bytes,
                FieldType::Enum { values } => {
                    let enum_name = to_type_name(&field.name);
                    let mut values: Vec<_> = values.iter().collect();
                    values.sort_by_key(|(_, number)| (**number != 0, **number));
                    if values.first().map(|(_, number)| **number) != Some(0) {
                        return Err(DescriptorError::EnumWithoutZero {
                            message: def.name.clone(),
                            field: field.name.clone(),
                        });
                    }
                    proto.enum_type.push(EnumDescriptorProto {
                        name: Some(enum_name.clone()),
                        value: values
                            .into_iter()
                            .map(|(name, number)| EnumValueDescriptorProto {
                                name: Some(name.clone()),
                                number: Some(*number),
                                ..Default::default()
                            })
                            .collect(),
                        ..Default::default()
                    });
                    field_proto.type_name = Some(format!(".{}.{}", def.name, enum_name));
                    Type::Enum
                }
                FieldType::Message { message } => {
                    let type_name = self.resolve(package, message).ok_or_else(|| {
                        DescriptorError::UnknownFieldType {
                            message: def.name.clone(),
                            field: field.name.clone(),
                            target: message.clone(),
                        }
                    })?;
                    field_proto.type_name = Some(type_name);
                    Type::Message
                }
            };
            field_proto.r#type = Some(field_type as i32);
            proto.field.push(field_proto);
        }

        Ok(proto)
    }

    fn service_proto(
        &mut self,
        def: &'a ServiceDefinition,
    ) -> Result<ServiceDescriptorProto, DescriptorError> {
        let (package, simple) = split_name(&def.name);
        let mut proto = ServiceDescriptorProto {
            name: Some(simple.to_string()),
            ..Default::default()
        };

        let mut seen = HashSet::new();
        for method in &def.methods {
            if !seen.insert(method.name.as_str()) {
                return Err(DescriptorError::DuplicateMethod {
                    service: def.name.clone(),
                    method: method.name.clone(),
                });
            }

            let mut resolve = |name: &String| {
                self.resolve(package, name)
                    .ok_or_else(|| DescriptorError::UnknownMessage {
                        context: format!("method {}/{}", def.name, method.name),
                        name: name.clone(),
                    })
            };
            let input_type = resolve(&method.input)?;
            let output_type = resolve(&method.output)?;

            proto.method.push(MethodDescriptorProto {
                name: Some(method.name.clone()),
                input_type: Some(input_type),
                output_type: Some(output_type),
                ..Default::default()
            });
        }

        Ok(proto)
    }
}

/// Split `package.Name` into its package and simple name.
fn split_name(name: &str) -> (&str, &str) {
    name.rsplit_once('.').unwrap_or(("", name))
}

fn file_name(package: &str) -> String {
    if package.is_empty() {
        "mock.proto".to_string()
    } else {
        format!("mock/{}.proto", package.replace('.', "/"))
    }
}

/// PascalCase type name for a field's nested enum (`order_status` ->
/// `OrderStatus`).
fn to_type_name(field: &str) -> String {
    field
        .split('_')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect()
}
