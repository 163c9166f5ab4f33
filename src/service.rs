//! Mockable services.
//!
//! A [`MockService`] describes the unary methods a service exposes and knows
//! how to check stubs against their message types. [`ServiceRegistry`] holds
//! every registered service and resolves calls to methods.

use crate::canonical::{canonicalize, CanonicalMessage};
use crate::config::{MockServerConfig, RequestMatcher, ResponseDefinition, StubDefinition};
use crate::descriptor::{build_pool, example_json, DescriptorError};
use crate::matcher::{normalize_method, MethodPattern};
use crate::transform::transform;
use prost_reflect::{DynamicMessage, MessageDescriptor, ServiceDescriptor};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// A unary method with its request and response types.
#[derive(Debug, Clone, PartialEq)]
pub struct MockMethod {
    /// `package.Service/Method`
    pub full_name: String,
    pub name: String,
    pub input: MessageDescriptor,
    pub output: MessageDescriptor,
}

/// A problem found while checking a stub against the registered services.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StubIssue {
    pub stub_id: String,
    pub message: String,
}

impl fmt::Display for StubIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stub {}: {}", self.stub_id, self.message)
    }
}

/// A service whose calls can be answered from stubs.
pub trait MockService: Send + Sync {
    /// Fully-qualified service name.
    fn name(&self) -> &str;

    /// Methods exposed by the service.
    fn methods(&self) -> &[MockMethod];

    /// Fully-qualified names of every method.
    fn supported_methods(&self) -> Vec<String> {
        self.methods().iter().map(|m| m.full_name.clone()).collect()
    }

    /// Look up a method by full name, with or without the leading `/`.
    fn method(&self, full_method: &str) -> Option<&MockMethod> {
        let full_method = normalize_method(full_method);
        self.methods().iter().find(|m| m.full_name == full_method)
    }

    /// One example stub per method, with request and response skeletons.
    fn payload_examples(&self) -> Vec<StubDefinition> {
        self.methods()
            .iter()
            .map(|method| StubDefinition {
                id: format!("example-{}", method.full_name.replace('/', "-")),
                name: Some(format!("Example for {}", method.full_name)),
                method: method.full_name.clone(),
                request: Some(RequestMatcher::Exact {
                    content: example_json(&method.input),
                }),
                metadata: HashMap::new(),
                response: ResponseDefinition::Success {
                    content: example_json(&method.output),
                    template: false,
                },
                priority: 0,
                enabled: true,
            })
            .collect()
    }

    /// Check a stub against every method of this service it targets.
    ///
    /// Request content is decoded as the input type and literal success
    /// content as the output type. Templated content is only known at call
    /// time and is not checked.
    fn validate_stub(&self, stub: &StubDefinition) -> Vec<StubIssue> {
        let mut issues = Vec::new();
        let issue = |message: String| StubIssue {
            stub_id: stub.id.clone(),
            message,
        };

        let pattern = match MethodPattern::new(&stub.method) {
            Ok(pattern) => pattern,
            Err(e) => return vec![issue(format!("invalid method pattern: {}", e))],
        };

        for method in self.methods() {
            if !pattern.matches(&method.full_name) {
                continue;
            }

            if let Some(RequestMatcher::Exact { content } | RequestMatcher::Partial { content }) =
                &stub.request
            {
                if let Err(e) = transform(content, DynamicMessage::new(method.input.clone())) {
                    issues.push(issue(format!(
                        "request does not fit {}: {}",
                        method.full_name, e
                    )));
                }
            }

            if let ResponseDefinition::Success {
                content,
                template: false,
            } = &stub.response
            {
                if let Err(e) = transform(content, DynamicMessage::new(method.output.clone())) {
                    issues.push(issue(format!(
                        "response does not fit {}: {}",
                        method.full_name, e
                    )));
                }
            }
        }

        issues
    }
}

/// A service built from configuration.
#[derive(Debug, Clone)]
pub struct DescriptorService {
    name: String,
    methods: Vec<MockMethod>,
}

impl DescriptorService {
    /// Expose the unary methods of a service descriptor. Streaming methods
    /// are skipped.
    pub fn new(service: &ServiceDescriptor) -> Self {
        let methods = service
            .methods()
            .filter_map(|method| {
                let full_name = format!("{}/{}", service.full_name(), method.name());
                if method.is_client_streaming() || method.is_server_streaming() {
                    debug!(method = %full_name, "Skipping streaming method");
                    return None;
                }
                Some(MockMethod {
                    full_name,
                    name: method.name().to_string(),
                    input: method.input(),
                    output: method.output(),
                })
            })
            .collect();

        Self {
            name: service.full_name().to_string(),
            methods,
        }
    }
}

impl MockService for DescriptorService {
    fn name(&self) -> &str {
        &self.name
    }

    fn methods(&self) -> &[MockMethod] {
        &self.methods
    }
}

/// Registered services.
#[derive(Default, Clone)]
pub struct ServiceRegistry {
    services: Vec<Arc<dyn MockService>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the registry for every service in the configuration: declared
    /// services in declaration order, then those from descriptor sets.
    pub fn from_config(config: &MockServerConfig) -> Result<Self, DescriptorError> {
        let pool = build_pool(config)?;
        let mut registry = Self::new();
        let mut registered = HashSet::new();

        let declared = config
            .services
            .iter()
            .filter_map(|definition| pool.get_service_by_name(&definition.name));
        for service in declared.chain(pool.services()) {
            if registered.insert(service.full_name().to_string()) {
                registry.register(DescriptorService::new(&service));
            }
        }
        Ok(registry)
    }

    /// Add a service.
    pub fn register(&mut self, service: impl MockService + 'static) {
        self.services.push(Arc::new(service));
    }

    pub fn services(&self) -> impl Iterator<Item = &dyn MockService> {
        self.services.iter().map(|s| s.as_ref())
    }

    /// Resolve a call to its method.
    pub fn method(&self, full_method: &str) -> Option<&MockMethod> {
        self.services.iter().find_map(|s| s.method(full_method))
    }

    /// Full names of every registered method.
    pub fn supported_methods(&self) -> Vec<String> {
        self.services
            .iter()
            .flat_map(|s| s.supported_methods())
            .collect()
    }

    /// Example stubs for every registered method.
    pub fn payload_examples(&self) -> Vec<StubDefinition> {
        self.services
            .iter()
            .flat_map(|s| s.payload_examples())
            .collect()
    }

    /// Rewrite exact and partial request content into canonical form, so it
    /// compares equal to canonical requests: default values are dropped,
    /// enums become numbers, and `float` fields take `float` precision.
    ///
    /// Only stubs whose methods all share one input type are rewritten.
    /// Content that does not fit that type is left alone.
    pub fn normalize_stubs(&self, stubs: &mut [StubDefinition]) {
        for stub in stubs {
            let Some(RequestMatcher::Exact { content } | RequestMatcher::Partial { content }) =
                &mut stub.request
            else {
                continue;
            };
            let Ok(pattern) = MethodPattern::new(&stub.method) else {
                continue;
            };

            let mut inputs = self
                .services
                .iter()
                .flat_map(|s| s.methods())
                .filter(|m| pattern.matches(&m.full_name))
                .map(|m| &m.input);
            let Some(input) = inputs.next() else {
                continue;
            };
            if inputs.any(|other| other != input) {
                debug!(stub_id = %stub.id, "Request content spans several input types");
                continue;
            }

            match normalize_content(content, input) {
                Some(normalized) => *content = normalized,
                None => debug!(stub_id = %stub.id, "Request content left as written"),
            }
        }
    }

    /// Check stubs against the registered services.
    ///
    /// Besides schema mismatches, a stub whose method matches no registered
    /// method is reported.
    pub fn validate_stubs(&self, stubs: &[StubDefinition]) -> Vec<StubIssue> {
        let mut issues = Vec::new();
        for stub in stubs {
            let targets_any = match MethodPattern::new(&stub.method) {
                Ok(pattern) => self
                    .services
                    .iter()
                    .flat_map(|s| s.methods())
                    .any(|m| pattern.matches(&m.full_name)),
                Err(e) => {
                    issues.push(StubIssue {
                        stub_id: stub.id.clone(),
                        message: format!("invalid method pattern: {}", e),
                    });
                    continue;
                }
            };

            if !targets_any {
                issues.push(StubIssue {
                    stub_id: stub.id.clone(),
                    message: format!("method {} matches no registered method", stub.method),
                });
                continue;
            }

            for service in &self.services {
                issues.extend(service.validate_stub(stub));
            }
        }
        issues
    }
}

fn normalize_content(
    content: &serde_json::Value,
    input: &MessageDescriptor,
) -> Option<serde_json::Value> {
    let message = transform(content, DynamicMessage::new(input.clone())).ok()?;
    let text = canonicalize(&CanonicalMessage(&message)).ok()?;
    serde_json::from_str(&text).ok()
}

impl fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("methods", &self.supported_methods())
            .finish()
    }
}
