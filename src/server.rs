//! Mock server facade.
//!
//! Ties the service registry to the call handler: a call names a method and
//! carries its request as JSON, the registry supplies the request and
//! response types, and the handler decides the outcome.

use crate::canonical::CanonicalMessage;
use crate::config::MockServerConfig;
use crate::handler::{CallContext, HandlerError, MockHandler};
use crate::matcher::{StubMatcher, StubsMatcher};
use crate::service::ServiceRegistry;
use crate::transform::{transform_str, TransformError};
use anyhow::Context;
use prost_reflect::DynamicMessage;
use tracing::{info, warn};

/// Errors returned for a call.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("unknown method {0}")]
    UnknownMethod(String),
    #[error("invalid request for {method}: {source}")]
    InvalidRequest {
        method: String,
        source: TransformError,
    },
    #[error(transparent)]
    Handler(#[from] HandlerError),
}

/// Mock server answering calls for registered services.
pub struct MockServer<M = StubMatcher> {
    registry: ServiceRegistry,
    handler: MockHandler<M>,
}

impl MockServer<StubMatcher> {
    /// Build a server from configuration.
    ///
    /// Stubs are checked against the registered schemas first. With
    /// `settings.strict_stubs` any issue fails the load; otherwise issues
    /// are logged and the stubs are kept. Request content is then put in
    /// canonical form (see [`ServiceRegistry::normalize_stubs`]).
    pub fn from_config(config: MockServerConfig) -> anyhow::Result<Self> {
        config.validate()?;

        let registry =
            ServiceRegistry::from_config(&config).context("Failed to build service registry")?;

        let issues = registry.validate_stubs(&config.stubs);
        if !issues.is_empty() {
            if config.settings.strict_stubs {
                let details: Vec<_> = issues.iter().map(|i| i.to_string()).collect();
                anyhow::bail!("Invalid stubs:\n  {}", details.join("\n  "));
            }
            for issue in &issues {
                warn!(stub_id = %issue.stub_id, "{}", issue.message);
            }
        }

        let mut stubs = config.stubs;
        registry.normalize_stubs(&mut stubs);

        let matcher = StubMatcher::new(stubs, &config.settings)
            .context("Failed to compile stubs")?;

        info!(
            methods = registry.supported_methods().len(),
            stubs = matcher.len(),
            "Mock server configured"
        );

        Ok(Self::new(registry, matcher))
    }
}

impl<M: StubsMatcher> MockServer<M> {
    pub fn new(registry: ServiceRegistry, matcher: M) -> Self {
        Self {
            registry,
            handler: MockHandler::new(matcher),
        }
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    /// Answer one call whose request is given as JSON.
    pub fn call(
        &self,
        ctx: &CallContext,
        full_method: &str,
        request_json: &str,
    ) -> Result<DynamicMessage, CallError> {
        let Some(method) = self.registry.method(full_method) else {
            warn!(method = %full_method, "Call to unknown method");
            return Err(CallError::UnknownMethod(full_method.to_string()));
        };

        let request = transform_str(request_json, DynamicMessage::new(method.input.clone()))
            .map_err(|source| {
                warn!(method = %full_method, error = %source, "Request does not fit input type");
                CallError::InvalidRequest {
                    method: method.full_name.clone(),
                    source,
                }
            })?;

        let response = DynamicMessage::new(method.output.clone());
        Ok(self
            .handler
            .handle(ctx, full_method, &CanonicalMessage(&request), response)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RequestMatcher;
    use prost_reflect::{ReflectMessage, Value};

    const CONFIG: &str = r#"
messages:
  - name: helloworld.HelloRequest
    fields:
      - name: name
        type: string
      - name: locale
        type: string
  - name: helloworld.HelloReply
    fields:
      - name: message
        type: string

services:
  - name: helloworld.Greeter
    methods:
      - name: SayHello
        input: helloworld.HelloRequest
        output: helloworld.HelloReply

stubs:
  - id: hello-ada
    method: helloworld.Greeter/SayHello
    request:
      type: exact
      content:
        name: Ada
    response:
      type: success
      content:
        message: "Hello, Ada"

  - id: french
    method: helloworld.Greeter/SayHello
    priority: 10
    metadata:
      accept-language:
        type: contains
        value: fr
    response:
      type: success
      template: true
      content:
        message: "Bonjour, {{request.name}}"

  - id: rate-limited
    method: helloworld.Greeter/SayHello
    request:
      type: exact
      content:
        name: Grace
    response:
      type: error
      error: rate limited
"#;

    const RECORDS: &str = r#"
messages:
  - name: demo.Record
    fields:
      - name: id
        type: int64
      - name: blob
        type: bytes
      - name: ratio
        type: float
      - name: score
        type: double
      - name: status
        type: enum
        values: {UNKNOWN: 0, ACTIVE: 1}
      - name: tags
        type: string
        repeated: true
      - name: owner
        type: message
        message: demo.Owner
  - name: demo.Owner
    fields:
      - name: email
        type: string

services:
  - name: demo.Records
    methods:
      - name: Put
        input: demo.Record
        output: demo.Record

stubs:
  - id: float-field
    method: demo.Records/Put
    request:
      type: exact
      content:
        ratio: 0.1
    response:
      type: success
      content:
        tags: [float-field]

  - id: integral-double
    method: demo.Records/Put
    request:
      type: partial
      content:
        score: 1
    response:
      type: success
      content:
        tags: [integral-double]

  - id: every-kind
    method: demo.Records/Put
    request:
      type: exact
      content:
        id: "9007199254740993"
        blob: aGk=
        ratio: 0.25
        score: 2.5
        status: ACTIVE
        tags: [a, b]
        owner:
          email: ada@example.com
    response:
      type: success
      content:
        id: 42
        blob: b2s=
        ratio: 1.5
        score: 0.1
        status: ACTIVE
        tags: [x, y]
        owner:
          email: grace@example.com
"#;

    fn server() -> MockServer {
        MockServer::from_config(MockServerConfig::from_yaml(CONFIG).unwrap()).unwrap()
    }

    fn records() -> MockServer {
        MockServer::from_config(MockServerConfig::from_yaml(RECORDS).unwrap()).unwrap()
    }

    fn field(message: &DynamicMessage, name: &str) -> Value {
        message.get_field_by_name(name).unwrap().into_owned()
    }

    fn message_of(reply: &DynamicMessage) -> String {
        field(reply, "message").as_str().unwrap_or_default().to_string()
    }

    fn tags(reply: &DynamicMessage) -> Vec<String> {
        field(reply, "tags")
            .as_list()
            .unwrap_or_default()
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect()
    }

    fn put(server: &MockServer, request: &str) -> Result<DynamicMessage, CallError> {
        server.call(&CallContext::default(), "demo.Records/Put", request)
    }

    #[test]
    fn test_call_success() {
        let reply = server()
            .call(
                &CallContext::default(),
                "/helloworld.Greeter/SayHello",
                r#"{"name": "Ada"}"#,
            )
            .unwrap();
        assert_eq!(reply.descriptor().full_name(), "helloworld.HelloReply");
        assert_eq!(message_of(&reply), "Hello, Ada");
    }

    #[test]
    fn test_call_declared_error() {
        let err = server()
            .call(
                &CallContext::default(),
                "helloworld.Greeter/SayHello",
                r#"{"name": "Grace"}"#,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            CallError::Handler(HandlerError::StubDeclared { .. })
        ));
        assert_eq!(err.to_string(), "rate limited");
    }

    #[test]
    fn test_call_no_match() {
        let err = server()
            .call(
                &CallContext::default(),
                "helloworld.Greeter/SayHello",
                r#"{"name": "Nobody"}"#,
            )
            .unwrap_err();
        assert_eq!(err.to_string(), "no response found");
    }

    #[test]
    fn test_call_with_metadata() {
        let ctx = CallContext::default().with_metadata("Accept-Language", "fr-FR");
        let reply = server()
            .call(&ctx, "helloworld.Greeter/SayHello", r#"{"name": "Ada"}"#)
            .unwrap();
        assert_eq!(message_of(&reply), "Bonjour, Ada");
    }

    #[test]
    fn test_float_field_matches_literal() {
        let server = records();
        let reply = put(&server, r#"{"ratio": 0.1}"#).unwrap();
        assert_eq!(tags(&reply), vec!["float-field"]);
    }

    #[test]
    fn test_integral_double_matches_integer_literal() {
        let server = records();
        let reply = put(&server, r#"{"score": 1.0, "tags": ["t"]}"#).unwrap();
        assert_eq!(tags(&reply), vec!["integral-double"]);

        let err = put(&server, r#"{"score": 1.5}"#).unwrap_err();
        assert_eq!(err.to_string(), "no response found");
    }

    #[test]
    fn test_every_field_kind() {
        let server = records();
        let reply = put(
            &server,
            r#"{
                "id": "9007199254740993",
                "blob": "aGk=",
                "ratio": 0.25,
                "score": 2.5,
                "status": "ACTIVE",
                "tags": ["a", "b"],
                "owner": {"email": "ada@example.com"}
            }"#,
        )
        .unwrap();

        assert_eq!(field(&reply, "id"), Value::I64(42));
        assert_eq!(
            field(&reply, "blob").as_bytes().map(|b| b.to_vec()),
            Some(b"ok".to_vec())
        );
        assert_eq!(field(&reply, "ratio"), Value::F32(1.5));
        assert_eq!(field(&reply, "score"), Value::F64(0.1));
        assert_eq!(field(&reply, "status"), Value::EnumNumber(1));
        assert_eq!(tags(&reply), vec!["x", "y"]);
        let owner = field(&reply, "owner");
        assert_eq!(
            field(owner.as_message().unwrap(), "email"),
            Value::String("grace@example.com".to_string())
        );

        // Same request with the enum by number and the id unquoted
        let reply = put(
            &server,
            r#"{"owner": {"email": "ada@example.com"}, "tags": ["a", "b"], "status": 1,
                "score": 2.5, "ratio": 0.25, "blob": "aGk=", "id": 9007199254740993}"#,
        )
        .unwrap();
        assert_eq!(field(&reply, "id"), Value::I64(42));

        // Order of repeated values matters
        let err = put(
            &server,
            r#"{"id": "9007199254740993", "blob": "aGk=", "ratio": 0.25, "score": 2.5,
                "status": "ACTIVE", "tags": ["b", "a"], "owner": {"email": "ada@example.com"}}"#,
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "no response found");
    }

    #[test]
    fn test_payload_examples_answer_calls() {
        for yaml in [CONFIG, RECORDS] {
            let mut config = MockServerConfig::from_yaml(yaml).unwrap();
            let examples = ServiceRegistry::from_config(&config)
                .unwrap()
                .payload_examples();
            config.stubs = examples.clone();
            let server = MockServer::from_config(config).unwrap();

            for example in &examples {
                let Some(RequestMatcher::Exact { content }) = &example.request else {
                    panic!("Expected exact request in {}", example.id);
                };
                let request = serde_json::to_string(content).unwrap();
                let reply = server
                    .call(&CallContext::default(), &example.method, &request)
                    .unwrap();
                let method = server.registry().method(&example.method).unwrap();
                assert_eq!(reply.descriptor(), method.output);
            }
        }

        let mut config = MockServerConfig::from_yaml(CONFIG).unwrap();
        config.stubs = ServiceRegistry::from_config(&config)
            .unwrap()
            .payload_examples();
        let server = MockServer::from_config(config).unwrap();
        assert!(server
            .call(&CallContext::default(), "helloworld.Greeter/SayHello", "{}")
            .is_ok());
    }

    #[test]
    fn test_unknown_method() {
        let err = server()
            .call(&CallContext::default(), "helloworld.Greeter/Shout", "{}")
            .unwrap_err();
        assert!(matches!(err, CallError::UnknownMethod(_)));
    }

    #[test]
    fn test_invalid_request() {
        let err = server()
            .call(
                &CallContext::default(),
                "helloworld.Greeter/SayHello",
                r#"{"nickname": "Ada"}"#,
            )
            .unwrap_err();
        assert!(matches!(err, CallError::InvalidRequest { .. }));
        assert!(err.to_string().contains("nickname"));
    }

    #[test]
    fn test_strict_stubs_reject_mismatch() {
        let config = MockServerConfig::from_yaml(&format!(
            "{}{}",
            CONFIG,
            r#"
  - id: broken
    method: helloworld.Greeter/SayHello
    response:
      type: success
      content:
        msg: hi
"#
        ))
        .unwrap();

        let err = MockServer::from_config(config).err().unwrap();
        assert!(err.to_string().contains("stub broken"));
    }

    #[test]
    fn test_lenient_stubs_kept() {
        let mut config = MockServerConfig::from_yaml(&format!(
            "{}{}",
            CONFIG,
            r#"
  - id: broken
    method: helloworld.Greeter/SayHello
    request:
      type: exact
      content:
        name: Linus
    response:
      type: success
      content:
        msg: hi
"#
        ))
        .unwrap();
        config.settings.strict_stubs = false;

        let server = MockServer::from_config(config).unwrap();
        let err = server
            .call(
                &CallContext::default(),
                "helloworld.Greeter/SayHello",
                r#"{"name": "Linus"}"#,
            )
            .unwrap_err();
        assert_eq!(err.to_string(), "could not unmarshal response");
    }
}
