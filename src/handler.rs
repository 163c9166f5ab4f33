//! Call interception.
//!
//! [`MockHandler`] decides the outcome of a single call: it canonicalizes the
//! request, asks the matcher for a stub, and turns the stub's response into
//! either a populated response message or an error. Each decision is logged
//! exactly once.

use crate::canonical::{canonicalize, CanonicalMessage, EncodingError};
use crate::config::ResponseDefinition;
use crate::matcher::{MatchContext, StubsMatcher};
use crate::template::{TemplateContext, TemplateEngine};
use crate::transform::{transform, TransformError};
use prost_reflect::DynamicMessage;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Debug;
use tracing::{error, info};

/// Per-call context supplied by the transport.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    /// Call metadata (e.g. gRPC headers)
    pub metadata: HashMap<String, String>,
}

impl CallContext {
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Caller-visible outcome of a failed call.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// The request could not be rendered for matching.
    #[error(transparent)]
    Encoding(#[from] EncodingError),
    /// No stub matched the call.
    #[error("no response found")]
    NoStubMatched,
    /// The matched stub declares an error; the message is returned verbatim.
    #[error("{message}")]
    StubDeclared { message: String },
    /// The matched stub's content does not fit the response type. The cause
    /// is logged, never returned.
    #[error("could not unmarshal response")]
    ResponseDecode,
}

#[derive(Debug, thiserror::Error)]
enum ResponseBuildError {
    #[error("template rendering failed: {0}")]
    Template(#[from] handlebars::RenderError),
    #[error(transparent)]
    Transform(#[from] TransformError),
}

/// Answers calls from stubs.
///
/// The handler keeps no per-call state, so one instance serves concurrent
/// calls as long as the matcher does.
pub struct MockHandler<M> {
    matcher: M,
    templates: TemplateEngine,
}

impl<M: StubsMatcher> MockHandler<M> {
    pub fn new(matcher: M) -> Self {
        Self {
            matcher,
            templates: TemplateEngine::new(),
        }
    }

    /// Handle one call.
    ///
    /// `response` is an empty message of the type the caller expects; on
    /// success it comes back populated from the matched stub.
    pub fn handle<R>(
        &self,
        ctx: &CallContext,
        full_method: &str,
        request: &R,
        response: DynamicMessage,
    ) -> Result<DynamicMessage, HandlerError>
    where
        R: Serialize + Debug + ?Sized,
    {
        let request_json = match canonicalize(request) {
            Ok(json) => json,
            Err(err) => {
                error!(
                    method = %full_method,
                    request = ?request,
                    outcome = "malformed_request",
                    error = %err,
                    "Error handling request {} --> {:?}",
                    full_method,
                    request
                );
                return Err(err.into());
            }
        };

        let Some(matched) = self.matcher.find_match(ctx, full_method, &request_json) else {
            info!(
                method = %full_method,
                request = %request_json,
                outcome = "not_found",
                "No mock response found for {} --> {}",
                full_method,
                request_json
            );
            return Err(HandlerError::NoStubMatched);
        };
        let stub = matched.stub;

        match &stub.response {
            ResponseDefinition::Error { error } => {
                info!(
                    method = %full_method,
                    request = %request_json,
                    stub_id = %stub.id,
                    outcome = "declared_error",
                    error = %error,
                    "Found mock error for {} --> {}",
                    full_method,
                    request_json
                );
                Err(HandlerError::StubDeclared {
                    message: error.clone(),
                })
            }
            ResponseDefinition::Success { content, template } => {
                let built = self.build_response(
                    content,
                    *template,
                    response,
                    ctx,
                    full_method,
                    &request_json,
                    &matched.context,
                );
                match built {
                    Ok(message) => {
                        let rendered = serde_json::to_string(&CanonicalMessage(&message))
                            .unwrap_or_else(|_| format!("{:?}", message));
                        info!(
                            method = %full_method,
                            request = %request_json,
                            stub_id = %stub.id,
                            outcome = "found",
                            response = %rendered,
                            "Found mock response for {} --> {}",
                            full_method,
                            request_json
                        );
                        Ok(message)
                    }
                    Err(err) => {
                        error!(
                            method = %full_method,
                            request = %request_json,
                            stub_id = %stub.id,
                            outcome = "malformed_stub",
                            error = %err,
                            "Error handling request {} --> {}",
                            full_method,
                            request_json
                        );
                        Err(HandlerError::ResponseDecode)
                    }
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn build_response(
        &self,
        content: &serde_json::Value,
        template: bool,
        response: DynamicMessage,
        ctx: &CallContext,
        full_method: &str,
        request_json: &str,
        match_ctx: &MatchContext,
    ) -> Result<DynamicMessage, ResponseBuildError> {
        if template {
            let template_ctx = TemplateContext::new(ctx, full_method, request_json, match_ctx);
            let rendered = self.templates.render_json(content, &template_ctx)?;
            Ok(transform(&rendered, response)?)
        } else {
            Ok(transform(content, response)?)
        }
    }
}
