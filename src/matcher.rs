//! Stub matching.
//!
//! [`StubsMatcher`] is the capability the handler consults for every call.
//! [`StubMatcher`] is the in-memory implementation built from configured stub
//! definitions.

use crate::config::{GlobalSettings, MetadataMatcher, RequestMatcher, StubDefinition};
use crate::handler::CallContext;
use jsonpath_rust::JsonPath;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;

/// Context captured during matching (for template variables).
#[derive(Debug, Clone, Default)]
pub struct MatchContext {
    /// Regex capture groups from the request text
    pub captures: HashMap<String, String>,
}

/// Result of matching a call against stubs.
#[derive(Debug)]
pub struct MatchResult<'a> {
    /// The matched stub
    pub stub: &'a StubDefinition,
    /// Context captured during matching
    pub context: MatchContext,
}

/// Finds the best stub for a call.
///
/// Implementations are queried concurrently and must not mutate stub storage
/// while matching.
pub trait StubsMatcher: Send + Sync {
    /// Return the single best stub for the call, if any.
    fn find_match(
        &self,
        ctx: &CallContext,
        full_method: &str,
        request_json: &str,
    ) -> Option<MatchResult<'_>>;
}

impl<T: StubsMatcher + ?Sized> StubsMatcher for Arc<T> {
    fn find_match(
        &self,
        ctx: &CallContext,
        full_method: &str,
        request_json: &str,
    ) -> Option<MatchResult<'_>> {
        (**self).find_match(ctx, full_method, request_json)
    }
}

impl<T: StubsMatcher + ?Sized> StubsMatcher for &T {
    fn find_match(
        &self,
        ctx: &CallContext,
        full_method: &str,
        request_json: &str,
    ) -> Option<MatchResult<'_>> {
        (**self).find_match(ctx, full_method, request_json)
    }
}

/// Errors raised while compiling stubs.
#[derive(Debug, thiserror::Error)]
pub enum MatcherError {
    #[error("stub {stub_id}: invalid method glob: {source}")]
    InvalidMethod {
        stub_id: String,
        source: globset::Error,
    },
    #[error("stub {stub_id}: invalid regex: {source}")]
    InvalidRegex {
        stub_id: String,
        source: regex::Error,
    },
    #[error("stub {stub_id}: invalid JSON path {expression}: {reason}")]
    InvalidJsonPath {
        stub_id: String,
        expression: String,
        reason: String,
    },
}

/// Fully-qualified method name or glob.
#[derive(Debug, Clone)]
pub enum MethodPattern {
    Exact(String),
    Glob(globset::GlobMatcher),
}

impl MethodPattern {
    /// Compile a method pattern. Patterns containing glob meta-characters
    /// are treated as globs.
    pub fn new(pattern: &str) -> Result<Self, globset::Error> {
        let pattern = normalize_method(pattern);
        if pattern.contains(['*', '?', '[', '{']) {
            let glob = globset::Glob::new(pattern)?;
            Ok(MethodPattern::Glob(glob.compile_matcher()))
        } else {
            Ok(MethodPattern::Exact(pattern.to_string()))
        }
    }

    pub fn matches(&self, full_method: &str) -> bool {
        let full_method = normalize_method(full_method);
        match self {
            MethodPattern::Exact(name) => name == full_method,
            MethodPattern::Glob(glob) => glob.is_match(full_method),
        }
    }
}

/// Strip the leading `/` used by gRPC paths (`/pkg.Service/Method`).
pub fn normalize_method(full_method: &str) -> &str {
    full_method.strip_prefix('/').unwrap_or(full_method)
}

pub(crate) fn parse_json_path(expression: &str) -> Result<JsonPath, String> {
    JsonPath::try_from(expression).map_err(|e| e.to_string())
}

/// In-memory stub matcher.
///
/// Stubs are tried in descending priority; stubs of equal priority keep their
/// declaration order. The first enabled stub whose method, metadata, and
/// request matchers all accept the call wins.
#[derive(Debug)]
pub struct StubMatcher {
    stubs: Vec<CompiledStub>,
    case_insensitive_metadata: bool,
}

#[derive(Debug)]
struct CompiledStub {
    definition: StubDefinition,
    method: MethodPattern,
    request: Option<CompiledRequest>,
    metadata: Vec<(String, CompiledMetadataMatcher)>,
}

#[derive(Debug)]
enum CompiledRequest {
    Exact(serde_json::Value),
    Partial(serde_json::Value),
    Regex(Regex),
    JsonPath(Vec<(String, serde_json::Value)>),
}

#[derive(Debug)]
enum CompiledMetadataMatcher {
    Exact(String),
    Regex(Regex),
    Present,
    Absent,
    Contains(String),
}

impl StubMatcher {
    /// Compile stub definitions into a matcher.
    pub fn new(
        stubs: Vec<StubDefinition>,
        settings: &GlobalSettings,
    ) -> Result<Self, MatcherError> {
        let mut compiled = stubs
            .into_iter()
            .map(|stub| compile_stub(stub, settings))
            .collect::<Result<Vec<_>, _>>()?;

        // Sort by priority (highest first); sort_by is stable
        compiled.sort_by(|a, b| b.definition.priority.cmp(&a.definition.priority));

        Ok(Self {
            stubs: compiled,
            case_insensitive_metadata: settings.case_insensitive_metadata,
        })
    }

    /// Number of compiled stubs.
    pub(crate) fn len(&self) -> usize {
        self.stubs.len()
    }

    fn matches_stub(
        &self,
        stub: &CompiledStub,
        ctx: &CallContext,
        full_method: &str,
        request_json: &str,
        request: Option<&serde_json::Value>,
    ) -> Option<MatchContext> {
        let mut context = MatchContext::default();

        if !stub.method.matches(full_method) {
            return None;
        }

        for (key, matcher) in &stub.metadata {
            if !self.matches_metadata(&ctx.metadata, key, matcher) {
                return None;
            }
        }

        match &stub.request {
            None => {}
            Some(CompiledRequest::Exact(content)) => {
                if !request.is_some_and(|r| json_eq(content, r)) {
                    return None;
                }
            }
            Some(CompiledRequest::Partial(content)) => {
                if !request.is_some_and(|r| is_subset(content, r)) {
                    return None;
                }
            }
            Some(CompiledRequest::Regex(regex)) => {
                let captures = regex.captures(request_json)?;
                for (i, cap) in captures.iter().enumerate().skip(1) {
                    if let Some(m) = cap {
                        context.captures.insert(format!("{}", i), m.as_str().to_string());
                    }
                }
                // Also add named captures
                for name in regex.capture_names().flatten() {
                    if let Some(m) = captures.name(name) {
                        context.captures.insert(name.to_string(), m.as_str().to_string());
                    }
                }
            }
            Some(CompiledRequest::JsonPath(expressions)) => {
                if !request.is_some_and(|r| matches_json_paths(r, expressions)) {
                    return None;
                }
            }
        }

        Some(context)
    }

    fn matches_metadata(
        &self,
        metadata: &HashMap<String, String>,
        key: &str,
        matcher: &CompiledMetadataMatcher,
    ) -> bool {
        let value = if self.case_insensitive_metadata {
            metadata
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(key))
                .map(|(_, v)| v)
        } else {
            metadata.get(key)
        };

        match matcher {
            CompiledMetadataMatcher::Exact(expected) => value == Some(expected),
            CompiledMetadataMatcher::Regex(regex) => value.is_some_and(|v| regex.is_match(v)),
            CompiledMetadataMatcher::Present => value.is_some(),
            CompiledMetadataMatcher::Absent => value.is_none(),
            CompiledMetadataMatcher::Contains(needle) => {
                value.is_some_and(|v| v.contains(needle.as_str()))
            }
        }
    }
}

impl StubsMatcher for StubMatcher {
    fn find_match(
        &self,
        ctx: &CallContext,
        full_method: &str,
        request_json: &str,
    ) -> Option<MatchResult<'_>> {
        let request: Option<serde_json::Value> = serde_json::from_str(request_json).ok();

        self.stubs
            .iter()
            .filter(|stub| stub.definition.enabled)
            .find_map(|stub| {
                self.matches_stub(stub, ctx, full_method, request_json, request.as_ref())
                    .map(|context| MatchResult {
                        stub: &stub.definition,
                        context,
                    })
            })
    }
}

fn compile_stub(
    definition: StubDefinition,
    settings: &GlobalSettings,
) -> Result<CompiledStub, MatcherError> {
    let method = MethodPattern::new(&definition.method).map_err(|source| {
        MatcherError::InvalidMethod {
            stub_id: definition.id.clone(),
            source,
        }
    })?;

    let invalid_regex = |source| MatcherError::InvalidRegex {
        stub_id: definition.id.clone(),
        source,
    };

    let request = match &definition.request {
        None => None,
        Some(RequestMatcher::Exact { content }) => Some(CompiledRequest::Exact(content.clone())),
        Some(RequestMatcher::Partial { content }) => {
            Some(CompiledRequest::Partial(content.clone()))
        }
        Some(RequestMatcher::Regex { pattern }) => Some(CompiledRequest::Regex(
            Regex::new(pattern).map_err(invalid_regex)?,
        )),
        Some(RequestMatcher::JsonPath { expressions }) => {
            let mut compiled = Vec::with_capacity(expressions.len());
            for (expression, expected) in expressions {
                parse_json_path(expression).map_err(|reason| MatcherError::InvalidJsonPath {
                    stub_id: definition.id.clone(),
                    expression: expression.clone(),
                    reason,
                })?;
                compiled.push((expression.clone(), expected.clone()));
            }
            Some(CompiledRequest::JsonPath(compiled))
        }
    };

    let mut metadata = Vec::with_capacity(definition.metadata.len());
    for (key, matcher) in &definition.metadata {
        let key = if settings.case_insensitive_metadata {
            key.to_lowercase()
        } else {
            key.clone()
        };
        let compiled = match matcher {
            MetadataMatcher::Exact { value } => CompiledMetadataMatcher::Exact(value.clone()),
            MetadataMatcher::Regex { pattern } => {
                CompiledMetadataMatcher::Regex(Regex::new(pattern).map_err(invalid_regex)?)
            }
            MetadataMatcher::Present => CompiledMetadataMatcher::Present,
            MetadataMatcher::Absent => CompiledMetadataMatcher::Absent,
            MetadataMatcher::Contains { value } => {
                CompiledMetadataMatcher::Contains(value.clone())
            }
        };
        metadata.push((key, compiled));
    }

    Ok(CompiledStub {
        definition,
        method,
        request,
        metadata,
    })
}

/// Whether every field of `expected` is present in `actual` with an equal
/// value, recursing into objects. Arrays and scalars must be equal.
fn is_subset(expected: &serde_json::Value, actual: &serde_json::Value) -> bool {
    match (expected, actual) {
        (serde_json::Value::Object(want), serde_json::Value::Object(have)) => want
            .iter()
            .all(|(k, v)| have.get(k).is_some_and(|h| is_subset(v, h))),
        _ => json_eq(expected, actual),
    }
}

/// JSON equality where numbers compare by value, so `1` equals `1.0`.
fn json_eq(a: &serde_json::Value, b: &serde_json::Value) -> bool {
    match (a, b) {
        (serde_json::Value::Number(x), serde_json::Value::Number(y)) => {
            if x.is_f64() || y.is_f64() {
                x.as_f64() == y.as_f64()
            } else {
                x == y
            }
        }
        (serde_json::Value::Array(x), serde_json::Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(a, b)| json_eq(a, b))
        }
        (serde_json::Value::Object(x), serde_json::Value::Object(y)) => {
            x.len() == y.len()
                && x.iter().all(|(k, v)| y.get(k).is_some_and(|w| json_eq(v, w)))
        }
        _ => a == b,
    }
}

fn matches_json_paths(json: &serde_json::Value, expressions: &[(String, serde_json::Value)]) -> bool {
    for (path_expr, expected) in expressions {
        let path = match parse_json_path(path_expr) {
            Ok(p) => p,
            Err(_) => return false,
        };

        let results = path.find(json);

        // A null expectation only checks that the path resolves to something
        let matches = match (&results, expected) {
            (serde_json::Value::Null, _) => false,
            (serde_json::Value::Array(found), serde_json::Value::Null) => !found.is_empty(),
            (_, serde_json::Value::Null) => true,
            (serde_json::Value::Array(found), _) => {
                found.iter().any(|v| json_eq(v, expected)) || json_eq(&results, expected)
            }
            _ => json_eq(&results, expected),
        };
        if !matches {
            return false;
        }
    }
    true
}
