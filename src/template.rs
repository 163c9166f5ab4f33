//! Template engine for dynamic responses.
//!
//! Uses Handlebars for rendering string fields of stub content with the call
//! as context.

use crate::handler::CallContext;
use crate::matcher::MatchContext;
use handlebars::{Handlebars, RenderError, RenderErrorReason};
use serde::Serialize;
use std::collections::HashMap;

/// Template engine for rendering dynamic responses.
pub struct TemplateEngine {
    handlebars: Handlebars<'static>,
}

/// Context for template rendering.
#[derive(Debug, Serialize)]
pub struct TemplateContext {
    /// Fully-qualified method name
    pub method: String,
    /// Request as JSON
    pub request: serde_json::Value,
    /// Call metadata
    pub metadata: HashMap<String, String>,
    /// Regex capture groups
    pub captures: HashMap<String, String>,
}

impl TemplateContext {
    /// Build a context from a call and its canonical request text.
    pub fn new(
        ctx: &CallContext,
        full_method: &str,
        request_json: &str,
        match_ctx: &MatchContext,
    ) -> Self {
        Self {
            method: full_method.to_string(),
            request: serde_json::from_str(request_json).unwrap_or(serde_json::Value::Null),
            metadata: ctx.metadata.clone(),
            captures: match_ctx.captures.clone(),
        }
    }
}

impl TemplateEngine {
    /// Create a new template engine.
    pub fn new() -> Self {
        let mut handlebars = Handlebars::new();

        // Register custom helpers
        handlebars.register_helper("json", Box::new(json_helper));
        handlebars.register_helper("uuid", Box::new(uuid_helper));
        handlebars.register_helper("now", Box::new(now_helper));
        handlebars.register_helper("random", Box::new(random_helper));
        handlebars.register_helper("default", Box::new(default_helper));
        handlebars.register_helper("upper", Box::new(upper_helper));
        handlebars.register_helper("lower", Box::new(lower_helper));

        // Output is JSON text, not HTML
        handlebars.register_escape_fn(handlebars::no_escape);

        Self { handlebars }
    }

    /// Render a template string with the given context.
    pub fn render(&self, template: &str, ctx: &TemplateContext) -> Result<String, RenderError> {
        self.handlebars.render_template(template, ctx)
    }

    /// Render a JSON value with templates in string fields.
    pub fn render_json(
        &self,
        value: &serde_json::Value,
        ctx: &TemplateContext,
    ) -> Result<serde_json::Value, RenderError> {
        match value {
            serde_json::Value::String(s) => {
                // Check if it contains template syntax
                if s.contains("{{") {
                    let rendered = self.handlebars.render_template(s, ctx)?;
                    Ok(serde_json::Value::String(rendered))
                } else {
                    Ok(value.clone())
                }
            }
            serde_json::Value::Array(arr) => {
                let rendered: Result<Vec<_>, _> =
                    arr.iter().map(|v| self.render_json(v, ctx)).collect();
                Ok(serde_json::Value::Array(rendered?))
            }
            serde_json::Value::Object(obj) => {
                let mut rendered = serde_json::Map::new();
                for (k, v) in obj {
                    rendered.insert(k.clone(), self.render_json(v, ctx)?);
                }
                Ok(serde_json::Value::Object(rendered))
            }
            _ => Ok(value.clone()),
        }
    }
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

// Custom Handlebars helpers

fn json_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    match h.param(0).map(|v| v.value()) {
        Some(serde_json::Value::String(s)) => out.write(s)?,
        Some(value) => out.write(&value.to_string())?,
        None => {}
    }
    Ok(())
}

fn uuid_helper(
    _: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let uuid = format!(
        "{:08x}-{:04x}-4{:03x}-{:04x}-{:012x}",
        rng.gen::<u32>(),
        rng.gen::<u16>(),
        rng.gen::<u16>() & 0x0fff,
        (rng.gen::<u16>() & 0x3fff) | 0x8000,
        rng.gen::<u64>() & 0xffff_ffff_ffff,
    );
    out.write(&uuid)?;
    Ok(())
}

fn now_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    use chrono::Utc;
    use std::fmt::Write;

    let format = h
        .param(0)
        .and_then(|v| v.value().as_str())
        .unwrap_or("%Y-%m-%dT%H:%M:%S%.3fZ");

    let mut rendered = String::new();
    write!(rendered, "{}", Utc::now().format(format)).map_err(|_| {
        RenderError::from(RenderErrorReason::Other(format!(
            "invalid time format {:?}",
            format
        )))
    })?;
    out.write(&rendered)?;
    Ok(())
}

fn random_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    use rand::Rng;

    let a = h.param(0).and_then(|v| v.value().as_i64()).unwrap_or(0);
    let b = h.param(1).and_then(|v| v.value().as_i64()).unwrap_or(100);
    let (min, max) = if a <= b { (a, b) } else { (b, a) };

    let mut rng = rand::thread_rng();
    let value = rng.gen_range(min..=max);
    out.write(&value.to_string())?;
    Ok(())
}

fn default_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    let value = h.param(0).map(|v| v.value());
    let default = h.param(1).and_then(|v| v.value().as_str()).unwrap_or("");

    match value {
        Some(serde_json::Value::String(s)) if !s.is_empty() => out.write(s)?,
        Some(v) if !v.is_null() && !v.is_string() => out.write(&v.to_string())?,
        _ => out.write(default)?,
    }
    Ok(())
}

fn upper_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    let value = h.param(0).and_then(|v| v.value().as_str()).unwrap_or("");
    out.write(&value.to_uppercase())?;
    Ok(())
}

fn lower_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    let value = h.param(0).and_then(|v| v.value().as_str()).unwrap_or("");
    out.write(&value.to_lowercase())?;
    Ok(())
}
