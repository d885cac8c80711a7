//! Template rendering for config-declared dynamic replies.
//!
//! Config files cannot hold Rust responder closures, so templated bodies are
//! their vehicle for dynamic replies. Rendering happens only after the stub's
//! gate has fired.

use crate::matcher::MatchContext;
use handlebars::Handlebars;
use serde::Serialize;
use std::collections::HashMap;

/// Template engine for rendering dynamic reply bodies.
pub struct TemplateEngine {
    handlebars: Handlebars<'static>,
}

/// Variables visible to a reply template.
#[derive(Debug, Serialize)]
struct TemplateContext<'a> {
    /// Path parameters from URL template matching
    path: &'a HashMap<String, String>,
    /// Query parameters
    query: &'a HashMap<String, String>,
    /// Regex capture groups
    captures: &'a HashMap<String, String>,
    /// Request headers
    headers: &'a HashMap<String, String>,
    method: &'a str,
    request_path: &'a str,
}

impl TemplateEngine {
    /// Create a new template engine.
    pub fn new() -> Self {
        let mut handlebars = Handlebars::new();

        handlebars.register_helper("uuid", Box::new(uuid_helper));
        handlebars.register_helper("now", Box::new(now_helper));
        handlebars.register_helper("default", Box::new(default_helper));

        // Reply bodies are not HTML.
        handlebars.register_escape_fn(handlebars::no_escape);

        Self { handlebars }
    }

    /// Render a template string with the given request context.
    pub fn render(
        &self,
        template: &str,
        match_ctx: &MatchContext,
        method: &str,
        path: &str,
        headers: &HashMap<String, String>,
    ) -> Result<String, handlebars::RenderError> {
        let ctx = TemplateContext {
            path: &match_ctx.path_params,
            query: &match_ctx.query_params,
            captures: &match_ctx.captures,
            headers,
            method,
            request_path: path,
        };
        self.handlebars.render_template(template, &ctx)
    }

    /// Render every templated string field of a JSON value.
    pub fn render_json(
        &self,
        json: &serde_json::Value,
        match_ctx: &MatchContext,
        method: &str,
        path: &str,
        headers: &HashMap<String, String>,
    ) -> Result<serde_json::Value, handlebars::RenderError> {
        let ctx = TemplateContext {
            path: &match_ctx.path_params,
            query: &match_ctx.query_params,
            captures: &match_ctx.captures,
            headers,
            method,
            request_path: path,
        };
        self.render_value(json, &ctx)
    }

    fn render_value(
        &self,
        value: &serde_json::Value,
        ctx: &TemplateContext<'_>,
    ) -> Result<serde_json::Value, handlebars::RenderError> {
        match value {
            serde_json::Value::String(s) if s.contains("{{") => {
                let rendered = self.handlebars.render_template(s, ctx)?;
                Ok(serde_json::Value::String(rendered))
            }
            serde_json::Value::Array(items) => {
                let rendered: Result<Vec<_>, _> =
                    items.iter().map(|item| self.render_value(item, ctx)).collect();
                Ok(serde_json::Value::Array(rendered?))
            }
            serde_json::Value::Object(fields) => {
                let mut rendered = serde_json::Map::new();
                for (key, field) in fields {
                    rendered.insert(key.clone(), self.render_value(field, ctx)?);
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
        rng.gen::<u64>() & 0xffffffffffff,
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
    let format = h
        .param(0)
        .and_then(|v| v.value().as_str())
        .unwrap_or("%Y-%m-%dT%H:%M:%S%.3fZ");
    out.write(&chrono::Utc::now().format(format).to_string())?;
    Ok(())
}

fn default_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    let fallback = h.param(1).and_then(|p| p.value().as_str()).unwrap_or("");
    match h.param(0).map(|p| p.value()) {
        Some(serde_json::Value::String(s)) if !s.is_empty() => out.write(s)?,
        Some(v) if !v.is_null() && !v.is_string() => out.write(&v.to_string())?,
        _ => out.write(fallback)?,
    }
    Ok(())
}
