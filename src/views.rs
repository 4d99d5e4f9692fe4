//! View rendering through a pluggable template engine.

use std::fmt;

use serde_json::Value as JsonValue;

#[derive(Debug, Clone)]
pub struct RenderError(pub String);

impl fmt::Display for RenderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "render error: {}", self.0)
    }
}

impl std::error::Error for RenderError {}

pub trait TemplateEngine: Send + Sync {
    fn render(&self, template: &str, context: &JsonValue) -> Result<String, RenderError>;
}

impl<F> TemplateEngine for F
where
    F: Fn(&str, &JsonValue) -> Result<String, RenderError> + Send + Sync,
{
    fn render(&self, template: &str, context: &JsonValue) -> Result<String, RenderError> {
        self(template, context)
    }
}
