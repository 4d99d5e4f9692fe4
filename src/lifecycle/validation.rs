//! Input validation for headers, params, query and payload.

use std::{fmt, sync::Arc};

use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Map, Value as JsonValue};
use validator::Validate;

use crate::{
    core::{Boom, ErrorKind, Flow, Request},
    lifecycle::protect::protect,
};

/// A rejected input
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationFailure {
    pub message: String,
    /// Offending keys, outermost first
    pub keys: Vec<String>,
}

impl ValidationFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            keys: Vec::new(),
        }
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.keys.push(key.into());
        self
    }
}

impl fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Validates (and possibly converts) one input source.
pub trait Validator: Send + Sync {
    fn validate(&self, value: &JsonValue) -> Result<JsonValue, ValidationFailure>;
}

impl<F> Validator for F
where
    F: Fn(&JsonValue) -> Result<JsonValue, ValidationFailure> + Send + Sync,
{
    fn validate(&self, value: &JsonValue) -> Result<JsonValue, ValidationFailure> {
        self(value)
    }
}

/// Validation through a serde type carrying `validator` rules.
pub struct Typed<T>(std::marker::PhantomData<fn() -> T>);

impl<T> Typed<T> {
    pub fn new() -> Self {
        Self(std::marker::PhantomData)
    }
}

impl<T> Default for Typed<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Validator for Typed<T>
where
    T: DeserializeOwned + Serialize + Validate,
{
    fn validate(&self, value: &JsonValue) -> Result<JsonValue, ValidationFailure> {
        let typed: T = serde_json::from_value(value.clone())
            .map_err(|e| ValidationFailure::new(e.to_string()))?;

        if let Err(errors) = typed.validate() {
            let mut keys: Vec<String> = errors
                .field_errors()
                .keys()
                .map(|k| k.to_string())
                .collect();
            keys.sort();
            return Err(ValidationFailure {
                message: errors.to_string(),
                keys,
            });
        }

        serde_json::to_value(typed).map_err(|e| ValidationFailure::new(e.to_string()))
    }
}

/// Custom failure handler, may substitute a response
pub type CustomFailAction = Arc<dyn Fn(&mut Request, &Boom) -> Result<Flow, Boom> + Send + Sync>;

/// What to do with a failed validation or prerequisite
#[derive(Clone, Default)]
pub enum FailAction {
    #[default]
    Error,
    Log,
    Ignore,
    Custom(CustomFailAction),
}

impl FailAction {
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&mut Request, &Boom) -> Result<Flow, Boom> + Send + Sync + 'static,
    {
        FailAction::Custom(Arc::new(f))
    }

    /// Applies the action to `boom`. `Ok(Flow::Continue)` resumes the
    /// lifecycle.
    pub(crate) fn apply(&self, req: &mut Request, boom: Boom, tags: &[&str]) -> Result<Flow, Boom> {
        match self {
            FailAction::Error => Err(boom),
            FailAction::Log => {
                log::info!("request {} {}: {boom}", req.id, tags.join(" "));
                req.log(tags, boom.envelope(true));
                Ok(Flow::Continue)
            }
            FailAction::Ignore => Ok(Flow::Continue),
            FailAction::Custom(f) => f(req, &boom),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputSource {
    Headers,
    Params,
    Query,
    Payload,
}

impl InputSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            InputSource::Headers => "headers",
            InputSource::Params => "params",
            InputSource::Query => "query",
            InputSource::Payload => "payload",
        }
    }
}

/// Validators attached to a route
#[derive(Clone, Default)]
pub struct RouteValidation {
    pub headers: Option<Arc<dyn Validator>>,
    pub params: Option<Arc<dyn Validator>>,
    pub query: Option<Arc<dyn Validator>>,
    pub payload: Option<Arc<dyn Validator>>,
    pub fail_action: FailAction,
}

impl RouteValidation {
    pub fn is_empty(&self) -> bool {
        self.headers.is_none()
            && self.params.is_none()
            && self.query.is_none()
            && self.payload.is_none()
    }

    /// Validates every configured source in order: headers, params, query,
    /// payload. Converted values replace the originals.
    pub(crate) async fn run(&self, req: &mut Request) -> Result<Flow, Boom> {
        let sources = [
            (InputSource::Headers, &self.headers),
            (InputSource::Params, &self.params),
            (InputSource::Query, &self.query),
            (InputSource::Payload, &self.payload),
        ];

        for (source, validator) in sources {
            let Some(validator) = validator else {
                continue;
            };

            let input = read_source(req, source);
            let what = format!("{} validator", source.as_str());
            let outcome = protect(&what, async {
                Ok::<_, Boom>(validator.validate(&input))
            })
            .await?;

            match outcome {
                Ok(value) => write_source(req, source, value),
                Err(failure) => {
                    let boom = Boom::bad_request(failure.message.clone())
                        .with_kind(ErrorKind::ValidationFailed)
                        .with_data(
                            "validation",
                            json!({"source": source.as_str(), "keys": failure.keys}),
                        );
                    match self
                        .fail_action
                        .apply(req, boom, &["validation", "error", source.as_str()])?
                    {
                        Flow::Continue => {}
                        flow @ Flow::Respond(_) => return Ok(flow),
                    }
                }
            }
        }

        Ok(Flow::Continue)
    }
}

fn read_source(req: &Request, source: InputSource) -> JsonValue {
    match source {
        InputSource::Headers => {
            let mut map = Map::new();
            for (name, value) in &req.headers {
                if let Ok(v) = value.to_str() {
                    map.entry(name.as_str().to_string())
                        .or_insert_with(|| JsonValue::String(v.to_string()));
                }
            }
            JsonValue::Object(map)
        }
        InputSource::Params => string_map(req.params.iter()),
        InputSource::Query => string_map(req.query.iter()),
        InputSource::Payload => req.payload.clone().unwrap_or(JsonValue::Null),
    }
}

fn string_map<'a>(entries: impl Iterator<Item = (&'a String, &'a String)>) -> JsonValue {
    JsonValue::Object(
        entries
            .map(|(k, v)| (k.clone(), JsonValue::String(v.clone())))
            .collect(),
    )
}

fn write_source(req: &mut Request, source: InputSource, value: JsonValue) {
    let target = match source {
        InputSource::Headers => return,
        InputSource::Payload => {
            req.payload = Some(value);
            return;
        }
        InputSource::Params => &mut req.params,
        InputSource::Query => &mut req.query,
    };

    if let JsonValue::Object(map) = value {
        target.clear();
        for (k, v) in map {
            let v = match v {
                JsonValue::String(s) => s,
                other => other.to_string(),
            };
            target.insert(k, v);
        }
    }
}
