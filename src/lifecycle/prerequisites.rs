//! Handler prerequisites, run in sequential groups of concurrent functions.

use std::{collections::HashSet, sync::Arc};

use futures::future::try_join_all;

use crate::{
    core::{Boom, ErrorKind, Flow, Prerequisite, Request, Response, ServerError, ServerResult, Toolkit},
    lifecycle::{protect::protect, validation::FailAction},
};

/// Names a prerequisite may not be assigned to
const RESERVED: [&str; 9] = [
    "params", "query", "payload", "headers", "auth", "pre", "response", "info", "route",
];

#[derive(Clone)]
pub struct Pre {
    method: Arc<dyn Prerequisite>,
    assign: Option<String>,
    fail_action: FailAction,
}

impl Pre {
    pub fn new(method: impl Prerequisite + 'static) -> Self {
        Self {
            method: Arc::new(method),
            assign: None,
            fail_action: FailAction::Error,
        }
    }

    /// Stores the result in `req.pre[name]`.
    pub fn assign(mut self, name: impl Into<String>) -> Self {
        self.assign = Some(name.into());
        self
    }

    pub fn fail_action(mut self, action: FailAction) -> Self {
        self.fail_action = action;
        self
    }
}

#[derive(Clone, Default)]
pub struct PrerequisiteGraph {
    groups: Vec<Vec<Pre>>,
}

impl PrerequisiteGraph {
    pub fn new(groups: Vec<Vec<Pre>>) -> ServerResult<Self> {
        let mut seen = HashSet::new();
        for name in groups.iter().flatten().filter_map(|p| p.assign.as_deref()) {
            if RESERVED.contains(&name) {
                return Err(ServerError::InvalidRoute(format!(
                    "prerequisite cannot be assigned to reserved name '{name}'"
                )));
            }
            if !seen.insert(name) {
                return Err(ServerError::InvalidRoute(format!(
                    "prerequisite name '{name}' is assigned more than once"
                )));
            }
        }

        let groups = groups.into_iter().filter(|g| !g.is_empty()).collect();
        Ok(Self { groups })
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    /// Runs every group in order. A failing prerequisite with the `error`
    /// action aborts its group and the handler; a takeover response ends
    /// the graph after its group.
    pub(crate) async fn run(&self, req: &mut Request, h: &Toolkit) -> Result<Flow, Boom> {
        let expose = h.settings().debug.expose_errors;

        for group in &self.groups {
            let results = {
                let shared: &Request = req;
                try_join_all(group.iter().map(|pre| async move {
                    match protect("prerequisite", pre.method.run(shared, h)).await {
                        Ok(response) => Ok(Ok(response)),
                        Err(boom) if matches!(pre.fail_action, FailAction::Error) => {
                            Err(prerequisite_failed(boom))
                        }
                        Err(boom) => Ok(Err(boom)),
                    }
                }))
                .await?
            };

            let mut takeover: Option<Response> = None;
            for (pre, result) in group.iter().zip(results) {
                let value = match result {
                    Ok(response) => {
                        let value = response.source_value();
                        if response.is_takeover() && takeover.is_none() {
                            takeover = Some(response);
                        }
                        value
                    }
                    Err(boom) => {
                        let envelope = boom.envelope(expose);
                        if let Flow::Respond(response) =
                            pre.fail_action.apply(req, boom, &["pre", "error"])?
                        {
                            return Ok(Flow::Respond(response));
                        }
                        envelope
                    }
                };
                if let Some(name) = &pre.assign {
                    req.pre.insert(name.clone(), value);
                }
            }

            if let Some(response) = takeover {
                return Ok(Flow::Respond(response));
            }
        }

        Ok(Flow::Continue)
    }
}

fn prerequisite_failed(boom: Boom) -> Boom {
    if boom.kind() == ErrorKind::HandlerFailed {
        boom
    } else {
        boom.with_kind(ErrorKind::PrerequisiteFailed)
    }
}
