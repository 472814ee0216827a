use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use futures::future::BoxFuture;
use serde_json::{Map, Value, json};
use tokio::task::JoinSet;
use tracing::{Instrument, debug, info, warn};

use crate::condition::Condition;
use crate::config::EngineConfig;
use crate::error::FlowError;
use crate::flow::http::call_api;
use crate::flow::{FlowDefinition, FlowStep, StepType, duration_param};
use crate::registry::{FunctionRegistry, IntoEngineHandler, IntoHandler, STORE_RESULT};
use crate::state::StateBag;

pub const LAST_EXECUTED_STEP: &str = "last_executed_step";
pub const LAST_EXECUTION_TIME: &str = "last_execution_time";
pub const LAST_ERROR: &str = "last_error";

/// How an execution ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Completed,
    /// Stopped at a `wait_input` step; resume with `execute_from`.
    AwaitingInput { step: String },
}

enum Next {
    Follow,
    Jump(String),
    Suspend,
}

/// Runs a [`FlowDefinition`] against a shared [`StateBag`].
///
/// Cloning is cheap and clones share registry, definition and state; this is
/// how parallel children and engine-aware handlers see the same execution.
#[derive(Clone)]
pub struct FlowEngine {
    registry: Arc<FunctionRegistry>,
    flow: Arc<FlowDefinition>,
    state: StateBag,
    http: reqwest::Client,
    config: Arc<EngineConfig>,
}

impl std::fmt::Debug for FlowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowEngine")
            .field("steps", &self.flow.steps().len())
            .field("functions", &self.registry.names())
            .field("state_keys", &self.state.len())
            .finish()
    }
}

impl FlowEngine {
    /// Engine with the builtin functions registered.
    pub fn new(config: EngineConfig) -> Self {
        Self::with_registry(FunctionRegistry::with_builtins(), config)
    }

    pub fn with_registry(registry: Arc<FunctionRegistry>, config: EngineConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()
            .unwrap_or_default();
        Self {
            registry,
            flow: Arc::new(FlowDefinition::default()),
            state: StateBag::new(),
            http,
            config: Arc::new(config),
        }
    }

    /// Replace the state bag; the engine then shares `state` with the caller.
    pub fn with_state(mut self, state: StateBag) -> Self {
        self.state = state;
        self
    }

    pub fn seed(&self, values: Map<String, Value>) {
        self.state.extend(values);
    }

    pub fn state(&self) -> &StateBag {
        &self.state
    }

    pub fn registry(&self) -> &Arc<FunctionRegistry> {
        &self.registry
    }

    pub fn definition(&self) -> &FlowDefinition {
        &self.flow
    }

    pub fn register_function<Args, F: IntoHandler<Args>>(&self, name: impl Into<String>, f: F) {
        self.registry.register(name, f);
    }

    pub fn register_engine_function<Args, F: IntoEngineHandler<Args>>(
        &self,
        name: impl Into<String>,
        f: F,
    ) {
        self.registry.register_with_engine(name, f);
    }

    pub fn load_flow(&mut self, json: &str) -> Result<(), FlowError> {
        self.load_definition(FlowDefinition::from_json(json)?);
        Ok(())
    }

    pub fn load_definition(&mut self, definition: FlowDefinition) {
        info!(steps = definition.steps().len(), "flow loaded");
        self.flow = Arc::new(definition);
    }

    /// Run from the first step until the routing runs out.
    pub async fn execute(&self) -> Result<ExecutionOutcome, FlowError> {
        let Some(first) = self.flow.first().cloned() else {
            debug!("empty flow, nothing to execute");
            return Ok(ExecutionOutcome::Completed);
        };
        self.run_chain(first).await
    }

    /// Run from the named step, e.g. to resume after `wait_input`.
    pub async fn execute_from(&self, name: &str) -> Result<ExecutionOutcome, FlowError> {
        let step = self
            .flow
            .get(name)
            .cloned()
            .ok_or_else(|| FlowError::Config(format!("unknown step `{name}`")))?;
        self.run_chain(step).await
    }

    /// Run `step` and then follow its routing through the loaded definition.
    pub async fn execute_single(&self, step: &FlowStep) -> Result<ExecutionOutcome, FlowError> {
        self.run_chain(step.clone()).await
    }

    /// Like [`execute`](Self::execute) but gives up after `deadline`. Parallel
    /// children still running at that point are aborted.
    pub async fn execute_with_deadline(
        &self,
        deadline: Duration,
    ) -> Result<ExecutionOutcome, FlowError> {
        match tokio::time::timeout(deadline, self.execute()).await {
            Ok(outcome) => outcome,
            Err(_) => {
                let err = FlowError::Timeout(deadline);
                self.record_error("<deadline>", &err);
                Err(err)
            }
        }
    }

    fn run_chain(&self, start: FlowStep) -> BoxFuture<'_, Result<ExecutionOutcome, FlowError>> {
        Box::pin(async move {
            let mut current = start;
            let mut executed = 0usize;
            loop {
                executed += 1;
                if executed > self.config.max_steps {
                    return Err(FlowError::Config(format!(
                        "flow exceeded {} steps at `{}`; check routing for cycles",
                        self.config.max_steps, current.name
                    )));
                }

                let outcome = self.run_step(&current).await;
                self.record_step(&current.name);
                info!(
                    target: "event",
                    event = "step_executed",
                    step = %current.name,
                    kind = ?current.step_type,
                    success = outcome.is_ok()
                );

                let target = match outcome {
                    Ok(Next::Suspend) => {
                        return Ok(ExecutionOutcome::AwaitingInput {
                            step: current.name,
                        });
                    }
                    Ok(Next::Jump(target)) => Some(target),
                    Ok(Next::Follow) => current.on_success().map(str::to_string),
                    Err(err) => {
                        self.record_error(&current.name, &err);
                        match current.on_error() {
                            Some(target) => {
                                warn!(step = %current.name, error = %err, next = target, "step failed, routing to error step");
                                Some(target.to_string())
                            }
                            None => return Err(err),
                        }
                    }
                };

                let Some(target) = target else {
                    return Ok(ExecutionOutcome::Completed);
                };
                current = self.flow.get(&target).cloned().ok_or_else(|| {
                    FlowError::Config(format!(
                        "step `{}` routes to unknown step `{target}`",
                        current.name
                    ))
                })?;
            }
        })
    }

    #[tracing::instrument(name = "step", skip(self, step), fields(step = %step.name, kind = ?step.step_type))]
    async fn run_step(&self, step: &FlowStep) -> Result<Next, FlowError> {
        match step.step_type {
            StepType::Function => {
                let function = step.function.as_deref().filter(|f| !f.is_empty()).ok_or_else(|| {
                    FlowError::Config(format!("function step `{}` names no function", step.name))
                })?;
                self.registry.invoke(function, &step.params, self).await?;
                Ok(Next::Follow)
            }
            StepType::ApiCall => {
                let response = call_api(&self.http, step, &self.state, self.config.http_timeout).await?;
                if let Some(key) = step.param_str(STORE_RESULT) {
                    self.state.set(key, response.value);
                }
                if response.status >= 400 {
                    return Err(FlowError::HttpStatus {
                        status: response.status,
                        body: response.body,
                    });
                }
                Ok(Next::Follow)
            }
            StepType::Conditional => {
                let expr = step.param_str("condition").ok_or_else(|| {
                    FlowError::Config(format!("conditional step `{}` has no condition", step.name))
                })?;
                let holds = Condition::parse(expr)?.evaluate(&self.state)?;
                let branch = if holds { "true_step" } else { "false_step" };
                debug!(condition = expr, holds, "condition evaluated");
                match step.param_str(branch).filter(|t| !t.is_empty()) {
                    Some(target) => Ok(Next::Jump(target.to_string())),
                    None => Ok(Next::Follow),
                }
            }
            StepType::Delay => {
                let duration = duration_param(step, "duration")?;
                tokio::time::sleep(duration).await;
                Ok(Next::Follow)
            }
            StepType::Parallel => {
                self.run_parallel(step).await?;
                Ok(Next::Follow)
            }
            StepType::WaitInput => Ok(Next::Suspend),
        }
    }

    /// Run every child chain concurrently and wait for all of them. Children
    /// share the state bag; their failures are reported together.
    async fn run_parallel(&self, step: &FlowStep) -> Result<(), FlowError> {
        let names = step.parallel_children()?;
        if names.is_empty() {
            return Ok(());
        }
        let mut children = Vec::with_capacity(names.len());
        for name in &names {
            let child = self.flow.get(name).cloned().ok_or_else(|| {
                FlowError::Config(format!(
                    "parallel step `{}` lists unknown step `{name}`",
                    step.name
                ))
            })?;
            children.push(child);
        }

        let writers = Arc::new(DashMap::new());
        let mut tasks = JoinSet::new();
        for (index, child) in children.into_iter().enumerate() {
            let engine = self.clone();
            let writers = writers.clone();
            let branch = child.name.clone();
            tasks.spawn(
                async move {
                    let outcome =
                        StateBag::in_branch(branch, writers, engine.run_chain(child)).await;
                    (index, outcome)
                }
                .in_current_span(),
            );
        }

        let mut reported = vec![false; names.len()];
        let mut failures: Vec<(usize, FlowError)> = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, outcome)) => {
                    reported[index] = true;
                    if let Err(err) = outcome {
                        failures.push((index, err));
                    }
                }
                Err(join_err) => warn!(error = %join_err, "parallel child task aborted"),
            }
        }
        for (index, seen) in reported.iter().enumerate() {
            if !seen {
                failures.push((index, FlowError::Handler {
                    function: names[index].clone(),
                    message: "child task panicked".to_string(),
                }));
            }
        }

        if failures.is_empty() {
            return Ok(());
        }
        failures.sort_by_key(|(index, _)| *index);
        Err(FlowError::Parallel {
            step: step.name.clone(),
            failures: failures
                .into_iter()
                .map(|(index, err)| (names[index].clone(), err))
                .collect(),
        })
    }

    fn record_step(&self, name: &str) {
        self.state.set_untracked(LAST_EXECUTED_STEP, json!(name));
        self.state
            .set_untracked(LAST_EXECUTION_TIME, json!(Utc::now().to_rfc3339()));
    }

    fn record_error(&self, name: &str, err: &FlowError) {
        self.state.set_untracked(
            LAST_ERROR,
            json!({
                "step": name,
                "kind": err.kind(),
                "error": err.to_string(),
                "time": Utc::now().to_rfc3339(),
            }),
        );
    }
}
