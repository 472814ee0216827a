use std::time::Duration;

use channel_transport::TransportError;
use thiserror::Error;

/// Every failure the engine, the driver and the generators can report.
#[derive(Debug, Error)]
pub enum FlowError {
    #[error("config error: {0}")]
    Config(String),

    #[error("template error: {0}")]
    Template(String),

    #[error("dispatch error: {0}")]
    Dispatch(String),

    #[error("condition error: {0}")]
    Condition(String),

    #[error("function `{function}` failed: {message}")]
    Handler { function: String, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("http {status}: {body}")]
    HttpStatus { status: u16, body: String },

    #[error(transparent)]
    Channel(#[from] TransportError),

    #[error("agent error: {0}")]
    Agent(String),

    #[error("{0}")]
    Validation(String),

    #[error("state error: {message}")]
    State { message: String, retryable: bool },

    #[error("parallel step `{step}` failed: {}", describe_failures(.failures))]
    Parallel {
        step: String,
        failures: Vec<(String, FlowError)>,
    },

    #[error("flow did not finish within {0:?}")]
    Timeout(Duration),
}

fn describe_failures(failures: &[(String, FlowError)]) -> String {
    failures
        .iter()
        .map(|(child, err)| format!("{child}: {err}"))
        .collect::<Vec<_>>()
        .join("; ")
}

impl FlowError {
    pub fn kind(&self) -> &'static str {
        match self {
            FlowError::Config(_) => "config_error",
            FlowError::Template(_) => "template_error",
            FlowError::Dispatch(_) => "dispatch_error",
            FlowError::Condition(_) => "condition_error",
            FlowError::Handler { .. } => "function_error",
            FlowError::Transport(_) | FlowError::HttpStatus { .. } | FlowError::Channel(_) => {
                "transport_error"
            }
            FlowError::Agent(_) => "agent_error",
            FlowError::Validation(_) => "validation_error",
            FlowError::State { .. } => "state_error",
            FlowError::Parallel { .. } => "parallel_error",
            FlowError::Timeout(_) => "timeout",
        }
    }

    /// Whether the same call may succeed when repeated later.
    pub fn is_retryable(&self) -> bool {
        match self {
            FlowError::State { retryable, .. } => *retryable,
            FlowError::Channel(err) => err.is_retryable(),
            FlowError::Transport(_) | FlowError::Timeout(_) => true,
            FlowError::HttpStatus { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    pub fn state(message: impl Into<String>) -> Self {
        FlowError::State {
            message: message.into(),
            retryable: true,
        }
    }
}

impl From<reqwest::Error> for FlowError {
    fn from(err: reqwest::Error) -> Self {
        FlowError::Transport(err.to_string())
    }
}
