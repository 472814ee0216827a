use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method};
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::error::FlowError;
use crate::flow::{FlowStep, duration_param};
use crate::state::StateBag;
use crate::template::{self, value_to_text};

const ALLOWED_METHODS: [&str; 7] = ["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD", "OPTIONS"];

/// What an `api_call` step produced, before the status is judged.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    /// Parsed body plus `_status_code` and `_headers`.
    pub value: Value,
    pub body: String,
}

fn build_headers(step: &FlowStep, state: &StateBag) -> Result<HeaderMap, FlowError> {
    let mut headers = HeaderMap::new();
    let Some(raw) = step.params.get("headers") else {
        return Ok(headers);
    };
    let Value::Object(raw) = raw else {
        return Err(FlowError::Config(format!(
            "step `{}`: headers must be an object",
            step.name
        )));
    };
    for (name, value) in raw {
        let value = match value {
            Value::String(s) => template::render(s, state)?,
            other => value_to_text(other),
        };
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| FlowError::Config(format!("header `{name}`: {e}")))?;
        let value = HeaderValue::from_str(&value)
            .map_err(|e| FlowError::Config(format!("header `{name}`: {e}")))?;
        headers.insert(name, value);
    }
    Ok(headers)
}

fn headers_to_json(headers: &HeaderMap) -> Value {
    let mut out = Map::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        match out.get_mut(name.as_str()) {
            Some(Value::String(existing)) => {
                existing.push_str(", ");
                existing.push_str(&value);
            }
            _ => {
                out.insert(name.as_str().to_string(), Value::String(value));
            }
        }
    }
    Value::Object(out)
}

/// Perform the request described by an `api_call` step. Transport failures
/// are errors; any HTTP status is returned for the caller to judge.
pub async fn call_api(
    client: &Client,
    step: &FlowStep,
    state: &StateBag,
    default_timeout: Duration,
) -> Result<ApiResponse, FlowError> {
    let url = step
        .param_str("url")
        .ok_or_else(|| FlowError::Config(format!("api_call step `{}` has no url", step.name)))?;
    let url = template::render(url, state)?;

    let method = match step.params.get("method") {
        None | Some(Value::Null) => "GET".to_string(),
        Some(Value::String(m)) => template::render(m, state)?.trim().to_ascii_uppercase(),
        Some(other) => {
            return Err(FlowError::Config(format!(
                "step `{}`: method must be a string, got {other}",
                step.name
            )));
        }
    };
    if !ALLOWED_METHODS.contains(&method.as_str()) {
        return Err(FlowError::Config(format!(
            "step `{}`: unsupported HTTP method `{method}`",
            step.name
        )));
    }
    let method = Method::from_bytes(method.as_bytes())
        .map_err(|e| FlowError::Config(e.to_string()))?;

    let timeout = if step.params.contains_key("timeout") {
        duration_param(step, "timeout")?
    } else {
        default_timeout
    };

    let mut request = client
        .request(method.clone(), &url)
        .headers(build_headers(step, state)?)
        .timeout(timeout);
    match step.params.get("body") {
        None | Some(Value::Null) => {}
        Some(Value::String(s)) => request = request.body(template::render(s, state)?),
        Some(body) => {
            let bytes = template::render_json(body, state)?;
            request = request
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(bytes);
        }
    }

    debug!(step = %step.name, %method, %url, "api call");
    let resp = request.send().await.map_err(|e| {
        if e.is_timeout() {
            FlowError::Transport(format!("{method} {url} timed out after {timeout:?}"))
        } else {
            FlowError::Transport(format!("{method} {url}: {e}"))
        }
    })?;

    let status = resp.status().as_u16();
    let headers = headers_to_json(resp.headers());
    let body = resp
        .text()
        .await
        .map_err(|e| FlowError::Transport(format!("{method} {url}: reading body: {e}")))?;

    let mut value = if body.trim().is_empty() {
        Map::new()
    } else {
        match serde_json::from_str::<Value>(&body) {
            Ok(Value::Object(map)) => map,
            Ok(other) => {
                let mut map = Map::new();
                map.insert("data".to_string(), other);
                map
            }
            Err(_) => {
                let mut map = Map::new();
                map.insert("body".to_string(), Value::String(body.clone()));
                map
            }
        }
    };
    value.insert("_status_code".to_string(), json!(status));
    value.insert("_headers".to_string(), headers);

    Ok(ApiResponse {
        status,
        value: Value::Object(value),
        body,
    })
}
