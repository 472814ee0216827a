use std::collections::BTreeMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::error::FlowError;
use crate::flow::engine::FlowEngine;
use crate::template::{self, value_to_text};

/// Parameter naming the state key a step's result is written to.
pub const STORE_RESULT: &str = "_store_result";

/// Why an adapted handler did not produce a value.
#[derive(Debug)]
pub enum HandlerFailure {
    /// An argument could not be converted to the declared parameter type.
    Coercion { index: usize, message: String },
    /// The handler itself returned an error.
    Failed(String),
}

pub type HandlerFuture = BoxFuture<'static, Result<Value, HandlerFailure>>;
pub type PlainFn = Arc<dyn Fn(Vec<Value>) -> HandlerFuture + Send + Sync>;
pub type EngineFn = Arc<dyn Fn(FlowEngine, Vec<Value>) -> HandlerFuture + Send + Sync>;

/// A registered function with its declared arity.
#[derive(Clone)]
pub enum Handler {
    Plain { arity: usize, call: PlainFn },
    /// Receives the calling engine ahead of its positional arguments.
    WithEngine { arity: usize, call: EngineFn },
}

impl Handler {
    pub fn arity(&self) -> usize {
        match self {
            Handler::Plain { arity, .. } | Handler::WithEngine { arity, .. } => *arity,
        }
    }
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Handler::Plain { arity, .. } => write!(f, "Handler::Plain(arity={arity})"),
            Handler::WithEngine { arity, .. } => write!(f, "Handler::WithEngine(arity={arity})"),
        }
    }
}

/// Convert one positional argument. Strings holding a JSON scalar and scalars
/// expected as strings are converted across.
pub fn coerce_arg<T: DeserializeOwned>(value: Value, index: usize) -> Result<T, HandlerFailure> {
    let first = match serde_json::from_value::<T>(value.clone()) {
        Ok(v) => return Ok(v),
        Err(e) => e,
    };
    let alternate = match &value {
        Value::String(s) => serde_json::from_str::<Value>(s.trim()).ok(),
        Value::Number(_) | Value::Bool(_) => Some(Value::String(value_to_text(&value))),
        _ => None,
    };
    alternate
        .and_then(|alt| serde_json::from_value::<T>(alt).ok())
        .ok_or_else(|| HandlerFailure::Coercion {
            index,
            message: first.to_string(),
        })
}

fn to_result<R: Serialize, E: Display>(out: Result<R, E>) -> Result<Value, HandlerFailure> {
    let value = out.map_err(|e| HandlerFailure::Failed(e.to_string()))?;
    serde_json::to_value(value).map_err(|e| HandlerFailure::Failed(e.to_string()))
}

/// Adapts an async function over deserializable arguments into a [`Handler`].
pub trait IntoHandler<Args>: Send + Sync + 'static {
    fn into_handler(self) -> Handler;
}

/// Like [`IntoHandler`] for functions whose first parameter is the engine.
pub trait IntoEngineHandler<Args>: Send + Sync + 'static {
    fn into_handler(self) -> Handler;
}

macro_rules! count {
    () => { 0usize };
    ($head:ident $($tail:ident)*) => { 1usize + count!($($tail)*) };
}

macro_rules! impl_handlers {
    ($(($ty:ident, $var:ident, $idx:tt)),*) => {
        impl<F, Fut, R, E, $($ty,)*> IntoHandler<($($ty,)*)> for F
        where
            F: Fn($($ty),*) -> Fut + Send + Sync + 'static,
            Fut: Future<Output = Result<R, E>> + Send + 'static,
            R: Serialize,
            E: Display,
            $($ty: DeserializeOwned + Send + 'static,)*
        {
            #[allow(unused_mut, unused_variables)]
            fn into_handler(self) -> Handler {
                let f = Arc::new(self);
                Handler::Plain {
                    arity: count!($($ty)*),
                    call: Arc::new(move |args: Vec<Value>| -> HandlerFuture {
                        let f = f.clone();
                        Box::pin(async move {
                            let mut args = args.into_iter();
                            $(let $var: $ty = coerce_arg(args.next().unwrap_or(Value::Null), $idx)?;)*
                            to_result(f($($var),*).await)
                        })
                    }),
                }
            }
        }

        impl<F, Fut, R, E, $($ty,)*> IntoEngineHandler<($($ty,)*)> for F
        where
            F: Fn(FlowEngine, $($ty),*) -> Fut + Send + Sync + 'static,
            Fut: Future<Output = Result<R, E>> + Send + 'static,
            R: Serialize,
            E: Display,
            $($ty: DeserializeOwned + Send + 'static,)*
        {
            #[allow(unused_mut, unused_variables)]
            fn into_handler(self) -> Handler {
                let f = Arc::new(self);
                Handler::WithEngine {
                    arity: count!($($ty)*),
                    call: Arc::new(move |engine: FlowEngine, args: Vec<Value>| -> HandlerFuture {
                        let f = f.clone();
                        Box::pin(async move {
                            let mut args = args.into_iter();
                            $(let $var: $ty = coerce_arg(args.next().unwrap_or(Value::Null), $idx)?;)*
                            to_result(f(engine, $($var),*).await)
                        })
                    }),
                }
            }
        }
    };
}

impl_handlers!();
impl_handlers!((A0, a0, 0));
impl_handlers!((A0, a0, 0), (A1, a1, 1));
impl_handlers!((A0, a0, 0), (A1, a1, 1), (A2, a2, 2));
impl_handlers!((A0, a0, 0), (A1, a1, 1), (A2, a2, 2), (A3, a3, 3));

/// Name-to-handler table shared by every engine built from it.
#[derive(Debug, Default)]
pub struct FunctionRegistry {
    handlers: DashMap<String, Handler>,
}

impl FunctionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registry preloaded with `log`, `set`, `concat` and `fail`.
    pub fn with_builtins() -> Arc<Self> {
        let registry = Self::new();
        register_builtins(&registry);
        registry
    }

    /// Register (or replace) `name`.
    pub fn register<Args, F: IntoHandler<Args>>(&self, name: impl Into<String>, f: F) {
        self.insert(name.into(), f.into_handler());
    }

    pub fn register_with_engine<Args, F: IntoEngineHandler<Args>>(
        &self,
        name: impl Into<String>,
        f: F,
    ) {
        self.insert(name.into(), f.into_handler());
    }

    pub fn insert(&self, name: String, handler: Handler) {
        debug!(function = %name, arity = handler.arity(), "function registered");
        self.handlers.insert(name, handler);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Call `name` with already-resolved positional arguments.
    pub async fn call(
        &self,
        name: &str,
        args: Vec<Value>,
        engine: &FlowEngine,
    ) -> Result<Value, FlowError> {
        let handler = self
            .handlers
            .get(name)
            .map(|h| h.value().clone())
            .ok_or_else(|| FlowError::Dispatch(format!("unknown function `{name}`")))?;
        if args.len() != handler.arity() {
            return Err(FlowError::Dispatch(format!(
                "`{name}` expects {} argument(s), got {}",
                handler.arity(),
                args.len()
            )));
        }
        let outcome = match handler {
            Handler::Plain { call, .. } => call(args).await,
            Handler::WithEngine { call, .. } => call(engine.clone(), args).await,
        };
        outcome.map_err(|failure| match failure {
            HandlerFailure::Coercion { index, message } => FlowError::Dispatch(format!(
                "`{name}` argument arg{index}: {message}"
            )),
            HandlerFailure::Failed(message) => FlowError::Handler {
                function: name.to_string(),
                message,
            },
        })
    }

    /// Invoke `name` with step parameters. `arg0`..`argN` are resolved against
    /// the engine state and passed positionally; the result is stored under
    /// `_store_result` when that parameter is present.
    #[tracing::instrument(name = "invoke", skip(self, params, engine))]
    pub async fn invoke(
        &self,
        name: &str,
        params: &Map<String, Value>,
        engine: &FlowEngine,
    ) -> Result<Value, FlowError> {
        let mut positional = BTreeMap::new();
        for (key, value) in params {
            let Some(index) = key.strip_prefix("arg") else {
                continue;
            };
            let index: usize = index.parse().map_err(|_| {
                FlowError::Dispatch(format!("`{key}` is not a positional argument of `{name}`"))
            })?;
            positional.insert(index, value);
        }
        let mut args = Vec::with_capacity(positional.len());
        for (expected, (index, value)) in positional.into_iter().enumerate() {
            if index != expected {
                return Err(FlowError::Dispatch(format!(
                    "`{name}` is missing arg{expected}"
                )));
            }
            args.push(template::resolve(value, engine.state())?);
        }

        let result = self.call(name, args, engine).await?;
        if let Some(key) = params.get(STORE_RESULT).and_then(Value::as_str) {
            engine.state().set(key, result.clone());
        }
        Ok(result)
    }
}

async fn log(message: String) -> Result<(), FlowError> {
    info!(target: "flow", "{message}");
    Ok(())
}

async fn set(engine: FlowEngine, key: String, value: Value) -> Result<Value, FlowError> {
    engine.state().set(key, value.clone());
    Ok(value)
}

async fn concat(left: String, right: String) -> Result<String, FlowError> {
    Ok(left + &right)
}

async fn fail(message: String) -> Result<(), String> {
    Err(message)
}

pub fn register_builtins(registry: &FunctionRegistry) {
    registry.register("log", log);
    registry.register_with_engine("set", set);
    registry.register("concat", concat);
    registry.register("fail", fail);
}
