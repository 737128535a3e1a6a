//! The external action client seam and an in-memory implementation.
//!
//! The compiler core never talks to a platform directly; it goes through
//! [`ActionClient`], which any OpenWhisk-compatible backend can implement.
//! [`LocalActionClient`] is the bundled implementation: an in-process action
//! registry that hosts native Rust handlers and deployed conductor
//! programs, and plays the platform's side of the conductor protocol (the
//! trampoline that feeds action results back into suspended conductors).

use async_trait::async_trait;
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;

use crate::conductor::{Conductor, ConductorError};
use crate::encode::{ActionDef, CONDUCTOR_KIND, EncodedComposition};
use crate::functions::FunctionRegistry;
use crate::names::{NameError, parse_action_name};

/// Errors from client operations.
#[derive(Debug, Error, Diagnostic)]
pub enum ClientError {
    /// No action is registered under the given name.
    #[error("action not found: {name}")]
    #[diagnostic(code(baton::client::not_found))]
    NotFound { name: String },

    /// `create` collided with an existing action.
    #[error("action already exists: {name}")]
    #[diagnostic(
        code(baton::client::conflict),
        help("Use `update`, or deploy with overwrite enabled.")
    )]
    Conflict { name: String },

    /// An action name failed to qualify.
    #[error(transparent)]
    #[diagnostic(transparent)]
    InvalidName(#[from] NameError),

    /// A deployed conductor action failed to re-hydrate or run.
    #[error(transparent)]
    #[diagnostic(code(baton::client::conductor))]
    Conductor(#[from] ConductorError),

    /// The conductor protocol exceeded the configured hop budget.
    #[error("conductor exceeded {hops} activation hops")]
    #[diagnostic(
        code(baton::client::hop_limit),
        help("Raise `RunConfig::max_hops` if the composition legitimately suspends this often.")
    )]
    HopLimit { hops: usize },

    /// The action exists but cannot execute in this host.
    #[error("action `{name}` has kind `{kind}`, which this host cannot execute")]
    #[diagnostic(code(baton::client::foreign_kind))]
    ForeignKind { name: String, kind: String },

    /// Registry/storage failure.
    #[error("backend error: {message}")]
    #[diagnostic(code(baton::client::backend))]
    Backend { message: String },
}

/// Client surface the core consumes. Invocations are blocking: the returned
/// value is the activation result.
#[async_trait]
pub trait ActionClient: Send + Sync {
    async fn create(&self, action: &ActionDef) -> Result<(), ClientError>;
    async fn update(&self, action: &ActionDef) -> Result<(), ClientError>;
    async fn delete(&self, name: &str) -> Result<(), ClientError>;
    async fn invoke(&self, name: &str, params: Value) -> Result<Value, ClientError>;
}

/// Bounds on the local conductor protocol.
#[derive(Debug, Clone, Copy)]
pub struct RunConfig {
    /// Maximum number of conductor re-entries per composition invocation.
    pub max_hops: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self { max_hops: 1000 }
    }
}

/// A synchronous Rust action handler.
pub type NativeAction = Arc<dyn Fn(Value) -> Value + Send + Sync>;

#[derive(Clone)]
enum Hosted {
    /// A Rust handler registered in-process.
    Native(NativeAction),
    /// A deployed conductor program.
    Conductor(Conductor),
    /// An uploaded action this host cannot execute (foreign exec kind).
    Opaque { kind: String },
}

/// In-memory [`ActionClient`] hosting native handlers and deployed
/// conductors.
///
/// # Examples
///
/// ```
/// use baton::client::{ActionClient, LocalActionClient};
/// use baton::{compose, encode, lower};
/// use serde_json::json;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let client = LocalActionClient::new();
/// client.register("increment", |params| {
///     json!({ "n": params["n"].as_i64().unwrap_or(0) + 1 })
/// })?;
///
/// let flow = compose::composition("flow", compose::sequence(["increment", "increment"])?)?;
/// let encoded = encode::encode(flow, &lower::TargetSet::primitives())?;
/// baton::client::deploy(&client, &encoded, true).await?;
///
/// let result = client.invoke("/_/flow", json!({ "n": 1 })).await?;
/// assert_eq!(result, json!({ "n": 3 }));
/// # Ok(())
/// # }
/// ```
pub struct LocalActionClient {
    actions: RwLock<FxHashMap<String, Hosted>>,
    functions: FunctionRegistry,
    config: RunConfig,
}

impl Default for LocalActionClient {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalActionClient {
    #[must_use]
    pub fn new() -> Self {
        Self {
            actions: RwLock::new(FxHashMap::default()),
            functions: FunctionRegistry::with_builtins(),
            config: RunConfig::default(),
        }
    }

    /// Override the run bounds.
    #[must_use]
    pub fn with_config(mut self, config: RunConfig) -> Self {
        self.config = config;
        self
    }

    /// Seed deployed conductors with a function registry (used to re-resolve
    /// `native` inline functions that lost their closures in serialization).
    #[must_use]
    pub fn with_functions(mut self, functions: FunctionRegistry) -> Self {
        self.functions = functions;
        self
    }

    /// Register a native Rust handler under a (possibly short) action name.
    pub fn register<F>(&self, name: &str, handler: F) -> Result<(), ClientError>
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        let name = parse_action_name(name)?;
        self.insert(name, Hosted::Native(Arc::new(handler)))
    }

    fn insert(&self, name: String, hosted: Hosted) -> Result<(), ClientError> {
        let mut actions = self.actions.write().map_err(|e| ClientError::Backend {
            message: format!("lock poisoned: {e}"),
        })?;
        actions.insert(name, hosted);
        Ok(())
    }

    fn lookup(&self, name: &str) -> Result<Option<Hosted>, ClientError> {
        let actions = self.actions.read().map_err(|e| ClientError::Backend {
            message: format!("lock poisoned: {e}"),
        })?;
        Ok(actions.get(name).cloned())
    }

    fn host(&self, action: &ActionDef) -> Result<Hosted, ClientError> {
        if action.action.exec.kind == CONDUCTOR_KIND {
            let conductor = Conductor::from_encoded(&action.action.exec.code)?
                .with_registry(self.functions.clone());
            Ok(Hosted::Conductor(conductor))
        } else {
            Ok(Hosted::Opaque {
                kind: action.action.exec.kind.clone(),
            })
        }
    }
}

#[async_trait]
impl ActionClient for LocalActionClient {
    async fn create(&self, action: &ActionDef) -> Result<(), ClientError> {
        if self.lookup(&action.name)?.is_some() {
            return Err(ClientError::Conflict {
                name: action.name.clone(),
            });
        }
        let hosted = self.host(action)?;
        self.insert(action.name.clone(), hosted)
    }

    async fn update(&self, action: &ActionDef) -> Result<(), ClientError> {
        let hosted = self.host(action)?;
        self.insert(action.name.clone(), hosted)
    }

    async fn delete(&self, name: &str) -> Result<(), ClientError> {
        let mut actions = self.actions.write().map_err(|e| ClientError::Backend {
            message: format!("lock poisoned: {e}"),
        })?;
        match actions.remove(name) {
            Some(_) => Ok(()),
            None => Err(ClientError::NotFound {
                name: name.to_owned(),
            }),
        }
    }

    async fn invoke(&self, name: &str, params: Value) -> Result<Value, ClientError> {
        match self.lookup(name)? {
            Some(Hosted::Native(handler)) => Ok(handler(params)),
            Some(Hosted::Conductor(conductor)) => {
                run(self, &conductor, params, self.config).await
            }
            Some(Hosted::Opaque { kind }) => Err(ClientError::ForeignKind {
                name: name.to_owned(),
                kind,
            }),
            // The platform's stock sleep action, unless shadowed.
            None if name == "/_/sleep" => {
                let ms = params.get("ms").and_then(Value::as_u64).unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(params)
            }
            None => Err(ClientError::NotFound {
                name: name.to_owned(),
            }),
        }
    }
}

/// Play the host side of the conductor protocol: step `conductor` until it
/// terminates, invoking each requested action through `client` and feeding
/// the result back with the `$resume` envelope attached.
///
/// Returns the final params exactly as the platform would deliver them:
/// carrying a top-level `error` field if the composition failed, or the
/// `{code, error}` object if the conductor itself did.
pub async fn run(
    client: &dyn ActionClient,
    conductor: &Conductor,
    params: Value,
    config: RunConfig,
) -> Result<Value, ClientError> {
    use crate::conductor::Turn;

    let mut payload = params;
    for _ in 0..config.max_hops {
        match conductor.invoke(payload) {
            Err(error) => {
                tracing::error!(error = %error, "activation failed");
                return Ok(error.into_value());
            }
            Ok(Turn::Complete { params }) | Ok(Turn::Failed { params }) => return Ok(params),
            Ok(Turn::Suspend {
                action,
                params,
                resume,
            }) => {
                tracing::debug!(action = %action, "conductor suspended");
                let result = client.invoke(&action, params).await?;
                payload = resume.attach(result);
            }
        }
    }
    Err(ClientError::HopLimit {
        hops: config.max_hops,
    })
}

/// Upload every action of an encoded composition.
///
/// With `overwrite` set, existing actions are deleted first (missing ones
/// are fine); without it, a collision aborts the deploy with
/// [`ClientError::Conflict`]. Returns the uploaded names in order.
pub async fn deploy(
    client: &dyn ActionClient,
    encoded: &EncodedComposition,
    overwrite: bool,
) -> Result<Vec<String>, ClientError> {
    let mut names = Vec::with_capacity(encoded.actions.len());
    for action in &encoded.actions {
        if overwrite {
            match client.delete(&action.name).await {
                Ok(()) | Err(ClientError::NotFound { .. }) => {}
                Err(error) => return Err(error),
            }
        }
        client.create(action).await?;
        names.push(action.name.clone());
    }
    Ok(names)
}
