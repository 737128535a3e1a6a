//! Inline functions: the code fragments a composition runs between actions.
//!
//! An inline function receives `(env, args)`: the collapsed view of the
//! enclosing `let` scopes and the current params. It either returns a new
//! params value or `None` to leave params untouched. The `env` mapping is the
//! only channel to the surrounding scopes; mutations to it are written back
//! into the topmost visible frame declaring each identifier.
//!
//! On the wire a function is a tagged `exec` spec. Rust closures travel as
//! the `native` kind: the closure itself rides alongside the spec (skipped by
//! serde) and is re-resolved by symbol through a [`FunctionRegistry`] when a
//! program has crossed a process boundary. Foreign kinds (`python:3`,
//! `python:3+lambda`, `nodejs:default`) are carried verbatim for cloud
//! runtimes that evaluate them natively; this conductor does not.
//!
//! The lowering pass introduces a fixed set of [`Builtin`] natives
//! (`get_params`, `dec_count`, ...). Every default registry knows them, so
//! lowered programs resume anywhere.

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Collapsed view of the visible `let` declarations, keyed by identifier.
pub type Env = Map<String, Value>;

/// A callable inline function.
///
/// Returning `Ok(None)` keeps the current params (side-effect-only
/// functions); `Ok(Some(v))` replaces params with a deep copy of `v`.
pub trait InlineFn: Send + Sync {
    fn call(&self, env: &mut Env, args: &Value) -> Result<Option<Value>, InlineError>;
}

impl<F> InlineFn for F
where
    F: Fn(&mut Env, &Value) -> Result<Option<Value>, InlineError> + Send + Sync,
{
    fn call(&self, env: &mut Env, args: &Value) -> Result<Option<Value>, InlineError> {
        self(env, args)
    }
}

/// Failure of an inline function. The conductor converts any of these into
/// the caught-exception error params for the state that ran the function.
#[derive(Debug, Clone, PartialEq, Eq, Error, Diagnostic)]
pub enum InlineError {
    /// A scope identifier the function relies on is not visible.
    #[error("binding `{name}` is not in scope")]
    #[diagnostic(code(baton::functions::missing_binding))]
    MissingBinding { name: String },

    /// The params value is missing a field the function requires.
    #[error("params are missing field `{field}`")]
    #[diagnostic(code(baton::functions::missing_field))]
    MissingField { field: &'static str },

    /// A binding or field held a value of an unusable type.
    #[error("`{what}` is not {expected}")]
    #[diagnostic(code(baton::functions::type_mismatch))]
    TypeMismatch {
        what: &'static str,
        expected: &'static str,
    },

    /// Free-form failure raised by a user function.
    #[error("{0}")]
    #[diagnostic(code(baton::functions::failed))]
    Failed(String),
}

impl InlineError {
    /// Shorthand for a free-form failure.
    pub fn msg<M: Into<String>>(message: M) -> Self {
        InlineError::Failed(message.into())
    }
}

/// Wrapper matching the wire layout of a `function` node:
/// `{"function": {"exec": {...}}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionSpec {
    pub exec: FunctionExec,
}

impl From<FunctionExec> for FunctionSpec {
    fn from(exec: FunctionExec) -> Self {
        Self { exec }
    }
}

/// The exec spec of an inline function, tagged by runtime kind.
#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum FunctionExec {
    /// A Rust closure, addressed by symbol. The closure itself does not
    /// serialize; deserialized programs resolve the symbol through a
    /// [`FunctionRegistry`].
    #[serde(rename = "native")]
    Native {
        name: String,
        #[serde(skip)]
        func: Option<Arc<dyn InlineFn>>,
    },

    /// Python 3 source text defining a `def NAME(env, args)` function.
    #[serde(rename = "python:3")]
    Python3 {
        code: String,
        #[serde(
            rename = "functionName",
            skip_serializing_if = "Option::is_none",
            default
        )]
        function_name: Option<String>,
    },

    /// A marshaled, base64-encoded Python lambda.
    #[serde(rename = "python:3+lambda")]
    Python3Lambda { code: String },

    /// JavaScript source for a Node.js conductor runtime.
    #[serde(rename = "nodejs:default")]
    Nodejs { code: String },
}

impl FunctionExec {
    /// Wrap a Rust closure under the given wire symbol.
    pub fn native<F>(name: impl Into<String>, func: F) -> Self
    where
        F: InlineFn + 'static,
    {
        FunctionExec::Native {
            name: name.into(),
            func: Some(Arc::new(func)),
        }
    }

    /// The runtime kind tag of this spec.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            FunctionExec::Native { .. } => "native",
            FunctionExec::Python3 { .. } => "python:3",
            FunctionExec::Python3Lambda { .. } => "python:3+lambda",
            FunctionExec::Nodejs { .. } => "nodejs:default",
        }
    }
}

impl fmt::Debug for FunctionExec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FunctionExec::Native { name, func } => f
                .debug_struct("Native")
                .field("name", name)
                .field("resolved", &func.is_some())
                .finish(),
            FunctionExec::Python3 {
                code,
                function_name,
            } => f
                .debug_struct("Python3")
                .field("code", code)
                .field("function_name", function_name)
                .finish(),
            FunctionExec::Python3Lambda { code } => {
                f.debug_struct("Python3Lambda").field("code", code).finish()
            }
            FunctionExec::Nodejs { code } => f.debug_struct("Nodejs").field("code", code).finish(),
        }
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Symbol → closure table used to re-resolve `native` specs after
/// deserialization.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    entries: FxHashMap<String, Arc<dyn InlineFn>>,
}

impl FunctionRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry pre-populated with every lowering [`Builtin`], which is
    /// what [`crate::conductor::Conductor`] uses unless told otherwise.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for builtin in Builtin::ALL {
            registry
                .entries
                .insert(builtin.name().to_owned(), builtin.func());
        }
        registry
    }

    /// Register (or replace) a closure under `name`.
    pub fn register<F>(&mut self, name: impl Into<String>, func: F)
    where
        F: InlineFn + 'static,
    {
        self.entries.insert(name.into(), Arc::new(func));
    }

    /// Look up a closure by symbol.
    #[must_use]
    pub fn resolve(&self, name: &str) -> Option<Arc<dyn InlineFn>> {
        self.entries.get(name).cloned()
    }
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("FunctionRegistry")
            .field("entries", &names)
            .finish()
    }
}

// ============================================================================
// Lowering built-ins
// ============================================================================

/// The native functions the lowering rewrites rely on.
///
/// Their semantics are tiny by design: move params in and out of scope
/// bindings, wrap and unwrap `retain` pairs, and drive loop counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    /// `env.value`
    GetValue,
    /// `env.params = args`, params unchanged
    SetParams,
    /// `env.params`
    GetParams,
    /// `{params: env.params, result: args}`
    RetainResult,
    /// `{params: args.params, result: args.result.result}`
    RetainNestedResult,
    /// post-decrement `env.count`, yielding whether it was positive
    DecCount,
    /// `{params: args}`
    SetNestedParams,
    /// `args.params`
    GetNestedParams,
    /// `{result: args}`
    SetNestedResult,
    /// `args.result`
    GetNestedResult,
    /// post-decrement `env.count`, yielding whether `args.result` holds an
    /// error and the counter was positive
    RetryCond,
    /// shallow overlay of `args.result` onto `args.params`, result wins
    MergeResult,
}

impl Builtin {
    pub const ALL: [Builtin; 12] = [
        Builtin::GetValue,
        Builtin::SetParams,
        Builtin::GetParams,
        Builtin::RetainResult,
        Builtin::RetainNestedResult,
        Builtin::DecCount,
        Builtin::SetNestedParams,
        Builtin::GetNestedParams,
        Builtin::SetNestedResult,
        Builtin::GetNestedResult,
        Builtin::RetryCond,
        Builtin::MergeResult,
    ];

    /// Wire symbol of this builtin.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Builtin::GetValue => "get_value",
            Builtin::SetParams => "set_params",
            Builtin::GetParams => "get_params",
            Builtin::RetainResult => "retain_result",
            Builtin::RetainNestedResult => "retain_nested_result",
            Builtin::DecCount => "dec_count",
            Builtin::SetNestedParams => "set_nested_params",
            Builtin::GetNestedParams => "get_nested_params",
            Builtin::SetNestedResult => "set_nested_result",
            Builtin::GetNestedResult => "get_nested_result",
            Builtin::RetryCond => "retry_cond",
            Builtin::MergeResult => "merge_result",
        }
    }

    /// A fully resolved exec spec for this builtin.
    #[must_use]
    pub fn exec(self) -> FunctionExec {
        FunctionExec::Native {
            name: self.name().to_owned(),
            func: Some(self.func()),
        }
    }

    fn func(self) -> Arc<dyn InlineFn> {
        match self {
            Builtin::GetValue => Arc::new(get_value),
            Builtin::SetParams => Arc::new(set_params),
            Builtin::GetParams => Arc::new(get_params),
            Builtin::RetainResult => Arc::new(retain_result),
            Builtin::RetainNestedResult => Arc::new(retain_nested_result),
            Builtin::DecCount => Arc::new(dec_count),
            Builtin::SetNestedParams => Arc::new(set_nested_params),
            Builtin::GetNestedParams => Arc::new(get_nested_params),
            Builtin::SetNestedResult => Arc::new(set_nested_result),
            Builtin::GetNestedResult => Arc::new(get_nested_result),
            Builtin::RetryCond => Arc::new(retry_cond),
            Builtin::MergeResult => Arc::new(merge_result),
        }
    }
}

fn scoped<'a>(env: &'a Env, name: &str) -> Result<&'a Value, InlineError> {
    env.get(name).ok_or_else(|| InlineError::MissingBinding {
        name: name.to_owned(),
    })
}

fn field<'a>(value: &'a Value, name: &'static str) -> Result<&'a Value, InlineError> {
    value
        .get(name)
        .ok_or(InlineError::MissingField { field: name })
}

fn counter(env: &mut Env) -> Result<i64, InlineError> {
    let count = scoped(env, "count")?
        .as_i64()
        .ok_or(InlineError::TypeMismatch {
            what: "count",
            expected: "an integer",
        })?;
    env.insert("count".to_owned(), json!(count - 1));
    Ok(count)
}

fn get_value(env: &mut Env, _args: &Value) -> Result<Option<Value>, InlineError> {
    Ok(Some(scoped(env, "value")?.clone()))
}

fn set_params(env: &mut Env, args: &Value) -> Result<Option<Value>, InlineError> {
    env.insert("params".to_owned(), args.clone());
    Ok(None)
}

fn get_params(env: &mut Env, _args: &Value) -> Result<Option<Value>, InlineError> {
    Ok(Some(scoped(env, "params")?.clone()))
}

fn retain_result(env: &mut Env, args: &Value) -> Result<Option<Value>, InlineError> {
    Ok(Some(json!({
        "params": scoped(env, "params")?,
        "result": args,
    })))
}

fn retain_nested_result(_env: &mut Env, args: &Value) -> Result<Option<Value>, InlineError> {
    Ok(Some(json!({
        "params": field(args, "params")?,
        "result": field(field(args, "result")?, "result")?,
    })))
}

fn dec_count(env: &mut Env, _args: &Value) -> Result<Option<Value>, InlineError> {
    let count = counter(env)?;
    Ok(Some(Value::Bool(count > 0)))
}

fn set_nested_params(_env: &mut Env, args: &Value) -> Result<Option<Value>, InlineError> {
    Ok(Some(json!({ "params": args })))
}

fn get_nested_params(_env: &mut Env, args: &Value) -> Result<Option<Value>, InlineError> {
    Ok(Some(field(args, "params")?.clone()))
}

fn set_nested_result(_env: &mut Env, args: &Value) -> Result<Option<Value>, InlineError> {
    Ok(Some(json!({ "result": args })))
}

fn get_nested_result(_env: &mut Env, args: &Value) -> Result<Option<Value>, InlineError> {
    Ok(Some(field(args, "result")?.clone()))
}

fn retry_cond(env: &mut Env, args: &Value) -> Result<Option<Value>, InlineError> {
    let errored = field(args, "result")?.get("error").is_some();
    let count = counter(env)?;
    Ok(Some(Value::Bool(errored && count > 0)))
}

fn merge_result(_env: &mut Env, args: &Value) -> Result<Option<Value>, InlineError> {
    let mut merged = field(args, "params")?
        .as_object()
        .ok_or(InlineError::TypeMismatch {
            what: "params",
            expected: "an object",
        })?
        .clone();
    if let Some(result) = field(args, "result")?.as_object() {
        for (key, value) in result {
            merged.insert(key.clone(), value.clone());
        }
    }
    Ok(Some(Value::Object(merged)))
}
