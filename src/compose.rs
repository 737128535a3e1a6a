//! Typed constructors for every combinator.
//!
//! This module is the user-facing surface for building composition trees.
//! Each constructor validates its arguments, coerces [`Task`]s into
//! sub-compositions, and returns a well-formed [`Composition`].
//!
//! Rust keywords force a few renames (the original API had the same problem
//! in its host language): `if` is [`when`], `while` is [`loop_while`],
//! `dowhile` is [`do_loop`], `try` is [`attempt`], `finally` is [`ensure`],
//! and `let` is [`let_in`]. The serialized `type` tags are unaffected.
//!
//! # Task coercion
//!
//! Wherever a sub-composition is expected, anything convertible into a
//! [`Task`] is accepted:
//!
//! - a [`Composition`] is used as-is,
//! - a string names an action (qualified through
//!   [`crate::names::parse_action_name`]),
//! - a closure (via [`Task::func`]) becomes an inline `function`,
//! - `()` or `None` becomes `empty`.
//!
//! # Examples
//!
//! ```
//! use baton::compose::{self, Task};
//! use serde_json::json;
//!
//! let flow = compose::when(
//!     "isEven",
//!     "DivideByTwo",
//!     Task::func(|_env, args| Ok(Some(json!({ "odd": args["n"] })))),
//! )
//! .unwrap();
//! assert_eq!(flow.type_name(), "if");
//! ```

use miette::Diagnostic;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

use crate::ast::{ActionExec, Combinator, Composition, Declarations};
use crate::functions::{Env, FunctionExec, InlineError, InlineFn};
use crate::names::{NameError, parse_action_name};

/// Errors raised while constructing a composition.
#[derive(Debug, Error, Diagnostic)]
pub enum ComposeError {
    /// An action name failed to parse.
    #[error("invalid name in `{combinator}` combinator: {source}")]
    #[diagnostic(code(baton::compose::invalid_name))]
    InvalidName {
        combinator: &'static str,
        #[source]
        source: NameError,
    },

    /// An argument failed validation.
    #[error("invalid argument `{argument}` in `{combinator}` combinator: {reason}")]
    #[diagnostic(code(baton::compose::invalid_argument))]
    InvalidArgument {
        combinator: &'static str,
        argument: &'static str,
        reason: String,
    },
}

// ============================================================================
// Task coercion
// ============================================================================

/// Anything a combinator accepts where a sub-composition is expected.
pub enum Task {
    /// An already-built composition.
    Composition(Composition),
    /// An action reference, by (possibly unqualified) name.
    Action(String),
    /// An inline Rust function.
    Function(Arc<dyn InlineFn>),
    /// The `empty` combinator.
    Empty,
}

impl Task {
    /// Coerce a Rust closure into a task.
    pub fn func<F>(func: F) -> Self
    where
        F: Fn(&mut Env, &Value) -> Result<Option<Value>, InlineError> + Send + Sync + 'static,
    {
        Task::Function(Arc::new(func))
    }

    fn resolve(self, combinator: &'static str) -> Result<Composition, ComposeError> {
        match self {
            Task::Composition(composition) => Ok(composition),
            Task::Action(name) => {
                let name =
                    parse_action_name(&name).map_err(|source| ComposeError::InvalidName {
                        combinator,
                        source,
                    })?;
                Ok(Composition::new(Combinator::Action { name, action: None }))
            }
            Task::Function(func) => Ok(Composition::new(Combinator::Function {
                function: FunctionExec::Native {
                    name: "inline".to_owned(),
                    func: Some(func),
                }
                .into(),
            })),
            Task::Empty => Ok(Composition::empty()),
        }
    }
}

impl From<Composition> for Task {
    fn from(composition: Composition) -> Self {
        Task::Composition(composition)
    }
}

impl From<&str> for Task {
    fn from(name: &str) -> Self {
        Task::Action(name.to_owned())
    }
}

impl From<String> for Task {
    fn from(name: String) -> Self {
        Task::Action(name)
    }
}

impl From<()> for Task {
    fn from((): ()) -> Self {
        Task::Empty
    }
}

impl<T: Into<Task>> From<Option<T>> for Task {
    fn from(task: Option<T>) -> Self {
        match task {
            Some(task) => task.into(),
            None => Task::Empty,
        }
    }
}

fn resolve_all<I>(tasks: I, combinator: &'static str) -> Result<Vec<Composition>, ComposeError>
where
    I: IntoIterator,
    I::Item: Into<Task>,
{
    tasks
        .into_iter()
        .map(|task| task.into().resolve(combinator))
        .collect()
}

// ============================================================================
// Combinator constructors
// ============================================================================

/// Identity on params.
#[must_use]
pub fn empty() -> Composition {
    Composition::empty()
}

/// Left-to-right composition of tasks.
pub fn sequence<I>(tasks: I) -> Result<Composition, ComposeError>
where
    I: IntoIterator,
    I::Item: Into<Task>,
{
    Ok(Composition::new(Combinator::Sequence {
        components: resolve_all(tasks, "sequence")?,
    }))
}

/// Alias of [`sequence`].
pub fn seq<I>(tasks: I) -> Result<Composition, ComposeError>
where
    I: IntoIterator,
    I::Item: Into<Task>,
{
    Ok(Composition::new(Combinator::Seq {
        components: resolve_all(tasks, "seq")?,
    }))
}

/// Branch on the test's `value` truthiness; the chosen branch sees the
/// pre-test params. Pass `()` for a missing alternate.
pub fn when(
    test: impl Into<Task>,
    consequent: impl Into<Task>,
    alternate: impl Into<Task>,
) -> Result<Composition, ComposeError> {
    Ok(Composition::new(Combinator::If {
        test: Box::new(test.into().resolve("if")?),
        consequent: Box::new(consequent.into().resolve("if")?),
        alternate: Box::new(alternate.into().resolve("if")?),
    }))
}

/// Branch on the test's `value` truthiness; params flow through unchanged.
pub fn when_nosave(
    test: impl Into<Task>,
    consequent: impl Into<Task>,
    alternate: impl Into<Task>,
) -> Result<Composition, ComposeError> {
    Ok(Composition::new(Combinator::IfNosave {
        test: Box::new(test.into().resolve("if_nosave")?),
        consequent: Box::new(consequent.into().resolve("if_nosave")?),
        alternate: Box::new(alternate.into().resolve("if_nosave")?),
    }))
}

/// Loop while the test's `value` is truthy; each body run sees the params
/// from before the test.
pub fn loop_while(
    test: impl Into<Task>,
    body: impl Into<Task>,
) -> Result<Composition, ComposeError> {
    Ok(Composition::new(Combinator::While {
        test: Box::new(test.into().resolve("while")?),
        body: Box::new(body.into().resolve("while")?),
    }))
}

/// Loop while the test's `value` is truthy; params flow through unchanged.
pub fn loop_while_nosave(
    test: impl Into<Task>,
    body: impl Into<Task>,
) -> Result<Composition, ComposeError> {
    Ok(Composition::new(Combinator::WhileNosave {
        test: Box::new(test.into().resolve("while_nosave")?),
        body: Box::new(body.into().resolve("while_nosave")?),
    }))
}

/// Run the body, then loop while the test's `value` is truthy.
pub fn do_loop(body: impl Into<Task>, test: impl Into<Task>) -> Result<Composition, ComposeError> {
    Ok(Composition::new(Combinator::Dowhile {
        body: Box::new(body.into().resolve("dowhile")?),
        test: Box::new(test.into().resolve("dowhile")?),
    }))
}

/// Body-first loop; params flow through unchanged.
pub fn do_loop_nosave(
    body: impl Into<Task>,
    test: impl Into<Task>,
) -> Result<Composition, ComposeError> {
    Ok(Composition::new(Combinator::DowhileNosave {
        body: Box::new(body.into().resolve("dowhile_nosave")?),
        test: Box::new(test.into().resolve("dowhile_nosave")?),
    }))
}

/// Run the handler iff the body errors; the error is swallowed.
pub fn attempt(
    body: impl Into<Task>,
    handler: impl Into<Task>,
) -> Result<Composition, ComposeError> {
    Ok(Composition::new(Combinator::Try {
        body: Box::new(body.into().resolve("try")?),
        handler: Box::new(handler.into().resolve("try")?),
    }))
}

/// Run the finalizer unconditionally, preserving the body's value or error.
pub fn ensure(
    body: impl Into<Task>,
    finalizer: impl Into<Task>,
) -> Result<Composition, ComposeError> {
    Ok(Composition::new(Combinator::Finally {
        body: Box::new(body.into().resolve("finally")?),
        finalizer: Box::new(finalizer.into().resolve("finally")?),
    }))
}

/// Open a lexical binding frame around the tasks.
///
/// `declarations` must be a JSON object; its keys become identifiers visible
/// to inline functions run inside the scope.
pub fn let_in<I>(declarations: impl Into<Value>, tasks: I) -> Result<Composition, ComposeError>
where
    I: IntoIterator,
    I::Item: Into<Task>,
{
    let declarations = into_declarations(declarations.into(), "let")?;
    Ok(Composition::new(Combinator::Let {
        declarations,
        components: resolve_all(tasks, "let")?,
    }))
}

/// Hide the nearest enclosing `let` frame from the tasks.
pub fn mask<I>(tasks: I) -> Result<Composition, ComposeError>
where
    I: IntoIterator,
    I::Item: Into<Task>,
{
    Ok(Composition::new(Combinator::Mask {
        components: resolve_all(tasks, "mask")?,
    }))
}

/// Pair the input params with the output result:
/// `{params: <input>, result: <output>}`.
pub fn retain<I>(tasks: I) -> Result<Composition, ComposeError>
where
    I: IntoIterator,
    I::Item: Into<Task>,
{
    Ok(Composition::new(Combinator::Retain {
        components: resolve_all(tasks, "retain")?,
    }))
}

/// As [`retain`], but an error becomes the result instead of propagating.
pub fn retain_catch<I>(tasks: I) -> Result<Composition, ComposeError>
where
    I: IntoIterator,
    I::Item: Into<Task>,
{
    Ok(Composition::new(Combinator::RetainCatch {
        components: resolve_all(tasks, "retain_catch")?,
    }))
}

/// Run the tasks `count` times.
pub fn repeat<I>(count: u32, tasks: I) -> Result<Composition, ComposeError>
where
    I: IntoIterator,
    I::Item: Into<Task>,
{
    Ok(Composition::new(Combinator::Repeat {
        count,
        components: resolve_all(tasks, "repeat")?,
    }))
}

/// Run the tasks, retrying up to `count` more times while the result carries
/// an `error` field.
pub fn retry<I>(count: u32, tasks: I) -> Result<Composition, ComposeError>
where
    I: IntoIterator,
    I::Item: Into<Task>,
{
    Ok(Composition::new(Combinator::Retry {
        count,
        components: resolve_all(tasks, "retry")?,
    }))
}

/// Replace params with `{"value": v}`.
#[must_use]
pub fn literal(value: impl Into<Value>) -> Composition {
    Composition::new(Combinator::Literal {
        value: value.into(),
    })
}

/// Alias of [`literal`].
#[must_use]
pub fn value(value: impl Into<Value>) -> Composition {
    Composition::new(Combinator::Value {
        value: value.into(),
    })
}

/// Suspend for `ms` milliseconds through the `sleep` action, preserving
/// params.
#[must_use]
pub fn sleep(ms: u64) -> Composition {
    Composition::new(Combinator::Sleep { ms })
}

/// Run the tasks on the input params, then overlay the result onto those
/// params (result wins on conflicting keys).
pub fn merge<I>(tasks: I) -> Result<Composition, ComposeError>
where
    I: IntoIterator,
    I::Item: Into<Task>,
{
    Ok(Composition::new(Combinator::Merge {
        components: resolve_all(tasks, "merge")?,
    }))
}

/// Invoke the named external action.
pub fn action(name: &str) -> Result<Composition, ComposeError> {
    let name = parse_action_name(name).map_err(|source| ComposeError::InvalidName {
        combinator: "action",
        source,
    })?;
    Ok(Composition::new(Combinator::Action { name, action: None }))
}

/// Invoke the named action, attaching an inline definition to upload at
/// deploy time.
pub fn action_with(name: &str, exec: ActionExec) -> Result<Composition, ComposeError> {
    let name = parse_action_name(name).map_err(|source| ComposeError::InvalidName {
        combinator: "action",
        source,
    })?;
    Ok(Composition::new(Combinator::Action {
        name,
        action: Some(exec),
    }))
}

/// Inline function from a Rust closure.
pub fn function<F>(func: F) -> Composition
where
    F: Fn(&mut Env, &Value) -> Result<Option<Value>, InlineError> + Send + Sync + 'static,
{
    function_named("inline", func)
}

/// Inline function from a Rust closure, registered under a wire symbol so a
/// deserialized program can re-resolve it through a
/// [`crate::functions::FunctionRegistry`].
pub fn function_named<F>(name: impl Into<String>, func: F) -> Composition
where
    F: Fn(&mut Env, &Value) -> Result<Option<Value>, InlineError> + Send + Sync + 'static,
{
    Composition::new(Combinator::Function {
        function: FunctionExec::native(name, func).into(),
    })
}

/// Inline function from foreign source text.
///
/// Source starting with `def` is serialized as a `python:3` spec with its
/// function name extracted; anything else is assumed to be a marshaled
/// lambda (`python:3+lambda`).
pub fn function_source(code: &str) -> Result<Composition, ComposeError> {
    let exec = if code.starts_with("def") {
        let function_name =
            def_function_name(code).ok_or_else(|| ComposeError::InvalidArgument {
                combinator: "function",
                argument: "function",
                reason: "source does not define a named function".to_owned(),
            })?;
        FunctionExec::Python3 {
            code: code.to_owned(),
            function_name: Some(function_name),
        }
    } else {
        FunctionExec::Python3Lambda {
            code: code.to_owned(),
        }
    };
    Ok(Composition::new(Combinator::Function {
        function: exec.into(),
    }))
}

/// Inline function from an already-built exec spec, accepted unchanged.
#[must_use]
pub fn function_exec(exec: FunctionExec) -> Composition {
    Composition::new(Combinator::Function {
        function: exec.into(),
    })
}

/// Name a composition for packaging into its own conductor action.
pub fn composition(name: &str, task: impl Into<Task>) -> Result<Composition, ComposeError> {
    let name = parse_action_name(name).map_err(|source| ComposeError::InvalidName {
        combinator: "composition",
        source,
    })?;
    Ok(Composition::new(Combinator::Composition {
        name,
        composition: Box::new(task.into().resolve("composition")?),
    }))
}

// ============================================================================
// Helpers
// ============================================================================

fn into_declarations(
    value: Value,
    combinator: &'static str,
) -> Result<Declarations, ComposeError> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(ComposeError::InvalidArgument {
            combinator,
            argument: "declarations",
            reason: format!("expected an object, got {}", json_type_name(&other)),
        }),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Extract the function name from `def NAME(...)` source, mirroring the
/// pattern `def\s+([a-zA-Z_][a-zA-Z_0-9]*)\s*\(`.
fn def_function_name(code: &str) -> Option<String> {
    let rest = code.strip_prefix("def")?;
    if !rest.starts_with(char::is_whitespace) {
        return None;
    }
    let rest = rest.trim_start();
    let name: String = rest
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect();
    let first = name.chars().next()?;
    if first.is_ascii_digit() {
        return None;
    }
    let after = rest[name.len()..].trim_start();
    after.starts_with('(').then_some(name)
}
