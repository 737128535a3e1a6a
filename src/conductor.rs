//! The conductor: a resumable interpreter for flattened programs.
//!
//! A conductor executes one synchronous segment of a program per activation.
//! It steps from instruction to instruction until it either finishes,
//! errors, or reaches an `action` instruction (the only suspension point),
//! at which it returns a continuation naming the action to invoke and
//! carrying `(state, stack)` inside a `$resume` envelope. The host invokes
//! the action and re-enters the conductor with the action's result and the
//! envelope; nothing is kept between activations outside the payload.
//!
//! # Scoping
//!
//! The stack interleaves catch frames (pushed by `try`) and binding frames
//! (pushed by `let`). A binding frame with no declarations is a *mask
//! sentinel*: when an inline function computes its environment, each
//! sentinel cancels the next real binding frame further out. Identifiers
//! resolve topmost-first; values assigned through the environment are
//! written back to the topmost visible frame declaring them.
//!
//! # Errors
//!
//! A params object carrying an `error` field aborts forward execution:
//! `inspect` strips params down to the error, pops frames until a catch
//! frame appears, and resumes there, terminating if none does. Inline
//! function failures are converted to such error params; internal invariant
//! violations (bad resume state, popping an empty stack) are reported as
//! `{code, error}` wire objects and never as panics.

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::VecDeque;
use thiserror::Error;

use crate::ast::{Composition, Declarations};
use crate::flatten::{CompileError, Op, Program, flatten};
use crate::functions::{Env, FunctionExec, FunctionRegistry, InlineError};
use crate::label::label;
use crate::lower::{TargetSet, lower};

/// One frame of the conductor stack. Top of stack is the front.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Frame {
    /// Error handler continuation at an absolute instruction index.
    Catch { catch: usize },
    /// Binding frame; `None` is a mask sentinel.
    Let {
        #[serde(rename = "let")]
        bindings: Option<Declarations>,
    },
}

/// The serialized `(state, stack)` pair carried across action hops.
///
/// A `state` of `None` resumes directly into the terminal transition, which
/// happens when the suspending `action` was the program's last instruction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeEnvelope {
    pub state: Option<usize>,
    pub stack: VecDeque<Frame>,
}

impl ResumeEnvelope {
    /// Attach this envelope to an action result, producing the params for
    /// the next conductor activation. Non-object results are wrapped as
    /// `{"value": ...}` first.
    #[must_use]
    pub fn attach(&self, result: Value) -> Value {
        let mut params = match result {
            Value::Object(map) => map,
            other => {
                let mut map = serde_json::Map::new();
                map.insert("value".to_owned(), other);
                map
            }
        };
        params.insert("$resume".to_owned(), json!(self));
        Value::Object(params)
    }
}

/// Outcome of one conductor activation.
#[derive(Debug, Clone)]
pub enum Turn {
    /// The composition finished; `params` is the final dataflow value.
    Complete { params: Value },
    /// The composition terminated with an uncaught error; `params` carries
    /// the `error` field.
    Failed { params: Value },
    /// Execution suspended at an action instruction.
    Suspend {
        action: String,
        params: Value,
        resume: ResumeEnvelope,
    },
}

impl Turn {
    /// The wire form of this outcome: `{"params": ...}` on success, the
    /// error params on failure, and the continuation object on suspension.
    #[must_use]
    pub fn into_value(self) -> Value {
        match self {
            Turn::Complete { params } => json!({ "params": params }),
            Turn::Failed { params } => params,
            Turn::Suspend {
                action,
                params,
                resume,
            } => json!({
                "action": action,
                "params": params,
                "state": { "$resume": resume },
            }),
        }
    }
}

/// Activation failures that bypass the composition's own error handling.
#[derive(Debug, Clone, PartialEq, Eq, Error, Diagnostic)]
pub enum ConductorError {
    /// The `$resume` envelope was malformed; nothing was executed.
    #[error("{0}")]
    #[diagnostic(code(baton::conductor::bad_request))]
    BadRequest(String),

    /// A conductor invariant was violated mid-run.
    #[error("{0}")]
    #[diagnostic(code(baton::conductor::internal))]
    Internal(String),
}

impl ConductorError {
    /// The `{code, error}` wire form.
    #[must_use]
    pub fn into_value(self) -> Value {
        let (code, error) = match self {
            ConductorError::BadRequest(error) => (400, error),
            ConductorError::Internal(error) => (500, error),
        };
        json!({ "code": code, "error": error })
    }
}

/// A compiled composition plus the function registry used to resolve
/// `native` exec specs that lost their closures in transit.
#[derive(Debug, Clone)]
pub struct Conductor {
    program: Program,
    registry: FunctionRegistry,
}

impl Conductor {
    /// Compile a composition: label, lower to primitives, flatten.
    pub fn compile(composition: &Composition) -> Result<Self, CompileError> {
        let lowered = lower(label(composition.clone()), &TargetSet::primitives());
        Ok(Self::from_program(flatten(&lowered)?))
    }

    /// Wrap an already-flattened program.
    #[must_use]
    pub fn from_program(program: Program) -> Self {
        Self {
            program,
            registry: FunctionRegistry::with_builtins(),
        }
    }

    /// Re-hydrate a conductor from the code body of an encoded conductor
    /// action (see [`crate::encode`]): the cold-start path of a deployed
    /// composition.
    pub fn from_encoded(code: &str) -> Result<Self, ConductorError> {
        let bundle: crate::encode::ConductorCode = serde_json::from_str(code).map_err(|error| {
            ConductorError::Internal(format!("malformed conductor code: {error}"))
        })?;
        bundle
            .program
            .validate()
            .map_err(|error| ConductorError::Internal(error.to_string()))?;
        Ok(Self::from_program(bundle.program))
    }

    /// Replace the function registry (builtins included by default).
    #[must_use]
    pub fn with_registry(mut self, registry: FunctionRegistry) -> Self {
        self.registry = registry;
        self
    }

    #[must_use]
    pub fn program(&self) -> &Program {
        &self.program
    }

    /// Run one activation to its next suspension or termination.
    ///
    /// `params` is the invocation payload: the initial dataflow value on the
    /// first activation, or an action result plus `$resume` envelope on
    /// re-entry.
    pub fn invoke(&self, params: Value) -> Result<Turn, ConductorError> {
        let mut params = params;
        let mut state: Option<usize> = Some(0);
        let mut stack: VecDeque<Frame> = VecDeque::new();

        if let Some(resume) = params
            .as_object_mut()
            .and_then(|object| object.remove("$resume"))
        {
            (state, stack) = parse_resume(resume)?;
            // An action may have resumed us with an error field.
            inspect(&mut params, &mut state, &mut stack);
        }

        loop {
            let Some(current) = state else {
                tracing::debug!(params = %params, "entering final state");
                return Ok(if params.get("error").is_some() {
                    Turn::Failed { params }
                } else {
                    Turn::Complete { params }
                });
            };

            let instruction = self.program.get(current).ok_or_else(|| {
                ConductorError::Internal(format!("State {current} is out of range"))
            })?;
            if let Some(path) = &instruction.path {
                tracing::debug!(state = current, path = %path, "entering composition");
            }

            state = instruction.next.map(|next| offset(current, next));

            match &instruction.op {
                Op::Pass => {}
                Op::Empty => inspect(&mut params, &mut state, &mut stack),
                Op::Choice { then, otherwise } => {
                    let value = params.get("value").ok_or_else(|| {
                        ConductorError::Internal(format!(
                            "State {current} has no value to branch on"
                        ))
                    })?;
                    let branch = if truthy(value) { *then } else { *otherwise };
                    state = Some(offset(current, branch));
                }
                Op::Try { catch } => stack.push_front(Frame::Catch {
                    catch: offset(current, *catch),
                }),
                Op::Let { declarations } => stack.push_front(Frame::Let {
                    bindings: declarations.clone(),
                }),
                Op::Exit => {
                    if stack.pop_front().is_none() {
                        return Err(ConductorError::Internal(format!(
                            "State {current} attempted to pop from an empty stack"
                        )));
                    }
                }
                Op::Action { name } => {
                    return Ok(Turn::Suspend {
                        action: name.clone(),
                        params,
                        resume: ResumeEnvelope { state, stack },
                    });
                }
                Op::Function { exec } => {
                    match self.run_function(exec, &mut stack, &params) {
                        Ok(None) => {}
                        Ok(Some(result)) => params = result,
                        Err(error) => {
                            tracing::warn!(state = current, error = %error, "inline function failed");
                            params = json!({
                                "error": format!(
                                    "An exception was caught at state {current} (see log for details)"
                                ),
                            });
                        }
                    }
                    inspect(&mut params, &mut state, &mut stack);
                }
            }
        }
    }

    /// The guarded wire adapter: never fails, mapping activation errors to
    /// their `{code, error}` form.
    #[must_use]
    pub fn activate(&self, params: Value) -> Value {
        match self.invoke(params) {
            Ok(turn) => turn.into_value(),
            Err(error) => {
                tracing::error!(error = %error, "activation failed");
                error.into_value()
            }
        }
    }

    /// Run an inline function against the visible environment, writing
    /// mutated bindings back into the stack afterwards (also on failure).
    fn run_function(
        &self,
        exec: &FunctionExec,
        stack: &mut VecDeque<Frame>,
        params: &Value,
    ) -> Result<Option<Value>, InlineError> {
        let func = match exec {
            FunctionExec::Native { name, func } => func
                .clone()
                .or_else(|| self.registry.resolve(name))
                .ok_or_else(|| InlineError::msg(format!("unresolved native function `{name}`")))?,
            foreign => {
                return Err(InlineError::msg(format!(
                    "cannot evaluate `{}` functions in this runtime",
                    foreign.kind()
                )));
            }
        };

        // Visible binding frames, top first; each mask sentinel cancels the
        // next real frame further out.
        let mut view: Vec<usize> = Vec::new();
        let mut masked = 0usize;
        for (index, frame) in stack.iter().enumerate() {
            match frame {
                Frame::Let { bindings: None } => masked += 1,
                Frame::Let { bindings: Some(_) } => {
                    if masked == 0 {
                        view.push(index);
                    } else {
                        masked -= 1;
                    }
                }
                Frame::Catch { .. } => {}
            }
        }

        // Collapse outermost-first so nearer frames win.
        let mut env = Env::new();
        for &index in view.iter().rev() {
            if let Some(Frame::Let {
                bindings: Some(bindings),
            }) = stack.get(index)
            {
                for (key, value) in bindings {
                    env.insert(key.clone(), value.clone());
                }
            }
        }

        let outcome = func.call(&mut env, params);

        for (key, value) in env {
            let declared = view.iter().copied().find(|&index| {
                matches!(
                    stack.get(index),
                    Some(Frame::Let { bindings: Some(bindings) }) if bindings.contains_key(&key)
                )
            });
            if let Some(index) = declared {
                if let Some(Frame::Let {
                    bindings: Some(bindings),
                }) = stack.get_mut(index)
                {
                    bindings.insert(key, value);
                }
            }
        }

        outcome
    }
}

fn offset(current: usize, delta: isize) -> usize {
    // Safe by program validation: every offset was checked in-range.
    (current as isize + delta) as usize
}

/// Wrap non-object params, then route any `error` field to the innermost
/// catch frame, discarding everything else.
fn inspect(params: &mut Value, state: &mut Option<usize>, stack: &mut VecDeque<Frame>) {
    if !params.is_object() {
        let value = params.take();
        *params = json!({ "value": value });
    }
    if let Some(error) = params.get("error").cloned() {
        *params = json!({ "error": error });
        *state = None;
        while let Some(frame) = stack.pop_front() {
            if let Frame::Catch { catch } = frame {
                *state = Some(catch);
                break;
            }
        }
    }
}

fn parse_resume(resume: Value) -> Result<(Option<usize>, VecDeque<Frame>), ConductorError> {
    let Value::Object(resume) = resume else {
        return Err(ConductorError::BadRequest(
            "The type of optional $resume parameter must be object".to_owned(),
        ));
    };
    let state = match resume.get("state") {
        None | Some(Value::Null) => None,
        Some(Value::Number(number)) => Some(number.as_u64().ok_or_else(bad_state)? as usize),
        Some(_) => return Err(bad_state()),
    };
    let stack = match resume.get("stack") {
        Some(stack @ Value::Array(_)) => serde_json::from_value(stack.clone()).map_err(|_| {
            ConductorError::BadRequest("The $resume.stack frames are malformed".to_owned())
        })?,
        _ => {
            return Err(ConductorError::BadRequest(
                "The type of $resume.stack must be an array".to_owned(),
            ));
        }
    };
    Ok((state, stack))
}

fn bad_state() -> ConductorError {
    ConductorError::BadRequest(
        "The type of optional $resume.state parameter must be a number".to_owned(),
    )
}

/// Truthiness of the `value` field driving `choice` instructions: null,
/// false, zero, and empty strings, arrays, and objects are falsy.
fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(value) => *value,
        Value::Number(number) => number.as_f64().is_some_and(|n| n != 0.0),
        Value::String(value) => !value.is_empty(),
        Value::Array(value) => !value.is_empty(),
        Value::Object(value) => !value.is_empty(),
    }
}

