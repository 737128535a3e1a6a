//! # Baton: Composition Compiler & Conductor for Serverless Workflows
//!
//! Baton turns trees of *combinators* (sequencing, branching, loops,
//! try/finally, lexical scopes, retries) over cloud-function actions into
//! flat, position-addressed programs that a stateless *conductor* executes
//! step by step, suspending at every action invocation and resuming from a
//! `$resume` envelope carried inside the invocation payload. No state lives
//! anywhere but the payload, so a composition can hop across as many
//! activations as it needs.
//!
//! ## Pipeline
//!
//! ```text
//! compose  →  label  →  lower  →  flatten  →  conduct
//! (build)     (paths)   (rewrite   (branch     (resumable
//!                        to prims)  offsets)    interpreter)
//! ```
//!
//! ## Quick Start
//!
//! ### Composing and running locally
//!
//! ```
//! use baton::compose::{self, Task};
//! use baton::conductor::{Conductor, Turn};
//! use serde_json::json;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let flow = compose::sequence([
//!     Task::func(|_env, args| {
//!         let n = args["n"].as_i64().unwrap_or(0);
//!         Ok(Some(json!({ "n": n + 1 })))
//!     }),
//!     Task::func(|_env, args| {
//!         let n = args["n"].as_i64().unwrap_or(0);
//!         Ok(Some(json!({ "n": n * 2 })))
//!     }),
//! ])?;
//!
//! let conductor = Conductor::compile(&flow)?;
//! match conductor.invoke(json!({ "n": 5 }))? {
//!     Turn::Complete { params } => assert_eq!(params, json!({ "n": 12 })),
//!     other => panic!("unexpected outcome: {other:?}"),
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ### Scopes and masking
//!
//! Inline functions see the enclosing `let` declarations through their `env`
//! argument; `mask` hides the nearest frame so combinator rewrites can
//! introduce scratch bindings without shadowing user scopes:
//!
//! ```
//! use baton::compose::{self, Task};
//! use baton::conductor::{Conductor, Turn};
//! use serde_json::json;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let read_x = Task::func(|env, _args| Ok(Some(env["x"].clone())));
//! let flow = compose::let_in(
//!     json!({ "x": 42 }),
//!     [compose::let_in(json!({ "x": 69 }), [compose::mask([read_x])?])?],
//! )?;
//!
//! let conductor = Conductor::compile(&flow)?;
//! match conductor.invoke(json!({}))? {
//!     Turn::Complete { params } => assert_eq!(params, json!({ "value": 42 })),
//!     other => panic!("unexpected outcome: {other:?}"),
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ### Suspending at actions
//!
//! An `action` node suspends the conductor with a continuation; the host
//! invokes the action and re-enters with the result. The bundled
//! [`client::LocalActionClient`] plays the host for tests and demos, and
//! [`client::deploy`] uploads the conductor actions produced by
//! [`encode::encode`].
//!
//! ## Module Guide
//!
//! - [`compose`] - Typed combinator constructors and task coercion
//! - [`ast`] - The composition tree and its metadata registry
//! - [`lower`] - Rewriting derived combinators into the primitive set
//! - [`label`] - JSON-path labeling for diagnostics
//! - [`flatten`] - Compilation into a relative-offset instruction array
//! - [`conductor`] - The resumable interpreter and its resume protocol
//! - [`functions`] - Inline functions, exec specs, and the symbol registry
//! - [`encode`] - Packaging compositions into uploadable conductor actions
//! - [`client`] - The action client seam and an in-memory host
//! - [`names`] - Qualified action-name parsing
//! - [`telemetry`] - Opt-in tracing bootstrap

pub mod ast;
pub mod client;
pub mod compose;
pub mod conductor;
pub mod encode;
pub mod flatten;
pub mod functions;
pub mod label;
pub mod lower;
pub mod names;
pub mod telemetry;
