//! Packaging compositions into deployable actions.
//!
//! `encode` walks a composition bottom-up and splits it into the wire pieces
//! a deployment needs:
//!
//! - every `action` node carrying an inline definition contributes that
//!   definition to the upload list and keeps only its name;
//! - every `composition` node is compiled (label → lower → flatten) into a
//!   conductor action whose code is the serialized [`Program`], then
//!   replaced by a plain `action` reference to it.
//!
//! A generated conductor action is annotated with the serialized source AST
//! (`conductor`) and the crate version (`composer`), so runtimes that prefer
//! to re-compile at cold start have everything they need even though the
//! code body is already flattened.

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::ast::{ActionExec, Combinator, Composition};
use crate::flatten::{CompileError, Program, flatten};
use crate::label::label;
use crate::lower::{TargetSet, lower};

/// Exec kind of a generated conductor action.
pub const CONDUCTOR_KIND: &str = "baton:conductor";

/// Annotation key carrying the serialized source AST.
pub const CONDUCTOR_ANNOTATION: &str = "conductor";

/// Annotation key carrying the compiler version.
pub const COMPOSER_ANNOTATION: &str = "composer";

/// Errors produced while encoding a composition.
#[derive(Debug, Error, Diagnostic)]
pub enum EncodeError {
    /// A nested composition failed to compile.
    #[error(transparent)]
    #[diagnostic(transparent)]
    Compile(#[from] CompileError),

    /// The conductor code bundle failed to serialize.
    #[error("failed to serialize conductor code: {0}")]
    #[diagnostic(code(baton::encode::serialize))]
    Serialize(#[from] serde_json::Error),
}

/// A `{key, value}` annotation attached to an uploaded action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Annotation {
    pub key: String,
    pub value: Value,
}

/// Body of an uploadable action: exec spec plus annotations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionBody {
    pub exec: ActionExec,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub annotations: Vec<Annotation>,
}

/// An action ready for upload through the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionDef {
    pub name: String,
    pub action: ActionBody,
}

/// The code body of a generated conductor action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConductorCode {
    pub program: Program,
    pub version: String,
}

/// The wire form of an encoded composition: the outermost encoded node plus
/// the actions to upload (conductors last, outermost conductor at the end).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncodedComposition {
    pub composition: Composition,
    pub actions: Vec<ActionDef>,
}

/// Encode a composition for deployment.
///
/// The returned `composition` is the residual tree, labeled and lowered to
/// `target`, in which every packaged node has become an action reference.
/// Wrapping the whole input in [`crate::compose::composition`] first
/// therefore reduces the residue to a single `action` node and puts the main
/// conductor at the end of `actions`.
pub fn encode(
    composition: Composition,
    target: &TargetSet,
) -> Result<EncodedComposition, EncodeError> {
    let mut actions = Vec::new();
    let packaged = pack(composition, &mut actions)?;
    Ok(EncodedComposition {
        composition: lower(label(packaged), target),
        actions,
    })
}

fn pack(
    composition: Composition,
    actions: &mut Vec<ActionDef>,
) -> Result<Composition, EncodeError> {
    let mut failure: Option<EncodeError> = None;
    let composition = composition.map_children(|child, _| {
        if failure.is_some() {
            return child;
        }
        match pack(child, actions) {
            Ok(child) => child,
            Err(error) => {
                failure = Some(error);
                Composition::empty()
            }
        }
    });
    if let Some(error) = failure {
        return Err(error);
    }

    let Composition { kind, path } = composition;
    let kind = match kind {
        Combinator::Action {
            name,
            action: Some(exec),
        } => {
            actions.push(ActionDef {
                name: name.clone(),
                action: ActionBody {
                    exec,
                    annotations: Vec::new(),
                },
            });
            Combinator::Action { name, action: None }
        }
        Combinator::Composition { name, composition } => {
            actions.push(package_conductor(&name, &composition)?);
            Combinator::Action { name, action: None }
        }
        kind => kind,
    };
    Ok(Composition { kind, path })
}

/// Compile a named composition into its conductor action.
fn package_conductor(name: &str, composition: &Composition) -> Result<ActionDef, EncodeError> {
    let program = flatten(&lower(
        label(composition.clone()),
        &TargetSet::primitives(),
    ))?;
    let code = ConductorCode {
        program,
        version: env!("CARGO_PKG_VERSION").to_owned(),
    };
    Ok(ActionDef {
        name: name.to_owned(),
        action: ActionBody {
            exec: ActionExec {
                kind: CONDUCTOR_KIND.to_owned(),
                code: serde_json::to_string(&code)?,
            },
            annotations: vec![
                Annotation {
                    key: CONDUCTOR_ANNOTATION.to_owned(),
                    value: serde_json::to_value(composition)?,
                },
                Annotation {
                    key: COMPOSER_ANNOTATION.to_owned(),
                    value: Value::String(env!("CARGO_PKG_VERSION").to_owned()),
                },
            ],
        },
    })
}
