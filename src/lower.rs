//! Lowering: rewriting derived combinators into the primitive set.
//!
//! Each derived combinator has a single rewrite producing an equivalent tree
//! of primitives, scope built-ins ([`crate::functions::Builtin`]) and
//! sometimes other derived combinators, which are lowered in turn. The
//! pass rewrites the root of every node until its type is in the target set
//! or primitive, then recurses into children; a node's `path` annotation
//! survives its rewrites.
//!
//! `mask` frames in the rewrites keep user code from observing the scratch
//! bindings (`params`, `count`, `value`) a rewrite introduces.
//!
//! Termination: every rewrite either eliminates a derived combinator or
//! strictly shrinks the derived spine it sits on, and the rule table is
//! acyclic.

use miette::Diagnostic;
use rustc_hash::FxHashSet;
use serde_json::{Value, json};
use thiserror::Error;

use crate::ast::{Combinator, CombinatorMeta, Composition, Declarations};
use crate::functions::Builtin;

/// Errors selecting a lowering target.
#[derive(Debug, Clone, PartialEq, Eq, Error, Diagnostic)]
pub enum LowerError {
    /// The version selector was not a dotted numeric version.
    #[error("invalid version selector `{version}`")]
    #[diagnostic(
        code(baton::lower::invalid_version),
        help("Use a dotted numeric version such as \"0.4.0\", a combinator name set, or the empty selector for full lowering.")
    )]
    InvalidVersion { version: String },
}

/// Which combinators the lowerer leaves in place.
///
/// - [`TargetSet::Primitives`] (the empty selector): rewrite every derived
///   combinator; the result is interpretable by the conductor.
/// - [`TargetSet::Names`]: keep the named combinators, lower the rest.
/// - [`TargetSet::Since`]: keep combinators a runtime of the given version
///   already understands; lower anything newer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetSet {
    Primitives,
    Names(FxHashSet<String>),
    Since(Version),
}

impl TargetSet {
    /// The empty selector: maximal lowering.
    #[must_use]
    pub fn primitives() -> Self {
        TargetSet::Primitives
    }

    /// Keep the given combinator names.
    pub fn names<I>(names: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        TargetSet::Names(names.into_iter().map(Into::into).collect())
    }

    /// Keep combinators introduced at or before `version`.
    pub fn since(version: &str) -> Result<Self, LowerError> {
        Ok(TargetSet::Since(Version::parse(version)?))
    }

    /// Parse a CLI-style selector: empty string means full lowering, a
    /// dotted version means [`TargetSet::Since`].
    pub fn from_selector(selector: &str) -> Result<Self, LowerError> {
        if selector.trim().is_empty() {
            Ok(TargetSet::Primitives)
        } else {
            Self::since(selector)
        }
    }

    fn keeps(&self, meta: CombinatorMeta) -> bool {
        match self {
            TargetSet::Primitives => false,
            TargetSet::Names(names) => names.contains(meta.name),
            TargetSet::Since(version) => match Version::parse(meta.since) {
                Ok(since) => since <= *version,
                Err(_) => false,
            },
        }
    }
}

/// A dotted numeric version, compared componentwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version(u64, u64, u64);

impl Version {
    /// Parse `major[.minor[.patch]]`.
    pub fn parse(version: &str) -> Result<Self, LowerError> {
        let invalid = || LowerError::InvalidVersion {
            version: version.to_owned(),
        };
        let mut parts = version.trim().split('.');
        let mut next = |required: bool| -> Result<Option<u64>, LowerError> {
            match parts.next() {
                Some(part) => part.parse().map(Some).map_err(|_| invalid()),
                None if required => Err(invalid()),
                None => Ok(None),
            }
        };
        let major = next(true)?.unwrap_or(0);
        let minor = next(false)?.unwrap_or(0);
        let patch = next(false)?.unwrap_or(0);
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(Version(major, minor, patch))
    }
}

/// Lower a composition to the target combinator set.
///
/// With [`TargetSet::Primitives`] every node of the result is primitive and
/// the pass is idempotent.
#[must_use]
pub fn lower(composition: Composition, target: &TargetSet) -> Composition {
    let composition = rewrite_root(composition, target);
    composition.map_children(|child, _| lower(child, target))
}

fn rewrite_root(mut composition: Composition, target: &TargetSet) -> Composition {
    loop {
        let meta = composition.kind.meta();
        if !meta.derived || target.keeps(meta) {
            return composition;
        }
        let path = composition.path.take();
        composition = expand(composition.kind);
        if path.is_some() {
            composition.path = path;
        }
    }
}

/// One rewrite step for a derived combinator root.
fn expand(kind: Combinator) -> Composition {
    match kind {
        Combinator::Empty => seq_of(vec![]),

        Combinator::Seq { components } => seq_of(components),

        Combinator::Value { value } | Combinator::Literal { value } => {
            let_of(declaration("value", value), vec![fun(Builtin::GetValue)])
        }

        Combinator::Retain { components } => let_of(
            declaration("params", Value::Null),
            vec![finally_of(
                fun(Builtin::SetParams),
                seq_of(vec![mask_of(components), fun(Builtin::RetainResult)]),
            )],
        ),

        Combinator::RetainCatch { components } => seq_of(vec![
            node(Combinator::Retain {
                components: vec![finally_of(
                    seq_of(components),
                    fun(Builtin::SetNestedResult),
                )],
            }),
            fun(Builtin::RetainNestedResult),
        ]),

        Combinator::If {
            test,
            consequent,
            alternate,
        } => let_of(
            declaration("params", Value::Null),
            vec![
                fun(Builtin::SetParams),
                finally_of(
                    fun(Builtin::SetParams),
                    node(Combinator::IfNosave {
                        test: Box::new(mask_of(vec![*test])),
                        consequent: Box::new(finally_of(
                            fun(Builtin::GetParams),
                            mask_of(vec![*consequent]),
                        )),
                        alternate: Box::new(finally_of(
                            fun(Builtin::GetParams),
                            mask_of(vec![*alternate]),
                        )),
                    }),
                ),
            ],
        ),

        Combinator::While { test, body } => let_of(
            declaration("params", Value::Null),
            vec![finally_of(
                fun(Builtin::SetParams),
                seq_of(vec![
                    node(Combinator::WhileNosave {
                        test: Box::new(mask_of(vec![*test])),
                        body: Box::new(finally_of(
                            fun(Builtin::GetParams),
                            seq_of(vec![mask_of(vec![*body]), fun(Builtin::SetParams)]),
                        )),
                    }),
                    fun(Builtin::GetParams),
                ]),
            )],
        ),

        Combinator::Dowhile { body, test } => let_of(
            declaration("params", Value::Null),
            vec![finally_of(
                fun(Builtin::SetParams),
                seq_of(vec![
                    node(Combinator::DowhileNosave {
                        body: Box::new(finally_of(
                            fun(Builtin::GetParams),
                            seq_of(vec![mask_of(vec![*body]), fun(Builtin::SetParams)]),
                        )),
                        test: Box::new(mask_of(vec![*test])),
                    }),
                    fun(Builtin::GetParams),
                ]),
            )],
        ),

        Combinator::Repeat { count, components } => let_of(
            declaration("count", json!(count)),
            vec![node(Combinator::While {
                test: Box::new(fun(Builtin::DecCount)),
                body: Box::new(mask_of(components)),
            })],
        ),

        Combinator::Retry { count, components } => let_of(
            declaration("count", json!(count)),
            vec![
                fun(Builtin::SetNestedParams),
                node(Combinator::Dowhile {
                    body: Box::new(finally_of(
                        fun(Builtin::GetNestedParams),
                        mask_of(vec![node(Combinator::RetainCatch { components })]),
                    )),
                    test: Box::new(fun(Builtin::RetryCond)),
                }),
                fun(Builtin::GetNestedResult),
            ],
        ),

        Combinator::Sleep { ms } => let_of(
            declaration("params", Value::Null),
            vec![
                fun(Builtin::SetParams),
                node(Combinator::Literal {
                    value: json!({ "ms": ms }),
                }),
                node(Combinator::Action {
                    name: "/_/sleep".to_owned(),
                    action: None,
                }),
                fun(Builtin::GetParams),
            ],
        ),

        Combinator::Merge { components } => seq_of(vec![
            node(Combinator::Retain { components }),
            fun(Builtin::MergeResult),
        ]),

        kind => node(kind),
    }
}

// ============================================================================
// Rewrite-side node shorthands
// ============================================================================

fn node(kind: Combinator) -> Composition {
    Composition::new(kind)
}

fn fun(builtin: Builtin) -> Composition {
    node(Combinator::Function {
        function: builtin.exec().into(),
    })
}

fn seq_of(components: Vec<Composition>) -> Composition {
    node(Combinator::Sequence { components })
}

fn mask_of(components: Vec<Composition>) -> Composition {
    node(Combinator::Mask { components })
}

fn let_of(declarations: Declarations, components: Vec<Composition>) -> Composition {
    node(Combinator::Let {
        declarations,
        components,
    })
}

fn finally_of(body: Composition, finalizer: Composition) -> Composition {
    node(Combinator::Finally {
        body: Box::new(body),
        finalizer: Box::new(finalizer),
    })
}

fn declaration(key: &str, value: Value) -> Declarations {
    let mut declarations = Declarations::new();
    declarations.insert(key.to_owned(), value);
    declarations
}
