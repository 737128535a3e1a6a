//! The composition tree.
//!
//! A workflow is a tree of [`Composition`] nodes. Every node carries a
//! [`Combinator`], a closed internally tagged variant describing one
//! control-flow or data primitive, plus an optional `path` annotation
//! assigned by the labeling pass ([`crate::label`]).
//!
//! The combinator set splits in two:
//!
//! - **primitives**, which the conductor interprets natively: `sequence`,
//!   `if_nosave`, `while_nosave`, `dowhile_nosave`, `try`, `finally`, `let`,
//!   `mask`, `action`, `function`, `composition`;
//! - **derived** combinators, which the lowering pass ([`crate::lower`])
//!   rewrites into primitives: `empty`, `seq`, `if`, `while`, `dowhile`,
//!   `retain`, `retain_catch`, `repeat`, `retry`, `value`, `literal`,
//!   `sleep`, `merge`.
//!
//! Nodes serialize to the wire format consumed by deployed conductors: a
//! JSON object with a `type` discriminator and per-type fields. `path` is
//! metadata, not identity; rewrites preserve it but never rely on it.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::functions::FunctionSpec;

/// Declarations map of a `let` scope: identifier → arbitrary JSON value.
pub type Declarations = Map<String, Value>;

/// One node of a composition tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Composition {
    #[serde(flatten)]
    pub kind: Combinator,
    /// JSON path of this node within its tree, set by the labeler.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub path: Option<String>,
}

impl Composition {
    /// Wrap a combinator into an unlabeled node.
    #[must_use]
    pub fn new(kind: Combinator) -> Self {
        Self { kind, path: None }
    }

    /// The `empty` combinator: identity on params.
    #[must_use]
    pub fn empty() -> Self {
        Self::new(Combinator::Empty)
    }

    /// Wire name of this node's combinator.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        self.kind.meta().name
    }

    /// Whether this node's combinator is in the primitive set.
    #[must_use]
    pub fn is_primitive(&self) -> bool {
        !self.kind.meta().derived
    }
}

impl Default for Composition {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Display for Composition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered = serde_json::to_string(self).map_err(|_| fmt::Error)?;
        f.write_str(&rendered)
    }
}

/// Inline definition attached to an `action` node, uploaded alongside the
/// composition at deploy time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionExec {
    pub kind: String,
    pub code: String,
}

/// The closed combinator variant set.
///
/// Serialized form is internally tagged on `type`, matching the composition
/// wire format: `{"type": "sequence", "components": [...]}` and so on.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Combinator {
    // -- derived ------------------------------------------------------------
    /// Identity on params.
    Empty,
    /// Alias of `sequence`.
    Seq { components: Vec<Composition> },
    /// Branch on the test's `value`, restoring pre-test params for the
    /// chosen branch.
    If {
        test: Box<Composition>,
        consequent: Box<Composition>,
        #[serde(default)]
        alternate: Box<Composition>,
    },
    /// Loop while the test's `value` is truthy, restoring pre-test params
    /// for each body run.
    While {
        test: Box<Composition>,
        body: Box<Composition>,
    },
    /// Run the body once, then loop while the test's `value` is truthy.
    Dowhile {
        body: Box<Composition>,
        test: Box<Composition>,
    },
    /// Pair the input params with the output result.
    Retain { components: Vec<Composition> },
    /// As `retain`, but an error becomes the result instead of propagating.
    RetainCatch { components: Vec<Composition> },
    /// Run the components `count` times.
    Repeat {
        count: u32,
        components: Vec<Composition>,
    },
    /// Run the components, retrying up to `count` times while the result
    /// carries an error.
    Retry {
        count: u32,
        components: Vec<Composition>,
    },
    /// Replace params with `{"value": v}`.
    Value { value: Value },
    /// Alias of `value`.
    Literal { value: Value },
    /// Pause for `ms` milliseconds (a suspension through the `sleep`
    /// action), preserving params.
    Sleep { ms: u64 },
    /// Run the components on the input params, then overlay the result onto
    /// those params (result wins on conflicts).
    Merge { components: Vec<Composition> },

    // -- primitives ---------------------------------------------------------
    /// Left-to-right composition.
    Sequence { components: Vec<Composition> },
    /// Branch on `value` truthiness; params flow through unchanged.
    IfNosave {
        test: Box<Composition>,
        consequent: Box<Composition>,
        #[serde(default)]
        alternate: Box<Composition>,
    },
    /// Loop on `value` truthiness; params flow through unchanged.
    WhileNosave {
        test: Box<Composition>,
        body: Box<Composition>,
    },
    /// Body-first loop on `value` truthiness; params flow through unchanged.
    DowhileNosave {
        body: Box<Composition>,
        test: Box<Composition>,
    },
    /// Run the handler iff the body errors; the error is swallowed.
    Try {
        body: Box<Composition>,
        handler: Box<Composition>,
    },
    /// Run the finalizer unconditionally, preserving the body's value or
    /// error.
    Finally {
        body: Box<Composition>,
        finalizer: Box<Composition>,
    },
    /// Lexical binding frame around a scope.
    Let {
        declarations: Declarations,
        components: Vec<Composition>,
    },
    /// Hide the nearest enclosing `let` frame from the components.
    Mask { components: Vec<Composition> },
    /// Invocation of an external action.
    Action {
        name: String,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        action: Option<ActionExec>,
    },
    /// Inline function applied to `(env, params)`.
    Function { function: FunctionSpec },
    /// Named top-level composition, packaged into its own conductor action.
    Composition {
        name: String,
        composition: Box<Composition>,
    },
}

/// Static description of a combinator: wire name, the release that
/// introduced it, and whether the lowerer rewrites it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CombinatorMeta {
    pub name: &'static str,
    pub since: &'static str,
    pub derived: bool,
}

impl CombinatorMeta {
    const fn new(name: &'static str, since: &'static str, derived: bool) -> Self {
        Self {
            name,
            since,
            derived,
        }
    }
}

impl Combinator {
    /// The const metadata entry for this combinator.
    #[must_use]
    pub fn meta(&self) -> CombinatorMeta {
        match self {
            Combinator::Empty => CombinatorMeta::new("empty", "0.4.0", true),
            Combinator::Seq { .. } => CombinatorMeta::new("seq", "0.4.0", true),
            Combinator::If { .. } => CombinatorMeta::new("if", "0.4.0", true),
            Combinator::While { .. } => CombinatorMeta::new("while", "0.4.0", true),
            Combinator::Dowhile { .. } => CombinatorMeta::new("dowhile", "0.4.0", true),
            Combinator::Retain { .. } => CombinatorMeta::new("retain", "0.4.0", true),
            Combinator::RetainCatch { .. } => CombinatorMeta::new("retain_catch", "0.4.0", true),
            Combinator::Repeat { .. } => CombinatorMeta::new("repeat", "0.4.0", true),
            Combinator::Retry { .. } => CombinatorMeta::new("retry", "0.4.0", true),
            Combinator::Value { .. } => CombinatorMeta::new("value", "0.4.0", true),
            Combinator::Literal { .. } => CombinatorMeta::new("literal", "0.4.0", true),
            Combinator::Sleep { .. } => CombinatorMeta::new("sleep", "0.5.0", true),
            Combinator::Merge { .. } => CombinatorMeta::new("merge", "0.13.0", true),
            Combinator::Sequence { .. } => CombinatorMeta::new("sequence", "0.4.0", false),
            Combinator::IfNosave { .. } => CombinatorMeta::new("if_nosave", "0.4.0", false),
            Combinator::WhileNosave { .. } => CombinatorMeta::new("while_nosave", "0.4.0", false),
            Combinator::DowhileNosave { .. } => {
                CombinatorMeta::new("dowhile_nosave", "0.4.0", false)
            }
            Combinator::Try { .. } => CombinatorMeta::new("try", "0.4.0", false),
            Combinator::Finally { .. } => CombinatorMeta::new("finally", "0.4.0", false),
            Combinator::Let { .. } => CombinatorMeta::new("let", "0.4.0", false),
            Combinator::Mask { .. } => CombinatorMeta::new("mask", "0.4.0", false),
            Combinator::Action { .. } => CombinatorMeta::new("action", "0.4.0", false),
            Combinator::Function { .. } => CombinatorMeta::new("function", "0.4.0", false),
            Combinator::Composition { .. } => CombinatorMeta::new("composition", "0.6.0", false),
        }
    }
}

/// Position of a child node within its parent, used to derive path segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    /// A named sub-composition field (`test`, `body`, ...).
    Named(&'static str),
    /// An element of a `components` list.
    Index(usize),
}

impl Field {
    /// The path segment this position contributes: `.name` or `[index]`.
    #[must_use]
    pub fn segment(&self) -> String {
        match self {
            Field::Named(name) => format!(".{name}"),
            Field::Index(index) => format!("[{index}]"),
        }
    }
}

impl Composition {
    /// Rebuild this node, passing every direct child through `f` together
    /// with its [`Field`] position. Non-composition fields (declarations,
    /// names, values, counts, function specs) are left untouched.
    ///
    /// Both rewrite passes and the labeler are written against this single
    /// traversal so the set of composition-typed fields lives in one place.
    #[must_use]
    pub fn map_children<F>(mut self, mut f: F) -> Self
    where
        F: FnMut(Composition, Field) -> Composition,
    {
        fn boxed<F>(node: Box<Composition>, name: &'static str, f: &mut F) -> Box<Composition>
        where
            F: FnMut(Composition, Field) -> Composition,
        {
            Box::new(f(*node, Field::Named(name)))
        }

        fn list<F>(components: Vec<Composition>, f: &mut F) -> Vec<Composition>
        where
            F: FnMut(Composition, Field) -> Composition,
        {
            components
                .into_iter()
                .enumerate()
                .map(|(index, component)| f(component, Field::Index(index)))
                .collect()
        }

        self.kind = match self.kind {
            kind @ (Combinator::Empty
            | Combinator::Value { .. }
            | Combinator::Literal { .. }
            | Combinator::Sleep { .. }
            | Combinator::Action { .. }
            | Combinator::Function { .. }) => kind,

            Combinator::Seq { components } => Combinator::Seq {
                components: list(components, &mut f),
            },
            Combinator::Sequence { components } => Combinator::Sequence {
                components: list(components, &mut f),
            },
            Combinator::Mask { components } => Combinator::Mask {
                components: list(components, &mut f),
            },
            Combinator::Retain { components } => Combinator::Retain {
                components: list(components, &mut f),
            },
            Combinator::RetainCatch { components } => Combinator::RetainCatch {
                components: list(components, &mut f),
            },
            Combinator::Merge { components } => Combinator::Merge {
                components: list(components, &mut f),
            },
            Combinator::Repeat { count, components } => Combinator::Repeat {
                count,
                components: list(components, &mut f),
            },
            Combinator::Retry { count, components } => Combinator::Retry {
                count,
                components: list(components, &mut f),
            },
            Combinator::Let {
                declarations,
                components,
            } => Combinator::Let {
                declarations,
                components: list(components, &mut f),
            },

            Combinator::If {
                test,
                consequent,
                alternate,
            } => Combinator::If {
                test: boxed(test, "test", &mut f),
                consequent: boxed(consequent, "consequent", &mut f),
                alternate: boxed(alternate, "alternate", &mut f),
            },
            Combinator::IfNosave {
                test,
                consequent,
                alternate,
            } => Combinator::IfNosave {
                test: boxed(test, "test", &mut f),
                consequent: boxed(consequent, "consequent", &mut f),
                alternate: boxed(alternate, "alternate", &mut f),
            },
            Combinator::While { test, body } => Combinator::While {
                test: boxed(test, "test", &mut f),
                body: boxed(body, "body", &mut f),
            },
            Combinator::WhileNosave { test, body } => Combinator::WhileNosave {
                test: boxed(test, "test", &mut f),
                body: boxed(body, "body", &mut f),
            },
            Combinator::Dowhile { body, test } => Combinator::Dowhile {
                body: boxed(body, "body", &mut f),
                test: boxed(test, "test", &mut f),
            },
            Combinator::DowhileNosave { body, test } => Combinator::DowhileNosave {
                body: boxed(body, "body", &mut f),
                test: boxed(test, "test", &mut f),
            },
            Combinator::Try { body, handler } => Combinator::Try {
                body: boxed(body, "body", &mut f),
                handler: boxed(handler, "handler", &mut f),
            },
            Combinator::Finally { body, finalizer } => Combinator::Finally {
                body: boxed(body, "body", &mut f),
                finalizer: boxed(finalizer, "finalizer", &mut f),
            },
            Combinator::Composition { name, composition } => Combinator::Composition {
                name,
                composition: boxed(composition, "composition", &mut f),
            },
        };
        self
    }
}
