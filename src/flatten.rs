//! Flattening: compiling a primitive tree into a linear instruction array.
//!
//! The compiler works on fragments (`Vec<Instruction>`) glued together by
//! `chain`, which points the last instruction of the front fragment at the
//! first instruction of the back fragment. All jumps (`next`, `then`,
//! `else`, `catch`) are offsets *relative to the instruction's own index*,
//! so fragments compose without renumbering. An instruction with no `next`
//! is terminal: reaching it ends the program.
//!
//! Control structures compile to fixed shapes:
//!
//! - `finally` → `try` … body … `exit` … finalizer, with the `try`'s catch
//!   offset landing on the finalizer;
//! - `try` → the same, but the catch lands on the handler and the `exit`
//!   jumps over it;
//! - `if_nosave` → test … `choice`, with the consequent jumping over the
//!   alternate to a shared trailing `pass`;
//! - `while_nosave` / `dowhile_nosave` → the same `choice`, with a negative
//!   offset closing the loop.

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ast::{Combinator, Composition, Declarations};
use crate::functions::FunctionExec;

/// Errors produced while flattening a composition.
#[derive(Debug, Error, Diagnostic)]
pub enum CompileError {
    /// A derived combinator reached the flattener.
    #[error("combinator `{combinator}` at `{path}` is not primitive")]
    #[diagnostic(
        code(baton::flatten::not_lowered),
        help("Lower the composition to the primitive set before flattening.")
    )]
    NotLowered {
        combinator: &'static str,
        path: String,
    },

    /// A generated jump leaves the program.
    #[error("instruction {index} jumps out of the program (offset {offset:+})")]
    #[diagnostic(code(baton::flatten::offset_out_of_range))]
    OffsetOutOfRange { index: usize, offset: isize },
}

/// One state of the flattened program.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instruction {
    #[serde(flatten)]
    pub op: Op,
    /// Relative jump taken after this instruction; absent means terminal.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub next: Option<isize>,
    /// Source path of the composition node this instruction came from.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub path: Option<String>,
}

impl Instruction {
    fn new(op: Op) -> Self {
        Self {
            op,
            next: None,
            path: None,
        }
    }

    fn at(op: Op, path: Option<String>) -> Self {
        Self {
            op,
            next: None,
            path,
        }
    }
}

/// Instruction payload, tagged by `type` on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Op {
    /// No effect.
    Pass,
    /// No effect beyond error inspection of the current params.
    Empty,
    /// Pop the top stack frame.
    Exit,
    /// Suspend, requesting invocation of the named action.
    Action { name: String },
    /// Run an inline function against `(env, params)`.
    Function { exec: FunctionExec },
    /// Branch on the truthiness of `params.value`.
    Choice {
        then: isize,
        #[serde(rename = "else")]
        otherwise: isize,
    },
    /// Push a catch frame pointing `catch` instructions ahead.
    Try { catch: isize },
    /// Push a binding frame; `None` declarations push a mask sentinel.
    Let {
        #[serde(rename = "let")]
        declarations: Option<Declarations>,
    },
}

/// A flattened, validated instruction array.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Program {
    instructions: Vec<Instruction>,
}

impl Program {
    /// The instruction at `index`, if in range.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Instruction> {
        self.instructions.get(index)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    #[must_use]
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    /// Check that every jump lands inside the program.
    pub fn validate(&self) -> Result<(), CompileError> {
        let check = |index: usize, offset: isize| -> Result<(), CompileError> {
            let target = index as isize + offset;
            if target < 0 || target >= self.instructions.len() as isize {
                return Err(CompileError::OffsetOutOfRange { index, offset });
            }
            Ok(())
        };
        for (index, instruction) in self.instructions.iter().enumerate() {
            if let Some(next) = instruction.next {
                check(index, next)?;
            }
            match instruction.op {
                Op::Choice { then, otherwise } => {
                    check(index, then)?;
                    check(index, otherwise)?;
                }
                Op::Try { catch } => check(index, catch)?,
                _ => {}
            }
        }
        Ok(())
    }
}

/// Compile a labeled, primitive-only composition into a program.
pub fn flatten(composition: &Composition) -> Result<Program, CompileError> {
    let program = Program {
        instructions: compile(composition)?,
    };
    program.validate()?;
    Ok(program)
}

/// Glue two fragments: the front's last instruction falls through to the
/// back's first.
fn chain(mut front: Vec<Instruction>, back: Vec<Instruction>) -> Vec<Instruction> {
    set_last_next(&mut front, 1);
    front.extend(back);
    front
}

fn set_last_next(fragment: &mut [Instruction], next: isize) {
    if let Some(last) = fragment.last_mut() {
        last.next = Some(next);
    }
}

/// Compile a components list: the empty sequence is a single `empty`
/// instruction, anything else is the chained compilation of its elements.
fn sequence_fragment(components: &[Composition]) -> Result<Vec<Instruction>, CompileError> {
    let mut components = components.iter();
    let Some(first) = components.next() else {
        return Ok(vec![Instruction::new(Op::Empty)]);
    };
    components.try_fold(compile(first)?, |front, component| {
        Ok(chain(front, compile(component)?))
    })
}

fn compile(composition: &Composition) -> Result<Vec<Instruction>, CompileError> {
    let path = composition.path.clone();
    match &composition.kind {
        Combinator::Sequence { components } => Ok(chain(
            vec![Instruction::at(Op::Pass, path)],
            sequence_fragment(components)?,
        )),

        Combinator::Action { name, .. } => Ok(vec![Instruction::at(
            Op::Action { name: name.clone() },
            path,
        )]),

        // A nested composition has been packaged into its own conductor
        // action by `encode`; invoking it is an ordinary action invocation.
        Combinator::Composition { name, .. } => Ok(vec![Instruction::at(
            Op::Action { name: name.clone() },
            path,
        )]),

        Combinator::Function { function } => Ok(vec![Instruction::at(
            Op::Function {
                exec: function.exec.clone(),
            },
            path,
        )]),

        Combinator::Finally { body, finalizer } => {
            let body = compile(body)?;
            let finalizer = compile(finalizer)?;
            let finalizer_len = finalizer.len();
            let mut fsm = chain(
                chain(
                    chain(vec![Instruction::at(Op::Try { catch: 0 }, path)], body),
                    vec![Instruction::new(Op::Exit)],
                ),
                finalizer,
            );
            let catch = (fsm.len() - finalizer_len) as isize;
            patch_catch(&mut fsm, catch);
            Ok(fsm)
        }

        Combinator::Let {
            declarations,
            components,
        } => Ok(chain(
            chain(
                vec![Instruction::at(
                    Op::Let {
                        declarations: Some(declarations.clone()),
                    },
                    path,
                )],
                sequence_fragment(components)?,
            ),
            vec![Instruction::new(Op::Exit)],
        )),

        Combinator::Mask { components } => Ok(chain(
            chain(
                vec![Instruction::at(Op::Let { declarations: None }, path)],
                sequence_fragment(components)?,
            ),
            vec![Instruction::new(Op::Exit)],
        )),

        Combinator::Try { body, handler } => {
            let body = compile(body)?;
            let handler = chain(compile(handler)?, vec![Instruction::new(Op::Pass)]);
            let mut fsm = chain(
                chain(vec![Instruction::at(Op::Try { catch: 0 }, path)], body),
                vec![Instruction::new(Op::Exit)],
            );
            let catch = fsm.len() as isize;
            patch_catch(&mut fsm, catch);
            // The exit skips the handler on the no-error path.
            set_last_next(&mut fsm, handler.len() as isize);
            fsm.extend(handler);
            Ok(fsm)
        }

        Combinator::IfNosave {
            test,
            consequent,
            alternate,
        } => {
            let mut consequent = compile(consequent)?;
            let alternate = chain(compile(alternate)?, vec![Instruction::new(Op::Pass)]);
            let mut fsm = chain(
                chain(vec![Instruction::at(Op::Pass, path)], compile(test)?),
                vec![Instruction::new(Op::Choice {
                    then: 1,
                    otherwise: consequent.len() as isize + 1,
                })],
            );
            // The consequent jumps over the alternate to the shared pass.
            set_last_next(&mut consequent, alternate.len() as isize);
            fsm.extend(consequent);
            fsm.extend(alternate);
            Ok(fsm)
        }

        Combinator::WhileNosave { test, body } => {
            let mut body = compile(body)?;
            let mut fsm = chain(
                chain(vec![Instruction::at(Op::Pass, path)], compile(test)?),
                vec![Instruction::new(Op::Choice {
                    then: 1,
                    otherwise: body.len() as isize + 1,
                })],
            );
            // Close the loop back to the leading pass.
            let offset = 1 - fsm.len() as isize - body.len() as isize;
            set_last_next(&mut body, offset);
            fsm.extend(body);
            fsm.push(Instruction::new(Op::Pass));
            Ok(fsm)
        }

        Combinator::DowhileNosave { body, test } => {
            let mut fsm = chain(
                chain(
                    chain(vec![Instruction::at(Op::Pass, path)], compile(body)?),
                    compile(test)?,
                ),
                vec![Instruction::new(Op::Choice {
                    then: 0,
                    otherwise: 1,
                })],
            );
            let then = 1 - fsm.len() as isize;
            if let Some(Instruction {
                op: Op::Choice { then: t, .. },
                ..
            }) = fsm.last_mut()
            {
                *t = then;
            }
            fsm.push(Instruction::new(Op::Pass));
            Ok(fsm)
        }

        kind => Err(CompileError::NotLowered {
            combinator: kind.meta().name,
            path: composition.path.clone().unwrap_or_default(),
        }),
    }
}

fn patch_catch(fsm: &mut [Instruction], catch: isize) {
    if let Some(Instruction {
        op: Op::Try { catch: c },
        ..
    }) = fsm.first_mut()
    {
        *c = catch;
    }
}
