use crate::{
    error::{Error, ParseResult},
    object::{MathObject, NativeFn, ObjectKind},
    parse::{Ast, AstNode, BinaryOp, UnaryOp},
    slot::SlotId,
    token::SourceText,
    world::MathWorld,
};

/// A fully resolved tree node: same shape as the syntax tree, but every
/// name has been replaced by a typed reference into the registry arena.
/// After resolution, evaluation never performs a name lookup.
#[derive(Debug, Clone)]
pub enum FastNode {
    Number(f64),
    InputVariable(usize),
    /// A reference to a global constant's slot.
    Constant(SlotId),
    Unary {
        op: UnaryOp,
        operand: Box<Fast>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Fast>,
        rhs: Box<Fast>,
    },
    /// A built-in call; the native pointer is denormalized into the node
    /// so evaluation dispatches without touching the registry.
    Builtin {
        slot: SlotId,
        f: NativeFn,
        args: Vec<Fast>,
    },
    /// A user-function call. Arity was checked at resolution.
    Call {
        slot: SlotId,
        args: Vec<Fast>,
    },
    /// A sequence indexed by its single operand.
    Sequence {
        slot: SlotId,
        index: Box<Fast>,
    },
    /// A data series indexed by its single operand.
    Data {
        slot: SlotId,
        index: Box<Fast>,
    },
}

/// A resolved node together with the source span it covers.
#[derive(Debug, Clone)]
pub struct Fast {
    pub node: FastNode,
    pub text: SourceText,
}

/// Resolves every name leaf of `ast` against the registry, producing a
/// tree that references objects by slot.
///
/// Value references must name constants and call references must name
/// callables; anything else is `WrongObjectType`. Call arity is checked
/// here, once, with mismatches pointing at the argument-list substring.
/// A reference to an object that is itself in an error state is
/// `ObjectInvalidState` — the caller still records the dependency, so
/// fixing the target revives the referent.
pub(crate) fn bind(ast: &Ast, world: &MathWorld, expression: &str) -> ParseResult<Fast> {
    let text = ast.text.clone();
    let node = match &ast.node {
        AstNode::Number(value) => FastNode::Number(*value),
        AstNode::InputVariable(index) => FastNode::InputVariable(*index),
        AstNode::Variable => {
            let name = &ast.text.substr;
            let Some((slot, entry)) = world.lookup(name) else {
                return Err(Error::undefined_variable(text, expression));
            };
            match &entry.def {
                Err(_) => return Err(Error::object_invalid_state(text, expression)),
                Ok(MathObject::Constant(_)) => FastNode::Constant(slot),
                Ok(_) => return Err(Error::wrong_object_type(text, expression)),
            }
        }
        AstNode::Call { name, args_text, args } => {
            let mut operands = Vec::with_capacity(args.len());
            for arg in args {
                operands.push(bind(arg, world, expression)?);
            }

            let Some((slot, entry)) = world.lookup(&name.substr) else {
                return Err(Error::undefined_function(name.clone(), expression));
            };
            let object = match &entry.def {
                Err(_) => return Err(Error::object_invalid_state(name.clone(), expression)),
                Ok(object) => object,
            };
            if object.kind() == ObjectKind::Constant {
                return Err(Error::wrong_object_type(name.clone(), expression));
            }
            if operands.len() != object.arity() {
                return Err(Error::arg_count_mismatch(args_text.clone(), expression));
            }

            match object {
                MathObject::Builtin(b) => FastNode::Builtin {
                    slot,
                    f: b.f,
                    args: operands,
                },
                MathObject::Function(_) => FastNode::Call { slot, args: operands },
                MathObject::Sequence(_) => FastNode::Sequence {
                    slot,
                    index: Box::new(operands.remove(0)),
                },
                MathObject::Data(_) => FastNode::Data {
                    slot,
                    index: Box::new(operands.remove(0)),
                },
                MathObject::Constant(_) => unreachable!("rejected above"),
            }
        }
        AstNode::Unary { op, operand } => FastNode::Unary {
            op: *op,
            operand: Box::new(bind(operand, world, expression)?),
        },
        AstNode::Binary { op, lhs, rhs } => FastNode::Binary {
            op: *op,
            lhs: Box::new(bind(lhs, world, expression)?),
            rhs: Box::new(bind(rhs, world, expression)?),
        },
    };
    Ok(Fast { node, text })
}
