use smallvec::SmallVec;

use crate::{
    error::{Error, EvalResult},
    object::{MathObject, Parsing},
    resolve::{Fast, FastNode},
    rpn::RpnOp,
    slot::SlotId,
    world::MathWorld,
};

/// Call-argument scratch; most user functions take a handful of values.
type ArgVec = SmallVec<[f64; 4]>;

/// Evaluates a stored right-hand side with the given input-variable
/// bindings.
///
/// `depth` counts cross-object descents; exceeding the registry's
/// budget is `RecursionDepthOverflow`. Operands evaluate strictly left
/// to right and the first error short-circuits, unchanged.
pub(crate) fn eval_parsing(
    world: &MathWorld,
    parsing: &Parsing,
    args: &[f64],
    depth: usize,
) -> EvalResult {
    if depth > world.max_recursion_depth() {
        return Err(Error::recursion_depth_overflow());
    }
    match parsing {
        Parsing::Tree(tree) => eval_tree(world, tree, args, depth),
        Parsing::Postfix(rpn) => eval_rpn(world, rpn, args, depth),
    }
}

fn constant_value(world: &MathWorld, slot: SlotId) -> EvalResult {
    match world.try_entry(slot) {
        Some(entry) => match &entry.def {
            Ok(MathObject::Constant(c)) => Ok(c.value),
            Ok(_) => Err(Error::unknown()),
            Err(e) => Err(e.clone()),
        },
        None => Err(Error::unknown()),
    }
}

fn call_function(world: &MathWorld, slot: SlotId, args: &[f64], depth: usize) -> EvalResult {
    match world.try_entry(slot) {
        Some(entry) => match &entry.def {
            Ok(MathObject::Function(f)) => eval_parsing(world, &f.rhs, args, depth),
            Ok(_) => Err(Error::unknown()),
            Err(e) => Err(e.clone()),
        },
        None => Err(Error::unknown()),
    }
}

fn call_sequence(world: &MathWorld, slot: SlotId, x: f64, depth: usize) -> EvalResult {
    match world.try_entry(slot) {
        Some(entry) => match &entry.def {
            Ok(MathObject::Sequence(u)) => u.evaluate(world, entry.revision, x, depth),
            Ok(_) => Err(Error::unknown()),
            Err(e) => Err(e.clone()),
        },
        None => Err(Error::unknown()),
    }
}

fn call_data(world: &MathWorld, slot: SlotId, x: f64, depth: usize) -> EvalResult {
    match world.try_entry(slot) {
        Some(entry) => match &entry.def {
            Ok(MathObject::Data(d)) => d.evaluate(world, entry.revision, x, depth),
            Ok(_) => Err(Error::unknown()),
            Err(e) => Err(e.clone()),
        },
        None => Err(Error::unknown()),
    }
}

/// Recursive walk of a resolved tree.
fn eval_tree(world: &MathWorld, tree: &Fast, args: &[f64], depth: usize) -> EvalResult {
    match &tree.node {
        FastNode::Number(value) => Ok(*value),
        FastNode::InputVariable(index) => args.get(*index).copied().ok_or_else(Error::unknown),
        FastNode::Constant(slot) => constant_value(world, *slot),
        FastNode::Unary { op, operand } => Ok(op.apply(eval_tree(world, operand, args, depth)?)),
        FastNode::Binary { op, lhs, rhs } => {
            let a = eval_tree(world, lhs, args, depth)?;
            let b = eval_tree(world, rhs, args, depth)?;
            Ok(op.apply(a, b))
        }
        FastNode::Builtin { f, args: operands, .. } => {
            let mut values = ArgVec::new();
            for operand in operands {
                values.push(eval_tree(world, operand, args, depth)?);
            }
            Ok(f.call(&values))
        }
        FastNode::Call { slot, args: operands } => {
            let mut values = ArgVec::new();
            for operand in operands {
                values.push(eval_tree(world, operand, args, depth)?);
            }
            call_function(world, *slot, &values, depth + 1)
        }
        FastNode::Sequence { slot, index } => {
            let x = eval_tree(world, index, args, depth)?;
            call_sequence(world, *slot, x, depth + 1)
        }
        FastNode::Data { slot, index } => {
            let x = eval_tree(world, index, args, depth)?;
            call_data(world, *slot, x, depth + 1)
        }
    }
}

/// Single-pass stack machine over a postfix stream. Semantics are
/// identical to the tree walk; a final stack holding anything but
/// exactly one value reports `Unknown`.
fn eval_rpn(world: &MathWorld, rpn: &[RpnOp], args: &[f64], depth: usize) -> EvalResult {
    let mut stack: SmallVec<[f64; 16]> = SmallVec::new();

    let pop = |stack: &mut SmallVec<[f64; 16]>| stack.pop().ok_or_else(Error::unknown);

    for op in rpn {
        match op {
            RpnOp::Number(value) => stack.push(*value),
            RpnOp::InputVariable(index) => {
                stack.push(args.get(*index).copied().ok_or_else(Error::unknown)?);
            }
            RpnOp::Constant(slot) => stack.push(constant_value(world, *slot)?),
            RpnOp::Unary(op) => {
                let x = pop(&mut stack)?;
                stack.push(op.apply(x));
            }
            RpnOp::Binary(op) => {
                let b = pop(&mut stack)?;
                let a = pop(&mut stack)?;
                stack.push(op.apply(a, b));
            }
            RpnOp::Builtin { f, .. } => {
                let start = stack
                    .len()
                    .checked_sub(f.arity())
                    .ok_or_else(Error::unknown)?;
                let value = f.call(&stack[start..]);
                stack.truncate(start);
                stack.push(value);
            }
            RpnOp::Call { slot, arity } => {
                let start = stack.len().checked_sub(*arity).ok_or_else(Error::unknown)?;
                let values: ArgVec = stack[start..].iter().copied().collect();
                stack.truncate(start);
                stack.push(call_function(world, *slot, &values, depth + 1)?);
            }
            RpnOp::Sequence(slot) => {
                let x = pop(&mut stack)?;
                stack.push(call_sequence(world, *slot, x, depth + 1)?);
            }
            RpnOp::Data(slot) => {
                let x = pop(&mut stack)?;
                stack.push(call_data(world, *slot, x, depth + 1)?);
            }
        }
    }

    match stack.as_slice() {
        [value] => Ok(*value),
        _ => Err(Error::unknown()),
    }
}
