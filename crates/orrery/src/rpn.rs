use crate::{
    object::NativeFn,
    parse::{BinaryOp, UnaryOp},
    resolve::{Fast, FastNode},
    slot::SlotId,
};

/// One marker of a postfix stream. Leaves push a value; every other
/// marker pops its arity and pushes its result. Markers carry the same
/// slot references and native pointers as the resolved tree, so the
/// stack machine never looks anything up.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RpnOp {
    Number(f64),
    InputVariable(usize),
    Constant(SlotId),
    Unary(UnaryOp),
    Binary(BinaryOp),
    Builtin { slot: SlotId, f: NativeFn },
    Call { slot: SlotId, arity: usize },
    Sequence(SlotId),
    Data(SlotId),
}

/// A resolved tree flattened to reverse-Polish order.
pub type Rpn = Vec<RpnOp>;

/// Linearizes a resolved tree: a postorder walk that emits each
/// operand's stream, then the node's own marker.
pub fn linearize(tree: &Fast) -> Rpn {
    let mut rpn = Rpn::new();
    push_node(tree, &mut rpn);
    rpn
}

fn push_node(tree: &Fast, rpn: &mut Rpn) {
    match &tree.node {
        FastNode::Number(value) => rpn.push(RpnOp::Number(*value)),
        FastNode::InputVariable(index) => rpn.push(RpnOp::InputVariable(*index)),
        FastNode::Constant(slot) => rpn.push(RpnOp::Constant(*slot)),
        FastNode::Unary { op, operand } => {
            push_node(operand, rpn);
            rpn.push(RpnOp::Unary(*op));
        }
        FastNode::Binary { op, lhs, rhs } => {
            push_node(lhs, rpn);
            push_node(rhs, rpn);
            rpn.push(RpnOp::Binary(*op));
        }
        FastNode::Builtin { slot, f, args } => {
            for arg in args {
                push_node(arg, rpn);
            }
            rpn.push(RpnOp::Builtin { slot: *slot, f: *f });
        }
        FastNode::Call { slot, args } => {
            for arg in args {
                push_node(arg, rpn);
            }
            rpn.push(RpnOp::Call {
                slot: *slot,
                arity: args.len(),
            });
        }
        FastNode::Sequence { slot, index } => {
            push_node(index, rpn);
            rpn.push(RpnOp::Sequence(*slot));
        }
        FastNode::Data { slot, index } => {
            push_node(index, rpn);
            rpn.push(RpnOp::Data(*slot));
        }
    }
}
