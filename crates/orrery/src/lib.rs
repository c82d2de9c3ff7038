#![doc = include_str!("../../../README.md")]

mod builtins;
mod cache;
mod error;
mod eval;
mod object;
mod parse;
mod resolve;
mod rpn;
mod slot;
mod token;
mod world;

pub use crate::{
    cache::{DEFAULT_CACHE_SIZE, ObjectCache},
    error::{Error, ErrorKind, EvalResult, ParseResult},
    object::{
        BuiltinFunction, DataSeries, GlobalConstant, MathObject, NativeFn, ObjectKind, Parsing,
        ReprKind, Sequence, UserFunction,
    },
    parse::{
        Ast, AstNode, BinaryOp, DepInfo, DepKind, Deps, UnaryOp, build_ast, direct_dependencies,
        is_valid_name, mark_input_vars, tokenize,
    },
    resolve::{Fast, FastNode},
    rpn::{Rpn, RpnOp, linearize},
    slot::SlotId,
    token::{Fixity, MAX_PRIORITY, OPERATORS, OpDef, SourceText, Token, TokenKind},
    world::{DEFAULT_MAX_RECURSION_DEPTH, MathWorld, Obj, UnregisteredObject, WorldConfig},
};
