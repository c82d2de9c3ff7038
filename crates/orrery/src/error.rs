use std::fmt;

use serde::{Deserialize, Serialize};
use strum::{Display, IntoStaticStr};

use crate::token::SourceText;

/// Result alias for parsing stages (tokenizer, tree builder, resolver).
pub type ParseResult<T> = Result<T, Error>;

/// Result alias for evaluation: a scalar or a typed error.
pub type EvalResult = Result<f64, Error>;

/// Everything that can go wrong while lexing, parsing, resolving, or
/// evaluating a definition.
///
/// Uses strum derives for automatic `Display` and `Into<&'static str>`
/// implementations; the string form matches the variant name exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr, Serialize, Deserialize)]
pub enum ErrorKind {
    /// A call site passes a different number of arguments than the callee declares.
    ArgCountMismatch,
    /// The evaluator was handed nothing to evaluate (empty source, absent row).
    EmptyExpression,
    /// A programmatic `evaluate` call passed the wrong number of arguments.
    HostArgCountMismatch,
    /// The source ended where a token was still required (unclosed
    /// parenthesis, missing operand, empty argument).
    Missing,
    /// A definition tried to claim a name that is already bound.
    NameAlreadyTaken,
    /// The equation is not of the form `name = ...` or `name(args) = ...`.
    NotMathObjectDefinition,
    /// A referenced object is itself in an error state.
    ObjectInvalidState,
    /// Evaluation exceeded the configured cross-object recursion budget.
    RecursionDepthOverflow,
    /// A call references a name with no binding.
    UndefinedFunction,
    /// A value reference names nothing in the registry.
    UndefinedVariable,
    /// A token appeared where the grammar forbids it.
    Unexpected,
    /// Internal inconsistency; should not surface under normal use.
    Unknown,
    /// A number literal or candidate name is malformed.
    WrongFormat,
    /// A name resolved, but to a different category of object than its use.
    WrongObjectType,
}

/// A parse or evaluation failure, anchored to the source that caused it.
///
/// Carries the offending substring (with its begin offset) and a copy of
/// the full source string, so front-ends can underline the exact spot.
/// Location-free kinds (e.g. [`ErrorKind::RecursionDepthOverflow`]) carry
/// an empty token and expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Error {
    /// What kind of failure this is.
    pub kind: ErrorKind,
    /// The offending substring and where it starts.
    pub token: SourceText,
    /// The full source string the token belongs to.
    pub expression: String,
}

impl Error {
    fn located(kind: ErrorKind, token: SourceText, expression: impl Into<String>) -> Self {
        Self {
            kind,
            token,
            expression: expression.into(),
        }
    }

    fn bare(kind: ErrorKind) -> Self {
        Self {
            kind,
            token: SourceText::default(),
            expression: String::new(),
        }
    }

    pub fn unexpected(token: SourceText, expression: impl Into<String>) -> Self {
        Self::located(ErrorKind::Unexpected, token, expression)
    }

    pub fn wrong_format(token: SourceText, expression: impl Into<String>) -> Self {
        Self::located(ErrorKind::WrongFormat, token, expression)
    }

    pub fn missing(token: SourceText, expression: impl Into<String>) -> Self {
        Self::located(ErrorKind::Missing, token, expression)
    }

    pub fn undefined_variable(token: SourceText, expression: impl Into<String>) -> Self {
        Self::located(ErrorKind::UndefinedVariable, token, expression)
    }

    pub fn undefined_function(token: SourceText, expression: impl Into<String>) -> Self {
        Self::located(ErrorKind::UndefinedFunction, token, expression)
    }

    pub fn wrong_object_type(token: SourceText, expression: impl Into<String>) -> Self {
        Self::located(ErrorKind::WrongObjectType, token, expression)
    }

    pub fn object_invalid_state(token: SourceText, expression: impl Into<String>) -> Self {
        Self::located(ErrorKind::ObjectInvalidState, token, expression)
    }

    pub fn arg_count_mismatch(token: SourceText, expression: impl Into<String>) -> Self {
        Self::located(ErrorKind::ArgCountMismatch, token, expression)
    }

    pub fn name_already_taken(token: SourceText, expression: impl Into<String>) -> Self {
        Self::located(ErrorKind::NameAlreadyTaken, token, expression)
    }

    pub fn not_math_object_definition() -> Self {
        Self::bare(ErrorKind::NotMathObjectDefinition)
    }

    pub fn recursion_depth_overflow() -> Self {
        Self::bare(ErrorKind::RecursionDepthOverflow)
    }

    pub fn empty_expression() -> Self {
        Self::bare(ErrorKind::EmptyExpression)
    }

    pub fn host_arg_count_mismatch() -> Self {
        Self::bare(ErrorKind::HostArgCountMismatch)
    }

    pub fn unknown() -> Self {
        Self::bare(ErrorKind::Unknown)
    }

    /// True when the error points at an actual substring of its source.
    pub fn has_location(&self) -> bool {
        !self.expression.is_empty()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if self.has_location() {
            if self.token.substr.is_empty() {
                write!(f, " at offset {}", self.token.begin)?;
            } else {
                write!(f, " at '{}' (offset {})", self.token.substr, self.token.begin)?;
            }
            write!(f, " in \"{}\"", self.expression)?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {}
