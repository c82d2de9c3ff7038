use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, ParseResult},
    token::{
        Fixity, MAX_PRIORITY, SourceText, Token, TokenKind, binary_op_def, is_operator_char,
        unary_op_def,
    },
};

/// Interprets the longest numeric prefix of `s` as an IEEE-754 double.
///
/// Returns the value and the number of bytes consumed. Accepts an optional
/// leading sign, decimal point, and scientific exponent (`223.231E+13`);
/// the exponent is only consumed when at least one digit follows it.
/// Non-finite results (overflowing literals) are rejected.
pub(crate) fn parse_double(s: &str) -> Option<(f64, usize)> {
    let bytes = s.as_bytes();
    let mut i = 0;

    if matches!(bytes.first(), Some(b'+' | b'-')) {
        i += 1;
    }
    let int_start = i;
    while bytes.get(i).is_some_and(u8::is_ascii_digit) {
        i += 1;
    }
    let int_digits = i - int_start;

    let mut frac_digits = 0;
    if bytes.get(i) == Some(&b'.') {
        i += 1;
        let frac_start = i;
        while bytes.get(i).is_some_and(u8::is_ascii_digit) {
            i += 1;
        }
        frac_digits = i - frac_start;
    }
    if int_digits == 0 && frac_digits == 0 {
        return None;
    }

    if matches!(bytes.get(i), Some(b'e' | b'E')) {
        let mut j = i + 1;
        if matches!(bytes.get(j), Some(b'+' | b'-')) {
            j += 1;
        }
        let exp_start = j;
        while bytes.get(j).is_some_and(u8::is_ascii_digit) {
            j += 1;
        }
        if j > exp_start {
            i = j;
        }
    }

    let value: f64 = s[..i].parse().ok()?;
    value.is_finite().then_some((value, i))
}

/// Characters that terminate an identifier. Everything else (letters,
/// digits, `_`, `:`, `.`, non-ASCII) may appear inside a name, which is
/// what admits dotted names such as `math::pi` and `physics.c`.
fn is_name_boundary(ch: char) -> bool {
    is_operator_char(ch) || matches!(ch, '(' | ')' | ',' | ';') || ch.is_whitespace()
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum PthKind {
    Call,
    Plain,
}

/// Cuts `expression` into an ordered token vector whose substring spans
/// cover the source exactly, whitespace excluded.
///
/// A single left-to-right scan tracks which token classes are currently
/// legal. A `+`/`-` at a value-expected position directly followed by a
/// digit is folded into the number literal; without a digit it lexes as
/// the unary-prefix operator; anywhere else it is binary-infix. A bare
/// identifier becomes a `Function` token iff the next non-space character
/// is `(`. Separators are legal inside a call's argument region and at
/// parenthesis depth zero (where sequence definitions use them).
pub fn tokenize(expression: &str) -> ParseResult<Vec<Token>> {
    let mut tokens: Vec<Token> = Vec::new();

    let mut value_allowed = true;
    let mut operator_allowed = false;
    let mut opening_allowed = true;
    let mut closing_allowed = false;
    let mut can_end = false;

    let mut pth_stack: Vec<PthKind> = Vec::new();

    let mut i = 0;
    while i < expression.len() {
        let rest = &expression[i..];
        let Some(ch) = rest.chars().next() else { break };

        if ch.is_whitespace() {
            i += ch.len_utf8();
            continue;
        }

        let signed_number = value_allowed
            && matches!(ch, '+' | '-')
            && rest[ch.len_utf8()..].starts_with(|c: char| c.is_ascii_digit());

        if ch.is_ascii_digit() || signed_number {
            if !value_allowed {
                return Err(Error::unexpected(SourceText::new(ch, i), expression));
            }
            let Some((value, len)) = parse_double(rest) else {
                return Err(Error::wrong_format(SourceText::new(ch, i), expression));
            };
            tokens.push(Token::new(
                TokenKind::Number(value),
                SourceText::new(&rest[..len], i),
            ));
            i += len;

            value_allowed = false;
            opening_allowed = false;
            operator_allowed = true;
            closing_allowed = true;
            can_end = true;
        } else if is_operator_char(ch) {
            let text = SourceText::new(ch, i);
            let op = if value_allowed {
                let Some(op) = unary_op_def(ch) else {
                    return Err(Error::unexpected(text, expression));
                };
                op
            } else if operator_allowed {
                let Some(op) = binary_op_def(ch) else {
                    return Err(Error::unexpected(text, expression));
                };
                op
            } else {
                return Err(Error::unexpected(text, expression));
            };
            tokens.push(Token::new(TokenKind::Operator(op), text));
            i += ch.len_utf8();

            value_allowed = true;
            opening_allowed = true;
            operator_allowed = false;
            closing_allowed = false;
            can_end = false;
        } else if ch == '(' {
            if !opening_allowed {
                return Err(Error::unexpected(SourceText::new(ch, i), expression));
            }
            let after_function = matches!(tokens.last().map(|t| t.kind), Some(TokenKind::Function));
            let kind = if after_function {
                pth_stack.push(PthKind::Call);
                TokenKind::FunctionCallStart
            } else {
                pth_stack.push(PthKind::Plain);
                TokenKind::OpeningPth
            };
            tokens.push(Token::new(kind, SourceText::new(ch, i)));
            i += 1;

            value_allowed = true;
            opening_allowed = true;
            operator_allowed = false;
            closing_allowed = false;
            can_end = false;
        } else if ch == ')' {
            let text = SourceText::new(ch, i);
            if !closing_allowed {
                return Err(Error::unexpected(text, expression));
            }
            let Some(kind) = pth_stack.pop() else {
                return Err(Error::unexpected(text, expression));
            };
            let kind = match kind {
                PthKind::Call => TokenKind::FunctionCallEnd,
                PthKind::Plain => TokenKind::ClosingPth,
            };
            tokens.push(Token::new(kind, text));
            i += 1;

            value_allowed = false;
            opening_allowed = false;
            operator_allowed = true;
            closing_allowed = true;
            can_end = true;
        } else if matches!(ch, ',' | ';') {
            let text = SourceText::new(ch, i);
            // Legal between call arguments and at depth zero, where the
            // registry splits sequence definitions; inside a plain
            // parenthesis group it is meaningless.
            if pth_stack.last() == Some(&PthKind::Plain) {
                return Err(Error::unexpected(text, expression));
            }
            tokens.push(Token::new(TokenKind::Separator, text));
            i += 1;

            value_allowed = true;
            opening_allowed = true;
            operator_allowed = false;
            closing_allowed = false;
            can_end = false;
        } else {
            // Only identifiers are left: a run of non-boundary characters,
            // classified as a function call when parentheses follow.
            if !value_allowed {
                return Err(Error::unexpected(SourceText::new(ch, i), expression));
            }
            let end = rest
                .char_indices()
                .find(|&(_, c)| is_name_boundary(c))
                .map_or(rest.len(), |(pos, _)| pos);
            let name = &rest[..end];
            let next_non_space = rest[end..].chars().find(|c| !c.is_whitespace());

            if next_non_space == Some('(') {
                tokens.push(Token::new(TokenKind::Function, SourceText::new(name, i)));
                value_allowed = false;
                opening_allowed = true;
                operator_allowed = false;
                closing_allowed = false;
                can_end = false;
            } else {
                tokens.push(Token::new(TokenKind::Variable, SourceText::new(name, i)));
                value_allowed = false;
                opening_allowed = false;
                operator_allowed = true;
                closing_allowed = true;
                can_end = true;
            }
            i += end;
        }
    }

    if !pth_stack.is_empty() {
        return Err(Error::missing(
            SourceText::new(")", expression.len()),
            expression,
        ));
    }
    if !can_end {
        let end = Token::end_of_expression(expression.len());
        return Err(Error::unexpected(end.text, expression));
    }

    Ok(tokens)
}

/// A candidate is a valid object name iff it tokenizes to exactly one
/// `Variable` token. This naturally permits dotted identifiers such as
/// `math::pi` while rejecting anything with operators, digits-first
/// forms, or parentheses.
pub fn is_valid_name(name: &str) -> bool {
    matches!(
        tokenize(name).as_deref(),
        Ok([Token { kind: TokenKind::Variable, .. }])
    )
}

/// Indices of the tokens not enclosed in any parenthesis group,
/// function-call parentheses included. The parenthesis tokens themselves
/// belong to the group they delimit.
pub(crate) fn top_level_indices(tokens: &[Token]) -> Vec<usize> {
    let mut indices = Vec::new();
    let mut depth = 0usize;
    for (i, token) in tokens.iter().enumerate() {
        match token.kind {
            TokenKind::OpeningPth | TokenKind::FunctionCallStart => depth += 1,
            TokenKind::ClosingPth | TokenKind::FunctionCallEnd => {
                depth = depth.saturating_sub(1);
            }
            _ if depth == 0 => indices.push(i),
            _ => {}
        }
    }
    indices
}

/// Splits `tokens` at every top-level token matching `pred`, returning
/// the (possibly empty) index ranges between the split points.
pub(crate) fn split_top_level(tokens: &[Token], pred: impl Fn(&Token) -> bool) -> Vec<(usize, usize)> {
    let mut ranges = Vec::new();
    let mut start = 0;
    for i in top_level_indices(tokens) {
        if pred(&tokens[i]) {
            ranges.push((start, i));
            start = i + 1;
        }
    }
    ranges.push((start, tokens.len()));
    ranges
}

/// A binary arithmetic operation, post-parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Power,
}

impl BinaryOp {
    pub(crate) fn from_glyph(glyph: char) -> Option<Self> {
        match glyph {
            '+' => Some(Self::Add),
            '-' => Some(Self::Subtract),
            '*' => Some(Self::Multiply),
            '/' => Some(Self::Divide),
            '^' => Some(Self::Power),
            _ => None,
        }
    }

    /// IEEE-754 semantics throughout: division by zero yields an
    /// infinity or NaN rather than an error.
    pub(crate) fn apply(self, a: f64, b: f64) -> f64 {
        match self {
            Self::Add => a + b,
            Self::Subtract => a - b,
            Self::Multiply => a * b,
            Self::Divide => a / b,
            Self::Power => a.powf(b),
        }
    }
}

/// A prefix sign operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Plus,
    Minus,
}

impl UnaryOp {
    pub(crate) fn from_glyph(glyph: char) -> Option<Self> {
        match glyph {
            '+' => Some(Self::Plus),
            '-' => Some(Self::Minus),
            _ => None,
        }
    }

    pub(crate) fn apply(self, x: f64) -> f64 {
        match self {
            Self::Plus => x,
            Self::Minus => -x,
        }
    }
}

/// A node of the name-keyed syntax tree, before resolution against a
/// registry. Calls keep their arguments as a plain vector; arity is
/// checked once at resolution time.
#[derive(Debug, Clone, PartialEq)]
pub enum AstNode {
    Number(f64),
    /// An unresolved value reference; the name is the node's own text.
    Variable,
    /// A value bound to the formal parameter at this index.
    InputVariable(usize),
    Call {
        /// The callee name and where it sits.
        name: SourceText,
        /// The argument region between the call parentheses, kept so
        /// arity errors can point at the arguments as a whole.
        args_text: SourceText,
        args: Vec<Ast>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Ast>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Ast>,
        rhs: Box<Ast>,
    },
}

/// A syntax tree node together with the source span it covers.
#[derive(Debug, Clone, PartialEq)]
pub struct Ast {
    pub node: AstNode,
    pub text: SourceText,
}

fn span_text(tokens: &[Token], expression: &str) -> SourceText {
    let begin = tokens[0].text.begin;
    let end = tokens[tokens.len() - 1].text.end();
    SourceText::from_range(expression, begin, end)
}

/// Builds a syntax tree from a token span.
///
/// Recursive descent by decreasing operator priority: strip a full outer
/// parenthesis group, handle single tokens and calls, then split at the
/// right-most top-level operator of the lowest priority present (so
/// same-priority infix operators associate left-to-right). Bare
/// identifiers matching an entry of `input_vars` become input-variable
/// leaves bound to that position.
pub fn build_ast(tokens: &[Token], expression: &str, input_vars: &[String]) -> ParseResult<Ast> {
    parse_span(tokens, expression, input_vars, 0)
}

/// Like [`build_ast`], but anchors the error for an empty span at
/// `empty_pos` (used when building pieces of a larger source).
pub(crate) fn build_ast_at(
    tokens: &[Token],
    expression: &str,
    input_vars: &[String],
    empty_pos: usize,
) -> ParseResult<Ast> {
    parse_span(tokens, expression, input_vars, empty_pos)
}

fn parse_span(
    tokens: &[Token],
    expression: &str,
    input_vars: &[String],
    empty_pos: usize,
) -> ParseResult<Ast> {
    let Some(first) = tokens.first() else {
        return Err(Error::missing(SourceText::empty_at(empty_pos), expression));
    };
    let last = &tokens[tokens.len() - 1];
    let text = span_text(tokens, expression);

    if tokens.len() == 1 {
        return match first.kind {
            TokenKind::Number(value) => Ok(Ast {
                node: AstNode::Number(value),
                text,
            }),
            TokenKind::Variable => {
                let node = match input_vars.iter().position(|v| *v == first.text.substr) {
                    Some(index) => AstNode::InputVariable(index),
                    None => AstNode::Variable,
                };
                Ok(Ast { node, text })
            }
            _ => Err(Error::unexpected(first.text.clone(), expression)),
        };
    }

    let top = top_level_indices(tokens);

    // A group wrapping the whole span: strip it and recurse.
    if top.is_empty()
        && first.kind == TokenKind::OpeningPth
        && last.kind == TokenKind::ClosingPth
    {
        return parse_span(
            &tokens[1..tokens.len() - 1],
            expression,
            input_vars,
            first.text.end(),
        );
    }

    // A single call spanning everything: split its argument region at
    // top-level separators and recurse on each argument.
    if top == [0]
        && first.kind == TokenKind::Function
        && tokens[1].kind == TokenKind::FunctionCallStart
        && last.kind == TokenKind::FunctionCallEnd
    {
        let inner = &tokens[2..tokens.len() - 1];
        let args_begin = tokens[1].text.end();
        let args_text = SourceText::from_range(expression, args_begin, last.text.begin);
        if inner.is_empty() {
            return Err(Error::missing(SourceText::empty_at(args_begin), expression));
        }

        let mut args = Vec::new();
        for (start, end) in split_top_level(inner, |t| t.kind == TokenKind::Separator) {
            let anchor = if start == 0 {
                args_begin
            } else {
                inner[start - 1].text.end()
            };
            args.push(parse_span(&inner[start..end], expression, input_vars, anchor)?);
        }

        return Ok(Ast {
            node: AstNode::Call {
                name: first.text.clone(),
                args_text,
                args,
            },
            text,
        });
    }

    // A separator surviving to expression position was not consumed by
    // any argument or sequence split.
    if let Some(&i) = top.iter().find(|&&i| tokens[i].kind == TokenKind::Separator) {
        return Err(Error::unexpected(tokens[i].text.clone(), expression));
    }

    // Split at the right-most top-level operator of the lowest priority
    // present; the deepest parts of the tree evaluate first.
    for priority in 0..=MAX_PRIORITY {
        for &i in top.iter().rev() {
            let TokenKind::Operator(op) = tokens[i].kind else {
                continue;
            };
            if op.priority != priority {
                continue;
            }
            match op.fixity {
                Fixity::BinaryInfix => {
                    // `=` belongs to definitions only; inside an
                    // expression span it is never an operator.
                    if i == 0 || i == tokens.len() - 1 || op.glyph == '=' {
                        return Err(Error::unexpected(tokens[i].text.clone(), expression));
                    }
                    let Some(binary) = BinaryOp::from_glyph(op.glyph) else {
                        return Err(Error::unexpected(tokens[i].text.clone(), expression));
                    };
                    let lhs = parse_span(&tokens[..i], expression, input_vars, text.begin)?;
                    let rhs = parse_span(
                        &tokens[i + 1..],
                        expression,
                        input_vars,
                        tokens[i].text.end(),
                    )?;
                    return Ok(Ast {
                        node: AstNode::Binary {
                            op: binary,
                            lhs: Box::new(lhs),
                            rhs: Box::new(rhs),
                        },
                        text,
                    });
                }
                Fixity::UnaryPrefix => {
                    if i != 0 {
                        continue;
                    }
                    let Some(unary) = UnaryOp::from_glyph(op.glyph) else {
                        return Err(Error::unexpected(tokens[i].text.clone(), expression));
                    };
                    let operand =
                        parse_span(&tokens[1..], expression, input_vars, first.text.end())?;
                    return Ok(Ast {
                        node: AstNode::Unary {
                            op: unary,
                            operand: Box::new(operand),
                        },
                        text,
                    });
                }
            }
        }
    }

    Err(Error::unexpected(text, expression))
}

/// Replaces every `Variable` leaf whose name equals entry `k` of
/// `input_vars` with an input-variable leaf bound to position `k`.
///
/// Idempotent, and commutes with further applications for disjoint name
/// sets; the resulting tree's dependency set no longer contains the
/// bound names.
pub fn mark_input_vars(ast: Ast, input_vars: &[String]) -> Ast {
    let Ast { node, text } = ast;
    let node = match node {
        AstNode::Variable => match input_vars.iter().position(|v| *v == text.substr) {
            Some(index) => AstNode::InputVariable(index),
            None => AstNode::Variable,
        },
        AstNode::Call { name, args_text, args } => AstNode::Call {
            name,
            args_text,
            args: args
                .into_iter()
                .map(|arg| mark_input_vars(arg, input_vars))
                .collect(),
        },
        AstNode::Unary { op, operand } => AstNode::Unary {
            op,
            operand: Box::new(mark_input_vars(*operand, input_vars)),
        },
        AstNode::Binary { op, lhs, rhs } => AstNode::Binary {
            op,
            lhs: Box::new(mark_input_vars(*lhs, input_vars)),
            rhs: Box::new(mark_input_vars(*rhs, input_vars)),
        },
        leaf @ (AstNode::Number(_) | AstNode::InputVariable(_)) => leaf,
    };
    Ast { node, text }
}

/// How a dependency is used at its reference sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, Serialize, Deserialize)]
pub enum DepKind {
    Variable,
    Function,
}

/// One referenced name: how it is used and every offset it appears at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepInfo {
    pub kind: DepKind,
    /// Begin offsets of each occurrence, in source order.
    pub positions: Vec<usize>,
}

/// The names an expression references, in first-appearance order.
pub type Deps = IndexMap<String, DepInfo>;

/// Collects the names referenced by a token stream, excluding the given
/// input variables. Working on tokens rather than a tree keeps the
/// dependency record available even when tree building fails, which is
/// what lets a broken object revive once its missing reference appears.
pub fn direct_dependencies(tokens: &[Token], input_vars: &[String]) -> Deps {
    let mut deps = Deps::new();
    for token in tokens {
        let kind = match token.kind {
            TokenKind::Function => DepKind::Function,
            TokenKind::Variable => {
                if input_vars.contains(&token.text.substr) {
                    continue;
                }
                DepKind::Variable
            }
            _ => continue,
        };
        deps.entry(token.text.substr.clone())
            .or_insert_with(|| DepInfo {
                kind,
                positions: Vec::new(),
            })
            .positions
            .push(token.text.begin);
    }
    deps
}
