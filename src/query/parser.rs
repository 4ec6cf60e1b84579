//! Query Parser
//!
//! Parses PromQL expression strings into the `Expr` AST.
//!
//! # Supported Syntax
//!
//! ```text
//! metric{label="v", other=~"re.*"}[5m] @ 1609746000 offset 1h
//! expr[range:step]                       subquery (step optional)
//! a + on(job) group_left(env) b          vector matching
//! sum by (job) (expr), topk(3, expr)     aggregations
//! rate(expr[1m])                         function calls
//! ```
//!
//! Operator precedence, loosest first: `or`, `and unless`, comparisons,
//! `+ -`, `* / %`, `^` (right associative). Unary minus binds looser
//! than `^`, so `-2 ^ 2` is `-(2 ^ 2)`.
//!
//! The parser also understands the series descriptors used in load
//! scripts (`metric{job="1"} 0+10x100`), see [`parse_series_desc`].

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use nom::{
    branch::alt,
    bytes::complete::{tag, tag_no_case, take_while},
    character::complete::{char, digit0, digit1, hex_digit1, one_of, satisfy},
    combinator::{map_res, not, opt, recognize},
    error::{ErrorKind, FromExternalError, ParseError},
    sequence::{pair, preceded, terminated, tuple},
    IResult,
};
use regex::Regex;

use crate::query::ast::*;
use crate::query::error::{QueryError, QueryResult};
use crate::query::functions::get_function;
use crate::storage::{Label, Labels, MatchType, Matcher, METRIC_NAME};

/// Parse an expression string into an AST
pub fn parse_expr(input: &str) -> QueryResult<Expr> {
    let parser = ExprParser { src: input };

    match parser.expr(input) {
        Ok((remaining, expr)) => {
            let (remaining, _) = sp(remaining).map_err(|e| parser.to_error(e))?;
            if remaining.is_empty() {
                Ok(expr)
            } else {
                Err(parser.error_at(remaining, None))
            }
        }
        Err(e) => Err(parser.to_error(e)),
    }
}

/// A series descriptor from a load script
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesDesc {
    pub labels: Labels,
    /// One entry per step; `None` is a gap
    pub values: Vec<Option<f64>>,
}

/// Parse `metric{label="v"} 1 2+3x4 _ ...`
pub fn parse_series_desc(input: &str) -> QueryResult<SeriesDesc> {
    let parser = ExprParser { src: input };
    let (rest, labels) = parser
        .series_labels(input)
        .map_err(|e| parser.to_error(e))?;

    let mut values = Vec::new();
    for token in rest.split_whitespace() {
        expand_series_value(token, &mut values).ok_or_else(|| {
            QueryError::Parse(format!("invalid series value {:?}", token))
        })?;
    }

    Ok(SeriesDesc { labels, values })
}

/// Parse a PromQL duration such as `5m`, `1h30m` or `250ms`
pub fn parse_duration(input: &str) -> QueryResult<Duration> {
    static DURATION_RE: OnceLock<Regex> = OnceLock::new();
    let re = DURATION_RE.get_or_init(|| {
        Regex::new(r"^(?:(\d+)y)?(?:(\d+)w)?(?:(\d+)d)?(?:(\d+)h)?(?:(\d+)m)?(?:(\d+)s)?(?:(\d+)ms)?$")
            .expect("duration pattern is valid")
    });

    let invalid = || QueryError::Parse(format!("not a valid duration string: {:?}", input));
    if input.is_empty() || input == "0" {
        return if input == "0" { Ok(Duration::ZERO) } else { Err(invalid()) };
    }
    let caps = re.captures(input).ok_or_else(invalid)?;

    const UNITS_MS: [u64; 7] = [
        365 * 24 * 60 * 60 * 1000,
        7 * 24 * 60 * 60 * 1000,
        24 * 60 * 60 * 1000,
        60 * 60 * 1000,
        60 * 1000,
        1000,
        1,
    ];
    let mut total: u64 = 0;
    for (idx, mult) in UNITS_MS.iter().enumerate() {
        if let Some(m) = caps.get(idx + 1) {
            let v: u64 = m.as_str().parse().map_err(|_| invalid())?;
            total = v
                .checked_mul(*mult)
                .and_then(|ms| total.checked_add(ms))
                .ok_or_else(invalid)?;
        }
    }
    // Durations are used as signed millisecond offsets
    if total > i64::MAX as u64 {
        return Err(invalid());
    }
    Ok(Duration::from_millis(total))
}

// =============================================================================
// Parser plumbing
// =============================================================================

/// Error carried through nom; `message` is set for semantic failures.
#[derive(Debug)]
struct SyntaxError<'a> {
    input: &'a str,
    message: Option<String>,
}

impl<'a> ParseError<&'a str> for SyntaxError<'a> {
    fn from_error_kind(input: &'a str, _kind: ErrorKind) -> Self {
        Self {
            input,
            message: None,
        }
    }

    fn append(_input: &'a str, _kind: ErrorKind, other: Self) -> Self {
        other
    }

    fn or(self, other: Self) -> Self {
        // Keep whichever alternative got further.
        if other.input.len() < self.input.len() {
            other
        } else {
            self
        }
    }
}

impl<'a, E> FromExternalError<&'a str, E> for SyntaxError<'a> {
    fn from_external_error(input: &'a str, _kind: ErrorKind, _e: E) -> Self {
        Self {
            input,
            message: None,
        }
    }
}

type PResult<'a, T> = IResult<&'a str, T, SyntaxError<'a>>;

fn fail<'a, T>(input: &'a str, message: impl Into<String>) -> PResult<'a, T> {
    Err(nom::Err::Failure(SyntaxError {
        input,
        message: Some(message.into()),
    }))
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == ':'
}

/// Skip whitespace and `#` comments
fn sp(input: &str) -> PResult<'_, ()> {
    let mut rest = input;
    loop {
        let trimmed = rest.trim_start();
        match trimmed.strip_prefix('#') {
            Some(comment) => {
                rest = comment.find('\n').map(|n| &comment[n..]).unwrap_or("");
            }
            None => return Ok((trimmed, ())),
        }
    }
}

fn token<'a>(t: &'static str) -> impl FnMut(&'a str) -> PResult<'a, &'a str> {
    move |input| {
        let (input, _) = sp(input)?;
        tag(t)(input)
    }
}

/// Like `token` but a miss is a hard failure
fn expect<'a>(t: &'static str) -> impl FnMut(&'a str) -> PResult<'a, &'a str> {
    move |input| match token(t)(input) {
        Err(nom::Err::Error(e)) => fail(e.input, format!("expected {:?}", t)),
        other => other,
    }
}

/// Case-insensitive keyword not followed by an identifier character
fn keyword<'a>(kw: &'static str) -> impl FnMut(&'a str) -> PResult<'a, &'a str> {
    move |input| {
        let (input, _) = sp(input)?;
        terminated(tag_no_case(kw), not(satisfy(is_ident_char)))(input)
    }
}

fn metric_identifier(input: &str) -> PResult<'_, &str> {
    recognize(pair(
        satisfy(|c| c.is_ascii_alphabetic() || c == '_' || c == ':'),
        take_while(is_ident_char),
    ))(input)
}

fn label_name(input: &str) -> PResult<'_, &str> {
    let (input, _) = sp(input)?;
    recognize(pair(
        satisfy(|c| c.is_ascii_alphabetic() || c == '_'),
        take_while(|c: char| c.is_ascii_alphanumeric() || c == '_'),
    ))(input)
}

fn number_literal(input: &str) -> PResult<'_, f64> {
    alt((
        map_res(preceded(tag_no_case("0x"), hex_digit1), |h: &str| {
            i64::from_str_radix(h, 16).map(|v| v as f64)
        }),
        map_res(
            recognize(pair(
                alt((
                    recognize(pair(digit1, opt(pair(char('.'), digit0)))),
                    recognize(pair(char('.'), digit1)),
                )),
                opt(tuple((one_of("eE"), opt(one_of("+-")), digit1))),
            )),
            |s: &str| s.parse::<f64>(),
        ),
    ))(input)
}

fn duration_token(input: &str) -> PResult<'_, &str> {
    let (input, _) = sp(input)?;
    recognize(nom::multi::many1(pair(
        digit1,
        alt((tag("ms"), tag("s"), tag("m"), tag("h"), tag("d"), tag("w"), tag("y"))),
    )))(input)
}

/// Quoted string with Go-style escapes, or a raw backtick string
fn string_literal(input: &str) -> PResult<'_, String> {
    let (rest, _) = sp(input)?;
    let mut chars = rest.char_indices();
    let quote = match chars.next() {
        Some((_, q @ ('"' | '\'' | '`'))) => q,
        _ => return Err(nom::Err::Error(SyntaxError::from_error_kind(rest, ErrorKind::Char))),
    };

    let mut out = String::new();
    while let Some((idx, c)) = chars.next() {
        if c == quote {
            return Ok((&rest[idx + c.len_utf8()..], out));
        }
        if c == '\\' && quote != '`' {
            let escaped = match chars.next() {
                Some((_, 'n')) => '\n',
                Some((_, 't')) => '\t',
                Some((_, 'r')) => '\r',
                Some((_, 'a')) => '\u{7}',
                Some((_, 'b')) => '\u{8}',
                Some((_, 'f')) => '\u{c}',
                Some((_, 'v')) => '\u{b}',
                Some((_, '\\')) => '\\',
                Some((_, '"')) => '"',
                Some((_, '\'')) => '\'',
                Some((at, other)) => {
                    return fail(&rest[at..], format!("unknown escape sequence \\{}", other))
                }
                None => break,
            };
            out.push(escaped);
            continue;
        }
        if c == '\n' && quote != '`' {
            break;
        }
        out.push(c);
    }
    fail(rest, "unterminated quoted string")
}

fn match_op(input: &str) -> PResult<'_, MatchType> {
    let (input, _) = sp(input)?;
    alt((
        nom::combinator::value(MatchType::RegexMatch, tag("=~")),
        nom::combinator::value(MatchType::RegexNoMatch, tag("!~")),
        nom::combinator::value(MatchType::NotEqual, tag("!=")),
        nom::combinator::value(MatchType::Equal, tag("=")),
    ))(input)
}

/// Modifiers that may follow a binary operator
#[derive(Default)]
struct BinaryModifiers {
    return_bool: bool,
    on: Option<bool>,
    labels: Vec<String>,
    card: Option<MatchCardinality>,
    include: Vec<String>,
}

struct ExprParser<'a> {
    src: &'a str,
}

impl<'a> ExprParser<'a> {
    fn at(&self, rest: &'a str) -> usize {
        self.src.len() - rest.len()
    }

    fn error_at(&self, rest: &'a str, message: Option<String>) -> QueryError {
        let pos = self.at(rest);
        let message = message.unwrap_or_else(|| match rest.chars().next() {
            Some(c) => format!("unexpected character {:?}", c),
            None => "unexpected end of input".to_string(),
        });
        QueryError::Parse(format!("at char {}: {}", pos + 1, message))
    }

    fn to_error(&self, err: nom::Err<SyntaxError<'a>>) -> QueryError {
        match err {
            nom::Err::Error(e) | nom::Err::Failure(e) => {
                let rest = sp(e.input).map(|(r, _)| r).unwrap_or(e.input);
                self.error_at(rest, e.message)
            }
            nom::Err::Incomplete(_) => QueryError::Parse("unexpected end of input".to_string()),
        }
    }

    fn expr(&self, input: &'a str) -> PResult<'a, Expr> {
        self.binary(input, 0)
    }

    // -------------------------------------------------------------------------
    // Binary expressions (precedence climbing)
    // -------------------------------------------------------------------------

    fn binary(&self, input: &'a str, min_prec: u8) -> PResult<'a, Expr> {
        let (mut input, mut lhs) = self.unary(input)?;
        loop {
            let (rest, op) = match self.binary_op(input) {
                Ok(r) => r,
                Err(nom::Err::Error(_)) => return Ok((input, lhs)),
                Err(e) => return Err(e),
            };
            if op.precedence() < min_prec {
                return Ok((input, lhs));
            }
            let op_input = input;
            let (rest, mods) = self.binary_modifiers(rest)?;
            let next_prec = if op.is_right_associative() {
                op.precedence()
            } else {
                op.precedence() + 1
            };
            let (rest, rhs) = self.binary(rest, next_prec)?;
            lhs = self.build_binary(op_input, op, lhs, rhs, mods)?;
            input = rest;
        }
    }

    fn binary_op(&self, input: &'a str) -> PResult<'a, BinaryOp> {
        use nom::combinator::value;
        let (input, _) = sp(input)?;
        alt((
            value(BinaryOp::Eql, tag("==")),
            value(BinaryOp::Neq, tag("!=")),
            value(BinaryOp::Gte, tag(">=")),
            value(BinaryOp::Lte, tag("<=")),
            value(BinaryOp::Gtr, tag(">")),
            value(BinaryOp::Lss, tag("<")),
            value(BinaryOp::Add, tag("+")),
            value(BinaryOp::Sub, tag("-")),
            value(BinaryOp::Mul, tag("*")),
            value(BinaryOp::Div, tag("/")),
            value(BinaryOp::Mod, tag("%")),
            value(BinaryOp::Pow, tag("^")),
            value(BinaryOp::And, keyword("and")),
            value(BinaryOp::Or, keyword("or")),
            value(BinaryOp::Unless, keyword("unless")),
        ))(input)
    }

    fn binary_modifiers(&self, input: &'a str) -> PResult<'a, BinaryModifiers> {
        let mut mods = BinaryModifiers::default();
        let (input, b) = opt(keyword("bool"))(input)?;
        mods.return_bool = b.is_some();

        let (input, on) = opt(alt((keyword("on"), keyword("ignoring"))))(input)?;
        let input = match on {
            Some(kw) => {
                let (input, labels) = self.label_list(input)?;
                mods.on = Some(kw.eq_ignore_ascii_case("on"));
                mods.labels = labels;
                input
            }
            None => input,
        };

        let (input, group) = opt(alt((keyword("group_left"), keyword("group_right"))))(input)?;
        let input = match group {
            Some(kw) => {
                let (input, include) = match token("(")(input) {
                    Ok(_) => self.label_list(input)?,
                    Err(_) => (input, Vec::new()),
                };
                mods.card = Some(if kw.eq_ignore_ascii_case("group_left") {
                    MatchCardinality::ManyToOne
                } else {
                    MatchCardinality::OneToMany
                });
                mods.include = include;
                input
            }
            None => input,
        };

        Ok((input, mods))
    }

    fn build_binary(
        &self,
        op_input: &'a str,
        op: BinaryOp,
        lhs: Expr,
        rhs: Expr,
        mods: BinaryModifiers,
    ) -> Result<Expr, nom::Err<SyntaxError<'a>>> {
        let lt = lhs.value_type();
        let rt = rhs.value_type();

        for t in [lt, rt] {
            if t != ValueType::Scalar && t != ValueType::Vector {
                return fail(
                    op_input,
                    "binary expression must contain only scalar and instant vector types",
                )
                .map(|(_, e)| e);
            }
        }
        if mods.return_bool && !op.is_comparison() {
            return fail(op_input, "bool modifier can only be used on comparison operators")
                .map(|(_, e)| e);
        }
        if op.is_comparison()
            && !mods.return_bool
            && lt == ValueType::Scalar
            && rt == ValueType::Scalar
        {
            return fail(op_input, "comparisons between scalars must use BOOL modifier")
                .map(|(_, e)| e);
        }

        let both_vectors = lt == ValueType::Vector && rt == ValueType::Vector;
        let has_matching = mods.on.is_some() || mods.card.is_some();
        if has_matching && !both_vectors {
            return fail(op_input, "vector matching only allowed between instant vectors")
                .map(|(_, e)| e);
        }
        if op.is_set_operator() && !both_vectors {
            return fail(
                op_input,
                format!("set operator {:?} not allowed in binary scalar expression", op.to_string()),
            )
            .map(|(_, e)| e);
        }
        if op.is_set_operator() && mods.card.is_some() {
            return fail(op_input, format!("no grouping allowed for {:?} operation", op.to_string()))
                .map(|(_, e)| e);
        }
        if mods.on == Some(true) {
            if let Some(l) = mods.include.iter().find(|l| mods.labels.contains(l)) {
                return fail(
                    op_input,
                    format!("label {:?} must not occur in ON and GROUP clause at once", l),
                )
                .map(|(_, e)| e);
            }
        }

        let matching = if both_vectors {
            let mut card = mods.card.unwrap_or(MatchCardinality::OneToOne);
            if op.is_set_operator() {
                card = MatchCardinality::ManyToMany;
            }
            Some(VectorMatching {
                card,
                on: mods.on.unwrap_or(false),
                labels: mods.labels,
                include: mods.include,
            })
        } else {
            None
        };

        Ok(Expr::Binary(BinaryExpr {
            op,
            lhs: Arc::new(lhs),
            rhs: Arc::new(rhs),
            matching,
            return_bool: mods.return_bool,
        }))
    }

    // -------------------------------------------------------------------------
    // Unary and postfix
    // -------------------------------------------------------------------------

    fn unary(&self, input: &'a str) -> PResult<'a, Expr> {
        let (trimmed, _) = sp(input)?;
        let op = match trimmed.chars().next() {
            Some('-') => UnaryOp::Sub,
            Some('+') => UnaryOp::Add,
            _ => return self.postfix(trimmed),
        };
        let start = self.at(trimmed);
        let (rest, operand) = self.binary(&trimmed[1..], BinaryOp::Pow.precedence())?;

        let t = operand.value_type();
        if t != ValueType::Scalar && t != ValueType::Vector {
            return fail(
                trimmed,
                format!(
                    "unary expression only allowed on expressions of type scalar or instant vector, got {:?}",
                    t.to_string()
                ),
            );
        }

        let expr = match (op, operand) {
            (UnaryOp::Add, operand) => operand,
            (UnaryOp::Sub, Expr::NumberLiteral(n)) => Expr::NumberLiteral(NumberLiteral {
                val: -n.val,
                pos: PositionRange::new(start, n.pos.end),
            }),
            (UnaryOp::Sub, operand) => Expr::Unary(UnaryExpr {
                op: UnaryOp::Sub,
                expr: Arc::new(operand),
                start,
            }),
        };
        Ok((rest, expr))
    }

    fn postfix(&self, input: &'a str) -> PResult<'a, Expr> {
        let (mut input, mut expr) = self.primary(input)?;
        loop {
            if let Ok((rest, _)) = token("[")(input) {
                let (rest, e) = self.range_suffix(rest, input, expr)?;
                input = rest;
                expr = e;
                continue;
            }
            if let Ok((rest, _)) = keyword("offset")(input) {
                let (rest, e) = self.offset_suffix(rest, input, expr)?;
                input = rest;
                expr = e;
                continue;
            }
            if let Ok((rest, _)) = token("@")(input) {
                let (rest, e) = self.at_suffix(rest, input, expr)?;
                input = rest;
                expr = e;
                continue;
            }
            return Ok((input, expr));
        }
    }

    fn duration(&self, input: &'a str) -> PResult<'a, Duration> {
        let (rest, text) = match duration_token(input) {
            Ok(r) => r,
            Err(_) => {
                let (at, _) = sp(input)?;
                return fail(at, "expected duration");
            }
        };
        match parse_duration(text) {
            Ok(d) => Ok((rest, d)),
            Err(e) => fail(input, e.to_string()),
        }
    }

    fn range_suffix(&self, input: &'a str, start: &'a str, expr: Expr) -> PResult<'a, Expr> {
        let (input, range) = self.duration(input)?;
        if range.is_zero() {
            return fail(start, "range duration must be greater than 0");
        }

        let (input, colon) = opt(token(":"))(input)?;
        if colon.is_none() {
            let (input, _) = expect("]")(input)?;
            let end_pos = self.at(input);
            let selector = match expr {
                Expr::VectorSelector(vs) => vs,
                _ => return fail(start, "ranges only allowed for vector selectors"),
            };
            if selector.timestamp.is_some() || !selector.offset.is_zero() {
                return fail(start, "no offset or @ modifiers allowed before range");
            }
            return Ok((
                input,
                Expr::MatrixSelector(MatrixSelector {
                    selector,
                    range,
                    end_pos,
                }),
            ));
        }

        let (input, step) = match token("]")(input) {
            Ok(_) => (input, None),
            Err(_) => {
                let (input, step) = self.duration(input)?;
                if step.is_zero() {
                    return fail(start, "subquery step must be greater than 0");
                }
                (input, Some(step))
            }
        };
        let (input, _) = expect("]")(input)?;

        if expr.value_type() != ValueType::Vector {
            return fail(
                start,
                format!(
                    "subquery is only allowed on instant vector, got {:?}",
                    expr.value_type().to_string()
                ),
            );
        }
        Ok((
            input,
            Expr::Subquery(SubqueryExpr {
                expr: Arc::new(expr),
                range,
                step,
                offset: Duration::ZERO,
                timestamp: None,
                end_pos: self.at(input),
            }),
        ))
    }

    fn offset_suffix(&self, input: &'a str, start: &'a str, expr: Expr) -> PResult<'a, Expr> {
        if let Ok((_, _)) = token("-")(input) {
            return fail(input, "negative offsets are not supported");
        }
        let (input, offset) = self.duration(input)?;
        let end = self.at(input);

        let current = match &expr {
            Expr::VectorSelector(vs) => vs.offset,
            Expr::MatrixSelector(ms) => ms.selector.offset,
            Expr::Subquery(sq) => sq.offset,
            _ => {
                return fail(
                    start,
                    "offset modifier must be preceded by an instant vector selector or range vector selector or a subquery",
                )
            }
        };
        if !current.is_zero() {
            return fail(start, "offset may not be set multiple times");
        }

        let expr = match expr {
            Expr::VectorSelector(mut vs) => {
                vs.offset = offset;
                vs.pos.end = end;
                Expr::VectorSelector(vs)
            }
            Expr::MatrixSelector(mut ms) => {
                ms.selector.offset = offset;
                ms.end_pos = end;
                Expr::MatrixSelector(ms)
            }
            Expr::Subquery(mut sq) => {
                sq.offset = offset;
                sq.end_pos = end;
                Expr::Subquery(sq)
            }
            other => other,
        };
        Ok((input, expr))
    }

    fn at_suffix(&self, input: &'a str, start: &'a str, expr: Expr) -> PResult<'a, Expr> {
        let (input, _) = sp(input)?;
        let (input, sign) = opt(one_of("+-"))(input)?;
        let (input, value) = match number_literal(input) {
            Ok(r) => r,
            Err(_) => return fail(input, "expected timestamp after @"),
        };
        let seconds = if sign == Some('-') { -value } else { value };
        if !seconds.is_finite() || seconds.abs() > (i64::MAX / 1000) as f64 {
            return fail(start, "timestamp out of bounds for @ modifier");
        }
        let ts = (seconds * 1000.0).round() as i64;
        let end = self.at(input);

        let current = match &expr {
            Expr::VectorSelector(vs) => vs.timestamp,
            Expr::MatrixSelector(ms) => ms.selector.timestamp,
            Expr::Subquery(sq) => sq.timestamp,
            _ => {
                return fail(
                    start,
                    "@ modifier must be preceded by an instant vector selector or range vector selector or a subquery",
                )
            }
        };
        if current.is_some() {
            return fail(start, "@ <timestamp> may not be set multiple times");
        }

        let expr = match expr {
            Expr::VectorSelector(mut vs) => {
                vs.timestamp = Some(ts);
                vs.pos.end = end;
                Expr::VectorSelector(vs)
            }
            Expr::MatrixSelector(mut ms) => {
                ms.selector.timestamp = Some(ts);
                ms.end_pos = end;
                Expr::MatrixSelector(ms)
            }
            Expr::Subquery(mut sq) => {
                sq.timestamp = Some(ts);
                sq.end_pos = end;
                Expr::Subquery(sq)
            }
            other => other,
        };
        Ok((input, expr))
    }

    // -------------------------------------------------------------------------
    // Primary expressions
    // -------------------------------------------------------------------------

    fn primary(&self, input: &'a str) -> PResult<'a, Expr> {
        let (input, _) = sp(input)?;
        let start = self.at(input);
        match input.chars().next() {
            Some('(') => {
                let (rest, inner) = self.expr(&input[1..])?;
                let (rest, _) = expect(")")(rest)?;
                Ok((
                    rest,
                    Expr::Paren(ParenExpr {
                        expr: Arc::new(inner),
                        pos: PositionRange::new(start, self.at(rest)),
                    }),
                ))
            }
            Some('"') | Some('\'') | Some('`') => {
                let (rest, val) = string_literal(input)?;
                Ok((
                    rest,
                    Expr::StringLiteral(StringLiteral {
                        val,
                        pos: PositionRange::new(start, self.at(rest)),
                    }),
                ))
            }
            Some('{') => self.vector_selector(input, None, start),
            Some(c) if c.is_ascii_digit() || c == '.' => {
                let (rest, val) = number_literal(input)?;
                Ok((
                    rest,
                    Expr::NumberLiteral(NumberLiteral {
                        val,
                        pos: PositionRange::new(start, self.at(rest)),
                    }),
                ))
            }
            Some(_) => self.identifier_expr(input, start),
            None => fail(input, "unexpected end of input"),
        }
    }

    fn identifier_expr(&self, input: &'a str, start: usize) -> PResult<'a, Expr> {
        let (rest, name) = metric_identifier(input)?;

        if name.eq_ignore_ascii_case("inf") || name.eq_ignore_ascii_case("nan") {
            let val = if name.eq_ignore_ascii_case("inf") {
                f64::INFINITY
            } else {
                f64::NAN
            };
            return Ok((
                rest,
                Expr::NumberLiteral(NumberLiteral {
                    val,
                    pos: PositionRange::new(start, self.at(rest)),
                }),
            ));
        }

        let opens_call = token("(")(rest).is_ok();
        if let Some(op) = AggregateOp::from_name(name) {
            if opens_call || keyword("by")(rest).is_ok() || keyword("without")(rest).is_ok() {
                return self.aggregate(rest, op, start);
            }
        }
        if opens_call {
            return match get_function(name) {
                Some(func) => self.call(rest, func, start),
                None => fail(input, format!("unknown function with name {:?}", name)),
            };
        }

        self.vector_selector(rest, Some(name.to_string()), start)
    }

    fn vector_selector(
        &self,
        input: &'a str,
        name: Option<String>,
        start: usize,
    ) -> PResult<'a, Expr> {
        let mut matchers = Vec::new();
        if let Some(name) = &name {
            matchers.push(Matcher::equal(METRIC_NAME, name.clone()));
        }

        let input = match token("{")(input) {
            Ok((rest, _)) => {
                let (rest, parsed) = self.label_matchers(rest)?;
                if name.is_some() && parsed.iter().any(|m| m.name == METRIC_NAME) {
                    return fail(input, "metric name must not be set twice");
                }
                matchers.extend(parsed);
                rest
            }
            Err(_) => input,
        };

        if !matchers.iter().any(|m| !m.matches("")) {
            return fail(
                input,
                "vector selector must contain at least one non-empty matcher",
            );
        }

        Ok((
            input,
            Expr::VectorSelector(VectorSelector {
                name,
                matchers,
                offset: Duration::ZERO,
                timestamp: None,
                pos: PositionRange::new(start, self.at(input)),
            }),
        ))
    }

    /// Matchers after the opening brace, through the closing brace
    fn label_matchers(&self, mut input: &'a str) -> PResult<'a, Vec<Matcher>> {
        let mut matchers = Vec::new();
        loop {
            if let Ok((rest, _)) = token("}")(input) {
                return Ok((rest, matchers));
            }
            let (rest, name) = match label_name(input) {
                Ok(r) => r,
                Err(_) => return fail(input, "expected label matcher"),
            };
            let (rest, op) = match match_op(rest) {
                Ok(r) => r,
                Err(_) => return fail(rest, "expected label matching operator"),
            };
            let (rest, value) = match string_literal(rest) {
                Ok(r) => r,
                Err(nom::Err::Error(_)) => return fail(rest, "expected quoted label value"),
                Err(e) => return Err(e),
            };
            let matcher = match Matcher::new(op, name, value) {
                Ok(m) => m,
                Err(e) => return fail(input, e.to_string()),
            };
            matchers.push(matcher);

            input = match token(",")(rest) {
                Ok((rest, _)) => rest,
                Err(_) => {
                    let (rest, _) = expect("}")(rest)?;
                    return Ok((rest, matchers));
                }
            };
        }
    }

    /// `(a, b, c)` label name list
    fn label_list(&self, input: &'a str) -> PResult<'a, Vec<String>> {
        let (mut input, _) = expect("(")(input)?;
        let mut labels = Vec::new();
        loop {
            if let Ok((rest, _)) = token(")")(input) {
                return Ok((rest, labels));
            }
            let (rest, name) = match label_name(input) {
                Ok(r) => r,
                Err(_) => return fail(input, "expected label name"),
            };
            labels.push(name.to_string());
            input = match token(",")(rest) {
                Ok((rest, _)) => rest,
                Err(_) => {
                    let (rest, _) = expect(")")(rest)?;
                    return Ok((rest, labels));
                }
            };
        }
    }

    fn grouping(&self, input: &'a str) -> PResult<'a, Option<(bool, Vec<String>)>> {
        let (input, kw) = opt(alt((keyword("by"), keyword("without"))))(input)?;
        match kw {
            Some(kw) => {
                let (input, labels) = self.label_list(input)?;
                Ok((input, Some((kw.eq_ignore_ascii_case("without"), labels))))
            }
            None => Ok((input, None)),
        }
    }

    fn aggregate(&self, input: &'a str, op: AggregateOp, start: usize) -> PResult<'a, Expr> {
        let (input, leading) = self.grouping(input)?;
        let (input, _) = expect("(")(input)?;
        let (input, first) = self.expr(input)?;
        let (input, second) = opt(preceded(token(","), |i| self.expr(i)))(input)?;
        let (input, _) = expect(")")(input)?;
        let (input, trailing) = match leading {
            Some(_) => (input, None),
            None => self.grouping(input)?,
        };
        let end = self.at(input);

        let (param, expr) = match second {
            Some(expr) => (Some(first), expr),
            None => (None, first),
        };

        match (op.param_type(), &param) {
            (Some(_), None) => {
                return fail(
                    input,
                    "wrong number of arguments for aggregate expression provided, expected 2, got 1",
                )
            }
            (None, Some(_)) => {
                return fail(
                    input,
                    "wrong number of arguments for aggregate expression provided, expected 1, got 2",
                )
            }
            (Some(want), Some(p)) if p.value_type() != want => {
                return fail(
                    input,
                    format!(
                        "expected type {} in aggregation parameter, got {}",
                        want,
                        p.value_type()
                    ),
                )
            }
            _ => {}
        }
        if expr.value_type() != ValueType::Vector {
            return fail(
                input,
                format!(
                    "expected type instant vector in aggregation expression, got {}",
                    expr.value_type()
                ),
            );
        }

        let (without, grouping) = leading.or(trailing).unwrap_or((false, Vec::new()));
        Ok((
            input,
            Expr::Aggregate(AggregateExpr {
                op,
                expr: Arc::new(expr),
                param: param.map(Arc::new),
                grouping,
                without,
                pos: PositionRange::new(start, end),
            }),
        ))
    }

    fn call(
        &self,
        input: &'a str,
        func: &'static crate::query::functions::Function,
        start: usize,
    ) -> PResult<'a, Expr> {
        let (mut input, _) = expect("(")(input)?;
        let mut args = Vec::new();
        if let Ok((rest, _)) = token(")")(input) {
            input = rest;
        } else {
            loop {
                let (rest, arg) = self.expr(input)?;
                args.push(arg);
                match token(",")(rest) {
                    Ok((rest, _)) => input = rest,
                    Err(_) => {
                        let (rest, _) = expect(")")(rest)?;
                        input = rest;
                        break;
                    }
                }
            }
        }

        let declared = func.arg_types.len();
        if func.variadic == 0 {
            if declared != args.len() {
                return fail(
                    input,
                    format!(
                        "expected {} argument(s) in call to {:?}, got {}",
                        declared,
                        func.name,
                        args.len()
                    ),
                );
            }
        } else {
            let min = declared - 1;
            if args.len() < min {
                return fail(
                    input,
                    format!(
                        "expected at least {} argument(s) in call to {:?}, got {}",
                        min,
                        func.name,
                        args.len()
                    ),
                );
            }
            if func.variadic > 0 && args.len() > min + func.variadic as usize {
                return fail(
                    input,
                    format!(
                        "expected at most {} argument(s) in call to {:?}, got {}",
                        min + func.variadic as usize,
                        func.name,
                        args.len()
                    ),
                );
            }
        }

        for (i, arg) in args.iter().enumerate() {
            let want = func.arg_types[i.min(declared.saturating_sub(1))];
            if arg.value_type() != want {
                return fail(
                    input,
                    format!(
                        "expected type {} in call to function {:?}, got {}",
                        want,
                        func.name,
                        arg.value_type()
                    ),
                );
            }
        }

        Ok((
            input,
            Expr::Call(Call {
                func,
                args: args.into_iter().map(Arc::new).collect(),
                pos: PositionRange::new(start, self.at(input)),
            }),
        ))
    }

    // -------------------------------------------------------------------------
    // Series descriptors
    // -------------------------------------------------------------------------

    fn series_labels(&self, input: &'a str) -> PResult<'a, Labels> {
        let (input, _) = sp(input)?;
        let (input, name) = opt(metric_identifier)(input)?;
        let mut labels = Vec::new();
        if let Some(name) = name {
            labels.push(Label::new(METRIC_NAME, name));
        }

        let input = match token("{")(input) {
            Ok((rest, _)) => {
                let (rest, matchers) = self.label_matchers(rest)?;
                for m in matchers {
                    if m.kind != MatchType::Equal {
                        return fail(input, "series descriptors only allow equality");
                    }
                    labels.push(Label::new(m.name, m.value));
                }
                rest
            }
            Err(_) => input,
        };

        if labels.is_empty() {
            return fail(input, "series descriptor without labels");
        }
        Ok((input, Labels::new(labels)))
    }
}

/// Expand one load-script value token into `out`
fn expand_series_value(token: &str, out: &mut Vec<Option<f64>>) -> Option<()> {
    static EXPANDING_RE: OnceLock<Regex> = OnceLock::new();
    let re = EXPANDING_RE.get_or_init(|| {
        Regex::new(
            r"^(?P<start>[-+]?(?:\d+(?:\.\d*)?|\.\d+)(?:[eE][-+]?\d+)?|_)(?:(?P<op>[-+])(?P<inc>(?:\d+(?:\.\d*)?|\.\d+)(?:[eE][-+]?\d+)?))?x(?P<n>\d+)$",
        )
        .expect("series value pattern is valid")
    });

    if token == "_" {
        out.push(None);
        return Some(());
    }

    match re.captures(token) {
        Some(caps) => {
            let n: usize = caps.name("n")?.as_str().parse().ok()?;
            let start = caps.name("start")?.as_str();
            if start == "_" {
                out.extend(std::iter::repeat(None).take(n));
                return Some(());
            }
            let start: f64 = start.parse().ok()?;
            let inc: f64 = match (caps.name("op"), caps.name("inc")) {
                (Some(op), Some(inc)) => {
                    let inc: f64 = inc.as_str().parse().ok()?;
                    if op.as_str() == "-" {
                        -inc
                    } else {
                        inc
                    }
                }
                _ => 0.0,
            };
            for i in 0..=n {
                out.push(Some(start + inc * i as f64));
            }
            Some(())
        }
        None => {
            let v: f64 = token.parse().ok()?;
            out.push(Some(v));
            Some(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn selector(expr: &Expr) -> &VectorSelector {
        match expr {
            Expr::VectorSelector(vs) => vs,
            Expr::MatrixSelector(ms) => &ms.selector,
            other => panic!("not a selector: {:?}", other),
        }
    }

    #[test]
    fn test_parse_vector_selector() {
        let expr = parse_expr("http_requests{job=\"api\", code=~\"5..\"}").unwrap();
        let vs = selector(&expr);
        assert_eq!(vs.name.as_deref(), Some("http_requests"));
        assert_eq!(vs.matchers.len(), 3);
        assert_eq!(vs.matchers[2].kind, MatchType::RegexMatch);
        assert_eq!(vs.pos, PositionRange::new(0, 37));
    }

    #[test]
    fn test_parse_offset_and_at() {
        let expr = parse_expr("foo @ 15 offset 1m").unwrap();
        let vs = selector(&expr);
        assert_eq!(vs.timestamp, Some(15_000));
        assert_eq!(vs.offset, Duration::from_secs(60));

        let expr = parse_expr("foo[2m] offset 2m @ 1.5").unwrap();
        let vs = selector(&expr);
        assert_eq!(vs.timestamp, Some(1_500));
        assert_eq!(vs.offset, Duration::from_secs(120));
    }

    #[test]
    fn test_parse_subquery() {
        let expr = parse_expr("rate(foo[1m])[10m:5s] offset 1m @ 123").unwrap();
        match expr {
            Expr::Subquery(sq) => {
                assert_eq!(sq.range, Duration::from_secs(600));
                assert_eq!(sq.step, Some(Duration::from_secs(5)));
                assert_eq!(sq.offset, Duration::from_secs(60));
                assert_eq!(sq.timestamp, Some(123_000));
            }
            other => panic!("expected subquery, got {:?}", other),
        }

        let expr = parse_expr("foo[5m:]").unwrap();
        assert!(matches!(expr, Expr::Subquery(SubqueryExpr { step: None, .. })));
    }

    #[test]
    fn test_parse_precedence() {
        assert_eq!(parse_expr("1 + 2 * 3").unwrap().to_string(), "1 + 2 * 3");
        match parse_expr("a + b * c").unwrap() {
            Expr::Binary(b) => {
                assert_eq!(b.op, BinaryOp::Add);
                assert!(matches!(&*b.rhs, Expr::Binary(r) if r.op == BinaryOp::Mul));
            }
            other => panic!("unexpected {:?}", other),
        }
        match parse_expr("a - b - c").unwrap() {
            Expr::Binary(b) => assert!(matches!(&*b.lhs, Expr::Binary(_))),
            other => panic!("unexpected {:?}", other),
        }
        match parse_expr("2 ^ 3 ^ 2").unwrap() {
            Expr::Binary(b) => assert!(matches!(&*b.rhs, Expr::Binary(_))),
            other => panic!("unexpected {:?}", other),
        }
        match parse_expr("a or b and c").unwrap() {
            Expr::Binary(b) => assert_eq!(b.op, BinaryOp::Or),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_unary() {
        match parse_expr("-1").unwrap() {
            Expr::NumberLiteral(n) => assert_eq!(n.val, -1.0),
            other => panic!("unexpected {:?}", other),
        }
        match parse_expr("-2 ^ 2").unwrap() {
            Expr::Unary(u) => assert!(matches!(&*u.expr, Expr::Binary(_))),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(parse_expr("-foo * 2").unwrap(), Expr::Binary(_)));
    }

    #[test]
    fn test_parse_vector_matching() {
        match parse_expr("foo * ignoring(code) group_left bar").unwrap() {
            Expr::Binary(b) => {
                let m = b.matching.unwrap();
                assert_eq!(m.card, MatchCardinality::ManyToOne);
                assert!(!m.on);
                assert_eq!(m.labels, vec!["code".to_string()]);
            }
            other => panic!("unexpected {:?}", other),
        }
        match parse_expr("foo and bar").unwrap() {
            Expr::Binary(b) => assert_eq!(b.matching.unwrap().card, MatchCardinality::ManyToMany),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_aggregations() {
        match parse_expr("sum without (instance) (foo)").unwrap() {
            Expr::Aggregate(a) => {
                assert!(a.without);
                assert_eq!(a.grouping, vec!["instance".to_string()]);
            }
            other => panic!("unexpected {:?}", other),
        }
        match parse_expr("topk(5, foo) by (job)").unwrap() {
            Expr::Aggregate(a) => {
                assert_eq!(a.op, AggregateOp::Topk);
                assert!(a.param.is_some());
                assert_eq!(a.grouping, vec!["job".to_string()]);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(parse_expr("count_values(\"value\", foo)").is_ok());
    }

    #[test]
    fn test_parse_numbers_and_strings() {
        assert!(matches!(parse_expr("0x1F").unwrap(), Expr::NumberLiteral(n) if n.val == 31.0));
        assert!(matches!(parse_expr("1e3").unwrap(), Expr::NumberLiteral(n) if n.val == 1000.0));
        assert!(matches!(parse_expr("Inf").unwrap(), Expr::NumberLiteral(n) if n.val.is_infinite()));
        assert!(matches!(parse_expr("NaN").unwrap(), Expr::NumberLiteral(n) if n.val.is_nan()));
        assert!(matches!(
            parse_expr("\"a\\tb\"").unwrap(),
            Expr::StringLiteral(s) if s.val == "a\tb"
        ));
        assert!(matches!(
            parse_expr("`raw\\n`").unwrap(),
            Expr::StringLiteral(s) if s.val == "raw\\n"
        ));
    }

    #[test]
    fn test_parse_comments() {
        let expr = parse_expr("foo # trailing comment\n + bar").unwrap();
        assert_eq!(expr.to_string(), "foo + bar");
    }

    #[test]
    fn test_parse_errors() {
        let cases = [
            ("", "unexpected end of input"),
            ("foo{", "expected label matcher"),
            ("unknown_fn(foo)", "unknown function"),
            ("rate(foo)", "expected type range vector"),
            ("time(foo)", "expected 0 argument(s)"),
            ("1 > 2", "must use BOOL modifier"),
            ("foo + bool bar", "bool modifier can only be used on comparison operators"),
            ("1 and 2", "set operator"),
            ("foo offset 1m offset 2m", "offset may not be set multiple times"),
            ("foo @ 1 @ 2", "may not be set multiple times"),
            ("(foo + bar)[5m]", "ranges only allowed for vector selectors"),
            ("foo[5m][10m:]", "subquery is only allowed on instant vector"),
            ("{job=\"\"}", "at least one non-empty matcher"),
            ("topk(foo)", "wrong number of arguments"),
            ("sum(foo[5m])", "expected type instant vector in aggregation expression"),
            ("foo offset -5m", "negative offsets"),
            ("foo bar", "unexpected character 'b'"),
            ("foo{a=~\"(\"}", "Invalid matcher"),
        ];
        for (input, want) in cases {
            let err = parse_expr(input).unwrap_err();
            assert!(
                matches!(&err, QueryError::Parse(msg) if msg.contains(want)),
                "{:?}: got {}",
                input,
                err
            );
        }
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("1y").unwrap(), Duration::from_secs(365 * 86400));
        assert!(parse_duration("5x").is_err());
        assert!(parse_duration("30m1h").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn test_parse_duration_fits_signed_millis() {
        assert!(parse_duration("292000000y").is_ok());
        assert!(parse_duration("300000000y").is_err());
        assert!(parse_expr("rate(foo[300000000y])").is_err());
        assert!(parse_expr("foo offset 300000000y").is_err());
    }

    #[test]
    fn test_parse_series_desc() {
        let desc = parse_series_desc("metric{job=\"1\"} 0+10x2 _ 5 _x2 -1-1x1").unwrap();
        assert_eq!(
            desc.labels,
            Labels::from_pairs([(METRIC_NAME, "metric"), ("job", "1")])
        );
        assert_eq!(
            desc.values,
            vec![
                Some(0.0),
                Some(10.0),
                Some(20.0),
                None,
                Some(5.0),
                None,
                None,
                Some(-1.0),
                Some(-2.0)
            ]
        );

        assert!(parse_series_desc("metric 1 two").is_err());
        assert!(parse_series_desc("metric{job=~\"x\"} 1").is_err());
    }
}
