//! SQL-like row predicates
//!
//! Predicates are SQLite expressions parsed with `sqlparser`: comparisons,
//! `AND`/`OR`/`NOT`, `IS [NOT] NULL`, `[NOT] LIKE`, `[NOT] IN (..)`,
//! `[NOT] BETWEEN .. AND ..`, arithmetic, parentheses, numeric and
//! `'quoted'` literals, and bare, `"double-quoted"`, `[bracketed]` or
//! `` `backticked` `` column names.
//!
//! Evaluation uses SQL three-valued logic: a null operand makes a comparison
//! unknown, and a row matches only if the whole predicate is true. Comparison
//! operands are converted by column affinity the way SQLite converts them, so
//! the in-memory evaluation and the SQL rendered for the query backend agree
//! on which rows match.

use std::cmp::Ordering;

use sqlparser::ast::{BinaryOperator, Expr as SqlExpr, Ident, UnaryOperator, Value};
use sqlparser::dialect::SQLiteDialect;
use sqlparser::parser::{Parser, ParserError};
use sqlparser::tokenizer::Token;

use tp_core::{CellValue, ColumnDescriptor, ColumnKind, ProjectionError, Result};

/// A parsed predicate bound to a column list
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    text: String,
    expr: Expr,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(CellValue),
    Column(usize, Option<Affinity>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(CompareOp, Box<Expr>, Box<Expr>),
    Arith(ArithOp, Box<Expr>, Box<Expr>),
    Negate(Box<Expr>),
    IsNull {
        expr: Box<Expr>,
        negated: bool,
    },
    Like {
        expr: Box<Expr>,
        pattern: Box<Expr>,
        negated: bool,
    },
    In {
        expr: Box<Expr>,
        list: Vec<Expr>,
        negated: bool,
    },
    Between {
        expr: Box<Expr>,
        low: Box<Expr>,
        high: Box<Expr>,
        negated: bool,
    },
}

/// How a column converts the values it is compared with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Affinity {
    Numeric,
    Text,
}

impl Affinity {
    fn of(kind: ColumnKind) -> Option<Self> {
        match kind {
            ColumnKind::Integer | ColumnKind::Real => Some(Affinity::Numeric),
            ColumnKind::Text => Some(Affinity::Text),
            ColumnKind::DateTime => None,
        }
    }

    fn apply(self, value: CellValue) -> CellValue {
        match self {
            Affinity::Numeric => to_numeric(value),
            Affinity::Text => to_text(value),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    fn test(self, ordering: Ordering) -> bool {
        match self {
            CompareOp::Eq => ordering == Ordering::Equal,
            CompareOp::Ne => ordering != Ordering::Equal,
            CompareOp::Lt => ordering == Ordering::Less,
            CompareOp::Le => ordering != Ordering::Greater,
            CompareOp::Gt => ordering == Ordering::Greater,
            CompareOp::Ge => ordering != Ordering::Less,
        }
    }

    fn sql(self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "<>",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl ArithOp {
    fn sql(self) -> &'static str {
        match self {
            ArithOp::Add => "+",
            ArithOp::Sub => "-",
            ArithOp::Mul => "*",
            ArithOp::Div => "/",
        }
    }
}

impl Predicate {
    /// Parse `text`, resolving column names against `columns`
    ///
    /// Names match exactly first, then case-insensitively.
    pub fn parse(text: &str, columns: &[ColumnDescriptor]) -> Result<Self> {
        if text.trim().is_empty() {
            return Err(ProjectionError::InvalidPredicate("empty predicate".into()));
        }

        let dialect = SQLiteDialect {};
        let mut parser = Parser::new(&dialect).try_with_sql(text).map_err(parse_error)?;
        let parsed = parser.parse_expr().map_err(parse_error)?;
        let trailing = parser.peek_token();
        if trailing.token != Token::EOF {
            return Err(ProjectionError::InvalidPredicate(format!(
                "unexpected {} after predicate",
                trailing.token
            )));
        }

        Ok(Self {
            text: text.trim().to_string(),
            expr: bind(&parsed, columns)?,
        })
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Evaluate against one row; `cell` reads a column of that row
    pub fn evaluate(&self, cell: &mut dyn FnMut(usize) -> Result<CellValue>) -> Result<CellValue> {
        self.expr.eval(cell)
    }

    /// Whether the row satisfies the predicate; unknown counts as no
    pub fn matches(&self, cell: &mut dyn FnMut(usize) -> Result<CellValue>) -> Result<bool> {
        Ok(self.evaluate(cell)?.truth() == Some(true))
    }

    /// Columns the predicate reads, ascending
    pub fn columns(&self) -> Vec<usize> {
        let mut columns = Vec::new();
        self.expr.collect_columns(&mut columns);
        columns.sort_unstable();
        columns.dedup();
        columns
    }

    /// Render as a SQL expression
    pub fn to_sql(
        &self,
        column: &dyn Fn(usize) -> String,
        literal: &dyn Fn(&CellValue) -> String,
    ) -> String {
        let mut out = String::new();
        self.expr.write_sql(&mut out, column, literal);
        out
    }
}

impl Expr {
    fn eval(&self, cell: &mut dyn FnMut(usize) -> Result<CellValue>) -> Result<CellValue> {
        let value = match self {
            Expr::Literal(value) => value.clone(),
            Expr::Column(col, affinity) => {
                let value = cell(*col)?;
                match affinity {
                    Some(affinity) => affinity.apply(value),
                    None => value,
                }
            }
            Expr::Not(inner) => CellValue::from_truth(inner.eval(cell)?.truth().map(|b| !b)),
            Expr::And(a, b) => {
                let left = a.eval(cell)?.truth();
                if left == Some(false) {
                    return Ok(CellValue::from_truth(Some(false)));
                }
                let right = b.eval(cell)?.truth();
                CellValue::from_truth(and3(left, right))
            }
            Expr::Or(a, b) => {
                let left = a.eval(cell)?.truth();
                if left == Some(true) {
                    return Ok(CellValue::from_truth(Some(true)));
                }
                let right = b.eval(cell)?.truth();
                CellValue::from_truth(or3(left, right))
            }
            Expr::Compare(op, a, b) => {
                let left = a.eval(cell)?;
                let right = b.eval(cell)?;
                CellValue::from_truth(compare(a, &left, b, &right).map(|o| op.test(o)))
            }
            Expr::Arith(op, a, b) => arith(*op, &a.eval(cell)?, &b.eval(cell)?),
            Expr::Negate(inner) => match numeric(&inner.eval(cell)?) {
                Some(Num::Int(i)) => i
                    .checked_neg()
                    .map(CellValue::Integer)
                    .unwrap_or(CellValue::Real(-(i as f64))),
                Some(Num::Real(f)) => CellValue::Real(-f),
                None => CellValue::Null,
            },
            Expr::IsNull { expr, negated } => {
                CellValue::from_truth(Some(expr.eval(cell)?.is_null() != *negated))
            }
            Expr::Like {
                expr,
                pattern,
                negated,
            } => {
                let value = expr.eval(cell)?;
                let pattern = pattern.eval(cell)?;
                if value.is_null() || pattern.is_null() {
                    CellValue::Null
                } else {
                    let matched = like(&value.to_string(), &pattern.to_string());
                    CellValue::from_truth(Some(matched != *negated))
                }
            }
            Expr::In {
                expr,
                list,
                negated,
            } => {
                let value = expr.eval(cell)?;
                if value.is_null() {
                    return Ok(CellValue::Null);
                }
                let mut found = Some(false);
                for item in list {
                    let candidate = item.eval(cell)?;
                    if candidate.is_null() {
                        found = None;
                    } else if compare(expr, &value, item, &candidate) == Some(Ordering::Equal) {
                        found = Some(true);
                        break;
                    }
                }
                CellValue::from_truth(found.map(|f| f != *negated))
            }
            Expr::Between {
                expr,
                low,
                high,
                negated,
            } => {
                let value = expr.eval(cell)?;
                let low_value = low.eval(cell)?;
                let high_value = high.eval(cell)?;
                let above = compare(expr, &value, low, &low_value).map(|o| o != Ordering::Less);
                let below = compare(expr, &value, high, &high_value).map(|o| o != Ordering::Greater);
                CellValue::from_truth(and3(above, below).map(|b| b != *negated))
            }
        };
        Ok(value)
    }

    fn affinity(&self) -> Option<Affinity> {
        match self {
            Expr::Column(_, affinity) => *affinity,
            _ => None,
        }
    }

    fn collect_columns(&self, out: &mut Vec<usize>) {
        match self {
            Expr::Literal(_) => {}
            Expr::Column(col, _) => out.push(*col),
            Expr::Not(inner) | Expr::Negate(inner) => inner.collect_columns(out),
            Expr::IsNull { expr, .. } => expr.collect_columns(out),
            Expr::And(a, b) | Expr::Or(a, b) | Expr::Compare(_, a, b) | Expr::Arith(_, a, b) => {
                a.collect_columns(out);
                b.collect_columns(out);
            }
            Expr::Like { expr, pattern, .. } => {
                expr.collect_columns(out);
                pattern.collect_columns(out);
            }
            Expr::In { expr, list, .. } => {
                expr.collect_columns(out);
                list.iter().for_each(|item| item.collect_columns(out));
            }
            Expr::Between { expr, low, high, .. } => {
                expr.collect_columns(out);
                low.collect_columns(out);
                high.collect_columns(out);
            }
        }
    }

    fn write_sql(
        &self,
        out: &mut String,
        column: &dyn Fn(usize) -> String,
        literal: &dyn Fn(&CellValue) -> String,
    ) {
        let not = |negated: bool| if negated { "NOT " } else { "" };
        match self {
            Expr::Literal(value) => out.push_str(&literal(value)),
            Expr::Column(col, _) => out.push_str(&column(*col)),
            Expr::Not(inner) => {
                out.push_str("(NOT ");
                inner.write_sql(out, column, literal);
                out.push(')');
            }
            Expr::Negate(inner) => {
                out.push_str("(-");
                inner.write_sql(out, column, literal);
                out.push(')');
            }
            Expr::And(a, b) => write_binary(out, a, "AND", b, column, literal),
            Expr::Or(a, b) => write_binary(out, a, "OR", b, column, literal),
            Expr::Compare(op, a, b) => write_binary(out, a, op.sql(), b, column, literal),
            Expr::Arith(op, a, b) => write_binary(out, a, op.sql(), b, column, literal),
            Expr::IsNull { expr, negated } => {
                out.push('(');
                expr.write_sql(out, column, literal);
                out.push_str(" IS ");
                out.push_str(not(*negated));
                out.push_str("NULL)");
            }
            Expr::Like {
                expr,
                pattern,
                negated,
            } => {
                out.push('(');
                expr.write_sql(out, column, literal);
                out.push(' ');
                out.push_str(not(*negated));
                out.push_str("LIKE ");
                pattern.write_sql(out, column, literal);
                out.push(')');
            }
            Expr::In {
                expr,
                list,
                negated,
            } => {
                out.push('(');
                expr.write_sql(out, column, literal);
                out.push(' ');
                out.push_str(not(*negated));
                out.push_str("IN (");
                for (i, item) in list.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    item.write_sql(out, column, literal);
                }
                out.push_str("))");
            }
            Expr::Between {
                expr,
                low,
                high,
                negated,
            } => {
                out.push('(');
                expr.write_sql(out, column, literal);
                out.push(' ');
                out.push_str(not(*negated));
                out.push_str("BETWEEN ");
                low.write_sql(out, column, literal);
                out.push_str(" AND ");
                high.write_sql(out, column, literal);
                out.push(')');
            }
        }
    }
}

fn write_binary(
    out: &mut String,
    a: &Expr,
    op: &str,
    b: &Expr,
    column: &dyn Fn(usize) -> String,
    literal: &dyn Fn(&CellValue) -> String,
) {
    out.push('(');
    a.write_sql(out, column, literal);
    out.push(' ');
    out.push_str(op);
    out.push(' ');
    b.write_sql(out, column, literal);
    out.push(')');
}

fn and3(a: Option<bool>, b: Option<bool>) -> Option<bool> {
    match (a, b) {
        (Some(false), _) | (_, Some(false)) => Some(false),
        (Some(true), Some(true)) => Some(true),
        _ => None,
    }
}

fn or3(a: Option<bool>, b: Option<bool>) -> Option<bool> {
    match (a, b) {
        (Some(true), _) | (_, Some(true)) => Some(true),
        (Some(false), Some(false)) => Some(false),
        _ => None,
    }
}

/// Compare two evaluated operands as SQLite does
///
/// A numeric column converts a text operand that looks like a number, and a
/// text column renders a number operand without affinity as text. Numbers
/// that still face text order before it.
fn compare(a: &Expr, left: &CellValue, b: &Expr, right: &CellValue) -> Option<Ordering> {
    let convert = match (a.affinity(), b.affinity()) {
        (Some(Affinity::Numeric), Some(Affinity::Numeric)) => None,
        (Some(Affinity::Numeric), _) => Some((false, Affinity::Numeric)),
        (_, Some(Affinity::Numeric)) => Some((true, Affinity::Numeric)),
        (Some(Affinity::Text), None) => Some((false, Affinity::Text)),
        (None, Some(Affinity::Text)) => Some((true, Affinity::Text)),
        _ => None,
    };
    let (left, right) = match convert {
        Some((true, affinity)) => (affinity.apply(left.clone()), right.clone()),
        Some((false, affinity)) => (left.clone(), affinity.apply(right.clone())),
        None => (left.clone(), right.clone()),
    };

    match (&left, &right) {
        (CellValue::Integer(_) | CellValue::Real(_), CellValue::Text(_)) => Some(Ordering::Less),
        (CellValue::Text(_), CellValue::Integer(_) | CellValue::Real(_)) => Some(Ordering::Greater),
        _ => left.compare(&right),
    }
}

fn to_numeric(value: CellValue) -> CellValue {
    match value {
        CellValue::Text(text) => {
            let trimmed = text.trim();
            let looks_numeric = trimmed.bytes().any(|b| b.is_ascii_digit())
                && trimmed
                    .bytes()
                    .all(|b| b.is_ascii_digit() || matches!(b, b'+' | b'-' | b'.' | b'e' | b'E'));
            if !looks_numeric {
                return CellValue::Text(text);
            }
            match trimmed.parse::<i64>() {
                Ok(i) => CellValue::Integer(i),
                Err(_) => match trimmed.parse::<f64>() {
                    Ok(f) => CellValue::Real(f),
                    Err(_) => CellValue::Text(text),
                },
            }
        }
        other => other,
    }
}

fn to_text(value: CellValue) -> CellValue {
    match value {
        CellValue::Integer(i) => CellValue::Text(i.to_string()),
        // SQLite keeps a fractional part on whole reals
        CellValue::Real(f) if f.fract() == 0.0 && f.abs() < 1.0e15 => CellValue::Text(format!("{:.1}", f)),
        CellValue::Real(f) => CellValue::Text(f.to_string()),
        other => other,
    }
}

#[derive(Debug, Clone, Copy)]
enum Num {
    Int(i64),
    Real(f64),
}

impl Num {
    fn as_f64(self) -> f64 {
        match self {
            Num::Int(i) => i as f64,
            Num::Real(f) => f,
        }
    }
}

/// Numeric view used by arithmetic; non-numeric text counts as zero
fn numeric(value: &CellValue) -> Option<Num> {
    match value {
        CellValue::Null | CellValue::DateTime(_) => None,
        CellValue::Integer(i) => Some(Num::Int(*i)),
        CellValue::Real(f) => Some(Num::Real(*f)),
        CellValue::Text(t) => {
            let t = t.trim();
            Some(
                t.parse::<i64>()
                    .map(Num::Int)
                    .or_else(|_| t.parse::<f64>().map(Num::Real))
                    .unwrap_or(Num::Int(0)),
            )
        }
    }
}

fn arith(op: ArithOp, a: &CellValue, b: &CellValue) -> CellValue {
    match (numeric(a), numeric(b)) {
        (Some(Num::Int(x)), Some(Num::Int(y))) => {
            let exact = match op {
                ArithOp::Add => x.checked_add(y),
                ArithOp::Sub => x.checked_sub(y),
                ArithOp::Mul => x.checked_mul(y),
                ArithOp::Div => {
                    if y == 0 {
                        return CellValue::Null;
                    }
                    x.checked_div(y)
                }
            };
            match exact {
                Some(v) => CellValue::Integer(v),
                None => real_arith(op, x as f64, y as f64),
            }
        }
        (Some(x), Some(y)) => real_arith(op, x.as_f64(), y.as_f64()),
        _ => CellValue::Null,
    }
}

fn real_arith(op: ArithOp, x: f64, y: f64) -> CellValue {
    match op {
        ArithOp::Add => CellValue::Real(x + y),
        ArithOp::Sub => CellValue::Real(x - y),
        ArithOp::Mul => CellValue::Real(x * y),
        ArithOp::Div if y == 0.0 => CellValue::Null,
        ArithOp::Div => CellValue::Real(x / y),
    }
}

/// Case-insensitive `LIKE` with `%` and `_` wildcards
fn like(text: &str, pattern: &str) -> bool {
    let text: Vec<char> = text.chars().flat_map(char::to_lowercase).collect();
    let pattern: Vec<char> = pattern.chars().flat_map(char::to_lowercase).collect();

    let (mut t, mut p) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;
    while t < text.len() {
        if p < pattern.len() && pattern[p] != '%' && (pattern[p] == '_' || pattern[p] == text[t]) {
            t += 1;
            p += 1;
        } else if p < pattern.len() && pattern[p] == '%' {
            backtrack = Some((p, t));
            p += 1;
        } else if let Some((star, consumed)) = backtrack {
            p = star + 1;
            t = consumed + 1;
            backtrack = Some((star, consumed + 1));
        } else {
            return false;
        }
    }
    while p < pattern.len() && pattern[p] == '%' {
        p += 1;
    }
    p == pattern.len()
}

/// Turn a parsed SQL expression into an evaluable one
fn bind(expr: &SqlExpr, columns: &[ColumnDescriptor]) -> Result<Expr> {
    let boxed = |inner: &SqlExpr| bind(inner, columns).map(Box::new);
    let bound = match expr {
        SqlExpr::Identifier(ident) => column(ident, columns)?,
        SqlExpr::CompoundIdentifier(parts) => match parts.as_slice() {
            [only] => column(only, columns)?,
            _ => return Err(unsupported(expr)),
        },
        SqlExpr::Value(value) => Expr::Literal(literal(value)?),
        SqlExpr::Nested(inner) => bind(inner, columns)?,
        SqlExpr::UnaryOp { op, expr: inner } => match op {
            UnaryOperator::Not => Expr::Not(boxed(inner)?),
            UnaryOperator::Minus => Expr::Negate(boxed(inner)?),
            UnaryOperator::Plus => bind(inner, columns)?,
            _ => return Err(unsupported(expr)),
        },
        SqlExpr::BinaryOp { left, op, right } => {
            let (a, b) = (boxed(left)?, boxed(right)?);
            match op {
                BinaryOperator::And => Expr::And(a, b),
                BinaryOperator::Or => Expr::Or(a, b),
                BinaryOperator::Eq => Expr::Compare(CompareOp::Eq, a, b),
                BinaryOperator::NotEq => Expr::Compare(CompareOp::Ne, a, b),
                BinaryOperator::Lt => Expr::Compare(CompareOp::Lt, a, b),
                BinaryOperator::LtEq => Expr::Compare(CompareOp::Le, a, b),
                BinaryOperator::Gt => Expr::Compare(CompareOp::Gt, a, b),
                BinaryOperator::GtEq => Expr::Compare(CompareOp::Ge, a, b),
                BinaryOperator::Plus => Expr::Arith(ArithOp::Add, a, b),
                BinaryOperator::Minus => Expr::Arith(ArithOp::Sub, a, b),
                BinaryOperator::Multiply => Expr::Arith(ArithOp::Mul, a, b),
                BinaryOperator::Divide => Expr::Arith(ArithOp::Div, a, b),
                other => {
                    return Err(ProjectionError::InvalidPredicate(format!(
                        "unsupported operator {}",
                        other
                    )))
                }
            }
        }
        SqlExpr::IsNull(inner) => Expr::IsNull {
            expr: boxed(inner)?,
            negated: false,
        },
        SqlExpr::IsNotNull(inner) => Expr::IsNull {
            expr: boxed(inner)?,
            negated: true,
        },
        // LIKE already ignores case
        SqlExpr::Like {
            negated,
            expr: inner,
            pattern,
            escape_char,
            ..
        }
        | SqlExpr::ILike {
            negated,
            expr: inner,
            pattern,
            escape_char,
            ..
        } => {
            if escape_char.is_some() {
                return Err(unsupported(expr));
            }
            Expr::Like {
                expr: boxed(inner)?,
                pattern: boxed(pattern)?,
                negated: *negated,
            }
        }
        SqlExpr::InList {
            expr: inner,
            list,
            negated,
        } => Expr::In {
            expr: boxed(inner)?,
            list: list
                .iter()
                .map(|item| bind(item, columns))
                .collect::<Result<_>>()?,
            negated: *negated,
        },
        SqlExpr::Between {
            expr: inner,
            negated,
            low,
            high,
        } => Expr::Between {
            expr: boxed(inner)?,
            low: boxed(low)?,
            high: boxed(high)?,
            negated: *negated,
        },
        _ => return Err(unsupported(expr)),
    };
    Ok(bound)
}

/// Resolve a column name, exactly first and then ignoring case
fn column(ident: &Ident, columns: &[ColumnDescriptor]) -> Result<Expr> {
    let name = ident.value.as_str();
    columns
        .iter()
        .position(|c| c.name == name)
        .or_else(|| columns.iter().position(|c| c.name.eq_ignore_ascii_case(name)))
        .map(|col| Expr::Column(col, Affinity::of(columns[col].kind)))
        .ok_or_else(|| ProjectionError::InvalidPredicate(format!("unknown column '{}'", name)))
}

fn literal(value: &Value) -> Result<CellValue> {
    match value {
        Value::Number(text, _) => parse_number(text),
        Value::SingleQuotedString(text) => Ok(CellValue::Text(text.clone())),
        Value::Boolean(b) => Ok(CellValue::Integer(i64::from(*b))),
        Value::Null => Ok(CellValue::Null),
        other => Err(ProjectionError::InvalidPredicate(format!("unsupported literal {}", other))),
    }
}

fn unsupported(expr: &SqlExpr) -> ProjectionError {
    ProjectionError::InvalidPredicate(format!("unsupported expression {}", expr))
}

fn parse_error(err: ParserError) -> ProjectionError {
    ProjectionError::InvalidPredicate(err.to_string())
}

fn parse_number(text: &str) -> Result<CellValue> {
    let is_integer = text.chars().all(|c| c.is_ascii_digit());
    if is_integer {
        if let Ok(i) = text.parse::<i64>() {
            return Ok(CellValue::Integer(i));
        }
    }
    text.parse::<f64>()
        .map(CellValue::Real)
        .map_err(|_| ProjectionError::InvalidPredicate(format!("malformed number {}", text)))
}
