//! Typed cell values and column descriptors
//!
//! Cells are carried as a closed tagged enum. Comparison semantics are chosen
//! by the column kind when sorting ([`CellValue::compare_as`]) and by the
//! operand tags when evaluating predicates ([`CellValue::compare`]).

use std::cmp::Ordering;
use std::fmt;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

/// Display format for date-time cells
pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Value kind of a column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnKind {
    Integer,
    Real,
    Text,
    DateTime,
}

impl ColumnKind {
    /// Whether values of this kind compare numerically
    pub fn is_numeric(self) -> bool {
        matches!(self, ColumnKind::Integer | ColumnKind::Real)
    }

    /// Map a declared SQL column type onto a kind, following SQLite's
    /// affinity rules with date/time names recognised first
    pub fn from_sql_type(declared: &str) -> Self {
        let upper = declared.to_uppercase();
        if upper.contains("DATE") || upper.contains("TIME") {
            ColumnKind::DateTime
        } else if upper.contains("INT") {
            ColumnKind::Integer
        } else if upper.contains("CHAR") || upper.contains("CLOB") || upper.contains("TEXT") {
            ColumnKind::Text
        } else if upper.contains("REAL")
            || upper.contains("FLOA")
            || upper.contains("DOUB")
            || upper.contains("NUM")
            || upper.contains("DEC")
        {
            ColumnKind::Real
        } else {
            ColumnKind::Text
        }
    }

    /// Declared SQL type used when creating a column of this kind
    pub fn sql_type(self) -> &'static str {
        match self {
            ColumnKind::Integer => "INTEGER",
            ColumnKind::Real => "REAL",
            ColumnKind::Text => "TEXT",
            ColumnKind::DateTime => "DATETIME",
        }
    }
}

/// Name and value kind of a column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub name: String,
    pub kind: ColumnKind,
}

impl ColumnDescriptor {
    pub fn new(name: impl Into<String>, kind: ColumnKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// A single typed cell
#[derive(Debug, Clone, PartialEq, Default)]
pub enum CellValue {
    #[default]
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    DateTime(NaiveDateTime),
}

impl CellValue {
    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }

    /// Kind carried by the tag, `None` for null
    pub fn kind(&self) -> Option<ColumnKind> {
        match self {
            CellValue::Null => None,
            CellValue::Integer(_) => Some(ColumnKind::Integer),
            CellValue::Real(_) => Some(ColumnKind::Real),
            CellValue::Text(_) => Some(ColumnKind::Text),
            CellValue::DateTime(_) => Some(ColumnKind::DateTime),
        }
    }

    /// Integer view of the value, parsing text and accepting integral reals
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            CellValue::Integer(i) => Some(*i),
            CellValue::Real(f) if f.fract() == 0.0 && f.abs() < 9.0e15 => Some(*f as i64),
            CellValue::Text(t) => t.trim().parse().ok(),
            _ => None,
        }
    }

    /// Floating point view of the value, parsing text
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            CellValue::Integer(i) => Some(*i as f64),
            CellValue::Real(f) => Some(*f),
            CellValue::Text(t) => t.trim().parse().ok(),
            _ => None,
        }
    }

    /// Date-time view of the value, parsing text
    pub fn as_datetime(&self) -> Option<NaiveDateTime> {
        match self {
            CellValue::DateTime(dt) => Some(*dt),
            CellValue::Text(t) => parse_datetime(t),
            _ => None,
        }
    }

    /// SQL-style truth value; `None` is unknown
    pub fn truth(&self) -> Option<bool> {
        match self {
            CellValue::Null => None,
            CellValue::Integer(i) => Some(*i != 0),
            CellValue::Real(f) => Some(*f != 0.0),
            CellValue::Text(t) => Some(t.trim().parse::<f64>().map(|v| v != 0.0).unwrap_or(false)),
            CellValue::DateTime(_) => Some(true),
        }
    }

    /// Encode a three-valued truth as a cell
    pub fn from_truth(truth: Option<bool>) -> Self {
        match truth {
            Some(true) => CellValue::Integer(1),
            Some(false) => CellValue::Integer(0),
            None => CellValue::Null,
        }
    }

    /// Convert a dynamically typed value into the representation of `kind`
    ///
    /// Values that cannot be converted are kept as they are.
    pub fn coerce(self, kind: ColumnKind) -> Self {
        match (kind, self) {
            (ColumnKind::Integer, CellValue::Text(t)) => match t.trim().parse::<i64>() {
                Ok(i) => CellValue::Integer(i),
                Err(_) => match t.trim().parse::<f64>() {
                    Ok(f) => CellValue::Real(f),
                    Err(_) => CellValue::Text(t),
                },
            },
            (ColumnKind::Real, CellValue::Integer(i)) => CellValue::Real(i as f64),
            (ColumnKind::Real, CellValue::Text(t)) => match t.trim().parse::<f64>() {
                Ok(f) => CellValue::Real(f),
                Err(_) => CellValue::Text(t),
            },
            (ColumnKind::DateTime, CellValue::Text(t)) => match parse_datetime(&t) {
                Some(dt) => CellValue::DateTime(dt),
                None => CellValue::Text(t),
            },
            (_, value) => value,
        }
    }

    /// Total order used for sorting a column of the given kind
    ///
    /// Nulls order before every other value. In numeric and date-time
    /// columns, values that fit the kind order before those that do not,
    /// and the misfits compare as text.
    pub fn compare_as(&self, other: &CellValue, kind: ColumnKind) -> Ordering {
        match (self.is_null(), other.is_null()) {
            (true, true) => return Ordering::Equal,
            (true, false) => return Ordering::Less,
            (false, true) => return Ordering::Greater,
            (false, false) => {}
        }

        match kind {
            ColumnKind::Integer | ColumnKind::Real => match (self.number(), other.number()) {
                (Some(a), Some(b)) => a.cmp(b),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => self.compare_text(other),
            },
            ColumnKind::DateTime => match (self.as_datetime(), other.as_datetime()) {
                (Some(a), Some(b)) => a.cmp(&b),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => self.compare_text(other),
            },
            ColumnKind::Text => self.compare_text(other),
        }
    }

    /// Exact numeric view; text must spell a number
    fn number(&self) -> Option<Number> {
        match self {
            CellValue::Integer(i) => Some(Number::Int(*i)),
            CellValue::Real(f) => Some(Number::Real(*f)),
            CellValue::Text(t) => {
                let t = t.trim();
                if !t.bytes().any(|b| b.is_ascii_digit()) {
                    return None;
                }
                t.parse()
                    .map(Number::Int)
                    .or_else(|_| t.parse().map(Number::Real))
                    .ok()
            }
            CellValue::Null | CellValue::DateTime(_) => None,
        }
    }

    /// Comparison used by predicates; `None` when either side is null or
    /// the operands are incomparable
    pub fn compare(&self, other: &CellValue) -> Option<Ordering> {
        use CellValue::*;
        match (self, other) {
            (Null, _) | (_, Null) => None,
            (Integer(a), Integer(b)) => Some(a.cmp(b)),
            (Text(a), Text(b)) => Some(a.as_str().cmp(b.as_str())),
            (DateTime(a), DateTime(b)) => Some(a.cmp(b)),
            (DateTime(a), Text(t)) => parse_datetime(t).map(|b| a.cmp(&b)),
            (Text(t), DateTime(b)) => parse_datetime(t).map(|a| a.cmp(b)),
            (DateTime(_), _) | (_, DateTime(_)) => None,
            _ => match (self.as_f64(), other.as_f64()) {
                (Some(a), Some(b)) => Some(compare_f64(a, b)),
                _ => Some(self.to_string().cmp(&other.to_string())),
            },
        }
    }

    fn compare_text(&self, other: &CellValue) -> Ordering {
        match (self, other) {
            (CellValue::Text(a), CellValue::Text(b)) => compare_text(a, b),
            _ => compare_text(&self.to_string(), &other.to_string()),
        }
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellValue::Null => Ok(()),
            CellValue::Integer(i) => write!(f, "{}", i),
            CellValue::Real(v) => write!(f, "{}", v),
            CellValue::Text(t) => f.write_str(t),
            CellValue::DateTime(dt) => write!(f, "{}", dt.format(DATETIME_FORMAT)),
        }
    }
}

impl From<i64> for CellValue {
    fn from(value: i64) -> Self {
        CellValue::Integer(value)
    }
}

impl From<f64> for CellValue {
    fn from(value: f64) -> Self {
        CellValue::Real(value)
    }
}

impl From<&str> for CellValue {
    fn from(value: &str) -> Self {
        CellValue::Text(value.to_string())
    }
}

impl From<String> for CellValue {
    fn from(value: String) -> Self {
        CellValue::Text(value)
    }
}

impl From<NaiveDateTime> for CellValue {
    fn from(value: NaiveDateTime) -> Self {
        CellValue::DateTime(value)
    }
}

impl<T: Into<CellValue>> From<Option<T>> for CellValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(CellValue::Null)
    }
}

/// Case-folded comparison with a byte-order tiebreak
///
/// Stands in for a locale-aware collation: `"apple" < "Banana" < "banana"`.
pub fn compare_text(a: &str, b: &str) -> Ordering {
    a.chars()
        .flat_map(char::to_lowercase)
        .cmp(b.chars().flat_map(char::to_lowercase))
        .then_with(|| a.cmp(b))
}

/// `f64` order with NaN after every number
fn compare_f64(a: f64, b: f64) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
    }
}

#[derive(Debug, Clone, Copy)]
enum Number {
    Int(i64),
    Real(f64),
}

impl Number {
    /// Compare without rounding large integers through `f64`
    fn cmp(self, other: Number) -> Ordering {
        match (self, other) {
            (Number::Int(a), Number::Int(b)) => a.cmp(&b),
            (Number::Real(a), Number::Real(b)) => compare_f64(a, b),
            (Number::Int(a), Number::Real(b)) => compare_int_real(a, b),
            (Number::Real(a), Number::Int(b)) => compare_int_real(b, a).reverse(),
        }
    }
}

fn compare_int_real(i: i64, f: f64) -> Ordering {
    if f.is_nan() {
        return Ordering::Less;
    }
    // the cast saturates for infinities, which still lie beyond any i64
    let whole = f.trunc();
    (i as i128).cmp(&(whole as i128)).then_with(|| {
        if f > whole {
            Ordering::Less
        } else if f < whole {
            Ordering::Greater
        } else {
            Ordering::Equal
        }
    })
}

/// Parse the date-time spellings found in attribute tables
pub fn parse_datetime(text: &str) -> Option<NaiveDateTime> {
    const DATETIME_FORMATS: [&str; 5] = [
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M",
        "%Y/%m/%d %H:%M:%S",
        "%Y-%m-%dT%H:%M",
    ];
    const DATE_FORMATS: [&str; 2] = ["%Y-%m-%d", "%Y/%m/%d"];

    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    for format in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, format) {
            return Some(dt);
        }
    }
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(text, format) {
            return date.and_hms_opt(0, 0, 0);
        }
    }
    chrono::DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|dt| dt.naive_utc())
}
