//! Filter predicates over serialised entities
//!
//! A [`Predicate`] is a tree of field comparisons ([`FilterExpr`]) joined with
//! AND / OR / NOT. Predicates are plain values: they render to a stable text
//! form (used for cache keys) and can be evaluated against a
//! `serde_json::Value` row by stores that hold entities in that shape.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{KeelResult, ValidationError};

/// Filter operator for field comparisons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterOperator {
    /// Equal to
    Eq,
    /// Not equal to
    Ne,
    /// Greater than
    Gt,
    /// Less than
    Lt,
    /// Greater than or equal
    Gte,
    /// Less than or equal
    Lte,
    /// Contains substring (strings) or element (arrays)
    Contains,
    /// In list of values
    In,
}

impl FilterOperator {
    fn symbol(self) -> &'static str {
        match self {
            FilterOperator::Eq => "=",
            FilterOperator::Ne => "!=",
            FilterOperator::Gt => ">",
            FilterOperator::Lt => "<",
            FilterOperator::Gte => ">=",
            FilterOperator::Lte => "<=",
            FilterOperator::Contains => "CONTAINS",
            FilterOperator::In => "IN",
        }
    }
}

/// A single field comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterExpr {
    /// Field to filter on (dotted paths address nested values)
    pub field: String,
    /// Operator to apply
    pub operator: FilterOperator,
    /// Value to compare against
    pub value: Value,
}

impl FilterExpr {
    /// Create a new filter expression.
    pub fn new(field: impl Into<String>, operator: FilterOperator, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            operator,
            value: value.into(),
        }
    }

    /// Create an equality filter.
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOperator::Eq, value)
    }

    /// Create a contains filter.
    pub fn contains(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOperator::Contains, value)
    }

    /// Evaluate this comparison against a row. Missing fields compare as null.
    pub fn matches(&self, row: &Value) -> bool {
        let actual = lookup_path(row, &self.field).unwrap_or(&Value::Null);
        match self.operator {
            FilterOperator::Eq => values_equal(actual, &self.value),
            FilterOperator::Ne => !values_equal(actual, &self.value),
            FilterOperator::Gt => compare_values(actual, &self.value) == Some(Ordering::Greater),
            FilterOperator::Lt => compare_values(actual, &self.value) == Some(Ordering::Less),
            FilterOperator::Gte => matches!(
                compare_values(actual, &self.value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            FilterOperator::Lte => matches!(
                compare_values(actual, &self.value),
                Some(Ordering::Less | Ordering::Equal)
            ),
            FilterOperator::Contains => match (actual, &self.value) {
                (Value::String(haystack), Value::String(needle)) => haystack.contains(needle.as_str()),
                (Value::Array(items), needle) => items.iter().any(|item| values_equal(item, needle)),
                _ => false,
            },
            FilterOperator::In => match &self.value {
                Value::Array(candidates) => candidates.iter().any(|c| values_equal(actual, c)),
                _ => false,
            },
        }
    }

    fn validate(&self) -> KeelResult<()> {
        if self.field.trim().is_empty() {
            return Err(ValidationError::RequiredFieldMissing {
                field: "predicate.field".to_string(),
            }
            .into());
        }
        if self.operator == FilterOperator::In && !self.value.is_array() {
            return Err(ValidationError::InvalidValue {
                field: self.field.clone(),
                reason: "IN requires an array of candidate values".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

impl fmt::Display for FilterExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_ident(f, &self.field)?;
        write!(f, " {} {}", self.operator.symbol(), self.value)
    }
}

/// Write a field name or navigation path into canonical text.
///
/// Plain dotted identifiers are written bare. Anything else is written as a
/// JSON string so no name can imitate operators, joiners or separators.
pub(crate) fn write_ident(f: &mut fmt::Formatter<'_>, name: &str) -> fmt::Result {
    let plain = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
    if plain {
        f.write_str(name)
    } else {
        write!(f, "{}", Value::String(name.to_string()))
    }
}

/// Comma-separated identifiers, each written with [`write_ident`].
pub(crate) fn write_ident_list<'a>(
    f: &mut fmt::Formatter<'_>,
    names: impl IntoIterator<Item = &'a str>,
) -> fmt::Result {
    for (i, name) in names.into_iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write_ident(f, name)?;
    }
    Ok(())
}

/// Boolean filter over one entity type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Predicate {
    Compare(FilterExpr),
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Predicate::Compare(FilterExpr::eq(field, value))
    }

    pub fn ne(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Predicate::Compare(FilterExpr::new(field, FilterOperator::Ne, value))
    }

    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Predicate::Compare(FilterExpr::new(field, FilterOperator::Gt, value))
    }

    pub fn gte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Predicate::Compare(FilterExpr::new(field, FilterOperator::Gte, value))
    }

    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Predicate::Compare(FilterExpr::new(field, FilterOperator::Lt, value))
    }

    pub fn lte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Predicate::Compare(FilterExpr::new(field, FilterOperator::Lte, value))
    }

    pub fn contains(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Predicate::Compare(FilterExpr::contains(field, value))
    }

    pub fn is_in(field: impl Into<String>, values: impl IntoIterator<Item = Value>) -> Self {
        Predicate::Compare(FilterExpr::new(
            field,
            FilterOperator::In,
            Value::Array(values.into_iter().collect()),
        ))
    }

    /// Conjunction. Chained calls flatten into one `And` node.
    pub fn and(self, other: Predicate) -> Self {
        match self {
            Predicate::And(mut all) => {
                all.push(other);
                Predicate::And(all)
            }
            first => Predicate::And(vec![first, other]),
        }
    }

    /// Disjunction. Chained calls flatten into one `Or` node.
    pub fn or(self, other: Predicate) -> Self {
        match self {
            Predicate::Or(mut any) => {
                any.push(other);
                Predicate::Or(any)
            }
            first => Predicate::Or(vec![first, other]),
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Self {
        Predicate::Not(Box::new(self))
    }

    /// Evaluate against a serialised entity.
    pub fn matches(&self, row: &Value) -> bool {
        match self {
            Predicate::Compare(expr) => expr.matches(row),
            Predicate::And(all) => all.iter().all(|p| p.matches(row)),
            Predicate::Or(any) => any.iter().any(|p| p.matches(row)),
            Predicate::Not(inner) => !inner.matches(row),
        }
    }

    /// Reject malformed predicates before they reach a store.
    pub fn validate(&self) -> KeelResult<()> {
        match self {
            Predicate::Compare(expr) => expr.validate(),
            Predicate::And(parts) | Predicate::Or(parts) => {
                parts.iter().try_for_each(Predicate::validate)
            }
            Predicate::Not(inner) => inner.validate(),
        }
    }
}

impl From<FilterExpr> for Predicate {
    fn from(expr: FilterExpr) -> Self {
        Predicate::Compare(expr)
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::Compare(expr) => write!(f, "{}", expr),
            Predicate::And(parts) => write_joined(f, parts, "AND", "TRUE"),
            Predicate::Or(parts) => write_joined(f, parts, "OR", "FALSE"),
            Predicate::Not(inner) => write!(f, "NOT ({})", inner),
        }
    }
}

fn write_joined(
    f: &mut fmt::Formatter<'_>,
    parts: &[Predicate],
    joiner: &str,
    empty: &str,
) -> fmt::Result {
    if parts.is_empty() {
        return f.write_str(empty);
    }
    f.write_str("(")?;
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            write!(f, " {} ", joiner)?;
        }
        write!(f, "{}", part)?;
    }
    f.write_str(")")
}

// ============================================================================
// VALUE HELPERS
// ============================================================================

/// Resolve a dotted field path (`customer.name`) inside a JSON object.
pub fn lookup_path<'a>(row: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(row, |current, segment| current.as_object()?.get(segment))
}

/// Compare two scalars of the same JSON kind.
///
/// Integers compare exactly, mixed integer/float compare as f64. Values of
/// different kinds, arrays and objects are unordered (`None`).
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => Some(x.cmp(&y)),
            _ => x.as_f64()?.partial_cmp(&y.as_f64()?),
        },
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match compare_values(a, b) {
        Some(ordering) => ordering == Ordering::Equal,
        None => a == b,
    }
}
