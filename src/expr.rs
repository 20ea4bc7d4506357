//! Predicate expression trees used to scope subset loads.
//!
//! Leaves are [`Operand`]s (a field path into the item or a JSON literal);
//! interior nodes are comparisons, membership tests and boolean combinators.
//! Missing fields resolve to `null`.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::ItemKey;

static NULL: Value = Value::Null;

/// Dotted path into a JSON item, e.g. `author.id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldPath(Vec<String>);

impl FieldPath {
    /// Splits `path` on `.`.
    pub fn parse(path: &str) -> Self {
        Self(path.split('.').map(str::to_string).collect())
    }

    /// Path segments in order.
    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// Resolves the path against `item`; `None` when any segment is missing.
    pub fn resolve<'a>(&self, item: &'a Value) -> Option<&'a Value> {
        let mut current = item;
        for part in &self.0 {
            current = current.as_object()?.get(part)?;
        }
        Some(current)
    }

    /// SQLite JSON path (`$."a"."b"`) for this field.
    pub fn to_json_path(&self) -> String {
        let mut out = String::from("$");
        for part in &self.0 {
            out.push_str(".\"");
            out.push_str(part);
            out.push('"');
        }
        out
    }
}

impl From<&str> for FieldPath {
    fn from(value: &str) -> Self {
        Self::parse(value)
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("."))
    }
}

/// Leaf of a predicate tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operand {
    /// Reference to an item field.
    Field(FieldPath),
    /// Constant JSON value.
    Literal(Value),
}

impl Operand {
    fn resolve<'a>(&'a self, item: &'a Value) -> &'a Value {
        match self {
            Self::Field(path) => path.resolve(item).unwrap_or(&NULL),
            Self::Literal(value) => value,
        }
    }
}

/// Shorthand for [`Operand::Field`].
pub fn field(path: impl Into<FieldPath>) -> Operand {
    Operand::Field(path.into())
}

/// Shorthand for [`Operand::Literal`].
pub fn lit(value: impl Into<Value>) -> Operand {
    Operand::Literal(value.into())
}

/// Binary comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CmpOp {
    /// Equal.
    Eq,
    /// Not equal.
    Ne,
    /// Greater than.
    Gt,
    /// Greater than or equal.
    Gte,
    /// Less than.
    Lt,
    /// Less than or equal.
    Lte,
}

impl CmpOp {
    /// SQL spelling; equality is null-safe.
    pub fn sql(self) -> &'static str {
        match self {
            Self::Eq => "IS",
            Self::Ne => "IS NOT",
            Self::Gt => ">",
            Self::Gte => ">=",
            Self::Lt => "<",
            Self::Lte => "<=",
        }
    }
}

/// Closed predicate tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Expr {
    /// Binary comparison between two operands.
    Cmp {
        /// Operator.
        op: CmpOp,
        /// Left-hand side.
        lhs: Operand,
        /// Right-hand side.
        rhs: Operand,
    },
    /// Membership of an operand in a literal list.
    In {
        /// Tested operand.
        operand: Operand,
        /// Candidate values.
        values: Vec<Value>,
    },
    /// Conjunction; empty is `true`.
    And(Vec<Expr>),
    /// Disjunction; empty is `false`.
    Or(Vec<Expr>),
    /// Negation.
    Not(Box<Expr>),
}

impl Expr {
    fn cmp(op: CmpOp, lhs: Operand, rhs: Operand) -> Self {
        Self::Cmp { op, lhs, rhs }
    }

    /// `lhs == rhs`.
    pub fn equals(lhs: Operand, rhs: Operand) -> Self {
        Self::cmp(CmpOp::Eq, lhs, rhs)
    }

    /// `lhs != rhs`.
    pub fn not_equals(lhs: Operand, rhs: Operand) -> Self {
        Self::cmp(CmpOp::Ne, lhs, rhs)
    }

    /// `lhs > rhs`.
    pub fn gt(lhs: Operand, rhs: Operand) -> Self {
        Self::cmp(CmpOp::Gt, lhs, rhs)
    }

    /// `lhs >= rhs`.
    pub fn gte(lhs: Operand, rhs: Operand) -> Self {
        Self::cmp(CmpOp::Gte, lhs, rhs)
    }

    /// `lhs < rhs`.
    pub fn lt(lhs: Operand, rhs: Operand) -> Self {
        Self::cmp(CmpOp::Lt, lhs, rhs)
    }

    /// `lhs <= rhs`.
    pub fn lte(lhs: Operand, rhs: Operand) -> Self {
        Self::cmp(CmpOp::Lte, lhs, rhs)
    }

    /// `operand IN values`.
    pub fn is_in(operand: Operand, values: impl IntoIterator<Item = Value>) -> Self {
        Self::In {
            operand,
            values: values.into_iter().collect(),
        }
    }

    /// Identity-membership predicate: matches an item iff the value at `path`
    /// is one of `keys`.
    pub fn membership(path: &FieldPath, keys: &[ItemKey]) -> Self {
        Self::is_in(Operand::Field(path.clone()), keys.iter().map(ItemKey::to_value))
    }

    /// Conjunction of `children`.
    pub fn all(children: impl IntoIterator<Item = Expr>) -> Self {
        Self::And(children.into_iter().collect())
    }

    /// Disjunction of `children`.
    pub fn any(children: impl IntoIterator<Item = Expr>) -> Self {
        Self::Or(children.into_iter().collect())
    }

    /// Negation of `inner`.
    pub fn negate(inner: Expr) -> Self {
        Self::Not(Box::new(inner))
    }

    /// Evaluates the predicate against `item`.
    pub fn matches(&self, item: &Value) -> bool {
        match self {
            Self::Cmp { op, lhs, rhs } => {
                let (l, r) = (lhs.resolve(item), rhs.resolve(item));
                match op {
                    CmpOp::Eq => values_equal(l, r),
                    CmpOp::Ne => !values_equal(l, r),
                    CmpOp::Gt => ordered(l, r).is_some_and(Ordering::is_gt),
                    CmpOp::Gte => ordered(l, r).is_some_and(Ordering::is_ge),
                    CmpOp::Lt => ordered(l, r).is_some_and(Ordering::is_lt),
                    CmpOp::Lte => ordered(l, r).is_some_and(Ordering::is_le),
                }
            }
            Self::In { operand, values } => {
                let v = operand.resolve(item);
                values.iter().any(|candidate| values_equal(v, candidate))
            }
            Self::And(children) => children.iter().all(|c| c.matches(item)),
            Self::Or(children) => children.iter().any(|c| c.matches(item)),
            Self::Not(inner) => !inner.matches(item),
        }
    }
}

/// Equality with numeric coercion (`1 == 1.0`).
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(na), Value::Number(nb)) => match (na.as_i64(), nb.as_i64()) {
            (Some(x), Some(y)) => x == y,
            _ => na.as_f64() == nb.as_f64(),
        },
        _ => a == b,
    }
}

// Only like-typed scalars are ordered for predicates.
fn ordered(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(_), Value::Number(_))
        | (Value::String(_), Value::String(_))
        | (Value::Bool(_), Value::Bool(_)) => Some(compare_values(a, b)),
        _ => None,
    }
}

/// Total order over JSON values used for `order_by`.
///
/// Nulls sort after everything else; numbers compare numerically; strings by
/// codepoint; mixed types by rank number < string < bool < other.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Greater,
        (_, Value::Null) => Ordering::Less,
        (Value::Number(na), Value::Number(nb)) => match (na.as_i64(), nb.as_i64()) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => {
                let fa = na.as_f64().unwrap_or(f64::NAN);
                let fb = nb.as_f64().unwrap_or(f64::NAN);
                fa.partial_cmp(&fb).unwrap_or(Ordering::Equal)
            }
        },
        (Value::String(sa), Value::String(sb)) => sa.cmp(sb),
        (Value::Bool(ba), Value::Bool(bb)) => ba.cmp(bb),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

fn type_rank(v: &Value) -> u8 {
    match v {
        Value::Number(_) => 0,
        Value::String(_) => 1,
        Value::Bool(_) => 2,
        _ => 3,
    }
}
