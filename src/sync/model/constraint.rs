use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Comparison used by a [`Constraint::Range`] clause.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RangeOp {
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
}

impl RangeOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            RangeOp::LessThan => "<",
            RangeOp::LessThanOrEqual => "<=",
            RangeOp::GreaterThan => ">",
            RangeOp::GreaterThanOrEqual => ">=",
        }
    }

    /// Whether `ordering` (document value compared to the bound) satisfies the operator.
    pub fn accepts(&self, ordering: Ordering) -> bool {
        match self {
            RangeOp::LessThan => ordering == Ordering::Less,
            RangeOp::LessThanOrEqual => ordering != Ordering::Greater,
            RangeOp::GreaterThan => ordering == Ordering::Greater,
            RangeOp::GreaterThanOrEqual => ordering != Ordering::Less,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    #[default]
    Ascending,
    Descending,
}

/// Which end of the result set a [`Constraint::Cursor`] bounds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CursorEdge {
    Start,
    End,
}

/// One filtering, ordering or paging clause. Lists of constraints are ordered and translators keep
/// that order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Constraint {
    Equals {
        field: String,
        value: Value,
    },
    Range {
        field: String,
        op: RangeOp,
        value: Value,
    },
    OrderBy {
        field: String,
        direction: Direction,
    },
    Limit(u32),
    /// Position values line up with the preceding `OrderBy` clauses.
    Cursor {
        position: Vec<Value>,
        edge: CursorEdge,
        inclusive: bool,
    },
}

impl Constraint {
    pub fn equals(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Constraint::Equals {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn range(field: impl Into<String>, op: RangeOp, value: impl Into<Value>) -> Self {
        Constraint::Range {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    pub fn less_than(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::range(field, RangeOp::LessThan, value)
    }

    pub fn less_than_or_equal(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::range(field, RangeOp::LessThanOrEqual, value)
    }

    pub fn greater_than(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::range(field, RangeOp::GreaterThan, value)
    }

    pub fn greater_than_or_equal(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::range(field, RangeOp::GreaterThanOrEqual, value)
    }

    pub fn order_by(field: impl Into<String>, direction: Direction) -> Self {
        Constraint::OrderBy {
            field: field.into(),
            direction,
        }
    }

    pub fn limit(count: u32) -> Self {
        Constraint::Limit(count)
    }

    pub fn start_at(position: Vec<Value>) -> Self {
        Self::cursor(position, CursorEdge::Start, true)
    }

    pub fn start_after(position: Vec<Value>) -> Self {
        Self::cursor(position, CursorEdge::Start, false)
    }

    pub fn end_at(position: Vec<Value>) -> Self {
        Self::cursor(position, CursorEdge::End, true)
    }

    pub fn end_before(position: Vec<Value>) -> Self {
        Self::cursor(position, CursorEdge::End, false)
    }

    fn cursor(position: Vec<Value>, edge: CursorEdge, inclusive: bool) -> Self {
        Constraint::Cursor {
            position,
            edge,
            inclusive,
        }
    }

    /// Field this clause filters or orders on, if any.
    pub fn field(&self) -> Option<&str> {
        match self {
            Constraint::Equals { field, .. }
            | Constraint::Range { field, .. }
            | Constraint::OrderBy { field, .. } => Some(field),
            Constraint::Limit(_) | Constraint::Cursor { .. } => None,
        }
    }
}
