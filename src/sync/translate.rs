//! Constraint translation.
//!
//! Both translators are pure: the same collection and constraint list always produce an equal
//! query object. A combination the target query builder cannot express is rejected with
//! `InvalidArgument`; no clause is ever dropped.

use serde_json::Value;

use crate::sync::adapter::native::{NativeBound, NativeFilter, NativeOperator, NativeOrder, NativeQuery};
use crate::sync::adapter::web::{WebClause, WebQuery};
use crate::sync::error::{invalid_argument, SyncResult};
use crate::sync::model::field_path::split_field_path;
use crate::sync::model::{Address, Constraint, CursorEdge, Direction, RangeOp};

/// Shape checks shared by every backing query builder.
#[derive(Default)]
struct QueryShape<'a> {
    inequality_field: Option<&'a str>,
    order_fields: Vec<&'a str>,
    limit_set: bool,
    start_set: bool,
    end_set: bool,
}

impl<'a> QueryShape<'a> {
    fn check(collection: &Address, constraints: &'a [Constraint]) -> SyncResult<Self> {
        if !collection.is_collection() {
            return Err(invalid_argument(format!(
                "Queries must target a collection, got document {collection}"
            )));
        }
        let mut shape = QueryShape::default();
        for constraint in constraints {
            if let Some(field) = constraint.field() {
                split_field_path(field)?;
            }
            match constraint {
                Constraint::Equals { .. } => {}
                Constraint::Range { field, value, .. } => shape.set_inequality(field, value)?,
                Constraint::OrderBy { field, .. } => shape.add_order(field)?,
                Constraint::Limit(count) => shape.set_limit(*count)?,
                Constraint::Cursor { position, edge, .. } => shape.set_cursor(position, *edge)?,
            }
        }
        for constraint in constraints {
            if let Constraint::Cursor { position, .. } = constraint {
                if position.len() > shape.order_fields.len() {
                    return Err(invalid_argument(format!(
                        "Cursor has {} values but the query only orders by {} fields",
                        position.len(),
                        shape.order_fields.len()
                    )));
                }
            }
        }
        if let (Some(inequality), Some(first_order)) = (shape.inequality_field, shape.order_fields.first()) {
            if inequality != *first_order {
                return Err(invalid_argument(format!(
                    "The first orderBy must be on {inequality:?}, the field used in a range filter, not {first_order:?}"
                )));
            }
        }
        Ok(shape)
    }

    fn set_inequality(&mut self, field: &'a str, value: &Value) -> SyncResult<()> {
        if value.is_null() {
            return Err(invalid_argument(format!(
                "Range filter on {field:?} cannot compare against null"
            )));
        }
        match self.inequality_field {
            Some(existing) if existing != field => Err(invalid_argument(format!(
                "Range filters are limited to one field, found {existing:?} and {field:?}"
            ))),
            _ => {
                self.inequality_field = Some(field);
                Ok(())
            }
        }
    }

    fn add_order(&mut self, field: &'a str) -> SyncResult<()> {
        if self.order_fields.contains(&field) {
            return Err(invalid_argument(format!("orderBy({field:?}) has already been specified")));
        }
        self.order_fields.push(field);
        Ok(())
    }

    fn set_limit(&mut self, count: u32) -> SyncResult<()> {
        if count == 0 {
            return Err(invalid_argument("limit must be greater than zero"));
        }
        if self.limit_set {
            return Err(invalid_argument("limit has already been specified"));
        }
        self.limit_set = true;
        Ok(())
    }

    fn set_cursor(&mut self, position: &[Value], edge: CursorEdge) -> SyncResult<()> {
        if position.is_empty() {
            return Err(invalid_argument("Cursor position must contain at least one value"));
        }
        let slot = match edge {
            CursorEdge::Start => &mut self.start_set,
            CursorEdge::End => &mut self.end_set,
        };
        if *slot {
            return Err(invalid_argument(match edge {
                CursorEdge::Start => "startAt/startAfter has already been specified",
                CursorEdge::End => "endAt/endBefore has already been specified",
            }));
        }
        *slot = true;
        Ok(())
    }
}

/// Checks the rules every backing store shares without building a query object.
pub fn validate_query(collection: &Address, constraints: &[Constraint]) -> SyncResult<()> {
    QueryShape::check(collection, constraints).map(|_| ())
}

/// Builds the web client's query object, one clause per constraint in the caller's order.
pub fn translate_web(collection: &Address, constraints: &[Constraint]) -> SyncResult<WebQuery> {
    QueryShape::check(collection, constraints)?;
    let clauses = constraints
        .iter()
        .map(|constraint| match constraint {
            Constraint::Equals { field, value } => WebClause::Where {
                field: field.clone(),
                op: "==",
                value: value.clone(),
            },
            Constraint::Range { field, op, value } => WebClause::Where {
                field: field.clone(),
                op: op.as_str(),
                value: value.clone(),
            },
            Constraint::OrderBy { field, direction } => WebClause::OrderBy {
                field: field.clone(),
                direction: match direction {
                    Direction::Ascending => "asc",
                    Direction::Descending => "desc",
                },
            },
            Constraint::Limit(count) => WebClause::Limit(*count),
            Constraint::Cursor {
                position,
                edge,
                inclusive,
            } => match (edge, inclusive) {
                (CursorEdge::Start, true) => WebClause::StartAt(position.clone()),
                (CursorEdge::Start, false) => WebClause::StartAfter(position.clone()),
                (CursorEdge::End, true) => WebClause::EndAt(position.clone()),
                (CursorEdge::End, false) => WebClause::EndBefore(position.clone()),
            },
        })
        .collect();
    Ok(WebQuery {
        collection_path: collection.path(),
        clauses,
    })
}

/// Builds the native bridge's query object. The native builder only accepts single-value cursors.
pub fn translate_native(collection: &Address, constraints: &[Constraint]) -> SyncResult<NativeQuery> {
    QueryShape::check(collection, constraints)?;
    let mut query = NativeQuery {
        path: collection.path(),
        filters: Vec::new(),
        orders: Vec::new(),
        limit: None,
        start: None,
        end: None,
    };
    for constraint in constraints {
        match constraint {
            Constraint::Equals { field, value } => query.filters.push(NativeFilter {
                field: field.clone(),
                operator: NativeOperator::Equal,
                value: value.clone(),
            }),
            Constraint::Range { field, op, value } => query.filters.push(NativeFilter {
                field: field.clone(),
                operator: native_operator(*op),
                value: value.clone(),
            }),
            Constraint::OrderBy { field, direction } => query.orders.push(NativeOrder {
                field: field.clone(),
                descending: *direction == Direction::Descending,
            }),
            Constraint::Limit(count) => query.limit = Some(*count),
            Constraint::Cursor {
                position,
                edge,
                inclusive,
            } => {
                let value = match position.as_slice() {
                    [value] => value.clone(),
                    _ => {
                        return Err(invalid_argument(format!(
                            "The native client cannot express a cursor over {} fields",
                            position.len()
                        )))
                    }
                };
                let bound = Some(NativeBound {
                    value,
                    inclusive: *inclusive,
                });
                match edge {
                    CursorEdge::Start => query.start = bound,
                    CursorEdge::End => query.end = bound,
                }
            }
        }
    }
    Ok(query)
}

fn native_operator(op: RangeOp) -> NativeOperator {
    match op {
        RangeOp::LessThan => NativeOperator::LessThan,
        RangeOp::LessThanOrEqual => NativeOperator::LessThanOrEqual,
        RangeOp::GreaterThan => NativeOperator::GreaterThan,
        RangeOp::GreaterThanOrEqual => NativeOperator::GreaterThanOrEqual,
    }
}

/// Inverse of [`translate_web`], used by backing stores that evaluate web queries locally.
pub(crate) fn web_query_constraints(query: &WebQuery) -> SyncResult<(Address, Vec<Constraint>)> {
    let collection = Address::collection(&query.collection_path)?;
    let constraints = query
        .clauses
        .iter()
        .map(|clause| {
            Ok(match clause {
                WebClause::Where { field, op, value } => match *op {
                    "==" => Constraint::equals(field.clone(), value.clone()),
                    "<" => Constraint::range(field.clone(), RangeOp::LessThan, value.clone()),
                    "<=" => Constraint::range(field.clone(), RangeOp::LessThanOrEqual, value.clone()),
                    ">" => Constraint::range(field.clone(), RangeOp::GreaterThan, value.clone()),
                    ">=" => Constraint::range(field.clone(), RangeOp::GreaterThanOrEqual, value.clone()),
                    other => return Err(invalid_argument(format!("Unsupported where operator {other:?}"))),
                },
                WebClause::OrderBy { field, direction } => Constraint::order_by(
                    field.clone(),
                    if *direction == "desc" {
                        Direction::Descending
                    } else {
                        Direction::Ascending
                    },
                ),
                WebClause::Limit(count) => Constraint::limit(*count),
                WebClause::StartAt(position) => Constraint::start_at(position.clone()),
                WebClause::StartAfter(position) => Constraint::start_after(position.clone()),
                WebClause::EndAt(position) => Constraint::end_at(position.clone()),
                WebClause::EndBefore(position) => Constraint::end_before(position.clone()),
            })
        })
        .collect::<SyncResult<Vec<_>>>()?;
    Ok((collection, constraints))
}

/// Inverse of [`translate_native`]. Filters come first, then orders, limit and cursors.
pub(crate) fn native_query_constraints(query: &NativeQuery) -> SyncResult<(Address, Vec<Constraint>)> {
    let collection = Address::collection(&query.path)?;
    let mut constraints = Vec::new();
    for filter in &query.filters {
        constraints.push(match filter.operator {
            NativeOperator::Equal => Constraint::equals(filter.field.clone(), filter.value.clone()),
            NativeOperator::LessThan => Constraint::range(filter.field.clone(), RangeOp::LessThan, filter.value.clone()),
            NativeOperator::LessThanOrEqual => {
                Constraint::range(filter.field.clone(), RangeOp::LessThanOrEqual, filter.value.clone())
            }
            NativeOperator::GreaterThan => {
                Constraint::range(filter.field.clone(), RangeOp::GreaterThan, filter.value.clone())
            }
            NativeOperator::GreaterThanOrEqual => {
                Constraint::range(filter.field.clone(), RangeOp::GreaterThanOrEqual, filter.value.clone())
            }
        });
    }
    for order in &query.orders {
        let direction = if order.descending {
            Direction::Descending
        } else {
            Direction::Ascending
        };
        constraints.push(Constraint::order_by(order.field.clone(), direction));
    }
    if let Some(limit) = query.limit {
        constraints.push(Constraint::limit(limit));
    }
    if let Some(bound) = &query.start {
        let position = vec![bound.value.clone()];
        constraints.push(if bound.inclusive {
            Constraint::start_at(position)
        } else {
            Constraint::start_after(position)
        });
    }
    if let Some(bound) = &query.end {
        let position = vec![bound.value.clone()];
        constraints.push(if bound.inclusive {
            Constraint::end_at(position)
        } else {
            Constraint::end_before(position)
        });
    }
    Ok((collection, constraints))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::error::SyncErrorKind;
    use serde_json::json;

    fn props() -> Address {
        Address::parse("props").unwrap()
    }

    fn board_query() -> Vec<Constraint> {
        vec![
            Constraint::equals("show", "s1"),
            Constraint::greater_than_or_equal("weight", 3),
            Constraint::order_by("weight", Direction::Descending),
            Constraint::limit(10),
            Constraint::start_after(vec![json!(40)]),
        ]
    }

    #[test]
    fn web_translation_keeps_clause_order() {
        let query = translate_web(&props(), &board_query()).unwrap();
        assert_eq!(query.collection_path, "props");
        assert_eq!(
            query.clauses,
            vec![
                WebClause::Where {
                    field: "show".into(),
                    op: "==",
                    value: json!("s1")
                },
                WebClause::Where {
                    field: "weight".into(),
                    op: ">=",
                    value: json!(3)
                },
                WebClause::OrderBy {
                    field: "weight".into(),
                    direction: "desc"
                },
                WebClause::Limit(10),
                WebClause::StartAfter(vec![json!(40)]),
            ]
        );
    }

    #[test]
    fn translation_is_deterministic() {
        let constraints = board_query();
        assert_eq!(
            translate_web(&props(), &constraints).unwrap(),
            translate_web(&props(), &constraints).unwrap()
        );
        assert_eq!(
            translate_native(&props(), &constraints).unwrap(),
            translate_native(&props(), &constraints).unwrap()
        );
    }

    #[test]
    fn native_translation_splits_clauses() {
        let query = translate_native(&props(), &board_query()).unwrap();
        assert_eq!(query.filters.len(), 2);
        assert_eq!(query.filters[1].operator, NativeOperator::GreaterThanOrEqual);
        assert_eq!(
            query.orders,
            vec![NativeOrder {
                field: "weight".into(),
                descending: true
            }]
        );
        assert_eq!(query.limit, Some(10));
        assert_eq!(
            query.start,
            Some(NativeBound {
                value: json!(40),
                inclusive: false
            })
        );
        assert!(query.end.is_none());
    }

    #[test]
    fn rejects_two_inequality_fields() {
        let constraints = vec![Constraint::less_than("weight", 5), Constraint::greater_than("height", 1)];
        let err = translate_web(&props(), &constraints).unwrap_err();
        assert_eq!(err.kind, SyncErrorKind::InvalidArgument);
        assert!(translate_native(&props(), &constraints).is_err());
    }

    #[test]
    fn allows_two_ranges_on_one_field() {
        let constraints = vec![Constraint::greater_than("weight", 1), Constraint::less_than("weight", 5)];
        assert!(translate_web(&props(), &constraints).is_ok());
    }

    #[test]
    fn first_order_must_match_inequality_field() {
        let constraints = vec![
            Constraint::less_than("weight", 5),
            Constraint::order_by("name", Direction::Ascending),
        ];
        assert!(translate_web(&props(), &constraints).is_err());
    }

    #[test]
    fn rejects_limits_and_cursors_it_cannot_express() {
        assert!(translate_web(&props(), &[Constraint::limit(0)]).is_err());
        assert!(translate_web(&props(), &[Constraint::limit(1), Constraint::limit(2)]).is_err());
        assert!(translate_web(&props(), &[Constraint::start_at(vec![json!(1)])]).is_err());

        let composite = vec![
            Constraint::order_by("show", Direction::Ascending),
            Constraint::order_by("name", Direction::Ascending),
            Constraint::start_at(vec![json!("s1"), json!("Axe")]),
        ];
        assert!(translate_web(&props(), &composite).is_ok());
        let err = translate_native(&props(), &composite).unwrap_err();
        assert_eq!(err.kind, SyncErrorKind::InvalidArgument);
    }

    #[test]
    fn rejects_document_targets_and_bad_fields() {
        let document = Address::parse("props/p1").unwrap();
        assert!(translate_web(&document, &[]).is_err());
        assert!(translate_native(&props(), &[Constraint::equals("a..b", 1)]).is_err());
    }

    #[test]
    fn inverse_translation_recovers_constraints() {
        let constraints = board_query();
        let (collection, recovered) = web_query_constraints(&translate_web(&props(), &constraints).unwrap()).unwrap();
        assert_eq!(collection, props());
        assert_eq!(recovered, constraints);

        let (_, recovered) = native_query_constraints(&translate_native(&props(), &constraints).unwrap()).unwrap();
        assert_eq!(recovered.len(), constraints.len());
    }
}
