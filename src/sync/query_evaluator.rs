use std::cmp::Ordering;

use serde_json::Value;

use crate::sync::model::{Constraint, CursorEdge, Direction, Snapshot};

/// Applies a constraint list to candidate documents: filters, sorts (explicit order-bys, then the
/// inequality field, then document id), applies cursors and finally the limit.
///
/// Used by the offline cache to overlay pending writes on query results and to answer queries
/// while offline, and by the in-memory backing store.
pub(crate) fn apply_constraints(documents: Vec<Snapshot>, constraints: &[Constraint]) -> Vec<Snapshot> {
    let order = effective_order(constraints);

    let mut filtered: Vec<Snapshot> = documents
        .into_iter()
        .filter(|snapshot| snapshot.exists())
        .filter(|snapshot| satisfies_filters(snapshot, constraints))
        .filter(|snapshot| order.iter().all(|(field, _)| snapshot.get(field).is_some()))
        .collect();

    filtered.sort_by(|left, right| compare_snapshots(left, right, &order));

    for constraint in constraints {
        if let Constraint::Cursor {
            position,
            edge,
            inclusive,
        } = constraint
        {
            filtered.retain(|snapshot| {
                let ordering = compare_to_position(snapshot, position, &order);
                match (edge, inclusive) {
                    (CursorEdge::Start, true) => ordering != Ordering::Less,
                    (CursorEdge::Start, false) => ordering == Ordering::Greater,
                    (CursorEdge::End, true) => ordering != Ordering::Greater,
                    (CursorEdge::End, false) => ordering == Ordering::Less,
                }
            });
        }
    }

    if let Some(limit) = constraints.iter().find_map(|constraint| match constraint {
        Constraint::Limit(limit) => Some(*limit as usize),
        _ => None,
    }) {
        filtered.truncate(limit);
    }

    filtered
}

/// Whether a document satisfies every equality and range clause.
pub(crate) fn satisfies_filters(snapshot: &Snapshot, constraints: &[Constraint]) -> bool {
    constraints.iter().all(|constraint| match constraint {
        Constraint::Equals { field, value } => snapshot
            .get(field)
            .map(|actual| compare_values(actual, value) == Ordering::Equal)
            .unwrap_or(false),
        Constraint::Range { field, op, value } => snapshot
            .get(field)
            .map(|actual| same_type_class(actual, value) && op.accepts(compare_values(actual, value)))
            .unwrap_or(false),
        _ => true,
    })
}

fn effective_order(constraints: &[Constraint]) -> Vec<(String, Direction)> {
    let mut order: Vec<(String, Direction)> = constraints
        .iter()
        .filter_map(|constraint| match constraint {
            Constraint::OrderBy { field, direction } => Some((field.clone(), *direction)),
            _ => None,
        })
        .collect();
    if order.is_empty() {
        if let Some(field) = constraints.iter().find_map(|constraint| match constraint {
            Constraint::Range { field, .. } => Some(field.clone()),
            _ => None,
        }) {
            order.push((field, Direction::Ascending));
        }
    }
    order
}

fn compare_snapshots(left: &Snapshot, right: &Snapshot, order: &[(String, Direction)]) -> Ordering {
    for (field, direction) in order {
        let ordering = match (left.get(field), right.get(field)) {
            (Some(a), Some(b)) => compare_values(a, b),
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        let ordering = match direction {
            Direction::Ascending => ordering,
            Direction::Descending => ordering.reverse(),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    left.id().cmp(&right.id())
}

fn compare_to_position(snapshot: &Snapshot, position: &[Value], order: &[(String, Direction)]) -> Ordering {
    for ((field, direction), bound) in order.iter().zip(position.iter()) {
        let value = snapshot.get(field).unwrap_or(&Value::Null);
        let ordering = match direction {
            Direction::Ascending => compare_values(value, bound),
            Direction::Descending => compare_values(value, bound).reverse(),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

fn same_type_class(left: &Value, right: &Value) -> bool {
    type_rank(left) == type_rank(right)
}

/// Total order over JSON values: null < booleans < numbers < strings < arrays < maps.
pub(crate) fn compare_values(left: &Value, right: &Value) -> Ordering {
    match (left, right) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
        (Value::Number(a), Value::Number(b)) => match (a.as_i64(), b.as_i64()) {
            (Some(a), Some(b)) => a.cmp(&b),
            _ => {
                let a = a.as_f64().unwrap_or(f64::NAN);
                let b = b.as_f64().unwrap_or(f64::NAN);
                a.partial_cmp(&b).unwrap_or(Ordering::Equal)
            }
        },
        (Value::String(a), Value::String(b)) => a.cmp(b),
        (Value::Array(a), Value::Array(b)) => {
            for (left, right) in a.iter().zip(b.iter()) {
                let ordering = compare_values(left, right);
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            a.len().cmp(&b.len())
        }
        (Value::Object(a), Value::Object(b)) => {
            for ((left_key, left_value), (right_key, right_value)) in a.iter().zip(b.iter()) {
                let ordering = left_key
                    .cmp(right_key)
                    .then_with(|| compare_values(left_value, right_value));
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            a.len().cmp(&b.len())
        }
        _ => type_rank(left).cmp(&type_rank(right)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::model::{Address, RangeOp, Version};
    use chrono::Utc;
    use serde_json::json;

    fn doc(id: &str, value: Value) -> Snapshot {
        Snapshot::new(
            Address::parse(&format!("props/{id}")).unwrap(),
            value.as_object().cloned(),
            Version::new("1"),
            Utc::now(),
        )
    }

    fn ids(snapshots: &[Snapshot]) -> Vec<&str> {
        snapshots.iter().filter_map(|snapshot| snapshot.id()).collect()
    }

    fn inventory() -> Vec<Snapshot> {
        vec![
            doc("a", json!({"show": "s1", "weight": 5, "name": "Axe"})),
            doc("b", json!({"show": "s1", "weight": 2, "name": "Bow"})),
            doc("c", json!({"show": "s2", "weight": 9, "name": "Cup"})),
            doc("d", json!({"show": "s1", "weight": 7, "name": "Dagger"})),
            doc("e", json!({"show": "s1", "name": "Easel"})),
        ]
    }

    #[test]
    fn filters_sorts_and_limits() {
        let results = apply_constraints(
            inventory(),
            &[
                Constraint::equals("show", "s1"),
                Constraint::range("weight", RangeOp::GreaterThan, 2),
                Constraint::order_by("weight", Direction::Descending),
                Constraint::limit(2),
            ],
        );
        assert_eq!(ids(&results), vec!["d", "a"]);
    }

    #[test]
    fn range_without_order_sorts_by_inequality_field() {
        let results = apply_constraints(inventory(), &[Constraint::less_than("weight", 8)]);
        assert_eq!(ids(&results), vec!["b", "a", "d"]);
    }

    #[test]
    fn cursors_bound_the_ordered_results() {
        let order = Constraint::order_by("weight", Direction::Ascending);
        let results = apply_constraints(
            inventory(),
            &[order.clone(), Constraint::start_after(vec![json!(2)]), Constraint::end_at(vec![json!(7)])],
        );
        assert_eq!(ids(&results), vec!["a", "d"]);

        let results = apply_constraints(inventory(), &[order, Constraint::start_at(vec![json!(5)])]);
        assert_eq!(ids(&results), vec!["a", "d", "c"]);
    }

    #[test]
    fn order_by_excludes_documents_missing_the_field() {
        let results = apply_constraints(
            inventory(),
            &[Constraint::order_by("weight", Direction::Ascending)],
        );
        assert!(!ids(&results).contains(&"e"));
    }

    #[test]
    fn ranges_do_not_match_across_types() {
        let docs = vec![doc("x", json!({"weight": "heavy"})), doc("y", json!({"weight": 3}))];
        let results = apply_constraints(docs, &[Constraint::greater_than("weight", 1)]);
        assert_eq!(ids(&results), vec!["y"]);
    }

    #[test]
    fn integer_and_float_compare_numerically() {
        assert_eq!(compare_values(&json!(2), &json!(2.5)), Ordering::Less);
        assert_eq!(compare_values(&json!(3.0), &json!(3)), Ordering::Equal);
        assert_eq!(compare_values(&json!(null), &json!(false)), Ordering::Less);
    }
}
