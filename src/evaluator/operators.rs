// Copyright 2024 OctoFHIR Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Binary operator semantics

use std::cmp::Ordering;

use chrono::{DateTime, Duration, Months, NaiveDate};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;

use crate::ast::BinaryOperator;
use crate::core::{FhirMapError, Result};
use crate::model::{Collection, FhirPathValue, Quantity};

/// Singleton boolean view of a collection for the logical operators
pub(crate) fn logical_operand(values: &Collection) -> Result<Option<bool>> {
    match values.as_slice() {
        [] => Ok(None),
        [single] => Ok(Some(single.as_boolean().unwrap_or(true))),
        _ => Err(FhirMapError::evaluation(format!(
            "Unable to evaluate a collection of {} items as a boolean",
            values.len()
        ))),
    }
}

/// Short-circuit result of a logical operator from its left operand alone
pub(crate) fn short_circuit(op: BinaryOperator, left: &Collection) -> Result<Option<Collection>> {
    let value = match op {
        BinaryOperator::And | BinaryOperator::Or | BinaryOperator::Implies => {
            logical_operand(left)?
        }
        _ => return Ok(None),
    };
    Ok(match (op, value) {
        (BinaryOperator::And, Some(false)) => Some(vec![false.into()]),
        (BinaryOperator::Or, Some(true)) => Some(vec![true.into()]),
        (BinaryOperator::Implies, Some(false)) => Some(vec![true.into()]),
        _ => None,
    })
}

/// Apply a value operator; `is`/`as` are handled by the engine
pub(crate) fn operate(op: BinaryOperator, left: &Collection, right: &Collection) -> Result<Collection> {
    match op {
        BinaryOperator::Equal => Ok(boolean(equals(left, right))),
        BinaryOperator::NotEqual => Ok(boolean(equals(left, right).map(|b| !b))),
        BinaryOperator::Equivalent => Ok(vec![equivalent(left, right).into()]),
        BinaryOperator::NotEquivalent => Ok(vec![(!equivalent(left, right)).into()]),
        BinaryOperator::LessThan
        | BinaryOperator::LessThanOrEqual
        | BinaryOperator::GreaterThan
        | BinaryOperator::GreaterThanOrEqual => relational(op, left, right),
        BinaryOperator::And => {
            let (l, r) = (logical_operand(left)?, logical_operand(right)?);
            Ok(boolean(match (l, r) {
                (Some(false), _) | (_, Some(false)) => Some(false),
                (Some(true), Some(true)) => Some(true),
                _ => None,
            }))
        }
        BinaryOperator::Or => {
            let (l, r) = (logical_operand(left)?, logical_operand(right)?);
            Ok(boolean(match (l, r) {
                (Some(true), _) | (_, Some(true)) => Some(true),
                (Some(false), Some(false)) => Some(false),
                _ => None,
            }))
        }
        BinaryOperator::Xor => {
            let (l, r) = (logical_operand(left)?, logical_operand(right)?);
            Ok(boolean(l.zip(r).map(|(a, b)| a != b)))
        }
        BinaryOperator::Implies => {
            let (l, r) = (logical_operand(left)?, logical_operand(right)?);
            Ok(boolean(match (l, r) {
                (Some(false), _) | (_, Some(true)) => Some(true),
                (Some(true), Some(false)) => Some(false),
                _ => None,
            }))
        }
        BinaryOperator::Union => Ok(union(left, right)),
        BinaryOperator::In => membership(left, right),
        BinaryOperator::Contains => membership(right, left),
        BinaryOperator::Concatenate => {
            let text = |c: &Collection| -> Result<String> {
                match c.as_slice() {
                    [] => Ok(String::new()),
                    [single] => Ok(single.as_string().unwrap_or_default()),
                    _ => Err(FhirMapError::evaluation("Operator & requires singleton operands")),
                }
            };
            Ok(vec![FhirPathValue::String(text(left)? + &text(right)?)])
        }
        BinaryOperator::Add
        | BinaryOperator::Subtract
        | BinaryOperator::Multiply
        | BinaryOperator::Divide
        | BinaryOperator::IntegerDivide
        | BinaryOperator::Modulo => arithmetic(op, left, right),
        BinaryOperator::Is | BinaryOperator::As | BinaryOperator::MemberOf => Err(
            FhirMapError::evaluation(format!("Operator {op} needs evaluation context")),
        ),
    }
}

fn boolean(value: Option<bool>) -> Collection {
    value.map(|b| vec![b.into()]).unwrap_or_default()
}

/// `=` over collections; `None` when either side is empty
pub(crate) fn equals(left: &Collection, right: &Collection) -> Option<bool> {
    if left.is_empty() || right.is_empty() {
        return None;
    }
    if left.len() != right.len() {
        return Some(false);
    }
    let mut result = Some(true);
    for (a, b) in left.iter().zip(right) {
        match item_equals(a, b) {
            Some(false) => return Some(false),
            None => result = None,
            Some(true) => {}
        }
    }
    result
}

/// `=` on single items
pub(crate) fn item_equals(a: &FhirPathValue, b: &FhirPathValue) -> Option<bool> {
    if let (FhirPathValue::Node(x), FhirPathValue::Node(y)) = (a, b) {
        if !x.has_value() || !y.has_value() {
            return Some(x.deep_eq(y));
        }
    }
    let (a, b) = (a.primitive()?, b.primitive()?);
    match (&a, &b) {
        (FhirPathValue::Integer(_) | FhirPathValue::Decimal(_), FhirPathValue::Integer(_) | FhirPathValue::Decimal(_)) => {
            Some(a.as_decimal()? == b.as_decimal()?)
        }
        (FhirPathValue::Date(x), FhirPathValue::Date(y))
        | (FhirPathValue::DateTime(x), FhirPathValue::DateTime(y))
        | (FhirPathValue::Time(x), FhirPathValue::Time(y))
        | (FhirPathValue::Date(x), FhirPathValue::DateTime(y))
        | (FhirPathValue::DateTime(x), FhirPathValue::Date(y)) => {
            if x.len() == y.len() {
                Some(x == y)
            } else {
                None
            }
        }
        _ => Some(a == b),
    }
}

/// `~` over collections
pub(crate) fn equivalent(left: &Collection, right: &Collection) -> bool {
    if left.is_empty() && right.is_empty() {
        return true;
    }
    left.len() == right.len()
        && left
            .iter()
            .all(|a| right.iter().any(|b| item_equivalent(a, b)))
}

fn item_equivalent(a: &FhirPathValue, b: &FhirPathValue) -> bool {
    match (a.primitive(), b.primitive()) {
        (Some(FhirPathValue::String(x)), Some(FhirPathValue::String(y))) => {
            normalize_whitespace(&x).eq_ignore_ascii_case(&normalize_whitespace(&y))
        }
        (Some(x @ (FhirPathValue::Decimal(_) | FhirPathValue::Integer(_))), Some(y)) => {
            match (x.as_decimal(), y.as_decimal()) {
                (Some(x), Some(y)) => {
                    let scale = x.scale().min(y.scale());
                    x.round_dp(scale) == y.round_dp(scale)
                }
                _ => false,
            }
        }
        _ => item_equals(a, b).unwrap_or(false),
    }
}

fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Ordering between two single items, `None` when incomparable
pub(crate) fn compare(a: &FhirPathValue, b: &FhirPathValue) -> Result<Option<Ordering>> {
    let (Some(a), Some(b)) = (a.primitive(), b.primitive()) else {
        return Ok(None);
    };
    let ordering = match (&a, &b) {
        (FhirPathValue::String(x), FhirPathValue::String(y)) => Some(x.cmp(y)),
        (FhirPathValue::Date(x), FhirPathValue::Date(y))
        | (FhirPathValue::DateTime(x), FhirPathValue::DateTime(y))
        | (FhirPathValue::Time(x), FhirPathValue::Time(y))
        | (FhirPathValue::Date(x), FhirPathValue::DateTime(y))
        | (FhirPathValue::DateTime(x), FhirPathValue::Date(y)) => {
            let common = x.len().min(y.len());
            match x[..common].cmp(&y[..common]) {
                Ordering::Equal if x.len() != y.len() => None,
                other => Some(other),
            }
        }
        (FhirPathValue::Quantity(x), FhirPathValue::Quantity(y)) if x.unit == y.unit => {
            Some(x.value.cmp(&y.value))
        }
        _ => match (a.as_decimal(), b.as_decimal()) {
            (Some(x), Some(y)) => Some(x.cmp(&y)),
            _ => {
                return Err(FhirMapError::evaluation(format!(
                    "Unable to compare values of type {} and {}",
                    a.type_name(),
                    b.type_name()
                )));
            }
        },
    };
    Ok(ordering)
}

fn relational(op: BinaryOperator, left: &Collection, right: &Collection) -> Result<Collection> {
    let (a, b) = match (left.as_slice(), right.as_slice()) {
        ([], _) | (_, []) => return Ok(Vec::new()),
        ([a], [b]) => (a, b),
        _ => {
            return Err(FhirMapError::evaluation(format!(
                "Operator {op} requires singleton operands"
            )));
        }
    };
    let Some(ordering) = compare(a, b)? else {
        return Ok(Vec::new());
    };
    let result = match op {
        BinaryOperator::LessThan => ordering == Ordering::Less,
        BinaryOperator::LessThanOrEqual => ordering != Ordering::Greater,
        BinaryOperator::GreaterThan => ordering == Ordering::Greater,
        _ => ordering != Ordering::Less,
    };
    Ok(vec![result.into()])
}

/// `|`: concatenation without duplicates
pub(crate) fn union(left: &Collection, right: &Collection) -> Collection {
    let mut result: Collection = Vec::with_capacity(left.len() + right.len());
    for item in left.iter().chain(right) {
        if !result.iter().any(|r| item_equals(r, item) == Some(true)) {
            result.push(item.clone());
        }
    }
    result
}

/// True if `collection` holds an item equal to `item`
pub(crate) fn contains_item(collection: &Collection, item: &FhirPathValue) -> bool {
    collection.iter().any(|c| item_equals(c, item) == Some(true))
}

fn membership(item: &Collection, collection: &Collection) -> Result<Collection> {
    match item.as_slice() {
        [] => Ok(Vec::new()),
        [single] => Ok(vec![contains_item(collection, single).into()]),
        _ => Err(FhirMapError::evaluation(
            "Membership operators require a singleton item",
        )),
    }
}

fn arithmetic(op: BinaryOperator, left: &Collection, right: &Collection) -> Result<Collection> {
    let (a, b) = match (left.as_slice(), right.as_slice()) {
        ([], _) | (_, []) => return Ok(Vec::new()),
        ([a], [b]) => (a.primitive(), b.primitive()),
        _ => {
            return Err(FhirMapError::evaluation(format!(
                "Operator {op} requires singleton operands"
            )));
        }
    };
    let (Some(a), Some(b)) = (a, b) else {
        return Ok(Vec::new());
    };
    let overflow = || FhirMapError::evaluation(format!("Arithmetic overflow in {op}"));

    let result = match (op, &a, &b) {
        (BinaryOperator::Add, FhirPathValue::String(x), FhirPathValue::String(y)) => {
            Some(FhirPathValue::String(format!("{x}{y}")))
        }
        (BinaryOperator::Add | BinaryOperator::Subtract, _, FhirPathValue::Quantity(q))
            if matches!(a, FhirPathValue::Date(_) | FhirPathValue::DateTime(_)) =>
        {
            let negate = op == BinaryOperator::Subtract;
            Some(shift_temporal(&a, q, negate)?)
        }
        (_, FhirPathValue::Integer(x), FhirPathValue::Integer(y)) => match op {
            BinaryOperator::Add => Some(x.checked_add(*y).ok_or_else(overflow)?.into()),
            BinaryOperator::Subtract => Some(x.checked_sub(*y).ok_or_else(overflow)?.into()),
            BinaryOperator::Multiply => Some(x.checked_mul(*y).ok_or_else(overflow)?.into()),
            BinaryOperator::Divide => Decimal::from(*x)
                .checked_div(Decimal::from(*y))
                .map(FhirPathValue::Decimal),
            BinaryOperator::IntegerDivide => x.checked_div(*y).map(FhirPathValue::Integer),
            _ => x.checked_rem(*y).map(FhirPathValue::Integer),
        },
        (_, FhirPathValue::Quantity(x), FhirPathValue::Quantity(y))
            if x.unit == y.unit && matches!(op, BinaryOperator::Add | BinaryOperator::Subtract) =>
        {
            let value = if op == BinaryOperator::Add {
                x.value.checked_add(y.value)
            } else {
                x.value.checked_sub(y.value)
            };
            Some(FhirPathValue::Quantity(Quantity::new(
                value.ok_or_else(overflow)?,
                x.unit.clone(),
            )))
        }
        _ => {
            let (Some(x), Some(y)) = (a.as_decimal(), b.as_decimal()) else {
                return Err(FhirMapError::evaluation(format!(
                    "Operator {op} cannot be applied to {} and {}",
                    a.type_name(),
                    b.type_name()
                )));
            };
            match op {
                BinaryOperator::Add => Some(x.checked_add(y).ok_or_else(overflow)?.into_value()),
                BinaryOperator::Subtract => Some(x.checked_sub(y).ok_or_else(overflow)?.into_value()),
                BinaryOperator::Multiply => Some(x.checked_mul(y).ok_or_else(overflow)?.into_value()),
                BinaryOperator::Divide => x.checked_div(y).map(IntoValue::into_value),
                BinaryOperator::IntegerDivide => x
                    .checked_div(y)
                    .and_then(|d| d.trunc().to_i64())
                    .map(FhirPathValue::Integer),
                _ => x.checked_rem(y).map(IntoValue::into_value),
            }
        }
    };
    Ok(result.into_iter().collect())
}

trait IntoValue {
    fn into_value(self) -> FhirPathValue;
}

impl IntoValue for Decimal {
    fn into_value(self) -> FhirPathValue {
        FhirPathValue::Decimal(self.normalize())
    }
}

/// Date or dateTime moved by a calendar or time quantity
fn shift_temporal(value: &FhirPathValue, quantity: &Quantity, negate: bool) -> Result<FhirPathValue> {
    let unsupported = || {
        FhirMapError::evaluation(format!(
            "Unable to add {quantity} to {}",
            value.as_string().unwrap_or_default()
        ))
    };
    let amount = quantity.value.trunc().to_i64().ok_or_else(unsupported)?;
    let amount = if negate { -amount } else { amount };
    let unit = match quantity.unit.as_str() {
        "year" | "years" => "a",
        "month" | "months" => "mo",
        "week" | "weeks" => "wk",
        "day" | "days" => "d",
        "hour" | "hours" => "h",
        "minute" | "minutes" => "min",
        "second" | "seconds" => "s",
        "millisecond" | "milliseconds" => "ms",
        other => other,
    };

    match value {
        FhirPathValue::Date(text) => {
            let date = NaiveDate::parse_from_str(text, "%Y-%m-%d").map_err(|_| unsupported())?;
            let shifted = match unit {
                "a" => add_months(date, amount.saturating_mul(12)),
                "mo" => add_months(date, amount),
                "wk" => Duration::try_weeks(amount).and_then(|d| date.checked_add_signed(d)),
                "d" => Duration::try_days(amount).and_then(|d| date.checked_add_signed(d)),
                _ => None,
            }
            .ok_or_else(unsupported)?;
            Ok(FhirPathValue::Date(shifted.format("%Y-%m-%d").to_string()))
        }
        FhirPathValue::DateTime(text) => {
            let moment = DateTime::parse_from_rfc3339(text).map_err(|_| unsupported())?;
            let delta = match unit {
                "wk" => Duration::try_weeks(amount),
                "d" => Duration::try_days(amount),
                "h" => Duration::try_hours(amount),
                "min" => Duration::try_minutes(amount),
                "s" => Duration::try_seconds(amount),
                "ms" => Duration::try_milliseconds(amount),
                _ => None,
            }
            .ok_or_else(unsupported)?;
            let shifted = moment.checked_add_signed(delta).ok_or_else(unsupported)?;
            Ok(FhirPathValue::DateTime(shifted.to_rfc3339()))
        }
        _ => Err(unsupported()),
    }
}

fn add_months(date: NaiveDate, months: i64) -> Option<NaiveDate> {
    let magnitude = Months::new(u32::try_from(months.unsigned_abs()).ok()?);
    if months >= 0 {
        date.checked_add_months(magnitude)
    } else {
        date.checked_sub_months(magnitude)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn int(i: i64) -> Collection {
        vec![FhirPathValue::Integer(i)]
    }

    #[test]
    fn integer_arithmetic() {
        assert_eq!(operate(BinaryOperator::Add, &int(1), &int(2)).unwrap(), int(3));
        assert_eq!(operate(BinaryOperator::IntegerDivide, &int(7), &int(2)).unwrap(), int(3));
        assert_eq!(operate(BinaryOperator::Modulo, &int(7), &int(2)).unwrap(), int(1));
        assert_eq!(
            operate(BinaryOperator::Divide, &int(1), &int(4)).unwrap(),
            vec![FhirPathValue::Decimal(Decimal::new(25, 2))]
        );
        assert!(operate(BinaryOperator::Divide, &int(1), &int(0)).unwrap().is_empty());
        assert!(operate(BinaryOperator::Add, &int(i64::MAX), &int(1)).is_err());
    }

    #[test]
    fn empty_propagates_through_equality() {
        assert!(operate(BinaryOperator::Equal, &vec![], &int(1)).unwrap().is_empty());
        assert_eq!(
            operate(BinaryOperator::Equivalent, &vec![], &vec![]).unwrap(),
            vec![FhirPathValue::Boolean(true)]
        );
    }

    #[test]
    fn three_valued_logic() {
        let t = vec![FhirPathValue::Boolean(true)];
        let f = vec![FhirPathValue::Boolean(false)];
        let empty: Collection = vec![];
        assert_eq!(operate(BinaryOperator::And, &empty, &f).unwrap(), f);
        assert!(operate(BinaryOperator::And, &empty, &t).unwrap().is_empty());
        assert_eq!(operate(BinaryOperator::Or, &empty, &t).unwrap(), t);
        assert_eq!(operate(BinaryOperator::Implies, &f, &empty).unwrap(), t);
        assert_eq!(operate(BinaryOperator::Xor, &t, &f).unwrap(), t);
    }

    #[test]
    fn string_equivalence_ignores_case_and_spacing() {
        let a = vec![FhirPathValue::string("Hello  World")];
        let b = vec![FhirPathValue::string("hello world")];
        assert!(equivalent(&a, &b));
        assert_eq!(equals(&a, &b), Some(false));
    }

    #[test]
    fn dates_compare_by_precision() {
        let a = FhirPathValue::Date("2020-01".into());
        let b = FhirPathValue::Date("2020-01-15".into());
        let c = FhirPathValue::Date("2021".into());
        assert_eq!(compare(&a, &b).unwrap(), None);
        assert_eq!(compare(&a, &c).unwrap(), Some(Ordering::Less));
    }

    #[test]
    fn date_plus_calendar_quantity() {
        let date = vec![FhirPathValue::Date("2020-01-31".into())];
        let month = vec![FhirPathValue::Quantity(Quantity::new(Decimal::ONE, "mo"))];
        assert_eq!(
            operate(BinaryOperator::Add, &date, &month).unwrap(),
            vec![FhirPathValue::Date("2020-02-29".into())]
        );
    }

    #[test]
    fn union_removes_duplicates() {
        let left = int(1).into_iter().chain(int(2)).collect();
        let right = int(2).into_iter().chain(int(3)).collect();
        let expected: Collection = vec![1, 2, 3].into_iter().map(FhirPathValue::Integer).collect();
        assert_eq!(union(&left, &right), expected);
    }
}
