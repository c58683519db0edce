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

//! Conversion functions (`toX()` / `convertsToX()`)

use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::Decimal;

use crate::model::{FhirPathValue, Quantity};

static DATE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\d{4}(-\d{2}(-\d{2})?)?$").expect("valid date pattern")
});

static DATE_TIME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\d{4}(-\d{2}(-\d{2}(T\d{2}(:\d{2}(:\d{2}(\.\d+)?)?)?(Z|[+-]\d{2}:\d{2})?)?)?)?$")
        .expect("valid dateTime pattern")
});

static TIME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\d{2}(:\d{2}(:\d{2}(\.\d+)?)?)?$").expect("valid time pattern")
});

static QUANTITY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*([+-]?\d+(\.\d+)?)\s*('([^']+)'|([a-zA-Z]+))?\s*$").expect("valid quantity pattern")
});

/// Target of a conversion function
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Conversion {
    Boolean,
    Integer,
    Decimal,
    String,
    Quantity,
    Date,
    DateTime,
    Time,
}

/// Convert a single value, `None` when not convertible
pub(crate) fn convert(value: &FhirPathValue, target: Conversion) -> Option<FhirPathValue> {
    let value = value.primitive()?;
    match target {
        Conversion::Boolean => to_boolean(&value).map(FhirPathValue::Boolean),
        Conversion::Integer => match value {
            FhirPathValue::Integer(i) => Some(FhirPathValue::Integer(i)),
            FhirPathValue::Boolean(b) => Some(FhirPathValue::Integer(i64::from(b))),
            FhirPathValue::String(s) => s.trim().parse().ok().map(FhirPathValue::Integer),
            _ => None,
        },
        Conversion::Decimal => match value {
            FhirPathValue::Integer(i) => Some(FhirPathValue::Decimal(Decimal::from(i))),
            FhirPathValue::Decimal(d) => Some(FhirPathValue::Decimal(d)),
            FhirPathValue::Boolean(b) => Some(FhirPathValue::Decimal(if b { Decimal::ONE } else { Decimal::ZERO })),
            FhirPathValue::String(s) => Decimal::from_str(s.trim()).ok().map(FhirPathValue::Decimal),
            _ => None,
        },
        Conversion::String => value.as_string().map(FhirPathValue::String),
        Conversion::Quantity => to_quantity(&value).map(FhirPathValue::Quantity),
        Conversion::Date => match value {
            FhirPathValue::Date(d) => Some(FhirPathValue::Date(d)),
            FhirPathValue::DateTime(dt) => Some(FhirPathValue::Date(
                dt.split('T').next().unwrap_or_default().to_string(),
            )),
            FhirPathValue::String(s) if DATE_RE.is_match(&s) => Some(FhirPathValue::Date(s)),
            _ => None,
        },
        Conversion::DateTime => match value {
            FhirPathValue::DateTime(dt) => Some(FhirPathValue::DateTime(dt)),
            FhirPathValue::Date(d) => Some(FhirPathValue::DateTime(d)),
            FhirPathValue::String(s) if DATE_TIME_RE.is_match(&s) => Some(FhirPathValue::DateTime(s)),
            _ => None,
        },
        Conversion::Time => match value {
            FhirPathValue::Time(t) => Some(FhirPathValue::Time(t)),
            FhirPathValue::String(s) if TIME_RE.is_match(&s) => Some(FhirPathValue::Time(s)),
            _ => None,
        },
    }
}

fn to_boolean(value: &FhirPathValue) -> Option<bool> {
    match value {
        FhirPathValue::Boolean(b) => Some(*b),
        FhirPathValue::Integer(1) => Some(true),
        FhirPathValue::Integer(0) => Some(false),
        FhirPathValue::Decimal(d) if *d == Decimal::ONE => Some(true),
        FhirPathValue::Decimal(d) if d.is_zero() => Some(false),
        FhirPathValue::String(s) => match s.to_lowercase().as_str() {
            "true" | "t" | "yes" | "y" | "1" | "1.0" => Some(true),
            "false" | "f" | "no" | "n" | "0" | "0.0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn to_quantity(value: &FhirPathValue) -> Option<Quantity> {
    match value {
        FhirPathValue::Quantity(q) => Some(q.clone()),
        FhirPathValue::Integer(i) => Some(Quantity::new(Decimal::from(*i), "1")),
        FhirPathValue::Decimal(d) => Some(Quantity::new(*d, "1")),
        FhirPathValue::Boolean(b) => Some(Quantity::new(if *b { Decimal::ONE } else { Decimal::ZERO }, "1")),
        FhirPathValue::String(s) => parse_quantity(s),
        _ => None,
    }
}

/// Parse `5 'mg'`, `5 mg`, or a bare number
pub(crate) fn parse_quantity(text: &str) -> Option<Quantity> {
    let captures = QUANTITY_RE.captures(text)?;
    let value = Decimal::from_str(captures.get(1)?.as_str()).ok()?;
    let unit = captures
        .get(4)
        .or_else(|| captures.get(5))
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| "1".to_string());
    Some(Quantity::new(value, unit))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_conversions() {
        let s = |t: &str| FhirPathValue::string(t);
        assert_eq!(convert(&s("Yes"), Conversion::Boolean), Some(FhirPathValue::Boolean(true)));
        assert_eq!(convert(&s("12"), Conversion::Integer), Some(FhirPathValue::Integer(12)));
        assert_eq!(convert(&s("1.5x"), Conversion::Decimal), None);
        assert_eq!(convert(&s("2020-02"), Conversion::Date), Some(FhirPathValue::Date("2020-02".into())));
        assert_eq!(convert(&s("2020-02-30T"), Conversion::DateTime), None);
        assert_eq!(
            convert(&s("5.5 'mg'"), Conversion::Quantity),
            Some(FhirPathValue::Quantity(Quantity::new(Decimal::new(55, 1), "mg")))
        );
    }

    #[test]
    fn date_time_to_date_drops_time() {
        let value = FhirPathValue::DateTime("2020-01-02T10:00:00Z".into());
        assert_eq!(convert(&value, Conversion::Date), Some(FhirPathValue::Date("2020-01-02".into())));
    }
}
