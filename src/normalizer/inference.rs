//! Per-column type inference.

use crate::database::DatabaseValue;
use crate::schema::ColumnType;

pub(crate) fn parse_boolean(raw: &str) -> Option<bool> {
    let s = raw.trim();
    if s.eq_ignore_ascii_case("true") {
        Some(true)
    } else if s.eq_ignore_ascii_case("false") {
        Some(false)
    } else {
        None
    }
}

pub(crate) fn parse_integer(raw: &str) -> Option<i64> {
    raw.trim().parse::<i64>().ok()
}

/// Finite floats only; `NaN` and `inf` stay text.
pub(crate) fn parse_float(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|f| f.is_finite())
}

pub(crate) fn fits(column_type: ColumnType, raw: &str) -> bool {
    match column_type {
        ColumnType::Boolean => parse_boolean(raw).is_some(),
        ColumnType::Integer => parse_integer(raw).is_some(),
        ColumnType::Float => parse_float(raw).is_some(),
        ColumnType::String => true,
    }
}

/// Convert a non-empty cell to `column_type`, `None` if it does not fit.
pub(crate) fn coerce(column_type: ColumnType, raw: &str) -> Option<DatabaseValue> {
    match column_type {
        ColumnType::Boolean => parse_boolean(raw).map(DatabaseValue::Boolean),
        ColumnType::Integer => parse_integer(raw).map(DatabaseValue::Integer),
        ColumnType::Float => parse_float(raw).map(DatabaseValue::Float),
        ColumnType::String => Some(DatabaseValue::Text(raw.to_string())),
    }
}

/// Running tally of what a column's non-null values parse as.
///
/// Each value is counted once, under the narrowest type it fits.
#[derive(Debug, Default, Clone)]
pub(crate) struct TypeCandidate {
    non_null: usize,
    booleans: usize,
    integers: usize,
    floats: usize,
}

impl TypeCandidate {
    pub(crate) fn observe(&mut self, raw: &str) {
        self.non_null += 1;
        if parse_boolean(raw).is_some() {
            self.booleans += 1;
        } else if parse_integer(raw).is_some() {
            self.integers += 1;
        } else if parse_float(raw).is_some() {
            self.floats += 1;
        }
    }

    fn typed(&self) -> usize {
        self.booleans + self.integers + self.floats
    }

    /// Narrowest type every observed value fits. Empty columns are strings.
    pub(crate) fn resolve(&self) -> ColumnType {
        if self.non_null == 0 {
            ColumnType::String
        } else if self.booleans == self.non_null {
            ColumnType::Boolean
        } else if self.integers == self.non_null {
            ColumnType::Integer
        } else if self.integers + self.floats == self.non_null {
            ColumnType::Float
        } else {
            ColumnType::String
        }
    }

    /// Type most values pointed to when a minority of stray values forced
    /// the column to string.
    pub(crate) fn loosened_from(&self) -> Option<ColumnType> {
        if self.resolve() != ColumnType::String || self.typed() * 2 <= self.non_null {
            return None;
        }
        let numeric = self.integers + self.floats;
        Some(if self.booleans >= numeric {
            ColumnType::Boolean
        } else if self.floats > 0 {
            ColumnType::Float
        } else {
            ColumnType::Integer
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(values: &[&str]) -> TypeCandidate {
        let mut c = TypeCandidate::default();
        for v in values {
            c.observe(v);
        }
        c
    }

    #[test]
    fn test_precedence() {
        assert_eq!(candidate(&["true", "FALSE"]).resolve(), ColumnType::Boolean);
        assert_eq!(candidate(&["1", "-2", "+3"]).resolve(), ColumnType::Integer);
        assert_eq!(candidate(&["1", "2.5"]).resolve(), ColumnType::Float);
        assert_eq!(candidate(&["1", "abc"]).resolve(), ColumnType::String);
        assert_eq!(candidate(&[]).resolve(), ColumnType::String);
    }

    #[test]
    fn test_numeric_tokens_are_not_booleans() {
        assert_eq!(candidate(&["1", "0"]).resolve(), ColumnType::Integer);
        assert_eq!(candidate(&["yes", "no"]).resolve(), ColumnType::String);
    }

    #[test]
    fn test_non_finite_floats_are_text() {
        assert_eq!(parse_float("NaN"), None);
        assert_eq!(parse_float("inf"), None);
        assert_eq!(candidate(&["1.5", "NaN"]).resolve(), ColumnType::String);
    }

    #[test]
    fn test_integer_overflow_widens_to_float() {
        assert_eq!(
            candidate(&["1", "99999999999999999999"]).resolve(),
            ColumnType::Float
        );
    }

    #[test]
    fn test_loosening_detected_for_stray_values() {
        assert_eq!(
            candidate(&["1", "2", "n/a"]).loosened_from(),
            Some(ColumnType::Integer)
        );
        assert_eq!(
            candidate(&["1.5", "2", "oops"]).loosened_from(),
            Some(ColumnType::Float)
        );
        assert_eq!(
            candidate(&["true", "false", "1"]).loosened_from(),
            Some(ColumnType::Boolean)
        );
    }

    #[test]
    fn test_text_columns_are_not_loosened() {
        assert_eq!(candidate(&["Alice", "Bob", "7"]).loosened_from(), None);
        assert_eq!(candidate(&["1", "2"]).loosened_from(), None);
    }

    #[test]
    fn test_coerce_keeps_string_text() {
        assert_eq!(
            coerce(ColumnType::String, " padded "),
            Some(DatabaseValue::Text(" padded ".to_string()))
        );
        assert_eq!(coerce(ColumnType::Integer, " 42 "), Some(DatabaseValue::Integer(42)));
        assert_eq!(coerce(ColumnType::Integer, "4.2"), None);
        assert!(fits(ColumnType::Float, "4"));
    }
}
