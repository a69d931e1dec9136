//! Literal value normalization shared by the JSON bridge and the canonical
//! node hasher.
//!
//! All numeric literals are stored as 64-bit floats so that values written
//! by different replicas (or re-imported from JSON) compare and hash
//! identically. Both the signature payload and the exported JSON go through
//! this one encoder; anything else would let the two representations drift
//! apart and break signatures.

use serde_json::{Number, Value};

/// Coerces an integer literal to its 64-bit float form. Non-numbers pass
/// through untouched.
pub fn normalize_number(value: Value) -> Value {
    if let Value::Number(n) = &value {
        if !n.is_f64() {
            if let Some(f) = n.as_f64() {
                if let Some(normalized) = Number::from_f64(f) {
                    return Value::Number(normalized);
                }
            }
        }
    }
    value
}

/// Deterministic rendering of a literal for hashing.
pub fn canonical_literal(value: &Value) -> String {
    normalize_number(value.clone()).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn integers_normalize_to_floats() {
        assert_eq!(normalize_number(json!(123)), json!(123.0));
        assert_eq!(normalize_number(json!(-7)), json!(-7.0));
        assert_eq!(normalize_number(json!(1.5)), json!(1.5));
    }

    #[test]
    fn non_numbers_pass_through() {
        assert_eq!(normalize_number(json!("abc")), json!("abc"));
        assert_eq!(normalize_number(json!(true)), json!(true));
        assert_eq!(normalize_number(Value::Null), Value::Null);
    }

    #[test]
    fn canonical_form_matches_across_int_and_float() {
        assert_eq!(canonical_literal(&json!(123)), canonical_literal(&json!(123.0)));
        assert_eq!(canonical_literal(&json!("x")), "\"x\"");
    }
}
