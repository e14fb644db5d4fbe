//! # Cursor Pagination
//!
//! A cursor is an opaque, URL-safe token encoding the sort-key tuple of the
//! last row of a page. Consuming it expands into a compound keyset predicate
//!
//! ```text
//! (k1 > v1) OR (k1 = v1 AND (k2 > v2 OR (k2 = v2 AND ...)))
//! ```
//!
//! with the comparison direction per key following that column's sort order,
//! flipped when the token asks for backward paging. The search layer forces
//! the id column as the final, unique tie-breaker, which is what makes the
//! tuple a total order and the round-trip lossless.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde_json::Value as JsonValue;

use crate::column::json_to_sql;
use crate::db::SqlValue;
use crate::error::{Error, Result};

/// Token prefix marking a backward-paging cursor.
const REVERSE_PREFIX: char = '!';

// =============================================================================
// Token Encoding
// =============================================================================

/// A decoded cursor: the resume tuple plus the requested direction.
#[derive(Debug, Clone, PartialEq)]
pub struct Cursor {
    pub keys: Vec<JsonValue>,
    pub reversed: bool,
}

impl Cursor {
    /// Encodes a sort-key tuple into an opaque token.
    pub fn encode(keys: &[JsonValue], reversed: bool) -> Result<String> {
        let json = serde_json::to_vec(keys)?;
        let body = URL_SAFE_NO_PAD.encode(json);
        Ok(if reversed { format!("{REVERSE_PREFIX}{body}") } else { body })
    }

    /// Decodes a token produced by [`Cursor::encode`].
    pub fn decode(token: &str) -> Result<Self> {
        let (reversed, body) = match token.strip_prefix(REVERSE_PREFIX) {
            Some(rest) => (true, rest),
            None => (false, token),
        };
        let bytes = URL_SAFE_NO_PAD
            .decode(body)
            .map_err(|_| Error::Structural(format!("invalid cursor token '{token}'")))?;
        let keys: Vec<JsonValue> = serde_json::from_slice(&bytes)?;
        Ok(Self { keys, reversed })
    }
}

// =============================================================================
// Keyset Predicates
// =============================================================================

/// One sort key of the cursor tuple: the SQL expression plus whether the
/// search sorts it descending.
#[derive(Debug, Clone)]
pub struct SortKey {
    pub expr: String,
    pub desc: bool,
}

/// Expands a decoded cursor into the compound keyset WHERE fragment.
///
/// `invert` flips every comparison (backward paging). The key count must
/// match the tuple; the caller guarantees this by deriving both from the
/// same sort specification.
pub fn keyset_predicate(keys: &[SortKey], values: &[JsonValue], invert: bool) -> (String, Vec<SqlValue>) {
    debug_assert_eq!(keys.len(), values.len());
    let mut params = Vec::new();
    let sql = build_level(keys, values, invert, 0, &mut params);
    (sql, params)
}

fn build_level(
    keys: &[SortKey],
    values: &[JsonValue],
    invert: bool,
    depth: usize,
    params: &mut Vec<SqlValue>,
) -> String {
    let key = &keys[depth];
    let value = &values[depth];
    let op = if key.desc != invert { "<" } else { ">" };

    let strict = format!("{} {op} ?", key.expr);
    params.push(json_to_sql(value));

    if depth + 1 == keys.len() {
        return strict;
    }

    let tie = format!("{} = ?", key.expr);
    params.push(json_to_sql(value));
    let rest = build_level(keys, values, invert, depth + 1, params);
    format!("({strict} OR ({tie} AND {rest}))")
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_token_roundtrip() {
        let keys = vec![json!("alpha"), json!(42)];
        let token = Cursor::encode(&keys, false).unwrap();
        assert!(!token.contains(REVERSE_PREFIX));
        let decoded = Cursor::decode(&token).unwrap();
        assert_eq!(decoded.keys, keys);
        assert!(!decoded.reversed);

        let token = Cursor::encode(&keys, true).unwrap();
        assert!(token.starts_with(REVERSE_PREFIX));
        assert!(Cursor::decode(&token).unwrap().reversed);
    }

    #[test]
    fn test_invalid_token_rejected() {
        assert!(Cursor::decode("&&&not-base64&&&").is_err());
    }

    #[test]
    fn test_single_key_predicate() {
        let keys = [SortKey { expr: "\"id\"".into(), desc: false }];
        let (sql, params) = keyset_predicate(&keys, &[json!(10)], false);
        assert_eq!(sql, "\"id\" > ?");
        assert_eq!(params, vec![SqlValue::Integer(10)]);

        // Descending sort compares the other way.
        let keys = [SortKey { expr: "\"id\"".into(), desc: true }];
        let (sql, _) = keyset_predicate(&keys, &[json!(10)], false);
        assert_eq!(sql, "\"id\" < ?");
    }

    #[test]
    fn test_compound_predicate() {
        let keys = [
            SortKey { expr: "\"name\"".into(), desc: false },
            SortKey { expr: "\"id\"".into(), desc: false },
        ];
        let (sql, params) = keyset_predicate(&keys, &[json!("m"), json!(7)], false);
        assert_eq!(sql, "(\"name\" > ? OR (\"name\" = ? AND \"id\" > ?))");
        assert_eq!(
            params,
            vec![
                SqlValue::Text("m".into()),
                SqlValue::Text("m".into()),
                SqlValue::Integer(7)
            ]
        );
    }

    #[test]
    fn test_inverted_predicate_flips_directions() {
        let keys = [
            SortKey { expr: "\"a\"".into(), desc: true },
            SortKey { expr: "\"id\"".into(), desc: false },
        ];
        let (sql, _) = keyset_predicate(&keys, &[json!(1), json!(2)], true);
        assert_eq!(sql, "(\"a\" > ? OR (\"a\" = ? AND \"id\" < ?))");
    }
}
