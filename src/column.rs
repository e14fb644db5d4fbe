//! # Column Descriptors
//!
//! Every document model declares its columns as [`ColumnDef`] values: either
//! a computed JSON path read out of the document blob at query time, or a
//! dedicated typed column mirrored from the blob at write time for
//! indexing and filtering.
//!
//! Declarations are resolved once, at model construction, into
//! [`ResolvedColumn`] strategies that own the SQL fragments for selection,
//! filtering, and migration. Illegal combinations are rejected there, not at
//! call time.

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value as JsonValue;

use crate::db::{Migration, SqlValue};
use crate::error::{Error, Result};
use crate::table::DocumentTable;

// =============================================================================
// SQL Types and Modes
// =============================================================================

/// Storage type of a dedicated column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlType {
    Text,
    Integer,
    Real,
    Numeric,
    Blob,
    Json,
}

impl SqlType {
    pub fn to_sql(self) -> &'static str {
        match self {
            SqlType::Text => "TEXT",
            SqlType::Integer => "INTEGER",
            SqlType::Real => "REAL",
            SqlType::Numeric => "NUMERIC",
            SqlType::Blob => "BLOB",
            // SQLite has no JSON affinity; JSON text is stored as TEXT.
            SqlType::Json => "TEXT",
        }
    }
}

/// Indexing mode for a dedicated column.
///
/// `All` indexes every row; by convention NULLs are excluded from lookups
/// anyway, so `Sparse` (a partial index skipping NULLs) is the usual choice
/// for optional fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IndexMode {
    #[default]
    None,
    All,
    Sparse,
}

/// Where a column's value physically lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    /// Computed from the JSON blob at read/filter time; no physical column.
    JsonPath,
    /// A dedicated typed column, mirrored from the blob by the write path.
    Real { sql_type: SqlType },
}

// =============================================================================
// Column Functions
// =============================================================================

/// Derives the stored value from the full object at write time. May be
/// asynchronous and may query the table it belongs to (e.g. for uniqueness
/// probes). Returning `None` leaves the field to defaults.
pub type ValueFn =
    Arc<dyn Fn(JsonValue, DocumentTable) -> BoxFuture<'static, Result<Option<JsonValue>>> + Send + Sync>;

/// Extracts the source string a unique slug is derived from.
pub type SlugSourceFn = Arc<dyn Fn(&JsonValue) -> Option<String> + Send + Sync>;

/// Transform between stored and in-memory representations.
pub type TransformFn = Arc<dyn Fn(JsonValue) -> Result<JsonValue> + Send + Sync>;

// =============================================================================
// Column Definition
// =============================================================================

/// Declarative definition of one column of a document model.
#[derive(Clone)]
pub struct ColumnDef {
    pub name: String,
    pub kind: ColumnKind,
    /// Path within the JSON document; defaults to the column name.
    pub path: Option<String>,
    pub value: Option<ValueFn>,
    pub slug_value: Option<SlugSourceFn>,
    pub default: Option<JsonValue>,
    pub required: bool,
    pub index: IndexMode,
    pub unique: bool,
    /// Filter values that are arrays expand to an `IN (...)` clause.
    pub in_array: bool,
    /// String filter values match as substrings (`LIKE %v%`).
    pub searchable: bool,
    pub parse: Option<TransformFn>,
    pub stringify: Option<TransformFn>,
    /// Only legal on an INTEGER id column.
    pub auto_increment: bool,
}

impl fmt::Debug for ColumnDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ColumnDef")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("index", &self.index)
            .field("unique", &self.unique)
            .finish()
    }
}

impl ColumnDef {
    /// A computed JSON-path column.
    pub fn json(name: impl Into<String>) -> Self {
        Self::with_kind(name, ColumnKind::JsonPath)
    }

    /// A dedicated typed column.
    pub fn real(name: impl Into<String>, sql_type: SqlType) -> Self {
        Self::with_kind(name, ColumnKind::Real { sql_type })
    }

    fn with_kind(name: impl Into<String>, kind: ColumnKind) -> Self {
        Self {
            name: name.into(),
            kind,
            path: None,
            value: None,
            slug_value: None,
            default: None,
            required: false,
            index: IndexMode::None,
            unique: false,
            in_array: false,
            searchable: false,
            parse: None,
            stringify: None,
            auto_increment: false,
        }
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn value_fn(mut self, f: ValueFn) -> Self {
        self.value = Some(f);
        self
    }

    pub fn slug_from(mut self, f: SlugSourceFn) -> Self {
        self.slug_value = Some(f);
        self
    }

    pub fn default_value(mut self, v: JsonValue) -> Self {
        self.default = Some(v);
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn indexed(mut self, mode: IndexMode) -> Self {
        self.index = mode;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn in_array(mut self) -> Self {
        self.in_array = true;
        self
    }

    pub fn searchable(mut self) -> Self {
        self.searchable = true;
        self
    }

    pub fn parse_with(mut self, f: TransformFn) -> Self {
        self.parse = Some(f);
        self
    }

    pub fn stringify_with(mut self, f: TransformFn) -> Self {
        self.stringify = Some(f);
        self
    }

    pub fn auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self
    }
}

// =============================================================================
// Resolved Columns
// =============================================================================

/// A [`ColumnDef`] resolved against its table: owns the SQL fragments for
/// selection, filtering, and migration.
#[derive(Clone)]
pub struct ResolvedColumn {
    pub def: ColumnDef,
    /// Quoted identifier, valid only for dedicated columns.
    pub quoted: String,
    /// Expression yielding the column's value in SELECT/WHERE position.
    pub select_expr: String,
    /// JSON path literal (`$.a.b`) into the document blob.
    pub json_path: String,
}

impl fmt::Debug for ResolvedColumn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedColumn")
            .field("name", &self.def.name)
            .field("select_expr", &self.select_expr)
            .finish()
    }
}

impl ResolvedColumn {
    /// Validates the declaration and computes its SQL fragments.
    pub fn resolve(def: ColumnDef, table: &str, id_col: &str, json_col: &str) -> Result<Self> {
        if def.value.is_some() && def.slug_value.is_some() {
            return Err(Error::ColumnConfig(format!(
                "column '{}' on '{table}' declares both value and slug_value",
                def.name
            )));
        }
        if def.unique && def.index == IndexMode::None {
            return Err(Error::ColumnConfig(format!(
                "column '{}' on '{table}' is unique but not indexed",
                def.name
            )));
        }
        if def.index != IndexMode::None && def.kind == ColumnKind::JsonPath {
            return Err(Error::ColumnConfig(format!(
                "column '{}' on '{table}' is a computed JSON path and cannot be indexed",
                def.name
            )));
        }
        if def.auto_increment {
            let integer_id = def.name == id_col
                && matches!(def.kind, ColumnKind::Real { sql_type: SqlType::Integer });
            if !integer_id {
                return Err(Error::ColumnConfig(format!(
                    "column '{}' on '{table}': auto_increment is only legal on the INTEGER id column",
                    def.name
                )));
            }
        }

        let path = def.path.clone().unwrap_or_else(|| def.name.clone());
        let json_path = format!("$.{path}");
        let quoted = quote_ident(&def.name);
        let select_expr = match def.kind {
            ColumnKind::Real { .. } => quoted.clone(),
            ColumnKind::JsonPath => format!(
                "json_extract({}, {})",
                quote_ident(json_col),
                quote_string(&json_path)
            ),
        };

        Ok(Self { def, quoted, select_expr, json_path })
    }

    pub fn is_real(&self) -> bool {
        matches!(self.def.kind, ColumnKind::Real { .. })
    }

    /// Translates a filter value into a WHERE fragment plus bound values.
    ///
    /// Arrays on `in_array` columns expand to `IN (...)`; strings on
    /// `searchable` columns match as substrings; everything else is
    /// equality (with `IS NULL` for null).
    pub fn filter_clause(&self, value: &JsonValue) -> (String, Vec<SqlValue>) {
        match value {
            JsonValue::Array(items) if self.def.in_array => {
                if items.is_empty() {
                    // IN () is a syntax error; an empty set matches nothing.
                    return ("0".to_string(), vec![]);
                }
                let marks = vec!["?"; items.len()].join(", ");
                let params = items.iter().map(json_to_sql).collect();
                (format!("{} IN ({marks})", self.select_expr), params)
            }
            JsonValue::String(s) if self.def.searchable => (
                format!("{} LIKE ? ESCAPE '\\'", self.select_expr),
                vec![SqlValue::Text(format!("%{}%", escape_like(s)))],
            ),
            JsonValue::Null => (format!("{} IS NULL", self.select_expr), vec![]),
            other => (
                format!("{} = ?", self.select_expr),
                vec![json_to_sql(other)],
            ),
        }
    }

    /// Forward-only migrations adding the dedicated column and its index.
    /// Computed JSON-path columns have none.
    pub fn migrations(&self, table: &str) -> Vec<Migration> {
        let ColumnKind::Real { sql_type } = self.def.kind else {
            return Vec::new();
        };
        let mut out = vec![Migration {
            key: format!("{table}:add-{}", self.def.name),
            sql: format!(
                "ALTER TABLE {} ADD COLUMN {} {}",
                quote_ident(table),
                self.quoted,
                sql_type.to_sql()
            ),
        }];
        if self.def.index != IndexMode::None {
            let unique = if self.def.unique { "UNIQUE " } else { "" };
            let sparse = if self.def.index == IndexMode::Sparse {
                format!(" WHERE {} IS NOT NULL", self.quoted)
            } else {
                String::new()
            };
            out.push(Migration {
                key: format!("{table}:index-{}", self.def.name),
                sql: format!(
                    "CREATE {unique}INDEX IF NOT EXISTS {} ON {}({}){sparse}",
                    quote_ident(&format!("{table}_{}", self.def.name)),
                    quote_ident(table),
                    self.quoted
                ),
            });
        }
        out
    }

    /// Stored value → in-memory value, through the declared `parse`.
    pub fn parse_value(&self, v: JsonValue) -> Result<JsonValue> {
        match &self.def.parse {
            Some(f) => f(v),
            None => Ok(v),
        }
    }

    /// In-memory value → stored value, through the declared `stringify`.
    pub fn stringify_value(&self, v: JsonValue) -> Result<JsonValue> {
        match &self.def.stringify {
            Some(f) => f(v),
            None => Ok(v),
        }
    }
}

// =============================================================================
// SQL / JSON Bridging
// =============================================================================

/// Quotes an identifier for SQL.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quotes a string literal for SQL.
pub fn quote_string(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

fn escape_like(s: &str) -> String {
    s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

/// Converts a JSON value to an owned SQL bind value. Objects and arrays are
/// stored as their JSON text.
pub fn json_to_sql(value: &JsonValue) -> SqlValue {
    match value {
        JsonValue::Null => SqlValue::Null,
        JsonValue::Bool(b) => SqlValue::Integer(*b as i64),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                SqlValue::Integer(i)
            } else {
                SqlValue::Real(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        JsonValue::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

/// Converts a stored SQL value back to JSON according to the column type.
/// Blobs surface as base64 text for JSON compatibility.
pub fn sql_to_json(value: &SqlValue, sql_type: SqlType) -> JsonValue {
    match (value, sql_type) {
        (SqlValue::Null, _) => JsonValue::Null,
        (SqlValue::Text(s), SqlType::Json) => {
            serde_json::from_str(s).unwrap_or(JsonValue::String(s.clone()))
        }
        (SqlValue::Text(s), _) => JsonValue::String(s.clone()),
        (SqlValue::Integer(i), _) => JsonValue::Number((*i).into()),
        (SqlValue::Real(f), _) => serde_json::Number::from_f64(*f)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null),
        (SqlValue::Blob(b), _) => {
            use base64::Engine;
            JsonValue::String(base64::engine::general_purpose::STANDARD.encode(b))
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn resolve(def: ColumnDef) -> Result<ResolvedColumn> {
        ResolvedColumn::resolve(def, "things", "id", "json")
    }

    #[test]
    fn test_real_column_fragments() {
        let col = resolve(ColumnDef::real("count", SqlType::Integer).indexed(IndexMode::All)).unwrap();
        assert_eq!(col.select_expr, "\"count\"");
        let migrations = col.migrations("things");
        assert_eq!(migrations.len(), 2);
        assert!(migrations[0].sql.contains("ADD COLUMN \"count\" INTEGER"));
        assert!(migrations[1].sql.contains("CREATE INDEX"));
    }

    #[test]
    fn test_json_path_column_fragments() {
        let col = resolve(ColumnDef::json("nested").path("meta.nested")).unwrap();
        assert_eq!(col.select_expr, "json_extract(\"json\", '$.meta.nested')");
        assert!(col.migrations("things").is_empty());
    }

    #[test]
    fn test_sparse_unique_index() {
        let col = resolve(
            ColumnDef::real("slug", SqlType::Text)
                .indexed(IndexMode::Sparse)
                .unique(),
        )
        .unwrap();
        let migrations = col.migrations("things");
        assert!(migrations[1].sql.contains("CREATE UNIQUE INDEX"));
        assert!(migrations[1].sql.contains("WHERE \"slug\" IS NOT NULL"));
    }

    #[test]
    fn test_illegal_combinations() {
        assert!(resolve(ColumnDef::real("a", SqlType::Text).unique()).is_err());
        assert!(resolve(ColumnDef::json("b").indexed(IndexMode::All)).is_err());
        assert!(resolve(ColumnDef::real("c", SqlType::Text).auto_increment()).is_err());
        assert!(resolve(ColumnDef::real("id", SqlType::Integer).auto_increment()).is_ok());
    }

    #[test]
    fn test_filter_clauses() {
        let eq = resolve(ColumnDef::real("a", SqlType::Text)).unwrap();
        let (sql, params) = eq.filter_clause(&json!("x"));
        assert_eq!(sql, "\"a\" = ?");
        assert_eq!(params, vec![SqlValue::Text("x".into())]);

        let (sql, params) = eq.filter_clause(&JsonValue::Null);
        assert_eq!(sql, "\"a\" IS NULL");
        assert!(params.is_empty());

        let contains = resolve(ColumnDef::real("tags", SqlType::Text).in_array()).unwrap();
        let (sql, params) = contains.filter_clause(&json!(["x", "y"]));
        assert_eq!(sql, "\"tags\" IN (?, ?)");
        assert_eq!(params.len(), 2);
        let (sql, _) = contains.filter_clause(&json!([]));
        assert_eq!(sql, "0");

        let like = resolve(ColumnDef::real("title", SqlType::Text).searchable()).unwrap();
        let (sql, params) = like.filter_clause(&json!("need_le"));
        assert!(sql.contains("LIKE"));
        assert_eq!(params, vec![SqlValue::Text("%need\\_le%".into())]);
    }

    #[test]
    fn test_json_sql_bridging() {
        assert_eq!(json_to_sql(&json!(true)), SqlValue::Integer(1));
        assert_eq!(json_to_sql(&json!({"a": 1})), SqlValue::Text("{\"a\":1}".into()));
        assert_eq!(
            sql_to_json(&SqlValue::Text("{\"a\":1}".into()), SqlType::Json),
            json!({"a": 1})
        );
        assert_eq!(sql_to_json(&SqlValue::Integer(3), SqlType::Integer), json!(3));
    }
}
