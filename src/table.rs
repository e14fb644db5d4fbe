//! # Document Tables
//!
//! A [`DocumentTable`] stores JSON documents over relational rows. The
//! document's non-id, non-dedicated fields live serialized in a reserved
//! `json` column; dedicated columns are extracted from the same input object
//! on every write, so the two can never drift. Reads re-assemble the object
//! from both.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ "things"                                                 │
//! │ ┌────┬─────────┬───────┬────────────────────────────┐    │
//! │ │ id │ created │ count │ json                       │    │
//! │ ├────┼─────────┼───────┼────────────────────────────┤    │
//! │ │ a1 │ 17..    │ 3     │ {"title":"x","meta":{...}} │    │
//! │ └────┴─────────┴───────┴────────────────────────────┘    │
//! │    ▲ dedicated, indexed          ▲ everything else       │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! The physical schema is an ordered list of forward-only migrations derived
//! from the column declarations and recorded in the migration ledger.

use std::collections::HashMap;
use std::sync::Arc;

use futures::TryStreamExt;
use serde_json::{json, Map as JsonMap, Value as JsonValue};

use crate::cache::RowCache;
use crate::column::{
    json_to_sql, quote_ident, sql_to_json, ColumnDef, ColumnKind, ResolvedColumn, SqlType,
};
use crate::cursor::{keyset_predicate, Cursor, SortKey};
use crate::db::{Db, Migration, SqlValue};
use crate::error::{Error, Result};

/// Reserved name of the JSON blob column.
const JSON_COLUMN: &str = "json";

// =============================================================================
// Options
// =============================================================================

/// Sort direction for one search key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDir {
    Asc,
    Desc,
}

/// Options for [`DocumentTable::search`].
#[derive(Clone, Default)]
pub struct SearchOptions {
    /// Extra WHERE fragments with bound values, ANDed onto the column filters.
    pub where_sql: Vec<(String, Vec<SqlValue>)>,
    /// Ordered sort specification. With a limit and cursors enabled, the id
    /// column is forced as the final unique tie-breaker.
    pub sort: Vec<(String, SortDir)>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
    /// Resume token from a previous page.
    pub cursor: Option<String>,
    /// Suppress cursor computation.
    pub no_cursor: bool,
    /// Suppress the total count query.
    pub no_total: bool,
}

/// Result of a [`DocumentTable::search`] call.
#[derive(Debug, Clone, Default)]
pub struct SearchResult {
    pub items: Vec<JsonValue>,
    /// Token resuming after the last row, when another page may exist.
    pub cursor: Option<String>,
    /// Token paging backward from the first row.
    pub prev_cursor: Option<String>,
    pub total: Option<u64>,
}

/// Options for [`DocumentTable::each`].
#[derive(Debug, Clone, Copy)]
pub struct EachOptions {
    pub batch_size: u32,
    pub concurrency: usize,
}

impl Default for EachOptions {
    fn default() -> Self {
        Self { batch_size: 50, concurrency: 5 }
    }
}

/// Aggregate operations over the filter language.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Agg {
    Max,
    Min,
    Sum,
    Avg,
}

impl Agg {
    fn sql(self) -> &'static str {
        match self {
            Agg::Max => "MAX",
            Agg::Min => "MIN",
            Agg::Sum => "SUM",
            Agg::Avg => "AVG",
        }
    }
}

// =============================================================================
// Document Table
// =============================================================================

struct TableInner {
    db: Db,
    name: String,
    quoted_name: String,
    columns: Vec<ResolvedColumn>,
    /// Index into `columns` of the id column.
    id_idx: usize,
    /// Precomputed `SELECT json, id, <real columns> FROM table`.
    select_sql: String,
    /// Real columns (id excluded) in SELECT/INSERT order.
    real_idxs: Vec<usize>,
}

/// A column-mapped JSON document store over one SQLite table.
///
/// Cheap to clone; all clones share the same handle and column resolution.
#[derive(Clone)]
pub struct DocumentTable {
    inner: Arc<TableInner>,
}

impl std::fmt::Debug for DocumentTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentTable").field("name", &self.inner.name).finish()
    }
}

impl DocumentTable {
    /// Resolves the column declarations and, on a writable handle, runs the
    /// table's forward-only migrations.
    pub async fn create(db: Db, name: &str, mut columns: Vec<ColumnDef>) -> Result<Self> {
        if !columns.iter().any(|c| c.name == "id") {
            columns.insert(0, ColumnDef::real("id", SqlType::Text));
        }
        let resolved: Vec<ResolvedColumn> = columns
            .into_iter()
            .map(|c| ResolvedColumn::resolve(c, name, "id", JSON_COLUMN))
            .collect::<Result<_>>()?;

        let id_idx = resolved
            .iter()
            .position(|c| c.def.name == "id")
            .expect("id column inserted above");
        if !resolved[id_idx].is_real() {
            return Err(Error::ColumnConfig(format!(
                "table '{name}': the id column must be a dedicated column"
            )));
        }

        let real_idxs: Vec<usize> = resolved
            .iter()
            .enumerate()
            .filter(|(i, c)| *i != id_idx && c.is_real())
            .map(|(i, _)| i)
            .collect();

        let mut select_cols = vec![quote_ident(JSON_COLUMN), resolved[id_idx].quoted.clone()];
        select_cols.extend(real_idxs.iter().map(|&i| resolved[i].quoted.clone()));
        let select_sql = format!("SELECT {} FROM {}", select_cols.join(", "), quote_ident(name));

        let table = Self {
            inner: Arc::new(TableInner {
                db,
                name: name.to_string(),
                quoted_name: quote_ident(name),
                columns: resolved,
                id_idx,
                select_sql,
                real_idxs,
            }),
        };

        if !table.inner.db.is_read_only() {
            table.inner.db.run_migrations(&table.migrations()).await?;
        }
        Ok(table)
    }

    /// The table name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The handle this table reads and writes through.
    pub fn db(&self) -> &Db {
        &self.inner.db
    }

    /// The same table bound to a different handle (e.g. read-only).
    pub fn with_db(&self, db: Db) -> Self {
        let inner = &self.inner;
        Self {
            inner: Arc::new(TableInner {
                db,
                name: inner.name.clone(),
                quoted_name: inner.quoted_name.clone(),
                columns: inner.columns.clone(),
                id_idx: inner.id_idx,
                select_sql: inner.select_sql.clone(),
                real_idxs: inner.real_idxs.clone(),
            }),
        }
    }

    fn id_col(&self) -> &ResolvedColumn {
        &self.inner.columns[self.inner.id_idx]
    }

    fn col(&self, name: &str) -> Result<&ResolvedColumn> {
        self.inner
            .columns
            .iter()
            .find(|c| c.def.name == name)
            .ok_or_else(|| Error::UnknownColumn {
                table: self.inner.name.clone(),
                column: name.to_string(),
            })
    }

    /// The ordered, forward-only migration list for this table.
    pub fn migrations(&self) -> Vec<Migration> {
        let id = self.id_col();
        let id_decl = match id.def.kind {
            ColumnKind::Real { sql_type: SqlType::Integer } if id.def.auto_increment => {
                format!("{} INTEGER PRIMARY KEY AUTOINCREMENT", id.quoted)
            }
            ColumnKind::Real { sql_type } => {
                format!("{} {} PRIMARY KEY NOT NULL", id.quoted, sql_type.to_sql())
            }
            ColumnKind::JsonPath => unreachable!("checked in create"),
        };
        let mut out = vec![Migration {
            key: format!("{}:create", self.inner.name),
            sql: format!(
                "CREATE TABLE IF NOT EXISTS {} ({id_decl}, {} TEXT)",
                self.inner.quoted_name,
                quote_ident(JSON_COLUMN)
            ),
        }];
        for &i in &self.inner.real_idxs {
            out.extend(self.inner.columns[i].migrations(&self.inner.name));
        }
        out
    }

    // =========================================================================
    // Row Assembly
    // =========================================================================

    /// Re-assembles the raw document from `select_sql` row order:
    /// `[json, id, real columns...]`. No parse transforms.
    fn row_to_raw(&self, row: &[SqlValue]) -> Result<JsonValue> {
        let mut obj = match &row[0] {
            SqlValue::Text(s) => serde_json::from_str(s)?,
            SqlValue::Null => json!({}),
            other => {
                return Err(Error::Structural(format!(
                    "table '{}': json column holds {other:?}",
                    self.inner.name
                )))
            }
        };

        let id = self.id_col();
        let id_type = real_type(id);
        set_path(&mut obj, &id.json_path, sql_to_json(&row[1], id_type));

        for (slot, &i) in self.inner.real_idxs.iter().enumerate() {
            let col = &self.inner.columns[i];
            let v = &row[2 + slot];
            if !v.is_null() {
                set_path(&mut obj, &col.json_path, sql_to_json(v, real_type(col)));
            }
        }
        Ok(obj)
    }

    /// Applies each column's `parse` transform to the assembled document.
    fn apply_parse(&self, mut obj: JsonValue) -> Result<JsonValue> {
        for col in &self.inner.columns {
            if col.def.parse.is_some() {
                if let Some(v) = get_path(&obj, &col.json_path) {
                    let parsed = col.parse_value(v.clone())?;
                    set_path(&mut obj, &col.json_path, parsed);
                }
            }
        }
        Ok(obj)
    }

    fn row_to_object(&self, row: &[SqlValue]) -> Result<JsonValue> {
        self.apply_parse(self.row_to_raw(row)?)
    }

    // =========================================================================
    // Point Lookups
    // =========================================================================

    /// Fetches one document by id.
    pub async fn get(&self, id: &JsonValue) -> Result<Option<JsonValue>> {
        self.get_by("id", id).await
    }

    /// Fetches one document by any declared column.
    pub async fn get_by(&self, column: &str, value: &JsonValue) -> Result<Option<JsonValue>> {
        let col = self.col(column)?;
        let sql = format!("{} WHERE {} = ? LIMIT 1", self.inner.select_sql, col.select_expr);
        let stored = col.stringify_value(value.clone())?;
        match self.inner.db.query_one(&sql, &[json_to_sql(&stored)]).await? {
            Some(row) => Ok(Some(self.row_to_object(&row)?)),
            None => Ok(None),
        }
    }

    /// Fetches one document by id through a request-scoped cache.
    pub async fn get_cached(&self, cache: &RowCache, id: &JsonValue) -> Result<Option<JsonValue>> {
        if let Some(hit) = cache.get(&self.inner.name, "id", id) {
            return Ok(hit);
        }
        let loaded = self.get(id).await?;
        cache.put(&self.inner.name, "id", id, loaded.clone());
        Ok(loaded)
    }

    /// Fetches many documents by id, preserving input order; misses stay
    /// `None`.
    pub async fn get_all(&self, ids: &[JsonValue]) -> Result<Vec<Option<JsonValue>>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let id = self.id_col();
        let marks = vec!["?"; ids.len()].join(", ");
        let sql = format!("{} WHERE {} IN ({marks})", self.inner.select_sql, id.select_expr);
        let params: Vec<SqlValue> = ids.iter().map(json_to_sql).collect();
        let rows = self.inner.db.query_all(&sql, &params).await?;

        let mut by_key: HashMap<String, JsonValue> = HashMap::with_capacity(rows.len());
        for row in &rows {
            let obj = self.row_to_object(row)?;
            if let Some(idv) = get_path(&obj, &id.json_path) {
                by_key.insert(json_key(idv), obj.clone());
            }
        }
        Ok(ids.iter().map(|idv| by_key.get(&json_key(idv)).cloned()).collect())
    }

    // =========================================================================
    // Search
    // =========================================================================

    fn build_where(
        &self,
        filter: &JsonValue,
        options: &SearchOptions,
    ) -> Result<(Vec<String>, Vec<SqlValue>)> {
        let mut clauses = Vec::new();
        let mut params = Vec::new();

        if let JsonValue::Object(map) = filter {
            for (name, value) in map {
                let col = self.col(name)?;
                let stored = col.stringify_value(value.clone())?;
                let (sql, mut vals) = col.filter_clause(&stored);
                clauses.push(sql);
                params.append(&mut vals);
            }
        } else if !filter.is_null() {
            return Err(Error::Structural(format!(
                "table '{}': search filter must be an object",
                self.inner.name
            )));
        }

        for (sql, vals) in &options.where_sql {
            clauses.push(format!("({sql})"));
            params.extend(vals.iter().cloned());
        }
        Ok((clauses, params))
    }

    /// Resolves the sort spec, forcing the id column as final tie-breaker
    /// when cursors are in play.
    fn build_sort(&self, options: &SearchOptions) -> Result<Vec<(ResolvedColumn, bool)>> {
        let mut sort: Vec<(ResolvedColumn, bool)> = Vec::new();
        for (name, dir) in &options.sort {
            sort.push((self.col(name)?.clone(), *dir == SortDir::Desc));
        }
        let cursored = options.limit.is_some() && !options.no_cursor;
        if cursored && !sort.iter().any(|(c, _)| c.def.name == "id") {
            sort.push((self.id_col().clone(), false));
        }
        if sort.is_empty() {
            sort.push((self.id_col().clone(), false));
        }
        Ok(sort)
    }

    /// Runs a filtered, sorted, cursor-paginated query.
    pub async fn search(&self, filter: &JsonValue, options: &SearchOptions) -> Result<SearchResult> {
        let (mut clauses, mut params) = self.build_where(filter, options)?;
        let sort = self.build_sort(options)?;
        let cursored = options.limit.is_some() && !options.no_cursor;

        // Totals ignore pagination: count before the cursor predicate.
        let total = if options.no_total {
            None
        } else {
            let where_sql = render_where(&clauses);
            let sql = format!("SELECT COUNT(*) FROM {}{}", self.inner.quoted_name, where_sql);
            let n = self
                .inner
                .db
                .query_scalar(&sql, &params)
                .await?
                .and_then(|v| v.as_i64())
                .unwrap_or(0);
            Some(n as u64)
        };

        let mut reversed = false;
        if let Some(token) = &options.cursor {
            let cursor = Cursor::decode(token)?;
            reversed = cursor.reversed;
            let keys: Vec<SortKey> = sort
                .iter()
                .map(|(c, desc)| SortKey { expr: c.select_expr.clone(), desc: *desc })
                .collect();
            let (sql, mut vals) = keyset_predicate(&keys, &cursor.keys, reversed);
            clauses.push(sql);
            params.append(&mut vals);
        }

        let order = sort
            .iter()
            .map(|(c, desc)| {
                // Backward paging scans the opposite way, un-reversed below.
                let dir = if *desc != reversed { "DESC" } else { "ASC" };
                format!("{} {dir}", c.select_expr)
            })
            .collect::<Vec<_>>()
            .join(", ");

        let mut sql = format!(
            "{}{} ORDER BY {order}",
            self.inner.select_sql,
            render_where(&clauses)
        );
        if let Some(limit) = options.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        if let Some(offset) = options.offset {
            sql.push_str(&format!(" OFFSET {offset}"));
        }

        let rows = self.inner.db.query_all(&sql, &params).await?;

        let mut items = Vec::with_capacity(rows.len());
        let mut key_tuples = Vec::with_capacity(rows.len());
        for row in &rows {
            let raw = self.row_to_raw(row)?;
            if cursored {
                let keys: Vec<JsonValue> = sort
                    .iter()
                    .map(|(c, _)| get_path(&raw, &c.json_path).cloned().unwrap_or(JsonValue::Null))
                    .collect();
                key_tuples.push(keys);
            }
            items.push(self.apply_parse(raw)?);
        }
        if reversed {
            items.reverse();
            key_tuples.reverse();
        }

        let mut cursor_out = None;
        let mut prev_cursor = None;
        if cursored && !items.is_empty() {
            let full_page = items.len() as u32 == options.limit.unwrap_or(0);
            if full_page {
                cursor_out = Some(Cursor::encode(key_tuples.last().unwrap(), false)?);
            }
            prev_cursor = Some(Cursor::encode(key_tuples.first().unwrap(), true)?);
        }

        Ok(SearchResult { items, cursor: cursor_out, prev_cursor, total })
    }

    /// Counts rows matching the filter.
    pub async fn count(&self, filter: &JsonValue) -> Result<u64> {
        let (clauses, params) = self.build_where(filter, &SearchOptions::default())?;
        let sql = format!(
            "SELECT COUNT(*) FROM {}{}",
            self.inner.quoted_name,
            render_where(&clauses)
        );
        let n = self
            .inner
            .db
            .query_scalar(&sql, &params)
            .await?
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        Ok(n as u64)
    }

    /// True when at least one row matches the filter.
    pub async fn exists(&self, filter: &JsonValue) -> Result<bool> {
        let (clauses, params) = self.build_where(filter, &SearchOptions::default())?;
        let sql = format!(
            "SELECT 1 FROM {}{} LIMIT 1",
            self.inner.quoted_name,
            render_where(&clauses)
        );
        Ok(self.inner.db.query_one(&sql, &params).await?.is_some())
    }

    /// Runs an aggregate over one column with the same filter language.
    pub async fn aggregate(&self, op: Agg, column: &str, filter: &JsonValue) -> Result<JsonValue> {
        let col = self.col(column)?.clone();
        let (clauses, params) = self.build_where(filter, &SearchOptions::default())?;
        let sql = format!(
            "SELECT {}({}) FROM {}{}",
            op.sql(),
            col.select_expr,
            self.inner.quoted_name,
            render_where(&clauses)
        );
        let v = self.inner.db.query_scalar(&sql, &params).await?.unwrap_or(SqlValue::Null);
        Ok(sql_to_json(&v, real_type(&col)))
    }

    pub async fn max(&self, column: &str, filter: &JsonValue) -> Result<JsonValue> {
        self.aggregate(Agg::Max, column, filter).await
    }

    pub async fn min(&self, column: &str, filter: &JsonValue) -> Result<JsonValue> {
        self.aggregate(Agg::Min, column, filter).await
    }

    pub async fn sum(&self, column: &str, filter: &JsonValue) -> Result<JsonValue> {
        self.aggregate(Agg::Sum, column, filter).await
    }

    pub async fn avg(&self, column: &str, filter: &JsonValue) -> Result<JsonValue> {
        self.aggregate(Agg::Avg, column, filter).await
    }

    /// Drives cursor-paginated searches, calling `cb` on every row with
    /// bounded concurrency.
    ///
    /// Cursor-driven: concurrent writes during iteration can shift which
    /// rows are seen; there is no snapshot beyond a single query's.
    pub async fn each<F, Fut>(
        &self,
        filter: &JsonValue,
        options: EachOptions,
        cb: F,
    ) -> Result<()>
    where
        F: Fn(JsonValue) -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        let mut search_opts = SearchOptions {
            limit: Some(options.batch_size),
            no_total: true,
            ..SearchOptions::default()
        };
        loop {
            let page = self.search(filter, &search_opts).await?;
            futures::stream::iter(page.items.into_iter().map(Ok::<JsonValue, Error>))
                .try_for_each_concurrent(options.concurrency, &cb)
                .await?;
            match page.cursor {
                Some(next) => search_opts.cursor = Some(next),
                None => return Ok(()),
            }
        }
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Derives every column value and writes the whole row in one
    /// insert-or-replace (or insert-only) statement.
    ///
    /// Returns the resulting object re-assembled from what was written, not
    /// re-queried, unless `no_return`.
    pub async fn set(
        &self,
        obj: &JsonValue,
        insert_only: bool,
        no_return: bool,
    ) -> Result<Option<JsonValue>> {
        if !obj.is_object() {
            return Err(Error::Structural(format!(
                "table '{}': set expects a JSON object",
                self.inner.name
            )));
        }
        let mut full = obj.clone();

        // Column value derivation: value/slug functions may be async and may
        // query this table through the handle they receive.
        for col in self.inner.columns.clone() {
            if let Some(f) = &col.def.value {
                if let Some(v) = f(full.clone(), self.clone()).await? {
                    set_path(&mut full, &col.json_path, v);
                }
            } else if let Some(src) = &col.def.slug_value {
                let missing = get_path(&full, &col.json_path).map_or(true, JsonValue::is_null);
                if missing {
                    if let Some(base) = src(&full) {
                        let slug = self.unique_slug(&col.def.name, &base).await?;
                        set_path(&mut full, &col.json_path, json!(slug));
                    }
                }
            }
            if let Some(default) = &col.def.default {
                if get_path(&full, &col.json_path).map_or(true, JsonValue::is_null) {
                    set_path(&mut full, &col.json_path, default.clone());
                }
            }
        }

        // Id assignation for plain document tables: explicit id, else a
        // generated UUID for text ids; integer auto-increment ids stay null
        // and take the engine-assigned rowid below.
        let id_col = self.id_col().clone();
        let id_missing = get_path(&full, &id_col.json_path).map_or(true, JsonValue::is_null);
        if id_missing && !id_col.def.auto_increment {
            set_path(&mut full, &id_col.json_path, json!(uuid::Uuid::new_v4().to_string()));
        }

        for col in &self.inner.columns {
            if col.def.required && get_path(&full, &col.json_path).map_or(true, JsonValue::is_null) {
                return Err(Error::MissingRequired {
                    table: self.inner.name.clone(),
                    column: col.def.name.clone(),
                });
            }
        }

        // Split the object: dedicated columns bind directly, the rest is the
        // JSON blob.
        let mut blob = full.clone();
        let mut col_names = vec![id_col.quoted.clone()];
        let mut params: Vec<SqlValue> = Vec::with_capacity(self.inner.real_idxs.len() + 2);

        let id_value = get_path(&full, &id_col.json_path).cloned().unwrap_or(JsonValue::Null);
        params.push(json_to_sql(&id_col.stringify_value(id_value)?));
        remove_path(&mut blob, &id_col.json_path);

        for &i in &self.inner.real_idxs {
            let col = &self.inner.columns[i];
            let v = get_path(&full, &col.json_path).cloned().unwrap_or(JsonValue::Null);
            params.push(json_to_sql(&col.stringify_value(v)?));
            col_names.push(col.quoted.clone());
            remove_path(&mut blob, &col.json_path);
        }

        col_names.push(quote_ident(JSON_COLUMN));
        let is_empty_blob = blob.as_object().is_some_and(JsonMap::is_empty);
        params.push(if is_empty_blob {
            SqlValue::Null
        } else {
            SqlValue::Text(serde_json::to_string(&blob)?)
        });

        let verb = if insert_only { "INSERT" } else { "INSERT OR REPLACE" };
        let marks = vec!["?"; params.len()].join(", ");
        let sql = format!(
            "{verb} INTO {} ({}) VALUES ({marks})",
            self.inner.quoted_name,
            col_names.join(", ")
        );
        let rowid = self.inner.db.exec_returning_rowid(&sql, &params).await?;

        if id_col.def.auto_increment
            && get_path(&full, &id_col.json_path).map_or(true, JsonValue::is_null)
        {
            set_path(&mut full, &id_col.json_path, json!(rowid));
        }

        if no_return {
            Ok(None)
        } else {
            Ok(Some(self.apply_parse(full)?))
        }
    }

    /// Merges a partial object onto the stored one, then behaves as `set`.
    ///
    /// Fields explicitly set to null are removed from the stored object;
    /// omitted fields are untouched. Outside a transaction, wraps itself in
    /// one so the read-merge-write is atomic.
    pub async fn update(
        &self,
        partial: &JsonValue,
        upsert: bool,
        no_return: bool,
    ) -> Result<Option<JsonValue>> {
        if self.inner.db.is_autocommit()? {
            let tx = self.inner.db.begin_immediate().await?;
            let out = self.update_no_trans(partial, upsert, no_return).await;
            match out {
                Ok(v) => {
                    tx.commit().await?;
                    Ok(v)
                }
                Err(e) => {
                    tx.rollback().await?;
                    Err(e)
                }
            }
        } else {
            self.update_no_trans(partial, upsert, no_return).await
        }
    }

    /// `update` without the transaction wrapper.
    pub async fn update_no_trans(
        &self,
        partial: &JsonValue,
        upsert: bool,
        no_return: bool,
    ) -> Result<Option<JsonValue>> {
        let id_col = self.id_col();
        let id = get_path(partial, &id_col.json_path).cloned();
        let prev = match &id {
            Some(idv) if !idv.is_null() => self.get(idv).await?,
            _ => None,
        };
        let merged = match prev {
            Some(prev) => merge_shallow(&prev, partial),
            None if upsert => strip_nulls(partial),
            None => {
                return Err(Error::NotFound {
                    table: self.inner.name.clone(),
                    id: id.map(|v| json_key(&v)).unwrap_or_else(|| "<none>".to_string()),
                })
            }
        };
        self.set(&merged, false, no_return).await
    }

    /// Deletes by id (or by the object's id field). Missing rows are a
    /// successful no-op.
    pub async fn remove(&self, id_or_obj: &JsonValue) -> Result<()> {
        let id_col = self.id_col();
        let id = if id_or_obj.is_object() {
            get_path(id_or_obj, &id_col.json_path).cloned().unwrap_or(JsonValue::Null)
        } else {
            id_or_obj.clone()
        };
        let sql = format!("DELETE FROM {} WHERE {} = ?", self.inner.quoted_name, id_col.select_expr);
        self.inner.db.exec(&sql, &[json_to_sql(&id)]).await?;
        Ok(())
    }

    /// Rewrites a row's id. Fails when `old_id` is absent; a colliding
    /// `new_id` propagates the unique-constraint violation.
    pub async fn change_id(&self, old_id: &JsonValue, new_id: &JsonValue) -> Result<()> {
        let id_col = self.id_col();
        let sql = format!(
            "UPDATE {} SET {} = ? WHERE {} = ?",
            self.inner.quoted_name, id_col.quoted, id_col.quoted
        );
        let changed = self
            .inner
            .db
            .exec(&sql, &[json_to_sql(new_id), json_to_sql(old_id)])
            .await?;
        if changed == 0 {
            return Err(Error::NotFound {
                table: self.inner.name.clone(),
                id: json_key(old_id),
            });
        }
        Ok(())
    }

    /// Derives an id from the id column's value or slug function, if any.
    pub async fn derive_id(&self, obj: &JsonValue) -> Result<Option<JsonValue>> {
        let id_col = self.id_col().clone();
        if let Some(f) = &id_col.def.value {
            return f(obj.clone(), self.clone()).await;
        }
        if let Some(src) = &id_col.def.slug_value {
            if let Some(base) = src(obj) {
                return Ok(Some(json!(self.unique_slug("id", &base).await?)));
            }
        }
        Ok(None)
    }

    /// Derives a slug from `source` that is unique in `column`, probing
    /// `-2`, `-3`, … suffixes.
    pub async fn unique_slug(&self, column: &str, source: &str) -> Result<String> {
        let base = slugify(source);
        let mut candidate = base.clone();
        let mut n = 1u32;
        loop {
            if !self.exists(&json!({ column: candidate.clone() })).await? {
                return Ok(candidate);
            }
            n += 1;
            candidate = format!("{base}-{n}");
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn real_type(col: &ResolvedColumn) -> SqlType {
    match col.def.kind {
        ColumnKind::Real { sql_type } => sql_type,
        ColumnKind::JsonPath => SqlType::Json,
    }
}

fn render_where(clauses: &[String]) -> String {
    if clauses.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", clauses.join(" AND "))
    }
}

/// Stable map key for an id value.
pub fn json_key(v: &JsonValue) -> String {
    match v {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Shallow merge with explicit-null deletion.
fn merge_shallow(prev: &JsonValue, partial: &JsonValue) -> JsonValue {
    let mut out = prev.clone();
    let (Some(out_map), Some(partial_map)) = (out.as_object_mut(), partial.as_object()) else {
        return strip_nulls(partial);
    };
    for (k, v) in partial_map {
        if v.is_null() {
            out_map.remove(k);
        } else {
            out_map.insert(k.clone(), v.clone());
        }
    }
    out
}

fn strip_nulls(obj: &JsonValue) -> JsonValue {
    match obj.as_object() {
        Some(map) => JsonValue::Object(
            map.iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        ),
        None => obj.clone(),
    }
}

/// Lowercase, alphanumeric-and-dash form of a slug source.
pub fn slugify(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut last_dash = true;
    for ch in s.chars() {
        if ch.is_alphanumeric() {
            out.extend(ch.to_lowercase());
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    let trimmed = out.trim_end_matches('-').to_string();
    if trimmed.is_empty() { "item".to_string() } else { trimmed }
}

// Dot-path accessors over the document ('$.a.b' form from ResolvedColumn).

fn path_segments(json_path: &str) -> impl Iterator<Item = &str> {
    json_path.trim_start_matches("$.").split('.')
}

pub(crate) fn get_path<'a>(obj: &'a JsonValue, json_path: &str) -> Option<&'a JsonValue> {
    let mut cur = obj;
    for seg in path_segments(json_path) {
        cur = cur.get(seg)?;
    }
    Some(cur)
}

pub(crate) fn set_path(obj: &mut JsonValue, json_path: &str, value: JsonValue) {
    let segs: Vec<&str> = path_segments(json_path).collect();
    let mut cur = obj;
    for (i, seg) in segs.iter().enumerate() {
        if i + 1 == segs.len() {
            if let Some(map) = cur.as_object_mut() {
                map.insert(seg.to_string(), value);
            }
            return;
        }
        if !cur.get(*seg).is_some_and(JsonValue::is_object) {
            if let Some(map) = cur.as_object_mut() {
                map.insert(seg.to_string(), json!({}));
            }
        }
        cur = cur.get_mut(*seg).expect("intermediate object just inserted");
    }
}

pub(crate) fn remove_path(obj: &mut JsonValue, json_path: &str) {
    let segs: Vec<&str> = path_segments(json_path).collect();
    let mut cur = obj;
    for (i, seg) in segs.iter().enumerate() {
        if i + 1 == segs.len() {
            if let Some(map) = cur.as_object_mut() {
                map.remove(*seg);
            }
            return;
        }
        match cur.get_mut(*seg) {
            Some(next) => cur = next,
            None => return,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column::IndexMode;

    async fn test_table() -> DocumentTable {
        let db = Db::open_in_memory().unwrap();
        DocumentTable::create(
            db,
            "things",
            vec![
                ColumnDef::real("id", SqlType::Text),
                ColumnDef::real("rank", SqlType::Integer).indexed(IndexMode::All),
                ColumnDef::real("tag", SqlType::Text).in_array().indexed(IndexMode::Sparse),
                ColumnDef::json("note").path("meta.note"),
            ],
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_set_get_roundtrip() {
        let t = test_table().await;
        let stored = t
            .set(&json!({"id": "a", "rank": 3, "title": "hello", "meta": {"note": "n"}}), false, false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored["id"], "a");

        let got = t.get(&json!("a")).await.unwrap().unwrap();
        assert_eq!(got["rank"], 3);
        assert_eq!(got["title"], "hello");
        assert_eq!(got["meta"]["note"], "n");
    }

    #[tokio::test]
    async fn test_get_by_indexed_column() {
        let t = test_table().await;
        t.set(&json!({"id": "a", "rank": 9}), false, true).await.unwrap();
        let got = t.get_by("rank", &json!(9)).await.unwrap().unwrap();
        assert_eq!(got["id"], "a");
        assert!(t.get_by("rank", &json!(10)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_get_all_preserves_order_with_misses() {
        let t = test_table().await;
        t.set(&json!({"id": "a"}), false, true).await.unwrap();
        t.set(&json!({"id": "c"}), false, true).await.unwrap();
        let got = t
            .get_all(&[json!("c"), json!("b"), json!("a")])
            .await
            .unwrap();
        assert_eq!(got.len(), 3);
        assert_eq!(got[0].as_ref().unwrap()["id"], "c");
        assert!(got[1].is_none());
        assert_eq!(got[2].as_ref().unwrap()["id"], "a");
    }

    #[tokio::test]
    async fn test_uuid_assigned_when_id_missing() {
        let t = test_table().await;
        let stored = t.set(&json!({"rank": 1}), false, false).await.unwrap().unwrap();
        let id = stored["id"].as_str().unwrap();
        assert_eq!(id.len(), 36);
        assert!(t.get(&stored["id"]).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_auto_increment_id() {
        let db = Db::open_in_memory().unwrap();
        let t = DocumentTable::create(
            db,
            "seq",
            vec![ColumnDef::real("id", SqlType::Integer).auto_increment()],
        )
        .await
        .unwrap();
        let a = t.set(&json!({"x": 1}), false, false).await.unwrap().unwrap();
        let b = t.set(&json!({"x": 2}), false, false).await.unwrap().unwrap();
        assert_eq!(a["id"], 1);
        assert_eq!(b["id"], 2);
    }

    #[tokio::test]
    async fn test_insert_only_collision() {
        let t = test_table().await;
        t.set(&json!({"id": "a"}), true, true).await.unwrap();
        let err = t.set(&json!({"id": "a"}), true, true).await.unwrap_err();
        assert!(matches!(err, Error::Sqlite(_)));
    }

    #[tokio::test]
    async fn test_required_column() {
        let db = Db::open_in_memory().unwrap();
        let t = DocumentTable::create(
            db,
            "strict",
            vec![ColumnDef::real("name", SqlType::Text).required()],
        )
        .await
        .unwrap();
        let err = t.set(&json!({"id": "a"}), false, true).await.unwrap_err();
        assert!(matches!(err, Error::MissingRequired { .. }));
    }

    #[tokio::test]
    async fn test_update_null_deletes_field() {
        let t = test_table().await;
        t.set(&json!({"id": "a", "title": "x", "rank": 1}), false, true).await.unwrap();

        let updated = t
            .update(&json!({"id": "a", "title": null, "rank": 2}), false, false)
            .await
            .unwrap()
            .unwrap();
        assert!(updated.get("title").is_none());
        assert_eq!(updated["rank"], 2);

        // Omitted fields stay.
        let again = t.update(&json!({"id": "a", "extra": true}), false, false).await.unwrap().unwrap();
        assert_eq!(again["rank"], 2);
        assert_eq!(again["extra"], true);
    }

    #[tokio::test]
    async fn test_update_missing_requires_upsert() {
        let t = test_table().await;
        let err = t.update(&json!({"id": "ghost"}), false, true).await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
        t.update(&json!({"id": "ghost", "rank": 1}), true, true).await.unwrap();
        assert!(t.exists(&json!({"id": "ghost"})).await.unwrap());
    }

    #[tokio::test]
    async fn test_remove_missing_is_noop() {
        let t = test_table().await;
        t.set(&json!({"id": "a"}), false, true).await.unwrap();
        t.remove(&json!("ghost")).await.unwrap();
        assert_eq!(t.count(&json!({})).await.unwrap(), 1);
        t.remove(&json!("a")).await.unwrap();
        assert_eq!(t.count(&json!({})).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_change_id() {
        let t = test_table().await;
        t.set(&json!({"id": "a", "rank": 1}), false, true).await.unwrap();
        t.change_id(&json!("a"), &json!("b")).await.unwrap();
        assert!(t.get(&json!("a")).await.unwrap().is_none());
        assert_eq!(t.get(&json!("b")).await.unwrap().unwrap()["rank"], 1);

        let err = t.change_id(&json!("ghost"), &json!("c")).await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_search_filters_and_sort() {
        let t = test_table().await;
        for (id, rank, tag) in [("a", 3, "x"), ("b", 1, "y"), ("c", 2, "x")] {
            t.set(&json!({"id": id, "rank": rank, "tag": tag}), false, true).await.unwrap();
        }

        let res = t
            .search(
                &json!({"tag": ["x", "y"]}),
                &SearchOptions {
                    sort: vec![("rank".to_string(), SortDir::Asc)],
                    ..SearchOptions::default()
                },
            )
            .await
            .unwrap();
        let ids: Vec<&str> = res.items.iter().map(|o| o["id"].as_str().unwrap()).collect();
        assert_eq!(ids, ["b", "c", "a"]);
        assert_eq!(res.total, Some(3));

        let res = t.search(&json!({"tag": "x"}), &SearchOptions::default()).await.unwrap();
        assert_eq!(res.items.len(), 2);

        let err = t.search(&json!({"bogus": 1}), &SearchOptions::default()).await.unwrap_err();
        assert!(matches!(err, Error::UnknownColumn { .. }));
    }

    #[tokio::test]
    async fn test_search_json_path_filter() {
        let t = test_table().await;
        t.set(&json!({"id": "a", "meta": {"note": "keep"}}), false, true).await.unwrap();
        t.set(&json!({"id": "b", "meta": {"note": "drop"}}), false, true).await.unwrap();
        let res = t.search(&json!({"note": "keep"}), &SearchOptions::default()).await.unwrap();
        assert_eq!(res.items.len(), 1);
        assert_eq!(res.items[0]["id"], "a");
    }

    #[tokio::test]
    async fn test_cursor_roundtrip_matches_unbounded() {
        let t = test_table().await;
        for i in 0..23 {
            t.set(&json!({"id": format!("r{i:02}"), "rank": i % 5}), false, true)
                .await
                .unwrap();
        }

        for dir in [SortDir::Asc, SortDir::Desc] {
            let all = t
                .search(
                    &json!({}),
                    &SearchOptions {
                        sort: vec![("rank".to_string(), dir)],
                        no_cursor: true,
                        ..SearchOptions::default()
                    },
                )
                .await
                .unwrap();

            let mut paged = Vec::new();
            let mut opts = SearchOptions {
                sort: vec![("rank".to_string(), dir)],
                limit: Some(4),
                ..SearchOptions::default()
            };
            loop {
                let page = t.search(&json!({}), &opts).await.unwrap();
                paged.extend(page.items);
                match page.cursor {
                    Some(c) => opts.cursor = Some(c),
                    None => break,
                }
            }

            // Same multiset, same rank order, no duplicates or omissions.
            assert_eq!(paged.len(), all.items.len());
            let ranks =
                |v: &[JsonValue]| v.iter().map(|o| o["rank"].as_i64().unwrap()).collect::<Vec<_>>();
            assert_eq!(ranks(&paged), ranks(&all.items));
            let mut ids: Vec<String> =
                paged.iter().map(|o| o["id"].as_str().unwrap().to_string()).collect();
            ids.sort();
            ids.dedup();
            assert_eq!(ids.len(), 23);
        }
    }

    #[tokio::test]
    async fn test_prev_cursor_pages_backward() {
        let t = test_table().await;
        for i in 0..9 {
            t.set(&json!({"id": format!("r{i}"), "rank": i}), false, true).await.unwrap();
        }
        let opts = SearchOptions { limit: Some(3), ..SearchOptions::default() };
        let first = t.search(&json!({}), &opts).await.unwrap();
        let second = t
            .search(&json!({}), &SearchOptions { cursor: first.cursor.clone(), ..opts.clone() })
            .await
            .unwrap();
        let back = t
            .search(&json!({}), &SearchOptions { cursor: second.prev_cursor.clone(), ..opts })
            .await
            .unwrap();
        let ids = |r: &SearchResult| {
            r.items.iter().map(|o| o["id"].as_str().unwrap().to_string()).collect::<Vec<_>>()
        };
        assert_eq!(ids(&back), ids(&first));
    }

    #[tokio::test]
    async fn test_aggregates() {
        let t = test_table().await;
        for (id, rank) in [("a", 1), ("b", 2), ("c", 3)] {
            t.set(&json!({"id": id, "rank": rank}), false, true).await.unwrap();
        }
        assert_eq!(t.max("rank", &json!({})).await.unwrap(), json!(3));
        assert_eq!(t.min("rank", &json!({})).await.unwrap(), json!(1));
        assert_eq!(t.sum("rank", &json!({})).await.unwrap(), json!(6));
        assert_eq!(t.avg("rank", &json!({})).await.unwrap(), json!(2.0));
        assert_eq!(t.count(&json!({"rank": 2})).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_each_visits_every_row() {
        let t = test_table().await;
        for i in 0..12 {
            t.set(&json!({"id": format!("r{i:02}")}), false, true).await.unwrap();
        }
        let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen2 = std::sync::Arc::clone(&seen);
        t.each(
            &json!({}),
            EachOptions { batch_size: 5, concurrency: 3 },
            move |obj| {
                let seen = std::sync::Arc::clone(&seen2);
                async move {
                    seen.lock().unwrap().push(obj["id"].as_str().unwrap().to_string());
                    Ok(())
                }
            },
        )
        .await
        .unwrap();
        let mut got = seen.lock().unwrap().clone();
        got.sort();
        assert_eq!(got.len(), 12);
        got.dedup();
        assert_eq!(got.len(), 12);
    }

    #[tokio::test]
    async fn test_unique_slug_probes_suffixes() {
        let t = test_table().await;
        t.set(&json!({"id": "a", "tag": "hello-world"}), false, true).await.unwrap();
        let slug = t.unique_slug("tag", "Hello, World!").await.unwrap();
        assert_eq!(slug, "hello-world-2");
    }
}
