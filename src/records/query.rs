//! Translate filters into row-id selections over the event tables.

use crate::filters::Filter;
use rusqlite::types::Value as SqlValue;

/// A `SELECT row_id ...` statement and its positional parameters.
#[derive(Clone, Debug, Default)]
pub struct RowIdQuery {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

/// Row ids of events matching `filter`, newest first, honouring `limit`.
pub fn row_ids_for(filter: &Filter) -> RowIdQuery {
    let mut conditions: Vec<String> = Vec::new();
    let mut params: Vec<SqlValue> = Vec::new();

    if let Some(ids) = &filter.ids {
        conditions.push(in_clause("e.id", ids.len()));
        params.extend(ids.iter().cloned().map(SqlValue::Text));
    }
    if let Some(authors) = &filter.authors {
        conditions.push(in_clause("e.pubkey", authors.len()));
        params.extend(authors.iter().cloned().map(SqlValue::Text));
    }
    if let Some(kinds) = &filter.kinds {
        conditions.push(in_clause("e.kind", kinds.len()));
        params.extend(kinds.iter().map(|k| SqlValue::Integer(i64::from(*k))));
    }
    if let Some(since) = filter.since {
        conditions.push("e.created_at >= ?".to_string());
        params.push(SqlValue::Integer(since.0 as i64));
    }
    if let Some(until) = filter.until {
        conditions.push("e.created_at <= ?".to_string());
        params.push(SqlValue::Integer(until.0 as i64));
    }
    if let Some(tags) = &filter.tags {
        for (name, values) in tags {
            conditions.push(format!(
                "EXISTS (SELECT 1 FROM tags t WHERE t.event_row_id = e.row_id AND t.slot0 = ? AND {})",
                in_clause("t.slot1", values.len())
            ));
            params.push(SqlValue::Text(name.to_string()));
            params.extend(values.iter().cloned().map(SqlValue::Text));
        }
    }
    if let Some(search) = filter.search.as_deref().filter(|s| !s.trim().is_empty()) {
        conditions.push("e.content LIKE ? ESCAPE '\\'".to_string());
        params.push(SqlValue::Text(format!("%{}%", escape_like(search.trim()))));
    }

    let mut sql = String::from("SELECT e.row_id FROM events e");
    if !conditions.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&conditions.join(" AND "));
    }
    sql.push_str(" ORDER BY e.created_at DESC, e.id");
    if let Some(limit) = filter.limit {
        sql.push_str(" LIMIT ?");
        params.push(SqlValue::Integer(i64::from(limit)));
    }

    RowIdQuery { sql, params }
}

/// Union of several filters (OR semantics). Each member keeps its own limit.
pub fn row_ids_for_any(filters: &[Filter]) -> RowIdQuery {
    let mut parts = Vec::with_capacity(filters.len());
    let mut params = Vec::new();
    for filter in filters {
        let q = row_ids_for(filter);
        parts.push(format!("SELECT row_id FROM ({})", q.sql));
        params.extend(q.params);
    }
    if parts.is_empty() {
        // No filter at all selects nothing.
        return RowIdQuery {
            sql: "SELECT row_id FROM events WHERE 0".to_string(),
            params,
        };
    }
    RowIdQuery {
        sql: parts.join(" UNION "),
        params,
    }
}

fn in_clause(column: &str, count: usize) -> String {
    if count == 0 {
        return "0".to_string();
    }
    let placeholders = vec!["?"; count].join(", ");
    format!("{column} IN ({placeholders})")
}

fn escape_like(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
