//! kintone query-string builders.
//!
//! Pure functions — no HTTP or async dependencies — for testability.

/// Records fetched per page; the API's maximum.
pub const RECORD_PAGE_LIMIT: usize = 500;
/// Records per batched add/update call; the API's maximum.
pub const UPSERT_CHUNK: usize = 100;
/// Business keys per `in (…)` resolution query.
pub const KEY_CHUNK: usize = 50;

/// True when a key can be embedded in a query unquoted (NUMBER and
/// RECORD_NUMBER comparisons reject quoted numerics on some field setups).
pub fn is_numeric_key(key: &str) -> bool {
    !key.is_empty() && key.bytes().all(|b| b.is_ascii_digit())
}

/// Quote one business key for an `in (…)` clause. Numeric-looking keys go
/// unquoted; everything else is double-quoted with `\` and `"` escaped.
pub fn quote_key(key: &str) -> String {
    if is_numeric_key(key) {
        key.to_string()
    } else {
        format!("\"{}\"", key.replace('\\', "\\\\").replace('"', "\\\""))
    }
}

/// `code in (k1, k2, …)` over one chunk of keys.
pub fn in_clause<S: AsRef<str>>(code: &str, keys: &[S]) -> String {
    let quoted: Vec<String> = keys.iter().map(|k| quote_key(k.as_ref())).collect();
    format!("{} in ({})", code, quoted.join(", "))
}

/// Server-side differential filter: strictly after the baseline, baseline
/// itself excluded.
pub fn changed_since(updated_code: &str, since: &str) -> String {
    format!("{updated_code} > \"{since}\"")
}

/// One page of a seek-paginated fetch: optional caller condition, optional
/// `$id` cursor from the previous page, deterministic `$id asc` order.
pub fn page_query(condition: Option<&str>, last_id: Option<&str>, limit: usize) -> String {
    let mut clauses: Vec<String> = Vec::new();
    if let Some(cond) = condition {
        if !cond.is_empty() {
            clauses.push(format!("({cond})"));
        }
    }
    if let Some(last) = last_id {
        clauses.push(format!("$id > {last}"));
    }
    let mut q = clauses.join(" and ");
    if !q.is_empty() {
        q.push(' ');
    }
    q.push_str(&format!("order by $id asc limit {limit}"));
    q
}
