//! Paged query planning.
//!
//! Rewrites a plain `SELECT` into a row-counting query and a dialect-specific
//! page query. The select list and `ORDER BY` clause are located with a
//! parenthesis-aware scan so nested subqueries are left alone.

use crate::error::{DbError, DbResult};
use crate::mapping::SelectSource;
use crate::models::{Arg, Dialect, Value};
use regex::Regex;
use std::sync::LazyLock;

static SELECT_CLAUSE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?is)\A\s*(SELECT|EXECUTE|CALL)\s").ok());

static FROM_CLAUSE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?is)\A\s*FROM\s").ok());

static SELECT_KEYWORD: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?is)\A\s*SELECT\s+").ok());

static DISTINCT: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?is)\ADISTINCT\s").ok());

static ORDER_BY: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)\AORDER\s+BY\s+").ok());

static DIRECTION: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)\A\s+(ASC|DESC)\b").ok());

static LIST_SEPARATOR: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\A\s*,\s*").ok());

fn find<'h>(pattern: &LazyLock<Option<Regex>>, haystack: &'h str) -> Option<regex::Match<'h>> {
    pattern.as_ref().and_then(|re| re.find(haystack))
}

fn is_match(pattern: &LazyLock<Option<Regex>>, haystack: &str) -> bool {
    find(pattern, haystack).is_some()
}

/// Column alias of the window row number in SQL Server and Oracle page queries.
pub const ROW_NUMBER_ALIAS: &str = "rs_rn";

/// Prefix `sql` with a SELECT list built from `source` unless it already
/// starts with `SELECT`, `EXECUTE` or `CALL`.
///
/// A leading `;` disables the rewrite and is removed.
pub fn add_select_clause(sql: &str, source: Option<&SelectSource>, dialect: Dialect) -> String {
    if let Some(rest) = sql.strip_prefix(';') {
        return rest.to_string();
    }
    let Some(source) = source else {
        return sql.to_string();
    };
    if is_match(&SELECT_CLAUSE, sql) {
        return sql.to_string();
    }

    let table = dialect.escape_table_name(&source.table);
    let columns = source
        .columns
        .iter()
        .map(|c| format!("{}.{}", table, dialect.escape_identifier(c)))
        .collect::<Vec<_>>()
        .join(", ");

    if is_match(&FROM_CLAUSE, sql) {
        format!("SELECT {} {}", columns, sql)
    } else {
        format!("SELECT {} FROM {} {}", columns, table, sql)
    }
}

// =============================================================================
// Scanning
// =============================================================================

fn is_word(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn char_before(s: &str, at: usize) -> Option<char> {
    s[..at].chars().next_back()
}

fn char_at(s: &str, at: usize) -> Option<char> {
    s[at..].chars().next()
}

/// Byte index just past the parenthesis group opening at `open`.
fn skip_group(s: &str, open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (i, c) in s[open..].char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(open + i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

/// True when `keyword` starts at `at` as a whole word, ignoring case.
fn keyword_at(s: &str, at: usize, keyword: &str) -> bool {
    let end = at + keyword.len();
    s.get(at..end)
        .is_some_and(|w| w.eq_ignore_ascii_case(keyword))
        && !char_before(s, at).is_some_and(is_word)
        && !char_at(s, end).is_some_and(is_word)
}

/// Positions outside any parenthesis group, starting at `from`.
fn top_level_positions(s: &str, from: usize) -> impl Iterator<Item = usize> + '_ {
    let mut pos = from;
    std::iter::from_fn(move || {
        while pos < s.len() {
            let at = pos;
            let c = char_at(s, at)?;
            if c == '(' {
                pos = skip_group(s, at).unwrap_or(at + 1);
                continue;
            }
            pos = at + c.len_utf8();
            return Some(at);
        }
        None
    })
}

/// `FROM` closing the select list, unless it directly follows `, `.
fn find_from(s: &str, from: usize) -> Option<usize> {
    top_level_positions(s, from).find(|&at| {
        if !keyword_at(s, at, "FROM") {
            return false;
        }
        let before = s[..at].trim_end();
        let had_space = before.len() < at;
        !(had_space && before.ends_with(','))
    })
}

/// One `ORDER BY` item: parenthesis groups and word, dot or quote characters.
fn order_item_end(s: &str, start: usize) -> Option<usize> {
    let mut pos = start;
    while let Some(c) = char_at(s, pos) {
        if c == '(' {
            pos = skip_group(s, pos).unwrap_or(pos + 1);
        } else if is_word(c) || matches!(c, ')' | '.' | '"' | '`' | '[' | ']') {
            pos += c.len_utf8();
        } else {
            break;
        }
    }
    (pos > start).then_some(pos)
}

/// Byte range of the top-level `ORDER BY` clause.
fn find_order_by(s: &str) -> Option<(usize, usize)> {
    for at in top_level_positions(s, 0) {
        if !keyword_at(s, at, "ORDER") {
            continue;
        }
        let Some(head) = find(&ORDER_BY, &s[at..]) else {
            continue;
        };
        let Some(mut end) = order_item_end(s, at + head.end()) else {
            continue;
        };
        loop {
            if let Some(dir) = find(&DIRECTION, &s[end..]) {
                end += dir.end();
            }
            let Some(sep) = find(&LIST_SEPARATOR, &s[end..]) else {
                break;
            };
            match order_item_end(s, end + sep.end()) {
                Some(next) => end = next,
                None => break,
            }
        }
        return Some((at, end));
    }
    None
}

// =============================================================================
// Planning
// =============================================================================

/// A `SELECT` taken apart for paging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PagingParts {
    /// The row-counting query, without ordering.
    pub sql_count: String,
    /// The query from the start of the select list onward.
    pub sql_select_removed: String,
    pub sql_order_by: Option<String>,
}

/// Split `sql` into its count query, select list remainder and `ORDER BY`.
pub fn split_for_paging(sql: &str) -> DbResult<PagingParts> {
    let head = find(&SELECT_KEYWORD, sql)
        .ok_or_else(|| DbError::unparsable_query(sql, "statement does not start with SELECT"))?;
    let list_start = head.end();
    let list_end = find_from(sql, list_start)
        .ok_or_else(|| DbError::unparsable_query(sql, "no FROM clause closes the select list"))?;

    let list = &sql[list_start..list_end];
    let sql_select_removed = sql[list_start..].to_string();
    let counted = if is_match(&DISTINCT, &sql_select_removed) {
        format!("COUNT({}) ", list.trim())
    } else {
        "COUNT(*) ".to_string()
    };
    let sql_count = format!("{}{}{}", &sql[..list_start], counted, &sql[list_end..]);

    Ok(match find_order_by(&sql_count) {
        Some((start, end)) => PagingParts {
            sql_order_by: Some(sql_count[start..end].to_string()),
            sql_count: format!("{}{}", &sql_count[..start], &sql_count[end..])
                .trim_end()
                .to_string(),
            sql_select_removed,
        },
        None => PagingParts {
            sql_count: sql_count.trim_end().to_string(),
            sql_select_removed,
            sql_order_by: None,
        },
    })
}

/// Count and page SQL plus the arguments for both.
#[derive(Debug, Clone)]
pub struct PageQueries {
    pub count_sql: String,
    pub page_sql: String,
    /// Original arguments followed by the two paging arguments. The count
    /// query ignores the trailing pair.
    pub args: Vec<Arg>,
}

fn page_arg(n: u64) -> Arg {
    Arg::Value(Value::I64(i64::try_from(n).unwrap_or(i64::MAX)))
}

/// Build the count and page queries for `sql`, skipping `skip` rows and
/// returning at most `take`.
pub fn build_page_queries(
    dialect: Dialect,
    skip: u64,
    take: u64,
    sql: &str,
    mut args: Vec<Arg>,
) -> DbResult<PageQueries> {
    let parts = split_for_paging(sql)?;
    if dialect == Dialect::Oracle && parts.sql_select_removed.starts_with('*') {
        return Err(DbError::dialect_constraint(
            dialect.display_name(),
            "Query must alias '*' when performing a paged query.\neg. select t.* from table t order by t.id",
        ));
    }

    let n = args.len();
    let page_sql = match dialect {
        Dialect::SqlServer | Dialect::Oracle => {
            let mut select = match find_order_by(&parts.sql_select_removed) {
                Some((start, end)) => format!(
                    "{}{}",
                    &parts.sql_select_removed[..start],
                    &parts.sql_select_removed[end..]
                ),
                None => parts.sql_select_removed.clone(),
            };
            select.truncate(select.trim_end().len());
            if is_match(&DISTINCT, &select) {
                select = format!("rs_inner.* FROM (SELECT {}) rs_inner", select);
            }
            let order_by = match (&parts.sql_order_by, dialect) {
                (Some(order_by), _) => order_by.as_str(),
                (None, Dialect::Oracle) => "ORDER BY NULL",
                (None, _) => "ORDER BY (SELECT NULL)",
            };
            args.push(page_arg(skip));
            args.push(page_arg(skip.saturating_add(take)));
            format!(
                "SELECT * FROM (SELECT ROW_NUMBER() OVER ({order_by}) {rn}, {select}) rs_paged WHERE {rn}>@{} AND {rn}<=@{}",
                n,
                n + 1,
                rn = ROW_NUMBER_ALIAS,
            )
        }
        Dialect::SqlServerCe => {
            args.push(page_arg(skip));
            args.push(page_arg(take));
            format!("{}\nOFFSET @{} ROWS FETCH NEXT @{} ROWS ONLY", sql, n, n + 1)
        }
        Dialect::MySql | Dialect::PostgreSql | Dialect::SQLite => {
            args.push(page_arg(take));
            args.push(page_arg(skip));
            format!("{}\nLIMIT @{} OFFSET @{}", sql, n, n + 1)
        }
    };

    Ok(PageQueries {
        count_sql: parts.sql_count,
        page_sql,
        args,
    })
}

/// Rows to skip for a 1-based page number.
pub fn page_offset(page: u64, items_per_page: u64) -> u64 {
    page.saturating_sub(1).saturating_mul(items_per_page)
}
