//! Placeholder expansion and parameter creation.
//!
//! SQL templates use `@0`-style positional and `@name`-style named
//! placeholders. Binding renumbers every placeholder sequentially in order of
//! appearance, expands collection arguments into comma-separated placeholder
//! lists, and records where each generated placeholder sits in the output so
//! drivers can re-render them in their native syntax. `@@` escapes a literal
//! `@`.

use crate::error::{DbError, DbResult};
use crate::mapping::Mapper;
use crate::models::{Arg, Dialect, Parameter, Placeholder, Value, ValueKind};
use std::fmt::Write as _;
use tracing::trace;

/// Size hint given to string parameters so similar statements share plans.
pub const MIN_STRING_PARAMETER_SIZE: usize = 4000;

/// Size hint for uuids bound as strings.
pub const UUID_PARAMETER_SIZE: usize = 40;

/// Output of [`ParameterBinder::bind`].
#[derive(Debug, Clone, Default)]
pub struct BoundSql {
    pub sql: String,
    /// One entry per generated placeholder, in placeholder order.
    pub args: Vec<Arg>,
    /// Spans of generated placeholders in `sql`. Empty when named parameters
    /// are disabled.
    pub placeholders: Vec<Placeholder>,
}

fn is_word(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// A placeholder token or literal text found by [`scan`].
enum Piece<'a> {
    Text(&'a str),
    /// Run of two or more `@`, collapsed to `len / 2 + len % 2` characters.
    Escaped(usize),
    Token(&'a str),
}

/// Split `sql` into literal text, escaped `@` runs and `@name` tokens.
fn scan(sql: &str) -> Vec<Piece<'_>> {
    let mut pieces = Vec::new();
    let mut chars = sql.char_indices().peekable();
    let mut text_start = 0;

    while let Some((start, c)) = chars.next() {
        if c != '@' {
            continue;
        }
        if text_start < start {
            pieces.push(Piece::Text(&sql[text_start..start]));
        }

        let mut run = 1;
        while chars.next_if(|&(_, c)| c == '@').is_some() {
            run += 1;
        }
        if run > 1 {
            pieces.push(Piece::Escaped(run));
            text_start = start + run;
            continue;
        }

        let name_start = start + 1;
        let mut name_end = name_start;
        while let Some((i, c)) = chars.next_if(|&(_, c)| is_word(c)) {
            name_end = i + c.len_utf8();
        }
        if name_end == name_start {
            pieces.push(Piece::Text("@"));
        } else {
            pieces.push(Piece::Token(&sql[name_start..name_end]));
        }
        text_start = name_end;
    }

    if text_start < sql.len() {
        pieces.push(Piece::Text(&sql[text_start..]));
    }
    pieces
}

fn push_escaped(out: &mut String, run: usize) {
    for _ in 0..(run / 2 + run % 2) {
        out.push('@');
    }
}

/// Rewrites SQL templates for one dialect.
#[derive(Debug, Clone, Copy)]
pub struct ParameterBinder<'a> {
    prefix: &'a str,
    named_params: bool,
}

impl<'a> ParameterBinder<'a> {
    pub fn new(prefix: &'a str, named_params: bool) -> Self {
        Self {
            prefix,
            named_params,
        }
    }

    pub fn bind(&self, sql: &str, args: &[Arg]) -> DbResult<BoundSql> {
        if !self.named_params {
            return Ok(self.passthrough(sql, args));
        }

        let mut bound = BoundSql {
            sql: String::with_capacity(sql.len() + 16),
            args: Vec::with_capacity(args.len()),
            placeholders: Vec::new(),
        };

        for piece in scan(sql) {
            match piece {
                Piece::Text(text) => bound.sql.push_str(text),
                Piece::Escaped(run) => push_escaped(&mut bound.sql, run),
                Piece::Token(token) => match self.resolve(token, sql, args)? {
                    Arg::Value(Value::List(items)) => {
                        for (i, item) in items.into_iter().enumerate() {
                            if i > 0 {
                                bound.sql.push(',');
                            }
                            self.push_placeholder(&mut bound, Arg::Value(item));
                        }
                    }
                    arg => self.push_placeholder(&mut bound, arg),
                },
            }
        }

        trace!(
            sql = %bound.sql,
            placeholders = bound.placeholders.len(),
            "Bound SQL template"
        );
        Ok(bound)
    }

    /// Native SQL: only the prefix swap and `@@` collapse are applied.
    fn passthrough(&self, sql: &str, args: &[Arg]) -> BoundSql {
        let mut out = String::with_capacity(sql.len());
        for piece in scan(sql) {
            match piece {
                Piece::Text(text) => out.push_str(text),
                Piece::Escaped(run) => push_escaped(&mut out, run),
                Piece::Token(token) => {
                    out.push_str(self.prefix);
                    out.push_str(token);
                }
            }
        }
        BoundSql {
            sql: out,
            args: args.to_vec(),
            placeholders: Vec::new(),
        }
    }

    fn resolve(&self, token: &str, sql: &str, args: &[Arg]) -> DbResult<Arg> {
        if token.bytes().all(|b| b.is_ascii_digit()) {
            let arg = token
                .parse::<usize>()
                .ok()
                .and_then(|index| args.get(index))
                .ok_or_else(|| {
                    DbError::binding(
                        format!("@{}", token),
                        sql,
                        format!("only {} parameters supplied", args.len()),
                    )
                })?;
            return match arg {
                Arg::Object(_) => Err(DbError::binding(
                    format!("@{}", token),
                    sql,
                    "argument is an object; reference its members by name instead",
                )),
                other => Ok(other.clone()),
            };
        }

        args.iter()
            .find_map(|arg| match arg {
                Arg::Object(object) => object.lookup(token),
                _ => None,
            })
            .map(Arg::Value)
            .ok_or_else(|| {
                DbError::binding(
                    format!("@{}", token),
                    sql,
                    "none of the passed arguments have a property with this name",
                )
            })
    }

    fn push_placeholder(&self, bound: &mut BoundSql, arg: Arg) {
        let index = bound.args.len();
        let start = bound.sql.len();
        let _ = write!(bound.sql, "{}{}", self.prefix, index);
        bound.placeholders.push(Placeholder {
            start,
            end: bound.sql.len(),
            index,
        });
        bound.args.push(arg);
    }
}

/// Find the generated `{prefix}{n}` placeholders in `sql` whose index is below
/// `parameter_count`.
///
/// Used to recover placeholder spans after the bound SQL has been edited.
/// Tokens glued to a word character or a repeated prefix are literal text.
pub fn locate_placeholders(sql: &str, prefix: &str, parameter_count: usize) -> Vec<Placeholder> {
    let mut placeholders = Vec::new();
    if prefix.is_empty() {
        return placeholders;
    }
    let prefix_char = prefix.chars().next_back();

    for (start, _) in sql.match_indices(prefix) {
        let preceding = sql[..start].chars().next_back();
        if preceding.is_some_and(|c| is_word(c) || Some(c) == prefix_char) {
            continue;
        }
        let digits_start = start + prefix.len();
        let rest = &sql[digits_start..];
        let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
        if digits == 0 || rest[digits..].chars().next().is_some_and(is_word) {
            continue;
        }
        let Ok(index) = rest[..digits].parse::<usize>() else {
            continue;
        };
        if index < parameter_count {
            placeholders.push(Placeholder {
                start,
                end: digits_start + digits,
                index,
            });
        }
    }
    placeholders
}

// =============================================================================
// Parameter Creation
// =============================================================================

/// Turn one bound argument into a driver parameter named `{prefix}{index}`.
pub fn create_parameter(
    arg: Arg,
    prefix: &str,
    index: usize,
    dialect: Dialect,
    mapper: &dyn Mapper,
) -> DbResult<Parameter> {
    let name = format!("{}{}", prefix, index);
    let value = match arg {
        Arg::Parameter(mut parameter) => {
            parameter.name = name;
            return Ok(parameter);
        }
        Arg::Object(_) => {
            return Err(DbError::invalid_input(format!(
                "parameter {} is an object and cannot be bound",
                name
            )));
        }
        Arg::Value(value) => value,
    };

    let value = match mapper.to_db_converter(value.kind()) {
        Some(convert) if !value.is_null() => convert(value)?,
        _ => value,
    };

    let mut parameter = Parameter::input(Value::Null);
    parameter.name = name;
    match value {
        Value::Bool(b) if dialect != Dialect::PostgreSql => {
            parameter.value = Value::I32(i32::from(b));
        }
        Value::Uuid(uuid) => {
            parameter.value = Value::String(uuid.to_string());
            parameter.db_type = Some(ValueKind::String);
            parameter.size = Some(UUID_PARAMETER_SIZE);
        }
        Value::String(s) => {
            parameter.size = Some((s.chars().count() + 1).max(MIN_STRING_PARAMETER_SIZE));
            parameter.value = Value::String(s);
        }
        Value::List(_) => {
            return Err(DbError::invalid_input(format!(
                "parameter {} is a nested collection",
                parameter.name
            )));
        }
        other => parameter.value = other,
    }
    Ok(parameter)
}
