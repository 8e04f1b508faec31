//! The restricted SELECT dialect accepted by query imports.
//!
//! Imported queries run against tables materialized from a source image,
//! so the surface is deliberately tiny: a single-table projection with an
//! optional conjunction of column/literal comparisons. Anything else
//! (multiple statements, other verbs, subqueries, expressions) is
//! rejected before execution.

use std::fmt;

use crate::core::engine::Engine;
use crate::core::schema::{Row, TableSchema};
use crate::core::value::Value;
use crate::errors::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    fn matches(&self, ordering: std::cmp::Ordering) -> bool {
        use std::cmp::Ordering::*;
        matches!(
            (self, ordering),
            (CmpOp::Eq, Equal)
                | (CmpOp::Ne, Less)
                | (CmpOp::Ne, Greater)
                | (CmpOp::Lt, Less)
                | (CmpOp::Le, Less)
                | (CmpOp::Le, Equal)
                | (CmpOp::Gt, Greater)
                | (CmpOp::Ge, Greater)
                | (CmpOp::Ge, Equal)
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    pub column: String,
    pub op: CmpOp,
    pub value: Value,
}

/// A validated import query.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectQuery {
    /// `None` means `*`.
    pub columns: Option<Vec<String>>,
    pub table: String,
    pub predicates: Vec<Predicate>,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(String),
    Str(String),
    Symbol(String),
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Ident(s) | Token::Number(s) | Token::Symbol(s) => write!(f, "{s}"),
            Token::Str(s) => write!(f, "'{s}'"),
        }
    }
}

fn invalid(message: impl Into<String>) -> StoreError {
    StoreError::InvalidArgument(message.into())
}

fn tokenize(sql: &str) -> Result<Vec<Token>, StoreError> {
    let mut tokens = Vec::new();
    let mut chars = sql.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        ident.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(ident));
            }
            c if c.is_ascii_digit() || c == '-' => {
                let mut number = String::new();
                number.push(c);
                chars.next();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_digit() || c == '.' {
                        number.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Number(number));
            }
            '\'' => {
                chars.next();
                let mut text = String::new();
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == '\'' {
                        closed = true;
                        break;
                    }
                    text.push(c);
                }
                if !closed {
                    return Err(invalid("unterminated string literal"));
                }
                tokens.push(Token::Str(text));
            }
            ',' | '*' | '=' => {
                tokens.push(Token::Symbol(c.to_string()));
                chars.next();
            }
            '<' | '>' | '!' => {
                chars.next();
                let mut symbol = c.to_string();
                if let Some(&next) = chars.peek() {
                    if next == '=' || (c == '<' && next == '>') {
                        symbol.push(next);
                        chars.next();
                    }
                }
                tokens.push(Token::Symbol(symbol));
            }
            other => {
                return Err(invalid(format!("unsafe character {other:?} in import query")));
            }
        }
    }
    Ok(tokens)
}

/// Validate an import query string, returning its parsed form.
pub fn validate_import_sql(sql: &str) -> Result<SelectQuery, StoreError> {
    let tokens = tokenize(sql)?;
    let mut pos = 0;

    let keyword = |tokens: &[Token], pos: usize, word: &str| -> bool {
        matches!(tokens.get(pos), Some(Token::Ident(s)) if s.eq_ignore_ascii_case(word))
    };

    if !keyword(&tokens, pos, "select") {
        return Err(invalid("only SELECT statements can be imported"));
    }
    pos += 1;

    // Projection: `*` or a comma-separated column list.
    let columns = if matches!(tokens.get(pos), Some(Token::Symbol(s)) if s == "*") {
        pos += 1;
        None
    } else {
        let mut names = Vec::new();
        loop {
            match tokens.get(pos) {
                Some(Token::Ident(name)) if !name.eq_ignore_ascii_case("from") => {
                    names.push(name.clone());
                    pos += 1;
                }
                _ => return Err(invalid("expected a column name")),
            }
            if matches!(tokens.get(pos), Some(Token::Symbol(s)) if s == ",") {
                pos += 1;
            } else {
                break;
            }
        }
        Some(names)
    };

    if !keyword(&tokens, pos, "from") {
        return Err(invalid("expected FROM"));
    }
    pos += 1;
    let table = match tokens.get(pos) {
        Some(Token::Ident(name)) => name.clone(),
        _ => return Err(invalid("expected a table name")),
    };
    pos += 1;

    let mut predicates = Vec::new();
    if keyword(&tokens, pos, "where") {
        pos += 1;
        loop {
            let column = match tokens.get(pos) {
                Some(Token::Ident(name)) => name.clone(),
                _ => return Err(invalid("expected a column name in WHERE")),
            };
            pos += 1;
            let op = match tokens.get(pos) {
                Some(Token::Symbol(s)) => match s.as_str() {
                    "=" => CmpOp::Eq,
                    "!=" | "<>" => CmpOp::Ne,
                    "<" => CmpOp::Lt,
                    "<=" => CmpOp::Le,
                    ">" => CmpOp::Gt,
                    ">=" => CmpOp::Ge,
                    other => return Err(invalid(format!("unsupported operator {other}"))),
                },
                _ => return Err(invalid("expected a comparison operator")),
            };
            pos += 1;
            let value = match tokens.get(pos) {
                Some(Token::Number(n)) => {
                    if n.contains('.') {
                        Value::Real(n.parse().map_err(|_| invalid("bad number literal"))?)
                    } else {
                        Value::Integer(n.parse().map_err(|_| invalid("bad number literal"))?)
                    }
                }
                Some(Token::Str(s)) => Value::Text(s.clone()),
                Some(Token::Ident(word)) if word.eq_ignore_ascii_case("true") => {
                    Value::Boolean(true)
                }
                Some(Token::Ident(word)) if word.eq_ignore_ascii_case("false") => {
                    Value::Boolean(false)
                }
                Some(Token::Ident(word)) if word.eq_ignore_ascii_case("null") => Value::Null,
                _ => return Err(invalid("expected a literal value")),
            };
            pos += 1;
            predicates.push(Predicate { column, op, value });

            if keyword(&tokens, pos, "and") {
                pos += 1;
            } else {
                break;
            }
        }
    }

    if pos != tokens.len() {
        return Err(invalid(format!(
            "unexpected token {} in import query",
            tokens[pos]
        )));
    }
    Ok(SelectQuery {
        columns,
        table,
        predicates,
    })
}

/// Execute a validated query against a table in `schema`, returning the
/// result schema and rows.
pub fn run_query(
    engine: &Engine,
    schema: &str,
    query: &SelectQuery,
) -> Result<(TableSchema, Vec<Row>), StoreError> {
    let (table_schema, rows) = engine.read_table(schema, &query.table)?;

    let mut tests = Vec::with_capacity(query.predicates.len());
    for predicate in &query.predicates {
        let position = table_schema.position(&predicate.column).ok_or_else(|| {
            invalid(format!("unknown column {} in WHERE", predicate.column))
        })?;
        tests.push((position, predicate.op, predicate.value.clone()));
    }
    let filtered: Vec<Row> = rows
        .into_iter()
        .filter(|row| {
            tests
                .iter()
                .all(|(position, op, value)| op.matches(row[*position].cmp(value)))
        })
        .collect();

    match &query.columns {
        None => Ok((table_schema, filtered)),
        Some(names) => {
            let projected = table_schema.project(names)?;
            let positions: Vec<usize> = names
                .iter()
                .filter_map(|name| table_schema.position(name))
                .collect();
            let rows = filtered
                .into_iter()
                .map(|row| positions.iter().map(|&i| row[i].clone()).collect())
                .collect();
            Ok((projected, rows))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::schema::Column;
    use crate::core::value::ColumnType;

    #[test]
    fn test_parse_star() {
        let query = validate_import_sql("SELECT * FROM t").unwrap();
        assert_eq!(query.columns, None);
        assert_eq!(query.table, "t");
        assert!(query.predicates.is_empty());
    }

    #[test]
    fn test_parse_projection_and_predicates() {
        let query =
            validate_import_sql("select k, v from t where k >= 2 and v != 'x'").unwrap();
        assert_eq!(
            query.columns,
            Some(vec!["k".to_string(), "v".to_string()])
        );
        assert_eq!(query.predicates.len(), 2);
        assert_eq!(query.predicates[0].op, CmpOp::Ge);
        assert_eq!(query.predicates[1].value, Value::Text("x".into()));
    }

    #[test]
    fn test_rejects_unsafe_sql() {
        for sql in [
            "DROP TABLE t",
            "SELECT * FROM t; DROP TABLE t",
            "SELECT * FROM t WHERE k = (SELECT 1)",
            "INSERT INTO t VALUES (1)",
            "SELECT * FROM t WHERE k = 1 OR 1 = 1",
        ] {
            assert!(
                matches!(
                    validate_import_sql(sql),
                    Err(StoreError::InvalidArgument(_))
                ),
                "{sql} should be rejected"
            );
        }
    }

    #[test]
    fn test_run_query_filters_and_projects() {
        let engine = Engine::new("test");
        let schema = TableSchema::new(vec![
            Column::new("k", ColumnType::Integer, true),
            Column::new("v", ColumnType::Text, false),
        ]);
        engine.create_table("s", "t", schema).unwrap();
        for (k, v) in [(1, "a"), (2, "b"), (3, "c")] {
            engine
                .bulk_insert(
                    "s",
                    "t",
                    vec![vec![Value::Integer(k), Value::Text(v.into())]],
                )
                .unwrap();
        }

        let query = validate_import_sql("SELECT v FROM t WHERE k > 1").unwrap();
        let (result_schema, rows) = run_query(&engine, "s", &query).unwrap();
        assert_eq!(result_schema.columns.len(), 1);
        assert_eq!(
            rows,
            vec![
                vec![Value::Text("b".into())],
                vec![Value::Text("c".into())]
            ]
        );
    }
}
