//! Query expressions over index rows.
//!
//! The grammar is a small field-matching language:
//!
//! ```text
//! expr  := and ( "OR" and )*
//! and   := unary ( ["AND"] unary )*          -- juxtaposition means AND
//! unary := "NOT" unary | "(" expr ")" | term
//! term  := field ":" ( bare | "quoted" )
//! ```
//!
//! `name:alice age:30` matches rows whose `name` is alice AND `age` is 30.
//! Field paths may be dotted (`address.city:oslo`). String comparison is
//! case-insensitive; numbers and booleans compare by their canonical text.

use crate::error::{CoreError, CoreResult};
use nom::{
    branch::alt,
    bytes::complete::{is_not, tag, take_while1},
    character::complete::{char, multispace0, multispace1},
    combinator::{all_consuming, map, opt, verify},
    multi::many0,
    sequence::{delimited, preceded, separated_pair},
    IResult,
};
use serde_json::Value;

/// Parsed query expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryExpr {
    /// Matches every row. An empty query string browses the whole index.
    All,
    /// `field:value`
    Term {
        /// Dotted field path.
        field: String,
        /// Value to match.
        value: String,
    },
    /// Both sides must match.
    And(Box<QueryExpr>, Box<QueryExpr>),
    /// Either side must match.
    Or(Box<QueryExpr>, Box<QueryExpr>),
    /// The inner expression must not match.
    Not(Box<QueryExpr>),
}

impl QueryExpr {
    /// Evaluates the expression against one row value.
    #[must_use]
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            Self::All => true,
            Self::Term { field, value: needle } => field_matches(value, field, needle),
            Self::And(a, b) => a.matches(value) && b.matches(value),
            Self::Or(a, b) => a.matches(value) || b.matches(value),
            Self::Not(inner) => !inner.matches(value),
        }
    }
}

fn field_matches(row: &Value, field: &str, needle: &str) -> bool {
    let mut current = row;
    for part in field.split('.') {
        match current.get(part) {
            Some(next) => current = next,
            None => return false,
        }
    }
    leaf_matches(current, needle)
}

fn leaf_matches(leaf: &Value, needle: &str) -> bool {
    match leaf {
        Value::String(s) => s.eq_ignore_ascii_case(needle),
        Value::Number(n) => n.to_string() == needle,
        Value::Bool(b) => b.to_string() == needle,
        Value::Null => needle == "null",
        Value::Array(items) => items.iter().any(|item| leaf_matches(item, needle)),
        Value::Object(_) => false,
    }
}

/// Parses a query string.
///
/// # Errors
///
/// Returns [`CoreError::InvalidQuery`] when the input does not match the
/// grammar or leaves trailing text.
pub fn parse_query(input: &str) -> CoreResult<QueryExpr> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(CoreError::invalid_query("empty query"));
    }
    match all_consuming(delimited(multispace0, or_expr, multispace0))(trimmed) {
        Ok((_, expr)) => Ok(expr),
        Err(err) => Err(CoreError::invalid_query(format!(
            "cannot parse {trimmed:?}: {err}"
        ))),
    }
}

const RESERVED: [&str; 3] = ["AND", "OR", "NOT"];

fn or_expr(input: &str) -> IResult<&str, QueryExpr> {
    let (rest, first) = and_expr(input)?;
    let (rest, others) = many0(preceded(
        delimited(multispace1, tag("OR"), multispace1),
        and_expr,
    ))(rest)?;
    Ok((rest, fold_binary(first, others, QueryExpr::Or)))
}

fn and_expr(input: &str) -> IResult<&str, QueryExpr> {
    let (rest, first) = unary_expr(input)?;
    // Juxtaposed operands AND together; an explicit AND keyword is
    // accepted and means the same thing.
    let (rest, others) = many0(preceded(
        alt((
            delimited(multispace1, tag("AND"), multispace1),
            multispace1,
        )),
        unary_expr,
    ))(rest)?;
    Ok((rest, fold_binary(first, others, QueryExpr::And)))
}

fn fold_binary(
    first: QueryExpr,
    others: Vec<QueryExpr>,
    combine: fn(Box<QueryExpr>, Box<QueryExpr>) -> QueryExpr,
) -> QueryExpr {
    others
        .into_iter()
        .fold(first, |acc, next| combine(Box::new(acc), Box::new(next)))
}

fn unary_expr(input: &str) -> IResult<&str, QueryExpr> {
    alt((
        map(
            preceded(tag("NOT"), preceded(multispace1, unary_expr)),
            |inner| QueryExpr::Not(Box::new(inner)),
        ),
        delimited(
            preceded(char('('), multispace0),
            or_expr,
            preceded(multispace0, char(')')),
        ),
        term,
    ))(input)
}

fn term(input: &str) -> IResult<&str, QueryExpr> {
    map(
        separated_pair(field_name, char(':'), term_value),
        |(field, value)| QueryExpr::Term {
            field: field.to_string(),
            value,
        },
    )(input)
}

fn field_name(input: &str) -> IResult<&str, &str> {
    verify(
        take_while1(|c: char| c.is_alphanumeric() || c == '_' || c == '.'),
        |name: &str| !RESERVED.contains(&name),
    )(input)
}

fn term_value(input: &str) -> IResult<&str, String> {
    alt((
        map(
            delimited(char('"'), opt(is_not("\"")), char('"')),
            |inner: Option<&str>| inner.unwrap_or("").to_string(),
        ),
        map(
            take_while1(|c: char| !c.is_whitespace() && c != '(' && c != ')' && c != '"'),
            str::to_string,
        ),
    ))(input)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn term(field: &str, value: &str) -> QueryExpr {
        QueryExpr::Term {
            field: field.into(),
            value: value.into(),
        }
    }

    #[test]
    fn single_term() {
        assert_eq!(parse_query("name:alice").unwrap(), term("name", "alice"));
    }

    #[test]
    fn quoted_value_keeps_spaces() {
        assert_eq!(
            parse_query("title:\"hello world\"").unwrap(),
            term("title", "hello world")
        );
    }

    #[test]
    fn implicit_and() {
        assert_eq!(
            parse_query("name:alice age:30").unwrap(),
            QueryExpr::And(Box::new(term("name", "alice")), Box::new(term("age", "30")))
        );
    }

    #[test]
    fn explicit_operators_and_parens() {
        let expr = parse_query("name:alice AND (age:30 OR age:31)").unwrap();
        assert_eq!(
            expr,
            QueryExpr::And(
                Box::new(term("name", "alice")),
                Box::new(QueryExpr::Or(
                    Box::new(term("age", "30")),
                    Box::new(term("age", "31"))
                ))
            )
        );
    }

    #[test]
    fn not_binds_tighter_than_and() {
        let expr = parse_query("NOT name:bob age:30").unwrap();
        assert_eq!(
            expr,
            QueryExpr::And(
                Box::new(QueryExpr::Not(Box::new(term("name", "bob")))),
                Box::new(term("age", "30"))
            )
        );
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(parse_query("name alice").is_err());
        assert!(parse_query("").is_err());
        assert!(parse_query("(name:a").is_err());
    }

    #[test]
    fn evaluation_on_values() {
        let row = json!({
            "name": "Alice",
            "age": 30,
            "active": true,
            "tags": ["admin", "staff"],
            "address": {"city": "Oslo"}
        });
        assert!(term("name", "alice").matches(&row));
        assert!(term("age", "30").matches(&row));
        assert!(term("active", "true").matches(&row));
        assert!(term("tags", "admin").matches(&row));
        assert!(term("address.city", "oslo").matches(&row));
        assert!(!term("name", "bob").matches(&row));
        assert!(!term("missing", "x").matches(&row));
    }

    #[test]
    fn boolean_evaluation() {
        let row = json!({"name": "alice", "age": 30});
        assert!(parse_query("name:alice AND age:30").unwrap().matches(&row));
        assert!(parse_query("name:bob OR age:30").unwrap().matches(&row));
        assert!(!parse_query("NOT age:30").unwrap().matches(&row));
    }
}
