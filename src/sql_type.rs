//! Defines an enum of the SQL column types we support and routines for conversion to and from string.
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
/// These are the SQL column types that a `CREATE TABLE` may declare.
/// The catalog persists them inside the JSON column list of `cdb_schema`,
/// spelled exactly as they render here.
pub enum SqlType {
    #[serde(rename = "INTEGER")]
    Integer,
    #[serde(rename = "TEXT")]
    Text,
}

impl std::fmt::Display for SqlType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlType::Integer => write!(f, "INTEGER"),
            SqlType::Text => write!(f, "TEXT"),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseSqlTypeError;

impl FromStr for SqlType {
    type Err = ParseSqlTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // "INT" is accepted as an alias on input, but always stored and
        // printed as "INTEGER".
        match s.to_uppercase().as_str() {
            "INTEGER" | "INT" => Ok(SqlType::Integer),
            "TEXT" => Ok(SqlType::Text),
            _ => Err(ParseSqlTypeError),
        }
    }
}

#[test]
fn test_parse_sql_type() {
    let cases = vec![
        ("INTEGER", Ok(SqlType::Integer)),
        ("integer", Ok(SqlType::Integer)),
        ("int", Ok(SqlType::Integer)),
        ("TEXT", Ok(SqlType::Text)),
        ("tExT", Ok(SqlType::Text)),
        ("REAL", Err(ParseSqlTypeError)),
        ("", Err(ParseSqlTypeError)),
    ];
    for case in cases {
        assert_eq!(SqlType::from_str(case.0), case.1);
    }
}

#[test]
fn test_sql_type_display_round_trips() {
    for t in [SqlType::Integer, SqlType::Text] {
        assert_eq!(SqlType::from_str(format!("{}", t).as_str()), Ok(t));
    }
}
