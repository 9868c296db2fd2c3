//! `pt_to_ast` has routines for converting pest parse trees to ASTs.
//! A pest parse tree has one enum for all possible terminals and
//! non-terminals; the AST has enums for groups of terminals that are used
//! in the same production, and discards lexical detail like keyword case.

use anyhow::{bail, Result};
use pest::iterators::Pair;
use pest::Parser;

use crate::ast;
use crate::parser::{parse_expr, Rule, SQLParser};

/// Splits raw input into statement strings on `;`, ignoring semicolons
/// inside single-quoted strings.  Each piece keeps its terminator.
pub fn tokenize(sql: &str) -> Vec<String> {
    let mut statements: Vec<String> = vec![];
    let mut current = String::new();
    let mut in_quote = false;
    for ch in sql.chars() {
        current.push(ch);
        match ch {
            '\'' => in_quote = !in_quote,
            ';' if !in_quote => {
                let s = current.trim();
                if s != ";" {
                    statements.push(String::from(s));
                }
                current.clear();
            }
            _ => {}
        }
    }
    if !current.trim().is_empty() {
        statements.push(String::from(current.trim()));
    }
    statements
}

/// Whether the final statement of `tokenize` output is terminated, i.e.
/// the input is ready to execute.  The terminator is `;`.
pub fn is_terminated(statements: &[String]) -> bool {
    match statements.last() {
        Some(s) => s.trim_end().ends_with(';'),
        None => false,
    }
}

/// Parses one statement string into the AST, numbering `?` parameters
/// left to right from 1.
pub fn parse_statement(sql: &str) -> Result<ast::Statement> {
    let mut pairs = SQLParser::parse(Rule::statement, sql)?;
    let statement = pairs.next().expect("statement rule");
    let mut stmt = None;
    for p in statement.into_inner() {
        match p.as_rule() {
            Rule::EOI => (),
            _ => stmt = Some(pt_statement_to_ast(p)?),
        }
    }
    let mut stmt = match stmt {
        Some(s) => s,
        None => bail!("empty statement"),
    };
    let mut next = 0;
    number_variables(&mut stmt, &mut next);
    Ok(stmt)
}

fn pt_statement_to_ast(pair: Pair<Rule>) -> Result<ast::Statement> {
    match pair.as_rule() {
        Rule::explain_stmt => {
            let mut kind = ast::ExplainKind::Bytecode;
            let mut inner_stmt = None;
            for p in pair.into_inner() {
                match p.as_rule() {
                    Rule::query_plan => kind = ast::ExplainKind::QueryPlan,
                    _ => inner_stmt = Some(pt_statement_to_ast(p)?),
                }
            }
            match inner_stmt {
                Some(s) => Ok(ast::Statement::Explain(kind, Box::new(s))),
                None => bail!("EXPLAIN without a statement"),
            }
        }
        Rule::create_stmt => Ok(ast::Statement::Create(pt_create_statement_to_ast(pair)?)),
        Rule::insert_stmt => Ok(ast::Statement::Insert(pt_insert_statement_to_ast(pair)?)),
        Rule::select_stmt => Ok(ast::Statement::Select(pt_select_statement_to_ast(pair)?)),
        Rule::update_stmt => Ok(ast::Statement::Update(pt_update_statement_to_ast(pair)?)),
        Rule::delete_stmt => Ok(ast::Statement::Delete(pt_delete_statement_to_ast(pair)?)),
        r => bail!("unexpected rule for a statement: {:?}", r),
    }
}

fn pt_create_statement_to_ast(pair: Pair<Rule>) -> Result<ast::CreateStatement> {
    let mut tablename = String::new();
    let mut coldefs: Vec<ast::ColDef> = vec![];
    let mut if_not_exists = false;
    for c in pair.into_inner() {
        match c.as_rule() {
            Rule::if_not_exists => if_not_exists = true,
            Rule::table_identifier => tablename = String::from(c.as_str()),
            Rule::column_defs => {
                for column_def in c.into_inner() {
                    match column_def.as_rule() {
                        Rule::column_def => {
                            let mut colname = String::new();
                            let mut coltype = String::new();
                            let mut primary_key = false;
                            for part in column_def.into_inner() {
                                match part.as_rule() {
                                    Rule::column_name => colname = String::from(part.as_str()),
                                    Rule::type_name => coltype = String::from(part.as_str()),
                                    Rule::primary_key => primary_key = true,
                                    _ => unreachable!(),
                                }
                            }
                            coldefs.push(ast::ColDef {
                                colname: ast::ColName { name: colname },
                                coltype,
                                primary_key,
                            });
                        }
                        _ => unreachable!(),
                    }
                }
            }
            _ => unreachable!(),
        }
    }
    Ok(ast::CreateStatement {
        tablename,
        coldefs,
        if_not_exists,
    })
}

fn pt_insert_statement_to_ast(pair: Pair<Rule>) -> Result<ast::InsertStatement> {
    let mut tablename = String::new();
    let mut colnames: Vec<ast::ColName> = vec![];
    let mut values: Vec<Vec<ast::Expr>> = vec![];
    for p in pair.into_inner() {
        match p.as_rule() {
            Rule::table_identifier => tablename = String::from(p.as_str()),
            Rule::column_names => {
                for c in p.into_inner() {
                    colnames.push(ast::ColName {
                        name: String::from(c.as_str()),
                    });
                }
            }
            Rule::expr_list_list => {
                for list in p.into_inner() {
                    let mut row: Vec<ast::Expr> = vec![];
                    for e in list.into_inner() {
                        row.push(parse_expr(e.into_inner())?);
                    }
                    values.push(row);
                }
            }
            _ => bail!("unexpected syntax in INSERT statement"),
        }
    }
    if values.is_empty() {
        bail!("INSERT statement has no VALUES");
    }
    Ok(ast::InsertStatement {
        tablename,
        colnames,
        values,
    })
}

fn pt_select_statement_to_ast(pair: Pair<Rule>) -> Result<ast::SelectStatement> {
    let mut stmt = ast::SelectStatement {
        select: ast::SelectClause { items: vec![] },
        from: None,
        where_clause: None,
    };
    for p in pair.into_inner() {
        match p.as_rule() {
            Rule::select_items => {
                for item in p.into_inner() {
                    let u = item.into_inner().next().expect("select item contents");
                    stmt.select.items.push(match u.as_rule() {
                        Rule::star => ast::SelItem::Star,
                        Rule::expr => ast::SelItem::Expr(parse_expr(u.into_inner())?),
                        _ => bail!("parse error in select item"),
                    });
                }
            }
            Rule::table_identifier => {
                stmt.from = Some(ast::FromClause {
                    tablename: String::from(p.as_str()),
                });
            }
            Rule::where_clause => {
                let e = p.into_inner().next().expect("where expression");
                stmt.where_clause = Some(parse_expr(e.into_inner())?);
            }
            _ => bail!("unable to parse select statement near {}", p.as_str()),
        }
    }
    Ok(stmt)
}

fn pt_update_statement_to_ast(pair: Pair<Rule>) -> Result<ast::UpdateStatement> {
    let mut tablename = String::new();
    let mut assignments: Vec<ast::Assignment> = vec![];
    let mut where_clause = None;
    for p in pair.into_inner() {
        match p.as_rule() {
            Rule::table_identifier => tablename = String::from(p.as_str()),
            Rule::assignments => {
                use itertools::Itertools;
                for a in p.into_inner() {
                    let (col, e) = match a.into_inner().collect_tuple() {
                        Some(pair) => pair,
                        None => bail!("malformed assignment in UPDATE statement"),
                    };
                    assignments.push(ast::Assignment {
                        colname: ast::ColName {
                            name: String::from(col.as_str()),
                        },
                        expr: parse_expr(e.into_inner())?,
                    });
                }
            }
            Rule::where_clause => {
                let e = p.into_inner().next().expect("where expression");
                where_clause = Some(parse_expr(e.into_inner())?);
            }
            _ => bail!("unexpected syntax in UPDATE statement"),
        }
    }
    Ok(ast::UpdateStatement {
        tablename,
        assignments,
        where_clause,
    })
}

fn pt_delete_statement_to_ast(pair: Pair<Rule>) -> Result<ast::DeleteStatement> {
    let mut tablename = String::new();
    let mut where_clause = None;
    for p in pair.into_inner() {
        match p.as_rule() {
            Rule::table_identifier => tablename = String::from(p.as_str()),
            Rule::where_clause => {
                let e = p.into_inner().next().expect("where expression");
                where_clause = Some(parse_expr(e.into_inner())?);
            }
            _ => bail!("unexpected syntax in DELETE statement"),
        }
    }
    Ok(ast::DeleteStatement {
        tablename,
        where_clause,
    })
}

// Positional parameters are numbered by order of appearance across the
// whole statement, starting at 1.
fn number_variables(stmt: &mut ast::Statement, next: &mut usize) {
    match stmt {
        ast::Statement::Create(_) => (),
        ast::Statement::Insert(i) => {
            for row in &mut i.values {
                for e in row {
                    number_expr(e, next);
                }
            }
        }
        ast::Statement::Select(s) => {
            for item in &mut s.select.items {
                if let ast::SelItem::Expr(e) = item {
                    number_expr(e, next);
                }
            }
            if let Some(e) = &mut s.where_clause {
                number_expr(e, next);
            }
        }
        ast::Statement::Update(u) => {
            for a in &mut u.assignments {
                number_expr(&mut a.expr, next);
            }
            if let Some(e) = &mut u.where_clause {
                number_expr(e, next);
            }
        }
        ast::Statement::Delete(d) => {
            if let Some(e) = &mut d.where_clause {
                number_expr(e, next);
            }
        }
        ast::Statement::Explain(_, inner) => number_variables(inner, next),
    }
}

fn number_expr(e: &mut ast::Expr, next: &mut usize) {
    match e {
        ast::Expr::Variable(n) => {
            *next += 1;
            *n = *next;
        }
        ast::Expr::Unary { expr, .. } => number_expr(expr, next),
        ast::Expr::BinOp { lhs, rhs, .. } => {
            number_expr(lhs, next);
            number_expr(rhs, next);
        }
        ast::Expr::Function(f) => {
            for a in &mut f.args {
                number_expr(a, next);
            }
        }
        _ => (),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::*;

    #[test]
    fn test_tokenize_and_is_terminated() {
        let cases = vec![
            ("", vec![], false),
            ("select 1", vec!["select 1"], false),
            ("select 1;", vec!["select 1;"], true),
            (
                "select 1; select 2;",
                vec!["select 1;", "select 2;"],
                true,
            ),
            (
                "insert into t values ('a;b'); select 1",
                vec!["insert into t values ('a;b');", "select 1"],
                false,
            ),
            (";", vec![], false),
        ];
        for case in cases {
            println!("Input: {:?}", case.0);
            let statements = tokenize(case.0);
            let expected: Vec<String> = case.1.iter().map(|s| String::from(*s)).collect();
            assert_eq!(statements, expected);
            assert_eq!(is_terminated(&statements), case.2);
        }
    }

    #[test]
    fn test_parse_create_statement() {
        let stmt = parse_statement(
            "CREATE TABLE person (id INTEGER PRIMARY KEY, first_name TEXT, age INTEGER);",
        )
        .unwrap();
        let create = stmt.as_create().unwrap();
        assert_eq!(create.tablename, "person");
        assert!(!create.if_not_exists);
        assert_eq!(create.coldefs.len(), 3);
        assert_eq!(create.coldefs[0].colname.name, "id");
        assert_eq!(create.coldefs[0].coltype, "INTEGER");
        assert!(create.coldefs[0].primary_key);
        assert!(!create.coldefs[1].primary_key);
    }

    #[test]
    fn test_parse_create_if_not_exists() {
        let stmt = parse_statement("create table if not exists t (a integer)").unwrap();
        let create = stmt.as_create().unwrap();
        assert_eq!(create.tablename, "t");
        assert!(create.if_not_exists);
    }

    #[test]
    fn test_parse_insert_statements() {
        let cases = vec![
            "INSERT INTO foo VALUES (1, 'two', 3)",
            "insert into foo values (1, 'two', 3)",
            "insert into foo (a, b) values (1, 2), (3, 4)",
            "insert into foo values (?, ?)",
        ];
        for case in cases {
            println!("Case: {}", case);
            match parse_statement(case) {
                Ok(_) => continue,
                Err(e) => panic!("Error parsing [{}] : {}", case, e),
            }
        }
        let stmt = parse_statement("insert into foo (a, b) values (1, 2), (3, 4);").unwrap();
        let insert = stmt.as_insert().unwrap();
        assert_eq!(insert.tablename, "foo");
        assert_eq!(insert.colnames.len(), 2);
        assert_eq!(insert.values.len(), 2);
        assert_eq!(insert.values[1], vec![Expr::IntLit(3), Expr::IntLit(4)]);
    }

    #[test]
    fn test_parse_select_statement() {
        let stmt = parse_statement("SELECT a, 1 FROM tbl WHERE a = 2;").unwrap();
        let select = stmt.as_select().unwrap();
        assert_eq!(select.select.items.len(), 2);
        assert_eq!(
            select.from,
            Some(FromClause {
                tablename: String::from("tbl")
            })
        );
        assert!(select.where_clause.is_some());
    }

    #[test]
    fn test_parse_select_star_and_count() {
        let stmt = parse_statement("select * from t").unwrap();
        assert_eq!(stmt.as_select().unwrap().select.items, vec![SelItem::Star]);

        let stmt = parse_statement("select count(*) from t").unwrap();
        match &stmt.as_select().unwrap().select.items[0] {
            SelItem::Expr(Expr::Function(f)) => {
                assert_eq!(f.name, "count");
                assert!(f.star);
            }
            other => panic!("unexpected select item: {:?}", other),
        }
    }

    #[test]
    fn test_parse_select_without_from() {
        let stmt = parse_statement("select 1+2").unwrap();
        let select = stmt.as_select().unwrap();
        assert_eq!(select.from, None);
        assert_eq!(select.select.items.len(), 1);
    }

    #[test]
    fn test_parse_update_statement() {
        let stmt = parse_statement("UPDATE foo SET b = 1 WHERE a = 2;").unwrap();
        let update = stmt.as_update().unwrap();
        assert_eq!(update.tablename, "foo");
        assert_eq!(update.assignments.len(), 1);
        assert_eq!(update.assignments[0].colname.name, "b");
        assert!(update.where_clause.is_some());
    }

    #[test]
    fn test_parse_delete_statement() {
        let stmt = parse_statement("DELETE FROM foo WHERE a = 12;").unwrap();
        let delete = stmt.as_delete().unwrap();
        assert_eq!(delete.tablename, "foo");
        assert!(delete.where_clause.is_some());

        let stmt = parse_statement("delete from foo").unwrap();
        assert!(stmt.as_delete().unwrap().where_clause.is_none());
    }

    #[test]
    fn test_parse_explain() {
        let stmt = parse_statement("EXPLAIN SELECT 1;").unwrap();
        match stmt {
            Statement::Explain(ExplainKind::Bytecode, inner) => {
                assert!(inner.as_select().is_some());
            }
            other => panic!("unexpected: {:?}", other),
        }
        let stmt = parse_statement("EXPLAIN QUERY PLAN SELECT * FROM t;").unwrap();
        match stmt {
            Statement::Explain(ExplainKind::QueryPlan, _) => (),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_variables_are_numbered_in_order() {
        let stmt = parse_statement("update t set a = ?, b = ? where c = ?").unwrap();
        let update = stmt.as_update().unwrap();
        assert_eq!(update.assignments[0].expr, Expr::Variable(1));
        assert_eq!(update.assignments[1].expr, Expr::Variable(2));
        match update.where_clause.as_ref().unwrap() {
            Expr::BinOp { rhs, .. } => assert_eq!(**rhs, Expr::Variable(3)),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_errors() {
        let cases = vec!["select", "frobnicate the database", "delete foo", ""];
        for case in cases {
            println!("Case: {}", case);
            assert!(parse_statement(case).is_err());
        }
    }
}
