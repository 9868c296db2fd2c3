//! SQL parser: a pest grammar (`sql.pest`) plus a Pratt parser for
//! expressions.  `pt_to_ast` builds the typed AST from the parse trees
//! produced here.

use anyhow::{bail, Result};
use pest::iterators::Pairs;
use pest::pratt_parser::{Assoc, Op, PrattParser};
use pest::Parser;

use crate::ast;

#[derive(Parser)]
#[grammar = "sql.pest"]
pub struct SQLParser;

lazy_static::lazy_static! {
    // Precedence, loosest first: comparisons, additive, multiplicative,
    // exponent.  Comparisons chain left-associatively.
    static ref PRATT: PrattParser<Rule> = PrattParser::new()
        .op(Op::infix(Rule::equal, Assoc::Left)
            | Op::infix(Rule::less_than, Assoc::Left)
            | Op::infix(Rule::greater_than, Assoc::Left))
        .op(Op::infix(Rule::add, Assoc::Left) | Op::infix(Rule::subtract, Assoc::Left))
        .op(Op::infix(Rule::multiply, Assoc::Left) | Op::infix(Rule::divide, Assoc::Left))
        .op(Op::infix(Rule::exponent, Assoc::Right))
        .op(Op::prefix(Rule::negate));
}

pub fn remove_single_quoting(s: &str) -> String {
    // The lexeme includes the outer quotes; '' inside is an escaped quote.
    debug_assert!(s.len() >= 2);
    s[1..s.len() - 1].replace("''", "'")
}

/// Builds an expression from the inner pairs of an `expr` rule.
/// `?` parameters get position 0 here; `pt_to_ast` numbers them in
/// statement order afterwards.
pub fn parse_expr(pairs: Pairs<Rule>) -> Result<ast::Expr> {
    PRATT
        .map_primary(|p| match p.as_rule() {
            Rule::integer_literal => Ok(ast::Expr::IntLit(p.as_str().parse::<i64>()?)),
            Rule::single_quoted_string => {
                Ok(ast::Expr::StringLit(remove_single_quoting(p.as_str())))
            }
            Rule::null_literal => Ok(ast::Expr::NullLit),
            Rule::variable => Ok(ast::Expr::Variable(0)),
            Rule::column_name => Ok(ast::Expr::ColumnRef(ast::ColName {
                name: String::from(p.as_str()),
            })),
            Rule::function_call => {
                let mut inner = p.into_inner();
                let name = match inner.next() {
                    Some(id) => String::from(id.as_str()).to_lowercase(),
                    None => bail!("function call without a name"),
                };
                let mut star = false;
                let mut args: Vec<ast::Expr> = vec![];
                for a in inner {
                    match a.as_rule() {
                        Rule::star => star = true,
                        Rule::expr => args.push(parse_expr(a.into_inner())?),
                        r => bail!("unexpected rule in function arguments: {:?}", r),
                    }
                }
                Ok(ast::Expr::Function(ast::FunctionExpr { name, star, args }))
            }
            Rule::expr => parse_expr(p.into_inner()),
            r => bail!("unexpected rule in expression: {:?}", r),
        })
        .map_prefix(|op, rhs| match op.as_rule() {
            Rule::negate => Ok(ast::Expr::Unary {
                op: ast::UnOp::Negate,
                expr: Box::new(rhs?),
            }),
            r => bail!("unexpected prefix operator: {:?}", r),
        })
        .map_infix(|lhs, op, rhs| {
            let op = match op.as_rule() {
                Rule::add => ast::Op::Add,
                Rule::subtract => ast::Op::Subtract,
                Rule::multiply => ast::Op::Multiply,
                Rule::divide => ast::Op::Divide,
                Rule::exponent => ast::Op::Exponent,
                Rule::equal => ast::Op::Equal,
                Rule::less_than => ast::Op::LessThan,
                Rule::greater_than => ast::Op::GreaterThan,
                r => bail!("unexpected infix operator: {:?}", r),
            };
            Ok(ast::Expr::BinOp {
                lhs: Box::new(lhs?),
                op,
                rhs: Box::new(rhs?),
            })
        })
        .parse(pairs)
}

#[cfg(test)]
pub fn parse_expr_str(s: &str) -> Result<ast::Expr> {
    let mut pairs = SQLParser::parse(Rule::expr, s)?;
    parse_expr(pairs.next().expect("expr rule").into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Expr::*;
    use crate::ast::{ColName, Op};

    fn bin(lhs: ast::Expr, op: Op, rhs: ast::Expr) -> ast::Expr {
        BinOp {
            lhs: Box::new(lhs),
            op,
            rhs: Box::new(rhs),
        }
    }

    #[test]
    fn test_parse_literals() {
        let cases = vec![
            ("1", IntLit(1)),
            ("1000000000000", IntLit(1000000000000)),
            ("'hi'", StringLit(String::from("hi"))),
            ("'h''i'", StringLit(String::from("h'i"))),
            ("''", StringLit(String::from(""))),
            ("NULL", NullLit),
            ("nUlL", NullLit),
            ("?", Variable(0)),
        ];
        for case in cases {
            println!("Input: {}", case.0);
            assert_eq!(parse_expr_str(case.0).unwrap(), case.1);
        }
    }

    #[test]
    fn test_parse_negative_numbers() {
        assert_eq!(
            parse_expr_str("-5").unwrap(),
            Unary {
                op: ast::UnOp::Negate,
                expr: Box::new(IntLit(5))
            }
        );
    }

    #[test]
    fn test_precedence() {
        // 1 + 2 * 3 groups the product first.
        assert_eq!(
            parse_expr_str("1 + 2 * 3").unwrap(),
            bin(IntLit(1), Op::Add, bin(IntLit(2), Op::Multiply, IntLit(3)))
        );
        // 2 ^ 3 binds tighter than *.
        assert_eq!(
            parse_expr_str("2 * 3 ^ 4").unwrap(),
            bin(IntLit(2), Op::Multiply, bin(IntLit(3), Op::Exponent, IntLit(4)))
        );
        // Comparison is loosest.
        assert_eq!(
            parse_expr_str("a = 1 + 2").unwrap(),
            bin(
                ColumnRef(ColName {
                    name: String::from("a")
                }),
                Op::Equal,
                bin(IntLit(1), Op::Add, IntLit(2))
            )
        );
        // Parentheses override.
        assert_eq!(
            parse_expr_str("(1 + 2) * 3").unwrap(),
            bin(bin(IntLit(1), Op::Add, IntLit(2)), Op::Multiply, IntLit(3))
        );
    }

    #[test]
    fn test_left_associative_chains() {
        // 1 - 2 - 3 is (1 - 2) - 3.
        assert_eq!(
            parse_expr_str("1 - 2 - 3").unwrap(),
            bin(bin(IntLit(1), Op::Subtract, IntLit(2)), Op::Subtract, IntLit(3))
        );
        // Chained comparisons fold left-associatively.
        assert_eq!(
            parse_expr_str("1 < 2 < 3").unwrap(),
            bin(bin(IntLit(1), Op::LessThan, IntLit(2)), Op::LessThan, IntLit(3))
        );
    }

    #[test]
    fn test_count_star() {
        assert_eq!(
            parse_expr_str("COUNT(*)").unwrap(),
            Function(ast::FunctionExpr {
                name: String::from("count"),
                star: true,
                args: vec![]
            })
        );
    }
}
