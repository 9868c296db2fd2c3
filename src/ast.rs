//! This module defines abstract syntax tree (AST) types for SQL.

use enum_as_inner::EnumAsInner;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColName {
    pub name: String,
}

impl std::fmt::Display for ColName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.name.fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, EnumAsInner)]
pub enum SelItem {
    Expr(Expr),
    Star,
}

impl std::fmt::Display for SelItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SelItem::Expr(x) => x.fmt(f),
            SelItem::Star => "*".fmt(f),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectClause {
    pub items: Vec<SelItem>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FromClause {
    pub tablename: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectStatement {
    pub select: SelectClause,
    pub from: Option<FromClause>,
    pub where_clause: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColDef {
    pub colname: ColName,
    pub coltype: String, // Validated against the supported types at plan time.
    pub primary_key: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateStatement {
    pub tablename: String,
    pub coldefs: Vec<ColDef>,
    pub if_not_exists: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InsertStatement {
    pub tablename: String,
    // Empty when the statement does not name columns; the planner then
    // expects one value per table column.
    pub colnames: Vec<ColName>,
    pub values: Vec<Vec<Expr>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub colname: ColName,
    pub expr: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateStatement {
    pub tablename: String,
    pub assignments: Vec<Assignment>,
    pub where_clause: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteStatement {
    pub tablename: String,
    pub where_clause: Option<Expr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExplainKind {
    /// `EXPLAIN`: emit the compiled routine as a result set.
    Bytecode,
    /// `EXPLAIN QUERY PLAN`: emit the logical tree as indented text.
    QueryPlan,
}

#[derive(Debug, Clone, PartialEq, EnumAsInner)]
pub enum Statement {
    Create(CreateStatement),
    Insert(InsertStatement),
    Select(SelectStatement),
    Update(UpdateStatement),
    Delete(DeleteStatement),
    Explain(ExplainKind, Box<Statement>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionExpr {
    pub name: String,
    /// True for the `f(*)` form, as in COUNT(*).
    pub star: bool,
    pub args: Vec<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    IntLit(i64),
    StringLit(String),
    NullLit,
    ColumnRef(ColName),
    /// Positional `?` parameter; positions are assigned left to right,
    /// starting at 1.
    Variable(usize),
    Function(FunctionExpr),
    Unary {
        op: UnOp,
        expr: Box<Expr>,
    },
    BinOp {
        lhs: Box<Expr>,
        op: Op,
        rhs: Box<Expr>,
    },
}

impl std::fmt::Display for Expr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Expr::IntLit(x) => x.fmt(f),
            Expr::StringLit(x) => write!(f, "'{}'", x),
            Expr::NullLit => "NULL".fmt(f),
            Expr::ColumnRef(c) => c.fmt(f),
            Expr::Variable(i) => write!(f, "?{}", i),
            Expr::Function(func) => {
                let args = if func.star {
                    String::from("*")
                } else {
                    func.args
                        .iter()
                        .map(|a| format!("{}", a))
                        .collect::<Vec<String>>()
                        .join(", ")
                };
                write!(f, "{}({})", func.name.to_uppercase(), args)
            }
            Expr::Unary { op, expr } => write!(f, "{}{}", op, expr),
            Expr::BinOp { lhs, op, rhs } => write!(f, "{} {} {}", lhs, op, rhs),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Negate,
}

impl std::fmt::Display for UnOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnOp::Negate => "-".fmt(f),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Add,
    Subtract,
    Multiply,
    Divide,
    Exponent,
    Equal,
    LessThan,
    GreaterThan,
}

impl std::fmt::Display for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use Op::*;
        match self {
            Add => "+".fmt(f),
            Subtract => "-".fmt(f),
            Multiply => "*".fmt(f),
            Divide => "/".fmt(f),
            Exponent => "^".fmt(f),
            Equal => "=".fmt(f),
            LessThan => "<".fmt(f),
            GreaterThan => ">".fmt(f),
        }
    }
}
