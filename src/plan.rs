//! `plan` defines the logical tree that sits between the AST and the
//! bytecode.
//!
//! The AST and the logical tree are separate on purpose: the tree
//! describes the querying procedure (scan vs key lookup, filter position,
//! write shape) and is what the optimizer rewrites, while the AST only
//! mirrors the statement text.  `SELECT b FROM foo WHERE b = 1` plans as
//!
//! ```text
//! project (b)
//!   filter (b = 1)
//!     scan foo
//! ```
//!
//! and the same WHERE over the primary key instead plans as a `seek`,
//! which skips the scan loop entirely.  `EXPLAIN QUERY PLAN` prints this
//! tree.

use crate::ast;
use crate::catalog;
use crate::sql_type::SqlType;

/// One output column of a projection: the expression to compute, the
/// header name it renders under, and its result type.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputCol {
    pub expr: ast::Expr,
    pub name: String,
    pub col_type: SqlType,
}

/// One row of an INSERT: the primary-key expression when the statement
/// supplies it, and one optional expression per stored record cell
/// (columns the statement omits stay None and store NULL).
#[derive(Debug, Clone, PartialEq)]
pub struct InsertRow {
    pub key: Option<ast::Expr>,
    pub record: Vec<Option<ast::Expr>>,
}

#[derive(Debug, Clone)]
pub enum Plan {
    Project(Project),
    Scan(Scan),
    Filter(Filter),
    Count(Count),
    ConstantRow(ConstantRow),
    Seek(Seek),
    Create(Create),
    Insert(Insert),
    Update(Update),
    Delete(Delete),
    // Reserved for joins; no SQL surface reaches it yet.
    #[allow(dead_code)]
    Join(Join),
}

#[derive(Debug, Clone)]
pub struct Project {
    pub cols: Vec<OutputCol>,
    pub input: Box<Plan>,
}

/// A one-pass scan over all rows of a table.
#[derive(Debug, Clone)]
pub struct Scan {
    pub table: catalog::Table,
}

#[derive(Debug, Clone)]
pub struct Filter {
    pub predicate: ast::Expr,
    pub input: Box<Plan>,
}

/// Optimized full-table COUNT(*): tuple totals come from the tree, not a
/// row loop.
#[derive(Debug, Clone)]
pub struct Count {
    pub table: catalog::Table,
}

/// A table of exactly one row, produced by a SELECT without FROM.
#[derive(Debug, Clone)]
pub struct ConstantRow {
    pub exprs: Vec<ast::Expr>,
}

/// Direct key lookup, the rewrite of `filter(scan)` when the predicate
/// pins the primary key to a constant.
#[derive(Debug, Clone)]
pub struct Seek {
    pub table: catalog::Table,
    pub key: i64,
}

#[derive(Debug, Clone)]
pub struct Create {
    pub tablename: String,
    pub columns: Vec<catalog::Column>,
    pub column_json: String,
    /// True when IF NOT EXISTS found the table already present; the
    /// routine then does nothing.
    pub noop: bool,
}

#[derive(Debug, Clone)]
pub struct Insert {
    pub table: catalog::Table,
    pub rows: Vec<InsertRow>,
}

/// One expression per stored record cell; untouched columns carry a
/// ColumnRef to themselves.
#[derive(Debug, Clone)]
pub struct Update {
    pub table: catalog::Table,
    pub exprs: Vec<ast::Expr>,
    pub input: Box<Plan>,
}

#[derive(Debug, Clone)]
pub struct Delete {
    pub table: catalog::Table,
    pub input: Box<Plan>,
}

#[derive(Debug, Clone)]
pub struct Join {
    pub left: Box<Plan>,
    pub right: Box<Plan>,
}

impl Plan {
    /// Renders the tree as indented text, one node per line.  This is the
    /// EXPLAIN QUERY PLAN output.
    pub fn format(&self) -> String {
        let mut out = String::new();
        self.format_into(&mut out, 0);
        out
    }

    fn format_into(&self, out: &mut String, depth: usize) {
        let indent = "  ".repeat(depth);
        match self {
            Plan::Project(p) => {
                let names: Vec<String> = p.cols.iter().map(|c| c.name.clone()).collect();
                out.push_str(&format!("{}project ({})\n", indent, names.join(", ")));
                p.input.format_into(out, depth + 1);
            }
            Plan::Scan(s) => {
                out.push_str(&format!("{}scan {}\n", indent, s.table.name));
            }
            Plan::Filter(f) => {
                out.push_str(&format!("{}filter ({})\n", indent, f.predicate));
                f.input.format_into(out, depth + 1);
            }
            Plan::Count(c) => {
                out.push_str(&format!("{}count {}\n", indent, c.table.name));
            }
            Plan::ConstantRow(c) => {
                let exprs: Vec<String> = c.exprs.iter().map(|e| format!("{}", e)).collect();
                out.push_str(&format!("{}constant ({})\n", indent, exprs.join(", ")));
            }
            Plan::Seek(s) => {
                out.push_str(&format!(
                    "{}seek {} (rowid = {})\n",
                    indent, s.table.name, s.key
                ));
            }
            Plan::Create(c) => {
                if c.noop {
                    out.push_str(&format!("{}create {} (noop)\n", indent, c.tablename));
                } else {
                    let names: Vec<&str> =
                        c.columns.iter().map(|col| col.name.as_str()).collect();
                    out.push_str(&format!(
                        "{}create {} ({})\n",
                        indent,
                        c.tablename,
                        names.join(", ")
                    ));
                }
            }
            Plan::Insert(i) => {
                out.push_str(&format!(
                    "{}insert {} ({} rows)\n",
                    indent,
                    i.table.name,
                    i.rows.len()
                ));
            }
            Plan::Update(u) => {
                out.push_str(&format!("{}update {}\n", indent, u.table.name));
                u.input.format_into(out, depth + 1);
            }
            Plan::Delete(d) => {
                out.push_str(&format!("{}delete {}\n", indent, d.table.name));
                d.input.format_into(out, depth + 1);
            }
            Plan::Join(j) => {
                out.push_str(&format!("{}join\n", indent));
                j.left.format_into(out, depth + 1);
                j.right.format_into(out, depth + 1);
            }
        }
    }
}
