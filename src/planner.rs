//! `planner` converts statement ASTs into logical trees, validating
//! against the catalog as it goes.
//!
//! The pipeline per statement: validate names and shapes, build the tree
//! (see `plan`), then optimize.  The optimizer folds constant integer
//! expressions and rewrites `WHERE pk = const` over a scan into a direct
//! key seek.

use anyhow::{bail, Result};

use crate::ast;
use crate::catalog::{self, Catalog, ColumnList};
use crate::plan::{self, Plan};
use crate::sql_type::SqlType;

pub fn plan_statement(catalog: &Catalog, stmt: &ast::Statement) -> Result<Plan> {
    match stmt {
        ast::Statement::Select(s) => plan_select(catalog, s),
        ast::Statement::Insert(i) => plan_insert(catalog, i),
        ast::Statement::Update(u) => plan_update(catalog, u),
        ast::Statement::Delete(d) => plan_delete(catalog, d),
        ast::Statement::Create(c) => plan_create(catalog, c),
        ast::Statement::Explain(..) => {
            bail!("EXPLAIN is handled by the executor, not the planner")
        }
    }
}

// ---------------------------------------------------------------------------
// SELECT
// ---------------------------------------------------------------------------

fn plan_select(catalog: &Catalog, s: &ast::SelectStatement) -> Result<Plan> {
    let table = match &s.from {
        Some(from) => Some(resolve_table(catalog, &from.tablename)?),
        None => None,
    };

    // COUNT(*) takes a dedicated plan shape, served from tuple counts
    // rather than a row loop.
    if let Some(count_col) = sole_count_item(s)? {
        let table = match table {
            Some(t) => t,
            None => bail!("COUNT(*) requires a FROM clause"),
        };
        if s.where_clause.is_some() {
            bail!("COUNT(*) with WHERE is not supported");
        }
        return Ok(Plan::Project(plan::Project {
            cols: vec![count_col],
            input: Box::new(Plan::Count(plan::Count { table })),
        }));
    }

    let mut cols: Vec<plan::OutputCol> = vec![];
    for item in &s.select.items {
        match item {
            ast::SelItem::Star => {
                let table = match &table {
                    Some(t) => t,
                    None => bail!("cannot select * without a FROM clause"),
                };
                for c in &table.columns {
                    cols.push(plan::OutputCol {
                        expr: ast::Expr::ColumnRef(ast::ColName {
                            name: c.name.clone(),
                        }),
                        name: c.name.clone(),
                        col_type: c.col_type,
                    });
                }
            }
            ast::SelItem::Expr(e) => {
                validate_expr(e, table.as_ref())?;
                let name = format!("{}", e);
                let col_type = infer_type(e, table.as_ref());
                cols.push(plan::OutputCol {
                    expr: fold_expr(e)?,
                    name,
                    col_type,
                });
            }
        }
    }

    let input = match (&table, &s.where_clause) {
        (None, None) => {
            let exprs: Vec<ast::Expr> = cols.iter().map(|c| c.expr.clone()).collect();
            Plan::ConstantRow(plan::ConstantRow { exprs })
        }
        (None, Some(_)) => bail!("WHERE requires a FROM clause"),
        (Some(t), None) => Plan::Scan(plan::Scan { table: t.clone() }),
        (Some(t), Some(predicate)) => {
            validate_expr(predicate, Some(t))?;
            let predicate = fold_expr(predicate)?;
            filtered_scan(t.clone(), predicate)
        }
    };

    Ok(Plan::Project(plan::Project {
        cols,
        input: Box::new(input),
    }))
}

/// If the select list is exactly one COUNT(*), its output column.
/// Rejects COUNT(*) mixed with other items.
fn sole_count_item(s: &ast::SelectStatement) -> Result<Option<plan::OutputCol>> {
    let is_count = |item: &ast::SelItem| {
        matches!(item,
            ast::SelItem::Expr(ast::Expr::Function(f)) if f.name == "count")
    };
    let any_count = s.select.items.iter().any(is_count);
    if !any_count {
        return Ok(None);
    }
    if s.select.items.len() != 1 {
        bail!("COUNT(*) must be the only selected item");
    }
    match &s.select.items[0] {
        ast::SelItem::Expr(e @ ast::Expr::Function(f)) => {
            if !f.star || !f.args.is_empty() {
                bail!("only the COUNT(*) form is supported");
            }
            Ok(Some(plan::OutputCol {
                expr: e.clone(),
                name: format!("{}", e),
                col_type: SqlType::Integer,
            }))
        }
        _ => unreachable!(),
    }
}

/// Builds `filter(scan)`, or a `seek` when the predicate pins the primary
/// key to an integer constant.
fn filtered_scan(table: catalog::Table, predicate: ast::Expr) -> Plan {
    if let Some(key) = pk_equality_key(&table, &predicate) {
        return Plan::Seek(plan::Seek { table, key });
    }
    Plan::Filter(plan::Filter {
        predicate,
        input: Box::new(Plan::Scan(plan::Scan { table })),
    })
}

/// Matches `pk = const` (either operand order) after folding.
fn pk_equality_key(table: &catalog::Table, predicate: &ast::Expr) -> Option<i64> {
    let pk = table.primary_key()?;
    if let ast::Expr::BinOp { lhs, op, rhs } = predicate {
        if *op != ast::Op::Equal {
            return None;
        }
        match (lhs.as_ref(), rhs.as_ref()) {
            (ast::Expr::ColumnRef(c), ast::Expr::IntLit(k))
            | (ast::Expr::IntLit(k), ast::Expr::ColumnRef(c))
                if c.name == pk.name =>
            {
                return Some(*k);
            }
            _ => return None,
        }
    }
    None
}

// ---------------------------------------------------------------------------
// INSERT
// ---------------------------------------------------------------------------

fn plan_insert(catalog: &Catalog, i: &ast::InsertStatement) -> Result<Plan> {
    let table = resolve_writable_table(catalog, &i.tablename)?;

    // The column list defaults to every table column, in declared order.
    let colnames: Vec<String> = if i.colnames.is_empty() {
        table.columns.iter().map(|c| c.name.clone()).collect()
    } else {
        i.colnames.iter().map(|c| c.name.clone()).collect()
    };
    for name in &colnames {
        if table.column(name).is_none() {
            bail!("no such column: {}.{}", table.name, name);
        }
    }
    for (n, name) in colnames.iter().enumerate() {
        if colnames[..n].contains(name) {
            bail!("column {} named more than once", name);
        }
    }

    let mut rows: Vec<plan::InsertRow> = vec![];
    for row in &i.values {
        if row.len() != colnames.len() {
            bail!(
                "{} values for {} columns",
                row.len(),
                colnames.len()
            );
        }
        for e in row {
            validate_values_expr(e)?;
        }
        let value_for = |col: &str| -> Option<&ast::Expr> {
            colnames
                .iter()
                .position(|n| n == col)
                .map(|idx| &row[idx])
        };
        let key = match table.primary_key() {
            Some(pk) => value_for(&pk.name).cloned(),
            None => None,
        };
        let key = match key {
            Some(e) => Some(fold_expr(&e)?),
            None => None,
        };
        let mut record: Vec<Option<ast::Expr>> = vec![];
        for c in &table.columns {
            if c.primary_key {
                continue;
            }
            record.push(match value_for(&c.name) {
                Some(e) => Some(fold_expr(e)?),
                None => None,
            });
        }
        rows.push(plan::InsertRow { key, record });
    }

    Ok(Plan::Insert(plan::Insert { table, rows }))
}

// VALUES expressions may compute, but cannot reference rows.
fn validate_values_expr(e: &ast::Expr) -> Result<()> {
    match e {
        ast::Expr::ColumnRef(c) => bail!("column reference {} in VALUES", c),
        ast::Expr::Function(f) => bail!("function {} in VALUES", f.name),
        ast::Expr::BinOp { lhs, rhs, .. } => {
            validate_values_expr(lhs)?;
            validate_values_expr(rhs)
        }
        ast::Expr::Unary { expr, .. } => validate_values_expr(expr),
        _ => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// UPDATE / DELETE
// ---------------------------------------------------------------------------

fn plan_update(catalog: &Catalog, u: &ast::UpdateStatement) -> Result<Plan> {
    let table = resolve_writable_table(catalog, &u.tablename)?;

    for (n, a) in u.assignments.iter().enumerate() {
        let col = match table.column(&a.colname.name) {
            Some(c) => c,
            None => bail!("no such column: {}.{}", table.name, a.colname.name),
        };
        if col.primary_key {
            bail!("cannot update primary key column {}", col.name);
        }
        if u.assignments[..n]
            .iter()
            .any(|prev| prev.colname.name == a.colname.name)
        {
            bail!("column {} assigned more than once", col.name);
        }
        validate_expr(&a.expr, Some(&table))?;
    }

    // One expression per stored record cell: the assignment's right-hand
    // side where the SET list names the column, the column itself
    // otherwise.
    let mut exprs: Vec<ast::Expr> = vec![];
    for c in &table.columns {
        if c.primary_key {
            continue;
        }
        let assigned = u.assignments.iter().find(|a| a.colname.name == c.name);
        exprs.push(match assigned {
            Some(a) => fold_expr(&a.expr)?,
            None => ast::Expr::ColumnRef(ast::ColName {
                name: c.name.clone(),
            }),
        });
    }

    let input = write_input(&table, &u.where_clause)?;
    Ok(Plan::Update(plan::Update {
        table,
        exprs,
        input: Box::new(input),
    }))
}

fn plan_delete(catalog: &Catalog, d: &ast::DeleteStatement) -> Result<Plan> {
    let table = resolve_writable_table(catalog, &d.tablename)?;
    let input = write_input(&table, &d.where_clause)?;
    Ok(Plan::Delete(plan::Delete {
        table,
        input: Box::new(input),
    }))
}

fn write_input(table: &catalog::Table, where_clause: &Option<ast::Expr>) -> Result<Plan> {
    match where_clause {
        None => Ok(Plan::Scan(plan::Scan {
            table: table.clone(),
        })),
        Some(predicate) => {
            validate_expr(predicate, Some(table))?;
            Ok(Plan::Filter(plan::Filter {
                predicate: fold_expr(predicate)?,
                input: Box::new(Plan::Scan(plan::Scan {
                    table: table.clone(),
                })),
            }))
        }
    }
}

// ---------------------------------------------------------------------------
// CREATE TABLE
// ---------------------------------------------------------------------------

fn plan_create(catalog: &Catalog, c: &ast::CreateStatement) -> Result<Plan> {
    if c.tablename == catalog::SCHEMA_TABLE_NAME {
        bail!("{} is reserved", catalog::SCHEMA_TABLE_NAME);
    }
    if catalog.table_exists(&c.tablename) {
        if c.if_not_exists {
            return Ok(Plan::Create(plan::Create {
                tablename: c.tablename.clone(),
                columns: vec![],
                column_json: String::new(),
                noop: true,
            }));
        }
        bail!("table {} already exists", c.tablename);
    }
    if c.coldefs.is_empty() {
        bail!("table {} has no columns", c.tablename);
    }

    let mut columns: Vec<catalog::Column> = vec![];
    let mut pk_count = 0;
    for (n, def) in c.coldefs.iter().enumerate() {
        if c.coldefs[..n]
            .iter()
            .any(|prev| prev.colname.name == def.colname.name)
        {
            bail!("duplicate column name {}", def.colname.name);
        }
        let col_type: SqlType = match def.coltype.parse() {
            Ok(t) => t,
            Err(_) => bail!("unsupported column type {}", def.coltype),
        };
        if def.primary_key {
            pk_count += 1;
            if pk_count > 1 {
                bail!("table {} has more than one primary key", c.tablename);
            }
            if col_type != SqlType::Integer {
                bail!("primary key column {} must be INTEGER", def.colname.name);
            }
        }
        columns.push(catalog::Column {
            name: def.colname.name.clone(),
            col_type,
            primary_key: def.primary_key,
        });
    }

    let column_json = ColumnList {
        columns: columns.clone(),
    }
    .to_json();
    Ok(Plan::Create(plan::Create {
        tablename: c.tablename.clone(),
        columns,
        column_json,
        noop: false,
    }))
}

// ---------------------------------------------------------------------------
// Shared validation and folding
// ---------------------------------------------------------------------------

fn resolve_table(catalog: &Catalog, name: &str) -> Result<catalog::Table> {
    match catalog.resolve_table(name) {
        Some(t) => Ok(t),
        None => bail!("no such table: {}", name),
    }
}

fn resolve_writable_table(catalog: &Catalog, name: &str) -> Result<catalog::Table> {
    if name == catalog::SCHEMA_TABLE_NAME {
        bail!("{} is read-only", catalog::SCHEMA_TABLE_NAME);
    }
    resolve_table(catalog, name)
}

/// Checks column references against the table in scope and rejects
/// functions outside the COUNT(*) position.
fn validate_expr(e: &ast::Expr, table: Option<&catalog::Table>) -> Result<()> {
    match e {
        ast::Expr::ColumnRef(c) => match table {
            Some(t) => {
                if t.column(&c.name).is_none() {
                    bail!("no such column: {}.{}", t.name, c.name);
                }
                Ok(())
            }
            None => bail!("cannot use column {} without a FROM clause", c),
        },
        ast::Expr::Function(f) => bail!("function {} is not allowed here", f.name),
        ast::Expr::BinOp { lhs, rhs, .. } => {
            validate_expr(lhs, table)?;
            validate_expr(rhs, table)
        }
        ast::Expr::Unary { expr, .. } => validate_expr(expr, table),
        _ => Ok(()),
    }
}

/// Result type of an expression, used for result-set headers.
fn infer_type(e: &ast::Expr, table: Option<&catalog::Table>) -> SqlType {
    match e {
        ast::Expr::StringLit(_) => SqlType::Text,
        ast::Expr::ColumnRef(c) => table
            .and_then(|t| t.column(&c.name))
            .map(|col| col.col_type)
            .unwrap_or(SqlType::Integer),
        // Arithmetic, comparisons, parameters, counts and NULL all report
        // INTEGER.
        _ => SqlType::Integer,
    }
}

/// Folds constant integer subtrees bottom-up.  Division by zero between
/// two constants is a planning error; everything else stays for runtime.
pub fn fold_expr(e: &ast::Expr) -> Result<ast::Expr> {
    Ok(match e {
        ast::Expr::BinOp { lhs, op, rhs } => {
            let lhs = fold_expr(lhs)?;
            let rhs = fold_expr(rhs)?;
            if let (ast::Expr::IntLit(a), ast::Expr::IntLit(b)) = (&lhs, &rhs) {
                ast::Expr::IntLit(eval_const(*a, *op, *b)?)
            } else {
                ast::Expr::BinOp {
                    lhs: Box::new(lhs),
                    op: *op,
                    rhs: Box::new(rhs),
                }
            }
        }
        ast::Expr::Unary { op, expr } => {
            let inner = fold_expr(expr)?;
            match (op, &inner) {
                (ast::UnOp::Negate, ast::Expr::IntLit(a)) => ast::Expr::IntLit(-a),
                _ => ast::Expr::Unary {
                    op: *op,
                    expr: Box::new(inner),
                },
            }
        }
        other => other.clone(),
    })
}

fn eval_const(a: i64, op: ast::Op, b: i64) -> Result<i64> {
    use ast::Op::*;
    Ok(match op {
        Add => match a.checked_add(b) {
            Some(v) => v,
            None => bail!("integer overflow"),
        },
        Subtract => match a.checked_sub(b) {
            Some(v) => v,
            None => bail!("integer overflow"),
        },
        Multiply => match a.checked_mul(b) {
            Some(v) => v,
            None => bail!("integer overflow"),
        },
        Divide => {
            if b == 0 {
                bail!("division by zero");
            }
            a / b
        }
        Exponent => {
            if b < 0 {
                bail!("negative exponent");
            }
            let exp = u32::try_from(b).map_err(|_| anyhow::anyhow!("exponent too large"))?;
            match a.checked_pow(exp) {
                Some(v) => v,
                None => bail!("integer overflow"),
            }
        }
        Equal => (a == b) as i64,
        LessThan => (a < b) as i64,
        GreaterThan => (a > b) as i64,
    })
}
