//! Defines the `Database` type: one open database handle, driving the
//! parse → plan → compile → execute pipeline.
//!
//! The handle owns the pager, the in-memory catalog and the row id
//! allocator, and passes them explicitly to the planner and VM.  Exactly
//! one routine executes at a time per handle; concurrency between handles
//! (or processes) is mediated entirely by the pager.

use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::ast;
use crate::btree::{self, RowIdAllocator};
use crate::catalog::{Catalog, SCHEMA_ROOT_PAGENUM};
use crate::codegen;
use crate::pager::Pager;
use crate::planner;
use crate::pt_to_ast;
use crate::sql_type::SqlType;
use crate::sql_value::SqlValue;
use crate::vm::{self, Routine};
use crate::Error;

/// How many times a statement is recompiled and retried after the
/// catalog moved underneath its routine.
const MAX_RECOMPILES: usize = 5;

/// Result of executing one statement.
#[derive(Debug, Clone)]
pub struct ExecResult {
    pub header: Vec<String>,
    /// One entry per result row; a cell is None when the value is NULL.
    pub rows: Vec<Vec<Option<String>>>,
    pub column_types: Vec<SqlType>,
    /// The statement text this result answers.
    pub text: String,
    pub duration: Duration,
    pub error: Option<Error>,
}

pub struct Database {
    pager: Pager,
    catalog: Mutex<Catalog>,
    row_ids: RowIdAllocator,
}

/// Opens a database.  A path of ":memory:" selects the in-memory
/// backend; anything else is a file path, created if missing.
pub fn open(path: &str) -> Result<Database, Error> {
    let pager = if path == ":memory:" {
        Pager::open_memory()
    } else {
        Pager::open(Path::new(path))?
    };

    // A fresh store has no pages; allocate the schema tree at page 1.
    // The check runs under the write lock so two handles bootstrapping
    // the same file cannot both allocate.
    pager.begin_write()?;
    if pager.max_page() < SCHEMA_ROOT_PAGENUM {
        let root = btree::create(&pager)?;
        debug_assert_eq!(root, SCHEMA_ROOT_PAGENUM);
    }
    pager.end_write()?;

    pager.begin_read()?;
    let catalog = Catalog::load(&pager);
    pager.end_read();
    let catalog = catalog?;

    Ok(Database {
        pager,
        catalog: Mutex::new(catalog),
        row_ids: RowIdAllocator::new(),
    })
}

impl Database {
    /// Parses and executes one statement with no bound parameters.
    pub fn execute(&self, sql: &str) -> ExecResult {
        self.execute_with_args(sql, &[])
    }

    pub fn execute_with_args(&self, sql: &str, args: &[SqlValue]) -> ExecResult {
        let started = Instant::now();
        match self.run_sql(sql, args) {
            Ok(output) => ExecResult {
                header: output.header,
                rows: output
                    .rows
                    .iter()
                    .map(|row| row.iter().map(render_cell).collect())
                    .collect(),
                column_types: output.column_types,
                text: String::from(sql),
                duration: started.elapsed(),
                error: None,
            },
            Err(e) => ExecResult {
                header: vec![],
                rows: vec![],
                column_types: vec![],
                text: String::from(sql),
                duration: started.elapsed(),
                error: Some(e),
            },
        }
    }

    /// Parses a statement for later execution with bound parameters.
    pub fn prepare(&self, sql: &str) -> Result<PreparedStatement, Error> {
        let stmt =
            pt_to_ast::parse_statement(sql).map_err(|e| Error::Parse(e.to_string()))?;
        Ok(PreparedStatement {
            db: self,
            stmt,
            sql: String::from(sql),
            args: vec![],
        })
    }

    fn run_sql(&self, sql: &str, args: &[SqlValue]) -> Result<RunOutput, Error> {
        let stmt =
            pt_to_ast::parse_statement(sql).map_err(|e| Error::Parse(e.to_string()))?;
        self.run_parsed(&stmt, args)
    }

    fn run_parsed(&self, stmt: &ast::Statement, args: &[SqlValue]) -> Result<RunOutput, Error> {
        if let ast::Statement::Explain(kind, inner) = stmt {
            return self.explain(*kind, inner);
        }
        let mut refreshed = false;
        for _ in 0..MAX_RECOMPILES {
            let routine = match self.compile(stmt) {
                Ok(r) => r,
                // Planning may fail only because this handle's catalog is
                // stale (another process committed DDL).  Refresh it once
                // and replan before giving up.
                Err(e) => {
                    if !refreshed {
                        refreshed = true;
                        if self.refresh_catalog()? {
                            continue;
                        }
                    }
                    return Err(e);
                }
            };
            match vm::run(&self.pager, &self.catalog, &self.row_ids, &routine, args) {
                // The catalog moved between planning and execution;
                // recompile against the current schema and retry.
                Err(Error::VersionChanged) => continue,
                Err(e) => return Err(e),
                Ok(rows) => {
                    return Ok(RunOutput {
                        header: routine.header,
                        column_types: routine.column_types,
                        rows,
                    })
                }
            }
        }
        Err(Error::Runtime(String::from(
            "catalog kept changing during execution",
        )))
    }

    /// Revalidates the page cache and reloads the catalog if another
    /// process committed since we last looked.  Returns whether anything
    /// changed.
    fn refresh_catalog(&self) -> Result<bool, Error> {
        let invalidated = self.pager.begin_read()?;
        let result = if invalidated {
            let mut catalog = self.catalog.lock().expect("lock poisoned");
            catalog.parse_schema(&self.pager).map(|_| true).map_err(Error::from)
        } else {
            Ok(false)
        };
        self.pager.end_read();
        result
    }

    fn compile(&self, stmt: &ast::Statement) -> Result<Routine, Error> {
        let catalog = self.catalog.lock().expect("lock poisoned");
        let plan = planner::plan_statement(&catalog, stmt)
            .map_err(|e| Error::Plan(e.to_string()))?;
        codegen::compile(&plan, catalog.version()).map_err(|e| Error::Plan(e.to_string()))
    }

    fn explain(&self, kind: ast::ExplainKind, stmt: &ast::Statement) -> Result<RunOutput, Error> {
        match kind {
            ast::ExplainKind::QueryPlan => {
                let catalog = self.catalog.lock().expect("lock poisoned");
                let plan = planner::plan_statement(&catalog, stmt)
                    .map_err(|e| Error::Plan(e.to_string()))?;
                let rows: Vec<Vec<SqlValue>> = plan
                    .format()
                    .lines()
                    .map(|line| vec![SqlValue::Text(String::from(line))])
                    .collect();
                Ok(RunOutput {
                    header: vec![String::from("detail")],
                    column_types: vec![SqlType::Text],
                    rows,
                })
            }
            ast::ExplainKind::Bytecode => {
                let routine = self.compile(stmt)?;
                let rows: Vec<Vec<SqlValue>> = routine
                    .ops
                    .iter()
                    .enumerate()
                    .map(|(addr, op)| {
                        let (name, p1, p2, p3, p4) = op.fields();
                        vec![
                            SqlValue::Int(addr as i64),
                            SqlValue::Text(String::from(name)),
                            SqlValue::Int(p1),
                            SqlValue::Int(p2),
                            SqlValue::Int(p3),
                            SqlValue::Text(p4),
                        ]
                    })
                    .collect();
                Ok(RunOutput {
                    header: ["addr", "opcode", "p1", "p2", "p3", "p4"]
                        .iter()
                        .map(|s| String::from(*s))
                        .collect(),
                    column_types: vec![
                        SqlType::Integer,
                        SqlType::Text,
                        SqlType::Integer,
                        SqlType::Integer,
                        SqlType::Integer,
                        SqlType::Text,
                    ],
                    rows,
                })
            }
        }
    }
}

struct RunOutput {
    header: Vec<String>,
    column_types: Vec<SqlType>,
    rows: Vec<Vec<SqlValue>>,
}

fn render_cell(v: &SqlValue) -> Option<String> {
    match v {
        SqlValue::Int(i) => Some(i.to_string()),
        SqlValue::Text(t) => Some(t.clone()),
        SqlValue::Null() => None,
    }
}

/// A parsed statement plus its bound parameters.  Positions are 1-based;
/// unbound parameters read as NULL.  May be executed repeatedly.
pub struct PreparedStatement<'db> {
    db: &'db Database,
    stmt: ast::Statement,
    sql: String,
    args: Vec<SqlValue>,
}

impl<'db> PreparedStatement<'db> {
    pub fn bind_int(&mut self, position: usize, value: i64) {
        self.bind(position, SqlValue::Int(value));
    }

    pub fn bind_string(&mut self, position: usize, value: &str) {
        self.bind(position, SqlValue::Text(String::from(value)));
    }

    fn bind(&mut self, position: usize, value: SqlValue) {
        if position == 0 {
            return;
        }
        if self.args.len() < position {
            self.args.resize(position, SqlValue::Null());
        }
        self.args[position - 1] = value;
    }

    pub fn execute(&mut self) -> ExecResult {
        let started = Instant::now();
        match self.db.run_parsed(&self.stmt, &self.args) {
            Ok(output) => ExecResult {
                header: output.header,
                rows: output
                    .rows
                    .iter()
                    .map(|row| row.iter().map(render_cell).collect())
                    .collect(),
                column_types: output.column_types,
                text: self.sql.clone(),
                duration: started.elapsed(),
                error: None,
            },
            Err(e) => ExecResult {
                header: vec![],
                rows: vec![],
                column_types: vec![],
                text: self.sql.clone(),
                duration: started.elapsed(),
                error: Some(e),
            },
        }
    }
}
