//! Lowers logical trees into bytecode routines.
//!
//! Routine layout follows the tail-setup pattern: the routine begins with
//! an `Init` whose jump target is patched to a setup block appended after
//! the body.  The setup acquires the transaction, opens cursors, loads
//! every hoisted constant into its dedicated register, and jumps back to
//! the body, so execution flows
//!
//! ```text
//! Init -> Transaction + OpenCursor + constants -> (back to) body -> Halt
//! ```
//!
//! Plan nodes produce and consume instructions producer/consumer style:
//! a scan produces the loop skeleton, the projection inside consumes the
//! cursor position, and jump addresses are patched once the consumer's
//! end is known.

use anyhow::{bail, Result};

use crate::ast;
use crate::catalog::{self, SCHEMA_ROOT_PAGENUM};
use crate::plan::{self, Plan};
use crate::sql_type::SqlType;
use crate::vm::{Op, Routine};

pub fn compile(plan: &Plan, catalog_version: u64) -> Result<Routine> {
    let mut e = Emitter::new();
    let (header, column_types) = output_shape(plan);
    match plan {
        Plan::Project(p) => compile_select(&mut e, p)?,
        Plan::Insert(i) => compile_insert(&mut e, i)?,
        Plan::Update(u) => compile_update(&mut e, u)?,
        Plan::Delete(d) => compile_delete(&mut e, d)?,
        Plan::Create(c) => compile_create(&mut e, c)?,
        other => bail!("plan node {:?} cannot root a routine", other),
    }
    Ok(e.finish(header, column_types, catalog_version))
}

fn output_shape(plan: &Plan) -> (Vec<String>, Vec<SqlType>) {
    match plan {
        Plan::Project(p) => (
            p.cols.iter().map(|c| c.name.clone()).collect(),
            p.cols.iter().map(|c| c.col_type).collect(),
        ),
        _ => (vec![], vec![]),
    }
}

// ---------------------------------------------------------------------------
// Emitter
// ---------------------------------------------------------------------------

struct Emitter {
    // Body instructions; slot 0 is the Init, patched in finish().
    ops: Vec<Op>,
    // Tail setup: transaction, cursor opens, then hoisted constants in
    // the order compilation encountered them.
    setup: Vec<Op>,
    next_reg: usize,
    zero_reg: Option<usize>,
    one_reg: Option<usize>,
}

impl Emitter {
    fn new() -> Emitter {
        Emitter {
            ops: vec![Op::Init { jump: 0 }],
            setup: vec![],
            next_reg: 1,
            zero_reg: None,
            one_reg: None,
        }
    }

    fn emit(&mut self, op: Op) -> usize {
        self.ops.push(op);
        self.ops.len() - 1
    }

    fn next_addr(&self) -> usize {
        self.ops.len()
    }

    fn patch(&mut self, addr: usize, op: Op) {
        self.ops[addr] = op;
    }

    fn reg(&mut self) -> usize {
        let r = self.next_reg;
        self.next_reg += 1;
        r
    }

    fn reg_block(&mut self, n: usize) -> usize {
        let r = self.next_reg;
        self.next_reg += n;
        r
    }

    fn setup_op(&mut self, op: Op) {
        self.setup.push(op);
    }

    fn hoist_int(&mut self, value: i64) -> usize {
        let reg = self.reg();
        self.setup.push(Op::Integer { value, reg });
        reg
    }

    fn hoist_string(&mut self, value: &str) -> usize {
        let reg = self.reg();
        self.setup.push(Op::String {
            reg,
            value: String::from(value),
        });
        reg
    }

    fn hoist_variable(&mut self, parameter: usize) -> usize {
        let reg = self.reg();
        self.setup.push(Op::Variable { reg, parameter });
        reg
    }

    // Shared 0/1 constants for materializing comparison results.
    fn zero(&mut self) -> usize {
        match self.zero_reg {
            Some(r) => r,
            None => {
                let r = self.hoist_int(0);
                self.zero_reg = Some(r);
                r
            }
        }
    }

    fn one(&mut self) -> usize {
        match self.one_reg {
            Some(r) => r,
            None => {
                let r = self.hoist_int(1);
                self.one_reg = Some(r);
                r
            }
        }
    }

    fn finish(
        mut self,
        header: Vec<String>,
        column_types: Vec<SqlType>,
        catalog_version: u64,
    ) -> Routine {
        let tail = self.ops.len();
        self.ops[0] = Op::Init { jump: tail };
        self.ops.append(&mut self.setup);
        self.ops.push(Op::Goto { jump: 1 });
        Routine {
            ops: self.ops,
            header,
            column_types,
            catalog_version,
        }
    }
}

// The cursor and table an expression's column references resolve against.
struct RowCtx<'a> {
    cursor: usize,
    table: &'a catalog::Table,
}

/// Compiles an expression into a register and returns it.  Constants are
/// hoisted into the setup block; per-row reads and arithmetic stay in the
/// body.
fn compile_expr(e: &mut Emitter, expr: &ast::Expr, ctx: Option<&RowCtx>) -> Result<usize> {
    match expr {
        ast::Expr::IntLit(v) => Ok(e.hoist_int(*v)),
        ast::Expr::StringLit(s) => Ok(e.hoist_string(s)),
        // A fresh register that nothing writes reads as Null.
        ast::Expr::NullLit => Ok(e.reg()),
        ast::Expr::Variable(n) => Ok(e.hoist_variable(*n)),
        ast::Expr::ColumnRef(c) => {
            let ctx = match ctx {
                Some(ctx) => ctx,
                None => bail!("column {} referenced without a row context", c),
            };
            let reg = e.reg();
            let pk = ctx
                .table
                .primary_key()
                .map(|p| p.name == c.name)
                .unwrap_or(false);
            if pk {
                // The primary key is the btree key, not a record cell.
                e.emit(Op::RowId {
                    cursor: ctx.cursor,
                    reg,
                });
            } else {
                let column = match ctx.table.record_index(&c.name) {
                    Some(i) => i,
                    None => bail!("no such column: {}.{}", ctx.table.name, c.name),
                };
                e.emit(Op::Column {
                    cursor: ctx.cursor,
                    column,
                    reg,
                });
            }
            Ok(reg)
        }
        ast::Expr::Unary {
            op: ast::UnOp::Negate,
            expr,
        } => {
            let zero = e.zero();
            let operand = compile_expr(e, expr, ctx)?;
            let dst = e.reg();
            e.emit(Op::Subtract {
                lhs: zero,
                rhs: operand,
                dst,
            });
            Ok(dst)
        }
        ast::Expr::Function(f) => bail!("function {} has no expression form", f.name),
        ast::Expr::BinOp { lhs, op, rhs } => {
            let rl = compile_expr(e, lhs, ctx)?;
            let rr = compile_expr(e, rhs, ctx)?;
            let dst = e.reg();
            match op {
                ast::Op::Add => {
                    e.emit(Op::Add { lhs: rl, rhs: rr, dst });
                }
                ast::Op::Subtract => {
                    e.emit(Op::Subtract { lhs: rl, rhs: rr, dst });
                }
                ast::Op::Multiply => {
                    e.emit(Op::Multiply { lhs: rl, rhs: rr, dst });
                }
                ast::Op::Divide => {
                    e.emit(Op::Divide { lhs: rl, rhs: rr, dst });
                }
                ast::Op::Exponent => {
                    e.emit(Op::Exponent { lhs: rl, rhs: rr, dst });
                }
                ast::Op::Equal => compile_comparison(e, CmpKind::Equal, rl, rr, dst),
                ast::Op::LessThan => compile_comparison(e, CmpKind::Lt, rl, rr, dst),
                // a > b is b < a.
                ast::Op::GreaterThan => compile_comparison(e, CmpKind::Lt, rr, rl, dst),
            }
            Ok(dst)
        }
    }
}

enum CmpKind {
    Equal,
    Lt,
}

// Materializes a comparison as 0/1 in `dst` with a conditional jump:
//
//   Equal l, true, r
//   Copy zero -> dst
//   Goto end
// true:
//   Copy one -> dst
// end:
fn compile_comparison(e: &mut Emitter, kind: CmpKind, lhs: usize, rhs: usize, dst: usize) {
    let zero = e.zero();
    let one = e.one();
    let cmp_addr = e.emit(Op::Goto { jump: 0 }); // placeholder
    e.emit(Op::Copy { src: zero, dst });
    let goto_addr = e.emit(Op::Goto { jump: 0 });
    let true_addr = e.next_addr();
    e.emit(Op::Copy { src: one, dst });
    let end_addr = e.next_addr();
    let cmp = match kind {
        CmpKind::Equal => Op::Equal {
            lhs,
            jump: true_addr,
            rhs,
        },
        CmpKind::Lt => Op::Lt {
            lhs,
            jump: true_addr,
            rhs,
        },
    };
    e.patch(cmp_addr, cmp);
    e.patch(goto_addr, Op::Goto { jump: end_addr });
}

// Compiles the projection's output expressions into a contiguous register
// block and emits the ResultRow.
fn emit_row_output(
    e: &mut Emitter,
    cols: &[plan::OutputCol],
    ctx: Option<&RowCtx>,
) -> Result<()> {
    let block = e.reg_block(cols.len());
    for (i, col) in cols.iter().enumerate() {
        let src = compile_expr(e, &col.expr, ctx)?;
        e.emit(Op::Copy {
            src,
            dst: block + i,
        });
    }
    e.emit(Op::ResultRow {
        start: block,
        count: cols.len(),
    });
    Ok(())
}

// ---------------------------------------------------------------------------
// SELECT
// ---------------------------------------------------------------------------

fn compile_select(e: &mut Emitter, p: &plan::Project) -> Result<()> {
    match p.input.as_ref() {
        Plan::ConstantRow(_) => {
            e.setup_op(Op::Transaction { write: false });
            emit_row_output(e, &p.cols, None)?;
            e.emit(Op::Halt {
                err: false,
                msg: None,
            });
        }
        Plan::Count(c) => {
            e.setup_op(Op::Transaction { write: false });
            e.setup_op(Op::OpenRead {
                cursor: 0,
                root: c.table.root_page,
            });
            let reg = e.reg();
            e.emit(Op::Count { cursor: 0, reg });
            e.emit(Op::ResultRow {
                start: reg,
                count: 1,
            });
            e.emit(Op::Halt {
                err: false,
                msg: None,
            });
        }
        Plan::Scan(s) => {
            e.setup_op(Op::Transaction { write: false });
            e.setup_op(Op::OpenRead {
                cursor: 0,
                root: s.table.root_page,
            });
            let ctx = RowCtx {
                cursor: 0,
                table: &s.table,
            };
            let rewind_addr = e.emit(Op::Goto { jump: 0 }); // placeholder
            let loop_start = e.next_addr();
            emit_row_output(e, &p.cols, Some(&ctx))?;
            e.emit(Op::Next {
                cursor: 0,
                jump: loop_start,
            });
            let halt_addr = e.emit(Op::Halt {
                err: false,
                msg: None,
            });
            e.patch(
                rewind_addr,
                Op::Rewind {
                    cursor: 0,
                    jump: halt_addr,
                },
            );
        }
        Plan::Filter(f) => {
            let s = match f.input.as_ref() {
                Plan::Scan(s) => s,
                other => bail!("filter over {:?} is not supported", other),
            };
            e.setup_op(Op::Transaction { write: false });
            e.setup_op(Op::OpenRead {
                cursor: 0,
                root: s.table.root_page,
            });
            let ctx = RowCtx {
                cursor: 0,
                table: &s.table,
            };
            let rewind_addr = e.emit(Op::Goto { jump: 0 });
            let loop_start = e.next_addr();
            let pred = compile_expr(e, &f.predicate, Some(&ctx))?;
            let ifnot_addr = e.emit(Op::Goto { jump: 0 });
            emit_row_output(e, &p.cols, Some(&ctx))?;
            let next_addr = e.emit(Op::Next {
                cursor: 0,
                jump: loop_start,
            });
            let halt_addr = e.emit(Op::Halt {
                err: false,
                msg: None,
            });
            e.patch(
                rewind_addr,
                Op::Rewind {
                    cursor: 0,
                    jump: halt_addr,
                },
            );
            e.patch(
                ifnot_addr,
                Op::IfNot {
                    reg: pred,
                    jump: next_addr,
                },
            );
        }
        Plan::Seek(s) => {
            e.setup_op(Op::Transaction { write: false });
            e.setup_op(Op::OpenRead {
                cursor: 0,
                root: s.table.root_page,
            });
            let ctx = RowCtx {
                cursor: 0,
                table: &s.table,
            };
            let key_reg = e.hoist_int(s.key);
            let probe_addr = e.emit(Op::Goto { jump: 0 });
            emit_row_output(e, &p.cols, Some(&ctx))?;
            let halt_addr = e.emit(Op::Halt {
                err: false,
                msg: None,
            });
            e.patch(
                probe_addr,
                Op::NotExists {
                    cursor: 0,
                    jump: halt_addr,
                    key_reg,
                },
            );
        }
        other => bail!("projection over {:?} is not supported", other),
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// INSERT
// ---------------------------------------------------------------------------

fn compile_insert(e: &mut Emitter, i: &plan::Insert) -> Result<()> {
    e.setup_op(Op::Transaction { write: true });
    e.setup_op(Op::OpenWrite {
        cursor: 0,
        root: i.table.root_page,
    });
    for row in &i.rows {
        let key_reg = match &row.key {
            Some(expr) => {
                // Supplied primary key: it must be an integer and must
                // not already exist.
                let reg = compile_expr(e, expr, None)?;
                e.emit(Op::MustBeInt { reg });
                let probe_addr = e.emit(Op::Goto { jump: 0 });
                e.emit(Op::Halt {
                    err: true,
                    msg: Some(String::from("pk unique constraint violated")),
                });
                let ok_addr = e.next_addr();
                e.patch(
                    probe_addr,
                    Op::NotExists {
                        cursor: 0,
                        jump: ok_addr,
                        key_reg: reg,
                    },
                );
                reg
            }
            None => {
                let reg = e.reg();
                e.emit(Op::NewRowId {
                    root: i.table.root_page,
                    reg,
                });
                reg
            }
        };
        let block = e.reg_block(row.record.len());
        for (j, cell) in row.record.iter().enumerate() {
            if let Some(expr) = cell {
                let src = compile_expr(e, expr, None)?;
                e.emit(Op::Copy {
                    src,
                    dst: block + j,
                });
            }
            // Omitted columns stay Null: the block register is never
            // written.
        }
        let rec = e.reg();
        e.emit(Op::MakeRecord {
            start: block,
            count: row.record.len(),
            dst: rec,
        });
        e.emit(Op::Insert {
            cursor: 0,
            value_reg: rec,
            key_reg,
        });
    }
    e.emit(Op::Halt {
        err: false,
        msg: None,
    });
    Ok(())
}

// ---------------------------------------------------------------------------
// UPDATE / DELETE
// ---------------------------------------------------------------------------

// The scan-loop skeleton shared by UPDATE and DELETE: Rewind, an optional
// predicate test, a per-row body, Next, Halt.
fn compile_write_loop(
    e: &mut Emitter,
    table: &catalog::Table,
    input: &Plan,
    body: impl FnOnce(&mut Emitter, &RowCtx) -> Result<()>,
) -> Result<()> {
    let predicate = match input {
        Plan::Scan(_) => None,
        Plan::Filter(f) => match f.input.as_ref() {
            Plan::Scan(_) => Some(&f.predicate),
            other => bail!("filter over {:?} is not supported", other),
        },
        other => bail!("write loop over {:?} is not supported", other),
    };
    e.setup_op(Op::Transaction { write: true });
    e.setup_op(Op::OpenWrite {
        cursor: 0,
        root: table.root_page,
    });
    let ctx = RowCtx { cursor: 0, table };
    let rewind_addr = e.emit(Op::Goto { jump: 0 });
    let loop_start = e.next_addr();
    let ifnot_addr = match predicate {
        Some(p) => {
            let pred = compile_expr(e, p, Some(&ctx))?;
            Some((e.emit(Op::Goto { jump: 0 }), pred))
        }
        None => None,
    };
    body(e, &ctx)?;
    let next_addr = e.emit(Op::Next {
        cursor: 0,
        jump: loop_start,
    });
    let halt_addr = e.emit(Op::Halt {
        err: false,
        msg: None,
    });
    e.patch(
        rewind_addr,
        Op::Rewind {
            cursor: 0,
            jump: halt_addr,
        },
    );
    if let Some((addr, pred)) = ifnot_addr {
        e.patch(
            addr,
            Op::IfNot {
                reg: pred,
                jump: next_addr,
            },
        );
    }
    Ok(())
}

fn compile_update(e: &mut Emitter, u: &plan::Update) -> Result<()> {
    compile_write_loop(e, &u.table, &u.input, |e, ctx| {
        let block = e.reg_block(u.exprs.len());
        for (j, expr) in u.exprs.iter().enumerate() {
            let src = compile_expr(e, expr, Some(ctx))?;
            e.emit(Op::Copy {
                src,
                dst: block + j,
            });
        }
        let rec = e.reg();
        e.emit(Op::MakeRecord {
            start: block,
            count: u.exprs.len(),
            dst: rec,
        });
        let rid = e.reg();
        e.emit(Op::RowId {
            cursor: ctx.cursor,
            reg: rid,
        });
        e.emit(Op::Insert {
            cursor: ctx.cursor,
            value_reg: rec,
            key_reg: rid,
        });
        Ok(())
    })
}

fn compile_delete(e: &mut Emitter, d: &plan::Delete) -> Result<()> {
    compile_write_loop(e, &d.table, &d.input, |e, ctx| {
        e.emit(Op::Delete { cursor: ctx.cursor });
        Ok(())
    })
}

// ---------------------------------------------------------------------------
// CREATE TABLE
// ---------------------------------------------------------------------------

fn compile_create(e: &mut Emitter, c: &plan::Create) -> Result<()> {
    if c.noop {
        // IF NOT EXISTS found the table; the routine only proves the
        // catalog version still matches.
        e.setup_op(Op::Transaction { write: false });
        e.emit(Op::Halt {
            err: false,
            msg: None,
        });
        return Ok(());
    }
    e.setup_op(Op::Transaction { write: true });
    e.setup_op(Op::OpenWrite {
        cursor: 0,
        root: SCHEMA_ROOT_PAGENUM,
    });

    let root_reg = e.reg();
    e.emit(Op::CreateBTree { reg: root_reg });
    let id_reg = e.reg();
    e.emit(Op::NewRowId {
        root: SCHEMA_ROOT_PAGENUM,
        reg: id_reg,
    });

    // cdb_schema record: type, name, table_name, rootpage, sql.
    let block = e.reg_block(5);
    let type_reg = e.hoist_string("table");
    let name_reg = e.hoist_string(&c.tablename);
    let json_reg = e.hoist_string(&c.column_json);
    e.emit(Op::Copy {
        src: type_reg,
        dst: block,
    });
    e.emit(Op::Copy {
        src: name_reg,
        dst: block + 1,
    });
    e.emit(Op::Copy {
        src: name_reg,
        dst: block + 2,
    });
    e.emit(Op::Copy {
        src: root_reg,
        dst: block + 3,
    });
    e.emit(Op::Copy {
        src: json_reg,
        dst: block + 4,
    });
    let rec = e.reg();
    e.emit(Op::MakeRecord {
        start: block,
        count: 5,
        dst: rec,
    });
    e.emit(Op::Insert {
        cursor: 0,
        value_reg: rec,
        key_reg: id_reg,
    });
    e.emit(Op::ParseSchema);
    e.emit(Op::Halt {
        err: false,
        msg: None,
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(name: &str, pk: bool) -> catalog::Table {
        let mut columns = vec![];
        if pk {
            columns.push(catalog::Column {
                name: String::from("id"),
                col_type: SqlType::Integer,
                primary_key: true,
            });
        }
        columns.push(catalog::Column {
            name: String::from("a"),
            col_type: SqlType::Integer,
            primary_key: false,
        });
        catalog::Table {
            name: String::from(name),
            root_page: 2,
            columns,
        }
    }

    fn scan_project(t: &catalog::Table) -> Plan {
        Plan::Project(plan::Project {
            cols: t
                .columns
                .iter()
                .map(|c| plan::OutputCol {
                    expr: ast::Expr::ColumnRef(ast::ColName {
                        name: c.name.clone(),
                    }),
                    name: c.name.clone(),
                    col_type: c.col_type,
                })
                .collect(),
            input: Box::new(Plan::Scan(plan::Scan { table: t.clone() })),
        })
    }

    #[test]
    fn test_init_jumps_to_tail_and_tail_jumps_back() {
        let t = table("t", true);
        let routine = compile(&scan_project(&t), 1).unwrap();
        // First op is Init targeting the first tail address.
        let tail = match routine.ops[0] {
            Op::Init { jump } => jump,
            ref other => panic!("expected Init, found {:?}", other),
        };
        assert!(matches!(routine.ops[tail], Op::Transaction { write: false }));
        assert!(matches!(routine.ops[tail + 1], Op::OpenRead { cursor: 0, root: 2 }));
        // The tail ends jumping back to the body start.
        assert_eq!(routine.ops.last(), Some(&Op::Goto { jump: 1 }));
        // The header mirrors the projection.
        assert_eq!(routine.header, vec!["id", "a"]);
        assert_eq!(
            routine.column_types,
            vec![SqlType::Integer, SqlType::Integer]
        );
    }

    #[test]
    fn test_scan_loop_shape() {
        let t = table("t", true);
        let routine = compile(&scan_project(&t), 1).unwrap();
        // Body: Rewind, RowId (pk), Column, copies, ResultRow, Next, Halt.
        let rewind_jump = match routine.ops[1] {
            Op::Rewind { cursor: 0, jump } => jump,
            ref other => panic!("expected Rewind, found {:?}", other),
        };
        assert!(matches!(routine.ops[rewind_jump], Op::Halt { err: false, .. }));
        assert!(routine
            .ops
            .iter()
            .any(|op| matches!(op, Op::RowId { cursor: 0, .. })));
        assert!(routine
            .ops
            .iter()
            .any(|op| matches!(op, Op::Column { cursor: 0, column: 0, .. })));
        let next = routine
            .ops
            .iter()
            .find_map(|op| match op {
                Op::Next { jump, .. } => Some(*jump),
                _ => None,
            })
            .expect("scan emits Next");
        assert_eq!(next, 2); // loop head, right after Rewind
    }

    #[test]
    fn test_insert_with_pk_emits_probe_then_halt() {
        let t = table("t", true);
        let p = Plan::Insert(plan::Insert {
            table: t,
            rows: vec![plan::InsertRow {
                key: Some(ast::Expr::IntLit(1)),
                record: vec![Some(ast::Expr::IntLit(5))],
            }],
        });
        let routine = compile(&p, 1).unwrap();
        let probe_at = routine
            .ops
            .iter()
            .position(|op| matches!(op, Op::NotExists { .. }))
            .expect("probe emitted");
        match &routine.ops[probe_at + 1] {
            Op::Halt { err: true, msg } => {
                assert_eq!(msg.as_deref(), Some("pk unique constraint violated"))
            }
            other => panic!("expected failing Halt after probe, found {:?}", other),
        }
        match &routine.ops[probe_at] {
            Op::NotExists { jump, .. } => assert_eq!(*jump, probe_at + 2),
            _ => unreachable!(),
        }
        assert!(routine
            .ops
            .iter()
            .any(|op| matches!(op, Op::MustBeInt { .. })));
    }

    #[test]
    fn test_insert_without_pk_allocates_row_id() {
        let t = table("t", true);
        let p = Plan::Insert(plan::Insert {
            table: t,
            rows: vec![plan::InsertRow {
                key: None,
                record: vec![Some(ast::Expr::IntLit(5))],
            }],
        });
        let routine = compile(&p, 1).unwrap();
        assert!(routine
            .ops
            .iter()
            .any(|op| matches!(op, Op::NewRowId { root: 2, .. })));
        assert!(!routine
            .ops
            .iter()
            .any(|op| matches!(op, Op::NotExists { .. })));
    }

    #[test]
    fn test_constants_are_hoisted_into_tail() {
        let p = Plan::Project(plan::Project {
            cols: vec![plan::OutputCol {
                expr: ast::Expr::IntLit(42),
                name: String::from("42"),
                col_type: SqlType::Integer,
            }],
            input: Box::new(Plan::ConstantRow(plan::ConstantRow {
                exprs: vec![ast::Expr::IntLit(42)],
            })),
        });
        let routine = compile(&p, 1).unwrap();
        let tail = match routine.ops[0] {
            Op::Init { jump } => jump,
            _ => unreachable!(),
        };
        let const_at = routine
            .ops
            .iter()
            .position(|op| matches!(op, Op::Integer { value: 42, .. }))
            .expect("constant load emitted");
        assert!(const_at >= tail, "constant should live in the tail setup");
    }

    #[test]
    fn test_create_routine_shape() {
        let p = Plan::Create(plan::Create {
            tablename: String::from("person"),
            columns: vec![],
            column_json: String::from("{\"columns\":[]}"),
            noop: false,
        });
        let routine = compile(&p, 1).unwrap();
        let expect = |pred: fn(&Op) -> bool, what: &str| {
            routine
                .ops
                .iter()
                .position(pred)
                .unwrap_or_else(|| panic!("missing {}", what))
        };
        let create = expect(|op| matches!(op, Op::CreateBTree { .. }), "CreateBTree");
        let insert = expect(|op| matches!(op, Op::Insert { .. }), "Insert");
        let parse = expect(|op| matches!(op, Op::ParseSchema), "ParseSchema");
        assert!(create < insert && insert < parse);
        assert!(routine.ops.iter().any(|op| matches!(
            op,
            Op::OpenWrite {
                cursor: 0,
                root: SCHEMA_ROOT_PAGENUM
            }
        )));
    }

    #[test]
    fn test_explain_fields_render() {
        let t = table("t", true);
        let routine = compile(&scan_project(&t), 1).unwrap();
        let (name, _, p2, _, _) = routine.ops[0].fields();
        assert_eq!(name, "Init");
        assert!(p2 > 0);
    }
}
