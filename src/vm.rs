//! Register-based virtual machine that executes compiled routines.
//!
//! A routine is a linear sequence of opcodes.  The program counter starts
//! at 0 and advances by one unless an opcode supplies a jump target;
//! `Halt` terminates.  Registers are a sparse integer-indexed map of
//! dynamically typed cells; an unwritten register reads as Null.
//!
//! Opcodes are side-effectful against the pager (through btree cursors)
//! and the register file only.  Cursors are kept in a small map keyed by
//! the cursor ids the opcodes carry; `Halt` releases all of them.  An
//! error from any opcode aborts the routine: a write transaction discards
//! its dirty pages (no journal has been written yet) and a read
//! transaction just releases the lock.

use std::collections::HashMap;
use std::sync::Mutex;

use enum_as_inner::EnumAsInner;

use crate::btree::{self, Cursor, RowIdAllocator};
use crate::catalog::{Catalog, SCHEMA_ROOT_PAGENUM};
use crate::pager::{PageNum, Pager};
use crate::record;
use crate::sql_type::SqlType;
use crate::sql_value::SqlValue;
use crate::Error;

/// One instruction.  The names are contractual; fields follow the
/// P1/P2/P3/P4 convention of the EXPLAIN listing (see `fields`).
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    /// Jump to the setup block appended at the routine's tail.
    Init { jump: usize },
    /// End execution; with `err` set, fail the statement with `msg`.
    Halt { err: bool, msg: Option<String> },
    Goto { jump: usize },
    /// Acquire the read or write lock and verify the catalog version.
    Transaction { write: bool },
    OpenRead { cursor: usize, root: PageNum },
    OpenWrite { cursor: usize, root: PageNum },
    /// Position at the first key; jump when the tree is empty.
    Rewind { cursor: usize, jump: usize },
    /// Advance; jump back to the loop head while rows remain.
    Next { cursor: usize, jump: usize },
    Prev { cursor: usize, jump: usize },
    /// Load the current key into a register.
    RowId { cursor: usize, reg: usize },
    /// Load one record cell of the current row into a register.
    Column { cursor: usize, column: usize, reg: usize },
    /// Emit registers [start, start+count) as a result row.
    ResultRow { start: usize, count: usize },
    Integer { value: i64, reg: usize },
    String { reg: usize, value: String },
    /// Load the positional parameter (1-based) bound by the caller.
    Variable { reg: usize, parameter: usize },
    Copy { src: usize, dst: usize },
    Add { lhs: usize, rhs: usize, dst: usize },
    Subtract { lhs: usize, rhs: usize, dst: usize },
    Multiply { lhs: usize, rhs: usize, dst: usize },
    Divide { lhs: usize, rhs: usize, dst: usize },
    Exponent { lhs: usize, rhs: usize, dst: usize },
    /// Comparisons jump when the relation holds.  Null never compares
    /// true, so it never jumps.
    Equal { lhs: usize, jump: usize, rhs: usize },
    NotEqual { lhs: usize, jump: usize, rhs: usize },
    Lt { lhs: usize, jump: usize, rhs: usize },
    Gte { lhs: usize, jump: usize, rhs: usize },
    /// Jump when the register is falsy (0 or Null).
    IfNot { reg: usize, jump: usize },
    MustBeInt { reg: usize },
    /// Encode registers [start, start+count) into record bytes.
    MakeRecord { start: usize, count: usize, dst: usize },
    /// Allocate the next row id for the tree rooted at `root`.
    NewRowId { root: PageNum, reg: usize },
    /// Probe for the key in `key_reg`; jump when it is absent, leaving
    /// the cursor positioned when it is present.
    NotExists { cursor: usize, jump: usize, key_reg: usize },
    /// Write the record in `value_reg` under the key in `key_reg`.
    Insert { cursor: usize, value_reg: usize, key_reg: usize },
    /// Remove the tuple under the cursor.
    Delete { cursor: usize },
    /// Total tuples in the tree, without a row loop.
    Count { cursor: usize, reg: usize },
    /// Allocate a fresh empty btree; its root page lands in `reg`.
    CreateBTree { reg: usize },
    /// Reload the in-memory catalog from cdb_schema.
    ParseSchema,
}

impl Op {
    /// (opcode, p1, p2, p3, p4) for the EXPLAIN listing.
    pub fn fields(&self) -> (&'static str, i64, i64, i64, String) {
        use Op::*;
        // The glob import above shadows the std String type with the
        // String opcode, so spell out the path once here.
        let s = std::string::String::new;
        match self {
            Init { jump } => ("Init", 0, *jump as i64, 0, s()),
            Halt { err, msg } => (
                "Halt",
                *err as i64,
                0,
                0,
                msg.clone().unwrap_or_default(),
            ),
            Goto { jump } => ("Goto", 0, *jump as i64, 0, s()),
            Transaction { write } => ("Transaction", *write as i64, 0, 0, s()),
            OpenRead { cursor, root } => ("OpenRead", *cursor as i64, *root as i64, 0, s()),
            OpenWrite { cursor, root } => ("OpenWrite", *cursor as i64, *root as i64, 0, s()),
            Rewind { cursor, jump } => ("Rewind", *cursor as i64, *jump as i64, 0, s()),
            Next { cursor, jump } => ("Next", *cursor as i64, *jump as i64, 0, s()),
            Prev { cursor, jump } => ("Prev", *cursor as i64, *jump as i64, 0, s()),
            RowId { cursor, reg } => ("RowId", *cursor as i64, *reg as i64, 0, s()),
            Column { cursor, column, reg } => {
                ("Column", *cursor as i64, *column as i64, *reg as i64, s())
            }
            ResultRow { start, count } => ("ResultRow", *start as i64, *count as i64, 0, s()),
            Integer { value, reg } => ("Integer", *value, *reg as i64, 0, s()),
            String { reg, value } => ("String", *reg as i64, 0, 0, value.clone()),
            Variable { reg, parameter } => ("Variable", *reg as i64, *parameter as i64, 0, s()),
            Copy { src, dst } => ("Copy", *src as i64, *dst as i64, 0, s()),
            Add { lhs, rhs, dst } => ("Add", *lhs as i64, *rhs as i64, *dst as i64, s()),
            Subtract { lhs, rhs, dst } => {
                ("Subtract", *lhs as i64, *rhs as i64, *dst as i64, s())
            }
            Multiply { lhs, rhs, dst } => {
                ("Multiply", *lhs as i64, *rhs as i64, *dst as i64, s())
            }
            Divide { lhs, rhs, dst } => ("Divide", *lhs as i64, *rhs as i64, *dst as i64, s()),
            Exponent { lhs, rhs, dst } => {
                ("Exponent", *lhs as i64, *rhs as i64, *dst as i64, s())
            }
            Equal { lhs, jump, rhs } => ("Equal", *lhs as i64, *jump as i64, *rhs as i64, s()),
            NotEqual { lhs, jump, rhs } => {
                ("NotEqual", *lhs as i64, *jump as i64, *rhs as i64, s())
            }
            Lt { lhs, jump, rhs } => ("Lt", *lhs as i64, *jump as i64, *rhs as i64, s()),
            Gte { lhs, jump, rhs } => ("Gte", *lhs as i64, *jump as i64, *rhs as i64, s()),
            IfNot { reg, jump } => ("IfNot", *reg as i64, *jump as i64, 0, s()),
            MustBeInt { reg } => ("MustBeInt", *reg as i64, 0, 0, s()),
            MakeRecord { start, count, dst } => {
                ("MakeRecord", *start as i64, *count as i64, *dst as i64, s())
            }
            NewRowId { root, reg } => ("NewRowId", *root as i64, *reg as i64, 0, s()),
            NotExists { cursor, jump, key_reg } => {
                ("NotExists", *cursor as i64, *jump as i64, *key_reg as i64, s())
            }
            Insert { cursor, value_reg, key_reg } => {
                ("Insert", *cursor as i64, *value_reg as i64, *key_reg as i64, s())
            }
            Delete { cursor } => ("Delete", *cursor as i64, 0, 0, s()),
            Count { cursor, reg } => ("Count", *cursor as i64, *reg as i64, 0, s()),
            CreateBTree { reg } => ("CreateBTree", 0, *reg as i64, 0, s()),
            ParseSchema => ("ParseSchema", 0, 0, 0, s()),
        }
    }
}

/// A compiled statement: the instruction list plus the result-set shape
/// and the catalog version it was planned against.
#[derive(Debug, Clone)]
pub struct Routine {
    pub ops: Vec<Op>,
    pub header: Vec<String>,
    pub column_types: Vec<SqlType>,
    pub catalog_version: u64,
}

/// One register cell.
#[derive(Debug, Clone, PartialEq, EnumAsInner)]
pub enum Reg {
    Int(i64),
    Text(String),
    Null,
    Bytes(Vec<u8>),
}

impl Reg {
    fn from_value(v: &SqlValue) -> Reg {
        match v {
            SqlValue::Int(i) => Reg::Int(*i),
            SqlValue::Text(t) => Reg::Text(t.clone()),
            SqlValue::Null() => Reg::Null,
        }
    }

    fn to_value(&self) -> Result<SqlValue, Error> {
        match self {
            Reg::Int(i) => Ok(SqlValue::Int(*i)),
            Reg::Text(t) => Ok(SqlValue::Text(t.clone())),
            Reg::Null => Ok(SqlValue::Null()),
            Reg::Bytes(_) => Err(Error::Runtime(String::from(
                "record bytes in a result row",
            ))),
        }
    }
}

/// Executes a routine.  Returns the emitted result rows.
pub fn run(
    pager: &Pager,
    catalog: &Mutex<Catalog>,
    row_ids: &RowIdAllocator,
    routine: &Routine,
    args: &[SqlValue],
) -> Result<Vec<Vec<SqlValue>>, Error> {
    let mut vm = Vm {
        pager,
        catalog,
        row_ids,
        args,
        regs: HashMap::new(),
        cursors: HashMap::new(),
        root_moves: HashMap::new(),
        tx: None,
        rows: vec![],
    };
    match vm.run_ops(routine) {
        Ok(()) => {
            vm.cursors.clear();
            match vm.tx.take() {
                Some(true) => pager.end_write().map_err(Error::from)?,
                Some(false) => pager.end_read(),
                None => {}
            }
            Ok(vm.rows)
        }
        Err(e) => {
            vm.cursors.clear();
            match vm.tx.take() {
                Some(true) => pager.rollback(),
                Some(false) => pager.end_read(),
                None => {}
            }
            Err(e)
        }
    }
}

struct Vm<'a> {
    pager: &'a Pager,
    catalog: &'a Mutex<Catalog>,
    row_ids: &'a RowIdAllocator,
    args: &'a [SqlValue],
    regs: HashMap<usize, Reg>,
    cursors: HashMap<usize, Cursor<'a>>,
    // Root pages that moved during this routine (root splits), so opcodes
    // carrying a root page immediate keep resolving.
    root_moves: HashMap<PageNum, PageNum>,
    // None: no transaction; Some(false): read; Some(true): write.
    tx: Option<bool>,
    rows: Vec<Vec<SqlValue>>,
}

fn runtime(msg: &str) -> Error {
    Error::Runtime(String::from(msg))
}

impl<'a> Vm<'a> {
    fn run_ops(&mut self, routine: &Routine) -> Result<(), Error> {
        let mut pc: usize = 0;
        loop {
            let op = routine
                .ops
                .get(pc)
                .ok_or_else(|| runtime("program counter ran off the routine"))?;
            pc = match self.step(op, pc, routine)? {
                Flow::Next => pc + 1,
                Flow::Jump(target) => target,
                Flow::Halt => return Ok(()),
            };
        }
    }

    fn step(&mut self, op: &Op, _pc: usize, routine: &Routine) -> Result<Flow, Error> {
        match op {
            Op::Init { jump } => Ok(Flow::Jump(*jump)),
            Op::Goto { jump } => Ok(Flow::Jump(*jump)),
            Op::Halt { err, msg } => {
                if *err {
                    let msg = msg.clone().unwrap_or_else(|| {
                        String::from("statement failed")
                    });
                    return Err(Error::Runtime(msg));
                }
                Ok(Flow::Halt)
            }
            Op::Transaction { write } => {
                let invalidated = if *write {
                    self.pager.begin_write()?
                } else {
                    self.pager.begin_read()?
                };
                self.tx = Some(*write);
                let mut catalog = self.catalog.lock().expect("lock poisoned");
                if invalidated {
                    // Another process committed; the in-memory view must
                    // match the persisted schema before anything runs.
                    catalog.parse_schema(self.pager).map_err(Error::from)?;
                }
                if catalog.version() != routine.catalog_version {
                    return Err(Error::VersionChanged);
                }
                Ok(Flow::Next)
            }
            Op::OpenRead { cursor, root } | Op::OpenWrite { cursor, root } => {
                let root = self.resolve_root(*root);
                self.cursors.insert(*cursor, Cursor::new(self.pager, root));
                Ok(Flow::Next)
            }
            Op::Rewind { cursor, jump } => {
                let c = self.cursor_mut(*cursor)?;
                if c.goto_first()? {
                    Ok(Flow::Next)
                } else {
                    Ok(Flow::Jump(*jump))
                }
            }
            Op::Next { cursor, jump } => {
                let c = self.cursor_mut(*cursor)?;
                if c.next()? {
                    Ok(Flow::Jump(*jump))
                } else {
                    Ok(Flow::Next)
                }
            }
            Op::Prev { cursor, jump } => {
                let c = self.cursor_mut(*cursor)?;
                if c.prev()? {
                    Ok(Flow::Jump(*jump))
                } else {
                    Ok(Flow::Next)
                }
            }
            Op::RowId { cursor, reg } => {
                let c = self.cursor_mut(*cursor)?;
                let key = c
                    .key()?
                    .ok_or_else(|| runtime("RowId on an unpositioned cursor"))?;
                let id = record::decode_row_id(&key).map_err(btree::Error::from)?;
                self.regs.insert(*reg, Reg::Int(id as i64));
                Ok(Flow::Next)
            }
            Op::Column { cursor, column, reg } => {
                let c = self.cursor_mut(*cursor)?;
                let value = c
                    .value()?
                    .ok_or_else(|| runtime("Column on an unpositioned cursor"))?;
                let cells = record::decode(&value).map_err(btree::Error::from)?;
                let cell = cells
                    .get(*column)
                    .cloned()
                    .unwrap_or(SqlValue::Null());
                self.regs.insert(*reg, Reg::from_value(&cell));
                Ok(Flow::Next)
            }
            Op::ResultRow { start, count } => {
                let mut row: Vec<SqlValue> = Vec::with_capacity(*count);
                for i in *start..*start + *count {
                    row.push(self.reg(i).to_value()?);
                }
                self.rows.push(row);
                Ok(Flow::Next)
            }
            Op::Integer { value, reg } => {
                self.regs.insert(*reg, Reg::Int(*value));
                Ok(Flow::Next)
            }
            Op::String { reg, value } => {
                self.regs.insert(*reg, Reg::Text(value.clone()));
                Ok(Flow::Next)
            }
            Op::Variable { reg, parameter } => {
                let v = self
                    .args
                    .get(parameter.wrapping_sub(1))
                    .cloned()
                    .unwrap_or(SqlValue::Null());
                self.regs.insert(*reg, Reg::from_value(&v));
                Ok(Flow::Next)
            }
            Op::Copy { src, dst } => {
                let v = self.reg(*src);
                self.regs.insert(*dst, v);
                Ok(Flow::Next)
            }
            Op::Add { lhs, rhs, dst } => self.arith(*lhs, *rhs, *dst, |a, b| {
                a.checked_add(b).ok_or_else(|| runtime("integer overflow"))
            }),
            Op::Subtract { lhs, rhs, dst } => self.arith(*lhs, *rhs, *dst, |a, b| {
                a.checked_sub(b).ok_or_else(|| runtime("integer overflow"))
            }),
            Op::Multiply { lhs, rhs, dst } => self.arith(*lhs, *rhs, *dst, |a, b| {
                a.checked_mul(b).ok_or_else(|| runtime("integer overflow"))
            }),
            Op::Divide { lhs, rhs, dst } => self.arith(*lhs, *rhs, *dst, |a, b| {
                if b == 0 {
                    return Err(runtime("division by zero"));
                }
                Ok(a / b)
            }),
            Op::Exponent { lhs, rhs, dst } => self.arith(*lhs, *rhs, *dst, |a, b| {
                if b < 0 {
                    return Err(runtime("negative exponent"));
                }
                let exp =
                    u32::try_from(b).map_err(|_| runtime("exponent too large"))?;
                a.checked_pow(exp)
                    .ok_or_else(|| runtime("integer overflow"))
            }),
            Op::Equal { lhs, jump, rhs } => {
                let holds = matches!(
                    self.compare(*lhs, *rhs),
                    Some(std::cmp::Ordering::Equal)
                );
                Ok(if holds { Flow::Jump(*jump) } else { Flow::Next })
            }
            Op::NotEqual { lhs, jump, rhs } => {
                let holds = matches!(
                    self.compare(*lhs, *rhs),
                    Some(std::cmp::Ordering::Less) | Some(std::cmp::Ordering::Greater)
                );
                Ok(if holds { Flow::Jump(*jump) } else { Flow::Next })
            }
            Op::Lt { lhs, jump, rhs } => {
                let holds =
                    matches!(self.compare(*lhs, *rhs), Some(std::cmp::Ordering::Less));
                Ok(if holds { Flow::Jump(*jump) } else { Flow::Next })
            }
            Op::Gte { lhs, jump, rhs } => {
                let holds = matches!(
                    self.compare(*lhs, *rhs),
                    Some(std::cmp::Ordering::Greater) | Some(std::cmp::Ordering::Equal)
                );
                Ok(if holds { Flow::Jump(*jump) } else { Flow::Next })
            }
            Op::IfNot { reg, jump } => {
                let falsy = match self.reg(*reg) {
                    Reg::Int(0) | Reg::Null => true,
                    _ => false,
                };
                Ok(if falsy { Flow::Jump(*jump) } else { Flow::Next })
            }
            Op::MustBeInt { reg } => match self.reg(*reg) {
                Reg::Int(_) => Ok(Flow::Next),
                _ => Err(runtime("expected integer operand")),
            },
            Op::MakeRecord { start, count, dst } => {
                let mut cells: Vec<SqlValue> = Vec::with_capacity(*count);
                for i in *start..*start + *count {
                    cells.push(self.reg(i).to_value()?);
                }
                self.regs.insert(*dst, Reg::Bytes(record::encode(&cells)));
                Ok(Flow::Next)
            }
            Op::NewRowId { root, reg } => {
                let root = self.resolve_root(*root);
                let id = self.row_ids.new_row_id(self.pager, root)?;
                self.regs.insert(*reg, Reg::Int(id as i64));
                Ok(Flow::Next)
            }
            Op::NotExists { cursor, jump, key_reg } => {
                let key = self.int_reg(*key_reg)?;
                if key < 1 {
                    return Err(runtime("rowid must be a positive integer"));
                }
                let c = self.cursor_mut(*cursor)?;
                if c.seek(&record::encode_row_id(key as u64))? {
                    Ok(Flow::Next)
                } else {
                    Ok(Flow::Jump(*jump))
                }
            }
            Op::Insert { cursor, value_reg, key_reg } => {
                let key = self.int_reg(*key_reg)?;
                if key < 1 {
                    return Err(runtime("rowid must be a positive integer"));
                }
                let data = match self.reg(*value_reg) {
                    Reg::Bytes(b) => b,
                    _ => return Err(runtime("Insert value register is not a record")),
                };
                let c = self.cursor_mut(*cursor)?;
                let old_root = c.tree_root();
                let moved = c.insert(&record::encode_row_id(key as u64), &data)?;
                let new_root = self.cursor_mut(*cursor)?.tree_root();
                if let Some(root) = moved {
                    debug_assert_eq!(root, new_root);
                    self.note_root_change(old_root, new_root)?;
                }
                self.row_ids.observe(new_root, key as u64);
                Ok(Flow::Next)
            }
            Op::Delete { cursor } => {
                let c = self.cursor_mut(*cursor)?;
                c.delete()?;
                Ok(Flow::Next)
            }
            Op::Count { cursor, reg } => {
                let root = self.cursor_mut(*cursor)?.tree_root();
                let total = btree::count(self.pager, root)?;
                self.regs.insert(*reg, Reg::Int(total as i64));
                Ok(Flow::Next)
            }
            Op::CreateBTree { reg } => {
                let root = btree::create(self.pager)?;
                self.regs.insert(*reg, Reg::Int(root as i64));
                Ok(Flow::Next)
            }
            Op::ParseSchema => {
                let mut catalog = self.catalog.lock().expect("lock poisoned");
                catalog.parse_schema(self.pager).map_err(Error::from)?;
                Ok(Flow::Next)
            }
        }
    }

    fn reg(&self, i: usize) -> Reg {
        self.regs.get(&i).cloned().unwrap_or(Reg::Null)
    }

    fn int_reg(&self, i: usize) -> Result<i64, Error> {
        match self.reg(i) {
            Reg::Int(v) => Ok(v),
            _ => Err(runtime("expected integer operand")),
        }
    }

    fn cursor_mut(&mut self, id: usize) -> Result<&mut Cursor<'a>, Error> {
        self.cursors
            .get_mut(&id)
            .ok_or_else(|| runtime("opcode names a cursor that was never opened"))
    }

    fn resolve_root(&self, mut root: PageNum) -> PageNum {
        // Follow root splits made earlier in this routine.
        while let Some(moved) = self.root_moves.get(&root) {
            root = *moved;
        }
        root
    }

    fn arith(
        &mut self,
        lhs: usize,
        rhs: usize,
        dst: usize,
        f: impl Fn(i64, i64) -> Result<i64, Error>,
    ) -> Result<Flow, Error> {
        let a = self.int_reg(lhs)?;
        let b = self.int_reg(rhs)?;
        self.regs.insert(dst, Reg::Int(f(a, b)?));
        Ok(Flow::Next)
    }

    fn compare(&self, lhs: usize, rhs: usize) -> Option<std::cmp::Ordering> {
        match (self.reg(lhs), self.reg(rhs)) {
            (Reg::Int(a), Reg::Int(b)) => Some(a.cmp(&b)),
            (Reg::Text(a), Reg::Text(b)) => Some(a.cmp(&b)),
            _ => None,
        }
    }

    /// A root split moved a tree: rewrite the table's cdb_schema row,
    /// repoint the in-memory catalog, and carry the row id high-water
    /// mark over.  The schema tree itself has no row to rewrite; it
    /// outgrowing its root is not supported.
    fn note_root_change(&mut self, old_root: PageNum, new_root: PageNum) -> Result<(), Error> {
        if old_root == SCHEMA_ROOT_PAGENUM {
            return Err(runtime("cdb_schema is full"));
        }
        self.root_moves.insert(old_root, new_root);
        self.row_ids.rekey(old_root, new_root);

        let mut schema_cursor = Cursor::new(self.pager, SCHEMA_ROOT_PAGENUM);
        let mut updated_table: Option<String> = None;
        if schema_cursor.goto_first()? {
            loop {
                let key = schema_cursor
                    .key()?
                    .ok_or_else(|| runtime("schema scan lost its position"))?;
                let value = schema_cursor
                    .value()?
                    .ok_or_else(|| runtime("schema scan lost its position"))?;
                let mut cells = record::decode(&value).map_err(btree::Error::from)?;
                if cells.get(3) == Some(&SqlValue::Int(old_root as i64)) {
                    cells[3] = SqlValue::Int(new_root as i64);
                    if let Some(SqlValue::Text(name)) = cells.get(1) {
                        updated_table = Some(name.clone());
                    }
                    // Same-size record: this rewrite can never split.
                    schema_cursor.insert(&key, &record::encode(&cells))?;
                    break;
                }
                if !schema_cursor.next()? {
                    break;
                }
            }
        }
        if let Some(name) = updated_table {
            let mut catalog = self.catalog.lock().expect("lock poisoned");
            catalog.set_root(&name, new_root);
            log::debug!("table {} moved to root page {}", name, new_root);
        }
        Ok(())
    }
}

enum Flow {
    Next,
    Jump(usize),
    Halt,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (Pager, Mutex<Catalog>, RowIdAllocator) {
        let pager = Pager::open_memory();
        pager.begin_write().unwrap();
        btree::create(&pager).unwrap();
        pager.end_write().unwrap();
        pager.begin_read().unwrap();
        let catalog = Catalog::load(&pager).unwrap();
        pager.end_read();
        (pager, Mutex::new(catalog), RowIdAllocator::new())
    }

    fn routine(ops: Vec<Op>, version: u64) -> Routine {
        Routine {
            ops,
            header: vec![],
            column_types: vec![],
            catalog_version: version,
        }
    }

    #[test]
    fn test_constant_routine_emits_row() {
        let (pager, catalog, row_ids) = fixture();
        // Init jumps to the tail setup, which loads a constant and jumps
        // back to the body.
        let r = routine(
            vec![
                Op::Init { jump: 3 },
                Op::ResultRow { start: 1, count: 1 },
                Op::Halt { err: false, msg: None },
                Op::Transaction { write: false },
                Op::Integer { value: 42, reg: 1 },
                Op::Goto { jump: 1 },
            ],
            1,
        );
        let rows = run(&pager, &catalog, &row_ids, &r, &[]).unwrap();
        assert_eq!(rows, vec![vec![SqlValue::Int(42)]]);
    }

    #[test]
    fn test_stale_catalog_version_aborts() {
        let (pager, catalog, row_ids) = fixture();
        let r = routine(
            vec![
                Op::Init { jump: 2 },
                Op::Halt { err: false, msg: None },
                Op::Transaction { write: false },
                Op::Goto { jump: 1 },
            ],
            99,
        );
        match run(&pager, &catalog, &row_ids, &r, &[]) {
            Err(Error::VersionChanged) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_halt_with_error_fails_statement() {
        let (pager, catalog, row_ids) = fixture();
        let r = routine(
            vec![
                Op::Init { jump: 2 },
                Op::Halt {
                    err: true,
                    msg: Some(String::from("pk unique constraint violated")),
                },
                Op::Transaction { write: false },
                Op::Goto { jump: 1 },
            ],
            1,
        );
        match run(&pager, &catalog, &row_ids, &r, &[]) {
            Err(Error::Runtime(msg)) => assert_eq!(msg, "pk unique constraint violated"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_arithmetic_type_errors() {
        let (pager, catalog, row_ids) = fixture();
        let r = routine(
            vec![
                Op::Init { jump: 4 },
                Op::Add { lhs: 1, rhs: 2, dst: 3 },
                Op::ResultRow { start: 3, count: 1 },
                Op::Halt { err: false, msg: None },
                Op::Transaction { write: false },
                Op::String { reg: 1, value: String::from("x") },
                Op::Integer { value: 1, reg: 2 },
                Op::Goto { jump: 1 },
            ],
            1,
        );
        match run(&pager, &catalog, &row_ids, &r, &[]) {
            Err(Error::Runtime(msg)) => assert_eq!(msg, "expected integer operand"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_division_by_zero_at_runtime() {
        let (pager, catalog, row_ids) = fixture();
        let r = routine(
            vec![
                Op::Init { jump: 3 },
                Op::Divide { lhs: 1, rhs: 2, dst: 3 },
                Op::Halt { err: false, msg: None },
                Op::Transaction { write: false },
                Op::Integer { value: 10, reg: 1 },
                Op::Integer { value: 0, reg: 2 },
                Op::Goto { jump: 1 },
            ],
            1,
        );
        match run(&pager, &catalog, &row_ids, &r, &[]) {
            Err(Error::Runtime(msg)) => assert_eq!(msg, "division by zero"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_variable_loads_bound_argument() {
        let (pager, catalog, row_ids) = fixture();
        let r = routine(
            vec![
                Op::Init { jump: 3 },
                Op::ResultRow { start: 1, count: 2 },
                Op::Halt { err: false, msg: None },
                Op::Transaction { write: false },
                Op::Variable { reg: 1, parameter: 1 },
                Op::Variable { reg: 2, parameter: 2 },
                Op::Goto { jump: 1 },
            ],
            1,
        );
        let rows = run(
            &pager,
            &catalog,
            &row_ids,
            &r,
            &[SqlValue::Int(7), SqlValue::Text(String::from("hi"))],
        )
        .unwrap();
        assert_eq!(
            rows,
            vec![vec![SqlValue::Int(7), SqlValue::Text(String::from("hi"))]]
        );
    }

    #[test]
    fn test_comparison_opcodes_jump_when_relation_holds() {
        let (pager, catalog, row_ids) = fixture();
        // Each comparison that holds jumps over a poison Halt.
        let r = routine(
            vec![
                Op::Init { jump: 10 },
                Op::Equal { lhs: 1, jump: 3, rhs: 1 },
                Op::Halt { err: true, msg: Some(String::from("equal failed")) },
                Op::NotEqual { lhs: 1, jump: 5, rhs: 2 },
                Op::Halt { err: true, msg: Some(String::from("notequal failed")) },
                Op::Lt { lhs: 1, jump: 7, rhs: 2 },
                Op::Halt { err: true, msg: Some(String::from("lt failed")) },
                Op::Gte { lhs: 2, jump: 9, rhs: 2 },
                Op::Halt { err: true, msg: Some(String::from("gte failed")) },
                Op::Halt { err: false, msg: None },
                Op::Transaction { write: false },
                Op::Integer { value: 10, reg: 1 },
                Op::Integer { value: 20, reg: 2 },
                Op::Goto { jump: 1 },
            ],
            1,
        );
        assert!(run(&pager, &catalog, &row_ids, &r, &[]).is_ok());
    }

    #[test]
    fn test_comparisons_with_null_never_jump() {
        let (pager, catalog, row_ids) = fixture();
        // Register 9 is never written and reads Null; no relation holds
        // against it, including NotEqual, so none of these jump into the
        // poison Halt at 5.
        let r = routine(
            vec![
                Op::Init { jump: 6 },
                Op::Equal { lhs: 1, jump: 5, rhs: 9 },
                Op::NotEqual { lhs: 1, jump: 5, rhs: 9 },
                Op::Gte { lhs: 1, jump: 5, rhs: 9 },
                Op::Halt { err: false, msg: None },
                Op::Halt { err: true, msg: Some(String::from("null comparison jumped")) },
                Op::Transaction { write: false },
                Op::Integer { value: 10, reg: 1 },
                Op::Goto { jump: 1 },
            ],
            1,
        );
        assert!(run(&pager, &catalog, &row_ids, &r, &[]).is_ok());

        let r = routine(
            vec![
                Op::Init { jump: 3 },
                Op::IfNot { reg: 9, jump: 2 },
                Op::Halt { err: false, msg: None },
                Op::Transaction { write: false },
                Op::Goto { jump: 1 },
            ],
            1,
        );
        // Null is falsy: IfNot jumps straight to Halt.
        assert!(run(&pager, &catalog, &row_ids, &r, &[]).is_ok());
    }

    #[test]
    fn test_unwritten_registers_read_null() {
        let (pager, catalog, row_ids) = fixture();
        let r = routine(
            vec![
                Op::Init { jump: 2 },
                Op::Halt { err: false, msg: None },
                Op::Transaction { write: false },
                Op::Goto { jump: 1 },
            ],
            1,
        );
        let rows = run(&pager, &catalog, &row_ids, &r, &[]).unwrap();
        assert_eq!(rows, Vec::<Vec<SqlValue>>::new());
        // And a MakeRecord over unwritten registers encodes two Nulls.
        let r = routine(
            vec![
                Op::Init { jump: 4 },
                Op::MakeRecord { start: 5, count: 2, dst: 9 },
                Op::ResultRow { start: 5, count: 2 },
                Op::Halt { err: false, msg: None },
                Op::Transaction { write: false },
                Op::Goto { jump: 1 },
            ],
            1,
        );
        let rows = run(&pager, &catalog, &row_ids, &r, &[]).unwrap();
        assert_eq!(rows, vec![vec![SqlValue::Null(), SqlValue::Null()]]);
    }
}
