//! cdb is a small relational database: a restricted SQL dialect compiled
//! per statement into a bytecode routine, executed against a single-file
//! (or in-memory) paged btree store with journaled atomic writes.
//!
//! System layers, bottom up:
//!
//! "storage" - random-access bytes over a file or a growable memory buffer.
pub mod storage;
// "pager" - fixed-size pages over storage: cache, reader/writer lock,
// journal-based atomic commit, allocation.
pub mod pager;
// "page" - the slotted-page layout within one page.
pub mod page;
// "btree" - ordered key/value trees over pages, with cursors and splits.
pub mod btree;
// "record" - typed tuple <-> bytes codec and the row id key codec.
pub mod record;
// "catalog" - in-memory mirror of the cdb_schema bootstrap table.
pub mod catalog;
// "parser" / "pt_to_ast" - SQL text to parse tree (pest) to AST.
pub mod parser;
pub mod pt_to_ast;
pub mod ast;
// "planner" - AST to logical tree, validated against the catalog.
mod plan;
mod planner;
// "codegen" - logical tree to bytecode routine.
mod codegen;
// "vm" - the register machine that executes routines.
pub mod vm;
// "db" - the database handle tying the pipeline together.
mod db;

pub mod formatting;
pub mod sql_type;
pub mod sql_value;

extern crate pest;
#[macro_use]
extern crate pest_derive;

pub use db::{open, Database, ExecResult, PreparedStatement};
pub use pt_to_ast::{is_terminated, tokenize};

/// Errors surfaced to callers, by category.  `VersionChanged` is an
/// internal signal consumed by the executor's retry loop; callers only
/// see it if they drive the VM directly.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("plan error: {0}")]
    Plan(String),
    #[error("runtime error: {0}")]
    Runtime(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("catalog version changed")]
    VersionChanged,
}

impl Error {
    /// The bare message, without the category prefix.
    pub fn message(&self) -> &str {
        match self {
            Error::Parse(m) | Error::Plan(m) | Error::Runtime(m) | Error::Storage(m) => m,
            Error::VersionChanged => "catalog version changed",
        }
    }
}

impl From<storage::Error> for Error {
    fn from(e: storage::Error) -> Error {
        Error::Storage(e.to_string())
    }
}

impl From<pager::Error> for Error {
    fn from(e: pager::Error) -> Error {
        Error::Storage(e.to_string())
    }
}

impl From<page::Error> for Error {
    fn from(e: page::Error) -> Error {
        Error::Runtime(e.to_string())
    }
}

impl From<record::Error> for Error {
    fn from(e: record::Error) -> Error {
        Error::Runtime(e.to_string())
    }
}

impl From<btree::Error> for Error {
    fn from(e: btree::Error) -> Error {
        match e {
            btree::Error::Pager(p) => Error::from(p),
            other => Error::Runtime(other.to_string()),
        }
    }
}

impl From<catalog::Error> for Error {
    fn from(e: catalog::Error) -> Error {
        match e {
            catalog::Error::Btree(b) => Error::from(b),
            other => Error::Runtime(other.to_string()),
        }
    }
}
