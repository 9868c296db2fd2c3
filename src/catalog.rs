//! In-memory catalog, mirrored from the bootstrap `cdb_schema` table.
//!
//! `cdb_schema` is an ordinary btree rooted at page 1 with columns
//! `{id, type, name, table_name, rootpage, sql}`.  Each user table
//! contributes one row; the `sql` column holds the table's column list as
//! JSON.  The catalog is the parsed form the planner and VM consult, plus
//! a version token that changes on every mutation so compiled routines can
//! detect that they were planned against a stale schema.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::btree;
use crate::pager::{PageNum, Pager};
use crate::record;
use crate::sql_type::SqlType;
use crate::sql_value::SqlValue;

pub const SCHEMA_TABLE_NAME: &str = "cdb_schema";
pub const SCHEMA_ROOT_PAGENUM: PageNum = 1;

// Record cell positions within a cdb_schema row (the id column is the
// btree key, not a record cell).
const SCHEMA_REC_TYPE: usize = 0;
const SCHEMA_REC_NAME: usize = 1;
const SCHEMA_REC_TABLE_NAME: usize = 2;
const SCHEMA_REC_ROOTPAGE: usize = 3;
const SCHEMA_REC_SQL: usize = 4;
const SCHEMA_REC_CELLS: usize = 5;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Btree(#[from] btree::Error),
    #[error(transparent)]
    Record(#[from] record::Error),
    #[error("Malformed cdb_schema row: {0}")]
    BadSchemaRow(String),
    #[error("Malformed column list JSON: {0}")]
    BadColumnList(String),
}

/// One column definition.  Serializes to the exact JSON shape stored in
/// the `sql` column: `{"name":…,"type":…,"primaryKey":…}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub col_type: SqlType,
    #[serde(rename = "primaryKey")]
    pub primary_key: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnList {
    pub columns: Vec<Column>,
}

impl ColumnList {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("column list serializes")
    }

    pub fn from_json(s: &str) -> Result<ColumnList, Error> {
        serde_json::from_str(s).map_err(|e| Error::BadColumnList(e.to_string()))
    }
}

/// One table as the planner sees it.
#[derive(Debug, Clone)]
pub struct Table {
    pub name: String,
    pub root_page: PageNum,
    pub columns: Vec<Column>,
}

impl Table {
    pub fn primary_key(&self) -> Option<&Column> {
        self.columns.iter().find(|c| c.primary_key)
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Index of a column's cell within the stored record.  The primary
    /// key column is the btree key and is not stored in the record, so
    /// columns after it shift down by one.  Returns None for the primary
    /// key itself.
    pub fn record_index(&self, name: &str) -> Option<usize> {
        let mut idx = 0;
        for c in &self.columns {
            if c.primary_key {
                if c.name == name {
                    return None;
                }
                continue;
            }
            if c.name == name {
                return Some(idx);
            }
            idx += 1;
        }
        None
    }
}

/// The parsed, in-memory schema.  Owned by the database handle and passed
/// explicitly to the planner and VM.
pub struct Catalog {
    tables: HashMap<String, Table>,
    version: u64,
}

/// The built-in description of cdb_schema itself, so that it can be
/// queried like any other table.
fn schema_table_meta() -> Table {
    let int = |name: &str, pk: bool| Column {
        name: String::from(name),
        col_type: SqlType::Integer,
        primary_key: pk,
    };
    let text = |name: &str| Column {
        name: String::from(name),
        col_type: SqlType::Text,
        primary_key: false,
    };
    Table {
        name: String::from(SCHEMA_TABLE_NAME),
        root_page: SCHEMA_ROOT_PAGENUM,
        columns: vec![
            int("id", true),
            text("type"),
            text("name"),
            text("table_name"),
            int("rootpage", false),
            text("sql"),
        ],
    }
}

impl Catalog {
    /// Reads the persisted cdb_schema rows into a fresh catalog.  The
    /// caller must hold a transaction on the pager.
    pub fn load(pager: &Pager) -> Result<Catalog, Error> {
        let mut catalog = Catalog {
            tables: HashMap::new(),
            version: 1,
        };
        catalog.tables = Self::scan_schema_table(pager)?;
        Ok(catalog)
    }

    /// Rereads cdb_schema and bumps the version token.  Called after every
    /// schema-mutating commit and whenever the pager detects that another
    /// process committed.
    pub fn parse_schema(&mut self, pager: &Pager) -> Result<(), Error> {
        self.tables = Self::scan_schema_table(pager)?;
        self.version += 1;
        log::debug!(
            "catalog reloaded: {} tables, version {}",
            self.tables.len(),
            self.version
        );
        Ok(())
    }

    fn scan_schema_table(pager: &Pager) -> Result<HashMap<String, Table>, Error> {
        let mut tables = HashMap::new();
        if pager.max_page() < SCHEMA_ROOT_PAGENUM {
            // Fresh store; the bootstrap tree does not exist yet.
            return Ok(tables);
        }
        let mut cursor = btree::Cursor::new(pager, SCHEMA_ROOT_PAGENUM);
        if !cursor.goto_first()? {
            return Ok(tables);
        }
        loop {
            let value = cursor
                .value()?
                .ok_or_else(|| Error::BadSchemaRow(String::from("missing record")))?;
            let cells = record::decode(&value)?;
            let table = Self::table_from_row(&cells)?;
            tables.insert(table.name.clone(), table);
            if !cursor.next()? {
                break;
            }
        }
        Ok(tables)
    }

    fn table_from_row(cells: &[SqlValue]) -> Result<Table, Error> {
        if cells.len() != SCHEMA_REC_CELLS {
            return Err(Error::BadSchemaRow(format!(
                "expected {} cells, found {}",
                SCHEMA_REC_CELLS,
                cells.len()
            )));
        }
        let text = |i: usize| -> Result<&str, Error> {
            cells[i]
                .as_text()
                .map(String::as_str)
                .ok_or_else(|| Error::BadSchemaRow(format!("cell {} is not text", i)))
        };
        if text(SCHEMA_REC_TYPE)? != "table" {
            return Err(Error::BadSchemaRow(format!(
                "unsupported object type {:?}",
                text(SCHEMA_REC_TYPE)?
            )));
        }
        let name = text(SCHEMA_REC_NAME)?.to_string();
        let table_name = text(SCHEMA_REC_TABLE_NAME)?.to_string();
        if name != table_name {
            return Err(Error::BadSchemaRow(String::from(
                "name and table_name disagree",
            )));
        }
        let root_page = *cells[SCHEMA_REC_ROOTPAGE]
            .as_int()
            .ok_or_else(|| Error::BadSchemaRow(String::from("rootpage is not an integer")))?;
        let column_list = ColumnList::from_json(text(SCHEMA_REC_SQL)?)?;
        Ok(Table {
            name,
            root_page: root_page as PageNum,
            columns: column_list.columns,
        })
    }

    /// Opaque token captured by compiled routines; any mutation changes it.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.get(name)
    }

    /// Table metadata by name, including the built-in cdb_schema entry.
    pub fn resolve_table(&self, name: &str) -> Option<Table> {
        if name == SCHEMA_TABLE_NAME {
            return Some(schema_table_meta());
        }
        self.tables.get(name).cloned()
    }

    pub fn table_exists(&self, name: &str) -> bool {
        name == SCHEMA_TABLE_NAME || self.tables.contains_key(name)
    }

    pub fn root_pagenum(&self, name: &str) -> Option<PageNum> {
        self.resolve_table(name).map(|t| t.root_page)
    }

    /// Points a table at a new root page after a root split, without a
    /// full reload.  Bumps the version: the on-disk row is rewritten by
    /// the caller and older routines hold a stale root.
    pub fn set_root(&mut self, name: &str, new_root: PageNum) {
        if let Some(t) = self.tables.get_mut(name) {
            t.root_page = new_root;
            self.version += 1;
        }
    }
}

/// Record cells for one cdb_schema row (everything but the id key).
pub fn schema_row_cells(table_name: &str, root_page: PageNum, column_json: &str) -> Vec<SqlValue> {
    vec![
        SqlValue::Text(String::from("table")),
        SqlValue::Text(String::from(table_name)),
        SqlValue::Text(String::from(table_name)),
        SqlValue::Int(root_page as i64),
        SqlValue::Text(String::from(column_json)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::encode_row_id;

    #[test]
    fn test_column_list_json_shape() {
        let list = ColumnList {
            columns: vec![
                Column {
                    name: String::from("id"),
                    col_type: SqlType::Integer,
                    primary_key: true,
                },
                Column {
                    name: String::from("junk"),
                    col_type: SqlType::Text,
                    primary_key: false,
                },
            ],
        };
        let json = list.to_json();
        assert_eq!(
            json,
            r#"{"columns":[{"name":"id","type":"INTEGER","primaryKey":true},{"name":"junk","type":"TEXT","primaryKey":false}]}"#
        );
        assert_eq!(ColumnList::from_json(&json).unwrap(), list);
    }

    #[test]
    fn test_record_index_skips_primary_key() {
        let t = Table {
            name: String::from("person"),
            root_page: 2,
            columns: vec![
                Column {
                    name: String::from("id"),
                    col_type: SqlType::Integer,
                    primary_key: true,
                },
                Column {
                    name: String::from("first_name"),
                    col_type: SqlType::Text,
                    primary_key: false,
                },
                Column {
                    name: String::from("age"),
                    col_type: SqlType::Integer,
                    primary_key: false,
                },
            ],
        };
        assert_eq!(t.record_index("id"), None);
        assert_eq!(t.record_index("first_name"), Some(0));
        assert_eq!(t.record_index("age"), Some(1));
        assert_eq!(t.record_index("missing"), None);
        assert_eq!(t.primary_key().map(|c| c.name.as_str()), Some("id"));
    }

    #[test]
    fn test_load_and_reload_from_pager() {
        let pager = Pager::open_memory();
        pager.begin_write().unwrap();
        let schema_root = btree::create(&pager).unwrap();
        assert_eq!(schema_root, SCHEMA_ROOT_PAGENUM);

        // Empty schema table: no user tables, version 1.
        let mut catalog = Catalog::load(&pager).unwrap();
        assert_eq!(catalog.version(), 1);
        assert!(catalog.table_exists(SCHEMA_TABLE_NAME));
        assert!(!catalog.table_exists("person"));

        // Persist a table row and reload.
        let person_root = btree::create(&pager).unwrap();
        let json = ColumnList {
            columns: vec![
                Column {
                    name: String::from("id"),
                    col_type: SqlType::Integer,
                    primary_key: true,
                },
                Column {
                    name: String::from("first_name"),
                    col_type: SqlType::Text,
                    primary_key: false,
                },
            ],
        }
        .to_json();
        let cells = schema_row_cells("person", person_root, &json);
        btree::set(
            &pager,
            SCHEMA_ROOT_PAGENUM,
            &encode_row_id(1),
            &record::encode(&cells),
        )
        .unwrap();

        catalog.parse_schema(&pager).unwrap();
        assert_eq!(catalog.version(), 2);
        let person = catalog.resolve_table("person").unwrap();
        assert_eq!(person.root_page, person_root);
        assert_eq!(person.columns.len(), 2);
        assert_eq!(catalog.root_pagenum("person"), Some(person_root));
        assert_eq!(catalog.root_pagenum(SCHEMA_TABLE_NAME), Some(1));
    }

    #[test]
    fn test_set_root_bumps_version() {
        let pager = Pager::open_memory();
        pager.begin_write().unwrap();
        btree::create(&pager).unwrap();
        let root = btree::create(&pager).unwrap();
        let json = ColumnList { columns: vec![] }.to_json();
        btree::set(
            &pager,
            SCHEMA_ROOT_PAGENUM,
            &encode_row_id(1),
            &record::encode(&schema_row_cells("t", root, &json)),
        )
        .unwrap();
        let mut catalog = Catalog::load(&pager).unwrap();
        let v = catalog.version();
        catalog.set_root("t", 9);
        assert_eq!(catalog.root_pagenum("t"), Some(9));
        assert!(catalog.version() > v);
    }
}
