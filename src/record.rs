// Btree tuples hold records, which contain SQL rows.
// A record is a sequence of typed cells.  Each cell is written with a
// self-describing prefix: a one byte type tag, then for variable-length
// cells a length, then the cell body.  Decoding therefore needs no schema.
//
// Keys are encoded separately (see `encode_row_id`): a big-endian u64, so
// that comparing two encoded keys as byte strings gives the same order as
// comparing the row ids as numbers.  The btree relies on this.

use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::sql_value::SqlValue;

const TAG_NULL: u8 = 0;
const TAG_INT: u8 = 1;
const TAG_TEXT: u8 = 2;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("Record ends in the middle of a cell.")]
    Truncated,
    #[error("Record has unknown cell type tag: {0}.")]
    UnknownTypeTag(u8),
    #[error("Text cell is not valid utf-8.")]
    NotUtf8,
    #[error("Key is not {} bytes.", ROW_ID_LEN)]
    BadKeyLength,
}

/// Number of bytes in an encoded row id key.
pub const ROW_ID_LEN: usize = 8;

/// Encodes a row id so that byte order equals numeric order.
pub fn encode_row_id(row_id: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(ROW_ID_LEN);
    buf.write_u64::<BigEndian>(row_id).expect("vec write cannot fail");
    buf
}

pub fn decode_row_id(key: &[u8]) -> Result<u64, Error> {
    if key.len() != ROW_ID_LEN {
        return Err(Error::BadKeyLength);
    }
    Cursor::new(key)
        .read_u64::<BigEndian>()
        .map_err(|_| Error::BadKeyLength)
}

/// Encodes a sequence of cells into record bytes.
pub fn encode(cells: &[SqlValue]) -> Vec<u8> {
    let mut buf: Vec<u8> = vec![];
    for cell in cells {
        match cell {
            SqlValue::Null() => buf.push(TAG_NULL),
            SqlValue::Int(i) => {
                buf.push(TAG_INT);
                buf.write_i64::<BigEndian>(*i).expect("vec write cannot fail");
            }
            SqlValue::Text(s) => {
                buf.push(TAG_TEXT);
                buf.write_u32::<BigEndian>(s.len() as u32)
                    .expect("vec write cannot fail");
                buf.extend_from_slice(s.as_bytes());
            }
        }
    }
    buf
}

/// Decodes record bytes back into cells.  `decode(encode(xs)) == xs` for
/// every valid cell sequence.
pub fn decode(data: &[u8]) -> Result<Vec<SqlValue>, Error> {
    let mut cells: Vec<SqlValue> = vec![];
    let mut offset = 0;
    while offset < data.len() {
        let tag = data[offset];
        offset += 1;
        match tag {
            TAG_NULL => cells.push(SqlValue::Null()),
            TAG_INT => {
                if offset + 8 > data.len() {
                    return Err(Error::Truncated);
                }
                let i = Cursor::new(&data[offset..offset + 8])
                    .read_i64::<BigEndian>()
                    .map_err(|_| Error::Truncated)?;
                offset += 8;
                cells.push(SqlValue::Int(i));
            }
            TAG_TEXT => {
                if offset + 4 > data.len() {
                    return Err(Error::Truncated);
                }
                let len = Cursor::new(&data[offset..offset + 4])
                    .read_u32::<BigEndian>()
                    .map_err(|_| Error::Truncated)? as usize;
                offset += 4;
                if offset + len > data.len() {
                    return Err(Error::Truncated);
                }
                let s = std::str::from_utf8(&data[offset..offset + len])
                    .map_err(|_| Error::NotUtf8)?;
                offset += len;
                cells.push(SqlValue::Text(String::from(s)));
            }
            t => return Err(Error::UnknownTypeTag(t)),
        }
    }
    Ok(cells)
}
