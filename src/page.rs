//! Slotted-page layout over one fixed-size page.
//!
//! Byte layout, all integers big-endian:
//!
//! ```text
//! offset 0     type tag (0 = leaf, 1 = internal; a zeroed page is a leaf)
//! offset 1     parent page number (u32, 0 = none)
//! offset 5     left sibling page number (u32, 0 = none)
//! offset 9     right sibling page number (u32, 0 = none)
//! offset 13    tuple count (u16)
//! offset 15    slot directory: (key offset u16, value offset u16) per
//!              tuple, in ascending key order
//! ...          free space
//! tail         tuples, stored in reverse from the page tail: the first
//!              slot's tuple ends at the page end, each following tuple
//!              ends where the previous one begins
//! ```
//!
//! A tuple's extent comes from its own offset pair plus the preceding
//! tuple's key offset, so no per-tuple length fields are stored.
//! `set_entries` is the only primitive that rewrites the layout; `set` and
//! the btree's delete path route through it.

use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::pager::{PageNum, PAGE_SIZE};

pub const PAGE_HEADER_SIZE: usize = 15;
const SLOT_SIZE: usize = 4;

const OFFSET_TYPE: usize = 0;
const OFFSET_PARENT: usize = 1;
const OFFSET_LEFT: usize = 5;
const OFFSET_RIGHT: usize = 9;
const OFFSET_COUNT: usize = 13;
const SLOTS_START: usize = 15;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("Entries do not fit in one page.")]
    PageFull,
    #[error("Page contains a malformed slot directory.")]
    Corrupt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    Leaf,
    Internal,
}

/// One page's worth of bytes, owned, plus its page number.  Obtained from
/// the pager and written back through it; holding a `Page` does not pin
/// anything.
#[derive(Debug, Clone)]
pub struct Page {
    num: PageNum,
    data: Vec<u8>,
}

impl Page {
    pub fn new(num: PageNum, data: Vec<u8>) -> Page {
        debug_assert_eq!(data.len(), PAGE_SIZE);
        Page { num, data }
    }

    pub fn number(&self) -> PageNum {
        self.num
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    pub fn get_type(&self) -> PageType {
        // Anything other than the internal tag reads as a leaf; in
        // particular an uninitialized (zeroed) page is an empty leaf.
        match self.data[OFFSET_TYPE] {
            1 => PageType::Internal,
            _ => PageType::Leaf,
        }
    }

    pub fn set_type(&mut self, t: PageType) {
        self.data[OFFSET_TYPE] = match t {
            PageType::Leaf => 0,
            PageType::Internal => 1,
        };
    }

    fn get_u32_at(&self, offset: usize) -> u32 {
        Cursor::new(&self.data[offset..offset + 4])
            .read_u32::<BigEndian>()
            .expect("slice of 4 bytes")
    }

    fn set_u32_at(&mut self, offset: usize, v: u32) {
        let mut c = Cursor::new(&mut self.data[offset..offset + 4]);
        c.write_u32::<BigEndian>(v).expect("slice of 4 bytes");
    }

    fn get_u16_at(&self, offset: usize) -> u16 {
        Cursor::new(&self.data[offset..offset + 2])
            .read_u16::<BigEndian>()
            .expect("slice of 2 bytes")
    }

    fn set_u16_at(&mut self, offset: usize, v: u16) {
        let mut c = Cursor::new(&mut self.data[offset..offset + 2]);
        c.write_u16::<BigEndian>(v).expect("slice of 2 bytes");
    }

    pub fn get_parent(&self) -> PageNum {
        self.get_u32_at(OFFSET_PARENT) as PageNum
    }

    pub fn set_parent(&mut self, p: PageNum) {
        self.set_u32_at(OFFSET_PARENT, p as u32);
    }

    pub fn get_left(&self) -> PageNum {
        self.get_u32_at(OFFSET_LEFT) as PageNum
    }

    pub fn set_left(&mut self, p: PageNum) {
        self.set_u32_at(OFFSET_LEFT, p as u32);
    }

    pub fn get_right(&self) -> PageNum {
        self.get_u32_at(OFFSET_RIGHT) as PageNum
    }

    pub fn set_right(&mut self, p: PageNum) {
        self.set_u32_at(OFFSET_RIGHT, p as u32);
    }

    pub fn tuple_count(&self) -> usize {
        self.get_u16_at(OFFSET_COUNT) as usize
    }

    /// Bytes left between the end of the slot directory and the start of
    /// the lowest-placed tuple.
    pub fn free_space(&self) -> usize {
        let n = self.tuple_count();
        let slots_end = SLOTS_START + n * SLOT_SIZE;
        let tuples_start = if n == 0 {
            PAGE_SIZE
        } else {
            self.slot(n - 1).0
        };
        tuples_start.saturating_sub(slots_end)
    }

    fn slot(&self, i: usize) -> (usize, usize) {
        let off = SLOTS_START + i * SLOT_SIZE;
        (
            self.get_u16_at(off) as usize,
            self.get_u16_at(off + 2) as usize,
        )
    }

    /// The byte range holding tuple `i`: `(key, value)` slices.
    fn tuple(&self, i: usize) -> (&[u8], &[u8]) {
        let (key_off, val_off) = self.slot(i);
        let end = if i == 0 {
            PAGE_SIZE
        } else {
            self.slot(i - 1).0
        };
        (&self.data[key_off..val_off], &self.data[val_off..end])
    }

    /// All entries in slot order (ascending key order).
    pub fn entries(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        (0..self.tuple_count())
            .map(|i| {
                let (k, v) = self.tuple(i);
                (k.to_vec(), v.to_vec())
            })
            .collect()
    }

    /// Whether `set(key, value)` would succeed, accounting for an existing
    /// entry being replaced rather than appended.
    pub fn can_insert(&self, key: &[u8], value: &[u8]) -> bool {
        let mut entries = self.entries();
        upsert(&mut entries, key, value);
        fits(&entries)
    }

    /// Rewrites the slot directory and tuple area from scratch, sorted
    /// ascending by key.  The only primitive that reorders storage.
    pub fn set_entries(&mut self, entries: &[(Vec<u8>, Vec<u8>)]) -> Result<(), Error> {
        let mut entries: Vec<(Vec<u8>, Vec<u8>)> = entries.to_vec();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        if !fits(&entries) {
            return Err(Error::PageFull);
        }
        let mut end = PAGE_SIZE;
        for (i, (k, v)) in entries.iter().enumerate() {
            let start = end - k.len() - v.len();
            let key_off = start;
            let val_off = start + k.len();
            self.data[key_off..val_off].copy_from_slice(k);
            self.data[val_off..end].copy_from_slice(v);
            let slot_off = SLOTS_START + i * SLOT_SIZE;
            self.set_u16_at(slot_off, key_off as u16);
            self.set_u16_at(slot_off + 2, val_off as u16);
            end = start;
        }
        self.set_u16_at(OFFSET_COUNT, entries.len() as u16);
        Ok(())
    }

    /// On a leaf, the value stored under exactly `key`.  On an internal
    /// page, one level of btree descent: the value (child page pointer) of
    /// the greatest separator key less than or equal to `key`.  A search
    /// key below every separator routes to the first child, which covers
    /// the low end of the key space.
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let n = self.tuple_count();
        match self.get_type() {
            PageType::Leaf => {
                for i in 0..n {
                    let (k, v) = self.tuple(i);
                    if k == key {
                        return Some(v.to_vec());
                    }
                    if k > key {
                        break;
                    }
                }
                None
            }
            PageType::Internal => {
                let mut found: Option<Vec<u8>> = None;
                for i in 0..n {
                    let (k, v) = self.tuple(i);
                    if k <= key {
                        found = Some(v.to_vec());
                    } else {
                        break;
                    }
                }
                if found.is_none() && n > 0 {
                    let (_, v) = self.tuple(0);
                    found = Some(v.to_vec());
                }
                found
            }
        }
    }

    /// Replaces the value under `key` if present, else appends the entry.
    pub fn set(&mut self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        let mut entries = self.entries();
        upsert(&mut entries, key, value);
        self.set_entries(&entries)
    }

    /// Index of the first slot whose key is >= `key`, or `tuple_count()`
    /// if every key is smaller.  Used by cursor positioning.
    pub fn lower_bound(&self, key: &[u8]) -> usize {
        let n = self.tuple_count();
        for i in 0..n {
            if self.tuple(i).0 >= key {
                return i;
            }
        }
        n
    }

    /// Key and value of slot `i`.
    pub fn entry(&self, i: usize) -> Option<(Vec<u8>, Vec<u8>)> {
        if i >= self.tuple_count() {
            return None;
        }
        let (k, v) = self.tuple(i);
        Some((k.to_vec(), v.to_vec()))
    }
}

fn upsert(entries: &mut Vec<(Vec<u8>, Vec<u8>)>, key: &[u8], value: &[u8]) {
    match entries.iter_mut().find(|(k, _)| k.as_slice() == key) {
        Some(e) => e.1 = value.to_vec(),
        None => entries.push((key.to_vec(), value.to_vec())),
    }
}

fn fits(entries: &[(Vec<u8>, Vec<u8>)]) -> bool {
    let tuple_bytes: usize = entries.iter().map(|(k, v)| k.len() + v.len()).sum();
    PAGE_HEADER_SIZE + entries.len() * SLOT_SIZE + tuple_bytes <= PAGE_SIZE
}
