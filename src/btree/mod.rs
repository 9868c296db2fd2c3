//! B+tree key/value layer over slotted pages.
//!
//! A tree is identified by its root page number.  Leaves hold the actual
//! (key, value) tuples and form a doubly linked list in key order, so a
//! range scan never re-descends.  Internal pages hold (separator key,
//! child page pointer) entries; descending one level means taking the
//! child of the greatest separator at or below the search key.
//!
//! Pages refer to each other only by page number and are fetched from the
//! pager on every hop; nothing here holds an owning reference to another
//! page, which keeps the picture coherent with what is on disk.
//!
//! Organization of btree submodules and types:
//! * `Cursor` (in `cursor`) is the positional handle: seek, rewind, next,
//!   prev, insert, delete.
//! * this module has tree-level operations: creating a tree, splitting
//!   full pages, whole-tree counting, row id allocation, and thin
//!   `get`/`set` wrappers over a cursor.

use std::collections::HashMap;
use std::io::Cursor as IoCursor;
use std::sync::Mutex;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use log::debug;

use crate::page::{Page, PageType};
use crate::pager::{PageNum, Pager};
use crate::record;

mod cursor;
pub use cursor::Cursor;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Pager(#[from] crate::pager::Error),
    #[error(transparent)]
    Page(#[from] crate::page::Error),
    #[error(transparent)]
    Record(#[from] record::Error),
    #[error("A single tuple is too large to fit in any page.")]
    TupleTooLarge,
    #[error("Btree structure is corrupt: {0}")]
    Corrupt(String),
}

/// Creates an empty btree and returns the page number of its root, a
/// fresh leaf.  Must be called inside a write transaction.
pub fn create(pager: &Pager) -> Result<PageNum, Error> {
    let mut page = pager.new_page()?;
    page.set_type(PageType::Leaf);
    let root = page.number();
    pager.put(page)?;
    Ok(root)
}

/// Looks up one key.  Thin wrapper over a cursor seek.
pub fn get(pager: &Pager, root: PageNum, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
    let mut c = Cursor::new(pager, root);
    if c.seek(key)? {
        c.value()
    } else {
        Ok(None)
    }
}

/// Inserts or replaces one key.  Thin wrapper over a cursor insert.
/// Returns the new root page number when the insert split the root.
pub fn set(
    pager: &Pager,
    root: PageNum,
    key: &[u8],
    value: &[u8],
) -> Result<Option<PageNum>, Error> {
    let mut c = Cursor::new(pager, root);
    c.insert(key, value)
}

/// Total number of tuples in the tree.  Walks the leaf chain by `right`
/// pointers instead of iterating tuples, which is what makes a full-table
/// COUNT(*) cheap.
pub fn count(pager: &Pager, root: PageNum) -> Result<u64, Error> {
    let mut pn = leftmost_leaf(pager, root)?;
    let mut total: u64 = 0;
    while pn != 0 {
        let page = pager.get(pn)?;
        total += page.tuple_count() as u64;
        pn = page.get_right();
    }
    Ok(total)
}

/// The greatest key present in the tree, read from the rightmost leaf.
pub fn last_key(pager: &Pager, root: PageNum) -> Result<Option<Vec<u8>>, Error> {
    let mut c = Cursor::new(pager, root);
    if c.goto_last()? {
        c.key()
    } else {
        Ok(None)
    }
}

// Child page pointers stored as values on internal pages.

pub(crate) fn encode_child(pn: PageNum) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4);
    buf.write_u32::<BigEndian>(pn as u32).expect("vec write cannot fail");
    buf
}

pub(crate) fn decode_child(v: &[u8]) -> Result<PageNum, Error> {
    if v.len() != 4 {
        return Err(Error::Corrupt(format!(
            "child pointer of {} bytes",
            v.len()
        )));
    }
    Ok(IoCursor::new(v).read_u32::<BigEndian>().expect("4 byte slice") as PageNum)
}

/// Follows routing from `root` down to the leaf that covers `key`.
pub(crate) fn descend_to_leaf(
    pager: &Pager,
    root: PageNum,
    key: &[u8],
) -> Result<PageNum, Error> {
    let mut pn = root;
    loop {
        let page = pager.get(pn)?;
        match page.get_type() {
            PageType::Leaf => return Ok(pn),
            PageType::Internal => {
                let child = page
                    .get(key)
                    .ok_or_else(|| Error::Corrupt(format!("internal page {} is empty", pn)))?;
                pn = decode_child(&child)?;
            }
        }
    }
}

/// The first leaf in key order under `root`.
pub(crate) fn leftmost_leaf(pager: &Pager, root: PageNum) -> Result<PageNum, Error> {
    boundary_leaf(pager, root, |page| page.entry(0))
}

/// The last leaf in key order under `root`.
pub(crate) fn rightmost_leaf(pager: &Pager, root: PageNum) -> Result<PageNum, Error> {
    boundary_leaf(pager, root, |page| {
        let n = page.tuple_count();
        if n == 0 {
            None
        } else {
            page.entry(n - 1)
        }
    })
}

fn boundary_leaf(
    pager: &Pager,
    root: PageNum,
    pick: impl Fn(&Page) -> Option<(Vec<u8>, Vec<u8>)>,
) -> Result<PageNum, Error> {
    let mut pn = root;
    loop {
        let page = pager.get(pn)?;
        match page.get_type() {
            PageType::Leaf => return Ok(pn),
            PageType::Internal => {
                let (_, child) = pick(&page)
                    .ok_or_else(|| Error::Corrupt(format!("internal page {} is empty", pn)))?;
                pn = decode_child(&child)?;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Splitting
// ---------------------------------------------------------------------------

/// Splits a full leaf: the upper half of its entries moves to a freshly
/// allocated leaf which is stitched into the sibling chain, and the first
/// moved key becomes the separator routed to the new leaf in the parent.
/// Returns the tree's new root page number if the split cascaded into the
/// root.
pub(crate) fn split_leaf(pager: &Pager, mut leaf: Page) -> Result<Option<PageNum>, Error> {
    let entries = leaf.entries();
    if entries.len() < 2 {
        return Err(Error::TupleTooLarge);
    }
    let mid = entries.len() / 2;
    let (lower, upper) = entries.split_at(mid);

    let mut new_leaf = pager.new_page()?;
    new_leaf.set_type(PageType::Leaf);
    new_leaf.set_entries(upper)?;
    let separator = upper[0].0.clone();

    debug!(
        "splitting leaf {}: {} entries stay, {} move to new leaf {}",
        leaf.number(),
        lower.len(),
        upper.len(),
        new_leaf.number()
    );

    // Stitch the new leaf into the chain between `leaf` and its old right
    // neighbor.
    new_leaf.set_left(leaf.number());
    new_leaf.set_right(leaf.get_right());
    if leaf.get_right() != 0 {
        let mut old_right = pager.get(leaf.get_right())?;
        old_right.set_left(new_leaf.number());
        pager.put(old_right)?;
    }
    leaf.set_right(new_leaf.number());
    leaf.set_entries(lower)?;

    insert_into_parent(pager, leaf, new_leaf, separator)
}

/// Splits a full internal page the same way, additionally re-parenting the
/// children whose entries moved.
fn split_internal(pager: &Pager, mut page: Page) -> Result<InternalSplit, Error> {
    let entries = page.entries();
    if entries.len() < 2 {
        return Err(Error::TupleTooLarge);
    }
    let mid = entries.len() / 2;
    let (lower, upper) = entries.split_at(mid);

    let mut new_page = pager.new_page()?;
    new_page.set_type(PageType::Internal);
    new_page.set_entries(upper)?;
    let separator = upper[0].0.clone();
    let new_pn = new_page.number();

    debug!(
        "splitting internal {}: {} entries stay, {} move to new internal {}",
        page.number(),
        lower.len(),
        upper.len(),
        new_pn
    );

    for (_, child) in upper {
        let child_pn = decode_child(child)?;
        let mut child_page = pager.get(child_pn)?;
        child_page.set_parent(new_pn);
        pager.put(child_page)?;
    }

    new_page.set_left(page.number());
    new_page.set_right(page.get_right());
    if page.get_right() != 0 {
        let mut old_right = pager.get(page.get_right())?;
        old_right.set_left(new_pn);
        pager.put(old_right)?;
    }
    page.set_right(new_pn);
    page.set_entries(lower)?;

    let left_pn = page.number();
    let new_root = insert_into_parent(pager, page, new_page, separator.clone())?;
    Ok(InternalSplit {
        left: left_pn,
        right: new_pn,
        separator,
        new_root,
    })
}

struct InternalSplit {
    left: PageNum,
    right: PageNum,
    separator: Vec<u8>,
    new_root: Option<PageNum>,
}

/// Routes the separator for a freshly split-off `right` page into the
/// parent of `left`, growing a new root when `left` was the root, and
/// recursing when the parent itself is full.
fn insert_into_parent(
    pager: &Pager,
    mut left: Page,
    mut right: Page,
    separator: Vec<u8>,
) -> Result<Option<PageNum>, Error> {
    let parent_pn = left.get_parent();
    let right_pn = right.number();

    if parent_pn == 0 {
        // Splitting the root: allocate a new internal page above both
        // halves.  The caller must update the catalog's root-page
        // reference for this tree.
        let mut root = pager.new_page()?;
        root.set_type(PageType::Internal);
        let left_low = left
            .entry(0)
            .ok_or_else(|| Error::Corrupt(format!("split left page {} is empty", left.number())))?
            .0;
        root.set_entries(&[
            (left_low, encode_child(left.number())),
            (separator, encode_child(right_pn)),
        ])?;
        left.set_parent(root.number());
        right.set_parent(root.number());
        let root_pn = root.number();
        pager.put(left)?;
        pager.put(right)?;
        pager.put(root)?;
        debug!("grew new root {}", root_pn);
        return Ok(Some(root_pn));
    }

    right.set_parent(parent_pn);
    pager.put(left)?;
    pager.put(right)?;

    let mut parent = pager.get(parent_pn)?;
    let pointer = encode_child(right_pn);
    if parent.can_insert(&separator, &pointer) {
        parent.set(&separator, &pointer)?;
        pager.put(parent)?;
        return Ok(None);
    }

    // The parent is full too: split it, then route our separator into
    // whichever half now covers it.
    let split = split_internal(pager, parent)?;
    let target_pn = if separator >= split.separator {
        split.right
    } else {
        split.left
    };
    let mut target = pager.get(target_pn)?;
    target.set(&separator, &pointer)?;
    pager.put(target)?;
    if target_pn != parent_pn {
        let mut moved = pager.get(right_pn)?;
        moved.set_parent(target_pn);
        pager.put(moved)?;
    }
    Ok(split.new_root)
}

// ---------------------------------------------------------------------------
// Row id allocation
// ---------------------------------------------------------------------------

/// Hands out strictly increasing row ids per tree for the lifetime of a
/// database handle.  The first allocation for a tree seeds from the
/// greatest key in its rightmost leaf; after that a high-water mark keeps
/// ids monotonic even when the table is emptied and repopulated.
pub struct RowIdAllocator {
    high_water: Mutex<HashMap<PageNum, u64>>,
}

impl RowIdAllocator {
    pub fn new() -> RowIdAllocator {
        RowIdAllocator {
            high_water: Mutex::new(HashMap::new()),
        }
    }

    /// The next unused row id for the tree rooted at `root`.  Yields 1 on
    /// an empty, never-touched tree.
    pub fn new_row_id(&self, pager: &Pager, root: PageNum) -> Result<u64, Error> {
        let mut hw = self.high_water.lock().expect("lock poisoned");
        let seeded = hw.get(&root).copied().unwrap_or(0);
        let stored = match last_key(pager, root)? {
            Some(key) => record::decode_row_id(&key)?,
            None => 0,
        };
        let next = u64::max(seeded, stored) + 1;
        hw.insert(root, next);
        Ok(next)
    }

    /// Carries the high-water mark over to a new root page number after a
    /// root split moved the tree.
    pub fn rekey(&self, old_root: PageNum, new_root: PageNum) {
        let mut hw = self.high_water.lock().expect("lock poisoned");
        if let Some(mark) = hw.remove(&old_root) {
            hw.insert(new_root, mark);
        }
    }

    /// Observes an explicitly supplied key (a user-provided primary key)
    /// so later automatic ids stay above it.
    pub fn observe(&self, root: PageNum, row_id: u64) {
        let mut hw = self.high_water.lock().expect("lock poisoned");
        let mark = hw.entry(root).or_insert(0);
        if row_id > *mark {
            *mark = row_id;
        }
    }
}

impl Default for RowIdAllocator {
    fn default() -> Self {
        RowIdAllocator::new()
    }
}
