//! Positional cursor over one btree.
//!
//! A cursor lives inside a single routine execution.  It remembers only
//! page numbers and a slot index, and re-fetches pages from the pager on
//! every move, so it always observes the transaction's current bytes.

use super::{descend_to_leaf, leftmost_leaf, rightmost_leaf, split_leaf, Error};
use crate::pager::{PageNum, Pager};

pub struct Cursor<'p> {
    pager: &'p Pager,
    root: PageNum,
    leaf: PageNum,
    idx: usize,
    valid: bool,
    // After a delete the current slot already names the following tuple;
    // the next advance must not skip it.
    skip_next_advance: bool,
}

impl<'p> Cursor<'p> {
    pub fn new(pager: &'p Pager, root: PageNum) -> Cursor<'p> {
        Cursor {
            pager,
            root,
            leaf: 0,
            idx: 0,
            valid: false,
            skip_next_advance: false,
        }
    }

    /// Root page of the tree this cursor walks.  Follows root splits made
    /// through this cursor.
    pub fn tree_root(&self) -> PageNum {
        self.root
    }

    /// Positions at the first key in the tree.  Returns false when the
    /// tree holds no tuples.
    pub fn goto_first(&mut self) -> Result<bool, Error> {
        self.skip_next_advance = false;
        self.leaf = leftmost_leaf(self.pager, self.root)?;
        self.idx = 0;
        self.valid = self.skip_empty_leaves_rightward()?;
        Ok(self.valid)
    }

    /// Positions at the last key in the tree.
    pub fn goto_last(&mut self) -> Result<bool, Error> {
        self.skip_next_advance = false;
        let mut pn = rightmost_leaf(self.pager, self.root)?;
        // Deletes can leave empty leaves at the tail of the chain.
        loop {
            let page = self.pager.get(pn)?;
            let n = page.tuple_count();
            if n > 0 {
                self.leaf = pn;
                self.idx = n - 1;
                self.valid = true;
                return Ok(true);
            }
            if page.get_left() == 0 {
                self.valid = false;
                return Ok(false);
            }
            pn = page.get_left();
        }
    }

    /// Positions at the first key greater than or equal to `key`.
    /// Returns whether the key was matched exactly; an absent key leaves
    /// the cursor on its successor (or invalid past the end).
    pub fn seek(&mut self, key: &[u8]) -> Result<bool, Error> {
        self.skip_next_advance = false;
        self.leaf = descend_to_leaf(self.pager, self.root, key)?;
        let page = self.pager.get(self.leaf)?;
        self.idx = page.lower_bound(key);
        self.valid = self.skip_empty_leaves_rightward()?;
        if !self.valid {
            return Ok(false);
        }
        Ok(self.key()?.as_deref() == Some(key))
    }

    /// Advances to the next key.  Returns false when the scan is done.
    pub fn next(&mut self) -> Result<bool, Error> {
        if !self.valid {
            return Ok(false);
        }
        if self.skip_next_advance {
            self.skip_next_advance = false;
        } else {
            self.idx += 1;
        }
        self.valid = self.skip_empty_leaves_rightward()?;
        Ok(self.valid)
    }

    /// Steps back to the previous key.  Returns false at the front.
    pub fn prev(&mut self) -> Result<bool, Error> {
        if !self.valid {
            return Ok(false);
        }
        self.skip_next_advance = false;
        loop {
            if self.idx > 0 {
                self.idx -= 1;
                return Ok(true);
            }
            let page = self.pager.get(self.leaf)?;
            let left = page.get_left();
            if left == 0 {
                self.valid = false;
                return Ok(false);
            }
            let left_page = self.pager.get(left)?;
            self.leaf = left;
            let n = left_page.tuple_count();
            if n > 0 {
                self.idx = n - 1;
                return Ok(true);
            }
            // Empty leaf: keep walking left with idx pinned at 0.
            self.idx = 0;
        }
    }

    /// Key under the cursor, or None when unpositioned.
    pub fn key(&self) -> Result<Option<Vec<u8>>, Error> {
        if !self.valid {
            return Ok(None);
        }
        let page = self.pager.get(self.leaf)?;
        Ok(page.entry(self.idx).map(|(k, _)| k))
    }

    /// Value under the cursor, or None when unpositioned.
    pub fn value(&self) -> Result<Option<Vec<u8>>, Error> {
        if !self.valid {
            return Ok(None);
        }
        let page = self.pager.get(self.leaf)?;
        Ok(page.entry(self.idx).map(|(_, v)| v))
    }

    /// Inserts or replaces `key`, splitting as needed, and leaves the
    /// cursor positioned on the inserted tuple.  Returns the tree's new
    /// root page number when a split cascaded into the root.
    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<Option<PageNum>, Error> {
        let mut new_root: Option<PageNum> = None;
        loop {
            let leaf_pn = descend_to_leaf(self.pager, self.root, key)?;
            let mut page = self.pager.get(leaf_pn)?;
            if page.can_insert(key, value) {
                page.set(key, value)?;
                self.pager.put(page)?;
                self.seek(key)?;
                return Ok(new_root);
            }
            if let Some(root) = split_leaf(self.pager, page)? {
                self.root = root;
                new_root = Some(root);
            }
        }
    }

    /// Removes the tuple under the cursor by rewriting the leaf's slot
    /// directory.  The cursor stays on the following tuple, so a scan
    /// loop may keep calling `next` as usual.  Underfull leaves are left
    /// as they are; later inserts may repopulate them.
    pub fn delete(&mut self) -> Result<(), Error> {
        if !self.valid {
            return Err(Error::Corrupt(String::from(
                "delete on an unpositioned cursor",
            )));
        }
        let mut page = self.pager.get(self.leaf)?;
        let mut entries = page.entries();
        if self.idx >= entries.len() {
            return Err(Error::Corrupt(String::from(
                "cursor slot beyond leaf tuple count",
            )));
        }
        entries.remove(self.idx);
        page.set_entries(&entries)?;
        self.pager.put(page)?;
        self.skip_next_advance = true;
        Ok(())
    }

    // From (leaf, idx), walks right until idx names a real slot.  Leaves
    // the position on the first such slot and reports whether one exists.
    fn skip_empty_leaves_rightward(&mut self) -> Result<bool, Error> {
        loop {
            let page = self.pager.get(self.leaf)?;
            if self.idx < page.tuple_count() {
                return Ok(true);
            }
            let right = page.get_right();
            if right == 0 {
                return Ok(false);
            }
            self.leaf = right;
            self.idx = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::{count, create, set};
    use super::*;
    use crate::record::{decode_row_id, encode_row_id};

    fn tree_with(keys: &[u64]) -> (Pager, PageNum) {
        let pager = Pager::open_memory();
        pager.begin_write().unwrap();
        let mut root = create(&pager).unwrap();
        for k in keys {
            if let Some(r) = set(&pager, root, &encode_row_id(*k), format!("v{}", k).as_bytes())
                .unwrap()
            {
                root = r;
            }
        }
        (pager, root)
    }

    fn cursor_keys(c: &mut Cursor) -> Vec<u64> {
        let mut keys = vec![];
        if !c.goto_first().unwrap() {
            return keys;
        }
        loop {
            keys.push(decode_row_id(&c.key().unwrap().unwrap()).unwrap());
            if !c.next().unwrap() {
                break;
            }
        }
        keys
    }

    #[test]
    fn test_empty_tree_traversal() {
        let (pager, root) = tree_with(&[]);
        let mut c = Cursor::new(&pager, root);
        assert!(!c.goto_first().unwrap());
        assert!(!c.goto_last().unwrap());
        assert_eq!(c.key().unwrap(), None);
        assert!(!c.next().unwrap());
    }

    #[test]
    fn test_forward_scan_is_sorted() {
        let (pager, root) = tree_with(&[5, 1, 9, 3, 7]);
        let mut c = Cursor::new(&pager, root);
        assert_eq!(cursor_keys(&mut c), vec![1, 3, 5, 7, 9]);
    }

    #[test]
    fn test_forward_scan_across_many_leaves() {
        let keys: Vec<u64> = (1..=1500).collect();
        let (pager, root) = tree_with(&keys);
        let mut c = Cursor::new(&pager, root);
        assert_eq!(cursor_keys(&mut c), keys);
    }

    #[test]
    fn test_backward_scan() {
        let keys: Vec<u64> = (1..=700).collect();
        let (pager, root) = tree_with(&keys);
        let mut c = Cursor::new(&pager, root);
        assert!(c.goto_last().unwrap());
        let mut seen = vec![];
        loop {
            seen.push(decode_row_id(&c.key().unwrap().unwrap()).unwrap());
            if !c.prev().unwrap() {
                break;
            }
        }
        let expected: Vec<u64> = (1..=700).rev().collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_seek_exact_and_successor() {
        let (pager, root) = tree_with(&[10, 20, 30]);
        let mut c = Cursor::new(&pager, root);
        assert!(c.seek(&encode_row_id(20)).unwrap());
        assert_eq!(c.value().unwrap(), Some(b"v20".to_vec()));
        // Absent key positions on the successor.
        assert!(!c.seek(&encode_row_id(15)).unwrap());
        assert_eq!(decode_row_id(&c.key().unwrap().unwrap()).unwrap(), 20);
        // Past the end: invalid.
        assert!(!c.seek(&encode_row_id(31)).unwrap());
        assert_eq!(c.key().unwrap(), None);
    }

    #[test]
    fn test_seek_in_split_tree() {
        let keys: Vec<u64> = (1..=2000).map(|i| i * 2).collect(); // even keys
        let (pager, root) = tree_with(&keys);
        let mut c = Cursor::new(&pager, root);
        assert!(c.seek(&encode_row_id(1234)).unwrap());
        assert!(!c.seek(&encode_row_id(1235)).unwrap());
        assert_eq!(decode_row_id(&c.key().unwrap().unwrap()).unwrap(), 1236);
    }

    #[test]
    fn test_delete_mid_scan_keeps_going() {
        let (pager, root) = tree_with(&[1, 2, 3, 4, 5]);
        let mut c = Cursor::new(&pager, root);
        // Delete the even keys during a single forward scan.
        assert!(c.goto_first().unwrap());
        loop {
            let k = decode_row_id(&c.key().unwrap().unwrap()).unwrap();
            if k % 2 == 0 {
                c.delete().unwrap();
                if !c.next().unwrap() {
                    break;
                }
            } else if !c.next().unwrap() {
                break;
            }
        }
        let mut c = Cursor::new(&pager, root);
        assert_eq!(cursor_keys(&mut c), vec![1, 3, 5]);
        assert_eq!(count(&pager, root).unwrap(), 3);
    }

    #[test]
    fn test_deleted_key_no_longer_resolves() {
        let (pager, root) = tree_with(&[1, 2, 3]);
        let mut c = Cursor::new(&pager, root);
        assert!(c.seek(&encode_row_id(2)).unwrap());
        c.delete().unwrap();
        assert!(!c.seek(&encode_row_id(2)).unwrap());
        // And a later insert may repopulate the slot.
        c.insert(&encode_row_id(2), b"again").unwrap();
        assert!(c.seek(&encode_row_id(2)).unwrap());
        assert_eq!(c.value().unwrap(), Some(b"again".to_vec()));
    }

    #[test]
    fn test_insert_leaves_cursor_on_tuple() {
        let (pager, root) = tree_with(&[1, 3]);
        let mut c = Cursor::new(&pager, root);
        c.insert(&encode_row_id(2), b"two").unwrap();
        assert_eq!(decode_row_id(&c.key().unwrap().unwrap()).unwrap(), 2);
        assert!(c.next().unwrap());
        assert_eq!(decode_row_id(&c.key().unwrap().unwrap()).unwrap(), 3);
    }

    #[test]
    fn test_replace_during_scan_does_not_move_cursor() {
        let (pager, root) = tree_with(&[1, 2, 3]);
        let mut c = Cursor::new(&pager, root);
        assert!(c.goto_first().unwrap());
        let mut visited = 0;
        loop {
            let k = c.key().unwrap().unwrap();
            c.insert(&k, b"updated").unwrap();
            visited += 1;
            if !c.next().unwrap() {
                break;
            }
        }
        assert_eq!(visited, 3);
        let mut c = Cursor::new(&pager, root);
        assert!(c.goto_first().unwrap());
        loop {
            assert_eq!(c.value().unwrap(), Some(b"updated".to_vec()));
            if !c.next().unwrap() {
                break;
            }
        }
    }
}
