//! Manages pages of a single database file (or in-memory buffer).
//!
//! The pager owns the backing storage and enforces the storage contract:
//!
//! - Pages are numbered from 1; page number 0 is the null pointer.  Page N
//!   lives at byte offset `RESERVED_HEADER + (N-1) * PAGE_SIZE`.
//! - A reserved header at offset 0 holds the maximum allocated page number
//!   and a write-generation counter.
//! - One reader/writer transaction lock serializes access: many readers or
//!   one writer.  Once a writer is waiting no new reader may enter, so
//!   writers cannot starve.
//! - Commits are atomic through a rollback journal: the whole backing file
//!   is copied to a sibling `journal.db` before any page is rewritten, and
//!   the journal is removed once every dirty page and the header have been
//!   flushed.  A journal found at open time means a commit was interrupted
//!   and its pre-image is copied back first.
//! - Another process may commit between our transactions.  The generation
//!   counter is compared at the start of every transaction and the page
//!   cache is dropped when it moved, so the next read observes the new
//!   bytes.

use std::collections::HashMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use log::{debug, info};

use crate::page::Page;
use crate::storage::Storage;

// Page numbers are 1-based.  PageNum ensures people pass something that is
// meant to be a page number to a function that expects one.
pub type PageNum = usize;

pub const PAGE_SIZE: usize = 4096;

/// Bytes reserved at the head of the backing store, before page 1:
/// 4 bytes magic, u32 max allocated page, u64 write generation.
pub const RESERVED_HEADER: usize = 16;

const MAGIC: &[u8; 4] = b"cdb\0";

/// Name of the transient pre-image file, a sibling of the database file.
pub const JOURNAL_FILE_NAME: &str = "journal.db";

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Page number {0} is beyond the allocated range.")]
    PageNumberOutOfRange(PageNum),
    #[error("The magic bytes for this file are wrong.")]
    WrongMagic,
    #[error("Page write outside a write transaction.")]
    NotWriting,
    #[error(transparent)]
    Storage(#[from] crate::storage::Error),
    #[error("Error handling journal file: {0}")]
    Journal(std::io::Error),
}

fn page_offset(pn: PageNum) -> u64 {
    (RESERVED_HEADER + (pn - 1) * PAGE_SIZE) as u64
}

// ---------------------------------------------------------------------------
// Transaction lock
// ---------------------------------------------------------------------------

// Reader/writer lock with writer preference.  std's RwLock leaves the
// reader/writer priority to the OS, and the storage contract needs the
// guarantee, so this is built directly on a Mutex and Condvar.
struct LockState {
    readers: usize,
    writer: bool,
    writers_waiting: usize,
}

struct TxLock {
    state: Mutex<LockState>,
    cond: Condvar,
}

impl TxLock {
    fn new() -> TxLock {
        TxLock {
            state: Mutex::new(LockState {
                readers: 0,
                writer: false,
                writers_waiting: 0,
            }),
            cond: Condvar::new(),
        }
    }

    fn lock_shared(&self) {
        let mut s = self.state.lock().expect("lock poisoned");
        // A waiting writer blocks new readers.
        while s.writer || s.writers_waiting > 0 {
            s = self.cond.wait(s).expect("lock poisoned");
        }
        s.readers += 1;
    }

    fn unlock_shared(&self) {
        let mut s = self.state.lock().expect("lock poisoned");
        s.readers -= 1;
        if s.readers == 0 {
            self.cond.notify_all();
        }
    }

    fn lock_exclusive(&self) {
        let mut s = self.state.lock().expect("lock poisoned");
        s.writers_waiting += 1;
        while s.writer || s.readers > 0 {
            s = self.cond.wait(s).expect("lock poisoned");
        }
        s.writers_waiting -= 1;
        s.writer = true;
    }

    fn unlock_exclusive(&self) {
        let mut s = self.state.lock().expect("lock poisoned");
        s.writer = false;
        self.cond.notify_all();
    }
}

// ---------------------------------------------------------------------------
// Pager
// ---------------------------------------------------------------------------

struct PagerInner {
    storage: Storage,
    // Clean pages read this or earlier transactions, dropped wholesale when
    // another pager's commit is detected.
    cache: HashMap<PageNum, Vec<u8>>,
    // Pages written during the open write transaction, flushed at commit.
    dirty: HashMap<PageNum, Vec<u8>>,
    max_page: u32,
    max_page_at_begin: u32,
    generation: u64,
    in_write: bool,
}

impl PagerInner {
    fn read_stored_header(&mut self) -> Result<(u32, u64), Error> {
        let mut buf = [0u8; RESERVED_HEADER];
        self.storage.read_at(0, &mut buf)?;
        if buf == [0u8; RESERVED_HEADER] {
            // Brand-new backing store; caller initializes.
            return Ok((0, 0));
        }
        if &buf[0..4] != MAGIC {
            return Err(Error::WrongMagic);
        }
        let mut c = Cursor::new(&buf[4..]);
        let max_page = c.read_u32::<BigEndian>().expect("header slice");
        let generation = c.read_u64::<BigEndian>().expect("header slice");
        Ok((max_page, generation))
    }

    fn write_stored_header(&mut self) -> Result<(), Error> {
        let mut buf = [0u8; RESERVED_HEADER];
        buf[0..4].copy_from_slice(MAGIC);
        {
            let mut c = Cursor::new(&mut buf[4..]);
            c.write_u32::<BigEndian>(self.max_page).expect("header slice");
            c.write_u64::<BigEndian>(self.generation).expect("header slice");
        }
        self.storage.write_at(0, &buf)?;
        Ok(())
    }

    // Drops the cache if another pager committed since we last looked.
    // Returns whether invalidation happened.
    fn refresh(&mut self) -> Result<bool, Error> {
        let (max_page, generation) = self.read_stored_header()?;
        if generation != self.generation {
            debug!(
                "external commit detected (generation {} -> {}), dropping page cache",
                self.generation, generation
            );
            self.cache.clear();
            self.generation = generation;
            self.max_page = max_page;
            return Ok(true);
        }
        Ok(false)
    }
}

/// One open database's page manager.  All methods take `&self`; the pager
/// is shared by the VM and every cursor of a running routine.
pub struct Pager {
    inner: Mutex<PagerInner>,
    lock: TxLock,
    // Database and journal paths; `None` for the memory backend, which
    // cannot need recovery.
    paths: Option<(PathBuf, PathBuf)>,
}

fn journal_path(db_path: &Path) -> PathBuf {
    match db_path.parent() {
        Some(dir) => dir.join(JOURNAL_FILE_NAME),
        None => PathBuf::from(JOURNAL_FILE_NAME),
    }
}

impl Pager {
    /// Opens (creating if missing) a file-backed pager.  If a journal file
    /// exists, an earlier commit was interrupted; its pre-image is copied
    /// over the database file before anything else reads it.
    pub fn open(path: &Path) -> Result<Pager, Error> {
        let journal = journal_path(path);
        if journal.exists() {
            info!(
                "found journal {}; restoring pre-image over {}",
                journal.display(),
                path.display()
            );
            std::fs::copy(&journal, path).map_err(Error::Journal)?;
            std::fs::remove_file(&journal).map_err(Error::Journal)?;
        }
        let storage = Storage::open_file(path)?;
        let mut pager = Pager {
            inner: Mutex::new(PagerInner {
                storage,
                cache: HashMap::new(),
                dirty: HashMap::new(),
                max_page: 0,
                max_page_at_begin: 0,
                generation: 0,
                in_write: false,
            }),
            lock: TxLock::new(),
            paths: Some((path.to_path_buf(), journal)),
        };
        pager.init_header()?;
        Ok(pager)
    }

    /// Opens a pager over a fresh in-memory buffer.
    pub fn open_memory() -> Pager {
        let mut pager = Pager {
            inner: Mutex::new(PagerInner {
                storage: Storage::open_memory(),
                cache: HashMap::new(),
                dirty: HashMap::new(),
                max_page: 0,
                max_page_at_begin: 0,
                generation: 0,
                in_write: false,
            }),
            lock: TxLock::new(),
            paths: None,
        };
        pager.init_header().expect("memory backend cannot fail");
        pager
    }

    fn init_header(&mut self) -> Result<(), Error> {
        let inner = self.inner.get_mut().expect("lock poisoned");
        let (max_page, generation) = inner.read_stored_header()?;
        if generation == 0 {
            // Fresh store: lay down the header so later opens see magic.
            inner.max_page = 0;
            inner.generation = 1;
            inner.write_stored_header()?;
            inner.storage.sync()?;
        } else {
            inner.max_page = max_page;
            inner.generation = generation;
        }
        Ok(())
    }

    /// Acquires the shared lock and revalidates the cache.  Returns true
    /// when an external commit invalidated cached pages; the database uses
    /// this to reload the catalog.
    pub fn begin_read(&self) -> Result<bool, Error> {
        self.lock.lock_shared();
        let mut inner = self.inner.lock().expect("lock poisoned");
        match inner.refresh() {
            Ok(invalidated) => Ok(invalidated),
            Err(e) => {
                drop(inner);
                self.lock.unlock_shared();
                Err(e)
            }
        }
    }

    pub fn end_read(&self) {
        self.lock.unlock_shared();
    }

    /// Acquires the exclusive lock and revalidates the cache.
    pub fn begin_write(&self) -> Result<bool, Error> {
        self.lock.lock_exclusive();
        let mut inner = self.inner.lock().expect("lock poisoned");
        match inner.refresh() {
            Ok(invalidated) => {
                inner.in_write = true;
                inner.max_page_at_begin = inner.max_page;
                Ok(invalidated)
            }
            Err(e) => {
                drop(inner);
                self.lock.unlock_exclusive();
                Err(e)
            }
        }
    }

    /// Commits the open write transaction: journal the pre-image, flush
    /// every dirty page, persist the header, drop the journal, release the
    /// lock.  A transaction that dirtied nothing skips the journal.  The
    /// lock is released even when the commit fails; the journal then stays
    /// behind for recovery.
    pub fn end_write(&self) -> Result<(), Error> {
        let result = self.commit();
        if result.is_err() {
            // The transaction is over either way.  Pages that did reach
            // storage are covered by the journal left on disk.
            let mut inner = self.inner.lock().expect("lock poisoned");
            inner.dirty.clear();
            inner.in_write = false;
        }
        self.lock.unlock_exclusive();
        result
    }

    fn commit(&self) -> Result<(), Error> {
        let mut inner = self.inner.lock().expect("lock poisoned");
        if !inner.dirty.is_empty() {
            // 1. Pre-image: the on-disk file still holds the state from
            //    before this transaction, since all writes are buffered.
            if let Some((db, journal)) = &self.paths {
                std::fs::copy(db, journal).map_err(Error::Journal)?;
            }
            // 2. Flush dirty pages.
            let dirty: Vec<(PageNum, Vec<u8>)> = inner.dirty.drain().collect();
            let count = dirty.len();
            for (pn, data) in dirty {
                inner.storage.write_at(page_offset(pn), &data)?;
                inner.cache.insert(pn, data);
            }
            // 3. Persist the new max-page counter and generation.
            inner.generation += 1;
            inner.write_stored_header()?;
            inner.storage.sync()?;
            // 4. The commit is durable; the journal is no longer needed.
            if let Some((_, journal)) = &self.paths {
                std::fs::remove_file(journal).map_err(Error::Journal)?;
            }
            debug!(
                "committed {} pages, max_page={}, generation={}",
                count, inner.max_page, inner.generation
            );
        }
        inner.in_write = false;
        Ok(())
    }

    /// Abandons the open write transaction.  No journal has been written
    /// at this point, so discarding the in-memory dirty pages is the whole
    /// rollback.
    pub fn rollback(&self) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        let discarded = inner.dirty.len();
        inner.dirty.clear();
        inner.max_page = inner.max_page_at_begin;
        inner.in_write = false;
        drop(inner);
        self.lock.unlock_exclusive();
        debug!("rolled back write transaction, discarded {} dirty pages", discarded);
    }

    /// Reads page `pn`, preferring this transaction's dirty copy, then the
    /// cache, then storage.
    pub fn get(&self, pn: PageNum) -> Result<Page, Error> {
        let mut inner = self.inner.lock().expect("lock poisoned");
        if pn == 0 || pn > inner.max_page as PageNum {
            return Err(Error::PageNumberOutOfRange(pn));
        }
        if let Some(data) = inner.dirty.get(&pn) {
            return Ok(Page::new(pn, data.clone()));
        }
        if let Some(data) = inner.cache.get(&pn) {
            return Ok(Page::new(pn, data.clone()));
        }
        let mut data = vec![0u8; PAGE_SIZE];
        inner.storage.read_at(page_offset(pn), &mut data)?;
        inner.cache.insert(pn, data.clone());
        Ok(Page::new(pn, data))
    }

    /// Buffers a modified page for the open write transaction.
    pub fn put(&self, page: Page) -> Result<(), Error> {
        let mut inner = self.inner.lock().expect("lock poisoned");
        if !inner.in_write {
            return Err(Error::NotWriting);
        }
        inner.dirty.insert(page.number(), page.into_data());
        Ok(())
    }

    /// Allocates a fresh zeroed page by bumping the max-page counter.  The
    /// counter is persisted with the commit, not here.
    pub fn new_page(&self) -> Result<Page, Error> {
        let mut inner = self.inner.lock().expect("lock poisoned");
        if !inner.in_write {
            return Err(Error::NotWriting);
        }
        inner.max_page += 1;
        let pn = inner.max_page as PageNum;
        inner.dirty.insert(pn, vec![0u8; PAGE_SIZE]);
        Ok(Page::new(pn, vec![0u8; PAGE_SIZE]))
    }

    pub fn max_page(&self) -> PageNum {
        self.inner.lock().expect("lock poisoned").max_page as PageNum
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_new_page_numbers_from_one() {
        let pager = Pager::open_memory();
        pager.begin_write().unwrap();
        assert_eq!(pager.new_page().unwrap().number(), 1);
        assert_eq!(pager.new_page().unwrap().number(), 2);
        pager.end_write().unwrap();
        assert_eq!(pager.max_page(), 2);
    }

    #[test]
    fn test_get_of_unallocated_page_fails() {
        let pager = Pager::open_memory();
        pager.begin_read().unwrap();
        assert!(matches!(pager.get(1), Err(Error::PageNumberOutOfRange(1))));
        assert!(matches!(pager.get(0), Err(Error::PageNumberOutOfRange(0))));
        pager.end_read();
    }

    #[test]
    fn test_put_outside_write_transaction_fails() {
        let pager = Pager::open_memory();
        let page = Page::new(1, vec![0u8; PAGE_SIZE]);
        assert!(matches!(pager.put(page), Err(Error::NotWriting)));
    }

    #[test]
    fn test_commit_makes_pages_durable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.db");
        {
            let pager = Pager::open(&path).unwrap();
            pager.begin_write().unwrap();
            let mut page = pager.new_page().unwrap();
            page.data_mut()[0..4].copy_from_slice(b"abcd");
            pager.put(page).unwrap();
            pager.end_write().unwrap();
        }
        let pager = Pager::open(&path).unwrap();
        pager.begin_read().unwrap();
        let page = pager.get(1).unwrap();
        assert_eq!(&page.data()[0..4], b"abcd");
        pager.end_read();
        // Clean shutdown leaves no journal behind.
        assert!(!dir.path().join(JOURNAL_FILE_NAME).exists());
    }

    #[test]
    fn test_rollback_discards_dirty_pages_and_allocation() {
        let pager = Pager::open_memory();
        pager.begin_write().unwrap();
        pager.new_page().unwrap();
        pager.rollback();
        assert_eq!(pager.max_page(), 0);
        pager.begin_read().unwrap();
        assert!(pager.get(1).is_err());
        pager.end_read();
    }

    #[test]
    fn test_external_commit_invalidates_cache() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.db");
        let a = Pager::open(&path).unwrap();
        let b = Pager::open(&path).unwrap();

        // a commits page 1 with known contents and b reads (and caches) it.
        a.begin_write().unwrap();
        let mut page = a.new_page().unwrap();
        page.data_mut()[0..2].copy_from_slice(b"v1");
        a.put(page).unwrap();
        a.end_write().unwrap();

        b.begin_read().unwrap();
        assert_eq!(&b.get(1).unwrap().data()[0..2], b"v1");
        b.end_read();

        // a commits a new version behind b's back.
        a.begin_write().unwrap();
        let mut page = a.get(1).unwrap();
        page.data_mut()[0..2].copy_from_slice(b"v2");
        a.put(page).unwrap();
        a.end_write().unwrap();

        // b's next read transaction must observe the new bytes.
        let invalidated = b.begin_read().unwrap();
        assert!(invalidated);
        assert_eq!(&b.get(1).unwrap().data()[0..2], b"v2");
        b.end_read();
    }

    #[test]
    fn test_journal_recovery_restores_pre_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.db");
        {
            let pager = Pager::open(&path).unwrap();
            pager.begin_write().unwrap();
            let mut page = pager.new_page().unwrap();
            page.data_mut()[0..3].copy_from_slice(b"old");
            pager.put(page).unwrap();
            pager.end_write().unwrap();
        }
        let pre_image = std::fs::read(&path).unwrap();

        // Simulate a crash between journal write and journal removal: the
        // journal holds the pre-image while the main file has garbage from
        // a half-finished flush.
        std::fs::write(dir.path().join(JOURNAL_FILE_NAME), &pre_image).unwrap();
        let mut clobbered = pre_image.clone();
        for b in clobbered.iter_mut().skip(RESERVED_HEADER).take(64) {
            *b = 0xAA;
        }
        std::fs::write(&path, &clobbered).unwrap();

        let pager = Pager::open(&path).unwrap();
        pager.begin_read().unwrap();
        assert_eq!(&pager.get(1).unwrap().data()[0..3], b"old");
        pager.end_read();
        assert!(!dir.path().join(JOURNAL_FILE_NAME).exists());
        assert_eq!(std::fs::read(&path).unwrap(), pre_image);
    }

    #[test]
    fn test_writer_excludes_readers() {
        let pager = Arc::new(Pager::open_memory());
        pager.begin_write().unwrap();
        pager.new_page().unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        let p2 = Arc::clone(&pager);
        let s2 = Arc::clone(&seen);
        let reader = std::thread::spawn(move || {
            p2.begin_read().unwrap();
            s2.store(p2.max_page(), Ordering::SeqCst);
            p2.end_read();
        });

        // The reader must block until the writer is done.
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert_eq!(seen.load(Ordering::SeqCst), 0);
        pager.end_write().unwrap();
        reader.join().unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
