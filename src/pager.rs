//! File-backed page store: header bookkeeping, the free list, and
//! positioned reads/writes of whole pages.
//!
//! There is no page cache. Every [`Pager`] method that touches node data
//! goes straight to the file via `read_exact_at`/`write_all_at`, matching
//! the no-caching, no-recovery-beyond-sync scope of the format.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

use tracing::{debug, warn};

use crate::error::Error;
use crate::node::Node;
use crate::page::{PageOffset, FREE_LIST_EXTENSION, PAGE_SIZE};

const HEADER_SIZE: usize = 24;

/// The fixed-size header page: root pointer, free-list head, and page count.
#[derive(Clone, Copy, Debug)]
pub struct Header {
    pub root: PageOffset,
    pub free_head: PageOffset,
    pub page_count: u64,
}

impl Header {
    fn read(file: &File) -> Result<Header, Error> {
        let mut buf = [0u8; HEADER_SIZE];
        file.read_exact_at(&mut buf, 0)?;
        Ok(Header {
            root: PageOffset::new(i64::from_le_bytes(buf[0..8].try_into().unwrap())),
            free_head: PageOffset::new(i64::from_le_bytes(buf[8..16].try_into().unwrap())),
            page_count: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
        })
    }

    fn write(&self, file: &File) -> Result<(), Error> {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..8].copy_from_slice(&self.root.raw().to_le_bytes());
        buf[8..16].copy_from_slice(&self.free_head.raw().to_le_bytes());
        buf[16..24].copy_from_slice(&self.page_count.to_le_bytes());
        file.write_all_at(&buf, 0)?;
        Ok(())
    }
}

pub struct Pager {
    file: File,
}

impl Pager {
    /// Open the file at `path`, formatting it as an empty index if it is
    /// new or zero-length.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Pager, Error> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        let mut pager = Pager { file };
        if pager.file.metadata()?.len() == 0 {
            pager.format_new()?;
        }
        Ok(pager)
    }

    /// Lay down a header page with an empty tree and one batch of free
    /// pages, the initial format described for a freshly created file.
    fn format_new(&mut self) -> Result<(), Error> {
        self.file.set_len(PAGE_SIZE as u64)?;
        let mut header = Header {
            root: PageOffset::NONE,
            free_head: PageOffset::NONE,
            page_count: 0,
        };
        header.write(&self.file)?;
        self.extend_free_list(&mut header, FREE_LIST_EXTENSION)?;
        header.write(&self.file)?;
        debug!(pages = header.page_count, "formatted new index file");
        Ok(())
    }

    pub fn header(&self) -> Result<Header, Error> {
        Header::read(&self.file)
    }

    fn corrupt(&self, offset: i64, message: &str) -> Error {
        warn!(offset, message, "corruption detected");
        Error::Corruption { offset, message: message.to_string() }
    }

    pub fn set_root(&mut self, root: PageOffset) -> Result<(), Error> {
        let mut header = self.header()?;
        header.root = root;
        header.write(&self.file)
    }

    pub fn read_node(&self, offset: PageOffset) -> Result<Node, Error> {
        let addr = offset
            .as_u64()
            .ok_or_else(|| self.corrupt(offset.raw(), "attempted to read the none page offset"))?;
        let mut buf = [0u8; PAGE_SIZE];
        self.file.read_exact_at(&mut buf, addr)?;
        Ok(Node::from_bytes(buf))
    }

    pub fn write_node(&mut self, offset: PageOffset, node: &Node) -> Result<(), Error> {
        let addr = offset
            .as_u64()
            .ok_or_else(|| self.corrupt(offset.raw(), "attempted to write the none page offset"))?;
        self.file.write_all_at(node.as_bytes(), addr)?;
        Ok(())
    }

    fn read_free_next(&self, offset: PageOffset) -> Result<PageOffset, Error> {
        let addr = offset
            .as_u64()
            .ok_or_else(|| self.corrupt(offset.raw(), "attempted to read the none page offset"))?;
        let mut buf = [0u8; 8];
        self.file.read_exact_at(&mut buf, addr)?;
        Ok(PageOffset::new(i64::from_le_bytes(buf)))
    }

    fn write_free_next(&mut self, offset: PageOffset, next: PageOffset) -> Result<(), Error> {
        let addr = offset
            .as_u64()
            .ok_or_else(|| self.corrupt(offset.raw(), "attempted to write the none page offset"))?;
        self.file.write_all_at(&next.raw().to_le_bytes(), addr)?;
        Ok(())
    }

    /// Append `count` fresh pages to the file and splice them onto the
    /// front of the free list, updating `header.free_head` and
    /// `header.page_count` in place. Does not persist `header` itself.
    fn extend_free_list(&mut self, header: &mut Header, count: u64) -> Result<(), Error> {
        let first_new = header.page_count + 1;
        let new_len = (first_new + count - 1) * PAGE_SIZE as u64 + PAGE_SIZE as u64;
        self.file.set_len(new_len)?;

        let mut next = header.free_head;
        for i in (0..count).rev() {
            let page = PageOffset::nth_page(first_new + i);
            self.write_free_next(page, next)?;
            next = page;
        }
        header.free_head = next;
        header.page_count += count;
        Ok(())
    }

    /// Pop a page off the free list, extending the list first if fewer
    /// than two free pages remain (so the pop never empties the list down
    /// to a dangling head).
    pub fn allocate_page(&mut self) -> Result<PageOffset, Error> {
        let mut header = self.header()?;
        if header.free_head.is_none() {
            self.extend_free_list(&mut header, FREE_LIST_EXTENSION)?;
        } else {
            let next = self.read_free_next(header.free_head)?;
            if next.is_none() {
                self.extend_free_list(&mut header, FREE_LIST_EXTENSION)?;
            }
        }
        let page = header.free_head;
        let next = self.read_free_next(page)?;
        header.free_head = next;
        header.write(&self.file)?;
        debug!(offset = page.raw(), "allocated page");
        Ok(page)
    }

    /// Return `offset` to the free list, splicing it onto the current head.
    pub fn release_page(&mut self, offset: PageOffset) -> Result<(), Error> {
        let mut header = self.header()?;
        self.write_free_next(offset, header.free_head)?;
        header.free_head = offset;
        header.write(&self.file)?;
        debug!(offset = offset.raw(), "released page");
        Ok(())
    }

    pub fn sync(&self) -> Result<(), Error> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Walk the free list from `free_head` and collect every page on it.
    /// Test-only: used by the tree's invariant checker to confirm no page
    /// is simultaneously reachable from the root and sitting on the free
    /// list.
    #[cfg(test)]
    pub(crate) fn free_list_pages(&self) -> Result<Vec<PageOffset>, Error> {
        let header = self.header()?;
        let mut pages = Vec::new();
        let mut cur = header.free_head;
        while !cur.is_none() {
            pages.push(cur);
            cur = self.read_free_next(cur)?;
        }
        Ok(pages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn format_new_creates_empty_tree_with_free_pages() {
        let tmp = NamedTempFile::new().unwrap();
        let pager = Pager::open(tmp.path()).unwrap();
        let header = pager.header().unwrap();
        assert!(header.root.is_none());
        assert!(!header.free_head.is_none());
        assert_eq!(header.page_count, FREE_LIST_EXTENSION);
    }

    #[test]
    fn allocate_and_release_round_trip() {
        let tmp = NamedTempFile::new().unwrap();
        let mut pager = Pager::open(tmp.path()).unwrap();
        let page = pager.allocate_page().unwrap();
        let node = Node::new_leaf();
        pager.write_node(page, &node).unwrap();
        let read_back = pager.read_node(page).unwrap();
        assert_eq!(read_back.num_keys(), 0);
        pager.release_page(page).unwrap();
        let header = pager.header().unwrap();
        assert_eq!(header.free_head.raw(), page.raw());
    }

    #[test]
    fn allocate_grows_free_list_when_exhausted() {
        let tmp = NamedTempFile::new().unwrap();
        let mut pager = Pager::open(tmp.path()).unwrap();
        let initial_pages = pager.header().unwrap().page_count;
        for _ in 0..initial_pages + 3 {
            pager.allocate_page().unwrap();
        }
        let header = pager.header().unwrap();
        assert!(header.page_count > initial_pages);
    }
}
