//! The in-memory file system: the page array, the redundant free-page
//! bitmap, and serial-number allocation.
use tracing::{event, Level};

use crate::error::FsError;
use crate::geometry::Geometry;
use crate::page::{FileEntry, Label, Page, SerialNumber, SN_PART1_MASK};

/// Fixed virtual disk address of the SysDir leader page.
pub const SYSDIR_LEADER_VDA: u16 = 1;

/// An Alto file system held in memory.  Load an image into it, or
/// format it fresh; mutations stay in memory until the image is
/// saved.
pub struct AltoFs {
    pub(crate) dg: Geometry,
    pub(crate) pages: Vec<Page>,
    /// One bit per page, set iff the page is allocated.  Redundant
    /// with `label.version != VERSION_FREE` and kept in lockstep.
    pub(crate) bitmap: Vec<u16>,
    pub(crate) free_pages: u16,
    pub(crate) last_sn: SerialNumber,
}

impl AltoFs {
    /// A fresh pack with every page free.  This is not yet a valid
    /// file system; see [`AltoFs::format`].
    pub fn new(dg: Geometry) -> Result<AltoFs, FsError> {
        let length = dg.num_pages();
        let mut pages = Vec::with_capacity(length);
        for vda in 0..length as u16 {
            let rda = dg.vda_to_rda(vda)?;
            pages.push(Page::new_free(vda, rda));
        }
        let mut fs = AltoFs {
            dg,
            pages,
            bitmap: vec![0; length.div_ceil(16)],
            free_pages: 0,
            last_sn: SerialNumber::default(),
        };
        fs.rebuild_bitmap();
        Ok(fs)
    }

    pub fn geometry(&self) -> Geometry {
        self.dg
    }

    /// Total pages on the pack.
    pub fn len(&self) -> u16 {
        self.pages.len() as u16
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn free_pages(&self) -> u16 {
        self.free_pages
    }

    pub fn page(&self, vda: u16) -> Result<&Page, FsError> {
        self.pages
            .get(usize::from(vda))
            .ok_or(FsError::BadPageNumber(vda))
    }

    pub fn page_mut(&mut self, vda: u16) -> Result<&mut Page, FsError> {
        self.pages
            .get_mut(usize::from(vda))
            .ok_or(FsError::BadPageNumber(vda))
    }

    /// Follows a label link.  RDA 0 is the chain terminator, mapped
    /// to `None`.
    pub fn link_vda(&self, rda: u16) -> Result<Option<u16>, FsError> {
        if rda == 0 {
            Ok(None)
        } else {
            self.dg.rda_to_vda(rda).map(Some)
        }
    }

    pub fn rda_of(&self, vda: u16) -> Result<u16, FsError> {
        self.dg.vda_to_rda(vda)
    }

    /// Whether the bitmap marks `vda` allocated.
    pub fn bit(&self, vda: u16) -> bool {
        let word = usize::from(vda) / 16;
        let bit = 15 - (vda % 16);
        self.bitmap[word] & (1 << bit) != 0
    }

    fn set_bit(&mut self, vda: u16, allocated: bool) {
        let word = usize::from(vda) / 16;
        let bit = 15 - (vda % 16);
        if allocated {
            self.bitmap[word] |= 1 << bit;
        } else {
            self.bitmap[word] &= !(1 << bit);
        }
    }

    /// Recomputes the bitmap and free-page count from the labels,
    /// which are authoritative.
    pub fn rebuild_bitmap(&mut self) {
        self.bitmap.iter_mut().for_each(|w| *w = 0);
        let mut free = 0;
        for vda in 0..self.len() {
            if self.pages[usize::from(vda)].label.is_free() {
                free += 1;
            } else {
                self.set_bit(vda, true);
            }
        }
        self.free_pages = free;
    }

    /// Finds the first free page and marks it allocated in the
    /// bitmap.  The caller must write a non-free label version to the
    /// page before releasing control, so that bitmap and labels stay
    /// in agreement.
    pub fn find_free_page(&mut self) -> Result<u16, FsError> {
        for vda in 0..self.len() {
            if !self.bit(vda) {
                self.set_bit(vda, true);
                self.free_pages -= 1;
                return Ok(vda);
            }
        }
        event!(Level::WARN, "pack is full");
        Err(FsError::DiskFull)
    }

    /// Returns a page to the free list: free label, cleared bitmap
    /// bit.
    pub fn release_page(&mut self, vda: u16) -> Result<(), FsError> {
        let page = self.page_mut(vda)?;
        page.label = Label::free();
        self.set_bit(vda, false);
        self.free_pages += 1;
        Ok(())
    }

    /// Allocates the next serial number, with the directory flag if
    /// requested.
    pub fn alloc_sn(&mut self, directory: bool) -> SerialNumber {
        self.last_sn = SerialNumber {
            word1: self.last_sn.word1 & SN_PART1_MASK,
            word2: self.last_sn.word2,
        }
        .successor();
        let mut sn = self.last_sn;
        if directory {
            sn.word1 |= crate::page::SN_DIRECTORY;
        }
        sn
    }

    /// Recovers the serial-number counter from the labels, for images
    /// that carry no usable descriptor.
    pub(crate) fn recover_last_sn(&mut self) {
        let mut best = 0u32;
        for page in &self.pages {
            if !page.label.is_free() && !page.label.is_bad() {
                best = best.max(page.label.sn.file_sn());
            }
        }
        self.last_sn = SerialNumber {
            word1: ((best >> 16) as u16) & SN_PART1_MASK,
            word2: best as u16,
        };
    }

    /// Builds the [`FileEntry`] describing the file whose leader page
    /// is at `leader_vda`.
    pub fn file_entry(&self, leader_vda: u16) -> Result<FileEntry, FsError> {
        let page = self.page(leader_vda)?;
        if page.label.is_free() || page.label.file_pgnum != 0 {
            return Err(FsError::BrokenChain {
                vda: leader_vda,
                reason: "not a leader page",
            });
        }
        Ok(FileEntry {
            sn: page.label.sn,
            version: page.label.version,
            blank: 0,
            leader_vda,
        })
    }

    /// Calls `f` for every leader page on the pack (every allocated
    /// page with `file_pgnum == 0`), stopping early if `f` returns
    /// false.
    pub fn scan_files<F>(&self, mut f: F) -> Result<(), FsError>
    where
        F: FnMut(&FileEntry) -> bool,
    {
        for vda in 0..self.len() {
            let label = &self.pages[usize::from(vda)].label;
            if label.is_free() || label.is_bad() || label.file_pgnum != 0 {
                continue;
            }
            let fe = self.file_entry(vda)?;
            if !f(&fe) {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::VERSION_FREE;

    #[test]
    fn fresh_pack_is_all_free() {
        let fs = AltoFs::new(Geometry::standard_diablo()).unwrap();
        assert_eq!(fs.free_pages(), 4872);
        for vda in 0..fs.len() {
            assert!(!fs.bit(vda));
            assert_eq!(fs.page(vda).unwrap().label.version, VERSION_FREE);
        }
    }

    #[test]
    fn allocation_keeps_bitmap_and_count_in_step() {
        let mut fs = AltoFs::new(Geometry::standard_diablo()).unwrap();
        let a = fs.find_free_page().unwrap();
        assert_eq!(a, 0);
        fs.page_mut(a).unwrap().label.version = 1;
        let b = fs.find_free_page().unwrap();
        assert_eq!(b, 1);
        fs.page_mut(b).unwrap().label.version = 1;
        assert_eq!(fs.free_pages(), 4870);
        assert!(fs.bit(a) && fs.bit(b));

        fs.release_page(a).unwrap();
        assert!(!fs.bit(a));
        assert_eq!(fs.free_pages(), 4871);
        // The released page is the next one handed out.
        assert_eq!(fs.find_free_page().unwrap(), a);
    }

    #[test]
    fn sn_allocation_is_monotonic() {
        let mut fs = AltoFs::new(Geometry::standard_diablo()).unwrap();
        let a = fs.alloc_sn(false);
        let b = fs.alloc_sn(true);
        let c = fs.alloc_sn(false);
        assert!(b.is_directory());
        assert!(!a.is_directory() && !c.is_directory());
        assert!(a.file_sn() < b.file_sn());
        assert!(b.file_sn() < c.file_sn());
    }
}
