//! The archiver surface: formatting a fresh pack, inserting,
//! extracting, replacing, removing and copying files, directory
//! creation, boot installation, and the DiskDescriptor upkeep.
use tracing::{event, Level};

use crate::error::FsError;
use crate::page::{set_data_word, FileEntry, Page, PAGE_DATA_SIZE};
use crate::volume::{AltoFs, SYSDIR_LEADER_VDA};

/// Knobs for [`AltoFs::insert_file`].
#[derive(Debug, Clone, Copy)]
pub struct InsertOptions {
    /// Rewrite the DiskDescriptor after the mutation (`-nud`
    /// suppresses this).
    pub update_descriptor: bool,
}

impl Default for InsertOptions {
    fn default() -> InsertOptions {
        InsertOptions {
            update_descriptor: true,
        }
    }
}

/// Knobs for [`AltoFs::remove_file`].
#[derive(Debug, Clone, Copy)]
pub struct RemoveOptions {
    /// Return the file's pages to the free list (`-nru` suppresses
    /// this, leaving the chain allocated but unnamed).
    pub remove_underlying: bool,
    /// Rewrite the DiskDescriptor after the mutation (`-nud`
    /// suppresses this).
    pub update_descriptor: bool,
}

impl Default for RemoveOptions {
    fn default() -> RemoveOptions {
        RemoveOptions {
            remove_underlying: true,
            update_descriptor: true,
        }
    }
}

/// Name of the descriptor file registered in SysDir.
pub const DISK_DESCRIPTOR_NAME: &str = "DiskDescriptor";

/// Words in the descriptor ahead of the bitmap.
const DESCRIPTOR_HEADER_WORDS: usize = 16;

impl AltoFs {
    /// Initialises a fresh file system on this pack: the boot page at
    /// VDA 0, SysDir with its leader at VDA 1 (registered in itself),
    /// and the DiskDescriptor file.  Everything previously on the
    /// pack is discarded.
    pub fn format(&mut self, timestamp: u32) -> Result<(), FsError> {
        for vda in 0..self.len() {
            let rda = self.rda_of(vda)?;
            self.pages[usize::from(vda)] = Page::new_free(vda, rda);
        }
        self.last_sn = Default::default();
        self.rebuild_bitmap();

        // The boot page is a one-page file of its own: it is its own
        // leader and belongs to no directory.
        let boot_vda = self.find_free_page()?;
        debug_assert_eq!(boot_vda, 0);
        let boot_sn = self.alloc_sn(false);
        let boot = self.page_mut(boot_vda)?;
        boot.label.version = 1;
        boot.label.sn = boot_sn;
        boot.label.file_pgnum = 0;
        boot.label.nbytes = PAGE_DATA_SIZE as u16;

        // SysDir's leader must land on the fixed VDA the tools
        // hard-wire.
        let sysdir_vda = self.find_free_page()?;
        debug_assert_eq!(sysdir_vda, SYSDIR_LEADER_VDA);
        let sysdir_sn = self.alloc_sn(true);
        let page = self.page_mut(sysdir_vda)?;
        page.label.version = 1;
        page.label.sn = sysdir_sn;
        page.label.file_pgnum = 0;
        page.label.nbytes = PAGE_DATA_SIZE as u16;

        let sysdir = self.file_entry(sysdir_vda)?;
        let info = crate::file::FileInfo {
            name: "SysDir".to_string(),
            created: timestamp,
            written: timestamp,
            read: timestamp,
            consecutive: 0,
            change_sn: 0,
            fe: sysdir,
            last_page: crate::page::FilePosition {
                vda: sysdir_vda,
                pgnum: 0,
                pos: PAGE_DATA_SIZE as u16,
            },
        };
        self.set_file_info(&sysdir, &info)?;
        self.add_directory_entry(&sysdir, &sysdir, "SysDir")?;

        self.create_file(&sysdir, DISK_DESCRIPTOR_NAME, false, timestamp)?;
        self.update_descriptor()?;
        event!(
            Level::INFO,
            "formatted pack: {} pages, {} free",
            self.len(),
            self.free_pages()
        );
        Ok(())
    }

    fn descriptor_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; 2 * (DESCRIPTOR_HEADER_WORDS + self.bitmap.len())];
        set_data_word(&mut bytes, 0, self.dg.num_disks);
        set_data_word(&mut bytes, 1, self.dg.num_cylinders);
        set_data_word(&mut bytes, 2, self.dg.num_heads);
        set_data_word(&mut bytes, 3, self.dg.num_sectors);
        set_data_word(&mut bytes, 4, self.last_sn.word1);
        set_data_word(&mut bytes, 5, self.last_sn.word2);
        set_data_word(&mut bytes, 6, 0);
        set_data_word(&mut bytes, 7, self.bitmap.len() as u16);
        set_data_word(&mut bytes, 8, self.free_pages);
        for (i, word) in self.bitmap.iter().enumerate() {
            set_data_word(&mut bytes, DESCRIPTOR_HEADER_WORDS + i, *word);
        }
        bytes
    }

    /// Rewrites the DiskDescriptor file from the live state.  Written
    /// twice so the stored bitmap reflects any pages the write itself
    /// allocated.
    pub fn update_descriptor(&mut self) -> Result<(), FsError> {
        let fe = self.find_file(DISK_DESCRIPTOR_NAME)?;
        self.replace_contents(&fe, &self.descriptor_bytes(), None)?;
        self.replace_contents(&fe, &self.descriptor_bytes(), None)?;
        Ok(())
    }

    /// Replaces a file's contents, truncating whatever tail is left
    /// over.  When `written` carries a timestamp the leader's written
    /// time is updated.
    pub fn replace_contents(
        &mut self,
        fe: &FileEntry,
        data: &[u8],
        written: Option<u32>,
    ) -> Result<(), FsError> {
        let mut of = self.open(fe, false)?;
        self.write(&mut of, data, true)?;
        self.trim(&of)?;
        if let Some(ts) = written {
            let mut info = self.file_info(fe)?;
            info.written = ts;
            self.set_file_info(fe, &info)?;
        }
        self.refresh_last_page_hint(fe)
    }

    /// Creates (or overwrites) `dest_path` with `data`.  Returns the
    /// file's entry.
    pub fn insert_file(
        &mut self,
        dest_path: &str,
        data: &[u8],
        timestamp: u32,
        opts: InsertOptions,
    ) -> Result<FileEntry, FsError> {
        let (parent, name) = self.resolve_parent(dest_path)?;
        let fe = match self.lookup(&parent, name) {
            Ok(existing) => existing,
            Err(FsError::FileNotFound(_)) => self.create_file(&parent, name, false, timestamp)?,
            Err(e) => return Err(e),
        };
        self.replace_contents(&fe, data, Some(timestamp))?;
        if opts.update_descriptor {
            self.update_descriptor()?;
        }
        event!(Level::INFO, "inserted `{dest_path}` ({} bytes)", data.len());
        Ok(fe)
    }

    /// The file's contents as a byte stream (leader page excluded
    /// unless requested).
    pub fn extract_file(&self, fe: &FileEntry, include_leader: bool) -> Result<Vec<u8>, FsError> {
        self.read_all(fe, include_leader)
    }

    /// Unlinks `path` from its directory and, unless suppressed,
    /// returns the file's pages to the free list.
    pub fn remove_file(&mut self, path: &str, opts: RemoveOptions) -> Result<(), FsError> {
        let (parent, name) = self.resolve_parent(path)?;
        let fe = self.remove_directory_entry(&parent, name)?;
        if opts.remove_underlying {
            let mut vda = Some(fe.leader_vda);
            while let Some(v) = vda {
                vda = self.link_vda(self.page(v)?.label.next_rda)?;
                self.release_page(v)?;
            }
        }
        if opts.update_descriptor {
            self.update_descriptor()?;
        }
        event!(Level::INFO, "removed `{path}`");
        Ok(())
    }

    /// Copies `src_path` to `dst_path` within the image.
    pub fn copy_file(
        &mut self,
        src_path: &str,
        dst_path: &str,
        timestamp: u32,
        opts: InsertOptions,
    ) -> Result<FileEntry, FsError> {
        let src = self.find_file(src_path)?;
        let data = self.read_all(&src, false)?;
        self.insert_file(dst_path, &data, timestamp, opts)
    }

    /// Creates a subdirectory.
    pub fn make_directory(&mut self, path: &str, timestamp: u32) -> Result<FileEntry, FsError> {
        let (parent, name) = self.resolve_parent(path)?;
        let fe = self.create_file(&parent, name, true, timestamp)?;
        event!(Level::INFO, "created directory `{path}`");
        Ok(fe)
    }

    /// Copies the first data page of `path` onto the boot sector.
    pub fn install_boot(&mut self, path: &str) -> Result<(), FsError> {
        let fe = self.find_file(path)?;
        let leader = self.page(fe.leader_vda)?;
        let first_data = self
            .link_vda(leader.label.next_rda)?
            .ok_or(FsError::BrokenChain {
                vda: fe.leader_vda,
                reason: "boot file has no data page",
            })?;
        let (data, nbytes) = {
            let page = self.page(first_data)?;
            (page.data, page.label.nbytes)
        };
        let boot = self.page_mut(0)?;
        boot.data = data;
        boot.label.nbytes = nbytes.max(1);
        event!(Level::INFO, "installed `{path}` as the boot page");
        Ok(())
    }

    /// Zeroes the data of every free page.
    pub fn wipe_free_pages(&mut self) {
        let mut wiped = 0u32;
        for page in &mut self.pages {
            if page.label.is_free() {
                page.data.fill(0);
                wiped += 1;
            }
        }
        event!(Level::INFO, "wiped {wiped} free pages");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Geometry;
    use crate::page::VERSION_FREE;

    fn formatted() -> AltoFs {
        let mut fs = AltoFs::new(Geometry::standard_diablo()).unwrap();
        fs.format(1_000_000).unwrap();
        fs
    }

    /// Bitmap invariant: bit(vda) set iff the label says allocated.
    fn assert_bitmap_invariant(fs: &AltoFs) {
        for vda in 0..fs.len() {
            let allocated = fs.page(vda).unwrap().label.version != VERSION_FREE;
            assert_eq!(fs.bit(vda), allocated, "bitmap disagrees at VDA {vda}");
        }
    }

    /// Chain-closure invariant for one file: page numbers count up
    /// from zero and the back links agree with the forward links.
    fn assert_chain_closed(fs: &AltoFs, fe: &FileEntry) {
        let mut vda = fe.leader_vda;
        let mut expected = 0u16;
        loop {
            let page = fs.page(vda).unwrap();
            assert_eq!(page.label.file_pgnum, expected);
            assert_eq!(page.label.sn, fe.sn);
            match fs.link_vda(page.label.next_rda).unwrap() {
                Some(next) => {
                    // The back link must point where we came from.
                    let back = fs
                        .link_vda(fs.page(next).unwrap().label.prev_rda)
                        .unwrap()
                        .unwrap();
                    assert_eq!(back, vda);
                    vda = next;
                    expected += 1;
                }
                None => break,
            }
        }
    }

    #[test]
    fn format_builds_a_consistent_pack() {
        let fs = formatted();
        assert_bitmap_invariant(&fs);
        let sysdir = fs.find_file("SysDir").unwrap();
        assert!(sysdir.sn.is_directory());
        assert_eq!(sysdir.leader_vda, SYSDIR_LEADER_VDA);
        assert!(fs.find_file(DISK_DESCRIPTOR_NAME).is_ok());
    }

    #[test]
    fn insert_then_extract_round_trips() {
        let mut fs = formatted();
        let body: Vec<u8> = (0..40_000u32).map(|i| (i * 7) as u8).collect();
        let fe = fs
            .insert_file("doc.txt", &body, 777, InsertOptions::default())
            .unwrap();

        assert_eq!(fs.extract_file(&fe, false).unwrap(), body);
        assert_eq!(fs.file_info(&fe).unwrap().name, "doc.txt");
        assert_eq!(fs.file_length(&fe).unwrap(), body.len());
        assert_bitmap_invariant(&fs);
        assert_chain_closed(&fs, &fe);
    }

    #[test]
    fn reinsert_overwrites_and_shrinks() {
        let mut fs = formatted();
        fs.insert_file("a.bin", &[9u8; 5000], 1, InsertOptions::default())
            .unwrap();
        let free_mid = fs.free_pages();
        let fe = fs
            .insert_file("a.bin", b"tiny", 2, InsertOptions::default())
            .unwrap();
        assert_eq!(fs.extract_file(&fe, false).unwrap(), b"tiny");
        assert!(fs.free_pages() > free_mid);
        assert_eq!(fs.file_info(&fe).unwrap().written, 2);
        assert_bitmap_invariant(&fs);
    }

    #[test]
    fn remove_frees_pages_unless_suppressed() {
        let mut fs = formatted();
        fs.insert_file("gone.soon", &[1u8; 3000], 1, InsertOptions::default())
            .unwrap();
        let free_before = fs.free_pages();
        fs.remove_file("gone.soon", RemoveOptions::default()).unwrap();
        // Leader plus six data pages come back.
        assert_eq!(fs.free_pages(), free_before + 7);
        assert!(matches!(
            fs.find_file("gone.soon"),
            Err(FsError::FileNotFound(_))
        ));
        assert_bitmap_invariant(&fs);

        // With -nru the chain stays allocated.
        fs.insert_file("kept.pages", &[1u8; 1000], 1, InsertOptions::default())
            .unwrap();
        let free_before = fs.free_pages();
        fs.remove_file(
            "kept.pages",
            RemoveOptions {
                remove_underlying: false,
                update_descriptor: true,
            },
        )
        .unwrap();
        assert_eq!(fs.free_pages(), free_before);
        assert_bitmap_invariant(&fs);
    }

    #[test]
    fn copy_duplicates_content_under_a_new_name() {
        let mut fs = formatted();
        fs.insert_file("src.dat", &[5u8; 600], 1, InsertOptions::default())
            .unwrap();
        fs.copy_file("src.dat", "dst.dat", 2, InsertOptions::default())
            .unwrap();
        let src = fs.find_file("src.dat").unwrap();
        let dst = fs.find_file("dst.dat").unwrap();
        assert_ne!(src.leader_vda, dst.leader_vda);
        assert_ne!(src.sn, dst.sn);
        assert_eq!(
            fs.extract_file(&src, false).unwrap(),
            fs.extract_file(&dst, false).unwrap()
        );
    }

    #[test]
    fn mkdir_then_insert_within() {
        let mut fs = formatted();
        fs.make_directory("docs", 1).unwrap();
        fs.insert_file("docs/memo.txt", b"memo", 2, InsertOptions::default())
            .unwrap();
        let fe = fs.find_file("docs/memo.txt").unwrap();
        assert_eq!(fs.extract_file(&fe, false).unwrap(), b"memo");
        assert_bitmap_invariant(&fs);
    }

    #[test]
    fn install_boot_copies_the_first_data_page() {
        let mut fs = formatted();
        let mut body = vec![0u8; 700];
        body[0] = 0xAA;
        body[511] = 0xBB;
        fs.insert_file("boot.run", &body, 1, InsertOptions::default())
            .unwrap();
        fs.install_boot("boot.run").unwrap();
        let boot = fs.page(0).unwrap();
        assert_eq!(boot.data[0], 0xAA);
        assert_eq!(boot.data[511], 0xBB);
    }

    #[test]
    fn wipe_free_pages_only_touches_free_pages() {
        let mut fs = formatted();
        let fe = fs
            .insert_file("keep.me", &[3u8; 100], 1, InsertOptions::default())
            .unwrap();
        // Dirty a free page by hand.
        let free_vda = (0..fs.len())
            .find(|&v| fs.page(v).unwrap().label.is_free())
            .unwrap();
        fs.page_mut(free_vda).unwrap().data[0] = 0xFF;

        fs.wipe_free_pages();
        assert_eq!(fs.page(free_vda).unwrap().data[0], 0);
        assert_eq!(fs.extract_file(&fe, false).unwrap(), vec![3u8; 100]);
    }

    #[test]
    fn descriptor_tracks_the_free_count() {
        let mut fs = formatted();
        fs.insert_file("some.file", &[0u8; 2000], 1, InsertOptions::default())
            .unwrap();
        let fe = fs.find_file(DISK_DESCRIPTOR_NAME).unwrap();
        let bytes = fs.extract_file(&fe, false).unwrap();
        let stored_free = crate::page::data_word(&bytes, 8);
        assert_eq!(stored_free, fs.free_pages());
        let zero_bits = (0..fs.len()).filter(|&v| !fs.bit(v)).count();
        assert_eq!(usize::from(stored_free), zero_bits);
    }
}
