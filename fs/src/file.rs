//! File-level operations: open, read, write (with optional
//! extension), trim, length, and the leader-page metadata codec.
use tracing::{event, Level};

use crate::error::FsError;
use crate::page::{
    data_dword, data_word, set_data_dword, set_data_word, FileEntry, FilePosition, NAME_LENGTH,
    PAGE_DATA_SIZE,
};
use crate::volume::AltoFs;

/// An open file: the identity of the file plus a cursor.  All the
/// actual state lives in the file system; this is freely copyable.
#[derive(Debug, Clone, Copy)]
pub struct OpenFile {
    pub fe: FileEntry,
    pub pos: FilePosition,
}

/// The metadata stored on a file's leader page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub name: String,
    /// Seconds since the epoch, as the original tools stored them.
    pub created: u32,
    pub written: u32,
    pub read: u32,
    pub consecutive: u8,
    pub change_sn: u8,
    /// Hint: the file's own entry.
    pub fe: FileEntry,
    /// Hint: position of the end of the file.
    pub last_page: FilePosition,
}

// Leader page layout, in data-area word indices.
const LD_CREATED: usize = 0;
const LD_WRITTEN: usize = 2;
const LD_READ: usize = 4;
const LD_NAME_BYTE: usize = 12;
const LD_CONSECUTIVE_BYTE: usize = LD_NAME_BYTE + NAME_LENGTH;
const LD_CHANGE_SN_BYTE: usize = LD_CONSECUTIVE_BYTE + 1;
const LD_FE_HINT: usize = 246;
const LD_LAST_PAGE_HINT: usize = 251;

impl AltoFs {
    /// Opens the file identified by `fe`.  With `include_leader` the
    /// cursor starts at the top of the leader page; otherwise it
    /// starts at the file's contents (the leader is positioned as
    /// fully consumed, so the first read or write lands on the first
    /// data page).
    pub fn open(&self, fe: &FileEntry, include_leader: bool) -> Result<OpenFile, FsError> {
        let leader = self.page(fe.leader_vda)?;
        if leader.label.is_free() || leader.label.file_pgnum != 0 {
            return Err(FsError::BrokenChain {
                vda: fe.leader_vda,
                reason: "open: leader page expected",
            });
        }
        let pos = FilePosition {
            vda: fe.leader_vda,
            pgnum: 0,
            pos: if include_leader {
                0
            } else {
                leader.label.nbytes
            },
        };
        Ok(OpenFile { fe: *fe, pos })
    }

    /// Copies up to `dst.len()` bytes from the cursor, following the
    /// chain.  Returns the byte count actually read; less than
    /// requested means end of file.
    pub fn read(&self, of: &mut OpenFile, dst: &mut [u8]) -> Result<usize, FsError> {
        let mut copied = 0;
        while copied < dst.len() {
            let page = self.page(of.pos.vda)?;
            let pos = usize::from(of.pos.pos);
            let used = usize::from(page.label.nbytes);
            let n = used.saturating_sub(pos).min(dst.len() - copied);
            dst[copied..copied + n].copy_from_slice(&page.data[pos..pos + n]);
            of.pos.pos += n as u16;
            copied += n;
            if copied == dst.len() {
                break;
            }
            match self.link_vda(page.label.next_rda)? {
                Some(next) => {
                    of.pos.vda = next;
                    of.pos.pgnum += 1;
                    of.pos.pos = 0;
                }
                None => break,
            }
        }
        Ok(copied)
    }

    /// Writes `src` at the cursor.  When the chain runs out and
    /// `extend` is set, free pages are allocated and linked in; the
    /// new pages carry the file's serial number and the next page
    /// numbers in sequence.  Returns the byte count written.
    pub fn write(&mut self, of: &mut OpenFile, src: &[u8], extend: bool) -> Result<usize, FsError> {
        let mut written = 0;
        loop {
            let vda = of.pos.vda;
            let page = self.page_mut(vda)?;
            let pos = usize::from(of.pos.pos);
            let n = (PAGE_DATA_SIZE - pos).min(src.len() - written);
            page.data[pos..pos + n].copy_from_slice(&src[written..written + n]);
            of.pos.pos += n as u16;
            if of.pos.pos > page.label.nbytes {
                page.label.nbytes = of.pos.pos;
            }
            written += n;
            if written == src.len() {
                break;
            }
            let next_rda = page.label.next_rda;
            match self.link_vda(next_rda)? {
                Some(next) => {
                    of.pos.vda = next;
                    of.pos.pgnum += 1;
                    of.pos.pos = 0;
                }
                None if extend => {
                    let next = self.extend_chain(vda)?;
                    of.pos.vda = next;
                    of.pos.pgnum += 1;
                    of.pos.pos = 0;
                }
                None => break,
            }
        }
        Ok(written)
    }

    /// Allocates a free page and links it after `vda` in the chain.
    fn extend_chain(&mut self, vda: u16) -> Result<u16, FsError> {
        let new_vda = self.find_free_page()?;
        let cur = self.page(vda)?.label;
        let cur_rda = self.rda_of(vda)?;
        let new_rda = self.rda_of(new_vda)?;

        let new = self.page_mut(new_vda)?;
        new.label.version = cur.version;
        new.label.sn = cur.sn;
        new.label.file_pgnum = cur.file_pgnum + 1;
        new.label.nbytes = 0;
        new.label.prev_rda = cur_rda;
        new.label.next_rda = 0;
        new.data.fill(0);

        self.page_mut(vda)?.label.next_rda = new_rda;
        Ok(new_vda)
    }

    /// Cuts the file at the cursor: the current page keeps `pos`
    /// bytes (the rest zeroed), every following page goes back to the
    /// free list.
    pub fn trim(&mut self, of: &OpenFile) -> Result<(), FsError> {
        let vda = of.pos.vda;
        let page = self.page_mut(vda)?;
        page.label.nbytes = of.pos.pos;
        page.data[usize::from(of.pos.pos)..].fill(0);
        let next_rda = page.label.next_rda;
        page.label.next_rda = 0;
        let mut next = self.link_vda(next_rda)?;
        let mut freed = 0;
        while let Some(v) = next {
            next = self.link_vda(self.page(v)?.label.next_rda)?;
            self.release_page(v)?;
            freed += 1;
        }
        if freed > 0 {
            event!(Level::DEBUG, "trim released {freed} pages");
        }
        Ok(())
    }

    /// The file's content length in bytes (leader page excluded).
    pub fn file_length(&self, fe: &FileEntry) -> Result<usize, FsError> {
        let mut length = 0;
        let mut vda = Some(fe.leader_vda);
        let mut expected_pgnum = 0u16;
        while let Some(v) = vda {
            let page = self.page(v)?;
            if page.label.file_pgnum != expected_pgnum {
                return Err(FsError::BrokenChain {
                    vda: v,
                    reason: "page numbers not sequential",
                });
            }
            if expected_pgnum > 0 {
                length += usize::from(page.label.nbytes);
            }
            vda = self.link_vda(page.label.next_rda)?;
            expected_pgnum += 1;
        }
        Ok(length)
    }

    /// Reads the whole file contents.
    pub fn read_all(&self, fe: &FileEntry, include_leader: bool) -> Result<Vec<u8>, FsError> {
        let mut of = self.open(fe, include_leader)?;
        let length = self.file_length(fe)?
            + if include_leader { PAGE_DATA_SIZE } else { 0 };
        let mut data = vec![0u8; length];
        let n = self.read(&mut of, &mut data)?;
        data.truncate(n);
        Ok(data)
    }

    /// Decodes the leader page of `fe`.
    pub fn file_info(&self, fe: &FileEntry) -> Result<FileInfo, FsError> {
        let data = &self.page(fe.leader_vda)?.data;
        let name_length = usize::from(data[2 * LD_NAME_BYTE]);
        let name_bytes = &data[2 * LD_NAME_BYTE + 1..][..name_length.min(NAME_LENGTH - 1)];
        Ok(FileInfo {
            name: name_bytes.iter().map(|&b| char::from(b)).collect(),
            created: data_dword(data, LD_CREATED),
            written: data_dword(data, LD_WRITTEN),
            read: data_dword(data, LD_READ),
            consecutive: data[2 * LD_CONSECUTIVE_BYTE],
            change_sn: data[2 * LD_CHANGE_SN_BYTE],
            fe: FileEntry {
                sn: crate::page::SerialNumber {
                    word1: data_word(data, LD_FE_HINT),
                    word2: data_word(data, LD_FE_HINT + 1),
                },
                version: data_word(data, LD_FE_HINT + 2),
                blank: data_word(data, LD_FE_HINT + 3),
                leader_vda: data_word(data, LD_FE_HINT + 4),
            },
            last_page: FilePosition {
                vda: data_word(data, LD_LAST_PAGE_HINT),
                pgnum: data_word(data, LD_LAST_PAGE_HINT + 1),
                pos: data_word(data, LD_LAST_PAGE_HINT + 2),
            },
        })
    }

    /// Encodes `info` onto the leader page of `fe`.
    pub fn set_file_info(&mut self, fe: &FileEntry, info: &FileInfo) -> Result<(), FsError> {
        if info.name.is_empty() || info.name.len() >= NAME_LENGTH {
            return Err(FsError::InvalidName(info.name.clone()));
        }
        let data = &mut self.page_mut(fe.leader_vda)?.data;
        set_data_dword(data, LD_CREATED, info.created);
        set_data_dword(data, LD_WRITTEN, info.written);
        set_data_dword(data, LD_READ, info.read);
        data[2 * LD_NAME_BYTE] = info.name.len() as u8;
        let name_area = &mut data[2 * LD_NAME_BYTE + 1..][..NAME_LENGTH - 1];
        name_area.fill(0);
        name_area[..info.name.len()].copy_from_slice(info.name.as_bytes());
        data[2 * LD_CONSECUTIVE_BYTE] = info.consecutive;
        data[2 * LD_CHANGE_SN_BYTE] = info.change_sn;
        set_data_word(data, LD_FE_HINT, info.fe.sn.word1);
        set_data_word(data, LD_FE_HINT + 1, info.fe.sn.word2);
        set_data_word(data, LD_FE_HINT + 2, info.fe.version);
        set_data_word(data, LD_FE_HINT + 3, info.fe.blank);
        set_data_word(data, LD_FE_HINT + 4, info.fe.leader_vda);
        set_data_word(data, LD_LAST_PAGE_HINT, info.last_page.vda);
        set_data_word(data, LD_LAST_PAGE_HINT + 1, info.last_page.pgnum);
        set_data_word(data, LD_LAST_PAGE_HINT + 2, info.last_page.pos);
        Ok(())
    }

    /// Recomputes and stores the leader's last-page hint.
    pub fn refresh_last_page_hint(&mut self, fe: &FileEntry) -> Result<(), FsError> {
        let mut vda = fe.leader_vda;
        loop {
            let page = self.page(vda)?;
            match self.link_vda(page.label.next_rda)? {
                Some(next) => vda = next,
                None => break,
            }
        }
        let last = self.page(vda)?;
        let hint = FilePosition {
            vda,
            pgnum: last.label.file_pgnum,
            pos: last.label.nbytes,
        };
        let mut info = self.file_info(fe)?;
        info.last_page = hint;
        self.set_file_info(fe, &info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Geometry;
    use crate::page::{Label, SerialNumber, PAGE_DATA_SIZE};

    /// Builds a bare two-page file by hand: leader at some VDA plus
    /// one data page holding `content`.
    fn handmade_file(fs: &mut AltoFs, content: &[u8]) -> FileEntry {
        assert!(content.len() <= PAGE_DATA_SIZE);
        let sn = fs.alloc_sn(false);
        let leader_vda = fs.find_free_page().unwrap();
        let data_vda = fs.find_free_page().unwrap();
        let leader_rda = fs.rda_of(leader_vda).unwrap();
        let data_rda = fs.rda_of(data_vda).unwrap();

        fs.page_mut(leader_vda).unwrap().label = Label {
            next_rda: data_rda,
            prev_rda: 0,
            unused: 0,
            nbytes: PAGE_DATA_SIZE as u16,
            file_pgnum: 0,
            version: 1,
            sn,
        };
        let page = fs.page_mut(data_vda).unwrap();
        page.label = Label {
            next_rda: 0,
            prev_rda: leader_rda,
            unused: 0,
            nbytes: content.len() as u16,
            file_pgnum: 1,
            version: 1,
            sn,
        };
        page.data[..content.len()].copy_from_slice(content);
        fs.file_entry(leader_vda).unwrap()
    }

    #[test]
    fn read_crosses_page_boundaries() {
        let mut fs = AltoFs::new(Geometry::standard_diablo()).unwrap();
        let fe = handmade_file(&mut fs, b"hello, alto");
        // Extend by hand through write.
        let mut of = fs.open(&fe, false).unwrap();
        let big: Vec<u8> = (0..2000u32).map(|i| i as u8).collect();
        assert_eq!(fs.write(&mut of, &big, true).unwrap(), 2000);
        assert_eq!(fs.file_length(&fe).unwrap(), 2000);

        let mut of = fs.open(&fe, false).unwrap();
        let mut back = vec![0u8; 2000];
        assert_eq!(fs.read(&mut of, &mut back).unwrap(), 2000);
        assert_eq!(back, big);

        // Reading past the end returns the remainder only.
        let mut of = fs.open(&fe, false).unwrap();
        let mut over = vec![0u8; 3000];
        assert_eq!(fs.read(&mut of, &mut over).unwrap(), 2000);
    }

    #[test]
    fn write_without_extend_stops_at_chain_end() {
        let mut fs = AltoFs::new(Geometry::standard_diablo()).unwrap();
        let fe = handmade_file(&mut fs, &[0u8; 16]);
        let mut of = fs.open(&fe, false).unwrap();
        let n = fs.write(&mut of, &vec![1u8; 1000], false).unwrap();
        assert_eq!(n, PAGE_DATA_SIZE);
        assert_eq!(fs.file_length(&fe).unwrap(), PAGE_DATA_SIZE);
    }

    #[test]
    fn trim_returns_tail_pages_to_the_free_list() {
        let mut fs = AltoFs::new(Geometry::standard_diablo()).unwrap();
        let fe = handmade_file(&mut fs, &[]);
        let mut of = fs.open(&fe, false).unwrap();
        fs.write(&mut of, &[7u8; 1500], true).unwrap();
        let free_before = fs.free_pages();

        // Re-position to byte 100 and trim.
        let mut of = fs.open(&fe, false).unwrap();
        let mut skip = [0u8; 100];
        fs.read(&mut of, &mut skip).unwrap();
        fs.trim(&of).unwrap();

        assert_eq!(fs.file_length(&fe).unwrap(), 100);
        assert_eq!(fs.free_pages(), free_before + 2);
        // The zeroed tail really is zero.
        let data = fs.read_all(&fe, false).unwrap();
        assert_eq!(data, vec![7u8; 100]);
    }

    #[test]
    fn file_info_round_trips() {
        let mut fs = AltoFs::new(Geometry::standard_diablo()).unwrap();
        let fe = handmade_file(&mut fs, b"x");
        let info = FileInfo {
            name: "quux.bcpl".to_string(),
            created: 0x1234_5678,
            written: 0x2345_6789,
            read: 0x3456_789A,
            consecutive: 1,
            change_sn: 2,
            fe,
            last_page: FilePosition {
                vda: 9,
                pgnum: 1,
                pos: 17,
            },
        };
        fs.set_file_info(&fe, &info).unwrap();
        assert_eq!(fs.file_info(&fe).unwrap(), info);
    }

    #[test]
    fn overlong_names_are_rejected() {
        let mut fs = AltoFs::new(Geometry::standard_diablo()).unwrap();
        let fe = handmade_file(&mut fs, b"");
        let mut info = fs.file_info(&fe).unwrap();
        info.name = "x".repeat(NAME_LENGTH);
        assert!(matches!(
            fs.set_file_info(&fe, &info),
            Err(FsError::InvalidName(_))
        ));
    }
}
