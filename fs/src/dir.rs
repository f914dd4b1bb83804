//! Directories: packed variable-length entry records inside ordinary
//! files, name lookup, and entry maintenance.
//!
//! An entry starts with a word holding the entry type in the high
//! bits and the entry length in words in the low ten; then the five
//! file-entry words; then the length-prefixed name.  A zero first
//! word ends the directory.  Removal rewrites the type to MISSING and
//! keeps the length so the following entries stay at their offsets.
use tracing::{event, Level};

use crate::error::FsError;
use crate::file::OpenFile;
use crate::page::{data_word, set_data_word, FileEntry, SerialNumber, NAME_LENGTH};
use crate::volume::{AltoFs, SYSDIR_LEADER_VDA};

/// Directory entry types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirEntryType {
    Missing,
    Valid,
    Other(u16),
}

impl DirEntryType {
    fn from_bits(bits: u16) -> DirEntryType {
        match bits {
            0 => DirEntryType::Missing,
            1 => DirEntryType::Valid,
            other => DirEntryType::Other(other),
        }
    }

    fn bits(self) -> u16 {
        match self {
            DirEntryType::Missing => 0,
            DirEntryType::Valid => 1,
            DirEntryType::Other(other) => other,
        }
    }
}

/// One parsed directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub etype: DirEntryType,
    /// Entry length in words, name padding included.
    pub length: u16,
    pub fe: FileEntry,
    pub name: String,
}

/// Fixed words ahead of the name: type/length word plus the file
/// entry.
const ENTRY_FIXED_WORDS: usize = 6;

impl DirectoryEntry {
    /// Words needed to store an entry with the given name.
    fn words_for_name(name: &str) -> u16 {
        (ENTRY_FIXED_WORDS + (1 + name.len()).div_ceil(2)) as u16
    }

    fn parse(content: &[u8], offset: usize) -> Option<(DirectoryEntry, usize)> {
        if offset + 2 > content.len() {
            return None;
        }
        let word0 = data_word(content, offset / 2);
        if word0 == 0 {
            return None;
        }
        let length = word0 & 0x3FF;
        let etype = DirEntryType::from_bits(word0 >> 10);
        let end = offset + 2 * usize::from(length);
        if length < ENTRY_FIXED_WORDS as u16 || end > content.len() {
            return None;
        }
        let w = offset / 2;
        let fe = FileEntry {
            sn: SerialNumber {
                word1: data_word(content, w + 1),
                word2: data_word(content, w + 2),
            },
            version: data_word(content, w + 3),
            blank: data_word(content, w + 4),
            leader_vda: data_word(content, w + 5),
        };
        let name_length = usize::from(content[offset + 2 * ENTRY_FIXED_WORDS]);
        let name_bytes = content
            .get(offset + 2 * ENTRY_FIXED_WORDS + 1..)
            .map(|rest| &rest[..name_length.min(rest.len())])?;
        let entry = DirectoryEntry {
            etype,
            length,
            fe,
            name: name_bytes.iter().map(|&b| char::from(b)).collect(),
        };
        Some((entry, end))
    }

    fn encode_into(&self, content: &mut [u8], offset: usize) {
        let w = offset / 2;
        set_data_word(content, w, (self.etype.bits() << 10) | self.length);
        set_data_word(content, w + 1, self.fe.sn.word1);
        set_data_word(content, w + 2, self.fe.sn.word2);
        set_data_word(content, w + 3, self.fe.version);
        set_data_word(content, w + 4, self.fe.blank);
        set_data_word(content, w + 5, self.fe.leader_vda);
        let name_area =
            &mut content[offset + 2 * ENTRY_FIXED_WORDS..offset + 2 * usize::from(self.length)];
        name_area.fill(0);
        name_area[0] = self.name.len() as u8;
        name_area[1..1 + self.name.len()].copy_from_slice(self.name.as_bytes());
    }
}

/// Alto file names compare case-insensitively.
pub(crate) fn names_equal(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

impl AltoFs {
    /// Calls `f` for each entry of the directory `fe`, including
    /// MISSING placeholders, stopping early when `f` returns false.
    pub fn scan_directory<F>(&self, fe: &FileEntry, mut f: F) -> Result<(), FsError>
    where
        F: FnMut(&DirectoryEntry) -> bool,
    {
        let content = self.read_all(fe, false)?;
        let mut offset = 0;
        while let Some((entry, end)) = DirectoryEntry::parse(&content, offset) {
            if !f(&entry) {
                break;
            }
            offset = end;
        }
        Ok(())
    }

    /// Looks up one name (no slashes) in the directory `dir`.
    pub fn lookup(&self, dir: &FileEntry, name: &str) -> Result<FileEntry, FsError> {
        let mut found = None;
        self.scan_directory(dir, |entry| {
            if entry.etype == DirEntryType::Valid && names_equal(&entry.name, name) {
                found = Some(entry.fe);
                false
            } else {
                true
            }
        })?;
        found.ok_or_else(|| FsError::FileNotFound(name.to_string()))
    }

    /// Resolves a `/`-separated path from the root directory.
    pub fn find_file(&self, path: &str) -> Result<FileEntry, FsError> {
        let mut fe = self.file_entry(SYSDIR_LEADER_VDA)?;
        for component in path.split('/').filter(|c| !c.is_empty()) {
            if !fe.sn.is_directory() {
                return Err(FsError::NotADirectory(path.to_string()));
            }
            fe = self.lookup(&fe, component)?;
        }
        Ok(fe)
    }

    /// Splits a path into its parent directory (resolved) and its
    /// final component.
    pub fn resolve_parent<'n>(&self, path: &'n str) -> Result<(FileEntry, &'n str), FsError> {
        let mut components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
        let name = components
            .pop()
            .ok_or_else(|| FsError::InvalidName(path.to_string()))?;
        let parent_path = components.join("/");
        let parent = self.find_file(&parent_path)?;
        if !parent.sn.is_directory() {
            return Err(FsError::NotADirectory(parent_path));
        }
        Ok((parent, name))
    }

    /// Registers `fe` under `name` in directory `dir`, reusing a
    /// MISSING slot when one is long enough.
    pub fn add_directory_entry(
        &mut self,
        dir: &FileEntry,
        fe: &FileEntry,
        name: &str,
    ) -> Result<(), FsError> {
        if name.is_empty() || name.len() >= NAME_LENGTH {
            return Err(FsError::InvalidName(name.to_string()));
        }
        let needed = DirectoryEntry::words_for_name(name);
        let mut content = self.read_all(dir, false)?;

        // First fit among the MISSING slots.
        let mut offset = 0;
        let mut slot: Option<(usize, u16)> = None;
        while let Some((entry, end)) = DirectoryEntry::parse(&content, offset) {
            if entry.etype == DirEntryType::Missing && entry.length >= needed && slot.is_none() {
                slot = Some((offset, entry.length));
            }
            offset = end;
        }

        let entry = |length| DirectoryEntry {
            etype: DirEntryType::Valid,
            length,
            fe: *fe,
            name: name.to_string(),
        };
        match slot {
            Some((at, length)) => {
                entry(length).encode_into(&mut content, at);
            }
            None => {
                let at = offset;
                content.resize(at + 2 * usize::from(needed), 0);
                entry(needed).encode_into(&mut content, at);
            }
        }
        self.write_directory(dir, &content)
    }

    /// Marks the entry for `name` MISSING.  The entry keeps its
    /// length so later entries stay where they are.
    pub fn remove_directory_entry(
        &mut self,
        dir: &FileEntry,
        name: &str,
    ) -> Result<FileEntry, FsError> {
        let mut content = self.read_all(dir, false)?;
        let mut offset = 0;
        while let Some((entry, end)) = DirectoryEntry::parse(&content, offset) {
            if entry.etype == DirEntryType::Valid && names_equal(&entry.name, name) {
                let mut dead = entry.clone();
                dead.etype = DirEntryType::Missing;
                dead.encode_into(&mut content, offset);
                self.write_directory(dir, &content)?;
                event!(Level::DEBUG, "removed `{name}` from directory");
                return Ok(entry.fe);
            }
            offset = end;
        }
        Err(FsError::FileNotFound(name.to_string()))
    }

    fn write_directory(&mut self, dir: &FileEntry, content: &[u8]) -> Result<(), FsError> {
        let mut of: OpenFile = self.open(dir, false)?;
        self.write(&mut of, content, true)?;
        self.trim(&of)?;
        self.refresh_last_page_hint(dir)
    }

    /// Creates an empty file (or directory) and registers it in
    /// `parent`.  Returns the new file's entry.
    pub fn create_file(
        &mut self,
        parent: &FileEntry,
        name: &str,
        directory: bool,
        timestamp: u32,
    ) -> Result<FileEntry, FsError> {
        if name.is_empty() || name.len() >= NAME_LENGTH {
            return Err(FsError::InvalidName(name.to_string()));
        }
        if self.lookup(parent, name).is_ok() {
            return Err(FsError::AlreadyExists(name.to_string()));
        }

        let leader_vda = self.find_free_page()?;
        let sn = self.alloc_sn(directory);
        let page = self.page_mut(leader_vda)?;
        page.label.version = 1;
        page.label.sn = sn;
        page.label.file_pgnum = 0;
        page.label.nbytes = crate::page::PAGE_DATA_SIZE as u16;
        page.label.next_rda = 0;
        page.label.prev_rda = 0;
        page.data.fill(0);

        let fe = self.file_entry(leader_vda)?;
        let info = crate::file::FileInfo {
            name: name.to_string(),
            created: timestamp,
            written: timestamp,
            read: timestamp,
            consecutive: 0,
            change_sn: 0,
            fe,
            last_page: crate::page::FilePosition {
                vda: leader_vda,
                pgnum: 0,
                pos: crate::page::PAGE_DATA_SIZE as u16,
            },
        };
        self.set_file_info(&fe, &info)?;
        self.add_directory_entry(parent, &fe, name)?;
        Ok(fe)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Geometry;
    use crate::image::ImageFormat;

    fn formatted() -> AltoFs {
        let mut fs = AltoFs::new(Geometry::standard_diablo()).unwrap();
        fs.format(1000).unwrap();
        fs
    }

    #[test]
    fn create_then_lookup_is_case_insensitive() {
        let mut fs = formatted();
        let root = fs.file_entry(SYSDIR_LEADER_VDA).unwrap();
        let fe = fs.create_file(&root, "Hello.Bcpl", false, 0).unwrap();
        assert_eq!(fs.find_file("hello.bcpl").unwrap(), fe);
        assert_eq!(fs.find_file("HELLO.BCPL").unwrap(), fe);
        assert!(matches!(
            fs.find_file("absent"),
            Err(FsError::FileNotFound(_))
        ));
    }

    #[test]
    fn nested_paths_resolve_through_directories() {
        let mut fs = formatted();
        let root = fs.file_entry(SYSDIR_LEADER_VDA).unwrap();
        let sub = fs.create_file(&root, "Sub", true, 0).unwrap();
        let fe = fs.create_file(&sub, "inner.txt", false, 0).unwrap();
        assert_eq!(fs.find_file("sub/inner.txt").unwrap(), fe);
        // A plain file cannot be descended into.
        fs.create_file(&root, "plain", false, 0).unwrap();
        assert!(matches!(
            fs.find_file("plain/inner"),
            Err(FsError::NotADirectory(_))
        ));
    }

    #[test]
    fn removal_keeps_following_entries_at_their_offsets() {
        let mut fs = formatted();
        let root = fs.file_entry(SYSDIR_LEADER_VDA).unwrap();
        fs.create_file(&root, "first", false, 0).unwrap();
        let second = fs.create_file(&root, "second-longer-name", false, 0).unwrap();

        let offsets_of = |fs: &AltoFs| {
            let mut names = Vec::new();
            fs.scan_directory(&root, |entry| {
                names.push((entry.name.clone(), entry.etype, entry.length));
                true
            })
            .unwrap();
            names
        };
        let before = offsets_of(&fs);
        fs.remove_directory_entry(&root, "first").unwrap();
        let after = offsets_of(&fs);

        assert_eq!(before.len(), after.len());
        // Same lengths everywhere; only the type of the removed entry
        // changed.
        for (b, a) in before.iter().zip(after.iter()) {
            assert_eq!(b.2, a.2);
        }
        assert_eq!(
            after.iter().find(|e| e.0 == "first").unwrap().1,
            DirEntryType::Missing
        );
        assert_eq!(fs.find_file("second-longer-name").unwrap(), second);
    }

    #[test]
    fn missing_slots_are_reused() {
        let mut fs = formatted();
        let root = fs.file_entry(SYSDIR_LEADER_VDA).unwrap();
        fs.create_file(&root, "victim", false, 0).unwrap();
        fs.create_file(&root, "keeper", false, 0).unwrap();
        let len_before = fs.file_length(&root).unwrap();

        fs.remove_directory_entry(&root, "victim").unwrap();
        fs.create_file(&root, "newbie", false, 0).unwrap();

        // The new entry took the MISSING slot; the directory did not
        // grow.
        assert_eq!(fs.file_length(&root).unwrap(), len_before);
        assert!(fs.find_file("newbie").is_ok());
    }

    #[test]
    fn directory_survives_an_image_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dir.dsk");
        let mut fs = formatted();
        let root = fs.file_entry(SYSDIR_LEADER_VDA).unwrap();
        fs.create_file(&root, "persist.me", false, 42).unwrap();
        fs.save_image(&path, ImageFormat::Raw).unwrap();

        let mut loaded = AltoFs::new(Geometry::standard_diablo()).unwrap();
        loaded.load_image(&path, ImageFormat::Raw).unwrap();
        let fe = loaded.find_file("persist.me").unwrap();
        assert_eq!(loaded.file_info(&fe).unwrap().created, 42);
    }
}
