//! Scavenging: rebuilding the file system from the labels alone,
//! trusting nothing the directory tree says.
//!
//! Allocated pages are grouped by serial number; within each group
//! the lowest-VDA page claiming page number zero becomes the leader,
//! the rest are ordered by page number and relinked.  Groups with no
//! leader go back to the free list.  Finally every leader that the
//! (possibly repaired) directory tree does not reach is registered in
//! SysDir under the name its leader page remembers.
use std::collections::BTreeMap;

use tracing::{event, Level};

use crate::dir::DirEntryType;
use crate::error::FsError;
use crate::page::FileEntry;
use crate::volume::{AltoFs, SYSDIR_LEADER_VDA};

impl AltoFs {
    /// Rebuilds chains, the bitmap and the directory tree from the
    /// labels.  On a clean image this is a no-op.
    pub fn scavenge(&mut self) -> Result<(), FsError> {
        let groups = self.collect_groups();
        let mut leaders: Vec<u16> = Vec::new();

        for (sn, mut vdas) in groups {
            vdas.sort_by_key(|&vda| {
                let label = &self.pages[usize::from(vda)].label;
                (label.file_pgnum, vda)
            });
            if self.pages[usize::from(vdas[0])].label.file_pgnum != 0 {
                event!(
                    Level::WARN,
                    "scavenge: no leader for SN {:?}; freeing {} pages",
                    sn,
                    vdas.len()
                );
                for vda in vdas {
                    self.release_page(vda)?;
                }
                continue;
            }

            // Duplicate page numbers lose all but the lowest VDA.
            let mut chain: Vec<u16> = Vec::with_capacity(vdas.len());
            for vda in vdas {
                let pgnum = self.pages[usize::from(vda)].label.file_pgnum;
                let claimed = chain
                    .last()
                    .map(|&prev| self.pages[usize::from(prev)].label.file_pgnum);
                if claimed == Some(pgnum) {
                    event!(
                        Level::WARN,
                        "scavenge: duplicate page {pgnum} of SN {sn:?}; freeing VDA {vda}"
                    );
                    self.release_page(vda)?;
                } else {
                    chain.push(vda);
                }
            }
            self.relink(&chain)?;
            leaders.push(chain[0]);
        }

        self.rebuild_bitmap();
        self.recover_last_sn();
        self.rebuild_directories(&leaders)?;
        Ok(())
    }

    /// Allocated, non-bad pages grouped by serial number.  A BTreeMap
    /// keeps the scavenging order deterministic.
    fn collect_groups(&self) -> BTreeMap<(u16, u16), Vec<u16>> {
        let mut groups: BTreeMap<(u16, u16), Vec<u16>> = BTreeMap::new();
        for vda in 0..self.len() {
            let label = &self.pages[usize::from(vda)].label;
            if label.is_free() || label.is_bad() {
                continue;
            }
            groups
                .entry((label.sn.word1, label.sn.word2))
                .or_default()
                .push(vda);
        }
        groups
    }

    /// Rewrites the links and page numbers of one chain, in order.
    fn relink(&mut self, chain: &[u16]) -> Result<(), FsError> {
        for (i, &vda) in chain.iter().enumerate() {
            let prev_rda = if i == 0 {
                0
            } else {
                self.rda_of(chain[i - 1])?
            };
            let next_rda = if i + 1 == chain.len() {
                0
            } else {
                self.rda_of(chain[i + 1])?
            };
            let label = &mut self.page_mut(vda)?.label;
            label.prev_rda = prev_rda;
            label.next_rda = next_rda;
            label.file_pgnum = i as u16;
        }
        Ok(())
    }

    /// Leader VDAs reachable by walking the directory tree from
    /// SysDir.  Unreadable directories contribute nothing.
    fn reachable_leaders(&self) -> Vec<u16> {
        let root = match self.file_entry(SYSDIR_LEADER_VDA) {
            Ok(fe) => fe,
            Err(_) => return Vec::new(),
        };
        let mut reached = vec![SYSDIR_LEADER_VDA];
        let mut stack = vec![root];
        while let Some(dir) = stack.pop() {
            let mut children: Vec<FileEntry> = Vec::new();
            let _ = self.scan_directory(&dir, |entry| {
                if entry.etype == DirEntryType::Valid {
                    children.push(entry.fe);
                }
                true
            });
            for fe in children {
                match self.file_entry(fe.leader_vda) {
                    Ok(actual) if actual.sn == fe.sn => {
                        if !reached.contains(&fe.leader_vda) {
                            reached.push(fe.leader_vda);
                            if fe.sn.is_directory() {
                                stack.push(fe);
                            }
                        }
                    }
                    _ => (),
                }
            }
        }
        reached
    }

    /// A printable directory name for a recovered leader, taken from
    /// the leader page when it is usable.
    fn recovered_name(&self, fe: &FileEntry) -> String {
        let name = self
            .file_info(fe)
            .map(|info| info.name)
            .unwrap_or_default();
        let clean: String = name
            .chars()
            .filter(|c| c.is_ascii_graphic() && *c != '/')
            .collect();
        if clean.is_empty() {
            format!("file.{:06}", fe.sn.file_sn())
        } else {
            clean
        }
    }

    fn rebuild_directories(&mut self, leaders: &[u16]) -> Result<(), FsError> {
        // SysDir's leader label must have survived; its contents we
        // can restore.
        let sysdir = self.file_entry(SYSDIR_LEADER_VDA).map_err(|_| {
            FsError::CorruptDirectory {
                vda: SYSDIR_LEADER_VDA,
            }
        })?;

        // Restore SysDir's own metadata if the leader data was lost.
        let info = self.file_info(&sysdir)?;
        if info.name != "SysDir" {
            let mut fixed = info;
            fixed.name = "SysDir".to_string();
            fixed.fe = sysdir;
            self.set_file_info(&sysdir, &fixed)?;
            event!(Level::INFO, "scavenge: restored the SysDir leader");
        }
        if self.lookup(&sysdir, "SysDir").is_err() {
            self.add_directory_entry(&sysdir, &sysdir, "SysDir")?;
        }

        let reached = self.reachable_leaders();
        let mut recovered = 0u32;
        for &vda in leaders {
            if vda == 0 || vda == SYSDIR_LEADER_VDA || reached.contains(&vda) {
                // The boot page belongs to no directory; SysDir and
                // everything the tree already reaches stay put.
                continue;
            }
            let fe = self.file_entry(vda)?;
            let mut name = self.recovered_name(&fe);
            if self.lookup(&sysdir, &name).is_ok() {
                name = format!("{name}.{vda}");
            }
            self.add_directory_entry(&sysdir, &fe, &name)?;
            recovered += 1;
        }
        if recovered > 0 {
            event!(Level::INFO, "scavenge: re-registered {recovered} files");
        }
        Ok(())
    }
}

/// Snapshot helper used by the idempotence tests.
#[cfg(test)]
fn listing(fs: &AltoFs) -> Vec<(String, u16, crate::page::SerialNumber)> {
    let root = fs.file_entry(SYSDIR_LEADER_VDA).unwrap();
    let mut out = Vec::new();
    fs.scan_directory(&root, |entry| {
        if entry.etype == DirEntryType::Valid {
            out.push((entry.name.clone(), entry.fe.leader_vda, entry.fe.sn));
        }
        true
    })
    .unwrap();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::InsertOptions;
    use crate::geometry::Geometry;
    use crate::page::{Label, SerialNumber};

    fn populated() -> AltoFs {
        let mut fs = AltoFs::new(Geometry::standard_diablo()).unwrap();
        fs.format(5).unwrap();
        fs.insert_file("hello.bcpl", b"get \"streams.d\"", 6, InsertOptions::default())
            .unwrap();
        fs.insert_file("big.blob", &[0xA5u8; 5000], 7, InsertOptions::default())
            .unwrap();
        fs
    }

    #[test]
    fn scavenging_a_clean_image_changes_nothing() {
        let mut fs = populated();
        let labels_before: Vec<Label> =
            (0..fs.len()).map(|v| fs.page(v).unwrap().label).collect();
        let bitmap_before = fs.bitmap.clone();
        let listing_before = listing(&fs);

        fs.scavenge().unwrap();

        let labels_after: Vec<Label> =
            (0..fs.len()).map(|v| fs.page(v).unwrap().label).collect();
        assert_eq!(labels_before, labels_after);
        assert_eq!(bitmap_before, fs.bitmap);
        assert_eq!(listing_before, listing(&fs));
    }

    #[test]
    fn scavenge_recovers_files_after_sysdir_loss() {
        let mut fs = populated();
        // Destroy SysDir: zero the leader page contents and free its
        // data pages.  Every file but SysDir itself becomes
        // unreachable.
        let mut data_vda = fs
            .link_vda(fs.page(SYSDIR_LEADER_VDA).unwrap().label.next_rda)
            .unwrap();
        while let Some(v) = data_vda {
            data_vda = fs.link_vda(fs.page(v).unwrap().label.next_rda).unwrap();
            fs.release_page(v).unwrap();
        }
        {
            let page = fs.page_mut(SYSDIR_LEADER_VDA).unwrap();
            page.data.fill(0);
            page.label.next_rda = 0;
        }
        assert!(fs.find_file("hello.bcpl").is_err());

        fs.scavenge().unwrap();

        let fe = fs.find_file("hello.bcpl").unwrap();
        assert_eq!(fs.extract_file(&fe, false).unwrap(), b"get \"streams.d\"");
        assert!(fs.find_file("big.blob").is_ok());
        assert_eq!(fs.file_info(&fs.find_file("SysDir").unwrap()).unwrap().name, "SysDir");
        assert!(fs.check_integrity(4).is_empty());
    }

    #[test]
    fn scavenge_repairs_scrambled_links() {
        let mut fs = populated();
        let fe = fs.find_file("big.blob").unwrap();
        // Corrupt the forward links of the chain; the page numbers
        // and serial numbers survive.
        let mut vdas = vec![fe.leader_vda];
        let mut v = fe.leader_vda;
        while let Some(next) = fs.link_vda(fs.page(v).unwrap().label.next_rda).unwrap() {
            vdas.push(next);
            v = next;
        }
        for &vda in &vdas {
            fs.page_mut(vda).unwrap().label.next_rda = 0;
            fs.page_mut(vda).unwrap().label.prev_rda = 0;
        }

        fs.scavenge().unwrap();

        let fe = fs.find_file("big.blob").unwrap();
        assert_eq!(fs.extract_file(&fe, false).unwrap(), vec![0xA5u8; 5000]);
        assert!(fs.check_integrity(4).is_empty());
    }

    #[test]
    fn leaderless_groups_are_freed() {
        let mut fs = populated();
        let free_before = fs.free_pages();
        // Fabricate two stray pages of a file whose leader never
        // existed.
        for (i, vda) in [2000u16, 2001].into_iter().enumerate() {
            let free_vda = vda;
            let page = fs.page_mut(free_vda).unwrap();
            page.label.version = 1;
            page.label.file_pgnum = (i + 1) as u16;
            page.label.sn = SerialNumber {
                word1: 0x1F,
                word2: 0xFFF0,
            };
        }
        fs.rebuild_bitmap();

        fs.scavenge().unwrap();
        assert_eq!(fs.free_pages(), free_before);
        assert!(fs.page(2000).unwrap().label.is_free());
        assert!(fs.page(2001).unwrap().label.is_free());
    }
}
