//! Integrity checking.  Four cumulative levels; findings name the
//! offending page and never mutate the image, so the caller can
//! decide whether to continue or to scavenge.
use std::fmt::{self, Display, Formatter};

use tracing::{event, Level};

use crate::dir::DirEntryType;
use crate::page::FileEntry;
use crate::volume::{AltoFs, SYSDIR_LEADER_VDA};

/// One integrity finding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrityError {
    /// Walking `prev_rda` from this page does not reach a leader.
    OrphanPage { vda: u16 },
    /// A forward chain is malformed at this page.
    BrokenChain { vda: u16, reason: &'static str },
    /// The bitmap bit contradicts the label.
    BitmapMismatch { vda: u16 },
    /// A directory entry names a leader that does not match.
    DanglingEntry { name: String, vda: u16 },
}

impl Display for IntegrityError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            IntegrityError::OrphanPage { vda } => {
                write!(f, "VDA {vda}: no leader page reachable through prev links")
            }
            IntegrityError::BrokenChain { vda, reason } => {
                write!(f, "VDA {vda}: {reason}")
            }
            IntegrityError::BitmapMismatch { vda } => {
                write!(f, "VDA {vda}: bitmap disagrees with the label")
            }
            IntegrityError::DanglingEntry { name, vda } => {
                write!(f, "directory entry `{name}`: leader VDA {vda} does not match")
            }
        }
    }
}

impl AltoFs {
    /// Checks the file system up to `level` (1 to 4; higher levels
    /// include the lower ones).  An empty result means the image is
    /// clean at that level.
    pub fn check_integrity(&self, level: u8) -> Vec<IntegrityError> {
        let mut findings = Vec::new();
        if level >= 1 {
            self.check_backward_chains(&mut findings);
        }
        if level >= 2 {
            self.check_forward_chains(&mut findings);
        }
        if level >= 3 {
            self.check_bitmap(&mut findings);
        }
        if level >= 4 {
            self.check_directories(&mut findings);
        }
        for finding in &findings {
            event!(Level::WARN, "integrity: {finding}");
        }
        findings
    }

    fn check_backward_chains(&self, findings: &mut Vec<IntegrityError>) {
        for vda in 0..self.len() {
            let label = self.page(vda).expect("vda in range").label;
            if label.is_free() || label.is_bad() {
                continue;
            }
            // Walk towards the leader; the page number must count
            // down to zero, which also bounds the walk.
            let mut at = vda;
            let mut pgnum = label.file_pgnum;
            let orphan = loop {
                let l = match self.page(at) {
                    Ok(p) => p.label,
                    Err(_) => break true,
                };
                if l.file_pgnum != pgnum {
                    break true;
                }
                if pgnum == 0 {
                    break l.prev_rda != 0;
                }
                match self.link_vda(l.prev_rda) {
                    Ok(Some(prev)) => {
                        at = prev;
                        pgnum -= 1;
                    }
                    _ => break true,
                }
            };
            if orphan {
                findings.push(IntegrityError::OrphanPage { vda });
            }
        }
    }

    fn check_forward_chains(&self, findings: &mut Vec<IntegrityError>) {
        for vda in 0..self.len() {
            let label = self.page(vda).expect("vda in range").label;
            if label.is_free() || label.is_bad() || label.file_pgnum != 0 {
                continue;
            }
            let sn = label.sn;
            let mut at = vda;
            let mut expected = 0u16;
            let mut steps = 0u32;
            loop {
                let l = match self.page(at) {
                    Ok(p) => p.label,
                    Err(_) => {
                        findings.push(IntegrityError::BrokenChain {
                            vda: at,
                            reason: "link outside the pack",
                        });
                        break;
                    }
                };
                if l.is_free() {
                    findings.push(IntegrityError::BrokenChain {
                        vda: at,
                        reason: "chain runs through a free page",
                    });
                    break;
                }
                if l.sn != sn {
                    findings.push(IntegrityError::BrokenChain {
                        vda: at,
                        reason: "chain crosses into another file",
                    });
                    break;
                }
                if l.file_pgnum != expected {
                    findings.push(IntegrityError::BrokenChain {
                        vda: at,
                        reason: "page numbers not sequential",
                    });
                    break;
                }
                steps += 1;
                if steps > u32::from(self.len()) {
                    findings.push(IntegrityError::BrokenChain {
                        vda: at,
                        reason: "chain does not terminate",
                    });
                    break;
                }
                match self.link_vda(l.next_rda) {
                    Ok(Some(next)) => {
                        at = next;
                        expected += 1;
                    }
                    Ok(None) => break,
                    Err(_) => {
                        findings.push(IntegrityError::BrokenChain {
                            vda: at,
                            reason: "next link is not a valid disk address",
                        });
                        break;
                    }
                }
            }
        }
    }

    fn check_bitmap(&self, findings: &mut Vec<IntegrityError>) {
        for vda in 0..self.len() {
            let allocated = !self.page(vda).expect("vda in range").label.is_free();
            if self.bit(vda) != allocated {
                findings.push(IntegrityError::BitmapMismatch { vda });
            }
        }
    }

    fn check_directories(&self, findings: &mut Vec<IntegrityError>) {
        let root = match self.file_entry(SYSDIR_LEADER_VDA) {
            Ok(fe) => fe,
            Err(_) => {
                findings.push(IntegrityError::DanglingEntry {
                    name: "SysDir".to_string(),
                    vda: SYSDIR_LEADER_VDA,
                });
                return;
            }
        };
        let mut stack = vec![root];
        let mut seen = vec![root.leader_vda];
        while let Some(dir) = stack.pop() {
            let mut entries: Vec<(String, FileEntry)> = Vec::new();
            let scan = self.scan_directory(&dir, |entry| {
                if entry.etype == DirEntryType::Valid {
                    entries.push((entry.name.clone(), entry.fe));
                }
                true
            });
            if scan.is_err() {
                findings.push(IntegrityError::BrokenChain {
                    vda: dir.leader_vda,
                    reason: "directory contents unreadable",
                });
                continue;
            }
            for (name, fe) in entries {
                match self.file_entry(fe.leader_vda) {
                    Ok(actual) if actual.sn == fe.sn => {
                        if fe.sn.is_directory() && !seen.contains(&fe.leader_vda) {
                            seen.push(fe.leader_vda);
                            stack.push(fe);
                        }
                    }
                    _ => findings.push(IntegrityError::DanglingEntry {
                        name,
                        vda: fe.leader_vda,
                    }),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::InsertOptions;
    use crate::geometry::Geometry;
    use crate::page::VERSION_FREE;

    fn populated() -> AltoFs {
        let mut fs = AltoFs::new(Geometry::standard_diablo()).unwrap();
        fs.format(10).unwrap();
        fs.insert_file("one.txt", &[1u8; 900], 11, InsertOptions::default())
            .unwrap();
        fs.insert_file("two.txt", &[2u8; 40], 12, InsertOptions::default())
            .unwrap();
        fs
    }

    #[test]
    fn clean_image_reports_nothing() {
        assert!(populated().check_integrity(4).is_empty());
    }

    #[test]
    fn severed_back_link_is_an_orphan() {
        let mut fs = populated();
        let fe = fs.find_file("one.txt").unwrap();
        let data_vda = fs
            .link_vda(fs.page(fe.leader_vda).unwrap().label.next_rda)
            .unwrap()
            .unwrap();
        fs.page_mut(data_vda).unwrap().label.prev_rda = 0;
        let findings = fs.check_integrity(1);
        assert!(findings
            .iter()
            .any(|f| matches!(f, IntegrityError::OrphanPage { vda } if *vda == data_vda)));
    }

    #[test]
    fn freed_mid_chain_page_breaks_the_forward_walk() {
        let mut fs = populated();
        let fe = fs.find_file("one.txt").unwrap();
        let data_vda = fs
            .link_vda(fs.page(fe.leader_vda).unwrap().label.next_rda)
            .unwrap()
            .unwrap();
        fs.page_mut(data_vda).unwrap().label.version = VERSION_FREE;
        let findings = fs.check_integrity(2);
        assert!(findings
            .iter()
            .any(|f| matches!(f, IntegrityError::BrokenChain { .. })));
    }

    #[test]
    fn stale_bitmap_bit_is_detected() {
        let mut fs = populated();
        // Flip a bit behind the allocator's back.
        let vda = 100;
        assert!(fs.page(vda).unwrap().label.is_free());
        let word = usize::from(vda) / 16;
        fs.bitmap[word] |= 1 << (15 - vda % 16);
        let findings = fs.check_integrity(3);
        assert!(findings
            .iter()
            .any(|f| matches!(f, IntegrityError::BitmapMismatch { vda: v } if *v == vda)));
    }

    #[test]
    fn entry_to_a_freed_leader_dangles() {
        let mut fs = populated();
        let fe = fs.find_file("two.txt").unwrap();
        // Free the file's pages but leave the directory entry behind.
        let mut vda = Some(fe.leader_vda);
        while let Some(v) = vda {
            vda = fs.link_vda(fs.page(v).unwrap().label.next_rda).unwrap();
            fs.release_page(v).unwrap();
        }
        let findings = fs.check_integrity(4);
        assert!(findings
            .iter()
            .any(|f| matches!(f, IntegrityError::DanglingEntry { name, .. } if name == "two.txt")));
    }
}
