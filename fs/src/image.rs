//! Mapping between raw image bytes and the page array.
//!
//! A raw image is the bare sector stream: for every page, the two
//! header words, the eight label words and the 512 data bytes, words
//! little-endian.  The BFS variant prefixes a 512-byte descriptor
//! block (magic, geometry, page count) ahead of the same stream.
//! Input and output formats are selectable independently.
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use tracing::{event, Level};

use crate::error::FsError;
use crate::geometry::Geometry;
use crate::page::{Label, HEADER_WORDS, LABEL_WORDS, PAGE_ON_DISK_SIZE};
use crate::volume::AltoFs;

/// On-disk image flavour.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ImageFormat {
    #[default]
    Raw,
    Bfs,
}

const BFS_HEADER_SIZE: usize = 512;
const BFS_MAGIC: &[u8; 4] = b"BFS1";

fn io_err(path: &Path, source: std::io::Error) -> FsError {
    FsError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn get_le_word(bytes: &[u8], widx: usize) -> u16 {
    u16::from(bytes[2 * widx]) | (u16::from(bytes[2 * widx + 1]) << 8)
}

fn put_le_word(bytes: &mut [u8], widx: usize, value: u16) {
    bytes[2 * widx] = value as u8;
    bytes[2 * widx + 1] = (value >> 8) as u8;
}

impl AltoFs {
    /// Reads a disk image, replacing the current page contents.  The
    /// byte count must match the geometry exactly.
    pub fn load_image(&mut self, path: &Path, format: ImageFormat) -> Result<(), FsError> {
        let mut file = File::open(path).map_err(|e| io_err(path, e))?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes).map_err(|e| io_err(path, e))?;

        let body = match format {
            ImageFormat::Raw => bytes.as_slice(),
            ImageFormat::Bfs => {
                if bytes.len() < BFS_HEADER_SIZE || &bytes[0..4] != BFS_MAGIC {
                    return Err(FsError::BadImageHeader(
                        "missing BFS1 descriptor block".to_string(),
                    ));
                }
                let pages = get_le_word(&bytes[4..], 0);
                if usize::from(pages) != self.dg.num_pages() {
                    return Err(FsError::BadImageHeader(format!(
                        "descriptor names {pages} pages, geometry has {}",
                        self.dg.num_pages()
                    )));
                }
                &bytes[BFS_HEADER_SIZE..]
            }
        };

        let expected = self.dg.num_pages() * PAGE_ON_DISK_SIZE;
        if body.len() != expected {
            return Err(FsError::BadImageSize {
                expected,
                actual: body.len(),
            });
        }

        for vda in 0..self.len() {
            let sector = &body[usize::from(vda) * PAGE_ON_DISK_SIZE..][..PAGE_ON_DISK_SIZE];
            let page = &mut self.pages[usize::from(vda)];
            for w in 0..HEADER_WORDS {
                page.header[w] = get_le_word(sector, w);
            }
            let mut label = [0u16; LABEL_WORDS];
            for (w, slot) in label.iter_mut().enumerate() {
                *slot = get_le_word(sector, HEADER_WORDS + w);
            }
            page.label = Label::from_words(&label);
            page.data
                .copy_from_slice(&sector[2 * (HEADER_WORDS + LABEL_WORDS)..]);
        }

        self.rebuild_bitmap();
        self.recover_last_sn();
        event!(
            Level::INFO,
            "loaded image `{}`: {} pages, {} free",
            path.display(),
            self.len(),
            self.free_pages()
        );
        Ok(())
    }

    /// Writes the disk image.
    pub fn save_image(&self, path: &Path, format: ImageFormat) -> Result<(), FsError> {
        let mut bytes =
            Vec::with_capacity(BFS_HEADER_SIZE + self.dg.num_pages() * PAGE_ON_DISK_SIZE);

        if format == ImageFormat::Bfs {
            let mut header = [0u8; BFS_HEADER_SIZE];
            header[0..4].copy_from_slice(BFS_MAGIC);
            put_le_word(&mut header[4..], 0, self.len());
            put_le_word(&mut header[4..], 1, self.dg.num_disks);
            put_le_word(&mut header[4..], 2, self.dg.num_cylinders);
            put_le_word(&mut header[4..], 3, self.dg.num_heads);
            put_le_word(&mut header[4..], 4, self.dg.num_sectors);
            bytes.extend_from_slice(&header);
        }

        for page in &self.pages {
            let mut sector = [0u8; PAGE_ON_DISK_SIZE];
            for w in 0..HEADER_WORDS {
                put_le_word(&mut sector, w, page.header[w]);
            }
            for (w, value) in page.label.to_words().iter().enumerate() {
                put_le_word(&mut sector, HEADER_WORDS + w, *value);
            }
            sector[2 * (HEADER_WORDS + LABEL_WORDS)..].copy_from_slice(&page.data);
            bytes.extend_from_slice(&sector);
        }

        let mut file = File::create(path).map_err(|e| io_err(path, e))?;
        file.write_all(&bytes).map_err(|e| io_err(path, e))?;
        event!(Level::INFO, "wrote image `{}`", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::{SerialNumber, PAGE_DATA_SIZE};

    #[test]
    fn sector_size_is_532() {
        assert_eq!(PAGE_ON_DISK_SIZE, 532);
    }

    fn scratch_fs() -> AltoFs {
        let mut fs = AltoFs::new(Geometry::standard_diablo()).unwrap();
        let vda = fs.find_free_page().unwrap();
        let page = fs.page_mut(vda).unwrap();
        page.label.version = 1;
        page.label.nbytes = PAGE_DATA_SIZE as u16;
        page.label.sn = SerialNumber {
            word1: 5,
            word2: 0x1234,
        };
        page.data[0] = 0xAB;
        page.data[511] = 0xCD;
        fs
    }

    #[test]
    fn raw_image_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scratch.dsk");
        let fs = scratch_fs();
        fs.save_image(&path, ImageFormat::Raw).unwrap();

        assert_eq!(
            std::fs::metadata(&path).unwrap().len(),
            (4872 * PAGE_ON_DISK_SIZE) as u64
        );

        let mut loaded = AltoFs::new(Geometry::standard_diablo()).unwrap();
        loaded.load_image(&path, ImageFormat::Raw).unwrap();
        assert_eq!(loaded.free_pages(), 4871);
        let page = loaded.page(0).unwrap();
        assert_eq!(page.label.sn.word2, 0x1234);
        assert_eq!(page.data[0], 0xAB);
        assert_eq!(page.data[511], 0xCD);
    }

    #[test]
    fn bfs_image_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scratch.bfs");
        let fs = scratch_fs();
        fs.save_image(&path, ImageFormat::Bfs).unwrap();

        let mut loaded = AltoFs::new(Geometry::standard_diablo()).unwrap();
        // The raw reader must reject the prefixed image...
        assert!(matches!(
            loaded.load_image(&path, ImageFormat::Raw),
            Err(FsError::BadImageSize { .. })
        ));
        // ...and the BFS reader must accept it.
        loaded.load_image(&path, ImageFormat::Bfs).unwrap();
        assert_eq!(loaded.page(0).unwrap().data[0], 0xAB);
    }

    #[test]
    fn short_image_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.dsk");
        std::fs::write(&path, [0u8; 100]).unwrap();
        let mut fs = AltoFs::new(Geometry::standard_diablo()).unwrap();
        assert!(matches!(
            fs.load_image(&path, ImageFormat::Raw),
            Err(FsError::BadImageSize { .. })
        ));
    }
}
