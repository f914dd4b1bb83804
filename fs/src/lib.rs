//! The Alto file system (AltoFS) codec.
//!
//! A Diablo pack is an array of 532-byte sectors, each carrying a
//! 2-word header, an 8-word label and 512 data bytes.  The labels
//! stitch the sectors into doubly-linked per-file page chains; page 0
//! of every file is a *leader* page holding the file's metadata; the
//! directory tree is stored in ordinary files whose contents are
//! packed variable-length entry records.  This crate reconstructs
//! that structure from a raw image, checks it, repairs it from labels
//! alone (scavenging), and mutates it in place while preserving the
//! exact on-disk layout.
//!
//! Pages are held in one indexed array owned by [`AltoFs`]; links
//! between pages are virtual disk addresses (plain integers), so the
//! doubly-linked chains involve no ownership cycles.

mod archive;
mod check;
mod dir;
mod error;
mod file;
mod geometry;
mod image;
mod page;
mod scavenge;
mod volume;

pub use archive::{InsertOptions, RemoveOptions};
pub use check::IntegrityError;
pub use dir::{DirEntryType, DirectoryEntry};
pub use error::FsError;
pub use geometry::{Geometry, DIABLO_CYLINDERS, DIABLO_HEADS, DIABLO_SECTORS};
pub use image::ImageFormat;
pub use page::{
    data_word, set_data_word, FileEntry, FilePosition, Label, Page, SerialNumber, NAME_LENGTH,
    PAGE_DATA_SIZE, PAGE_ON_DISK_SIZE, VERSION_BAD, VERSION_FREE,
};
pub use file::{FileInfo, OpenFile};
pub use volume::{AltoFs, SYSDIR_LEADER_VDA};
