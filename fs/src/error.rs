//! Errors surfaced by the file system codec.
use std::error::Error;
use std::fmt::{self, Display, Formatter};
use std::io;
use std::path::PathBuf;

/// Why a file system operation failed.  Integrity findings are
/// reported separately (see [`crate::check::IntegrityError`]); these
/// are the errors that stop an operation.
#[derive(Debug)]
pub enum FsError {
    /// An I/O error against the host file system.
    Io { path: PathBuf, source: io::Error },
    /// The image file does not have the size the geometry demands.
    BadImageSize { expected: usize, actual: usize },
    /// The image descriptor block is not one we recognise.
    BadImageHeader(String),
    /// A real disk address does not name a sector of this pack.
    BadDiskAddress(u16),
    /// A virtual disk address is outside the pack.
    BadPageNumber(u16),
    /// No free page is left to honour an allocation.
    DiskFull,
    /// Path lookup failed.
    FileNotFound(String),
    /// A path component other than the last is not a directory.
    NotADirectory(String),
    /// A file name cannot be stored (too long, or empty).
    InvalidName(String),
    /// A page chain is malformed at the given page.
    BrokenChain { vda: u16, reason: &'static str },
    /// A directory's contents cannot be parsed.
    CorruptDirectory { vda: u16 },
    /// The file already exists (insert without replacement).
    AlreadyExists(String),
}

impl Display for FsError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            FsError::Io { path, source } => {
                write!(f, "{}: {}", path.display(), source)
            }
            FsError::BadImageSize { expected, actual } => {
                write!(
                    f,
                    "disk image has {actual} bytes where the geometry requires {expected}"
                )
            }
            FsError::BadImageHeader(what) => {
                write!(f, "unrecognised image descriptor: {what}")
            }
            FsError::BadDiskAddress(rda) => {
                write!(f, "real disk address {rda:06o} names no sector of this pack")
            }
            FsError::BadPageNumber(vda) => {
                write!(f, "virtual disk address {vda} is outside the pack")
            }
            FsError::DiskFull => f.write_str("no free pages left on the pack"),
            FsError::FileNotFound(name) => write!(f, "file `{name}` not found"),
            FsError::NotADirectory(name) => write!(f, "`{name}` is not a directory"),
            FsError::InvalidName(name) => write!(f, "`{name}` is not a storable file name"),
            FsError::BrokenChain { vda, reason } => {
                write!(f, "page chain broken at VDA {vda}: {reason}")
            }
            FsError::CorruptDirectory { vda } => {
                write!(f, "directory at VDA {vda} is corrupt")
            }
            FsError::AlreadyExists(name) => write!(f, "file `{name}` already exists"),
        }
    }
}

impl Error for FsError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            FsError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}
