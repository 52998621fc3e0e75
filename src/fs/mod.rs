//! File-system related code.
//!
//! Contains the implementation of the Amiga Smart File System engine, as well
//! as the small set of filesystem-independent types it surfaces: volume
//! statistics, directory entries and the opaque readdir cursor.
//!
//! [`asfs::Asfs`] is the entry point. It wraps a mounted volume behind the
//! per-volume lock and exposes the block-oriented API the VFS binding layer
//! builds on.

use alloc::vec::Vec;

use crate::errors::FsError;
use crate::fs::asfs::DiskDate;

pub mod asfs;

pub type IOResult<T> = Result<T, FsError>;

/// Volume statistics, as reported by `statfs`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StatFs {
    pub total_blocks: u32,
    pub free_blocks: u32,
    pub block_size: u32,
    pub max_name_len: u32,
}

/// What an object record describes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ObjectType {
    File,
    Directory,
    SoftLink,
}

/// A single entry produced by `readdir`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DirEntry {
    pub name: Vec<u8>,
    pub node: u32,
    pub kind: ObjectType,
}

/// Opaque cursor for `readdir`.
///
/// The cursor survives directory mutation between calls: when the remembered
/// container is gone the scan restarts from the head of the directory chain
/// and skips entries up to and including the last emitted node number.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DirCursor {
    /// Nothing emitted yet; "." comes next.
    Start,

    /// "." emitted; ".." comes next.
    Parent,

    /// Scanning the container chain. `last_node` is the node number of the
    /// last entry handed out from the container at `container`.
    Within { container: u32, last_node: u32 },

    /// The scan is complete.
    End,
}

/// A parsed object record, the inode-equivalent handed to the VFS layer.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ObjectInfo {
    pub node: u32,
    /// Node number of the directory holding this object (0 for the root).
    pub parent: u32,
    pub name: Vec<u8>,
    pub comment: Vec<u8>,
    pub kind: ObjectType,
    pub hidden: bool,
    pub protection: u32,
    /// Presentation mode composed from the mount-time triple: directories
    /// gain an execute bit for each set read bit, soft links read as 0o777.
    pub mode: u16,
    pub owner_uid: u16,
    pub owner_gid: u16,
    pub date_modified: DiskDate,
    /// Byte size; meaningful for files only.
    pub size: u32,
    /// Files: key of the first extent (0 when no data). Soft links: the
    /// soft-link block.
    pub first_extent: u32,
    /// Directories: hash table block (0 when none).
    pub hashtable: u32,
    /// Directories: newest container of the entry chain (0 when empty).
    pub first_dir_block: u32,
}
